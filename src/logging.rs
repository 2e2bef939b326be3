//! Crate-internal logging macros.
//!
//! With the `tracing` feature enabled every macro forwards to the matching `tracing` macro under
//! the `chainsub` target. Without it the arguments are evaluated by reference and discarded, so
//! call sites compile identically in both configurations.
//!
//! Reorganizations get their own macro and target (`chainsub::reorg`) so they can be filtered
//! and routed separately from ordinary warnings.

#[cfg(feature = "tracing")]
#[allow(unused_macros)]
macro_rules! __log {
    ($level:ident, $($arg:tt)*) => {
        tracing::$level!(target: "chainsub", $($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
#[allow(unused_macros)]
macro_rules! __log {
    ($level:ident, $($arg:tt)*) => {
        $crate::__trace_consume!($($arg)*)
    };
}

#[allow(unused_macros)]
macro_rules! error {
    ($($arg:tt)*) => { __log!(error, $($arg)*) };
}

#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => { __log!(warn, $($arg)*) };
}

#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => { __log!(info, $($arg)*) };
}

#[allow(unused_macros)]
macro_rules! debug {
    ($($arg:tt)*) => { __log!(debug, $($arg)*) };
}

#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => { __log!(trace, $($arg)*) };
}

#[cfg(feature = "tracing")]
#[allow(unused_macros)]
macro_rules! reorg {
    ($($arg:tt)*) => {
        tracing::warn!(target: "chainsub::reorg", $($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
#[allow(unused_macros)]
macro_rules! reorg {
    ($($arg:tt)*) => {
        $crate::__trace_consume!($($arg)*)
    };
}

#[doc(hidden)]
#[macro_export]
#[cfg(not(feature = "tracing"))]
macro_rules! __trace_consume {
    ($field:ident = % $value:expr, $($rest:tt)*) => {
        { let _ = &$value; $crate::__trace_consume!($($rest)*); }
    };
    ($field:ident = ? $value:expr, $($rest:tt)*) => {
        { let _ = &$value; $crate::__trace_consume!($($rest)*); }
    };
    ($field:ident = $value:expr, $($rest:tt)*) => {
        { let _ = &$value; $crate::__trace_consume!($($rest)*); }
    };
    ($lit:literal $($rest:tt)*) => {
        $crate::__trace_consume!($($rest)*)
    };
    (, $($rest:tt)*) => {
        $crate::__trace_consume!($($rest)*)
    };
    ($value:expr $(, $($rest:tt)*)?) => {
        { let _ = &$value; $($crate::__trace_consume!($($rest)*);)? }
    };
    () => {};
}
