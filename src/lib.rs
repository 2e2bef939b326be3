//! chainsub follows one event of one smart contract on an EVM-compatible chain.
//!
//! The pipeline has three stages:
//!
//! * a [`LogPoller`] that backfills history in bounded ranges, catches up to the head and then
//!   tails it, by subscription when the node can push logs and by polling otherwise
//! * an [`EventDecoder`] that turns raw logs into named arguments using the event's ABI
//! * an [`EventSink`] that writes one record per event
//!
//! [`Listener`] wires them together. The `chainsub listen` binary wraps it in a CLI.
//!
//! # Ordering and delivery
//!
//! Logs are delivered in ascending `(block_number, log_index)` order and at most once per
//! session. Progress is tracked by a [`Cursor`] that only moves forward, except when a chain
//! reorganization rewinds it to the common ancestor. The rewind is announced by
//! [`Notification::ReorgDetected`] listing the delivered positions it invalidated.
//!
//! # Backpressure
//!
//! The poller and the consumer are connected by a queue with high and low watermarks. A full
//! queue pauses range queries and subscription reads until the consumer drains it.
//!
//! # Failures
//!
//! Every RPC call has a timeout and is retried with jittered exponential backoff while the
//! failure is transient (see [`ListenerError::is_transient`]). When retries run out the poller
//! reconnects and resumes from its cursor. Fatal errors end the stream.
//!
//! # Persistence
//!
//! Cursors serialize with serde. Pass a saved one to [`LogPoller::start`] or
//! [`Listener::resume_from`] to continue a previous session without gaps or duplicates.

#[macro_use]
mod logging;

pub mod abi;
pub mod block_pointer;
pub mod config;
pub mod cursor;
pub mod decoder;
pub mod listener;
pub mod log_entry;
pub mod log_poller;
pub mod robust_provider;
pub mod sink;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

mod error;
mod types;

pub use abi::{EventInput, EventSchema, load_abi, parse_abi, resolve_event};
pub use block_pointer::BlockPointer;
pub use cursor::Cursor;
pub use decoder::{DecodeError, DecodedEvent, EventDecoder, LogRef};
pub use error::ListenerError;
pub use listener::Listener;
pub use log_entry::{BlockRef, LogEntry, LogFilter, LogPosition};
pub use log_poller::{
    LiveMode, LogPoller, LogPollerBuilder, PollerHandle, PollerResult, PollerState, PollerStream,
    RingBufferCapacity,
};
pub use robust_provider::{LogSource, LogStream, RobustProvider, RobustProviderBuilder};
pub use sink::{EventSink, OutputFormat, WriterSink};
pub use types::{IntoListenerResult, ListenerMessage, ListenerResult, Notification, ReorgReport};
