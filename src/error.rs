use std::{io, mem::discriminant, sync::Arc};

use alloy::transports::{RpcError, TransportErrorKind};
use thiserror::Error;

use crate::{robust_provider::Error as RobustProviderError, types::ListenerResult};

/// Errors produced by the listener.
///
/// Startup failures (configuration, ABI resolution, block spec parsing) are returned directly by
/// the constructors. Runtime failures are yielded as the last item of a poller stream and
/// returned from [`Listener::run`](crate::Listener::run).
///
/// [`ListenerError::is_transient`] separates failures the poller recovers from by reconnecting
/// from the ones that terminate the session.
#[derive(Error, Debug, Clone)]
pub enum ListenerError {
    /// Missing or invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The starting point is neither `latest` nor a non-negative decimal block number.
    #[error("Invalid block spec {0:?}: expected \"latest\" or a non-negative block number")]
    InvalidBlockSpec(String),

    /// No event in the ABI has exactly this name.
    #[error("Event {0:?} not found in ABI")]
    EventNotFound(String),

    /// The name matches several overloads and no full signature was given.
    #[error("Event {name:?} is overloaded, use one of: {}", .candidates.join(", "))]
    AmbiguousEvent {
        /// Requested event name.
        name: String,
        /// Canonical signatures of every overload sharing the name.
        candidates: Vec<String>,
    },

    /// The ABI document or the selected event cannot be used.
    #[error("Invalid ABI: {0}")]
    InvalidAbi(String),

    /// An RPC call did not answer within the configured timeout.
    #[error("Operation timed out")]
    Timeout,

    /// The node returned an error or the transport failed.
    #[error("RPC error: {0}")]
    RpcError(Arc<RpcError<TransportErrorKind>>),

    /// The node kept throttling requests after every retry.
    #[error("Rate limited by node")]
    RateLimited,

    /// The node does not know a block it should have.
    #[error("Block {0} not found")]
    BlockNotFound(u64),

    /// The push subscription ended.
    #[error("Subscription closed")]
    SubscriptionClosed,

    /// The push subscription dropped messages because the consumer was too slow.
    #[error("Subscription lagged, {0} messages skipped")]
    Lagged(u64),

    /// Logs returned for a range disagree with the block header fetched for it.
    #[error("Chain moved while querying block {0}")]
    ChainMoved(u64),

    /// The output destination failed.
    #[error("Output sink error: {0}")]
    Sink(Arc<io::Error>),

    /// The configured maximum block range is zero.
    #[error("Max block range must be greater than 0")]
    InvalidMaxBlockRange,

    /// The queue watermarks do not describe a usable hysteresis window.
    #[error("Invalid buffer watermarks: low ({low}) must be below high ({high})")]
    InvalidWatermarks {
        /// High-water mark.
        high: usize,
        /// Low-water mark.
        low: usize,
    },

    /// The poller task panicked or was aborted.
    #[error("Poller task terminated unexpectedly")]
    ServiceShutdown,
}

impl ListenerError {
    /// Whether the poller should reconnect and resume after this error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            ListenerError::Timeout |
            ListenerError::RateLimited |
            ListenerError::BlockNotFound(_) |
            ListenerError::SubscriptionClosed |
            ListenerError::Lagged(_) |
            ListenerError::ChainMoved(_) => true,
            ListenerError::RpcError(err) => crate::robust_provider::error::is_transient_rpc(err),
            _ => false,
        }
    }
}

impl From<RobustProviderError> for ListenerError {
    fn from(error: RobustProviderError) -> ListenerError {
        match error {
            RobustProviderError::Timeout => ListenerError::Timeout,
            RobustProviderError::RpcError(err) => ListenerError::RpcError(err),
            RobustProviderError::RateLimited { .. } => ListenerError::RateLimited,
            RobustProviderError::BlockNotFound(number) => ListenerError::BlockNotFound(number),
            RobustProviderError::Closed => ListenerError::SubscriptionClosed,
            RobustProviderError::Lagged(skipped) => ListenerError::Lagged(skipped),
        }
    }
}

impl From<RpcError<TransportErrorKind>> for ListenerError {
    fn from(error: RpcError<TransportErrorKind>) -> Self {
        ListenerError::RpcError(Arc::new(error))
    }
}

impl From<io::Error> for ListenerError {
    fn from(error: io::Error) -> Self {
        ListenerError::Sink(Arc::new(error))
    }
}

impl<T> PartialEq<ListenerError> for ListenerResult<T> {
    fn eq(&self, other: &ListenerError) -> bool {
        match self {
            Ok(_) => false,
            Err(err) => discriminant(err) == discriminant(other),
        }
    }
}
