use std::{sync::Arc, time::Duration};

use alloy::transports::{RpcError, TransportErrorKind};
use thiserror::Error;
use tokio::time::error::Elapsed;

/// JSON-RPC codes for requests the node will never accept no matter how often they are sent.
const FATAL_RPC_CODES: [i64; 4] = [-32700, -32600, -32601, -32602];

/// HTTP statuses meaning the endpoint rejects us rather than being temporarily unavailable.
const FATAL_HTTP_STATUSES: [u16; 5] = [400, 401, 403, 404, 405];

/// JSON-RPC code several providers use for request limits.
const LIMIT_EXCEEDED: i64 = -32005;

/// Message fragments of log queries rejected for their size rather than their rate.
const QUERY_TOO_LARGE: [&str; 5] =
    ["more than", "block range", "range too large", "too many results", "response size"];

/// Errors returned by the RPC adapter.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Operation timed out")]
    Timeout,
    #[error("RPC call failed: {0}")]
    RpcError(Arc<RpcError<TransportErrorKind>>),
    #[error("Rate limited by node")]
    RateLimited {
        /// Delay the node asked for, when it sent one.
        retry_after: Option<Duration>,
    },
    #[error("Block {0} not found")]
    BlockNotFound(u64),
    #[error("Subscription closed")]
    Closed,
    #[error("Subscription lagged by {0} messages")]
    Lagged(u64),
}

impl Error {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Error::RpcError(err) => is_transient_rpc(err),
            _ => true,
        }
    }

    /// Delay requested by the node before the next attempt.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<RpcError<TransportErrorKind>> for Error {
    fn from(err: RpcError<TransportErrorKind>) -> Self {
        match rate_limit_hint(&err) {
            Some(retry_after) => Error::RateLimited { retry_after },
            None => Error::RpcError(Arc::new(err)),
        }
    }
}

impl From<Elapsed> for Error {
    fn from(_: Elapsed) -> Self {
        Error::Timeout
    }
}

/// Malformed requests, rejected credentials, oversized log queries and missing pubsub support
/// are permanent. Dropped connections, empty responses and node-side failures are not.
pub(crate) fn is_transient_rpc(err: &RpcError<TransportErrorKind>) -> bool {
    match err {
        RpcError::ErrorResp(payload) => {
            !FATAL_RPC_CODES.contains(&payload.code) && !is_query_too_large(&payload.message)
        }
        RpcError::Transport(kind) => match kind {
            TransportErrorKind::HttpError(http) => !FATAL_HTTP_STATUSES.contains(&http.status),
            TransportErrorKind::PubsubUnavailable => false,
            _ => true,
        },
        RpcError::NullResp | RpcError::DeserError { .. } => true,
        _ => false,
    }
}

/// `Some(hint)` when the error is a throttling response.
fn rate_limit_hint(err: &RpcError<TransportErrorKind>) -> Option<Option<Duration>> {
    match err {
        RpcError::ErrorResp(payload) => {
            let message = payload.message.to_ascii_lowercase();
            let throttled = payload.code == 429 ||
                (payload.code == LIMIT_EXCEEDED && !is_query_too_large(&message)) ||
                message.contains("rate limit") ||
                message.contains("too many requests");
            throttled.then(|| payload.data.as_ref().and_then(|data| retry_hint(data.get())))
        }
        RpcError::Transport(TransportErrorKind::HttpError(http)) if http.status == 429 => {
            Some(None)
        }
        _ => None,
    }
}

/// The same range will be rejected again, only a smaller one can succeed.
fn is_query_too_large(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    QUERY_TOO_LARGE.iter().any(|fragment| message.contains(fragment))
}

/// Reads `backoff_seconds`, `retry_after` or `retryAfter` (seconds) from JSON error data.
fn retry_hint(data: &str) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    ["backoff_seconds", "retry_after", "retryAfter"]
        .iter()
        .find_map(|key| value.get(key).and_then(serde_json::Value::as_f64))
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
        .map(Duration::from_secs_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::{rpc::json_rpc::ErrorPayload, transports::HttpError};
    use serde_json::value::RawValue;

    fn response(code: i64, message: &'static str, data: Option<&str>) -> RpcError<TransportErrorKind> {
        RpcError::ErrorResp(ErrorPayload {
            code,
            message: message.into(),
            data: data.map(|raw| RawValue::from_string(raw.to_owned()).unwrap()),
        })
    }

    fn http(status: u16) -> RpcError<TransportErrorKind> {
        RpcError::Transport(TransportErrorKind::HttpError(HttpError { status, body: String::new() }))
    }

    #[test]
    fn classifies_node_errors() {
        assert!(!Error::from(response(-32602, "invalid params", None)).is_transient());
        assert!(!Error::from(response(-32700, "parse error", None)).is_transient());
        assert!(Error::from(response(-32603, "internal error", None)).is_transient());
        assert!(Error::from(response(-32000, "header not found", None)).is_transient());
    }

    #[test]
    fn classifies_transport_errors() {
        assert!(Error::from(RpcError::Transport(TransportErrorKind::BackendGone)).is_transient());
        assert!(!Error::from(RpcError::Transport(TransportErrorKind::PubsubUnavailable)).is_transient());
        assert!(!Error::from(http(401)).is_transient());
        assert!(!Error::from(http(404)).is_transient());
        assert!(Error::from(http(502)).is_transient());
        assert!(Error::Timeout.is_transient());
    }

    #[test]
    fn detects_rate_limits_and_hints() {
        let err = Error::from(response(-32005, "limit exceeded", Some(r#"{"backoff_seconds":1.5}"#)));
        assert!(matches!(err, Error::RateLimited { .. }));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert!(err.is_transient());

        let err = Error::from(response(-32000, "Rate limit reached", None));
        assert!(matches!(err, Error::RateLimited { retry_after: None }));

        assert!(matches!(Error::from(http(429)), Error::RateLimited { retry_after: None }));
    }

    #[test]
    fn oversized_queries_are_not_retried() {
        let err = Error::from(response(-32005, "query returned more than 10000 results", None));
        assert!(matches!(err, Error::RpcError(_)));
        assert!(!err.is_transient());

        let err = Error::from(response(-32005, "Block range is too large", None));
        assert!(!err.is_transient());
        let err = Error::from(response(-32602, "eth_getLogs block range too large", None));
        assert!(!err.is_transient());
        let err = Error::from(response(-32000, "exceed maximum block range: 5000", None));
        assert!(!err.is_transient());

        assert!(Error::from(response(-32005, "limit exceeded", None)).is_transient());
    }

    #[test]
    fn ignores_unusable_hints() {
        assert_eq!(retry_hint(r#"{"retry_after":-3}"#), None);
        assert_eq!(retry_hint("[1,2]"), None);
        assert_eq!(retry_hint(r#"{"retryAfter":2}"#), Some(Duration::from_secs(2)));
    }
}
