use std::time::Duration;

use crate::{
    ListenerMessage, Notification,
    log_entry::LogEntry,
    log_poller::{PollerResult, PollerStream},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[macro_export]
macro_rules! assert_next {
    // errors compare by variant
    ($stream: expr, Err($expected_err:expr)) => {
        $crate::assert_next!($stream, Err($expected_err), timeout = 5)
    };
    ($stream: expr, Err($expected_err:expr), timeout = $secs: expr) => {
        let message = tokio::time::timeout(
            std::time::Duration::from_secs($secs),
            tokio_stream::StreamExt::next(&mut $stream),
        )
        .await
        .expect("timed out");
        if let Some(msg) = message {
            let expected = &$expected_err;
            assert_eq!(&msg, expected, "Expected error {:?}, got {:?}", expected, msg);
        } else {
            panic!("Expected error {:?}, but channel was closed", $expected_err);
        }
    };

    ($stream: expr, $expected: expr) => {
        $crate::assert_next!($stream, $expected, timeout = 5)
    };
    ($stream: expr, $expected: expr, timeout = $secs: expr) => {
        let message = tokio::time::timeout(
            std::time::Duration::from_secs($secs),
            tokio_stream::StreamExt::next(&mut $stream),
        )
        .await
        .expect("timed out");
        let expected = $expected;
        match message {
            std::option::Option::Some(std::result::Result::Ok(msg)) => {
                assert_eq!(msg, expected, "Expected {:?}, got {:?}", expected, msg);
            }
            std::option::Option::Some(std::result::Result::Err(e)) => {
                panic!("Expected Ok({:?}), got Err({:?})", expected, e);
            }
            std::option::Option::None => {
                panic!("Expected Ok({:?}), but channel was closed", expected);
            }
        }
    };
}

#[macro_export]
macro_rules! assert_closed {
    ($stream: expr) => {
        $crate::assert_closed!($stream, timeout = 5)
    };
    ($stream: expr, timeout = $secs: expr) => {
        let message = tokio::time::timeout(
            std::time::Duration::from_secs($secs),
            tokio_stream::StreamExt::next(&mut $stream),
        )
        .await
        .expect("timed out");
        assert!(message.is_none(), "Expected closed stream, got {message:?}")
    };
}

#[macro_export]
macro_rules! assert_empty {
    ($stream: expr) => {
        assert!($stream.is_empty(), "Stream should have no pending messages, has {}", $stream.pending())
    };
}

/// Next item of `stream`.
///
/// # Panics
///
/// If nothing arrives within five seconds or the stream ends.
pub async fn next_item(stream: &mut PollerStream) -> PollerResult {
    tokio::time::timeout(DEFAULT_TIMEOUT, stream.recv())
        .await
        .expect("timed out waiting for the next item")
        .expect("stream closed")
}

/// Read `count` logs, skipping [`Notification::SwitchingToLive`].
///
/// # Panics
///
/// On a timeout, an error, a reorg notification or a closed stream.
pub async fn take_logs(stream: &mut PollerStream, count: usize) -> Vec<LogEntry> {
    let mut logs = Vec::with_capacity(count);
    while logs.len() < count {
        match next_item(stream).await {
            Ok(ListenerMessage::Data(log)) => logs.push(log),
            Ok(ListenerMessage::Notification(Notification::SwitchingToLive)) => {}
            other => panic!("Expected a log after {} of {count}, got {other:?}", logs.len()),
        }
    }
    logs
}
