use std::fmt;

use alloy::primitives::B256;
use serde::{Deserialize, Serialize};

use crate::log_entry::{BlockRef, LogEntry, LogPosition};

/// Marks how far delivery has progressed.
///
/// `log_index` is the last delivered log of `block_number`, or `None` once the whole block has
/// been scanned. `block_hash` identifies the block the cursor was taken on so a resumed session
/// can tell whether it was orphaned in the meantime.
///
/// Cursors serialize to JSON so callers can persist them and pass them back to
/// [`LogPoller::start`](crate::LogPoller::start).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub block_number: u64,
    pub log_index: Option<u64>,
    pub block_hash: B256,
}

impl Cursor {
    /// Cursor placed right after `log`.
    #[must_use]
    pub fn after_log(log: &LogEntry) -> Self {
        Self {
            block_number: log.block_number,
            log_index: Some(log.log_index),
            block_hash: log.block_hash,
        }
    }

    /// Cursor placed after every log of `block`.
    #[must_use]
    pub fn end_of(block: &BlockRef) -> Self {
        Self { block_number: block.number, log_index: None, block_hash: block.hash }
    }

    /// Whether a log at `position` has not been delivered yet.
    #[must_use]
    pub fn accepts(&self, position: LogPosition) -> bool {
        match position.block_number.cmp(&self.block_number) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                self.log_index.is_some_and(|delivered| position.log_index > delivered)
            }
        }
    }

    /// Ordering key where a completed block sorts after any of its logs.
    #[must_use]
    pub fn key(&self) -> (u64, u64) {
        (self.block_number, self.log_index.unwrap_or(u64::MAX))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.log_index {
            Some(index) => write!(f, "block {} log {index} ({})", self.block_number, self.block_hash),
            None => write!(f, "end of block {} ({})", self.block_number, self.block_hash),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(block_number: u64, log_index: u64) -> LogPosition {
        LogPosition { block_number, log_index }
    }

    #[test]
    fn partial_block_accepts_later_logs_only() {
        let cursor =
            Cursor { block_number: 10, log_index: Some(3), block_hash: B256::repeat_byte(1) };

        assert!(!cursor.accepts(at(9, 50)));
        assert!(!cursor.accepts(at(10, 2)));
        assert!(!cursor.accepts(at(10, 3)));
        assert!(cursor.accepts(at(10, 4)));
        assert!(cursor.accepts(at(11, 0)));
    }

    #[test]
    fn completed_block_rejects_all_of_its_logs() {
        let block = BlockRef {
            number: 10,
            hash: B256::repeat_byte(1),
            parent_hash: B256::repeat_byte(2),
        };
        let cursor = Cursor::end_of(&block);

        assert!(!cursor.accepts(at(10, u64::MAX)));
        assert!(cursor.accepts(at(11, 0)));
    }

    #[test]
    fn completed_block_sorts_after_its_logs() {
        let hash = B256::ZERO;
        let partial = Cursor { block_number: 7, log_index: Some(100), block_hash: hash };
        let complete = Cursor { block_number: 7, log_index: None, block_hash: hash };
        assert!(partial.key() < complete.key());
    }

    #[test]
    fn survives_json_round_trip() {
        let cursor =
            Cursor { block_number: 42, log_index: Some(1), block_hash: B256::repeat_byte(0xab) };
        let json = serde_json::to_string(&cursor).unwrap();
        assert_eq!(serde_json::from_str::<Cursor>(&json).unwrap(), cursor);
    }
}
