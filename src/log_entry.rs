//! Raw log records and the filter used to request them.

use std::fmt;

use alloy::{
    primitives::{Address, B256, Bytes},
    rpc::types::{Filter, Log},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Position of a log on the chain, ordered by block then by index within the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    pub block_number: u64,
    pub log_index: u64,
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_number, self.log_index)
    }
}

/// A mined log as returned by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub log_index: u64,
    /// Set by push subscriptions when the log's block was orphaned.
    pub removed: bool,
}

impl LogEntry {
    #[must_use]
    pub fn position(&self) -> LogPosition {
        LogPosition { block_number: self.block_number, log_index: self.log_index }
    }

    #[must_use]
    pub fn topic0(&self) -> Option<&B256> {
        self.topics.first()
    }
}

/// Returned when a node log lacks the fields of a mined log (pending logs do).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("log is missing its {0}")]
pub struct IncompleteLog(pub &'static str);

impl TryFrom<Log> for LogEntry {
    type Error = IncompleteLog;

    fn try_from(log: Log) -> Result<Self, Self::Error> {
        Ok(LogEntry {
            block_number: log.block_number.ok_or(IncompleteLog("block number"))?,
            block_hash: log.block_hash.ok_or(IncompleteLog("block hash"))?,
            transaction_hash: log.transaction_hash.ok_or(IncompleteLog("transaction hash"))?,
            log_index: log.log_index.ok_or(IncompleteLog("log index"))?,
            removed: log.removed,
            address: log.inner.address,
            topics: log.inner.data.topics().to_vec(),
            data: log.inner.data.data,
        })
    }
}

/// Selects the logs of one event emitted by one contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub topic0: B256,
}

impl LogFilter {
    #[must_use]
    pub fn new(address: Address, topic0: B256) -> Self {
        Self { address, topic0 }
    }

    /// Nodes are not trusted to apply the filter exactly.
    #[must_use]
    pub fn matches(&self, log: &LogEntry) -> bool {
        log.address == self.address && log.topic0() == Some(&self.topic0)
    }

    /// Node filter for a bounded range query.
    #[must_use]
    pub fn range_filter(&self, from: u64, to: u64) -> Filter {
        self.live_filter().from_block(from).to_block(to)
    }

    /// Node filter for a push subscription.
    #[must_use]
    pub fn live_filter(&self) -> Filter {
        Filter::new().address(self.address).event_signature(self.topic0)
    }
}

/// The parts of a block header the poller needs to check chain continuity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
}
