use alloy::primitives::B256;

use crate::{
    ListenerError,
    cursor::Cursor,
    log_entry::{BlockRef, LogEntry, LogPosition},
    robust_provider::{self, LogSource},
};

use super::ring_buffer::{RingBuffer, RingBufferCapacity};

/// A block the poller has scanned or delivered logs from.
#[derive(Clone, Debug, PartialEq, Eq)]
struct BlockRecord {
    number: u64,
    hash: B256,
    /// Indices of the logs delivered from this block.
    delivered: Vec<u64>,
}

/// Result of unwinding the tracked history after a divergence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Rollback {
    /// Newest block still on the canonical chain, `None` when nothing was tracked.
    pub ancestor: Option<BlockRef>,
    /// Delivered positions in orphaned blocks, ascending.
    pub invalidated: Vec<LogPosition>,
    /// Every tracked block diverged; the ancestor is the block just below the tracked window.
    pub beyond_history: bool,
}

/// Tracks recent block hashes and finds where the chain diverged from them.
///
/// Records are kept in strictly ascending block order.
#[derive(Clone, Debug)]
pub(crate) struct ReorgHandler<S: LogSource> {
    source: S,
    records: RingBuffer<BlockRecord>,
}

impl<S: LogSource> ReorgHandler<S> {
    pub fn new(source: S, capacity: RingBufferCapacity) -> Self {
        Self { source, records: RingBuffer::new(capacity) }
    }

    /// Remember `block` as scanned.
    ///
    /// Returns `false` if its height is tracked under another hash.
    #[must_use]
    pub fn record_block(&mut self, block: &BlockRef) -> bool {
        self.record(block.number, block.hash)
    }

    /// Remember that `log` was delivered.
    ///
    /// Returns `false`, noting nothing, if its block height is tracked under another hash.
    #[must_use]
    pub fn note_delivery(&mut self, log: &LogEntry) -> bool {
        if !self.record(log.block_number, log.block_hash) {
            return false;
        }
        if let Some(record) = self.records.back_mut() &&
            record.number == log.block_number
        {
            record.delivered.push(log.log_index);
        }
        true
    }

    /// Seed the history with the block a resumed session stopped in.
    pub fn record_resume_point(&mut self, cursor: &Cursor) {
        self.records.clear();
        self.records.push(BlockRecord {
            number: cursor.block_number,
            hash: cursor.block_hash,
            delivered: Vec::new(),
        });
    }

    /// Block number of the newest record.
    pub fn newest(&self) -> Option<u64> {
        self.records.back().map(|record| record.number)
    }

    /// Hash tracked for block `number`.
    pub fn hash_at(&self, number: u64) -> Option<B256> {
        self.records.iter().rev().find(|record| record.number == number).map(|record| record.hash)
    }

    /// A tracked height keeps its hash until [`ReorgHandler::rollback`] drops it.
    fn record(&mut self, number: u64, hash: B256) -> bool {
        if let Some(tracked) = self.hash_at(number) {
            if tracked != hash {
                reorg!(
                    block_number = number,
                    tracked_hash = %tracked,
                    block_hash = %hash,
                    "Block height is tracked under a different hash"
                );
                return false;
            }
            self.records.pop_back_while(|record| record.number > number);
            return true;
        }
        self.records.pop_back_while(|record| record.number > number);
        self.records.push(BlockRecord { number, hash, delivered: Vec::new() });
        true
    }

    /// Whether `incoming` extends the tracked chain.
    ///
    /// It is compared with the newest record at or below its height: the hash at the same
    /// height, the parent hash one block above, or for a wider gap the record is fetched again
    /// to check it is still canonical.
    pub async fn is_continuous(&self, incoming: &BlockRef) -> Result<bool, ListenerError> {
        let Some(anchor) = self.records.iter().rev().find(|record| record.number <= incoming.number)
        else {
            return Ok(true);
        };

        let continuous = if anchor.number == incoming.number {
            anchor.hash == incoming.hash
        } else if anchor.number + 1 == incoming.number {
            anchor.hash == incoming.parent_hash
        } else {
            self.is_canonical(anchor.number, anchor.hash).await?
        };

        if !continuous {
            reorg!(
                block_number = incoming.number,
                block_hash = %incoming.hash,
                anchor_number = anchor.number,
                anchor_hash = %anchor.hash,
                "Block does not extend the tracked chain"
            );
        }
        Ok(continuous)
    }

    async fn is_canonical(&self, number: u64, hash: B256) -> Result<bool, ListenerError> {
        match self.source.block_header(number).await {
            Ok(block) => Ok(block.hash == hash),
            Err(robust_provider::Error::BlockNotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop every record that is no longer canonical and report what it invalidates.
    ///
    /// Records are only removed once the ancestor is known, so a failed lookup can be retried
    /// without losing track of delivered logs.
    pub async fn rollback(&mut self) -> Result<Rollback, ListenerError> {
        let tracked: Vec<(u64, B256)> =
            self.records.iter().rev().map(|record| (record.number, record.hash)).collect();

        let mut ancestor = None;
        for (number, hash) in tracked {
            debug!(block_number = number, block_hash = %hash, "Checking if tracked block is canonical");
            if self.is_canonical(number, hash).await? {
                ancestor = Some(number);
                break;
            }
        }

        let orphaned = match ancestor {
            Some(number) => self.records.pop_back_while(|record| record.number > number),
            None => self.records.pop_back_while(|_| true),
        };
        let mut invalidated: Vec<LogPosition> = orphaned
            .iter()
            .flat_map(|record| {
                record
                    .delivered
                    .iter()
                    .map(|&log_index| LogPosition { block_number: record.number, log_index })
            })
            .collect();
        invalidated.sort_unstable();

        if let Some(number) = ancestor {
            let block = self.source.block_header(number).await?;
            info!(block_number = number, block_hash = %block.hash, "Common ancestor found");
            return Ok(Rollback { ancestor: Some(block), invalidated, beyond_history: false });
        }

        let Some(oldest) = orphaned.last().map(|record| record.number) else {
            return Ok(Rollback { ancestor: None, invalidated, beyond_history: false });
        };

        let floor = self.source.block_header(oldest.saturating_sub(1)).await?;
        reorg!(
            oldest_tracked = oldest,
            block_number = floor.number,
            "Reorg reaches past every tracked block, resuming below the tracked window"
        );
        self.records.clear();
        self.records.push(BlockRecord { number: floor.number, hash: floor.hash, delivered: Vec::new() });
        Ok(Rollback { ancestor: Some(floor), invalidated, beyond_history: true })
    }
}
