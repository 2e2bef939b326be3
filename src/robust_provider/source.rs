use std::{ops::RangeInclusive, pin::Pin};

use alloy::network::Network;
use tokio_stream::Stream;

use crate::{
    log_entry::{BlockRef, LogEntry, LogFilter},
    robust_provider::{Error, RobustProvider},
};

/// Live logs pushed by a node.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogEntry, Error>> + Send>>;

/// What the poller needs from a node.
///
/// Implementations own their retry policy: errors they return have already been retried where
/// that made sense, and [`Error::is_transient`] tells the poller whether reconnecting is worth
/// it.
pub trait LogSource: Clone + Send + Sync + 'static {
    /// Current head height.
    fn latest_block(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Header of the canonical block at `number`.
    fn block_header(&self, number: u64) -> impl Future<Output = Result<BlockRef, Error>> + Send;

    /// Logs matching `filter` within `range`, inclusive on both ends.
    fn get_logs(
        &self,
        filter: &LogFilter,
        range: RangeInclusive<u64>,
    ) -> impl Future<Output = Result<Vec<LogEntry>, Error>> + Send;

    /// Whether [`LogSource::subscribe_logs`] can succeed.
    fn supports_subscription(&self) -> bool;

    /// Push stream of new logs matching `filter`.
    fn subscribe_logs(
        &self,
        filter: &LogFilter,
    ) -> impl Future<Output = Result<LogStream, Error>> + Send;
}

impl<N: Network> LogSource for RobustProvider<N> {
    async fn latest_block(&self) -> Result<u64, Error> {
        self.get_block_number().await
    }

    async fn block_header(&self, number: u64) -> Result<BlockRef, Error> {
        self.get_block_ref(number).await
    }

    async fn get_logs(
        &self,
        filter: &LogFilter,
        range: RangeInclusive<u64>,
    ) -> Result<Vec<LogEntry>, Error> {
        let logs = RobustProvider::get_logs(self, &filter.range_filter(*range.start(), *range.end()))
            .await?;
        Ok(logs
            .into_iter()
            .filter_map(|log| {
                LogEntry::try_from(log)
                    .inspect_err(|err| debug!(error = %err, "Skipping log without block data"))
                    .ok()
            })
            .collect())
    }

    fn supports_subscription(&self) -> bool {
        self.any_supports_pubsub()
    }

    async fn subscribe_logs(&self, filter: &LogFilter) -> Result<LogStream, Error> {
        let subscription = RobustProvider::subscribe_logs(self, &filter.live_filter()).await?;
        Ok(Box::pin(subscription.into_stream()))
    }
}
