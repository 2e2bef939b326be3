use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{
    ListenerError,
    log_entry::LogFilter,
    log_poller::{LogPoller, ring_buffer::RingBufferCapacity},
    robust_provider::LogSource,
};

/// Default number of blocks requested by a single `eth_getLogs` call.
pub const DEFAULT_MAX_BLOCK_RANGE: u64 = 1000;
/// Default distance from the head where backfill hands over to catch-up.
pub const DEFAULT_SAFETY_MARGIN: u64 = 12;
/// Default interval between head polls in live polling mode.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Default number of queued items at which the poller pauses.
pub const DEFAULT_HIGH_WATERMARK: usize = 1024;
/// Default number of queued items at which a paused poller resumes.
pub const DEFAULT_LOW_WATERMARK: usize = 256;
/// Default number of recent blocks tracked for reorg detection.
pub const DEFAULT_PAST_BLOCKS_CAPACITY: RingBufferCapacity = RingBufferCapacity::Limited(64);
/// Default number of consecutive reconnects before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: usize = 10;
/// Default first reconnect delay.
pub const DEFAULT_RECONNECT_MIN_DELAY: Duration = Duration::from_secs(1);
/// Default ceiling for reconnect delays.
pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// How the poller tails the head once caught up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LiveMode {
    /// Subscribe when the source supports it, poll otherwise.
    #[default]
    Auto,
    /// Always poll, even if the source could push.
    Polling,
}

#[derive(Debug, Clone)]
pub(crate) struct PollerConfig {
    pub max_block_range: u64,
    pub safety_margin: u64,
    pub poll_interval: Duration,
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub past_blocks_capacity: RingBufferCapacity,
    pub max_reconnect_attempts: usize,
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub live_mode: LiveMode,
}

/// Configures a [`LogPoller`].
#[derive(Debug, Clone)]
pub struct LogPollerBuilder {
    config: PollerConfig,
    cancellation: Option<CancellationToken>,
}

impl Default for LogPollerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LogPollerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: PollerConfig {
                max_block_range: DEFAULT_MAX_BLOCK_RANGE,
                safety_margin: DEFAULT_SAFETY_MARGIN,
                poll_interval: DEFAULT_POLL_INTERVAL,
                high_watermark: DEFAULT_HIGH_WATERMARK,
                low_watermark: DEFAULT_LOW_WATERMARK,
                past_blocks_capacity: DEFAULT_PAST_BLOCKS_CAPACITY,
                max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
                reconnect_min_delay: DEFAULT_RECONNECT_MIN_DELAY,
                reconnect_max_delay: DEFAULT_RECONNECT_MAX_DELAY,
                live_mode: LiveMode::Auto,
            },
            cancellation: None,
        }
    }

    /// Largest block span requested by one range query. Providers commonly cap this.
    #[must_use]
    pub fn max_block_range(mut self, blocks: u64) -> Self {
        self.config.max_block_range = blocks;
        self
    }

    /// Blocks below the head that backfill leaves to the catch-up phase.
    #[must_use]
    pub fn safety_margin(mut self, blocks: u64) -> Self {
        self.config.safety_margin = blocks;
        self
    }

    /// Head polling interval in live polling mode.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Queue length at which the poller stops issuing queries.
    #[must_use]
    pub fn buffer_high_watermark(mut self, items: usize) -> Self {
        self.config.high_watermark = items;
        self
    }

    /// Queue length at which a paused poller resumes.
    #[must_use]
    pub fn buffer_low_watermark(mut self, items: usize) -> Self {
        self.config.low_watermark = items;
        self
    }

    /// Recent blocks remembered for reorg detection.
    #[must_use]
    pub fn past_blocks_storage_capacity(mut self, capacity: impl Into<RingBufferCapacity>) -> Self {
        self.config.past_blocks_capacity = capacity.into();
        self
    }

    /// Consecutive reconnects without progress before the session fails.
    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: usize) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    /// Bounds of the jittered exponential reconnect delay.
    #[must_use]
    pub fn reconnect_delay(mut self, min: Duration, max: Duration) -> Self {
        self.config.reconnect_min_delay = min;
        self.config.reconnect_max_delay = max.max(min);
        self
    }

    #[must_use]
    pub fn live_mode(mut self, mode: LiveMode) -> Self {
        self.config.live_mode = mode;
        self
    }

    /// Stop the poller when `token` is cancelled.
    #[must_use]
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Validate the settings and bind them to a source and filter.
    pub fn build<S: LogSource>(self, source: S, filter: LogFilter) -> Result<LogPoller<S>, ListenerError> {
        let config = self.config;
        if config.max_block_range == 0 {
            return Err(ListenerError::InvalidMaxBlockRange);
        }
        if config.high_watermark == 0 || config.low_watermark >= config.high_watermark {
            return Err(ListenerError::InvalidWatermarks {
                high: config.high_watermark,
                low: config.low_watermark,
            });
        }

        Ok(LogPoller {
            source,
            filter,
            config,
            cancel: self.cancellation.map_or_else(CancellationToken::new, |token| token.child_token()),
        })
    }
}
