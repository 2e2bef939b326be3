//! Follows one contract event from a start block through history into live blocks.
//!
//! The poller moves through [`PollerState::Backfilling`], [`PollerState::CatchingUp`] and
//! [`PollerState::Live`], detours through [`PollerState::Reconnecting`] on transient failures, and
//! ends in [`PollerState::Stopped`]. Logs are delivered in `(block_number, log_index)` order and
//! none is delivered twice, except that a reorg invalidates what was delivered from orphaned
//! blocks and the replacement blocks are delivered afterwards.
//!
//! ```rust,no_run
//! use alloy::primitives::{address, b256};
//! use chainsub::{
//!     BlockPointer, ListenerMessage, LogFilter, LogPollerBuilder, Notification,
//!     robust_provider::{RobustProvider, RobustProviderBuilder},
//! };
//! use tokio_stream::StreamExt;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let provider: RobustProvider = RobustProviderBuilder::new("wss://eth.example.org").build().await?;
//! let filter = LogFilter::new(
//!     address!("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
//!     b256!("0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"),
//! );
//!
//! let poller = LogPollerBuilder::new().max_block_range(500).build(provider, filter)?;
//! let (mut stream, handle) = poller.start(BlockPointer::Number(19_000_000), None).await?;
//!
//! while let Some(item) = stream.next().await {
//!     match item? {
//!         ListenerMessage::Data(log) => println!("{}", log.position()),
//!         ListenerMessage::Notification(Notification::ReorgDetected(report)) => {
//!             println!("rolled back to {}", report.common_ancestor);
//!         }
//!         ListenerMessage::Notification(Notification::SwitchingToLive) => {}
//!     }
//! }
//! let cursor = handle.join().await?;
//! # Ok(())
//! # }
//! ```

mod builder;
mod engine;
pub mod queue;
mod reorg_handler;
mod ring_buffer;
mod state;

use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

pub use builder::{
    DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK, DEFAULT_MAX_BLOCK_RANGE,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_PAST_BLOCKS_CAPACITY, DEFAULT_POLL_INTERVAL,
    DEFAULT_RECONNECT_MAX_DELAY, DEFAULT_RECONNECT_MIN_DELAY, DEFAULT_SAFETY_MARGIN, LiveMode,
    LogPollerBuilder,
};
pub use ring_buffer::RingBufferCapacity;
pub use state::PollerState;

use crate::{
    ListenerError,
    block_pointer::BlockPointer,
    cursor::Cursor,
    log_entry::{LogEntry, LogFilter},
    robust_provider::LogSource,
    types::ListenerResult,
};
use builder::PollerConfig;
use engine::{EngineChannels, PollerEngine};

/// Item yielded by a [`PollerStream`].
pub type PollerResult = ListenerResult<LogEntry>;

/// Ordered stream of logs and notifications produced by a running poller.
///
/// A fatal error is yielded as the last item before the stream ends.
pub type PollerStream = queue::Receiver<PollerResult>;

/// A configured but not yet started poller. Created by [`LogPollerBuilder::build`].
#[derive(Debug)]
pub struct LogPoller<S: LogSource> {
    pub(crate) source: S,
    pub(crate) filter: LogFilter,
    pub(crate) config: PollerConfig,
    pub(crate) cancel: CancellationToken,
}

impl<S: LogSource> LogPoller<S> {
    #[must_use]
    pub fn filter(&self) -> &LogFilter {
        &self.filter
    }

    /// Spawn the poller.
    ///
    /// Without `resume` the session starts at `start`, resolved against the current head. A
    /// start block above the head goes straight to live mode and waits for the chain to reach
    /// it. With `resume` delivery continues right after the cursor and `start` is ignored.
    ///
    /// # Errors
    ///
    /// Fails if the head cannot be fetched to resolve `start`.
    pub async fn start(
        self,
        start: BlockPointer,
        resume: Option<Cursor>,
    ) -> Result<(PollerStream, PollerHandle), ListenerError> {
        let (start_block, waiting_for_start) = match &resume {
            Some(cursor) => {
                info!(cursor = %cursor, "Resuming from cursor");
                (cursor.block_number, false)
            }
            None => {
                let head = self.source.latest_block().await?;
                let start_block = start.resolve_against(head);
                info!(start = %start, start_block = start_block, head = head, "Starting poller");
                (start_block, start_block > head)
            }
        };

        let push_mode = match self.config.live_mode {
            LiveMode::Auto => self.source.supports_subscription(),
            LiveMode::Polling => false,
        };
        debug!(push_mode = push_mode, "Selected live mode");

        let (sender, receiver) =
            queue::channel(self.config.high_watermark, self.config.low_watermark);
        let (cursor_tx, cursor_rx) = watch::channel(resume);
        let initial_state =
            if waiting_for_start { PollerState::Live } else { PollerState::Backfilling };
        let (state_tx, state_rx) = watch::channel(initial_state);

        let engine = PollerEngine::new(
            self.source,
            self.filter,
            self.config,
            self.cancel.clone(),
            EngineChannels { sender, cursor_tx, state_tx },
            start_block,
            resume,
            push_mode,
        );
        let task = tokio::spawn(engine.run(waiting_for_start));

        let handle = PollerHandle { cancel: self.cancel, cursor: cursor_rx, state: state_rx, task };
        Ok((receiver, handle))
    }
}

/// Controls and observes a running poller.
#[derive(Debug)]
pub struct PollerHandle {
    cancel: CancellationToken,
    cursor: watch::Receiver<Option<Cursor>>,
    state: watch::Receiver<PollerState>,
    task: JoinHandle<Option<Cursor>>,
}

impl PollerHandle {
    /// Ask the poller to stop. Items already queued stay readable.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn state(&self) -> PollerState {
        *self.state.borrow()
    }

    /// Position of the last item handed to the queue.
    #[must_use]
    pub fn cursor(&self) -> Option<Cursor> {
        *self.cursor.borrow()
    }

    /// Watch cursor updates, e.g. to persist them.
    #[must_use]
    pub fn subscribe_cursor(&self) -> watch::Receiver<Option<Cursor>> {
        self.cursor.clone()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<PollerState> {
        self.state.clone()
    }

    /// Wait for the poller task and return its final cursor.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::ServiceShutdown`] if the task panicked or was aborted.
    pub async fn join(self) -> Result<Option<Cursor>, ListenerError> {
        self.task.await.map_err(|err| {
            error!(error = %err, "Poller task did not finish cleanly");
            ListenerError::ServiceShutdown
        })
    }
}
