use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use tokio::{sync::watch, time::sleep};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{
    ListenerError,
    cursor::Cursor,
    log_entry::{BlockRef, LogEntry, LogFilter},
    log_poller::{
        PollerResult, builder::PollerConfig, queue, reorg_handler::ReorgHandler,
        state::PollerState,
    },
    robust_provider::{self, LogSource, LogStream},
    types::{IntoListenerResult, ListenerMessage, Notification, ReorgReport, TryStream},
};

enum Phase {
    Backfilling,
    CatchingUp,
    /// Carries the subscription opened during catch-up, if any.
    Live(Option<LogStream>),
    Reconnecting(ListenerError),
}

impl Phase {
    fn state(&self) -> PollerState {
        match self {
            Phase::Backfilling => PollerState::Backfilling,
            Phase::CatchingUp => PollerState::CatchingUp,
            Phase::Live(_) => PollerState::Live,
            Phase::Reconnecting(_) => PollerState::Reconnecting,
        }
    }
}

/// Why a phase did not hand over to another phase.
enum Halt {
    Cancelled,
    /// The consumer dropped its end of the queue.
    Disconnected,
    /// Reconnects if the error is transient, stops the session otherwise.
    Failed(ListenerError),
    /// Reconnect attempts are exhausted.
    GaveUp(ListenerError),
}

impl From<ListenerError> for Halt {
    fn from(err: ListenerError) -> Self {
        Halt::Failed(err)
    }
}

impl From<robust_provider::Error> for Halt {
    fn from(err: robust_provider::Error) -> Self {
        Halt::Failed(err.into())
    }
}

enum Scan {
    Committed,
    /// The range does not extend the tracked chain.
    Diverged,
}

async fn cancellable<T, E: Into<ListenerError>>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T, E>>,
) -> Result<T, Halt> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Halt::Cancelled),
        result = call => result.map_err(|err| Halt::Failed(err.into())),
    }
}

pub(crate) struct PollerEngine<S: LogSource> {
    source: S,
    filter: LogFilter,
    config: PollerConfig,
    cancel: CancellationToken,
    sender: queue::Sender<PollerResult>,
    reorg_handler: ReorgHandler<S>,
    cursor: Option<Cursor>,
    cursor_tx: watch::Sender<Option<Cursor>>,
    state_tx: watch::Sender<PollerState>,
    start_block: u64,
    next_block: u64,
    push_mode: bool,
    announced_live: bool,
    reconnect_backoff: Option<ExponentialBackoff>,
    reconnect_attempts: usize,
}

pub(crate) struct EngineChannels {
    pub sender: queue::Sender<PollerResult>,
    pub cursor_tx: watch::Sender<Option<Cursor>>,
    pub state_tx: watch::Sender<PollerState>,
}

impl<S: LogSource> PollerEngine<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: S,
        filter: LogFilter,
        config: PollerConfig,
        cancel: CancellationToken,
        channels: EngineChannels,
        start_block: u64,
        resume: Option<Cursor>,
        push_mode: bool,
    ) -> Self {
        let mut reorg_handler = ReorgHandler::new(source.clone(), config.past_blocks_capacity);
        if let Some(cursor) = &resume {
            reorg_handler.record_resume_point(cursor);
        }

        Self {
            source,
            filter,
            config,
            cancel,
            sender: channels.sender,
            reorg_handler,
            cursor: resume,
            cursor_tx: channels.cursor_tx,
            state_tx: channels.state_tx,
            start_block,
            next_block: start_block,
            push_mode,
            announced_live: false,
            reconnect_backoff: None,
            reconnect_attempts: 0,
        }
    }

    /// Drive the state machine until cancellation, a fatal error or consumer shutdown.
    ///
    /// Returns the final cursor.
    pub async fn run(mut self, waiting_for_start: bool) -> Option<Cursor> {
        let mut phase = if waiting_for_start { Phase::Live(None) } else { Phase::Backfilling };

        loop {
            let state = phase.state();
            self.state_tx.send_replace(state);
            debug!(state = %state, next_block = self.next_block, "Entering poller phase");

            let step = match phase {
                Phase::Backfilling => self.backfill().await,
                Phase::CatchingUp => self.catch_up().await,
                Phase::Live(stream) => self.live(stream).await,
                Phase::Reconnecting(cause) => self.reconnect(cause).await,
            };

            phase = match step {
                Ok(next) => next,
                Err(Halt::Failed(err)) if err.is_transient() => {
                    warn!(error = %err, "Transient failure, reconnecting");
                    Phase::Reconnecting(err)
                }
                Err(Halt::Failed(err) | Halt::GaveUp(err)) => {
                    error!(error = %err, "Poller stopped on fatal error");
                    _ = self.sender.try_stream(err).await;
                    break;
                }
                Err(Halt::Cancelled) => {
                    info!("Cancellation requested, stopping poller");
                    break;
                }
                Err(Halt::Disconnected) => {
                    info!("Consumer dropped the stream, stopping poller");
                    break;
                }
            };
        }

        self.state_tx.send_replace(PollerState::Stopped);
        if let Some(cursor) = &self.cursor {
            info!(cursor = %cursor, "Poller stopped");
        }
        self.cursor
    }

    async fn backfill(&mut self) -> Result<Phase, Halt> {
        let head = cancellable(&self.cancel, self.source.latest_block()).await?;
        let target = head.saturating_sub(self.config.safety_margin);
        if self.next_block <= target {
            info!(from = self.next_block, to = target, head = head, "Backfilling");
        }

        match self.scan_until(target).await? {
            Scan::Committed => Ok(Phase::CatchingUp),
            Scan::Diverged => self.recover_from_reorg().await,
        }
    }

    /// Subscribes first when pushing, so logs mined during the final scan reach the stream.
    async fn catch_up(&mut self) -> Result<Phase, Halt> {
        let stream = if self.push_mode {
            Some(cancellable(&self.cancel, self.source.subscribe_logs(&self.filter)).await?)
        } else {
            None
        };

        let head = cancellable(&self.cancel, self.source.latest_block()).await?;
        if self.next_block <= head {
            debug!(from = self.next_block, to = head, "Catching up to head");
        }

        match self.scan_until(head).await? {
            Scan::Committed => Ok(Phase::Live(stream)),
            Scan::Diverged => self.recover_from_reorg().await,
        }
    }

    async fn live(&mut self, stream: Option<LogStream>) -> Result<Phase, Halt> {
        if !self.announced_live {
            self.announced_live = true;
            info!(next_block = self.next_block, push = self.push_mode, "Switching to live mode");
            self.send(Notification::SwitchingToLive).await?;
        }

        if !self.push_mode {
            return self.poll_head().await;
        }

        let stream = match stream {
            Some(stream) => stream,
            None => cancellable(&self.cancel, self.source.subscribe_logs(&self.filter)).await?,
        };
        self.follow_subscription(stream).await
    }

    async fn poll_head(&mut self) -> Result<Phase, Halt> {
        loop {
            self.pause(self.config.poll_interval).await?;

            let head = cancellable(&self.cancel, self.source.latest_block()).await?;
            if head < self.next_block {
                trace!(head = head, next_block = self.next_block, "No new blocks");
                continue;
            }

            if let Scan::Diverged = self.scan_until(head).await? {
                return self.recover_from_reorg().await;
            }
        }
    }

    async fn follow_subscription(&mut self, mut stream: LogStream) -> Result<Phase, Halt> {
        loop {
            // stop consuming the subscription while the queue is over its high watermark
            self.wait_for_capacity().await?;

            let item = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(Halt::Cancelled),
                item = stream.next() => item,
            };

            let log = match item {
                Some(Ok(log)) => log,
                Some(Err(err)) => {
                    warn!(error = %err, "Log subscription failed");
                    return Err(err.into());
                }
                None => {
                    warn!("Log subscription ended");
                    return Err(ListenerError::SubscriptionClosed.into());
                }
            };

            if log.removed {
                if self.cursor.is_some_and(|cursor| !cursor.accepts(log.position())) {
                    reorg!(position = %log.position(), "Node removed a delivered log");
                    return self.recover_from_reorg().await;
                }
                trace!(position = %log.position(), "Ignoring removal of an undelivered log");
                continue;
            }

            if !self.filter.matches(&log) || log.block_number < self.start_block {
                trace!(position = %log.position(), "Skipping log outside the delivery window");
                continue;
            }

            // checked before the cursor, a replacement may reuse delivered positions
            let tracked = self.reorg_handler.hash_at(log.block_number);
            if let Some(tracked_hash) = tracked &&
                tracked_hash != log.block_hash
            {
                let Some(block) = self.canonical_block_of(&log).await? else {
                    continue;
                };
                reorg!(
                    block_number = block.number,
                    tracked_hash = %tracked_hash,
                    block_hash = %block.hash,
                    "Tracked block was replaced"
                );
                return self.recover_from_reorg().await;
            }

            if !self.accepts(&log) {
                trace!(position = %log.position(), "Skipping already delivered log");
                continue;
            }

            if tracked.is_none() {
                let Some(block) = self.canonical_block_of(&log).await? else {
                    continue;
                };
                if !cancellable(&self.cancel, self.reorg_handler.is_continuous(&block)).await? ||
                    !self.reorg_handler.record_block(&block)
                {
                    return self.recover_from_reorg().await;
                }
            }

            let block_number = log.block_number;
            self.deliver(log).await?;
            self.next_block = self.next_block.max(block_number + 1);
            self.progress_made();
        }
    }

    /// Header of the canonical block at the log's height, `None` if the log is not on it.
    async fn canonical_block_of(&self, log: &LogEntry) -> Result<Option<BlockRef>, Halt> {
        let block = cancellable(&self.cancel, self.source.block_header(log.block_number)).await?;
        if block.hash != log.block_hash {
            debug!(
                position = %log.position(),
                block_hash = %log.block_hash,
                canonical_hash = %block.hash,
                "Skipping log from a non-canonical block"
            );
            return Ok(None);
        }
        Ok(Some(block))
    }

    async fn scan_until(&mut self, target: u64) -> Result<Scan, Halt> {
        while self.next_block <= target {
            let to = target.min(self.next_block.saturating_add(self.config.max_block_range - 1));
            if let Scan::Diverged = self.scan_range(self.next_block, to).await? {
                return Ok(Scan::Diverged);
            }
        }
        Ok(Scan::Committed)
    }

    /// Deliver every undelivered log in `from..=to` and commit the range.
    ///
    /// The header of `to` is fetched before the logs so that a reorg racing the query shows up
    /// as logs whose block hash disagrees with it.
    async fn scan_range(&mut self, from: u64, to: u64) -> Result<Scan, Halt> {
        self.wait_for_capacity().await?;

        let block = cancellable(&self.cancel, self.source.block_header(to)).await?;
        if !cancellable(&self.cancel, self.reorg_handler.is_continuous(&block)).await? {
            return Ok(Scan::Diverged);
        }

        let mut logs = cancellable(&self.cancel, self.source.get_logs(&self.filter, from..=to)).await?;
        logs.retain(|log| {
            !log.removed && self.filter.matches(log) && (from..=to).contains(&log.block_number)
        });
        logs.sort_by_key(LogEntry::position);
        logs.dedup_by_key(|log| log.position());

        if logs.iter().any(|log| log.block_number == to && log.block_hash != block.hash) {
            return Err(ListenerError::ChainMoved(to).into());
        }

        debug!(from = from, to = to, logs = logs.len(), "Scanned block range");
        for log in logs {
            if !self.accepts(&log) {
                trace!(position = %log.position(), "Skipping already delivered log");
                continue;
            }
            self.deliver(log).await?;
        }

        if !self.reorg_handler.record_block(&block) {
            return Ok(Scan::Diverged);
        }
        self.commit(Cursor::end_of(&block));
        self.next_block = to + 1;
        self.progress_made();
        Ok(Scan::Committed)
    }

    /// Unwind to the common ancestor, report what was invalidated and backfill from there.
    async fn recover_from_reorg(&mut self) -> Result<Phase, Halt> {
        reorg!(next_block = self.next_block, "Chain reorganization detected, searching for common ancestor");
        let rollback = cancellable(&self.cancel, self.reorg_handler.rollback()).await?;

        let Some(ancestor) = rollback.ancestor else {
            warn!("No tracked blocks to roll back, rescanning from the cursor");
            self.next_block = self.resume_block();
            return Ok(Phase::Backfilling);
        };

        if self.cursor.is_some_and(|cursor| cursor.block_number > ancestor.number) {
            let rewound = Cursor::end_of(&ancestor);
            self.cursor = Some(rewound);
            self.cursor_tx.send_replace(Some(rewound));
        }
        self.next_block = self.resume_block();

        let report = ReorgReport {
            common_ancestor: ancestor.number,
            ancestor_hash: ancestor.hash,
            invalidated: rollback.invalidated,
            beyond_history: rollback.beyond_history,
        };
        reorg!(
            common_ancestor = report.common_ancestor,
            invalidated = report.invalidated.len(),
            beyond_history = report.beyond_history,
            "Rolled back to common ancestor"
        );
        self.send(Notification::ReorgDetected(report)).await?;
        Ok(Phase::Backfilling)
    }

    async fn reconnect(&mut self, cause: ListenerError) -> Result<Phase, Halt> {
        let config = &self.config;
        let backoff = self.reconnect_backoff.get_or_insert_with(|| {
            ExponentialBuilder::default()
                .with_min_delay(config.reconnect_min_delay)
                .with_max_delay(config.reconnect_max_delay)
                .with_max_times(config.max_reconnect_attempts)
                .with_jitter()
                .build()
        });

        let Some(delay) = backoff.next() else {
            error!(
                attempts = self.reconnect_attempts,
                error = %cause,
                "Giving up after repeated reconnect failures"
            );
            return Err(Halt::GaveUp(cause));
        };

        self.reconnect_attempts += 1;
        warn!(
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis(),
            error = %cause,
            "Reconnecting"
        );
        self.pause(delay).await?;

        // rescan the cursor's own block, the continuity check verifies it was not orphaned
        self.next_block = self.cursor.map_or(self.start_block, |c| c.block_number).max(self.start_block);
        Ok(Phase::Backfilling)
    }

    async fn deliver(&mut self, log: LogEntry) -> Result<(), Halt> {
        let cursor = Cursor::after_log(&log);
        if !self.reorg_handler.note_delivery(&log) {
            return Err(ListenerError::ChainMoved(log.block_number).into());
        }
        self.send(ListenerMessage::Data(log)).await?;
        self.commit(cursor);
        Ok(())
    }

    async fn send(&self, msg: impl IntoListenerResult<LogEntry>) -> Result<(), Halt> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Halt::Cancelled),
            delivered = self.sender.try_stream(msg) => {
                if delivered { Ok(()) } else { Err(Halt::Disconnected) }
            }
        }
    }

    async fn wait_for_capacity(&self) -> Result<(), Halt> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Halt::Cancelled),
            ready = self.sender.ready() => ready.map_err(|_| Halt::Disconnected),
        }
    }

    async fn pause(&self, duration: Duration) -> Result<(), Halt> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Halt::Cancelled),
            () = sleep(duration) => Ok(()),
        }
    }

    fn accepts(&self, log: &LogEntry) -> bool {
        self.cursor.is_none_or(|cursor| cursor.accepts(log.position()))
    }

    fn commit(&mut self, cursor: Cursor) {
        debug_assert!(
            self.cursor.is_none_or(|current| current.key() <= cursor.key()),
            "cursor must not regress outside reorg recovery"
        );
        self.cursor = Some(cursor);
        self.cursor_tx.send_replace(Some(cursor));
    }

    /// First block not fully delivered.
    fn resume_block(&self) -> u64 {
        self.cursor
            .map_or(self.start_block, |cursor| match cursor.log_index {
                Some(_) => cursor.block_number,
                None => cursor.block_number + 1,
            })
            .max(self.start_block)
    }

    fn progress_made(&mut self) {
        if self.reconnect_attempts > 0 {
            info!(attempts = self.reconnect_attempts, "Recovered after reconnecting");
        }
        self.reconnect_backoff = None;
        self.reconnect_attempts = 0;
    }
}
