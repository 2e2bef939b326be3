//! Poller, decoder and sink wired into one pipeline.

use std::sync::Arc;

use alloy::primitives::Address;
use tokio::sync::watch;
use tokio_stream::StreamExt;

use crate::{
    ListenerError,
    abi::EventSchema,
    block_pointer::BlockPointer,
    cursor::Cursor,
    decoder::EventDecoder,
    log_entry::LogFilter,
    log_poller::LogPollerBuilder,
    robust_provider::LogSource,
    sink::EventSink,
    types::{ListenerMessage, Notification},
};

/// Streams one event of one contract into an [`EventSink`].
///
/// Logs that fail to decode are logged and skipped. Reorg reports are written to the sink as
/// their own records.
#[derive(Debug)]
pub struct Listener<S: LogSource> {
    source: S,
    schema: EventSchema,
    address: Address,
    poller: LogPollerBuilder,
    start: BlockPointer,
    resume: Option<Cursor>,
    written: watch::Sender<Option<Cursor>>,
}

impl<S: LogSource> Listener<S> {
    pub fn new(source: S, schema: EventSchema, address: Address) -> Self {
        Self {
            source,
            schema,
            address,
            poller: LogPollerBuilder::new(),
            start: BlockPointer::Head,
            resume: None,
            written: watch::Sender::new(None),
        }
    }

    /// Poller settings, including the cancellation token that stops [`Listener::run`].
    #[must_use]
    pub fn poller(mut self, builder: LogPollerBuilder) -> Self {
        self.poller = builder;
        self
    }

    #[must_use]
    pub fn start_at(mut self, start: BlockPointer) -> Self {
        self.start = start;
        self
    }

    /// Continue after `cursor` instead of at the start block.
    #[must_use]
    pub fn resume_from(mut self, cursor: Option<Cursor>) -> Self {
        self.written.send_replace(cursor);
        self.resume = cursor;
        self
    }

    #[must_use]
    pub fn schema(&self) -> &EventSchema {
        &self.schema
    }

    /// Cursor of the last record the sink accepted.
    ///
    /// Unlike the poller cursor it never runs ahead of the sink, so it is the one to persist.
    #[must_use]
    pub fn subscribe_cursor(&self) -> watch::Receiver<Option<Cursor>> {
        self.written.subscribe()
    }

    /// Run until the poller stops and every queued record is written.
    ///
    /// Returns the cursor to resume from.
    ///
    /// # Errors
    ///
    /// Startup failures, the poller's fatal error, or the first sink failure.
    pub async fn run<K: EventSink>(self, sink: &mut K) -> Result<Option<Cursor>, ListenerError> {
        let decoder = EventDecoder::new(&self.schema)?;
        let filter = LogFilter::new(self.address, self.schema.selector);
        let poller = self.poller.build(self.source, filter)?;
        info!(
            address = %self.address,
            event = %self.schema.signature,
            topic0 = %self.schema.selector,
            "Listening for events"
        );
        let (mut stream, handle) = poller.start(self.start, self.resume).await?;

        let mut outcome = Ok(());
        let mut delivered: u64 = 0;
        let mut skipped: u64 = 0;

        while let Some(item) = stream.next().await {
            match item {
                Ok(ListenerMessage::Data(log)) => {
                    let cursor = Cursor::after_log(&log);
                    match decoder.decode(&log) {
                        Ok(event) => {
                            if let Err(err) = sink.write_event(&event).await {
                                outcome = Err(ListenerError::Sink(Arc::new(err)));
                                break;
                            }
                            delivered += 1;
                        }
                        Err(err) => {
                            skipped += 1;
                            warn!(
                                position = %log.position(),
                                transaction_hash = %log.transaction_hash,
                                error = %err,
                                "Skipping log that does not decode"
                            );
                        }
                    }
                    self.written.send_replace(Some(cursor));
                }
                Ok(ListenerMessage::Notification(Notification::SwitchingToLive)) => {
                    info!(delivered = delivered, "Caught up with the chain head");
                }
                Ok(ListenerMessage::Notification(Notification::ReorgDetected(report))) => {
                    reorg!(
                        common_ancestor = report.common_ancestor,
                        invalidated = report.invalidated.len(),
                        "Previously written events were invalidated"
                    );
                    if let Err(err) = sink.write_reorg(&report).await {
                        outcome = Err(ListenerError::Sink(Arc::new(err)));
                        break;
                    }
                    self.written.send_if_modified(|cursor| match cursor {
                        Some(current) if current.block_number > report.common_ancestor => {
                            *current = Cursor {
                                block_number: report.common_ancestor,
                                log_index: None,
                                block_hash: report.ancestor_hash,
                            };
                            true
                        }
                        _ => false,
                    });
                }
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        let mut sink_failed = matches!(outcome, Err(ListenerError::Sink(_)));
        if sink_failed {
            handle.stop();
        }
        drop(stream);

        if let Err(err) = sink.flush().await {
            sink_failed = true;
            if outcome.is_ok() {
                outcome = Err(ListenerError::Sink(Arc::new(err)));
            }
        }

        let final_cursor = handle.join().await?;
        // the stream was drained, so the poller's block completions are written too
        if !sink_failed {
            self.written.send_replace(final_cursor);
        }

        let resume = *self.written.borrow();
        info!(delivered = delivered, skipped = skipped, "Listener stopped");
        if let Some(cursor) = &resume {
            info!(cursor = %cursor, "Resume point");
        }
        outcome.map(|()| resume)
    }
}
