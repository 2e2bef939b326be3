use std::{
    pin::Pin,
    task::{Context, Poll, ready},
};

use alloy::{
    network::Network,
    providers::{Provider, RootProvider},
    pubsub::Subscription,
    rpc::types::{Filter, Log},
};
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::Stream;
use tokio_util::sync::ReusableBoxFuture;

use crate::{
    log_entry::LogEntry,
    robust_provider::{Error, RobustProvider},
};

/// A log subscription that moves to the next pubsub-capable fallback when its connection
/// closes.
///
/// Lag is not recovered here: missed logs can only be recovered with a range query, so it is
/// reported as [`Error::Lagged`] and the caller decides how to backfill.
#[derive(Debug)]
pub struct LogSubscription<N: Network> {
    subscription: Subscription<Log>,
    robust_provider: RobustProvider<N>,
    filter: Filter,
    current_fallback_index: Option<usize>,
}

impl<N: Network> LogSubscription<N> {
    pub(crate) fn new(
        subscription: Subscription<Log>,
        robust_provider: RobustProvider<N>,
        filter: Filter,
        current_fallback_index: Option<usize>,
    ) -> Self {
        Self { subscription, robust_provider, filter, current_fallback_index }
    }

    /// Receive the next mined log.
    ///
    /// Pending logs (without block data) are skipped.
    ///
    /// # Errors
    ///
    /// [`Error::Lagged`] when messages were dropped, or the last subscribe error once every
    /// remaining fallback has failed.
    pub async fn recv(&mut self) -> Result<LogEntry, Error> {
        loop {
            match self.subscription.recv().await {
                Ok(log) => match LogEntry::try_from(log) {
                    Ok(entry) => return Ok(entry),
                    Err(err) => debug!(error = %err, "Skipping log without block data"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Log subscription lagged");
                    return Err(Error::Lagged(skipped));
                }
                Err(RecvError::Closed) => {
                    error!("Log subscription closed, switching provider");
                    self.switch_to_fallback().await?;
                }
            }
        }
    }

    async fn switch_to_fallback(&mut self) -> Result<(), Error> {
        let filter = self.filter.clone();
        let operation = |provider: RootProvider<N>| {
            let filter = filter.clone();
            async move { provider.subscribe_logs(&filter).await }
        };

        let start_index = self.current_fallback_index.map_or(0, |idx| idx + 1);
        let (subscription, fallback_idx) = self
            .robust_provider
            .try_fallback_providers_from(&operation, true, Error::Closed, start_index)
            .await?;

        info!(provider_num = fallback_idx + 1, "Log subscription moved to fallback provider");
        self.subscription = subscription;
        self.current_fallback_index = Some(fallback_idx);
        Ok(())
    }

    /// Convert the subscription into a stream.
    #[must_use]
    pub fn into_stream(self) -> LogSubscriptionStream<N>
    where
        N: 'static,
    {
        LogSubscriptionStream::from(self)
    }
}

type SubscriptionResult<N> = (Result<LogEntry, Error>, LogSubscription<N>);

/// Stream over a [`LogSubscription`]. Ends after yielding its first error.
pub struct LogSubscriptionStream<N: Network> {
    inner: ReusableBoxFuture<'static, SubscriptionResult<N>>,
    finished: bool,
}

async fn make_future<N: Network>(mut rx: LogSubscription<N>) -> SubscriptionResult<N> {
    let result = rx.recv().await;
    (result, rx)
}

impl<N: Network + 'static> LogSubscriptionStream<N> {
    #[must_use]
    pub fn new(rx: LogSubscription<N>) -> Self {
        Self { inner: ReusableBoxFuture::new(make_future(rx)), finished: false }
    }
}

impl<N: Network + 'static> Stream for LogSubscriptionStream<N> {
    type Item = Result<LogEntry, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        let (result, rx) = ready!(self.inner.poll(cx));

        match result {
            Ok(item) => {
                self.inner.set(make_future(rx));
                Poll::Ready(Some(Ok(item)))
            }
            Err(e) => {
                self.finished = true;
                Poll::Ready(Some(Err(e)))
            }
        }
    }
}

impl<N: Network + 'static> From<LogSubscription<N>> for LogSubscriptionStream<N> {
    fn from(recv: LogSubscription<N>) -> Self {
        Self::new(recv)
    }
}
