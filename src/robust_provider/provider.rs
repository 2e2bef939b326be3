use std::{
    fmt::Debug,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use alloy::{
    consensus::BlockHeader,
    network::{BlockResponse, Ethereum, Network, primitives::HeaderResponse},
    providers::{Provider, RootProvider},
    rpc::types::{Filter, Log},
    transports::{RpcError, TransportErrorKind},
};
use backon::{ExponentialBuilder, Retryable};
use tokio::time::{sleep, timeout};

use crate::{
    log_entry::{BlockRef, LogEntry},
    robust_provider::{Error, LogSubscription},
};

/// Provider wrapper with per-call timeouts, classified retries and endpoint failover.
///
/// Every call is tried against the primary endpoint with exponential backoff, then against each
/// fallback in the order they were added. Only errors classified as transient
/// ([`Error::is_transient`]) are retried on the same endpoint.
#[derive(Clone, Debug)]
pub struct RobustProvider<N: Network = Ethereum> {
    pub(crate) primary_provider: RootProvider<N>,
    pub(crate) fallback_providers: Vec<RootProvider<N>>,
    pub(crate) call_timeout: Duration,
    pub(crate) max_retries: usize,
    pub(crate) min_delay: Duration,
    pub(crate) max_delay: Duration,
}

impl<N: Network> RobustProvider<N> {
    /// Get a reference to the primary provider
    #[must_use]
    pub fn primary(&self) -> &RootProvider<N> {
        &self.primary_provider
    }

    /// Current head height.
    ///
    /// # Errors
    ///
    /// See [retry errors](#retry-errors).
    pub async fn get_block_number(&self) -> Result<u64, Error> {
        trace!("eth_blockNumber called");
        let result = self
            .try_operation_with_failover(
                move |provider| async move { provider.get_block_number().await },
                false,
            )
            .await;
        if let Err(e) = &result {
            error!(error = %e, "eth_blockNumber failed");
        }
        result
    }

    /// Header fields of the canonical block at `number`.
    ///
    /// # Errors
    ///
    /// [`Error::BlockNotFound`] when the node has no block at that height, otherwise see
    /// [retry errors](#retry-errors).
    pub async fn get_block_ref(&self, number: u64) -> Result<BlockRef, Error> {
        trace!(block_number = number, "eth_getBlockByNumber called");
        let result = self
            .try_operation_with_failover(
                move |provider| async move { provider.get_block_by_number(number.into()).await },
                false,
            )
            .await;
        if let Err(e) = &result {
            error!(error = %e, block_number = number, "eth_getBlockByNumber failed");
        }

        let block = result?.ok_or(Error::BlockNotFound(number))?;
        let header = block.header();
        Ok(BlockRef { number: header.number(), hash: header.hash(), parent_hash: header.parent_hash() })
    }

    /// Logs matching `filter`.
    ///
    /// # Errors
    ///
    /// See [retry errors](#retry-errors).
    pub async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, Error> {
        trace!("eth_getLogs called");
        let result = self
            .try_operation_with_failover(
                move |provider| async move { provider.get_logs(filter).await },
                false,
            )
            .await;
        if let Err(e) = &result {
            error!(error = %e, "eth_getLogs failed");
        }
        result
    }

    /// Open a log subscription on the first endpoint that supports pubsub.
    ///
    /// # Errors
    ///
    /// A non-transient [`Error::RpcError`] wrapping `PubsubUnavailable` when no endpoint
    /// supports subscriptions, otherwise see [retry errors](#retry-errors).
    pub async fn subscribe_logs(&self, filter: &Filter) -> Result<LogSubscription<N>, Error> {
        debug!("eth_subscribe called");
        let filter = filter.clone();
        let operation = |provider: RootProvider<N>| {
            let filter = filter.clone();
            async move { provider.subscribe_logs(&filter).await }
        };

        let result = if Self::supports_pubsub(self.primary()) {
            match self.try_provider_with_timeout(self.primary(), &operation).await {
                Ok(sub) => Ok((sub, None)),
                Err(err) => self
                    .try_fallback_providers_from(&operation, true, err, 0)
                    .await
                    .map(|(sub, idx)| (sub, Some(idx))),
            }
        } else {
            let unavailable = RpcError::Transport(TransportErrorKind::PubsubUnavailable).into();
            self.try_fallback_providers_from(&operation, true, unavailable, 0)
                .await
                .map(|(sub, idx)| (sub, Some(idx)))
        };

        match result {
            Ok((sub, fallback_index)) => {
                Ok(LogSubscription::new(sub, self.clone(), filter, fallback_index))
            }
            Err(e) => {
                error!(error = %e, "eth_subscribe failed");
                Err(e)
            }
        }
    }

    /// Whether any configured endpoint can push logs.
    #[must_use]
    pub fn any_supports_pubsub(&self) -> bool {
        std::iter::once(&self.primary_provider)
            .chain(&self.fallback_providers)
            .any(Self::supports_pubsub)
    }

    /// Execute `operation` on the primary provider, then on each fallback until one succeeds.
    ///
    /// If `require_pubsub` is true, fallbacks without pubsub support are skipped.
    ///
    /// # Errors
    /// <a name="retry-errors"></a>
    ///
    /// * [`Error::Timeout`] when the last attempt on the last endpoint timed out.
    /// * [`Error::RateLimited`] when the last endpoint kept throttling.
    /// * [`Error::RpcError`] with the last endpoint's error otherwise.
    pub(crate) async fn try_operation_with_failover<T: Debug, F, Fut>(
        &self,
        operation: F,
        require_pubsub: bool,
    ) -> Result<T, Error>
    where
        F: Fn(RootProvider<N>) -> Fut,
        Fut: Future<Output = Result<T, RpcError<TransportErrorKind>>>,
    {
        match self.try_provider_with_timeout(self.primary(), &operation).await {
            Ok(value) => Ok(value),
            Err(last_error) => self
                .try_fallback_providers_from(&operation, require_pubsub, last_error, 0)
                .await
                .map(|(value, _idx)| value),
        }
    }

    pub(crate) async fn try_fallback_providers_from<T: Debug, F, Fut>(
        &self,
        operation: F,
        require_pubsub: bool,
        mut last_error: Error,
        start_index: usize,
    ) -> Result<(T, usize), Error>
    where
        F: Fn(RootProvider<N>) -> Fut,
        Fut: Future<Output = Result<T, RpcError<TransportErrorKind>>>,
    {
        let num_fallbacks = self.fallback_providers.len();
        if num_fallbacks > 0 && start_index == 0 {
            warn!(error = %last_error, "Primary provider failed, trying fallback provider(s)");
        }

        let fallback_providers = self.fallback_providers.iter().enumerate().skip(start_index);
        for (fallback_idx, provider) in fallback_providers {
            if require_pubsub && !Self::supports_pubsub(provider) {
                debug!(provider_num = fallback_idx + 1, "Fallback provider lacks pubsub, skipping");
                continue;
            }
            debug!(provider_num = fallback_idx + 1, total = num_fallbacks, "Trying fallback provider");

            match self.try_provider_with_timeout(provider, &operation).await {
                Ok(value) => {
                    info!(provider_num = fallback_idx + 1, "Fallback provider succeeded");
                    return Ok((value, fallback_idx));
                }
                Err(e) => {
                    error!(provider_num = fallback_idx + 1, err = %e, "Fallback provider failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Run `operation` against one provider.
    ///
    /// Each attempt gets its own `call_timeout`. Transient failures are retried with jittered
    /// exponential backoff up to `max_retries` times; a rate-limit hint from the node extends
    /// the wait before the next attempt.
    pub(crate) async fn try_provider_with_timeout<T, F, Fut>(
        &self,
        provider: &RootProvider<N>,
        operation: F,
    ) -> Result<T, Error>
    where
        F: Fn(RootProvider<N>) -> Fut,
        Fut: Future<Output = Result<T, RpcError<TransportErrorKind>>>,
    {
        let retry_strategy = ExponentialBuilder::default()
            .with_max_times(self.max_retries)
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_jitter();

        let hint: Mutex<Option<Duration>> = Mutex::new(None);

        let attempt = || async {
            let pending = hint.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(extra) = pending {
                sleep(extra).await;
            }
            timeout(self.call_timeout, operation(provider.clone()))
                .await
                .map_err(Error::from)?
                .map_err(Error::from)
        };

        attempt
            .retry(retry_strategy)
            .sleep(tokio::time::sleep)
            .when(Error::is_transient)
            .notify(|err: &Error, dur: Duration| {
                if let Some(requested) = err.retry_after() {
                    *hint.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(requested.saturating_sub(dur));
                }
                warn!(error = %err, retry_in_ms = dur.as_millis(), "RPC call failed, retrying");
            })
            .await
    }

    /// Check if a provider supports pubsub
    fn supports_pubsub(provider: &RootProvider<N>) -> bool {
        provider.client().pubsub_frontend().is_some()
    }
}
