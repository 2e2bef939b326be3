use std::{pin::Pin, time::Duration};

use alloy::{network::Network, providers::RootProvider};

use crate::robust_provider::{Error, IntoRootProvider, RobustProvider};

type BoxedProviderFuture<N> = Pin<Box<dyn Future<Output = Result<RootProvider<N>, Error>> + Send>>;

/// Default timeout for a single RPC attempt.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: usize = 5;
/// Default delay before the first retry.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(500);
/// Default ceiling for the backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Builder for constructing a [`RobustProvider`].
///
/// Use this to configure timeouts, retry/backoff, and one or more fallback providers.
pub struct RobustProviderBuilder<N: Network, P: IntoRootProvider<N>> {
    primary_provider: P,
    fallback_providers: Vec<BoxedProviderFuture<N>>,
    call_timeout: Duration,
    max_retries: usize,
    min_delay: Duration,
    max_delay: Duration,
}

impl<N: Network, P: IntoRootProvider<N>> RobustProviderBuilder<N, P> {
    /// Start from default settings with `provider` as the primary endpoint.
    #[must_use]
    pub fn new(provider: P) -> Self {
        Self {
            primary_provider: provider,
            fallback_providers: vec![],
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Provider with no retries, only the call timeout.
    #[must_use]
    pub fn fragile(provider: P) -> Self {
        Self::new(provider).max_retries(0).min_delay(Duration::ZERO)
    }

    /// Add a fallback endpoint, tried in insertion order after the primary fails.
    #[must_use]
    pub fn fallback<F: IntoRootProvider<N> + Send + 'static>(mut self, provider: F) -> Self {
        self.fallback_providers.push(Box::pin(provider.into_root_provider()));
        self
    }

    /// Timeout for each individual attempt.
    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Retries after the first attempt on each endpoint.
    #[must_use]
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before the first retry. Later delays grow exponentially.
    #[must_use]
    pub fn min_delay(mut self, min_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self
    }

    /// Upper bound for a single backoff delay.
    #[must_use]
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Connect every endpoint and build the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the providers fail to connect.
    pub async fn build(self) -> Result<RobustProvider<N>, Error> {
        debug!(
            call_timeout_ms = self.call_timeout.as_millis(),
            max_retries = self.max_retries,
            fallback_count = self.fallback_providers.len(),
            "Building RobustProvider"
        );

        let primary_provider = self.primary_provider.into_root_provider().await?;

        let mut fallback_providers = Vec::with_capacity(self.fallback_providers.len());
        for (idx, fallback) in self.fallback_providers.into_iter().enumerate() {
            trace!(fallback_index = idx, "Connecting fallback provider");
            fallback_providers.push(fallback.await?);
        }

        Ok(RobustProvider {
            primary_provider,
            fallback_providers,
            call_timeout: self.call_timeout,
            max_retries: self.max_retries,
            min_delay: self.min_delay,
            max_delay: self.max_delay.max(self.min_delay),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::transports::http::reqwest::Url;

    #[tokio::test]
    async fn collects_fallbacks_of_mixed_types() -> anyhow::Result<()> {
        let primary: RootProvider = RootProvider::new_http("http://localhost:8545".parse()?);
        let url: Url = "http://localhost:8546".parse()?;

        let robust = RobustProviderBuilder::new(primary)
            .fallback(RootProvider::new_http("http://localhost:8547".parse()?))
            .fallback(url)
            .call_timeout(Duration::from_secs(5))
            .build()
            .await?;

        assert_eq!(robust.fallback_providers.len(), 2);
        assert_eq!(robust.call_timeout, Duration::from_secs(5));
        Ok(())
    }

    #[tokio::test]
    async fn fragile_disables_retries() -> anyhow::Result<()> {
        let primary: RootProvider = RootProvider::new_http("http://localhost:8545".parse()?);
        let robust = RobustProviderBuilder::fragile(primary).build().await?;

        assert_eq!(robust.max_retries, 0);
        assert_eq!(robust.min_delay, Duration::ZERO);
        Ok(())
    }
}
