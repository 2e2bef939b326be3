use alloy::{
    network::{Ethereum, Network},
    providers::RootProvider,
    transports::http::reqwest::Url,
};

use crate::robust_provider::Error;

/// Endpoints a [`RobustProviderBuilder`](super::RobustProviderBuilder) accepts: parsed URLs,
/// URL strings, or an already connected [`RootProvider`].
///
/// `ws` and `wss` URLs open a pubsub connection, `http` and `https` ones a request-response
/// client.
pub trait IntoRootProvider<N: Network = Ethereum> {
    fn into_root_provider(self) -> impl Future<Output = Result<RootProvider<N>, Error>> + Send;
}

impl<N: Network> IntoRootProvider<N> for RootProvider<N> {
    async fn into_root_provider(self) -> Result<RootProvider<N>, Error> {
        Ok(self)
    }
}

impl<N: Network> IntoRootProvider<N> for Url {
    async fn into_root_provider(self) -> Result<RootProvider<N>, Error> {
        Ok(RootProvider::connect(self.as_str()).await?)
    }
}

impl<N: Network> IntoRootProvider<N> for &str {
    async fn into_root_provider(self) -> Result<RootProvider<N>, Error> {
        Ok(RootProvider::connect(self).await?)
    }
}

impl<N: Network> IntoRootProvider<N> for String {
    async fn into_root_provider(self) -> Result<RootProvider<N>, Error> {
        Ok(RootProvider::connect(&self).await?)
    }
}
