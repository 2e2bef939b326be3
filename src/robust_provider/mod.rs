//! Node access for the poller.
//!
//! [`LogSource`] is the contract the poller is written against: head height, block headers,
//! bounded log queries and, when the transport allows it, pushed logs.
//!
//! [`RobustProvider`] implements it on top of Alloy's
//! [`RootProvider`](alloy::providers::RootProvider) and adds:
//! * a timeout on every attempt
//! * jittered exponential backoff for transient failures, honoring rate-limit hints
//! * ordered failover from the primary endpoint to fallback endpoints
//! * pubsub capability detection, so the poller can pick push or polling mode
//!
//! Errors are classified once, in [`Error::is_transient`]: malformed requests, rejected
//! credentials and unknown methods fail immediately, everything else is retried.
//!
//! # Examples
//!
//! ```rust,no_run
//! use chainsub::robust_provider::{LogSource, RobustProvider, RobustProviderBuilder};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let robust: RobustProvider = RobustProviderBuilder::new("wss://eth.example.org")
//!     .fallback("https://backup.example.org")
//!     .call_timeout(Duration::from_secs(10))
//!     .build()
//!     .await?;
//!
//! println!("head: {}", robust.latest_block().await?);
//! println!("push mode: {}", robust.supports_subscription());
//! # Ok(()) }
//! ```

pub mod builder;
pub mod error;
pub mod provider;
pub mod provider_conversion;
pub mod source;
pub mod subscription;

pub use builder::*;
pub use error::Error;
pub use provider::RobustProvider;
pub use provider_conversion::IntoRootProvider;
pub use source::{LogSource, LogStream};
pub use subscription::{LogSubscription, LogSubscriptionStream};
