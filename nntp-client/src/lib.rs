//! Pooled NNTP client for the nzbfs data plane
//!
//! This crate owns everything between a message-id and its decoded payload:
//! the wire protocol (RFC 3977 greeting/AUTHINFO/BODY/STAT/HEAD/QUIT over
//! TCP or TLS), a bounded per-provider connection pool with usage-class
//! admission so playback never queues behind background jobs, per-provider
//! circuit breakers, and a fetcher that orders providers by observed
//! performance and fails over on error.
//!
//! # Example
//!
//! ```no_run
//! use nntp_client::{
//!     ArticleFetcher, ClientConfig, ConnectionPool, MsgId, Provider, ProviderRole, UsageContext,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::new(vec![Provider {
//!     index: 0,
//!     host: "news.example.com".to_string(),
//!     port: 563,
//!     tls: true,
//!     username: Some("user".to_string()),
//!     password: Some("secret".to_string()),
//!     max_connections: 30,
//!     role: ProviderRole::Pool,
//! }]);
//! config.validate()?;
//!
//! let pool = ConnectionPool::new(
//!     config.providers.clone(),
//!     config.admission_limits(),
//!     config.pool_config(),
//! )?;
//! let fetcher = ArticleFetcher::new(pool);
//!
//! let ctx = UsageContext::streaming("some.release");
//! let cancel = CancellationToken::new();
//! let payload = fetcher
//!     .fetch(&MsgId::new("part1of100@example.com"), &ctx, &cancel)
//!     .await?;
//! println!("decoded {} bytes", payload.len());
//! # Ok(())
//! # }
//! ```

mod admission;
mod breaker;
mod check;
mod config;
mod connection;
mod error;
mod fetcher;
mod gate;
mod pool;
mod response;
mod types;

pub use admission::{AdmissionController, AdmissionLimits, ClassPermit};
pub use breaker::CircuitBreaker;
pub use check::CheckOutcome;
pub use config::ClientConfig;
pub use connection::{ConnState, NntpConnection};
pub use error::{Error, ErrorKind, Result};
pub use fetcher::{ArticleFetcher, FetcherConfig};
pub use gate::PlaybackGate;
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use response::Response;
pub use types::{MsgId, Provider, ProviderRole, UsageContext, UsageKind};
