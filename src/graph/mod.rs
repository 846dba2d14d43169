//! Remote directory API plumbing
//!
//! Everything that talks HTTP lives here: the raw transport, the retry
//! policy, batching, pagination and the shared call counters.
//!
//! # Module Structure
//!
//! - [`http`] - single HTTP calls and status classification
//! - [`retry`] - the retry/backoff policy every call goes through
//! - [`client`] - [`ApiClient`], single, optional and batched calls
//! - [`batch`] - `$batch` wire types and response matching
//! - [`pages`] - pagination and delta walking
//! - [`stats`] - run counters
//!
//! # Example
//!
//! ```ignore
//! use siteaudit::graph::{ApiClient, PageWalker, RetryPolicy, RunStats};
//!
//! async fn example(token: &str) -> anyhow::Result<()> {
//!     let stats = std::sync::Arc::new(RunStats::new());
//!     let client = ApiClient::new(
//!         "https://graph.microsoft.com/v1.0",
//!         token,
//!         RetryPolicy::default(),
//!         std::time::Duration::from_secs(30),
//!         stats,
//!     )?;
//!     let sites = PageWalker::new(&client, "/sites?search=*").collect_all().await?;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod client;
pub mod http;
pub mod pages;
pub mod retry;
pub mod stats;

pub use client::ApiClient;
pub use pages::{DeltaEntry, PageWalker};
pub use retry::RetryPolicy;
pub use stats::{RunStats, StatsSnapshot};
