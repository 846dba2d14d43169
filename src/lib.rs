//! siteaudit - bulk audit of remote directory resources
//!
//! Enumerates every site in a tenant and collects storage, linked-group and
//! permission details for each, with batching, caching, bounded
//! concurrency and resumable progress.

pub mod audit;
pub mod config;
pub mod error;
pub mod graph;
