//! Audit pipeline
//!
//! Discovers every resource in the tenant, expands each into a
//! [`ResourceDetail`] under bounded concurrency and keeps resumable
//! progress on disk.
//!
//! # Module Structure
//!
//! - [`model`] - resources, principals, grants and detail records
//! - [`cache`] - per-run memoization with confirmed-absent entries
//! - [`exclusion`] - glob exclusion patterns
//! - [`discovery`] - enumeration strategies and merging
//! - [`expander`] - the Detail Expander
//! - [`scheduler`] - bounded fan-out with failure isolation
//! - [`memory`] - resident-memory probe
//! - [`checkpoint`] - resumable progress
//! - [`summary`] - tenant rollup
//! - [`pipeline`] - orchestration and [`RunReport`]
//!
//! # Example
//!
//! ```ignore
//! use siteaudit::audit::Pipeline;
//! use siteaudit::config::AuditConfig;
//!
//! async fn example(token: &str) -> anyhow::Result<()> {
//!     let cancel = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
//!     let pipeline = Pipeline::new(AuditConfig::default(), token, cancel)?;
//!     let report = pipeline.run().await?;
//!     println!("{} resources, {} errored", report.details.len(), report.errored);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod checkpoint;
pub mod discovery;
pub mod exclusion;
pub mod expander;
pub mod memory;
pub mod model;
pub mod pipeline;
pub mod scheduler;
pub mod summary;

pub use cache::{AuditCache, CacheEntry, ResultCache};
pub use checkpoint::{CheckpointManager, CheckpointState};
pub use discovery::{discover, DiscoveryOptions, Strategy};
pub use expander::DetailExpander;
pub use model::{Principal, PrincipalType, Resource, ResourceDetail};
pub use pipeline::{Pipeline, RunReport};
pub use scheduler::{Scheduler, SchedulerOptions};
pub use summary::TenantSummary;
