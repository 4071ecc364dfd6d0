//! Source/target reconciliation for ELT pipelines.
//!
//! Finds rows that were loaded into a target store but have since been
//! deleted from the source ("orphans") and removes them from the target.
//!
//! - `timerange`: time-range predicates over timestamp columns
//! - `endpoint`: the [`DataEndpoint`] capability the reconciler runs against
//! - `sql`: PostgreSQL and SQLite endpoints
//! - `pair`: count comparison, orphan discovery and (bisecting) orphan removal
//!
//! ## Usage
//!
//! ```no_run
//! use reconciler::{BisectOptions, ReconciliationPair, TimeRange};
//! use common::config::Configuration;
//!
//! # async fn run() -> Result<(), reconciler::ReconcileError> {
//! let config = Configuration::default();
//! let pair = ReconciliationPair::from_config("app", &config).await?;
//!
//! let removed = pair
//!     .remove_orphans_from_target_with_binary_search(
//!         "orders",
//!         "id",
//!         &TimeRange::all().on(["created_at"]),
//!         &BisectOptions::default(),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod endpoint;
pub mod error;
pub mod key;
pub mod pair;
pub mod row;
pub mod sql;
pub mod statement;
pub mod timerange;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use endpoint::{DataEndpoint, DataEndpointExt};
pub use error::{QueryError, ReconcileError};
pub use key::{KeyValue, OrphanSet};
pub use pair::{BisectOptions, ReconciliationPair};
pub use row::{Row, Value};
pub use sql::{InsertSummary, SqlEndpoint};
pub use statement::Statement;
pub use timerange::{Dialect, Predicate, TimeRange};
