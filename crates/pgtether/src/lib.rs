//! # pgtether
//!
//! Resilient PostgreSQL connectivity for test suites targeting databases
//! that live behind a cluster port-forward.
//!
//! ## Features
//!
//! - **Tunnel Management**: login and pod port-forwarding via the cluster
//!   CLI, with kubeconfig recovery and per-attempt port rotation
//! - **Resilient Queries**: transparent retry with exponential backoff,
//!   rollback and reconnect on transient failures
//! - **Connection Pooling**: a bounded session pool for concurrent callers
//! - **Prepared Statements**: a per-connector registry keyed by statement
//!   text, reset on reconnect
//! - **Batch Inserts**: chunked multi-row inserts with per-chunk commits
//! - **Transactions**: a scoped read-committed transaction block
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pgtether::prelude::*;
//!
//! let config = TargetConfig::from_env(
//!     "registry-db-0", "registry", 5432,
//!     "registry", "tester", "secret",
//! );
//! let db = DbConnector::new(config);
//! db.activate().await?;
//!
//! let row = db.fetch_one(
//!     "SELECT status FROM applications WHERE id = $1",
//!     vec![Value::Int64(42)],
//! ).await?;
//!
//! db.deactivate().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod connector;
pub mod error;
pub mod pool;
pub mod retry;
pub mod session;
pub mod sql;
pub mod tunnel;
pub mod types;

pub use config::{AccessMode, TargetConfig, TunnelSettings};
pub use connector::{DbConnector, QueryOptions, DEFAULT_BATCH_SIZE};
pub use error::{Error, ErrorCategory, Result};
pub use types::{FetchMode, QueryOutput, Row, Value};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{AccessMode, TargetConfig, TunnelSettings};
    pub use crate::connector::{DbConnector, QueryOptions};
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::pool::{PooledSession, SessionPool};
    pub use crate::session::{Endpoint, Session, SessionFactory};
    pub use crate::types::{FetchMode, QueryOutput, Row, Value};
}
