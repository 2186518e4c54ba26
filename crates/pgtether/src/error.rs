//! Error types for pgtether
//!
//! Provides granular error classification for proper retry handling:
//! - Retriable errors (connection, deadlock, failed transaction, operational)
//! - Non-retriable errors (query, configuration, tunnel setup/auth)
//!
//! Connection-class errors additionally signal that the tunnel and primary
//! session must be re-established before the next attempt.

use std::fmt;
use thiserror::Error;

/// Result type for pgtether operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-related errors (retriable, trigger reconnect)
    Connection,
    /// Query execution errors (not retriable)
    Query,
    /// Transaction errors
    Transaction,
    /// Deadlock detected (retriable)
    Deadlock,
    /// Statement issued inside an aborted transaction (retriable after rollback)
    FailedTransaction,
    /// Generic operational database error (retriable, trigger reconnect)
    Operational,
    /// Cluster login failure
    Auth,
    /// Port-forward tunnel failure
    Tunnel,
    /// Configuration error (invalid kubeconfig, bad target parameters)
    Configuration,
    /// Pool exhausted or shut down
    Pool,
    /// Batch insert failure
    Batch,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Deadlock | Self::FailedTransaction | Self::Operational
        )
    }

    /// Whether errors in this category require tearing down and
    /// re-establishing the tunnel and primary session before retrying
    #[inline]
    pub const fn needs_reconnect(self) -> bool {
        matches!(self, Self::Connection | Self::Operational)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Query => write!(f, "query"),
            Self::Transaction => write!(f, "transaction"),
            Self::Deadlock => write!(f, "deadlock"),
            Self::FailedTransaction => write!(f, "failed_transaction"),
            Self::Operational => write!(f, "operational"),
            Self::Auth => write!(f, "auth"),
            Self::Tunnel => write!(f, "tunnel"),
            Self::Configuration => write!(f, "configuration"),
            Self::Pool => write!(f, "pool"),
            Self::Batch => write!(f, "batch"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Main error type for pgtether
#[derive(Error, Debug)]
pub enum Error {
    /// Kubeconfig failed structural validation (recovered locally by
    /// backup-and-regenerate during tunnel setup)
    #[error("kubeconfig validation failed: {message}")]
    KubeConfig {
        /// What made the config invalid
        message: String,
    },

    /// Cluster login never succeeded within the retry budget
    #[error("cluster login failed after {attempts} attempts: {message}")]
    TunnelAuth {
        /// Number of login attempts made
        attempts: u32,
        /// Last login failure output
        message: String,
    },

    /// Port-forward process never stabilized within the retry budget
    #[error("port-forward did not stabilize after {attempts} attempts")]
    TunnelSetup {
        /// Number of forwarding attempts made
        attempts: u32,
        /// Local port tried on each attempt
        ports: Vec<u16>,
    },

    /// No free local port found within the probe budget
    #[error("no free local port found after probing {probes} candidates")]
    NoFreePort {
        /// Number of candidate ports probed
        probes: u32,
    },

    /// Connection failed or was lost
    #[error("connection error: {message}")]
    Connection {
        /// Failure description
        message: String,
        /// Underlying driver error, if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Query execution failed (non-transient)
    #[error("query error: {message}")]
    Query {
        /// Failure description
        message: String,
        /// Statement text, if known
        sql: Option<String>,
        /// Underlying driver error, if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Deadlock detected (SQLSTATE 40P01)
    #[error("deadlock detected")]
    Deadlock,

    /// Statement issued inside an aborted transaction (SQLSTATE 25P02)
    #[error("current transaction is aborted")]
    FailedTransaction,

    /// Generic operational database error
    #[error("operational error: {message}")]
    Operational {
        /// Failure description
        message: String,
    },

    /// Retry budget exhausted while executing a statement
    #[error("failed to execute statement after {attempts} attempts: {sql}")]
    QueryExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Statement text (truncated)
        sql: String,
    },

    /// A batch insert chunk failed; chunks before it stay committed
    #[error("batch insert failed on chunk {chunk} ({rows_committed} rows already committed): {message}")]
    BatchInsert {
        /// 1-based index of the failing chunk
        chunk: usize,
        /// Rows committed by earlier chunks
        rows_committed: usize,
        /// Failure description
        message: String,
    },

    /// Transaction control statement failed
    #[error("transaction error: {message}")]
    Transaction {
        /// Failure description
        message: String,
        /// Underlying driver error, if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection pool exhausted or shut down
    #[error("pool exhausted: {message}")]
    PoolExhausted {
        /// Failure description
        message: String,
    },

    /// I/O error (process spawn, config file access)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::KubeConfig { .. } => ErrorCategory::Configuration,
            Self::TunnelAuth { .. } => ErrorCategory::Auth,
            Self::TunnelSetup { .. } | Self::NoFreePort { .. } => ErrorCategory::Tunnel,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } | Self::QueryExhausted { .. } => ErrorCategory::Query,
            Self::Deadlock => ErrorCategory::Deadlock,
            Self::FailedTransaction => ErrorCategory::FailedTransaction,
            Self::Operational { .. } => ErrorCategory::Operational,
            Self::BatchInsert { .. } => ErrorCategory::Batch,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::PoolExhausted { .. } => ErrorCategory::Pool,
            Self::Io(_) => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether this error requires a reconnect before the next attempt
    #[inline]
    pub fn needs_reconnect(&self) -> bool {
        self.category().needs_reconnect()
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create an operational error
    pub fn operational(message: impl Into<String>) -> Self {
        Self::Operational {
            message: message.into(),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }
}
