use thiserror::Error;

/// Error type for ingestion, flush and query operations.
#[derive(Error, Debug)]
pub enum DbError {
    /// Series cardinality limit exceeded for the given tenant.
    #[error("Series limit exceeded: current={current}, limit={limit}, tenant={tenant}")]
    SeriesLimitExceeded {
        /// Current number of series for the tenant.
        current: u64,
        /// Configured hard limit.
        limit: u64,
        /// Tenant identifier.
        tenant: String,
    },

    #[error("Out of order sample for series {fingerprint:016x}: timestamp={timestamp}, last={last}")]
    OutOfOrder {
        fingerprint: u64,
        timestamp: i64,
        last: i64,
    },

    #[error("Invalid label selector: {0}")]
    InvalidSelector(String),

    #[error("Malformed profile: {0}")]
    MalformedProfile(String),

    #[error("Head is flushing and no longer accepts profiles")]
    HeadClosed,

    #[error("Invalid time range: start={start}, end={end}")]
    InvalidTimeRange { start: i64, end: i64 },

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Background task error: {0}")]
    BackgroundTaskError(String),

    #[error("Corruption detected: {details}")]
    Corruption {
        details: String,
        block: Option<String>,
        series: Option<u64>,
    },

    #[error("Query cancelled")]
    Cancelled,

    #[error("Query deadline exceeded")]
    DeadlineExceeded,

    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Reason label used for discarded-profile counters. `None` for errors that are not
    /// client-correctable rejections.
    pub fn discard_reason(&self) -> Option<&'static str> {
        match self {
            DbError::SeriesLimitExceeded { .. } => Some("series_limit"),
            DbError::OutOfOrder { .. } => Some("out_of_order"),
            DbError::MalformedProfile(_) => Some("malformed_profile"),
            DbError::InvalidSelector(_) => Some("invalid_selector"),
            DbError::HeadClosed => Some("head_closed"),
            _ => None,
        }
    }

    /// True for client-correctable rejections that must not be retried internally.
    pub fn is_rejection(&self) -> bool {
        self.discard_reason().is_some()
    }

    pub(crate) fn corruption(details: impl Into<String>) -> Self {
        DbError::Corruption {
            details: details.into(),
            block: None,
            series: None,
        }
    }
}

impl From<bincode::Error> for DbError {
    fn from(err: bincode::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DbError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}
