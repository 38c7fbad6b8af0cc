//! Error types for pgsched

use thiserror::Error;

/// Main error type for pgsched
#[derive(Error, Debug)]
pub enum PgschedError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No node, or no bin-packing, can satisfy the group
    #[error("No capacity: {0}")]
    NoCapacity(String),

    /// A node refused a reservation
    #[error("Reservation denied: {0}")]
    ReservationDenied(String),

    /// A commit was not acknowledged after all reservations were granted
    #[error("Commit failure: {0}")]
    CommitFailure(String),

    /// Node unreachable
    #[error("Transport error: {0}")]
    Transport(String),

    /// A node did not answer in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The group cannot be scheduled as given
    #[error("Invalid placement group: {0}")]
    InvalidGroup(String),

    /// The group already has an attempt in flight
    #[error("Placement group already scheduling: {0}")]
    AlreadyScheduling(String),

    /// The scheduler control loop is gone
    #[error("Scheduler closed")]
    SchedulerClosed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for pgsched operations
pub type PgschedResult<T> = Result<T, PgschedError>;

impl PgschedError {
    /// Whether the error means the reservation should count as denied
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            PgschedError::ReservationDenied(_)
                | PgschedError::Transport(_)
                | PgschedError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for PgschedError {
    fn from(err: serde_json::Error) -> Self {
        PgschedError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for PgschedError {
    fn from(err: toml::de::Error) -> Self {
        PgschedError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PgschedError::NoCapacity("no node fits {CPU: 4}".to_string());
        assert_eq!(err.to_string(), "No capacity: no node fits {CPU: 4}");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PgschedError = io_err.into();
        assert!(matches!(err, PgschedError::Io(_)));
    }

    #[test]
    fn test_denial_classification() {
        assert!(PgschedError::Transport("down".into()).is_denial());
        assert!(PgschedError::Timeout("slow".into()).is_denial());
        assert!(!PgschedError::CommitFailure("x".into()).is_denial());
    }
}
