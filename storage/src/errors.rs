// Error handling framework for the data-access layer

use thiserror::Error;

/// Errors surfaced by the pool, session, repository and migration layers
///
/// Collaborators (HTTP layer etc.) are expected to map these onto their own
/// status taxonomy: `NotFound` -> 404-class, `UniqueConstraintViolation` ->
/// 409-class, `PoolExhausted`/`StoreUnavailable` -> 503-class.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No connection became available within the acquire timeout
    #[error("Connection pool exhausted: no connection available within {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    /// The backing store could not be reached or the pool is shut down
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A connection failed its liveness probe
    ///
    /// The pool recovers from probe failures locally (the connection is
    /// closed and replaced), so it never constructs this variant itself.
    /// Reserved for backends whose probes can report a reason to callers.
    #[error("Connection failed liveness probe: {0}")]
    ConnectionUnhealthy(String),

    /// Operation attempted on a committed or rolled-back session
    ///
    /// This is a programming defect in the caller; it is never swallowed.
    #[error("Session already closed ({state})")]
    SessionAlreadyClosed { state: &'static str },

    /// No row matched the given primary key
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },

    /// A declared unique field collided with an existing or pending row
    #[error("Unique constraint violation on {table}.{field}")]
    UniqueConstraintViolation { table: String, field: String },

    /// Migration applied out of the strict linear chain order
    #[error("Out-of-order migration: cannot apply version {attempted} when current is {current:?}")]
    OutOfOrderMigration { attempted: u32, current: Option<u32> },

    /// Statement referenced a table the schema does not declare
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// A schema change could not be applied
    #[error("Invalid schema change: {0}")]
    InvalidSchemaChange(String),

    /// A stored row could not be decoded into the requested entity type
    #[error("Failed to decode row from {table}: {reason}")]
    Decode { table: String, reason: String },

    /// Entity input could not be encoded into a field map
    #[error("Failed to encode fields for {table}: {reason}")]
    Encode { table: String, reason: String },

    /// Password hashing failed in the service layer
    #[error("Password hashing failed: {0}")]
    PasswordHash(String),
}

impl StoreError {
    /// Whether the error indicates a capacity/availability problem rather
    /// than a caller mistake
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::PoolExhausted { .. } | StoreError::StoreUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_formats() {
        let err = StoreError::PoolExhausted { waited_ms: 100 };
        assert!(err.to_string().contains("100ms"));

        let err = StoreError::UniqueConstraintViolation {
            table: "users".to_string(),
            field: "email".to_string(),
        };
        assert!(err.to_string().contains("users.email"));

        let err = StoreError::OutOfOrderMigration {
            attempted: 3,
            current: Some(1),
        };
        assert!(err.to_string().contains("version 3"));
    }

    #[test]
    fn test_is_unavailable() {
        assert!(StoreError::PoolExhausted { waited_ms: 5 }.is_unavailable());
        assert!(StoreError::StoreUnavailable("down".to_string()).is_unavailable());
        assert!(!StoreError::NotFound {
            entity: "User",
            id: 1
        }
        .is_unavailable());
    }
}
