//! Error type for store operations.

use std::fmt;

/// Errors from durable-state operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The database rejected or failed the operation.
    Database { message: String },
    /// A row could not be decoded into its record type.
    Decode { message: String },
    /// The requested row does not exist.
    NotFound { entity: &'static str, id: String },
}

impl StoreError {
    /// Shorthand for a decode failure.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Shorthand for a missing row.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database { message } => write!(f, "database error: {message}"),
            Self::Decode { message } => write!(f, "decode row: {message}"),
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Decode(inner) => Self::Decode {
                message: inner.to_string(),
            },
            other => Self::Database {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = StoreError::not_found("flow run", "flow_123");
        assert_eq!(err.to_string(), "flow run not found: flow_123");
    }

    #[test]
    fn database_display() {
        let err = StoreError::Database {
            message: "connection reset".to_string(),
        };
        assert!(err.to_string().contains("connection reset"));
    }
}
