//! Error types for fuzzstudy-store

use thiserror::Error;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),

    /// Required configuration missing or malformed
    #[error("Invalid database configuration: {0}")]
    Config(String),

    /// A row points at a parent row that does not exist
    #[error("{entity} '{key}' references unknown {target}")]
    MissingReference {
        entity: String,
        target: String,
        key: String,
    },

    /// A row that may only be written once already exists
    #[error("Duplicate {entity}: {key}")]
    Duplicate { entity: String, key: String },

    /// Coverage value outside [0, 100] or inconsistent line counts
    #[error("Invalid coverage: {0}")]
    InvalidCoverage(String),

    /// A stored column could not be mapped back onto the domain type
    #[error("Invalid stored value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                StoreError::MissingReference {
                    entity: db.table().unwrap_or("row").to_string(),
                    target: db.constraint().unwrap_or("parent row").to_string(),
                    key: db.message().to_string(),
                }
            }
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate {
                entity: db.table().unwrap_or("row").to_string(),
                key: db.message().to_string(),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                StoreError::Connection(err.to_string())
            }
            _ => StoreError::Query(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_reference_names_entity_and_key() {
        let err = StoreError::MissingReference {
            entity: "build".to_string(),
            target: "project".to_string(),
            key: "b-1".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("build 'b-1'"));
        assert!(msg.contains("unknown project"));
    }

    #[test]
    fn serde_error_maps_to_serialization() {
        let err: StoreError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
