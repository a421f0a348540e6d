//! Error handling module
//!
//! Provides the unified error type for manifest loading, dependency
//! resolution and dump emission.

use thiserror::Error;

/// Boxed error returned by the database collaborators
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Catalog lookup that failed during introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaPhase {
    Columns,
    ForeignKeys,
}

impl std::fmt::Display for SchemaPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaPhase::Columns => write!(f, "columns"),
            SchemaPhase::ForeignKeys => write!(f, "foreign keys"),
        }
    }
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum DumpError {
    #[error("Schema error: failed to read {phase} of table {table}: {source}")]
    Schema {
        table: String,
        phase: SchemaPhase,
        #[source]
        source: BoxError,
    },

    #[error("Stream error: failed to copy rows of table {table}: {source}")]
    Stream {
        table: String,
        #[source]
        source: BoxError,
    },

    #[error("Template error: failed to render query of table {table}: {message}")]
    Template { table: String, message: String },

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("Output error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for dump operations
pub type DumpResult<T> = Result<T, DumpError>;

/// Helper function to create a manifest error
pub fn manifest_error(msg: impl Into<String>) -> DumpError {
    DumpError::Manifest(msg.into())
}

/// Helper function to create a connection error
pub fn connection_error(msg: impl Into<String>) -> DumpError {
    DumpError::Connection(msg.into())
}
