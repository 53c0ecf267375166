use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum GraphError {
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Invalid graph operation: {0}")]
    InvalidOperation(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("Data provider error: {0}")]
    Provider(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
}

impl GraphError {
    /// True when the error signals an abandoned pipeline rather than a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, GraphError::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GraphError::NotFound(_))
    }
}

impl From<toml::de::Error> for GraphError {
    fn from(src: toml::de::Error) -> GraphError {
        GraphError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for GraphError {
    fn from(src: toml::ser::Error) -> GraphError {
        GraphError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for GraphError {
    fn from(src: JsonError) -> GraphError {
        GraphError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<io::Error> for GraphError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => GraphError::NotFound(format!("{x}")),
            _ => GraphError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<JoinError> for GraphError {
    fn from(x: JoinError) -> Self {
        if x.is_cancelled() {
            GraphError::Cancelled
        } else {
            GraphError::Provider(format!("fetch task panicked: {x}"))
        }
    }
}
