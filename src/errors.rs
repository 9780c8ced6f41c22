//! Error types for the telemetry bridge

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("invalid node identifier: {0}")]
    NodeIdFormat(String),

    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("credential vault error: {0}")]
    Vault(#[from] crate::vault::VaultError),

    #[error("OPC UA stack error: {0}")]
    Stack(#[from] crate::stack::StackError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("shutdown in progress")]
    ShuttingDown,
}

pub type BridgeResult<T> = Result<T, BridgeError>;
