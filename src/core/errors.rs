// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the control
/// plane and the launcher agent. Using `thiserror` allows for clean error
/// definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum CitrineError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Config Error: {0}")]
    Config(String),

    #[error("NOTLEADER this node is not the leader: {0}")]
    NotLeader(String),

    #[error("Propose timed out after {0:?}")]
    ProposeTimeout(std::time::Duration),

    #[error("{0} is not registered")]
    NotRegistered(String),

    #[error("Mirror store write failed: {0}")]
    MirrorWrite(String),

    #[error("Process launch failed: {0}")]
    Launch(String),

    #[error("Health probe failed: {0}")]
    Health(String),

    #[error("Circuit open for process '{0}': error ceiling reached")]
    CircuitOpen(String),

    #[error("Grace period expired and reap timed out for pid {0}")]
    GraceExpired(u32),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("UNAVAILABLE {0}")]
    Unavailable(String),

    #[error("Protocol Error: {0}")]
    Protocol(String),

    #[error("Raft Error: {0}")]
    Raft(String),

    #[error("HTTP client error: {0}")]
    HttpClientError(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl CitrineError {
    /// Transient errors are requeued by the work queue under a short fixed
    /// delay instead of exponential backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CitrineError::Cancelled(_) | CitrineError::ProposeTimeout(_)
        )
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for CitrineError {
    fn clone(&self) -> Self {
        match self {
            CitrineError::Io(e) => CitrineError::Io(Arc::clone(e)),
            CitrineError::Config(s) => CitrineError::Config(s.clone()),
            CitrineError::NotLeader(s) => CitrineError::NotLeader(s.clone()),
            CitrineError::ProposeTimeout(d) => CitrineError::ProposeTimeout(*d),
            CitrineError::NotRegistered(s) => CitrineError::NotRegistered(s.clone()),
            CitrineError::MirrorWrite(s) => CitrineError::MirrorWrite(s.clone()),
            CitrineError::Launch(s) => CitrineError::Launch(s.clone()),
            CitrineError::Health(s) => CitrineError::Health(s.clone()),
            CitrineError::CircuitOpen(s) => CitrineError::CircuitOpen(s.clone()),
            CitrineError::GraceExpired(pid) => CitrineError::GraceExpired(*pid),
            CitrineError::Cancelled(s) => CitrineError::Cancelled(s.clone()),
            CitrineError::InvalidArgument(s) => CitrineError::InvalidArgument(s.clone()),
            CitrineError::Unavailable(s) => CitrineError::Unavailable(s.clone()),
            CitrineError::Protocol(s) => CitrineError::Protocol(s.clone()),
            CitrineError::Raft(s) => CitrineError::Raft(s.clone()),
            CitrineError::HttpClientError(s) => CitrineError::HttpClientError(s.clone()),
            CitrineError::Internal(s) => CitrineError::Internal(s.clone()),
        }
    }
}

impl PartialEq for CitrineError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CitrineError::Io(e1), CitrineError::Io(e2)) => e1.to_string() == e2.to_string(),
            (CitrineError::Config(s1), CitrineError::Config(s2)) => s1 == s2,
            (CitrineError::NotLeader(s1), CitrineError::NotLeader(s2)) => s1 == s2,
            (CitrineError::NotRegistered(s1), CitrineError::NotRegistered(s2)) => s1 == s2,
            (CitrineError::MirrorWrite(s1), CitrineError::MirrorWrite(s2)) => s1 == s2,
            (CitrineError::Launch(s1), CitrineError::Launch(s2)) => s1 == s2,
            (CitrineError::Health(s1), CitrineError::Health(s2)) => s1 == s2,
            (CitrineError::CircuitOpen(s1), CitrineError::CircuitOpen(s2)) => s1 == s2,
            (CitrineError::GraceExpired(p1), CitrineError::GraceExpired(p2)) => p1 == p2,
            (CitrineError::Cancelled(s1), CitrineError::Cancelled(s2)) => s1 == s2,
            (CitrineError::InvalidArgument(s1), CitrineError::InvalidArgument(s2)) => s1 == s2,
            (CitrineError::Unavailable(s1), CitrineError::Unavailable(s2)) => s1 == s2,
            (CitrineError::Protocol(s1), CitrineError::Protocol(s2)) => s1 == s2,
            (CitrineError::Raft(s1), CitrineError::Raft(s2)) => s1 == s2,
            (CitrineError::HttpClientError(s1), CitrineError::HttpClientError(s2)) => s1 == s2,
            (CitrineError::Internal(s1), CitrineError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for CitrineError {
    fn from(e: std::io::Error) -> Self {
        CitrineError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for CitrineError {
    fn from(e: reqwest::Error) -> Self {
        CitrineError::HttpClientError(e.to_string())
    }
}

impl From<serde_json::Error> for CitrineError {
    fn from(e: serde_json::Error) -> Self {
        CitrineError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<bincode::error::EncodeError> for CitrineError {
    fn from(e: bincode::error::EncodeError) -> Self {
        CitrineError::Protocol(format!("encode error: {e}"))
    }
}

impl From<bincode::error::DecodeError> for CitrineError {
    fn from(e: bincode::error::DecodeError) -> Self {
        CitrineError::Protocol(format!("decode error: {e}"))
    }
}

impl From<rusqlite::Error> for CitrineError {
    fn from(e: rusqlite::Error) -> Self {
        CitrineError::MirrorWrite(e.to_string())
    }
}
