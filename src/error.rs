//! Error types for the worker, supervisor and client roles.
//!
//! Connection-level failures never show up here: the worker event loop
//! handles them in place and only logs them.

use crate::config::ConfigError;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors that end a worker process.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to bind shared listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Invalid worker address: {0}")]
    Config(#[from] ConfigError),

    #[error("Event loop error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the pool manager.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to spawn worker #{id}: {source}")]
    Spawn { id: usize, source: std::io::Error },

    #[error("None of the {target} workers could be started")]
    NoWorkers { target: usize },
}

/// Errors raised by the test client.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("Client error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_bind_error_message() {
        let err = WorkerError::Bind {
            addr: "127.0.0.1:80".parse().unwrap(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:80"));
        assert!(msg.contains("permission denied"));
    }

    #[test]
    fn test_no_workers_message() {
        let err = SupervisorError::NoWorkers { target: 4 };
        assert_eq!(err.to_string(), "None of the 4 workers could be started");
    }

    #[test]
    fn test_connect_error_message() {
        let err = ClientError::Connect {
            addr: "localhost:8000".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
        };
        assert!(err.to_string().starts_with("Failed to connect to localhost:8000"));
    }
}
