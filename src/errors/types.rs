//! Error type definitions for the relay worker

use std::path::PathBuf;

use thiserror::Error;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Filesystem errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Pipeline construction or subprocess errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// External service errors
    #[error("External service error: {service} - {message}")]
    ExternalService { service: String, message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors raised while spawning or wiring a generation's subprocesses
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The transcoder could not be started
    #[error("Failed to spawn {role}: {message}")]
    Spawn { role: String, message: String },

    /// A spawned process is missing a piped stdio handle
    #[error("{role} has no {stream} handle")]
    MissingStdio { role: String, stream: &'static str },

    /// An output directory could not be prepared
    #[error("Directory {path:?}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an external service error
    pub fn external_service<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl PipelineError {
    pub fn spawn<R: Into<String>, M: Into<String>>(role: R, message: M) -> Self {
        Self::Spawn {
            role: role.into(),
            message: message.into(),
        }
    }
}
