use std::time::Duration;
use thiserror::Error;

use crate::rtp::SessionId;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Session {id} not found")]
    SessionNotFound { id: SessionId },

    #[error("Failed to spawn {program}: {source}")]
    PipelineSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No pipeline process is running")]
    PipelineNotRunning,

    #[error("Snapshot capture timed out after {timeout:?}")]
    CaptureTimeout { timeout: Duration },

    #[error("Snapshot capture failed: {message}")]
    CaptureFailed { message: String },

    #[error("Unsupported {parameter}: {value}")]
    UnsupportedParameter { parameter: &'static str, value: String },

    #[error("{operation} is not implemented")]
    NotImplemented { operation: &'static str },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Relay error: {message}")]
    Relay { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },
}

impl StreamError {
    pub fn session_not_found(id: &SessionId) -> Self {
        Self::SessionNotFound { id: id.clone() }
    }

    pub fn pipeline_spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::PipelineSpawn { program: program.into(), source }
    }

    pub fn unsupported(parameter: &'static str, value: impl std::fmt::Debug) -> Self {
        Self::UnsupportedParameter { parameter, value: format!("{:?}", value) }
    }

    pub fn capture_failed(message: impl Into<String>) -> Self {
        Self::CaptureFailed { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn relay(message: impl Into<String>) -> Self {
        Self::Relay { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
