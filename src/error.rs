//! Error types for swarmd

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("spool setup failed: {0}")]
    SpoolSetup(String),

    #[error("watch error: {0}")]
    Watch(String),

    #[error("spawn failed: {command}: {message}")]
    Spawn { command: String, message: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn spawn(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Spawn {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn watch(message: impl Into<String>) -> Self {
        Self::Watch(message.into())
    }
}
