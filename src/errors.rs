// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

use crate::session::machine::InvalidTransition;

#[derive(Error, Debug)]
pub enum MultirecError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("Corrupt session record: {0}")]
    CorruptRecord(String),

    #[error("Scheduler is not running")]
    SchedulerClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, MultirecError>;
