//! Error handling for taskmaster.
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating a configuration file.
///
/// Worker and service runtime faults are never surfaced as errors; they
/// are logged and absorbed into the worker state machine.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    /// The configuration file exists but could not be read.
    #[error("failed to read configuration file: {0}")]
    Read(#[from] io::Error),

    /// The file is not valid YAML or does not match the schema.
    #[error("invalid configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A field value is outside its permitted range.
    #[error("invalid configuration: {0}")]
    Schema(String),

    /// Two services share the same name.
    #[error("duplicate service name '{0}'")]
    DuplicateName(String),
}

/// Errors raised while building or delivering a notification email.
#[derive(Debug, Error)]
pub enum NotifierError {
    /// A configured address could not be parsed.
    #[error("invalid email address: {0}")]
    Address(#[from] lettre::address::AddressError),

    /// The message itself could not be assembled.
    #[error("failed to build email: {0}")]
    Message(#[from] lettre::error::Error),

    /// The SMTP transport rejected the delivery.
    #[error("failed to send email: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Driver-level errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}
