//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Every port in the configured pool is already assigned.
    AllocationExhausted(String),
    /// A port was claimed by another record between selection and persistence.
    PortConflict(String),
    /// Workspace creation or removal failed.
    Provisioning(String),
    /// The session server process could not be launched.
    Spawn(String),
    /// User identifier is not a non-empty alphanumeric string.
    InvalidUser(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::AllocationExhausted(msg) => write!(f, "allocation exhausted: {msg}"),
            Self::PortConflict(msg) => write!(f, "port conflict: {msg}"),
            Self::Provisioning(msg) => write!(f, "provisioning: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::InvalidUser(msg) => write!(f, "invalid user: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}
