use thiserror::Error;

/// A malformed configuration entry. Registry build logs these and keeps going.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{entry}: missing required field '{field}'")]
    MissingField { entry: String, field: &'static str },

    #[error("unsupported address family: {0}")]
    UnsupportedFamily(String),

    #[error("invalid {family} address: {address}")]
    InvalidAddress { family: String, address: String },

    #[error("portid {0} out of range (1..=65534)")]
    InvalidPortid(i64),

    #[error("device id {0} out of range")]
    InvalidDevice(i64),

    #[error("invalid management mode: {0}")]
    InvalidMgmtMode(String),

    #[error("duplicate alias: {0}")]
    DuplicateAlias(String),
}

/// Failure talking to a remote endpoint or the local backend.
///
/// Never fatal to the process: the scheduler turns these into tick-based backoff.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("keep alive failed: {0}")]
    KeepAlive(String),

    #[error("log page fetch failed: {0}")]
    Fetch(String),

    #[error("no transport registered for type {0}")]
    Unsupported(String),

    #[error("backend operation '{op}' failed: {reason}")]
    Backend { op: &'static str, reason: String },
}

/// Top-level error type for fleet operations.
#[derive(Error, Debug)]
pub enum DemError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Target not found: {alias}")]
    NotFound { alias: String },

    #[error("Host not found: {alias}")]
    HostNotFound { alias: String },

    #[error("Target already exists: {alias}")]
    AlreadyExists { alias: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DemError {
    pub fn not_found(alias: &str) -> Self {
        Self::NotFound {
            alias: alias.to_string(),
        }
    }

    pub fn host_not_found(alias: &str) -> Self {
        Self::HostNotFound {
            alias: alias.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DemError>;
