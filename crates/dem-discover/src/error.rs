//! Error types for the dem-discover crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoverError {
    #[error(transparent)]
    Dem(#[from] dem_core::DemError),

    #[error("No viable interfaces ({skipped} skipped)")]
    NoViableInterfaces { skipped: usize },

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<dem_core::TransportError> for DiscoverError {
    fn from(e: dem_core::TransportError) -> Self {
        Self::Dem(e.into())
    }
}

pub type Result<T> = std::result::Result<T, DiscoverError>;
