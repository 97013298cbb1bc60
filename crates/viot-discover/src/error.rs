//! Error types for the viot-discover crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoverError {
    #[error("fping not found at path: {path}")]
    FpingNotFound { path: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Config load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("Persistence error: {0}")]
    Persist(#[from] crate::persist::PersistError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] crate::schedule::ScheduleError),
}

pub type Result<T> = std::result::Result<T, DiscoverError>;
