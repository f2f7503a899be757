use crate::config::ConfigError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    DbError(#[from] crate::db_utils::error::Error),
    #[error("{0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("Can't init logger from {path}: {reason}")]
    Logger { path: String, reason: String },
    #[error("{0}")]
    SetLogger(#[from] log::SetLoggerError),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown argument \"{0}\". Usage: chat-store-init [--check] [--print-indexes]")]
    Usage(String),
    #[error("{0} catalogued indexes are missing")]
    MissingIndexes(usize),
}
