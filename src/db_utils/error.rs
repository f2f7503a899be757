use smartstring::{LazyCompact, SmartString};

type String = SmartString<LazyCompact>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    DbError(#[from] mongodb::error::Error),
    #[error("Can't encode document: {0}")]
    EncodeError(#[from] bson::ser::Error),
    #[error("Can't decode document: {0}")]
    DecodeError(#[from] bson::de::Error),
    #[error("{kind} \"{id}\" not found")]
    NotFound { kind: &'static str, id: String },
    #[error("User {user} is not a participant of conversation \"{conversation}\"")]
    NotParticipant { conversation: String, user: i64 },
    #[error("Malformed page cursor \"{0}\"")]
    InvalidCursor(String),
    #[error("Malformed object id \"{0}\"")]
    InvalidId(String),
    #[error("Search query has no terms")]
    EmptySearch,
}

impl Error {
    pub(crate) fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string().into(),
        }
    }
}
