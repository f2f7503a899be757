pub mod cursor;
mod db;
pub mod error;
pub mod indexes;
pub mod memory;
pub mod models;
pub mod query;
pub mod stats;
pub mod store;
pub mod text;
pub mod validate;

pub use cursor::{Page, PageCursor, PageLimits, PageRequest};
pub use memory::MemoryStore;
pub use stats::message_stat;
pub use store::{MessageStore, MongoStore};
pub use validate::{ensure_indexes, IndexReport, ValidateMode};

pub const DEFAULT_DB_NAME: &str = "chat-db";
pub(crate) const MESSAGES_COLLECTION_NAME: &str = "messages";
pub(crate) const CONVERSATIONS_COLLECTION_NAME: &str = "conversations";
