pub mod config;
pub mod db_utils;
pub mod error;

pub use config::Config;
pub use db_utils::{
    ensure_indexes, IndexReport, MemoryStore, MessageStore, MongoStore, Page, PageCursor,
    PageLimits, PageRequest, ValidateMode,
};
