pub mod files;
pub mod models;

mod error;

pub use error::{Result, StoreError};
pub use files::{FileStore, MemoryStore};
pub use models::{FileDirection, FileRecord, FileState};
