use thiserror::Error;

use nocturne_shared::types::FileId;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("File record not found: {0}")]
    NotFound(FileId),

    #[error("File record already exists: {0}")]
    Duplicate(FileId),

    #[error("Store lock poisoned")]
    LockPoisoned,
}
