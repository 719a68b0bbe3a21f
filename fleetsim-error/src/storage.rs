use thiserror::Error;

#[derive(Error, Debug, Default)]
pub enum StorageError {
    #[error("store unavailable")]
    #[default]
    StoreUnavailable,

    #[error("record not found: {0}")]
    EntityNotFound(String),

    /// A stored value could not be encoded or decoded as its record type
    #[error("record codec error for `{key}`: {reason}")]
    Codec { key: String, reason: String },

    /// Reading or writing the on-disk snapshot failed
    #[error("snapshot error: {0}")]
    Snapshot(String),
}
