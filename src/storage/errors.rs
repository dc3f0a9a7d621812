use thiserror::Error;

/// Errors that can arise while interacting with the mail store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Wrapper around IO errors (directory creation, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Another process (usually a running relay) holds the database lock.
    #[error("mail store at {0} is locked by another process (is `meshmail start` running?)")]
    Locked(String),

    /// A multi-tree transaction gave up without a storage fault.
    #[error("store transaction aborted")]
    Aborted,

    /// The store-wide write lock was poisoned by a panicking writer.
    #[error("store write lock poisoned")]
    Poisoned,
}
