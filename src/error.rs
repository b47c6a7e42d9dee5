use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Magic cookie, version, checksum or file sizes are wrong. The queue is
    /// unusable until it is cleared, recovered or re-created.
    #[error("corrupt queue header in '{path}': {reason}")]
    CorruptHeader { path: PathBuf, reason: String },

    /// A stored entry failed validation. The reader has already moved past it.
    #[error("corrupt message {id}: {reason}")]
    CorruptMessage { id: u32, reason: String },

    #[error("message needs {stored_len} bytes but the buffer only holds {buffer_size}")]
    MessageTooLarge { stored_len: usize, buffer_size: u32 },

    #[error("queue '{0}' does not exist")]
    QueueNotFound(PathBuf),

    #[error("queue '{0}' was opened read-only")]
    ReadOnly(PathBuf),

    /// A blocking write gave up waiting for the reader to consume `unread_id`.
    #[error("timed out waiting for reader to consume message {unread_id}")]
    WriteTimedOut { unread_id: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("message ids exhausted")]
    IdsExhausted,

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("invalid queue configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
