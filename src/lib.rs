mod compression;
mod config;
mod constants;
mod data_buffer;
mod error;
mod mapped_file;
mod poll;
mod queue;
mod reader;
mod slots;
mod status;
mod utils;
mod writer;

pub use crate::compression::{compress, decompress};
pub use crate::config::{ConfigError, QueueConfig};
pub use crate::error::{Error, Result};
pub use crate::poll::{CancelToken, Heartbeat, PollSettings};
pub use crate::queue::{
    buf_path, cursor_path, exists, stat_path, OpenMode, Queue, QueueOptions, RecoveryPolicy, Usage,
};
pub use crate::reader::{CursorMode, Message, ReadOutcome, Reader, SeekPosition};
pub use crate::slots::Slot;
pub use crate::status::StatusHeader;
pub use crate::writer::{OutboundMessage, Writer};
