use crate::compression::compress_if_smaller;
use crate::constants::DEFAULT_BLOCKED_WRITE_INTERVAL_MS;
use crate::data_buffer::{compute_checksum, encode_entry, stored_len_for};
use crate::error::{Error, Result};
use crate::poll::{poll_until, CancelToken, Heartbeat, PollSettings, Wait};
use crate::queue::Queue;
use crate::slots::{allocate_next, write_slot, Allocation, Slot};
use crate::utils::{now_micros, ring_advance};
use log::{debug, info, warn};
use std::borrow::Cow;
use std::time::Duration;

/// A message to append. Ids are assigned by the queue.
#[derive(Debug, Clone)]
pub struct OutboundMessage<'a> {
    pub msg_type: i32,
    pub subtype: i32,
    /// Microseconds since the epoch, now if unset.
    pub time: Option<u64>,
    pub payload: &'a [u8],
    /// Store compressed if that makes the payload smaller.
    pub compress: bool,
}

impl<'a> OutboundMessage<'a> {
    pub fn new(msg_type: i32, payload: &'a [u8]) -> OutboundMessage<'a> {
        return OutboundMessage {
            msg_type,
            subtype: 0,
            time: None,
            payload,
            compress: false,
        };
    }

    pub fn with_subtype(mut self, subtype: i32) -> OutboundMessage<'a> {
        self.subtype = subtype;
        return self;
    }

    pub fn with_time(mut self, time: u64) -> OutboundMessage<'a> {
        self.time = Some(time);
        return self;
    }

    pub fn with_compression(mut self, compress: bool) -> OutboundMessage<'a> {
        self.compress = compress;
        return self;
    }
}

// what ends up in the slot besides the placement
struct Stored<'a> {
    data: &'a [u8],
    compress: bool,
    msg_len: u32,
    msg_type: i32,
    subtype: i32,
    time: u64,
}

pub struct Writer {
    queue: Queue,
    /// How long a blocked write waits for the canonical reader, `None`
    /// waits until cancelled.
    write_timeout: Option<Duration>,
    blocked_interval: Duration,
    cancel: Option<CancelToken>,
    heartbeat: Option<Heartbeat>,
}

impl Writer {
    pub fn new(queue: Queue) -> Writer {
        return Writer {
            queue,
            write_timeout: None,
            blocked_interval: Duration::from_millis(DEFAULT_BLOCKED_WRITE_INTERVAL_MS),
            cancel: None,
            heartbeat: None,
        };
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    pub fn set_cancel(&mut self, cancel: CancelToken) {
        self.cancel = Some(cancel);
    }

    pub fn set_heartbeat(&mut self, heartbeat: Heartbeat) {
        self.heartbeat = Some(heartbeat);
    }

    pub fn queue(&self) -> &Queue {
        return &self.queue;
    }

    /// Append `msg` and return its id.
    pub fn append(&mut self, msg: &OutboundMessage) -> Result<u32> {
        let msg_len = checked_len(msg.payload.len())?;
        let mut data = Cow::Borrowed(msg.payload);
        let mut compress = false;
        if msg.compress {
            if let Some(compressed) = compress_if_smaller(msg.payload)? {
                debug!(
                    "Compressed {} byte payload to {} bytes",
                    msg.payload.len(),
                    compressed.len()
                );
                data = Cow::Owned(compressed);
                compress = true;
            }
        }

        return self.store(&Stored {
            data: &*data,
            compress,
            msg_len,
            msg_type: msg.msg_type,
            subtype: msg.subtype,
            time: msg.time.unwrap_or_else(now_micros),
        });
    }

    /// Append a payload the producer already compressed with zstd;
    /// `msg.payload` holds the compressed bytes and `msg_len` the length
    /// they expand to.
    pub fn append_precompressed(&mut self, msg: &OutboundMessage, msg_len: u32) -> Result<u32> {
        return self.store(&Stored {
            data: msg.payload,
            compress: true,
            msg_len,
            msg_type: msg.msg_type,
            subtype: msg.subtype,
            time: msg.time.unwrap_or_else(now_micros),
        });
    }

    fn store(&mut self, stored: &Stored) -> Result<u32> {
        let stored_len = stored_len_for(stored.data.len());
        if stored_len > u32::MAX as usize {
            let buffer_size = self.queue.status()?.buffer_size;
            return Err(Error::MessageTooLarge {
                stored_len,
                buffer_size,
            });
        }

        let mut settings =
            PollSettings::new(self.blocked_interval).with_timeout(self.write_timeout);
        settings.cancel = self.cancel.clone();

        let queue = &self.queue;
        let notifier = queue.notifier();
        let mut unread_id = 0;
        let mut reported = false;
        let result = poll_until(
            &notifier,
            &settings,
            self.heartbeat.as_mut(),
            "write blocked on unread message",
            || {
                let outcome = try_store(queue, stored, stored_len as u32)?;
                if let Err(blocked) = outcome {
                    if !reported {
                        info!(
                            "Write to {} blocked until message {} is read",
                            queue.path().display(),
                            blocked
                        );
                        reported = true;
                    }
                    unread_id = blocked;
                    return Ok(None);
                }
                return Ok(outcome.ok());
            },
        )?;

        match result {
            Wait::Ready(id) => return Ok(id),
            Wait::TimedOut => {
                warn!(
                    "Write to {} timed out, message {} still unread",
                    self.queue.path().display(),
                    unread_id
                );
                return Err(Error::WriteTimedOut { unread_id });
            }
        }
    }
}

fn checked_len(len: usize) -> Result<u32> {
    if len > u32::MAX as usize {
        return Err(Error::MessageTooLarge {
            stored_len: stored_len_for(len),
            buffer_size: u32::MAX,
        });
    }
    return Ok(len as u32);
}

// One attempt under the write lock. Ok(Err(id)) when blocked on unread `id`,
// in which case nothing was changed.
fn try_store(
    queue: &Queue,
    stored: &Stored,
    stored_len: u32,
) -> Result<std::result::Result<u32, u32>> {
    let mut guard = queue.lock_for_write()?;
    let mut header = guard.header()?;
    let files = &mut *guard;
    if header.youngest_id == u32::MAX {
        return Err(Error::IdsExhausted);
    }

    let protect = if header.blocking_write {
        Some(header.last_id_read)
    } else {
        None
    };
    let (index, offset) = match allocate_next(&mut header, &mut files.stat, stored_len, protect)? {
        Allocation::Ready { index, offset, .. } => (index, offset),
        Allocation::Blocked { unread_id } => return Ok(Err(unread_id)),
    };

    // entry bytes, then the slot, then the header that advertises them
    let id = header.youngest_id + 1;
    let entry = encode_entry(index, id, stored.data);
    files.buf.write(offset, &entry)?;
    let slot = Slot {
        active: true,
        compress: stored.compress,
        id,
        time: stored.time,
        msg_len: stored.msg_len,
        stored_len,
        offset,
        msg_type: stored.msg_type,
        subtype: stored.subtype,
        checksum: compute_checksum(&entry),
    };
    write_slot(&mut files.stat, index, &slot)?;

    if header.is_empty() {
        header.oldest_slot = index;
        header.end_insert = offset;
    }
    header.youngest_id = id;
    header.youngest_slot = index;
    if header.append_mode {
        let end = offset as u64 + stored_len as u64;
        header.begin_append = end.min(header.buffer_size as u64) as u32;
        if end >= header.buffer_size as u64 {
            debug!("Write head of {} wrapped", queue.path().display());
            header.append_mode = false;
        }
    }
    header.begin_insert = ring_advance(offset, stored_len, header.buffer_size);
    header.commit(&mut files.stat)?;
    queue.committed(files)?;

    return Ok(Ok(id));
}
