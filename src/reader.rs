use crate::compression::decompress;
use crate::data_buffer::decode_entry;
use crate::error::{Error, Result};
use crate::poll::{poll_until, CancelToken, Heartbeat, PollSettings, Wait};
use crate::queue::{cursor_path, Queue};
use crate::slots::{lookup, read_slot, Lookup};
use crate::utils::compute_crc32;
use log::{debug, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

// cursor file: u64 queue uid, u32 last id read, u32 crc of the first 12 bytes
const CURSOR_FILE_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u32,
    pub time: u64,
    pub msg_type: i32,
    pub subtype: i32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Message(Message),
    /// Nothing new and the call did not wait.
    NoData,
    /// Nothing new before the wait ran out.
    TimedOut,
    /// Messages after the cursor were evicted before this reader got to
    /// them. `skipped` ids are gone and the next read delivers `resume_from`.
    /// Also returned with `skipped` counting only ids lost in the new queue
    /// when the queue was re-created underneath the reader.
    DataLoss { skipped: u32, resume_from: u32 },
}

/// Where a reader keeps its cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorMode {
    /// In memory only.
    Detached,
    /// In the status header's `last_id_read`, the cursor blocking writes
    /// wait for.
    Canonical,
    /// In a file next to the queue, `<path>.cursor.<name>`.
    Persistent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPosition {
    /// Before the oldest live message.
    Start,
    /// After the youngest message, only new writes will be read.
    End,
    /// Before the youngest message, so it is read next.
    Last,
    /// Back by one message.
    Back,
}

struct Cursor {
    queue: Queue,
    mode: CursorMode,
    file: Option<PathBuf>,
    /// Last id delivered or skipped.
    last_read: u32,
    /// Queue the cursor refers to, bound on first use.
    queue_uid: Option<u64>,
    // what was last written out, (uid, id)
    saved: Option<(u64, u32)>,
}

pub struct Reader {
    cursor: Cursor,
    poll: PollSettings,
    heartbeat: Option<Heartbeat>,
}

fn check_cursor_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidConfig(format!(
            "'{}' cannot be used as a cursor name",
            name
        )));
    }
    return Ok(());
}

fn load_cursor(path: &Path) -> Result<Option<(u64, u32)>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if bytes.len() != CURSOR_FILE_SIZE {
        warn!("Ignoring cursor file {} of {} bytes", path.display(), bytes.len());
        return Ok(None);
    }

    let mut uid = [0u8; 8];
    uid.copy_from_slice(&bytes[0..8]);
    let id = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let crc = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
    if crc != compute_crc32(&bytes[0..12]) {
        warn!("Ignoring cursor file {} with bad checksum", path.display());
        return Ok(None);
    }
    return Ok(Some((u64::from_be_bytes(uid), id)));
}

// written beside the real file and renamed over it
fn save_cursor(path: &Path, uid: u64, id: u32) -> Result<()> {
    let mut bytes = Vec::with_capacity(CURSOR_FILE_SIZE);
    bytes.extend_from_slice(&uid.to_be_bytes());
    bytes.extend_from_slice(&id.to_be_bytes());
    let crc = compute_crc32(&bytes);
    bytes.extend_from_slice(&crc.to_be_bytes());

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)?;
    return Ok(());
}

impl Cursor {
    // Find the message after the cursor. Ok(None) when there is nothing new.
    fn fetch(&mut self, msg_type: Option<i32>) -> Result<Option<ReadOutcome>> {
        let mut files = self.queue.files();
        loop {
            // remaps if the queue was re-created at another size
            let header = self.queue.read_header(&mut files, false)?;
            match self.queue_uid {
                None => self.queue_uid = Some(header.queue_uid),
                Some(uid) if uid != header.queue_uid => {
                    let resume_from = if header.is_empty() {
                        header.youngest_id.saturating_add(1)
                    } else {
                        header.oldest_id()
                    };
                    warn!(
                        "Queue {} was re-created, reader resumes at {}",
                        self.queue.path().display(),
                        resume_from
                    );
                    self.queue_uid = Some(header.queue_uid);
                    self.last_read = resume_from - 1;
                    return Ok(Some(ReadOutcome::DataLoss {
                        skipped: resume_from - 1,
                        resume_from,
                    }));
                }
                Some(_) => {}
            }

            if self.last_read >= header.youngest_id {
                return Ok(None);
            }
            let want = self.last_read + 1;
            let (index, slot) = match lookup(&header, &files.stat, want) {
                Ok(Lookup::Found { index, slot }) => (index, slot),
                Ok(Lookup::Evicted { oldest_id }) => {
                    let skipped = oldest_id - want;
                    warn!(
                        "Reader of {} lost {} message(s), resuming at {}",
                        self.queue.path().display(),
                        skipped,
                        oldest_id
                    );
                    self.last_read = oldest_id - 1;
                    return Ok(Some(ReadOutcome::DataLoss {
                        skipped,
                        resume_from: oldest_id,
                    }));
                }
                Ok(Lookup::NotYetWritten) => return Ok(None),
                Err(Error::CorruptMessage { reason, .. }) => {
                    self.last_read = want;
                    return Err(Error::CorruptMessage { id: want, reason });
                }
                Err(e) => return Err(e),
            };

            let entry = files.buf.read(slot.offset, slot.stored_len);
            // a writer may have reused the slot while we copied
            match read_slot(&files.stat, header.n_slots, index) {
                Ok(again) if again == slot => {}
                _ => {
                    debug!("Slot {} changed during read of id {}, retrying", index, want);
                    continue;
                }
            }

            let payload = entry
                .map_err(|e| Error::CorruptMessage {
                    id: want,
                    reason: e.to_string(),
                })
                .and_then(|entry| {
                    let data = decode_entry(&entry, &slot, index)?;
                    if slot.compress {
                        return decompress(data, slot.msg_len, want);
                    }
                    if data.len() != slot.msg_len as usize {
                        return Err(Error::CorruptMessage {
                            id: want,
                            reason: format!(
                                "{} bytes stored, slot says {}",
                                data.len(),
                                slot.msg_len
                            ),
                        });
                    }
                    return Ok(data.to_vec());
                });
            self.last_read = want;
            let payload = match payload {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Skipping message in {}: {}", self.queue.path().display(), e);
                    return Err(e);
                }
            };

            if let Some(wanted_type) = msg_type {
                if slot.msg_type != wanted_type {
                    continue;
                }
            }
            return Ok(Some(ReadOutcome::Message(Message {
                id: want,
                time: slot.time,
                msg_type: slot.msg_type,
                subtype: slot.subtype,
                payload,
            })));
        }
    }

    fn save(&mut self) -> Result<()> {
        let current = (self.queue_uid.unwrap_or(0), self.last_read);
        if self.saved == Some(current) {
            return Ok(());
        }
        match &self.mode {
            CursorMode::Detached => {}
            CursorMode::Canonical => {
                let mut guard = self.queue.lock_for_write()?;
                let mut header = guard.header()?;
                let files = &mut *guard;
                if header.queue_uid == current.0 {
                    header.last_id_read = self.last_read;
                    header.commit(&mut files.stat)?;
                    self.queue.committed(files)?;
                }
            }
            CursorMode::Persistent(_) => {
                if let Some(file) = &self.file {
                    save_cursor(file, current.0, current.1)?;
                }
            }
        }
        self.saved = Some(current);
        return Ok(());
    }

    // Keep the move only if it could be saved, a caller that gets an error
    // must see the same messages again on the next call.
    fn save_or_restore(&mut self, before: (u32, Option<u64>)) -> Result<()> {
        if let Err(e) = self.save() {
            warn!(
                "Could not save cursor for {}, keeping it at {}: {}",
                self.queue.path().display(),
                before.0,
                e
            );
            self.last_read = before.0;
            self.queue_uid = before.1;
            return Err(e);
        }
        return Ok(());
    }

    fn try_next(&mut self, msg_type: Option<i32>) -> Result<Option<ReadOutcome>> {
        let before = (self.last_read, self.queue_uid);
        let result = self.fetch(msg_type);
        // the cursor moves on corrupt messages too
        self.save_or_restore(before)?;
        return result;
    }
}

impl Reader {
    /// A reader with an in-memory cursor starting before id 1.
    pub fn detached(queue: Queue) -> Reader {
        let poll = PollSettings::new(queue.options().poll_interval);
        return Reader {
            cursor: Cursor {
                queue,
                mode: CursorMode::Detached,
                file: None,
                last_read: 0,
                queue_uid: None,
                saved: None,
            },
            poll,
            heartbeat: None,
        };
    }

    /// A reader using `mode`, resuming from the stored cursor for canonical
    /// and persistent readers.
    pub fn open(queue: Queue, mode: CursorMode) -> Result<Reader> {
        let mut reader = Reader::detached(queue);
        let cursor = &mut reader.cursor;
        match &mode {
            CursorMode::Detached => {}
            CursorMode::Canonical => {
                if !cursor.queue.is_writable() {
                    return Err(Error::ReadOnly(cursor.queue.path().to_path_buf()));
                }
                let header = cursor.queue.status()?;
                cursor.last_read = header.last_id_read;
                cursor.queue_uid = Some(header.queue_uid);
                cursor.saved = Some((header.queue_uid, header.last_id_read));
            }
            CursorMode::Persistent(name) => {
                check_cursor_name(name)?;
                let file = cursor_path(cursor.queue.path(), name);
                if let Some((uid, id)) = load_cursor(&file)? {
                    info!("Reader {} resumes after id {}", name, id);
                    cursor.last_read = id;
                    cursor.queue_uid = Some(uid);
                    cursor.saved = Some((uid, id));
                }
                cursor.file = Some(file);
            }
        }
        cursor.mode = mode;
        return Ok(reader);
    }

    pub fn mode(&self) -> &CursorMode {
        return &self.cursor.mode;
    }

    /// Last id delivered or skipped, 0 before the first read.
    pub fn last_read(&self) -> u32 {
        return self.cursor.last_read;
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll.interval = interval;
    }

    pub fn set_cancel(&mut self, cancel: CancelToken) {
        self.poll.cancel = Some(cancel);
    }

    pub fn set_heartbeat(&mut self, heartbeat: Heartbeat) {
        self.heartbeat = Some(heartbeat);
    }

    /// Read the next message. With `wait` unset returns `NoData` at once
    /// when there is nothing new, otherwise waits up to `wait` and returns
    /// `TimedOut`.
    pub fn next(&mut self, wait: Option<Duration>) -> Result<ReadOutcome> {
        return self.read(None, wait);
    }

    /// Like `next`, skipping messages whose type is not `msg_type`.
    pub fn next_of_type(&mut self, msg_type: i32, wait: Option<Duration>) -> Result<ReadOutcome> {
        return self.read(Some(msg_type), wait);
    }

    /// Wait as long as it takes, until cancelled.
    pub fn next_blocking(&mut self) -> Result<ReadOutcome> {
        return self.wait_for(None, None);
    }

    fn read(&mut self, msg_type: Option<i32>, wait: Option<Duration>) -> Result<ReadOutcome> {
        match wait {
            None => {
                let outcome = self.cursor.try_next(msg_type)?;
                return Ok(outcome.unwrap_or(ReadOutcome::NoData));
            }
            Some(timeout) => return self.wait_for(msg_type, Some(timeout)),
        }
    }

    fn wait_for(&mut self, msg_type: Option<i32>, timeout: Option<Duration>) -> Result<ReadOutcome> {
        let settings = self.poll.clone().with_timeout(timeout);
        let notifier = self.cursor.queue.notifier();
        let cursor = &mut self.cursor;
        let waited = poll_until(
            &notifier,
            &settings,
            self.heartbeat.as_mut(),
            "waiting for data",
            || cursor.try_next(msg_type),
        )?;
        match waited {
            Wait::Ready(outcome) => return Ok(outcome),
            Wait::TimedOut => return Ok(ReadOutcome::TimedOut),
        }
    }

    /// Move the cursor. Writers are not affected, except that a canonical
    /// reader moving back protects the messages after its new position.
    pub fn seek(&mut self, position: SeekPosition) -> Result<()> {
        let header = self.cursor.queue.status()?;
        let first = if header.is_empty() {
            header.youngest_id
        } else {
            header.oldest_id() - 1
        };

        let cursor = &mut self.cursor;
        let before = (cursor.last_read, cursor.queue_uid);
        cursor.queue_uid = Some(header.queue_uid);
        cursor.last_read = match position {
            SeekPosition::Start => first,
            SeekPosition::End => header.youngest_id,
            SeekPosition::Last => header.youngest_id.saturating_sub(1).max(first),
            SeekPosition::Back => cursor
                .last_read
                .saturating_sub(1)
                .max(first)
                .min(header.youngest_id),
        };
        debug!("Seek {:?}, next id {}", position, cursor.last_read as u64 + 1);
        return cursor.save_or_restore(before);
    }

    /// Position the cursor on `id` so the next read delivers the message
    /// after it. Returns false, leaving the cursor alone, when `id` is
    /// neither live nor just before the oldest live message.
    pub fn seek_to_id(&mut self, id: u32) -> Result<bool> {
        let header = self.cursor.queue.status()?;
        let first = if header.is_empty() {
            header.youngest_id
        } else {
            header.oldest_id() - 1
        };
        if id < first || id > header.youngest_id {
            return Ok(false);
        }

        let before = (self.cursor.last_read, self.cursor.queue_uid);
        self.cursor.queue_uid = Some(header.queue_uid);
        self.cursor.last_read = id;
        self.cursor.save_or_restore(before)?;
        return Ok(true);
    }
}
