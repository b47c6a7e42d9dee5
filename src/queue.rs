use crate::constants::{
    BUF_SUFFIX, CURSOR_SUFFIX, DEFAULT_BUFFER_SIZE, DEFAULT_N_SLOTS, DEFAULT_POLL_INTERVAL_MS,
    ENTRY_OVERHEAD, SLOT_SIZE, STATUS_HEADER_SIZE, STAT_MAGIC, STAT_SUFFIX,
};
use crate::data_buffer::{decode_entry, DataBuffer};
use crate::error::{Error, Result};
use crate::mapped_file::MappedFile;
use crate::poll::{poll_until, Heartbeat, Notifier, PollSettings, Wait};
use crate::reader::{CursorMode, Reader};
use crate::slots::{read_slot, read_slot_unchecked, write_slot, Slot};
use crate::status::StatusHeader;
use crate::utils::{next_slot, prev_slot, ring_advance};
use crate::writer::Writer;
use log::{debug, info, warn};
use serde::Deserialize;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// What `Queue::open_or_create` does with a queue that fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPolicy {
    Fail,
    Clear,
    Recover,
}

/// Geometry for new queues plus per-handle behaviour. `n_slots`,
/// `buffer_size` and `blocking_write` only matter when a queue is created,
/// an existing queue keeps what its header says.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    pub n_slots: u32,
    pub buffer_size: u32,
    pub blocking_write: bool,
    /// Skip the advisory lock, for deployments that guarantee one writer.
    pub single_writer: bool,
    /// msync both files after every commit.
    pub sync_on_commit: bool,
    pub poll_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> QueueOptions {
        return QueueOptions {
            n_slots: DEFAULT_N_SLOTS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            blocking_write: false,
            single_writer: false,
            sync_on_commit: false,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        };
    }
}

impl QueueOptions {
    pub fn new(n_slots: u32, buffer_size: u32) -> QueueOptions {
        return QueueOptions {
            n_slots,
            buffer_size,
            ..QueueOptions::default()
        };
    }

    pub fn blocking(mut self, blocking_write: bool) -> QueueOptions {
        self.blocking_write = blocking_write;
        return self;
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_slots == 0 {
            return Err(Error::InvalidConfig("n_slots must be at least 1".to_string()));
        }
        let max_slots = (u32::MAX as usize - STATUS_HEADER_SIZE) / SLOT_SIZE;
        if self.n_slots as usize > max_slots {
            return Err(Error::InvalidConfig(format!(
                "n_slots {} exceeds the maximum of {}",
                self.n_slots, max_slots
            )));
        }
        if (self.buffer_size as usize) < ENTRY_OVERHEAD {
            return Err(Error::InvalidConfig(format!(
                "buffer_size {} cannot hold a single entry ({} bytes of framing)",
                self.buffer_size, ENTRY_OVERHEAD
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll interval must be non-zero".to_string()));
        }
        return Ok(());
    }
}

/// Occupancy snapshot, see `Queue::usage`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
    pub n_slots: u32,
    pub buffer_size: u32,
    pub active_slots: u32,
    pub active_bytes: u32,
    pub youngest_id: u32,
    /// 0 when nothing is live.
    pub oldest_id: u32,
}

impl Usage {
    pub fn slot_fraction(&self) -> f64 {
        return self.active_slots as f64 / self.n_slots as f64;
    }

    pub fn byte_fraction(&self) -> f64 {
        return self.active_bytes as f64 / self.buffer_size as f64;
    }

    /// The larger of the slot and byte fractions, how close the next write
    /// is to evicting something.
    pub fn fraction_used(&self) -> f64 {
        return self.slot_fraction().max(self.byte_fraction());
    }
}

pub(crate) struct QueueFiles {
    pub(crate) stat: MappedFile,
    pub(crate) buf: DataBuffer,
}

struct Shared {
    path: PathBuf,
    files: Mutex<QueueFiles>,
    notifier: Arc<Notifier>,
    options: QueueOptions,
    writable: bool,
}

/// Handle to an open queue. Clones share the mapped files, writers and
/// readers made from clones of one handle wake each other without waiting
/// out the poll interval.
#[derive(Clone)]
pub struct Queue {
    shared: Arc<Shared>,
}

/// In-process mutex plus the cross-process advisory lock on the stat file,
/// held for one allocate, write and commit sequence.
pub(crate) struct WriteGuard<'a> {
    queue: &'a Queue,
    files: MutexGuard<'a, QueueFiles>,
    flocked: bool,
}

impl<'a> WriteGuard<'a> {
    /// Current header, remapping first if the queue changed on disk. The
    /// lock moves to the new stat file.
    pub(crate) fn header(&mut self) -> Result<StatusHeader> {
        return self.queue.read_header(&mut self.files, self.flocked);
    }
}

impl<'a> Deref for WriteGuard<'a> {
    type Target = QueueFiles;

    fn deref(&self) -> &QueueFiles {
        return &self.files;
    }
}

impl<'a> DerefMut for WriteGuard<'a> {
    fn deref_mut(&mut self) -> &mut QueueFiles {
        return &mut self.files;
    }
}

impl<'a> Drop for WriteGuard<'a> {
    fn drop(&mut self) {
        if self.flocked {
            if let Err(e) = self.files.stat.unlock() {
                warn!("Failed to unlock {}: {}", self.files.stat.path().display(), e);
            }
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    return PathBuf::from(name);
}

pub fn stat_path(path: &Path) -> PathBuf {
    return with_suffix(path, STAT_SUFFIX);
}

pub fn buf_path(path: &Path) -> PathBuf {
    return with_suffix(path, BUF_SUFFIX);
}

pub fn cursor_path(path: &Path, name: &str) -> PathBuf {
    return with_suffix(path, &format!("{}.{}", CURSOR_SUFFIX, name));
}

pub fn exists(path: &Path) -> bool {
    return stat_path(path).is_file() && buf_path(path).is_file();
}

// (n_slots, buffer_size) implied by the file lengths alone
fn geometry(stat: &MappedFile, buf: &MappedFile) -> Option<(u32, u32)> {
    if stat.len() < STATUS_HEADER_SIZE + SLOT_SIZE || buf.len() > u32::MAX as usize {
        return None;
    }
    let slot_bytes = stat.len() - STATUS_HEADER_SIZE;
    if slot_bytes % SLOT_SIZE != 0 || buf.len() < ENTRY_OVERHEAD {
        return None;
    }
    return Some(((slot_bytes / SLOT_SIZE) as u32, buf.len() as u32));
}

// every slot inactive, then the header
fn initialize(header: &mut StatusHeader, stat: &mut MappedFile) -> Result<()> {
    let empty = Slot::default();
    for index in 0..header.n_slots {
        write_slot(stat, index, &empty)?;
    }
    header.commit(stat)?;
    return Ok(());
}

fn entry_is_valid(buf: &DataBuffer, index: u32, slot: &Slot) -> bool {
    if !slot.active || slot.offset >= buf.size() || slot.stored_len > buf.size() {
        return false;
    }
    return match buf.read(slot.offset, slot.stored_len) {
        Ok(entry) => decode_entry(&entry, slot, index).is_ok(),
        Err(_) => false,
    };
}

impl Queue {
    fn from_parts(
        path: &Path,
        stat: MappedFile,
        buf: MappedFile,
        options: QueueOptions,
        writable: bool,
    ) -> Queue {
        return Queue {
            shared: Arc::new(Shared {
                path: path.to_path_buf(),
                files: Mutex::new(QueueFiles {
                    stat,
                    buf: DataBuffer::new(buf),
                }),
                notifier: Arc::new(Notifier::default()),
                options,
                writable,
            }),
        };
    }

    /// Create a new empty queue at `path`, replacing any queue already there.
    pub fn create(path: impl AsRef<Path>, options: QueueOptions) -> Result<Queue> {
        let path = path.as_ref();
        options.validate()?;

        let mut header =
            StatusHeader::new(options.n_slots, options.buffer_size, options.blocking_write);
        // both files are resized under the lock, never truncated to zero
        let mut stat = if options.single_writer {
            MappedFile::create(&stat_path(path), header.stat_file_size())?
        } else {
            MappedFile::create_locked(&stat_path(path), header.stat_file_size())?
        };
        let buf = MappedFile::create(&buf_path(path), options.buffer_size as usize)?;

        let result = initialize(&mut header, &mut stat);
        if !options.single_writer {
            stat.unlock()?;
        }
        result?;
        if options.sync_on_commit {
            stat.flush()?;
        }

        info!(
            "Created queue {} with {} slots and a {} byte buffer (blocking write {})",
            path.display(),
            options.n_slots,
            options.buffer_size,
            options.blocking_write
        );
        return Ok(Queue::from_parts(path, stat, buf, options, true));
    }

    /// Open an existing queue, validating the header and file sizes.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode, options: QueueOptions) -> Result<Queue> {
        let path = path.as_ref();
        let queue = Queue::open_unvalidated(path, mode, options)?;
        {
            let files = queue.files();
            let header = StatusHeader::read(&files.stat)?;
            header.check_file_sizes(&files.stat, files.buf.file())?;
            debug!(
                "Opened queue {} ({:?}), youngest id {}",
                path.display(),
                mode,
                header.youngest_id
            );
        }
        return Ok(queue);
    }

    /// Map the queue files without looking at their contents, for dumping
    /// or repairing a queue that fails validation.
    pub fn open_unvalidated(
        path: impl AsRef<Path>,
        mode: OpenMode,
        options: QueueOptions,
    ) -> Result<Queue> {
        let path = path.as_ref();
        if !exists(path) {
            return Err(Error::QueueNotFound(path.to_path_buf()));
        }
        let writable = mode == OpenMode::ReadWrite;
        let stat = MappedFile::open(&stat_path(path), writable)?;
        let buf = MappedFile::open(&buf_path(path), writable)?;
        return Ok(Queue::from_parts(path, stat, buf, options, writable));
    }

    /// Open the queue read-write, creating it if it does not exist. An
    /// existing queue is fully checked and `policy` decides what happens if
    /// the check fails.
    pub fn open_or_create(
        path: impl AsRef<Path>,
        options: QueueOptions,
        policy: RecoveryPolicy,
    ) -> Result<Queue> {
        let path = path.as_ref();
        if !exists(path) {
            return Queue::create(path, options);
        }

        let failure = match Queue::open(path, OpenMode::ReadWrite, options.clone()) {
            Ok(queue) => match queue.check() {
                Ok(()) => return Ok(queue),
                Err(e @ Error::CorruptHeader { .. }) | Err(e @ Error::CorruptMessage { .. }) => e,
                Err(e) => return Err(e),
            },
            Err(e @ Error::CorruptHeader { .. }) => e,
            Err(e) => return Err(e),
        };

        warn!("Queue {} failed validation: {}", path.display(), failure);
        if policy == RecoveryPolicy::Fail {
            return Err(failure);
        }

        let repaired = Queue::open_unvalidated(path, OpenMode::ReadWrite, options.clone()).and_then(
            |queue| {
                match policy {
                    RecoveryPolicy::Recover => queue.recover()?,
                    _ => queue.clear()?,
                }
                return Ok(queue);
            },
        );
        match repaired {
            Ok(queue) => return Ok(queue),
            Err(e) => {
                warn!(
                    "Cannot repair queue {} ({}), creating it again",
                    path.display(),
                    e
                );
                return Queue::create(path, options);
            }
        }
    }

    /// Wait until a valid queue exists at `path` and open it. Gives up with
    /// `QueueNotFound` when `settings.timeout` passes.
    pub fn open_blocking(
        path: impl AsRef<Path>,
        mode: OpenMode,
        options: QueueOptions,
        settings: &PollSettings,
        heartbeat: Option<&mut Heartbeat>,
    ) -> Result<Queue> {
        let path = path.as_ref();
        // nothing in this process will signal the queue appearing
        let notifier = Notifier::default();
        let label = format!("waiting for queue {}", path.display());
        let opened = poll_until(&notifier, settings, heartbeat, &label, || {
            match Queue::open(path, mode, options.clone()) {
                Ok(queue) => return Ok(Some(queue)),
                Err(Error::QueueNotFound(_)) | Err(Error::CorruptHeader { .. }) => return Ok(None),
                // a creator is still sizing the files
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::InvalidData => return Ok(None),
                Err(e) => return Err(e),
            }
        })?;
        match opened {
            Wait::Ready(queue) => return Ok(queue),
            Wait::TimedOut => return Err(Error::QueueNotFound(path.to_path_buf())),
        }
    }

    pub fn path(&self) -> &Path {
        return &self.shared.path;
    }

    pub fn options(&self) -> &QueueOptions {
        return &self.shared.options;
    }

    pub fn is_writable(&self) -> bool {
        return self.shared.writable;
    }

    /// The validated status header as currently stored.
    pub fn status(&self) -> Result<StatusHeader> {
        let mut files = self.files();
        return self.read_header(&mut files, false);
    }

    pub fn usage(&self) -> Result<Usage> {
        let header = self.status()?;
        return Ok(Usage {
            n_slots: header.n_slots,
            buffer_size: header.buffer_size,
            active_slots: header.active_count(),
            active_bytes: header.buffer_size - header.free_bytes(),
            youngest_id: header.youngest_id,
            oldest_id: header.oldest_id(),
        });
    }

    pub fn writer(&self) -> Writer {
        return Writer::new(self.clone());
    }

    /// Reader with an in-memory cursor starting before the first id.
    pub fn reader(&self) -> Reader {
        return Reader::detached(self.clone());
    }

    /// The reader blocking writes wait for. Its cursor lives in the status
    /// header, so only one should exist per queue.
    pub fn canonical_reader(&self) -> Result<Reader> {
        return Reader::open(self.clone(), CursorMode::Canonical);
    }

    /// Reader whose cursor is persisted under `name` and resumes after a
    /// restart.
    pub fn named_reader(&self, name: &str) -> Result<Reader> {
        return Reader::open(self.clone(), CursorMode::Persistent(name.to_string()));
    }

    pub(crate) fn files(&self) -> MutexGuard<'_, QueueFiles> {
        return self.shared.files.lock().unwrap();
    }

    pub(crate) fn lock_for_write(&self) -> Result<WriteGuard<'_>> {
        if !self.shared.writable {
            return Err(Error::ReadOnly(self.path().to_path_buf()));
        }
        let files = self.files();
        let flocked = !self.shared.options.single_writer;
        if flocked {
            files.stat.lock_exclusive()?;
        }
        return Ok(WriteGuard {
            queue: self,
            files,
            flocked,
        });
    }

    /// Read the header, remapping the files first when the queue was
    /// re-created at another size or replaced on disk. With `relock` the
    /// advisory lock, lost with the old stat file, is taken on the new one.
    pub(crate) fn read_header(
        &self,
        files: &mut QueueFiles,
        relock: bool,
    ) -> Result<StatusHeader> {
        let mismatch = match StatusHeader::read(&files.stat) {
            Ok(header) => match header.check_file_sizes(&files.stat, files.buf.file()) {
                Ok(()) => return Ok(header),
                Err(e) => e,
            },
            Err(e @ Error::CorruptHeader { .. }) => e,
            Err(e) => return Err(e),
        };
        if !self.remap_if_stale(files, relock)? {
            return Err(mismatch);
        }

        let header = StatusHeader::read(&files.stat)?;
        header.check_file_sizes(&files.stat, files.buf.file())?;
        return Ok(header);
    }

    fn remap_if_stale(&self, files: &mut QueueFiles, relock: bool) -> Result<bool> {
        if !files.stat.is_stale()? && !files.buf.file().is_stale()? {
            return Ok(false);
        }
        let writable = self.shared.writable;
        let stat = MappedFile::open(&stat_path(self.path()), writable)?;
        let buf = MappedFile::open(&buf_path(self.path()), writable)?;
        // dropping the old stat file releases a lock held through it
        files.stat = stat;
        files.buf = DataBuffer::new(buf);
        if relock {
            files.stat.lock_exclusive()?;
        }
        info!(
            "Remapped queue {}, stat file {} bytes, buffer {} bytes",
            self.path().display(),
            files.stat.len(),
            files.buf.size()
        );
        return Ok(true);
    }

    pub(crate) fn notifier(&self) -> Arc<Notifier> {
        return self.shared.notifier.clone();
    }

    /// Everything after a commit: optional msync, then wake local waiters.
    /// Called with the write guard still held.
    pub(crate) fn committed(&self, files: &QueueFiles) -> Result<()> {
        if self.shared.options.sync_on_commit {
            files.buf.flush()?;
            files.stat.flush()?;
        }
        self.shared.notifier.notify();
        return Ok(());
    }

    /// Walk the active window and verify every slot and entry: ids are
    /// consecutive, each entry starts where the previous one ended, framing
    /// and checksums hold, and nothing outside the window is active.
    pub fn check(&self) -> Result<()> {
        let files = self.files();
        let header = StatusHeader::read(&files.stat)?;
        header.check_file_sizes(&files.stat, files.buf.file())?;
        let corrupt = |reason: String| Error::CorruptHeader {
            path: stat_path(self.path()),
            reason,
        };

        if !header.is_empty() {
            let mut index = header.oldest_slot;
            let mut offset = header.end_insert;
            let mut live_bytes: u64 = 0;
            for id in header.oldest_id()..=header.youngest_id {
                let slot = read_slot(&files.stat, header.n_slots, index)?;
                if !slot.active || slot.id != id {
                    return Err(corrupt(format!(
                        "slot {} holds id {} (active {}), expected live id {}",
                        index, slot.id, slot.active, id
                    )));
                }
                if slot.offset != offset {
                    return Err(corrupt(format!(
                        "slot {} starts at {}, previous entry ends at {}",
                        index, slot.offset, offset
                    )));
                }
                if slot.stored_len > header.buffer_size {
                    return Err(corrupt(format!(
                        "slot {} stores {} bytes",
                        index, slot.stored_len
                    )));
                }
                let entry = files.buf.read(slot.offset, slot.stored_len)?;
                decode_entry(&entry, &slot, index)?;

                live_bytes += slot.stored_len as u64;
                offset = ring_advance(slot.offset, slot.stored_len, header.buffer_size);
                index = next_slot(index, header.n_slots);
            }
            if offset != header.begin_insert {
                return Err(corrupt(format!(
                    "youngest entry ends at {}, begin_insert is {}",
                    offset, header.begin_insert
                )));
            }
            if live_bytes > header.buffer_size as u64 {
                return Err(corrupt(format!(
                    "{} live bytes in a {} byte buffer",
                    live_bytes, header.buffer_size
                )));
            }
        }

        for index in 0..header.n_slots {
            if header.slot_in_active_region(index) {
                continue;
            }
            let slot = read_slot(&files.stat, header.n_slots, index)?;
            if slot.active {
                return Err(corrupt(format!(
                    "slot {} (id {}) is active outside the window",
                    index, slot.id
                )));
            }
        }

        debug!(
            "Queue {} checked: {} live message(s)",
            self.path().display(),
            header.active_count()
        );
        return Ok(());
    }

    /// Discard every message and start again with a new queue uid. Works
    /// on queues whose header is unreadable.
    pub fn clear(&self) -> Result<()> {
        let mut files = self.lock_for_write()?;
        let (n_slots, buffer_size) = geometry(&files.stat, files.buf.file()).ok_or_else(|| {
            Error::CorruptHeader {
                path: stat_path(self.path()),
                reason: "file sizes do not describe a queue".to_string(),
            }
        })?;
        let blocking_write = match StatusHeader::read_unchecked(&files.stat) {
            Some(h) if h.magic_cookie == STAT_MAGIC => h.blocking_write,
            _ => self.shared.options.blocking_write,
        };

        let mut header = StatusHeader::new(n_slots, buffer_size, blocking_write);
        initialize(&mut header, &mut files.stat)?;
        self.committed(&files)?;
        warn!("Cleared queue {}", self.path().display());
        return Ok(());
    }

    /// Rebuild the header from the slot directory. The youngest id is the
    /// highest id any intact slot has held, so ids are never reused. Live
    /// messages are the run of consecutive ids ending there whose entries
    /// are contiguous and pass validation, every other slot is deactivated.
    pub fn recover(&self) -> Result<()> {
        let mut guard = self.lock_for_write()?;
        let files = &mut *guard;
        let (n_slots, buffer_size) = geometry(&files.stat, files.buf.file()).ok_or_else(|| {
            Error::CorruptHeader {
                path: stat_path(self.path()),
                reason: "file sizes do not describe a queue".to_string(),
            }
        })?;

        let previous = StatusHeader::read_unchecked(&files.stat)
            .filter(|h| h.magic_cookie == STAT_MAGIC);
        let blocking_write = previous.map_or(self.shared.options.blocking_write, |h| h.blocking_write);
        let mut header = StatusHeader::new(n_slots, buffer_size, blocking_write);
        if let Some(prev) = previous {
            header.queue_uid = prev.queue_uid;
        }

        // None for slots failing their own checksum
        let mut slots: Vec<Option<Slot>> = Vec::with_capacity(n_slots as usize);
        for index in 0..n_slots {
            slots.push(match read_slot_unchecked(&files.stat, index) {
                Some((slot, true)) => Some(slot),
                _ => None,
            });
        }

        let youngest = slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.map(|s| (index as u32, s)))
            .filter(|(_, slot)| slot.id > 0)
            .max_by_key(|(_, slot)| slot.id);

        let mut live = vec![false; n_slots as usize];
        if let Some((y_index, y_slot)) = youngest {
            header.youngest_id = y_slot.id;
            header.youngest_slot = y_index;
            if entry_is_valid(&files.buf, y_index, &y_slot) {
                live[y_index as usize] = true;
                let mut oldest = (y_index, y_slot);
                let mut count = 1;
                let mut bytes = y_slot.stored_len as u64;
                let mut index = y_index;
                while count < n_slots {
                    index = prev_slot(index, n_slots);
                    let slot = match slots[index as usize] {
                        Some(slot) => slot,
                        None => break,
                    };
                    let newer = oldest.1;
                    if slot.id.checked_add(1) != Some(newer.id)
                        || ring_advance(slot.offset, slot.stored_len, buffer_size) != newer.offset
                        || bytes + slot.stored_len as u64 > buffer_size as u64
                        || !entry_is_valid(&files.buf, index, &slot)
                    {
                        break;
                    }
                    live[index as usize] = true;
                    bytes += slot.stored_len as u64;
                    count += 1;
                    oldest = (index, slot);
                }
                header.oldest_slot = oldest.0;
                header.end_insert = oldest.1.offset;
                header.begin_insert = ring_advance(y_slot.offset, y_slot.stored_len, buffer_size);
            } else {
                warn!(
                    "Youngest message {} in slot {} is damaged, queue recovers empty",
                    y_slot.id, y_index
                );
                if y_slot.offset < buffer_size {
                    header.begin_insert =
                        ring_advance(y_slot.offset, y_slot.stored_len, buffer_size);
                    header.end_insert = header.begin_insert;
                }
            }
        }

        let mut deactivated = 0;
        for index in 0..n_slots {
            if live[index as usize] {
                continue;
            }
            match slots[index as usize] {
                Some(slot) if slot.active => {
                    let mut inactive = slot;
                    inactive.active = false;
                    write_slot(&mut files.stat, index, &inactive)?;
                    deactivated += 1;
                }
                Some(_) => {}
                None => {
                    write_slot(&mut files.stat, index, &Slot::default())?;
                    deactivated += 1;
                }
            }
        }

        match previous {
            Some(prev) => {
                header.append_mode = prev.append_mode;
                header.begin_append = prev.begin_append.min(buffer_size);
                header.last_id_read = prev.last_id_read.min(header.youngest_id);
            }
            None => {
                header.append_mode = false;
                header.begin_append = buffer_size;
            }
        }
        header.commit(&mut files.stat)?;
        self.committed(files)?;

        info!(
            "Recovered queue {}: {} live message(s), youngest id {}, {} slot(s) reset",
            self.path().display(),
            header.active_count(),
            header.youngest_id,
            deactivated
        );
        return Ok(());
    }

    /// Print the header and every slot as stored, without validation.
    pub fn dump(&self, out: &mut dyn io::Write) -> Result<()> {
        let files = self.files();
        writeln!(out, "Queue {}", self.path().display())?;
        match StatusHeader::read_unchecked(&files.stat) {
            Some(header) => {
                writeln!(out, "{}", header)?;
                if let Err(e) = StatusHeader::read(&files.stat) {
                    writeln!(out, "  INVALID: {}", e)?;
                }
            }
            None => writeln!(out, "  stat file is only {} bytes", files.stat.len())?,
        }

        let n_slots = files.stat.len().saturating_sub(STATUS_HEADER_SIZE) / SLOT_SIZE;
        for index in 0..n_slots as u32 {
            if let Some((slot, valid)) = read_slot_unchecked(&files.stat, index) {
                let note = if valid { "" } else { " (bad slot checksum)" };
                writeln!(out, "slot {:4}: {}{}", index, slot, note)?;
            }
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::HDR_POS_MAGIC;
    use crate::reader::ReadOutcome;
    use crate::writer::OutboundMessage;
    use std::time::Instant;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    // patch in place, the file is mapped by the queue under test
    fn flip_byte(path: &Path, pos: u64, mask: u8) {
        use std::os::unix::fs::FileExt;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .unwrap();
        let mut byte = [0u8; 1];
        file.read_exact_at(&mut byte, pos).unwrap();
        byte[0] ^= mask;
        file.write_all_at(&byte, pos).unwrap();
    }

    fn write_n(queue: &Queue, n: usize, len: usize) -> Vec<u32> {
        let mut writer = queue.writer();
        return (0..n)
            .map(|i| {
                let payload = vec![i as u8; len];
                writer.append(&OutboundMessage::new(1, &payload)).unwrap()
            })
            .collect();
    }

    fn read_all(queue: &Queue) -> Vec<u32> {
        let mut reader = queue.reader();
        let mut ids = vec![];
        loop {
            match reader.next(None).unwrap() {
                ReadOutcome::Message(msg) => ids.push(msg.id),
                ReadOutcome::DataLoss { .. } => {}
                ReadOutcome::NoData | ReadOutcome::TimedOut => return ids,
            }
        }
    }

    #[test]
    fn create_then_open() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue");
        let queue = Queue::create(&path, QueueOptions::new(8, 4096)).unwrap();
        assert!(stat_path(&path).is_file());
        assert_eq!(std::fs::metadata(buf_path(&path)).unwrap().len(), 4096);
        write_n(&queue, 3, 10);

        let other = Queue::open(&path, OpenMode::ReadOnly, QueueOptions::default()).unwrap();
        let header = other.status().unwrap();
        assert_eq!(header.n_slots, 8);
        assert_eq!(header.buffer_size, 4096);
        assert_eq!(header.youngest_id, 3);
        assert_eq!(read_all(&other), vec![1, 2, 3]);
        other.check().unwrap();
    }

    #[test]
    fn paths_append_suffixes() {
        let path = Path::new("/tmp/fmq/trigger");
        assert_eq!(stat_path(path), PathBuf::from("/tmp/fmq/trigger.stat"));
        assert_eq!(buf_path(path), PathBuf::from("/tmp/fmq/trigger.buf"));
        assert_eq!(
            cursor_path(path, "ingest"),
            PathBuf::from("/tmp/fmq/trigger.cursor.ingest")
        );
    }

    #[test]
    fn bad_options_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue");
        assert!(matches!(
            Queue::create(&path, QueueOptions::new(0, 1024)),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            Queue::create(&path, QueueOptions::new(4, 8)),
            Err(Error::InvalidConfig(_))
        ));
        assert!(!exists(&path));
    }

    #[test]
    fn missing_queue_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nothing");
        assert!(matches!(
            Queue::open(&path, OpenMode::ReadOnly, QueueOptions::default()),
            Err(Error::QueueNotFound(_))
        ));
    }

    #[test]
    fn read_only_handles_refuse_changes() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue");
        Queue::create(&path, QueueOptions::new(4, 1024)).unwrap();
        let queue = Queue::open(&path, OpenMode::ReadOnly, QueueOptions::default()).unwrap();
        assert!(!queue.is_writable());
        assert!(matches!(queue.clear(), Err(Error::ReadOnly(_))));
        assert!(matches!(
            queue.writer().append(&OutboundMessage::new(1, b"x")),
            Err(Error::ReadOnly(_))
        ));
        assert!(matches!(queue.canonical_reader(), Err(Error::ReadOnly(_))));
    }

    #[test]
    fn wrong_file_size_is_corrupt() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue");
        Queue::create(&path, QueueOptions::new(4, 1024)).unwrap();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(buf_path(&path))
            .unwrap();
        file.set_len(512).unwrap();
        assert!(matches!(
            Queue::open(&path, OpenMode::ReadOnly, QueueOptions::default()),
            Err(Error::CorruptHeader { .. })
        ));
    }

    #[test]
    fn check_catches_damaged_payload() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue");
        let queue = Queue::create(&path, QueueOptions::new(4, 1024)).unwrap();
        write_n(&queue, 3, 40);
        queue.check().unwrap();

        flip_byte(&buf_path(&path), 70, 0x40);
        assert!(matches!(queue.check(), Err(Error::CorruptMessage { id: 2, .. })));
    }

    #[test]
    fn clear_starts_over() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue");
        let queue = Queue::create(&path, QueueOptions::new(4, 1024).blocking(true)).unwrap();
        write_n(&queue, 3, 10);
        let uid = queue.status().unwrap().queue_uid;

        queue.clear().unwrap();
        let header = queue.status().unwrap();
        assert!(header.is_empty());
        assert_eq!(header.youngest_id, 0);
        assert!(header.blocking_write);
        assert_ne!(header.queue_uid, uid);
        assert!(read_all(&queue).is_empty());
        queue.check().unwrap();
    }

    #[test]
    fn recover_rebuilds_a_lost_header() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue");
        {
            let queue = Queue::create(&path, QueueOptions::new(4, 1024)).unwrap();
            // ids 3..=6 stay live
            write_n(&queue, 6, 100);
        }

        let mut bytes = std::fs::read(stat_path(&path)).unwrap();
        bytes[HDR_POS_MAGIC..HDR_POS_MAGIC + 4].copy_from_slice(&[0, 0, 0, 0]);
        std::fs::write(stat_path(&path), &bytes).unwrap();
        assert!(matches!(
            Queue::open(&path, OpenMode::ReadWrite, QueueOptions::default()),
            Err(Error::CorruptHeader { .. })
        ));

        let queue =
            Queue::open_or_create(&path, QueueOptions::default(), RecoveryPolicy::Recover).unwrap();
        queue.check().unwrap();
        let header = queue.status().unwrap();
        assert_eq!(header.youngest_id, 6);
        assert_eq!(header.oldest_id(), 3);
        assert_eq!(read_all(&queue), vec![3, 4, 5, 6]);

        // ids carry on from where they were
        assert_eq!(write_n(&queue, 1, 100), vec![7]);
        queue.check().unwrap();
    }

    #[test]
    fn recover_drops_damaged_entries() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue");
        let queue = Queue::create(&path, QueueOptions::new(8, 4096)).unwrap();
        write_n(&queue, 5, 100);

        // damage the entry for id 2, ids 3..=5 survive
        flip_byte(&buf_path(&path), 116 + 20, 0xff);
        assert!(queue.check().is_err());

        queue.recover().unwrap();
        queue.check().unwrap();
        assert_eq!(read_all(&queue), vec![3, 4, 5]);
        assert_eq!(queue.status().unwrap().youngest_id, 5);
    }

    #[test]
    fn open_or_create_can_clear() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue");
        let created =
            Queue::open_or_create(&path, QueueOptions::new(4, 1024), RecoveryPolicy::Fail).unwrap();
        write_n(&created, 2, 10);
        drop(created);

        std::fs::write(stat_path(&path), vec![0xaa; STATUS_HEADER_SIZE + 4 * SLOT_SIZE]).unwrap();
        assert!(matches!(
            Queue::open_or_create(&path, QueueOptions::new(4, 1024), RecoveryPolicy::Fail),
            Err(Error::CorruptHeader { .. })
        ));
        let queue =
            Queue::open_or_create(&path, QueueOptions::new(4, 1024), RecoveryPolicy::Clear).unwrap();
        queue.check().unwrap();
        assert_eq!(queue.status().unwrap().youngest_id, 0);
    }

    #[test]
    fn open_blocking_waits_for_the_queue() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late");

        let creator_path = path.clone();
        let creator = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            Queue::create(&creator_path, QueueOptions::new(4, 1024)).unwrap();
        });

        let settings =
            PollSettings::new(Duration::from_millis(5)).with_timeout(Some(Duration::from_secs(10)));
        let start = Instant::now();
        let queue = Queue::open_blocking(
            &path,
            OpenMode::ReadOnly,
            QueueOptions::default(),
            &settings,
            None,
        )
        .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(queue.status().unwrap().n_slots, 4);
        creator.join().unwrap();

        let missing = dir.path().join("never");
        let settings =
            PollSettings::new(Duration::from_millis(5)).with_timeout(Some(Duration::from_millis(30)));
        assert!(matches!(
            Queue::open_blocking(&missing, OpenMode::ReadOnly, QueueOptions::default(), &settings, None),
            Err(Error::QueueNotFound(_))
        ));
    }

    #[test]
    fn usage_reports_occupancy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue");
        let queue = Queue::create(&path, QueueOptions::new(10, 1000)).unwrap();
        let usage = queue.usage().unwrap();
        assert_eq!(usage.active_slots, 0);
        assert_eq!(usage.active_bytes, 0);
        assert_eq!(usage.fraction_used(), 0.0);

        // 5 entries of 84 + 16 bytes
        write_n(&queue, 5, 84);
        let usage = queue.usage().unwrap();
        assert_eq!(usage.active_slots, 5);
        assert_eq!(usage.active_bytes, 500);
        assert_eq!(usage.oldest_id, 1);
        assert_eq!(usage.youngest_id, 5);
        assert!((usage.slot_fraction() - 0.5).abs() < 1e-9);
        assert!((usage.byte_fraction() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn dump_works_on_a_broken_queue() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue");
        let queue = Queue::create(&path, QueueOptions::new(3, 1024)).unwrap();
        write_n(&queue, 2, 10);

        let mut out = Vec::new();
        queue.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("youngest_id: 2"));
        assert!(text.contains("slot    2:"));
        assert!(!text.contains("INVALID"));

        flip_byte(&stat_path(&path), 30, 1);
        let mut out = Vec::new();
        queue.dump(&mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("INVALID"));
    }
}
