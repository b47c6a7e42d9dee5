use crate::constants::{
    FORMAT_VERSION, HDR_POS_APPEND_MODE, HDR_POS_BEGIN_APPEND, HDR_POS_BEGIN_INSERT,
    HDR_POS_BLOCKING_WRITE, HDR_POS_BUFFER_SIZE, HDR_POS_CHECKSUM, HDR_POS_END_INSERT,
    HDR_POS_LAST_ID_READ, HDR_POS_MAGIC, HDR_POS_N_SLOTS, HDR_POS_OLDEST_SLOT, HDR_POS_QUEUE_UID,
    HDR_POS_TIME_WRITTEN, HDR_POS_VERSION, HDR_POS_YOUNGEST_ID, HDR_POS_YOUNGEST_SLOT,
    HEADER_READ_ATTEMPTS, NO_SLOT, SLOT_SIZE, STATUS_HEADER_SIZE, STAT_MAGIC,
};
use crate::error::{Error, Result};
use crate::mapped_file::MappedFile;
use crate::utils::{compute_crc32, now_micros, ring_distance};
use log::warn;
use rand::Rng;
use std::fmt;
use std::sync::atomic::{fence, Ordering};

/// Queue-wide bookkeeping stored at the start of the stat file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusHeader {
    pub magic_cookie: u32,
    pub version: u32,
    pub queue_uid: u64,
    pub n_slots: u32,
    pub buffer_size: u32,
    /// Id of the most recently written message, 0 before the first write.
    pub youngest_id: u32,
    pub youngest_slot: u32,
    /// `NO_SLOT` when no message is live.
    pub oldest_slot: u32,
    /// Write head: offset the next entry will be stored at.
    pub begin_insert: u32,
    /// Offset of the oldest live entry; the free region runs from
    /// `begin_insert` forward to here.
    pub end_insert: u32,
    /// Bytes written before the write head first wrapped.
    pub begin_append: u32,
    /// Set until the write head first wraps past the end of the buffer.
    pub append_mode: bool,
    pub blocking_write: bool,
    /// Cursor of the canonical reader, respected by blocking writes.
    pub last_id_read: u32,
    pub time_written: u64,
    pub checksum: u32,
}

fn header_checksum(bytes: &[u8; STATUS_HEADER_SIZE]) -> u32 {
    return compute_crc32(&bytes[..HDR_POS_CHECKSUM]);
}

impl StatusHeader {
    pub fn new(n_slots: u32, buffer_size: u32, blocking_write: bool) -> StatusHeader {
        let mut rng = rand::thread_rng();
        return StatusHeader {
            magic_cookie: STAT_MAGIC,
            version: FORMAT_VERSION,
            queue_uid: rng.gen(),
            n_slots,
            buffer_size,
            youngest_id: 0,
            youngest_slot: NO_SLOT,
            oldest_slot: NO_SLOT,
            begin_insert: 0,
            end_insert: 0,
            begin_append: 0,
            append_mode: true,
            blocking_write,
            last_id_read: 0,
            time_written: 0,
            checksum: 0,
        };
    }

    /// Size of the stat file holding this header and its slot directory.
    pub fn stat_file_size(&self) -> usize {
        return STATUS_HEADER_SIZE + SLOT_SIZE * self.n_slots as usize;
    }

    pub fn is_empty(&self) -> bool {
        return self.oldest_slot == NO_SLOT;
    }

    /// Bytes that can be stored at the write head without evicting anything.
    pub fn free_bytes(&self) -> u32 {
        if self.is_empty() {
            return self.buffer_size;
        }
        // live entries are never empty, so head == tail means full
        return ring_distance(self.begin_insert, self.end_insert, self.buffer_size);
    }

    pub fn slot_in_active_region(&self, slot: u32) -> bool {
        if self.is_empty() || self.youngest_slot == NO_SLOT {
            return false;
        }
        if self.youngest_slot >= self.oldest_slot {
            return slot >= self.oldest_slot && slot <= self.youngest_slot;
        } else {
            return slot >= self.oldest_slot || slot <= self.youngest_slot;
        }
    }

    /// Number of slots in the active window.
    pub fn active_count(&self) -> u32 {
        if self.is_empty() || self.youngest_slot == NO_SLOT {
            return 0;
        }
        return ring_distance(self.oldest_slot, self.youngest_slot, self.n_slots) + 1;
    }

    /// Id held by `oldest_slot`, derived from the window, 0 if empty.
    pub fn oldest_id(&self) -> u32 {
        if self.is_empty() {
            return 0;
        }
        return (self.youngest_id as u64 + 1).saturating_sub(self.active_count() as u64) as u32;
    }

    pub fn encode(&self) -> [u8; STATUS_HEADER_SIZE] {
        let mut bytes = [0u8; STATUS_HEADER_SIZE];
        let mut put_u32 = |pos: usize, value: u32| {
            bytes[pos..pos + 4].copy_from_slice(&value.to_be_bytes());
        };
        put_u32(HDR_POS_MAGIC, self.magic_cookie);
        put_u32(HDR_POS_VERSION, self.version);
        put_u32(HDR_POS_N_SLOTS, self.n_slots);
        put_u32(HDR_POS_BUFFER_SIZE, self.buffer_size);
        put_u32(HDR_POS_YOUNGEST_ID, self.youngest_id);
        put_u32(HDR_POS_YOUNGEST_SLOT, self.youngest_slot);
        put_u32(HDR_POS_OLDEST_SLOT, self.oldest_slot);
        put_u32(HDR_POS_BEGIN_INSERT, self.begin_insert);
        put_u32(HDR_POS_END_INSERT, self.end_insert);
        put_u32(HDR_POS_BEGIN_APPEND, self.begin_append);
        put_u32(HDR_POS_LAST_ID_READ, self.last_id_read);
        bytes[HDR_POS_QUEUE_UID..HDR_POS_QUEUE_UID + 8].copy_from_slice(&self.queue_uid.to_be_bytes());
        bytes[HDR_POS_TIME_WRITTEN..HDR_POS_TIME_WRITTEN + 8]
            .copy_from_slice(&self.time_written.to_be_bytes());
        bytes[HDR_POS_APPEND_MODE] = self.append_mode as u8;
        bytes[HDR_POS_BLOCKING_WRITE] = self.blocking_write as u8;

        let checksum = header_checksum(&bytes);
        bytes[HDR_POS_CHECKSUM..HDR_POS_CHECKSUM + 4].copy_from_slice(&checksum.to_be_bytes());
        return bytes;
    }

    /// Decode without any validation.
    pub fn decode(bytes: &[u8; STATUS_HEADER_SIZE]) -> StatusHeader {
        let get_u32 = |pos: usize| u32::from_be_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]);
        let get_u64 = |pos: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[pos..pos + 8]);
            u64::from_be_bytes(raw)
        };
        return StatusHeader {
            magic_cookie: get_u32(HDR_POS_MAGIC),
            version: get_u32(HDR_POS_VERSION),
            queue_uid: get_u64(HDR_POS_QUEUE_UID),
            n_slots: get_u32(HDR_POS_N_SLOTS),
            buffer_size: get_u32(HDR_POS_BUFFER_SIZE),
            youngest_id: get_u32(HDR_POS_YOUNGEST_ID),
            youngest_slot: get_u32(HDR_POS_YOUNGEST_SLOT),
            oldest_slot: get_u32(HDR_POS_OLDEST_SLOT),
            begin_insert: get_u32(HDR_POS_BEGIN_INSERT),
            end_insert: get_u32(HDR_POS_END_INSERT),
            begin_append: get_u32(HDR_POS_BEGIN_APPEND),
            append_mode: bytes[HDR_POS_APPEND_MODE] != 0,
            blocking_write: bytes[HDR_POS_BLOCKING_WRITE] != 0,
            last_id_read: get_u32(HDR_POS_LAST_ID_READ),
            time_written: get_u64(HDR_POS_TIME_WRITTEN),
            checksum: get_u32(HDR_POS_CHECKSUM),
        };
    }

    /// Read the header as stored, without validation. Used by debug dumps and
    /// recovery, which must work on broken queues.
    pub fn read_unchecked(stat: &MappedFile) -> Option<StatusHeader> {
        if stat.len() < STATUS_HEADER_SIZE {
            return None;
        }
        let mut bytes = [0u8; STATUS_HEADER_SIZE];
        stat.read_into(0, &mut bytes);
        return Some(StatusHeader::decode(&bytes));
    }

    /// Read and validate the header. A checksum mismatch is retried a few
    /// times since a writer may be committing while we copy.
    pub fn read(stat: &MappedFile) -> Result<StatusHeader> {
        if stat.len() < STATUS_HEADER_SIZE {
            return Err(corrupt(stat, format!("stat file is only {} bytes", stat.len())));
        }

        let mut bytes = [0u8; STATUS_HEADER_SIZE];
        let mut header = None;
        for attempt in 0..HEADER_READ_ATTEMPTS {
            stat.read_into(0, &mut bytes);
            fence(Ordering::Acquire);
            let decoded = StatusHeader::decode(&bytes);
            if decoded.magic_cookie != STAT_MAGIC {
                return Err(corrupt(
                    stat,
                    format!("bad magic cookie {:#010x}", decoded.magic_cookie),
                ));
            }
            if decoded.checksum == header_checksum(&bytes) {
                header = Some(decoded);
                break;
            }
            if attempt + 1 < HEADER_READ_ATTEMPTS {
                std::thread::yield_now();
            }
        }

        let header = match header {
            Some(h) => h,
            None => {
                let decoded = StatusHeader::decode(&bytes);
                warn!(
                    "Header checksum of {} is {}, should be {}",
                    stat.path().display(),
                    decoded.checksum,
                    header_checksum(&bytes)
                );
                return Err(corrupt(stat, "header checksum mismatch".to_string()));
            }
        };

        if header.version != FORMAT_VERSION {
            return Err(corrupt(
                stat,
                format!("format version {}, expected {}", header.version, FORMAT_VERSION),
            ));
        }
        header.check_consistency().map_err(|reason| corrupt(stat, reason))?;
        return Ok(header);
    }

    /// Field level sanity checks, independent of the checksum.
    pub fn check_consistency(&self) -> std::result::Result<(), String> {
        if self.n_slots == 0 {
            return Err("n_slots is zero".to_string());
        }
        if self.buffer_size == 0 {
            return Err("buffer_size is zero".to_string());
        }
        if self.youngest_slot != NO_SLOT && self.youngest_slot >= self.n_slots {
            return Err(format!(
                "youngest_slot {} out of range for {} slots",
                self.youngest_slot, self.n_slots
            ));
        }
        if self.oldest_slot != NO_SLOT && self.oldest_slot >= self.n_slots {
            return Err(format!(
                "oldest_slot {} out of range for {} slots",
                self.oldest_slot, self.n_slots
            ));
        }
        if self.oldest_slot != NO_SLOT && self.youngest_slot == NO_SLOT {
            return Err("oldest_slot set without youngest_slot".to_string());
        }
        if self.begin_insert >= self.buffer_size || self.end_insert >= self.buffer_size {
            return Err(format!(
                "insert region {}..{} outside buffer of {} bytes",
                self.begin_insert, self.end_insert, self.buffer_size
            ));
        }
        if !self.is_empty() && self.active_count() > self.youngest_id {
            return Err(format!(
                "{} active slots but youngest_id is {}",
                self.active_count(),
                self.youngest_id
            ));
        }
        return Ok(());
    }

    /// Verify the stat and buf files have the sizes this header describes.
    pub fn check_file_sizes(&self, stat: &MappedFile, buf: &MappedFile) -> Result<()> {
        if stat.len() != self.stat_file_size() {
            return Err(corrupt(
                stat,
                format!(
                    "stat file is {} bytes, expected {} for {} slots",
                    stat.len(),
                    self.stat_file_size(),
                    self.n_slots
                ),
            ));
        }
        if buf.len() != self.buffer_size as usize {
            return Err(corrupt(
                stat,
                format!(
                    "buf file is {} bytes, expected {}",
                    buf.len(),
                    self.buffer_size
                ),
            ));
        }
        return Ok(());
    }

    /// Write the header back with a fresh timestamp and checksum. Every slot
    /// and payload write for this change must already be in place, readers
    /// trust anything the header advertises.
    pub fn commit(&mut self, stat: &mut MappedFile) -> Result<()> {
        if !stat.is_writable() {
            return Err(Error::ReadOnly(stat.path().to_path_buf()));
        }
        self.time_written = now_micros();
        let bytes = self.encode();
        self.checksum = StatusHeader::decode(&bytes).checksum;
        fence(Ordering::Release);
        stat.write_from(0, &bytes);
        return Ok(());
    }
}

fn corrupt(stat: &MappedFile, reason: String) -> Error {
    return Error::CorruptHeader {
        path: stat.path().to_path_buf(),
        reason,
    };
}

fn slot_str(slot: u32) -> String {
    if slot == NO_SLOT {
        return "none".to_string();
    }
    return slot.to_string();
}

impl fmt::Display for StatusHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "  magic_cookie: {:#010x}", self.magic_cookie)?;
        writeln!(f, "  version: {}", self.version)?;
        writeln!(f, "  queue_uid: {:016x}", self.queue_uid)?;
        writeln!(f, "  youngest_id: {}", self.youngest_id)?;
        writeln!(f, "  youngest_slot: {}", slot_str(self.youngest_slot))?;
        writeln!(f, "  oldest_slot: {}", slot_str(self.oldest_slot))?;
        writeln!(f, "  nslots: {}", self.n_slots)?;
        writeln!(f, "  buf_size: {}", self.buffer_size)?;
        writeln!(f, "  begin_insert: {}", self.begin_insert)?;
        writeln!(f, "  end_insert: {}", self.end_insert)?;
        writeln!(f, "  begin_append: {}", self.begin_append)?;
        writeln!(f, "  append_mode: {}", self.append_mode)?;
        writeln!(f, "  blocking_write: {}", self.blocking_write)?;
        writeln!(f, "  last_id_read: {}", self.last_id_read)?;
        writeln!(f, "  time_written: {}", self.time_written)?;
        write!(f, "  checksum: {:#010x}", self.checksum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn stat_file(dir: &tempfile::TempDir, header: &StatusHeader) -> MappedFile {
        let path = dir.path().join("q.stat");
        return MappedFile::create(&path, header.stat_file_size()).unwrap();
    }

    #[test]
    fn commit_then_read() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let mut header = StatusHeader::new(4, 1024, true);
        let mut stat = stat_file(&dir, &header);

        header.youngest_id = 3;
        header.youngest_slot = 2;
        header.oldest_slot = 0;
        header.begin_insert = 336;
        header.last_id_read = 1;
        header.commit(&mut stat).expect("commit");
        assert!(header.time_written > 0);

        let read = StatusHeader::read(&stat).expect("read");
        assert_eq!(read, header);
        assert_eq!(read.active_count(), 3);
        assert_eq!(read.oldest_id(), 1);
        assert!(read.slot_in_active_region(1));
        assert!(!read.slot_in_active_region(3));
    }

    #[test]
    fn detects_flipped_byte() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let mut header = StatusHeader::new(4, 1024, false);
        let mut stat = stat_file(&dir, &header);
        header.commit(&mut stat).unwrap();

        let mut value = [0u8; 1];
        stat.read_into(HDR_POS_BEGIN_INSERT + 3, &mut value);
        stat.write_from(HDR_POS_BEGIN_INSERT + 3, &[value[0] ^ 0x10]);
        match StatusHeader::read(&stat) {
            Err(Error::CorruptHeader { reason, .. }) => assert!(reason.contains("checksum")),
            other => panic!("expected corrupt header, got {:?}", other),
        }
    }

    #[test]
    fn detects_bad_magic() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let mut header = StatusHeader::new(2, 64, false);
        let mut stat = stat_file(&dir, &header);
        header.commit(&mut stat).unwrap();
        stat.write_from(HDR_POS_MAGIC, &0xdead_beef_u32.to_be_bytes());
        assert!(matches!(
            StatusHeader::read(&stat),
            Err(Error::CorruptHeader { .. })
        ));
    }

    #[test]
    fn wrapped_window_and_free_space() {
        let mut header = StatusHeader::new(4, 100, false);
        assert!(header.is_empty());
        assert_eq!(header.free_bytes(), 100);
        assert_eq!(header.active_count(), 0);

        header.youngest_id = 10;
        header.oldest_slot = 3;
        header.youngest_slot = 1;
        header.begin_insert = 20;
        header.end_insert = 60;
        assert_eq!(header.active_count(), 3);
        assert_eq!(header.oldest_id(), 8);
        assert!(header.slot_in_active_region(3));
        assert!(header.slot_in_active_region(0));
        assert!(!header.slot_in_active_region(2));
        assert_eq!(header.free_bytes(), 40);

        // full: head caught up with tail
        header.begin_insert = 60;
        assert_eq!(header.free_bytes(), 0);

        header.begin_insert = 90;
        header.end_insert = 10;
        assert_eq!(header.free_bytes(), 20);
    }

    #[test]
    fn consistency_rejects_out_of_range() {
        let mut header = StatusHeader::new(4, 100, false);
        assert!(header.check_consistency().is_ok());
        header.oldest_slot = 9;
        header.youngest_slot = 1;
        assert!(header.check_consistency().is_err());
        header.oldest_slot = 0;
        header.begin_insert = 100;
        assert!(header.check_consistency().is_err());
    }

    #[test]
    fn display_lists_fields() {
        let header = StatusHeader::new(4, 1024, true);
        let text = format!("{}", header);
        assert!(text.contains("nslots: 4"));
        assert!(text.contains("buf_size: 1024"));
        assert!(text.contains("youngest_slot: none"));
    }
}
