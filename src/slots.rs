use crate::constants::{
    HEADER_READ_ATTEMPTS, NO_SLOT, SLOT_POS_ACTIVE, SLOT_POS_CHECKSUM, SLOT_POS_COMPRESS,
    SLOT_POS_ID, SLOT_POS_MSG_LEN, SLOT_POS_OFFSET, SLOT_POS_SLOT_CHECKSUM, SLOT_POS_STORED_LEN,
    SLOT_POS_SUBTYPE, SLOT_POS_TIME, SLOT_POS_TYPE, SLOT_SIZE, STATUS_HEADER_SIZE,
};
use crate::error::{Error, Result};
use crate::mapped_file::MappedFile;
use crate::status::StatusHeader;
use crate::utils::{compute_crc32, next_slot, ring_advance};
use log::{debug, error, warn};
use std::fmt;

/// Directory entry describing one message in the data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Slot {
    pub active: bool,
    pub compress: bool,
    pub id: u32,
    pub time: u64,
    pub msg_len: u32,
    pub stored_len: u32,
    pub offset: u32,
    pub msg_type: i32,
    pub subtype: i32,
    /// CRC over the stored entry bytes in the buf file.
    pub checksum: u32,
}

fn slot_checksum(bytes: &[u8; SLOT_SIZE]) -> u32 {
    return compute_crc32(&bytes[..SLOT_POS_SLOT_CHECKSUM]);
}

impl Slot {
    pub fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut bytes = [0u8; SLOT_SIZE];
        bytes[SLOT_POS_ACTIVE] = self.active as u8;
        bytes[SLOT_POS_COMPRESS] = self.compress as u8;
        bytes[SLOT_POS_ID..SLOT_POS_ID + 4].copy_from_slice(&self.id.to_be_bytes());
        bytes[SLOT_POS_TIME..SLOT_POS_TIME + 8].copy_from_slice(&self.time.to_be_bytes());
        bytes[SLOT_POS_MSG_LEN..SLOT_POS_MSG_LEN + 4].copy_from_slice(&self.msg_len.to_be_bytes());
        bytes[SLOT_POS_STORED_LEN..SLOT_POS_STORED_LEN + 4]
            .copy_from_slice(&self.stored_len.to_be_bytes());
        bytes[SLOT_POS_OFFSET..SLOT_POS_OFFSET + 4].copy_from_slice(&self.offset.to_be_bytes());
        bytes[SLOT_POS_TYPE..SLOT_POS_TYPE + 4].copy_from_slice(&self.msg_type.to_be_bytes());
        bytes[SLOT_POS_SUBTYPE..SLOT_POS_SUBTYPE + 4].copy_from_slice(&self.subtype.to_be_bytes());
        bytes[SLOT_POS_CHECKSUM..SLOT_POS_CHECKSUM + 4].copy_from_slice(&self.checksum.to_be_bytes());

        let sum = slot_checksum(&bytes);
        bytes[SLOT_POS_SLOT_CHECKSUM..SLOT_POS_SLOT_CHECKSUM + 4].copy_from_slice(&sum.to_be_bytes());
        return bytes;
    }

    /// Decode a slot record, also reporting whether its own checksum holds.
    pub fn decode(bytes: &[u8; SLOT_SIZE]) -> (Slot, bool) {
        let get_u32 = |pos: usize| u32::from_be_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]);
        let mut time = [0u8; 8];
        time.copy_from_slice(&bytes[SLOT_POS_TIME..SLOT_POS_TIME + 8]);

        let slot = Slot {
            active: bytes[SLOT_POS_ACTIVE] != 0,
            compress: bytes[SLOT_POS_COMPRESS] != 0,
            id: get_u32(SLOT_POS_ID),
            time: u64::from_be_bytes(time),
            msg_len: get_u32(SLOT_POS_MSG_LEN),
            stored_len: get_u32(SLOT_POS_STORED_LEN),
            offset: get_u32(SLOT_POS_OFFSET),
            msg_type: get_u32(SLOT_POS_TYPE) as i32,
            subtype: get_u32(SLOT_POS_SUBTYPE) as i32,
            checksum: get_u32(SLOT_POS_CHECKSUM),
        };
        let valid = get_u32(SLOT_POS_SLOT_CHECKSUM) == slot_checksum(bytes);
        return (slot, valid);
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "active {}, id {}, time {}, msg_len {}, stored_len {}, offset {}, \
             type {}, subtype {}, compress {}, checksum {:#010x}",
            self.active as u8,
            self.id,
            self.time,
            self.msg_len,
            self.stored_len,
            self.offset,
            self.msg_type,
            self.subtype,
            self.compress,
            self.checksum
        )
    }
}

/// Where a requested id stands relative to the active window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Found { index: u32, slot: Slot },
    /// No longer retained; `oldest_id` is the oldest id still live (or the id
    /// the next write will get when nothing is live).
    Evicted { oldest_id: u32 },
    NotYetWritten,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// Slot `index` and `stored_len` bytes at `offset` are free. The header
    /// passed in has been updated for any evictions but not committed.
    Ready { index: u32, offset: u32, evicted: u32 },
    /// Making room would evict `unread_id`, which the canonical reader has not
    /// consumed yet. Nothing was changed.
    Blocked { unread_id: u32 },
}

pub fn slot_position(index: u32) -> usize {
    return STATUS_HEADER_SIZE + SLOT_SIZE * index as usize;
}

/// Read slot `index`, re-reading a few times if its checksum fails since the
/// writer may be updating it.
pub fn read_slot(stat: &MappedFile, n_slots: u32, index: u32) -> Result<Slot> {
    if index >= n_slots || slot_position(index + 1) > stat.len() {
        return Err(Error::CorruptHeader {
            path: stat.path().to_path_buf(),
            reason: format!("slot {} out of range for {} slots", index, n_slots),
        });
    }

    let mut bytes = [0u8; SLOT_SIZE];
    let mut slot = Slot::default();
    for _ in 0..HEADER_READ_ATTEMPTS {
        stat.read_into(slot_position(index), &mut bytes);
        let (decoded, valid) = Slot::decode(&bytes);
        if valid {
            return Ok(decoded);
        }
        slot = decoded;
        std::thread::yield_now();
    }

    return Err(Error::CorruptMessage {
        id: slot.id,
        reason: format!("slot {} checksum mismatch", index),
    });
}

/// Read slot `index` without checksum validation, for dumps and recovery.
pub fn read_slot_unchecked(stat: &MappedFile, index: u32) -> Option<(Slot, bool)> {
    if slot_position(index + 1) > stat.len() {
        return None;
    }
    let mut bytes = [0u8; SLOT_SIZE];
    stat.read_into(slot_position(index), &mut bytes);
    return Some(Slot::decode(&bytes));
}

pub fn write_slot(stat: &mut MappedFile, index: u32, slot: &Slot) -> Result<()> {
    if !stat.is_writable() {
        return Err(Error::ReadOnly(stat.path().to_path_buf()));
    }
    stat.write_from(slot_position(index), &slot.encode());
    return Ok(());
}

/// Index of the slot holding `id`, assuming `id` is inside the active window.
pub fn index_for_id(header: &StatusHeader, id: u32) -> u32 {
    let back = (header.youngest_id - id) % header.n_slots;
    return (header.youngest_slot + header.n_slots - back) % header.n_slots;
}

pub fn lookup(header: &StatusHeader, stat: &MappedFile, id: u32) -> Result<Lookup> {
    if id == 0 || id > header.youngest_id {
        return Ok(Lookup::NotYetWritten);
    }
    if header.is_empty() {
        return Ok(Lookup::Evicted {
            oldest_id: header.youngest_id.saturating_add(1),
        });
    }
    let oldest_id = header.oldest_id();
    if id < oldest_id {
        return Ok(Lookup::Evicted { oldest_id });
    }

    let index = index_for_id(header, id);
    let slot = read_slot(stat, header.n_slots, index)?;
    if !slot.active || slot.id != id {
        // the writer has moved on since this header was read
        debug!(
            "Slot {} holds id {} (active {}), wanted {}",
            index, slot.id, slot.active, id
        );
        return Ok(Lookup::Evicted {
            oldest_id: oldest_id.max(id.saturating_add(1)),
        });
    }
    return Ok(Lookup::Found { index, slot });
}

// Drop the oldest live slot from `header`, returning its index. Only the
// header copy changes, the caller writes the deactivated slot.
fn evict_oldest(header: &mut StatusHeader, stat: &MappedFile) -> Result<(u32, Slot)> {
    let index = header.oldest_slot;
    let slot = read_slot(stat, header.n_slots, index)?;

    let oldest_id = header.oldest_id();
    if slot.offset != header.end_insert || slot.id != oldest_id {
        error!(
            "Oldest slot {} is inconsistent with the header: id {} at {}, expected id {} at {}",
            index, slot.id, slot.offset, oldest_id, header.end_insert
        );
        return Err(Error::CorruptHeader {
            path: stat.path().to_path_buf(),
            reason: format!(
                "oldest slot {} holds id {} at {}, header expects id {} at {}",
                index, slot.id, slot.offset, oldest_id, header.end_insert
            ),
        });
    }
    if !slot.active {
        // a writer died after deactivating it but before committing
        warn!(
            "Oldest slot {} (id {}) was already evicted, finishing the eviction",
            index, slot.id
        );
    }

    if index == header.youngest_slot {
        // that was the last live message
        header.oldest_slot = NO_SLOT;
        header.end_insert = header.begin_insert;
    } else {
        header.oldest_slot = next_slot(index, header.n_slots);
        header.end_insert = ring_advance(header.end_insert, slot.stored_len, header.buffer_size);
    }
    return Ok((index, slot));
}

fn mark_evicted(stat: &mut MappedFile, evicted: &[(u32, Slot)]) -> Result<()> {
    for (index, slot) in evicted {
        let mut inactive = *slot;
        inactive.active = false;
        write_slot(stat, *index, &inactive)?;
    }
    return Ok(());
}

/// Pick the slot and byte range for the next message of `stored_len` bytes,
/// evicting from the oldest end until both a slot and the bytes are free.
///
/// If `protect` is set, no message with an id above it may be evicted; the
/// call returns `Blocked` without touching anything instead.
pub fn allocate_next(
    header: &mut StatusHeader,
    stat: &mut MappedFile,
    stored_len: u32,
    protect: Option<u32>,
) -> Result<Allocation> {
    if stored_len > header.buffer_size {
        return Err(Error::MessageTooLarge {
            stored_len: stored_len as usize,
            buffer_size: header.buffer_size,
        });
    }

    let index = if header.youngest_slot == NO_SLOT {
        0
    } else {
        next_slot(header.youngest_slot, header.n_slots)
    };

    // work out the evictions on a copy first so a blocked write changes nothing
    let mut planned = *header;
    let mut evicted: Vec<(u32, Slot)> = vec![];
    loop {
        let slot_taken = !planned.is_empty() && planned.oldest_slot == index;
        if !slot_taken && planned.free_bytes() >= stored_len {
            break;
        }
        if planned.is_empty() {
            // cannot happen with stored_len <= buffer_size, but never spin
            return Err(Error::CorruptHeader {
                path: stat.path().to_path_buf(),
                reason: "empty queue has no room for message".to_string(),
            });
        }

        let oldest_id = planned.oldest_id();
        if let Some(last_read) = protect {
            if oldest_id > last_read {
                return Ok(Allocation::Blocked { unread_id: oldest_id });
            }
        }
        evicted.push(evict_oldest(&mut planned, stat)?);
    }

    mark_evicted(stat, &evicted)?;
    if !evicted.is_empty() {
        debug!(
            "Evicted {} slot(s) to store {} bytes in slot {}",
            evicted.len(),
            stored_len,
            index
        );
    }
    *header = planned;

    return Ok(Allocation::Ready {
        index,
        offset: header.begin_insert,
        evicted: evicted.len() as u32,
    });
}
