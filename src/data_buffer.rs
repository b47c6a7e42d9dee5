use crate::constants::{
    BUF_MAGIC, ENTRY_OVERHEAD, ENTRY_POS_DATA_LEN, ENTRY_POS_MAGIC, ENTRY_POS_SLOT,
    ENTRY_PREFIX_SIZE, ENTRY_SUFFIX_SIZE,
};
use crate::error::{Error, Result};
use crate::mapped_file::MappedFile;
use crate::slots::Slot;
use crate::utils::{compute_crc32, pad4};

/// The circular payload region, the whole of the buf file. Offsets and
/// lengths are range checked here and any access crossing the end of the
/// buffer is split in two, so nothing above this layer reasons about the wrap.
pub struct DataBuffer {
    file: MappedFile,
}

/// Bytes an entry carrying `data_len` bytes of data occupies in the buffer.
pub fn stored_len_for(data_len: usize) -> usize {
    return pad4(data_len) + ENTRY_OVERHEAD;
}

pub fn compute_checksum(bytes: &[u8]) -> u32 {
    return compute_crc32(bytes);
}

pub fn verify_checksum(bytes: &[u8], expected: u32) -> bool {
    return compute_crc32(bytes) == expected;
}

/// Frame `data` for slot `index` and message `id`.
pub fn encode_entry(index: u32, id: u32, data: &[u8]) -> Vec<u8> {
    let stored_len = stored_len_for(data.len());
    let mut entry = vec![0u8; stored_len];
    entry[ENTRY_POS_MAGIC..ENTRY_POS_MAGIC + 4].copy_from_slice(&BUF_MAGIC.to_be_bytes());
    entry[ENTRY_POS_SLOT..ENTRY_POS_SLOT + 4].copy_from_slice(&index.to_be_bytes());
    entry[ENTRY_POS_DATA_LEN..ENTRY_POS_DATA_LEN + 4]
        .copy_from_slice(&(data.len() as u32).to_be_bytes());
    entry[ENTRY_PREFIX_SIZE..ENTRY_PREFIX_SIZE + data.len()].copy_from_slice(data);
    entry[stored_len - ENTRY_SUFFIX_SIZE..].copy_from_slice(&id.to_be_bytes());
    return entry;
}

/// Validate an entry fetched for `slot` (held in slot `index`) and return the
/// stored data inside it.
pub fn decode_entry<'a>(entry: &'a [u8], slot: &Slot, index: u32) -> Result<&'a [u8]> {
    let bad = |reason: String| Error::CorruptMessage {
        id: slot.id,
        reason,
    };
    let get_u32 = |pos: usize| u32::from_be_bytes([entry[pos], entry[pos + 1], entry[pos + 2], entry[pos + 3]]);

    if entry.len() != slot.stored_len as usize || entry.len() < ENTRY_OVERHEAD {
        return Err(bad(format!(
            "entry is {} bytes, slot says {}",
            entry.len(),
            slot.stored_len
        )));
    }
    if !verify_checksum(entry, slot.checksum) {
        return Err(bad(format!(
            "checksum is {:#010x}, should be {:#010x}",
            compute_checksum(entry),
            slot.checksum
        )));
    }

    let magic = get_u32(ENTRY_POS_MAGIC);
    if magic != BUF_MAGIC {
        return Err(bad(format!("bad entry magic cookie {:#010x}", magic)));
    }
    let slot_check = get_u32(ENTRY_POS_SLOT);
    if slot_check != index {
        return Err(bad(format!(
            "entry written for slot {}, found in slot {}",
            slot_check, index
        )));
    }
    let id_check = get_u32(entry.len() - ENTRY_SUFFIX_SIZE);
    if id_check != slot.id {
        return Err(bad(format!("entry ends with id {}", id_check)));
    }
    let data_len = get_u32(ENTRY_POS_DATA_LEN) as usize;
    if stored_len_for(data_len) != entry.len() {
        return Err(bad(format!(
            "data length {} does not fit entry of {} bytes",
            data_len,
            entry.len()
        )));
    }
    return Ok(&entry[ENTRY_PREFIX_SIZE..ENTRY_PREFIX_SIZE + data_len]);
}

impl DataBuffer {
    pub fn new(file: MappedFile) -> DataBuffer {
        return DataBuffer { file };
    }

    pub fn size(&self) -> u32 {
        return self.file.len() as u32;
    }

    pub fn file(&self) -> &MappedFile {
        return &self.file;
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<()> {
        if offset as usize >= self.file.len() || len > self.file.len() {
            return Err(Error::CorruptHeader {
                path: self.file.path().to_path_buf(),
                reason: format!(
                    "range {}+{} outside buffer of {} bytes",
                    offset,
                    len,
                    self.file.len()
                ),
            });
        }
        return Ok(());
    }

    pub fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        if !self.file.is_writable() {
            return Err(Error::ReadOnly(self.file.path().to_path_buf()));
        }
        self.check_range(offset, bytes.len())?;

        let start = offset as usize;
        let tail_room = self.file.len() - start;
        if bytes.len() <= tail_room {
            self.file.write_from(start, bytes);
        } else {
            // tail of the buffer, then the head
            let (tail, head) = bytes.split_at(tail_room);
            self.file.write_from(start, tail);
            self.file.write_from(0, head);
        }
        return Ok(());
    }

    pub fn read_into(&self, offset: u32, out: &mut [u8]) -> Result<()> {
        self.check_range(offset, out.len())?;

        let start = offset as usize;
        let tail_room = self.file.len() - start;
        if out.len() <= tail_room {
            self.file.read_into(start, out);
        } else {
            let (tail, head) = out.split_at_mut(tail_room);
            self.file.read_into(start, tail);
            self.file.read_into(0, head);
        }
        return Ok(());
    }

    pub fn read(&self, offset: u32, len: u32) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len as usize];
        self.read_into(offset, &mut out)?;
        return Ok(out);
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()?;
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(dir: &tempfile::TempDir, size: usize) -> DataBuffer {
        let file = MappedFile::create(&dir.path().join("q.buf"), size).unwrap();
        return DataBuffer::new(file);
    }

    #[test]
    fn wrapped_writes_read_back() {
        let dir = tempfile::tempdir().unwrap();
        for size in [1usize, 7, 64, 1000] {
            let mut buf = buffer(&dir, size);
            for len in [1usize, size / 2, size] {
                if len == 0 {
                    continue;
                }
                let data: Vec<u8> = (0..len).map(|i| (i * 31 + len) as u8).collect();
                // every start position, including ones that split the write
                for offset in 0..size as u32 {
                    buf.write(offset, &data).expect("write");
                    assert_eq!(buf.read(offset, len as u32).expect("read"), data);
                }
            }
        }
    }

    #[test]
    fn split_lands_at_both_ends() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = buffer(&dir, 10);
        buf.write(7, &[1, 2, 3, 4, 5]).unwrap();
        let raw = buf.read(0, 10).unwrap();
        assert_eq!(raw, vec![4, 5, 0, 0, 0, 0, 0, 1, 2, 3]);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = buffer(&dir, 16);
        assert!(buf.write(16, &[1]).is_err());
        assert!(buf.write(0, &[0u8; 17]).is_err());
        assert!(buf.read(3, 17).is_err());
    }

    #[test]
    fn entry_framing() {
        let data = b"new data available";
        let entry = encode_entry(3, 42, data);
        assert_eq!(entry.len(), stored_len_for(data.len()));
        assert_eq!(entry.len() % 4, 0);
        assert_eq!(entry.len(), 20 + ENTRY_OVERHEAD);

        let slot = Slot {
            active: true,
            id: 42,
            stored_len: entry.len() as u32,
            checksum: compute_checksum(&entry),
            ..Slot::default()
        };
        assert_eq!(decode_entry(&entry, &slot, 3).unwrap(), data);

        // wrong slot index
        assert!(matches!(
            decode_entry(&entry, &slot, 2),
            Err(Error::CorruptMessage { id: 42, .. })
        ));
    }

    #[test]
    fn any_flipped_byte_is_caught() {
        let data: Vec<u8> = (0..37u8).collect();
        let entry = encode_entry(0, 9, &data);
        let slot = Slot {
            active: true,
            id: 9,
            stored_len: entry.len() as u32,
            checksum: compute_checksum(&entry),
            ..Slot::default()
        };
        for pos in 0..entry.len() {
            let mut damaged = entry.clone();
            damaged[pos] ^= 0x01;
            assert!(
                decode_entry(&damaged, &slot, 0).is_err(),
                "flip at {} went unnoticed",
                pos
            );
        }
    }

    #[test]
    fn empty_payload_is_framed() {
        let entry = encode_entry(1, 1, &[]);
        assert_eq!(entry.len(), ENTRY_OVERHEAD);
        let slot = Slot {
            active: true,
            id: 1,
            stored_len: entry.len() as u32,
            checksum: compute_checksum(&entry),
            ..Slot::default()
        };
        assert!(decode_entry(&entry, &slot, 1).unwrap().is_empty());
    }
}
