use crc::{Crc, CRC_32_CKSUM};

static CKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_CKSUM);

pub fn now_micros() -> u64 {
    return std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
}

pub fn compute_crc32(data: &[u8]) -> u32 {
    let mut digest = CKSUM.digest();
    digest.update(data);
    return digest.finalize();
}

pub fn pad4(len: usize) -> usize {
    return (len + 3) & !3;
}

pub fn next_slot(slot: u32, n_slots: u32) -> u32 {
    if slot + 1 >= n_slots {
        return 0;
    } else {
        return slot + 1;
    }
}

pub fn prev_slot(slot: u32, n_slots: u32) -> u32 {
    if slot == 0 {
        return n_slots - 1;
    } else {
        return slot - 1;
    }
}

/// Bytes from `from` forward to `to` in a ring of `size` bytes.
pub fn ring_distance(from: u32, to: u32, size: u32) -> u32 {
    if to >= from {
        return to - from;
    } else {
        return size - from + to;
    }
}

pub fn ring_advance(offset: u32, len: u32, size: u32) -> u32 {
    return ((offset as u64 + len as u64) % size as u64) as u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_sees_single_bit_changes() {
        assert_eq!(compute_crc32(b"abc"), compute_crc32(b"abc"));
        assert_ne!(compute_crc32(b"abc"), compute_crc32(b"abd"));
        assert_ne!(compute_crc32(&[0u8; 8]), compute_crc32(&[0u8; 9]));
    }

    #[test]
    fn ring_helpers() {
        assert_eq!(pad4(0), 0);
        assert_eq!(pad4(1), 4);
        assert_eq!(pad4(4), 4);
        assert_eq!(pad4(101), 104);

        assert_eq!(next_slot(3, 4), 0);
        assert_eq!(next_slot(0, 1), 0);
        assert_eq!(prev_slot(0, 4), 3);

        assert_eq!(ring_distance(10, 30, 100), 20);
        assert_eq!(ring_distance(90, 10, 100), 20);
        assert_eq!(ring_distance(5, 5, 100), 0);

        assert_eq!(ring_advance(90, 20, 100), 10);
        assert_eq!(ring_advance(90, 10, 100), 0);
    }
}
