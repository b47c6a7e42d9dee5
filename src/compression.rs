use crate::error::{Error, Result};

const LEVEL: i32 = 3;

/// Compress `payload`, returning `None` when that would not make it smaller.
pub fn compress_if_smaller(payload: &[u8]) -> Result<Option<Vec<u8>>> {
    let compressed =
        zstd::bulk::compress(payload, LEVEL).map_err(|e| Error::Compression(e.to_string()))?;
    if compressed.len() < payload.len() {
        return Ok(Some(compressed));
    }
    return Ok(None);
}

pub fn compress(payload: &[u8]) -> Result<Vec<u8>> {
    return zstd::bulk::compress(payload, LEVEL).map_err(|e| Error::Compression(e.to_string()));
}

/// Decompress data stored for message `id`, which must expand to exactly
/// `msg_len` bytes.
pub fn decompress(data: &[u8], msg_len: u32, id: u32) -> Result<Vec<u8>> {
    let payload = zstd::bulk::decompress(data, msg_len as usize).map_err(|e| {
        Error::CorruptMessage {
            id,
            reason: format!("decompression failed: {}", e),
        }
    })?;
    if payload.len() != msg_len as usize {
        return Err(Error::CorruptMessage {
            id,
            reason: format!(
                "decompressed to {} bytes, expected {}",
                payload.len(),
                msg_len
            ),
        });
    }
    return Ok(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repetitive_payload_shrinks() {
        let payload = vec![b'a'; 4096];
        let compressed = compress_if_smaller(&payload).unwrap().expect("should shrink");
        assert!(compressed.len() < payload.len());
        assert_eq!(decompress(&compressed, 4096, 1).unwrap(), payload);
    }

    #[test]
    fn tiny_payload_is_left_alone() {
        assert!(compress_if_smaller(b"x").unwrap().is_none());
    }

    #[test]
    fn wrong_length_is_corrupt() {
        let compressed = compress(&vec![7u8; 100]).unwrap();
        assert!(matches!(
            decompress(&compressed, 99, 5),
            Err(Error::CorruptMessage { id: 5, .. })
        ));
        assert!(matches!(
            decompress(b"not zstd at all", 10, 6),
            Err(Error::CorruptMessage { id: 6, .. })
        ));
    }
}
