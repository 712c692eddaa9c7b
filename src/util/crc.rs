//! Checksums for entry frames.

/// CRC32 (IEEE) of `data`.
#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_commit_and_abort_differ() {
        assert_ne!(crc32(b"commit"), crc32(b"abort"));
    }
}
