//! Fixed-size redo log file header.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! offset 0   : 7 bytes   magic "ZM_REDO"
//! offset 7   : 1 byte    open flag (0 = closed cleanly, 1 = open/unclean)
//! offset 8   : 8 bytes   file size
//! offset 16  : 8 bytes   sequence number
//! offset 24  : 128 bytes server id: 1-byte length + up to 127 UTF-8 bytes + zero padding
//! offset 152 : 8 bytes   timestamp of first op
//! offset 160 : 8 bytes   timestamp of last op
//! offset 168 : 4 bytes   version (2-byte major, 2-byte minor)
//! offset 172 : 8 bytes   create time
//! offset 180..511        zero padding
//! ```

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use bytes::{Buf, BufMut, BytesMut};

use crate::{Error, Result};

use super::{HEADER_LEN, MAGIC};

/// Maximum encoded length of the server id.
pub const SERVER_ID_MAX_LEN: usize = 127;

/// Bytes actually used by header fields; the rest is padding.
const HEADER_USED_LEN: usize = 180;

/// Redo log format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    /// Highest version this code reads and the version it writes.
    pub const LATEST: Version = Version { major: 1, minor: 0 };

    /// Files written before versioning are read as this version.
    pub const BASELINE: Version = Version { major: 1, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Redo log file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHeader {
    /// Whether the file may end with a torn entry.
    pub open: bool,
    /// Total file size, header included.
    pub file_size: u64,
    /// Sequence assigned when the file was created.
    pub sequence: u64,
    /// Identity of the server that wrote the file.
    pub server_id: String,
    /// Timestamp of the first entry, 0 if none.
    pub first_op_time: i64,
    /// Timestamp of the last entry, 0 if none.
    pub last_op_time: i64,
    /// Format version.
    pub version: Version,
    /// File creation time in milliseconds.
    pub create_time: i64,
}

impl LogHeader {
    /// Create a header for a new, empty log file.
    pub fn new(sequence: u64, server_id: impl Into<String>, create_time: i64) -> Self {
        Self {
            open: false,
            file_size: HEADER_LEN as u64,
            sequence,
            server_id: truncate_server_id(server_id.into()),
            first_op_time: 0,
            last_op_time: 0,
            version: Version::LATEST,
            create_time,
        }
    }

    /// Serialize the header. The result is always [`HEADER_LEN`] bytes.
    pub fn serialize(&self) -> [u8; HEADER_LEN] {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_slice(MAGIC);
        buf.put_u8(u8::from(self.open));
        buf.put_u64(self.file_size);
        buf.put_u64(self.sequence);

        let server_id = truncate_server_id(self.server_id.clone());
        let id_bytes = server_id.as_bytes();
        buf.put_u8(id_bytes.len() as u8);
        buf.put_slice(id_bytes);
        buf.put_bytes(0, SERVER_ID_MAX_LEN - id_bytes.len());

        buf.put_i64(self.first_op_time);
        buf.put_i64(self.last_op_time);
        buf.put_u16(self.version.major);
        buf.put_u16(self.version.minor);
        buf.put_i64(self.create_time);
        debug_assert_eq!(buf.len(), HEADER_USED_LEN);
        buf.put_bytes(0, HEADER_LEN - HEADER_USED_LEN);

        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// Deserialize a header.
    ///
    /// Fails with [`Error::CorruptHeader`] on a short buffer, a magic mismatch
    /// or a version newer than [`Version::LATEST`].
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::corrupt_header(format!(
                "header needs {} bytes, got {}",
                HEADER_LEN,
                bytes.len()
            )));
        }

        let mut buf = &bytes[..HEADER_LEN];
        if &buf[..MAGIC.len()] != MAGIC {
            return Err(Error::corrupt_header("missing redo log magic"));
        }
        buf.advance(MAGIC.len());

        let open = buf.get_u8() != 0;
        let file_size = buf.get_u64();
        let sequence = buf.get_u64();

        let id_len = buf.get_u8() as usize;
        if id_len > SERVER_ID_MAX_LEN {
            return Err(Error::corrupt_header(format!(
                "server id length {} exceeds {}",
                id_len, SERVER_ID_MAX_LEN
            )));
        }
        let server_id = std::str::from_utf8(&buf[..id_len])
            .map_err(|_| Error::corrupt_header("server id is not valid UTF-8"))?
            .to_string();
        buf.advance(SERVER_ID_MAX_LEN);

        let first_op_time = buf.get_i64();
        let last_op_time = buf.get_i64();
        let mut version = Version::new(buf.get_u16(), buf.get_u16());
        let create_time = buf.get_i64();

        if version > Version::LATEST {
            return Err(Error::corrupt_header(format!(
                "version {} is newer than supported {}",
                version,
                Version::LATEST
            )));
        }
        if version < Version::BASELINE {
            version = Version::BASELINE;
        }

        Ok(Self {
            open,
            file_size,
            sequence,
            server_id,
            first_op_time,
            last_op_time,
            version,
            create_time,
        })
    }

    /// Read the header from the start of a file.
    pub fn read_from(file: &mut File) -> Result<Self> {
        let mut buf = [0u8; HEADER_LEN];
        file.seek(SeekFrom::Start(0))?;
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Self::deserialize(&buf[..filled])
    }

    /// Write the header at the start of a file, leaving the cursor at EOF.
    pub fn write_to(&self, file: &mut File) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.serialize())?;
        file.seek(SeekFrom::End(0))?;
        Ok(())
    }
}

/// Drop trailing characters until the UTF-8 form fits the server id field.
fn truncate_server_id(mut id: String) -> String {
    while id.len() > SERVER_ID_MAX_LEN {
        id.pop();
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LogHeader {
        LogHeader {
            open: true,
            file_size: 4096,
            sequence: 77,
            server_id: "mailbox-01.example.com".to_string(),
            first_op_time: 1_700_000_000_000,
            last_op_time: 1_700_000_005_000,
            version: Version::LATEST,
            create_time: 1_699_999_999_000,
        }
    }

    #[test]
    fn test_serialize_is_fixed_length() {
        assert_eq!(sample().serialize().len(), HEADER_LEN);
        assert_eq!(LogHeader::new(0, "", 0).serialize().len(), HEADER_LEN);
    }

    #[test]
    fn test_round_trip() {
        let header = sample();
        let decoded = LogHeader::deserialize(&header.serialize()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_field_offsets() {
        let bytes = sample().serialize();
        assert_eq!(&bytes[0..7], b"ZM_REDO");
        assert_eq!(bytes[7], 1);
        assert_eq!(u64::from_be_bytes(bytes[8..16].try_into().unwrap()), 4096);
        assert_eq!(u64::from_be_bytes(bytes[16..24].try_into().unwrap()), 77);
        assert_eq!(bytes[24] as usize, "mailbox-01.example.com".len());
        assert_eq!(u16::from_be_bytes(bytes[168..170].try_into().unwrap()), 1);
        assert_eq!(
            i64::from_be_bytes(bytes[172..180].try_into().unwrap()),
            1_699_999_999_000
        );
        assert!(bytes[180..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_server_id_truncated_on_char_boundary() {
        // 64 two-byte characters = 128 bytes, one byte over the limit.
        let id: String = std::iter::repeat('é').take(64).collect();
        let header = LogHeader::new(1, id, 0);
        assert_eq!(header.server_id.chars().count(), 63);
        assert!(header.server_id.len() <= SERVER_ID_MAX_LEN);

        let decoded = LogHeader::deserialize(&header.serialize()).unwrap();
        assert_eq!(decoded.server_id, header.server_id);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let bytes = sample().serialize();
        let err = LogHeader::deserialize(&bytes[..100]).unwrap_err();
        assert!(matches!(err, Error::CorruptHeader(_)));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = sample().serialize();
        bytes[0] = b'X';
        assert!(matches!(
            LogHeader::deserialize(&bytes),
            Err(Error::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut header = sample();
        header.version = Version::new(Version::LATEST.major, Version::LATEST.minor + 1);
        assert!(matches!(
            LogHeader::deserialize(&header.serialize()),
            Err(Error::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_legacy_version_upgraded() {
        let mut header = sample();
        header.version = Version::new(0, 9);
        let decoded = LogHeader::deserialize(&header.serialize()).unwrap();
        assert_eq!(decoded.version, Version::BASELINE);
    }

    #[test]
    fn test_file_read_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();

        let header = sample();
        header.write_to(&mut file).unwrap();
        assert_eq!(file.metadata().unwrap().len(), HEADER_LEN as u64);
        assert_eq!(LogHeader::read_from(&mut file).unwrap(), header);
    }
}
