//! Redo log replay.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::warn;

use crate::types::{LogEntry, FRAME_PREFIX_LEN};
use crate::{Error, Result};

use super::header::LogHeader;
use super::HEADER_LEN;

/// Sequential reader over the entries of one log file.
///
/// A frame cut short at the end of the file is treated as end of log when
/// the header says the file was never closed (the writer died mid-append);
/// in a cleanly closed file it is corruption. A CRC mismatch is always
/// corruption.
pub struct FileLogReader {
    path: PathBuf,
    reader: BufReader<File>,
    header: LogHeader,
    position: u64,
    file_len: u64,
}

impl FileLogReader {
    /// Open a log and validate its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let header = LogHeader::read_from(&mut file)?;
        file.seek(SeekFrom::Start(HEADER_LEN as u64))?;

        Ok(Self {
            path,
            reader: BufReader::new(file),
            header,
            position: HEADER_LEN as u64,
            file_len,
        })
    }

    /// Read every entry of a log.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<LogEntry>> {
        let mut reader = Self::open(path)?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the next frame.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Next entry, or `None` at end of log.
    pub fn next_entry(&mut self) -> Result<Option<LogEntry>> {
        let remaining = self.file_len.saturating_sub(self.position);
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < FRAME_PREFIX_LEN as u64 {
            return self.torn_frame(remaining);
        }

        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        self.reader.read_exact(&mut prefix)?;
        let frame_len = (FRAME_PREFIX_LEN + LogEntry::frame_body_len(&prefix)) as u64;
        if frame_len > remaining {
            return self.torn_frame(remaining);
        }

        let mut frame = vec![0u8; frame_len as usize];
        frame[..FRAME_PREFIX_LEN].copy_from_slice(&prefix);
        self.reader.read_exact(&mut frame[FRAME_PREFIX_LEN..])?;
        let entry = LogEntry::decode(&frame).map_err(|err| {
            Error::corruption(format!(
                "{} at offset {}: {}",
                self.path.display(),
                self.position,
                err
            ))
        })?;

        self.position += frame_len;
        Ok(Some(entry))
    }

    fn torn_frame(&mut self, remaining: u64) -> Result<Option<LogEntry>> {
        if self.header.open {
            warn!(
                "event=torn_tail path={} offset={} bytes={}",
                self.path.display(),
                self.position,
                remaining
            );
            self.position = self.file_len;
            return Ok(None);
        }
        Err(Error::corruption(format!(
            "{}: truncated entry at offset {} in a closed log",
            self.path.display(),
            self.position
        )))
    }
}

impl Iterator for FileLogReader {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
