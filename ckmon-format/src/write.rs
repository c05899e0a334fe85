// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::entry::{Conclusion, EntryKind, ExceptionData, LogEntry, MulticastInfo};
use crate::varint;
use crate::{CURRENT_STREAM_VERSION, MIN_STREAM_VERSION, STREAM_MAGIC};
use byteorder::{LittleEndian, WriteBytesExt};
use ckmon_common::DateTimeStamp;
use std::io::{self, Write};

// Entry prelude, two bytes.
//
// byte 0: bits 0..=3 level-ex nibble, bits 4..=5 entry kind
//         (3 = extension, a third byte then carries the kind),
//         bit 6 has-filename, bit 7 has-tags.
// byte 1: bit 0 has-exception, bit 1 has-conclusions, bit 2 has-multicast,
//         bit 3 has-text.
pub(crate) const KIND_SHIFT: u32 = 4;
pub(crate) const KIND_MASK: u8 = 0b0011_0000;
pub(crate) const KIND_EXTENSION: u8 = 3;
pub(crate) const FLAG0_FILENAME: u8 = 0b0100_0000;
pub(crate) const FLAG0_TAGS: u8 = 0b1000_0000;
pub(crate) const FLAG1_EXCEPTION: u8 = 0b0001;
pub(crate) const FLAG1_CONCLUSIONS: u8 = 0b0010;
pub(crate) const FLAG1_MULTICAST: u8 = 0b0100;
pub(crate) const FLAG1_TEXT: u8 = 0b1000;
pub(crate) const PREV_KIND_NONE: u8 = 0xFF;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("unsupported stream version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid entry: {0}")]
    InvalidEntry(&'static str),
    #[error("writer is closed")]
    Closed,
}

/// Sequential writer of a `.ckmon` stream. Single writer per stream, no
/// interleaving: the header goes out on construction, entries with
/// [`LogWriter::write_entry`], and the zero terminator with
/// [`LogWriter::close`]. Dropping without closing leaves a truncated stream
/// that readers report through `bad_end_of_file`.
#[derive(Debug)]
pub struct LogWriter<W: Write> {
    out: W,
    version: u8,
    closed: bool,
}

impl<W: Write> LogWriter<W> {
    /// Starts a stream at [`CURRENT_STREAM_VERSION`].
    pub fn new(out: W) -> Result<Self, WriteError> {
        Self::with_version(out, CURRENT_STREAM_VERSION)
    }

    /// Starts a stream at an explicit version, for reproducing legacy
    /// streams. Entries are written in that version's layout; callers should
    /// pass values the version can represent (see
    /// [`LogEntry::canonical_for_version`]).
    pub fn with_version(mut out: W, version: u8) -> Result<Self, WriteError> {
        if !(MIN_STREAM_VERSION..=CURRENT_STREAM_VERSION).contains(&version) {
            return Err(WriteError::UnsupportedVersion(version));
        }
        out.write_all(&STREAM_MAGIC)?;
        out.write_u8(version)?;
        Ok(Self {
            out,
            version,
            closed: false,
        })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn write_entry(&mut self, entry: &LogEntry) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }
        entry.validate().map_err(WriteError::InvalidEntry)?;

        let mut level = entry.level;
        if self.version < 7 {
            level.is_filtered = false;
        }
        let mut b0 = level.to_nibble() | (entry.kind.code() << KIND_SHIFT);
        let mut b1 = 0u8;
        if entry.origin.is_some() {
            b0 |= FLAG0_FILENAME;
        }
        if !entry.tags.is_empty() {
            b0 |= FLAG0_TAGS;
        }
        if entry.exception.is_some() {
            b1 |= FLAG1_EXCEPTION;
        }
        if !entry.conclusions.is_empty() {
            b1 |= FLAG1_CONCLUSIONS;
        }
        if entry.multicast.is_some() {
            b1 |= FLAG1_MULTICAST;
        }
        if entry.text.is_some() {
            b1 |= FLAG1_TEXT;
        }
        self.out.write_all(&[b0, b1])?;

        if let Some(text) = &entry.text {
            self.write_string(text)?;
        }
        self.write_time(entry.time)?;
        if let Some(origin) = &entry.origin {
            self.write_string(&origin.file)?;
            varint::write_u64(&mut self.out, u64::from(origin.line))?;
        }
        if !entry.tags.is_empty() {
            self.write_string(entry.tags.as_str())?;
        }
        if let Some(exception) = &entry.exception {
            self.write_exception(exception)?;
        }
        if !entry.conclusions.is_empty() {
            self.write_conclusions(&entry.conclusions)?;
        }
        if let Some(multicast) = &entry.multicast {
            self.write_multicast(multicast)?;
        }
        Ok(())
    }

    /// Writes the zero terminator, flushes and returns the underlying writer.
    pub fn close(mut self) -> Result<W, WriteError> {
        self.out.write_u8(0)?;
        self.out.flush()?;
        self.closed = true;
        Ok(self.out)
    }

    pub fn flush(&mut self) -> Result<(), WriteError> {
        Ok(self.out.flush()?)
    }

    fn write_string(&mut self, s: &str) -> Result<(), WriteError> {
        varint::write_u64(&mut self.out, s.len() as u64)?;
        self.out.write_all(s.as_bytes())?;
        Ok(())
    }

    fn write_time(&mut self, time: DateTimeStamp) -> Result<(), WriteError> {
        self.out.write_i64::<LittleEndian>(time.ticks_utc)?;
        if self.version >= 9 {
            self.out.write_u8(time.uniquifier)?;
        }
        Ok(())
    }

    fn write_exception(&mut self, exception: &ExceptionData) -> Result<(), WriteError> {
        let mut flags = 0u8;
        if exception.stack_trace.is_some() {
            flags |= 1;
        }
        if exception.inner.is_some() {
            flags |= 2;
        }
        self.out.write_u8(flags)?;
        self.write_string(&exception.message)?;
        if let Some(stack) = &exception.stack_trace {
            self.write_string(stack)?;
        }
        if let Some(inner) = &exception.inner {
            self.write_exception(inner)?;
        }
        Ok(())
    }

    fn write_conclusions(&mut self, conclusions: &[Conclusion]) -> Result<(), WriteError> {
        self.out.write_u8(conclusions.len() as u8)?;
        for c in conclusions {
            if self.version >= 8 {
                self.write_string(c.tag.as_str())?;
            }
            self.write_string(&c.text)?;
        }
        Ok(())
    }

    fn write_multicast(&mut self, multicast: &MulticastInfo) -> Result<(), WriteError> {
        self.write_string(&multicast.monitor_id)?;
        self.out.write_u8(
            multicast
                .prev_kind
                .map(EntryKind::code)
                .unwrap_or(PREV_KIND_NONE),
        )?;
        self.write_time(multicast.prev_time)?;
        varint::write_u64(&mut self.out, u64::from(multicast.group_depth))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ckmon_common::{LogLevel, TagSet};

    #[test]
    fn test_header_and_terminator() {
        let writer = LogWriter::new(Vec::new()).unwrap();
        let bytes = writer.close().unwrap();
        assert_eq!(&bytes[..4], b"ckm1");
        assert_eq!(bytes[4], CURRENT_STREAM_VERSION);
        assert_eq!(*bytes.last().unwrap(), 0);
        assert_eq!(bytes.len(), 6);
    }

    #[test]
    fn test_version_bounds() {
        assert!(matches!(
            LogWriter::with_version(Vec::new(), 4),
            Err(WriteError::UnsupportedVersion(4))
        ));
        assert!(matches!(
            LogWriter::with_version(Vec::new(), 10),
            Err(WriteError::UnsupportedVersion(10))
        ));
        assert!(LogWriter::with_version(Vec::new(), 5).is_ok());
    }

    #[test]
    fn test_rejects_level_none() {
        let mut writer = LogWriter::new(Vec::new()).unwrap();
        let entry = LogEntry::line(
            LogLevel::None,
            TagSet::EMPTY,
            "x",
            DateTimeStamp::new(1, 0),
        );
        assert!(matches!(
            writer.write_entry(&entry),
            Err(WriteError::InvalidEntry(_))
        ));
    }

    #[test]
    fn test_rejects_missing_text() {
        let mut writer = LogWriter::new(Vec::new()).unwrap();
        let mut entry = LogEntry::line(
            LogLevel::Info,
            TagSet::EMPTY,
            "x",
            DateTimeStamp::new(1, 0),
        );
        entry.text = None;
        assert!(matches!(
            writer.write_entry(&entry),
            Err(WriteError::InvalidEntry(_))
        ));
    }

    #[test]
    fn test_first_entry_byte_is_never_zero() {
        // A zero byte in entry position is the end-of-stream marker, so the
        // level invariant must keep the prelude byte nonzero.
        let mut writer = LogWriter::new(Vec::new()).unwrap();
        let entry = LogEntry::line(
            LogLevel::Debug,
            TagSet::EMPTY,
            "x",
            DateTimeStamp::new(1, 0),
        );
        writer.write_entry(&entry).unwrap();
        let bytes = writer.close().unwrap();
        assert_ne!(bytes[5], 0);
    }
}
