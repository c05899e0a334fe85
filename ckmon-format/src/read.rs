// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::entry::{Conclusion, EntryKind, ExceptionData, LogEntry, MulticastInfo, SourceOrigin};
use crate::varint;
use crate::write::{
    FLAG0_FILENAME, FLAG0_TAGS, FLAG1_CONCLUSIONS, FLAG1_EXCEPTION, FLAG1_MULTICAST, FLAG1_TEXT,
    KIND_EXTENSION, KIND_MASK, KIND_SHIFT, PREV_KIND_NONE,
};
use crate::{CURRENT_STREAM_VERSION, MIN_STREAM_VERSION, STREAM_MAGIC};
use byteorder::{LittleEndian, ReadBytesExt};
use ckmon_common::{DateTimeStamp, LogLevelEx, TagSet};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Strings longer than this are considered stream corruption rather than
/// data.
const MAX_STRING_LEN: u64 = 64 * 1024 * 1024;
/// Bound on nested inner exceptions.
const MAX_EXCEPTION_DEPTH: u32 = 64;
/// Gzip member magic.
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("bad stream magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("unsupported stream version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid entry header byte {0:#04x}")]
    InvalidHeader(u8),
    #[error("invalid previous-entry kind byte {0:#04x}")]
    InvalidPrevKind(u8),
    #[error("string of {0} bytes exceeds the sanity bound")]
    StringTooLong(u64),
    #[error("invalid utf-8 in string")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("malformed entry: {0}")]
    Malformed(&'static str),
    #[error("stream truncated inside an entry")]
    Truncated,
    #[error("offset {0} does not address an entry")]
    OffsetOutOfRange(u64),
}

fn map_eof(e: io::Error) -> ReadError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => ReadError::Truncated,
        io::ErrorKind::InvalidData => ReadError::Malformed("invalid varint"),
        _ => ReadError::Io(e),
    }
}

/// Restricts a cursor to one monitor's entries up to a byte offset
/// (inclusive). Offsets grow monotonically, so the first entry past
/// `last_offset` ends the iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastFilter {
    pub monitor_id: String,
    pub last_offset: u64,
}

impl MulticastFilter {
    pub fn new(monitor_id: impl Into<String>, last_offset: u64) -> Self {
        Self {
            monitor_id: monitor_id.into(),
            last_offset,
        }
    }
}

/// Byte-counting wrapper that gives gzip-decoded input a stable logical
/// position.
struct CountingReader<R> {
    inner: R,
    position: u64,
}

impl<R: Read> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

/// Forward-only cursor over a `.ckmon` stream.
///
/// `move_next` advances to the next entry and returns `false` at end of
/// stream; the terminal state is then described by
/// [`EntryCursor::bad_end_of_file`] (input ended without the zero terminator)
/// and [`EntryCursor::read_error`] (the stream broke mid-entry).
pub struct EntryCursor {
    input: CountingReader<Box<dyn Read + Send>>,
    version: u8,
    filter: Option<MulticastFilter>,
    current: Option<LogEntry>,
    current_offset: u64,
    read_error: Option<ReadError>,
    bad_end_of_file: bool,
    finished: bool,
}

impl EntryCursor {
    /// Opens a stream at its first entry.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReadError> {
        Self::open_filtered(path, 0, None)
    }

    /// Opens a stream positioned at `offset` (a value previously observed
    /// through [`EntryCursor::stream_offset`], or 0 for the start).
    pub fn open_at(path: impl AsRef<Path>, offset: u64) -> Result<Self, ReadError> {
        Self::open_filtered(path, offset, None)
    }

    /// Opens a stream at `offset` with an optional multicast filter.
    pub fn open_filtered(
        path: impl AsRef<Path>,
        offset: u64,
        filter: Option<MulticastFilter>,
    ) -> Result<Self, ReadError> {
        let file = BufReader::new(File::open(path)?);
        Self::from_reader(file, offset, filter)
    }

    /// Opens over any byte source (gzip detected on the first two bytes).
    pub fn from_reader(
        mut source: impl Read + Send + 'static,
        offset: u64,
        filter: Option<MulticastFilter>,
    ) -> Result<Self, ReadError> {
        let mut sniff = [0u8; 2];
        source.read_exact(&mut sniff).map_err(map_eof)?;
        let chained = io::Cursor::new(sniff).chain(source);
        let decoded: Box<dyn Read + Send> = if sniff == GZIP_MAGIC {
            Box::new(GzDecoder::new(chained))
        } else {
            Box::new(chained)
        };
        let mut input = CountingReader::new(decoded);

        let mut magic = [0u8; 4];
        input.read_exact(&mut magic).map_err(map_eof)?;
        if magic != STREAM_MAGIC {
            return Err(ReadError::BadMagic(magic));
        }
        let version = input.read_u8().map_err(map_eof)?;
        if !(MIN_STREAM_VERSION..=CURRENT_STREAM_VERSION).contains(&version) {
            return Err(ReadError::UnsupportedVersion(version));
        }

        if offset > input.position {
            let to_skip = offset - input.position;
            let skipped = io::copy(&mut (&mut input).take(to_skip), &mut io::sink())?;
            if skipped != to_skip {
                return Err(ReadError::OffsetOutOfRange(offset));
            }
        } else if offset != 0 && offset != input.position {
            return Err(ReadError::OffsetOutOfRange(offset));
        }

        Ok(Self {
            input,
            version,
            filter,
            current: None,
            current_offset: 0,
            read_error: None,
            bad_end_of_file: false,
            finished: false,
        })
    }

    pub fn stream_version(&self) -> u8 {
        self.version
    }

    /// The entry produced by the last successful `move_next`.
    pub fn current(&self) -> Option<&LogEntry> {
        self.current.as_ref()
    }

    /// Logical byte offset of the current entry.
    pub fn stream_offset(&self) -> u64 {
        self.current_offset
    }

    /// True iff the input ended before the zero terminator was consumed.
    pub fn bad_end_of_file(&self) -> bool {
        self.bad_end_of_file
    }

    /// The error that broke the stream mid-entry, if any.
    pub fn read_error(&self) -> Option<&ReadError> {
        self.read_error.as_ref()
    }

    /// Advances to the next entry. Returns `false` at end of stream; the
    /// cursor stays terminal afterwards.
    pub fn move_next(&mut self) -> bool {
        if self.finished {
            return false;
        }
        loop {
            let entry_offset = self.input.position;
            let b0 = match self.read_byte_or_eof() {
                Ok(Some(b)) => b,
                Ok(None) => {
                    self.bad_end_of_file = true;
                    return self.finish();
                }
                Err(e) => {
                    self.read_error = Some(e);
                    return self.finish();
                }
            };
            if b0 == 0 {
                // Clean termination.
                return self.finish();
            }
            let entry = match self.read_entry_body(b0) {
                Ok(entry) => entry,
                Err(e) => {
                    if matches!(e, ReadError::Truncated) {
                        self.bad_end_of_file = true;
                    }
                    self.read_error = Some(e);
                    return self.finish();
                }
            };
            if let Some(filter) = &self.filter {
                if entry_offset > filter.last_offset {
                    return self.finish();
                }
                let matches = entry
                    .multicast
                    .as_ref()
                    .is_some_and(|m| m.monitor_id == filter.monitor_id);
                if !matches {
                    continue;
                }
            }
            self.current = Some(entry);
            self.current_offset = entry_offset;
            return true;
        }
    }

    fn finish(&mut self) -> bool {
        self.finished = true;
        self.current = None;
        false
    }

    fn read_byte_or_eof(&mut self) -> Result<Option<u8>, ReadError> {
        let mut b = [0u8; 1];
        loop {
            match self.input.read(&mut b) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(b[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_entry_body(&mut self, b0: u8) -> Result<LogEntry, ReadError> {
        let mut level = LogLevelEx::from_nibble(b0 & 0x0F).ok_or(ReadError::InvalidHeader(b0))?;
        if self.version < 7 {
            // The filtered marker did not exist yet; the bit is reserved.
            level.is_filtered = false;
        }
        let b1 = self.input.read_u8().map_err(map_eof)?;
        let mut kind_code = (b0 & KIND_MASK) >> KIND_SHIFT;
        if kind_code == KIND_EXTENSION {
            kind_code = self.input.read_u8().map_err(map_eof)?;
        }
        let kind = EntryKind::from_code(kind_code).ok_or(ReadError::InvalidHeader(b0))?;

        let has_text = b1 & FLAG1_TEXT != 0;
        if kind != EntryKind::CloseGroup && !has_text {
            return Err(ReadError::Malformed("missing text on a non-CloseGroup entry"));
        }
        let text = if has_text {
            Some(self.read_string()?)
        } else {
            None
        };
        let time = self.read_time()?;
        let origin = if b0 & FLAG0_FILENAME != 0 {
            let file = self.read_string()?;
            let line = self.read_varint_u32()?;
            Some(SourceOrigin { file, line })
        } else {
            None
        };
        let tags = if b0 & FLAG0_TAGS != 0 {
            TagSet::new(&self.read_string()?)
        } else {
            TagSet::EMPTY
        };
        let exception = if b1 & FLAG1_EXCEPTION != 0 {
            Some(self.read_exception(0)?)
        } else {
            None
        };
        let conclusions = if b1 & FLAG1_CONCLUSIONS != 0 {
            self.read_conclusions()?
        } else {
            Vec::new()
        };
        let multicast = if b1 & FLAG1_MULTICAST != 0 {
            Some(self.read_multicast()?)
        } else {
            None
        };

        Ok(LogEntry {
            kind,
            level,
            text,
            time,
            origin,
            tags,
            exception,
            conclusions,
            multicast,
        })
    }

    fn read_string(&mut self) -> Result<String, ReadError> {
        let len = varint::read_u64(&mut self.input).map_err(map_eof)?;
        if len > MAX_STRING_LEN {
            return Err(ReadError::StringTooLong(len));
        }
        let mut bytes = vec![0u8; len as usize];
        self.input.read_exact(&mut bytes).map_err(map_eof)?;
        Ok(String::from_utf8(bytes)?)
    }

    fn read_varint_u32(&mut self) -> Result<u32, ReadError> {
        let value = varint::read_u64(&mut self.input).map_err(map_eof)?;
        u32::try_from(value).map_err(|_| ReadError::Malformed("varint exceeds u32"))
    }

    fn read_time(&mut self) -> Result<DateTimeStamp, ReadError> {
        let ticks = self.input.read_i64::<LittleEndian>().map_err(map_eof)?;
        let uniquifier = if self.version >= 9 {
            self.input.read_u8().map_err(map_eof)?
        } else {
            0
        };
        Ok(DateTimeStamp::new(ticks, uniquifier))
    }

    fn read_exception(&mut self, depth: u32) -> Result<ExceptionData, ReadError> {
        if depth >= MAX_EXCEPTION_DEPTH {
            return Err(ReadError::Malformed("exception chain too deep"));
        }
        let flags = self.input.read_u8().map_err(map_eof)?;
        let message = self.read_string()?;
        let stack_trace = if flags & 1 != 0 {
            Some(self.read_string()?)
        } else {
            None
        };
        let inner = if flags & 2 != 0 {
            Some(Box::new(self.read_exception(depth + 1)?))
        } else {
            None
        };
        Ok(ExceptionData {
            message,
            stack_trace,
            inner,
        })
    }

    fn read_conclusions(&mut self) -> Result<Vec<Conclusion>, ReadError> {
        let count = self.input.read_u8().map_err(map_eof)?;
        let mut conclusions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let tag = if self.version >= 8 {
                TagSet::new(&self.read_string()?)
            } else {
                TagSet::EMPTY
            };
            let text = self.read_string()?;
            conclusions.push(Conclusion { tag, text });
        }
        Ok(conclusions)
    }

    fn read_multicast(&mut self) -> Result<MulticastInfo, ReadError> {
        let monitor_id = self.read_string()?;
        let prev_kind_byte = self.input.read_u8().map_err(map_eof)?;
        let prev_kind = if prev_kind_byte == PREV_KIND_NONE {
            None
        } else {
            Some(
                EntryKind::from_code(prev_kind_byte)
                    .ok_or(ReadError::InvalidPrevKind(prev_kind_byte))?,
            )
        };
        let prev_time = self.read_time()?;
        let group_depth = self.read_varint_u32()?;
        Ok(MulticastInfo {
            monitor_id,
            prev_kind,
            prev_time,
            group_depth,
        })
    }
}
