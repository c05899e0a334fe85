// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use ckmon_common::{DateTimeStamp, LogLevel, LogLevelEx, TagSet};

/// The three entry shapes. Multicast provenance is carried separately in
/// [`MulticastInfo`], so the five wire variants are `kind × multicast`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Line,
    OpenGroup,
    CloseGroup,
}

impl EntryKind {
    pub(crate) fn code(self) -> u8 {
        match self {
            EntryKind::Line => 0,
            EntryKind::OpenGroup => 1,
            EntryKind::CloseGroup => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<EntryKind> {
        match code {
            0 => Some(EntryKind::Line),
            1 => Some(EntryKind::OpenGroup),
            2 => Some(EntryKind::CloseGroup),
            _ => None,
        }
    }
}

/// Serializable snapshot of an error chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionData {
    pub message: String,
    pub stack_trace: Option<String>,
    pub inner: Option<Box<ExceptionData>>,
}

impl ExceptionData {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: None,
            inner: None,
        }
    }

    /// Snapshots an error and its `source()` chain.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        Self {
            message: error.to_string(),
            stack_trace: None,
            inner: error
                .source()
                .map(|inner| Box::new(ExceptionData::from_error(inner))),
        }
    }
}

/// One conclusion attached to a group close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conclusion {
    pub tag: TagSet,
    pub text: String,
}

impl Conclusion {
    pub fn new(tag: TagSet, text: impl Into<String>) -> Self {
        Self {
            tag,
            text: text.into(),
        }
    }
}

/// Where the entry was emitted in source code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceOrigin {
    pub file: String,
    pub line: u32,
}

/// Provenance footer of a multicast entry: enough to reassemble one monitor's
/// stream out of a multiplexed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastInfo {
    /// Opaque id of the emitting monitor.
    pub monitor_id: String,
    /// Kind of the monitor's immediately preceding entry, `None` for the
    /// first entry it ever emitted.
    pub prev_kind: Option<EntryKind>,
    /// Time of that preceding entry, [`DateTimeStamp::UNKNOWN`] for the first.
    pub prev_time: DateTimeStamp,
    /// Group depth at emission: pre-increment for OpenGroup, pre-decrement
    /// for CloseGroup.
    pub group_depth: u32,
}

impl MulticastInfo {
    /// Footer of a monitor's very first entry.
    pub fn first(monitor_id: impl Into<String>) -> Self {
        Self {
            monitor_id: monitor_id.into(),
            prev_kind: None,
            prev_time: DateTimeStamp::UNKNOWN,
            group_depth: 0,
        }
    }
}

/// A log entry: a line, a group opening or a group closing, optionally
/// extended with a multicast footer.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub kind: EntryKind,
    pub level: LogLevelEx,
    /// `None` only for CloseGroup entries.
    pub text: Option<String>,
    pub time: DateTimeStamp,
    pub origin: Option<SourceOrigin>,
    pub tags: TagSet,
    pub exception: Option<ExceptionData>,
    /// CloseGroup only.
    pub conclusions: Vec<Conclusion>,
    pub multicast: Option<MulticastInfo>,
}

impl LogEntry {
    pub fn line(level: LogLevel, tags: TagSet, text: impl Into<String>, time: DateTimeStamp) -> Self {
        Self {
            kind: EntryKind::Line,
            level: level.into(),
            text: Some(text.into()),
            time,
            origin: None,
            tags,
            exception: None,
            conclusions: Vec::new(),
            multicast: None,
        }
    }

    pub fn open_group(
        level: LogLevel,
        tags: TagSet,
        text: impl Into<String>,
        time: DateTimeStamp,
    ) -> Self {
        Self {
            kind: EntryKind::OpenGroup,
            ..Self::line(level, tags, text, time)
        }
    }

    pub fn close_group(
        level: LogLevel,
        time: DateTimeStamp,
        conclusions: Vec<Conclusion>,
    ) -> Self {
        Self {
            kind: EntryKind::CloseGroup,
            level: level.into(),
            text: None,
            time,
            origin: None,
            tags: TagSet::EMPTY,
            exception: None,
            conclusions,
            multicast: None,
        }
    }

    pub fn with_multicast(mut self, multicast: MulticastInfo) -> Self {
        self.multicast = Some(multicast);
        self
    }

    pub fn with_origin(mut self, file: impl Into<String>, line: u32) -> Self {
        self.origin = Some(SourceOrigin {
            file: file.into(),
            line,
        });
        self
    }

    pub fn with_exception(mut self, exception: ExceptionData) -> Self {
        self.exception = Some(exception);
        self
    }

    pub fn monitor_id(&self) -> Option<&str> {
        self.multicast.as_ref().map(|m| m.monitor_id.as_str())
    }

    /// Checks the structural invariants the codec relies on.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.level.level == LogLevel::None {
            return Err("entry level must not be None");
        }
        if self.kind != EntryKind::CloseGroup && self.text.is_none() {
            return Err("text is required for Line and OpenGroup entries");
        }
        if self.kind != EntryKind::CloseGroup && !self.conclusions.is_empty() {
            return Err("conclusions are only valid on CloseGroup entries");
        }
        if self.conclusions.len() > u8::MAX as usize {
            return Err("at most 255 conclusions per entry");
        }
        Ok(())
    }

    /// Projects the entry onto what a given stream version can represent:
    /// the filtered marker (v7+), conclusion tags (v8+) and time uniquifiers
    /// (v9) are cleared for older versions. Used when reproducing legacy
    /// streams.
    pub fn canonical_for_version(&self, version: u8) -> LogEntry {
        let mut e = self.clone();
        if version < 7 {
            e.level.is_filtered = false;
        }
        if version < 8 {
            for c in &mut e.conclusions {
                c.tag = TagSet::EMPTY;
            }
        }
        if version < 9 {
            e.time.uniquifier = 0;
            if let Some(m) = &mut e.multicast {
                m.prev_time.uniquifier = 0;
            }
        }
        e
    }
}
