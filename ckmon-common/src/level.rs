// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Severity of a log entry. Fits in 3 bits on the wire.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(u8)]
pub enum LogLevel {
    /// No level: the entry does not carry severity information.
    #[default]
    None = 0,
    Debug = 1,
    Trace = 2,
    Info = 3,
    Warn = 4,
    Error = 5,
    Fatal = 6,
}

impl LogLevel {
    pub fn from_u8(value: u8) -> Option<LogLevel> {
        match value {
            0 => Some(LogLevel::None),
            1 => Some(LogLevel::Debug),
            2 => Some(LogLevel::Trace),
            3 => Some(LogLevel::Info),
            4 => Some(LogLevel::Warn),
            5 => Some(LogLevel::Error),
            6 => Some(LogLevel::Fatal),
            _ => None,
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::None => "None",
            LogLevel::Debug => "Debug",
            LogLevel::Trace => "Trace",
            LogLevel::Info => "Info",
            LogLevel::Warn => "Warn",
            LogLevel::Error => "Error",
            LogLevel::Fatal => "Fatal",
        };
        f.write_str(s)
    }
}

/// A [`LogLevel`] extended with the `is_filtered` marker: whether the entry
/// went through an explicit filter check before emission. Packs into the low
/// nibble of the entry header byte (level in bits 0..=2, marker in bit 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LogLevelEx {
    pub level: LogLevel,
    pub is_filtered: bool,
}

impl LogLevelEx {
    pub const FILTERED_BIT: u8 = 0b1000;

    pub fn new(level: LogLevel, is_filtered: bool) -> Self {
        Self { level, is_filtered }
    }

    pub fn to_nibble(self) -> u8 {
        (self.level as u8) | if self.is_filtered { Self::FILTERED_BIT } else { 0 }
    }

    /// Decodes the low nibble of a header byte. Returns `None` when the level
    /// bits hold the reserved value 7.
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        let level = LogLevel::from_u8(nibble & 0b0111)?;
        Some(Self {
            level,
            is_filtered: nibble & Self::FILTERED_BIT != 0,
        })
    }
}

impl From<LogLevel> for LogLevelEx {
    fn from(level: LogLevel) -> Self {
        Self {
            level,
            is_filtered: false,
        }
    }
}

/// The minimal level a filter lets through.
///
/// `Undefined` defers to whatever the filter is combined with; `None` lets
/// every leveled entry through; `Off` suppresses everything.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum LogLevelFilter {
    #[default]
    Undefined,
    None,
    Debug,
    Trace,
    Info,
    Warn,
    Error,
    Fatal,
    Off,
}

impl LogLevelFilter {
    /// Whether an entry at `level` passes this filter. `Undefined` is
    /// permissive: callers are expected to resolve it against a fallback
    /// before evaluation, and an unresolved `Undefined` must not lose logs.
    pub fn allows(self, level: LogLevel) -> bool {
        match self {
            LogLevelFilter::Undefined | LogLevelFilter::None => true,
            LogLevelFilter::Off => false,
            LogLevelFilter::Debug => level >= LogLevel::Debug,
            LogLevelFilter::Trace => level >= LogLevel::Trace,
            LogLevelFilter::Info => level >= LogLevel::Info,
            LogLevelFilter::Warn => level >= LogLevel::Warn,
            LogLevelFilter::Error => level >= LogLevel::Error,
            LogLevelFilter::Fatal => level >= LogLevel::Fatal,
        }
    }

    /// `Undefined` merges to `other`; any explicit value wins.
    pub fn combine(self, other: LogLevelFilter) -> LogLevelFilter {
        if self == LogLevelFilter::Undefined {
            other
        } else {
            self
        }
    }
}

impl Display for LogLevelFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevelFilter::Undefined => "Undefined",
            LogLevelFilter::None => "None",
            LogLevelFilter::Debug => "Debug",
            LogLevelFilter::Trace => "Trace",
            LogLevelFilter::Info => "Info",
            LogLevelFilter::Warn => "Warn",
            LogLevelFilter::Error => "Error",
            LogLevelFilter::Fatal => "Fatal",
            LogLevelFilter::Off => "Off",
        };
        f.write_str(s)
    }
}

impl FromStr for LogLevelFilter {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Undefined" => Ok(LogLevelFilter::Undefined),
            "None" => Ok(LogLevelFilter::None),
            "Debug" => Ok(LogLevelFilter::Debug),
            "Trace" => Ok(LogLevelFilter::Trace),
            "Info" => Ok(LogLevelFilter::Info),
            "Warn" => Ok(LogLevelFilter::Warn),
            "Error" => Ok(LogLevelFilter::Error),
            "Fatal" => Ok(LogLevelFilter::Fatal),
            "Off" => Ok(LogLevelFilter::Off),
            other => Err(FilterParseError::UnknownLevel(other.to_string())),
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FilterParseError {
    #[error("unknown log level filter '{0}'")]
    UnknownLevel(String),
    #[error("unknown log filter '{0}'")]
    UnknownFilter(String),
}

/// A pair of minimal levels: one for group entries, one for line entries.
///
/// The textual form is either a preset name (`Debug`, `Release`, ...) or the
/// tuple `{Group,Line}`. A trailing `!` (legacy clamp marker) is accepted and
/// ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct LogFilter {
    pub group: LogLevelFilter,
    pub line: LogLevelFilter,
}

impl LogFilter {
    pub const UNDEFINED: LogFilter = LogFilter {
        group: LogLevelFilter::Undefined,
        line: LogLevelFilter::Undefined,
    };
    pub const DEBUG: LogFilter = LogFilter {
        group: LogLevelFilter::Debug,
        line: LogLevelFilter::Debug,
    };
    pub const TRACE: LogFilter = LogFilter {
        group: LogLevelFilter::Trace,
        line: LogLevelFilter::Trace,
    };
    pub const VERBOSE: LogFilter = LogFilter {
        group: LogLevelFilter::Debug,
        line: LogLevelFilter::Info,
    };
    pub const MONITOR: LogFilter = LogFilter {
        group: LogLevelFilter::Trace,
        line: LogLevelFilter::Warn,
    };
    pub const TERSE: LogFilter = LogFilter {
        group: LogLevelFilter::Info,
        line: LogLevelFilter::Error,
    };
    pub const RELEASE: LogFilter = LogFilter {
        group: LogLevelFilter::Error,
        line: LogLevelFilter::Error,
    };
    pub const OFF: LogFilter = LogFilter {
        group: LogLevelFilter::Off,
        line: LogLevelFilter::Off,
    };

    pub const fn new(group: LogLevelFilter, line: LogLevelFilter) -> Self {
        Self { group, line }
    }

    pub fn is_undefined(self) -> bool {
        self == Self::UNDEFINED
    }

    /// Field-wise [`LogLevelFilter::combine`].
    pub fn combine(self, other: LogFilter) -> LogFilter {
        LogFilter {
            group: self.group.combine(other.group),
            line: self.line.combine(other.line),
        }
    }
}

impl Display for LogFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let named = [
            (Self::UNDEFINED, "Undefined"),
            (Self::DEBUG, "Debug"),
            (Self::TRACE, "Trace"),
            (Self::VERBOSE, "Verbose"),
            (Self::MONITOR, "Monitor"),
            (Self::TERSE, "Terse"),
            (Self::RELEASE, "Release"),
            (Self::OFF, "Off"),
        ];
        if let Some((_, name)) = named.iter().find(|(preset, _)| preset == self) {
            f.write_str(name)
        } else {
            write!(f, "{{{},{}}}", self.group, self.line)
        }
    }
}

impl FromStr for LogFilter {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_suffix('!').unwrap_or(s).trim_end();
        if let Some(body) = s.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
            let (group, line) = body
                .split_once(',')
                .ok_or_else(|| FilterParseError::UnknownFilter(s.to_string()))?;
            return Ok(LogFilter::new(group.parse()?, line.parse()?));
        }
        match s {
            "Undefined" => Ok(Self::UNDEFINED),
            "Debug" => Ok(Self::DEBUG),
            "Trace" => Ok(Self::TRACE),
            "Verbose" => Ok(Self::VERBOSE),
            "Monitor" => Ok(Self::MONITOR),
            "Terse" => Ok(Self::TERSE),
            "Release" => Ok(Self::RELEASE),
            "Off" => Ok(Self::OFF),
            other => Err(FilterParseError::UnknownFilter(other.to_string())),
        }
    }
}
