// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Binary persistence of multicast activity-log entries.
//!
//! A `.ckmon` stream is a 4-byte magic (`ckm1`), a version byte, a sequence
//! of self-describing entries and a single zero terminator. Files may be
//! gzip-compressed as a whole; [`read::EntryCursor`] decodes them
//! transparently.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod entry;
pub mod read;
mod varint;
pub mod write;

pub use entry::{Conclusion, EntryKind, ExceptionData, LogEntry, MulticastInfo, SourceOrigin};
pub use read::{EntryCursor, MulticastFilter, ReadError};
pub use write::{LogWriter, WriteError};

/// Stream magic, the first four bytes of every `.ckmon` file.
pub const STREAM_MAGIC: [u8; 4] = *b"ckm1";

/// Version written by [`LogWriter`] unless told otherwise.
pub const CURRENT_STREAM_VERSION: u8 = 9;

/// Oldest stream version readers still accept.
pub const MIN_STREAM_VERSION: u8 = 5;

/// Canonical file extension of a persisted stream.
pub const FILE_EXTENSION: &str = "ckmon";
