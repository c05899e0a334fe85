// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Thread-safe aggregation of persisted `.ckmon` streams.
//!
//! [`LogIndexer`] scans files once, indexes every monitor's occurrences
//! across files (offsets and time windows), aggregates per-monitor data
//! (tag histogram, identity card) and supports filtered random-access reads
//! back into the streams.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod identity;
pub mod indexer;
pub mod live_monitor;
pub mod raw_file;

pub use identity::IdentityCard;
pub use indexer::LogIndexer;
pub use live_monitor::LiveIndexedMonitor;
pub use raw_file::{FileSummary, MonitorOccurrence, RawLogFile};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error(transparent)]
    Read(#[from] ckmon_format::ReadError),
    #[error("no entry for monitor '{0}' at the requested position")]
    NoEntry(String),
}
