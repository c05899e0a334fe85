// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::indexer::LogIndexer;
use crate::IndexError;
use ckmon_common::{DateTimeStamp, MutexExt};
use ckmon_format::{EntryCursor, MulticastFilter};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::debug;

/// One persisted stream inside the index.
///
/// The record is published in the file map before its scan runs; the first
/// caller to reach [`RawLogFile::ensure_initialized`] performs the scan and
/// concurrent callers for the same path block until the completed summary is
/// available.
pub struct RawLogFile {
    path: PathBuf,
    summary: OnceLock<FileSummary>,
}

/// Result of scanning one file.
#[derive(Debug, Default)]
pub struct FileSummary {
    pub stream_version: u8,
    pub total_entry_count: u64,
    pub first_entry_time: Option<DateTimeStamp>,
    pub last_entry_time: Option<DateTimeStamp>,
    /// The input ended without the zero terminator.
    pub bad_end_of_file: bool,
    /// Rendered read error, when the stream broke mid-entry or could not be
    /// opened at all.
    pub error: Option<String>,
    occurrences: HashMap<String, Arc<MonitorOccurrence>>,
}

impl RawLogFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            summary: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn ensure_initialized(&self, indexer: &LogIndexer) -> &FileSummary {
        self.summary.get_or_init(|| self.scan(indexer))
    }

    /// The completed summary. `None` only while another thread is still
    /// scanning; callers that went through the indexer always observe it.
    pub fn summary(&self) -> Option<&FileSummary> {
        self.summary.get()
    }

    /// A file with a captured error is kept in the index for partial
    /// results, but flagged.
    pub fn is_valid_file(&self) -> bool {
        self.summary
            .get()
            .is_some_and(|summary| summary.error.is_none())
    }

    pub fn occurrence(&self, monitor_id: &str) -> Option<Arc<MonitorOccurrence>> {
        self.summary
            .get()
            .and_then(|summary| summary.occurrences.get(monitor_id).cloned())
    }

    pub fn occurrences(&self) -> Vec<Arc<MonitorOccurrence>> {
        self.summary
            .get()
            .map(|summary| summary.occurrences.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Full scan: registers every multicast entry into the parent index and
    /// aggregates the file-level summary.
    fn scan(&self, indexer: &LogIndexer) -> FileSummary {
        debug!(path = %self.path.display(), "scanning stream file");
        let mut summary = FileSummary::default();
        let mut cursor = match EntryCursor::open(&self.path) {
            Ok(cursor) => cursor,
            Err(e) => {
                summary.error = Some(e.to_string());
                return summary;
            }
        };
        summary.stream_version = cursor.stream_version();
        while cursor.move_next() {
            let Some(entry) = cursor.current() else { break };
            let offset = cursor.stream_offset();
            summary.total_entry_count += 1;
            if summary.first_entry_time.is_none() {
                summary.first_entry_time = Some(entry.time);
            }
            summary.last_entry_time = Some(entry.time);
            if let Some(multicast) = &entry.multicast {
                let (occurrence, new_occurrence) =
                    match summary.occurrences.entry(multicast.monitor_id.clone()) {
                        std::collections::hash_map::Entry::Occupied(slot) => {
                            (Arc::clone(slot.get()), false)
                        }
                        std::collections::hash_map::Entry::Vacant(slot) => {
                            let occurrence = Arc::new(MonitorOccurrence::new(
                                self.path.clone(),
                                multicast.monitor_id.clone(),
                                offset,
                                entry.time,
                            ));
                            slot.insert(Arc::clone(&occurrence));
                            (occurrence, true)
                        }
                    };
                occurrence.record(offset, entry.time);
                indexer.register_one_log(&occurrence, new_occurrence, entry);
            }
        }
        summary.bad_end_of_file = cursor.bad_end_of_file();
        summary.error = cursor.read_error().map(ToString::to_string);
        indexer.update_global_times(summary.first_entry_time, summary.last_entry_time);
        debug!(
            path = %self.path.display(),
            entries = summary.total_entry_count,
            monitors = summary.occurrences.len(),
            bad_end_of_file = summary.bad_end_of_file,
            "stream file scanned"
        );
        summary
    }
}

impl std::fmt::Debug for RawLogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawLogFile")
            .field("path", &self.path)
            .field("initialized", &self.summary.get().is_some())
            .finish()
    }
}

/// The record of one monitor's presence within one file: offsets of its
/// first and last entries and the covered time window.
pub struct MonitorOccurrence {
    file_path: PathBuf,
    monitor_id: String,
    state: Mutex<OccurrenceState>,
}

#[derive(Debug, Clone, Copy)]
struct OccurrenceState {
    first_offset: u64,
    last_offset: u64,
    first_entry_time: DateTimeStamp,
    last_entry_time: DateTimeStamp,
}

impl MonitorOccurrence {
    fn new(file_path: PathBuf, monitor_id: String, offset: u64, time: DateTimeStamp) -> Self {
        Self {
            file_path,
            monitor_id,
            state: Mutex::new(OccurrenceState {
                first_offset: offset,
                last_offset: offset,
                first_entry_time: time,
                last_entry_time: time,
            }),
        }
    }

    /// Entries are scanned in stream order: offsets and times only grow.
    fn record(&self, offset: u64, time: DateTimeStamp) {
        let mut state = self.state.lock_or_panic();
        state.last_offset = offset;
        state.last_entry_time = time;
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn monitor_id(&self) -> &str {
        &self.monitor_id
    }

    pub fn first_offset(&self) -> u64 {
        self.state.lock_or_panic().first_offset
    }

    pub fn last_offset(&self) -> u64 {
        self.state.lock_or_panic().last_offset
    }

    pub fn first_entry_time(&self) -> DateTimeStamp {
        self.state.lock_or_panic().first_entry_time
    }

    pub fn last_entry_time(&self) -> DateTimeStamp {
        self.state.lock_or_panic().last_entry_time
    }

    /// Opens this monitor's entries starting at `offset` (one of this
    /// occurrence's recorded offsets). The returned cursor is positioned on
    /// the first matching entry; errors if no valid entry is reached.
    pub fn read_from_offset(&self, offset: u64) -> Result<EntryCursor, IndexError> {
        let filter = MulticastFilter::new(&self.monitor_id, self.last_offset());
        let mut cursor = EntryCursor::open_filtered(&self.file_path, offset, Some(filter))?;
        if !cursor.move_next() {
            return Err(IndexError::NoEntry(self.monitor_id.clone()));
        }
        Ok(cursor)
    }

    /// Opens this monitor's entries positioned on the first entry whose time
    /// is not before `time`; errors if the occurrence ends before reaching
    /// it.
    pub fn read_from_time(&self, time: DateTimeStamp) -> Result<EntryCursor, IndexError> {
        let mut cursor = self.read_from_offset(self.first_offset())?;
        loop {
            let Some(current) = cursor.current() else {
                return Err(IndexError::NoEntry(self.monitor_id.clone()));
            };
            if current.time >= time {
                return Ok(cursor);
            }
            if !cursor.move_next() {
                return Err(IndexError::NoEntry(self.monitor_id.clone()));
            }
        }
    }
}

impl std::fmt::Debug for MonitorOccurrence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = *self.state.lock_or_panic();
        f.debug_struct("MonitorOccurrence")
            .field("file_path", &self.file_path)
            .field("monitor_id", &self.monitor_id)
            .field("first_offset", &state.first_offset)
            .field("last_offset", &state.last_offset)
            .finish()
    }
}
