// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::live_monitor::LiveIndexedMonitor;
use crate::raw_file::{MonitorOccurrence, RawLogFile};
use ckmon_common::{DateTimeStamp, MutexExt};
use ckmon_format::LogEntry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

type MonitorAppearedCallback = Box<dyn Fn(&Arc<LiveIndexedMonitor>) + Send + Sync>;

/// Immutable-publication, mutable-build concurrent index over `.ckmon`
/// files.
///
/// Files and monitors live in lock-free maps; a readers-writer gate lets
/// many `add_file` calls proceed concurrently while reserving writer mode
/// for a future bulk rebuild. Each file is scanned exactly once, whichever
/// thread gets there first.
pub struct LogIndexer {
    files: DashMap<PathBuf, Arc<RawLogFile>>,
    monitors: DashMap<String, Arc<LiveIndexedMonitor>>,
    global_times: RwLock<GlobalTimes>,
    rebuild_gate: RwLock<()>,
    on_monitor_appeared: Mutex<Vec<MonitorAppearedCallback>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct GlobalTimes {
    first_entry_time: Option<DateTimeStamp>,
    last_entry_time: Option<DateTimeStamp>,
}

impl LogIndexer {
    pub fn new() -> Self {
        Self {
            files: DashMap::new(),
            monitors: DashMap::new(),
            global_times: RwLock::new(GlobalTimes::default()),
            rebuild_gate: RwLock::new(()),
            on_monitor_appeared: Mutex::new(Vec::new()),
        }
    }

    /// Registers a callback fired exactly once per distinct monitor id, when
    /// the monitor first appears in any scanned file.
    pub fn on_live_monitor_appeared(
        &self,
        callback: impl Fn(&Arc<LiveIndexedMonitor>) + Send + Sync + 'static,
    ) {
        self.on_monitor_appeared
            .lock_or_panic()
            .push(Box::new(callback));
    }

    /// Adds a file to the index. The path is normalized, the record is
    /// inserted-or-retrieved, and the first adder scans it; concurrent
    /// adders of the same path wait for the completed record. Scan problems
    /// are captured on the record, not raised: a broken file stays in the
    /// index for partial results.
    pub fn add_file(&self, path: impl AsRef<Path>) -> Arc<RawLogFile> {
        let path = normalize(path.as_ref());
        let _shared = match self.rebuild_gate.read() {
            Ok(gate) => gate,
            Err(poisoned) => poisoned.into_inner(),
        };
        let file = {
            let slot = self
                .files
                .entry(path.clone())
                .or_insert_with(|| Arc::new(RawLogFile::new(path)));
            Arc::clone(&slot)
        };
        file.ensure_initialized(self);
        file
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<Arc<RawLogFile>> {
        self.files.get(&normalize(path.as_ref())).map(|f| Arc::clone(&f))
    }

    pub fn files(&self) -> Vec<Arc<RawLogFile>> {
        self.files.iter().map(|f| Arc::clone(&f)).collect()
    }

    pub fn monitor(&self, monitor_id: &str) -> Option<Arc<LiveIndexedMonitor>> {
        self.monitors.get(monitor_id).map(|m| Arc::clone(&m))
    }

    pub fn monitors(&self) -> Vec<Arc<LiveIndexedMonitor>> {
        self.monitors.iter().map(|m| Arc::clone(&m)).collect()
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    /// Earliest entry time across all indexed files.
    pub fn first_entry_time(&self) -> Option<DateTimeStamp> {
        match self.global_times.read() {
            Ok(times) => times.first_entry_time,
            Err(poisoned) => poisoned.into_inner().first_entry_time,
        }
    }

    /// Latest entry time across all indexed files.
    pub fn last_entry_time(&self) -> Option<DateTimeStamp> {
        match self.global_times.read() {
            Ok(times) => times.last_entry_time,
            Err(poisoned) => poisoned.into_inner().last_entry_time,
        }
    }

    /// Get-or-insert the monitor and fold one entry in. First insertion
    /// fires `on_live_monitor_appeared` exactly once across all threads.
    pub(crate) fn register_one_log(
        &self,
        occurrence: &Arc<MonitorOccurrence>,
        new_occurrence: bool,
        entry: &LogEntry,
    ) {
        let Some(monitor_id) = entry.monitor_id() else {
            return;
        };
        let mut appeared = false;
        let monitor = {
            let slot = self
                .monitors
                .entry(monitor_id.to_string())
                .or_insert_with(|| {
                    appeared = true;
                    Arc::new(LiveIndexedMonitor::new(monitor_id.to_string()))
                });
            Arc::clone(&slot)
        };
        if appeared {
            for callback in self.on_monitor_appeared.lock_or_panic().iter() {
                callback(&monitor);
            }
        }
        monitor.register(occurrence, new_occurrence, entry);
    }

    pub(crate) fn update_global_times(
        &self,
        first: Option<DateTimeStamp>,
        last: Option<DateTimeStamp>,
    ) {
        let mut times = match self.global_times.write() {
            Ok(times) => times,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(first) = first {
            if times.first_entry_time.is_none_or(|t| first < t) {
                times.first_entry_time = Some(first);
            }
        }
        if let Some(last) = last {
            if times.last_entry_time.is_none_or(|t| last > t) {
                times.last_entry_time = Some(last);
            }
        }
    }
}

impl Default for LogIndexer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LogIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogIndexer")
            .field("files", &self.files.len())
            .field("monitors", &self.monitors.len())
            .finish()
    }
}

/// Canonical form when the file exists, untouched otherwise (the scan will
/// record the open error on the record).
fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
