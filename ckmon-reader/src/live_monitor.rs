// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::identity::IdentityCard;
use crate::raw_file::MonitorOccurrence;
use ckmon_common::{tag, DateTimeStamp, MutexExt};
use ckmon_format::LogEntry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Everything the index knows about one monitor, aggregated across files.
pub struct LiveIndexedMonitor {
    monitor_id: String,
    files: Mutex<Vec<Arc<MonitorOccurrence>>>,
    state: Mutex<MonitorState>,
}

#[derive(Default)]
struct MonitorState {
    first_entry_time: Option<DateTimeStamp>,
    first_depth: u32,
    last_entry_time: Option<DateTimeStamp>,
    last_depth: u32,
    tag_histogram: HashMap<String, u64>,
    identity_card: Option<IdentityCard>,
}

impl LiveIndexedMonitor {
    pub(crate) fn new(monitor_id: String) -> Self {
        Self {
            monitor_id,
            files: Mutex::new(Vec::new()),
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn monitor_id(&self) -> &str {
        &self.monitor_id
    }

    /// Occurrences of this monitor, one per file it appears in.
    pub fn files(&self) -> Vec<Arc<MonitorOccurrence>> {
        self.files.lock_or_panic().clone()
    }

    /// Time of the earliest known entry, with the group depth at that point.
    pub fn first_entry(&self) -> Option<(DateTimeStamp, u32)> {
        let state = self.state.lock_or_panic();
        state.first_entry_time.map(|t| (t, state.first_depth))
    }

    /// Time of the latest known entry, with the group depth at that point.
    pub fn last_entry(&self) -> Option<(DateTimeStamp, u32)> {
        let state = self.state.lock_or_panic();
        state.last_entry_time.map(|t| (t, state.last_depth))
    }

    /// Number of entries seen carrying the atomic tag.
    pub fn tag_count(&self, atom: &str) -> u64 {
        self.state
            .lock_or_panic()
            .tag_histogram
            .get(atom)
            .copied()
            .unwrap_or(0)
    }

    pub fn tag_histogram(&self) -> HashMap<String, u64> {
        self.state.lock_or_panic().tag_histogram.clone()
    }

    /// The identity card, once an `IdentityCardFull`/`IdentityCardUpdate`
    /// tagged entry materialized it.
    pub fn identity_card(&self) -> Option<IdentityCard> {
        self.state.lock_or_panic().identity_card.clone()
    }

    /// Folds one of this monitor's entries into the aggregate. Called by the
    /// file scans, possibly from several threads for different files.
    pub(crate) fn register(
        &self,
        occurrence: &Arc<MonitorOccurrence>,
        new_occurrence: bool,
        entry: &LogEntry,
    ) {
        if new_occurrence {
            self.files.lock_or_panic().push(Arc::clone(occurrence));
        }
        let depth = entry
            .multicast
            .as_ref()
            .map(|m| m.group_depth)
            .unwrap_or(0);
        let mut state = self.state.lock_or_panic();
        match state.first_entry_time {
            Some(first) if entry.time >= first => {}
            _ => {
                state.first_entry_time = Some(entry.time);
                state.first_depth = depth;
            }
        }
        match state.last_entry_time {
            Some(last) if entry.time <= last => {}
            _ => {
                state.last_entry_time = Some(entry.time);
                state.last_depth = depth;
            }
        }
        for atom in entry.tags.atoms() {
            *state.tag_histogram.entry(atom.to_string()).or_default() += 1;
        }
        if entry.tags.contains(tag::IDENTITY_CARD_FULL) {
            if let Some(text) = &entry.text {
                // Full payload: complete replacement.
                state.identity_card = Some(IdentityCard::parse(text));
            }
        } else if entry.tags.contains(tag::IDENTITY_CARD_UPDATE) {
            if let Some(text) = &entry.text {
                let update = IdentityCard::parse(text);
                match &mut state.identity_card {
                    Some(card) => card.merge(&update),
                    None => state.identity_card = Some(update),
                }
            }
        }
    }
}

impl std::fmt::Debug for LiveIndexedMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveIndexedMonitor")
            .field("monitor_id", &self.monitor_id)
            .field("files", &self.files.lock_or_panic().len())
            .finish()
    }
}
