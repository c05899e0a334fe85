// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::chain::ChainState;
use crate::sink::SinkHandle;
use ckmon_common::{LogFilter, LogLevelEx, MutexExt, TagSet};
use ckmon_format::{Conclusion, EntryKind, ExceptionData, LogEntry};
use std::sync::Mutex;

/// Per-monitor adapter: translates the monitor callbacks into multicast
/// entries carrying the previous-entry chain and the group depth, and feeds
/// them into the sink.
///
/// Bound to one monitor at a time; the owning registry guarantees exactly one
/// client per (sink, monitor) pair.
pub struct MonitorClient {
    monitor_id: String,
    sink: SinkHandle,
    state: Mutex<ClientState>,
}

struct ClientState {
    chain: ChainState,
    group_depth: u32,
}

impl MonitorClient {
    pub(crate) fn new(monitor_id: String, sink: SinkHandle) -> Self {
        Self {
            monitor_id,
            sink,
            state: Mutex::new(ClientState {
                chain: ChainState::new(),
                group_depth: 0,
            }),
        }
    }

    pub fn monitor_id(&self) -> &str {
        &self.monitor_id
    }

    pub fn current_group_depth(&self) -> u32 {
        self.state.lock_or_panic().group_depth
    }

    /// The minimal filter the bound monitor should observe.
    pub fn minimal_filter(&self) -> LogFilter {
        self.sink.minimal_filter()
    }

    /// Resets the previous-entry chain, as on re-registration.
    pub(crate) fn reset(&self) {
        let mut state = self.state.lock_or_panic();
        state.chain.reset();
        state.group_depth = 0;
    }

    /// Emits a log line. Applies the sink's tag filters and minimal filter:
    /// the first tag filter overlapping `tags` decides, else the minimal
    /// line filter.
    pub async fn on_unfiltered_log(
        &self,
        level: LogLevelEx,
        tags: TagSet,
        text: String,
        exception: Option<ExceptionData>,
    ) {
        if self.sink.is_disposed() {
            return;
        }
        if !self.sink.line_filter_for(&tags).allows(level.level) {
            return;
        }
        let entry = {
            let mut state = self.state.lock_or_panic();
            let depth = state.group_depth;
            let (time, info) = state.chain.advance(&self.monitor_id, EntryKind::Line, depth);
            let mut entry = LogEntry::line(level.level, tags, text, time).with_multicast(info);
            entry.level = level;
            if let Some(exception) = exception {
                entry = entry.with_exception(exception);
            }
            entry
        };
        self.sink.send_entry(entry).await;
    }

    /// Opens a nested group. The entry encodes the depth before the
    /// increment.
    pub async fn on_open_group(
        &self,
        level: LogLevelEx,
        tags: TagSet,
        text: String,
        exception: Option<ExceptionData>,
    ) {
        if self.sink.is_disposed() {
            return;
        }
        let entry = {
            let mut state = self.state.lock_or_panic();
            let depth = state.group_depth;
            let (time, info) = state
                .chain
                .advance(&self.monitor_id, EntryKind::OpenGroup, depth);
            state.group_depth += 1;
            let mut entry =
                LogEntry::open_group(level.level, tags, text, time).with_multicast(info);
            entry.level = level;
            if let Some(exception) = exception {
                entry = entry.with_exception(exception);
            }
            entry
        };
        self.sink.send_entry(entry).await;
    }

    /// Closes the nearest group with its conclusions. The entry encodes the
    /// depth before the decrement; unbalanced closes are dropped.
    pub async fn on_group_closed(&self, level: LogLevelEx, conclusions: Vec<Conclusion>) {
        if self.sink.is_disposed() {
            return;
        }
        let entry = {
            let mut state = self.state.lock_or_panic();
            if state.group_depth == 0 {
                // Depth never goes negative.
                return;
            }
            let depth = state.group_depth;
            let (time, info) = state
                .chain
                .advance(&self.monitor_id, EntryKind::CloseGroup, depth);
            state.group_depth -= 1;
            let mut entry = LogEntry::close_group(level.level, time, conclusions);
            entry.level = level;
            entry.multicast = Some(info);
            entry
        };
        self.sink.send_entry(entry).await;
    }
}

impl std::fmt::Debug for MonitorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorClient")
            .field("monitor_id", &self.monitor_id)
            .field("group_depth", &self.current_group_depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HandlerRegistry, SinkConfiguration};
    use crate::handlers::memory::{self, MemoryConfig};
    use crate::sink::DispatcherSink;
    use ckmon_common::{DateTimeStamp, LogLevel};
    use std::sync::Arc;

    /// `(prev_kind, prev_time)` of each entry must equal the `(kind, time)`
    /// of the monitor's previous one, `(None, UNKNOWN)` for the first.
    fn chain_is_consistent(entries: &[LogEntry]) -> bool {
        let mut prev: Option<(EntryKind, DateTimeStamp)> = None;
        for e in entries {
            let Some(m) = &e.multicast else { return false };
            match prev {
                None => {
                    if m.prev_kind.is_some() || m.prev_time.is_known() {
                        return false;
                    }
                }
                Some((kind, time)) => {
                    if m.prev_kind != Some(kind) || m.prev_time != time {
                        return false;
                    }
                }
            }
            prev = Some((e.kind, e.time));
        }
        true
    }

    fn memory_sink(name: &str) -> DispatcherSink {
        let config = SinkConfiguration::new().with_handler(Arc::new(MemoryConfig {
            name: name.to_string(),
        }));
        DispatcherSink::new(HandlerRegistry::with_defaults(), config)
    }

    #[tokio::test]
    async fn test_client_maintains_prev_chain_and_depth() {
        let sink = memory_sink("client-chain");
        let client = MonitorClient::new("m1".into(), sink.handle().clone());

        client
            .on_open_group(LogLevel::Info.into(), TagSet::EMPTY, "g".into(), None)
            .await;
        assert_eq!(client.current_group_depth(), 1);
        client
            .on_unfiltered_log(LogLevel::Info.into(), TagSet::EMPTY, "inside".into(), None)
            .await;
        client
            .on_group_closed(LogLevel::Info.into(), vec![])
            .await;
        assert_eq!(client.current_group_depth(), 0);
        sink.stop(None).await;

        let entries = memory::snapshot("client-chain");
        let mine: Vec<LogEntry> = entries
            .into_iter()
            .filter(|e| e.monitor_id() == Some("m1"))
            .collect();
        assert_eq!(mine.len(), 3);
        assert!(chain_is_consistent(&mine));
        // Open encodes the pre-increment depth, Close the pre-decrement one.
        assert_eq!(mine[0].multicast.as_ref().unwrap().group_depth, 0);
        assert_eq!(mine[1].multicast.as_ref().unwrap().group_depth, 1);
        assert_eq!(mine[2].multicast.as_ref().unwrap().group_depth, 1);
    }

    #[tokio::test]
    async fn test_unbalanced_close_is_dropped() {
        let sink = memory_sink("client-unbalanced");
        let client = MonitorClient::new("m1".into(), sink.handle().clone());
        client
            .on_group_closed(LogLevel::Info.into(), vec![])
            .await;
        assert_eq!(client.current_group_depth(), 0);
        sink.stop(None).await;
        let entries = memory::snapshot("client-unbalanced");
        assert!(entries.iter().all(|e| e.monitor_id() != Some("m1")));
    }

    #[tokio::test]
    async fn test_disposed_sink_drops_all_work() {
        let sink = memory_sink("client-disposed");
        let client = MonitorClient::new("m1".into(), sink.handle().clone());
        sink.stop(None).await;
        client
            .on_unfiltered_log(LogLevel::Info.into(), TagSet::EMPTY, "late".into(), None)
            .await;
        assert!(memory::snapshot("client-disposed")
            .iter()
            .all(|e| e.monitor_id() != Some("m1")));
    }
}
