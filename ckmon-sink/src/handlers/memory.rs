// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory collecting handler. Collectors are process-global and keyed by
//! name, so embedders and tests can observe what flowed through the pipeline
//! without holding the handler itself.

use crate::config::HandlerConfig;
use crate::handler::{Handler, SinkMonitor};
use async_trait::async_trait;
use ckmon_common::MutexExt;
use ckmon_format::LogEntry;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

type Collector = Arc<Mutex<Vec<LogEntry>>>;

fn collectors() -> &'static Mutex<HashMap<String, Collector>> {
    static COLLECTORS: OnceLock<Mutex<HashMap<String, Collector>>> = OnceLock::new();
    COLLECTORS.get_or_init(Default::default)
}

fn collector(name: &str) -> Collector {
    let mut map = collectors().lock_or_panic();
    Arc::clone(map.entry(name.to_string()).or_default())
}

/// Copy of everything collected under `name` so far.
pub fn snapshot(name: &str) -> Vec<LogEntry> {
    collector(name).lock_or_panic().clone()
}

/// Text of every collected entry that has one.
pub fn texts(name: &str) -> Vec<String> {
    snapshot(name)
        .into_iter()
        .filter_map(|e| e.text)
        .collect()
}

pub fn clear(name: &str) {
    collector(name).lock_or_panic().clear();
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Name of the process-global collector this handler appends to.
    pub name: String,
}

impl HandlerConfig for MemoryConfig {
    fn type_name(&self) -> &'static str {
        "Memory"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct MemoryHandler {
    config: MemoryConfig,
    entries: Collector,
}

impl MemoryHandler {
    pub fn new(config: MemoryConfig) -> Self {
        let entries = collector(&config.name);
        Self { config, entries }
    }
}

#[async_trait]
impl Handler for MemoryHandler {
    async fn activate(&mut self, _monitor: &SinkMonitor) -> bool {
        true
    }

    async fn handle(&mut self, _monitor: &SinkMonitor, entry: &LogEntry) -> anyhow::Result<()> {
        self.entries.lock_or_panic().push(entry.clone());
        Ok(())
    }

    async fn apply_configuration(
        &mut self,
        _monitor: &SinkMonitor,
        config: &Arc<dyn HandlerConfig>,
    ) -> bool {
        match config.as_any().downcast_ref::<MemoryConfig>() {
            Some(new_config) if new_config.name == self.config.name => true,
            // A different collector name means a different destination:
            // recreate.
            _ => false,
        }
    }

    async fn deactivate(&mut self, _monitor: &SinkMonitor) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use ckmon_common::{DateTimeStamp, LogLevel, TagSet};

    #[tokio::test]
    async fn test_collects_into_named_collector() {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let monitor = SinkMonitor::new("go-test".into(), tx);
        let mut handler = MemoryHandler::new(MemoryConfig {
            name: "memory-unit".into(),
        });
        assert!(handler.activate(&monitor).await);
        let entry = LogEntry::line(
            LogLevel::Info,
            TagSet::EMPTY,
            "hello",
            DateTimeStamp::new(1, 0),
        );
        handler.handle(&monitor, &entry).await.unwrap();
        assert_eq!(texts("memory-unit"), vec!["hello"]);
        clear("memory-unit");
        assert!(snapshot("memory-unit").is_empty());
    }
}
