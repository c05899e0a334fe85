// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::chain::ChainState;
use crate::config::HandlerConfig;
use crate::sink::Input;
use async_trait::async_trait;
use ckmon_common::{LogLevel, MutexExt, TagSet};
use ckmon_format::{EntryKind, ExceptionData, LogEntry};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Capability handed to handlers: the pump's own monitor, narrowed to "emit
/// an internal log". Keeps handlers from holding the full pump (and the
/// reference cycle that would come with it).
#[derive(Clone)]
pub struct SinkMonitor {
    inner: Arc<SinkMonitorInner>,
}

struct SinkMonitorInner {
    grand_output_id: Arc<str>,
    queue: mpsc::Sender<Input>,
    chain: Mutex<ChainState>,
    /// Overflow slot drained by the consumer loop when the intake channel is
    /// momentarily full: internal logs must not deadlock the pump.
    pending: Mutex<VecDeque<LogEntry>>,
}

impl SinkMonitor {
    pub(crate) fn new(grand_output_id: Arc<str>, queue: mpsc::Sender<Input>) -> Self {
        Self {
            inner: Arc::new(SinkMonitorInner {
                grand_output_id,
                queue,
                chain: Mutex::new(ChainState::new()),
                pending: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Id of the pump monitor, which is also the grand-output id.
    pub fn id(&self) -> &str {
        &self.inner.grand_output_id
    }

    /// Emits a line into the pump's own stream. The entry re-enters the
    /// pipeline like any produced event.
    pub fn log(&self, level: LogLevel, tags: TagSet, text: impl Into<String>) {
        self.log_with_exception(level, tags, text, None)
    }

    pub fn log_with_exception(
        &self,
        level: LogLevel,
        tags: TagSet,
        text: impl Into<String>,
        exception: Option<ExceptionData>,
    ) {
        let entry = {
            let mut chain = self.inner.chain.lock_or_panic();
            let (time, info) =
                chain.advance(&self.inner.grand_output_id, EntryKind::Line, 0);
            let mut entry = LogEntry::line(level, tags, text, time).with_multicast(info);
            if let Some(exception) = exception {
                entry = entry.with_exception(exception);
            }
            entry
        };
        match self.inner.queue.try_send(Input::Entry(entry)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(Input::Entry(entry))) => {
                self.inner.pending.lock_or_panic().push_back(entry);
            }
            Err(_) => {} // stopping: internal logs are dropped
        }
    }

    pub(crate) fn take_pending(&self) -> Vec<LogEntry> {
        self.inner.pending.lock_or_panic().drain(..).collect()
    }
}

/// A sink for dispatched entries: a file, a network forwarder, an in-memory
/// collector. Driven exclusively by the consumer task; calls are awaited one
/// at a time so a slow handler never reorders events seen by a faster one.
#[async_trait]
pub trait Handler: Send {
    /// Admission. Returning `false` removes the handler from the set.
    async fn activate(&mut self, monitor: &SinkMonitor) -> bool;

    /// Delivers one event. An error is a permanent fault: the handler is
    /// evicted and a diagnostic goes to the pump monitor.
    async fn handle(&mut self, monitor: &SinkMonitor, entry: &LogEntry) -> anyhow::Result<()>;

    /// Periodic tick, used by poll-based handlers for reconnection attempts.
    async fn on_timer(&mut self, _monitor: &SinkMonitor, _span: Duration) {}

    /// Applies an updated configuration of the same type. Returning `false`
    /// means "not mine": the dispatcher destroys this instance and builds a
    /// fresh one from the configuration.
    async fn apply_configuration(
        &mut self,
        monitor: &SinkMonitor,
        config: &Arc<dyn HandlerConfig>,
    ) -> bool;

    /// Terminal cleanup.
    async fn deactivate(&mut self, monitor: &SinkMonitor);
}

#[async_trait]
impl Handler for Box<dyn Handler> {
    async fn activate(&mut self, monitor: &SinkMonitor) -> bool {
        (**self).activate(monitor).await
    }

    async fn handle(&mut self, monitor: &SinkMonitor, entry: &LogEntry) -> anyhow::Result<()> {
        (**self).handle(monitor, entry).await
    }

    async fn on_timer(&mut self, monitor: &SinkMonitor, span: Duration) {
        (**self).on_timer(monitor, span).await
    }

    async fn apply_configuration(
        &mut self,
        monitor: &SinkMonitor,
        config: &Arc<dyn HandlerConfig>,
    ) -> bool {
        (**self).apply_configuration(monitor, config).await
    }

    async fn deactivate(&mut self, monitor: &SinkMonitor) {
        (**self).deactivate(monitor).await
    }
}
