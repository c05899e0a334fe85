// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::chain::ChainState;
use crate::config::{HandlerConfig, HandlerRegistry, SinkConfiguration};
use crate::handler::{Handler, SinkMonitor};
use crate::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_GARBAGE_PERIOD, DEFAULT_TIMER_DURATION, EXTERNAL_MONITOR_ID};
use ckmon_common::{DateTimeStamp, LogFilter, LogLevel, LogLevelFilter, MutexExt, TagSet};
use ckmon_format::{EntryKind, ExceptionData, LogEntry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The sink is stopping or stopped; the operation did not take effect.
    #[error("the sink is stopped")]
    Stopped,
}

/// Lifecycle of the consumer task. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SinkStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

pub(crate) enum Input {
    Entry(LogEntry),
    Command(Command),
}

pub(crate) enum Command {
    Configure { config: SinkConfiguration, seq: u64 },
    GarbageDeadClients,
    Stop,
}

pub(crate) struct FilterState {
    pub minimal: LogFilter,
    pub external: LogLevelFilter,
    pub tag_filters: Vec<(TagSet, LogFilter)>,
}

pub(crate) struct SinkShared {
    next_config_seq: AtomicU64,
    /// Watermark: one past the highest applied configuration sequence.
    /// A superseded configuration never advances it; the newer one does.
    applied: watch::Sender<u64>,
    status: watch::Sender<SinkStatus>,
    pub(crate) filters: Mutex<FilterState>,
    external_chain: Mutex<ChainState>,
}

impl SinkShared {
    fn new() -> Self {
        Self {
            next_config_seq: AtomicU64::new(0),
            applied: watch::channel(0).0,
            status: watch::channel(SinkStatus::Starting).0,
            filters: Mutex::new(FilterState {
                minimal: LogFilter::UNDEFINED,
                external: LogLevelFilter::Undefined,
                tag_filters: Vec::new(),
            }),
            external_chain: Mutex::new(ChainState::new()),
        }
    }
}

/// Cancellation signal for collaborators that must abort long-running work
/// when the sink is stopping.
#[derive(Clone)]
pub struct DisposingToken {
    rx: watch::Receiver<SinkStatus>,
}

impl DisposingToken {
    pub fn is_disposing(&self) -> bool {
        *self.rx.borrow() >= SinkStatus::Stopping
    }

    /// Completes when the sink starts stopping (immediately if it already
    /// has).
    pub async fn cancelled(&mut self) {
        while *self.rx.borrow() < SinkStatus::Stopping {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Producer-side face of the dispatcher. Cheap to clone; every operation is
/// safe to call from any task. Once the sink is disposed, intake operations
/// return early without effect.
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<Input>,
    shared: Arc<SinkShared>,
    monitor: SinkMonitor,
}

impl SinkHandle {
    /// The id labelling the pump's own entries.
    pub fn grand_output_id(&self) -> &str {
        self.monitor.id()
    }

    /// Current lifecycle state of the consumer task.
    pub fn status(&self) -> SinkStatus {
        *self.shared.status.borrow()
    }

    pub fn is_disposed(&self) -> bool {
        self.status() >= SinkStatus::Stopping
    }

    pub fn disposing_token(&self) -> DisposingToken {
        DisposingToken {
            rx: self.shared.status.subscribe(),
        }
    }

    /// The pump's own monitor: the capability handlers receive.
    pub fn monitor(&self) -> &SinkMonitor {
        &self.monitor
    }

    /// Enqueues one entry. Applies bounded back-pressure when the channel is
    /// at capacity. Malformed entries are dropped with a warning into the
    /// pump's own stream; a disposed sink swallows the entry.
    pub async fn handle(&self, entry: LogEntry) {
        if self.is_disposed() {
            return;
        }
        if let Err(reason) = entry.validate() {
            warn!(reason, "dropping malformed entry");
            self.monitor.log(
                LogLevel::Warn,
                TagSet::EMPTY,
                format!("Malformed entry dropped: {reason}."),
            );
            return;
        }
        let _ = self.tx.send(Input::Entry(entry)).await;
    }

    /// Synthesizes a `Line` entry for a log emitted outside of any monitor
    /// context, gated by the configured external log level filter.
    pub async fn external_log(
        &self,
        level: LogLevel,
        tags: TagSet,
        text: impl Into<String>,
        exception: Option<ExceptionData>,
    ) {
        if self.is_disposed() {
            return;
        }
        let gate = self.shared.filters.lock_or_panic().external;
        if !gate.allows(level) {
            return;
        }
        let entry = {
            let mut chain = self.shared.external_chain.lock_or_panic();
            let (time, info) = chain.advance(EXTERNAL_MONITOR_ID, EntryKind::Line, 0);
            let mut entry = LogEntry::line(level, tags, text, time).with_multicast(info);
            if let Some(exception) = exception {
                entry = entry.with_exception(exception);
            }
            entry
        };
        let _ = self.tx.send(Input::Entry(entry)).await;
    }

    /// Enqueues a reconfiguration. With `wait`, blocks until this
    /// configuration (or a newer one that superseded it) has been applied.
    /// Errors with [`SinkError::Stopped`] instead of blocking forever when
    /// the sink stops first.
    pub async fn apply_configuration(
        &self,
        config: SinkConfiguration,
        wait: bool,
    ) -> Result<(), SinkError> {
        if self.is_disposed() {
            return Err(SinkError::Stopped);
        }
        // Reserve first so that sequence assignment and enqueue are not
        // separated by a suspension point: every assigned sequence number is
        // guaranteed to reach the queue, which is what makes skipping
        // superseded configurations safe.
        let permit = self.tx.reserve().await.map_err(|_| SinkError::Stopped)?;
        let seq = self.shared.next_config_seq.fetch_add(1, Ordering::SeqCst);
        permit.send(Input::Command(Command::Configure { config, seq }));
        if !wait {
            return Ok(());
        }
        let mut applied = self.shared.applied.subscribe();
        let mut status = self.shared.status.subscribe();
        loop {
            if *applied.borrow() > seq {
                return Ok(());
            }
            if *status.borrow() >= SinkStatus::Stopping {
                return Err(SinkError::Stopped);
            }
            tokio::select! {
                changed = applied.changed() => {
                    if changed.is_err() {
                        return Err(SinkError::Stopped);
                    }
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        return Err(SinkError::Stopped);
                    }
                }
            }
        }
    }

    /// Requests an immediate dead-client sweep.
    pub async fn garbage_dead_clients(&self) {
        let _ = self.tx.send(Input::Command(Command::GarbageDeadClients)).await;
    }

    /// Snapshot of the currently applied minimal filter.
    pub fn minimal_filter(&self) -> LogFilter {
        self.shared.filters.lock_or_panic().minimal
    }

    /// Resolves the line-level filter for an entry carrying `tags`: the first
    /// overlapping tag filter wins, else the minimal filter.
    pub fn line_filter_for(&self, tags: &TagSet) -> LogLevelFilter {
        let filters = self.shared.filters.lock_or_panic();
        for (tag, filter) in &filters.tag_filters {
            if tag.overlaps(tags) && filter.line != LogLevelFilter::Undefined {
                return filter.line;
            }
        }
        filters.minimal.line
    }

    pub(crate) async fn send_entry(&self, entry: LogEntry) {
        let _ = self.tx.send(Input::Entry(entry)).await;
    }
}

/// The dispatcher: owns the consumer task. Constructed inside a tokio
/// runtime; the initial configuration is applied as configuration n°0.
pub struct DispatcherSink {
    handle: SinkHandle,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl DispatcherSink {
    pub fn new(registry: HandlerRegistry, config: SinkConfiguration) -> Self {
        Self::with_garbage_callback(registry, config, None)
    }

    /// `garbage_callback` runs in the consumer task on every
    /// `GarbageDeadClients` occasion (periodic, or explicitly requested).
    pub fn with_garbage_callback(
        registry: HandlerRegistry,
        config: SinkConfiguration,
        garbage_callback: Option<Box<dyn FnMut() + Send>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let grand_output_id: Arc<str> = generate_grand_output_id().into();
        let monitor = SinkMonitor::new(grand_output_id, tx.clone());
        let shared = Arc::new(SinkShared::new());
        let handle = SinkHandle {
            tx,
            shared: Arc::clone(&shared),
            monitor: monitor.clone(),
        };

        let seq = shared.next_config_seq.fetch_add(1, Ordering::SeqCst);
        // Capacity is far above one; the freshly created channel accepts it.
        let _ = handle
            .tx
            .try_send(Input::Command(Command::Configure { config, seq }));

        let core = SinkCore {
            rx,
            shared,
            monitor,
            registry,
            handlers: Vec::new(),
            timer_duration: DEFAULT_TIMER_DURATION,
            next_timer: Instant::now() + DEFAULT_TIMER_DURATION,
            garbage_period: DEFAULT_GARBAGE_PERIOD,
            next_garbage: Instant::now() + DEFAULT_GARBAGE_PERIOD,
            garbage_callback,
        };
        let join = tokio::spawn(core.run());
        Self {
            handle,
            join: Mutex::new(Some(join)),
        }
    }

    pub fn handle(&self) -> &SinkHandle {
        &self.handle
    }

    /// Signals the consumer to stop and waits for the drain: events enqueued
    /// before the stop are still delivered, handlers are deactivated in
    /// order. With a timeout, the task is abandoned once it elapses and
    /// pending events are dropped.
    pub async fn stop(&self, force_close_after: Option<Duration>) {
        let _ = self.handle.tx.send(Input::Command(Command::Stop)).await;
        let join = self.join.lock_or_panic().take();
        if let Some(mut join) = join {
            match force_close_after {
                None => {
                    let _ = (&mut join).await;
                }
                Some(timeout) => {
                    if tokio::time::timeout(timeout, &mut join).await.is_err() {
                        warn!("sink did not drain in time; abandoning the consumer task");
                        join.abort();
                    }
                }
            }
        }
    }
}

fn generate_grand_output_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("go-{:x}-{:x}", DateTimeStamp::now().ticks_utc, n)
}

struct LiveHandler {
    config: Arc<dyn HandlerConfig>,
    handler: Box<dyn Handler>,
}

enum Flow {
    Continue,
    Stop,
}

/// State owned by the consumer task. The handler list is mutated here and
/// nowhere else.
struct SinkCore {
    rx: mpsc::Receiver<Input>,
    shared: Arc<SinkShared>,
    monitor: SinkMonitor,
    registry: HandlerRegistry,
    handlers: Vec<LiveHandler>,
    timer_duration: Duration,
    next_timer: Instant,
    garbage_period: Duration,
    next_garbage: Instant,
    garbage_callback: Option<Box<dyn FnMut() + Send>>,
}

impl SinkCore {
    async fn run(mut self) {
        debug!("sink consumer task started");
        self.shared.status.send_replace(SinkStatus::Running);
        loop {
            let deadline = self.next_timer.min(self.next_garbage);
            tokio::select! {
                item = self.rx.recv() => match item {
                    Some(Input::Entry(entry)) => self.dispatch(&entry).await,
                    Some(Input::Command(command)) => {
                        if matches!(self.command(command).await, Flow::Stop) {
                            break;
                        }
                    }
                    // Every producer handle dropped.
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => self.timers_elapsed().await,
            }
            self.flush_pending_internal_logs().await;
        }
        self.shutdown().await;
    }

    async fn command(&mut self, command: Command) -> Flow {
        match command {
            Command::Configure { config, seq } => {
                let newest = self.shared.next_config_seq.load(Ordering::SeqCst) - 1;
                if seq < newest {
                    debug!(seq, newest, "configuration superseded; skipping");
                    return Flow::Continue;
                }
                self.monitor.log(
                    LogLevel::Info,
                    TagSet::EMPTY,
                    format!("Applying configuration n°{seq}."),
                );
                self.reconcile(&config).await;
                self.apply_options(&config);
                self.monitor.log(
                    LogLevel::Info,
                    TagSet::EMPTY,
                    format!("Configuration n°{seq} applied."),
                );
                self.shared.applied.send_replace(seq + 1);
                Flow::Continue
            }
            Command::GarbageDeadClients => {
                if let Some(callback) = &mut self.garbage_callback {
                    callback();
                }
                Flow::Continue
            }
            Command::Stop => Flow::Stop,
        }
    }

    /// Reconciles the live handler list against the target configuration.
    /// Identity is the configuration type: a matching live handler gets
    /// `apply_configuration` and keeps its state when it accepts; otherwise
    /// it is destroyed and recreated. Order follows the configuration.
    async fn reconcile(&mut self, config: &SinkConfiguration) {
        let mut old = std::mem::take(&mut self.handlers);
        let mut next = Vec::with_capacity(config.handlers.len());
        for handler_config in &config.handlers {
            let type_name = handler_config.type_name();
            let pos = old
                .iter()
                .position(|live| live.config.type_name() == type_name);
            if let Some(pos) = pos {
                let mut live = old.remove(pos);
                if live
                    .handler
                    .apply_configuration(&self.monitor, handler_config)
                    .await
                {
                    live.config = Arc::clone(handler_config);
                    next.push(live);
                    continue;
                }
                live.handler.deactivate(&self.monitor).await;
            }
            match self.registry.build(handler_config) {
                Ok(mut handler) => {
                    if handler.activate(&self.monitor).await {
                        next.push(LiveHandler {
                            config: Arc::clone(handler_config),
                            handler,
                        });
                    } else {
                        // Activation refusal removes the handler silently.
                        debug!(handler = type_name, "handler refused activation");
                    }
                }
                Err(e) => {
                    error!(handler = type_name, error = %e, "handler configuration failed");
                    self.monitor.log_with_exception(
                        LogLevel::Error,
                        TagSet::EMPTY,
                        "While applying dynamic configuration.",
                        Some(ExceptionData::new(format!("{e:#}"))),
                    );
                }
            }
        }
        for mut dropped in old {
            dropped.handler.deactivate(&self.monitor).await;
        }
        self.handlers = next;
    }

    fn apply_options(&mut self, config: &SinkConfiguration) {
        if config.timer_duration != self.timer_duration {
            self.timer_duration = config.timer_duration;
            self.next_timer = Instant::now() + self.timer_duration;
        }
        if config.garbage_period != self.garbage_period {
            self.garbage_period = config.garbage_period;
            self.next_garbage = Instant::now() + self.garbage_period;
        }
        let mut filters = self.shared.filters.lock_or_panic();
        // Undefined sides retain the previously applied value.
        filters.minimal = config.minimal_filter.combine(filters.minimal);
        filters.external = config.external_log_level_filter.combine(filters.external);
        filters.tag_filters = config.tag_filters.clone();
    }

    async fn dispatch(&mut self, entry: &LogEntry) {
        let mut failed = Vec::new();
        for (i, live) in self.handlers.iter_mut().enumerate() {
            if let Err(e) = live.handler.handle(&self.monitor, entry).await {
                failed.push((i, e));
            }
        }
        for (i, e) in failed.into_iter().rev() {
            let mut live = self.handlers.remove(i);
            let type_name = live.config.type_name();
            error!(handler = type_name, error = %e, "handler failed; evicting");
            self.monitor.log_with_exception(
                LogLevel::Error,
                TagSet::EMPTY,
                format!("Handler '{type_name}' crashed and has been removed."),
                Some(ExceptionData::new(format!("{e:#}"))),
            );
            live.handler.deactivate(&self.monitor).await;
        }
    }

    async fn timers_elapsed(&mut self) {
        let now = Instant::now();
        if now >= self.next_timer {
            let span = self.timer_duration;
            for live in &mut self.handlers {
                live.handler.on_timer(&self.monitor, span).await;
            }
            self.next_timer = Instant::now() + self.timer_duration;
        }
        if now >= self.next_garbage {
            if let Some(callback) = &mut self.garbage_callback {
                callback();
            }
            self.next_garbage = now + self.garbage_period;
        }
    }

    /// Internal logs that could not be enqueued (channel momentarily full)
    /// are dispatched directly so they stay visible downstream.
    async fn flush_pending_internal_logs(&mut self) {
        let pending = self.monitor.take_pending();
        for entry in pending {
            self.dispatch(&entry).await;
        }
    }

    async fn shutdown(&mut self) {
        self.shared.status.send_replace(SinkStatus::Stopping);
        self.rx.close();
        self.flush_pending_internal_logs().await;
        for mut live in self.handlers.drain(..) {
            live.handler.deactivate(&self.monitor).await;
        }
        self.shared.status.send_replace(SinkStatus::Stopped);
        debug!("sink consumer task stopped");
    }
}
