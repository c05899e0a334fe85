// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::client::MonitorClient;
use crate::config::{HandlerRegistry, SinkConfiguration};
use crate::sink::{DispatcherSink, SinkError, SinkHandle};
use ckmon_common::{LogLevel, MutexExt, TagSet};
use ckmon_format::ExceptionData;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tracing::debug;

/// The pump façade: aggregates many monitors into many handlers.
///
/// Owns the dispatcher and the client registry. Clients are tracked by weak
/// reference so monitors that go away without unregistering do not leak; the
/// dispatcher's periodic garbage occasion sweeps the dead ones.
pub struct GrandOutput {
    sink: DispatcherSink,
    clients: Arc<Mutex<HashMap<String, Weak<MonitorClient>>>>,
}

impl GrandOutput {
    /// Creates a pump and applies `config` as configuration n°0. Must be
    /// called from within a tokio runtime.
    pub fn new(registry: HandlerRegistry, config: SinkConfiguration) -> Self {
        let clients: Arc<Mutex<HashMap<String, Weak<MonitorClient>>>> = Arc::default();
        let sweep = {
            let clients = Arc::clone(&clients);
            Box::new(move || {
                let mut map = clients.lock_or_panic();
                let before = map.len();
                map.retain(|_, client| client.strong_count() > 0);
                let swept = before - map.len();
                if swept > 0 {
                    debug!(swept, "swept dead monitor clients");
                }
            }) as Box<dyn FnMut() + Send>
        };
        let sink = DispatcherSink::with_garbage_callback(registry, config, Some(sweep));
        Self { sink, clients }
    }

    pub fn handle(&self) -> &SinkHandle {
        self.sink.handle()
    }

    pub fn grand_output_id(&self) -> &str {
        self.sink.handle().grand_output_id()
    }

    pub fn is_disposed(&self) -> bool {
        self.sink.handle().is_disposed()
    }

    /// Binds a monitor to this pump. At most one client exists per monitor
    /// id: re-registration hands back the existing client with its
    /// previous-entry chain reset to `(None, Unknown)`.
    pub fn register_client(&self, monitor_id: &str) -> Arc<MonitorClient> {
        let mut map = self.clients.lock_or_panic();
        if let Some(existing) = map.get(monitor_id).and_then(Weak::upgrade) {
            existing.reset();
            return existing;
        }
        let client = Arc::new(MonitorClient::new(
            monitor_id.to_string(),
            self.sink.handle().clone(),
        ));
        map.insert(monitor_id.to_string(), Arc::downgrade(&client));
        client
    }

    /// Explicit unbind. Dropped clients that skip this are collected by the
    /// periodic sweep.
    pub fn unregister_client(&self, monitor_id: &str) {
        self.clients.lock_or_panic().remove(monitor_id);
    }

    /// Number of live registered clients.
    pub fn client_count(&self) -> usize {
        self.clients
            .lock_or_panic()
            .values()
            .filter(|c| c.strong_count() > 0)
            .count()
    }

    pub async fn apply_configuration(
        &self,
        config: SinkConfiguration,
        wait: bool,
    ) -> Result<(), SinkError> {
        self.sink.handle().apply_configuration(config, wait).await
    }

    pub async fn external_log(
        &self,
        level: LogLevel,
        tags: TagSet,
        text: impl Into<String>,
        exception: Option<ExceptionData>,
    ) {
        self.sink
            .handle()
            .external_log(level, tags, text, exception)
            .await
    }

    /// Stops the pump: drains, deactivates handlers, then returns. With a
    /// timeout, the consumer task is abandoned once it elapses.
    pub async fn stop(&self, force_close_after: Option<Duration>) {
        self.sink.stop(force_close_after).await;
    }
}

fn default_slot() -> &'static Mutex<Option<Arc<GrandOutput>>> {
    static DEFAULT: OnceLock<Mutex<Option<Arc<GrandOutput>>>> = OnceLock::new();
    DEFAULT.get_or_init(Default::default)
}

impl GrandOutput {
    /// Creates the process-wide default pump if it does not exist yet and
    /// returns it. Explicit opt-in: nothing constructs it implicitly, and
    /// [`GrandOutput::dispose_default`] gives it deterministic teardown.
    pub fn ensure_default(registry: HandlerRegistry, config: SinkConfiguration) -> Arc<GrandOutput> {
        let mut slot = default_slot().lock_or_panic();
        if let Some(existing) = slot.as_ref() {
            return Arc::clone(existing);
        }
        let output = Arc::new(GrandOutput::new(registry, config));
        *slot = Some(Arc::clone(&output));
        output
    }

    /// The default pump, if one was set up.
    pub fn default_instance() -> Option<Arc<GrandOutput>> {
        default_slot().lock_or_panic().clone()
    }

    /// Tears the default pump down, draining it first.
    pub async fn dispose_default() {
        let taken = default_slot().lock_or_panic().take();
        if let Some(output) = taken {
            output.stop(None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::memory::{self, MemoryConfig};

    fn memory_config(name: &str) -> SinkConfiguration {
        SinkConfiguration::new().with_handler(Arc::new(MemoryConfig {
            name: name.to_string(),
        }))
    }

    #[tokio::test]
    async fn test_one_client_per_monitor_id() {
        let output = GrandOutput::new(HandlerRegistry::with_defaults(), memory_config("go-one"));
        let a = output.register_client("m1");
        let b = output.register_client("m1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(output.client_count(), 1);
        let c = output.register_client("m2");
        assert_eq!(c.monitor_id(), "m2");
        assert_eq!(output.client_count(), 2);
        output.stop(None).await;
    }

    #[tokio::test]
    async fn test_sweep_collects_dropped_clients() {
        let output = GrandOutput::new(HandlerRegistry::with_defaults(), memory_config("go-sweep"));
        {
            let _transient = output.register_client("gone");
        }
        let _kept = output.register_client("kept");
        output.handle().garbage_dead_clients().await;
        // Drain the command before observing.
        output
            .apply_configuration(memory_config("go-sweep"), true)
            .await
            .unwrap();
        assert_eq!(output.client_count(), 1);
        output.stop(None).await;
    }

    #[tokio::test]
    async fn test_external_log_reaches_handlers() {
        let output = GrandOutput::new(HandlerRegistry::with_defaults(), memory_config("go-ext"));
        output
            .external_log(LogLevel::Warn, TagSet::EMPTY, "from outside", None)
            .await;
        output.stop(None).await;
        let texts = memory::texts("go-ext");
        assert!(texts.iter().any(|t| t == "from outside"), "{texts:?}");
        let entries = memory::snapshot("go-ext");
        let external = entries
            .iter()
            .find(|e| e.text.as_deref() == Some("from outside"))
            .unwrap();
        assert_eq!(external.monitor_id(), Some(crate::EXTERNAL_MONITOR_ID));
    }
}
