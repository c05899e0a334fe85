// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::handler::Handler;
use crate::{DEFAULT_TIMER_DURATION, DEFAULT_GARBAGE_PERIOD};
use anyhow::Context;
use ckmon_common::{LogFilter, LogLevelFilter, TagSet};
use serde::Deserialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Configuration of one handler. The concrete type selects the handler: the
/// dispatcher matches live handlers to incoming configurations by
/// [`HandlerConfig::type_name`], and the [`HandlerRegistry`] builds instances
/// from it.
pub trait HandlerConfig: Any + Debug + Send + Sync {
    /// Stable name of the configuration type, e.g. `"BinaryFile"`.
    fn type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;
}

/// Explicit registration table mapping a configuration type to its parser and
/// handler factory. Populated at startup; unknown types found in a
/// configuration are reported and skipped.
pub struct HandlerRegistry {
    entries: HashMap<&'static str, RegistryEntry>,
}

struct RegistryEntry {
    parse: Box<dyn Fn(&serde_json::Value) -> anyhow::Result<Arc<dyn HandlerConfig>> + Send + Sync>,
    build: Box<dyn Fn(&Arc<dyn HandlerConfig>) -> anyhow::Result<Box<dyn Handler>> + Send + Sync>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// A registry with the built-in handler types registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        crate::handlers::register_defaults(&mut registry);
        registry
    }

    /// Registers a configuration type under `name`. `builder` turns a parsed
    /// configuration into a live handler.
    pub fn register<C>(
        &mut self,
        name: &'static str,
        builder: impl Fn(&C) -> anyhow::Result<Box<dyn Handler>> + Send + Sync + 'static,
    ) where
        C: HandlerConfig + for<'de> Deserialize<'de>,
    {
        self.entries.insert(
            name,
            RegistryEntry {
                parse: Box::new(|value| {
                    let config: C = serde_json::from_value(value.clone()).with_context(|| {
                        format!(
                            "invalid '{}' handler configuration",
                            std::any::type_name::<C>()
                        )
                    })?;
                    Ok(Arc::new(config) as Arc<dyn HandlerConfig>)
                }),
                build: Box::new(move |config| {
                    let concrete = config
                        .as_any()
                        .downcast_ref::<C>()
                        .with_context(|| format!("configuration is not a '{}'", config.type_name()))?;
                    builder(concrete)
                }),
            },
        );
    }

    pub fn parse(&self, name: &str, value: &serde_json::Value) -> anyhow::Result<Arc<dyn HandlerConfig>> {
        let entry = self
            .entries
            .get(name)
            .with_context(|| format!("unknown handler type '{name}'"))?;
        (entry.parse)(value)
    }

    /// Builds a handler for `config`. Fails for unregistered types: a
    /// configuration error, not a fault of the remaining configuration.
    pub fn build(&self, config: &Arc<dyn HandlerConfig>) -> anyhow::Result<Box<dyn Handler>> {
        let entry = self
            .entries
            .get(config.type_name())
            .with_context(|| format!("unknown handler type '{}'", config.type_name()))?;
        (entry.build)(config)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Target state of the dispatcher: the ordered handler set plus the pump
/// options. Applied atomically by the consumer task; a newer pending
/// configuration supersedes an older one.
#[derive(Clone, Debug)]
pub struct SinkConfiguration {
    /// Period of the `on_timer` tick.
    pub timer_duration: Duration,
    /// Period of the dead-client sweep.
    pub garbage_period: Duration,
    /// Ordered handler configurations; order is preserved at fan-out.
    pub handlers: Vec<Arc<dyn HandlerConfig>>,
    /// Lower bound applied to all bound monitors. `Undefined` sides retain
    /// the previously applied value.
    pub minimal_filter: LogFilter,
    /// Gate for `external_log`. `Undefined` retains the previous value.
    pub external_log_level_filter: LogLevelFilter,
    /// Per-tag filter overrides; the first overlapping tag set wins.
    pub tag_filters: Vec<(TagSet, LogFilter)>,
}

impl SinkConfiguration {
    pub fn new() -> Self {
        Self {
            timer_duration: DEFAULT_TIMER_DURATION,
            garbage_period: DEFAULT_GARBAGE_PERIOD,
            handlers: Vec::new(),
            minimal_filter: LogFilter::UNDEFINED,
            external_log_level_filter: LogLevelFilter::Undefined,
            tag_filters: Vec::new(),
        }
    }

    pub fn with_handler(mut self, config: Arc<dyn HandlerConfig>) -> Self {
        self.handlers.push(config);
        self
    }

    /// Loads a configuration from its JSON form. Handler entries carry a
    /// `"type"` discriminator resolved through `registry`:
    ///
    /// ```json
    /// {
    ///   "timer_duration_ms": 500,
    ///   "minimal_filter": "Debug",
    ///   "handlers": [ { "type": "BinaryFile", "path": "logs/out.ckmon" } ]
    /// }
    /// ```
    pub fn from_json(registry: &HandlerRegistry, value: &serde_json::Value) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            timer_duration_ms: Option<u64>,
            #[serde(default)]
            garbage_period_ms: Option<u64>,
            #[serde(default)]
            minimal_filter: Option<String>,
            #[serde(default)]
            external_log_level_filter: Option<LogLevelFilter>,
            #[serde(default)]
            tag_filters: Vec<(String, String)>,
            #[serde(default)]
            handlers: Vec<serde_json::Value>,
        }

        let raw: Raw = serde_json::from_value(value.clone()).context("invalid sink configuration")?;
        let mut config = SinkConfiguration::new();
        if let Some(ms) = raw.timer_duration_ms {
            config.timer_duration = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.garbage_period_ms {
            config.garbage_period = Duration::from_millis(ms);
        }
        if let Some(filter) = raw.minimal_filter {
            config.minimal_filter = filter
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid minimal_filter: {e}"))?;
        }
        if let Some(filter) = raw.external_log_level_filter {
            config.external_log_level_filter = filter;
        }
        for (tags, filter) in raw.tag_filters {
            let filter: LogFilter = filter
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid tag filter for '{tags}': {e}"))?;
            config.tag_filters.push((TagSet::new(&tags), filter));
        }
        for handler in &raw.handlers {
            let type_name = handler
                .get("type")
                .and_then(|t| t.as_str())
                .context("handler configuration without a 'type' field")?;
            config
                .handlers
                .push(registry.parse(type_name, handler)?);
        }
        Ok(config)
    }
}

impl Default for SinkConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::memory::MemoryConfig;
    use serde_json::json;

    #[test]
    fn test_from_json_round_trip() {
        let registry = HandlerRegistry::with_defaults();
        let value = json!({
            "timer_duration_ms": 250,
            "minimal_filter": "{Off,Debug}",
            "tag_filters": [["Sql", "Debug"], ["Machine", "Release!"]],
            "handlers": [
                { "type": "Memory", "name": "from-json" }
            ]
        });
        let config = SinkConfiguration::from_json(&registry, &value).unwrap();
        assert_eq!(config.timer_duration, Duration::from_millis(250));
        assert_eq!(
            config.minimal_filter,
            LogFilter::new(LogLevelFilter::Off, LogLevelFilter::Debug)
        );
        assert_eq!(config.tag_filters.len(), 2);
        assert_eq!(config.tag_filters[1].1, LogFilter::RELEASE);
        assert_eq!(config.handlers.len(), 1);
        assert_eq!(config.handlers[0].type_name(), "Memory");
        let memory = config.handlers[0]
            .as_any()
            .downcast_ref::<MemoryConfig>()
            .unwrap();
        assert_eq!(memory.name, "from-json");
    }

    #[test]
    fn test_unknown_handler_type_is_an_error() {
        let registry = HandlerRegistry::with_defaults();
        let value = json!({ "handlers": [ { "type": "Teleporter" } ] });
        let err = SinkConfiguration::from_json(&registry, &value).unwrap_err();
        assert!(err.to_string().contains("Teleporter"), "{err}");
    }
}
