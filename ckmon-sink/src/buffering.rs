// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Template for handlers whose delivery may transiently fail.
//!
//! [`BufferingHandler`] buffers entries in a bounded FIFO while the transport
//! is unavailable or disconnected and drains it head-first on recovery, so
//! delivery order is preserved. Two capacities exist because the phases
//! differ: the pre-connection buffer absorbs the start-up window before the
//! transport is reachable, the lost-connection buffer is sized for outage
//! windows after a healthy link was established.

use crate::config::HandlerConfig;
use crate::handler::{Handler, SinkMonitor};
use async_trait::async_trait;
use ckmon_common::FifoBuffer;
use ckmon_format::LogEntry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Buffer capacities of a [`BufferingHandler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferingConfig {
    /// Capacity used before a sender was ever created.
    #[serde(default = "default_buffer_size")]
    pub initial_buffer_size: usize,
    /// Capacity used once a sender exists, for windows where the link drops.
    #[serde(default = "default_buffer_size")]
    pub lost_buffer_size: usize,
}

fn default_buffer_size() -> usize {
    512
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            initial_buffer_size: default_buffer_size(),
            lost_buffer_size: default_buffer_size(),
        }
    }
}

/// Transport capability of a buffering handler. `try_send` never errors:
/// `false` is a transient failure (the caller buffers and retries later);
/// permanent failures are the sender's own business to report and still
/// return `false`.
#[async_trait]
pub trait Sender: Send {
    fn is_actually_connected(&self) -> bool;

    async fn try_send(&mut self, entry: &LogEntry) -> bool;

    /// Releases transport resources.
    async fn dispose(&mut self);
}

/// Hooks a concrete remote handler plugs into the [`BufferingHandler`]
/// template.
#[async_trait]
pub trait SenderProvider: Send {
    type Sender: Sender;

    /// Whether the environment allows creating a sender at all (credentials
    /// resolved, target known, ...).
    fn can_create_sender(&self) -> bool {
        true
    }

    /// Attempts to create the transport. `None` is fatal at activation time
    /// and during `handle`; the template keeps polling from `on_timer`
    /// otherwise.
    async fn create_sender(&mut self, monitor: &SinkMonitor) -> Option<Self::Sender>;

    fn buffering(&self) -> BufferingConfig;

    /// Applies an updated configuration of this handler's type. `false`
    /// means "not mine": the handler will be destroyed and recreated.
    fn apply_configuration(&mut self, config: &Arc<dyn HandlerConfig>) -> bool;
}

/// Generic transient-failure-tolerant handler over a [`SenderProvider`].
pub struct BufferingHandler<P: SenderProvider> {
    provider: P,
    sender: Option<P::Sender>,
    buffer: FifoBuffer<LogEntry>,
}

impl<P: SenderProvider> BufferingHandler<P> {
    pub fn new(provider: P) -> Self {
        let capacity = provider.buffering().initial_buffer_size;
        Self {
            provider,
            sender: None,
            buffer: FifoBuffer::new(capacity),
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn resize_buffer(&mut self) {
        let config = self.provider.buffering();
        let capacity = if self.sender.is_some() {
            config.lost_buffer_size
        } else {
            config.initial_buffer_size
        };
        if capacity != self.buffer.capacity() {
            self.buffer.set_capacity(capacity);
        }
    }

    async fn try_create_sender(&mut self, monitor: &SinkMonitor) -> bool {
        match self.provider.create_sender(monitor).await {
            Some(sender) => {
                self.sender = Some(sender);
                self.resize_buffer();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl<P: SenderProvider> Handler for BufferingHandler<P> {
    async fn activate(&mut self, monitor: &SinkMonitor) -> bool {
        if self.provider.can_create_sender() {
            if !self.try_create_sender(monitor).await {
                return false;
            }
        } else {
            // Admitted in pre-connection mode: the transport may become
            // reachable later.
            self.resize_buffer();
        }
        true
    }

    async fn handle(&mut self, monitor: &SinkMonitor, entry: &LogEntry) -> anyhow::Result<()> {
        if self.sender.is_none() && self.provider.can_create_sender() {
            if !self.try_create_sender(monitor).await {
                anyhow::bail!("sender creation failed");
            }
        }
        // Drain the backlog head-first; stop at the first failure so order
        // is preserved.
        while !self.buffer.is_empty() {
            let sent = match self.sender.as_mut() {
                Some(sender) if sender.is_actually_connected() => match self.buffer.peek() {
                    Some(head) => sender.try_send(head).await,
                    None => break,
                },
                _ => false,
            };
            if sent {
                self.buffer.pop();
            } else {
                if self.buffer.push(entry.clone()).is_some() {
                    debug!("buffer overflow; oldest entry dropped");
                }
                return Ok(());
            }
        }
        let sent = match self.sender.as_mut() {
            Some(sender) if sender.is_actually_connected() => sender.try_send(entry).await,
            _ => false,
        };
        if !sent {
            self.buffer.push(entry.clone());
        }
        Ok(())
    }

    async fn on_timer(&mut self, monitor: &SinkMonitor, _span: Duration) {
        // Poll-based reconnection: a provider that could not create its
        // sender yet gets retried here, without the fatal semantics of
        // `handle`.
        if self.sender.is_none()
            && self.provider.can_create_sender()
            && self.try_create_sender(monitor).await
        {
            debug!("sender became available");
        }
    }

    async fn apply_configuration(
        &mut self,
        _monitor: &SinkMonitor,
        config: &Arc<dyn HandlerConfig>,
    ) -> bool {
        if !self.provider.apply_configuration(config) {
            return false;
        }
        self.resize_buffer();
        true
    }

    async fn deactivate(&mut self, _monitor: &SinkMonitor) {
        if let Some(mut sender) = self.sender.take() {
            sender.dispose().await;
        }
        let discarded = self.buffer.len();
        if discarded > 0 {
            // In-memory system: undelivered entries do not survive the
            // handler.
            warn!(discarded, "deactivated with undelivered buffered entries");
        }
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ckmon_common::{DateTimeStamp, LogLevel, TagSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct TestTransport {
        connected: Arc<AtomicBool>,
        delivered: Arc<Mutex<Vec<String>>>,
    }

    struct TestSender {
        transport: TestTransport,
        disposed: bool,
    }

    #[async_trait]
    impl Sender for TestSender {
        fn is_actually_connected(&self) -> bool {
            self.transport.connected.load(Ordering::SeqCst)
        }

        async fn try_send(&mut self, entry: &LogEntry) -> bool {
            if !self.is_actually_connected() {
                return false;
            }
            self.transport
                .delivered
                .lock()
                .unwrap()
                .push(entry.text.clone().unwrap_or_default());
            true
        }

        async fn dispose(&mut self) {
            self.disposed = true;
        }
    }

    struct TestProvider {
        transport: TestTransport,
        creatable: bool,
        buffering: BufferingConfig,
    }

    #[async_trait]
    impl SenderProvider for TestProvider {
        type Sender = TestSender;

        fn can_create_sender(&self) -> bool {
            self.creatable
        }

        async fn create_sender(&mut self, _monitor: &SinkMonitor) -> Option<TestSender> {
            Some(TestSender {
                transport: self.transport.clone(),
                disposed: false,
            })
        }

        fn buffering(&self) -> BufferingConfig {
            self.buffering
        }

        fn apply_configuration(&mut self, _config: &Arc<dyn HandlerConfig>) -> bool {
            true
        }
    }

    fn entry(text: &str) -> LogEntry {
        LogEntry::line(
            LogLevel::Info,
            TagSet::EMPTY,
            text,
            DateTimeStamp::new(1, 0),
        )
    }

    fn test_monitor() -> SinkMonitor {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        SinkMonitor::new("go-test".into(), tx)
    }

    #[tokio::test]
    async fn test_buffers_while_disconnected_then_drains_in_order() {
        let transport = TestTransport::default();
        let provider = TestProvider {
            transport: transport.clone(),
            creatable: true,
            buffering: BufferingConfig::default(),
        };
        let mut handler = BufferingHandler::new(provider);
        let monitor = test_monitor();
        assert!(handler.activate(&monitor).await);

        for text in ["one", "two", "three"] {
            handler.handle(&monitor, &entry(text)).await.unwrap();
        }
        assert_eq!(handler.buffered_len(), 3);
        assert!(transport.delivered.lock().unwrap().is_empty());

        transport.connected.store(true, Ordering::SeqCst);
        handler.handle(&monitor, &entry("four")).await.unwrap();
        assert_eq!(handler.buffered_len(), 0);
        assert_eq!(
            *transport.delivered.lock().unwrap(),
            vec!["one", "two", "three", "four"]
        );
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let transport = TestTransport::default();
        let provider = TestProvider {
            transport: transport.clone(),
            creatable: true,
            buffering: BufferingConfig {
                initial_buffer_size: 2,
                lost_buffer_size: 2,
            },
        };
        let mut handler = BufferingHandler::new(provider);
        let monitor = test_monitor();
        assert!(handler.activate(&monitor).await);

        for text in ["a", "b", "c"] {
            handler.handle(&monitor, &entry(text)).await.unwrap();
        }
        transport.connected.store(true, Ordering::SeqCst);
        handler.handle(&monitor, &entry("d")).await.unwrap();
        // "a" was dropped on overflow; "b" and "c" survived, then "d".
        assert_eq!(*transport.delivered.lock().unwrap(), vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_pre_connection_mode_when_sender_not_creatable() {
        let transport = TestTransport::default();
        let provider = TestProvider {
            transport: transport.clone(),
            creatable: false,
            buffering: BufferingConfig::default(),
        };
        let mut handler = BufferingHandler::new(provider);
        let monitor = test_monitor();
        // Admitted without a sender.
        assert!(handler.activate(&monitor).await);
        handler.handle(&monitor, &entry("early")).await.unwrap();
        assert_eq!(handler.buffered_len(), 1);
        assert!(handler.sender.is_none());
    }

    #[tokio::test]
    async fn test_connection_loss_re_buffers() {
        let transport = TestTransport::default();
        transport.connected.store(true, Ordering::SeqCst);
        let provider = TestProvider {
            transport: transport.clone(),
            creatable: true,
            buffering: BufferingConfig::default(),
        };
        let mut handler = BufferingHandler::new(provider);
        let monitor = test_monitor();
        assert!(handler.activate(&monitor).await);

        handler.handle(&monitor, &entry("direct")).await.unwrap();
        assert_eq!(handler.buffered_len(), 0);

        transport.connected.store(false, Ordering::SeqCst);
        handler.handle(&monitor, &entry("held")).await.unwrap();
        assert_eq!(handler.buffered_len(), 1);

        transport.connected.store(true, Ordering::SeqCst);
        handler.handle(&monitor, &entry("resumed")).await.unwrap();
        assert_eq!(
            *transport.delivered.lock().unwrap(),
            vec!["direct", "held", "resumed"]
        );
    }
}
