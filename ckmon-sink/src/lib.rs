// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collection and fan-out of activity-log events.
//!
//! Many producers feed a bounded channel; a single consumer task drives an
//! ordered list of [`handler::Handler`]s, supports hot reconfiguration of
//! that list and performs periodic maintenance. See [`sink::DispatcherSink`]
//! for the pump and [`grand_output::GrandOutput`] for the owning façade.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::time::Duration;

pub mod buffering;
mod chain;
pub mod client;
pub mod config;
pub mod grand_output;
pub mod handler;
pub mod handlers;
pub mod sink;

pub use buffering::{BufferingConfig, BufferingHandler, Sender, SenderProvider};
pub use client::MonitorClient;
pub use config::{HandlerConfig, HandlerRegistry, SinkConfiguration};
pub use grand_output::GrandOutput;
pub use handler::{Handler, SinkMonitor};
pub use sink::{DispatcherSink, DisposingToken, SinkError, SinkHandle, SinkStatus};

/// Monitor id stamped on entries synthesized by `external_log`: logs emitted
/// outside of any monitor context.
pub const EXTERNAL_MONITOR_ID: &str = "\u{a7}ext";

/// Fallback grand-output id when none was assigned.
pub const FALLBACK_GRAND_OUTPUT_ID: &str = "\u{a7}none";

/// Default period of the handler timer.
pub const DEFAULT_TIMER_DURATION: Duration = Duration::from_millis(500);

/// Default period of the dead-client sweep.
pub const DEFAULT_GARBAGE_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Default capacity of the intake channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
