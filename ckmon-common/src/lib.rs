// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::{Mutex, MutexGuard};

pub mod fifo;
pub mod level;
pub mod stamp;
pub mod tag;

pub use fifo::FifoBuffer;
pub use level::{LogFilter, LogLevel, LogLevelEx, LogLevelFilter};
pub use stamp::DateTimeStamp;
pub use tag::TagSet;

/// Extension trait for `Mutex` to acquire a lock, panicking if the lock is
/// poisoned.
///
/// Centralizes the one sanctioned panic so that the crate-level
/// `deny(clippy::unwrap_used)` does not need per-call-site allows.
///
/// # Panics
///
/// Panics if the `Mutex` is poisoned.
pub trait MutexExt<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[inline(always)]
    #[track_caller]
    fn lock_or_panic(&self) -> MutexGuard<'_, T> {
        #[allow(clippy::unwrap_used)]
        self.lock().unwrap()
    }
}
