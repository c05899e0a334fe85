// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of 100 ns ticks per second.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// A UTC instant with a one-byte uniquifier that breaks same-tick ties.
///
/// Ordering is lexicographic on `(ticks_utc, uniquifier)`, which gives a total
/// order across all stamps emitted by a single monitor: [`DateTimeStamp::next_after`]
/// guarantees strict growth even when the clock does not advance between two
/// emissions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct DateTimeStamp {
    /// 100 ns ticks since the Unix epoch, UTC.
    pub ticks_utc: i64,
    pub uniquifier: u8,
}

impl DateTimeStamp {
    /// The "no previous entry" sentinel. Smaller than any stamp produced by
    /// [`DateTimeStamp::now`].
    pub const UNKNOWN: DateTimeStamp = DateTimeStamp {
        ticks_utc: 0,
        uniquifier: 0,
    };

    pub const fn new(ticks_utc: i64, uniquifier: u8) -> Self {
        Self {
            ticks_utc,
            uniquifier,
        }
    }

    pub fn now() -> Self {
        let ticks = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => (d.as_nanos() / 100) as i64,
            // Clock set before the epoch: clamp to the smallest known stamp.
            Err(_) => 1,
        };
        Self {
            ticks_utc: ticks,
            uniquifier: 0,
        }
    }

    pub fn is_known(self) -> bool {
        self != Self::UNKNOWN
    }

    /// A stamp for the current instant, strictly greater than `prev`.
    pub fn next_after(prev: DateTimeStamp) -> Self {
        let now = Self::now();
        if now > prev {
            now
        } else if prev.uniquifier < u8::MAX {
            Self::new(prev.ticks_utc, prev.uniquifier + 1)
        } else {
            Self::new(prev.ticks_utc + 1, 0)
        }
    }
}

impl Display for DateTimeStamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.uniquifier == 0 {
            write!(f, "{}", self.ticks_utc)
        } else {
            write!(f, "{}({})", self.ticks_utc, self.uniquifier)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexicographic_order() {
        let a = DateTimeStamp::new(10, 0);
        let b = DateTimeStamp::new(10, 1);
        let c = DateTimeStamp::new(11, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(DateTimeStamp::UNKNOWN < a);
    }

    #[test]
    fn test_next_after_is_strictly_greater() {
        let mut prev = DateTimeStamp::now();
        for _ in 0..1000 {
            let next = DateTimeStamp::next_after(prev);
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_uniquifier_overflow_bumps_ticks() {
        let far_future = DateTimeStamp::new(i64::MAX - 1, u8::MAX);
        let next = DateTimeStamp::next_after(far_future);
        assert_eq!(next, DateTimeStamp::new(i64::MAX, 0));
    }
}
