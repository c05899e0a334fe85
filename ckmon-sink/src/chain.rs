// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use ckmon_common::DateTimeStamp;
use ckmon_format::{EntryKind, MulticastInfo};

/// Previous-entry chain of one emitting monitor. Every multicast entry
/// references the (kind, time) of the monitor's immediately preceding entry,
/// `(None, UNKNOWN)` for the first.
#[derive(Debug, Clone)]
pub(crate) struct ChainState {
    prev_kind: Option<EntryKind>,
    prev_time: DateTimeStamp,
}

impl ChainState {
    pub(crate) fn new() -> Self {
        Self {
            prev_kind: None,
            prev_time: DateTimeStamp::UNKNOWN,
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }

    /// Stamps the next entry of `monitor_id`: returns its time (strictly
    /// greater than the previous one) and the provenance footer, then records
    /// the entry as the new chain head.
    pub(crate) fn advance(
        &mut self,
        monitor_id: &str,
        kind: EntryKind,
        group_depth: u32,
    ) -> (DateTimeStamp, MulticastInfo) {
        let time = DateTimeStamp::next_after(self.prev_time);
        let info = MulticastInfo {
            monitor_id: monitor_id.to_string(),
            prev_kind: self.prev_kind,
            prev_time: self.prev_time,
            group_depth,
        };
        self.prev_kind = Some(kind);
        self.prev_time = time;
        (time, info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_entry_has_unknown_previous() {
        let mut chain = ChainState::new();
        let (time, info) = chain.advance("m", EntryKind::Line, 0);
        assert_eq!(info.prev_kind, None);
        assert_eq!(info.prev_time, DateTimeStamp::UNKNOWN);
        assert!(time > DateTimeStamp::UNKNOWN);
    }

    #[test]
    fn test_chain_links_consecutive_entries() {
        let mut chain = ChainState::new();
        let (t1, _) = chain.advance("m", EntryKind::OpenGroup, 0);
        let (t2, info2) = chain.advance("m", EntryKind::Line, 1);
        assert_eq!(info2.prev_kind, Some(EntryKind::OpenGroup));
        assert_eq!(info2.prev_time, t1);
        assert!(t2 > t1);
        let (_, info3) = chain.advance("m", EntryKind::CloseGroup, 1);
        assert_eq!(info3.prev_kind, Some(EntryKind::Line));
        assert_eq!(info3.prev_time, t2);
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut chain = ChainState::new();
        chain.advance("m", EntryKind::Line, 0);
        chain.reset();
        let (_, info) = chain.advance("m", EntryKind::Line, 0);
        assert_eq!(info.prev_kind, None);
        assert_eq!(info.prev_time, DateTimeStamp::UNKNOWN);
    }
}
