// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Discovered attribute set of a monitor, parsed from entries tagged
/// `IdentityCardFull` (complete replacement) or `IdentityCardUpdate`
/// (additive merge).
///
/// The payload is the entry text: one `key: value` pair per line. Lines
/// without a separator and empty keys are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentityCard {
    entries: BTreeMap<String, String>,
}

impl IdentityCard {
    pub fn parse(text: &str) -> IdentityCard {
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            entries.insert(key.to_string(), value.trim().to_string());
        }
        IdentityCard { entries }
    }

    /// Additive merge: `other`'s pairs are inserted, overwriting same keys.
    pub fn merge(&mut self, other: &IdentityCard) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Display for IdentityCard {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{key}: {value}")?;
        }
        Ok(())
    }
}
