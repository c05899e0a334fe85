// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

/// Tag attached to entries whose text is a full identity card payload.
pub const IDENTITY_CARD_FULL: &str = "IdentityCardFull";
/// Tag attached to entries whose text is an additive identity card payload.
pub const IDENTITY_CARD_UPDATE: &str = "IdentityCardUpdate";

/// A normalized set of atomic tags.
///
/// The canonical form is the atoms sorted, deduplicated and joined with `|`:
/// `"Machine|Sql"`. Many tag sets are made from literal strings, so the
/// backing storage is a `Cow` to save allocations for the static ones.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(transparent)]
pub struct TagSet {
    value: Cow<'static, str>,
}

// Deserialization goes through `TagSet::new` so arbitrary input ends up in
// canonical form.
impl<'de> Deserialize<'de> for TagSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        Ok(TagSet::new(&text))
    }
}

impl TagSet {
    pub const EMPTY: TagSet = TagSet {
        value: Cow::Borrowed(""),
    };

    /// Builds a set from a `|`-separated string: atoms are trimmed, empty
    /// atoms dropped, duplicates removed, and the result sorted.
    pub fn new(text: &str) -> Self {
        let mut atoms: Vec<&str> = text
            .split('|')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .collect();
        atoms.sort_unstable();
        atoms.dedup();
        if atoms.is_empty() {
            return Self::EMPTY;
        }
        Self {
            value: Cow::Owned(atoms.join("|")),
        }
    }

    /// Wraps an already-normalized static string without re-normalizing.
    /// Debug builds assert the invariant.
    pub fn from_static(value: &'static str) -> Self {
        debug_assert_eq!(Self::new(value).value, value, "tag set not normalized");
        Self {
            value: Cow::Borrowed(value),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn atoms(&self) -> impl Iterator<Item = &str> {
        self.value.split('|').filter(|a| !a.is_empty())
    }

    pub fn contains(&self, atom: &str) -> bool {
        self.atoms().any(|a| a == atom)
    }

    /// Whether the two sets share at least one atom.
    pub fn overlaps(&self, other: &TagSet) -> bool {
        self.atoms().any(|a| other.contains(a))
    }

    pub fn union(&self, other: &TagSet) -> TagSet {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        TagSet::new(&format!("{}|{}", self.value, other.value))
    }
}

impl Debug for TagSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagSet").field("value", &self.value).finish()
    }
}

impl Display for TagSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.value)
    }
}

impl FromStr for TagSet {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TagSet::new(s))
    }
}

impl From<&str> for TagSet {
    fn from(s: &str) -> Self {
        TagSet::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        let cases = [
            ("", ""),
            ("|", ""),
            (" | ", ""),
            ("Sql", "Sql"),
            ("Sql|Machine", "Machine|Sql"),
            ("Sql|Sql", "Sql"),
            ("  Sql |  Machine | Sql ", "Machine|Sql"),
        ];
        for (input, expected) in cases {
            assert_eq!(TagSet::new(input).as_str(), expected, "input '{input}'");
        }
    }

    #[test]
    fn test_overlaps() {
        let sql = TagSet::new("Sql");
        let both = TagSet::new("Machine|Sql");
        let machine = TagSet::new("Machine");
        assert!(sql.overlaps(&both));
        assert!(both.overlaps(&machine));
        assert!(!sql.overlaps(&machine));
        assert!(!TagSet::EMPTY.overlaps(&sql));
    }

    #[test]
    fn test_union() {
        let a = TagSet::new("Sql");
        let b = TagSet::new("Machine");
        assert_eq!(a.union(&b).as_str(), "Machine|Sql");
        assert_eq!(TagSet::EMPTY.union(&a), a);
    }

    #[test]
    fn test_deserialization_normalizes() {
        let t: TagSet = serde_json::from_str("\"Sql|Machine|Sql\"").unwrap();
        assert_eq!(t.as_str(), "Machine|Sql");
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"Machine|Sql\"");
    }

    #[test]
    fn test_from_static_accepts_normalized() {
        let t = TagSet::from_static("Machine|Sql");
        assert!(t.contains("Machine"));
        assert!(t.contains("Sql"));
        assert!(!t.contains("Sq"));
    }
}
