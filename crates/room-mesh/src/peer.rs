use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a participant within one room.
///
/// Ordering is only used for tie-breaking: ids made entirely of ASCII digits
/// compare by numeric value and sort before every other id, everything else
/// compares lexicographically.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<&str> {
        if !self.0.is_empty() && self.0.bytes().all(|b| b.is_ascii_digit()) {
            Some(self.0.trim_start_matches('0'))
        } else {
            None
        }
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a
                .len()
                .cmp(&b.len())
                .then_with(|| a.cmp(b))
                .then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Politeness {
    Polite,
    Impolite,
}

/// Role of `local` towards `remote`. The smaller id is polite.
pub fn politeness(local: &PeerId, remote: &PeerId) -> Politeness {
    if local < remote {
        Politeness::Polite
    } else {
        Politeness::Impolite
    }
}

/// Whether `local` is the side that sends the first offer to `remote`.
pub fn is_initiator(local: &PeerId, remote: &PeerId) -> bool {
    politeness(local, remote) == Politeness::Polite
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PeerId {
        PeerId::new(s)
    }

    #[test]
    fn exactly_one_side_initiates() {
        let pairs = [("alice", "bob"), ("7", "12"), ("42", "abc"), ("u-1", "u-10")];
        for (a, b) in pairs {
            let (a, b) = (id(a), id(b));
            assert!(is_initiator(&a, &b) ^ is_initiator(&b, &a), "{a} vs {b}");
        }
    }

    #[test]
    fn smaller_id_initiates() {
        assert!(is_initiator(&id("alice"), &id("bob")));
        assert!(!is_initiator(&id("bob"), &id("alice")));
        assert_eq!(politeness(&id("alice"), &id("bob")), Politeness::Polite);
        assert_eq!(politeness(&id("bob"), &id("alice")), Politeness::Impolite);
    }

    #[test]
    fn numeric_ids_compare_by_value() {
        assert!(id("9") < id("10"));
        assert!(id("10") < id("100"));
        assert!(id("007") < id("7"));
        assert_ne!(id("007"), id("7"));
    }

    #[test]
    fn numeric_ids_sort_before_text() {
        assert!(id("2") < id("1a"));
        assert!(id("10") < id("1a"));
        assert!(id("999") < id("a"));
    }

    #[test]
    fn ordering_is_total_over_mixed_ids() {
        let mut ids: Vec<PeerId> = ["b", "10", "a", "2", "1a", "02", "zz"]
            .into_iter()
            .map(id)
            .collect();
        ids.sort();
        let sorted: Vec<&str> = ids.iter().map(PeerId::as_str).collect();
        assert_eq!(sorted, ["02", "2", "10", "1a", "a", "b", "zz"]);
    }
}
