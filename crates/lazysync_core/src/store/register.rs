//! Last-writer-wins building blocks for the replicated document.
//!
//! # Invariants
//! - `Stamp` ordering is total: `(at, actor)`.
//! - Register merge picks the higher stamp; identical stamps fall back to the
//!   serialized value so merge stays commutative for any input pair.
//! - Set elements are never forgotten by merge: element stamps only grow.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Write stamp: wall-clock milliseconds plus the writing replica's actor id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub at: i64,
    pub actor: String,
}

impl Stamp {
    pub fn new(at: i64, actor: impl Into<String>) -> Self {
        Self {
            at,
            actor: actor.into(),
        }
    }

    /// Returns a stamp for `actor` that is strictly newer than `floor`.
    ///
    /// Uses `now` when the wall clock is already ahead, otherwise bumps past
    /// `floor` so a local write is never shadowed by a skewed older stamp.
    pub fn after(floor: Option<&Stamp>, now: i64, actor: &str) -> Self {
        match floor {
            Some(floor) if now <= floor.at => Self::new(floor.at + 1, actor),
            _ => Self::new(now, actor),
        }
    }
}

/// Single-value last-writer-wins register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    pub value: T,
    pub stamp: Stamp,
}

impl<T> LwwRegister<T>
where
    T: Clone + PartialEq + Serialize,
{
    pub fn new(value: T, stamp: Stamp) -> Self {
        Self { value, stamp }
    }

    /// Writes `value` when it differs from the current value.
    ///
    /// Returns whether the register changed. Unchanged writes keep the old
    /// stamp so repeated identical writes are no-ops.
    pub fn assign(&mut self, value: T, stamp: &Stamp) -> bool {
        if self.value == value {
            return false;
        }
        self.value = value;
        self.stamp = stamp.clone();
        true
    }

    /// Deterministic join of two registers.
    pub fn merge(&self, other: &Self) -> Self {
        match self.stamp.cmp(&other.stamp) {
            Ordering::Greater => self.clone(),
            Ordering::Less => other.clone(),
            Ordering::Equal => {
                if tie_key(&self.value) >= tie_key(&other.value) {
                    self.clone()
                } else {
                    other.clone()
                }
            }
        }
    }
}

fn tie_key<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Add/remove stamps for one set element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementStamps {
    #[serde(default)]
    pub added: Option<Stamp>,
    #[serde(default)]
    pub removed: Option<Stamp>,
}

impl ElementStamps {
    /// Adds win over removes carrying the same stamp.
    fn is_present(&self) -> bool {
        match (&self.added, &self.removed) {
            (Some(added), Some(removed)) => added >= removed,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn merge(&self, other: &Self) -> Self {
        Self {
            added: self.added.clone().max(other.added.clone()),
            removed: self.removed.clone().max(other.removed.clone()),
        }
    }
}

/// Last-writer-wins element set (tags and other string sets).
///
/// Merge is the union of known elements with per-element stamp maxima.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwSet {
    elements: BTreeMap<String, ElementStamps>,
}

impl LwwSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: &BTreeSet<String>, stamp: &Stamp) -> Self {
        let mut set = Self::new();
        set.assign(values, stamp);
        set
    }

    pub fn contains(&self, value: &str) -> bool {
        self.elements
            .get(value)
            .is_some_and(ElementStamps::is_present)
    }

    /// Visible elements in sorted order.
    pub fn values(&self) -> BTreeSet<String> {
        self.elements
            .iter()
            .filter(|(_, stamps)| stamps.is_present())
            .map(|(value, _)| value.clone())
            .collect()
    }

    /// Makes the visible elements equal to `values`.
    ///
    /// Returns whether anything changed.
    pub fn assign(&mut self, values: &BTreeSet<String>, stamp: &Stamp) -> bool {
        let mut changed = false;
        for value in values {
            if !self.contains(value) {
                let entry = self.elements.entry(value.clone()).or_default();
                entry.added = Some(stamp.clone());
                changed = true;
            }
        }
        for (value, stamps) in self.elements.iter_mut() {
            if stamps.is_present() && !values.contains(value) {
                stamps.removed = Some(stamp.clone());
                changed = true;
            }
        }
        changed
    }

    pub fn merge(&self, other: &Self) -> Self {
        let mut elements = self.elements.clone();
        for (value, stamps) in &other.elements {
            let merged = match elements.get(value) {
                Some(existing) => existing.merge(stamps),
                None => stamps.clone(),
            };
            elements.insert(value.clone(), merged);
        }
        Self { elements }
    }

    /// Newest stamp recorded for any element.
    pub fn max_stamp(&self) -> Option<&Stamp> {
        self.elements
            .values()
            .flat_map(|stamps| [stamps.added.as_ref(), stamps.removed.as_ref()])
            .flatten()
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::{LwwRegister, LwwSet, Stamp};
    use std::collections::BTreeSet;

    fn set_of(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn stamp_after_bumps_past_skewed_floor() {
        let floor = Stamp::new(5_000, "b");
        assert_eq!(Stamp::after(Some(&floor), 1_000, "a"), Stamp::new(5_001, "a"));
        assert_eq!(Stamp::after(Some(&floor), 6_000, "a"), Stamp::new(6_000, "a"));
        assert_eq!(Stamp::after(None, 7, "a"), Stamp::new(7, "a"));
    }

    #[test]
    fn register_merge_prefers_newer_stamp_then_actor() {
        let older = LwwRegister::new("old".to_string(), Stamp::new(1, "z"));
        let newer = LwwRegister::new("new".to_string(), Stamp::new(2, "a"));
        assert_eq!(older.merge(&newer).value, "new");
        assert_eq!(newer.merge(&older).value, "new");

        let left = LwwRegister::new("left".to_string(), Stamp::new(3, "a"));
        let right = LwwRegister::new("right".to_string(), Stamp::new(3, "b"));
        assert_eq!(left.merge(&right).value, "right");
        assert_eq!(right.merge(&left).value, "right");
    }

    #[test]
    fn register_merge_is_commutative_on_identical_stamps() {
        let stamp = Stamp::new(9, "same");
        let a = LwwRegister::new(1_u32, stamp.clone());
        let b = LwwRegister::new(2_u32, stamp);
        assert_eq!(a.merge(&b), b.merge(&a));
    }

    #[test]
    fn register_assign_skips_identical_values() {
        let mut register = LwwRegister::new(true, Stamp::new(1, "a"));
        assert!(!register.assign(true, &Stamp::new(2, "a")));
        assert_eq!(register.stamp, Stamp::new(1, "a"));
        assert!(register.assign(false, &Stamp::new(3, "a")));
        assert_eq!(register.stamp, Stamp::new(3, "a"));
    }

    #[test]
    fn set_merge_unions_concurrent_additions() {
        let base = LwwSet::from_values(&set_of(&["shared"]), &Stamp::new(1, "a"));
        let mut left = base.clone();
        left.assign(&set_of(&["shared", "left"]), &Stamp::new(2, "a"));
        let mut right = base;
        right.assign(&set_of(&["shared", "right"]), &Stamp::new(2, "b"));

        let merged = left.merge(&right);
        assert_eq!(merged.values(), set_of(&["left", "right", "shared"]));
        assert_eq!(merged, right.merge(&left));
    }

    #[test]
    fn set_removal_survives_merge_with_older_copy() {
        let old = LwwSet::from_values(&set_of(&["a", "b"]), &Stamp::new(1, "x"));
        let mut newer = old.clone();
        newer.assign(&set_of(&["a"]), &Stamp::new(2, "x"));

        let merged = old.merge(&newer);
        assert_eq!(merged.values(), set_of(&["a"]));
        assert_eq!(merged.max_stamp(), Some(&Stamp::new(2, "x")));
    }

    #[test]
    fn set_merge_is_idempotent() {
        let set = LwwSet::from_values(&set_of(&["a"]), &Stamp::new(4, "x"));
        assert_eq!(set.merge(&set), set);
    }
}
