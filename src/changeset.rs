//! Weighted multisets of records, the universal delta representation.
//!
//! Every edge of a pipeline carries a [`ChangeSet`]: an ordered list of
//! `(record, weight)` pairs where a positive weight is an insertion and a negative
//! weight a deletion. The logical multiset a change-set denotes is the per-record sum
//! of weights; [`ChangeSet::merge_records`] compacts a change-set to that canonical
//! form, accumulating weights of identical records and discarding records whose
//! accumulation is zero.
//!
//! Merged change-sets form a commutative group: [`ChangeSet::add`] is concatenation
//! followed by merging, [`ChangeSet::negate`] flips weights, and the empty change-set
//! is the additive identity.

use fnv::FnvHashMap;

use crate::row::fingerprint;
use crate::{Data, Weight};

/// An ordered list of `(record, weight)` pairs.
#[derive(Clone, Debug)]
pub struct ChangeSet<T> {
    updates: Vec<(T, Weight)>,
}

impl<T> Default for ChangeSet<T> {
    fn default() -> Self {
        ChangeSet { updates: Vec::new() }
    }
}

impl<T> ChangeSet<T> {
    /// The empty change-set, the additive identity.
    pub fn zero() -> Self {
        Self::default()
    }

    /// A change-set from a list of updates, as written.
    pub fn from_updates(updates: Vec<(T, Weight)>) -> Self {
        ChangeSet { updates }
    }

    /// Appends one weighted record.
    pub fn append(&mut self, record: T, weight: Weight) {
        self.updates.push((record, weight));
    }

    /// Appends all of `other`'s pairs, preserving their order.
    pub fn concat(&mut self, other: ChangeSet<T>) {
        let mut other = other;
        self.updates.append(&mut other.updates);
    }

    /// The pairs, in order.
    pub fn updates(&self) -> &[(T, Weight)] {
        &self.updates
    }

    /// Consumes the change-set, yielding its pairs.
    pub fn into_updates(self) -> Vec<(T, Weight)> {
        self.updates
    }

    /// Iterates the pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = &(T, Weight)> {
        self.updates.iter()
    }

    /// The number of pairs (not the logical cardinality).
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// Whether the change-set contains no pairs.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Whether every weight is exactly `1`.
    pub fn is_set(&self) -> bool {
        self.updates.iter().all(|(_, w)| *w == 1)
    }

    /// Whether every weight is positive.
    pub fn is_positive(&self) -> bool {
        self.updates.iter().all(|(_, w)| *w > 0)
    }

    /// Scales every weight by `k`, dropping pairs whose weight becomes zero.
    pub fn multiply(mut self, k: Weight) -> Self {
        for (_, w) in &mut self.updates {
            *w *= k;
        }
        self.updates.retain(|(_, w)| *w != 0);
        self
    }

    /// Flips the sign of every weight.
    pub fn negate(mut self) -> Self {
        for (_, w) in &mut self.updates {
            *w = -*w;
        }
        self
    }
}

impl<T: Data> ChangeSet<T> {
    /// Compacts the change-set into canonical form.
    ///
    /// Each distinct record appears at most once, with its accumulated weight;
    /// records accumulating to zero are dropped. Records keep their first-appearance
    /// order. Record identity is the structural serialization of the record, computed
    /// once per pair. Idempotent.
    pub fn merge_records(mut self) -> Self {
        if self.updates.len() > 1 {
            let mut index: FnvHashMap<String, usize> =
                FnvHashMap::with_capacity_and_hasher(self.updates.len(), Default::default());
            let mut merged: Vec<(T, Weight)> = Vec::with_capacity(self.updates.len());
            for (record, weight) in self.updates.drain(..) {
                match index.entry(fingerprint(&record)) {
                    std::collections::hash_map::Entry::Occupied(slot) => {
                        merged[*slot.get()].1 += weight;
                    }
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        slot.insert(merged.len());
                        merged.push((record, weight));
                    }
                }
            }
            self.updates = merged;
        }
        self.updates.retain(|(_, w)| *w != 0);
        self
    }

    /// Whether the change-set is in canonical form: at most one pair per distinct
    /// record, every weight non-zero.
    pub fn is_merged(&self) -> bool {
        let mut seen: FnvHashMap<String, ()> =
            FnvHashMap::with_capacity_and_hasher(self.updates.len(), Default::default());
        for (record, weight) in &self.updates {
            if *weight == 0 || seen.insert(fingerprint(record), ()).is_some() {
                return false;
            }
        }
        true
    }

    /// The sum of two change-sets: concatenation followed by merging.
    pub fn add(mut self, other: ChangeSet<T>) -> Self {
        self.concat(other);
        self.merge_records()
    }

    /// The difference of two change-sets: `self + (-other)`, merged.
    pub fn subtract(self, other: ChangeSet<T>) -> Self {
        self.add(other.negate())
    }

    /// Reduces a merged change-set to a set: every record with positive accumulated
    /// weight appears exactly once with weight `1`.
    pub fn distinct(self) -> Self {
        let mut merged = self.merge_records();
        merged.updates.retain(|(_, w)| *w > 0);
        for (_, w) in &mut merged.updates {
            *w = 1;
        }
        merged
    }
}

impl<T> IntoIterator for ChangeSet<T> {
    type Item = (T, Weight);
    type IntoIter = std::vec::IntoIter<(T, Weight)>;
    fn into_iter(self) -> Self::IntoIter {
        self.updates.into_iter()
    }
}

/// A record with an accumulated occurrence count.
///
/// Used wherever a set-semantic tree tracks multiplicities: [`Distinct`] reference
/// counts and [`View`] state.
///
/// [`Distinct`]: crate::operators::Distinct
/// [`View`]: crate::View
#[derive(Clone, Debug)]
pub struct Counted<T> {
    /// The record.
    pub row: T,
    /// Its accumulated count.
    pub count: Weight,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(updates: Vec<(&'static str, Weight)>) -> ChangeSet<&'static str> {
        ChangeSet::from_updates(updates)
    }

    fn pairs(cs: &ChangeSet<&'static str>) -> Vec<(&'static str, Weight)> {
        cs.updates().to_vec()
    }

    #[test]
    fn merge_accumulates_and_drops_zeros() {
        let test_cases = vec![
            (vec![("a", -1), ("b", -2), ("a", 1)], vec![("b", -2)]),
            (vec![("a", -1), ("b", 0), ("a", 1)], vec![]),
            (vec![("a", 0)], vec![]),
            (vec![("a", 1), ("b", 1)], vec![("a", 1), ("b", 1)]),
            (vec![("r", 1), ("r", 1), ("r", -1)], vec![("r", 1)]),
        ];
        for (input, output) in test_cases {
            assert_eq!(pairs(&set(input).merge_records()), output);
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let merged = set(vec![("a", 2), ("b", -1), ("a", -1)]).merge_records();
        let twice = merged.clone().merge_records();
        assert_eq!(pairs(&merged), pairs(&twice));
        assert!(merged.is_merged());
    }

    #[test]
    fn group_laws() {
        let a = set(vec![("x", 1), ("y", 2)]);
        let zero = ChangeSet::zero();

        // add(a, zero) = a
        assert_eq!(pairs(&a.clone().add(zero)), pairs(&a.clone().merge_records()));

        // add(a, negate(a)) = zero
        assert!(a.clone().subtract(a.clone()).is_empty());

        // associativity
        let b = set(vec![("y", -1), ("z", 3)]);
        let c = set(vec![("x", -1)]);
        let left = a.clone().add(b.clone()).add(c.clone());
        let right = a.clone().add(b.add(c));
        assert_eq!(pairs(&left), pairs(&right));
    }

    #[test]
    fn add_equals_merge_of_concat() {
        let a = set(vec![("x", 1), ("y", 2)]);
        let b = set(vec![("x", -1), ("z", 1)]);
        let mut concat = a.clone();
        concat.concat(b.clone());
        assert_eq!(pairs(&a.add(b)), pairs(&concat.merge_records()));
    }

    #[test]
    fn multiply_scales_and_drops() {
        let a = set(vec![("x", 2), ("y", -1)]);
        assert_eq!(pairs(&a.clone().multiply(3)), vec![("x", 6), ("y", -3)]);
        assert!(a.multiply(0).is_empty());
    }

    #[test]
    fn distinct_reduces_to_a_set() {
        let a = set(vec![("x", 3), ("y", -2), ("z", 1), ("z", 1)]);
        let d = a.distinct();
        assert!(d.is_set());
        assert_eq!(pairs(&d), vec![("x", 1), ("z", 1)]);
    }

    #[test]
    fn predicates() {
        assert!(set(vec![("a", 1)]).is_set());
        assert!(!set(vec![("a", 2)]).is_set());
        assert!(set(vec![("a", 2)]).is_positive());
        assert!(!set(vec![("a", -1)]).is_positive());
        assert!(!set(vec![("a", 1), ("a", 1)]).is_merged());
        assert!(!set(vec![("a", 0)]).is_merged());
    }
}
