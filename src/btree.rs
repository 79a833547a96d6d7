//! An ordered, copy-on-write B+tree keyed by a caller-supplied total order.
//!
//! The tree stores each key exactly once: inserting a key equal (under the
//! comparator) to an existing one replaces it. Cloning a tree is O(1): clones share
//! nodes, and a mutation clones only the nodes on its root-to-leaf path, leaving the
//! rest shared (the node's reference count plays the role of a `shared` flag). This
//! is what makes group snapshots and per-connection indexes cheap.
//!
//! Iteration is lazy in both directions and can be seeded at an arbitrary probe, or
//! at a position described by a caller function for composite-keyed trees (see
//! [`BTree::values_from_by`]).

use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::Comparator;

/// Maximum number of keys in a leaf, and of children in an internal node.
const MAX_KEYS: usize = 32;
/// Below this occupancy a node tries to merge with a sibling.
const MIN_KEYS: usize = MAX_KEYS / 2;

#[derive(Clone)]
enum Node<T> {
    Leaf {
        keys: Vec<T>,
    },
    Internal {
        /// `maxes[i]` is the greatest key in `children[i]` and routes searches:
        /// every key of `children[i]` is ≤ `maxes[i]`.
        maxes: Vec<T>,
        children: Vec<Rc<Node<T>>>,
    },
}

impl<T> Node<T> {
    fn empty_leaf() -> Rc<Node<T>> {
        Rc::new(Node::Leaf { keys: Vec::new() })
    }

    /// Entries in this node: keys for a leaf, children for an internal node.
    fn width(&self) -> usize {
        match self {
            Node::Leaf { keys } => keys.len(),
            Node::Internal { children, .. } => children.len(),
        }
    }

    fn max_key(&self) -> Option<&T> {
        match self {
            Node::Leaf { keys } => keys.last(),
            Node::Internal { maxes, .. } => maxes.last(),
        }
    }
}

enum Placed<T> {
    /// The key replaced an equal key; the element count is unchanged.
    Replaced,
    /// The key was inserted without splitting this node.
    Added,
    /// The node split; the detached right sibling. The key was inserted.
    Split(Rc<Node<T>>),
}

/// An ordered, de-duplicated container under a caller-supplied total order.
pub struct BTree<T> {
    root: Rc<Node<T>>,
    cmp: Comparator<T>,
    len: usize,
}

impl<T> Clone for BTree<T> {
    fn clone(&self) -> Self {
        BTree {
            root: self.root.clone(),
            cmp: self.cmp.clone(),
            len: self.len,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for BTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.values()).finish()
    }
}

impl<T> BTree<T> {
    /// An empty tree ordered by `cmp`.
    pub fn new(cmp: Comparator<T>) -> Self {
        BTree {
            root: Node::empty_leaf(),
            cmp,
            len: 0,
        }
    }

    /// The number of stored keys.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the tree stores no keys.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The comparator governing this tree.
    pub fn comparator(&self) -> &Comparator<T> {
        &self.cmp
    }

    /// Empties the tree.
    pub fn clear(&mut self) {
        self.root = Node::empty_leaf();
        self.len = 0;
    }

    /// The stored key equal to `probe` under the comparator, if any.
    pub fn get(&self, probe: &T) -> Option<&T> {
        let mut node = &*self.root;
        loop {
            match node {
                Node::Leaf { keys } => {
                    return match keys.binary_search_by(|k| (self.cmp)(k, probe)) {
                        Ok(i) => Some(&keys[i]),
                        Err(_) => None,
                    };
                }
                Node::Internal { maxes, children } => {
                    let i = match maxes.binary_search_by(|k| (self.cmp)(k, probe)) {
                        Ok(i) | Err(i) => i,
                    };
                    if i == children.len() {
                        return None;
                    }
                    node = &children[i];
                }
            }
        }
    }

    /// Whether a key equal to `probe` is stored.
    pub fn has(&self, probe: &T) -> bool {
        self.get(probe).is_some()
    }

    /// The least key.
    pub fn first(&self) -> Option<&T> {
        let mut node = &*self.root;
        loop {
            match node {
                Node::Leaf { keys } => return keys.first(),
                Node::Internal { children, .. } => node = children.first()?,
            }
        }
    }

    /// The greatest key.
    pub fn last(&self) -> Option<&T> {
        let mut node = &*self.root;
        loop {
            match node {
                Node::Leaf { keys } => return keys.last(),
                Node::Internal { children, .. } => node = children.last()?,
            }
        }
    }

    /// Inserts `key`, replacing any stored key equal to it under the comparator.
    ///
    /// The tree takes ownership of the value. Nodes shared with clones of this tree
    /// are copied before mutation.
    pub fn add(&mut self, key: T)
    where
        T: Clone,
    {
        let cmp = self.cmp.clone();
        let root = Rc::make_mut(&mut self.root);
        match Self::insert_node(root, key, &cmp) {
            Placed::Replaced => {}
            Placed::Added => self.len += 1,
            Placed::Split(right) => {
                self.len += 1;
                let left = std::mem::replace(&mut self.root, Node::empty_leaf());
                let left_max = left.max_key().expect("split node is non-empty").clone();
                let right_max = right.max_key().expect("split node is non-empty").clone();
                self.root = Rc::new(Node::Internal {
                    maxes: vec![left_max, right_max],
                    children: vec![left, right],
                });
            }
        }
    }

    fn insert_node(node: &mut Node<T>, key: T, cmp: &Comparator<T>) -> Placed<T>
    where
        T: Clone,
    {
        match node {
            Node::Leaf { keys } => match keys.binary_search_by(|k| cmp(k, &key)) {
                Ok(i) => {
                    keys[i] = key;
                    Placed::Replaced
                }
                Err(i) => {
                    keys.insert(i, key);
                    if keys.len() > MAX_KEYS {
                        let right = keys.split_off(keys.len() / 2);
                        Placed::Split(Rc::new(Node::Leaf { keys: right }))
                    } else {
                        Placed::Added
                    }
                }
            },
            Node::Internal { maxes, children } => {
                let i = match maxes.binary_search_by(|k| cmp(k, &key)) {
                    Ok(i) | Err(i) => i,
                };
                // A key greater than every routing key goes into the last child.
                let i = i.min(children.len() - 1);
                let child = Rc::make_mut(&mut children[i]);
                let placed = Self::insert_node(child, key, cmp);
                maxes[i] = child.max_key().expect("child is non-empty").clone();
                if let Placed::Split(right) = placed {
                    let right_max = right.max_key().expect("split node is non-empty").clone();
                    children.insert(i + 1, right);
                    maxes.insert(i + 1, right_max);
                    if children.len() > MAX_KEYS {
                        let at = children.len() / 2;
                        let right_children = children.split_off(at);
                        let right_maxes = maxes.split_off(at);
                        return Placed::Split(Rc::new(Node::Internal {
                            maxes: right_maxes,
                            children: right_children,
                        }));
                    }
                    return Placed::Added;
                }
                placed
            }
        }
    }

    /// Removes the stored key equal to `probe`, returning whether one was removed.
    pub fn delete(&mut self, probe: &T) -> bool
    where
        T: Clone,
    {
        if !self.has(probe) {
            return false;
        }
        let cmp = self.cmp.clone();
        let root = Rc::make_mut(&mut self.root);
        let removed = Self::remove_node(root, probe, &cmp);
        debug_assert!(removed, "probe located before removal");
        self.len -= 1;
        // The root degenerates to its only child while it is internal and unary.
        loop {
            let lone_child = match &*self.root {
                Node::Internal { children, .. } if children.len() == 1 => children[0].clone(),
                _ => break,
            };
            self.root = lone_child;
        }
        true
    }

    fn remove_node(node: &mut Node<T>, probe: &T, cmp: &Comparator<T>) -> bool
    where
        T: Clone,
    {
        match node {
            Node::Leaf { keys } => match keys.binary_search_by(|k| cmp(k, probe)) {
                Ok(i) => {
                    keys.remove(i);
                    true
                }
                Err(_) => false,
            },
            Node::Internal { maxes, children } => {
                let i = match maxes.binary_search_by(|k| cmp(k, probe)) {
                    Ok(i) | Err(i) => i,
                };
                if i == children.len() {
                    return false;
                }
                let child = Rc::make_mut(&mut children[i]);
                if !Self::remove_node(child, probe, cmp) {
                    return false;
                }
                if let Some(max) = child.max_key() {
                    maxes[i] = max.clone();
                }
                Self::rebalance(maxes, children, i);
                true
            }
        }
    }

    /// Merges `children[i]` with an adjacent sibling when it has dropped below half
    /// capacity and the combination fits in one node.
    fn rebalance(maxes: &mut Vec<T>, children: &mut Vec<Rc<Node<T>>>, i: usize)
    where
        T: Clone,
    {
        if children[i].width() >= MIN_KEYS {
            return;
        }
        let j = if i + 1 < children.len() {
            i + 1
        } else if i > 0 {
            i - 1
        } else {
            return;
        };
        let (l, r) = (i.min(j), i.max(j));
        if children[l].width() + children[r].width() > MAX_KEYS {
            return;
        }
        let right = children.remove(r);
        maxes.remove(r);
        let right = Rc::try_unwrap(right).unwrap_or_else(|shared| (*shared).clone());
        let left = Rc::make_mut(&mut children[l]);
        match (left, right) {
            (Node::Leaf { keys }, Node::Leaf { keys: mut right_keys }) => {
                keys.append(&mut right_keys);
            }
            (
                Node::Internal { maxes: lm, children: lc },
                Node::Internal { maxes: mut rm, children: mut rc },
            ) => {
                lm.append(&mut rm);
                lc.append(&mut rc);
            }
            _ => unreachable!("siblings at one depth share a kind"),
        }
        maxes[l] = children[l]
            .max_key()
            .expect("merged node is non-empty")
            .clone();
    }

    /// Lazy ascending iteration over all keys.
    pub fn values(&self) -> Values<'_, T> {
        Values {
            stack: SmallVec::from_iter([(&*self.root, 0)]),
        }
    }

    /// Lazy ascending iteration starting at the first key ≥ `probe`
    /// (> `probe` when not inclusive).
    pub fn values_from(&self, probe: &T, inclusive: bool) -> Values<'_, T> {
        self.seek_forward(&|x| (self.cmp)(x, probe), inclusive)
    }

    /// Lazy ascending iteration seeded by a positioning function.
    ///
    /// `pos` must be monotone with respect to the tree order: `Less` for keys before
    /// the sought position, `Equal` at it, `Greater` after it. Iteration starts at
    /// the first key whose position is not `Less`, or strictly after it when
    /// `inclusive` is false. Composite-keyed trees use this to
    /// seek by key prefix.
    pub fn values_from_by<'a>(
        &'a self,
        pos: &dyn Fn(&T) -> Ordering,
        inclusive: bool,
    ) -> Values<'a, T> {
        self.seek_forward(pos, inclusive)
    }

    /// Lazy descending iteration over all keys.
    pub fn values_reversed(&self) -> ValuesReversed<'_, T> {
        let width = self.root.width();
        ValuesReversed {
            stack: SmallVec::from_iter([(&*self.root, width)]),
        }
    }

    /// Lazy descending iteration starting at the last key ≤ `probe`
    /// (< `probe` when not inclusive).
    pub fn values_from_reversed(&self, probe: &T, inclusive: bool) -> ValuesReversed<'_, T> {
        self.seek_backward(&|x| (self.cmp)(x, probe), inclusive)
    }

    fn seek_forward<'a>(
        &'a self,
        pos: &dyn Fn(&T) -> Ordering,
        inclusive: bool,
    ) -> Values<'a, T> {
        let before = |x: &T| match pos(x) {
            Ordering::Less => true,
            Ordering::Equal => !inclusive,
            Ordering::Greater => false,
        };
        let mut stack = SmallVec::new();
        let mut node = &*self.root;
        loop {
            match node {
                Node::Leaf { keys } => {
                    let idx = keys.partition_point(|x| before(x));
                    stack.push((node, idx));
                    return Values { stack };
                }
                Node::Internal { maxes, children } => {
                    let idx = maxes.partition_point(|x| before(x));
                    if idx == children.len() {
                        return Values { stack: SmallVec::new() };
                    }
                    stack.push((node, idx + 1));
                    node = &children[idx];
                }
            }
        }
    }

    fn seek_backward<'a>(
        &'a self,
        pos: &dyn Fn(&T) -> Ordering,
        inclusive: bool,
    ) -> ValuesReversed<'a, T> {
        let wanted = |x: &T| match pos(x) {
            Ordering::Less => true,
            Ordering::Equal => inclusive,
            Ordering::Greater => false,
        };
        let mut stack = SmallVec::new();
        let mut node = &*self.root;
        loop {
            match node {
                Node::Leaf { keys } => {
                    let count = keys.partition_point(|x| wanted(x));
                    stack.push((node, count));
                    return ValuesReversed { stack };
                }
                Node::Internal { maxes, children } => {
                    // The boundary child: the first whose max is not below the
                    // sought position, or the last child when all are below.
                    let idx = maxes
                        .partition_point(|x| pos(x) == Ordering::Less)
                        .min(children.len() - 1);
                    stack.push((node, idx));
                    node = &children[idx];
                }
            }
        }
    }
}

/// Ascending iterator; a stack of `(node, next index)` frames down to the current
/// leaf, advanced across leaf boundaries through the stack.
pub struct Values<'a, T> {
    stack: SmallVec<[(&'a Node<T>, usize); 8]>,
}

impl<'a, T> Iterator for Values<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        loop {
            let (node, idx) = match self.stack.last() {
                Some(&(node, idx)) => (node, idx),
                None => return None,
            };
            match node {
                Node::Leaf { keys } => {
                    if idx < keys.len() {
                        self.stack.last_mut().expect("non-empty stack").1 = idx + 1;
                        return Some(&keys[idx]);
                    }
                    self.stack.pop();
                }
                Node::Internal { children, .. } => {
                    if idx < children.len() {
                        self.stack.last_mut().expect("non-empty stack").1 = idx + 1;
                        self.stack.push((&children[idx], 0));
                    } else {
                        self.stack.pop();
                    }
                }
            }
        }
    }
}

/// Descending iterator; frames hold the number of entries still to visit.
pub struct ValuesReversed<'a, T> {
    stack: SmallVec<[(&'a Node<T>, usize); 8]>,
}

impl<'a, T> Iterator for ValuesReversed<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        loop {
            let (node, remaining) = match self.stack.last() {
                Some(&(node, remaining)) => (node, remaining),
                None => return None,
            };
            match node {
                Node::Leaf { keys } => {
                    if remaining > 0 {
                        self.stack.last_mut().expect("non-empty stack").1 = remaining - 1;
                        return Some(&keys[remaining - 1]);
                    }
                    self.stack.pop();
                }
                Node::Internal { children, .. } => {
                    if remaining > 0 {
                        self.stack.last_mut().expect("non-empty stack").1 = remaining - 1;
                        let child = &children[remaining - 1];
                        self.stack.push((child, child.width()));
                    } else {
                        self.stack.pop();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    fn int_tree() -> BTree<i64> {
        BTree::new(Rc::new(|a: &i64, b: &i64| a.cmp(b)))
    }

    /// Checks structural invariants: per-node occupancy and strict ordering, routing
    /// keys equal to child maxima, uniform depth.
    fn validate(tree: &BTree<i64>) {
        fn check(node: &Node<i64>) -> usize {
            match node {
                Node::Leaf { keys } => {
                    assert!(keys.len() <= MAX_KEYS);
                    assert!(keys.windows(2).all(|w| w[0] < w[1]), "leaf keys sorted");
                    1
                }
                Node::Internal { maxes, children } => {
                    assert_eq!(maxes.len(), children.len());
                    assert!(children.len() <= MAX_KEYS);
                    // Merge-when-fits occupancy is relaxed: a node below half
                    // capacity is legal whenever its sibling is too full to absorb
                    // it, so only emptiness is ruled out here.
                    assert!(!children.is_empty());
                    assert!(maxes.windows(2).all(|w| w[0] < w[1]), "routing keys sorted");
                    let mut depth = None;
                    for (max, child) in maxes.iter().zip(children) {
                        assert_eq!(child.max_key(), Some(max), "routing key is child max");
                        let d = check(child);
                        assert_eq!(*depth.get_or_insert(d), d, "uniform depth");
                    }
                    depth.unwrap() + 1
                }
            }
        }
        check(&tree.root);
        assert_eq!(tree.values().count(), tree.len());
    }

    #[test]
    fn add_get_delete_roundtrip() {
        let mut tree = int_tree();
        for i in 0..200 {
            tree.add(i * 3);
        }
        assert_eq!(tree.len(), 200);
        assert_eq!(tree.get(&30), Some(&30));
        assert_eq!(tree.get(&31), None);
        assert!(tree.delete(&30));
        assert!(!tree.delete(&30));
        assert_eq!(tree.len(), 199);
        validate(&tree);
    }

    #[test]
    fn equal_key_replaces() {
        let by_first: Comparator<(i64, i64)> = Rc::new(|a: &(i64, i64), b: &(i64, i64)| a.0.cmp(&b.0));
        let mut tree = BTree::new(by_first);
        tree.add((1, 10));
        tree.add((1, 20));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(&(1, 0)), Some(&(1, 20)));
    }

    #[test]
    fn iteration_is_ordered_both_ways() {
        let mut tree = int_tree();
        for i in (0..500).rev() {
            tree.add(i);
        }
        let ascending: Vec<i64> = tree.values().copied().collect();
        assert_eq!(ascending, (0..500).collect::<Vec<_>>());
        let descending: Vec<i64> = tree.values_reversed().copied().collect();
        assert_eq!(descending, (0..500).rev().collect::<Vec<_>>());
    }

    #[test]
    fn seeded_iteration() {
        let mut tree = int_tree();
        for i in 0..100 {
            tree.add(i * 2);
        }
        let from_50: Vec<i64> = tree.values_from(&50, true).copied().collect();
        assert_eq!(from_50.first(), Some(&50));
        assert_eq!(from_50.len(), 75);
        let after_50: Vec<i64> = tree.values_from(&50, false).copied().collect();
        assert_eq!(after_50.first(), Some(&52));
        // Probes between stored keys land on the next key in direction of travel.
        let from_51: Vec<i64> = tree.values_from(&51, true).copied().collect();
        assert_eq!(from_51.first(), Some(&52));
        let down_from_51: Vec<i64> = tree.values_from_reversed(&51, true).copied().collect();
        assert_eq!(down_from_51.first(), Some(&50));
        let down_from_50: Vec<i64> = tree.values_from_reversed(&50, false).copied().collect();
        assert_eq!(down_from_50.first(), Some(&48));
        // Probes outside the key range.
        assert_eq!(tree.values_from(&1000, true).next(), None);
        assert_eq!(tree.values_from_reversed(&-1, true).next(), None);
        assert_eq!(tree.values_from(&-1, true).count(), 100);
        assert_eq!(tree.values_from_reversed(&1000, true).count(), 100);
    }

    #[test]
    fn iteration_is_lazy() {
        let mut tree = int_tree();
        for i in 0..1000 {
            tree.add(i);
        }
        // Taking a few items must not walk the whole tree; this is a smoke test that
        // the iterator yields incrementally from a seeded position.
        let three: Vec<i64> = tree.values_from(&997, true).take(5).copied().collect();
        assert_eq!(three, vec![997, 998, 999]);
    }

    #[test]
    fn clones_are_isolated() {
        let mut tree = int_tree();
        for i in 0..300 {
            tree.add(i);
        }
        let snapshot = tree.clone();
        for i in 0..150 {
            assert!(tree.delete(&i));
        }
        tree.add(1000);
        assert_eq!(snapshot.len(), 300);
        assert_eq!(snapshot.values().count(), 300);
        assert!(snapshot.has(&0));
        assert!(!snapshot.has(&1000));
        assert_eq!(tree.len(), 151);
        validate(&tree);
        validate(&snapshot);
    }

    #[test]
    fn randomized_against_reference() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut tree = int_tree();
        let mut reference = BTreeSet::new();
        for _ in 0..5000 {
            let key = rng.gen_range(0..600);
            if rng.gen_bool(0.6) {
                tree.add(key);
                reference.insert(key);
            } else {
                assert_eq!(tree.delete(&key), reference.remove(&key));
            }
        }
        assert_eq!(tree.len(), reference.len());
        let got = tree.values().copied().collect_vec();
        let want = reference.iter().copied().collect_vec();
        assert_eq!(got, want);
        validate(&tree);

        // Drain to empty, exercising merges and root collapse throughout.
        for key in want {
            assert!(tree.delete(&key));
        }
        assert!(tree.is_empty());
        assert_eq!(tree.first(), None);
        validate(&tree);
    }

    #[test]
    fn clear_resets() {
        let mut tree = int_tree();
        for i in 0..100 {
            tree.add(i);
        }
        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.values().next(), None);
        tree.add(7);
        assert_eq!(tree.first(), Some(&7));
    }
}
