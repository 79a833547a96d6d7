//! Left outer equi-join of two streams.

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::rc::Rc;

use fnv::FnvHashMap;

use crate::btree::BTree;
use crate::changeset::ChangeSet;
use crate::operators::join::matches_for;
use crate::row::{fingerprint, keyed_cmp, Keyed};
use crate::stream::{
    sink_handle, BinaryOperator, Each, IntoSourceHandle, LeftPort, RightPort, Sink, SinkHandle,
    SinkSlot, Source, SourceHandle,
};
use crate::{Comparator, Data, Result, Value};

/// Joins two streams on key equality, keeping unmatched left rows.
///
/// Output pairs are `(left, Some(right))` per match, or `(left, None)` while a left
/// row has no match. The operator tracks a match count per left row: when the last
/// matching right row departs the `(left, None)` pair is re-asserted, and when a
/// first match arrives it is retracted. Null promotion and demotion, incrementally.
pub struct LeftOuterJoin<L: Data, R: Data> {
    left_up: SourceHandle<L>,
    right_up: SourceHandle<R>,
    left_key: Box<dyn Fn(&L) -> Value>,
    right_key: Box<dyn Fn(&R) -> Value>,
    left_storage: BTree<Keyed<L>>,
    right_storage: BTree<Keyed<R>>,
    /// Matches currently held per left row, keyed by the row's serialization.
    match_counts: FnvHashMap<String, usize>,
    results: BTree<(L, Option<R>)>,
    sink: SinkSlot<(L, Option<R>)>,
    left_port: Option<Rc<LeftPort<Self>>>,
    right_port: Option<Rc<RightPort<Self>>>,
}

impl<L: Data, R: Data> LeftOuterJoin<L, R> {
    /// Attaches a left outer equi-join to the two upstreams.
    pub fn new(
        left: impl IntoSourceHandle<L>,
        right: impl IntoSourceHandle<R>,
        left_key: impl Fn(&L) -> Value + 'static,
        right_key: impl Fn(&R) -> Value + 'static,
        result_cmp: Comparator<(L, Option<R>)>,
    ) -> Result<Rc<RefCell<Self>>> {
        let left = left.into_handle();
        let right = right.into_handle();
        let op = Rc::new(RefCell::new(LeftOuterJoin {
            left_up: left.clone(),
            right_up: right.clone(),
            left_key: Box::new(left_key),
            right_key: Box::new(right_key),
            left_storage: BTree::new(keyed_cmp()),
            right_storage: BTree::new(keyed_cmp()),
            match_counts: FnvHashMap::default(),
            results: BTree::new(result_cmp),
            sink: SinkSlot::new("left outer join"),
            left_port: None,
            right_port: None,
        }));
        let left_port = LeftPort::new(&op);
        let right_port = RightPort::new(&op);
        left.borrow_mut().set_sink(sink_handle(&left_port))?;
        right.borrow_mut().set_sink(sink_handle(&right_port))?;
        {
            let mut core = op.borrow_mut();
            core.left_port = Some(left_port);
            core.right_port = Some(right_port);
        }
        Ok(op)
    }
}

impl<L: Data, R: Data> BinaryOperator for LeftOuterJoin<L, R> {
    type Left = L;
    type Right = R;
    type Out = (L, Option<R>);

    fn apply_left(&mut self, delta: ChangeSet<L>) -> ChangeSet<(L, Option<R>)> {
        let mut out = ChangeSet::zero();
        for (row, weight) in delta {
            let key = (self.left_key)(&row);
            let entry = Keyed::new(key.clone(), row.clone());
            let row_id = fingerprint(&row);
            if weight > 0 {
                self.left_storage.add(entry);
                let matches = matches_for(&self.right_storage, &key);
                if matches.is_empty() {
                    let pair = (row.clone(), None);
                    self.results.add(pair.clone());
                    out.append(pair, 1);
                    self.match_counts.insert(row_id, 0);
                } else {
                    self.match_counts.insert(row_id, matches.len());
                    for matched in matches {
                        let pair = (row.clone(), Some(matched));
                        self.results.add(pair.clone());
                        out.append(pair, 1);
                    }
                }
            } else if weight < 0 {
                self.left_storage.delete(&entry);
                let count = self.match_counts.remove(&row_id).unwrap_or(0);
                if count == 0 {
                    let pair = (row.clone(), None);
                    self.results.delete(&pair);
                    out.append(pair, -1);
                } else {
                    for matched in matches_for(&self.right_storage, &key) {
                        let pair = (row.clone(), Some(matched));
                        self.results.delete(&pair);
                        out.append(pair, -1);
                    }
                }
            }
        }
        out
    }

    fn apply_right(&mut self, delta: ChangeSet<R>) -> ChangeSet<(L, Option<R>)> {
        let mut out = ChangeSet::zero();
        for (row, weight) in delta {
            let key = (self.right_key)(&row);
            let entry = Keyed::new(key.clone(), row.clone());
            if weight > 0 {
                self.right_storage.add(entry);
                for left in matches_for(&self.left_storage, &key) {
                    let count = self
                        .match_counts
                        .entry(fingerprint(&left))
                        .or_insert(0);
                    if *count == 0 {
                        // First match: demote the null pairing.
                        let null_pair = (left.clone(), None);
                        self.results.delete(&null_pair);
                        out.append(null_pair, -1);
                    }
                    *count += 1;
                    let pair = (left, Some(row.clone()));
                    self.results.add(pair.clone());
                    out.append(pair, 1);
                }
            } else if weight < 0 {
                self.right_storage.delete(&entry);
                for left in matches_for(&self.left_storage, &key) {
                    let pair = (left.clone(), Some(row.clone()));
                    self.results.delete(&pair);
                    out.append(pair, -1);
                    let count = self
                        .match_counts
                        .entry(fingerprint(&left))
                        .or_insert(1);
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        // Last match gone: promote the null pairing back.
                        let null_pair = (left, None);
                        self.results.add(null_pair.clone());
                        out.append(null_pair, 1);
                    }
                }
            }
        }
        out
    }

    fn out_slot(&self) -> SinkSlot<(L, Option<R>)> {
        self.sink.clone()
    }
}

impl<L: Data, R: Data> Source<(L, Option<R>)> for LeftOuterJoin<L, R> {
    fn size(&self) -> usize {
        self.results.len()
    }

    fn set_sink(&mut self, sink: SinkHandle<(L, Option<R>)>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, (L, Option<R>)>) -> ControlFlow<()> {
        self.left_storage.clear();
        self.right_storage.clear();
        self.match_counts.clear();
        self.results.clear();

        let (left_up, right_up) = (self.left_up.clone(), self.right_up.clone());
        let LeftOuterJoin {
            left_key,
            right_key,
            left_storage,
            right_storage,
            match_counts,
            results,
            ..
        } = self;

        // The right side is the build side: every left row must appear in the
        // output, so the left side streams.
        let _ = right_up.borrow_mut().pull(&mut |row: &R, _| {
            right_storage.add(Keyed::new(right_key(row), row.clone()));
            ControlFlow::Continue(())
        });
        let _ = left_up.borrow_mut().pull(&mut |row: &L, _| {
            let key = left_key(row);
            left_storage.add(Keyed::new(key.clone(), row.clone()));
            let matches = matches_for(right_storage, &key);
            match_counts.insert(fingerprint(row), matches.len());
            if matches.is_empty() {
                results.add((row.clone(), None));
            } else {
                for matched in matches {
                    results.add((row.clone(), Some(matched)));
                }
            }
            ControlFlow::Continue(())
        });

        for pair in self.results.values() {
            each(pair, 1)?;
        }
        ControlFlow::Continue(())
    }

    fn disconnect(&mut self) {
        self.sink.clear();
        self.left_up.borrow_mut().disconnect();
        self.right_up.borrow_mut().disconnect();
    }
}
