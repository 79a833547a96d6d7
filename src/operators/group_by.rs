//! Partition the stream into groups by the values of named columns.

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::rc::Rc;

use fnv::FnvHashMap;
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};

use crate::btree::BTree;
use crate::changeset::ChangeSet;
use crate::row::{fingerprint, value_cmp, OwnedRow, Record};
use crate::stream::{
    sink_handle, Each, IntoSourceHandle, Sink, SinkHandle, SinkSlot, Source, SourceHandle,
};
use crate::{Comparator, Data, Result, Value};

/// One group: the grouping columns, their shared values, and the member rows.
///
/// The inner `rows` tree is copy-on-write, so a cloned `GroupedRow` is an immutable
/// snapshot of the group at the moment of cloning while remaining cheap to produce;
/// the per-group aggregations read it directly.
#[derive(Clone, Debug)]
pub struct GroupedRow<T: Data> {
    /// The grouping column names.
    pub keys: Rc<[String]>,
    /// The values of the grouping columns shared by every member row.
    pub key_values: OwnedRow,
    /// The member rows, ordered by the operator's row comparator.
    pub rows: BTree<T>,
}

impl<T: Data> GroupedRow<T> {
    /// The group key as a tuple of column values, in grouping-column order.
    pub fn key_tuple(&self) -> Value {
        Value::Array(self.keys.iter().map(|k| self.key_values.column(k)).collect())
    }
}

impl<T: Data> Record for GroupedRow<T> {
    fn column(&self, name: &str) -> Value {
        self.key_values.column(name)
    }
}

impl<T: Data> Serialize for GroupedRow<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        struct Rows<'a, T>(&'a BTree<T>);
        impl<T: Serialize + Clone> Serialize for Rows<'_, T> {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
                for row in self.0.values() {
                    seq.serialize_element(row)?;
                }
                seq.end()
            }
        }
        let mut s = serializer.serialize_struct("GroupedRow", 3)?;
        s.serialize_field("keys", &*self.keys)?;
        s.serialize_field("key_values", &self.key_values)?;
        s.serialize_field("rows", &Rows(&self.rows))?;
        s.end()
    }
}

/// Maintains one [`GroupedRow`] per distinct combination of grouping-column values.
///
/// On every change the affected groups re-emit: a retraction of the old group value
/// (with an empty `rows` sentinel) followed, while the group survives, by an
/// assertion of the new value. Groups whose last row departs are dropped. `row_cmp`
/// orders each group's inner tree and must distinguish distinct rows (a primary-key
/// tie-breaker suffices).
pub struct GroupBy<T: Record> {
    upstream: SourceHandle<T>,
    keys: Rc<[String]>,
    row_cmp: Comparator<T>,
    groups: BTree<GroupedRow<T>>,
    sink: SinkSlot<GroupedRow<T>>,
}

impl<T: Record> GroupBy<T> {
    /// Attaches a group-by over the named columns to `upstream`.
    pub fn new(
        upstream: impl IntoSourceHandle<T>,
        key_columns: &[&str],
        row_cmp: Comparator<T>,
    ) -> Result<Rc<RefCell<Self>>> {
        let upstream = upstream.into_handle();
        let keys: Rc<[String]> = key_columns.iter().map(|k| k.to_string()).collect();
        let group_cmp: Comparator<GroupedRow<T>> = {
            let keys = keys.clone();
            Rc::new(move |a: &GroupedRow<T>, b: &GroupedRow<T>| {
                for key in keys.iter() {
                    match value_cmp(&a.key_values.column(key), &b.key_values.column(key)) {
                        std::cmp::Ordering::Equal => continue,
                        unequal => return unequal,
                    }
                }
                std::cmp::Ordering::Equal
            })
        };
        let op = Rc::new(RefCell::new(GroupBy {
            upstream: upstream.clone(),
            keys,
            row_cmp,
            groups: BTree::new(group_cmp),
            sink: SinkSlot::new("group by"),
        }));
        upstream.borrow_mut().set_sink(sink_handle(&op))?;
        Ok(op)
    }

    fn key_values(&self, row: &T) -> OwnedRow {
        self.keys
            .iter()
            .map(|key| (key.clone(), row.column(key)))
            .collect()
    }

    fn sentinel(&self, key_values: OwnedRow) -> GroupedRow<T> {
        GroupedRow {
            keys: self.keys.clone(),
            key_values,
            rows: BTree::new(self.row_cmp.clone()),
        }
    }

    fn apply(&mut self, delta: ChangeSet<T>) -> ChangeSet<GroupedRow<T>> {
        let delta = delta.merge_records();

        // Affected groups, in first-touch order, with whether they existed before.
        let mut touched: Vec<(OwnedRow, bool)> = Vec::new();
        let mut seen: FnvHashMap<String, ()> = FnvHashMap::default();

        for (row, weight) in delta {
            let key_values = self.key_values(&row);
            let probe = self.sentinel(key_values.clone());
            if seen.insert(fingerprint(&key_values), ()).is_none() {
                touched.push((key_values, self.groups.has(&probe)));
            }
            let mut group = match self.groups.get(&probe) {
                Some(group) => group.clone(),
                None => probe.clone(),
            };
            if weight > 0 {
                group.rows.add(row);
            } else if weight < 0 {
                group.rows.delete(&row);
            }
            if group.rows.is_empty() {
                self.groups.delete(&probe);
            } else {
                self.groups.add(group);
            }
        }

        let mut out = ChangeSet::zero();
        for (key_values, existed) in touched {
            let probe = self.sentinel(key_values);
            let now = self.groups.get(&probe).cloned();
            if existed {
                // The retraction carries an empty-rows sentinel; downstream
                // consumers identify the group by its key values.
                out.append(probe, -1);
            }
            if let Some(group) = now {
                out.append(group, 1);
            }
        }
        out
    }
}

impl<T: Record> Sink<T> for RefCell<GroupBy<T>> {
    fn push(&self, delta: ChangeSet<T>) {
        let (out, slot) = {
            let mut op = self.borrow_mut();
            (op.apply(delta), op.sink.clone())
        };
        slot.push(out);
    }
}

impl<T: Record> Source<GroupedRow<T>> for GroupBy<T> {
    fn size(&self) -> usize {
        self.groups.len()
    }

    fn set_sink(&mut self, sink: SinkHandle<GroupedRow<T>>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, GroupedRow<T>>) -> ControlFlow<()> {
        self.groups.clear();
        let upstream = self.upstream.clone();
        let mut rows: Vec<T> = Vec::new();
        let _ = upstream.borrow_mut().pull(&mut |row, _| {
            rows.push(row.clone());
            ControlFlow::Continue(())
        });
        for row in rows {
            let probe = self.sentinel(self.key_values(&row));
            let mut group = match self.groups.get(&probe) {
                Some(group) => group.clone(),
                None => probe,
            };
            group.rows.add(row);
            self.groups.add(group);
        }
        for group in self.groups.values() {
            each(group, 1)?;
        }
        ControlFlow::Continue(())
    }

    fn disconnect(&mut self) {
        self.sink.clear();
        self.upstream.borrow_mut().disconnect();
    }
}
