//! The base source: an ordered in-memory table at the root of a dataflow graph.
//!
//! A [`Memory`] owns the canonical contents of a table in a primary-key-ordered
//! B+tree, plus any additional sort indexes its consumers request. Pipelines attach
//! through *connections* ([`Memory::connect`]): each connection is an independent
//! [`Source`] reading from one index, and every mutation fans the resulting
//! change-set out to all live connections before returning.

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::rc::{Rc, Weak};

use crate::btree::BTree;
use crate::changeset::ChangeSet;
use crate::row::{value_cmp, Record};
use crate::stream::{Each, SinkHandle, SinkSlot, Source, SourceHandle};
use crate::{Comparator, Error, Result};

/// A base table keyed by a primary-key column.
pub struct Memory<T: Record> {
    core: Rc<RefCell<MemoryCore<T>>>,
}

struct SortIndex<T> {
    name: String,
    tree: BTree<T>,
}

struct MemoryCore<T: Record> {
    pk: String,
    primary: BTree<T>,
    sorts: Vec<SortIndex<T>>,
    connections: Vec<Weak<RefCell<MemoryConnection<T>>>>,
}

/// Which index a connection reads from.
#[derive(Clone, Copy)]
enum IndexRef {
    Primary,
    Sort(usize),
}

impl<T: Record> Memory<T> {
    /// Builds a table over `initial` rows, keyed by the `pk` column.
    ///
    /// Fails with [`Error::DuplicateKey`] if two initial rows share a primary key.
    pub fn new(initial: Vec<T>, pk: impl Into<String>) -> Result<Self> {
        let pk = pk.into();
        let primary_cmp: Comparator<T> = {
            let pk = pk.clone();
            Rc::new(move |a: &T, b: &T| value_cmp(&a.column(&pk), &b.column(&pk)))
        };
        let mut primary = BTree::new(primary_cmp);
        for row in initial {
            if primary.has(&row) {
                return Err(Error::DuplicateKey(row.column(&pk).to_string()));
            }
            primary.add(row);
        }
        Ok(Memory {
            core: Rc::new(RefCell::new(MemoryCore {
                pk,
                primary,
                sorts: Vec::new(),
                connections: Vec::new(),
            })),
        })
    }

    /// The number of rows currently stored.
    pub fn len(&self) -> usize {
        self.core.borrow().primary.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Opens a connection reading rows in primary-key order.
    pub fn connect(&self) -> SourceHandle<T> {
        self.connection(IndexRef::Primary)
    }

    /// Opens a connection reading rows in the order of a named sort.
    ///
    /// The first connection for a given sort name builds the index from the primary
    /// tree; later connections share it. Subsequent mutations keep every built index
    /// current.
    pub fn connect_sorted(&self, name: impl Into<String>, cmp: Comparator<T>) -> SourceHandle<T> {
        let name = name.into();
        let slot = {
            let mut core = self.core.borrow_mut();
            match core.sorts.iter().position(|s| s.name == name) {
                Some(i) => i,
                None => {
                    let mut tree = BTree::new(cmp);
                    for row in core.primary.values() {
                        tree.add(row.clone());
                    }
                    core.sorts.push(SortIndex { name, tree });
                    core.sorts.len() - 1
                }
            }
        };
        self.connection(IndexRef::Sort(slot))
    }

    fn connection(&self, index: IndexRef) -> SourceHandle<T> {
        let conn = Rc::new(RefCell::new(MemoryConnection {
            core: self.core.clone(),
            index,
            sink: SinkSlot::new("memory connection"),
        }));
        self.core.borrow_mut().connections.push(Rc::downgrade(&conn));
        conn
    }

    /// Inserts a row.
    ///
    /// Fails with [`Error::DuplicateKey`] when a row with the same primary key
    /// exists. Emits `{(row, +1)}` to every connection before returning.
    pub fn add(&self, row: T) -> Result<()> {
        let delta = {
            let mut core = self.core.borrow_mut();
            if core.primary.has(&row) {
                return Err(Error::DuplicateKey(row.column(&core.pk).to_string()));
            }
            tracing::trace!(pk = %row.column(&core.pk), "memory add");
            core.primary.add(row.clone());
            for sort in &mut core.sorts {
                sort.tree.add(row.clone());
            }
            ChangeSet::from_updates(vec![(row, 1)])
        };
        self.fan_out(delta);
        Ok(())
    }

    /// Replaces the row sharing `probe`'s primary key with `patch(old)`.
    ///
    /// Fails with [`Error::MissingKey`] when no such row exists, and with
    /// [`Error::DuplicateKey`] when the patch moves the row onto another row's
    /// primary key. Emits `{(old, −1), (new, +1)}`.
    pub fn update(&self, probe: &T, patch: impl FnOnce(&T) -> T) -> Result<()> {
        let delta = {
            let mut core = self.core.borrow_mut();
            let old = core
                .primary
                .get(probe)
                .cloned()
                .ok_or_else(|| Error::MissingKey(probe.column(&core.pk).to_string()))?;
            let new = patch(&old);
            let pk_moved =
                value_cmp(&old.column(&core.pk), &new.column(&core.pk)) != std::cmp::Ordering::Equal;
            if pk_moved && core.primary.has(&new) {
                return Err(Error::DuplicateKey(new.column(&core.pk).to_string()));
            }
            tracing::trace!(pk = %old.column(&core.pk), "memory update");
            core.primary.delete(&old);
            core.primary.add(new.clone());
            for sort in &mut core.sorts {
                sort.tree.delete(&old);
                sort.tree.add(new.clone());
            }
            ChangeSet::from_updates(vec![(old, -1), (new, 1)])
        };
        self.fan_out(delta);
        Ok(())
    }

    /// Removes the row sharing `probe`'s primary key.
    ///
    /// Fails with [`Error::MissingKey`] when no such row exists. Emits
    /// `{(old, −1)}`.
    pub fn remove(&self, probe: &T) -> Result<()> {
        let delta = {
            let mut core = self.core.borrow_mut();
            let old = core
                .primary
                .get(probe)
                .cloned()
                .ok_or_else(|| Error::MissingKey(probe.column(&core.pk).to_string()))?;
            tracing::trace!(pk = %old.column(&core.pk), "memory remove");
            core.primary.delete(&old);
            for sort in &mut core.sorts {
                sort.tree.delete(&old);
            }
            ChangeSet::from_updates(vec![(old, -1)])
        };
        self.fan_out(delta);
        Ok(())
    }

    /// Delivers a delta to every live connection.
    ///
    /// The core's borrow is released first: the sinks run user and operator code,
    /// including pulls that re-enter this table's indexes (read-only).
    fn fan_out(&self, delta: ChangeSet<T>) {
        let slots: Vec<SinkSlot<T>> = {
            let mut core = self.core.borrow_mut();
            core.connections.retain(|conn| conn.strong_count() > 0);
            core.connections
                .iter()
                .filter_map(Weak::upgrade)
                .map(|conn| conn.borrow().sink.clone())
                .collect()
        };
        for slot in slots {
            slot.push(delta.clone());
        }
    }
}

/// One attachment point of a [`Memory`]: a [`Source`] reading from one index.
pub struct MemoryConnection<T: Record> {
    core: Rc<RefCell<MemoryCore<T>>>,
    index: IndexRef,
    sink: SinkSlot<T>,
}

impl<T: Record> Source<T> for MemoryConnection<T> {
    fn size(&self) -> usize {
        self.core.borrow().primary.len()
    }

    fn set_sink(&mut self, sink: SinkHandle<T>) -> Result<()> {
        self.sink.set(sink)
    }

    fn pull(&mut self, each: &mut Each<'_, T>) -> ControlFlow<()> {
        let core = self.core.borrow();
        let tree = match self.index {
            IndexRef::Primary => &core.primary,
            IndexRef::Sort(i) => &core.sorts[i].tree,
        };
        for row in tree.values() {
            each(row, 1)?;
        }
        ControlFlow::Continue(())
    }

    fn disconnect(&mut self) {
        self.sink.clear();
    }
}
