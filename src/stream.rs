//! The push/pull contract connecting sources, operators, and sinks.
//!
//! A [`Source`] emits change-sets to at most one attached [`Sink`] (fan-out goes
//! through [`SplitStream`](crate::split::SplitStream) branches) and can materialize
//! its current contents through a lazy, early-terminable pull. An operator is both: a
//! `Sink` for its upstream's deltas and a `Source` for its own.
//!
//! Pipelines are graphs of `Rc<RefCell<…>>` nodes. A downstream node owns a strong
//! handle to its upstream; the upstream's sink slot holds only a [`Weak`] handle
//! downstream, so ownership flows from views towards base sources and dropping a
//! view quiesces its pipeline. `Sink::push` takes `&self`: implementations live on
//! the `RefCell` wrapper, compute their output under their own borrow, and *release
//! that borrow before invoking their sink*. The discipline matters: an operator
//! downstream may lawfully pull its upstream while a push is in flight (top-k
//! refill), and that pull must not find any node still borrowed.

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::rc::{Rc, Weak};

use crate::changeset::ChangeSet;
use crate::{Error, Result, Weight};

/// The consumer side of a pull: receives `(record, +1)` pairs in the source's
/// natural order and steers the scan with [`ControlFlow`].
///
/// Returning `ControlFlow::Break(())` terminates the scan; sources must honor it.
pub type Each<'a, T> = dyn FnMut(&T, Weight) -> ControlFlow<()> + 'a;

/// A producer of change-sets that can also materialize its current contents.
pub trait Source<T> {
    /// Best-effort current cardinality, for diagnostics and build-side selection.
    fn size(&self) -> usize;

    /// Attaches the sink receiving this source's deltas.
    ///
    /// A source feeds exactly one sink; a second attachment fails with
    /// [`Error::SinkAlreadySet`].
    fn set_sink(&mut self, sink: SinkHandle<T>) -> Result<()>;

    /// Cold-reads the source's current contents.
    ///
    /// Yields `(record, +1)` pairs to `each` in the source's natural order, stopping
    /// early when `each` breaks. The returned flow is the consumer's: `Break` if and
    /// only if `each` broke. For stateful operators a pull is a pure reconstruction
    /// from upstream: internal state is cleared and rebuilt, and any partial
    /// push-built state accumulated beforehand is discarded.
    fn pull(&mut self, each: &mut Each<'_, T>) -> ControlFlow<()>;

    /// Detaches the sink and releases upstream resources; idempotent.
    fn disconnect(&mut self);
}

/// A consumer of change-sets. `push` is synchronous: it returns only after all
/// transitively attached sinks have been brought up to date.
pub trait Sink<T> {
    /// Accepts a delta of the upstream's contents.
    fn push(&self, delta: ChangeSet<T>);
}

/// A shared handle to a source, as stored by its downstream operator.
pub type SourceHandle<T> = Rc<RefCell<dyn Source<T>>>;

/// Conversion into a [`SourceHandle`], accepted by every operator constructor.
///
/// Implemented by source handles themselves and by the `Rc<RefCell<…>>` cells the
/// operator constructors return, so operators chain without explicit handle
/// conversions at the call site.
pub trait IntoSourceHandle<T> {
    /// Converts into a shared source handle.
    fn into_handle(self) -> SourceHandle<T>;
}

impl<T> IntoSourceHandle<T> for SourceHandle<T> {
    fn into_handle(self) -> SourceHandle<T> {
        self
    }
}

impl<T, S: Source<T> + 'static> IntoSourceHandle<T> for Rc<RefCell<S>> {
    fn into_handle(self) -> SourceHandle<T> {
        self
    }
}

/// A non-owning handle to a sink, as stored in a source's sink slot.
pub type SinkHandle<T> = Weak<dyn Sink<T>>;

/// Builds the sink handle for an operator cell.
pub fn sink_handle<T, S>(op: &Rc<S>) -> SinkHandle<T>
where
    S: Sink<T> + 'static,
{
    let strong: Rc<dyn Sink<T>> = op.clone();
    Rc::downgrade(&strong)
}

/// A source's single sink attachment point.
///
/// The unset state stands in for the original's null-sink sentinel: pushes into an
/// unset (or dropped) slot are silently discarded, as are empty change-sets.
pub struct SinkSlot<T> {
    sink: Option<SinkHandle<T>>,
    /// Name of the owning operator, for error reporting.
    owner: &'static str,
}

impl<T> SinkSlot<T> {
    /// An empty slot owned by the named operator.
    pub fn new(owner: &'static str) -> Self {
        SinkSlot { sink: None, owner }
    }

    /// Attaches a sink; fails if one is already attached.
    pub fn set(&mut self, sink: SinkHandle<T>) -> Result<()> {
        if self.sink.is_some() {
            return Err(Error::SinkAlreadySet(self.owner));
        }
        self.sink = Some(sink);
        Ok(())
    }

    /// Detaches the sink, if any.
    pub fn clear(&mut self) {
        self.sink = None;
    }

    /// Whether a sink is attached (it may still have been dropped).
    pub fn is_set(&self) -> bool {
        self.sink.is_some()
    }

    /// Forwards a delta to the attached sink.
    ///
    /// Empty deltas are suppressed (a no-op push must not reach downstream), and a
    /// detached or dropped sink swallows the delta.
    pub fn push(&self, delta: ChangeSet<T>) {
        if delta.is_empty() {
            return;
        }
        if let Some(sink) = self.sink.as_ref().and_then(Weak::upgrade) {
            sink.push(delta);
        }
    }
}

impl<T> Clone for SinkSlot<T> {
    fn clone(&self) -> Self {
        SinkSlot {
            sink: self.sink.clone(),
            owner: self.owner,
        }
    }
}

/// An operator fed by two upstreams of possibly different record types.
///
/// Joins and combines implement this; their upstreams attach to lightweight port
/// sinks ([`LeftPort`], [`RightPort`]) that route into the shared core. Ports hold
/// the core weakly (the core owns its ports, not the reverse) so the graph stays
/// acyclic.
pub(crate) trait BinaryOperator {
    type Left;
    type Right;
    type Out;

    /// Absorbs a delta from the left upstream, returning the output delta.
    fn apply_left(&mut self, delta: ChangeSet<Self::Left>) -> ChangeSet<Self::Out>;
    /// Absorbs a delta from the right upstream, returning the output delta.
    fn apply_right(&mut self, delta: ChangeSet<Self::Right>) -> ChangeSet<Self::Out>;
    /// The operator's downstream slot.
    fn out_slot(&self) -> SinkSlot<Self::Out>;
}

pub(crate) struct LeftPort<C> {
    core: Weak<RefCell<C>>,
}

pub(crate) struct RightPort<C> {
    core: Weak<RefCell<C>>,
}

impl<C> LeftPort<C> {
    pub fn new(core: &Rc<RefCell<C>>) -> Rc<Self> {
        Rc::new(LeftPort { core: Rc::downgrade(core) })
    }
}

impl<C> RightPort<C> {
    pub fn new(core: &Rc<RefCell<C>>) -> Rc<Self> {
        Rc::new(RightPort { core: Rc::downgrade(core) })
    }
}

impl<C: BinaryOperator> Sink<C::Left> for LeftPort<C> {
    fn push(&self, delta: ChangeSet<C::Left>) {
        let Some(core) = self.core.upgrade() else { return };
        let (out, slot) = {
            let mut core = core.borrow_mut();
            (core.apply_left(delta), core.out_slot())
        };
        slot.push(out);
    }
}

impl<C: BinaryOperator> Sink<C::Right> for RightPort<C> {
    fn push(&self, delta: ChangeSet<C::Right>) {
        let Some(core) = self.core.upgrade() else { return };
        let (out, slot) = {
            let mut core = core.borrow_mut();
            (core.apply_right(delta), core.out_slot())
        };
        slot.push(out);
    }
}
