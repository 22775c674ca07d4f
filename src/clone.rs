// Snapshot fan-out reading via a shared history log. `spec.md` §4.L.
//
// The single shared destination the spec describes (a "history reader")
// is cached on the source's own property store under a private key, so
// the *second* `snapshot()` call on the same source reuses it instead of
// re-claiming the source's destination slot (which would fail the
// single-owner check a second time).

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::core::{init_dual_mode, AsyncIterator, Core, Iter};
use crate::emitter::Cause;
use crate::error::Result;
use crate::state::IterState;

const HISTORY_READER_PROPERTY: &str = "__clone_history_reader";

struct HistoryReader<T: Clone + 'static> {
    source: Iter<T>,
    history: RefCell<Vec<T>>,
    trackers: RefCell<Vec<Weak<ClonedIterator<T>>>>,
}

impl<T: Clone + 'static> HistoryReader<T> {
    fn install(source: &Iter<T>) -> Result<Rc<Self>> {
        source.0.core().bind_destination()?;

        let reader = Rc::new(HistoryReader {
            source: source.clone(),
            history: RefCell::new(Vec::new()),
            trackers: RefCell::new(Vec::new()),
        });

        if !source.done() {
            let weak_readable: Weak<HistoryReader<T>> = Rc::downgrade(&reader);
            source.0.core().events.on_readable(move || {
                if let Some(strong) = weak_readable.upgrade() {
                    for tracker in strong.trackers.borrow().iter().filter_map(Weak::upgrade) {
                        tracker.core.set_readable(true);
                    }
                }
            });

            let weak_end: Weak<HistoryReader<T>> = Rc::downgrade(&reader);
            source.0.core().events.on_end(move || {
                if let Some(strong) = weak_end.upgrade() {
                    let history_len = strong.history.borrow().len();
                    for tracker in strong.trackers.borrow().iter().filter_map(Weak::upgrade) {
                        if tracker.source_started.get() && tracker.read_position.get() == history_len {
                            tracker.close();
                        }
                    }
                    strong.trackers.borrow_mut().clear();
                }
            });

            let weak_error: Weak<HistoryReader<T>> = Rc::downgrade(&reader);
            source.0.core().events.on_error(move |cause: &Cause| {
                if let Some(strong) = weak_error.upgrade() {
                    for tracker in strong.trackers.borrow().iter().filter_map(Weak::upgrade) {
                        tracker.core.events.emit_error(cause);
                    }
                }
            });
        }

        Ok(reader)
    }

    /// `spec.md` §4.L `readAt(pos)`.
    fn read_at(&self, pos: usize) -> Option<T> {
        if let Some(item) = self.history.borrow().get(pos) {
            return Some(item.clone());
        }
        if self.source.done() {
            return None;
        }
        let item = self.source.read()?;
        self.history.borrow_mut().push(item.clone());
        Some(item)
    }

    /// `spec.md` §4.L `endsAt(pos)`.
    fn ends_at(&self, pos: usize) -> bool {
        self.source.done() && self.history.borrow().len() == pos
    }

    fn register(self: &Rc<Self>, tracker: &Rc<ClonedIterator<T>>) {
        self.trackers.borrow_mut().push(Rc::downgrade(tracker));
    }
}

fn history_reader_for<T: Clone + 'static>(source: &Iter<T>) -> Result<Rc<HistoryReader<T>>> {
    if let Some(existing) = source.0.core().get_property(HISTORY_READER_PROPERTY) {
        if let Ok(reader) = existing.downcast::<HistoryReader<T>>() {
            return Ok(reader);
        }
    }
    let reader = HistoryReader::install(source)?;
    source.0.core().set_property(HISTORY_READER_PROPERTY, reader.clone() as Rc<dyn Any>);
    Ok(reader)
}

pub struct ClonedIterator<T: Clone + 'static> {
    core: Core<T>,
    history: Rc<HistoryReader<T>>,
    read_position: Cell<usize>,
    source_started: Cell<bool>,
    self_weak: Weak<Self>,
}

impl<T: Clone + 'static> ClonedIterator<T> {
    fn new(history: Rc<HistoryReader<T>>) -> Rc<Self> {
        let rc = Rc::new_cyclic(|weak| ClonedIterator {
            core: Core::new(),
            history,
            read_position: Cell::new(0),
            source_started: Cell::new(false),
            self_weak: weak.clone(),
        });
        rc.core.change_state(IterState::Open);
        init_dual_mode::<T, _>(&rc);
        rc.history.register(&rc);
        // `spec.md` §4.L: "readable=true if the source is known" -- a clone
        // always wraps a concrete, already-resolved source.
        rc.core.set_readable(true);
        rc
    }

    /// `spec.md` §4.L: "own store, then source's store (subscribing on the
    /// source for pending values)". Exposed as an inherent method rather than
    /// an `AsyncIterator` override point -- the trait's property getters take
    /// `&self` with no hook for a fallback source, and are not object-safe
    /// once generic (see `crate::core::AsyncIterator::get_property_async`).
    #[must_use]
    pub fn get_property_cascading(&self, name: &str) -> Option<Rc<dyn Any>> {
        self.core.get_property(name).or_else(|| self.history.source.0.core().get_property(name))
    }

    /// Local `setProperty` shadows a pending source value: if `name` is
    /// already set locally, `cb` fires from this store; otherwise the
    /// lookup cascades to the source's pending-callback queue.
    pub fn get_property_cascading_async(self: &Rc<Self>, name: &str, cb: impl FnOnce(&Rc<dyn Any>) + 'static) {
        if let Some(value) = self.core.get_property(name) {
            let value = value.clone();
            crate::scheduler::schedule(move || cb(&value));
            return;
        }
        self.history.source.0.core().get_property_async(name, cb);
    }
}

impl<T: Clone + 'static> AsyncIterator<T> for ClonedIterator<T> {
    fn core(&self) -> &Core<T> {
        &self.core
    }

    /// `spec.md` §4.L clone `read()`: `readAt(readPosition)`; on success,
    /// advance; on exhaustion mark unreadable; close once the source has
    /// truly ended at this position.
    fn read(&self) -> Option<T> {
        if self.core.done() {
            return None;
        }
        self.source_started.set(true);
        let pos = self.read_position.get();
        match self.history.read_at(pos) {
            Some(item) => {
                self.read_position.set(pos + 1);
                if self.history.ends_at(pos + 1) {
                    self.core.set_readable(false);
                    self.close();
                }
                Some(item)
            }
            None => {
                self.core.set_readable(false);
                if self.history.ends_at(pos) {
                    self.close();
                }
                None
            }
        }
    }

    fn weak_dyn(&self) -> Weak<dyn AsyncIterator<T>> {
        self.self_weak.clone()
    }
}

/// `spec.md` §4.L: snapshot fan-out over one live source. Named `snapshot`
/// (not `clone`) because `Iter<T>` already derives `Clone` for ordinary
/// `Rc`-handle sharing -- see `DESIGN.md`.
pub fn snapshot<T: Clone + 'static>(source: &Iter<T>) -> Result<Iter<T>> {
    let reader = history_reader_for(source)?;
    let cloned = ClonedIterator::new(reader);
    Ok(Iter::new(cloned as Rc<dyn AsyncIterator<T>>))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::IntegerIter;
    use crate::scheduler::{self as sched_mod, QueueScheduler};
    use crate::testing::block_on;

    fn new_scheduler() -> Rc<QueueScheduler> {
        let sched = Rc::new(QueueScheduler::new());
        sched_mod::set(sched.clone());
        sched
    }

    /// `spec.md` §8 scenario 4: two independent clones over one live
    /// source both see the full sequence, drained sequentially.
    #[test]
    fn two_clones_both_see_the_full_sequence() {
        let sched = new_scheduler();
        let src = Iter::new(IntegerIter::new(1, 1, Some(3)) as Rc<dyn AsyncIterator<i64>>);
        let c1 = snapshot(&src).unwrap();
        let c2 = snapshot(&src).unwrap();

        let result1 = block_on(&sched, c1.to_array(None));
        assert_eq!(result1, vec![1, 2, 3]);

        let result2 = block_on(&sched, c2.to_array(None));
        assert_eq!(result2, vec![1, 2, 3]);
    }

    #[test]
    fn cloning_twice_does_not_double_claim_the_source_destination() {
        let _sched = new_scheduler();
        let src = Iter::new(IntegerIter::new(0, 1, Some(1)) as Rc<dyn AsyncIterator<i64>>);
        let _c1 = snapshot(&src).unwrap();
        let c2 = snapshot(&src);
        assert!(c2.is_ok());
    }
}
