// The four primitive, source-less iterators. `spec.md` §4.E.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::core::{init_dual_mode, AsyncIterator, Core};
use crate::state::IterState;

/// Constructed already `ENDED`; `end` is still announced via one scheduled
/// emission rather than firing synchronously before the constructor returns
/// to its caller.
pub struct Empty<T: Clone + 'static> {
    core: Core<T>,
    self_weak: Weak<Self>,
}

impl<T: Clone + 'static> Empty<T> {
    #[must_use]
    pub fn new() -> Rc<Self> {
        let rc = Rc::new_cyclic(|weak| Empty {
            core: Core::new(),
            self_weak: weak.clone(),
        });
        rc.core.change_state(IterState::Open);
        init_dual_mode::<T, _>(&rc);
        rc.core.transition_to_ended(true);
        rc
    }
}

impl<T: Clone + 'static> AsyncIterator<T> for Empty<T> {
    fn core(&self) -> &Core<T> {
        &self.core
    }

    fn read(&self) -> Option<T> {
        None
    }

    fn weak_dyn(&self) -> Weak<dyn AsyncIterator<T>> {
        self.self_weak.clone()
    }
}

/// Yields `item` exactly once then closes. `None` closes immediately (with
/// `done` already true before the constructor returns -- see `spec.md`
/// §8 boundary "`single(null).done` is true immediately").
pub struct Single<T: Clone + 'static> {
    core: Core<T>,
    item: RefCell<Option<T>>,
    self_weak: Weak<Self>,
}

impl<T: Clone + 'static> Single<T> {
    #[must_use]
    pub fn new(item: Option<T>) -> Rc<Self> {
        let has_item = item.is_some();
        let rc = Rc::new_cyclic(|weak| Single {
            core: Core::new(),
            item: RefCell::new(item),
            self_weak: weak.clone(),
        });
        rc.core.change_state(IterState::Open);
        init_dual_mode::<T, _>(&rc);
        if has_item {
            rc.core.set_readable(true);
        } else {
            // Collapses straight to ENDED, mirroring `Empty`, instead of
            // going through the generic deferred `close()` path -- the
            // boundary requires `done` synchronously here.
            rc.core.transition_to_ended(true);
        }
        rc
    }
}

impl<T: Clone + 'static> AsyncIterator<T> for Single<T> {
    fn core(&self) -> &Core<T> {
        &self.core
    }

    fn read(&self) -> Option<T> {
        if self.core.done() {
            return None;
        }
        let taken = self.item.borrow_mut().take();
        if taken.is_some() {
            self.core.set_readable(false);
            self.close();
        }
        taken
    }

    fn weak_dyn(&self) -> Weak<dyn AsyncIterator<T>> {
        self.self_weak.clone()
    }
}

/// Drains a stored sequence in order. `spec.md` §4.E: "`preserve=false`"
/// caps memory by splicing away the consumed prefix every 64 reads;
/// `preserve=true` keeps the full backing vector so `remaining()` can hand
/// back the untouched tail without re-buffering through the read path.
pub struct ArrayIter<T: Clone + 'static> {
    core: Core<T>,
    items: RefCell<Vec<T>>,
    cursor: Cell<usize>,
    preserve: bool,
    self_weak: Weak<Self>,
}

impl<T: Clone + 'static> ArrayIter<T> {
    #[must_use]
    pub fn new(items: Vec<T>, auto_start: bool, preserve: bool) -> Rc<Self> {
        let empty = items.is_empty();
        let rc = Rc::new_cyclic(|weak| ArrayIter {
            core: Core::new(),
            items: RefCell::new(items),
            cursor: Cell::new(0),
            preserve,
            self_weak: weak.clone(),
        });
        rc.core.change_state(IterState::Open);
        init_dual_mode::<T, _>(&rc);
        if auto_start && empty {
            rc.close();
        } else {
            rc.core.set_readable(true);
        }
        rc
    }

    /// The unread tail, without re-buffering through `read`/`data`.
    #[must_use]
    pub fn remaining(&self) -> Vec<T> {
        self.items.borrow()[self.cursor.get()..].to_vec()
    }
}

impl<T: Clone + 'static> AsyncIterator<T> for ArrayIter<T> {
    fn core(&self) -> &Core<T> {
        &self.core
    }

    fn read(&self) -> Option<T> {
        if self.core.done() {
            return None;
        }
        let cursor = self.cursor.get();
        let mut items = self.items.borrow_mut();
        if cursor >= items.len() {
            drop(items);
            self.core.set_readable(false);
            self.close();
            return None;
        }

        let value = items[cursor].clone();
        self.cursor.set(cursor + 1);

        if !self.preserve && self.cursor.get() % 64 == 0 {
            items.drain(0..self.cursor.get());
            self.cursor.set(0);
        }
        let exhausted = self.cursor.get() >= items.len();
        drop(items);

        if exhausted {
            self.core.set_readable(false);
        }
        Some(value)
    }

    fn weak_dyn(&self) -> Weak<dyn AsyncIterator<T>> {
        self.self_weak.clone()
    }
}

/// A finite or unbounded arithmetic sequence. `spec.md` §4.E. Rust integers
/// can't be non-finite, so the source text's "non-finite start closes
/// immediately" guard has no analogue here -- see `DESIGN.md`.
pub struct IntegerIter {
    core: Core<i64>,
    current: Cell<i64>,
    step: i64,
    end: Option<i64>,
    self_weak: Weak<Self>,
}

impl IntegerIter {
    #[must_use]
    pub fn new(start: i64, step: i64, end: Option<i64>) -> Rc<Self> {
        let rc = Rc::new_cyclic(|weak| IntegerIter {
            core: Core::new(),
            current: Cell::new(start),
            step,
            end,
            self_weak: weak.clone(),
        });
        rc.core.change_state(IterState::Open);
        init_dual_mode::<i64, _>(&rc);
        if rc.crossed(start) {
            rc.close();
        } else {
            rc.core.set_readable(true);
        }
        rc
    }

    fn crossed(&self, value: i64) -> bool {
        match self.end {
            None => false,
            Some(end) => match self.step.cmp(&0) {
                std::cmp::Ordering::Greater => value > end,
                std::cmp::Ordering::Less => value < end,
                std::cmp::Ordering::Equal => false,
            },
        }
    }
}

impl AsyncIterator<i64> for IntegerIter {
    fn core(&self) -> &Core<i64> {
        &self.core
    }

    fn read(&self) -> Option<i64> {
        if self.core.done() {
            return None;
        }
        let current = self.current.get();
        if self.crossed(current) {
            self.core.set_readable(false);
            self.close();
            return None;
        }
        let next = current + self.step;
        self.current.set(next);
        if self.crossed(next) {
            self.core.set_readable(false);
        }
        Some(current)
    }

    fn weak_dyn(&self) -> Weak<dyn AsyncIterator<i64>> {
        self.self_weak.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Iter;
    use crate::scheduler::{self, QueueScheduler};
    use crate::testing::block_on;

    fn new_scheduler() -> Rc<QueueScheduler> {
        let sched = Rc::new(QueueScheduler::new());
        scheduler::set(sched.clone());
        sched
    }

    #[test]
    fn empty_ends_with_exactly_one_end_event_and_no_items() {
        let sched = new_scheduler();
        let it = Empty::<i32>::new();
        let iter = Iter::new(it as Rc<dyn AsyncIterator<i32>>);

        let ends = Rc::new(Cell::new(0));
        let ends1 = ends.clone();
        iter.0.core().events.on_end(move || ends1.set(ends1.get() + 1));

        let result = block_on(&sched, iter.to_array(None));
        assert!(result.is_empty());
        assert_eq!(ends.get(), 1);
        assert!(iter.ended());
    }

    #[test]
    fn single_with_value_yields_it_once_then_ends() {
        let sched = new_scheduler();
        let it = Single::new(Some(42));
        let iter = Iter::new(it as Rc<dyn AsyncIterator<i32>>);

        let result = block_on(&sched, iter.to_array(None));
        assert_eq!(result, vec![42]);
    }

    #[test]
    fn single_with_none_is_done_immediately() {
        let _sched = new_scheduler();
        let it = Single::<i32>::new(None);
        assert!(it.done());
        assert_eq!(it.read(), None);
    }

    #[test]
    fn array_iter_drains_all_items_in_order() {
        let sched = new_scheduler();
        let it = ArrayIter::new(vec![1, 2, 3], true, true);
        let iter = Iter::new(it as Rc<dyn AsyncIterator<i32>>);

        let result = block_on(&sched, iter.to_array(None));
        assert_eq!(result, vec![1, 2, 3]);
    }

    #[test]
    fn array_iter_auto_start_empty_closes_in_constructor() {
        let sched = new_scheduler();
        let it = ArrayIter::<i32>::new(vec![], true, true);
        sched.run_until_idle();
        assert!(it.done());
    }

    #[test]
    fn array_iter_non_preserving_splices_consumed_prefix() {
        let _sched = new_scheduler();
        let items: Vec<i32> = (0..200).collect();
        let it = ArrayIter::new(items, true, false);
        for _ in 0..130 {
            it.read();
        }
        assert!(it.items.borrow().len() < 200);
    }

    #[test]
    fn range_zero_zero_yields_a_single_zero() {
        let sched = new_scheduler();
        let it = IntegerIter::new(0, 1, Some(0));
        let iter = Iter::new(it as Rc<dyn AsyncIterator<i64>>);

        let result = block_on(&sched, iter.to_array(None));
        assert_eq!(result, vec![0]);
    }

    #[test]
    fn range_ascending_with_start_past_end_is_empty() {
        let sched = new_scheduler();
        let it = IntegerIter::new(5, 1, Some(1));
        let iter = Iter::new(it as Rc<dyn AsyncIterator<i64>>);

        let result = block_on(&sched, iter.to_array(None));
        assert!(result.is_empty());
    }

    #[test]
    fn range_descending_with_start_before_end_is_empty() {
        let sched = new_scheduler();
        let it = IntegerIter::new(1, -1, Some(5));
        let iter = Iter::new(it as Rc<dyn AsyncIterator<i64>>);

        let result = block_on(&sched, iter.to_array(None));
        assert!(result.is_empty());
    }

    #[test]
    fn unbounded_integer_iter_counts_forever_until_take() {
        let _sched = new_scheduler();
        let it = IntegerIter::new(0, 1, None);
        assert_eq!(it.read(), Some(0));
        assert_eq!(it.read(), Some(1));
        assert_eq!(it.read(), Some(2));
        assert!(!it.done());
    }
}
