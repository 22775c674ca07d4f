// `Iter<T>` combinator sugar. `spec.md` §6's consumer-facing operation list:
// `map`, `filter`, `uniq`, `prepend`, `append`, `surround`, `skip`, `take`,
// `range`, `transform`, `clone`->`snapshot`, `toString`->`Display`.
//
// These all live as a second `impl<T> Iter<T>` block, split out from
// `core.rs`, because each one returns a differently-shaped pipeline
// (`mapping`, `simple_transform`, `clone`) and `core.rs` is about the base
// handle, not the combinator surface built on top of it.

use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

use crate::clone;
use crate::core::{AsyncIterator, Iter};
use crate::mapping::MappingIterator;
use crate::simple_transform::{self, PrependAppendSource, SimpleTransformOptions};
use crate::transform::{SourceInput, Transformer};

impl<T: Clone + 'static> Iter<T> {
    /// `spec.md` §6 `map(fn)`: synchronous element-wise transform, dropping
    /// items the function maps to `None`.
    #[must_use]
    pub fn map(&self, f: impl FnMut(T) -> Option<T> + 'static) -> Iter<T> {
        Iter::new(MappingIterator::new(self.clone(), Box::new(f), true) as Rc<dyn AsyncIterator<T>>)
    }

    /// `spec.md` §6 `filter(pred)`.
    #[must_use]
    pub fn filter(&self, mut pred: impl FnMut(&T) -> bool + 'static) -> Iter<T> {
        let opts = SimpleTransformOptions {
            filter: Some(Box::new(move |item: &T| pred(item))),
            ..SimpleTransformOptions::default()
        };
        simple_transform::build(self.clone(), opts)
    }

    /// `spec.md` §6 `uniq(keyFn?)`, generalized over an explicit key
    /// extractor since Rust element types aren't always `Hash`.
    #[must_use]
    pub fn uniq_by<K: Eq + Hash + 'static>(&self, mut key_fn: impl FnMut(&T) -> K + 'static) -> Iter<T> {
        let mut seen = std::collections::HashSet::new();
        self.filter(move |item| seen.insert(key_fn(item)))
    }

    /// `uniq()` for element types that are themselves hashable keys.
    #[must_use]
    pub fn uniq(&self) -> Iter<T>
    where
        T: Eq + Hash,
    {
        self.uniq_by(|item| item.clone())
    }

    /// `spec.md` §6 `prepend(items)`.
    #[must_use]
    pub fn prepend(&self, items: Vec<T>) -> Iter<T> {
        let opts = SimpleTransformOptions {
            prepend: Some(PrependAppendSource::Array(items)),
            ..SimpleTransformOptions::default()
        };
        simple_transform::build(self.clone(), opts)
    }

    /// `spec.md` §6 `append(items)`.
    #[must_use]
    pub fn append(&self, items: Vec<T>) -> Iter<T> {
        let opts = SimpleTransformOptions {
            append: Some(PrependAppendSource::Array(items)),
            ..SimpleTransformOptions::default()
        };
        simple_transform::build(self.clone(), opts)
    }

    /// `spec.md` §6 `surround(pre, post)`.
    #[must_use]
    pub fn surround(&self, pre: Vec<T>, post: Vec<T>) -> Iter<T> {
        let opts = SimpleTransformOptions {
            prepend: Some(PrependAppendSource::Array(pre)),
            append: Some(PrependAppendSource::Array(post)),
            ..SimpleTransformOptions::default()
        };
        simple_transform::build(self.clone(), opts)
    }

    /// `spec.md` §6 `skip(n)`.
    #[must_use]
    pub fn skip(&self, n: usize) -> Iter<T> {
        let opts = SimpleTransformOptions {
            offset: n,
            ..SimpleTransformOptions::default()
        };
        simple_transform::build(self.clone(), opts)
    }

    /// `spec.md` §6 `take(n)`.
    #[must_use]
    pub fn take(&self, n: usize) -> Iter<T> {
        let opts = SimpleTransformOptions {
            limit: Some(n),
            ..SimpleTransformOptions::default()
        };
        simple_transform::build(self.clone(), opts)
    }

    /// `spec.md` §6 `range(start, end)`: `fromArray(xs).skip(n).take(m)` ==
    /// `xs.slice(n, n+m)` (`spec.md` §9), so `range(start, end)` is exactly
    /// `skip(start).take(end - start)`.
    #[must_use]
    pub fn range(&self, start: usize, end: usize) -> Iter<T> {
        let opts = SimpleTransformOptions {
            offset: start,
            limit: Some(end.saturating_sub(start)),
            ..SimpleTransformOptions::default()
        };
        simple_transform::build(self.clone(), opts)
    }

    /// `spec.md` §6 `transform(options)`: a full user-supplied async
    /// `_transform` hook, as opposed to the synchronous `map`/`filter`
    /// sugar above.
    #[must_use]
    pub fn transform_with(&self, transformer: Box<dyn Transformer<T>>, optional: bool, max_buffer_size: Option<usize>) -> Iter<T> {
        crate::factories::transform(
            SourceInput::Ready(self.clone()),
            Some(transformer),
            optional,
            true,
            true,
            max_buffer_size,
        )
    }

    /// `spec.md` §6 `clone()`: snapshot fan-out over the shared history log.
    /// Named `snapshot` here, not `clone`, since `Iter<T>` already derives
    /// `Clone` for ordinary `Rc`-handle sharing -- see `DESIGN.md`.
    pub fn snapshot(&self) -> crate::error::Result<Iter<T>> {
        clone::snapshot(self)
    }
}

impl<T: Clone + 'static> fmt::Display for Iter<T> {
    /// `spec.md` §6 `toString()`: a stable, content-free summary -- state
    /// and readability, never element values (which may not be `Display`).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AsyncIterator(state={:?}, readable={})", self.0.core().state(), self.readable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factories::from_array;
    use crate::scheduler::{self as sched_mod, QueueScheduler};
    use crate::testing::block_on;

    fn new_scheduler() -> Rc<QueueScheduler> {
        let sched = Rc::new(QueueScheduler::new());
        sched_mod::set(sched.clone());
        sched
    }

    #[test]
    fn map_transforms_each_element() {
        let sched = new_scheduler();
        let it = from_array(vec![1, 2, 3], true, true).map(|x| Some(x * 2));
        let result = block_on(&sched, it.to_array(None));
        assert_eq!(result, vec![2, 4, 6]);
    }

    #[test]
    fn filter_drops_non_matching_items() {
        let sched = new_scheduler();
        let it = from_array(vec![1, 2, 3, 4], true, true).filter(|x| x % 2 == 0);
        let result = block_on(&sched, it.to_array(None));
        assert_eq!(result, vec![2, 4]);
    }

    #[test]
    fn uniq_keeps_only_first_occurrence_of_each_value() {
        let sched = new_scheduler();
        let it = from_array(vec![1, 2, 1, 3, 2], true, true).uniq();
        let result = block_on(&sched, it.to_array(None));
        assert_eq!(result, vec![1, 2, 3]);
    }

    /// `spec.md` §9: `fromArray(xs).skip(n).take(m).toArray()` == `xs[n..n+m]`.
    #[test]
    fn skip_then_take_matches_a_slice() {
        let sched = new_scheduler();
        let xs: Vec<i32> = (0..10).collect();
        let it = from_array(xs.clone(), true, true).skip(3).take(4);
        let result = block_on(&sched, it.to_array(None));
        assert_eq!(result, xs[3..7].to_vec());
    }

    #[test]
    fn range_combinator_matches_skip_take() {
        let sched = new_scheduler();
        let xs: Vec<i32> = (0..10).collect();
        let it = from_array(xs.clone(), true, true).range(2, 5);
        let result = block_on(&sched, it.to_array(None));
        assert_eq!(result, xs[2..5].to_vec());
    }

    #[test]
    fn surround_bookends_with_prepend_and_append() {
        let sched = new_scheduler();
        let it = from_array(vec![2, 3], true, true).surround(vec![1], vec![4]);
        let result = block_on(&sched, it.to_array(None));
        assert_eq!(result, vec![1, 2, 3, 4]);
    }

    #[test]
    fn snapshot_can_be_read_independently_of_the_original_handle() {
        let sched = new_scheduler();
        let it = from_array(vec![1, 2, 3], true, true);
        let cloned = it.snapshot().unwrap();
        let result = block_on(&sched, cloned.to_array(None));
        assert_eq!(result, vec![1, 2, 3]);
    }

    #[test]
    fn display_reports_state_without_touching_elements() {
        let _sched = new_scheduler();
        let it = from_array(vec![1, 2, 3], true, true);
        let text = format!("{it}");
        assert!(text.contains("state="));
    }
}
