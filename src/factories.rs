// Top-level constructors. `spec.md` §4.N: the public entry points a caller
// reaches for first, before touching any concrete iterator type by name.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::core::{AsyncIterator, Iter};
use crate::primitive::{ArrayIter, Empty, IntegerIter, Single};
use crate::transform::{Identity, SourceInput, TransformIterator, Transformer};
use crate::union::{self, UnionSources};

/// `spec.md` §4.E / §4.N: an iterator with no items, already `ENDED`.
#[must_use]
pub fn empty<T: Clone + 'static>() -> Iter<T> {
    Iter::new(Empty::new() as Rc<dyn AsyncIterator<T>>)
}

/// `spec.md` §4.E / §4.N: one item, or an immediately-done iterator for
/// `None`.
#[must_use]
pub fn single<T: Clone + 'static>(item: Option<T>) -> Iter<T> {
    Iter::new(Single::new(item) as Rc<dyn AsyncIterator<T>>)
}

/// `spec.md` §4.E / §4.N: drains a fixed in-memory sequence. `preserve`
/// keeps the full backing vector so `ArrayIter::remaining()` stays usable;
/// set it to `false` when the source is large and `remaining()` will never
/// be called, to let the consumed prefix be reclaimed as it drains.
#[must_use]
pub fn from_array<T: Clone + 'static>(items: Vec<T>, auto_start: bool, preserve: bool) -> Iter<T> {
    Iter::new(ArrayIter::new(items, auto_start, preserve) as Rc<dyn AsyncIterator<T>>)
}

/// `spec.md` §4.E / §4.N: a finite or unbounded arithmetic sequence.
/// `end = None` counts forever; pair with `.take(n)` (see `combinators.rs`)
/// to bound it.
#[must_use]
pub fn range(start: i64, step: i64, end: Option<i64>) -> Iter<i64> {
    Iter::new(IntegerIter::new(start, step, end) as Rc<dyn AsyncIterator<i64>>)
}

/// `range` with no bound at all -- `spec.md` §4.E's "non-finite end".
#[must_use]
pub fn range_unbounded(start: i64, step: i64) -> Iter<i64> {
    range(start, step, None)
}

/// `spec.md` §4.N `fromIterator(it)`: drains any host `Iterator` eagerly
/// into the same buffered-array backing `from_array` uses. Rust iterators
/// are synchronous and not `Clone`-friendly in general, so there is no
/// lazy-pull analogue of the source text's `fromIterator` here -- see
/// `DESIGN.md`.
#[must_use]
pub fn from_iterator<T: Clone + 'static>(it: impl Iterator<Item = T>) -> Iter<T> {
    from_array(it.collect(), true, true)
}

/// `spec.md` §4.H: a source-backed buffered iterator driven by a
/// user-supplied async `_transform` hook, with the default identity
/// transformer when none is supplied.
#[must_use]
pub fn transform<T: Clone + 'static>(
    source: impl Into<SourceInput<T>>,
    transformer: Option<Box<dyn Transformer<T>>>,
    optional: bool,
    destroy_source: bool,
    auto_start: bool,
    max_buffer_size: Option<usize>,
) -> Iter<T> {
    let transformer = transformer.unwrap_or_else(|| Box::new(Identity));
    Iter::new(TransformIterator::new(
        source.into(),
        transformer,
        optional,
        destroy_source,
        auto_start,
        max_buffer_size,
    ) as Rc<dyn AsyncIterator<T>>)
}

/// `spec.md` §4.K: round-robin merge of a fixed set of sources.
#[must_use]
pub fn union<T: Clone + 'static>(sources: Vec<Iter<T>>, destroy_sources: bool, auto_start: bool, max_buffer_size: Option<usize>) -> Iter<T> {
    union::build(UnionSources::Static(sources), destroy_sources, auto_start, max_buffer_size)
}

/// `spec.md` §4.K Dynamic mode: sources arrive over time as items read off
/// `sources_of_sources`.
#[must_use]
pub fn union_dynamic<T: Clone + 'static>(
    sources_of_sources: Iter<Iter<T>>,
    destroy_sources: bool,
    auto_start: bool,
    max_buffer_size: Option<usize>,
) -> Iter<T> {
    union::build(UnionSources::Dynamic(sources_of_sources), destroy_sources, auto_start, max_buffer_size)
}

/// `spec.md` §4.N `wrap(input)`: lift a concrete source into an `Iter<T>`
/// handle. An existing `Iter<T>` passes through unchanged (`Iter` is already
/// the crate's canonical handle, so wrapping one is a no-op rather than an
/// error); an array or deque becomes `from_array`; a factory is called once,
/// eagerly, to obtain the iterator it produces (`SPEC_FULL.md` §6: "a
/// zero-arg factory closure returning one").
pub enum WrapInput<T: Clone + 'static> {
    Iter(Iter<T>),
    Array(Vec<T>),
    Deque(VecDeque<T>),
    Factory(Box<dyn FnOnce() -> Iter<T>>),
}

#[must_use]
pub fn wrap<T: Clone + 'static>(input: WrapInput<T>) -> Iter<T> {
    match input {
        WrapInput::Iter(it) => it,
        WrapInput::Array(items) => from_array(items, true, true),
        WrapInput::Deque(items) => from_array(items.into_iter().collect(), true, true),
        WrapInput::Factory(make) => make(),
    }
}

/// `spec.md` §6 "host iterable"/"host iterator": adapts any
/// `IntoIterator` (Rust's analogue of a "host iterable") the same way
/// `from_iterator` adapts a bare `Iterator`.
#[must_use]
pub fn wrap_std_iter<T: Clone + 'static>(items: impl IntoIterator<Item = T>) -> Iter<T> {
    from_iterator(items.into_iter())
}
