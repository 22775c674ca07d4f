// Crate implementing the Engineering Principles of the async iterator framework

use thiserror::Error;

pub type Result<T> = anyhow::Result<T, IteratorError>;

/// Contract violations surfaced by the iterator framework.
///
/// These mirror `spec.md` §7's "contract violations" class: synchronous,
/// fatal-to-the-caller mistakes rather than upstream data errors. Upstream
/// errors never take this shape — they travel through the `error` event
/// instead (see [`crate::emitter::Events::emit_error`]).
///
/// `spec.md` §7 also lists "invalid source (null, missing `read`/`on`)",
/// "attempting to change source after set", and "wrap-of-unsupported-type"
/// as contract violations. None of those three are reachable in this crate:
/// a source is always a type-checked `Iter<T>`/`SourceInput<T>`, never a
/// value that could be null or missing methods; there is no API that
/// re-sets a source once bound (it is consumed exactly once out of
/// `SourceInput` during `_begin`); and `WrapInput<T>` is a closed enum
/// matched exhaustively by `wrap`, so there is no "unsupported" arm to
/// reach. Modeling them as variants here would mean constructing them only
/// from dead code, so they are omitted rather than kept as decoration.
#[derive(Error, Debug)]
pub enum IteratorError {
    #[error("source already has a destination bound to it")]
    DestinationAlreadyBound,

    #[error("`done` callback was invoked more than once for a single {0} call")]
    DoneCalledTwice(&'static str),
}
