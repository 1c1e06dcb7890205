//! Per-object reference-counted locks.
//!
//! A [LockRegistry] hands out one mutex per registered object so that
//! shared mutable state can be protected at the granularity of individual
//! objects instead of one coarse lock. Objects are named by opaque
//! [LockId]s issued by the caller; the registry never inspects or owns
//! the guarded objects themselves.
//!
//! Acquisition is two-phase: the caller's intent to hold is recorded
//! under the registry's own short-held lock, and only then does the
//! caller block on the target's mutex. Blocking on one object therefore
//! never delays registry operations on a different object, and
//! [LockRegistry::delete] can tell "no one wants this lock" apart from
//! "someone is still waiting for it".
//!
//! Deletion only succeeds when the deleter's hold is the last one.
//! Anything else releases and retries a bounded number of times before
//! failing with [Error::Busy]; a caller that keeps losing that race under
//! sustained contention is expected to surface the failure rather than
//! spin forever.

use thiserror::Error;

mod locks;
pub use locks::{Guard, LockId, LockRegistry};

/// Errors that can occur when interacting with a [LockRegistry].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("lock not found")]
    NotFound,
    #[error("lock already exists")]
    AlreadyExists,
    #[error("timed out waiting for lock")]
    Timeout,
    #[error("lock still referenced")]
    Busy,
}
