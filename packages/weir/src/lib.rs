//! Weir: a CSP-style coordination engine for single-threaded runtimes.
//!
//! Channels with pluggable buffering policies, processes built from ordered
//! put/take/sleep operations, a cooperative scheduler that interleaves them
//! on one logical thread, and a `select` operator that races operations on
//! several channels and commits to exactly one winner. Blocking channel
//! semantics without ever blocking the underlying thread: suspension is
//! always "wait for a future scheduler turn".

#[macro_use]
extern crate tracing;

mod csp;

pub use crate::csp::api::{put_async, take_async, TakeFuture};
pub use crate::csp::buffer::Policy;
pub use crate::csp::chan::{Chan, Xform, XformErrorHandler, XformStep};
pub use crate::csp::process::{Op, Process};
pub use crate::csp::sched::Scheduler;
pub use crate::csp::select::SelectArm;
pub use crate::csp::value::Value;

/// Error types
pub mod error {
    pub use crate::csp::error::*;
}
