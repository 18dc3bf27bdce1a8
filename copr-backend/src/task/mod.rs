//! Task value types handed from the frontend to the worker managers.
//!
//! A task is pure data. The manager only looks at its identity (used for
//! de-duplication in the queue and as the suffix of the worker record key),
//! its priority (read once at `add` time) and, for fair-share limits, its
//! sandbox label.

pub mod action;
pub mod build;
mod sandbox;

pub use action::{ActionResult, ActionTask, ActionType};
pub use build::{BuildTask, PRIORITY_SECTION_SIZE};
pub use sandbox::SandboxLabel;

use std::fmt::Debug;

/// A unit of work the [`WorkerManager`](crate::worker::WorkerManager) can queue and dispatch.
pub trait QueueTask: Clone + Debug + Send + Sync + 'static {
    /// Stable identity; two tasks are the same queue entry iff their ids match.
    fn id(&self) -> String;

    /// Composite priority, lower runs earlier.
    fn priority(&self) -> i64 {
        0
    }

    /// Sandbox label surfaced in the worker record, if known.
    fn sandbox(&self) -> Option<String> {
        None
    }
}
