//! Worker supervision: the manager control loop, its per-family hooks, the
//! dispatch limits and the helper spawned workers use to talk back.

mod behavior;
mod handle;
pub mod limits;
mod manager;

pub use behavior::WorkerBehavior;
pub use handle::WorkerHandle;
pub use limits::{HashWorkerLimit, PredicateWorkerLimit, WorkerLimit};
pub use manager::{ManagerConfig, RunSummary, WorkerManager};
