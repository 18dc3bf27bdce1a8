//! copr-backend library crate.
//!
//! Worker managers for the build and action families, the frontend sync and
//! the batched repository publisher, exposed for the binaries and for
//! integration testing.

pub mod actions;
pub mod builds;
pub mod clock;
pub mod config;
pub mod createrepo;
pub mod dispatcher;
pub mod error;
pub mod frontend;
pub mod logging;
pub mod queue;
pub mod store;
pub mod task;
pub mod worker;

pub use error::{Error, Result};
