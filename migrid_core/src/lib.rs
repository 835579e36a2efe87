//! The multi-host, multi-schema migration execution engine: parses a
//! versioned SQL directory, diffs it against each schema's persisted
//! history, and drives a concurrent pipeline of before/main/after chains
//! against every target.

pub mod concurrency;
pub mod dest;
pub mod digest;
pub mod error;
pub mod grid;
pub mod migration;
pub mod orchestrator;
pub mod patch;
pub mod registry;
pub mod runner;
pub mod util;
pub mod worker;
pub mod wrap;

pub use crate::dest::Dest;
pub use crate::error::Error;
pub use crate::orchestrator::{Action, RunOptions, RunResult};
pub use crate::registry::Registry;
pub use crate::runner::{RunnerTarget, SqlRunner};
