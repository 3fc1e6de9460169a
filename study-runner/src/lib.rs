//! Study runner - parallel study-run coordinator
//!
//! Runs one study at a time per coordinator: takes a slot on the
//! process-wide [`gate::ConcurrencyGate`], locks the persisted study record,
//! builds the scenario backlog, drains it with engine worker processes, merges
//! their outputs and releases everything again.

pub mod config;
pub mod coordinator;
pub mod db;
pub mod gate;
pub mod lock;
pub mod merge;
pub mod pool;
pub mod prepare;
pub mod queue;
pub mod worker;

pub use coordinator::{RunControl, RunCoordinator, RunDeps, RunReport, RunSettings};
