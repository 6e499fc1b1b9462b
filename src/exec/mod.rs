//! Run execution: executor, orchestrator, checkpoints.

pub mod checkpoint;
pub mod executor;
pub mod orchestrator;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use executor::{Executor, RunController, RunOutcome, Suspension};
pub use orchestrator::Orchestrator;
