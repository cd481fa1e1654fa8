//! Update sequences
//!
//! [`UpdateOrchestrator`] runs the phases in the caller's task;
//! [`SequenceRunner`] runs them on a background task and lets the caller
//! poll for the outcome.

mod orchestrator;
mod runner;

pub use orchestrator::{Phase, UpdateOrchestrator};
pub use runner::{Sequence, SequenceRunner};
