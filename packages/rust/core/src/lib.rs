//! Job pipeline for the b-roll harvester.
//!
//! This crate provides:
//! - [`scheduler`]: the FIFO job queue and its single worker
//! - [`pipeline`]: the engine that runs one job's four stages
//! - [`stages`]: the Download, Transcribe, Concept-Extract and Image-Fetch executors
//! - [`bundle`]: the per-job output directory and `job.json`
//! - [`concepts`]: concept ranking and capping
//! - [`plan`]: the per-job settings snapshot

pub mod bundle;
pub mod concepts;
pub mod pipeline;
pub mod plan;
pub mod scheduler;
pub mod stages;

#[cfg(test)]
mod testing;

pub use bundle::{JobBundle, read_record};
pub use concepts::select_concepts;
pub use pipeline::{Engine, JobObserver, SilentObserver};
pub use plan::{JobPlan, subtitles_enabled};
pub use scheduler::Scheduler;
