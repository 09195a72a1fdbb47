#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Multi-worker background task queue with persistence and suspension.
//!
//! Tasks make progress in iterations: each `step` call either finishes the
//! task, asks for another iteration, or suspends until a future resume time.
//! The engine persists every lifecycle transition so non-terminal tasks can
//! be rehydrated after a process restart through registered factories.

pub mod engine;
pub mod error;
pub mod metrics;
pub mod record;
pub mod registry;
pub mod repo;
pub mod scheduler;
pub mod status;
pub mod task;

pub use engine::{Queue, QueueConfig};
pub use error::{QueueError, QueueResult};
pub use metrics::{QueueMetrics, QueueMetricsSnapshot};
pub use record::TaskRecord;
pub use registry::TaskRegistry;
pub use repo::{MemoryTaskRepository, RepoResult, RepositoryError, TaskRepository};
pub use scheduler::{Scheduler, SchedulerError};
pub use status::TaskStatus;
pub use task::{
    FactoryError, ProgressChannel, PublicState, StepContext, StepError, StepOutcome, Task,
    TaskFactoryRegistry, TaskRow, TaskStateError, TaskSummary,
};
