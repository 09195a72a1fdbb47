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

//! Named cron scheduler with dynamic enable/disable/update semantics.
//!
//! Entries are keyed by unique name and fire on a shared tick loop. Every
//! invocation runs on its own spawned task under a fresh correlation id, with
//! panics contained and logged so a misbehaving job cannot kill the engine.
//! Cron is fire-and-forget: there are no retries, and overlapping
//! invocations of one entry are allowed.

mod scheduler;

pub use scheduler::{CronConfig, CronError, CronScheduler, CronTaskSnapshot};
