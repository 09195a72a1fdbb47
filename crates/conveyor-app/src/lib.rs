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

//! Conveyor application bootstrap wiring.
//!
//! Layout: `settings.rs` (configuration surface), `bootstrap.rs` (service
//! wiring and lifecycle), `error.rs` (application error type).

pub mod bootstrap;
pub mod error;
pub mod settings;

pub use bootstrap::{App, run_app};
pub use error::{AppError, AppResult};
pub use settings::Settings;
