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

//! The remote-download task: a resumable state machine that drives a
//! configured downloader through *create → monitor → seeding →
//! completed/cancelled*, suspending itself between polls so no queue worker
//! is ever parked on a running download.

mod task;

pub use task::{REMOTE_DOWNLOAD_KIND, RemoteDownloadTask, register_factory};
