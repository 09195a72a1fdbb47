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

//! qBittorrent downloader adapter over the WebUI REST API (v4+).
//!
//! The WebUI is stateful: `/api/v2/auth/login` sets an `SID` cookie that all
//! further endpoints require. The adapter keeps the cookie in the HTTP
//! client's jar and re-authenticates once when a call answers 403.

mod adapter;
mod model;

pub use adapter::{QbitConfig, QbitDownloader};
