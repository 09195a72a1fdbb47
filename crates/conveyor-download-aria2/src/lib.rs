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

//! aria2 downloader adapter speaking JSON-RPC 2.0.
//!
//! The RPC endpoint is reached over HTTP POST or, when the configured server
//! uses a `ws`/`wss` scheme, over a WebSocket connection that additionally
//! surfaces aria2's push notifications to an optional [`Aria2Notifier`].

mod adapter;
mod notify;
mod protocol;
mod transport;

pub use adapter::{Aria2Config, Aria2Downloader};
pub use notify::Aria2Notifier;
