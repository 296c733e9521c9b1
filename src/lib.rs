//! Commission link archiver library.
//!
//! Crawls commission posts, archives the files they link to on supported
//! hosts into per-resource zip bundles, and periodically repacks pending
//! bundles into size-bounded packs tracked by a JSON manifest.

// Allow raw string hashes for safety - they're harmless and prevent issues if content changes
#![allow(clippy::needless_raw_string_hashes)]

pub mod archiver;
pub mod config;
pub mod constants;
pub mod extractors;
pub mod http;
pub mod manifest;
pub mod repack;
pub mod source;
pub mod store;
