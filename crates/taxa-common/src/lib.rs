//! Taxa Common Library
//!
//! Shared utilities for the taxa harvesting workspace.
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Checksums**: content hashing used for cache change detection
//! - **Logging**: tracing subscriber bootstrap driven by `TAXA_LOG_*`
//!
//! # Example
//!
//! ```no_run
//! use taxa_common::checksum::ContentHash;
//!
//! let first = ContentHash::of(br#"{"id":"Q140"}"#);
//! let second = ContentHash::of(br#"{"id":"Q140"}"#);
//! assert_eq!(first, second);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
