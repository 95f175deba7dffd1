//! Tidemark Common Library
//!
//! Shared plumbing for the Tidemark workspace members:
//!
//! - **Configuration**: INI documents with an implicit `[main]` section
//! - **Logging**: tracing subscriber setup with per-run log files
//! - **Templates**: `@PLACEHOLDER` substitution for generated resources
//!
//! # Example
//!
//! ```no_run
//! use tidemark_common::config::IniDocument;
//!
//! fn dataset_name(path: &str) -> tidemark_common::Result<String> {
//!     let doc = IniDocument::load(path)?;
//!     Ok(doc.main("dataset_name")?.to_string())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod error;
pub mod logging;
pub mod template;

// Re-export commonly used types
pub use error::{ConfigError, Result};
