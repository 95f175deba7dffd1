//! Tidemark Engine
//!
//! Incremental loading of timestamped source directories into a partitioned
//! warehouse table, with optional mirroring into an analytics store.
//!
//! # Layout
//!
//! - [`catalog`]: source directory names, eligibility and chunking
//! - [`partition`]: partition paths and sequence numbers
//! - [`metadata`]: load records and the dataset lock table (sqlx, SQLite)
//! - [`lock`]: per-dataset advisory lock with bounded auto-release
//! - [`external`]: traits and CLI-backed clients for HDFS, Hive, Oozie, Vertica
//! - [`load`]: scheduled and replay loads
//! - [`reversal`]: rollback of committed partitions
//! - [`setup`], [`cleanup`], [`monitor`]: dataset onboarding and teardown
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tidemark_engine::collaborators::Collaborators;
//! use tidemark_engine::external::ShellRunner;
//! use tidemark_engine::load::{DirectorySource, LoadOrchestrator};
//! use tidemark_engine::settings::RunConfig;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(RunConfig::load("clicks.cfg", "env.cfg")?);
//! let collaborators = Collaborators::connect(&config, Arc::new(ShellRunner)).await?;
//! let outcome = LoadOrchestrator::new(config, collaborators, DirectorySource::Scheduled)
//!     .execute()
//!     .await?;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod catalog;
pub mod cleanup;
pub mod collaborators;
pub mod external;
pub mod load;
pub mod lock;
pub mod metadata;
pub mod monitor;
pub mod partition;
pub mod reversal;
pub mod settings;
pub mod setup;

pub use collaborators::Collaborators;
pub use settings::RunConfig;
