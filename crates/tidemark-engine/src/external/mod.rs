//! External system clients
//!
//! Each system the engine drives sits behind an async trait with a
//! production implementation that shells out to the vendor CLI. Output is
//! parsed by a dedicated function per format, so a change in a tool's output
//! surfaces as a `MalformedOutput` error instead of a silent misread.

pub mod hdfs;
pub mod hive;
pub mod oozie;
pub mod registry;
pub mod shell;
pub mod vertica;

pub use hdfs::{HadoopFs, Hdfs, HdfsError};
pub use hive::{HiveCli, Warehouse, WarehouseError};
pub use oozie::{BatchJobClient, BatchJobError, JobCounters, JobId, OozieClient, TerminalState, WorkflowSettings};
pub use registry::{PartitionRegistry, RegistryError};
pub use shell::{CommandOutput, CommandRunner, ShellError, ShellRunner};
pub use vertica::{CopyMode, Grant, MirrorError, MirrorLoader, VerticaCli, VerticaConnection};
