//! stagehand - a dependency-graph pipeline executor with quality gates.
//!
//! A pipeline is a [`Graph`] of [`Task`]s: stage raw records from object
//! storage, load fact and dimension tables, and gate each step on data
//! quality checks. The [`Executor`] walks the graph, runs independent tasks
//! concurrently, retries failures that may be transient, and skips
//! everything downstream of a task that failed for good.
//!
//! ```
//! use stagehand::{GraphBuilder, Task, QualityCheck};
//!
//! let graph = GraphBuilder::new("refresh")
//!     .task(Task::marker("begin"))
//!     .task(Task::load_fact("load_songplays", "SELECT * FROM staging_events", "songplays"))
//!     .task(Task::quality_check("check_songplays", vec![QualityCheck::has_rows("songplays")]))
//!     .chain(&["begin", "load_songplays", "check_songplays"])
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(graph.waves().len(), 3);
//! ```

pub mod config;
pub mod core;
pub mod credentials;
pub mod events;
pub mod execution;
pub mod operators;
pub mod storage;
pub mod testing;
pub mod warehouse;

pub use config::{
    ConfigError, Pipeline, PipelineBuilder, PipelineConfig, YamlLoader,
    load_pipelines_from_directory,
};
pub use core::check::{Expectation, Predicate, QualityCheck, Scalar};
pub use core::graph::{Graph, GraphBuilder, TopologyError};
pub use core::retry::RetryPolicy;
pub use core::run::{RunContext, RunError, RunStatus, RunSummary, TaskFailure, TaskOutput};
pub use core::task::{
    DimensionMode, DimensionParams, FormatHint, LoadParams, SourceLocation, StageParams, Task,
    TaskKind, TaskParams, TaskState,
};
pub use core::types::{PipelineId, RunId, TaskId};
pub use credentials::{CredentialProvider, Credentials, EnvCredentials, StaticCredentials};
pub use events::{Event, EventBus, EventHandler};
pub use execution::{Executor, RunConfig};
pub use operators::{TaskError, TaskRunner, WarehouseRunner};
pub use storage::{InMemoryStorageReader, LocalStorageReader, StorageReader};
pub use warehouse::{InMemoryWarehouse, Warehouse, WarehousePool};
