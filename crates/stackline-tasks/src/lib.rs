//! stackline-tasks: the steps an external workflow engine invokes to run a
//! deployment.
//!
//! Each step takes a camelCase JSON document and returns one. Steps are
//! idempotent: the engine may re-invoke any of them for the same build and
//! the durable outcome stays the same. Failures carry an `errorType` the
//! engine's retry policy can match on.

pub mod contracts;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod runner;

pub use engine::{EngineError, LocalEngine, WorkflowEngine};
pub use error::{ErrorOutput, TaskError, TaskResult};
pub use handlers::{Step, TaskContext};
pub use runner::RunSettings;
