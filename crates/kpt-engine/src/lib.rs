//! kpt Engine - package hydration and KRM function execution
//!
//! This crate turns a package tree into its rendered form:
//! - `FunctionRunner`: runs a function in a container or as a local binary
//! - `HydrationContext`: walks subpackages depth-first and runs pipelines
//! - `Renderer` / `Evaluator`: the `render` and `fn eval` operations
//! - `FunctionResultList`: structured results, persisted as `results.yaml`

pub mod error;
pub mod function;
pub mod hydrate;
pub mod render;
pub mod results;
pub mod runner;

pub use error::{EngineError, Result};
pub use function::Stage;
pub use hydrate::{HydrationContext, NodeId, NodeState};
pub use render::{Evaluator, OutputSink, RenderOptions, RenderOutput, Renderer};
pub use results::{FunctionResult, FunctionResultList, RESULTS_FILE_NAME};
pub use runner::{
    ContainerRuntime, ContainerRunner, ExecRunner, FunctionRunner, ImagePullPolicy, ProcessOutput,
    RunnerOptions,
};
