// src/exec/mod.rs

//! Process execution layer.
//!
//! This module is responsible for actually running the external tools, using
//! `tokio::process::Command`, and for getting worker outcomes back to the
//! scheduler runtime as `EngineEvent`s.
//!
//! - [`runner`] defines the `ExternalToolRunner` / `ToolProcess` capability
//!   the workers are written against.
//! - [`process`] implements `ToolProcess` on top of a spawned child.
//! - [`tools`] contains the capture and remux runners with their command
//!   templates and output classifiers.
//! - [`backend`] provides the `WorkerBackend` trait and the production
//!   `PipelineBackend`, which tests can replace with a fake implementation.

pub mod backend;
pub mod process;
pub mod runner;
pub mod tools;

pub use backend::{PipelineBackend, WorkerBackend};
pub use runner::{ExternalToolRunner, ProcessEvent, ToolExit, ToolInvocation, ToolProcess, ToolSignal};
pub use tools::{CaptureTool, CommandTemplate, RemuxTool};
