#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod config;
mod core;
mod engine;
mod error;
mod expand;
mod graph;
pub mod interface;
mod janitor;
mod node;
mod report;
mod transform;
mod utils;

pub use crate::cache::{CacheState, Fingerprint, NodeResult, RESULT_SCHEMA, RESULT_VERSION, load_result};
pub use crate::config::{Config, HashMethod};
pub use crate::core::{Fields, Hash32, Value};
pub use crate::engine::{
    Backend, Batch, Diagnostics, JobStatus, NodeExecution, NodeFailure, Parallel, Plan, RunReport, Serial, Shell,
    Submitter,
};
pub use crate::error::*;
pub use crate::expand::ExecGraph;
pub use crate::graph::{Connection, SourceField, Workflow};
pub use crate::interface::{
    Arg, Command, Discover, FieldKind, FieldSpec, Function, Identity, Interface, Resources, RunContext, Runtime, Spec,
};
pub use crate::node::{InputSource, Iterables, Node, Outcome};
pub use crate::transform::{Transform, TransformFn, Transforms};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
