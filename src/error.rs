use std::time::Duration;

use thiserror::Error;

use crate::core::Fields;
use crate::engine::RunReport;

#[derive(Debug, Error)]
pub enum NagareError {
    #[error("Error while building the workflow graph:\n{0}")]
    Graph(#[from] GraphError),

    #[error("Error while expanding the workflow graph:\n{0}")]
    Expansion(#[from] ExpansionError),

    #[error("Error while running the workflow:\n{0}")]
    Run(#[from] RunError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised synchronously while a graph is being put together.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Invalid node name '{0}': names must be non-empty and may not contain '.'")]
    InvalidName(String),

    #[error("Node name '{0}' is taken by the workflow it belongs to")]
    ShadowsWorkflow(String),

    #[error("Workflow '{workflow}' already contains a node named '{node}'")]
    DuplicateNode { workflow: String, node: String },

    #[error("Workflow '{workflow}' has no node named '{node}'")]
    UnknownNode { workflow: String, node: String },

    #[error("Workflow '{0}' cannot be connected to itself")]
    SelfConnection(String),

    #[error("Node '{node}' has no input field '{field}'")]
    UnknownInput { node: String, field: String },

    #[error("Node '{node}' has no output field '{field}'")]
    UnknownOutput { node: String, field: String },

    #[error(
        "Input '{node}.{field}' is already connected from '{existing}', refusing to also connect it from '{attempted}'"
    )]
    AlreadyConnected {
        node: String,
        field: String,
        existing: String,
        attempted: String,
    },

    #[error("Connecting '{from}' to '{to}' would introduce a cycle")]
    Cycle { from: String, to: String },

    #[error("Unknown transform '{0}', register it on the workflow first")]
    UnknownTransform(String),

    #[error("There is no connection '{from}' -> '{to}'")]
    NotConnected { from: String, to: String },

    #[error("Value {value} is not valid for field '{node}.{field}' of kind {kind}")]
    InvalidValue {
        node: String,
        field: String,
        value: String,
        kind: String,
    },
}

/// Errors raised while rewriting the graph into its executable form. These
/// are fatal and always surface before any node runs.
#[derive(Debug, Error)]
pub enum ExpansionError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Expanded graph contains a cycle through '{0}'")]
    Cycle(String),

    #[error("Expanded graph contains more than one node with identity '{0}'")]
    IdentityCollision(String),

    #[error("Nodes '{first}' and '{second}' resolve to the same working directory '{dir}'")]
    DirectoryCollision {
        first: String,
        second: String,
        dir: String,
    },

    #[error("Iterable field '{field}' is not an input of node '{node}'")]
    UnknownIterableField { node: String, field: String },

    #[error("Synchronized iterables of node '{node}' have different lengths: {lengths:?}")]
    MismatchedIterables { node: String, lengths: Vec<usize> },

    #[error("Join node '{node}' refers to unknown join source '{join_source}'")]
    UnknownJoinSource { node: String, join_source: String },

    #[error(
        "Cannot compose transforms '{first}' and '{second}' in series when connecting '{from}' to '{to}', use a function node instead"
    )]
    TransformsInSeries {
        from: String,
        to: String,
        first: String,
        second: String,
    },
}

/// Errors around persisted results. These never abort a run on their own:
/// the cache entry is discarded and the node is executed again.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode cached result:\n{0}")]
    Encode(String),

    #[error("Couldn't decode cached result:\n{0}")]
    Decode(String),

    #[error("Cached result has schema '{found}', expected '{expected}'")]
    Schema { found: String, expected: String },

    #[error("Cached result has version {found}, expected {expected}")]
    Version { found: u32, expected: u32 },
}

/// Errors recorded against a single node during a run.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Mandatory input '{0}' is undefined")]
    MissingInput(String),

    #[error("Input '{field}' has value {value} which is not of kind {kind}")]
    InvalidInput {
        field: String,
        value: String,
        kind: String,
    },

    #[error("Couldn't load the result of upstream node '{node}':\n{error}")]
    Upstream { node: String, error: CacheError },

    #[error("Transform '{name}' failed on input '{field}': {error:#}")]
    Transform {
        field: String,
        name: String,
        error: anyhow::Error,
    },

    #[error("Iterfield '{0}' is not a list")]
    NotAList(String),

    #[error("Iterfields have different lengths: {0:?}")]
    IterfieldLength(Vec<(String, usize)>),

    #[error(transparent)]
    Map(#[from] MapFailure),

    #[error("{0:#}")]
    Interface(anyhow::Error),

    #[error("Job submission failed: {0:#}")]
    Submit(anyhow::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Work unit panicked: {0}")]
    Panicked(String),
}

/// Per-element failures of a map node.
///
/// `partial` holds the collated outputs with `null` at every index that did
/// not produce a value, so index correspondence is preserved.
#[derive(Debug, Error)]
#[error("{}", render_failures(.failures))]
pub struct MapFailure {
    pub failures: Vec<(usize, NodeError)>,
    pub partial: Fields,
}

fn render_failures(failures: &[(usize, NodeError)]) -> String {
    let mut out = format!("{} mapped element(s) failed:", failures.len());
    for (index, error) in failures {
        out.push_str(&format!("\n  [{index}] {error}"));
    }
    out
}

/// Errors returned by [`Workflow::run`](crate::Workflow::run).
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Expansion(#[from] ExpansionError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("{}", .0.summary())]
    Failed(Box<RunReport>),
}

impl RunError {
    /// The report of a run that executed but had failing nodes.
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            RunError::Failed(report) => Some(report),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_failure_lists_every_index() {
        let failure = MapFailure {
            failures: vec![
                (1, NodeError::MissingInput("x".into())),
                (3, NodeError::Timeout(Duration::from_secs(2))),
            ],
            partial: Fields::new(),
        };

        let text = failure.to_string();
        assert!(text.starts_with("2 mapped element(s) failed"));
        assert!(text.contains("[1] Mandatory input 'x' is undefined"));
        assert!(text.contains("[3] Timed out after 2s"));
    }

    #[test]
    fn test_conflict_names_both_sources() {
        let error = GraphError::AlreadyConnected {
            node: "b".into(),
            field: "x".into(),
            existing: "a.out".into(),
            attempted: "c.out".into(),
        };

        let text = error.to_string();
        assert!(text.contains("a.out"));
        assert!(text.contains("c.out"));
    }
}
