//! Schedulers driving an expanded workflow to completion.
//!
//! Every backend walks the same [`Frontier`]: a node becomes ready once all
//! of its predecessors finished successfully, a failure marks everything
//! downstream of it as skipped, and with `stop_on_first_crash` nothing new is
//! dispatched after the first failure. Backends only differ in where and how
//! many ready nodes run at a time.

mod batch;
mod diagnostics;
mod parallel;
mod serial;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use petgraph::Direction;
use petgraph::stable_graph::NodeIndex;
use petgraph::visit::Dfs;
use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::NodeResult;
use crate::error::{NodeError, RunError};
use crate::expand::ExecGraph;
use crate::graph::Workflow;
use crate::node::{Env, Node, Outcome};
use crate::report;
use crate::utils::{STYLE_RUN, as_overhead};

pub use batch::{Batch, JobStatus, Shell, Submitter};
pub use diagnostics::{Diagnostics, NodeExecution};
pub use parallel::Parallel;
pub use serial::Serial;

/// A strategy for executing the nodes of an expanded workflow.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Runs every node of the plan, in dependency order, and reports what
    /// happened. Node failures end up in the report, not in the error.
    fn run(&self, plan: &Plan<'_>) -> Result<RunReport, RunError>;
}

/// Results of finished nodes, shared with their dependents.
#[derive(Debug, Default)]
pub(crate) struct ResultStore(RwLock<HashMap<NodeIndex, Arc<NodeResult>>>);

impl ResultStore {
    pub(crate) fn get(&self, index: NodeIndex) -> Option<Arc<NodeResult>> {
        let map = self.0.read().unwrap_or_else(PoisonError::into_inner);
        map.get(&index).cloned()
    }

    pub(crate) fn insert(&self, index: NodeIndex, result: Arc<NodeResult>) {
        let mut map = self.0.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(index, result);
    }
}

/// An expanded workflow together with the state of one run over it.
pub struct Plan<'a> {
    pub(crate) exec: &'a ExecGraph,
    pub(crate) results: ResultStore,
}

impl<'a> Plan<'a> {
    pub fn new(exec: &'a ExecGraph) -> Self {
        Self {
            exec,
            results: ResultStore::default(),
        }
    }

    pub fn exec(&self) -> &ExecGraph {
        self.exec
    }

    pub(crate) fn env(&self) -> Env<'_> {
        Env {
            config: &self.exec.config,
            transforms: &self.exec.transforms,
            results: &self.results,
        }
    }

    pub(crate) fn node(&self, index: NodeIndex) -> &'a Node {
        &self.exec.graph[index]
    }
}

/// A node that failed during a run.
#[derive(Debug)]
pub struct NodeFailure {
    /// Full dotted identity of the node.
    pub node: String,
    pub parameterization: Vec<String>,
    pub error: NodeError,
}

/// What a run did, node by node.
#[derive(Debug, Default)]
pub struct RunReport {
    pub workflow: String,
    pub backend: String,
    /// Nodes whose work unit ran.
    pub executed: Vec<String>,
    /// Nodes served from their cache entry.
    pub cached: Vec<String>,
    /// Nodes never run because something upstream failed or the run halted.
    pub skipped: Vec<String>,
    pub failures: Vec<NodeFailure>,
    pub diagnostics: Diagnostics,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure(&self, node: &str) -> Option<&NodeFailure> {
        self.failures.iter().find(|failure| failure.node == node)
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "Workflow '{}' ({}): {} executed, {} cached, {} skipped, {} failed",
            self.workflow,
            self.backend,
            self.executed.len(),
            self.cached.len(),
            self.skipped.len(),
            self.failures.len(),
        );
        for failure in &self.failures {
            out.push_str(&format!("\n  {}", failure.node));
            if !failure.parameterization.is_empty() {
                out.push_str(&format!(" [{}]", failure.parameterization.join("/")));
            }
            out.push_str(&format!(": {}", failure.error));
        }
        out
    }
}

/// Readiness bookkeeping shared by every backend.
pub(crate) struct Frontier<'p> {
    plan: &'p Plan<'p>,
    position: HashMap<NodeIndex, usize>,
    pending: HashMap<NodeIndex, usize>,
    ready: BTreeSet<(usize, NodeIndex)>,
    settled: HashSet<NodeIndex>,
    running: usize,
    halted: bool,
    span: Span,
    report: RunReport,
}

impl<'p> Frontier<'p> {
    pub(crate) fn new(plan: &'p Plan<'p>, backend: &str) -> Self {
        let graph = &plan.exec.graph;
        let order = plan.exec.order();

        let position: HashMap<NodeIndex, usize> = order.iter().enumerate().map(|(i, &index)| (index, i)).collect();
        let pending: HashMap<NodeIndex, usize> = order
            .iter()
            .map(|&index| (index, graph.neighbors_directed(index, Direction::Incoming).count()))
            .collect();
        let ready = pending
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&index, _)| (position[&index], index))
            .collect();

        let span = tracing::info_span!("run", workflow = %plan.exec.name, backend);
        span.pb_set_style(&STYLE_RUN);
        span.pb_set_length(order.len() as u64);
        span.pb_set_message(&format!("Running {}", plan.exec.name));

        Self {
            plan,
            position,
            pending,
            ready,
            settled: HashSet::new(),
            running: 0,
            halted: false,
            span,
            report: RunReport {
                workflow: plan.exec.name.clone(),
                backend: backend.to_string(),
                ..RunReport::default()
            },
        }
    }

    pub(crate) fn span(&self) -> Span {
        self.span.clone()
    }

    /// Whether nothing is running and nothing more will be dispatched.
    pub(crate) fn is_done(&self) -> bool {
        self.running == 0 && (self.halted || self.ready.is_empty())
    }

    /// Takes the earliest ready node in topological order.
    pub(crate) fn pop(&mut self) -> Option<NodeIndex> {
        self.pop_fitting(|_| true)
    }

    /// Takes the earliest ready node accepted by `fits`.
    pub(crate) fn pop_fitting(&mut self, fits: impl Fn(&Node) -> bool) -> Option<NodeIndex> {
        if self.halted {
            return None;
        }
        let entry = self
            .ready
            .iter()
            .copied()
            .find(|&(_, index)| fits(self.plan.node(index)))?;
        self.ready.remove(&entry);
        self.running += 1;
        Some(entry.1)
    }

    /// Records the outcome of a dispatched node and releases its dependents.
    pub(crate) fn settle(&mut self, index: NodeIndex, outcome: Result<Outcome, NodeError>, execution: NodeExecution) {
        let exec = self.plan.exec;
        let node = self.plan.node(index);
        let fullname = node.fullname();

        self.running -= 1;
        self.settled.insert(index);
        self.span.pb_inc(1);

        let error = match outcome {
            Ok(outcome) => {
                self.plan.results.insert(index, outcome.result);
                if outcome.cached {
                    self.report.cached.push(fullname);
                    self.report.diagnostics.cached.insert(index);
                } else {
                    if exec.config.resource_monitor
                        && let Err(e) = report::log_resources(exec, node, execution.duration)
                    {
                        tracing::warn!("couldn't log resources of {fullname}: {e}");
                    }
                    self.report.executed.push(fullname);
                    self.report.diagnostics.execution_times.insert(index, execution);
                }

                for next in exec.graph.neighbors_directed(index, Direction::Outgoing) {
                    if let Some(count) = self.pending.get_mut(&next) {
                        *count -= 1;
                        if *count == 0 && !self.settled.contains(&next) {
                            self.ready.insert((self.position[&next], next));
                        }
                    }
                }
                return;
            }
            Err(error) => error,
        };

        tracing::error!("{fullname} failed: {error}");
        if let Some(dir) = &exec.config.crashdump_dir {
            match report::crash_dump(dir, exec, node, &error) {
                Ok(path) => tracing::info!("crash dump written to {path}"),
                Err(e) => tracing::warn!("couldn't write crash dump for {fullname}: {e}"),
            }
        }

        let mut dfs = Dfs::new(&exec.graph, index);
        let mut downstream = Vec::new();
        while let Some(next) = dfs.next(&exec.graph) {
            if next != index && self.settled.insert(next) {
                downstream.push(next);
            }
        }
        downstream.sort_by_key(|next| self.position[next]);
        for next in downstream {
            self.span.pb_inc(1);
            self.report.skipped.push(exec.graph[next].fullname());
        }

        self.report.diagnostics.failed.insert(index);
        self.report.failures.push(NodeFailure {
            node: fullname,
            parameterization: node.parameterization(),
            error,
        });

        if exec.config.stop_on_first_crash {
            self.halted = true;
        }
    }

    /// Closes the run, marking everything never dispatched as skipped.
    pub(crate) fn finish(mut self) -> RunReport {
        let mut left: Vec<NodeIndex> = self
            .pending
            .keys()
            .copied()
            .filter(|index| !self.settled.contains(index))
            .collect();
        left.sort_by_key(|index| self.position[index]);
        for index in left {
            self.report.skipped.push(self.plan.node(index).fullname());
        }
        self.report
    }
}

impl ExecGraph {
    /// Runs the expanded workflow on `backend`.
    pub fn run(&self, backend: &dyn Backend) -> Result<RunReport, RunError> {
        let start = Instant::now();
        let plan = Plan::new(self);
        let report = backend.run(&plan)?;

        if self.config.write_provenance
            && let Err(e) = report::write_provenance(self, &report, &plan.results)
        {
            tracing::warn!("couldn't write provenance: {e}");
        }

        if report.is_success() {
            tracing::info!("{} {}", report.summary(), as_overhead(start));
            Ok(report)
        } else {
            tracing::error!("{} {}", report.summary(), as_overhead(start));
            Err(RunError::Failed(Box::new(report)))
        }
    }
}

impl Workflow {
    /// Expands the workflow and runs it on `backend`.
    pub fn run(&self, backend: &dyn Backend) -> Result<RunReport, RunError> {
        self.expand()?.run(backend)
    }
}
