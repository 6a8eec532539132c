use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::channel;
use std::time::Instant;

use petgraph::stable_graph::NodeIndex;
use rayon::ThreadPoolBuilder;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::engine::{Backend, Frontier, NodeExecution, Plan, RunReport};
use crate::error::{NodeError, RunError};
use crate::interface::Resources;
use crate::node::{Node, Outcome};
use crate::utils::{STYLE_NODE, panic_message};

/// Runs ready nodes concurrently on a thread pool.
///
/// A node is dispatched only while the declared resources of everything
/// running, itself included, fit within `workers` threads and `memory_gb`.
/// A node that wouldn't fit even on an idle pool runs alone.
#[derive(Debug, Clone)]
pub struct Parallel {
    workers: usize,
    memory_gb: Option<f64>,
}

impl Default for Parallel {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(workers)
    }
}

impl Parallel {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            memory_gb: None,
        }
    }

    /// Caps the summed memory declared by running nodes.
    pub fn memory_gb(mut self, memory_gb: f64) -> Self {
        self.memory_gb = Some(memory_gb);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

/// Resources claimed by the nodes currently running.
#[derive(Debug, Default)]
struct Budget {
    nodes: usize,
    threads: usize,
    memory_gb: f64,
}

impl Budget {
    fn fits(&self, limit: &Parallel, wanted: Resources) -> bool {
        if self.nodes == 0 {
            return true;
        }
        let threads = self.threads + wanted.threads <= limit.workers;
        let memory = limit
            .memory_gb
            .is_none_or(|cap| self.memory_gb + wanted.memory_gb <= cap);
        threads && memory
    }

    fn claim(&mut self, wanted: Resources) {
        self.nodes += 1;
        self.threads += wanted.threads;
        self.memory_gb += wanted.memory_gb;
    }

    fn release(&mut self, wanted: Resources) {
        self.nodes -= 1;
        self.threads = self.threads.saturating_sub(wanted.threads);
        self.memory_gb = (self.memory_gb - wanted.memory_gb).max(0.0);
    }
}

type Done = (NodeIndex, Result<Outcome, NodeError>, NodeExecution);

impl Backend for Parallel {
    fn name(&self) -> &str {
        "parallel"
    }

    /// Executes the plan on a dedicated pool.
    ///
    /// The calling thread stays the scheduler: it dispatches ready nodes onto
    /// the pool, then blocks on the result channel, and every completion
    /// releases the node's resources and possibly unlocks its dependents.
    fn run(&self, plan: &Plan<'_>) -> Result<RunReport, RunError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("nagare-{i}"))
            .build()?;

        let mut frontier = Frontier::new(plan, self.name());
        let root_span = frontier.span();
        let _enter = root_span.enter();
        let env = plan.env();
        let mut budget = Budget::default();

        pool.in_place_scope(|s| {
            let (sender, receiver) = channel::<Done>();

            loop {
                while let Some(index) =
                    frontier.pop_fitting(|node: &Node| budget.fits(self, node.effective_resources()))
                {
                    let node = plan.node(index);
                    budget.claim(node.effective_resources());

                    let sender = sender.clone();
                    let env = &env;
                    s.spawn(move |_| {
                        let span = tracing::span!(Level::INFO, "node", name = %node.fullname());
                        span.pb_set_style(&STYLE_NODE);
                        span.pb_set_message(&format!("Running {}", node.fullname()));
                        let _enter = span.enter();

                        let start = Instant::now();
                        let outcome = catch_unwind(AssertUnwindSafe(|| node.run(env)))
                            .unwrap_or_else(|panic| Err(NodeError::Panicked(panic_message(panic))));
                        let execution = NodeExecution {
                            start,
                            duration: start.elapsed(),
                        };

                        // the receiver outlives the scope
                        let _ = sender.send((index, outcome, execution));
                    });
                }

                if frontier.is_done() {
                    break;
                }

                let Ok((index, outcome, execution)) = receiver.recv() else {
                    break;
                };
                budget.release(plan.node(index).effective_resources());
                frontier.settle(index, outcome, execution);
            }
        });

        Ok(frontier.finish())
    }
}
