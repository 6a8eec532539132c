use std::time::Instant;

use crate::engine::{Backend, Frontier, NodeExecution, Plan, RunReport};
use crate::error::RunError;

/// Runs one node at a time on the calling thread, in topological order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Serial;

impl Backend for Serial {
    fn name(&self) -> &str {
        "serial"
    }

    fn run(&self, plan: &Plan<'_>) -> Result<RunReport, RunError> {
        let mut frontier = Frontier::new(plan, self.name());
        let span = frontier.span();
        let _enter = span.enter();
        let env = plan.env();

        while let Some(index) = frontier.pop() {
            let start = Instant::now();
            let outcome = plan.node(index).run(&env);
            let execution = NodeExecution {
                start,
                duration: start.elapsed(),
            };
            frontier.settle(index, outcome, execution);
        }

        Ok(frontier.finish())
    }
}
