use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::time::{Duration, Instant};

use petgraph::stable_graph::NodeIndex;
use petgraph::visit::{EdgeRef, IntoEdgeReferences};

use crate::expand::ExecGraph;
use crate::graph::edge_label;

#[derive(Debug, Clone)]
pub struct NodeExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Run diagnostics and performance metrics.
///
/// Part of every [`RunReport`](crate::RunReport): start and duration of each
/// executed node, plus which nodes came from the cache and which failed.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// A map of executed node indices to their execution metrics.
    pub execution_times: HashMap<NodeIndex, NodeExecution>,
    pub cached: HashSet<NodeIndex>,
    pub failed: HashSet<NodeIndex>,
}

impl Diagnostics {
    /// Renders the expanded graph as a Mermaid diagram, color-coded by
    /// execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Cached
    /// * **Pink**: Failed
    /// * **Grey**: Skipped
    pub fn render_mermaid(&self, exec: &ExecGraph) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let times = &self.execution_times;
        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for t in times.values() {
            let secs = t.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }

        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for index in exec.graph.node_indices() {
            let name = exec.graph[index].fullname().replace('"', "\\\"");

            let (label_extra, color_code) = if let Some(execution) = times.get(&index) {
                let duration = execution.duration;
                let t = (duration.as_secs_f64() - min_time) / (max_time - min_time);

                // 0.0 green, 0.5 yellow, 1.0 red
                let (r, g, b) = if t < 0.5 {
                    let r = (255.0 * t * 2.0) as u8;
                    (r, 255, 0)
                } else {
                    let g = (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8;
                    (255, g, 0)
                };

                (format!("{duration:.2?}"), format!("#{r:02X}{g:02X}{b:02X}"))
            } else if self.cached.contains(&index) {
                ("Cached".to_string(), "#ADD8E6".to_string())
            } else if self.failed.contains(&index) {
                ("Failed".to_string(), "#F4A6B8".to_string())
            } else {
                ("Skipped".to_string(), "#D3D3D3".to_string())
            };

            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label_extra);
            let _ = writeln!(f, "    style {} fill:{}", index.index(), color_code);
        }

        for edge in exec.graph.edge_references() {
            let _ = writeln!(
                f,
                "    {} -- \"{}\" --> {}",
                edge.source().index(),
                edge_label(edge.weight()),
                edge.target().index()
            );
        }

        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::Fields;
    use crate::graph::Workflow;
    use crate::interface::Function;
    use crate::node::Node;

    #[test]
    fn test_render_mermaid_colors() {
        let unit = Function::new("unit", ["x"], ["out"], |_, _| Ok(Fields::new()));
        let mut wf = Workflow::new("wf").with_config(Config::new("/base"));
        wf.add(Node::new("a", unit.clone())).unwrap();
        wf.add(Node::new("b", unit.clone())).unwrap();
        wf.add(Node::new("c", unit)).unwrap();
        wf.connect("a", "out", "b", "x").unwrap();
        let exec = wf.expand().unwrap();

        let find = |name: &str| exec.graph.node_indices().find(|&i| exec.graph[i].name == name).unwrap();
        let mut diagnostics = Diagnostics::default();
        diagnostics.execution_times.insert(
            find("a"),
            NodeExecution {
                start: Instant::now(),
                duration: Duration::from_millis(5),
            },
        );
        diagnostics.cached.insert(find("b"));

        let text = diagnostics.render_mermaid(&exec);
        assert!(text.starts_with("graph LR"));
        assert!(text.contains(&format!("style {} fill:#00FF00", find("a").index())));
        assert!(text.contains(&format!("{}[\"wf.b\\nCached\"]", find("b").index())));
        assert!(text.contains(&format!("{}[\"wf.c\\nSkipped\"]", find("c").index())));
        assert!(text.contains("-- \"out → x\" -->"));
    }
}
