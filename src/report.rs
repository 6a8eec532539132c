//! Human readable and machine readable records of what happened.
//!
//! Per node, `_report/report.md` in the working directory describes the
//! inputs before the run and appends outputs, runtime or error after it.
//! Per run, the engine can leave crash dumps, a provenance record and a
//! resource usage log.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use serde_json::json;

use crate::cache::NodeResult;
use crate::core::Fields;
use crate::engine::{ResultStore, RunReport};
use crate::error::NodeError;
use crate::expand::ExecGraph;
use crate::node::Node;
use crate::utils::{hostname, unix_secs, write_atomic};

pub(crate) const REPORT_DIR: &str = "_report";
const REPORT_FILE: &str = "report.md";
pub(crate) const PROVENANCE_FILE: &str = "provenance.json";
pub(crate) const RESOURCES_FILE: &str = "resources.jsonl";

fn fields_list(out: &mut String, fields: &Fields) {
    if fields.is_empty() {
        out.push_str("None\n");
    }
    for (name, value) in fields {
        let _ = writeln!(out, "* {name} : {value}");
    }
}

pub(crate) fn write_pre(dir: &Utf8Path, node: &Node, inputs: &Fields) -> std::io::Result<()> {
    let report_dir = dir.join(REPORT_DIR);
    fs::create_dir_all(&report_dir)?;

    let mut out = String::new();
    let _ = writeln!(out, "# Node: {}\n", node.fullname());
    let _ = writeln!(out, "* Interface: `{}`", node.interface().name());
    let _ = writeln!(out, "* Hierarchy: {}", node.hierarchy().join("."));
    let _ = writeln!(out, "* Working directory: `{dir}`");
    for tag in node.parameterization() {
        let _ = writeln!(out, "* Parameter: `{tag}`");
    }
    if let Some(command) = node.interface().command_line(inputs) {
        let _ = writeln!(out, "* Command: `{command}`");
    }

    out.push_str("\n## Original Inputs\n\n");
    fields_list(&mut out, inputs);

    write_atomic(&report_dir.join(REPORT_FILE), out.as_bytes())
}

pub(crate) fn write_post(dir: &Utf8Path, outcome: Result<&NodeResult, &NodeError>) -> std::io::Result<()> {
    let report_dir = dir.join(REPORT_DIR);
    fs::create_dir_all(&report_dir)?;

    let mut out = String::new();
    match outcome {
        Ok(result) => {
            out.push_str("\n## Execution Outputs\n\n");
            fields_list(&mut out, &result.outputs);

            if let Some(runtime) = &result.runtime {
                out.push_str("\n## Runtime info\n\n");
                let _ = writeln!(out, "* Hostname: {}", runtime.hostname);
                let _ = writeln!(out, "* Duration: {:.3?}", runtime.duration);
                if let Some(code) = runtime.returncode {
                    let _ = writeln!(out, "* Return code: {code}");
                }
                for (label, text) in [("Standard output", &runtime.stdout), ("Standard error", &runtime.stderr)] {
                    if let Some(text) = text.as_deref().filter(|t| !t.trim().is_empty()) {
                        let _ = writeln!(out, "\n### {label}\n\n```\n{}\n```", text.trim_end());
                    }
                }
            }
        }
        Err(error) => {
            let _ = writeln!(out, "\n## Error\n\n```\n{error}\n```");
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(report_dir.join(REPORT_FILE))?;
    file.write_all(out.as_bytes())
}

fn error_chain(error: &NodeError) -> String {
    let mut out = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        let _ = write!(out, "\n  caused by: {inner}");
        source = inner.source();
    }
    out
}

/// Writes a crash dump for a failed node into `dir`.
pub(crate) fn crash_dump(dir: &Utf8Path, exec: &ExecGraph, node: &Node, error: &NodeError) -> std::io::Result<Utf8PathBuf> {
    fs::create_dir_all(dir)?;

    let fullname = node.fullname();
    let safe: String = fullname
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '-' })
        .collect();
    let path = dir.join(format!("crash-{}-{safe}.txt", unix_secs()));

    let mut out = String::new();
    let _ = writeln!(out, "Node: {fullname}");
    let _ = writeln!(out, "Interface: {}", node.interface().name());
    let _ = writeln!(out, "Working directory: {}", node.output_dir());
    let _ = writeln!(out, "Parameterization: {:?}", node.parameterization());
    let _ = writeln!(out, "Host: {}", hostname());

    out.push_str("\nStatic inputs:\n");
    fields_list(&mut out, node.inputs());
    out.push_str("\nConnected inputs:\n");
    for (field, source) in node.input_source() {
        let _ = writeln!(out, "* {field} <- {}.{}", source.node, source.field);
    }

    let _ = writeln!(out, "\nError:\n{}", error_chain(error));
    let _ = writeln!(out, "\nGraph:\n{exec}");

    fs::write(&path, out)?;
    Ok(path)
}

fn run_dir(exec: &ExecGraph) -> Utf8PathBuf {
    exec.config.base_dir.join(&exec.name)
}

/// Records which nodes ran where, under which fingerprint and with what
/// outcome, together with the edges between them.
pub(crate) fn write_provenance(exec: &ExecGraph, report: &RunReport, results: &ResultStore) -> std::io::Result<Utf8PathBuf> {
    let mut status: HashMap<&str, &str> = HashMap::new();
    for id in &report.executed {
        status.insert(id, "executed");
    }
    for id in &report.cached {
        status.insert(id, "cached");
    }
    for id in &report.skipped {
        status.insert(id, "skipped");
    }
    for failure in &report.failures {
        status.insert(&failure.node, "failed");
    }

    let nodes: Vec<_> = exec
        .graph
        .node_indices()
        .map(|index| {
            let node = &exec.graph[index];
            let fullname = node.fullname();
            json!({
                "id": fullname,
                "name": node.name(),
                "interface": node.interface().name(),
                "parameterization": node.parameterization(),
                "directory": node.output_dir(),
                "status": status.get(fullname.as_str()).copied().unwrap_or("pending"),
                "fingerprint": results.get(index).map(|result| result.fingerprint.clone()),
            })
        })
        .collect();

    let edges: Vec<_> = exec
        .graph
        .edge_references()
        .map(|edge| {
            let connections: Vec<_> = edge
                .weight()
                .iter()
                .map(|c| json!([c.source.to_string(), c.dest]))
                .collect();
            json!({
                "from": exec.graph[edge.source()].fullname(),
                "to": exec.graph[edge.target()].fullname(),
                "connections": connections,
            })
        })
        .collect();

    let doc = json!({
        "workflow": exec.name,
        "finished": unix_secs(),
        "host": hostname(),
        "nodes": nodes,
        "edges": edges,
    });

    let dir = run_dir(exec);
    fs::create_dir_all(&dir)?;
    let path = dir.join(PROVENANCE_FILE);
    let data = serde_json::to_vec_pretty(&doc).map_err(std::io::Error::other)?;
    write_atomic(&path, &data)?;
    Ok(path)
}

/// Appends one line describing an executed node to the resource log.
pub(crate) fn log_resources(exec: &ExecGraph, node: &Node, duration: Duration) -> std::io::Result<()> {
    let dir = run_dir(exec);
    fs::create_dir_all(&dir)?;

    let resources = node.effective_resources();
    let line = json!({
        "node": node.fullname(),
        "start": unix_secs(),
        "duration": duration.as_secs_f64(),
        "threads": resources.threads,
        "memory_gb": resources.memory_gb,
    });

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(RESOURCES_FILE))?;
    writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{Function, Runtime};
    use crate::node::tests::tempdir;

    #[test]
    fn test_report_pre_and_post() {
        let (_guard, root) = tempdir();
        let node = Node::new("n", Function::new("f", ["x"], ["y"], |_, _| Ok(Fields::new())));
        let inputs = Fields::new().with("x", 1);

        write_pre(&root, &node, &inputs).unwrap();
        let result = NodeResult {
            interface: "f".into(),
            fingerprint: "00".into(),
            runtime: Some(Runtime {
                stdout: Some("hello".into()),
                ..Runtime::default()
            }),
            inputs,
            outputs: Fields::new().with("y", 2),
        };
        write_post(&root, Ok(&result)).unwrap();

        let text = fs::read_to_string(root.join("_report/report.md")).unwrap();
        assert!(text.starts_with("# Node: n"));
        assert!(text.contains("* x : 1"));
        assert!(text.contains("## Execution Outputs"));
        assert!(text.contains("* y : 2"));
        assert!(text.contains("hello"));
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let error = NodeError::Upstream {
            node: "a".into(),
            error: crate::error::CacheError::Decode("bad".into()),
        };
        let text = error_chain(&error);
        assert!(text.contains("upstream node 'a'"));
        assert!(text.contains("bad"));
    }
}
