//! Rewrites a workflow into its executable form.
//!
//! Expansion runs in four passes over the flattened graph:
//!
//! 1. iterable nodes are expanded, most downstream first, replicating their
//!    descendants once per combination of values,
//! 2. pass-through nodes are elided, wiring their consumers straight to
//!    their producers,
//! 3. working directories and identities are laid out and checked for
//!    collisions,
//! 4. every node learns where its inputs come from and which of its outputs
//!    anyone reads.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::{Display, Formatter};

use camino::Utf8PathBuf;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::stable_graph::NodeIndex;
use petgraph::visit::{Dfs, EdgeRef, IntoEdgeReferences};

use crate::cache;
use crate::config::Config;
use crate::core::{Hash32, Value, path_safe};
use crate::error::ExpansionError;
use crate::graph::{Connection, FlatGraph, SourceField, Workflow, edge_label};
use crate::node::join::slot_name;
use crate::node::{InputSource, Kind, Node};
use crate::transform::Transforms;

/// A fully expanded workflow, ready to be handed to a backend.
#[derive(Debug)]
pub struct ExecGraph {
    pub(crate) name: String,
    pub(crate) config: Config,
    pub(crate) graph: FlatGraph,
    pub(crate) transforms: Transforms,
}

impl ExecGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    /// Looks a node up by its full dotted identity.
    pub fn node(&self, fullname: &str) -> Option<&Node> {
        self.nodes().find(|node| node.fullname() == fullname)
    }

    /// Every replica of the node originally called `name`.
    pub fn replicas(&self, name: &str) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self.nodes().filter(|node| node.name == name).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Nodes in dependency order.
    pub(crate) fn order(&self) -> Vec<NodeIndex> {
        // acyclic since expansion
        toposort(&self.graph, None).unwrap_or_default()
    }
}

impl Display for ExecGraph {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let label = node.fullname().replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), label)?;
        }

        for edge in self.graph.edge_references() {
            writeln!(
                f,
                "    {} -- \"{}\" --> {}",
                edge.source().index(),
                edge_label(edge.weight()),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

impl Workflow {
    /// Flattens, expands and lays out the workflow without running anything.
    pub fn expand(&self) -> Result<ExecGraph, ExpansionError> {
        let name = self.name.clone();
        let config = self.config.clone();
        let (mut graph, transforms) = self.clone().flatten()?;

        while let Some(index) = next_iterable(&graph)? {
            replicate(&mut graph, index)?;
        }
        elide(&mut graph)?;
        layout(&mut graph, &config)?;
        wire(&mut graph, &config);

        tracing::debug!("expanded '{name}' into {} nodes", graph.node_count());
        Ok(ExecGraph {
            name,
            config,
            graph,
            transforms,
        })
    }
}

fn sorted(graph: &FlatGraph) -> Result<Vec<NodeIndex>, ExpansionError> {
    toposort(graph, None).map_err(|cycle| ExpansionError::Cycle(graph[cycle.node_id()].fullname()))
}

/// The most downstream node still carrying iterables, so that inner loops
/// are expanded before outer ones.
fn next_iterable(graph: &FlatGraph) -> Result<Option<NodeIndex>, ExpansionError> {
    Ok(sorted(graph)?
        .into_iter()
        .rev()
        .find(|&index| graph[index].iterables.is_some()))
}

fn descendants(graph: &FlatGraph, start: NodeIndex) -> HashSet<NodeIndex> {
    let mut found = HashSet::new();
    let mut dfs = Dfs::new(graph, start);
    while let Some(index) = dfs.next(graph) {
        found.insert(index);
    }
    found
}

/// Letter used for the replica suffix: one past every letter already used.
fn next_letter<'a>(ids: impl Iterator<Item = &'a str>) -> char {
    ids.flat_map(|id| id.split('.').skip(1))
        .filter_map(|segment| segment.chars().next())
        .filter(char::is_ascii_lowercase)
        .max()
        .map(|c| (c as u8 + 1).min(b'z') as char)
        .unwrap_or('a')
}

type Edges = Vec<(NodeIndex, NodeIndex, Vec<Connection>)>;

fn replicate(graph: &mut FlatGraph, inode: NodeIndex) -> Result<(), ExpansionError> {
    let Some(iterables) = graph[inode].iterables.take() else {
        return Ok(());
    };
    let combos = iterables.combinations(&graph[inode])?;
    let source = graph[inode].fullname();

    // Joins over this node collect from every replica instead of being
    // replicated themselves, so their in-edges from the branch are cut first.
    let reach = descendants(graph, inode);
    let joins: Vec<NodeIndex> = reach
        .iter()
        .copied()
        .filter(|&index| matches!(&graph[index].kind, Kind::Join(spec) if spec.source == source))
        .collect();

    let mut join_edges: Edges = Vec::new();
    for &join in &joins {
        let cut: Vec<_> = graph
            .edges_directed(join, Direction::Incoming)
            .filter(|edge| reach.contains(&edge.source()))
            .map(|edge| (edge.id(), edge.source(), edge.weight().clone()))
            .collect();
        for (edge, from, connections) in cut {
            graph.remove_edge(edge);
            join_edges.push((from, join, connections));
        }
    }

    let position: HashMap<NodeIndex, usize> = sorted(graph)?
        .into_iter()
        .enumerate()
        .map(|(i, index)| (index, i))
        .collect();
    let members = descendants(graph, inode);
    let mut subgraph: Vec<NodeIndex> = members.iter().copied().collect();
    subgraph.sort_by_key(|index| position[index]);

    let mut level: HashMap<NodeIndex, usize> = HashMap::from([(inode, 0)]);
    for &index in &subgraph {
        let here = level.get(&index).copied().unwrap_or(0);
        for next in graph.neighbors_directed(index, Direction::Outgoing) {
            if members.contains(&next) {
                let entry = level.entry(next).or_insert(0);
                *entry = (*entry).max(here + 1);
            }
        }
    }

    let mut imports: Edges = Vec::new();
    let mut internal: Edges = Vec::new();
    for &index in &subgraph {
        for edge in graph.edges_directed(index, Direction::Incoming) {
            let record = (edge.source(), index, edge.weight().clone());
            if members.contains(&edge.source()) {
                internal.push(record);
            } else {
                imports.push(record);
            }
        }
    }

    let letter = next_letter(subgraph.iter().map(|&index| graph[index].id.as_str()));
    let width = combos.len().saturating_sub(1).to_string().len();
    let templates: Vec<(NodeIndex, Node)> = subgraph
        .iter()
        .filter_map(|&index| graph.remove_node(index).map(|node| (index, node)))
        .collect();

    tracing::debug!("replicating {} nodes below {source} {} times", templates.len(), combos.len());

    let slots: HashMap<NodeIndex, usize> = joins
        .iter()
        .filter_map(|&join| match &graph[join].kind {
            Kind::Join(spec) => Some((join, spec.slots)),
            _ => None,
        })
        .collect();

    for (i, combo) in combos.iter().enumerate() {
        let mut fields: Vec<&(String, Value)> = combo.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        let tag: String = fields
            .iter()
            .map(|(field, value)| format!("_{field}_{}", path_safe(value)))
            .collect();
        let bound: HashSet<&str> = combo.iter().map(|(field, _)| field.as_str()).collect();

        let mut copies = HashMap::new();
        for (index, template) in &templates {
            let mut node = template.clone();
            if *index == inode {
                for (field, value) in combo {
                    node.inputs.insert(field.clone(), value.clone());
                }
            }
            node.id = format!("{}.{letter}{i:0width$}", node.id);
            node.params.push((-(level.get(index).copied().unwrap_or(0) as isize), tag.clone()));
            copies.insert(*index, graph.add_node(node));
        }

        for (from, to, connections) in &internal {
            graph.add_edge(copies[from], copies[to], connections.clone());
        }

        for (from, to, connections) in &imports {
            let connections: Vec<Connection> = connections
                .iter()
                .filter(|c| *to != inode || !bound.contains(c.dest.as_str()))
                .cloned()
                .collect();
            if !connections.is_empty() {
                graph.add_edge(*from, copies[to], connections);
            }
        }

        for (from, join, connections) in &join_edges {
            let Some(&from) = copies.get(from) else {
                if i == 0 {
                    graph.add_edge(*from, *join, connections.clone());
                }
                continue;
            };
            let Kind::Join(spec) = &graph[*join].kind else {
                continue;
            };
            let base = slots.get(join).copied().unwrap_or(0);
            let connections: Vec<Connection> = connections
                .iter()
                .filter_map(|c| {
                    if spec.is_join_field(&c.dest) {
                        Some(Connection {
                            source: c.source.clone(),
                            dest: slot_name(&c.dest, base + i + 1),
                        })
                    } else {
                        (i == 0).then(|| c.clone())
                    }
                })
                .collect();
            if connections.is_empty() {
                continue;
            }
            match graph.find_edge(from, *join) {
                Some(edge) => graph[edge].extend(connections),
                None => {
                    graph.add_edge(from, *join, connections);
                }
            }
        }
    }

    for join in joins {
        if let Kind::Join(spec) = &mut graph[join].kind {
            spec.slots += combos.len();
        }
    }

    Ok(())
}

/// Removes pass-through nodes, reconnecting what fed them to what they fed.
fn elide(graph: &mut FlatGraph) -> Result<(), ExpansionError> {
    for index in sorted(graph)? {
        let node = &graph[index];
        if !node.interface.passthrough() || !matches!(node.kind, Kind::Plain) {
            continue;
        }

        let incoming: Vec<(NodeIndex, Connection)> = graph
            .edges_directed(index, Direction::Incoming)
            .flat_map(|edge| edge.weight().iter().map(move |c| (edge.source(), c.clone())))
            .collect();
        let outgoing: Vec<(NodeIndex, Connection)> = graph
            .edges_directed(index, Direction::Outgoing)
            .flat_map(|edge| edge.weight().iter().map(move |c| (edge.target(), c.clone())))
            .collect();

        for (to, out) in outgoing {
            let field = &out.source.field;

            if let Some((from, feed)) = incoming.iter().find(|(_, c)| &c.dest == field) {
                let transform = match (&feed.source.transform, &out.source.transform) {
                    (Some(first), Some(second)) => {
                        return Err(ExpansionError::TransformsInSeries {
                            from: format!("{}.{}", graph[*from].fullname(), feed.source.field),
                            to: format!("{}.{}", graph[to].fullname(), out.dest),
                            first: first.to_string(),
                            second: second.to_string(),
                        });
                    }
                    (first, second) => first.clone().or_else(|| second.clone()),
                };

                let connection = Connection {
                    source: SourceField {
                        field: feed.source.field.clone(),
                        transform,
                    },
                    dest: out.dest,
                };
                match graph.find_edge(*from, to) {
                    Some(edge) => graph[edge].push(connection),
                    None => {
                        graph.add_edge(*from, to, vec![connection]);
                    }
                }
            } else if let Some(value) = graph[index].inputs.get(field).cloned() {
                let transform = match (graph[index].deferred.get(field), out.source.transform) {
                    (Some(first), Some(second)) => {
                        return Err(ExpansionError::TransformsInSeries {
                            from: format!("{}.{field}", graph[index].fullname()),
                            to: format!("{}.{}", graph[to].fullname(), out.dest),
                            first: first.to_string(),
                            second: second.to_string(),
                        });
                    }
                    (first, second) => first.cloned().or(second),
                };
                let node = &mut graph[to];
                match transform {
                    Some(transform) => {
                        node.deferred.insert(out.dest.clone(), transform);
                    }
                    None => {
                        node.deferred.remove(&out.dest);
                    }
                }
                node.inputs.insert(out.dest, value);
            }
        }

        graph.remove_node(index);
    }

    Ok(())
}

/// Assigns working directories and checks identities.
fn layout(graph: &mut FlatGraph, config: &Config) -> Result<(), ExpansionError> {
    let mut identities = HashSet::new();
    let mut dirs: HashMap<Utf8PathBuf, String> = HashMap::new();

    let indices: Vec<_> = graph.node_indices().collect();
    for index in indices {
        let node = &mut graph[index];
        let fullname = node.fullname();
        if !identities.insert(fullname.clone()) {
            return Err(ExpansionError::IdentityCollision(fullname));
        }

        node.params.sort_by_key(|(rank, _)| *rank);

        let mut dir = config.base_dir.clone();
        for part in &node.hierarchy {
            dir.push(part);
        }
        for (_, tag) in &node.params {
            if config.parameterize_dirs {
                dir.push(tag);
            } else {
                dir.push(Hash32::hash(tag).to_hex());
            }
        }
        dir.push(&node.name);

        if let Some(first) = dirs.insert(dir.clone(), fullname.clone()) {
            return Err(ExpansionError::DirectoryCollision {
                first,
                second: fullname,
                dir: dir.into_string(),
            });
        }
        node.output_dir = dir;
    }

    Ok(())
}

/// Fills in input sources and needed outputs from the final edges.
fn wire(graph: &mut FlatGraph, config: &Config) {
    let indices: Vec<_> = graph.node_indices().collect();
    for index in indices {
        let sources: Vec<(String, InputSource)> = graph
            .edges_directed(index, Direction::Incoming)
            .flat_map(|edge| {
                let upstream = &graph[edge.source()];
                let result_file = cache::result_file(&upstream.output_dir, &upstream.name);
                let node = upstream.fullname();
                edge.weight().iter().map(move |c| {
                    let source = InputSource {
                        node: node.clone(),
                        field: c.source.field.clone(),
                        transform: c.source.transform.clone(),
                        result_file: result_file.clone(),
                        index: Some(edge.source()),
                    };
                    (c.dest.clone(), source)
                })
            })
            .collect();

        let needed: BTreeSet<String> = graph
            .edges_directed(index, Direction::Outgoing)
            .flat_map(|edge| edge.weight().iter().map(|c| c.source.field.clone()))
            .collect();

        let node = &mut graph[index];
        node.input_source = sources.into_iter().collect();
        node.needed_outputs = (config.remove_unnecessary_outputs && !needed.is_empty()).then_some(needed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Fields;
    use crate::error::GraphError;
    use crate::interface::{FieldKind, FieldSpec, Function, Identity, Spec};
    use crate::node::Iterables;
    use crate::transform::Transform;
    use serde_json::json;

    fn unit(inputs: &[&str], outputs: &[&str]) -> Function {
        Function::new(
            "unit",
            inputs.iter().copied(),
            outputs.iter().copied(),
            |_, _| Ok(Fields::new()),
        )
    }

    fn workflow() -> Workflow {
        Workflow::new("wf").with_config(Config::new("/base"))
    }

    /// `a -> b -> c` with `a` sweeping `n` over `[1, 2]`.
    fn chain() -> Workflow {
        let mut wf = workflow();
        wf.add(Node::new("a", unit(&["n"], &["out"])).iterables(Iterables::new().field("n", [1, 2])))
            .unwrap();
        wf.add(Node::new("b", unit(&["x"], &["out", "log"]))).unwrap();
        wf.add(Node::new("c", unit(&["x"], &["out"]))).unwrap();
        wf.connect("a", "out", "b", "x").unwrap();
        wf.connect("b", "out", "c", "x").unwrap();
        wf
    }

    #[test]
    fn test_replicates_descendants() {
        let exec = chain().expand().unwrap();
        assert_eq!(exec.len(), 6);

        let ids: Vec<&str> = exec.replicas("c").iter().map(|node| node.id()).collect();
        assert_eq!(ids, vec!["c.a0", "c.a1"]);

        let c0 = exec.node("wf.c.a0").unwrap();
        assert_eq!(c0.parameterization(), vec!["_n_1"]);
        assert_eq!(c0.output_dir().as_str(), "/base/wf/_n_1/c");
        assert_eq!(exec.node("wf.a.a1").unwrap().inputs().get("n"), Some(&json!(2)));

        let b1 = exec.node("wf.b.a1").unwrap();
        let source = &b1.input_source()["x"];
        assert_eq!(source.node, "wf.a.a1");
        assert_eq!(source.result_file.as_str(), "/base/wf/_n_2/a/result_a.cbor");
    }

    #[test]
    fn test_needed_outputs() {
        let exec = chain().expand().unwrap();
        let b = exec.node("wf.b.a0").unwrap();
        assert_eq!(b.needed_outputs().unwrap().iter().collect::<Vec<_>>(), vec!["out"]);
        assert!(exec.node("wf.c.a0").unwrap().needed_outputs().is_none());

        let mut wf = chain();
        wf.config_mut().remove_unnecessary_outputs = false;
        let exec = wf.expand().unwrap();
        assert!(exec.node("wf.b.a0").unwrap().needed_outputs().is_none());
    }

    #[test]
    fn test_chained_iterables_nest_directories() {
        let mut wf = chain();
        wf.add(Node::new("s", unit(&["x", "k"], &["out"])).iterables(Iterables::new().field("k", ["p", "q", "r"])))
            .unwrap();
        wf.add(Node::new("t", unit(&["x"], &["out"]))).unwrap();
        wf.connect("b", "out", "s", "x").unwrap();
        wf.connect("s", "out", "t", "x").unwrap();

        let exec = wf.expand().unwrap();
        // a, b, c twice; s, t six times
        assert_eq!(exec.len(), 18);

        let t = exec.node("wf.t.a2.b1").unwrap();
        assert_eq!(t.parameterization(), vec!["_n_2", "_k_r"]);
        assert_eq!(t.output_dir().as_str(), "/base/wf/_n_2/_k_r/t");
    }

    #[test]
    fn test_synchronized_iterables() {
        let mut wf = workflow();
        let iterables = Iterables::new().field("x", [1, 2]).field("y", ["a", "b"]).synchronize();
        wf.add(Node::new("a", unit(&["x", "y"], &["out"])).iterables(iterables)).unwrap();

        let exec = wf.expand().unwrap();
        let dirs: Vec<String> = exec.replicas("a").iter().map(|n| n.output_dir().to_string()).collect();
        assert_eq!(dirs, vec!["/base/wf/_x_1_y_a/a", "/base/wf/_x_2_y_b/a"]);
    }

    #[test]
    fn test_hashed_directories() {
        let mut wf = chain();
        wf.config_mut().parameterize_dirs = false;
        let exec = wf.expand().unwrap();

        let dir = exec.node("wf.c.a0").unwrap().output_dir();
        assert_eq!(dir.parent().unwrap().file_name().unwrap(), Hash32::hash("_n_1").to_hex());
    }

    #[test]
    fn test_duplicate_values_collide() {
        let mut wf = workflow();
        wf.add(Node::new("a", unit(&["n"], &["out"])).iterables(Iterables::new().field("n", [1, 1])))
            .unwrap();
        assert!(matches!(wf.expand(), Err(ExpansionError::DirectoryCollision { .. })));
    }

    #[test]
    fn test_join_collects_every_branch() {
        let collect = Function::with_spec(
            "collect",
            Spec::new()
                .field("items", FieldSpec::list(FieldKind::Int))
                .field("label", FieldSpec::str()),
            Spec::any(["out"]),
            |_, _| Ok(Fields::new()),
        );

        let mut wf = chain();
        wf.add(Node::join("j", collect, "a", ["items"])).unwrap();
        wf.add(Node::new("label", unit(&[], &["text"]))).unwrap();
        wf.connect("b", "out", "j", "items").unwrap();
        wf.connect("label", "text", "j", "label").unwrap();

        let exec = wf.expand().unwrap();
        assert_eq!(exec.replicas("j").len(), 1);

        let j = exec.node("wf.j").unwrap();
        let slots: Vec<(&str, &str)> = j
            .input_source()
            .iter()
            .map(|(field, source)| (field.as_str(), source.node.as_str()))
            .collect();
        assert_eq!(
            slots,
            vec![("items1", "wf.b.a0"), ("items2", "wf.b.a1"), ("label", "wf.label")]
        );
        assert!(matches!(&j.kind, Kind::Join(spec) if spec.slots == 2));
    }

    #[test]
    fn test_unknown_join_source() {
        let mut wf = chain();
        wf.add(Node::join("j", unit(&["items"], &[]), "nope", ["items"])).unwrap();
        assert!(matches!(wf.expand(), Err(ExpansionError::UnknownJoinSource { .. })));
    }

    #[test]
    fn test_identity_elided() {
        let mut wf = workflow();
        wf.add(Node::new("src", unit(&[], &["out"]))).unwrap();
        wf.add(
            Node::new("ident", Identity::new(["n", "path"]))
                .iterables(Iterables::new().field("n", [1, 2, 3])),
        )
        .unwrap();
        wf.add(Node::new("b", unit(&["n", "m", "path"], &["out"]))).unwrap();
        wf.connect("src", "out", "ident", "path").unwrap();
        wf.connect("ident", "n", "b", "n").unwrap();
        wf.connect("ident", ("n", Transform::new("wrap")), "b", "m").unwrap();
        wf.connect("ident", "path", "b", "path").unwrap();

        let exec = wf.expand().unwrap();
        assert!(exec.replicas("ident").is_empty());
        assert_eq!(exec.replicas("b").len(), 3);

        let b = exec.node("wf.b.a2").unwrap();
        assert_eq!(b.inputs().get("n"), Some(&json!(3)));
        // the static value travels as is, its transform runs with the node
        assert_eq!(b.inputs().get("m"), Some(&json!(3)));
        assert_eq!(b.deferred.get("m"), Some(&Transform::new("wrap")));
        assert!(!b.deferred.contains_key("n"));
        assert_eq!(b.input_source()["path"].node, "wf.src");
        assert_eq!(b.output_dir().as_str(), "/base/wf/_n_3/b");
    }

    #[test]
    fn test_failing_transform_on_static_input_waits_for_run() {
        let mut wf = workflow();
        wf.add(Node::new("ident", Identity::new(["x"])).input("x", 4).unwrap())
            .unwrap();
        wf.add(Node::new("b", unit(&["x"], &[]))).unwrap();
        wf.connect("ident", ("x", Transform::new("length")), "b", "x").unwrap();

        let exec = wf.expand().unwrap();
        let b = exec.node("wf.b").unwrap();
        assert_eq!(b.inputs().get("x"), Some(&json!(4)));
        assert_eq!(b.deferred.get("x"), Some(&Transform::new("length")));
    }

    #[test]
    fn test_transforms_in_series_rejected() {
        let mut wf = workflow();
        wf.add(Node::new("src", unit(&[], &["out"]))).unwrap();
        wf.add(Node::new("ident", Identity::new(["x"]))).unwrap();
        wf.add(Node::new("b", unit(&["x"], &[]))).unwrap();
        wf.connect("src", ("out", Transform::new("wrap")), "ident", "x").unwrap();
        wf.connect("ident", ("x", Transform::new("length")), "b", "x").unwrap();

        assert!(matches!(wf.expand(), Err(ExpansionError::TransformsInSeries { .. })));
    }

    #[test]
    fn test_nested_workflow_layout() {
        let mut outer = Workflow::new("outer").with_config(Config::new("/base"));
        outer.add_workflow(chain()).unwrap();
        outer.add(Node::new("sink", unit(&["x"], &[]))).unwrap();
        outer.connect("wf", "c.out", "sink", "x").unwrap();

        assert!(matches!(
            outer.add(Node::new("wf", unit(&[], &[]))),
            Err(GraphError::DuplicateNode { .. })
        ));

        let exec = outer.expand().unwrap();
        let c = exec.node("outer.wf.c.a1").unwrap();
        assert_eq!(c.output_dir().as_str(), "/base/outer/wf/_n_2/c");
        assert_eq!(
            exec.node("outer.sink.a0").unwrap().output_dir().as_str(),
            "/base/outer/_n_1/sink"
        );
        // sink hangs off both replicas of c, so it is replicated as well
        assert_eq!(exec.replicas("sink").len(), 2);
    }

    #[test]
    fn test_next_letter() {
        assert_eq!(next_letter(["a", "b"].into_iter()), 'a');
        assert_eq!(next_letter(["a.a0", "b.c1.a0"].into_iter()), 'd');
    }
}
