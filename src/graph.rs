//! Workflows: DAGs of nodes and nested workflows.
//!
//! A [`Workflow`] is assembled with [`add`](Workflow::add),
//! [`add_workflow`](Workflow::add_workflow) and
//! [`connect`](Workflow::connect). Every connection is checked before it
//! lands, so a workflow is always acyclic and every input has at most one
//! writer. Fields of nested workflows are addressed with dotted names,
//! `node.field` or `sub.node.field`, and checked when the workflow is
//! flattened.
//!
//! ```rust
//! use nagare::{Fields, Function, Node, Workflow};
//!
//! let double = Function::new("double", ["x"], ["y"], |_, inputs| {
//!     Ok(Fields::new().with("y", inputs.int("x")? * 2))
//! });
//!
//! let mut wf = Workflow::new("example");
//! wf.add(Node::new("a", double.clone()).input("x", 1).unwrap()).unwrap();
//! wf.add(Node::new("b", double)).unwrap();
//! wf.connect("a", "y", "b", "x").unwrap();
//!
//! // a second writer for the same input is refused
//! assert!(wf.connect("a", "y", "b", "x").is_err());
//! ```

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::graph::DiGraph;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};

use crate::config::Config;
use crate::core::Value;
use crate::error::{ExpansionError, GraphError};
use crate::node::{Kind, Node};
use crate::transform::{Transform, TransformFn, Transforms};

/// The flat form of a workflow: nodes only, with hierarchy filled in.
pub(crate) type FlatGraph = StableDiGraph<Node, Vec<Connection>>;

/// The source side of a connection: an output field, optionally routed
/// through a registered transform.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceField {
    pub field: String,
    pub transform: Option<Transform>,
}

impl SourceField {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            transform: None,
        }
    }

    pub fn with(field: impl Into<String>, transform: Transform) -> Self {
        Self {
            field: field.into(),
            transform: Some(transform),
        }
    }
}

impl From<&str> for SourceField {
    fn from(field: &str) -> Self {
        Self::new(field)
    }
}

impl From<String> for SourceField {
    fn from(field: String) -> Self {
        Self::new(field)
    }
}

impl From<(&str, Transform)> for SourceField {
    fn from((field, transform): (&str, Transform)) -> Self {
        Self::with(field, transform)
    }
}

impl Display for SourceField {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.transform {
            Some(transform) => write!(f, "{} | {transform}", self.field),
            None => f.write_str(&self.field),
        }
    }
}

/// One field-to-field link carried by an edge.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub source: SourceField,
    pub dest: String,
}

#[derive(Debug, Clone)]
pub(crate) enum Element {
    Node(Node),
    Workflow(Workflow),
}

impl Element {
    fn name(&self) -> &str {
        match self {
            Element::Node(node) => &node.name,
            Element::Workflow(workflow) => &workflow.name,
        }
    }
}

/// A DAG of nodes and nested workflows.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub(crate) name: String,
    pub(crate) config: Config,
    pub(crate) graph: StableDiGraph<Element, Vec<Connection>>,
    pub(crate) transforms: Transforms,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Config::default(),
            graph: StableDiGraph::new(),
            transforms: Transforms::new(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Makes a transform available to connections of this workflow and of
    /// every workflow it is nested into.
    pub fn register_transform(&mut self, name: impl Into<String>, func: TransformFn) {
        self.transforms.register(name, func);
    }

    fn find(&self, name: &str) -> Option<NodeIndex> {
        self.graph
            .node_indices()
            .find(|&index| self.graph[index].name() == name)
    }

    fn check_name(&self, name: &str) -> Result<(), GraphError> {
        if name.is_empty() || name.contains('.') {
            return Err(GraphError::InvalidName(name.to_string()));
        }
        if name == self.name {
            return Err(GraphError::ShadowsWorkflow(name.to_string()));
        }
        if self.find(name).is_some() {
            return Err(GraphError::DuplicateNode {
                workflow: self.name.clone(),
                node: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn add(&mut self, node: Node) -> Result<(), GraphError> {
        self.check_name(&node.name)?;
        self.graph.add_node(Element::Node(node));
        Ok(())
    }

    /// Nests `workflow` as a single element. Its transforms become available
    /// here as well.
    pub fn add_workflow(&mut self, workflow: Workflow) -> Result<(), GraphError> {
        self.check_name(&workflow.name)?;
        self.transforms.merge(&workflow.transforms);
        self.graph.add_node(Element::Workflow(workflow));
        Ok(())
    }

    /// Looks up a node by its dotted path, e.g. `sub.node`.
    pub fn node(&self, path: &str) -> Option<&Node> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };

        match (&self.graph[self.find(head)?], rest) {
            (Element::Node(node), None) => Some(node),
            (Element::Workflow(sub), Some(rest)) => sub.node(rest),
            _ => None,
        }
    }

    /// Sets a static input on the node at `path`.
    pub fn set_input(&mut self, path: &str, field: &str, value: impl Into<Value>) -> Result<(), GraphError> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let unknown = || GraphError::UnknownNode {
            workflow: self.name.clone(),
            node: path.to_string(),
        };

        let index = self.find(head).ok_or_else(unknown)?;
        match (&mut self.graph[index], rest) {
            (Element::Node(node), None) => node.set_input(field, value),
            (Element::Workflow(sub), Some(rest)) => sub.set_input(rest, field, value),
            _ => Err(unknown()),
        }
    }

    pub fn connect(
        &mut self,
        src: &str,
        field: impl Into<SourceField>,
        dst: &str,
        dest_field: &str,
    ) -> Result<(), GraphError> {
        self.connect_batch([(src, dst, vec![(field.into(), dest_field)])])
    }

    /// Connects a list of `(source, destination, [(source field, destination
    /// field)])` entries. Either all of them land or none does.
    pub fn connect_batch<'a, I>(&mut self, batch: I) -> Result<(), GraphError>
    where
        I: IntoIterator<Item = (&'a str, &'a str, Vec<(SourceField, &'a str)>)>,
    {
        let mut staged = self.graph.clone();
        for (src, dst, pairs) in batch {
            self.stage(&mut staged, src, dst, pairs)?;
        }
        self.graph = staged;
        Ok(())
    }

    fn stage(
        &self,
        graph: &mut StableDiGraph<Element, Vec<Connection>>,
        src: &str,
        dst: &str,
        pairs: Vec<(SourceField, &str)>,
    ) -> Result<(), GraphError> {
        if src == self.name || dst == self.name {
            return Err(GraphError::SelfConnection(self.name.clone()));
        }

        let unknown = |node: &str| GraphError::UnknownNode {
            workflow: self.name.clone(),
            node: node.to_string(),
        };
        let s = self.find(src).ok_or_else(|| unknown(src))?;
        let d = self.find(dst).ok_or_else(|| unknown(dst))?;

        let mut leaves = Leaves::of(graph);
        let mut accepted: Vec<Connection> = Vec::with_capacity(pairs.len());

        for (source, dest) in pairs {
            // Nested workflows and pass-through units are checked on flattening.
            if let Element::Node(node) = &graph[s]
                && !node.interface.passthrough()
                && !node.is_output(&source.field)
            {
                return Err(GraphError::UnknownOutput {
                    node: src.to_string(),
                    field: source.field,
                });
            }
            if let Element::Node(node) = &graph[d]
                && !node.interface.passthrough()
                && !node.is_input(dest)
            {
                return Err(GraphError::UnknownInput {
                    node: dst.to_string(),
                    field: dest.to_string(),
                });
            }
            if let Some(transform) = &source.transform {
                self.transforms.check(transform)?;
            }

            let existing = writer(graph, d, dest).or_else(|| {
                accepted
                    .iter()
                    .find(|c| c.dest == dest)
                    .map(|c| format!("{src}.{}", c.source.field))
            });
            if let Some(existing) = existing {
                return Err(GraphError::AlreadyConnected {
                    node: dst.to_string(),
                    field: dest.to_string(),
                    existing,
                    attempted: format!("{src}.{}", source.field),
                });
            }

            if let (Some(from), Some(to)) = (endpoint(&graph[s], &source.field), endpoint(&graph[d], dest)) {
                if leaves.reaches(&to, &from) {
                    return Err(GraphError::Cycle {
                        from: src.to_string(),
                        to: dst.to_string(),
                    });
                }
                leaves.link(from, to);
            }

            accepted.push(Connection {
                source,
                dest: dest.to_string(),
            });
        }

        match graph.find_edge(s, d) {
            Some(edge) => graph[edge].extend(accepted),
            None => {
                graph.add_edge(s, d, accepted);
            }
        }

        Ok(())
    }

    /// Removes one connection, dropping the edge once it carries none.
    pub fn disconnect(&mut self, src: &str, field: &str, dst: &str, dest_field: &str) -> Result<(), GraphError> {
        let not_connected = || GraphError::NotConnected {
            from: format!("{src}.{field}"),
            to: format!("{dst}.{dest_field}"),
        };

        let s = self.find(src).ok_or_else(not_connected)?;
        let d = self.find(dst).ok_or_else(not_connected)?;
        let edge = self.graph.find_edge(s, d).ok_or_else(not_connected)?;

        let connections = &mut self.graph[edge];
        let before = connections.len();
        connections.retain(|c| !(c.source.field == field && c.dest == dest_field));
        if connections.len() == before {
            return Err(not_connected());
        }
        if connections.is_empty() {
            self.graph.remove_edge(edge);
        }
        Ok(())
    }

    /// Inputs not fed by any connection, as dotted names.
    pub fn inputs(&self) -> Vec<String> {
        let mut inputs = Vec::new();
        for index in self.graph.node_indices() {
            let (name, fields): (&str, Vec<String>) = match &self.graph[index] {
                Element::Node(node) => (&node.name, node.interface.inputs().names().map(String::from).collect()),
                Element::Workflow(sub) => (&sub.name, sub.inputs()),
            };
            for field in fields {
                if writer(&self.graph, index, &field).is_none() {
                    inputs.push(format!("{name}.{field}"));
                }
            }
        }
        inputs
    }

    /// Every output, as dotted names.
    pub fn outputs(&self) -> Vec<String> {
        let mut outputs = Vec::new();
        for index in self.graph.node_indices() {
            match &self.graph[index] {
                Element::Node(node) => outputs.extend(
                    node.interface
                        .outputs()
                        .names()
                        .map(|field| format!("{}.{field}", node.name)),
                ),
                Element::Workflow(sub) => {
                    outputs.extend(sub.outputs().into_iter().map(|field| format!("{}.{field}", sub.name)))
                }
            }
        }
        outputs
    }

    /// Inlines every nested workflow, producing a graph of nodes only.
    pub(crate) fn flatten(self) -> Result<(FlatGraph, Transforms), ExpansionError> {
        let mut out = FlatGraph::default();
        let mut transforms = Transforms::new();
        self.flatten_into(&[], &mut out, &mut transforms)?;
        Ok((out, transforms))
    }

    /// Moves the content of `self` into `out`, returning where each node
    /// ended up, keyed by its dotted path relative to `self`.
    fn flatten_into(
        self,
        prefix: &[String],
        out: &mut FlatGraph,
        transforms: &mut Transforms,
    ) -> Result<HashMap<String, NodeIndex>, ExpansionError> {
        let Workflow {
            name,
            mut graph,
            transforms: own,
            ..
        } = self;
        transforms.merge(&own);

        let mut hierarchy = prefix.to_vec();
        hierarchy.push(name);

        let edges: Vec<_> = graph
            .edge_references()
            .map(|edge| (edge.source(), edge.target(), edge.weight().clone()))
            .collect();

        let mut resolved = HashMap::new();
        let mut elements = HashMap::new();
        let mut direct = Vec::new();

        let indices: Vec<_> = graph.node_indices().collect();
        for index in indices {
            match graph.remove_node(index) {
                Some(Element::Node(mut node)) => {
                    node.hierarchy = hierarchy.clone();
                    let local = node.name.clone();
                    let flat = out.add_node(node);
                    resolved.insert(local.clone(), flat);
                    elements.insert(index, (local, false));
                    direct.push(flat);
                }
                Some(Element::Workflow(sub)) => {
                    let local = sub.name.clone();
                    for (path, flat) in sub.flatten_into(&hierarchy, out, transforms)? {
                        resolved.insert(format!("{local}.{path}"), flat);
                    }
                    elements.insert(index, (local, true));
                }
                None => {}
            }
        }

        for flat in direct {
            if let Kind::Join(spec) = &out[flat].kind {
                let source = resolved.get(&spec.source).copied().ok_or_else(|| {
                    ExpansionError::UnknownJoinSource {
                        node: out[flat].fullname(),
                        join_source: spec.source.clone(),
                    }
                })?;
                let source = out[source].fullname();
                if let Kind::Join(spec) = &mut out[flat].kind {
                    spec.source = source;
                }
            }
        }

        for (s, d, connections) in edges {
            let (s_name, s_nested) = &elements[&s];
            let (d_name, d_nested) = &elements[&d];

            for connection in connections {
                let (src, field) = resolve(&resolved, s_name, *s_nested, &connection.source.field)
                    .ok_or_else(|| GraphError::UnknownOutput {
                        node: s_name.clone(),
                        field: connection.source.field.clone(),
                    })?;
                let (dst, dest) = resolve(&resolved, d_name, *d_nested, &connection.dest).ok_or_else(|| {
                    GraphError::UnknownInput {
                        node: d_name.clone(),
                        field: connection.dest.clone(),
                    }
                })?;

                if !out[src].is_output(&field) {
                    return Err(GraphError::UnknownOutput {
                        node: out[src].fullname(),
                        field,
                    }
                    .into());
                }
                if !out[dst].is_input(&dest) {
                    return Err(GraphError::UnknownInput {
                        node: out[dst].fullname(),
                        field: dest,
                    }
                    .into());
                }
                if let Some(existing) = flat_writer(out, dst, &dest) {
                    return Err(GraphError::AlreadyConnected {
                        node: out[dst].fullname(),
                        field: dest,
                        existing,
                        attempted: format!("{}.{field}", out[src].fullname()),
                    }
                    .into());
                }

                let connection = Connection {
                    source: SourceField {
                        field,
                        transform: connection.source.transform,
                    },
                    dest,
                };
                match out.find_edge(src, dst) {
                    Some(edge) => out[edge].push(connection),
                    None => {
                        out.add_edge(src, dst, vec![connection]);
                    }
                }
            }
        }

        Ok(resolved)
    }
}

/// Resolves the endpoint `field` of element `element` to a flat node and a
/// plain field name.
fn resolve(
    resolved: &HashMap<String, NodeIndex>,
    element: &str,
    nested: bool,
    field: &str,
) -> Option<(NodeIndex, String)> {
    if !nested {
        return resolved.get(element).map(|&index| (index, field.to_string()));
    }
    let (path, field) = field.rsplit_once('.')?;
    resolved
        .get(&format!("{element}.{path}"))
        .map(|&index| (index, field.to_string()))
}

/// Reachability between leaf nodes, nested ones included, keyed by their
/// dotted path. Cycles are judged on this graph, so a nested workflow may
/// both feed and consume the same sibling.
#[derive(Default)]
struct Leaves {
    graph: DiGraph<(), ()>,
    index: HashMap<String, petgraph::graph::NodeIndex>,
}

impl Leaves {
    fn of(graph: &StableDiGraph<Element, Vec<Connection>>) -> Self {
        let mut leaves = Self::default();
        leaves.collect(graph, "");
        leaves
    }

    fn vertex(&mut self, path: String) -> petgraph::graph::NodeIndex {
        *self.index.entry(path).or_insert_with(|| self.graph.add_node(()))
    }

    fn collect(&mut self, graph: &StableDiGraph<Element, Vec<Connection>>, prefix: &str) {
        for index in graph.node_indices() {
            match &graph[index] {
                Element::Node(node) => {
                    self.vertex(format!("{prefix}{}", node.name));
                }
                Element::Workflow(sub) => self.collect(&sub.graph, &format!("{prefix}{}.", sub.name)),
            }
        }

        for edge in graph.edge_references() {
            for connection in edge.weight() {
                let from = endpoint(&graph[edge.source()], &connection.source.field);
                let to = endpoint(&graph[edge.target()], &connection.dest);
                if let (Some(from), Some(to)) = (from, to) {
                    self.link(format!("{prefix}{from}"), format!("{prefix}{to}"));
                }
            }
        }
    }

    fn link(&mut self, from: String, to: String) {
        let from = self.vertex(from);
        let to = self.vertex(to);
        self.graph.update_edge(from, to, ());
    }

    /// Whether `to` can be reached from `from`, a leaf reaching itself.
    fn reaches(&self, from: &str, to: &str) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&from), Some(&to)) => from == to || has_path_connecting(&self.graph, from, to, None),
            _ => false,
        }
    }
}

/// Dotted path of the leaf node behind an endpoint field of `element`.
fn endpoint(element: &Element, field: &str) -> Option<String> {
    match element {
        Element::Node(node) => Some(node.name.clone()),
        Element::Workflow(sub) => field
            .rsplit_once('.')
            .map(|(path, _)| format!("{}.{path}", sub.name)),
    }
}

/// The `node.field` currently writing into `field` of `index`, if any.
fn writer(graph: &StableDiGraph<Element, Vec<Connection>>, index: NodeIndex, field: &str) -> Option<String> {
    graph
        .edges_directed(index, Direction::Incoming)
        .find_map(|edge| {
            edge.weight()
                .iter()
                .find(|c| c.dest == field)
                .map(|c| format!("{}.{}", graph[edge.source()].name(), c.source.field))
        })
}

pub(crate) fn flat_writer(graph: &FlatGraph, index: NodeIndex, field: &str) -> Option<String> {
    graph
        .edges_directed(index, Direction::Incoming)
        .find_map(|edge| {
            edge.weight()
                .iter()
                .find(|c| c.dest == field)
                .map(|c| format!("{}.{}", graph[edge.source()].fullname(), c.source.field))
        })
}

pub(crate) fn edge_label(connections: &[Connection]) -> String {
    connections
        .iter()
        .map(|c| format!("{} → {}", c.source, c.dest))
        .collect::<Vec<_>>()
        .join(", ")
        .replace('"', "'")
}

impl Display for Workflow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            match &self.graph[index] {
                Element::Node(node) => {
                    let name = node.name.replace('"', "\\\"");
                    writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
                }
                Element::Workflow(sub) => {
                    let name = sub.name.replace('"', "\\\"");
                    writeln!(f, "    {}[[\"{}\"]]", index.index(), name)?;
                }
            }
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
