//! Nodes: one scheduled instance of a work unit.
//!
//! A node runs in three phases. [`Node::prepare`] materializes the inputs,
//! fingerprints them and consults the cache entry in the working directory;
//! a hit ends the run right there. Otherwise the directory is set up and a
//! [`Job`] is returned, which [executes](Job::execute) the work unit and
//! [finishes](Job::finish) by aggregating outputs, cleaning the directory
//! and committing the result. The split lets batch backends run the middle
//! phase somewhere else.

pub(crate) mod join;
pub(crate) mod map;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};

use crate::cache::{self, CacheEntry, Decision, Fingerprint, NodeResult, Policy};
use crate::config::Config;
use crate::core::{Fields, Value};
use crate::engine::ResultStore;
use crate::error::{ExpansionError, GraphError, NodeError};
use crate::interface::{FieldKind, Interface, Resources, RunContext, Runtime};
use crate::janitor::{self, Sweep};
use crate::report;
use crate::transform::{Transform, Transforms};
use crate::utils::{hostname, link_or_copy, panic_message};

pub(crate) use join::JoinSpec;
pub(crate) use map::MapSpec;

/// A parameter sweep attached to a node.
///
/// By default the node's downstream subgraph is replicated once per element
/// of the cartesian product of all value lists, the first field varying
/// slowest. Synchronized iterables pair the lists up element-wise instead.
#[derive(Debug, Clone, Default)]
pub struct Iterables {
    fields: Vec<(String, Vec<Value>)>,
    synchronize: bool,
}

impl Iterables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.fields
            .push((name.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    /// Pair the value lists element-wise rather than taking their product.
    pub fn synchronize(mut self) -> Self {
        self.synchronize = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Every binding the node is to be replicated for.
    pub(crate) fn combinations(&self, node: &Node) -> Result<Vec<Vec<(String, Value)>>, ExpansionError> {
        for (field, _) in &self.fields {
            if !node.interface.inputs().contains(field) {
                return Err(ExpansionError::UnknownIterableField {
                    node: node.fullname(),
                    field: field.clone(),
                });
            }
        }

        if self.synchronize {
            let lengths: Vec<usize> = self.fields.iter().map(|(_, values)| values.len()).collect();
            if lengths.windows(2).any(|pair| pair[0] != pair[1]) {
                return Err(ExpansionError::MismatchedIterables {
                    node: node.fullname(),
                    lengths,
                });
            }

            let count = lengths.first().copied().unwrap_or(0);
            return Ok((0..count)
                .map(|i| {
                    self.fields
                        .iter()
                        .map(|(field, values)| (field.clone(), values[i].clone()))
                        .collect()
                })
                .collect());
        }

        let mut combos: Vec<Vec<(String, Value)>> = vec![Vec::new()];
        for (field, values) in &self.fields {
            combos = combos
                .into_iter()
                .flat_map(|prefix| {
                    values.iter().map(move |value| {
                        let mut combo = prefix.clone();
                        combo.push((field.clone(), value.clone()));
                        combo
                    })
                })
                .collect();
        }
        Ok(combos)
    }
}

/// Where the value of one input field comes from at run time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSource {
    /// Identity of the upstream node.
    pub node: String,
    /// Upstream output field.
    pub field: String,
    pub transform: Option<Transform>,
    /// The upstream result file, read when the result isn't held in memory.
    pub result_file: Utf8PathBuf,
    #[serde(skip)]
    pub(crate) index: Option<NodeIndex>,
}

#[derive(Debug, Clone)]
pub(crate) enum Kind {
    Plain,
    Map(MapSpec),
    Join(JoinSpec),
}

/// One scheduled instance of a work unit.
///
/// Nodes are created with [`Node::new`], [`Node::map`] or [`Node::join`] and
/// handed to a [`Workflow`](crate::Workflow). Their identity, parameterization,
/// input sources and working directory are filled in during expansion.
#[derive(Clone)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) id: String,
    pub(crate) hierarchy: Vec<String>,
    pub(crate) interface: Arc<dyn Interface>,
    pub(crate) inputs: Fields,
    pub(crate) iterables: Option<Iterables>,
    /// Parameterization tags, ranked so that tags of longer paths sort first.
    pub(crate) params: Vec<(isize, String)>,
    pub(crate) input_source: BTreeMap<String, InputSource>,
    /// Transforms over static inputs, applied when the inputs are resolved.
    pub(crate) deferred: BTreeMap<String, Transform>,
    pub(crate) needed_outputs: Option<BTreeSet<String>>,
    pub(crate) kind: Kind,
    pub(crate) overwrite: Option<bool>,
    pub(crate) resources: Option<Resources>,
    pub(crate) output_dir: Utf8PathBuf,
}

impl Node {
    pub fn new(name: impl Into<String>, interface: impl Interface + 'static) -> Self {
        Self::with_kind(name.into(), Arc::new(interface), Kind::Plain)
    }

    /// A node running its work unit once per element of the `iterfields`
    /// list inputs.
    pub fn map<I, S>(name: impl Into<String>, interface: impl Interface + 'static, iterfields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = MapSpec::new(iterfields.into_iter().map(Into::into).collect());
        Self::with_kind(name.into(), Arc::new(interface), Kind::Map(spec))
    }

    /// A node collecting the values of `fields` from every branch spawned by
    /// the iterables of the node named `source`.
    pub fn join<I, S>(
        name: impl Into<String>,
        interface: impl Interface + 'static,
        source: impl Into<String>,
        fields: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = JoinSpec::new(source.into(), fields.into_iter().map(Into::into).collect());
        Self::with_kind(name.into(), Arc::new(interface), Kind::Join(spec))
    }

    fn with_kind(name: String, interface: Arc<dyn Interface>, kind: Kind) -> Self {
        Self {
            id: name.clone(),
            name,
            hierarchy: Vec::new(),
            interface,
            inputs: Fields::new(),
            iterables: None,
            params: Vec::new(),
            input_source: BTreeMap::new(),
            deferred: BTreeMap::new(),
            needed_outputs: None,
            kind,
            overwrite: None,
            resources: None,
            output_dir: Utf8PathBuf::new(),
        }
    }

    pub fn iterables(mut self, iterables: Iterables) -> Self {
        self.iterables = (!iterables.is_empty()).then_some(iterables);
        self
    }

    /// Join nodes: drop duplicates while collating into a list.
    pub fn unique(mut self) -> Self {
        if let Kind::Join(spec) = &mut self.kind {
            spec.unique = true;
        }
        self
    }

    /// Map nodes: iterfields hold nested lists, mapped over their leaves.
    pub fn nested(mut self) -> Self {
        if let Kind::Map(spec) = &mut self.kind {
            spec.nested = true;
        }
        self
    }

    /// Map nodes: run the elements one after another.
    pub fn serial(mut self) -> Self {
        if let Kind::Map(spec) = &mut self.kind {
            spec.serial = true;
        }
        self
    }

    /// Overrides [`Config::overwrite`] for this node.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = Some(overwrite);
        self
    }

    /// Overrides the resources declared by the work unit.
    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Builder-style [`set_input`](Self::set_input).
    pub fn input(mut self, field: &str, value: impl Into<Value>) -> Result<Self, GraphError> {
        self.set_input(field, value)?;
        Ok(self)
    }

    /// Sets a static input value, checking it against the declared field.
    pub fn set_input(&mut self, field: &str, value: impl Into<Value>) -> Result<(), GraphError> {
        let value = value.into();
        let spec = self
            .interface
            .inputs()
            .get(field)
            .ok_or_else(|| GraphError::UnknownInput {
                node: self.name.clone(),
                field: field.to_string(),
            })?;

        let kind = match &self.kind {
            Kind::Map(map) if map.iterfields.iter().any(|f| f == field) => {
                FieldKind::list(spec.kind.clone())
            }
            _ => spec.kind.clone(),
        };

        let nested = matches!(&self.kind, Kind::Map(map) if map.nested);
        if !value.is_null() && !(nested && value.is_array()) && !kind.accepts(&value) {
            return Err(GraphError::InvalidValue {
                node: self.name.clone(),
                field: field.to_string(),
                value: value.to_string(),
                kind: kind.to_string(),
            });
        }

        self.inputs.insert(field, value);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity within the enclosing workflow, including any replica suffix.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hierarchy(&self) -> &[String] {
        &self.hierarchy
    }

    /// Dotted identity including the workflow hierarchy.
    pub fn fullname(&self) -> String {
        let mut parts = self.hierarchy.clone();
        parts.push(self.id.clone());
        parts.join(".")
    }

    /// Parameterization tags, outermost first.
    pub fn parameterization(&self) -> Vec<String> {
        self.params.iter().map(|(_, tag)| tag.clone()).collect()
    }

    pub fn interface(&self) -> &dyn Interface {
        self.interface.as_ref()
    }

    /// Statically assigned inputs.
    pub fn inputs(&self) -> &Fields {
        &self.inputs
    }

    pub fn input_source(&self) -> &BTreeMap<String, InputSource> {
        &self.input_source
    }

    pub fn needed_outputs(&self) -> Option<&BTreeSet<String>> {
        self.needed_outputs.as_ref()
    }

    pub fn output_dir(&self) -> &Utf8Path {
        &self.output_dir
    }

    pub fn is_map(&self) -> bool {
        matches!(self.kind, Kind::Map(_))
    }

    pub fn is_join(&self) -> bool {
        matches!(self.kind, Kind::Join(_))
    }

    pub fn effective_resources(&self) -> Resources {
        self.resources.unwrap_or_else(|| self.interface.resources())
    }

    pub(crate) fn is_input(&self, field: &str) -> bool {
        self.interface.inputs().contains(field)
    }

    pub(crate) fn is_output(&self, field: &str) -> bool {
        self.interface.outputs().contains(field)
    }

    /// Runs the node to completion in-process.
    pub(crate) fn run(&self, env: &Env<'_>) -> Result<Outcome, NodeError> {
        let inputs = self.resolve_inputs(env)?;

        if let Kind::Map(spec) = &self.kind {
            return map::run(self, spec, env, inputs);
        }

        match self.prepare(env, self.output_dir.clone(), inputs)? {
            Prepared::Cached(outcome) => Ok(outcome),
            Prepared::Ready(job) => {
                let runtime = job.execute(env);
                job.finish(env, runtime)
            }
        }
    }

    /// Static inputs overlaid with values pulled from upstream results.
    pub(crate) fn resolve_inputs(&self, env: &Env<'_>) -> Result<Fields, NodeError> {
        let mut inputs = self.inputs.clone();

        for (field, transform) in &self.deferred {
            if let Some(value) = inputs.get(field) {
                let value = env
                    .transforms
                    .apply(transform, value)
                    .map_err(|error| NodeError::Transform {
                        field: field.clone(),
                        name: transform.name.clone(),
                        error,
                    })?;
                inputs.insert(field.clone(), value);
            }
        }

        for (field, source) in &self.input_source {
            let result = match source.index.and_then(|index| env.results.get(index)) {
                Some(result) => result,
                None => {
                    let dir = source.result_file.parent().unwrap_or(Utf8Path::new("."));
                    let name = source
                        .result_file
                        .file_stem()
                        .and_then(|stem| stem.strip_prefix(cache::RESULT_PREFIX))
                        .unwrap_or_default();
                    let result = cache::load_result(dir, name).map_err(|error| NodeError::Upstream {
                        node: source.node.clone(),
                        error,
                    })?;
                    Arc::new(result)
                }
            };

            let Some(value) = result.outputs.get(&source.field) else {
                tracing::debug!("{}.{} is undefined upstream", source.node, source.field);
                continue;
            };

            let value = match &source.transform {
                Some(transform) => {
                    env.transforms
                        .apply(transform, value)
                        .map_err(|error| NodeError::Transform {
                            field: field.clone(),
                            name: transform.name.clone(),
                            error,
                        })?
                }
                None => value.clone(),
            };
            inputs.insert(field.clone(), value);
        }

        if let Kind::Join(spec) = &self.kind {
            join::collate(self, spec, &mut inputs);
        }

        Ok(inputs)
    }

    /// Fills in defaults and generated values, then validates.
    ///
    /// `listed` names fields that carry a list of values of the declared kind,
    /// which is how map nodes receive their iterfields.
    pub(crate) fn complete(&self, inputs: &mut Fields, listed: &[String], nested: bool) -> Result<(), NodeError> {
        let spec = self.interface.inputs();

        for (name, default) in spec.defaults() {
            if !inputs.contains(&name) {
                inputs.insert(name, default);
            }
        }

        for (name, field) in spec.iter() {
            if !inputs.contains(name)
                && let Some(genfile) = field.genfile
                && let Some(value) = genfile(inputs)
            {
                inputs.insert(name, value);
            }
        }

        for (name, field) in spec.iter() {
            let Some(value) = inputs.get(name) else {
                if field.mandatory {
                    return Err(NodeError::MissingInput(name.to_string()));
                }
                continue;
            };

            let is_listed = listed.iter().any(|f| f == name);
            let kind = if is_listed {
                FieldKind::list(field.kind.clone())
            } else {
                field.kind.clone()
            };
            let ok = value.is_null() || (is_listed && nested && value.is_array()) || kind.accepts(value);
            if !ok {
                return Err(NodeError::InvalidInput {
                    field: name.to_string(),
                    value: value.to_string(),
                    kind: kind.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Fingerprints the inputs and looks at the cache entry in `dir`.
    pub(crate) fn prepare(&self, env: &Env<'_>, dir: Utf8PathBuf, mut inputs: Fields) -> Result<Prepared<'_>, NodeError> {
        self.complete(&mut inputs, &[], false)?;

        let needed = self.needed_outputs.as_ref();
        let fingerprint = Fingerprint::compute(self.interface.as_ref(), &inputs, needed, env.config)?;
        let mut entry = CacheEntry::new(dir.clone(), &self.name, fingerprint);

        let fullname = self.fullname();
        let policy = Policy {
            force: self.overwrite.unwrap_or(env.config.overwrite),
            resumable: self.interface.resumable(),
        };
        let ctx = RunContext {
            cwd: &dir,
            node: &fullname,
            config: env.config,
        };
        let decision = entry.inspect(policy, self.interface.name(), &inputs, || {
            self.interface.aggregate_outputs(&ctx, &inputs, None, needed)
        })?;

        match decision {
            Decision::Hit(result) => {
                tracing::debug!("{fullname}: cached ({})", entry.fingerprint().to_hex());
                Ok(Prepared::Cached(Outcome {
                    result: Arc::new(result),
                    cached: true,
                }))
            }
            Decision::Run { resume } => {
                fs::create_dir_all(&dir)?;
                let (run_inputs, staged) = self.stage(&dir, &inputs)?;
                cache::save_inputs(&dir, &inputs)?;

                if let Some(command) = self.interface.command_line(&run_inputs) {
                    fs::write(dir.join("command.txt"), format!("{command}\n"))?;
                }
                if env.config.write_reports {
                    report::write_pre(&dir, self, &inputs)?;
                }
                entry.begin()?;
                tracing::debug!("{fullname}: running in {dir} (resume: {resume})");

                Ok(Prepared::Ready(Job {
                    node: self,
                    dir,
                    inputs,
                    run_inputs,
                    staged,
                    entry,
                    started: Instant::now(),
                }))
            }
        }
    }

    /// Links copy-on-run files into `dir` and points the inputs at the copies.
    fn stage(&self, dir: &Utf8Path, inputs: &Fields) -> Result<(Fields, Vec<Utf8PathBuf>), NodeError> {
        let mut run_inputs = inputs.clone();
        let mut staged = Vec::new();

        for (name, field) in self.interface.inputs().iter() {
            if !field.copy_on_run {
                continue;
            }
            let Some(value) = inputs.get(name) else {
                continue;
            };

            let mut stage_one = |path: &str| -> std::io::Result<Value> {
                let from = Utf8Path::new(path);
                let Some(file_name) = from.file_name() else {
                    return Ok(Value::String(path.to_string()));
                };
                let to = dir.join(file_name);
                if from != to {
                    link_or_copy(from, &to)?;
                }
                staged.push(to.clone());
                Ok(Value::String(to.into_string()))
            };

            let copied = match value {
                Value::String(path) => stage_one(path)?,
                Value::Array(items) => Value::Array(
                    items
                        .iter()
                        .map(|item| match item {
                            Value::String(path) => stage_one(path),
                            other => Ok(other.clone()),
                        })
                        .collect::<std::io::Result<_>>()?,
                ),
                other => other.clone(),
            };
            run_inputs.insert(name, copied);
        }

        Ok((run_inputs, staged))
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.fullname())
            .field("interface", &self.interface.name())
            .field("kind", &self.kind)
            .field("parameterization", &self.parameterization())
            .finish()
    }
}

/// Shared state a node needs while it runs.
pub(crate) struct Env<'a> {
    pub config: &'a Config,
    pub transforms: &'a Transforms,
    pub results: &'a ResultStore,
}

/// The result of a node run.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub result: Arc<NodeResult>,
    /// Whether the result was served from the cache.
    pub cached: bool,
}

pub(crate) enum Prepared<'n> {
    Cached(Outcome),
    Ready(Job<'n>),
}

/// A node whose working directory is set up and marked in-flight.
pub(crate) struct Job<'n> {
    pub(crate) node: &'n Node,
    pub(crate) dir: Utf8PathBuf,
    inputs: Fields,
    run_inputs: Fields,
    staged: Vec<Utf8PathBuf>,
    entry: CacheEntry,
    pub(crate) started: Instant,
}

impl Job<'_> {
    /// The command line to submit, for command based work units.
    pub(crate) fn command_line(&self) -> Option<String> {
        self.node.interface.command_line(&self.run_inputs)
    }

    pub(crate) fn execute(&self, env: &Env<'_>) -> Result<Runtime, NodeError> {
        let fullname = self.node.fullname();
        let ctx = RunContext {
            cwd: &self.dir,
            node: &fullname,
            config: env.config,
        };

        tracing::info!("running {fullname}");
        let start = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| self.node.interface.run(&ctx, &self.run_inputs)));

        let mut runtime = match result {
            Ok(Ok(runtime)) => runtime,
            Ok(Err(error)) => return Err(NodeError::Interface(error)),
            Err(panic) => return Err(NodeError::Panicked(panic_message(panic))),
        };
        runtime.hostname = hostname();
        runtime.duration = start.elapsed();
        Ok(runtime)
    }

    /// Validates the runtime, aggregates and commits. On failure the
    /// unfinished marker is left behind and the error returned.
    pub(crate) fn finish(mut self, env: &Env<'_>, runtime: Result<Runtime, NodeError>) -> Result<Outcome, NodeError> {
        let node = self.node;
        let fullname = node.fullname();
        let ctx = RunContext {
            cwd: &self.dir,
            node: &fullname,
            config: env.config,
        };

        let produced = runtime.and_then(|runtime| {
            node.interface
                .validate_runtime(&runtime)
                .map_err(NodeError::Interface)?;
            let mut outputs = node
                .interface
                .aggregate_outputs(&ctx, &self.run_inputs, Some(&runtime), node.needed_outputs.as_ref())
                .map_err(NodeError::Interface)?;

            if env.config.remove_unnecessary_outputs
                && let Some(needed) = &node.needed_outputs
            {
                let sweep = Sweep {
                    dir: &self.dir,
                    spec: node.interface.outputs(),
                    needed,
                    staged: &self.staged,
                    keep_inputs: env.config.keep_inputs,
                };
                janitor::clean(&sweep, &mut outputs)?;
            }
            Ok((runtime, outputs))
        });

        let committed = produced.and_then(|(runtime, outputs)| {
            let result = NodeResult {
                interface: node.interface.name().to_string(),
                fingerprint: self.entry.fingerprint().to_hex(),
                runtime: Some(runtime),
                inputs: self.inputs.clone(),
                outputs,
            };
            self.entry.commit(&result)?;
            Ok(result)
        });

        if env.config.write_reports
            && let Err(e) = report::write_post(&self.dir, committed.as_ref())
        {
            tracing::warn!("couldn't write report for {fullname}: {e}");
        }

        match committed {
            Ok(result) => {
                tracing::info!("finished {fullname} in {:.2?}", self.started.elapsed());
                Ok(Outcome {
                    result: Arc::new(result),
                    cached: false,
                })
            }
            Err(error) => {
                self.entry.fail();
                tracing::warn!("{fullname} failed: {error}");
                Err(error)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::interface::{FieldSpec, Function, Spec};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn counting_add(counter: Arc<AtomicUsize>) -> Function {
        Function::with_spec(
            "add",
            Spec::new()
                .field("a", FieldSpec::int().mandatory())
                .field("b", FieldSpec::int().default_value(10)),
            Spec::any(["sum"]),
            move |_, inputs| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Fields::new().with("sum", inputs.int("a")? + inputs.int("b")?))
            },
        )
    }

    pub(crate) fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    pub(crate) fn env<'a>(config: &'a Config, transforms: &'a Transforms, results: &'a ResultStore) -> Env<'a> {
        Env {
            config,
            transforms,
            results,
        }
    }

    #[test]
    fn test_combinations_product_and_zip() {
        let node = Node::new("n", Function::new("f", ["x", "y"], ["z"], |_, _| Ok(Fields::new())));

        let product = Iterables::new().field("x", [1, 2]).field("y", ["a", "b", "c"]);
        let combos = product.combinations(&node).unwrap();
        assert_eq!(combos.len(), 6);
        assert_eq!(combos[0], vec![("x".into(), json!(1)), ("y".into(), json!("a"))]);
        assert_eq!(combos[1], vec![("x".into(), json!(1)), ("y".into(), json!("b"))]);
        assert_eq!(combos[3], vec![("x".into(), json!(2)), ("y".into(), json!("a"))]);

        let zipped = Iterables::new()
            .field("x", [1, 2])
            .field("y", ["a", "b"])
            .synchronize();
        assert_eq!(zipped.combinations(&node).unwrap().len(), 2);

        let uneven = Iterables::new().field("x", [1, 2]).field("y", ["a"]).synchronize();
        assert!(matches!(
            uneven.combinations(&node),
            Err(ExpansionError::MismatchedIterables { .. })
        ));

        let unknown = Iterables::new().field("nope", [1]);
        assert!(matches!(
            unknown.combinations(&node),
            Err(ExpansionError::UnknownIterableField { .. })
        ));
    }

    #[test]
    fn test_set_input_validates() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut node = Node::new("add", counting_add(counter.clone()));

        assert!(node.set_input("a", 1).is_ok());
        assert!(matches!(node.set_input("c", 1), Err(GraphError::UnknownInput { .. })));
        assert!(matches!(node.set_input("a", "one"), Err(GraphError::InvalidValue { .. })));

        let mut map = Node::map("add", counting_add(counter), ["a"]);
        assert!(map.set_input("a", json!([1, 2, 3])).is_ok());
        assert!(map.set_input("a", 1).is_err());
    }

    #[test]
    fn test_run_caches_result() {
        let (_guard, root) = tempdir();
        let config = Config::new(root.clone());
        let transforms = Transforms::new();
        let results = ResultStore::default();
        let env = env(&config, &transforms, &results);

        let counter = Arc::new(AtomicUsize::new(0));
        let mut node = Node::new("add", counting_add(counter.clone())).input("a", 1).unwrap();
        node.output_dir = root.join("add");

        let first = node.run(&env).unwrap();
        assert!(!first.cached);
        assert_eq!(first.result.outputs.get("sum"), Some(&json!(11)));
        assert!(node.output_dir.join("result_add.cbor").exists());
        assert!(node.output_dir.join("_inputs.cbor").exists());
        assert!(node.output_dir.join("_report/report.md").exists());

        let second = node.run(&env).unwrap();
        assert!(second.cached);
        assert_eq!(second.result.outputs, first.result.outputs);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let forced = node.clone().overwrite(true).run(&env).unwrap();
        assert!(!forced.cached);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_mandatory_input() {
        let (_guard, root) = tempdir();
        let config = Config::new(root.clone());
        let transforms = Transforms::new();
        let results = ResultStore::default();

        let mut node = Node::new("add", counting_add(Arc::new(AtomicUsize::new(0))));
        node.output_dir = root.join("add");
        let error = node.run(&env(&config, &transforms, &results)).unwrap_err();
        assert!(matches!(error, NodeError::MissingInput(field) if field == "a"));
    }

    #[test]
    fn test_failure_leaves_unfinished_marker() {
        let (_guard, root) = tempdir();
        let config = Config::new(root.clone());
        let transforms = Transforms::new();
        let results = ResultStore::default();

        let boom = Function::new("boom", ["x"], ["y"], |_, _| -> anyhow::Result<Fields> {
            panic!("kaboom")
        });
        let mut node = Node::new("boom", boom).input("x", 1).unwrap();
        node.output_dir = root.join("boom");

        let error = node.run(&env(&config, &transforms, &results)).unwrap_err();
        assert!(matches!(&error, NodeError::Panicked(msg) if msg == "kaboom"));

        let markers: Vec<_> = fs::read_dir(&node.output_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().into_string().unwrap())
            .filter(|name| name.starts_with("_0x"))
            .collect();
        assert_eq!(markers.len(), 1);
        assert!(markers[0].ends_with("_unfinished.json"));
    }

    #[test]
    fn test_deferred_transform_applies_on_resolve() {
        let config = Config::default();
        let transforms = Transforms::new();
        let results = ResultStore::default();
        let env = env(&config, &transforms, &results);

        let noop = Function::new("noop", ["x"], [] as [&str; 0], |_, _| Ok(Fields::new()));
        let mut node = Node::new("n", noop).input("x", 4).unwrap();
        node.deferred.insert("x".into(), Transform::new("wrap"));
        assert_eq!(node.resolve_inputs(&env).unwrap().get("x"), Some(&json!([4])));

        node.deferred.insert("x".into(), Transform::new("length"));
        let error = node.resolve_inputs(&env).unwrap_err();
        assert!(matches!(error, NodeError::Transform { field, name, .. } if field == "x" && name == "length"));
    }

    #[test]
    fn test_upstream_result_loaded_from_disk() {
        let (_guard, root) = tempdir();
        let config = Config::new(root.clone());
        let transforms = Transforms::new();
        let results = ResultStore::default();
        let env = env(&config, &transforms, &results);

        let counter = Arc::new(AtomicUsize::new(0));
        let mut upstream = Node::new("up", counting_add(counter.clone())).input("a", 1).unwrap();
        upstream.output_dir = root.join("up");
        upstream.run(&env).unwrap();

        let mut downstream = Node::new("down", counting_add(counter)).input("b", 0).unwrap();
        downstream.output_dir = root.join("down");
        downstream.input_source.insert(
            "a".into(),
            InputSource {
                node: "up".into(),
                field: "sum".into(),
                transform: None,
                result_file: cache::result_file(&upstream.output_dir, "up"),
                index: None,
            },
        );

        let outcome = downstream.run(&env).unwrap();
        assert_eq!(outcome.result.outputs.get("sum"), Some(&json!(11)));
    }
}
