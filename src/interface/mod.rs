//! The Work Unit contract.
//!
//! A node in the graph does not know what it computes. It delegates to an
//! [`Interface`], which declares its inputs and outputs as an explicit
//! [`Spec`] and knows how to run itself inside a working directory. Inputs
//! are validated against the spec when they are set and again right before
//! execution, so a misspelled field never silently becomes a new one.
//!
//! Three interfaces ship with the crate:
//!
//! * [`Function`]: an in-process closure.
//! * [`Command`]: an external program with templated arguments.
//! * [`Identity`]: a pass-through used to seed iterables, removed from the
//!   graph after expansion.

mod command;
mod function;
mod identity;

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::{Fields, Value};

pub use command::{Arg, Command, Discover};
pub use function::Function;
pub use identity::Identity;

/// The declared type of a field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Any,
    Bool,
    Int,
    Float,
    Str,
    /// A path to a file. Its content takes part in the fingerprint.
    File,
    /// A path to a directory. The content of every file inside it takes part
    /// in the fingerprint.
    Directory,
    List(Box<FieldKind>),
    /// An unordered collection; join nodes collate into it without
    /// duplicates.
    Set(Box<FieldKind>),
}

impl FieldKind {
    pub fn list(inner: FieldKind) -> Self {
        FieldKind::List(Box::new(inner))
    }

    pub fn set(inner: FieldKind) -> Self {
        FieldKind::Set(Box::new(inner))
    }

    /// Whether `value` is an acceptable value for this kind.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::Any => true,
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Int => value.is_i64() || value.is_u64(),
            FieldKind::Float => value.is_number(),
            FieldKind::Str | FieldKind::File | FieldKind::Directory => value.is_string(),
            FieldKind::List(inner) | FieldKind::Set(inner) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|item| inner.accepts(item))),
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(self, FieldKind::Set(_))
    }

    /// Whether values of this kind may reference files on disk.
    pub(crate) fn has_paths(&self) -> bool {
        match self {
            FieldKind::File | FieldKind::Directory => true,
            FieldKind::List(inner) | FieldKind::Set(inner) => inner.has_paths(),
            _ => false,
        }
    }

    /// Collects every path referenced by `value`.
    pub(crate) fn paths<'v>(&self, value: &'v Value, out: &mut Vec<&'v str>) {
        match (self, value) {
            (FieldKind::File | FieldKind::Directory, Value::String(path)) => out.push(path),
            (FieldKind::List(inner) | FieldKind::Set(inner), Value::Array(items)) => {
                for item in items {
                    inner.paths(item, out);
                }
            }
            _ => {}
        }
    }
}

impl Display for FieldKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldKind::Any => f.write_str("any"),
            FieldKind::Bool => f.write_str("bool"),
            FieldKind::Int => f.write_str("int"),
            FieldKind::Float => f.write_str("float"),
            FieldKind::Str => f.write_str("str"),
            FieldKind::File => f.write_str("file"),
            FieldKind::Directory => f.write_str("directory"),
            FieldKind::List(inner) => write!(f, "list<{inner}>"),
            FieldKind::Set(inner) => write!(f, "set<{inner}>"),
        }
    }
}

/// Hook computing a value for an undefined field right before execution,
/// typically a generated output file name.
pub type GenFile = fn(&Fields) -> Option<Value>;

/// Descriptor of a single field.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub mandatory: bool,
    pub default: Option<Value>,
    /// Copy (or hard link) the referenced file into the working directory
    /// before running, and pass the copy instead.
    pub copy_on_run: bool,
    /// Whether the field takes part in the fingerprint.
    pub hash: bool,
    pub genfile: Option<GenFile>,
}

impl FieldSpec {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            mandatory: false,
            default: None,
            copy_on_run: false,
            hash: true,
            genfile: None,
        }
    }

    pub fn any() -> Self {
        Self::new(FieldKind::Any)
    }

    pub fn bool() -> Self {
        Self::new(FieldKind::Bool)
    }

    pub fn int() -> Self {
        Self::new(FieldKind::Int)
    }

    pub fn float() -> Self {
        Self::new(FieldKind::Float)
    }

    pub fn str() -> Self {
        Self::new(FieldKind::Str)
    }

    pub fn file() -> Self {
        Self::new(FieldKind::File)
    }

    pub fn directory() -> Self {
        Self::new(FieldKind::Directory)
    }

    pub fn list(inner: FieldKind) -> Self {
        Self::new(FieldKind::list(inner))
    }

    pub fn set(inner: FieldKind) -> Self {
        Self::new(FieldKind::set(inner))
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn copy_on_run(mut self) -> Self {
        self.copy_on_run = true;
        self
    }

    pub fn nohash(mut self) -> Self {
        self.hash = false;
        self
    }

    pub fn genfile(mut self, hook: GenFile) -> Self {
        self.genfile = Some(hook);
        self
    }
}

/// An ordered mapping from field names to their descriptors.
#[derive(Debug, Clone, Default)]
pub struct Spec {
    fields: Vec<(String, FieldSpec)>,
}

impl Spec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field, replacing an earlier field with the same name in place.
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        let name = name.into();
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = spec,
            None => self.fields.push((name, spec)),
        }
        self
    }

    /// Spec with the given names, all of kind [`FieldKind::Any`].
    pub fn any<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names
            .into_iter()
            .fold(Self::new(), |spec, name| spec.field(name, FieldSpec::any()))
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, spec)| spec)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Values of every field declaring a default.
    pub(crate) fn defaults(&self) -> Fields {
        self.fields
            .iter()
            .filter_map(|(name, spec)| spec.default.clone().map(|value| (name.clone(), value)))
            .collect()
    }
}

/// What happened when a work unit ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Runtime {
    pub hostname: String,
    pub duration: Duration,
    /// Exit status of external commands, `None` for in-process units.
    pub returncode: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// The command line executed, if any.
    pub command: Option<String>,
    /// Values produced in-process, picked up by
    /// [`Interface::aggregate_outputs`].
    pub returned: Fields,
}

/// Declared resource cost of a node, used by the parallel scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub threads: usize,
    pub memory_gb: f64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            threads: 1,
            memory_gb: 0.2,
        }
    }
}

/// Everything a work unit gets to know about where it runs.
pub struct RunContext<'a> {
    /// The node working directory. It exists when `run` is called.
    pub cwd: &'a Utf8Path,
    /// Identity of the node being run.
    pub node: &'a str,
    pub config: &'a Config,
}

/// The contract between the engine and a unit of work.
pub trait Interface: Send + Sync {
    /// Name of the work unit class, recorded in results and folded into the
    /// fingerprint.
    fn name(&self) -> &str;

    /// Implementation version. Bumping it invalidates cached results.
    fn version(&self) -> Option<&str> {
        None
    }

    fn inputs(&self) -> &Spec;

    fn outputs(&self) -> &Spec;

    /// Performs the work. Inputs are complete and validated.
    fn run(&self, ctx: &RunContext<'_>, inputs: &Fields) -> anyhow::Result<Runtime>;

    /// Decides whether a finished runtime counts as a success.
    fn validate_runtime(&self, runtime: &Runtime) -> anyhow::Result<()> {
        check_returncode(runtime)
    }

    /// Collects declared outputs. Must work without a runtime too, in which
    /// case only the working directory and inputs are available; cached
    /// results are re-aggregated that way when their stored copy is
    /// unreadable.
    ///
    /// When `needed` is given, only those outputs have to be produced.
    fn aggregate_outputs(
        &self,
        _ctx: &RunContext<'_>,
        _inputs: &Fields,
        runtime: Option<&Runtime>,
        needed: Option<&BTreeSet<String>>,
    ) -> anyhow::Result<Fields> {
        let runtime =
            runtime.ok_or_else(|| anyhow::anyhow!("outputs of '{}' need a runtime", self.name()))?;

        let mut outputs = Fields::new();
        for name in self.outputs().names() {
            if needed.is_some_and(|needed| !needed.contains(name)) {
                continue;
            }
            if let Some(value) = runtime.returned.get(name) {
                outputs.insert(name, value.clone());
            }
        }
        Ok(outputs)
    }

    /// Whether a partially populated working directory left behind by an
    /// interrupted run can be reused.
    fn resumable(&self) -> bool {
        false
    }

    /// Whether the unit only forwards its inputs to identically named
    /// outputs. Such nodes are elided after expansion.
    fn passthrough(&self) -> bool {
        false
    }

    /// The shell command this unit would execute, if it is command based.
    fn command_line(&self, _inputs: &Fields) -> Option<String> {
        None
    }

    fn resources(&self) -> Resources {
        Resources::default()
    }
}

pub(crate) fn check_returncode(runtime: &Runtime) -> anyhow::Result<()> {
    match runtime.returncode {
        Some(code) if code != 0 => Err(anyhow::anyhow!(
            "command exited with status {code}{}",
            runtime
                .stderr
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(|s| format!(":\n{}", s.trim_end()))
                .unwrap_or_default()
        )),
        _ => Ok(()),
    }
}
