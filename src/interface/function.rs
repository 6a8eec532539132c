use std::sync::Arc;

use crate::core::Fields;
use crate::interface::{Interface, Resources, RunContext, Runtime, Spec};

type FunctionPtr = Arc<dyn Fn(&RunContext<'_>, &Fields) -> anyhow::Result<Fields> + Send + Sync>;

/// A work unit backed by an in-process function.
///
/// The function receives the run context (for the working directory) and the
/// complete inputs, and returns the values of its outputs. Since a closure
/// can't be hashed, the fingerprint covers only the function's `name` and
/// `version`; bump the version when the function's behavior changes.
///
/// ```rust
/// use nagare::{Fields, Function};
///
/// let add = Function::new("add", ["a", "b"], ["sum"], |_, inputs| {
///     Ok(Fields::new().with("sum", inputs.int("a")? + inputs.int("b")?))
/// });
/// ```
#[derive(Clone)]
pub struct Function {
    name: String,
    version: Option<String>,
    inputs: Spec,
    outputs: Spec,
    resources: Resources,
    func: FunctionPtr,
}

impl Function {
    /// Creates a function with untyped inputs and outputs.
    pub fn new<I, O, F>(name: impl Into<String>, inputs: I, outputs: O, func: F) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
        F: Fn(&RunContext<'_>, &Fields) -> anyhow::Result<Fields> + Send + Sync + 'static,
    {
        Self::with_spec(name, Spec::any(inputs), Spec::any(outputs), func)
    }

    /// Creates a function with explicitly typed inputs and outputs.
    pub fn with_spec<F>(name: impl Into<String>, inputs: Spec, outputs: Spec, func: F) -> Self
    where
        F: Fn(&RunContext<'_>, &Fields) -> anyhow::Result<Fields> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            version: None,
            inputs,
            outputs,
            resources: Resources::default(),
            func: Arc::new(func),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }
}

impl Interface for Function {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn inputs(&self) -> &Spec {
        &self.inputs
    }

    fn outputs(&self) -> &Spec {
        &self.outputs
    }

    fn run(&self, ctx: &RunContext<'_>, inputs: &Fields) -> anyhow::Result<Runtime> {
        let returned = (self.func)(ctx, inputs)?;

        if let Some(unknown) = returned.keys().find(|name| !self.outputs.contains(name)) {
            anyhow::bail!("function '{}' returned undeclared output '{unknown}'", self.name);
        }

        Ok(Runtime {
            returned,
            ..Runtime::default()
        })
    }

    fn resources(&self) -> Resources {
        self.resources
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Function({})", self.name)
    }
}
