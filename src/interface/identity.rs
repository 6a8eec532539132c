use crate::core::Fields;
use crate::interface::{Interface, RunContext, Runtime, Spec};

/// Forwards every input to the output of the same name.
///
/// Identity nodes are the usual place to hang iterables on: they seed a
/// parameter sweep without doing any work. After expansion they are removed
/// from the graph and their consumers are wired straight to whatever fed them.
#[derive(Debug, Clone)]
pub struct Identity {
    spec: Spec,
}

impl Identity {
    pub fn new<I>(fields: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            spec: Spec::any(fields),
        }
    }

    /// Identity over explicitly typed fields.
    pub fn with_spec(spec: Spec) -> Self {
        Self { spec }
    }
}

impl Interface for Identity {
    fn name(&self) -> &str {
        "Identity"
    }

    fn inputs(&self) -> &Spec {
        &self.spec
    }

    fn outputs(&self) -> &Spec {
        &self.spec
    }

    fn run(&self, _: &RunContext<'_>, inputs: &Fields) -> anyhow::Result<Runtime> {
        Ok(Runtime {
            returned: inputs.clone(),
            ..Runtime::default()
        })
    }

    fn aggregate_outputs(
        &self,
        _: &RunContext<'_>,
        inputs: &Fields,
        _: Option<&Runtime>,
        needed: Option<&std::collections::BTreeSet<String>>,
    ) -> anyhow::Result<Fields> {
        let mut outputs = inputs.clone();
        if let Some(needed) = needed {
            outputs.retain(|name, _| needed.contains(name));
        }
        Ok(outputs)
    }

    fn passthrough(&self) -> bool {
        true
    }
}
