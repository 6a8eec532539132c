use std::collections::BTreeSet;
use std::fs;
use std::process;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::{Fields, Value};
use crate::interface::{
    FieldKind, FieldSpec, Interface, Resources, RunContext, Runtime, Spec, check_returncode,
};

/// One element of a command's argument list.
#[derive(Debug, Clone)]
pub enum Arg {
    /// Passed verbatim.
    Literal(String),
    /// The value of an input field. Lists expand to one argument per item,
    /// an undefined optional field expands to nothing.
    Field(String),
    /// `flag` followed by the value of `field`. A boolean field emits just the
    /// flag when `true` and nothing when `false`.
    Flag { flag: String, field: String },
}

/// Where the value of a command output comes from once the command exited.
#[derive(Debug, Clone)]
pub enum Discover {
    /// Files in the working directory matching a glob pattern. List-kinded
    /// outputs receive every match (sorted), other kinds the first one.
    Glob(String),
    /// The value of an input field, typically a generated output file name.
    /// Relative paths are resolved against the working directory.
    Input(String),
    /// Standard output, stored in the given file in the working directory.
    Stdout(String),
}

/// A work unit running an external program.
///
/// The argument list is a template over input fields; outputs are discovered
/// in the working directory after the program exits, which also makes them
/// recoverable from a finished directory without running anything again.
#[derive(Debug, Clone)]
pub struct Command {
    name: String,
    program: String,
    args: Vec<Arg>,
    inputs: Spec,
    outputs: Spec,
    discover: Vec<(String, Discover)>,
    resumable: bool,
    ignore_exit_code: bool,
    resources: Resources,
}

impl Command {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            inputs: Spec::new(),
            outputs: Spec::new(),
            discover: Vec::new(),
            resumable: false,
            ignore_exit_code: false,
            resources: Resources::default(),
        }
    }

    pub fn input(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.inputs = self.inputs.field(name, spec);
        self
    }

    pub fn output(mut self, name: impl Into<String>, spec: FieldSpec, discover: Discover) -> Self {
        let name = name.into();
        self.outputs = self.outputs.field(name.clone(), spec);
        self.discover.retain(|(existing, _)| *existing != name);
        self.discover.push((name, discover));
        self
    }

    pub fn arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn literal(self, literal: impl Into<String>) -> Self {
        self.arg(Arg::Literal(literal.into()))
    }

    pub fn field(self, field: impl Into<String>) -> Self {
        self.arg(Arg::Field(field.into()))
    }

    pub fn flag(self, flag: impl Into<String>, field: impl Into<String>) -> Self {
        self.arg(Arg::Flag {
            flag: flag.into(),
            field: field.into(),
        })
    }

    /// Marks the program as safe to restart in a partially populated
    /// working directory.
    pub fn resumable(mut self) -> Self {
        self.resumable = true;
        self
    }

    /// Treat any exit status as success.
    pub fn ignore_exit_code(mut self) -> Self {
        self.ignore_exit_code = true;
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    fn argv(&self, inputs: &Fields) -> Vec<String> {
        let mut argv = Vec::new();

        for arg in &self.args {
            match arg {
                Arg::Literal(literal) => argv.push(literal.clone()),
                Arg::Field(field) => {
                    if let Some(value) = inputs.get(field) {
                        push_value(&mut argv, value);
                    }
                }
                Arg::Flag { flag, field } => match inputs.get(field) {
                    None | Some(Value::Null) | Some(Value::Bool(false)) => {}
                    Some(Value::Bool(true)) => argv.push(flag.clone()),
                    Some(value) => {
                        argv.push(flag.clone());
                        push_value(&mut argv, value);
                    }
                },
            }
        }

        argv
    }

    fn discover(
        &self,
        cwd: &Utf8Path,
        name: &str,
        kind: &FieldKind,
        rule: &Discover,
        inputs: &Fields,
        runtime: Option<&Runtime>,
    ) -> anyhow::Result<Option<Value>> {
        match rule {
            Discover::Glob(pattern) => {
                let pattern = format!("{}/{}", glob::Pattern::escape(cwd.as_str()), pattern);
                let mut matches = Vec::new();
                for entry in glob::glob(&pattern)? {
                    let path = Utf8PathBuf::try_from(entry?)?;
                    matches.push(Value::String(path.into_string()));
                }
                matches.sort_by(|a, b| a.as_str().cmp(&b.as_str()));

                Ok(match kind {
                    FieldKind::List(_) | FieldKind::Set(_) => Some(Value::Array(matches)),
                    _ => matches.into_iter().next(),
                })
            }
            Discover::Input(field) => Ok(inputs.get(field).map(|value| match value {
                Value::String(path) if Utf8Path::new(path).is_relative() => {
                    Value::String(cwd.join(path).into_string())
                }
                other => other.clone(),
            })),
            Discover::Stdout(file) => {
                let path = cwd.join(file);
                if !path.exists() {
                    let stdout = runtime.and_then(|rt| rt.stdout.as_deref()).ok_or_else(|| {
                        anyhow::anyhow!("output '{name}' needs the captured stdout")
                    })?;
                    fs::write(&path, stdout)?;
                }
                Ok(Some(Value::String(path.into_string())))
            }
        }
    }
}

fn push_value(argv: &mut Vec<String>, value: &Value) {
    match value {
        Value::Null => {}
        Value::String(s) => argv.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|item| push_value(argv, item)),
        other => argv.push(other.to_string()),
    }
}

/// Quotes an argument for display and for batch scripts.
fn quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));

    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

impl Interface for Command {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> &Spec {
        &self.inputs
    }

    fn outputs(&self) -> &Spec {
        &self.outputs
    }

    fn run(&self, ctx: &RunContext<'_>, inputs: &Fields) -> anyhow::Result<Runtime> {
        let argv = self.argv(inputs);
        tracing::debug!(node = ctx.node, "running {}", self.program);

        let output = process::Command::new(&self.program)
            .args(&argv)
            .current_dir(ctx.cwd)
            .stdin(process::Stdio::null())
            .output()
            .map_err(|e| anyhow::anyhow!("couldn't start '{}': {e}", self.program))?;

        Ok(Runtime {
            returncode: Some(output.status.code().unwrap_or(-1)),
            stdout: Some(String::from_utf8_lossy(&output.stdout).into_owned()),
            stderr: Some(String::from_utf8_lossy(&output.stderr).into_owned()),
            command: self.command_line(inputs),
            ..Runtime::default()
        })
    }

    fn validate_runtime(&self, runtime: &Runtime) -> anyhow::Result<()> {
        if self.ignore_exit_code {
            return Ok(());
        }
        check_returncode(runtime)
    }

    fn aggregate_outputs(
        &self,
        ctx: &RunContext<'_>,
        inputs: &Fields,
        runtime: Option<&Runtime>,
        needed: Option<&BTreeSet<String>>,
    ) -> anyhow::Result<Fields> {
        let mut outputs = Fields::new();

        for (name, rule) in &self.discover {
            if needed.is_some_and(|needed| !needed.contains(name)) {
                continue;
            }
            let Some(spec) = self.outputs.get(name) else {
                continue;
            };
            if let Some(value) = self.discover(ctx.cwd, name, &spec.kind, rule, inputs, runtime)? {
                outputs.insert(name.clone(), value);
            }
        }

        Ok(outputs)
    }

    fn resumable(&self) -> bool {
        self.resumable
    }

    fn command_line(&self, inputs: &Fields) -> Option<String> {
        let mut line = quote(&self.program);
        for arg in self.argv(inputs) {
            line.push(' ');
            line.push_str(&quote(&arg));
        }
        Some(line)
    }

    fn resources(&self) -> Resources {
        self.resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;

    fn context<'a>(cwd: &'a Utf8Path, config: &'a Config) -> RunContext<'a> {
        RunContext {
            cwd,
            node: "cmd",
            config,
        }
    }

    #[test]
    fn test_command_line_template() {
        let cmd = Command::new("convert", "convert")
            .input("in_file", FieldSpec::file().mandatory())
            .input("verbose", FieldSpec::bool())
            .input("sizes", FieldSpec::list(FieldKind::Int))
            .flag("-v", "verbose")
            .flag("--size", "sizes")
            .field("in_file")
            .literal("out file.png");

        let inputs = Fields::new()
            .with("in_file", "a.png")
            .with("verbose", true)
            .with("sizes", json!([1, 2]));

        assert_eq!(
            cmd.command_line(&inputs).unwrap(),
            "convert -v --size 1 2 a.png 'out file.png'"
        );

        let inputs = Fields::new().with("in_file", "a.png").with("verbose", false);
        assert_eq!(
            cmd.command_line(&inputs).unwrap(),
            "convert a.png 'out file.png'"
        );
    }

    #[test]
    fn test_command_runs_and_discovers_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let config = Config::default();

        let cmd = Command::new("touch", "sh")
            .input("name", FieldSpec::str())
            .literal("-c")
            .literal("touch \"$0\".txt && echo done")
            .field("name")
            .output("files", FieldSpec::list(FieldKind::File), Discover::Glob("*.txt".into()))
            .output("log", FieldSpec::file(), Discover::Stdout("stdout.log".into()));

        let inputs = Fields::new().with("name", "result");
        let ctx = context(&cwd, &config);
        let runtime = cmd.run(&ctx, &inputs).unwrap();
        assert_eq!(runtime.returncode, Some(0));
        cmd.validate_runtime(&runtime).unwrap();

        let outputs = cmd
            .aggregate_outputs(&ctx, &inputs, Some(&runtime), None)
            .unwrap();
        let files = outputs.get("files").unwrap().as_array().unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].as_str().unwrap().ends_with("result.txt"));

        let log = outputs.path("log").unwrap();
        assert_eq!(fs::read_to_string(log).unwrap(), "done\n");
    }

    #[test]
    fn test_command_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let config = Config::default();
        let ctx = context(&cwd, &config);

        let failing = Command::new("fail", "sh").literal("-c").literal("echo oops >&2; exit 3");
        let runtime = failing.run(&ctx, &Fields::new()).unwrap();
        assert_eq!(runtime.returncode, Some(3));
        let error = failing.validate_runtime(&runtime).unwrap_err().to_string();
        assert!(error.contains("status 3"));
        assert!(error.contains("oops"));

        let tolerant = failing.clone().ignore_exit_code();
        assert!(tolerant.validate_runtime(&runtime).is_ok());
    }
}
