//! Named, pure functions applied to a value while it travels along an edge.
//!
//! A connection may route an output through a transform before it reaches
//! its destination, e.g. to pick one element of a list or to strip a file
//! extension. Transforms are looked up by name in a [`Transforms`] registry
//! owned by the workflow, and are only evaluated when the destination node
//! materializes its inputs.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::core::Value;
use crate::error::GraphError;

/// Signature of a transform: the travelling value plus the fixed extra
/// arguments recorded on the connection.
pub type TransformFn = fn(&Value, &[Value]) -> anyhow::Result<Value>;

/// A reference to a registered transform together with its extra arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub name: String,
    pub args: Vec<Value>,
}

impl Transform {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl Display for Transform {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)?;
        if !self.args.is_empty() {
            let args: Vec<String> = self.args.iter().map(Value::to_string).collect();
            write!(f, "({})", args.join(", "))?;
        }
        Ok(())
    }
}

/// Registry of transforms available to a workflow.
#[derive(Debug, Clone)]
pub struct Transforms {
    table: BTreeMap<String, TransformFn>,
}

impl Default for Transforms {
    fn default() -> Self {
        let mut table: BTreeMap<String, TransformFn> = BTreeMap::new();
        table.insert("select".into(), select);
        table.insert("length".into(), length);
        table.insert("flatten".into(), flatten);
        table.insert("basename".into(), basename);
        table.insert("dirname".into(), dirname);
        table.insert("stem".into(), stem);
        table.insert("suffix".into(), suffix);
        table.insert("wrap".into(), wrap);
        Self { table }
    }
}

impl Transforms {
    /// Registry holding the built-in transforms.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transform, replacing an earlier one with the same name.
    pub fn register(&mut self, name: impl Into<String>, func: TransformFn) {
        self.table.insert(name.into(), func);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    pub(crate) fn check(&self, transform: &Transform) -> Result<(), GraphError> {
        if self.contains(&transform.name) {
            Ok(())
        } else {
            Err(GraphError::UnknownTransform(transform.name.clone()))
        }
    }

    /// Adds every entry of `other` that isn't registered here yet.
    pub(crate) fn merge(&mut self, other: &Transforms) {
        for (name, func) in &other.table {
            self.table.entry(name.clone()).or_insert(*func);
        }
    }

    pub fn apply(&self, transform: &Transform, value: &Value) -> anyhow::Result<Value> {
        let func = self
            .table
            .get(&transform.name)
            .ok_or_else(|| anyhow::anyhow!("unknown transform '{}'", transform.name))?;
        func(value, &transform.args)
    }
}

fn as_path(value: &Value) -> anyhow::Result<&Utf8Path> {
    value
        .as_str()
        .map(Utf8Path::new)
        .ok_or_else(|| anyhow::anyhow!("expected a path, got {value}"))
}

fn select(value: &Value, args: &[Value]) -> anyhow::Result<Value> {
    let items = value
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("select expects a list, got {value}"))?;
    let index = args
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow::anyhow!("select needs an integer index"))?;

    // Negative indices count from the end.
    let resolved = if index < 0 {
        items.len() as i64 + index
    } else {
        index
    };

    usize::try_from(resolved)
        .ok()
        .and_then(|i| items.get(i))
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("index {index} out of range for {} items", items.len()))
}

fn length(value: &Value, _: &[Value]) -> anyhow::Result<Value> {
    match value {
        Value::Array(items) => Ok(Value::from(items.len())),
        Value::String(s) => Ok(Value::from(s.chars().count())),
        other => anyhow::bail!("length expects a list or string, got {other}"),
    }
}

fn flatten(value: &Value, _: &[Value]) -> anyhow::Result<Value> {
    fn walk(value: &Value, out: &mut Vec<Value>) {
        match value {
            Value::Array(items) => items.iter().for_each(|item| walk(item, out)),
            other => out.push(other.clone()),
        }
    }

    let mut out = Vec::new();
    walk(value, &mut out);
    Ok(Value::Array(out))
}

fn basename(value: &Value, _: &[Value]) -> anyhow::Result<Value> {
    let path = as_path(value)?;
    Ok(Value::from(path.file_name().unwrap_or_default()))
}

fn dirname(value: &Value, _: &[Value]) -> anyhow::Result<Value> {
    let path = as_path(value)?;
    Ok(Value::from(path.parent().map(Utf8Path::as_str).unwrap_or_default()))
}

fn stem(value: &Value, _: &[Value]) -> anyhow::Result<Value> {
    let path = as_path(value)?;
    Ok(Value::from(path.file_stem().unwrap_or_default()))
}

fn suffix(value: &Value, args: &[Value]) -> anyhow::Result<Value> {
    let base = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let suffix = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("suffix needs a string argument"))?;
    Ok(Value::from(base + suffix))
}

fn wrap(value: &Value, _: &[Value]) -> anyhow::Result<Value> {
    Ok(Value::Array(vec![value.clone()]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins() {
        let reg = Transforms::new();
        let list = json!(["a", "b", "c"]);

        assert_eq!(reg.apply(&Transform::new("select").arg(1), &list).unwrap(), json!("b"));
        assert_eq!(reg.apply(&Transform::new("select").arg(-1), &list).unwrap(), json!("c"));
        assert!(reg.apply(&Transform::new("select").arg(3), &list).is_err());
        assert_eq!(reg.apply(&Transform::new("length"), &list).unwrap(), json!(3));
        assert_eq!(
            reg.apply(&Transform::new("flatten"), &json!([[1, 2], [3], 4])).unwrap(),
            json!([1, 2, 3, 4])
        );

        let path = json!("/data/sub-01/anat.nii");
        assert_eq!(reg.apply(&Transform::new("basename"), &path).unwrap(), json!("anat.nii"));
        assert_eq!(reg.apply(&Transform::new("dirname"), &path).unwrap(), json!("/data/sub-01"));
        assert_eq!(reg.apply(&Transform::new("stem"), &path).unwrap(), json!("anat"));
        assert_eq!(
            reg.apply(&Transform::new("suffix").arg("_brain"), &json!("anat")).unwrap(),
            json!("anat_brain")
        );
        assert_eq!(reg.apply(&Transform::new("wrap"), &json!(1)).unwrap(), json!([1]));
    }

    #[test]
    fn test_register_and_merge() {
        fn double(value: &Value, _: &[Value]) -> anyhow::Result<Value> {
            Ok(json!(value.as_i64().unwrap_or_default() * 2))
        }

        let mut inner = Transforms::new();
        inner.register("double", double);

        let mut outer = Transforms::new();
        assert!(outer.check(&Transform::new("double")).is_err());
        outer.merge(&inner);
        assert!(outer.check(&Transform::new("double")).is_ok());
        assert_eq!(outer.apply(&Transform::new("double"), &json!(21)).unwrap(), json!(42));
    }

    #[test]
    fn test_display() {
        assert_eq!(Transform::new("select").arg(0).to_string(), "select(0)");
        assert_eq!(Transform::new("stem").to_string(), "stem");
    }
}
