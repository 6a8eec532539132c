use std::collections::HashSet;

use crate::cache::canonical;
use crate::core::{Fields, Value};
use crate::node::Node;

#[derive(Debug, Clone)]
pub(crate) struct JoinSpec {
    /// The iterable node whose branches are joined. Resolved to that node's
    /// full name when the workflow is flattened.
    pub source: String,
    pub fields: Vec<String>,
    pub unique: bool,
    /// Number of slot fields created during expansion, one per branch.
    pub slots: usize,
}

impl JoinSpec {
    pub(crate) fn new(source: String, fields: Vec<String>) -> Self {
        Self {
            source,
            fields,
            unique: false,
            slots: 0,
        }
    }

    pub(crate) fn is_join_field(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }
}

pub(crate) fn slot_name(field: &str, ordinal: usize) -> String {
    format!("{field}{ordinal}")
}

/// Gathers the slot fields of every join field into the real field.
///
/// Set-kinded fields are deduplicated and sorted; everything else keeps the
/// branch order, deduplicated only when the join is `unique`.
pub(crate) fn collate(node: &Node, spec: &JoinSpec, inputs: &mut Fields) {
    if spec.slots == 0 {
        return;
    }

    for field in &spec.fields {
        let values: Vec<Value> = (1..=spec.slots)
            .filter_map(|ordinal| inputs.remove(&slot_name(field, ordinal)))
            .collect();
        if values.is_empty() {
            continue;
        }

        let is_set = node
            .interface
            .inputs()
            .get(field)
            .is_some_and(|spec| spec.kind.is_set());

        let values = if is_set {
            let mut keyed: Vec<(String, Value)> =
                values.into_iter().map(|value| (canonical(&value), value)).collect();
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            keyed.dedup_by(|a, b| a.0 == b.0);
            keyed.into_iter().map(|(_, value)| value).collect()
        } else if spec.unique {
            let mut seen = HashSet::new();
            values
                .into_iter()
                .filter(|value| seen.insert(canonical(value)))
                .collect()
        } else {
            values
        };

        inputs.insert(field.clone(), Value::Array(values));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{FieldKind, FieldSpec, Function, Spec};
    use crate::node::Kind;
    use serde_json::json;

    fn joiner() -> Node {
        let unit = Function::with_spec(
            "collect",
            Spec::new()
                .field("items", FieldSpec::list(FieldKind::Int))
                .field("tags", FieldSpec::set(FieldKind::Str)),
            Spec::any(["out"]),
            |_, _| Ok(Fields::new()),
        );
        Node::join("collect", unit, "source", ["items", "tags"])
    }

    fn slotted(node: &mut Node, slots: usize) -> JoinSpec {
        let Kind::Join(spec) = &mut node.kind else {
            unreachable!()
        };
        spec.slots = slots;
        spec.clone()
    }

    #[test]
    fn test_collate_list_and_set() {
        let mut node = joiner();
        let spec = slotted(&mut node, 3);

        let mut inputs = Fields::new()
            .with("items1", 3)
            .with("items2", 1)
            .with("items3", 3)
            .with("tags1", "b")
            .with("tags2", "a")
            .with("tags3", "b");
        collate(&node, &spec, &mut inputs);

        assert_eq!(inputs.get("items"), Some(&json!([3, 1, 3])));
        assert_eq!(inputs.get("tags"), Some(&json!(["a", "b"])));
        assert!(!inputs.contains("items1"));
        assert!(!inputs.contains("tags3"));
    }

    #[test]
    fn test_collate_unique_keeps_first_occurrence() {
        let mut node = joiner().unique();
        let spec = slotted(&mut node, 3);

        let mut inputs = Fields::new()
            .with("items1", 3)
            .with("items2", 1)
            .with("items3", 3);
        collate(&node, &spec, &mut inputs);
        assert_eq!(inputs.get("items"), Some(&json!([3, 1])));
    }
}
