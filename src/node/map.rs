use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use camino::Utf8Path;
use rayon::prelude::*;

use crate::cache::{self, CacheEntry, Decision, Fingerprint, NodeResult, Policy};
use crate::core::{Fields, Value};
use crate::error::{MapFailure, NodeError};
use crate::interface::Runtime;
use crate::node::{Env, Kind, Node, Outcome, Prepared};
use crate::report;
use crate::utils::hostname;

#[derive(Debug, Clone)]
pub(crate) struct MapSpec {
    pub iterfields: Vec<String>,
    pub nested: bool,
    pub serial: bool,
}

impl MapSpec {
    pub(crate) fn new(iterfields: Vec<String>) -> Self {
        Self {
            iterfields,
            nested: false,
            serial: false,
        }
    }
}

/// Nesting structure of a list, so that leaves can be put back in place.
#[derive(Debug, Clone, PartialEq)]
enum Shape {
    Leaf,
    List(Vec<Shape>),
}

fn flatten(value: &Value, leaves: &mut Vec<Value>) -> Shape {
    match value {
        Value::Array(items) => Shape::List(items.iter().map(|item| flatten(item, leaves)).collect()),
        other => {
            leaves.push(other.clone());
            Shape::Leaf
        }
    }
}

fn restore(shape: &Shape, leaves: &mut impl Iterator<Item = Value>) -> Value {
    match shape {
        Shape::Leaf => leaves.next().unwrap_or(Value::Null),
        Shape::List(items) => Value::Array(items.iter().map(|item| restore(item, leaves)).collect()),
    }
}

/// Splits the iterfields into per-element columns of equal length.
fn split(spec: &MapSpec, inputs: &Fields) -> Result<(Vec<(String, Vec<Value>)>, Option<Shape>), NodeError> {
    let mut columns = Vec::new();
    let mut shape = None;

    for field in &spec.iterfields {
        let value = inputs
            .get(field)
            .ok_or_else(|| NodeError::MissingInput(field.clone()))?;
        let Value::Array(items) = value else {
            return Err(NodeError::NotAList(field.clone()));
        };

        let values = if spec.nested {
            let mut leaves = Vec::new();
            let nesting = flatten(value, &mut leaves);
            shape.get_or_insert(nesting);
            leaves
        } else {
            items.clone()
        };
        columns.push((field.clone(), values));
    }

    let lengths: Vec<(String, usize)> = columns
        .iter()
        .map(|(field, values)| (field.clone(), values.len()))
        .collect();
    if lengths.windows(2).any(|pair| pair[0].1 != pair[1].1) {
        return Err(NodeError::IterfieldLength(lengths));
    }

    Ok((columns, shape))
}

fn child(node: &Node, k: usize, dir: &Utf8Path) -> Node {
    let mut child = node.clone();
    child.name = format!("_{}{k}", node.name);
    child.id = format!("{}[{k}]", node.id);
    child.kind = Kind::Plain;
    child.iterables = None;
    child.input_source.clear();
    child.deferred.clear();
    child.output_dir = dir.join("mapflow").join(&child.name);
    child
}

/// Runs a map node: one child per element, each a full cache entry of its
/// own under `<dir>/mapflow/`, collated back in index order.
pub(crate) fn run(node: &Node, spec: &MapSpec, env: &Env<'_>, mut inputs: Fields) -> Result<Outcome, NodeError> {
    node.complete(&mut inputs, &spec.iterfields, spec.nested)?;
    let (columns, shape) = split(spec, &inputs)?;
    let count = columns.first().map(|(_, values)| values.len()).unwrap_or(0);

    let dir = node.output_dir.clone();
    let fullname = node.fullname();
    let needed = node.needed_outputs.as_ref();
    let fingerprint = Fingerprint::compute(node.interface.as_ref(), &inputs, needed, env.config)?;
    let mut entry = CacheEntry::new(dir.clone(), &node.name, fingerprint);

    // Children carry their own cache entries, so an interrupted map is always
    // picked up where it stopped.
    let policy = Policy {
        force: node.overwrite.unwrap_or(env.config.overwrite),
        resumable: true,
    };
    let decision = entry.inspect(policy, node.interface.name(), &inputs, || {
        anyhow::bail!("map results can't be recovered without their children")
    })?;
    if let Decision::Hit(result) = decision {
        tracing::debug!("{fullname}: cached");
        return Ok(Outcome {
            result: Arc::new(result),
            cached: true,
        });
    }

    fs::create_dir_all(&dir)?;
    cache::save_inputs(&dir, &inputs)?;
    if env.config.write_reports {
        report::write_pre(&dir, node, &inputs)?;
    }
    entry.begin()?;

    tracing::info!("mapping {fullname} over {count} element(s)");
    let started = Instant::now();
    let children: Vec<Node> = (0..count).map(|k| child(node, k, &dir)).collect();
    let stop = AtomicBool::new(false);

    let run_child = |k: usize| -> Option<Result<Outcome, NodeError>> {
        if stop.load(Ordering::Relaxed) {
            return None;
        }

        let mut child_inputs = inputs.clone();
        for (field, values) in &columns {
            child_inputs.insert(field.clone(), values[k].clone());
        }

        let child = &children[k];
        let outcome = child
            .prepare(env, child.output_dir.clone(), child_inputs)
            .and_then(|prepared| match prepared {
                Prepared::Cached(outcome) => Ok(outcome),
                Prepared::Ready(job) => {
                    let runtime = job.execute(env);
                    job.finish(env, runtime)
                }
            });

        if outcome.is_err() && env.config.stop_on_first_crash {
            stop.store(true, Ordering::Relaxed);
        }
        Some(outcome)
    };

    let outcomes: Vec<Option<Result<Outcome, NodeError>>> = if spec.serial {
        (0..count).map(run_child).collect()
    } else {
        (0..count).into_par_iter().map(run_child).collect()
    };

    let fields: Vec<&str> = node
        .interface
        .outputs()
        .names()
        .filter(|name| needed.is_none_or(|needed| needed.contains(*name)))
        .collect();
    let mut collated: Vec<Vec<Value>> = vec![Vec::with_capacity(count); fields.len()];
    let mut failures = Vec::new();

    for (k, outcome) in outcomes.into_iter().enumerate() {
        let outputs = match outcome {
            Some(Ok(outcome)) => Some(outcome.result),
            Some(Err(error)) => {
                failures.push((k, error));
                None
            }
            None => None,
        };

        for (column, field) in collated.iter_mut().zip(&fields) {
            let value = outputs
                .as_ref()
                .and_then(|result| result.outputs.get(field))
                .cloned()
                .unwrap_or(Value::Null);
            column.push(value);
        }
    }

    let mut outputs = Fields::new();
    for (field, values) in fields.iter().zip(collated) {
        let value = match &shape {
            Some(shape) => restore(shape, &mut values.into_iter()),
            None => Value::Array(values),
        };
        outputs.insert(*field, value);
    }

    if !failures.is_empty() {
        entry.fail();
        let error = if env.config.stop_on_first_crash {
            failures.remove(0).1
        } else {
            NodeError::Map(MapFailure {
                failures,
                partial: outputs,
            })
        };
        if env.config.write_reports
            && let Err(e) = report::write_post(&dir, Err(&error))
        {
            tracing::warn!("couldn't write report for {fullname}: {e}");
        }
        return Err(error);
    }

    let result = NodeResult {
        interface: node.interface.name().to_string(),
        fingerprint: entry.fingerprint().to_hex(),
        runtime: Some(Runtime {
            hostname: hostname(),
            duration: started.elapsed(),
            ..Runtime::default()
        }),
        inputs,
        outputs,
    };
    entry.commit(&result)?;
    if env.config.write_reports {
        report::write_post(&dir, Ok(&result))?;
    }

    tracing::info!("finished {fullname} in {:.2?}", started.elapsed());
    Ok(Outcome {
        result: Arc::new(result),
        cached: false,
    })
}
