//! Fingerprints, marker files and persisted results.
//!
//! Every node working directory doubles as a cache entry. Its state on disk
//! is described by at most one marker file:
//!
//! * `_0x<hex>.json`: a run with fingerprint `<hex>` finished and its result
//!   was saved next to it,
//! * `_0x<hex>_unfinished.json`: a run with fingerprint `<hex>` started and
//!   either failed or never got to finish.
//!
//! The unfinished marker is written before the work unit runs and renamed
//! into the finished one once the result is on disk, so a crash at any point
//! leaves the directory in a state that is recognizably not reusable.

use std::collections::BTreeSet;
use std::fs;
use std::io::BufReader;
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{Config, HashMethod};
use crate::core::{Fields, Hash32, Value};
use crate::error::{CacheError, NodeError};
use crate::interface::{FieldKind, Interface, Runtime};
use crate::utils::{walk_files, write_atomic};

/// Tag identifying the persisted result format.
pub const RESULT_SCHEMA: &str = "nagare/node-result";
/// Bumped whenever [`NodeResult`] changes shape.
pub const RESULT_VERSION: u32 = 1;

pub(crate) const INPUTS_FILE: &str = "_inputs.cbor";
pub(crate) const MARKER_PREFIX: &str = "_0x";
pub(crate) const RESULT_PREFIX: &str = "result_";

/// Immutable snapshot of a finished node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    /// Name of the work unit that produced the result.
    pub interface: String,
    /// Hex digest of the fingerprint the result was produced under.
    pub fingerprint: String,
    /// `None` when the outputs were recovered from the working directory
    /// rather than produced by a run.
    pub runtime: Option<Runtime>,
    pub inputs: Fields,
    pub outputs: Fields,
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    schema: String,
    version: u32,
    result: T,
}

pub(crate) fn result_file(dir: &Utf8Path, name: &str) -> Utf8PathBuf {
    dir.join(format!("{RESULT_PREFIX}{name}.cbor"))
}

/// Loads the result persisted in `dir` for the node called `name`.
pub fn load_result(dir: &Utf8Path, name: &str) -> Result<NodeResult, CacheError> {
    let file = fs::File::open(result_file(dir, name))?;
    let envelope: Envelope<Value> = ciborium::from_reader(BufReader::new(file))
        .map_err(|e| CacheError::Decode(e.to_string()))?;

    if envelope.schema != RESULT_SCHEMA {
        return Err(CacheError::Schema {
            found: envelope.schema,
            expected: RESULT_SCHEMA.into(),
        });
    }
    if envelope.version != RESULT_VERSION {
        return Err(CacheError::Version {
            found: envelope.version,
            expected: RESULT_VERSION,
        });
    }

    serde_json::from_value(envelope.result).map_err(|e| CacheError::Decode(e.to_string()))
}

pub(crate) fn save_result(dir: &Utf8Path, name: &str, result: &NodeResult) -> Result<(), CacheError> {
    let envelope = Envelope {
        schema: RESULT_SCHEMA.to_string(),
        version: RESULT_VERSION,
        result,
    };

    let mut buffer = Vec::new();
    ciborium::into_writer(&envelope, &mut buffer).map_err(|e| CacheError::Encode(e.to_string()))?;
    write_atomic(&result_file(dir, name), &buffer)?;
    Ok(())
}

pub(crate) fn save_inputs(dir: &Utf8Path, inputs: &Fields) -> Result<(), CacheError> {
    let mut buffer = Vec::new();
    ciborium::into_writer(inputs, &mut buffer).map_err(|e| CacheError::Encode(e.to_string()))?;
    write_atomic(&dir.join(INPUTS_FILE), &buffer)?;
    Ok(())
}

/// Content-aware digest of a node's effective inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    hash: Hash32,
    content: String,
}

impl Fingerprint {
    /// Fingerprints `inputs` as seen by `interface`.
    ///
    /// File and directory values are replaced by a description of what they
    /// reference, so the digest follows the data rather than where it lives.
    /// Paths that don't exist (yet) are hashed verbatim.
    pub fn compute(
        interface: &dyn Interface,
        inputs: &Fields,
        needed: Option<&BTreeSet<String>>,
        config: &Config,
    ) -> Result<Self, NodeError> {
        let spec = interface.inputs();
        let mut hashed = serde_json::Map::new();

        for (name, value) in inputs {
            let repr = match spec.get(name) {
                Some(field) if !field.hash => continue,
                Some(field) if field.kind.has_paths() => {
                    describe(&field.kind, value, config.hash_method)?
                }
                _ => value.clone(),
            };
            hashed.insert(name.clone(), repr);
        }

        let mut doc = json!({
            "interface": interface.name(),
            "version": interface.version(),
            "inputs": hashed,
        });
        if config.remove_unnecessary_outputs
            && let Some(needed) = needed
        {
            doc["needed_outputs"] = json!(needed);
        }

        let content = canonical(&doc);
        Ok(Self {
            hash: Hash32::hash(content.as_bytes()),
            content,
        })
    }

    pub fn hash(&self) -> Hash32 {
        self.hash
    }

    pub fn to_hex(&self) -> String {
        self.hash.to_hex()
    }

    /// The canonical JSON document the digest was computed over.
    pub fn content(&self) -> &str {
        &self.content
    }
}

/// JSON with object keys sorted at every level. Objects are backed by a
/// sorted map, so plain serialization already yields that order.
pub(crate) fn canonical(value: &Value) -> String {
    value.to_string()
}

fn describe(kind: &FieldKind, value: &Value, method: HashMethod) -> std::io::Result<Value> {
    match (kind, value) {
        (FieldKind::File | FieldKind::Directory, Value::String(path)) => {
            describe_path(Utf8Path::new(path), method)
        }
        (FieldKind::List(inner) | FieldKind::Set(inner), Value::Array(items)) => describe_all(inner, items, method),
        // mapped fields hold a list of their element kind
        (FieldKind::File | FieldKind::Directory, Value::Array(items)) => describe_all(kind, items, method),
        (_, other) => Ok(other.clone()),
    }
}

fn describe_all(kind: &FieldKind, items: &[Value], method: HashMethod) -> std::io::Result<Value> {
    items
        .iter()
        .map(|item| describe(kind, item, method))
        .collect::<std::io::Result<Vec<_>>>()
        .map(Value::Array)
}

fn describe_path(path: &Utf8Path, method: HashMethod) -> std::io::Result<Value> {
    let Ok(meta) = fs::metadata(path) else {
        return Ok(Value::String(path.to_string()));
    };

    if meta.is_dir() {
        let mut entries = Vec::new();
        for file in walk_files(path)? {
            let relative = file.strip_prefix(path).unwrap_or(&file).to_string();
            entries.push(json!([relative, describe_file(&file, method)?]));
        }
        return Ok(Value::Array(entries));
    }

    describe_file(path, method)
}

fn describe_file(path: &Utf8Path, method: HashMethod) -> std::io::Result<Value> {
    match method {
        HashMethod::Content => Ok(json!({ "content": Hash32::hash_file(path)?.to_hex() })),
        HashMethod::Timestamp => {
            let meta = fs::metadata(path)?;
            let mtime = meta
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos().to_string())
                .unwrap_or_default();
            Ok(json!({ "size": meta.len(), "mtime": mtime }))
        }
    }
}

/// Lifecycle of a cache entry during one run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Unknown,
    HashChecked,
    Hit,
    MustRun,
    Done,
    Failed,
}

/// What the engine should do with a node after looking at its directory.
#[derive(Debug)]
pub(crate) enum Decision {
    Hit(NodeResult),
    Run { resume: bool },
}

pub(crate) struct Policy {
    /// Ignore any finished marker.
    pub force: bool,
    /// The work unit may continue in a partially populated directory.
    pub resumable: bool,
}

/// The working directory of one node, seen as a cache entry.
pub(crate) struct CacheEntry {
    dir: Utf8PathBuf,
    name: String,
    fingerprint: Fingerprint,
    state: CacheState,
}

impl CacheEntry {
    pub(crate) fn new(dir: Utf8PathBuf, name: &str, fingerprint: Fingerprint) -> Self {
        Self {
            dir,
            name: name.to_string(),
            fingerprint,
            state: CacheState::Unknown,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> CacheState {
        self.state
    }

    pub(crate) fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    fn transition(&mut self, to: CacheState) {
        use CacheState::*;
        debug_assert!(
            matches!(
                (self.state, to),
                (Unknown, HashChecked)
                    | (HashChecked, Hit | MustRun)
                    | (MustRun, Done | Failed)
            ),
            "illegal cache transition {:?} -> {to:?}",
            self.state
        );
        self.state = to;
    }

    fn marker(&self) -> Utf8PathBuf {
        self.dir
            .join(format!("{MARKER_PREFIX}{}.json", self.fingerprint.to_hex()))
    }

    fn unfinished(&self) -> Utf8PathBuf {
        self.dir
            .join(format!("{MARKER_PREFIX}{}_unfinished.json", self.fingerprint.to_hex()))
    }

    fn markers(&self) -> Result<Vec<Utf8PathBuf>, NodeError> {
        let pattern = format!(
            "{}/{MARKER_PREFIX}*.json",
            glob::Pattern::escape(self.dir.as_str())
        );
        let paths = glob::glob(&pattern).map_err(|e| std::io::Error::other(e.to_string()))?;

        let mut markers = Vec::new();
        for path in paths.flatten() {
            if let Ok(path) = Utf8PathBuf::try_from(path) {
                markers.push(path);
            }
        }
        Ok(markers)
    }

    fn purge(&self) -> std::io::Result<()> {
        if self.dir.exists() {
            tracing::debug!("purging {}", self.dir);
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }

    /// Decides between reusing and (re)running.
    ///
    /// Whenever the decision is to run from scratch the directory is removed,
    /// so the caller always starts from an empty or a resumable directory.
    pub(crate) fn inspect(
        &mut self,
        policy: Policy,
        interface: &str,
        inputs: &Fields,
        reaggregate: impl FnOnce() -> anyhow::Result<Fields>,
    ) -> Result<Decision, NodeError> {
        self.transition(CacheState::HashChecked);
        let markers = self.markers()?;

        if markers.len() > 1 {
            tracing::warn!("{} holds {} markers, discarding all", self.dir, markers.len());
            for marker in &markers {
                fs::remove_file(marker)?;
            }
            return self.must_run(false);
        }

        if policy.force {
            return self.must_run(false);
        }

        let Some(found) = markers.into_iter().next() else {
            return self.must_run(false);
        };

        if found == self.marker() {
            match load_result(&self.dir, &self.name) {
                Ok(result) if result.fingerprint == self.fingerprint.to_hex() => {
                    self.transition(CacheState::Hit);
                    return Ok(Decision::Hit(result));
                }
                Ok(_) => tracing::warn!("result in {} has a foreign fingerprint", self.dir),
                Err(e) => tracing::warn!("discarding cached result in {}: {e}", self.dir),
            }

            match reaggregate() {
                Ok(outputs) => {
                    let result = NodeResult {
                        interface: interface.to_string(),
                        fingerprint: self.fingerprint.to_hex(),
                        runtime: None,
                        inputs: inputs.clone(),
                        outputs,
                    };
                    save_result(&self.dir, &self.name, &result)?;
                    self.transition(CacheState::Hit);
                    return Ok(Decision::Hit(result));
                }
                Err(e) => tracing::warn!("couldn't recover outputs in {}: {e:#}", self.dir),
            }
            return self.must_run(false);
        }

        if found == self.unfinished() && policy.resumable {
            tracing::debug!("resuming in {}", self.dir);
            return self.must_run(true);
        }

        tracing::debug!("stale marker {found}");
        self.must_run(false)
    }

    fn must_run(&mut self, resume: bool) -> Result<Decision, NodeError> {
        if !resume {
            self.purge()?;
        }
        self.transition(CacheState::MustRun);
        Ok(Decision::Run { resume })
    }

    /// Marks the directory as in-flight. The directory must exist.
    pub(crate) fn begin(&self) -> Result<(), NodeError> {
        write_atomic(&self.unfinished(), self.fingerprint.content().as_bytes())?;
        Ok(())
    }

    /// Persists the result and promotes the marker to finished.
    pub(crate) fn commit(&mut self, result: &NodeResult) -> Result<(), NodeError> {
        save_result(&self.dir, &self.name, result)?;
        fs::rename(self.unfinished(), self.marker())?;
        self.transition(CacheState::Done);
        Ok(())
    }

    /// Records a failed run. The unfinished marker stays in place.
    pub(crate) fn fail(&mut self) {
        self.transition(CacheState::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{FieldSpec, Function, Spec};

    fn touch() -> Function {
        Function::with_spec(
            "touch",
            Spec::new()
                .field("in_file", FieldSpec::file())
                .field("threads", FieldSpec::int().nohash()),
            Spec::any(["out"]),
            |_, _| Ok(Fields::new()),
        )
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    fn policy() -> Policy {
        Policy {
            force: false,
            resumable: false,
        }
    }

    #[test]
    fn test_fingerprint_follows_content_not_path() {
        let (_guard, root) = tempdir();
        let config = Config::default();
        let unit = touch();

        fs::write(root.join("a.txt"), "same").unwrap();
        fs::write(root.join("b.txt"), "same").unwrap();
        fs::write(root.join("c.txt"), "different").unwrap();

        let fp = |file: &str, threads: i64| {
            let inputs = Fields::new()
                .with("in_file", root.join(file).as_str())
                .with("threads", threads);
            Fingerprint::compute(&unit, &inputs, None, &config).unwrap()
        };

        assert_eq!(fp("a.txt", 1), fp("b.txt", 1));
        assert_ne!(fp("a.txt", 1), fp("c.txt", 1));
        // excluded from hashing
        assert_eq!(fp("a.txt", 1), fp("a.txt", 8));
    }

    #[test]
    fn test_file_lists_under_a_file_field_are_hashed_by_content() {
        let (_guard, root) = tempdir();
        let config = Config::default();
        let unit = touch();
        let file = root.join("a.txt");

        let fp = || {
            let inputs = Fields::new().with("in_file", json!([file.as_str()]));
            Fingerprint::compute(&unit, &inputs, None, &config).unwrap()
        };

        fs::write(&file, "before").unwrap();
        let before = fp();
        fs::write(&file, "after").unwrap();
        assert_ne!(before, fp());
    }

    #[test]
    fn test_fingerprint_folds_needed_outputs() {
        let config = Config::default();
        let unit = touch();
        let inputs = Fields::new().with("threads", 1);

        let needed: BTreeSet<String> = ["out".to_string()].into();
        let all = Fingerprint::compute(&unit, &inputs, None, &config).unwrap();
        let pruned = Fingerprint::compute(&unit, &inputs, Some(&needed), &config).unwrap();
        assert_ne!(all, pruned);
        assert!(pruned.content().contains("needed_outputs"));
    }

    #[test]
    fn test_canonical_sorts_keys() {
        let value = json!({ "b": 1, "a": { "d": [1, 2], "c": null } });
        assert_eq!(canonical(&value), r#"{"a":{"c":null,"d":[1,2]},"b":1}"#);
    }

    #[test]
    fn test_entry_lifecycle() {
        let (_guard, root) = tempdir();
        let dir = root.join("node");
        let config = Config::default();
        let inputs = Fields::new().with("threads", 1);
        let fingerprint = Fingerprint::compute(&touch(), &inputs, None, &config).unwrap();

        let mut entry = CacheEntry::new(dir.clone(), "node", fingerprint.clone());
        let decision = entry
            .inspect(policy(), "touch", &inputs, || anyhow::bail!("nothing to recover"))
            .unwrap();
        assert!(matches!(decision, Decision::Run { resume: false }));

        fs::create_dir_all(&dir).unwrap();
        entry.begin().unwrap();
        assert!(entry.unfinished().exists());

        let result = NodeResult {
            interface: "touch".into(),
            fingerprint: fingerprint.to_hex(),
            runtime: Some(Runtime::default()),
            inputs: inputs.clone(),
            outputs: Fields::new().with("out", 3),
        };
        entry.commit(&result).unwrap();
        assert_eq!(entry.state(), CacheState::Done);
        assert!(!entry.unfinished().exists());
        assert!(entry.marker().exists());

        let mut again = CacheEntry::new(dir.clone(), "node", fingerprint);
        match again
            .inspect(policy(), "touch", &inputs, || anyhow::bail!("unused"))
            .unwrap()
        {
            Decision::Hit(cached) => assert_eq!(cached, result),
            other => panic!("expected a hit, got {other:?}"),
        }
    }

    #[test]
    fn test_unreadable_result_is_reaggregated() {
        let (_guard, root) = tempdir();
        let dir = root.join("node");
        let config = Config::default();
        let inputs = Fields::new();
        let fingerprint = Fingerprint::compute(&touch(), &inputs, None, &config).unwrap();

        fs::create_dir_all(&dir).unwrap();
        let mut entry = CacheEntry::new(dir.clone(), "node", fingerprint.clone());
        fs::write(entry.marker(), "{}").unwrap();
        fs::write(result_file(&dir, "node"), b"garbage").unwrap();

        let decision = entry
            .inspect(policy(), "touch", &inputs, || Ok(Fields::new().with("out", 7)))
            .unwrap();
        match decision {
            Decision::Hit(result) => {
                assert!(result.runtime.is_none());
                assert_eq!(result.outputs.get("out"), Some(&json!(7)));
            }
            other => panic!("expected a hit, got {other:?}"),
        }
        assert_eq!(load_result(&dir, "node").unwrap().outputs.int("out").unwrap(), 7);
    }

    #[test]
    fn test_version_mismatch_is_a_cache_error() {
        let (_guard, dir) = tempdir();
        let envelope = Envelope {
            schema: RESULT_SCHEMA.to_string(),
            version: RESULT_VERSION + 1,
            result: json!({}),
        };
        let mut buffer = Vec::new();
        ciborium::into_writer(&envelope, &mut buffer).unwrap();
        fs::write(result_file(&dir, "n"), buffer).unwrap();

        assert!(matches!(
            load_result(&dir, "n"),
            Err(CacheError::Version { found, .. }) if found == RESULT_VERSION + 1
        ));
    }

    #[test]
    fn test_multiple_markers_force_rerun() {
        let (_guard, root) = tempdir();
        let dir = root.join("node");
        let config = Config::default();
        let inputs = Fields::new();
        let fingerprint = Fingerprint::compute(&touch(), &inputs, None, &config).unwrap();

        fs::create_dir_all(&dir).unwrap();
        let mut entry = CacheEntry::new(dir.clone(), "node", fingerprint);
        fs::write(entry.marker(), "{}").unwrap();
        fs::write(dir.join("_0xdeadbeef.json"), "{}").unwrap();
        fs::write(dir.join("leftover.txt"), "x").unwrap();

        let decision = entry
            .inspect(policy(), "touch", &inputs, || anyhow::bail!("unused"))
            .unwrap();
        assert!(matches!(decision, Decision::Run { resume: false }));
        assert!(!dir.exists());
    }

    #[test]
    fn test_unfinished_marker_resumes_only_when_allowed() {
        let (_guard, root) = tempdir();
        let dir = root.join("node");
        let config = Config::default();
        let inputs = Fields::new();
        let fingerprint = Fingerprint::compute(&touch(), &inputs, None, &config).unwrap();

        fs::create_dir_all(&dir).unwrap();
        let entry = CacheEntry::new(dir.clone(), "node", fingerprint.clone());
        entry.begin().unwrap();
        fs::write(dir.join("partial.dat"), "x").unwrap();

        let mut resumable = CacheEntry::new(dir.clone(), "node", fingerprint.clone());
        let decision = resumable
            .inspect(
                Policy {
                    force: false,
                    resumable: true,
                },
                "touch",
                &inputs,
                || anyhow::bail!("unused"),
            )
            .unwrap();
        assert!(matches!(decision, Decision::Run { resume: true }));
        assert!(dir.join("partial.dat").exists());

        let mut fresh = CacheEntry::new(dir.clone(), "node", fingerprint);
        let decision = fresh
            .inspect(policy(), "touch", &inputs, || anyhow::bail!("unused"))
            .unwrap();
        assert!(matches!(decision, Decision::Run { resume: false }));
        assert!(!dir.exists());
    }
}
