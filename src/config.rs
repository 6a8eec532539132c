use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// How file-valued inputs contribute to a node's fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashMethod {
    /// Hash the full content of every referenced file.
    #[default]
    Content,
    /// Hash only the size and modification time of every referenced file.
    Timestamp,
}

/// Engine configuration.
///
/// A `Config` is owned by the top-level [`Workflow`](crate::Workflow) and is
/// handed to every stage of a run: expansion uses it to lay out working
/// directories, the cache uses it to fingerprint inputs and the janitor uses
/// it to decide what to keep. Nothing in the engine reads configuration from
/// global state.
///
/// The struct deserializes with defaults for every missing field, so it can be
/// embedded in whatever configuration format the host application uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root under which every node working directory is created.
    pub base_dir: Utf8PathBuf,
    /// Fingerprinting strategy for file inputs.
    pub hash_method: HashMethod,
    /// Delete files produced for outputs that no downstream node consumes.
    pub remove_unnecessary_outputs: bool,
    /// Keep files copied into the working directory for copy-on-run inputs.
    pub keep_inputs: bool,
    /// Abort the run as soon as any node fails.
    pub stop_on_first_crash: bool,
    /// Re-run every node regardless of its cache state.
    pub overwrite: bool,
    /// Use readable `_field_value` directory names for parameterized nodes;
    /// when off, the names are replaced by their hash.
    pub parameterize_dirs: bool,
    /// Directory receiving crash dumps of failed nodes.
    pub crashdump_dir: Option<Utf8PathBuf>,
    /// Write `provenance.json` for every run.
    pub write_provenance: bool,
    /// Append per-node resource usage to `resources.jsonl`.
    pub resource_monitor: bool,
    /// Write the human readable `_report/report.md` for each node.
    pub write_reports: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: Utf8PathBuf::from(".cache/nagare"),
            hash_method: HashMethod::Content,
            remove_unnecessary_outputs: true,
            keep_inputs: false,
            stop_on_first_crash: false,
            overwrite: false,
            parameterize_dirs: true,
            crashdump_dir: None,
            write_provenance: false,
            resource_monitor: false,
            write_reports: true,
        }
    }
}

impl Config {
    /// Creates the default configuration rooted at `base_dir`.
    pub fn new(base_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }
}
