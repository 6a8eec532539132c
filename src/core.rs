use std::collections::BTreeMap;
use std::collections::btree_map;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// The value carried by a single input or output field.
///
/// Field values are plain JSON data. File-valued fields hold their path as a
/// string; whether a string is treated as a path is decided by the field's
/// declared [`FieldKind`](crate::FieldKind), never by looking at the value.
pub type Value = serde_json::Value;

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
///
/// In `nagare`, this serves two purposes:
/// 1. It is the digest behind every node [`Fingerprint`](crate::Fingerprint),
///    deciding whether a cached result can be reused.
/// 2. It hashes file contents referenced by inputs, so that moving a file
///    without changing it does not invalidate anything.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub(crate) fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A named set of field values, sorted by field name.
///
/// `Fields` is used for node inputs as well as outputs. A field that is absent
/// is *undefined*; this is different from a field explicitly set to `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fields(BTreeMap<String, Value>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Returns the value of a field, failing if it is undefined.
    pub fn require(&self, name: &str) -> anyhow::Result<&Value> {
        self.0
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("field '{name}' is undefined"))
    }

    /// Returns a field as an integer.
    pub fn int(&self, name: &str) -> anyhow::Result<i64> {
        self.require(name)?
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("field '{name}' is not an integer"))
    }

    /// Returns a field as a string slice.
    pub fn str(&self, name: &str) -> anyhow::Result<&str> {
        self.require(name)?
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("field '{name}' is not a string"))
    }

    /// Returns a field as a path.
    pub fn path(&self, name: &str) -> anyhow::Result<Utf8PathBuf> {
        self.str(name).map(Utf8PathBuf::from)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str, &Value) -> bool) {
        self.0.retain(|key, value| keep(key, value));
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Fields {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for Fields {
    type Item = (String, Value);
    type IntoIter = btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<K, V> FromIterator<(K, V)> for Fields
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

/// Renders a value the way it should appear inside a directory name.
///
/// Strings are used verbatim (without quotes), everything else as compact
/// JSON. Path separators become `..`, commas become `.` and characters that
/// are awkward in shells are dropped.
pub(crate) fn path_safe(value: &Value) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let mut out = String::with_capacity(raw.len());
    for c in raw.replace('/', "..").chars() {
        match c {
            '[' | ']' | ' ' | '(' | ')' | '{' | '}' | '?' | ':' | '<' | '>' | '#' | '!' | '|'
            | '"' | '\'' | ';' => {}
            ',' => out.push('.'),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_hex() {
        let hash = Hash32::hash(b"nagare");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hex, format!("{hash}"));
    }

    #[test]
    fn test_hash_file_matches_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, b"some content").unwrap();

        assert_eq!(
            Hash32::hash_file(&path).unwrap(),
            Hash32::hash(b"some content")
        );
    }

    #[test]
    fn test_fields_accessors() {
        let fields = Fields::new()
            .with("n", 3)
            .with("name", "subject")
            .with("file", "/data/a.txt");

        assert_eq!(fields.int("n").unwrap(), 3);
        assert_eq!(fields.str("name").unwrap(), "subject");
        assert_eq!(fields.path("file").unwrap(), Utf8PathBuf::from("/data/a.txt"));
        assert!(fields.int("name").is_err());
        assert!(fields.require("missing").is_err());
        assert_eq!(fields.keys().collect::<Vec<_>>(), vec!["file", "n", "name"]);
    }

    #[test]
    fn test_path_safe() {
        assert_eq!(path_safe(&json!(1)), "1");
        assert_eq!(path_safe(&json!("a/b.nii")), "a..b.nii");
        assert_eq!(path_safe(&json!([1, 2])), "1.2");
        assert_eq!(path_safe(&json!("x y")), "xy");
    }
}
