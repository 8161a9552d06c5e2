//! Field paths and ordered, leaf-scoped updates for JSON documents.
//!
//! Document writes never replace a parent object. Every mutation is a list of
//! `(path, value)` pairs where each path addresses a single leaf, so two writers
//! touching different leaves of the same document cannot lose each other's
//! changes.
//!
//! Paths are stored as segment vectors rather than dotted strings. Step ids
//! such as `charts:1h` or `charts.v2` are therefore safe to use as a segment.

use std::fmt;

use serde_json::{Map, Value};

/// Path to a single field inside a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Builds a path from its segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Splits a dotted path (`outputs.outputsManifestGcsUri`) into segments.
    ///
    /// Use [`FieldPath::new`] when a segment may itself contain a dot.
    pub fn dotted(path: &str) -> Self {
        Self::new(path.split('.').filter(|segment| !segment.is_empty()))
    }

    /// Returns a new path with `segment` appended.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// Returns a new path with every segment of `suffix` appended.
    pub fn join(&self, suffix: &FieldPath) -> Self {
        let mut segments = self.0.clone();
        segments.extend(suffix.0.iter().cloned());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Renders the path the way Firestore field paths are written: plain
/// identifiers joined by dots, other segments quoted in backticks.
impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, segment) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(".")?;
            }
            if is_simple_segment(segment) {
                f.write_str(segment)?;
            } else {
                write!(f, "`{}`", segment.replace('`', "\\`"))?;
            }
        }
        Ok(())
    }
}

fn is_simple_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

/// Ordered set of leaf updates applied atomically by a document store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldUpdates(Vec<(FieldPath, Value)>);

impl FieldUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an update, replacing an earlier update of the same path.
    pub fn set(mut self, path: FieldPath, value: impl Into<Value>) -> Self {
        let value = value.into();
        if let Some(existing) = self.0.iter_mut().find(|(existing, _)| *existing == path) {
            existing.1 = value;
        } else {
            self.0.push((path, value));
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &(FieldPath, Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the value staged for `path`, if any.
    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        self.0.iter().find(|(candidate, _)| candidate == path).map(|(_, value)| value)
    }

    /// Applies every update to `document` in order.
    pub fn apply_to(&self, document: &mut Map<String, Value>) {
        for (path, value) in &self.0 {
            set_path(document, path, value.clone());
        }
    }
}

/// Sets a single leaf, creating intermediate objects as needed.
///
/// An intermediate value that is not an object is replaced by an empty object;
/// sibling keys of every intermediate object are preserved.
pub fn set_path(document: &mut Map<String, Value>, path: &FieldPath, value: Value) {
    let Some((leaf, parents)) = path.segments().split_last() else {
        return;
    };

    let mut current = document;
    for segment in parents {
        let entry = current.entry(segment.clone()).or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert(leaf.clone(), value);
}

/// Reads a value at `path`, or `None` when any segment is missing.
pub fn get_path<'a>(document: &'a Map<String, Value>, path: &FieldPath) -> Option<&'a Value> {
    let (first, rest) = path.segments().split_first()?;
    let mut current = document.get(first)?;
    for segment in rest {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}
