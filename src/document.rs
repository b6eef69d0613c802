//! Pipeline document parsing structures
//!
//! A document is an ordered mapping from task name to `{input, output}`.
//! Declaration order is preserved: it breaks scheduling ties and fixes the
//! order in which `self.<field>` references become visible.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::ResolveError;

/// One task entry: an `input` object and an `output` object.
///
/// Field order inside both maps is declaration order (`serde_json` runs with
/// `preserve_order`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub output: Map<String, Value>,
}

/// Parsed pipeline document: ordered task name -> TaskSpec
#[derive(Debug, Clone)]
pub struct Document {
    tasks: Vec<(String, TaskSpec)>,
    index: HashMap<String, usize>,
}

impl Document {
    fn from_entries(entries: Vec<(String, TaskSpec)>) -> Result<Self, ResolveError> {
        let mut index = HashMap::with_capacity(entries.len());
        for (pos, (name, _)) in entries.iter().enumerate() {
            if index.insert(name.clone(), pos).is_some() {
                return Err(ResolveError::DuplicateTask { task: name.clone() });
            }
        }
        Ok(Self { tasks: entries, index })
    }

    pub fn from_json_str(text: &str) -> Result<Self, ResolveError> {
        let raw: DocumentRaw = serde_json::from_str(text)?;
        Self::from_entries(raw.0)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ResolveError> {
        let raw: DocumentRaw = serde_yaml::from_str(text)?;
        Self::from_entries(raw.0)
    }

    /// Load a document from disk, dispatching on the file extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ResolveError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        match extension {
            "json" => Self::from_json_str(&text),
            "yaml" | "yml" => Self::from_yaml_str(&text),
            other => Err(ResolveError::UnsupportedExtension {
                extension: other.to_string(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&TaskSpec> {
        self.index.get(name).map(|&pos| &self.tasks[pos].1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Position of a task in document order
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Iterate tasks in document order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TaskSpec)> {
        self.tasks.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    /// Task names in document order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|(name, _)| name.as_str())
    }
}

/// Raw entry list as it appears in the source, duplicates included.
/// Duplicate detection happens in `Document::from_entries` so the error is a
/// typed `DuplicateTask` rather than a serde message.
struct DocumentRaw(Vec<(String, TaskSpec)>);

impl<'de> Deserialize<'de> for DocumentRaw {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DocVisitor;

        impl<'de> Visitor<'de> for DocVisitor {
            type Value = DocumentRaw;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping from task name to {input, output}")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, spec)) = access.next_entry::<String, TaskSpec>()? {
                    entries.push((name, spec));
                }
                Ok(DocumentRaw(entries))
            }
        }

        deserializer.deserialize_map(DocVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "fetch_data": {
            "input": {"locale": "<%= locale %>"},
            "output": {"train": null, "dev": null}
        },
        "train": {
            "input": {"train_data": "<%= $.fetch_data.output.train %>"},
            "output": {"model": "./model/checkpoint"}
        }
    }"#;

    #[test]
    fn parse_preserves_document_order() {
        let doc = Document::from_json_str(DOC).unwrap();
        let names: Vec<_> = doc.names().collect();
        assert_eq!(names, vec!["fetch_data", "train"]);
        assert_eq!(doc.position("train"), Some(1));
    }

    #[test]
    fn get_task_by_name() {
        let doc = Document::from_json_str(DOC).unwrap();
        let spec = doc.get("fetch_data").unwrap();
        assert_eq!(spec.input.len(), 1);
        assert_eq!(spec.output.len(), 2);
        assert!(doc.get("preprocess").is_none());
    }

    #[test]
    fn duplicate_task_name_is_rejected() {
        let text = r#"{"a": {"input": {}, "output": {}}, "a": {"input": {}, "output": {}}}"#;
        let err = Document::from_json_str(text).unwrap_err();
        assert!(matches!(err, ResolveError::DuplicateTask { task } if task == "a"));
    }

    #[test]
    fn unknown_task_key_is_rejected() {
        let text = r#"{"a": {"input": {}, "output": {}, "command": "ls"}}"#;
        assert!(Document::from_json_str(text).is_err());
    }

    #[test]
    fn missing_input_defaults_to_empty() {
        let text = r#"{"a": {"output": {"path": "./out"}}}"#;
        let doc = Document::from_json_str(text).unwrap();
        assert!(doc.get("a").unwrap().input.is_empty());
    }

    #[test]
    fn yaml_document_round_trips() {
        let text = "fetch_data:\n  input:\n    locale: zh_CN\n  output:\n    train: null\n";
        let doc = Document::from_yaml_str(text).unwrap();
        assert_eq!(doc.len(), 1);
        assert_eq!(
            doc.get("fetch_data").unwrap().input["locale"],
            Value::String("zh_CN".to_string())
        );
    }

    #[test]
    fn from_path_dispatches_on_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("pipeline.json");
        std::fs::write(&json_path, DOC).unwrap();
        let doc = Document::from_path(&json_path).unwrap();
        assert_eq!(doc.len(), 2);

        let odd_path = dir.path().join("pipeline.toml");
        std::fs::write(&odd_path, "x = 1").unwrap();
        let err = Document::from_path(&odd_path).unwrap_err();
        assert!(matches!(err, ResolveError::UnsupportedExtension { .. }));
    }

    #[test]
    fn input_field_order_is_declaration_order() {
        let text = r#"{"t": {"input": {"z": 1, "a": 2, "m": 3}, "output": {}}}"#;
        let doc = Document::from_json_str(text).unwrap();
        let keys: Vec<_> = doc.get("t").unwrap().input.keys().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }
}
