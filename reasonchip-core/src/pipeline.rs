//! Pipeline and Task definitions, and the loader that turns a directory of
//! YAML files into a [`PipelineCollection`].
//!
//! A `Task` carries a set of common optional attributes plus exactly one
//! "kind" key (`tasks`, `dispatch`, `branch`, `chip`, `code`, `assert`,
//! `return`, `declare`, `comment`, `terminate`). Serde has no direct
//! "externally-tagged struct with shared fields" mode, so every kind field
//! is modeled as `Option` and [`Task::kind`] validates exactly one is
//! populated after deserialization.

use crate::error::ReasonChipError;
use crate::value::Value;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// `key_result_into: { path, key }` — insert the task's result into the
/// mapping at `path`, under `key` (itself interpolated against the
/// task-local scope, so it can vary per loop iteration).
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct KeyResultInto {
    pub path: String,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Task {
    pub name: Option<String>,
    pub when: Option<String>,
    #[serde(rename = "loop")]
    pub loop_expr: Option<Value>,
    pub log: Option<String>,
    #[serde(default)]
    pub run_async: bool,
    pub store_result_as: Option<String>,
    pub append_result_into: Option<String>,
    pub key_result_into: Option<KeyResultInto>,
    #[serde(default)]
    pub return_result: bool,
    pub variables: Option<BTreeMap<String, Value>>,
    pub params: Option<BTreeMap<String, Value>>,

    // ── exactly one of the below is populated ──
    pub tasks: Option<Vec<Task>>,
    pub dispatch: Option<String>,
    /// Name of a pipeline to splice in. Unlike `dispatch`, which calls into
    /// a fresh nested flow and returns, `branch` clears every task still
    /// queued in the enclosing flow and runs the named pipeline's tasks in
    /// its place — control never comes back to the tasks that followed it.
    pub branch: Option<String>,
    pub chip: Option<String>,
    pub code: Option<String>,
    pub assert: Option<String>,
    #[serde(rename = "return")]
    pub return_: Option<Value>,
    pub declare: Option<BTreeMap<String, Value>>,
    pub comment: Option<String>,
    pub terminate: Option<Value>,
}

/// The resolved kind of a [`Task`], borrowed from it.
pub enum TaskKind<'a> {
    Tasks(&'a [Task]),
    Dispatch(&'a str),
    Branch(&'a str),
    Chip(&'a str),
    Code(&'a str),
    Assert(&'a str),
    Return(&'a Value),
    Declare(&'a BTreeMap<String, Value>),
    Comment(&'a str),
    Terminate(&'a Value),
}

impl Task {
    fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| "<unnamed>".to_string())
    }

    /// Validate that exactly one kind key is present and return it.
    pub fn kind(&self) -> Result<TaskKind<'_>, ReasonChipError> {
        let mut present: Vec<&'static str> = Vec::new();
        if self.tasks.is_some() {
            present.push("tasks");
        }
        if self.dispatch.is_some() {
            present.push("dispatch");
        }
        if self.branch.is_some() {
            present.push("branch");
        }
        if self.chip.is_some() {
            present.push("chip");
        }
        if self.code.is_some() {
            present.push("code");
        }
        if self.assert.is_some() {
            present.push("assert");
        }
        if self.return_.is_some() {
            present.push("return");
        }
        if self.declare.is_some() {
            present.push("declare");
        }
        if self.comment.is_some() {
            present.push("comment");
        }
        if self.terminate.is_some() {
            present.push("terminate");
        }

        match present.len() {
            1 => Ok(match present[0] {
                "tasks" => TaskKind::Tasks(self.tasks.as_deref().unwrap()),
                "dispatch" => TaskKind::Dispatch(self.dispatch.as_deref().unwrap()),
                "branch" => TaskKind::Branch(self.branch.as_deref().unwrap()),
                "chip" => TaskKind::Chip(self.chip.as_deref().unwrap()),
                "code" => TaskKind::Code(self.code.as_deref().unwrap()),
                "assert" => TaskKind::Assert(self.assert.as_deref().unwrap()),
                "return" => TaskKind::Return(self.return_.as_ref().unwrap()),
                "declare" => TaskKind::Declare(self.declare.as_ref().unwrap()),
                "comment" => TaskKind::Comment(self.comment.as_deref().unwrap()),
                "terminate" => TaskKind::Terminate(self.terminate.as_ref().unwrap()),
                _ => unreachable!(),
            }),
            0 => Err(ReasonChipError::MissingField {
                task: self.label(),
                field: "<a task kind>".to_string(),
            }),
            n => Err(ReasonChipError::AmbiguousTaskKind {
                count: n,
                keys: present.into_iter().map(str::to_string).collect(),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pipeline {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineCollection {
    pipelines: BTreeMap<String, Pipeline>,
}

impl PipelineCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dotted_name: String, mut pipeline: Pipeline) {
        pipeline.name = dotted_name.clone();
        self.pipelines.insert(dotted_name, pipeline);
    }

    pub fn get(&self, name: &str) -> Option<&Pipeline> {
        self.pipelines.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn extend(&mut self, other: PipelineCollection) {
        self.pipelines.extend(other.pipelines);
    }
}

/// Something that can produce a [`PipelineCollection`]. Implemented by
/// [`FileSystemLoader`]; tests substitute an in-memory loader built from
/// string literals.
pub trait PipelineLoader {
    fn load(&self) -> Result<PipelineCollection, ReasonChipError>;
}

/// Derive a dotted pipeline name from a path relative to a loader root:
/// `billing/invoice.yml` under root `pipelines/` becomes `billing.invoice`.
pub fn dotted_name_from_path(relative: &Path) -> String {
    let mut stem = relative.to_path_buf();
    stem.set_extension("");
    stem.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(".")
}

/// Walks a directory recursively, loading every `.yml`/`.yaml` file as one
/// pipeline. Each file must contain a single pipeline document with a
/// `tasks` list and, optionally, a `params` mapping; the file's path
/// (relative to `root`) becomes the pipeline's dotted name, overriding any
/// in-document `name`.
pub struct FileSystemLoader {
    root: PathBuf,
}

impl FileSystemLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn walk(dir: &Path, root: &Path, out: &mut PipelineCollection) -> Result<(), ReasonChipError> {
        let entries = std::fs::read_dir(dir).map_err(|e| ReasonChipError::MalformedYaml {
            path: dir.display().to_string(),
            cause: e.to_string(),
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| ReasonChipError::MalformedYaml {
                path: dir.display().to_string(),
                cause: e.to_string(),
            })?;
            let path = entry.path();
            if path.is_dir() {
                Self::walk(&path, root, out)?;
                continue;
            }
            let is_yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yml" | "yaml"));
            if !is_yaml {
                continue;
            }
            let text = std::fs::read_to_string(&path).map_err(|e| ReasonChipError::MalformedYaml {
                path: path.display().to_string(),
                cause: e.to_string(),
            })?;
            let pipeline: Pipeline = serde_yaml::from_str(&text).map_err(|e| ReasonChipError::MalformedYaml {
                path: path.display().to_string(),
                cause: e.to_string(),
            })?;
            let relative = path.strip_prefix(root).unwrap_or(&path);
            let dotted = dotted_name_from_path(relative);
            out.insert(dotted, pipeline);
        }
        Ok(())
    }
}

impl PipelineLoader for FileSystemLoader {
    fn load(&self) -> Result<PipelineCollection, ReasonChipError> {
        let mut out = PipelineCollection::new();
        Self::walk(&self.root, &self.root, &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_with_no_kind_errors() {
        let t = Task::default();
        assert!(matches!(t.kind(), Err(ReasonChipError::MissingField { .. })));
    }

    #[test]
    fn task_with_two_kinds_errors() {
        let t = Task {
            comment: Some("hi".to_string()),
            assert: Some("1 == 1".to_string()),
            ..Default::default()
        };
        assert!(matches!(t.kind(), Err(ReasonChipError::AmbiguousTaskKind { count: 2, .. })));
    }

    #[test]
    fn task_with_one_kind_resolves() {
        let t = Task {
            comment: Some("hi".to_string()),
            ..Default::default()
        };
        assert!(matches!(t.kind(), Ok(TaskKind::Comment("hi"))));
    }

    #[test]
    fn dotted_name_derivation() {
        let p = PathBuf::from("billing/invoice.yml");
        assert_eq!(dotted_name_from_path(&p), "billing.invoice");
    }

    #[test]
    fn parses_minimal_pipeline_yaml() {
        let yaml = r#"
params:
  who:
    default: "world"
tasks:
  - comment: "hello"
  - assert: "1 == 1"
"#;
        let p: Pipeline = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(p.tasks.len(), 2);
        assert!(p.params.contains_key("who"));
    }
}
