//! Variable Context: the scoped, nested value tree pipelines read and write.
//!
//! A tree of named values: leaves are scalars, interior nodes are mappings
//! or ordered sequences. Paths use dotted notation; keys never contain `.`.
//! Generalizes a flat flag map into a nested, path-addressable tree since
//! pipelines need arbitrary structure, not just scalar flags.

use crate::error::{ReasonChipError, Site};
use crate::value::Value;
use std::collections::BTreeMap;

/// Nested, path-addressable mapping with scoped override/merge and
/// copy-on-scope semantics. The context for a specific task evaluation is
/// never mutated during that evaluation — callers that want to materialize
/// a new scope use [`VariableContext::child`] and [`VariableContext::merge`]
/// to build an independent tree, never in-place mutation of a parent
/// visible to sibling tasks.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VariableContext {
    root: Value,
}

fn split_path(path: &str) -> Vec<&str> {
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('.').collect()
    }
}

impl VariableContext {
    pub fn new() -> Self {
        Self {
            root: Value::mapping(),
        }
    }

    pub fn from_mapping(map: BTreeMap<String, Value>) -> Self {
        Self {
            root: Value::Mapping(map),
        }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn into_mapping(self) -> BTreeMap<String, Value> {
        match self.root {
            Value::Mapping(m) => m,
            other => {
                let mut m = BTreeMap::new();
                m.insert("_".to_string(), other);
                m
            }
        }
    }

    /// `get(path) -> value | NotFound`. Dotted path; falls through mappings
    /// and sequences (integer segments index sequences).
    pub fn get(&self, path: &str) -> Option<&Value> {
        let segments = split_path(path);
        let mut cur = &self.root;
        for seg in segments {
            cur = match cur {
                Value::Mapping(m) => m.get(seg)?,
                Value::Sequence(s) => {
                    let idx: usize = seg.parse().ok()?;
                    s.get(idx)?
                }
                _ => return None,
            };
        }
        Some(cur)
    }

    /// `set(path, value)`. Creates intermediate mappings as needed;
    /// sequence indexing by integer path segment is allowed on existing
    /// sequences only.
    pub fn set(&mut self, path: &str, value: Value) -> Result<(), ReasonChipError> {
        let segments = split_path(path);
        if segments.is_empty() {
            self.root = value;
            return Ok(());
        }
        Self::set_rec(&mut self.root, &segments, value)
    }

    fn set_rec(node: &mut Value, segments: &[&str], value: Value) -> Result<(), ReasonChipError> {
        let (head, rest) = (segments[0], &segments[1..]);

        if !matches!(node, Value::Mapping(_) | Value::Sequence(_)) {
            *node = Value::mapping();
        }

        match node {
            Value::Mapping(m) => {
                if rest.is_empty() {
                    m.insert(head.to_string(), value);
                    Ok(())
                } else {
                    let child = m.entry(head.to_string()).or_insert_with(Value::mapping);
                    Self::set_rec(child, rest, value)
                }
            }
            Value::Sequence(s) => {
                let idx: usize = head.parse().map_err(|_| ReasonChipError::TypeMismatch {
                    site: Site::default(),
                    detail: format!("`{head}` is not a valid sequence index"),
                })?;
                let slot = s.get_mut(idx).ok_or_else(|| ReasonChipError::TypeMismatch {
                    site: Site::default(),
                    detail: format!("sequence index {idx} out of bounds"),
                })?;
                if rest.is_empty() {
                    *slot = value;
                    Ok(())
                } else {
                    Self::set_rec(slot, rest, value)
                }
            }
            _ => unreachable!(),
        }
    }

    /// `merge(other_tree)`. Deep overlay; scalars replace; sequences
    /// replace wholesale (no element merge).
    pub fn merge(&mut self, other: &VariableContext) {
        Self::merge_value(&mut self.root, &other.root);
    }

    pub fn merge_value(base: &mut Value, overlay: &Value) {
        match (base, overlay) {
            (Value::Mapping(b), Value::Mapping(o)) => {
                for (k, v) in o {
                    match b.get_mut(k) {
                        Some(existing) => Self::merge_value(existing, v),
                        None => {
                            b.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
            (b, o) => {
                *b = o.clone();
            }
        }
    }

    /// Returns a new context that is the deep-merge overlay of `self` with
    /// `other`, without mutating either. Used throughout the Processor to
    /// build scopes without ever mutating a parent's context.
    pub fn merged(&self, other: &VariableContext) -> VariableContext {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// `child()`. Independent copy; mutations to the returned context never
    /// leak back to `self`.
    pub fn child(&self) -> VariableContext {
        self.clone()
    }

    /// `append(path, value)`. Path must resolve to a sequence; otherwise
    /// fails with `TypeMismatch`.
    pub fn append(&mut self, path: &str, value: Value) -> Result<(), ReasonChipError> {
        let segments = split_path(path);
        if segments.is_empty() {
            return Err(ReasonChipError::TypeMismatch {
                site: Site::default(),
                detail: "cannot append at the root path".to_string(),
            });
        }
        Self::append_rec(&mut self.root, &segments, value)
    }

    fn append_rec(node: &mut Value, segments: &[&str], value: Value) -> Result<(), ReasonChipError> {
        let (head, rest) = (segments[0], &segments[1..]);

        if !matches!(node, Value::Mapping(_)) {
            *node = Value::mapping();
        }
        let Value::Mapping(m) = node else {
            unreachable!()
        };

        if rest.is_empty() {
            match m.get_mut(head) {
                Some(Value::Sequence(s)) => {
                    s.push(value);
                    Ok(())
                }
                Some(_) => Err(ReasonChipError::TypeMismatch {
                    site: Site::default(),
                    detail: format!("`{head}` exists and is not a sequence"),
                }),
                None => {
                    m.insert(head.to_string(), Value::Sequence(vec![value]));
                    Ok(())
                }
            }
        } else {
            let child = m.entry(head.to_string()).or_insert_with(Value::mapping);
            Self::append_rec(child, rest, value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_from(pairs: &[(&str, Value)]) -> VariableContext {
        let mut c = VariableContext::new();
        for (k, v) in pairs {
            c.set(k, v.clone()).unwrap();
        }
        c
    }

    #[test]
    fn get_set_roundtrip_dotted() {
        let mut c = VariableContext::new();
        c.set("a.b.c", Value::Int(7)).unwrap();
        assert_eq!(c.get("a.b.c"), Some(&Value::Int(7)));
        assert_eq!(c.get("a.b"), Some(&Value::Mapping(BTreeMap::from([(
            "c".to_string(),
            Value::Int(7),
        )]))));
    }

    #[test]
    fn merge_identity() {
        let a = ctx_from(&[("x", Value::Int(1)), ("y", Value::Str("hi".into()))]);
        let empty = VariableContext::new();
        assert_eq!(a.merged(&empty), a);
    }

    #[test]
    fn merge_associativity() {
        let a = ctx_from(&[("x", Value::Int(1))]);
        let b = ctx_from(&[("y", Value::Int(2))]);
        let c = ctx_from(&[("x", Value::Int(99)), ("z", Value::Int(3))]);

        let left = a.merged(&b).merged(&c);
        let right = a.merged(&b.merged(&c));
        assert_eq!(left, right);
    }

    #[test]
    fn merge_scalar_conflict_replaces() {
        let a = ctx_from(&[("x", Value::Int(1))]);
        let b = ctx_from(&[("x", Value::Int(2))]);
        assert_eq!(a.merged(&b).get("x"), Some(&Value::Int(2)));
    }

    #[test]
    fn merge_sequence_replaces_wholesale() {
        let a = ctx_from(&[("xs", Value::Sequence(vec![Value::Int(1), Value::Int(2)]))]);
        let b = ctx_from(&[("xs", Value::Sequence(vec![Value::Int(9)]))]);
        assert_eq!(
            a.merged(&b).get("xs"),
            Some(&Value::Sequence(vec![Value::Int(9)]))
        );
    }

    #[test]
    fn child_is_independent() {
        let a = ctx_from(&[("x", Value::Int(1))]);
        let mut b = a.child();
        b.set("x", Value::Int(2)).unwrap();
        assert_eq!(a.get("x"), Some(&Value::Int(1)));
        assert_eq!(b.get("x"), Some(&Value::Int(2)));
    }

    #[test]
    fn append_creates_then_appends() {
        let mut c = VariableContext::new();
        c.append("out", Value::Str("a".into())).unwrap();
        c.append("out", Value::Str("b".into())).unwrap();
        assert_eq!(
            c.get("out"),
            Some(&Value::Sequence(vec![
                Value::Str("a".into()),
                Value::Str("b".into())
            ]))
        );
    }

    #[test]
    fn append_on_non_sequence_fails() {
        let mut c = VariableContext::new();
        c.set("out", Value::Int(1)).unwrap();
        assert!(c.append("out", Value::Int(2)).is_err());
    }
}
