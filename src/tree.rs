//! Pure operations on the hierarchical configuration tree.
//!
//! The tree is a plain [`serde_yaml::Value`]: scalars, sequences and
//! insertion-ordered mappings. Nothing here locks or publishes; concurrency
//! and change fanout are the owner's concern.

use crate::error::{Error, Result};
use crate::keychain;
use serde_yaml::{Mapping, Value};

fn key_value(segment: &str) -> Value {
    Value::String(segment.to_string())
}

/// Returns a copy of the node at `keychain`. The empty keychain returns the
/// whole tree. Numeric segments index into sequences.
pub fn get_node(root: &Value, keychain: &str) -> Result<Value> {
    let mut node = root;
    for seg in keychain::segments(keychain) {
        node = descend(node, seg, keychain)?;
    }
    Ok(node.clone())
}

fn descend<'a>(node: &'a Value, seg: &str, keychain: &str) -> Result<&'a Value> {
    match node {
        Value::Mapping(map) => map
            .get(&key_value(seg))
            .ok_or_else(|| Error::Lookup(format!("no node at '{keychain}' (missing '{seg}')"))),
        Value::Sequence(seq) => {
            let idx: usize = seg
                .parse()
                .map_err(|_| Error::Lookup(format!("'{seg}' does not index a sequence in '{keychain}'")))?;
            seq.get(idx)
                .ok_or_else(|| Error::Lookup(format!("index {idx} out of range in '{keychain}'")))
        }
        _ => Err(Error::Lookup(format!(
            "'{seg}' in '{keychain}' descends through a scalar"
        ))),
    }
}

/// Places `node` at `keychain`, replacing whatever subtree was there.
///
/// Without `create` the whole path, terminal key included, must already
/// exist. With `create`, missing ancestors are materialised as mappings. A
/// path blocked by an existing scalar fails either way, and failure never
/// mutates the tree.
pub fn put_node(root: &mut Value, keychain: &str, node: Value, create: bool) -> Result<()> {
    let keychain = keychain::normalize(keychain);
    if keychain.is_empty() {
        *root = node;
        return Ok(());
    }

    let parts: Vec<&str> = keychain::segments(keychain).collect();
    let (last, ancestors) = parts.split_last().unwrap();

    let mut cursor = root;
    for seg in ancestors {
        cursor = match cursor {
            Value::Mapping(map) => {
                let key = key_value(seg);
                if !map.contains_key(&key) {
                    if !create {
                        return Err(Error::Lookup(format!(
                            "no node at '{keychain}' (missing '{seg}')"
                        )));
                    }
                    map.insert(key.clone(), Value::Mapping(Mapping::new()));
                }
                map.get_mut(&key).expect("present or just inserted")
            }
            Value::Sequence(seq) => {
                let idx: usize = seg.parse().map_err(|_| {
                    Error::Lookup(format!("'{seg}' does not index a sequence in '{keychain}'"))
                })?;
                seq.get_mut(idx)
                    .ok_or_else(|| Error::Lookup(format!("index {idx} out of range in '{keychain}'")))?
            }
            _ => {
                return Err(Error::Lookup(format!(
                    "'{seg}' in '{keychain}' descends through a scalar"
                )))
            }
        };
    }

    match cursor {
        Value::Mapping(map) => {
            let key = key_value(last);
            if !create && !map.contains_key(&key) {
                return Err(Error::Lookup(format!("no node at '{keychain}'")));
            }
            map.insert(key, node);
            Ok(())
        }
        Value::Sequence(seq) => {
            let idx: usize = last.parse().map_err(|_| {
                Error::Lookup(format!("'{last}' does not index a sequence in '{keychain}'"))
            })?;
            let slot = seq
                .get_mut(idx)
                .ok_or_else(|| Error::Lookup(format!("index {idx} out of range in '{keychain}'")))?;
            *slot = node;
            Ok(())
        }
        _ => Err(Error::Lookup(format!(
            "parent of '{keychain}' is a scalar"
        ))),
    }
}

/// Removes the node at `keychain`. Deleting a path that does not exist is an
/// error; deleting the root is not supported.
pub fn delete_node(root: &mut Value, keychain: &str) -> Result<()> {
    let keychain = keychain::normalize(keychain);
    let parts: Vec<&str> = keychain::segments(keychain).collect();
    let Some((last, ancestors)) = parts.split_last() else {
        return Err(Error::Protocol("cannot delete the root".into()));
    };

    let mut cursor = &mut *root;
    for seg in ancestors {
        cursor = match cursor {
            Value::Mapping(map) => map
                .get_mut(&key_value(seg))
                .ok_or_else(|| Error::Lookup(format!("no node at '{keychain}' (missing '{seg}')")))?,
            Value::Sequence(seq) => {
                let idx: usize = seg.parse().map_err(|_| {
                    Error::Lookup(format!("'{seg}' does not index a sequence in '{keychain}'"))
                })?;
                seq.get_mut(idx)
                    .ok_or_else(|| Error::Lookup(format!("index {idx} out of range in '{keychain}'")))?
            }
            _ => {
                return Err(Error::Lookup(format!(
                    "'{seg}' in '{keychain}' descends through a scalar"
                )))
            }
        };
    }

    match cursor {
        Value::Mapping(map) => map
            .remove(&key_value(last))
            .map(|_| ())
            .ok_or_else(|| Error::Lookup(format!("no node at '{keychain}'"))),
        Value::Sequence(seq) => {
            let idx: usize = last.parse().map_err(|_| {
                Error::Lookup(format!("'{last}' does not index a sequence in '{keychain}'"))
            })?;
            if idx < seq.len() {
                seq.remove(idx);
                Ok(())
            } else {
                Err(Error::Lookup(format!("index {idx} out of range in '{keychain}'")))
            }
        }
        _ => Err(Error::Lookup(format!("parent of '{keychain}' is a scalar"))),
    }
}

/// Serializes a node to its wire text form.
pub fn to_yaml(node: &Value) -> Result<String> {
    Ok(serde_yaml::to_string(node)?)
}

/// Parses a node from its wire text form.
pub fn from_yaml(text: &str) -> Result<Value> {
    Ok(serde_yaml::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::{delete_node, get_node, put_node};
    use serde_yaml::Value;

    fn seed() -> Value {
        serde_yaml::from_str(
            r#"
components:
  nettask:
    Transports:
      A:
        Specified: [inproc, tcp]
count: 3
"#,
        )
        .unwrap()
    }

    #[test]
    fn get_walks_mappings_and_sequences() {
        let tree = seed();
        let node = get_node(&tree, "components.nettask.Transports.A.Specified.1").unwrap();
        assert_eq!(node, Value::String("tcp".into()));
    }

    #[test]
    fn get_of_empty_keychain_returns_whole_tree() {
        let tree = seed();
        assert_eq!(get_node(&tree, "").unwrap(), tree);
    }

    #[test]
    fn get_of_missing_key_fails() {
        let tree = seed();
        assert!(get_node(&tree, "components.nosuch").is_err());
        assert!(get_node(&tree, "count.too.deep").is_err());
    }

    #[test]
    fn put_then_get_round_trips() {
        let mut tree = seed();
        put_node(&mut tree, "a.b.c", Value::String("hello".into()), true).unwrap();
        assert_eq!(get_node(&tree, "a.b.c").unwrap(), Value::String("hello".into()));
        assert!(get_node(&tree, "a.b").unwrap().is_mapping());
    }

    #[test]
    fn put_without_create_needs_existing_path() {
        let mut tree = seed();
        let before = tree.clone();
        assert!(put_node(&mut tree, "x.y", Value::Null, false).is_err());
        assert_eq!(tree, before, "failed put must not mutate the tree");

        put_node(&mut tree, "count", Value::from(4), false).unwrap();
        assert_eq!(get_node(&tree, "count").unwrap(), Value::from(4));
    }

    #[test]
    fn put_replaces_whole_subtree() {
        let mut tree = seed();
        put_node(&mut tree, "components.nettask", Value::from("gone"), false).unwrap();
        assert!(get_node(&tree, "components.nettask.Transports").is_err());
    }

    #[test]
    fn put_blocked_by_scalar_fails_even_with_create() {
        let mut tree = seed();
        assert!(put_node(&mut tree, "count.deeper", Value::Null, true).is_err());
    }

    #[test]
    fn put_of_root_replaces_document() {
        let mut tree = seed();
        put_node(&mut tree, "Root", Value::from(1), false).unwrap();
        assert_eq!(tree, Value::from(1));
    }

    #[test]
    fn put_is_idempotent() {
        let mut tree = seed();
        put_node(&mut tree, "k", Value::from("v"), true).unwrap();
        let after_first = tree.clone();
        put_node(&mut tree, "k", Value::from("v"), true).unwrap();
        assert_eq!(tree, after_first);
    }

    #[test]
    fn delete_then_get_fails() {
        let mut tree = seed();
        delete_node(&mut tree, "count").unwrap();
        assert!(get_node(&tree, "count").is_err());
        assert!(delete_node(&mut tree, "count").is_err());
    }

    #[test]
    fn delete_of_missing_path_fails() {
        let mut tree = seed();
        assert!(delete_node(&mut tree, "no.such.path").is_err());
    }
}
