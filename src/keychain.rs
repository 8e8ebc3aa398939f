//! Dotted-keychain utilities shared by the tree, the server fanout and the
//! subscriber dispatch tables.

/// The topic under which the whole tree is published. A `GET` for this key,
/// or for the empty keychain, returns the root.
pub const ROOT_TOPIC: &str = "Root";

/// Splits a keychain into its segments. The empty keychain has no segments.
pub fn segments(keychain: &str) -> impl Iterator<Item = &str> {
    keychain.split('.').filter(|s| !s.is_empty())
}

/// Enumerates every prefix of a keychain, shortest to longest, including the
/// keychain itself. `prefixes("a.b.c")` yields `["a", "a.b", "a.b.c"]`.
pub fn prefixes(keychain: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut acc = String::new();
    for seg in segments(keychain) {
        if !acc.is_empty() {
            acc.push('.');
        }
        acc.push_str(seg);
        out.push(acc.clone());
    }
    out
}

/// True when `key` names `topic` itself or a dotted ancestor of it. Keys
/// containing literal dots inside a segment are not representable, so a plain
/// byte-prefix check is not enough: a subscriber to `a` must not match a
/// publication under `alpha`.
pub fn covers(key: &str, topic: &str) -> bool {
    key == topic || (topic.len() > key.len() && topic.as_bytes()[key.len()] == b'.' && topic.starts_with(key))
}

/// Maps the aliases for the root (the empty keychain and [`ROOT_TOPIC`]) to
/// the internal empty form.
pub fn normalize(keychain: &str) -> &str {
    if keychain == ROOT_TOPIC {
        ""
    } else {
        keychain
    }
}
