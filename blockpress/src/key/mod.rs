//! Identity & key scheme.
//!
//! Every compiled node id is derived from the ordered path of names leading
//! to it. Ids are persisted next to stored content, so this scheme is part of
//! the storage format: changing [`KEY_SCHEME_VERSION`] orphans every value
//! saved under the previous version.
//!
//! Scheme v1: `prefix + hex(sha256("blockpress:key:v1" + "\0" + segments.join(":")))[..32]`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Version of the key derivation function.
pub const KEY_SCHEME_VERSION: u32 = 1;

/// Separator between path segments. Never valid inside a sanitised name.
pub const PATH_DELIMITER: char = ':';

const DOMAIN_TAG: &[u8] = b"blockpress:key:v1";

/// Number of hex characters kept from the digest (128 bits).
const DIGEST_HEX_LEN: usize = 32;

/// The id prefix, fixed by the custom-fields storage format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    Group,
    Field,
    Block,
}

impl KeyKind {
    pub fn prefix(self) -> &'static str {
        match self {
            KeyKind::Group => "group_",
            KeyKind::Field => "field_",
            KeyKind::Block => "block_",
        }
    }
}

/// An ordered list of path segments, e.g. `builder:page:columns:content:columns`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KeyPath {
    segments: Vec<String>,
}

impl KeyPath {
    pub fn root(segment: &str) -> Self {
        KeyPath::default().child(segment)
    }

    /// Extend the path with one more segment.
    pub fn child(&self, segment: &str) -> Self {
        debug_assert!(
            !segment.contains(PATH_DELIMITER),
            "path segment '{segment}' contains the delimiter"
        );
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        KeyPath { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn joined(&self) -> String {
        self.segments.join(&PATH_DELIMITER.to_string())
    }

    /// Derive the id of the node addressed by this path.
    pub fn encode(&self, kind: KeyKind) -> String {
        encode_key(kind, self)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined())
    }
}

/// Derive the id for `local_name` under `parent`.
pub fn derive_key(kind: KeyKind, parent: &KeyPath, local_name: &str) -> String {
    encode_key(kind, &parent.child(local_name))
}

/// Hash a full path into a storage-safe id.
pub fn encode_key(kind: KeyKind, path: &KeyPath) -> String {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_TAG);
    hasher.update([0u8]);
    hasher.update(path.joined().as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(kind.prefix().len() + DIGEST_HEX_LEN);
    out.push_str(kind.prefix());
    for byte in digest.iter().take(DIGEST_HEX_LEN / 2) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Lower-case a name and strip everything outside `[a-z0-9_]`.
pub fn sanitise_key(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// A name is usable in a key path when it is non-empty and already sanitised.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && sanitise_key(name) == name
}

/// Derive a field name from its human label ("Background Color" -> "background_color").
pub fn name_from_label(label: &str) -> String {
    sanitise_key(&slug::slugify(label).replace('-', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_derive_is_deterministic() {
        let parent = KeyPath::root("builder").child("page");
        let a = derive_key(KeyKind::Field, &parent, "title");
        let b = derive_key(KeyKind::Field, &parent, "title");
        assert_eq!(a, b);
        assert!(a.starts_with("field_"));
        assert_eq!(a.len(), "field_".len() + DIGEST_HEX_LEN);
    }

    #[test]
    fn test_kind_changes_prefix_only() {
        let path = KeyPath::root("builder").child("page");
        let field = path.encode(KeyKind::Field);
        let block = path.encode(KeyKind::Block);
        assert_eq!(field["field_".len()..], block["block_".len()..]);
    }

    #[test]
    fn test_different_paths_differ() {
        let a = KeyPath::root("builder").child("page").child("text");
        let b = KeyPath::root("builder").child("pagetext");
        assert_ne!(a.encode(KeyKind::Block), b.encode(KeyKind::Block));
    }

    #[test]
    fn test_joined_path() {
        let path = KeyPath::root("builder").child("page").child("columns");
        assert_eq!(path.joined(), "builder:page:columns");
        assert_eq!(path.to_string(), "builder:page:columns");
        assert_eq!(path.segments().len(), 3);
    }

    #[test]
    fn test_sanitise_key() {
        assert_eq!(sanitise_key("Element-ID!"), "elementid");
        assert_eq!(sanitise_key("bg_color"), "bg_color");
        assert_eq!(sanitise_key("a:b"), "ab");
    }

    #[test]
    fn test_name_validity() {
        assert!(is_valid_name("bg_color"));
        assert!(!is_valid_name("Bg Color"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("a:b"));
    }

    #[test]
    fn test_name_from_label() {
        assert_eq!(name_from_label("Background Color"), "background_color");
        assert_eq!(name_from_label("Show  nav -- arrows"), "show_nav_arrows");
    }

    proptest! {
        #[test]
        fn prop_distinct_paths_give_distinct_keys(
            a in prop::collection::vec("[a-z0-9_]{1,6}", 1..5),
            b in prop::collection::vec("[a-z0-9_]{1,6}", 1..5),
        ) {
            let path_a = a.iter().fold(KeyPath::default(), |p, s| p.child(s));
            let path_b = b.iter().fold(KeyPath::default(), |p, s| p.child(s));
            if a == b {
                prop_assert_eq!(path_a.encode(KeyKind::Field), path_b.encode(KeyKind::Field));
            } else {
                prop_assert_ne!(path_a.encode(KeyKind::Field), path_b.encode(KeyKind::Field));
            }
        }
    }
}
