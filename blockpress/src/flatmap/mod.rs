//! Flat index from compiled node id to node metadata.
//!
//! Filled only by the compiler and published together with the schema it
//! describes. Rehydration relies on it alone, so a stored schema's index can
//! reinterpret stored values without the definitions that produced it.

use crate::compiler::FieldKind;
use crate::error::{BlockPressError, Result};
use crate::registry::{EntityRef, EntityType, FieldGroup};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// What a compiled node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "node", content = "type", rename_all = "snake_case")]
pub enum NodeType {
    /// A layout's top-level block collection
    Layout,
    /// One block variant inside a collection
    Block,
    Field(FieldKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatEntry {
    pub key: String,
    pub name: String,
    /// Entity that declared the node
    pub entity: EntityRef,
    pub field_group: Option<FieldGroup>,
    pub node: NodeType,
    /// Id of the enclosing block, collection or row field
    pub parent: Option<String>,
    /// Layout the node ultimately belongs to
    pub layout: Option<String>,
    pub is_block_boundary: bool,
    pub return_format: Option<String>,
}

impl FlatEntry {
    pub fn field_kind(&self) -> Option<FieldKind> {
        match self.node {
            NodeType::Field(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn is_tab(&self) -> bool {
        self.node == NodeType::Field(FieldKind::Tab)
    }

    /// Holds rows of block variants.
    pub fn is_block_collection(&self) -> bool {
        match self.node {
            NodeType::Layout => true,
            NodeType::Field(kind) => kind.is_block_collection(),
            NodeType::Block => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatIndex {
    entries: HashMap<String, FlatEntry>,
    /// parent id -> child slot -> child id
    children: HashMap<String, HashMap<String, String>>,
    /// layout name -> layout collection id
    layouts: BTreeMap<String, String>,
    /// builder control (`enabled`, `layout`) -> field id
    #[serde(default)]
    controls: BTreeMap<String, String>,
}

fn child_slot(group: Option<FieldGroup>, name: &str) -> String {
    match group {
        Some(group) => format!("{}/{name}", group.as_str()),
        None => name.to_string(),
    }
}

impl FlatIndex {
    pub fn lookup(&self, id: &str) -> Option<&FlatEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &FlatEntry> {
        self.entries.values()
    }

    /// Entries ordered by id, for stable listings.
    pub fn sorted_entries(&self) -> Vec<&FlatEntry> {
        let mut entries: Vec<&FlatEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Id of the child named `name` directly under `parent`.
    pub fn child_key(&self, parent: &str, group: Option<FieldGroup>, name: &str) -> Option<&str> {
        self.children
            .get(parent)
            .and_then(|slots| slots.get(&child_slot(group, name)))
            .map(String::as_str)
    }

    /// Resolve a row's variant tag, given either the block name or the variant id.
    pub fn resolve_variant(&self, collection: &str, tag: &str) -> Option<&FlatEntry> {
        let by_name = self
            .child_key(collection, None, tag)
            .and_then(|key| self.lookup(key));
        by_name
            .or_else(|| self.lookup(tag).filter(|e| e.parent.as_deref() == Some(collection)))
            .filter(|e| e.node == NodeType::Block)
    }

    pub fn layout_key(&self, layout: &str) -> Option<&str> {
        self.layouts.get(layout).map(String::as_str)
    }

    pub fn layout_names(&self) -> impl Iterator<Item = &str> {
        self.layouts.keys().map(String::as_str)
    }

    /// Layout named by a layout select value, either `<builder>_<layout>` or the bare name.
    pub fn layout_by_choice(&self, choice: &str) -> Option<&str> {
        if let Some((name, _)) = self.layouts.get_key_value(choice) {
            return Some(name);
        }
        self.layouts
            .iter()
            .find(|(_, key)| self.lookup(key).is_some_and(|e| e.name == choice))
            .map(|(name, _)| name.as_str())
    }

    /// Id of a builder control field, `enabled` or `layout`.
    pub fn control_key(&self, control: &str) -> Option<&str> {
        self.controls.get(control).map(String::as_str)
    }

    /// Register a node. Ids are unique across one compiled tree.
    pub(crate) fn insert(&mut self, entry: FlatEntry) -> Result<()> {
        if self.entries.contains_key(&entry.key) {
            return Err(BlockPressError::Other(format!(
                "Key collision on {} ({})",
                entry.key, entry.entity
            )));
        }
        if entry.node == NodeType::Layout {
            if let Some(layout) = &entry.layout {
                self.layouts.insert(layout.clone(), entry.key.clone());
            }
        }
        if entry.entity.entity_type == EntityType::Builder && entry.parent.is_none() {
            let prefix = format!("{}_", entry.entity.name);
            if let Some(control) = entry.name.strip_prefix(&prefix) {
                self.controls.insert(control.to_string(), entry.key.clone());
            }
        }
        if let Some(parent) = &entry.parent {
            self.children
                .entry(parent.clone())
                .or_default()
                .insert(child_slot(entry.field_group, &entry.name), entry.key.clone());
        }
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }
}
