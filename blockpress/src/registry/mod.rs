//! Closed set of blocks and layouts, built once per compilation pass.
//!
//! Building the registry resolves every generator reference, derives missing
//! field names from labels and rejects explicit nesting that the child's own
//! compatibility rules forbid. The result is immutable.

use crate::error::{BlockPressError, Result};
use crate::key::{is_valid_name, name_from_label};
use crate::schema::{
    hash_definitions, BlockDefinition, BlockKind, CompatibilityRules, DefinitionFile,
    FieldDeclaration, FieldSlot, GeneratorRegistry, LayoutDefinition, NameFilter, Settings,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// What kind of entity owns a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Builder,
    Layout,
    Block,
}

/// Reference to an entity by type and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub name: String,
}

impl EntityRef {
    pub fn builder(name: &str) -> Self {
        EntityRef {
            entity_type: EntityType::Builder,
            name: name.to_string(),
        }
    }

    pub fn layout(name: &str) -> Self {
        EntityRef {
            entity_type: EntityType::Layout,
            name: name.to_string(),
        }
    }

    pub fn block(name: &str) -> Self {
        EntityRef {
            entity_type: EntityType::Block,
            name: name.to_string(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.entity_type {
            EntityType::Builder => "builder",
            EntityType::Layout => "layout",
            EntityType::Block => "block",
        };
        write!(f, "{kind} '{}'", self.name)
    }
}

/// The three editor groups of a block's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldGroup {
    Content,
    Customise,
    Configure,
}

impl FieldGroup {
    pub const ALL: [FieldGroup; 3] = [
        FieldGroup::Content,
        FieldGroup::Customise,
        FieldGroup::Configure,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldGroup::Content => "content",
            FieldGroup::Customise => "customise",
            FieldGroup::Configure => "configure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|g| g.as_str() == s)
    }
}

impl fmt::Display for FieldGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved field declarations, per group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldGroups {
    pub content: Vec<FieldDeclaration>,
    pub customise: Vec<FieldDeclaration>,
    pub configure: Vec<FieldDeclaration>,
}

impl FieldGroups {
    pub fn get(&self, group: FieldGroup) -> &[FieldDeclaration] {
        match group {
            FieldGroup::Content => &self.content,
            FieldGroup::Customise => &self.customise,
            FieldGroup::Configure => &self.configure,
        }
    }

    pub fn is_empty(&self) -> bool {
        FieldGroup::ALL.iter().all(|g| self.get(*g).is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Block(BlockKind),
    Layout,
}

/// A registered block or layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub name: String,
    pub label: String,
    pub description: String,
    pub instructions: String,
    pub kind: EntityKind,
    pub display: String,
    pub button_label: String,
    pub fields: FieldGroups,
    /// Which blocks may be nested directly inside this entity
    pub children: NameFilter,
    /// Which parents may contain this entity
    pub rules: CompatibilityRules,
}

impl Entity {
    pub fn is_layout(&self) -> bool {
        self.kind == EntityKind::Layout
    }

    pub fn is_block(&self) -> bool {
        matches!(self.kind, EntityKind::Block(_))
    }

    /// Blocks that own a nested-block collection.
    pub fn is_container(&self) -> bool {
        matches!(
            self.kind,
            EntityKind::Block(BlockKind::Container) | EntityKind::Block(BlockKind::Repeating)
        )
    }

    pub fn has_repeating_content(&self) -> bool {
        self.kind == EntityKind::Block(BlockKind::Repeating)
    }

    pub fn entity_ref(&self) -> EntityRef {
        match self.kind {
            EntityKind::Layout => EntityRef::layout(&self.name),
            EntityKind::Block(_) => EntityRef::block(&self.name),
        }
    }

    /// Whether this entity may be nested directly inside `parent`.
    pub fn is_compatible_with(&self, parent: &Entity) -> bool {
        if !self.is_block() {
            return false;
        }
        match parent.kind {
            EntityKind::Layout => self.rules.layout.matches(&parent.name),
            EntityKind::Block(_) => self.rules.block.matches(&parent.name),
        }
    }
}

/// The closed entity registry.
#[derive(Debug, Clone)]
pub struct Registry {
    settings: Settings,
    blocks: BTreeMap<String, Entity>,
    layouts: BTreeMap<String, Entity>,
    source_hash: String,
}

impl Registry {
    /// Build the registry from parsed definitions.
    pub fn build(definitions: DefinitionFile, generators: &GeneratorRegistry) -> Result<Self> {
        let source_hash = hash_definitions(&definitions)?;
        let DefinitionFile {
            settings,
            blocks,
            layouts,
            ..
        } = definitions;

        if !is_valid_name(&settings.name) {
            return Err(BlockPressError::InvalidName(settings.name));
        }

        let mut block_entities = BTreeMap::new();
        for (name, def) in blocks {
            let entity = resolve_block(&name, def, generators)?;
            block_entities.insert(name, entity);
        }

        let mut layout_entities = BTreeMap::new();
        for (name, def) in layouts {
            let entity = resolve_layout(&name, def)?;
            layout_entities.insert(name, entity);
        }

        let registry = Registry {
            settings,
            blocks: block_entities,
            layouts: layout_entities,
            source_hash,
        };
        registry.check_explicit_nesting()?;
        Ok(registry)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Hash of the definitions this registry was built from.
    pub fn source_hash(&self) -> &str {
        &self.source_hash
    }

    pub fn block(&self, name: &str) -> Option<&Entity> {
        self.blocks.get(name)
    }

    pub fn layout(&self, name: &str) -> Option<&Entity> {
        self.layouts.get(name)
    }

    pub fn require_block(&self, name: &str) -> Result<&Entity> {
        self.block(name).ok_or_else(|| BlockPressError::UnknownEntity {
            name: name.to_string(),
        })
    }

    /// Blocks in registry (name) order.
    pub fn blocks(&self) -> impl Iterator<Item = &Entity> {
        self.blocks.values()
    }

    /// Layouts in registry (name) order.
    pub fn layouts(&self) -> impl Iterator<Item = &Entity> {
        self.layouts.values()
    }

    /// Blocks selected by a child filter.
    ///
    /// An explicit list keeps its own order; unknown names are skipped with a
    /// warning. Any other filter walks the registry in name order.
    pub fn candidates(&self, filter: &NameFilter) -> Vec<&Entity> {
        match filter {
            NameFilter::Only(names) => names
                .iter()
                .filter_map(|name| match self.require_block(name) {
                    Ok(entity) => Some(entity),
                    Err(e) => {
                        log::warn!("Skipping nested block: {e}");
                        None
                    }
                })
                .collect(),
            NameFilter::Any | NameFilter::Except(_) => {
                self.blocks.values().filter(|b| filter.matches(&b.name)).collect()
            }
        }
    }

    fn check_explicit_nesting(&self) -> Result<()> {
        for parent in self.layouts.values().chain(self.blocks.values()) {
            let NameFilter::Only(names) = &parent.children else {
                continue;
            };
            for name in names {
                if let Some(child) = self.blocks.get(name) {
                    if !child.is_compatible_with(parent) {
                        return Err(BlockPressError::IncompatibleNesting {
                            child: child.name.clone(),
                            parent: parent.name.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn label_or_title(label: Option<String>, name: &str) -> String {
    label.unwrap_or_else(|| {
        let mut chars = name.replace('_', " ").chars().collect::<Vec<_>>();
        if let Some(first) = chars.first_mut() {
            *first = first.to_ascii_uppercase();
        }
        chars.into_iter().collect()
    })
}

fn resolve_block(name: &str, def: BlockDefinition, generators: &GeneratorRegistry) -> Result<Entity> {
    if !is_valid_name(name) {
        return Err(BlockPressError::InvalidName(name.to_string()));
    }
    let fields = FieldGroups {
        content: resolve_slots(name, def.content, generators)?,
        customise: resolve_slots(name, def.customise, generators)?,
        configure: resolve_slots(name, def.configure, generators)?,
    };
    Ok(Entity {
        name: name.to_string(),
        label: label_or_title(def.label, name),
        description: def.description,
        instructions: String::new(),
        kind: EntityKind::Block(def.kind),
        display: def.display,
        button_label: String::new(),
        fields,
        children: def.blocks,
        rules: def.rules,
    })
}

fn resolve_layout(name: &str, def: LayoutDefinition) -> Result<Entity> {
    if !is_valid_name(name) {
        return Err(BlockPressError::InvalidName(name.to_string()));
    }
    Ok(Entity {
        name: name.to_string(),
        label: label_or_title(def.label, name),
        description: def.description,
        instructions: def.instructions,
        kind: EntityKind::Layout,
        display: "block".into(),
        button_label: def.button_label,
        fields: FieldGroups::default(),
        children: def.blocks,
        rules: CompatibilityRules::default(),
    })
}

/// Expand generator references and fill in names, recursively.
fn resolve_slots(
    entity: &str,
    slots: Vec<FieldSlot>,
    generators: &GeneratorRegistry,
) -> Result<Vec<FieldDeclaration>> {
    let mut resolved = Vec::new();
    for slot in slots {
        let declarations = match slot {
            FieldSlot::Literal(decl) => vec![decl],
            FieldSlot::Generated(reference) => match generators.resolve(&reference) {
                Some(decls) => decls,
                None => {
                    log::warn!(
                        "Unknown field generator '{}' in block '{entity}', slot omitted",
                        reference.generate
                    );
                    continue;
                }
            },
        };
        for decl in declarations {
            resolved.push(resolve_declaration(entity, decl, generators)?);
        }
    }
    Ok(resolved)
}

fn resolve_declaration(
    entity: &str,
    mut decl: FieldDeclaration,
    generators: &GeneratorRegistry,
) -> Result<FieldDeclaration> {
    let name = match (&decl.name, &decl.label) {
        (Some(name), _) => name.clone(),
        (None, Some(label)) => name_from_label(label),
        (None, None) => String::new(),
    };
    if !is_valid_name(&name) {
        return Err(BlockPressError::InvalidName(format!("{entity}.{name}")));
    }
    decl.name = Some(name);

    let sub_fields = std::mem::take(&mut decl.sub_fields);
    decl.sub_fields = resolve_slots(entity, sub_fields, generators)?
        .into_iter()
        .map(FieldSlot::Literal)
        .collect();
    Ok(decl)
}
