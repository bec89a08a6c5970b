//! Schema compiler.
//!
//! Expands the registry into the field-group tree consumed by the
//! custom-fields storage layer and fills the flat index as a side effect.
//! Node ids come from [`crate::key`] over these paths:
//!
//! ```text
//! group     <builder>
//! controls  <builder>:settings:{enabled,layout}
//! layout    <builder>:layouts:<layout>
//! block     <collection path>:<block>
//! field     <block path>:<group>:<field>[:<sub field>...]
//! tab       <block path>:tabs:<group>
//! ```

mod fields;

pub use fields::*;

use crate::error::{BlockPressError, Result};
use crate::flatmap::{FlatEntry, FlatIndex, NodeType};
use crate::key::{KeyKind, KeyPath, KEY_SCHEME_VERSION};
use crate::registry::{Entity, EntityKind, EntityRef, FieldGroup, Registry};
use crate::schema::{BlockKind, FieldDeclaration, FieldSlot, NameFilter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};

/// Output of one successful compilation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledSchema {
    pub group: FieldGroupNode,
    pub flatmap: FlatIndex,
    /// Hash of the definitions this schema was compiled from
    pub source_hash: String,
    pub key_scheme: u32,
    pub compiled_at: DateTime<Utc>,
}

/// A compiled entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CompiledNode {
    /// A layout compiles to its flexible_content field
    Layout(FieldNode),
    Block(BlockNode),
}

/// Where an entity is being compiled.
#[derive(Debug, Clone, Default)]
pub struct CompileContext<'r> {
    /// The layout that ultimately owns everything compiled under this context
    pub layout: Option<&'r Entity>,
    /// The entity whose collection is being filled
    pub parent: Option<&'r Entity>,
    ancestors: Vec<String>,
}

impl<'r> CompileContext<'r> {
    pub fn in_layout(layout: &'r Entity) -> Self {
        CompileContext {
            layout: Some(layout),
            parent: Some(layout),
            ancestors: Vec::new(),
        }
    }

    fn nested(&self, block: &'r Entity) -> Self {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(block.name.clone());
        CompileContext {
            layout: self.layout,
            parent: Some(block),
            ancestors,
        }
    }

    fn layout_name(&self) -> Option<String> {
        self.layout.map(|l| l.name.clone())
    }
}

/// Compile every layout in the registry into a field group.
pub fn compile(registry: &Registry) -> Result<CompiledSchema> {
    let mut compiler = Compiler::new(registry);
    let group = compiler.compile_field_group()?;
    Ok(CompiledSchema {
        group,
        flatmap: compiler.into_flatmap(),
        source_hash: registry.source_hash().to_string(),
        key_scheme: KEY_SCHEME_VERSION,
        compiled_at: Utc::now(),
    })
}

/// Core fields merged into every block's configure group.
pub fn core_configure_fields() -> Vec<FieldDeclaration> {
    vec![
        FieldDeclaration::new("element_id", "Element ID", "text")
            .with_instructions("Give this block a unique ID on the page"),
        FieldDeclaration::new("element_class", "Element Class", "text")
            .with_instructions("Add extra CSS classes to this block"),
    ]
}

/// Name of the tab marker that opens a field group.
pub fn tab_name(group: FieldGroup) -> String {
    format!("blockpress_{}", group.as_str())
}

pub struct Compiler<'r> {
    registry: &'r Registry,
    flatmap: FlatIndex,
}

impl<'r> Compiler<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Compiler {
            registry,
            flatmap: FlatIndex::default(),
        }
    }

    pub fn flatmap(&self) -> &FlatIndex {
        &self.flatmap
    }

    pub fn into_flatmap(self) -> FlatIndex {
        self.flatmap
    }

    /// Compile one entity whose own path lies under `parent_path`.
    pub fn compile_entity(
        &mut self,
        entity: &'r Entity,
        parent_path: &KeyPath,
        ctx: &CompileContext<'r>,
    ) -> Result<CompiledNode> {
        match entity.kind {
            EntityKind::Layout => self.compile_layout(entity, parent_path).map(CompiledNode::Layout),
            EntityKind::Block(_) => {
                let path = parent_path.child(&entity.name);
                self.compile_block(entity, &path, None, ctx)
                    .map(CompiledNode::Block)
            }
        }
    }

    /// The builder field group: enable toggle, layout select, one collection per layout.
    pub fn compile_field_group(&mut self) -> Result<FieldGroupNode> {
        let settings = self.registry.settings().clone();
        let root = KeyPath::root(&settings.name);
        let builder = EntityRef::builder(&settings.name);
        let controls = root.child("settings");

        let enabled_key = controls.child("enabled").encode(KeyKind::Field);
        let select_key = controls.child("layout").encode(KeyKind::Field);

        let mut enabled = FieldNode::new(
            FieldKind::TrueFalse,
            &enabled_key,
            &format!("{}_enabled", settings.name),
            &format!("Use {}", settings.label),
        )
        .with_option("ui", json!(1));
        enabled.instructions = settings.description.clone();
        self.index_field(&enabled, &builder, None, None, None)?;

        let registry: &'r Registry = self.registry;
        let layouts_path = root.child("layouts");
        let mut choices = Map::new();
        let mut layout_fields = Vec::new();
        for layout in registry.layouts() {
            let mut node = self.compile_layout(layout, &layouts_path)?;
            choices.insert(node.name.clone(), Value::String(layout.label.clone()));
            node.conditional_logic =
                ConditionalLogic::when(&enabled_key, "1").and(&select_key, &node.name);
            layout_fields.push(node);
        }

        let default_layout = choices.keys().next().cloned().unwrap_or_default();
        let mut select = FieldNode::new(
            FieldKind::Select,
            &select_key,
            &format!("{}_layout", settings.name),
            "Layout",
        )
        .with_option("choices", Value::Object(choices))
        .with_option("default_value", json!(default_layout));
        select.conditional_logic = ConditionalLogic::when(&enabled_key, "1");
        self.index_field(&select, &builder, None, None, None)?;

        let mut group = FieldGroupNode::new(
            &root.encode(KeyKind::Group),
            &settings.label,
            &settings.description,
            &settings.post_types,
        );
        group.fields.push(enabled);
        group.fields.push(select);
        group.fields.extend(layout_fields);
        Ok(group)
    }

    fn compile_layout(&mut self, layout: &'r Entity, parent_path: &KeyPath) -> Result<FieldNode> {
        let settings = self.registry.settings();
        let path = parent_path.child(&layout.name);
        let key = path.encode(KeyKind::Field);
        let slug = format!("{}_{}", settings.name, layout.name);

        let mut node = FieldNode::new(FieldKind::FlexibleContent, &key, &slug, &layout.label)
            .with_option("button_label", json!(layout.button_label));
        node.instructions = layout.instructions.clone();

        let ctx = CompileContext::in_layout(layout);
        node.layouts = self.compile_variants(&layout.children, &path, &key, &ctx)?;

        self.flatmap.insert(FlatEntry {
            key,
            name: slug,
            entity: layout.entity_ref(),
            field_group: None,
            node: NodeType::Layout,
            parent: None,
            layout: Some(layout.name.clone()),
            is_block_boundary: true,
            return_format: None,
        })?;
        Ok(node)
    }

    /// Compile every permitted, compatible child block into a variant map.
    fn compile_variants(
        &mut self,
        filter: &NameFilter,
        path: &KeyPath,
        collection_key: &str,
        ctx: &CompileContext<'r>,
    ) -> Result<BTreeMap<String, BlockNode>> {
        let (Some(_), Some(parent)) = (ctx.layout, ctx.parent) else {
            return Err(BlockPressError::MissingLayoutContext {
                field: path.joined(),
            });
        };

        let registry: &'r Registry = self.registry;
        let mut variants = BTreeMap::new();
        for candidate in registry.candidates(filter) {
            if !candidate.is_compatible_with(parent) {
                log::debug!(
                    "Block '{}' is not offered inside '{}'",
                    candidate.name,
                    parent.name
                );
                continue;
            }
            if ctx.ancestors.iter().any(|a| a == &candidate.name) {
                log::warn!(
                    "Skipping block '{}' inside '{}': it already encloses this collection",
                    candidate.name,
                    parent.name
                );
                continue;
            }
            let block_path = path.child(&candidate.name);
            let block = self.compile_block(candidate, &block_path, Some(collection_key), ctx)?;
            variants.insert(block.key.clone(), block);
        }
        Ok(variants)
    }

    fn compile_block(
        &mut self,
        block: &'r Entity,
        path: &KeyPath,
        collection_key: Option<&str>,
        ctx: &CompileContext<'r>,
    ) -> Result<BlockNode> {
        let key = path.encode(KeyKind::Block);
        let inner = ctx.nested(block);

        let content = shape_content(block);
        let configure: Vec<FieldDeclaration> = if self.registry.settings().core_fields {
            block
                .fields
                .configure
                .iter()
                .cloned()
                .chain(core_configure_fields())
                .collect()
        } else {
            block.fields.configure.clone()
        };
        let groups = [
            (FieldGroup::Content, content),
            (FieldGroup::Customise, block.fields.customise.clone()),
            (FieldGroup::Configure, configure),
        ];

        for (group, decls) in &groups {
            let tab = tab_name(*group);
            let mut names: Vec<&str> = decls.iter().map(|d| d.name()).collect();
            if *group != FieldGroup::Content && !decls.is_empty() {
                names.push(&tab);
            }
            check_unique(&block.name, group.as_str(), names)?;
        }

        let siblings = Siblings::for_groups(path, &groups);
        let mut sub_fields = Vec::new();
        for (group, decls) in &groups {
            if decls.is_empty() {
                continue;
            }
            if *group != FieldGroup::Content {
                let tab = self.compile_tab(block, *group, path, &key, &inner)?;
                sub_fields.push(tab);
            }

            let group_path = path.child(group.as_str());
            let mut nodes = Vec::with_capacity(decls.len());
            for decl in decls {
                let node = self.compile_field(
                    decl,
                    *group,
                    block,
                    &group_path,
                    &key,
                    &siblings,
                    &inner,
                )?;
                nodes.push(node);
            }
            if *group == FieldGroup::Content {
                if let Some(slot) = collection_slot(block, decls) {
                    let collection = nodes.remove(slot);
                    nodes.insert(0, collection);
                }
            }
            sub_fields.extend(nodes);
        }

        self.flatmap.insert(FlatEntry {
            key: key.clone(),
            name: block.name.clone(),
            entity: block.entity_ref(),
            field_group: None,
            node: NodeType::Block,
            parent: collection_key.map(str::to_string),
            layout: ctx.layout_name(),
            is_block_boundary: true,
            return_format: None,
        })?;

        Ok(BlockNode {
            key,
            name: block.name.clone(),
            label: block.label.clone(),
            display: block.display.clone(),
            sub_fields,
            min: String::new(),
            max: String::new(),
        })
    }

    fn compile_tab(
        &mut self,
        block: &Entity,
        group: FieldGroup,
        block_path: &KeyPath,
        block_key: &str,
        ctx: &CompileContext<'r>,
    ) -> Result<FieldNode> {
        let key = block_path.child("tabs").child(group.as_str()).encode(KeyKind::Field);
        let label = match group {
            FieldGroup::Content => "Content",
            FieldGroup::Customise => "Customise",
            FieldGroup::Configure => "Configure",
        };
        let node = FieldNode::new(FieldKind::Tab, &key, &tab_name(group), label);
        self.index_field(
            &node,
            &block.entity_ref(),
            Some(group),
            Some(block_key),
            ctx.layout_name(),
        )?;
        Ok(node)
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_field(
        &mut self,
        decl: &FieldDeclaration,
        group: FieldGroup,
        owner: &'r Entity,
        parent_path: &KeyPath,
        parent_key: &str,
        siblings: &Siblings,
        ctx: &CompileContext<'r>,
    ) -> Result<FieldNode> {
        let kind = FieldKind::parse(&decl.field_type).ok_or_else(|| {
            BlockPressError::UnknownFieldType {
                entity: owner.name.clone(),
                field: decl.name().to_string(),
                field_type: decl.field_type.clone(),
            }
        })?;
        let path = parent_path.child(decl.name());
        let key = path.encode(KeyKind::Field);

        let mut node = FieldNode::from_declaration(kind, &key, decl);
        node.conditional_logic = resolve_conditions(owner, decl, group, siblings)?;

        if kind.is_block_collection() {
            let filter = decl.blocks.as_ref().unwrap_or(&owner.children);
            node.layouts = self.compile_variants(filter, &path, &key, ctx)?;
        } else if kind.has_sub_fields() {
            let subs: Vec<&FieldDeclaration> = decl.literal_sub_fields().collect();
            check_unique(
                &owner.name,
                &format!("{}.{}", group.as_str(), decl.name()),
                subs.iter().map(|d| d.name()),
            )?;
            let sub_siblings = Siblings::for_fields(group, &path, subs.iter().copied());
            for sub in subs {
                let child =
                    self.compile_field(sub, group, owner, &path, &key, &sub_siblings, ctx)?;
                node.sub_fields.push(child);
            }
        }

        self.index_field(
            &node,
            &owner.entity_ref(),
            Some(group),
            Some(parent_key),
            ctx.layout_name(),
        )?;
        Ok(node)
    }

    fn index_field(
        &mut self,
        node: &FieldNode,
        entity: &EntityRef,
        group: Option<FieldGroup>,
        parent: Option<&str>,
        layout: Option<String>,
    ) -> Result<()> {
        self.flatmap.insert(FlatEntry {
            key: node.key.clone(),
            name: node.name.clone(),
            entity: entity.clone(),
            field_group: group,
            node: NodeType::Field(node.kind),
            parent: parent.map(str::to_string),
            layout,
            is_block_boundary: false,
            return_format: node.option_str("return_format").map(str::to_string),
        })
    }
}

/// Content declarations with the collection a container shape requires.
fn shape_content(block: &Entity) -> Vec<FieldDeclaration> {
    let mut content = block.fields.content.clone();
    let flexible = FieldKind::FlexibleContent.as_str();
    match block.kind {
        EntityKind::Block(BlockKind::Container) => {
            if !content.iter().any(|d| d.field_type == flexible) {
                content.insert(0, FieldDeclaration::new("blocks", "Blocks", flexible));
            }
        }
        EntityKind::Block(BlockKind::Repeating) => {
            let repeater = FieldKind::Repeater.as_str();
            let slot = match content.iter().position(|d| d.field_type == repeater) {
                Some(slot) => slot,
                None => {
                    content.insert(0, FieldDeclaration::new("items", "Items", repeater));
                    0
                }
            };
            let row = &mut content[slot];
            if !row.literal_sub_fields().any(|d| d.field_type == flexible) {
                row.sub_fields.insert(
                    0,
                    FieldSlot::Literal(FieldDeclaration::new("content", "Content", flexible)),
                );
            }
        }
        _ => {}
    }
    content
}

/// Position of the collection that a container shape pins to slot 0.
fn collection_slot(block: &Entity, content: &[FieldDeclaration]) -> Option<usize> {
    let kind = match block.kind {
        EntityKind::Block(BlockKind::Container) => FieldKind::FlexibleContent,
        EntityKind::Block(BlockKind::Repeating) => FieldKind::Repeater,
        _ => return None,
    };
    content.iter().position(|d| d.field_type == kind.as_str())
}

fn check_unique<'a>(
    entity: &str,
    group: &str,
    names: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(BlockPressError::DuplicateFieldName {
                entity: entity.to_string(),
                group: group.to_string(),
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

/// Compiled ids of the fields a conditional rule may refer to, by name.
struct Siblings {
    fields: Vec<(FieldGroup, String, String)>,
}

impl Siblings {
    fn for_groups(block_path: &KeyPath, groups: &[(FieldGroup, Vec<FieldDeclaration>)]) -> Self {
        let mut fields = Vec::new();
        for (group, decls) in groups {
            let group_path = block_path.child(group.as_str());
            for decl in decls {
                let key = group_path.child(decl.name()).encode(KeyKind::Field);
                fields.push((*group, decl.name().to_string(), key));
            }
        }
        Siblings { fields }
    }

    fn for_fields<'a>(
        group: FieldGroup,
        parent_path: &KeyPath,
        decls: impl Iterator<Item = &'a FieldDeclaration>,
    ) -> Self {
        let fields = decls
            .map(|decl| {
                let key = parent_path.child(decl.name()).encode(KeyKind::Field);
                (group, decl.name().to_string(), key)
            })
            .collect();
        Siblings { fields }
    }

    /// Same group first, then the other groups in order.
    fn resolve(&self, group: FieldGroup, name: &str) -> Option<&str> {
        let same = self.fields.iter().filter(|(g, _, _)| *g == group);
        let other = self.fields.iter().filter(|(g, _, _)| *g != group);
        same.chain(other)
            .find(|(_, n, _)| n == name)
            .map(|(_, _, key)| key.as_str())
    }
}

fn resolve_conditions(
    owner: &Entity,
    decl: &FieldDeclaration,
    group: FieldGroup,
    siblings: &Siblings,
) -> Result<ConditionalLogic> {
    let Some(condition) = &decl.conditional else {
        return Ok(ConditionalLogic::default());
    };
    let mut clauses = Vec::new();
    for clause in condition.clauses() {
        let mut rules = Vec::with_capacity(clause.len());
        for rule in clause {
            let field = siblings.resolve(group, &rule.field).ok_or_else(|| {
                BlockPressError::UnknownConditionField {
                    entity: owner.name.clone(),
                    field: decl.name().to_string(),
                    target: rule.field.clone(),
                }
            })?;
            rules.push(ConditionRule {
                field: field.to_string(),
                operator: rule.operator.clone(),
                value: condition_value(&rule.value),
            });
        }
        clauses.push(rules);
    }
    Ok(ConditionalLogic::new(clauses))
}

/// Rule values are compared as strings by the storage layer.
fn condition_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "1".into(),
        Value::Bool(false) => "0".into(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{parse_definitions_str, GeneratorRegistry};
    use pretty_assertions::assert_eq;

    const UNIVERSE: &str = r#"
settings:
  name: builder
blocks:
  text:
    content:
      - name: title
        type: text
      - name: body
        type: wysiwyg
    customise:
      - generate: bg_color
  image:
    content:
      - name: image
        type: image
  columns:
    kind: repeating
    blocks: [column]
    rules:
      block: none
      layout: "*"
  column:
    kind: container
    blocks: { except: [columns, column] }
    rules:
      block: columns
layouts:
  page:
    label: Page
"#;

    fn registry(yaml: &str) -> Registry {
        Registry::build(
            parse_definitions_str(yaml).unwrap(),
            &GeneratorRegistry::with_builtins(),
        )
        .unwrap()
    }

    fn layout_field<'a>(schema: &'a CompiledSchema, name: &str) -> &'a FieldNode {
        schema.group.fields.iter().find(|f| f.name == name).unwrap()
    }

    fn variant<'a>(field: &'a FieldNode, block: &str) -> Option<&'a BlockNode> {
        field.layouts.values().find(|b| b.name == block)
    }

    fn variant_names(field: &FieldNode) -> Vec<String> {
        let mut names: Vec<String> = field.layouts.values().map(|b| b.name.clone()).collect();
        names.sort();
        names
    }

    fn collect_keys(fields: &[FieldNode], out: &mut Vec<String>) {
        for field in fields {
            out.push(field.key.clone());
            collect_keys(&field.sub_fields, out);
            for block in field.layouts.values() {
                out.push(block.key.clone());
                collect_keys(&block.sub_fields, out);
            }
        }
    }

    #[test]
    fn test_compile_is_deterministic() {
        let registry = registry(UNIVERSE);
        let a = compile(&registry).unwrap();
        let b = compile(&registry).unwrap();
        assert_eq!(a.group, b.group);
        assert_eq!(a.flatmap, b.flatmap);
        assert_eq!(
            serde_json::to_string(&a.group).unwrap(),
            serde_json::to_string(&b.group).unwrap()
        );
    }

    #[test]
    fn test_all_ids_unique_and_indexed() {
        let schema = compile(&registry(UNIVERSE)).unwrap();
        let mut keys = Vec::new();
        collect_keys(&schema.group.fields, &mut keys);
        let unique: HashSet<&String> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
        assert_eq!(schema.flatmap.len(), keys.len());
        for key in &keys {
            assert!(schema.flatmap.lookup(key).is_some(), "{key} not indexed");
        }
    }

    #[test]
    fn test_builder_field_group_shape() {
        let schema = compile(&registry(UNIVERSE)).unwrap();
        let names: Vec<&str> = schema.group.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["builder_enabled", "builder_layout", "builder_page"]);

        let enabled = &schema.group.fields[0];
        let select = &schema.group.fields[1];
        let page = &schema.group.fields[2];
        assert_eq!(select.options["choices"], json!({"builder_page": "Page"}));
        assert_eq!(
            select.conditional_logic,
            ConditionalLogic::when(&enabled.key, "1")
        );
        assert_eq!(
            page.conditional_logic,
            ConditionalLogic::when(&enabled.key, "1").and(&select.key, "builder_page")
        );
        assert!(schema.group.key.starts_with("group_"));
        assert_eq!(schema.group.location.len(), 2);
    }

    #[test]
    fn test_block_groups_tabs_and_core_fields() {
        let schema = compile(&registry(UNIVERSE)).unwrap();
        let page = layout_field(&schema, "builder_page");
        let text = variant(page, "text").unwrap();
        let names: Vec<&str> = text.sub_fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "title",
                "body",
                "blockpress_customise",
                "bg_color",
                "blockpress_configure",
                "element_id",
                "element_class"
            ]
        );
        assert_eq!(text.sub_fields[2].kind, FieldKind::Tab);
        assert!(text.key.starts_with("block_"));
        assert!(text.sub_fields[0].key.starts_with("field_"));
    }

    #[test]
    fn test_scenario_a_basic_block_without_variants() {
        let registry = registry(
            r#"
settings:
  core_fields: false
blocks:
  gallery:
    content:
      - name: layout
        type: select
        choices: { grid: Grid, carousel: Carousel }
      - name: images
        type: gallery
layouts:
  page: {}
"#,
        );
        let schema = compile(&registry).unwrap();
        let page = layout_field(&schema, "builder_page");
        let gallery = variant(page, "gallery").unwrap();
        assert_eq!(gallery.sub_fields.len(), 2);
        assert!(gallery.sub_fields.iter().all(|f| f.layouts.is_empty()));
        assert_eq!(gallery.sub_fields[0].kind, FieldKind::Select);
        assert_eq!(gallery.sub_fields[1].kind, FieldKind::Gallery);
    }

    #[test]
    fn test_scenario_b_nested_column_variants() {
        let schema = compile(&registry(UNIVERSE)).unwrap();
        let page = layout_field(&schema, "builder_page");
        assert_eq!(variant_names(page), vec!["columns", "image", "text"]);

        let columns = variant(page, "columns").unwrap();
        let repeater = &columns.sub_fields[0];
        assert_eq!(repeater.kind, FieldKind::Repeater);
        let inner = &repeater.sub_fields[0];
        assert_eq!(inner.kind, FieldKind::FlexibleContent);
        assert_eq!(inner.name, "content");
        assert_eq!(variant_names(inner), vec!["column"]);

        let column = variant(inner, "column").unwrap();
        let collection = &column.sub_fields[0];
        assert_eq!(collection.kind, FieldKind::FlexibleContent);
        assert_eq!(variant_names(collection), vec!["image", "text"]);
    }

    #[test]
    fn test_compatibility_filtering_by_parent_name() {
        let registry = registry(
            r#"
blocks:
  columns:
    kind: container
  section:
    kind: container
  column:
    rules:
      block: columns
layouts:
  page: {}
"#,
        );
        let schema = compile(&registry).unwrap();
        let page = layout_field(&schema, "builder_page");
        let columns = variant(page, "columns").unwrap();
        let section = variant(page, "section").unwrap();

        assert!(variant_names(&columns.sub_fields[0]).contains(&"column".to_string()));
        assert!(!variant_names(&section.sub_fields[0]).contains(&"column".to_string()));
        assert_eq!(variant_names(page), vec!["columns", "section"]);
    }

    #[test]
    fn test_declared_rules_exclude_unmentioned_parent_types() {
        let registry = registry(
            r#"
blocks:
  text: {}
  pinned:
    rules: {}
  headline:
    rules:
      layout: [page]
layouts:
  page: {}
"#,
        );
        let schema = compile(&registry).unwrap();
        let page = layout_field(&schema, "builder_page");
        assert_eq!(variant_names(page), vec!["headline", "text"]);
    }

    #[test]
    fn test_container_collection_relocated_to_slot_zero() {
        let registry = registry(
            r#"
blocks:
  panel:
    kind: container
    content:
      - name: heading
        type: text
      - name: items
        type: flexible_content
      - name: footer
        type: text
  text: {}
layouts:
  page: {}
"#,
        );
        let schema = compile(&registry).unwrap();
        let panel = variant(layout_field(&schema, "builder_page"), "panel").unwrap();
        let names: Vec<&str> = panel.sub_fields.iter().take(3).map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["items", "heading", "footer"]);
        assert_eq!(variant_names(&panel.sub_fields[0]), vec!["text"]);
    }

    #[test]
    fn test_scenario_d_duplicate_field_name() {
        let registry = registry(
            r#"
blocks:
  text:
    content:
      - name: title
        type: text
      - name: title
        type: textarea
layouts:
  page: {}
"#,
        );
        match compile(&registry).unwrap_err() {
            BlockPressError::DuplicateFieldName {
                entity,
                group,
                name,
            } => {
                assert_eq!(entity, "text");
                assert_eq!(group, "content");
                assert_eq!(name, "title");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_with_core_field() {
        let registry = registry(
            "blocks:\n  text:\n    configure:\n      - name: element_id\n        type: text\nlayouts:\n  page: {}\n",
        );
        let err = compile(&registry).unwrap_err();
        assert!(matches!(err, BlockPressError::DuplicateFieldName { .. }));
        assert!(err.is_fatal_to_compile());
    }

    #[test]
    fn test_same_name_in_different_groups_is_allowed() {
        let registry = registry(
            "blocks:\n  text:\n    content:\n      - name: title\n        type: text\n    customise:\n      - name: title\n        type: text\nlayouts:\n  page: {}\n",
        );
        let schema = compile(&registry).unwrap();
        let text = variant(layout_field(&schema, "builder_page"), "text").unwrap();
        let titles: Vec<&FieldNode> = text.sub_fields.iter().filter(|f| f.name == "title").collect();
        assert_eq!(titles.len(), 2);
        assert_ne!(titles[0].key, titles[1].key);
    }

    #[test]
    fn test_unknown_field_type() {
        let registry = registry(
            "blocks:\n  text:\n    content:\n      - name: title\n        type: hologram\nlayouts:\n  page: {}\n",
        );
        assert!(matches!(
            compile(&registry).unwrap_err(),
            BlockPressError::UnknownFieldType { .. }
        ));
    }

    #[test]
    fn test_missing_layout_context() {
        let registry = registry("blocks:\n  section:\n    kind: container\n  text: {}\n");
        let section = registry.block("section").unwrap();
        let text = registry.block("text").unwrap();
        let mut compiler = Compiler::new(&registry);
        let root = KeyPath::root("builder");

        let err = compiler
            .compile_entity(section, &root, &CompileContext::default())
            .unwrap_err();
        assert!(matches!(err, BlockPressError::MissingLayoutContext { .. }));

        let node = compiler
            .compile_entity(text, &root, &CompileContext::default())
            .unwrap();
        assert!(matches!(node, CompiledNode::Block(_)));
    }

    #[test]
    fn test_conditional_logic_resolves_sibling_ids() {
        let registry = registry(
            r#"
blocks:
  hero:
    content:
      - name: style
        type: select
        choices: { plain: Plain, image: Image }
      - name: photo
        type: image
        conditional: { field: style, value: image }
    customise:
      - name: overlay
        type: true_false
      - name: overlay_color
        type: color_picker
        conditional:
          - - { field: overlay, value: true }
            - { field: style, operator: "!=", value: plain }
layouts:
  page: {}
"#,
        );
        let schema = compile(&registry).unwrap();
        let hero = variant(layout_field(&schema, "builder_page"), "hero").unwrap();
        let by_name = |n: &str| hero.sub_fields.iter().find(|f| f.name == n).unwrap();

        assert_eq!(
            by_name("photo").conditional_logic,
            ConditionalLogic::when(&by_name("style").key, "image")
        );
        let rules = &by_name("overlay_color").conditional_logic.clauses()[0];
        assert_eq!(rules[0].field, by_name("overlay").key);
        assert_eq!(rules[0].value, "1");
        assert_eq!(rules[1].field, by_name("style").key);
        assert_eq!(rules[1].operator, "!=");
    }

    #[test]
    fn test_conditional_on_unknown_sibling() {
        let registry = registry(
            "blocks:\n  hero:\n    content:\n      - name: photo\n        type: image\n        conditional: { field: ghost, value: x }\nlayouts:\n  page: {}\n",
        );
        assert!(matches!(
            compile(&registry).unwrap_err(),
            BlockPressError::UnknownConditionField { .. }
        ));
    }

    #[test]
    fn test_self_nesting_is_skipped() {
        let registry = registry("blocks:\n  section:\n    kind: container\nlayouts:\n  page: {}\n");
        let schema = compile(&registry).unwrap();
        let section = variant(layout_field(&schema, "builder_page"), "section").unwrap();
        assert!(section.sub_fields[0].layouts.is_empty());
    }

    #[test]
    fn test_unknown_explicit_child_is_skipped() {
        let registry = registry("blocks:\n  text: {}\nlayouts:\n  page:\n    blocks: [text, ghost]\n");
        let schema = compile(&registry).unwrap();
        assert_eq!(variant_names(layout_field(&schema, "builder_page")), vec!["text"]);
    }

    #[test]
    fn test_ids_stable_when_unrelated_block_added() {
        let before = compile(&registry(UNIVERSE)).unwrap();
        let extended = UNIVERSE.replace("layouts:\n", "  quote: {}\nlayouts:\n");
        let after = compile(&registry(&extended)).unwrap();
        assert!(after.flatmap.len() > before.flatmap.len());
        for entry in before.flatmap.entries() {
            assert_eq!(after.flatmap.lookup(&entry.key), Some(entry));
        }
    }
}
