//! Data rehydration.
//!
//! Stored rows are maps from compiled id to raw value. Rehydration walks them
//! with nothing but the flat index and produces block-shaped data grouped by
//! field group, with a `_meta` envelope the render cache keys on.
//! [`flatten_block`] is the inverse.

use crate::compiler::FieldKind;
use crate::error::{BlockPressError, Result};
use crate::flatmap::{FlatEntry, FlatIndex, NodeType};
use crate::registry::FieldGroup;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Row key carrying the block variant (block name or variant id).
pub const VARIANT_TAG: &str = "acf_fc_layout";

/// Key of the metadata envelope in rehydrated blocks.
pub const META_KEY: &str = "_meta";

/// Where a rehydrated block sits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub layout: String,
    pub block: String,
    /// Compiled id of the block variant
    pub key: String,
    /// Variant tag as stored, either the block name or the variant id
    #[serde(default)]
    pub tag: String,
    /// Row position inside the enclosing collection
    pub index: usize,
    /// Layout name for top-level blocks, else `<parent>/<index>:<block>/<field path>`
    pub parent: String,
    /// Storage form of every value normalisation changed, by field path
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stored: BTreeMap<String, StoredValue>,
}

impl BlockMeta {
    /// Read the envelope back from rehydrated data.
    pub fn from_data(data: &Value) -> Option<BlockMeta> {
        data.get(META_KEY)
            .and_then(|meta| serde_json::from_value(meta.clone()).ok())
    }

    fn child_parent(&self, trail: &str) -> String {
        format!("{}/{}:{}/{}", self.parent, self.index, self.block, trail)
    }

    fn stored_tag(&self) -> &str {
        if self.tag.is_empty() {
            &self.block
        } else {
            &self.tag
        }
    }
}

/// A raw stored value next to what it normalised to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    pub raw: Value,
    pub value: Value,
}

/// `group.field.row.sub_field`, or the bare trail outside any group.
fn stored_path(group: Option<FieldGroup>, trail: &str) -> String {
    match group {
        Some(group) => format!("{group}.{trail}"),
        None => trail.to_string(),
    }
}

/// Expands stored references into descriptors. Implemented by the host.
pub trait ValueResolver {
    /// Expand an image/file attachment reference.
    fn attachment(&self, _reference: &Value) -> Option<Value> {
        None
    }

    /// Expand a reference to another content item.
    fn content_item(&self, _reference: &Value) -> Option<Value> {
        None
    }
}

/// Keeps every reference as stored.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawValues;

impl ValueResolver for RawValues {}

/// Rehydrate one stored row of a block variant.
pub fn rehydrate(
    row: &Map<String, Value>,
    index: &FlatIndex,
    meta: BlockMeta,
    resolver: &dyn ValueResolver,
) -> Value {
    Rehydrator::new(index, resolver).rehydrate_row(row, meta)
}

/// State of the block row being rehydrated.
struct RowState<'m> {
    meta: &'m BlockMeta,
    group: Option<FieldGroup>,
    stored: BTreeMap<String, StoredValue>,
}

impl RowState<'_> {
    fn record(&mut self, trail: &str, raw: &Value, value: &Value) {
        if raw != value {
            self.stored.insert(
                stored_path(self.group, trail),
                StoredValue {
                    raw: raw.clone(),
                    value: value.clone(),
                },
            );
        }
    }
}

pub struct Rehydrator<'a> {
    index: &'a FlatIndex,
    resolver: &'a dyn ValueResolver,
}

impl<'a> Rehydrator<'a> {
    pub fn new(index: &'a FlatIndex, resolver: &'a dyn ValueResolver) -> Self {
        Rehydrator { index, resolver }
    }

    /// Rehydrate the rows of a layout's top-level collection, in order.
    ///
    /// Rows whose variant cannot be resolved are passed through unchanged.
    pub fn rehydrate_layout(&self, layout: &str, rows: &[Value]) -> Vec<Value> {
        let Some(collection) = self.index.layout_key(layout) else {
            log::warn!("Layout '{layout}' is not in the compiled index");
            return rows.to_vec();
        };
        rows.iter()
            .enumerate()
            .map(|(position, row)| {
                self.variant_row(collection, row, |block, tag| BlockMeta {
                    layout: layout.to_string(),
                    block: block.name.clone(),
                    key: block.key.clone(),
                    tag: tag.to_string(),
                    index: position,
                    parent: layout.to_string(),
                    stored: BTreeMap::new(),
                })
            })
            .collect()
    }

    /// Rehydrate one block row, grouping plain fields by field group.
    ///
    /// Only fields of the row's own variant are interpreted; any other id is
    /// passed through unchanged.
    pub fn rehydrate_row(&self, row: &Map<String, Value>, mut meta: BlockMeta) -> Value {
        let mut data = Map::new();
        let mut state = RowState {
            meta: &meta,
            group: None,
            stored: BTreeMap::new(),
        };

        for (id, raw) in row {
            if id == VARIANT_TAG {
                continue;
            }
            let Some(entry) = self.child_entry(&state.meta.key, id) else {
                data.insert(id.clone(), raw.clone());
                continue;
            };
            if entry.is_tab() {
                state.group = entry.field_group;
                continue;
            }
            let tab_group = state.group;
            state.group = entry.field_group.or(tab_group);
            let value = self.rehydrate_value(entry, raw, &mut state, &entry.name);
            match state.group {
                Some(group) => {
                    let slot = data
                        .entry(group.as_str())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let Value::Object(fields) = slot {
                        fields.insert(entry.name.clone(), value);
                    }
                }
                None => {
                    data.insert(entry.name.clone(), value);
                }
            }
            state.group = tab_group;
        }

        let RowState { stored, .. } = state;
        meta.stored = stored;
        match serde_json::to_value(&meta) {
            Ok(envelope) => {
                data.insert(META_KEY.to_string(), envelope);
            }
            Err(e) => log::warn!("Could not attach block metadata: {e}"),
        }
        Value::Object(data)
    }

    /// Entry for `id` if it sits directly under `parent`.
    fn child_entry(&self, parent: &str, id: &str) -> Option<&'a FlatEntry> {
        let entry = self.index.lookup(id)?;
        if entry.parent.as_deref() == Some(parent) {
            Some(entry)
        } else {
            log::debug!("Passing through '{id}': not a field of {parent}");
            None
        }
    }

    /// `trail` is the field path inside the enclosing block, used for nested parents.
    fn rehydrate_value(&self, entry: &FlatEntry, raw: &Value, state: &mut RowState<'_>, trail: &str) -> Value {
        if entry.is_block_collection() {
            let Some(rows) = raw.as_array() else {
                return raw.clone();
            };
            let meta = state.meta;
            let parent = meta.child_parent(trail);
            return Value::Array(
                rows.iter()
                    .enumerate()
                    .map(|(position, row)| {
                        self.variant_row(&entry.key, row, |block, tag| BlockMeta {
                            layout: meta.layout.clone(),
                            block: block.name.clone(),
                            key: block.key.clone(),
                            tag: tag.to_string(),
                            index: position,
                            parent: parent.clone(),
                            stored: BTreeMap::new(),
                        })
                    })
                    .collect(),
            );
        }

        match entry.field_kind() {
            Some(FieldKind::Repeater) => match raw.as_array() {
                Some(rows) => Value::Array(
                    rows.iter()
                        .enumerate()
                        .map(|(position, row)| {
                            self.rehydrate_fields(entry, row, state, &format!("{trail}.{position}"))
                        })
                        .collect(),
                ),
                None => raw.clone(),
            },
            Some(FieldKind::Group) => self.rehydrate_fields(entry, raw, state, trail),
            Some(kind) => {
                let value = normalise(kind, raw, self.resolver);
                state.record(trail, raw, &value);
                value
            }
            None => raw.clone(),
        }
    }

    /// A group value or repeater row: child ids become names in one object.
    fn rehydrate_fields(
        &self,
        parent: &FlatEntry,
        raw: &Value,
        state: &mut RowState<'_>,
        trail: &str,
    ) -> Value {
        let Some(fields) = raw.as_object() else {
            return raw.clone();
        };
        let mut out = Map::new();
        for (id, value) in fields {
            match self.child_entry(&parent.key, id) {
                Some(entry) => {
                    let child_trail = format!("{trail}.{}", entry.name);
                    out.insert(
                        entry.name.clone(),
                        self.rehydrate_value(entry, value, state, &child_trail),
                    );
                }
                None => {
                    out.insert(id.clone(), value.clone());
                }
            }
        }
        Value::Object(out)
    }

    fn variant_row<F>(&self, collection: &str, row: &Value, meta: F) -> Value
    where
        F: FnOnce(&FlatEntry, &str) -> BlockMeta,
    {
        let fields = row.as_object();
        let tag = fields
            .and_then(|fields| fields.get(VARIANT_TAG))
            .and_then(Value::as_str);
        let block = tag.and_then(|tag| self.index.resolve_variant(collection, tag));
        match (fields, tag, block) {
            (Some(fields), Some(tag), Some(block)) => self.rehydrate_row(fields, meta(block, tag)),
            _ => {
                log::debug!("Passing through row without a known variant in {collection}");
                row.clone()
            }
        }
    }
}

// ── Content items ────────────────────────────────────────────────────

/// The layout a content item renders and that layout's stored rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemLayout {
    pub layout: String,
    pub rows: Vec<Value>,
}

/// A content item's rehydrated blocks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RehydratedItem {
    pub layout: String,
    pub blocks: Vec<Value>,
}

/// Read the builder controls of one content item's stored row.
///
/// `Ok(None)` when the builder is switched off for the item. An empty layout
/// select falls back to the first layout, which is the select's default.
pub fn select_layout(index: &FlatIndex, row: &Map<String, Value>) -> Result<Option<ItemLayout>> {
    let enabled = index
        .control_key("enabled")
        .and_then(|key| row.get(key))
        .is_some_and(truthy);
    if !enabled {
        return Ok(None);
    }

    let choice = index
        .control_key("layout")
        .and_then(|key| row.get(key))
        .and_then(Value::as_str)
        .filter(|choice| !choice.is_empty());
    let layout = match choice {
        Some(choice) => index
            .layout_by_choice(choice)
            .ok_or_else(|| BlockPressError::UnknownEntity {
                name: choice.to_string(),
            })?,
        None => index
            .layout_names()
            .next()
            .ok_or_else(|| BlockPressError::Other("No layouts have been compiled".into()))?,
    };

    let rows = index
        .layout_key(layout)
        .and_then(|key| row.get(key))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    Ok(Some(ItemLayout {
        layout: layout.to_string(),
        rows,
    }))
}

/// Cast raw storage into native values for the field kind.
pub fn normalise(kind: FieldKind, raw: &Value, resolver: &dyn ValueResolver) -> Value {
    match kind {
        FieldKind::TrueFalse => Value::Bool(truthy(raw)),
        FieldKind::Number | FieldKind::Range => match raw {
            Value::String(s) if s.trim().is_empty() => Value::Null,
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .ok()
                .or_else(|| {
                    s.trim()
                        .parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                })
                .unwrap_or_else(|| raw.clone()),
            _ => raw.clone(),
        },
        FieldKind::Image | FieldKind::File => expand(raw, |r| resolver.attachment(r)),
        FieldKind::Gallery => match raw {
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| expand(item, |r| resolver.attachment(r)))
                    .collect(),
            ),
            _ => raw.clone(),
        },
        FieldKind::PostObject | FieldKind::PageLink | FieldKind::Relationship => match raw {
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| expand(item, |r| resolver.content_item(r)))
                    .collect(),
            ),
            _ => expand(raw, |r| resolver.content_item(r)),
        },
        _ => raw.clone(),
    }
}

fn expand(raw: &Value, resolve: impl Fn(&Value) -> Option<Value>) -> Value {
    if is_blank(raw) {
        return raw.clone();
    }
    resolve(raw).unwrap_or_else(|| raw.clone())
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => matches!(s.trim(), "1" | "true"),
        _ => false,
    }
}

// ── Re-flattening ────────────────────────────────────────────────────

/// Storage forms to restore while flattening one block.
struct Restore<'m> {
    stored: &'m BTreeMap<String, StoredValue>,
    group: Option<FieldGroup>,
}

impl Restore<'_> {
    /// The stored form of `value`, unless it was edited after rehydration.
    fn raw(&self, trail: &str, value: &Value) -> Option<Value> {
        self.stored
            .get(&stored_path(self.group, trail))
            .filter(|stored| &stored.value == value)
            .map(|stored| stored.raw.clone())
    }
}

/// Turn rehydrated blocks back into stored rows.
pub fn flatten_layout(index: &FlatIndex, blocks: &[Value]) -> Vec<Value> {
    blocks.iter().map(|block| flatten_block(index, block)).collect()
}

/// Turn one rehydrated block back into its stored row, using its `_meta.key`.
///
/// Values left as rehydrated are written back in their stored form. Data
/// without a metadata envelope is returned unchanged.
pub fn flatten_block(index: &FlatIndex, data: &Value) -> Value {
    let (Some(meta), Some(fields)) = (BlockMeta::from_data(data), data.as_object()) else {
        return data.clone();
    };
    let mut row = Map::new();
    row.insert(VARIANT_TAG.to_string(), Value::String(meta.stored_tag().to_string()));

    for (name, value) in fields {
        if name == META_KEY {
            continue;
        }
        let group = FieldGroup::parse(name).filter(|_| value.is_object());
        match group {
            Some(group) => {
                let Some(group_fields) = value.as_object() else {
                    continue;
                };
                let restore = Restore {
                    stored: &meta.stored,
                    group: Some(group),
                };
                for (field, field_value) in group_fields {
                    match index
                        .child_key(&meta.key, Some(group), field)
                        .and_then(|key| index.lookup(key))
                    {
                        Some(entry) => {
                            row.insert(
                                entry.key.clone(),
                                flatten_value(index, entry, field_value, &restore, field),
                            );
                        }
                        None => {
                            log::warn!("No field '{group}.{field}' in block '{}'", meta.block);
                        }
                    }
                }
            }
            None => match index.child_key(&meta.key, None, name).and_then(|k| index.lookup(k)) {
                Some(entry) => {
                    let restore = Restore {
                        stored: &meta.stored,
                        group: None,
                    };
                    row.insert(entry.key.clone(), flatten_value(index, entry, value, &restore, name));
                }
                None => {
                    row.insert(name.clone(), value.clone());
                }
            },
        }
    }
    Value::Object(row)
}

fn flatten_value(
    index: &FlatIndex,
    entry: &FlatEntry,
    value: &Value,
    restore: &Restore<'_>,
    trail: &str,
) -> Value {
    if entry.is_block_collection() {
        return match value {
            Value::Array(blocks) => {
                Value::Array(blocks.iter().map(|b| flatten_block(index, b)).collect())
            }
            _ => value.clone(),
        };
    }
    match entry.node {
        NodeType::Field(FieldKind::Repeater) => match value {
            Value::Array(rows) => Value::Array(
                rows.iter()
                    .enumerate()
                    .map(|(position, row)| {
                        flatten_fields(index, entry, row, restore, &format!("{trail}.{position}"))
                    })
                    .collect(),
            ),
            _ => value.clone(),
        },
        NodeType::Field(FieldKind::Group) => flatten_fields(index, entry, value, restore, trail),
        _ => {
            if let Some(raw) = restore.raw(trail, value) {
                return raw;
            }
            match (entry.node, value) {
                (NodeType::Field(FieldKind::TrueFalse), Value::Bool(b)) => Value::from(u8::from(*b)),
                _ => value.clone(),
            }
        }
    }
}

fn flatten_fields(
    index: &FlatIndex,
    parent: &FlatEntry,
    value: &Value,
    restore: &Restore<'_>,
    trail: &str,
) -> Value {
    let Some(fields) = value.as_object() else {
        return value.clone();
    };
    let mut out = Map::new();
    for (name, field_value) in fields {
        match index
            .child_key(&parent.key, parent.field_group, name)
            .and_then(|key| index.lookup(key))
        {
            Some(entry) => {
                let child_trail = format!("{trail}.{name}");
                out.insert(
                    entry.key.clone(),
                    flatten_value(index, entry, field_value, restore, &child_trail),
                );
            }
            None => {
                out.insert(name.clone(), field_value.clone());
            }
        }
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, CompiledSchema};
    use crate::registry::Registry;
    use crate::schema::{parse_definitions_str, GeneratorRegistry};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const DEFINITIONS: &str = r#"
blocks:
  gallery:
    content:
      - name: layout
        type: select
        choices: { grid: Grid, carousel: Carousel }
      - name: images
        type: gallery
  text:
    content:
      - name: title
        type: text
      - name: highlight
        type: true_false
      - name: links
        type: repeater
        sub_fields:
          - name: label
            type: text
          - name: url
            type: url
      - name: meta
        type: group
        sub_fields:
          - name: weight
            type: number
    customise:
      - generate: bg_color
  image:
    content:
      - name: image
        type: image
  section:
    kind: container
    rules:
      block: none
      layout: "*"
layouts:
  page: {}
"#;

    fn schema() -> CompiledSchema {
        let defs = parse_definitions_str(DEFINITIONS).unwrap();
        compile(&Registry::build(defs, &GeneratorRegistry::with_builtins()).unwrap()).unwrap()
    }

    struct Ids<'a> {
        index: &'a FlatIndex,
    }

    impl<'a> Ids<'a> {
        fn layout(&self) -> &'a str {
            self.index.layout_key("page").unwrap()
        }

        fn block(&self, collection: &str, name: &str) -> &'a str {
            &self.index.resolve_variant(collection, name).unwrap().key
        }

        fn field(&self, parent: &str, group: FieldGroup, name: &str) -> &'a str {
            self.index.child_key(parent, Some(group), name).unwrap()
        }
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_scenario_a_rehydrate_basic_block() {
        let schema = schema();
        let ids = Ids { index: &schema.flatmap };
        let gallery = ids.block(ids.layout(), "gallery");
        let layout_id = ids.field(gallery, FieldGroup::Content, "layout");
        let images_id = ids.field(gallery, FieldGroup::Content, "images");

        let mut row = Map::new();
        row.insert(VARIANT_TAG.into(), json!("gallery"));
        row.insert(layout_id.into(), json!("grid"));
        row.insert(images_id.into(), json!([11, 12]));

        let blocks = Rehydrator::new(&schema.flatmap, &RawValues)
            .rehydrate_layout("page", &[Value::Object(row)]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(
            blocks[0]["content"],
            json!({"layout": "grid", "images": [11, 12]})
        );
        let meta = BlockMeta::from_data(&blocks[0]).unwrap();
        assert_eq!(meta.block, "gallery");
        assert_eq!(meta.layout, "page");
        assert_eq!(meta.parent, "page");
        assert_eq!(meta.index, 0);
        assert_eq!(meta.key, gallery);
    }

    #[test]
    fn test_scenario_c_rows_keep_their_own_variants() {
        let schema = schema();
        let ids = Ids { index: &schema.flatmap };
        let layout = ids.layout();
        let text = ids.block(layout, "text");
        let image = ids.block(layout, "image");
        let gallery = ids.block(layout, "gallery");
        let title = ids.field(text, FieldGroup::Content, "title");
        let picture = ids.field(image, FieldGroup::Content, "image");
        let style = ids.field(gallery, FieldGroup::Content, "layout");

        let rows = vec![
            json!({ VARIANT_TAG: "text", title: "Hello" }),
            json!({ VARIANT_TAG: "image", picture: 42 }),
            json!({ VARIANT_TAG: gallery, style: "carousel" }),
        ];
        let blocks = Rehydrator::new(&schema.flatmap, &RawValues).rehydrate_layout("page", &rows);

        let tags: Vec<String> = blocks
            .iter()
            .map(|b| BlockMeta::from_data(b).unwrap().block)
            .collect();
        assert_eq!(tags, vec!["text", "image", "gallery"]);
        assert_eq!(blocks[0]["content"], json!({"title": "Hello"}));
        assert_eq!(blocks[1]["content"], json!({"image": 42}));
        assert_eq!(blocks[2]["content"], json!({"layout": "carousel"}));
        let positions: Vec<usize> = blocks
            .iter()
            .map(|b| BlockMeta::from_data(b).unwrap().index)
            .collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[test]
    fn test_repeater_group_and_normalisation() {
        let schema = schema();
        let ids = Ids { index: &schema.flatmap };
        let text = ids.block(ids.layout(), "text");
        let links = ids.field(text, FieldGroup::Content, "links");
        let label = ids.field(links, FieldGroup::Content, "label");
        let url = ids.field(links, FieldGroup::Content, "url");
        let meta_id = ids.field(text, FieldGroup::Content, "meta");
        let weight = ids.field(meta_id, FieldGroup::Content, "weight");
        let bg = ids.field(text, FieldGroup::Customise, "bg_color");
        let highlight = ids.field(text, FieldGroup::Content, "highlight");

        let row = object(json!({
            VARIANT_TAG: "text",
            highlight: "1",
            links: [
                { label: "Docs", url: "https://example.com/docs" },
                { label: "Blog", url: "https://example.com/blog" }
            ],
            meta_id: { weight: "2.5" },
            bg: "#fff",
            "external_field": "kept"
        }));
        let meta = BlockMeta {
            layout: "page".into(),
            block: "text".into(),
            key: text.into(),
            tag: "text".into(),
            index: 3,
            parent: "page".into(),
            stored: BTreeMap::new(),
        };
        let data = rehydrate(&row, &schema.flatmap, meta, &RawValues);

        assert_eq!(
            data["content"],
            json!({
                "highlight": true,
                "links": [
                    {"label": "Docs", "url": "https://example.com/docs"},
                    {"label": "Blog", "url": "https://example.com/blog"}
                ],
                "meta": {"weight": 2.5}
            })
        );
        assert_eq!(data["customise"], json!({"bg_color": "#fff"}));
        assert_eq!(data["external_field"], json!("kept"));

        let meta = BlockMeta::from_data(&data).unwrap();
        assert_eq!(
            meta.stored["content.highlight"],
            StoredValue {
                raw: json!("1"),
                value: json!(true)
            }
        );
        assert_eq!(meta.stored["content.meta.weight"].raw, json!("2.5"));
        assert!(!meta.stored.contains_key("content.links.0.label"));
    }

    #[test]
    fn test_fields_of_other_variants_pass_through() {
        let schema = schema();
        let ids = Ids { index: &schema.flatmap };
        let layout = ids.layout();
        let text = ids.block(layout, "text");
        let image = ids.block(layout, "image");
        let title = ids.field(text, FieldGroup::Content, "title");
        let picture = ids.field(image, FieldGroup::Content, "image");

        let rows = vec![json!({ VARIANT_TAG: "text", title: "Hello", picture: 42 })];
        let blocks = Rehydrator::new(&schema.flatmap, &RawValues).rehydrate_layout("page", &rows);
        assert_eq!(blocks[0]["content"], json!({"title": "Hello"}));
        assert_eq!(blocks[0][picture], json!(42));
        assert!(blocks[0].get("image").is_none());
        assert_eq!(flatten_layout(&schema.flatmap, &blocks), rows);
    }

    #[test]
    fn test_nested_collection_parent_paths() {
        let schema = schema();
        let ids = Ids { index: &schema.flatmap };
        let section = ids.block(ids.layout(), "section");
        let collection = ids.field(section, FieldGroup::Content, "blocks");
        let inner_text = ids.block(collection, "text");
        let inner_title = ids.field(inner_text, FieldGroup::Content, "title");

        let rows = vec![
            json!({ VARIANT_TAG: "image" }),
            json!({
                VARIANT_TAG: "section",
                collection: [
                    { VARIANT_TAG: "image" },
                    { VARIANT_TAG: "text", inner_title: "Inner" }
                ]
            }),
        ];
        let blocks = Rehydrator::new(&schema.flatmap, &RawValues).rehydrate_layout("page", &rows);
        let nested = blocks[1]["content"]["blocks"].as_array().unwrap();
        assert_eq!(nested.len(), 2);

        let meta = BlockMeta::from_data(&nested[1]).unwrap();
        assert_eq!(meta.block, "text");
        assert_eq!(meta.index, 1);
        assert_eq!(meta.parent, "page/1:section/blocks");
        assert_eq!(meta.key, inner_text);
        assert_eq!(nested[1]["content"]["title"], json!("Inner"));
    }

    #[test]
    fn test_unknown_variant_passes_through() {
        let schema = schema();
        let rows = vec![json!({ VARIANT_TAG: "ghost", "x": 1 }), json!("scalar")];
        let blocks = Rehydrator::new(&schema.flatmap, &RawValues).rehydrate_layout("page", &rows);
        assert_eq!(blocks, rows);

        let unknown_layout =
            Rehydrator::new(&schema.flatmap, &RawValues).rehydrate_layout("nope", &rows);
        assert_eq!(unknown_layout, rows);
    }

    #[test]
    fn test_resolver_expands_references() {
        struct Media;
        impl ValueResolver for Media {
            fn attachment(&self, reference: &Value) -> Option<Value> {
                Some(json!({ "id": reference, "url": format!("/media/{reference}.jpg") }))
            }
        }

        assert_eq!(
            normalise(FieldKind::Image, &json!(7), &Media),
            json!({"id": 7, "url": "/media/7.jpg"})
        );
        assert_eq!(normalise(FieldKind::Image, &json!(""), &Media), json!(""));
        assert_eq!(
            normalise(FieldKind::Gallery, &json!([1]), &Media),
            json!([{"id": 1, "url": "/media/1.jpg"}])
        );
        assert_eq!(normalise(FieldKind::PostObject, &json!(9), &Media), json!(9));
    }

    #[test]
    fn test_value_normalisation() {
        assert_eq!(normalise(FieldKind::TrueFalse, &json!("0"), &RawValues), json!(false));
        assert_eq!(normalise(FieldKind::TrueFalse, &json!(1), &RawValues), json!(true));
        assert_eq!(normalise(FieldKind::TrueFalse, &Value::Null, &RawValues), json!(false));
        assert_eq!(normalise(FieldKind::Number, &json!("42"), &RawValues), json!(42));
        assert_eq!(normalise(FieldKind::Number, &json!(""), &RawValues), Value::Null);
        assert_eq!(normalise(FieldKind::Number, &json!("n/a"), &RawValues), json!("n/a"));
        assert_eq!(normalise(FieldKind::Text, &json!("1"), &RawValues), json!("1"));
    }

    #[test]
    fn test_round_trip() {
        let schema = schema();
        let ids = Ids { index: &schema.flatmap };
        let layout = ids.layout();
        let text = ids.block(layout, "text");
        let links = ids.field(text, FieldGroup::Content, "links");
        let label = ids.field(links, FieldGroup::Content, "label");
        let meta_id = ids.field(text, FieldGroup::Content, "meta");
        let weight = ids.field(meta_id, FieldGroup::Content, "weight");
        let section = ids.block(layout, "section");
        let collection = ids.field(section, FieldGroup::Content, "blocks");
        let inner_text = ids.block(collection, "text");
        let title = ids.field(text, FieldGroup::Content, "title");
        let highlight = ids.field(text, FieldGroup::Content, "highlight");
        let bg = ids.field(text, FieldGroup::Customise, "bg_color");
        let element_id = ids.field(text, FieldGroup::Configure, "element_id");
        let inner_highlight = ids.field(inner_text, FieldGroup::Content, "highlight");

        let rows = vec![
            json!({
                VARIANT_TAG: "text",
                title: "Hello",
                highlight: 1,
                links: [{ label: "Docs" }],
                meta_id: { weight: 3 },
                bg: "#000",
                element_id: "intro",
                "unmanaged": "left alone"
            }),
            json!({
                VARIANT_TAG: "section",
                collection: [
                    { VARIANT_TAG: "text", inner_highlight: 0 }
                ]
            }),
        ];

        let blocks = Rehydrator::new(&schema.flatmap, &RawValues).rehydrate_layout("page", &rows);
        assert_eq!(flatten_layout(&schema.flatmap, &blocks), rows);
    }

    #[test]
    fn test_round_trip_keeps_variant_id_tags() {
        let schema = schema();
        let ids = Ids { index: &schema.flatmap };
        let layout = ids.layout();
        let section = ids.block(layout, "section");
        let collection = ids.field(section, FieldGroup::Content, "blocks");
        let inner_text = ids.block(collection, "text");
        let inner_title = ids.field(inner_text, FieldGroup::Content, "title");

        let rows = vec![json!({
            VARIANT_TAG: section,
            collection: [
                { VARIANT_TAG: inner_text, inner_title: "Hi" },
                { VARIANT_TAG: "image" }
            ]
        })];
        let blocks = Rehydrator::new(&schema.flatmap, &RawValues).rehydrate_layout("page", &rows);
        let nested = blocks[0]["content"]["blocks"].as_array().unwrap();
        let meta = BlockMeta::from_data(&nested[0]).unwrap();
        assert_eq!(meta.block, "text");
        assert_eq!(meta.tag, inner_text);

        assert_eq!(flatten_layout(&schema.flatmap, &blocks), rows);
    }

    #[test]
    fn test_round_trip_keeps_string_storage() {
        let schema = schema();
        let ids = Ids { index: &schema.flatmap };
        let text = ids.block(ids.layout(), "text");
        let highlight = ids.field(text, FieldGroup::Content, "highlight");
        let meta_id = ids.field(text, FieldGroup::Content, "meta");
        let weight = ids.field(meta_id, FieldGroup::Content, "weight");

        let rows = vec![
            json!({ VARIANT_TAG: "text", highlight: "1", meta_id: { weight: "42" } }),
            json!({ VARIANT_TAG: "text", highlight: "0", meta_id: { weight: "" } }),
        ];
        let mut blocks =
            Rehydrator::new(&schema.flatmap, &RawValues).rehydrate_layout("page", &rows);
        assert_eq!(blocks[0]["content"]["highlight"], json!(true));
        assert_eq!(blocks[0]["content"]["meta"]["weight"], json!(42));
        assert_eq!(flatten_layout(&schema.flatmap, &blocks), rows);

        blocks[0]["content"]["highlight"] = json!(false);
        blocks[0]["content"]["meta"]["weight"] = json!(7);
        let edited = flatten_layout(&schema.flatmap, &blocks);
        assert_eq!(
            edited[0],
            json!({ VARIANT_TAG: "text", highlight: 0, meta_id: { weight: 7 } })
        );
        assert_eq!(edited[1], rows[1]);
    }

    #[test]
    fn test_resolved_references_flatten_to_stored_ids() {
        struct Media;
        impl ValueResolver for Media {
            fn attachment(&self, reference: &Value) -> Option<Value> {
                Some(json!({ "id": reference }))
            }
        }

        let schema = schema();
        let ids = Ids { index: &schema.flatmap };
        let image = ids.block(ids.layout(), "image");
        let picture = ids.field(image, FieldGroup::Content, "image");

        let rows = vec![json!({ VARIANT_TAG: "image", picture: 42 })];
        let blocks = Rehydrator::new(&schema.flatmap, &Media).rehydrate_layout("page", &rows);
        assert_eq!(blocks[0]["content"]["image"], json!({"id": 42}));
        assert_eq!(flatten_layout(&schema.flatmap, &blocks), rows);
    }

    #[test]
    fn test_select_layout_reads_builder_controls() {
        let schema = schema();
        let index = &schema.flatmap;
        let enabled = index.control_key("enabled").unwrap();
        let select = index.control_key("layout").unwrap();
        let page = index.layout_key("page").unwrap();
        let rows = json!([{ VARIANT_TAG: "image" }]);

        let off = object(json!({ enabled: "0", select: "builder_page", page: rows }));
        assert_eq!(select_layout(index, &off).unwrap(), None);
        assert_eq!(select_layout(index, &Map::new()).unwrap(), None);

        let on = object(json!({ enabled: "1", select: "builder_page", page: rows }));
        let item = select_layout(index, &on).unwrap().unwrap();
        assert_eq!(item.layout, "page");
        assert_eq!(Value::Array(item.rows), rows);

        let defaulted = object(json!({ enabled: true }));
        let item = select_layout(index, &defaulted).unwrap().unwrap();
        assert_eq!(item.layout, "page");
        assert!(item.rows.is_empty());

        let unknown = object(json!({ enabled: 1, select: "builder_post" }));
        assert!(matches!(
            select_layout(index, &unknown),
            Err(BlockPressError::UnknownEntity { .. })
        ));
    }
}
