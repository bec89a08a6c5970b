use crate::schema::FieldDeclaration;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Field kinds understood by the custom-fields storage layer. The type strings
/// are part of its schema format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Textarea,
    Number,
    Range,
    Email,
    Url,
    Password,
    Wysiwyg,
    Oembed,
    Image,
    File,
    Gallery,
    Link,
    PostObject,
    PageLink,
    Relationship,
    Taxonomy,
    User,
    Select,
    Checkbox,
    RadioButton,
    TrueFalse,
    GoogleMap,
    DatePicker,
    DateTimePicker,
    TimePicker,
    ColorPicker,
    Message,
    Tab,
    Group,
    Repeater,
    FlexibleContent,
    Clone,
}

impl FieldKind {
    pub const ALL: [FieldKind; 33] = [
        FieldKind::Text,
        FieldKind::Textarea,
        FieldKind::Number,
        FieldKind::Range,
        FieldKind::Email,
        FieldKind::Url,
        FieldKind::Password,
        FieldKind::Wysiwyg,
        FieldKind::Oembed,
        FieldKind::Image,
        FieldKind::File,
        FieldKind::Gallery,
        FieldKind::Link,
        FieldKind::PostObject,
        FieldKind::PageLink,
        FieldKind::Relationship,
        FieldKind::Taxonomy,
        FieldKind::User,
        FieldKind::Select,
        FieldKind::Checkbox,
        FieldKind::RadioButton,
        FieldKind::TrueFalse,
        FieldKind::GoogleMap,
        FieldKind::DatePicker,
        FieldKind::DateTimePicker,
        FieldKind::TimePicker,
        FieldKind::ColorPicker,
        FieldKind::Message,
        FieldKind::Tab,
        FieldKind::Group,
        FieldKind::Repeater,
        FieldKind::FlexibleContent,
        FieldKind::Clone,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Textarea => "textarea",
            FieldKind::Number => "number",
            FieldKind::Range => "range",
            FieldKind::Email => "email",
            FieldKind::Url => "url",
            FieldKind::Password => "password",
            FieldKind::Wysiwyg => "wysiwyg",
            FieldKind::Oembed => "oembed",
            FieldKind::Image => "image",
            FieldKind::File => "file",
            FieldKind::Gallery => "gallery",
            FieldKind::Link => "link",
            FieldKind::PostObject => "post_object",
            FieldKind::PageLink => "page_link",
            FieldKind::Relationship => "relationship",
            FieldKind::Taxonomy => "taxonomy",
            FieldKind::User => "user",
            FieldKind::Select => "select",
            FieldKind::Checkbox => "checkbox",
            FieldKind::RadioButton => "radio_button",
            FieldKind::TrueFalse => "true_false",
            FieldKind::GoogleMap => "google_map",
            FieldKind::DatePicker => "date_picker",
            FieldKind::DateTimePicker => "date_time_picker",
            FieldKind::TimePicker => "time_picker",
            FieldKind::ColorPicker => "color_picker",
            FieldKind::Message => "message",
            FieldKind::Tab => "tab",
            FieldKind::Group => "group",
            FieldKind::Repeater => "repeater",
            FieldKind::FlexibleContent => "flexible_content",
            FieldKind::Clone => "clone",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Holds a list of block variants.
    pub fn is_block_collection(self) -> bool {
        self == FieldKind::FlexibleContent
    }

    /// Holds a row template in `sub_fields`.
    pub fn has_sub_fields(self) -> bool {
        matches!(self, FieldKind::Group | FieldKind::Repeater)
    }

    /// Option keys every field of this kind carries, before declared overrides.
    pub fn default_options(self) -> Map<String, Value> {
        let defaults = match self {
            FieldKind::Text => json!({
                "default_value": "", "placeholder": "", "prepend": "", "append": "", "maxlength": ""
            }),
            FieldKind::Textarea => json!({
                "default_value": "", "placeholder": "", "maxlength": "", "rows": "", "new_lines": ""
            }),
            FieldKind::Number => json!({
                "default_value": "", "placeholder": "", "prepend": "", "append": "",
                "min": "", "max": "", "step": ""
            }),
            FieldKind::Range => json!({
                "default_value": "", "min": "", "max": "", "step": "", "prepend": "", "append": ""
            }),
            FieldKind::Email => json!({
                "default_value": "", "placeholder": "", "prepend": "", "append": ""
            }),
            FieldKind::Url => json!({ "default_value": "", "placeholder": "" }),
            FieldKind::Password => json!({ "placeholder": "", "prepend": "", "append": "" }),
            FieldKind::Wysiwyg => json!({
                "default_value": "", "tabs": "all", "toolbar": "full", "media_upload": 1, "delay": 0
            }),
            FieldKind::Oembed => json!({ "width": "", "height": "" }),
            FieldKind::Image => json!({
                "return_format": "array", "preview_size": "thumbnail", "library": "all",
                "min_width": "", "min_height": "", "min_size": "",
                "max_width": "", "max_height": "", "max_size": "", "mime_types": ""
            }),
            FieldKind::File => json!({
                "return_format": "array", "library": "all",
                "min_size": "", "max_size": "", "mime_types": ""
            }),
            FieldKind::Gallery => json!({
                "min": "", "max": "", "insert": "append", "library": "all",
                "min_width": "", "min_height": "", "min_size": "",
                "max_width": "", "max_height": "", "max_size": "", "mime_types": ""
            }),
            FieldKind::Link => json!({ "return_format": "array" }),
            FieldKind::PostObject => json!({
                "post_type": [], "taxonomy": [], "allow_null": 0, "multiple": 0,
                "return_format": "object", "ui": 1
            }),
            FieldKind::PageLink => json!({
                "post_type": [], "taxonomy": [], "allow_null": 0, "allow_archives": 1, "multiple": 0
            }),
            FieldKind::Relationship => json!({
                "post_type": [], "taxonomy": [], "filters": ["search", "post_type", "taxonomy"],
                "elements": "", "min": "", "max": "", "return_format": "object"
            }),
            FieldKind::Taxonomy => json!({
                "taxonomy": "category", "field_type": "checkbox", "allow_null": 0,
                "add_term": 1, "save_terms": 0, "load_terms": 0, "return_format": "id", "multiple": 0
            }),
            FieldKind::User => json!({ "role": "", "allow_null": 0, "multiple": 0 }),
            FieldKind::Select => json!({
                "choices": {}, "default_value": [], "allow_null": 0, "multiple": 0,
                "ui": 0, "ajax": 0, "return_format": "value", "placeholder": ""
            }),
            FieldKind::Checkbox => json!({
                "choices": {}, "default_value": [], "allow_custom": 0, "save_custom": 0,
                "layout": "vertical", "toggle": 0, "return_format": "value"
            }),
            FieldKind::RadioButton => json!({
                "choices": {}, "allow_null": 0, "other_choice": 0, "save_other_choice": 0,
                "default_value": "", "layout": "vertical", "return_format": "value"
            }),
            FieldKind::TrueFalse => json!({
                "message": "", "default_value": 0, "ui": 0, "ui_on_text": "", "ui_off_text": ""
            }),
            FieldKind::GoogleMap => json!({
                "center_lat": "", "center_lng": "", "zoom": "", "height": ""
            }),
            FieldKind::DatePicker => json!({
                "display_format": "d/m/Y", "return_format": "d/m/Y", "first_day": 1
            }),
            FieldKind::DateTimePicker => json!({
                "display_format": "d/m/Y g:i a", "return_format": "d/m/Y g:i a", "first_day": 1
            }),
            FieldKind::TimePicker => json!({ "display_format": "g:i a", "return_format": "g:i a" }),
            FieldKind::ColorPicker => json!({ "default_value": "" }),
            FieldKind::Message => json!({ "message": "", "new_lines": "wpautop", "esc_html": 0 }),
            FieldKind::Tab => json!({ "placement": "top", "endpoint": 0 }),
            FieldKind::Group => json!({ "layout": "block" }),
            FieldKind::Repeater => json!({
                "collapsed": "", "min": 0, "max": 0, "layout": "block", "button_label": "Add Item"
            }),
            FieldKind::FlexibleContent => json!({
                "button_label": "Add Block", "min": "", "max": ""
            }),
            FieldKind::Clone => json!({
                "clone": [], "display": "seamless", "layout": "block",
                "prefix_label": 0, "prefix_name": 0
            }),
        };
        match defaults {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldKind::parse(s).ok_or_else(|| format!("unknown field type '{s}'"))
    }
}

/// Keys owned by the compiler; declared options may not override them.
const RESERVED_KEYS: &[&str] = &[
    "key",
    "label",
    "name",
    "type",
    "instructions",
    "required",
    "conditional_logic",
    "sub_fields",
    "layouts",
];

// ── Conditional logic ────────────────────────────────────────────────

/// A single `{field, operator, value}` test against a sibling's compiled id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionRule {
    pub field: String,
    pub operator: String,
    pub value: String,
}

impl ConditionRule {
    pub fn equals(field: &str, value: &str) -> Self {
        ConditionRule {
            field: field.to_string(),
            operator: "==".into(),
            value: value.to_string(),
        }
    }
}

/// OR of AND clauses. Serialises as `0` when there are none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawLogic", into = "RawLogic")]
pub struct ConditionalLogic {
    clauses: Vec<Vec<ConditionRule>>,
}

impl ConditionalLogic {
    pub fn new(clauses: Vec<Vec<ConditionRule>>) -> Self {
        ConditionalLogic {
            clauses: clauses.into_iter().filter(|c| !c.is_empty()).collect(),
        }
    }

    /// Visible when `field` equals `value`.
    pub fn when(field: &str, value: &str) -> Self {
        ConditionalLogic::new(vec![vec![ConditionRule::equals(field, value)]])
    }

    /// Add a rule to every clause.
    pub fn and(mut self, field: &str, value: &str) -> Self {
        let rule = ConditionRule::equals(field, value);
        if self.clauses.is_empty() {
            self.clauses.push(vec![rule]);
        } else {
            for clause in &mut self.clauses {
                clause.push(rule.clone());
            }
        }
        self
    }

    pub fn clauses(&self) -> &[Vec<ConditionRule>] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawLogic {
    Rules(Vec<Vec<ConditionRule>>),
    Off(Value),
}

impl From<RawLogic> for ConditionalLogic {
    fn from(raw: RawLogic) -> Self {
        match raw {
            RawLogic::Rules(clauses) => ConditionalLogic::new(clauses),
            RawLogic::Off(_) => ConditionalLogic::default(),
        }
    }
}

impl From<ConditionalLogic> for RawLogic {
    fn from(logic: ConditionalLogic) -> Self {
        if logic.clauses.is_empty() {
            RawLogic::Off(json!(0))
        } else {
            RawLogic::Rules(logic.clauses)
        }
    }
}

// ── Compiled nodes ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wrapper {
    #[serde(default)]
    pub width: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub id: String,
}

/// One compiled field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldNode {
    pub key: String,
    pub label: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub required: u8,
    #[serde(default)]
    pub conditional_logic: ConditionalLogic,
    #[serde(default)]
    pub wrapper: Wrapper,
    #[serde(flatten)]
    pub options: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_fields: Vec<FieldNode>,
    /// Block variants keyed by their own compiled id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub layouts: BTreeMap<String, BlockNode>,
}

impl FieldNode {
    pub fn new(kind: FieldKind, key: &str, name: &str, label: &str) -> Self {
        FieldNode {
            key: key.to_string(),
            label: label.to_string(),
            name: name.to_string(),
            kind,
            instructions: String::new(),
            required: 0,
            conditional_logic: ConditionalLogic::default(),
            wrapper: Wrapper::default(),
            options: kind.default_options(),
            sub_fields: Vec::new(),
            layouts: BTreeMap::new(),
        }
    }

    /// Build a node from a declaration: kind defaults first, then declared options.
    pub fn from_declaration(kind: FieldKind, key: &str, decl: &FieldDeclaration) -> Self {
        let mut node = FieldNode::new(kind, key, decl.name(), decl.label());
        node.instructions = decl.instructions.clone().unwrap_or_default();
        node.required = u8::from(decl.required);

        for (option, value) in &decl.options {
            if option == "wrapper" {
                match serde_json::from_value::<Wrapper>(value.clone()) {
                    Ok(wrapper) => node.wrapper = wrapper,
                    Err(e) => log::warn!("Ignoring bad wrapper on field '{}': {e}", decl.name()),
                }
            } else if RESERVED_KEYS.contains(&option.as_str()) {
                log::warn!("Ignoring reserved option '{option}' on field '{}'", decl.name());
            } else {
                node.options.insert(option.clone(), value.clone());
            }
        }
        if let Some(default) = &decl.default_value {
            node.options.insert("default_value".into(), default.clone());
        }
        node
    }

    pub fn with_option(mut self, option: &str, value: Value) -> Self {
        self.options.insert(option.to_string(), value);
        self
    }

    pub fn option_str(&self, option: &str) -> Option<&str> {
        self.options.get(option).and_then(Value::as_str)
    }
}

/// One block variant inside a flexible_content field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockNode {
    pub key: String,
    pub name: String,
    pub label: String,
    pub display: String,
    pub sub_fields: Vec<FieldNode>,
    #[serde(default)]
    pub min: String,
    #[serde(default)]
    pub max: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRule {
    pub param: String,
    pub operator: String,
    pub value: String,
}

/// The compiled root: a field group attached to content items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldGroupNode {
    pub key: String,
    pub title: String,
    pub description: String,
    pub fields: Vec<FieldNode>,
    pub location: Vec<Vec<LocationRule>>,
    pub menu_order: i32,
    pub position: String,
    pub style: String,
    pub label_placement: String,
    pub instruction_placement: String,
    pub hide_on_screen: String,
    pub active: u8,
}

impl FieldGroupNode {
    pub fn new(key: &str, title: &str, description: &str, post_types: &[String]) -> Self {
        let location = post_types
            .iter()
            .map(|post_type| {
                vec![LocationRule {
                    param: "post_type".into(),
                    operator: "==".into(),
                    value: post_type.clone(),
                }]
            })
            .collect();
        FieldGroupNode {
            key: key.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            fields: Vec::new(),
            location,
            menu_order: 0,
            position: "acf_after_title".into(),
            style: "seamless".into(),
            label_placement: "top".into(),
            instruction_placement: "label".into(),
            hide_on_screen: String::new(),
            active: 1,
        }
    }
}
