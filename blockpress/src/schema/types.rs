use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level definition file parsed from blockpress.yaml (or an included file)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefinitionFile {
    #[serde(default)]
    pub settings: Settings,
    /// Glob patterns of further definition files, relative to the data directory
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub blocks: BTreeMap<String, BlockDefinition>,
    #[serde(default)]
    pub layouts: BTreeMap<String, LayoutDefinition>,
}

/// Builder-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_builder_name")]
    pub name: String,
    #[serde(default = "default_builder_label")]
    pub label: String,
    #[serde(default)]
    pub description: String,
    /// Content-item types the compiled field group is attached to
    #[serde(default = "default_post_types")]
    pub post_types: Vec<String>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    /// Wrap cache hits in an HTML comment naming the cache key
    #[serde(default = "default_true")]
    pub cache_markers: bool,
    /// Name of the request flag that asks for a cache bust
    #[serde(default = "default_bust_param")]
    pub bust_param: String,
    /// Merge element id/class fields into every block's configure group
    #[serde(default = "default_true")]
    pub core_fields: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            name: default_builder_name(),
            label: default_builder_label(),
            description: String::new(),
            post_types: default_post_types(),
            use_cache: true,
            cache_markers: true,
            bust_param: default_bust_param(),
            core_fields: true,
        }
    }
}

fn default_builder_name() -> String {
    "builder".into()
}

fn default_builder_label() -> String {
    "BlockPress".into()
}

fn default_post_types() -> Vec<String> {
    vec!["post".into(), "page".into()]
}

fn default_bust_param() -> String {
    "bust_cache".into()
}

fn default_true() -> bool {
    true
}

fn default_display() -> String {
    "block".into()
}

fn default_button_label() -> String {
    "Add Block".into()
}

/// Definition of a single block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockDefinition {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: BlockKind,
    #[serde(default = "default_display")]
    pub display: String,
    #[serde(default)]
    pub content: Vec<FieldSlot>,
    #[serde(default)]
    pub customise: Vec<FieldSlot>,
    #[serde(default)]
    pub configure: Vec<FieldSlot>,
    /// Blocks that may be nested inside this block's collection fields
    #[serde(default)]
    pub blocks: NameFilter,
    #[serde(default)]
    pub rules: CompatibilityRules,
}

/// Shape of a block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    #[default]
    Basic,
    /// Owns a single nested-block collection
    Container,
    /// Owns a repeater whose rows each host a nested-block collection
    Repeating,
}

/// Definition of a single layout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutDefinition {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub blocks: NameFilter,
    #[serde(default = "default_button_label")]
    pub button_label: String,
}

/// Which parents may contain an entity.
///
/// Without `rules` every parent is allowed. Once `rules` is declared, a
/// parent type it does not mention is not allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawCompatibilityRules")]
pub struct CompatibilityRules {
    pub block: NameFilter,
    pub layout: NameFilter,
}

#[derive(Debug, Clone, Deserialize)]
struct RawCompatibilityRules {
    #[serde(default)]
    block: Option<NameFilter>,
    #[serde(default)]
    layout: Option<NameFilter>,
}

impl From<RawCompatibilityRules> for CompatibilityRules {
    fn from(raw: RawCompatibilityRules) -> Self {
        CompatibilityRules {
            block: raw.block.unwrap_or(NameFilter::none()),
            layout: raw.layout.unwrap_or(NameFilter::none()),
        }
    }
}

/// A filter over entity names: `"*"`, `"none"`, `name`, `[a, b]` or `{ except: [a, b] }`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawNameFilter", into = "RawNameFilter")]
pub enum NameFilter {
    #[default]
    Any,
    Only(Vec<String>),
    Except(Vec<String>),
}

impl NameFilter {
    /// Matches no name.
    pub fn none() -> Self {
        NameFilter::Only(Vec::new())
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            NameFilter::Any => true,
            NameFilter::Only(names) => names.iter().any(|n| n == name),
            NameFilter::Except(names) => !names.iter().any(|n| n == name),
        }
    }

    /// Names referenced explicitly by the filter
    pub fn named(&self) -> &[String] {
        match self {
            NameFilter::Any => &[],
            NameFilter::Only(names) | NameFilter::Except(names) => names,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawNameFilter {
    One(String),
    Many(Vec<String>),
    Except { except: Vec<String> },
}

impl From<RawNameFilter> for NameFilter {
    fn from(raw: RawNameFilter) -> Self {
        match raw {
            RawNameFilter::One(s) if s == "*" || s == "any" => NameFilter::Any,
            RawNameFilter::One(s) if s == "none" => NameFilter::none(),
            RawNameFilter::One(s) => NameFilter::Only(vec![s]),
            RawNameFilter::Many(names) => NameFilter::Only(names),
            RawNameFilter::Except { except } => NameFilter::Except(except),
        }
    }
}

impl From<NameFilter> for RawNameFilter {
    fn from(filter: NameFilter) -> Self {
        match filter {
            NameFilter::Any => RawNameFilter::One("*".into()),
            NameFilter::Only(names) => RawNameFilter::Many(names),
            NameFilter::Except(except) => RawNameFilter::Except { except },
        }
    }
}

/// One slot in a field group: either a literal declaration or a generator reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSlot {
    Generated(GeneratorRef),
    Literal(FieldDeclaration),
}

/// A deferred field declaration, resolved by name before compilation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratorRef {
    pub generate: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

/// Definition of a single field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDeclaration {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default_value: Option<serde_json::Value>,
    /// Visibility rule over sibling fields, by sibling name
    #[serde(default)]
    pub conditional: Option<ConditionSpec>,
    /// Row template for group and repeater fields
    #[serde(default)]
    pub sub_fields: Vec<FieldSlot>,
    /// Blocks offered by a flexible_content field (defaults to the owning entity's)
    #[serde(default)]
    pub blocks: Option<NameFilter>,
    /// Type-specific options passed through to the compiled field
    #[serde(flatten)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl FieldDeclaration {
    pub fn new(name: &str, label: &str, field_type: &str) -> Self {
        FieldDeclaration {
            name: Some(name.to_string()),
            label: Some(label.to_string()),
            field_type: field_type.to_string(),
            instructions: None,
            required: false,
            default_value: None,
            conditional: None,
            sub_fields: Vec::new(),
            blocks: None,
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: serde_json::Value) -> Self {
        self.options.insert(key.to_string(), value);
        self
    }

    pub fn with_instructions(mut self, instructions: &str) -> Self {
        self.instructions = Some(instructions.to_string());
        self
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_sub_field(mut self, field: FieldDeclaration) -> Self {
        self.sub_fields.push(FieldSlot::Literal(field));
        self
    }

    /// The declared name; empty until the registry has resolved it.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or_else(|| self.name())
    }

    /// Literal sub-field declarations (generator references are resolved by the registry)
    pub fn literal_sub_fields(&self) -> impl Iterator<Item = &FieldDeclaration> {
        self.sub_fields.iter().filter_map(|slot| match slot {
            FieldSlot::Literal(decl) => Some(decl),
            FieldSlot::Generated(_) => None,
        })
    }
}

/// Conditional-visibility rule as written in a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionSpec {
    /// Visible when one sibling matches
    Rule(ConditionRuleSpec),
    /// Full OR-of-AND form
    AnyOf(Vec<Vec<ConditionRuleSpec>>),
}

impl ConditionSpec {
    /// Normalise into OR-of-AND clauses
    pub fn clauses(&self) -> Vec<Vec<ConditionRuleSpec>> {
        match self {
            ConditionSpec::Rule(rule) => vec![vec![rule.clone()]],
            ConditionSpec::AnyOf(clauses) => clauses.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionRuleSpec {
    /// Sibling field name
    pub field: String,
    #[serde(default = "default_operator")]
    pub operator: String,
    pub value: serde_json::Value,
}

fn default_operator() -> String {
    "==".into()
}
