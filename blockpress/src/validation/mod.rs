use crate::compiler::{compile, core_configure_fields, tab_name, FieldKind};
use crate::error::{BlockPressError, Result};
use crate::registry::{Entity, FieldGroup, Registry};
use crate::schema::{DefinitionFile, FieldDeclaration, FieldSlot, GeneratorRegistry, NameFilter};
use serde::Serialize;
use std::collections::HashSet;

/// Result of validating a set of definitions
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Turn collected errors into a single `Validation` error.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(BlockPressError::Validation(self.errors.join("; ")))
        }
    }
}

/// Comparison operators the storage layer evaluates.
const SUPPORTED_OPERATORS: &[&str] = &[
    "==", "!=", "==empty", "!=empty", "==pattern", "==contains", "<", ">",
];

/// Containers that may nest one another, past which a warning is raised.
/// Each one is compiled again under every other at each nesting level.
const OPEN_CONTAINER_LIMIT: usize = 3;

/// Lint definitions without publishing anything.
///
/// Reports every problem found instead of stopping at the first one. When the
/// lints find no errors, a full compilation is attempted so that anything the
/// compiler rejects is reported too.
pub fn validate_definitions(
    definitions: &DefinitionFile,
    generators: &GeneratorRegistry,
) -> ValidationResult {
    let mut result = ValidationResult::default();

    for (block, def) in &definitions.blocks {
        for slots in [&def.content, &def.customise, &def.configure] {
            check_generators(block, slots, generators, &mut result);
        }
    }

    let registry = match Registry::build(definitions.clone(), generators) {
        Ok(registry) => registry,
        Err(e) => {
            result.errors.push(e.to_string());
            return result;
        }
    };

    for block in registry.blocks() {
        check_block(&registry, block, &mut result);
    }
    for layout in registry.layouts() {
        check_children(&registry, layout, &mut result);
        let compatible = registry
            .candidates(&layout.children)
            .iter()
            .any(|b| b.is_compatible_with(layout));
        if !compatible {
            result
                .warnings
                .push(format!("Layout '{}' accepts no blocks", layout.name));
        }
    }

    check_open_containers(&registry, &mut result);

    if result.is_ok() {
        if let Err(e) = compile(&registry) {
            result.errors.push(e.to_string());
        }
    }
    result
}

/// Validate and fail on the first set of errors; warnings are logged.
pub fn validate_strict(definitions: &DefinitionFile, generators: &GeneratorRegistry) -> Result<()> {
    let warnings = validate_definitions(definitions, generators).into_result()?;
    for warning in warnings {
        log::warn!("{warning}");
    }
    Ok(())
}

fn check_generators(
    block: &str,
    slots: &[FieldSlot],
    generators: &GeneratorRegistry,
    result: &mut ValidationResult,
) {
    for slot in slots {
        match slot {
            FieldSlot::Generated(reference) if !generators.contains(&reference.generate) => {
                result.warnings.push(format!(
                    "Block '{block}' uses unknown field generator '{}'",
                    reference.generate
                ));
            }
            FieldSlot::Generated(_) => {}
            FieldSlot::Literal(decl) => check_generators(block, &decl.sub_fields, generators, result),
        }
    }
}

fn check_block(registry: &Registry, block: &Entity, result: &mut ValidationResult) {
    let core = core_configure_fields();
    for group in FieldGroup::ALL {
        let mut fields: Vec<&FieldDeclaration> = block.fields.get(group).iter().collect();
        if group == FieldGroup::Configure && registry.settings().core_fields {
            fields.extend(core.iter());
        }

        let mut seen = HashSet::new();
        if group != FieldGroup::Content {
            seen.insert(tab_name(group));
        }
        for decl in &fields {
            if !seen.insert(decl.name().to_string()) {
                result.errors.push(format!(
                    "Duplicate field name '{}' in block '{}' ({group})",
                    decl.name(),
                    block.name
                ));
            }
        }

        let names: HashSet<&str> = fields.iter().map(|d| d.name()).collect();
        for decl in &fields {
            check_field(block, decl, &names, result);
        }
    }

    if block.is_container() {
        check_children(registry, block, result);
        let compatible = registry
            .candidates(&block.children)
            .iter()
            .any(|b| b.name != block.name && b.is_compatible_with(block));
        if !compatible {
            result
                .warnings
                .push(format!("Container block '{}' accepts no nested blocks", block.name));
        }
    }
}

fn check_field(
    block: &Entity,
    decl: &FieldDeclaration,
    siblings: &HashSet<&str>,
    result: &mut ValidationResult,
) {
    let Some(kind) = FieldKind::parse(&decl.field_type) else {
        result.errors.push(format!(
            "Unknown field type '{}' for field '{}' in block '{}'",
            decl.field_type,
            decl.name(),
            block.name
        ));
        return;
    };

    if let Some(condition) = &decl.conditional {
        for rule in condition.clauses().into_iter().flatten() {
            if !siblings.contains(rule.field.as_str()) {
                result.warnings.push(format!(
                    "Field '{}' in block '{}' has a condition on '{}', which is not in the same group",
                    decl.name(),
                    block.name,
                    rule.field
                ));
            }
            if !SUPPORTED_OPERATORS.contains(&rule.operator.as_str()) {
                result.errors.push(format!(
                    "Field '{}' in block '{}' uses unsupported operator '{}'",
                    decl.name(),
                    block.name,
                    rule.operator
                ));
            }
        }
    }

    if decl.blocks.is_some() && !kind.is_block_collection() {
        result.warnings.push(format!(
            "Field '{}' in block '{}' lists blocks but is a {kind} field",
            decl.name(),
            block.name
        ));
    }

    if kind.has_sub_fields() {
        let subs: Vec<&FieldDeclaration> = decl.literal_sub_fields().collect();
        let mut seen = HashSet::new();
        for sub in &subs {
            if !seen.insert(sub.name()) {
                result.errors.push(format!(
                    "Duplicate sub field '{}' under '{}' in block '{}'",
                    sub.name(),
                    decl.name(),
                    block.name
                ));
            }
        }
        let names: HashSet<&str> = subs.iter().map(|d| d.name()).collect();
        for sub in subs {
            check_field(block, sub, &names, result);
        }
    }
}

/// Containers without an explicit child list that accept another container.
fn check_open_containers(registry: &Registry, result: &mut ValidationResult) {
    let open: Vec<&str> = registry
        .blocks()
        .filter(|block| block.is_container() && !matches!(block.children, NameFilter::Only(_)))
        .filter(|block| {
            registry
                .candidates(&block.children)
                .iter()
                .any(|child| child.name != block.name && child.is_container() && child.is_compatible_with(block))
        })
        .map(|block| block.name.as_str())
        .collect();
    if open.len() > OPEN_CONTAINER_LIMIT {
        result.warnings.push(format!(
            "{} container blocks accept other containers ({}); the compiled schema grows with every nesting level, list their blocks explicitly",
            open.len(),
            open.join(", ")
        ));
    }
}

fn check_children(registry: &Registry, parent: &Entity, result: &mut ValidationResult) {
    for name in parent.children.named() {
        if registry.block(name).is_none() {
            result.warnings.push(format!(
                "{} lists unknown block '{name}'",
                parent.entity_ref()
            ));
        }
    }
}
