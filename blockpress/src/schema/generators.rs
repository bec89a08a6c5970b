use super::types::{FieldDeclaration, GeneratorRef};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Produces field declarations from a reference's arguments.
pub type GeneratorFn = Box<dyn Fn(&[Value]) -> Vec<FieldDeclaration> + Send + Sync>;

/// Named field presets. References are resolved once, when the registry is built.
pub struct GeneratorRegistry {
    generators: BTreeMap<String, GeneratorFn>,
}

impl GeneratorRegistry {
    /// A registry with no generators at all.
    pub fn empty() -> Self {
        GeneratorRegistry {
            generators: BTreeMap::new(),
        }
    }

    /// A registry with the built-in background presets.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("bg_color", |args| vec![bg_color(args)]);
        registry.register("bg_image", |args| vec![bg_image(args)]);
        registry.register("bg_repeat", |args| vec![bg_repeat(args)]);
        registry.register("bg_size", |args| vec![bg_size(args)]);
        registry.register("bg_position", |args| vec![bg_position(args)]);
        registry.register("background", |_| {
            vec![
                bg_color(&[]),
                bg_image(&[]),
                bg_repeat(&[]),
                bg_size(&[]),
                bg_position(&[]),
            ]
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, generator: F)
    where
        F: Fn(&[Value]) -> Vec<FieldDeclaration> + Send + Sync + 'static,
    {
        self.generators.insert(name.to_string(), Box::new(generator));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.generators.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.generators.keys().map(|k| k.as_str())
    }

    /// Resolve a reference, or `None` when no generator has that name.
    pub fn resolve(&self, reference: &GeneratorRef) -> Option<Vec<FieldDeclaration>> {
        self.generators
            .get(&reference.generate)
            .map(|generate| generate(&reference.args))
    }
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.generators.keys()).finish()
    }
}

// ── Built-in presets ─────────────────────────────────────────────────

/// arg 0 overrides the name, arg 1 the label
fn preset(args: &[Value], name: &str, label: &str, field_type: &str) -> FieldDeclaration {
    let name = args.first().and_then(Value::as_str).unwrap_or(name);
    let label = args.get(1).and_then(Value::as_str).unwrap_or(label);
    FieldDeclaration::new(name, label, field_type)
}

fn choices(pairs: &[(&str, &str)]) -> Value {
    let map: serde_json::Map<String, Value> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect();
    Value::Object(map)
}

fn bg_color(args: &[Value]) -> FieldDeclaration {
    preset(args, "bg_color", "Background Color", "color_picker")
}

fn bg_image(args: &[Value]) -> FieldDeclaration {
    preset(args, "bg_image", "Background Image", "image")
        .with_option("return_format", json!("array"))
        .with_option("preview_size", json!("thumbnail"))
}

fn bg_repeat(args: &[Value]) -> FieldDeclaration {
    preset(args, "bg_repeat", "Background Repeat", "select")
        .with_option(
            "choices",
            choices(&[
                ("no-repeat", "No Repeat"),
                ("repeat-x", "Repeat Horizontally"),
                ("repeat-y", "Repeat Vertically"),
                ("repeat", "Repeat"),
            ]),
        )
        .with_default(json!("no-repeat"))
}

fn bg_size(args: &[Value]) -> FieldDeclaration {
    preset(args, "bg_size", "Background Size", "select")
        .with_option(
            "choices",
            choices(&[("none", "None"), ("cover", "Cover"), ("contain", "Contain")]),
        )
        .with_default(json!("cover"))
}

fn bg_position(args: &[Value]) -> FieldDeclaration {
    preset(args, "bg_position", "Background Position", "select")
        .with_option(
            "choices",
            choices(&[
                ("tl", "Top Left"),
                ("t", "Top"),
                ("tr", "Top Right"),
                ("l", "Left"),
                ("center", "Center"),
                ("bl", "Bottom Left"),
                ("b", "Bottom"),
                ("br", "Bottom Right"),
            ]),
        )
        .with_default(json!("center"))
}
