use crate::compiler::{compile, CompiledSchema};
use crate::error::{BlockPressError, Result};
use crate::flatmap::FlatEntry;
use crate::registry::Registry;
use crate::rehydrate::{
    flatten_layout, select_layout, BlockMeta, RehydratedItem, Rehydrator, ValueResolver,
};
use crate::render_cache::{CacheKey, RenderCache, RenderPass, Rendered, TemplateRenderer};
use crate::schema::{load_definitions, DefinitionFile, GeneratorRegistry, Settings};
use crate::system_db::SystemDb;
use crate::validation::{self, ValidationResult};
use crate::watcher::DefinitionWatcher;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};

/// Definition file at the root of a data directory.
pub const CONFIG_FILE: &str = "blockpress.yaml";

/// System database inside a data directory.
pub const SYSTEM_DB_FILE: &str = "_system.db";

/// The main entry point for BlockPress.
///
/// Owns the definitions, the currently published compiled schema with its
/// flat index, the render cache and the system database. A compilation pass
/// either publishes a complete schema or leaves the previous one in place.
pub struct Builder {
    root: Option<PathBuf>,
    generators: GeneratorRegistry,
    definitions: RwLock<DefinitionFile>,
    published: RwLock<Option<Arc<CompiledSchema>>>,
    cache: RenderCache,
    db: Mutex<SystemDb>,
}

impl Builder {
    /// Open a BlockPress data directory.
    /// Parses blockpress.yaml (and its includes), opens/creates _system.db and
    /// runs the boot lifecycle.
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with_generators(path, GeneratorRegistry::with_builtins())
    }

    /// Open a data directory with a custom set of field generators.
    pub fn open_with_generators(path: &str, generators: GeneratorRegistry) -> Result<Self> {
        let root = PathBuf::from(path);
        if !root.exists() {
            return Err(BlockPressError::Other(format!(
                "Data directory does not exist: {}",
                root.display()
            )));
        }

        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(BlockPressError::Config(format!(
                "{CONFIG_FILE} not found in {}",
                root.display()
            )));
        }

        let definitions = load_definitions(&config_path)?;
        let db = SystemDb::open(&root.join(SYSTEM_DB_FILE))?;
        let builder = Builder::assemble(Some(root), definitions, generators, db);

        builder.boot()?;
        let loaded = builder.cache.load_from_db(&builder.db())?;
        if loaded > 0 {
            log::debug!("Loaded {loaded} persisted render cache entries");
        }

        Ok(builder)
    }

    /// Build from in-memory definitions with an in-memory system database.
    pub fn from_definitions(definitions: DefinitionFile, generators: GeneratorRegistry) -> Result<Self> {
        let db = SystemDb::open_in_memory()?;
        let builder = Builder::assemble(None, definitions, generators, db);
        builder.boot()?;
        Ok(builder)
    }

    fn assemble(
        root: Option<PathBuf>,
        definitions: DefinitionFile,
        generators: GeneratorRegistry,
        db: SystemDb,
    ) -> Self {
        let cache = RenderCache::from_settings(&definitions.settings);
        Builder {
            root,
            generators,
            definitions: RwLock::new(definitions),
            published: RwLock::new(None),
            cache,
            db: Mutex::new(db),
        }
    }

    /// Boot lifecycle: compile and publish, or fall back to the last recorded schema
    fn boot(&self) -> Result<()> {
        let error = match self.compile() {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };

        let Some(record) = self.db().get_last_schema()? else {
            return Err(error);
        };
        let schema: CompiledSchema = serde_json::from_str(&record.schema_json)?;
        log::warn!(
            "Compilation failed ({error}); serving last-good schema {} recorded at {}",
            record.hash,
            record.created_at
        );
        self.publish(Arc::new(schema));
        Ok(())
    }

    // ── Compilation ──────────────────────────────────────────────────

    /// Compile the current definitions and publish the result.
    ///
    /// A new definition hash is recorded in the schema history together with
    /// the compiled schema and flat index, and invalidates cached renderings.
    /// On failure nothing is published and the previous schema keeps serving.
    pub fn compile(&self) -> Result<Arc<CompiledSchema>> {
        let definitions = self.read_definitions().clone();
        let compiled = Registry::build(definitions, &self.generators).and_then(|r| compile(&r));
        let schema = match compiled {
            Ok(schema) => Arc::new(schema),
            Err(e) => {
                if self.published().is_some() {
                    log::warn!("Compilation failed, keeping the published schema: {e}");
                }
                return Err(e);
            }
        };

        {
            let db = self.db();
            if db.get_last_schema_hash()?.as_deref() != Some(schema.source_hash.as_str()) {
                db.record_schema(&schema.source_hash, &serde_json::to_string(schema.as_ref())?)?;
                db.clear_cache()?;
            }
        }

        let changed = self
            .published()
            .map(|previous| previous.source_hash != schema.source_hash)
            .unwrap_or(false);
        if changed {
            self.cache.clear();
        }

        self.publish(schema.clone());
        Ok(schema)
    }

    /// Re-read the definition files from disk and recompile.
    ///
    /// A parse failure leaves both the definitions and the published schema untouched.
    pub fn reload(&self) -> Result<Arc<CompiledSchema>> {
        let root = self.require_root()?;
        let definitions = load_definitions(&root.join(CONFIG_FILE))?;
        self.set_definitions(definitions)
    }

    /// Replace the definitions and recompile.
    pub fn set_definitions(&self, definitions: DefinitionFile) -> Result<Arc<CompiledSchema>> {
        *self
            .definitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = definitions;
        self.compile()
    }

    fn publish(&self, schema: Arc<CompiledSchema>) {
        log::info!(
            "Published schema {} ({} nodes)",
            schema.source_hash,
            schema.flatmap.len()
        );
        *self
            .published
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(schema);
    }

    fn published(&self) -> Option<Arc<CompiledSchema>> {
        self.published
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    // ── Accessors ────────────────────────────────────────────────────

    /// The currently published schema.
    pub fn schema(&self) -> Result<Arc<CompiledSchema>> {
        self.published()
            .ok_or_else(|| BlockPressError::Other("No schema has been published".into()))
    }

    pub fn settings(&self) -> Settings {
        self.read_definitions().settings.clone()
    }

    pub fn definitions(&self) -> DefinitionFile {
        self.read_definitions().clone()
    }

    /// Get the root path of the data directory, if there is one.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn cache(&self) -> &RenderCache {
        &self.cache
    }

    /// Look up a compiled node id in the published flat index.
    pub fn lookup(&self, id: &str) -> Result<Option<FlatEntry>> {
        Ok(self.schema()?.flatmap.lookup(id).cloned())
    }

    // ── Data ─────────────────────────────────────────────────────────

    /// Rehydrate the stored rows of one layout against the published schema.
    pub fn rehydrate_layout(
        &self,
        layout: &str,
        rows: &[Value],
        resolver: &dyn ValueResolver,
    ) -> Result<Vec<Value>> {
        let schema = self.schema()?;
        Ok(Rehydrator::new(&schema.flatmap, resolver).rehydrate_layout(layout, rows))
    }

    /// Rehydrate a content item from its builder row.
    ///
    /// The row holds the enable toggle, the layout select and one block
    /// collection per layout, keyed by compiled id. `None` when the builder is
    /// switched off for the item.
    pub fn rehydrate_item(
        &self,
        row: &Map<String, Value>,
        resolver: &dyn ValueResolver,
    ) -> Result<Option<RehydratedItem>> {
        let schema = self.schema()?;
        let Some(selected) = select_layout(&schema.flatmap, row)? else {
            return Ok(None);
        };
        let blocks = Rehydrator::new(&schema.flatmap, resolver)
            .rehydrate_layout(&selected.layout, &selected.rows);
        Ok(Some(RehydratedItem {
            layout: selected.layout,
            blocks,
        }))
    }

    /// Turn rehydrated blocks back into stored rows.
    pub fn flatten_layout(&self, blocks: &[Value]) -> Result<Vec<Value>> {
        let schema = self.schema()?;
        Ok(flatten_layout(&schema.flatmap, blocks))
    }

    // ── Rendering ────────────────────────────────────────────────────

    /// Whether request parameters ask for a cache bust (`settings.bust_param`).
    ///
    /// A bare flag or any value other than `0`/`false` counts as a request.
    pub fn bust_requested<'q, I>(&self, params: I) -> bool
    where
        I: IntoIterator<Item = (&'q str, &'q str)>,
    {
        let name = self.read_definitions().settings.bust_param.clone();
        params
            .into_iter()
            .any(|(key, value)| key == name && !matches!(value.trim(), "0" | "false"))
    }

    /// Start a render pass for one top-level request.
    pub fn begin_pass(&self, bust_requested: bool, privileged: bool) -> RenderPass {
        self.cache.begin_pass(bust_requested, privileged)
    }

    /// Render a content item from its builder row.
    ///
    /// `None` when the builder is switched off for the item.
    pub fn render_item(
        &self,
        pass: &RenderPass,
        item: &str,
        row: &Map<String, Value>,
        renderer: &dyn TemplateRenderer,
        resolver: &dyn ValueResolver,
    ) -> Result<Option<String>> {
        let schema = self.schema()?;
        let Some(selected) = select_layout(&schema.flatmap, row)? else {
            log::debug!("Builder disabled for item {item}");
            return Ok(None);
        };
        self.render_layout(pass, item, &selected.layout, &selected.rows, renderer, resolver)
            .map(Some)
    }

    /// Render a whole layout for one content item.
    ///
    /// Each top-level block is rendered through the cache under its position
    /// key; the joined output is cached again under the bare layout key unless
    /// a block rendered as a missing-template placeholder.
    pub fn render_layout(
        &self,
        pass: &RenderPass,
        item: &str,
        layout: &str,
        rows: &[Value],
        renderer: &dyn TemplateRenderer,
        resolver: &dyn ValueResolver,
    ) -> Result<String> {
        let key = CacheKey::layout(item, layout);
        let rendered = self.cache.get_or_render_tracked(pass, &key, || {
            let blocks = self.rehydrate_layout(layout, rows, resolver)?;
            let mut outputs = Vec::with_capacity(blocks.len());
            let mut cacheable = true;
            for block in &blocks {
                if BlockMeta::from_data(block).is_none() {
                    log::warn!("Skipping unrecognised row in layout '{layout}'");
                    continue;
                }
                let rendered = self.render_block_tracked(pass, item, block, renderer)?;
                cacheable &= rendered.cacheable;
                outputs.push(rendered.output);
            }

            let data = json!({ "item": item, "layout": layout, "blocks": blocks });
            let output = match renderer.render_layout(layout, &outputs, &data)? {
                Some(output) => output,
                None => outputs.join("\n"),
            };
            Ok(if cacheable {
                Rendered::new(output)
            } else {
                Rendered::transient(output)
            })
        })?;
        Ok(rendered.output)
    }

    /// Render one rehydrated block, nested or top-level, through the cache.
    pub fn render_block(
        &self,
        pass: &RenderPass,
        item: &str,
        data: &Value,
        renderer: &dyn TemplateRenderer,
    ) -> Result<String> {
        self.render_block_tracked(pass, item, data, renderer)
            .map(|rendered| rendered.output)
    }

    fn render_block_tracked(
        &self,
        pass: &RenderPass,
        item: &str,
        data: &Value,
        renderer: &dyn TemplateRenderer,
    ) -> Result<Rendered> {
        let meta = BlockMeta::from_data(data)
            .ok_or_else(|| BlockPressError::Render("Block data carries no _meta envelope".into()))?;
        let key = CacheKey::block(item, &meta);
        self.cache.get_or_render_tracked(pass, &key, || {
            renderer
                .render_block(&meta.layout, &meta.block, data)
                .map(Rendered::new)
        })
    }

    /// Persist the in-memory render cache to the system database.
    pub fn save_cache(&self) -> Result<()> {
        self.cache.save_to_db(&self.db())
    }

    /// Drop every cached rendering, in memory and persisted.
    pub fn clear_cache(&self) -> Result<usize> {
        let in_memory = self.cache.len();
        self.cache.clear();
        let persisted = self.db().clear_cache()?;
        Ok(in_memory.max(persisted))
    }

    // ── Maintenance ──────────────────────────────────────────────────

    /// Lint the current definitions without publishing.
    pub fn validate(&self) -> ValidationResult {
        validation::validate_definitions(&self.read_definitions(), &self.generators)
    }

    /// Watch the data directory for definition changes.
    pub fn watch(&self) -> Result<DefinitionWatcher> {
        Ok(DefinitionWatcher::start(self.require_root()?)?)
    }

    /// Get status information: published schema, history and cache stats.
    pub fn status(&self) -> Result<Value> {
        let schema = self.schema()?;
        let db = self.db();
        Ok(json!({
            "root": self.root.as_ref().map(|r| r.display().to_string()),
            "source_hash": schema.source_hash,
            "key_scheme": schema.key_scheme,
            "compiled_at": schema.compiled_at.to_rfc3339(),
            "layouts": schema.flatmap.layout_names().collect::<Vec<_>>(),
            "nodes": schema.flatmap.len(),
            "history": db.schema_history_count()?,
            "cache": {
                "enabled": self.cache.is_enabled(),
                "entries": self.cache.len(),
            },
        }))
    }

    fn require_root(&self) -> Result<&Path> {
        self.root()
            .ok_or_else(|| BlockPressError::Config("Builder has no data directory".into()))
    }

    fn read_definitions(&self) -> RwLockReadGuard<'_, DefinitionFile> {
        self.definitions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn db(&self) -> MutexGuard<'_, SystemDb> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
