//! Render cache.
//!
//! Memoises rendered output per (content item, layout, parent path, position,
//! block). Entries live in memory for the process and can be saved to and
//! loaded from the system database.

use crate::error::{BlockPressError, Result};
use crate::rehydrate::BlockMeta;
use crate::schema::Settings;
use crate::system_db::SystemDb;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const KEY_DELIMITER: &str = "|";

/// Renders block and layout templates. Implemented by the host.
pub trait TemplateRenderer {
    /// Render one rehydrated block.
    fn render_block(&self, layout: &str, block: &str, data: &Value) -> Result<String>;

    /// Wrap the rendered blocks of a layout. `None` joins them with newlines.
    fn render_layout(&self, _layout: &str, _blocks: &[String], _data: &Value) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Identity of one rendered unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub content_item: String,
    pub layout: String,
    pub parent: Option<String>,
    pub index: Option<usize>,
    pub block: Option<String>,
}

impl CacheKey {
    /// A whole layout rendering.
    pub fn layout(content_item: &str, layout: &str) -> Self {
        CacheKey {
            content_item: content_item.to_string(),
            layout: layout.to_string(),
            parent: None,
            index: None,
            block: None,
        }
    }

    /// One block at its position.
    pub fn block(content_item: &str, meta: &BlockMeta) -> Self {
        CacheKey {
            content_item: content_item.to_string(),
            layout: meta.layout.clone(),
            parent: Some(meta.parent.clone()),
            index: Some(meta.index),
            block: Some(meta.block.clone()),
        }
    }

    /// `item|layout|parent[|index|block]`, parent defaulting to the layout name.
    pub fn composite(&self) -> String {
        let mut parts = vec![
            self.content_item.clone(),
            self.layout.clone(),
            self.parent.clone().unwrap_or_else(|| self.layout.clone()),
        ];
        if let Some(index) = self.index {
            parts.push(index.to_string());
        }
        if let Some(block) = &self.block {
            parts.push(block.clone());
        }
        parts.join(KEY_DELIMITER)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub output: String,
    pub stored_at: DateTime<Utc>,
}

/// Output of one render and whether it may be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub output: String,
    /// False when the output holds a missing-template placeholder
    pub cacheable: bool,
}

impl Rendered {
    pub fn new(output: String) -> Self {
        Rendered {
            output,
            cacheable: true,
        }
    }

    /// Output that must not be stored, such as one wrapping a placeholder.
    pub fn transient(output: String) -> Self {
        Rendered {
            output,
            cacheable: false,
        }
    }
}

/// One top-level render request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderPass {
    bust: bool,
}

impl RenderPass {
    pub fn is_busting(&self) -> bool {
        self.bust
    }
}

pub struct RenderCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    enabled: bool,
    markers: bool,
}

impl RenderCache {
    pub fn new(enabled: bool, markers: bool) -> Self {
        RenderCache {
            entries: RwLock::new(HashMap::new()),
            enabled,
            markers,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.use_cache, settings.cache_markers)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Start a render pass. A bust only applies to privileged callers.
    pub fn begin_pass(&self, bust_requested: bool, privileged: bool) -> RenderPass {
        if bust_requested && !privileged {
            log::debug!("Ignoring cache bust from unprivileged caller");
        }
        RenderPass {
            bust: bust_requested && privileged,
        }
    }

    /// Return the cached output for `key`, or render and store it.
    ///
    /// A busting pass always renders and leaves stored entries untouched.
    /// A missing template renders as a placeholder comment that is never cached.
    pub fn get_or_render<F>(&self, pass: &RenderPass, key: &CacheKey, render: F) -> Result<String>
    where
        F: FnOnce() -> Result<String>,
    {
        self.get_or_render_tracked(pass, key, || render().map(Rendered::new))
            .map(|rendered| rendered.output)
    }

    /// Like [`get_or_render`](Self::get_or_render), for renders that may
    /// report their output as not cacheable. The result tells the caller
    /// whether a placeholder ended up in the output.
    pub fn get_or_render_tracked<F>(&self, pass: &RenderPass, key: &CacheKey, render: F) -> Result<Rendered>
    where
        F: FnOnce() -> Result<Rendered>,
    {
        let composite = key.composite();
        if self.enabled && !pass.bust {
            if let Some(entry) = self.read().get(&composite) {
                log::debug!("Render cache hit: {composite}");
                return Ok(Rendered::new(self.mark(&composite, entry)));
            }
        }
        log::debug!("Render cache miss: {composite}");

        match render() {
            Ok(rendered) => {
                if self.enabled && !pass.bust && rendered.cacheable {
                    self.write().insert(
                        composite,
                        CacheEntry {
                            output: rendered.output.clone(),
                            stored_at: Utc::now(),
                        },
                    );
                } else if !rendered.cacheable {
                    log::debug!("Not caching {composite}: output holds a placeholder");
                }
                Ok(rendered)
            }
            Err(BlockPressError::MissingTemplate { name }) => {
                log::warn!("Missing template for {name}");
                Ok(Rendered::transient(missing_template_placeholder(&name)))
            }
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.read().get(&key.composite()).cloned()
    }

    /// Drop one whole entry.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.write().remove(&key.composite()).is_some()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Load persisted entries; entries already in memory win.
    pub fn load_from_db(&self, db: &SystemDb) -> Result<usize> {
        let stored = db.get_cache_entries()?;
        let mut entries = self.write();
        let mut loaded = 0;
        for (key, entry) in stored {
            if !entries.contains_key(&key) {
                entries.insert(key, entry);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Replace the persisted cache with the in-memory entries.
    pub fn save_to_db(&self, db: &SystemDb) -> Result<()> {
        let entries = self.read();
        db.replace_cache_entries(entries.iter())
    }

    fn mark(&self, composite: &str, entry: &CacheEntry) -> String {
        if !self.markers {
            return entry.output.clone();
        }
        format!(
            "<!-- blockpress:cached {composite} @ {} -->\n{}",
            entry.stored_at.to_rfc3339(),
            entry.output
        )
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RenderCache {
    fn default() -> Self {
        Self::new(true, true)
    }
}

pub fn missing_template_placeholder(name: &str) -> String {
    format!("<!-- blockpress: missing template for {name} -->")
}
