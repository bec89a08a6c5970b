use crate::error::{BlockPressError, Result};
use crate::render_cache::CacheEntry;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// The system database that keeps schema history and the persisted render cache.
pub struct SystemDb {
    conn: Connection,
}

/// One recorded schema version.
#[derive(Debug, Clone)]
pub struct SchemaRecord {
    pub id: i64,
    pub hash: String,
    pub schema_json: String,
    pub created_at: String,
}

impl SystemDb {
    /// Open or create the system database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = SystemDb { conn };
        db.initialize_tables()?;
        Ok(db)
    }

    /// Open an in-memory system database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = SystemDb { conn };
        db.initialize_tables()?;
        Ok(db)
    }

    fn initialize_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hash TEXT NOT NULL,
                schema_json TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS render_cache (
                cache_key TEXT PRIMARY KEY,
                output TEXT NOT NULL,
                stored_at TEXT NOT NULL
            );
            "
        )?;
        Ok(())
    }

    // ── Schema State ─────────────────────────────────────────────────

    /// Get the most recent schema hash.
    pub fn get_last_schema_hash(&self) -> Result<Option<String>> {
        let result = self.conn.query_row(
            "SELECT hash FROM schema_history ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        ).optional()?;
        Ok(result)
    }

    /// Get the most recently recorded schema.
    pub fn get_last_schema(&self) -> Result<Option<SchemaRecord>> {
        let result = self.conn.query_row(
            "SELECT id, hash, schema_json, created_at FROM schema_history ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                Ok(SchemaRecord {
                    id: row.get(0)?,
                    hash: row.get(1)?,
                    schema_json: row.get(2)?,
                    created_at: row.get(3)?,
                })
            },
        ).optional()?;
        Ok(result)
    }

    /// Record a new schema version.
    pub fn record_schema(&self, hash: &str, schema_json: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO schema_history (hash, schema_json) VALUES (?1, ?2)",
            params![hash, schema_json],
        )?;
        Ok(())
    }

    /// Number of recorded schema versions.
    pub fn schema_history_count(&self) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM schema_history",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Render Cache ─────────────────────────────────────────────────

    /// Load every persisted cache entry.
    pub fn get_cache_entries(&self) -> Result<Vec<(String, CacheEntry)>> {
        let mut stmt = self.conn.prepare(
            "SELECT cache_key, output, stored_at FROM render_cache ORDER BY cache_key",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, output, stored_at) = row?;
            let stored_at = DateTime::parse_from_rfc3339(&stored_at)
                .map_err(|e| BlockPressError::Other(format!("Bad timestamp for {key}: {e}")))?
                .with_timezone(&Utc);
            entries.push((key, CacheEntry { output, stored_at }));
        }
        Ok(entries)
    }

    /// Insert or replace one cache entry.
    pub fn set_cache_entry(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO render_cache (cache_key, output, stored_at) VALUES (?1, ?2, ?3)",
            params![key, entry.output, entry.stored_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Replace the persisted cache with `entries` in one transaction.
    pub fn replace_cache_entries<'a>(
        &self,
        entries: impl Iterator<Item = (&'a String, &'a CacheEntry)>,
    ) -> Result<()> {
        self.begin_transaction()?;
        match self.write_cache_entries(entries) {
            Ok(()) => self.commit_transaction(),
            Err(e) => {
                self.rollback_transaction()?;
                Err(e)
            }
        }
    }

    fn write_cache_entries<'a>(
        &self,
        entries: impl Iterator<Item = (&'a String, &'a CacheEntry)>,
    ) -> Result<()> {
        self.clear_cache()?;
        for (key, entry) in entries {
            self.set_cache_entry(key, entry)?;
        }
        Ok(())
    }

    /// Delete every persisted cache entry.
    pub fn clear_cache(&self) -> Result<usize> {
        let removed = self.conn.execute("DELETE FROM render_cache", [])?;
        Ok(removed)
    }

    // ── Transactions ─────────────────────────────────────────────────

    /// Begin a transaction.
    pub fn begin_transaction(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(())
    }

    /// Commit the current transaction.
    pub fn commit_transaction(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Roll back the current transaction.
    pub fn rollback_transaction(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(output: &str) -> CacheEntry {
        CacheEntry {
            output: output.into(),
            stored_at: Utc::now(),
        }
    }

    #[test]
    fn test_schema_history() {
        let db = SystemDb::open_in_memory().unwrap();
        assert!(db.get_last_schema_hash().unwrap().is_none());
        assert!(db.get_last_schema().unwrap().is_none());

        db.record_schema("aaa", "{\"v\":1}").unwrap();
        db.record_schema("bbb", "{\"v\":2}").unwrap();

        assert_eq!(db.get_last_schema_hash().unwrap().as_deref(), Some("bbb"));
        let last = db.get_last_schema().unwrap().unwrap();
        assert_eq!(last.hash, "bbb");
        assert_eq!(last.schema_json, "{\"v\":2}");
        assert_eq!(db.schema_history_count().unwrap(), 2);
    }

    #[test]
    fn test_cache_entries() {
        let db = SystemDb::open_in_memory().unwrap();
        let a = entry("<p>a</p>");
        db.set_cache_entry("1|page|page|0|text", &a).unwrap();
        db.set_cache_entry("1|page|page|0|text", &entry("<p>b</p>")).unwrap();

        let entries = db.get_cache_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.output, "<p>b</p>");

        assert_eq!(db.clear_cache().unwrap(), 1);
        assert!(db.get_cache_entries().unwrap().is_empty());
    }

    #[test]
    fn test_replace_cache_entries() {
        let db = SystemDb::open_in_memory().unwrap();
        db.set_cache_entry("stale", &entry("old")).unwrap();

        let fresh: Vec<(String, CacheEntry)> = vec![
            ("k1".into(), entry("one")),
            ("k2".into(), entry("two")),
        ];
        db.replace_cache_entries(fresh.iter().map(|(k, e)| (k, e))).unwrap();

        let keys: Vec<String> = db.get_cache_entries().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["k1", "k2"]);
    }

    #[test]
    fn test_reopen_keeps_history() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("_system.db");
        {
            let db = SystemDb::open(&path).unwrap();
            db.record_schema("abc", "{}").unwrap();
        }
        let db = SystemDb::open(&path).unwrap();
        assert_eq!(db.get_last_schema_hash().unwrap().as_deref(), Some("abc"));
    }
}
