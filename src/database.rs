use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::store::{Entries, KeyValueStore, StoreError};

/// Key/value store backed by a single SQLite table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {:?}", parent))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {:?}", db_path))?;

        let db = SqliteStore {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = SqliteStore {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    pub fn get_database_path(&self) -> String {
        self.db_path.to_string_lossy().to_string()
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,          -- JSON
                updated_at INTEGER NOT NULL   -- Unix timestamp
            )",
            [],
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("database connection lock poisoned".to_string()))
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, keys: &[&str]) -> Result<Entries, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT value FROM kv_entries WHERE key = ?1")
            .map_err(backend)?;

        let mut found = Entries::new();
        for key in keys {
            let raw: Option<String> = stmt
                .query_row(params![key], |row| row.get(0))
                .optional()
                .map_err(backend)?;
            if let Some(raw) = raw {
                let value = serde_json::from_str(&raw).map_err(|e| StoreError::corrupt(key, e))?;
                found.insert(key.to_string(), value);
            }
        }
        Ok(found)
    }

    async fn set(&self, entries: Entries) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().map_err(backend)?;
        let now = chrono::Utc::now().timestamp();

        for (key, value) in &entries {
            tx.execute(
                "INSERT OR REPLACE INTO kv_entries (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value.to_string(), now],
            )
            .map_err(backend)?;
        }

        tx.commit().map_err(backend)?;
        log::debug!("Stored {} entries in {}", entries.len(), self.get_database_path());
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().map_err(backend)?;
        for key in keys {
            tx.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])
                .map_err(backend)?;
        }
        tx.commit().map_err(backend)?;
        Ok(())
    }
}
