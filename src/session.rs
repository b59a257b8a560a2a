use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{Entries, KeyValueStore, StoreError};

pub const ROWS_KEY: &str = "rows";
pub const CURSOR_KEY: &str = "cursor";
pub const TABLE_KEY: &str = "source_table";
pub const TEMPLATES_KEY: &str = "templates";
pub const AI_SETTINGS_KEY: &str = "ai_settings";
pub const ATTACHMENTS_KEY: &str = "attachments";
pub const CACHE_KEY: &str = "personalization_cache";

/// One contact to be turned into one draft.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    #[serde(default)]
    pub name: String,
    /// May hold several comma-separated addresses
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub personalized: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    /// Position in the source table, fixed when the session starts
    #[serde(default)]
    pub row_index: usize,
}

impl Row {
    pub fn new(name: &str, email: &str, company: &str) -> Self {
        Self {
            name: name.to_string(),
            email: email.to_string(),
            company: company.to_string(),
            ..Self::default()
        }
    }

    /// Identity used to share one generated sentence between rows.
    pub fn cache_key(&self) -> String {
        let email = self.email.trim();
        if !email.is_empty() {
            return email.to_lowercase();
        }
        let company = self.company.trim();
        if !company.is_empty() {
            return company.to_string();
        }
        let name = self.name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
        format!("row_{}", self.row_index)
    }
}

/// Raw parsed row of the source table, keyed by lower-cased header.
pub type SourceRow = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Templates {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiSettings {
    pub api_key: String,
    pub prompt_template: String,
    pub needs_personalization: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub base64_payload: String,
}

impl Attachment {
    pub fn from_bytes(name: &str, mime_type: &str, data: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            base64_payload: BASE64_STANDARD.encode(data),
        }
    }

    /// Read a file from disk, guessing the MIME type from its extension.
    pub fn from_path(file_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(file_path).into_owned();
        let path = Path::new(&expanded_path);
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read attachment {}", expanded_path))?;

        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("attachment")
            .to_string();

        let mime_type = match path.extension().and_then(|ext| ext.to_str()) {
            Some("txt") => "text/plain",
            Some("csv") => "text/csv",
            Some("pdf") => "application/pdf",
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("png") => "image/png",
            Some("gif") => "image/gif",
            Some("doc") => "application/msword",
            Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            Some("xls") => "application/vnd.ms-excel",
            Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            _ => "application/octet-stream",
        };

        Ok(Self::from_bytes(&name, mime_type, &data))
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64_STANDARD.decode(self.base64_payload.as_bytes())
    }
}

/// Resumable progress over one batch of rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub rows: Vec<Row>,
    /// Index of the next row to fill; `rows.len()` means complete
    pub cursor: usize,
    pub source_table: Vec<SourceRow>,
    pub templates: Templates,
    pub ai_settings: Option<AiSettings>,
    pub attachments: Vec<Attachment>,
}

impl Session {
    pub fn is_complete(&self) -> bool {
        self.cursor >= self.rows.len()
    }

    pub fn remaining(&self) -> usize {
        self.rows.len().saturating_sub(self.cursor)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            has_data: true,
            current_row: self.cursor + 1,
            total_rows: self.rows.len(),
            remaining: self.remaining(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub has_data: bool,
    /// 1-based number of the next row
    pub current_row: usize,
    pub total_rows: usize,
    pub remaining: usize,
}

/// Inputs that outlive a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedData {
    pub table: Option<Vec<SourceRow>>,
    pub templates: Option<Templates>,
    pub ai_settings: Option<AiSettings>,
    pub attachments: Vec<Attachment>,
    pub has_active_session: bool,
}

pub type PersonalizationCache = HashMap<String, String>;

fn decode<T: DeserializeOwned>(entries: &mut Entries, key: &str) -> Result<Option<T>, StoreError> {
    match entries.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StoreError::corrupt(key, e)),
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::corrupt(key, e))
}

/// Durable session state on top of a [`KeyValueStore`].
pub struct SessionStore<S> {
    store: S,
}

impl<S: KeyValueStore> SessionStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    /// Persist a fresh session with its cursor at zero.
    pub async fn begin(&self, session: &Session) -> Result<(), StoreError> {
        let mut entries = Entries::new();
        entries.insert(ROWS_KEY.to_string(), encode(ROWS_KEY, &session.rows)?);
        entries.insert(CURSOR_KEY.to_string(), Value::from(0u64));
        entries.insert(TABLE_KEY.to_string(), encode(TABLE_KEY, &session.source_table)?);
        entries.insert(TEMPLATES_KEY.to_string(), encode(TEMPLATES_KEY, &session.templates)?);
        entries.insert(
            AI_SETTINGS_KEY.to_string(),
            encode(AI_SETTINGS_KEY, &session.ai_settings)?,
        );
        entries.insert(
            ATTACHMENTS_KEY.to_string(),
            encode(ATTACHMENTS_KEY, &session.attachments)?,
        );

        self.store.set(entries).await?;
        log::info!(
            "Saved session: {} rows, {} source rows, {} attachments",
            session.rows.len(),
            session.source_table.len(),
            session.attachments.len()
        );
        Ok(())
    }

    pub async fn load(&self) -> Result<Option<Session>, StoreError> {
        let mut entries = self
            .store
            .get(&[
                ROWS_KEY,
                CURSOR_KEY,
                TABLE_KEY,
                TEMPLATES_KEY,
                AI_SETTINGS_KEY,
                ATTACHMENTS_KEY,
            ])
            .await?;

        let rows: Option<Vec<Row>> = decode(&mut entries, ROWS_KEY)?;
        let cursor: Option<usize> = decode(&mut entries, CURSOR_KEY)?;
        let (rows, cursor) = match (rows, cursor) {
            (Some(rows), Some(cursor)) => (rows, cursor),
            _ => return Ok(None),
        };

        if cursor > rows.len() {
            return Err(StoreError::corrupt(
                CURSOR_KEY,
                format!("cursor {} is past the last of {} rows", cursor, rows.len()),
            ));
        }

        let session = Session {
            rows,
            cursor,
            source_table: decode(&mut entries, TABLE_KEY)?.unwrap_or_default(),
            templates: decode(&mut entries, TEMPLATES_KEY)?.unwrap_or_default(),
            ai_settings: decode(&mut entries, AI_SETTINGS_KEY)?,
            attachments: decode(&mut entries, ATTACHMENTS_KEY)?.unwrap_or_default(),
        };
        log::info!(
            "Restored session at row {}/{}",
            session.cursor + 1,
            session.rows.len()
        );
        Ok(Some(session))
    }

    pub async fn commit_cursor(&self, cursor: usize) -> Result<(), StoreError> {
        let mut entries = Entries::new();
        entries.insert(CURSOR_KEY.to_string(), Value::from(cursor as u64));
        self.store.set(entries).await
    }

    /// Drop rows and cursor; table, templates and attachments stay.
    pub async fn clear_progress(&self) -> Result<(), StoreError> {
        self.store.remove(&[ROWS_KEY, CURSOR_KEY]).await
    }

    /// Drop progress and the personalization cache.
    pub async fn reset(&self) -> Result<(), StoreError> {
        self.store.remove(&[ROWS_KEY, CURSOR_KEY, CACHE_KEY]).await
    }

    pub async fn load_cache(&self) -> Result<PersonalizationCache, StoreError> {
        let mut entries = self.store.get(&[CACHE_KEY]).await?;
        Ok(decode(&mut entries, CACHE_KEY)?.unwrap_or_default())
    }

    pub async fn save_cache(&self, cache: &PersonalizationCache) -> Result<(), StoreError> {
        let mut entries = Entries::new();
        entries.insert(CACHE_KEY.to_string(), encode(CACHE_KEY, cache)?);
        self.store.set(entries).await
    }

    pub async fn save_templates(&self, templates: &Templates) -> Result<(), StoreError> {
        let mut entries = Entries::new();
        entries.insert(TEMPLATES_KEY.to_string(), encode(TEMPLATES_KEY, templates)?);
        self.store.set(entries).await
    }

    pub async fn save_table(&self, table: &[SourceRow]) -> Result<(), StoreError> {
        let mut entries = Entries::new();
        entries.insert(TABLE_KEY.to_string(), encode(TABLE_KEY, &table)?);
        self.store.set(entries).await?;
        log::debug!("Saved source table: {} rows", table.len());
        Ok(())
    }

    pub async fn saved_data(&self) -> Result<SavedData, StoreError> {
        let mut entries = self
            .store
            .get(&[
                ROWS_KEY,
                CURSOR_KEY,
                TABLE_KEY,
                TEMPLATES_KEY,
                AI_SETTINGS_KEY,
                ATTACHMENTS_KEY,
            ])
            .await?;

        let has_active_session =
            entries.contains_key(ROWS_KEY) && entries.contains_key(CURSOR_KEY);

        Ok(SavedData {
            table: decode(&mut entries, TABLE_KEY)?,
            templates: decode(&mut entries, TEMPLATES_KEY)?,
            ai_settings: decode(&mut entries, AI_SETTINGS_KEY)?,
            attachments: decode(&mut entries, ATTACHMENTS_KEY)?.unwrap_or_default(),
            has_active_session,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn session() -> Session {
        let mut table_row = SourceRow::new();
        table_row.insert("name".to_string(), "Al".to_string());
        Session {
            rows: vec![Row::new("Al", "a@x.com", "Acme")],
            cursor: 0,
            source_table: vec![table_row],
            templates: Templates {
                subject: "Hi [name]".to_string(),
                body: "Re [company]".to_string(),
            },
            ai_settings: None,
            attachments: vec![Attachment::from_bytes("a.txt", "text/plain", b"hello")],
        }
    }

    #[test]
    fn cache_key_falls_back_in_order() {
        let mut row = Row::new("Al", " A@X.com ", "Acme");
        assert_eq!(row.cache_key(), "a@x.com");
        row.email.clear();
        assert_eq!(row.cache_key(), "Acme");
        row.company.clear();
        assert_eq!(row.cache_key(), "Al");
        row.name.clear();
        row.row_index = 7;
        assert_eq!(row.cache_key(), "row_7");
    }

    #[test]
    fn attachment_payload_decodes() {
        let attachment = Attachment::from_bytes("a.txt", "text/plain", b"hello");
        assert_eq!(attachment.base64_payload, "aGVsbG8=");
        assert_eq!(attachment.decode().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn begin_then_load_round_trips() {
        let store = SessionStore::new(MemoryStore::new());
        let mut started = session();
        started.cursor = 5;
        store.begin(&started).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.cursor, 0);
        assert_eq!(loaded.rows, started.rows);
        assert_eq!(loaded.templates, started.templates);
        assert_eq!(loaded.attachments, started.attachments);
    }

    #[tokio::test]
    async fn clear_progress_keeps_inputs() {
        let store = SessionStore::new(MemoryStore::new());
        store.begin(&session()).await.unwrap();
        store.clear_progress().await.unwrap();

        assert!(store.load().await.unwrap().is_none());
        let saved = store.saved_data().await.unwrap();
        assert!(!saved.has_active_session);
        assert_eq!(saved.table.unwrap().len(), 1);
        assert_eq!(saved.templates.unwrap().subject, "Hi [name]");
        assert_eq!(saved.attachments.len(), 1);
    }

    #[tokio::test]
    async fn reset_drops_cache() {
        let store = SessionStore::new(MemoryStore::new());
        let mut cache = PersonalizationCache::new();
        cache.insert("a@x.com".to_string(), "Nice work.".to_string());
        store.save_cache(&cache).await.unwrap();
        assert_eq!(store.load_cache().await.unwrap(), cache);

        store.reset().await.unwrap();
        assert!(store.load_cache().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cursor_past_end_is_corrupt() {
        let store = SessionStore::new(MemoryStore::new());
        store.begin(&session()).await.unwrap();
        store.commit_cursor(2).await.unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
