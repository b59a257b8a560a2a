//! Draft fill state machine.
//!
//! `start` persists a session, each `advance` fills the compose UI from the
//! row under the cursor and only then commits the cursor. A failed row keeps
//! the cursor where it is so the same row can be retried.

use std::str::FromStr;

use lettre::message::Mailbox;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compose::{self, AttachError, ComposeError, FieldLocator, FieldWriter, FillTiming};
use crate::personalize::{Personalization, PersonalizationError, PersonalizationGateway, TextGenerator};
use crate::session::{
    AiSettings, Attachment, Row, SavedData, Session, SessionStatus, SessionStore, SourceRow,
    Templates,
};
use crate::store::{KeyValueStore, StoreError};

#[derive(Error, Debug)]
pub enum DraftError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No active draft session")]
    NoActiveSession,

    #[error("Row {0} has no email address")]
    MissingEmail(usize),

    #[error("Row {row}: recipient '{address}' is not a valid address")]
    RecipientRejected { row: usize, address: String },

    #[error("Compose window not ready: {0}")]
    Compose(#[from] ComposeError),

    #[error(transparent)]
    Personalization(#[from] PersonalizationError),

    #[error("Attachment failed: {0}")]
    Attachment(#[from] AttachError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// A row failed after earlier rows in the same call had been skipped.
    #[error("{source} (skipped before it: {})", describe_skipped(.skipped))]
    Interrupted {
        skipped: Vec<SkippedRow>,
        source: Box<DraftError>,
    },
}

fn describe_skipped(skipped: &[SkippedRow]) -> String {
    skipped
        .iter()
        .map(|row| format!("row {}", row.row_index + 1))
        .collect::<Vec<_>>()
        .join(", ")
}

impl DraftError {
    /// Whether the driver may move past the row and try the next one.
    ///
    /// Only an address the mail layer cannot accept is skippable; missing
    /// input, configuration, an unready UI and gateway failures all stop on
    /// the same row.
    pub fn is_skippable(&self) -> bool {
        matches!(self, DraftError::RecipientRejected { .. })
    }

    fn after_skips(skipped: Vec<SkippedRow>, err: DraftError) -> Self {
        if skipped.is_empty() {
            return err;
        }
        DraftError::Interrupted {
            skipped,
            source: Box::new(err),
        }
    }

    /// Rows skipped in the same call before this error stopped the driver.
    pub fn skipped(&self) -> &[SkippedRow] {
        match self {
            DraftError::Interrupted { skipped, .. } => skipped,
            _ => &[],
        }
    }

    /// The error that stopped the driver, without the skipped-row wrapper.
    pub fn cause(&self) -> &DraftError {
        match self {
            DraftError::Interrupted { source, .. } => source.cause(),
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverState {
    Idle,
    AwaitingRow,
    Filling,
    Complete,
}

/// Everything needed to begin a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    pub rows: Vec<Row>,
    #[serde(default)]
    pub table: Vec<SourceRow>,
    pub templates: Templates,
    #[serde(default)]
    pub ai_settings: Option<AiSettings>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilledDraft {
    pub row_index: usize,
    pub recipients: Vec<String>,
    pub chips: usize,
    pub subject: String,
    pub body: String,
    pub attachments: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRow {
    pub row_index: usize,
    pub reason: String,
}

/// Result of one `advance` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvanceOutcome {
    pub filled: Option<FilledDraft>,
    pub skipped: Vec<SkippedRow>,
    /// Cursor after the call
    pub cursor: usize,
    pub total_rows: usize,
    pub complete: bool,
}

impl AdvanceOutcome {
    pub fn remaining(&self) -> usize {
        self.total_rows.saturating_sub(self.cursor)
    }

    pub fn message(&self) -> String {
        let mut message = match (&self.filled, self.complete) {
            (Some(_), false) => format!(
                "Filled draft {}/{}. {} remaining.",
                self.cursor,
                self.total_rows,
                self.remaining()
            ),
            (Some(_), true) => format!(
                "Filled draft {}/{}. All drafts completed!",
                self.cursor, self.total_rows
            ),
            (None, _) => "All drafts completed!".to_string(),
        };
        if !self.skipped.is_empty() {
            message.push_str(&format!(" Skipped {} row(s).", self.skipped.len()));
        }
        message
    }
}

pub struct DraftFillDriver<S, G, U> {
    store: SessionStore<S>,
    gateway: PersonalizationGateway<G>,
    surface: U,
    timing: FillTiming,
    state: DriverState,
    session: Option<Session>,
}

impl<S, G, U> DraftFillDriver<S, G, U>
where
    S: KeyValueStore,
    G: TextGenerator,
    U: FieldLocator + FieldWriter + Send,
{
    pub fn new(
        store: SessionStore<S>,
        gateway: PersonalizationGateway<G>,
        surface: U,
        timing: FillTiming,
    ) -> Self {
        Self {
            store,
            gateway,
            surface,
            timing,
            state: DriverState::Idle,
            session: None,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn surface(&self) -> &U {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut U {
        &mut self.surface
    }

    pub fn store(&self) -> &SessionStore<S> {
        &self.store
    }

    pub fn gateway(&self) -> &PersonalizationGateway<G> {
        &self.gateway
    }

    /// Pick up a session persisted by an earlier run, along with the cache.
    pub async fn restore(&mut self) -> Result<(), DraftError> {
        self.gateway.set_cache(self.store.load_cache().await?);
        self.session = self.store.load().await?;
        self.state = match &self.session {
            Some(_) => DriverState::AwaitingRow,
            None => DriverState::Idle,
        };
        Ok(())
    }

    /// Persist a new session and put the cursor on its first row.
    pub async fn start(&mut self, request: StartRequest) -> Result<usize, DraftError> {
        if request.templates.subject.trim().is_empty() || request.templates.body.trim().is_empty() {
            return Err(DraftError::Configuration(
                "both subject and body templates are required".to_string(),
            ));
        }
        if request.rows.is_empty() {
            return Err(DraftError::Configuration("no rows to fill".to_string()));
        }

        let rows: Vec<Row> = request
            .rows
            .into_iter()
            .enumerate()
            .map(|(row_index, row)| Row { row_index, ..row })
            .collect();

        let session = Session {
            rows,
            cursor: 0,
            source_table: request.table,
            templates: request.templates,
            ai_settings: request.ai_settings,
            attachments: request.attachments,
        };

        self.store.begin(&session).await?;
        if self.gateway.cache().is_empty() {
            self.gateway.set_cache(self.store.load_cache().await?);
        }

        let total = session.rows.len();
        self.session = Some(session);
        self.state = DriverState::AwaitingRow;
        log::info!("Ready to fill {} drafts", total);
        Ok(total)
    }

    /// Fill the row under the cursor.
    ///
    /// Skippable failures commit the cursor past the failing row and move on
    /// to the next one, at most once per row.
    pub async fn advance(&mut self) -> Result<AdvanceOutcome, DraftError> {
        if self.session.is_none() {
            self.restore().await?;
        }
        let total_rows = match &self.session {
            Some(session) => session.rows.len(),
            None => return self.finished_earlier().await,
        };

        let mut skipped = Vec::new();
        for _ in 0..=total_rows {
            let cursor = match &self.session {
                Some(session) if !session.is_complete() => session.cursor,
                _ => return self.complete(None, skipped, total_rows).await,
            };

            self.state = DriverState::Filling;
            log::info!("Filling row {}/{}", cursor + 1, total_rows);

            match self.fill_row(cursor).await {
                Ok(filled) => {
                    let next = match self.commit_cursor(cursor + 1).await {
                        Ok(next) => next,
                        Err(err) => return Err(DraftError::after_skips(skipped, err)),
                    };
                    log::info!("Filled row {}/{}", next, total_rows);
                    if next >= total_rows {
                        return self.complete(Some(filled), skipped, total_rows).await;
                    }
                    self.state = DriverState::AwaitingRow;
                    return Ok(AdvanceOutcome {
                        filled: Some(filled),
                        skipped,
                        cursor: next,
                        total_rows,
                        complete: false,
                    });
                }
                Err(err) if err.is_skippable() => {
                    log::warn!("Skipping row {}: {}", cursor + 1, err);
                    skipped.push(SkippedRow {
                        row_index: cursor,
                        reason: err.to_string(),
                    });
                    if let Err(err) = self.commit_cursor(cursor + 1).await {
                        return Err(DraftError::after_skips(skipped, err));
                    }
                }
                Err(err) => {
                    log::error!("Failed to fill row {}: {}", cursor + 1, err);
                    self.state = DriverState::AwaitingRow;
                    return Err(DraftError::after_skips(skipped, err));
                }
            }
        }

        // Every pass commits the cursor forward, so the loop ends on completion
        self.complete(None, skipped, total_rows).await
    }

    /// Forget the session and the personalization cache.
    pub async fn reset(&mut self) -> Result<(), DraftError> {
        self.store.reset().await?;
        self.gateway.clear_cache();
        self.session = None;
        self.state = DriverState::Idle;
        log::info!("Draft session reset");
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        match &self.session {
            Some(session) => session.status(),
            None => SessionStatus::default(),
        }
    }

    pub async fn saved_data(&self) -> Result<SavedData, DraftError> {
        Ok(self.store.saved_data().await?)
    }

    async fn commit_cursor(&mut self, cursor: usize) -> Result<usize, DraftError> {
        if let Err(err) = self.store.commit_cursor(cursor).await {
            self.state = DriverState::AwaitingRow;
            return Err(err.into());
        }
        if let Some(session) = self.session.as_mut() {
            session.cursor = cursor;
        }
        Ok(cursor)
    }

    /// No session in storage: a previous one ran to completion, or none
    /// was ever started.
    async fn finished_earlier(&mut self) -> Result<AdvanceOutcome, DraftError> {
        let saved = self.store.saved_data().await?;
        if saved.table.is_none() {
            return Err(DraftError::NoActiveSession);
        }
        self.state = DriverState::Complete;
        Ok(AdvanceOutcome {
            filled: None,
            skipped: Vec::new(),
            cursor: 0,
            total_rows: 0,
            complete: true,
        })
    }

    async fn complete(
        &mut self,
        filled: Option<FilledDraft>,
        skipped: Vec<SkippedRow>,
        total_rows: usize,
    ) -> Result<AdvanceOutcome, DraftError> {
        if let Err(err) = self.store.clear_progress().await {
            log::warn!("Failed to clear finished session: {}", err);
        }
        self.session = None;
        self.state = DriverState::Complete;
        log::info!("All drafts complete");
        Ok(AdvanceOutcome {
            filled,
            skipped,
            cursor: total_rows,
            total_rows,
            complete: true,
        })
    }

    async fn fill_row(&mut self, index: usize) -> Result<FilledDraft, DraftError> {
        let Self {
            store,
            gateway,
            surface,
            timing,
            session,
            ..
        } = self;
        let session = session.as_mut().ok_or(DraftError::NoActiveSession)?;
        let mut row = session.rows[index].clone();

        if row.email.trim().is_empty() {
            let fallback = session
                .source_table
                .get(row.row_index)
                .and_then(|source| source.get("email"))
                .map(|email| email.trim().to_string())
                .unwrap_or_default();
            if fallback.is_empty() {
                return Err(DraftError::MissingEmail(row.row_index + 1));
            }
            log::info!("Row {}: using email from source table", row.row_index + 1);
            row.email = fallback;
        }

        let recipients = compose::split_recipients(&row.email);
        if recipients.is_empty() {
            return Err(DraftError::MissingEmail(row.row_index + 1));
        }
        if let Some(bad) = recipients.iter().find(|addr| Mailbox::from_str(addr).is_err()) {
            return Err(DraftError::RecipientRejected {
                row: row.row_index + 1,
                address: bad.clone(),
            });
        }

        let personalization = gateway
            .ensure(&mut row, &session.templates, session.ai_settings.as_ref())
            .await?;
        if personalization == Personalization::Generated {
            if let Err(err) = store.save_cache(gateway.cache()).await {
                log::warn!("Failed to persist personalization cache: {}", err);
            }
        }
        session.rows[index] = row.clone();

        let chips = compose::fill_recipients(surface, &recipients, *timing).await?;
        compose::fill_subject(surface, &row.subject)?;
        compose::fill_body(surface, &row.body)?;
        if !session.attachments.is_empty() {
            compose::fill_attachments(surface, &session.attachments, *timing).await?;
        }

        Ok(FilledDraft {
            row_index: row.row_index,
            recipients,
            chips,
            subject: row.subject,
            body: row.body,
            attachments: session.attachments.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rejected_recipients_are_skippable() {
        let rejected = DraftError::RecipientRejected {
            row: 1,
            address: "nope".to_string(),
        };
        assert!(rejected.is_skippable());
        assert!(!DraftError::MissingEmail(1).is_skippable());
        assert!(!DraftError::Compose(ComposeError::FieldNotFound(
            crate::compose::FieldKind::Subject
        ))
        .is_skippable());
        assert!(!DraftError::Personalization(PersonalizationError::EmptyResponse).is_skippable());
    }

    #[test]
    fn errors_after_skips_keep_the_skipped_rows() {
        let bare = DraftError::after_skips(Vec::new(), DraftError::MissingEmail(3));
        assert!(matches!(bare, DraftError::MissingEmail(3)));
        assert!(bare.skipped().is_empty());

        let skipped = vec![
            SkippedRow {
                row_index: 0,
                reason: "bad".to_string(),
            },
            SkippedRow {
                row_index: 1,
                reason: "bad".to_string(),
            },
        ];
        let wrapped = DraftError::after_skips(
            skipped,
            DraftError::Storage(StoreError::Rejected("store is read-only".to_string())),
        );
        assert_eq!(wrapped.skipped().len(), 2);
        assert!(matches!(wrapped.cause(), DraftError::Storage(_)));
        assert_eq!(
            wrapped.to_string(),
            "Storage error: Storage rejected the write: store is read-only (skipped before it: row 1, row 2)"
        );
    }

    #[test]
    fn outcome_messages() {
        let mut outcome = AdvanceOutcome {
            filled: Some(FilledDraft {
                row_index: 0,
                recipients: vec!["a@x.com".to_string()],
                chips: 1,
                subject: "Hi".to_string(),
                body: "Yo".to_string(),
                attachments: 0,
            }),
            skipped: Vec::new(),
            cursor: 1,
            total_rows: 3,
            complete: false,
        };
        assert_eq!(outcome.message(), "Filled draft 1/3. 2 remaining.");

        outcome.skipped.push(SkippedRow {
            row_index: 1,
            reason: "bad".to_string(),
        });
        outcome.filled = None;
        outcome.complete = true;
        assert_eq!(outcome.message(), "All drafts completed! Skipped 1 row(s).");
    }
}
