use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MessageAttachment, Mailbox, MultiPart};
use lettre::Message;

use crate::compose::{
    ComposeError, FieldHandle, FieldKind, FieldLocator, FieldWriter, RECIPIENT_CHIP_SELECTOR,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedFile {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// In-memory compose window.
///
/// Recognises one selector per field kind (the first of each default list
/// unless overridden), so a window built without a field behaves like a page
/// that has not finished loading.
#[derive(Debug, Clone)]
pub struct ComposeWindow {
    selectors: HashMap<String, FieldKind>,
    pub recipient_text: String,
    pub chips: Vec<String>,
    pub subject: String,
    pub body_html: String,
    pub attachments: Vec<AttachedFile>,
}

impl Default for ComposeWindow {
    fn default() -> Self {
        Self::with_fields(&[
            FieldKind::Recipients,
            FieldKind::Subject,
            FieldKind::Body,
            FieldKind::FileInput,
        ])
    }
}

impl ComposeWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fields(kinds: &[FieldKind]) -> Self {
        let mut window = Self::empty();
        for kind in kinds {
            if let Some(selector) = kind.selectors().first() {
                window.selectors.insert(selector.to_string(), *kind);
            }
        }
        window
    }

    fn empty() -> Self {
        Self {
            selectors: HashMap::new(),
            recipient_text: String::new(),
            chips: Vec::new(),
            subject: String::new(),
            body_html: String::new(),
            attachments: Vec::new(),
        }
    }

    /// Expose `kind` under a specific selector instead of the default one.
    pub fn expose(&mut self, kind: FieldKind, selector: &str) {
        self.selectors.retain(|_, k| *k != kind);
        self.selectors.insert(selector.to_string(), kind);
    }

    pub fn hide(&mut self, kind: FieldKind) {
        self.selectors.retain(|_, k| *k != kind);
    }

    /// Plain-text rendition of the body.
    pub fn body_text(&self) -> String {
        self.body_html.replace("<br>", "\n")
    }

    /// Reset every field, as when the draft is closed and a new one opened.
    pub fn clear(&mut self) {
        self.recipient_text.clear();
        self.chips.clear();
        self.subject.clear();
        self.body_html.clear();
        self.attachments.clear();
    }

    fn check(&self, field: &FieldHandle) -> Result<(), ComposeError> {
        match self.selectors.get(&field.selector) {
            Some(kind) if *kind == field.kind => Ok(()),
            _ => Err(ComposeError::FieldNotFound(field.kind)),
        }
    }

    pub fn to_message(&self, from: &str) -> Result<Message> {
        let from: Mailbox = from
            .parse()
            .with_context(|| format!("Invalid sender address: {}", from))?;

        let mut builder = Message::builder().from(from).subject(self.subject.clone());
        for chip in &self.chips {
            let to: Mailbox = chip
                .parse()
                .with_context(|| format!("Invalid recipient address: {}", chip))?;
            builder = builder.to(to);
        }

        let mut parts = MultiPart::mixed().multipart(MultiPart::alternative_plain_html(
            self.body_text(),
            self.body_html.clone(),
        ));
        for file in &self.attachments {
            let content_type = ContentType::parse(&file.mime_type)
                .with_context(|| format!("Invalid content type: {}", file.mime_type))?;
            parts = parts.singlepart(
                MessageAttachment::new(file.name.clone()).body(file.data.clone(), content_type),
            );
        }

        builder
            .multipart(parts)
            .context("Failed to build draft message")
    }

    /// Write the current draft as `<dir>/<stem>.eml`.
    pub fn save_eml(&self, dir: &Path, stem: &str, from: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create drafts directory: {:?}", dir))?;
        let path = dir.join(format!("{}.eml", stem));
        let message = self.to_message(from)?;
        std::fs::write(&path, message.formatted())
            .with_context(|| format!("Failed to write draft: {:?}", path))?;
        log::info!("Draft written to {:?}", path);
        Ok(path)
    }
}

impl FieldLocator for ComposeWindow {
    fn find(&self, kind: FieldKind, candidates: &[&str]) -> Result<FieldHandle, ComposeError> {
        candidates
            .iter()
            .find(|selector| self.selectors.get(**selector) == Some(&kind))
            .map(|selector| FieldHandle {
                kind,
                selector: selector.to_string(),
            })
            .ok_or(ComposeError::FieldNotFound(kind))
    }

    fn count(&self, selector: &str) -> usize {
        if selector == RECIPIENT_CHIP_SELECTOR {
            self.chips.len()
        } else {
            self.selectors.contains_key(selector) as usize
        }
    }
}

impl FieldWriter for ComposeWindow {
    fn set_value(&mut self, field: &FieldHandle, text: &str) -> Result<(), ComposeError> {
        self.check(field)?;
        match field.kind {
            FieldKind::Recipients => self.recipient_text = text.to_string(),
            FieldKind::Subject => self.subject = text.to_string(),
            FieldKind::Body => self.body_html = text.to_string(),
            FieldKind::FileInput => {
                return Err(ComposeError::Rejected {
                    field: field.selector.clone(),
                    message: "file inputs do not accept text".to_string(),
                })
            }
        }
        Ok(())
    }

    fn set_html(&mut self, field: &FieldHandle, html: &str) -> Result<(), ComposeError> {
        self.set_value(field, html)
    }

    fn commit(&mut self, field: &FieldHandle) -> Result<(), ComposeError> {
        self.check(field)?;
        let typed = std::mem::take(&mut self.recipient_text);
        let mut leftover = Vec::new();
        for addr in typed.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            // Only well-formed addresses turn into chips, keyed by the bare address
            match Mailbox::from_str(addr) {
                Ok(mailbox) => self.chips.push(mailbox.email.to_string()),
                Err(_) => leftover.push(addr),
            }
        }
        self.recipient_text = leftover.join(", ");
        Ok(())
    }

    fn clear_recipients(&mut self) -> Result<(), ComposeError> {
        self.chips.clear();
        self.recipient_text.clear();
        Ok(())
    }

    fn remove_attachments(&mut self) -> Result<(), ComposeError> {
        self.attachments.clear();
        Ok(())
    }

    fn attach(
        &mut self,
        field: &FieldHandle,
        name: &str,
        mime_type: &str,
        data: &[u8],
    ) -> Result<(), ComposeError> {
        self.check(field)?;
        if field.kind != FieldKind::FileInput {
            return Err(ComposeError::Rejected {
                field: field.selector.clone(),
                message: "not a file input".to_string(),
            });
        }
        self.attachments.push(AttachedFile {
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            data: data.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::{fill_body, fill_recipients, fill_subject, FillTiming};

    #[test]
    fn find_walks_candidates_in_order() {
        let mut window = ComposeWindow::with_fields(&[]);
        window.expose(FieldKind::Subject, r#"input[aria-label*="Subject"]"#);

        let field = window
            .find(FieldKind::Subject, FieldKind::Subject.selectors())
            .unwrap();
        assert_eq!(field.selector, r#"input[aria-label*="Subject"]"#);
        assert!(matches!(
            window.find(FieldKind::Body, FieldKind::Body.selectors()),
            Err(ComposeError::FieldNotFound(FieldKind::Body))
        ));
    }

    #[tokio::test]
    async fn commit_turns_valid_addresses_into_chips() {
        let mut window = ComposeWindow::new();
        let recipients = vec!["p@x.com".to_string(), "not an address".to_string()];

        let chips = fill_recipients(&mut window, &recipients, FillTiming::immediate())
            .await
            .unwrap();

        assert_eq!(chips, 1);
        assert_eq!(window.chips, vec!["p@x.com".to_string()]);
        assert_eq!(window.recipient_text, "not an address");
    }

    #[tokio::test]
    async fn display_names_commit_as_bare_addresses() {
        let mut window = ComposeWindow::new();
        let recipients = vec!["Al Smith <a@x.com>".to_string()];

        let chips = fill_recipients(&mut window, &recipients, FillTiming::immediate())
            .await
            .unwrap();

        assert_eq!(chips, 1);
        assert_eq!(window.chips, vec!["a@x.com".to_string()]);
        assert!(window.recipient_text.is_empty());
    }

    #[tokio::test]
    async fn renders_draft_as_eml() {
        let mut window = ComposeWindow::new();
        fill_recipients(&mut window, &["a@x.com".to_string()], FillTiming::immediate())
            .await
            .unwrap();
        fill_subject(&mut window, "Hi Al").unwrap();
        fill_body(&mut window, "Line one\nLine two").unwrap();
        let file = window.find(FieldKind::FileInput, FieldKind::FileInput.selectors()).unwrap();
        window.attach(&file, "notes.txt", "text/plain", b"hello").unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = window.save_eml(dir.path(), "draft-1", "me@example.com").unwrap();
        let raw = String::from_utf8(std::fs::read(path).unwrap()).unwrap();

        assert!(raw.contains("Subject: Hi Al"));
        assert!(raw.contains("To: a@x.com"));
        assert!(raw.contains("Line one<br>Line two"));
        assert!(raw.contains("notes.txt"));
    }
}
