//! Capability interface to the compose UI and the routines that fill it.
//!
//! The host UI is treated as unreliable: every lookup walks an ordered list of
//! candidate selectors and fails with [`ComposeError::FieldNotFound`] when none
//! of them matches.

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use crate::session::Attachment;

pub const RECIPIENT_SELECTORS: &[&str] = &[
    r#"textarea[name="to"]"#,
    r#"input[name="to"]"#,
    r#"textarea[aria-label="To"]"#,
    r#"input[aria-label="To"]"#,
    r#"div[aria-label="To"]"#,
    r#"div[aria-label^="To "]"#,
    r#"div[aria-label*="Add recipients"]"#,
    r#"div[role="combobox"][aria-label*="Recipients"]"#,
    r#".oj div[role="textbox"]"#,
    r#".oj div[contenteditable="true"]"#,
];

pub const SUBJECT_SELECTORS: &[&str] = &[
    r#"input[name="subjectbox"]"#,
    r#"input[placeholder*="Subject"]"#,
    r#"input[aria-label*="Subject"]"#,
    r#".aoT[role="textbox"]"#,
    r#"div[aria-label*="Subject"]"#,
    r#"input[placeholder*="subject"]"#,
    r#"input[aria-label*="subject"]"#,
    r#"div[aria-label*="subject"]"#,
    ".aoT",
    r#"input[type="text"]"#,
];

pub const BODY_SELECTORS: &[&str] = &[
    r#"div[contenteditable="true"][role="textbox"]"#,
    r#"div[aria-label*="Message Body"]"#,
    r#"div[aria-label*="Compose"]"#,
    ".Am.Al.editable",
    r#"[role="textbox"]"#,
    r#"div[contenteditable="true"]"#,
    r#"div[aria-label*="message"]"#,
    r#"div[aria-label*="body"]"#,
    r#"div[aria-label*="Message"]"#,
    ".Am.Al",
    "div[contenteditable]",
    r#"div[role="textbox"][contenteditable]"#,
];

pub const FILE_INPUT_SELECTORS: &[&str] = &[
    r#"input[type="file"][name="Filedata"]"#,
    r#"input[type="file"][multiple]"#,
    r#"input[type="file"]"#,
];

/// Matches one materialized recipient chip
pub const RECIPIENT_CHIP_SELECTOR: &str = r#"div[role="listitem"][data-hovercard-id]"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Recipients,
    Subject,
    Body,
    FileInput,
}

impl FieldKind {
    pub fn label(&self) -> &'static str {
        match self {
            FieldKind::Recipients => "Recipient",
            FieldKind::Subject => "Subject",
            FieldKind::Body => "Body",
            FieldKind::FileInput => "Attachment input",
        }
    }

    pub fn selectors(&self) -> &'static [&'static str] {
        match self {
            FieldKind::Recipients => RECIPIENT_SELECTORS,
            FieldKind::Subject => SUBJECT_SELECTORS,
            FieldKind::Body => BODY_SELECTORS,
            FieldKind::FileInput => FILE_INPUT_SELECTORS,
        }
    }
}

/// A located field, identified by the selector that matched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldHandle {
    pub kind: FieldKind,
    pub selector: String,
}

#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("{} field not found", .0.label())]
    FieldNotFound(FieldKind),

    #[error("Compose window rejected input for {field}: {message}")]
    Rejected { field: String, message: String },
}

pub trait FieldLocator {
    /// First element matching any of `candidates`, tried in order.
    fn find(&self, kind: FieldKind, candidates: &[&str]) -> Result<FieldHandle, ComposeError>;

    fn count(&self, selector: &str) -> usize;
}

pub trait FieldWriter {
    fn set_value(&mut self, field: &FieldHandle, text: &str) -> Result<(), ComposeError>;

    fn set_html(&mut self, field: &FieldHandle, html: &str) -> Result<(), ComposeError>;

    /// Simulate the keystroke that turns typed addresses into chips.
    fn commit(&mut self, field: &FieldHandle) -> Result<(), ComposeError>;

    fn clear_recipients(&mut self) -> Result<(), ComposeError>;

    fn remove_attachments(&mut self) -> Result<(), ComposeError>;

    fn attach(
        &mut self,
        field: &FieldHandle,
        name: &str,
        mime_type: &str,
        data: &[u8],
    ) -> Result<(), ComposeError>;
}

/// Delays that let the host UI settle between simulated input events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillTiming {
    pub settle: Duration,
    pub chip: Duration,
}

impl Default for FillTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(50),
            chip: Duration::from_millis(150),
        }
    }
}

impl FillTiming {
    pub fn immediate() -> Self {
        Self {
            settle: Duration::ZERO,
            chip: Duration::ZERO,
        }
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        sleep(delay).await;
    }
}

pub fn locate<U: FieldLocator + ?Sized>(ui: &U, kind: FieldKind) -> Result<FieldHandle, ComposeError> {
    let field = ui.find(kind, kind.selectors())?;
    log::debug!("Found {} field: {}", kind.label(), field.selector);
    Ok(field)
}

/// Split a comma-separated address list, dropping blanks.
pub fn split_recipients(email: &str) -> Vec<String> {
    email
        .split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fill the recipient field and commit the addresses into chips.
///
/// Returns the number of chips present afterwards. A count that differs from
/// the number of addresses is logged, not treated as a failure.
pub async fn fill_recipients<U>(
    ui: &mut U,
    recipients: &[String],
    timing: FillTiming,
) -> Result<usize, ComposeError>
where
    U: FieldLocator + FieldWriter + ?Sized,
{
    let field = locate(ui, FieldKind::Recipients)?;

    ui.clear_recipients()?;
    ui.set_value(&field, &recipients.join(", "))?;
    pause(timing.settle).await;

    ui.commit(&field)?;
    pause(timing.chip).await;

    let chips = ui.count(RECIPIENT_CHIP_SELECTOR);
    if chips != recipients.len() {
        log::warn!(
            "Expected {} recipient chips but found {}",
            recipients.len(),
            chips
        );
    }
    Ok(chips)
}

pub fn fill_subject<U>(ui: &mut U, subject: &str) -> Result<(), ComposeError>
where
    U: FieldLocator + FieldWriter + ?Sized,
{
    let field = locate(ui, FieldKind::Subject)?;
    ui.set_value(&field, subject)
}

pub fn fill_body<U>(ui: &mut U, body: &str) -> Result<(), ComposeError>
where
    U: FieldLocator + FieldWriter + ?Sized,
{
    let field = locate(ui, FieldKind::Body)?;
    ui.set_html(&field, &body_to_html(body))
}

pub fn body_to_html(body: &str) -> String {
    body.replace("\r\n", "\n").replace('\n', "<br>")
}

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("Attachment '{name}' is not valid base64: {source}")]
    Decode {
        name: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error(transparent)]
    Compose(#[from] ComposeError),
}

/// Replace whatever is attached with `attachments`.
pub async fn fill_attachments<U>(
    ui: &mut U,
    attachments: &[Attachment],
    timing: FillTiming,
) -> Result<(), AttachError>
where
    U: FieldLocator + FieldWriter + ?Sized,
{
    ui.remove_attachments()?;
    pause(timing.settle).await;

    let field = locate(ui, FieldKind::FileInput)?;
    for attachment in attachments {
        let data = attachment.decode().map_err(|source| AttachError::Decode {
            name: attachment.name.clone(),
            source,
        })?;
        ui.attach(&field, &attachment.name, &attachment.mime_type, &data)?;
        log::debug!("Attached {} ({} bytes)", attachment.name, data.len());
        pause(timing.settle).await;
    }
    Ok(())
}
