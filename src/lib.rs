pub mod compose;
pub mod config;
pub mod credentials;
pub mod database;
pub mod driver;
pub mod import;
pub mod openai;
pub mod personalize;
pub mod session;
pub mod store;
pub mod surface;
pub mod template;
pub mod trigger;

// Re-export commonly used types
pub use compose::{FieldKind, FieldLocator, FieldWriter, FillTiming};
pub use config::Config;
pub use database::SqliteStore;
pub use driver::{AdvanceOutcome, DraftError, DraftFillDriver, DriverState, StartRequest};
pub use personalize::{PersonalizationGateway, TextGenerator};
pub use session::{AiSettings, Attachment, Row, Session, SessionStore, Templates};
pub use store::{KeyValueStore, MemoryStore, StoreError};
pub use surface::ComposeWindow;
pub use trigger::{Request, Response};
