use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compose::FillTiming;
use crate::openai::{DEFAULT_ENDPOINT, DEFAULT_MODEL};
use crate::personalize::{GenerationOptions, DEFAULT_SYSTEM_PROMPT};
use crate::session::Templates;

pub const DEFAULT_SUBJECT_TEMPLATE: &str = "Hello [name], regarding [company]";
pub const DEFAULT_BODY_TEMPLATE: &str = "Dear [name],

I hope this email finds you well. I'm reaching out regarding [company] and would like to discuss potential opportunities.

I would appreciate the opportunity to connect with you and learn more about your current initiatives.

Best regards,
[Your Name]";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Failed to create config directory")]
    CreateDirError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub system_prompt: String,
    /// Prompt used when `start` is not given one
    pub prompt_template: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: 80,
            timeout_secs: 20,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            prompt_template: "Write one specific, friendly sentence about why [company] caught my attention."
                .to_string(),
        }
    }
}

impl GenerationConfig {
    pub fn options(&self) -> GenerationOptions {
        GenerationOptions {
            system: self.system_prompt.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub settle_ms: u64,
    pub chip_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_ms: 50,
            chip_ms: 150,
        }
    }
}

impl TimingConfig {
    pub fn fill_timing(&self) -> FillTiming {
        FillTiming {
            settle: Duration::from_millis(self.settle_ms),
            chip: Duration::from_millis(self.chip_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store_path: String,
    pub drafts_dir: String,
    /// From address written into rendered drafts
    pub sender: String,
    pub templates: Templates,
    pub generation: GenerationConfig,
    pub timing: TimingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: "~/.local/share/draftmerge/store.db".to_string(),
            drafts_dir: "~/.local/share/draftmerge/drafts".to_string(),
            sender: "drafts@localhost".to_string(),
            templates: Templates {
                subject: DEFAULT_SUBJECT_TEMPLATE.to_string(),
                body: DEFAULT_BODY_TEMPLATE.to_string(),
            },
            generation: GenerationConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let path = Path::new(path);

        // If the file doesn't exist, return default config
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;

        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        let path = Path::new(path);

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| ConfigError::CreateDirError)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    pub fn store_path(&self) -> String {
        shellexpand::tilde(&self.store_path).into_owned()
    }

    pub fn drafts_dir(&self) -> String {
        shellexpand::tilde(&self.drafts_dir).into_owned()
    }
}
