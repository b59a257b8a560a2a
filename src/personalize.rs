//! One-sentence personalization for the `[insert specific info]` placeholder.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use crate::session::{AiSettings, PersonalizationCache, Row, Templates};
use crate::template::{self, INSERT_TOKEN};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You write a single concise, specific sentence that personalizes an outreach email. Reply with the sentence only.";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

const ONE_SENTENCE_INSTRUCTION: &str = "Write exactly one sentence that fits naturally where the insertion point is. Do not add a greeting, a sign-off, quotes, or any explanation.";

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub api_key: String,
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Upstream returned {}: {message}", .status.map(|s| s.to_string()).unwrap_or_else(|| "an error".to_string()))]
    Upstream { status: Option<u16>, message: String },

    #[error("Request failed: {0}")]
    Transport(String),
}

/// External text-generation collaborator.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}

#[async_trait]
impl<T: TextGenerator + ?Sized> TextGenerator for std::sync::Arc<T> {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        (**self).generate(request).await
    }
}

#[derive(Error, Debug)]
pub enum PersonalizationError {
    #[error("Personalization is not configured: {0}")]
    Configuration(String),

    #[error("Text generation timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("Text generation failed: {0}")]
    Gateway(#[from] GenerationError),

    #[error("Text generation returned an empty response")]
    EmptyResponse,
}

/// How a row's personalization was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Personalization {
    /// Not requested for this session
    Skipped,
    Cached,
    /// Freshly generated; the cache changed and should be persisted
    Generated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub system: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: 0.7,
            max_tokens: 80,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

pub struct PersonalizationGateway<G> {
    generator: G,
    options: GenerationOptions,
    cache: PersonalizationCache,
}

impl<G: TextGenerator> PersonalizationGateway<G> {
    pub fn new(generator: G, options: GenerationOptions) -> Self {
        Self {
            generator,
            options,
            cache: PersonalizationCache::new(),
        }
    }

    pub fn cache(&self) -> &PersonalizationCache {
        &self.cache
    }

    pub fn set_cache(&mut self, cache: PersonalizationCache) {
        self.cache = cache;
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    /// Make sure `row.personalized` is available when the session asks for
    /// it, then resolve the row's subject and body.
    ///
    /// On any error the row and the cache are left untouched.
    pub async fn ensure(
        &mut self,
        row: &mut Row,
        templates: &Templates,
        settings: Option<&AiSettings>,
    ) -> Result<Personalization, PersonalizationError> {
        let outcome = match settings {
            Some(settings) if settings.needs_personalization => {
                let key = row.cache_key();
                if let Some(cached) = self.cache.get(&key) {
                    log::debug!("Using cached personalization for {}", key);
                    row.personalized = cached.clone();
                    Personalization::Cached
                } else {
                    let sentence = self.generate(row, templates, settings).await?;
                    log::info!("Generated personalization for {}", key);
                    self.cache.insert(key, sentence.clone());
                    row.personalized = sentence;
                    Personalization::Generated
                }
            }
            _ => Personalization::Skipped,
        };

        row.subject = template::resolve(&templates.subject, row);
        row.body = template::resolve(&templates.body, row);
        Ok(outcome)
    }

    async fn generate(
        &self,
        row: &Row,
        templates: &Templates,
        settings: &AiSettings,
    ) -> Result<String, PersonalizationError> {
        if settings.api_key.trim().is_empty() {
            return Err(PersonalizationError::Configuration(
                "an API key is required".to_string(),
            ));
        }
        if settings.prompt_template.trim().is_empty() {
            return Err(PersonalizationError::Configuration(
                "a prompt template is required".to_string(),
            ));
        }

        let request = GenerationRequest {
            api_key: settings.api_key.clone(),
            system: self.options.system.clone(),
            prompt: build_prompt(&settings.prompt_template, row, templates),
            temperature: self.options.temperature,
            max_tokens: self.options.max_tokens,
        };

        // Dropping the future on timeout cancels the outbound request
        let text = tokio::time::timeout(self.options.timeout, self.generator.generate(&request))
            .await
            .map_err(|_| PersonalizationError::Timeout(self.options.timeout))??;

        if text.trim().is_empty() {
            return Err(PersonalizationError::EmptyResponse);
        }
        let sentence = normalize_sentence(&text);
        if sentence.is_empty() {
            return Err(PersonalizationError::EmptyResponse);
        }
        Ok(sentence)
    }
}

/// Build the user prompt, giving the model the email around the insertion point.
pub fn build_prompt(prompt_template: &str, row: &Row, templates: &Templates) -> String {
    let mut prompt = template::resolve_fields(prompt_template, row).trim().to_string();

    let subject = if template::contains_insert(&templates.subject) {
        templates.subject.clone()
    } else {
        template::resolve_fields(&templates.subject, row)
    };
    prompt.push_str("\n\nEmail subject: ");
    prompt.push_str(subject.trim());

    match template::split_at_insert(&templates.body) {
        Some((before, after)) => {
            let before = template::resolve_fields(before, row);
            let after = template::resolve_fields(after, row);
            prompt.push_str(&format!(
                "\nEmail text before {}: {}",
                INSERT_TOKEN,
                before.trim()
            ));
            prompt.push_str(&format!(
                "\nEmail text after {}: {}",
                INSERT_TOKEN,
                after.trim()
            ));
        }
        None => {
            let body = template::resolve_fields(&templates.body, row);
            prompt.push_str("\nEmail body: ");
            prompt.push_str(body.trim());
        }
    }

    prompt.push_str("\n\n");
    prompt.push_str(ONE_SENTENCE_INSTRUCTION);
    prompt
}

fn sentence_end() -> &'static Regex {
    static SENTENCE_END: OnceLock<Regex> = OnceLock::new();
    SENTENCE_END.get_or_init(|| Regex::new(r"[.!?]+\s").expect("valid sentence regex"))
}

/// Reduce generated text to exactly one sentence with terminal punctuation.
pub fn normalize_sentence(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let unquoted = collapsed
        .trim_matches(|c| c == '"' || c == '\u{201c}' || c == '\u{201d}')
        .trim();

    let first = match sentence_end().find(unquoted) {
        // Keep the punctuation, drop the whitespace after it
        Some(end) => unquoted[..end.end()].trim_end(),
        None => unquoted,
    };

    let mut sentence = first.trim().to_string();
    if !sentence.is_empty() && !sentence.ends_with(['.', '!', '?']) {
        sentence.push('.');
    }
    sentence
}
