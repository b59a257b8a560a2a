use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::error;

use draftmerge::config::Config;
use draftmerge::credentials::ApiKeyStore;
use draftmerge::database::SqliteStore;
use draftmerge::driver::{AdvanceOutcome, DraftFillDriver, StartRequest};
use draftmerge::import;
use draftmerge::openai::ChatCompletionsClient;
use draftmerge::personalize::PersonalizationGateway;
use draftmerge::session::{AiSettings, Attachment, SessionStore, Templates};
use draftmerge::surface::ComposeWindow;
use draftmerge::trigger::{Payload, Request, Response};

type CliDriver = DraftFillDriver<SqliteStore, ChatCompletionsClient, ComposeWindow>;

/// Fill personalized email drafts one row at a time
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to config file
    #[clap(short, long, default_value = "~/.config/draftmerge/config.json")]
    config: String,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a new session from a CSV file with name, email and company columns
    Start {
        /// CSV file to read recipients from
        #[clap(long)]
        csv: String,

        /// Subject template
        #[clap(long)]
        subject: Option<String>,

        /// Body template
        #[clap(long)]
        body: Option<String>,

        /// Prompt used to generate the personalized sentence
        #[clap(long)]
        prompt: Option<String>,

        /// Generate a personalized sentence for every row
        #[clap(long)]
        personalize: bool,

        /// File to attach to every draft
        #[clap(long)]
        attach: Vec<String>,

        /// Only set up the session; do not fill the first draft
        #[clap(long)]
        no_fill: bool,
    },

    /// Fill the next draft
    Next,

    /// Show session progress
    Status,

    /// Show data kept between sessions
    Saved,

    /// Discard progress and personalized sentences
    Reset,

    /// Store the text generation API key
    SetApiKey {
        #[clap(short, long)]
        key: String,
    },

    /// Remove the stored API key
    DeleteApiKey,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logger
    env_logger::Builder::new()
        .filter_level(if args.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    // Load configuration
    let config_path = shellexpand::tilde(&args.config).into_owned();
    let config = Config::load(&config_path).unwrap_or_else(|e| {
        println!("Could not load config at {} ({}). Using defaults.", config_path, e);
        Config::default()
    });
    if !Path::new(&config_path).exists() {
        if let Err(e) = config.save(&config_path) {
            println!("Failed to save config: {}", e);
        }
    }

    match args.command {
        Commands::SetApiKey { key } => {
            ApiKeyStore::new()?.store_api_key(key.trim())?;
            println!("API key saved.");
            return Ok(());
        }
        Commands::DeleteApiKey => {
            ApiKeyStore::new()?.delete_api_key()?;
            println!("API key removed.");
            return Ok(());
        }
        command => {
            let mut driver = build_driver(&config)?;
            let result = run_command(&mut driver, &config, command).await;
            if let Err(e) = &result {
                error!("Error: {:?}", e);
            }
            result
        }
    }
}

fn build_driver(config: &Config) -> Result<CliDriver> {
    let store = SqliteStore::new(Path::new(&config.store_path()))?;
    let generator = ChatCompletionsClient::new(
        config.generation.endpoint.clone(),
        config.generation.model.clone(),
    );
    let gateway = PersonalizationGateway::new(generator, config.generation.options());

    // Restored per command; `reset` and `saved` never decode the session
    Ok(DraftFillDriver::new(
        SessionStore::new(store),
        gateway,
        ComposeWindow::new(),
        config.timing.fill_timing(),
    ))
}

async fn run_command(
    driver: &mut CliDriver,
    config: &Config,
    command: Commands,
) -> Result<()> {
    let response = match command {
        Commands::Start {
            csv,
            subject,
            body,
            prompt,
            personalize,
            attach,
            no_fill,
        } => {
            let request =
                start_request(driver, config, &csv, subject, body, prompt, personalize, &attach)
                    .await?;
            if no_fill {
                let total = driver.start(request).await?;
                println!("Ready to fill {} drafts. Run `draftmerge next` to fill the first.", total);
                return Ok(());
            }
            driver.handle(Request::Start(request)).await
        }
        Commands::Next => driver.handle(Request::Advance).await,
        Commands::Status => {
            driver
                .restore()
                .await
                .context("Failed to restore draft session; `draftmerge reset` discards it")?;
            driver.handle(Request::Status).await
        }
        Commands::Saved => driver.handle(Request::SavedData).await,
        Commands::Reset => driver.handle(Request::Reset).await,
        Commands::SetApiKey { .. } | Commands::DeleteApiKey => return Ok(()),
    };

    report(driver, config, response)
}

#[allow(clippy::too_many_arguments)]
async fn start_request(
    driver: &CliDriver,
    config: &Config,
    csv_path: &str,
    subject: Option<String>,
    body: Option<String>,
    prompt: Option<String>,
    personalize: bool,
    attach: &[String],
) -> Result<StartRequest> {
    let csv_path = shellexpand::tilde(csv_path).into_owned();
    let text = std::fs::read_to_string(&csv_path)
        .with_context(|| format!("Failed to read CSV file {}", csv_path))?;
    let table = import::parse_csv(&text).with_context(|| format!("Invalid CSV file {}", csv_path))?;
    driver
        .store()
        .save_table(&table)
        .await
        .context("Failed to save CSV data")?;
    log::info!("Loaded {} rows from {}", table.len(), csv_path);

    // Fall back to the templates of the previous session, then the config
    let saved = driver.saved_data().await?;
    let previous = saved.templates.unwrap_or_else(|| config.templates.clone());
    let templates = Templates {
        subject: subject.unwrap_or(previous.subject),
        body: body.unwrap_or(previous.body),
    };
    driver
        .store()
        .save_templates(&templates)
        .await
        .context("Failed to save templates")?;

    let ai_settings = if personalize {
        let api_key = ApiKeyStore::new()?.resolve()?.unwrap_or_default();
        if api_key.is_empty() {
            println!("No API key stored. Run `draftmerge set-api-key --key <KEY>` first.");
        }
        Some(AiSettings {
            api_key,
            prompt_template: prompt.unwrap_or_else(|| config.generation.prompt_template.clone()),
            needs_personalization: true,
        })
    } else {
        None
    };

    let attachments = attach
        .iter()
        .map(|path| Attachment::from_path(path))
        .collect::<Result<Vec<_>>>()?;

    Ok(StartRequest {
        rows: import::rows_from_table(&table),
        table,
        templates,
        ai_settings,
        attachments,
    })
}

fn report(driver: &CliDriver, config: &Config, response: Response) -> Result<()> {
    if !response.success {
        anyhow::bail!(response.error.unwrap_or_else(|| "Unknown error".to_string()));
    }
    if let Some(message) = &response.message {
        println!("{}", message);
    }

    match &response.data {
        Some(Payload::Outcome(outcome)) => save_draft(driver, config, outcome)?,
        Some(Payload::Saved(saved)) => {
            match &saved.table {
                Some(table) => println!("CSV rows: {}", table.len()),
                None => println!("CSV rows: none"),
            }
            if let Some(templates) = &saved.templates {
                println!("Subject template: {}", templates.subject);
                println!("Body template:\n{}", templates.body);
            }
            if let Some(settings) = &saved.ai_settings {
                println!("Personalization prompt: {}", settings.prompt_template);
            }
            for attachment in &saved.attachments {
                println!("Attachment: {} ({})", attachment.name, attachment.mime_type);
            }
            println!("Active session: {}", if saved.has_active_session { "yes" } else { "no" });
        }
        Some(Payload::Status(_)) | None => {}
    }
    Ok(())
}

fn save_draft(driver: &CliDriver, config: &Config, outcome: &AdvanceOutcome) -> Result<()> {
    for skipped in &outcome.skipped {
        println!("Skipped row {}: {}", skipped.row_index + 1, skipped.reason);
    }
    if let Some(filled) = &outcome.filled {
        let drafts_dir = config.drafts_dir();
        let stem = format!("draft-{}", filled.row_index + 1);
        let path = driver
            .surface()
            .save_eml(Path::new(&drafts_dir), &stem, &config.sender)?;
        println!("Draft for {} saved to {}", filled.recipients.join(", "), path.display());
    }
    Ok(())
}
