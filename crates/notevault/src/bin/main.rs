//! NoteVault CLI

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use notevault::prelude::*;
use serde::Deserialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// NoteVault - versions, branches and edit history for markdown notes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Vault directory
    #[arg(short, long, env = "NOTEVAULT_VAULT", global = true)]
    vault: Option<PathBuf>,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Configuration profile (development, production, minimal)
    #[arg(short, long, default_value = "production", global = true)]
    profile: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Human, global = true)]
    log_format: LogFormat,

    /// Overrides the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Save a version of a document
    Save {
        doc: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Save even if nothing changed
        #[arg(long)]
        force: bool,
        /// Also record an edit in the edit history
        #[arg(long)]
        edit: bool,
    },
    /// List the versions of a document's current branch
    History { doc: String },
    /// Overwrite a document with one of its versions
    Restore { doc: String, version_id: String },
    /// Recover orphans and consolidate duplicate notes
    Cleanup,
    /// Verify the edit history of a document
    Verify {
        doc: String,
        /// Repair stored hashes that no longer match
        #[arg(long)]
        fix: bool,
    },
    /// Print a version in another format
    Export {
        doc: String,
        version_id: String,
        #[arg(long, default_value = "markdown")]
        format: String,
    },
    /// Show the timeline of a document's branch
    Timeline {
        doc: String,
        #[arg(long)]
        branch: Option<String>,
        /// Use the edit history instead of saved versions
        #[arg(long)]
        edits: bool,
    },
}

/// Settings a config file or `NOTEVAULT_*` variables may override
#[derive(Debug, Default, Deserialize)]
struct Overrides {
    vault_root: Option<PathBuf>,
    db_root: Option<PathBuf>,
    note_id_key: Option<String>,
    legacy_note_id_keys: Option<Vec<String>>,
    cleanup_interval_secs: Option<u64>,
    verification_batch_size: Option<usize>,
    log_level: Option<String>,
    max_versions_per_branch: Option<u32>,
    auto_cleanup_old_versions: Option<bool>,
    auto_cleanup_days: Option<u32>,
    enable_edit_history: Option<bool>,
    edit_full_snapshot_interval: Option<u32>,
}

impl Overrides {
    fn load(file: Option<&PathBuf>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file.as_path()).required(true));
        }
        let overrides = builder
            .add_source(config::Environment::with_prefix("NOTEVAULT").try_parsing(true))
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        Ok(overrides)
    }

    fn apply(self, config: &mut VersionControlConfig) {
        if let Some(v) = self.vault_root {
            config.vault_root = v;
        }
        if let Some(v) = self.db_root {
            config.db_root = v;
        }
        if let Some(v) = self.note_id_key {
            config.note_id_key = v;
        }
        if let Some(v) = self.legacy_note_id_keys {
            config.legacy_note_id_keys = v;
        }
        if let Some(v) = self.cleanup_interval_secs {
            config.cleanup_interval_secs = v;
        }
        if let Some(v) = self.verification_batch_size {
            config.verification_batch_size = v;
        }
        if let Some(v) = self.log_level {
            config.log_level = v;
        }
        let settings = &mut config.default_settings;
        if let Some(v) = self.max_versions_per_branch {
            settings.max_versions_per_branch = v;
        }
        if let Some(v) = self.auto_cleanup_old_versions {
            settings.auto_cleanup_old_versions = v;
        }
        if let Some(v) = self.auto_cleanup_days {
            settings.auto_cleanup_days = v;
        }
        if let Some(v) = self.enable_edit_history {
            settings.enable_edit_history = v;
        }
        if let Some(v) = self.edit_full_snapshot_interval {
            settings.edit_full_snapshot_interval = v;
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<VersionControlConfig> {
    let profile: ConfigProfile = args.profile.parse().map_err(anyhow::Error::msg)?;
    let mut config = profile.create_config(".");
    Overrides::load(args.config.as_ref())?.apply(&mut config);
    if let Some(vault) = &args.vault {
        config.vault_root = vault.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    config.validate()?;
    Ok(config)
}

fn init_logging(format: LogFormat, level: &str) -> anyhow::Result<()> {
    match format {
        LogFormat::Human => {
            env_logger::Builder::new()
                .parse_filters(&level.to_ascii_lowercase())
                .parse_default_env()
                .format_timestamp_millis()
                .try_init()
                .context("Failed to initialize logger")?;
        }
        LogFormat::Json => {
            let filter = EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(level.to_ascii_lowercase()))
                .context("Invalid log filter")?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .context("Failed to initialize logger")?;
        }
    }
    Ok(())
}

/// Note id of a document that must already be versioned
async fn known_note_id(vault: &NoteVault, doc: &str) -> anyhow::Result<String> {
    match vault.find_note_id(doc).await? {
        Some(id) => Ok(id),
        None => bail!("{} has no version history", doc),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(args.log_format, &config.log_level)?;

    log::debug!("NoteVault v{} ({})", env!("CARGO_PKG_VERSION"), args.profile);
    let vault = NoteVault::open(config)
        .await
        .context("Failed to open vault")?;

    match args.command {
        Command::Save {
            doc,
            name,
            tags,
            force,
            edit,
        } => {
            let options = SaveOptions {
                name,
                tags: (!tags.is_empty()).then_some(tags),
                force,
            };
            match vault.save_new_version_for_file(&doc, options).await? {
                SaveOutcome::Saved {
                    version_id,
                    version_number,
                    ..
                } => println!("Saved {} as #{} ({})", doc, version_number, version_id),
                SaveOutcome::Duplicate { version_id, .. } => {
                    println!("{} unchanged since {}", doc, version_id)
                }
            }
            if edit && let Some(record) = vault.save_edit(&doc).await? {
                println!(
                    "Recorded edit #{} ({})",
                    record.version_number,
                    record.storage_type.as_str()
                );
            }
        }
        Command::History { doc } => {
            let note_id = known_note_id(&vault, &doc).await?;
            for version in vault.get_version_history(&note_id).await? {
                println!(
                    "#{:<4} {}  {}  {} bytes{}",
                    version.version_number,
                    version.id,
                    version.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    version.size,
                    version.name.map(|n| format!("  {}", n)).unwrap_or_default()
                );
            }
        }
        Command::Restore { doc, version_id } => {
            let note_id = known_note_id(&vault, &doc).await?;
            vault.restore_version(&doc, &note_id, &version_id).await?;
            println!("Restored {} to {}", doc, version_id);
        }
        Command::Cleanup => {
            let report = vault.cleanup_orphaned_versions().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Verify { doc, fix } => {
            let note_id = known_note_id(&vault, &doc).await?;
            let reports = vault.verify_edit_history(&note_id, fix).await?;
            let mut clean = true;
            for (branch, report) in &reports {
                clean &= report.is_clean();
                println!(
                    "{}: {} checked, {} valid, {} repaired, {} mismatched, {} unreadable",
                    branch,
                    report.checked,
                    report.valid,
                    report.repaired.len(),
                    report.mismatched.len(),
                    report.unreadable.len()
                );
            }
            if !clean {
                bail!("Edit history of {} failed verification", doc);
            }
        }
        Command::Export {
            doc,
            version_id,
            format,
        } => {
            let note_id = known_note_id(&vault, &doc).await?;
            let format: ExportFormat = format.parse()?;
            print!("{}", vault.export_version(&note_id, &version_id, format).await?);
        }
        Command::Timeline { doc, branch, edits } => {
            let note_id = known_note_id(&vault, &doc).await?;
            let source = if edits {
                HistorySource::Edit
            } else {
                HistorySource::Version
            };
            let events = vault
                .get_or_generate_timeline(&note_id, branch.as_deref(), source)
                .await?;
            for event in events {
                println!(
                    "#{:<4} {}  +{} -{}{}",
                    event.to_version_number,
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.stats.additions,
                    event.stats.deletions,
                    event.name.map(|n| format!("  {}", n)).unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}
