// Media Migrator CLI binary

use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{Context as _, Result};
use clap::{ArgGroup, Parser, Subcommand};

use media_migrator::db::SqliteStore;
use media_migrator::encoder::FfmpegEncoder;
use media_migrator::logger::Logger;
use media_migrator::{
    BatchState, Controller, ItemOutcome, MediaItem, MigrationObserver, Settings, SettingsOverride,
    TargetFormat, UploadDir,
};

#[derive(Parser)]
#[command(name = "migrator")]
#[command(about = "Media Migrator - convert a media library to WebP/AVIF and relink every reference", long_about = None)]
#[command(version)]
struct Cli {
    /// Site database
    #[arg(long, env = "MIGRATOR_DB", default_value = "migrator.db", global = true)]
    db: PathBuf,

    /// Upload directory on disk
    #[arg(long, env = "MIGRATOR_UPLOADS", global = true)]
    uploads: Option<PathBuf>,

    /// Public URL the upload directory is served under
    #[arg(long, env = "MIGRATOR_BASE_URL", global = true)]
    base_url: Option<String>,

    /// Append structured log records (JSON lines) to this file
    #[arg(long, env = "MIGRATOR_LOG_FILE", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write default settings
    Init,

    /// Start or resume a batch and run it to the end
    Run {
        /// Items per tick
        #[arg(long)]
        batch: Option<usize>,
        /// Delete originals right away instead of quarantining them
        #[arg(long)]
        no_validate: bool,
        /// Commit each quarantined item as soon as it succeeds
        #[arg(long)]
        auto_commit: bool,
        /// Encoder quality (1-100)
        #[arg(long)]
        quality: Option<u8>,
        /// Target format: webp or avif
        #[arg(long)]
        format: Option<String>,
        /// Downscale to fit this width (0 = unlimited)
        #[arg(long)]
        max_width: Option<u32>,
        /// Downscale to fit this height (0 = unlimited)
        #[arg(long)]
        max_height: Option<u32>,
        /// Detach and keep running after this command exits
        #[arg(long)]
        background: bool,
    },

    /// Ask a running batch to stop after the current item
    Stop,

    /// Show batch progress and item counts
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete quarantined originals
    #[command(group(ArgGroup::new("target").required(true).args(["id", "all"])))]
    Commit {
        /// Media item id
        #[arg(long)]
        id: Option<i64>,
        /// Every quarantined item
        #[arg(long)]
        all: bool,
    },

    /// Restore a quarantined item to its original state
    Rollback {
        /// Media item id
        #[arg(long)]
        id: i64,
    },

    /// Send a failed item back to the queue
    Retry {
        /// Media item id
        #[arg(long)]
        id: i64,
    },

    /// Forget the batch state (item statuses and backups are kept)
    Clear,

    /// Show the change report of one item
    Report {
        /// Media item id
        #[arg(long)]
        id: i64,
    },

    /// Show or change stored settings
    Settings {
        #[command(subcommand)]
        action: Option<SettingsAction>,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print stored settings as JSON
    Show,
    /// Set one field; the value is parsed as JSON, or taken as a string
    Set { key: String, value: String },
}

/// Prints one line per item as the batch advances.
struct ProgressPrinter;

impl MigrationObserver for ProgressPrinter {
    fn on_item_start(&self, item: &MediaItem) {
        log::debug!("Processing item {} ({})", item.id, item.meta.file);
    }

    fn on_item_end(&self, item: &MediaItem, outcome: &ItemOutcome) {
        match &outcome.error {
            Some(error) => println!("  #{:<6} {:<16} {} ({})", item.id, outcome.status, item.meta.file, error),
            None => println!("  #{:<6} {:<16} {}", item.id, outcome.status, item.meta.file),
        }
    }

    fn on_progress(&self, state: &BatchState) {
        log::info!("{}/{} processed, {} failed", state.processed.len(), state.total, state.failed.len());
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Init => cmd_init(&cli),
        Commands::Run { background: true, .. } => cmd_run_background(&cli),
        Commands::Run {
            batch,
            no_validate,
            auto_commit,
            quality,
            format,
            max_width,
            max_height,
            background: false,
        } => {
            let target_format = match format {
                Some(f) => Some(TargetFormat::parse(f).ok_or_else(|| anyhow::anyhow!("Unknown format '{}'", f))?),
                None => None,
            };
            let overrides = SettingsOverride {
                batch_size: *batch,
                validate: no_validate.then_some(false),
                auto_commit: auto_commit.then_some(true),
                quality: *quality,
                target_format,
                preserve_dimensions: (max_width.is_some() || max_height.is_some()).then_some(false),
                max_width: *max_width,
                max_height: *max_height,
                ..Default::default()
            };
            cmd_run(&cli, &overrides)
        }
        Commands::Stop => cmd_stop(&cli),
        Commands::Status { json } => cmd_status(&cli, *json),
        Commands::Commit { id, all } => cmd_commit(&cli, *id, *all),
        Commands::Rollback { id } => cmd_rollback(&cli, *id),
        Commands::Retry { id } => cmd_retry(&cli, *id),
        Commands::Clear => cmd_clear(&cli),
        Commands::Report { id } => cmd_report(&cli, *id),
        Commands::Settings { action } => cmd_settings(&cli, action.as_ref()),
    }
}

/// Commands that move files or rewrite URLs need the upload directory and
/// base URL; the rest only read state.
fn open_controller(cli: &Cli, needs_site: bool) -> Result<Controller> {
    let uploads = match (&cli.uploads, &cli.base_url) {
        (Some(dir), Some(url)) => {
            if !dir.is_dir() {
                anyhow::bail!("Upload directory does not exist: {}", dir.display());
            }
            UploadDir::new(dir, url.as_str())
        }
        _ if needs_site => anyhow::bail!("--uploads and --base-url (or MIGRATOR_UPLOADS / MIGRATOR_BASE_URL) are required"),
        (dir, url) => UploadDir::new(
            dir.clone().unwrap_or_else(|| PathBuf::from(".")),
            url.clone().unwrap_or_default(),
        ),
    };

    let store = SqliteStore::open(&cli.db).with_context(|| format!("Cannot open database {}", cli.db.display()))?;

    let mut logger = Logger::default();
    if let Some(path) = &cli.log_file {
        logger = logger.with_file_sink(path);
    }

    Ok(Controller::new(Box::new(store), Box::new(FfmpegEncoder::new()), uploads, logger))
}

fn cmd_init(cli: &Cli) -> Result<()> {
    let controller = open_controller(cli, false)?;
    let settings = controller.init()?;
    println!("Initialized {}", cli.db.display());
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

fn cmd_run(cli: &Cli, overrides: &SettingsOverride) -> Result<()> {
    FfmpegEncoder::new().check_tools()?;

    let mut controller = open_controller(cli, true)?.with_observer(Box::new(ProgressPrinter));
    let state = controller.start(Some(overrides))?;
    println!(
        "Run started: {} items ({} already processed)",
        state.total,
        state.processed.len()
    );

    let state = controller.run_to_completion()?;
    println!();
    println!("Batch {}:", state.status.as_str());
    println!("  Processed: {}", state.processed.len());
    println!("  Failed:    {}", state.failed.len());
    if state.options.validate && !state.options.auto_commit {
        println!();
        println!("Originals are quarantined. Use 'migrator commit --all' or 'migrator rollback --id <ID>'.");
    }
    Ok(())
}

fn cmd_run_background(cli: &Cli) -> Result<()> {
    // Validate the site before detaching so errors reach the terminal
    open_controller(cli, true)?;

    let exe = std::env::current_exe()?;
    let args: Vec<_> = std::env::args_os().skip(1).filter(|a| a != "--background").collect();
    let child = Command::new(exe)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("Could not start background run")?;

    println!("Background run started (pid {}). Use 'migrator status' to follow it.", child.id());
    Ok(())
}

fn cmd_stop(cli: &Cli) -> Result<()> {
    let controller = open_controller(cli, false)?;
    let state = controller.stop()?;
    println!("Batch is {}", state.status.as_str());
    Ok(())
}

fn cmd_status(cli: &Cli, json: bool) -> Result<()> {
    let controller = open_controller(cli, false)?;
    let status = controller.status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let state = &status.state;
    println!("Batch:      {}", state.status.as_str());
    if let Some(started) = &state.started_at {
        println!("Started:    {}", started);
    }
    if let Some(finished) = &state.finished_at {
        println!("Finished:   {}", finished);
    }
    println!("Progress:   {}/{} ({} failed)", state.processed.len(), state.total, state.failed.len());
    println!("Remaining:  {}", status.remaining);
    if let Some(cursor) = state.cursor {
        println!("Cursor:     {}", cursor);
    }
    match &status.lock {
        Some(lock) => println!("Lock:       {} (lease until {})", lock.owner, lock.lease_expires_at),
        None => println!("Lock:       free"),
    }

    if !status.counts.is_empty() {
        println!();
        println!("Items:");
        for (name, count) in &status.counts {
            println!("  {:<18} {}", name, count);
        }
    }

    if !status.recent_log.is_empty() {
        println!();
        println!("Recent log:");
        for record in &status.recent_log {
            let item = record.item_id.map(|id| format!(" #{}", id)).unwrap_or_default();
            println!("  {} {:?} {}{}: {}", record.ts, record.level, record.event, item, record.message);
        }
    }
    Ok(())
}

fn cmd_commit(cli: &Cli, id: Option<i64>, all: bool) -> Result<()> {
    let controller = open_controller(cli, true)?;
    if all {
        let summary = controller.commit_all()?;
        println!("Committed {} items", summary.committed.len());
        for (id, error) in &summary.failed {
            println!("  #{} failed: {}", id, error);
        }
        if !summary.failed.is_empty() {
            anyhow::bail!("{} items could not be committed", summary.failed.len());
        }
        return Ok(());
    }

    let id = id.ok_or_else(|| anyhow::anyhow!("--id or --all is required"))?;
    let status = controller.commit(id)?;
    println!("Item {} is {}", id, status);
    Ok(())
}

fn cmd_rollback(cli: &Cli, id: i64) -> Result<()> {
    let controller = open_controller(cli, true)?;
    let status = controller.rollback(id)?;
    println!("Item {} is {}", id, status);
    Ok(())
}

fn cmd_retry(cli: &Cli, id: i64) -> Result<()> {
    let controller = open_controller(cli, false)?;
    let state = controller.retry(id)?;
    println!("Item {} requeued ({} waiting). Run 'migrator run' to process it.", id, state.requeued.len());
    Ok(())
}

fn cmd_clear(cli: &Cli) -> Result<()> {
    let mut controller = open_controller(cli, false)?;
    controller.clear()?;
    println!("Batch state cleared");
    Ok(())
}

fn cmd_report(cli: &Cli, id: i64) -> Result<()> {
    let controller = open_controller(cli, false)?;
    let report = controller
        .report(id)?
        .ok_or_else(|| anyhow::anyhow!("Item {} has no report", id))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_settings(cli: &Cli, action: Option<&SettingsAction>) -> Result<()> {
    let controller = open_controller(cli, false)?;
    match action {
        None | Some(SettingsAction::Show) => {
            println!("{}", serde_json::to_string_pretty(&controller.settings()?)?);
        }
        Some(SettingsAction::Set { key, value }) => {
            let settings = set_field(&controller.settings()?, key, value)?;
            controller.save_settings(&settings)?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }
    Ok(())
}

fn set_field(settings: &Settings, key: &str, value: &str) -> Result<Settings> {
    let mut json = serde_json::to_value(settings)?;
    let fields = json
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("settings are not an object"))?;
    if !fields.contains_key(key) {
        anyhow::bail!("Unknown setting '{}'", key);
    }
    let parsed = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    fields.insert(key.to_string(), parsed);
    serde_json::from_value(json).with_context(|| format!("Invalid value for '{}'", key))
}
