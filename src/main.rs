use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pixload::Engine;
use pixload::domain::entities::{Origin, RequestOptions};
use pixload::domain::errors::{CancelCause, FailCause};
use pixload::domain::ports::{Delivered, RequestListener};
use pixload::infrastructure::{CliArgs, EngineConfig, StorageManager};

fn init_logging(config: &EngineConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = config.effective_log_path() {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry().with(filter).init();
    }

    Ok(())
}

fn load_config(args: &CliArgs) -> Result<EngineConfig> {
    let storage = match &args.config {
        Some(path) => StorageManager::with_dir(
            path.parent()
                .map(std::path::Path::to_path_buf)
                .unwrap_or_default(),
        ),
        None => StorageManager::new().wrap_err("Failed to locate config directory")?,
    };
    let mut config = storage
        .load_config(args.config.as_deref())
        .wrap_err("Failed to load configuration")?;
    config.merge_with_args(args);
    Ok(config)
}

enum Outcome {
    Completed(Delivered, Origin),
    Failed(FailCause),
    Canceled(CancelCause),
}

/// Forwards terminal events to the main task.
struct ChannelListener {
    identifier: String,
    tx: mpsc::UnboundedSender<(String, Outcome)>,
}

impl ChannelListener {
    fn send(&self, outcome: Outcome) {
        let _ = self.tx.send((self.identifier.clone(), outcome));
    }
}

impl RequestListener for ChannelListener {
    fn on_progress(&self, total: u64, completed: u64) {
        tracing::trace!(identifier = %self.identifier, total, completed, "Progress");
    }

    fn on_completed(&self, delivered: Delivered, origin: Origin) {
        self.send(Outcome::Completed(delivered, origin));
    }

    fn on_failed(&self, cause: FailCause) {
        self.send(Outcome::Failed(cause));
    }

    fn on_canceled(&self, cause: CancelCause) {
        self.send(Outcome::Canceled(cause));
    }
}

fn report(identifier: &str, outcome: &Outcome) {
    match outcome {
        Outcome::Completed(Delivered::Resource(handle), origin) => println!(
            "{identifier}: {} {} ({} bytes) from {origin}",
            handle.size(),
            handle.format(),
            handle.byte_size()
        ),
        Outcome::Completed(Delivered::Download(result), origin) => {
            let location = result
                .path
                .as_ref()
                .map_or_else(|| "not cached".to_string(), |p| p.display().to_string());
            println!(
                "{identifier}: downloaded {} bytes from {origin}, {location}",
                result.byte_len
            );
        }
        Outcome::Failed(cause) => println!("{identifier}: failed: {cause}"),
        Outcome::Canceled(cause) => println!("{identifier}: {cause}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let config = load_config(&args)?;
    init_logging(&config)?;

    info!(version = pixload::VERSION, "Starting pixload");

    let engine = Engine::from_config(&config)
        .await
        .wrap_err("Failed to start engine")?;

    let mut options = RequestOptions::new();
    if let Some(level) = args.level {
        options = options.request_level(level);
    }
    if let Some(max) = args.max_size {
        options = options.max_size(max.width, max.height);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    for identifier in &args.identifiers {
        let listener = Arc::new(ChannelListener {
            identifier: identifier.clone(),
            tx: tx.clone(),
        });
        if args.download_only {
            engine.download(identifier, options.clone(), listener);
        } else {
            engine.load(identifier, options.clone(), listener);
        }
    }
    drop(tx);

    let mut failures = 0usize;
    for _ in 0..args.identifiers.len() {
        let Some((identifier, outcome)) = rx.recv().await else {
            break;
        };
        if !matches!(outcome, Outcome::Completed(..)) {
            failures += 1;
        }
        report(&identifier, &outcome);
    }

    println!();
    println!("{}", engine.stats());
    engine.shutdown();

    if failures > 0 {
        color_eyre::eyre::bail!("{failures} of {} requests did not complete", args.identifiers.len());
    }
    Ok(())
}
