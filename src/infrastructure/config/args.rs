use super::engine_config::LogLevel;
use crate::domain::entities::{RequestLevel, Size};
use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(
    name = "pixload",
    version,
    about = "Load images through a cached, deduplicating pipeline",
    long_about = None
)]
pub struct CliArgs {
    /// Identifiers to load (URLs, paths, asset://, content://, drawable://, data:image/...).
    #[arg(value_name = "IDENTIFIER")]
    pub identifiers: Vec<String>,

    /// Configuration file path.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH")]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Memory cache budget in MiB.
    #[arg(long, value_name = "MIB")]
    pub memory_cache_mb: Option<u64>,

    /// Disk cache budget in MiB.
    #[arg(long, value_name = "MIB")]
    pub disk_cache_mb: Option<u64>,

    /// Disk cache directory.
    #[arg(long, value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Skip the disk cache entirely.
    #[arg(long)]
    pub no_disk_cache: bool,

    /// Parallel network fetches.
    #[arg(long)]
    pub network_workers: Option<usize>,

    /// Parallel decodes.
    #[arg(long)]
    pub decode_workers: Option<usize>,

    /// Directory `asset://` identifiers resolve under.
    #[arg(long, value_name = "PATH")]
    pub asset_root: Option<PathBuf>,

    /// How far requests may reach.
    #[arg(long, value_enum)]
    pub level: Option<RequestLevel>,

    /// Cap decoded dimensions, e.g. 200x200.
    #[arg(long, value_name = "WxH")]
    pub max_size: Option<Size>,

    /// Only download into the disk cache, without decoding.
    #[arg(long)]
    pub download_only: bool,
}
