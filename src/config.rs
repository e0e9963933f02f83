use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Centralized application configuration.
/// CLI flags override `SWORD_*` environment variables, which override defaults.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Public base URL used in every link the server hands out.
    pub base_url: String,
    pub site_name: String,
    pub max_upload_size: u64,
    pub max_by_reference_size: u64,
    /// Most bytes one ZIP or BagIt container may unpack to.
    pub max_unpacked_size: u64,
    pub fetch_timeout_secs: u64,
    pub task_workers: usize,
    pub task_max_retries: usize,
    pub min_segment_size: u64,
    pub max_segments: u64,
    pub max_assembled_size: u64,
    /// Enabled packaging format identifiers.
    pub packaging_formats: Vec<String>,
    /// Enabled metadata format identifiers.
    pub metadata_formats: Vec<String>,
}

/// What the process should do after loading its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Migrate,
    CollectGarbage,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "SWORD v3 deposit server")]
pub struct Args {
    /// Host to bind to (overrides SWORD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SWORD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where payloads are stored (overrides SWORD_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides SWORD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public base URL (overrides SWORD_BASE_URL)
    #[arg(long)]
    pub base_url: Option<String>,

    /// Largest accepted upload in bytes (overrides SWORD_MAX_UPLOAD_SIZE)
    #[arg(long)]
    pub max_upload_size: Option<u64>,

    /// Largest accepted by-reference file in bytes (overrides SWORD_MAX_BY_REFERENCE_SIZE)
    #[arg(long)]
    pub max_by_reference_size: Option<u64>,

    /// Largest total size a container may unpack to (overrides SWORD_MAX_UNPACKED_SIZE)
    #[arg(long)]
    pub max_unpacked_size: Option<u64>,

    /// Number of background task workers (overrides SWORD_TASK_WORKERS)
    #[arg(long)]
    pub task_workers: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Collect orphaned file-set objects in every deposit and exit
    #[arg(long, conflicts_with = "migrate")]
    pub collect_garbage: bool,
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {name} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {name}")),
    }
}

fn env_list(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            storage_dir: "./data/objects".into(),
            database_url: "sqlite://./data/meta/sword.db".into(),
            base_url: "http://localhost:3000".into(),
            site_name: "SWORD deposit server".into(),
            max_upload_size: GIB,
            max_by_reference_size: 10 * GIB,
            max_unpacked_size: 10 * GIB,
            fetch_timeout_secs: 60,
            task_workers: 4,
            task_max_retries: 3,
            min_segment_size: KIB,
            max_segments: 1000,
            max_assembled_size: 10 * GIB,
            packaging_formats: crate::packaging::PackagingFormat::ALL
                .iter()
                .map(|format| format.uri().to_string())
                .collect(),
            metadata_formats: crate::metadata::MetadataFormat::ALL
                .iter()
                .map(|format| format.uri().to_string())
                .collect(),
        }
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, Mode)> {
        let args = Args::parse();
        let mode = if args.migrate {
            Mode::Migrate
        } else if args.collect_garbage {
            Mode::CollectGarbage
        } else {
            Mode::Serve
        };
        Ok((Self::merge(args)?, mode))
    }

    fn merge(args: Args) -> Result<Self> {
        let defaults = Self::default();

        // --- Environment fallback ---
        let host = env_or("SWORD_HOST", defaults.host)?;
        let port = env_or("SWORD_PORT", defaults.port)?;
        let port = args.port.unwrap_or(port);
        let base_url = match (args.base_url, env::var("SWORD_BASE_URL").ok()) {
            (Some(url), _) | (None, Some(url)) => url,
            (None, None) => format!("http://localhost:{port}"),
        };

        // --- Merge ---
        Ok(Self {
            host: args.host.unwrap_or(host),
            port,
            storage_dir: args
                .storage_dir
                .unwrap_or(env_or("SWORD_STORAGE_DIR", defaults.storage_dir)?),
            database_url: args
                .database_url
                .unwrap_or(env_or("SWORD_DATABASE_URL", defaults.database_url)?),
            base_url: base_url.trim_end_matches('/').to_string(),
            site_name: env_or("SWORD_SITE_NAME", defaults.site_name)?,
            max_upload_size: args
                .max_upload_size
                .unwrap_or(env_or("SWORD_MAX_UPLOAD_SIZE", defaults.max_upload_size)?),
            max_by_reference_size: args.max_by_reference_size.unwrap_or(env_or(
                "SWORD_MAX_BY_REFERENCE_SIZE",
                defaults.max_by_reference_size,
            )?),
            max_unpacked_size: args.max_unpacked_size.unwrap_or(env_or(
                "SWORD_MAX_UNPACKED_SIZE",
                defaults.max_unpacked_size,
            )?),
            fetch_timeout_secs: env_or("SWORD_FETCH_TIMEOUT_SECS", defaults.fetch_timeout_secs)?,
            task_workers: args
                .task_workers
                .unwrap_or(env_or("SWORD_TASK_WORKERS", defaults.task_workers)?),
            task_max_retries: env_or("SWORD_TASK_MAX_RETRIES", defaults.task_max_retries)?,
            min_segment_size: env_or("SWORD_MIN_SEGMENT_SIZE", defaults.min_segment_size)?,
            max_segments: env_or("SWORD_MAX_SEGMENTS", defaults.max_segments)?,
            max_assembled_size: env_or("SWORD_MAX_ASSEMBLED_SIZE", defaults.max_assembled_size)?,
            packaging_formats: env_list("SWORD_PACKAGING_FORMATS")
                .unwrap_or(defaults.packaging_formats),
            metadata_formats: env_list("SWORD_METADATA_FORMATS")
                .unwrap_or(defaults.metadata_formats),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
