//! Configuration management
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `TICKLOAD_*` environment variables (a `.env` file is honoured).

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tickload_common::{DataKind, ShardKey};

use crate::engine::process::PORT_SPAN;
use crate::engine::{EngineLauncher, LocalLauncher, QProcessLauncher, RetryPolicy};

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Default directory holding one subdirectory per exchange feed.
pub const DEFAULT_SOURCE_ROOT: &str = "./data/m_data";

/// Default feed subdirectories, processed one after another.
pub const DEFAULT_SOURCE_DIRS: &[&str] = &["EUX"];

/// Default database root; each table gets its own partitioned subdirectory.
pub const DEFAULT_DATABASE_DIR: &str = "./db";

/// Default scratch directory for staged copies.
pub const DEFAULT_STAGING_DIR: &str = "./staging";

/// Default first month to ingest.
pub const DEFAULT_FIRST_SHARD: ShardKey = ShardKey::from_parts(2017, 5);

/// Default last month to ingest, inclusive.
pub const DEFAULT_LAST_SHARD: ShardKey = ShardKey::from_parts(2019, 2);

/// Default number of shards ingesting at the same time.
pub const DEFAULT_MAX_PARALLEL_SHARDS: usize = 4;

/// Default limit for one shard's ingestion (6 hours).
pub const DEFAULT_SHARD_TIMEOUT_SECS: u64 = 6 * 60 * 60;

/// Default capacity of the shard log channel.
pub const DEFAULT_LOG_CHANNEL_CAPACITY: usize = 4096;

// ============================================================================
// Engine Configuration Constants
// ============================================================================

/// Default engine executable.
pub const DEFAULT_ENGINE_PROGRAM: &str = "q";

/// Default host the spawned engines listen on.
pub const DEFAULT_ENGINE_HOST: &str = "localhost";

/// Default port of the first shard's engine.
pub const DEFAULT_ENGINE_BASE_PORT: u16 = 31000;

/// Default secondary threads per engine (`-s`).
pub const DEFAULT_ENGINE_THREADS: u32 = 12;

/// Default connection attempts while an engine starts.
pub const DEFAULT_ENGINE_STARTUP_ATTEMPTS: u32 = 10;

/// Default base delay between connection attempts, in milliseconds.
pub const DEFAULT_ENGINE_STARTUP_DELAY_MS: u64 = 500;

/// Default timeout of a single connection handshake, in seconds.
pub const DEFAULT_ENGINE_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default time an engine gets to exit after shutdown, in seconds.
pub const DEFAULT_ENGINE_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Which engine implementation shards run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineBackend {
    /// Spawned `q` processes reached over IPC
    #[default]
    Q,
    /// Embedded engine, no external process
    Local,
}

impl FromStr for EngineBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "q" | "kdb" => Ok(EngineBackend::Q),
            "local" | "embedded" => Ok(EngineBackend::Local),
            _ => anyhow::bail!("Invalid engine backend: {}", s),
        }
    }
}

/// What to do with a file whose rows may already be in the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Always append; loading a file twice duplicates its rows
    #[default]
    Allow,
    /// Skip files whose target partition already exists
    SkipExistingPartition,
    /// Skip files whose digest is recorded in the partition's ingest ledger
    SkipIngestedFiles,
}

impl FromStr for DuplicatePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "allow" => Ok(DuplicatePolicy::Allow),
            "skip_existing_partition" => Ok(DuplicatePolicy::SkipExistingPartition),
            "skip_ingested_files" => Ok(DuplicatePolicy::SkipIngestedFiles),
            _ => anyhow::bail!("Invalid duplicate policy: {}", s),
        }
    }
}

/// Engine process settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub backend: EngineBackend,
    pub program: PathBuf,
    pub host: String,
    pub base_port: u16,
    pub threads: u32,
    /// `user:password` sent in the handshake; empty for an open engine
    pub credentials: String,
    pub startup_attempts: u32,
    pub startup_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: EngineBackend::default(),
            program: PathBuf::from(DEFAULT_ENGINE_PROGRAM),
            host: DEFAULT_ENGINE_HOST.to_string(),
            base_port: DEFAULT_ENGINE_BASE_PORT,
            threads: DEFAULT_ENGINE_THREADS,
            credentials: String::new(),
            startup_attempts: DEFAULT_ENGINE_STARTUP_ATTEMPTS,
            startup_delay_ms: DEFAULT_ENGINE_STARTUP_DELAY_MS,
            connect_timeout_secs: DEFAULT_ENGINE_CONNECT_TIMEOUT_SECS,
            shutdown_grace_secs: DEFAULT_ENGINE_SHUTDOWN_GRACE_SECS,
        }
    }
}

impl EngineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.startup_attempts,
            delay: Duration::from_millis(self.startup_delay_ms),
        }
    }

    /// Launcher for the configured backend
    pub fn launcher(&self) -> Arc<dyn EngineLauncher> {
        match self.backend {
            EngineBackend::Q => Arc::new(QProcessLauncher {
                program: self.program.clone(),
                host: self.host.clone(),
                threads: self.threads,
                credentials: self.credentials.clone(),
                retry: self.retry_policy(),
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
                shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            }),
            EngineBackend::Local => Arc::new(LocalLauncher),
        }
    }
}

/// Ingest pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    pub source_root: PathBuf,
    pub source_dirs: Vec<String>,
    pub database_dir: PathBuf,
    /// Compressed files are copied here before decompression; `None` decompresses in place
    pub staging_dir: Option<PathBuf>,
    pub first_shard: ShardKey,
    pub last_shard: ShardKey,
    /// Kinds to ingest, always processed in trade, order, book order
    pub kinds: Vec<DataKind>,
    pub max_parallel_shards: usize,
    pub shard_timeout_secs: u64,
    pub duplicate_policy: DuplicatePolicy,
    pub log_channel_capacity: usize,
    /// File receiving the aggregated shard log; standard error when unset
    pub aggregate_log: Option<PathBuf>,
    pub engine: EngineConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from(DEFAULT_SOURCE_ROOT),
            source_dirs: DEFAULT_SOURCE_DIRS.iter().map(|s| s.to_string()).collect(),
            database_dir: PathBuf::from(DEFAULT_DATABASE_DIR),
            staging_dir: Some(PathBuf::from(DEFAULT_STAGING_DIR)),
            first_shard: DEFAULT_FIRST_SHARD,
            last_shard: DEFAULT_LAST_SHARD,
            kinds: DataKind::ALL.to_vec(),
            max_parallel_shards: DEFAULT_MAX_PARALLEL_SHARDS,
            shard_timeout_secs: DEFAULT_SHARD_TIMEOUT_SECS,
            duplicate_policy: DuplicatePolicy::default(),
            log_channel_capacity: DEFAULT_LOG_CHANNEL_CAPACITY,
            aggregate_log: None,
            engine: EngineConfig::default(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from defaults, an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Self::from_toml_str(&text)
                    .with_context(|| format!("Invalid config file {}", path.display()))?
            },
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML document; absent keys keep their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse TOML configuration")
    }

    /// Override settings from `TICKLOAD_*` variables resolved through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("TICKLOAD_SOURCE_ROOT") {
            self.source_root = PathBuf::from(root);
        }
        if let Some(dirs) = lookup("TICKLOAD_SOURCE_DIRS") {
            self.source_dirs = dirs
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(dir) = lookup("TICKLOAD_DATABASE_DIR") {
            self.database_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("TICKLOAD_STAGING_DIR") {
            self.staging_dir = if dir.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(dir))
            };
        }
        if let Some(path) = lookup("TICKLOAD_AGGREGATE_LOG") {
            self.aggregate_log = Some(PathBuf::from(path));
        }
        if let Some(kinds) = lookup("TICKLOAD_KINDS") {
            self.kinds = kinds
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.trim().parse::<DataKind>())
                .collect::<std::result::Result<_, _>>()
                .context("Invalid TICKLOAD_KINDS")?;
        }

        set_parsed(&lookup, "TICKLOAD_FIRST_SHARD", &mut self.first_shard)?;
        set_parsed(&lookup, "TICKLOAD_LAST_SHARD", &mut self.last_shard)?;
        set_parsed(&lookup, "TICKLOAD_MAX_PARALLEL_SHARDS", &mut self.max_parallel_shards)?;
        set_parsed(&lookup, "TICKLOAD_SHARD_TIMEOUT_SECS", &mut self.shard_timeout_secs)?;
        set_parsed(&lookup, "TICKLOAD_DUPLICATE_POLICY", &mut self.duplicate_policy)?;
        set_parsed(&lookup, "TICKLOAD_LOG_CHANNEL_CAPACITY", &mut self.log_channel_capacity)?;

        let engine = &mut self.engine;
        set_parsed(&lookup, "TICKLOAD_ENGINE_BACKEND", &mut engine.backend)?;
        if let Some(program) = lookup("TICKLOAD_ENGINE_PROGRAM") {
            engine.program = PathBuf::from(program);
        }
        if let Some(host) = lookup("TICKLOAD_ENGINE_HOST") {
            engine.host = host;
        }
        if let Some(credentials) = lookup("TICKLOAD_ENGINE_CREDENTIALS") {
            engine.credentials = credentials;
        }
        set_parsed(&lookup, "TICKLOAD_ENGINE_BASE_PORT", &mut engine.base_port)?;
        set_parsed(&lookup, "TICKLOAD_ENGINE_THREADS", &mut engine.threads)?;
        set_parsed(&lookup, "TICKLOAD_ENGINE_STARTUP_ATTEMPTS", &mut engine.startup_attempts)?;
        set_parsed(&lookup, "TICKLOAD_ENGINE_STARTUP_DELAY_MS", &mut engine.startup_delay_ms)?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.source_dirs.is_empty() {
            anyhow::bail!("At least one source directory must be configured");
        }

        if self.source_dirs.iter().any(|d| d.trim().is_empty()) {
            anyhow::bail!("Source directory names cannot be empty");
        }

        if self.first_shard > self.last_shard {
            anyhow::bail!(
                "first_shard {} is after last_shard {}",
                self.first_shard,
                self.last_shard
            );
        }

        if self.kinds.is_empty() {
            anyhow::bail!("At least one data kind must be configured");
        }

        if self.max_parallel_shards == 0 {
            anyhow::bail!("max_parallel_shards must be greater than 0");
        }

        if self.shard_timeout_secs == 0 {
            anyhow::bail!("shard_timeout_secs must be greater than 0");
        }

        if self.log_channel_capacity == 0 {
            anyhow::bail!("log_channel_capacity must be greater than 0");
        }

        if self.engine.base_port == 0 {
            anyhow::bail!("Engine base_port must be greater than 0");
        }

        if u32::from(self.engine.base_port) + u32::from(PORT_SPAN) - 1 > u32::from(u16::MAX) {
            anyhow::bail!(
                "Engine base_port {} leaves fewer than {} ports for shards",
                self.engine.base_port,
                PORT_SPAN
            );
        }

        if self.engine.threads == 0 {
            anyhow::bail!("Engine threads must be greater than 0");
        }

        if self.engine.startup_attempts == 0 {
            anyhow::bail!("Engine startup_attempts must be greater than 0");
        }

        Ok(())
    }

    /// Every month between the first and last shard
    pub fn shards(&self) -> Vec<ShardKey> {
        ShardKey::range(self.first_shard, self.last_shard)
    }

    /// Kinds in processing order, without repeats
    pub fn ordered_kinds(&self) -> Vec<DataKind> {
        DataKind::ALL
            .into_iter()
            .filter(|kind| self.kinds.contains(kind))
            .collect()
    }

    pub fn source_dir(&self, name: &str) -> PathBuf {
        self.source_root.join(name)
    }

    /// Partitioned database directory of one table
    pub fn partition_root(&self, kind: DataKind) -> PathBuf {
        self.database_dir.join(kind.table_name())
    }

    pub fn shard_timeout(&self) -> Duration {
        Duration::from_secs(self.shard_timeout_secs)
    }
}

fn set_parsed<T, F>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}='{}': {}", key, raw, e))?;
    }
    Ok(())
}
