//! Updater configuration.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the update orchestrator.
///
/// Constructible directly in code, or loaded through [`UpdaterConfig::load`]
/// which layers an optional TOML file with `HOTPATCH_`-prefixed environment
/// overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Path of the bundled local manifest shipped with the application.
    pub local_manifest: PathBuf,
    /// Writable root downloaded content is placed under. This is the
    /// directory that gets promoted onto the search path.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    /// Maximum number of in-flight transfers during a download phase.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Per-request network timeout in seconds.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Upper bound on caller-triggered retry rounds for one session.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay before a retry round; doubles with each round.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_storage_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hotpatch")
        .join("content")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl UpdaterConfig {
    /// Configuration with defaults for everything except the bundled
    /// manifest location.
    pub fn new(local_manifest: impl Into<PathBuf>) -> Self {
        Self {
            local_manifest: local_manifest.into(),
            storage_root: default_storage_root(),
            max_concurrent: default_max_concurrent(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }

    /// Load configuration from an optional TOML file plus environment
    /// overrides (`HOTPATCH_STORAGE_ROOT`, `HOTPATCH_MAX_CONCURRENT`, ...).
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder =
            builder.add_source(config::Environment::with_prefix("HOTPATCH").try_parsing(true));

        builder
            .build()
            .context("failed to assemble configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")
    }
}
