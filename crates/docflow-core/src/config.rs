//! Pipeline tunables.
//!
//! Every threshold the stages consult lives here rather than being scattered
//! as constants, so a deployment can tighten or relax retry and throttle
//! behavior without touching stage code.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable knobs for all pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Max characters per chunk.
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks.
    pub chunk_overlap: usize,
    /// Pending chunks claimed per embedding pass.
    pub embed_batch_size: usize,
    /// Throttle between embedding provider calls, in milliseconds.
    pub embed_call_delay_ms: u64,
    /// A `processing` job idle longer than this is considered stuck, seconds.
    pub stuck_after_secs: i64,
    /// A `failed` job idle longer than this becomes eligible for recovery,
    /// seconds. Longer than the stuck threshold to avoid thrashing.
    pub failed_cooldown_secs: i64,
    /// Failures before a job is terminally failed.
    pub max_retries: u32,
    /// Units handled per reconciler sweep per invocation.
    pub reconcile_batch_cap: usize,
    /// Pages per splitter window.
    pub split_window_pages: usize,
    /// Base delay for artifact-upload backoff, in milliseconds.
    pub upload_base_delay_ms: u64,
    /// Upload attempts before a window creation is fatal.
    pub upload_max_attempts: u32,
    /// Documents per background assignment batch.
    pub assign_batch_size: usize,
    /// Timeout applied to every external call within a handler, seconds.
    pub external_call_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 100,
            embed_batch_size: 20,
            embed_call_delay_ms: 100,
            stuck_after_secs: 600,
            failed_cooldown_secs: 900,
            max_retries: 3,
            reconcile_batch_cap: 3,
            split_window_pages: 20,
            upload_base_delay_ms: 200,
            upload_max_attempts: 3,
            assign_batch_size: 50,
            external_call_timeout_secs: 30,
        }
    }
}

impl PipelineConfig {
    /// Default config file location (~/.config/docflow/config.json).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docflow")
            .join("config.json")
    }

    /// Load from a JSON file; missing fields fall back to defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Load the default config file, or defaults if it does not exist.
    pub fn load_or_default() -> Self {
        let path = Self::default_path();
        match Self::load(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                if path.exists() {
                    tracing::warn!("Failed to load config from {:?}: {}", path, e);
                }
                Self::default()
            }
        }
    }

    pub fn embed_call_delay(&self) -> Duration {
        Duration::from_millis(self.embed_call_delay_ms)
    }

    pub fn stuck_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stuck_after_secs)
    }

    pub fn failed_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.failed_cooldown_secs)
    }

    pub fn upload_base_delay(&self) -> Duration {
        Duration::from_millis(self.upload_base_delay_ms)
    }

    pub fn external_call_timeout(&self) -> Duration {
        Duration::from_secs(self.external_call_timeout_secs)
    }
}
