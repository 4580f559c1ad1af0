//! Embedding provider abstraction.
//!
//! The pipeline treats embedding generation as an opaque external call
//! `embed(text) -> vector | error`. Providers declare their vector width up
//! front; the embed worker rejects any vector that comes back with a
//! different width instead of silently accepting it.

mod http;

pub use http::HttpProvider;

use anyhow::Result;
use async_trait::async_trait;

/// Unified embedding provider interface.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text. Callers apply their own throttling between calls.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Vector width this provider produces.
    fn dimensions(&self) -> usize;
}

/// Deterministic provider for tests and local demo runs.
///
/// Returns a vector derived from the text length so assertions can tell
/// chunks apart without a real model.
pub struct MockProvider {
    dimensions: usize,
    /// When set, every call fails with this message.
    failure: Option<String>,
    /// When set, vectors come back with this width instead of `dimensions`.
    wrong_width: Option<usize>,
}

impl MockProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            failure: None,
            wrong_width: None,
        }
    }

    /// Provider whose every call fails, for error-path tests.
    pub fn failing(dimensions: usize, message: &str) -> Self {
        Self {
            dimensions,
            failure: Some(message.to_string()),
            wrong_width: None,
        }
    }

    /// Provider that produces vectors of the wrong width.
    pub fn mismatched(dimensions: usize, actual: usize) -> Self {
        Self {
            dimensions,
            failure: None,
            wrong_width: Some(actual),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(msg) = &self.failure {
            anyhow::bail!("{msg}");
        }
        let width = self.wrong_width.unwrap_or(self.dimensions);
        let seed = text.chars().count() as f32;
        Ok((0..width).map(|i| seed + i as f32).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
