//! Text extraction seam.
//!
//! PDF-to-text and image OCR live outside the pipeline; the stages only see
//! `(text, error)`. The plain-text implementation backs the demo runner and
//! tests.

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Opaque external extraction call.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract normalized text from raw artifact bytes.
    async fn extract(&self, data: &[u8]) -> Result<String>;
}

/// Treats the artifact as UTF-8 text.
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, data: &[u8]) -> Result<String> {
        let text = std::str::from_utf8(data).context("Artifact is not valid UTF-8")?;
        Ok(text.to_string())
    }
}

/// Extractor whose every call fails. Error-path test support.
pub struct FailingExtractor(pub &'static str);

#[async_trait]
impl TextExtractor for FailingExtractor {
    async fn extract(&self, _data: &[u8]) -> Result<String> {
        anyhow::bail!("{}", self.0)
    }
}
