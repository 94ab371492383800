//! Conversion strategies and their dispatch table.
//!
//! A [`Converter`] turns one input file into one output file inside a task
//! workspace. Strategies are stateless; [`dispatch::ConverterDispatch`]
//! instantiates a fresh primary (and optional fallback) per task.
//!
//! - `external`: runs CLI tools (pdf2docx, pandoc, soffice, pdftotext)
//! - `docx` / `pdf`: minimal built-in writers and a PDF text extractor
//! - one module per conversion type, each with a primary and a fallback

pub mod dispatch;
pub mod docx;
pub mod external;
pub mod markdown_to_word;
pub mod pdf;
pub mod pdf_to_markdown;
pub mod pdf_to_word;
pub mod word_to_pdf;

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConversionError;
use crate::workspace::SessionWorkspace;

pub use dispatch::{ConversionOutcome, ConverterChain, ConverterDispatch};

/// Progress callback, percent in 0..=100.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// Inputs for a single strategy invocation.
pub struct ConversionRequest<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub workspace: &'a SessionWorkspace,
    pub style: &'a StyleConfig,
    pub progress: &'a ProgressFn,
}

impl ConversionRequest<'_> {
    pub fn report(&self, percent: u8) {
        (self.progress)(percent);
    }
}

/// A pluggable conversion strategy.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Strategy name used in logs and error messages.
    fn name(&self) -> &str;

    /// Write the converted document to `request.output`.
    async fn convert(&self, request: &ConversionRequest<'_>) -> Result<(), ConversionError>;
}

/// Font choices applied by the built-in writers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FontMappings {
    pub default: String,
    pub serif: String,
    #[serde(rename = "sans-serif")]
    pub sans_serif: String,
    pub monospace: String,
}

impl Default for FontMappings {
    fn default() -> Self {
        Self {
            default: "Microsoft YaHei".to_string(),
            serif: "SimSun".to_string(),
            sans_serif: "Microsoft YaHei".to_string(),
            monospace: "Consolas".to_string(),
        }
    }
}

/// Optional per-upload style configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleConfig {
    pub font_mappings: FontMappings,
    pub preserve_images: bool,
    pub preserve_tables: bool,
    pub preserve_hyperlinks: bool,
    pub code_highlight: bool,
    pub math_support: bool,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            font_mappings: FontMappings::default(),
            preserve_images: true,
            preserve_tables: true,
            preserve_hyperlinks: true,
            code_highlight: true,
            math_support: true,
        }
    }
}

/// Ceiling on decompressed data read from any single upload (256MB).
pub(crate) const MAX_INFLATED_BYTES: u64 = 256 * 1024 * 1024;

/// Read at most `limit` bytes, failing if the source holds more.
pub(crate) fn read_bounded<R: Read>(
    reader: R,
    limit: u64,
    what: &str,
) -> Result<Vec<u8>, ConversionError> {
    let mut out = Vec::new();
    reader.take(limit.saturating_add(1)).read_to_end(&mut out)?;
    if out.len() as u64 > limit {
        return Err(ConversionError::InvalidInput(format!(
            "{what} expands past {limit} bytes"
        )));
    }
    Ok(out)
}

/// Run blocking encode/decode work off the async workers.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ConversionError>
where
    F: FnOnce() -> Result<T, ConversionError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ConversionError::Aborted(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn style_config_fills_missing_fields() {
        let style: StyleConfig =
            serde_json::from_str(r#"{"font_mappings": {"monospace": "Fira Code"}, "math_support": false}"#)
                .unwrap();
        assert_eq!(style.font_mappings.monospace, "Fira Code");
        assert_eq!(style.font_mappings.default, "Microsoft YaHei");
        assert!(!style.math_support);
        assert!(style.preserve_images);
    }

    #[test]
    fn bounded_read_rejects_oversized_source() {
        let data = vec![7u8; 64];
        assert_eq!(read_bounded(&data[..], 64, "data").unwrap().len(), 64);
        let err = read_bounded(&data[..], 63, "data").unwrap_err();
        assert!(matches!(err, ConversionError::InvalidInput(m) if m.contains("63 bytes")));
    }

    #[test]
    fn style_config_serializes_sans_serif_key() {
        let json = serde_json::to_value(StyleConfig::default()).unwrap();
        assert_eq!(json["font_mappings"]["sans-serif"], "Microsoft YaHei");
    }
}
