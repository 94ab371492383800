//! Fixed table from conversion type to primary and fallback strategies.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::ConverterSettings;
use crate::converters::external::ExternalTool;
use crate::converters::markdown_to_word::{MarkdownToDocx, PandocConverter};
use crate::converters::pdf_to_markdown::{PdfTextToMarkdown, PdftotextConverter};
use crate::converters::pdf_to_word::{Pdf2DocxConverter, PdfTextToDocx};
use crate::converters::word_to_pdf::{DocxTextToPdf, LibreOfficeConverter};
use crate::converters::{ConversionRequest, Converter};
use crate::error::{ConversionError, DispatchError};
use crate::tasks::ConversionType;

/// Builds a fresh strategy instance.
pub type ConverterFactory = Arc<dyn Fn() -> Box<dyn Converter> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    primary: ConverterFactory,
    fallback: Option<ConverterFactory>,
}

/// Strategies selected for one task, in the order they will be tried.
pub struct ConverterChain {
    pub conversion_type: ConversionType,
    pub primary: Box<dyn Converter>,
    pub fallback: Option<Box<dyn Converter>>,
}

/// Which strategy produced the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionOutcome {
    pub strategy: String,
    /// The fallback produced the output after the primary failed.
    pub degraded: bool,
}

/// Maps conversion types to strategies.
#[derive(Clone, Default)]
pub struct ConverterDispatch {
    table: HashMap<ConversionType, Registration>,
}

impl ConverterDispatch {
    /// Create an empty dispatch table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The production table: an external tool first, a built-in writer as fallback.
    pub fn with_defaults(settings: &ConverterSettings) -> Self {
        let mut dispatch = Self::new();

        let pdf2docx = ExternalTool::new(&settings.pdf2docx_bin, settings.tool_timeout);
        dispatch
            .register(ConversionType::PdfToWord, move || {
                Box::new(Pdf2DocxConverter::new(pdf2docx.clone()))
            })
            .with_fallback(ConversionType::PdfToWord, || Box::new(PdfTextToDocx));

        let pandoc = ExternalTool::new(&settings.pandoc_bin, settings.tool_timeout);
        dispatch
            .register(ConversionType::MarkdownToWord, move || {
                Box::new(PandocConverter::new(pandoc.clone()))
            })
            .with_fallback(ConversionType::MarkdownToWord, || Box::new(MarkdownToDocx));

        let soffice = ExternalTool::new(&settings.soffice_bin, settings.tool_timeout);
        dispatch
            .register(ConversionType::WordToPdf, move || {
                Box::new(LibreOfficeConverter::new(soffice.clone()))
            })
            .with_fallback(ConversionType::WordToPdf, || Box::new(DocxTextToPdf));

        let pdftotext = ExternalTool::new(&settings.pdftotext_bin, settings.tool_timeout);
        dispatch
            .register(ConversionType::PdfToMarkdown, move || {
                Box::new(PdftotextConverter::new(pdftotext.clone()))
            })
            .with_fallback(ConversionType::PdfToMarkdown, || Box::new(PdfTextToMarkdown));

        dispatch
    }

    /// Register (or replace) the primary strategy for a type.
    pub fn register<F>(&mut self, conversion_type: ConversionType, primary: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Converter> + Send + Sync + 'static,
    {
        let fallback = self
            .table
            .remove(&conversion_type)
            .and_then(|r| r.fallback);
        self.table.insert(
            conversion_type,
            Registration {
                primary: Arc::new(primary),
                fallback,
            },
        );
        self
    }

    /// Attach a fallback to an already registered type.
    pub fn with_fallback<F>(&mut self, conversion_type: ConversionType, fallback: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Converter> + Send + Sync + 'static,
    {
        match self.table.get_mut(&conversion_type) {
            Some(registration) => registration.fallback = Some(Arc::new(fallback)),
            None => warn!(
                conversion_type = %conversion_type,
                "Fallback ignored: no primary registered"
            ),
        }
        self
    }

    /// Resolve a conversion-type tag to fresh strategy instances.
    pub fn select(&self, tag: &str) -> Result<ConverterChain, DispatchError> {
        let conversion_type: ConversionType = tag
            .parse()
            .map_err(|_| DispatchError::UnsupportedType(tag.to_string()))?;
        self.select_type(conversion_type)
    }

    pub fn select_type(
        &self,
        conversion_type: ConversionType,
    ) -> Result<ConverterChain, DispatchError> {
        let registration = self
            .table
            .get(&conversion_type)
            .ok_or_else(|| DispatchError::UnsupportedType(conversion_type.to_string()))?;
        Ok(ConverterChain {
            conversion_type,
            primary: (registration.primary)(),
            fallback: registration.fallback.as_ref().map(|f| f()),
        })
    }

    /// Run the chain: the primary, then the fallback if the primary fails.
    ///
    /// A strategy only succeeds if it leaves a non-empty output file. The
    /// returned error carries both strategy messages.
    pub async fn run(
        chain: &ConverterChain,
        request: &ConversionRequest<'_>,
    ) -> Result<ConversionOutcome, ConversionError> {
        let primary = chain.primary.as_ref();
        let primary_err = match attempt(primary, request).await {
            Ok(()) => {
                return Ok(ConversionOutcome {
                    strategy: primary.name().to_string(),
                    degraded: false,
                });
            }
            Err(e) => e,
        };

        warn!(
            conversion_type = %chain.conversion_type,
            strategy = primary.name(),
            error = %primary_err,
            "Primary strategy failed"
        );
        request
            .workspace
            .log(format!("{} failed: {primary_err}", primary.name()));

        let Some(fallback) = chain.fallback.as_deref() else {
            return Err(ConversionError::Failed {
                strategy: primary.name().to_string(),
                message: primary_err.to_string(),
            });
        };

        discard_partial_output(request.output).await;
        info!(
            conversion_type = %chain.conversion_type,
            strategy = fallback.name(),
            "Trying fallback strategy"
        );

        match attempt(fallback, request).await {
            Ok(()) => Ok(ConversionOutcome {
                strategy: fallback.name().to_string(),
                degraded: true,
            }),
            Err(fallback_err) => {
                request
                    .workspace
                    .log(format!("{} failed: {fallback_err}", fallback.name()));
                Err(ConversionError::Failed {
                    strategy: fallback.name().to_string(),
                    message: format!("{fallback_err} (primary: {primary_err})"),
                })
            }
        }
    }
}

async fn attempt(
    converter: &dyn Converter,
    request: &ConversionRequest<'_>,
) -> Result<(), ConversionError> {
    request
        .workspace
        .log(format!("{} starting", converter.name()));
    converter.convert(request).await?;
    verify_output(converter.name(), request.output).await?;
    request
        .workspace
        .log(format!("{} produced output", converter.name()));
    Ok(())
}

async fn verify_output(strategy: &str, output: &Path) -> Result<(), ConversionError> {
    match fs::metadata(output).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        _ => Err(ConversionError::MissingOutput {
            strategy: strategy.to_string(),
        }),
    }
}

async fn discard_partial_output(output: &Path) {
    match fs::remove_file(output).await {
        Ok(()) => debug!(path = %output.display(), "Removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %output.display(), error = %e, "Could not remove partial output"),
    }
}
