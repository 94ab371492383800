//! DOCX to PDF.

use std::ffi::OsString;

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::converters::external::ExternalTool;
use crate::converters::{ConversionRequest, Converter, blocking, docx, pdf};
use crate::error::ConversionError;

/// Headless LibreOffice conversion.
///
/// Each run gets its own profile directory inside the workspace scratch area
/// so concurrent conversions do not contend for the user profile lock.
pub struct LibreOfficeConverter {
    tool: ExternalTool,
}

impl LibreOfficeConverter {
    pub fn new(tool: ExternalTool) -> Self {
        Self { tool }
    }
}

#[async_trait]
impl Converter for LibreOfficeConverter {
    fn name(&self) -> &str {
        "libreoffice"
    }

    async fn convert(&self, request: &ConversionRequest<'_>) -> Result<(), ConversionError> {
        let outdir = request.workspace.scratch_dir("soffice").await?;
        let profile = std::path::absolute(outdir.join("profile"))?;

        let mut profile_arg = OsString::from("-env:UserInstallation=file://");
        profile_arg.push(profile.as_os_str());

        request.report(20);
        self.tool
            .run(
                [
                    profile_arg,
                    OsString::from("--headless"),
                    OsString::from("--convert-to"),
                    OsString::from("pdf"),
                    OsString::from("--outdir"),
                    outdir.clone().into_os_string(),
                    request.input.as_os_str().to_os_string(),
                ],
                request.workspace.root(),
                request.workspace,
            )
            .await?;
        request.report(80);

        let stem = request
            .input
            .file_stem()
            .ok_or_else(|| ConversionError::InvalidInput("input has no file name".to_string()))?;
        let produced = outdir.join(stem).with_extension("pdf");
        if !fs::try_exists(&produced).await.unwrap_or(false) {
            return Err(ConversionError::MissingOutput {
                strategy: self.name().to_string(),
            });
        }
        debug!(from = %produced.display(), to = %request.output.display(), "Moving LibreOffice output");
        fs::rename(&produced, request.output).await?;
        Ok(())
    }
}

/// Text-only fallback: paragraph text from `word/document.xml` laid out as PDF.
pub struct DocxTextToPdf;

#[async_trait]
impl Converter for DocxTextToPdf {
    fn name(&self) -> &str {
        "docx-text-pdf"
    }

    async fn convert(&self, request: &ConversionRequest<'_>) -> Result<(), ConversionError> {
        let bytes = fs::read(request.input).await?;
        request.report(30);

        let output = blocking(move || {
            let paragraphs = docx::read_paragraphs(&bytes)?;
            pdf::write_text_pdf(&paragraphs)
        })
        .await?;
        request.report(80);

        fs::write(request.output, output).await?;
        Ok(())
    }
}
