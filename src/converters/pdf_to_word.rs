//! PDF to DOCX.

use std::ffi::OsStr;

use async_trait::async_trait;
use tokio::fs;

use crate::converters::docx::{Block, Document};
use crate::converters::external::ExternalTool;
use crate::converters::{ConversionRequest, Converter, blocking, pdf};
use crate::error::ConversionError;

/// Layout-preserving conversion through the `pdf2docx` CLI.
pub struct Pdf2DocxConverter {
    tool: ExternalTool,
}

impl Pdf2DocxConverter {
    pub fn new(tool: ExternalTool) -> Self {
        Self { tool }
    }
}

#[async_trait]
impl Converter for Pdf2DocxConverter {
    fn name(&self) -> &str {
        "pdf2docx"
    }

    async fn convert(&self, request: &ConversionRequest<'_>) -> Result<(), ConversionError> {
        request.report(20);
        self.tool
            .run(
                [
                    OsStr::new("convert"),
                    request.input.as_os_str(),
                    request.output.as_os_str(),
                ],
                request.workspace.root(),
                request.workspace,
            )
            .await?;
        request.report(80);
        Ok(())
    }
}

/// Text-only fallback: extracted text, one section per content stream.
pub struct PdfTextToDocx;

#[async_trait]
impl Converter for PdfTextToDocx {
    fn name(&self) -> &str {
        "pdf-text-docx"
    }

    async fn convert(&self, request: &ConversionRequest<'_>) -> Result<(), ConversionError> {
        let bytes = fs::read(request.input).await?;
        request.report(30);

        let style = request.style.clone();
        let docx = blocking(move || {
            let chunks = pdf::extract_text(&bytes)?;
            text_document(&chunks).to_bytes(&style)
        })
        .await?;
        request.report(80);

        fs::write(request.output, docx).await?;
        Ok(())
    }
}

/// Lay out extracted text chunks, separated by page breaks.
///
/// Lines are merged into paragraphs; a blank line or a short line (one that
/// ends well before the wrap margin) ends a paragraph.
pub(crate) fn text_document(chunks: &[String]) -> Document {
    let mut doc = Document::new();
    if chunks.is_empty() {
        doc.push(Block::paragraph(
            "No extractable text was found in this PDF.",
        ));
        return doc;
    }

    for (i, chunk) in chunks.iter().enumerate() {
        if i > 0 {
            doc.push(Block::PageBreak);
        }
        for paragraph in paragraphs(chunk) {
            doc.push(Block::paragraph(paragraph));
        }
    }
    doc
}

/// Lines shorter than this end a paragraph.
const SHORT_LINE: usize = 60;

pub(crate) fn paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            continue;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(line);
        if line.chars().count() < SHORT_LINE {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converters::docx::read_paragraphs;
    use crate::converters::{ProgressFn, StyleConfig};
    use crate::workspace::WorkspaceManager;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[test]
    fn paragraphs_join_wrapped_lines() {
        let long = "x".repeat(70);
        let text = format!("{long}\ncontinued here\nTitle\n\nNext");
        assert_eq!(
            paragraphs(&text),
            vec![format!("{long} continued here"), "Title".into(), "Next".into()]
        );
    }

    #[test]
    fn empty_pdf_text_gets_placeholder() {
        let doc = text_document(&[]);
        assert_eq!(doc.blocks().len(), 1);
    }

    #[test]
    fn chunks_are_separated_by_page_breaks() {
        let doc = text_document(&["one".to_string(), "two".to_string()]);
        assert_eq!(
            doc.blocks(),
            &[
                Block::paragraph("one"),
                Block::PageBreak,
                Block::paragraph("two")
            ]
        );
    }

    #[tokio::test]
    async fn fallback_converts_generated_pdf() {
        let dir = TempDir::new().unwrap();
        let ws = WorkspaceManager::new(dir.path().to_path_buf())
            .create(Uuid::new_v4())
            .await
            .unwrap();
        let pdf = pdf::write_text_pdf(&["Quarterly report".to_string()]).unwrap();
        let input = ws.write("input.pdf", &pdf).await.unwrap();
        let output = ws.path("report.docx").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress: ProgressFn = Arc::new(move |p| sink.lock().unwrap().push(p));
        let style = StyleConfig::default();
        let request = ConversionRequest {
            input: &input,
            output: &output,
            workspace: &ws,
            style: &style,
            progress: &progress,
        };

        PdfTextToDocx.convert(&request).await.unwrap();

        let text = read_paragraphs(&std::fs::read(&output).unwrap()).unwrap();
        assert_eq!(text, vec!["Quarterly report".to_string()]);
        assert_eq!(*seen.lock().unwrap(), vec![30, 80]);
    }

    #[tokio::test]
    async fn missing_pdf2docx_is_reported() {
        let dir = TempDir::new().unwrap();
        let ws = WorkspaceManager::new(dir.path().to_path_buf())
            .create(Uuid::new_v4())
            .await
            .unwrap();
        let input = ws.write("input.pdf", b"%PDF-1.4").await.unwrap();
        let output = ws.path("out.docx").unwrap();
        let progress: ProgressFn = Arc::new(|_| {});
        let style = StyleConfig::default();
        let request = ConversionRequest {
            input: &input,
            output: &output,
            workspace: &ws,
            style: &style,
            progress: &progress,
        };

        let converter = Pdf2DocxConverter::new(ExternalTool::new(
            "docconv-missing-pdf2docx",
            Duration::from_secs(5),
        ));
        assert!(matches!(
            converter.convert(&request).await,
            Err(ConversionError::ToolUnavailable { .. })
        ));
    }
}
