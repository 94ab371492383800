//! PDF to Markdown.

use std::ffi::OsStr;

use async_trait::async_trait;
use tokio::fs;

use crate::converters::external::ExternalTool;
use crate::converters::pdf_to_word::paragraphs;
use crate::converters::{ConversionRequest, Converter, blocking, pdf};
use crate::error::ConversionError;

const BULLETS: [char; 4] = ['\u{2022}', '\u{25e6}', '\u{25aa}', '\u{00b7}'];

/// Poppler's `pdftotext`, post-processed into Markdown.
pub struct PdftotextConverter {
    tool: ExternalTool,
}

impl PdftotextConverter {
    pub fn new(tool: ExternalTool) -> Self {
        Self { tool }
    }
}

#[async_trait]
impl Converter for PdftotextConverter {
    fn name(&self) -> &str {
        "pdftotext"
    }

    async fn convert(&self, request: &ConversionRequest<'_>) -> Result<(), ConversionError> {
        let text_path = request.workspace.scratch_dir("pdftotext").await?.join("out.txt");

        request.report(20);
        self.tool
            .run(
                [
                    OsStr::new("-enc"),
                    OsStr::new("UTF-8"),
                    request.input.as_os_str(),
                    text_path.as_os_str(),
                ],
                request.workspace.root(),
                request.workspace,
            )
            .await?;
        request.report(70);

        let text = fs::read(&text_path).await?;
        // pdftotext separates pages with form feeds.
        let pages: Vec<String> = String::from_utf8_lossy(&text)
            .split('\u{0c}')
            .map(str::to_string)
            .collect();
        fs::write(request.output, pages_to_markdown(&pages)).await?;
        Ok(())
    }
}

/// Built-in fallback using the naive content-stream extractor.
pub struct PdfTextToMarkdown;

#[async_trait]
impl Converter for PdfTextToMarkdown {
    fn name(&self) -> &str {
        "pdf-text-markdown"
    }

    async fn convert(&self, request: &ConversionRequest<'_>) -> Result<(), ConversionError> {
        let bytes = fs::read(request.input).await?;
        request.report(30);

        let markdown = blocking(move || {
            let chunks = pdf::extract_text(&bytes)?;
            Ok(pages_to_markdown(&chunks))
        })
        .await?;
        request.report(80);

        fs::write(request.output, markdown).await?;
        Ok(())
    }
}

/// Join page texts into Markdown: paragraphs separated by blank lines, pages
/// by thematic breaks, bullet glyphs turned into list items.
pub fn pages_to_markdown(pages: &[String]) -> String {
    let rendered: Vec<String> = pages
        .iter()
        .map(|page| {
            paragraphs(page)
                .iter()
                .map(|p| markdown_paragraph(p))
                .collect::<Vec<_>>()
                .join("\n\n")
        })
        .filter(|page| !page.is_empty())
        .collect();

    if rendered.is_empty() {
        return "_No extractable text was found in this PDF._\n".to_string();
    }
    let mut out = rendered.join("\n\n---\n\n");
    out.push('\n');
    out
}

fn markdown_paragraph(paragraph: &str) -> String {
    if let Some(rest) = paragraph.strip_prefix(BULLETS) {
        return format!("- {}", escape_inline(rest.trim_start()));
    }
    let escaped = escape_inline(paragraph);
    // Text that starts like a Markdown block marker must stay literal.
    if escaped.starts_with(['#', '>', '-', '+', '='])
        || starts_with_ordered_marker(&escaped)
    {
        format!("\\{escaped}")
    } else {
        escaped
    }
}

fn starts_with_ordered_marker(s: &str) -> bool {
    let digits = s.chars().take_while(char::is_ascii_digit).count();
    digits > 0 && s[digits..].starts_with(". ")
}

fn escape_inline(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '*' | '_' | '`' | '[' | ']' | '<' | '|') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
