//! Markdown to DOCX.

use std::ffi::OsString;
use std::path::Path;

use async_trait::async_trait;
use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag, TagEnd};
use tokio::fs;

use crate::converters::docx::{Block, Document, Run, reference_docx};
use crate::converters::external::ExternalTool;
use crate::converters::{ConversionRequest, Converter, StyleConfig, blocking};
use crate::error::ConversionError;

/// Conversion through `pandoc`.
pub struct PandocConverter {
    tool: ExternalTool,
}

impl PandocConverter {
    pub fn new(tool: ExternalTool) -> Self {
        Self { tool }
    }
}

#[async_trait]
impl Converter for PandocConverter {
    fn name(&self) -> &str {
        "pandoc"
    }

    async fn convert(&self, request: &ConversionRequest<'_>) -> Result<(), ConversionError> {
        let scratch = request.workspace.scratch_dir("pandoc").await?;
        let reference = scratch.join(REFERENCE_DOC);
        let style = request.style.clone();
        let reference_bytes = blocking(move || reference_docx(&style)).await?;
        fs::write(&reference, reference_bytes).await?;
        request.report(20);

        let args = pandoc_args(
            request.input,
            request.output,
            &reference,
            &scratch.join("media"),
            request.style,
        );
        self.tool
            .run(&args, request.workspace.root(), request.workspace)
            .await?;
        request.report(80);
        Ok(())
    }
}

/// Reference document carrying the style's fonts, written to the pandoc scratch dir.
const REFERENCE_DOC: &str = "reference.docx";

fn pandoc_args(
    input: &Path,
    output: &Path,
    reference: &Path,
    media_dir: &Path,
    style: &StyleConfig,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        input.into(),
        "-f".into(),
        "markdown".into(),
        "-t".into(),
        "docx".into(),
        "-o".into(),
        output.into(),
        "--standalone".into(),
        "--reference-doc".into(),
        reference.into(),
        "--toc".into(),
        "--toc-depth=3".into(),
        "--wrap=auto".into(),
    ];
    if style.code_highlight {
        args.push("--highlight-style=tango".into());
    } else {
        args.push("--no-highlight".into());
    }
    if style.math_support {
        args.push("--mathml".into());
    }
    if style.preserve_images {
        args.push("--extract-media".into());
        args.push(media_dir.into());
    }
    args
}

/// Built-in fallback rendering CommonMark (plus tables) with pulldown-cmark.
pub struct MarkdownToDocx;

#[async_trait]
impl Converter for MarkdownToDocx {
    fn name(&self) -> &str {
        "markdown-docx"
    }

    async fn convert(&self, request: &ConversionRequest<'_>) -> Result<(), ConversionError> {
        let bytes = fs::read(request.input).await?;
        request.report(30);

        let style = request.style.clone();
        let docx = blocking(move || {
            let text = String::from_utf8_lossy(&bytes);
            render(&text, &style).to_bytes(&style)
        })
        .await?;
        request.report(80);

        fs::write(request.output, docx).await?;
        Ok(())
    }
}

/// Render Markdown into document blocks.
pub fn render(markdown: &str, style: &StyleConfig) -> Document {
    let mut renderer = DocxRenderer::new(style);
    let parser = Parser::new_ext(
        markdown,
        Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH,
    );
    for event in parser {
        renderer.process_event(event);
    }
    renderer.finish()
}

struct DocxRenderer<'s> {
    style: &'s StyleConfig,
    doc: Document,
    runs: Vec<Run>,
    bold: usize,
    italic: usize,
    heading: Option<u8>,
    /// One entry per open list: next number for ordered lists.
    lists: Vec<Option<u64>>,
    item_marker: Option<String>,
    in_code_block: bool,
    code_buffer: String,
    links: Vec<String>,
    in_image: bool,
    table: Option<Vec<Vec<String>>>,
    cell: String,
}

impl<'s> DocxRenderer<'s> {
    fn new(style: &'s StyleConfig) -> Self {
        Self {
            style,
            doc: Document::new(),
            runs: Vec::new(),
            bold: 0,
            italic: 0,
            heading: None,
            lists: Vec::new(),
            item_marker: None,
            in_code_block: false,
            code_buffer: String::new(),
            links: Vec::new(),
            in_image: false,
            table: None,
            cell: String::new(),
        }
    }

    fn process_event(&mut self, event: Event<'_>) {
        match event {
            Event::Start(tag) => self.start_tag(tag),
            Event::End(tag) => self.end_tag(tag),
            Event::Text(text) => self.add_text(&text, false),
            Event::Code(code) => self.add_text(&code, true),
            Event::SoftBreak => self.add_text(" ", false),
            Event::HardBreak => self.finish_block(),
            Event::Rule => {
                self.finish_block();
                self.doc.push(Block::paragraph("* * *"));
            }
            _ => {}
        }
    }

    fn start_tag(&mut self, tag: Tag<'_>) {
        match tag {
            Tag::Heading { level, .. } => {
                self.finish_block();
                self.heading = Some(heading_level(level));
            }
            Tag::Paragraph => {
                // Paragraphs inside list items continue the item.
                if self.item_marker.is_none() {
                    self.finish_block();
                }
            }
            Tag::CodeBlock(_) => {
                self.finish_block();
                self.in_code_block = true;
                self.code_buffer.clear();
            }
            Tag::List(start) => {
                self.finish_block();
                self.lists.push(start);
            }
            Tag::Item => {
                self.finish_block();
                let marker = match self.lists.last_mut() {
                    Some(Some(n)) => {
                        let m = format!("{n}.");
                        *n += 1;
                        m
                    }
                    _ => "\u{2022}".to_string(),
                };
                self.item_marker = Some(marker);
            }
            Tag::Emphasis => self.italic += 1,
            Tag::Strong => self.bold += 1,
            Tag::Link { dest_url, .. } => self.links.push(dest_url.to_string()),
            Tag::Image { dest_url, .. } => {
                self.in_image = true;
                if self.style.preserve_images {
                    self.add_text(&format!("[image: {dest_url}] "), false);
                }
            }
            Tag::Table(_) => {
                self.finish_block();
                self.table = Some(Vec::new());
            }
            Tag::TableHead | Tag::TableRow => {
                if let Some(rows) = self.table.as_mut() {
                    rows.push(Vec::new());
                }
            }
            Tag::TableCell => self.cell.clear(),
            _ => {}
        }
    }

    fn end_tag(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Heading(_) => {
                self.finish_block();
                self.heading = None;
            }
            TagEnd::Paragraph => {
                if self.item_marker.is_none() {
                    self.finish_block();
                }
            }
            TagEnd::CodeBlock => {
                self.in_code_block = false;
                let code = std::mem::take(&mut self.code_buffer);
                self.doc.push(Block::CodeBlock(code));
            }
            TagEnd::List(_) => {
                self.finish_block();
                self.lists.pop();
                if self.lists.is_empty() {
                    self.item_marker = None;
                }
            }
            TagEnd::Item => self.finish_block(),
            TagEnd::Emphasis => self.italic = self.italic.saturating_sub(1),
            TagEnd::Strong => self.bold = self.bold.saturating_sub(1),
            TagEnd::Link => {
                if let Some(url) = self.links.pop()
                    && self.style.preserve_hyperlinks
                    && !url.is_empty()
                    && !self.ends_with_text(&url)
                {
                    self.add_text(&format!(" ({url})"), false);
                }
            }
            TagEnd::Image => self.in_image = false,
            TagEnd::TableCell => {
                let cell = std::mem::take(&mut self.cell);
                if let Some(row) = self.table.as_mut().and_then(|rows| rows.last_mut()) {
                    row.push(cell.trim().to_string());
                }
            }
            TagEnd::Table => {
                if let Some(rows) = self.table.take() {
                    self.push_table(rows);
                }
            }
            _ => {}
        }
    }

    fn add_text(&mut self, text: &str, code: bool) {
        if self.in_code_block {
            self.code_buffer.push_str(text);
            return;
        }
        if self.in_image && !self.style.preserve_images {
            return;
        }
        if self.table.is_some() {
            self.cell.push_str(text);
            return;
        }
        self.runs.push(Run {
            text: text.to_string(),
            bold: self.bold > 0,
            italic: self.italic > 0,
            code,
        });
    }

    fn ends_with_text(&self, suffix: &str) -> bool {
        self.runs.last().is_some_and(|r| r.text.ends_with(suffix))
    }

    fn push_table(&mut self, rows: Vec<Vec<String>>) {
        if self.style.preserve_tables {
            self.doc.push(Block::Table(rows));
        } else {
            for row in rows {
                self.doc.push(Block::paragraph(row.join(" | ")));
            }
        }
    }

    /// Flush pending runs into the block they belong to.
    fn finish_block(&mut self) {
        if self.runs.is_empty() {
            return;
        }
        let runs = std::mem::take(&mut self.runs);
        let block = if let Some(level) = self.heading {
            Block::Heading { level, runs }
        } else if let Some(marker) = self.item_marker.take() {
            Block::ListItem {
                depth: self.lists.len().saturating_sub(1),
                marker,
                runs,
            }
        } else {
            Block::Paragraph(runs)
        };
        self.doc.push(block);
    }

    fn finish(mut self) -> Document {
        self.finish_block();
        self.doc
    }
}

fn heading_level(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg_list(style: &StyleConfig) -> Vec<String> {
        pandoc_args(
            Path::new("in.md"),
            Path::new("out.docx"),
            Path::new("ref.docx"),
            Path::new("media"),
            style,
        )
        .into_iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect()
    }

    #[test]
    fn pandoc_flags_follow_style() {
        let args = arg_list(&StyleConfig::default());
        assert_eq!(&args[..7], ["in.md", "-f", "markdown", "-t", "docx", "-o", "out.docx"]);
        assert!(args.windows(2).any(|w| w == ["--reference-doc", "ref.docx"]));
        assert!(args.windows(2).any(|w| w == ["--extract-media", "media"]));
        assert!(args.contains(&"--highlight-style=tango".to_string()));
        assert!(args.contains(&"--mathml".to_string()));
        assert!(args.contains(&"--toc".to_string()));

        let plain = StyleConfig {
            code_highlight: false,
            math_support: false,
            preserve_images: false,
            ..StyleConfig::default()
        };
        let args = arg_list(&plain);
        assert!(args.contains(&"--no-highlight".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--highlight-style") || a == "--mathml"));
        assert!(!args.contains(&"--extract-media".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pandoc_receives_reference_doc_and_style_flags() {
        use crate::converters::ProgressFn;
        use crate::converters::docx::read_paragraphs;
        use crate::converters::external::ExternalTool;
        use crate::workspace::WorkspaceManager;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Arc;
        use std::time::Duration;
        use tempfile::TempDir;
        use uuid::Uuid;

        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        let script = bin.join("pandoc-stub");
        // Records argv next to itself and copies the reference doc to the output.
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             printf '%s\\n' \"$@\" > \"$(dirname \"$0\")/argv.txt\"\n\
             prev=''; out=''; reference=''\n\
             for arg in \"$@\"; do\n\
               [ \"$prev\" = '-o' ] && out=\"$arg\"\n\
               [ \"$prev\" = '--reference-doc' ] && reference=\"$arg\"\n\
               prev=\"$arg\"\n\
             done\n\
             cp \"$reference\" \"$out\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let ws = WorkspaceManager::new(dir.path().join("temp"))
            .create(Uuid::new_v4())
            .await
            .unwrap();
        let input = ws.write("input.md", b"# Hi\n").await.unwrap();
        let output = ws.path("notes.docx").unwrap();
        let style = StyleConfig {
            code_highlight: false,
            ..StyleConfig::default()
        };
        let progress: ProgressFn = Arc::new(|_| {});
        let request = ConversionRequest {
            input: &input,
            output: &output,
            workspace: &ws,
            style: &style,
            progress: &progress,
        };

        let converter = PandocConverter::new(ExternalTool::new(
            script.to_string_lossy().into_owned(),
            Duration::from_secs(10),
        ));
        converter.convert(&request).await.unwrap();

        let argv = std::fs::read_to_string(bin.join("argv.txt")).unwrap();
        let argv: Vec<&str> = argv.lines().collect();
        assert_eq!(argv[0], input.to_str().unwrap());
        assert!(argv.contains(&"--no-highlight"));
        assert!(argv.contains(&"--mathml"));
        let reference = argv
            .iter()
            .position(|a| *a == "--reference-doc")
            .map(|i| argv[i + 1])
            .unwrap();
        assert!(reference.ends_with("scratch/pandoc/reference.docx"));

        // The stub copied the reference doc: a valid package with the style's parts.
        let written = std::fs::read(&output).unwrap();
        assert!(read_paragraphs(&written).unwrap().is_empty());
        let archive = zip::ZipArchive::new(std::io::Cursor::new(written)).unwrap();
        assert!(archive.file_names().any(|n| n == "word/styles.xml"));
    }

    fn blocks(md: &str) -> Vec<Block> {
        render(md, &StyleConfig::default()).blocks().to_vec()
    }

    #[test]
    fn headings_and_paragraphs() {
        let out = blocks("# Title\n\nSome *soft*\ntext.\n");
        assert_eq!(
            out[0],
            Block::Heading {
                level: 1,
                runs: vec![Run::plain("Title")]
            }
        );
        match &out[1] {
            Block::Paragraph(runs) => {
                let text: String = runs.iter().map(|r| r.text.as_str()).collect();
                assert_eq!(text, "Some soft text.");
                assert!(runs.iter().any(|r| r.italic && r.text == "soft"));
            }
            other => panic!("expected paragraph, got {other:?}"),
        }
    }

    #[test]
    fn ordered_and_bulleted_lists() {
        let out = blocks("1. first\n2. second\n\n- a\n  - nested\n");
        let markers: Vec<(usize, String)> = out
            .iter()
            .filter_map(|b| match b {
                Block::ListItem { depth, marker, .. } => Some((*depth, marker.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            markers,
            vec![
                (0, "1.".to_string()),
                (0, "2.".to_string()),
                (0, "\u{2022}".to_string()),
                (1, "\u{2022}".to_string()),
            ]
        );
    }

    #[test]
    fn fenced_code_is_kept_verbatim() {
        let out = blocks("```rust\nfn main() {\n    *x = 1;\n}\n```\n");
        assert_eq!(
            out,
            vec![Block::CodeBlock("fn main() {\n    *x = 1;\n}\n".to_string())]
        );
    }

    #[test]
    fn inline_code_and_links() {
        let out = blocks("Run `cargo` or see [docs](https://example.com).");
        let Block::Paragraph(runs) = &out[0] else {
            panic!("expected paragraph");
        };
        assert!(runs.iter().any(|r| r.code && r.text == "cargo"));
        let text: String = runs.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(text, "Run cargo or see docs (https://example.com).");
    }

    #[test]
    fn tables_follow_style() {
        let md = "| a | b |\n|---|---|\n| 1 | 2 |\n";
        assert_eq!(
            blocks(md),
            vec![Block::Table(vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["1".to_string(), "2".to_string()],
            ])]
        );

        let flat = StyleConfig {
            preserve_tables: false,
            ..StyleConfig::default()
        };
        assert_eq!(
            render(md, &flat).blocks(),
            &[Block::paragraph("a | b"), Block::paragraph("1 | 2")]
        );
    }

    #[test]
    fn images_can_be_dropped() {
        let md = "![logo](logo.png)";
        let kept = blocks(md);
        let Block::Paragraph(runs) = &kept[0] else {
            panic!("expected paragraph");
        };
        assert!(runs[0].text.contains("[image: logo.png]"));

        let dropped = StyleConfig {
            preserve_images: false,
            ..StyleConfig::default()
        };
        assert!(render(md, &dropped).is_empty());
    }
}
