//! Minimal WordprocessingML (DOCX) writer and text reader.
//!
//! The writer emits the smallest package Word and LibreOffice accept:
//! `[Content_Types].xml`, `_rels/.rels` and `word/document.xml`. Formatting
//! is applied inline (no styles part), using the fonts from [`StyleConfig`].

use std::io::{Cursor, Write};
use std::sync::LazyLock;

use regex::Regex;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::converters::{MAX_INFLATED_BYTES, StyleConfig, read_bounded};
use crate::error::ConversionError;

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/></Types>"#;

const PACKAGE_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/></Relationships>"#;

const REFERENCE_CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/><Override PartName="/word/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.styles+xml"/></Types>"#;

const DOCUMENT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/></Relationships>"#;

const STYLES_OPEN: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:styles xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">"#;

const DOCUMENT_OPEN: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>"#;

const DOCUMENT_CLOSE: &str = r#"<w:sectPr><w:pgSz w:w="11906" w:h="16838"/><w:pgMar w:top="1440" w:right="1440" w:bottom="1440" w:left="1440"/></w:sectPr></w:body></w:document>"#;

/// Half-point sizes for body text and headings 1..=6.
const BODY_SIZE: u32 = 22;
const HEADING_SIZES: [u32; 6] = [36, 32, 28, 26, 24, 22];

static TEXT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<w:t(?:\s[^>]*)?>([^<]*)</w:t>").unwrap());

/// A span of text with uniform formatting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Run {
    pub text: String,
    pub bold: bool,
    pub italic: bool,
    pub code: bool,
}

impl Run {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// A block-level element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Heading { level: u8, runs: Vec<Run> },
    Paragraph(Vec<Run>),
    /// `marker` is the rendered bullet or number, e.g. `•` or `3.`.
    ListItem { depth: usize, marker: String, runs: Vec<Run> },
    CodeBlock(String),
    Table(Vec<Vec<String>>),
    PageBreak,
}

impl Block {
    pub fn paragraph(text: impl Into<String>) -> Self {
        Self::Paragraph(vec![Run::plain(text)])
    }
}

/// An in-memory document, serialized with [`Document::to_bytes`].
#[derive(Debug, Clone, Default)]
pub struct Document {
    blocks: Vec<Block>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Render `word/document.xml`.
    pub fn document_xml(&self, style: &StyleConfig) -> String {
        let fonts = &style.font_mappings;
        let mut xml = String::from(DOCUMENT_OPEN);

        for block in &self.blocks {
            match block {
                Block::Heading { level, runs } => {
                    let idx = usize::from((*level).clamp(1, 6) - 1);
                    xml.push_str("<w:p><w:pPr><w:spacing w:before=\"240\" w:after=\"120\"/></w:pPr>");
                    for run in runs {
                        let heading = Run {
                            bold: true,
                            ..run.clone()
                        };
                        push_run(&mut xml, &heading, &fonts.sans_serif, &fonts.monospace, HEADING_SIZES[idx]);
                    }
                    xml.push_str("</w:p>");
                }
                Block::Paragraph(runs) => {
                    xml.push_str("<w:p>");
                    for run in runs {
                        push_run(&mut xml, run, &fonts.default, &fonts.monospace, BODY_SIZE);
                    }
                    xml.push_str("</w:p>");
                }
                Block::ListItem { depth, marker, runs } => {
                    let left = 360 * (depth + 1);
                    xml.push_str(&format!(
                        "<w:p><w:pPr><w:ind w:left=\"{left}\" w:hanging=\"360\"/></w:pPr>"
                    ));
                    push_run(&mut xml, &Run::plain(format!("{marker} ")), &fonts.default, &fonts.monospace, BODY_SIZE);
                    for run in runs {
                        push_run(&mut xml, run, &fonts.default, &fonts.monospace, BODY_SIZE);
                    }
                    xml.push_str("</w:p>");
                }
                Block::CodeBlock(code) => {
                    xml.push_str(
                        "<w:p><w:pPr><w:shd w:val=\"clear\" w:color=\"auto\" w:fill=\"F2F2F2\"/></w:pPr>",
                    );
                    let font = xml_escape(&fonts.monospace);
                    xml.push_str(&format!(
                        "<w:r><w:rPr><w:rFonts w:ascii=\"{font}\" w:hAnsi=\"{font}\" w:eastAsia=\"{font}\"/><w:sz w:val=\"20\"/></w:rPr>"
                    ));
                    for (i, line) in code.trim_end_matches('\n').split('\n').enumerate() {
                        if i > 0 {
                            xml.push_str("<w:br/>");
                        }
                        xml.push_str(&format!(
                            "<w:t xml:space=\"preserve\">{}</w:t>",
                            xml_escape(line)
                        ));
                    }
                    xml.push_str("</w:r></w:p>");
                }
                Block::Table(rows) => push_table(&mut xml, rows, &fonts.default),
                Block::PageBreak => xml.push_str("<w:p><w:r><w:br w:type=\"page\"/></w:r></w:p>"),
            }
        }

        xml.push_str(DOCUMENT_CLOSE);
        xml
    }

    /// Serialize the full DOCX package.
    pub fn to_bytes(&self, style: &StyleConfig) -> Result<Vec<u8>, ConversionError> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        zip.start_file("[Content_Types].xml", options)?;
        zip.write_all(CONTENT_TYPES.as_bytes())?;
        zip.start_file("_rels/.rels", options)?;
        zip.write_all(PACKAGE_RELS.as_bytes())?;
        zip.start_file("word/document.xml", options)?;
        zip.write_all(self.document_xml(style).as_bytes())?;

        Ok(zip.finish()?.into_inner())
    }
}

/// A style-only package for `pandoc --reference-doc`: the fonts and sizes
/// pandoc's paragraph and character styles should use.
pub fn reference_docx(style: &StyleConfig) -> Result<Vec<u8>, ConversionError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.start_file("[Content_Types].xml", options)?;
    zip.write_all(REFERENCE_CONTENT_TYPES.as_bytes())?;
    zip.start_file("_rels/.rels", options)?;
    zip.write_all(PACKAGE_RELS.as_bytes())?;
    zip.start_file("word/_rels/document.xml.rels", options)?;
    zip.write_all(DOCUMENT_RELS.as_bytes())?;
    zip.start_file("word/document.xml", options)?;
    zip.write_all(Document::new().document_xml(style).as_bytes())?;
    zip.start_file("word/styles.xml", options)?;
    zip.write_all(styles_xml(style).as_bytes())?;

    Ok(zip.finish()?.into_inner())
}

fn styles_xml(style: &StyleConfig) -> String {
    let fonts = &style.font_mappings;
    let mut xml = String::from(STYLES_OPEN);
    xml.push_str(&format!(
        "<w:docDefaults><w:rPrDefault><w:rPr>{}<w:sz w:val=\"{BODY_SIZE}\"/></w:rPr></w:rPrDefault></w:docDefaults>",
        fonts_xml(&fonts.default)
    ));
    push_style(&mut xml, "paragraph", "Normal", "Normal", &fonts.default, BODY_SIZE, false);
    push_style(&mut xml, "paragraph", "BodyText", "Body Text", &fonts.default, BODY_SIZE, false);
    push_style(&mut xml, "paragraph", "Title", "Title", &fonts.sans_serif, HEADING_SIZES[0] + 8, true);
    for (i, size) in HEADING_SIZES.iter().enumerate() {
        let level = i + 1;
        push_style(
            &mut xml,
            "paragraph",
            &format!("Heading{level}"),
            &format!("heading {level}"),
            &fonts.sans_serif,
            *size,
            true,
        );
    }
    push_style(&mut xml, "paragraph", "BlockText", "Block Text", &fonts.serif, BODY_SIZE, false);
    push_style(&mut xml, "paragraph", "SourceCode", "Source Code", &fonts.monospace, 20, false);
    push_style(&mut xml, "character", "VerbatimChar", "Verbatim Char", &fonts.monospace, 20, false);
    xml.push_str("</w:styles>");
    xml
}

fn push_style(xml: &mut String, kind: &str, id: &str, name: &str, font: &str, size: u32, bold: bool) {
    xml.push_str(&format!(
        "<w:style w:type=\"{kind}\" w:styleId=\"{id}\"><w:name w:val=\"{name}\"/>"
    ));
    if kind == "paragraph" && id != "Normal" {
        xml.push_str("<w:basedOn w:val=\"Normal\"/>");
    }
    xml.push_str("<w:rPr>");
    xml.push_str(&fonts_xml(font));
    if bold {
        xml.push_str("<w:b/>");
    }
    xml.push_str(&format!("<w:sz w:val=\"{size}\"/></w:rPr></w:style>"));
}

fn fonts_xml(font: &str) -> String {
    let font = xml_escape(font);
    format!("<w:rFonts w:ascii=\"{font}\" w:hAnsi=\"{font}\" w:eastAsia=\"{font}\" w:cs=\"{font}\"/>")
}

fn push_run(xml: &mut String, run: &Run, font: &str, mono: &str, size: u32) {
    if run.text.is_empty() {
        return;
    }
    let font = xml_escape(if run.code { mono } else { font });
    xml.push_str("<w:r><w:rPr>");
    xml.push_str(&format!(
        "<w:rFonts w:ascii=\"{font}\" w:hAnsi=\"{font}\" w:eastAsia=\"{font}\"/>"
    ));
    if run.bold {
        xml.push_str("<w:b/>");
    }
    if run.italic {
        xml.push_str("<w:i/>");
    }
    xml.push_str(&format!("<w:sz w:val=\"{size}\"/></w:rPr>"));
    xml.push_str(&format!(
        "<w:t xml:space=\"preserve\">{}</w:t></w:r>",
        xml_escape(&run.text)
    ));
}

fn push_table(xml: &mut String, rows: &[Vec<String>], font: &str) {
    if rows.is_empty() {
        return;
    }
    xml.push_str("<w:tbl><w:tblPr><w:tblW w:w=\"0\" w:type=\"auto\"/><w:tblBorders>");
    for edge in ["top", "left", "bottom", "right", "insideH", "insideV"] {
        xml.push_str(&format!(
            "<w:{edge} w:val=\"single\" w:sz=\"4\" w:space=\"0\" w:color=\"auto\"/>"
        ));
    }
    xml.push_str("</w:tblBorders></w:tblPr>");
    for (i, row) in rows.iter().enumerate() {
        xml.push_str("<w:tr>");
        for cell in row {
            xml.push_str("<w:tc><w:p>");
            let run = Run {
                text: cell.clone(),
                bold: i == 0,
                ..Run::default()
            };
            push_run(xml, &run, font, font, BODY_SIZE);
            xml.push_str("</w:p></w:tc>");
        }
        xml.push_str("</w:tr>");
    }
    xml.push_str("</w:tbl>");
}

/// Extract the plain text of every paragraph in a DOCX package.
///
/// Tables are flattened: each cell paragraph becomes its own line.
pub fn read_paragraphs(bytes: &[u8]) -> Result<Vec<String>, ConversionError> {
    read_paragraphs_bounded(bytes, MAX_INFLATED_BYTES)
}

fn read_paragraphs_bounded(bytes: &[u8], limit: u64) -> Result<Vec<String>, ConversionError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ConversionError::InvalidInput(format!("not a DOCX package: {e}")))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|e| ConversionError::InvalidInput(format!("missing word/document.xml: {e}")))?;
    let xml = String::from_utf8(read_bounded(entry, limit, "word/document.xml")?)
        .map_err(|e| ConversionError::InvalidInput(format!("word/document.xml is not UTF-8: {e}")))?;

    let paragraphs = xml
        .split("</w:p>")
        .map(|chunk| {
            TEXT_RUN
                .captures_iter(chunk)
                .filter_map(|c| c.get(1))
                .map(|m| xml_unescape(m.as_str()))
                .collect::<String>()
        })
        .collect::<Vec<_>>();

    // The chunk after the last paragraph holds only section properties.
    let mut paragraphs = paragraphs;
    if paragraphs.last().is_some_and(|p| p.is_empty()) {
        paragraphs.pop();
    }
    Ok(paragraphs)
}

pub(crate) fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            // Control characters other than tab/newline are invalid in XML 1.0.
            c if c.is_control() && c != '\t' && c != '\n' => {}
            c => out.push(c),
        }
    }
    out
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Document {
        let mut doc = Document::new();
        doc.push(Block::Heading {
            level: 1,
            runs: vec![Run::plain("Title & <More>")],
        });
        doc.push(Block::Paragraph(vec![
            Run::plain("Plain "),
            Run {
                text: "bold".to_string(),
                bold: true,
                ..Run::default()
            },
        ]));
        doc.push(Block::ListItem {
            depth: 0,
            marker: "•".to_string(),
            runs: vec![Run::plain("item")],
        });
        doc.push(Block::CodeBlock("fn main() {}\nlet x = 1;\n".to_string()));
        doc.push(Block::Table(vec![
            vec!["a".to_string(), "b".to_string()],
            vec!["1".to_string(), "2".to_string()],
        ]));
        doc
    }

    #[test]
    fn package_contains_required_parts() {
        let bytes = sample().to_bytes(&StyleConfig::default()).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        for name in ["[Content_Types].xml", "_rels/.rels", "word/document.xml"] {
            assert!(archive.by_name(name).is_ok(), "missing {name}");
        }
    }

    #[test]
    fn text_survives_write_and_read() {
        let bytes = sample().to_bytes(&StyleConfig::default()).unwrap();
        let paragraphs = read_paragraphs(&bytes).unwrap();
        assert_eq!(paragraphs[0], "Title & <More>");
        assert_eq!(paragraphs[1], "Plain bold");
        assert_eq!(paragraphs[2], "• item");
        assert!(paragraphs[3].contains("fn main() {}"));
        assert!(paragraphs.contains(&"a".to_string()));
    }

    #[test]
    fn fonts_come_from_style() {
        let mut style = StyleConfig::default();
        style.font_mappings.monospace = "Fira Code".to_string();
        let xml = sample().document_xml(&style);
        assert!(xml.contains("w:ascii=\"Fira Code\""));
        assert!(xml.contains("w:ascii=\"Microsoft YaHei\""));
    }

    #[test]
    fn escapes_markup_and_drops_control_chars() {
        assert_eq!(xml_escape("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&apos;");
        assert_eq!(xml_escape("x\u{0}y\tz"), "xy\tz");
        assert_eq!(xml_unescape("&amp;lt;"), "&lt;");
    }

    #[test]
    fn oversized_document_part_is_rejected() {
        let mut doc = Document::new();
        for i in 0..200 {
            doc.push(Block::paragraph(format!("line {i} of a long document")));
        }
        let bytes = doc.to_bytes(&StyleConfig::default()).unwrap();

        let err = read_paragraphs_bounded(&bytes, 1_000).unwrap_err();
        assert!(matches!(err, ConversionError::InvalidInput(m) if m.contains("word/document.xml")));
        assert_eq!(read_paragraphs(&bytes).unwrap().len(), 200);
    }

    #[test]
    fn reference_doc_maps_fonts_to_styles() {
        let mut style = StyleConfig::default();
        style.font_mappings.serif = "Georgia".to_string();
        style.font_mappings.monospace = "Fira Code".to_string();
        let bytes = reference_docx(&style).unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        for name in ["word/document.xml", "word/_rels/document.xml.rels"] {
            assert!(archive.by_name(name).is_ok(), "missing {name}");
        }
        let styles = String::from_utf8(
            read_bounded(archive.by_name("word/styles.xml").unwrap(), 1 << 20, "styles").unwrap(),
        )
        .unwrap();
        assert!(styles.contains("w:styleId=\"Heading3\""));
        assert!(styles.contains("w:styleId=\"BlockText\"><w:name w:val=\"Block Text\"/><w:basedOn w:val=\"Normal\"/><w:rPr><w:rFonts w:ascii=\"Georgia\""));
        assert!(styles.contains("w:styleId=\"VerbatimChar\"><w:name w:val=\"Verbatim Char\"/><w:rPr><w:rFonts w:ascii=\"Fira Code\""));
    }

    #[test]
    fn rejects_non_docx_input() {
        assert!(matches!(
            read_paragraphs(b"plain text, not a zip"),
            Err(ConversionError::InvalidInput(_))
        ));
    }
}
