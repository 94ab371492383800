//! Naive PDF text extraction and a minimal text-only PDF writer.
//!
//! Extraction walks every content stream (inflating `FlateDecode` data) and
//! interprets the text-showing operators. It does not resolve font encodings,
//! so CID-keyed fonts come out as noise; it is meant as a fallback only.

use std::io::Write;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::converters::{MAX_INFLATED_BYTES, read_bounded};
use crate::error::ConversionError;

const PAGE_WIDTH: u32 = 595;
const PAGE_HEIGHT: u32 = 842;
const MARGIN: u32 = 56;
const FONT_SIZE: u32 = 11;
const LEADING: u32 = 14;
const LINES_PER_PAGE: usize = ((PAGE_HEIGHT - 2 * MARGIN) / LEADING) as usize;
/// Wrap width in characters for 11pt Helvetica on A4 with the margins above.
const WRAP_COLUMNS: usize = 88;

/// Streams that never carry page text.
const SKIPPED_STREAM_KEYS: [&[u8]; 6] = [
    b"/Image",
    b"/FontFile",
    b"/Length1",
    b"/XRef",
    b"/ObjStm",
    b"/Metadata",
];

/// Extract text from every content stream, in file order.
///
/// Streams without text are omitted. Fails only if `bytes` is not a PDF.
pub fn extract_text(bytes: &[u8]) -> Result<Vec<String>, ConversionError> {
    extract_text_bounded(bytes, MAX_INFLATED_BYTES)
}

/// As [`extract_text`], failing once inflated streams exceed `budget` bytes in total.
fn extract_text_bounded(bytes: &[u8], mut budget: u64) -> Result<Vec<String>, ConversionError> {
    if !bytes.starts_with(b"%PDF-") {
        return Err(ConversionError::InvalidInput(
            "missing %PDF- header".to_string(),
        ));
    }

    let mut chunks = Vec::new();
    let mut cursor = 0;
    while let Some(pos) = find(bytes, b"stream", cursor) {
        cursor = pos + b"stream".len();
        if pos >= 3 && &bytes[pos - 3..pos] == b"end" {
            continue;
        }

        let dict_start = rfind(&bytes[..pos], b"obj").unwrap_or(0);
        let dict = &bytes[dict_start..pos];
        if SKIPPED_STREAM_KEYS.iter().any(|k| find(dict, k, 0).is_some()) {
            continue;
        }

        let mut start = cursor;
        if bytes.get(start) == Some(&b'\r') {
            start += 1;
        }
        if bytes.get(start) == Some(&b'\n') {
            start += 1;
        }
        let Some(end) = find(bytes, b"endstream", start) else {
            break;
        };
        cursor = end + b"endstream".len();

        let raw = trim_eol(&bytes[start..end]);
        let content = if find(dict, b"/FlateDecode", 0).is_some() {
            let inflated = match read_bounded(ZlibDecoder::new(raw), budget, "PDF content") {
                Ok(inflated) => inflated,
                // Corrupt streams are skipped.
                Err(ConversionError::Io(_)) => continue,
                Err(e) => return Err(e),
            };
            budget -= inflated.len() as u64;
            inflated
        } else {
            raw.to_vec()
        };

        let text = content_text(&content);
        if !text.trim().is_empty() {
            chunks.push(text);
        }
    }
    Ok(chunks)
}

/// Interpret the text operators of one content stream.
fn content_text(content: &[u8]) -> String {
    let mut lines = TextLines::default();
    let mut strings: Vec<String> = Vec::new();
    let mut numbers: Vec<f64> = Vec::new();
    let mut in_array = false;
    let mut i = 0;

    while i < content.len() {
        let c = content[i];
        match c {
            b'(' => {
                let (s, next) = read_literal(content, i + 1);
                strings.push(s);
                i = next;
            }
            b'<' if content.get(i + 1) == Some(&b'<') => {
                i = find(content, b">>", i + 2).map_or(content.len(), |p| p + 2);
            }
            b'<' => {
                let end = find(content, b">", i + 1).unwrap_or(content.len());
                strings.push(decode_hex(&content[i + 1..end]));
                i = end + 1;
            }
            b'[' => {
                in_array = true;
                i += 1;
            }
            b']' => {
                in_array = false;
                i += 1;
            }
            b'%' => {
                while i < content.len() && content[i] != b'\n' && content[i] != b'\r' {
                    i += 1;
                }
            }
            b'/' => {
                i += 1;
                while i < content.len() && !is_delimiter(content[i]) {
                    i += 1;
                }
            }
            b'0'..=b'9' | b'-' | b'+' | b'.' => {
                let start = i;
                i += 1;
                while i < content.len() && matches!(content[i], b'0'..=b'9' | b'.') {
                    i += 1;
                }
                let value = std::str::from_utf8(&content[start..i])
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0);
                // Large negative kerning inside TJ arrays stands for a word gap.
                if in_array && value < -200.0 {
                    strings.push(" ".to_string());
                }
                numbers.push(value);
            }
            c if c.is_ascii_alphabetic() || c == b'\'' || c == b'"' || c == b'*' => {
                let start = i;
                i += 1;
                while i < content.len()
                    && (content[i].is_ascii_alphanumeric() || content[i] == b'*')
                {
                    i += 1;
                }
                match &content[start..i] {
                    b"Tj" | b"TJ" => lines.push_all(&strings),
                    b"'" | b"\"" => {
                        lines.break_line();
                        lines.push_all(&strings);
                    }
                    b"T*" | b"ET" => lines.break_line(),
                    b"Td" | b"TD" => {
                        let ty = numbers.last().copied().unwrap_or(0.0);
                        let tx = numbers.iter().rev().nth(1).copied().unwrap_or(0.0);
                        if ty.abs() > f64::EPSILON {
                            lines.break_line();
                        } else if tx > 0.0 {
                            lines.space();
                        }
                    }
                    b"Tm" => lines.break_line(),
                    _ => {}
                }
                strings.clear();
                numbers.clear();
            }
            _ => i += 1,
        }
    }

    lines.finish()
}

#[derive(Default)]
struct TextLines {
    out: String,
    line: String,
}

impl TextLines {
    fn push_all(&mut self, strings: &[String]) {
        for s in strings {
            self.line.push_str(s);
        }
    }

    fn space(&mut self) {
        if !self.line.is_empty() && !self.line.ends_with(' ') {
            self.line.push(' ');
        }
    }

    fn break_line(&mut self) {
        let trimmed = self.line.trim_end();
        if !trimmed.is_empty() {
            self.out.push_str(trimmed);
            self.out.push('\n');
        }
        self.line.clear();
    }

    fn finish(mut self) -> String {
        self.break_line();
        self.out
    }
}

/// Read a literal string starting just after its opening paren.
fn read_literal(content: &[u8], mut i: usize) -> (String, usize) {
    let mut bytes = Vec::new();
    let mut depth = 1;
    while i < content.len() {
        let c = content[i];
        i += 1;
        match c {
            b'\\' => {
                let Some(&esc) = content.get(i) else { break };
                i += 1;
                match esc {
                    b'n' => bytes.push(b'\n'),
                    b'r' => bytes.push(b'\r'),
                    b't' => bytes.push(b'\t'),
                    b'b' => bytes.push(0x08),
                    b'f' => bytes.push(0x0c),
                    b'0'..=b'7' => {
                        let mut value = u32::from(esc - b'0');
                        for _ in 0..2 {
                            match content.get(i) {
                                Some(&d @ b'0'..=b'7') => {
                                    value = value * 8 + u32::from(d - b'0');
                                    i += 1;
                                }
                                _ => break,
                            }
                        }
                        bytes.push((value & 0xff) as u8);
                    }
                    b'\r' => {
                        if content.get(i) == Some(&b'\n') {
                            i += 1;
                        }
                    }
                    b'\n' => {}
                    other => bytes.push(other),
                }
            }
            b'(' => {
                depth += 1;
                bytes.push(c);
            }
            b')' => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
                bytes.push(c);
            }
            _ => bytes.push(c),
        }
    }
    (decode_string_bytes(&bytes), i)
}

fn decode_hex(hex: &[u8]) -> String {
    let digits: Vec<u8> = hex
        .iter()
        .filter_map(|c| (*c as char).to_digit(16).map(|d| d as u8))
        .collect();
    let bytes: Vec<u8> = digits
        .chunks(2)
        .map(|pair| (pair[0] << 4) | pair.get(1).copied().unwrap_or(0))
        .collect();
    decode_string_bytes(&bytes)
}

/// UTF-16BE when BOM-prefixed, otherwise Latin-1.
fn decode_string_bytes(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xfe, 0xff]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|p| u16::from_be_bytes([p[0], p[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes
        .iter()
        .map(|&b| b as char)
        .filter(|c| !c.is_control() || *c == '\t')
        .collect()
}

fn is_delimiter(c: u8) -> bool {
    c.is_ascii_whitespace() || b"()<>[]{}/%".contains(&c)
}

/// Strip the single end-of-line marker that precedes `endstream`.
fn trim_eol(data: &[u8]) -> &[u8] {
    data.strip_suffix(b"\r\n")
        .or_else(|| data.strip_suffix(b"\n"))
        .or_else(|| data.strip_suffix(b"\r"))
        .unwrap_or(data)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Lay out paragraphs as 11pt Helvetica text on A4 pages.
///
/// Characters outside Latin-1 are replaced with `?`; the standard Type 1
/// fonts carry no wider repertoire.
pub fn write_text_pdf(paragraphs: &[String]) -> Result<Vec<u8>, ConversionError> {
    let mut lines = Vec::new();
    for paragraph in paragraphs {
        for raw_line in paragraph.lines() {
            lines.extend(wrap(raw_line, WRAP_COLUMNS));
        }
        lines.push(String::new());
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    let pages: Vec<&[String]> = if lines.is_empty() {
        vec![&lines[..]]
    } else {
        lines.chunks(LINES_PER_PAGE).collect()
    };

    let mut pdf = PdfBuilder::default();
    pdf.raw(b"%PDF-1.4\n%\xe2\xe3\xcf\xd3\n");

    let kids = (0..pages.len())
        .map(|i| format!("{} 0 R", 4 + 2 * i))
        .collect::<Vec<_>>()
        .join(" ");
    pdf.object(1, b"<< /Type /Catalog /Pages 2 0 R >>");
    pdf.object(
        2,
        format!("<< /Type /Pages /Kids [{kids}] /Count {} >>", pages.len()).as_bytes(),
    );
    pdf.object(
        3,
        b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>",
    );

    for (i, page_lines) in pages.iter().enumerate() {
        let page_id = 4 + 2 * i;
        let content_id = page_id + 1;
        pdf.object(
            page_id,
            format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {PAGE_WIDTH} {PAGE_HEIGHT}] \
                 /Resources << /Font << /F1 3 0 R >> >> /Contents {content_id} 0 R >>"
            )
            .as_bytes(),
        );

        let mut content = format!(
            "BT\n/F1 {FONT_SIZE} Tf\n{LEADING} TL\n{MARGIN} {} Td\n",
            PAGE_HEIGHT - MARGIN - FONT_SIZE
        )
        .into_bytes();
        for line in page_lines.iter() {
            content.push(b'(');
            content.extend(encode_literal(line));
            content.extend_from_slice(b") Tj T*\n");
        }
        content.extend_from_slice(b"ET\n");

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&content)?;
        let compressed = encoder.finish()?;
        pdf.stream(content_id, &compressed);
    }

    Ok(pdf.finish(3 + 2 * pages.len()))
}

#[derive(Default)]
struct PdfBuilder {
    buf: Vec<u8>,
    offsets: Vec<(usize, usize)>,
}

impl PdfBuilder {
    fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn object(&mut self, id: usize, body: &[u8]) {
        self.offsets.push((id, self.buf.len()));
        self.raw(format!("{id} 0 obj\n").as_bytes());
        self.raw(body);
        self.raw(b"\nendobj\n");
    }

    fn stream(&mut self, id: usize, data: &[u8]) {
        self.offsets.push((id, self.buf.len()));
        self.raw(
            format!(
                "{id} 0 obj\n<< /Length {} /Filter /FlateDecode >>\nstream\n",
                data.len()
            )
            .as_bytes(),
        );
        self.raw(data);
        self.raw(b"\nendstream\nendobj\n");
    }

    fn finish(mut self, object_count: usize) -> Vec<u8> {
        self.offsets.sort_unstable();
        let xref_offset = self.buf.len();
        self.raw(format!("xref\n0 {}\n0000000000 65535 f \n", object_count + 1).as_bytes());
        let offsets = std::mem::take(&mut self.offsets);
        for (_, offset) in &offsets {
            self.raw(format!("{offset:010} 00000 n \n").as_bytes());
        }
        self.raw(
            format!(
                "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_offset}\n%%EOF\n",
                object_count + 1
            )
            .as_bytes(),
        );
        self.buf
    }
}

fn encode_literal(line: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len());
    for c in line.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push(b'\\');
                out.push(c as u8);
            }
            '\t' => out.extend_from_slice(b"    "),
            c if (' '..='~').contains(&c) || ('\u{a0}'..='\u{ff}').contains(&c) => {
                out.push(c as u32 as u8);
            }
            _ => out.push(b'?'),
        }
    }
    out
}

/// Greedy word wrap; words longer than `width` are split.
fn wrap(line: &str, width: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for word in line.split_whitespace() {
        let mut word = word.to_string();
        while word.chars().count() > width {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            let split: String = word.chars().take(width).collect();
            word = word.chars().skip(width).collect();
            out.push(split);
        }
        let needed = current.chars().count() + usize::from(!current.is_empty()) + word.chars().count();
        if needed > width && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&word);
    }
    if !current.is_empty() || out.is_empty() {
        out.push(current);
    }
    out
}
