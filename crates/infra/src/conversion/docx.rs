//! Paragraph text extraction from `.docx` packages.
//!
//! Only the main document part is read, and only visible text runs; styles,
//! tables layout, images and headers are ignored.

use std::io::{Cursor, Read};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::ConvertError;

const DOCUMENT_PART: &str = "word/document.xml";

/// `<w:p>` element, self-closing or with a body. `\b` keeps `<w:pPr>` out.
static RE_PARAGRAPH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<w:p\b[^>]*?(?:/>|>(.*?)</w:p>)").unwrap());

/// Text runs, tabs and breaks, in document order.
static RE_RUN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<w:t(?:\s[^>]*)?>([^<]*)</w:t>|<w:tab\s*/>|<w:(?:br|cr)\b[^>]*/>").unwrap()
});

static RE_ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#x[0-9a-fA-F]+|#[0-9]+|[a-zA-Z]+);").unwrap());

/// Non-empty paragraphs of the document, in order.
pub fn extract_paragraphs(bytes: &[u8]) -> Result<Vec<String>, ConvertError> {
    let mut package = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ConvertError::input(format!("not a docx package: {e}")))?;

    let mut xml = String::new();
    package
        .by_name(DOCUMENT_PART)
        .map_err(|_| ConvertError::input(format!("docx package has no {DOCUMENT_PART}")))?
        .read_to_string(&mut xml)
        .map_err(|e| ConvertError::input(format!("unreadable {DOCUMENT_PART}: {e}")))?;

    Ok(paragraphs_from_xml(&xml))
}

fn paragraphs_from_xml(xml: &str) -> Vec<String> {
    RE_PARAGRAPH
        .captures_iter(xml)
        .filter_map(|p| p.get(1))
        .map(|body| {
            RE_RUN
                .captures_iter(body.as_str())
                .map(|run| match run.get(1) {
                    Some(text) => unescape(text.as_str()),
                    None if run[0].starts_with("<w:tab") => "\t".to_string(),
                    None => " ".to_string(),
                })
                .collect::<String>()
        })
        .filter(|text| !text.trim().is_empty())
        .collect()
}

fn unescape(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    RE_ENTITY
        .replace_all(text, |caps: &Captures| {
            let entity = &caps[1];
            let decoded = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix("#x")
                    .map(|hex| u32::from_str_radix(hex, 16))
                    .or_else(|| entity.strip_prefix('#').map(|dec| dec.parse::<u32>()))
                    .and_then(|code| code.ok())
                    .and_then(char::from_u32),
            };
            decoded.map_or_else(|| caps[0].to_string(), |c| c.to_string())
        })
        .into_owned()
}

/// Minimal `.docx` package holding `paragraphs`.
#[cfg(test)]
pub(crate) fn build_docx(paragraphs: &[&str]) -> Vec<u8> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let body: String = paragraphs
        .iter()
        .map(|p| {
            let escaped = p.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;");
            format!(r#"<w:p><w:pPr><w:pStyle w:val="Normal"/></w:pPr><w:r><w:t xml:space="preserve">{escaped}</w:t></w:r></w:p>"#)
        })
        .collect();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body}<w:sectPr/></w:body></w:document>"#
    );

    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    zip.start_file("[Content_Types].xml", options).unwrap();
    zip.write_all(br#"<?xml version="1.0"?><Types/>"#).unwrap();
    zip.start_file(DOCUMENT_PART, options).unwrap();
    zip.write_all(xml.as_bytes()).unwrap();
    zip.finish().unwrap().into_inner()
}
