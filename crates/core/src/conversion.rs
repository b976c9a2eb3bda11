//! Kinds of document conversion the pipeline knows how to dispatch.

use serde::{Deserialize, Serialize};

/// Conversion routed to a registered converter.
///
/// Resolved from the source file extension at submission time and carried
/// on every task message, so workers never inspect file contents to decide
/// which converter to call.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionKind {
    /// Word document (`.docx`) to PDF.
    DocxToPdf,
    /// Plain text (`.txt`) to PDF.
    TextToPdf,
}

impl ConversionKind {
    pub const ALL: [ConversionKind; 2] = [ConversionKind::DocxToPdf, ConversionKind::TextToPdf];

    /// Pick the conversion for a file name, case-insensitively by extension.
    pub fn from_filename(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "docx" => Some(ConversionKind::DocxToPdf),
            "txt" => Some(ConversionKind::TextToPdf),
            _ => None,
        }
    }

    pub fn output_extension(&self) -> &'static str {
        match self {
            ConversionKind::DocxToPdf | ConversionKind::TextToPdf => "pdf",
        }
    }

    /// Output file name for `source`: same stem, target extension.
    pub fn output_name(&self, source: &str) -> String {
        let stem = source.rsplit_once('.').map_or(source, |(stem, _)| stem);
        format!("{stem}.{}", self.output_extension())
    }
}
