//! Converter reading inputs from, and writing outputs to, a [`StagingArea`].

use std::fs;
use std::io;
use std::sync::Arc;

use tracing::debug;

use docbatch_core::{ConversionKind, JobId};

use super::{docx, pdf, ConvertError, Converter, OutputRef};
use crate::staging::{write_atomic, StagingArea, StagingError};

/// Converts `temp/<job>/<name>` into `output/<job>/<stem>.pdf`.
#[derive(Debug, Clone)]
pub struct StagedConverter {
    staging: Arc<StagingArea>,
    kind: ConversionKind,
}

impl StagedConverter {
    pub fn new(staging: Arc<StagingArea>, kind: ConversionKind) -> Self {
        Self { staging, kind }
    }

    fn paragraphs(&self, bytes: &[u8]) -> Result<Vec<String>, ConvertError> {
        match self.kind {
            ConversionKind::DocxToPdf => docx::extract_paragraphs(bytes),
            ConversionKind::TextToPdf => Ok(String::from_utf8_lossy(bytes)
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect()),
        }
    }
}

impl Converter for StagedConverter {
    fn convert(&self, job_id: JobId, filename: &str) -> Result<OutputRef, ConvertError> {
        let input = self
            .staging
            .input_path(job_id, filename)
            .map_err(|e| ConvertError::input(e.to_string()))?;
        let bytes = fs::read(&input).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                ConvertError::input(format!("input file not found: {}", input.display()))
            }
            _ => ConvertError::transient(format!("failed to read {}: {e}", input.display())),
        })?;

        let document = pdf::render(&self.paragraphs(&bytes)?);

        let output_name = self.kind.output_name(filename);
        let output_ref = self
            .staging
            .output_ref(job_id, &output_name)
            .map_err(|e| ConvertError::input(e.to_string()))?;
        let output_dir = self.staging.output_dir(job_id);
        self.staging
            .ensure_dir(&output_dir)
            .and_then(|()| write_atomic(&output_dir.join(&output_name), &document))
            .map_err(|e: StagingError| ConvertError::transient(e.to_string()))?;

        debug!(job_id = %job_id, file = %filename, output = %output_ref, bytes = document.len(), "converted");
        Ok(output_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::docx::build_docx;

    fn setup() -> (tempfile::TempDir, Arc<StagingArea>, JobId) {
        let dir = tempfile::tempdir().unwrap();
        let staging = Arc::new(StagingArea::open(dir.path()).unwrap());
        (dir, staging, JobId::new())
    }

    #[test]
    fn converts_docx_into_pdf_output() {
        let (_dir, staging, job_id) = setup();
        staging
            .stage_bytes(job_id, "Report.docx", &build_docx(&["Quarterly numbers"]))
            .unwrap();

        let converter = StagedConverter::new(staging.clone(), ConversionKind::DocxToPdf);
        let output_ref = converter.convert(job_id, "Report.docx").unwrap();

        assert_eq!(output_ref, format!("output/{job_id}/Report.pdf"));
        let pdf = fs::read(staging.resolve(&output_ref).unwrap()).unwrap();
        assert!(pdf.starts_with(b"%PDF-"));
    }

    #[test]
    fn converting_twice_leaves_one_output() {
        let (_dir, staging, job_id) = setup();
        staging.stage_bytes(job_id, "notes.txt", b"a\n\nb\n").unwrap();
        let converter = StagedConverter::new(staging.clone(), ConversionKind::TextToPdf);

        let first = converter.convert(job_id, "notes.txt").unwrap();
        let second = converter.convert(job_id, "notes.txt").unwrap();
        assert_eq!(first, second);

        let entries: Vec<_> = fs::read_dir(staging.output_dir(job_id))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("notes.pdf")]);
    }

    #[test]
    fn missing_or_corrupt_input_is_not_retryable() {
        let (_dir, staging, job_id) = setup();
        let converter = StagedConverter::new(staging.clone(), ConversionKind::DocxToPdf);

        let err = converter.convert(job_id, "ghost.docx").unwrap_err();
        assert!(matches!(err, ConvertError::Input(_)));

        staging.stage_bytes(job_id, "bad.docx", b"not a zip").unwrap();
        let err = converter.convert(job_id, "bad.docx").unwrap_err();
        assert!(!err.is_retryable());
    }
}
