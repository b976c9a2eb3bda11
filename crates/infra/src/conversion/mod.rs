//! Conversion function and its dispatch table.
//!
//! Workers never call a converter directly: they hand the task's
//! [`ConversionKind`] to a [`ConverterRegistry`], which looks up the
//! registered [`Converter`].

pub mod docx;
pub mod pdf;
pub mod staged;

pub use staged::StagedConverter;

use std::collections::HashMap;
use std::sync::Arc;

use docbatch_core::{ConversionKind, JobId};

use crate::staging::StagingArea;

/// Reference to a converted output (relative to the staging root).
pub type OutputRef = String;

/// Conversion failure, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConvertError {
    /// Missing, malformed or unsupported input. Retrying cannot help.
    #[error("invalid input: {0}")]
    Input(String),

    /// Anything else (I/O, resource exhaustion). Eligible for retry.
    #[error("conversion failed: {0}")]
    Transient(String),
}

impl ConvertError {
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ConvertError::Transient(_))
    }
}

/// Converts one staged input of a job into an output.
///
/// Must be idempotent: converting the same file twice leaves one complete
/// output behind (last write wins).
pub trait Converter: Send + Sync {
    fn convert(&self, job_id: JobId, filename: &str) -> Result<OutputRef, ConvertError>;
}

impl<F> Converter for F
where
    F: Fn(JobId, &str) -> Result<OutputRef, ConvertError> + Send + Sync,
{
    fn convert(&self, job_id: JobId, filename: &str) -> Result<OutputRef, ConvertError> {
        self(job_id, filename)
    }
}

/// Function table from conversion kind to converter.
#[derive(Clone, Default)]
pub struct ConverterRegistry {
    converters: HashMap<ConversionKind, Arc<dyn Converter>>,
}

impl std::fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("kinds", &self.converters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the staged converter for every known kind.
    pub fn with_defaults(staging: Arc<StagingArea>) -> Self {
        let mut registry = Self::new();
        for kind in ConversionKind::ALL {
            registry.register(kind, StagedConverter::new(staging.clone(), kind));
        }
        registry
    }

    /// Register (or replace) the converter for `kind`.
    pub fn register<C>(&mut self, kind: ConversionKind, converter: C) -> &mut Self
    where
        C: Converter + 'static,
    {
        self.converters.insert(kind, Arc::new(converter));
        self
    }

    /// Same converter for every kind. Handy in tests.
    pub fn uniform<C>(converter: C) -> Self
    where
        C: Converter + 'static,
    {
        let shared: Arc<dyn Converter> = Arc::new(converter);
        Self {
            converters: ConversionKind::ALL
                .into_iter()
                .map(|kind| (kind, shared.clone()))
                .collect(),
        }
    }

    pub fn supports(&self, kind: ConversionKind) -> bool {
        self.converters.contains_key(&kind)
    }

    pub fn convert(
        &self,
        kind: ConversionKind,
        job_id: JobId,
        filename: &str,
    ) -> Result<OutputRef, ConvertError> {
        let converter = self
            .converters
            .get(&kind)
            .ok_or_else(|| ConvertError::input(format!("no converter registered for {kind:?}")))?;
        converter.convert(job_id, filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_by_kind() {
        let mut registry = ConverterRegistry::new();
        registry
            .register(
                ConversionKind::DocxToPdf,
                |_: JobId, name: &str| -> Result<OutputRef, ConvertError> {
                    Ok(format!("docx:{name}"))
                },
            )
            .register(
                ConversionKind::TextToPdf,
                |_: JobId, name: &str| -> Result<OutputRef, ConvertError> {
                    Ok(format!("text:{name}"))
                },
            );

        let job_id = JobId::new();
        assert_eq!(
            registry.convert(ConversionKind::DocxToPdf, job_id, "a.docx"),
            Ok("docx:a.docx".to_string())
        );
        assert_eq!(
            registry.convert(ConversionKind::TextToPdf, job_id, "a.txt"),
            Ok("text:a.txt".to_string())
        );
    }

    #[test]
    fn missing_converter_is_an_input_error() {
        let registry = ConverterRegistry::new();
        let err = registry
            .convert(ConversionKind::DocxToPdf, JobId::new(), "a.docx")
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(!registry.supports(ConversionKind::DocxToPdf));
    }
}
