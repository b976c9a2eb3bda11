//! Result bundler: packages a job's successful outputs into one artifact.

use std::fs::{self, File};
use std::io::{self, Cursor};
use std::sync::Arc;

use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use docbatch_core::JobId;

use crate::conversion::OutputRef;
use crate::staging::{write_atomic, StagingArea};

/// Reference to a result bundle (relative to the staging root).
pub type ArtifactRef = String;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BundleError {
    #[error("nothing to bundle for job {0}")]
    Empty(JobId),

    #[error("output missing: {0}")]
    MissingOutput(String),

    #[error("failed to write bundle: {0}")]
    Write(String),
}

pub trait ResultBundler: Send + Sync {
    fn bundle(&self, job_id: JobId, outputs: &[OutputRef]) -> Result<ArtifactRef, BundleError>;
}

impl<B> ResultBundler for Arc<B>
where
    B: ResultBundler + ?Sized,
{
    fn bundle(&self, job_id: JobId, outputs: &[OutputRef]) -> Result<ArtifactRef, BundleError> {
        (**self).bundle(job_id, outputs)
    }
}

/// Writes `output/<job>.zip`, one deflated entry per output, named by the
/// output's file name.
#[derive(Debug, Clone)]
pub struct ZipBundler {
    staging: Arc<StagingArea>,
}

impl ZipBundler {
    pub fn new(staging: Arc<StagingArea>) -> Self {
        Self { staging }
    }
}

impl ResultBundler for ZipBundler {
    fn bundle(&self, job_id: JobId, outputs: &[OutputRef]) -> Result<ArtifactRef, BundleError> {
        if outputs.is_empty() {
            return Err(BundleError::Empty(job_id));
        }

        let write_err = |e: zip::result::ZipError| BundleError::Write(e.to_string());
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

        for output in outputs {
            let path = self
                .staging
                .resolve(output)
                .map_err(|_| BundleError::MissingOutput(output.clone()))?;
            let entry = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| BundleError::MissingOutput(output.clone()))?
                .to_string();
            let mut source = File::open(&path).map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => BundleError::MissingOutput(output.clone()),
                _ => BundleError::Write(format!("{}: {e}", path.display())),
            })?;

            zip.start_file(entry, options).map_err(write_err)?;
            io::copy(&mut source, &mut zip)
                .map_err(|e| BundleError::Write(format!("{}: {e}", path.display())))?;
        }

        let bytes = zip.finish().map_err(write_err)?.into_inner();
        let artifact = self.staging.bundle_ref(job_id);
        let target = self
            .staging
            .resolve(&artifact)
            .map_err(|e| BundleError::Write(e.to_string()))?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| BundleError::Write(e.to_string()))?;
        }
        write_atomic(&target, &bytes).map_err(|e| BundleError::Write(e.to_string()))?;

        info!(job_id = %job_id, files = outputs.len(), artifact = %artifact, "result bundle written");
        Ok(artifact)
    }
}
