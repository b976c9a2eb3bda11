//! Filesystem staging area for job inputs, outputs and result bundles.
//!
//! Layout under the storage root:
//!
//! ```text
//! <root>/temp/<job_id>/<name>        staged inputs
//! <root>/output/<job_id>/<stem>.pdf  converted outputs
//! <root>/output/<job_id>.zip         result bundle
//! ```
//!
//! References handed to the store (`output_ref`, `artifact`) are paths
//! relative to the root, so a store row stays valid if the root moves.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use docbatch_core::{ConversionKind, JobId};

const TEMP_DIR: &str = "temp";
const OUTPUT_DIR: &str = "output";

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    /// Empty, hidden, or path-like file name.
    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    #[error("invalid archive {path}: {reason}")]
    InvalidArchive { path: PathBuf, reason: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StagingError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            StagingError::NotFound(path)
        } else {
            StagingError::Io { path, source }
        }
    }
}

/// Per-job directories on local disk.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    /// Open (and create if needed) a staging area at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StagingError> {
        let area = Self { root: root.into() };
        for dir in [area.root.join(TEMP_DIR), area.root.join(OUTPUT_DIR)] {
            fs::create_dir_all(&dir).map_err(|e| StagingError::io(&dir, e))?;
        }
        Ok(area)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn temp_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(TEMP_DIR).join(job_id.to_string())
    }

    pub fn output_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(OUTPUT_DIR).join(job_id.to_string())
    }

    pub fn input_path(&self, job_id: JobId, name: &str) -> Result<PathBuf, StagingError> {
        validate_name(name)?;
        Ok(self.temp_dir(job_id).join(name))
    }

    /// Relative reference of the bundle for `job_id`.
    pub fn bundle_ref(&self, job_id: JobId) -> String {
        format!("{OUTPUT_DIR}/{job_id}.zip")
    }

    /// Relative reference of a converted output.
    pub fn output_ref(&self, job_id: JobId, name: &str) -> Result<String, StagingError> {
        validate_name(name)?;
        Ok(format!("{OUTPUT_DIR}/{job_id}/{name}"))
    }

    /// Resolve a reference produced by this area to an absolute path.
    pub fn resolve(&self, reference: &str) -> Result<PathBuf, StagingError> {
        let rel = Path::new(reference);
        let safe = !reference.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StagingError::InvalidName(reference.to_string()));
        }
        Ok(self.root.join(rel))
    }

    /// Copy a local file into the job's input directory; returns its name.
    pub fn stage_file(&self, job_id: JobId, source: &Path) -> Result<String, StagingError> {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StagingError::InvalidName(source.display().to_string()))?
            .to_string();
        let target = self.input_path(job_id, &name)?;
        self.ensure_dir(&self.temp_dir(job_id))?;
        fs::copy(source, &target).map_err(|e| StagingError::io(source, e))?;
        debug!(job_id = %job_id, file = %name, "staged input");
        Ok(name)
    }

    /// Write `bytes` as the job input `name`.
    pub fn stage_bytes(&self, job_id: JobId, name: &str, bytes: &[u8]) -> Result<(), StagingError> {
        let target = self.input_path(job_id, name)?;
        self.ensure_dir(&self.temp_dir(job_id))?;
        write_atomic(&target, bytes)
    }

    /// Extract the convertible documents of a zip archive into the job's
    /// input directory.
    ///
    /// Directories, hidden entries and unsupported extensions are skipped,
    /// entries are flattened to their base name, and of several entries that
    /// would convert to the same output (`a.docx`, `dir/a.docx`, `a.txt`)
    /// only the first is kept. Returns the staged names in archive order.
    pub fn extract_archive(&self, job_id: JobId, archive: &Path) -> Result<Vec<String>, StagingError> {
        let file = File::open(archive).map_err(|e| StagingError::io(archive, e))?;
        let invalid = |e: zip::result::ZipError| StagingError::InvalidArchive {
            path: archive.to_path_buf(),
            reason: e.to_string(),
        };
        let mut zip = zip::ZipArchive::new(file).map_err(invalid)?;

        let dir = self.temp_dir(job_id);
        self.ensure_dir(&dir)?;

        let mut staged: Vec<String> = Vec::new();
        let mut outputs = HashSet::new();
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index).map_err(invalid)?;
            if entry.is_dir() {
                continue;
            }
            let entry_name = entry.name().to_string();
            if entry_name.starts_with('.') || entry_name.starts_with("__MACOSX/") {
                continue;
            }
            let Some(base) = entry_name.rsplit('/').next().map(str::to_string) else {
                continue;
            };
            if validate_name(&base).is_err() {
                continue;
            }
            let Some(kind) = ConversionKind::from_filename(&base) else {
                debug!(job_id = %job_id, entry = %entry_name, "skipping unsupported archive entry");
                continue;
            };
            if !outputs.insert(kind.output_name(&base).to_lowercase()) {
                warn!(job_id = %job_id, entry = %entry_name, "file name clashes with an earlier entry; keeping first");
                continue;
            }

            let target = dir.join(&base);
            let mut out = File::create(&target).map_err(|e| StagingError::io(&target, e))?;
            io::copy(&mut entry, &mut out).map_err(|e| StagingError::io(&target, e))?;
            staged.push(base);
        }

        debug!(job_id = %job_id, files = staged.len(), "extracted archive");
        Ok(staged)
    }

    /// Remove staged inputs, outputs and the bundle of a job. Missing
    /// pieces are ignored.
    pub fn cleanup(&self, job_id: JobId) -> Result<(), StagingError> {
        for dir in [self.temp_dir(job_id), self.output_dir(job_id)] {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StagingError::io(&dir, e)),
            }
        }
        let bundle = self.root.join(self.bundle_ref(job_id));
        match fs::remove_file(&bundle) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StagingError::io(&bundle, e)),
        }
        debug!(job_id = %job_id, "cleaned up job storage");
        Ok(())
    }

    pub(crate) fn ensure_dir(&self, dir: &Path) -> Result<(), StagingError> {
        fs::create_dir_all(dir).map_err(|e| StagingError::io(dir, e))
    }
}

/// Write `bytes` to `path` through a sibling temp file and a rename, so
/// readers see either the old file or the complete new one.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StagingError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StagingError::InvalidName(path.display().to_string()))?;
    let tmp = path.with_file_name(format!(".{file_name}.{:016x}.tmp", rand::random::<u64>()));

    let result = File::create(&tmp)
        .and_then(|mut f| {
            f.write_all(bytes)?;
            f.sync_all()
        })
        .and_then(|()| fs::rename(&tmp, path));
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(StagingError::io(path, e));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), StagingError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        return Err(StagingError::InvalidName(name.to_string()));
    }
    Ok(())
}
