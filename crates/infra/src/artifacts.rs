//! Filesystem storage for uploaded inputs and processed outputs.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Prefix applied to processed artifacts and their download names.
pub const OUTPUT_PREFIX: &str = "processed_";

const DEFAULT_CONTENT_TYPE: &str = "audio/wav";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(PathBuf),

    #[error("artifact io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ArtifactError {
    fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            ArtifactError::NotFound(path.to_path_buf())
        } else {
            ArtifactError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Upload and output directories.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    upload_dir: PathBuf,
    output_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(upload_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub async fn ensure_dirs(&self) -> Result<(), ArtifactError> {
        for dir in [&self.upload_dir, &self.output_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ArtifactError::io(dir, e))?;
        }
        Ok(())
    }

    pub fn input_path(&self, stored_filename: &str) -> PathBuf {
        self.upload_dir.join(stored_filename)
    }

    pub fn output_path(&self, stored_filename: &str) -> PathBuf {
        self.output_dir.join(format!("{OUTPUT_PREFIX}{stored_filename}"))
    }

    /// Write an uploaded file; returns its location.
    pub async fn save_input(&self, stored_filename: &str, bytes: &[u8]) -> Result<PathBuf, ArtifactError> {
        let path = self.input_path(stored_filename);
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| ArtifactError::io(&path, e))?;
        file.write_all(bytes).await.map_err(|e| ArtifactError::io(&path, e))?;
        file.flush().await.map_err(|e| ArtifactError::io(&path, e))?;
        debug!(path = %path.display(), bytes = bytes.len(), "stored upload");
        Ok(path)
    }

    pub async fn exists(&self, path: impl AsRef<Path>) -> bool {
        tokio::fs::try_exists(path.as_ref()).await.unwrap_or(false)
    }

    pub async fn size(&self, path: impl AsRef<Path>) -> Result<u64, ArtifactError> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path).await.map_err(|e| ArtifactError::io(path, e))?;
        Ok(meta.len())
    }

    pub async fn open(&self, path: impl AsRef<Path>) -> Result<tokio::fs::File, ArtifactError> {
        let path = path.as_ref();
        tokio::fs::File::open(path).await.map_err(|e| ArtifactError::io(path, e))
    }

    /// Best-effort removal. A missing file is reported as `Ok(false)`.
    pub async fn remove(&self, path: impl AsRef<Path>) -> Result<bool, ArtifactError> {
        let path = path.as_ref();
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "artifact already missing");
                Ok(false)
            }
            Err(e) => Err(ArtifactError::io(path, e)),
        }
    }
}

/// Download name for a processed job.
pub fn download_filename(original_filename: &str) -> String {
    format!("{OUTPUT_PREFIX}{original_filename}")
}

/// Content type guessed from the file extension.
pub fn content_type_for(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
}

/// Lower-cased extension including the dot (e.g. `.wav`).
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
}
