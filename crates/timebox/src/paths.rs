//! Filesystem path helpers (XDG-aware) for the LMDB store and upload area.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("unable to determine project directories")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Container providing filesystem paths for the application. In production
/// this is rooted at `$XDG_DATA_HOME/timebox`; tests construct custom
/// instances under a temp dir.
#[derive(Debug, Clone)]
pub struct AppPaths {
    base_dir: PathBuf,
}

impl AppPaths {
    /// Construct paths rooted under `$XDG_DATA_HOME/timebox`.
    pub fn from_project_dirs() -> Result<Self, PathError> {
        let dirs =
            ProjectDirs::from("dev", "timebox", "timebox").ok_or(PathError::MissingProjectDirs)?;
        Self::new(dirs.data_dir())
    }

    /// Construct paths rooted under the provided directory, ensuring it exists.
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, PathError> {
        let base = base.as_ref().to_path_buf();
        ensure_dir(&base)?;
        Ok(Self { base_dir: base })
    }

    /// Base data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.clone()
    }

    /// LMDB environment directory for the work store (`.../lmdb/work`).
    pub fn work_store_lmdb_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["lmdb", "work"])
    }

    /// Directory where uploaded screenshots live (`.../uploads/screenshots`).
    pub fn upload_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["uploads", "screenshots"])
    }

    fn ensure_child(&self, segments: &[&str]) -> Result<PathBuf, PathError> {
        let mut path = self.base_dir.clone();
        for segment in segments {
            path.push(segment);
        }
        ensure_dir(&path)
    }
}

fn ensure_dir(path: &Path) -> Result<PathBuf, PathError> {
    if let Err(err) = fs::create_dir_all(path) {
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(PathError::CreateDir {
                path: path.to_path_buf(),
                source: err,
            });
        }
    }
    Ok(path.to_path_buf())
}
