//! Per-session workspace directories.

use crate::error::{ExecError, Result};
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

const MAX_SESSION_ID_LEN: usize = 128;
const MAX_FILE_NAME_LEN: usize = 255;

/// Reference to a previously uploaded file, staged before a run.
#[derive(Debug, Clone, Deserialize)]
pub struct FileRef {
    #[serde(default)]
    pub id: String,
    pub session_id: String,
    pub name: String,
}

/// Check a session id: ASCII letters, digits, `-` and `_` only.
pub fn validate_session_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(ExecError::InvalidSessionId(id.to_string()))
    }
}

/// Check that a file name is a single path component.
pub fn validate_file_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_FILE_NAME_LEN
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if ok {
        Ok(())
    } else {
        Err(ExecError::InvalidFileName(name.to_string()))
    }
}

/// Layout of the two storage roots.
#[derive(Debug, Clone)]
pub struct Workspaces {
    sessions_root: PathBuf,
    uploads_root: PathBuf,
}

impl Workspaces {
    pub fn new(sessions_root: impl Into<PathBuf>, uploads_root: impl Into<PathBuf>) -> Self {
        Self {
            sessions_root: sessions_root.into(),
            uploads_root: uploads_root.into(),
        }
    }

    /// Create both roots.
    pub async fn init(&self) -> Result<()> {
        for root in [&self.sessions_root, &self.uploads_root] {
            fs::create_dir_all(root)
                .await
                .map_err(|e| ExecError::io(format!("mkdir {}", root.display()), e))?;
        }
        Ok(())
    }

    pub fn uploads_root(&self) -> &Path {
        &self.uploads_root
    }

    /// Workspace path for a session. Pure function of the id.
    pub fn path(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.sessions_root.join(session_id))
    }

    /// Upload-area directory for a session.
    pub fn upload_path(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.uploads_root.join(session_id))
    }

    /// Path of a named file inside a session workspace.
    pub fn file_path(&self, session_id: &str, name: &str) -> Result<PathBuf> {
        validate_file_name(name)?;
        Ok(self.path(session_id)?.join(name))
    }

    pub async fn exists(&self, session_id: &str) -> Result<bool> {
        let dir = self.path(session_id)?;
        Ok(fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false))
    }

    /// Create the workspace if needed. Safe to repeat and to race.
    pub async fn ensure(&self, session_id: &str) -> Result<PathBuf> {
        let dir = self.path(session_id)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| ExecError::io(format!("mkdir {}", dir.display()), e))?;
        Ok(dir)
    }

    /// Copy referenced uploads into the workspace. Missing sources are
    /// skipped. Returns the names that were staged.
    pub async fn stage(&self, session_id: &str, refs: &[FileRef]) -> Result<Vec<String>> {
        let dir = self.ensure(session_id).await?;
        let mut staged = Vec::with_capacity(refs.len());
        for file in refs {
            let source = match self
                .upload_path(&file.session_id)
                .and_then(|up| validate_file_name(&file.name).map(|_| up.join(&file.name)))
            {
                Ok(source) => source,
                Err(e) => {
                    warn!(session = %session_id, error = %e, "Skipping file reference");
                    continue;
                }
            };
            match fs::copy(&source, dir.join(&file.name)).await {
                Ok(bytes) => {
                    debug!(session = %session_id, name = %file.name, bytes, "Staged file");
                    staged.push(file.name.clone());
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(session = %session_id, name = %file.name, "Upload not found, skipping");
                }
                Err(e) => {
                    return Err(ExecError::io(format!("stage {}", file.name), e));
                }
            }
        }
        Ok(staged)
    }

    /// Every regular file in the workspace except `exclude`, sorted by name.
    pub async fn list_artifacts(&self, session_id: &str, exclude: &str) -> Result<Vec<String>> {
        let dir = self.path(session_id)?;
        let mut names = list_regular_files(&dir).await?;
        names.retain(|name| name != exclude);
        Ok(names)
    }

    /// Remove the workspace and the session's upload area.
    pub async fn purge(&self, session_id: &str) -> Result<()> {
        for dir in [self.path(session_id)?, self.upload_path(session_id)?] {
            remove_dir_tolerant(&dir).await?;
        }
        info!(session = %session_id, "Purged workspace");
        Ok(())
    }
}

/// Names of regular files directly inside `dir`, sorted.
pub async fn list_regular_files(dir: &Path) -> Result<Vec<String>> {
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| ExecError::io(format!("read {}", dir.display()), e))?;
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ExecError::io(format!("read {}", dir.display()), e))?
    {
        // file_type() does not follow symlinks, so links out of the
        // workspace are never reported.
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

async fn remove_dir_tolerant(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ExecError::io(format!("remove {}", dir.display()), e)),
    }
}
