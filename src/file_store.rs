//! Caller-uploaded files, stored in the session workspace.
//!
//! Uploads are also mirrored into the shared upload area so that later
//! executions in any session can stage them by `{session_id, name}`.

use crate::config::Config;
use crate::error::{ExecError, Result};
use crate::state::Sessions;
use crate::workspace::{list_regular_files, validate_file_name, validate_session_id, Workspaces};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Prefix of the per-request spool directories under the upload root. The
/// leading dot keeps them out of the session id namespace.
const SPOOL_PREFIX: &str = ".incoming-";

/// A file body already on disk, waiting to be committed.
#[derive(Debug)]
struct Spooled {
    name: String,
    content_type: String,
    path: PathBuf,
    size: u64,
    etag: String,
}

/// Upload bodies spooled to disk before anything becomes visible.
///
/// Each file is streamed into a private directory under the upload root and
/// checked against the size limit as it arrives. Nothing reaches a workspace
/// until [`FileStore::upload`] commits the whole batch; dropping the batch
/// discards it.
pub struct UploadBatch {
    dir: TempDir,
    limit: u64,
    files: Vec<Spooled>,
    current: Option<(fs::File, Sha256)>,
}

impl UploadBatch {
    /// Begin the next file. Its name is checked before any byte is written.
    pub async fn start_file(&mut self, name: String, content_type: Option<String>) -> Result<()> {
        self.close_current().await?;
        validate_file_name(&name)?;
        let path = self.dir.path().join(self.files.len().to_string());
        let file = fs::File::create(&path)
            .await
            .map_err(|e| ExecError::io(format!("spool {name}"), e))?;
        self.files.push(Spooled {
            name,
            content_type: content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            path,
            size: 0,
            etag: String::new(),
        });
        self.current = Some((file, Sha256::new()));
        Ok(())
    }

    /// Append to the file started last.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let (Some((file, hasher)), Some(spooled)) = (self.current.as_mut(), self.files.last_mut())
        else {
            return Err(ExecError::InvalidRequest("file data before file start".into()));
        };
        if spooled.size + chunk.len() as u64 > self.limit {
            return Err(ExecError::TooLarge {
                name: spooled.name.clone(),
                limit: self.limit,
            });
        }
        file.write_all(chunk)
            .await
            .map_err(|e| ExecError::io(format!("spool {}", spooled.name), e))?;
        hasher.update(chunk);
        spooled.size += chunk.len() as u64;
        Ok(())
    }

    /// Spool a whole file from memory.
    pub async fn add(&mut self, name: &str, content_type: Option<&str>, data: &[u8]) -> Result<()> {
        self.start_file(name.to_string(), content_type.map(str::to_string))
            .await?;
        self.write(data).await
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    async fn close_current(&mut self) -> Result<()> {
        let Some((mut file, hasher)) = self.current.take() else {
            return Ok(());
        };
        if let Some(spooled) = self.files.last_mut() {
            file.flush()
                .await
                .map_err(|e| ExecError::io(format!("spool {}", spooled.name), e))?;
            spooled.etag = hex::encode(hasher.finalize());
        }
        Ok(())
    }
}

/// How much to report per file when listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Detail {
    #[default]
    Simple,
    Full,
}

impl Detail {
    /// Anything other than `full` is the simple listing.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("full") => Detail::Full,
            _ => Detail::Simple,
        }
    }
}

/// Metadata about a stored file. Never carries content.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileRecord {
    pub name: String,
    pub id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(rename = "lastModified", skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(rename = "contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone)]
pub struct Uploaded {
    pub session_id: String,
    pub files: Vec<FileRecord>,
}

#[derive(Debug, Clone)]
pub struct Download {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Clone)]
pub struct FileStore {
    config: Arc<Config>,
    workspaces: Workspaces,
    sessions: Sessions,
}

impl FileStore {
    pub fn new(config: Arc<Config>, workspaces: Workspaces, sessions: Sessions) -> Self {
        Self {
            config,
            workspaces,
            sessions,
        }
    }

    pub fn max_file_size(&self) -> u64 {
        self.config.max_file_size
    }

    /// Open a batch for the next upload request.
    pub async fn begin_upload(&self) -> Result<UploadBatch> {
        let root = self.workspaces.uploads_root().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| ExecError::io(format!("mkdir {}", root.display()), e))?;
        let dir = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(SPOOL_PREFIX)
                .tempdir_in(&root)
        })
        .await
        .map_err(|e| ExecError::io("spool dir", std::io::Error::other(e)))?
        .map_err(|e| ExecError::io("spool dir", e))?;
        Ok(UploadBatch {
            dir,
            limit: self.config.max_file_size,
            files: Vec::new(),
            current: None,
        })
    }

    /// Commit a spooled batch to a session (a fresh one when `session_id`
    /// is absent). Every file already passed the size check, so a rejected
    /// request never gets here and leaves no trace.
    ///
    /// Mirrors are moved into place with a rename, so staging from another
    /// session sees either the old or the new content, never a partial file.
    pub async fn upload(
        &self,
        session_id: Option<String>,
        mut batch: UploadBatch,
    ) -> Result<Uploaded> {
        let session_id = match session_id.filter(|s| !s.is_empty()) {
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };
        validate_session_id(&session_id)?;
        batch.close_current().await?;
        if batch.is_empty() {
            return Err(ExecError::InvalidRequest("no files in upload".into()));
        }

        let _guard = self.sessions.lock(&session_id).await;
        let workdir = self.workspaces.ensure(&session_id).await?;
        let upload_dir = self.workspaces.upload_path(&session_id)?;
        fs::create_dir_all(&upload_dir)
            .await
            .map_err(|e| ExecError::io(format!("mkdir {}", upload_dir.display()), e))?;

        let mut records = Vec::with_capacity(batch.len());
        for file in std::mem::take(&mut batch.files) {
            let path = workdir.join(&file.name);
            fs::copy(&file.path, &path)
                .await
                .map_err(|e| ExecError::io(format!("write {}", file.name), e))?;
            fs::rename(&file.path, upload_dir.join(&file.name))
                .await
                .map_err(|e| ExecError::io(format!("mirror {}", file.name), e))?;

            self.sessions
                .record_content_type(&session_id, &file.name, &file.content_type)
                .await;
            records.push(
                describe(&path, &file.name, &session_id, &file.content_type, Some(file.etag))
                    .await?,
            );
            debug!(session = %session_id, name = %file.name, size = file.size, "Stored upload");
        }
        info!(session = %session_id, count = records.len(), "Upload complete");
        Ok(Uploaded {
            session_id,
            files: records,
        })
    }

    /// Every regular file in the session workspace.
    pub async fn list(&self, session_id: &str, detail: Detail) -> Result<Vec<FileRecord>> {
        let dir = self.workspaces.path(session_id)?;
        let _guard = self.sessions.lock(session_id).await;
        if !self.workspaces.exists(session_id).await? {
            return Err(ExecError::NotFound("Session".into()));
        }

        let mut records = Vec::new();
        for name in list_regular_files(&dir).await? {
            let record = match detail {
                Detail::Simple => FileRecord {
                    name: name.clone(),
                    id: uuid::Uuid::new_v4().to_string(),
                    session_id: session_id.to_string(),
                    size: None,
                    last_modified: None,
                    etag: None,
                    content_type: None,
                    metadata: None,
                },
                Detail::Full => {
                    let content_type = self.content_type_of(session_id, &name).await;
                    describe(&dir.join(&name), &name, session_id, &content_type, None).await?
                }
            };
            records.push(record);
        }
        Ok(records)
    }

    /// Remove a file from the workspace and from the upload area.
    pub async fn delete(&self, session_id: &str, name: &str) -> Result<()> {
        let path = self.workspaces.file_path(session_id, name)?;
        let _guard = self.sessions.lock(session_id).await;
        ensure_regular_file(&path).await?;
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or_io(e, name))?;

        let mirror = self.workspaces.upload_path(session_id)?.join(name);
        if let Err(e) = fs::remove_file(&mirror).await {
            if e.kind() != ErrorKind::NotFound {
                return Err(ExecError::io(format!("remove mirror {name}"), e));
            }
        }
        self.sessions.forget_file(session_id, name).await;
        info!(session = %session_id, name, "Deleted file");
        Ok(())
    }

    /// Raw bytes of a workspace file.
    pub async fn download(&self, session_id: &str, name: &str) -> Result<Download> {
        let path = self.workspaces.file_path(session_id, name)?;
        let _guard = self.sessions.lock(session_id).await;
        ensure_regular_file(&path).await?;
        let data = fs::read(&path).await.map_err(|e| not_found_or_io(e, name))?;
        Ok(Download {
            name: name.to_string(),
            content_type: self.content_type_of(session_id, name).await,
            data,
        })
    }

    /// Delete the session workspace and its uploads.
    pub async fn purge(&self, session_id: &str) -> Result<()> {
        validate_session_id(session_id)?;
        let _guard = self.sessions.lock(session_id).await;
        self.workspaces.purge(session_id).await?;
        self.sessions.reset(session_id).await;
        Ok(())
    }

    async fn content_type_of(&self, session_id: &str, name: &str) -> String {
        self.sessions
            .content_type(session_id, name)
            .await
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
    }
}

async fn ensure_regular_file(path: &Path) -> Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(ExecError::NotFound(format!("File {name:?}"))),
        Err(e) => Err(not_found_or_io(e, &name)),
    }
}

fn not_found_or_io(e: std::io::Error, name: &str) -> ExecError {
    if e.kind() == ErrorKind::NotFound {
        ExecError::NotFound(format!("File {name:?}"))
    } else {
        ExecError::io(format!("access {name}"), e)
    }
}

async fn describe(
    path: &Path,
    name: &str,
    session_id: &str,
    content_type: &str,
    etag: Option<String>,
) -> Result<FileRecord> {
    let meta = fs::metadata(path)
        .await
        .map_err(|e| ExecError::io(format!("stat {name}"), e))?;
    let last_modified = meta
        .modified()
        .ok()
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Millis, true));
    let etag = match etag {
        Some(etag) => etag,
        None => fingerprint(path).await?,
    };
    let metadata = BTreeMap::from([
        ("content-type".to_string(), content_type.to_string()),
        ("original-filename".to_string(), name.to_string()),
    ]);
    Ok(FileRecord {
        name: name.to_string(),
        id: uuid::Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        size: Some(meta.len()),
        last_modified,
        etag: Some(etag),
        content_type: Some(content_type.to_string()),
        metadata: Some(metadata),
    })
}

/// Hex SHA-256 of a file's bytes.
pub async fn fingerprint(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .await
        .map_err(|e| ExecError::io(format!("open {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| ExecError::io(format!("read {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
