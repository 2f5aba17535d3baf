//! Local directory connector.
//!
//! Emits one `folder` entity per directory below `root` and one `file` entity per
//! regular file, each carrying the chain of enclosing folders as breadcrumbs.
//! Incremental sync uses the file modification time (milliseconds since epoch) as
//! the checkpoint. Every run walks the whole tree: folders are always re-emitted,
//! files at or before the checkpoint are reported as unchanged without reading
//! them, so removed files and folders are deleted by incremental runs too.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::{stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tributary_core::{
    Breadcrumb, Checkpoint, Connection, ConnectorCapabilities, ConnectorFactory, Credentials,
    EntitySchema, Error, FieldKind, RawRecord, RecordStream, Result, SourceConnector,
};

pub const CONNECTOR_TYPE: &str = "local_files";
pub const FOLDER: &str = "folder";
pub const FILE: &str = "file";

fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalFilesSettings {
    pub root: PathBuf,
    /// Only files with one of these extensions (without the dot, case-insensitive).
    /// Empty means every file.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Files larger than this are emitted without `content`.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default)]
    pub include_hidden: bool,
}

impl LocalFilesSettings {
    pub fn parse(settings: &serde_json::Value) -> Result<Self> {
        let parsed: Self = serde_json::from_value(settings.clone())
            .map_err(|e| Error::InvalidInput(format!("local_files settings: {e}")))?;
        if parsed.root.as_os_str().is_empty() {
            return Err(Error::InvalidInput("local_files root is empty".to_string()));
        }
        Ok(parsed)
    }

    fn wants(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.extensions
            .iter()
            .any(|want| want.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }
}

pub struct LocalFilesFactory;

#[async_trait]
impl ConnectorFactory for LocalFilesFactory {
    fn connector_type(&self) -> &'static str {
        CONNECTOR_TYPE
    }

    fn validate_settings(&self, settings: &serde_json::Value) -> Result<()> {
        LocalFilesSettings::parse(settings).map(|_| ())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(connection_id = %connection.id))]
    async fn build(
        &self,
        connection: &Connection,
        _credentials: Credentials,
    ) -> Result<Arc<dyn SourceConnector>> {
        let settings = LocalFilesSettings::parse(&connection.settings)?;
        Ok(Arc::new(LocalFilesConnector::new(settings)))
    }
}

#[derive(Debug, Clone)]
pub struct LocalFilesConnector {
    settings: LocalFilesSettings,
}

#[derive(Debug, Clone)]
struct FolderItem {
    rel: String,
    name: String,
    crumbs: Vec<Breadcrumb>,
}

#[derive(Debug, Clone)]
struct FileItem {
    abs: PathBuf,
    rel: String,
    name: String,
    crumbs: Vec<Breadcrumb>,
    size: u64,
    modified_ms: i64,
    modified: DateTime<Utc>,
    accessed: Option<DateTime<Utc>>,
}

/// Snapshot of the tree taken when `extract` is called. File contents are read
/// lazily as the stream is polled.
#[derive(Debug, Default)]
struct Walk {
    folders: Vec<FolderItem>,
    files: Vec<FileItem>,
}

impl LocalFilesConnector {
    pub fn new(settings: LocalFilesSettings) -> Self {
        Self { settings }
    }

    async fn walk(&self) -> Result<Walk> {
        let root = &self.settings.root;
        let meta = tokio::fs::metadata(root)
            .await
            .map_err(|e| io_err("stat root", root, e))?;
        if !meta.is_dir() {
            return Err(Error::PermanentSource(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let mut walk = Walk::default();
        let mut pending: Vec<(PathBuf, Vec<String>)> = vec![(root.clone(), Vec::new())];
        while let Some((dir, parts)) = pending.pop() {
            let crumbs = breadcrumbs(&parts);
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| io_err("read dir", &dir, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_err("read dir", &dir, e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') && !self.settings.include_hidden {
                    continue;
                }
                let path = entry.path();
                let file_type = match entry.file_type().await {
                    Ok(t) => t,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(io_err("stat", &path, e)),
                };
                let mut child_parts = parts.clone();
                child_parts.push(name.clone());
                let rel = child_parts.join("/");

                if file_type.is_dir() {
                    walk.folders.push(FolderItem {
                        rel,
                        name,
                        crumbs: crumbs.clone(),
                    });
                    pending.push((path, child_parts));
                } else if file_type.is_file() && self.settings.wants(&path) {
                    let meta = match entry.metadata().await {
                        Ok(m) => m,
                        Err(e) if e.kind() == ErrorKind::NotFound => continue,
                        Err(e) => return Err(io_err("stat", &path, e)),
                    };
                    let modified = meta
                        .modified()
                        .map_err(|e| io_err("read mtime", &path, e))?;
                    let modified = DateTime::<Utc>::from(modified);
                    walk.files.push(FileItem {
                        abs: path,
                        rel,
                        name,
                        crumbs: crumbs.clone(),
                        size: meta.len(),
                        modified_ms: modified.timestamp_millis(),
                        modified,
                        accessed: meta.accessed().ok().map(DateTime::<Utc>::from),
                    });
                }
                // Symlinks are not followed.
            }
        }

        // Parents before children, then oldest change first so each checkpoint
        // covers everything emitted before it.
        walk.folders.sort_by(|a, b| a.rel.cmp(&b.rel));
        walk.files
            .sort_by(|a, b| (a.modified_ms, &a.rel).cmp(&(b.modified_ms, &b.rel)));
        Ok(walk)
    }
}

fn breadcrumbs(parts: &[String]) -> Vec<Breadcrumb> {
    (1..=parts.len())
        .map(|n| Breadcrumb::new(FOLDER, parts[..n].join("/")).named(parts[n - 1].clone()))
        .collect()
}

fn io_err(context: &str, path: &Path, e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => {
            Error::PermanentSource(format!("{context} {}: {e}", path.display()))
        }
        ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
            Error::TransientNetwork(format!("{context} {}: {e}", path.display()))
        }
        _ => Error::backend(format!("{context} {}", path.display()), e),
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn since_millis(since: Option<&Checkpoint>) -> Result<Option<i64>> {
    match since {
        None => Ok(None),
        Some(c) => c.value.as_i64().map(Some).ok_or_else(|| {
            Error::InvalidInput(format!("local_files checkpoint is not an integer: {}", c.value))
        }),
    }
}

fn folder_record(item: FolderItem) -> Result<RawRecord> {
    Ok(RawRecord::new(
        FOLDER,
        item.rel.clone(),
        json!({ "path": item.rel, "name": item.name }),
    )?
    .with_breadcrumbs(item.crumbs))
}

async fn file_record(
    item: FileItem,
    checkpoint: Option<Checkpoint>,
    max_file_bytes: u64,
) -> Option<Result<RawRecord>> {
    let content = if item.size <= max_file_bytes {
        match tokio::fs::read(&item.abs).await {
            Ok(bytes) => String::from_utf8(bytes).ok(),
            // Removed after the walk: a later full run will delete it.
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => return Some(Err(io_err("read", &item.abs, e))),
        }
    } else {
        None
    };

    let mut payload = json!({
        "path": item.rel,
        "name": item.name,
        "size_bytes": item.size,
        "modified_at": rfc3339(item.modified),
    });
    if let Some(ext) = item.abs.extension().and_then(|e| e.to_str()) {
        payload["extension"] = json!(ext.to_ascii_lowercase());
    }
    if let Some(accessed) = item.accessed {
        payload["accessed_at"] = json!(rfc3339(accessed));
    }
    if let Some(content) = content {
        payload["content"] = json!(content);
    }

    let record = match RawRecord::new(FILE, item.rel, payload) {
        Ok(r) => r.with_breadcrumbs(item.crumbs),
        Err(e) => return Some(Err(e)),
    };
    Some(Ok(match checkpoint {
        Some(c) => record.with_checkpoint(c),
        None => record,
    }))
}

#[async_trait]
impl SourceConnector for LocalFilesConnector {
    fn connector_type(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            supports_incremental: true,
            lists_unchanged: true,
        }
    }

    fn schemas(&self) -> Vec<EntitySchema> {
        vec![
            EntitySchema::new(FOLDER)
                .required("path", FieldKind::String)
                .required("name", FieldKind::String),
            EntitySchema::new(FILE)
                .required("path", FieldKind::String)
                .required("name", FieldKind::String)
                .required("size_bytes", FieldKind::Integer)
                .required("modified_at", FieldKind::Timestamp)
                .optional("extension", FieldKind::String)
                .optional("content", FieldKind::String)
                .optional("accessed_at", FieldKind::Timestamp)
                .exclude_from_hash("accessed_at")
                .updated_at("modified_at"),
        ]
    }

    #[tracing::instrument(level = "info", skip(self), fields(root = %self.settings.root.display()))]
    async fn extract(&self, since: Option<Checkpoint>) -> Result<RecordStream> {
        let since_ms = since_millis(since.as_ref())?;
        let walk = self.walk().await?;

        let (files, unchanged): (Vec<FileItem>, Vec<FileItem>) = walk
            .files
            .into_iter()
            .partition(|f| since_ms.map_or(true, |s| f.modified_ms > s));
        tracing::debug!(
            folders = walk.folders.len(),
            files = files.len(),
            unchanged = unchanged.len(),
            since_ms,
            "local_files walk"
        );

        // A checkpoint goes on the last file of each equal-mtime run.
        let mut planned = Vec::with_capacity(files.len());
        for (i, file) in files.iter().enumerate() {
            let closes_run = files
                .get(i + 1)
                .map_or(true, |next| next.modified_ms > file.modified_ms);
            let checkpoint = closes_run.then(|| Checkpoint::new(json!(file.modified_ms)));
            planned.push((file.clone(), checkpoint));
        }

        let max_file_bytes = self.settings.max_file_bytes;
        let folders = stream::iter(walk.folders.into_iter().map(folder_record));
        let unchanged = stream::iter(
            unchanged
                .into_iter()
                .map(|f| RawRecord::unchanged(FILE, f.rel)),
        );
        let files = stream::iter(planned).filter_map(move |(file, checkpoint)| {
            file_record(file, checkpoint, max_file_bytes)
        });
        Ok(folders.chain(unchanged).chain(files).boxed())
    }
}
