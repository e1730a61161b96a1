//! Filesystem operations, optionally confined to one directory

use async_trait::async_trait;
use serde_json::{json, Value};
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;

use ethos_core::{ActionAdapter, ActionDefinition, ActionPayload, ExecutionResult, FileOp};

/// Executes `file` actions
#[derive(Debug, Clone, Default)]
pub struct FileAdapter {
    root: Option<PathBuf>,
}

impl FileAdapter {
    /// Adapter with unrestricted paths
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapter that resolves relative paths under `root` and refuses
    /// anything outside it
    #[must_use]
    pub fn confined(root: impl Into<PathBuf>) -> Self {
        Self { root: Some(root.into()) }
    }

    /// Resolve `path` against the root, if any
    pub fn resolve(&self, path: &Path) -> Result<PathBuf, String> {
        let Some(root) = &self.root else {
            return Ok(path.to_path_buf());
        };
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(format!("path escapes file root: {}", path.display()));
        }
        if path.is_absolute() {
            if path.starts_with(root) {
                return Ok(path.to_path_buf());
            }
            return Err(format!("path outside file root: {}", path.display()));
        }
        Ok(root.join(path))
    }

    async fn run(op: FileOp, path: &Path, contents: Option<&str>) -> io::Result<Value> {
        match op {
            FileOp::Read => {
                let text = tokio::fs::read_to_string(path).await?;
                Ok(json!({ "contents": text }))
            }
            FileOp::Write => {
                let data = contents.unwrap_or_default();
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(path, data).await?;
                Ok(json!({ "bytes": data.len() }))
            }
            FileOp::Append => {
                let data = contents.unwrap_or_default();
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                file.write_all(data.as_bytes()).await?;
                file.flush().await?;
                Ok(json!({ "bytes": data.len() }))
            }
            FileOp::List => {
                let mut entries = tokio::fs::read_dir(path).await?;
                let mut names = Vec::new();
                while let Some(entry) = entries.next_entry().await? {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                names.sort();
                Ok(json!({ "entries": names }))
            }
            FileOp::Delete => {
                tokio::fs::remove_file(path).await?;
                Ok(json!({ "deleted": true }))
            }
            FileOp::Exists => {
                let exists = tokio::fs::try_exists(path).await?;
                Ok(json!({ "exists": exists }))
            }
        }
    }
}

#[async_trait]
impl ActionAdapter for FileAdapter {
    fn name(&self) -> &str {
        "file"
    }

    fn can_handle(&self, action: &ActionDefinition) -> bool {
        matches!(action.payload, ActionPayload::File { .. })
    }

    async fn execute(&self, action: &ActionDefinition) -> ExecutionResult {
        let ActionPayload::File { op, path, contents } = &action.payload else {
            return ExecutionResult::failure("file adapter received a non-file action");
        };
        let path = match self.resolve(path) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(error = %e, "file action refused");
                return ExecutionResult::failure(e);
            }
        };

        match Self::run(*op, &path, contents.as_deref()).await {
            Ok(value) => ExecutionResult::success(value),
            Err(e) => {
                tracing::debug!(path = %path.display(), ?op, error = %e, "file action failed");
                ExecutionResult::failure(format!("{}: {e}", path.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(op: FileOp, path: impl Into<PathBuf>, contents: Option<&str>) -> ActionDefinition {
        ActionDefinition::builder(ActionPayload::File {
            op,
            path: path.into(),
            contents: contents.map(str::to_string),
        })
        .build()
        .unwrap()
    }

    #[tokio::test]
    async fn write_append_read_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileAdapter::confined(dir.path());

        let written = adapter.execute(&file(FileOp::Write, "notes/today.txt", Some("one"))).await;
        assert!(written.ok, "{written:?}");
        adapter
            .execute(&file(FileOp::Append, "notes/today.txt", Some(" two")))
            .await;

        let read = adapter.execute(&file(FileOp::Read, "notes/today.txt", None)).await;
        assert_eq!(read.result.unwrap()["contents"], "one two");

        let listed = adapter.execute(&file(FileOp::List, "notes", None)).await;
        assert_eq!(listed.result.unwrap()["entries"], json!(["today.txt"]));

        assert!(adapter.execute(&file(FileOp::Delete, "notes/today.txt", None)).await.ok);
        let exists = adapter.execute(&file(FileOp::Exists, "notes/today.txt", None)).await;
        assert_eq!(exists.result.unwrap()["exists"], false);
    }

    #[tokio::test]
    async fn confinement_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileAdapter::confined(dir.path().join("jail"));

        let escaped = adapter.execute(&file(FileOp::Read, "../secret", None)).await;
        assert!(!escaped.ok);
        assert!(escaped.error.unwrap().contains("escapes"));

        let outside = adapter.execute(&file(FileOp::Read, dir.path().join("other"), None)).await;
        assert!(!outside.ok);
    }

    #[tokio::test]
    async fn missing_file_is_a_failure_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileAdapter::new();
        let result = adapter
            .execute(&file(FileOp::Read, dir.path().join("absent.txt"), None))
            .await;
        assert!(!result.ok);
        assert!(result.error.is_some());
    }
}
