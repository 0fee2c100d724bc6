//! Artifact Storage
//!
//! 生成したエクスポートを保存し、取得用の参照（`export_url`）を返す。
//! 取得手段そのもの（ファイル配信など）はこのクレートの範囲外。

use super::export::ExportArtifact;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait ArtifactStore: Send + Sync + std::fmt::Debug {
    /// 成果物を保存して参照URLを返す
    async fn store(&self, request_id: &str, artifact: &ExportArtifact) -> Result<String>;
}

fn artifact_file_name(request_id: &str, artifact: &ExportArtifact) -> String {
    format!("{}.{}", request_id, artifact.file_extension())
}

/// インメモリ保存（テスト用）
#[derive(Debug, Default, Clone)]
pub struct MemoryArtifactStore {
    artifacts: Arc<RwLock<HashMap<String, ExportArtifact>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, url: &str) -> Option<ExportArtifact> {
        self.artifacts.read().await.get(url).cloned()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn store(&self, request_id: &str, artifact: &ExportArtifact) -> Result<String> {
        let url = format!("memory://exports/{}", artifact_file_name(request_id, artifact));
        let mut artifacts = self.artifacts.write().await;
        artifacts.insert(url.clone(), artifact.clone());
        Ok(url)
    }
}

/// ディレクトリへのファイル保存
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    dir: PathBuf,
    base_url: String,
}

impl FileArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base_url: base_url.into(),
        }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn store(&self, request_id: &str, artifact: &ExportArtifact) -> Result<String> {
        if request_id.contains(|c: char| c == '/' || c == '\\') || request_id.contains("..") {
            return Err(Error::Validation(format!(
                "Invalid request id for artifact: {}",
                request_id
            )));
        }

        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            Error::Persistence(format!(
                "Failed to create artifact directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let file_name = artifact_file_name(request_id, artifact);
        let path = self.dir.join(&file_name);
        tokio::fs::write(&path, artifact.content.as_bytes())
            .await
            .map_err(|e| {
                Error::Persistence(format!(
                    "Failed to write artifact {}: {}",
                    path.display(),
                    e
                ))
            })?;

        tracing::debug!(path = %path.display(), bytes = artifact.size_bytes(), "export artifact written");
        Ok(format!("{}/{}", self.base_url.trim_end_matches('/'), file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::types::ExportFormat;

    fn artifact() -> ExportArtifact {
        ExportArtifact {
            content: "data_type\nuser_account\n".to_string(),
            mime_type: "text/csv".to_string(),
            format: ExportFormat::Csv,
        }
    }

    #[tokio::test]
    async fn test_file_store_writes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path().join("exports"), "https://example.com/exports/");

        let url = store.store("req-1", &artifact()).await.unwrap();
        assert_eq!(url, "https://example.com/exports/req-1.csv");

        let written = std::fs::read_to_string(dir.path().join("exports/req-1.csv")).unwrap();
        assert_eq!(written, "data_type\nuser_account\n");
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path(), "https://example.com");
        assert!(store.store("../escape", &artifact()).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryArtifactStore::new();
        let url = store.store("req-1", &artifact()).await.unwrap();
        assert_eq!(store.get(&url).await.unwrap(), artifact());
    }
}
