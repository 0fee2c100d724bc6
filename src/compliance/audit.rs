//! Audit Sink
//!
//! 追記専用の監査ログ。エンジンはエントリを変更・削除しない。

use super::types::{AuditAction, AuditEntry};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait AuditSink: Send + Sync + std::fmt::Debug {
    async fn append(&self, entry: AuditEntry) -> Result<()>;

    /// データ主体のエントリを古い順に返す
    async fn list_for_subject(&self, subject_id: &str) -> Result<Vec<AuditEntry>>;

    async fn count(&self) -> Result<usize>;
}

/// 特定アクションのエントリのみ抽出
pub async fn entries_with_action(
    sink: &dyn AuditSink,
    subject_id: &str,
    action: AuditAction,
) -> Result<Vec<AuditEntry>> {
    Ok(sink
        .list_for_subject(subject_id)
        .await?
        .into_iter()
        .filter(|e| e.is(action))
        .collect())
}

/// インメモリ監査ログ
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        tracing::debug!(
            subject_id = %entry.subject_id,
            action = %entry.action,
            "audit entry appended"
        );
        let mut entries = self.entries.write().await;
        entries.push(entry);
        Ok(())
    }

    async fn list_for_subject(&self, subject_id: &str) -> Result<Vec<AuditEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.subject_id == subject_id)
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_filter_by_subject_and_action() {
        let sink = MemoryAuditSink::new();
        sink.append(AuditEntry::new("u1", AuditAction::ConsentUpdated))
            .await
            .unwrap();
        sink.append(AuditEntry::new("u1", AuditAction::RequestCreated))
            .await
            .unwrap();
        sink.append(AuditEntry::new("u2", AuditAction::ConsentUpdated))
            .await
            .unwrap();

        assert_eq!(sink.count().await.unwrap(), 3);
        assert_eq!(sink.list_for_subject("u1").await.unwrap().len(), 2);

        let consent = entries_with_action(&sink, "u1", AuditAction::ConsentUpdated)
            .await
            .unwrap();
        assert_eq!(consent.len(), 1);
        assert_eq!(consent[0].action, "consent_updated");
    }
}
