//! Consent Ledger
//!
//! 同意設定の変更をプロフィールに上書きし、変更ごとに監査エントリを追記する。
//! 現在値は最後の書き込みが有効で、履歴は監査ログに残る。

use super::audit::{entries_with_action, AuditSink};
use super::sources::{anonymized_subject, ProfileStore};
use super::types::*;
use crate::error::{Error, Result};
use chrono::Utc;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ConsentLedger {
    profiles: Arc<dyn ProfileStore>,
    audit: Arc<dyn AuditSink>,
}

impl ConsentLedger {
    pub fn new(profiles: Arc<dyn ProfileStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { profiles, audit }
    }

    /// 現在の同意状態
    pub async fn current(&self, subject_id: &str) -> Result<ConsentRecord> {
        self.profiles
            .get(subject_id)
            .await?
            .map(|p| p.consent)
            .ok_or_else(|| Error::NotFoundOrExpired(format!("Subject not found: {}", subject_id)))
    }

    /// 同意を更新（未指定のキーは現在値を維持）
    pub async fn update_consent(
        &self,
        subject_id: &str,
        update: &ConsentUpdate,
    ) -> Result<ConsentRecord> {
        self.apply(subject_id, update, None).await
    }

    /// リクエスト処理の一部として同意を更新
    pub(crate) async fn apply(
        &self,
        subject_id: &str,
        update: &ConsentUpdate,
        related_request: Option<&str>,
    ) -> Result<ConsentRecord> {
        if update.is_empty() {
            return Err(Error::Validation(
                "Consent update must set at least one consent".to_string(),
            ));
        }

        let profile = self.profiles.get(subject_id).await?.ok_or_else(|| {
            Error::NotFoundOrExpired(format!("Subject not found: {}", subject_id))
        })?;
        if profile.is_anonymized() {
            return Err(anonymized_subject(subject_id));
        }

        let record = update.merge_into(&profile.consent, Utc::now());
        self.profiles.set_consent(subject_id, record.clone()).await?;

        let changed: Vec<&str> = [
            update.marketing.map(|_| "marketing"),
            update.data_processing.map(|_| "data_processing"),
        ]
        .into_iter()
        .flatten()
        .collect();

        let mut entry = AuditEntry::new(subject_id, AuditAction::ConsentUpdated)
            .with_metadata("marketing", record.marketing_consent)
            .with_metadata("data_processing", record.data_processing_consent)
            .with_metadata("changed", changed.clone());
        if let Some(request_id) = related_request {
            entry = entry.with_record(request_id);
        }
        self.audit.append(entry).await?;

        tracing::info!(
            subject_id,
            changed = ?changed,
            marketing = record.marketing_consent,
            data_processing = record.data_processing_consent,
            "consent updated"
        );
        Ok(record)
    }

    /// 同意変更の履歴（古い順）
    pub async fn history(&self, subject_id: &str) -> Result<Vec<AuditEntry>> {
        entries_with_action(self.audit.as_ref(), subject_id, AuditAction::ConsentUpdated).await
    }
}
