//! Request Registry
//!
//! コンプライアンスリクエストの永続ストア。
//! 状態遷移は全て現在のステータスを条件とした比較交換で行い、
//! 読み取り後の書き込みによる競合を起こさない。

use super::types::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 遷移と同時に書き込むフィールド
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub processed_at: Option<DateTime<Utc>>,
    pub export_url: Option<String>,
    pub export_format: Option<ExportFormat>,
    pub clear_deletion_schedule: bool,
}

impl TransitionUpdate {
    pub fn processed(at: DateTime<Utc>) -> Self {
        Self {
            processed_at: Some(at),
            ..Default::default()
        }
    }

    pub fn with_export(mut self, url: String, format: ExportFormat) -> Self {
        self.export_url = Some(url);
        self.export_format = Some(format);
        self
    }
}

#[async_trait]
pub trait RequestRegistry: Send + Sync + std::fmt::Debug {
    /// 新しいリクエストを保存（トークンが重複する場合は失敗）
    async fn insert(&self, request: ComplianceRequest) -> Result<ComplianceRequest>;

    async fn get(&self, id: &str) -> Result<Option<ComplianceRequest>>;

    async fn list_by_subject(&self, subject_id: &str) -> Result<Vec<ComplianceRequest>>;

    async fn list_all(&self) -> Result<Vec<ComplianceRequest>>;

    /// `pending` のリクエストのみ `verified` に遷移させる
    async fn redeem_token(
        &self,
        token: &str,
        verified_at: DateTime<Utc>,
    ) -> Result<Option<ComplianceRequest>>;

    /// 現在のステータスが `from` の場合のみ `to` に遷移させる
    async fn transition(
        &self,
        id: &str,
        from: RequestStatus,
        to: RequestStatus,
        update: TransitionUpdate,
    ) -> Result<Option<ComplianceRequest>>;

    /// 処理中の削除リクエストに実行予定日時を設定
    async fn set_deletion_schedule(
        &self,
        id: &str,
        when: DateTime<Utc>,
    ) -> Result<Option<ComplianceRequest>>;

    /// 実行予定日時が `now` より後の削除予約のみ取り消す
    async fn cancel_scheduled_deletion(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ComplianceRequest>>;

    /// 実行予定日時を過ぎた未実行の削除リクエスト
    async fn due_deletions(&self, now: DateTime<Utc>) -> Result<Vec<ComplianceRequest>>;
}

fn apply_update(request: &mut ComplianceRequest, to: RequestStatus, update: TransitionUpdate) {
    request.status = to;
    if let Some(at) = update.processed_at {
        request.processed_at = Some(at);
    }
    if let Some(url) = update.export_url {
        request.export_url = Some(url);
    }
    if let Some(format) = update.export_format {
        request.export_format = Some(format);
    }
    if update.clear_deletion_schedule {
        request.deletion_scheduled_at = None;
    }
}

fn is_due_deletion(request: &ComplianceRequest, now: DateTime<Utc>) -> bool {
    request.request_type == RequestType::DataDeletion
        && request.status == RequestStatus::Processing
        && request
            .deletion_scheduled_at
            .map(|at| at <= now)
            .unwrap_or(false)
}

/// インメモリ実装（開発・テスト用）
#[derive(Debug, Default)]
pub struct MemoryRequestRegistry {
    inner: Arc<RwLock<MemoryRegistryState>>,
}

#[derive(Debug, Default)]
struct MemoryRegistryState {
    requests: HashMap<String, ComplianceRequest>,
    /// token -> request id
    tokens: HashMap<String, String>,
}

impl MemoryRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestRegistry for MemoryRequestRegistry {
    async fn insert(&self, request: ComplianceRequest) -> Result<ComplianceRequest> {
        let mut state = self.inner.write().await;

        if state.requests.contains_key(&request.id) {
            return Err(Error::Persistence(format!(
                "Request already exists: {}",
                request.id
            )));
        }
        if state.tokens.contains_key(&request.verification_token) {
            return Err(Error::Persistence(
                "Verification token collision".to_string(),
            ));
        }

        state
            .tokens
            .insert(request.verification_token.clone(), request.id.clone());
        state.requests.insert(request.id.clone(), request.clone());
        Ok(request)
    }

    async fn get(&self, id: &str) -> Result<Option<ComplianceRequest>> {
        let state = self.inner.read().await;
        Ok(state.requests.get(id).cloned())
    }

    async fn list_by_subject(&self, subject_id: &str) -> Result<Vec<ComplianceRequest>> {
        let state = self.inner.read().await;
        let mut result: Vec<ComplianceRequest> = state
            .requests
            .values()
            .filter(|r| r.subject_id == subject_id)
            .cloned()
            .collect();
        result.sort_by_key(|r| r.created_at);
        Ok(result)
    }

    async fn list_all(&self) -> Result<Vec<ComplianceRequest>> {
        let state = self.inner.read().await;
        let mut result: Vec<ComplianceRequest> = state.requests.values().cloned().collect();
        result.sort_by_key(|r| r.created_at);
        Ok(result)
    }

    async fn redeem_token(
        &self,
        token: &str,
        verified_at: DateTime<Utc>,
    ) -> Result<Option<ComplianceRequest>> {
        let mut state = self.inner.write().await;

        let Some(id) = state.tokens.get(token).cloned() else {
            return Ok(None);
        };
        match state.requests.get_mut(&id) {
            Some(request) if request.status == RequestStatus::Pending => {
                request.status = RequestStatus::Verified;
                request.verified_at = Some(verified_at);
                Ok(Some(request.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn transition(
        &self,
        id: &str,
        from: RequestStatus,
        to: RequestStatus,
        update: TransitionUpdate,
    ) -> Result<Option<ComplianceRequest>> {
        if !from.can_transition_to(to) {
            return Err(Error::Validation(format!(
                "Invalid status transition: {} -> {}",
                from, to
            )));
        }

        let mut state = self.inner.write().await;
        match state.requests.get_mut(id) {
            Some(request) if request.status == from => {
                apply_update(request, to, update);
                Ok(Some(request.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn set_deletion_schedule(
        &self,
        id: &str,
        when: DateTime<Utc>,
    ) -> Result<Option<ComplianceRequest>> {
        let mut state = self.inner.write().await;
        match state.requests.get_mut(id) {
            Some(request)
                if request.status == RequestStatus::Processing
                    && request.request_type == RequestType::DataDeletion =>
            {
                request.deletion_scheduled_at = Some(when);
                Ok(Some(request.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn cancel_scheduled_deletion(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ComplianceRequest>> {
        let mut state = self.inner.write().await;
        match state.requests.get_mut(id) {
            Some(request)
                if request.status == RequestStatus::Processing
                    && request.deletion_scheduled_at.map(|at| at > now).unwrap_or(false) =>
            {
                let update = TransitionUpdate {
                    processed_at: Some(now),
                    clear_deletion_schedule: true,
                    ..Default::default()
                };
                apply_update(request, RequestStatus::Cancelled, update);
                Ok(Some(request.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn due_deletions(&self, now: DateTime<Utc>) -> Result<Vec<ComplianceRequest>> {
        let state = self.inner.read().await;
        let mut due: Vec<ComplianceRequest> = state
            .requests
            .values()
            .filter(|r| is_due_deletion(r, now))
            .cloned()
            .collect();
        due.sort_by_key(|r| r.deletion_scheduled_at);
        Ok(due)
    }
}
