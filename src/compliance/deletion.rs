//! Deletion Scheduler & Executor
//!
//! 検証済みの削除リクエストに実行予定日時を設定し、予定時刻を過ぎたものを
//! データ主体ごとに独立して匿名化する。
//!
//! - 予約中のリクエストは `processing` のまま保持し、実行後に `completed` にする
//! - 取り消しは予定時刻より前のみ可能（予定時刻以降は実行が始まりうるため不可）
//! - 匿名化済みの印（`anonymized_at`）で再実行を検出するため、クラッシュ後の再実行は安全

use super::audit::AuditSink;
use super::registry::{RequestRegistry, TransitionUpdate};
use super::sources::ProfileStore;
use super::types::*;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DeletionScheduler {
    registry: Arc<dyn RequestRegistry>,
    audit: Arc<dyn AuditSink>,
    profiles: Arc<dyn ProfileStore>,
}

impl DeletionScheduler {
    pub fn new(
        registry: Arc<dyn RequestRegistry>,
        audit: Arc<dyn AuditSink>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Self {
        Self {
            registry,
            audit,
            profiles,
        }
    }

    /// 指定リクエストに実行予定日時を設定
    pub async fn schedule_request(
        &self,
        request: &ComplianceRequest,
        when: DateTime<Utc>,
    ) -> Result<ComplianceRequest> {
        let scheduled = self
            .registry
            .set_deletion_schedule(&request.id, when)
            .await?
            .ok_or_else(|| {
                Error::NotFoundOrExpired(format!(
                    "No processing deletion request: {}",
                    request.id
                ))
            })?;

        self.audit
            .append(
                AuditEntry::new(&scheduled.subject_id, AuditAction::DeletionScheduled)
                    .with_record(&scheduled.id)
                    .with_metadata("scheduled_for", when.to_rfc3339()),
            )
            .await?;

        tracing::info!(
            request_id = %scheduled.id,
            subject_id = %scheduled.subject_id,
            scheduled_for = %when,
            "account deletion scheduled"
        );
        Ok(scheduled)
    }

    /// データ主体の処理中の削除リクエストに実行予定日時を設定（再設定を含む）
    pub async fn schedule(&self, subject_id: &str, when: DateTime<Utc>) -> Result<ComplianceRequest> {
        let request = self
            .registry
            .list_by_subject(subject_id)
            .await?
            .into_iter()
            .rev()
            .find(|r| {
                r.request_type == RequestType::DataDeletion && r.status == RequestStatus::Processing
            })
            .ok_or_else(|| {
                Error::NotFoundOrExpired(format!(
                    "No processing deletion request for subject: {}",
                    subject_id
                ))
            })?;
        self.schedule_request(&request, when).await
    }

    /// 予定時刻前の削除予約を取り消す
    ///
    /// 取り消せる予約がない場合（実行済み・予定時刻到達済みを含む）は `None` を返す。
    pub async fn cancel(
        &self,
        subject_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ComplianceRequest>> {
        let candidates: Vec<ComplianceRequest> = self
            .registry
            .list_by_subject(subject_id)
            .await?
            .into_iter()
            .filter(|r| {
                r.request_type == RequestType::DataDeletion
                    && r.status == RequestStatus::Processing
                    && r.deletion_scheduled_at.is_some()
            })
            .collect();

        let mut cancelled = None;
        for request in candidates {
            let Some(done) = self
                .registry
                .cancel_scheduled_deletion(&request.id, now)
                .await?
            else {
                continue;
            };

            self.audit
                .append(
                    AuditEntry::new(&done.subject_id, AuditAction::DeletionCancelled)
                        .with_record(&done.id),
                )
                .await?;
            tracing::info!(request_id = %done.id, subject_id, "account deletion cancelled");
            cancelled = Some(done);
        }

        if cancelled.is_none() {
            tracing::debug!(subject_id, "no cancellable deletion");
        }
        Ok(cancelled)
    }

    /// 予定時刻を過ぎた削除を実行
    ///
    /// 1件の失敗でバッチは中断せず、失敗件数を集計して次の対象に進む。
    pub async fn execute_due(&self, now: DateTime<Utc>) -> Result<DeletionSummary> {
        let due = self.registry.due_deletions(now).await?;
        let mut summary = DeletionSummary::default();

        tracing::info!(due = due.len(), now = %now, "executing scheduled deletions");

        for request in due {
            match self.execute_one(&request, now).await {
                Ok(AnonymizeOutcome::Anonymized) => {
                    summary.processed_count += 1;
                    summary.processed_subject_ids.push(request.subject_id.clone());
                }
                Ok(AnonymizeOutcome::AlreadyAnonymized) => {
                    summary.skipped_count += 1;
                }
                Err(e) => {
                    summary.error_count += 1;
                    let failure = Error::Anonymization {
                        subject_id: request.subject_id.clone(),
                        reason: e.to_string(),
                    };
                    tracing::warn!(
                        request_id = %request.id,
                        subject_id = %request.subject_id,
                        error = %failure,
                        "anonymization failed"
                    );
                    summary.failures.push(DeletionFailure {
                        subject_id: request.subject_id.clone(),
                        request_id: request.id.clone(),
                        reason: e.to_string(),
                    });
                    self.record_failure(&request, &e).await;
                }
            }
        }

        tracing::info!(
            processed = summary.processed_count,
            skipped = summary.skipped_count,
            errors = summary.error_count,
            "scheduled deletions finished"
        );
        Ok(summary)
    }

    async fn execute_one(
        &self,
        request: &ComplianceRequest,
        now: DateTime<Utc>,
    ) -> Result<AnonymizeOutcome> {
        let mut entry = AuditEntry::new(&request.subject_id, AuditAction::AccountAnonymized)
            .with_record(&request.id);
        if let Some(at) = request.deletion_scheduled_at {
            entry = entry.with_metadata("scheduled_for", at.to_rfc3339());
        }

        let outcome = self
            .profiles
            .anonymize(&request.subject_id, now, entry)
            .await?;

        if outcome == AnonymizeOutcome::AlreadyAnonymized {
            tracing::debug!(subject_id = %request.subject_id, "subject already anonymized");
        }

        // 匿名化後にクラッシュした場合もここから再開できる
        let completed = self
            .registry
            .transition(
                &request.id,
                RequestStatus::Processing,
                RequestStatus::Completed,
                TransitionUpdate::processed(now),
            )
            .await?;

        if let Some(completed) = completed {
            self.audit
                .append(
                    AuditEntry::new(&completed.subject_id, AuditAction::RequestCompleted)
                        .with_record(&completed.id)
                        .with_metadata("request_type", completed.request_type.as_str()),
                )
                .await?;
        }
        Ok(outcome)
    }

    /// 失敗を監査ログに残し、再試行しても回復しない場合はリクエストを `failed` にする
    async fn record_failure(&self, request: &ComplianceRequest, error: &Error) {
        let entry = AuditEntry::new(&request.subject_id, AuditAction::AnonymizationFailed)
            .with_record(&request.id)
            .with_metadata("reason", error.reason_code())
            .with_metadata("error", error.to_string())
            .with_metadata("retryable", error.is_retryable());
        if let Err(e) = self.audit.append(entry).await {
            tracing::error!(request_id = %request.id, error = %e, "failed to audit anonymization failure");
        }

        if error.is_retryable() {
            return;
        }

        match self
            .registry
            .transition(
                &request.id,
                RequestStatus::Processing,
                RequestStatus::Failed,
                TransitionUpdate::processed(Utc::now()),
            )
            .await
        {
            Ok(Some(failed)) => {
                let entry = AuditEntry::new(&failed.subject_id, AuditAction::RequestFailed)
                    .with_record(&failed.id)
                    .with_metadata("reason", error.reason_code());
                if let Err(e) = self.audit.append(entry).await {
                    tracing::error!(request_id = %failed.id, error = %e, "failed to audit request failure");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(request_id = %request.id, error = %e, "failed to mark deletion request failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::audit::{entries_with_action, MemoryAuditSink};
    use crate::compliance::registry::MemoryRequestRegistry;
    use crate::compliance::sources::MemoryProfileStore;
    use async_trait::async_trait;
    use chrono::Duration;

    struct Fixture {
        scheduler: DeletionScheduler,
        registry: Arc<MemoryRequestRegistry>,
        profiles: Arc<MemoryProfileStore>,
        audit: Arc<MemoryAuditSink>,
    }

    fn fixture() -> Fixture {
        let audit = Arc::new(MemoryAuditSink::new());
        let registry = Arc::new(MemoryRequestRegistry::new());
        let profiles = Arc::new(MemoryProfileStore::new(audit.clone()));
        let scheduler = DeletionScheduler::new(registry.clone(), audit.clone(), profiles.clone());
        Fixture {
            scheduler,
            registry,
            profiles,
            audit,
        }
    }

    /// `processing` の削除リクエストを作成
    async fn processing_deletion(f: &Fixture, subject: &str) -> ComplianceRequest {
        let token = format!("tok-{}", subject);
        let req = ComplianceRequest::from_new(
            NewRequest::new(subject, RequestType::DataDeletion),
            token.clone(),
            Utc::now(),
            30,
        );
        f.registry.insert(req.clone()).await.unwrap();
        f.registry.redeem_token(&token, Utc::now()).await.unwrap();
        f.registry
            .transition(
                &req.id,
                RequestStatus::Verified,
                RequestStatus::Processing,
                TransitionUpdate::default(),
            )
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_execute_due_anonymizes_once() {
        let f = fixture();
        f.profiles
            .insert(SubjectProfile::new("u1", "alice@example.com"))
            .await;
        let t = Utc::now();
        processing_deletion(&f, "u1").await;
        f.scheduler.schedule("u1", t + Duration::hours(1)).await.unwrap();

        // 予定時刻前は何もしない
        let early = f.scheduler.execute_due(t).await.unwrap();
        assert_eq!(early.processed_count, 0);

        let first = f.scheduler.execute_due(t + Duration::hours(2)).await.unwrap();
        assert_eq!(first.processed_count, 1);
        assert_eq!(first.processed_subject_ids, vec!["u1".to_string()]);

        let second = f.scheduler.execute_due(t + Duration::hours(2)).await.unwrap();
        assert_eq!(second.processed_count, 0);
        assert_eq!(second.error_count, 0);

        let anonymized = entries_with_action(f.audit.as_ref(), "u1", AuditAction::AccountAnonymized)
            .await
            .unwrap();
        assert_eq!(anonymized.len(), 1);

        let requests = f.registry.list_by_subject("u1").await.unwrap();
        assert_eq!(requests[0].status, RequestStatus::Completed);
        assert!(requests[0].processed_at.is_some());
    }

    #[tokio::test]
    async fn test_retry_after_crash_is_skipped() {
        let f = fixture();
        f.profiles
            .insert(SubjectProfile::new("u1", "alice@example.com"))
            .await;
        let t = Utc::now();
        processing_deletion(&f, "u1").await;
        f.scheduler.schedule("u1", t).await.unwrap();

        // 匿名化は確定したがリクエストの完了前に停止した状態を再現
        f.profiles
            .anonymize("u1", t, AuditEntry::new("u1", AuditAction::AccountAnonymized))
            .await
            .unwrap();

        let summary = f.scheduler.execute_due(t + Duration::minutes(1)).await.unwrap();
        assert_eq!(summary.processed_count, 0);
        assert_eq!(summary.skipped_count, 1);

        let requests = f.registry.list_by_subject("u1").await.unwrap();
        assert_eq!(requests[0].status, RequestStatus::Completed);
        let anonymized = entries_with_action(f.audit.as_ref(), "u1", AuditAction::AccountAnonymized)
            .await
            .unwrap();
        assert_eq!(anonymized.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_batch() {
        let f = fixture();
        f.profiles
            .insert(SubjectProfile::new("u2", "bob@example.com"))
            .await;
        let t = Utc::now();
        // u1 has no profile
        processing_deletion(&f, "u1").await;
        processing_deletion(&f, "u2").await;
        f.scheduler.schedule("u1", t).await.unwrap();
        f.scheduler.schedule("u2", t).await.unwrap();

        let summary = f.scheduler.execute_due(t + Duration::minutes(1)).await.unwrap();
        assert_eq!(summary.processed_count, 1);
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.failures[0].subject_id, "u1");
        assert_eq!(summary.processed_subject_ids, vec!["u2".to_string()]);

        // 回復不能な失敗は failed として確定し、再選択されない
        let u1 = f.registry.list_by_subject("u1").await.unwrap();
        assert_eq!(u1[0].status, RequestStatus::Failed);
        let failures = entries_with_action(f.audit.as_ref(), "u1", AuditAction::AnonymizationFailed)
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].metadata["reason"], "not_found_or_expired");
    }

    #[derive(Debug)]
    struct UnavailableProfiles;

    #[async_trait]
    impl ProfileStore for UnavailableProfiles {
        async fn get(&self, _subject_id: &str) -> Result<Option<SubjectProfile>> {
            Err(Error::Persistence("profile store down".to_string()))
        }

        async fn update(&self, _profile: SubjectProfile) -> Result<()> {
            Err(Error::Persistence("profile store down".to_string()))
        }

        async fn set_consent(&self, _subject_id: &str, _consent: ConsentRecord) -> Result<()> {
            Err(Error::Persistence("profile store down".to_string()))
        }

        async fn anonymize(
            &self,
            _subject_id: &str,
            _now: DateTime<Utc>,
            _audit: AuditEntry,
        ) -> Result<AnonymizeOutcome> {
            Err(Error::Persistence("profile store down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_retryable_failure_keeps_request_due() {
        let audit = Arc::new(MemoryAuditSink::new());
        let registry = Arc::new(MemoryRequestRegistry::new());
        let scheduler =
            DeletionScheduler::new(registry.clone(), audit.clone(), Arc::new(UnavailableProfiles));
        let f = Fixture {
            scheduler,
            registry: registry.clone(),
            profiles: Arc::new(MemoryProfileStore::new(audit.clone())),
            audit,
        };
        let t = Utc::now();
        processing_deletion(&f, "u1").await;
        f.scheduler.schedule("u1", t).await.unwrap();

        let summary = f.scheduler.execute_due(t).await.unwrap();
        assert_eq!(summary.error_count, 1);
        assert_eq!(registry.due_deletions(t).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_execution() {
        let f = fixture();
        f.profiles
            .insert(SubjectProfile::new("u1", "alice@example.com"))
            .await;
        let t = Utc::now();
        processing_deletion(&f, "u1").await;
        f.scheduler.schedule("u1", t + Duration::hours(1)).await.unwrap();

        let cancelled = f.scheduler.cancel("u1", t).await.unwrap().unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);

        let summary = f.scheduler.execute_due(t + Duration::hours(2)).await.unwrap();
        assert_eq!(summary.processed_count, 0);
        let profile = f.profiles.get("u1").await.unwrap().unwrap();
        assert!(!profile.is_anonymized());

        // 二度目の取り消しは対象なし
        assert!(f.scheduler.cancel("u1", t).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_schedule_requires_processing_deletion() {
        let f = fixture();
        let result = f.scheduler.schedule("nobody", Utc::now()).await;
        assert!(matches!(result, Err(Error::NotFoundOrExpired(_))));
    }
}
