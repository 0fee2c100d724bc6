//! Request Dispatcher
//!
//! 検証済みのリクエストを種類ごとの処理に振り分け、終端状態を記録する。
//!
//! 処理前に `verified -> processing` へ、処理後に `processing -> completed | failed` へ
//! いずれも比較交換で遷移させるため、同じリクエストを二重に処理しても副作用は一度だけ。
//! 失敗理由は監査ログにのみ残し、リクエスト自体には書き込まない。

use super::aggregator::DataAggregator;
use super::artifacts::ArtifactStore;
use super::audit::AuditSink;
use super::consent::ConsentLedger;
use super::deletion::DeletionScheduler;
use super::export;
use super::registry::{RequestRegistry, TransitionUpdate};
use super::sources::{anonymized_subject, ProfileStore};
use super::types::*;
use crate::error::{Error, Result};
use chrono::Utc;
use std::sync::Arc;

/// 処理結果
enum HandlerOutcome {
    /// 処理完了（遷移時に書き込むフィールド付き）
    Completed(TransitionUpdate),
    /// `processing` のまま後続処理を待つ（削除予約）
    Deferred(ComplianceRequest),
}

#[derive(Debug, Clone)]
pub struct RequestDispatcher {
    registry: Arc<dyn RequestRegistry>,
    audit: Arc<dyn AuditSink>,
    profiles: Arc<dyn ProfileStore>,
    aggregator: Arc<DataAggregator>,
    artifacts: Arc<dyn ArtifactStore>,
    consent: ConsentLedger,
    deletions: DeletionScheduler,
    default_format: ExportFormat,
    deletion_grace: chrono::Duration,
}

impl RequestDispatcher {
    pub fn new(
        registry: Arc<dyn RequestRegistry>,
        audit: Arc<dyn AuditSink>,
        profiles: Arc<dyn ProfileStore>,
        aggregator: Arc<DataAggregator>,
        artifacts: Arc<dyn ArtifactStore>,
        consent: ConsentLedger,
        deletions: DeletionScheduler,
    ) -> Self {
        Self {
            registry,
            audit,
            profiles,
            aggregator,
            artifacts,
            consent,
            deletions,
            default_format: ExportFormat::Json,
            deletion_grace: chrono::Duration::days(30),
        }
    }

    pub fn with_default_format(mut self, format: ExportFormat) -> Self {
        self.default_format = format;
        self
    }

    /// 削除実行までの猶予期間
    pub fn with_deletion_grace(mut self, grace: chrono::Duration) -> Self {
        self.deletion_grace = grace;
        self
    }

    /// 検証済みリクエストを処理
    ///
    /// 既に他の処理系が着手している場合は何もせず現在の記録を返す。
    /// 処理の失敗は `failed` の記録として返し、エラーにはしない。
    pub async fn dispatch(&self, request: &ComplianceRequest) -> Result<ComplianceRequest> {
        let Some(processing) = self
            .registry
            .transition(
                &request.id,
                RequestStatus::Verified,
                RequestStatus::Processing,
                TransitionUpdate::default(),
            )
            .await?
        else {
            tracing::debug!(request_id = %request.id, "request already dispatched");
            return self.current(&request.id).await;
        };

        // 遷移後のエラーは全て `failed` として記録し、`processing` に残さない
        match self.process(&processing).await {
            Ok(done) => Ok(done),
            Err(e) => self.fail(&processing, &e).await,
        }
    }

    async fn process(&self, processing: &ComplianceRequest) -> Result<ComplianceRequest> {
        self.audit
            .append(
                AuditEntry::new(&processing.subject_id, AuditAction::RequestProcessing)
                    .with_record(&processing.id)
                    .with_metadata("request_type", processing.request_type.as_str()),
            )
            .await?;

        tracing::info!(
            request_id = %processing.id,
            request_type = %processing.request_type,
            "dispatching compliance request"
        );

        match self.handle(processing).await? {
            HandlerOutcome::Completed(update) => self.complete(processing, update).await,
            HandlerOutcome::Deferred(request) => Ok(request),
        }
    }

    async fn handle(&self, request: &ComplianceRequest) -> Result<HandlerOutcome> {
        match &request.request_type {
            RequestType::DataExport | RequestType::DataPortability => self.export(request).await,
            RequestType::DataDeletion => self.schedule_deletion(request).await,
            RequestType::DataRectification => self.rectify(request).await,
            RequestType::ConsentWithdrawal => self.withdraw_consent(request).await,
            RequestType::ProcessingRestriction => self.restrict(request).await,
            RequestType::Unrecognized(name) => Err(Error::UnsupportedRequestType(name.clone())),
        }
    }

    /// アクセス権・ポータビリティ権: 集約してエクスポートを保存
    async fn export(&self, request: &ComplianceRequest) -> Result<HandlerOutcome> {
        let format = request.export_format.unwrap_or(self.default_format);
        let document = self.aggregator.collect(&request.subject_id).await?;
        let artifact = export::serialize(&document, format)?;
        let url = self.artifacts.store(&request.id, &artifact).await?;

        self.audit
            .append(
                AuditEntry::new(&request.subject_id, AuditAction::DataExported)
                    .with_record(&request.id)
                    .with_metadata("format", format.as_str())
                    .with_metadata("size_bytes", artifact.size_bytes())
                    .with_metadata(
                        "sections",
                        document
                            .sections
                            .keys()
                            .map(|c| c.section_name())
                            .collect::<Vec<_>>(),
                    ),
            )
            .await?;

        Ok(HandlerOutcome::Completed(
            TransitionUpdate::processed(Utc::now()).with_export(url, format),
        ))
    }

    /// 削除権: 猶予期間後の匿名化を予約
    async fn schedule_deletion(&self, request: &ComplianceRequest) -> Result<HandlerOutcome> {
        let when = Utc::now()
            .checked_add_signed(self.deletion_grace)
            .ok_or_else(|| Error::Config("deletion grace period out of range".to_string()))?;
        let scheduled = self.deletions.schedule_request(request, when).await?;
        Ok(HandlerOutcome::Deferred(scheduled))
    }

    /// 訂正権: プロフィールに訂正内容を適用
    async fn rectify(&self, request: &ComplianceRequest) -> Result<HandlerOutcome> {
        let corrections = request.corrections.as_ref().ok_or_else(|| {
            Error::Validation("data_rectification requires corrections".to_string())
        })?;
        let profile = self.live_profile(&request.subject_id).await?;

        self.profiles.update(profile.corrected(corrections)).await?;
        self.audit
            .append(
                AuditEntry::new(&request.subject_id, AuditAction::ProfileRectified)
                    .with_record(&request.id)
                    .with_metadata("fields", corrections.field_names()),
            )
            .await?;

        Ok(HandlerOutcome::Completed(TransitionUpdate::processed(Utc::now())))
    }

    /// 同意撤回: 全ての同意を撤回
    async fn withdraw_consent(&self, request: &ComplianceRequest) -> Result<HandlerOutcome> {
        self.consent
            .apply(
                &request.subject_id,
                &ConsentUpdate::withdraw_all(),
                Some(&request.id),
            )
            .await?;
        Ok(HandlerOutcome::Completed(TransitionUpdate::processed(Utc::now())))
    }

    /// 処理制限権: 処理制限フラグを立てる
    async fn restrict(&self, request: &ComplianceRequest) -> Result<HandlerOutcome> {
        let mut profile = self.live_profile(&request.subject_id).await?;
        let already_restricted = profile.processing_restricted;
        if !already_restricted {
            profile.processing_restricted = true;
            self.profiles.update(profile).await?;
        }

        self.audit
            .append(
                AuditEntry::new(&request.subject_id, AuditAction::ProcessingRestricted)
                    .with_record(&request.id)
                    .with_metadata("already_restricted", already_restricted),
            )
            .await?;

        Ok(HandlerOutcome::Completed(TransitionUpdate::processed(Utc::now())))
    }

    async fn live_profile(&self, subject_id: &str) -> Result<SubjectProfile> {
        let profile = self.profiles.get(subject_id).await?.ok_or_else(|| {
            Error::NotFoundOrExpired(format!("Subject not found: {}", subject_id))
        })?;
        if profile.is_anonymized() {
            return Err(anonymized_subject(subject_id));
        }
        Ok(profile)
    }

    async fn complete(
        &self,
        request: &ComplianceRequest,
        update: TransitionUpdate,
    ) -> Result<ComplianceRequest> {
        let Some(completed) = self
            .registry
            .transition(
                &request.id,
                RequestStatus::Processing,
                RequestStatus::Completed,
                update,
            )
            .await?
        else {
            return self.current(&request.id).await;
        };

        self.audit
            .append(
                AuditEntry::new(&completed.subject_id, AuditAction::RequestCompleted)
                    .with_record(&completed.id)
                    .with_metadata("request_type", completed.request_type.as_str()),
            )
            .await?;

        tracing::info!(
            request_id = %completed.id,
            request_type = %completed.request_type,
            "compliance request completed"
        );
        Ok(completed)
    }

    async fn fail(&self, request: &ComplianceRequest, error: &Error) -> Result<ComplianceRequest> {
        tracing::warn!(
            request_id = %request.id,
            request_type = %request.request_type,
            reason = error.reason_code(),
            error = %error,
            "compliance request failed"
        );

        let Some(failed) = self
            .registry
            .transition(
                &request.id,
                RequestStatus::Processing,
                RequestStatus::Failed,
                TransitionUpdate::processed(Utc::now()),
            )
            .await?
        else {
            return self.current(&request.id).await;
        };

        let mut entry = AuditEntry::new(&failed.subject_id, AuditAction::RequestFailed)
            .with_record(&failed.id)
            .with_metadata("request_type", failed.request_type.as_str())
            .with_metadata("reason", error.reason_code())
            .with_metadata("error", error.to_string())
            .with_metadata("retryable", error.is_retryable());
        if let Error::Aggregation { failed_sources, .. } = error {
            entry = entry.with_metadata("failed_sources", failed_sources.clone());
        }
        self.audit.append(entry).await?;

        Ok(failed)
    }

    async fn current(&self, request_id: &str) -> Result<ComplianceRequest> {
        self.registry
            .get(request_id)
            .await?
            .ok_or_else(|| Error::NotFoundOrExpired(format!("Request not found: {}", request_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::aggregator::DataAggregator;
    use crate::compliance::artifacts::MemoryArtifactStore;
    use crate::compliance::audit::{entries_with_action, MemoryAuditSink};
    use crate::compliance::registry::MemoryRequestRegistry;
    use crate::compliance::sources::{MemoryProfileStore, ProfileSource, SettingsSource};
    use async_trait::async_trait;

    /// 読み取り直後に削除バッチが割り込んだ状態を再現するストア
    #[derive(Debug)]
    struct AnonymizedAfterRead {
        inner: Arc<MemoryProfileStore>,
    }

    #[async_trait]
    impl ProfileStore for AnonymizedAfterRead {
        async fn get(&self, subject_id: &str) -> Result<Option<SubjectProfile>> {
            let profile = self.inner.get(subject_id).await?;
            self.inner
                .anonymize(
                    subject_id,
                    Utc::now(),
                    AuditEntry::new(subject_id, AuditAction::AccountAnonymized),
                )
                .await?;
            Ok(profile)
        }

        async fn update(&self, profile: SubjectProfile) -> Result<()> {
            self.inner.update(profile).await
        }

        async fn set_consent(&self, subject_id: &str, consent: ConsentRecord) -> Result<()> {
            self.inner.set_consent(subject_id, consent).await
        }

        async fn anonymize(
            &self,
            subject_id: &str,
            now: chrono::DateTime<Utc>,
            audit: AuditEntry,
        ) -> Result<AnonymizeOutcome> {
            self.inner.anonymize(subject_id, now, audit).await
        }
    }

    /// 指定したアクションの追記だけを拒否する監査ログ
    #[derive(Debug)]
    struct RejectingAudit {
        inner: MemoryAuditSink,
        rejected: AuditAction,
    }

    #[async_trait]
    impl AuditSink for RejectingAudit {
        async fn append(&self, entry: AuditEntry) -> Result<()> {
            if entry.is(self.rejected) {
                return Err(Error::Persistence("audit log unavailable".to_string()));
            }
            self.inner.append(entry).await
        }

        async fn list_for_subject(&self, subject_id: &str) -> Result<Vec<AuditEntry>> {
            self.inner.list_for_subject(subject_id).await
        }

        async fn count(&self) -> Result<usize> {
            self.inner.count().await
        }
    }

    struct Fixture {
        dispatcher: RequestDispatcher,
        registry: Arc<MemoryRequestRegistry>,
        profiles: Arc<MemoryProfileStore>,
        audit: Arc<MemoryAuditSink>,
        artifacts: Arc<MemoryArtifactStore>,
    }

    async fn fixture() -> Fixture {
        let audit = Arc::new(MemoryAuditSink::new());
        let registry = Arc::new(MemoryRequestRegistry::new());
        let profiles = Arc::new(MemoryProfileStore::new(audit.clone()));
        let artifacts = Arc::new(MemoryArtifactStore::new());

        let mut profile = SubjectProfile::new("u1", "alice@example.com");
        profile.password_hash = Some("$argon2id$v=19$secret".to_string());
        profile.consent.marketing_consent = true;
        profiles.insert(profile).await;

        let dispatcher = dispatcher_over(
            registry.clone(),
            audit.clone(),
            profiles.clone(),
            artifacts.clone(),
        );

        Fixture {
            dispatcher,
            registry,
            profiles,
            audit,
            artifacts,
        }
    }

    fn dispatcher_over(
        registry: Arc<MemoryRequestRegistry>,
        audit: Arc<dyn AuditSink>,
        profiles: Arc<dyn ProfileStore>,
        artifacts: Arc<MemoryArtifactStore>,
    ) -> RequestDispatcher {
        let aggregator = DataAggregator::new(vec![
            Arc::new(ProfileSource::new(profiles.clone())),
            Arc::new(SettingsSource::new(profiles.clone())),
        ]);
        let consent = ConsentLedger::new(profiles.clone(), audit.clone());
        let deletions = DeletionScheduler::new(registry.clone(), audit.clone(), profiles.clone());
        RequestDispatcher::new(
            registry,
            audit,
            profiles,
            Arc::new(aggregator),
            artifacts,
            consent,
            deletions,
        )
    }

    async fn verified(f: &Fixture, input: NewRequest) -> ComplianceRequest {
        let token = uuid::Uuid::new_v4().to_string();
        let req = ComplianceRequest::from_new(input, token.clone(), Utc::now(), 30);
        f.registry.insert(req).await.unwrap();
        f.registry
            .redeem_token(&token, Utc::now())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_export_completes_with_url() {
        let f = fixture().await;
        let req = verified(
            &f,
            NewRequest::new("u1", RequestType::DataExport).with_export_format(ExportFormat::Csv),
        )
        .await;

        let done = f.dispatcher.dispatch(&req).await.unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
        assert_eq!(done.export_format, Some(ExportFormat::Csv));
        let url = done.export_url.unwrap();

        let artifact = f.artifacts.get(&url).await.unwrap();
        assert!(artifact.content.starts_with("data_type,"));
        assert!(!artifact.content.contains("argon2id"));
    }

    #[tokio::test]
    async fn test_double_dispatch_is_noop() {
        let f = fixture().await;
        let req = verified(&f, NewRequest::new("u1", RequestType::DataPortability)).await;

        let first = f.dispatcher.dispatch(&req).await.unwrap();
        let second = f.dispatcher.dispatch(&req).await.unwrap();
        assert_eq!(first, second);

        let exported = entries_with_action(f.audit.as_ref(), "u1", AuditAction::DataExported)
            .await
            .unwrap();
        assert_eq!(exported.len(), 1);
    }

    #[tokio::test]
    async fn test_unrecognized_type_fails() {
        let f = fixture().await;
        // 現行バージョンで扱えない種類が保存されている状態を再現
        let token = uuid::Uuid::new_v4().to_string();
        let mut stored = ComplianceRequest::from_new(
            NewRequest::new("u1", RequestType::DataExport),
            token.clone(),
            Utc::now(),
            30,
        );
        stored.request_type = RequestType::Unrecognized("account_merge".to_string());
        f.registry.insert(stored.clone()).await.unwrap();
        f.registry.redeem_token(&token, Utc::now()).await.unwrap();

        let failed = f.dispatcher.dispatch(&stored).await.unwrap();
        assert_eq!(failed.status, RequestStatus::Failed);
        assert!(failed.export_url.is_none());

        let entries = entries_with_action(f.audit.as_ref(), "u1", AuditAction::RequestFailed)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].metadata["reason"], "unsupported_request_type");
    }

    #[tokio::test]
    async fn test_deletion_is_scheduled_not_completed() {
        let f = fixture().await;
        let req = verified(&f, NewRequest::new("u1", RequestType::DataDeletion)).await;

        let scheduled = f.dispatcher.dispatch(&req).await.unwrap();
        assert_eq!(scheduled.status, RequestStatus::Processing);
        let when = scheduled.deletion_scheduled_at.unwrap();
        assert!(when > Utc::now() + chrono::Duration::days(29));

        let profile = f.profiles.get("u1").await.unwrap().unwrap();
        assert!(!profile.is_anonymized());
    }

    #[tokio::test]
    async fn test_rectification_applies_corrections() {
        let f = fixture().await;
        let corrections = ProfileCorrections {
            name: Some("Alice Liddell".to_string()),
            ..Default::default()
        };
        let req = verified(
            &f,
            NewRequest::new("u1", RequestType::DataRectification).with_corrections(corrections),
        )
        .await;

        let done = f.dispatcher.dispatch(&req).await.unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
        let profile = f.profiles.get("u1").await.unwrap().unwrap();
        assert_eq!(profile.name.as_deref(), Some("Alice Liddell"));

        let entries = entries_with_action(f.audit.as_ref(), "u1", AuditAction::ProfileRectified)
            .await
            .unwrap();
        assert_eq!(entries[0].metadata["fields"], serde_json::json!(["name"]));
    }

    #[tokio::test]
    async fn test_consent_withdrawal_and_restriction() {
        let f = fixture().await;
        let withdraw = verified(&f, NewRequest::new("u1", RequestType::ConsentWithdrawal)).await;
        let restrict = verified(&f, NewRequest::new("u1", RequestType::ProcessingRestriction)).await;

        assert_eq!(
            f.dispatcher.dispatch(&withdraw).await.unwrap().status,
            RequestStatus::Completed
        );
        assert_eq!(
            f.dispatcher.dispatch(&restrict).await.unwrap().status,
            RequestStatus::Completed
        );

        let profile = f.profiles.get("u1").await.unwrap().unwrap();
        assert!(!profile.consent.marketing_consent);
        assert!(profile.processing_restricted);
    }

    #[tokio::test]
    async fn test_missing_subject_fails_request() {
        let f = fixture().await;
        let req = verified(&f, NewRequest::new("ghost", RequestType::DataExport)).await;

        let failed = f.dispatcher.dispatch(&req).await.unwrap();
        assert_eq!(failed.status, RequestStatus::Failed);
        assert!(failed.export_url.is_none());

        let entries = entries_with_action(f.audit.as_ref(), "ghost", AuditAction::RequestFailed)
            .await
            .unwrap();
        assert_eq!(entries[0].metadata["reason"], "aggregation_failed");
        assert_eq!(
            entries[0].metadata["failed_sources"],
            serde_json::json!(["profile", "settings"])
        );
    }

    #[tokio::test]
    async fn test_rectification_cannot_undo_anonymization() {
        let f = fixture().await;
        let mut profile = f.profiles.get("u1").await.unwrap().unwrap();
        profile.name = Some("Alice".to_string());
        f.profiles.insert(profile).await;

        let racing = Arc::new(AnonymizedAfterRead {
            inner: f.profiles.clone(),
        });
        let dispatcher = dispatcher_over(
            f.registry.clone(),
            f.audit.clone(),
            racing,
            f.artifacts.clone(),
        );

        let corrections = ProfileCorrections {
            email: Some("alice@new.example.com".to_string()),
            ..Default::default()
        };
        let rectify = verified(
            &f,
            NewRequest::new("u1", RequestType::DataRectification).with_corrections(corrections),
        )
        .await;
        let restrict = verified(&f, NewRequest::new("u1", RequestType::ProcessingRestriction)).await;

        assert_eq!(
            dispatcher.dispatch(&rectify).await.unwrap().status,
            RequestStatus::Failed
        );
        assert_eq!(
            dispatcher.dispatch(&restrict).await.unwrap().status,
            RequestStatus::Failed
        );

        let profile = f.profiles.get("u1").await.unwrap().unwrap();
        assert!(profile.is_anonymized());
        assert_ne!(profile.email, "alice@example.com");
        assert_ne!(profile.email, "alice@new.example.com");
        assert_ne!(profile.name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_audit_failure_after_claim_does_not_strand_request() {
        for rejected in [AuditAction::RequestProcessing, AuditAction::DataExported] {
            let registry = Arc::new(MemoryRequestRegistry::new());
            let audit = Arc::new(RejectingAudit {
                inner: MemoryAuditSink::new(),
                rejected,
            });
            let profiles = Arc::new(MemoryProfileStore::new(audit.clone()));
            profiles
                .insert(SubjectProfile::new("u1", "alice@example.com"))
                .await;
            let dispatcher = dispatcher_over(
                registry.clone(),
                audit.clone(),
                profiles,
                Arc::new(MemoryArtifactStore::new()),
            );

            let token = uuid::Uuid::new_v4().to_string();
            let req = ComplianceRequest::from_new(
                NewRequest::new("u1", RequestType::DataExport),
                token.clone(),
                Utc::now(),
                30,
            );
            registry.insert(req).await.unwrap();
            let req = registry.redeem_token(&token, Utc::now()).await.unwrap().unwrap();

            let failed = dispatcher.dispatch(&req).await.unwrap();
            assert_eq!(failed.status, RequestStatus::Failed, "rejected {}", rejected);
            assert!(failed.export_url.is_none());

            let entries = entries_with_action(&*audit, "u1", AuditAction::RequestFailed)
                .await
                .unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].metadata["reason"], "persistence_failed");
        }
    }
}
