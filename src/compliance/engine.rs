//! Compliance Engine
//!
//! データ主体リクエストの受付・検証・処理・削除実行を束ねる窓口。
//! Webレイヤーや定期実行のスケジューラーはこの型の操作のみを呼び出す。

use super::aggregator::DataAggregator;
use super::artifacts::{ArtifactStore, FileArtifactStore, MemoryArtifactStore};
use super::audit::{AuditSink, MemoryAuditSink};
use super::consent::ConsentLedger;
use super::deletion::DeletionScheduler;
use super::dispatcher::RequestDispatcher;
use super::registry::{MemoryRequestRegistry, RequestRegistry};
use super::report::ComplianceReport;
use super::sources::{
    AuditHistorySource, ComplianceHistorySource, DataSource, MemoryProfileStore, ProfileSource,
    ProfileStore, SettingsSource,
};
use super::sqlite::SqliteStore;
use super::types::*;
use super::verification::VerificationGate;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// コンプライアンスエンジン
#[derive(Debug, Clone)]
pub struct ComplianceEngine {
    registry: Arc<dyn RequestRegistry>,
    audit: Arc<dyn AuditSink>,
    profiles: Arc<dyn ProfileStore>,
    gate: VerificationGate,
    dispatcher: RequestDispatcher,
    consent: ConsentLedger,
    deletions: DeletionScheduler,
}

impl ComplianceEngine {
    pub fn builder() -> ComplianceEngineBuilder {
        ComplianceEngineBuilder::default()
    }

    /// インメモリストアで構成したエンジン（開発・テスト用）
    pub fn in_memory() -> Result<Self> {
        Self::builder().build()
    }

    /// 設定に従いSQLiteストアとファイル保存で構成
    pub async fn from_config(config: &EngineConfig) -> Result<Self> {
        let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
        Self::builder()
            .with_config(config.clone())
            .with_sqlite(store)
            .with_artifacts(Arc::new(FileArtifactStore::new(
                &config.artifact_dir,
                config.artifact_base_url.clone(),
            )))
            .build()
    }

    /// リクエストを受け付け、検証トークンを発行
    pub async fn create_request(&self, input: NewRequest) -> Result<CreatedRequest> {
        let request = self.gate.issue_token(input).await?;
        Ok(CreatedRequest {
            request_id: request.id,
            verification_token: request.verification_token,
        })
    }

    /// トークンを引き換えて処理を開始（処理完了まで待つ）
    pub async fn verify(&self, token: &str) -> Result<ComplianceRequest> {
        let verified = self.gate.redeem(token).await?;
        self.dispatcher.dispatch(&verified).await
    }

    /// リクエストの状態を取得（他のデータ主体のリクエストは存在しないものとして扱う）
    pub async fn get_status(&self, request_id: &str, subject_id: &str) -> Result<ComplianceRequest> {
        match self.registry.get(request_id).await? {
            Some(request) if request.subject_id == subject_id => Ok(request),
            _ => Err(Error::NotFoundOrExpired(format!(
                "Request not found: {}",
                request_id
            ))),
        }
    }

    /// データ主体のリクエスト一覧（受付順）
    pub async fn list_requests(&self, subject_id: &str) -> Result<Vec<ComplianceRequest>> {
        self.registry.list_by_subject(subject_id).await
    }

    pub async fn update_consent(
        &self,
        subject_id: &str,
        update: &ConsentUpdate,
    ) -> Result<ConsentRecord> {
        self.consent.update_consent(subject_id, update).await
    }

    pub async fn current_consent(&self, subject_id: &str) -> Result<ConsentRecord> {
        self.consent.current(subject_id).await
    }

    pub async fn consent_history(&self, subject_id: &str) -> Result<Vec<AuditEntry>> {
        self.consent.history(subject_id).await
    }

    /// 処理中の削除リクエストの実行予定日時を変更
    pub async fn schedule_deletion(
        &self,
        subject_id: &str,
        when: DateTime<Utc>,
    ) -> Result<ComplianceRequest> {
        self.deletions.schedule(subject_id, when).await
    }

    /// 削除予約を取り消す（取り消せる予約がなければ `None`）
    pub async fn cancel_deletion(&self, subject_id: &str) -> Result<Option<ComplianceRequest>> {
        self.deletions.cancel(subject_id, Utc::now()).await
    }

    pub async fn cancel_deletion_at(
        &self,
        subject_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ComplianceRequest>> {
        self.deletions.cancel(subject_id, now).await
    }

    /// 予定時刻を過ぎた削除を実行（外部の定期実行から呼ばれる）
    pub async fn run_scheduled_deletions(&self, now: DateTime<Utc>) -> Result<DeletionSummary> {
        self.deletions.execute_due(now).await
    }

    /// 検証済みのまま処理されていないリクエストを処理
    ///
    /// 検証直後にプロセスが停止した場合の再開用。
    pub async fn resume_verified(&self) -> Result<Vec<ComplianceRequest>> {
        let pending: Vec<ComplianceRequest> = self
            .registry
            .list_all()
            .await?
            .into_iter()
            .filter(|r| r.status == RequestStatus::Verified)
            .collect();

        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "resuming verified requests");
        }

        let mut results = Vec::with_capacity(pending.len());
        for request in pending {
            results.push(self.dispatcher.dispatch(&request).await?);
        }
        Ok(results)
    }

    /// 回答期限を過ぎた未完了リクエスト
    pub async fn overdue_requests(&self, now: DateTime<Utc>) -> Result<Vec<ComplianceRequest>> {
        Ok(self
            .registry
            .list_all()
            .await?
            .into_iter()
            .filter(|r| r.is_overdue(now))
            .collect())
    }

    /// コンプライアンスレポートを生成
    pub async fn report(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<ComplianceReport> {
        let requests = self.registry.list_all().await?;
        let audit_entries = self.audit.count().await?;
        Ok(ComplianceReport::build(
            &requests,
            audit_entries,
            period_start,
            period_end,
            Utc::now(),
        ))
    }

    pub async fn audit_trail(&self, subject_id: &str) -> Result<Vec<AuditEntry>> {
        self.audit.list_for_subject(subject_id).await
    }

    pub fn registry(&self) -> &Arc<dyn RequestRegistry> {
        &self.registry
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    pub fn profiles(&self) -> &Arc<dyn ProfileStore> {
        &self.profiles
    }
}

/// エンジンの構成
///
/// 未指定のストアはインメモリ実装になる。組み込みのデータソース
/// （プロフィール、設定、監査履歴、過去のリクエスト）は常に登録される。
#[derive(Default)]
pub struct ComplianceEngineBuilder {
    config: EngineConfig,
    registry: Option<Arc<dyn RequestRegistry>>,
    audit: Option<Arc<dyn AuditSink>>,
    profiles: Option<Arc<dyn ProfileStore>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    sources: Vec<Arc<dyn DataSource>>,
}

impl ComplianceEngineBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn RequestRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileStore>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    /// リクエスト台帳・監査ログ・プロフィールを同じSQLiteストアに置く
    pub fn with_sqlite(self, store: Arc<SqliteStore>) -> Self {
        self.with_registry(store.clone())
            .with_audit(store.clone())
            .with_profiles(store)
    }

    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// 外部ストア由来のデータソースを追加
    pub fn with_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(self) -> Result<ComplianceEngine> {
        self.config.validate()?;
        let config = self.config;

        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(MemoryAuditSink::new()) as Arc<dyn AuditSink>);
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(MemoryRequestRegistry::new()) as Arc<dyn RequestRegistry>);
        let profiles = self
            .profiles
            .unwrap_or_else(|| Arc::new(MemoryProfileStore::new(audit.clone())) as Arc<dyn ProfileStore>);
        let artifacts = self
            .artifacts
            .unwrap_or_else(|| Arc::new(MemoryArtifactStore::new()) as Arc<dyn ArtifactStore>);

        let mut sources: Vec<Arc<dyn DataSource>> = vec![
            Arc::new(ProfileSource::new(profiles.clone())),
            Arc::new(SettingsSource::new(profiles.clone())),
            Arc::new(AuditHistorySource::new(audit.clone())),
            Arc::new(ComplianceHistorySource::new(registry.clone())),
        ];
        sources.extend(self.sources);

        let aggregator = DataAggregator::new(sources)
            .with_concurrency(config.aggregation_concurrency)
            .with_source_timeout(config.aggregation_timeout());

        let gate = VerificationGate::new(registry.clone(), audit.clone())
            .with_token_bytes(config.token_bytes)
            .with_deadline_days(config.request_deadline_days);
        let consent = ConsentLedger::new(profiles.clone(), audit.clone());
        let deletions = DeletionScheduler::new(registry.clone(), audit.clone(), profiles.clone());
        let dispatcher = RequestDispatcher::new(
            registry.clone(),
            audit.clone(),
            profiles.clone(),
            Arc::new(aggregator),
            artifacts,
            consent.clone(),
            deletions.clone(),
        )
        .with_default_format(config.default_export_format)
        .with_deletion_grace(config.deletion_grace()?);

        tracing::debug!(?dispatcher, "compliance engine built");

        Ok(ComplianceEngine {
            registry,
            audit,
            profiles,
            gate,
            dispatcher,
            consent,
            deletions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::sources::{MemoryRecordSource, SourceCategory};

    async fn engine() -> (ComplianceEngine, Arc<MemoryProfileStore>) {
        let audit: Arc<dyn AuditSink> = Arc::new(MemoryAuditSink::new());
        let profiles = Arc::new(MemoryProfileStore::new(audit.clone()));
        profiles
            .insert(SubjectProfile::new("u1", "alice@example.com"))
            .await;

        let bookings = MemoryRecordSource::new(SourceCategory::Bookings);
        bookings
            .insert("u1", &serde_json::json!({"uid": "b-1", "title": "Intro"}))
            .await
            .unwrap();

        let engine = ComplianceEngine::builder()
            .with_audit(audit)
            .with_profiles(profiles.clone())
            .with_source(Arc::new(bookings))
            .build()
            .unwrap();
        (engine, profiles)
    }

    #[tokio::test]
    async fn test_get_status_is_scoped_by_subject() {
        let (engine, _) = engine().await;
        let created = engine
            .create_request(NewRequest::new("u1", RequestType::DataExport))
            .await
            .unwrap();

        let own = engine.get_status(&created.request_id, "u1").await.unwrap();
        assert_eq!(own.status, RequestStatus::Pending);

        let other = engine.get_status(&created.request_id, "u2").await;
        assert!(matches!(other, Err(Error::NotFoundOrExpired(_))));
    }

    #[tokio::test]
    async fn test_verify_runs_export() {
        let (engine, _) = engine().await;
        let created = engine
            .create_request(NewRequest::new("u1", RequestType::DataExport))
            .await
            .unwrap();

        let done = engine.verify(&created.verification_token).await.unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
        assert_eq!(done.export_format, Some(ExportFormat::Json));
        assert!(done.export_url.unwrap().ends_with(".json"));
    }

    #[tokio::test]
    async fn test_resume_verified_dispatches_leftovers() {
        let (engine, _) = engine().await;
        let created = engine
            .create_request(NewRequest::new("u1", RequestType::ProcessingRestriction))
            .await
            .unwrap();
        engine
            .registry()
            .redeem_token(&created.verification_token, Utc::now())
            .await
            .unwrap();

        let resumed = engine.resume_verified().await.unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].status, RequestStatus::Completed);
        assert!(engine.resume_verified().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overdue_and_report() {
        let (engine, _) = engine().await;
        engine
            .create_request(NewRequest::new("u1", RequestType::DataDeletion))
            .await
            .unwrap();

        let now = Utc::now();
        assert!(engine.overdue_requests(now).await.unwrap().is_empty());
        let later = now + chrono::Duration::days(31);
        assert_eq!(engine.overdue_requests(later).await.unwrap().len(), 1);

        let report = engine
            .report(now - chrono::Duration::days(1), now + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(report.total_requests, 1);
        assert_eq!(report.requests_by_type["data_deletion"], 1);
        assert_eq!(report.audit_entries, 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            aggregation_concurrency: 0,
            ..Default::default()
        };
        let result = ComplianceEngine::builder().with_config(config).build();
        assert!(matches!(result, Err(Error::Config(_))));

        let config = EngineConfig {
            request_deadline_days: i64::MAX / 2,
            ..Default::default()
        };
        let result = ComplianceEngine::builder().with_config(config).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
