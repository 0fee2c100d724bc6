//! Data Sources
//!
//! 集約対象となる独立したデータソースと、プロフィールストアのインターフェース。
//! 各ソースは差し替え可能で、テストではソース単位のテストダブルを注入できる。

use super::audit::AuditSink;
use super::registry::RequestRegistry;
use super::types::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

pub type JsonMap = serde_json::Map<String, Value>;

/// データカテゴリ（集約ドキュメントのトップレベルセクション）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceCategory {
    Profile,
    Settings,
    Bookings,
    Availability,
    CalendarIntegrations,
    Notifications,
    AuditHistory,
    BillingHistory,
    UsageRecords,
    ComplianceRequests,
}

impl SourceCategory {
    /// 集約ドキュメント上のセクション名
    pub fn section_name(&self) -> &'static str {
        match self {
            SourceCategory::Profile => "profile",
            SourceCategory::Settings => "settings",
            SourceCategory::Bookings => "bookings",
            SourceCategory::Availability => "availability",
            SourceCategory::CalendarIntegrations => "calendar_integrations",
            SourceCategory::Notifications => "notifications",
            SourceCategory::AuditHistory => "audit_history",
            SourceCategory::BillingHistory => "billing_history",
            SourceCategory::UsageRecords => "usage_records",
            SourceCategory::ComplianceRequests => "compliance_requests",
        }
    }

    /// CSVの行に付与する `data_type` タグ
    pub fn data_type(&self) -> &'static str {
        match self {
            SourceCategory::Profile => "user_account",
            SourceCategory::Settings => "user_settings",
            SourceCategory::Bookings => "booking",
            SourceCategory::Availability => "availability_rule",
            SourceCategory::CalendarIntegrations => "calendar_integration",
            SourceCategory::Notifications => "notification",
            SourceCategory::AuditHistory => "audit_log",
            SourceCategory::BillingHistory => "billing_record",
            SourceCategory::UsageRecords => "usage_record",
            SourceCategory::ComplianceRequests => "compliance_request",
        }
    }
}

impl fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.section_name())
    }
}

/// セクションの内容
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Section {
    /// 単一レコード（プロフィール、設定）
    Record(JsonMap),
    /// レコードの一覧
    Records(Vec<JsonMap>),
}

impl Section {
    pub fn row_count(&self) -> usize {
        match self {
            Section::Record(_) => 1,
            Section::Records(items) => items.len(),
        }
    }
}

/// シリアライズ可能な値をレコードに変換
pub fn to_record<T: Serialize>(value: &T) -> Result<JsonMap> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => {
            let mut map = JsonMap::new();
            map.insert("value".to_string(), other);
            Ok(map)
        }
    }
}

/// 読み取り専用のデータソース
#[async_trait]
pub trait DataSource: Send + Sync {
    fn category(&self) -> SourceCategory;

    async fn fetch(&self, subject_id: &str) -> Result<Section>;
}

/// 匿名化済みのプロフィールへの書き込みを拒否するエラー
pub(crate) fn anonymized_subject(subject_id: &str) -> Error {
    Error::Validation(format!("Subject {} has been anonymized", subject_id))
}

/// プロフィールストア
///
/// 匿名化は取り消せない。`update` と `set_consent` は匿名化済みの
/// プロフィールに対しては何も書き込まずにエラーを返す。
#[async_trait]
pub trait ProfileStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, subject_id: &str) -> Result<Option<SubjectProfile>>;

    /// 未匿名化のプロフィールを上書き
    async fn update(&self, profile: SubjectProfile) -> Result<()>;

    /// 未匿名化のプロフィールの同意を上書き
    async fn set_consent(&self, subject_id: &str, consent: ConsentRecord) -> Result<()>;

    /// 識別情報をプレースホルダーで上書きし、監査エントリと共に一括で確定する。
    /// 既に匿名化済みの場合は何も書き込まない。
    async fn anonymize(
        &self,
        subject_id: &str,
        now: DateTime<Utc>,
        audit: AuditEntry,
    ) -> Result<AnonymizeOutcome>;
}

/// インメモリのプロフィールストア
#[derive(Debug)]
pub struct MemoryProfileStore {
    profiles: Arc<RwLock<HashMap<String, SubjectProfile>>>,
    audit: Arc<dyn AuditSink>,
}

impl MemoryProfileStore {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            profiles: Arc::new(RwLock::new(HashMap::new())),
            audit,
        }
    }

    pub async fn insert(&self, profile: SubjectProfile) {
        let mut profiles = self.profiles.write().await;
        profiles.insert(profile.id.clone(), profile);
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn get(&self, subject_id: &str) -> Result<Option<SubjectProfile>> {
        let profiles = self.profiles.read().await;
        Ok(profiles.get(subject_id).cloned())
    }

    async fn update(&self, profile: SubjectProfile) -> Result<()> {
        let mut profiles = self.profiles.write().await;
        match profiles.get_mut(&profile.id) {
            Some(existing) if existing.is_anonymized() => Err(anonymized_subject(&profile.id)),
            Some(existing) => {
                *existing = profile;
                Ok(())
            }
            None => Err(Error::NotFoundOrExpired(format!(
                "Subject not found: {}",
                profile.id
            ))),
        }
    }

    async fn set_consent(&self, subject_id: &str, consent: ConsentRecord) -> Result<()> {
        let mut profiles = self.profiles.write().await;
        match profiles.get_mut(subject_id) {
            Some(profile) if profile.is_anonymized() => Err(anonymized_subject(subject_id)),
            Some(profile) => {
                profile.consent = consent;
                Ok(())
            }
            None => Err(Error::NotFoundOrExpired(format!(
                "Subject not found: {}",
                subject_id
            ))),
        }
    }

    async fn anonymize(
        &self,
        subject_id: &str,
        now: DateTime<Utc>,
        audit: AuditEntry,
    ) -> Result<AnonymizeOutcome> {
        // 書き込みロックを保持したまま監査ログを追記し、失敗時はプロフィールを変更しない
        let mut profiles = self.profiles.write().await;
        let profile = profiles.get_mut(subject_id).ok_or_else(|| {
            Error::NotFoundOrExpired(format!("Subject not found: {}", subject_id))
        })?;

        if profile.is_anonymized() {
            return Ok(AnonymizeOutcome::AlreadyAnonymized);
        }

        self.audit.append(audit).await?;
        *profile = profile.anonymized(now);
        Ok(AnonymizeOutcome::Anonymized)
    }
}

/// アカウント情報（プロフィールストア由来）
#[derive(Debug, Clone)]
pub struct ProfileSource {
    profiles: Arc<dyn ProfileStore>,
}

impl ProfileSource {
    pub fn new(profiles: Arc<dyn ProfileStore>) -> Self {
        Self { profiles }
    }
}

async fn require_profile(profiles: &dyn ProfileStore, subject_id: &str) -> Result<SubjectProfile> {
    profiles
        .get(subject_id)
        .await?
        .ok_or_else(|| Error::NotFoundOrExpired(format!("Subject not found: {}", subject_id)))
}

#[async_trait]
impl DataSource for ProfileSource {
    fn category(&self) -> SourceCategory {
        SourceCategory::Profile
    }

    async fn fetch(&self, subject_id: &str) -> Result<Section> {
        let profile = require_profile(self.profiles.as_ref(), subject_id).await?;
        let mut record = to_record(&profile)?;
        // 設定セクションに含まれる項目
        for key in ["consent", "time_zone", "locale", "processing_restricted"] {
            record.remove(key);
        }
        Ok(Section::Record(record))
    }
}

/// 設定と同意状態（プロフィールストア由来）
#[derive(Debug, Clone)]
pub struct SettingsSource {
    profiles: Arc<dyn ProfileStore>,
}

impl SettingsSource {
    pub fn new(profiles: Arc<dyn ProfileStore>) -> Self {
        Self { profiles }
    }
}

#[async_trait]
impl DataSource for SettingsSource {
    fn category(&self) -> SourceCategory {
        SourceCategory::Settings
    }

    async fn fetch(&self, subject_id: &str) -> Result<Section> {
        let profile = require_profile(self.profiles.as_ref(), subject_id).await?;
        let record = serde_json::json!({
            "time_zone": profile.time_zone,
            "locale": profile.locale,
            "marketing_consent": profile.consent.marketing_consent,
            "data_processing_consent": profile.consent.data_processing_consent,
            "consent_timestamp": profile.consent.consent_timestamp,
            "processing_restricted": profile.processing_restricted,
        });
        Ok(Section::Record(to_record(&record)?))
    }
}

/// データ主体に開示しない監査メタデータ（内部のエラー詳細）
const INTERNAL_AUDIT_KEYS: &[&str] = &["error", "retryable", "failed_sources"];

/// 監査履歴
#[derive(Debug, Clone)]
pub struct AuditHistorySource {
    audit: Arc<dyn AuditSink>,
}

impl AuditHistorySource {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self { audit }
    }
}

#[async_trait]
impl DataSource for AuditHistorySource {
    fn category(&self) -> SourceCategory {
        SourceCategory::AuditHistory
    }

    async fn fetch(&self, subject_id: &str) -> Result<Section> {
        let entries = self.audit.list_for_subject(subject_id).await?;
        let records = entries
            .into_iter()
            .map(|mut entry| {
                entry
                    .metadata
                    .retain(|key, _| !INTERNAL_AUDIT_KEYS.contains(&key.as_str()));
                to_record(&entry)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Section::Records(records))
    }
}

/// 過去のコンプライアンスリクエスト
#[derive(Debug, Clone)]
pub struct ComplianceHistorySource {
    registry: Arc<dyn RequestRegistry>,
}

impl ComplianceHistorySource {
    pub fn new(registry: Arc<dyn RequestRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl DataSource for ComplianceHistorySource {
    fn category(&self) -> SourceCategory {
        SourceCategory::ComplianceRequests
    }

    async fn fetch(&self, subject_id: &str) -> Result<Section> {
        let requests = self.registry.list_by_subject(subject_id).await?;
        let records = requests.iter().map(to_record).collect::<Result<Vec<_>>>()?;
        Ok(Section::Records(records))
    }
}

/// 外部ストアの内容を保持するインメモリソース（予約、カレンダー連携、請求など）
#[derive(Debug, Clone)]
pub struct MemoryRecordSource {
    category: SourceCategory,
    records: Arc<RwLock<HashMap<String, Vec<JsonMap>>>>,
}

impl MemoryRecordSource {
    pub fn new(category: SourceCategory) -> Self {
        Self {
            category,
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn insert<T: Serialize>(&self, subject_id: &str, record: &T) -> Result<()> {
        let record = to_record(record)?;
        let mut records = self.records.write().await;
        records
            .entry(subject_id.to_string())
            .or_insert_with(Vec::new)
            .push(record);
        Ok(())
    }
}

#[async_trait]
impl DataSource for MemoryRecordSource {
    fn category(&self) -> SourceCategory {
        self.category
    }

    async fn fetch(&self, subject_id: &str) -> Result<Section> {
        let records = self.records.read().await;
        Ok(Section::Records(
            records.get(subject_id).cloned().unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::audit::MemoryAuditSink;

    fn store() -> (MemoryProfileStore, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        (MemoryProfileStore::new(audit.clone()), audit)
    }

    #[tokio::test]
    async fn test_anonymize_is_idempotent() {
        let (profiles, audit) = store();
        profiles
            .insert(SubjectProfile::new("u1", "alice@example.com"))
            .await;

        let now = Utc::now();
        let first = profiles
            .anonymize("u1", now, AuditEntry::new("u1", AuditAction::AccountAnonymized))
            .await
            .unwrap();
        assert_eq!(first, AnonymizeOutcome::Anonymized);

        let second = profiles
            .anonymize("u1", now, AuditEntry::new("u1", AuditAction::AccountAnonymized))
            .await
            .unwrap();
        assert_eq!(second, AnonymizeOutcome::AlreadyAnonymized);
        assert_eq!(audit.count().await.unwrap(), 1);

        let profile = profiles.get("u1").await.unwrap().unwrap();
        assert_eq!(profile.id, "u1");
        assert_ne!(profile.email, "alice@example.com");
    }

    #[tokio::test]
    async fn test_stale_write_cannot_undo_anonymization() {
        let (profiles, _) = store();
        let mut profile = SubjectProfile::new("u1", "alice@example.com");
        profile.name = Some("Alice".to_string());
        profiles.insert(profile).await;

        let stale = profiles.get("u1").await.unwrap().unwrap();
        profiles
            .anonymize("u1", Utc::now(), AuditEntry::new("u1", AuditAction::AccountAnonymized))
            .await
            .unwrap();

        let mut restricted = stale.clone();
        restricted.processing_restricted = true;
        assert!(matches!(
            profiles.update(restricted).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            profiles.set_consent("u1", stale.consent.clone()).await,
            Err(Error::Validation(_))
        ));

        let profile = profiles.get("u1").await.unwrap().unwrap();
        assert!(profile.is_anonymized());
        assert_ne!(profile.email, "alice@example.com");
        assert_ne!(profile.name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_audit_history_hides_failure_detail() {
        let audit = Arc::new(MemoryAuditSink::new());
        audit
            .append(
                AuditEntry::new("u1", AuditAction::RequestFailed)
                    .with_metadata("reason", "persistence_failed")
                    .with_metadata("error", "Database operation failed: disk I/O error")
                    .with_metadata("retryable", true),
            )
            .await
            .unwrap();

        let section = AuditHistorySource::new(audit).fetch("u1").await.unwrap();
        let Section::Records(records) = section else {
            panic!("audit history must be a list");
        };
        let metadata = records[0]["metadata"].as_object().unwrap();
        assert_eq!(metadata["reason"], "persistence_failed");
        assert!(!metadata.contains_key("error"));
        assert!(!metadata.contains_key("retryable"));
    }

    #[tokio::test]
    async fn test_anonymize_unknown_subject() {
        let (profiles, _) = store();
        let result = profiles
            .anonymize("ghost", Utc::now(), AuditEntry::new("ghost", AuditAction::AccountAnonymized))
            .await;
        assert!(matches!(result, Err(Error::NotFoundOrExpired(_))));
    }

    #[tokio::test]
    async fn test_profile_and_settings_sections_split() {
        let (profiles, _) = store();
        let profiles = Arc::new(profiles);
        let mut profile = SubjectProfile::new("u1", "alice@example.com");
        profile.locale = Some("ja".to_string());
        profiles.insert(profile).await;

        let account = ProfileSource::new(profiles.clone()).fetch("u1").await.unwrap();
        let Section::Record(account) = account else {
            panic!("profile must be a single record");
        };
        assert_eq!(account["email"], "alice@example.com");
        assert!(!account.contains_key("locale"));

        let settings = SettingsSource::new(profiles).fetch("u1").await.unwrap();
        let Section::Record(settings) = settings else {
            panic!("settings must be a single record");
        };
        assert_eq!(settings["locale"], "ja");
        assert_eq!(settings["marketing_consent"], false);
    }

    #[tokio::test]
    async fn test_memory_record_source() {
        let source = MemoryRecordSource::new(SourceCategory::Bookings);
        source
            .insert("u1", &serde_json::json!({"uid": "b-1", "title": "Intro call"}))
            .await
            .unwrap();

        assert_eq!(source.fetch("u1").await.unwrap().row_count(), 1);
        assert_eq!(source.fetch("u2").await.unwrap().row_count(), 0);
        assert_eq!(source.category().data_type(), "booking");
    }
}
