//! Compliance Types
//!
//! データ主体リクエスト、同意、監査ログに関連する型定義

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use validator::Validate;

/// データ主体リクエストの種類
///
/// 永続化された値が現行バージョンで扱えない場合は `Unrecognized` として読み込まれ、
/// ディスパッチ時に `unsupported_request_type` で失敗する。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RequestType {
    /// アクセス権（GDPR Art.15）
    DataExport,
    /// 削除権（GDPR Art.17）
    DataDeletion,
    /// 訂正権（GDPR Art.16）
    DataRectification,
    /// 同意撤回（GDPR Art.7(3)）
    ConsentWithdrawal,
    /// ポータビリティ権（GDPR Art.20）
    DataPortability,
    /// 処理制限権（GDPR Art.18）
    ProcessingRestriction,
    /// 未知の種類
    Unrecognized(String),
}

impl RequestType {
    /// 受け付け可能な全種類
    pub const SUPPORTED: [RequestType; 6] = [
        RequestType::DataExport,
        RequestType::DataDeletion,
        RequestType::DataRectification,
        RequestType::ConsentWithdrawal,
        RequestType::DataPortability,
        RequestType::ProcessingRestriction,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            RequestType::DataExport => "data_export",
            RequestType::DataDeletion => "data_deletion",
            RequestType::DataRectification => "data_rectification",
            RequestType::ConsentWithdrawal => "consent_withdrawal",
            RequestType::DataPortability => "data_portability",
            RequestType::ProcessingRestriction => "processing_restriction",
            RequestType::Unrecognized(name) => name,
        }
    }

    /// 保存値から読み込む（失敗しない）
    pub fn from_stored(value: &str) -> Self {
        match value {
            "data_export" => RequestType::DataExport,
            "data_deletion" => RequestType::DataDeletion,
            "data_rectification" => RequestType::DataRectification,
            "consent_withdrawal" => RequestType::ConsentWithdrawal,
            "data_portability" => RequestType::DataPortability,
            "processing_restriction" => RequestType::ProcessingRestriction,
            other => RequestType::Unrecognized(other.to_string()),
        }
    }

    /// エクスポート成果物を生成する種類かどうか
    pub fn is_export(&self) -> bool {
        matches!(self, RequestType::DataExport | RequestType::DataPortability)
    }
}

impl FromStr for RequestType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match Self::from_stored(s) {
            RequestType::Unrecognized(name) => Err(Error::Validation(format!(
                "Unknown request type: {}",
                name
            ))),
            known => Ok(known),
        }
    }
}

impl From<String> for RequestType {
    fn from(s: String) -> Self {
        Self::from_stored(&s)
    }
}

impl From<RequestType> for String {
    fn from(t: RequestType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// リクエスト処理ステータス
///
/// `pending -> verified -> processing -> completed | failed | cancelled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// 本人確認待ち
    Pending,
    /// 本人確認済み
    Verified,
    /// 処理中（削除予約中を含む）
    Processing,
    /// 完了
    Completed,
    /// 失敗
    Failed,
    /// 削除予約の取り消し
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Verified => "verified",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Cancelled
        )
    }

    /// 前進方向の遷移のみ許可する
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (RequestStatus::Pending, RequestStatus::Verified)
                | (RequestStatus::Verified, RequestStatus::Processing)
                | (RequestStatus::Processing, RequestStatus::Completed)
                | (RequestStatus::Processing, RequestStatus::Failed)
                | (RequestStatus::Processing, RequestStatus::Cancelled)
        )
    }
}

impl FromStr for RequestStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "verified" => Ok(RequestStatus::Verified),
            "processing" => Ok(RequestStatus::Processing),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            "cancelled" => Ok(RequestStatus::Cancelled),
            other => Err(Error::Persistence(format!(
                "Unknown request status in store: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// エクスポート形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv => "text/csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(Error::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// リクエスト発行元の情報（作成後は不変）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct Provenance {
    #[validate(ip)]
    pub ip_address: Option<String>,
    #[validate(length(max = 512))]
    pub user_agent: Option<String>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

impl Provenance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// 訂正リクエストで適用するプロフィール項目
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct ProfileCorrections {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(min = 1, max = 64))]
    pub time_zone: Option<String>,
    #[validate(length(min = 2, max = 16))]
    pub locale: Option<String>,
}

impl ProfileCorrections {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.email.is_none()
            && self.time_zone.is_none()
            && self.locale.is_none()
    }

    /// 変更されたフィールド名の一覧
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.name.is_some() {
            fields.push("name");
        }
        if self.email.is_some() {
            fields.push("email");
        }
        if self.time_zone.is_some() {
            fields.push("time_zone");
        }
        if self.locale.is_some() {
            fields.push("locale");
        }
        fields
    }
}

/// リクエスト受付時の入力
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub subject_id: String,
    pub request_type: RequestType,
    pub provenance: Provenance,
    pub export_format: Option<ExportFormat>,
    pub corrections: Option<ProfileCorrections>,
}

impl NewRequest {
    pub fn new(subject_id: impl Into<String>, request_type: RequestType) -> Self {
        Self {
            subject_id: subject_id.into(),
            request_type,
            provenance: Provenance::default(),
            export_format: None,
            corrections: None,
        }
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn with_export_format(mut self, format: ExportFormat) -> Self {
        self.export_format = Some(format);
        self
    }

    pub fn with_corrections(mut self, corrections: ProfileCorrections) -> Self {
        self.corrections = Some(corrections);
        self
    }

    /// 受付前の入力検証
    pub fn validate(&self) -> Result<()> {
        if self.subject_id.trim().is_empty() {
            return Err(Error::Validation("subject_id must not be empty".to_string()));
        }
        if let RequestType::Unrecognized(name) = &self.request_type {
            return Err(Error::Validation(format!("Unknown request type: {}", name)));
        }
        self.provenance.validate()?;

        if self.export_format.is_some() && !self.request_type.is_export() {
            return Err(Error::Validation(format!(
                "export_format is only valid for export requests, got {}",
                self.request_type
            )));
        }

        match (&self.request_type, &self.corrections) {
            (RequestType::DataRectification, None) => Err(Error::Validation(
                "data_rectification requires corrections".to_string(),
            )),
            (RequestType::DataRectification, Some(c)) if c.is_empty() => Err(
                Error::Validation("corrections must change at least one field".to_string()),
            ),
            (RequestType::DataRectification, Some(c)) => Ok(c.validate()?),
            (other, Some(_)) => Err(Error::Validation(format!(
                "corrections are only valid for data_rectification, got {}",
                other
            ))),
            (_, None) => Ok(()),
        }
    }
}

/// コンプライアンスリクエスト（それ自体が監査記録であり削除されない）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceRequest {
    pub id: String,
    pub subject_id: String,
    pub request_type: RequestType,
    pub status: RequestStatus,
    #[serde(skip_serializing, default)]
    pub verification_token: String,
    pub verified_at: Option<DateTime<Utc>>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub notes: Option<String>,
    pub export_url: Option<String>,
    pub export_format: Option<ExportFormat>,
    pub corrections: Option<ProfileCorrections>,
    pub deletion_scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// 法定の回答期限
    pub deadline: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// 回答期限（範囲外の日数は表現可能な最大時刻に丸める）
fn deadline_after(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    Duration::try_days(days)
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl ComplianceRequest {
    /// 検証済みの入力から `pending` 状態のリクエストを構築
    pub fn from_new(
        input: NewRequest,
        verification_token: String,
        now: DateTime<Utc>,
        deadline_days: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject_id: input.subject_id,
            request_type: input.request_type,
            status: RequestStatus::Pending,
            verification_token,
            verified_at: None,
            ip_address: input.provenance.ip_address,
            user_agent: input.provenance.user_agent,
            notes: input.provenance.notes,
            export_url: None,
            export_format: input.export_format,
            corrections: input.corrections,
            deletion_scheduled_at: None,
            created_at: now,
            deadline: deadline_after(now, deadline_days),
            processed_at: None,
        }
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.deadline < now && !self.status.is_terminal()
    }
}

/// リクエスト受付結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedRequest {
    pub request_id: String,
    pub verification_token: String,
}

/// 同意記録（プロフィールの一部、最後の書き込みが有効）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub marketing_consent: bool,
    pub data_processing_consent: bool,
    pub consent_timestamp: Option<DateTime<Utc>>,
}

/// 同意の変更内容（未指定のキーは現在値を維持）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentUpdate {
    pub marketing: Option<bool>,
    pub data_processing: Option<bool>,
}

impl ConsentUpdate {
    pub fn marketing(value: bool) -> Self {
        Self {
            marketing: Some(value),
            ..Default::default()
        }
    }

    pub fn data_processing(value: bool) -> Self {
        Self {
            data_processing: Some(value),
            ..Default::default()
        }
    }

    /// 全ての同意を撤回
    pub fn withdraw_all() -> Self {
        Self {
            marketing: Some(false),
            data_processing: Some(false),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.marketing.is_none() && self.data_processing.is_none()
    }

    /// 現在の記録にマージした新しい記録を返す
    pub fn merge_into(&self, current: &ConsentRecord, now: DateTime<Utc>) -> ConsentRecord {
        ConsentRecord {
            marketing_consent: self.marketing.unwrap_or(current.marketing_consent),
            data_processing_consent: self
                .data_processing
                .unwrap_or(current.data_processing_consent),
            consent_timestamp: Some(now),
        }
    }
}

/// 監査アクション種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditAction {
    RequestCreated,
    RequestVerified,
    RequestProcessing,
    RequestCompleted,
    RequestFailed,
    DataExported,
    DeletionScheduled,
    DeletionCancelled,
    AccountAnonymized,
    AnonymizationFailed,
    ProfileRectified,
    ProcessingRestricted,
    ConsentUpdated,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::RequestCreated => "compliance_request_created",
            AuditAction::RequestVerified => "compliance_request_verified",
            AuditAction::RequestProcessing => "compliance_request_processing",
            AuditAction::RequestCompleted => "compliance_request_completed",
            AuditAction::RequestFailed => "compliance_request_failed",
            AuditAction::DataExported => "data_exported",
            AuditAction::DeletionScheduled => "account_deletion_scheduled",
            AuditAction::DeletionCancelled => "account_deletion_cancelled",
            AuditAction::AccountAnonymized => "account_anonymized",
            AuditAction::AnonymizationFailed => "account_anonymization_failed",
            AuditAction::ProfileRectified => "profile_rectified",
            AuditAction::ProcessingRestricted => "processing_restricted",
            AuditAction::ConsentUpdated => "consent_updated",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 監査ログエントリ（追記専用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub subject_id: String,
    pub action: String,
    pub related_record_id: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(subject_id: impl Into<String>, action: AuditAction) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            action: action.as_str().to_string(),
            related_record_id: None,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_record(mut self, record_id: impl Into<String>) -> Self {
        self.related_record_id = Some(record_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn is(&self, action: AuditAction) -> bool {
        self.action == action.as_str()
    }
}

/// データ主体のプロフィール
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectProfile {
    pub id: String,
    pub username: Option<String>,
    pub name: Option<String>,
    pub email: String,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub time_zone: String,
    pub locale: Option<String>,
    pub password_hash: Option<String>,
    pub two_factor_secret: Option<String>,
    pub email_verified_at: Option<DateTime<Utc>>,
    pub consent: ConsentRecord,
    pub processing_restricted: bool,
    pub anonymized_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// 匿名化後の表示名
pub const ANONYMIZED_NAME: &str = "Deleted User";
/// 匿名化後のメールアドレスのドメイン
pub const ANONYMIZED_EMAIL_DOMAIN: &str = "anonymized.invalid";

impl SubjectProfile {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: None,
            name: None,
            email: email.into(),
            bio: None,
            avatar_url: None,
            time_zone: "UTC".to_string(),
            locale: None,
            password_hash: None,
            two_factor_secret: None,
            email_verified_at: None,
            consent: ConsentRecord::default(),
            processing_restricted: false,
            anonymized_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_anonymized(&self) -> bool {
        self.anonymized_at.is_some()
    }

    /// 識別情報を固定のプレースホルダーで上書きしたコピーを返す（IDは維持）
    pub fn anonymized(&self, now: DateTime<Utc>) -> Self {
        Self {
            id: self.id.clone(),
            username: None,
            name: Some(ANONYMIZED_NAME.to_string()),
            email: format!("deleted+{}@{}", self.id, ANONYMIZED_EMAIL_DOMAIN),
            bio: None,
            avatar_url: None,
            time_zone: "UTC".to_string(),
            locale: None,
            password_hash: None,
            two_factor_secret: None,
            email_verified_at: None,
            consent: ConsentRecord {
                marketing_consent: false,
                data_processing_consent: false,
                consent_timestamp: Some(now),
            },
            processing_restricted: true,
            anonymized_at: Some(now),
            created_at: self.created_at,
        }
    }

    /// 訂正内容を適用したコピーを返す
    pub fn corrected(&self, corrections: &ProfileCorrections) -> Self {
        let mut profile = self.clone();
        if let Some(ref name) = corrections.name {
            profile.name = Some(name.clone());
        }
        if let Some(ref email) = corrections.email {
            profile.email = email.clone();
            profile.email_verified_at = None;
        }
        if let Some(ref tz) = corrections.time_zone {
            profile.time_zone = tz.clone();
        }
        if let Some(ref locale) = corrections.locale {
            profile.locale = Some(locale.clone());
        }
        profile
    }
}

/// 匿名化処理の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnonymizeOutcome {
    Anonymized,
    AlreadyAnonymized,
}

/// 匿名化に失敗した対象
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionFailure {
    pub subject_id: String,
    pub request_id: String,
    pub reason: String,
}

/// `execute_due` の実行結果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletionSummary {
    pub processed_count: usize,
    /// 既に匿名化済みだった対象数
    pub skipped_count: usize,
    pub error_count: usize,
    pub processed_subject_ids: Vec<String>,
    pub failures: Vec<DeletionFailure>,
}
