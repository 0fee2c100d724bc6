//! SQLite Store
//!
//! リクエスト台帳・監査ログ・プロフィールストアのSQLite実装。
//!
//! ステータス遷移は `UPDATE ... WHERE status = ? RETURNING *` の条件付き更新で行い、
//! 匿名化とその監査エントリは同一トランザクションで確定する。
//! 日時はUTCのミリ秒（INTEGER）で保存する。

use super::audit::AuditSink;
use super::registry::{RequestRegistry, TransitionUpdate};
use super::sources::{anonymized_subject, ProfileStore};
use super::types::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite};
use std::collections::BTreeMap;
use std::str::FromStr;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS compliance_requests (
        id TEXT PRIMARY KEY,
        subject_id TEXT NOT NULL,
        request_type TEXT NOT NULL,
        status TEXT NOT NULL,
        verification_token TEXT NOT NULL UNIQUE,
        verified_at INTEGER,
        ip_address TEXT,
        user_agent TEXT,
        notes TEXT,
        export_url TEXT,
        export_format TEXT,
        corrections TEXT,
        deletion_scheduled_at INTEGER,
        created_at INTEGER NOT NULL,
        deadline INTEGER NOT NULL,
        processed_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_requests_subject ON compliance_requests(subject_id)",
    "CREATE INDEX IF NOT EXISTS idx_requests_status ON compliance_requests(status)",
    r#"
    CREATE TABLE IF NOT EXISTS audit_log (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        subject_id TEXT NOT NULL,
        action TEXT NOT NULL,
        related_record_id TEXT,
        metadata TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_audit_subject ON audit_log(subject_id)",
    r#"
    CREATE TABLE IF NOT EXISTS subject_profiles (
        id TEXT PRIMARY KEY,
        username TEXT,
        name TEXT,
        email TEXT NOT NULL,
        bio TEXT,
        avatar_url TEXT,
        time_zone TEXT NOT NULL,
        locale TEXT,
        password_hash TEXT,
        two_factor_secret TEXT,
        email_verified_at INTEGER,
        marketing_consent INTEGER NOT NULL,
        data_processing_consent INTEGER NOT NULL,
        consent_timestamp INTEGER,
        processing_restricted INTEGER NOT NULL,
        anonymized_at INTEGER,
        created_at INTEGER NOT NULL
    )
    "#,
];

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| Error::Persistence(format!("Invalid timestamp in store: {}", millis)))
}

fn opt_time(millis: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    millis.map(from_millis).transpose()
}

fn request_from_row(row: &SqliteRow) -> Result<ComplianceRequest> {
    let corrections: Option<String> = row.try_get("corrections")?;
    let export_format: Option<String> = row.try_get("export_format")?;
    let request_type: String = row.try_get("request_type")?;
    let status: String = row.try_get("status")?;

    Ok(ComplianceRequest {
        id: row.try_get("id")?,
        subject_id: row.try_get("subject_id")?,
        request_type: RequestType::from_stored(&request_type),
        status: RequestStatus::from_str(&status)?,
        verification_token: row.try_get("verification_token")?,
        verified_at: opt_time(row.try_get("verified_at")?)?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
        notes: row.try_get("notes")?,
        export_url: row.try_get("export_url")?,
        export_format: export_format
            .map(|f| ExportFormat::from_str(&f))
            .transpose()?,
        corrections: corrections
            .map(|c| serde_json::from_str(&c))
            .transpose()?,
        deletion_scheduled_at: opt_time(row.try_get("deletion_scheduled_at")?)?,
        created_at: from_millis(row.try_get("created_at")?)?,
        deadline: from_millis(row.try_get("deadline")?)?,
        processed_at: opt_time(row.try_get("processed_at")?)?,
    })
}

fn audit_from_row(row: &SqliteRow) -> Result<AuditEntry> {
    let metadata: String = row.try_get("metadata")?;
    let metadata: BTreeMap<String, serde_json::Value> = serde_json::from_str(&metadata)?;
    Ok(AuditEntry {
        id: row.try_get("id")?,
        subject_id: row.try_get("subject_id")?,
        action: row.try_get("action")?,
        related_record_id: row.try_get("related_record_id")?,
        metadata,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

fn profile_from_row(row: &SqliteRow) -> Result<SubjectProfile> {
    Ok(SubjectProfile {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        bio: row.try_get("bio")?,
        avatar_url: row.try_get("avatar_url")?,
        time_zone: row.try_get("time_zone")?,
        locale: row.try_get("locale")?,
        password_hash: row.try_get("password_hash")?,
        two_factor_secret: row.try_get("two_factor_secret")?,
        email_verified_at: opt_time(row.try_get("email_verified_at")?)?,
        consent: ConsentRecord {
            marketing_consent: row.try_get("marketing_consent")?,
            data_processing_consent: row.try_get("data_processing_consent")?,
            consent_timestamp: opt_time(row.try_get("consent_timestamp")?)?,
        },
        processing_restricted: row.try_get("processing_restricted")?,
        anonymized_at: opt_time(row.try_get("anonymized_at")?)?,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn insert_audit_query(entry: &AuditEntry, metadata: String) -> SqliteQuery<'_> {
    sqlx::query(
        r#"
        INSERT INTO audit_log (id, subject_id, action, related_record_id, metadata, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&entry.id)
    .bind(&entry.subject_id)
    .bind(&entry.action)
    .bind(entry.related_record_id.as_deref())
    .bind(metadata)
    .bind(to_millis(entry.created_at))
}

/// 匿名化済みの行は更新しない
const UPDATE_PROFILE_UNLESS_ANONYMIZED: &str = r#"
    UPDATE subject_profiles SET
        username = ?, name = ?, email = ?, bio = ?, avatar_url = ?, time_zone = ?,
        locale = ?, password_hash = ?, two_factor_secret = ?, email_verified_at = ?,
        marketing_consent = ?, data_processing_consent = ?, consent_timestamp = ?,
        processing_restricted = ?, anonymized_at = ?
    WHERE id = ? AND anonymized_at IS NULL
"#;

/// プロフィールの全項目を上書き
fn update_profile_query(profile: &SubjectProfile) -> SqliteQuery<'_> {
    sqlx::query(UPDATE_PROFILE_UNLESS_ANONYMIZED)
        .bind(profile.username.as_deref())
        .bind(profile.name.as_deref())
        .bind(&profile.email)
        .bind(profile.bio.as_deref())
        .bind(profile.avatar_url.as_deref())
        .bind(&profile.time_zone)
        .bind(profile.locale.as_deref())
        .bind(profile.password_hash.as_deref())
        .bind(profile.two_factor_secret.as_deref())
        .bind(profile.email_verified_at.map(to_millis))
        .bind(profile.consent.marketing_consent)
        .bind(profile.consent.data_processing_consent)
        .bind(profile.consent.consent_timestamp.map(to_millis))
        .bind(profile.processing_restricted)
        .bind(profile.anonymized_at.map(to_millis))
        .bind(&profile.id)
}

/// SQLiteバックエンド
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 接続してスキーマを作成
    ///
    /// `sqlite::memory:` の場合は単一接続を維持する（接続ごとに別のDBになるため）。
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let in_memory = database_url.contains(":memory:");

        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::info!(database_url, "sqlite store ready");
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// プロフィールを登録（既存の場合は失敗）
    pub async fn insert_profile(&self, profile: &SubjectProfile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subject_profiles (
                id, username, name, email, bio, avatar_url, time_zone, locale,
                password_hash, two_factor_secret, email_verified_at,
                marketing_consent, data_processing_consent, consent_timestamp,
                processing_restricted, anonymized_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&profile.id)
        .bind(profile.username.as_deref())
        .bind(profile.name.as_deref())
        .bind(&profile.email)
        .bind(profile.bio.as_deref())
        .bind(profile.avatar_url.as_deref())
        .bind(&profile.time_zone)
        .bind(profile.locale.as_deref())
        .bind(profile.password_hash.as_deref())
        .bind(profile.two_factor_secret.as_deref())
        .bind(profile.email_verified_at.map(to_millis))
        .bind(profile.consent.marketing_consent)
        .bind(profile.consent.data_processing_consent)
        .bind(profile.consent.consent_timestamp.map(to_millis))
        .bind(profile.processing_restricted)
        .bind(profile.anonymized_at.map(to_millis))
        .bind(to_millis(profile.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 更新対象の行がなかった理由を判定
    async fn rejected_write(&self, subject_id: &str) -> Error {
        let anonymized_at: std::result::Result<Option<Option<i64>>, sqlx::Error> =
            sqlx::query_scalar("SELECT anonymized_at FROM subject_profiles WHERE id = ?")
                .bind(subject_id)
                .fetch_optional(&self.pool)
                .await;
        match anonymized_at {
            Ok(Some(Some(_))) => anonymized_subject(subject_id),
            Ok(_) => Error::NotFoundOrExpired(format!("Subject not found: {}", subject_id)),
            Err(e) => e.into(),
        }
    }

    async fn fetch_requests(&self, query: SqliteQuery<'_>) -> Result<Vec<ComplianceRequest>> {
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(request_from_row).collect()
    }

    async fn fetch_request(&self, query: SqliteQuery<'_>) -> Result<Option<ComplianceRequest>> {
        query
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(request_from_row)
            .transpose()
    }
}

#[async_trait]
impl RequestRegistry for SqliteStore {
    async fn insert(&self, request: ComplianceRequest) -> Result<ComplianceRequest> {
        let corrections = request
            .corrections
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO compliance_requests (
                id, subject_id, request_type, status, verification_token, verified_at,
                ip_address, user_agent, notes, export_url, export_format, corrections,
                deletion_scheduled_at, created_at, deadline, processed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.id)
        .bind(&request.subject_id)
        .bind(request.request_type.as_str())
        .bind(request.status.as_str())
        .bind(&request.verification_token)
        .bind(request.verified_at.map(to_millis))
        .bind(request.ip_address.as_deref())
        .bind(request.user_agent.as_deref())
        .bind(request.notes.as_deref())
        .bind(request.export_url.as_deref())
        .bind(request.export_format.map(|f| f.as_str()))
        .bind(corrections)
        .bind(request.deletion_scheduled_at.map(to_millis))
        .bind(to_millis(request.created_at))
        .bind(to_millis(request.deadline))
        .bind(request.processed_at.map(to_millis))
        .execute(&self.pool)
        .await?;

        Ok(request)
    }

    async fn get(&self, id: &str) -> Result<Option<ComplianceRequest>> {
        self.fetch_request(sqlx::query("SELECT * FROM compliance_requests WHERE id = ?").bind(id))
            .await
    }

    async fn list_by_subject(&self, subject_id: &str) -> Result<Vec<ComplianceRequest>> {
        self.fetch_requests(
            sqlx::query(
                "SELECT * FROM compliance_requests WHERE subject_id = ? ORDER BY created_at, rowid",
            )
            .bind(subject_id),
        )
        .await
    }

    async fn list_all(&self) -> Result<Vec<ComplianceRequest>> {
        self.fetch_requests(sqlx::query(
            "SELECT * FROM compliance_requests ORDER BY created_at, rowid",
        ))
        .await
    }

    async fn redeem_token(
        &self,
        token: &str,
        verified_at: DateTime<Utc>,
    ) -> Result<Option<ComplianceRequest>> {
        self.fetch_request(
            sqlx::query(
                r#"
                UPDATE compliance_requests SET status = 'verified', verified_at = ?
                WHERE verification_token = ? AND status = 'pending'
                RETURNING *
                "#,
            )
            .bind(to_millis(verified_at))
            .bind(token),
        )
        .await
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

        self.fetch_request(
            sqlx::query(
                r#"
                UPDATE compliance_requests SET
                    status = ?,
                    processed_at = COALESCE(?, processed_at),
                    export_url = COALESCE(?, export_url),
                    export_format = COALESCE(?, export_format),
                    deletion_scheduled_at = CASE WHEN ? THEN NULL ELSE deletion_scheduled_at END
                WHERE id = ? AND status = ?
                RETURNING *
                "#,
            )
            .bind(to.as_str())
            .bind(update.processed_at.map(to_millis))
            .bind(update.export_url)
            .bind(update.export_format.map(|f| f.as_str()))
            .bind(update.clear_deletion_schedule)
            .bind(id)
            .bind(from.as_str()),
        )
        .await
    }

    async fn set_deletion_schedule(
        &self,
        id: &str,
        when: DateTime<Utc>,
    ) -> Result<Option<ComplianceRequest>> {
        self.fetch_request(
            sqlx::query(
                r#"
                UPDATE compliance_requests SET deletion_scheduled_at = ?
                WHERE id = ? AND status = 'processing' AND request_type = 'data_deletion'
                RETURNING *
                "#,
            )
            .bind(to_millis(when))
            .bind(id),
        )
        .await
    }

    async fn cancel_scheduled_deletion(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ComplianceRequest>> {
        self.fetch_request(
            sqlx::query(
                r#"
                UPDATE compliance_requests SET
                    status = 'cancelled', processed_at = ?, deletion_scheduled_at = NULL
                WHERE id = ? AND status = 'processing'
                    AND deletion_scheduled_at IS NOT NULL AND deletion_scheduled_at > ?
                RETURNING *
                "#,
            )
            .bind(to_millis(now))
            .bind(id)
            .bind(to_millis(now)),
        )
        .await
    }

    async fn due_deletions(&self, now: DateTime<Utc>) -> Result<Vec<ComplianceRequest>> {
        self.fetch_requests(
            sqlx::query(
                r#"
                SELECT * FROM compliance_requests
                WHERE request_type = 'data_deletion' AND status = 'processing'
                    AND deletion_scheduled_at IS NOT NULL AND deletion_scheduled_at <= ?
                ORDER BY deletion_scheduled_at, rowid
                "#,
            )
            .bind(to_millis(now)),
        )
        .await
    }
}

#[async_trait]
impl AuditSink for SqliteStore {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        let metadata = serde_json::to_string(&entry.metadata)?;
        insert_audit_query(&entry, metadata)
            .execute(&self.pool)
            .await?;
        tracing::debug!(subject_id = %entry.subject_id, action = %entry.action, "audit entry appended");
        Ok(())
    }

    async fn list_for_subject(&self, subject_id: &str) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query("SELECT * FROM audit_log WHERE subject_id = ? ORDER BY seq")
            .bind(subject_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(audit_from_row).collect()
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[async_trait]
impl ProfileStore for SqliteStore {
    async fn get(&self, subject_id: &str) -> Result<Option<SubjectProfile>> {
        sqlx::query("SELECT * FROM subject_profiles WHERE id = ?")
            .bind(subject_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(profile_from_row)
            .transpose()
    }

    async fn update(&self, profile: SubjectProfile) -> Result<()> {
        let result = update_profile_query(&profile).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(self.rejected_write(&profile.id).await);
        }
        Ok(())
    }

    async fn set_consent(&self, subject_id: &str, consent: ConsentRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE subject_profiles SET
                marketing_consent = ?, data_processing_consent = ?, consent_timestamp = ?
            WHERE id = ? AND anonymized_at IS NULL
            "#,
        )
        .bind(consent.marketing_consent)
        .bind(consent.data_processing_consent)
        .bind(consent.consent_timestamp.map(to_millis))
        .bind(subject_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_write(subject_id).await);
        }
        Ok(())
    }

    async fn anonymize(
        &self,
        subject_id: &str,
        now: DateTime<Utc>,
        audit: AuditEntry,
    ) -> Result<AnonymizeOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM subject_profiles WHERE id = ?")
            .bind(subject_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(Error::NotFoundOrExpired(format!(
                "Subject not found: {}",
                subject_id
            )));
        };
        let profile = profile_from_row(&row)?;
        if profile.is_anonymized() {
            return Ok(AnonymizeOutcome::AlreadyAnonymized);
        }

        let anonymized = profile.anonymized(now);
        let result = update_profile_query(&anonymized)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(AnonymizeOutcome::AlreadyAnonymized);
        }

        let metadata = serde_json::to_string(&audit.metadata)?;
        insert_audit_query(&audit, metadata)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(AnonymizeOutcome::Anonymized)
    }
}
