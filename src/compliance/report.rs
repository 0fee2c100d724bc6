//! Compliance Report
//!
//! 期間内に受け付けたリクエストの集計

use super::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// コンプライアンスレポート
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    /// 期間内に受け付けたリクエスト数
    pub total_requests: usize,
    pub requests_by_type: BTreeMap<String, usize>,
    pub requests_by_status: BTreeMap<String, usize>,
    /// 受付から終端状態までの平均秒数（完了分のみ）
    pub avg_processing_time_seconds: f64,
    /// 回答期限を過ぎた未完了リクエスト数
    pub overdue_requests: usize,
    /// 監査ログの総エントリ数
    pub audit_entries: usize,
}

impl ComplianceReport {
    /// リクエスト一覧からレポートを生成
    pub fn build(
        requests: &[ComplianceRequest],
        audit_entries: usize,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut requests_by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut requests_by_status: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_processing_time = 0.0;
        let mut processed_requests = 0;
        let mut total_requests = 0;
        let mut overdue_requests = 0;

        for req in requests
            .iter()
            .filter(|r| r.created_at >= period_start && r.created_at <= period_end)
        {
            total_requests += 1;
            *requests_by_type
                .entry(req.request_type.as_str().to_string())
                .or_insert(0) += 1;
            *requests_by_status
                .entry(req.status.as_str().to_string())
                .or_insert(0) += 1;

            if req.status == RequestStatus::Completed {
                if let Some(processed_at) = req.processed_at {
                    total_processing_time += processed_at
                        .signed_duration_since(req.created_at)
                        .num_milliseconds() as f64
                        / 1000.0;
                    processed_requests += 1;
                }
            }

            if req.is_overdue(now) {
                overdue_requests += 1;
            }
        }

        let avg_processing_time_seconds = if processed_requests > 0 {
            total_processing_time / processed_requests as f64
        } else {
            0.0
        };

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            period_start,
            period_end,
            generated_at: now,
            total_requests,
            requests_by_type,
            requests_by_status,
            avg_processing_time_seconds,
            overdue_requests,
            audit_entries,
        }
    }
}
