//! Data Aggregator
//!
//! 複数の独立したデータソースからデータ主体のデータを収集し、
//! 一つの構造化ドキュメントにまとめる。
//!
//! 各ソースの読み取りは個別に実行され（並列数は上限付き）、失敗はソースごとに収集される。
//! 一つでも失敗したソースがあれば、部分的なドキュメントは返さず
//! `Error::Aggregation` で集約全体を失敗させる。
//!
//! パスワードハッシュやトークン等の機密フィールドは集約時点で除去するため、
//! 出力形式に関わらずエクスポートに含まれることはない。

use super::sources::{DataSource, JsonMap, Section, SourceCategory};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// 完全一致で除去するキー（区切り文字を除いた小文字表記）
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "token",
    "secret",
    "apikey",
    "privatekey",
    "credentials",
    "backupcodes",
    "otp",
];

/// 末尾一致で除去するキー（区切り文字を除いた小文字表記）
const SENSITIVE_SUFFIXES: &[&str] = &["token", "secret", "hash", "password", "apikey", "privatekey"];

/// `resetToken`、`reset_token`、`reset-token` を同じキーとして扱う
fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// 機密フィールドかどうか
pub fn is_sensitive_key(key: &str) -> bool {
    let key = normalize_key(key);
    SENSITIVE_KEYS.contains(&key.as_str())
        || SENSITIVE_SUFFIXES.iter().any(|s| key.ends_with(s))
        || key.contains("password")
}

/// 値から機密フィールドを再帰的に除去
pub fn strip_sensitive(value: &mut Value) {
    match value {
        Value::Object(map) => strip_sensitive_map(map),
        Value::Array(items) => items.iter_mut().for_each(strip_sensitive),
        _ => {}
    }
}

fn strip_sensitive_map(map: &mut JsonMap) {
    map.retain(|key, _| !is_sensitive_key(key));
    for value in map.values_mut() {
        strip_sensitive(value);
    }
}

fn strip_section(section: &mut Section) {
    match section {
        Section::Record(record) => strip_sensitive_map(record),
        Section::Records(records) => records.iter_mut().for_each(strip_sensitive_map),
    }
}

/// 集約ドキュメント
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedDocument {
    pub subject_id: String,
    pub generated_at: DateTime<Utc>,
    pub sections: BTreeMap<SourceCategory, Section>,
}

impl AggregatedDocument {
    pub fn section(&self, category: SourceCategory) -> Option<&Section> {
        self.sections.get(&category)
    }

    /// セクション名をキーとするJSON値
    pub fn to_value(&self) -> Result<Value> {
        let mut root = JsonMap::new();
        root.insert("subject_id".to_string(), Value::String(self.subject_id.clone()));
        root.insert(
            "generated_at".to_string(),
            Value::String(self.generated_at.to_rfc3339()),
        );
        for (category, section) in &self.sections {
            root.insert(
                category.section_name().to_string(),
                serde_json::to_value(section)?,
            );
        }
        Ok(Value::Object(root))
    }

    fn merge(&mut self, category: SourceCategory, section: Section) {
        match (self.sections.remove(&category), section) {
            (None, section) => {
                self.sections.insert(category, section);
            }
            (Some(Section::Records(mut existing)), Section::Records(more)) => {
                existing.extend(more);
                self.sections.insert(category, Section::Records(existing));
            }
            (Some(Section::Record(mut existing)), Section::Record(more)) => {
                existing.extend(more);
                self.sections.insert(category, Section::Record(existing));
            }
            (Some(Section::Record(existing)), Section::Records(mut more)) => {
                more.insert(0, existing);
                self.sections.insert(category, Section::Records(more));
            }
            (Some(Section::Records(mut existing)), Section::Record(more)) => {
                existing.push(more);
                self.sections.insert(category, Section::Records(existing));
            }
        }
    }
}

/// データ集約器
#[derive(Clone)]
pub struct DataAggregator {
    sources: Vec<Arc<dyn DataSource>>,
    concurrency: usize,
    source_timeout: Option<Duration>,
}

impl std::fmt::Debug for DataAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataAggregator")
            .field(
                "sources",
                &self.sources.iter().map(|s| s.category()).collect::<Vec<_>>(),
            )
            .field("concurrency", &self.concurrency)
            .field("source_timeout", &self.source_timeout)
            .finish()
    }
}

impl DataAggregator {
    pub fn new(sources: Vec<Arc<dyn DataSource>>) -> Self {
        Self {
            sources,
            concurrency: 4,
            source_timeout: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_source_timeout(mut self, timeout: Duration) -> Self {
        self.source_timeout = Some(timeout);
        self
    }

    pub fn add_source(&mut self, source: Arc<dyn DataSource>) {
        self.sources.push(source);
    }

    pub fn categories(&self) -> Vec<SourceCategory> {
        self.sources.iter().map(|s| s.category()).collect()
    }

    async fn fetch_one(&self, source: Arc<dyn DataSource>, subject_id: &str) -> (SourceCategory, Result<Section>) {
        let category = source.category();
        tracing::debug!(source = %category, subject_id, "fetching source");

        let result = match self.source_timeout {
            Some(limit) => match tokio::time::timeout(limit, source.fetch(subject_id)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Persistence(format!(
                    "source {} timed out after {:?}",
                    category, limit
                ))),
            },
            None => source.fetch(subject_id).await,
        };
        (category, result)
    }

    /// 全ソースからデータを収集
    pub async fn collect(&self, subject_id: &str) -> Result<AggregatedDocument> {
        let results: Vec<(SourceCategory, Result<Section>)> = stream::iter(self.sources.iter().cloned())
            .map(|source| self.fetch_one(source, subject_id))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut document = AggregatedDocument {
            subject_id: subject_id.to_string(),
            generated_at: Utc::now(),
            sections: BTreeMap::new(),
        };
        let mut failed_sources = Vec::new();
        let mut details = Vec::new();

        for (category, result) in results {
            match result {
                Ok(mut section) => {
                    strip_section(&mut section);
                    document.merge(category, section);
                }
                Err(e) => {
                    tracing::warn!(source = %category, subject_id, error = %e, "data source failed");
                    failed_sources.push(category.section_name().to_string());
                    details.push(format!("{}: {}", category, e));
                }
            }
        }

        if !failed_sources.is_empty() {
            failed_sources.sort();
            details.sort();
            return Err(Error::Aggregation {
                failed_sources,
                details,
            });
        }

        tracing::info!(
            subject_id,
            sections = document.sections.len(),
            "aggregated subject data"
        );
        Ok(document)
    }
}
