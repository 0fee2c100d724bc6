//! Export Serializer
//!
//! 集約ドキュメントをJSONまたはCSVに変換する。
//!
//! CSVでは全セクションのレコードを `data_type` 列付きの単一の行型に平坦化する。
//! 一覧セクションは要素ごとに1行、単一レコードのセクションはちょうど1行になる。
//! 列は `data_type` の後に全レコードのキーの和集合を辞書順で並べる。

use super::aggregator::AggregatedDocument;
use super::sources::{JsonMap, Section};
use super::types::ExportFormat;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// エクスポート成果物
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub content: String,
    pub mime_type: String,
    pub format: ExportFormat,
}

impl ExportArtifact {
    pub fn file_extension(&self) -> &'static str {
        self.format.as_str()
    }

    pub fn size_bytes(&self) -> usize {
        self.content.len()
    }
}

/// 形式名を解釈してシリアライズ（未対応の形式は `UnsupportedFormat`）
pub fn serialize_named(document: &AggregatedDocument, format: &str) -> Result<ExportArtifact> {
    serialize(document, format.parse()?)
}

pub fn serialize(document: &AggregatedDocument, format: ExportFormat) -> Result<ExportArtifact> {
    let content = match format {
        ExportFormat::Json => to_json(document)?,
        ExportFormat::Csv => to_csv(document),
    };
    Ok(ExportArtifact {
        content,
        mime_type: format.mime_type().to_string(),
        format,
    })
}

fn to_json(document: &AggregatedDocument) -> Result<String> {
    Ok(serde_json::to_string_pretty(&document.to_value()?)?)
}

/// タグ付きの平坦な行に変換
pub fn flatten_rows(document: &AggregatedDocument) -> Vec<BTreeMap<String, String>> {
    let mut rows = Vec::new();
    for (category, section) in &document.sections {
        let data_type = category.data_type();
        match section {
            Section::Record(record) => rows.push(flatten_record(data_type, record)),
            Section::Records(records) => {
                rows.extend(records.iter().map(|r| flatten_record(data_type, r)))
            }
        }
    }
    rows
}

fn flatten_record(data_type: &str, record: &JsonMap) -> BTreeMap<String, String> {
    let mut row = BTreeMap::new();
    for (key, value) in record {
        if key == "data_type" {
            continue;
        }
        row.insert(key.clone(), cell_text(value));
    }
    row.insert("data_type".to_string(), data_type.to_string());
    row
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => neutralize_formula(s),
        // ネストした値はJSON文字列として1セルに格納
        nested => nested.to_string(),
    }
}

/// 表計算ソフトで数式として解釈されうる文字列を無害化
fn neutralize_formula(s: &str) -> String {
    match s.chars().next() {
        Some('=') | Some('+') | Some('-') | Some('@') | Some('\t') | Some('\r') => {
            format!("'{}", s)
        }
        _ => s.to_string(),
    }
}

fn escape_field(field: &str) -> String {
    let needs_quotes = field.contains(',')
        || field.contains('"')
        || field.contains('\n')
        || field.contains('\r')
        || field.starts_with(' ')
        || field.ends_with(' ');
    if needs_quotes {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn to_csv(document: &AggregatedDocument) -> String {
    let rows = flatten_rows(document);

    let mut columns: BTreeSet<&str> = BTreeSet::new();
    for row in &rows {
        columns.extend(row.keys().map(String::as_str).filter(|k| *k != "data_type"));
    }
    let header: Vec<&str> = std::iter::once("data_type").chain(columns).collect();

    let mut out = String::new();
    out.push_str(
        &header
            .iter()
            .map(|c| escape_field(c))
            .collect::<Vec<_>>()
            .join(","),
    );
    out.push('\n');

    for row in &rows {
        let line = header
            .iter()
            .map(|col| row.get(*col).map(|v| escape_field(v)).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&line);
        out.push('\n');
    }
    out
}
