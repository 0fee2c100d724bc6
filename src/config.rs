use crate::compliance::types::ExportFormat;
use crate::compliance::verification::MIN_TOKEN_BYTES;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 環境変数のプレフィックス（例: `DSR_TOKEN_BYTES=48`）
pub const ENV_PREFIX: &str = "DSR";

/// 回答期限の上限（日）
pub const MAX_REQUEST_DEADLINE_DAYS: i64 = 3650;
/// 削除猶予の上限（時間）
pub const MAX_DELETION_GRACE_HOURS: i64 = 24 * 3650;

/// エンジン設定
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite接続URL
    pub database_url: String,
    /// 検証トークンの乱数バイト数
    pub token_bytes: usize,
    /// 削除リクエストの検証から匿名化実行までの猶予（時間）
    pub deletion_grace_hours: i64,
    /// 法定の回答期限（日）
    pub request_deadline_days: i64,
    /// データソースの並列読み取り数
    pub aggregation_concurrency: usize,
    /// データソースごとの読み取り期限（秒）
    pub aggregation_timeout_secs: u64,
    /// エクスポート成果物の保存先
    pub artifact_dir: PathBuf,
    /// エクスポート成果物の公開URLのベース
    pub artifact_base_url: String,
    /// 形式の指定がないエクスポートの既定形式
    pub default_export_format: ExportFormat,
    /// ログレベル (trace, debug, info, warn, error)
    pub log_level: String,
    /// ログファイルの出力先（未指定の場合はコンソールのみ）
    pub log_dir: Option<PathBuf>,
    /// JSON形式でログを出力
    pub log_json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://dsr.db".to_string(),
            token_bytes: 32,
            deletion_grace_hours: 720,
            request_deadline_days: 30,
            aggregation_concurrency: 4,
            aggregation_timeout_secs: 30,
            artifact_dir: PathBuf::from("exports"),
            artifact_base_url: "file://exports".to_string(),
            default_export_format: ExportFormat::Json,
            log_level: "info".to_string(),
            log_dir: None,
            log_json: false,
        }
    }
}

impl EngineConfig {
    /// 既定値 → 設定ファイル → 環境変数 の順に重ねて読み込む
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings =
            config::Config::builder().add_source(config::Config::try_from(&EngineConfig::default())?);

        if let Some(path) = path {
            tracing::debug!(path = %path.display(), "loading config file");
            settings = settings.add_source(config::File::from(path).required(true));
        }

        // DSR_AGGREGATION_CONCURRENCY=8 のように指定する
        settings = settings.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 範囲外の値を拒否
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::Config("database_url must not be empty".to_string()));
        }
        if self.token_bytes < MIN_TOKEN_BYTES {
            return Err(Error::Config(format!(
                "token_bytes must be at least {}, got {}",
                MIN_TOKEN_BYTES, self.token_bytes
            )));
        }
        if !(0..=MAX_DELETION_GRACE_HOURS).contains(&self.deletion_grace_hours) {
            return Err(Error::Config(format!(
                "deletion_grace_hours must be between 0 and {}, got {}",
                MAX_DELETION_GRACE_HOURS, self.deletion_grace_hours
            )));
        }
        if !(1..=MAX_REQUEST_DEADLINE_DAYS).contains(&self.request_deadline_days) {
            return Err(Error::Config(format!(
                "request_deadline_days must be between 1 and {}, got {}",
                MAX_REQUEST_DEADLINE_DAYS, self.request_deadline_days
            )));
        }
        if self.aggregation_concurrency == 0 {
            return Err(Error::Config(
                "aggregation_concurrency must be at least 1".to_string(),
            ));
        }
        if self.aggregation_timeout_secs == 0 {
            return Err(Error::Config(
                "aggregation_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn deletion_grace(&self) -> Result<chrono::TimeDelta> {
        chrono::TimeDelta::try_hours(self.deletion_grace_hours).ok_or_else(|| {
            Error::Config(format!(
                "deletion_grace_hours out of range: {}",
                self.deletion_grace_hours
            ))
        })
    }

    pub fn aggregation_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.aggregation_timeout_secs)
    }

    /// コメント付きのサンプル設定
    pub fn sample_toml() -> Result<String> {
        let body = toml::to_string_pretty(&EngineConfig::default())
            .map_err(|e| Error::Config(format!("Failed to render sample config: {}", e)))?;

        Ok(format!(
            r#"# dsr-rs configuration
#
# 環境変数での上書きも可能です (例: DSR_DELETION_GRACE_HOURS=48)
#
# database_url            = SQLite接続URL
# token_bytes             = 検証トークンの乱数バイト数 (16以上)
# deletion_grace_hours    = 削除リクエストの検証から匿名化までの猶予
# request_deadline_days   = 法定の回答期限
# aggregation_concurrency = データソースの並列読み取り数
# aggregation_timeout_secs = データソースごとの読み取り期限
# default_export_format   = json | csv

{}"#,
            body
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.deletion_grace().unwrap(), chrono::Duration::days(30));
    }

    #[test]
    fn test_validate_rejects_short_tokens() {
        let config = EngineConfig {
            token_bytes: 8,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_unbounded_durations() {
        let config = EngineConfig {
            request_deadline_days: i64::MAX / 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = EngineConfig {
            deletion_grace_hours: i64::MAX,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(matches!(config.deletion_grace(), Err(Error::Config(_))));

        let config = EngineConfig {
            request_deadline_days: MAX_REQUEST_DEADLINE_DAYS,
            deletion_grace_hours: MAX_DELETION_GRACE_HOURS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_file_then_env() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "token_bytes = 48\ndefault_export_format = \"csv\"\naggregation_concurrency = 2"
        )
        .unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.token_bytes, 48);
        assert_eq!(config.default_export_format, ExportFormat::Csv);
        assert_eq!(config.aggregation_concurrency, 2);
        assert_eq!(config.request_deadline_days, 30);

        std::env::set_var("DSR_DELETION_GRACE_HOURS", "48");
        let config = EngineConfig::load(Some(file.path())).unwrap();
        std::env::remove_var("DSR_DELETION_GRACE_HOURS");
        assert_eq!(config.deletion_grace_hours, 48);
        assert_eq!(config.token_bytes, 48);
    }

    #[test]
    fn test_sample_toml_parses_back() {
        let sample = EngineConfig::sample_toml().unwrap();
        let parsed: EngineConfig = toml::from_str(&sample).unwrap();
        assert_eq!(parsed, EngineConfig::default());
    }
}
