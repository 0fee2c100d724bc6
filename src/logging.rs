use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// ログファイル名のプレフィックス
const LOG_FILE_NAME: &str = "dsr-rs.log";

/// ログ設定
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// ログレベル (trace, debug, info, warn, error)
    pub level: String,
    /// ログディレクトリ
    pub log_dir: PathBuf,
    /// ファイルローテーション設定
    pub rotation: LogRotation,
    /// コンソール出力有効
    pub console_enabled: bool,
    /// ファイル出力有効
    pub file_enabled: bool,
    /// JSON形式で出力
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    /// 日次ローテーション
    Daily,
    /// 時間毎ローテーション
    Hourly,
    /// ローテーションなし
    Never,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: PathBuf::from("logs"),
            rotation: LogRotation::Daily,
            console_enabled: true,
            file_enabled: false,
            json: false,
        }
    }
}

impl LogConfig {
    /// エンジン設定からログ設定を作成
    pub fn from_engine_config(engine_config: &crate::config::EngineConfig) -> Self {
        let mut config = Self {
            level: engine_config.log_level.clone(),
            json: engine_config.log_json,
            ..Self::default()
        };

        if let Some(ref dir) = engine_config.log_dir {
            config.log_dir = dir.clone();
            config.file_enabled = true;
        }

        config
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// カスタムログディレクトリを設定
    pub fn with_log_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// ローテーション設定
    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// コンソール出力制御
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.console_enabled = enabled;
        self
    }

    /// ファイル出力制御
    pub fn with_file(mut self, enabled: bool) -> Self {
        self.file_enabled = enabled;
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

/// ログディレクトリを確保
fn ensure_log_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

fn file_appender(config: &LogConfig) -> rolling::RollingFileAppender {
    match config.rotation {
        LogRotation::Daily => rolling::daily(&config.log_dir, LOG_FILE_NAME),
        LogRotation::Hourly => rolling::hourly(&config.log_dir, LOG_FILE_NAME),
        LogRotation::Never => rolling::never(&config.log_dir, LOG_FILE_NAME),
    }
}

/// ログシステムを初期化
///
/// ファイル出力が有効な場合は書き込みスレッドのガードを返す。
/// ガードを破棄するとバッファ済みのログが書き出されなくなるため、
/// 呼び出し側はプロセス終了まで保持すること。
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut guard = None;

    if config.console_enabled {
        let layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
        if config.json {
            layers.push(layer.json().boxed());
        } else {
            layers.push(layer.boxed());
        }
    }

    if config.file_enabled {
        ensure_log_dir(&config.log_dir)?;
        let (writer, worker_guard) = non_blocking(file_appender(config));
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true);
        if config.json {
            layers.push(layer.json().boxed());
        } else {
            layers.push(layer.boxed());
        }
        guard = Some(worker_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()?;

    tracing::debug!(
        level = %config.level,
        console = config.console_enabled,
        file = config.file_enabled,
        log_dir = %config.log_dir.display(),
        "logging initialized"
    );
    Ok(guard)
}
