//! Data Subject Rights Engine
//!
//! GDPR（EU一般データ保護規則）およびCCPA（カリフォルニア州消費者プライバシー法）の
//! データ主体の権利行使リクエストを受け付け、本人確認の後に処理する。
//!
//! ## 主要機能
//!
//! - **本人確認**: 単回使用の検証トークンによる `pending -> verified` の遷移
//! - **アクセス権・ポータビリティ権**: 複数のデータソースを集約しJSON/CSVでエクスポート
//! - **削除権**: 猶予期間後にプロフィールを匿名化（IDは維持）
//! - **訂正権・処理制限権・同意撤回**: プロフィールへの直接反映
//! - **監査証跡**: 全ての状態遷移と同意変更を追記専用ログに記録
//!
//! ## 使用例
//!
//! ```rust,no_run
//! use dsr_rs::compliance::{ComplianceEngine, NewRequest, RequestType};
//!
//! # async fn example() -> dsr_rs::Result<()> {
//! let engine = ComplianceEngine::in_memory()?;
//!
//! let created = engine
//!     .create_request(NewRequest::new("user-1", RequestType::DataExport))
//!     .await?;
//!
//! // トークンはメール等で本人に届け、引き換え時に処理が走る
//! let request = engine.verify(&created.verification_token).await?;
//! println!("{:?}", request.export_url);
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod artifacts;
pub mod audit;
pub mod consent;
pub mod deletion;
pub mod dispatcher;
pub mod engine;
pub mod export;
pub mod registry;
pub mod report;
pub mod sources;
pub mod sqlite;
pub mod types;
pub mod verification;

pub use aggregator::{AggregatedDocument, DataAggregator};
pub use artifacts::{ArtifactStore, FileArtifactStore, MemoryArtifactStore};
pub use audit::{AuditSink, MemoryAuditSink};
pub use engine::{ComplianceEngine, ComplianceEngineBuilder};
pub use export::ExportArtifact;
pub use registry::{MemoryRequestRegistry, RequestRegistry};
pub use report::ComplianceReport;
pub use sources::{DataSource, MemoryProfileStore, MemoryRecordSource, ProfileStore, Section, SourceCategory};
pub use sqlite::SqliteStore;
pub use types::*;
