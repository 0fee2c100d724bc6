//! Verification Gate
//!
//! 単回使用の検証トークンを発行し、引き換え時に `pending -> verified` へ進める。

use super::audit::AuditSink;
use super::registry::RequestRegistry;
use super::types::*;
use crate::error::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// トークンの最小バイト数
pub const MIN_TOKEN_BYTES: usize = 16;

/// ログ・監査用のトークン指紋（SHA-256の先頭16桁）
///
/// 生のトークンはログにも監査ログにも残さない。
pub fn token_fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

#[derive(Debug, Clone)]
pub struct VerificationGate {
    registry: Arc<dyn RequestRegistry>,
    audit: Arc<dyn AuditSink>,
    rng: SystemRandom,
    token_bytes: usize,
    deadline_days: i64,
}

impl VerificationGate {
    pub fn new(registry: Arc<dyn RequestRegistry>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            registry,
            audit,
            rng: SystemRandom::new(),
            token_bytes: 32,
            deadline_days: 30,
        }
    }

    pub fn with_token_bytes(mut self, token_bytes: usize) -> Self {
        self.token_bytes = token_bytes.max(MIN_TOKEN_BYTES);
        self
    }

    pub fn with_deadline_days(mut self, days: i64) -> Self {
        self.deadline_days = days;
        self
    }

    /// 暗号論的に安全な乱数からURLセーフなトークンを生成
    fn generate_token(&self) -> Result<String> {
        let mut bytes = vec![0u8; self.token_bytes];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| Error::Internal("Secure random generator unavailable".to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(&bytes))
    }

    /// トークンを発行し `pending` のリクエストを保存
    pub async fn issue_token(&self, input: NewRequest) -> Result<ComplianceRequest> {
        input.validate()?;

        let token = self.generate_token()?;
        let request = ComplianceRequest::from_new(input, token, Utc::now(), self.deadline_days);
        let request = self.registry.insert(request).await?;

        let fingerprint = token_fingerprint(&request.verification_token);
        let mut entry = AuditEntry::new(&request.subject_id, AuditAction::RequestCreated)
            .with_record(&request.id)
            .with_metadata("request_type", request.request_type.as_str())
            .with_metadata("token_fingerprint", fingerprint.clone());
        if let Some(ref ip) = request.ip_address {
            entry = entry.with_metadata("ip_address", ip.as_str());
        }
        self.audit.append(entry).await?;

        tracing::info!(
            request_id = %request.id,
            subject_id = %request.subject_id,
            request_type = %request.request_type,
            token = %fingerprint,
            "compliance request created"
        );
        Ok(request)
    }

    /// トークンを引き換える
    ///
    /// `pending` のリクエストが見つからない場合（存在しない・使用済み）は
    /// いずれも `NotFoundOrExpired` になる。
    pub async fn redeem(&self, token: &str) -> Result<ComplianceRequest> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::NotFoundOrExpired(
                "Verification token is invalid or already used".to_string(),
            ));
        }

        let fingerprint = token_fingerprint(token);
        let Some(request) = self.registry.redeem_token(token, Utc::now()).await? else {
            tracing::warn!(token = %fingerprint, "verification token rejected");
            return Err(Error::NotFoundOrExpired(
                "Verification token is invalid or already used".to_string(),
            ));
        };

        self.audit
            .append(
                AuditEntry::new(&request.subject_id, AuditAction::RequestVerified)
                    .with_record(&request.id)
                    .with_metadata("token_fingerprint", fingerprint.clone()),
            )
            .await?;

        tracing::info!(
            request_id = %request.id,
            subject_id = %request.subject_id,
            "compliance request verified"
        );
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::audit::MemoryAuditSink;
    use crate::compliance::registry::MemoryRequestRegistry;

    fn gate() -> (VerificationGate, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let gate = VerificationGate::new(Arc::new(MemoryRequestRegistry::new()), audit.clone());
        (gate, audit)
    }

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        assert_eq!(token_fingerprint("abc"), token_fingerprint("abc"));
        assert_ne!(token_fingerprint("abc"), token_fingerprint("abd"));
        assert_eq!(token_fingerprint("abc").len(), 16);
    }

    #[tokio::test]
    async fn test_issue_generates_unique_tokens() {
        let (gate, audit) = gate();
        let a = gate
            .issue_token(NewRequest::new("u1", RequestType::DataExport))
            .await
            .unwrap();
        let b = gate
            .issue_token(NewRequest::new("u1", RequestType::DataExport))
            .await
            .unwrap();

        assert_ne!(a.verification_token, b.verification_token);
        // 32 bytes -> 43 base64url chars
        assert_eq!(a.verification_token.len(), 43);
        assert_eq!(a.status, RequestStatus::Pending);

        let entries = audit.all_entries().await;
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.is(AuditAction::RequestCreated)));
        assert!(!serde_json::to_string(&entries)
            .unwrap()
            .contains(&a.verification_token));
    }

    #[tokio::test]
    async fn test_issue_rejects_invalid_input() {
        let (gate, audit) = gate();
        let result = gate.issue_token(NewRequest::new("  ", RequestType::DataExport)).await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(audit.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_redeem_twice_fails() {
        let (gate, _) = gate();
        let request = gate
            .issue_token(NewRequest::new("u1", RequestType::DataDeletion))
            .await
            .unwrap();

        let verified = gate.redeem(&request.verification_token).await.unwrap();
        assert_eq!(verified.status, RequestStatus::Verified);
        assert!(verified.verified_at.is_some());

        let again = gate.redeem(&request.verification_token).await;
        assert!(matches!(again, Err(Error::NotFoundOrExpired(_))));
        assert!(matches!(gate.redeem("").await, Err(Error::NotFoundOrExpired(_))));
    }

    #[tokio::test]
    async fn test_concurrent_redemption_has_single_winner() {
        let (gate, _) = gate();
        let request = gate
            .issue_token(NewRequest::new("u1", RequestType::DataExport))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let token = request.verification_token.clone();
            handles.push(tokio::spawn(async move { gate.redeem(&token).await.is_ok() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
