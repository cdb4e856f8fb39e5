//! Resume-token manager: opaque bearer tokens binding an execution+step.
//!
//! `dashmap`-keyed lookup, a `thiserror` error type, `#[async_trait]`
//! contract. Tokens are minted from paired `Uuid::new_v4()`s rather than a
//! sequential counter, so a token cannot be guessed from another one.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EngineError, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Active,
    Used,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeToken {
    pub token: String,
    pub execution_id: String,
    pub step_id: String,
    pub status: TokenStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ResumeToken {
    fn effective_status(&self, now: DateTime<Utc>) -> TokenStatus {
        if self.status == TokenStatus::Active {
            if let Some(expires_at) = self.expires_at {
                if now >= expires_at {
                    return TokenStatus::Expired;
                }
            }
        }
        self.status
    }
}

#[derive(Debug, Clone)]
pub struct TokenValidation {
    pub valid: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub expires_in_ms: Option<i64>,
    pub metadata: Option<Value>,
}

#[async_trait]
pub trait ResumeTokenManager: Send + Sync + 'static {
    async fn generate(
        &self,
        execution_id: &str,
        step_id: &str,
        options: GenerateOptions,
    ) -> Result<ResumeToken, EngineError>;

    async fn get(&self, token: &str) -> Option<ResumeToken>;

    async fn validate(&self, token: &str) -> TokenValidation;

    async fn mark_used(&self, token: &str) -> Result<(), EngineError>;

    async fn revoke(&self, token: &str) -> Result<(), EngineError>;

    async fn list_by_execution(&self, execution_id: &str) -> Vec<ResumeToken>;

    async fn cleanup_expired(&self) -> usize;
}

/// Reference in-memory token manager.
#[derive(Default)]
pub struct InMemoryResumeTokenManager {
    tokens: DashMap<String, ResumeToken>,
}

impl InMemoryResumeTokenManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResumeTokenManager for InMemoryResumeTokenManager {
    #[tracing::instrument(skip(self, options), fields(execution_id, step_id))]
    async fn generate(
        &self,
        execution_id: &str,
        step_id: &str,
        options: GenerateOptions,
    ) -> Result<ResumeToken, EngineError> {
        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let now = Utc::now();
        let record = ResumeToken {
            token: token.clone(),
            execution_id: execution_id.to_string(),
            step_id: step_id.to_string(),
            status: TokenStatus::Active,
            created_at: now,
            expires_at: options
                .expires_in_ms
                .map(|ms| now + Duration::milliseconds(ms)),
            metadata: options.metadata,
        };
        tracing::debug!(token = %token, "resume token generated");
        self.tokens.insert(token.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, token: &str) -> Option<ResumeToken> {
        self.tokens.get(token).map(|e| e.value().clone())
    }

    async fn validate(&self, token: &str) -> TokenValidation {
        let Some(record) = self.get(token).await else {
            return TokenValidation {
                valid: false,
                reason: Some(ErrorCode::InvalidResumeToken.to_string()),
            };
        };
        match record.effective_status(Utc::now()) {
            TokenStatus::Active => TokenValidation {
                valid: true,
                reason: None,
            },
            TokenStatus::Expired => TokenValidation {
                valid: false,
                reason: Some(ErrorCode::ResumeTokenExpired.to_string()),
            },
            TokenStatus::Used | TokenStatus::Revoked => TokenValidation {
                valid: false,
                reason: Some(ErrorCode::InvalidResumeToken.to_string()),
            },
        }
    }

    async fn mark_used(&self, token: &str) -> Result<(), EngineError> {
        let mut entry = self
            .tokens
            .get_mut(token)
            .ok_or_else(|| EngineError::new(ErrorCode::InvalidResumeToken, "unknown resume token"))?;
        entry.status = TokenStatus::Used;
        Ok(())
    }

    async fn revoke(&self, token: &str) -> Result<(), EngineError> {
        let mut entry = self
            .tokens
            .get_mut(token)
            .ok_or_else(|| EngineError::new(ErrorCode::InvalidResumeToken, "unknown resume token"))?;
        entry.status = TokenStatus::Revoked;
        Ok(())
    }

    async fn list_by_execution(&self, execution_id: &str) -> Vec<ResumeToken> {
        self.tokens
            .iter()
            .filter(|e| e.value().execution_id == execution_id)
            .map(|e| e.value().clone())
            .collect()
    }

    async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .tokens
            .iter()
            .filter(|e| e.value().effective_status(now) == TokenStatus::Expired)
            .map(|e| e.key().clone())
            .collect();
        for token in &expired {
            self.tokens.remove(token);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generate_and_validate_round_trips() {
        let mgr = InMemoryResumeTokenManager::new();
        let token = mgr
            .generate("e1", "wait_step", GenerateOptions::default())
            .await
            .unwrap();
        let validation = mgr.validate(&token.token).await;
        assert!(validation.valid);
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let mgr = InMemoryResumeTokenManager::new();
        let validation = mgr.validate("nonexistent").await;
        assert!(!validation.valid);
    }

    #[tokio::test]
    async fn expired_token_fails_validation() {
        let mgr = InMemoryResumeTokenManager::new();
        let token = mgr
            .generate(
                "e1",
                "wait_step",
                GenerateOptions {
                    expires_in_ms: Some(-1),
                    metadata: None,
                },
            )
            .await
            .unwrap();
        let validation = mgr.validate(&token.token).await;
        assert!(!validation.valid);
        assert_eq!(validation.reason.as_deref(), Some("RESUME_TOKEN_EXPIRED"));
    }

    #[tokio::test]
    async fn revoke_invalidates_token() {
        let mgr = InMemoryResumeTokenManager::new();
        let token = mgr
            .generate("e1", "wait_step", GenerateOptions::default())
            .await
            .unwrap();
        mgr.revoke(&token.token).await.unwrap();
        assert!(!mgr.validate(&token.token).await.valid);
    }

    #[tokio::test]
    async fn list_by_execution_filters() {
        let mgr = InMemoryResumeTokenManager::new();
        mgr.generate("e1", "a", GenerateOptions::default()).await.unwrap();
        mgr.generate("e1", "b", GenerateOptions::default()).await.unwrap();
        mgr.generate("e2", "a", GenerateOptions::default()).await.unwrap();
        assert_eq!(mgr.list_by_execution("e1").await.len(), 2);
    }

    #[tokio::test]
    async fn cleanup_expired_removes_only_expired() {
        let mgr = InMemoryResumeTokenManager::new();
        mgr.generate(
            "e1",
            "a",
            GenerateOptions {
                expires_in_ms: Some(-1),
                metadata: None,
            },
        )
        .await
        .unwrap();
        mgr.generate("e1", "b", GenerateOptions::default()).await.unwrap();
        let removed = mgr.cleanup_expired().await;
        assert_eq!(removed, 1);
        assert_eq!(mgr.list_by_execution("e1").await.len(), 1);
    }
}
