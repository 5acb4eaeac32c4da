use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::ClaimErrorCode;
use crate::types::{Channel, ClaimTokenType};

pub const AUDIT_TOKEN_ISSUED: &str = "identity_claim.token_issued";
pub const AUDIT_CONSUMED: &str = "identity_claim.consumed";
pub const AUDIT_DENIED: &str = "identity_claim.denied";
pub const AUDIT_SESSION_CLAIM_DENIED: &str = "identity_claim.session_claim_denied";
pub const AUDIT_TOKENS_REVOKED: &str = "identity_claim.tokens_revoked";

pub const FUNNEL_IDENTITY_CLAIMED: &str = "onboarding.identity_claimed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Denied,
}

/// Audit event under construction. The store turns it into a
/// [`ClaimAuditRecord`] inside the transaction that produced it.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: &'static str,
    pub outcome: AuditOutcome,
    pub token_id: Option<String>,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    pub error_code: Option<ClaimErrorCode>,
    pub attributes: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn new(action: &'static str, outcome: AuditOutcome) -> Self {
        Self {
            action,
            outcome,
            token_id: None,
            user_id: None,
            organization_id: None,
            error_code: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn denied(code: ClaimErrorCode) -> Self {
        Self::new(AUDIT_DENIED, AuditOutcome::Denied).with_error_code(code)
    }

    pub fn with_token_id(mut self, token_id: impl Into<String>) -> Self {
        self.token_id = Some(token_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_organization_id(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_error_code(mut self, code: ClaimErrorCode) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimAuditRecord {
    pub id: u64,
    pub action: String,
    pub outcome: AuditOutcome,
    pub token_id: Option<String>,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    pub error_code: Option<ClaimErrorCode>,
    pub attributes: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunnelEvent {
    pub name: &'static str,
    pub dedupe_key: String,
    pub user_id: String,
    pub organization_id: String,
    pub token_type: ClaimTokenType,
    pub channel: Channel,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
#[error("funnel event sink unavailable: {message}")]
pub struct FunnelEmitError {
    pub message: String,
}

/// Best-effort analytics side channel. Failures never reach claim callers.
#[async_trait]
pub trait FunnelEventSink: Send + Sync {
    async fn emit(&self, event: FunnelEvent) -> Result<(), FunnelEmitError>;
}

#[derive(Debug, Default)]
pub struct NoopFunnelSink;

#[async_trait]
impl FunnelEventSink for NoopFunnelSink {
    async fn emit(&self, _event: FunnelEvent) -> Result<(), FunnelEmitError> {
        Ok(())
    }
}

/// Keeps emitted events in memory, dropping repeats of a dedupe key.
#[derive(Debug, Default)]
pub struct MemoryFunnelSink {
    inner: Mutex<MemoryFunnelSinkInner>,
}

#[derive(Debug, Default)]
struct MemoryFunnelSinkInner {
    seen: HashSet<String>,
    events: Vec<FunnelEvent>,
}

impl MemoryFunnelSink {
    pub async fn events(&self) -> Vec<FunnelEvent> {
        self.inner.lock().await.events.clone()
    }
}

#[async_trait]
impl FunnelEventSink for MemoryFunnelSink {
    async fn emit(&self, event: FunnelEvent) -> Result<(), FunnelEmitError> {
        let mut inner = self.inner.lock().await;
        if inner.seen.insert(event.dedupe_key.clone()) {
            inner.events.push(event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(dedupe_key: &str) -> FunnelEvent {
        FunnelEvent {
            name: FUNNEL_IDENTITY_CLAIMED,
            dedupe_key: dedupe_key.to_string(),
            user_id: "user_9".to_string(),
            organization_id: "org_1".to_string(),
            token_type: ClaimTokenType::GuestSessionClaim,
            channel: Channel::Webchat,
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_sink_drops_repeated_dedupe_keys() {
        let sink = MemoryFunnelSink::default();
        sink.emit(event("tok_1")).await.expect("emit should succeed");
        sink.emit(event("tok_1")).await.expect("emit should succeed");
        sink.emit(event("tok_2")).await.expect("emit should succeed");

        let events = sink.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].dedupe_key, "tok_1");
        assert_eq!(events[1].dedupe_key, "tok_2");
    }

    #[test]
    fn audit_event_builder_collects_fields() {
        let event = AuditEvent::denied(ClaimErrorCode::TokenExpired)
            .with_token_id("tok_1")
            .with_user_id("user_9")
            .with_attribute("claim_source", "oauth_signup");

        assert_eq!(event.action, AUDIT_DENIED);
        assert_eq!(event.outcome, AuditOutcome::Denied);
        assert_eq!(event.error_code, Some(ClaimErrorCode::TokenExpired));
        assert_eq!(event.token_id.as_deref(), Some("tok_1"));
        assert_eq!(
            event.attributes.get("claim_source").map(String::as_str),
            Some("oauth_signup")
        );
    }
}
