use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::codec::ClaimTokenCodec;
use crate::config::Config;
use crate::consumer::{self, ClaimConsumer, ClaimResult, ConsumeRequest, InspectResult};
use crate::error::{ClaimServiceError, required};
use crate::issuer::{
    ClaimTokenIssuer, GuestIssueOutcome, GuestSessionClaimRequest, IssuedClaimToken,
    TelegramOrgClaimRequest,
};
use crate::ledger::{self, LedgerUpsert};
use crate::observability::{
    FUNNEL_IDENTITY_CLAIMED, FunnelEvent, FunnelEventSink, NoopFunnelSink,
};
use crate::store::ClaimStore;
use crate::types::{Channel, IdentitySubject, VisitorInfo};

const LOG_TARGET: &str = "openagents.identity_claims";

#[derive(Debug, Clone)]
pub struct GuestLedgerSync {
    pub session_token: String,
    pub organization_id: String,
    pub agent_id: Option<String>,
    pub channel: Channel,
    pub visitor_info: Option<VisitorInfo>,
}

#[derive(Debug, Clone)]
pub struct TelegramLedgerSync {
    pub telegram_chat_id: String,
    pub organization_id: String,
    pub agent_id: Option<String>,
    pub visitor_info: Option<VisitorInfo>,
}

/// Entry point for onboarding handlers and bot webhooks. Each operation is
/// one store transaction; funnel events go out only after it commits.
#[derive(Clone)]
pub struct IdentityClaimService {
    store: ClaimStore,
    issuer: ClaimTokenIssuer,
    consumer: ClaimConsumer,
    funnel: Arc<dyn FunnelEventSink>,
}

impl IdentityClaimService {
    pub fn new(config: &Config, store: ClaimStore, funnel: Arc<dyn FunnelEventSink>) -> Self {
        Self {
            store,
            issuer: ClaimTokenIssuer::from_config(config),
            consumer: ClaimConsumer::new(ClaimTokenCodec::from_config(config)),
            funnel,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        config.warn_if_development_secret();
        Self::new(
            config,
            ClaimStore::from_config(config),
            Arc::new(NoopFunnelSink),
        )
    }

    pub fn store(&self) -> &ClaimStore {
        &self.store
    }

    pub async fn issue_guest_session_claim_token(
        &self,
        request: GuestSessionClaimRequest,
    ) -> Result<GuestIssueOutcome, ClaimServiceError> {
        let now = Utc::now();
        self.store
            .transaction(|state| self.issuer.issue_guest_session_claim(state, request, now))
            .await
    }

    pub async fn issue_telegram_org_claim_token(
        &self,
        request: TelegramOrgClaimRequest,
    ) -> Result<IssuedClaimToken, ClaimServiceError> {
        let now = Utc::now();
        self.store
            .transaction(|state| self.issuer.issue_telegram_org_claim(state, request, now))
            .await
    }

    pub async fn inspect_identity_claim_token(&self, signed_token: &str) -> InspectResult {
        self.inspect_at(signed_token, Utc::now()).await
    }

    pub(crate) async fn inspect_at(&self, signed_token: &str, now: DateTime<Utc>) -> InspectResult {
        self.store
            .read(|state| self.consumer.inspect(state, signed_token, now))
            .await
    }

    pub async fn consume_identity_claim_token(
        &self,
        request: ConsumeRequest,
    ) -> Result<ClaimResult, ClaimServiceError> {
        self.consume_at(request, Utc::now()).await
    }

    pub(crate) async fn consume_at(
        &self,
        request: ConsumeRequest,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult, ClaimServiceError> {
        let outcome = self
            .store
            .transaction(|state| self.consumer.consume(state, &request, now))
            .await?;

        if let Some(record) = outcome.newly_consumed.as_ref() {
            let event = FunnelEvent {
                name: FUNNEL_IDENTITY_CLAIMED,
                dedupe_key: record.token_id.clone(),
                user_id: request.user_id.trim().to_string(),
                organization_id: record
                    .consumed_by_organization_id
                    .clone()
                    .unwrap_or_else(|| record.organization_id.clone()),
                token_type: record.kind.token_type(),
                channel: record.channel,
                occurred_at: now,
            };
            if let Err(error) = self.funnel.emit(event).await {
                tracing::warn!(
                    target: LOG_TARGET,
                    token_id = %record.token_id,
                    error = %error,
                    "identity claim funnel emission failed",
                );
            }
        }

        Ok(outcome.result)
    }

    pub async fn revoke_telegram_org_claim_tokens_for_chat(
        &self,
        telegram_chat_id: &str,
        reason: Option<&str>,
    ) -> Result<usize, ClaimServiceError> {
        let now = Utc::now();
        let revoked = self
            .store
            .transaction(|state| {
                consumer::revoke_all_for_telegram_chat(state, telegram_chat_id, reason, now)
            })
            .await?;
        tracing::info!(
            target: LOG_TARGET,
            telegram_chat_id,
            revoked,
            "revoked telegram org claim tokens",
        );
        Ok(revoked)
    }

    /// Records guest activity on the ledger. Returns the ledger entry id.
    pub async fn sync_guest_session_ledger(
        &self,
        sync: GuestLedgerSync,
    ) -> Result<String, ClaimServiceError> {
        let session_token = required(&sync.session_token, "session_token")?;
        let organization_id = required(&sync.organization_id, "organization_id")?;
        if !sync.channel.is_guest_session() {
            return Err(ClaimServiceError::InvalidRequest {
                field: "channel",
                message: format!("{} is not a guest session channel", sync.channel),
            });
        }

        let now = Utc::now();
        self.store
            .transaction(|state| {
                Ok(ledger::upsert_entry(
                    state,
                    LedgerUpsert {
                        channel: sync.channel,
                        organization_id,
                        agent_id: sync.agent_id,
                        subject: IdentitySubject::GuestSession { session_token },
                        visitor_info: sync.visitor_info,
                    },
                    now,
                ))
            })
            .await
    }

    /// Records Telegram chat activity on the ledger. Returns the ledger entry id.
    pub async fn sync_telegram_identity_ledger(
        &self,
        sync: TelegramLedgerSync,
    ) -> Result<String, ClaimServiceError> {
        let telegram_chat_id = required(&sync.telegram_chat_id, "telegram_chat_id")?;
        let organization_id = required(&sync.organization_id, "organization_id")?;

        let now = Utc::now();
        self.store
            .transaction(|state| {
                Ok(ledger::upsert_entry(
                    state,
                    LedgerUpsert {
                        channel: Channel::Telegram,
                        organization_id,
                        agent_id: sync.agent_id,
                        subject: IdentitySubject::TelegramChat { telegram_chat_id },
                        visitor_info: sync.visitor_info,
                    },
                    now,
                ))
            })
            .await
    }
}
