use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::codec::{ClaimTokenCodec, ClaimTokenPayload};
use crate::config::Config;
use crate::error::{ClaimServiceError, required};
use crate::ledger::{self, LedgerUpsert};
use crate::observability::{AUDIT_TOKEN_ISSUED, AuditEvent, AuditOutcome};
use crate::store::ClaimStoreState;
use crate::types::{
    Channel, ClaimTokenKind, ClaimTokenRecord, ClaimTokenStatus, ClaimTokenType, IdentitySubject,
    VisitorInfo,
};

#[derive(Debug, Clone)]
pub struct GuestSessionClaimRequest {
    pub session_token: String,
    pub organization_id: String,
    pub agent_id: Option<String>,
    pub channel: Channel,
    pub visitor_info: Option<VisitorInfo>,
}

#[derive(Debug, Clone)]
pub struct TelegramOrgClaimRequest {
    pub telegram_chat_id: String,
    pub organization_id: String,
    pub issued_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedClaimToken {
    pub signed_token: String,
    pub token_id: String,
    pub token_type: ClaimTokenType,
    pub ledger_entry_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GuestIssueOutcome {
    Issued(IssuedClaimToken),
    /// The session is already claimed; no token is minted for it again.
    AlreadyClaimed,
    /// Unknown session, or one that belongs to another organization.
    SessionUnavailable,
}

#[derive(Debug, Clone)]
pub struct ClaimTokenIssuer {
    codec: ClaimTokenCodec,
    guest_session_ttl: Duration,
    telegram_org_ttl: Duration,
}

impl ClaimTokenIssuer {
    pub fn new(
        codec: ClaimTokenCodec,
        guest_session_ttl: Duration,
        telegram_org_ttl: Duration,
    ) -> Self {
        Self {
            codec,
            guest_session_ttl,
            telegram_org_ttl,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            ClaimTokenCodec::from_config(config),
            Duration::seconds(ttl_seconds(config.guest_session_ttl_seconds)),
            Duration::seconds(ttl_seconds(config.telegram_org_ttl_seconds)),
        )
    }

    pub fn issue_guest_session_claim(
        &self,
        state: &mut ClaimStoreState,
        request: GuestSessionClaimRequest,
        now: DateTime<Utc>,
    ) -> Result<GuestIssueOutcome, ClaimServiceError> {
        let session_token = required(&request.session_token, "session_token")?;
        let organization_id = required(&request.organization_id, "organization_id")?;
        if !request.channel.is_guest_session() {
            return Err(ClaimServiceError::InvalidRequest {
                field: "channel",
                message: format!(
                    "guest session claims are not issued for the {} channel",
                    request.channel
                ),
            });
        }

        let Some(session) = state.guest_session(&session_token) else {
            return Ok(GuestIssueOutcome::SessionUnavailable);
        };
        if session.organization_id != organization_id {
            return Ok(GuestIssueOutcome::SessionUnavailable);
        }
        if session.claimed_by_user_id.is_some() {
            return Ok(GuestIssueOutcome::AlreadyClaimed);
        }
        // The stored session owns the channel, so sync and issuance share one ledger key.
        let channel = session.channel;
        if !channel.is_guest_session() {
            return Ok(GuestIssueOutcome::SessionUnavailable);
        }

        let ledger_input = LedgerUpsert {
            channel,
            organization_id: organization_id.clone(),
            agent_id: request.agent_id,
            subject: IdentitySubject::GuestSession {
                session_token: session_token.clone(),
            },
            visitor_info: request.visitor_info,
        };

        let issued = self.mint(
            state,
            ledger_input,
            ClaimTokenKind::GuestSessionClaim { session_token },
            None,
            now + self.guest_session_ttl,
            now,
        )?;

        Ok(GuestIssueOutcome::Issued(issued))
    }

    /// Administrative issuance; re-issuable, no existing-claim short circuit.
    pub fn issue_telegram_org_claim(
        &self,
        state: &mut ClaimStoreState,
        request: TelegramOrgClaimRequest,
        now: DateTime<Utc>,
    ) -> Result<IssuedClaimToken, ClaimServiceError> {
        let telegram_chat_id = required(&request.telegram_chat_id, "telegram_chat_id")?;
        let organization_id = required(&request.organization_id, "organization_id")?;
        let issued_by = request
            .issued_by
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        let ledger_input = LedgerUpsert {
            channel: Channel::Telegram,
            organization_id,
            agent_id: None,
            subject: IdentitySubject::TelegramChat {
                telegram_chat_id: telegram_chat_id.clone(),
            },
            visitor_info: None,
        };

        self.mint(
            state,
            ledger_input,
            ClaimTokenKind::TelegramOrgClaim { telegram_chat_id },
            issued_by,
            now + self.telegram_org_ttl,
            now,
        )
    }

    fn mint(
        &self,
        state: &mut ClaimStoreState,
        ledger_input: LedgerUpsert,
        kind: ClaimTokenKind,
        issued_by: Option<String>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<IssuedClaimToken, ClaimServiceError> {
        let channel = ledger_input.channel;
        let organization_id = ledger_input.organization_id.clone();
        let identity_key = ledger_input.identity_key();
        let ledger_entry_id = ledger::upsert_entry(state, ledger_input, now);

        let token_id = Uuid::new_v4().to_string();
        let payload = ClaimTokenPayload {
            token_id: token_id.clone(),
            kind: kind.clone(),
            channel,
            organization_id: organization_id.clone(),
            issued_at: now.timestamp_millis(),
            expires_at: expires_at.timestamp_millis(),
        };
        let signed_token = self.codec.encode(&payload)?;
        let token_type = kind.token_type();

        state.insert_claim_token(ClaimTokenRecord {
            token_id: token_id.clone(),
            kind,
            channel,
            status: ClaimTokenStatus::Issued,
            organization_id: organization_id.clone(),
            ledger_entry_id: ledger_entry_id.clone(),
            signed_token: signed_token.clone(),
            issued_by: issued_by.clone(),
            issued_at: now,
            expires_at,
            consumed_at: None,
            consumed_by_user_id: None,
            consumed_by_organization_id: None,
            expired_at: None,
            revoked_at: None,
            revoke_reason: None,
            updated_at: now,
        });
        ledger::record_issued_token(state, &identity_key, &token_id, now);

        let mut audit = AuditEvent::new(AUDIT_TOKEN_ISSUED, AuditOutcome::Success)
            .with_token_id(token_id.clone())
            .with_organization_id(organization_id)
            .with_attribute("token_type", token_type.as_str())
            .with_attribute("channel", channel.as_str())
            .with_attribute("identity_key", identity_key.as_str())
            .with_attribute("expires_at", expires_at.to_rfc3339());
        if let Some(issued_by) = issued_by {
            audit = audit.with_user_id(issued_by);
        }
        state.append_audit(audit, now);

        Ok(IssuedClaimToken {
            signed_token,
            token_id,
            token_type,
            ledger_entry_id,
            expires_at,
        })
    }
}

const MAX_TTL_SECONDS: u64 = 10 * 365 * 86_400;

fn ttl_seconds(value: u64) -> i64 {
    i64::try_from(value.min(MAX_TTL_SECONDS)).unwrap_or_default()
}
