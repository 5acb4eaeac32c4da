//! Claim token state machine.
//!
//! `Issued` is the only live state. A token leaves it exactly once: to
//! `Consumed` on a successful claim, to `Expired` the first time it is touched
//! after its expiry, or to `Revoked` by an administrative bulk action. Every
//! function here runs inside a single store transaction, so two consumers of
//! one token are serialized and the second one observes the first one's
//! terminal status.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::codec::{ClaimTokenCodec, ClaimTokenPayload};
use crate::error::{ClaimErrorCode, ClaimServiceError, required};
use crate::ledger::{self, LedgerClaim, LedgerUpsert};
use crate::observability::{
    AUDIT_CONSUMED, AUDIT_SESSION_CLAIM_DENIED, AUDIT_TOKENS_REVOKED, AuditEvent, AuditOutcome,
};
use crate::store::ClaimStoreState;
use crate::types::{
    Channel, ClaimSource, ClaimTokenKind, ClaimTokenRecord, ClaimTokenStatus, ClaimTokenType,
    IdentityKey,
};

pub const ORG_OWNER_ROLE: &str = "org_owner";
const ORG_OWNER_ROLE_DESCRIPTION: &str = "Organization owner";

#[derive(Debug, Clone)]
pub struct ConsumeRequest {
    pub signed_token: String,
    pub user_id: String,
    pub organization_id: String,
    pub claim_source: ClaimSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClaimResult {
    pub success: bool,
    pub already_claimed: bool,
    pub token_id: Option<String>,
    pub token_type: Option<ClaimTokenType>,
    pub linked_organization_id: Option<String>,
    pub linked_session_token: Option<String>,
    pub linked_telegram_chat_id: Option<String>,
    pub error_code: Option<ClaimErrorCode>,
}

impl ClaimResult {
    fn denied(code: ClaimErrorCode, token_id: Option<&str>) -> Self {
        Self {
            token_id: token_id.map(ToString::to_string),
            error_code: Some(code),
            ..Self::default()
        }
    }

    fn linked(record: &ClaimTokenRecord, organization_id: &str, already_claimed: bool) -> Self {
        Self {
            success: true,
            already_claimed,
            token_id: Some(record.token_id.clone()),
            token_type: Some(record.kind.token_type()),
            linked_organization_id: Some(organization_id.to_string()),
            linked_session_token: record.kind.session_token().map(ToString::to_string),
            linked_telegram_chat_id: record.kind.telegram_chat_id().map(ToString::to_string),
            error_code: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InspectResult {
    pub valid: bool,
    pub token_id: Option<String>,
    pub token_type: Option<ClaimTokenType>,
    pub channel: Option<Channel>,
    pub organization_id: Option<String>,
    pub status: Option<ClaimTokenStatus>,
    pub expires_at: Option<DateTime<Utc>>,
    pub error_code: Option<ClaimErrorCode>,
}

/// What the consumer did, plus whether the funnel should hear about it.
#[derive(Debug, Clone)]
pub struct ConsumeOutcome {
    pub result: ClaimResult,
    pub newly_consumed: Option<ClaimTokenRecord>,
}

impl ConsumeOutcome {
    fn settled(result: ClaimResult) -> Self {
        Self {
            result,
            newly_consumed: None,
        }
    }
}

/// The authenticated caller completing a claim.
#[derive(Debug, Clone, Copy)]
struct Claimant<'a> {
    user_id: &'a str,
    organization_id: &'a str,
    source: ClaimSource,
}

/// Result of the read-only checks shared by consume and inspect.
enum TokenCheck {
    Rejected {
        code: ClaimErrorCode,
        record: Option<ClaimTokenRecord>,
    },
    Consumed(ClaimTokenRecord),
    /// Still `Issued` in the store but past its expiry.
    Stale(ClaimTokenRecord),
    Live {
        payload: ClaimTokenPayload,
        record: ClaimTokenRecord,
    },
}

#[derive(Debug, Clone)]
pub struct ClaimConsumer {
    codec: ClaimTokenCodec,
}

impl ClaimConsumer {
    pub fn new(codec: ClaimTokenCodec) -> Self {
        Self { codec }
    }

    pub fn consume(
        &self,
        state: &mut ClaimStoreState,
        request: &ConsumeRequest,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, ClaimServiceError> {
        let user_id = required(&request.user_id, "user_id")?;
        let organization_id = required(&request.organization_id, "organization_id")?;

        match self.check(state, &request.signed_token, now) {
            TokenCheck::Rejected { code, record } => {
                let token_id = record.as_ref().map(|record| record.token_id.as_str());
                deny(state, code, token_id, &user_id, request.claim_source, now);
                Ok(ConsumeOutcome::settled(ClaimResult::denied(code, token_id)))
            }
            TokenCheck::Consumed(record) => {
                if record.consumed_by_user_id.as_deref() == Some(user_id.as_str()) {
                    // Retry by the same claimant: replay the stored result.
                    let linked_organization_id = record
                        .consumed_by_organization_id
                        .clone()
                        .unwrap_or_else(|| record.organization_id.clone());
                    return Ok(ConsumeOutcome::settled(ClaimResult::linked(
                        &record,
                        &linked_organization_id,
                        true,
                    )));
                }

                let code = ClaimErrorCode::TokenAlreadyConsumed;
                deny(
                    state,
                    code,
                    Some(record.token_id.as_str()),
                    &user_id,
                    request.claim_source,
                    now,
                );
                Ok(ConsumeOutcome::settled(ClaimResult::denied(
                    code,
                    Some(record.token_id.as_str()),
                )))
            }
            TokenCheck::Stale(record) => {
                if let Some(row) = state.claim_token_mut(&record.token_id) {
                    row.status = ClaimTokenStatus::Expired;
                    row.expired_at = Some(now);
                    row.updated_at = now;
                }
                let code = ClaimErrorCode::TokenExpired;
                deny(
                    state,
                    code,
                    Some(record.token_id.as_str()),
                    &user_id,
                    request.claim_source,
                    now,
                );
                Ok(ConsumeOutcome::settled(ClaimResult::denied(
                    code,
                    Some(record.token_id.as_str()),
                )))
            }
            TokenCheck::Live { payload, record } => {
                let claimant = Claimant {
                    user_id: &user_id,
                    organization_id: &organization_id,
                    source: request.claim_source,
                };
                let claimed = match &record.kind {
                    ClaimTokenKind::GuestSessionClaim { session_token } => {
                        claim_guest_session(state, &record, session_token, claimant, now)
                    }
                    ClaimTokenKind::TelegramOrgClaim { telegram_chat_id } => {
                        claim_telegram_org(state, &record, telegram_chat_id, claimant, now)
                    }
                };

                let (linked_organization_id, already_claimed) = match claimed {
                    Ok(linked) => linked,
                    Err(code) => {
                        deny(
                            state,
                            code,
                            Some(record.token_id.as_str()),
                            &user_id,
                            request.claim_source,
                            now,
                        );
                        return Ok(ConsumeOutcome::settled(ClaimResult::denied(
                            code,
                            Some(record.token_id.as_str()),
                        )));
                    }
                };

                let Some(row) = state.claim_token_mut(&record.token_id) else {
                    return Ok(ConsumeOutcome::settled(ClaimResult::denied(
                        ClaimErrorCode::TokenNotFound,
                        Some(record.token_id.as_str()),
                    )));
                };
                row.status = ClaimTokenStatus::Consumed;
                row.consumed_at = Some(now);
                row.consumed_by_user_id = Some(user_id.clone());
                row.consumed_by_organization_id = Some(linked_organization_id.clone());
                row.updated_at = now;
                let consumed = row.clone();

                state.append_audit(
                    AuditEvent::new(AUDIT_CONSUMED, AuditOutcome::Success)
                        .with_token_id(consumed.token_id.clone())
                        .with_user_id(user_id.clone())
                        .with_organization_id(linked_organization_id.clone())
                        .with_attribute("token_type", consumed.kind.token_type().as_str())
                        .with_attribute("channel", payload.channel.as_str())
                        .with_attribute("claim_source", request.claim_source.as_str())
                        .with_attribute("already_claimed", already_claimed.to_string()),
                    now,
                );

                Ok(ConsumeOutcome {
                    result: ClaimResult::linked(&consumed, &linked_organization_id, already_claimed),
                    newly_consumed: Some(consumed),
                })
            }
        }
    }

    /// Runs the consume checks without mutating anything, so a client can
    /// learn that a link is dead without burning it.
    pub fn inspect(
        &self,
        state: &ClaimStoreState,
        signed_token: &str,
        now: DateTime<Utc>,
    ) -> InspectResult {
        let (record, code) = match self.check(state, signed_token, now) {
            TokenCheck::Rejected { code, record } => (record, Some(code)),
            TokenCheck::Consumed(record) => (Some(record), Some(ClaimErrorCode::TokenAlreadyConsumed)),
            TokenCheck::Stale(record) => (Some(record), Some(ClaimErrorCode::TokenExpired)),
            TokenCheck::Live { record, .. } => (Some(record), None),
        };

        let Some(record) = record else {
            return InspectResult {
                error_code: code,
                ..InspectResult::default()
            };
        };

        InspectResult {
            valid: code.is_none(),
            token_id: Some(record.token_id.clone()),
            token_type: Some(record.kind.token_type()),
            channel: Some(record.channel),
            organization_id: Some(record.organization_id.clone()),
            status: Some(record.status),
            expires_at: Some(record.expires_at),
            error_code: code,
        }
    }

    fn check(&self, state: &ClaimStoreState, signed_token: &str, now: DateTime<Utc>) -> TokenCheck {
        let Some(payload) = self.codec.decode_and_verify(signed_token) else {
            return TokenCheck::Rejected {
                code: ClaimErrorCode::InvalidSignature,
                record: None,
            };
        };

        let Some(record) = state.claim_token(&payload.token_id).cloned() else {
            return TokenCheck::Rejected {
                code: ClaimErrorCode::TokenNotFound,
                record: None,
            };
        };

        match record.status {
            ClaimTokenStatus::Consumed => return TokenCheck::Consumed(record),
            ClaimTokenStatus::Expired => {
                return TokenCheck::Rejected {
                    code: ClaimErrorCode::TokenExpired,
                    record: Some(record),
                };
            }
            ClaimTokenStatus::Revoked => {
                return TokenCheck::Rejected {
                    code: ClaimErrorCode::TokenRevoked,
                    record: Some(record),
                };
            }
            ClaimTokenStatus::Issued => {}
        }

        if payload.organization_id != record.organization_id {
            return TokenCheck::Rejected {
                code: ClaimErrorCode::OrganizationMismatch,
                record: Some(record),
            };
        }

        if payload.kind.token_type() != record.kind.token_type() {
            return TokenCheck::Rejected {
                code: ClaimErrorCode::UnsupportedTokenType,
                record: Some(record),
            };
        }

        let now_millis = now.timestamp_millis();
        if now_millis > payload.expires_at || now > record.expires_at {
            return TokenCheck::Stale(record);
        }

        TokenCheck::Live { payload, record }
    }
}

/// Moves every `Issued` token for the chat to `Revoked`. Returns how many
/// tokens changed.
pub fn revoke_all_for_telegram_chat(
    state: &mut ClaimStoreState,
    telegram_chat_id: &str,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<usize, ClaimServiceError> {
    let telegram_chat_id = required(telegram_chat_id, "telegram_chat_id")?;
    let reason = reason
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string);

    let mut revoked = 0usize;
    for row in state.claim_tokens_mut() {
        if row.status != ClaimTokenStatus::Issued
            || row.kind.telegram_chat_id() != Some(telegram_chat_id.as_str())
        {
            continue;
        }
        row.status = ClaimTokenStatus::Revoked;
        row.revoked_at = Some(now);
        row.revoke_reason = reason.clone();
        row.updated_at = now;
        revoked += 1;
    }

    let mut audit = AuditEvent::new(AUDIT_TOKENS_REVOKED, AuditOutcome::Success)
        .with_attribute("telegram_chat_id", telegram_chat_id.clone())
        .with_attribute("revoked_count", revoked.to_string());
    if let Some(reason) = reason {
        audit = audit.with_attribute("reason", reason);
    }
    state.append_audit(audit, now);

    Ok(revoked)
}

/// Session and ledger are checked independently before either is written,
/// so a denial leaves both untouched.
fn claim_guest_session(
    state: &mut ClaimStoreState,
    record: &ClaimTokenRecord,
    session_token: &str,
    claimant: Claimant<'_>,
    now: DateTime<Utc>,
) -> Result<(String, bool), ClaimErrorCode> {
    if session_token.trim().is_empty() {
        return Err(ClaimErrorCode::MissingSessionToken);
    }

    let Some(session) = state.guest_session(session_token).cloned() else {
        return Err(ClaimErrorCode::SessionNotFound);
    };
    if session.organization_id != record.organization_id {
        return Err(ClaimErrorCode::SessionOrgMismatch);
    }

    let session_already_claimed = match session.claimed_by_user_id.as_deref() {
        Some(claimed_by) if claimed_by != claimant.user_id => {
            state.append_audit(
                AuditEvent::new(AUDIT_SESSION_CLAIM_DENIED, AuditOutcome::Denied)
                    .with_error_code(ClaimErrorCode::SessionAlreadyClaimed)
                    .with_token_id(record.token_id.clone())
                    .with_user_id(claimant.user_id)
                    .with_organization_id(record.organization_id.clone())
                    .with_attribute("session_token", session_token)
                    .with_attribute("claimed_by_user_id", claimed_by),
                now,
            );
            return Err(ClaimErrorCode::SessionAlreadyClaimed);
        }
        Some(_) => true,
        None => false,
    };

    let identity_key = IdentityKey::guest_session(record.channel, session_token);
    ledger::check_claimable(state, &identity_key, claimant.user_id)?;

    if !session_already_claimed {
        if let Some(row) = state.guest_session_mut(session_token) {
            row.claimed_by_user_id = Some(claimant.user_id.to_string());
            row.claimed_organization_id = Some(claimant.organization_id.to_string());
            row.claimed_at = Some(now);
            row.updated_at = now;
        }
    }

    ledger::mark_claimed(
        state,
        LedgerUpsert {
            channel: record.channel,
            organization_id: record.organization_id.clone(),
            agent_id: session.agent_id,
            subject: record.kind.subject(),
            visitor_info: None,
        },
        &LedgerClaim {
            user_id: claimant.user_id,
            organization_id: claimant.organization_id,
            source: claimant.source,
            token_id: &record.token_id,
        },
        now,
    )?;

    Ok((claimant.organization_id.to_string(), session_already_claimed))
}

/// Links the claiming user to the token's organization as its owner.
fn claim_telegram_org(
    state: &mut ClaimStoreState,
    record: &ClaimTokenRecord,
    telegram_chat_id: &str,
    claimant: Claimant<'_>,
    now: DateTime<Utc>,
) -> Result<(String, bool), ClaimErrorCode> {
    let organization_id = record.organization_id.as_str();
    let user_id = claimant.user_id;
    let identity_key = IdentityKey::telegram(telegram_chat_id);
    let ledger_already_claimed = ledger::check_claimable(state, &identity_key, user_id)?;

    let role = state.ensure_role(ORG_OWNER_ROLE, ORG_OWNER_ROLE_DESCRIPTION, now);
    state.upsert_active_membership(user_id, organization_id, &role.name, now);

    let user = state.user_or_insert(user_id, now);
    if user.default_organization_id.is_none() {
        user.default_organization_id = Some(organization_id.to_string());
        user.updated_at = now;
    }

    if let Some(mapping) = state.telegram_chat_mapping_mut(telegram_chat_id) {
        mapping.organization_id = Some(organization_id.to_string());
        mapping.user_id = Some(user_id.to_string());
        mapping.linked_at = Some(now);
        mapping.updated_at = now;
    }

    ledger::mark_claimed(
        state,
        LedgerUpsert {
            channel: Channel::Telegram,
            organization_id: organization_id.to_string(),
            agent_id: None,
            subject: record.kind.subject(),
            visitor_info: None,
        },
        &LedgerClaim {
            user_id,
            organization_id,
            source: claimant.source,
            token_id: &record.token_id,
        },
        now,
    )?;

    Ok((organization_id.to_string(), ledger_already_claimed))
}

fn deny(
    state: &mut ClaimStoreState,
    code: ClaimErrorCode,
    token_id: Option<&str>,
    user_id: &str,
    source: ClaimSource,
    now: DateTime<Utc>,
) {
    let mut audit = AuditEvent::denied(code)
        .with_user_id(user_id)
        .with_attribute("claim_source", source.as_str());
    if let Some(token_id) = token_id {
        audit = audit.with_token_id(token_id);
    }
    state.append_audit(audit, now);
}
