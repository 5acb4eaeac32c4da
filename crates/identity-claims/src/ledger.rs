//! Identity ledger: one row per anonymous identity, however many claim
//! tokens have been minted against it.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ClaimErrorCode;
use crate::store::ClaimStoreState;
use crate::types::{
    Channel, ClaimSource, IdentityKey, IdentityLedgerEntry, IdentitySubject, LedgerClaimStatus,
    VisitorInfo,
};

#[derive(Debug, Clone)]
pub struct LedgerUpsert {
    pub channel: Channel,
    pub organization_id: String,
    pub agent_id: Option<String>,
    pub subject: IdentitySubject,
    pub visitor_info: Option<VisitorInfo>,
}

impl LedgerUpsert {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::for_subject(self.channel, &self.subject)
    }
}

#[derive(Debug, Clone)]
pub struct LedgerClaim<'a> {
    pub user_id: &'a str,
    pub organization_id: &'a str,
    pub source: ClaimSource,
    pub token_id: &'a str,
}

/// Idempotent by identity key. Creates an `Unclaimed` row, or merges the
/// incoming fields over the existing row and refreshes its activity stamps.
/// Returns the ledger entry id.
pub fn upsert_entry(state: &mut ClaimStoreState, input: LedgerUpsert, now: DateTime<Utc>) -> String {
    let identity_key = input.identity_key();

    if let Some(entry) = state.ledger_entry_mut(&identity_key) {
        if let Some(agent_id) = input.agent_id {
            entry.agent_id = Some(agent_id);
        }
        if let Some(incoming) = input.visitor_info {
            entry.visitor_info = Some(match entry.visitor_info.as_ref() {
                Some(existing) => existing.merged_with(&incoming),
                None => incoming,
            });
        }
        entry.last_activity_at = now;
        entry.updated_at = now;
        return entry.id.clone();
    }

    let id = format!("ile_{}", Uuid::new_v4().simple());
    state.insert_ledger_entry(IdentityLedgerEntry {
        id: id.clone(),
        identity_key,
        channel: input.channel,
        organization_id: input.organization_id,
        agent_id: input.agent_id,
        subject: input.subject,
        visitor_info: input.visitor_info,
        claim_status: LedgerClaimStatus::Unclaimed,
        claimed_by_user_id: None,
        claimed_organization_id: None,
        claimed_at: None,
        claim_source: None,
        last_claim_token_id: None,
        last_activity_at: now,
        created_at: now,
        updated_at: now,
    });
    id
}

pub fn record_issued_token(
    state: &mut ClaimStoreState,
    identity_key: &IdentityKey,
    token_id: &str,
    now: DateTime<Utc>,
) {
    if let Some(entry) = state.ledger_entry_mut(identity_key) {
        entry.last_claim_token_id = Some(token_id.to_string());
        entry.updated_at = now;
    }
}

/// Conflict check run before any claim mutation. `Ok(true)` means the
/// identity is already claimed by this same user.
pub fn check_claimable(
    state: &ClaimStoreState,
    identity_key: &IdentityKey,
    user_id: &str,
) -> Result<bool, ClaimErrorCode> {
    let Some(entry) = state.ledger_entry(identity_key) else {
        return Ok(false);
    };

    match (entry.claim_status, entry.claimed_by_user_id.as_deref()) {
        (LedgerClaimStatus::Claimed, Some(claimed_by)) if claimed_by == user_id => Ok(true),
        (LedgerClaimStatus::Claimed, _) => Err(ClaimErrorCode::LedgerClaimConflict),
        (LedgerClaimStatus::Unclaimed, _) => Ok(false),
    }
}

/// Moves the identity to `Claimed`, creating the row if the ledger never saw
/// this identity. Re-applies the conflict check so a different user can never
/// overwrite an existing claim.
pub fn mark_claimed(
    state: &mut ClaimStoreState,
    input: LedgerUpsert,
    claim: &LedgerClaim<'_>,
    now: DateTime<Utc>,
) -> Result<String, ClaimErrorCode> {
    let identity_key = input.identity_key();
    let already_claimed = check_claimable(state, &identity_key, claim.user_id)?;
    let entry_id = upsert_entry(state, input, now);

    if let Some(entry) = state.ledger_entry_mut(&identity_key) {
        if !already_claimed {
            entry.claim_status = LedgerClaimStatus::Claimed;
            entry.claimed_by_user_id = Some(claim.user_id.to_string());
            entry.claimed_organization_id = Some(claim.organization_id.to_string());
            entry.claimed_at = Some(now);
            entry.claim_source = Some(claim.source);
        }
        entry.last_claim_token_id = Some(claim.token_id.to_string());
        entry.updated_at = now;
    }

    Ok(entry_id)
}
