use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::config::Config;
use crate::consumer::{ClaimResult, ConsumeRequest, ORG_OWNER_ROLE};
use crate::error::{ClaimErrorCode, ClaimServiceError};
use crate::issuer::{
    GuestIssueOutcome, GuestSessionClaimRequest, IssuedClaimToken, TelegramOrgClaimRequest,
};
use crate::observability::{
    FUNNEL_IDENTITY_CLAIMED, FunnelEmitError, FunnelEvent, FunnelEventSink, MemoryFunnelSink,
};
use crate::service::{GuestLedgerSync, IdentityClaimService, TelegramLedgerSync};
use crate::store::ClaimStore;
use crate::types::{
    Channel, ClaimSource, ClaimTokenStatus, ClaimTokenType, GuestSessionRecord, IdentityKey,
    LedgerClaimStatus, VisitorInfo,
};

struct FailingFunnelSink;

#[async_trait]
impl FunnelEventSink for FailingFunnelSink {
    async fn emit(&self, _event: FunnelEvent) -> Result<(), FunnelEmitError> {
        Err(FunnelEmitError {
            message: "analytics offline".to_string(),
        })
    }
}

fn service_with(store: ClaimStore, funnel: Arc<dyn FunnelEventSink>) -> IdentityClaimService {
    IdentityClaimService::new(&Config::for_tests(), store, funnel)
}

async fn seed_session(service: &IdentityClaimService, session_token: &str, organization_id: &str) -> Result<()> {
    let now = Utc::now();
    service
        .store()
        .put_guest_session(GuestSessionRecord {
            session_token: session_token.to_string(),
            organization_id: organization_id.to_string(),
            agent_id: Some("agent_1".to_string()),
            channel: Channel::Webchat,
            claimed_by_user_id: None,
            claimed_organization_id: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        })
        .await?;
    Ok(())
}

async fn issue_guest(service: &IdentityClaimService) -> Result<IssuedClaimToken> {
    let outcome = service
        .issue_guest_session_claim_token(GuestSessionClaimRequest {
            session_token: "sess_abc".to_string(),
            organization_id: "org_1".to_string(),
            agent_id: Some("agent_1".to_string()),
            channel: Channel::Webchat,
            visitor_info: None,
        })
        .await?;
    match outcome {
        GuestIssueOutcome::Issued(issued) => Ok(issued),
        other => Err(anyhow!("expected an issued token, got {other:?}")),
    }
}

async fn issue_telegram(service: &IdentityClaimService) -> Result<IssuedClaimToken> {
    Ok(service
        .issue_telegram_org_claim_token(TelegramOrgClaimRequest {
            telegram_chat_id: "123456".to_string(),
            organization_id: "org_2".to_string(),
            issued_by: Some("bot".to_string()),
        })
        .await?)
}

fn consume_request(signed_token: &str, user_id: &str) -> ConsumeRequest {
    ConsumeRequest {
        signed_token: signed_token.to_string(),
        user_id: user_id.to_string(),
        organization_id: "org_1".to_string(),
        claim_source: ClaimSource::OauthSignup,
    }
}

#[tokio::test]
async fn guest_session_claim_links_the_session() -> Result<()> {
    let service = service_with(ClaimStore::memory(), Arc::new(MemoryFunnelSink::default()));
    seed_session(&service, "sess_abc", "org_1").await?;
    let issued = issue_guest(&service).await?;

    let result = service
        .consume_identity_claim_token(consume_request(&issued.signed_token, "user_9"))
        .await?;

    assert_eq!(
        result,
        ClaimResult {
            success: true,
            already_claimed: false,
            token_id: Some(issued.token_id.clone()),
            token_type: Some(ClaimTokenType::GuestSessionClaim),
            linked_organization_id: Some("org_1".to_string()),
            linked_session_token: Some("sess_abc".to_string()),
            linked_telegram_chat_id: None,
            error_code: None,
        }
    );
    let session = service
        .store()
        .guest_session("sess_abc")
        .await
        .ok_or_else(|| anyhow!("session missing"))?;
    assert_eq!(session.claimed_by_user_id.as_deref(), Some("user_9"));
    Ok(())
}

#[tokio::test]
async fn telegram_claim_sets_default_org_and_owner_membership() -> Result<()> {
    let service = service_with(ClaimStore::memory(), Arc::new(MemoryFunnelSink::default()));
    let issued = issue_telegram(&service).await?;
    assert_eq!(issued.token_type, ClaimTokenType::TelegramOrgClaim);

    let mut request = consume_request(&issued.signed_token, "user_new");
    request.claim_source = ClaimSource::TelegramBot;
    let result = service.consume_identity_claim_token(request).await?;

    assert!(result.success);
    assert_eq!(result.linked_organization_id.as_deref(), Some("org_2"));
    let user = service
        .store()
        .user("user_new")
        .await
        .ok_or_else(|| anyhow!("user missing"))?;
    assert_eq!(user.default_organization_id.as_deref(), Some("org_2"));
    let membership = service
        .store()
        .membership("user_new", "org_2")
        .await
        .ok_or_else(|| anyhow!("membership missing"))?;
    assert!(membership.is_active);
    assert_eq!(membership.role, ORG_OWNER_ROLE);
    Ok(())
}

#[tokio::test]
async fn consuming_twice_as_the_same_user_is_idempotent() -> Result<()> {
    let funnel = Arc::new(MemoryFunnelSink::default());
    let service = service_with(ClaimStore::memory(), funnel.clone());
    seed_session(&service, "sess_abc", "org_1").await?;
    let issued = issue_guest(&service).await?;

    let first = service
        .consume_identity_claim_token(consume_request(&issued.signed_token, "user_9"))
        .await?;
    let audits_after_first = service.store().audit_entries().await.len();
    let second = service
        .consume_identity_claim_token(consume_request(&issued.signed_token, "user_9"))
        .await?;

    assert!(first.success && !first.already_claimed);
    assert!(second.success && second.already_claimed);
    assert_eq!(second.linked_session_token.as_deref(), Some("sess_abc"));
    assert_eq!(service.store().audit_entries().await.len(), audits_after_first);

    let events = funnel.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name, FUNNEL_IDENTITY_CLAIMED);
    assert_eq!(events[0].dedupe_key, issued.token_id);
    Ok(())
}

#[tokio::test]
async fn consumed_token_cannot_be_claimed_by_another_user() -> Result<()> {
    let service = service_with(ClaimStore::memory(), Arc::new(MemoryFunnelSink::default()));
    seed_session(&service, "sess_abc", "org_1").await?;
    let issued = issue_guest(&service).await?;

    service
        .consume_identity_claim_token(consume_request(&issued.signed_token, "user_9"))
        .await?;
    let hijack = service
        .consume_identity_claim_token(consume_request(&issued.signed_token, "user_10"))
        .await?;

    assert!(!hijack.success);
    assert_eq!(hijack.error_code, Some(ClaimErrorCode::TokenAlreadyConsumed));
    let session = service
        .store()
        .guest_session("sess_abc")
        .await
        .ok_or_else(|| anyhow!("session missing"))?;
    assert_eq!(session.claimed_by_user_id.as_deref(), Some("user_9"));
    Ok(())
}

#[tokio::test]
async fn concurrent_consumption_has_exactly_one_winner() -> Result<()> {
    let service = service_with(ClaimStore::memory(), Arc::new(MemoryFunnelSink::default()));
    seed_session(&service, "sess_abc", "org_1").await?;
    let issued = issue_guest(&service).await?;

    let (left, right) = tokio::join!(
        service.consume_identity_claim_token(consume_request(&issued.signed_token, "user_9")),
        service.consume_identity_claim_token(consume_request(&issued.signed_token, "user_10")),
    );
    let results = [left?, right?];

    let winners = results.iter().filter(|result| result.success).count();
    assert_eq!(winners, 1);
    let loser = results
        .iter()
        .find(|result| !result.success)
        .ok_or_else(|| anyhow!("expected one denied claim"))?;
    assert!(matches!(
        loser.error_code,
        Some(ClaimErrorCode::TokenAlreadyConsumed | ClaimErrorCode::SessionAlreadyClaimed)
    ));
    Ok(())
}

#[tokio::test]
async fn expired_token_flips_once_and_stays_expired() -> Result<()> {
    let service = service_with(ClaimStore::memory(), Arc::new(MemoryFunnelSink::default()));
    seed_session(&service, "sess_abc", "org_1").await?;
    let issued = issue_guest(&service).await?;
    let late = Utc::now() + Duration::hours(25);

    let first = service
        .consume_at(consume_request(&issued.signed_token, "user_9"), late)
        .await?;
    assert_eq!(first.error_code, Some(ClaimErrorCode::TokenExpired));
    let record = service
        .store()
        .claim_token(&issued.token_id)
        .await
        .ok_or_else(|| anyhow!("token missing"))?;
    assert_eq!(record.status, ClaimTokenStatus::Expired);

    let second = service
        .consume_at(
            consume_request(&issued.signed_token, "user_9"),
            late + Duration::minutes(5),
        )
        .await?;
    assert!(!second.success);
    assert_eq!(second.error_code, Some(ClaimErrorCode::TokenExpired));
    Ok(())
}

#[tokio::test]
async fn revoked_tokens_fail_but_a_fresh_token_still_claims() -> Result<()> {
    let service = service_with(ClaimStore::memory(), Arc::new(MemoryFunnelSink::default()));
    let stale = issue_telegram(&service).await?;

    let revoked = service
        .revoke_telegram_org_claim_tokens_for_chat("123456", Some("relinked"))
        .await?;
    assert_eq!(revoked, 1);

    let denied = service
        .consume_identity_claim_token(consume_request(&stale.signed_token, "user_9"))
        .await?;
    assert_eq!(denied.error_code, Some(ClaimErrorCode::TokenRevoked));

    let fresh = issue_telegram(&service).await?;
    let claimed = service
        .consume_identity_claim_token(consume_request(&fresh.signed_token, "user_9"))
        .await?;
    assert!(claimed.success);
    assert_eq!(claimed.linked_telegram_chat_id.as_deref(), Some("123456"));
    Ok(())
}

#[tokio::test]
async fn funnel_failures_never_fail_the_claim() -> Result<()> {
    let service = service_with(ClaimStore::memory(), Arc::new(FailingFunnelSink));
    seed_session(&service, "sess_abc", "org_1").await?;
    let issued = issue_guest(&service).await?;

    let result = service
        .consume_identity_claim_token(consume_request(&issued.signed_token, "user_9"))
        .await?;

    assert!(result.success);
    let record = service
        .store()
        .claim_token(&issued.token_id)
        .await
        .ok_or_else(|| anyhow!("token missing"))?;
    assert_eq!(record.status, ClaimTokenStatus::Consumed);
    Ok(())
}

#[tokio::test]
async fn inspect_does_not_burn_the_token() -> Result<()> {
    let service = service_with(ClaimStore::memory(), Arc::new(MemoryFunnelSink::default()));
    seed_session(&service, "sess_abc", "org_1").await?;
    let issued = issue_guest(&service).await?;

    let report = service.inspect_identity_claim_token(&issued.signed_token).await;
    assert!(report.valid);
    assert_eq!(report.token_type, Some(ClaimTokenType::GuestSessionClaim));
    assert_eq!(report.channel, Some(Channel::Webchat));

    let expired = service
        .inspect_at(&issued.signed_token, Utc::now() + Duration::days(2))
        .await;
    assert_eq!(expired.error_code, Some(ClaimErrorCode::TokenExpired));

    let result = service
        .consume_identity_claim_token(consume_request(&issued.signed_token, "user_9"))
        .await?;
    assert!(result.success);

    let garbage = service.inspect_identity_claim_token("not-a-token").await;
    assert!(!garbage.valid);
    assert_eq!(garbage.error_code, Some(ClaimErrorCode::InvalidSignature));
    Ok(())
}

#[tokio::test]
async fn ledger_sync_and_issuance_share_one_identity() -> Result<()> {
    let service = service_with(ClaimStore::memory(), Arc::new(MemoryFunnelSink::default()));
    seed_session(&service, "sess_abc", "org_1").await?;

    let sync = GuestLedgerSync {
        session_token: "sess_abc".to_string(),
        organization_id: "org_1".to_string(),
        agent_id: Some("agent_1".to_string()),
        channel: Channel::Webchat,
        visitor_info: Some(VisitorInfo {
            name: Some("Ada".to_string()),
            ..VisitorInfo::default()
        }),
    };
    let first = service.sync_guest_session_ledger(sync.clone()).await?;
    let second = service.sync_guest_session_ledger(sync).await?;
    assert_eq!(first, second);

    let issued = issue_guest(&service).await?;
    assert_eq!(issued.ledger_entry_id, first);
    let tokens = service.store().tokens_for_ledger_entry(&first).await;
    assert_eq!(tokens.len(), 1);

    service
        .consume_identity_claim_token(consume_request(&issued.signed_token, "user_9"))
        .await?;
    let entry = service
        .store()
        .ledger_entry(&IdentityKey::guest_session(Channel::Webchat, "sess_abc"))
        .await
        .ok_or_else(|| anyhow!("ledger entry missing"))?;
    assert_eq!(entry.claim_status, LedgerClaimStatus::Claimed);
    assert_eq!(entry.claim_source, Some(ClaimSource::OauthSignup));
    assert_eq!(
        entry.visitor_info.and_then(|info| info.name).as_deref(),
        Some("Ada")
    );
    Ok(())
}

#[tokio::test]
async fn telegram_ledger_sync_rejects_blank_chat_ids() -> Result<()> {
    let service = service_with(ClaimStore::memory(), Arc::new(MemoryFunnelSink::default()));
    let error = service
        .sync_telegram_identity_ledger(TelegramLedgerSync {
            telegram_chat_id: "   ".to_string(),
            organization_id: "org_2".to_string(),
            agent_id: None,
            visitor_info: None,
        })
        .await;

    assert!(matches!(
        error,
        Err(ClaimServiceError::InvalidRequest {
            field: "telegram_chat_id",
            ..
        })
    ));
    Ok(())
}

#[tokio::test]
async fn claims_survive_a_store_reload() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("identity-claims.json");
    let service = service_with(
        ClaimStore::open(Some(path.clone())),
        Arc::new(MemoryFunnelSink::default()),
    );
    let issued = issue_telegram(&service).await?;
    service
        .consume_identity_claim_token(consume_request(&issued.signed_token, "user_9"))
        .await?;

    let reopened = service_with(
        ClaimStore::open(Some(path)),
        Arc::new(MemoryFunnelSink::default()),
    );
    let replay = reopened
        .consume_identity_claim_token(consume_request(&issued.signed_token, "user_9"))
        .await?;
    assert!(replay.success && replay.already_claimed);

    let hijack = reopened
        .consume_identity_claim_token(consume_request(&issued.signed_token, "user_10"))
        .await?;
    assert_eq!(hijack.error_code, Some(ClaimErrorCode::TokenAlreadyConsumed));
    Ok(())
}
