use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Config;
use crate::observability::{AuditEvent, AuditOutcome, ClaimAuditRecord};
use crate::types::{
    ClaimTokenRecord, GuestSessionRecord, IdentityKey, IdentityLedgerEntry,
    OrganizationMembershipRecord, RoleRecord, TelegramChatMappingRecord, UserRecord,
};

const LOG_TARGET: &str = "openagents.identity_claims";

/// Record store backing claim tokens, the identity ledger and the
/// collaborator rows a claim mutates. Every write goes through
/// [`ClaimStore::transaction`].
#[derive(Clone)]
pub struct ClaimStore {
    state: Arc<RwLock<ClaimStoreState>>,
    path: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClaimStoreError {
    #[error("{field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("{message}")]
    Persistence { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClaimStoreState {
    claim_tokens: HashMap<String, ClaimTokenRecord>,
    identity_ledger: HashMap<IdentityKey, IdentityLedgerEntry>,
    guest_sessions: HashMap<String, GuestSessionRecord>,
    users: HashMap<String, UserRecord>,
    roles: HashMap<String, RoleRecord>,
    organization_memberships: HashMap<String, OrganizationMembershipRecord>,
    telegram_chat_mappings: HashMap<String, TelegramChatMappingRecord>,
    audit_log: Vec<ClaimAuditRecord>,
    next_audit_id: u64,
}

impl ClaimStoreState {
    fn normalize_counters(&mut self) {
        if self.next_audit_id == 0 {
            self.next_audit_id = self.audit_log.iter().map(|row| row.id).max().unwrap_or(0) + 1;
        }
    }

    pub fn claim_token(&self, token_id: &str) -> Option<&ClaimTokenRecord> {
        self.claim_tokens.get(token_id)
    }

    pub fn claim_token_mut(&mut self, token_id: &str) -> Option<&mut ClaimTokenRecord> {
        self.claim_tokens.get_mut(token_id)
    }

    pub fn claim_tokens_mut(&mut self) -> impl Iterator<Item = &mut ClaimTokenRecord> {
        self.claim_tokens.values_mut()
    }

    pub fn insert_claim_token(&mut self, record: ClaimTokenRecord) {
        self.claim_tokens.insert(record.token_id.clone(), record);
    }

    pub fn tokens_for_ledger_entry(&self, ledger_entry_id: &str) -> Vec<ClaimTokenRecord> {
        let mut rows: Vec<ClaimTokenRecord> = self
            .claim_tokens
            .values()
            .filter(|row| row.ledger_entry_id == ledger_entry_id)
            .cloned()
            .collect();
        rows.sort_by(|left, right| left.issued_at.cmp(&right.issued_at));
        rows
    }

    pub fn ledger_entry(&self, identity_key: &IdentityKey) -> Option<&IdentityLedgerEntry> {
        self.identity_ledger.get(identity_key)
    }

    pub fn ledger_entry_mut(
        &mut self,
        identity_key: &IdentityKey,
    ) -> Option<&mut IdentityLedgerEntry> {
        self.identity_ledger.get_mut(identity_key)
    }

    pub fn ledger_entry_by_id(&self, id: &str) -> Option<&IdentityLedgerEntry> {
        self.identity_ledger.values().find(|row| row.id == id)
    }

    pub fn insert_ledger_entry(&mut self, entry: IdentityLedgerEntry) {
        self.identity_ledger
            .insert(entry.identity_key.clone(), entry);
    }

    pub fn guest_session(&self, session_token: &str) -> Option<&GuestSessionRecord> {
        self.guest_sessions.get(session_token)
    }

    pub fn insert_guest_session(&mut self, session: GuestSessionRecord) {
        self.guest_sessions
            .insert(session.session_token.clone(), session);
    }

    pub fn guest_session_mut(&mut self, session_token: &str) -> Option<&mut GuestSessionRecord> {
        self.guest_sessions.get_mut(session_token)
    }

    pub fn user(&self, user_id: &str) -> Option<&UserRecord> {
        self.users.get(user_id)
    }

    /// Returns the user row, creating a bare one for users this store has not
    /// seen yet.
    pub fn user_or_insert(&mut self, user_id: &str, now: DateTime<Utc>) -> &mut UserRecord {
        self.users
            .entry(user_id.to_string())
            .or_insert_with(|| UserRecord {
                id: user_id.to_string(),
                default_organization_id: None,
                created_at: now,
                updated_at: now,
            })
    }

    pub fn role(&self, name: &str) -> Option<&RoleRecord> {
        self.roles.get(name)
    }

    /// Keyed upsert: the role name is the unique key, so repeated or
    /// concurrent first use always lands on a single row.
    pub fn ensure_role(&mut self, name: &str, description: &str, now: DateTime<Utc>) -> RoleRecord {
        self.roles
            .entry(name.to_string())
            .or_insert_with(|| RoleRecord {
                name: name.to_string(),
                description: description.to_string(),
                created_at: now,
            })
            .clone()
    }

    pub fn membership(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Option<&OrganizationMembershipRecord> {
        self.organization_memberships
            .get(&membership_key(user_id, organization_id))
    }

    /// Inserts an active membership or reactivates the existing one. An
    /// existing row keeps its role.
    pub fn upsert_active_membership(
        &mut self,
        user_id: &str,
        organization_id: &str,
        role: &str,
        now: DateTime<Utc>,
    ) -> OrganizationMembershipRecord {
        let row = self
            .organization_memberships
            .entry(membership_key(user_id, organization_id))
            .or_insert_with(|| OrganizationMembershipRecord {
                id: format!("mem_{}", Uuid::new_v4().simple()),
                user_id: user_id.to_string(),
                organization_id: organization_id.to_string(),
                role: role.to_string(),
                is_active: true,
                created_at: now,
                updated_at: now,
            });

        if !row.is_active {
            row.is_active = true;
            row.updated_at = now;
        }

        row.clone()
    }

    pub fn telegram_chat_mapping(
        &self,
        telegram_chat_id: &str,
    ) -> Option<&TelegramChatMappingRecord> {
        self.telegram_chat_mappings.get(telegram_chat_id)
    }

    pub fn insert_telegram_chat_mapping(&mut self, mapping: TelegramChatMappingRecord) {
        self.telegram_chat_mappings
            .insert(mapping.telegram_chat_id.clone(), mapping);
    }

    pub fn telegram_chat_mapping_mut(
        &mut self,
        telegram_chat_id: &str,
    ) -> Option<&mut TelegramChatMappingRecord> {
        self.telegram_chat_mappings.get_mut(telegram_chat_id)
    }

    pub fn append_audit(&mut self, event: AuditEvent, now: DateTime<Utc>) -> u64 {
        let id = self.next_audit_id;
        self.next_audit_id = self.next_audit_id.saturating_add(1);

        match event.outcome {
            AuditOutcome::Success => tracing::info!(
                target: LOG_TARGET,
                action = event.action,
                token_id = event.token_id.as_deref().unwrap_or_default(),
                user_id = event.user_id.as_deref().unwrap_or_default(),
                organization_id = event.organization_id.as_deref().unwrap_or_default(),
                "identity claim audit",
            ),
            AuditOutcome::Denied => tracing::warn!(
                target: LOG_TARGET,
                action = event.action,
                token_id = event.token_id.as_deref().unwrap_or_default(),
                user_id = event.user_id.as_deref().unwrap_or_default(),
                organization_id = event.organization_id.as_deref().unwrap_or_default(),
                error_code = event.error_code.map(|code| code.code()).unwrap_or_default(),
                "identity claim denied",
            ),
        }

        self.audit_log.push(ClaimAuditRecord {
            id,
            action: event.action.to_string(),
            outcome: event.outcome,
            token_id: event.token_id,
            user_id: event.user_id,
            organization_id: event.organization_id,
            error_code: event.error_code,
            attributes: event.attributes,
            created_at: now,
        });

        id
    }

    pub fn audit_entries(&self) -> &[ClaimAuditRecord] {
        &self.audit_log
    }
}

impl ClaimStore {
    pub fn from_config(config: &Config) -> Self {
        Self::open(config.store_path.clone())
    }

    pub fn memory() -> Self {
        Self::open(None)
    }

    pub fn open(path: Option<PathBuf>) -> Self {
        let mut state = Self::load_state(path.as_ref());
        state.normalize_counters();

        Self {
            state: Arc::new(RwLock::new(state)),
            path,
        }
    }

    /// Runs `operation` against a working copy under the write lock. `Ok`
    /// persists and publishes the copy; `Err` discards every change, so no
    /// partial state is ever visible. Transactions are fully serialized.
    pub async fn transaction<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce(&mut ClaimStoreState) -> Result<T, E>,
        E: From<ClaimStoreError>,
    {
        let mut state = self.state.write().await;
        let mut working = state.clone();
        let result = operation(&mut working)?;
        self.persist_state(&working).await?;
        *state = working;
        Ok(result)
    }

    pub async fn read<T, F>(&self, operation: F) -> T
    where
        F: FnOnce(&ClaimStoreState) -> T,
    {
        let state = self.state.read().await;
        operation(&state)
    }

    pub async fn put_guest_session(
        &self,
        session: GuestSessionRecord,
    ) -> Result<(), ClaimStoreError> {
        normalize_non_empty(&session.session_token, "session_token")?;
        normalize_non_empty(&session.organization_id, "organization_id")?;
        self.transaction(|state| {
            state.insert_guest_session(session);
            Ok(())
        })
        .await
    }

    pub async fn guest_session(&self, session_token: &str) -> Option<GuestSessionRecord> {
        self.read(|state| state.guest_session(session_token).cloned())
            .await
    }

    pub async fn put_user(&self, user: UserRecord) -> Result<(), ClaimStoreError> {
        normalize_non_empty(&user.id, "user_id")?;
        self.transaction(|state| {
            state.users.insert(user.id.clone(), user);
            Ok(())
        })
        .await
    }

    pub async fn user(&self, user_id: &str) -> Option<UserRecord> {
        self.read(|state| state.user(user_id).cloned()).await
    }

    pub async fn put_telegram_chat_mapping(
        &self,
        mapping: TelegramChatMappingRecord,
    ) -> Result<(), ClaimStoreError> {
        normalize_non_empty(&mapping.telegram_chat_id, "telegram_chat_id")?;
        self.transaction(|state| {
            state.insert_telegram_chat_mapping(mapping);
            Ok(())
        })
        .await
    }

    pub async fn telegram_chat_mapping(
        &self,
        telegram_chat_id: &str,
    ) -> Option<TelegramChatMappingRecord> {
        self.read(|state| state.telegram_chat_mapping(telegram_chat_id).cloned())
            .await
    }

    pub async fn membership(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Option<OrganizationMembershipRecord> {
        self.read(|state| state.membership(user_id, organization_id).cloned())
            .await
    }

    pub async fn role(&self, name: &str) -> Option<RoleRecord> {
        self.read(|state| state.role(name).cloned()).await
    }

    pub async fn claim_token(&self, token_id: &str) -> Option<ClaimTokenRecord> {
        self.read(|state| state.claim_token(token_id).cloned()).await
    }

    pub async fn ledger_entry(&self, identity_key: &IdentityKey) -> Option<IdentityLedgerEntry> {
        self.read(|state| state.ledger_entry(identity_key).cloned())
            .await
    }

    pub async fn tokens_for_ledger_entry(&self, ledger_entry_id: &str) -> Vec<ClaimTokenRecord> {
        self.read(|state| state.tokens_for_ledger_entry(ledger_entry_id))
            .await
    }

    pub async fn audit_entries(&self) -> Vec<ClaimAuditRecord> {
        self.read(|state| state.audit_entries().to_vec()).await
    }

    fn load_state(path: Option<&PathBuf>) -> ClaimStoreState {
        let Some(path) = path else {
            return ClaimStoreState::default();
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(value) => value,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return ClaimStoreState::default();
            }
            Err(error) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    path = %path.display(),
                    error = %error,
                    "failed to read claim store; booting with empty state",
                );
                return ClaimStoreState::default();
            }
        };

        match serde_json::from_str::<ClaimStoreState>(&raw) {
            Ok(state) => state,
            Err(error) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    path = %path.display(),
                    error = %error,
                    "failed to parse claim store; booting with empty state",
                );
                ClaimStoreState::default()
            }
        }
    }

    async fn persist_state(&self, snapshot: &ClaimStoreState) -> Result<(), ClaimStoreError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| ClaimStoreError::Persistence {
                    message: format!("failed to prepare claim store directory: {error}"),
                })?;
        }

        let payload =
            serde_json::to_vec(snapshot).map_err(|error| ClaimStoreError::Persistence {
                message: format!("failed to encode claim store payload: {error}"),
            })?;

        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, payload)
            .await
            .map_err(|error| ClaimStoreError::Persistence {
                message: format!("failed to write claim store payload: {error}"),
            })?;

        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|error| ClaimStoreError::Persistence {
                message: format!("failed to finalize claim store payload: {error}"),
            })?;

        Ok(())
    }
}

fn membership_key(user_id: &str, organization_id: &str) -> String {
    format!("{user_id}::{organization_id}")
}

pub(crate) fn normalize_non_empty(
    value: &str,
    field: &'static str,
) -> Result<String, ClaimStoreError> {
    let normalized = value.trim().to_string();
    if normalized.is_empty() {
        return Err(ClaimStoreError::Validation {
            field,
            message: "value is required".to_string(),
        });
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Channel;

    fn session(token: &str, organization_id: &str) -> GuestSessionRecord {
        let now = Utc::now();
        GuestSessionRecord {
            session_token: token.to_string(),
            organization_id: organization_id.to_string(),
            agent_id: Some("agent_1".to_string()),
            channel: Channel::Webchat,
            claimed_by_user_id: None,
            claimed_organization_id: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn failed_transaction_discards_every_change() {
        let store = ClaimStore::memory();
        store
            .put_guest_session(session("sess_abc", "org_1"))
            .await
            .expect("seed session");

        let result: Result<(), ClaimStoreError> = store
            .transaction(|state| {
                if let Some(row) = state.guest_session_mut("sess_abc") {
                    row.claimed_by_user_id = Some("user_9".to_string());
                }
                state.ensure_role("org_owner", "Organization owner", Utc::now());
                Err(ClaimStoreError::Persistence {
                    message: "simulated abort".to_string(),
                })
            })
            .await;

        assert!(result.is_err());
        let stored = store
            .guest_session("sess_abc")
            .await
            .expect("session still present");
        assert_eq!(stored.claimed_by_user_id, None);
        assert_eq!(store.role("org_owner").await, None);
    }

    #[tokio::test]
    async fn ensure_role_is_a_keyed_upsert() {
        let store = ClaimStore::memory();
        let first = store
            .transaction::<_, ClaimStoreError, _>(|state| {
                Ok(state.ensure_role("org_owner", "Organization owner", Utc::now()))
            })
            .await
            .expect("first ensure");
        let second = store
            .transaction::<_, ClaimStoreError, _>(|state| {
                Ok(state.ensure_role("org_owner", "changed", Utc::now()))
            })
            .await
            .expect("second ensure");

        assert_eq!(first, second);
        assert_eq!(second.description, "Organization owner");
    }

    #[tokio::test]
    async fn membership_upsert_reactivates_inactive_rows() {
        let store = ClaimStore::memory();
        store
            .transaction::<_, ClaimStoreError, _>(|state| {
                let row = state.upsert_active_membership("user_1", "org_1", "member", Utc::now());
                let key = membership_key(&row.user_id, &row.organization_id);
                if let Some(existing) = state.organization_memberships.get_mut(&key) {
                    existing.is_active = false;
                }
                Ok(())
            })
            .await
            .expect("seed membership");

        let reactivated = store
            .transaction::<_, ClaimStoreError, _>(|state| {
                Ok(state.upsert_active_membership("user_1", "org_1", "org_owner", Utc::now()))
            })
            .await
            .expect("upsert membership");

        assert!(reactivated.is_active);
        assert_eq!(reactivated.role, "member");
    }

    #[tokio::test]
    async fn committed_state_persists_and_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("claims").join("store.json");

        let store = ClaimStore::open(Some(path.clone()));
        store
            .put_guest_session(session("sess_abc", "org_1"))
            .await
            .expect("seed session");
        store
            .transaction::<_, ClaimStoreError, _>(|state| {
                state.append_audit(
                    AuditEvent::new("identity_claim.test", AuditOutcome::Success),
                    Utc::now(),
                );
                Ok(())
            })
            .await
            .expect("append audit");

        let reloaded = ClaimStore::open(Some(path));
        assert!(reloaded.guest_session("sess_abc").await.is_some());
        let audits = reloaded.audit_entries().await;
        assert_eq!(audits.len(), 1);

        let next_id = reloaded
            .transaction::<_, ClaimStoreError, _>(|state| {
                Ok(state.append_audit(
                    AuditEvent::new("identity_claim.test", AuditOutcome::Success),
                    Utc::now(),
                ))
            })
            .await
            .expect("append after reload");
        assert_eq!(next_id, audits[0].id + 1);
    }

    #[tokio::test]
    async fn corrupt_store_file_boots_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"{not json").expect("write corrupt file");

        let store = ClaimStore::open(Some(path));
        assert!(store.audit_entries().await.is_empty());
    }

    #[tokio::test]
    async fn blank_session_tokens_are_rejected() {
        let store = ClaimStore::memory();
        let result = store.put_guest_session(session("  ", "org_1")).await;
        assert!(matches!(
            result,
            Err(ClaimStoreError::Validation {
                field: "session_token",
                ..
            })
        ));
    }
}
