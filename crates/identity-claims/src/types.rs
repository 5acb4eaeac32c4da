use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Anonymous interaction surface a visitor used before authenticating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Webchat,
    NativeGuest,
    Telegram,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Webchat => "webchat",
            Self::NativeGuest => "native_guest",
            Self::Telegram => "telegram",
        }
    }

    pub fn is_guest_session(self) -> bool {
        matches!(self, Self::Webchat | Self::NativeGuest)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimTokenType {
    GuestSessionClaim,
    TelegramOrgClaim,
}

impl ClaimTokenType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GuestSessionClaim => "guest_session_claim",
            Self::TelegramOrgClaim => "telegram_org_claim",
        }
    }
}

/// What a claim token links. Each variant carries exactly the identifier its
/// token type needs, so a token can never name both a session and a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "token_type", rename_all = "snake_case")]
pub enum ClaimTokenKind {
    GuestSessionClaim { session_token: String },
    TelegramOrgClaim { telegram_chat_id: String },
}

impl ClaimTokenKind {
    pub fn token_type(&self) -> ClaimTokenType {
        match self {
            Self::GuestSessionClaim { .. } => ClaimTokenType::GuestSessionClaim,
            Self::TelegramOrgClaim { .. } => ClaimTokenType::TelegramOrgClaim,
        }
    }

    pub fn session_token(&self) -> Option<&str> {
        match self {
            Self::GuestSessionClaim { session_token } => Some(session_token),
            Self::TelegramOrgClaim { .. } => None,
        }
    }

    pub fn telegram_chat_id(&self) -> Option<&str> {
        match self {
            Self::GuestSessionClaim { .. } => None,
            Self::TelegramOrgClaim { telegram_chat_id } => Some(telegram_chat_id),
        }
    }

    pub fn subject(&self) -> IdentitySubject {
        match self {
            Self::GuestSessionClaim { session_token } => IdentitySubject::GuestSession {
                session_token: session_token.clone(),
            },
            Self::TelegramOrgClaim { telegram_chat_id } => IdentitySubject::TelegramChat {
                telegram_chat_id: telegram_chat_id.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimTokenStatus {
    Issued,
    Consumed,
    Expired,
    Revoked,
}

impl ClaimTokenStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Issued => "issued",
            Self::Consumed => "consumed",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Issued)
    }
}

/// Which authentication flow triggered a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimSource {
    OauthSignup,
    EmailSignup,
    MagicLink,
    Login,
    TelegramBot,
}

impl ClaimSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OauthSignup => "oauth_signup",
            Self::EmailSignup => "email_signup",
            Self::MagicLink => "magic_link",
            Self::Login => "login",
            Self::TelegramBot => "telegram_bot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerClaimStatus {
    Unclaimed,
    Claimed,
}

/// The anonymous identity a ledger row describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "subject_type", rename_all = "snake_case")]
pub enum IdentitySubject {
    GuestSession { session_token: String },
    TelegramChat { telegram_chat_id: String },
}

/// Canonical identity key: `{channel}:{session_token}` for guest sessions and
/// `telegram:{chat_id}` for Telegram chats.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn guest_session(channel: Channel, session_token: &str) -> Self {
        Self(format!("{}:{session_token}", channel.as_str()))
    }

    pub fn telegram(telegram_chat_id: &str) -> Self {
        Self(format!("telegram:{telegram_chat_id}"))
    }

    pub fn for_subject(channel: Channel, subject: &IdentitySubject) -> Self {
        match subject {
            IdentitySubject::GuestSession { session_token } => {
                Self::guest_session(channel, session_token)
            }
            IdentitySubject::TelegramChat { telegram_chat_id } => Self::telegram(telegram_chat_id),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisitorInfo {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub locale: Option<String>,
    pub telegram_username: Option<String>,
}

impl VisitorInfo {
    /// Incoming values win; prior values survive where incoming is absent.
    pub fn merged_with(&self, incoming: &VisitorInfo) -> VisitorInfo {
        VisitorInfo {
            name: incoming.name.clone().or_else(|| self.name.clone()),
            email: incoming.email.clone().or_else(|| self.email.clone()),
            phone: incoming.phone.clone().or_else(|| self.phone.clone()),
            locale: incoming.locale.clone().or_else(|| self.locale.clone()),
            telegram_username: incoming
                .telegram_username
                .clone()
                .or_else(|| self.telegram_username.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimTokenRecord {
    pub token_id: String,
    #[serde(flatten)]
    pub kind: ClaimTokenKind,
    pub channel: Channel,
    pub status: ClaimTokenStatus,
    pub organization_id: String,
    pub ledger_entry_id: String,
    pub signed_token: String,
    pub issued_by: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub consumed_by_user_id: Option<String>,
    pub consumed_by_organization_id: Option<String>,
    pub expired_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoke_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityLedgerEntry {
    pub id: String,
    pub identity_key: IdentityKey,
    pub channel: Channel,
    pub organization_id: String,
    pub agent_id: Option<String>,
    pub subject: IdentitySubject,
    pub visitor_info: Option<VisitorInfo>,
    pub claim_status: LedgerClaimStatus,
    pub claimed_by_user_id: Option<String>,
    pub claimed_organization_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claim_source: Option<ClaimSource>,
    pub last_claim_token_id: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Guest chat session owned by the surrounding platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestSessionRecord {
    pub session_token: String,
    pub organization_id: String,
    pub agent_id: Option<String>,
    pub channel: Channel,
    pub claimed_by_user_id: Option<String>,
    pub claimed_organization_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub default_organization_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRecord {
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationMembershipRecord {
    pub id: String,
    pub user_id: String,
    pub organization_id: String,
    pub role: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelegramChatMappingRecord {
    pub telegram_chat_id: String,
    pub organization_id: Option<String>,
    pub user_id: Option<String>,
    pub linked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
