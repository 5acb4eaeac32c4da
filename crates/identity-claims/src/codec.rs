use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::Config;
use crate::types::{Channel, ClaimTokenKind, ClaimTokenType};

type HmacSha256 = Hmac<Sha256>;

pub const CLAIM_TOKEN_VERSION: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ClaimCodecError {
    #[error("failed to encode claim token payload: {message}")]
    Encoding { message: String },
    #[error("failed to initialize claim token signer: {message}")]
    Signer { message: String },
}

/// Verified contents of a claim token. `issued_at` and `expires_at` are unix
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimTokenPayload {
    pub token_id: String,
    pub kind: ClaimTokenKind,
    pub channel: Channel,
    pub organization_id: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePayload {
    v: u8,
    token_id: String,
    token_type: ClaimTokenType,
    channel: Channel,
    organization_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    telegram_chat_id: Option<String>,
    iat: i64,
    exp: i64,
}

impl From<&ClaimTokenPayload> for WirePayload {
    fn from(payload: &ClaimTokenPayload) -> Self {
        Self {
            v: CLAIM_TOKEN_VERSION,
            token_id: payload.token_id.clone(),
            token_type: payload.kind.token_type(),
            channel: payload.channel,
            organization_id: payload.organization_id.clone(),
            session_token: payload.kind.session_token().map(ToString::to_string),
            telegram_chat_id: payload.kind.telegram_chat_id().map(ToString::to_string),
            iat: payload.issued_at,
            exp: payload.expires_at,
        }
    }
}

impl WirePayload {
    fn into_payload(self) -> Option<ClaimTokenPayload> {
        if self.v != CLAIM_TOKEN_VERSION
            || self.token_id.trim().is_empty()
            || self.organization_id.trim().is_empty()
        {
            return None;
        }

        let kind = match (self.token_type, self.session_token, self.telegram_chat_id) {
            (ClaimTokenType::GuestSessionClaim, Some(session_token), None)
                if !session_token.trim().is_empty() =>
            {
                ClaimTokenKind::GuestSessionClaim { session_token }
            }
            (ClaimTokenType::TelegramOrgClaim, None, Some(telegram_chat_id))
                if !telegram_chat_id.trim().is_empty() =>
            {
                ClaimTokenKind::TelegramOrgClaim { telegram_chat_id }
            }
            _ => return None,
        };

        Some(ClaimTokenPayload {
            token_id: self.token_id,
            kind,
            channel: self.channel,
            organization_id: self.organization_id,
            issued_at: self.iat,
            expires_at: self.exp,
        })
    }
}

/// HMAC-SHA256 codec for the `base64url(json).base64url(sig)` wire format.
#[derive(Clone)]
pub struct ClaimTokenCodec {
    secret: Vec<u8>,
}

impl fmt::Debug for ClaimTokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimTokenCodec")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl ClaimTokenCodec {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.signing_secret.as_bytes())
    }

    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, ClaimCodecError> {
        let mut mac = self.mac()?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    pub fn encode(&self, payload: &ClaimTokenPayload) -> Result<String, ClaimCodecError> {
        let payload_bytes = serde_json::to_vec(&WirePayload::from(payload)).map_err(|error| {
            ClaimCodecError::Encoding {
                message: error.to_string(),
            }
        })?;
        let payload_segment = URL_SAFE_NO_PAD.encode(payload_bytes);
        let signature_segment = URL_SAFE_NO_PAD.encode(self.sign(payload_segment.as_bytes())?);

        Ok(format!("{payload_segment}.{signature_segment}"))
    }

    /// Returns `None` for every failure mode so callers cannot tell a bad
    /// signature from a malformed payload.
    pub fn decode_and_verify(&self, token: &str) -> Option<ClaimTokenPayload> {
        let (payload_segment, signature_segment) = token.trim().rsplit_once('.')?;
        if payload_segment.is_empty() || signature_segment.is_empty() {
            return None;
        }

        let signature = URL_SAFE_NO_PAD.decode(signature_segment).ok()?;
        let mut mac = self.mac().ok()?;
        mac.update(payload_segment.as_bytes());
        // verify_slice compares in constant time.
        mac.verify_slice(&signature).ok()?;

        let payload_bytes = URL_SAFE_NO_PAD.decode(payload_segment).ok()?;
        let wire: WirePayload = serde_json::from_slice(&payload_bytes).ok()?;
        wire.into_payload()
    }

    fn mac(&self) -> Result<HmacSha256, ClaimCodecError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|error| ClaimCodecError::Signer {
            message: error.to_string(),
        })
    }
}
