use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::ClaimCodecError;
use crate::store::ClaimStoreError;

/// Expected business outcomes of a claim, returned in-band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimErrorCode {
    InvalidSignature,
    TokenNotFound,
    TokenAlreadyConsumed,
    TokenExpired,
    TokenRevoked,
    OrganizationMismatch,
    MissingSessionToken,
    SessionNotFound,
    SessionOrgMismatch,
    SessionAlreadyClaimed,
    LedgerClaimConflict,
    UnsupportedTokenType,
}

impl ClaimErrorCode {
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidSignature => "invalid_signature",
            Self::TokenNotFound => "token_not_found",
            Self::TokenAlreadyConsumed => "token_already_consumed",
            Self::TokenExpired => "token_expired",
            Self::TokenRevoked => "token_revoked",
            Self::OrganizationMismatch => "organization_mismatch",
            Self::MissingSessionToken => "missing_session_token",
            Self::SessionNotFound => "session_not_found",
            Self::SessionOrgMismatch => "session_org_mismatch",
            Self::SessionAlreadyClaimed => "session_already_claimed",
            Self::LedgerClaimConflict => "ledger_claim_conflict",
            Self::UnsupportedTokenType => "unsupported_token_type",
        }
    }
}

impl fmt::Display for ClaimErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Failures that are not business outcomes: bad requests, store trouble,
/// signer trouble. Any of these aborts the surrounding transaction.
#[derive(Debug, thiserror::Error)]
pub enum ClaimServiceError {
    #[error("{field}: {message}")]
    InvalidRequest {
        field: &'static str,
        message: String,
    },
    #[error(transparent)]
    Store(#[from] ClaimStoreError),
    #[error(transparent)]
    Codec(#[from] ClaimCodecError),
}

impl ClaimServiceError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Store(_) => "store_unavailable",
            Self::Codec(_) => "signer_unavailable",
        }
    }
}

pub(crate) fn required(value: &str, field: &'static str) -> Result<String, ClaimServiceError> {
    let normalized = value.trim().to_string();
    if normalized.is_empty() {
        return Err(ClaimServiceError::InvalidRequest {
            field,
            message: "value is required".to_string(),
        });
    }
    Ok(normalized)
}
