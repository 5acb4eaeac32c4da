#![forbid(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::panic))]

//! Signed claim tokens that link an anonymous guest session or Telegram chat
//! to an authenticated user and organization.

pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod issuer;
pub mod ledger;
pub mod observability;
pub mod service;
pub mod store;
pub mod types;

pub use codec::{ClaimTokenCodec, ClaimTokenPayload};
pub use config::Config;
pub use consumer::{ClaimResult, ConsumeRequest, InspectResult};
pub use error::{ClaimErrorCode, ClaimServiceError};
pub use issuer::{GuestIssueOutcome, GuestSessionClaimRequest, IssuedClaimToken, TelegramOrgClaimRequest};
pub use observability::{FunnelEvent, FunnelEventSink, MemoryFunnelSink, NoopFunnelSink};
pub use service::{GuestLedgerSync, IdentityClaimService, TelegramLedgerSync};
pub use store::ClaimStore;
pub use types::{Channel, ClaimSource, ClaimTokenKind, ClaimTokenStatus, ClaimTokenType};

#[cfg(test)]
mod tests;
