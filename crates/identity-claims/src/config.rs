use std::env;
use std::path::PathBuf;
use std::sync::Once;

use thiserror::Error;

const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_DEPLOY_ENV: &str = "development";
const DEFAULT_GUEST_SESSION_TTL_SECONDS: u64 = 86_400;
const DEFAULT_TELEGRAM_ORG_TTL_SECONDS: u64 = 604_800;

/// Never valid outside local development; `ensure_production_ready` rejects it.
pub const DEVELOPMENT_SIGNING_SECRET: &str = "oa-identity-claims-dev-only-secret";

const SIGNING_SECRET_ENV: &str = "OA_IDENTITY_CLAIM_SIGNING_SECRET";
const FALLBACK_SIGNING_SECRET_ENVS: [&str; 3] = [
    "OA_AUTH_LOCAL_TEST_LOGIN_SIGNING_KEY",
    "OA_SESSION_SECRET",
    "OA_APP_SECRET",
];

static DEVELOPMENT_SECRET_WARNING: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningSecretSource {
    Dedicated,
    Fallback(&'static str),
    DevelopmentDefault,
}

impl SigningSecretSource {
    /// Env var the secret came from, or `development_default`.
    pub fn label(self) -> &'static str {
        match self {
            Self::Dedicated => SIGNING_SECRET_ENV,
            Self::Fallback(name) => name,
            Self::DevelopmentDefault => "development_default",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_filter: String,
    pub deploy_env: String,
    pub signing_secret: String,
    pub signing_secret_source: SigningSecretSource,
    pub store_path: Option<PathBuf>,
    pub guest_session_ttl_seconds: u64,
    pub telegram_org_ttl_seconds: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name} value '{value}': expected a positive integer")]
    InvalidNumber { name: &'static str, value: String },
    #[error(
        "identity claim signing secret resolved to the development default while OA_DEPLOY_ENV=production; set OA_IDENTITY_CLAIM_SIGNING_SECRET"
    )]
    DevelopmentSecretInProduction,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let log_filter = env_non_empty("OA_IDENTITY_CLAIM_LOG_FILTER")
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let deploy_env = env_non_empty("OA_DEPLOY_ENV")
            .unwrap_or_else(|| DEFAULT_DEPLOY_ENV.to_string())
            .to_lowercase();

        let (signing_secret, signing_secret_source) = resolve_signing_secret(env_non_empty);

        let store_path = env_non_empty("OA_IDENTITY_CLAIM_STORE_PATH").map(PathBuf::from);

        let guest_session_ttl_seconds = parse_positive(
            "OA_IDENTITY_CLAIM_GUEST_TTL_SECONDS",
            DEFAULT_GUEST_SESSION_TTL_SECONDS,
        )?;
        let telegram_org_ttl_seconds = parse_positive(
            "OA_IDENTITY_CLAIM_TELEGRAM_TTL_SECONDS",
            DEFAULT_TELEGRAM_ORG_TTL_SECONDS,
        )?;

        Ok(Self {
            log_filter,
            deploy_env,
            signing_secret,
            signing_secret_source,
            store_path,
            guest_session_ttl_seconds,
            telegram_org_ttl_seconds,
        })
    }

    pub fn is_production(&self) -> bool {
        self.deploy_env == "production"
    }

    pub fn uses_development_secret(&self) -> bool {
        self.signing_secret_source == SigningSecretSource::DevelopmentDefault
    }

    /// Logs the development-secret warning, at most once per process. Call
    /// after the tracing subscriber is installed. Returns whether this call
    /// emitted it.
    pub fn warn_if_development_secret(&self) -> bool {
        if !self.uses_development_secret() {
            return false;
        }

        let mut emitted = false;
        DEVELOPMENT_SECRET_WARNING.call_once(|| {
            tracing::warn!(
                target: "openagents.identity_claims",
                env = SIGNING_SECRET_ENV,
                "identity claim signing secret not configured; using development-only default",
            );
            emitted = true;
        });
        emitted
    }

    /// Deployment gate: production must never sign with the development secret.
    pub fn ensure_production_ready(&self) -> Result<(), ConfigError> {
        if self.is_production() && self.uses_development_secret() {
            return Err(ConfigError::DevelopmentSecretInProduction);
        }
        Ok(())
    }
}

#[cfg(test)]
impl Config {
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            log_filter: "debug".to_string(),
            deploy_env: "test".to_string(),
            signing_secret: "identity-claim-test-secret".to_string(),
            signing_secret_source: SigningSecretSource::Dedicated,
            store_path: None,
            guest_session_ttl_seconds: DEFAULT_GUEST_SESSION_TTL_SECONDS,
            telegram_org_ttl_seconds: DEFAULT_TELEGRAM_ORG_TTL_SECONDS,
        }
    }
}

/// Dedicated variable first, then the shared app secrets, then the
/// development default.
fn resolve_signing_secret<F>(lookup: F) -> (String, SigningSecretSource)
where
    F: Fn(&'static str) -> Option<String>,
{
    if let Some(secret) = lookup(SIGNING_SECRET_ENV) {
        return (secret, SigningSecretSource::Dedicated);
    }

    for name in FALLBACK_SIGNING_SECRET_ENVS {
        if let Some(secret) = lookup(name) {
            return (secret, SigningSecretSource::Fallback(name));
        }
    }

    (
        DEVELOPMENT_SIGNING_SECRET.to_string(),
        SigningSecretSource::DevelopmentDefault,
    )
}

fn env_non_empty(name: &'static str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_positive(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let Some(raw) = env_non_empty(name) else {
        return Ok(default);
    };

    match raw.parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::InvalidNumber { name, value: raw }),
    }
}
