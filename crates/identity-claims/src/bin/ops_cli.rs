#![allow(clippy::print_stdout, clippy::print_stderr, clippy::exit)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use identity_claims::config::Config;
use identity_claims::issuer::TelegramOrgClaimRequest;
use identity_claims::service::IdentityClaimService;
use serde::Serialize;
use serde_json::json;

#[derive(Parser)]
#[command(name = "identity-claims-ops")]
#[command(about = "Operator commands for identity claim tokens")]
struct Cli {
    /// Overrides OA_IDENTITY_CLAIM_STORE_PATH.
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(name = "config:check")]
    ConfigCheck,
    #[command(name = "telegram:issue")]
    TelegramIssue(TelegramIssueArgs),
    #[command(name = "token:inspect")]
    TokenInspect(TokenInspectArgs),
    #[command(name = "telegram:revoke")]
    TelegramRevoke(TelegramRevokeArgs),
}

#[derive(Args)]
struct TelegramIssueArgs {
    chat_id: String,
    organization_id: String,
    #[arg(long)]
    issued_by: Option<String>,
}

#[derive(Args)]
struct TokenInspectArgs {
    token: String,
}

#[derive(Args)]
struct TelegramRevokeArgs {
    chat_id: String,
    #[arg(long)]
    reason: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env().context("failed to load identity claim config")?;
    if let Some(store) = cli.store {
        config.store_path = Some(store);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    config.warn_if_development_secret();

    config.ensure_production_ready()?;

    match cli.command {
        Commands::ConfigCheck => run_config_check(&config),
        Commands::TelegramIssue(args) => run_telegram_issue(&config, args).await,
        Commands::TokenInspect(args) => run_token_inspect(&config, args).await,
        Commands::TelegramRevoke(args) => run_telegram_revoke(&config, args).await,
    }
}

fn run_config_check(config: &Config) -> Result<()> {
    print_json(&json!({
        "deploy_env": config.deploy_env,
        "signing_secret_source": config.signing_secret_source.label(),
        "store_path": config.store_path.as_ref().map(|path| path.display().to_string()),
        "guest_session_ttl_seconds": config.guest_session_ttl_seconds,
        "telegram_org_ttl_seconds": config.telegram_org_ttl_seconds,
        "production_ready": !config.uses_development_secret(),
    }))
}

async fn run_telegram_issue(config: &Config, args: TelegramIssueArgs) -> Result<()> {
    let service = IdentityClaimService::from_config(config);
    let issued = service
        .issue_telegram_org_claim_token(TelegramOrgClaimRequest {
            telegram_chat_id: args.chat_id,
            organization_id: args.organization_id,
            issued_by: args.issued_by,
        })
        .await
        .context("failed to issue telegram org claim token")?;
    print_json(&issued)
}

async fn run_token_inspect(config: &Config, args: TokenInspectArgs) -> Result<()> {
    let service = IdentityClaimService::from_config(config);
    let report = service.inspect_identity_claim_token(&args.token).await;
    print_json(&report)
}

async fn run_telegram_revoke(config: &Config, args: TelegramRevokeArgs) -> Result<()> {
    let service = IdentityClaimService::from_config(config);
    let revoked = service
        .revoke_telegram_org_claim_tokens_for_chat(&args.chat_id, args.reason.as_deref())
        .await
        .context("failed to revoke telegram org claim tokens")?;
    print_json(&json!({
        "telegram_chat_id": args.chat_id,
        "revoked": revoked,
    }))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}
