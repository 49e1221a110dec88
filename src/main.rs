//! o365creds - Microsoft 365 credential helper
//!
//! Acquires and caches delegated OAuth tokens and Forms session cookies.

#![deny(clippy::all)]

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use o365creds::auth::claims::format_duration;
use o365creds::auth::oauth::TokenResult;
use o365creds::auth::TokenAuthority;
use o365creds::cache::CredentialCache;
use o365creds::client_ids::{
    read_candidates, Candidate, CheckResult, ResultLog, FIRST_PARTY_APPLICATION,
};
use o365creds::config::Config;
use o365creds::error::AppError;
use o365creds::forms::{CookieSessionHarvester, FormsClient};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Interactive timeout used when checking candidate client IDs.
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "o365creds")]
#[command(
    about = "Acquire and cache delegated Microsoft 365 credentials",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print an access token for the configured principal
    Token,

    /// Show who the current token belongs to and when it expires
    Claims,

    /// Harvest (or reuse) the Forms session cookies
    FormsSession,

    /// GET a Forms API entity and print the JSON response
    FormsGet {
        /// Entity path relative to the Forms API base, e.g. `forms('id')`
        entity: String,
    },

    /// Capture the bearer token issued to the Office web app
    Bearer,

    /// Remove every cached credential
    ClearCache,

    /// Find client IDs that can sign the configured user in
    CheckClientIds {
        /// Enterprise applications CSV export, or one client ID or launcher URL per line
        file: PathBuf,

        /// Results CSV; an existing file is resumed [default: client_ids_<email>.csv]
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load .env file (if present) before anything else
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config.logging.level);
    info!("Starting o365creds v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&config, cli.command).await {
        error!("{:#}", e);
        match e.downcast_ref::<AppError>() {
            Some(app) => {
                eprintln!("{}", app.user_message());
                if app.requires_interactive() {
                    eprintln!("Run `o365creds clear-cache` to force a fresh sign-in.");
                }
            }
            None => eprintln!("{:#}", e),
        }
        std::process::exit(1);
    }
}

/// Initialize tracing/logging. `RUST_LOG` has already been folded into `level`.
fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(config: &Config, command: Commands) -> Result<()> {
    let cache = CredentialCache::open(&config.cache)?;

    match command {
        Commands::Token => {
            config.require_oauth()?;
            let mut authority = TokenAuthority::from_config(config, cache);
            let token = authority.last_token().await?;
            println!("{}", token.as_str());
        }
        Commands::Claims => {
            config.require_oauth()?;
            let mut authority = TokenAuthority::from_config(config, cache);
            let claims = authority.decoded_claims().await?;
            println!("User:    {}", claims.username().unwrap_or("unknown"));
            println!("Tenant:  {}", claims.tid.as_deref().unwrap_or("unknown"));
            println!("Scopes:  {}", claims.scopes().join(" "));
            match claims.expires_at() {
                Some(at) if at > Utc::now() => {
                    println!("Expires: in {}", format_duration(at - Utc::now()))
                }
                Some(_) => println!("Expires: expired"),
                None => println!("Expires: unknown"),
            }
        }
        Commands::FormsSession => {
            let harvester = CookieSessionHarvester::from_config(config, cache)?;
            let session = harvester.harvest(false).await?;
            println!("Session ready with cookies: {}", session.cookie_names().join(", "));
        }
        Commands::FormsGet { entity } => {
            let harvester = Arc::new(CookieSessionHarvester::from_config(config, cache)?);
            let client = FormsClient::connect(harvester, &config.forms.api_base_url).await?;
            let value = client.get(&entity).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Bearer => {
            let harvester = CookieSessionHarvester::from_config(config, cache)?;
            let bearer = harvester.capture_bearer_token().await?;
            println!("{}", bearer.access_token.as_str());
        }
        Commands::ClearCache => {
            cache.clear().await?;
            println!("Credential cache cleared");
        }
        Commands::CheckClientIds { file, output } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let candidates = read_candidates(&contents)?;
            let Some(first) = candidates.first() else {
                println!("No client IDs found in {}", file.display());
                return Ok(());
            };

            // every candidate shares the configured tenant and user
            let mut principal = config.clone();
            principal.oauth.client_id = first.client_id.clone();
            principal.require_oauth()?;

            let output = output.unwrap_or_else(|| {
                PathBuf::from(format!("client_ids_{}.csv", config.oauth.email))
            });
            let mut log = ResultLog::open(output)?;
            check_client_ids(config, cache, &candidates, &mut log).await?;
        }
    }

    Ok(())
}

/// Try each candidate client ID against the configured principal, skipping
/// those already in `log`, and record every outcome as it happens.
async fn check_client_ids(
    config: &Config,
    cache: CredentialCache,
    candidates: &[Candidate],
    log: &mut ResultLog,
) -> Result<()> {
    for earlier in log.usable() {
        println!("{}  {}  OK (earlier run)", earlier.client_id, earlier.display_name);
    }

    for candidate in candidates {
        if log.is_checked(&candidate.client_id) {
            debug!("{} already checked", candidate.client_id);
            continue;
        }

        let error = if candidate.is_first_party() {
            Some(FIRST_PARTY_APPLICATION.to_string())
        } else {
            let mut candidate_config = config.clone();
            candidate_config.oauth.client_id = candidate.client_id.clone();
            let mut authority = TokenAuthority::from_config(&candidate_config, cache.clone())
                .with_interactive_timeout(CHECK_TIMEOUT);
            match authority.acquire_token().await {
                Ok(TokenResult::Success { .. }) => None,
                Ok(TokenResult::Error {
                    error, description, ..
                }) => Some(format!("{}: {}", error, description)),
                Err(e) => Some(e.to_string()),
            }
        };

        match &error {
            None => println!("{}  {}  OK", candidate.client_id, candidate.display_name),
            Some(e) => println!("{}  {}  FAILED {}", candidate.client_id, candidate.display_name, e),
        }
        log.record(CheckResult {
            display_name: candidate.display_name.clone(),
            client_id: candidate.client_id.clone(),
            error,
        })?;
    }

    info!("Results written to {}", log.path().display());
    Ok(())
}
