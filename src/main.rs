mod cli;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use cli::{Args, Command};
use kitvault::config::{default_config_path, load_config, KitConfig};
use kitvault::oauth::{AuthError, LoginOptions, OAuthCoordinator, ProviderConfig, TokenClient};
use kitvault::refresh::{RetryPolicy, TokenRefresher};
use kitvault::vault::{self, KeyManager, LoadStatus, Session, VaultStore};
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kitvault=info".into()),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = resolve_config(args.config.as_deref())?;

    info!(
        key_path = %config.storage.key_path.display(),
        vault_path = %config.storage.vault_path.display(),
        "Configuration loaded"
    );

    let store = vault::open(&config.storage).context("Failed to open vault")?;
    if let (_, LoadStatus::Recovered { reason }) = store.load_with_status() {
        eprintln!(
            "Warning: the vault at {} could not be read ({}). Continuing with an empty vault; \
             stored sessions and credentials are lost.",
            store.path().display(),
            reason
        );
    }

    match args.command {
        Command::Login { username, timeout } => login(&config, &store, &username, timeout).await,
        Command::Status => status(&config, &store).await,
        Command::Refresh => refresh(&config, &store).await,
        Command::Logout { username } => logout(&store, username),
        Command::SetCredential { name, value } => set_credential(&store, &name, value),
        Command::RotateKey => rotate_key(&config, store),
    }
}

/// Explicit `--config` must exist; the default file is optional.
fn resolve_config(path: Option<&Path>) -> Result<KitConfig> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => {
            let default_path = default_config_path();
            if default_path.exists() {
                load_config(&default_path)?
            } else {
                KitConfig::default()
            }
        }
    };
    config.apply_env();
    Ok(config)
}

fn token_client(config: &KitConfig, store: &VaultStore) -> Result<(ProviderConfig, TokenClient)> {
    let provider = ProviderConfig::resolve(&config.oauth, config.redirect_uri(), &store.load())?;
    let client = TokenClient::new(&provider);
    Ok((provider, client))
}

fn refresher(config: &KitConfig, store: &VaultStore) -> Result<TokenRefresher> {
    let (_, client) = token_client(config, store)?;
    TokenRefresher::from_config(client, &config.refresh)
}

async fn login(
    config: &KitConfig,
    store: &VaultStore,
    username: &str,
    timeout: Option<u64>,
) -> Result<()> {
    if username.trim().is_empty() {
        bail!("Username must not be empty");
    }

    let (provider, client) = match token_client(config, store) {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return Ok(());
        }
    };
    let mut coordinator = OAuthCoordinator::with_client(provider, client)
        .with_tier(config.oauth.tier.clone())
        .with_retry_policy(RetryPolicy::from(&config.refresh));

    let mut options = LoginOptions::from_config(&config.callback);
    if let Some(seconds) = timeout {
        options.timeout = Duration::from_secs(seconds);
    }

    let abort = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    let outcome = coordinator
        .login(store, username, &options, abort, |url| {
            println!("Open this URL in your browser to authorize:\n\n  {}\n", url);
            println!(
                "Waiting up to {}s for the redirect (Ctrl-C to cancel)...",
                options.timeout.as_secs()
            );
        })
        .await;

    match outcome {
        Ok(session) => {
            println!("Logged in as {}.", username);
            print_session(username, &session);
        }
        Err(e) => report(e),
    }
    Ok(())
}

async fn status(config: &KitConfig, store: &VaultStore) -> Result<()> {
    let doc = store.load();

    match doc.current_session() {
        None => println!("Not logged in."),
        Some((username, session)) => match refresher(config, store) {
            Ok(refresher) => match refresher
                .ensure_fresh(store, username, session.clone())
                .await
            {
                Ok(session) => print_session(username, &session),
                Err(e) => report(e),
            },
            Err(e) => {
                // Show what is stored even when tokens cannot be refreshed
                print_session(username, session);
                eprintln!("Warning: tokens cannot be refreshed: {:#}", e);
            }
        },
    }

    let others: Vec<&str> = doc
        .users()
        .map(|(name, _)| name)
        .filter(|name| Some(*name) != doc.current_user())
        .collect();
    if !others.is_empty() {
        println!("Other stored users: {}", others.join(", "));
    }

    let credentials: Vec<&str> = doc.credential_names().collect();
    if !credentials.is_empty() {
        println!("Stored credentials: {}", credentials.join(", "));
    }
    Ok(())
}

async fn refresh(config: &KitConfig, store: &VaultStore) -> Result<()> {
    let doc = store.load();
    let Some((username, session)) = doc.current_session() else {
        println!("Not logged in.");
        return Ok(());
    };

    let refresher = match refresher(config, store) {
        Ok(refresher) => refresher,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return Ok(());
        }
    };

    match refresher.refresh(store, username, session.clone()).await {
        Ok(session) => {
            println!("Access token refreshed.");
            print_session(username, &session);
        }
        Err(e) => report(e),
    }
    Ok(())
}

fn logout(store: &VaultStore, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| store.load().current_user().map(String::from)) {
        Some(username) => username,
        None => {
            println!("Not logged in.");
            return Ok(());
        }
    };

    if store.update(|doc| doc.logout(&username))? {
        info!(username = %username, "Session removed");
        println!("Logged out {}.", username);
    } else {
        println!("No session stored for {}.", username);
    }
    Ok(())
}

fn set_credential(store: &VaultStore, name: &str, value: Option<String>) -> Result<()> {
    let value = match value {
        Some(value) => value,
        None => {
            eprint!("Value for {}: ", name);
            io::stderr().flush().ok();
            let mut line = String::new();
            io::stdin()
                .lock()
                .read_line(&mut line)
                .context("Failed to read credential from stdin")?;
            line.trim_end_matches(['\r', '\n']).to_string()
        }
    };

    if value.is_empty() {
        bail!("Credential value must not be empty");
    }

    store.update(|doc| doc.set_credential(name, &value))?;
    info!(name = %name, "Credential stored");
    println!("Stored credential '{}'.", name);
    Ok(())
}

fn rotate_key(config: &KitConfig, mut store: VaultStore) -> Result<()> {
    let key = KeyManager::new(&config.storage.key_path)
        .rotate()
        .context("Failed to rotate encryption key")?;
    store
        .rekey(key)
        .context("Failed to re-encrypt vault under the new key")?;

    println!("Encryption key rotated; vault re-encrypted.");
    Ok(())
}

fn print_session(username: &str, session: &Session) {
    println!("User:          {}", username);
    println!("Tier:          {}", session.tier);
    match session.expires_at {
        Some(expires_at) => {
            let remaining = expires_at - Utc::now();
            println!(
                "Expires at:    {} ({} min left)",
                expires_at.to_rfc3339(),
                remaining.num_minutes().max(0)
            );
        }
        None => println!("Expires at:    never"),
    }
    println!(
        "Refresh token: {}",
        if session.refresh_token.is_some() { "yes" } else { "no" }
    );
}

fn report(error: AuthError) {
    warn!(error = %error, "Authentication failed");
    eprintln!("Error: {}", error);
    if error.requires_login() {
        eprintln!("Run `kitvault login <username>` to sign in again.");
    }
}
