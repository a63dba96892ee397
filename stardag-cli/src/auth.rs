//! `stardag auth` commands: device-code login, logout, status, refresh.

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::Subcommand;
use colored::Colorize;

use stardag_config::{CachedAccessToken, ConfigFile, Credentials};
use stardag_types::ExchangeResponse;

use crate::oidc;

#[derive(Debug, Subcommand)]
pub enum AuthCommand {
    /// Log in to a registry via the OIDC device flow.
    Login {
        /// Registry name from config; defaults to the active profile's.
        #[arg(long)]
        registry: Option<String>,
    },
    /// Remove stored credentials and cached tokens for the active profile.
    Logout,
    /// Show login and token-cache state for the active profile.
    Status,
    /// Refresh the cached workspace access token.
    Refresh,
}

pub async fn run(command: AuthCommand) -> Result<()> {
    match command {
        AuthCommand::Login { registry } => login(registry).await,
        AuthCommand::Logout => logout(),
        AuthCommand::Status => status(),
        AuthCommand::Refresh => refresh().await,
    }
}

struct ActiveContext {
    registry_name: String,
    registry_url: String,
    profile_name: Option<String>,
}

fn active_context(config: &ConfigFile, registry_override: Option<String>) -> Result<ActiveContext> {
    if let Some(name) = registry_override {
        let entry = config
            .registries
            .get(&name)
            .with_context(|| format!("unknown registry '{name}'; add it with `stardag config registry add`"))?;
        return Ok(ActiveContext {
            registry_name: name,
            registry_url: entry.url.clone(),
            profile_name: None,
        });
    }

    let (profile_name, profile) = config
        .active_profile()
        .context("no active profile; run `stardag config profile add` first")?;
    let url = config
        .registry_url(profile)
        .with_context(|| format!("profile '{profile_name}' references an unknown registry"))?;
    Ok(ActiveContext {
        registry_name: profile.registry.clone(),
        registry_url: url,
        profile_name: Some(profile_name),
    })
}

async fn login(registry_override: Option<String>) -> Result<()> {
    let mut config = ConfigFile::load()?;
    let context = active_context(&config, registry_override)?;
    let client = reqwest::Client::new();

    let auth_config = oidc::fetch_auth_config(&client, &context.registry_url).await?;
    let metadata = oidc::discover_provider(&client, &auth_config.oidc_issuer).await?;
    let device =
        oidc::request_device_authorization(&client, &metadata, &auth_config.oidc_client_id)
            .await?;

    println!(
        "To log in, visit {} and enter code {}",
        device.verification_uri.bold(),
        device.user_code.bold().green()
    );
    if let Some(complete) = &device.verification_uri_complete {
        println!("or open {complete}");
    }

    let tokens =
        oidc::poll_for_token(&client, &metadata, &auth_config.oidc_client_id, &device).await?;
    let refresh_token = tokens
        .refresh_token
        .context("issuer did not return a refresh token; cannot persist login")?;
    let email = tokens
        .id_token
        .as_deref()
        .and_then(oidc::email_from_id_token)
        .context("id token missing email claim")?;

    Credentials {
        token_endpoint: metadata.token_endpoint.clone(),
        client_id: auth_config.oidc_client_id.clone(),
        refresh_token,
    }
    .save(&context.registry_name, &email)?;

    // Remember who this profile logs in as.
    if let Some(profile_name) = &context.profile_name {
        if let Some(profile) = config.profiles.get_mut(profile_name) {
            profile.user = Some(email.clone());
            config.save()?;
        }
    }

    println!("{} logged in as {email}", "ok:".green());
    Ok(())
}

fn logout() -> Result<()> {
    let config = ConfigFile::load()?;
    let (_, profile) = config
        .active_profile()
        .context("no active profile")?;
    let user = profile.user.clone().context("profile has no logged-in user")?;
    let registry = profile.registry.clone();

    let removed = Credentials::delete(&registry, &user)?;
    if let Some(workspace_id) = &profile.workspace_id {
        CachedAccessToken::delete(&registry, &user, workspace_id)?;
    }

    if removed {
        println!("{} logged out {user} from {registry}", "ok:".green());
    } else {
        println!("no stored credentials for {user} on {registry}");
    }
    Ok(())
}

fn status() -> Result<()> {
    let config = ConfigFile::load()?;
    let Some((profile_name, profile)) = config.active_profile() else {
        println!("no active profile");
        return Ok(());
    };

    println!("profile:   {profile_name}");
    println!("registry:  {}", profile.registry);
    match &profile.user {
        Some(user) => {
            println!("user:      {user}");
            let logged_in = Credentials::load(&profile.registry, user)?.is_some();
            println!(
                "login:     {}",
                if logged_in {
                    "credentials stored".green()
                } else {
                    "not logged in".red()
                }
            );
            if let Some(workspace_id) = &profile.workspace_id {
                let cached = CachedAccessToken::load(&profile.registry, user, workspace_id)?;
                match cached {
                    Some(token) if token.is_fresh() => {
                        println!(
                            "token:     {} (expires {})",
                            "fresh".green(),
                            token.expires_at
                        );
                    }
                    Some(_) => println!("token:     {}", "expired".yellow()),
                    None => println!("token:     none cached"),
                }
            }
        }
        None => println!("user:      (not logged in)"),
    }
    Ok(())
}

async fn refresh() -> Result<()> {
    let config = ConfigFile::load()?;
    let (_, profile) = config
        .active_profile()
        .context("no active profile")?;
    let registry_url = config
        .registry_url(profile)
        .context("profile references an unknown registry")?;
    let user = profile.user.clone().context("not logged in; run `stardag auth login`")?;
    let workspace_id = profile
        .workspace_id
        .clone()
        .context("profile has no workspace_id")?;

    let token = exchange_for_workspace_token(
        &profile.registry,
        &registry_url,
        &user,
        &workspace_id,
    )
    .await?;
    println!(
        "{} refreshed access token (expires {})",
        "ok:".green(),
        token.expires_at
    );
    Ok(())
}

/// Refresh the OIDC access token with the stored refresh token, exchange
/// it for a workspace-scoped internal token and cache the result.
pub async fn exchange_for_workspace_token(
    registry_name: &str,
    registry_url: &str,
    user: &str,
    workspace_id: &str,
) -> Result<CachedAccessToken> {
    let credentials = Credentials::load(registry_name, user)?
        .context("no stored credentials; run `stardag auth login`")?;
    let client = reqwest::Client::new();

    let tokens = oidc::refresh_access_token(
        &client,
        &credentials.token_endpoint,
        &credentials.client_id,
        &credentials.refresh_token,
    )
    .await?;

    let url = format!("{}/api/v1/auth/exchange", registry_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .bearer_auth(&tokens.access_token)
        .json(&serde_json::json!({ "workspace_id": workspace_id }))
        .send()
        .await?;
    if !response.status().is_success() {
        bail!("token exchange failed with status {}", response.status());
    }
    let exchanged: ExchangeResponse = response.json().await?;

    let cached = CachedAccessToken {
        access_token: exchanged.access_token,
        expires_at: Utc::now() + Duration::seconds(exchanged.expires_in as i64),
    };
    cached.save(registry_name, user, workspace_id)?;
    Ok(cached)
}
