//! `stardag config` commands: registries, profiles, target-root cache.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use colored::Colorize;

use stardag_config::target_roots::TargetRootCache;
use stardag_config::{CachedAccessToken, ConfigFile, Profile, RegistryEntry};
use stardag_types::TargetRootResponse;

use crate::auth::exchange_for_workspace_token;

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the resolved configuration.
    Show,
    /// Manage known registries.
    Registry {
        #[command(subcommand)]
        command: RegistryCommand,
    },
    /// Manage profiles.
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    /// Manage the local target-root cache.
    TargetRoots {
        #[command(subcommand)]
        command: TargetRootsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum RegistryCommand {
    /// Add or update a registry.
    Add { name: String, url: String },
    List,
    Remove { name: String },
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    /// Add or update a profile.
    Add {
        name: String,
        #[arg(long)]
        registry: String,
        #[arg(long)]
        workspace_id: Option<String>,
        #[arg(long)]
        environment_id: Option<String>,
        #[arg(long)]
        user: Option<String>,
    },
    List,
    /// Set the default profile.
    Use { name: String },
    Remove { name: String },
}

#[derive(Debug, Subcommand)]
pub enum TargetRootsCommand {
    /// Print cached target roots for the active profile's environment.
    List,
    /// Fetch target roots from the registry and update the cache.
    Sync,
}

pub async fn run(command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => show(),
        ConfigCommand::Registry { command } => registry(command),
        ConfigCommand::Profile { command } => profile(command),
        ConfigCommand::TargetRoots { command } => match command {
            TargetRootsCommand::List => target_roots_list(),
            TargetRootsCommand::Sync => target_roots_sync().await,
        },
    }
}

fn show() -> Result<()> {
    let config = ConfigFile::load()?;
    println!(
        "default profile: {}",
        config.default_profile.as_deref().unwrap_or("(none)")
    );
    println!("registries:");
    for (name, entry) in &config.registries {
        println!("  {name}: {}", entry.url);
    }
    println!("profiles:");
    for (name, profile) in &config.profiles {
        println!(
            "  {name}: registry={} workspace={} environment={} user={}",
            profile.registry,
            profile.workspace_id.as_deref().unwrap_or("-"),
            profile.environment_id.as_deref().unwrap_or("-"),
            profile.user.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn registry(command: RegistryCommand) -> Result<()> {
    let mut config = ConfigFile::load()?;
    match command {
        RegistryCommand::Add { name, url } => {
            config.registries.insert(name.clone(), RegistryEntry { url });
            config.save()?;
            println!("{} registry '{name}' saved", "ok:".green());
        }
        RegistryCommand::List => {
            for (name, entry) in &config.registries {
                println!("{name}\t{}", entry.url);
            }
        }
        RegistryCommand::Remove { name } => {
            if config.registries.remove(&name).is_none() {
                bail!("unknown registry '{name}'");
            }
            config.save()?;
            println!("{} registry '{name}' removed", "ok:".green());
        }
    }
    Ok(())
}

fn profile(command: ProfileCommand) -> Result<()> {
    let mut config = ConfigFile::load()?;
    match command {
        ProfileCommand::Add {
            name,
            registry,
            workspace_id,
            environment_id,
            user,
        } => {
            if !config.registries.contains_key(&registry) {
                bail!("unknown registry '{registry}'; add it first");
            }
            config.profiles.insert(
                name.clone(),
                Profile {
                    registry,
                    workspace_id,
                    environment_id,
                    user,
                },
            );
            if config.default_profile.is_none() {
                config.default_profile = Some(name.clone());
            }
            config.save()?;
            println!("{} profile '{name}' saved", "ok:".green());
        }
        ProfileCommand::List => {
            let default = config.default_profile.clone();
            for name in config.profiles.keys() {
                let marker = if default.as_deref() == Some(name) { "*" } else { " " };
                println!("{marker} {name}");
            }
        }
        ProfileCommand::Use { name } => {
            if !config.profiles.contains_key(&name) {
                bail!("unknown profile '{name}'");
            }
            config.default_profile = Some(name.clone());
            config.save()?;
            println!("{} default profile set to '{name}'", "ok:".green());
        }
        ProfileCommand::Remove { name } => {
            if config.profiles.remove(&name).is_none() {
                bail!("unknown profile '{name}'");
            }
            if config.default_profile.as_deref() == Some(name.as_str()) {
                config.default_profile = None;
            }
            config.save()?;
            println!("{} profile '{name}' removed", "ok:".green());
        }
    }
    Ok(())
}

struct ProfileScope {
    registry_name: String,
    registry_url: String,
    user: String,
    workspace_id: String,
    environment_id: String,
}

fn profile_scope(config: &ConfigFile) -> Result<ProfileScope> {
    let (name, profile) = config.active_profile().context("no active profile")?;
    Ok(ProfileScope {
        registry_name: profile.registry.clone(),
        registry_url: config
            .registry_url(profile)
            .with_context(|| format!("profile '{name}' references an unknown registry"))?,
        user: profile
            .user
            .clone()
            .context("profile has no logged-in user")?,
        workspace_id: profile
            .workspace_id
            .clone()
            .context("profile has no workspace_id")?,
        environment_id: profile
            .environment_id
            .clone()
            .context("profile has no environment_id")?,
    })
}

fn target_roots_list() -> Result<()> {
    let config = ConfigFile::load()?;
    let scope = profile_scope(&config)?;
    let cache = TargetRootCache::load()?;
    let roots = cache.resolve(&scope.registry_name, &scope.workspace_id, &scope.environment_id);
    if roots.is_empty() {
        println!("no cached target roots; run `stardag config target-roots sync`");
        return Ok(());
    }
    let mut names: Vec<&String> = roots.keys().collect();
    names.sort();
    for name in names {
        println!("{name}\t{}", roots[name]);
    }
    Ok(())
}

async fn target_roots_sync() -> Result<()> {
    let config = ConfigFile::load()?;
    let scope = profile_scope(&config)?;

    // Use a fresh cached token, refreshing through the exchange if needed.
    let token = match CachedAccessToken::load(
        &scope.registry_name,
        &scope.user,
        &scope.workspace_id,
    )? {
        Some(cached) if cached.is_fresh() => cached,
        _ => {
            exchange_for_workspace_token(
                &scope.registry_name,
                &scope.registry_url,
                &scope.user,
                &scope.workspace_id,
            )
            .await?
        }
    };

    let url = format!(
        "{}/api/v1/ui/workspaces/{}/environments/{}/target-roots",
        scope.registry_url.trim_end_matches('/'),
        scope.workspace_id,
        scope.environment_id,
    );
    let client = reqwest::Client::new();
    let response = client
        .get(&url)
        .bearer_auth(&token.access_token)
        .send()
        .await?;
    if !response.status().is_success() {
        bail!("target-root sync failed with status {}", response.status());
    }
    let roots: Vec<TargetRootResponse> = response.json().await?;

    let mut cache = TargetRootCache::load()?;
    let map: BTreeMap<String, String> = roots
        .into_iter()
        .map(|root| (root.name, root.uri))
        .collect();
    let count = map.len();
    cache.set(&scope.registry_name, &scope.workspace_id, &scope.environment_id, map);
    cache.save()?;

    println!("{} synced {count} target root(s)", "ok:".green());
    Ok(())
}
