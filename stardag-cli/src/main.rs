mod auth;
mod config_cmd;
mod oidc;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "stardag", about = "Stardag registry CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Authentication against a registry's OIDC issuer.
    Auth {
        #[command(subcommand)]
        command: auth::AuthCommand,
    },
    /// Local configuration: registries, profiles, target roots.
    Config {
        #[command(subcommand)]
        command: config_cmd::ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Auth { command } => auth::run(command).await,
        Command::Config { command } => config_cmd::run(command).await,
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::ExitCode::from(1)
        }
    }
}
