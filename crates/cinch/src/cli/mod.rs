mod migrate;
mod serve;
mod token;

pub use migrate::MigrateCommand;
pub use serve::ServeCommand;
pub use token::TokenCommand;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Cinch - distributed CI control plane.
#[derive(Parser)]
#[command(name = "cinch")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the Cinch server (webhook ingest, dispatcher, worker gateway).
    Serve(ServeCommand),

    /// Manage database migrations.
    Migrate(MigrateCommand),

    /// Mint or revoke bearer tokens.
    Token(TokenCommand),
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve(cmd) => cmd.execute().await,
            Commands::Migrate(cmd) => cmd.execute().await,
            Commands::Token(cmd) => cmd.execute().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve() {
        let cli = Cli::try_parse_from(["cinch", "serve", "--config", "cinch.toml"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn parses_migrate_status() {
        let cli = Cli::try_parse_from(["cinch", "migrate", "status"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn parses_token_create() {
        let cli = Cli::try_parse_from(["cinch", "token", "create", "ci-worker-1"]);
        assert!(cli.is_ok());
    }
}
