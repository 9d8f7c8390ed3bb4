use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use uuid::Uuid;

use cinch_core::config::CinchConfig;
use cinch_core::crypto::hash_token;
use cinch_core::model::Token;
use cinch_runtime::storage::PgStorage;
use cinch_runtime::{Database, Storage};
use rand::RngCore;

/// Mint or revoke bearer tokens. Run against the same database as the server;
/// this is the only way to produce the first token, since every HTTP token
/// endpoint itself requires a bearer token to call.
#[derive(Parser)]
pub struct TokenCommand {
    #[command(subcommand)]
    pub action: TokenAction,

    /// Configuration file path.
    #[arg(short, long, default_value = "cinch.toml", global = true)]
    pub config: String,
}

#[derive(Subcommand)]
pub enum TokenAction {
    /// Mint a new token and print its raw value once.
    Create {
        /// Human-readable label for the token.
        display_name: String,

        /// Ties the token to a specific worker id; omit for an operator token.
        #[arg(long)]
        worker_id: Option<Uuid>,
    },

    /// Revoke a token by id.
    Revoke { id: Uuid },
}

impl TokenCommand {
    pub async fn execute(self) -> Result<()> {
        dotenvy::dotenv().ok();

        let config_path = Path::new(&self.config);
        if !config_path.exists() {
            anyhow::bail!("configuration file not found: {}", self.config);
        }
        let config = CinchConfig::from_file(&self.config)?;
        let db = Database::from_config(&config.database).await?;
        let storage = PgStorage::new(db.pool().clone());

        match self.action {
            TokenAction::Create { display_name, worker_id } => {
                let raw = generate_raw_token();
                let token = Token {
                    id: Uuid::new_v4(),
                    token_hash: hash_token(&raw),
                    display_name,
                    worker_id,
                    created_at: chrono::Utc::now(),
                    revoked_at: None,
                };
                let created = storage.create_token(token).await?;
                println!();
                println!("  {} Token created: {}", style("✓").green(), created.id);
                println!("  {}", style(&raw).bold());
                println!("  {} this value is shown once, store it now", style("⚠").yellow());
                println!();
            }
            TokenAction::Revoke { id } => {
                storage.revoke_token(id).await?;
                println!("  {} Revoked token {}", style("✓").green(), id);
            }
        }

        Ok(())
    }
}

fn generate_raw_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("cin_{}", hex::encode(bytes))
}
