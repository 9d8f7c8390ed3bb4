use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;

use cinch_core::config::CinchConfig;
use cinch_runtime::migrations::{load_migrations_from_dir, get_builtin_migrations, MigrationRunner};
use cinch_runtime::Database;

/// Manage database migrations.
#[derive(Parser)]
pub struct MigrateCommand {
    #[command(subcommand)]
    pub action: MigrateAction,

    /// Configuration file path.
    #[arg(short, long, default_value = "cinch.toml", global = true)]
    pub config: String,

    /// Extra migrations directory, applied after the built-in schema.
    #[arg(short, long, default_value = "migrations", global = true)]
    pub migrations_dir: String,
}

#[derive(Subcommand)]
pub enum MigrateAction {
    /// Run all pending migrations.
    Up,

    /// Rollback the last N migrations.
    Down {
        #[arg(default_value = "1")]
        count: usize,
    },

    /// Show migration status.
    Status,
}

impl MigrateCommand {
    pub async fn execute(self) -> Result<()> {
        dotenvy::dotenv().ok();

        let config_path = Path::new(&self.config);
        if !config_path.exists() {
            anyhow::bail!("configuration file not found: {}", self.config);
        }
        let config = CinchConfig::from_file(&self.config)?;

        let db = Database::from_config(&config.database).await?;
        let runner = MigrationRunner::new(db.pool().clone());

        let mut available = get_builtin_migrations();
        let migrations_dir = Path::new(&self.migrations_dir);
        if migrations_dir.exists() {
            available.extend(load_migrations_from_dir(migrations_dir)?);
        }

        match self.action {
            MigrateAction::Up => {
                println!();
                println!("  {} Cinch Migrations", style("⚒").bold().cyan());
                println!();
                println!("  {} Running pending migrations...", style("→").dim());
                runner.run(available).await?;
                println!("  {} Migrations complete", style("✓").green());
                println!();
            }

            MigrateAction::Down { count } => {
                println!();
                if count == 0 {
                    println!("  {} Nothing to rollback (count=0)", style("ℹ").blue());
                    return Ok(());
                }
                println!("  {} Rolling back {} migration(s)...", style("→").dim(), count);
                let rolled_back = runner.rollback(count).await?;
                if rolled_back.is_empty() {
                    println!("  {} No migrations to rollback", style("ℹ").blue());
                } else {
                    for name in &rolled_back {
                        println!("  {} Rolled back: {}", style("✓").green(), name);
                    }
                }
                println!();
            }

            MigrateAction::Status => {
                println!();
                let status = runner.status(&available).await?;
                if status.applied.is_empty() && status.pending.is_empty() {
                    println!("  {} No migrations found", style("ℹ").blue());
                    return Ok(());
                }
                if !status.applied.is_empty() {
                    println!("  {} Applied:", style("✓").green());
                    for m in &status.applied {
                        println!(
                            "    {} ({})",
                            style(&m.name).cyan(),
                            m.applied_at.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
                if !status.pending.is_empty() {
                    if !status.applied.is_empty() {
                        println!();
                    }
                    println!("  {} Pending:", style("○").yellow());
                    for name in &status.pending {
                        println!("    {}", style(name).yellow());
                    }
                }
                println!();
                println!(
                    "  {} {} applied, {} pending",
                    style("ℹ").blue(),
                    status.applied.len(),
                    status.pending.len()
                );
                println!();
            }
        }

        Ok(())
    }
}
