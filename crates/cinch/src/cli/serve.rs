use std::path::Path;

use anyhow::Result;
use clap::Parser;
use console::style;

use crate::runtime;

/// Run the Cinch server.
#[derive(Parser)]
pub struct ServeCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "cinch.toml")]
    pub config: String,
}

impl ServeCommand {
    pub async fn execute(self) -> Result<()> {
        dotenvy::dotenv().ok();

        let config_path = Path::new(&self.config);
        if !config_path.exists() {
            anyhow::bail!(
                "configuration file not found: {}\nset CINCH_CONFIG or pass --config",
                self.config
            );
        }

        println!();
        println!("  {}  Cinch", style("⚒").bold().cyan());
        println!();

        runtime::serve(&self.config).await
    }
}
