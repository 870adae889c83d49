//! `trackmirror check-config`: load config and resolve both servers' credentials.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use mirror_core::config;
use mirror_core::Side;

#[derive(Args, Debug)]
pub struct CheckConfigArgs {
    /// Print the effective config as JSON.
    #[arg(long)]
    pub show: bool,
}

impl CheckConfigArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let path = config::config_path_at(&home);

        for env_file in config::load_env_files_at(&home) {
            println!("loaded {}", env_file.display());
        }
        let config = config::load_at(&home)
            .with_context(|| format!("invalid config at {}", path.display()))?;
        if path.exists() {
            println!("config: {}", path.display());
        } else {
            println!("config: {} (not found, using defaults)", path.display());
        }

        let mut missing = 0;
        for side in [Side::Undark, Side::Pbv] {
            let server = config.servers.get(side);
            match server.credentials(side) {
                Ok(credentials) => println!(
                    "{} {side}: {} as {} (timeout {}s)",
                    "✓".green(),
                    credentials.url,
                    credentials.api_user,
                    server.timeout().as_secs(),
                ),
                Err(err) => {
                    missing += 1;
                    println!("{} {err}", "✗".red());
                }
            }
        }

        if self.show {
            let rendered =
                serde_json::to_string_pretty(&config).context("failed to render config")?;
            println!("{rendered}");
        }

        if missing > 0 {
            bail!("{missing} server(s) are not fully configured");
        }
        Ok(())
    }
}
