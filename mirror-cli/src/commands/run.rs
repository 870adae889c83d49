//! `trackmirror run`: foreground daemon.

use anyhow::{Context, Result};
use clap::Args;

use mirror_daemon::{start_blocking, Backend};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Run against two empty in-process servers instead of ftrack.
    #[arg(long)]
    pub memory: bool,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let backend = if self.memory {
            Backend::Memory
        } else {
            Backend::Ftrack
        };
        start_blocking(&home, backend).context("daemon exited with error")
    }
}
