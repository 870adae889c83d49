//! `trackmirror status`: daemon counters over the control socket.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::Args;
use colored::Colorize;
use serde::Deserialize;
use tabled::{settings::Style, Table, Tabled};

use mirror_daemon::{request_status, DaemonError};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    backend: String,
    started_at_unix: i64,
    uptime_secs: u64,
    echo_entries: usize,
    echo_ttl_secs: u64,
    active_locks: usize,
    #[serde(default)]
    counters: BTreeMap<String, Counters>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Counters {
    applied: u64,
    suppressed: u64,
    skipped: u64,
    failed: u64,
    retried: u64,
}

#[derive(Tabled)]
struct CounterRow {
    #[tabled(rename = "handler")]
    handler: String,
    #[tabled(rename = "applied")]
    applied: u64,
    #[tabled(rename = "suppressed")]
    suppressed: u64,
    #[tabled(rename = "skipped")]
    skipped: u64,
    #[tabled(rename = "failed")]
    failed: u64,
    #[tabled(rename = "retried")]
    retried: u64,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;

        let status = match request_status(&home) {
            Ok(status) => status,
            Err(DaemonError::DaemonNotRunning { socket }) => {
                if self.json {
                    let payload = serde_json::json!({
                        "running": false,
                        "socket": socket.display().to_string(),
                    });
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&payload)
                            .context("failed to render daemon status JSON")?
                    );
                } else {
                    println!("daemon: {}", "stopped".yellow().bold());
                    println!("  socket: {}", socket.display());
                }
                return Ok(());
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&status)
                    .context("failed to render daemon status JSON")?
            );
            return Ok(());
        }

        let payload: StatusPayload =
            serde_json::from_value(status).context("daemon returned an unexpected status")?;
        print_report(&payload);
        Ok(())
    }
}

fn print_report(payload: &StatusPayload) {
    let started = Utc
        .timestamp_opt(payload.started_at_unix, 0)
        .single()
        .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string());

    println!(
        "daemon: {} ({} backend)",
        "running".green().bold(),
        payload.backend
    );
    println!(
        "  started {started}, up {}",
        format_uptime(payload.uptime_secs)
    );
    println!(
        "  echo entries: {} (ttl {}s), active locks: {}",
        payload.echo_entries, payload.echo_ttl_secs, payload.active_locks
    );

    let rows: Vec<CounterRow> = payload
        .counters
        .iter()
        .map(|(handler, c)| CounterRow {
            handler: handler.clone(),
            applied: c.applied,
            suppressed: c.suppressed,
            skipped: c.skipped,
            failed: c.failed,
            retried: c.retried,
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    let failed: u64 = payload.counters.values().map(|c| c.failed).sum();
    if failed > 0 {
        println!("{}", format!("{failed} event(s) failed; see daemon log").red());
    }
}

fn format_uptime(secs: u64) -> String {
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h{minutes:02}m")
    } else if minutes > 0 {
        format!("{minutes}m{seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}
