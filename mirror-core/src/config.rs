//! YAML configuration for the mirror daemon.
//!
//! # Storage layout
//!
//! ```text
//! ~/.trackmirror/
//!   config.yaml       (optional: every field has a default)
//!   .env              (optional credentials, loaded before env lookups)
//!   run/daemon.sock   (control socket, owned by the daemon)
//! ```
//!
//! Every function touching the filesystem takes the home directory
//! explicitly (`*_at(home)`); callers resolve it, tests pass a `TempDir`.
//!
//! Credentials never live in the YAML file. The file names the environment
//! variables holding them; the defaults match the variables the previous
//! tooling read (`FTRACK_*` for PBV, `UNDARK_FTRACK_*` for UNDARK).

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::types::Side;

/// Custom attributes copied verbatim onto mirrored versions.
pub const DEFAULT_VERSION_METADATA_KEYS: &[&str] = &[
    "product",
    "productpath",
    "prism_version",
    "source_path",
    "department",
    "user",
];

/// Task types created under every new shot.
pub const DEFAULT_SHOT_TEMPLATE: &[&str] = &["Animation", "Lighting", "Compositing"];

// ---------------------------------------------------------------------------
// 1. Schema
// ---------------------------------------------------------------------------

/// Root of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MirrorConfig {
    pub servers: ServersConfig,
    pub sync: SyncSettings,
    pub poll: PollSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServersConfig {
    pub undark: ServerConfig,
    pub pbv: ServerConfig,
}

impl ServersConfig {
    pub fn get(&self, side: Side) -> &ServerConfig {
        match side {
            Side::Undark => &self.undark,
            Side::Pbv => &self.pbv,
        }
    }
}

/// Endpoint settings for one server. Unset `*_env` names fall back to the
/// side's historical variable names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_user_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Per-request timeout; also bounds each handler attempt.
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_user: None,
            url_env: None,
            api_user_env: None,
            api_key_env: None,
            timeout_secs: 30,
        }
    }
}

/// Resolved endpoint and credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub url: String,
    pub api_user: String,
    pub api_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("url", &self.url)
            .field("api_user", &self.api_user)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl ServerConfig {
    pub fn url_env(&self, side: Side) -> String {
        self.url_env.clone().unwrap_or_else(|| match side {
            Side::Undark => "UNDARK_FTRACK_API_URL".to_string(),
            Side::Pbv => "FTRACK_SERVER".to_string(),
        })
    }

    pub fn api_user_env(&self, side: Side) -> String {
        self.api_user_env.clone().unwrap_or_else(|| match side {
            Side::Undark => "UNDARK_FTRACK_API_USER".to_string(),
            Side::Pbv => "FTRACK_API_USER".to_string(),
        })
    }

    pub fn api_key_env(&self, side: Side) -> String {
        self.api_key_env.clone().unwrap_or_else(|| match side {
            Side::Undark => "UNDARK_FTRACK_API_KEY".to_string(),
            Side::Pbv => "FTRACK_API_KEY".to_string(),
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Resolve credentials from the process environment.
    pub fn credentials(&self, side: Side) -> Result<Credentials, ConfigError> {
        self.credentials_with(side, |var| std::env::var(var).ok())
    }

    /// Resolve credentials through `lookup`. Inline `url` / `api_user` win
    /// over their environment variables; the key always comes from `lookup`.
    pub fn credentials_with(
        &self,
        side: Side,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Credentials, ConfigError> {
        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let url_var = self.url_env(side);
        let url = non_empty(self.url.clone())
            .or_else(|| non_empty(lookup(&url_var)))
            .ok_or(ConfigError::MissingSetting {
                server: side,
                what: "server URL",
                var: url_var,
            })?;

        let user_var = self.api_user_env(side);
        let api_user = non_empty(self.api_user.clone())
            .or_else(|| non_empty(lookup(&user_var)))
            .ok_or(ConfigError::MissingSetting {
                server: side,
                what: "API user",
                var: user_var,
            })?;

        let key_var = self.api_key_env(side);
        let api_key = non_empty(lookup(&key_var)).ok_or(ConfigError::MissingSetting {
            server: side,
            what: "API key",
            var: key_var,
        })?;

        Ok(Credentials {
            url: url.trim_end_matches('/').to_string(),
            api_user,
            api_key,
        })
    }
}

/// Engine behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// How long a self-caused write suppresses inbound events for its id.
    pub echo_ttl_secs: u64,
    /// Deadline for one handler attempt.
    pub handler_timeout_secs: u64,
    pub retry: RetrySettings,
    /// Task type used when the destination has no type of the source's name.
    pub default_task_type: String,
    /// Case-insensitive name marker selecting PBV tasks to mirror.
    pub asset_request_marker: String,
    /// Tolerance when matching a note against an existing destination note.
    pub note_match_window_secs: u64,
    pub version_metadata_keys: Vec<String>,
    pub shot_template: ShotTemplateSettings,
    /// Interval of the applied/suppressed counters log line.
    pub stats_interval_secs: u64,
    /// Interval of the expired echo entry sweep.
    pub sweep_interval_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            echo_ttl_secs: 60,
            handler_timeout_secs: 30,
            retry: RetrySettings::default(),
            default_task_type: "Generic".to_string(),
            asset_request_marker: "asset-request".to_string(),
            note_match_window_secs: 600,
            version_metadata_keys: DEFAULT_VERSION_METADATA_KEYS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            shot_template: ShotTemplateSettings::default(),
            stats_interval_secs: 60,
            sweep_interval_secs: 30,
        }
    }
}

impl SyncSettings {
    pub fn echo_ttl(&self) -> Duration {
        Duration::from_secs(self.echo_ttl_secs)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs.max(1))
    }

    pub fn note_match_window(&self) -> Duration {
        Duration::from_secs(self.note_match_window_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShotTemplateSettings {
    pub enabled: bool,
    pub task_types: Vec<String>,
    /// Read-after-write tolerance when the shot is not yet visible.
    pub refetch_attempts: u32,
    pub refetch_interval_ms: u64,
    /// Servers whose shot creations receive the template.
    pub sides: Vec<Side>,
}

impl Default for ShotTemplateSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            task_types: DEFAULT_SHOT_TEMPLATE.iter().map(|t| t.to_string()).collect(),
            refetch_attempts: 5,
            refetch_interval_ms: 1_000,
            sides: Side::ALL.to_vec(),
        }
    }
}

impl ShotTemplateSettings {
    pub fn refetch_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.refetch_attempts,
            Duration::from_millis(self.refetch_interval_ms),
        )
    }
}

/// Subscription polling for adapters without a push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub interval_ms: u64,
    /// How far back the first poll looks, to cover a restart gap.
    pub lookback_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            lookback_secs: 0,
        }
    }
}

impl PollSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(100))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LogSettings {
    /// Emit newline-delimited JSON instead of human-readable lines.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// 2. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.trackmirror/`
pub fn config_root(home: &Path) -> PathBuf {
    home.join(".trackmirror")
}

/// `<home>/.trackmirror/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    config_root(home).join("config.yaml")
}

/// `<home>/.trackmirror/.env`
pub fn env_path_at(home: &Path) -> PathBuf {
    config_root(home).join(".env")
}

// ---------------------------------------------------------------------------
// 3. Load
// ---------------------------------------------------------------------------

/// Load `<home>/.trackmirror/config.yaml`, or defaults when the file is absent.
///
/// Returns `ConfigError::Parse` (with path + line context) if malformed.
pub fn load_at(home: &Path) -> Result<MirrorConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(MirrorConfig::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: MirrorConfig =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    validate(&config)?;
    Ok(config)
}

/// Load `.env` files into the process environment: the working directory's
/// first, then `<home>/.trackmirror/.env`. Variables already set win.
pub fn load_env_files_at(home: &Path) -> Vec<PathBuf> {
    let mut loaded = Vec::new();
    if let Ok(path) = dotenvy::dotenv() {
        loaded.push(path);
    }
    let home_env = env_path_at(home);
    if home_env.exists() {
        match dotenvy::from_path(&home_env) {
            Ok(()) => loaded.push(home_env),
            Err(err) => {
                tracing::warn!(path = %home_env.display(), error = %err, "failed to load env file")
            }
        }
    }
    loaded
}

fn validate(config: &MirrorConfig) -> Result<(), ConfigError> {
    if config.sync.retry.attempts == 0 {
        return Err(ConfigError::Invalid {
            key: "sync.retry.attempts".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    if config.sync.echo_ttl_secs == 0 {
        return Err(ConfigError::Invalid {
            key: "sync.echo_ttl_secs".to_string(),
            reason: "a zero TTL cannot suppress any echo".to_string(),
        });
    }
    if config.sync.asset_request_marker.trim().is_empty() {
        return Err(ConfigError::Invalid {
            key: "sync.asset_request_marker".to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
