use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pty_manager::PtyConfig;
use serde::{Deserialize, Serialize};

use crate::manager::ManagerSettings;
use crate::protocol::{DataEncoding, InstanceId};
use crate::transport::DialerConfig;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [connection]
//                    url = "wss://router.example:8443/instances"
//
//   env var:         WEBSHELL_CONNECTION__URL=wss://...   (double underscore = nesting)
//
// CLI flags are applied on top of the extracted struct.

pub const ENV_PREFIX: &str = "WEBSHELL_";

/// Floor for `backoff_ms`, so a dial that fails instantly cannot spin.
pub const MIN_BACKOFF_MS: u64 = 50;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    /// Where the instance identity is persisted (default
    /// `~/.config/instance/client_id.txt`).
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

/// Router connection (lives under `[connection]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// Skip TLS certificate verification.
    #[serde(default)]
    pub insecure: bool,
    /// Extra handshake headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            insecure: false,
            headers: BTreeMap::new(),
            backoff_ms: default_backoff_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// Spawned shells (lives under `[session]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionFileConfig {
    /// Shell command; `$SHELL` or `/bin/bash` when unset.
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub encoding: DataEncoding,
}

fn default_url() -> String {
    "wss://localhost:8080/echo".to_string()
}
fn default_backoff_ms() -> u64 {
    1000
}
fn default_dial_timeout_ms() -> u64 {
    10_000
}
fn default_write_timeout_ms() -> u64 {
    5_000
}
fn default_outbound_queue() -> usize {
    256
}

/// `~/.config/instance/config.toml`, if a home directory exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join("instance").join("config.toml"))
}

/// Build a figment that layers: defaults → config.toml → WEBSHELL_* env vars.
///
/// A missing config file is not an error.
///   `WEBSHELL_CONNECTION__BACKOFF_MS=250`  →  `connection.backoff_ms = 250`
///   `WEBSHELL_SESSION__SHELL=/bin/zsh`     →  `session.shell = "/bin/zsh"`
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

// =============================================================================
// Runtime views
// =============================================================================

impl ConnectionFileConfig {
    pub fn dialer_config(&self) -> DialerConfig {
        DialerConfig {
            insecure: self.insecure,
            timeout: Duration::from_millis(self.dial_timeout_ms),
        }
    }

    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl FileConfig {
    pub fn manager_settings(&self, identity: InstanceId) -> ManagerSettings {
        ManagerSettings {
            identity,
            backoff: Duration::from_millis(self.connection.backoff_ms.max(MIN_BACKOFF_MS)),
            write_timeout: Duration::from_millis(self.connection.write_timeout_ms),
            outbound_queue: self.connection.outbound_queue,
            encoding: self.session.encoding,
        }
    }
}

impl SessionFileConfig {
    pub fn pty_config(&self) -> PtyConfig {
        let mut config = PtyConfig::default();
        if let Some(shell) = &self.shell {
            config.command = shell.clone();
        }
        config.args = self.args.clone();
        config
    }
}
