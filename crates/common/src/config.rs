use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/usbgate/config.toml";

/// Placeholder replaced by the mount target in command templates.
pub const TARGET_PLACEHOLDER: &str = "{target}";

#[derive(Debug, Clone, Deserialize)]
pub struct MitigationConfig {
    #[serde(default = "default_unmount_command")]
    pub unmount_command: Vec<String>,
    #[serde(default = "default_mount_command")]
    pub mount_command: Vec<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for MitigationConfig {
    fn default() -> Self {
        Self {
            unmount_command: default_unmount_command(),
            mount_command: default_mount_command(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl MitigationConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationMode {
    #[default]
    None,
    Polkit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationConfig {
    #[serde(default)]
    pub mode: AuthorizationMode,
    #[serde(default = "default_action_id")]
    pub action_id: String,
    /// Local user asked to authorize; required for polkit.
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default = "default_authorization_timeout")]
    pub timeout_secs: u64,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            mode: AuthorizationMode::default(),
            action_id: default_action_id(),
            uid: None,
            timeout_secs: default_authorization_timeout(),
        }
    }
}

impl AuthorizationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_title")]
    pub title: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            title: default_title(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mitigation: MitigationConfig,
    #[serde(default)]
    pub authorization: AuthorizationConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
}

pub fn default_unmount_command() -> Vec<String> {
    ["udisksctl", "unmount", "--no-user-interaction", "-b", TARGET_PLACEHOLDER]
        .map(String::from)
        .to_vec()
}

pub fn default_mount_command() -> Vec<String> {
    ["udisksctl", "mount", "--no-user-interaction", "-b", TARGET_PLACEHOLDER]
        .map(String::from)
        .to_vec()
}

pub fn default_command_timeout() -> u64 {
    30
}

pub fn default_action_id() -> String {
    "org.usbgate.authorize-device".into()
}

pub fn default_authorization_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_title() -> String {
    "USB Device Detected".into()
}

pub fn parse_config(text: &str) -> Result<Config, ConfigError> {
    let cfg: Config = toml::from_str(text)?;
    if cfg.authorization.mode == AuthorizationMode::Polkit && cfg.authorization.uid.is_none() {
        return Err(ConfigError::MissingUid);
    }
    Ok(cfg)
}

/// Loads the config file; a missing file yields defaults.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_config(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Config::default())
        }
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}
