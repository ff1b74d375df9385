use std::path::PathBuf;

use thiserror::Error;

use crate::types::MountCommand;

/// Subscribing to device attach events failed. Fatal at startup.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("device monitor setup failed")]
    Monitor(#[source] std::io::Error),
    #[error("enumerating attached devices failed")]
    Enumerate(#[source] std::io::Error),
    #[error("device event source exited before reporting readiness")]
    SourceGone,
}

#[derive(Debug, Error)]
pub enum MitigationError {
    #[error("no {0} command configured")]
    EmptyTemplate(MountCommand),
    #[error("failed to launch {program}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// Unmount of a target that has no mounted filesystem; access is already blocked.
    #[error("{0} is not mounted")]
    NotMounted(String),
    #[error("{command} exited with status {code:?}: {stderr}")]
    Exit {
        command: MountCommand,
        code: Option<i32>,
        stderr: String,
    },
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config")]
    Parse(#[from] toml::de::Error),
    #[error("authorization mode \"polkit\" requires authorization.uid")]
    MissingUid,
}
