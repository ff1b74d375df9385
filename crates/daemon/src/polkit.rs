use std::collections::HashMap;

use async_trait::async_trait;
use usbgate_common::backend::{AuthorizationOutcome, Authorizer};
use usbgate_common::config::AuthorizationConfig;
use usbgate_common::error::ConfigError;
use usbgate_common::types::DeviceIdentifier;
use zbus::zvariant::Value;
use zbus::Connection;

const ALLOW_USER_INTERACTION: u32 = 1;

/// Asks polkit whether a local user authorizes remounting a device.
pub struct PolkitAuthorizer {
    conn: Connection,
    action_id: String,
    uid: u32,
}

impl PolkitAuthorizer {
    pub async fn connect(cfg: &AuthorizationConfig) -> anyhow::Result<Self> {
        let uid = cfg.uid.ok_or(ConfigError::MissingUid)?;
        let conn = Connection::system().await?;
        Ok(Self::with_connection(conn, cfg.action_id.clone(), uid))
    }

    pub fn with_connection(conn: Connection, action_id: String, uid: u32) -> Self {
        Self {
            conn,
            action_id,
            uid,
        }
    }

    async fn check_authorization(&self, identifier: &DeviceIdentifier) -> zbus::Result<bool> {
        let polkit = zbus::Proxy::new(
            &self.conn,
            "org.freedesktop.PolicyKit1",
            "/org/freedesktop/PolicyKit1/Authority",
            "org.freedesktop.PolicyKit1.Authority",
        )
        .await?;

        // subject (sa{sv}): ("unix-user", {"uid": <u32>})
        let mut subject_details: HashMap<&str, Value<'_>> = HashMap::new();
        subject_details.insert("uid", Value::from(self.uid));
        let subject = ("unix-user", subject_details);

        let device = identifier.to_string();
        let mut details: HashMap<&str, &str> = HashMap::new();
        details.insert("device", device.as_str());

        // (IsAuthorized, IsChallenge, Details)
        let (is_auth, _is_challenge, _details): (bool, bool, HashMap<String, String>) = polkit
            .call(
                "CheckAuthorization",
                &(
                    subject,
                    self.action_id.as_str(),
                    details,
                    ALLOW_USER_INTERACTION,
                    "",
                ),
            )
            .await?;
        Ok(is_auth)
    }
}

#[async_trait]
impl Authorizer for PolkitAuthorizer {
    async fn request_interactive_authorization(
        &self,
        identifier: &DeviceIdentifier,
    ) -> AuthorizationOutcome {
        match self.check_authorization(identifier).await {
            Ok(true) => AuthorizationOutcome::Granted,
            Ok(false) => AuthorizationOutcome::Denied,
            Err(e) => {
                tracing::warn!(error = %e, action_id = %self.action_id, "polkit check failed");
                AuthorizationOutcome::Unavailable
            }
        }
    }
}
