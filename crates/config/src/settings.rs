use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub app: AppSettings,
    pub hpb: HpbSettings,
    pub storage: StorageSettings,
    pub tls: TlsSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSettings {
    /// Application id registered with the host platform.
    pub id: String,
    /// Shared secret used by the host platform to authenticate control calls.
    pub secret: String,
    pub version: String,
    pub port: u16,
    /// Base URL of the host platform (used for OCS calls and the signaling backend URL).
    pub platform_url: String,
    /// When set, the control API listens on a Unix domain socket instead of TCP.
    pub shared_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HpbSettings {
    /// Signaling server URL. Empty disables call handling until configured.
    pub url: String,
    /// Internal secret for the HMAC hello handshake with the HPB.
    pub internal_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    /// Persistent root under which per-language model directories live.
    pub persistent_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsSettings {
    /// Disable certificate verification for wss/https (test deployments only).
    pub skip_cert_verify: bool,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::default().separator("__").prefix("CALLSCRIBE"))
            .set_default("app.id", "")?
            .set_default("app.secret", "")?
            .set_default("app.version", "1.0.0")?
            .set_default("app.port", 23000)?
            .set_default("app.platform_url", "")?
            .set_default("hpb.url", "")?
            .set_default("hpb.internal_secret", "")?
            .set_default("storage.persistent_dir", "/var/lib/callscribe")?
            .set_default("tls.skip_cert_verify", false)?;

        // The host platform deploys the service with a fixed set of well-known
        // environment variables; map them onto the settings tree.
        for (var, key) in [
            ("APP_ID", "app.id"),
            ("APP_SECRET", "app.secret"),
            ("APP_VERSION", "app.version"),
            ("APP_PORT", "app.port"),
            ("APP_HOST_URL", "app.platform_url"),
            ("HP_SHARED_KEY", "app.shared_key"),
            ("CS_HPB_URL", "hpb.url"),
            ("CS_INTERNAL_SECRET", "hpb.internal_secret"),
            ("APP_PERSISTENT_STORAGE", "storage.persistent_dir"),
        ] {
            builder = builder.set_override_option(key, std::env::var(var).ok())?;
        }
        if let Ok(skip) = std::env::var("SKIP_CERT_VERIFY") {
            builder =
                builder.set_override("tls.skip_cert_verify", skip == "true" || skip == "1")?;
        }

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validates the fields without which the service cannot start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app.id.is_empty() {
            return Err(ConfigError::Message("app.id (APP_ID) is required".into()));
        }
        if self.app.secret.is_empty() {
            return Err(ConfigError::Message(
                "app.secret (APP_SECRET) is required".into(),
            ));
        }
        Ok(())
    }

    /// Control-plane URL the HPB uses to call back into the host platform.
    pub fn signaling_backend_url(&self) -> String {
        format!(
            "{}/ocs/v2.php/apps/spreed/api/v3/signaling/backend",
            self.app.platform_url.trim_end_matches('/')
        )
    }
}
