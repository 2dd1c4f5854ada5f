use std::time::Duration;

use callscribe_config::Settings;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::auth::encode_auth;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("platform returned status {0}")]
    Status(u16),
    #[error("malformed platform response: {0}")]
    Malformed(String),
}

/// Authenticated HTTP client for the host platform's OCS API.
///
/// All requests carry the app id/version headers and the `user:secret`
/// authorization expected by the platform's app gateway.
#[derive(Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    base_url: String,
    app_id: String,
    app_version: String,
    app_secret: String,
}

impl PlatformClient {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(settings.tls.skip_cert_verify)
            .build()?;

        Ok(Self {
            http,
            base_url: settings.app.platform_url.trim_end_matches('/').to_string(),
            app_id: settings.app.id.clone(),
            app_version: settings.app.version.clone(),
            app_secret: settings.app.secret.clone(),
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// GET an OCS endpoint and return the unwrapped `ocs.data` payload.
    pub async fn ocs_get(&self, path: &str, user_id: &str) -> Result<Value, PlatformError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .headers(self.headers(user_id))
            .send()
            .await?;
        self.unwrap_ocs(&url, resp).await
    }

    /// POST a JSON body to an OCS endpoint and return the unwrapped `ocs.data` payload.
    pub async fn ocs_post(
        &self,
        path: &str,
        user_id: &str,
        body: &Value,
    ) -> Result<Value, PlatformError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .headers(self.headers(user_id))
            .json(body)
            .send()
            .await?;
        self.unwrap_ocs(&url, resp).await
    }

    /// PUT a JSON body to an OCS endpoint and return the unwrapped `ocs.data` payload.
    pub async fn ocs_put(
        &self,
        path: &str,
        user_id: &str,
        body: &Value,
    ) -> Result<Value, PlatformError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .put(&url)
            .headers(self.headers(user_id))
            .json(body)
            .send()
            .await?;
        self.unwrap_ocs(&url, resp).await
    }

    /// Reports init progress (0-100) back to the platform's app gateway.
    /// 100 means init is complete and triggers auto-enable.
    pub async fn set_init_status(&self, progress: i32) -> Result<(), PlatformError> {
        let path = format!("/ocs/v1.php/apps/app_api/apps/status/{}", self.app_id);
        let body = serde_json::json!({ "progress": progress, "error": "" });
        self.ocs_put(&path, "", &body).await?;
        Ok(())
    }

    fn headers(&self, user_id: &str) -> reqwest::header::HeaderMap {
        use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};

        let mut headers = HeaderMap::new();
        headers.insert(
            "EX-APP-ID",
            HeaderValue::from_str(&self.app_id).unwrap_or(HeaderValue::from_static("")),
        );
        headers.insert(
            "EX-APP-VERSION",
            HeaderValue::from_str(&self.app_version).unwrap_or(HeaderValue::from_static("")),
        );
        headers.insert(
            "AUTHORIZATION-APP-API",
            HeaderValue::from_str(&encode_auth(user_id, &self.app_secret))
                .unwrap_or(HeaderValue::from_static("")),
        );
        headers.insert("OCS-APIRequest", HeaderValue::from_static("true"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers
    }

    async fn unwrap_ocs(
        &self,
        url: &str,
        resp: reqwest::Response,
    ) -> Result<Value, PlatformError> {
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            warn!(url, status = status.as_u16(), "OCS request failed");
            return Err(PlatformError::Status(status.as_u16()));
        }

        let parsed: Value = serde_json::from_str(&body)
            .map_err(|e| PlatformError::Malformed(format!("invalid JSON: {e}")))?;
        parsed
            .get("ocs")
            .and_then(|ocs| ocs.get("data"))
            .cloned()
            .ok_or_else(|| PlatformError::Malformed("missing ocs.data".into()))
    }
}
