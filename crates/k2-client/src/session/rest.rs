//! HTTPS management API session

use std::time::Duration;

use async_trait::async_trait;
use k2_core::{ApiGeneration, DeviceState, LocalImage};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use tracing::{debug, info, instrument};
use url::Url;

use super::DeviceSession;
use crate::config::{DeviceConfig, TimeoutsConfig};
use crate::error::{DeviceError, Result};

/// Endpoint the upgrade files are posted to
const UPGRADE_PATH: &str = "admin/upgrade";

/// REST session against one device
///
/// Devices ship self-signed certificates, so certificate validation is
/// switched off for this client. Every request carries HTTP basic auth.
#[derive(Debug, Clone)]
pub struct RestSession {
    client: Client,
    base_url: Url,
    generation: ApiGeneration,
    user: String,
    password: String,
    upload_timeout: Duration,
}

impl RestSession {
    /// Build a session for `https://{host}/api/{generation}`
    ///
    /// No request is made; use [`RestSession::connect`] to also open and
    /// verify the API.
    pub fn new(device: &DeviceConfig, timeouts: &TimeoutsConfig) -> Result<Self> {
        let base_url = format!("https://{}/api/{}", device.host, device.api);
        Self::with_base_url(
            &base_url,
            device.api,
            &device.user,
            &device.password,
            timeouts,
        )
    }

    /// Build a session for an explicit API root (plain HTTP allowed)
    pub fn with_base_url(
        base_url: &str,
        generation: ApiGeneration,
        user: &str,
        password: &str,
        timeouts: &TimeoutsConfig,
    ) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_millis(timeouts.request_ms))
            .connect_timeout(Duration::from_millis(timeouts.connect_ms))
            .build()
            .map_err(DeviceError::Http)?;

        // Url::join drops the last segment unless the base ends with '/'
        let base_url = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))?;

        Ok(Self {
            client,
            base_url,
            generation,
            user: user.to_string(),
            password: password.to_string(),
            upload_timeout: Duration::from_millis(timeouts.upload_ms),
        })
    }

    /// Build, open and verify a session
    pub async fn connect(device: &DeviceConfig, timeouts: &TimeoutsConfig) -> Result<Self> {
        let session = Self::new(device, timeouts)?;
        session.open().await?;
        session.check_api().await?;
        Ok(session)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn generation(&self) -> ApiGeneration {
        self.generation
    }

    /// POST the API root, which starts a session on the device
    #[instrument(skip(self))]
    pub async fn open(&self) -> Result<()> {
        let url = self.base_url.clone();
        debug!("Opening session at {}", url);
        let response = self.authed(self.client.post(url)).send().await?;
        Self::check_status(response).await.map(|_| ())
    }

    /// Read `/system/inventory` to make sure the API answers, returning the
    /// oscillator type it reports
    #[instrument(skip(self))]
    pub async fn check_api(&self) -> Result<Option<String>> {
        let inventory = self.get_resource("/system/inventory").await?;
        let oscillator = inventory
            .pointer("/inventory/oscillator")
            .and_then(Value::as_str)
            .map(str::to_owned);
        info!(
            "API {} at {} is up (oscillator: {})",
            self.generation,
            self.base_url,
            oscillator.as_deref().unwrap_or("unknown")
        );
        Ok(oscillator)
    }

    // =========================================================================
    // Helper Methods
    // =========================================================================

    fn build_url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(Into::into)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.user, Some(&self.password))
    }

    async fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let message = response
                .text()
                .await
                .ok()
                .filter(|body| !body.trim().is_empty())
                .unwrap_or_else(|| format!("HTTP {}", status));
            Err(DeviceError::http_status(status.as_u16(), message))
        }
    }

    async fn handle_json(response: Response) -> Result<Value> {
        Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| DeviceError::Parse(e.to_string()))
    }
}

#[async_trait]
impl DeviceSession for RestSession {
    #[instrument(skip(self))]
    async fn get_state(&self) -> Result<DeviceState> {
        let state = self.get_resource("/system/state").await?;
        let inventory = self.get_resource("/system/inventory").await?;
        Ok(DeviceState::reachable()
            .apply_state_record(&state)
            .apply_inventory_record(&inventory))
    }

    async fn get_resource(&self, path: &str) -> Result<Value> {
        let url = self.build_url(path)?;
        debug!("GET {}", url);
        let response = self.authed(self.client.get(url)).send().await?;
        Self::handle_json(response).await
    }

    async fn put_resource(&self, path: &str, body: &Value) -> Result<u16> {
        let url = self.build_url(path)?;
        debug!("PUT {}", url);
        let response = self.authed(self.client.put(url).json(body)).send().await?;
        Ok(Self::check_status(response).await?.status().as_u16())
    }

    async fn post_resource(&self, path: &str, body: &Value) -> Result<u16> {
        let url = self.build_url(path)?;
        debug!("POST {}", url);
        let response = self.authed(self.client.post(url).json(body)).send().await?;
        Ok(Self::check_status(response).await?.status().as_u16())
    }

    async fn delete_resource(&self, path: &str) -> Result<u16> {
        let url = self.build_url(path)?;
        debug!("DELETE {}", url);
        // The API rejects a DELETE without a body
        let request = self.client.delete(url).json(&serde_json::json!({}));
        let response = self.authed(request).send().await?;
        Ok(Self::check_status(response).await?.status().as_u16())
    }

    #[instrument(skip(self, image), fields(version = %image.descriptor.version))]
    async fn install_image(&self, image: &LocalImage) -> Result<()> {
        let url = self.build_url(UPGRADE_PATH)?;
        let auth = tokio::fs::read(&image.auth_path).await?;
        let binary = tokio::fs::read(&image.image_path).await?;
        info!(
            "Uploading {} ({} bytes) and {} to {}",
            image.descriptor.name,
            binary.len(),
            image.descriptor.auth_name,
            url
        );

        let form = Form::new()
            .part(
                "authfile",
                Part::bytes(auth).file_name(image.descriptor.auth_name.clone()),
            )
            .part(
                "upgradefile",
                Part::bytes(binary).file_name(image.descriptor.name.clone()),
            );

        let request = self
            .client
            .post(url)
            .multipart(form)
            .timeout(self.upload_timeout);
        let response = self.authed(request).send().await?;
        Self::check_status(response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(api: ApiGeneration) -> DeviceConfig {
        DeviceConfig {
            host: "10.241.54.221".into(),
            api,
            user: "admin".into(),
            password: "secret".into(),
        }
    }

    #[test]
    fn test_base_url_includes_generation() {
        let session = RestSession::new(&device(ApiGeneration::V1), &TimeoutsConfig::default()).unwrap();
        assert_eq!(session.base_url().as_str(), "https://10.241.54.221/api/v1/");
        assert_eq!(session.generation(), ApiGeneration::V1);
    }

    #[test]
    fn test_paths_join_under_api_root() {
        let session = RestSession::new(&device(ApiGeneration::V2), &TimeoutsConfig::default()).unwrap();
        assert_eq!(
            session.build_url("/system/state").unwrap().as_str(),
            "https://10.241.54.221/api/v2/system/state"
        );
        assert_eq!(
            session.build_url("ntp/servers/1").unwrap().as_str(),
            "https://10.241.54.221/api/v2/ntp/servers/1"
        );
    }
}
