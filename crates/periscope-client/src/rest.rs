//! HTTP control client for the camera server's REST API.
//!
//! All endpoints return HTTP 200 on success; anything else, including
//! transport failures, is surfaced to the caller with the status and body
//! for diagnostics. Stopping an already stopped stream is not an error on
//! the server side, so `stop_stream` is idempotent from the caller's view.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{error, info};

use periscope_core::wire::RestStreamRequest;
use periscope_core::StreamingConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    /// Address the streams should land on: this headset.
    headset_ip: String,
    config: StreamingConfig,
}

impl RestClient {
    /// `server_ip` is the camera server; `headset_ip` is sent as the
    /// stream destination in every request.
    pub fn new(server_ip: &str, headset_ip: &str, config: StreamingConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: format!("http://{}:{}", server_ip, periscope_core::ports::REST_API),
            headset_ip: headset_ip.to_string(),
            config,
        })
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    fn request_body(&self, config: &StreamingConfig) -> RestStreamRequest {
        // The destination is always this headset, regardless of the
        // address a (possibly stale) config snapshot carries.
        RestStreamRequest::from_config(config, &self.headset_ip)
    }

    async fn expect_ok(response: reqwest::Response, what: &str) -> Result<()> {
        let status = response.status();
        if status.as_u16() == 200 {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        error!("{what} failed with status {status}: {body}");
        Err(anyhow!("{what} failed with status {status}: {body}"))
    }

    pub async fn start_stream(&self) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/api/v1/stream/start", self.base_url))
            .json(&self.request_body(&self.config))
            .send()
            .await
            .context("start stream request failed")?;
        Self::expect_ok(response, "start stream").await?;
        info!("stream started");
        Ok(())
    }

    pub async fn stop_stream(&self) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/api/v1/stream/stop", self.base_url))
            .send()
            .await
            .context("stop stream request failed")?;
        Self::expect_ok(response, "stop stream").await?;
        info!("stream stopped");
        Ok(())
    }

    /// Push a new config; on success the local snapshot is replaced.
    pub async fn update_config(&mut self, config: StreamingConfig) -> Result<()> {
        let response = self
            .http
            .put(format!("{}/api/v1/stream/update", self.base_url))
            .json(&self.request_body(&config))
            .send()
            .await
            .context("update config request failed")?;
        Self::expect_ok(response, "update config").await?;
        info!("config updated: {config}");
        self.config = config;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_core::Resolution;

    #[test]
    fn request_body_targets_the_headset_not_the_config() {
        let mut config = StreamingConfig::default();
        config.ip = "203.0.113.9".to_string();
        let client = RestClient::new("10.0.31.42", "10.0.31.220", config).unwrap();

        let mut pushed = client.config().clone();
        pushed.ip = "198.51.100.77".to_string();
        pushed.resolution = Resolution::new(1280, 720);
        let body = client.request_body(&pushed);

        assert_eq!(body.ip_address, "10.0.31.220");
        assert_eq!(body.resolution.width, 1280);
    }

    #[test]
    fn base_url_uses_the_well_known_port() {
        let client =
            RestClient::new("10.0.31.42", "10.0.31.220", StreamingConfig::default()).unwrap();
        assert_eq!(client.base_url, "http://10.0.31.42:32281");
    }
}
