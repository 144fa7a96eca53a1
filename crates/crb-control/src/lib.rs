//! Control service adapter (HTTP).
//!
//! Talks to `<base>/api/key/{key}/action/{start|stop|data}`.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crb_core::{
    config::Config,
    domain::{ApiKey, ControlAction},
    errors::Error,
    keys::action_url,
    ports::ControlApi,
    status::StatusRecord,
    Result,
};

#[derive(Clone, Debug)]
pub struct HttpControlClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpControlClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::External(format!("http client build error: {e}")))?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(cfg.control_base_url.clone(), cfg.control_timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, req: reqwest::RequestBuilder, action: ControlAction) -> Result<reqwest::Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Control(format!("{} request error: {e}", action.as_path())))?;

        let status = resp.status();
        debug!(action = action.as_path(), %status, "control service responded");
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Control(format!(
                "{} failed: {status} {}",
                action.as_path(),
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ControlApi for HttpControlClient {
    async fn trigger(&self, api_key: &ApiKey, action: ControlAction) -> Result<()> {
        let url = action_url(&self.base_url, api_key, action);
        self.send(self.http.post(url), action).await?;
        Ok(())
    }

    async fn status(&self, api_key: &ApiKey) -> Result<StatusRecord> {
        let url = action_url(&self.base_url, api_key, ControlAction::Data);
        let resp = self.send(self.http.get(url), ControlAction::Data).await?;

        let body = resp
            .text()
            .await
            .map_err(|e| Error::Control(format!("data body read error: {e}")))?;

        StatusRecord::from_json(&body)
            .map_err(|e| Error::MalformedResponse(format!("data: {e}")))
    }
}
