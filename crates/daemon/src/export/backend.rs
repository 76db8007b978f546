use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::surface::TimelineHandle;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RenderStatus {
    Queued,
    Rendering {
        #[serde(default)]
        progress: f64,
    },
    Complete,
    Failed {
        #[serde(default)]
        error: String,
    },
}

#[async_trait::async_trait]
pub trait RenderBackend: Send + Sync {
    /// Submit a render of the timeline with one export preset, returning the backend's job id
    async fn submit_render_job(&self, handle: &TimelineHandle, preset: &str) -> Result<String>;

    async fn poll_job(&self, external_id: &str) -> Result<RenderStatus>;

    async fn cancel_job(&self, _external_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Render queue of the editing surface, reached through its scripting bridge
pub struct BridgeRenderBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: String,
}

impl BridgeRenderBackend {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(BridgeRenderBackend {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            Err(anyhow::anyhow!("Render backend error: {} - {}", status, error_text))
        }
    }
}

#[async_trait::async_trait]
impl RenderBackend for BridgeRenderBackend {
    async fn submit_render_job(&self, handle: &TimelineHandle, preset: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/renders", self.base_url))
            .json(&serde_json::json!({ "timeline": handle, "preset": preset }))
            .send()
            .await?;
        let body: SubmitResponse = Self::check(response).await?.json().await?;
        Ok(body.job_id)
    }

    async fn poll_job(&self, external_id: &str) -> Result<RenderStatus> {
        let response = self
            .client
            .get(format!("{}/renders/{}", self.base_url, external_id))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn cancel_job(&self, external_id: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/renders/{}/cancel", self.base_url, external_id))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
