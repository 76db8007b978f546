use anyhow::Result;
use cutsmith_engine::{ColorPreset, TimelineSnapshot};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

use super::{EditingSurface, PlacementRef, PlacementWrite, TimelineHandle};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the editing surface's scripting bridge
pub struct BridgeSurface {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct CreateTimelineResponse {
    handle: Option<String>,
}

#[derive(Deserialize)]
struct WriteResponse {
    #[serde(default)]
    ok: bool,
}

#[derive(Serialize)]
struct GradeRequest<'a> {
    placement: &'a PlacementRef,
    preset: &'a ColorPreset,
}

impl BridgeSurface {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(BridgeSurface {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            Ok(response.json().await?)
        } else {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            Err(anyhow::anyhow!("Editing surface error: {} - {}", status, error_text))
        }
    }
}

#[async_trait::async_trait]
impl EditingSurface for BridgeSurface {
    async fn create_timeline(&self, name: &str) -> Result<Option<TimelineHandle>> {
        let response = self
            .client
            .post(format!("{}/timelines", self.base_url))
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        let body: CreateTimelineResponse = Self::parse(response).await?;
        Ok(body.handle.map(TimelineHandle))
    }

    async fn add_placement(&self, handle: &TimelineHandle, placement: &PlacementWrite) -> Result<bool> {
        let response = self
            .client
            .post(format!("{}/timelines/{}/placements", self.base_url, handle))
            .json(placement)
            .send()
            .await?;
        let body: WriteResponse = Self::parse(response).await?;
        Ok(body.ok)
    }

    async fn apply_color_preset(
        &self,
        handle: &TimelineHandle,
        placement: &PlacementRef,
        preset: &ColorPreset,
    ) -> Result<bool> {
        let response = self
            .client
            .post(format!("{}/timelines/{}/grades", self.base_url, handle))
            .json(&GradeRequest { placement, preset })
            .send()
            .await?;
        let body: WriteResponse = Self::parse(response).await?;
        Ok(body.ok)
    }

    async fn read_timeline_state(&self, handle: &TimelineHandle) -> Result<TimelineSnapshot> {
        let response = self
            .client
            .get(format!("{}/timelines/{}/state", self.base_url, handle))
            .send()
            .await?;
        Self::parse(response).await
    }
}
