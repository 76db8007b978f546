//! The external editing surface the materializer writes to.
//!
//! Its scripting interface answers writes with a value or null; `Ok(None)` and
//! `Ok(false)` model the null answer, `Err` a transport failure. Callers treat
//! both the same way.

use anyhow::Result;
use cutsmith_engine::{ColorPreset, TimelineSnapshot, TrackRole};
use serde::{Deserialize, Serialize};

pub mod bridge;

pub use bridge::BridgeSurface;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimelineHandle(pub String);

impl std::fmt::Display for TimelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One placement write; `key` is stored on the surface item for duplicate detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementWrite {
    pub key: String,
    pub clip: String,
    pub in_ticks: i64,
    pub out_ticks: i64,
    pub track: TrackRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRef {
    pub key: String,
}

#[async_trait::async_trait]
pub trait EditingSurface: Send + Sync {
    async fn create_timeline(&self, name: &str) -> Result<Option<TimelineHandle>>;

    async fn add_placement(&self, handle: &TimelineHandle, placement: &PlacementWrite) -> Result<bool>;

    async fn apply_color_preset(
        &self,
        handle: &TimelineHandle,
        placement: &PlacementRef,
        preset: &ColorPreset,
    ) -> Result<bool>;

    async fn read_timeline_state(&self, handle: &TimelineHandle) -> Result<TimelineSnapshot>;
}
