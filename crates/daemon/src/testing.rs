//! In-process stand-ins for the editing surface and render backend.

use anyhow::{anyhow, Result};
use cutsmith_engine::{
    ClipKey, ColorPreset, ColorResolver, Constraints, EditPlan, Placement, PlanStats, Section, SnapshotItem,
    TimelineSnapshot, TrackRole,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::AppState;
use crate::config::{ExportConfig, MaterializerConfig};
use crate::db::Database;
use crate::export::{ExportScheduler, RenderBackend, RenderStatus};
use crate::jobs::JobManager;
use crate::materializer::{MaterializationRecord, Materializer, RecordState};
use crate::surface::{EditingSurface, PlacementRef, PlacementWrite, TimelineHandle};

pub fn test_materializer_config() -> MaterializerConfig {
    MaterializerConfig {
        max_attempts: 3,
        base_backoff_ms: 1,
        max_backoff_ms: 5,
        placement_timeout_ms: 1000,
        fps: 25.0,
    }
}

pub fn test_export_config() -> ExportConfig {
    ExportConfig {
        poll_interval_ms: 5,
        max_poll_errors: 3,
    }
}

/// API state over an in-memory database and the given stand-ins
pub fn test_state(surface: Arc<MockSurface>, backend: Arc<MockBackend>) -> AppState {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let resolver = Arc::new(ColorResolver::builtin());
    let materializer = Arc::new(Materializer::new(
        surface,
        db.clone(),
        resolver.clone(),
        test_materializer_config(),
    ));
    let jobs = Arc::new(JobManager::new(db.clone()));
    let exports = Arc::new(ExportScheduler::new(backend, jobs, db.clone(), test_export_config()));
    AppState {
        db,
        resolver,
        materializer,
        exports,
        guide_fps: 25.0,
    }
}

/// Persist a record for `timeline` as if a materialization pass ended in `state`
pub fn store_timeline_record(db: &Database, timeline: &str, state: RecordState) {
    let mut record = MaterializationRecord::new("promo", timeline, timeline, "test-session");
    record.handle = Some(TimelineHandle(format!("handle-{timeline}")));
    record.state = state;
    let json = serde_json::to_string(&record).unwrap();
    db.store_record("promo", timeline, timeline, &json, state.as_str()).unwrap();
}

/// One section of `n` one-second primary placements from distinct clips
pub fn sample_plan(n: usize) -> EditPlan {
    let second = 48_000;
    let placements: Vec<Placement> = (0..n)
        .map(|i| Placement {
            clip: ClipKey::from_path(&format!("/shoot/clip_{i}.mov")),
            in_ticks: 0,
            out_ticks: second,
            record_in_ticks: i as i64 * second,
            track: TrackRole::Primary,
            preset_id: "sony_slog3".to_string(),
            speaker: None,
        })
        .collect();
    let total = n as i64 * second;

    EditPlan {
        sections: vec![Section {
            name: "story".to_string(),
            ordinal: 0,
            target_duration_ticks: total,
            placements,
        }],
        constraints: Constraints::default(),
        stats: PlanStats {
            target_duration_ticks: total,
            total_duration_ticks: total,
            duration_within_tolerance: true,
            primary_ticks: total,
            broll_ticks: 0,
            audio_only_ticks: 0,
            broll_ratio: 0.0,
            per_speaker_ticks: BTreeMap::new(),
            speaker_shortfalls: Vec::new(),
        },
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SurfaceCounts {
    pub creates: usize,
    pub placement_writes: usize,
    pub preset_writes: usize,
    pub reads: usize,
}

#[derive(Default)]
pub struct SurfaceState {
    pub create_returns_none: bool,
    /// Writes for these keys always answer null
    pub failing_keys: HashSet<String>,
    /// Writes for these keys land but answer null once
    pub lost_ack_keys: HashSet<String>,
    pub failing_preset_keys: HashSet<String>,
    pub write_delay: Option<Duration>,
    pub items: Vec<SnapshotItem>,
    pub counts: SurfaceCounts,
}

#[derive(Default)]
pub struct MockSurface {
    state: Mutex<SurfaceState>,
}

impl MockSurface {
    pub fn set(&self, f: impl FnOnce(&mut SurfaceState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn counts(&self) -> SurfaceCounts {
        self.state.lock().unwrap().counts
    }

    pub fn items(&self) -> Vec<SnapshotItem> {
        self.state.lock().unwrap().items.clone()
    }

    pub fn remove_item(&self, key: &str) {
        self.state.lock().unwrap().items.retain(|item| item.key != key);
    }
}

#[async_trait::async_trait]
impl EditingSurface for MockSurface {
    async fn create_timeline(&self, name: &str) -> Result<Option<TimelineHandle>> {
        let mut state = self.state.lock().unwrap();
        state.counts.creates += 1;
        if state.create_returns_none {
            Ok(None)
        } else {
            Ok(Some(TimelineHandle(format!("handle-{name}"))))
        }
    }

    async fn add_placement(&self, _handle: &TimelineHandle, placement: &PlacementWrite) -> Result<bool> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.counts.placement_writes += 1;
            state.write_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.failing_keys.contains(&placement.key) {
            return Ok(false);
        }
        state.items.push(SnapshotItem {
            key: placement.key.clone(),
            clip: placement.clip.clone(),
            track: placement.track,
            in_ticks: placement.in_ticks,
            out_ticks: placement.out_ticks,
            preset_id: None,
        });
        Ok(!state.lost_ack_keys.remove(&placement.key))
    }

    async fn apply_color_preset(
        &self,
        _handle: &TimelineHandle,
        placement: &PlacementRef,
        preset: &ColorPreset,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.counts.preset_writes += 1;
        if state.failing_preset_keys.contains(&placement.key) {
            return Err(anyhow!("grading node unavailable"));
        }
        match state.items.iter_mut().find(|item| item.key == placement.key) {
            Some(item) => {
                item.preset_id = Some(preset.id.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn read_timeline_state(&self, _handle: &TimelineHandle) -> Result<TimelineSnapshot> {
        let mut state = self.state.lock().unwrap();
        state.counts.reads += 1;
        Ok(TimelineSnapshot {
            items: state.items.clone(),
        })
    }
}

/// Scripted render backend: each preset walks its own status script
#[derive(Default)]
pub struct MockBackend {
    scripts: Mutex<HashMap<String, Vec<Result<RenderStatus, String>>>>,
    jobs: Mutex<HashMap<String, (String, usize)>>,
    pub cancelled: Mutex<Vec<String>>,
    submitted: Mutex<usize>,
}

impl MockBackend {
    /// Statuses returned by successive polls; the last one repeats
    pub fn script(&self, preset: &str, statuses: Vec<Result<RenderStatus, String>>) {
        self.scripts.lock().unwrap().insert(preset.to_string(), statuses);
    }

    pub fn submitted(&self) -> usize {
        *self.submitted.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl RenderBackend for MockBackend {
    async fn submit_render_job(&self, handle: &TimelineHandle, preset: &str) -> Result<String> {
        let mut submitted = self.submitted.lock().unwrap();
        *submitted += 1;
        let id = format!("{handle}/{preset}/{}", *submitted);
        self.jobs.lock().unwrap().insert(id.clone(), (preset.to_string(), 0));
        Ok(id)
    }

    async fn poll_job(&self, external_id: &str) -> Result<RenderStatus> {
        let mut jobs = self.jobs.lock().unwrap();
        let (preset, polls) = jobs
            .get_mut(external_id)
            .ok_or_else(|| anyhow!("unknown render job {external_id}"))?;
        let scripts = self.scripts.lock().unwrap();
        let script = scripts.get(preset.as_str());
        let step = script
            .and_then(|s| s.get(*polls).or_else(|| s.last()))
            .cloned()
            .unwrap_or(Ok(RenderStatus::Complete));
        *polls += 1;
        step.map_err(|e| anyhow!(e))
    }

    async fn cancel_job(&self, external_id: &str) -> Result<()> {
        self.cancelled.lock().unwrap().push(external_id.to_string());
        Ok(())
    }
}
