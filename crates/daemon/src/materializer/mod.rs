//! Timeline Materializer
//!
//! Pushes a compiled plan onto the external editing surface as a resumable,
//! verified transaction. Every write is read back; the outcome of every pass is
//! persisted as a [`MaterializationRecord`].

use cutsmith_engine::{diff_snapshot, expected_items, ColorResolver, EditPlan, PlacementKey, Placement};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::MaterializerConfig;
use crate::db::Database;
use crate::surface::{EditingSurface, PlacementRef, PlacementWrite, TimelineHandle};

mod lock;
pub mod record;

use lock::TimelineLocks;
pub use record::{DegradationReport, FailurePoint, MaterializationRecord, PresetFailure, RecordState};

#[derive(Error, Debug)]
pub enum MaterializationError {
    #[error("Editing surface is read-only")]
    SurfaceReadOnly(Box<DegradationReport>),

    #[error("Verification failed")]
    VerificationFailed(Box<DegradationReport>),

    #[error("Materialization in progress for timeline {timeline}")]
    LockContention { timeline: String },

    #[error("Failed to persist materialization record: {0}")]
    Persistence(String),
}

impl MaterializationError {
    pub fn report(&self) -> Option<&DegradationReport> {
        match self {
            MaterializationError::SurfaceReadOnly(report) | MaterializationError::VerificationFailed(report) => {
                Some(report)
            }
            _ => None,
        }
    }
}

fn persistence(err: anyhow::Error) -> MaterializationError {
    MaterializationError::Persistence(err.to_string())
}

/// External timeline name for a plan: project plus a short plan version
pub fn timeline_name(project: &str, plan_version: &str) -> String {
    let short: String = plan_version.chars().take(12).collect();
    format!("{}-{}", project, short)
}

enum WriteOutcome {
    Written,
    /// Already on the surface from an earlier, unacknowledged write
    Adopted,
}

pub struct Materializer {
    surface: Arc<dyn EditingSurface>,
    db: Arc<Database>,
    resolver: Arc<ColorResolver>,
    config: MaterializerConfig,
    locks: TimelineLocks,
    read_only: AtomicBool,
    session_id: String,
}

impl Materializer {
    pub fn new(
        surface: Arc<dyn EditingSurface>,
        db: Arc<Database>,
        resolver: Arc<ColorResolver>,
        config: MaterializerConfig,
    ) -> Self {
        Materializer {
            surface,
            db,
            resolver,
            config,
            locks: TimelineLocks::default(),
            read_only: AtomicBool::new(false),
            session_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn load_record(&self, project: &str, plan_version: &str) -> Result<Option<MaterializationRecord>, MaterializationError> {
        let Some(json) = self.db.get_record(project, plan_version).map_err(persistence)? else {
            return Ok(None);
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| MaterializationError::Persistence(e.to_string()))
    }

    fn save(&self, record: &mut MaterializationRecord) -> Result<(), MaterializationError> {
        record.updated_at = chrono::Utc::now();
        let json = serde_json::to_string(record).map_err(|e| MaterializationError::Persistence(e.to_string()))?;
        self.db
            .store_record(
                &record.project,
                &record.plan_version,
                &record.timeline_name,
                &json,
                record.state.as_str(),
            )
            .map_err(persistence)
    }

    pub async fn materialize(&self, project: &str, plan: &EditPlan) -> Result<MaterializationRecord, MaterializationError> {
        let version = plan.version();
        let name = timeline_name(project, &version);
        let total = plan.placement_count();

        let _guard = self
            .locks
            .try_acquire(&name)
            .ok_or_else(|| MaterializationError::LockContention { timeline: name.clone() })?;

        let mut record = self
            .load_record(project, &version)?
            .unwrap_or_else(|| MaterializationRecord::new(project, &version, &name, &self.session_id));

        // Re-verification only reads, so it still runs on a read-only surface
        if self.is_read_only() && record.state != RecordState::FullyApplied {
            let mut report = record.report(total);
            report.state = RecordState::SurfaceReadOnly;
            return Err(MaterializationError::SurfaceReadOnly(Box::new(report)));
        }

        record.session_id = self.session_id.clone();
        record.attempts += 1;

        info!(
            project = %project,
            timeline = %name,
            state = record.state.as_str(),
            applied = record.applied.len(),
            total,
            "Materializing plan"
        );

        if record.state == RecordState::FullyApplied {
            return self.reverify(record, plan, total).await;
        }

        record.failure = None;
        let handle = match record.handle.clone() {
            Some(handle) => handle,
            None => self.create_timeline(&mut record, total).await?,
        };
        record.state = RecordState::PartiallyApplied;
        self.save(&mut record)?;

        self.apply_placements(&mut record, &handle, plan, total).await?;
        self.apply_presets(&mut record, &handle, plan).await?;

        record.state = RecordState::FullyApplied;
        self.save(&mut record)?;
        info!(
            timeline = %name,
            placements = record.applied.len(),
            preset_failures = record.preset_failures.len(),
            "Plan fully applied"
        );
        Ok(record)
    }

    async fn create_timeline(
        &self,
        record: &mut MaterializationRecord,
        total: usize,
    ) -> Result<TimelineHandle, MaterializationError> {
        let created = tokio::time::timeout(
            self.config.placement_timeout(),
            self.surface.create_timeline(&record.timeline_name),
        )
        .await;

        match created {
            Ok(Ok(Some(handle))) => {
                info!(timeline = %record.timeline_name, handle = %handle, "Created external timeline");
                record.handle = Some(handle.clone());
                Ok(handle)
            }
            other => {
                let reason = match other {
                    Ok(Ok(_)) => "create timeline returned null".to_string(),
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "create timeline timed out".to_string(),
                };
                warn!(timeline = %record.timeline_name, reason = %reason, "Editing surface is read-only for this session");
                self.read_only.store(true, Ordering::SeqCst);
                record.state = RecordState::SurfaceReadOnly;
                self.save(record)?;
                Err(MaterializationError::SurfaceReadOnly(Box::new(record.report(total))))
            }
        }
    }

    async fn apply_placements(
        &self,
        record: &mut MaterializationRecord,
        handle: &TimelineHandle,
        plan: &EditPlan,
        total: usize,
    ) -> Result<(), MaterializationError> {
        let resume_from = record.applied.len();
        if resume_from > 0 {
            info!(timeline = %record.timeline_name, resume_from, "Resuming materialization");
        }

        for (plan_index, (ordinal, index, placement)) in plan.placements().enumerate().skip(resume_from) {
            let key = PlacementKey::new(&record.timeline_name, ordinal, index).to_string();
            let write = PlacementWrite {
                key: key.clone(),
                clip: placement.clip.to_string(),
                in_ticks: placement.in_ticks,
                out_ticks: placement.out_ticks,
                track: placement.track,
            };

            let outcome = tokio::time::timeout(self.config.placement_timeout(), self.write_with_retry(handle, &write))
                .await
                .unwrap_or_else(|_| Err(format!("timed out after {}ms", self.config.placement_timeout_ms)));

            match outcome {
                Ok(outcome) => {
                    if let WriteOutcome::Adopted = outcome {
                        debug!(key = %key, "Placement already present, adopted");
                    } else {
                        debug!(key = %key, "Placement written and verified");
                    }
                    record.applied.push(key);
                    self.save(record)?;
                }
                Err(reason) => {
                    warn!(key = %key, plan_index, reason = %reason, "Placement failed, halting materialization");
                    record.state = RecordState::VerificationFailed;
                    record.failure = Some(FailurePoint { plan_index, key, reason });
                    self.save(record)?;
                    return Err(MaterializationError::VerificationFailed(Box::new(record.report(total))));
                }
            }
        }
        Ok(())
    }

    async fn write_with_retry(&self, handle: &TimelineHandle, write: &PlacementWrite) -> Result<WriteOutcome, String> {
        let mut last_error = String::from("no attempts made");

        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.backoff(attempt - 1)).await;
            }

            // Duplicate detection: a lost acknowledgement must not produce a second item
            match self.surface.read_timeline_state(handle).await {
                Ok(snapshot) => {
                    if let Some(existing) = snapshot.find(&write.key) {
                        if existing.clip == write.clip
                            && existing.track == write.track
                            && existing.in_ticks == write.in_ticks
                            && existing.out_ticks == write.out_ticks
                        {
                            return Ok(WriteOutcome::Adopted);
                        }
                        return Err(format!("conflicting item already on timeline under {}", write.key));
                    }
                }
                Err(e) => {
                    last_error = format!("snapshot read failed: {}", e);
                    warn!(key = %write.key, attempt, error = %e, "Snapshot read failed, retrying");
                    continue;
                }
            }

            match self.surface.add_placement(handle, write).await {
                Ok(true) => {}
                Ok(false) => {
                    last_error = "write returned null".to_string();
                    warn!(key = %write.key, attempt, "Placement write returned null, retrying");
                    continue;
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(key = %write.key, attempt, error = %e, "Placement write failed, retrying");
                    continue;
                }
            }

            match self.surface.read_timeline_state(handle).await {
                Ok(snapshot) if snapshot.find(&write.key).is_some() => return Ok(WriteOutcome::Written),
                Ok(_) => {
                    last_error = "write acknowledged but not visible on read-back".to_string();
                    warn!(key = %write.key, attempt, "Read-back did not find placement, retrying");
                }
                Err(e) => {
                    last_error = format!("read-back failed: {}", e);
                    warn!(key = %write.key, attempt, error = %e, "Read-back failed, retrying");
                }
            }
        }

        Err(format!("{} after {} attempts", last_error, self.config.max_attempts))
    }

    /// Best-effort grading: failures are recorded and the pass continues
    async fn apply_presets(
        &self,
        record: &mut MaterializationRecord,
        handle: &TimelineHandle,
        plan: &EditPlan,
    ) -> Result<(), MaterializationError> {
        record.preset_failures.clear();

        for (ordinal, index, placement) in plan.placements() {
            if !placement.track.is_graded() {
                continue;
            }
            let key = PlacementKey::new(&record.timeline_name, ordinal, index).to_string();
            if record.presets_applied.contains(&key) {
                continue;
            }

            match self.apply_preset(handle, &key, placement).await {
                Ok(()) => {
                    debug!(key = %key, preset = %placement.preset_id, "Preset applied");
                    record.presets_applied.push(key);
                }
                Err(reason) => {
                    warn!(key = %key, preset = %placement.preset_id, reason = %reason, "Preset application failed, continuing");
                    record.preset_failures.push(PresetFailure {
                        key,
                        preset_id: placement.preset_id.clone(),
                        reason,
                    });
                }
            }
            self.save(record)?;
        }
        Ok(())
    }

    async fn apply_preset(&self, handle: &TimelineHandle, key: &str, placement: &Placement) -> Result<(), String> {
        let library = self.resolver.library();
        let preset = library.get(&placement.preset_id).unwrap_or_else(|| library.fallback());
        let target = PlacementRef { key: key.to_string() };

        let applied = async {
            match self.surface.apply_color_preset(handle, &target, preset).await {
                Ok(true) => {}
                Ok(false) => return Err("preset write returned null".to_string()),
                Err(e) => return Err(e.to_string()),
            }
            let snapshot = self
                .surface
                .read_timeline_state(handle)
                .await
                .map_err(|e| format!("read-back failed: {}", e))?;
            match snapshot.find(key).and_then(|item| item.preset_id.as_deref()) {
                Some(id) if id == preset.id => Ok(()),
                _ => Err("preset not visible on read-back".to_string()),
            }
        };

        tokio::time::timeout(self.config.placement_timeout(), applied)
            .await
            .unwrap_or_else(|_| Err(format!("timed out after {}ms", self.config.placement_timeout_ms)))
    }

    /// Fully applied: verify only, never write
    async fn reverify(
        &self,
        mut record: MaterializationRecord,
        plan: &EditPlan,
        total: usize,
    ) -> Result<MaterializationRecord, MaterializationError> {
        let snapshot = match &record.handle {
            Some(handle) => self.surface.read_timeline_state(handle).await.map_err(|e| e.to_string()),
            None => Err("record has no timeline handle".to_string()),
        };

        let problem = match snapshot {
            Ok(snapshot) => {
                let diff = diff_snapshot(&expected_items(plan, &record.timeline_name), &snapshot);
                diff.missing
                    .first()
                    .cloned()
                    .or_else(|| diff.mismatched.first().map(|m| m.key.clone()))
                    .map(|key| (Some(key), "placement missing or altered on the surface".to_string()))
            }
            Err(reason) => Some((None, reason)),
        };

        let Some((key, reason)) = problem else {
            debug!(timeline = %record.timeline_name, "Re-verified fully applied plan");
            self.save(&mut record)?;
            return Ok(record);
        };

        let position = key
            .as_ref()
            .and_then(|key| record.applied.iter().position(|applied| applied == key));
        if let Some(position) = position {
            // Resume from the first placement no longer on the surface
            record.applied.truncate(position);
            record.presets_applied.retain(|k| record.applied.contains(k));
        }
        let plan_index = position.unwrap_or(record.applied.len());
        let key = key.unwrap_or_default();

        warn!(timeline = %record.timeline_name, key = %key, reason = %reason, "Re-verification failed");
        record.state = RecordState::VerificationFailed;
        record.failure = Some(FailurePoint { plan_index, key, reason });
        self.save(&mut record)?;
        Err(MaterializationError::VerificationFailed(Box::new(record.report(total))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_plan, test_materializer_config, MockSurface};
    use std::time::Duration;

    fn materializer(surface: Arc<MockSurface>, db: Arc<Database>) -> Materializer {
        Materializer::new(
            surface,
            db,
            Arc::new(ColorResolver::builtin()),
            test_materializer_config(),
        )
    }

    fn key(plan: &EditPlan, index: usize) -> String {
        PlacementKey::new(&timeline_name("promo", &plan.version()), 0, index).to_string()
    }

    #[tokio::test]
    async fn test_full_materialization() {
        let surface = Arc::new(MockSurface::default());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let plan = sample_plan(5);

        let record = materializer(surface.clone(), db.clone())
            .materialize("promo", &plan)
            .await
            .unwrap();

        assert_eq!(record.state, RecordState::FullyApplied);
        assert_eq!(record.applied.len(), 5);
        assert_eq!(record.presets_applied.len(), 5);
        assert_eq!(surface.counts().placement_writes, 5);
        assert_eq!(surface.items().len(), 5);
        assert_eq!(db.get_record_state("promo", &plan.version()).unwrap().as_deref(), Some("fully_applied"));
    }

    #[tokio::test]
    async fn test_scenario_b_read_only_surface() {
        let surface = Arc::new(MockSurface::default());
        surface.set(|s| s.create_returns_none = true);
        let db = Arc::new(Database::open_in_memory().unwrap());
        let plan = sample_plan(3);
        let materializer = materializer(surface.clone(), db.clone());

        let err = materializer.materialize("promo", &plan).await.unwrap_err();
        let report = match &err {
            MaterializationError::SurfaceReadOnly(report) => report,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(report.state, RecordState::SurfaceReadOnly);
        assert_eq!((report.total, report.succeeded), (3, 0));
        assert_eq!(surface.counts().creates, 1);
        assert_eq!(surface.counts().placement_writes, 0);
        assert!(materializer.is_read_only());

        // Same session: no retry storm
        let again = materializer.materialize("promo", &plan).await.unwrap_err();
        assert!(matches!(again, MaterializationError::SurfaceReadOnly(_)));
        assert_eq!(surface.counts().creates, 1);

        let record = materializer.load_record("promo", &plan.version()).unwrap().unwrap();
        assert_eq!(record.state, RecordState::SurfaceReadOnly);
    }

    #[tokio::test]
    async fn test_read_only_session_still_reverifies_applied_plans() {
        let surface = Arc::new(MockSurface::default());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let applied = sample_plan(3);
        let materializer = materializer(surface.clone(), db);
        materializer.materialize("promo", &applied).await.unwrap();

        surface.set(|s| s.create_returns_none = true);
        let err = materializer.materialize("promo", &sample_plan(4)).await.unwrap_err();
        assert!(matches!(err, MaterializationError::SurfaceReadOnly(_)));
        assert!(materializer.is_read_only());

        let before = surface.counts();
        let record = materializer.materialize("promo", &applied).await.unwrap();
        assert_eq!(record.state, RecordState::FullyApplied);
        let after = surface.counts();
        assert_eq!(after.placement_writes, before.placement_writes);
        assert_eq!(after.creates, before.creates);
        assert!(after.reads > before.reads);
    }

    #[tokio::test]
    async fn test_scenario_c_halts_at_failing_placement_then_resumes() {
        let surface = Arc::new(MockSurface::default());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let plan = sample_plan(5);
        let failing = key(&plan, 2);
        surface.set(|s| {
            s.failing_keys.insert(failing.clone());
        });

        let err = materializer(surface.clone(), db.clone())
            .materialize("promo", &plan)
            .await
            .unwrap_err();
        let report = err.report().unwrap().clone();
        assert_eq!(report.state, RecordState::VerificationFailed);
        assert_eq!((report.succeeded, report.failed, report.not_attempted), (2, 1, 2));
        assert_eq!(report.first_failure.as_ref().unwrap().plan_index, 2);
        assert_eq!(report.first_failure.as_ref().unwrap().key, failing);
        // Two clean writes plus every attempt on the failing one
        assert_eq!(surface.counts().placement_writes, 2 + 3);

        let record = materializer(surface.clone(), db.clone())
            .load_record("promo", &plan.version())
            .unwrap()
            .unwrap();
        assert_eq!(record.applied, vec![key(&plan, 0), key(&plan, 1)]);
        assert_eq!(record.state, RecordState::VerificationFailed);

        // A later session picks up from placement 2
        surface.set(|s| s.failing_keys.clear());
        let writes_before = surface.counts().placement_writes;
        let record = materializer(surface.clone(), db.clone())
            .materialize("promo", &plan)
            .await
            .unwrap();
        assert_eq!(record.state, RecordState::FullyApplied);
        assert_eq!(surface.counts().placement_writes - writes_before, 3);
        assert_eq!(surface.counts().creates, 1);
        assert_eq!(surface.items().len(), 5);
    }

    #[tokio::test]
    async fn test_idempotent_rerun_only_reads() {
        let surface = Arc::new(MockSurface::default());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let plan = sample_plan(4);
        let materializer = materializer(surface.clone(), db);

        materializer.materialize("promo", &plan).await.unwrap();
        let before = surface.counts();

        let record = materializer.materialize("promo", &plan).await.unwrap();
        let after = surface.counts();
        assert_eq!(record.state, RecordState::FullyApplied);
        assert_eq!(record.attempts, 2);
        assert_eq!(after.creates, before.creates);
        assert_eq!(after.placement_writes, before.placement_writes);
        assert_eq!(after.preset_writes, before.preset_writes);
        assert!(after.reads > before.reads);
    }

    #[tokio::test]
    async fn test_reverify_detects_removed_placement() {
        let surface = Arc::new(MockSurface::default());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let plan = sample_plan(3);
        let materializer = materializer(surface.clone(), db);

        materializer.materialize("promo", &plan).await.unwrap();
        let removed = key(&plan, 1);
        surface.remove_item(&removed);

        let err = materializer.materialize("promo", &plan).await.unwrap_err();
        let report = err.report().unwrap();
        assert_eq!(report.state, RecordState::VerificationFailed);
        assert_eq!(report.first_failure.as_ref().unwrap().key, removed);
        assert_eq!(report.succeeded, 1);

        // Next pass re-applies from the missing placement only
        let record = materializer.materialize("promo", &plan).await.unwrap();
        assert_eq!(record.state, RecordState::FullyApplied);
        assert_eq!(surface.items().len(), 3);
    }

    #[tokio::test]
    async fn test_lost_ack_is_adopted_not_duplicated() {
        let surface = Arc::new(MockSurface::default());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let plan = sample_plan(2);
        let lost = key(&plan, 0);
        surface.set(|s| {
            s.lost_ack_keys.insert(lost.clone());
        });

        let record = materializer(surface.clone(), db).materialize("promo", &plan).await.unwrap();
        assert_eq!(record.state, RecordState::FullyApplied);
        assert_eq!(surface.items().iter().filter(|i| i.key == lost).count(), 1);
        assert_eq!(surface.counts().placement_writes, 2);
    }

    #[tokio::test]
    async fn test_concurrent_attempt_gets_lock_contention() {
        let surface = Arc::new(MockSurface::default());
        surface.set(|s| s.write_delay = Some(Duration::from_millis(200)));
        let db = Arc::new(Database::open_in_memory().unwrap());
        let plan = sample_plan(2);
        let materializer = Arc::new(materializer(surface.clone(), db));

        let first = {
            let materializer = materializer.clone();
            let plan = plan.clone();
            tokio::spawn(async move { materializer.materialize("promo", &plan).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = materializer.materialize("promo", &plan).await;
        assert!(matches!(second, Err(MaterializationError::LockContention { .. })));

        let record = first.await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::FullyApplied);
        assert_eq!(surface.items().len(), 2);
    }

    #[tokio::test]
    async fn test_preset_failure_does_not_abort() {
        let surface = Arc::new(MockSurface::default());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let plan = sample_plan(3);
        let ungraded = key(&plan, 1);
        surface.set(|s| {
            s.failing_preset_keys.insert(ungraded.clone());
        });

        let record = materializer(surface.clone(), db).materialize("promo", &plan).await.unwrap();
        assert_eq!(record.state, RecordState::FullyApplied);
        assert_eq!(record.presets_applied.len(), 2);
        assert_eq!(record.preset_failures.len(), 1);
        assert_eq!(record.preset_failures[0].key, ungraded);
    }

    #[tokio::test]
    async fn test_stuck_surface_times_out_into_verification_failed() {
        let surface = Arc::new(MockSurface::default());
        surface.set(|s| s.write_delay = Some(Duration::from_secs(30)));
        let db = Arc::new(Database::open_in_memory().unwrap());
        let plan = sample_plan(2);

        let err = materializer(surface.clone(), db).materialize("promo", &plan).await.unwrap_err();
        let report = err.report().unwrap();
        assert_eq!(report.state, RecordState::VerificationFailed);
        assert_eq!(report.succeeded, 0);
        assert!(report.first_failure.as_ref().unwrap().reason.contains("timed out"));
    }

    #[test]
    fn test_timeline_name_uses_short_version() {
        assert_eq!(timeline_name("promo", "0123456789abcdef"), "promo-0123456789ab");
    }
}
