//! Export Job Scheduler
//!
//! One persisted job per (timeline, export preset), each driven by its own task
//! and individually cancellable. A failing job never affects its siblings. Only
//! timelines whose materialization record is fully applied can be rendered.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ExportConfig;
use crate::db::Database;
use crate::jobs::{Job, JobManager, JobStatus, JobType};
use crate::materializer::{MaterializationRecord, RecordState};
use crate::surface::TimelineHandle;

pub mod backend;

pub use backend::{BridgeRenderBackend, RenderBackend, RenderStatus};

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Timeline {timeline_id} already rendered with: {}", .presets.join(", "))]
    AlreadyRendered { timeline_id: String, presets: Vec<String> },

    #[error("Export job {job_id} ({preset}) failed: {error}")]
    JobFailed { job_id: i64, preset: String, error: String },

    #[error("Unknown export job {0}")]
    UnknownJob(i64),

    #[error("No export presets requested")]
    NoPresets,

    #[error("Timeline {timeline_id} is not fully materialized")]
    TimelineNotMaterialized {
        timeline_id: String,
        /// None when no materialization record exists
        state: Option<RecordState>,
    },

    #[error("Failed to persist export job: {0}")]
    Persistence(String),
}

impl From<anyhow::Error> for ExportError {
    fn from(err: anyhow::Error) -> Self {
        ExportError::Persistence(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobHandle {
    pub job_id: i64,
    pub timeline_id: String,
    pub preset: String,
    pub status: JobStatus,
}

struct RunningJob {
    cancel: CancellationToken,
    status: watch::Receiver<JobStatus>,
}

type RunningJobs = Arc<Mutex<HashMap<i64, RunningJob>>>;

#[derive(Clone)]
struct JobContext {
    backend: Arc<dyn RenderBackend>,
    jobs: Arc<JobManager>,
    db: Arc<Database>,
    config: ExportConfig,
    running: RunningJobs,
}

impl JobContext {
    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<i64, RunningJob>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct ExportScheduler {
    ctx: JobContext,
}

impl ExportScheduler {
    pub fn new(
        backend: Arc<dyn RenderBackend>,
        jobs: Arc<JobManager>,
        db: Arc<Database>,
        config: ExportConfig,
    ) -> Self {
        ExportScheduler {
            ctx: JobContext {
                backend,
                jobs,
                db,
                config,
                running: Arc::new(Mutex::new(HashMap::new())),
            },
        }
    }

    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<i64, RunningJob>> {
        self.ctx.running()
    }

    /// Surface handle of a fully applied timeline
    fn resolve_timeline(&self, timeline_id: &str) -> Result<TimelineHandle, ExportError> {
        let record: Option<MaterializationRecord> = match self.ctx.db.get_record_by_timeline(timeline_id)? {
            Some(json) => Some(serde_json::from_str(&json).map_err(|e| ExportError::Persistence(e.to_string()))?),
            None => None,
        };
        match record {
            Some(MaterializationRecord {
                state: RecordState::FullyApplied,
                handle: Some(handle),
                ..
            }) => Ok(handle),
            other => Err(ExportError::TimelineNotMaterialized {
                timeline_id: timeline_id.to_string(),
                state: other.map(|record| record.state),
            }),
        }
    }

    /// Queue one render per distinct preset.
    ///
    /// Without `force`, a preset that already has a complete render for the
    /// timeline rejects the whole request.
    pub fn enqueue(&self, timeline_id: &str, presets: &[String], force: bool) -> Result<Vec<JobHandle>, ExportError> {
        let mut distinct: Vec<&String> = Vec::new();
        for preset in presets {
            if !distinct.contains(&preset) {
                distinct.push(preset);
            }
        }
        if distinct.is_empty() {
            return Err(ExportError::NoPresets);
        }
        let handle = self.resolve_timeline(timeline_id)?;

        if !force {
            let mut rendered = Vec::new();
            for preset in &distinct {
                if self.ctx.jobs.find_completed(timeline_id, preset)?.is_some() {
                    rendered.push(preset.to_string());
                }
            }
            if !rendered.is_empty() {
                return Err(ExportError::AlreadyRendered {
                    timeline_id: timeline_id.to_string(),
                    presets: rendered,
                });
            }
        }

        let mut handles = Vec::with_capacity(distinct.len());
        for preset in distinct {
            let payload = serde_json::json!({
                "timeline_id": timeline_id,
                "handle": handle,
                "preset": preset,
                "force": force,
            });
            let job_id = self.ctx.jobs.create_job(JobType::Export, timeline_id, preset, Some(payload))?;

            let cancel = CancellationToken::new();
            let (tx, rx) = watch::channel(JobStatus::Queued);
            self.running().insert(
                job_id,
                RunningJob {
                    cancel: cancel.clone(),
                    status: rx,
                },
            );

            let ctx = self.ctx.clone();
            let job_handle = handle.clone();
            let job_preset = preset.clone();
            tokio::spawn(async move {
                run_job(ctx, job_id, job_handle, job_preset, cancel, tx).await;
            });

            info!(job_id, timeline = %timeline_id, preset = %preset, "Queued export job");
            handles.push(JobHandle {
                job_id,
                timeline_id: timeline_id.to_string(),
                preset: preset.clone(),
                status: JobStatus::Queued,
            });
        }
        Ok(handles)
    }

    pub fn status(&self, job_id: i64) -> Result<Job, ExportError> {
        self.ctx.jobs.get_job(job_id)?.ok_or(ExportError::UnknownJob(job_id))
    }

    pub fn jobs_for_timeline(&self, timeline_id: &str) -> Result<Vec<Job>, ExportError> {
        Ok(self.ctx.jobs.jobs_for_timeline(timeline_id)?)
    }

    /// Cancel one job; finished jobs are left as they are
    pub fn cancel(&self, job_id: i64) -> Result<(), ExportError> {
        let token = self.running().get(&job_id).map(|job| job.cancel.clone());
        match token {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => {
                let job = self.status(job_id)?;
                if !job.status.is_terminal() {
                    // Left over from an earlier daemon run, nothing drives it
                    self.ctx.jobs.cancel_job(job_id)?;
                }
                Ok(())
            }
        }
    }

    /// Wait for a job's terminal state
    pub async fn wait(&self, job_id: i64) -> Result<Job, ExportError> {
        let status = self.running().get(&job_id).map(|job| job.status.clone());
        if let Some(mut status) = status {
            let _ = status.wait_for(|s| s.is_terminal()).await;
        }

        let job = self.status(job_id)?;
        if job.status == JobStatus::Failed {
            return Err(ExportError::JobFailed {
                job_id,
                preset: job.preset.clone(),
                error: job.error.clone().unwrap_or_default(),
            });
        }
        Ok(job)
    }
}

async fn run_job(
    ctx: JobContext,
    job_id: i64,
    handle: TimelineHandle,
    preset: String,
    cancel: CancellationToken,
    tx: watch::Sender<JobStatus>,
) {
    let outcome = drive_job(&ctx, job_id, &handle, &preset, &cancel, &tx).await;

    let (status, persisted) = match outcome {
        Ok(JobStatus::Cancelled) => {
            info!(job_id, preset = %preset, "Export job cancelled");
            (JobStatus::Cancelled, ctx.jobs.cancel_job(job_id))
        }
        Ok(status) => {
            info!(job_id, preset = %preset, "Export job complete");
            (status, ctx.jobs.update_job_status(job_id, status, Some(1.0)))
        }
        Err(reason) => {
            warn!(job_id, preset = %preset, reason = %reason, "Export job failed");
            (JobStatus::Failed, ctx.jobs.fail_job(job_id, &reason))
        }
    };
    if let Err(e) = persisted {
        error!(job_id, error = %e, "Failed to persist export job outcome");
    }
    // Later status and cancel calls read the persisted row
    ctx.running().remove(&job_id);
    let _ = tx.send(status);
}

async fn drive_job(
    ctx: &JobContext,
    job_id: i64,
    handle: &TimelineHandle,
    preset: &str,
    cancel: &CancellationToken,
    tx: &watch::Sender<JobStatus>,
) -> Result<JobStatus, String> {
    let external_id = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(JobStatus::Cancelled),
        submitted = ctx.backend.submit_render_job(handle, preset) => {
            submitted.map_err(|e| format!("submit failed: {}", e))?
        }
    };

    if let Err(e) = ctx.jobs.set_external_id(job_id, &external_id) {
        error!(job_id, error = %e, "Failed to store render job id");
    }
    if let Err(e) = ctx.jobs.update_job_status(job_id, JobStatus::Rendering, Some(0.0)) {
        error!(job_id, error = %e, "Failed to update export job");
    }
    let _ = tx.send(JobStatus::Rendering);

    let interval = Duration::from_millis(ctx.config.poll_interval_ms);
    let mut poll_errors = 0u32;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if let Err(e) = ctx.backend.cancel_job(&external_id).await {
                    warn!(job_id, error = %e, "Render backend did not acknowledge cancellation");
                }
                return Ok(JobStatus::Cancelled);
            }
            _ = tokio::time::sleep(interval) => {}
        }

        match ctx.backend.poll_job(&external_id).await {
            Ok(RenderStatus::Complete) => return Ok(JobStatus::Complete),
            Ok(RenderStatus::Failed { error }) => {
                return Err(if error.is_empty() { "render failed".to_string() } else { error });
            }
            Ok(RenderStatus::Rendering { progress }) => {
                poll_errors = 0;
                debug!(job_id, progress, "Render progress");
                if let Err(e) = ctx.jobs.update_job_status(job_id, JobStatus::Rendering, Some(progress)) {
                    error!(job_id, error = %e, "Failed to update export job");
                }
            }
            Ok(RenderStatus::Queued) => poll_errors = 0,
            Err(e) => {
                poll_errors += 1;
                warn!(job_id, poll_errors, error = %e, "Render poll failed");
                if poll_errors >= ctx.config.max_poll_errors {
                    return Err(format!("{} consecutive poll errors, last: {}", poll_errors, e));
                }
            }
        }
    }
}
