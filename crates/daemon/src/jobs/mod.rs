use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::db::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    Export,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Rendering,
    Complete,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: f64,
    pub timeline_id: String,
    pub preset: String,
    pub external_id: Option<String>,
    pub error: Option<String>,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str =
    "id, type, status, progress, timeline_id, preset, external_id, error, payload_json, created_at, updated_at";

fn invalid_column(idx: usize) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, "TEXT".to_string(), rusqlite::types::Type::Text)
}

fn parse_time(raw: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| invalid_column(idx))
}

impl Job {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let job_type_str: String = row.get(1)?;
        let status_str: String = row.get(2)?;
        let payload_str: Option<String> = row.get(8)?;
        let created_at_str: String = row.get(9)?;
        let updated_at_str: String = row.get(10)?;

        Ok(Job {
            id: row.get(0)?,
            job_type: serde_json::from_str(&job_type_str).map_err(|_| invalid_column(1))?,
            status: serde_json::from_str(&status_str).map_err(|_| invalid_column(2))?,
            progress: row.get(3)?,
            timeline_id: row.get(4)?,
            preset: row.get(5)?,
            external_id: row.get(6)?,
            error: row.get(7)?,
            payload: payload_str
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(|_| invalid_column(8))?,
            created_at: parse_time(&created_at_str, 9)?,
            updated_at: parse_time(&updated_at_str, 10)?,
        })
    }
}

pub struct JobManager {
    db: Arc<Database>,
}

impl JobManager {
    pub fn new(db: Arc<Database>) -> Self {
        JobManager { db }
    }

    pub fn create_job(
        &self,
        job_type: JobType,
        timeline_id: &str,
        preset: &str,
        payload: Option<Value>,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let job_type_str = serde_json::to_string(&job_type)?;
        let status_str = serde_json::to_string(&JobStatus::Queued)?;
        let payload_str = payload.as_ref().map(serde_json::to_string).transpose()?;

        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO jobs (type, status, progress, timeline_id, preset, payload_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![job_type_str, status_str, 0.0, timeline_id, preset, payload_str, now, now],
        )?;

        Ok(conn.last_insert_rowid())
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS))?;
        let mut rows = stmt.query_map(params![id], Job::from_row)?;

        match rows.next() {
            Some(Ok(job)) => Ok(Some(job)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    pub fn jobs_for_timeline(&self, timeline_id: &str) -> Result<Vec<Job>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs WHERE timeline_id = ?1 ORDER BY id",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map(params![timeline_id], Job::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Latest complete render of `preset` for the timeline
    pub fn find_completed(&self, timeline_id: &str, preset: &str) -> Result<Option<i64>> {
        let status_str = serde_json::to_string(&JobStatus::Complete)?;
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM jobs WHERE timeline_id = ?1 AND preset = ?2 AND status = ?3 ORDER BY id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![timeline_id, preset, status_str], |row| row.get(0))?;

        match rows.next() {
            Some(Ok(id)) => Ok(Some(id)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    pub fn update_job_status(&self, id: i64, status: JobStatus, progress: Option<f64>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let status_str = serde_json::to_string(&status)?;

        let conn = self.db.lock();
        if let Some(prog) = progress {
            conn.execute(
                "UPDATE jobs SET status = ?1, progress = ?2, updated_at = ?3 WHERE id = ?4",
                params![status_str, prog, now, id],
            )?;
        } else {
            conn.execute(
                "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status_str, now, id],
            )?;
        }

        Ok(())
    }

    pub fn set_external_id(&self, id: i64, external_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.db.lock();
        conn.execute(
            "UPDATE jobs SET external_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![external_id, now, id],
        )?;
        Ok(())
    }

    pub fn fail_job(&self, id: i64, error: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let status_str = serde_json::to_string(&JobStatus::Failed)?;
        let conn = self.db.lock();
        conn.execute(
            "UPDATE jobs SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
            params![status_str, error, now, id],
        )?;
        Ok(())
    }

    pub fn cancel_job(&self, id: i64) -> Result<()> {
        self.update_job_status(id, JobStatus::Cancelled, None)
    }
}
