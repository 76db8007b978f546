use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Connection guard; a panic while holding it does not take the store down
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS edit_plans (
                project TEXT NOT NULL,
                version TEXT NOT NULL,
                plan_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (project, version)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS materialization_records (
                project TEXT NOT NULL,
                plan_version TEXT NOT NULL,
                timeline_name TEXT NOT NULL,
                record_json TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (project, plan_version)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL,
                status TEXT NOT NULL,
                progress REAL NOT NULL,
                timeline_id TEXT NOT NULL,
                preset TEXT NOT NULL,
                external_id TEXT,
                error TEXT,
                payload_json TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_records_timeline ON materialization_records (timeline_name)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_timeline_preset ON jobs (timeline_id, preset)",
            [],
        )?;

        Ok(())
    }

    /// Plans are content-addressed per project, storing the same version twice is a no-op
    pub fn store_plan(&self, project: &str, version: &str, plan_json: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO edit_plans (version, project, plan_json, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![version, project, plan_json, now],
        )?;
        Ok(())
    }

    pub fn get_plan(&self, project: &str, version: &str) -> Result<Option<String>> {
        let conn = self.lock();
        let plan = conn
            .query_row(
                "SELECT plan_json FROM edit_plans WHERE version = ?1 AND project = ?2",
                params![version, project],
                |row| row.get(0),
            )
            .optional()?;
        Ok(plan)
    }

    pub fn store_record(
        &self,
        project: &str,
        plan_version: &str,
        timeline_name: &str,
        record_json: &str,
        state: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO materialization_records (project, plan_version, timeline_name, record_json, state, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(project, plan_version) DO UPDATE SET
                timeline_name = excluded.timeline_name,
                record_json = excluded.record_json,
                state = excluded.state,
                updated_at = excluded.updated_at",
            params![project, plan_version, timeline_name, record_json, state, now],
        )?;
        Ok(())
    }

    pub fn get_record(&self, project: &str, plan_version: &str) -> Result<Option<String>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                "SELECT record_json FROM materialization_records WHERE project = ?1 AND plan_version = ?2",
                params![project, plan_version],
                |row| row.get(0),
            )
            .optional()?;
        Ok(record)
    }

    /// Most recently updated record for an external timeline name
    pub fn get_record_by_timeline(&self, timeline_name: &str) -> Result<Option<String>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                "SELECT record_json FROM materialization_records WHERE timeline_name = ?1
                 ORDER BY updated_at DESC LIMIT 1",
                params![timeline_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(record)
    }

    #[cfg(test)]
    pub fn get_record_state(&self, project: &str, plan_version: &str) -> Result<Option<String>> {
        let conn = self.lock();
        let state = conn
            .query_row(
                "SELECT state FROM materialization_records WHERE project = ?1 AND plan_version = ?2",
                params![project, plan_version],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }
}
