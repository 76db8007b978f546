use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::surface::TimelineHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    NotStarted,
    PartiallyApplied,
    FullyApplied,
    VerificationFailed,
    SurfaceReadOnly,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::NotStarted => "not_started",
            RecordState::PartiallyApplied => "partially_applied",
            RecordState::FullyApplied => "fully_applied",
            RecordState::VerificationFailed => "verification_failed",
            RecordState::SurfaceReadOnly => "surface_read_only",
        }
    }
}

/// Where a materialization pass stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePoint {
    /// Position in plan order
    pub plan_index: usize,
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetFailure {
    pub key: String,
    pub preset_id: String,
    pub reason: String,
}

/// Last verified state of one plan on one external timeline.
///
/// `applied` lists placement keys in plan order; a later pass resumes after the
/// last of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializationRecord {
    pub project: String,
    pub plan_version: String,
    pub timeline_name: String,
    pub handle: Option<TimelineHandle>,
    pub state: RecordState,
    pub applied: Vec<String>,
    pub presets_applied: Vec<String>,
    pub preset_failures: Vec<PresetFailure>,
    pub failure: Option<FailurePoint>,
    pub session_id: String,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl MaterializationRecord {
    pub fn new(project: &str, plan_version: &str, timeline_name: &str, session_id: &str) -> Self {
        MaterializationRecord {
            project: project.to_string(),
            plan_version: plan_version.to_string(),
            timeline_name: timeline_name.to_string(),
            handle: None,
            state: RecordState::NotStarted,
            applied: Vec::new(),
            presets_applied: Vec::new(),
            preset_failures: Vec::new(),
            failure: None,
            session_id: session_id.to_string(),
            attempts: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn report(&self, total: usize) -> DegradationReport {
        let succeeded = self.applied.len();
        let failed = usize::from(self.failure.is_some());
        DegradationReport {
            state: self.state,
            timeline_name: self.timeline_name.clone(),
            total,
            succeeded,
            failed,
            not_attempted: total.saturating_sub(succeeded + failed),
            first_failure: self.failure.clone(),
            preset_failures: self.preset_failures.clone(),
        }
    }
}

/// Itemised account of a degraded materialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationReport {
    pub state: RecordState,
    pub timeline_name: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub not_attempted: usize,
    pub first_failure: Option<FailurePoint>,
    pub preset_failures: Vec<PresetFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let mut record = MaterializationRecord::new("p", "v", "p-v", "s");
        record.state = RecordState::VerificationFailed;
        record.applied = vec!["p-v#0.0".to_string(), "p-v#0.1".to_string()];
        record.failure = Some(FailurePoint {
            plan_index: 2,
            key: "p-v#0.2".to_string(),
            reason: "write rejected".to_string(),
        });

        let report = record.report(5);
        assert_eq!((report.succeeded, report.failed, report.not_attempted), (2, 1, 2));
        assert_eq!(report.first_failure.unwrap().plan_index, 2);
    }

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RecordState::SurfaceReadOnly).unwrap(),
            "\"surface_read_only\""
        );
        assert_eq!(RecordState::FullyApplied.as_str(), "fully_applied");
    }
}
