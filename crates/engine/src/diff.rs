//! Verification of an external timeline snapshot against a plan.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::compiler::EditPlan;
use crate::timeline::TrackRole;

/// Composite duplicate-detection key: timeline name, section ordinal, placement index
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlacementKey {
    pub timeline: String,
    pub section_ordinal: usize,
    pub placement_index: usize,
}

impl PlacementKey {
    pub fn new(timeline: &str, section_ordinal: usize, placement_index: usize) -> Self {
        PlacementKey {
            timeline: timeline.to_string(),
            section_ordinal,
            placement_index,
        }
    }
}

impl fmt::Display for PlacementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}.{}", self.timeline, self.section_ordinal, self.placement_index)
    }
}

impl FromStr for PlacementKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (timeline, position) = s
            .rsplit_once('#')
            .ok_or_else(|| format!("missing '#' in placement key: {s}"))?;
        let (ordinal, index) = position
            .split_once('.')
            .ok_or_else(|| format!("missing '.' in placement key: {s}"))?;
        Ok(PlacementKey {
            timeline: timeline.to_string(),
            section_ordinal: ordinal.parse().map_err(|_| format!("bad section ordinal: {s}"))?,
            placement_index: index.parse().map_err(|_| format!("bad placement index: {s}"))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotItem {
    pub key: String,
    pub clip: String,
    pub track: TrackRole,
    pub in_ticks: i64,
    pub out_ticks: i64,
    #[serde(default)]
    pub preset_id: Option<String>,
}

impl SnapshotItem {
    /// Same clip, track and bounds; presets are compared separately
    pub fn same_placement(&self, other: &SnapshotItem) -> bool {
        self.clip == other.clip
            && self.track == other.track
            && self.in_ticks == other.in_ticks
            && self.out_ticks == other.out_ticks
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineSnapshot {
    #[serde(default)]
    pub items: Vec<SnapshotItem>,
}

impl TimelineSnapshot {
    pub fn find(&self, key: &str) -> Option<&SnapshotItem> {
        self.items.iter().find(|item| item.key == key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mismatch {
    pub key: String,
    pub expected: SnapshotItem,
    pub actual: SnapshotItem,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub matched: Vec<String>,
    pub missing: Vec<String>,
    pub mismatched: Vec<Mismatch>,
    pub unexpected: Vec<SnapshotItem>,
    /// Structurally matched placements whose grade differs
    pub preset_drift: Vec<String>,
}

impl SnapshotDiff {
    /// Every expected placement present with the right bounds, nothing extra
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty() && self.unexpected.is_empty()
    }
}

/// Snapshot items the surface should hold once the whole plan is applied
pub fn expected_items(plan: &EditPlan, timeline: &str) -> Vec<SnapshotItem> {
    plan.placements()
        .map(|(ordinal, index, placement)| SnapshotItem {
            key: PlacementKey::new(timeline, ordinal, index).to_string(),
            clip: placement.clip.to_string(),
            track: placement.track,
            in_ticks: placement.in_ticks,
            out_ticks: placement.out_ticks,
            preset_id: Some(placement.preset_id.clone()),
        })
        .collect()
}

pub fn diff_snapshot(expected: &[SnapshotItem], snapshot: &TimelineSnapshot) -> SnapshotDiff {
    let mut actual: BTreeMap<&str, &SnapshotItem> = BTreeMap::new();
    let mut unexpected = Vec::new();
    for item in &snapshot.items {
        if actual.insert(item.key.as_str(), item).is_some() {
            // Same key twice on the surface is a duplicate write
            unexpected.push(item.clone());
        }
    }

    let mut diff = SnapshotDiff {
        unexpected,
        ..SnapshotDiff::default()
    };

    for want in expected {
        match actual.remove(want.key.as_str()) {
            None => diff.missing.push(want.key.clone()),
            Some(got) if !want.same_placement(got) => diff.mismatched.push(Mismatch {
                key: want.key.clone(),
                expected: want.clone(),
                actual: got.clone(),
            }),
            Some(got) => {
                if want.preset_id.is_some() && got.preset_id != want.preset_id {
                    diff.preset_drift.push(want.key.clone());
                }
                diff.matched.push(want.key.clone());
            }
        }
    }

    diff.unexpected.extend(actual.into_values().cloned());
    diff
}
