//! Manual fallback guide: the plan as ordered, human-actionable editing steps,
//! rendered as Markdown or as a CMX3600 EDL for import into an NLE.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write;

use crate::compiler::EditPlan;
use crate::diff::PlacementKey;
use crate::timeline::{ticks_to_secs, ClipInstance, Timecode, Timeline, TrackRole};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuideStep {
    pub number: usize,
    pub key: String,
    pub section: String,
    pub section_ordinal: usize,
    pub placement_index: usize,
    pub clip: String,
    pub track: TrackRole,
    pub source_in: String,
    pub source_out: String,
    pub record_in: String,
    pub record_out: String,
    pub preset_id: String,
    pub applied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualGuide {
    pub title: String,
    pub fps: f64,
    pub steps: Vec<GuideStep>,
    #[serde(skip)]
    timeline: Timeline,
}

impl ManualGuide {
    /// `applied` holds placement keys already on the external timeline
    pub fn from_plan(plan: &EditPlan, title: &str, fps: f64, applied: &[String]) -> Self {
        let applied: HashSet<&str> = applied.iter().map(String::as_str).collect();
        let tc = |ticks: i64| Timecode::from_ticks(ticks, fps).to_string();

        let steps = plan
            .placements()
            .enumerate()
            .map(|(n, (ordinal, index, placement))| {
                let key = PlacementKey::new(title, ordinal, index).to_string();
                GuideStep {
                    number: n + 1,
                    applied: applied.contains(key.as_str()),
                    key,
                    section: plan
                        .sections
                        .get(ordinal)
                        .map(|s| s.name.clone())
                        .unwrap_or_default(),
                    section_ordinal: ordinal,
                    placement_index: index,
                    clip: placement.clip.to_string(),
                    track: placement.track,
                    source_in: tc(placement.in_ticks),
                    source_out: tc(placement.out_ticks),
                    record_in: tc(placement.record_in_ticks),
                    record_out: tc(placement.record_out_ticks()),
                    preset_id: placement.preset_id.clone(),
                }
            })
            .collect();

        ManualGuide {
            title: title.to_string(),
            fps,
            steps,
            timeline: plan.to_timeline(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.steps.iter().filter(|s| !s.applied).count()
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Manual edit guide: {}", self.title);
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{} placements, {} remaining, timecodes at {} fps (non-drop), running time {:.2}s.",
            self.steps.len(),
            self.remaining(),
            self.fps,
            ticks_to_secs(self.timeline.duration_ticks())
        );

        let mut current_section: Option<usize> = None;
        for step in &self.steps {
            if current_section != Some(step.section_ordinal) {
                current_section = Some(step.section_ordinal);
                let _ = writeln!(out);
                let _ = writeln!(out, "## {}. {}", step.section_ordinal + 1, step.section);
                let _ = writeln!(out);
                let _ = writeln!(out, "| # | Done | Track | Clip | Source In | Source Out | Record In | Record Out | Preset |");
                let _ = writeln!(out, "|---|------|-------|------|-----------|------------|-----------|------------|--------|");
            }
            let _ = writeln!(
                out,
                "| {} | {} | {} | `{}` | {} | {} | {} | {} | {} |",
                step.number,
                if step.applied { "x" } else { " " },
                step.track.as_str(),
                step.clip,
                step.source_in,
                step.source_out,
                step.record_in,
                step.record_out,
                step.preset_id
            );
        }
        out
    }

    /// CMX3600, one cut event per placement in record order
    pub fn to_edl(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "TITLE: {}", self.title);
        let _ = writeln!(out, "FCM: NON-DROP FRAME");
        let _ = writeln!(out);

        let mut events: Vec<&ClipInstance> = self.timeline.tracks.iter().flat_map(|t| t.clips.iter()).collect();
        events.sort_by_key(|c| (c.timeline_start_ticks, c.section_ordinal, c.placement_index));

        for (n, clip) in events.into_iter().enumerate() {
            let step = self
                .steps
                .iter()
                .find(|s| s.section_ordinal == clip.section_ordinal && s.placement_index == clip.placement_index);
            let track = step.map_or(TrackRole::Primary, |s| s.track);
            let tc = |ticks: i64| Timecode::from_ticks(ticks, self.fps);

            let _ = writeln!(
                out,
                "{:03}  {:<8} {:<5} C        {} {} {} {}",
                n + 1,
                reel_name(&clip.clip),
                track.edl_code(),
                tc(clip.in_ticks),
                tc(clip.out_ticks),
                tc(clip.timeline_start_ticks),
                tc(clip.timeline_end_ticks())
            );
            let _ = writeln!(out, "* FROM CLIP NAME: {}", file_name(&clip.clip));
            if let Some(step) = step {
                let _ = writeln!(out, "* COLOR PRESET: {}", step.preset_id);
            }
            let _ = writeln!(out);
        }
        out
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Eight-character reel from the file stem
fn reel_name(path: &str) -> String {
    let name = file_name(path);
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    let reel: String = stem
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .take(8)
        .collect::<String>()
        .to_uppercase();
    if reel.is_empty() {
        "AX".to_string()
    } else {
        reel
    }
}
