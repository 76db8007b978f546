//! Edit Plan Compiler
//!
//! Turns a clip registry into an ordered list of sections whose placements
//! reference clip in/out points. Pure and deterministic: identical input and
//! constraints produce a byte-identical plan.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::broll::{BrollPiece, BrollPool, CoverageGoal};
use crate::color::ColorResolver;
use crate::registry::{Clip, ClipKey, ClipRegistry, ClipRole};
use crate::selection::{build_passages, candidate_order, score_pool, trim_point, Passage};
use crate::timeline::{secs_to_ticks, ClipInstance, Timeline, TrackRole};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompilationError {
    #[error("No primary-track content in the registry")]
    NoPrimaryContent,

    #[error("Broll coverage {achieved:.3} is below the required {required:.3}")]
    PartialCoverage {
        achieved: f64,
        required: f64,
        plan: Box<EditPlan>,
    },

    #[error("Invalid constraints: {0}")]
    InvalidConstraints(String),
}

impl CompilationError {
    /// Best-effort plan the caller may still accept
    pub fn plan(&self) -> Option<&EditPlan> {
        match self {
            CompilationError::PartialCoverage { plan, .. } => Some(plan),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionTemplate {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Keyword anchors used to rank transcript passages
    #[serde(default)]
    pub keywords: Vec<String>,
}

fn default_weight() -> f64 {
    1.0
}

impl SectionTemplate {
    pub fn new(name: &str, weight: f64) -> Self {
        SectionTemplate {
            name: name.to_string(),
            weight,
            keywords: Vec::new(),
        }
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    pub target_duration_secs: f64,
    pub min_broll_ratio: f64,
    /// Accepted deviation from `min_broll_ratio` (ratio points)
    pub broll_tolerance: f64,
    /// Accepted deviation from a section's target, as a fraction of it
    pub duration_tolerance: f64,
    pub sections: Option<Vec<SectionTemplate>>,
    pub min_speaker_secs: f64,
    pub min_placement_secs: f64,
}

impl Default for Constraints {
    fn default() -> Self {
        Constraints {
            target_duration_secs: 60.0,
            min_broll_ratio: 0.5,
            broll_tolerance: 0.05,
            duration_tolerance: 0.10,
            sections: None,
            min_speaker_secs: 0.0,
            min_placement_secs: 1.0,
        }
    }
}

impl Constraints {
    pub fn validate(&self) -> Result<(), CompilationError> {
        let invalid = |msg: &str| Err(CompilationError::InvalidConstraints(msg.to_string()));

        if !(self.target_duration_secs.is_finite() && self.target_duration_secs > 0.0) {
            return invalid("target duration must be positive");
        }
        if !(0.0..=1.0).contains(&self.min_broll_ratio) {
            return invalid("broll ratio must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.broll_tolerance) {
            return invalid("broll tolerance must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.duration_tolerance) {
            return invalid("duration tolerance must be within [0, 1]");
        }
        if !(self.min_speaker_secs >= 0.0 && self.min_placement_secs >= 0.0) {
            return invalid("minimum durations must not be negative");
        }
        if let Some(sections) = &self.sections {
            if sections.is_empty() {
                return invalid("section template is empty");
            }
            if sections.iter().any(|s| !(s.weight.is_finite() && s.weight > 0.0)) {
                return invalid("section weights must be positive");
            }
        }
        Ok(())
    }

    pub fn section_templates(&self) -> Vec<SectionTemplate> {
        self.sections.clone().unwrap_or_else(|| {
            vec![
                SectionTemplate::new("opener", 1.0),
                SectionTemplate::new("story", 3.0),
                SectionTemplate::new("closer", 1.0),
            ]
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub clip: ClipKey,
    pub in_ticks: i64,
    pub out_ticks: i64,
    /// Position on the master timeline
    pub record_in_ticks: i64,
    pub track: TrackRole,
    pub preset_id: String,
    pub speaker: Option<String>,
}

impl Placement {
    pub fn duration_ticks(&self) -> i64 {
        self.out_ticks - self.in_ticks
    }

    pub fn record_out_ticks(&self) -> i64 {
        self.record_in_ticks + self.duration_ticks()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub ordinal: usize,
    pub target_duration_ticks: i64,
    pub placements: Vec<Placement>,
}

impl Section {
    /// Running time of the section (broll overlays excluded)
    pub fn duration_ticks(&self) -> i64 {
        self.placements
            .iter()
            .filter(|p| p.track != TrackRole::Broll)
            .map(|p| p.duration_ticks())
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerShortfall {
    pub speaker: String,
    pub placed_ticks: i64,
    pub required_ticks: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStats {
    pub target_duration_ticks: i64,
    pub total_duration_ticks: i64,
    pub duration_within_tolerance: bool,
    pub primary_ticks: i64,
    pub broll_ticks: i64,
    pub audio_only_ticks: i64,
    pub broll_ratio: f64,
    pub per_speaker_ticks: BTreeMap<String, i64>,
    pub speaker_shortfalls: Vec<SpeakerShortfall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditPlan {
    pub sections: Vec<Section>,
    pub constraints: Constraints,
    pub stats: PlanStats,
}

impl EditPlan {
    /// Stable content hash, the key of the plan's materialization record
    pub fn version(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }

    /// Placements in plan order with their section ordinal and index
    pub fn placements(&self) -> impl Iterator<Item = (usize, usize, &Placement)> {
        self.sections.iter().flat_map(|section| {
            section
                .placements
                .iter()
                .enumerate()
                .map(move |(idx, p)| (section.ordinal, idx, p))
        })
    }

    pub fn placement_count(&self) -> usize {
        self.sections.iter().map(|s| s.placements.len()).sum()
    }

    pub fn to_timeline(&self) -> Timeline {
        let mut timeline = Timeline::new();
        for (section_ordinal, placement_index, placement) in self.placements() {
            timeline.track_mut(placement.track).clips.push(ClipInstance {
                clip: placement.clip.to_string(),
                in_ticks: placement.in_ticks,
                out_ticks: placement.out_ticks,
                timeline_start_ticks: placement.record_in_ticks,
                section_ordinal,
                placement_index,
            });
        }
        timeline.tracks.sort_by_key(|t| t.role);
        for track in &mut timeline.tracks {
            track.clips.sort_by_key(|c| c.timeline_start_ticks);
        }
        timeline
    }
}

// =============================================================================
// Compilation
// =============================================================================

#[derive(Debug, Clone)]
struct Pick {
    clip: ClipKey,
    in_ticks: i64,
    out_ticks: i64,
    track: TrackRole,
    speaker: Option<String>,
    record_in_ticks: i64,
}

impl Pick {
    fn from_passage(passage: &Passage) -> Self {
        Pick {
            clip: passage.clip.clone(),
            in_ticks: passage.start_ticks(),
            out_ticks: passage.end_ticks(),
            track: passage.track,
            speaker: passage.speaker.clone(),
            record_in_ticks: 0,
        }
    }

    fn duration_ticks(&self) -> i64 {
        self.out_ticks - self.in_ticks
    }
}

struct SectionDraft {
    template: SectionTemplate,
    ordinal: usize,
    target_ticks: i64,
    /// Target plus whatever earlier sections left unfilled
    budget_ticks: i64,
    slack_ticks: i64,
    picks: Vec<Pick>,
    broll: Vec<Pick>,
}

impl SectionDraft {
    fn filled_ticks(&self) -> i64 {
        self.picks.iter().map(|p| p.duration_ticks()).sum()
    }

    fn deficit_ticks(&self) -> i64 {
        self.budget_ticks - self.filled_ticks()
    }
}

type UsedTuples = HashSet<(ClipKey, i64, i64)>;

struct Settings {
    min_ticks: i64,
    min_speaker_ticks: i64,
}

pub fn compile(registry: &ClipRegistry, constraints: &Constraints) -> Result<EditPlan, CompilationError> {
    compile_with(registry, constraints, &ColorResolver::builtin())
}

pub fn compile_with(
    registry: &ClipRegistry,
    constraints: &Constraints,
    resolver: &ColorResolver,
) -> Result<EditPlan, CompilationError> {
    constraints.validate()?;

    let settings = Settings {
        min_ticks: secs_to_ticks(constraints.min_placement_secs).max(1),
        min_speaker_ticks: secs_to_ticks(constraints.min_speaker_secs),
    };

    let (primary_clips, broll_clips): (Vec<&Clip>, Vec<&Clip>) = registry
        .clips()
        .iter()
        .partition(|c| c.role() == ClipRole::Primary);
    if primary_clips.is_empty() {
        return Err(CompilationError::NoPrimaryContent);
    }

    let mut pool: Vec<Passage> = primary_clips
        .iter()
        .flat_map(|clip| {
            let track = if clip.has_video {
                TrackRole::Primary
            } else {
                TrackRole::AudioOnly
            };
            build_passages(clip, track)
        })
        .collect();
    let speakers = speakers_in_order(&pool);

    let mut drafts = section_drafts(constraints);
    let mut used = UsedTuples::new();

    let mut carry = 0i64;
    for draft in &mut drafts {
        draft.budget_ticks = draft.target_ticks + carry;
        fill_section(draft, &mut pool, &mut used, &settings);
        carry = draft.deficit_ticks();
        debug!(
            section = %draft.template.name,
            picks = draft.picks.len(),
            filled = draft.filled_ticks(),
            target = draft.target_ticks,
            "Filled section"
        );
    }

    let speaker_shortfalls = include_speakers(&mut drafts, &mut pool, &mut used, &speakers, &settings);

    if drafts.iter().all(|d| d.picks.is_empty()) {
        return Err(CompilationError::NoPrimaryContent);
    }

    lay_out(&mut drafts);

    let primary_ticks: i64 = drafts
        .iter()
        .flat_map(|d| d.picks.iter())
        .filter(|p| p.track == TrackRole::Primary)
        .map(|p| p.duration_ticks())
        .sum();
    let goal = CoverageGoal::new(
        primary_ticks,
        constraints.min_broll_ratio,
        constraints.broll_tolerance,
    );
    let mut broll_pool = BrollPool::new(&broll_clips);
    let broll_ticks = cover_with_broll(&mut drafts, &mut broll_pool, &mut used, &goal, &settings);

    let plan = assemble(registry, resolver, constraints, drafts, speaker_shortfalls);

    info!(
        sections = plan.sections.len(),
        placements = plan.placement_count(),
        total_ticks = plan.stats.total_duration_ticks,
        broll_ratio = plan.stats.broll_ratio,
        "Compiled edit plan"
    );

    if goal.is_satisfied(broll_ticks) {
        Ok(plan)
    } else {
        warn!(
            achieved = plan.stats.broll_ratio,
            required = constraints.min_broll_ratio,
            "Broll coverage below target"
        );
        Err(CompilationError::PartialCoverage {
            achieved: plan.stats.broll_ratio,
            required: constraints.min_broll_ratio,
            plan: Box::new(plan),
        })
    }
}

fn section_drafts(constraints: &Constraints) -> Vec<SectionDraft> {
    let templates = constraints.section_templates();
    let total_weight: f64 = templates.iter().map(|t| t.weight).sum();
    let total_ticks = secs_to_ticks(constraints.target_duration_secs);

    templates
        .into_iter()
        .enumerate()
        .map(|(ordinal, template)| {
            let target_ticks = (total_ticks as f64 * template.weight / total_weight).round() as i64;
            SectionDraft {
                ordinal,
                target_ticks,
                budget_ticks: target_ticks,
                slack_ticks: (target_ticks as f64 * constraints.duration_tolerance).round() as i64,
                template,
                picks: Vec::new(),
                broll: Vec::new(),
            }
        })
        .collect()
}

/// Distinct speakers by first appearance (ingestion order, then time)
fn speakers_in_order(pool: &[Passage]) -> Vec<String> {
    let mut ordered: Vec<&Passage> = pool.iter().collect();
    ordered.sort_by_key(|p| (p.clip_ordinal, p.start_ticks()));

    let mut speakers: Vec<String> = Vec::new();
    for speaker in ordered.into_iter().filter_map(|p| p.speaker.as_ref()) {
        if !speakers.contains(speaker) {
            speakers.push(speaker.clone());
        }
    }
    speakers
}

/// Remove the passage at `idx` from the pool, cut at `cut_ticks`, returning the
/// remainder to the pool
fn claim(pool: &mut Vec<Passage>, idx: usize, cut_ticks: i64) -> Pick {
    let passage = pool.remove(idx);
    let (head, tail) = passage.split_at(cut_ticks);
    if let Some(tail) = tail {
        pool.push(tail);
    }
    Pick::from_passage(&head)
}

fn fill_section(draft: &mut SectionDraft, pool: &mut Vec<Passage>, used: &mut UsedTuples, settings: &Settings) {
    loop {
        let budget = draft.deficit_ticks();
        if budget <= draft.slack_ticks {
            break;
        }

        let scores = score_pool(pool, &draft.template.keywords);
        let mut order: Vec<usize> = (0..pool.len()).collect();
        order.sort_by(|&a, &b| candidate_order((&pool[a], scores[a]), (&pool[b], scores[b])));

        let chosen = order.into_iter().find_map(|idx| {
            let passage = &pool[idx];
            let cut = trim_point(passage, budget, draft.slack_ticks, settings.min_ticks)?;
            let tuple = (passage.clip.clone(), passage.start_ticks(), cut);
            (!used.contains(&tuple)).then_some((idx, cut, tuple))
        });

        match chosen {
            Some((idx, cut, tuple)) => {
                used.insert(tuple);
                let pick = claim(pool, idx, cut);
                draft.picks.push(pick);
            }
            None => break,
        }
    }
}

fn include_speakers(
    drafts: &mut [SectionDraft],
    pool: &mut Vec<Passage>,
    used: &mut UsedTuples,
    speakers: &[String],
    settings: &Settings,
) -> Vec<SpeakerShortfall> {
    let mut shortfalls = Vec::new();
    if settings.min_speaker_ticks <= 0 {
        return shortfalls;
    }

    for speaker in speakers {
        let mut placed: i64 = drafts
            .iter()
            .flat_map(|d| d.picks.iter())
            .filter(|p| p.speaker.as_ref() == Some(speaker))
            .map(|p| p.duration_ticks())
            .sum();

        while placed < settings.min_speaker_ticks {
            let need = settings.min_speaker_ticks - placed;

            let mut order: Vec<usize> = (0..pool.len())
                .filter(|&i| pool[i].speaker.as_ref() == Some(speaker))
                .collect();
            order.sort_by_key(|&i| {
                (
                    std::cmp::Reverse(pool[i].complete_sentence_words()),
                    pool[i].clip_ordinal,
                    pool[i].start_ticks(),
                )
            });

            let chosen = order.into_iter().find_map(|idx| {
                let passage = &pool[idx];
                let cut = trim_point(passage, need, need, settings.min_ticks)?;
                let tuple = (passage.clip.clone(), passage.start_ticks(), cut);
                (!used.contains(&tuple)).then_some((idx, cut, tuple))
            });

            let Some((idx, cut, tuple)) = chosen else {
                shortfalls.push(SpeakerShortfall {
                    speaker: speaker.clone(),
                    placed_ticks: placed,
                    required_ticks: settings.min_speaker_ticks,
                });
                break;
            };

            used.insert(tuple);
            let pick = claim(pool, idx, cut);
            placed += pick.duration_ticks();

            // Biggest deficit wins, lower ordinal on ties
            if let Some(target) = drafts
                .iter_mut()
                .max_by(|a, b| a.deficit_ticks().cmp(&b.deficit_ticks()).then(b.ordinal.cmp(&a.ordinal)))
            {
                debug!(speaker = %speaker, section = %target.template.name, "Added passage for speaker inclusion");
                target.picks.push(pick);
            }
        }
    }

    shortfalls
}

/// Sections back-to-back, picks sequential within a section
fn lay_out(drafts: &mut [SectionDraft]) {
    let mut cursor = 0i64;
    for draft in drafts.iter_mut() {
        for pick in &mut draft.picks {
            pick.record_in_ticks = cursor;
            cursor += pick.duration_ticks();
        }
    }
}

/// Section index, record in, length, covered so far
type BrollSpan = (usize, i64, i64, i64);

fn place_broll(drafts: &mut [SectionDraft], span: &mut BrollSpan, piece: BrollPiece, used: &mut UsedTuples) -> i64 {
    used.insert((piece.clip.clone(), piece.in_ticks, piece.out_ticks));
    let len = piece.duration_ticks();
    drafts[span.0].broll.push(Pick {
        clip: piece.clip,
        in_ticks: piece.in_ticks,
        out_ticks: piece.out_ticks,
        track: TrackRole::Broll,
        speaker: None,
        record_in_ticks: span.1 + span.3,
    });
    span.3 += len;
    len
}

/// Backfill then extend broll coverage; returns the covered ticks
fn cover_with_broll(
    drafts: &mut [SectionDraft],
    pool: &mut BrollPool,
    used: &mut UsedTuples,
    goal: &CoverageGoal,
    settings: &Settings,
) -> i64 {
    let mut spans: Vec<BrollSpan> = drafts
        .iter()
        .enumerate()
        .flat_map(|(section, d)| {
            d.picks
                .iter()
                .filter(|p| p.track == TrackRole::Primary)
                .map(move |p| (section, p.record_in_ticks, p.duration_ticks(), 0i64))
        })
        .collect();
    let mut total = 0i64;

    // Backfill: one piece per primary span in plan order, exactly covering it
    for span in spans.iter_mut() {
        if total >= goal.target_ticks {
            break;
        }
        let mut len = span.2;
        if total + len > goal.upper_ticks {
            len = goal.target_ticks - total;
        }
        if len < settings.min_ticks {
            continue;
        }
        match pool.take(len, settings.min_ticks) {
            Some(piece) => total += place_broll(drafts, span, piece, used),
            None => break,
        }
    }

    if goal.is_satisfied(total) {
        return total;
    }

    // Extension: fill gaps on the longest sections first
    let mut section_order: Vec<usize> = (0..drafts.len()).collect();
    section_order.sort_by_key(|&i| (std::cmp::Reverse(drafts[i].filled_ticks()), drafts[i].ordinal));

    'sections: for section in section_order {
        for span in spans.iter_mut().filter(|s| s.0 == section) {
            loop {
                if total >= goal.target_ticks {
                    break 'sections;
                }
                let gap = span.2 - span.3;
                if gap < settings.min_ticks {
                    break;
                }
                let want = (goal.target_ticks - total).max(settings.min_ticks).min(gap);
                match pool.take(want, settings.min_ticks) {
                    Some(piece) => total += place_broll(drafts, span, piece, used),
                    None => break 'sections,
                }
            }
        }
    }

    if pool.is_exhausted(settings.min_ticks) && !goal.is_satisfied(total) {
        warn!(covered = total, required = goal.lower_ticks, "Broll material exhausted");
    }

    total
}

fn assemble(
    registry: &ClipRegistry,
    resolver: &ColorResolver,
    constraints: &Constraints,
    drafts: Vec<SectionDraft>,
    speaker_shortfalls: Vec<SpeakerShortfall>,
) -> EditPlan {
    let preset_for = |key: &ClipKey| {
        registry
            .get(key)
            .map(|clip| resolver.resolve(clip))
            .unwrap_or_else(|| resolver.library().fallback())
            .id
            .clone()
    };

    let sections: Vec<Section> = drafts
        .into_iter()
        .map(|draft| {
            let mut placements: Vec<Placement> = draft
                .picks
                .into_iter()
                .chain(draft.broll)
                .map(|pick| Placement {
                    preset_id: preset_for(&pick.clip),
                    clip: pick.clip,
                    in_ticks: pick.in_ticks,
                    out_ticks: pick.out_ticks,
                    record_in_ticks: pick.record_in_ticks,
                    track: pick.track,
                    speaker: pick.speaker,
                })
                .collect();
            placements.sort_by_key(|p| (p.record_in_ticks, p.track));

            Section {
                name: draft.template.name,
                ordinal: draft.ordinal,
                target_duration_ticks: draft.target_ticks,
                placements,
            }
        })
        .collect();

    let stats = compute_stats(registry, constraints, &sections, speaker_shortfalls);
    EditPlan {
        sections,
        constraints: constraints.clone(),
        stats,
    }
}

fn compute_stats(
    registry: &ClipRegistry,
    constraints: &Constraints,
    sections: &[Section],
    speaker_shortfalls: Vec<SpeakerShortfall>,
) -> PlanStats {
    let mut primary_ticks = 0;
    let mut broll_ticks = 0;
    let mut audio_only_ticks = 0;
    let mut per_speaker_ticks: BTreeMap<String, i64> = BTreeMap::new();

    for placement in sections.iter().flat_map(|s| s.placements.iter()) {
        match placement.track {
            TrackRole::Primary => primary_ticks += placement.duration_ticks(),
            TrackRole::Broll => broll_ticks += placement.duration_ticks(),
            TrackRole::AudioOnly => audio_only_ticks += placement.duration_ticks(),
        }
        if placement.track == TrackRole::Broll {
            continue;
        }

        let Some(clip) = registry.get(&placement.clip) else {
            continue;
        };
        for segment in &clip.transcript {
            let overlap = placement.out_ticks.min(segment.end_ticks) - placement.in_ticks.max(segment.start_ticks);
            if let (Some(speaker), true) = (&segment.speaker, overlap > 0) {
                *per_speaker_ticks.entry(speaker.clone()).or_insert(0) += overlap;
            }
        }
    }

    let target_duration_ticks = secs_to_ticks(constraints.target_duration_secs);
    let total_duration_ticks: i64 = sections.iter().map(|s| s.duration_ticks()).sum();
    let tolerance_ticks = (target_duration_ticks as f64 * constraints.duration_tolerance).round() as i64;

    PlanStats {
        target_duration_ticks,
        total_duration_ticks,
        duration_within_tolerance: (total_duration_ticks - target_duration_ticks).abs() <= tolerance_ticks,
        primary_ticks,
        broll_ticks,
        audio_only_ticks,
        broll_ratio: if primary_ticks > 0 {
            broll_ticks as f64 / primary_ticks as f64
        } else {
            0.0
        },
        per_speaker_ticks,
        speaker_shortfalls,
    }
}
