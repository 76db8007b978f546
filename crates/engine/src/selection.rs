//! Primary-content candidates: transcript passages, their relevance and trimming.

use std::cmp::Ordering;

use crate::registry::{Clip, ClipKey, TranscriptSegment};
use crate::timeline::{TrackRole, TICKS_PER_SECOND};

/// Pause that splits a passage even when the speaker keeps talking
const MAX_PASSAGE_GAP_TICKS: i64 = TICKS_PER_SECOND * 3 / 2;
const RECENCY_SCALE: u64 = 1000;
/// Later takes within a clip gain up to this much (per mille)
const RECENCY_MAX_BONUS: u64 = 100;

/// Consecutive transcript segments of one speaker, cut only at segment boundaries
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Passage {
    pub clip: ClipKey,
    pub clip_ordinal: usize,
    pub clip_duration_ticks: i64,
    pub track: TrackRole,
    pub speaker: Option<String>,
    pub segments: Vec<TranscriptSegment>,
}

impl Passage {
    pub fn start_ticks(&self) -> i64 {
        self.segments.first().map_or(0, |s| s.start_ticks)
    }

    pub fn end_ticks(&self) -> i64 {
        self.segments.last().map_or(0, |s| s.end_ticks)
    }

    pub fn duration_ticks(&self) -> i64 {
        self.end_ticks() - self.start_ticks()
    }

    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Words inside complete sentences
    pub fn complete_sentence_words(&self) -> usize {
        let last_sentence_end = self.segments.iter().rposition(|s| s.ends_sentence());
        match last_sentence_end {
            Some(idx) => self.segments[..=idx].iter().map(|s| s.word_count()).sum(),
            None => 0,
        }
    }

    /// Points where the passage may be cut: sentence ends plus the passage end
    pub fn cut_points(&self) -> Vec<i64> {
        let mut points: Vec<i64> = self
            .segments
            .iter()
            .filter(|s| s.ends_sentence())
            .map(|s| s.end_ticks)
            .collect();
        let end = self.end_ticks();
        if points.last() != Some(&end) {
            points.push(end);
        }
        points
    }

    /// Split at a cut point, returning the untouched remainder
    pub fn split_at(&self, cut_ticks: i64) -> (Passage, Option<Passage>) {
        let (head, tail): (Vec<_>, Vec<_>) = self
            .segments
            .iter()
            .cloned()
            .partition(|s| s.end_ticks <= cut_ticks);
        let head = Passage {
            segments: head,
            ..self.clone()
        };
        let tail = if tail.is_empty() {
            None
        } else {
            Some(Passage {
                segments: tail,
                ..self.clone()
            })
        };
        (head, tail)
    }
}

pub(crate) fn build_passages(clip: &Clip, track: TrackRole) -> Vec<Passage> {
    let mut passages: Vec<Passage> = Vec::new();
    let mut current: Vec<TranscriptSegment> = Vec::new();

    let flush = |current: &mut Vec<TranscriptSegment>, passages: &mut Vec<Passage>| {
        if current.is_empty() {
            return;
        }
        passages.push(Passage {
            clip: clip.key.clone(),
            clip_ordinal: clip.ordinal,
            clip_duration_ticks: clip.duration_ticks,
            track,
            speaker: current[0].speaker.clone(),
            segments: std::mem::take(current),
        });
    };

    for segment in clip.transcript.iter().filter(|s| !s.text.trim().is_empty()) {
        if let Some(prev) = current.last() {
            let gap = segment.start_ticks - prev.end_ticks;
            if prev.speaker != segment.speaker || gap > MAX_PASSAGE_GAP_TICKS {
                flush(&mut current, &mut passages);
            }
        }
        current.push(segment.clone());
    }
    flush(&mut current, &mut passages);

    passages
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Whole-word (or whole-phrase) keyword occurrences, case-insensitive
pub(crate) fn keyword_hits(text: &str, keywords: &[String]) -> u64 {
    let words = tokenize(text);
    let mut hits = 0u64;
    for keyword in keywords {
        let phrase = tokenize(keyword);
        if phrase.is_empty() || phrase.len() > words.len() {
            continue;
        }
        hits += words
            .windows(phrase.len())
            .filter(|window| *window == phrase.as_slice())
            .count() as u64;
    }
    hits
}

/// Salience weighted towards later takes within the clip
pub(crate) fn relevance(passage: &Passage, salience: u64) -> u64 {
    let recency = if passage.clip_duration_ticks > 0 {
        (passage.start_ticks().max(0) as u64 * RECENCY_MAX_BONUS
            / passage.clip_duration_ticks as u64)
            .min(RECENCY_MAX_BONUS)
    } else {
        0
    };
    salience * (RECENCY_SCALE + recency)
}

/// Relevance of every pooled passage for a section
pub(crate) fn score_pool(pool: &[Passage], keywords: &[String]) -> Vec<u64> {
    let anchor_scores: Vec<u64> = pool.iter().map(|p| keyword_hits(&p.text(), keywords)).collect();
    let anchored = anchor_scores.iter().any(|&hits| hits > 0);

    pool.iter()
        .zip(anchor_scores)
        .map(|(passage, hits)| {
            let salience = if anchored {
                hits
            } else {
                passage.complete_sentence_words() as u64
            };
            relevance(passage, salience)
        })
        .collect()
}

/// Higher relevance first, then ingestion order, then position in clip
pub(crate) fn candidate_order(a: (&Passage, u64), b: (&Passage, u64)) -> Ordering {
    b.1.cmp(&a.1)
        .then(a.0.clip_ordinal.cmp(&b.0.clip_ordinal))
        .then(a.0.start_ticks().cmp(&b.0.start_ticks()))
}

/// Out-point for a passage given the remaining budget.
///
/// Whole passage when it fits within `budget + slack`, otherwise the cut point
/// nearest `start + budget` among those that fit; shorter wins ties.
pub(crate) fn trim_point(
    passage: &Passage,
    budget_ticks: i64,
    slack_ticks: i64,
    min_ticks: i64,
) -> Option<i64> {
    let start = passage.start_ticks();
    let limit = budget_ticks + slack_ticks;
    if passage.duration_ticks() <= limit {
        return (passage.duration_ticks() >= min_ticks).then(|| passage.end_ticks());
    }

    let ideal = start + budget_ticks;
    passage
        .cut_points()
        .into_iter()
        .filter(|&p| p - start >= min_ticks && p - start <= limit)
        .min_by_key(|&p| ((p - ideal).abs(), p))
}
