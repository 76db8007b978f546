//! Clip Registry
//!
//! Canonical representation of every source clip and the analysis attached to it.
//! Populated once from the external metadata feed and immutable afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::warn;

use crate::timeline::secs_to_ticks;

/// Dominant scene tags above this confidence can demote a talking clip to broll
const SCENERY_CONFIDENCE: f64 = 0.8;
/// Speech share below which a scenery clip counts as broll
const AMBIENT_SPEECH_SHARE: f64 = 0.2;

#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("Clip path is empty")]
    EmptyPath,

    #[error("Duplicate clip: {0}")]
    DuplicateClip(String),

    #[error("Invalid duration for {path}: {duration}")]
    InvalidDuration { path: String, duration: f64 },

    #[error("Invalid clip feed: {0}")]
    InvalidFeed(String),
}

/// Stable path-derived identity of a clip
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClipKey(String);

impl ClipKey {
    pub fn from_path(path: &str) -> Self {
        ClipKey(path.trim().replace('\\', "/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path component
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for ClipKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraSignature {
    Dji,
    Iphone,
    Sony,
    GoPro,
    Unknown,
}

impl CameraSignature {
    /// Lenient parse of the feed's free-form camera string
    pub fn parse(raw: &str) -> Self {
        let normalized: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "dji" | "djidrone" | "mavic" | "djimavic" => CameraSignature::Dji,
            "iphone" | "apple" | "appleiphone" => CameraSignature::Iphone,
            "sony" | "sonyalpha" | "sonyfx3" | "sonya7" => CameraSignature::Sony,
            "gopro" | "goprohero" => CameraSignature::GoPro,
            _ => CameraSignature::Unknown,
        }
    }

    /// Cameras whose footage is aerial and never carries primary content
    pub fn is_aerial(&self) -> bool {
        matches!(self, CameraSignature::Dji)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShotScale {
    ExtremeWide,
    Wide,
    Medium,
    CloseUp,
    ExtremeCloseUp,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Person,
    Product,
    Screen,
    Scenery,
    Aerial,
    Object,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneTag {
    pub shot_scale: ShotScale,
    pub subject: Subject,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start_ticks: i64,
    pub end_ticks: i64,
    pub text: String,
    pub speaker: Option<String>,
}

impl TranscriptSegment {
    pub fn duration_ticks(&self) -> i64 {
        self.end_ticks - self.start_ticks
    }

    /// Segment text ends a sentence
    pub fn ends_sentence(&self) -> bool {
        let trimmed = self.text.trim_end_matches(|c: char| c == '"' || c == '\'' || c == ')' || c.is_whitespace());
        trimmed.ends_with(['.', '!', '?', '…'])
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Which side of the edit a clip can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipRole {
    Primary,
    Broll,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub key: ClipKey,
    /// Position in ingestion order
    pub ordinal: usize,
    pub duration_ticks: i64,
    pub camera: CameraSignature,
    pub has_video: bool,
    pub transcript: Vec<TranscriptSegment>,
    pub scene_tags: Vec<SceneTag>,
}

impl Clip {
    pub fn has_speech(&self) -> bool {
        self.transcript.iter().any(|s| !s.text.trim().is_empty())
    }

    pub fn speech_ticks(&self) -> i64 {
        self.transcript.iter().map(|s| s.duration_ticks()).sum()
    }

    /// Highest-confidence scene tag, first one wins on ties
    pub fn dominant_tag(&self) -> Option<&SceneTag> {
        self.scene_tags.iter().fold(None, |best: Option<&SceneTag>, tag| match best {
            Some(b) if b.confidence >= tag.confidence => Some(b),
            _ => Some(tag),
        })
    }

    pub fn role(&self) -> ClipRole {
        if self.camera.is_aerial() || !self.has_speech() {
            return ClipRole::Broll;
        }

        let scenery = self.dominant_tag().map_or(false, |tag| {
            matches!(tag.subject, Subject::Scenery | Subject::Aerial)
                && tag.confidence >= SCENERY_CONFIDENCE
        });
        let speech_share = if self.duration_ticks > 0 {
            self.speech_ticks() as f64 / self.duration_ticks as f64
        } else {
            0.0
        };

        if scenery && speech_share < AMBIENT_SPEECH_SHARE {
            ClipRole::Broll
        } else {
            ClipRole::Primary
        }
    }
}

// =============================================================================
// Feed shape (seconds, free-form strings)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub speaker: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSceneTag {
    pub shot_scale: ShotScale,
    pub subject: Subject,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipFeedEntry {
    pub path: String,
    pub duration: f64,
    #[serde(default)]
    pub camera_signature: Option<String>,
    #[serde(default)]
    pub transcript_segments: Vec<FeedSegment>,
    #[serde(default)]
    pub scene_tags: Vec<FeedSceneTag>,
    #[serde(default = "default_has_video")]
    pub has_video: bool,
}

fn default_has_video() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipRegistry {
    clips: Vec<Clip>,
}

impl ClipRegistry {
    pub fn from_feed(entries: Vec<ClipFeedEntry>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        let mut clips = Vec::with_capacity(entries.len());

        for (ordinal, entry) in entries.into_iter().enumerate() {
            if entry.path.trim().is_empty() {
                return Err(RegistryError::EmptyPath);
            }
            if !entry.duration.is_finite() || entry.duration < 0.0 {
                return Err(RegistryError::InvalidDuration {
                    path: entry.path,
                    duration: entry.duration,
                });
            }

            let key = ClipKey::from_path(&entry.path);
            if !seen.insert(key.clone()) {
                return Err(RegistryError::DuplicateClip(key.to_string()));
            }

            let duration_ticks = secs_to_ticks(entry.duration);
            let transcript = normalize_transcript(&key, duration_ticks, entry.transcript_segments);
            let scene_tags = entry
                .scene_tags
                .into_iter()
                .map(|t| SceneTag {
                    shot_scale: t.shot_scale,
                    subject: t.subject,
                    confidence: if t.confidence.is_finite() {
                        t.confidence.clamp(0.0, 1.0)
                    } else {
                        0.0
                    },
                })
                .collect();

            clips.push(Clip {
                key,
                ordinal,
                duration_ticks,
                camera: entry
                    .camera_signature
                    .as_deref()
                    .map(CameraSignature::parse)
                    .unwrap_or(CameraSignature::Unknown),
                has_video: entry.has_video,
                transcript,
                scene_tags,
            });
        }

        Ok(ClipRegistry { clips })
    }

    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        let entries: Vec<ClipFeedEntry> =
            serde_json::from_str(json).map_err(|e| RegistryError::InvalidFeed(e.to_string()))?;
        Self::from_feed(entries)
    }

    /// Clips in ingestion order
    pub fn clips(&self) -> &[Clip] {
        &self.clips
    }

    pub fn get(&self, key: &ClipKey) -> Option<&Clip> {
        self.clips.iter().find(|c| &c.key == key)
    }

    pub fn len(&self) -> usize {
        self.clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }
}

/// Sort, clamp and de-overlap transcript segments from the feed
fn normalize_transcript(
    key: &ClipKey,
    duration_ticks: i64,
    segments: Vec<FeedSegment>,
) -> Vec<TranscriptSegment> {
    let mut converted: Vec<TranscriptSegment> = segments
        .into_iter()
        .filter(|s| s.start.is_finite() && s.end.is_finite())
        .map(|s| TranscriptSegment {
            start_ticks: secs_to_ticks(s.start).max(0),
            end_ticks: secs_to_ticks(s.end).min(duration_ticks),
            text: s.text.trim().to_string(),
            speaker: s.speaker.filter(|sp| !sp.trim().is_empty()),
        })
        .collect();
    converted.sort_by_key(|s| (s.start_ticks, s.end_ticks));

    let mut result: Vec<TranscriptSegment> = Vec::with_capacity(converted.len());
    for segment in converted {
        if segment.end_ticks <= segment.start_ticks {
            warn!(clip = %key, start = segment.start_ticks, "Dropping empty transcript segment");
            continue;
        }
        if let Some(prev) = result.last() {
            if segment.start_ticks < prev.end_ticks {
                warn!(clip = %key, start = segment.start_ticks, "Dropping overlapping transcript segment");
                continue;
            }
        }
        result.push(segment);
    }
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn segment(start: f64, end: f64, text: &str, speaker: Option<&str>) -> FeedSegment {
        FeedSegment {
            start,
            end,
            text: text.to_string(),
            speaker: speaker.map(str::to_string),
        }
    }

    pub fn entry(path: &str, duration: f64, camera: &str) -> ClipFeedEntry {
        ClipFeedEntry {
            path: path.to_string(),
            duration,
            camera_signature: Some(camera.to_string()),
            transcript_segments: Vec::new(),
            scene_tags: Vec::new(),
            has_video: true,
        }
    }

    #[test]
    fn test_ingestion_keeps_order_and_normalizes_keys() {
        let registry = ClipRegistry::from_feed(vec![
            entry("C:\\shoot\\A001.MP4", 10.0, "sony"),
            entry("  /shoot/DJI_0001.MP4 ", 20.0, "DJI"),
        ])
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.clips()[0].key.as_str(), "C:/shoot/A001.MP4");
        assert_eq!(registry.clips()[1].key.file_name(), "DJI_0001.MP4");
        assert_eq!(registry.clips()[1].ordinal, 1);
        assert_eq!(registry.clips()[1].camera, CameraSignature::Dji);
    }

    #[test]
    fn test_duplicate_and_invalid_entries_rejected() {
        let dup = ClipRegistry::from_feed(vec![entry("a.mp4", 1.0, ""), entry("a.mp4", 2.0, "")]);
        assert_eq!(dup, Err(RegistryError::DuplicateClip("a.mp4".to_string())));

        let negative = ClipRegistry::from_feed(vec![entry("b.mp4", -1.0, "")]);
        assert!(matches!(negative, Err(RegistryError::InvalidDuration { .. })));

        let empty = ClipRegistry::from_feed(vec![entry("  ", 1.0, "")]);
        assert_eq!(empty, Err(RegistryError::EmptyPath));
    }

    #[test]
    fn test_transcript_is_sorted_clamped_and_deoverlapped() {
        let mut e = entry("talk.mp4", 10.0, "iphone");
        e.transcript_segments = vec![
            segment(5.0, 7.0, "Second.", Some("s1")),
            segment(0.0, 3.0, "First.", Some("s1")),
            segment(2.0, 4.0, "Overlap.", Some("s2")),
            segment(8.0, 12.0, "Clamped.", Some("")),
            segment(9.5, 9.5, "Empty.", None),
        ];
        let registry = ClipRegistry::from_feed(vec![e]).unwrap();
        let transcript = &registry.clips()[0].transcript;

        assert_eq!(transcript.len(), 3);
        assert_eq!(transcript[0].text, "First.");
        assert_eq!(transcript[1].text, "Second.");
        assert_eq!(transcript[2].end_ticks, secs_to_ticks(10.0));
        assert_eq!(transcript[2].speaker, None);
        assert!(transcript.windows(2).all(|w| w[0].end_ticks <= w[1].start_ticks));
    }

    #[test]
    fn test_camera_parse_is_lenient() {
        assert_eq!(CameraSignature::parse("DJI Mavic"), CameraSignature::Dji);
        assert_eq!(CameraSignature::parse("iPhone"), CameraSignature::Iphone);
        assert_eq!(CameraSignature::parse("go-pro"), CameraSignature::GoPro);
        assert_eq!(CameraSignature::parse("Sony FX3"), CameraSignature::Sony);
        assert_eq!(CameraSignature::parse("RED Komodo"), CameraSignature::Unknown);
    }

    #[test]
    fn test_clip_roles() {
        let mut talking = entry("talk.mp4", 30.0, "sony");
        talking.transcript_segments = vec![segment(0.0, 10.0, "Hello there.", Some("s1"))];

        let mut drone = entry("DJI_0001.MP4", 30.0, "dji");
        drone.transcript_segments = vec![segment(0.0, 10.0, "Wind noise.", None)];

        let mut scenic = entry("beach.mp4", 60.0, "iphone");
        scenic.transcript_segments = vec![segment(0.0, 2.0, "Wow.", None)];
        scenic.scene_tags = vec![FeedSceneTag {
            shot_scale: ShotScale::ExtremeWide,
            subject: Subject::Scenery,
            confidence: 0.9,
        }];

        let silent = entry("cutaway.mp4", 10.0, "sony");

        let registry = ClipRegistry::from_feed(vec![talking, drone, scenic, silent]).unwrap();
        let roles: Vec<ClipRole> = registry.clips().iter().map(|c| c.role()).collect();
        assert_eq!(
            roles,
            vec![ClipRole::Primary, ClipRole::Broll, ClipRole::Broll, ClipRole::Broll]
        );
    }

    #[test]
    fn test_from_json_feed() {
        let json = r#"[
            {"path": "a.mp4", "duration": 12.5, "camera_signature": "gopro",
             "transcript_segments": [{"start": 0.0, "end": 2.0, "text": "Hi.", "speaker": "s1"}],
             "scene_tags": [{"shot_scale": "wide", "subject": "person", "confidence": 1.4}]},
            {"path": "b.wav", "duration": 5.0, "has_video": false}
        ]"#;
        let registry = ClipRegistry::from_json(json).unwrap();
        assert_eq!(registry.clips()[0].scene_tags[0].confidence, 1.0);
        assert!(!registry.clips()[1].has_video);
        assert_eq!(registry.clips()[1].camera, CameraSignature::Unknown);

        assert!(matches!(
            ClipRegistry::from_json("{not json"),
            Err(RegistryError::InvalidFeed(_))
        ));
    }
}
