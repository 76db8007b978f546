use serde::{Deserialize, Serialize};

pub const TICKS_PER_SECOND: i64 = 48000;

/// Convert seconds to ticks, rounding to the nearest tick
pub fn secs_to_ticks(seconds: f64) -> i64 {
    (seconds * TICKS_PER_SECOND as f64).round() as i64
}

pub fn ticks_to_secs(ticks: i64) -> f64 {
    ticks as f64 / TICKS_PER_SECOND as f64
}

/// Destination track of a placement on the external timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackRole {
    Primary,
    Broll,
    AudioOnly,
}

impl TrackRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackRole::Primary => "primary",
            TrackRole::Broll => "broll",
            TrackRole::AudioOnly => "audio_only",
        }
    }

    /// CMX3600 track code
    pub fn edl_code(&self) -> &'static str {
        match self {
            TrackRole::Primary => "B",
            TrackRole::Broll => "V",
            TrackRole::AudioOnly => "A",
        }
    }

    /// Whether grading applies to this track
    pub fn is_graded(&self) -> bool {
        !matches!(self, TrackRole::AudioOnly)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipInstance {
    pub clip: String,
    pub in_ticks: i64,
    pub out_ticks: i64,
    pub timeline_start_ticks: i64,
    pub section_ordinal: usize,
    pub placement_index: usize,
}

impl ClipInstance {
    pub fn duration_ticks(&self) -> i64 {
        self.out_ticks - self.in_ticks
    }

    pub fn timeline_end_ticks(&self) -> i64 {
        self.timeline_start_ticks + self.duration_ticks()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub role: TrackRole,
    pub clips: Vec<ClipInstance>,
}

/// Track-oriented view of an edit plan, clips sorted by timeline position
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub tracks: Vec<Track>,
}

impl Timeline {
    pub fn new() -> Self {
        Timeline { tracks: Vec::new() }
    }

    pub fn track(&self, role: TrackRole) -> Option<&Track> {
        self.tracks.iter().find(|t| t.role == role)
    }

    pub(crate) fn track_mut(&mut self, role: TrackRole) -> &mut Track {
        if let Some(idx) = self.tracks.iter().position(|t| t.role == role) {
            return &mut self.tracks[idx];
        }
        self.tracks.push(Track {
            role,
            clips: Vec::new(),
        });
        let last = self.tracks.len() - 1;
        &mut self.tracks[last]
    }

    /// End of the last clip on any track
    pub fn duration_ticks(&self) -> i64 {
        self.tracks
            .iter()
            .flat_map(|t| t.clips.iter())
            .map(|c| c.timeline_end_ticks())
            .max()
            .unwrap_or(0)
    }
}

/// Non-drop timecode at an integer frame rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timecode {
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
    pub frames: u64,
}

impl Timecode {
    pub fn from_ticks(ticks: i64, fps: f64) -> Self {
        let fps_int = (fps.round() as u64).max(1);
        let total_frames = (ticks.max(0) as f64 * fps / TICKS_PER_SECOND as f64).round() as u64;
        let frames_per_minute = fps_int.saturating_mul(60);
        let frames_per_hour = frames_per_minute.saturating_mul(60);

        let hours = total_frames / frames_per_hour;
        let remaining = total_frames % frames_per_hour;
        let minutes = remaining / frames_per_minute;
        let remaining = remaining % frames_per_minute;

        Timecode {
            hours,
            minutes,
            seconds: remaining / fps_int,
            frames: remaining % fps_int,
        }
    }
}

impl std::fmt::Display for Timecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}:{:02}",
            self.hours, self.minutes, self.seconds, self.frames
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secs_round_trip_is_exact_for_whole_frames() {
        assert_eq!(secs_to_ticks(1.5), 72000);
        assert_eq!(ticks_to_secs(72000), 1.5);
        assert_eq!(secs_to_ticks(0.0), 0);
    }

    #[test]
    fn test_timecode_formatting() {
        let tc = Timecode::from_ticks(secs_to_ticks(3723.5), 24.0);
        assert_eq!(tc.to_string(), "01:02:03:12");

        let zero = Timecode::from_ticks(0, 30.0);
        assert_eq!(zero.to_string(), "00:00:00:00");
    }

    #[test]
    fn test_timecode_at_absurd_frame_rate_does_not_overflow() {
        let tc = Timecode::from_ticks(secs_to_ticks(2.0), 5_000_000.0);
        assert_eq!(tc.to_string(), "00:00:02:00");
    }

    #[test]
    fn test_track_mut_creates_once() {
        let mut timeline = Timeline::new();
        timeline.track_mut(TrackRole::Broll);
        timeline.track_mut(TrackRole::Broll);
        assert_eq!(timeline.tracks.len(), 1);
        assert!(timeline.track(TrackRole::Primary).is_none());
    }
}
