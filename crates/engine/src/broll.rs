//! Broll supply and coverage bookkeeping.
//!
//! Broll is drawn sequentially from each source clip (a per-clip cursor) and the
//! sources are visited round-robin, so usage spreads evenly and no
//! `(clip, in, out)` tuple can repeat.

use crate::registry::{Clip, ClipKey};

#[derive(Debug, Clone)]
struct BrollSource {
    clip: ClipKey,
    duration_ticks: i64,
    cursor_ticks: i64,
}

impl BrollSource {
    fn remaining_ticks(&self) -> i64 {
        self.duration_ticks - self.cursor_ticks
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BrollPiece {
    pub clip: ClipKey,
    pub in_ticks: i64,
    pub out_ticks: i64,
}

impl BrollPiece {
    pub fn duration_ticks(&self) -> i64 {
        self.out_ticks - self.in_ticks
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BrollPool {
    sources: Vec<BrollSource>,
    next: usize,
}

impl BrollPool {
    /// Sources in ingestion order
    pub fn new(clips: &[&Clip]) -> Self {
        BrollPool {
            sources: clips
                .iter()
                .filter(|c| c.has_video && c.duration_ticks > 0)
                .map(|c| BrollSource {
                    clip: c.key.clone(),
                    duration_ticks: c.duration_ticks,
                    cursor_ticks: 0,
                })
                .collect(),
            next: 0,
        }
    }

    pub fn is_exhausted(&self, min_ticks: i64) -> bool {
        self.sources.iter().all(|s| s.remaining_ticks() < min_ticks)
    }

    /// Next piece of at most `max_ticks`, from the next source in rotation that
    /// still has `min_ticks` of material
    pub fn take(&mut self, max_ticks: i64, min_ticks: i64) -> Option<BrollPiece> {
        if self.sources.is_empty() || max_ticks < min_ticks || max_ticks <= 0 {
            return None;
        }

        let count = self.sources.len();
        for step in 0..count {
            let idx = (self.next + step) % count;
            let source = &mut self.sources[idx];
            if source.remaining_ticks() < min_ticks.max(1) {
                continue;
            }

            let len = max_ticks.min(source.remaining_ticks());
            let piece = BrollPiece {
                clip: source.clip.clone(),
                in_ticks: source.cursor_ticks,
                out_ticks: source.cursor_ticks + len,
            };
            source.cursor_ticks += len;
            self.next = (idx + 1) % count;
            return Some(piece);
        }
        None
    }
}

/// Broll ratio band in ticks of broll for a given amount of primary content
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct CoverageGoal {
    pub lower_ticks: i64,
    pub target_ticks: i64,
    pub upper_ticks: i64,
}

impl CoverageGoal {
    pub fn new(primary_ticks: i64, ratio: f64, tolerance: f64) -> Self {
        let primary = primary_ticks as f64;
        CoverageGoal {
            lower_ticks: ((ratio - tolerance) * primary).ceil().max(0.0) as i64,
            target_ticks: (ratio * primary).ceil().max(0.0) as i64,
            upper_ticks: ((ratio + tolerance) * primary).floor() as i64,
        }
    }

    pub fn is_satisfied(&self, broll_ticks: i64) -> bool {
        broll_ticks >= self.lower_ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::entry;
    use crate::registry::ClipRegistry;
    use crate::timeline::secs_to_ticks;

    fn pool(durations: &[f64]) -> BrollPool {
        let entries = durations
            .iter()
            .enumerate()
            .map(|(i, d)| entry(&format!("broll_{i}.mp4"), *d, "dji"))
            .collect();
        let registry = ClipRegistry::from_feed(entries).unwrap();
        let clips: Vec<&Clip> = registry.clips().iter().collect();
        BrollPool::new(&clips)
    }

    #[test]
    fn test_round_robin_with_cursors() {
        let mut pool = pool(&[10.0, 10.0]);
        let s = secs_to_ticks(1.0);

        let a = pool.take(4 * s, s).unwrap();
        let b = pool.take(4 * s, s).unwrap();
        let c = pool.take(4 * s, s).unwrap();

        assert_eq!(a.clip.as_str(), "broll_0.mp4");
        assert_eq!(b.clip.as_str(), "broll_1.mp4");
        assert_eq!((c.clip.as_str(), c.in_ticks, c.out_ticks), ("broll_0.mp4", 4 * s, 8 * s));
    }

    #[test]
    fn test_take_is_bounded_by_remaining_material() {
        let mut pool = pool(&[3.0]);
        let s = secs_to_ticks(1.0);

        assert_eq!(pool.take(10 * s, s).unwrap().duration_ticks(), 3 * s);
        assert!(pool.take(10 * s, s).is_none());
        assert!(pool.is_exhausted(s));
    }

    #[test]
    fn test_coverage_goal_band() {
        let goal = CoverageGoal::new(1000, 0.5, 0.05);
        assert_eq!(goal.lower_ticks, 450);
        assert_eq!(goal.target_ticks, 500);
        assert_eq!(goal.upper_ticks, 550);
        assert!(goal.is_satisfied(450));
        assert!(!goal.is_satisfied(449));
    }
}
