//! Presentation timestamp derivation for outbound tracks

use super::frame::TimeBase;

/// Derives strictly increasing presentation timestamps for one track
///
/// Inbound timestamps are rescaled into the clock's time base. A timestamp
/// that does not advance past the last emitted one is clamped to
/// `last + 1`, so jitter or reordering upstream never produces a
/// non-increasing sequence downstream.
#[derive(Debug, Clone)]
pub struct FrameClock {
    time_base: TimeBase,
    last_pts: Option<i64>,
}

impl FrameClock {
    pub fn new(time_base: TimeBase) -> Self {
        Self {
            time_base,
            last_pts: None,
        }
    }

    /// Derive the outbound timestamp for a frame stamped `pts` in `source_base`
    pub fn stamp(&mut self, pts: i64, source_base: TimeBase) -> (i64, TimeBase) {
        let pts = source_base.rescale(pts, self.time_base);
        let out = match self.last_pts {
            Some(last) if pts <= last => last.saturating_add(1),
            _ => pts,
        };
        self.last_pts = Some(out);
        (out, self.time_base)
    }

    /// Last emitted timestamp, if any frame has been stamped
    pub fn last_pts(&self) -> Option<i64> {
        self.last_pts
    }

    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new(TimeBase::video())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp_all(clock: &mut FrameClock, input: &[i64]) -> Vec<i64> {
        input
            .iter()
            .map(|&pts| clock.stamp(pts, TimeBase::video()).0)
            .collect()
    }

    #[test]
    fn test_clamps_repeated_and_backwards() {
        let mut clock = FrameClock::default();
        assert_eq!(stamp_all(&mut clock, &[100, 100, 99, 150]), vec![100, 101, 102, 150]);
    }

    #[test]
    fn test_monotonic_input_passes_through() {
        let mut clock = FrameClock::default();
        assert_eq!(stamp_all(&mut clock, &[0, 3000, 6000]), vec![0, 3000, 6000]);
        assert_eq!(clock.last_pts(), Some(6000));
    }

    #[test]
    fn test_long_stall_keeps_increasing() {
        let mut clock = FrameClock::default();
        let out = stamp_all(&mut clock, &[500, 10, 10, 10, 10, 502, 503]);
        assert!(out.windows(2).all(|w| w[0] < w[1]), "{:?}", out);
        assert_eq!(out, vec![500, 501, 502, 503, 504, 505, 506]);
    }

    #[test]
    fn test_rescales_source_time_base() {
        let mut clock = FrameClock::new(TimeBase::video());
        let (pts, tb) = clock.stamp(1000, TimeBase::new(1, 1000));
        assert_eq!(pts, 90_000);
        assert_eq!(tb, TimeBase::video());
    }
}
