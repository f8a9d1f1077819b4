/// Slow-moving display bounds derived from each frame's extremes.
///
/// The raw ceiling and floor of a frame are padded by `margin` and then
/// passed through two cascaded moving averages each. Since the raw ceiling
/// never drops below the raw floor, the smoothed ceiling always stays at
/// least `2 * margin` above the smoothed floor.
#[derive(Debug, Clone)]
pub struct AutoLevel {
    margin: f32,
    factor: f32,
    ceiling: f32,
    ceiling_slow: f32,
    floor: f32,
    floor_slow: f32,
}

const INITIAL_CEILING: f32 = 100.0;
const INITIAL_FLOOR: f32 = 0.0;

impl AutoLevel {
    pub fn new(margin: f32, factor: f32) -> Self {
        AutoLevel {
            margin,
            factor,
            ceiling: INITIAL_CEILING,
            ceiling_slow: INITIAL_CEILING,
            floor: INITIAL_FLOOR,
            floor_slow: INITIAL_FLOOR,
        }
    }

    pub fn reset(&mut self) {
        *self = AutoLevel::new(self.margin, self.factor);
    }

    pub fn margin(&self) -> f32 {
        self.margin
    }

    /// Feeds one frame's unpadded maximum and minimum.
    pub fn update(&mut self, frame_ceiling: f32, frame_floor: f32) {
        let ceiling = frame_ceiling + self.margin;
        let floor = frame_floor - self.margin;

        self.ceiling += (ceiling - self.ceiling) * self.factor;
        self.ceiling_slow += (self.ceiling - self.ceiling_slow) * self.factor;

        self.floor += (floor - self.floor) * self.factor;
        self.floor_slow += (self.floor - self.floor_slow) * self.factor;
    }

    /// (floor, ceiling) used for normalization.
    pub fn bounds(&self) -> (f32, f32) {
        (self.floor_slow, self.ceiling_slow)
    }

    /// Log-scaled position of `value` between the bounds, clamped to [0, 1].
    pub fn normalize(&self, value: f32) -> f32 {
        let level = (value - self.floor_slow).log10() / (self.ceiling_slow - self.floor_slow).log10();
        if level.is_nan() {
            0.0
        } else {
            level.clamp(0.0, 1.0)
        }
    }
}

/// Largest and smallest value of a frame, seeded the way the display
/// expects: the ceiling starts at 0 and the floor at 1.
pub fn frame_extremes(values: &[f32]) -> (f32, f32) {
    values
        .iter()
        .fold((0.0f32, 1.0f32), |(ceil, floor), &v| (ceil.max(v), floor.min(v)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_stay_separated() {
        let mut level = AutoLevel::new(1.0, 0.05);
        let frames: [&[f32]; 5] = [
            &[0.0, 0.0, 0.0],
            &[5.0, 5.0, 5.0],
            &[0.2, 0.4, 0.3],
            &[1000.0, 0.0, 3.0],
            &[2.0, 2.0, 2.0],
        ];
        for _ in 0..50 {
            for frame in frames {
                let (ceil, floor) = frame_extremes(frame);
                level.update(ceil, floor);
                let (lo, hi) = level.bounds();
                assert!(hi >= lo + 2.0 * level.margin() - 1e-3, "lo = {lo}, hi = {hi}");
            }
        }
    }

    #[test]
    fn converges_towards_padded_extremes() {
        let mut level = AutoLevel::new(1.0, 0.05);
        for _ in 0..1000 {
            level.update(1024.0, 0.0);
        }
        let (lo, hi) = level.bounds();
        assert!((hi - 1025.0).abs() < 0.01);
        assert!((lo + 1.0).abs() < 0.01);
        assert!(level.normalize(1024.0) > 0.99);
        assert!(level.normalize(0.0) < 0.01);
    }

    #[test]
    fn values_under_the_floor_clamp_to_zero() {
        let level = AutoLevel::new(1.0, 0.05);
        assert_eq!(level.normalize(-5.0), 0.0);
        assert_eq!(level.normalize(1.0e9), 1.0);
    }

    #[test]
    fn extremes_use_display_seeds() {
        assert_eq!(frame_extremes(&[]), (0.0, 1.0));
        assert_eq!(frame_extremes(&[3.0, 2.0]), (3.0, 1.0));
        assert_eq!(frame_extremes(&[0.5, 0.25]), (0.5, 0.25));
    }
}
