// Viva - Loudness metering for UI level indicators

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Quietest level the meter distinguishes; anything below maps to 0.
pub const LEVEL_FLOOR_DB: f32 = -50.0;
/// Amplitude floor that keeps the log out of its singularity.
const AMPLITUDE_EPSILON: f32 = 1e-10;
/// Weight of the newest sample in the smoothing average.
const SMOOTHING_ALPHA: f32 = 0.7;

/// Map an RMS amplitude to a normalized [0, 1] level.
///
/// 0 dBFS (amplitude 1.0) maps to 1.0, the floor and below map to 0.0,
/// and the mapping is non-decreasing in amplitude.
pub fn map_level(rms: f32) -> f32 {
    let db = 20.0 * rms.max(AMPLITUDE_EPSILON).log10();
    let clamped = db.clamp(LEVEL_FLOOR_DB, 0.0);
    (clamped - LEVEL_FLOOR_DB) / -LEVEL_FLOOR_DB
}

/// Root-mean-square amplitude of a frame.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Smoothed loudness meter. One instance per processing thread; the
/// smoothed value crosses threads through [`SharedLevel`].
#[derive(Debug, Default)]
pub struct LevelMeter {
    smoothed: f32,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one processed frame and return the updated smoothed level.
    pub fn process(&mut self, samples: &[f32]) -> f32 {
        let instantaneous = map_level(rms(samples));
        self.smoothed = SMOOTHING_ALPHA * instantaneous + (1.0 - SMOOTHING_ALPHA) * self.smoothed;
        self.smoothed
    }

    pub fn level(&self) -> f32 {
        self.smoothed
    }

    pub fn reset(&mut self) {
        self.smoothed = 0.0;
    }
}

/// A single f32 shared across threads, read far more often than written.
/// Bit-cast through an atomic instead of taking a lock for one scalar.
#[derive(Debug, Clone, Default)]
pub struct SharedLevel(Arc<AtomicU32>);

impl SharedLevel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, level: f32) {
        self.0.store(level.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.store(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_maps_to_zero() {
        assert_eq!(map_level(0.0), 0.0);
    }

    #[test]
    fn full_scale_maps_to_one() {
        assert!((map_level(1.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn mapping_is_non_decreasing() {
        let mut previous = 0.0f32;
        for step in 0..=1000 {
            let amplitude = step as f32 / 1000.0;
            let level = map_level(amplitude);
            assert!(
                level >= previous,
                "level decreased at amplitude {amplitude}: {level} < {previous}"
            );
            previous = level;
        }
    }

    #[test]
    fn meter_smooths_toward_input() {
        let mut meter = LevelMeter::new();
        let loud = vec![1.0f32; 512];

        let first = meter.process(&loud);
        assert!((first - 0.7).abs() < 1e-6, "first sample weighted 0.7");

        // Repeated loud frames converge on 1.0.
        for _ in 0..50 {
            meter.process(&loud);
        }
        assert!(meter.level() > 0.999);

        meter.reset();
        assert_eq!(meter.level(), 0.0);
    }

    #[test]
    fn shared_level_round_trips() {
        let level = SharedLevel::new();
        level.store(0.42);
        assert_eq!(level.load(), 0.42);
        let clone = level.clone();
        clone.store(0.9);
        assert_eq!(level.load(), 0.9);
        level.reset();
        assert_eq!(clone.load(), 0.0);
    }
}
