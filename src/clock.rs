//! Wall-clock bridge.
//!
//! The scheduler runs entirely on the monotonic clock; wall-clock time
//! exists only to stamp outgoing payloads and to compute gateway-side
//! latency. The host feeds an epoch reference (NTP, in the reference
//! deployment) whenever it has one; between feeds the crate extrapolates
//! from the monotonic clock, optionally correcting a known oscillator
//! drift. The reference deliberately survives a scheduler pause: stopping
//! TDMA must not lose time sync.

use crate::MAX_DRIFT_PPM;
use embassy_time::Instant;

#[derive(Clone, Copy)]
struct EpochReference {
    epoch_us: i64,
    at: Instant,
}

/// Extrapolated wall clock with bounded drift correction.
pub struct EpochClock {
    reference: Option<EpochReference>,
    drift_ppm: i16,
}

/// Applies a parts-per-million correction to an elapsed interval.
///
/// `ppm` is already capped at ±[`MAX_DRIFT_PPM`], so for intervals up to an
/// hour (3.6e9 µs) the intermediate product stays far below `i64::MAX`.
pub(crate) fn apply_drift(elapsed_us: i64, ppm: i16) -> i64 {
    elapsed_us + elapsed_us * ppm as i64 / 1_000_000
}

impl EpochClock {
    pub const fn new() -> Self {
        EpochClock {
            reference: None,
            drift_ppm: 0,
        }
    }

    /// Anchors the wall clock: `epoch_us` is the time "now".
    pub fn set_reference(&mut self, epoch_us: i64) {
        self.reference = Some(EpochReference {
            epoch_us,
            at: Instant::now(),
        });
    }

    /// Sets the oscillator correction, clamped to ±[`MAX_DRIFT_PPM`].
    pub fn set_drift_ppm(&mut self, ppm: i16) {
        self.drift_ppm = ppm.clamp(-(MAX_DRIFT_PPM as i16), MAX_DRIFT_PPM as i16);
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// Current wall-clock estimate in µs since epoch, `None` before the
    /// first reference arrives.
    pub fn epoch_now_us(&self) -> Option<i64> {
        let reference = self.reference?;
        let elapsed_us = Instant::now().saturating_duration_since(reference.at).as_micros() as i64;
        Some(reference.epoch_us + apply_drift(elapsed_us, self.drift_ppm))
    }
}
