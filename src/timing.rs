//! TDMA timing constants.
//!
//! All values are microseconds. The defaults reproduce the measured SX1262
//! timing budget for a 48-byte SF7/BW125 frame; tests substitute compressed
//! values so a full cycle runs in milliseconds instead of seconds.

use crate::N_SLOTS;

/// Radio preparation time before the frame is on air (buffer write + setTx).
const TX_PREPARE_TIME_US: u64 = 850;
/// Theoretical LoRa air time for the fixed 48-byte frame at SF7/BW125.
const TX_ONAIR_TIME_US: u64 = 98_000;
/// TX-done callback processing.
const TX_CALLBACK_TIME_US: u64 = 100;
/// Channel clear safety margin.
const TX_GUARD_TIME_US: u64 = 5_000;
/// Radio mode change overhead.
const TX_MODE_SWITCH_US: u64 = 500;

const MEASURED_TOA_US: u64 =
    TX_PREPARE_TIME_US + TX_ONAIR_TIME_US + TX_CALLBACK_TIME_US + TX_GUARD_TIME_US + TX_MODE_SWITCH_US;

/// 20% headroom over the measured time-on-air for clock drift and variation.
/// Expressed as a ratio to keep the computation in integer arithmetic.
const TOA_SAFETY_NUM: u64 = 12;
const TOA_SAFETY_DEN: u64 = 10;

/// Effective per-frame air time including all margins.
pub const EFFECTIVE_TOA_US: u64 = MEASURED_TOA_US * TOA_SAFETY_NUM / TOA_SAFETY_DEN;

/// Per-cycle phase and slot durations.
///
/// A value of this type is part of the node configuration; every deadline
/// the scheduler computes derives from it.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct TdmaTiming {
    /// Width of one TX slot.
    pub t_slot_us: u64,
    /// Duration of the processing phase at the start of each cycle.
    pub t_processing_us: u64,
    /// Effective frame time-on-air including margins.
    pub t_packet_us: u64,
    /// Delay before keying the transmitter inside the owned slot.
    pub t_tx_delay_us: u64,
    /// Receiver settling time budgeted at the listening side.
    pub t_rx_delay_us: u64,
}

impl TdmaTiming {
    pub const fn new(t_slot_us: u64, t_processing_us: u64, t_packet_us: u64, t_tx_delay_us: u64, t_rx_delay_us: u64) -> Self {
        TdmaTiming {
            t_slot_us,
            t_processing_us,
            t_packet_us,
            t_tx_delay_us,
            t_rx_delay_us,
        }
    }

    /// One full rotation through all slots.
    pub const fn t_period_us(&self) -> u64 {
        N_SLOTS as u64 * self.t_slot_us
    }

    /// Remainder of a slot after the frame and both turnaround delays.
    ///
    /// This offset is the anchor of the timing reconstruction: a receiver
    /// that decodes a frame knows the sender's slot position to within the
    /// turnaround budget, so the remaining listen window can be recomputed
    /// from the slot distance alone.
    pub const fn slot_offset_us(&self) -> u64 {
        self.t_slot_us - self.t_packet_us - self.t_tx_delay_us - self.t_rx_delay_us
    }
}

impl Default for TdmaTiming {
    fn default() -> Self {
        TdmaTiming::new(500_000, 500_000, EFFECTIVE_TOA_US, 5_000, 2_000)
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn effective_toa_carries_safety_margin() {
        assert_eq!(MEASURED_TOA_US, 104_450);
        assert_eq!(EFFECTIVE_TOA_US, 125_340);
    }

    #[test]
    fn default_timing_derivations() {
        let t = TdmaTiming::default();
        assert_eq!(t.t_period_us(), 4_000_000);
        assert_eq!(t.slot_offset_us(), 500_000 - 125_340 - 5_000 - 2_000);
    }

    #[test]
    fn compressed_timing_for_tests() {
        let t = TdmaTiming::new(2_000, 1_000, 500, 100, 50);
        assert_eq!(t.t_period_us(), 16_000);
        assert_eq!(t.slot_offset_us(), 1_350);
    }
}
