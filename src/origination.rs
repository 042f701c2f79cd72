//! Payload origination gating.
//!
//! A node may inject its own sensor payload into the mesh only when three
//! conditions line up: the network cycle is the node's round-robin turn,
//! the node has a live route towards the gateway, and the node has proven
//! it is actually synchronised to the network cadence by observing three
//! consecutive cycle numbers from a neighbour closer to the gateway. The
//! last check (cycle validation) is earned once and then latched until an
//! explicit reset.

use crate::frame::DataSection;
use crate::{AUTO_SEND_INTERVAL_CYCLES, HOP_UNREACHABLE, MAX_TRACKING_HOPS, SENSOR_DATA_LENGTH};

const CYCLE_UNSET: u8 = 255;
/// Consecutive upstream cycles required before origination unlocks.
const VALIDATION_THRESHOLD: u8 = 3;

/// Outcome of feeding one upstream cycle observation into the gate.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct ValidationProgress {
    pub observations: u8,
    /// True when this observation crossed the threshold.
    pub just_validated: bool,
}

/// Mints message ids and decides when this node's payload enters the mesh.
pub struct OriginationEngine {
    /// Low 8 bits of the next message id; the per-origin sequence the
    /// gateway uses for PDR gap detection.
    counter: u8,
    pending: Option<DataSection>,
    validation_count: u8,
    last_received_cycle: u8,
    /// Latched once three consecutive upstream cycles have been seen.
    pub cycle_validated: bool,
}

impl OriginationEngine {
    pub const fn new() -> Self {
        OriginationEngine {
            counter: 0,
            pending: None,
            validation_count: 0,
            last_received_cycle: CYCLE_UNSET,
            cycle_validated: false,
        }
    }

    /// Feeds a cycle number observed from a neighbour strictly closer to
    /// the gateway.
    ///
    /// Consecutive values (modulo the send interval) advance the count; a
    /// repeat of the last value is neutral (several closer neighbours speak
    /// in the same cycle); anything else restarts the count at one.
    pub fn observe_upstream_cycle(&mut self, cycle: u8) -> ValidationProgress {
        if self.last_received_cycle == CYCLE_UNSET {
            self.validation_count = 1;
        } else if cycle == self.last_received_cycle {
            // Same cycle heard twice; neither progress nor a break.
        } else if cycle == (self.last_received_cycle + 1) % AUTO_SEND_INTERVAL_CYCLES {
            self.validation_count = self.validation_count.saturating_add(1);
        } else {
            self.validation_count = 1;
        }
        self.last_received_cycle = cycle;

        let mut just_validated = false;
        if !self.cycle_validated && self.validation_count >= VALIDATION_THRESHOLD {
            self.cycle_validated = true;
            just_validated = true;
        }
        ValidationProgress {
            observations: self.validation_count,
            just_validated,
        }
    }

    /// True in exactly the cycle where this node's round-robin turn comes
    /// up and every origination precondition holds.
    ///
    /// `has_upstream_link` is the caller's check that at least one
    /// bidirectional neighbour sits strictly closer to the gateway.
    pub fn should_originate(&self, my_id: u16, my_cycle: u8, my_hop: u8, has_upstream_link: bool) -> bool {
        if self.pending.is_some() || !self.cycle_validated || !has_upstream_link {
            return false;
        }
        if my_hop == 0 || my_hop == HOP_UNREACHABLE {
            return false;
        }
        my_cycle == ((my_id as u8).wrapping_sub(1)) % AUTO_SEND_INTERVAL_CYCLES
    }

    /// Stamps a fresh payload with the next message id and stages it for
    /// transmission.
    ///
    /// The origin opens the tracked path with its own id, so downstream
    /// relays append at `hop_count` and the gateway sees the full route.
    pub fn mint(&mut self, my_id: u16, payload: [u8; SENSOR_DATA_LENGTH], payload_len: u8, epoch_now_us: Option<i64>) -> u16 {
        let message_id = ((my_id & 0xFF) << 8) | self.counter as u16;
        self.counter = self.counter.wrapping_add(1);
        let mut path = [0u16; MAX_TRACKING_HOPS];
        path[0] = my_id;
        let section = DataSection {
            origin_id: my_id,
            message_id,
            hop_count: 1,
            payload,
            payload_len,
            path,
            origin_tx_timestamp: epoch_now_us.map_or(0, |us| us.max(0) as u64),
        };
        self.pending = Some(section);
        message_id
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Hands out the staged payload for transmission.
    pub fn take_pending(&mut self) -> Option<DataSection> {
        self.pending.take()
    }

    /// Drops the staged payload and forces the validation to be re-earned.
    /// The message counter survives so the gateway's sequence tracking
    /// stays monotonic across a pause.
    pub fn reset(&mut self) {
        self.pending = None;
        self.validation_count = 0;
        self.last_received_cycle = CYCLE_UNSET;
        self.cycle_validated = false;
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn three_consecutive_cycles_validate() {
        let mut engine = OriginationEngine::new();
        assert!(!engine.observe_upstream_cycle(2).just_validated);
        assert!(!engine.observe_upstream_cycle(3).just_validated);
        let progress = engine.observe_upstream_cycle(4);
        assert!(progress.just_validated);
        assert_eq!(progress.observations, 3);
        assert!(engine.cycle_validated);
    }

    #[test]
    fn gap_restarts_the_count() {
        let mut engine = OriginationEngine::new();
        engine.observe_upstream_cycle(2);
        engine.observe_upstream_cycle(3);
        let progress = engine.observe_upstream_cycle(5);
        assert_eq!(progress.observations, 1);
        assert!(!engine.cycle_validated);
    }

    #[test]
    fn validation_wraps_across_the_interval() {
        let mut engine = OriginationEngine::new();
        let m = AUTO_SEND_INTERVAL_CYCLES;
        engine.observe_upstream_cycle(m - 2);
        engine.observe_upstream_cycle(m - 1);
        assert!(engine.observe_upstream_cycle(0).just_validated);
    }

    #[test]
    fn repeated_cycle_is_neutral() {
        let mut engine = OriginationEngine::new();
        engine.observe_upstream_cycle(2);
        engine.observe_upstream_cycle(2);
        engine.observe_upstream_cycle(3);
        assert!(engine.observe_upstream_cycle(4).just_validated);
    }

    #[test]
    fn validation_is_latched_until_reset() {
        let mut engine = OriginationEngine::new();
        for cycle in [0, 1, 2] {
            engine.observe_upstream_cycle(cycle);
        }
        assert!(engine.cycle_validated);
        // A later gap does not revoke the latch
        engine.observe_upstream_cycle(5);
        assert!(engine.cycle_validated);

        engine.reset();
        assert!(!engine.cycle_validated);
    }

    #[test]
    fn origination_window_and_preconditions() {
        let mut engine = OriginationEngine::new();
        for cycle in [0, 1, 2] {
            engine.observe_upstream_cycle(cycle);
        }
        let id = 5u16;
        let turn = ((id as u8) - 1) % AUTO_SEND_INTERVAL_CYCLES;

        assert!(engine.should_originate(id, turn, 3, true));
        assert!(!engine.should_originate(id, (turn + 1) % AUTO_SEND_INTERVAL_CYCLES, 3, true), "wrong cycle");
        assert!(!engine.should_originate(id, turn, 0, true), "gateway never originates");
        assert!(!engine.should_originate(id, turn, HOP_UNREACHABLE, true), "no route");
        assert!(!engine.should_originate(id, turn, 3, false), "no upstream link");

        engine.mint(id, *b"T25H80", 6, None);
        assert!(!engine.should_originate(id, turn, 3, true), "pending payload blocks");
    }

    #[test]
    fn mint_encodes_origin_and_sequence() {
        let mut engine = OriginationEngine::new();
        let first = engine.mint(5, *b"T25H80", 6, Some(1_000_000));
        let second = engine.mint(5, *b"T26H81", 6, None);
        assert_eq!(first, (5 << 8) | 0);
        assert_eq!(second, (5 << 8) | 1);

        let staged = engine.take_pending().unwrap();
        assert_eq!(staged.message_id, second);
        assert_eq!(staged.origin_tx_timestamp, 0, "unsynced origin stamps zero");
        assert_eq!(staged.hop_count, 1);
        assert_eq!(staged.path, [5, 0, 0], "origin opens the tracked path");
        assert!(!engine.has_pending());
    }

    #[test]
    fn sequence_counter_wraps_at_256() {
        let mut engine = OriginationEngine::new();
        for _ in 0..256 {
            engine.mint(5, *b"T25H80", 6, None);
            engine.take_pending();
        }
        assert_eq!(engine.mint(5, *b"T25H80", 6, None), (5 << 8) | 0);
    }
}
