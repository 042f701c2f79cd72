//! Hierarchical time-authority (stratum) tracking.
//!
//! Every node carries a stratum level describing its distance to the
//! gateway's clock, in the NTP sense: the gateway is the authoritative
//! source (stratum 0), nodes synced directly from it are stratum 1, nodes
//! synced through one intermediary are stratum 2, and everything else runs
//! on local time only (stratum 3). The sync tree self-heals: a node adopts
//! a better source whenever it hears one, and degrades back to local time
//! when its source stays silent for too long.

use crate::{GATEWAY_ID, SYNC_VALID_CYCLES};

/// Distance to the network time authority.
///
/// Encoded in two bits on the wire (byte 11, upper bits).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "std", derive(Debug))]
#[repr(u8)]
pub enum Stratum {
    /// The gateway itself, authoritative time source.
    Gateway = 0,
    /// Synced directly from the gateway.
    Direct = 1,
    /// Synced from a stratum-1 node (two hops from the gateway clock).
    Indirect = 2,
    /// Not synced to the gateway, local time only.
    Local = 3,
}

impl Stratum {
    /// Decodes a two-bit wire value into a stratum level.
    pub const fn from_bits(bits: u8) -> Stratum {
        match bits & 0x03 {
            0 => Stratum::Gateway,
            1 => Stratum::Direct,
            2 => Stratum::Indirect,
            _ => Stratum::Local,
        }
    }

    pub const fn as_bits(self) -> u8 {
        self as u8
    }

    /// The stratum a node inherits when syncing from a sender at `self`.
    ///
    /// Capped at `Indirect`: a node may not claim a direct gateway sync
    /// through an intermediary.
    pub fn inherited(self) -> Stratum {
        match self {
            Stratum::Gateway => Stratum::Direct,
            Stratum::Direct => Stratum::Indirect,
            Stratum::Indirect | Stratum::Local => Stratum::Indirect,
        }
    }
}

/// Per-node sync source election state.
///
/// Owned by the node state and updated from two places only: once per
/// accepted frame (`observe_sender`) and once per cycle (`tick`).
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct SyncState {
    pub stratum: Stratum,
    /// Node id that provided the current sync, 0 when unsynced.
    pub sync_source: u16,
    /// Cycles remaining before the current sync is considered stale.
    pub sync_valid_counter: u8,
    is_gateway: bool,
}

impl SyncState {
    /// Initial state for the gateway: pinned to `Gateway`, never degrades.
    pub const fn gateway() -> Self {
        SyncState {
            stratum: Stratum::Gateway,
            sync_source: 0,
            sync_valid_counter: 0,
            is_gateway: true,
        }
    }

    /// Initial state for an ordinary node: unsynced local time.
    pub const fn local() -> Self {
        SyncState {
            stratum: Stratum::Local,
            sync_source: 0,
            sync_valid_counter: 0,
            is_gateway: false,
        }
    }

    /// True while the node holds a live sync towards the gateway.
    pub fn is_synced(&self) -> bool {
        self.stratum < Stratum::Local
    }

    /// Feeds one accepted frame into the source election.
    ///
    /// Adopts the sender when it offers a strictly better stratum, or
    /// refreshes the countdown when the sender already is our source at an
    /// equal level. Returns true when the sender was adopted or refreshed.
    pub fn observe_sender(&mut self, sender: u16, sender_stratum: Stratum) -> bool {
        if self.is_gateway {
            return false;
        }

        let proposed = if sender == GATEWAY_ID {
            Stratum::Direct
        } else {
            sender_stratum.inherited()
        };

        if proposed < self.stratum || (proposed == self.stratum && self.sync_source == sender) {
            self.stratum = proposed;
            self.sync_source = sender;
            self.sync_valid_counter = SYNC_VALID_CYCLES;
            return true;
        }
        false
    }

    /// Per-cycle countdown. Returns true when the sync just expired and the
    /// node degraded to `Local`.
    ///
    /// Degradation is direct to `Local`, not stepwise: a stale stratum-1
    /// claim is no more trustworthy than a stale stratum-2 one.
    pub fn tick(&mut self) -> bool {
        if self.is_gateway || self.stratum == Stratum::Local {
            return false;
        }
        self.sync_valid_counter = self.sync_valid_counter.saturating_sub(1);
        if self.sync_valid_counter == 0 {
            self.stratum = Stratum::Local;
            self.sync_source = 0;
            return true;
        }
        false
    }

    /// Clears the sync on pause/reset. The gateway stays pinned.
    pub fn reset(&mut self) {
        if !self.is_gateway {
            self.stratum = Stratum::Local;
            self.sync_source = 0;
            self.sync_valid_counter = 0;
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn stratum_bits_roundtrip() {
        for bits in 0..4u8 {
            assert_eq!(Stratum::from_bits(bits).as_bits(), bits);
        }
        // Upper bits are ignored on decode
        assert_eq!(Stratum::from_bits(0b1110_0001), Stratum::Direct);
    }

    #[test]
    fn gateway_sender_grants_direct() {
        let mut sync = SyncState::local();
        assert!(sync.observe_sender(GATEWAY_ID, Stratum::Gateway));
        assert_eq!(sync.stratum, Stratum::Direct);
        assert_eq!(sync.sync_source, GATEWAY_ID);
        assert_eq!(sync.sync_valid_counter, SYNC_VALID_CYCLES);
    }

    #[test]
    fn indirect_cap_through_intermediary() {
        let mut sync = SyncState::local();
        // A stratum-1 neighbour yields Indirect, never Direct
        assert!(sync.observe_sender(7, Stratum::Direct));
        assert_eq!(sync.stratum, Stratum::Indirect);
        // A local-only neighbour is still capped at Indirect and is not an
        // upgrade, so it is ignored
        assert!(!sync.observe_sender(9, Stratum::Local));
        assert_eq!(sync.sync_source, 7);
    }

    #[test]
    fn same_source_refreshes_countdown() {
        let mut sync = SyncState::local();
        sync.observe_sender(7, Stratum::Direct);
        for _ in 0..SYNC_VALID_CYCLES - 1 {
            assert!(!sync.tick());
        }
        assert_eq!(sync.sync_valid_counter, 1);
        assert!(sync.observe_sender(7, Stratum::Direct));
        assert_eq!(sync.sync_valid_counter, SYNC_VALID_CYCLES);
    }

    #[test]
    fn expiry_degrades_straight_to_local() {
        let mut sync = SyncState::local();
        sync.observe_sender(GATEWAY_ID, Stratum::Gateway);
        let mut degraded = false;
        for _ in 0..SYNC_VALID_CYCLES {
            degraded = sync.tick();
        }
        assert!(degraded);
        assert_eq!(sync.stratum, Stratum::Local);
        assert_eq!(sync.sync_source, 0);
        // Further ticks are a no-op
        assert!(!sync.tick());
    }

    #[test]
    fn gateway_never_degrades() {
        let mut sync = SyncState::gateway();
        assert!(!sync.observe_sender(5, Stratum::Gateway));
        for _ in 0..10 {
            assert!(!sync.tick());
        }
        assert_eq!(sync.stratum, Stratum::Gateway);
        sync.reset();
        assert_eq!(sync.stratum, Stratum::Gateway);
    }
}
