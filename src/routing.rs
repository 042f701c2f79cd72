//! Distance-vector routing over the neighbour table.
//!
//! Two pure functions: the per-cycle Bellman-Ford hop recomputation and the
//! next-hop pick used when a frame carries data towards the gateway. Both
//! work from the neighbour table alone; the graph is expressed entirely by
//! node-id lookup.

use crate::neighbour::{NeighbourEntry, NeighbourTable};
use crate::HOP_UNREACHABLE;

/// Recomputes this node's hop distance to the gateway.
///
/// `min(n.hop + 1)` over all neighbours above the RSSI floor that are
/// themselves reachable, or [`HOP_UNREACHABLE`] when no neighbour
/// qualifies. The gateway's distance is pinned to zero and never
/// recomputed.
pub fn recompute_hop(table: &NeighbourTable, is_gateway: bool, rssi_min: i16) -> u8 {
    if is_gateway {
        return 0;
    }
    let mut best = HOP_UNREACHABLE;
    for entry in table.iter() {
        if entry.rssi >= rssi_min && entry.hop != HOP_UNREACHABLE {
            let candidate = entry.hop.saturating_add(1).min(HOP_UNREACHABLE);
            if candidate < best {
                best = candidate;
            }
        }
    }
    best
}

/// True when the entry may carry our traffic towards the gateway.
///
/// The link must be above the floor, confirmed bidirectional (the
/// neighbour currently lists us), and strictly closer to the gateway than
/// we are.
fn is_candidate(entry: &NeighbourEntry, my_hop: u8, rssi_min: i16) -> bool {
    entry.rssi >= rssi_min && entry.am_i_listed && entry.hop != HOP_UNREACHABLE && entry.hop < my_hop
}

/// Picks the relay target for outgoing data, 0 when nothing qualifies.
///
/// Ordering, first criterion that differs wins:
/// 1. good RSSI (above `rssi_good`) beats poor RSSI regardless of hop,
/// 2. within the same RSSI class, lower hop wins,
/// 3. within the same hop, higher RSSI wins,
/// 4. within the same RSSI, higher SNR wins.
///
/// Remaining ties fall to table iteration order.
pub fn select_next_hop(table: &NeighbourTable, my_hop: u8, rssi_min: i16, rssi_good: i16) -> u16 {
    let mut best: Option<&NeighbourEntry> = None;
    for entry in table.iter() {
        if !is_candidate(entry, my_hop, rssi_min) {
            continue;
        }
        match best {
            None => best = Some(entry),
            Some(current) => {
                if prefer(entry, current, rssi_good) {
                    best = Some(entry);
                }
            }
        }
    }
    best.map_or(0, |entry| entry.id)
}

/// True when `challenger` is strictly better than `current`.
fn prefer(challenger: &NeighbourEntry, current: &NeighbourEntry, rssi_good: i16) -> bool {
    let challenger_good = challenger.rssi > rssi_good;
    let current_good = current.rssi > rssi_good;
    if challenger_good != current_good {
        return challenger_good;
    }
    if challenger.hop != current.hop {
        return challenger.hop < current.hop;
    }
    if challenger.rssi != current.rssi {
        return challenger.rssi > current.rssi;
    }
    challenger.snr > current.snr
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::frame::{AdvertisedNeighbour, Frame, FrameHeader, ADR_BROADCAST};
    use crate::stratum::Stratum;

    const RSSI_MIN: i16 = -115;
    const RSSI_GOOD: i16 = -100;
    const MY_ID: u16 = 1;

    fn observe(table: &mut NeighbourTable, id: u16, hop: u8, rssi: i16, snr: i8, lists_us: bool) {
        let listed = [AdvertisedNeighbour {
            id: MY_ID,
            slot: 0,
            is_localized: false,
            hop: 2,
        }];
        let header = FrameHeader {
            destination: ADR_BROADCAST,
            sender_id: id,
            sender_slot: 1,
            is_localized: false,
            hop,
            cycle: 0,
            hop_decision_target: 0,
            stratum: Stratum::Local,
            time_synced: false,
        };
        let frame = Frame::new_announcement(&header, if lists_us { &listed } else { &[] });
        table.observe(&frame, rssi, snr, MY_ID, RSSI_MIN).unwrap();
    }

    #[test]
    fn hop_is_min_neighbour_plus_one() {
        let mut table = NeighbourTable::new();
        observe(&mut table, 2, 1, -90, 0, false);
        observe(&mut table, 3, 3, -80, 0, false);
        assert_eq!(recompute_hop(&table, false, RSSI_MIN), 2);
    }

    #[test]
    fn unreachable_neighbours_do_not_count() {
        let mut table = NeighbourTable::new();
        observe(&mut table, 2, HOP_UNREACHABLE, -80, 0, false);
        assert_eq!(recompute_hop(&table, false, RSSI_MIN), HOP_UNREACHABLE);
        assert_eq!(recompute_hop(&table, true, RSSI_MIN), 0);
    }

    #[test]
    fn empty_table_means_unreachable() {
        let table = NeighbourTable::new();
        assert_eq!(recompute_hop(&table, false, RSSI_MIN), HOP_UNREACHABLE);
    }

    #[test]
    fn next_hop_requires_bidirectional_and_progress() {
        let mut table = NeighbourTable::new();
        // Closer but never listed us
        observe(&mut table, 2, 1, -80, 0, false);
        // Bidirectional but not closer
        observe(&mut table, 3, 2, -80, 0, true);
        assert_eq!(select_next_hop(&table, 2, RSSI_MIN, RSSI_GOOD), 0);

        // Bidirectional and closer
        observe(&mut table, 4, 1, -90, 0, true);
        assert_eq!(select_next_hop(&table, 2, RSSI_MIN, RSSI_GOOD), 4);
    }

    #[test]
    fn good_rssi_class_beats_lower_hop() {
        let mut table = NeighbourTable::new();
        observe(&mut table, 2, 1, -105, 0, true); // poor class, closer
        observe(&mut table, 3, 2, -95, 0, true); // good class, further
        assert_eq!(select_next_hop(&table, 3, RSSI_MIN, RSSI_GOOD), 3);
    }

    #[test]
    fn within_class_lower_hop_then_rssi_then_snr() {
        let mut table = NeighbourTable::new();
        observe(&mut table, 2, 2, -90, 0, true);
        observe(&mut table, 3, 1, -95, 0, true);
        assert_eq!(select_next_hop(&table, 3, RSSI_MIN, RSSI_GOOD), 3, "lower hop wins inside class");

        observe(&mut table, 4, 1, -92, 0, true);
        assert_eq!(select_next_hop(&table, 3, RSSI_MIN, RSSI_GOOD), 4, "higher rssi wins at equal hop");

        observe(&mut table, 5, 1, -92, 7, true);
        assert_eq!(select_next_hop(&table, 3, RSSI_MIN, RSSI_GOOD), 5, "higher snr wins at equal rssi");
    }
}
