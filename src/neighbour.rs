//! Bounded neighbour table.
//!
//! Up to [`MAX_NEIGHBOURS`] one-hop neighbours, keyed by node id and stored
//! in a fixed array of options. An entry is created when a frame from a new
//! sender clears the RSSI floor and a slot is free, refreshed on every
//! accepted frame, and evicted by the per-cycle `tick` once it has been
//! silent for [`MAX_INACTIVE_CYCLES`] cycles or its last reading fell under
//! the floor. The table also tracks each neighbour's advertised one-hop
//! list, which is how bidirectional links are confirmed: a link counts as
//! bidirectional once the neighbour lists us back.

use crate::frame::{AdvertisedNeighbour, Frame};
use crate::stratum::Stratum;
use crate::{AUTO_SEND_INTERVAL_CYCLES, HOP_UNREACHABLE, MAX_INACTIVE_CYCLES, MAX_NEIGHBOURS, MAX_NEIGHBOURS_IN_FRAME};

const CYCLE_HISTORY_DEPTH: usize = 3;
const CYCLE_UNSET: u8 = 255;

const EMPTY_ADVERTISED: AdvertisedNeighbour = AdvertisedNeighbour {
    id: 0,
    slot: 0,
    is_localized: false,
    hop: HOP_UNREACHABLE,
};

/// State kept per one-hop neighbour.
#[derive(Clone)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct NeighbourEntry {
    pub id: u16,
    pub slot: u8,
    pub hop: u8,
    pub is_localized: bool,
    /// Cycle number carried by the most recent frame.
    pub last_cycle: u8,
    cycle_history: [u8; CYCLE_HISTORY_DEPTH],
    cycle_history_idx: u8,
    /// True when the three most recent cycles were consecutive modulo the
    /// send interval, i.e. we heard this neighbour three cycles in a row.
    pub cycles_sequential: bool,
    pub stratum: Stratum,
    pub rssi: i16,
    pub snr: i8,
    /// True while the neighbour's advertised list contains our id.
    pub am_i_listed: bool,
    /// Latched once `am_i_listed` has been seen; cleared only by eviction.
    pub is_bidirectional: bool,
    /// Cycles since the last accepted frame.
    pub inactive_counter: u8,
    neighbour_count: u8,
    neighbours: [AdvertisedNeighbour; MAX_NEIGHBOURS_IN_FRAME],
}

impl NeighbourEntry {
    fn new(id: u16) -> Self {
        NeighbourEntry {
            id,
            slot: 0,
            hop: HOP_UNREACHABLE,
            is_localized: false,
            last_cycle: 0,
            cycle_history: [CYCLE_UNSET; CYCLE_HISTORY_DEPTH],
            cycle_history_idx: 0,
            cycles_sequential: false,
            stratum: Stratum::Local,
            rssi: 0,
            snr: 0,
            am_i_listed: false,
            is_bidirectional: false,
            inactive_counter: 0,
            neighbour_count: 0,
            neighbours: [EMPTY_ADVERTISED; MAX_NEIGHBOURS_IN_FRAME],
        }
    }

    /// The neighbour's own advertised one-hop list.
    pub fn advertised(&self) -> &[AdvertisedNeighbour] {
        &self.neighbours[..self.neighbour_count as usize]
    }

    fn push_cycle(&mut self, cycle: u8) {
        self.cycle_history[self.cycle_history_idx as usize] = cycle;
        self.cycle_history_idx = (self.cycle_history_idx + 1) % CYCLE_HISTORY_DEPTH as u8;
        self.cycles_sequential = self.history_is_sequential();
    }

    fn history_is_sequential(&self) -> bool {
        // Oldest-to-newest walk of the ring; idx points at the next write,
        // which is also the oldest element once the ring has wrapped.
        let mut ordered = [CYCLE_UNSET; CYCLE_HISTORY_DEPTH];
        for i in 0..CYCLE_HISTORY_DEPTH {
            ordered[i] = self.cycle_history[(self.cycle_history_idx as usize + i) % CYCLE_HISTORY_DEPTH];
        }
        if ordered.contains(&CYCLE_UNSET) {
            return false;
        }
        let m = AUTO_SEND_INTERVAL_CYCLES;
        ordered[1] == (ordered[0] + 1) % m && ordered[2] == (ordered[1] + 1) % m
    }
}

/// Result of a successful observation.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct ObserveOutcome {
    /// True when the observation created a new table entry.
    pub added: bool,
    /// True when this observation confirmed the link as bidirectional for
    /// the first time.
    pub bidirectional_confirmed: bool,
}

/// Reasons an observation did not touch the table.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum ObserveRejection {
    /// Signal under the admission floor; the frame must not influence any
    /// routing state.
    RssiBelowFloor,
    /// New sender but no free slot.
    TableFull,
}

/// Ids evicted by one `tick`.
pub struct Evictions {
    ids: [u16; MAX_NEIGHBOURS],
    len: usize,
}

impl Evictions {
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.ids[..self.len].iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Fixed-capacity neighbour set with a hop-sorted index.
pub struct NeighbourTable {
    entries: [Option<NeighbourEntry>; MAX_NEIGHBOURS],
    /// Occupied entry indices, ascending by (hop, id). Rebuilt whenever the
    /// membership changes.
    order: [u8; MAX_NEIGHBOURS],
    count: u8,
}

impl NeighbourTable {
    pub const fn new() -> Self {
        NeighbourTable {
            entries: [const { None }; MAX_NEIGHBOURS],
            order: [0; MAX_NEIGHBOURS],
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, id: u16) -> Option<&NeighbourEntry> {
        self.entries.iter().flatten().find(|entry| entry.id == id)
    }

    /// Iterates occupied entries in hop order.
    pub fn iter(&self) -> impl Iterator<Item = &NeighbourEntry> + '_ {
        self.order[..self.count as usize]
            .iter()
            .filter_map(move |&index| self.entries[index as usize].as_ref())
    }

    /// Feeds one accepted frame into the table.
    ///
    /// `rssi_min` is the runtime admission floor; a reading below it leaves
    /// the table untouched and the caller must discard the frame for every
    /// other purpose as well.
    pub fn observe(&mut self, frame: &Frame, rssi: i16, snr: i8, my_id: u16, rssi_min: i16) -> Result<ObserveOutcome, ObserveRejection> {
        if rssi < rssi_min {
            return Err(ObserveRejection::RssiBelowFloor);
        }

        let sender = frame.sender_id();
        let mut added = false;
        let index = match self.position_of(sender) {
            Some(index) => index,
            None => {
                let Some(free) = self.entries.iter().position(|slot| slot.is_none()) else {
                    return Err(ObserveRejection::TableFull);
                };
                added = true;
                free
            }
        };
        let entry = self.entries[index].get_or_insert_with(|| NeighbourEntry::new(sender));

        entry.slot = frame.sender_slot();
        entry.hop = frame.hop();
        entry.is_localized = frame.is_localized();
        entry.last_cycle = frame.cycle();
        entry.stratum = frame.stratum();
        entry.rssi = rssi;
        entry.snr = snr;
        entry.inactive_counter = 0;
        entry.push_cycle(frame.cycle());

        entry.neighbour_count = 0;
        entry.am_i_listed = false;
        for advertised in frame.neighbours() {
            if (entry.neighbour_count as usize) < MAX_NEIGHBOURS_IN_FRAME {
                entry.neighbours[entry.neighbour_count as usize] = advertised;
                entry.neighbour_count += 1;
            }
            if advertised.id == my_id {
                entry.am_i_listed = true;
            }
        }
        let bidirectional_confirmed = entry.am_i_listed && !entry.is_bidirectional;
        if entry.am_i_listed {
            entry.is_bidirectional = true;
        }

        if added {
            self.rebuild_order();
        }
        Ok(ObserveOutcome {
            added,
            bidirectional_confirmed,
        })
    }

    /// Per-cycle ageing: bumps every activity counter, evicts entries that
    /// went silent or whose last reading is now under the floor, and
    /// rebuilds the hop-sorted index.
    pub fn tick(&mut self, rssi_min: i16) -> Evictions {
        let mut evictions = Evictions {
            ids: [0; MAX_NEIGHBOURS],
            len: 0,
        };
        for slot in self.entries.iter_mut() {
            if let Some(entry) = slot {
                entry.inactive_counter = entry.inactive_counter.saturating_add(1);
                if entry.inactive_counter >= MAX_INACTIVE_CYCLES || entry.rssi < rssi_min {
                    evictions.ids[evictions.len] = entry.id;
                    evictions.len += 1;
                    *slot = None;
                }
            }
        }
        self.rebuild_order();
        evictions
    }

    /// Drops every entry. Used by the pause/resume reset.
    pub fn clear(&mut self) {
        for slot in self.entries.iter_mut() {
            *slot = None;
        }
        self.count = 0;
    }

    /// The up-to-four lowest-hop neighbours, in the shape the frame
    /// encoder wants. Returns the filled prefix length.
    pub fn advertisement(&self, out: &mut [AdvertisedNeighbour; MAX_NEIGHBOURS_IN_FRAME]) -> usize {
        let mut filled = 0;
        for entry in self.iter() {
            if filled == MAX_NEIGHBOURS_IN_FRAME {
                break;
            }
            out[filled] = AdvertisedNeighbour {
                id: entry.id,
                slot: entry.slot,
                is_localized: entry.is_localized,
                hop: entry.hop,
            };
            filled += 1;
        }
        filled
    }

    fn position_of(&self, id: u16) -> Option<usize> {
        self.entries
            .iter()
            .position(|slot| slot.as_ref().map_or(false, |entry| entry.id == id))
    }

    fn rebuild_order(&mut self) {
        self.count = 0;
        for (index, slot) in self.entries.iter().enumerate() {
            if slot.is_some() {
                self.order[self.count as usize] = index as u8;
                self.count += 1;
            }
        }
        let key = |table: &Self, index: u8| {
            let entry = table.entries[index as usize].as_ref().unwrap();
            (entry.hop, entry.id)
        };
        // Insertion sort; the table holds at most ten entries.
        for i in 1..self.count as usize {
            let mut j = i;
            while j > 0 && key(self, self.order[j - 1]) > key(self, self.order[j]) {
                self.order.swap(j - 1, j);
                j -= 1;
            }
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::frame::{FrameHeader, ADR_BROADCAST};

    const RSSI_MIN: i16 = -115;

    fn frame_from(sender: u16, slot: u8, hop: u8, cycle: u8, listed: &[AdvertisedNeighbour]) -> Frame {
        let header = FrameHeader {
            destination: ADR_BROADCAST,
            sender_id: sender,
            sender_slot: slot,
            is_localized: false,
            hop,
            cycle,
            hop_decision_target: 0,
            stratum: Stratum::Local,
            time_synced: false,
        };
        Frame::new_announcement(&header, listed)
    }

    fn listed(id: u16) -> AdvertisedNeighbour {
        AdvertisedNeighbour {
            id,
            slot: 1,
            is_localized: false,
            hop: 1,
        }
    }

    #[test]
    fn below_floor_is_rejected_without_side_effects() {
        let mut table = NeighbourTable::new();
        let frame = frame_from(2, 1, 1, 0, &[]);
        assert_eq!(table.observe(&frame, -120, 0, 1, RSSI_MIN), Err(ObserveRejection::RssiBelowFloor));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn observe_adds_then_refreshes() {
        let mut table = NeighbourTable::new();
        let frame = frame_from(2, 1, 1, 0, &[]);
        let outcome = table.observe(&frame, -80, 5, 1, RSSI_MIN).unwrap();
        assert!(outcome.added);
        assert_eq!(table.len(), 1);

        let frame = frame_from(2, 1, 2, 1, &[]);
        let outcome = table.observe(&frame, -85, 4, 1, RSSI_MIN).unwrap();
        assert!(!outcome.added);
        let entry = table.get(2).unwrap();
        assert_eq!(entry.hop, 2);
        assert_eq!(entry.rssi, -85);
        assert_eq!(entry.last_cycle, 1);
        assert_eq!(entry.inactive_counter, 0);
    }

    #[test]
    fn table_full_rejects_new_sender() {
        let mut table = NeighbourTable::new();
        for id in 2..2 + MAX_NEIGHBOURS as u16 {
            table.observe(&frame_from(id, 1, 1, 0, &[]), -80, 0, 1, RSSI_MIN).unwrap();
        }
        let frame = frame_from(99, 1, 1, 0, &[]);
        assert_eq!(table.observe(&frame, -80, 0, 1, RSSI_MIN), Err(ObserveRejection::TableFull));
        // A known sender is still refreshed
        assert!(table.observe(&frame_from(2, 1, 1, 1, &[]), -80, 0, 1, RSSI_MIN).is_ok());
    }

    #[test]
    fn bidirectional_confirmation_fires_once() {
        let mut table = NeighbourTable::new();
        let outcome = table.observe(&frame_from(2, 1, 1, 0, &[]), -80, 0, 1, RSSI_MIN).unwrap();
        assert!(!outcome.bidirectional_confirmed);
        assert!(!table.get(2).unwrap().am_i_listed);

        let outcome = table.observe(&frame_from(2, 1, 1, 1, &[listed(1)]), -80, 0, 1, RSSI_MIN).unwrap();
        assert!(outcome.bidirectional_confirmed);
        assert!(table.get(2).unwrap().am_i_listed);
        assert!(table.get(2).unwrap().is_bidirectional);

        // Already confirmed: no second event, latch holds even if delisted
        let outcome = table.observe(&frame_from(2, 1, 1, 2, &[]), -80, 0, 1, RSSI_MIN).unwrap();
        assert!(!outcome.bidirectional_confirmed);
        assert!(!table.get(2).unwrap().am_i_listed);
        assert!(table.get(2).unwrap().is_bidirectional);
    }

    #[test]
    fn cycle_history_detects_sequential_runs() {
        let mut table = NeighbourTable::new();
        let m = AUTO_SEND_INTERVAL_CYCLES;
        for cycle in [m - 2, m - 1, 0] {
            table.observe(&frame_from(2, 1, 1, cycle, &[]), -80, 0, 1, RSSI_MIN).unwrap();
        }
        assert!(table.get(2).unwrap().cycles_sequential, "wrap-around run must count");

        // A gap breaks the run
        table.observe(&frame_from(2, 1, 1, 2, &[]), -80, 0, 1, RSSI_MIN).unwrap();
        assert!(!table.get(2).unwrap().cycles_sequential);
    }

    #[test]
    fn tick_ages_and_evicts() {
        let mut table = NeighbourTable::new();
        table.observe(&frame_from(2, 1, 1, 0, &[]), -80, 0, 1, RSSI_MIN).unwrap();
        table.observe(&frame_from(3, 2, 1, 0, &[]), -80, 0, 1, RSSI_MIN).unwrap();

        for _ in 0..MAX_INACTIVE_CYCLES - 1 {
            assert!(table.tick(RSSI_MIN).is_empty());
            // Node 3 keeps talking, node 2 stays silent
            table.observe(&frame_from(3, 2, 1, 0, &[]), -80, 0, 1, RSSI_MIN).unwrap();
        }
        let evictions = table.tick(RSSI_MIN);
        let evicted: Vec<u16> = evictions.iter().collect();
        assert_eq!(evicted, vec![2]);
        assert_eq!(table.len(), 1);

        // Invariant I1: survivors are fresh and above the floor
        for entry in table.iter() {
            assert!(entry.inactive_counter < MAX_INACTIVE_CYCLES);
            assert!(entry.rssi >= RSSI_MIN);
        }
    }

    #[test]
    fn tick_evicts_entries_under_a_raised_floor() {
        let mut table = NeighbourTable::new();
        table.observe(&frame_from(2, 1, 1, 0, &[]), -110, 0, 1, RSSI_MIN).unwrap();
        let evictions = table.tick(-100);
        assert_eq!(evictions.iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn iteration_is_hop_ordered_and_advertisement_truncates() {
        let mut table = NeighbourTable::new();
        for (id, hop) in [(5u16, 3u8), (2, 1), (9, 0x7F), (4, 2), (7, 1), (8, 4)] {
            table.observe(&frame_from(id, 1, hop, 0, &[]), -80, 0, 1, RSSI_MIN).unwrap();
        }
        let hops: Vec<u8> = table.iter().map(|entry| entry.hop).collect();
        let mut sorted = hops.clone();
        sorted.sort();
        assert_eq!(hops, sorted);

        let mut out = [EMPTY_ADVERTISED; MAX_NEIGHBOURS_IN_FRAME];
        let filled = table.advertisement(&mut out);
        assert_eq!(filled, MAX_NEIGHBOURS_IN_FRAME);
        assert_eq!(out[0].id, 2);
        assert_eq!(out[0].hop, 1);
        assert_eq!(out[3].hop, 3);
    }

    #[test]
    fn stores_the_senders_advertised_list() {
        let mut table = NeighbourTable::new();
        let list = [listed(7), listed(8)];
        table.observe(&frame_from(2, 1, 1, 0, &list), -80, 0, 1, RSSI_MIN).unwrap();
        assert_eq!(table.get(2).unwrap().advertised(), &list);
    }
}
