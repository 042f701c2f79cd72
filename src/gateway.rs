//! Gateway-side delivery accounting and upstream handoff.
//!
//! The gateway terminates the mesh: every data frame whose decision target
//! is the gateway lands here. The sink suppresses loopback, computes
//! end-to-end latency from the origin's embedded transmit timestamp, keeps
//! a per-origin packet-delivery-ratio estimated from the low 8 bits of the
//! message id, and batches payloads for the external upstream collector.

use crate::frame::DataSection;
use crate::{LATENCY_CACHE_SIZE, MAX_TRACKING_HOPS, PDR_TABLE_SIZE, SENSOR_DATA_LENGTH, UPSTREAM_BATCH_SIZE};

/// Latency samples older than one hour are clock anomalies, not data.
const MAX_LATENCY_US: u64 = 3_600_000_000;

/// One accepted end-to-end latency measurement.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct LatencyRecord {
    pub origin: u16,
    pub msg_id: u16,
    pub latency_us: u64,
}

/// Running latency aggregate per origin.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct LatencyStats {
    pub count: u32,
    pub sum_us: u64,
    pub min_us: u64,
    pub max_us: u64,
}

impl LatencyStats {
    const fn new() -> Self {
        LatencyStats {
            count: 0,
            sum_us: 0,
            min_us: u64::MAX,
            max_us: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        self.count += 1;
        self.sum_us += latency_us;
        self.min_us = self.min_us.min(latency_us);
        self.max_us = self.max_us.max(latency_us);
    }

    pub fn avg_us(&self) -> u64 {
        if self.count == 0 {
            return 0;
        }
        self.sum_us / self.count as u64
    }
}

/// Per-origin delivery bookkeeping.
///
/// `expected` advances by the sequence delta of each new observation,
/// `received` by one, so `gaps == expected − received` counts the frames
/// the mesh lost on the way here.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct PdrEntry {
    pub origin: u16,
    last_seq: u8,
    pub expected: u32,
    pub received: u32,
    pub gaps: u32,
    pub latency: LatencyStats,
}

impl PdrEntry {
    fn new(origin: u16, seq: u8) -> Self {
        PdrEntry {
            origin,
            last_seq: seq,
            expected: 1,
            received: 1,
            gaps: 0,
            latency: LatencyStats::new(),
        }
    }

    pub fn pdr(&self) -> f32 {
        if self.expected == 0 {
            return 0.0;
        }
        self.received as f32 / self.expected as f32
    }
}

/// One payload handed to the upstream collector.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct UpstreamMessage {
    pub origin: u16,
    pub msg_id: u16,
    pub payload: [u8; SENSOR_DATA_LENGTH],
    pub payload_len: u8,
    pub path: [u16; MAX_TRACKING_HOPS],
    pub hop_count: u8,
}

const EMPTY_UPSTREAM: UpstreamMessage = UpstreamMessage {
    origin: 0,
    msg_id: 0,
    payload: [0; SENSOR_DATA_LENGTH],
    payload_len: 0,
    path: [0; MAX_TRACKING_HOPS],
    hop_count: 0,
};

/// Up to [`UPSTREAM_BATCH_SIZE`] payloads delivered as one unit.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct UpstreamBatch {
    messages: [UpstreamMessage; UPSTREAM_BATCH_SIZE],
    len: u8,
}

impl UpstreamBatch {
    const fn new() -> Self {
        UpstreamBatch {
            messages: [EMPTY_UPSTREAM; UPSTREAM_BATCH_SIZE],
            len: 0,
        }
    }

    pub fn messages(&self) -> &[UpstreamMessage] {
        &self.messages[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn is_full(&self) -> bool {
        self.len as usize == UPSTREAM_BATCH_SIZE
    }

    fn push(&mut self, message: UpstreamMessage) -> bool {
        if self.is_full() {
            return false;
        }
        self.messages[self.len as usize] = message;
        self.len += 1;
        true
    }
}

/// What one data frame did to the gateway state; the scheduler turns this
/// into telemetry events.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct GatewayRxOutcome {
    /// Frame originated here; dropped without touching anything.
    pub loopback: bool,
    /// Repeated sequence number; accounting skipped.
    pub duplicate: bool,
    /// Accepted end-to-end latency, when the timestamp was usable.
    pub latency_us: Option<u64>,
    /// `(received, expected)` for the origin after the update; `None` when
    /// the PDR table had no slot for a new origin.
    pub pdr: Option<(u32, u32)>,
    /// Upstream batch reached capacity with this payload; flush now.
    pub batch_full: bool,
    /// Upstream batch had no room; the payload was dropped.
    pub batch_overflow: bool,
}

/// Delivery metrics and upstream batching at the gateway.
pub struct GatewaySink {
    pdr: [Option<PdrEntry>; PDR_TABLE_SIZE],
    latency_cache: [Option<LatencyRecord>; LATENCY_CACHE_SIZE],
    latency_cache_idx: usize,
    batch: UpstreamBatch,
}

impl GatewaySink {
    pub const fn new() -> Self {
        GatewaySink {
            pdr: [None; PDR_TABLE_SIZE],
            latency_cache: [None; LATENCY_CACHE_SIZE],
            latency_cache_idx: 0,
            batch: UpstreamBatch::new(),
        }
    }

    /// Processes one data frame that reached the gateway.
    ///
    /// `now_epoch_us` is the gateway's wall clock at reception; without it
    /// latency accounting is skipped but PDR and batching still run.
    pub fn accept(&mut self, section: &DataSection, my_id: u16, now_epoch_us: Option<i64>) -> GatewayRxOutcome {
        let mut outcome = GatewayRxOutcome {
            loopback: false,
            duplicate: false,
            latency_us: None,
            pdr: None,
            batch_full: false,
            batch_overflow: false,
        };

        if section.origin_id == my_id {
            outcome.loopback = true;
            return outcome;
        }

        let seq = (section.message_id & 0xFF) as u8;
        // When the PDR table is full of other origins, the new origin goes
        // untracked but its data still flows upstream.
        if let Some(slot) = self.pdr_slot(section.origin_id) {
            match slot.as_mut() {
                Some(entry) => {
                    let delta = seq.wrapping_sub(entry.last_seq);
                    if delta == 0 {
                        // Same sequence seen again; counting it would push
                        // received past expected.
                        outcome.duplicate = true;
                        return outcome;
                    }
                    entry.last_seq = seq;
                    entry.received += 1;
                    entry.expected += delta as u32;
                    entry.gaps += delta.saturating_sub(1) as u32;
                    outcome.pdr = Some((entry.received, entry.expected));
                }
                None => {
                    *slot = Some(PdrEntry::new(section.origin_id, seq));
                    outcome.pdr = Some((1, 1));
                }
            }
        }

        outcome.latency_us = self.record_latency(section, now_epoch_us);

        let message = UpstreamMessage {
            origin: section.origin_id,
            msg_id: section.message_id,
            payload: section.payload,
            payload_len: section.payload_len,
            path: section.path,
            hop_count: section.hop_count,
        };
        if self.batch.push(message) {
            outcome.batch_full = self.batch.is_full();
        } else {
            outcome.batch_overflow = true;
        }
        outcome
    }

    fn record_latency(&mut self, section: &DataSection, now_epoch_us: Option<i64>) -> Option<u64> {
        if section.origin_tx_timestamp == 0 {
            return None;
        }
        let now = now_epoch_us?;
        if now <= 0 {
            return None;
        }
        let delta = (now as u64).checked_sub(section.origin_tx_timestamp)?;
        if delta == 0 || delta > MAX_LATENCY_US {
            // Clock anomaly: discard the sample, leave everything else be.
            return None;
        }
        self.latency_cache[self.latency_cache_idx] = Some(LatencyRecord {
            origin: section.origin_id,
            msg_id: section.message_id,
            latency_us: delta,
        });
        self.latency_cache_idx = (self.latency_cache_idx + 1) % LATENCY_CACHE_SIZE;

        if let Some(Some(entry)) = self.pdr_slot(section.origin_id) {
            entry.latency.record(delta);
        }
        Some(delta)
    }

    /// The slot holding `origin`, or the first free slot, or `None` when
    /// the table is full of other origins.
    fn pdr_slot(&mut self, origin: u16) -> Option<&mut Option<PdrEntry>> {
        let position = self
            .pdr
            .iter()
            .position(|slot| slot.as_ref().map_or(false, |entry| entry.origin == origin))
            .or_else(|| self.pdr.iter().position(|slot| slot.is_none()))?;
        Some(&mut self.pdr[position])
    }

    pub fn pdr_entry(&self, origin: u16) -> Option<&PdrEntry> {
        self.pdr.iter().flatten().find(|entry| entry.origin == origin)
    }

    pub fn pdr_entries(&self) -> impl Iterator<Item = &PdrEntry> + '_ {
        self.pdr.iter().flatten()
    }

    /// `(received, expected)` summed over all tracked origins.
    pub fn network_totals(&self) -> (u32, u32) {
        let mut received = 0;
        let mut expected = 0;
        for entry in self.pdr_entries() {
            received += entry.received;
            expected += entry.expected;
        }
        (received, expected)
    }

    pub fn latency_records(&self) -> impl Iterator<Item = &LatencyRecord> + '_ {
        self.latency_cache.iter().flatten()
    }

    /// Hands out the pending batch and starts a fresh one. `None` when
    /// nothing is queued.
    pub fn take_batch(&mut self) -> Option<UpstreamBatch> {
        if self.batch.is_empty() {
            return None;
        }
        let batch = self.batch;
        self.batch = UpstreamBatch::new();
        Some(batch)
    }

    /// Drops all counters and queued payloads; part of the pause reset.
    pub fn reset(&mut self) {
        self.pdr = [None; PDR_TABLE_SIZE];
        self.latency_cache = [None; LATENCY_CACHE_SIZE];
        self.latency_cache_idx = 0;
        self.batch = UpstreamBatch::new();
    }
}
