//! The node's protocol state.
//!
//! Everything the mesh core knows lives in one [`NodeState`] value owned by
//! the scheduler task and passed by exclusive reference; there is no shared
//! mutable state anywhere in the core. Per-frame side effects (neighbour
//! update, stratum election, cycle validation, payload routing) are
//! sequenced here in [`NodeState::handle_frame`], in arrival order, so the
//! scheduler stays a pure timing machine.

use crate::clock::EpochClock;
use crate::config::{RuntimeConfig, DEBUG_MODE_GATEWAY_ONLY};
use crate::forward::{path_contains, ForwardEntry, ForwardQueue};
use crate::frame::{AdvertisedNeighbour, DataMode, DataSection, Frame, FrameHeader, ADR_BROADCAST};
use crate::gateway::GatewaySink;
use crate::neighbour::{NeighbourTable, ObserveRejection};
use crate::origination::OriginationEngine;
use crate::routing::{recompute_hop, select_next_hop};
use crate::sensor::SensorStub;
use crate::stratum::SyncState;
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::timing::TdmaTiming;
use crate::control::StatusReport;
use crate::{UpstreamQueueSender, AUTO_SEND_INTERVAL_CYCLES, FIXED_FRAME_LENGTH, HOP_UNREACHABLE, MAX_NEIGHBOURS_IN_FRAME};
use log::{log, Level};

/// Static identity of this node.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct NodeIdentity {
    /// Unique id, 1..=65535. The gateway is id 1 by convention.
    pub id: u16,
    /// Statically assigned TX slot, `0..N_SLOTS`.
    pub slot: u8,
    /// True for the single gateway node.
    pub is_gateway: bool,
    /// Position-known flag; carried on the wire, never routed on.
    pub is_localized: bool,
}

/// This node's own view of itself, mirrored into every frame header.
#[cfg_attr(feature = "std", derive(Debug))]
pub struct MyInfo {
    pub id: u16,
    pub slot: u8,
    pub is_gateway: bool,
    pub is_localized: bool,
    /// Hop distance to the gateway; 0 at the gateway itself.
    pub hop: u8,
    /// Current network cycle, `0..AUTO_SEND_INTERVAL_CYCLES`.
    pub cycle: u8,
    pub sync: SyncState,
}

/// Non-fatal failure counts, surfaced through `STATUS` and telemetry.
#[derive(Clone, Copy, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct ErrorCounters {
    pub tx_failures: u32,
    pub rx_decode_errors: u32,
    pub rssi_rejections: u32,
    pub neighbour_table_full: u32,
    pub forward_queue_full: u32,
    pub upstream_overflow: u32,
}

/// The complete protocol state of one node.
pub struct NodeState {
    pub my: MyInfo,
    pub config: RuntimeConfig,
    pub timing: TdmaTiming,
    pub neighbours: NeighbourTable,
    pub forward_queue: ForwardQueue,
    pub origination: OriginationEngine,
    pub gateway_sink: GatewaySink,
    pub telemetry: TelemetrySink,
    pub epoch_clock: EpochClock,
    pub errors: ErrorCounters,
    pub sensor: SensorStub,
    upstream: Option<UpstreamQueueSender>,
    tx_frames: u32,
    rx_frames: u32,
}

impl NodeState {
    pub fn new(
        identity: NodeIdentity,
        config: RuntimeConfig,
        timing: TdmaTiming,
        telemetry: TelemetrySink,
        upstream: Option<UpstreamQueueSender>,
    ) -> Self {
        NodeState {
            my: MyInfo {
                id: identity.id,
                slot: identity.slot,
                is_gateway: identity.is_gateway,
                is_localized: identity.is_localized,
                hop: if identity.is_gateway { 0 } else { HOP_UNREACHABLE },
                cycle: 0,
                sync: if identity.is_gateway { SyncState::gateway() } else { SyncState::local() },
            },
            config,
            timing,
            neighbours: NeighbourTable::new(),
            forward_queue: ForwardQueue::new(),
            origination: OriginationEngine::new(),
            gateway_sink: GatewaySink::new(),
            telemetry,
            epoch_clock: EpochClock::new(),
            errors: ErrorCounters::default(),
            sensor: SensorStub::new(),
            upstream,
            tx_frames: 0,
            rx_frames: 0,
        }
    }

    /// Processing-phase housekeeping: age the neighbour table, recompute
    /// the hop distance, run the sync countdown.
    pub fn begin_cycle(&mut self) {
        let evictions = self.neighbours.tick(self.config.rssi_min);
        for id in evictions.iter() {
            self.telemetry.emit(TelemetryEvent::NeighborRemoved { id });
        }

        let new_hop = recompute_hop(&self.neighbours, self.my.is_gateway, self.config.rssi_min);
        if new_hop != self.my.hop {
            self.telemetry.emit(TelemetryEvent::HopChange {
                old: self.my.hop,
                new: new_hop,
            });
            log!(Level::Debug, "[{}] hop distance {} -> {}", self.my.id, self.my.hop, new_hop);
            self.my.hop = new_hop;
        }

        if self.my.sync.tick() {
            log!(Level::Info, "[{}] sync expired, degrading to local time", self.my.id);
        }

        if self.my.is_gateway {
            let (received, expected) = self.gateway_sink.network_totals();
            if expected > 0 {
                self.telemetry.emit(TelemetryEvent::PdrNetwork { received, expected });
            }
        }
    }

    /// Mints this node's own payload when its round-robin turn is up and
    /// every precondition holds.
    pub fn maybe_originate(&mut self) {
        if self.my.is_gateway {
            return;
        }
        let has_upstream = self.has_upstream_link();
        if self.origination.should_originate(self.my.id, self.my.cycle, self.my.hop, has_upstream) {
            let (payload, payload_len) = self.sensor.sample();
            let epoch = self.epoch_clock.epoch_now_us();
            let message_id = self.origination.mint(self.my.id, payload, payload_len, epoch);
            log!(Level::Debug, "[{}] originating message {:#06x} in cycle {}", self.my.id, message_id, self.my.cycle);
        }
    }

    /// True when some bidirectional neighbour sits strictly closer to the
    /// gateway than we do.
    fn has_upstream_link(&self) -> bool {
        self.neighbours
            .iter()
            .any(|entry| entry.am_i_listed && entry.hop != HOP_UNREACHABLE && entry.hop < self.my.hop && entry.rssi >= self.config.rssi_min)
    }

    /// Sequences all side effects of one received buffer.
    ///
    /// Returns the sender's slot when the frame was accepted (for the
    /// scheduler's timing reconstruction), `None` when the frame was
    /// dropped and must not influence anything.
    pub fn handle_frame(&mut self, buf: &[u8; FIXED_FRAME_LENGTH], rssi: i16, snr: i8) -> Option<u8> {
        let frame = match Frame::from_bytes(buf) {
            Ok(frame) => frame,
            Err(error) => {
                self.errors.rx_decode_errors += 1;
                log!(Level::Debug, "[{}] dropping undecodable frame: {:?}", self.my.id, error);
                return None;
            }
        };
        let sender = frame.sender_id();
        if sender == self.my.id || sender == 0 {
            return None;
        }
        self.telemetry.emit(TelemetryEvent::PktRx { sender, rssi, snr });

        match self.neighbours.observe(&frame, rssi, snr, self.my.id, self.config.rssi_min) {
            Ok(outcome) => {
                self.rx_frames += 1;
                if outcome.added {
                    self.telemetry.emit(TelemetryEvent::NeighborAdded {
                        id: sender,
                        slot: frame.sender_slot(),
                    });
                    log!(Level::Info, "[{}] new neighbour {} (slot {})", self.my.id, sender, frame.sender_slot());
                }
                if outcome.bidirectional_confirmed {
                    self.telemetry.emit(TelemetryEvent::BidirLink { id: sender });
                    log!(Level::Info, "[{}] bidirectional link with {}", self.my.id, sender);
                }
            }
            Err(ObserveRejection::RssiBelowFloor) => {
                self.errors.rssi_rejections += 1;
                self.telemetry.emit(TelemetryEvent::RssiLow { id: sender, rssi });
                return None;
            }
            Err(ObserveRejection::TableFull) => {
                // The sender stays untracked, but the frame itself is
                // sound: sync, validation and payload routing still run.
                self.errors.neighbour_table_full += 1;
                self.rx_frames += 1;
            }
        }

        if self.my.sync.observe_sender(sender, frame.stratum()) && self.my.cycle != frame.cycle() {
            self.my.cycle = frame.cycle();
            self.telemetry.emit(TelemetryEvent::CycleSync {
                cycle: frame.cycle(),
                source: sender,
            });
            log!(Level::Debug, "[{}] cycle synced to {} from {}", self.my.id, frame.cycle(), sender);
        }

        if !self.my.is_gateway && frame.hop() < self.my.hop {
            let progress = self.origination.observe_upstream_cycle(frame.cycle());
            self.telemetry.emit(TelemetryEvent::CycleVal {
                observations: progress.observations,
                validated: self.origination.cycle_validated,
            });
            if progress.just_validated {
                log!(Level::Info, "[{}] cycle validation earned", self.my.id);
            }
        }

        if let Some(section) = frame.frame_data().section() {
            if frame.hop_decision_target() == self.my.id {
                let section = *section;
                if self.my.is_gateway {
                    self.gateway_rx(&section);
                } else {
                    self.relay_rx(&section);
                }
            }
        }

        Some(frame.sender_slot())
    }

    fn gateway_rx(&mut self, section: &DataSection) {
        let now_epoch = self.epoch_clock.epoch_now_us();
        let outcome = self.gateway_sink.accept(section, self.my.id, now_epoch);
        if outcome.loopback || outcome.duplicate {
            return;
        }
        self.telemetry.emit(TelemetryEvent::GwRxData {
            origin: section.origin_id,
            message_id: section.message_id,
            hop_count: section.hop_count,
        });
        if self.config.debug_mode == DEBUG_MODE_GATEWAY_ONLY {
            log!(
                Level::Info,
                "DATA,{},{:#06x},{},{:?}",
                section.origin_id,
                section.message_id,
                section.hop_count,
                outcome.latency_us
            );
        }
        if let Some(latency_us) = outcome.latency_us {
            self.telemetry.emit(TelemetryEvent::Latency {
                origin: section.origin_id,
                latency_us,
            });
        }
        if let Some((received, expected)) = outcome.pdr {
            self.telemetry.emit(TelemetryEvent::PdrNode {
                origin: section.origin_id,
                received,
                expected,
            });
        }
        if outcome.batch_overflow {
            self.errors.upstream_overflow += 1;
        }
        if outcome.batch_full {
            self.flush_upstream();
        }
    }

    fn relay_rx(&mut self, section: &DataSection) {
        if path_contains(section, self.my.id) {
            self.telemetry.emit(TelemetryEvent::ForwardDrop {
                origin: section.origin_id,
                message_id: section.message_id,
            });
            log!(Level::Warn, "[{}] refusing to forward looped message {:#06x}", self.my.id, section.message_id);
            return;
        }
        let entry = ForwardEntry::from_section(section, self.my.id);
        match self.forward_queue.enqueue(entry) {
            Ok(()) => {
                self.telemetry.emit(TelemetryEvent::ForwardEnqueue {
                    origin: section.origin_id,
                    message_id: section.message_id,
                });
            }
            Err(_) => {
                self.errors.forward_queue_full += 1;
                self.telemetry.emit(TelemetryEvent::ForwardDrop {
                    origin: section.origin_id,
                    message_id: section.message_id,
                });
                log!(Level::Warn, "[{}] forward queue full, dropping message {:#06x}", self.my.id, section.message_id);
            }
        }
    }

    /// Builds the one frame this node emits in its owned slot.
    ///
    /// Priority: a queued forward beats the node's own pending payload,
    /// which beats a header-only announcement. Data leaves only when a
    /// next hop exists; otherwise it is held for a later cycle. The
    /// gateway always announces header-only.
    pub fn build_tx_frame(&mut self) -> Frame {
        let mut advertised = [AdvertisedNeighbour {
            id: 0,
            slot: 0,
            is_localized: false,
            hop: HOP_UNREACHABLE,
        }; MAX_NEIGHBOURS_IN_FRAME];
        let advertised_count = self.neighbours.advertisement(&mut advertised);

        let next_hop = if self.my.is_gateway {
            0
        } else {
            select_next_hop(&self.neighbours, self.my.hop, self.config.rssi_min, self.config.rssi_good)
        };

        let (mode, section) = if self.my.is_gateway || next_hop == 0 {
            (DataMode::None, None)
        } else if let Some(entry) = self.forward_queue.dequeue() {
            (DataMode::Forward, Some(entry.to_section()))
        } else if let Some(mut section) = self.origination.take_pending() {
            // Stamp the wall clock at actual transmit time, not at minting
            if let Some(epoch_us) = self.epoch_clock.epoch_now_us() {
                section.origin_tx_timestamp = epoch_us.max(0) as u64;
            }
            (DataMode::Own, Some(section))
        } else {
            (DataMode::None, None)
        };

        let header = FrameHeader {
            destination: ADR_BROADCAST,
            sender_id: self.my.id,
            sender_slot: self.my.slot,
            is_localized: self.my.is_localized,
            hop: self.my.hop,
            cycle: self.my.cycle,
            hop_decision_target: if section.is_some() { next_hop } else { 0 },
            stratum: self.my.sync.stratum,
            time_synced: self.my.sync.is_synced(),
        };
        match section {
            Some(section) => Frame::new_with_data(&header, &advertised[..advertised_count], mode, &section),
            None => Frame::new_announcement(&header, &advertised[..advertised_count]),
        }
    }

    /// Advances the free-running cycle counter at the cycle boundary.
    pub fn end_cycle(&mut self) {
        self.my.cycle = (self.my.cycle + 1) % AUTO_SEND_INTERVAL_CYCLES;
    }

    /// Hands the pending upstream batch to the collector queue (gateway
    /// only). Called when the batch fills and at the end of each
    /// processing phase.
    pub fn flush_upstream(&mut self) {
        if !self.my.is_gateway {
            return;
        }
        let Some(batch) = self.gateway_sink.take_batch() else {
            return;
        };
        let Some(sender) = &self.upstream else {
            return;
        };
        if sender.try_send(batch).is_err() {
            self.errors.upstream_overflow += 1;
            log!(Level::Warn, "[{}] upstream queue full, dropping batch", self.my.id);
        }
    }

    pub fn record_tx(&mut self, ok: bool) {
        if ok {
            self.tx_frames += 1;
        } else {
            self.errors.tx_failures += 1;
        }
    }

    /// Clears all routing state when the scheduler is paused. The
    /// monotonic clock and the wall-clock reference survive on purpose.
    pub fn reset_routing_state(&mut self) {
        self.neighbours.clear();
        self.my.hop = if self.my.is_gateway { 0 } else { HOP_UNREACHABLE };
        self.my.cycle = 0;
        self.forward_queue.clear();
        self.gateway_sink.reset();
        self.origination.reset();
        self.my.sync.reset();
        log!(Level::Info, "[{}] routing state cleared", self.my.id);
    }

    pub fn status_report(&self, scheduler_enabled: bool) -> StatusReport {
        StatusReport {
            node_id: self.my.id,
            slot: self.my.slot,
            hop: self.my.hop,
            cycle: self.my.cycle,
            stratum: self.my.sync.stratum.as_bits(),
            sync_source: self.my.sync.sync_source,
            neighbour_count: self.neighbours.len() as u8,
            bidirectional_count: self.neighbours.iter().filter(|entry| entry.is_bidirectional).count() as u8,
            forward_queue_len: self.forward_queue.len() as u8,
            cycle_validated: self.origination.cycle_validated,
            scheduler_enabled,
            tx_frames: self.tx_frames,
            rx_frames: self.rx_frames,
            tx_failures: self.errors.tx_failures,
            rx_rejected: self.errors.rssi_rejections + self.errors.rx_decode_errors,
            telemetry_dropped: self.telemetry.dropped(),
            network_totals: self.gateway_sink.network_totals(),
        }
    }
}
