//! Telemetry event mirror.
//!
//! The core never blocks on observability: every noteworthy state change is
//! offered to a bounded queue with `try_send`, and a full queue simply
//! counts a drop. A host-side task (the Wi-Fi monitor bridge on the second
//! processor, in the reference deployment) drains the queue and ships the
//! events to the off-device collector.

use crate::config::DEBUG_MODE_WIFI_MONITOR;
use crate::TelemetryQueueSender;
use log::{log, Level};

/// Events recognised by the collector tooling.
///
/// Fields are plain numbers so events stay `Copy` and queue slots stay
/// small; the collector owns all formatting.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug, PartialEq, Eq))]
pub enum TelemetryEvent {
    NeighborAdded { id: u16, slot: u8 },
    NeighborRemoved { id: u16 },
    BidirLink { id: u16 },
    RssiLow { id: u16, rssi: i16 },
    CycleSync { cycle: u8, source: u16 },
    CycleVal { observations: u8, validated: bool },
    HopChange { old: u8, new: u8 },
    ForwardEnqueue { origin: u16, message_id: u16 },
    ForwardDrop { origin: u16, message_id: u16 },
    GwRxData { origin: u16, message_id: u16, hop_count: u8 },
    Latency { origin: u16, latency_us: u64 },
    PdrNetwork { received: u32, expected: u32 },
    PdrNode { origin: u16, received: u32, expected: u32 },
    PktRx { sender: u16, rssi: i16, snr: i8 },
    Status { hop: u8, stratum: u8, neighbours: u8 },
    CmdExecuted { command: u8 },
}

/// Non-blocking fan-out of [`TelemetryEvent`]s.
///
/// Mirroring is active only in the wifi-monitor debug mode; in the other
/// modes `emit` is a cheap no-op so leaf nodes pay nothing for
/// observability they do not use.
pub struct TelemetrySink {
    sender: Option<TelemetryQueueSender>,
    debug_mode: u8,
    own_node_id: u16,
    dropped: u32,
}

impl TelemetrySink {
    pub fn new(sender: Option<TelemetryQueueSender>, debug_mode: u8, own_node_id: u16) -> Self {
        TelemetrySink {
            sender,
            debug_mode,
            own_node_id,
            dropped: 0,
        }
    }

    /// A sink that swallows everything, for tests and disabled builds.
    pub fn disabled() -> Self {
        TelemetrySink::new(None, 0, 0)
    }

    pub fn set_debug_mode(&mut self, debug_mode: u8) {
        self.debug_mode = debug_mode;
    }

    /// Number of events lost to a full queue since boot.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Offers one event to the mirror queue. Never blocks; a full queue
    /// increments the drop counter and the event is gone.
    pub fn emit(&mut self, event: TelemetryEvent) {
        if self.debug_mode != DEBUG_MODE_WIFI_MONITOR {
            return;
        }
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.try_send(event).is_err() {
            self.dropped = self.dropped.wrapping_add(1);
            if self.dropped % 100 == 1 {
                log!(Level::Warn, "[{}] telemetry queue full, {} events dropped", self.own_node_id, self.dropped);
            }
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::TelemetryQueue;
    use embassy_sync::channel::Channel;

    #[test]
    fn disabled_mode_emits_nothing() {
        let queue: &'static TelemetryQueue = Box::leak(Box::new(Channel::new()));
        let mut sink = TelemetrySink::new(Some(queue.sender()), 0, 1);
        sink.emit(TelemetryEvent::BidirLink { id: 2 });
        assert!(queue.try_receive().is_err());
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn monitor_mode_mirrors_and_counts_drops() {
        let queue: &'static TelemetryQueue = Box::leak(Box::new(Channel::new()));
        let mut sink = TelemetrySink::new(Some(queue.sender()), DEBUG_MODE_WIFI_MONITOR, 1);

        sink.emit(TelemetryEvent::NeighborAdded { id: 2, slot: 1 });
        assert_eq!(queue.try_receive().unwrap(), TelemetryEvent::NeighborAdded { id: 2, slot: 1 });

        // Fill the queue to capacity, then one more must be dropped
        let mut sent = 0;
        while queue.try_send(TelemetryEvent::BidirLink { id: 3 }).is_ok() {
            sent += 1;
        }
        assert_eq!(sent, crate::TELEMETRY_QUEUE_SIZE);
        sink.emit(TelemetryEvent::BidirLink { id: 4 });
        assert_eq!(sink.dropped(), 1);
    }
}
