//! Simulated radio device.
//!
//! Bridges the node to a host-side network simulator over a pair of
//! channels: transmitted frames go out through the uplink queue, and the
//! simulator injects frames (with the signal metrics it decided on) through
//! the downlink queue. The simulator owns topology, propagation and loss;
//! the device only models the half-duplex timing, blocking `transmit` for
//! the configured air time the way the real radio blocks until TX-done.

use crate::{ReceivedFrame, FIXED_FRAME_LENGTH};
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Instant, Timer};
use log::{log, Level};
use rand_core::RngCore;
use rand_core::SeedableRng;
use rand_wyrand::WyRand;

/// Maximum extra on-air jitter applied per transmission, in microseconds.
/// Models crystal tolerance between simulated nodes.
const AIRTIME_JITTER_US: u64 = 1_000;

const SIMULATOR_QUEUE_SIZE: usize = 16;

/// A frame leaving this node for the simulated network.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct OnAirFrame {
    pub data: [u8; FIXED_FRAME_LENGTH],
}

/// Node-to-simulator uplink queue.
pub type SimulatorUplinkQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, OnAirFrame, SIMULATOR_QUEUE_SIZE>;
pub type SimulatorUplinkQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, OnAirFrame, SIMULATOR_QUEUE_SIZE>;
pub type SimulatorUplinkQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, OnAirFrame, SIMULATOR_QUEUE_SIZE>;

/// Simulator-to-node downlink queue; the simulator attaches the signal
/// metrics the receiving antenna would have seen.
pub type SimulatorDownlinkQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, ReceivedFrame, SIMULATOR_QUEUE_SIZE>;
pub type SimulatorDownlinkQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, ReceivedFrame, SIMULATOR_QUEUE_SIZE>;
pub type SimulatorDownlinkQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, ReceivedFrame, SIMULATOR_QUEUE_SIZE>;

/// Channel-backed radio for multi-node simulation.
pub struct RadioDevice {
    uplink: SimulatorUplinkQueueSender,
    downlink: SimulatorDownlinkQueueReceiver,
    airtime_us: u64,
    rng: WyRand,
}

impl RadioDevice {
    /// Creates a device wired to a network simulator.
    ///
    /// `airtime_us` is the modeled on-air duration `transmit` blocks for;
    /// pass the effective time-on-air for realistic TDMA timing, or a tiny
    /// value to make tests fast.
    pub fn with(uplink: SimulatorUplinkQueueSender, downlink: SimulatorDownlinkQueueReceiver, airtime_us: u64, rng_seed: u64) -> Self {
        RadioDevice {
            uplink,
            downlink,
            airtime_us,
            rng: WyRand::seed_from_u64(rng_seed),
        }
    }

    /// Hands the frame to the simulator and blocks for the modeled air
    /// time, mirroring the real radio's TX-done semantics.
    pub async fn transmit(&mut self, data: &[u8; FIXED_FRAME_LENGTH]) -> bool {
        let accepted = match self.uplink.try_send(OnAirFrame { data: *data }) {
            Ok(()) => true,
            Err(_) => {
                log!(Level::Warn, "simulator uplink full, frame lost on air");
                false
            }
        };
        let jitter = if self.airtime_us > 0 { self.rng.next_u64() % AIRTIME_JITTER_US } else { 0 };
        Timer::after(Duration::from_micros(self.airtime_us + jitter)).await;
        accepted
    }

    /// Waits for the next injected frame or the deadline, whichever comes
    /// first.
    pub async fn receive_until(&mut self, deadline: Instant) -> Option<ReceivedFrame> {
        match select(self.downlink.receive(), Timer::at(deadline)).await {
            Either::First(frame) => Some(frame),
            Either::Second(()) => None,
        }
    }
}
