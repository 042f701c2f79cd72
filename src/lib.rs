//! Slotted-TDMA mesh protocol core for low-power LoRa sensor networks.
//!
//! Turns an unreliable half-duplex broadcast radio into a collision-avoided,
//! self-organising, multi-hop store-and-forward fabric that delivers short
//! sensor payloads from leaf nodes to a single gateway. Each node owns one
//! TX slot per cycle and spends the rest of the cycle listening; routing is
//! distance-vector over a bounded neighbour table, time authority spreads
//! through a self-healing stratum tree, and the gateway accounts per-origin
//! delivery ratio and end-to-end latency.
//!
//! The crate is transport-agnostic at the edges: the radio is a
//! feature-selected device module, telemetry and upstream delivery are
//! bounded queues drained by host tasks, and persistent configuration is
//! validated here but stored by the host.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(any(
    all(feature = "radio-device-echo", any(feature = "radio-device-lora-sx1262", feature = "radio-device-simulator")),
    all(feature = "radio-device-lora-sx1262", any(feature = "radio-device-echo", feature = "radio-device-simulator")),
    all(feature = "radio-device-simulator", any(feature = "radio-device-echo", feature = "radio-device-lora-sx1262")),
))]
compile_error!("Only one radio implementation feature can be enabled at a time");

#[cfg(not(any(feature = "radio-device-echo", feature = "radio-device-simulator", feature = "radio-device-lora-sx1262")))]
compile_error!("At least one radio implementation feature must be enabled");

#[cfg(feature = "radio-device-lora-sx1262")]
pub mod radio_device_lora_sx1262;

#[cfg(feature = "radio-device-echo")]
pub mod radio_device_echo;

#[cfg(feature = "radio-device-simulator")]
pub mod radio_device_simulator;

#[cfg(feature = "radio-device-lora-sx1262")]
pub use crate::radio_device_lora_sx1262::RadioDevice;

#[cfg(feature = "radio-device-echo")]
pub use crate::radio_device_echo::RadioDevice;

#[cfg(feature = "radio-device-simulator")]
pub use crate::radio_device_simulator::RadioDevice;

pub mod clock;
pub mod config;
pub mod control;
pub mod forward;
pub mod frame;
pub mod gateway;
pub mod neighbour;
pub mod node_state;
pub mod origination;
pub mod routing;
pub mod scheduler;
pub mod sensor;
pub mod stratum;
pub mod telemetry;
pub mod timing;

use crate::scheduler::tdma_scheduler_task;
use core::sync::atomic::AtomicBool;
use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use log::{log, Level};

pub use crate::config::{LoraParams, RuntimeConfig};
pub use crate::control::{parse_command, Command, CommandParseError, CommandReply, StatusReport};
pub use crate::frame::{AdvertisedNeighbour, DataMode, DataSection, Frame, FrameData, FrameHeader};
pub use crate::gateway::{LatencyRecord, PdrEntry, UpstreamBatch, UpstreamMessage};
pub use crate::node_state::{NodeIdentity, NodeState};
pub use crate::stratum::Stratum;
pub use crate::telemetry::{TelemetryEvent, TelemetrySink};
pub use crate::timing::TdmaTiming;

// Wire-compatibility constants: changing any of these changes the protocol
// every node in the network must speak.

/// Exact length of every frame on the air.
pub const FIXED_FRAME_LENGTH: usize = 48;
/// Slots per cycle; slot indices are `0..N_SLOTS`.
pub const N_SLOTS: u8 = 8;
/// The gateway's node id, by convention.
pub const GATEWAY_ID: u16 = 1;
/// Hop-distance sentinel for "unreachable / unknown".
pub const HOP_UNREACHABLE: u8 = 0x7F;
/// Advertised neighbours per frame (the 16-byte wire region).
pub const MAX_NEIGHBOURS_IN_FRAME: usize = 4;
/// Cycle counter modulus: every node originates once per this many cycles.
/// Must not be smaller than the network's expected originator count.
pub const AUTO_SEND_INTERVAL_CYCLES: u8 = 6;
/// Sensor payload bytes carried per frame.
pub const SENSOR_DATA_LENGTH: usize = 6;
/// Relay hops tracked in a frame's path field.
pub const MAX_TRACKING_HOPS: usize = 3;

// Node-local capacities. These only affect how much one node remembers,
// not wire compatibility.

/// Neighbour table capacity.
pub const MAX_NEIGHBOURS: usize = 10;
/// Cycles without hearing a neighbour before it is evicted.
pub const MAX_INACTIVE_CYCLES: u8 = 20;
/// Cycles a sync source stays valid without refresh.
pub const SYNC_VALID_CYCLES: u8 = 5;
/// Pending relays held across cycles.
pub const FORWARD_QUEUE_SIZE: usize = 8;
/// Gateway latency record ring size.
pub const LATENCY_CACHE_SIZE: usize = 20;
/// Origins the gateway tracks delivery metrics for.
pub const PDR_TABLE_SIZE: usize = 10;
/// Payloads per upstream handoff.
pub const UPSTREAM_BATCH_SIZE: usize = 10;
/// Wall-clock drift correction cap, parts per million.
pub const MAX_DRIFT_PPM: u32 = 100;

#[cfg(feature = "radio-device-simulator")]
pub(crate) const MAX_NODE_COUNT: usize = 64;

#[cfg(not(feature = "radio-device-simulator"))]
pub(crate) const MAX_NODE_COUNT: usize = 1;

/// One frame as it left the radio, with the receiver-side signal metrics.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct ReceivedFrame {
    pub data: [u8; FIXED_FRAME_LENGTH],
    /// Received signal strength in dBm.
    pub rssi: i16,
    /// Signal-to-noise ratio in dB.
    pub snr: i8,
}

/// Events mirrored to the external collector.
pub const TELEMETRY_QUEUE_SIZE: usize = 100;
pub type TelemetryQueue = Channel<CriticalSectionRawMutex, TelemetryEvent, TELEMETRY_QUEUE_SIZE>;
pub type TelemetryQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, TelemetryEvent, TELEMETRY_QUEUE_SIZE>;
pub type TelemetryQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, TelemetryEvent, TELEMETRY_QUEUE_SIZE>;

/// Per-cycle node snapshots for the UI renderer.
pub const STATUS_QUEUE_SIZE: usize = 50;
pub type StatusQueue = Channel<CriticalSectionRawMutex, StatusReport, STATUS_QUEUE_SIZE>;
pub type StatusQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, StatusReport, STATUS_QUEUE_SIZE>;
pub type StatusQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, StatusReport, STATUS_QUEUE_SIZE>;

/// Gateway-to-collector payload batches.
pub const UPSTREAM_QUEUE_SIZE: usize = 4;
pub type UpstreamQueue = Channel<CriticalSectionRawMutex, UpstreamBatch, UPSTREAM_QUEUE_SIZE>;
pub type UpstreamQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, UpstreamBatch, UPSTREAM_QUEUE_SIZE>;
pub type UpstreamQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, UpstreamBatch, UPSTREAM_QUEUE_SIZE>;

/// Host-to-scheduler control commands.
pub const COMMAND_QUEUE_SIZE: usize = 4;
pub type CommandQueue = Channel<CriticalSectionRawMutex, Command, COMMAND_QUEUE_SIZE>;
pub type CommandQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, Command, COMMAND_QUEUE_SIZE>;
pub type CommandQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, Command, COMMAND_QUEUE_SIZE>;

/// Scheduler-to-host command replies.
pub const COMMAND_REPLY_QUEUE_SIZE: usize = 4;
pub type CommandReplyQueue = Channel<CriticalSectionRawMutex, CommandReply, COMMAND_REPLY_QUEUE_SIZE>;
pub type CommandReplyQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, CommandReply, COMMAND_REPLY_QUEUE_SIZE>;
pub type CommandReplyQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, CommandReply, COMMAND_REPLY_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static TELEMETRY_QUEUE: TelemetryQueue = Channel::new();
#[cfg(feature = "embedded")]
static STATUS_QUEUE: StatusQueue = Channel::new();
#[cfg(feature = "embedded")]
static UPSTREAM_QUEUE: UpstreamQueue = Channel::new();
#[cfg(feature = "embedded")]
static COMMAND_QUEUE: CommandQueue = Channel::new();
#[cfg(feature = "embedded")]
static COMMAND_REPLY_QUEUE: CommandReplyQueue = Channel::new();
#[cfg(feature = "embedded")]
static SCHEDULER_ENABLED: AtomicBool = AtomicBool::new(true);

pub enum CommandSendError {
    ChannelFull,
    NotInited,
}

pub enum ReceiveError {
    NotInited,
}

enum MeshNodeManagerState {
    Uninitialized,
    Initialized {
        command_queue_sender: CommandQueueSender,
        command_reply_queue_receiver: CommandReplyQueueReceiver,
        telemetry_queue_receiver: TelemetryQueueReceiver,
        status_queue_receiver: StatusQueueReceiver,
        upstream_queue_receiver: UpstreamQueueReceiver,
        scheduler_enabled: &'static AtomicBool,
    },
}

/// Entry point of the crate: wires the queues, builds the node state and
/// spawns the TDMA scheduler task.
///
/// The host keeps the manager around to feed control commands in and drain
/// replies, telemetry, per-cycle status snapshots and (on the gateway)
/// upstream payload batches.
pub struct MeshNodeManager {
    state: MeshNodeManagerState,
}

impl Default for MeshNodeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshNodeManager {
    pub const fn new() -> Self {
        MeshNodeManager {
            state: MeshNodeManagerState::Uninitialized,
        }
    }

    #[cfg(feature = "embedded")]
    pub fn initialize(
        &mut self,
        identity: NodeIdentity,
        config: RuntimeConfig,
        timing: TdmaTiming,
        spawner: Spawner,
        radio_device: RadioDevice,
    ) -> Result<(), ()> {
        self.initialize_common(
            identity,
            config,
            timing,
            spawner,
            radio_device,
            &TELEMETRY_QUEUE,
            &STATUS_QUEUE,
            &UPSTREAM_QUEUE,
            &COMMAND_QUEUE,
            &COMMAND_REPLY_QUEUE,
            &SCHEDULER_ENABLED,
        )
    }

    #[cfg(feature = "std")]
    pub fn initialize(
        &mut self,
        identity: NodeIdentity,
        config: RuntimeConfig,
        timing: TdmaTiming,
        spawner: Spawner,
        radio_device: RadioDevice,
    ) -> Result<(), ()> {
        let telemetry_queue: &'static TelemetryQueue = Box::leak(Box::new(Channel::new()));
        let status_queue: &'static StatusQueue = Box::leak(Box::new(Channel::new()));
        let upstream_queue: &'static UpstreamQueue = Box::leak(Box::new(Channel::new()));
        let command_queue: &'static CommandQueue = Box::leak(Box::new(Channel::new()));
        let command_reply_queue: &'static CommandReplyQueue = Box::leak(Box::new(Channel::new()));
        let scheduler_enabled: &'static AtomicBool = Box::leak(Box::new(AtomicBool::new(true)));
        self.initialize_common(
            identity,
            config,
            timing,
            spawner,
            radio_device,
            telemetry_queue,
            status_queue,
            upstream_queue,
            command_queue,
            command_reply_queue,
            scheduler_enabled,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn initialize_common(
        &mut self,
        identity: NodeIdentity,
        config: RuntimeConfig,
        timing: TdmaTiming,
        spawner: Spawner,
        radio_device: RadioDevice,
        telemetry_queue: &'static TelemetryQueue,
        status_queue: &'static StatusQueue,
        upstream_queue: &'static UpstreamQueue,
        command_queue: &'static CommandQueue,
        command_reply_queue: &'static CommandReplyQueue,
        scheduler_enabled: &'static AtomicBool,
    ) -> Result<(), ()> {
        let config = config.sanitized();
        let telemetry = TelemetrySink::new(Some(telemetry_queue.sender()), config.debug_mode, identity.id);
        let upstream_sender = if identity.is_gateway { Some(upstream_queue.sender()) } else { None };
        let node = NodeState::new(identity, config, timing, telemetry, upstream_sender);

        let scheduler_task_result = spawner.spawn(tdma_scheduler_task(
            radio_device,
            node,
            command_queue.receiver(),
            command_reply_queue.sender(),
            status_queue.sender(),
            scheduler_enabled,
        ));
        if scheduler_task_result.is_err() {
            return Err(());
        }
        log!(Level::Info, "[{}] mesh node initialized (slot {})", identity.id, identity.slot);

        self.state = MeshNodeManagerState::Initialized {
            command_queue_sender: command_queue.sender(),
            command_reply_queue_receiver: command_reply_queue.receiver(),
            telemetry_queue_receiver: telemetry_queue.receiver(),
            status_queue_receiver: status_queue.receiver(),
            upstream_queue_receiver: upstream_queue.receiver(),
            scheduler_enabled,
        };
        Ok(())
    }

    /// Queues one control command for the scheduler's next processing
    /// phase.
    pub fn send_command(&self, command: Command) -> Result<(), CommandSendError> {
        let command_queue_sender = match &self.state {
            MeshNodeManagerState::Uninitialized => {
                return Err(CommandSendError::NotInited);
            }
            MeshNodeManagerState::Initialized { command_queue_sender, .. } => command_queue_sender,
        };
        command_queue_sender.try_send(command).map_err(|_| CommandSendError::ChannelFull)?;
        Ok(())
    }

    /// Awaits the scheduler's reply to a queued command.
    pub async fn receive_reply(&self) -> Result<CommandReply, ReceiveError> {
        match &self.state {
            MeshNodeManagerState::Uninitialized => Err(ReceiveError::NotInited),
            MeshNodeManagerState::Initialized {
                command_reply_queue_receiver, ..
            } => Ok(command_reply_queue_receiver.receive().await),
        }
    }

    /// Flips the scheduler on or off directly, bypassing the command
    /// queue. Equivalent to `START`/`STOP` without a reply.
    pub fn set_scheduler_enabled(&self, enabled: bool) {
        if let MeshNodeManagerState::Initialized { scheduler_enabled, .. } = &self.state {
            scheduler_enabled.store(enabled, core::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Receiver end of the telemetry mirror, for the host's collector
    /// bridge task.
    pub fn telemetry_receiver(&self) -> Option<TelemetryQueueReceiver> {
        match &self.state {
            MeshNodeManagerState::Uninitialized => None,
            MeshNodeManagerState::Initialized { telemetry_queue_receiver, .. } => Some(*telemetry_queue_receiver),
        }
    }

    /// Receiver end of the per-cycle status snapshots, for the UI
    /// renderer.
    pub fn status_receiver(&self) -> Option<StatusQueueReceiver> {
        match &self.state {
            MeshNodeManagerState::Uninitialized => None,
            MeshNodeManagerState::Initialized { status_queue_receiver, .. } => Some(*status_queue_receiver),
        }
    }

    /// Receiver end of the gateway's upstream batches, for the host's
    /// collector task. Non-gateway nodes never produce batches.
    pub fn upstream_receiver(&self) -> Option<UpstreamQueueReceiver> {
        match &self.state {
            MeshNodeManagerState::Uninitialized => None,
            MeshNodeManagerState::Initialized { upstream_queue_receiver, .. } => Some(*upstream_queue_receiver),
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn manager_send_command_not_inited() {
        let manager = MeshNodeManager::new();
        match manager.send_command(Command::Ping) {
            Err(CommandSendError::NotInited) => {}
            _ => panic!("expected NotInited"),
        }
    }

    #[test]
    fn manager_receive_reply_not_inited() {
        let manager = MeshNodeManager::new();
        let result = futures::executor::block_on(manager.receive_reply());
        match result {
            Err(ReceiveError::NotInited) => {}
            _ => panic!("expected NotInited"),
        }
    }

    #[test]
    fn manager_receivers_absent_before_init() {
        let manager = MeshNodeManager::new();
        assert!(manager.telemetry_receiver().is_none());
        assert!(manager.status_receiver().is_none());
        assert!(manager.upstream_receiver().is_none());
    }

    #[test]
    fn reexports_are_usable() {
        // Basic sanity that key types resolve from the crate root
        let _ = Stratum::from_bits(1);
        let timing = TdmaTiming::default();
        assert_eq!(timing.t_period_us(), N_SLOTS as u64 * timing.t_slot_us);
        assert!(matches!(parse_command("PING"), Ok(Command::Ping)));
    }
}
