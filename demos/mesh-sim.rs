//! Three-node mesh simulation: a gateway, a relay and a leaf on a line
//! topology, glued together by an in-process radio hub. Runs compressed
//! TDMA cycles and prints what the gateway collects.
//!
//! Run with `cargo run --example mesh-sim` (std + simulator features).

use embassy_executor::Spawner;
use embassy_futures::select::select_array;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Timer};
use env_logger::Builder;
use log::{info, LevelFilter};
use tdma_mesh_lib::radio_device_simulator::{
    OnAirFrame, RadioDevice, SimulatorDownlinkQueue, SimulatorDownlinkQueueSender, SimulatorUplinkQueue, SimulatorUplinkQueueReceiver,
};
use tdma_mesh_lib::{MeshNodeManager, NodeIdentity, ReceivedFrame, RuntimeConfig, TdmaTiming, UpstreamQueueReceiver, GATEWAY_ID};

const NODE_COUNT: usize = 3;

/// Line topology by node index: gateway <-> relay <-> leaf.
const LINKS: [(usize, usize); 2] = [(0, 1), (1, 2)];

/// Signal metrics the hub attaches to every delivered frame.
const LINK_RSSI_DBM: i16 = -82;
const LINK_SNR_DB: i8 = 6;

/// Moves frames between the simulated radios according to the topology.
#[embassy_executor::task]
async fn hub_task(uplinks: [SimulatorUplinkQueueReceiver; NODE_COUNT], downlinks: [SimulatorDownlinkQueueSender; NODE_COUNT]) -> ! {
    loop {
        let (frame, sender_index): (OnAirFrame, usize) = select_array([uplinks[0].receive(), uplinks[1].receive(), uplinks[2].receive()]).await;
        for &(a, b) in LINKS.iter() {
            let peer = if a == sender_index {
                b
            } else if b == sender_index {
                a
            } else {
                continue;
            };
            let delivered = ReceivedFrame {
                data: frame.data,
                rssi: LINK_RSSI_DBM,
                snr: LINK_SNR_DB,
            };
            if downlinks[peer].try_send(delivered).is_err() {
                log::warn!("hub: downlink {} full, frame lost", peer);
            }
        }
    }
}

/// Prints every payload batch the gateway hands upstream.
#[embassy_executor::task]
async fn collector_task(upstream: UpstreamQueueReceiver) -> ! {
    loop {
        let batch = upstream.receive().await;
        for message in batch.messages() {
            info!(
                "collector: origin {} msg {:#06x} path {:?} payload {:?}",
                message.origin,
                message.msg_id,
                &message.path[..(message.hop_count as usize).min(message.path.len())],
                core::str::from_utf8(&message.payload[..message.payload_len as usize]).unwrap_or("<binary>")
            );
        }
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    Builder::new().filter_level(LevelFilter::Info).init();
    info!("starting three-node mesh simulation");

    // Compressed cycle timing so the demo turns over quickly: 20 ms
    // slots, 10 ms processing, 5 ms modeled air time.
    let timing = TdmaTiming::new(20_000, 10_000, 5_000, 500, 200);

    let uplink_0: &'static SimulatorUplinkQueue = Box::leak(Box::new(Channel::new()));
    let uplink_1: &'static SimulatorUplinkQueue = Box::leak(Box::new(Channel::new()));
    let uplink_2: &'static SimulatorUplinkQueue = Box::leak(Box::new(Channel::new()));
    let downlink_0: &'static SimulatorDownlinkQueue = Box::leak(Box::new(Channel::new()));
    let downlink_1: &'static SimulatorDownlinkQueue = Box::leak(Box::new(Channel::new()));
    let downlink_2: &'static SimulatorDownlinkQueue = Box::leak(Box::new(Channel::new()));

    spawner
        .spawn(hub_task(
            [uplink_0.receiver(), uplink_1.receiver(), uplink_2.receiver()],
            [downlink_0.sender(), downlink_1.sender(), downlink_2.sender()],
        ))
        .unwrap();

    let mut gateway_manager = MeshNodeManager::new();
    gateway_manager
        .initialize(
            NodeIdentity {
                id: GATEWAY_ID,
                slot: 0,
                is_gateway: true,
                is_localized: true,
            },
            RuntimeConfig::default(),
            timing,
            spawner,
            RadioDevice::with(uplink_0.sender(), downlink_0.receiver(), 5_000, 0xC0FFEE),
        )
        .expect("gateway initialization");

    let mut relay_manager = MeshNodeManager::new();
    relay_manager
        .initialize(
            NodeIdentity {
                id: 2,
                slot: 1,
                is_gateway: false,
                is_localized: false,
            },
            RuntimeConfig::default(),
            timing,
            spawner,
            RadioDevice::with(uplink_1.sender(), downlink_1.receiver(), 5_000, 0xC0FFEE + 1),
        )
        .expect("relay initialization");

    let mut leaf_manager = MeshNodeManager::new();
    leaf_manager
        .initialize(
            NodeIdentity {
                id: 5,
                slot: 3,
                is_gateway: false,
                is_localized: false,
            },
            RuntimeConfig::default(),
            timing,
            spawner,
            RadioDevice::with(uplink_2.sender(), downlink_2.receiver(), 5_000, 0xC0FFEE + 2),
        )
        .expect("leaf initialization");

    let upstream = gateway_manager.upstream_receiver().expect("gateway upstream queue");
    spawner.spawn(collector_task(upstream)).unwrap();

    loop {
        Timer::after(Duration::from_secs(5)).await;
        info!("simulation running");
    }
}
