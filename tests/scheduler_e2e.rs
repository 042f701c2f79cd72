//! Full-stack run: three scheduler tasks on a real executor, talking
//! through the simulated radio with compressed slot timing. Verifies that
//! independently started nodes lock onto the TDMA cadence via the timing
//! reconstruction and that a leaf payload crosses the relay to the
//! gateway's upstream queue in real (compressed) time.

use embassy_executor::Executor;
use embassy_futures::select::select_array;
use embassy_sync::channel::Channel;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tdma_mesh_lib::radio_device_simulator::{
    OnAirFrame, RadioDevice, SimulatorDownlinkQueue, SimulatorDownlinkQueueSender, SimulatorUplinkQueue, SimulatorUplinkQueueReceiver,
};
use tdma_mesh_lib::{
    MeshNodeManager, NodeIdentity, ReceivedFrame, RuntimeConfig, TdmaTiming, UpstreamQueueReceiver, GATEWAY_ID,
};

const NODE_COUNT: usize = 3;

/// Line topology by node index: gateway <-> relay <-> leaf.
const LINKS: [(usize, usize); 2] = [(0, 1), (1, 2)];

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
            let _ = downlinks[peer].try_send(ReceivedFrame {
                data: frame.data,
                rssi: -82,
                snr: 6,
            });
        }
    }
}

#[test]
fn leaf_payload_reaches_the_gateway_in_real_time() {
    // 10 ms slots, 5 ms processing, 2 ms modeled air time: a full cycle
    // takes 85 ms, so the leaf's first usable origination window (cycle
    // 10) plus two relay cycles lands around the one-second mark.
    let timing = TdmaTiming::new(10_000, 5_000, 2_000, 200, 100);

    let uplink_0: &'static SimulatorUplinkQueue = Box::leak(Box::new(Channel::new()));
    let uplink_1: &'static SimulatorUplinkQueue = Box::leak(Box::new(Channel::new()));
    let uplink_2: &'static SimulatorUplinkQueue = Box::leak(Box::new(Channel::new()));
    let downlink_0: &'static SimulatorDownlinkQueue = Box::leak(Box::new(Channel::new()));
    let downlink_1: &'static SimulatorDownlinkQueue = Box::leak(Box::new(Channel::new()));
    let downlink_2: &'static SimulatorDownlinkQueue = Box::leak(Box::new(Channel::new()));

    let (handoff_tx, handoff_rx) = mpsc::channel::<UpstreamQueueReceiver>();

    thread::spawn(move || {
        let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
        executor.run(move |spawner| {
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
                    RadioDevice::with(uplink_0.sender(), downlink_0.receiver(), 2_000, 11),
                )
                .unwrap();
            handoff_tx.send(gateway_manager.upstream_receiver().unwrap()).unwrap();

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
                    RadioDevice::with(uplink_1.sender(), downlink_1.receiver(), 2_000, 22),
                )
                .unwrap();

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
                    RadioDevice::with(uplink_2.sender(), downlink_2.receiver(), 2_000, 33),
                )
                .unwrap();
        });
    });

    let upstream = handoff_rx.recv_timeout(Duration::from_secs(5)).expect("executor thread started");

    // Poll the upstream queue from outside the executor until the leaf's
    // payload arrives. Generous deadline: slow CI only delays cycles, the
    // protocol re-synchronises by itself.
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if let Ok(batch) = upstream.try_receive() {
            if let Some(message) = batch.messages().iter().find(|message| message.origin == 5) {
                assert_eq!(message.payload, *b"T20H60");
                assert_eq!(message.path[0], 5, "path starts at the origin");
                assert!(message.hop_count >= 2, "the payload crossed the relay");
                return;
            }
        }
        assert!(Instant::now() < deadline, "no payload from the leaf within the deadline");
        thread::sleep(Duration::from_millis(50));
    }
}
