//! Slotted TDMA scheduler.
//!
//! One task owns the radio and the whole node state and walks the four
//! phases of every cycle in strict order:
//!
//! 1. **Processing**: table ageing, hop recompute, sync countdown,
//!    control commands, upstream flush. No radio activity.
//! 2. **RX-before**: listen for the slots before our own.
//! 3. **TX**: the node's one frame in its owned slot, padded to the full
//!    slot width.
//! 4. **RX-after**: listen until the cycle boundary.
//!
//! The scheduler never trusts its own free-running clock for long: every
//! accepted frame tells it which slot the sender owns, and the remaining
//! listen window is recomputed from the slot distance (the LoRaQuake
//! reconstruction). That keeps an unsynchronised node convergent to the
//! network cadence within one heard frame, sub-millisecond over a cycle.
//!
//! Pausing is a shared atomic flag checked once per loop iteration: when
//! clear, all routing state is wiped and the task idles, draining control
//! commands, until re-enabled.

use crate::control::{Command, CommandReply};
use crate::node_state::NodeState;
use crate::telemetry::TelemetryEvent;
use crate::timing::TdmaTiming;
use crate::{CommandQueueReceiver, CommandReplyQueueSender, RadioDevice, StatusQueueSender, MAX_NODE_COUNT, N_SLOTS};
use core::sync::atomic::{AtomicBool, Ordering};
use embassy_time::{Duration, Instant, Timer};
use log::{log, Level};

/// Poll period of the idle (paused) loop.
const PAUSED_POLL_MS: u64 = 50;

/// Sign-correct modulo, verified against the LoRaQuake reference.
pub(crate) const fn modulo(x: i32, y: i32) -> i32 {
    if x < 0 {
        ((x + 1) % y) + y - 1
    } else {
        x % y
    }
}

/// Remaining RX-before window after hearing `sender_slot`, from the slot
/// distance alone.
///
/// `k` counts the full slots still to listen through before our own. When
/// our slot is at or behind the sender's in this cycle, the window also
/// spans the next processing phase.
pub fn rx_before_remaining_us(my_slot: u8, sender_slot: u8, timing: &TdmaTiming) -> u64 {
    let k = modulo(my_slot as i32 - sender_slot as i32 - 1, N_SLOTS as i32) as u64;
    let mut remaining = k * timing.t_slot_us + timing.slot_offset_us();
    if my_slot <= sender_slot {
        remaining += timing.t_processing_us;
    }
    remaining
}

/// Remaining RX-after window after hearing `sender_slot`: the slots left
/// until the cycle boundary.
pub fn rx_after_remaining_us(sender_slot: u8, timing: &TdmaTiming) -> u64 {
    (N_SLOTS as u64 - sender_slot as u64 - 1) * timing.t_slot_us + timing.slot_offset_us()
}

/// Clamps a receive timeout to `[0, T_SLOT]` before handing it to the
/// radio, so a bogus reconstruction can never park the receiver for more
/// than one slot.
pub fn clamp_rx_timeout_us(remaining_us: i64, timing: &TdmaTiming) -> u64 {
    remaining_us.clamp(0, timing.t_slot_us as i64) as u64
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RxPhase {
    Before,
    After,
}

/// The TDMA event loop.
///
/// Owns the radio device and the node state for the life of the process.
/// `scheduler_enabled` is shared with the control side; this task only
/// reads it at the top of each iteration (and writes it when executing
/// `STOP`/`START` commands itself).
#[cfg_attr(feature = "std", embassy_executor::task(pool_size = MAX_NODE_COUNT))]
#[cfg_attr(feature = "embedded", embassy_executor::task(pool_size = 1))]
pub(crate) async fn tdma_scheduler_task(
    mut radio_device: RadioDevice,
    mut node: NodeState,
    command_queue_receiver: CommandQueueReceiver,
    command_reply_queue_sender: CommandReplyQueueSender,
    status_queue_sender: StatusQueueSender,
    scheduler_enabled: &'static AtomicBool,
) -> ! {
    log!(Level::Info, "[{}] TDMA scheduler task started (slot {})", node.my.id, node.my.slot);
    let mut resume_at: Option<Instant> = None;
    let mut was_running = false;

    loop {
        if !scheduler_enabled.load(Ordering::Relaxed) {
            if was_running {
                node.reset_routing_state();
                was_running = false;
            }
            // Keep the control channel responsive while paused
            while let Ok(command) = command_queue_receiver.try_receive() {
                execute_command(command, &mut node, scheduler_enabled, &mut resume_at, &command_reply_queue_sender);
            }
            Timer::after(Duration::from_millis(PAUSED_POLL_MS)).await;
            continue;
        }

        if let Some(at) = resume_at {
            if Instant::now() < at {
                Timer::after(Duration::from_millis(PAUSED_POLL_MS)).await;
                continue;
            }
            resume_at = None;
            log!(Level::Info, "[{}] scheduler resuming", node.my.id);
        }

        was_running = true;
        run_cycle(
            &mut radio_device,
            &mut node,
            &command_queue_receiver,
            &command_reply_queue_sender,
            &status_queue_sender,
            scheduler_enabled,
            &mut resume_at,
        )
        .await;
    }
}

/// One full TDMA cycle, phases 1 to 4.
async fn run_cycle(
    radio_device: &mut RadioDevice,
    node: &mut NodeState,
    command_queue_receiver: &CommandQueueReceiver,
    command_reply_queue_sender: &CommandReplyQueueSender,
    status_queue_sender: &StatusQueueSender,
    scheduler_enabled: &'static AtomicBool,
    resume_at: &mut Option<Instant>,
) {
    let timing = node.timing;
    let t0 = Instant::now();

    // Phase 1: processing. No radio activity here; the remainder of the
    // phase budget is slept away so the RX window opens on schedule.
    node.begin_cycle();
    while let Ok(command) = command_queue_receiver.try_receive() {
        execute_command(command, node, scheduler_enabled, resume_at, command_reply_queue_sender);
    }
    if !scheduler_enabled.load(Ordering::Relaxed) {
        // A STOP arrived this cycle; abandon it before touching the radio
        return;
    }
    node.maybe_originate();
    node.flush_upstream();
    let _ = status_queue_sender.try_send(node.status_report(true));
    node.telemetry.emit(TelemetryEvent::Status {
        hop: node.my.hop,
        stratum: node.my.sync.stratum.as_bits(),
        neighbours: node.neighbours.len() as u8,
    });
    Timer::at(t0 + Duration::from_micros(timing.t_processing_us)).await;

    // Phase 2: RX-before, nominally one slot per node scheduled ahead of us
    let nominal_us = node.my.slot as u64 * timing.t_slot_us;
    rx_window(radio_device, node, nominal_us, RxPhase::Before).await;

    // Phase 3: TX inside the owned slot, padded to the full slot width
    let slot_start = Instant::now();
    Timer::after(Duration::from_micros(timing.t_tx_delay_us)).await;
    let frame = node.build_tx_frame();
    let sent = radio_device.transmit(frame.as_bytes()).await;
    node.record_tx(sent);
    if !sent {
        log!(Level::Warn, "[{}] frame transmission failed", node.my.id);
    }
    Timer::at(slot_start + Duration::from_micros(timing.t_slot_us)).await;

    // Phase 4: RX-after until the cycle boundary
    let nominal_us = (N_SLOTS as u64 - node.my.slot as u64 - 1) * timing.t_slot_us;
    rx_window(radio_device, node, nominal_us, RxPhase::After).await;

    node.end_cycle();
}

/// One receive window with mid-phase drift correction.
///
/// Deadlines are absolute; each accepted frame replaces the remaining
/// window with the reconstruction for that sender's slot. Individual radio
/// waits are clamped to one slot so the loop revisits the deadline often.
async fn rx_window(radio_device: &mut RadioDevice, node: &mut NodeState, nominal_us: u64, phase: RxPhase) {
    let timing = node.timing;
    let mut deadline = Instant::now() + Duration::from_micros(nominal_us);

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let remaining_us = deadline.saturating_duration_since(now).as_micros() as i64;
        let chunk_deadline = now + Duration::from_micros(clamp_rx_timeout_us(remaining_us, &timing));

        let Some(received) = radio_device.receive_until(chunk_deadline).await else {
            // Chunk timeout; loop back and re-check the phase deadline
            continue;
        };
        let Some(sender_slot) = node.handle_frame(&received.data, received.rssi, received.snr) else {
            continue;
        };
        if sender_slot >= N_SLOTS {
            // Claimed slot outside the schedule; useless for timing
            continue;
        }
        let remaining_us = match phase {
            RxPhase::Before => rx_before_remaining_us(node.my.slot, sender_slot, &timing),
            RxPhase::After => rx_after_remaining_us(sender_slot, &timing),
        };
        deadline = Instant::now() + Duration::from_micros(remaining_us);
    }
}

/// Applies one control command to the node.
fn execute_command(
    command: Command,
    node: &mut NodeState,
    scheduler_enabled: &AtomicBool,
    resume_at: &mut Option<Instant>,
    reply_sender: &CommandReplyQueueSender,
) {
    let reply = match command {
        Command::Stop => {
            scheduler_enabled.store(false, Ordering::Relaxed);
            log!(Level::Info, "[{}] TDMA disabled by command", node.my.id);
            CommandReply::Ack
        }
        Command::Start { delay_ms } => {
            if let Some(delay_ms) = delay_ms {
                *resume_at = Some(Instant::now() + Duration::from_millis(delay_ms as u64));
            }
            scheduler_enabled.store(true, Ordering::Relaxed);
            log!(Level::Info, "[{}] TDMA enabled by command (delay: {:?} ms)", node.my.id, delay_ms);
            CommandReply::Ack
        }
        Command::Status => CommandReply::Status(node.status_report(scheduler_enabled.load(Ordering::Relaxed))),
        Command::Ping => CommandReply::Pong,
        Command::SetSsid(ssid) => {
            node.config.ssid = ssid;
            CommandReply::Ack
        }
        Command::SetPass(password) => {
            node.config.password = password;
            CommandReply::Ack
        }
        Command::SetServer(server_ip) => {
            node.config.server_ip = server_ip;
            CommandReply::Ack
        }
        Command::SetMode(mode) => {
            node.config.debug_mode = mode;
            node.telemetry.set_debug_mode(mode);
            CommandReply::Ack
        }
        Command::Save => CommandReply::SaveAndReboot(node.config),
        Command::Show => CommandReply::Config(node.config),
        Command::ResetConfig => CommandReply::ClearConfigAndReboot,
        Command::Help => CommandReply::Help,
    };
    node.telemetry.emit(TelemetryEvent::CmdExecuted { command: command.code() });
    if reply_sender.try_send(reply).is_err() {
        log!(Level::Warn, "[{}] command reply queue full, reply dropped", node.my.id);
    }
}
