//! Loopback radio device.
//!
//! The simplest device: every transmitted frame is handed straight back to
//! the receive side with a perfect signal reading. No air time, no
//! topology, no losses. Useful for smoke-testing the codec and the frame
//! handling path on a single node without a network simulator or hardware.

use crate::{ReceivedFrame, FIXED_FRAME_LENGTH};
use embassy_time::{Instant, Timer};
use log::{log, Level};

/// Frames held between transmit and receive.
const ECHO_BUFFER_SIZE: usize = 4;

/// Signal metrics reported for echoed frames: as strong and clean as the
/// radio could ever report.
const ECHO_RSSI_DBM: i16 = -50;
const ECHO_SNR_DB: i8 = 10;

/// Loopback radio.
pub struct RadioDevice {
    buffer: [Option<[u8; FIXED_FRAME_LENGTH]>; ECHO_BUFFER_SIZE],
    head: usize,
    len: usize,
}

impl Default for RadioDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioDevice {
    pub const fn new() -> Self {
        RadioDevice {
            buffer: [None; ECHO_BUFFER_SIZE],
            head: 0,
            len: 0,
        }
    }

    /// "Transmits" a frame by queueing it for loopback reception. The
    /// oldest pending frame is dropped when the buffer is full.
    pub async fn transmit(&mut self, data: &[u8; FIXED_FRAME_LENGTH]) -> bool {
        if self.len == ECHO_BUFFER_SIZE {
            self.buffer[self.head] = None;
            self.head = (self.head + 1) % ECHO_BUFFER_SIZE;
            self.len -= 1;
            log!(Level::Warn, "echo buffer full, dropping oldest frame");
        }
        let tail = (self.head + self.len) % ECHO_BUFFER_SIZE;
        self.buffer[tail] = Some(*data);
        self.len += 1;
        true
    }

    /// Returns the next echoed frame immediately, or sleeps until the
    /// deadline and yields nothing.
    pub async fn receive_until(&mut self, deadline: Instant) -> Option<ReceivedFrame> {
        if self.len > 0 {
            let data = self.buffer[self.head].take()?;
            self.head = (self.head + 1) % ECHO_BUFFER_SIZE;
            self.len -= 1;
            return Some(ReceivedFrame {
                data,
                rssi: ECHO_RSSI_DBM,
                snr: ECHO_SNR_DB,
            });
        }
        Timer::at(deadline).await;
        None
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn echoes_in_order() {
        block_on(async {
            let mut radio = RadioDevice::new();
            assert!(radio.transmit(&[1u8; FIXED_FRAME_LENGTH]).await);
            assert!(radio.transmit(&[2u8; FIXED_FRAME_LENGTH]).await);

            let deadline = Instant::now();
            let first = radio.receive_until(deadline).await.unwrap();
            assert_eq!(first.data[0], 1);
            assert_eq!(first.rssi, ECHO_RSSI_DBM);
            let second = radio.receive_until(deadline).await.unwrap();
            assert_eq!(second.data[0], 2);
        });
    }

    #[test]
    fn empty_buffer_times_out() {
        block_on(async {
            let mut radio = RadioDevice::new();
            // Deadline already passed: returns immediately with nothing
            assert!(radio.receive_until(Instant::now()).await.is_none());
        });
    }

    #[test]
    fn overflow_drops_oldest() {
        block_on(async {
            let mut radio = RadioDevice::new();
            for value in 0..(ECHO_BUFFER_SIZE + 1) as u8 {
                radio.transmit(&[value; FIXED_FRAME_LENGTH]).await;
            }
            let first = radio.receive_until(Instant::now()).await.unwrap();
            assert_eq!(first.data[0], 1, "oldest frame was dropped");
        });
    }
}
