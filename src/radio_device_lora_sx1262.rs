//! SX1262 radio device for RP2040 boards, built on the lora-phy crate.
//!
//! Drives the Semtech SX1262 through lora-phy with the mesh operating
//! parameters: implicit-header (fixed 48-byte) frames, hardware CRC,
//! non-inverted IQ. `transmit` blocks until the TX-done interrupt, which is
//! what the TDMA slot padding relies on; `receive_until` keeps the radio in
//! continuous RX and races the radio against the phase deadline.

use crate::config::LoraParams;
use crate::{ReceivedFrame, FIXED_FRAME_LENGTH};

use embassy_futures::select::{select, Either};
use embassy_rp::gpio::AnyPin;
use embassy_rp::gpio::{Input, Level, Output, Pull};
use embassy_rp::spi::{Config, Spi};
use embassy_rp::Peri;
use embassy_time::Delay;
use embassy_time::{Instant, Timer};
use embedded_hal_bus::spi::ExclusiveDevice;
use lora_phy::iv::GenericSx126xInterfaceVariant;
use lora_phy::sx126x::TcxoCtrlVoltage;
use lora_phy::sx126x::{Sx1262, Sx126x};
use lora_phy::LoRa;
use lora_phy::{mod_params::*, sx126x};

/// Radio device initialization errors.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum RadioDeviceInitError {
    /// Failed to create the SX126x interface variant
    InterfaceError,
    /// Failed to initialize the LoRa PHY layer
    LoraError,
    /// Failed to create modulation parameters
    ModulationParamsError,
    /// Failed to create TX packet parameters
    TxPacketParamsError,
    /// Failed to create RX packet parameters
    RxPacketParamsError,
    /// Operating parameters outside what the modem supports
    UnsupportedParams,
}

enum RadioDeviceState {
    NotInited,
    Inited {
        /// Optional transmit enable pin for PA control
        transmit_enable: Option<Output<'static>>,
        lora: LoRa<
            Sx126x<
                ExclusiveDevice<Spi<'static, embassy_rp::peripherals::SPI1, embassy_rp::spi::Async>, Output<'static>, Delay>,
                GenericSx126xInterfaceVariant<Output<'static>, Input<'static>>,
                Sx1262,
            >,
            Delay,
        >,
        mdltn_params: ModulationParams,
        tx_pkt_params: PacketParams,
        rx_pkt_params: PacketParams,
        tx_power_dbm: i8,
    },
}

fn spreading_factor_of(params: &LoraParams) -> Result<SpreadingFactor, RadioDeviceInitError> {
    match params.spreading_factor {
        5 => Ok(SpreadingFactor::_5),
        6 => Ok(SpreadingFactor::_6),
        7 => Ok(SpreadingFactor::_7),
        8 => Ok(SpreadingFactor::_8),
        9 => Ok(SpreadingFactor::_9),
        10 => Ok(SpreadingFactor::_10),
        11 => Ok(SpreadingFactor::_11),
        12 => Ok(SpreadingFactor::_12),
        _ => Err(RadioDeviceInitError::UnsupportedParams),
    }
}

fn bandwidth_of(params: &LoraParams) -> Result<Bandwidth, RadioDeviceInitError> {
    match params.bandwidth_khz {
        125 => Ok(Bandwidth::_125KHz),
        250 => Ok(Bandwidth::_250KHz),
        500 => Ok(Bandwidth::_500KHz),
        _ => Err(RadioDeviceInitError::UnsupportedParams),
    }
}

fn coding_rate_of(params: &LoraParams) -> Result<CodingRate, RadioDeviceInitError> {
    match params.coding_rate_denominator {
        5 => Ok(CodingRate::_4_5),
        6 => Ok(CodingRate::_4_6),
        7 => Ok(CodingRate::_4_7),
        8 => Ok(CodingRate::_4_8),
        _ => Err(RadioDeviceInitError::UnsupportedParams),
    }
}

/// SX1262 radio behind the fixed-length mesh framing.
pub struct RadioDevice {
    state: RadioDeviceState,
    receive_buffer: [u8; FIXED_FRAME_LENGTH],
}

impl RadioDevice {
    pub const fn new() -> Self {
        RadioDevice {
            state: RadioDeviceState::NotInited,
            receive_buffer: [0u8; FIXED_FRAME_LENGTH],
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, RadioDeviceState::Inited { .. })
    }

    /// Configures the SPI bus, control pins and the LoRa PHY.
    ///
    /// A failure here is the only fatal error in the system: the caller is
    /// expected to halt and signal through the local UI.
    #[allow(clippy::too_many_arguments)]
    pub async fn initialize(
        &mut self,
        spi_nss_pin: Peri<'static, AnyPin>,
        reset_pin: Peri<'static, AnyPin>,
        dio1_pin: Peri<'static, AnyPin>,
        busy_pin: Peri<'static, AnyPin>,
        transmit_pin_option: Option<Peri<'static, AnyPin>>,
        spi: Peri<'static, embassy_rp::peripherals::SPI1>,
        clk_pin: Peri<'static, impl embassy_rp::spi::ClkPin<embassy_rp::peripherals::SPI1>>,
        mosi_pin: Peri<'static, impl embassy_rp::spi::MosiPin<embassy_rp::peripherals::SPI1>>,
        miso_pin: Peri<'static, impl embassy_rp::spi::MisoPin<embassy_rp::peripherals::SPI1>>,
        tx_dma: Peri<'static, embassy_rp::dma::AnyChannel>,
        rx_dma: Peri<'static, embassy_rp::dma::AnyChannel>,
        tcxo_ctrl: Option<TcxoCtrlVoltage>,
        params: LoraParams,
        own_node_id: u16,
    ) -> Result<(), RadioDeviceInitError> {
        let spreading_factor = spreading_factor_of(&params)?;
        let bandwidth = bandwidth_of(&params)?;
        let coding_rate = coding_rate_of(&params)?;

        let spi_nss = Output::new(spi_nss_pin, Level::High);
        let reset = Output::new(reset_pin, Level::High);
        let dio1 = Input::new(dio1_pin, Pull::None);
        let busy = Input::new(busy_pin, Pull::None);
        let transmit_enable = transmit_pin_option.map(|transmit_pin| Output::new(transmit_pin, Level::High));

        log::trace!("[{}] initializing spi device", own_node_id);
        let spi = Spi::new(spi, clk_pin, mosi_pin, miso_pin, tx_dma, rx_dma, Config::default());
        let spi_device = match ExclusiveDevice::new(spi, spi_nss, Delay) {
            Ok(device) => device,
            Err(_err) => {
                return Err(RadioDeviceInitError::InterfaceError);
            }
        };

        let config = sx126x::Config {
            chip: Sx1262,
            tcxo_ctrl,
            use_dcdc: true,
            rx_boost: true,
        };

        log::trace!("[{}] initializing interface variant", own_node_id);
        let iv = match GenericSx126xInterfaceVariant::new(reset, dio1, busy, None, None) {
            Ok(interface) => interface,
            Err(_err) => {
                return Err(RadioDeviceInitError::InterfaceError);
            }
        };

        log::trace!("[{}] initializing lora instance", own_node_id);
        let mut lora = match LoRa::new(Sx126x::new(spi_device, iv, config), false, Delay).await {
            Ok(lora_instance) => lora_instance,
            Err(_err) => {
                return Err(RadioDeviceInitError::LoraError);
            }
        };

        let mdltn_params = match lora.create_modulation_params(spreading_factor, bandwidth, coding_rate, params.frequency_hz) {
            Ok(mp) => mp,
            Err(_err) => {
                return Err(RadioDeviceInitError::ModulationParamsError);
            }
        };

        // Implicit header: both sides know the fixed 48-byte length
        let implicit_header = params.fixed_length;
        let tx_pkt_params = match lora.create_tx_packet_params(params.preamble_length, implicit_header, params.crc_on, params.invert_iq, &mdltn_params) {
            Ok(pp) => pp,
            Err(_err) => {
                return Err(RadioDeviceInitError::TxPacketParamsError);
            }
        };

        let rx_pkt_params = match lora.create_rx_packet_params(
            params.preamble_length,
            implicit_header,
            FIXED_FRAME_LENGTH as u8,
            params.crc_on,
            params.invert_iq,
            &mdltn_params,
        ) {
            Ok(pp) => pp,
            Err(_err) => {
                return Err(RadioDeviceInitError::RxPacketParamsError);
            }
        };

        self.state = RadioDeviceState::Inited {
            transmit_enable,
            lora,
            mdltn_params,
            tx_pkt_params,
            rx_pkt_params,
            tx_power_dbm: params.tx_power_dbm,
        };
        log::debug!("[{}] radio device initialized", own_node_id);
        Ok(())
    }

    /// Transmits one fixed-length frame, blocking until the radio reports
    /// TX-done. Returns false on any failure; the scheduler counts it and
    /// moves on without retrying inside the slot.
    pub async fn transmit(&mut self, data: &[u8; FIXED_FRAME_LENGTH]) -> bool {
        match &mut self.state {
            RadioDeviceState::NotInited => false,
            RadioDeviceState::Inited {
                transmit_enable,
                lora,
                mdltn_params,
                tx_pkt_params,
                tx_power_dbm,
                ..
            } => {
                if let Some(te) = transmit_enable.as_mut() {
                    te.set_low();
                }
                if lora.prepare_for_tx(mdltn_params, tx_pkt_params, *tx_power_dbm as i32, data).await.is_err() {
                    if let Some(te) = transmit_enable.as_mut() {
                        te.set_high();
                    }
                    return false;
                }
                let sent = lora.tx().await.is_ok();
                if let Some(te) = transmit_enable.as_mut() {
                    te.set_high();
                }
                sent
            }
        }
    }

    /// Listens until a frame arrives or the deadline passes.
    ///
    /// Wrong-length receptions (possible when a foreign transmitter shares
    /// the channel) are dropped in place and listening continues.
    pub async fn receive_until(&mut self, deadline: Instant) -> Option<ReceivedFrame> {
        loop {
            if Instant::now() >= deadline {
                return None;
            }
            match &mut self.state {
                RadioDeviceState::NotInited => {
                    Timer::at(deadline).await;
                    return None;
                }
                RadioDeviceState::Inited {
                    lora,
                    mdltn_params,
                    rx_pkt_params,
                    ..
                } => {
                    if lora.prepare_for_rx(RxMode::Continuous, mdltn_params, rx_pkt_params).await.is_err() {
                        Timer::at(deadline).await;
                        return None;
                    }
                    match select(lora.rx(rx_pkt_params, &mut self.receive_buffer), Timer::at(deadline)).await {
                        Either::First(Ok((rx_len, packet_status))) => {
                            if rx_len as usize != FIXED_FRAME_LENGTH {
                                log::debug!("dropping frame with unexpected length {}", rx_len);
                                continue;
                            }
                            return Some(ReceivedFrame {
                                data: self.receive_buffer,
                                rssi: packet_status.rssi,
                                snr: packet_status.snr as i8,
                            });
                        }
                        Either::First(Err(_err)) => {
                            log::debug!("receive error from radio, retrying until deadline");
                            continue;
                        }
                        Either::Second(()) => {
                            return None;
                        }
                    }
                }
            }
        }
    }
}

impl Default for RadioDevice {
    fn default() -> Self {
        Self::new()
    }
}
