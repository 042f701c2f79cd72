//! Runtime configuration.
//!
//! The persistent store itself is the host's concern (EEPROM on the
//! reference hardware); this module owns the record layout, the validation
//! ranges, and the compiled-in defaults used whenever a stored value is
//! absent or out of range. All strings live in fixed buffers so the record
//! is `Copy` and crosses task queues without allocation.

/// No serial/telemetry output, production mode.
pub const DEBUG_MODE_OFF: u8 = 0;
/// Gateway emits per-frame data log lines for offline analysis.
pub const DEBUG_MODE_GATEWAY_ONLY: u8 = 1;
/// All nodes mirror events to the network collector.
pub const DEBUG_MODE_WIFI_MONITOR: u8 = 2;

/// Admission floor: frames below this are ignored entirely.
pub const DEFAULT_RSSI_MIN: i16 = -115;
/// "Good quality" threshold used as the routing priority class boundary.
pub const DEFAULT_RSSI_GOOD: i16 = -100;
/// SX1262 default TX power; hardware range is −9 to +22 dBm.
pub const DEFAULT_TX_POWER_DBM: i8 = -9;

pub const MAX_SSID_LEN: usize = 32;
pub const MAX_PASS_LEN: usize = 64;
pub const MAX_IP_LEN: usize = 15;

/// Fixed-capacity string for config fields and command arguments.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct ConfigString<const N: usize> {
    bytes: [u8; N],
    len: u8,
}

impl<const N: usize> ConfigString<N> {
    pub const fn empty() -> Self {
        ConfigString { bytes: [0; N], len: 0 }
    }

    /// Copies `value` in, rejecting anything longer than the buffer.
    pub fn from_str(value: &str) -> Result<Self, ()> {
        if value.len() > N {
            return Err(());
        }
        let mut string = Self::empty();
        string.bytes[..value.len()].copy_from_slice(value.as_bytes());
        string.len = value.len() as u8;
        Ok(string)
    }

    pub fn as_str(&self) -> &str {
        // The buffer is only ever filled from &str, so it stays valid UTF-8.
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<const N: usize> PartialEq for ConfigString<N> {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl<const N: usize> Eq for ConfigString<N> {}

/// The persisted node configuration.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct RuntimeConfig {
    pub ssid: ConfigString<MAX_SSID_LEN>,
    pub password: ConfigString<MAX_PASS_LEN>,
    pub server_ip: ConfigString<MAX_IP_LEN>,
    pub debug_mode: u8,
    /// Minimum RSSI to accept a frame at all (dBm).
    pub rssi_min: i16,
    /// RSSI above which a link counts as good for routing (dBm).
    pub rssi_good: i16,
    pub tx_power_dbm: i8,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            ssid: ConfigString::empty(),
            password: ConfigString::empty(),
            server_ip: ConfigString::empty(),
            debug_mode: DEBUG_MODE_OFF,
            rssi_min: DEFAULT_RSSI_MIN,
            rssi_good: DEFAULT_RSSI_GOOD,
            tx_power_dbm: DEFAULT_TX_POWER_DBM,
        }
    }
}

impl RuntimeConfig {
    /// Replaces every out-of-range field with its compiled-in default.
    ///
    /// The ranges match what the hardware tolerates: the RSSI thresholds
    /// must stay inside the radio's plausible reporting band (zero also
    /// counts as "never stored"), TX power inside the SX1262's −9..+22 dBm.
    pub fn sanitized(mut self) -> Self {
        if self.debug_mode > DEBUG_MODE_WIFI_MONITOR {
            self.debug_mode = DEBUG_MODE_OFF;
        }
        if self.rssi_min < -130 || self.rssi_min > -50 || self.rssi_min == 0 {
            self.rssi_min = DEFAULT_RSSI_MIN;
        }
        if self.rssi_good < -120 || self.rssi_good > -40 || self.rssi_good == 0 {
            self.rssi_good = DEFAULT_RSSI_GOOD;
        }
        if self.tx_power_dbm < -9 || self.tx_power_dbm > 22 {
            self.tx_power_dbm = DEFAULT_TX_POWER_DBM;
        }
        self
    }
}

/// LoRa modem operating parameters.
///
/// These are configuration defaults and may be varied per deployment, but
/// the 48-byte packed frame layout is fixed regardless.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct LoraParams {
    pub frequency_hz: u32,
    pub spreading_factor: u8,
    pub bandwidth_khz: u16,
    /// Denominator of the 4/x coding rate.
    pub coding_rate_denominator: u8,
    pub preamble_length: u16,
    pub tx_power_dbm: i8,
    /// Implicit-header mode: both sides know the fixed length.
    pub fixed_length: bool,
    pub crc_on: bool,
    pub invert_iq: bool,
}

impl Default for LoraParams {
    fn default() -> Self {
        LoraParams {
            frequency_hz: 915_000_000,
            spreading_factor: 7,
            bandwidth_khz: 125,
            coding_rate_denominator: 5,
            preamble_length: 8,
            tx_power_dbm: DEFAULT_TX_POWER_DBM,
            fixed_length: true,
            crc_on: true,
            invert_iq: false,
        }
    }
}
