//! Control channel command grammar.
//!
//! The same grammar is spoken over serial and over the UDP command port;
//! the host owns the transport and the line framing, parses each line with
//! [`parse_command`], and queues the resulting [`Command`] for the
//! scheduler, which executes it during the next processing phase and
//! answers through the reply queue. Persisting configuration and rebooting
//! are host actions; the corresponding replies just ask for them.

use crate::config::{ConfigString, RuntimeConfig, MAX_IP_LEN, MAX_PASS_LEN, MAX_SSID_LEN};

/// A parsed control command.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug, PartialEq, Eq))]
pub enum Command {
    /// `STOP` / `TDMA_OFF`: disable the scheduler and clear routing state.
    Stop,
    /// `START [delay_ms]` / `TDMA_ON [delay_ms]`: re-enable, optionally
    /// after a delay.
    Start { delay_ms: Option<u32> },
    /// `STATUS` / `TDMA_STATUS`: snapshot of the node state.
    Status,
    Ping,
    SetSsid(ConfigString<MAX_SSID_LEN>),
    SetPass(ConfigString<MAX_PASS_LEN>),
    SetServer(ConfigString<MAX_IP_LEN>),
    SetMode(u8),
    /// Persist the current configuration and reboot (host action).
    Save,
    /// Print the current configuration.
    Show,
    /// Clear the persisted configuration and reboot (host action).
    ResetConfig,
    Help,
}

impl Command {
    /// Stable numeric code for the `CMD_EXECUTED` telemetry event.
    pub fn code(&self) -> u8 {
        match self {
            Command::Stop => 0,
            Command::Start { .. } => 1,
            Command::Status => 2,
            Command::Ping => 3,
            Command::SetSsid(_) => 4,
            Command::SetPass(_) => 5,
            Command::SetServer(_) => 6,
            Command::SetMode(_) => 7,
            Command::Save => 8,
            Command::Show => 9,
            Command::ResetConfig => 10,
            Command::Help => 11,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum CommandParseError {
    Empty,
    Unknown,
    BadArgument,
}

/// Parses one command line. Keywords are matched case-insensitively;
/// arguments are taken verbatim.
pub fn parse_command(line: &str) -> Result<Command, CommandParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(CommandParseError::Empty);
    }
    let mut parts = line.splitn(2, ' ');
    let keyword = parts.next().unwrap_or("");
    let argument = parts.next().map(str::trim).unwrap_or("");

    let is = |name: &str| keyword.eq_ignore_ascii_case(name);

    if is("STOP") || is("TDMA_OFF") {
        return Ok(Command::Stop);
    }
    if is("START") || is("TDMA_ON") {
        if argument.is_empty() {
            return Ok(Command::Start { delay_ms: None });
        }
        let delay_ms = argument.parse::<u32>().map_err(|_| CommandParseError::BadArgument)?;
        return Ok(Command::Start { delay_ms: Some(delay_ms) });
    }
    if is("STATUS") || is("TDMA_STATUS") {
        return Ok(Command::Status);
    }
    if is("PING") {
        return Ok(Command::Ping);
    }
    if is("SET_SSID") {
        let ssid = ConfigString::from_str(argument).map_err(|_| CommandParseError::BadArgument)?;
        return Ok(Command::SetSsid(ssid));
    }
    if is("SET_PASS") {
        let pass = ConfigString::from_str(argument).map_err(|_| CommandParseError::BadArgument)?;
        return Ok(Command::SetPass(pass));
    }
    if is("SET_SERVER") {
        let ip = ConfigString::from_str(argument).map_err(|_| CommandParseError::BadArgument)?;
        return Ok(Command::SetServer(ip));
    }
    if is("SET_MODE") {
        let mode = argument.parse::<u8>().map_err(|_| CommandParseError::BadArgument)?;
        if mode > 2 {
            return Err(CommandParseError::BadArgument);
        }
        return Ok(Command::SetMode(mode));
    }
    if is("SAVE") {
        return Ok(Command::Save);
    }
    if is("SHOW") {
        return Ok(Command::Show);
    }
    if is("RESET_CONFIG") {
        return Ok(Command::ResetConfig);
    }
    if is("HELP") {
        return Ok(Command::Help);
    }
    Err(CommandParseError::Unknown)
}

/// Snapshot of the node for `STATUS` replies and the UI renderer queue.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct StatusReport {
    pub node_id: u16,
    pub slot: u8,
    pub hop: u8,
    pub cycle: u8,
    pub stratum: u8,
    pub sync_source: u16,
    pub neighbour_count: u8,
    pub bidirectional_count: u8,
    pub forward_queue_len: u8,
    pub cycle_validated: bool,
    pub scheduler_enabled: bool,
    pub tx_frames: u32,
    pub rx_frames: u32,
    pub tx_failures: u32,
    pub rx_rejected: u32,
    pub telemetry_dropped: u32,
    /// Gateway only: `(received, expected)` summed over all origins.
    pub network_totals: (u32, u32),
}

/// Scheduler's answer to one command.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum CommandReply {
    /// Command accepted, nothing else to say.
    Ack,
    Pong,
    Status(StatusReport),
    /// `SHOW`: current configuration for the host to print.
    Config(RuntimeConfig),
    /// `SAVE`: host must persist this record and reboot.
    SaveAndReboot(RuntimeConfig),
    /// `RESET_CONFIG`: host must clear the store and reboot.
    ClearConfigAndReboot,
    Help,
}
