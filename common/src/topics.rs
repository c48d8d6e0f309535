use std::fmt;

use serde::{Deserialize, Serialize};

pub const COMMAND_ROOT: &str = "config";
pub const PROTOCOL_VERSION: &str = "v2";
pub const LAST_WILL_VERSION: &str = "v1";

/// Index of the embedded unix timestamp in a split command topic.
pub const COMMAND_TIME_SEGMENT: usize = 3;
pub const MAX_FUNCTION_NAME_LEN: usize = 20;
pub const MAX_SERIAL_LEN: usize = 15;

/// First path segment of every outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Sample,
    Ping,
    Version,
    Uptime,
    Vdd,
    Rssi,
    Ssid,
    WifiStatus,
    ApStatus,
    Mem,
    Crypto,
    ResetReason,
    Cron,
    OpenUntil,
    OpenUntilDelta,
    Status,
    ScanResult,
    Offline,
}

impl Domain {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sample => "sample",
            Self::Ping => "ping",
            Self::Version => "version",
            Self::Uptime => "uptime",
            Self::Vdd => "vdd",
            Self::Rssi => "rssi",
            Self::Ssid => "ssid",
            Self::WifiStatus => "wifi_status",
            Self::ApStatus => "ap_status",
            Self::Mem => "mem",
            Self::Crypto => "crypto",
            Self::ResetReason => "reset_reason",
            Self::Cron => "cron",
            Self::OpenUntil => "open_until",
            Self::OpenUntilDelta => "open_until_delta",
            Self::Status => "status",
            Self::ScanResult => "scan_result",
            Self::Offline => "offline",
        }
    }
}

/// Device serial used as MQTT client id and topic segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Rejects serials that would break the topic grammar.
    pub fn new(serial: impl Into<String>) -> Option<Self> {
        let serial = serial.into();
        let valid = !serial.is_empty()
            && serial.len() <= MAX_SERIAL_LEN
            && serial
                .bytes()
                .all(|byte| byte.is_ascii_graphic() && !matches!(byte, b'/' | b'+' | b'#'));
        valid.then_some(Self(serial))
    }

    /// Serial meters report a numeric serial, rendered zero-padded to 7 digits.
    pub fn from_meter_serial(serial: u32) -> Option<Self> {
        if serial == 0 {
            return None;
        }
        Self::new(format!("{serial:07}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `/{domain}/v2/{serial}/{unix_time}`
pub fn reply_topic(domain: Domain, identity: &DeviceIdentity, unix_time: u32) -> String {
    format!(
        "/{}/{PROTOCOL_VERSION}/{identity}/{unix_time}",
        domain.as_str()
    )
}

/// `/config/v2/{serial}/#`
pub fn command_subscription(identity: &DeviceIdentity) -> String {
    format!("/{COMMAND_ROOT}/{PROTOCOL_VERSION}/{identity}/#")
}

/// `/config/v2/{serial}/{unix_time}/{function}`
pub fn command_topic(identity: &DeviceIdentity, unix_time: u32, function_name: &str) -> String {
    format!("/{COMMAND_ROOT}/{PROTOCOL_VERSION}/{identity}/{unix_time}/{function_name}")
}

/// `/+/v2/{serial}/#`, everything the device publishes.
pub fn reply_subscription(identity: &DeviceIdentity) -> String {
    format!("/+/{PROTOCOL_VERSION}/{identity}/#")
}

/// `/offline/v1/{serial}`
pub fn last_will_topic(identity: &DeviceIdentity) -> String {
    format!(
        "/{}/{LAST_WILL_VERSION}/{identity}",
        Domain::Offline.as_str()
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPath {
    pub function_name: String,
    pub embedded_unix_time: u32,
}

/// Last non-empty segment is the function name; segment 3 carries the
/// timestamp (0 when absent or not numeric).
pub fn parse_command_topic(topic: &str) -> Option<CommandPath> {
    let segments: Vec<&str> = topic.split('/').filter(|s| !s.is_empty()).collect();
    let function_name = segments.last()?;
    if function_name.len() > MAX_FUNCTION_NAME_LEN {
        return None;
    }

    let embedded_unix_time = segments
        .get(COMMAND_TIME_SEGMENT)
        .and_then(|segment| segment.parse::<u32>().ok())
        .unwrap_or(0);

    Some(CommandPath {
        function_name: (*function_name).to_string(),
        embedded_unix_time,
    })
}
