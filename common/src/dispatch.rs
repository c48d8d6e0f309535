//! Remote procedure table for inbound commands.

use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    control::{ControlError, ControlPlaneContext},
    format::{escape_ssid, format_bssid, parse_leading_int, FixedPoint, QueryBody},
    lifecycle::describe_reset,
    ports::ScanResult,
    topics::Domain,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    Version,
    Uptime,
    Vdd,
    Rssi,
    Ssid,
    Scan,
    SetSsid,
    SetPwd,
    Reconnect,
    WifiStatus,
    ApStatus,
    StartAp,
    StopAp,
    Mem,
    Crypto,
    ResetReason,
    SetCron,
    ClearCron,
    Cron,
    Open,
    OpenUntil,
    OpenUntilDelta,
    Close,
    Status,
    Off,
    Pwm,
    Test,
}

impl Command {
    pub fn from_name(name: &str) -> Option<Self> {
        let command = match name {
            "ping" => Self::Ping,
            "version" => Self::Version,
            "uptime" => Self::Uptime,
            "vdd" => Self::Vdd,
            "rssi" => Self::Rssi,
            "ssid" => Self::Ssid,
            "scan" => Self::Scan,
            "set_ssid" => Self::SetSsid,
            "set_pwd" => Self::SetPwd,
            "reconnect" => Self::Reconnect,
            "wifi_status" => Self::WifiStatus,
            "ap_status" => Self::ApStatus,
            "start_ap" => Self::StartAp,
            "stop_ap" => Self::StopAp,
            "mem" => Self::Mem,
            "crypto" => Self::Crypto,
            "reset_reason" => Self::ResetReason,
            "set_cron" => Self::SetCron,
            "clear_cron" => Self::ClearCron,
            "cron" => Self::Cron,
            "open" => Self::Open,
            "open_until" => Self::OpenUntil,
            "open_until_delta" => Self::OpenUntilDelta,
            "close" => Self::Close,
            "status" => Self::Status,
            "off" => Self::Off,
            "pwm" => Self::Pwm,
            "test" => Self::Test,
            _ => return None,
        };
        Some(command)
    }

    /// Commands that mutate persisted state or move the actuator.
    pub fn requires_fresh(self) -> bool {
        matches!(
            self,
            Self::Scan
                | Self::SetSsid
                | Self::SetPwd
                | Self::Reconnect
                | Self::StartAp
                | Self::StopAp
                | Self::SetCron
                | Self::ClearCron
                | Self::Open
                | Self::OpenUntil
                | Self::OpenUntilDelta
                | Self::Close
                | Self::Off
                | Self::Pwm
                | Self::Test
        )
    }

    pub fn needs_actuator(self) -> bool {
        matches!(
            self,
            Self::SetCron
                | Self::ClearCron
                | Self::Cron
                | Self::Open
                | Self::OpenUntil
                | Self::OpenUntilDelta
                | Self::Close
                | Self::Status
                | Self::Off
                | Self::Pwm
                | Self::Test
        )
    }

    fn needs_cron(self) -> bool {
        matches!(self, Self::SetCron | Self::ClearCron | Self::Cron)
    }
}

/// Cleartext reply, sealed and published by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub domain: Domain,
    pub body: String,
}

impl Reply {
    pub fn new(domain: Domain, body: impl Into<String>) -> Self {
        Self {
            domain,
            body: body.into(),
        }
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        self.body.zeroize();
    }
}

impl ZeroizeOnDrop for Reply {}

/// Looks up `function_name`, applies the replay guard when the command needs
/// it and runs the handler.
pub fn dispatch(
    ctx: &mut ControlPlaneContext,
    function_name: &str,
    body: &str,
    embedded_unix_time: u32,
) -> Result<Vec<Reply>, ControlError> {
    let command = Command::from_name(function_name)
        .filter(|command| is_supported(ctx, *command))
        .ok_or_else(|| ControlError::UnknownFunction(function_name.to_string()))?;

    if command.requires_fresh() {
        let now = ctx.unix_time();
        if !ctx.replay_window().is_fresh(embedded_unix_time, now) {
            return Err(ControlError::ReplayRejected {
                embedded: embedded_unix_time,
                now,
            });
        }
    }

    handle(ctx, command, body)
}

fn is_supported(ctx: &ControlPlaneContext, command: Command) -> bool {
    if command.needs_actuator() && !ctx.has_actuator() {
        return false;
    }
    if command.needs_cron() && !ctx.settings.cron_enabled {
        return false;
    }
    true
}

fn handle(
    ctx: &mut ControlPlaneContext,
    command: Command,
    body: &str,
) -> Result<Vec<Reply>, ControlError> {
    let reply = match command {
        Command::Ping => Reply::new(Domain::Ping, ""),
        Command::Version => Reply::new(Domain::Version, ctx.version_string()),
        Command::Crypto => Reply::new(Domain::Crypto, ctx.version_string()),
        Command::Uptime => Reply::new(Domain::Uptime, ctx.peripherals.clock.uptime_s().to_string()),
        Command::Vdd => Reply::new(
            Domain::Vdd,
            FixedPoint::milli(u64::from(ctx.peripherals.platform.supply_millivolts())).to_string(),
        ),
        Command::Rssi => Reply::new(Domain::Rssi, ctx.peripherals.wifi.rssi().to_string()),
        Command::Ssid => Reply::new(Domain::Ssid, ctx.config.network.wifi_ssid.clone()),
        Command::WifiStatus => Reply::new(
            Domain::WifiStatus,
            if ctx.peripherals.wifi.is_station_connected() {
                "connected"
            } else {
                "disconnected"
            },
        ),
        Command::ApStatus => Reply::new(
            Domain::ApStatus,
            if ctx.peripherals.wifi.access_point_active() {
                "started"
            } else {
                "stopped"
            },
        ),
        Command::Mem => Reply::new(
            Domain::Mem,
            QueryBody::new()
                .field("heap", ctx.peripherals.platform.free_heap())
                .terminated()
                .to_string(),
        ),
        Command::ResetReason => Reply::new(
            Domain::ResetReason,
            describe_reset(ctx.peripherals.platform.reset_info().as_ref()),
        ),
        Command::Cron => Reply::new(Domain::Cron, ctx.config.cron.len().to_string()),
        Command::Status => ctx.status_reply(),
        Command::Scan => {
            ctx.scan_pending = true;
            ctx.peripherals.wifi.start_scan();
            return Ok(Vec::new());
        }
        Command::SetSsid => {
            if ctx.config.set_wifi_ssid(body) {
                ctx.persist()?;
            }
            return Ok(Vec::new());
        }
        Command::SetPwd => {
            if ctx.config.set_wifi_pass(body) {
                ctx.persist()?;
            }
            return Ok(Vec::new());
        }
        Command::Reconnect => {
            info!("reconnect requested");
            if let Err(err) = ctx.peripherals.transport.disconnect() {
                debug!("disconnect failed: {err}");
            }
            return Ok(Vec::new());
        }
        Command::StartAp => {
            if !ctx.peripherals.wifi.access_point_active() {
                let ap = ctx.mesh_access_point();
                ctx.peripherals.wifi.start_access_point(&ap);
                if ctx.config.set_ap_enabled(true) {
                    ctx.persist()?;
                }
            }
            return Ok(Vec::new());
        }
        Command::StopAp => {
            if ctx.peripherals.wifi.access_point_active() {
                ctx.peripherals.wifi.stop_access_point();
                if ctx.config.set_ap_enabled(false) {
                    ctx.persist()?;
                }
            }
            return Ok(Vec::new());
        }
        Command::SetCron => {
            match ctx.config.cron.add_from_query(body) {
                Ok(()) => ctx.persist()?,
                Err(err) => debug!("set_cron ignored: {err}"),
            }
            return Ok(Vec::new());
        }
        Command::ClearCron => {
            if ctx.config.cron.clear() {
                ctx.persist()?;
            }
            return Ok(Vec::new());
        }
        Command::Open => {
            ctx.open_actuator()?;
            return Ok(Vec::new());
        }
        Command::Close => {
            ctx.close_actuator()?;
            return Ok(Vec::new());
        }
        Command::Off => {
            ctx.actuator_off()?;
            return Ok(Vec::new());
        }
        Command::Pwm => {
            let duty = parse_leading_int(body).clamp(0, 100) as u8;
            ctx.peripherals.actuator.pwm(duty);
            return Ok(Vec::new());
        }
        Command::Test => {
            ctx.peripherals.actuator.self_test();
            return Ok(Vec::new());
        }
        Command::OpenUntil => return open_until(ctx, body),
        Command::OpenUntilDelta => return open_until_delta(ctx, body),
    };
    Ok(vec![reply])
}

fn clamp_threshold(value: i64) -> u32 {
    value.clamp(0, i64::from(u32::MAX)) as u32
}

fn open_until(ctx: &mut ControlPlaneContext, body: &str) -> Result<Vec<Reply>, ControlError> {
    ctx.open_actuator()?;
    if ctx.config.set_close_at(clamp_threshold(parse_leading_int(body))) {
        ctx.persist()?;
    }

    Ok(vec![
        Reply::new(
            Domain::OpenUntil,
            ctx.config.safety.close_at_threshold.to_string(),
        ),
        ctx.status_reply(),
    ])
}

fn open_until_delta(ctx: &mut ControlPlaneContext, body: &str) -> Result<Vec<Reply>, ControlError> {
    ctx.open_actuator()?;
    let current = ctx.monitored_reading() as i64;
    let delta = parse_leading_int(body);
    if ctx
        .config
        .set_close_at(clamp_threshold(current.saturating_add(delta)))
    {
        ctx.persist()?;
    }

    let remaining = i64::from(ctx.config.safety.close_at_threshold) - current;
    Ok(vec![
        Reply::new(Domain::OpenUntilDelta, remaining.to_string()),
        ctx.status_reply(),
    ])
}

/// Body of one `scan_result` message.
pub fn scan_result_body(result: &ScanResult) -> String {
    QueryBody::new()
        .field("ssid", escape_ssid(&result.ssid))
        .field("bssid", format_bssid(&result.bssid))
        .field("rssi", result.rssi)
        .field("channel", result.channel)
        .to_string()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn wiped_on_drop<T: ZeroizeOnDrop>() {}

    #[test]
    fn looks_up_every_command_name() {
        for name in [
            "ping",
            "version",
            "uptime",
            "vdd",
            "rssi",
            "ssid",
            "scan",
            "set_ssid",
            "set_pwd",
            "reconnect",
            "wifi_status",
            "ap_status",
            "start_ap",
            "stop_ap",
            "mem",
            "crypto",
            "reset_reason",
            "set_cron",
            "clear_cron",
            "cron",
            "open",
            "open_until",
            "open_until_delta",
            "close",
            "status",
            "off",
            "pwm",
            "test",
        ] {
            assert!(Command::from_name(name).is_some(), "{name}");
        }
        assert_eq!(Command::from_name("reboot"), None);
        assert_eq!(Command::from_name("Ping"), None);
    }

    #[test]
    fn reply_bodies_are_wiped_on_drop() {
        wiped_on_drop::<Reply>();
    }

    #[test]
    fn queries_are_exempt_from_replay_guard() {
        for command in [
            Command::Ping,
            Command::Version,
            Command::Status,
            Command::Cron,
            Command::ResetReason,
        ] {
            assert!(!command.requires_fresh(), "{command:?}");
        }
        for command in [Command::Open, Command::SetSsid, Command::Off, Command::Pwm] {
            assert!(command.requires_fresh(), "{command:?}");
        }
    }

    #[test]
    fn scan_result_escapes_ssid() {
        let body = scan_result_body(&ScanResult {
            ssid: "cafe&bar".to_string(),
            bssid: [0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e],
            rssi: -67,
            channel: 11,
        });
        assert_eq!(
            body,
            "ssid=cafe%26bar&bssid=00:1a:2b:3c:4d:5e&rssi=-67&channel=11"
        );
    }
}
