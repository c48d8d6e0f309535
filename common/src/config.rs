use serde::{Deserialize, Serialize};

use crate::{
    cron::CronTable,
    meter::PulseMeterSettings,
    replay::DEFAULT_HALF_WIDTH_SECS,
    safety::{MonitoredQuantity, SafetyState},
    telemetry::DEFAULT_SAMPLE_PERIOD_MS,
};

pub const MAX_SSID_LEN: usize = 31;
pub const MAX_PASSWORD_LEN: usize = 63;
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_IMPULSES_PER_KWH: u32 = 100;

/// Station and broker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub mqtt_keepalive_s: u16,
    #[serde(default)]
    pub mqtt_tls: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            mqtt_keepalive_s: 120,
            mqtt_tls: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseMeterConfig {
    pub serial: String,
    pub base_energy_wh: u64,
    pub impulses_per_kwh: u32,
    /// Pulses counted since `base_energy_wh` was set.
    pub count: u32,
}

impl Default for PulseMeterConfig {
    fn default() -> Self {
        Self {
            serial: String::new(),
            base_energy_wh: 0,
            impulses_per_kwh: DEFAULT_IMPULSES_PER_KWH,
            count: 0,
        }
    }
}

impl PulseMeterConfig {
    pub fn settings(&self) -> PulseMeterSettings {
        PulseMeterSettings {
            serial: self.serial.clone(),
            base_energy_wh: self.base_energy_wh,
            impulses_per_kwh: self.impulses_per_kwh,
        }
    }
}

/// Everything the device keeps across reboots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    pub network: NetworkConfig,
    pub key: String,
    #[serde(default)]
    pub ap_enabled: bool,
    #[serde(default)]
    pub safety: SafetyState,
    #[serde(default)]
    pub cron: CronTable,
    #[serde(default)]
    pub pulse_meter: PulseMeterConfig,
    pub timezone: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            network: NetworkConfig::default(),
            key: String::new(),
            ap_enabled: false,
            safety: SafetyState::default(),
            cron: CronTable::default(),
            pulse_meter: PulseMeterConfig::default(),
            timezone: "Europe/Copenhagen".to_string(),
        }
    }
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        truncate_bytes(&mut self.network.wifi_ssid, MAX_SSID_LEN);
        truncate_bytes(&mut self.network.wifi_pass, MAX_PASSWORD_LEN);
        if self.network.mqtt_port == 0 {
            self.network.mqtt_port = DEFAULT_MQTT_PORT;
        }
        if self.pulse_meter.impulses_per_kwh == 0 {
            self.pulse_meter.impulses_per_kwh = DEFAULT_IMPULSES_PER_KWH;
        }
        self.cron.truncate();
    }

    pub fn set_wifi_ssid(&mut self, ssid: &str) -> bool {
        replace_if_changed(&mut self.network.wifi_ssid, ssid, MAX_SSID_LEN)
    }

    pub fn set_wifi_pass(&mut self, pass: &str) -> bool {
        replace_if_changed(&mut self.network.wifi_pass, pass, MAX_PASSWORD_LEN)
    }

    pub fn set_device_id(&mut self, device_id: &str) -> bool {
        if self.device_id == device_id {
            return false;
        }
        self.device_id = device_id.to_string();
        true
    }

    pub fn set_ap_enabled(&mut self, enabled: bool) -> bool {
        if self.ap_enabled == enabled {
            return false;
        }
        self.ap_enabled = enabled;
        true
    }

    pub fn set_actuator_open(&mut self, open: bool) -> bool {
        if self.safety.actuator_open == open {
            return false;
        }
        self.safety.actuator_open = open;
        true
    }

    pub fn set_close_at(&mut self, threshold: u32) -> bool {
        if self.safety.close_at_threshold == threshold {
            return false;
        }
        self.safety.close_at_threshold = threshold;
        true
    }
}

fn truncate_bytes(value: &mut String, max_len: usize) {
    if value.len() <= max_len {
        return;
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value.truncate(end);
}

fn replace_if_changed(slot: &mut String, value: &str, max_len: usize) -> bool {
    let mut candidate = value.to_string();
    truncate_bytes(&mut candidate, max_len);
    if *slot == candidate {
        return false;
    }
    *slot = candidate;
    true
}

/// Runtime tuning that is not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlaneConfig {
    pub sample_period_ms: u64,
    pub replay_half_width_secs: u32,
    pub deferred_subscribe_ms: u64,
    pub auto_close: bool,
    pub monitored_quantity: MonitoredQuantity,
    pub cron_enabled: bool,
    pub config_ap_prefix: String,
    pub config_ap_password: String,
    pub mesh_ap_prefix: String,
    pub mesh_ap_password: String,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            sample_period_ms: DEFAULT_SAMPLE_PERIOD_MS,
            replay_half_width_secs: DEFAULT_HALF_WIDTH_SECS,
            deferred_subscribe_ms: 60_000,
            auto_close: true,
            monitored_quantity: MonitoredQuantity::Energy,
            cron_enabled: true,
            config_ap_prefix: "MeterBridge-".to_string(),
            config_ap_password: "meterbridge".to_string(),
            mesh_ap_prefix: "MeterBridgeMesh-".to_string(),
            mesh_ap_password: "meterbridgemesh".to_string(),
        }
    }
}

/// Settings submitted through the config-mode web UI. `None` keeps the
/// stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningUpdate {
    #[serde(default)]
    pub wifi_ssid: Option<String>,
    #[serde(default)]
    pub wifi_pass: Option<String>,
    #[serde(default)]
    pub mqtt_host: Option<String>,
    #[serde(default)]
    pub mqtt_port: Option<u16>,
    #[serde(default)]
    pub mqtt_user: Option<String>,
    #[serde(default)]
    pub mqtt_pass: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub pulse_meter_serial: Option<String>,
    #[serde(default)]
    pub pulse_meter_energy_wh: Option<u64>,
    #[serde(default)]
    pub impulses_per_kwh: Option<u32>,
}

impl ProvisioningUpdate {
    /// Applies the update and reports whether anything changed.
    pub fn apply(&self, config: &mut DeviceConfig) -> bool {
        let before = config.clone();

        if let Some(ssid) = &self.wifi_ssid {
            config.set_wifi_ssid(ssid);
        }
        if let Some(pass) = &self.wifi_pass {
            config.set_wifi_pass(pass);
        }
        if let Some(host) = &self.mqtt_host {
            config.network.mqtt_host = host.clone();
        }
        if let Some(port) = self.mqtt_port {
            config.network.mqtt_port = port;
        }
        if let Some(user) = &self.mqtt_user {
            config.network.mqtt_user = user.clone();
        }
        if let Some(pass) = &self.mqtt_pass {
            config.network.mqtt_pass = pass.clone();
        }
        if let Some(key) = &self.key {
            config.key = key.clone();
        }
        if let Some(serial) = &self.pulse_meter_serial {
            config.pulse_meter.serial = serial.clone();
        }
        if let Some(energy_wh) = self.pulse_meter_energy_wh {
            // New base reading restarts the pulse count.
            if config.pulse_meter.base_energy_wh != energy_wh {
                config.pulse_meter.base_energy_wh = energy_wh;
                config.pulse_meter.count = 0;
            }
        }
        if let Some(impulses) = self.impulses_per_kwh {
            config.pulse_meter.impulses_per_kwh = impulses;
        }

        config.sanitize();
        *config != before
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn sanitize_clamps_bounds() {
        let mut config = DeviceConfig::default();
        config.network.wifi_ssid = "s".repeat(40);
        config.network.wifi_pass = "p".repeat(70);
        config.network.mqtt_port = 0;
        config.pulse_meter.impulses_per_kwh = 0;
        config.sanitize();

        assert_eq!(config.network.wifi_ssid.len(), MAX_SSID_LEN);
        assert_eq!(config.network.wifi_pass.len(), MAX_PASSWORD_LEN);
        assert_eq!(config.network.mqtt_port, 1883);
        assert_eq!(config.pulse_meter.impulses_per_kwh, 100);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut value = format!("{}é", "a".repeat(30));
        truncate_bytes(&mut value, MAX_SSID_LEN);
        assert_eq!(value, "a".repeat(30));
    }

    #[test]
    fn setters_report_changes() {
        let mut config = DeviceConfig::default();
        assert!(config.set_wifi_ssid("home"));
        assert!(!config.set_wifi_ssid("home"));
        assert!(config.set_close_at(250));
        assert!(!config.set_close_at(250));
        assert!(config.set_actuator_open(true));
        assert!(!config.set_actuator_open(true));
    }

    #[test]
    fn provisioning_applies_only_changes() {
        let mut config = DeviceConfig::default();
        config.pulse_meter.count = 12;
        let update = ProvisioningUpdate {
            wifi_ssid: Some("home".to_string()),
            pulse_meter_energy_wh: Some(1_000),
            ..ProvisioningUpdate::default()
        };

        assert!(update.apply(&mut config));
        assert_eq!(config.network.wifi_ssid, "home");
        assert_eq!(config.pulse_meter.count, 0);
        assert!(!update.apply(&mut config));
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut config = DeviceConfig::default();
        config.safety.actuator_open = true;
        config
            .cron
            .add_from_query("minute=0&hour=6&day_of_month=*&month=*&day_of_week=*&command=open")
            .unwrap();

        let json = serde_json::to_string(&config).unwrap();
        let restored: DeviceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, config);
    }
}
