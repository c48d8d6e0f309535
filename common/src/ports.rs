//! Interfaces of the collaborators the control plane drives. Implementations
//! live in the runtime crates; tests use in-memory fakes.

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::{config::DeviceConfig, lifecycle::ResetInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport has no live connection")]
    Unavailable,
    #[error("transport rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("config encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub keep_alive_s: u16,
    pub tls: bool,
    pub last_will: LastWill,
}

/// Publish/subscribe session. Reconnects are the implementation's concern.
pub trait Transport {
    fn is_connected(&self) -> bool;
    fn init_session(&mut self, params: SessionParams) -> Result<(), TransportError>;
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;
    fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;
    fn ping(&mut self) -> Result<(), TransportError>;
    fn disconnect(&mut self) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub ssid: String,
    pub bssid: [u8; 6],
    pub rssi: i8,
    pub channel: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String,
    pub password: String,
}

pub trait Wifi {
    fn connect_station(&mut self, ssid: &str, password: &str);
    fn is_station_connected(&self) -> bool;
    fn rssi(&self) -> i32;
    fn access_point_active(&self) -> bool;
    fn start_access_point(&mut self, ap: &AccessPoint);
    fn stop_access_point(&mut self);
    /// Results arrive later through the control plane's scan callbacks.
    fn start_scan(&mut self);
}

/// Local provisioning services: access point, web UI and captive DNS.
pub trait Provisioning {
    fn start(&mut self, ap: &AccessPoint);
    fn stop(&mut self);
}

pub trait Actuator {
    fn open(&mut self);
    fn close(&mut self);
    fn off(&mut self);
    fn pwm(&mut self, duty_percent: u8);
    fn self_test(&mut self);
}

pub trait Platform {
    fn free_heap(&self) -> u32;
    fn supply_millivolts(&self) -> u32;
    fn sdk_version(&self) -> String;
    fn reset_info(&self) -> Option<ResetInfo>;
}

pub trait Clock {
    /// Seconds since the epoch, 0 until time sync has completed.
    fn unix_time(&self) -> u32;
    fn uptime_s(&self) -> u64;
    /// Wall-clock time in the given timezone, `None` until synced.
    fn local_time(&self, timezone: &str) -> Option<NaiveDateTime>;
}

pub trait ConfigStore {
    fn load(&mut self) -> Result<DeviceConfig, StoreError>;
    fn save(&mut self, config: &DeviceConfig) -> Result<(), StoreError>;
}
