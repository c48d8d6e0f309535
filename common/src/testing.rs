//! Recording fakes for every collaborator, shared through one `Rc` so tests
//! can inspect and steer them after the control plane owns the boxes.

use std::{cell::RefCell, collections::VecDeque, io, rc::Rc};

use chrono::NaiveDateTime;

use crate::{
    config::{ControlPlaneConfig, DeviceConfig},
    control::{ControlPlane, Peripherals},
    envelope::EnvelopeCodec,
    lifecycle::{LifecycleState, ResetCause, ResetInfo},
    meter::{MeterDialect, MeterEvent, MeterReading, MeterSource},
    ports::{
        AccessPoint, Actuator, Clock, ConfigStore, Platform, Provisioning, QoS, SessionParams,
        StoreError, Transport, TransportError, Wifi,
    },
    topics::DeviceIdentity,
};

pub const TEST_NOW: u32 = 1_700_000_000;
const TEST_KEY: &str = "correct horse battery staple";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorCall {
    Open,
    Close,
    Off,
    Pwm(u8),
    SelfTest,
}

#[derive(Debug, Clone)]
struct Published {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
}

struct World {
    connected: bool,
    session: Option<SessionParams>,
    subscriptions: Vec<(String, QoS)>,
    published: Vec<Published>,
    pings: usize,
    disconnects: usize,

    station_connects: usize,
    mesh_ap: Option<AccessPoint>,
    scans: usize,

    provisioning_started: Vec<String>,
    provisioning_stopped: bool,

    actuator_calls: Vec<ActuatorCall>,

    reset: Option<ResetInfo>,
    unix_time: u32,
    local_time: Option<NaiveDateTime>,

    stored: DeviceConfig,
    saved: Vec<DeviceConfig>,
    fail_saves: bool,

    serial: Option<DeviceIdentity>,
    meter_events: VecDeque<MeterEvent>,
    reading: Option<MeterReading>,
    last_pulse_ms: Option<u64>,
    meter_requests: usize,
}

type Shared = Rc<RefCell<World>>;

struct FakeTransport(Shared);

impl Transport for FakeTransport {
    fn is_connected(&self) -> bool {
        self.0.borrow().connected
    }

    fn init_session(&mut self, params: SessionParams) -> Result<(), TransportError> {
        self.0.borrow_mut().session = Some(params);
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.0
            .borrow_mut()
            .subscriptions
            .push((topic.to_string(), qos));
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        _retain: bool,
    ) -> Result<(), TransportError> {
        self.0.borrow_mut().published.push(Published {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }

    fn ping(&mut self) -> Result<(), TransportError> {
        self.0.borrow_mut().pings += 1;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.0.borrow_mut().disconnects += 1;
        Ok(())
    }
}

struct FakeWifi(Shared);

impl Wifi for FakeWifi {
    fn connect_station(&mut self, _ssid: &str, _password: &str) {
        self.0.borrow_mut().station_connects += 1;
    }

    fn is_station_connected(&self) -> bool {
        true
    }

    fn rssi(&self) -> i32 {
        -61
    }

    fn access_point_active(&self) -> bool {
        self.0.borrow().mesh_ap.is_some()
    }

    fn start_access_point(&mut self, ap: &AccessPoint) {
        self.0.borrow_mut().mesh_ap = Some(ap.clone());
    }

    fn stop_access_point(&mut self) {
        self.0.borrow_mut().mesh_ap = None;
    }

    fn start_scan(&mut self) {
        self.0.borrow_mut().scans += 1;
    }
}

struct FakeProvisioning(Shared);

impl Provisioning for FakeProvisioning {
    fn start(&mut self, ap: &AccessPoint) {
        self.0
            .borrow_mut()
            .provisioning_started
            .push(ap.ssid.clone());
    }

    fn stop(&mut self) {
        self.0.borrow_mut().provisioning_stopped = true;
    }
}

struct FakeActuator(Shared);

impl FakeActuator {
    fn record(&self, call: ActuatorCall) {
        self.0.borrow_mut().actuator_calls.push(call);
    }
}

impl Actuator for FakeActuator {
    fn open(&mut self) {
        self.record(ActuatorCall::Open);
    }

    fn close(&mut self) {
        self.record(ActuatorCall::Close);
    }

    fn off(&mut self) {
        self.record(ActuatorCall::Off);
    }

    fn pwm(&mut self, duty_percent: u8) {
        self.record(ActuatorCall::Pwm(duty_percent));
    }

    fn self_test(&mut self) {
        self.record(ActuatorCall::SelfTest);
    }
}

struct FakePlatform(Shared);

impl Platform for FakePlatform {
    fn free_heap(&self) -> u32 {
        20_000
    }

    fn supply_millivolts(&self) -> u32 {
        3_312
    }

    fn sdk_version(&self) -> String {
        "sdk-test".to_string()
    }

    fn reset_info(&self) -> Option<ResetInfo> {
        self.0.borrow().reset
    }
}

struct FakeClock(Shared);

impl Clock for FakeClock {
    fn unix_time(&self) -> u32 {
        self.0.borrow().unix_time
    }

    fn uptime_s(&self) -> u64 {
        42
    }

    fn local_time(&self, _timezone: &str) -> Option<NaiveDateTime> {
        self.0.borrow().local_time
    }
}

struct FakeStore(Shared);

impl ConfigStore for FakeStore {
    fn load(&mut self) -> Result<DeviceConfig, StoreError> {
        Ok(self.0.borrow().stored.clone())
    }

    fn save(&mut self, config: &DeviceConfig) -> Result<(), StoreError> {
        let mut world = self.0.borrow_mut();
        if world.fail_saves {
            return Err(StoreError::Io(io::Error::other("flash write failed")));
        }
        world.stored = config.clone();
        world.saved.push(config.clone());
        Ok(())
    }
}

struct FakeMeter {
    dialect: MeterDialect,
    world: Shared,
}

impl MeterSource for FakeMeter {
    fn dialect(&self) -> MeterDialect {
        self.dialect
    }

    fn received_serial(&self) -> Option<DeviceIdentity> {
        self.world.borrow().serial.clone()
    }

    fn latest_reading(&self) -> Option<MeterReading> {
        self.world.borrow().reading
    }

    fn request_sample(&mut self, _now_ms: u64) {
        self.world.borrow_mut().meter_requests += 1;
    }

    fn poll(&mut self, _now_ms: u64) -> Vec<MeterEvent> {
        self.world.borrow_mut().meter_events.drain(..).collect()
    }

    fn last_pulse_ms(&self) -> Option<u64> {
        self.world.borrow().last_pulse_ms
    }
}

/// Builds control planes wired to the fakes and exposes what they recorded.
pub struct Harness {
    dialect: MeterDialect,
    world: Shared,
    initial: RefCell<DeviceConfig>,
    settings: RefCell<ControlPlaneConfig>,
}

impl Harness {
    pub fn new(dialect: MeterDialect) -> Self {
        let config = DeviceConfig {
            key: TEST_KEY.to_string(),
            ..DeviceConfig::default()
        };
        let world = World {
            connected: true,
            session: None,
            subscriptions: Vec::new(),
            published: Vec::new(),
            pings: 0,
            disconnects: 0,
            station_connects: 0,
            mesh_ap: None,
            scans: 0,
            provisioning_started: Vec::new(),
            provisioning_stopped: false,
            actuator_calls: Vec::new(),
            reset: None,
            unix_time: TEST_NOW,
            local_time: None,
            stored: config.clone(),
            saved: Vec::new(),
            fail_saves: false,
            serial: None,
            meter_events: VecDeque::new(),
            reading: None,
            last_pulse_ms: None,
            meter_requests: 0,
        };
        Self {
            dialect,
            world: Rc::new(RefCell::new(world)),
            initial: RefCell::new(config),
            settings: RefCell::new(ControlPlaneConfig::default()),
        }
    }

    pub fn build(&self) -> ControlPlane {
        self.build_with_meter(Box::new(FakeMeter {
            dialect: self.dialect,
            world: self.world.clone(),
        }))
    }

    /// Same wiring as `build`, with a caller-supplied meter.
    pub fn build_with_meter(&self, meter: Box<dyn MeterSource>) -> ControlPlane {
        let peripherals = Peripherals {
            transport: Box::new(FakeTransport(self.world.clone())),
            wifi: Box::new(FakeWifi(self.world.clone())),
            provisioning: Box::new(FakeProvisioning(self.world.clone())),
            actuator: Box::new(FakeActuator(self.world.clone())),
            platform: Box::new(FakePlatform(self.world.clone())),
            clock: Box::new(FakeClock(self.world.clone())),
            store: Box::new(FakeStore(self.world.clone())),
            meter,
        };
        ControlPlane::new(
            self.initial.borrow().clone(),
            self.settings.borrow().clone(),
            peripherals,
        )
    }

    /// A plane that fast-booted into sample mode as meter 0004711.
    pub fn sampling_plane(&self) -> ControlPlane {
        self.set_reset(Some(ResetInfo::new(ResetCause::SoftRestart)));
        self.meter_ready(4711);
        let mut plane = self.build();
        plane.poll_meter(0);
        plane.run_due(self.dialect.boot_timings().fast_sample_ms);
        assert_eq!(plane.lifecycle_state(), LifecycleState::Sampling);
        plane
    }

    pub fn codec(&self) -> EnvelopeCodec {
        EnvelopeCodec::from_shared_secret(self.initial.borrow().key.as_bytes())
    }

    /// Applies `f` to both the boot config and the stored copy.
    pub fn config_mut(&self, f: impl Fn(&mut DeviceConfig)) {
        f(&mut self.initial.borrow_mut());
        f(&mut self.world.borrow_mut().stored);
    }

    pub fn store_config(&self, f: impl FnOnce(&mut DeviceConfig)) {
        f(&mut self.world.borrow_mut().stored);
    }

    pub fn settings_mut(&self, f: impl FnOnce(&mut ControlPlaneConfig)) {
        f(&mut self.settings.borrow_mut());
    }

    pub fn set_reset(&self, reset: Option<ResetInfo>) {
        self.world.borrow_mut().reset = reset;
    }

    pub fn set_unix_time(&self, unix_time: u32) {
        self.world.borrow_mut().unix_time = unix_time;
    }

    pub fn set_local_time(&self, local_time: Option<NaiveDateTime>) {
        self.world.borrow_mut().local_time = local_time;
    }

    pub fn set_connected(&self, connected: bool) {
        self.world.borrow_mut().connected = connected;
    }

    pub fn fail_saves(&self, fail: bool) {
        self.world.borrow_mut().fail_saves = fail;
    }

    pub fn meter_ready(&self, serial: u32) {
        self.set_serial(serial);
        self.push_meter_event(MeterEvent::Ready);
    }

    /// Identifies the meter without raising a Ready event.
    pub fn set_serial(&self, serial: u32) {
        self.world.borrow_mut().serial = DeviceIdentity::from_meter_serial(serial);
    }

    pub fn meter_ready_as(&self, serial: &str) {
        let mut world = self.world.borrow_mut();
        world.serial = DeviceIdentity::new(serial);
        world.meter_events.push_back(MeterEvent::Ready);
    }

    pub fn push_meter_event(&self, event: MeterEvent) {
        self.world.borrow_mut().meter_events.push_back(event);
    }

    pub fn push_reading(&self, energy_wh: u64) {
        let reading = MeterReading {
            energy_wh,
            volume_l: None,
            power_w: 0,
        };
        let mut world = self.world.borrow_mut();
        world.reading = Some(reading);
        world
            .meter_events
            .push_back(MeterEvent::DataReceived(reading));
    }

    pub fn set_reading(&self, reading: Option<MeterReading>) {
        self.world.borrow_mut().reading = reading;
    }

    pub fn set_last_pulse(&self, last_pulse_ms: Option<u64>) {
        self.world.borrow_mut().last_pulse_ms = last_pulse_ms;
    }

    pub fn meter_requests(&self) -> usize {
        self.world.borrow().meter_requests
    }

    pub fn actuator_calls(&self) -> Vec<ActuatorCall> {
        self.world.borrow().actuator_calls.clone()
    }

    pub fn clear_actuator_calls(&self) {
        self.world.borrow_mut().actuator_calls.clear();
    }

    pub fn provisioning_started(&self) -> Vec<String> {
        self.world.borrow().provisioning_started.clone()
    }

    pub fn provisioning_stopped(&self) -> bool {
        self.world.borrow().provisioning_stopped
    }

    pub fn session(&self) -> Option<SessionParams> {
        self.world.borrow().session.clone()
    }

    pub fn saved(&self) -> Vec<DeviceConfig> {
        self.world.borrow().saved.clone()
    }

    pub fn station_connects(&self) -> usize {
        self.world.borrow().station_connects
    }

    pub fn mesh_ap(&self) -> Option<AccessPoint> {
        self.world.borrow().mesh_ap.clone()
    }

    pub fn scans(&self) -> usize {
        self.world.borrow().scans
    }

    pub fn disconnects(&self) -> usize {
        self.world.borrow().disconnects
    }

    pub fn pings(&self) -> usize {
        self.world.borrow().pings
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.world.borrow().subscriptions.clone()
    }

    pub fn clear_publishes(&self) {
        self.world.borrow_mut().published.clear();
    }

    pub fn published_qos(&self) -> Vec<QoS> {
        self.world
            .borrow()
            .published
            .iter()
            .map(|message| message.qos)
            .collect()
    }

    /// First topic segment of every publish, in order.
    pub fn published_domains(&self) -> Vec<String> {
        self.world
            .borrow()
            .published
            .iter()
            .map(|message| message.topic.split('/').nth(1).unwrap_or("").to_string())
            .collect()
    }

    /// Topic and opened cleartext of every publish, in order.
    pub fn opened_publishes(&self) -> Vec<(String, String)> {
        let codec = self.codec();
        self.world
            .borrow()
            .published
            .iter()
            .map(|message| {
                let cleartext = codec
                    .open(&message.topic, &message.payload)
                    .expect("publish sealed with the device key");
                (
                    message.topic.clone(),
                    String::from_utf8(cleartext).expect("utf-8 body"),
                )
            })
            .collect()
    }
}
