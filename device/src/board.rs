//! Simulated board peripherals for running the control plane on a host.

use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use chrono::{NaiveDateTime, Utc};
use chrono_tz::Tz;
use tracing::{info, warn};

use meterbridge_common::{
    lifecycle::{ResetCause, ResetInfo},
    meter::{DecodedFrame, FrameLink, MeterDialect, PulseCounter},
    ports::{AccessPoint, Actuator, Clock, Platform, Provisioning, ScanResult, Wifi},
};

const SIMULATED_HEAP_BYTES: u32 = 41_280;
const SIMULATED_SUPPLY_MV: u32 = 3_297;
const SIMULATED_POWER_W: u64 = 1_800;

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[derive(Debug, Default)]
pub struct SimActuator {
    duty_percent: u8,
}

impl Actuator for SimActuator {
    fn open(&mut self) {
        self.duty_percent = 100;
        info!("relay: open");
    }

    fn close(&mut self) {
        self.duty_percent = 0;
        info!("relay: close");
    }

    fn off(&mut self) {
        self.duty_percent = 0;
        info!("relay: off");
    }

    fn pwm(&mut self, duty_percent: u8) {
        self.duty_percent = duty_percent;
        info!("relay: pwm {duty_percent}%");
    }

    fn self_test(&mut self) {
        info!("relay: self test, duty {}%", self.duty_percent);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Found(ScanResult),
    Done,
}

pub type ScanEvents = Rc<RefCell<VecDeque<ScanEvent>>>;

/// Station link that is up as soon as it has an SSID. Scans report the
/// configured network and the device's own access point.
#[derive(Debug)]
pub struct SimWifi {
    station_ssid: Option<String>,
    access_point: Option<AccessPoint>,
    scan_events: ScanEvents,
}

impl SimWifi {
    pub fn new() -> (Self, ScanEvents) {
        let scan_events = ScanEvents::default();
        let wifi = Self {
            station_ssid: None,
            access_point: None,
            scan_events: scan_events.clone(),
        };
        (wifi, scan_events)
    }
}

impl Wifi for SimWifi {
    fn connect_station(&mut self, ssid: &str, _password: &str) {
        if ssid.is_empty() {
            warn!("wifi: no station SSID configured");
            self.station_ssid = None;
            return;
        }
        info!("wifi: station joined {ssid}");
        self.station_ssid = Some(ssid.to_string());
    }

    fn is_station_connected(&self) -> bool {
        self.station_ssid.is_some()
    }

    fn rssi(&self) -> i32 {
        if self.station_ssid.is_some() {
            -58
        } else {
            0
        }
    }

    fn access_point_active(&self) -> bool {
        self.access_point.is_some()
    }

    fn start_access_point(&mut self, ap: &AccessPoint) {
        info!("wifi: access point {} up", ap.ssid);
        self.access_point = Some(ap.clone());
    }

    fn stop_access_point(&mut self) {
        if let Some(ap) = self.access_point.take() {
            info!("wifi: access point {} down", ap.ssid);
        }
    }

    fn start_scan(&mut self) {
        let mut events = self.scan_events.borrow_mut();
        let visible = [
            (self.station_ssid.clone(), [0x02, 0x00, 0x5e, 0x10, 0x00, 0x01], -58, 6),
            (
                self.access_point.as_ref().map(|ap| ap.ssid.clone()),
                [0x02, 0x00, 0x5e, 0x10, 0x00, 0x02],
                -31,
                1,
            ),
        ];
        for (ssid, bssid, rssi, channel) in visible {
            if let Some(ssid) = ssid {
                events.push_back(ScanEvent::Found(ScanResult {
                    ssid,
                    bssid,
                    rssi,
                    channel,
                }));
            }
        }
        events.push_back(ScanEvent::Done);
    }
}

/// Config-mode services. The web UI only accepts updates while active.
#[derive(Debug, Clone)]
pub struct LocalProvisioning {
    active: Arc<AtomicBool>,
}

impl LocalProvisioning {
    pub fn new(active: Arc<AtomicBool>) -> Self {
        Self { active }
    }
}

impl Provisioning for LocalProvisioning {
    fn start(&mut self, ap: &AccessPoint) {
        info!(
            "provisioning: access point {} with captive DNS, web UI accepting updates",
            ap.ssid
        );
        self.active.store(true, Ordering::Relaxed);
    }

    fn stop(&mut self) {
        if self.active.swap(false, Ordering::Relaxed) {
            info!("provisioning: stopped");
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostPlatform {
    reset: Option<ResetInfo>,
}

impl HostPlatform {
    /// `METERBRIDGE_RESET_REASON` holds the numeric reset cause to report.
    pub fn from_env() -> Self {
        let reset = std::env::var("METERBRIDGE_RESET_REASON")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .and_then(ResetCause::from_code)
            .map(ResetInfo::new);
        Self { reset }
    }
}

impl Platform for HostPlatform {
    fn free_heap(&self) -> u32 {
        SIMULATED_HEAP_BYTES
    }

    fn supply_millivolts(&self) -> u32 {
        SIMULATED_SUPPLY_MV
    }

    fn sdk_version(&self) -> String {
        format!("host-{}", std::env::consts::ARCH)
    }

    fn reset_info(&self) -> Option<ResetInfo> {
        self.reset
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn unix_time(&self) -> u32 {
        u32::try_from(Utc::now().timestamp()).unwrap_or(0)
    }

    fn uptime_s(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    fn local_time(&self, timezone: &str) -> Option<NaiveDateTime> {
        let tz: Tz = timezone.parse().ok()?;
        Some(Utc::now().with_timezone(&tz).naive_local())
    }
}

/// Answers every meter request with a frame whose energy register advances
/// at a constant load.
#[derive(Debug)]
pub struct SimulatedFrameLink {
    serial: u32,
    energy_wh: u64,
    last_request: Option<Instant>,
    pending: VecDeque<DecodedFrame>,
}

impl SimulatedFrameLink {
    pub fn new(serial: u32, energy_wh: u64) -> Self {
        Self {
            serial,
            energy_wh,
            last_request: None,
            pending: VecDeque::new(),
        }
    }
}

impl FrameLink for SimulatedFrameLink {
    fn send_request(&mut self, dialect: MeterDialect) {
        let now = Instant::now();
        if let Some(last) = self.last_request {
            let elapsed_ms = u64::try_from(now.duration_since(last).as_millis()).unwrap_or(0);
            self.energy_wh += SIMULATED_POWER_W * elapsed_ms / 3_600_000;
        }
        self.last_request = Some(now);

        let volume_l = (dialect == MeterDialect::En61107).then_some(self.energy_wh / 10);
        self.pending.push_back(DecodedFrame {
            serial: self.serial,
            energy_wh: self.energy_wh,
            volume_l,
            power_w: SIMULATED_POWER_W,
        });
    }

    fn poll_frame(&mut self) -> Option<DecodedFrame> {
        self.pending.pop_front()
    }
}

/// Feeds the pulse counter at a fixed rate, the way the meter's S0 output
/// would drive the interrupt line.
pub fn spawn_pulse_source(counter: Arc<PulseCounter>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            counter.record_pulse(monotonic_ms());
        }
    });
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn scan_reports_known_networks_then_done() {
        let (mut wifi, events) = SimWifi::new();
        wifi.connect_station("home", "secret");
        wifi.start_scan();

        let events: Vec<ScanEvent> = events.borrow_mut().drain(..).collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ScanEvent::Found(result) if result.ssid == "home"));
        assert_eq!(events[1], ScanEvent::Done);
    }

    #[test]
    fn frame_link_answers_each_request() {
        let mut link = SimulatedFrameLink::new(4711, 12_000);
        assert_eq!(link.poll_frame(), None);

        link.send_request(MeterDialect::Kmp);
        let frame = link.poll_frame().unwrap();
        assert_eq!(frame.serial, 4711);
        assert_eq!(frame.energy_wh, 12_000);
        assert_eq!(frame.volume_l, None);
        assert_eq!(link.poll_frame(), None);

        link.send_request(MeterDialect::En61107);
        assert!(link.poll_frame().unwrap().volume_l.is_some());
    }

    #[test]
    fn clock_resolves_named_timezones_only() {
        let clock = SystemClock::new();
        assert!(clock.local_time("Europe/Copenhagen").is_some());
        assert!(clock.local_time("Mars/Olympus").is_none());
        assert!(clock.unix_time() > 0);
    }

    #[test]
    fn provisioning_toggles_shared_flag() {
        let active = Arc::new(AtomicBool::new(false));
        let mut provisioning = LocalProvisioning::new(active.clone());
        provisioning.start(&AccessPoint {
            ssid: "MeterBridge-0004711".to_string(),
            password: "meterbridge".to_string(),
        });
        assert!(active.load(Ordering::Relaxed));
        provisioning.stop();
        assert!(!active.load(Ordering::Relaxed));
    }
}
