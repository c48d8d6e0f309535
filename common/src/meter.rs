use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{lifecycle::BootTimings, topics::DeviceIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterDialect {
    /// Framed binary serial protocol.
    Kmp,
    /// ASCII serial protocol (EN 61107).
    En61107,
    /// Open-collector impulse output.
    Pulse,
}

impl MeterDialect {
    pub fn model(self) -> &'static str {
        match self {
            Self::Kmp => "KMP",
            Self::En61107 => "MC",
            Self::Pulse => "IMPULSE",
        }
    }

    /// Pulse counters have no relay output.
    pub fn has_actuator(self) -> bool {
        !matches!(self, Self::Pulse)
    }

    pub fn boot_timings(self) -> BootTimings {
        match self {
            Self::Kmp => BootTimings {
                fast_sample_ms: 16_000,
                config_ms: 1_000,
                fallback_sample_ms: 121_000,
            },
            Self::En61107 => BootTimings {
                fast_sample_ms: 30_000,
                config_ms: 1_000,
                fallback_sample_ms: 121_000,
            },
            Self::Pulse => BootTimings {
                fast_sample_ms: 100,
                config_ms: 100,
                fallback_sample_ms: 120_100,
            },
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "kmp" => Some(Self::Kmp),
            "en61107" | "mc" => Some(Self::En61107),
            "pulse" | "impulse" => Some(Self::Pulse),
            _ => None,
        }
    }
}

/// Latest decoded meter values in milli-units of the reported quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeterReading {
    pub energy_wh: u64,
    pub volume_l: Option<u64>,
    pub power_w: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterEvent {
    /// First identification of the meter. Emitted once.
    Ready,
    DataReceived(MeterReading),
    PulseCountChanged(u32),
}

/// Capability every meter dialect provides to the control plane.
pub trait MeterSource {
    fn dialect(&self) -> MeterDialect;

    fn received_serial(&self) -> Option<DeviceIdentity>;

    fn latest_reading(&self) -> Option<MeterReading>;

    fn received_energy_kwh(&self) -> u64 {
        self.latest_reading()
            .map(|reading| reading.energy_wh / 1000)
            .unwrap_or(0)
    }

    fn received_volume_m3(&self) -> u64 {
        self.latest_reading()
            .and_then(|reading| reading.volume_l)
            .map(|litres| litres / 1000)
            .unwrap_or(0)
    }

    /// Asks the meter for a fresh frame. Results arrive through `poll`.
    fn request_sample(&mut self, now_ms: u64);

    fn poll(&mut self, now_ms: u64) -> Vec<MeterEvent>;

    /// Time of the last counted pulse; `None` for dialects without pulses.
    fn last_pulse_ms(&self) -> Option<u64> {
        None
    }

    /// Takes over provisioned pulse-meter settings and the persisted pulse
    /// count. Serial meters identify themselves and ignore this.
    fn reconfigure(&mut self, _settings: &PulseMeterSettings, _count: u32) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame {
    pub serial: u32,
    pub energy_wh: u64,
    pub volume_l: Option<u64>,
    pub power_w: u64,
}

/// Byte-level side of a serial meter: request framing and frame decoding.
pub trait FrameLink {
    fn send_request(&mut self, dialect: MeterDialect);
    fn poll_frame(&mut self) -> Option<DecodedFrame>;
}

pub struct SerialMeter<L> {
    dialect: MeterDialect,
    link: L,
    serial: u32,
    reading: Option<MeterReading>,
}

impl<L: FrameLink> SerialMeter<L> {
    pub fn new(dialect: MeterDialect, link: L) -> Self {
        Self {
            dialect,
            link,
            serial: 0,
            reading: None,
        }
    }
}

impl<L: FrameLink> MeterSource for SerialMeter<L> {
    fn dialect(&self) -> MeterDialect {
        self.dialect
    }

    fn received_serial(&self) -> Option<DeviceIdentity> {
        DeviceIdentity::from_meter_serial(self.serial)
    }

    fn latest_reading(&self) -> Option<MeterReading> {
        self.reading
    }

    fn request_sample(&mut self, _now_ms: u64) {
        self.link.send_request(self.dialect);
    }

    fn poll(&mut self, _now_ms: u64) -> Vec<MeterEvent> {
        let mut events = Vec::new();
        while let Some(frame) = self.link.poll_frame() {
            if frame.serial == 0 {
                debug!("discarding meter frame without serial");
                continue;
            }

            if self.serial == 0 {
                self.serial = frame.serial;
                events.push(MeterEvent::Ready);
            }

            let reading = MeterReading {
                energy_wh: frame.energy_wh,
                volume_l: frame.volume_l,
                power_w: frame.power_w,
            };
            self.reading = Some(reading);
            events.push(MeterEvent::DataReceived(reading));
        }
        events
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PulseSnapshot {
    pub count: u32,
    pub edge_s: u32,
}

/// Interrupt-side pulse accumulator.
///
/// Count and edge time share one atomic word so the reader never sees a
/// count from one pulse paired with the time of another.
#[derive(Debug, Default)]
pub struct PulseCounter {
    packed: AtomicU64,
}

impl PulseCounter {
    pub fn new(count: u32) -> Self {
        Self {
            packed: AtomicU64::new(pack(count, 0)),
        }
    }

    pub fn record_pulse(&self, uptime_ms: u64) {
        let edge_s = u32::try_from(uptime_ms / 1000).unwrap_or(u32::MAX);
        let _ = self
            .packed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (count, _) = unpack(word);
                Some(pack(count.wrapping_add(1), edge_s))
            });
    }

    pub fn snapshot(&self) -> PulseSnapshot {
        let (count, edge_s) = unpack(self.packed.load(Ordering::Acquire));
        PulseSnapshot { count, edge_s }
    }

    /// Restores a persisted count, keeping the last edge time.
    pub fn preset(&self, count: u32) {
        let _ = self
            .packed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (_, edge_s) = unpack(word);
                Some(pack(count, edge_s))
            });
    }
}

fn pack(count: u32, edge_s: u32) -> u64 {
    (u64::from(edge_s) << 32) | u64::from(count)
}

fn unpack(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulseMeterSettings {
    pub serial: String,
    pub base_energy_wh: u64,
    pub impulses_per_kwh: u32,
}

pub struct PulseMeter {
    counter: Arc<PulseCounter>,
    serial: Option<DeviceIdentity>,
    base_energy_wh: u64,
    wh_per_pulse: u64,
    ready_emitted: bool,
    last_seen: PulseSnapshot,
    rate_base: PulseSnapshot,
    last_activity_ms: u64,
    power_w: u64,
}

impl PulseMeter {
    pub fn new(counter: Arc<PulseCounter>, settings: &PulseMeterSettings, now_ms: u64) -> Self {
        let last_seen = counter.snapshot();
        Self {
            counter,
            serial: DeviceIdentity::new(settings.serial.clone()),
            base_energy_wh: settings.base_energy_wh,
            wh_per_pulse: wh_per_pulse(settings.impulses_per_kwh),
            ready_emitted: false,
            last_seen,
            rate_base: last_seen,
            last_activity_ms: now_ms,
            power_w: 0,
        }
    }

    pub fn counter(&self) -> &Arc<PulseCounter> {
        &self.counter
    }

    fn energy_wh(&self, count: u32) -> u64 {
        self.base_energy_wh + u64::from(count) * self.wh_per_pulse
    }
}

fn wh_per_pulse(impulses_per_kwh: u32) -> u64 {
    1000 / u64::from(impulses_per_kwh.max(1))
}

impl MeterSource for PulseMeter {
    fn dialect(&self) -> MeterDialect {
        MeterDialect::Pulse
    }

    fn received_serial(&self) -> Option<DeviceIdentity> {
        self.serial.clone()
    }

    fn latest_reading(&self) -> Option<MeterReading> {
        Some(MeterReading {
            energy_wh: self.energy_wh(self.last_seen.count),
            volume_l: None,
            power_w: self.power_w,
        })
    }

    fn request_sample(&mut self, _now_ms: u64) {}

    fn poll(&mut self, now_ms: u64) -> Vec<MeterEvent> {
        let mut events = Vec::new();
        if !self.ready_emitted {
            self.ready_emitted = true;
            events.push(MeterEvent::Ready);
        }

        let snapshot = self.counter.snapshot();
        if snapshot.count == self.last_seen.count {
            return events;
        }

        // Pulses within the same second as the base carry over to the next
        // measurement.
        let pulses = u64::from(snapshot.count.wrapping_sub(self.rate_base.count));
        let elapsed_s = u64::from(snapshot.edge_s.saturating_sub(self.rate_base.edge_s));
        if elapsed_s > 0 {
            self.power_w = 3600 * self.wh_per_pulse * pulses / elapsed_s;
            self.rate_base = snapshot;
        }

        self.last_seen = snapshot;
        self.last_activity_ms = now_ms;
        events.push(MeterEvent::PulseCountChanged(snapshot.count));
        events
    }

    fn last_pulse_ms(&self) -> Option<u64> {
        Some(self.last_activity_ms)
    }

    fn reconfigure(&mut self, settings: &PulseMeterSettings, count: u32) {
        self.serial = DeviceIdentity::new(settings.serial.clone());
        self.base_energy_wh = settings.base_energy_wh;
        self.wh_per_pulse = wh_per_pulse(settings.impulses_per_kwh);
        if count != self.last_seen.count {
            self.counter.preset(count);
            self.last_seen = self.counter.snapshot();
            self.rate_base = self.last_seen;
        }
    }
}
