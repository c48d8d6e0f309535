use std::fmt;

use crate::{
    format::{FixedPoint, QueryBody},
    meter::{MeterDialect, MeterReading, MeterSource},
};

pub const DEFAULT_SAMPLE_PERIOD_MS: u64 = 60_000;

/// One publish cycle's worth of metering data. Not kept after encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySample {
    pub free_heap: u32,
    pub reading: MeterReading,
}

impl TelemetrySample {
    pub fn new(free_heap: u32, reading: MeterReading) -> Self {
        Self { free_heap, reading }
    }
}

impl fmt::Display for TelemetrySample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut body = QueryBody::new()
            .field("heap", self.free_heap)
            .field(
                "effect1",
                format!("{} kW", FixedPoint::milli(self.reading.power_w)),
            )
            .field(
                "e1",
                format!("{} kWh", FixedPoint::milli(self.reading.energy_wh)),
            );
        if let Some(volume_l) = self.reading.volume_l {
            body = body.field("v1", format!("{} m3", FixedPoint::milli(volume_l)));
        }
        write!(f, "{}", body.terminated())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleAction {
    /// A meter request went out; data follows as a meter event.
    MeterRequested,
    Publish(TelemetrySample),
    /// Nothing new to report; keep the session alive instead.
    KeepAlive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryPublisher {
    pub period_ms: u64,
}

impl Default for TelemetryPublisher {
    fn default() -> Self {
        Self {
            period_ms: DEFAULT_SAMPLE_PERIOD_MS,
        }
    }
}

impl TelemetryPublisher {
    pub fn new(period_ms: u64) -> Self {
        Self { period_ms }
    }

    pub fn on_sample_timer(
        &self,
        meter: &mut dyn MeterSource,
        free_heap: u32,
        now_ms: u64,
    ) -> SampleAction {
        if meter.dialect() != MeterDialect::Pulse {
            meter.request_sample(now_ms);
            return SampleAction::MeterRequested;
        }

        let recent = meter
            .last_pulse_ms()
            .is_some_and(|last| last.saturating_add(self.period_ms) > now_ms);
        match meter.latest_reading() {
            Some(reading) if recent => SampleAction::Publish(TelemetrySample::new(free_heap, reading)),
            _ => SampleAction::KeepAlive,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::meter::{PulseCounter, PulseMeter, PulseMeterSettings};

    #[test]
    fn formats_body_with_fixed_point_fields() {
        let sample = TelemetrySample::new(
            24_576,
            MeterReading {
                energy_wh: 1_234,
                volume_l: None,
                power_w: 7,
            },
        );
        assert_eq!(
            sample.to_string(),
            "heap=24576&effect1=0.007 kW&e1=1.234 kWh&"
        );
    }

    #[test]
    fn appends_volume_when_present() {
        let sample = TelemetrySample::new(
            1,
            MeterReading {
                energy_wh: 40,
                volume_l: Some(123_456),
                power_w: 2_500,
            },
        );
        assert_eq!(
            sample.to_string(),
            "heap=1&effect1=2.500 kW&e1=0.040 kWh&v1=123.456 m3&"
        );
    }

    fn pulse_meter(counter: &Arc<PulseCounter>) -> PulseMeter {
        let settings = PulseMeterSettings {
            serial: "imp-0001".to_string(),
            base_energy_wh: 0,
            impulses_per_kwh: 1000,
        };
        PulseMeter::new(counter.clone(), &settings, 0)
    }

    #[test]
    fn pulse_meter_publishes_only_after_recent_pulses() {
        let publisher = TelemetryPublisher::default();
        let counter = Arc::new(PulseCounter::new(0));
        let mut meter = pulse_meter(&counter);
        meter.poll(0);

        assert!(matches!(
            publisher.on_sample_timer(&mut meter, 100, 30_000),
            SampleAction::Publish(_)
        ));
        assert_eq!(
            publisher.on_sample_timer(&mut meter, 100, 60_000),
            SampleAction::KeepAlive
        );

        counter.record_pulse(70_000);
        meter.poll(70_000);
        match publisher.on_sample_timer(&mut meter, 100, 120_000) {
            SampleAction::Publish(sample) => assert_eq!(sample.reading.energy_wh, 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            publisher.on_sample_timer(&mut meter, 100, 130_000),
            SampleAction::KeepAlive
        );
    }
}
