use std::{
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use rumqttc::{ConnectionError, Event, EventLoop, Incoming};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use meterbridge_common::{
    meter::{MeterSource, PulseCounter, PulseMeter, SerialMeter},
    ports::ConfigStore,
    ControlPlane, ControlPlaneConfig, DeviceConfig, MeterDialect, Peripherals,
};

use crate::{
    board::{
        monotonic_ms, spawn_pulse_source, HostPlatform, LocalProvisioning, ScanEvent, ScanEvents,
        SimActuator, SimWifi, SimulatedFrameLink, SystemClock,
    },
    mqtt::{BrokerOverrides, MqttLink, MqttTransport},
    store::FileConfigStore,
    web::{self, DeviceSnapshot, WebState},
};

/// Longest the loop sleeps before polling the meter again.
const MAX_IDLE: Duration = Duration::from_millis(250);
const MQTT_RETRY_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_METER_SERIAL: u32 = 4711;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut store = FileConfigStore::from_env();
    let mut config = store.load().unwrap_or_else(|err| {
        warn!(
            "failed to load config from {}: {err}",
            store.path().display()
        );
        DeviceConfig::default()
    });
    if let Ok(key) = std::env::var("METERBRIDGE_KEY") {
        if config.key != key {
            config.key = key;
            if let Err(err) = store.save(&config) {
                warn!("failed to persist key from environment: {err}");
            }
        }
    }

    let dialect = std::env::var("METERBRIDGE_METER")
        .ok()
        .and_then(|value| MeterDialect::parse(&value))
        .unwrap_or(MeterDialect::Kmp);
    let meter_serial = std::env::var("METERBRIDGE_METER_SERIAL")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(DEFAULT_METER_SERIAL);

    let meter: Box<dyn MeterSource> = match dialect {
        MeterDialect::Pulse => {
            let counter = Arc::new(PulseCounter::new(config.pulse_meter.count));
            let interval_ms = std::env::var("METERBRIDGE_PULSE_INTERVAL_MS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(10_000);
            spawn_pulse_source(counter.clone(), Duration::from_millis(interval_ms.max(1)));
            Box::new(PulseMeter::new(
                counter,
                &config.pulse_meter.settings(),
                monotonic_ms(),
            ))
        }
        serial => Box::new(SerialMeter::new(
            serial,
            SimulatedFrameLink::new(meter_serial, 0),
        )),
    };

    let (transport, link) = MqttTransport::new(BrokerOverrides::from_env());
    let (wifi, scan_events) = SimWifi::new();
    let config_mode = Arc::new(AtomicBool::new(false));
    let peripherals = Peripherals {
        transport: Box::new(transport),
        wifi: Box::new(wifi),
        provisioning: Box::new(LocalProvisioning::new(config_mode.clone())),
        actuator: Box::new(SimActuator::default()),
        platform: Box::new(HostPlatform::from_env()),
        clock: Box::new(SystemClock::new()),
        store: Box::new(store),
        meter,
    };

    let mut plane = ControlPlane::new(config, ControlPlaneConfig::default(), peripherals);

    let snapshot = Arc::new(Mutex::new(DeviceSnapshot::capture(&plane)));
    let (updates, mut update_rx) = mpsc::unbounded_channel();
    let web_state = WebState {
        snapshot: snapshot.clone(),
        config_mode,
        updates,
    };
    let http_port = std::env::var("METERBRIDGE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    tokio::spawn(async move {
        if let Err(err) = web::serve(web_state, http_port).await {
            warn!("provisioning server stopped: {err:#}");
        }
    });

    plane.start(monotonic_ms());
    let mut eventloop: Option<EventLoop> = None;

    loop {
        if let Some(fresh) = link.take_eventloop() {
            eventloop = Some(fresh);
        }

        let now_ms = monotonic_ms();
        let idle = plane
            .next_deadline_ms()
            .map(|deadline| Duration::from_millis(deadline.saturating_sub(now_ms)))
            .map_or(MAX_IDLE, |until| until.min(MAX_IDLE));

        tokio::select! {
            event = next_event(&mut eventloop) => {
                handle_mqtt_event(&mut plane, &link, event).await;
            }
            Some(update) = update_rx.recv() => {
                match plane.apply_provisioning(&update) {
                    Ok(true) => info!("provisioning update saved"),
                    Ok(false) => debug!("provisioning update changed nothing"),
                    Err(err) => warn!("provisioning update failed: {err}"),
                }
            }
            _ = tokio::time::sleep(idle) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }

        let now_ms = monotonic_ms();
        plane.poll_meter(now_ms);
        plane.run_due(now_ms);
        drain_scan_events(&mut plane, &scan_events);

        *snapshot.lock().await = DeviceSnapshot::capture(&plane);
    }
}

async fn next_event(eventloop: &mut Option<EventLoop>) -> Result<Event, ConnectionError> {
    match eventloop {
        Some(eventloop) => eventloop.poll().await,
        None => std::future::pending().await,
    }
}

async fn handle_mqtt_event(
    plane: &mut ControlPlane,
    link: &MqttLink,
    event: Result<Event, ConnectionError>,
) {
    match event {
        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
            info!("mqtt connected");
            link.set_connected(true);
            plane.on_connected(monotonic_ms());
        }
        Ok(Event::Incoming(Incoming::Publish(message))) => {
            if let Err(err) = plane.on_message(&message.topic, &message.payload) {
                debug!("dropped message on {}: {err}", message.topic);
            }
        }
        Ok(Event::Incoming(Incoming::Disconnect)) => session_lost(plane, link),
        Ok(_) => {}
        Err(err) => {
            warn!("mqtt poll error: {err}");
            session_lost(plane, link);
            tokio::time::sleep(MQTT_RETRY_DELAY).await;
        }
    }
}

fn session_lost(plane: &mut ControlPlane, link: &MqttLink) {
    if link.is_connected() {
        link.set_connected(false);
        plane.on_disconnected();
    }
}

fn drain_scan_events(plane: &mut ControlPlane, scan_events: &ScanEvents) {
    loop {
        let next = scan_events.borrow_mut().pop_front();
        match next {
            Some(ScanEvent::Found(result)) => plane.on_scan_result(&result),
            Some(ScanEvent::Done) => plane.on_scan_done(),
            None => break,
        }
    }
}
