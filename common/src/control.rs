use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::{
    config::{ControlPlaneConfig, DeviceConfig, ProvisioningUpdate},
    cron::CronCommand,
    dispatch::{self, scan_result_body, Reply},
    envelope::{check_bounds, EnvelopeCodec, EnvelopeError},
    format::body_text,
    lifecycle::{BootKind, Lifecycle, LifecycleState},
    meter::{MeterEvent, MeterReading, MeterSource},
    ports::{
        AccessPoint, Actuator, Clock, ConfigStore, LastWill, Platform, Provisioning, QoS,
        ScanResult, SessionParams, StoreError, Transport, Wifi,
    },
    replay::ReplayWindow,
    safety::{AutoCloseGuard, MonitoredQuantity},
    telemetry::{SampleAction, TelemetryPublisher, TelemetrySample},
    timers::{Task, TaskQueue},
    topics::{
        command_subscription, last_will_topic, parse_command_topic, reply_topic, DeviceIdentity,
        Domain,
    },
};

pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("malformed envelope: topic {topic_len} bytes, payload {payload_len} bytes")]
    MalformedEnvelope { topic_len: usize, payload_len: usize },
    #[error("envelope authentication failed")]
    AuthenticationFailure,
    #[error("replay rejected: embedded time {embedded}, now {now}")]
    ReplayRejected { embedded: u32, now: u32 },
    #[error("unknown function {0:?}")]
    UnknownFunction(String),
    #[error("transport unavailable")]
    TransportUnavailable,
    #[error("persisting configuration failed: {0}")]
    Persistence(#[from] StoreError),
}

impl From<EnvelopeError> for ControlError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::MalformedEnvelope {
                topic_len,
                payload_len,
            } => Self::MalformedEnvelope {
                topic_len,
                payload_len,
            },
            EnvelopeError::AuthenticationFailure | EnvelopeError::Seal => {
                Self::AuthenticationFailure
            }
        }
    }
}

/// Collaborators owned by the control plane.
pub struct Peripherals {
    pub transport: Box<dyn Transport>,
    pub wifi: Box<dyn Wifi>,
    pub provisioning: Box<dyn Provisioning>,
    pub actuator: Box<dyn Actuator>,
    pub platform: Box<dyn Platform>,
    pub clock: Box<dyn Clock>,
    pub store: Box<dyn ConfigStore>,
    pub meter: Box<dyn MeterSource>,
}

/// State shared by every handler. Only the control plane's single execution
/// context touches it.
pub struct ControlPlaneContext {
    pub config: DeviceConfig,
    pub settings: ControlPlaneConfig,
    pub identity: Option<DeviceIdentity>,
    pub codec: EnvelopeCodec,
    pub peripherals: Peripherals,
    pub scan_pending: bool,
}

impl ControlPlaneContext {
    pub fn unix_time(&self) -> u32 {
        self.peripherals.clock.unix_time()
    }

    pub fn replay_window(&self) -> ReplayWindow {
        ReplayWindow::new(self.settings.replay_half_width_secs)
    }

    pub fn has_actuator(&self) -> bool {
        self.peripherals.meter.dialect().has_actuator()
    }

    /// `{sdk}-{firmware}-{model}`; the model carries build-option suffixes.
    pub fn version_string(&self) -> String {
        let mut model = self.peripherals.meter.dialect().model().to_string();
        if self.settings.monitored_quantity == MonitoredQuantity::Volume {
            model.push_str("-FLOW");
        }
        if !self.settings.auto_close {
            model.push_str("-NO_AUTO_CLOSE");
        }
        if !self.settings.cron_enabled {
            model.push_str("-NO_CRON");
        }
        format!(
            "{}-{FIRMWARE_VERSION}-{model}",
            self.peripherals.platform.sdk_version()
        )
    }

    pub fn status_reply(&self) -> Reply {
        Reply::new(Domain::Status, self.config.safety.status_text())
    }

    /// Current reading of the monitored quantity in whole units, 0 before
    /// the meter has reported.
    pub fn monitored_reading(&self) -> u64 {
        self.peripherals
            .meter
            .latest_reading()
            .and_then(|reading| self.settings.monitored_quantity.whole_units(&reading))
            .unwrap_or(0)
    }

    pub fn persist(&mut self) -> Result<(), ControlError> {
        self.peripherals.store.save(&self.config)?;
        Ok(())
    }

    pub fn open_actuator(&mut self) -> Result<(), ControlError> {
        self.peripherals.actuator.open();
        if self.config.set_actuator_open(true) {
            info!("actuator opened");
            self.persist()?;
        }
        Ok(())
    }

    pub fn close_actuator(&mut self) -> Result<(), ControlError> {
        self.peripherals.actuator.close();
        if self.config.set_actuator_open(false) {
            info!("actuator closed");
            self.persist()?;
        }
        Ok(())
    }

    pub fn actuator_off(&mut self) -> Result<(), ControlError> {
        self.peripherals.actuator.off();
        if self.config.set_actuator_open(false) {
            info!("actuator switched off");
            self.persist()?;
        }
        Ok(())
    }

    pub fn config_access_point(&self) -> AccessPoint {
        AccessPoint {
            ssid: format!("{}{}", self.settings.config_ap_prefix, self.serial_label()),
            password: self.settings.config_ap_password.clone(),
        }
    }

    pub fn mesh_access_point(&self) -> AccessPoint {
        AccessPoint {
            ssid: format!("{}{}", self.settings.mesh_ap_prefix, self.serial_label()),
            password: self.settings.mesh_ap_password.clone(),
        }
    }

    fn serial_label(&self) -> String {
        self.identity
            .clone()
            .or_else(|| self.peripherals.meter.received_serial())
            .map(|identity| identity.to_string())
            .unwrap_or_else(|| "0000000".to_string())
    }

    /// Seals and publishes with the highest QoS. A no-op while offline.
    pub fn publish(&mut self, reply: &Reply) {
        let Some(identity) = self.identity.as_ref() else {
            debug!("no device identity, dropping {} publish", reply.domain.as_str());
            return;
        };
        if !self.peripherals.transport.is_connected() {
            debug!(
                "{}, dropping {} publish",
                ControlError::TransportUnavailable,
                reply.domain.as_str()
            );
            return;
        }

        let topic = reply_topic(reply.domain, identity, self.unix_time());
        let sealed = match self.codec.seal(&topic, reply.body.as_bytes()) {
            Ok(sealed) => sealed,
            Err(err) => {
                warn!("failed to seal {topic}: {err}");
                return;
            }
        };
        if let Err(err) = self
            .peripherals
            .transport
            .publish(&topic, sealed, QoS::ExactlyOnce, false)
        {
            warn!("publish to {topic} failed: {err}");
        }
    }
}

/// Device control plane: lifecycle, timers, command routing, telemetry and
/// the auto-close guard, driven by one cooperative event loop.
pub struct ControlPlane {
    ctx: ControlPlaneContext,
    lifecycle: Lifecycle,
    queue: TaskQueue<Task>,
    guard: AutoCloseGuard,
    telemetry: TelemetryPublisher,
    last_cron_minute: Option<i64>,
}

impl ControlPlane {
    pub fn new(
        mut config: DeviceConfig,
        settings: ControlPlaneConfig,
        mut peripherals: Peripherals,
    ) -> Self {
        config.sanitize();

        if peripherals.meter.dialect().has_actuator() {
            if config.safety.actuator_open {
                peripherals.actuator.open();
            } else {
                peripherals.actuator.close();
            }
        }

        let guard = AutoCloseGuard::new(settings.auto_close, settings.monitored_quantity);
        let telemetry = TelemetryPublisher::new(settings.sample_period_ms);
        let ctx = ControlPlaneContext {
            codec: EnvelopeCodec::from_shared_secret(config.key.as_bytes()),
            identity: None,
            config,
            settings,
            peripherals,
            scan_pending: false,
        };

        Self {
            ctx,
            lifecycle: Lifecycle::new(),
            queue: TaskQueue::new(),
            guard,
            telemetry,
            last_cron_minute: None,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.ctx.config
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.ctx.identity.as_ref()
    }

    pub fn next_deadline_ms(&mut self) -> Option<u64> {
        self.queue.next_deadline()
    }

    /// Asks the meter to identify itself. Boot classification waits for the
    /// first identified reading.
    pub fn start(&mut self, now_ms: u64) {
        info!(
            "starting {} meter bridge",
            self.ctx.peripherals.meter.dialect().model()
        );
        self.ctx.peripherals.meter.request_sample(now_ms);
    }

    pub fn poll_meter(&mut self, now_ms: u64) {
        let events = self.ctx.peripherals.meter.poll(now_ms);
        for event in events {
            match event {
                MeterEvent::Ready => self.on_meter_ready(now_ms),
                MeterEvent::DataReceived(reading) => self.on_meter_data(reading),
                MeterEvent::PulseCountChanged(count) => {
                    self.ctx.config.pulse_meter.count = count;
                    if let Err(err) = self.ctx.persist() {
                        warn!("failed to persist pulse count: {err}");
                    }
                }
            }
        }
    }

    fn on_meter_ready(&mut self, now_ms: u64) {
        let reset = self.ctx.peripherals.platform.reset_info();
        let kind = BootKind::classify(reset.as_ref());
        let timings = self.ctx.peripherals.meter.dialect().boot_timings();
        self.lifecycle.boot(kind, timings, &mut self.queue, now_ms);
    }

    fn on_meter_data(&mut self, reading: MeterReading) {
        if self.lifecycle.state() == LifecycleState::Sampling {
            let sample = TelemetrySample::new(
                self.ctx.peripherals.platform.free_heap(),
                reading,
            );
            self.ctx
                .publish(&Reply::new(Domain::Sample, sample.to_string()));
        }

        if self.guard.should_close(&self.ctx.config.safety, &reading) {
            info!(
                "close-at threshold {} reached, closing actuator",
                self.ctx.config.safety.close_at_threshold
            );
            if let Err(err) = self.ctx.close_actuator() {
                warn!("auto-close: {err}");
            }
            let status = self.ctx.status_reply();
            self.ctx.publish(&status);
        }
    }

    /// Runs every task whose deadline has passed.
    pub fn run_due(&mut self, now_ms: u64) {
        while let Some(task) = self.queue.pop_due(now_ms) {
            match task {
                Task::ConfigMode => self.enter_config_mode(),
                Task::SampleMode => self.enter_sample_mode(now_ms),
                Task::Sample => self.on_sample_timer(now_ms),
                Task::CronTick => self.on_cron_tick(now_ms),
                Task::DeferredSubscribe => self.on_connected(now_ms),
                Task::SessionRetry => self.start_session(now_ms),
            }
        }
    }

    fn enter_config_mode(&mut self) {
        if !self.lifecycle.enter_config_mode() {
            return;
        }
        let ap = self.ctx.config_access_point();
        info!("entering config mode, access point {}", ap.ssid);
        self.ctx.peripherals.provisioning.start(&ap);
    }

    fn enter_sample_mode(&mut self, now_ms: u64) {
        if !self.lifecycle.enter_sampling(&mut self.queue) {
            return;
        }
        info!("entering sample mode");
        self.ctx.peripherals.provisioning.stop();
        self.reload_config();
        self.start_session(now_ms);

        let network = &self.ctx.config.network;
        let (ssid, pass) = (network.wifi_ssid.clone(), network.wifi_pass.clone());
        self.ctx.peripherals.wifi.connect_station(&ssid, &pass);

        if self.ctx.config.ap_enabled {
            let ap = self.ctx.mesh_access_point();
            self.ctx.peripherals.wifi.start_access_point(&ap);
        }

        if self.ctx.settings.cron_enabled && self.ctx.has_actuator() {
            let delay = self.ms_to_next_minute();
            self.queue.arm(Task::CronTick, now_ms, delay);
        }
    }

    /// Resolves the device identity and opens the broker session. Retried
    /// until the meter or the stored config yields a serial.
    fn start_session(&mut self, now_ms: u64) {
        self.ctx.identity = self
            .ctx
            .peripherals
            .meter
            .received_serial()
            .or_else(|| DeviceIdentity::new(self.ctx.config.device_id.clone()));
        let Some(identity) = self.ctx.identity.clone() else {
            let retry_ms = self.ctx.settings.deferred_subscribe_ms;
            warn!("no device identity yet, retrying session start in {retry_ms} ms");
            self.queue.arm(Task::SessionRetry, now_ms, retry_ms);
            return;
        };

        if self.ctx.config.set_device_id(identity.as_str()) {
            if let Err(err) = self.ctx.persist() {
                warn!("failed to persist device id: {err}");
            }
        }

        let network = &self.ctx.config.network;
        let params = SessionParams {
            client_id: identity.to_string(),
            host: network.mqtt_host.clone(),
            port: network.mqtt_port,
            user: network.mqtt_user.clone(),
            password: network.mqtt_pass.clone(),
            keep_alive_s: network.mqtt_keepalive_s,
            tls: network.mqtt_tls,
            last_will: LastWill {
                topic: last_will_topic(&identity),
                payload: Vec::new(),
                qos: QoS::AtMostOnce,
                retain: false,
            },
        };
        info!("initializing session for {identity}");
        if let Err(err) = self.ctx.peripherals.transport.init_session(params) {
            warn!("session init failed: {err}");
        }
    }

    /// Reloads persisted configuration, keeping the live pulse count, and
    /// hands the pulse-meter settings to the meter.
    fn reload_config(&mut self) {
        match self.ctx.peripherals.store.load() {
            Ok(mut stored) => {
                stored.pulse_meter.count = self.ctx.config.pulse_meter.count;
                stored.sanitize();
                self.ctx.codec = EnvelopeCodec::from_shared_secret(stored.key.as_bytes());
                self.ctx.config = stored;
            }
            Err(err) => warn!("config reload failed, keeping boot config: {err}"),
        }
        self.reconfigure_meter();
    }

    fn reconfigure_meter(&mut self) {
        let pulse_meter = &self.ctx.config.pulse_meter;
        self.ctx
            .peripherals
            .meter
            .reconfigure(&pulse_meter.settings(), pulse_meter.count);
    }

    /// Transport reported a live session.
    pub fn on_connected(&mut self, now_ms: u64) {
        if self.ctx.identity.is_none() {
            self.ctx.identity = self.ctx.peripherals.meter.received_serial();
        }
        let Some(identity) = self.ctx.identity.clone() else {
            debug!("serial unknown, deferring subscription");
            self.queue.arm(
                Task::DeferredSubscribe,
                now_ms,
                self.ctx.settings.deferred_subscribe_ms,
            );
            return;
        };

        info!("session connected as {identity}");
        let subscription = command_subscription(&identity);
        if let Err(err) = self
            .ctx
            .peripherals
            .transport
            .subscribe(&subscription, QoS::AtMostOnce)
        {
            warn!("subscribe to {subscription} failed: {err}");
        }

        let version = Reply::new(Domain::Version, self.ctx.version_string());
        self.ctx.publish(&version);
        let uptime = Reply::new(
            Domain::Uptime,
            self.ctx.peripherals.clock.uptime_s().to_string(),
        );
        self.ctx.publish(&uptime);
        if self.ctx.has_actuator() {
            let status = self.ctx.status_reply();
            self.ctx.publish(&status);
        }

        self.on_sample_timer(now_ms);
    }

    /// Transport lost its session; ask for the station link again.
    pub fn on_disconnected(&mut self) {
        info!("session lost, reconnecting station");
        let network = &self.ctx.config.network;
        let (ssid, pass) = (network.wifi_ssid.clone(), network.wifi_pass.clone());
        self.ctx.peripherals.wifi.connect_station(&ssid, &pass);
    }

    fn on_sample_timer(&mut self, now_ms: u64) {
        self.queue
            .arm(Task::Sample, now_ms, self.telemetry.period_ms);

        let free_heap = self.ctx.peripherals.platform.free_heap();
        let action =
            self.telemetry
                .on_sample_timer(self.ctx.peripherals.meter.as_mut(), free_heap, now_ms);
        match action {
            SampleAction::MeterRequested => {}
            SampleAction::Publish(sample) => {
                self.ctx
                    .publish(&Reply::new(Domain::Sample, sample.to_string()));
            }
            SampleAction::KeepAlive => {
                if self.ctx.peripherals.transport.is_connected() {
                    if let Err(err) = self.ctx.peripherals.transport.ping() {
                        debug!("keep-alive ping failed: {err}");
                    }
                }
            }
        }
    }

    fn ms_to_next_minute(&self) -> u64 {
        let now = u64::from(self.ctx.unix_time());
        if now == 0 {
            return 60_000;
        }
        (60 - now % 60) * 1000
    }

    fn on_cron_tick(&mut self, now_ms: u64) {
        let delay = self.ms_to_next_minute();
        self.queue.arm(Task::CronTick, now_ms, delay);

        let Some(local) = self
            .ctx
            .peripherals
            .clock
            .local_time(&self.ctx.config.timezone)
        else {
            return;
        };
        let minute = local.and_utc().timestamp() / 60;
        if self.last_cron_minute == Some(minute) {
            return;
        }
        self.last_cron_minute = Some(minute);

        for command in self.ctx.config.cron.due(&local) {
            info!("cron job fired: {command:?}");
            let result = match command {
                CronCommand::Open => self.ctx.open_actuator(),
                CronCommand::Close => self.ctx.close_actuator(),
                CronCommand::Off => self.ctx.actuator_off(),
            };
            if let Err(err) = result {
                warn!("cron {command:?}: {err}");
            }
        }
    }

    /// Opens, authenticates and dispatches one inbound message.
    ///
    /// Errors describe why a message was dropped. None of them is answered
    /// on the wire.
    pub fn on_message(&mut self, topic: &str, payload: &[u8]) -> Result<(), ControlError> {
        check_bounds(topic, payload)?;
        let body = open_body(&self.ctx.codec, topic, payload)?;
        let path = parse_command_topic(topic)
            .ok_or_else(|| ControlError::UnknownFunction(String::new()))?;

        let replies = dispatch::dispatch(
            &mut self.ctx,
            &path.function_name,
            &body,
            path.embedded_unix_time,
        )?;
        for reply in &replies {
            self.ctx.publish(reply);
        }
        Ok(())
    }

    pub fn on_scan_result(&mut self, result: &ScanResult) {
        if !self.ctx.scan_pending {
            return;
        }
        let reply = Reply::new(Domain::ScanResult, scan_result_body(result));
        self.ctx.publish(&reply);
    }

    pub fn on_scan_done(&mut self) {
        self.ctx.scan_pending = false;
    }

    /// Stores settings from the provisioning UI. They take effect when
    /// sample mode reloads the configuration. Ignored outside config mode.
    pub fn apply_provisioning(&mut self, update: &ProvisioningUpdate) -> Result<bool, ControlError> {
        if self.lifecycle.state() != LifecycleState::ConfigMode {
            debug!("not in config mode, ignoring provisioning update");
            return Ok(false);
        }
        let pulse_meter = self.ctx.config.pulse_meter.clone();
        if !update.apply(&mut self.ctx.config) {
            return Ok(false);
        }
        // A new base energy restarts the count; the live counter has to follow.
        if self.ctx.config.pulse_meter != pulse_meter {
            self.reconfigure_meter();
        }
        info!("provisioning update stored");
        self.ctx.persist()?;
        Ok(true)
    }
}

/// Opens a command payload. Cleartext buffers are wiped when dropped.
fn open_body(
    codec: &EnvelopeCodec,
    topic: &str,
    payload: &[u8],
) -> Result<Zeroizing<String>, ControlError> {
    let cleartext = Zeroizing::new(
        codec
            .open(topic, payload)
            .ok_or(ControlError::AuthenticationFailure)?,
    );
    Ok(Zeroizing::new(body_text(&cleartext)))
}
