use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};
use tower_http::services::ServeDir;
use tracing::info;

use meterbridge_common::{lifecycle::LifecycleState, ControlPlane, DeviceConfig, ProvisioningUpdate};

/// What the web UI can see of the control plane, refreshed by the host loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub state: LifecycleState,
    pub device_id: Option<String>,
    pub config: DeviceConfig,
}

impl DeviceSnapshot {
    pub fn capture(plane: &ControlPlane) -> Self {
        Self {
            state: plane.lifecycle_state(),
            device_id: plane.identity().map(|identity| identity.to_string()),
            config: plane.config().clone(),
        }
    }
}

#[derive(Clone)]
pub struct WebState {
    pub snapshot: Arc<Mutex<DeviceSnapshot>>,
    pub config_mode: Arc<AtomicBool>,
    pub updates: mpsc::UnboundedSender<ProvisioningUpdate>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusView {
    state: &'static str,
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
    #[serde(rename = "configMode")]
    config_mode: bool,
    #[serde(rename = "actuatorOpen")]
    actuator_open: bool,
    #[serde(rename = "closeAt")]
    close_at: u32,
    #[serde(rename = "cronJobs")]
    cron_jobs: usize,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
struct ConfigView {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    wifi_pass_set: bool,
    #[serde(rename = "mqttHost")]
    mqtt_host: String,
    #[serde(rename = "mqttPort")]
    mqtt_port: u16,
    #[serde(rename = "mqttUser")]
    mqtt_user: String,
    #[serde(rename = "mqttPassSet")]
    mqtt_pass_set: bool,
    #[serde(rename = "keySet")]
    key_set: bool,
    #[serde(rename = "pulseMeterSerial")]
    pulse_meter_serial: String,
    #[serde(rename = "pulseMeterEnergyWh")]
    pulse_meter_energy_wh: u64,
    #[serde(rename = "impulsesPerKwh")]
    impulses_per_kwh: u32,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigUpdate {
    #[serde(rename = "wifiSsid", default)]
    wifi_ssid: Option<String>,
    #[serde(rename = "wifiPass", default)]
    wifi_pass: Option<String>,
    #[serde(rename = "mqttHost", default)]
    mqtt_host: Option<String>,
    #[serde(rename = "mqttPort", default)]
    mqtt_port: Option<u16>,
    #[serde(rename = "mqttUser", default)]
    mqtt_user: Option<String>,
    #[serde(rename = "mqttPass", default)]
    mqtt_pass: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(rename = "pulseMeterSerial", default)]
    pulse_meter_serial: Option<String>,
    #[serde(rename = "pulseMeterEnergyWh", default)]
    pulse_meter_energy_wh: Option<u64>,
    #[serde(rename = "impulsesPerKwh", default)]
    impulses_per_kwh: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ConfigUpdateResponse {
    #[serde(rename = "appliesAt")]
    applies_at: &'static str,
}

pub async fn serve(state: WebState, port: u16) -> anyhow::Result<()> {
    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route(
            "/api/config",
            get(handle_get_config).put(handle_put_config),
        )
        .fallback_service(ServeDir::new(web_root))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind provisioning server at {addr}"))?;

    info!("provisioning UI on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_get_status(State(state): State<WebState>) -> impl IntoResponse {
    let snapshot = state.snapshot.lock().await;
    Json(StatusView {
        state: lifecycle_label(snapshot.state),
        device_id: snapshot.device_id.clone(),
        config_mode: state.config_mode.load(Ordering::Relaxed),
        actuator_open: snapshot.config.safety.actuator_open,
        close_at: snapshot.config.safety.close_at_threshold,
        cron_jobs: snapshot.config.cron.len(),
    })
}

async fn handle_get_config(State(state): State<WebState>) -> impl IntoResponse {
    let snapshot = state.snapshot.lock().await;
    Json(build_config_view(&snapshot.config))
}

async fn handle_put_config(
    State(state): State<WebState>,
    Json(update): Json<ConfigUpdate>,
) -> impl IntoResponse {
    if !state.config_mode.load(Ordering::Relaxed) {
        return error_response(
            StatusCode::CONFLICT,
            "settings can only be changed in config mode",
        );
    }
    let update = match validate_update(update) {
        Ok(update) => update,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };
    if state.updates.send(update).is_err() {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "control plane is not running",
        );
    }

    (
        StatusCode::ACCEPTED,
        Json(ConfigUpdateResponse {
            applies_at: "sample_mode",
        }),
    )
        .into_response()
}

fn lifecycle_label(state: LifecycleState) -> &'static str {
    match state {
        LifecycleState::Booting => "booting",
        LifecycleState::ConfigMode => "config_mode",
        LifecycleState::SampleModePending => "sample_mode_pending",
        LifecycleState::Sampling => "sampling",
    }
}

fn build_config_view(config: &DeviceConfig) -> ConfigView {
    ConfigView {
        wifi_ssid: config.network.wifi_ssid.clone(),
        wifi_pass_set: !config.network.wifi_pass.is_empty(),
        mqtt_host: config.network.mqtt_host.clone(),
        mqtt_port: config.network.mqtt_port,
        mqtt_user: config.network.mqtt_user.clone(),
        mqtt_pass_set: !config.network.mqtt_pass.is_empty(),
        key_set: !config.key.is_empty(),
        pulse_meter_serial: config.pulse_meter.serial.clone(),
        pulse_meter_energy_wh: config.pulse_meter.base_energy_wh,
        impulses_per_kwh: config.pulse_meter.impulses_per_kwh,
    }
}

fn validate_update(update: ConfigUpdate) -> Result<ProvisioningUpdate, &'static str> {
    if update
        .wifi_ssid
        .as_deref()
        .is_some_and(|ssid| ssid.trim().is_empty())
    {
        return Err("wifiSsid cannot be empty");
    }
    if update
        .mqtt_host
        .as_deref()
        .is_some_and(|host| host.trim().is_empty())
    {
        return Err("mqttHost cannot be empty");
    }
    if update.mqtt_port == Some(0) {
        return Err("mqttPort must be between 1 and 65535");
    }
    if update.impulses_per_kwh == Some(0) {
        return Err("impulsesPerKwh must be positive");
    }

    Ok(ProvisioningUpdate {
        wifi_ssid: update.wifi_ssid,
        wifi_pass: update.wifi_pass,
        mqtt_host: update.mqtt_host,
        mqtt_port: update.mqtt_port,
        mqtt_user: update.mqtt_user,
        mqtt_pass: update.mqtt_pass,
        key: update.key,
        pulse_meter_serial: update.pulse_meter_serial,
        pulse_meter_energy_wh: update.pulse_meter_energy_wh,
        impulses_per_kwh: update.impulses_per_kwh,
    })
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
