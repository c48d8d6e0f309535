use std::{cell::RefCell, rc::Rc, time::Duration};

use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions};
use tracing::{info, warn};

use meterbridge_common::ports::{QoS, SessionParams, Transport, TransportError};

const REQUEST_CAPACITY: usize = 64;
const MIN_KEEP_ALIVE_S: u16 = 5;

/// Broker settings taken from the environment. They win over the persisted
/// configuration each time a session is initialised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl BrokerOverrides {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("MQTT_HOST").ok(),
            port: std::env::var("MQTT_PORT")
                .ok()
                .and_then(|value| value.parse::<u16>().ok()),
            user: std::env::var("MQTT_USER").ok(),
            password: std::env::var("MQTT_PASS").ok(),
        }
    }

    fn apply(&self, params: &mut SessionParams) {
        if let Some(host) = &self.host {
            params.host = host.clone();
        }
        if let Some(port) = self.port {
            params.port = port;
        }
        if let Some(user) = &self.user {
            params.user = user.clone();
        }
        if let Some(password) = &self.password {
            params.password = password.clone();
        }
    }
}

#[derive(Default)]
struct Link {
    connected: bool,
    fresh_eventloop: Option<EventLoop>,
}

/// Event-loop side of the transport, kept by the host loop.
#[derive(Clone, Default)]
pub struct MqttLink(Rc<RefCell<Link>>);

impl MqttLink {
    /// Hands over the event loop of a newly initialised session.
    pub fn take_eventloop(&self) -> Option<EventLoop> {
        self.0.borrow_mut().fresh_eventloop.take()
    }

    pub fn set_connected(&self, connected: bool) {
        self.0.borrow_mut().connected = connected;
    }

    pub fn is_connected(&self) -> bool {
        self.0.borrow().connected
    }
}

/// `Transport` over a `rumqttc` client. Requests are queued without waiting;
/// the host loop drives the event loop.
pub struct MqttTransport {
    overrides: BrokerOverrides,
    client: Option<AsyncClient>,
    link: MqttLink,
}

impl MqttTransport {
    pub fn new(overrides: BrokerOverrides) -> (Self, MqttLink) {
        let link = MqttLink::default();
        let transport = Self {
            overrides,
            client: None,
            link: link.clone(),
        };
        (transport, link)
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.client.as_ref().ok_or(TransportError::Unavailable)
    }
}

fn to_rumqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn rejected(err: rumqttc::ClientError) -> TransportError {
    TransportError::Rejected(err.to_string())
}

pub fn mqtt_options(params: &SessionParams) -> MqttOptions {
    let mut options = MqttOptions::new(params.client_id.clone(), params.host.clone(), params.port);
    options.set_keep_alive(Duration::from_secs(u64::from(
        params.keep_alive_s.max(MIN_KEEP_ALIVE_S),
    )));
    options.set_clean_session(true);
    if !params.user.is_empty() {
        options.set_credentials(params.user.clone(), params.password.clone());
    }
    options.set_last_will(LastWill::new(
        params.last_will.topic.clone(),
        params.last_will.payload.clone(),
        to_rumqtt_qos(params.last_will.qos),
        params.last_will.retain,
    ));
    options
}

impl Transport for MqttTransport {
    fn is_connected(&self) -> bool {
        self.client.is_some() && self.link.is_connected()
    }

    fn init_session(&mut self, mut params: SessionParams) -> Result<(), TransportError> {
        self.overrides.apply(&mut params);
        if params.host.trim().is_empty() {
            return Err(TransportError::Rejected("broker host is empty".to_string()));
        }
        if params.tls {
            warn!("TLS requested but this build speaks plain MQTT");
        }

        info!(
            "mqtt session {} -> {}:{}",
            params.client_id, params.host, params.port
        );
        let (client, eventloop) = AsyncClient::new(mqtt_options(&params), REQUEST_CAPACITY);
        self.client = Some(client);
        let mut link = self.link.0.borrow_mut();
        link.connected = false;
        link.fresh_eventloop = Some(eventloop);
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.client()?
            .try_subscribe(topic, to_rumqtt_qos(qos))
            .map_err(rejected)
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        if !self.link.is_connected() {
            return Err(TransportError::Unavailable);
        }
        self.client()?
            .try_publish(topic, to_rumqtt_qos(qos), retain, payload)
            .map_err(rejected)
    }

    /// PINGREQ is sent by the event loop on the keep-alive interval; this only
    /// reports whether a session exists to keep alive.
    fn ping(&mut self) -> Result<(), TransportError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::Unavailable)
        }
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.client()?.try_disconnect().map_err(rejected)
    }
}
