use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tracing::{debug, info, warn};

use meterbridge_common::{
    command_topic, format::body_text, reply_subscription, DeviceIdentity, EnvelopeCodec,
};

const USAGE: &str = "usage: meterbridge-console <serial> <function> [body]";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Invocation {
    identity: DeviceIdentity,
    function_name: String,
    body: String,
}

impl Invocation {
    fn from_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let (Some(serial), Some(function_name)) = (args.next(), args.next()) else {
            bail!(USAGE);
        };
        let Some(identity) = DeviceIdentity::new(serial.clone()) else {
            bail!("invalid device serial {serial:?}");
        };
        if function_name.is_empty() || function_name.contains(['/', '#', '+']) {
            bail!("invalid function name {function_name:?}");
        }
        let body = args.collect::<Vec<_>>().join(" ");
        Ok(Self {
            identity,
            function_name,
            body,
        })
    }
}

/// Domain segment of a reply topic, `None` for the command echo.
fn reply_domain(topic: &str) -> Option<&str> {
    let domain = topic.split('/').nth(1)?;
    (domain != "config").then_some(domain)
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let invocation = Invocation::from_args(std::env::args().skip(1))?;
    let key = std::env::var("METERBRIDGE_KEY").context("METERBRIDGE_KEY must hold the shared key")?;
    let codec = EnvelopeCodec::from_shared_secret(key.as_bytes());

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);
    let wait = std::env::var("METERBRIDGE_REPLY_WAIT_S")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map_or(Duration::from_secs(5), Duration::from_secs);

    let client_id = format!("meterbridge-console-{}", std::process::id());
    let mut mqtt_options = MqttOptions::new(client_id, mqtt_host, mqtt_port);
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);
    mqtt.subscribe(reply_subscription(&invocation.identity), QoS::AtLeastOnce)
        .await
        .context("failed to queue reply subscription")?;

    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);
    let mut sent = false;

    loop {
        let event = tokio::select! {
            event = eventloop.poll() => event,
            _ = &mut deadline => break,
        };

        match event {
            Ok(Event::Incoming(Incoming::SubAck(_))) if !sent => {
                let unix_time = u32::try_from(Utc::now().timestamp()).unwrap_or(0);
                let topic = command_topic(&invocation.identity, unix_time, &invocation.function_name);
                let payload = codec
                    .seal(&topic, invocation.body.as_bytes())
                    .context("failed to seal command")?;
                mqtt.publish(topic.clone(), QoS::AtLeastOnce, false, payload)
                    .await
                    .context("failed to queue command")?;
                info!("sent {topic}");
                sent = true;
            }
            Ok(Event::Incoming(Incoming::Publish(message))) => {
                let Some(domain) = reply_domain(&message.topic) else {
                    continue;
                };
                match codec.open(&message.topic, &message.payload) {
                    Some(cleartext) => println!("{domain}\t{}", body_text(&cleartext)),
                    None => debug!("could not open reply on {}", message.topic),
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!("console mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }

    if !sent {
        bail!("broker never acknowledged the reply subscription");
    }
    Ok(())
}
