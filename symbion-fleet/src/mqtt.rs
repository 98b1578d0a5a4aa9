use crate::config::MqttConf;
use crate::health::HealthTracker;
use crate::transport::mqtt::{MqttTransport, OUTPUT_TOPIC, REPLY_TOPIC};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task;
use tracing::{debug, info, warn};

pub fn create_mqtt_client(cfg: &MqttConf) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
    AsyncClient::new(opts, 64)
}

/// Abonnements non bloquants : appelé depuis la seule tâche qui vide la file
/// du client
fn subscribe_all(client: &AsyncClient) -> usize {
    let mut subscribed = 0;
    for topic in [REPLY_TOPIC, OUTPUT_TOPIC] {
        match client.try_subscribe(topic, QoS::AtLeastOnce) {
            Ok(()) => subscribed += 1,
            Err(e) => warn!(topic, error = %e, "MQTT subscribe failed"),
        }
    }
    subscribed
}

/// Pilote l'event loop : (ré)abonnement à chaque ConnAck, routage des réponses
pub fn spawn_mqtt_listener(
    client: AsyncClient,
    mut eventloop: EventLoop,
    transport: MqttTransport,
    health: HealthTracker,
    mut shutdown: watch::Receiver<bool>,
) -> task::JoinHandle<()> {
    task::spawn(async move {
        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("MQTT connected");
                        health.mark_mqtt_connected();
                        subscribe_all(&client);
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        if p.topic == REPLY_TOPIC {
                            transport.handle_reply(&p.payload);
                        } else if p.topic == OUTPUT_TOPIC {
                            transport.handle_output(&p.payload);
                        } else {
                            debug!(topic = %p.topic, "ignored MQTT message");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "MQTT connection error");
                        health.increment_reconnects();
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                },
                _ = shutdown.changed() => {
                    let _ = client.try_disconnect();
                    break;
                }
            }
        }
    })
}
