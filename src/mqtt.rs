use crate::config::Config;
use crate::model::parse_readings_payload;
use crate::pipeline::{Delivery, PipelineHandle};
use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::time::{sleep, Duration};

pub fn readings_filter(prefix: &str) -> String {
    format!("{prefix}/+/readings")
}

pub fn mqtt_options(config: &Config, client_id: String) -> MqttOptions {
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host.clone(), config.mqtt_port);
    mqttoptions.set_keep_alive(config.mqtt_keepalive());
    if let Some(username) = &config.mqtt_username {
        mqttoptions.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    mqttoptions
}

/// Subscribes to `{prefix}/+/readings` and feeds every publish into the
/// pipeline, reconnecting forever.
pub async fn run_listener(config: Config, pipeline: PipelineHandle) -> Result<()> {
    let filter = readings_filter(&config.mqtt_topic_prefix);
    let stats = pipeline.stats();
    loop {
        let (client, mut eventloop) =
            AsyncClient::new(mqtt_options(&config, config.mqtt_client_id.clone()), 32);

        match client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
            Ok(_) => {
                tracing::info!(topic = %filter, "subscribed to readings feed");
                stats.set_mqtt_connected(true);
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to subscribe to MQTT; retrying");
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let mut payload = publish.payload.to_vec();
                    match parse_readings_payload(
                        &config.mqtt_topic_prefix,
                        &publish.topic,
                        &mut payload,
                    ) {
                        Ok(Some((partition, readings))) => {
                            if readings.is_empty() {
                                continue;
                            }
                            let delivery = Delivery {
                                partition,
                                readings,
                            };
                            if let Err(err) = pipeline.enqueue(delivery).await {
                                tracing::warn!(error = %err, "failed to queue MQTT readings");
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::warn!(
                                error = %err,
                                topic = %publish.topic,
                                "failed to decode MQTT payload"
                            )
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    stats.set_mqtt_connected(false);
                    tracing::warn!(error = %err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}
