//! Publishes synthetic device readings to `{prefix}/{producer}/readings`.
//!
//! Usage: `reading-simulator [live [interval_ms]] | [history [days] [interval_minutes]]`

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use dotenvy::dotenv;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use sensor_rollups::model::Reading;
use sensor_rollups::simulator::{historical_readings, standard_device_set};
use serde::Serialize;
use std::env;
use std::time::Duration;

const PUBLISH_CHUNK: usize = 200;

#[derive(Debug)]
enum Mode {
    Live { interval: Duration },
    History { days: u32, interval: ChronoDuration },
}

fn parse_mode(args: &[String]) -> Result<Mode> {
    let number = |idx: usize, default: u64| -> Result<u64> {
        match args.get(idx) {
            Some(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("invalid numeric argument '{raw}'")),
            None => Ok(default),
        }
    };
    match args.first().map(String::as_str) {
        None | Some("live") => Ok(Mode::Live {
            interval: Duration::from_millis(number(1, 1000)?.max(1)),
        }),
        Some("history") => Ok(Mode::History {
            days: u32::try_from(number(1, 1)?).context("days out of range")?,
            interval: ChronoDuration::minutes(number(2, 1)?.max(1) as i64),
        }),
        Some(other) => bail!("unknown mode '{other}' (expected live or history)"),
    }
}

#[derive(Serialize)]
struct Sequenced<'a> {
    #[serde(flatten)]
    reading: &'a Reading,
    seq: u64,
}

struct Publisher {
    client: AsyncClient,
    topic: String,
    next_seq: u64,
}

impl Publisher {
    async fn publish(&mut self, readings: &[Reading]) -> Result<()> {
        let payload: Vec<Sequenced<'_>> = readings
            .iter()
            .map(|reading| {
                self.next_seq += 1;
                Sequenced {
                    reading,
                    seq: self.next_seq,
                }
            })
            .collect();
        let bytes = serde_json::to_vec(&payload)?;
        self.client
            .publish(self.topic.clone(), QoS::AtLeastOnce, false, bytes)
            .await
            .context("publish readings")?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reading_simulator=info".into()),
        )
        .with_target(true)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let mode = parse_mode(&args)?;

    let host = env::var("ROLLUPS_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = env::var("ROLLUPS_MQTT_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(1883);
    let prefix = env::var("ROLLUPS_MQTT_TOPIC_PREFIX").unwrap_or_else(|_| "iot".to_string());
    let producer = env::var("ROLLUPS_SIM_PRODUCER").unwrap_or_else(|_| {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("sim-{}", &id[..8])
    });

    let mut options = MqttOptions::new(format!("{producer}-publisher"), host, port);
    options.set_keep_alive(Duration::from_secs(30));
    if let Ok(username) = env::var("ROLLUPS_MQTT_USERNAME") {
        options.set_credentials(
            username,
            env::var("ROLLUPS_MQTT_PASSWORD").unwrap_or_default(),
        );
    }
    let (client, mut eventloop) = AsyncClient::new(options, 256);
    tokio::spawn(async move {
        loop {
            if let Err(err) = eventloop.poll().await {
                tracing::warn!(error = %err, "simulator MQTT connection dropped; retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    let mut publisher = Publisher {
        client,
        topic: format!("{prefix}/{producer}/readings"),
        next_seq: 0,
    };
    let mut rng = StdRng::from_entropy();
    let mut devices = standard_device_set();
    tracing::info!(topic = %publisher.topic, devices = devices.len(), ?mode, "starting simulator");

    match mode {
        Mode::History { days, interval } => {
            let readings = historical_readings(&mut rng, &mut devices, Utc::now(), days, interval);
            for chunk in readings.chunks(PUBLISH_CHUNK) {
                publisher.publish(chunk).await?;
            }
            tracing::info!(
                readings = readings.len(),
                last_seq = publisher.next_seq,
                "historical backfill published"
            );
            // Let the event loop drain queued publishes.
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        Mode::Live { interval } => {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        let readings: Vec<Reading> = devices
                            .iter_mut()
                            .map(|device| device.reading_at(&mut rng, now))
                            .collect();
                        if let Err(err) = publisher.publish(&readings).await {
                            tracing::warn!(error = %err, "failed to publish live readings");
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!(last_seq = publisher.next_seq, "shutdown signal received");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
