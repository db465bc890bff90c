use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETUP_CONFIG_ENV: &str = "ROLLUPS_SETUP_CONFIG_PATH";

/// Optional JSON file with deployment settings. Environment variables win
/// over anything set here.
#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_topic_prefix: Option<String>,
    #[serde(default)]
    mqtt_keepalive_secs: Option<u64>,
    #[serde(default)]
    enable_mqtt: Option<bool>,
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default)]
    flush_interval_ms: Option<u64>,
    #[serde(default)]
    max_queue: Option<usize>,
    #[serde(default)]
    workers: Option<usize>,
    #[serde(default)]
    retry_attempts: Option<u32>,
    #[serde(default)]
    retry_base_delay_ms: Option<u64>,
    #[serde(default)]
    refresh_interval_secs: Option<u64>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub enable_mqtt_listener: bool,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_queue: usize,
    pub workers: usize,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub refresh_interval_secs: u64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from a variable lookup so tests do not have to touch
    /// the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let parsed = |key: &str| var(key).and_then(|v| v.parse::<u64>().ok());

        let setup_path = var(SETUP_CONFIG_ENV).map(PathBuf::from);
        let overrides = setup_path
            .as_deref()
            .and_then(load_setup_config_overrides)
            .unwrap_or_default();
        let text_override = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let database_url = var("ROLLUPS_DATABASE_URL")
            .or_else(|| var("DATABASE_URL"))
            .or_else(|| text_override(&overrides.database_url))
            .context(
                "ROLLUPS_DATABASE_URL or DATABASE_URL is required \
                 (or database_url in the setup config)",
            )?;
        let database_url = normalize_database_url(database_url);

        let mqtt_host = var("ROLLUPS_MQTT_HOST")
            .or_else(|| text_override(&overrides.mqtt_host))
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let mqtt_port = var("ROLLUPS_MQTT_PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .or(overrides.mqtt_port.filter(|v| *v != 0))
            .unwrap_or(1883);
        let mqtt_username =
            var("ROLLUPS_MQTT_USERNAME").or_else(|| text_override(&overrides.mqtt_username));
        let mqtt_password =
            var("ROLLUPS_MQTT_PASSWORD").or_else(|| text_override(&overrides.mqtt_password));
        let mqtt_topic_prefix = var("ROLLUPS_MQTT_TOPIC_PREFIX")
            .or_else(|| text_override(&overrides.mqtt_topic_prefix))
            .unwrap_or_else(|| "iot".to_string());
        let mqtt_keepalive_secs = parsed("ROLLUPS_MQTT_KEEPALIVE_SECS")
            .or(overrides.mqtt_keepalive_secs.filter(|v| *v != 0))
            .unwrap_or(30);
        let mqtt_client_id = var("ROLLUPS_MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("sensor-rollups-{}", std::process::id()));
        let enable_mqtt_listener = var("ROLLUPS_ENABLE_MQTT")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .or(overrides.enable_mqtt)
            .unwrap_or(true);

        let batch_from_env = parsed("ROLLUPS_BATCH_SIZE").map(|v| v as usize);
        let batch_size = batch_from_env
            .or(overrides.batch_size)
            .filter(|v| *v != 0)
            .unwrap_or(500);
        let flush_interval_ms = parsed("ROLLUPS_FLUSH_INTERVAL_MS")
            .or(overrides.flush_interval_ms)
            .filter(|v| *v != 0)
            .unwrap_or(750);
        let max_queue = parsed("ROLLUPS_MAX_QUEUE")
            .map(|v| v as usize)
            .or(overrides.max_queue)
            .filter(|v| *v != 0)
            .unwrap_or_else(|| batch_size.saturating_mul(10));
        let workers = parsed("ROLLUPS_WORKERS")
            .map(|v| v as usize)
            .or(overrides.workers)
            .filter(|v| *v != 0)
            .unwrap_or(4);
        let db_pool_size = parsed("ROLLUPS_DB_POOL_SIZE")
            .map(|v| v as u32)
            .unwrap_or(10);

        let retry_attempts = parsed("ROLLUPS_RETRY_ATTEMPTS")
            .map(|v| v as u32)
            .or(overrides.retry_attempts)
            .filter(|v| *v != 0)
            .unwrap_or(3);
        let retry_base_delay_ms = parsed("ROLLUPS_RETRY_BASE_DELAY_MS")
            .or(overrides.retry_base_delay_ms)
            .unwrap_or(1000);
        let refresh_interval_secs = parsed("ROLLUPS_REFRESH_INTERVAL_SECS")
            .or(overrides.refresh_interval_secs)
            .unwrap_or(300);
        let otlp_endpoint = var("OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(Self {
            database_url,
            db_pool_size,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_keepalive_secs,
            mqtt_client_id,
            enable_mqtt_listener,
            batch_size,
            flush_interval_ms,
            max_queue,
            workers,
            retry_attempts,
            retry_base_delay_ms,
            refresh_interval_secs,
            otlp_endpoint,
        })
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// `None` disables the background refresh scheduler.
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }
}

/// Environment lookup backed by a map, for callers that assemble settings
/// themselves.
pub fn map_lookup(vars: HashMap<String, String>) -> impl Fn(&str) -> Option<String> {
    move |key: &str| vars.get(key).cloned()
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_only_database_is_set() {
        let config =
            Config::from_lookup(map_lookup(vars(&[("DATABASE_URL", "postgres://db/rollups")])))
                .unwrap();
        assert_eq!(config.database_url, "postgres://db/rollups");
        assert_eq!(config.mqtt_port, 1883);
        assert_eq!(config.mqtt_topic_prefix, "iot");
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.max_queue, 5000);
        assert_eq!(config.workers, 4);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.retry_base_delay(), Duration::from_secs(1));
        assert_eq!(config.refresh_interval(), Some(Duration::from_secs(300)));
        assert!(config.enable_mqtt_listener);
    }

    #[test]
    fn missing_database_url_is_an_error() {
        let err = Config::from_lookup(map_lookup(HashMap::new())).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn normalizes_driver_prefixed_urls() {
        let config = Config::from_lookup(map_lookup(vars(&[(
            "ROLLUPS_DATABASE_URL",
            "postgresql+asyncpg://u:p@localhost/rollups",
        )])))
        .unwrap();
        assert_eq!(config.database_url, "postgresql://u:p@localhost/rollups");
    }

    #[test]
    fn setup_file_fills_gaps_but_env_wins() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "database_url": "postgres://setup/rollups",
                "mqtt_host": "broker.local",
                "mqtt_port": 8883,
                "batch_size": 50,
                "workers": 2,
                "refresh_interval_secs": 0
            }}"#
        )
        .unwrap();
        let path = file.path().display().to_string();

        let config = Config::from_lookup(map_lookup(vars(&[
            (SETUP_CONFIG_ENV, path.as_str()),
            ("ROLLUPS_MQTT_PORT", "1884"),
        ])))
        .unwrap();
        assert_eq!(config.database_url, "postgres://setup/rollups");
        assert_eq!(config.mqtt_host, "broker.local");
        assert_eq!(config.mqtt_port, 1884);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_queue, 500);
        assert_eq!(config.workers, 2);
        assert_eq!(config.refresh_interval(), None);
    }

    #[test]
    fn unreadable_setup_file_is_ignored() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let path = file.path().display().to_string();
        let config = Config::from_lookup(map_lookup(vars(&[
            (SETUP_CONFIG_ENV, path.as_str()),
            ("DATABASE_URL", "postgres://db/rollups"),
        ])))
        .unwrap();
        assert_eq!(config.mqtt_host, "127.0.0.1");
    }
}
