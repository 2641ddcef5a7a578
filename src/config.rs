use crate::{http::HttpSettings, manager::WorkerSettings, marketplace::vk::config::DEFAULT_API_VERSION};
use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct VkConfig {
    pub token: String,
    pub group_id: i64,
    pub api_version: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    /// `None` when `VK_TOKEN` or `VK_GROUP_ID` is missing.
    pub vk: Option<VkConfig>,
    pub queue_capacity: usize,
    pub max_in_flight: usize,
    pub dispatch_timeout: Duration,
    pub http_timeout: Duration,
    pub http_connect_timeout: Duration,
    pub picture_cache_dir: Option<PathBuf>,
    pub db_ping_interval: Duration,
    pub shutdown_grace: Duration,
    pub request_max_bytes: usize,
    pub metrics_key: Option<String>,
}

impl AppConfig {
    /// Reads `.env` when present, then the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let vk = match (text("VK_TOKEN"), text("VK_GROUP_ID")) {
            (Some(token), Some(group_id)) => Some(VkConfig {
                token,
                group_id: parse_value("VK_GROUP_ID", &group_id)?,
                api_version: text("VK_API_VERSION").unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            }),
            _ => None,
        };

        let picture_cache_dir = match lookup("PICTURE_CACHE_DIR") {
            Some(dir) if dir.trim().is_empty() => None,
            Some(dir) => Some(PathBuf::from(dir.trim())),
            None => Some(PathBuf::from("storage/jpg")),
        };

        Ok(Self {
            host: text("SRV_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parsed(&text, "SRV_PORT", 8080)?,
            db_path: text("DB_PATH").unwrap_or_else(|| "storage/db.sqlite3".to_string()),
            vk,
            queue_capacity: positive(&text, "QUEUE_CAPACITY", 100)?,
            max_in_flight: positive(&text, "PLATFORM_MAX_IN_FLIGHT", 8)?,
            dispatch_timeout: Duration::from_millis(parsed(&text, "DISPATCH_TIMEOUT_MS", 2000)?),
            http_timeout: Duration::from_secs(parsed(&text, "HTTP_TIMEOUT_SECS", 15)?),
            http_connect_timeout: Duration::from_secs(parsed(&text, "HTTP_CONNECT_TIMEOUT_SECS", 5)?),
            picture_cache_dir,
            db_ping_interval: Duration::from_secs(positive(&text, "DB_PING_INTERVAL_SECS", 5)?),
            shutdown_grace: Duration::from_secs(parsed(&text, "SHUTDOWN_GRACE_SECS", 30)?),
            request_max_bytes: positive(&text, "REQUEST_MAX_BYTES", 256 * 1024)?,
            metrics_key: text("METRICS_KEY"),
        })
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_value("SRV_HOST", &format!("{}:{}", self.host, self.port))
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            timeout: self.http_timeout,
            connect_timeout: self.http_connect_timeout,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            queue_capacity: self.queue_capacity,
            max_in_flight: self.max_in_flight,
            dispatch_timeout: self.dispatch_timeout,
        }
    }
}

fn parse_value<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|err: T::Err| ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: err.to_string(),
    })
}

fn parsed<T>(
    text: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match text(name) {
        Some(value) => parse_value(name, &value),
        None => Ok(default),
    }
}

fn positive<T>(
    text: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + ToString,
    T::Err: std::fmt::Display,
{
    let value = parsed(text, name, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_without_env() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.db_path, "storage/db.sqlite3");
        assert!(cfg.vk.is_none());
        assert_eq!(cfg.queue_capacity, 100);
        assert_eq!(cfg.dispatch_timeout, Duration::from_millis(2000));
        assert_eq!(cfg.picture_cache_dir, Some(PathBuf::from("storage/jpg")));
        assert_eq!(cfg.request_max_bytes, 256 * 1024);
        assert_eq!(cfg.listen_addr().unwrap().port(), 8080);
    }

    #[test]
    fn vk_needs_token_and_group() {
        assert!(config(&[("VK_TOKEN", "t")]).unwrap().vk.is_none());
        let cfg = config(&[("VK_TOKEN", "t"), ("VK_GROUP_ID", "4242")]).unwrap();
        let vk = cfg.vk.unwrap();
        assert_eq!(vk.group_id, 4242);
        assert_eq!(vk.api_version, DEFAULT_API_VERSION);
    }

    #[test]
    fn unparseable_and_zero_values_are_rejected() {
        let err = config(&[("SRV_PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "SRV_PORT", .. }));
        assert!(config(&[("QUEUE_CAPACITY", "0")]).is_err());
        assert!(config(&[("VK_TOKEN", "t"), ("VK_GROUP_ID", "club1")]).is_err());
    }

    #[test]
    fn empty_cache_dir_disables_cache() {
        let cfg = config(&[("PICTURE_CACHE_DIR", "")]).unwrap();
        assert!(cfg.picture_cache_dir.is_none());
    }
}
