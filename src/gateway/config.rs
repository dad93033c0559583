//! Environment-variable configuration, mirroring the upstream `Settings`
//! object's field names and defaults.

use std::time::Duration;

use anyhow::Context;

use super::registry::UpstreamSpec;

pub struct Config {
    pub upstreams: Vec<UpstreamSpec>,
    pub upstream_rate_per_sec: f64,
    pub max_concurrency: usize,
    pub queue_wait_timeout: Duration,
    pub max_queue_size: usize,
    pub jwt_secret: String,
    pub upstream_busy_timeout: Duration,
    pub token_refresh_after: Duration,
    pub admin_token: String,
    pub bind_addr: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let upstreams = match std::env::var("SERVERS_CONFIG") {
            Ok(raw) => serde_json::from_str::<Vec<UpstreamSpec>>(&raw)
                .context("SERVERS_CONFIG is not a valid JSON array of {url, username, password}")?,
            Err(_) => vec![UpstreamSpec {
                url: "https://192.0.2.1".to_string(),
                username: "admin".to_string(),
                password: "admin".to_string(),
            }],
        };

        if upstreams.is_empty() {
            anyhow::bail!("SERVERS_CONFIG must describe at least one upstream");
        }

        Ok(Self {
            upstreams,
            upstream_rate_per_sec: env_parse("B_RATE_LIMIT", 200.0)?,
            max_concurrency: env_parse("B_MAX_CONCURRENCY", 200usize)?,
            queue_wait_timeout: Duration::from_secs(env_parse("QUEUE_WAIT_TIMEOUT", 300u64)?),
            max_queue_size: env_parse("MAX_QUEUE_SIZE", 200usize)?,
            jwt_secret: std::env::var("JWT_SECRET_KEY")
                .unwrap_or_else(|_| "insecure-development-secret".to_string()),
            upstream_busy_timeout: Duration::from_secs(env_parse("SERVER_BUSY_TIMEOUT", 36u64)?),
            token_refresh_after: Duration::from_secs(
                env_parse::<u64>("TOKEN_REFRESH_HOURS", 23)? * 3600,
            ),
            admin_token: std::env::var("ADMIN_TOKEN").unwrap_or_else(|_| "admin-secret".to_string()),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            log_level: std::env::var("GATEWAY_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(_) => Ok(default),
    }
}
