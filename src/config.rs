use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use super::fetcher::{FetcherSettings, RetryPolicy, DEFAULT_BASE_URL};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_USER_AGENT: &str = concat!(
    "wiki-pageviews/",
    env!("CARGO_PKG_VERSION"),
    " (monthly article pageview lookup)"
);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for env variable {name}: {value}")]
    Invalid { name: &'static str, value: String },

    #[error("env variable {0} must be greater than zero")]
    Zero(&'static str),

    #[error("invalid upstream base url: {0}")]
    BaseUrl(#[from] url::ParseError),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub production: bool,
    pub user_agent: String,
    /// Timeout for a single upstream call.
    pub upstream_timeout: Duration,
    pub fetcher: FetcherSettings,
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        let production = std::env::var("PRODUCTION").is_ok();
        let port = parse_var("PORT", DEFAULT_PORT)?;

        let base_url = std::env::var("UPSTREAM_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        url::Url::parse(&base_url)?;

        let user_agent = std::env::var("UPSTREAM_USER_AGENT")
            .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string());
        let upstream_timeout = Duration::from_secs(parse_var("UPSTREAM_TIMEOUT_SECS", 5)?);

        let max_attempts: u32 = parse_var("FETCH_MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(ConfigError::Zero("FETCH_MAX_ATTEMPTS"));
        }
        let backoff_base = Duration::from_millis(parse_var("FETCH_BACKOFF_BASE_MS", 100)?);

        let rate_limit_period: u64 = parse_var("RATE_LIMIT_PERIOD_MS", 1000)?;
        if rate_limit_period == 0 {
            return Err(ConfigError::Zero("RATE_LIMIT_PERIOD_MS"));
        }

        // 0 disables the overall timeout
        let request_timeout = match parse_var("REQUEST_TIMEOUT_SECS", 10u64)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Config {
            port,
            production,
            user_agent,
            upstream_timeout,
            fetcher: FetcherSettings {
                base_url,
                retry: RetryPolicy {
                    max_attempts,
                    backoff_base,
                },
                rate_limit_period: Duration::from_millis(rate_limit_period),
                request_timeout,
            },
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        match self.production {
            false => SocketAddr::from(([127, 0, 0, 1], self.port)),
            // for fly.io
            true => SocketAddr::from(([0u16; 8], self.port)),
        }
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}
