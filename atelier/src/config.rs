//! Application configuration loaded from environment variables.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

pub const ENV_API_BASE_URL: &str = "ATELIER_API_BASE_URL";
pub const ENV_API_TOKEN: &str = "ATELIER_API_TOKEN";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "ATELIER_REQUEST_TIMEOUT_SECS";
pub const ENV_INGEST_CONCURRENCY: &str = "ATELIER_INGEST_CONCURRENCY";
pub const ENV_INGEST_MAX_ITEMS: &str = "ATELIER_INGEST_MAX_ITEMS";
pub const ENV_GENERATE_CONCURRENCY: &str = "ATELIER_GENERATE_CONCURRENCY";
pub const ENV_WAVE_PAUSE_MS: &str = "ATELIER_WAVE_PAUSE_MS";
pub const ENV_THUMBNAIL_SIZE: &str = "ATELIER_THUMBNAIL_SIZE";
pub const ENV_THUMBNAIL_QUALITY: &str = "ATELIER_THUMBNAIL_QUALITY";
pub const ENV_LOG_DIR: &str = "ATELIER_LOG_DIR";

/// Connection settings for the remote inference service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: String,
    pub request_timeout: Duration,
}

/// Settings for the bulk ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSettings {
    pub concurrency: usize,
    pub max_items: usize,
    pub thumbnail_size: u32,
    pub thumbnail_quality: u8,
    #[serde(default)]
    pub start_paused: bool,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            concurrency: 6,
            max_items: 70,
            thumbnail_size: 512,
            thumbnail_quality: 80,
            start_paused: false,
        }
    }
}

/// Settings for the generation batcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateSettings {
    /// Concurrency ceiling, also used as the wave size.
    pub concurrency: usize,
    #[serde(default)]
    pub wave_pause: Duration,
}

impl Default for GenerateSettings {
    fn default() -> Self {
        Self {
            concurrency: 9,
            wave_pause: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub ingest: IngestSettings,
    pub generate: GenerateSettings,
    pub log_dir: String,
}

impl AppConfig {
    /// Load from the process environment, after applying any `.env` file.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| Error::config(format!("{} must be set", key)))
        };

        let base_url = required(ENV_API_BASE_URL)?;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::config(format!(
                "{} must be an http(s) URL, got '{}'",
                ENV_API_BASE_URL, base_url
            )));
        }

        let config = Self {
            api: ApiConfig {
                base_url,
                token: required(ENV_API_TOKEN)?,
                request_timeout: Duration::from_secs(parse_or(
                    &lookup,
                    ENV_REQUEST_TIMEOUT_SECS,
                    120u64,
                )?),
            },
            ingest: IngestSettings {
                concurrency: parse_or(&lookup, ENV_INGEST_CONCURRENCY, 6)?,
                max_items: parse_or(&lookup, ENV_INGEST_MAX_ITEMS, 70)?,
                thumbnail_size: parse_or(&lookup, ENV_THUMBNAIL_SIZE, 512)?,
                thumbnail_quality: parse_or(&lookup, ENV_THUMBNAIL_QUALITY, 80)?,
                start_paused: false,
            },
            generate: GenerateSettings {
                concurrency: parse_or(&lookup, ENV_GENERATE_CONCURRENCY, 9)?,
                wave_pause: Duration::from_millis(parse_or(&lookup, ENV_WAVE_PAUSE_MS, 0u64)?),
            },
            log_dir: lookup(ENV_LOG_DIR).unwrap_or_else(|| "logs".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ingest.concurrency == 0 {
            return Err(Error::config(format!("{} must be at least 1", ENV_INGEST_CONCURRENCY)));
        }
        if self.ingest.max_items == 0 {
            return Err(Error::config(format!("{} must be at least 1", ENV_INGEST_MAX_ITEMS)));
        }
        if self.generate.concurrency == 0 {
            return Err(Error::config(format!(
                "{} must be at least 1",
                ENV_GENERATE_CONCURRENCY
            )));
        }
        if !(1..=100).contains(&self.ingest.thumbnail_quality) {
            return Err(Error::config(format!(
                "{} must be between 1 and 100",
                ENV_THUMBNAIL_QUALITY
            )));
        }
        if self.ingest.thumbnail_size == 0 {
            return Err(Error::config(format!("{} must be positive", ENV_THUMBNAIL_SIZE)));
        }
        Ok(())
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid {} '{}': {}", key, raw, e))),
        _ => Ok(default),
    }
}
