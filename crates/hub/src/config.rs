//! TOML config file loading and validation for the hub.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;
use watercounter_wire::Peer;

const MAX_RETRY_COUNT: u32 = 20;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Device radio address.
    pub device: Peer,
    /// Our own radio address.
    #[serde(default)]
    pub host: Peer,
    #[serde(default = "default_poll_interval_sec")]
    pub poll_interval_sec: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default)]
    pub mqtt: MqttEntry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttEntry {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keep_alive_sec")]
    pub keep_alive_sec: u64,
}

impl Default for MqttEntry {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            keep_alive_sec: default_keep_alive_sec(),
        }
    }
}

fn default_poll_interval_sec() -> u64 {
    30
}

fn default_retry_count() -> u32 {
    5
}

fn default_response_timeout_ms() -> u64 {
    5000
}

fn default_mqtt_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "watercounter-hub".to_string()
}

fn default_keep_alive_sec() -> u64 {
    30
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate the whole file. Returns `Ok(())` or an error describing
    /// every violation found.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.device == self.host {
            errors.push(format!("device {} is the hub's own address", self.device));
        }
        if self.poll_interval_sec == 0 {
            errors.push("poll_interval_sec must be > 0".to_string());
        }
        if !(1..=MAX_RETRY_COUNT).contains(&self.retry_count) {
            errors.push(format!(
                "retry_count {} out of range [1, {MAX_RETRY_COUNT}]",
                self.retry_count
            ));
        }
        if self.response_timeout_ms == 0 {
            errors.push("response_timeout_ms must be > 0".to_string());
        }
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if self.mqtt.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
