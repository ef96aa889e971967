//! Device configuration: radio identity, channel wiring, simulation and
//! broker settings. Loaded from TOML and validated as a whole.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use watercounter_wire::Peer;

use crate::counter::Points;
use crate::valve::ValveSettings;

/// Counter and valve channels the host expects.
pub const CHANNELS: usize = 3;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub peer: Peer,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_watchdog_period_ms")]
    pub watchdog_period_ms: u64,
    #[serde(default = "default_counters")]
    pub counters: Vec<CounterEntry>,
    #[serde(default = "default_valves")]
    pub valves: Vec<ValveEntry>,
    #[serde(default)]
    pub sim: SimEntry,
    #[serde(default)]
    pub mqtt: MqttEntry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CounterEntry {
    #[serde(default = "default_point_lo_hi")]
    pub point_lo_hi: u8,
    #[serde(default)]
    pub point_hi_lo: u8,
    /// Input pin label, for logs.
    pub input: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValveEntry {
    #[serde(default = "default_operation_time")]
    pub operation_time: u32,
    #[serde(default = "default_discretization")]
    pub discretization: u8,
    pub direction: Option<String>,
    pub power: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimEntry {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How often each meter contact may toggle.
    #[serde(default = "default_pulse_interval_ms")]
    pub pulse_interval_ms: u64,
    /// Chance that a contact toggles at each interval.
    #[serde(default = "default_flow_probability")]
    pub flow_probability: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttEntry {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive_sec")]
    pub keep_alive_sec: u64,
}

fn default_watchdog_period_ms() -> u64 {
    1000
}

fn default_point_lo_hi() -> u8 {
    7
}

fn default_operation_time() -> u32 {
    15
}

fn default_discretization() -> u8 {
    5
}

fn default_true() -> bool {
    true
}

fn default_pulse_interval_ms() -> u64 {
    2000
}

fn default_flow_probability() -> f64 {
    0.3
}

fn default_mqtt_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive_sec() -> u64 {
    30
}

fn default_counters() -> Vec<CounterEntry> {
    (0..CHANNELS)
        .map(|_| CounterEntry {
            point_lo_hi: default_point_lo_hi(),
            point_hi_lo: 0,
            input: None,
        })
        .collect()
}

fn default_valves() -> Vec<ValveEntry> {
    (0..CHANNELS)
        .map(|_| ValveEntry {
            operation_time: default_operation_time(),
            discretization: default_discretization(),
            direction: None,
            power: None,
        })
        .collect()
}

impl Default for SimEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            pulse_interval_ms: default_pulse_interval_ms(),
            flow_probability: default_flow_probability(),
        }
    }
}

impl Default for MqttEntry {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            keep_alive_sec: default_keep_alive_sec(),
        }
    }
}

impl CounterEntry {
    pub fn points(&self) -> Points {
        Points {
            lo_hi: self.point_lo_hi,
            hi_lo: self.point_hi_lo,
        }
    }

    pub fn input_label(&self, index: usize) -> String {
        self.input.clone().unwrap_or_else(|| format!("D{index}"))
    }
}

impl ValveEntry {
    pub fn settings(&self) -> ValveSettings {
        ValveSettings {
            operation_time: self.operation_time,
            discretization: self.discretization,
        }
    }

    pub fn direction_label(&self, index: usize) -> String {
        self.direction
            .clone()
            .unwrap_or_else(|| format!("valve{index}/dir"))
    }

    pub fn power_label(&self, index: usize) -> String {
        self.power
            .clone()
            .unwrap_or_else(|| format!("valve{index}/pwr"))
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate everything, reporting every violation at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.peer == Peer::COORDINATOR {
            errors.push("peer must not be the coordinator address".into());
        }
        if self.watchdog_period_ms == 0 {
            errors.push("watchdog_period_ms must be positive".into());
        }
        self.validate_counters(&mut errors);
        self.validate_valves(&mut errors);

        if !(0.0..=1.0).contains(&self.sim.flow_probability) {
            errors.push(format!(
                "sim: flow_probability {} out of range [0.0, 1.0]",
                self.sim.flow_probability
            ));
        }
        if self.sim.pulse_interval_ms == 0 {
            errors.push("sim: pulse_interval_ms must be positive".into());
        }
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt: host is empty".into());
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

    fn validate_counters(&self, errors: &mut Vec<String>) {
        if self.counters.len() != CHANNELS {
            errors.push(format!(
                "expected {CHANNELS} counters, got {}",
                self.counters.len()
            ));
        }
        for (i, c) in self.counters.iter().enumerate() {
            for (name, digit) in [("point_lo_hi", c.point_lo_hi), ("point_hi_lo", c.point_hi_lo)] {
                if digit > 9 {
                    errors.push(format!("counters[{i}]: {name} {digit} is not a digit"));
                }
            }
            if c.point_lo_hi == c.point_hi_lo {
                errors.push(format!(
                    "counters[{i}]: point_lo_hi and point_hi_lo are both {}",
                    c.point_lo_hi
                ));
            }
        }
    }

    fn validate_valves(&self, errors: &mut Vec<String>) {
        if self.valves.len() != CHANNELS {
            errors.push(format!(
                "expected {CHANNELS} valves, got {}",
                self.valves.len()
            ));
        }
        for (i, v) in self.valves.iter().enumerate() {
            if v.operation_time == 0 {
                errors.push(format!("valves[{i}]: operation_time must be positive"));
            }
            if !(1..=100).contains(&v.discretization) {
                errors.push(format!(
                    "valves[{i}]: discretization {} out of range [1, 100]",
                    v.discretization
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
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
