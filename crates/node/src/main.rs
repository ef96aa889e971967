use anyhow::{Context, Result};
use rumqttc::MqttOptions;
use std::{env, rc::Rc, sync::Arc, time::Duration};
use sysinfo::System;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use watercounter_wire::ResetCause;

use watercounter_node::config::{self, Config, CHANNELS};
use watercounter_node::logging::LogForwarder;
use watercounter_node::mqtt::{self, MqttRadio};
use watercounter_node::scheduler::{Scheduler, SystemClock};
use watercounter_node::sim::{self, SimBoard};
use watercounter_node::{Node, Pins};

/// Scheduler iteration period.
const TICK: Duration = Duration::from_millis(10);

/// Memory report period in debug mode.
const MEMORY_REPORT: Duration = Duration::from_secs(10);

enum Exit {
    Shutdown,
    SoftReset,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let logs = LogForwarder::new();
    tracing_subscriber::registry()
        .with(
            fmt::layer().with_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            ),
        )
        .with(logs.layer())
        .init();

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "node.toml".to_string());
    let mut config = config::load(&config_path)?;
    if let Ok(host) = env::var("MQTT_HOST") {
        config.mqtt.host = host;
    }
    if let Some(port) = env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
        config.mqtt.port = port;
    }

    let mut options = MqttOptions::new(
        format!("watercounter-node-{}", config.peer),
        config.mqtt.host.clone(),
        config.mqtt.port,
    );
    options.set_keep_alive(Duration::from_secs(config.mqtt.keep_alive_sec));
    let (radio, pump) = mqtt::connect(options, config.peer);
    tokio::spawn(pump);
    info!(
        peer = %config.peer,
        broker = %config.mqtt.host,
        port = config.mqtt.port,
        "radio bridge starting"
    );

    let radio = Rc::new(radio);
    let board = Rc::new(SimBoard::new(ResetCause::PowerOn));
    loop {
        match run(&config, Rc::clone(&radio), Rc::clone(&board), Arc::clone(&logs)).await? {
            Exit::Shutdown => break,
            Exit::SoftReset => {
                info!("restarting after soft reset");
                board.rebooted(ResetCause::SoftReset);
            }
        }
    }
    Ok(())
}

/// Build a fresh node and drive it until shutdown or a soft reset.
async fn run(
    config: &Config,
    radio: Rc<MqttRadio>,
    board: Rc<SimBoard>,
    logs: Arc<LogForwarder>,
) -> Result<Exit> {
    let scheduler = Scheduler::new(Rc::new(SystemClock::new()));
    let pins = Pins::new(CHANNELS);
    let node = Node::from_config(
        config,
        &pins,
        radio,
        board.clone(),
        scheduler.clone(),
        logs,
    );

    sim::log_outputs(&pins, config);
    #[cfg(feature = "sim")]
    {
        if config.sim.enabled {
            sim::attach_flow(&scheduler, &pins.inputs, &config.sim, fastrand::Rng::new());
            info!(
                interval_ms = config.sim.pulse_interval_ms,
                probability = config.sim.flow_probability,
                "simulating flow"
            );
        }
    }
    if config.debug {
        report_memory(&scheduler);
    }

    let mut ticker = interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = node.run_once() {
                    warn!("dropping request: {e}");
                }
                if board.take_reset_request() {
                    return Ok(Exit::SoftReset);
                }
            }
            res = &mut shutdown => {
                res.context("failed to listen for ctrl-c")?;
                info!("shutting down");
                return Ok(Exit::Shutdown);
            }
        }
    }
}

fn report_memory(scheduler: &Scheduler) {
    let system = std::cell::RefCell::new(System::new());
    scheduler.schedule_task(
        move || {
            let mut system = system.borrow_mut();
            system.refresh_memory();
            info!(
                used_kib = system.used_memory() / 1024,
                total_kib = system.total_memory() / 1024,
                "memory"
            );
        },
        Some(MEMORY_REPORT),
    );
}
