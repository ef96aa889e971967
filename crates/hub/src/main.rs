use anyhow::{Context, Result};
use rumqttc::MqttOptions;
use std::{env, sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use watercounter_hub::config;
use watercounter_hub::coordinator::{reset_cause_text, Coordinator, DEVICE_RESET};
use watercounter_hub::mqtt::MqttTransport;
use watercounter_hub::CommandClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "hub.toml".to_string());
    let mut cfg = config::load(&config_path)?;
    if let Ok(host) = env::var("MQTT_HOST") {
        cfg.mqtt.host = host;
    }
    if let Some(port) = env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
        cfg.mqtt.port = port;
    }

    // ── MQTT ────────────────────────────────────────────────────────
    let mut options = MqttOptions::new(cfg.mqtt.client_id.clone(), cfg.mqtt.host.clone(), cfg.mqtt.port);
    options.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_sec));
    let (transport, eventloop) = MqttTransport::new(options, cfg.host);
    tokio::spawn(eventloop.run());
    info!(
        broker = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        host = %cfg.host,
        "radio bridge starting"
    );

    // ── Client & coordinator ────────────────────────────────────────
    let client = CommandClient::new(Arc::new(transport), cfg.device)
        .with_retry_count(cfg.retry_count)
        .with_timeout(cfg.response_timeout());
    client.start()?;
    let client = Arc::new(client);

    let coordinator = Arc::new(Coordinator::new(Arc::clone(&client)));
    coordinator.add_subscriber(DEVICE_RESET, |event| {
        let cause = event["reset_cause"].as_i64().unwrap_or_default();
        warn!(cause = %reset_cause_text(cause), "device was reset");
    });

    let mut changes = coordinator.watch();
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let data = changes.borrow_and_update().clone();
            match serde_json::to_string(&data) {
                Ok(json) => info!(data = %json, "device data"),
                Err(e) => warn!("cannot render device data: {e}"),
            }
        }
    });

    let poller = tokio::spawn(Arc::clone(&coordinator).run(cfg.poll_interval()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    poller.abort();
    client.stop();
    Ok(())
}
