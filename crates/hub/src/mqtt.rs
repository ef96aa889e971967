//! MQTT radio bridge transport.
//!
//! The hub publishes frames for the device on `xbee/<device>/from/<host>` and
//! receives everything on `xbee/<host>/from/+`. Connection state is tracked
//! from the event loop so that a send with no broker is reported as
//! unavailable instead of being queued forever.

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use watercounter_wire::topic::{frame_topic, inbox_filter, parse_frame_topic};
use watercounter_wire::Peer;

use crate::transport::{Inbound, Transport, TransportError, INBOUND_CAPACITY};

/// Requests the rumqttc client may queue ahead of the event loop.
const CLIENT_CAPACITY: usize = 20;

pub struct MqttTransport {
    client: AsyncClient,
    own: Peer,
    inbound: broadcast::Sender<Inbound>,
    connected: Arc<AtomicBool>,
}

/// Drives the broker connection. Must be spawned for frames to flow.
pub struct MqttEventLoop {
    eventloop: EventLoop,
    client: AsyncClient,
    own: Peer,
    inbound: broadcast::Sender<Inbound>,
    connected: Arc<AtomicBool>,
}

impl MqttTransport {
    pub fn new(options: MqttOptions, own: Peer) -> (Self, MqttEventLoop) {
        let (client, eventloop) = AsyncClient::new(options, CLIENT_CAPACITY);
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let transport = Self {
            client: client.clone(),
            own,
            inbound: inbound.clone(),
            connected: Arc::clone(&connected),
        };
        let driver = MqttEventLoop {
            eventloop,
            client,
            own,
            inbound,
            connected,
        };
        (transport, driver)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl Transport for MqttTransport {
    async fn send(&self, peer: Peer, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Unavailable("not connected to broker".into()));
        }
        self.client
            .publish(frame_topic(peer, self.own), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Delivery(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<Inbound> {
        self.inbound.subscribe()
    }
}

impl MqttEventLoop {
    pub async fn run(mut self) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(peer = %self.own, "mqtt connected");
                    self.connected.store(true, Ordering::Relaxed);
                    if let Err(e) = self
                        .client
                        .try_subscribe(inbox_filter(self.own), QoS::AtLeastOnce)
                    {
                        warn!("subscribe failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    match inbound_from(self.own, &p.topic, &p.payload) {
                        // no receivers just means nobody has started listening yet
                        Some(frame) => {
                            let _ = self.inbound.send(frame);
                        }
                        None => debug!(topic = %p.topic, "unhandled topic"),
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt disconnected");
                    self.connected.store(false, Ordering::Relaxed);
                }
                Ok(_) => {}
                Err(e) => {
                    self.connected.store(false, Ordering::Relaxed);
                    warn!("mqtt error: {e}. reconnecting...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }
}

/// Frame addressed to `own`, if `topic` is one.
fn inbound_from(own: Peer, topic: &str, payload: &[u8]) -> Option<Inbound> {
    let (dest, peer) = parse_frame_topic(topic)?;
    (dest == own).then(|| Inbound {
        peer,
        payload: payload.to_vec(),
    })
}

// ===========================================================================
// Tests
// ===========================================================================
