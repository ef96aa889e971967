//! Radio link bridged over MQTT.
//!
//! Frames to this node arrive on `xbee/<own>/from/<sender>`; frames it sends
//! go to `xbee/<dest>/from/<own>`. The broker connection is driven by a
//! separate task which hands received frames to the scheduler thread over a
//! channel, so [`Radio::receive`] never blocks.

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::Value;
use std::cell::RefCell;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use watercounter_wire::topic::{frame_topic, inbox_filter, parse_frame_topic};
use watercounter_wire::Peer;

use crate::radio::{Inbound, Radio, RadioError};

/// Reported for `atcmd VL`.
pub const FIRMWARE_VERSION: &str = concat!("watercounter-node ", env!("CARGO_PKG_VERSION"));

pub struct MqttRadio {
    client: AsyncClient,
    own: Peer,
    inbox: RefCell<mpsc::UnboundedReceiver<Inbound>>,
}

/// Create the radio and the future that keeps the broker connection alive.
/// The future must be spawned for frames to flow.
pub fn connect(options: MqttOptions, own: Peer) -> (MqttRadio, impl Future<Output = ()> + Send) {
    let (client, eventloop) = AsyncClient::new(options, 32);
    let (tx, rx) = mpsc::unbounded_channel();
    let radio = MqttRadio {
        client: client.clone(),
        own,
        inbox: RefCell::new(rx),
    };
    (radio, pump(eventloop, client, own, tx))
}

async fn pump(
    mut eventloop: EventLoop,
    client: AsyncClient,
    own: Peer,
    inbox: mpsc::UnboundedSender<Inbound>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(peer = %own, "radio bridge connected");
                if let Err(e) = client.try_subscribe(inbox_filter(own), QoS::AtLeastOnce) {
                    warn!("subscribe failed: {e}");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match inbound_from(own, &publish.topic, &publish.payload) {
                    Some(frame) => {
                        if inbox.send(frame).is_err() {
                            debug!("radio dropped, stopping bridge");
                            return;
                        }
                    }
                    None => debug!(topic = %publish.topic, "ignoring publish"),
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. retrying...");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Frame addressed to `own`, if `topic` is one.
fn inbound_from(own: Peer, topic: &str, payload: &[u8]) -> Option<Inbound> {
    let (dest, sender) = parse_frame_topic(topic)?;
    (dest == own).then(|| Inbound {
        sender,
        payload: payload.to_vec(),
    })
}

impl Radio for MqttRadio {
    fn receive(&self) -> Option<Inbound> {
        self.inbox.borrow_mut().try_recv().ok()
    }

    fn transmit(&self, dest: Peer, payload: &[u8]) -> Result<(), RadioError> {
        self.client
            .try_publish(
                frame_topic(dest, self.own),
                QoS::AtLeastOnce,
                false,
                payload.to_vec(),
            )
            .map_err(|e| RadioError::Transmit(e.to_string()))
    }

    fn atcmd(&self, cmd: &str, _value: Option<&Value>) -> Result<Value, RadioError> {
        match cmd {
            "VL" => Ok(Value::from(FIRMWARE_VERSION)),
            "SH" => Ok(Value::from(u32::from_be_bytes(head(self.own)))),
            "SL" => Ok(Value::from(u32::from_be_bytes(tail(self.own)))),
            _ => Err(RadioError::AtCommand {
                cmd: cmd.to_string(),
                reason: "not supported by the MQTT bridge".into(),
            }),
        }
    }

    fn unique_id(&self) -> Peer {
        self.own
    }
}

fn head(peer: Peer) -> [u8; 4] {
    let b = peer.as_bytes();
    [b[0], b[1], b[2], b[3]]
}

fn tail(peer: Peer) -> [u8; 4] {
    let b = peer.as_bytes();
    [b[4], b[5], b[6], b[7]]
}

// ===========================================================================
// Tests
// ===========================================================================
