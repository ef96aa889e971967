//! MQTT topic scheme for the radio bridge.
//!
//! A frame sent by peer `S` to peer `D` travels on `xbee/<D>/from/<S>`, both
//! addresses in 16-digit lowercase hex.

use crate::peer::Peer;

pub const TOPIC_ROOT: &str = "xbee";

/// Topic carrying a frame from `src` to `dest`.
pub fn frame_topic(dest: Peer, src: Peer) -> String {
    format!("{TOPIC_ROOT}/{dest}/from/{src}")
}

/// Subscription filter for every frame addressed to `own`.
pub fn inbox_filter(own: Peer) -> String {
    format!("{TOPIC_ROOT}/{own}/from/+")
}

/// Extract `(dest, src)` from "xbee/<dest>/from/<src>".
pub fn parse_frame_topic(topic: &str) -> Option<(Peer, Peer)> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 4 && parts[0] == TOPIC_ROOT && parts[2] == "from" {
        Some((parts[1].parse().ok()?, parts[3].parse().ok()?))
    } else {
        None
    }
}

// ===========================================================================
// Tests
// ===========================================================================
