//! Platform seam: the radio link and the board.
//!
//! The dispatcher never talks to hardware directly. A [`Radio`] delivers
//! inbound frames and transmits outbound ones; a [`Board`] exposes reset
//! control. The binary plugs in the MQTT bridge and the simulated board,
//! tests plug in [`testing::MockRadio`].

use serde_json::Value;
use std::rc::Rc;
use thiserror::Error;
use tracing::{error, warn};
use watercounter_wire::envelope;
use watercounter_wire::Peer;

use crate::scheduler::Scheduler;

/// Attempts per outbound frame before it is dropped.
pub const MAX_TRANSMIT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub sender: Peer,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("transmit failed: {0}")]
    Transmit(String),

    #[error("AT command {cmd} failed: {reason}")]
    AtCommand { cmd: String, reason: String },
}

pub trait Radio {
    /// Next received frame, if any. Never blocks.
    fn receive(&self) -> Option<Inbound>;

    fn transmit(&self, dest: Peer, payload: &[u8]) -> Result<(), RadioError>;

    /// Raw radio configuration command, e.g. `VL` for the firmware version.
    fn atcmd(&self, cmd: &str, value: Option<&Value>) -> Result<Value, RadioError>;

    fn unique_id(&self) -> Peer;
}

pub trait Board {
    fn soft_reset(&self);

    /// Numeric cause of the last reset (see `watercounter_wire::ResetCause`).
    fn reset_cause(&self) -> i64;

    fn feed_watchdog(&self) {}
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Transmit path shared by responses, pushes and log forwarding. A rejected
/// frame is retried from a one-shot task on the next scheduler pass.
#[derive(Clone)]
pub struct Outbox {
    radio: Rc<dyn Radio>,
    scheduler: Scheduler,
}

impl Outbox {
    pub fn new(radio: Rc<dyn Radio>, scheduler: Scheduler) -> Self {
        Self { radio, scheduler }
    }

    pub fn radio(&self) -> &Rc<dyn Radio> {
        &self.radio
    }

    pub fn send(&self, dest: Peer, frame: &Value) {
        match envelope::to_bytes(frame) {
            Ok(payload) => self.transmit(dest, payload, 1),
            Err(e) => error!(peer = %dest, "cannot encode frame: {e}"),
        }
    }

    /// Single attempt, no retry, no logging. Used for forwarded log records
    /// so that a failing link does not feed itself more records.
    pub fn send_quiet(&self, dest: Peer, frame: &Value) -> bool {
        envelope::to_bytes(frame)
            .map(|payload| self.radio.transmit(dest, &payload).is_ok())
            .unwrap_or(false)
    }

    fn transmit(&self, dest: Peer, payload: Vec<u8>, attempt: u32) {
        match self.radio.transmit(dest, &payload) {
            Ok(()) => {}
            Err(e) if attempt < MAX_TRANSMIT_ATTEMPTS => {
                warn!(peer = %dest, attempt, "{e}, retrying on next tick");
                let outbox = self.clone();
                self.scheduler.schedule_task(
                    move || outbox.transmit(dest, payload.clone(), attempt + 1),
                    None,
                );
            }
            Err(e) => {
                error!(peer = %dest, attempt, "{e}, dropping frame");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
