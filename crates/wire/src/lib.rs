//! Wire-level protocol shared by the watercounter device and its host.
//!
//! Every frame is a single JSON object. Requests carry `cmd` and an optional
//! `args`; replies wrap the handler result under `<cmd>_resp`; anything else
//! the device sends is an unsolicited push keyed by an observable name.

pub mod envelope;
pub mod error;
pub mod peer;
pub mod reset;
pub mod topic;

pub use envelope::{Arguments, Request};
pub use error::ProtocolError;
pub use peer::Peer;
pub use reset::ResetCause;
