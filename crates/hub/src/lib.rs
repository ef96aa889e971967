//! Host side of the watercounter: an async command client that talks to one
//! device over the radio bridge, and a coordinator that polls it, follows
//! its pushes and restores its state after a restart.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod mqtt;
pub mod state;
pub mod transport;

pub use client::{ClientError, CommandClient, DATA_RECEIVED};
pub use coordinator::{Coordinator, DEVICE_RESET};
pub use state::{DeviceData, ValveData};
pub use transport::{Inbound, Transport, TransportError};
