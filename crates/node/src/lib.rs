//! Embedded side of the watercounter: meter counters and motorised valves
//! exposed to a host over a radio link.
//!
//! Everything runs on one thread. [`Node::run_once`] handles at most one
//! inbound request and then runs whatever scheduler tasks are due (valve
//! motion, watchdog, retransmits); the binary calls it in a tight loop.

pub mod app;
pub mod commands;
pub mod config;
pub mod counter;
pub mod dispatcher;
pub mod logging;
pub mod mqtt;
pub mod observable;
pub mod radio;
pub mod scheduler;
pub mod sim;
pub mod valve;

pub use app::{Node, Pins};
pub use dispatcher::{CommandError, Dispatcher};
pub use observable::{Sensor, Switch};
pub use scheduler::{Clock, ManualClock, Scheduler, SystemClock};
