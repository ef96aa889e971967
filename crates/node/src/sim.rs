//! Simulated board for running the node without hardware.
//!
//! - [`SimBoard`] records watchdog feeds and turns `soft_reset` into a
//!   restart request for the main loop.
//! - [`attach_flow`] toggles the meter contacts at random, as if water were
//!   running through every meter.
//! - [`log_outputs`] reports valve motor pin changes.

use std::cell::Cell;
use tracing::{debug, info};
use watercounter_wire::ResetCause;

use crate::app::Pins;
use crate::config::Config;
use crate::radio::Board;

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

pub struct SimBoard {
    cause: Cell<ResetCause>,
    reset_requested: Cell<bool>,
    feeds: Cell<u64>,
}

impl SimBoard {
    pub fn new(cause: ResetCause) -> Self {
        Self {
            cause: Cell::new(cause),
            reset_requested: Cell::new(false),
            feeds: Cell::new(0),
        }
    }

    /// Returns true once after `soft_reset` was called.
    pub fn take_reset_request(&self) -> bool {
        self.reset_requested.replace(false)
    }

    /// Record that the node came back up for `cause`.
    pub fn rebooted(&self, cause: ResetCause) {
        self.cause.set(cause);
        self.feeds.set(0);
    }

    pub fn feeds(&self) -> u64 {
        self.feeds.get()
    }
}

impl Board for SimBoard {
    fn soft_reset(&self) {
        info!("soft reset");
        self.reset_requested.set(true);
    }

    fn reset_cause(&self) -> i64 {
        self.cause.get().code()
    }

    fn feed_watchdog(&self) {
        self.feeds.set(self.feeds.get() + 1);
    }
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

#[cfg(feature = "sim")]
mod flow {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use crate::config::SimEntry;
    use crate::observable::Switch;
    use crate::scheduler::{Scheduler, TaskHandle};

    /// Toggle each input with `flow_probability` every `pulse_interval_ms`.
    pub fn attach_flow(
        scheduler: &Scheduler,
        inputs: &[Switch],
        sim: &SimEntry,
        rng: fastrand::Rng,
    ) -> Vec<TaskHandle> {
        let rng = Rc::new(RefCell::new(rng));
        let period = Duration::from_millis(sim.pulse_interval_ms);
        inputs
            .iter()
            .map(|input| {
                let input = input.clone();
                let rng = Rc::clone(&rng);
                let probability = sim.flow_probability;
                scheduler.schedule_task(
                    move || {
                        if rng.borrow_mut().f64() < probability {
                            let state = input.state().unwrap_or(false);
                            input.set(!state);
                        }
                    },
                    Some(period),
                )
            })
            .collect()
    }
}

#[cfg(feature = "sim")]
pub use flow::attach_flow;

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

pub fn log_outputs(pins: &Pins, config: &Config) {
    for (n, counter) in config.counters.iter().enumerate() {
        if let Some(input) = pins.inputs.get(n) {
            let label = counter.input_label(n);
            input.subscribe(move |on| debug!(pin = %label, on, "input"));
        }
    }
    for (n, valve) in config.valves.iter().enumerate() {
        let lines = [
            (pins.direction.get(n), valve.direction_label(n)),
            (pins.power.get(n), valve.power_label(n)),
        ];
        for (pin, label) in lines {
            if let Some(pin) = pin {
                pin.subscribe(move |on| info!(pin = %label, on, "output"));
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_reset_becomes_restart_request() {
        let board = SimBoard::new(ResetCause::PowerOn);
        assert_eq!(board.reset_cause(), 4);
        assert!(!board.take_reset_request());

        board.soft_reset();
        assert!(board.take_reset_request());
        assert!(!board.take_reset_request());

        board.rebooted(ResetCause::SoftReset);
        assert_eq!(board.reset_cause(), 6);
    }

    #[test]
    fn watchdog_feeds_counted() {
        let board = SimBoard::new(ResetCause::PowerOn);
        board.feed_watchdog();
        board.feed_watchdog();
        assert_eq!(board.feeds(), 2);
        board.rebooted(ResetCause::Watchdog);
        assert_eq!(board.feeds(), 0);
    }

    #[cfg(feature = "sim")]
    mod flow {
        use super::super::attach_flow;
        use crate::config::SimEntry;
        use crate::observable::Switch;
        use crate::scheduler::{ManualClock, Scheduler};
        use std::rc::Rc;
        use std::time::Duration;

        fn run(probability: f64, intervals: u32) -> Vec<Switch> {
            let clock = ManualClock::new();
            let scheduler = Scheduler::new(Rc::new(clock.clone()));
            let inputs: Vec<Switch> = (0..3).map(|_| Switch::switch()).collect();
            let sim = SimEntry {
                enabled: true,
                pulse_interval_ms: 100,
                flow_probability: probability,
            };
            let handles = attach_flow(&scheduler, &inputs, &sim, fastrand::Rng::with_seed(7));
            assert_eq!(handles.len(), 3);
            for _ in 0..intervals {
                clock.advance(Duration::from_millis(100));
                scheduler.run_pending();
            }
            inputs
        }

        #[test]
        fn certain_flow_toggles_every_interval() {
            let inputs = run(1.0, 3);
            assert!(inputs.iter().all(|i| i.state() == Some(true)));
            let inputs = run(1.0, 4);
            assert!(inputs.iter().all(|i| i.state() == Some(false)));
        }

        #[test]
        fn no_flow_never_toggles() {
            let inputs = run(0.0, 50);
            assert!(inputs.iter().all(|i| i.state() == Some(false)));
        }
    }
}
