//! Application root: owns the scheduler, the dispatcher and the channels.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use watercounter_wire::ProtocolError;

use crate::commands;
use crate::config::Config;
use crate::counter::Counter;
use crate::dispatcher::Dispatcher;
use crate::logging::LogForwarder;
use crate::observable::Switch;
use crate::radio::{Board, Radio};
use crate::scheduler::{Scheduler, TaskHandle};
use crate::valve::Valve;

/// Board-level I/O lines, one set per channel.
pub struct Pins {
    pub inputs: Vec<Switch>,
    pub direction: Vec<Switch>,
    pub power: Vec<Switch>,
}

impl Pins {
    pub fn new(channels: usize) -> Self {
        let bank = || (0..channels).map(|_| Switch::switch()).collect();
        Self {
            inputs: bank(),
            direction: bank(),
            power: bank(),
        }
    }
}

pub struct Node {
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    counters: Vec<Counter>,
    valves: Vec<Valve>,
}

impl Node {
    pub fn new(
        radio: Rc<dyn Radio>,
        board: Rc<dyn Board>,
        scheduler: Scheduler,
        logs: Arc<LogForwarder>,
        counters: Vec<Counter>,
        valves: Vec<Valve>,
    ) -> Self {
        let mut dispatcher = Dispatcher::new(radio, board, scheduler.clone(), logs);
        commands::install(
            &mut dispatcher,
            counters.iter().map(Counter::sensor).collect(),
            valves.clone(),
        );
        Self {
            scheduler,
            dispatcher,
            counters,
            valves,
        }
    }

    /// Wire counters and valves to `pins` as described by `config`.
    pub fn from_config(
        config: &Config,
        pins: &Pins,
        radio: Rc<dyn Radio>,
        board: Rc<dyn Board>,
        scheduler: Scheduler,
        logs: Arc<LogForwarder>,
    ) -> Self {
        let counters = config
            .counters
            .iter()
            .zip(&pins.inputs)
            .map(|(entry, input)| Counter::new(input.clone(), entry.points()))
            .collect();
        let valves = config
            .valves
            .iter()
            .zip(pins.direction.iter().zip(&pins.power))
            .map(|(entry, (direction, power))| {
                Valve::new(
                    direction.clone(),
                    power.clone(),
                    entry.settings(),
                    scheduler.clone(),
                )
            })
            .collect();
        let node = Self::new(radio, Rc::clone(&board), scheduler, logs, counters, valves);

        if config.debug {
            node.attach_debug_printers();
        } else {
            node.start_watchdog(board, Duration::from_millis(config.watchdog_period_ms));
        }
        info!(
            counters = node.counters.len(),
            valves = node.valves.len(),
            debug = config.debug,
            "node ready"
        );
        node
    }

    /// One scheduler iteration: a dispatch cycle, then every due task. A
    /// malformed request is reported after the tasks have still run.
    pub fn run_once(&self) -> Result<bool, ProtocolError> {
        let handled = self.dispatcher.update();
        self.scheduler.run_pending();
        handled
    }

    pub fn start_watchdog(&self, board: Rc<dyn Board>, period: Duration) -> TaskHandle {
        self.scheduler
            .schedule_task(move || board.feed_watchdog(), Some(period))
    }

    /// Log every counter and valve change.
    pub fn attach_debug_printers(&self) {
        for (n, counter) in self.counters.iter().enumerate() {
            counter
                .sensor()
                .subscribe(move |value| info!(counter = n, value, "counter changed"));
        }
        for (n, valve) in self.valves.iter().enumerate() {
            valve
                .position_sensor()
                .subscribe(move |position| info!(valve = n, position, "valve moved"));
            valve
                .opening_sensor()
                .subscribe(move |on| info!(valve = n, opening = on, "valve opening"));
            valve
                .closing_sensor()
                .subscribe(move |on| info!(valve = n, closing = on, "valve closing"));
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn counters(&self) -> &[Counter] {
        &self.counters
    }

    pub fn valves(&self) -> &[Valve] {
        &self.valves
    }
}

// ===========================================================================
// Tests
// ===========================================================================
