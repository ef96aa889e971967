//! Motorised ball valve without position feedback.
//!
//! Position is estimated by dead reckoning: while the motor runs, a periodic
//! scheduler task moves the estimate by `discretization` percent. Travel from
//! fully closed to fully open takes `operation_time` seconds, so one tick
//! lasts `operation_time * discretization * 10` ms.
//!
//! ```text
//!            open()                     close()
//!   Idle ------------> Opening   Idle ------------> Closing
//!     ^                   |        ^                   |
//!     +-- stop() / 100% --+        +--- stop() / 0% ---+
//! ```
//!
//! Reversing mid-travel first applies one more tick in the old direction.

use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::observable::{Sensor, Switch};
use crate::scheduler::{Scheduler, TaskHandle};

pub const FULLY_OPEN: u8 = 100;
pub const FULLY_CLOSED: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValveSettings {
    /// Seconds for a full stroke.
    pub operation_time: u32,
    /// Percent moved per tick.
    pub discretization: u8,
}

impl Default for ValveSettings {
    fn default() -> Self {
        Self {
            operation_time: 15,
            discretization: 5,
        }
    }
}

impl ValveSettings {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(u64::from(self.operation_time) * u64::from(self.discretization) * 10)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("valve position {0} out of range 0..=100")]
pub struct PositionOutOfRange(pub i64);

struct Motor {
    position: Sensor<u8>,
    is_opening: Switch,
    is_closing: Switch,
    direction: Switch,
    power: Switch,
    settings: ValveSettings,
    scheduler: Scheduler,
    task: Cell<Option<TaskHandle>>,
}

/// Cloneable handle; the motor is stopped when the last handle is dropped.
#[derive(Clone)]
pub struct Valve {
    motor: Rc<Motor>,
}

impl Valve {
    /// `direction` true drives towards open; `power` energises the motor.
    pub fn new(
        direction: Switch,
        power: Switch,
        settings: ValveSettings,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            motor: Rc::new(Motor {
                position: Sensor::new(),
                is_opening: Switch::switch(),
                is_closing: Switch::switch(),
                direction,
                power,
                settings,
                scheduler,
                task: Cell::new(None),
            }),
        }
    }

    pub fn position(&self) -> Option<u8> {
        self.motor.position.state()
    }

    pub fn set_position(&self, value: i64) -> Result<(), PositionOutOfRange> {
        let position = u8::try_from(value)
            .ok()
            .filter(|p| *p <= FULLY_OPEN)
            .ok_or(PositionOutOfRange(value))?;
        self.motor.position.set(position);
        Ok(())
    }

    pub fn is_opening(&self) -> bool {
        self.motor.is_opening.state().unwrap_or(false)
    }

    pub fn is_closing(&self) -> bool {
        self.motor.is_closing.state().unwrap_or(false)
    }

    pub fn position_sensor(&self) -> Sensor<u8> {
        self.motor.position.clone()
    }

    pub fn opening_sensor(&self) -> Switch {
        self.motor.is_opening.clone()
    }

    pub fn closing_sensor(&self) -> Switch {
        self.motor.is_closing.clone()
    }

    pub fn open(&self) {
        let motor = &self.motor;
        if motor.opening() {
            info!("valve already opening");
            return;
        }
        if motor.closing() {
            motor.tick();
            motor.stop();
        }
        motor.direction.set(true);
        motor.power.set(true);
        motor.is_opening.set(true);
        self.start_ticking();
    }

    pub fn close(&self) {
        let motor = &self.motor;
        if motor.closing() {
            info!("valve already closing");
            return;
        }
        if motor.opening() {
            motor.tick();
            motor.stop();
        }
        motor.direction.set(false);
        motor.power.set(true);
        motor.is_closing.set(true);
        self.start_ticking();
    }

    pub fn stop(&self) {
        self.motor.stop();
    }

    /// Advance the estimate by one step. Normally driven by the scheduler.
    pub fn tick(&self) {
        self.motor.tick();
    }

    fn start_ticking(&self) {
        let motor = &self.motor;
        if let Some(stale) = motor.task.take() {
            warn!("valve tick task already scheduled, replacing it");
            motor.scheduler.remove_task(stale);
        }
        let weak: Weak<Motor> = Rc::downgrade(motor);
        let handle = motor.scheduler.schedule_task(
            move || {
                if let Some(motor) = weak.upgrade() {
                    motor.tick();
                }
            },
            Some(motor.settings.tick_period()),
        );
        motor.task.set(Some(handle));
    }
}

impl Motor {
    fn opening(&self) -> bool {
        self.is_opening.state().unwrap_or(false)
    }

    fn closing(&self) -> bool {
        self.is_closing.state().unwrap_or(false)
    }

    fn tick(&self) {
        let step = self.settings.discretization;
        let current = self.position.state();
        let next = if self.closing() {
            let next = current.unwrap_or(FULLY_OPEN).saturating_sub(step);
            if next == FULLY_CLOSED {
                self.stop();
            }
            next
        } else if self.opening() {
            let next = current.unwrap_or(FULLY_CLOSED).saturating_add(step).min(FULLY_OPEN);
            if next == FULLY_OPEN {
                self.stop();
            }
            next
        } else {
            warn!("valve tick while not in transition");
            self.stop();
            return;
        };
        debug!(position = next, "valve moved");
        self.position.set(next);
    }

    fn stop(&self) {
        if let Some(task) = self.task.take() {
            self.scheduler.remove_task(task);
        }
        self.direction.set(false);
        self.power.set(false);
        self.is_opening.set(false);
        self.is_closing.set(false);
    }
}

impl Drop for Motor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Valve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Valve")
            .field("position", &self.position())
            .field("is_opening", &self.is_opening())
            .field("is_closing", &self.is_closing())
            .finish()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
