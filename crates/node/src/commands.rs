//! Watercounter commands: valve and counter control on top of the built-ins.
//!
//! Channels are addressed by index. Each channel's observables are exposed
//! for binding as `counter_N`, `valve_N`, `opening_N` and `closing_N`.

use serde_json::{json, Value};
use std::rc::Rc;
use tracing::info;

use crate::dispatcher::{optional, required, Call, CommandError, Dispatcher, Param, OK};
use crate::observable::Sensor;
use crate::valve::Valve;

const NUMBER: &[Param] = &[required("number")];
const NUMBER_STATE: &[Param] = &[required("number"), optional("state")];

pub fn install(dispatcher: &mut Dispatcher, counters: Vec<Sensor<u64>>, valves: Vec<Valve>) {
    for (n, counter) in counters.iter().enumerate() {
        dispatcher.register_observable(format!("counter_{n}"), counter.clone());
    }
    for (n, valve) in valves.iter().enumerate() {
        dispatcher.register_observable(format!("valve_{n}"), valve.position_sensor());
        dispatcher.register_observable(format!("opening_{n}"), valve.opening_sensor());
        dispatcher.register_observable(format!("closing_{n}"), valve.closing_sensor());
    }

    let counters: Rc<[Sensor<u64>]> = counters.into();
    let valves: Rc<[Valve]> = valves.into();

    {
        let valves = Rc::clone(&valves);
        dispatcher.register("valve", NUMBER_STATE, move |call| {
            let (n, valve) = channel(&valves, call)?;
            match call.int("state")? {
                None => Ok(json!({
                    "state": valve.position(),
                    "is_opening": valve.is_opening(),
                    "is_closing": valve.is_closing(),
                })),
                Some(state) => {
                    valve
                        .set_position(state)
                        .map_err(|e| CommandError::InvalidArgument(e.to_string()))?;
                    info!(valve = n, position = state, "valve position set");
                    Ok(Value::from(OK))
                }
            }
        });
    }
    {
        let valves = Rc::clone(&valves);
        dispatcher.register("open", NUMBER, move |call| {
            let (n, valve) = channel(&valves, call)?;
            info!(valve = n, "opening");
            valve.open();
            Ok(Value::from(OK))
        });
    }
    {
        let valves = Rc::clone(&valves);
        dispatcher.register("close", NUMBER, move |call| {
            let (n, valve) = channel(&valves, call)?;
            info!(valve = n, "closing");
            valve.close();
            Ok(Value::from(OK))
        });
    }
    dispatcher.register("stop", NUMBER, move |call| {
        let (n, valve) = channel(&valves, call)?;
        info!(valve = n, "stopping");
        valve.stop();
        Ok(Value::from(OK))
    });
    dispatcher.register("counter", NUMBER_STATE, move |call| {
        let (n, counter) = channel(&counters, call)?;
        match call.int("state")? {
            None => Ok(json!(counter.state())),
            Some(state) => {
                let value = u64::try_from(state).map_err(|_| {
                    CommandError::InvalidArgument(format!("counter value {state} is negative"))
                })?;
                info!(counter = n, value, "counter calibrated");
                counter.set(value);
                Ok(Value::from(OK))
            }
        }
    });
}

fn channel<'a, T>(items: &'a [T], call: &Call) -> Result<(usize, &'a T), CommandError> {
    let number = call.required_int("number")?;
    usize::try_from(number)
        .ok()
        .and_then(|n| items.get(n).map(|item| (n, item)))
        .ok_or_else(|| CommandError::Failed("list index out of range".into()))
}

// ===========================================================================
// Tests
// ===========================================================================
