//! Named-command dispatcher.
//!
//! Each command declares its parameters up front. Inbound arguments are bound
//! against that schema before the handler runs, and binding failures are
//! reported with the exact wording deployed hosts already parse, e.g.
//!
//! ```text
//! cmd_valve() missing 1 required positional argument: 'number'
//! cmd_uptime() got an unexpected keyword argument 'number'
//! cmd_counter() takes from 3 to 4 positional arguments but 5 were given
//! ```
//!
//! Positional counts include two implicit leading parameters (the handler's
//! receiver and the sender) so the numbers match what those hosts expect.
//!
//! Alongside the registry the dispatcher owns the push bindings: `bind`
//! subscribes a peer to every registered observable and each change is sent
//! to it as `{"<key>": value}`.

use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use watercounter_wire::envelope::{self, Arguments, Request};
use watercounter_wire::{Peer, ProtocolError};

use crate::logging::LogForwarder;
use crate::observable::{Observable, SubscriptionToken};
use crate::radio::{Board, Outbox, Radio};
use crate::scheduler::Scheduler;

/// Receiver and sender, which every handler takes before its own parameters.
const IMPLICIT_PARAMS: usize = 2;

pub const OK: &str = "OK";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Invocation failure, reported to the caller as `{"err": message}`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("No such command")]
    NotFound,

    #[error("{0}")]
    Arity(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// Parameter schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub name: &'static str,
    pub required: bool,
}

pub const fn required(name: &'static str) -> Param {
    Param {
        name,
        required: true,
    }
}

pub const fn optional(name: &'static str) -> Param {
    Param {
        name,
        required: false,
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Signature {
    Fixed(&'static [Param]),
    /// Accepts anything; the handler reads [`Call::rest`].
    Variadic,
}

/// Arguments bound to a command's parameters.
#[derive(Debug)]
pub struct Call {
    pub sender: Peer,
    params: &'static [Param],
    values: Vec<Option<Value>>,
    pub rest: Arguments,
}

impl Call {
    /// Bound value of parameter `name`. JSON `null` counts as absent.
    pub fn value(&self, name: &str) -> Option<&Value> {
        let index = self.params.iter().position(|p| p.name == name)?;
        self.values
            .get(index)?
            .as_ref()
            .filter(|v| !v.is_null())
    }

    pub fn int(&self, name: &str) -> Result<Option<i64>, CommandError> {
        self.value(name)
            .map(|v| {
                v.as_i64().ok_or_else(|| {
                    CommandError::InvalidArgument(format!("argument '{name}' must be an integer"))
                })
            })
            .transpose()
    }

    pub fn number(&self, name: &str) -> Result<Option<f64>, CommandError> {
        self.value(name)
            .map(|v| {
                v.as_f64().ok_or_else(|| {
                    CommandError::InvalidArgument(format!("argument '{name}' must be a number"))
                })
            })
            .transpose()
    }

    pub fn str(&self, name: &str) -> Result<Option<&str>, CommandError> {
        self.value(name)
            .map(|v| {
                v.as_str().ok_or_else(|| {
                    CommandError::InvalidArgument(format!("argument '{name}' must be a string"))
                })
            })
            .transpose()
    }

    pub fn required_int(&self, name: &str) -> Result<i64, CommandError> {
        self.int(name)?.ok_or_else(|| missing(name))
    }

    pub fn required_str(&self, name: &str) -> Result<&str, CommandError> {
        self.str(name)?.ok_or_else(|| missing(name))
    }

    /// Parameter `name` as a peer address, hex or raw 8-byte form.
    pub fn peer(&self, name: &str) -> Result<Option<Peer>, CommandError> {
        self.str(name)?
            .map(|s| {
                Peer::from_arg(s).ok_or_else(|| {
                    CommandError::InvalidArgument(format!("invalid peer address {s:?}"))
                })
            })
            .transpose()
    }
}

fn missing(name: &str) -> CommandError {
    CommandError::InvalidArgument(format!("argument '{name}' must not be null"))
}

/// Bind `args` against `params`, in the order a call site would: excess
/// positionals first, then keyword names, then missing required parameters.
pub fn bind_arguments(
    name: &str,
    params: &'static [Param],
    args: Arguments,
) -> Result<Vec<Option<Value>>, CommandError> {
    let given = args.positional.len();
    if given > params.len() {
        let min = params.iter().filter(|p| p.required).count() + IMPLICIT_PARAMS;
        let max = params.len() + IMPLICIT_PARAMS;
        let given = given + IMPLICIT_PARAMS;
        let takes = if min == max {
            format!("{max} positional argument{}", plural(max))
        } else {
            format!("from {min} to {max} positional arguments")
        };
        return Err(CommandError::Arity(format!(
            "cmd_{name}() takes {takes} but {given} were given"
        )));
    }

    let mut values: Vec<Option<Value>> = args.positional.into_iter().map(Some).collect();
    values.resize(params.len(), None);

    for (key, value) in args.keyword {
        match params.iter().position(|p| p.name == key) {
            None => {
                return Err(CommandError::Arity(format!(
                    "cmd_{name}() got an unexpected keyword argument '{key}'"
                )))
            }
            Some(i) if values[i].is_some() => {
                return Err(CommandError::Arity(format!(
                    "cmd_{name}() got multiple values for argument '{key}'"
                )))
            }
            Some(i) => values[i] = Some(value),
        }
    }

    let absent: Vec<&str> = params
        .iter()
        .zip(&values)
        .filter(|(p, v)| p.required && v.is_none())
        .map(|(p, _)| p.name)
        .collect();
    if !absent.is_empty() {
        return Err(CommandError::Arity(format!(
            "cmd_{name}() missing {} required positional argument{}: {}",
            absent.len(),
            plural(absent.len()),
            quote_names(&absent)
        )));
    }
    Ok(values)
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// `'a'`, `'a' and 'b'`, `'a', 'b', and 'c'`.
fn quote_names(names: &[&str]) -> String {
    let quoted: Vec<String> = names.iter().map(|n| format!("'{n}'")).collect();
    match quoted.as_slice() {
        [] => String::new(),
        [one] => one.clone(),
        [a, b] => format!("{a} and {b}"),
        [init @ .., last] => format!("{}, and {last}", init.join(", ")),
    }
}

// ---------------------------------------------------------------------------
// Uptime
// ---------------------------------------------------------------------------

/// Negative seconds since boot until the host supplies the boot epoch.
struct Uptime {
    scheduler: Scheduler,
    boot_ms: u64,
    epoch: std::cell::Cell<Option<f64>>,
}

impl Uptime {
    fn value(&self) -> f64 {
        match self.epoch.get() {
            Some(epoch) => epoch,
            None => 0.0 - (self.scheduler.now_ms() - self.boot_ms) as f64 / 1000.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

type HandlerFn = Rc<dyn Fn(&Call) -> Result<Value, CommandError>>;

#[derive(Debug, Clone, Copy)]
enum Builtin {
    Help,
    Logger,
    Atcmd,
    SoftReset,
    ResetCause,
    UniqueId,
    Uptime,
    Bind,
    Unbind,
    Test,
}

const BUILTINS: &[(&str, Signature, Builtin)] = &[
    ("help", Signature::Fixed(&[]), Builtin::Help),
    (
        "logger",
        Signature::Fixed(&[optional("level"), optional("target")]),
        Builtin::Logger,
    ),
    (
        "atcmd",
        Signature::Fixed(&[required("cmd"), optional("value")]),
        Builtin::Atcmd,
    ),
    ("soft_reset", Signature::Fixed(&[]), Builtin::SoftReset),
    ("reset_cause", Signature::Fixed(&[]), Builtin::ResetCause),
    ("unique_id", Signature::Fixed(&[]), Builtin::UniqueId),
    (
        "uptime",
        Signature::Fixed(&[optional("value")]),
        Builtin::Uptime,
    ),
    ("bind", Signature::Fixed(&[optional("target")]), Builtin::Bind),
    (
        "unbind",
        Signature::Fixed(&[optional("target")]),
        Builtin::Unbind,
    ),
    ("test", Signature::Variadic, Builtin::Test),
];

enum Handler {
    Builtin(Builtin),
    Custom(HandlerFn),
}

struct Command {
    signature: Signature,
    handler: Handler,
}

pub struct Dispatcher {
    outbox: Outbox,
    board: Rc<dyn Board>,
    scheduler: Scheduler,
    logs: Arc<LogForwarder>,
    uptime: Rc<Uptime>,
    commands: BTreeMap<String, Command>,
    observables: Vec<(String, Box<dyn Observable>)>,
    bindings: RefCell<BTreeMap<Peer, Vec<(usize, SubscriptionToken)>>>,
}

impl Dispatcher {
    /// Build a dispatcher with the built-in commands registered. The boot
    /// announcement goes out on the first scheduler pass.
    pub fn new(
        radio: Rc<dyn Radio>,
        board: Rc<dyn Board>,
        scheduler: Scheduler,
        logs: Arc<LogForwarder>,
    ) -> Self {
        let outbox = Outbox::new(radio, scheduler.clone());
        let uptime = Rc::new(Uptime {
            scheduler: scheduler.clone(),
            boot_ms: scheduler.now_ms(),
            epoch: std::cell::Cell::new(None),
        });

        let commands = BUILTINS
            .iter()
            .map(|(name, signature, builtin)| {
                (
                    name.to_string(),
                    Command {
                        signature: *signature,
                        handler: Handler::Builtin(*builtin),
                    },
                )
            })
            .collect();

        {
            let outbox = outbox.clone();
            let uptime = Rc::clone(&uptime);
            scheduler.schedule_task(
                move || {
                    info!("announcing boot to coordinator");
                    outbox.send(Peer::COORDINATOR, &json!({ "uptime": uptime.value() }));
                },
                None,
            );
        }

        Self {
            outbox,
            board,
            scheduler,
            logs,
            uptime,
            commands,
            observables: Vec::new(),
            bindings: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn register(
        &mut self,
        name: &str,
        params: &'static [Param],
        handler: impl Fn(&Call) -> Result<Value, CommandError> + 'static,
    ) {
        if self.commands.contains_key(name) {
            warn!(cmd = name, "command registered twice, replacing");
        }
        self.commands.insert(
            name.to_string(),
            Command {
                signature: Signature::Fixed(params),
                handler: Handler::Custom(Rc::new(handler)),
            },
        );
    }

    /// Make `observable` available to `bind` under `key`.
    pub fn register_observable(
        &mut self,
        key: impl Into<String>,
        observable: impl Observable + 'static,
    ) {
        self.observables.push((key.into(), Box::new(observable)));
    }

    pub fn command_names(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }

    pub fn observable_keys(&self) -> Vec<&str> {
        self.observables.iter().map(|(k, _)| k.as_str()).collect()
    }

    // -- message loop -------------------------------------------------------

    /// One dispatch cycle: forward queued log records, then handle at most
    /// one inbound request. Returns whether a request was handled.
    pub fn update(&self) -> Result<bool, ProtocolError> {
        self.flush_logs();

        let Some(inbound) = self.outbox.radio().receive() else {
            return Ok(false);
        };
        let request = Request::from_slice(&inbound.payload)?;
        debug!(peer = %inbound.sender, cmd = %request.cmd, "request received");

        let outcome = self.invoke(&request.cmd, inbound.sender, request.arguments());
        if let Err(e) = &outcome {
            warn!(peer = %inbound.sender, cmd = %request.cmd, "command failed: {e}");
        }
        let reply = envelope::encode_response(&request.cmd, outcome.map_err(|e| e.to_string()));
        self.outbox.send(inbound.sender, &reply);
        Ok(true)
    }

    pub fn invoke(&self, cmd: &str, sender: Peer, args: Arguments) -> Result<Value, CommandError> {
        let command = self.commands.get(cmd).ok_or(CommandError::NotFound)?;
        let call = match command.signature {
            Signature::Fixed(params) => Call {
                sender,
                params,
                values: bind_arguments(cmd, params, args)?,
                rest: Arguments::new(),
            },
            Signature::Variadic => Call {
                sender,
                params: &[],
                values: Vec::new(),
                rest: args,
            },
        };
        match &command.handler {
            Handler::Builtin(builtin) => self.builtin(*builtin, &call),
            Handler::Custom(handler) => handler(&call),
        }
    }

    fn flush_logs(&self) {
        if let Some((target, records)) = self.logs.drain() {
            for record in records {
                let frame = json!({ "log": { "msg": record.msg, "sev": record.sev } });
                if !self.outbox.send_quiet(target, &frame) {
                    // link is down; the rest of this batch is dropped
                    break;
                }
            }
        }
    }

    // -- built-ins ----------------------------------------------------------

    fn builtin(&self, builtin: Builtin, call: &Call) -> Result<Value, CommandError> {
        match builtin {
            Builtin::Help => Ok(Value::from(self.command_names())),
            Builtin::Logger => {
                if let Some(level) = call.int("level")? {
                    self.logs.set_level(level);
                }
                let target = call.peer("target")?.unwrap_or(call.sender);
                self.logs.set_target(Some(target));
                Ok(Value::from(OK))
            }
            Builtin::Atcmd => {
                let cmd = call.required_str("cmd")?;
                self.outbox
                    .radio()
                    .atcmd(cmd, call.value("value"))
                    .map_err(|e| CommandError::Failed(e.to_string()))
            }
            Builtin::SoftReset => {
                info!("soft reset requested");
                let board = Rc::clone(&self.board);
                self.scheduler.schedule_task(move || board.soft_reset(), None);
                Ok(Value::from(OK))
            }
            Builtin::ResetCause => Ok(Value::from(self.board.reset_cause())),
            Builtin::UniqueId => Ok(Value::from(self.outbox.radio().unique_id().to_string())),
            Builtin::Uptime => match call.number("value")? {
                Some(epoch) => {
                    info!(epoch, "boot epoch set");
                    self.uptime.epoch.set(Some(epoch));
                    Ok(Value::from(OK))
                }
                None => Ok(Value::from(self.uptime.value())),
            },
            Builtin::Bind => {
                self.bind(call.peer("target")?.unwrap_or(call.sender));
                Ok(Value::from(OK))
            }
            Builtin::Unbind => {
                self.unbind(call.peer("target")?.unwrap_or(call.sender));
                Ok(Value::from(OK))
            }
            Builtin::Test => Ok(json!({
                "args": call.rest.positional,
                "kwargs": call.rest.keyword,
            })),
        }
    }

    // -- bindings -----------------------------------------------------------

    /// Push every observable change to `target`. Binding twice is a no-op.
    pub fn bind(&self, target: Peer) {
        let mut bindings = self.bindings.borrow_mut();
        if bindings.contains_key(&target) {
            debug!(peer = %target, "already bound");
            return;
        }
        let tokens = self
            .observables
            .iter()
            .enumerate()
            .map(|(index, (key, observable))| {
                let outbox = self.outbox.clone();
                let key = key.clone();
                let token = observable.watch(Box::new(move |value| {
                    outbox.send(target, &envelope::encode_push(&key, value));
                }));
                (index, token)
            })
            .collect();
        bindings.insert(target, tokens);
        info!(peer = %target, "bound");
    }

    pub fn unbind(&self, target: Peer) {
        if let Some(tokens) = self.bindings.borrow_mut().remove(&target) {
            self.release(tokens);
            info!(peer = %target, "unbound");
        }
    }

    pub fn unbind_all(&self) {
        let all = std::mem::take(&mut *self.bindings.borrow_mut());
        for tokens in all.into_values() {
            self.release(tokens);
        }
    }

    pub fn bound_peers(&self) -> Vec<Peer> {
        self.bindings.borrow().keys().copied().collect()
    }

    fn release(&self, tokens: Vec<(usize, SubscriptionToken)>) {
        for (index, token) in tokens {
            if let Some((_, observable)) = self.observables.get(index) {
                observable.unwatch(token);
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.unbind_all();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
