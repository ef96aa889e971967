//! Forwarding of device log records to a peer.
//!
//! [`LogForwarder`] is a `tracing` layer. Events at or above the configured
//! severity are queued while a target peer is set; the dispatcher drains the
//! queue every pass and sends each record as
//! `{"log": {"msg": <text>, "sev": <severity>}}`.
//!
//! Severities use the numeric scale the host understands:
//! 10 debug, 20 info, 30 warning, 40 error.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use watercounter_wire::Peer;

pub const DEBUG: i64 = 10;
pub const INFO: i64 = 20;
pub const WARNING: i64 = 30;
pub const ERROR: i64 = 40;

/// Records kept while the link is slower than the log rate.
const QUEUE_LIMIT: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub msg: String,
    pub sev: i64,
}

struct Settings {
    level: i64,
    target: Option<Peer>,
    queue: VecDeque<LogRecord>,
}

/// Shared between the tracing layer (any thread) and the dispatcher.
pub struct LogForwarder {
    settings: Mutex<Settings>,
}

impl LogForwarder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            settings: Mutex::new(Settings {
                level: WARNING,
                target: None,
                queue: VecDeque::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn level(&self) -> i64 {
        self.lock().level
    }

    pub fn set_level(&self, level: i64) {
        self.lock().level = level;
    }

    pub fn target(&self) -> Option<Peer> {
        self.lock().target
    }

    pub fn set_target(&self, target: Option<Peer>) {
        let mut settings = self.lock();
        settings.target = target;
        if target.is_none() {
            settings.queue.clear();
        }
    }

    pub fn record(&self, sev: i64, msg: String) {
        let mut settings = self.lock();
        if settings.target.is_none() || sev < settings.level {
            return;
        }
        if settings.queue.len() == QUEUE_LIMIT {
            settings.queue.pop_front();
        }
        settings.queue.push_back(LogRecord { msg, sev });
    }

    /// Take everything queued, along with the peer it should go to.
    pub fn drain(&self) -> Option<(Peer, Vec<LogRecord>)> {
        let mut settings = self.lock();
        let target = settings.target?;
        if settings.queue.is_empty() {
            return None;
        }
        Some((target, settings.queue.drain(..).collect()))
    }

    pub fn layer(self: &Arc<Self>) -> ForwardLayer {
        ForwardLayer {
            forwarder: Arc::clone(self),
        }
    }
}

pub fn severity(level: &Level) -> i64 {
    match *level {
        Level::ERROR => ERROR,
        Level::WARN => WARNING,
        Level::INFO => INFO,
        Level::DEBUG => DEBUG,
        Level::TRACE => 5,
    }
}

pub struct ForwardLayer {
    forwarder: Arc<LogForwarder>,
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let sev = severity(event.metadata().level());
        // Cheap pre-check before formatting the message.
        if self.forwarder.target().is_none() || sev < self.forwarder.level() {
            return;
        }
        let mut message = MessageVisitor::default();
        event.record(&mut message);
        self.forwarder.record(sev, message.finish());
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
