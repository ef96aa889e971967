//! Observable state cells.
//!
//! A [`Sensor`] holds an optional value and a list of subscribers. Writing a
//! value that differs from the current one notifies every subscriber
//! synchronously, in subscription order. The list is snapshotted before the
//! callbacks run, so a callback may subscribe, unsubscribe or write other
//! sensors without disturbing the dispatch in progress.
//!
//! Handles are cheap to clone and share one cell. Everything lives on the
//! scheduler thread, hence `Rc`/`RefCell` rather than locks.

use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

type Callback<T> = Rc<dyn Fn(&T)>;

struct Cell<T> {
    state: Option<T>,
    next_token: u64,
    subscribers: Vec<(SubscriptionToken, Callback<T>)>,
}

pub struct Sensor<T> {
    cell: Rc<RefCell<Cell<T>>>,
}

/// A boolean sensor. Starts out `false`, like a de-energised output.
pub type Switch = Sensor<bool>;

impl<T> Clone for Sensor<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Rc::clone(&self.cell),
        }
    }
}

impl<T: Clone + PartialEq + 'static> Default for Sensor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + PartialEq + 'static> Sensor<T> {
    /// A sensor with no value yet.
    pub fn new() -> Self {
        Self::from_state(None)
    }

    pub fn with_state(value: T) -> Self {
        Self::from_state(Some(value))
    }

    fn from_state(state: Option<T>) -> Self {
        Self {
            cell: Rc::new(RefCell::new(Cell {
                state,
                next_token: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    pub fn state(&self) -> Option<T> {
        self.cell.borrow().state.clone()
    }

    /// Store `value`, notifying subscribers only if it changed.
    pub fn set(&self, value: T) {
        let subscribers: Vec<Callback<T>> = {
            let mut cell = self.cell.borrow_mut();
            if cell.state.as_ref() == Some(&value) {
                return;
            }
            cell.state = Some(value.clone());
            cell.subscribers.iter().map(|(_, cb)| Rc::clone(cb)).collect()
        };
        for callback in subscribers {
            callback(&value);
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> SubscriptionToken {
        let mut cell = self.cell.borrow_mut();
        let token = SubscriptionToken(cell.next_token);
        cell.next_token += 1;
        cell.subscribers.push((token, Rc::new(callback)));
        token
    }

    /// Returns `false` if the token was not subscribed.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut cell = self.cell.borrow_mut();
        let before = cell.subscribers.len();
        cell.subscribers.retain(|(t, _)| *t != token);
        cell.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.cell.borrow().subscribers.len()
    }
}

impl Sensor<bool> {
    pub fn switch() -> Self {
        Self::with_state(false)
    }
}

impl<T: fmt::Debug> fmt::Debug for Sensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = self.cell.borrow();
        f.debug_struct("Sensor")
            .field("state", &cell.state)
            .field("subscribers", &cell.subscribers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Type-erased view used by bind/unbind
// ---------------------------------------------------------------------------

/// A sensor whose changes can be forwarded as JSON push values.
pub trait Observable {
    fn watch(&self, callback: Box<dyn Fn(Value)>) -> SubscriptionToken;
    fn unwatch(&self, token: SubscriptionToken);
}

impl<T> Observable for Sensor<T>
where
    T: Clone + PartialEq + Serialize + 'static,
{
    fn watch(&self, callback: Box<dyn Fn(Value)>) -> SubscriptionToken {
        self.subscribe(move |value| match serde_json::to_value(value) {
            Ok(json) => callback(json),
            Err(e) => warn!("observable value not serialisable: {e}"),
        })
    }

    fn unwatch(&self, token: SubscriptionToken) {
        self.unsubscribe(token);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn recorder<T: Clone + 'static>() -> (Rc<RefCell<Vec<T>>>, impl Fn(&T) + 'static) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        (log, move |v: &T| sink.borrow_mut().push(v.clone()))
    }

    #[test]
    fn new_sensor_is_unset() {
        let s: Sensor<i64> = Sensor::new();
        assert_eq!(s.state(), None);
    }

    #[test]
    fn switch_starts_false() {
        assert_eq!(Switch::switch().state(), Some(false));
    }

    #[test]
    fn set_notifies_on_change_only() {
        let s = Sensor::with_state(1);
        let (log, cb) = recorder();
        s.subscribe(cb);

        s.set(1);
        s.set(2);
        s.set(2);
        s.set(3);

        assert_eq!(*log.borrow(), vec![2, 3]);
    }

    #[test]
    fn subscribers_called_in_order() {
        let s = Sensor::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for id in 0..3 {
            let order = Rc::clone(&order);
            s.subscribe(move |_: &i32| order.borrow_mut().push(id));
        }
        s.set(7);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let s = Sensor::new();
        let (log, cb) = recorder();
        let token = s.subscribe(cb);
        s.set(1);
        assert!(s.unsubscribe(token));
        s.set(2);
        assert_eq!(*log.borrow(), vec![1]);
        assert!(!s.unsubscribe(token));
    }

    #[test]
    fn unsubscribe_during_dispatch_keeps_snapshot() {
        let s: Sensor<i32> = Sensor::new();
        let calls = Rc::new(RefCell::new(0));

        let victim = Rc::new(RefCell::new(None));
        {
            let s2 = s.clone();
            let victim = Rc::clone(&victim);
            s.subscribe(move |_| {
                if let Some(token) = victim.borrow_mut().take() {
                    s2.unsubscribe(token);
                }
            });
        }
        {
            let calls = Rc::clone(&calls);
            let token = s.subscribe(move |_| *calls.borrow_mut() += 1);
            *victim.borrow_mut() = Some(token);
        }

        // The second subscriber is removed mid-dispatch but was in the snapshot.
        s.set(1);
        assert_eq!(*calls.borrow(), 1);
        s.set(2);
        assert_eq!(*calls.borrow(), 1);
        assert_eq!(s.subscriber_count(), 1);
    }

    #[test]
    fn subscribe_during_dispatch_applies_next_time() {
        let s: Sensor<i32> = Sensor::new();
        let late_calls = Rc::new(RefCell::new(0));
        {
            let s2 = s.clone();
            let late_calls = Rc::clone(&late_calls);
            let added = Rc::new(RefCell::new(false));
            s.subscribe(move |_| {
                if !*added.borrow() {
                    *added.borrow_mut() = true;
                    let late_calls = Rc::clone(&late_calls);
                    s2.subscribe(move |_| *late_calls.borrow_mut() += 1);
                }
            });
        }
        s.set(1);
        assert_eq!(*late_calls.borrow(), 0);
        s.set(2);
        assert_eq!(*late_calls.borrow(), 1);
    }

    #[test]
    fn observable_forwards_json() {
        let s = Sensor::with_state(false);
        let (log, cb) = recorder::<Value>();
        let token = s.watch(Box::new(move |v| cb(&v)));
        s.set(true);
        s.unwatch(token);
        s.set(false);
        assert_eq!(*log.borrow(), vec![Value::Bool(true)]);
    }
}
