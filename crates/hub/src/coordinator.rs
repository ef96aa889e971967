//! Polls one device and keeps its state in sync.
//!
//! Each refresh reads the reboot indicator, then every valve and counter.
//! When the device has restarted since the last refresh, or when the link
//! comes back after a failed refresh, the coordinator binds to the device
//! again and pushes the valve positions and known counter values back, so
//! the device resumes from the host's view of the world.
//!
//! ```text
//!              ┌──[uptime > 0]──▶ poll ──▶ publish
//! refresh ─────┤
//!              └──[uptime <= 0 after > 0 / unset]──▶ resync ──▶ poll ──▶ publish
//! ```

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use watercounter_wire::{Arguments, ResetCause};

use crate::client::{Callback, ClientError, CommandClient, SubscriberId, DATA_RECEIVED};
use crate::state::{DeviceData, PushKey, ValveData, CHANNELS};
use crate::transport::Transport;

/// Subscriber key notified after the device was found rebooted and resynced.
pub const DEVICE_RESET: &str = "device_reset";

/// Log severities used by forwarded device logs.
const SEV_INFO: i64 = 20;
const SEV_WARNING: i64 = 30;
const SEV_ERROR: i64 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// The device announced a fresh boot.
    Reboot,
    /// Data arrived while the last refresh had failed.
    Recover,
}

/// Human-readable reset cause, as shown to users.
pub fn reset_cause_text(code: i64) -> String {
    ResetCause::from_code(code).to_string()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn decode<D: DeserializeOwned>(cmd: &str, value: Value) -> Result<D, ClientError> {
    serde_json::from_value(value.clone())
        .map_err(|_| ClientError::Protocol(format!("unexpected `{cmd}` response {value}")))
}

fn now_epoch() -> f64 {
    let now = OffsetDateTime::now_utc();
    now.unix_timestamp() as f64 + f64::from(now.nanosecond()) / 1e9
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator<T: Transport> {
    client: Arc<CommandClient<T>>,
    data: Arc<watch::Sender<DeviceData>>,
    last_update_success: Arc<AtomicBool>,
    /// Set while a recovery refresh is queued, so a burst of frames after a
    /// failure asks for one refresh only.
    recover_queued: Arc<AtomicBool>,
    /// Held for a whole refresh; true until the first refresh got through
    /// the identity reads.
    first_refresh: tokio::sync::Mutex<bool>,
    reset_subscribers: Mutex<Vec<Callback>>,
    trigger_rx: Mutex<Option<mpsc::UnboundedReceiver<Trigger>>>,
    push_subscribers: Vec<SubscriberId>,
}

impl<T: Transport> Coordinator<T> {
    pub fn new(client: Arc<CommandClient<T>>) -> Self {
        let (data, _) = watch::channel(DeviceData::default());
        let data = Arc::new(data);
        let last_update_success = Arc::new(AtomicBool::new(true));
        let recover_queued = Arc::new(AtomicBool::new(false));
        let (triggers, trigger_rx) = mpsc::unbounded_channel();

        let mut push_subscribers = Vec::new();
        for key in PushKey::all() {
            let data = Arc::clone(&data);
            push_subscribers.push(client.add_subscriber(&key.key(), move |value| {
                let mut applied = true;
                data.send_if_modified(|d| {
                    let before = d.clone();
                    applied = d.apply(key, value);
                    *d != before
                });
                if !applied {
                    warn!(key = %key.key(), %value, "ignoring malformed push");
                }
            }));
        }
        {
            let triggers = triggers.clone();
            push_subscribers.push(client.add_subscriber("uptime", move |value| {
                match value.as_f64() {
                    Some(uptime) if uptime <= 0.0 => {
                        info!(uptime, "device announced a restart");
                        let _ = triggers.send(Trigger::Reboot);
                    }
                    Some(_) => {}
                    None => warn!(%value, "ignoring malformed uptime push"),
                }
            }));
        }
        {
            let peer = client.device();
            push_subscribers.push(client.add_subscriber("log", move |value| {
                device_log(&peer.to_string(), value)
            }));
        }
        {
            let last_update_success = Arc::clone(&last_update_success);
            let recover_queued = Arc::clone(&recover_queued);
            push_subscribers.push(client.add_subscriber(DATA_RECEIVED, move |_| {
                if !last_update_success.load(Ordering::SeqCst)
                    && !recover_queued.swap(true, Ordering::SeqCst)
                {
                    let _ = triggers.send(Trigger::Recover);
                }
            }));
        }

        Self {
            client,
            data,
            last_update_success,
            recover_queued,
            first_refresh: tokio::sync::Mutex::new(true),
            reset_subscribers: Mutex::new(Vec::new()),
            trigger_rx: Mutex::new(Some(trigger_rx)),
            push_subscribers,
        }
    }

    pub fn client(&self) -> &Arc<CommandClient<T>> {
        &self.client
    }

    /// Current snapshot.
    pub fn data(&self) -> DeviceData {
        self.data.borrow().clone()
    }

    /// Receiver notified on every data change.
    pub fn watch(&self) -> watch::Receiver<DeviceData> {
        self.data.subscribe()
    }

    pub fn last_update_success(&self) -> bool {
        self.last_update_success.load(Ordering::SeqCst)
    }

    /// Subscribe to a push key (`counter_N`, `valve_N`, `opening_N`,
    /// `closing_N`) or to [`DEVICE_RESET`].
    pub fn add_subscriber(&self, key: &str, callback: impl Fn(&Value) + Send + Sync + 'static) {
        if key == DEVICE_RESET {
            lock(&self.reset_subscribers).push(Arc::new(callback));
        } else {
            self.client.add_subscriber(key, callback);
        }
    }

    // -- refresh ------------------------------------------------------------

    /// Run one refresh. A failure is logged and recorded; the next
    /// successful refresh rebinds and pushes the known setpoints.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        let mut first = self.first_refresh.lock().await;
        let result = self.refresh_locked(&mut first).await;
        let was_ok = self
            .last_update_success
            .swap(result.is_ok(), Ordering::SeqCst);
        self.recover_queued.store(false, Ordering::SeqCst);
        match &result {
            Ok(()) if !was_ok => info!(device = %self.client.device(), "device link recovered"),
            Ok(()) => debug!(device = %self.client.device(), "refreshed"),
            Err(e) => warn!(device = %self.client.device(), "refresh failed: {e}"),
        }
        result
    }

    async fn refresh_locked(&self, first: &mut bool) -> Result<(), ClientError> {
        let recovering = !self.last_update_success.load(Ordering::SeqCst);
        let bound = *first || recovering;
        if bound {
            self.command("bind", Arguments::new()).await?;
        }
        if *first {
            let unique_id: Value = self.command("unique_id", Arguments::new()).await?;
            let firmware: Value = self.command("atcmd", Arguments::new().arg("VL")).await?;
            info!(device = %self.client.device(), %unique_id, %firmware, "device identified");
            self.data.send_modify(|d| {
                d.unique_id = Some(value_text(unique_id));
                d.firmware = Some(value_text(firmware));
            });
            *first = false;
        }

        let uptime: f64 = decode("uptime", self.command("uptime", Arguments::new()).await?)?;
        let previous = self.data.borrow().uptime;
        if uptime <= 0.0 && previous.map_or(true, |p| p > 0.0) {
            // a restarted device has lost every subscription
            if !bound {
                self.command("bind", Arguments::new()).await?;
            }
            self.resync(uptime).await?;
        } else {
            if recovering {
                self.push_setpoints().await?;
            }
            self.data.send_if_modified(|d| {
                let changed = d.uptime != Some(uptime);
                d.uptime = Some(uptime);
                changed
            });
        }
        self.poll().await
    }

    /// The device restarted: restore its state, then record the boot epoch.
    ///
    /// Setting the device's epoch comes last. Until it succeeds the device
    /// keeps reporting a non-positive uptime, so a resync cut short by the
    /// link is simply run again on the next refresh.
    async fn resync(&self, uptime: f64) -> Result<(), ClientError> {
        let reset_cause: i64 =
            decode("reset_cause", self.command("reset_cause", Arguments::new()).await?)?;
        let epoch = now_epoch() + uptime;
        self.push_setpoints().await?;
        self.command("uptime", Arguments::new().arg(epoch)).await?;

        let booted_at = OffsetDateTime::from_unix_timestamp(epoch as i64).ok();
        self.data.send_modify(|d| {
            d.uptime = Some(epoch);
            d.reset_cause = Some(reset_cause);
            d.booted_at = booted_at;
        });
        info!(
            device = %self.client.device(),
            cause = %reset_cause_text(reset_cause),
            booted_at = %booted_at.and_then(|t| t.format(&Rfc3339).ok()).unwrap_or_default(),
            "device restarted, state restored"
        );

        let event = json!({ "reset_cause": reset_cause, "uptime": epoch });
        let callbacks: Vec<Callback> = lock(&self.reset_subscribers).clone();
        for callback in callbacks {
            callback(&event);
        }
        Ok(())
    }

    /// Push every valve position and every known counter value to the
    /// device. A valve with unknown position is sent as `null`.
    async fn push_setpoints(&self) -> Result<(), ClientError> {
        let data = self.data();
        for (n, valve) in data.valve.iter().enumerate() {
            self.command("valve", Arguments::new().arg(n).arg(valve.state))
                .await?;
        }
        for (n, counter) in data.counter.iter().enumerate() {
            if let Some(value) = counter {
                self.command("counter", Arguments::new().arg(n).arg(*value))
                    .await?;
            }
        }
        Ok(())
    }

    async fn poll(&self) -> Result<(), ClientError> {
        let mut valves = [ValveData::default(); CHANNELS];
        let mut counters: [Option<u64>; CHANNELS] = [None; CHANNELS];
        for (n, valve) in valves.iter_mut().enumerate() {
            *valve = decode("valve", self.command("valve", Arguments::new().arg(n)).await?)?;
        }
        for (n, counter) in counters.iter_mut().enumerate() {
            *counter = decode("counter", self.command("counter", Arguments::new().arg(n)).await?)?;
        }
        self.data.send_if_modified(|d| {
            let changed = d.valve != valves || d.counter != counters;
            d.valve = valves;
            d.counter = counters;
            changed
        });
        Ok(())
    }

    async fn command(&self, cmd: &str, args: Arguments) -> Result<Value, ClientError> {
        self.client.command(cmd, args).await
    }

    // -- driving ------------------------------------------------------------

    /// Refresh every `period`, and immediately when the device reports a
    /// restart or comes back after a failed refresh. Runs until the task is
    /// aborted.
    pub async fn run(self: Arc<Self>, period: Duration) {
        let Some(mut triggers) = lock(&self.trigger_rx).take() else {
            error!("coordinator already running");
            return;
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            device = %self.client.device(),
            poll_sec = period.as_secs(),
            "coordinator started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => debug!(?trigger, "refresh requested"),
                    None => return,
                },
            }
            // errors are already logged and recorded
            let _ = self.refresh().await;
        }
    }
}

impl<T: Transport> Drop for Coordinator<T> {
    fn drop(&mut self) {
        for id in self.push_subscribers.drain(..) {
            self.client.remove_subscriber(id);
        }
    }
}

fn value_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Re-emit a forwarded device log line at its mapped level.
fn device_log(peer: &str, value: &Value) {
    let msg = value["msg"].as_str().unwrap_or_default();
    match value["sev"].as_i64().unwrap_or(SEV_INFO) {
        s if s >= SEV_ERROR => error!(peer, "device: {msg}"),
        s if s >= SEV_WARNING => warn!(peer, "device: {msg}"),
        s if s >= SEV_INFO => info!(peer, "device: {msg}"),
        _ => debug!(peer, "device: {msg}"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{FakeDevice, Reply, DEVICE};
    use std::sync::atomic::AtomicUsize;

    /// Device state behind the fake transport.
    #[derive(Default)]
    struct Sim {
        uptime: f64,
        reset_cause: i64,
        valves: [Option<u64>; CHANNELS],
        counters: [Option<u64>; CHANNELS],
        offline: bool,
        /// Stay silent on `counter` writes.
        drop_counter_writes: bool,
    }

    fn answer(sim: &Mutex<Sim>, cmd: &str, args: &Value) -> Reply {
        let mut sim = sim.lock().unwrap();
        if sim.offline || (cmd == "counter" && sim.drop_counter_writes && args.get(1).is_some()) {
            return Reply::Silent;
        }
        let n = args.get(0).or(Some(args)).and_then(Value::as_u64).unwrap_or(0) as usize;
        Reply::Value(match cmd {
            "bind" => json!("OK"),
            "atcmd" => json!("watercounter-node 0.1.0"),
            "unique_id" => json!(DEVICE.to_string()),
            "reset_cause" => json!(sim.reset_cause),
            "uptime" => match args.as_f64() {
                Some(epoch) => {
                    sim.uptime = epoch;
                    json!("OK")
                }
                None => json!(sim.uptime),
            },
            "valve" => match args.get(1) {
                Some(pos) => {
                    sim.valves[n] = pos.as_u64();
                    json!("OK")
                }
                None => json!({"state": sim.valves[n], "is_opening": false, "is_closing": false}),
            },
            "counter" => match args.get(1) {
                Some(v) => {
                    sim.counters[n] = v.as_u64();
                    json!("OK")
                }
                None => json!(sim.counters[n]),
            },
            other => return Reply::Error(format!("No such command {other}")),
        })
    }

    struct Rig {
        sim: Arc<Mutex<Sim>>,
        device: Arc<FakeDevice>,
        coordinator: Arc<Coordinator<FakeDevice>>,
    }

    fn rig(sim: Sim) -> Rig {
        let sim = Arc::new(Mutex::new(sim));
        let scripted = Arc::clone(&sim);
        let device = FakeDevice::new(move |cmd, args| answer(&scripted, cmd, args));
        let client = CommandClient::new(Arc::clone(&device), DEVICE)
            .with_retry_count(2)
            .with_timeout(Duration::from_millis(20));
        client.start().unwrap();
        let coordinator = Arc::new(Coordinator::new(Arc::new(client)));
        Rig {
            sim,
            device,
            coordinator,
        }
    }

    fn running() -> Sim {
        Sim {
            uptime: 1_700_000_000.0,
            reset_cause: 4,
            valves: [Some(0), Some(50), None],
            counters: [Some(12), Some(1007), Some(0)],
            ..Sim::default()
        }
    }

    /// Poll `cond` until it holds, failing the test after two seconds.
    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Give stray work a chance to run before asserting it did not happen.
    async fn quiesce() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // -- refresh ------------------------------------------------------------

    #[tokio::test]
    async fn first_refresh_identifies_and_polls() {
        let r = rig(running());
        r.coordinator.refresh().await.unwrap();

        assert_eq!(
            r.device.commands(),
            vec![
                "bind", "unique_id", "atcmd", "uptime", "valve", "valve", "valve", "counter",
                "counter", "counter"
            ]
        );
        let data = r.coordinator.data();
        assert_eq!(data.counter, [Some(12), Some(1007), Some(0)]);
        assert_eq!(data.valve[1].state, Some(50));
        assert_eq!(data.valve[2].state, None);
        assert_eq!(data.uptime, Some(1_700_000_000.0));
        assert_eq!(data.unique_id.as_deref(), Some("0013a20041a06e60"));
        assert_eq!(data.firmware.as_deref(), Some("watercounter-node 0.1.0"));
        assert!(r.coordinator.last_update_success());
    }

    #[tokio::test]
    async fn steady_refresh_only_polls() {
        let r = rig(running());
        r.coordinator.refresh().await.unwrap();
        r.device.clear();

        r.coordinator.refresh().await.unwrap();
        assert_eq!(r.device.count("bind"), 0);
        assert_eq!(r.device.count("unique_id"), 0);
        assert_eq!(r.device.count("uptime"), 1);
        assert_eq!(r.device.count("valve"), 3);
        assert_eq!(r.device.count("counter"), 3);
    }

    // -- reboot -------------------------------------------------------------

    #[tokio::test]
    async fn reboot_rebinds_and_restores_setpoints() {
        let r = rig(running());
        r.coordinator.refresh().await.unwrap();
        r.device.clear();

        let resets = Arc::new(Mutex::new(Vec::new()));
        {
            let resets = Arc::clone(&resets);
            r.coordinator
                .add_subscriber(DEVICE_RESET, move |v| resets.lock().unwrap().push(v.clone()));
        }
        *r.sim.lock().unwrap() = Sim {
            uptime: -30.0,
            reset_cause: 5,
            ..Sim::default()
        };

        let before = now_epoch();
        r.coordinator.refresh().await.unwrap();

        let requests = r.device.requests.lock().unwrap().clone();
        let sent: Vec<(&str, &Value)> = requests.iter().map(|(c, a)| (c.as_str(), a)).collect();
        assert_eq!(
            &sent[..9],
            &[
                ("uptime", &Value::Null),
                ("bind", &Value::Null),
                ("reset_cause", &Value::Null),
                ("valve", &json!([0, 0])),
                ("valve", &json!([1, 50])),
                ("valve", &json!([2, null])),
                ("counter", &json!([0, 12])),
                ("counter", &json!([1, 1007])),
                ("counter", &json!([2, 0])),
            ]
        );
        assert_eq!(sent[9].0, "uptime");
        let epoch = sent[9].1.as_f64().unwrap();
        assert!(epoch >= before - 30.0 && epoch <= now_epoch() - 30.0);
        assert_eq!(r.device.count("bind"), 1);

        let sim = r.sim.lock().unwrap();
        assert_eq!(sim.valves, [Some(0), Some(50), None]);
        assert_eq!(sim.counters, [Some(12), Some(1007), Some(0)]);
        drop(sim);

        let data = r.coordinator.data();
        assert_eq!(data.uptime, Some(epoch));
        assert_eq!(data.reset_cause, Some(5));
        assert!(data.booted_at.is_some());
        assert_eq!(data.counter, [Some(12), Some(1007), Some(0)]);
        assert_eq!(resets.lock().unwrap().len(), 1);
        assert_eq!(resets.lock().unwrap()[0]["reset_cause"], json!(5));
    }

    #[tokio::test]
    async fn first_refresh_of_fresh_device_records_epoch() {
        let r = rig(Sim {
            uptime: -3.0,
            reset_cause: 4,
            ..Sim::default()
        });
        r.coordinator.refresh().await.unwrap();

        // one bind only, and no counter value known yet to push back
        assert_eq!(r.device.count("bind"), 1);
        assert_eq!(r.device.count("reset_cause"), 1);
        assert_eq!(r.device.count("counter"), 3);
        let data = r.coordinator.data();
        assert!(data.uptime.unwrap() > 0.0);
        assert_eq!(data.reset_cause, Some(4));
        assert!(r.sim.lock().unwrap().uptime > 0.0);
    }

    #[tokio::test]
    async fn boot_announcement_triggers_refresh() {
        let r = rig(running());
        r.coordinator.refresh().await.unwrap();
        r.device.clear();

        let task = tokio::spawn(Arc::clone(&r.coordinator).run(Duration::from_secs(3600)));
        // the first tick refreshes right away
        wait_until("first tick", || r.device.count("counter") == 3).await;
        r.device.clear();

        r.sim.lock().unwrap().uptime = 0.0;
        r.device.push(json!({"uptime": 0.0}));
        wait_until("resync", || r.coordinator.data().reset_cause.is_some()).await;
        quiesce().await;
        task.abort();

        assert_eq!(r.device.count("bind"), 1);
        assert_eq!(r.device.count("reset_cause"), 1);
        assert!(r.coordinator.data().uptime.unwrap() > 0.0);
    }

    // -- recovery -----------------------------------------------------------

    #[tokio::test]
    async fn failed_refresh_then_recovery_pushes_setpoints() {
        let r = rig(running());
        r.coordinator.refresh().await.unwrap();

        r.sim.lock().unwrap().offline = true;
        let err = r.coordinator.refresh().await.unwrap_err();
        assert_eq!(err, ClientError::Timeout { cmd: "uptime".into() });
        assert!(!r.coordinator.last_update_success());

        r.sim.lock().unwrap().offline = false;
        r.device.clear();
        r.coordinator.refresh().await.unwrap();
        assert!(r.coordinator.last_update_success());

        let commands = r.device.commands();
        assert_eq!(&commands[..2], &["bind", "uptime"]);
        assert_eq!(r.device.count("reset_cause"), 0);
        let requests = r.device.requests.lock().unwrap().clone();
        assert!(requests.contains(&("valve".to_string(), json!([1, 50]))));
        assert!(requests.contains(&("counter".to_string(), json!([1, 1007]))));
    }

    #[tokio::test]
    async fn data_after_failure_triggers_refresh() {
        let r = rig(running());
        r.coordinator.refresh().await.unwrap();
        r.sim.lock().unwrap().offline = true;

        // first tick fails while the device is silent
        let task = tokio::spawn(Arc::clone(&r.coordinator).run(Duration::from_secs(3600)));
        wait_until("failed tick", || !r.coordinator.last_update_success()).await;

        r.sim.lock().unwrap().offline = false;
        r.device.clear();
        r.device.push(json!({"counter_0": 13}));
        wait_until("recovery", || r.coordinator.last_update_success()).await;
        quiesce().await;
        task.abort();

        // replies to the recovery refresh itself must not queue more refreshes
        assert_eq!(r.device.commands()[0], "bind");
        assert_eq!(r.device.count("bind"), 1);
        assert_eq!(r.device.count("uptime"), 1);
    }

    #[tokio::test]
    async fn interrupted_resync_is_completed_next_refresh() {
        let r = rig(running());
        r.coordinator.refresh().await.unwrap();

        let resets = Arc::new(AtomicUsize::new(0));
        {
            let resets = Arc::clone(&resets);
            r.coordinator.add_subscriber(DEVICE_RESET, move |_| {
                resets.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let mut sim = r.sim.lock().unwrap();
            sim.uptime = -30.0;
            sim.reset_cause = 5;
            sim.drop_counter_writes = true;
        }

        let err = r.coordinator.refresh().await.unwrap_err();
        assert_eq!(err, ClientError::Timeout { cmd: "counter".into() });
        // the device never got its epoch
        assert!(r.sim.lock().unwrap().uptime <= 0.0);
        assert_eq!(r.coordinator.data().reset_cause, None);
        assert_eq!(resets.load(Ordering::SeqCst), 0);

        r.sim.lock().unwrap().drop_counter_writes = false;
        r.device.clear();
        r.coordinator.refresh().await.unwrap();

        assert_eq!(r.device.count("bind"), 1);
        assert_eq!(r.device.count("reset_cause"), 1);
        assert!(r.sim.lock().unwrap().uptime > 0.0);
        let data = r.coordinator.data();
        assert_eq!(data.reset_cause, Some(5));
        assert!(data.booted_at.is_some());
        assert_eq!(resets.load(Ordering::SeqCst), 1);
    }

    // -- pushes -------------------------------------------------------------

    #[tokio::test]
    async fn pushes_update_data() {
        let r = rig(running());
        let mut rx = r.coordinator.watch();

        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            r.coordinator.add_subscriber("counter_2", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        r.device.push(json!({"counter_2": 25}));
        r.device.push(json!({"valve_0": 75, "opening_0": true}));
        wait_until("pushes", || r.coordinator.data().valve[0].is_opening).await;

        assert!(rx.has_changed().unwrap());
        let data = rx.borrow_and_update().clone();
        assert_eq!(data.counter[2], Some(25));
        assert_eq!(data.valve[0].state, Some(75));
        assert!(data.valve[0].is_opening);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    // -- reset cause --------------------------------------------------------

    #[test]
    fn reset_cause_table() {
        assert_eq!(reset_cause_text(3), "hard reset");
        assert_eq!(reset_cause_text(4), "power-on");
        assert_eq!(reset_cause_text(5), "watchdog timeout");
        assert_eq!(reset_cause_text(6), "soft reset");
        assert_eq!(reset_cause_text(9), "lockup");
        assert_eq!(reset_cause_text(11), "brownout");
        assert_eq!(reset_cause_text(7), "unknown cause 7");
    }
}
