//! Asynchronous command client for one device.
//!
//! Requests carry no identifier, only the command name, so replies are
//! matched to pending requests of the same name in the order they were
//! issued. Every other key in an inbound frame is a push and is fanned out to
//! the subscribers registered for it.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use watercounter_wire::{envelope, Arguments, Peer, Request};

use crate::transport::{Inbound, Transport, TransportError};

/// Subscriber key that receives every inbound frame whole.
pub const DATA_RECEIVED: &str = "data_received";

pub const DEFAULT_RETRY_COUNT: u32 = 5;
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("Failed to deliver `{cmd}` command: {reason}")]
    Delivery { cmd: String, reason: String },

    #[error("No response to `{cmd}` command")]
    Timeout { cmd: String },

    /// The device answered with `{"err": ...}`.
    #[error("Command response: {0}")]
    Remote(String),

    #[error("{0}")]
    Usage(String),

    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("`{cmd}` command abandoned: client stopped")]
    Closed { cmd: String },
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Delivery { .. } | Self::Timeout { .. })
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Pending {
    id: u64,
    reply: oneshot::Sender<Result<Value, String>>,
}

#[derive(Default)]
struct Shared {
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, VecDeque<Pending>>>,
    subscribers: Mutex<HashMap<String, Vec<(SubscriberId, Callback)>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn register(&self, cmd: &str) -> (u64, oneshot::Receiver<Result<Value, String>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        lock(&self.pending)
            .entry(cmd.to_string())
            .or_default()
            .push_back(Pending { id, reply });
        (id, rx)
    }

    fn cancel(&self, cmd: &str, id: u64) {
        let mut pending = lock(&self.pending);
        if let Some(queue) = pending.get_mut(cmd) {
            queue.retain(|p| p.id != id);
            if queue.is_empty() {
                pending.remove(cmd);
            }
        }
    }

    /// Oldest request still waiting for `cmd`.
    fn take(&self, cmd: &str) -> Option<Pending> {
        let mut pending = lock(&self.pending);
        let queue = pending.get_mut(cmd)?;
        let first = queue.pop_front();
        if queue.is_empty() {
            pending.remove(cmd);
        }
        first
    }

    fn pending_count(&self) -> usize {
        lock(&self.pending).values().map(VecDeque::len).sum()
    }

    /// Call every subscriber of `key`. Returns false if there were none.
    fn notify(&self, key: &str, value: &Value) -> bool {
        let callbacks: Vec<Callback> = match lock(&self.subscribers).get(key) {
            Some(subs) if !subs.is_empty() => subs.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            _ => return false,
        };
        for callback in callbacks {
            callback(value);
        }
        true
    }

    fn on_frame(&self, payload: &[u8]) {
        let frame = match envelope::parse_frame(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("discarding frame: {e}");
                return;
            }
        };
        let whole = Value::Object(frame.clone());
        self.notify(DATA_RECEIVED, &whole);

        for (key, value) in frame {
            if let Some(pending) = envelope::command_of(&key).and_then(|cmd| self.take(cmd)) {
                // the caller may have timed out in the meantime
                let _ = pending.reply.send(envelope::decode_response(value));
                continue;
            }
            if !self.notify(&key, &value) {
                debug!("No callback for {whole}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Listener {
    task: JoinHandle<()>,
    runtime: Handle,
}

pub struct CommandClient<T: Transport> {
    transport: Arc<T>,
    device: Peer,
    retry_count: u32,
    timeout: Duration,
    shared: Arc<Shared>,
    listener: Mutex<Option<Listener>>,
}

impl<T: Transport> CommandClient<T> {
    pub fn new(transport: Arc<T>, device: Peer) -> Self {
        Self {
            transport,
            device,
            retry_count: DEFAULT_RETRY_COUNT,
            timeout: DEFAULT_RESPONSE_TIMEOUT,
            shared: Arc::new(Shared::default()),
            listener: Mutex::new(None),
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn device(&self) -> Peer {
        self.device
    }

    /// Start routing inbound frames. Calling it again keeps the running
    /// listener. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), ClientError> {
        let runtime = Handle::try_current()
            .map_err(|_| ClientError::Usage("client must be started inside a tokio runtime".into()))?;
        let mut listener = lock(&self.listener);
        if listener.is_some() {
            debug!(device = %self.device, "client already started");
            return Ok(());
        }
        let inbound = self.transport.subscribe();
        let task = runtime.spawn(listen(inbound, self.device, Arc::clone(&self.shared)));
        *listener = Some(Listener { task, runtime });
        info!(device = %self.device, "command client started");
        Ok(())
    }

    /// Detach from the transport. Requests still waiting fail with
    /// [`ClientError::Closed`].
    pub fn stop(&self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.task.abort();
            lock(&self.shared.pending).clear();
            info!(device = %self.device, "command client stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        lock(&self.listener).is_some()
    }

    pub fn add_subscriber(
        &self,
        key: &str,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> SubscriberId {
        let id = SubscriberId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: Callback = Arc::new(callback);
        lock(&self.shared.subscribers)
            .entry(key.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    pub fn remove_subscriber(&self, id: SubscriberId) -> bool {
        let mut subscribers = lock(&self.shared.subscribers);
        let mut found = false;
        subscribers.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|(sid, _)| *sid != id);
            found |= subs.len() != before;
            !subs.is_empty()
        });
        found
    }

    /// Requests waiting for a reply.
    pub fn pending(&self) -> usize {
        self.shared.pending_count()
    }

    pub async fn command(&self, cmd: &str, args: Arguments) -> Result<Value, ClientError> {
        self.command_with_retry(cmd, args, self.retry_count).await
    }

    /// Send `cmd`, resending it after a delivery failure or a timeout until
    /// `retry_count` attempts were made. The last error is returned.
    pub async fn command_with_retry(
        &self,
        cmd: &str,
        args: Arguments,
        retry_count: u32,
    ) -> Result<Value, ClientError> {
        if !self.is_started() {
            return Err(ClientError::Unavailable("command client not started".into()));
        }
        let payload = Request::new(cmd, &args)
            .to_bytes()
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        let attempts = retry_count.max(1);
        let mut attempt = 1;
        loop {
            match self.attempt(cmd, &payload).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!(cmd, attempt, "{e}, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(&self, cmd: &str, payload: &[u8]) -> Result<Value, ClientError> {
        // registered before sending: the reply may arrive before send returns
        let (id, reply) = self.shared.register(cmd);
        if let Err(e) = self.transport.send(self.device, payload.to_vec()).await {
            self.shared.cancel(cmd, id);
            return Err(match e {
                TransportError::Delivery(reason) => ClientError::Delivery {
                    cmd: cmd.to_string(),
                    reason,
                },
                TransportError::Unavailable(reason) => ClientError::Unavailable(reason),
            });
        }
        match tokio::time::timeout(self.timeout, reply).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(ClientError::Remote(message)),
            Ok(Err(_)) => Err(ClientError::Closed {
                cmd: cmd.to_string(),
            }),
            Err(_) => {
                self.shared.cancel(cmd, id);
                Err(ClientError::Timeout {
                    cmd: cmd.to_string(),
                })
            }
        }
    }

    /// Blocking form of [`command`](Self::command) for threads outside the
    /// runtime. Fails at once when called from inside it.
    pub fn command_blocking(&self, cmd: &str, args: Arguments) -> Result<Value, ClientError> {
        if Handle::try_current().is_ok() {
            return Err(ClientError::Usage(format!(
                "`{cmd}` must not be called synchronously from the async runtime"
            )));
        }
        let runtime = lock(&self.listener)
            .as_ref()
            .map(|l| l.runtime.clone())
            .ok_or_else(|| ClientError::Unavailable("command client not started".into()))?;
        runtime.block_on(self.command(cmd, args))
    }
}

impl<T: Transport> Drop for CommandClient<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn listen(mut inbound: broadcast::Receiver<Inbound>, device: Peer, shared: Arc<Shared>) {
    loop {
        match inbound.recv().await {
            Ok(frame) if frame.peer == device => shared.on_frame(&frame.payload),
            Ok(frame) => debug!(peer = %frame.peer, "ignoring frame from other peer"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "inbound frames dropped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("transport closed");
                return;
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
    use crate::transport::testing::{FakeDevice, Reply, DEVICE};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn client(device: Arc<FakeDevice>) -> CommandClient<FakeDevice> {
        let client = CommandClient::new(device, DEVICE).with_timeout(Duration::from_millis(20));
        client.start().unwrap();
        client
    }

    fn ok(_: &str, _: &Value) -> Reply {
        Reply::Value(json!("OK"))
    }

    /// Round-trip one command. Frames are handled in arrival order, so every
    /// frame pushed before the call has been routed once it returns.
    async fn flush(client: &CommandClient<FakeDevice>) {
        client.command("help", Arguments::new()).await.unwrap();
    }

    // -- commands -----------------------------------------------------------

    #[tokio::test]
    async fn command_arguments_on_the_wire() {
        let device = FakeDevice::new(ok);
        let client = client(Arc::clone(&device));

        client.command("bind", Arguments::new()).await.unwrap();
        client.command("stop", Arguments::new().arg(0)).await.unwrap();
        client.command("counter", Arguments::new().arg(1).arg(55)).await.unwrap();
        client
            .command("close", Arguments::new().kwarg("number", 2))
            .await
            .unwrap();
        assert_eq!(
            client
                .command("valve", Arguments::new().arg(2).kwarg("state", true))
                .await
                .unwrap(),
            json!("OK")
        );

        let requests = device.requests.lock().unwrap().clone();
        assert_eq!(
            requests,
            vec![
                ("bind".to_string(), Value::Null),
                ("stop".to_string(), json!(0)),
                ("counter".to_string(), json!([1, 55])),
                ("close".to_string(), json!({"number": 2})),
                ("valve".to_string(), json!([[2], {"state": true}])),
            ]
        );
    }

    #[tokio::test]
    async fn same_name_requests_resolve_in_order() {
        let device = FakeDevice::new(|_, args| Reply::Value(args["number"].clone()));
        let client = client(device);

        let (a, b) = tokio::join!(
            client.command("open", Arguments::new().kwarg("number", 0)),
            client.command("open", Arguments::new().kwarg("number", 1)),
        );
        assert_eq!((a.unwrap(), b.unwrap()), (json!(0), json!(1)));
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn remote_error_is_not_retried() {
        let device = FakeDevice::new(|_, _| Reply::Error("Test error".into()));
        let client = client(Arc::clone(&device));

        let err = client.command("bind", Arguments::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "Command response: Test error");
        assert_eq!(device.count("bind"), 1);
    }

    #[tokio::test]
    async fn not_started_is_unavailable() {
        let device = FakeDevice::new(ok);
        let client = CommandClient::new(Arc::clone(&device), DEVICE);
        assert!(matches!(
            client.command("help", Arguments::new()).await,
            Err(ClientError::Unavailable(_))
        ));
        assert_eq!(device.count("help"), 0);
    }

    // -- retries ------------------------------------------------------------

    #[tokio::test]
    async fn timeout_retried_until_exhausted() {
        let device = FakeDevice::new(|_, _| Reply::Silent);
        let client = client(Arc::clone(&device));

        let err = client
            .command_with_retry("bind", Arguments::new(), 7)
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::Timeout { cmd: "bind".into() });
        assert_eq!(err.to_string(), "No response to `bind` command");
        assert_eq!(device.count("bind"), 7);
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn delivery_failure_retried_until_exhausted() {
        let device = FakeDevice::new(|_, _| {
            Reply::Fail(TransportError::Delivery("Failed to deliver packet".into()))
        });
        let client = client(Arc::clone(&device));

        let err = client
            .command_with_retry("bind", Arguments::new(), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Delivery { .. }));
        assert!(err.to_string().contains("Failed to deliver packet"));
        assert_eq!(device.count("bind"), 3);
    }

    #[tokio::test]
    async fn retry_recovers_after_lost_reply() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let device = FakeDevice::new(move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Reply::Silent
            } else {
                Reply::Value(json!(12.5))
            }
        });
        let client = client(Arc::clone(&device));

        assert_eq!(client.command("uptime", Arguments::new()).await.unwrap(), json!(12.5));
        assert_eq!(device.count("uptime"), 2);
    }

    #[tokio::test]
    async fn unavailable_is_not_retried() {
        let device =
            FakeDevice::new(|_, _| Reply::Fail(TransportError::Unavailable("no broker".into())));
        let client = client(Arc::clone(&device));

        assert!(matches!(
            client.command("bind", Arguments::new()).await,
            Err(ClientError::Unavailable(_))
        ));
        assert_eq!(device.count("bind"), 1);
    }

    // -- subscribers --------------------------------------------------------

    #[tokio::test]
    async fn pushes_reach_subscribers() {
        let device = FakeDevice::new(ok);
        let client = client(Arc::clone(&device));

        let values = Arc::new(Mutex::new(Vec::new()));
        let frames = Arc::new(Mutex::new(Vec::new()));
        {
            let values = Arc::clone(&values);
            client.add_subscriber("test_data", move |v| values.lock().unwrap().push(v.clone()));
        }
        {
            let frames = Arc::clone(&frames);
            client.add_subscriber(DATA_RECEIVED, move |v| frames.lock().unwrap().push(v.clone()));
        }

        device.push(json!({"test_data": "test_value"}));
        device.push(json!({"test_data2": "test_value2"}));
        flush(&client).await;

        assert_eq!(*values.lock().unwrap(), vec![json!("test_value")]);
        assert_eq!(
            frames.lock().unwrap()[..2],
            [json!({"test_data": "test_value"}), json!({"test_data2": "test_value2"})]
        );
    }

    #[tokio::test]
    async fn unexpected_response_is_a_push() {
        let device = FakeDevice::new(ok);
        let client = client(Arc::clone(&device));

        let hits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&hits);
        client.add_subscriber("test_resp", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        device.push(json!({"test_resp": "Passed"}));
        device.push_raw(b"not json");
        flush(&client).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn removed_subscriber_not_called() {
        let device = FakeDevice::new(ok);
        let client = client(Arc::clone(&device));

        let hits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&hits);
        let id = client.add_subscriber("counter_0", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        assert!(client.remove_subscriber(id));
        assert!(!client.remove_subscriber(id));

        device.push(json!({"counter_0": 5}));
        flush(&client).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    // -- lifecycle ----------------------------------------------------------

    #[tokio::test]
    async fn double_start_keeps_listener() {
        let device = FakeDevice::new(ok);
        let client = client(Arc::clone(&device));
        client.start().unwrap();
        assert_eq!(client.command("help", Arguments::new()).await.unwrap(), json!("OK"));
    }

    #[tokio::test]
    async fn stop_abandons_pending_requests() {
        let device = FakeDevice::new(|_, _| Reply::Silent);
        let client = Arc::new(
            CommandClient::new(Arc::clone(&device), DEVICE).with_timeout(Duration::from_secs(5)),
        );
        client.start().unwrap();

        let waiting = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.command_with_retry("bind", Arguments::new(), 1).await })
        };
        while client.pending() == 0 {
            tokio::task::yield_now().await;
        }
        client.stop();
        assert!(!client.is_started());
        assert_eq!(
            waiting.await.unwrap(),
            Err(ClientError::Closed { cmd: "bind".into() })
        );
    }

    // -- blocking -----------------------------------------------------------

    #[tokio::test]
    async fn blocking_call_inside_runtime_is_usage_error() {
        let device = FakeDevice::new(ok);
        let client = client(Arc::clone(&device));
        assert!(matches!(
            client.command_blocking("help", Arguments::new()),
            Err(ClientError::Usage(_))
        ));
        assert_eq!(device.count("help"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_call_from_worker_thread() {
        let device = FakeDevice::new(|_, _| Reply::Value(json!(["help", "test"])));
        let client = Arc::new(client(device));

        let (tx, rx) = oneshot::channel();
        let worker = Arc::clone(&client);
        std::thread::spawn(move || {
            let _ = tx.send(worker.command_blocking("help", Arguments::new()));
        });
        assert_eq!(rx.await.unwrap().unwrap(), json!(["help", "test"]));
    }
}
