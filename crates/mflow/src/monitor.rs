//! Connection monitoring
//!
//! An [`EventListener`] runs one background task per socket that waits for
//! peer events and passes each one to every registered callback. When no
//! event arrives within the poll interval the callbacks are called with
//! `None` as a heartbeat, which lets time-based callbacks such as
//! [`IdleTimeoutNotifier`] make progress without a timer of their own.

use mflow_transport::SocketEvent;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_MONITOR_POLL;

/// Default idle period before the no-client action fires
pub const DEFAULT_NO_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Callback invoked with every socket event, or `None` on a heartbeat
pub type MonitorCallback = Box<dyn FnMut(Option<&SocketEvent>) + Send>;

/// Handle returned when registering a monitor callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorId(u64);

type Callbacks = Arc<Mutex<Vec<(MonitorId, MonitorCallback)>>>;

/// Background dispatcher of socket events to monitor callbacks
pub struct EventListener {
    callbacks: Callbacks,
    next_id: u64,
    poll_interval: Duration,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl EventListener {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            callbacks: Arc::new(Mutex::new(Vec::new())),
            next_id: 0,
            poll_interval,
            task: None,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Takes effect the next time the listener starts
    pub fn set_poll_interval(&mut self, poll_interval: Duration) {
        self.poll_interval = poll_interval;
    }

    pub fn add(&mut self, callback: MonitorCallback) -> MonitorId {
        self.next_id += 1;
        let id = MonitorId(self.next_id);
        self.callbacks.lock().push((id, callback));
        id
    }

    /// Returns `false` if `id` was not registered
    pub fn remove(&mut self, id: MonitorId) -> bool {
        let mut callbacks = self.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(registered, _)| *registered != id);
        before != callbacks.len()
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.lock().is_empty()
    }

    pub fn is_listening(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Start dispatching `events`; a no-op while already listening
    pub fn start(&mut self, events: broadcast::Receiver<SocketEvent>) {
        if self.is_listening() {
            return;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(listen(
            events,
            self.callbacks.clone(),
            self.poll_interval,
            token.clone(),
        ));
        self.task = Some((token, handle));
        debug!("Connection monitor started");
    }

    /// Signal the listener task and wait for it to finish
    pub async fn stop(&mut self) {
        if let Some((token, handle)) = self.task.take() {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Connection monitor task failed: {}", e);
            }
        }
    }
}

impl Default for EventListener {
    fn default() -> Self {
        Self::new(DEFAULT_MONITOR_POLL)
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        if let Some((token, _)) = &self.task {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for EventListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListener")
            .field("callbacks", &self.len())
            .field("poll_interval", &self.poll_interval)
            .field("listening", &self.is_listening())
            .finish()
    }
}

async fn listen(
    mut events: broadcast::Receiver<SocketEvent>,
    callbacks: Callbacks,
    poll_interval: Duration,
    token: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            received = tokio::time::timeout(poll_interval, events.recv()) => received,
        };

        match received {
            Ok(Ok(event)) => {
                notify(&callbacks, Some(&event));
                if event == SocketEvent::Closed {
                    break;
                }
            }
            Ok(Err(RecvError::Lagged(missed))) => warn!("Connection monitor missed {} events", missed),
            Ok(Err(RecvError::Closed)) => break,
            Err(_) => notify(&callbacks, None),
        }
    }
    debug!("Connection monitor stopped");
}

fn notify(callbacks: &Callbacks, event: Option<&SocketEvent>) {
    for (_, callback) in callbacks.lock().iter_mut() {
        callback(event);
    }
}

/// Tracks the number of connected peers and reports it on every event and
/// heartbeat
pub struct ConnectionCountMonitor<F> {
    callback: F,
    count: usize,
}

impl<F: FnMut(usize)> ConnectionCountMonitor<F> {
    /// The callback is called once with `0` right away
    pub fn new(mut callback: F) -> Self {
        callback(0);
        Self { callback, count: 0 }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn observe(&mut self, event: Option<&SocketEvent>) {
        match event {
            Some(SocketEvent::Accepted) => {
                debug!("Client connected to socket");
                self.count += 1;
            }
            Some(SocketEvent::Disconnected) => {
                debug!("Client disconnected from socket");
                self.count = self.count.saturating_sub(1);
            }
            Some(SocketEvent::Closed) => {
                debug!("Socket was closed");
                self.count = 0;
            }
            Some(SocketEvent::Connected) | None => {}
        }
        (self.callback)(self.count);
    }
}

impl<F: FnMut(usize) + Send + 'static> ConnectionCountMonitor<F> {
    pub fn into_callback(mut self) -> MonitorCallback {
        Box::new(move |event| self.observe(event))
    }
}

/// Calls an action once the peer count has stayed at zero for longer than
/// the timeout, then again every timeout while it stays there
pub struct IdleTimeoutNotifier<F> {
    action: F,
    timeout: Duration,
    idle_since: Option<Instant>,
}

impl<F: FnMut()> IdleTimeoutNotifier<F> {
    pub fn new(action: F, timeout: Duration) -> Self {
        Self {
            action,
            timeout,
            idle_since: None,
        }
    }

    pub fn observe(&mut self, peers: usize) {
        let now = Instant::now();
        if peers == 0 && self.idle_since.is_none() {
            self.idle_since = Some(now);
        } else if peers > 0 && self.idle_since.is_some() {
            self.idle_since = None;
        }

        if let Some(since) = self.idle_since {
            if now.duration_since(since) > self.timeout {
                info!("No clients connected for {:?}", self.timeout);
                (self.action)();
                self.idle_since = Some(now);
            }
        }
    }
}

/// Peer-count callback that runs `action` when no client has been
/// connected for `timeout`
pub fn no_clients_timeout_notifier<F>(action: F, timeout: Duration) -> impl FnMut(usize) + Send
where
    F: FnMut() + Send,
{
    let mut notifier = IdleTimeoutNotifier::new(action, timeout);
    move |peers| notifier.observe(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_monitor_reports_zero_on_creation() {
        let mut seen = Vec::new();
        ConnectionCountMonitor::new(|count| seen.push(count));
        assert_eq!(seen, vec![0]);
    }

    #[test]
    fn test_count_monitor_transitions() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut monitor = ConnectionCountMonitor::new(move |count| sink.lock().push(count));

        monitor.observe(Some(&SocketEvent::Accepted));
        monitor.observe(None);
        monitor.observe(Some(&SocketEvent::Accepted));
        monitor.observe(Some(&SocketEvent::Connected));
        monitor.observe(Some(&SocketEvent::Disconnected));
        monitor.observe(Some(&SocketEvent::Closed));
        monitor.observe(Some(&SocketEvent::Disconnected));

        assert_eq!(*seen.lock(), vec![0, 1, 1, 2, 2, 1, 0, 0]);
        assert_eq!(monitor.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_notifier_resets_when_peer_arrives() {
        let mut fired = 0;
        let mut notifier = IdleTimeoutNotifier::new(|| fired += 1, Duration::from_millis(100));

        notifier.observe(0);
        tokio::time::advance(Duration::from_millis(80)).await;
        notifier.observe(1);
        tokio::time::advance(Duration::from_millis(80)).await;
        notifier.observe(0);
        tokio::time::advance(Duration::from_millis(80)).await;
        notifier.observe(0);
        drop(notifier);

        assert_eq!(fired, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_notifier_rearms() {
        let timeout = Duration::from_millis(100);
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let start = Instant::now();
        let mut notifier = IdleTimeoutNotifier::new(move || sink.lock().push(start.elapsed()), timeout);

        notifier.observe(1);
        notifier.observe(0);
        for _ in 0..25 {
            tokio::time::advance(Duration::from_millis(10)).await;
            notifier.observe(0);
        }

        let fired = fired.lock().clone();
        assert!(fired.len() >= 2, "fired {} times", fired.len());
        let gap = fired[1] - fired[0];
        assert!(gap > timeout && gap <= timeout + Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_listener_start_is_idempotent() {
        let (tx, _) = broadcast::channel(8);
        let mut listener = EventListener::new(Duration::from_millis(10));
        listener.add(Box::new(|_| {}));

        listener.start(tx.subscribe());
        listener.start(tx.subscribe());
        assert!(listener.is_listening());

        listener.stop().await;
        assert!(!listener.is_listening());
    }

    #[tokio::test]
    async fn test_listener_ends_on_closed() {
        let (tx, _) = broadcast::channel(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let mut listener = EventListener::new(Duration::from_secs(60));
        listener.add(Box::new(move |event| {
            if let Some(event) = event {
                sink.lock().push(event.clone());
            }
        }));
        listener.start(tx.subscribe());

        tx.send(SocketEvent::Accepted).unwrap();
        tx.send(SocketEvent::Closed).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while listener.is_listening() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!listener.is_listening());
        assert_eq!(*seen.lock(), vec![SocketEvent::Accepted, SocketEvent::Closed]);
    }
}
