//! Common test helpers for the mflow crates
//!
//! This crate provides:
//! - Unique in-process addresses and free TCP ports
//! - Condition-based waiting (no hardcoded sleeps)
//! - Builders for raw multipart messages
//! - Collectors for monitor callbacks

use bytes::Bytes;
use mflow_core::handlers::RAW;
use mflow_transport::{SendOutcome, Transport};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Addresses
// ============================================================================

static NEXT_ADDRESS: AtomicUsize = AtomicUsize::new(0);

/// An `inproc://` address no other test uses
pub fn unique_address(prefix: &str) -> String {
    format!("inproc://{}-{}", prefix, NEXT_ADDRESS.fetch_add(1, Ordering::Relaxed))
}

/// Find an available TCP port for testing
pub async fn find_available_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Wait for an atomic counter to reach a target value
pub async fn wait_for_count(counter: &AtomicUsize, target: usize, max_wait: Duration) -> bool {
    wait_for(
        || async { counter.load(Ordering::SeqCst) >= target },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

/// Wait for a boolean flag to become true
pub async fn wait_for_flag(flag: &AtomicBool, max_wait: Duration) -> bool {
    wait_for(
        || async { flag.load(Ordering::SeqCst) },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

// ============================================================================
// Messages
// ============================================================================

/// Serialize a JSON value into one frame
pub fn json_frame(value: &Value) -> Bytes {
    Bytes::from(serde_json::to_vec(value).unwrap())
}

/// Header frame of a `raw-1.0` message
pub fn raw_header(frame: u64) -> Bytes {
    json_frame(&json!({"htype": RAW, "frame": frame}))
}

/// `raw-1.0` message: header plus one segment of `len` bytes
pub fn raw_message(frame: u64, len: usize) -> Vec<Bytes> {
    vec![raw_header(frame), Bytes::from(vec![frame as u8; len])]
}

/// Send `frames` as one multipart message, blocking
pub async fn send_message(transport: &mut dyn Transport, frames: &[Bytes]) {
    let last = frames.len().saturating_sub(1);
    for (i, frame) in frames.iter().enumerate() {
        let outcome = transport.send_frame(frame.clone(), i < last, true).await.unwrap();
        assert_eq!(outcome, SendOutcome::Sent, "frame {} was not queued", i);
    }
}

// ============================================================================
// Collectors
// ============================================================================

/// Collects values handed to a monitor callback
#[derive(Clone)]
pub struct Collector<T> {
    values: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + 'static> Collector<T> {
    pub fn new() -> Self {
        Self {
            values: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a callback that records every value
    pub fn callback(&self) -> impl FnMut(T) + Send + 'static {
        let values = self.values.clone();
        move |value| values.lock().push(value)
    }

    pub fn values(&self) -> Vec<T> {
        self.values.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }

    pub fn last(&self) -> Option<T> {
        self.values.lock().last().cloned()
    }

    /// Wait until `check` holds for the collected values
    pub async fn wait_until<F>(&self, check: F, max_wait: Duration) -> bool
    where
        F: Fn(&[T]) -> bool,
    {
        let check = &check;
        let values = self.values.clone();
        wait_for(
            move || {
                let values = values.clone();
                async move { check(values.lock().as_slice()) }
            },
            DEFAULT_CHECK_INTERVAL,
            max_wait,
        )
        .await
    }
}

impl<T: Clone + Send + 'static> Default for Collector<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse consecutive repeats, e.g. the peer count reported on every
/// heartbeat
pub fn dedup<T: PartialEq + Clone>(values: &[T]) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(values.len());
    for value in values {
        if out.last() != Some(value) {
            out.push(value.clone());
        }
    }
    out
}
