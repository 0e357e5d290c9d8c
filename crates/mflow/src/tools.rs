//! Stream utilities: merging several streams and throughput accounting

use mflow_core::{Message, Statistics};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::Stream;

/// Pause between polling rounds of a blocking [`Merge::receive`]
const MERGE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Bytes to megabytes
pub const MB_FACTOR: f64 = 1e-6;

/// Default sampling interval of [`ThroughputStatistics`]
pub const DEFAULT_SAMPLING_INTERVAL: Duration = Duration::from_millis(200);

/// Number of samples kept by [`ThroughputStatistics`]
pub const DEFAULT_SAMPLE_CAPACITY: usize = 100;

/// Picks which stream a [`Merge`] reads next
pub trait ReceiveStrategy: Send {
    /// Index of the next stream out of `streams`
    fn next(&mut self, streams: usize) -> usize;
}

/// Cycle through the streams in order, starting with the first
#[derive(Debug, Default)]
pub struct RoundRobin {
    last: Option<usize>,
}

impl ReceiveStrategy for RoundRobin {
    fn next(&mut self, streams: usize) -> usize {
        let next = match self.last {
            None => 0,
            Some(last) => (last + 1) % streams.max(1),
        };
        self.last = Some(next);
        next
    }
}

/// Several streams read as one
pub struct Merge {
    streams: Vec<Stream>,
    strategy: Box<dyn ReceiveStrategy>,
}

impl Merge {
    pub fn new(streams: Vec<Stream>) -> Self {
        Self::with_strategy(streams, RoundRobin::default())
    }

    pub fn with_strategy(streams: Vec<Stream>, strategy: impl ReceiveStrategy + 'static) -> Self {
        Self {
            streams,
            strategy: Box::new(strategy),
        }
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut [Stream] {
        &mut self.streams
    }

    /// Poll each stream once without blocking, in strategy order.
    ///
    /// With `block` the polling repeats until some stream yields a message.
    pub async fn receive(&mut self, block: bool) -> Option<Message> {
        if self.streams.is_empty() {
            return None;
        }

        loop {
            for _ in 0..self.streams.len() {
                let index = self.strategy.next(self.streams.len());
                match self.streams[index].receive(false).await {
                    Ok(Some(message)) => return Some(message),
                    Ok(None) => {}
                    Err(e) => debug!("Merge skipped stream {}: {}", index, e),
                }
            }
            if !block {
                return None;
            }
            tokio::time::sleep(MERGE_POLL_INTERVAL).await;
        }
    }

    /// Disconnect every stream
    pub async fn disconnect(&mut self) {
        for stream in &mut self.streams {
            stream.disconnect().await;
        }
    }
}

/// Rates over one sampling interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThroughputSample {
    /// Messages per second
    pub message_rate: f64,
    /// Bytes per second
    pub data_rate: f64,
}

/// Totals and averages since the start of measurement
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThroughputSummary {
    pub total_elapsed_time: Duration,
    pub average_message_size: f64,
    pub total_bytes_received: u64,
    pub average_data_rate: f64,
    pub messages_received: u64,
    pub average_message_rate: f64,
}

impl fmt::Display for ThroughputSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total elapsed time:   {:>10.3} s", self.total_elapsed_time.as_secs_f64())?;
        writeln!(f, "Average message size: {:>10.3} MB", self.average_message_size * MB_FACTOR)?;
        writeln!(f, "Total bytes received: {:>10.3} MB", self.total_bytes_received as f64 * MB_FACTOR)?;
        writeln!(f, "Average data rate:    {:>10.3} MB/s", self.average_data_rate * MB_FACTOR)?;
        writeln!(f, "Messages received:    {:>10} messages", self.messages_received)?;
        write!(f, "Average message rate: {:>10.3} Hz", self.average_message_rate)
    }
}

impl fmt::Display for ThroughputSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Data rate: {:>10.3} MB/s    Message rate: {:>10.3} Hz",
            self.data_rate * MB_FACTOR,
            self.message_rate
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    total_bytes_received: u64,
    messages_received: u64,
    time: Instant,
}

/// Message and data rates derived from successive [`Statistics`]
#[derive(Debug)]
pub struct ThroughputStatistics {
    sampling_interval: Duration,
    capacity: usize,
    samples: VecDeque<ThroughputSample>,
    initial_time: Instant,
    last_sampled: Snapshot,
    last_received: Snapshot,
}

impl ThroughputStatistics {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_SAMPLING_INTERVAL)
    }

    pub fn with_interval(sampling_interval: Duration) -> Self {
        let now = Instant::now();
        let start = Snapshot {
            total_bytes_received: 0,
            messages_received: 0,
            time: now,
        };
        Self {
            sampling_interval,
            capacity: DEFAULT_SAMPLE_CAPACITY,
            samples: VecDeque::with_capacity(DEFAULT_SAMPLE_CAPACITY),
            initial_time: now,
            last_sampled: start,
            last_received: start,
        }
    }

    /// Record the counters of a received message.
    ///
    /// Returns `true` when the sampling interval elapsed and a new sample
    /// was taken.
    pub fn save(&mut self, statistics: &Statistics) -> bool {
        self.last_received = Snapshot {
            total_bytes_received: statistics.total_bytes_received,
            messages_received: statistics.messages_received,
            time: Instant::now(),
        };

        if self.last_received.time.duration_since(self.last_sampled.time) > self.sampling_interval {
            self.sample();
            return true;
        }
        false
    }

    /// Take a sample of whatever arrived since the last one, regardless of
    /// the sampling interval
    pub fn flush(&mut self) -> bool {
        if self.last_received.time > self.last_sampled.time {
            self.sample();
            return true;
        }
        false
    }

    fn sample(&mut self) {
        let elapsed = self
            .last_received
            .time
            .duration_since(self.last_sampled.time)
            .as_secs_f64();
        let bytes = self
            .last_received
            .total_bytes_received
            .saturating_sub(self.last_sampled.total_bytes_received);
        let messages = self
            .last_received
            .messages_received
            .saturating_sub(self.last_sampled.messages_received);

        let sample = ThroughputSample {
            message_rate: messages as f64 / elapsed,
            data_rate: bytes as f64 / elapsed,
        };
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.last_sampled = self.last_received;

        info!("{}", sample);
    }

    pub fn last_sample(&self) -> Option<ThroughputSample> {
        self.samples.back().copied()
    }

    pub fn samples(&self) -> impl Iterator<Item = &ThroughputSample> {
        self.samples.iter()
    }

    /// `None` when nothing was received
    pub fn summary(&self) -> Option<ThroughputSummary> {
        let elapsed = self.last_received.time.duration_since(self.initial_time);
        let received = self.last_received;
        if elapsed.is_zero() || received.messages_received == 0 {
            return None;
        }

        let seconds = elapsed.as_secs_f64();
        Some(ThroughputSummary {
            total_elapsed_time: elapsed,
            average_message_size: received.total_bytes_received as f64 / received.messages_received as f64,
            total_bytes_received: received.total_bytes_received,
            average_data_rate: received.total_bytes_received as f64 / seconds,
            messages_received: received.messages_received,
            average_message_rate: received.messages_received as f64 / seconds,
        })
    }
}

impl Default for ThroughputStatistics {
    fn default() -> Self {
        Self::new()
    }
}
