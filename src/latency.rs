use std::collections::HashMap;

use crate::{
    consts::{LATENCY_SAMPLE_COUNT, MAX_ROUND_TRIP_SEC},
    sequence::SequenceId,
};

/// Published latency figures, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Ping {
    pub latest_ms: f64,
    pub average_ms: f64,
    pub jitter_ms: f64,
}

/// Mean and standard deviation over the last `N` samples.
#[derive(Debug, Clone)]
struct RollingData<const N: usize> {
    buf: Vec<f64>,
    next: usize,
    sum: f64,
    square_sum: f64,
}

impl<const N: usize> RollingData<N> {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(N),
            next: 0,
            sum: 0.0,
            square_sum: 0.0,
        }
    }
    fn len(&self) -> usize {
        self.buf.len()
    }
    fn add_value(&mut self, value: f64) {
        if self.buf.len() < N {
            self.buf.push(value);
        } else {
            let evicted = std::mem::replace(&mut self.buf[self.next], value);
            self.sum -= evicted;
            self.square_sum -= evicted * evicted;
            self.next = (self.next + 1) % N;
        }
        self.sum += value;
        self.square_sum += value * value;
    }
    fn mean(&self) -> f64 {
        if self.buf.is_empty() {
            return 0.0;
        }
        self.sum / self.buf.len() as f64
    }
    fn std_dev(&self) -> f64 {
        if self.buf.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let diff_of_squares = self.square_sum - mean * mean * self.buf.len() as f64;
        (diff_of_squares.max(0.0) / (self.buf.len() - 1) as f64).sqrt()
    }
}

/// Derives one-way latency from the time it takes the remote to acknowledge reliable packets.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    send_times: HashMap<SequenceId, f64>,
    samples: RollingData<LATENCY_SAMPLE_COUNT>,
    latest: f64,
    ping: Ping,
    sample_interval: f64,
    last_publish_time: f64,
}

impl LatencyTracker {
    pub fn new(sample_interval: f64) -> Self {
        Self {
            send_times: HashMap::new(),
            samples: RollingData::new(),
            latest: 0.0,
            ping: Ping::default(),
            sample_interval,
            last_publish_time: f64::NEG_INFINITY,
        }
    }
    /// The most recently published figures. See [`update`](LatencyTracker::update).
    pub fn ping(&self) -> Ping {
        self.ping
    }
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
    pub fn pending(&self) -> usize {
        self.send_times.len()
    }
    pub fn on_sent(&mut self, sequence_id: SequenceId, time: f64) {
        self.send_times.insert(sequence_id, time);
    }
    /// Records the round trip of the packet the remote just acknowledged.
    /// Returns the one-way latency sample in seconds, if one was taken.
    pub fn on_acked(&mut self, sequence_id: SequenceId, time: f64) -> Option<f64> {
        let Some(sent) = self.send_times.remove(&sequence_id) else {
            log::warn!("no send time recorded for acknowledged packet {sequence_id}");
            return None;
        };
        // anything this old can no longer be acknowledged
        self.send_times
            .retain(|_, &mut sent_at| time - sent_at <= MAX_ROUND_TRIP_SEC);
        let round_trip = time - sent;
        if !(0.0..=MAX_ROUND_TRIP_SEC).contains(&round_trip) {
            log::debug!("discarding round trip sample of {round_trip:.3}s for {sequence_id}");
            return None;
        }
        let latency = round_trip / 2.0;
        self.latest = latency;
        self.samples.add_value(latency);
        Some(latency)
    }
    /// Publishes a fresh [`Ping`] once per sample interval.
    pub fn update(&mut self, time: f64) {
        if time - self.last_publish_time < self.sample_interval || self.samples.len() == 0 {
            return;
        }
        self.last_publish_time = time;
        self.ping = Ping {
            latest_ms: self.latest * 1000.0,
            average_ms: self.samples.mean() * 1000.0,
            jitter_ms: self.samples.std_dev() * 1000.0,
        };
        log::trace!(
            "ping {:.1}ms (avg {:.1}ms, jitter {:.1}ms)",
            self.ping.latest_ms,
            self.ping.average_ms,
            self.ping.jitter_ms
        );
    }
}
