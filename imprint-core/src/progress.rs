//! Progress reporting.
//!
//! Engines publish [`ProgressEvent`]s to a [`ProgressBus`]; front ends read
//! them from a [`ProgressStream`]. Publishing never waits on a subscriber:
//! channels are unbounded and a dropped subscriber is simply forgotten.
use crate::state::Phase;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    pub device: String,
    pub phase: Phase,
    pub bytes_written: u64,
    pub bytes_verified: u64,
    pub bytes_total: u64,
    /// Bytes per second over the most recent chunks of the current phase.
    pub throughput: f64,
    pub eta: Option<Duration>,
}

impl ProgressEvent {
    pub fn percentage(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        let done = match self.phase {
            Phase::Verifying => self.bytes_verified,
            _ => self.bytes_written,
        };
        done as f64 * 100.0 / self.bytes_total as f64
    }
}

#[derive(Default)]
struct BusInner {
    subscribers: Vec<Sender<ProgressEvent>>,
    latest: BTreeMap<String, ProgressEvent>,
    closed: bool,
}

/// Fan-out point for one job's progress events.
#[derive(Clone, Default)]
pub struct ProgressBus {
    inner: Arc<Mutex<BusInner>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: ProgressEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return;
        }
        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        inner.latest.insert(event.device.clone(), event);
    }

    /// A stream of events from now on, starting with the latest event of
    /// every device seen so far. Ends once the job is finished.
    pub fn subscribe(&self) -> ProgressStream {
        let (tx, rx) = mpsc::channel();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for event in inner.latest.values() {
            // The receiver is in scope; this cannot fail.
            let _ = tx.send(event.clone());
        }
        if !inner.closed {
            inner.subscribers.push(tx);
        }
        ProgressStream { rx }
    }

    /// Ends every stream once it has been drained.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.closed = true;
        inner.subscribers.clear();
    }
}

/// Ordered, non-rewindable sequence of progress events.
pub struct ProgressStream {
    rx: Receiver<ProgressEvent>,
}

impl ProgressStream {
    /// Returns an event if one is waiting, without blocking.
    /// `Err(())` means the stream has ended.
    #[allow(clippy::result_unit_err)]
    pub fn try_next(&self) -> Result<Option<ProgressEvent>, ()> {
        match self.rx.try_recv() {
            Ok(ev) => Ok(Some(ev)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(()),
        }
    }

    /// Waits up to `timeout` for the next event. `Err(())` means the stream
    /// has ended.
    #[allow(clippy::result_unit_err)]
    pub fn next_timeout(&self, timeout: Duration) -> Result<Option<ProgressEvent>, ()> {
        match self.rx.recv_timeout(timeout) {
            Ok(ev) => Ok(Some(ev)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(()),
        }
    }
}

impl Iterator for ProgressStream {
    type Item = ProgressEvent;

    fn next(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().ok()
    }
}

/// Exponentially smoothed transfer rate.
#[derive(Clone, Debug)]
pub struct RateMeter {
    last: Option<Instant>,
    rate: f64,
}

const SMOOTHING: f64 = 0.3;

impl RateMeter {
    pub fn new() -> Self {
        Self {
            last: None,
            rate: 0.0,
        }
    }

    /// Forgets history, e.g. after a pause or when a new phase starts.
    pub fn reset(&mut self) {
        self.last = None;
        self.rate = 0.0;
    }

    /// Starts timing from `now` without recording any bytes.
    pub fn start(&mut self, now: Instant) {
        self.last = Some(now);
    }

    pub fn record(&mut self, bytes: u64, now: Instant) {
        if let Some(last) = self.last {
            let secs = now.duration_since(last).as_secs_f64();
            if secs > 0.0 {
                let sample = bytes as f64 / secs;
                self.rate = if self.rate == 0.0 {
                    sample
                } else {
                    SMOOTHING * sample + (1.0 - SMOOTHING) * self.rate
                };
            }
        }
        self.last = Some(now);
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        if remaining == 0 {
            return Some(Duration::ZERO);
        }
        if self.rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / self.rate))
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(device: &str, written: u64) -> ProgressEvent {
        ProgressEvent {
            device: device.into(),
            phase: Phase::Writing,
            bytes_written: written,
            bytes_verified: 0,
            bytes_total: 100,
            throughput: 0.0,
            eta: None,
        }
    }

    #[test]
    fn events_arrive_in_order_and_stream_ends_on_close() {
        let bus = ProgressBus::new();
        let stream = bus.subscribe();
        bus.publish(event("a", 10));
        bus.publish(event("a", 20));
        bus.close();
        let seen: Vec<u64> = stream.map(|e| e.bytes_written).collect();
        assert_eq!(seen, vec![10, 20]);
    }

    #[test]
    fn late_subscriber_gets_latest_snapshot() {
        let bus = ProgressBus::new();
        bus.publish(event("a", 10));
        bus.publish(event("b", 5));
        bus.publish(event("a", 30));
        let stream = bus.subscribe();
        bus.publish(event("b", 50));
        bus.close();
        let seen: Vec<(String, u64)> = stream.map(|e| (e.device, e.bytes_written)).collect();
        assert_eq!(
            seen,
            vec![("a".into(), 30), ("b".into(), 5), ("b".into(), 50)]
        );
    }

    #[test]
    fn dropped_subscriber_does_not_block_publisher() {
        let bus = ProgressBus::new();
        drop(bus.subscribe());
        for i in 0..1000 {
            bus.publish(event("a", i));
        }
        assert!(bus.inner.lock().unwrap().subscribers.is_empty());
    }

    #[test]
    fn polling_interface() {
        let bus = ProgressBus::new();
        let stream = bus.subscribe();
        assert_eq!(stream.try_next(), Ok(None));
        bus.publish(event("a", 1));
        assert_eq!(stream.try_next().unwrap().map(|e| e.bytes_written), Some(1));
        bus.close();
        assert_eq!(stream.next_timeout(Duration::from_millis(10)), Err(()));
    }

    #[test]
    fn rate_and_eta() {
        let mut meter = RateMeter::new();
        let t0 = Instant::now();
        meter.start(t0);
        meter.record(1_000, t0 + Duration::from_secs(1));
        assert!((meter.rate() - 1_000.0).abs() < 1e-6);
        assert_eq!(meter.eta(5_000), Some(Duration::from_secs(5)));
        assert_eq!(meter.eta(0), Some(Duration::ZERO));

        meter.reset();
        assert_eq!(meter.eta(10), None);
    }

    #[test]
    fn percentage_follows_phase() {
        let mut ev = event("a", 50);
        assert_eq!(ev.percentage(), 50.0);
        ev.phase = Phase::Verifying;
        ev.bytes_verified = 25;
        assert_eq!(ev.percentage(), 25.0);
    }
}
