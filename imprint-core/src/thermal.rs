//! Thermal protection for long writes.
//!
//! A [`ThermalGovernor`] samples an injected [`TemperatureSensor`] no more
//! often than its poll interval and turns the reading into a [`Directive`].
//! Engines ask it before every chunk. The governor never blocks a caller on
//! another caller's sample: if a sample is in progress, the previous decision
//! is returned.
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::{Duration, Instant};

/// One temperature reading.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ThermalSample {
    pub celsius: f32,
    pub taken_at: Instant,
}

impl ThermalSample {
    pub fn now(celsius: f32) -> Self {
        Self {
            celsius,
            taken_at: Instant::now(),
        }
    }
}

/// A source of temperature readings. `None` means no reading is available.
pub trait TemperatureSensor: Send {
    fn sample(&mut self) -> Option<ThermalSample>;
}

/// Hottest component reported by the OS, via `sysinfo`.
pub struct SysinfoSensor {
    components: sysinfo::Components,
}

impl SysinfoSensor {
    pub fn new() -> Self {
        Self {
            components: sysinfo::Components::new_with_refreshed_list(),
        }
    }
}

impl Default for SysinfoSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl TemperatureSensor for SysinfoSensor {
    fn sample(&mut self) -> Option<ThermalSample> {
        self.components.refresh(true);
        self.components
            .iter()
            .filter_map(|c| c.temperature())
            .filter(|t| t.is_finite())
            .reduce(f32::max)
            .map(ThermalSample::now)
    }
}

/// A sensor that never reports anything; thermal protection is off.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSensor;

impl TemperatureSensor for NoSensor {
    fn sample(&mut self) -> Option<ThermalSample> {
        None
    }
}

/// A sensor whose reading is set from outside, e.g. by a drive's SMART
/// poller running elsewhere.
#[derive(Clone, Debug, Default)]
pub struct ManualSensor {
    celsius: Arc<Mutex<Option<f32>>>,
}

impl ManualSensor {
    pub fn new(celsius: f32) -> Self {
        Self {
            celsius: Arc::new(Mutex::new(Some(celsius))),
        }
    }

    pub fn set(&self, celsius: f32) {
        *self.celsius.lock().unwrap_or_else(PoisonError::into_inner) = Some(celsius);
    }

    pub fn clear(&self) {
        *self.celsius.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl TemperatureSensor for ManualSensor {
    fn sample(&mut self) -> Option<ThermalSample> {
        self.celsius
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(ThermalSample::now)
    }
}

/// What an engine should do before its next chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    Proceed,
    Pause,
    Abort,
}

impl Directive {
    fn to_u8(self) -> u8 {
        match self {
            Directive::Proceed => 0,
            Directive::Pause => 1,
            Directive::Abort => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Directive::Pause,
            2 => Directive::Abort,
            _ => Directive::Proceed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ThermalPolicy {
    pub warning: f32,
    pub hard: f32,
    /// Once paused, the reading must drop to `warning - resume_margin`.
    pub resume_margin: f32,
    pub poll_interval: Duration,
}

impl ThermalPolicy {
    pub fn decide(&self, previous: Directive, celsius: f32) -> Directive {
        if celsius >= self.hard {
            Directive::Abort
        } else if celsius >= self.warning {
            Directive::Pause
        } else if previous != Directive::Proceed && celsius > self.warning - self.resume_margin {
            Directive::Pause
        } else {
            Directive::Proceed
        }
    }
}

impl From<&crate::config::JobOptions> for ThermalPolicy {
    fn from(opts: &crate::config::JobOptions) -> Self {
        Self {
            warning: opts.thermal_threshold_warning,
            hard: opts.thermal_threshold_hard,
            resume_margin: opts.thermal_resume_margin,
            poll_interval: opts.thermal_poll_interval(),
        }
    }
}

struct Polling {
    sensor: Box<dyn TemperatureSensor>,
    last_sample: Option<ThermalSample>,
    last_poll: Option<Instant>,
}

pub struct ThermalGovernor {
    policy: ThermalPolicy,
    polling: Mutex<Polling>,
    decision: AtomicU8,
}

impl ThermalGovernor {
    pub fn new(policy: ThermalPolicy, sensor: Box<dyn TemperatureSensor>) -> Self {
        Self {
            policy,
            polling: Mutex::new(Polling {
                sensor,
                last_sample: None,
                last_poll: None,
            }),
            decision: AtomicU8::new(Directive::Proceed.to_u8()),
        }
    }

    pub fn policy(&self) -> &ThermalPolicy {
        &self.policy
    }

    /// The decision from the most recent sample, without sampling.
    pub fn current(&self) -> Directive {
        Directive::from_u8(self.decision.load(Ordering::SeqCst))
    }

    pub fn last_sample(&self) -> Option<ThermalSample> {
        self.polling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_sample
    }

    /// Samples the sensor if the poll interval has elapsed and returns the
    /// resulting decision.
    pub fn check(&self) -> Directive {
        let mut polling = match self.polling.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return self.current(),
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };

        let due = polling
            .last_poll
            .is_none_or(|t| t.elapsed() >= self.policy.poll_interval);
        if !due {
            return self.current();
        }
        polling.last_poll = Some(Instant::now());

        let Some(sample) = polling.sensor.sample() else {
            debug!("no temperature reading available");
            return self.current();
        };
        polling.last_sample = Some(sample);

        let previous = self.current();
        let next = self.policy.decide(previous, sample.celsius);
        if next != previous {
            match next {
                Directive::Proceed => debug!("temperature {:.1}°C, resuming", sample.celsius),
                Directive::Pause => warn!(
                    "temperature {:.1}°C reached warning threshold {:.1}°C",
                    sample.celsius, self.policy.warning
                ),
                Directive::Abort => warn!(
                    "temperature {:.1}°C reached hard threshold {:.1}°C",
                    sample.celsius, self.policy.hard
                ),
            }
        }
        self.decision.store(next.to_u8(), Ordering::SeqCst);
        next
    }
}

/// Job-wide pause bookkeeping for `pause_all_on_overheat`.
///
/// Devices whose own governor says pause register here; while any are
/// registered, every other device treats its own `Proceed` as `Pause`.
#[derive(Debug, Default)]
pub struct PauseLatch {
    enabled: bool,
    holders: Mutex<HashSet<String>>,
}

impl PauseLatch {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            holders: Mutex::new(HashSet::new()),
        }
    }

    /// Folds one device's own directive into the job-wide one.
    pub fn apply(&self, device: &str, own: Directive) -> Directive {
        if !self.enabled {
            return own;
        }
        let mut holders = self.holders.lock().unwrap_or_else(PoisonError::into_inner);
        match own {
            Directive::Pause => {
                holders.insert(device.to_string());
                Directive::Pause
            }
            Directive::Proceed | Directive::Abort => {
                holders.remove(device);
                if own == Directive::Proceed && !holders.is_empty() {
                    Directive::Pause
                } else {
                    own
                }
            }
        }
    }

    /// Drops any hold of a device that has stopped.
    pub fn release(&self, device: &str) {
        self.holders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ThermalPolicy {
        ThermalPolicy {
            warning: 70.0,
            hard: 85.0,
            resume_margin: 5.0,
            poll_interval: Duration::ZERO,
        }
    }

    #[test]
    fn thresholds_and_hysteresis() {
        let p = policy();
        assert_eq!(p.decide(Directive::Proceed, 50.0), Directive::Proceed);
        assert_eq!(p.decide(Directive::Proceed, 70.0), Directive::Pause);
        assert_eq!(p.decide(Directive::Proceed, 85.0), Directive::Abort);
        // Still inside the margin: stay paused.
        assert_eq!(p.decide(Directive::Pause, 67.0), Directive::Pause);
        assert_eq!(p.decide(Directive::Pause, 65.0), Directive::Proceed);
        // Not paused before: below warning is fine.
        assert_eq!(p.decide(Directive::Proceed, 67.0), Directive::Proceed);
    }

    #[test]
    fn governor_follows_sensor() {
        let sensor = ManualSensor::new(40.0);
        let gov = ThermalGovernor::new(policy(), Box::new(sensor.clone()));
        assert_eq!(gov.check(), Directive::Proceed);

        sensor.set(72.0);
        assert_eq!(gov.check(), Directive::Pause);
        sensor.set(68.0);
        assert_eq!(gov.check(), Directive::Pause);
        sensor.set(60.0);
        assert_eq!(gov.check(), Directive::Proceed);
        sensor.set(90.0);
        assert_eq!(gov.check(), Directive::Abort);
        assert_eq!(gov.last_sample().map(|s| s.celsius), Some(90.0));
    }

    #[test]
    fn missing_readings_keep_previous_decision() {
        let sensor = ManualSensor::new(75.0);
        let gov = ThermalGovernor::new(policy(), Box::new(sensor.clone()));
        assert_eq!(gov.check(), Directive::Pause);
        sensor.clear();
        assert_eq!(gov.check(), Directive::Pause);

        let off = ThermalGovernor::new(policy(), Box::new(NoSensor));
        assert_eq!(off.check(), Directive::Proceed);
    }

    #[test]
    fn samples_at_most_once_per_interval() {
        let sensor = ManualSensor::new(40.0);
        let gov = ThermalGovernor::new(
            ThermalPolicy {
                poll_interval: Duration::from_secs(3600),
                ..policy()
            },
            Box::new(sensor.clone()),
        );
        assert_eq!(gov.check(), Directive::Proceed);
        sensor.set(99.0);
        assert_eq!(gov.check(), Directive::Proceed);
    }

    #[test]
    fn latch_pauses_everyone_when_enabled() {
        let latch = PauseLatch::new(true);
        assert_eq!(latch.apply("a", Directive::Pause), Directive::Pause);
        assert_eq!(latch.apply("b", Directive::Proceed), Directive::Pause);
        assert_eq!(latch.apply("a", Directive::Proceed), Directive::Proceed);
        assert_eq!(latch.apply("b", Directive::Proceed), Directive::Proceed);

        let off = PauseLatch::new(false);
        assert_eq!(off.apply("a", Directive::Pause), Directive::Pause);
        assert_eq!(off.apply("b", Directive::Proceed), Directive::Proceed);
    }
}
