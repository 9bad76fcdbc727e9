//! Fans one image out to several devices.
//!
//! [`start_job`] validates every target and acquires every device before any
//! byte is written, then runs one [`WriteEngine`] per device on its own
//! thread. A failure on one device is contained to that device's
//! [`JobResult`] unless `cancel_all_on_first_failure` is set.
use crate::cancel::CancelToken;
use crate::config::JobOptions;
use crate::device::TargetDevice;
use crate::engine::{EngineContext, WriteEngine};
use crate::error::{DeviceError, ValidationError};
use crate::handle::{DeviceBackend, DeviceHandle, DeviceLocks};
use crate::image::ImageSource;
use crate::plan::ChunkPlan;
use crate::progress::{ProgressBus, ProgressEvent, ProgressStream};
use crate::report::{JobOutcome, JobReport, JobResult, Verification};
use crate::state::{self, Phase, StateKey, StateStore, TransferState};
use crate::thermal::{NoSensor, PauseLatch, TemperatureSensor, ThermalGovernor, ThermalPolicy};
use log::{error, info, warn};
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// The collaborators a job runs against.
pub struct JobContext {
    backend: Arc<dyn DeviceBackend>,
    store: Arc<dyn StateStore>,
    sensor: Box<dyn TemperatureSensor>,
    device_sensors: HashMap<String, Box<dyn TemperatureSensor>>,
    locks: DeviceLocks,
}

impl JobContext {
    /// A context with no thermal sensor and the process-wide lock registry.
    pub fn new(backend: Arc<dyn DeviceBackend>, store: Arc<dyn StateStore>) -> Self {
        Self {
            backend,
            store,
            sensor: Box::new(NoSensor),
            device_sensors: HashMap::new(),
            locks: DeviceLocks::global(),
        }
    }

    /// The sensor behind the governor shared by every device.
    pub fn with_sensor(mut self, sensor: impl TemperatureSensor + 'static) -> Self {
        self.sensor = Box::new(sensor);
        self
    }

    /// Gives `device` a governor of its own, e.g. fed by the drive's own
    /// temperature reading.
    pub fn with_device_sensor(
        mut self,
        device: impl Into<String>,
        sensor: impl TemperatureSensor + 'static,
    ) -> Self {
        self.device_sensors.insert(device.into(), Box::new(sensor));
        self
    }

    pub fn with_locks(mut self, locks: DeviceLocks) -> Self {
        self.locks = locks;
        self
    }
}

struct Prepared {
    device: TargetDevice,
    handle: DeviceHandle,
    state: TransferState,
}

/// Validates `targets`, acquires all of them and starts writing `image`.
///
/// Fails without writing anything if any target is unsuitable or cannot be
/// opened; devices acquired up to that point are released again.
pub fn start_job(
    image: Arc<ImageSource>,
    targets: Vec<TargetDevice>,
    options: JobOptions,
    ctx: JobContext,
) -> Result<JobHandle, ValidationError> {
    options.validate()?;
    if targets.is_empty() {
        return Err(ValidationError::NoTargets);
    }
    let mut seen = HashSet::new();
    for target in &targets {
        if !seen.insert(target.id()) {
            return Err(ValidationError::Duplicate(target.id()));
        }
    }

    let plan = ChunkPlan::new(image.size(), options.chunk_size_bytes)?;
    if let Some(manifest) = image.manifest() {
        manifest.check(&plan).map_err(ValidationError::Manifest)?;
    }
    for target in &targets {
        target.validate(image.size(), options.require_removable)?;
    }

    let JobContext {
        backend,
        store,
        sensor,
        mut device_sensors,
        locks,
    } = ctx;

    // Acquire everything before writing anything. On error the handles
    // opened so far drop with `opened` and their locks are released.
    let mut opened = Vec::with_capacity(targets.len());
    for target in targets {
        let id = target.id();
        let handle = DeviceHandle::open(backend.as_ref(), &locks, &target)
            .map_err(|e| match e {
                DeviceError::NotFound(_) => ValidationError::NotFound(id.clone()),
                source => ValidationError::Unavailable {
                    device: id.clone(),
                    source,
                },
            })?
            .with_timeout(options.chunk_timeout());
        let capacity = handle.size().map_err(|source| ValidationError::Unavailable {
            device: id.clone(),
            source,
        })?;
        if capacity < image.size() {
            return Err(ValidationError::CapacityTooSmall {
                device: id,
                capacity,
                required: image.size(),
            });
        }
        opened.push((target, handle));
    }

    let checksum = image.checksum_hex();
    let mut prepared = Vec::with_capacity(opened.len());
    for (device, handle) in opened {
        let key = StateKey::new(&checksum, &device.id(), plan.chunk_size());
        let state = restore_state(store.as_ref(), &key, &plan, options.resume_if_possible);
        prepared.push(Prepared {
            device,
            handle,
            state,
        });
    }

    let cancel = CancelToken::new();
    let progress = ProgressBus::new();
    let policy = ThermalPolicy::from(&options);
    let shared_governor = Arc::new(ThermalGovernor::new(policy, sensor));
    let ctx = Arc::new(EngineContext {
        latch: Arc::new(PauseLatch::new(options.pause_all_on_overheat)),
        image,
        plan,
        options,
        store,
        cancel: cancel.clone(),
        progress: progress.clone(),
    });

    for p in &prepared {
        progress.publish(ProgressEvent {
            device: p.device.id(),
            phase: Phase::Pending,
            bytes_written: p.state.bytes_written,
            bytes_verified: 0,
            bytes_total: ctx.plan.image_size(),
            throughput: 0.0,
            eta: None,
        });
    }

    let shared = Arc::new(JobShared {
        results: Mutex::new(vec![None; prepared.len()]),
        remaining: Mutex::new(prepared.len()),
        finished: Condvar::new(),
    });
    let slots = Arc::new(Slots::new(ctx.options.max_concurrent_devices));
    info!(
        "starting job: {} bytes in {} chunks to {} device(s)",
        ctx.plan.image_size(),
        ctx.plan.chunk_count(),
        prepared.len()
    );

    for (index, p) in prepared.into_iter().enumerate() {
        let id = p.device.id();
        let governor = match device_sensors.remove(&id) {
            Some(sensor) => Arc::new(ThermalGovernor::new(policy, sensor)),
            None => shared_governor.clone(),
        };
        let engine = WriteEngine::new(ctx.clone(), p.device, p.handle, governor, p.state);
        let worker = Worker {
            ctx: ctx.clone(),
            shared: shared.clone(),
            slots: slots.clone(),
            index,
            id: id.clone(),
        };
        let name = format!("imprint:{}", id.rsplit(['/', '\\']).next().unwrap_or(&id));
        if let Err(e) = thread::Builder::new()
            .name(name)
            .spawn(move || worker.run(engine))
        {
            // The engine, and with it the device lock, went down with the
            // failed spawn.
            error!("{id}: could not start worker thread: {e}");
            let result = failed_result(&id, ctx.plan.image_size(), format!("could not start worker: {e}"));
            shared.finish_one(index, result, &ctx.progress);
        }
    }

    Ok(JobHandle {
        cancel,
        progress,
        shared,
    })
}

fn restore_state(
    store: &dyn StateStore,
    key: &StateKey,
    plan: &ChunkPlan,
    resume: bool,
) -> TransferState {
    if resume {
        match state::load_resumable(store, key, plan) {
            Ok(Some(found)) => {
                info!(
                    "{}: resuming, {} of {} chunks already written",
                    key.device_id,
                    found.written_count(),
                    found.chunk_count
                );
                if found.verification_skipped {
                    info!("{}: written earlier without verification", key.device_id);
                }
                let mut found = found;
                found.phase = Phase::Pending;
                return found;
            }
            Ok(None) => {}
            Err(e) => warn!("{}: ignoring unreadable transfer record: {e}", key.device_id),
        }
    } else if let Err(e) = store.delete(key) {
        warn!("{}: could not drop previous transfer record: {e}", key.device_id);
    }
    if let Err(e) = state::forget_other_records(store, &key.device_id, key) {
        warn!("{}: could not drop stale transfer records: {e}", key.device_id);
    }
    TransferState::new(key.clone(), plan)
}

fn failed_result(device: &str, bytes_total: u64, error: String) -> JobResult {
    JobResult {
        device: device.to_string(),
        outcome: JobOutcome::DeviceFailure,
        bytes_written: 0,
        bytes_total,
        duration: Duration::ZERO,
        verification: Verification::NotRun,
        unresolved_chunks: Vec::new(),
        unresolved_ranges: Vec::new(),
        resumable: false,
        error: Some(error),
    }
}

/// Bounds how many engines run at once.
struct Slots {
    limit: Option<usize>,
    in_use: Mutex<usize>,
    freed: Condvar,
}

impl Slots {
    fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            in_use: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    /// Waits for a free slot. Returns early, without a slot, on cancellation.
    fn acquire(&self, cancel: &CancelToken) -> bool {
        let Some(limit) = self.limit else {
            return true;
        };
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        while *in_use >= limit {
            if cancel.is_cancelled() {
                return false;
            }
            in_use = self
                .freed
                .wait_timeout(in_use, Duration::from_millis(100))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *in_use += 1;
        true
    }

    fn release(&self) {
        if self.limit.is_none() {
            return;
        }
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        *in_use = in_use.saturating_sub(1);
        self.freed.notify_one();
    }
}

struct JobShared {
    results: Mutex<Vec<Option<JobResult>>>,
    remaining: Mutex<usize>,
    finished: Condvar,
}

impl JobShared {
    fn finish_one(&self, index: usize, result: JobResult, progress: &ProgressBus) {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)[index] = Some(result);
        let mut remaining = self.remaining.lock().unwrap_or_else(PoisonError::into_inner);
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            progress.close();
            self.finished.notify_all();
        }
    }

    fn is_finished(&self) -> bool {
        *self.remaining.lock().unwrap_or_else(PoisonError::into_inner) == 0
    }

    fn report(&self) -> JobReport {
        let results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        JobReport {
            results: results.iter().flatten().cloned().collect(),
        }
    }
}

struct Worker {
    ctx: Arc<EngineContext>,
    shared: Arc<JobShared>,
    slots: Arc<Slots>,
    index: usize,
    id: String,
}

impl Worker {
    fn run(self, engine: WriteEngine) {
        let started = Instant::now();
        // Without a slot the engine still runs: it sees the cancellation
        // before its first chunk and records the device as cancelled.
        let slot = self.slots.acquire(&self.ctx.cancel);
        let result = match panic::catch_unwind(AssertUnwindSafe(|| engine.run())) {
            Ok(result) => result,
            Err(_) => {
                error!("{}: worker panicked", self.id);
                if self.ctx.options.cancel_all_on_first_failure {
                    self.ctx.cancel.cancel();
                }
                let mut result = failed_result(
                    &self.id,
                    self.ctx.plan.image_size(),
                    "internal error while writing".to_string(),
                );
                result.duration = started.elapsed();
                result
            }
        };
        if slot {
            self.slots.release();
        }
        self.shared.finish_one(self.index, result, &self.ctx.progress);
    }
}

/// A running job.
///
/// Dropping the handle does not stop the job; call [`JobHandle::cancel`]
/// for that.
#[derive(Clone)]
pub struct JobHandle {
    cancel: CancelToken,
    progress: ProgressBus,
    shared: Arc<JobShared>,
}

impl JobHandle {
    /// Asks every engine to stop after its current chunk. Progress stays
    /// resumable.
    pub fn cancel(&self) {
        info!("cancellation requested");
        self.cancel.cancel();
    }

    /// Like [`JobHandle::cancel`], but also drops the resumable records.
    pub fn cancel_and_discard(&self) {
        info!("cancellation requested, discarding progress");
        self.cancel.cancel_and_discard();
    }

    pub fn subscribe_progress(&self) -> ProgressStream {
        self.progress.subscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    /// The per-device results, once every device has finished.
    pub fn result(&self) -> Option<JobReport> {
        self.is_finished().then(|| self.shared.report())
    }

    /// Blocks until every device has finished.
    pub fn wait(&self) -> JobReport {
        let mut remaining = self
            .shared
            .remaining
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *remaining > 0 {
            remaining = self
                .shared
                .finished
                .wait(remaining)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(remaining);
        self.shared.report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::state::MemoryStore;

    fn options() -> JobOptions {
        JobOptions {
            chunk_size_bytes: 1_024,
            retry_backoff_ms: 0,
            thermal_poll_interval_ms: 0,
            ..JobOptions::default()
        }
    }

    fn image() -> Arc<ImageSource> {
        Arc::new(ImageSource::from_bytes("img", vec![0x5a; 3_000]))
    }

    #[test]
    fn duplicate_targets_are_rejected() {
        let backend = MemoryBackend::new();
        backend.attach("/dev/sdb", 4_096);
        let t = TargetDevice::new("/dev/sdb", 4_096, true);
        let ctx = JobContext::new(Arc::new(backend), Arc::new(MemoryStore::new()))
            .with_locks(DeviceLocks::new());
        let err = start_job(image(), vec![t.clone(), t], options(), ctx).err();
        assert!(matches!(err, Some(ValidationError::Duplicate(_))));
    }

    #[test]
    fn empty_target_list_is_rejected() {
        let ctx = JobContext::new(Arc::new(MemoryBackend::new()), Arc::new(MemoryStore::new()));
        let err = start_job(image(), vec![], options(), ctx).err();
        assert!(matches!(err, Some(ValidationError::NoTargets)));
    }

    #[test]
    fn busy_device_fails_the_start_and_frees_the_rest() {
        let backend = Arc::new(MemoryBackend::new());
        backend.attach("/dev/sdb", 4_096);
        backend.attach("/dev/sdc", 4_096);
        let locks = DeviceLocks::new();
        let sdc = TargetDevice::new("/dev/sdc", 4_096, true);
        let _held = DeviceHandle::open(backend.as_ref(), &locks, &sdc).unwrap();

        let ctx = JobContext::new(backend.clone(), Arc::new(MemoryStore::new())).with_locks(locks.clone());
        let targets = vec![TargetDevice::new("/dev/sdb", 4_096, true), sdc];
        let err = start_job(image(), targets, options(), ctx).err();
        assert!(matches!(
            err,
            Some(ValidationError::Unavailable {
                source: DeviceError::Busy(_),
                ..
            })
        ));
        assert!(!locks.is_locked("/dev/sdb"));
        assert_eq!(backend.device("/dev/sdb").unwrap().write_count(), 0);
    }

    #[test]
    fn concurrency_cap_still_finishes_every_device() {
        let backend = Arc::new(MemoryBackend::new());
        let mut targets = Vec::new();
        for path in ["/dev/sdb", "/dev/sdc", "/dev/sdd"] {
            backend.attach(path, 4_096);
            targets.push(TargetDevice::new(path, 4_096, true));
        }
        let opts = JobOptions {
            max_concurrent_devices: Some(1),
            ..options()
        };
        let ctx = JobContext::new(backend.clone(), Arc::new(MemoryStore::new())).with_locks(DeviceLocks::new());
        let report = start_job(image(), targets, opts, ctx).unwrap().wait();
        assert!(report.is_success(), "{report:?}");
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.results[1].device, "/dev/sdc");
    }

    #[test]
    fn result_is_absent_until_finished() {
        let backend = Arc::new(MemoryBackend::new());
        let dev = backend.attach("/dev/sdb", 4_096);
        dev.set_latency(Duration::from_millis(20));
        let ctx = JobContext::new(backend, Arc::new(MemoryStore::new())).with_locks(DeviceLocks::new());
        let job = start_job(
            image(),
            vec![TargetDevice::new("/dev/sdb", 4_096, true)],
            options(),
            ctx,
        )
        .unwrap();
        assert!(job.result().is_none());
        let report = job.wait();
        assert!(job.is_finished());
        assert_eq!(job.result(), Some(report));
    }
}
