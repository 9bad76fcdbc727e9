//! The per-device write engine.
//!
//! One engine owns one locked device for the whole job. It writes the chunks
//! its transfer state still needs, flushes and records progress as it goes,
//! then hands the device to the [`Verifier`]. Cancellation and thermal
//! directives are honoured only between chunks, so a chunk is either written
//! completely or not at all as far as the engine is concerned.
//!
//! States move `Pending → Writing → WrittenPendingVerification → Verifying →
//! Completed`, with `Paused` entered and left around thermal pauses and
//! `Failed` / `Aborted` reachable from any active state.
use crate::cancel::CancelToken;
use crate::config::JobOptions;
use crate::device::TargetDevice;
use crate::error::DeviceError;
use crate::handle::DeviceHandle;
use crate::image::ImageSource;
use crate::plan::{Chunk, ChunkPlan};
use crate::progress::{ProgressBus, ProgressEvent, RateMeter};
use crate::report::{JobOutcome, JobResult, Verification};
use crate::retry::RetryPolicy;
use crate::state::{Phase, StateStore, TransferState};
use crate::thermal::{Directive, PauseLatch, ThermalGovernor};
use crate::verify::{ChunkGate, Interrupt, VerifyError, Verifier};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Everything the engines of one job share.
pub(crate) struct EngineContext {
    pub image: Arc<ImageSource>,
    pub plan: ChunkPlan,
    pub options: JobOptions,
    pub store: Arc<dyn StateStore>,
    pub latch: Arc<PauseLatch>,
    pub cancel: CancelToken,
    pub progress: ProgressBus,
}

/// Why an engine stopped short of completion.
enum Stop {
    Interrupted(Interrupt),
    Device(DeviceError),
    Source(String),
}

impl From<VerifyError> for Stop {
    fn from(e: VerifyError) -> Self {
        match e {
            VerifyError::Device(d) => Stop::Device(d),
            VerifyError::Source(io) => Stop::Source(format!("cannot re-read image: {io}")),
            VerifyError::Interrupted(i) => Stop::Interrupted(i),
        }
    }
}

/// Per-chunk bookkeeping shared by the write loop and the verifier:
/// cancellation, thermal gating, progress events and state persistence.
struct Gate<'a> {
    ctx: &'a EngineContext,
    governor: &'a ThermalGovernor,
    device: String,
    meter: RateMeter,
    resume_phase: Phase,
    /// Chunks recorded as written whose data has not been flushed yet.
    unsynced: Vec<Chunk>,
    chunks_since_save: u32,
    persist_failed: bool,
}

impl<'a> Gate<'a> {
    fn bytes_verified(&self, state: &TransferState) -> u64 {
        self.ctx
            .plan
            .chunks()
            .filter(|c| state.is_verified(c.index))
            .map(|c| c.len)
            .sum()
    }

    fn emit(&self, state: &TransferState) {
        let total = self.ctx.plan.image_size();
        let bytes_verified = self.bytes_verified(state);
        let remaining = match state.phase {
            Phase::Verifying => total.saturating_sub(bytes_verified),
            Phase::Completed => 0,
            _ => total.saturating_sub(state.bytes_written),
        };
        let active = matches!(state.phase, Phase::Writing | Phase::Verifying);
        self.ctx.progress.publish(ProgressEvent {
            device: self.device.clone(),
            phase: state.phase,
            bytes_written: state.bytes_written,
            bytes_verified,
            bytes_total: total,
            throughput: if active { self.meter.rate() } else { 0.0 },
            eta: if active || remaining == 0 {
                self.meter.eta(remaining)
            } else {
                None
            },
        });
    }

    /// Persists `state` unless it records writes not yet flushed.
    fn save(&mut self, state: &TransferState) {
        if !self.unsynced.is_empty() {
            return;
        }
        if let Err(e) = self.ctx.store.save(&state.key, state) {
            warn!("{}: could not persist transfer state: {e}", self.device);
            self.persist_failed = true;
        }
        self.chunks_since_save = 0;
    }

    fn enter(&mut self, state: &mut TransferState, phase: Phase) {
        debug!("{}: {} -> {}", self.device, state.phase, phase);
        state.phase = phase;
        state.touch();
        self.meter.reset();
        self.meter.start(Instant::now());
        self.save(state);
        self.emit(state);
    }

    fn directive(&self) -> Directive {
        self.ctx.latch.apply(&self.device, self.governor.check())
    }

    /// Sleeps for up to `total`, waking early on cancellation.
    fn nap(&self, total: Duration) -> Result<(), Interrupt> {
        let slice = Duration::from_millis(50);
        let deadline = Instant::now() + total.max(Duration::from_millis(1));
        loop {
            if self.ctx.cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(slice.min(deadline - now));
        }
    }
}

impl ChunkGate for Gate<'_> {
    fn before_chunk(&mut self, state: &mut TransferState) -> Result<(), Interrupt> {
        loop {
            if self.ctx.cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
            match self.directive() {
                Directive::Proceed => {
                    if state.phase == Phase::Paused {
                        info!("{}: temperature back to normal, resuming", self.device);
                        let resume = self.resume_phase;
                        self.enter(state, resume);
                    }
                    return Ok(());
                }
                Directive::Abort => return Err(Interrupt::Thermal),
                Directive::Pause => {
                    if state.phase != Phase::Paused {
                        warn!("{}: pausing to let the hardware cool down", self.device);
                        self.resume_phase = state.phase;
                        self.enter(state, Phase::Paused);
                    }
                    let poll = self.governor.policy().poll_interval;
                    self.nap(poll.min(Duration::from_millis(250)))?;
                }
            }
        }
    }

    fn after_chunk(&mut self, state: &mut TransferState, chunk: &Chunk) {
        self.meter.record(chunk.len, Instant::now());
        if state.phase == Phase::Verifying {
            self.chunks_since_save += 1;
            if self.chunks_since_save >= self.ctx.options.sync_interval_chunks {
                self.save(state);
            }
        }
        self.emit(state);
    }
}

pub(crate) struct WriteEngine {
    ctx: Arc<EngineContext>,
    device: TargetDevice,
    handle: DeviceHandle,
    governor: Arc<ThermalGovernor>,
    state: TransferState,
    retry: RetryPolicy,
    session_bytes: u64,
}

impl WriteEngine {
    pub fn new(
        ctx: Arc<EngineContext>,
        device: TargetDevice,
        handle: DeviceHandle,
        governor: Arc<ThermalGovernor>,
        state: TransferState,
    ) -> Self {
        let retry = RetryPolicy::from_options(&ctx.options);
        Self {
            ctx,
            device,
            handle,
            governor,
            state,
            retry,
            session_bytes: 0,
        }
    }

    /// Drives the device to a terminal state and reports how it ended.
    pub fn run(mut self) -> JobResult {
        let started = Instant::now();
        let ctx = self.ctx.clone();
        let governor = self.governor.clone();
        let mut gate = Gate {
            ctx: &ctx,
            governor: &governor,
            device: self.device.id(),
            meter: RateMeter::new(),
            resume_phase: Phase::Writing,
            unsynced: Vec::new(),
            chunks_since_save: 0,
            persist_failed: false,
        };

        info!(
            "{}: starting, {}/{} chunks already written, {} verified",
            gate.device,
            self.state.written_count(),
            self.state.chunk_count,
            self.state.verified_count()
        );

        let res = self.execute(&mut gate);
        self.finish(gate, res, started)
    }

    fn execute(&mut self, gate: &mut Gate<'_>) -> Result<Verification, Stop> {
        let ctx = gate.ctx;
        let pending: Vec<Chunk> = ctx.plan.pending_writes(&self.state).collect();

        if !pending.is_empty() {
            self.state.verification_skipped = false;
            gate.enter(&mut self.state, Phase::Writing);

            let mut buf = vec![0u8; ctx.plan.max_chunk_len()];
            for chunk in &pending {
                gate.before_chunk(&mut self.state).map_err(Stop::Interrupted)?;

                let data = &mut buf[..chunk.len as usize];
                ctx.image
                    .read_at(chunk.offset, data)
                    .map_err(|e| Stop::Source(format!("cannot read image chunk {}: {e}", chunk.index)))?;
                if let Some(manifest) = ctx.image.manifest() {
                    if !manifest.matches(chunk.index, data) {
                        return Err(Stop::Source(format!(
                            "image chunk {} does not match its manifest digest",
                            chunk.index
                        )));
                    }
                }

                let handle = &mut self.handle;
                self.retry
                    .run("write", || handle.write_at(chunk.offset, data))
                    .map_err(Stop::Device)?;

                self.state.mark_written(chunk);
                self.session_bytes += chunk.len;
                gate.unsynced.push(*chunk);
                if gate.unsynced.len() as u32 >= ctx.options.sync_interval_chunks {
                    self.sync(gate)?;
                }
                gate.after_chunk(&mut self.state, chunk);
            }
            self.sync(gate)?;
        }

        gate.enter(&mut self.state, Phase::WrittenPendingVerification);

        if !ctx.options.verify {
            self.state.verification_skipped = true;
            return Ok(Verification::Skipped);
        }

        self.state.verification_skipped = false;
        gate.enter(&mut self.state, Phase::Verifying);
        let outcome = Verifier::new(&ctx.image, &ctx.plan)
            .with_retry(self.retry)
            .run(&mut self.handle, &mut self.state, gate)?;

        if outcome.passed() {
            Ok(Verification::Passed)
        } else {
            Ok(Verification::Failed {
                mismatched: outcome.mismatched,
            })
        }
    }

    /// Flushes the device, then records the flushed chunks as durable.
    fn sync(&mut self, gate: &mut Gate<'_>) -> Result<(), Stop> {
        let handle = &mut self.handle;
        self.retry.run("flush", || handle.flush()).map_err(Stop::Device)?;
        gate.unsynced.clear();
        gate.save(&self.state);
        Ok(())
    }

    fn finish(mut self, mut gate: Gate<'_>, res: Result<Verification, Stop>, started: Instant) -> JobResult {
        let ctx = gate.ctx;
        let id = gate.device.clone();

        // Whatever happened, only flushed chunks may be recorded as written.
        if !gate.unsynced.is_empty() {
            if let Err(e) = self.handle.flush() {
                warn!("{id}: final flush failed ({e}); unflushed chunks will be rewritten");
                for chunk in gate.unsynced.drain(..) {
                    self.state.forget_written(&chunk);
                }
            }
            gate.unsynced.clear();
        }

        let verification_deferred = matches!(res, Ok(Verification::Skipped));
        let (outcome, verification, error, mut resumable) = match res {
            Ok(Verification::Failed { mismatched }) => (
                JobOutcome::VerificationMismatch,
                Verification::Failed { mismatched },
                Some("written data does not match the image".to_string()),
                true,
            ),
            Ok(v) => (JobOutcome::Completed, v, None, false),
            Err(Stop::Interrupted(Interrupt::Cancelled)) => (
                JobOutcome::UserCancelled,
                Verification::NotRun,
                None,
                !ctx.cancel.discard_requested(),
            ),
            Err(Stop::Interrupted(Interrupt::Thermal)) => (
                JobOutcome::ThermalAbort,
                Verification::NotRun,
                Some("hard temperature threshold reached".to_string()),
                true,
            ),
            Err(Stop::Device(e)) => {
                let resumable = e.is_resumable();
                (
                    JobOutcome::DeviceFailure,
                    Verification::NotRun,
                    Some(e.to_string()),
                    resumable,
                )
            }
            Err(Stop::Source(msg)) => (
                JobOutcome::DeviceFailure,
                Verification::NotRun,
                Some(msg),
                true,
            ),
        };

        self.state.phase = match outcome {
            JobOutcome::Completed => Phase::Completed,
            JobOutcome::UserCancelled | JobOutcome::ThermalAbort => Phase::Aborted,
            JobOutcome::VerificationMismatch | JobOutcome::DeviceFailure => Phase::Failed,
        };
        self.state.touch();

        if resumable {
            gate.persist_failed = false;
            gate.save(&self.state);
            resumable = !gate.persist_failed;
        } else if verification_deferred {
            // Written but never read back: a later run with verification on
            // starts at the read-back instead of rewriting the device.
            let mut pending = self.state.clone();
            pending.phase = Phase::WrittenPendingVerification;
            gate.persist_failed = false;
            gate.save(&pending);
            resumable = !gate.persist_failed;
        } else if let Err(e) = ctx.store.delete(&self.state.key) {
            warn!("{id}: could not remove transfer record: {e}");
        }

        ctx.latch.release(&id);
        if matches!(
            outcome,
            JobOutcome::DeviceFailure | JobOutcome::VerificationMismatch
        ) && ctx.options.cancel_all_on_first_failure
        {
            warn!("{id}: {outcome}; cancelling the remaining devices");
            ctx.cancel.cancel();
        }

        gate.emit(&self.state);

        let verify = ctx.options.verify;
        let unresolved_chunks = if outcome == JobOutcome::Completed {
            Vec::new()
        } else {
            self.state.unresolved_chunks(verify)
        };
        let result = JobResult {
            device: id.clone(),
            outcome,
            bytes_written: self.session_bytes,
            bytes_total: ctx.plan.image_size(),
            duration: started.elapsed(),
            verification,
            unresolved_ranges: ctx.plan.byte_ranges(&unresolved_chunks),
            unresolved_chunks,
            resumable,
            error,
        };

        match result.outcome {
            JobOutcome::Completed => info!("{result}"),
            JobOutcome::UserCancelled | JobOutcome::ThermalAbort => warn!("{result}"),
            _ => error!("{result}"),
        }

        // Closing the handle releases the device lock.
        if let Err(e) = self.handle.close() {
            debug!("{id}: closing device: {e}");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryBackend, MemoryDevice};
    use crate::error::StoreError;
    use crate::handle::DeviceLocks;
    use crate::state::{MemoryStore, StateKey};
    use crate::thermal::{NoSensor, ThermalPolicy};
    use std::sync::Mutex;

    fn engine(
        bytes: Vec<u8>,
        options: JobOptions,
        store: Arc<dyn StateStore>,
    ) -> (WriteEngine, MemoryDevice, ProgressBus) {
        let backend = MemoryBackend::new();
        let dev = backend.attach("/dev/e", bytes.len() as u64);
        let target = TargetDevice::new("/dev/e", bytes.len() as u64, true);
        let handle = DeviceHandle::open(&backend, &DeviceLocks::new(), &target).unwrap();

        let image = Arc::new(ImageSource::from_bytes("img", bytes));
        let plan = ChunkPlan::new(image.size(), options.chunk_size_bytes).unwrap();
        let key = StateKey::new(&image.checksum_hex(), "/dev/e", plan.chunk_size());
        let state = TransferState::new(key, &plan);
        let governor = Arc::new(ThermalGovernor::new(ThermalPolicy::from(&options), Box::new(NoSensor)));
        let progress = ProgressBus::new();
        let ctx = Arc::new(EngineContext {
            image,
            plan,
            options,
            store,
            latch: Arc::new(PauseLatch::new(false)),
            cancel: CancelToken::new(),
            progress: progress.clone(),
        });
        (WriteEngine::new(ctx, target, handle, governor, state), dev, progress)
    }

    fn options(chunk: u64) -> JobOptions {
        JobOptions {
            chunk_size_bytes: chunk,
            retry_backoff_ms: 0,
            chunk_timeout_ms: None,
            ..JobOptions::default()
        }
    }

    #[test]
    fn phases_follow_the_state_machine() {
        let (engine, dev, progress) = engine(vec![4u8; 2_500], options(1_024), Arc::new(MemoryStore::new()));
        let events = progress.subscribe();
        let result = engine.run();
        progress.close();

        let mut phases: Vec<Phase> = events.map(|e| e.phase).collect();
        phases.dedup();
        assert_eq!(
            phases,
            vec![
                Phase::Writing,
                Phase::WrittenPendingVerification,
                Phase::Verifying,
                Phase::Completed
            ]
        );
        assert!(result.is_success());
        assert_eq!(result.bytes_written, 2_500);
        assert_eq!(dev.contents(), vec![4u8; 2_500]);
    }

    /// Remembers how many chunks each saved record claimed as written.
    #[derive(Default)]
    struct Recording {
        inner: MemoryStore,
        saved_written: Mutex<Vec<usize>>,
    }

    impl StateStore for Recording {
        fn load(&self, key: &StateKey) -> Result<Option<TransferState>, StoreError> {
            self.inner.load(key)
        }
        fn save(&self, key: &StateKey, state: &TransferState) -> Result<(), StoreError> {
            self.saved_written.lock().unwrap().push(state.written_count());
            self.inner.save(key, state)
        }
        fn delete(&self, key: &StateKey) -> Result<(), StoreError> {
            self.inner.delete(key)
        }
        fn keys(&self) -> Result<Vec<StateKey>, StoreError> {
            self.inner.keys()
        }
    }

    #[test]
    fn only_flushed_chunks_are_persisted() {
        let store = Arc::new(Recording::default());
        let opts = JobOptions {
            sync_interval_chunks: 2,
            ..options(512)
        };
        let (engine, dev, _progress) = engine(vec![1u8; 5 * 512], opts, store.clone());
        assert!(engine.run().is_success());

        let saved = store.saved_written.lock().unwrap().clone();
        assert!(saved.iter().all(|n| [0, 2, 4, 5].contains(n)), "{saved:?}");
        assert!(saved.contains(&5));
        assert!(dev.flush_count() >= 3);
        assert!(store.inner.is_empty());
    }

    #[test]
    fn cancellation_is_seen_before_the_first_chunk() {
        let store = Arc::new(MemoryStore::new());
        let (engine, dev, _progress) = engine(vec![1u8; 2_048], options(1_024), store.clone());
        engine.ctx.cancel.cancel();
        let result = engine.run();
        assert_eq!(result.outcome, JobOutcome::UserCancelled);
        assert_eq!(result.unresolved_chunks, vec![0, 1]);
        assert!(result.resumable);
        assert_eq!(dev.write_count(), 0);
        assert_eq!(store.len(), 1);
    }
}
