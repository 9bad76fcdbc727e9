//! Read-back verification of written chunks.
//!
//! Verification only reads from the device. A chunk that reads back
//! differently from the source is marked mismatched: it stays written, loses
//! any verified mark, and is picked up for rewriting by the next resumed job.
use crate::error::DeviceError;
use crate::handle::DeviceHandle;
use crate::image::ImageSource;
use crate::plan::{Chunk, ChunkPlan};
use crate::retry::RetryPolicy;
use crate::state::TransferState;
use log::{debug, warn};
use std::io;
use thiserror::Error;

/// Why a chunk loop stopped before running out of chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    Thermal,
}

/// Hook consulted around every chunk of a write or verification pass.
pub trait ChunkGate {
    /// Called before touching the device for the next chunk. May block, e.g.
    /// during a thermal pause.
    fn before_chunk(&mut self, state: &mut TransferState) -> Result<(), Interrupt>;
    /// Called once a chunk has been handled and recorded in `state`.
    fn after_chunk(&mut self, state: &mut TransferState, chunk: &Chunk);
}

/// A gate that never interrupts and observes nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenGate;

impl ChunkGate for OpenGate {
    fn before_chunk(&mut self, _state: &mut TransferState) -> Result<(), Interrupt> {
        Ok(())
    }

    fn after_chunk(&mut self, _state: &mut TransferState, _chunk: &Chunk) {}
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("cannot re-read image: {0}")]
    Source(#[source] io::Error),

    #[error("verification interrupted: {0:?}")]
    Interrupted(Interrupt),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyOutcome {
    /// Chunks read back during this pass.
    pub checked: usize,
    /// Every chunk currently known not to match, including earlier passes.
    pub mismatched: Vec<usize>,
}

impl VerifyOutcome {
    pub fn passed(&self) -> bool {
        self.mismatched.is_empty()
    }
}

pub struct Verifier<'a> {
    image: &'a ImageSource,
    plan: &'a ChunkPlan,
    retry: RetryPolicy,
    device_buf: Vec<u8>,
    source_buf: Vec<u8>,
}

impl<'a> Verifier<'a> {
    pub fn new(image: &'a ImageSource, plan: &'a ChunkPlan) -> Self {
        let n = plan.max_chunk_len();
        Self {
            image,
            plan,
            retry: RetryPolicy::none(),
            device_buf: vec![0u8; n],
            source_buf: Vec::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reads one chunk back and compares it with the source, or with the
    /// image's manifest when it has one.
    pub fn check_chunk(&mut self, handle: &mut DeviceHandle, chunk: &Chunk) -> Result<bool, VerifyError> {
        let len = chunk.len as usize;
        let device_data = &mut self.device_buf[..len];
        self.retry.run("read-back", || handle.read_at(chunk.offset, device_data))?;

        if let Some(manifest) = self.image.manifest() {
            return Ok(manifest.matches(chunk.index, &self.device_buf[..len]));
        }

        if self.source_buf.len() < len {
            self.source_buf.resize(self.plan.max_chunk_len(), 0);
        }
        let source_data = &mut self.source_buf[..len];
        self.image
            .read_at(chunk.offset, source_data)
            .map_err(VerifyError::Source)?;
        Ok(self.device_buf[..len] == self.source_buf[..len])
    }

    /// Verifies every written, unverified chunk recorded in `state`.
    ///
    /// Chunks already verified are not read again, so a second pass over a
    /// fully verified state touches nothing.
    pub fn run(
        &mut self,
        handle: &mut DeviceHandle,
        state: &mut TransferState,
        gate: &mut dyn ChunkGate,
    ) -> Result<VerifyOutcome, VerifyError> {
        let pending: Vec<Chunk> = self.plan.pending_verification(state).collect();
        let mut checked = 0;

        for chunk in &pending {
            gate.before_chunk(state).map_err(VerifyError::Interrupted)?;
            if self.check_chunk(handle, chunk)? {
                state.mark_verified(chunk.index);
            } else {
                warn!(
                    "{}: chunk {} (bytes {}..{}) does not match the image",
                    handle.id(),
                    chunk.index,
                    chunk.offset,
                    chunk.end()
                );
                state.mark_mismatched(chunk.index);
            }
            checked += 1;
            gate.after_chunk(state, chunk);
        }

        debug!("{}: verified {checked} chunks", handle.id());
        Ok(VerifyOutcome {
            checked,
            mismatched: state.mismatched_chunks(),
        })
    }
}
