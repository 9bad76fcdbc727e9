//! RAM-backed devices for dry runs and tests.
//!
//! A [`MemoryDevice`] can be told to misbehave the way real USB sticks do:
//! disappear after some number of writes, fail transiently, silently corrupt
//! data, or stall.
use crate::device::TargetDevice;
use crate::error::DeviceError;
use crate::handle::{BlockDevice, DeviceBackend};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct DeviceState {
    data: Vec<u8>,
    writes: u64,
    bytes_written: u64,
    flushes: u64,
    removed: bool,
    remove_after_writes: Option<u64>,
    transient_failures: u32,
    corrupt_offsets: Vec<u64>,
    latency: Duration,
}

/// A shared view of one simulated device. Clones observe the same bytes.
#[derive(Clone, Debug)]
pub struct MemoryDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MemoryDevice {
    fn new(size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                data: vec![0u8; size],
                ..DeviceState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contents(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    /// Number of successful `write_at` calls.
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    pub fn bytes_written(&self) -> u64 {
        self.lock().bytes_written
    }

    pub fn flush_count(&self) -> u64 {
        self.lock().flushes
    }

    /// The device vanishes once `n` writes have succeeded.
    pub fn remove_after_writes(&self, n: u64) {
        self.lock().remove_after_writes = Some(n);
    }

    /// The next `n` writes fail with a retryable I/O error.
    pub fn fail_next_writes(&self, n: u32) {
        self.lock().transient_failures = n;
    }

    /// Writes covering `offset` store a flipped byte there.
    pub fn corrupt_at(&self, offset: u64) {
        self.lock().corrupt_offsets.push(offset);
    }

    /// Flips the stored byte at `offset` right now.
    pub fn damage(&self, offset: u64) {
        let mut st = self.lock();
        if let Some(b) = st.data.get_mut(offset as usize) {
            *b ^= 0xFF;
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Plugs a removed device back in and drops every scripted fault. The
    /// contents stay as they were.
    pub fn reconnect(&self) {
        let mut st = self.lock();
        st.removed = false;
        st.remove_after_writes = None;
        st.transient_failures = 0;
        st.corrupt_offsets.clear();
    }
}

/// Hands out [`MemoryDevice`]s by path.
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    devices: Arc<Mutex<HashMap<String, MemoryDevice>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plugs in a zero-filled device of `size` bytes at `path`.
    pub fn attach(&self, path: &str, size: u64) -> MemoryDevice {
        let dev = MemoryDevice::new(size as usize);
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), dev.clone());
        dev
    }

    pub fn device(&self, path: &str) -> Option<MemoryDevice> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }
}

impl DeviceBackend for MemoryBackend {
    fn open(&self, device: &TargetDevice) -> Result<Box<dyn BlockDevice>, DeviceError> {
        let id = device.id();
        let dev = self
            .device(&id)
            .ok_or_else(|| DeviceError::NotFound(id.clone()))?;
        if dev.lock().removed {
            return Err(DeviceError::NotFound(id));
        }
        Ok(Box::new(MemoryBlock { id, dev }))
    }
}

struct MemoryBlock {
    id: String,
    dev: MemoryDevice,
}

impl MemoryBlock {
    fn range(&self, len: usize, offset: u64, buf_len: usize) -> Result<std::ops::Range<usize>, DeviceError> {
        let start = offset as usize;
        let end = start + buf_len;
        if end > len {
            return Err(DeviceError::Io {
                device: self.id.clone(),
                source: io::Error::new(io::ErrorKind::UnexpectedEof, "access past end of device"),
            });
        }
        Ok(start..end)
    }
}

impl BlockDevice for MemoryBlock {
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), DeviceError> {
        let latency = self.dev.lock().latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let mut st = self.dev.lock();
        if st.removed {
            return Err(DeviceError::Removed(self.id.clone()));
        }
        if st.remove_after_writes.is_some_and(|n| st.writes >= n) {
            st.removed = true;
            return Err(DeviceError::Removed(self.id.clone()));
        }
        if st.transient_failures > 0 {
            st.transient_failures -= 1;
            return Err(DeviceError::Io {
                device: self.id.clone(),
                source: io::Error::other("simulated transient write error"),
            });
        }

        let range = self.range(st.data.len(), offset, buf.len())?;
        st.data[range.clone()].copy_from_slice(buf);
        let corrupt: Vec<u64> = st
            .corrupt_offsets
            .iter()
            .copied()
            .filter(|o| range.contains(&(*o as usize)))
            .collect();
        for o in corrupt {
            st.data[o as usize] ^= 0xFF;
        }
        st.writes += 1;
        st.bytes_written += buf.len() as u64;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        let st = self.dev.lock();
        if st.removed {
            return Err(DeviceError::Removed(self.id.clone()));
        }
        let range = self.range(st.data.len(), offset, buf.len())?;
        buf.copy_from_slice(&st.data[range]);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        let mut st = self.dev.lock();
        if st.removed {
            return Err(DeviceError::Removed(self.id.clone()));
        }
        st.flushes += 1;
        Ok(())
    }

    fn size(&self) -> Result<u64, DeviceError> {
        Ok(self.dev.lock().data.len() as u64)
    }
}
