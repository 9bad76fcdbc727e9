//! Exclusive, offset-addressed access to a block device.
//!
//! Platform code implements [`BlockDevice`] and [`DeviceBackend`]; the rest of
//! the engine only ever sees a [`DeviceHandle`], which owns both the open
//! device and its lock and gives both back on drop, whatever the exit path.
use crate::device::TargetDevice;
use crate::error::DeviceError;
use log::debug;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

/// Low-level positional I/O on an opened device.
///
/// Every call names its offset explicitly. Implementations must not keep an
/// implicit cursor that later calls depend on.
pub trait BlockDevice: Send {
    /// Writes all of `buf` starting at byte `offset`.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), DeviceError>;
    /// Fills all of `buf` from byte `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError>;
    /// Pushes buffered writes down to the medium.
    fn flush(&mut self) -> Result<(), DeviceError>;
    /// Capacity of the opened device in bytes.
    fn size(&self) -> Result<u64, DeviceError>;
}

/// Opens [`BlockDevice`]s for a family of device identifiers.
pub trait DeviceBackend: Send + Sync {
    fn open(&self, device: &TargetDevice) -> Result<Box<dyn BlockDevice>, DeviceError>;
}

/// Set of device identifiers currently held by a handle.
///
/// Cloning shares the same set. [`DeviceLocks::global`] is the registry used by
/// default so that two jobs in one process can't grab the same drive.
#[derive(Clone, Debug, Default)]
pub struct DeviceLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> Self {
        static GLOBAL: OnceLock<DeviceLocks> = OnceLock::new();
        GLOBAL.get_or_init(DeviceLocks::new).clone()
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    fn acquire(&self, id: &str) -> Result<LockGuard, DeviceError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(id.to_string()) {
            return Err(DeviceError::Busy(id.to_string()));
        }
        Ok(LockGuard {
            id: id.to_string(),
            locks: self.clone(),
        })
    }
}

struct LockGuard {
    id: String,
    locks: DeviceLocks,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        debug!("released lock on {}", self.id);
    }
}

/// An open, exclusively locked device.
pub struct DeviceHandle {
    id: String,
    timeout: Option<Duration>,
    // Field order matters: the device is closed before the lock is released.
    inner: Box<dyn BlockDevice>,
    _lock: LockGuard,
}

impl DeviceHandle {
    /// Locks `device` in `locks`, then opens it through `backend`.
    ///
    /// Fails with [`DeviceError::Busy`] if another handle holds the device.
    pub fn open(
        backend: &dyn DeviceBackend,
        locks: &DeviceLocks,
        device: &TargetDevice,
    ) -> Result<Self, DeviceError> {
        let id = device.id();
        let lock = locks.acquire(&id)?;
        // On failure `lock` drops here and the device is free again.
        let inner = backend.open(device)?;
        debug!("opened {id}");
        Ok(Self {
            id,
            timeout: None,
            inner,
            _lock: lock,
        })
    }

    /// Any single operation slower than `timeout` is reported as
    /// [`DeviceError::TimedOut`] once it returns.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), DeviceError> {
        let started = Instant::now();
        self.inner.write_at(offset, buf)?;
        self.check_elapsed("write", started)
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        let started = Instant::now();
        self.inner.read_at(offset, buf)?;
        self.check_elapsed("read", started)
    }

    pub fn flush(&mut self) -> Result<(), DeviceError> {
        let started = Instant::now();
        self.inner.flush()?;
        self.check_elapsed("flush", started)
    }

    pub fn size(&self) -> Result<u64, DeviceError> {
        self.inner.size()
    }

    /// Flushes and releases the device. Dropping the handle releases it too,
    /// but without reporting a failed final flush.
    pub fn close(mut self) -> Result<(), DeviceError> {
        self.inner.flush()
    }

    fn check_elapsed(&self, op: &'static str, started: Instant) -> Result<(), DeviceError> {
        let elapsed = started.elapsed();
        match self.timeout {
            Some(limit) if elapsed > limit => Err(DeviceError::TimedOut {
                device: self.id.clone(),
                op,
                elapsed_ms: elapsed.as_millis(),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn target(path: &str) -> TargetDevice {
        TargetDevice::new(path, 4096, true)
    }

    #[test]
    fn second_open_is_busy_until_first_is_dropped() {
        let backend = MemoryBackend::new();
        backend.attach("/dev/mem0", 4096);
        let locks = DeviceLocks::new();

        let first = DeviceHandle::open(&backend, &locks, &target("/dev/mem0")).unwrap();
        assert!(locks.is_locked("/dev/mem0"));
        let second = DeviceHandle::open(&backend, &locks, &target("/dev/mem0"));
        assert!(matches!(second, Err(DeviceError::Busy(_))));

        drop(first);
        assert!(!locks.is_locked("/dev/mem0"));
        assert!(DeviceHandle::open(&backend, &locks, &target("/dev/mem0")).is_ok());
    }

    #[test]
    fn failed_open_releases_lock() {
        let backend = MemoryBackend::new();
        let locks = DeviceLocks::new();
        let err = DeviceHandle::open(&backend, &locks, &target("/dev/missing"));
        assert!(matches!(err, Err(DeviceError::NotFound(_))));
        assert!(!locks.is_locked("/dev/missing"));
    }

    #[test]
    fn lock_is_released_on_panic() {
        let backend = MemoryBackend::new();
        backend.attach("/dev/mem1", 4096);
        let locks = DeviceLocks::new();

        let l = locks.clone();
        let b = backend.clone();
        let result = std::thread::spawn(move || {
            let _h = DeviceHandle::open(&b, &l, &target("/dev/mem1")).unwrap();
            panic!("engine blew up");
        })
        .join();
        assert!(result.is_err());
        assert!(!locks.is_locked("/dev/mem1"));
    }

    #[test]
    fn slow_operations_report_timeout() {
        let backend = MemoryBackend::new();
        let dev = backend.attach("/dev/mem2", 4096);
        dev.set_latency(Duration::from_millis(20));
        let locks = DeviceLocks::new();

        let mut h = DeviceHandle::open(&backend, &locks, &target("/dev/mem2"))
            .unwrap()
            .with_timeout(Some(Duration::from_millis(1)));
        let err = h.write_at(0, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, DeviceError::TimedOut { op: "write", .. }));
        assert!(err.is_transient());
    }
}
