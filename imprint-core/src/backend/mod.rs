//! Concrete [`DeviceBackend`](crate::handle::DeviceBackend) implementations.
//!
//! [`SystemBackend`] is what a front end normally hands to a job. It picks the
//! I/O strategy from the shape of the device identifier: raw device nodes get
//! exclusive, unbuffered access, anything else is treated as a disk image file
//! written in place.

pub mod file;
pub mod memory;

use crate::device::TargetDevice;
use crate::error::DeviceError;
use crate::handle::{BlockDevice, DeviceBackend};
use std::path::Path;

/// How a device identifier is accessed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    /// A whole-disk node such as `/dev/sdb`, `/dev/rdisk4` or `\\.\PhysicalDrive2`.
    Raw,
    /// A regular file standing in for a disk.
    ImageFile,
}

impl DeviceKind {
    pub fn of(path: &Path) -> Self {
        let s = path.to_string_lossy();
        if s.starts_with("/dev/") || s.starts_with(r"\\.\") {
            DeviceKind::Raw
        } else {
            DeviceKind::ImageFile
        }
    }
}

/// Opens real devices on the host.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemBackend;

impl DeviceBackend for SystemBackend {
    fn open(&self, device: &TargetDevice) -> Result<Box<dyn BlockDevice>, DeviceError> {
        let kind = DeviceKind::of(&device.path);
        Ok(Box::new(file::FileDevice::open(&device.path, kind)?))
    }
}
