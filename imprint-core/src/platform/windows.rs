use crate::device::TargetDevice;
use anyhow::{Result, bail};

/// Scans for all removable block devices on a Windows system.
///
/// Discovery is not available on Windows yet; callers can still build a
/// [`TargetDevice`] for a `\\.\PhysicalDriveN` path themselves and write to
/// it, since the device backend supports raw Windows drives.
pub fn get_removable_devices() -> Result<Vec<TargetDevice>> {
    // TODO: enumerate disks with SetupDiGetClassDevsW and query
    // IOCTL_STORAGE_QUERY_PROPERTY for the removable flag.
    bail!("Device discovery is not supported on Windows yet; pass the device path explicitly.")
}
