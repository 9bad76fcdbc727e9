use crate::error::ValidationError;
use std::fmt;
use std::path::{Path, PathBuf};

/// A block device that a job may target.
///
/// Instances come from [`crate::platform::get_removable_devices`] or are built by
/// the caller. The engine never trusts these fields blindly: the capacity is
/// re-read from the opened handle before any write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetDevice {
    /// The system path to the device (e.g., `/dev/sda` or `\\.\PhysicalDrive1`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sda").
    pub name: String,
    /// Reported capacity in bytes.
    pub capacity_bytes: u64,
    /// Whether the OS flags the device as removable media.
    pub removable: bool,
    /// Mount points of any of the device's partitions.
    pub mount_points: Vec<String>,
}

impl TargetDevice {
    pub fn new(path: impl Into<PathBuf>, capacity_bytes: u64, removable: bool) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            path,
            name,
            capacity_bytes,
            removable,
            mount_points: Vec::new(),
        }
    }

    /// The identifier used for locking, state keys and progress events.
    pub fn id(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn size_gb(&self) -> f64 {
        self.capacity_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }

    /// Pre-flight checks run for every target before a job starts.
    pub fn validate(&self, image_size: u64, require_removable: bool) -> Result<(), ValidationError> {
        if let Some(reason) = blocked_reason(&self.path) {
            return Err(ValidationError::Blocked {
                device: self.id(),
                reason,
            });
        }
        if require_removable && !self.removable {
            return Err(ValidationError::NotRemovable(self.id()));
        }
        if !self.mount_points.is_empty() {
            return Err(ValidationError::Mounted {
                device: self.id(),
                mounts: self.mount_points.join(", "),
            });
        }
        if self.capacity_bytes < image_size {
            return Err(ValidationError::CapacityTooSmall {
                device: self.id(),
                capacity: self.capacity_bytes,
                required: image_size,
            });
        }
        Ok(())
    }
}

impl fmt::Display for TargetDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = if !self.mount_points.is_empty() {
            format!("[Mounted at {}]", self.mount_points.join(", "))
        } else {
            "[Not mounted]".to_string()
        };

        write!(
            f,
            "{:<15} {:.1} GB {}",
            self.path.display(),
            self.size_gb(),
            mount_info
        )
    }
}

/// Returns why a device path must never be written to, if it matches a node
/// class that is never a physical removable drive or is almost always the
/// system disk.
pub fn blocked_reason(path: &Path) -> Option<String> {
    let s = path.to_string_lossy();

    for (prefix, what) in [
        ("/dev/loop", "loop device"),
        ("/dev/dm-", "device-mapper node"),
        ("/dev/md", "software RAID array"),
    ] {
        if let Some(rest) = s.strip_prefix(prefix) {
            if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
                return Some(what.to_string());
            }
        }
    }

    if s.eq_ignore_ascii_case(r"\\.\PhysicalDrive0") {
        return Some("primary system drive".to_string());
    }
    if s.len() == 6 && s.to_ascii_uppercase().starts_with(r"\\.\") && s.ends_with(':') {
        return Some("volume letter, not a physical drive".to_string());
    }

    if s == "/dev/disk0" || s == "/dev/rdisk0" {
        return Some("primary system drive".to_string());
    }
    if let Some(rest) = s.strip_prefix("/dev/disk") {
        if let Some((disk, part)) = rest.split_once('s') {
            if disk.chars().all(|c| c.is_ascii_digit()) && part.chars().all(|c| c.is_ascii_digit()) {
                return Some("partition, not a whole disk".to_string());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_small_devices() {
        let dev = TargetDevice::new("/dev/sdb", 1_000, true);
        let err = dev.validate(2_000, true).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::CapacityTooSmall {
                capacity: 1_000,
                required: 2_000,
                ..
            }
        ));
        assert!(dev.validate(1_000, true).is_ok());
    }

    #[test]
    fn removability_can_be_waived() {
        let dev = TargetDevice::new("/dev/sdc", 10_000, false);
        assert!(matches!(
            dev.validate(10, true),
            Err(ValidationError::NotRemovable(_))
        ));
        assert!(dev.validate(10, false).is_ok());
    }

    #[test]
    fn mounted_devices_are_refused() {
        let mut dev = TargetDevice::new("/dev/sdd", 10_000, true);
        dev.mount_points.push("/media/usb".into());
        assert!(matches!(
            dev.validate(10, true),
            Err(ValidationError::Mounted { .. })
        ));
    }

    #[test]
    fn blocked_patterns() {
        assert!(blocked_reason(Path::new("/dev/loop3")).is_some());
        assert!(blocked_reason(Path::new("/dev/dm-0")).is_some());
        assert!(blocked_reason(Path::new("/dev/md127")).is_some());
        assert!(blocked_reason(Path::new(r"\\.\PhysicalDrive0")).is_some());
        assert!(blocked_reason(Path::new("/dev/disk0")).is_some());
        assert!(blocked_reason(Path::new("/dev/disk2s1")).is_some());

        assert!(blocked_reason(Path::new("/dev/sdb")).is_none());
        assert!(blocked_reason(Path::new("/dev/mmcblk0")).is_none());
        assert!(blocked_reason(Path::new("/dev/disk2")).is_none());
        assert!(blocked_reason(Path::new(r"\\.\PhysicalDrive2")).is_none());
    }

    #[test]
    fn display_matches_listing_format() {
        let dev = TargetDevice::new("/dev/sdb", 16 * 1024 * 1024 * 1024, true);
        let s = dev.to_string();
        assert!(s.starts_with("/dev/sdb"));
        assert!(s.contains("16.0 GB"));
        assert!(s.ends_with("[Not mounted]"));
    }
}
