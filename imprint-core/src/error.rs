//! Error types shared across the engine.
//!
//! Errors are split by the layer that produces them. Per-device faults during a
//! job never escape as errors from the coordinator: they are folded into the
//! device's [`crate::report::JobResult`]. Only a [`ValidationError`] can stop
//! a job from starting.
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by the device handle layer.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {0} is already in use")]
    Busy(String),

    #[error("device {0} was not found")]
    NotFound(String),

    #[error("permission denied opening {0}")]
    PermissionDenied(String),

    #[error("device {0} was removed")]
    Removed(String),

    #[error("{op} on {device} timed out after {elapsed_ms} ms")]
    TimedOut {
        device: String,
        op: &'static str,
        elapsed_ms: u128,
    },

    #[error("I/O error on {device}: {source}")]
    Io {
        device: String,
        #[source]
        source: io::Error,
    },
}

impl DeviceError {
    /// Maps an OS error raised while operating on `device` to the closest variant.
    pub fn from_io(device: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(device.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(device.to_string()),
            _ => match err.raw_os_error() {
                #[cfg(unix)]
                Some(libc::EBUSY) => Self::Busy(device.to_string()),
                // The kernel reports a yanked USB stick as ENODEV or ENXIO.
                #[cfg(unix)]
                Some(libc::ENODEV) | Some(libc::ENXIO) => Self::Removed(device.to_string()),
                _ => Self::Io {
                    device: device.to_string(),
                    source: err,
                },
            },
        }
    }

    /// Whether a retry of the same operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::TimedOut { .. })
    }

    /// Whether the transfer state should be kept for a later resume after this error.
    pub fn is_resumable(&self) -> bool {
        !matches!(self, Self::PermissionDenied(_))
    }
}

/// A reason a job refuses to start. Reported before any byte is written.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("no target devices were given")]
    NoTargets,

    #[error("{device} holds {capacity} bytes but the image needs {required}")]
    CapacityTooSmall {
        device: String,
        capacity: u64,
        required: u64,
    },

    #[error("{0} is not a removable device")]
    NotRemovable(String),

    #[error("{0} does not exist")]
    NotFound(String),

    #[error("{device} is blocked as a target: {reason}")]
    Blocked { device: String, reason: String },

    #[error("{device} has mounted partitions: {mounts}")]
    Mounted { device: String, mounts: String },

    #[error("{0} is listed more than once")]
    Duplicate(String),

    #[error("could not acquire {device}: {source}")]
    Unavailable {
        device: String,
        #[source]
        source: DeviceError,
    },

    #[error("invalid job options: {0}")]
    InvalidOptions(String),

    #[error("image manifest does not fit the job: {0}")]
    Manifest(#[source] ImageError),
}

/// Failures of the resumable-state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt state record {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures while preparing or reading an image source.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("cannot read image {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("image {0} is empty")]
    Empty(PathBuf),

    #[error("operation cancelled by user")]
    Cancelled,

    #[error("manifest covers {manifest} chunks of {manifest_chunk} bytes, plan has {plan} chunks of {plan_chunk} bytes")]
    ManifestMismatch {
        manifest: usize,
        manifest_chunk: u64,
        plan: usize,
        plan_chunk: u64,
    },

    #[error("invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transient_removal_is_not() {
        let io = DeviceError::Io {
            device: "/dev/sdx".into(),
            source: io::Error::other("short write"),
        };
        assert!(io.is_transient());
        assert!(!DeviceError::Removed("/dev/sdx".into()).is_transient());
        assert!(DeviceError::Removed("/dev/sdx".into()).is_resumable());
        assert!(!DeviceError::PermissionDenied("/dev/sdx".into()).is_resumable());
    }

    #[test]
    fn from_io_maps_not_found_and_permission() {
        let e = DeviceError::from_io("/dev/sdz", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(e, DeviceError::NotFound(_)));
        let e = DeviceError::from_io(
            "/dev/sdz",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(e, DeviceError::PermissionDenied(_)));
    }

    #[cfg(unix)]
    #[test]
    fn from_io_maps_enodev_to_removed() {
        let e = DeviceError::from_io("/dev/sdz", io::Error::from_raw_os_error(libc::ENODEV));
        assert!(matches!(e, DeviceError::Removed(_)));
    }
}
