//! Provides platform-specific functionality.
//!
//! This module contains the logic for interacting with the operating system to
//! discover removable block devices. Each submodule exposes the same public
//! API, selected with `#[cfg]`, so the rest of the library and its front ends
//! can use it without worrying about the underlying platform.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use self::windows::*;

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
pub fn get_removable_devices() -> anyhow::Result<Vec<crate::device::TargetDevice>> {
    anyhow::bail!("Device discovery is not supported on this platform.")
}
