use crate::device::TargetDevice;
use anyhow::{Context, Result, anyhow};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Linux reports block device sizes in 512-byte sectors regardless of the
/// device's logical block size.
const SECTOR_SIZE: u64 = 512;

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            if path_str[index + 1..].chars().all(|c| c.is_ascii_digit()) && index + 1 < path_str.len() {
                return PathBuf::from(&path_str[..index]);
            }
        }
    }

    path.to_path_buf()
}

/// Whether `partition` (e.g. "sdb1", "mmcblk0p2") belongs to `device` (e.g. "sdb").
fn is_partition_of(partition: &str, device: &str) -> bool {
    match partition.strip_prefix(device) {
        Some(rest) => {
            let rest = rest.strip_prefix('p').unwrap_or(rest);
            rest.is_empty() || rest.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Scans for all removable block devices on a Linux system.
///
/// Devices are found by walking `/sys/block`. The main system drive, loop
/// devices, non-removable devices and devices reporting a size of zero (often
/// empty card readers) are skipped. Mount points of each device's partitions
/// are collected so that validation can refuse mounted targets.
pub fn get_removable_devices() -> Result<Vec<TargetDevice>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let system_disk_parent = disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| get_parent_device_path(&PathBuf::from("/dev/").join(disk.name())))
        .ok_or_else(|| anyhow!("Could not determine system drive."))?;

    let mut devices = Vec::new();
    let block_dir = fs::read_dir("/sys/block").context("Failed to read /sys/block")?;

    for entry in block_dir.filter_map(Result::ok) {
        let device_name = entry.file_name().to_string_lossy().to_string();
        let device_path = PathBuf::from("/dev/").join(&device_name);

        if device_name.starts_with("loop") || device_path == system_disk_parent {
            continue;
        }

        let is_removable = read_sys_file(&device_name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);
        if !is_removable {
            continue;
        }

        let size_sectors = read_sys_file(&device_name, "size")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        if size_sectors == 0 {
            continue;
        }

        let mut device = TargetDevice::new(&device_path, size_sectors * SECTOR_SIZE, true);
        device.name = device_name.clone();
        device.mount_points = disks
            .iter()
            .filter(|disk| {
                let name = disk.name().to_string_lossy();
                let name = name.strip_prefix("/dev/").unwrap_or(&name);
                is_partition_of(name, &device_name)
            })
            .map(|disk| disk.mount_point().to_string_lossy().to_string())
            .filter(|mp| !mp.is_empty())
            .collect();

        devices.push(device);
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_map_to_their_disk() {
        assert_eq!(get_parent_device_path(Path::new("/dev/sdb1")), PathBuf::from("/dev/sdb"));
        assert_eq!(
            get_parent_device_path(Path::new("/dev/nvme0n1p2")),
            PathBuf::from("/dev/nvme0n1")
        );
        assert_eq!(
            get_parent_device_path(Path::new("/dev/mmcblk0p1")),
            PathBuf::from("/dev/mmcblk0")
        );
        assert_eq!(get_parent_device_path(Path::new("/dev/nvme0n1")), PathBuf::from("/dev/nvme0n1"));
    }

    #[test]
    fn partition_ownership() {
        assert!(is_partition_of("sdb1", "sdb"));
        assert!(is_partition_of("sdb", "sdb"));
        assert!(is_partition_of("mmcblk0p2", "mmcblk0"));
        assert!(!is_partition_of("sdbb1", "sdb"));
        assert!(!is_partition_of("sdc1", "sdb"));
    }
}
