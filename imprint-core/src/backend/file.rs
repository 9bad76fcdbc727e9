//! File-descriptor backed devices: raw block devices and plain image files.
use super::DeviceKind;
use crate::error::DeviceError;
use crate::handle::BlockDevice;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::{FileExt, OpenOptionsExt};
#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;
#[cfg(windows)]
use std::os::windows::fs::{FileExt, OpenOptionsExt};

// Use a 1 MiB buffer for I/O operations.
const BUFFER_SIZE: usize = 1024 * 1024;
// Unbuffered I/O needs offsets, lengths and memory aligned to the logical
// block size. 4 KiB covers both 512e and 4Kn drives.
const BLOCK_SIZE: usize = 4096;

#[cfg(target_os = "linux")]
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// A heap buffer whose usable window starts on a `BLOCK_SIZE` boundary.
struct AlignedBuf {
    buf: Vec<u8>,
    offset: usize,
}

impl AlignedBuf {
    fn new() -> Self {
        let buf = vec![0u8; BUFFER_SIZE + BLOCK_SIZE];
        let offset = buf.as_ptr().align_offset(BLOCK_SIZE);
        Self { buf, offset }
    }

    fn window(&mut self, len: usize) -> &mut [u8] {
        &mut self.buf[self.offset..self.offset + len]
    }
}

fn align_down(v: u64) -> u64 {
    v / BLOCK_SIZE as u64 * BLOCK_SIZE as u64
}

fn align_up(v: u64) -> u64 {
    v.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64
}

#[cfg(unix)]
fn pwrite_all(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    file.write_all_at(buf, offset)
}

#[cfg(unix)]
fn pread_exact(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn pwrite_all(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn pread_exact(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            n => {
                buf = &mut std::mem::take(&mut buf)[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

/// An opened raw device or image file.
pub struct FileDevice {
    id: String,
    file: File,
    unbuffered: bool,
    size: u64,
    scratch: AlignedBuf,
}

impl FileDevice {
    pub fn open(path: &Path, kind: DeviceKind) -> Result<Self, DeviceError> {
        let id = path.to_string_lossy().into_owned();
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);

        let unbuffered = kind == DeviceKind::Raw;
        if unbuffered {
            #[cfg(target_os = "linux")]
            opts.custom_flags(libc::O_DIRECT | libc::O_EXCL);
            // O_EXCL on a block device fails with EBUSY while anything else
            // (including the kernel, for mounted filesystems) holds it.
            #[cfg(all(unix, not(target_os = "linux")))]
            opts.custom_flags(libc::O_EXCL);
            #[cfg(windows)]
            opts.share_mode(0);
        }

        let file = opts.open(path).map_err(|e| DeviceError::from_io(&id, e))?;
        let size = device_size(&file, kind).map_err(|e| DeviceError::from_io(&id, e))?;

        Ok(Self {
            id,
            file,
            unbuffered,
            size,
            scratch: AlignedBuf::new(),
        })
    }

    /// End of the I/O window opened at `win_start` for a transfer ending at
    /// `end`. Device sizes are only sector aligned, so the last window stops
    /// at the device end rather than the next `BLOCK_SIZE` boundary.
    fn window_end(&self, win_start: u64, end: u64) -> u64 {
        align_up(end)
            .min(self.size.max(end))
            .min(win_start + BUFFER_SIZE as u64)
    }

    fn write_unbuffered(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let end = offset + data.len() as u64;
        let mut pos = offset;
        while pos < end {
            let win_start = align_down(pos);
            let win_end = self.window_end(win_start, end);
            let win_len = (win_end - win_start) as usize;
            let copy_end = end.min(win_end);
            let head = (pos - win_start) as usize;
            let n = (copy_end - pos) as usize;

            let window = self.scratch.window(win_len);
            if head != 0 || head + n != win_len {
                // Partial sectors at either edge: keep whatever the device
                // already holds outside the requested range.
                pread_exact(&self.file, window, win_start)?;
            }
            let src = (pos - offset) as usize;
            window[head..head + n].copy_from_slice(&data[src..src + n]);
            pwrite_all(&self.file, window, win_start)?;
            pos = copy_end;
        }
        Ok(())
    }

    fn read_unbuffered(&mut self, offset: u64, out: &mut [u8]) -> io::Result<()> {
        let end = offset + out.len() as u64;
        let mut pos = offset;
        while pos < end {
            let win_start = align_down(pos);
            let win_end = self.window_end(win_start, end);
            let win_len = (win_end - win_start) as usize;
            let copy_end = end.min(win_end);
            let head = (pos - win_start) as usize;
            let n = (copy_end - pos) as usize;

            let window = self.scratch.window(win_len);
            pread_exact(&self.file, window, win_start)?;
            let dst = (pos - offset) as usize;
            out[dst..dst + n].copy_from_slice(&window[head..head + n]);
            pos = copy_end;
        }
        Ok(())
    }
}

impl BlockDevice for FileDevice {
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), DeviceError> {
        if offset + buf.len() as u64 > self.size && self.unbuffered {
            return Err(DeviceError::Io {
                device: self.id.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "write past end of device"),
            });
        }
        let res = if self.unbuffered {
            self.write_unbuffered(offset, buf)
        } else {
            pwrite_all(&self.file, buf, offset)
        };
        res.map_err(|e| DeviceError::from_io(&self.id, e))
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        let res = if self.unbuffered {
            self.read_unbuffered(offset, buf)
        } else {
            pread_exact(&self.file, buf, offset)
        };
        res.map_err(|e| DeviceError::from_io(&self.id, e))
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        self.file
            .sync_data()
            .map_err(|e| DeviceError::from_io(&self.id, e))
    }

    fn size(&self) -> Result<u64, DeviceError> {
        Ok(self.size)
    }
}

#[cfg(target_os = "linux")]
fn device_size(file: &File, kind: DeviceKind) -> io::Result<u64> {
    if kind == DeviceKind::ImageFile {
        return Ok(file.metadata()?.len());
    }
    let mut size_bytes: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer we pass.
    unsafe {
        blkgetsize64(file.as_raw_fd(), &mut size_bytes)?;
    }
    Ok(size_bytes)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn device_size(file: &File, kind: DeviceKind) -> io::Result<u64> {
    if kind == DeviceKind::ImageFile {
        return Ok(file.metadata()?.len());
    }
    use std::io::{Seek, SeekFrom};
    let mut f = file;
    f.seek(SeekFrom::End(0))
}

#[cfg(windows)]
fn device_size(file: &File, kind: DeviceKind) -> io::Result<u64> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::System::IO::DeviceIoControl;
    use windows_sys::Win32::System::Ioctl::{GET_LENGTH_INFORMATION, IOCTL_DISK_GET_LENGTH_INFO};

    if kind == DeviceKind::ImageFile {
        return Ok(file.metadata()?.len());
    }
    let mut info = GET_LENGTH_INFORMATION { Length: 0 };
    let mut returned = 0u32;
    // SAFETY: the output buffer is a properly sized GET_LENGTH_INFORMATION.
    let ok = unsafe {
        DeviceIoControl(
            file.as_raw_handle() as _,
            IOCTL_DISK_GET_LENGTH_INFO,
            std::ptr::null(),
            0,
            &mut info as *mut _ as *mut _,
            std::mem::size_of::<GET_LENGTH_INFORMATION>() as u32,
            &mut returned,
            std::ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(info.Length as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0), 0);
        assert_eq!(align_down(4095), 0);
        assert_eq!(align_down(4097), 4096);
        assert_eq!(align_up(1), 4096);
        assert_eq!(align_up(8192), 8192);
    }

    #[test]
    fn image_file_positional_io() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(10_000).unwrap();

        let mut dev = FileDevice::open(tmp.path(), DeviceKind::ImageFile).unwrap();
        assert_eq!(dev.size().unwrap(), 10_000);
        dev.write_at(9_000, &[0xAB; 1000]).unwrap();
        dev.write_at(0, b"boot").unwrap();
        dev.flush().unwrap();

        let mut buf = [0u8; 4];
        dev.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"boot");
        let mut tail = [0u8; 1000];
        dev.read_at(9_000, &mut tail).unwrap();
        assert!(tail.iter().all(|b| *b == 0xAB));
    }

    #[test]
    fn unaligned_writes_preserve_neighbouring_bytes() {
        // Exercise the aligned read-modify-write path on a plain file.
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(3 * BLOCK_SIZE as u64).unwrap();
        let mut dev = FileDevice::open(tmp.path(), DeviceKind::ImageFile).unwrap();
        dev.write_at(0, &vec![0x11; 3 * BLOCK_SIZE]).unwrap();
        dev.unbuffered = true;

        dev.write_at(100, &[0x22; 5000]).unwrap();

        let mut all = vec![0u8; 3 * BLOCK_SIZE];
        dev.read_at(0, &mut all).unwrap();
        assert!(all[..100].iter().all(|b| *b == 0x11));
        assert!(all[100..5100].iter().all(|b| *b == 0x22));
        assert!(all[5100..].iter().all(|b| *b == 0x11));
    }

    #[test]
    fn unbuffered_io_reaches_a_sector_aligned_device_end() {
        // Two full blocks plus one 512-byte sector.
        let size = 2 * BLOCK_SIZE as u64 + 512;
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(size).unwrap();
        let mut dev = FileDevice::open(tmp.path(), DeviceKind::ImageFile).unwrap();
        dev.write_at(0, &vec![0x11; size as usize]).unwrap();
        dev.unbuffered = true;

        dev.write_at(size - 100, &[0x22; 100]).unwrap();

        let mut tail = [0u8; 600];
        dev.read_at(size - 600, &mut tail).unwrap();
        assert!(tail[..500].iter().all(|b| *b == 0x11));
        assert!(tail[500..].iter().all(|b| *b == 0x22));
        assert_eq!(tmp.as_file().metadata().unwrap().len(), size);
    }
}
