//! The read-only image that a job writes out.
//!
//! Compressed images (`.gz`, `.xz`, `.zst`) are unpacked to a temporary file
//! first, because chunks are read at arbitrary offsets and by several engines
//! at once. All reads are positional; there is no shared cursor.
use crate::cancel::CancelToken;
use crate::error::ImageError;
use crate::manifest::ChunkManifest;
use flate2::read::GzDecoder;
use log::debug;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempPath};
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

/// Which preparation step an [`ImageSource::open`] progress callback refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Preparation {
    Decompress,
    Checksum,
}

enum Backing {
    File(File),
    Memory(Arc<[u8]>),
}

/// An immutable image shared by every engine of a job.
pub struct ImageSource {
    path: PathBuf,
    backing: Backing,
    size: u64,
    checksum: [u8; 32],
    manifest: Option<ChunkManifest>,
    // Deletes the decompressed copy when the source goes away.
    _temp: Option<TempPath>,
}

impl std::fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSource")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("checksum", &self.checksum_hex())
            .field("manifest", &self.manifest.is_some())
            .finish()
    }
}

/// Compression formats recognised by file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Codec {
    Gzip,
    Xz,
    Zstd,
}

impl Codec {
    fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "gz" | "gzip" => Some(Self::Gzip),
            "xz" => Some(Self::Xz),
            "zst" | "zstd" => Some(Self::Zstd),
            _ => None,
        }
    }

    fn decoder(self, file: File) -> io::Result<Box<dyn Read>> {
        let input = BufReader::new(file);
        Ok(match self {
            Self::Gzip => Box::new(GzDecoder::new(input)),
            Self::Xz => Box::new(XzDecoder::new(input)),
            Self::Zstd => Box::new(ZstdDecoder::new(input)?),
        })
    }
}

pub fn is_compressed(path: &Path) -> bool {
    Codec::from_path(path).is_some()
}

/// Unpacks a compressed image into a temporary file, or returns `None` when
/// `path` is not compressed.
///
/// The streams can only be read front to back, while engines read chunks at
/// their own offsets and verification reads them a second time, so the whole
/// image is materialised once before the job starts. `on_progress` receives
/// the number of uncompressed bytes produced so far.
fn decompress_image<F>(path: &Path, cancel: &CancelToken, mut on_progress: F) -> io::Result<Option<TempPath>>
where
    F: FnMut(u64),
{
    let Some(codec) = Codec::from_path(path) else {
        return Ok(None);
    };
    let mut decoder = codec.decoder(File::open(path)?)?;

    let mut unpacked = NamedTempFile::new()?;
    {
        let mut out = BufWriter::new(&mut unpacked);
        let mut block = vec![0u8; 64 * 1024];
        let mut produced: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "image preparation cancelled",
                ));
            }
            let n = decoder.read(&mut block)?;
            if n == 0 {
                break;
            }
            out.write_all(&block[..n])?;
            produced += n as u64;
            on_progress(produced);
        }
        out.flush()?;
    }
    debug!("unpacked {} ({codec:?}) to {}", path.display(), unpacked.path().display());

    Ok(Some(unpacked.into_temp_path()))
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
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

impl ImageSource {
    /// Opens an image, decompressing it if needed, and computes its SHA-256.
    pub fn open(path: &Path) -> Result<Self, ImageError> {
        Self::open_with_progress(path, &CancelToken::new(), |_, _| {})
    }

    /// Like [`ImageSource::open`], reporting bytes processed for each
    /// preparation step and stopping early if `cancel` fires.
    pub fn open_with_progress<F>(
        path: &Path,
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> Result<Self, ImageError>
    where
        F: FnMut(Preparation, u64),
    {
        let io_err = |source: io::Error| {
            if source.kind() == io::ErrorKind::Interrupted {
                ImageError::Cancelled
            } else {
                ImageError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        };

        let temp = decompress_image(path, cancel, |n| on_progress(Preparation::Decompress, n))
            .map_err(io_err)?;
        let data_path = temp.as_ref().map(|t| t.to_path_buf()).unwrap_or_else(|| path.to_path_buf());

        let file = File::open(&data_path).map_err(io_err)?;
        let size = file.metadata().map_err(io_err)?.len();
        if size == 0 {
            return Err(ImageError::Empty(path.to_path_buf()));
        }

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut done: u64 = 0;
        while done < size {
            if cancel.is_cancelled() {
                return Err(ImageError::Cancelled);
            }
            let n = (size - done).min(BUFFER_SIZE as u64) as usize;
            read_exact_at(&file, &mut buf[..n], done).map_err(io_err)?;
            hasher.update(&buf[..n]);
            done += n as u64;
            on_progress(Preparation::Checksum, done);
        }

        Ok(Self {
            path: path.to_path_buf(),
            backing: Backing::File(file),
            size,
            checksum: hasher.finalize().into(),
            manifest: None,
            _temp: temp,
        })
    }

    /// An image held in memory, for tests and generated payloads.
    pub fn from_bytes(name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        let checksum = Sha256::digest(&bytes).into();
        Self {
            path: PathBuf::from(name),
            size: bytes.len() as u64,
            backing: Backing::Memory(bytes.into()),
            checksum,
            manifest: None,
            _temp: None,
        }
    }

    /// Attaches per-chunk digests used during verification instead of
    /// re-reading the source.
    pub fn with_manifest(mut self, manifest: ChunkManifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn checksum(&self) -> &[u8; 32] {
        &self.checksum
    }

    pub fn checksum_hex(&self) -> String {
        hex::encode(self.checksum)
    }

    pub fn manifest(&self) -> Option<&ChunkManifest> {
        self.manifest.as_ref()
    }

    /// Fills `buf` with image bytes starting at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        if offset + buf.len() as u64 > self.size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of image",
            ));
        }
        match &self.backing {
            Backing::File(file) => read_exact_at(file, buf, offset),
            Backing::Memory(bytes) => {
                let start = offset as usize;
                buf.copy_from_slice(&bytes[start..start + buf.len()]);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn payload() -> Vec<u8> {
        (0..200_000u32).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn plain_image_is_read_in_place() {
        let mut tmp = tempfile::Builder::new().suffix(".img").tempfile().unwrap();
        tmp.write_all(&payload()).unwrap();

        let src = ImageSource::open(tmp.path()).unwrap();
        assert_eq!(src.size(), 200_000);
        assert_eq!(src.checksum_hex(), hex::encode(Sha256::digest(payload())));

        let mut buf = [0u8; 10];
        src.read_at(1000, &mut buf).unwrap();
        assert_eq!(&buf[..], &payload()[1000..1010]);
        assert!(src.read_at(199_995, &mut buf).is_err());
    }

    #[test]
    fn gzip_image_is_decompressed() {
        let mut tmp = tempfile::Builder::new().suffix(".img.gz").tempfile().unwrap();
        let mut enc = GzEncoder::new(Vec::new(), Compression::fast());
        enc.write_all(&payload()).unwrap();
        tmp.write_all(&enc.finish().unwrap()).unwrap();

        let mut saw_decompress = false;
        let src = ImageSource::open_with_progress(tmp.path(), &CancelToken::new(), |step, _| {
            if step == Preparation::Decompress {
                saw_decompress = true;
            }
        })
        .unwrap();
        assert!(saw_decompress);
        assert_eq!(src.size(), 200_000);
        assert_eq!(src.checksum_hex(), ImageSource::from_bytes("x", payload()).checksum_hex());
    }

    #[test]
    fn empty_image_is_rejected() {
        let tmp = tempfile::Builder::new().suffix(".iso").tempfile().unwrap();
        assert!(matches!(
            ImageSource::open(tmp.path()),
            Err(ImageError::Empty(_))
        ));
    }

    #[test]
    fn cancelled_open_stops() {
        let mut tmp = tempfile::Builder::new().suffix(".img").tempfile().unwrap();
        tmp.write_all(&payload()).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            ImageSource::open_with_progress(tmp.path(), &cancel, |_, _| {}),
            Err(ImageError::Cancelled)
        ));
    }

    #[test]
    fn concurrent_readers_do_not_share_a_cursor() {
        let src = Arc::new(ImageSource::from_bytes("mem", payload()));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let src = src.clone();
                std::thread::spawn(move || {
                    let mut buf = [0u8; 100];
                    for i in 0..50u64 {
                        let off = (t * 50 + i) * 100;
                        src.read_at(off, &mut buf).unwrap();
                        assert_eq!(buf[0], (off % 251) as u8);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn compression_detection() {
        assert!(is_compressed(Path::new("a.img.xz")));
        assert!(is_compressed(Path::new("a.IMG.GZ")));
        assert!(!is_compressed(Path::new("a.iso")));
        assert!(!is_compressed(Path::new("noextension")));
        assert_eq!(Codec::from_path(Path::new("a.img.zst")), Some(Codec::Zstd));
        assert_eq!(Codec::from_path(Path::new("a.img.gzip")), Some(Codec::Gzip));
    }
}
