//! Per-chunk SHA-256 digests of an image.
use crate::error::ImageError;
use crate::image::ImageSource;
use crate::plan::ChunkPlan;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Digests of every chunk of an image for one chunk size.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub chunk_size: u64,
    pub image_size: u64,
    /// Lower-case hex SHA-256 per chunk, in chunk order.
    pub digests: Vec<String>,
}

impl ChunkManifest {
    /// Reads `source` once and hashes every chunk of `plan`.
    pub fn compute(source: &ImageSource, plan: &ChunkPlan) -> std::io::Result<Self> {
        let mut buf = vec![0u8; plan.max_chunk_len()];
        let mut digests = Vec::with_capacity(plan.chunk_count());
        for chunk in plan.chunks() {
            let data = &mut buf[..chunk.len as usize];
            source.read_at(chunk.offset, data)?;
            digests.push(hex::encode(Sha256::digest(&*data)));
        }
        Ok(Self {
            chunk_size: plan.chunk_size(),
            image_size: plan.image_size(),
            digests,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ImageError> {
        let text = fs::read_to_string(path).map_err(|source| ImageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ImageError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| ImageError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Fails unless this manifest describes exactly the chunks of `plan`.
    pub fn check(&self, plan: &ChunkPlan) -> Result<(), ImageError> {
        if self.chunk_size != plan.chunk_size()
            || self.image_size != plan.image_size()
            || self.digests.len() != plan.chunk_count()
        {
            return Err(ImageError::ManifestMismatch {
                manifest: self.digests.len(),
                manifest_chunk: self.chunk_size,
                plan: plan.chunk_count(),
                plan_chunk: plan.chunk_size(),
            });
        }
        Ok(())
    }

    /// Whether `data` hashes to the recorded digest for chunk `index`.
    pub fn matches(&self, index: usize, data: &[u8]) -> bool {
        self.digests
            .get(index)
            .is_some_and(|d| d.eq_ignore_ascii_case(&hex::encode(Sha256::digest(data))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_and_match() {
        let bytes: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let src = ImageSource::from_bytes("m", bytes.clone());
        let plan = ChunkPlan::new(10_000, 4_096).unwrap();
        let manifest = ChunkManifest::compute(&src, &plan).unwrap();

        assert_eq!(manifest.digests.len(), 3);
        assert!(manifest.check(&plan).is_ok());
        assert!(manifest.matches(2, &bytes[8_192..]));
        assert!(!manifest.matches(2, &bytes[..1_808]));
        assert!(!manifest.matches(3, &bytes[..1]));

        let other = ChunkPlan::new(10_000, 2_048).unwrap();
        assert!(matches!(
            manifest.check(&other),
            Err(ImageError::ManifestMismatch { .. })
        ));
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.manifest.json");
        let src = ImageSource::from_bytes("m", vec![7u8; 1_000]);
        let plan = ChunkPlan::new(1_000, 512).unwrap();
        let manifest = ChunkManifest::compute(&src, &plan).unwrap();
        manifest.save(&path).unwrap();
        assert_eq!(ChunkManifest::load(&path).unwrap(), manifest);
    }
}
