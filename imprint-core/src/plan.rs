//! Splits an image into fixed-size chunks and answers which one to handle next.
//!
//! A chunk's index, offset and length depend only on the image size and the
//! chunk size, so a plan computed in a later run lines up with the progress
//! recorded by an earlier one.
use crate::error::ValidationError;
use crate::state::TransferState;
use std::ops::Range;

/// One contiguous byte range of the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub offset: u64,
    pub len: u64,
}

impl Chunk {
    /// Offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.end()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPlan {
    image_size: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    pub fn new(image_size: u64, chunk_size: u64) -> Result<Self, ValidationError> {
        if chunk_size == 0 {
            return Err(ValidationError::InvalidOptions(
                "chunk size must be greater than zero".into(),
            ));
        }
        Ok(Self {
            image_size,
            chunk_size,
        })
    }

    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Length of the longest chunk, which is what a chunk buffer must hold.
    pub fn max_chunk_len(&self) -> usize {
        self.chunk_size.min(self.image_size) as usize
    }

    pub fn chunk_count(&self) -> usize {
        self.image_size.div_ceil(self.chunk_size) as usize
    }

    /// The chunk at `index`; the last one is cut short at the end of the image.
    pub fn chunk(&self, index: usize) -> Option<Chunk> {
        let offset = (index as u64).checked_mul(self.chunk_size)?;
        if offset >= self.image_size {
            return None;
        }
        Some(Chunk {
            index,
            offset,
            len: self.chunk_size.min(self.image_size - offset),
        })
    }

    pub fn chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        (0..self.chunk_count()).filter_map(|i| self.chunk(i))
    }

    /// Chunks that still have to be written: never written, or written and
    /// then found not to match the source.
    pub fn pending_writes<'a>(&'a self, state: &'a TransferState) -> impl Iterator<Item = Chunk> + 'a {
        self.chunks().filter(|c| state.needs_write(c.index))
    }

    /// Chunks written but not yet confirmed by verification.
    pub fn pending_verification<'a>(
        &'a self,
        state: &'a TransferState,
    ) -> impl Iterator<Item = Chunk> + 'a {
        self.chunks().filter(|c| state.needs_verify(c.index))
    }

    pub fn next_to_write(&self, state: &TransferState) -> Option<Chunk> {
        self.pending_writes(state).next()
    }

    pub fn next_to_verify(&self, state: &TransferState) -> Option<Chunk> {
        self.pending_verification(state).next()
    }

    /// Collapses chunk indices into the byte ranges they cover, merging
    /// neighbours.
    pub fn byte_ranges(&self, indices: &[usize]) -> Vec<Range<u64>> {
        let mut ranges: Vec<Range<u64>> = Vec::new();
        for chunk in indices.iter().filter_map(|i| self.chunk(*i)) {
            match ranges.last_mut() {
                Some(last) if last.end == chunk.offset => last.end = chunk.end(),
                _ => ranges.push(chunk.byte_range()),
            }
        }
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateKey;

    #[test]
    fn uneven_image_gets_short_final_chunk() {
        let plan = ChunkPlan::new(10_000_000, 4_000_000).unwrap();
        let chunks: Vec<_> = plan.chunks().map(|c| (c.offset, c.end() - 1)).collect();
        assert_eq!(
            chunks,
            vec![
                (0, 3_999_999),
                (4_000_000, 7_999_999),
                (8_000_000, 9_999_999)
            ]
        );
        assert_eq!(plan.chunk(2).unwrap().len, 2_000_000);
        assert!(plan.chunk(3).is_none());
    }

    #[test]
    fn chunks_tile_the_image_exactly() {
        for image_size in [1u64, 511, 512, 4096, 10_000, 65_537, 1_048_576] {
            for chunk_size in [1u64, 7, 512, 4096, 1_000_000] {
                let plan = ChunkPlan::new(image_size, chunk_size).unwrap();
                let mut expected_offset = 0;
                for c in plan.chunks() {
                    assert_eq!(c.offset, expected_offset, "gap or overlap");
                    assert!(c.len > 0 && c.len <= chunk_size);
                    expected_offset = c.end();
                }
                assert_eq!(expected_offset, image_size);
                assert_eq!(plan.chunks().map(|c| c.len).sum::<u64>(), image_size);
            }
        }
    }

    #[test]
    fn empty_image_has_no_chunks() {
        let plan = ChunkPlan::new(0, 4096).unwrap();
        assert_eq!(plan.chunk_count(), 0);
        assert!(plan.chunk(0).is_none());
    }

    #[test]
    fn oversized_chunk_covers_the_whole_image() {
        let plan = ChunkPlan::new(3_000, 1 << 63).unwrap();
        assert_eq!(plan.chunk_count(), 1);
        assert_eq!(plan.max_chunk_len(), 3_000);
        assert_eq!(plan.chunk(0).unwrap().byte_range(), 0..3_000);
        assert_eq!(ChunkPlan::new(10_000, 4_096).unwrap().max_chunk_len(), 4_096);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert!(ChunkPlan::new(100, 0).is_err());
    }

    #[test]
    fn next_chunk_skips_written_ones() {
        let plan = ChunkPlan::new(10_000_000, 4_000_000).unwrap();
        let key = StateKey::new("abc", "/dev/sdb", 4_000_000);
        let mut state = TransferState::new(key, &plan);
        assert_eq!(plan.next_to_write(&state).map(|c| c.index), Some(0));

        state.mark_written(&plan.chunk(0).unwrap());
        let pending: Vec<_> = plan.pending_writes(&state).map(|c| c.index).collect();
        assert_eq!(pending, vec![1, 2]);
        assert_eq!(plan.next_to_verify(&state).map(|c| c.index), Some(0));
    }

    #[test]
    fn byte_ranges_merge_neighbours() {
        let plan = ChunkPlan::new(10_000, 1_000).unwrap();
        assert_eq!(
            plan.byte_ranges(&[0, 1, 2, 5, 9]),
            vec![0..3_000, 5_000..6_000, 9_000..10_000]
        );
        assert!(plan.byte_ranges(&[]).is_empty());
    }
}
