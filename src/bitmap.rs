//! Per-file changed-block bitmaps with run-length serialization

use crate::{Error, Result};

/// Block granularity for changed-block accounting (4 KiB)
pub const BLOCK_SIZE: u64 = 4096;

/// Dirty-block bitmap for one file.
///
/// Covers ⌈file_size / 4096⌉ blocks. The serialized form is
/// `i64 BE file_size`, `i32 BE run_count`, then `run_count` records of
/// `u8 state, i32 BE run_length`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBitmap {
    file_size: u64,
    bits: Vec<bool>,
}

impl BlockBitmap {
    pub fn new(file_size: u64) -> Self {
        let blocks = file_size.div_ceil(BLOCK_SIZE) as usize;
        Self {
            file_size,
            bits: vec![false; blocks],
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn block_count(&self) -> usize {
        self.bits.len()
    }

    /// Mark one block dirty.
    pub fn mark_block(&mut self, block: usize) -> Result<()> {
        let blocks = self.bits.len();
        let slot = self.bits.get_mut(block).ok_or_else(|| Error::InvalidArgument {
            reason: format!("block {} outside bitmap of {} blocks", block, blocks),
        })?;
        *slot = true;
        Ok(())
    }

    /// Mark every block overlapping the byte range `[offset, offset+len)`.
    pub fn mark_range(&mut self, offset: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let first = (offset / BLOCK_SIZE) as usize;
        let last = ((offset + len - 1) / BLOCK_SIZE) as usize;
        if last >= self.bits.len() {
            return Err(Error::InvalidArgument {
                reason: format!(
                    "byte range {}..{} outside file of {} bytes",
                    offset,
                    offset + len,
                    self.file_size
                ),
            });
        }
        for bit in &mut self.bits[first..=last] {
            *bit = true;
        }
        Ok(())
    }

    pub fn is_dirty(&self, block: usize) -> bool {
        self.bits.get(block).copied().unwrap_or(false)
    }

    pub fn dirty_count(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    /// Serialize as run-length records.
    pub fn serialize(&self) -> Vec<u8> {
        let mut runs: Vec<(u8, i32)> = Vec::new();
        for &bit in &self.bits {
            let state = bit as u8;
            match runs.last_mut() {
                Some((s, count)) if *s == state && *count < i32::MAX => *count += 1,
                _ => runs.push((state, 1)),
            }
        }

        let mut out = Vec::with_capacity(12 + runs.len() * 5);
        out.extend_from_slice(&(self.file_size as i64).to_be_bytes());
        out.extend_from_slice(&(runs.len() as i32).to_be_bytes());
        for (state, count) in runs {
            out.push(state);
            out.extend_from_slice(&count.to_be_bytes());
        }
        out
    }

    /// Parse a serialized bitmap, validating that the runs cover exactly
    /// the block count implied by the file size.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { data, pos: 0 };
        let file_size = cursor.read_i64()?;
        if file_size < 0 {
            return Err(Error::Integrity {
                reason: format!("negative file size {} in bitmap", file_size),
            });
        }
        let file_size = file_size as u64;
        let run_count = cursor.read_i32()?;
        if run_count < 0 {
            return Err(Error::Integrity {
                reason: format!("negative run count {} in bitmap", run_count),
            });
        }

        let expected_blocks = file_size.div_ceil(BLOCK_SIZE) as usize;
        let mut bits = Vec::with_capacity(expected_blocks);
        for _ in 0..run_count {
            let state = cursor.read_u8()?;
            if state > 1 {
                return Err(Error::Integrity {
                    reason: format!("bitmap run state {} is not 0 or 1", state),
                });
            }
            let length = cursor.read_i32()?;
            if length <= 0 {
                return Err(Error::Integrity {
                    reason: format!("bitmap run length {} must be positive", length),
                });
            }
            if bits.len() + length as usize > expected_blocks {
                return Err(Error::Integrity {
                    reason: "bitmap runs exceed block count".to_string(),
                });
            }
            bits.extend(std::iter::repeat(state == 1).take(length as usize));
        }
        if bits.len() != expected_blocks {
            return Err(Error::Integrity {
                reason: format!(
                    "bitmap runs cover {} blocks, file needs {}",
                    bits.len(),
                    expected_blocks
                ),
            });
        }
        Ok(Self { file_size, bits })
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(Error::Integrity {
                reason: "truncated bitmap".to_string(),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn block_count_rounds_up() {
        assert_eq!(BlockBitmap::new(0).block_count(), 0);
        assert_eq!(BlockBitmap::new(1).block_count(), 1);
        assert_eq!(BlockBitmap::new(4096).block_count(), 1);
        assert_eq!(BlockBitmap::new(4097).block_count(), 2);
    }

    #[test]
    fn mark_range_covers_overlapping_blocks() -> Result<()> {
        let mut bitmap = BlockBitmap::new(20_000);
        bitmap.mark_range(4000, 200)?;
        assert!(bitmap.is_dirty(0));
        assert!(bitmap.is_dirty(1));
        assert!(!bitmap.is_dirty(2));
        assert_eq!(bitmap.dirty_count(), 2);

        assert!(bitmap.mark_range(20_000, 1).is_err());
        Ok(())
    }

    #[test]
    fn serialization_round_trip() -> Result<()> {
        let mut bitmap = BlockBitmap::new(40 * 1024 * 1024);
        assert_eq!(bitmap.block_count(), 10_240);

        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..500 {
            let block = rng.random_range(0..bitmap.block_count());
            bitmap.mark_block(block)?;
        }

        let encoded = bitmap.serialize();
        let decoded = BlockBitmap::deserialize(&encoded)?;
        assert_eq!(decoded, bitmap);
        Ok(())
    }

    #[test]
    fn low_entropy_bitmaps_encode_compactly() -> Result<()> {
        // One dirty stretch in a 40 MiB file: far below the naive bit-array.
        let mut bitmap = BlockBitmap::new(40 * 1024 * 1024);
        bitmap.mark_range(0, 1024 * 1024)?;

        let encoded = bitmap.serialize();
        let naive = bitmap.block_count().div_ceil(8) + 12;
        assert!(encoded.len() <= naive);
        assert_eq!(BlockBitmap::deserialize(&encoded)?, bitmap);
        Ok(())
    }

    #[test]
    fn truncated_and_inconsistent_input_is_rejected() {
        let bitmap = BlockBitmap::new(8192);
        let encoded = bitmap.serialize();

        assert!(matches!(
            BlockBitmap::deserialize(&encoded[..encoded.len() - 1]),
            Err(Error::Integrity { .. })
        ));

        // Runs that do not cover the block count.
        let mut bad = Vec::new();
        bad.extend_from_slice(&8192i64.to_be_bytes());
        bad.extend_from_slice(&1i32.to_be_bytes());
        bad.push(1);
        bad.extend_from_slice(&1i32.to_be_bytes());
        assert!(matches!(
            BlockBitmap::deserialize(&bad),
            Err(Error::Integrity { .. })
        ));
    }
}
