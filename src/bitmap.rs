//! Allocation bitmap and randomized first-fit allocator.
//!
//! One bit per block of the backing file; bit `p` set means block `p` is
//! allocated. `alloc` marks the bit it returns before handing the slot back,
//! so two allocations never collide even though there is no locking above
//! this layer.

use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BitmapError {
    #[error("bitmap has no free blocks")]
    OutOfSpace,
    #[error("block {0} is out of range for a bitmap of {1} bits")]
    OutOfRange(u64, u64),
}

#[derive(Debug, Clone)]
pub struct Bitmap {
    bits: Vec<u8>,
    size: u64,
}

impl Bitmap {
    pub fn with_size(size: u64) -> Self {
        let bytes = ((size + 7) / 8) as usize;
        Self { bits: vec![0u8; bytes], size }
    }

    pub fn from_bytes(bytes: Vec<u8>, size: u64) -> Self {
        Self { bits: bytes, size }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn decompose(&self, p: u64) -> Result<(usize, u8), BitmapError> {
        if p >= self.size {
            return Err(BitmapError::OutOfRange(p, self.size));
        }
        Ok(((p / 8) as usize, (p % 8) as u8))
    }

    pub fn is_set(&self, p: u64) -> Result<bool, BitmapError> {
        let (byte, bit) = self.decompose(p)?;
        Ok(self.bits[byte] & (1 << bit) != 0)
    }

    pub fn mark(&mut self, p: u64) -> Result<(), BitmapError> {
        let (byte, bit) = self.decompose(p)?;
        self.bits[byte] |= 1 << bit;
        Ok(())
    }

    pub fn clear(&mut self, p: u64) -> Result<(), BitmapError> {
        let (byte, bit) = self.decompose(p)?;
        self.bits[byte] &= !(1 << bit);
        Ok(())
    }

    pub fn free_count(&self) -> u64 {
        let set: u64 = self.bits.iter().map(|b| b.count_ones() as u64).sum();
        self.size - set.min(self.size)
    }

    pub fn popcount(&self) -> u64 {
        self.bits.iter().map(|b| b.count_ones() as u64).sum()
    }

    /// Randomized first-fit: start at a uniformly random offset and scan
    /// forward (wrapping once) for the first clear bit, marking it before
    /// returning. Returns `OutOfSpace` if every bit is set.
    pub fn alloc(&mut self) -> Result<u64, BitmapError> {
        if self.size == 0 {
            return Err(BitmapError::OutOfSpace);
        }
        let start = rand::thread_rng().gen_range(0..self.size);
        for offset in 0..self.size {
            let p = (start + offset) % self.size;
            if !self.is_set(p)? {
                self.mark(p)?;
                return Ok(p);
            }
        }
        Err(BitmapError::OutOfSpace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_marks_before_returning() {
        let mut bm = Bitmap::with_size(64);
        let p = bm.alloc().unwrap();
        assert!(bm.is_set(p).unwrap());
    }

    #[test]
    fn alloc_never_returns_set_bit() {
        let mut bm = Bitmap::with_size(8);
        let mut seen = Vec::new();
        for _ in 0..8 {
            let p = bm.alloc().unwrap();
            assert!(!seen.contains(&p));
            seen.push(p);
        }
        assert!(matches!(bm.alloc(), Err(BitmapError::OutOfSpace)));
    }

    #[test]
    fn mark_and_clear_round_trip() {
        let mut bm = Bitmap::with_size(16);
        bm.mark(5).unwrap();
        assert!(bm.is_set(5).unwrap());
        bm.clear(5).unwrap();
        assert!(!bm.is_set(5).unwrap());
    }

    #[test]
    fn free_count_tracks_marks() {
        let mut bm = Bitmap::with_size(16);
        assert_eq!(bm.free_count(), 16);
        bm.mark(0).unwrap();
        bm.mark(1).unwrap();
        assert_eq!(bm.free_count(), 14);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let bm = Bitmap::with_size(8);
        assert!(matches!(bm.is_set(8), Err(BitmapError::OutOfRange(8, 8))));
    }
}
