//! The backing layer: a fixed-size file of `N` equal-sized blocks, with
//! block 0 holding metadata, the last block holding footer info, a
//! contiguous bitmap region between them, and every other block available
//! as a payload slot.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::bitmap::{Bitmap, BitmapError};

pub const BLOCK_SIZE: usize = 4096;
pub const WORD_SIZE: usize = 8;
pub const DATA_CAPACITY: usize = BLOCK_SIZE - 2 * WORD_SIZE;

const METADATA_VERSION: u8 = 1;
const METADATA_LEN: usize = 1 + 16 + 32 + 8 + 8 + 8 + 8 + 8 + 8;
const INFO_LEN: usize = 16 + 32 + 8 + 8 + 8 + 8 + 8 + 8 + 8 + 8 + 8 + 32;
const FILL_CHUNK: usize = 1024 * 1024;
const BITS_PER_BLOCK: u64 = (BLOCK_SIZE * 8) as u64;

#[derive(Debug, Error)]
pub enum BackingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Bitmap(#[from] BitmapError),
    #[error("unsupported backing format version {0}")]
    BadVersion(u8),
    #[error("backing file must have at least 3 blocks, got {0}")]
    TooSmall(u64),
    #[error("block {0} is outside the payload range [{1}, {2}]")]
    OutOfRange(u64, u64, u64),
    #[error("metadata block is truncated or malformed")]
    MalformedMetadata,
    #[error("info block is truncated or malformed")]
    MalformedInfo,
}

fn now_unix() -> i64 {
    Utc::now().timestamp()
}

#[derive(Debug, Clone)]
pub struct BackingMetadata {
    pub version: u8,
    pub file_id: [u8; 16],
    pub owner: [u8; 32],
    pub created: i64,
    pub start_block: u64,
    pub end_block: u64,
    pub block_size: u64,
    pub file_size: u64,
    pub bitmap_start: u64,
}

impl BackingMetadata {
    fn encode(&self) -> [u8; METADATA_LEN] {
        let mut buf = [0u8; METADATA_LEN];
        let mut w: &mut [u8] = &mut buf;
        w.write_u8(self.version).unwrap();
        w.write_all(&self.file_id).unwrap();
        w.write_all(&self.owner).unwrap();
        w.write_i64::<LittleEndian>(self.created).unwrap();
        w.write_u64::<LittleEndian>(self.start_block).unwrap();
        w.write_u64::<LittleEndian>(self.end_block).unwrap();
        w.write_u64::<LittleEndian>(self.block_size).unwrap();
        w.write_u64::<LittleEndian>(self.file_size).unwrap();
        w.write_u64::<LittleEndian>(self.bitmap_start).unwrap();
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, BackingError> {
        if bytes.len() < METADATA_LEN {
            return Err(BackingError::MalformedMetadata);
        }
        let mut r = bytes;
        let version = r.read_u8()?;
        let mut file_id = [0u8; 16];
        r.read_exact(&mut file_id)?;
        let mut owner = [0u8; 32];
        r.read_exact(&mut owner)?;
        let created = r.read_i64::<LittleEndian>()?;
        let start_block = r.read_u64::<LittleEndian>()?;
        let end_block = r.read_u64::<LittleEndian>()?;
        let block_size = r.read_u64::<LittleEndian>()?;
        let file_size = r.read_u64::<LittleEndian>()?;
        let bitmap_start = r.read_u64::<LittleEndian>()?;
        Ok(Self {
            version,
            file_id,
            owner,
            created,
            start_block,
            end_block,
            block_size,
            file_size,
            bitmap_start,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BackingInfo {
    pub file_id: [u8; 16],
    pub owner: [u8; 32],
    pub created: i64,
    pub changed: i64,
    pub visited: i64,
    pub start_block: u64,
    pub end_block: u64,
    pub file_size: u64,
    pub block_size: u64,
    pub bitmap_end: u64,
    pub bitmap_size: u64,
    pub checksum: [u8; 32],
}

impl BackingInfo {
    fn encode(&self) -> [u8; INFO_LEN] {
        let mut buf = [0u8; INFO_LEN];
        let mut w: &mut [u8] = &mut buf;
        w.write_all(&self.file_id).unwrap();
        w.write_all(&self.owner).unwrap();
        w.write_i64::<LittleEndian>(self.created).unwrap();
        w.write_i64::<LittleEndian>(self.changed).unwrap();
        w.write_i64::<LittleEndian>(self.visited).unwrap();
        w.write_u64::<LittleEndian>(self.start_block).unwrap();
        w.write_u64::<LittleEndian>(self.end_block).unwrap();
        w.write_u64::<LittleEndian>(self.file_size).unwrap();
        w.write_u64::<LittleEndian>(self.block_size).unwrap();
        w.write_u64::<LittleEndian>(self.bitmap_end).unwrap();
        w.write_u64::<LittleEndian>(self.bitmap_size).unwrap();
        w.write_all(&self.checksum).unwrap();
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, BackingError> {
        if bytes.len() < INFO_LEN {
            return Err(BackingError::MalformedInfo);
        }
        let mut r = bytes;
        let mut file_id = [0u8; 16];
        r.read_exact(&mut file_id)?;
        let mut owner = [0u8; 32];
        r.read_exact(&mut owner)?;
        let created = r.read_i64::<LittleEndian>()?;
        let changed = r.read_i64::<LittleEndian>()?;
        let visited = r.read_i64::<LittleEndian>()?;
        let start_block = r.read_u64::<LittleEndian>()?;
        let end_block = r.read_u64::<LittleEndian>()?;
        let file_size = r.read_u64::<LittleEndian>()?;
        let block_size = r.read_u64::<LittleEndian>()?;
        let bitmap_end = r.read_u64::<LittleEndian>()?;
        let bitmap_size = r.read_u64::<LittleEndian>()?;
        let mut checksum = [0u8; 32];
        r.read_exact(&mut checksum)?;
        Ok(Self {
            file_id,
            owner,
            created,
            changed,
            visited,
            start_block,
            end_block,
            file_size,
            block_size,
            bitmap_end,
            bitmap_size,
            checksum,
        })
    }
}

pub struct BackingFile {
    file: File,
    path: PathBuf,
    metadata: BackingMetadata,
    info: BackingInfo,
    bitmap: Bitmap,
}

impl BackingFile {
    pub fn create(path: impl AsRef<Path>, n_blocks: u64, owner: [u8; 32]) -> Result<Self, BackingError> {
        if n_blocks < 3 {
            return Err(BackingError::TooSmall(n_blocks));
        }
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let total_bytes = n_blocks * BLOCK_SIZE as u64;
        file.set_len(total_bytes)?;

        fill_random(&mut file, total_bytes)?;

        let created = now_unix();
        let bitmap_start = (created as u64 % (n_blocks - 2)).max(1);
        let bitmap_blocks = (n_blocks + BITS_PER_BLOCK - 1) / BITS_PER_BLOCK;
        let bitmap_end = bitmap_start + bitmap_blocks - 1;

        let file_id = *Uuid::new_v4().as_bytes();

        let metadata = BackingMetadata {
            version: METADATA_VERSION,
            file_id,
            owner,
            created,
            start_block: 1,
            end_block: n_blocks - 2,
            block_size: BLOCK_SIZE as u64,
            file_size: total_bytes / 1024 / 1024,
            bitmap_start,
        };
        let checksum = Sha256::digest(metadata.encode());
        let info = BackingInfo {
            file_id,
            owner,
            created,
            changed: created,
            visited: created,
            start_block: 1,
            end_block: n_blocks - 2,
            file_size: total_bytes,
            block_size: BLOCK_SIZE as u64,
            bitmap_end,
            bitmap_size: n_blocks,
            checksum: checksum.into(),
        };

        let mut bitmap = Bitmap::with_size(n_blocks);
        bitmap.mark(0)?;
        bitmap.mark(n_blocks - 1)?;
        for p in bitmap_start..=bitmap_end {
            bitmap.mark(p)?;
        }

        let mut backing = Self { file, path, metadata, info, bitmap };
        backing.write_bitmap_region()?;
        backing.write_info()?;
        backing.write_metadata()?;
        Ok(backing)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackingError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut block0 = [0u8; BLOCK_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut block0)?;
        let metadata = BackingMetadata::decode(&block0)?;
        if metadata.version != METADATA_VERSION {
            return Err(BackingError::BadVersion(metadata.version));
        }

        let info_block = metadata.end_block + 1;
        let mut block_n = [0u8; BLOCK_SIZE];
        file.seek(SeekFrom::Start(info_block * BLOCK_SIZE as u64))?;
        file.read_exact(&mut block_n)?;
        let info = BackingInfo::decode(&block_n)?;

        let bitmap_bytes_len = ((info.bitmap_size + 7) / 8) as usize;
        let mut bitmap_bytes = vec![0u8; bitmap_bytes_len];
        file.seek(SeekFrom::Start(metadata.bitmap_start * BLOCK_SIZE as u64))?;
        file.read_exact(&mut bitmap_bytes)?;
        let bitmap = Bitmap::from_bytes(bitmap_bytes, info.bitmap_size);

        Ok(Self { file, path, metadata, info, bitmap })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &BackingMetadata {
        &self.metadata
    }

    pub fn info(&self) -> &BackingInfo {
        &self.info
    }

    /// Recomputes the metadata checksum and compares it with the stored one.
    pub fn verify(&self) -> bool {
        let checksum = Sha256::digest(self.metadata.encode());
        checksum.as_slice() == self.info.checksum
    }

    pub fn free_size_mib(&self) -> u64 {
        self.bitmap.free_count() * self.metadata.block_size / 1024 / 1024
    }

    pub fn total_size_mib(&self) -> u64 {
        self.info.file_size / 1024 / 1024
    }

    fn check_payload_range(&self, p: u64) -> Result<(), BackingError> {
        if p < self.metadata.start_block || p > self.metadata.end_block {
            return Err(BackingError::OutOfRange(p, self.metadata.start_block, self.metadata.end_block));
        }
        Ok(())
    }

    pub fn read_block(&mut self, p: u64) -> Result<[u8; BLOCK_SIZE], BackingError> {
        self.check_payload_range(p)?;
        let mut buf = [0u8; BLOCK_SIZE];
        self.file.seek(SeekFrom::Start(p * BLOCK_SIZE as u64))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_block(&mut self, p: u64, bytes: &[u8; BLOCK_SIZE]) -> Result<(), BackingError> {
        self.check_payload_range(p)?;
        self.file.seek(SeekFrom::Start(p * BLOCK_SIZE as u64))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    pub fn alloc_block(&mut self) -> Result<u64, BackingError> {
        let p = self.bitmap.alloc()?;
        self.write_bitmap_region()?;
        Ok(p)
    }

    pub fn mark_block(&mut self, p: u64) -> Result<(), BackingError> {
        self.bitmap.mark(p)?;
        self.write_bitmap_region()
    }

    pub fn clear_block(&mut self, p: u64) -> Result<(), BackingError> {
        self.bitmap.clear(p)?;
        self.write_bitmap_region()
    }

    pub fn is_block_set(&self, p: u64) -> Result<bool, BackingError> {
        Ok(self.bitmap.is_set(p)?)
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    pub fn touch_changed(&mut self) -> Result<(), BackingError> {
        self.info.changed = now_unix();
        self.write_info()
    }

    pub fn touch_visited(&mut self) -> Result<(), BackingError> {
        self.info.visited = now_unix();
        self.write_info()
    }

    fn write_bitmap_region(&mut self) -> Result<(), BackingError> {
        let bytes = self.bitmap.as_bytes();
        self.file.seek(SeekFrom::Start(self.metadata.bitmap_start * BLOCK_SIZE as u64))?;
        self.file.write_all(bytes)?;
        let bitmap_blocks = (self.info.bitmap_size + BITS_PER_BLOCK - 1) / BITS_PER_BLOCK;
        let region_bytes = (bitmap_blocks * BLOCK_SIZE as u64) as usize;
        if region_bytes > bytes.len() {
            let pad = vec![0u8; region_bytes - bytes.len()];
            self.file.write_all(&pad)?;
        }
        Ok(())
    }

    fn write_info(&mut self) -> Result<(), BackingError> {
        let mut block = [0u8; BLOCK_SIZE];
        rand::thread_rng().fill_bytes(&mut block);
        let encoded = self.info.encode();
        block[..encoded.len()].copy_from_slice(&encoded);
        let info_block = self.metadata.end_block + 1;
        self.file.seek(SeekFrom::Start(info_block * BLOCK_SIZE as u64))?;
        self.file.write_all(&block)?;
        Ok(())
    }

    fn write_metadata(&mut self) -> Result<(), BackingError> {
        let mut block = [0u8; BLOCK_SIZE];
        rand::thread_rng().fill_bytes(&mut block);
        let encoded = self.metadata.encode();
        block[..encoded.len()].copy_from_slice(&encoded);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&block)?;
        Ok(())
    }
}

fn fill_random(file: &mut File, total_bytes: u64) -> Result<(), BackingError> {
    file.seek(SeekFrom::Start(0))?;
    let mut chunk = vec![0u8; FILL_CHUNK];
    let mut remaining = total_bytes;
    while remaining > 0 {
        let n = remaining.min(FILL_CHUNK as u64) as usize;
        rand::thread_rng().fill_bytes(&mut chunk[..n]);
        file.write_all(&chunk[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn small_backing() -> (NamedTempFile, BackingFile) {
        let tmp = NamedTempFile::new().unwrap();
        let backing = BackingFile::create(tmp.path(), 64, [7u8; 32]).unwrap();
        (tmp, backing)
    }

    #[test]
    fn create_then_open_round_trips_metadata() {
        let (tmp, backing) = small_backing();
        let path = tmp.path().to_path_buf();
        let file_id = backing.metadata().file_id;
        drop(backing);

        let reopened = BackingFile::open(&path).unwrap();
        assert_eq!(reopened.metadata().file_id, file_id);
        assert_eq!(reopened.metadata().version, METADATA_VERSION);
        assert!(reopened.verify());
    }

    #[test]
    fn reserved_blocks_are_marked() {
        let (_tmp, backing) = small_backing();
        assert!(backing.is_block_set(0).unwrap());
        assert!(backing.is_block_set(63).unwrap());
        let start = backing.metadata().bitmap_start;
        let end = backing.info().bitmap_end;
        for p in start..=end {
            assert!(backing.is_block_set(p).unwrap());
        }
    }

    #[test]
    fn payload_range_rejects_reserved_blocks() {
        let (_tmp, mut backing) = small_backing();
        assert!(backing.read_block(0).is_err());
        assert!(backing.read_block(63).is_err());
    }

    #[test]
    fn alloc_write_read_round_trip() {
        let (_tmp, mut backing) = small_backing();
        let p = backing.alloc_block().unwrap();
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0xAB;
        backing.write_block(p, &block).unwrap();
        let read_back = backing.read_block(p).unwrap();
        assert_eq!(read_back[0], 0xAB);
    }
}
