//! The façade: create/open a backing file, put/get/delete logical files by
//! token. This is the only module most callers need.

use std::path::Path;

use thiserror::Error;

use crate::backing::{BackingError, BackingFile};
use crate::node::MetaNode;
use crate::tree::{Handle, TreeBuilder, TreeError, TreeReader};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Backing(#[from] BackingError),
    #[error(transparent)]
    Tree(#[from] TreeError),
}

pub struct Store {
    backing: BackingFile,
}

impl Store {
    pub fn create(path: impl AsRef<Path>, n_blocks: u64, owner: [u8; 32]) -> Result<Self, StoreError> {
        Ok(Self { backing: BackingFile::create(path, n_blocks, owner)? })
    }

    pub fn open_backing(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self { backing: BackingFile::open(path)? })
    }

    /// Begins writing a new logical file. Feed bytes via `PutSession::write`
    /// and call `PutSession::finish` to obtain the token.
    pub fn put(&mut self, filename: &str, description: &str, owner: [u8; 32]) -> PutSession<'_> {
        PutSession {
            builder: TreeBuilder::new(&mut self.backing),
            filename: filename.to_string(),
            description: description.to_string(),
            owner,
        }
    }

    pub fn open(&mut self, token: &str) -> Result<Handle, StoreError> {
        Ok(TreeReader::open(&mut self.backing, token)?)
    }

    pub fn read_all(&mut self, handle: &Handle) -> Result<Vec<u8>, StoreError> {
        Ok(TreeReader::read_all(&mut self.backing, handle)?)
    }

    pub fn read_at(&mut self, handle: &Handle, offset: u64, buf: &mut [u8]) -> Result<usize, StoreError> {
        Ok(TreeReader::read_at(&mut self.backing, handle, offset, buf)?)
    }

    pub fn delete(&mut self, token: &str) -> Result<(), StoreError> {
        Ok(TreeReader::delete(&mut self.backing, token)?)
    }

    fn meta(&mut self, token: &str) -> Result<MetaNode, StoreError> {
        Ok(TreeReader::read_meta(&mut self.backing, token)?)
    }

    pub fn filename(&mut self, token: &str) -> Result<String, StoreError> {
        Ok(self.meta(token)?.filename)
    }

    pub fn description(&mut self, token: &str) -> Result<String, StoreError> {
        Ok(self.meta(token)?.description)
    }

    pub fn owner(&mut self, token: &str) -> Result<[u8; 32], StoreError> {
        Ok(self.meta(token)?.owner)
    }

    pub fn free_size_mib(&self) -> u64 {
        self.backing.free_size_mib()
    }

    pub fn total_size_mib(&self) -> u64 {
        self.backing.total_size_mib()
    }

    pub fn verify(&self) -> bool {
        self.backing.verify()
    }

    pub fn backing(&self) -> &BackingFile {
        &self.backing
    }

    pub fn backing_mut(&mut self) -> &mut BackingFile {
        &mut self.backing
    }
}

pub struct PutSession<'s> {
    builder: TreeBuilder<'s>,
    filename: String,
    description: String,
    owner: [u8; 32],
}

impl<'s> PutSession<'s> {
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        Ok(self.builder.write(bytes)?)
    }

    pub fn finish(self) -> Result<String, StoreError> {
        Ok(self.builder.finish(&self.filename, &self.description, self.owner)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::create(tmp.path(), 256, [1u8; 32]).unwrap();
        (tmp, store)
    }

    #[test]
    fn put_open_read_round_trip() {
        let (_tmp, mut store) = store();
        let mut session = store.put("greeting.txt", "a short note", [2u8; 32]);
        session.write(b"hello obsidian").unwrap();
        let token = session.finish().unwrap();

        let handle = store.open(&token).unwrap();
        let data = store.read_all(&handle).unwrap();
        assert_eq!(data, b"hello obsidian");
        assert_eq!(handle.meta.filename, "greeting.txt");
        assert_eq!(handle.meta.description, "a short note");
        assert_eq!(handle.meta.owner, [2u8; 32]);
    }

    #[test]
    fn delete_frees_space_and_blocks_reopen() {
        let (_tmp, mut store) = store();
        let mut session = store.put("x.bin", "", [0u8; 32]);
        session.write(&vec![0x5Au8; 3000]).unwrap();
        let token = session.finish().unwrap();

        let free_before = store.backing().bitmap().free_count();
        store.delete(&token).unwrap();
        let free_after = store.backing().bitmap().free_count();
        assert!(free_after > free_before);
        assert!(store.open(&token).is_err());
    }

    #[test]
    fn empty_file_still_produces_a_valid_token() {
        let (_tmp, mut store) = store();
        let session = store.put("a.bin", "", [0u8; 32]);
        let token = session.finish().unwrap();
        let handle = store.open(&token).unwrap();
        let data = store.read_all(&handle).unwrap();
        assert_eq!(data, Vec::<u8>::new());
    }
}
