//! A minimal leak report: given a backing and the set of tokens a caller
//! believes are still live, report which allocated blocks are not reachable
//! from any of them.
//!
//! This is deliberately not a collector. Blocks in this format cannot be
//! content-scanned the way a self-describing container can be (there is no
//! magic/header to recognize); reclaiming leaked blocks requires a live-
//! token oracle the store itself does not keep, so this only ever reports.

use std::collections::HashSet;

use crate::backing::BackingFile;
use crate::store::StoreError;
use crate::tree::TreeReader;

#[derive(Debug, Clone)]
pub struct ScrubReport {
    pub total_blocks: u64,
    pub allocated_blocks: u64,
    pub reachable_blocks: u64,
    pub leaked_blocks: Vec<u64>,
}

pub fn scrub(backing: &mut BackingFile, live_tokens: &[String]) -> Result<ScrubReport, StoreError> {
    let mut reachable: HashSet<u64> = HashSet::new();
    for token in live_tokens {
        for block in TreeReader::reachable_blocks(backing, token)? {
            reachable.insert(block);
        }
    }

    let reserved: HashSet<u64> = reserved_blocks(backing);
    let total_blocks = backing.bitmap().size();
    let mut allocated_blocks = 0u64;
    let mut leaked_blocks = Vec::new();
    for p in 0..total_blocks {
        if !backing.is_block_set(p)? {
            continue;
        }
        allocated_blocks += 1;
        if reserved.contains(&p) || reachable.contains(&p) {
            continue;
        }
        leaked_blocks.push(p);
    }

    Ok(ScrubReport {
        total_blocks,
        allocated_blocks,
        reachable_blocks: reachable.len() as u64,
        leaked_blocks,
    })
}

fn reserved_blocks(backing: &BackingFile) -> HashSet<u64> {
    let meta = backing.metadata();
    let info = backing.info();
    let mut set = HashSet::new();
    set.insert(0);
    set.insert(info.end_block + 1);
    for p in meta.bitmap_start..=info.bitmap_end {
        set.insert(p);
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use tempfile::NamedTempFile;

    #[test]
    fn scrub_finds_no_leaks_when_all_tokens_are_supplied() {
        let tmp = NamedTempFile::new().unwrap();
        let mut store = Store::create(tmp.path(), 256, [0u8; 32]).unwrap();
        let mut session = store.put("a.bin", "", [0u8; 32]);
        session.write(b"payload").unwrap();
        let token = session.finish().unwrap();

        let report = scrub(store.backing_mut(), &[token]).unwrap();
        assert!(report.leaked_blocks.is_empty());
    }

    #[test]
    fn scrub_finds_leaks_when_a_token_is_forgotten() {
        let tmp = NamedTempFile::new().unwrap();
        let mut store = Store::create(tmp.path(), 256, [0u8; 32]).unwrap();
        let mut session = store.put("a.bin", "", [0u8; 32]);
        session.write(b"payload").unwrap();
        let _token = session.finish().unwrap();

        let report = scrub(store.backing_mut(), &[]).unwrap();
        assert!(!report.leaked_blocks.is_empty());
    }
}
