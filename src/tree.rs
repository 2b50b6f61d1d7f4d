//! The tree builder (write path) and tree reader (read/delete path) that
//! turn a byte stream into a black/white tree and back.

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

use crate::backing::{BackingError, BackingFile, DATA_CAPACITY};
use crate::node::{
    decode_index_node, decode_leaf, decode_meta_node, encode_index_node, encode_leaf,
    encode_meta_node, IndexEntry, LeafKind, MetaNode, NodeError,
};
use crate::token::{decode_token, encode_token, root_kind_from_token, TokenError};

#[derive(Debug, Error)]
pub enum TreeError {
    #[error(transparent)]
    Backing(#[from] BackingError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("corrupt tree: {0}")]
    CorruptTree(String),
    #[error("token references block {0}, which is not allocated")]
    NotFound(u64),
}

const REDUCE_THRESHOLD: usize = 250;
const COLLAPSE_TARGET: usize = 10;
const FOREST_WIDTH: usize = 16;

/// An in-memory node awaiting or already holding a disk location. `data` is
/// the payload this node's leaf should carry and is retained for its whole
/// lifetime: a node's `block_index` reflects its position within its
/// *current* immediate parent, so every later `reduce` that regroups it has
/// to re-encode that payload with the new position. The block address
/// itself (`bitmap`) is assigned once, on first write, and reused in place
/// for every subsequent re-encode.
#[derive(Clone)]
struct Header {
    black: bool,
    white: bool,
    is_index: bool,
    bitmap: u64,
    data: Vec<u8>,
}

impl Header {
    fn kind(&self) -> Option<LeafKind> {
        if self.black == self.white {
            None
        } else if self.black {
            Some(LeafKind::Black)
        } else {
            Some(LeafKind::White)
        }
    }

    fn leaf(kind: LeafKind, data: Vec<u8>) -> Self {
        Self {
            black: kind == LeafKind::Black,
            white: kind == LeafKind::White,
            is_index: false,
            bitmap: 0,
            data,
        }
    }

    fn pad(bitmap: u64) -> Self {
        Self { black: false, white: false, is_index: false, bitmap, data: Vec::new() }
    }
}

pub struct TreeBuilder<'b> {
    backing: &'b mut BackingFile,
    buffer: Vec<u8>,
    nodes: Vec<Header>,
}

impl<'b> TreeBuilder<'b> {
    pub fn new(backing: &'b mut BackingFile) -> Self {
        Self { backing, buffer: Vec::new(), nodes: Vec::new() }
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), TreeError> {
        self.buffer.extend_from_slice(bytes);
        while self.buffer.len() >= DATA_CAPACITY {
            self.flush_chunk()?;
        }
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<(), TreeError> {
        let data: Vec<u8> = self.buffer.drain(..DATA_CAPACITY).collect();
        self.nodes.push(Header::leaf(LeafKind::fair_coin(), data));
        if self.nodes.len() > REDUCE_THRESHOLD {
            self.reduce()?;
        }
        Ok(())
    }

    /// Picks a random contiguous tail of headers, (re-)writes each as a leaf
    /// carrying its position within the group — allocating a slot only the
    /// first time a header is written, reusing its block on every later
    /// re-encode — shuffles the group, and replaces it in `nodes` with a
    /// single index header.
    fn reduce(&mut self) -> Result<(), TreeError> {
        let len = self.nodes.len();
        let raw = rand::thread_rng().gen_range(0u64..250) as usize + 10;
        let k = raw % len;
        let start = len - k;
        let mut group: Vec<Header> = self.nodes.drain(start..).collect();

        for (i, h) in group.iter_mut().enumerate() {
            let kind = h.kind().expect("reduce only ever groups black/white headers");
            let block_index = if h.is_index { -(i as i64) } else { i as i64 };
            let block = encode_leaf(kind, block_index, &h.data)?;
            let p = if h.bitmap == 0 { self.backing.alloc_block()? } else { h.bitmap };
            self.backing.write_block(p, &block)?;
            h.bitmap = p;
        }

        group.shuffle(&mut rand::thread_rng());

        let entries: Vec<IndexEntry> = group
            .iter()
            .map(|h| IndexEntry { black: h.black, white: h.white, valid: true, index: h.is_index, bitmap: h.bitmap })
            .collect();
        let index_bytes = encode_index_node(&entries)?;

        let index_kind = LeafKind::fair_coin();
        let index_block = encode_leaf(index_kind, 0, &index_bytes)?;
        let index_p = self.backing.alloc_block()?;
        self.backing.write_block(index_p, &index_block)?;

        let mut new_header = Header::leaf(index_kind, index_bytes);
        new_header.is_index = true;
        new_header.bitmap = index_p;
        self.nodes.push(new_header);
        Ok(())
    }

    /// Flushes any residual buffer, reduces the forest down to at most 10
    /// roots, pads to exactly 16, writes everything still unwritten, and
    /// allocates+writes the MetaNode root. Returns the resulting token.
    pub fn finish(mut self, filename: &str, description: &str, owner: [u8; 32]) -> Result<String, TreeError> {
        if !self.buffer.is_empty() || self.nodes.is_empty() {
            let data = std::mem::take(&mut self.buffer);
            self.nodes.push(Header::leaf(LeafKind::fair_coin(), data));
        }

        while self.nodes.len() > COLLAPSE_TARGET {
            self.reduce()?;
        }

        let mut rng = rand::thread_rng();
        while self.nodes.len() < FOREST_WIDTH {
            let insert = rng.gen_range(0..self.nodes.len());
            let pad_bitmap: u64 = rng.gen();
            self.nodes.insert(insert, Header::pad(pad_bitmap));
        }

        for h in self.nodes.iter_mut() {
            if let Some(kind) = h.kind() {
                if h.bitmap == 0 {
                    let block = encode_leaf(kind, 0, &h.data)?;
                    let p = self.backing.alloc_block()?;
                    self.backing.write_block(p, &block)?;
                    h.bitmap = p;
                }
            }
        }

        let mut index_bitmap = Vec::with_capacity(self.nodes.len());
        let mut meta_bitmap = Vec::with_capacity(self.nodes.len());
        for h in &self.nodes {
            let code = match (h.kind(), h.is_index) {
                (Some(LeafKind::Black), false) => 0u8,
                (Some(LeafKind::White), false) => 1u8,
                (Some(LeafKind::Black), true) => 2u8,
                (Some(LeafKind::White), true) => 3u8,
                (None, _) => rand::thread_rng().gen_range(4u8..=255),
            };
            index_bitmap.push(code);
            meta_bitmap.push(if h.kind().is_some() { h.bitmap } else { rand::thread_rng().gen() });
        }

        let root = self.backing.alloc_block()?;
        let meta_bytes = encode_meta_node(filename, description, owner, &meta_bitmap);
        let token = encode_token(root, &index_bitmap);
        let root_kind = root_kind_from_token(&token)?;
        let root_block = encode_leaf(root_kind, 0, &meta_bytes)?;
        self.backing.write_block(root, &root_block)?;
        self.backing.touch_changed()?;
        Ok(token)
    }
}

/// A reference to a child during tree expansion: no payload, just enough
/// to locate and decode the block it points to.
#[derive(Clone, Copy)]
struct RefHeader {
    kind: LeafKind,
    is_index: bool,
    bitmap: u64,
}

/// An eagerly-expanded handle to an open logical file: the root metadata
/// plus the fully flattened, in-order list of data leaves.
pub struct Handle {
    leaves: Vec<(LeafKind, u64)>,
    pub meta: MetaNode,
}

pub struct TreeReader;

impl TreeReader {
    /// Reads only the root MetaNode, without expanding the tree. Used by
    /// the façade's `filename`/`description`/`owner` accessors.
    pub fn read_meta(backing: &mut BackingFile, token: &str) -> Result<MetaNode, TreeError> {
        let (root_bitmap, _index_bitmap) = decode_token(token)?;
        let root_kind = root_kind_from_token(token)?;
        if !backing.is_block_set(root_bitmap)? {
            return Err(TreeError::NotFound(root_bitmap));
        }
        let block = backing.read_block(root_bitmap)?;
        let (_, payload) = decode_leaf(root_kind, &block)?;
        backing.touch_visited()?;
        Ok(decode_meta_node(&payload)?)
    }

    pub fn open(backing: &mut BackingFile, token: &str) -> Result<Handle, TreeError> {
        let (root_bitmap, index_bitmap) = decode_token(token)?;
        let root_kind = root_kind_from_token(token)?;
        if !backing.is_block_set(root_bitmap)? {
            return Err(TreeError::NotFound(root_bitmap));
        }
        let block = backing.read_block(root_bitmap)?;
        let (_, payload) = decode_leaf(root_kind, &block)?;
        let meta = decode_meta_node(&payload)?;
        backing.touch_visited()?;

        let initial = build_initial_list(&index_bitmap, &meta.bitmap)?;
        let (leaves, _interior) = expand(backing, initial)?;
        let leaves = leaves.into_iter().map(|h| (h.kind, h.bitmap)).collect();
        Ok(Handle { leaves, meta })
    }

    pub fn read_all(backing: &mut BackingFile, handle: &Handle) -> Result<Vec<u8>, TreeError> {
        let mut out = Vec::new();
        for &(kind, bitmap) in &handle.leaves {
            let block = backing.read_block(bitmap)?;
            let (_, data) = decode_leaf(kind, &block)?;
            out.extend_from_slice(&data);
        }
        Ok(out)
    }

    pub fn read_at(backing: &mut BackingFile, handle: &Handle, offset: u64, buf: &mut [u8]) -> Result<usize, TreeError> {
        let mut pos = 0u64;
        let mut written = 0usize;
        for &(kind, bitmap) in &handle.leaves {
            if written >= buf.len() {
                break;
            }
            let block = backing.read_block(bitmap)?;
            let (_, data) = decode_leaf(kind, &block)?;
            let leaf_len = data.len() as u64;
            if pos + leaf_len <= offset {
                pos += leaf_len;
                continue;
            }
            let start_in_leaf = offset.saturating_sub(pos) as usize;
            let available = data.len() - start_in_leaf;
            let to_copy = available.min(buf.len() - written);
            buf[written..written + to_copy].copy_from_slice(&data[start_in_leaf..start_in_leaf + to_copy]);
            written += to_copy;
            pos += leaf_len;
        }
        Ok(written)
    }

    /// Every block the token's tree actually occupies: the MetaNode root,
    /// every interior index node, and every leaf. Used by the scrub report
    /// to tell reachable blocks from leaked ones.
    pub fn reachable_blocks(backing: &mut BackingFile, token: &str) -> Result<Vec<u64>, TreeError> {
        let (root_bitmap, index_bitmap) = decode_token(token)?;
        let root_kind = root_kind_from_token(token)?;
        if !backing.is_block_set(root_bitmap)? {
            return Err(TreeError::NotFound(root_bitmap));
        }
        let block = backing.read_block(root_bitmap)?;
        let (_, payload) = decode_leaf(root_kind, &block)?;
        let meta = decode_meta_node(&payload)?;

        let initial = build_initial_list(&index_bitmap, &meta.bitmap)?;
        let (leaves, interior) = expand(backing, initial)?;

        let mut blocks = vec![root_bitmap];
        blocks.extend(interior);
        blocks.extend(leaves.iter().map(|h| h.bitmap));
        Ok(blocks)
    }

    /// Expands the tree the same way `open` does, then clears the bitmap
    /// bit of every block visited: the final leaves, every interior index
    /// node read along the way, and the MetaNode's own root block.
    pub fn delete(backing: &mut BackingFile, token: &str) -> Result<(), TreeError> {
        let (root_bitmap, index_bitmap) = decode_token(token)?;
        let root_kind = root_kind_from_token(token)?;
        let block = backing.read_block(root_bitmap)?;
        let (_, payload) = decode_leaf(root_kind, &block)?;
        let meta = decode_meta_node(&payload)?;

        let initial = build_initial_list(&index_bitmap, &meta.bitmap)?;
        let (leaves, interior) = expand(backing, initial)?;

        for bitmap in interior {
            backing.clear_block(bitmap)?;
        }
        for h in leaves {
            backing.clear_block(h.bitmap)?;
        }
        backing.clear_block(root_bitmap)?;
        backing.touch_changed()?;
        Ok(())
    }
}

fn build_initial_list(index_bitmap: &[u8], meta_bitmap: &[u64]) -> Result<Vec<RefHeader>, TreeError> {
    if index_bitmap.len() != meta_bitmap.len() {
        return Err(TreeError::CorruptTree(format!(
            "index_bitmap has {} entries but MetaNode.bitmap has {}",
            index_bitmap.len(),
            meta_bitmap.len()
        )));
    }
    let mut list = Vec::new();
    for (i, &b) in index_bitmap.iter().enumerate() {
        let (kind, is_index) = match b {
            0 => (LeafKind::Black, false),
            1 => (LeafKind::White, false),
            2 => (LeafKind::Black, true),
            3 => (LeafKind::White, true),
            _ => continue,
        };
        list.push(RefHeader { kind, is_index, bitmap: meta_bitmap[i] });
    }
    Ok(list)
}

/// Recursively expands every index header in `list` into its children,
/// placing each child at the position its own leaf's `block_index`
/// declares. Returns the flattened leaf list and the bitmaps of every
/// interior index block visited along the way (needed for delete).
fn expand(backing: &mut BackingFile, mut list: Vec<RefHeader>) -> Result<(Vec<RefHeader>, Vec<u64>), TreeError> {
    let mut interior = Vec::new();
    while let Some(pos) = list.iter().position(|h| h.is_index) {
        let header = list.remove(pos);
        interior.push(header.bitmap);

        let block = backing.read_block(header.bitmap)?;
        let (_, payload) = decode_leaf(header.kind, &block)?;
        let entries = decode_index_node(&payload)?;
        let node_size = entries.len();

        let mut children: Vec<Option<RefHeader>> = vec![None; node_size];
        for entry in &entries {
            if !entry.usable() {
                continue;
            }
            let child_kind = if entry.black { LeafKind::Black } else { LeafKind::White };
            let child_block = backing.read_block(entry.bitmap)?;
            let (block_index, _) = decode_leaf(child_kind, &child_block)?;
            let is_index = entry.index || block_index < 0;
            let position = block_index.unsigned_abs() as usize;
            if position >= node_size {
                return Err(TreeError::CorruptTree(format!(
                    "child position {} out of range for index node of size {}",
                    position, node_size
                )));
            }
            children[position] = Some(RefHeader { kind: child_kind, is_index, bitmap: entry.bitmap });
        }

        let children: Vec<RefHeader> = children
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| TreeError::CorruptTree("index node has an unfilled child slot".into()))?;

        let tail = list.split_off(pos);
        list.extend(children);
        list.extend(tail);
    }
    Ok((list, interior))
}
