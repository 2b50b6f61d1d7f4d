//! # obsidian — a single-file obfuscating block store
//!
//! Format guarantees:
//! - All numeric fields are little-endian; block size is fixed at 4096
//!   bytes and the word size at 8 bytes, never negotiated.
//! - Every allocated block is exactly one block long and statistically
//!   indistinguishable from the random fill that surrounds it — leaf kind
//!   (Black/White) is chosen by fair coin at every write.
//! - A logical file is reachable only through its token; nothing about the
//!   backing file's bytes reveals which blocks belong to which file, or how
//!   many files exist.
//! - There is no directory: the store is a flat map from token to file.

pub mod backing;
pub mod bitmap;
pub mod node;
pub mod scrub;
pub mod store;
pub mod token;
pub mod tree;

pub use backing::{BackingError, BackingFile, BackingInfo, BackingMetadata, BLOCK_SIZE, DATA_CAPACITY};
pub use bitmap::{Bitmap, BitmapError};
pub use node::{LeafKind, MetaNode, NodeError};
pub use scrub::{scrub, ScrubReport};
pub use store::{PutSession, Store, StoreError};
pub use token::TokenError;
pub use tree::{Handle, TreeError};
