//! Token encode/decode: `base64(root_block:u64_le || index_bitmap)`.
//!
//! The parity of the token's first base64 character decides whether the
//! root block itself was written as a Black or White leaf — this has to be
//! re-derived from the token string on every read, it is never stored
//! alongside the root block.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::node::LeafKind;

const ROOT_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token is not valid base64: {0}")]
    BadBase64(#[from] base64::DecodeError),
    #[error("decoded token has {0} bytes, need at least {1}")]
    TooShort(usize, usize),
    #[error("token is empty")]
    Empty,
}

pub fn encode_token(root: u64, index_bitmap: &[u8]) -> String {
    let mut raw = Vec::with_capacity(ROOT_LEN + index_bitmap.len());
    raw.write_u64::<LittleEndian>(root).unwrap();
    raw.extend_from_slice(index_bitmap);
    STANDARD.encode(raw)
}

pub fn decode_token(token: &str) -> Result<(u64, Vec<u8>), TokenError> {
    let raw = STANDARD.decode(token.as_bytes())?;
    if raw.len() < ROOT_LEN {
        return Err(TokenError::TooShort(raw.len(), ROOT_LEN));
    }
    let root = (&raw[..ROOT_LEN]).read_u64::<LittleEndian>().unwrap();
    let index_bitmap = raw[ROOT_LEN..].to_vec();
    Ok((root, index_bitmap))
}

pub fn root_kind_from_token(token: &str) -> Result<LeafKind, TokenError> {
    let first = token.as_bytes().first().copied().ok_or(TokenError::Empty)?;
    Ok(LeafKind::from_parity_byte(first))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let bitmap = vec![0u8, 1, 2, 3, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9];
        let t = encode_token(424242, &bitmap);
        let (root, decoded_bitmap) = decode_token(&t).unwrap();
        assert_eq!(root, 424242);
        assert_eq!(decoded_bitmap, bitmap);
    }

    #[test]
    fn bad_base64_is_rejected() {
        assert!(decode_token("not valid base64!!").is_err());
    }

    #[test]
    fn root_kind_is_derived_from_first_char_parity() {
        let bitmap = vec![0u8; 16];
        // Search for a root/bitmap combination producing each parity so the
        // derivation is exercised both ways.
        let mut saw_black = false;
        let mut saw_white = false;
        for root in 0u64..64 {
            let t = encode_token(root, &bitmap);
            match root_kind_from_token(&t).unwrap() {
                LeafKind::Black => saw_black = true,
                LeafKind::White => saw_white = true,
            }
        }
        assert!(saw_black && saw_white);
    }
}
