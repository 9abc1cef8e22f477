//! Block header layout, midstate and merkle helpers.
//!
//! Work payloads hold the 80-byte header in consensus (little-endian)
//! serialization followed by SHA-256 padding, 128 bytes in total:
//!
//! ```text
//! offset  size  field
//!      0     4  version
//!      4    32  previous block hash
//!     36    32  merkle root
//!     68     4  ntime
//!     72     4  nbits
//!     76     4  nonce
//!     80    48  SHA-256 padding (0x80 .. length 640 bits)
//! ```
//!
//! Getwork pools exchange the same 128 bytes with every 32-bit word
//! byte-swapped; [`swap_words`] converts between the two.

use bitcoin::hashes::{sha256d, Hash};
use sha2::digest::generic_array::GenericArray;

pub const HEADER_LEN: usize = 80;
pub const PAYLOAD_LEN: usize = 128;

pub const VERSION_OFFSET: usize = 0;
pub const PREV_HASH_OFFSET: usize = 4;
pub const MERKLE_ROOT_OFFSET: usize = 36;
pub const NTIME_OFFSET: usize = 68;
pub const NBITS_OFFSET: usize = 72;
pub const NONCE_OFFSET: usize = 76;

const SHA256_IV: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

/// Header fields needed to lay out a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFields {
    pub version: u32,
    pub prev_hash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub ntime: u32,
    pub nbits: u32,
    pub nonce: u32,
}

/// Lay out a 128-byte payload from header fields, including SHA-256 padding.
pub fn build_payload(fields: &HeaderFields) -> [u8; PAYLOAD_LEN] {
    let mut data = [0u8; PAYLOAD_LEN];
    data[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(&fields.version.to_le_bytes());
    data[PREV_HASH_OFFSET..PREV_HASH_OFFSET + 32].copy_from_slice(&fields.prev_hash);
    data[MERKLE_ROOT_OFFSET..MERKLE_ROOT_OFFSET + 32].copy_from_slice(&fields.merkle_root);
    write_u32(&mut data, NTIME_OFFSET, fields.ntime);
    write_u32(&mut data, NBITS_OFFSET, fields.nbits);
    write_u32(&mut data, NONCE_OFFSET, fields.nonce);
    pad_payload(&mut data);
    data
}

/// Write SHA-256 padding for an 80-byte message into bytes 80..128.
pub fn pad_payload(data: &mut [u8; PAYLOAD_LEN]) {
    data[HEADER_LEN..].fill(0);
    data[HEADER_LEN] = 0x80;
    data[126] = 0x02;
    data[127] = 0x80;
}

pub fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(word)
}

pub fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Reverse the bytes of every 32-bit word in place.
pub fn swap_words(data: &mut [u8]) {
    for word in data.chunks_exact_mut(4) {
        word.reverse();
    }
}

/// SHA-256 state after compressing the first 64 bytes of the payload.
///
/// The eight state words are stored little-endian, the layout getwork pools
/// send in their `midstate` field.
pub fn midstate(data: &[u8; PAYLOAD_LEN]) -> [u8; 32] {
    let mut state = SHA256_IV;
    let block = GenericArray::clone_from_slice(&data[..64]);
    sha2::compress256(&mut state, &[block]);

    let mut out = [0u8; 32];
    for (chunk, word) in out.chunks_exact_mut(4).zip(state) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}

/// Double SHA-256, returned in internal (little-endian) byte order.
pub fn sha256d(bytes: &[u8]) -> [u8; 32] {
    sha256d::Hash::hash(bytes).to_byte_array()
}

/// Hash of the 80-byte header in a payload.
pub fn header_hash(data: &[u8; PAYLOAD_LEN]) -> [u8; 32] {
    sha256d(&data[..HEADER_LEN])
}

/// Fold a coinbase hash up the merkle branch to the root.
pub fn merkle_root(coinbase_hash: [u8; 32], branches: &[[u8; 32]]) -> [u8; 32] {
    let mut concat = [0u8; 64];
    let mut root = coinbase_hash;
    for branch in branches {
        concat[..32].copy_from_slice(&root);
        concat[32..].copy_from_slice(branch);
        root = sha256d(&concat);
    }
    root
}

/// Merkle branch for the coinbase position given the other transactions' ids.
///
/// `txids` excludes the coinbase. The result folds with [`merkle_root`].
pub fn merkle_branches(txids: &[[u8; 32]]) -> Vec<[u8; 32]> {
    let mut branches = Vec::new();
    // Level entries after the coinbase slot.
    let mut level: Vec<[u8; 32]> = txids.to_vec();

    while !level.is_empty() {
        branches.push(level[0]);
        // The coinbase slot pairs with level[0]; the rest pair among
        // themselves, duplicating the last when the total is odd.
        let rest = &level[1..];
        let mut next = Vec::with_capacity(rest.len().div_ceil(2));
        for pair in rest.chunks(2) {
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut concat = [0u8; 64];
            concat[..32].copy_from_slice(&pair[0]);
            concat[32..].copy_from_slice(&right);
            next.push(sha256d(&concat));
        }
        level = next;
    }
    branches
}

/// Parse a display-order (big-endian) hash as used by bitcoind RPC into
/// internal byte order.
pub fn hash_from_display_hex(hex_str: &str) -> Result<[u8; 32], hex::FromHexError> {
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(hex_str, &mut bytes)?;
    bytes.reverse();
    Ok(bytes)
}

/// Format an internal-order hash the way block explorers display it.
pub fn hash_to_display_hex(hash: &[u8; 32]) -> String {
    let mut bytes = *hash;
    bytes.reverse();
    hex::encode(bytes)
}
