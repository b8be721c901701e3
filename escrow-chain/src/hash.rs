//! BLAKE2b digests used by the chain: 224-bit for key hashes and script
//! addresses, 256-bit for transaction ids.

use blake2::{
    Blake2b, Digest,
    digest::consts::{U28, U32},
};

type Blake2b224 = Blake2b<U28>;
type Blake2b256 = Blake2b<U32>;

/// 28-byte BLAKE2b-224 digest, the chain's key-hash primitive.
pub fn blake2b_224(data: &[u8]) -> [u8; 28] {
    let mut hasher = Blake2b224::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// 32-byte BLAKE2b-256 digest, the chain's transaction-id primitive.
pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}
