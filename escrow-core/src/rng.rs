//! Random number generation utilities.

use std::num::NonZeroU32;

pub use rand_core::{CryptoRng, RngCore};
use ring::rand::SecureRandom;

const RAND_ERROR_CODE: NonZeroU32 =
    match NonZeroU32::new(rand_core::Error::CUSTOM_START) {
        Some(code) => code,
        None => panic!("CUSTOM_START is non-zero"),
    };

/// A succinct trait alias for a Cryptographically Secure PRNG.
pub trait Crng: RngCore + CryptoRng {}

impl<R: RngCore + CryptoRng> Crng for R {}

/// A compatibility wrapper so we can use `ring`'s PRG with `rand` traits.
/// Used for seal nonces and anywhere else the service needs entropy.
#[derive(Clone, Debug)]
pub struct SysRng(ring::rand::SystemRandom);

impl SysRng {
    pub fn new() -> Self {
        Self(ring::rand::SystemRandom::new())
    }
}

impl Default for SysRng {
    fn default() -> Self {
        Self::new()
    }
}

/// [`ring::rand::SystemRandom`] is a cryptographically secure PRG
impl CryptoRng for SysRng {}

impl RngCore for SysRng {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        rand_core::impls::next_u32_via_fill(self)
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        rand_core::impls::next_u64_via_fill(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.try_fill_bytes(dest).expect("ring SystemRandom failed")
    }

    fn try_fill_bytes(
        &mut self,
        dest: &mut [u8],
    ) -> Result<(), rand_core::Error> {
        self.0
            .fill(dest)
            // ring's error type here is empty/unspecified anyway.
            .map_err(|_| rand_core::Error::from(RAND_ERROR_CODE))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fills_bytes() {
        let mut rng = SysRng::new();
        let mut buf = [0u8; 32];
        rng.fill_bytes(&mut buf);
        // Astronomically unlikely to be all zeroes.
        assert_ne!(buf, [0u8; 32]);
    }
}
