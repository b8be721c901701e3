use std::{fmt, fmt::Display, str::FromStr};

use anyhow::{Context, ensure};
use escrow_hex::FromHex;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

/// Maximum length in UTF-8 bytes of a [`BlockchainIdentifier`]. The value is
/// embedded in the on-chain datum, where oversized byte strings inflate the
/// script execution cost.
pub const MAX_BLOCKCHAIN_IDENTIFIER_BYTES: usize = 64;

/// Declares a store-minted opaque id newtype over [`u64`].
macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[derive(Serialize, Deserialize)]
        #[cfg_attr(
            any(test, feature = "test-utils"),
            derive(proptest_derive::Arbitrary)
        )]
        pub struct $name(pub u64);

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "_{}"), self.0)
            }
        }
    };
}

entity_id!(
    /// Identifies a configured escrow contract instance.
    PaymentSourceId, "src"
);
entity_id!(
    /// Identifies a hot wallet or a counterparty wallet descriptor.
    WalletId, "wlt"
);
entity_id!(
    /// Identifies a payment or purchase request.
    RequestId, "req"
);
entity_id!(
    /// Identifies a submitted (or about-to-be-submitted) chain transaction.
    TransactionId, "txn"
);

// --- BlockchainIdentifier --- //

/// The opaque handle minted by the service and shared between a payment and
/// its matching purchase. Recorded verbatim in the on-chain datum.
///
/// Invariant: valid UTF-8, non-empty, at most
/// [`MAX_BLOCKCHAIN_IDENTIFIER_BYTES`] bytes.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub struct BlockchainIdentifier(String);

#[derive(Debug, Error)]
pub enum BlockchainIdentifierError {
    #[error("blockchain identifier must not be empty")]
    Empty,
    #[error(
        "blockchain identifier too long: {0} bytes > \
         {MAX_BLOCKCHAIN_IDENTIFIER_BYTES}"
    )]
    TooLong(usize),
}

impl BlockchainIdentifier {
    pub fn new(s: String) -> Result<Self, BlockchainIdentifierError> {
        if s.is_empty() {
            return Err(BlockchainIdentifierError::Empty);
        }
        if s.len() > MAX_BLOCKCHAIN_IDENTIFIER_BYTES {
            return Err(BlockchainIdentifierError::TooLong(s.len()));
        }
        Ok(Self(s))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Display for BlockchainIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BlockchainIdentifier {
    type Err = BlockchainIdentifierError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_owned())
    }
}

// --- Vkey --- //

/// A 28-byte verification-key hash identifying a signing key on-chain.
/// Displayed and serialized as lowercase hex.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub struct Vkey([u8; 28]);

impl Vkey {
    pub const LEN: usize = 28;

    #[inline]
    pub const fn new(bytes: [u8; 28]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 28] {
        &self.0
    }
}

impl Display for Vkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", escrow_hex::display(&self.0))
    }
}

impl fmt::Debug for Vkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vkey({self})")
    }
}

impl FromStr for Vkey {
    type Err = escrow_hex::DecodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <[u8; 28]>::from_hex(s).map(Self)
    }
}

// --- TxHash --- //

/// A 32-byte transaction hash. Displayed and serialized as lowercase hex.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub struct TxHash([u8; 32]);

impl TxHash {
    pub const LEN: usize = 32;

    #[inline]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", escrow_hex::display(&self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({self})")
    }
}

impl FromStr for TxHash {
    type Err = escrow_hex::DecodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <[u8; 32]>::from_hex(s).map(Self)
    }
}

// --- Address --- //

/// A chain address in its canonical text encoding. Opaque at this layer; the
/// chain crate derives script addresses, everything else passes through.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub struct Address(String);

impl Address {
    pub fn new(s: String) -> anyhow::Result<Self> {
        ensure!(!s.is_empty(), "Address must not be empty");
        ensure!(
            s.bytes().all(|b| b.is_ascii_graphic()),
            "Address must be printable ASCII"
        );
        Ok(Self(s))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        Self::new(s.to_owned()).context("Invalid address")
    }
}

#[cfg(any(test, feature = "test-utils"))]
mod arbitrary_impl {
    use proptest::{
        arbitrary::{Arbitrary, any},
        strategy::{BoxedStrategy, Strategy},
    };

    use super::*;

    impl Arbitrary for Vkey {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            any::<[u8; 28]>().prop_map(Vkey::new).boxed()
        }
    }

    impl Arbitrary for TxHash {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            any::<[u8; 32]>().prop_map(TxHash::new).boxed()
        }
    }

    impl Arbitrary for BlockchainIdentifier {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            "[a-z0-9-]{1,64}"
                .prop_map(|s| BlockchainIdentifier::new(s).unwrap())
                .boxed()
        }
    }
}
