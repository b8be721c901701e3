//! Asset amounts and fund lists.
//!
//! Every monetary quantity is a non-negative integral number of an asset's
//! base unit, persisted as an [`i64`] and rendered as a string at API
//! boundaries. There is deliberately no fractional representation; fee math
//! that would produce a remainder rounds down in the payer's favor.

use std::{
    fmt::{self, Display},
    ops::Add,
    str::FromStr,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

/// Errors that can occur when attempting to construct an [`Amount`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("Amount is negative")]
    Negative,
    #[error("Amount overflowed")]
    Overflow,
}

/// The asset identifier ("unit") of a fund entry. The native coin is
/// [`AssetId::LOVELACE`]; anything else is `policy_id || asset_name` in hex,
/// opaque at this layer.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
pub struct AssetId(String);

impl AssetId {
    /// The native coin unit.
    pub const LOVELACE: &'static str = "lovelace";

    pub fn lovelace() -> Self {
        Self(Self::LOVELACE.to_owned())
    }

    pub fn new(unit: String) -> Self {
        Self(unit)
    }

    #[inline]
    pub fn is_lovelace(&self) -> bool {
        self.0 == Self::LOVELACE
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A non-negative integral amount of some asset's base unit.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Self = Amount(0);

    pub fn try_from_i64(value: i64) -> Result<Self, Error> {
        if value >= 0 {
            Ok(Self(value))
        } else {
            Err(Error::Negative)
        }
    }

    /// Infallible constructor for compile-time-known values.
    /// Panics on negative input.
    pub const fn from_u32(value: u32) -> Self {
        Self(value as i64)
    }

    #[inline]
    pub fn to_i64(self) -> i64 {
        self.0
    }

    pub fn checked_add(self, other: Self) -> Result<Self, Error> {
        self.0.checked_add(other.0).map(Self).ok_or(Error::Overflow)
    }

    pub fn checked_sub(self, other: Self) -> Result<Self, Error> {
        let out = self.0.checked_sub(other.0).ok_or(Error::Overflow)?;
        Self::try_from_i64(out)
    }

    /// `self * permille / 1000`, rounding down. Used for fee-rate math.
    pub fn permille(self, permille: u16) -> Result<Self, Error> {
        debug_assert!(permille <= 1000);
        let out = self
            .0
            .checked_mul(i64::from(permille))
            .ok_or(Error::Overflow)?
            / 1000;
        Ok(Self(out))
    }
}

impl Add for Amount {
    type Output = Amount;
    fn add(self, other: Self) -> Self {
        self.checked_add(other).expect("Amount addition overflowed")
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for Amount {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        let value = i64::from_str(s).context("Not a valid i64 amount")?;
        Self::try_from_i64(value).context("Invalid amount")
    }
}

/// One `(unit, amount)` fund entry.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AssetAmount {
    pub unit: AssetId,
    pub amount: Amount,
}

impl AssetAmount {
    pub fn lovelace(amount: Amount) -> Self {
        Self {
            unit: AssetId::lovelace(),
            amount,
        }
    }
}

/// The funds attached to a request: `paid_funds` on the purchase side,
/// `requested_funds` on the payment side.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Funds(pub Vec<AssetAmount>);

impl Funds {
    /// Total amount of the native coin across all entries.
    pub fn total_lovelace(&self) -> Amount {
        self.0
            .iter()
            .filter(|aa| aa.unit.is_lovelace())
            .fold(Amount::ZERO, |acc, aa| acc + aa.amount)
    }

    /// Total amount of the given unit across all entries.
    pub fn total_of(&self, unit: &AssetId) -> Amount {
        self.0
            .iter()
            .filter(|aa| &aa.unit == unit)
            .fold(Amount::ZERO, |acc, aa| acc + aa.amount)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(any(test, feature = "test-utils"))]
mod arbitrary_impl {
    use proptest::{
        arbitrary::Arbitrary,
        strategy::{BoxedStrategy, Strategy},
    };

    use super::*;

    impl Arbitrary for Amount {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            (0..i64::MAX).prop_map(Amount).boxed()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::roundtrip;

    #[test]
    fn amount_roundtrip() {
        roundtrip::fromstr_display_roundtrip_proptest::<Amount>();
        roundtrip::json_roundtrip_proptest::<Amount>();
    }

    #[test]
    fn amount_serializes_as_string() {
        let amount = Amount::try_from_i64(5_000_000).unwrap();
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"5000000\"");
    }

    #[test]
    fn rejects_negative() {
        assert!(Amount::try_from_i64(-1).is_err());
        assert!(serde_json::from_str::<Amount>("\"-1\"").is_err());
    }

    #[test]
    fn permille_rounds_down() {
        let amount = Amount::try_from_i64(999).unwrap();
        assert_eq!(amount.permille(500).unwrap().to_i64(), 499);
        assert_eq!(amount.permille(0).unwrap().to_i64(), 0);
        assert_eq!(amount.permille(1000).unwrap().to_i64(), 999);
    }

    #[test]
    fn funds_totals() {
        let funds = Funds(vec![
            AssetAmount::lovelace(Amount::try_from_i64(3).unwrap()),
            AssetAmount {
                unit: AssetId::new("deadbeef.token".to_owned()),
                amount: Amount::try_from_i64(7).unwrap(),
            },
            AssetAmount::lovelace(Amount::try_from_i64(4).unwrap()),
        ]);
        assert_eq!(funds.total_lovelace().to_i64(), 7);
        assert_eq!(
            funds
                .total_of(&AssetId::new("deadbeef.token".to_owned()))
                .to_i64(),
            7
        );
    }
}
