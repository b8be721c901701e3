//! Test-only helpers shared across workspace crates' test suites.

pub mod roundtrip {
    use std::{fmt::Debug, fmt::Display, str::FromStr};

    use proptest::{
        arbitrary::{Arbitrary, any},
        prop_assert_eq, proptest,
    };
    use serde::{Serialize, de::DeserializeOwned};

    /// Quickly create a JSON roundtrip proptest for a simple data type which
    /// maps to/from a single base JSON type (string, int, ..).
    pub fn json_roundtrip_proptest<T>()
    where
        T: Arbitrary + PartialEq + Serialize + DeserializeOwned,
    {
        proptest!(|(value1 in any::<T>())| {
            let json1 = serde_json::to_string(&value1).unwrap();
            let value2 = serde_json::from_str::<T>(&json1).unwrap();
            let json2 = serde_json::to_string(&value2).unwrap();
            prop_assert_eq!(&value1, &value2);
            prop_assert_eq!(&json1, &json2);
        });
    }

    /// Quickly create a `FromStr` / `Display` roundtrip proptest.
    pub fn fromstr_display_roundtrip_proptest<T>()
    where
        T: Arbitrary + PartialEq + FromStr + Display,
        <T as FromStr>::Err: Debug,
    {
        proptest!(|(value1 in any::<T>())| {
            let string1 = value1.to_string();
            let value2 = T::from_str(&string1).unwrap();
            let string2 = value2.to_string();
            prop_assert_eq!(&value1, &value2);
            prop_assert_eq!(&string1, &string2);
        });
    }

    /// Assert that the JSON serialization of every variant of a unit enum
    /// matches a hard-coded expected form, catching accidental breaks of
    /// persisted-state compatibility.
    pub fn json_unit_enum_backwards_compat<T>(expected_ser: &str)
    where
        T: PartialEq + Serialize + DeserializeOwned + strum::VariantArray,
        T: Copy + Debug,
    {
        let variants = T::VARIANTS;
        let actual_ser = serde_json::to_string(variants).unwrap();
        assert_eq!(actual_ser, expected_ser);
        let roundtripped = serde_json::from_str::<Vec<T>>(&actual_ser).unwrap();
        assert_eq!(roundtripped.as_slice(), variants);
    }
}
