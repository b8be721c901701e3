//! `PlutusData` and its canonical CBOR form.
//!
//! On-chain data is a small sum type over integers, byte strings, lists,
//! maps, and tagged constructors. Constructors use the compact CBOR tag
//! range `121..=127` for indices `0..=6`, `1280..=1400` for indices
//! `7..=127`, and the general tag `102` beyond that.
//!
//! Decoding is total: anything that is not a well-formed `PlutusData` shape
//! returns `None` rather than panicking, so foreign UTXOs at the script
//! address are simply skipped.

use ciborium::value::{Integer, Value};

/// Compact constructor-tag range start for indices `0..=6`.
const COMPACT_TAG_BASE: u64 = 121;
/// Constructor-tag range start for indices `7..=127`.
const EXTENDED_TAG_BASE: u64 = 1280;
/// General constructor tag: content is `[index, fields]`.
const GENERAL_TAG: u64 = 102;

/// A structured on-chain datum or redeemer value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PlutusData {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<PlutusData>),
    Map(Vec<(PlutusData, PlutusData)>),
    Constr { tag: u64, fields: Vec<PlutusData> },
}

impl PlutusData {
    /// Shorthand for a constructor with index `tag`.
    pub fn constr(tag: u64, fields: Vec<PlutusData>) -> Self {
        Self::Constr { tag, fields }
    }

    /// Shorthand for a UTF-8 byte string.
    pub fn bytes_utf8(s: &str) -> Self {
        Self::Bytes(s.as_bytes().to_vec())
    }

    /// Serialize to canonical CBOR bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(&self.to_cbor_value(), &mut out)
            .expect("writing to a Vec cannot fail");
        out
    }

    /// Deserialize from CBOR bytes. Returns `None` on anything that is not a
    /// well-formed `PlutusData` encoding.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let value: Value = ciborium::de::from_reader(bytes).ok()?;
        Self::from_cbor_value(&value)
    }

    pub(crate) fn to_cbor_value(&self) -> Value {
        match self {
            Self::Int(i) => Value::Integer(Integer::from(*i)),
            Self::Bytes(b) => Value::Bytes(b.clone()),
            Self::List(items) =>
                Value::Array(items.iter().map(Self::to_cbor_value).collect()),
            Self::Map(pairs) => Value::Map(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_cbor_value(), v.to_cbor_value()))
                    .collect(),
            ),
            Self::Constr { tag, fields } => {
                let fields_value = Value::Array(
                    fields.iter().map(Self::to_cbor_value).collect(),
                );
                match constr_cbor_tag(*tag) {
                    Some(cbor_tag) =>
                        Value::Tag(cbor_tag, Box::new(fields_value)),
                    None => Value::Tag(
                        GENERAL_TAG,
                        Box::new(Value::Array(vec![
                            Value::Integer(Integer::from(*tag)),
                            fields_value,
                        ])),
                    ),
                }
            }
        }
    }

    fn from_cbor_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(i) => i64::try_from(*i).ok().map(Self::Int),
            Value::Bytes(b) => Some(Self::Bytes(b.clone())),
            Value::Array(items) => items
                .iter()
                .map(Self::from_cbor_value)
                .collect::<Option<Vec<_>>>()
                .map(Self::List),
            Value::Map(pairs) => pairs
                .iter()
                .map(|(k, v)| {
                    Some((Self::from_cbor_value(k)?, Self::from_cbor_value(v)?))
                })
                .collect::<Option<Vec<_>>>()
                .map(Self::Map),
            Value::Tag(cbor_tag, inner) => {
                let (tag, fields_value) = match *cbor_tag {
                    t if (COMPACT_TAG_BASE..COMPACT_TAG_BASE + 7)
                        .contains(&t) =>
                        (t - COMPACT_TAG_BASE, inner.as_ref()),
                    t if (EXTENDED_TAG_BASE..EXTENDED_TAG_BASE + 121)
                        .contains(&t) =>
                        (t - EXTENDED_TAG_BASE + 7, inner.as_ref()),
                    GENERAL_TAG => {
                        let Value::Array(parts) = inner.as_ref() else {
                            return None;
                        };
                        let [index, fields] = parts.as_slice() else {
                            return None;
                        };
                        let Value::Integer(index) = index else {
                            return None;
                        };
                        (u64::try_from(*index).ok()?, fields)
                    }
                    _ => return None,
                };
                let Value::Array(fields) = fields_value else {
                    return None;
                };
                let fields = fields
                    .iter()
                    .map(Self::from_cbor_value)
                    .collect::<Option<Vec<_>>>()?;
                Some(Self::Constr { tag, fields })
            }
            _ => None,
        }
    }

    // --- Typed accessors used by the datum decoder --- //

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    pub fn as_constr(&self) -> Option<(u64, &[PlutusData])> {
        match self {
            Self::Constr { tag, fields } => Some((*tag, fields.as_slice())),
            _ => None,
        }
    }
}

fn constr_cbor_tag(tag: u64) -> Option<u64> {
    if tag <= 6 {
        Some(COMPACT_TAG_BASE + tag)
    } else if tag <= 127 {
        Some(EXTENDED_TAG_BASE + tag - 7)
    } else {
        None
    }
}
