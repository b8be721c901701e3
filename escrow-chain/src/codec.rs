//! Datum/redeemer encoding for the escrow contract.
//!
//! The datum layout and redeemer indices are consensus-critical: the
//! validator script reads them field by field, so any change here breaks
//! contract compatibility. The encoder emits exactly the 11-field layout
//! below; the decoder is the strict inverse and returns `None` for anything
//! else ("not our UTXO").
//!
//! Datum = Constr 0 [
//!     buyer_vkey            : bytes(28),
//!     seller_vkey           : bytes(28),
//!     blockchain_identifier : bytes (UTF-8),
//!     input_hash            : bytes (UTF-8),
//!     result_hash           : bytes (UTF-8, empty when absent),
//!     pay_by_time           : int (ms),
//!     submit_result_time    : int (ms),
//!     unlock_time           : int (ms),
//!     external_dispute_unlock_time : int (ms),
//!     collateral_return_lovelace   : int,
//!     state                 : Constr s [ Constr 0 [cooldown_seller,
//!                                                  cooldown_buyer] ],
//! ]

use std::time::Duration;

use escrow_core::{
    amount::Amount,
    ids::{Address, BlockchainIdentifier, Vkey},
    network::Network,
    state::OnChainState,
    time::TimestampMs,
};

use crate::{hash::blake2b_224, plutus::PlutusData};

/// The contract state constructor embedded in the datum. Only non-terminal
/// states exist on-chain; terminal states are the absence of the UTXO.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DatumState {
    FundsLocked,
    ResultSubmitted,
    RefundRequested,
    Disputed,
}

impl DatumState {
    pub fn tag(self) -> u64 {
        match self {
            Self::FundsLocked => 0,
            Self::ResultSubmitted => 1,
            Self::RefundRequested => 2,
            Self::Disputed => 3,
        }
    }

    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(Self::FundsLocked),
            1 => Some(Self::ResultSubmitted),
            2 => Some(Self::RefundRequested),
            3 => Some(Self::Disputed),
            _ => None,
        }
    }

    /// The bookkeeping state equivalent to this on-chain constructor.
    pub fn to_on_chain_state(self) -> OnChainState {
        match self {
            Self::FundsLocked => OnChainState::FundsLocked,
            Self::ResultSubmitted => OnChainState::ResultSubmitted,
            Self::RefundRequested => OnChainState::RefundRequested,
            Self::Disputed => OnChainState::Disputed,
        }
    }
}

/// Per-party cooldown instants stored inside the datum's state constructor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CooldownTimes {
    pub seller: TimestampMs,
    pub buyer: TimestampMs,
}

/// The decoded escrow datum.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EscrowDatum {
    pub buyer_vkey: Vkey,
    pub seller_vkey: Vkey,
    pub blockchain_identifier: BlockchainIdentifier,
    pub input_hash: String,
    /// Empty string while no result has been submitted.
    pub result_hash: String,
    pub pay_by_time: TimestampMs,
    pub submit_result_time: TimestampMs,
    pub unlock_time: TimestampMs,
    pub external_dispute_unlock_time: TimestampMs,
    pub collateral_return_lovelace: Amount,
    pub state: DatumState,
    pub cooldowns: CooldownTimes,
}

impl EscrowDatum {
    pub fn to_plutus(&self) -> PlutusData {
        let cooldowns = PlutusData::constr(0, vec![
            PlutusData::Int(self.cooldowns.seller.to_i64()),
            PlutusData::Int(self.cooldowns.buyer.to_i64()),
        ]);
        PlutusData::constr(0, vec![
            PlutusData::Bytes(self.buyer_vkey.as_bytes().to_vec()),
            PlutusData::Bytes(self.seller_vkey.as_bytes().to_vec()),
            PlutusData::Bytes(self.blockchain_identifier.as_bytes().to_vec()),
            PlutusData::bytes_utf8(&self.input_hash),
            PlutusData::bytes_utf8(&self.result_hash),
            PlutusData::Int(self.pay_by_time.to_i64()),
            PlutusData::Int(self.submit_result_time.to_i64()),
            PlutusData::Int(self.unlock_time.to_i64()),
            PlutusData::Int(self.external_dispute_unlock_time.to_i64()),
            PlutusData::Int(self.collateral_return_lovelace.to_i64()),
            PlutusData::constr(self.state.tag(), vec![cooldowns]),
        ])
    }

    /// Strictly decode a datum. Any shape or type mismatch returns `None`;
    /// the caller treats such UTXOs as belonging to someone else.
    pub fn from_plutus(data: &PlutusData) -> Option<Self> {
        let (0, fields) = data.as_constr()? else {
            return None;
        };
        let [
            buyer_vkey,
            seller_vkey,
            blockchain_identifier,
            input_hash,
            result_hash,
            pay_by_time,
            submit_result_time,
            unlock_time,
            external_dispute_unlock_time,
            collateral_return_lovelace,
            state,
        ] = fields
        else {
            return None;
        };

        let (state_tag, state_fields) = state.as_constr()?;
        let [cooldowns] = state_fields else {
            return None;
        };
        let (0, cooldown_fields) = cooldowns.as_constr()? else {
            return None;
        };
        let [cooldown_seller, cooldown_buyer] = cooldown_fields else {
            return None;
        };

        Some(Self {
            buyer_vkey: decode_vkey(buyer_vkey)?,
            seller_vkey: decode_vkey(seller_vkey)?,
            blockchain_identifier: decode_utf8(blockchain_identifier)
                .and_then(|s| BlockchainIdentifier::new(s).ok())?,
            input_hash: decode_utf8(input_hash)?,
            result_hash: decode_utf8(result_hash)?,
            pay_by_time: decode_timestamp(pay_by_time)?,
            submit_result_time: decode_timestamp(submit_result_time)?,
            unlock_time: decode_timestamp(unlock_time)?,
            external_dispute_unlock_time: decode_timestamp(
                external_dispute_unlock_time,
            )?,
            collateral_return_lovelace: collateral_return_lovelace
                .as_int()
                .and_then(|i| Amount::try_from_i64(i).ok())?,
            state: DatumState::from_tag(state_tag)?,
            cooldowns: CooldownTimes {
                seller: decode_timestamp(cooldown_seller)?,
                buyer: decode_timestamp(cooldown_buyer)?,
            },
        })
    }
}

fn decode_vkey(data: &PlutusData) -> Option<Vkey> {
    let bytes: [u8; Vkey::LEN] = data.as_bytes()?.try_into().ok()?;
    Some(Vkey::new(bytes))
}

fn decode_utf8(data: &PlutusData) -> Option<String> {
    String::from_utf8(data.as_bytes()?.to_vec()).ok()
}

fn decode_timestamp(data: &PlutusData) -> Option<TimestampMs> {
    TimestampMs::try_from_ms(data.as_int()?).ok()
}

// --- Redeemers --- //

/// The spending action presented to the validator. Constructor indices are
/// part of the contract wire format; 4 and everything ≥ 7 are reserved.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Redeemer {
    CollectCompleted,
    RequestRefund,
    CancelRefund,
    CollectRefund,
    SubmitResult,
    AuthorizeRefund,
}

impl Redeemer {
    pub fn constr_index(self) -> u64 {
        match self {
            Self::CollectCompleted => 0,
            Self::RequestRefund => 1,
            Self::CancelRefund => 2,
            Self::CollectRefund => 3,
            Self::SubmitResult => 5,
            Self::AuthorizeRefund => 6,
        }
    }

    pub fn to_plutus(self) -> PlutusData {
        PlutusData::constr(self.constr_index(), vec![])
    }
}

// --- Cooldowns --- //

/// The absolute instant after which the acting party may act again:
/// `now + cooldown + pad`. The pad absorbs the skew between our clock and
/// block time; it must exceed the worst-case finality horizon of the target
/// network (configurable via `COOLDOWN_PAD_MS`).
pub fn new_cooldown_time(
    now: TimestampMs,
    cooldown_ms: u64,
    pad: Duration,
) -> TimestampMs {
    now.saturating_add(Duration::from_millis(cooldown_ms))
        .saturating_add(pad)
}

// --- Script address --- //

/// Derive the deterministic script address for a compiled validator on a
/// network. The payload is the BLAKE2b-224 hash of the validator bytes; the
/// text form carries a network discriminant so addresses cannot cross
/// networks.
pub fn derive_script_address(
    validator_bytes: &[u8],
    network: Network,
) -> Address {
    let payload = blake2b_224(validator_bytes);
    let prefix = match network {
        Network::Main => "script1",
        Network::Test => "script_test1",
    };
    let text = format!("{prefix}{}", escrow_hex::display(&payload));
    Address::new(text).expect("prefix and hex are printable ASCII")
}
