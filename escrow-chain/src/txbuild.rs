//! Transaction construction.
//!
//! Three builders cover every escrow transaction the engine submits:
//!
//! - [`lock`]: spend wallet UTXOs into a fresh escrow UTXO (no script
//!   input).
//! - [`interact`]: spend the escrow UTXO with a redeemer and re-emit it with
//!   a new datum and the *same* value.
//! - [`withdraw`]: consume the escrow UTXO, paying out to the collection
//!   address with an optional service-fee output and collateral return.
//!
//! Script-spending transactions are built twice: once with the worst-case
//! execution budget, then again with the budget the ledger's dry-run
//! evaluation actually reported (see [`build_with_estimated_budget`]).

use ciborium::value::{Integer, Value};
use escrow_core::{
    amount::{Amount, AssetAmount, AssetId, Funds},
    ids::{Address, TxHash, Vkey},
};
use thiserror::Error;

use crate::{
    client::{ChainClient, ChainError, ExUnits, OutPoint, Utxo},
    codec::Redeemer,
    hash::blake2b_256,
    plutus::PlutusData,
    slots::ValidityWindow,
};

/// Worst-case execution budget used for the first build pass.
pub const WORST_CASE_EX_UNITS: ExUnits = ExUnits {
    mem: 7_000_000,
    steps: 3_000_000_000,
};

/// Fixed total collateral attached to every script-spending transaction.
pub const TOTAL_COLLATERAL: Amount = Amount::from_u32(3_000_000);

/// Minimum lovelace a wallet UTXO must hold to anchor fee payment.
pub const MIN_FEE_UTXO_LOVELACE: i64 = 5_000_000;

/// Maximum number of wallet UTXOs consumed for fees in one transaction.
pub const MAX_FEE_UTXOS: usize = 4;

// Linear fee parameters: `fee = PER_BYTE * size + CONSTANT + script costs`.
const FEE_PER_BYTE: i64 = 44;
const FEE_CONSTANT: i64 = 155_381;
// Fudge for the size delta between the fee-0 draft and the final body.
const FEE_SIZE_PAD: usize = 128;

#[derive(Debug, Error)]
pub enum TxBuildError {
    #[error(
        "no wallet UTXO holds at least {MIN_FEE_UTXO_LOVELACE} lovelace"
    )]
    InsufficientFunds,
    #[error("collateral UTXO holds less than {TOTAL_COLLATERAL} lovelace")]
    InsufficientCollateral,
    #[error("fee {fee} exceeds selected wallet inputs {inputs}")]
    FeeExceedsInputs { fee: Amount, inputs: Amount },
    #[error("script evaluation rejected the draft transaction: {0}")]
    Evaluation(#[source] ChainError),
    #[error("chain error while estimating budget: {0}")]
    Chain(#[source] ChainError),
    #[error("value arithmetic overflowed")]
    Overflow,
}

// --- Transaction structure --- //

/// One transaction output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOutput {
    pub address: Address,
    pub value: Funds,
    pub datum: Option<PlutusData>,
}

/// A redeemer attached to a spent script input.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RedeemerEntry {
    /// Index of the script input in `TxBody::inputs`.
    pub input_index: u32,
    pub redeemer: Redeemer,
    pub budget: ExUnits,
}

/// An unsigned transaction body. The CBOR serialization of this struct is
/// the signing payload; its BLAKE2b-256 digest is the transaction hash.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxBody {
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<TxOutput>,
    pub fee: Amount,
    pub window: ValidityWindow,
    pub required_signers: Vec<Vkey>,
    pub collateral_inputs: Vec<OutPoint>,
    pub total_collateral: Amount,
    pub collateral_return: Option<TxOutput>,
    pub redeemers: Vec<RedeemerEntry>,
}

impl TxBody {
    /// Canonical CBOR serialization of the body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(&self.to_cbor_value(), &mut out)
            .expect("writing to a Vec cannot fail");
        out
    }

    /// The transaction hash: BLAKE2b-256 over the serialized body.
    pub fn hash(&self) -> TxHash {
        TxHash::new(blake2b_256(&self.to_bytes()))
    }

    fn to_cbor_value(&self) -> Value {
        fn outpoint(op: &OutPoint) -> Value {
            Value::Array(vec![
                Value::Bytes(op.tx_hash.as_bytes().to_vec()),
                Value::Integer(Integer::from(op.index)),
            ])
        }
        fn funds(value: &Funds) -> Value {
            Value::Array(
                value
                    .0
                    .iter()
                    .map(|aa| {
                        Value::Array(vec![
                            Value::Text(aa.unit.as_str().to_owned()),
                            Value::Integer(Integer::from(aa.amount.to_i64())),
                        ])
                    })
                    .collect(),
            )
        }
        fn output(out: &TxOutput) -> Value {
            let mut fields = vec![
                Value::Text(out.address.as_str().to_owned()),
                funds(&out.value),
            ];
            if let Some(datum) = &out.datum {
                fields.push(datum.to_cbor_value());
            }
            Value::Array(fields)
        }

        Value::Array(vec![
            Value::Array(self.inputs.iter().map(outpoint).collect()),
            Value::Array(self.outputs.iter().map(output).collect()),
            Value::Integer(Integer::from(self.fee.to_i64())),
            Value::Integer(Integer::from(self.window.invalid_before)),
            Value::Integer(Integer::from(self.window.invalid_after)),
            Value::Array(
                self.required_signers
                    .iter()
                    .map(|vkey| Value::Bytes(vkey.as_bytes().to_vec()))
                    .collect(),
            ),
            Value::Array(
                self.collateral_inputs.iter().map(outpoint).collect(),
            ),
            Value::Integer(Integer::from(self.total_collateral.to_i64())),
            match &self.collateral_return {
                Some(ret) => output(ret),
                None => Value::Null,
            },
            Value::Array(
                self.redeemers
                    .iter()
                    .map(|entry| {
                        Value::Array(vec![
                            Value::Integer(Integer::from(entry.input_index)),
                            entry.redeemer.to_plutus().to_cbor_value(),
                            Value::Array(vec![
                                Value::Integer(Integer::from(
                                    entry.budget.mem,
                                )),
                                Value::Integer(Integer::from(
                                    entry.budget.steps,
                                )),
                            ]),
                        ])
                    })
                    .collect(),
            ),
        ])
    }
}

/// A single ed25519 witness over the body hash.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VkeyWitness {
    pub public_key: [u8; 32],
    pub signature: [u8; 64],
}

/// A fully signed transaction, ready for submission.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignedTx {
    pub body: TxBody,
    pub witnesses: Vec<VkeyWitness>,
}

impl SignedTx {
    pub fn hash(&self) -> TxHash {
        self.body.hash()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let witnesses = Value::Array(
            self.witnesses
                .iter()
                .map(|w| {
                    Value::Array(vec![
                        Value::Bytes(w.public_key.to_vec()),
                        Value::Bytes(w.signature.to_vec()),
                    ])
                })
                .collect(),
        );
        let tx = Value::Array(vec![self.body.to_cbor_value(), witnesses]);
        let mut out = Vec::new();
        ciborium::ser::into_writer(&tx, &mut out)
            .expect("writing to a Vec cannot fail");
        out
    }
}

// --- Fee estimation --- //

/// Estimate the fee for a body of `body_size` bytes executing `budget`.
/// Script costs are priced at the protocol's per-unit rates, rounded up.
pub fn estimate_fee(body_size: usize, budget: ExUnits) -> Amount {
    let size_fee = FEE_PER_BYTE * (body_size + FEE_SIZE_PAD) as i64;
    let mem_fee = (budget.mem as i64 * 577 + 10_000 - 1) / 10_000;
    let step_fee = (budget.steps as i64 * 721 + 10_000_000 - 1) / 10_000_000;
    Amount::try_from_i64(FEE_CONSTANT + size_fee + mem_fee + step_fee)
        .expect("fee components are non-negative")
}

/// Select wallet UTXOs to fund `target` lovelace of spending: highest
/// first, stopping once the target is covered, at most [`MAX_FEE_UTXOS`].
/// Fails unless at least one candidate holds [`MIN_FEE_UTXO_LOVELACE`].
pub fn select_fee_utxos(
    wallet_utxos: &[Utxo],
    target: Amount,
) -> Result<Vec<Utxo>, TxBuildError> {
    let mut candidates: Vec<&Utxo> =
        wallet_utxos.iter().filter(|u| u.datum.is_none()).collect();
    candidates.sort_by_key(|u| std::cmp::Reverse(u.lovelace().to_i64()));

    match candidates.first() {
        Some(best) if best.lovelace().to_i64() >= MIN_FEE_UTXO_LOVELACE => (),
        _ => return Err(TxBuildError::InsufficientFunds),
    }

    let mut selected = Vec::new();
    let mut covered = Amount::ZERO;
    for utxo in candidates.into_iter().take(MAX_FEE_UTXOS) {
        if covered >= target && !selected.is_empty() {
            break;
        }
        covered = covered
            .checked_add(utxo.lovelace())
            .map_err(|_| TxBuildError::Overflow)?;
        selected.push(utxo.clone());
    }
    Ok(selected)
}

/// The lovelace target handed to [`select_fee_utxos`] for transactions
/// that only pay fees (everything but the lock).
const FEE_ONLY_TARGET: Amount = Amount::from_u32(2_000_000);

/// Change below this stays a single output; above it the change splits so
/// the wallet always retains a dedicated collateral-sized UTXO.
const CHANGE_SPLIT_THRESHOLD: Amount = Amount::from_u32(10_000_000);
const COLLATERAL_CHANGE: Amount = Amount::from_u32(5_000_000);

/// Change back to the wallet. Large change splits off a collateral-sized
/// output so the *next* transaction always finds a separate collateral
/// UTXO.
fn change_outputs(change: Amount, change_address: &Address) -> Vec<TxOutput> {
    if change >= CHANGE_SPLIT_THRESHOLD {
        let main = change
            .checked_sub(COLLATERAL_CHANGE)
            .expect("change >= split threshold > collateral change");
        vec![
            TxOutput {
                address: change_address.clone(),
                value: Funds(vec![AssetAmount::lovelace(main)]),
                datum: None,
            },
            TxOutput {
                address: change_address.clone(),
                value: Funds(vec![AssetAmount::lovelace(COLLATERAL_CHANGE)]),
                datum: None,
            },
        ]
    } else {
        vec![TxOutput {
            address: change_address.clone(),
            value: Funds(vec![AssetAmount::lovelace(change)]),
            datum: None,
        }]
    }
}

// --- Builders --- //

/// Parameters for [`lock`].
pub struct LockParams<'a> {
    pub wallet_utxos: &'a [Utxo],
    /// The full value to lock at the script address, collateral included.
    pub locked_value: Funds,
    pub datum: PlutusData,
    pub script_address: &'a Address,
    pub change_address: &'a Address,
    pub required_signer: Vkey,
    pub window: ValidityWindow,
}

/// Build a funds-locking transaction: wallet inputs only, one new escrow
/// UTXO carrying the initial datum, change back to the wallet. No script
/// input is spent, so no collateral or redeemer is attached.
pub fn lock(params: LockParams<'_>) -> Result<TxBody, TxBuildError> {
    let locked_lovelace = params.locked_value.total_lovelace();
    let target = locked_lovelace
        .checked_add(FEE_ONLY_TARGET)
        .map_err(|_| TxBuildError::Overflow)?;
    let fee_utxos = select_fee_utxos(params.wallet_utxos, target)?;
    let inputs: Vec<OutPoint> =
        fee_utxos.iter().map(|u| u.outpoint).collect();
    let inputs_lovelace = sum_lovelace(&fee_utxos)?;
    let script_output = TxOutput {
        address: params.script_address.clone(),
        value: params.locked_value.clone(),
        datum: Some(params.datum.clone()),
    };

    let mut body = TxBody {
        inputs,
        outputs: vec![script_output],
        fee: Amount::ZERO,
        window: params.window,
        required_signers: vec![params.required_signer],
        collateral_inputs: Vec::new(),
        total_collateral: Amount::ZERO,
        collateral_return: None,
        redeemers: Vec::new(),
    };

    let fee = estimate_fee(body.to_bytes().len(), ExUnits { mem: 0, steps: 0 });
    let spent = locked_lovelace
        .checked_add(fee)
        .map_err(|_| TxBuildError::Overflow)?;
    let change = inputs_lovelace
        .checked_sub(spent)
        .map_err(|_| TxBuildError::FeeExceedsInputs {
            fee: spent,
            inputs: inputs_lovelace,
        })?;

    body.fee = fee;
    body.outputs
        .extend(change_outputs(change, params.change_address));
    Ok(body)
}

/// Parameters for [`interact`].
pub struct InteractParams<'a> {
    pub redeemer: Redeemer,
    /// The escrow UTXO being spent.
    pub source_utxo: &'a Utxo,
    pub collateral_utxo: &'a Utxo,
    pub wallet_utxos: &'a [Utxo],
    /// The datum of the re-emitted escrow UTXO.
    pub new_datum: PlutusData,
    pub script_address: &'a Address,
    pub change_address: &'a Address,
    pub required_signer: Vkey,
    pub window: ValidityWindow,
    pub budget: ExUnits,
}

/// Build an escrow-interaction transaction: spend the escrow UTXO with the
/// given redeemer and re-emit it carrying `new_datum` and the *same* value.
/// Wallet UTXOs fund the fee; collateral is a separate UTXO.
pub fn interact(params: InteractParams<'_>) -> Result<TxBody, TxBuildError> {
    check_collateral(params.collateral_utxo)?;
    let fee_utxos = select_fee_utxos(params.wallet_utxos, FEE_ONLY_TARGET)?;
    let inputs_lovelace = sum_lovelace(&fee_utxos)?;

    // The script input comes first so the redeemer's input index is stable.
    let mut inputs = vec![params.source_utxo.outpoint];
    inputs.extend(fee_utxos.iter().map(|u| u.outpoint));

    let script_output = TxOutput {
        address: params.script_address.clone(),
        value: params.source_utxo.value.clone(),
        datum: Some(params.new_datum.clone()),
    };

    let mut body = TxBody {
        inputs,
        outputs: vec![script_output],
        fee: Amount::ZERO,
        window: params.window,
        required_signers: vec![params.required_signer],
        collateral_inputs: vec![params.collateral_utxo.outpoint],
        total_collateral: TOTAL_COLLATERAL,
        collateral_return: collateral_return_output(params.collateral_utxo)?,
        redeemers: vec![RedeemerEntry {
            input_index: 0,
            redeemer: params.redeemer,
            budget: params.budget,
        }],
    };

    let fee = estimate_fee(body.to_bytes().len(), params.budget);
    let change = inputs_lovelace.checked_sub(fee).map_err(|_| {
        TxBuildError::FeeExceedsInputs {
            fee,
            inputs: inputs_lovelace,
        }
    })?;

    body.fee = fee;
    body.outputs
        .extend(change_outputs(change, params.change_address));
    Ok(body)
}

/// Parameters for [`withdraw`].
pub struct WithdrawParams<'a> {
    /// [`Redeemer::CollectCompleted`] or [`Redeemer::CollectRefund`].
    pub redeemer: Redeemer,
    pub source_utxo: &'a Utxo,
    pub collateral_utxo: &'a Utxo,
    pub wallet_utxos: &'a [Utxo],
    /// Funds paid to the collection address.
    pub collection: (Address, Funds),
    /// Optional service-fee output. Carries an inline `OutputReference`
    /// datum naming the spent escrow outpoint, which the validator uses to
    /// prove the fee's provenance.
    pub service_fee: Option<(Address, Funds)>,
    /// Optional collateral returned to the counterparty wallet.
    pub escrow_collateral_return: Option<(Address, Amount)>,
    pub change_address: &'a Address,
    pub required_signer: Vkey,
    pub window: ValidityWindow,
    pub budget: ExUnits,
}

/// Build a withdrawal transaction: consume the escrow UTXO entirely, paying
/// the collected funds out to the collection address.
pub fn withdraw(params: WithdrawParams<'_>) -> Result<TxBody, TxBuildError> {
    check_collateral(params.collateral_utxo)?;
    let fee_utxos = select_fee_utxos(params.wallet_utxos, FEE_ONLY_TARGET)?;
    let inputs_lovelace = sum_lovelace(&fee_utxos)?;

    let mut inputs = vec![params.source_utxo.outpoint];
    inputs.extend(fee_utxos.iter().map(|u| u.outpoint));

    let (collection_address, collection_value) = params.collection;
    let mut outputs = vec![TxOutput {
        address: collection_address,
        value: collection_value,
        datum: None,
    }];

    if let Some((fee_address, fee_value)) = params.service_fee {
        let source = params.source_utxo.outpoint;
        // OutputReference inline datum: which escrow UTXO this fee came
        // from.
        let provenance = PlutusData::constr(0, vec![
            PlutusData::Bytes(source.tx_hash.as_bytes().to_vec()),
            PlutusData::Int(i64::from(source.index)),
        ]);
        outputs.push(TxOutput {
            address: fee_address,
            value: fee_value,
            datum: Some(provenance),
        });
    }

    if let Some((return_address, return_lovelace)) =
        params.escrow_collateral_return
    {
        outputs.push(TxOutput {
            address: return_address,
            value: Funds(vec![AssetAmount::lovelace(return_lovelace)]),
            datum: None,
        });
    }

    let mut body = TxBody {
        inputs,
        outputs,
        fee: Amount::ZERO,
        window: params.window,
        required_signers: vec![params.required_signer],
        collateral_inputs: vec![params.collateral_utxo.outpoint],
        total_collateral: TOTAL_COLLATERAL,
        collateral_return: collateral_return_output(params.collateral_utxo)?,
        redeemers: vec![RedeemerEntry {
            input_index: 0,
            redeemer: params.redeemer,
            budget: params.budget,
        }],
    };

    let fee = estimate_fee(body.to_bytes().len(), params.budget);
    let change = inputs_lovelace.checked_sub(fee).map_err(|_| {
        TxBuildError::FeeExceedsInputs {
            fee,
            inputs: inputs_lovelace,
        }
    })?;

    body.fee = fee;
    body.outputs
        .extend(change_outputs(change, params.change_address));
    Ok(body)
}

/// The two-pass budget estimation: build the transaction with the
/// worst-case budget, dry-run it against the ledger, then rebuild with the
/// component-wise maximum of the reported budgets.
pub async fn build_with_estimated_budget<C, F>(
    chain: &C,
    build: F,
) -> Result<TxBody, TxBuildError>
where
    C: ChainClient + ?Sized,
    F: Fn(ExUnits) -> Result<TxBody, TxBuildError>,
{
    let draft = build(WORST_CASE_EX_UNITS)?;
    let evaluations =
        chain.evaluate(&draft.to_bytes()).await.map_err(|e| match e {
            ChainError::Invalid(_) => TxBuildError::Evaluation(e),
            other => TxBuildError::Chain(other),
        })?;

    // An empty evaluation (no script inputs) keeps the draft's budget.
    let budget = match evaluations.len() {
        0 => return Ok(draft),
        _ => evaluations
            .into_iter()
            .fold(ExUnits { mem: 0, steps: 0 }, ExUnits::max),
    };
    build(budget)
}

// --- Internal helpers --- //

fn sum_lovelace(utxos: &[Utxo]) -> Result<Amount, TxBuildError> {
    utxos.iter().try_fold(Amount::ZERO, |acc, u| {
        acc.checked_add(u.lovelace())
            .map_err(|_| TxBuildError::Overflow)
    })
}

fn check_collateral(collateral: &Utxo) -> Result<(), TxBuildError> {
    if collateral.lovelace() < TOTAL_COLLATERAL {
        return Err(TxBuildError::InsufficientCollateral);
    }
    Ok(())
}

/// Anything above the fixed total collateral flows back to its own address.
fn collateral_return_output(
    collateral: &Utxo,
) -> Result<Option<TxOutput>, TxBuildError> {
    let excess = collateral
        .lovelace()
        .checked_sub(TOTAL_COLLATERAL)
        .map_err(|_| TxBuildError::InsufficientCollateral)?;
    if excess == Amount::ZERO {
        return Ok(None);
    }
    Ok(Some(TxOutput {
        address: collateral.address.clone(),
        value: Funds(vec![AssetAmount::lovelace(excess)]),
        datum: None,
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    fn utxo(tx_byte: u8, index: u32, lovelace: i64) -> Utxo {
        Utxo {
            outpoint: OutPoint {
                tx_hash: TxHash::new([tx_byte; 32]),
                index,
            },
            address: Address::new(format!("addr1wallet{tx_byte}")).unwrap(),
            value: Funds(vec![AssetAmount::lovelace(
                Amount::try_from_i64(lovelace).unwrap(),
            )]),
            datum: None,
        }
    }

    fn script_utxo(lovelace: i64) -> Utxo {
        Utxo {
            datum: Some(PlutusData::constr(0, vec![])),
            address: Address::new("script1abc".to_owned()).unwrap(),
            ..utxo(0xee, 0, lovelace)
        }
    }

    #[test]
    fn selection_prefers_large_utxos_and_stops_at_target() {
        let utxos = vec![
            utxo(1, 0, 6_000_000),
            utxo(2, 0, 80_000_000),
            utxo(3, 0, 7_000_000),
            utxo(4, 0, 9_000_000),
            utxo(5, 0, 8_000_000),
        ];
        // A small target takes only the largest UTXO.
        let selected =
            select_fee_utxos(&utxos, Amount::try_from_i64(2_000_000).unwrap())
                .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].lovelace().to_i64(), 80_000_000);

        // A large target accumulates high-lovelace UTXOs, capped at four.
        let selected = select_fee_utxos(
            &utxos,
            Amount::try_from_i64(200_000_000).unwrap(),
        )
        .unwrap();
        assert_eq!(selected.len(), MAX_FEE_UTXOS);
        assert!(selected.iter().all(|u| u.lovelace().to_i64() > 6_000_000));
    }

    #[test]
    fn selection_requires_one_large_utxo() {
        let utxos = vec![utxo(1, 0, 4_999_999), utxo(2, 0, 1_000_000)];
        assert!(matches!(
            select_fee_utxos(&utxos, Amount::try_from_i64(1).unwrap()),
            Err(TxBuildError::InsufficientFunds)
        ));
    }

    #[test]
    fn interact_preserves_script_value() {
        let source = script_utxo(12_000_000);
        let collateral = utxo(0xcc, 0, 5_000_000);
        let wallet = vec![utxo(1, 0, 50_000_000)];
        let script_address = Address::new("script1abc".to_owned()).unwrap();
        let change_address = Address::new("addr1wallet1".to_owned()).unwrap();

        let body = interact(InteractParams {
            redeemer: Redeemer::RequestRefund,
            source_utxo: &source,
            collateral_utxo: &collateral,
            wallet_utxos: &wallet,
            new_datum: PlutusData::constr(0, vec![]),
            script_address: &script_address,
            change_address: &change_address,
            required_signer: Vkey::new([9; 28]),
            window: ValidityWindow {
                invalid_before: 100,
                invalid_after: 500,
            },
            budget: WORST_CASE_EX_UNITS,
        })
        .unwrap();

        // Script input first, fee inputs after.
        assert_eq!(body.inputs[0], source.outpoint);
        // The re-emitted escrow output carries the same value.
        assert_eq!(body.outputs[0].value, source.value);
        assert_eq!(body.outputs[0].address, script_address);
        assert!(body.outputs[0].datum.is_some());
        // Fee + change balance the wallet inputs; large change splits off a
        // collateral-sized output.
        let change = body.outputs[1..]
            .iter()
            .fold(Amount::ZERO, |acc, out| acc + out.value.total_lovelace());
        assert_eq!(change + body.fee, Amount::try_from_i64(50_000_000).unwrap());
        assert_eq!(
            body.outputs.last().unwrap().value.total_lovelace().to_i64(),
            5_000_000
        );
        // Collateral bookkeeping.
        assert_eq!(body.total_collateral, TOTAL_COLLATERAL);
        assert_eq!(
            body.collateral_return.as_ref().unwrap().value.total_lovelace(),
            Amount::try_from_i64(2_000_000).unwrap()
        );
    }

    #[test]
    fn withdraw_emits_fee_output_with_provenance() {
        let source = script_utxo(100_000_000);
        let collateral = utxo(0xcc, 0, 3_000_000);
        let wallet = vec![utxo(1, 0, 20_000_000)];
        let change_address = Address::new("addr1wallet1".to_owned()).unwrap();

        let body = withdraw(WithdrawParams {
            redeemer: Redeemer::CollectCompleted,
            source_utxo: &source,
            collateral_utxo: &collateral,
            wallet_utxos: &wallet,
            collection: (
                Address::new("addr1collect".to_owned()).unwrap(),
                Funds(vec![AssetAmount::lovelace(
                    Amount::try_from_i64(95_000_000).unwrap(),
                )]),
            ),
            service_fee: Some((
                Address::new("addr1feerecv".to_owned()).unwrap(),
                Funds(vec![AssetAmount::lovelace(
                    Amount::try_from_i64(5_000_000).unwrap(),
                )]),
            )),
            escrow_collateral_return: None,
            change_address: &change_address,
            required_signer: Vkey::new([9; 28]),
            window: ValidityWindow {
                invalid_before: 100,
                invalid_after: 500,
            },
            budget: WORST_CASE_EX_UNITS,
        })
        .unwrap();

        let fee_output = &body.outputs[1];
        let datum = fee_output.datum.as_ref().unwrap();
        let (0, fields) = datum.as_constr().unwrap() else {
            panic!("provenance datum must be constr 0");
        };
        assert_eq!(
            fields[0].as_bytes().unwrap(),
            source.outpoint.tx_hash.as_bytes()
        );
        assert_eq!(fields[1].as_int().unwrap(), 0);
        // An exactly-sized collateral UTXO produces no collateral return.
        assert!(body.collateral_return.is_none());
    }

    #[test]
    fn undersized_collateral_is_rejected() {
        let source = script_utxo(10_000_000);
        let collateral = utxo(0xcc, 0, 2_999_999);
        let wallet = vec![utxo(1, 0, 20_000_000)];
        let change_address = Address::new("addr1wallet1".to_owned()).unwrap();

        let result = interact(InteractParams {
            redeemer: Redeemer::CancelRefund,
            source_utxo: &source,
            collateral_utxo: &collateral,
            wallet_utxos: &wallet,
            new_datum: PlutusData::constr(0, vec![]),
            script_address: &source.address,
            change_address: &change_address,
            required_signer: Vkey::new([9; 28]),
            window: ValidityWindow {
                invalid_before: 0,
                invalid_after: 1,
            },
            budget: WORST_CASE_EX_UNITS,
        });
        assert!(matches!(
            result,
            Err(TxBuildError::InsufficientCollateral)
        ));
    }

    #[test]
    fn body_hash_is_stable() {
        let wallet = vec![utxo(1, 0, 50_000_000)];
        let change_address = Address::new("addr1wallet1".to_owned()).unwrap();
        let script_address = Address::new("script1abc".to_owned()).unwrap();
        let build = || {
            lock(LockParams {
                wallet_utxos: &wallet,
                locked_value: Funds(vec![AssetAmount::lovelace(
                    Amount::try_from_i64(8_000_000).unwrap(),
                )]),
                datum: PlutusData::constr(0, vec![PlutusData::Int(1)]),
                script_address: &script_address,
                change_address: &change_address,
                required_signer: Vkey::new([9; 28]),
                window: ValidityWindow {
                    invalid_before: 10,
                    invalid_after: 20,
                },
            })
            .unwrap()
        };
        assert_eq!(build().hash(), build().hash());
    }
}
