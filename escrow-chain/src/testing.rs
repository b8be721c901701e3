//! Test support: a scriptable in-process ledger implementing
//! [`ChainClient`].
//!
//! [`MockChain`] accepts the transactions the engine submits, holds them in
//! a mempool until the test confirms them, and maintains a real UTXO set:
//! confirming a transaction consumes its inputs and materializes its
//! outputs. This lets scenario tests drive the full
//! select → build → submit → confirm → reconcile loop without a network.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use async_trait::async_trait;
use ciborium::value::Value;
use escrow_core::{
    amount::{Amount, AssetAmount, AssetId, Funds},
    ids::{Address, TxHash},
    time::TimestampMs,
};

use crate::{
    client::{
        BlockRef, ChainClient, ChainError, ChainTip, ExUnits, OutPoint, Utxo,
    },
    hash::blake2b_256,
    plutus::PlutusData,
    slots::SlotConfig,
};

#[derive(Default)]
struct Ledger {
    /// The confirmed UTXO set.
    utxos: HashMap<OutPoint, Utxo>,
    /// Submitted but unconfirmed transactions.
    mempool: HashMap<TxHash, ParsedTx>,
    confirmed: HashMap<TxHash, BlockRef>,
    height: u64,
    /// Budget(s) returned by `evaluate`. Defaults to one modest budget.
    evaluations: Option<Vec<ExUnits>>,
    /// Error every `submit` call returns, for failure-path tests.
    submit_failure: Option<fn() -> ChainError>,
    /// Error every `evaluate` call returns.
    evaluate_failure: Option<fn() -> ChainError>,
}

struct ParsedTx {
    inputs: Vec<OutPoint>,
    outputs: Vec<Utxo>,
}

/// A scriptable in-process ledger.
pub struct MockChain {
    ledger: Mutex<Ledger>,
    slot_config: SlotConfig,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            slot_config: SlotConfig::for_network(
                escrow_core::network::Network::Test,
            ),
        }
    }

    /// Materialize a UTXO out of thin air (wallet funding, pre-existing
    /// escrow state).
    pub fn seed_utxo(&self, utxo: Utxo) {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.utxos.insert(utxo.outpoint, utxo);
    }

    /// Convenience: seed a plain wallet UTXO holding `lovelace`.
    pub fn seed_wallet_utxo(
        &self,
        tx_byte: u8,
        index: u32,
        address: &Address,
        lovelace: i64,
    ) {
        self.seed_utxo(Utxo {
            outpoint: OutPoint {
                tx_hash: TxHash::new([tx_byte; 32]),
                index,
            },
            address: address.clone(),
            value: Funds(vec![AssetAmount::lovelace(
                Amount::try_from_i64(lovelace).unwrap(),
            )]),
            datum: None,
        });
    }

    /// All transaction hashes sitting in the mempool.
    pub fn mempool_hashes(&self) -> Vec<TxHash> {
        self.ledger.lock().unwrap().mempool.keys().copied().collect()
    }

    /// Confirm one mempool transaction: consume its inputs, materialize its
    /// outputs, and record the confirmation.
    pub fn confirm(&self, tx_hash: TxHash) {
        let mut ledger = self.ledger.lock().unwrap();
        let Some(tx) = ledger.mempool.remove(&tx_hash) else {
            panic!("{tx_hash} is not in the mempool");
        };
        for input in &tx.inputs {
            ledger.utxos.remove(input);
        }
        for output in tx.outputs {
            ledger.utxos.insert(output.outpoint, output);
        }
        ledger.height += 1;
        let height = ledger.height;
        ledger.confirmed.insert(tx_hash, BlockRef {
            height,
            time: TimestampMs::now(),
        });
    }

    /// Confirm everything in the mempool.
    pub fn confirm_all(&self) -> Vec<TxHash> {
        let hashes = self.mempool_hashes();
        for hash in &hashes {
            self.confirm(*hash);
        }
        hashes
    }

    /// Drop a mempool transaction without confirming it (scenario: the
    /// chain never picked it up).
    pub fn drop_from_mempool(&self, tx_hash: TxHash) {
        self.ledger.lock().unwrap().mempool.remove(&tx_hash);
    }

    /// Make every subsequent `submit` fail with `f()`.
    pub fn fail_submissions(&self, f: fn() -> ChainError) {
        self.ledger.lock().unwrap().submit_failure = Some(f);
    }

    /// Make every subsequent `evaluate` fail with `f()`.
    pub fn fail_evaluations(&self, f: fn() -> ChainError) {
        self.ledger.lock().unwrap().evaluate_failure = Some(f);
    }
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn fetch_utxos(
        &self,
        address: &Address,
    ) -> Result<Vec<Utxo>, ChainError> {
        let ledger = self.ledger.lock().unwrap();
        let mut utxos: Vec<Utxo> = ledger
            .utxos
            .values()
            .filter(|u| &u.address == address)
            .cloned()
            .collect();
        utxos.sort_by_key(|u| u.outpoint.index);
        Ok(utxos)
    }

    async fn fetch_utxos_of_tx(
        &self,
        tx_hash: &TxHash,
    ) -> Result<Vec<Utxo>, ChainError> {
        let ledger = self.ledger.lock().unwrap();
        if let Some(tx) = ledger.mempool.get(tx_hash) {
            return Ok(tx.outputs.clone());
        }
        if ledger.confirmed.contains_key(tx_hash) {
            // Outputs may be partially spent; return what survives plus
            // nothing for the spent ones. Confirmed-but-consumed outputs
            // are resolved by the address scan instead.
            return Ok(ledger
                .utxos
                .values()
                .filter(|u| &u.outpoint.tx_hash == tx_hash)
                .cloned()
                .collect());
        }
        Err(ChainError::NotFound(format!("tx {tx_hash}")))
    }

    async fn evaluate(
        &self,
        _raw_tx: &[u8],
    ) -> Result<Vec<ExUnits>, ChainError> {
        let ledger = self.ledger.lock().unwrap();
        if let Some(fail) = ledger.evaluate_failure {
            return Err(fail());
        }
        Ok(ledger.evaluations.clone().unwrap_or_else(|| {
            vec![ExUnits {
                mem: 500_000,
                steps: 200_000_000,
            }]
        }))
    }

    async fn submit(&self, raw_tx: &[u8]) -> Result<TxHash, ChainError> {
        let mut ledger = self.ledger.lock().unwrap();
        if let Some(fail) = ledger.submit_failure {
            return Err(fail());
        }
        let (tx_hash, parsed) = parse_raw_tx(raw_tx).ok_or_else(|| {
            ChainError::Invalid("unparseable transaction".to_owned())
        })?;
        ledger.mempool.insert(tx_hash, parsed);
        Ok(tx_hash)
    }

    async fn tip(&self) -> Result<ChainTip, ChainError> {
        let now = TimestampMs::now();
        Ok(ChainTip {
            slot: self.slot_config.slot_at(now),
            time: now,
        })
    }

    async fn tx_confirmed(
        &self,
        tx_hash: &TxHash,
    ) -> Result<Option<BlockRef>, ChainError> {
        Ok(self.ledger.lock().unwrap().confirmed.get(tx_hash).copied())
    }
}

/// Parse a signed transaction in this workspace's wire format back into its
/// inputs and outputs, returning its hash.
fn parse_raw_tx(raw_tx: &[u8]) -> Option<(TxHash, ParsedTx)> {
    let tx: Value = ciborium::de::from_reader(raw_tx).ok()?;
    let Value::Array(tx_parts) = tx else {
        return None;
    };
    let [body, _witnesses] = tx_parts.as_slice() else {
        return None;
    };

    // The transaction hash is the digest of the serialized body alone.
    let mut body_bytes = Vec::new();
    ciborium::ser::into_writer(body, &mut body_bytes).ok()?;
    let tx_hash = TxHash::new(blake2b_256(&body_bytes));

    let Value::Array(fields) = body else {
        return None;
    };
    let (Value::Array(inputs), Value::Array(outputs)) =
        (fields.first()?, fields.get(1)?)
    else {
        return None;
    };

    let inputs = inputs
        .iter()
        .map(parse_outpoint)
        .collect::<Option<Vec<_>>>()?;
    let outputs = outputs
        .iter()
        .enumerate()
        .map(|(index, output)| parse_output(tx_hash, index as u32, output))
        .collect::<Option<Vec<_>>>()?;

    Some((tx_hash, ParsedTx { inputs, outputs }))
}

fn parse_outpoint(value: &Value) -> Option<OutPoint> {
    let Value::Array(parts) = value else {
        return None;
    };
    let [Value::Bytes(hash), Value::Integer(index)] = parts.as_slice() else {
        return None;
    };
    Some(OutPoint {
        tx_hash: TxHash::new(hash.as_slice().try_into().ok()?),
        index: u32::try_from(*index).ok()?,
    })
}

fn parse_output(
    tx_hash: TxHash,
    index: u32,
    value: &Value,
) -> Option<Utxo> {
    let Value::Array(parts) = value else {
        return None;
    };
    let (Value::Text(address), Value::Array(funds)) =
        (parts.first()?, parts.get(1)?)
    else {
        return None;
    };

    let funds = funds
        .iter()
        .map(|entry| {
            let Value::Array(pair) = entry else {
                return None;
            };
            let [Value::Text(unit), Value::Integer(amount)] =
                pair.as_slice()
            else {
                return None;
            };
            Some(AssetAmount {
                unit: AssetId::new(unit.clone()),
                amount: Amount::try_from_i64(i64::try_from(*amount).ok()?)
                    .ok()?,
            })
        })
        .collect::<Option<Vec<_>>>()?;

    let datum = match parts.get(2) {
        Some(datum_value) => {
            let mut bytes = Vec::new();
            ciborium::ser::into_writer(datum_value, &mut bytes).ok()?;
            PlutusData::from_bytes(&bytes)
        }
        None => None,
    };

    Some(Utxo {
        outpoint: OutPoint { tx_hash, index },
        address: Address::new(address.clone()).ok()?,
        value: Funds(funds),
        datum,
    })
}

#[cfg(test)]
mod test {
    use escrow_core::ids::Vkey;

    use super::*;
    use crate::{
        slots::ValidityWindow,
        txbuild::{LockParams, lock},
    };

    #[tokio::test]
    async fn submit_confirm_updates_utxo_set() {
        let chain = MockChain::new();
        let wallet_address = Address::new("addr_test1w".to_owned()).unwrap();
        let script_address = Address::new("script_test1s".to_owned()).unwrap();
        chain.seed_wallet_utxo(1, 0, &wallet_address, 50_000_000);

        let wallet_utxos = chain.fetch_utxos(&wallet_address).await.unwrap();
        let body = lock(LockParams {
            wallet_utxos: &wallet_utxos,
            locked_value: Funds(vec![AssetAmount::lovelace(
                Amount::try_from_i64(7_000_000).unwrap(),
            )]),
            datum: PlutusData::constr(0, vec![PlutusData::Int(42)]),
            script_address: &script_address,
            change_address: &wallet_address,
            required_signer: Vkey::new([1; 28]),
            window: ValidityWindow {
                invalid_before: 0,
                invalid_after: 100,
            },
        })
        .unwrap();
        let signed = crate::txbuild::SignedTx {
            body,
            witnesses: vec![],
        };

        let tx_hash = chain.submit(&signed.to_bytes()).await.unwrap();
        assert_eq!(tx_hash, signed.hash());
        assert!(chain.tx_confirmed(&tx_hash).await.unwrap().is_none());

        chain.confirm(tx_hash);
        assert!(chain.tx_confirmed(&tx_hash).await.unwrap().is_some());

        // The wallet UTXO was spent; the script output exists with datum.
        assert!(chain.fetch_utxos(&wallet_address).await.unwrap().iter().all(
            |u| u.outpoint.tx_hash == tx_hash
        ));
        let script_utxos =
            chain.fetch_utxos(&script_address).await.unwrap();
        assert_eq!(script_utxos.len(), 1);
        assert_eq!(script_utxos[0].lovelace().to_i64(), 7_000_000);
        assert_eq!(
            script_utxos[0].datum,
            Some(PlutusData::constr(0, vec![PlutusData::Int(42)]))
        );
    }
}
