//! The [`ChainClient`] abstraction over the ledger indexer, plus the
//! production HTTP implementation.
//!
//! The engine only ever sees [`ChainError`]'s four-way classification:
//! transient failures are retried with backoff, `Invalid` parks the request,
//! and the rest surface as-is.

use std::time::Duration;

use async_trait::async_trait;
use escrow_core::{
    amount::{Amount, AssetAmount, AssetId, Funds},
    ids::{Address, TxHash},
    time::TimestampMs,
};
use escrow_hex::FromHex;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::plutus::PlutusData;

/// Per-call request timeout against the indexer.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A transaction output reference: `(tx_hash, output_index)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct OutPoint {
    pub tx_hash: TxHash,
    pub index: u32,
}

/// An unspent transaction output as reported by the indexer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub address: Address,
    pub value: Funds,
    /// The inline datum, if present and CBOR-decodable as `PlutusData`.
    pub datum: Option<PlutusData>,
}

impl Utxo {
    /// Total native coin in this output.
    pub fn lovelace(&self) -> Amount {
        self.value.total_lovelace()
    }
}

/// The chain tip as reported by the indexer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChainTip {
    pub slot: u64,
    pub time: TimestampMs,
}

/// Where a transaction was confirmed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockRef {
    pub height: u64,
    pub time: TimestampMs,
}

/// Execution budget for one script input: `(memory units, cpu steps)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExUnits {
    pub mem: u64,
    pub steps: u64,
}

impl ExUnits {
    /// Component-wise maximum; used to merge per-input evaluation results.
    pub fn max(self, other: Self) -> Self {
        Self {
            mem: self.mem.max(other.mem),
            steps: self.steps.max(other.steps),
        }
    }
}

/// Classified failures from the ledger indexer.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Network-level or rate-limit failure; safe to retry with backoff.
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    /// The queried entity does not exist (yet).
    #[error("not found: {0}")]
    NotFound(String),
    /// The ledger rejected the request as malformed or unexecutable.
    #[error("rejected by ledger: {0}")]
    Invalid(String),
    #[error("unknown chain error: {0}")]
    Unknown(String),
}

impl ChainError {
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }
}

/// Narrow interface to the underlying ledger. Implementations must be
/// thread-safe; the engine shares one client across all jobs.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    /// All UTXOs currently at `address`.
    async fn fetch_utxos(
        &self,
        address: &Address,
    ) -> Result<Vec<Utxo>, ChainError>;

    /// The outputs produced by a confirmed transaction.
    async fn fetch_utxos_of_tx(
        &self,
        tx_hash: &TxHash,
    ) -> Result<Vec<Utxo>, ChainError>;

    /// Dry-run a transaction, returning the execution budget per script
    /// input.
    async fn evaluate(&self, raw_tx: &[u8])
    -> Result<Vec<ExUnits>, ChainError>;

    /// Submit a signed transaction, returning its hash.
    async fn submit(&self, raw_tx: &[u8]) -> Result<TxHash, ChainError>;

    /// The current chain tip.
    async fn tip(&self) -> Result<ChainTip, ChainError>;

    /// Whether `tx_hash` is present in a confirmed block.
    async fn tx_confirmed(
        &self,
        tx_hash: &TxHash,
    ) -> Result<Option<BlockRef>, ChainError>;
}

// --- HTTP implementation --- //

/// A JSON indexer client. One instance per payment-source API key; the inner
/// [`reqwest::Client`] is cheap to clone and thread-safe.
#[derive(Clone)]
pub struct HttpChainClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpChainClient {
    pub fn new(base_url: String, api_key: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
    ) -> Result<T, ChainError> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "chain GET");
        let response = self
            .client
            .get(&url)
            .header("project_id", &self.api_key)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        read_json(response).await
    }

    async fn post_cbor<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: Vec<u8>,
    ) -> Result<T, ChainError> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, body_len = body.len(), "chain POST");
        let response = self
            .client
            .post(&url)
            .header("project_id", &self.api_key)
            .header("Content-Type", "application/cbor")
            .body(body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        read_json(response).await
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> Result<T, ChainError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| ChainError::Unknown(format!("bad response: {e}")));
    }

    let body = response.text().await.unwrap_or_default();
    let msg = format!("HTTP {status}: {body}");
    Err(match status.as_u16() {
        404 => ChainError::NotFound(msg),
        400 | 422 => ChainError::Invalid(msg),
        408 | 429 => ChainError::TransientNetwork(msg),
        s if s >= 500 => ChainError::TransientNetwork(msg),
        _ => ChainError::Unknown(msg),
    })
}

fn classify_reqwest_error(e: reqwest::Error) -> ChainError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        ChainError::TransientNetwork(e.to_string())
    } else {
        ChainError::Unknown(e.to_string())
    }
}

// --- Wire DTOs --- //

#[derive(Deserialize)]
struct UtxoDto {
    tx_hash: String,
    output_index: u32,
    address: String,
    amount: Vec<AssetAmountDto>,
    inline_datum: Option<String>,
}

#[derive(Deserialize)]
struct AssetAmountDto {
    unit: String,
    quantity: String,
}

#[derive(Deserialize)]
struct TipDto {
    slot: u64,
    /// Milliseconds since the unix epoch.
    time: i64,
}

#[derive(Deserialize)]
struct TxInfoDto {
    block_height: u64,
    block_time: i64,
}

#[derive(Deserialize)]
struct EvaluationDto {
    memory: u64,
    steps: u64,
}

impl UtxoDto {
    fn into_utxo(self) -> Result<Utxo, ChainError> {
        let tx_hash = self
            .tx_hash
            .parse::<TxHash>()
            .map_err(|e| ChainError::Unknown(format!("bad tx hash: {e}")))?;
        let address = Address::new(self.address)
            .map_err(|e| ChainError::Unknown(format!("bad address: {e}")))?;
        let value = self
            .amount
            .into_iter()
            .map(|aa| {
                let amount = aa.quantity.parse::<Amount>().map_err(|e| {
                    ChainError::Unknown(format!("bad quantity: {e}"))
                })?;
                Ok(AssetAmount {
                    unit: AssetId::new(aa.unit),
                    amount,
                })
            })
            .collect::<Result<Vec<_>, ChainError>>()?;

        // An undecodable datum is not an error: the UTXO is simply foreign.
        let datum = self
            .inline_datum
            .as_deref()
            .and_then(|hex| Vec::<u8>::from_hex(hex).ok())
            .and_then(|bytes| PlutusData::from_bytes(&bytes));

        Ok(Utxo {
            outpoint: OutPoint {
                tx_hash,
                index: self.output_index,
            },
            address,
            value: Funds(value),
            datum,
        })
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn fetch_utxos(
        &self,
        address: &Address,
    ) -> Result<Vec<Utxo>, ChainError> {
        let path = format!("/addresses/{address}/utxos");
        let dtos: Vec<UtxoDto> = match self.get_json(&path).await {
            // An address with no history reads as empty, not missing.
            Err(ChainError::NotFound(_)) => return Ok(Vec::new()),
            other => other?,
        };
        dtos.into_iter().map(UtxoDto::into_utxo).collect()
    }

    async fn fetch_utxos_of_tx(
        &self,
        tx_hash: &TxHash,
    ) -> Result<Vec<Utxo>, ChainError> {
        let path = format!("/txs/{tx_hash}/utxos");
        let dtos: Vec<UtxoDto> = self.get_json(&path).await?;
        dtos.into_iter().map(UtxoDto::into_utxo).collect()
    }

    async fn evaluate(
        &self,
        raw_tx: &[u8],
    ) -> Result<Vec<ExUnits>, ChainError> {
        let dtos: Vec<EvaluationDto> = self
            .post_cbor("/utils/txs/evaluate", raw_tx.to_vec())
            .await?;
        Ok(dtos
            .into_iter()
            .map(|dto| ExUnits {
                mem: dto.memory,
                steps: dto.steps,
            })
            .collect())
    }

    async fn submit(&self, raw_tx: &[u8]) -> Result<TxHash, ChainError> {
        let hash_hex: String =
            self.post_cbor("/tx/submit", raw_tx.to_vec()).await?;
        hash_hex.parse::<TxHash>().map_err(|e| {
            ChainError::Unknown(format!("bad submitted tx hash: {e}"))
        })
    }

    async fn tip(&self) -> Result<ChainTip, ChainError> {
        let dto: TipDto = self.get_json("/blocks/latest").await?;
        let time = TimestampMs::try_from_ms(dto.time)
            .map_err(|e| ChainError::Unknown(format!("bad tip time: {e}")))?;
        Ok(ChainTip {
            slot: dto.slot,
            time,
        })
    }

    async fn tx_confirmed(
        &self,
        tx_hash: &TxHash,
    ) -> Result<Option<BlockRef>, ChainError> {
        let path = format!("/txs/{tx_hash}");
        match self.get_json::<TxInfoDto>(&path).await {
            Ok(dto) => {
                let time = TimestampMs::try_from_ms(dto.block_time).map_err(
                    |e| ChainError::Unknown(format!("bad block time: {e}")),
                )?;
                Ok(Some(BlockRef {
                    height: dto.block_height,
                    time,
                }))
            }
            Err(ChainError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn utxo_dto_parses() {
        let dto = UtxoDto {
            tx_hash: "aa".repeat(32),
            output_index: 1,
            address: "addr1xyz".to_owned(),
            amount: vec![AssetAmountDto {
                unit: "lovelace".to_owned(),
                quantity: "5000000".to_owned(),
            }],
            inline_datum: None,
        };
        let utxo = dto.into_utxo().unwrap();
        assert_eq!(utxo.outpoint.index, 1);
        assert_eq!(utxo.lovelace().to_i64(), 5_000_000);
        assert_eq!(utxo.datum, None);
    }

    #[test]
    fn garbage_datum_reads_as_foreign() {
        let dto = UtxoDto {
            tx_hash: "bb".repeat(32),
            output_index: 0,
            address: "addr1xyz".to_owned(),
            amount: vec![],
            inline_datum: Some("zznothex".to_owned()),
        };
        assert_eq!(dto.into_utxo().unwrap().datum, None);
    }
}
