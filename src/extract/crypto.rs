//! Bitcoin transaction lookups
//!
//! The only non-browser engine: transaction detail and the BTC price quote
//! come straight from the mempool REST API, fetched concurrently and each
//! memoized for 30 s.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{ApiError, ApiResult};

use super::Extractors;
use super::types::BitcoinTransactionResponse;

const QUOTE_TTL: Duration = Duration::from_secs(30);
const SATS_PER_BTC: f64 = 100_000_000.0;

#[derive(Debug, Default, Deserialize)]
struct RawTx {
    txid: String,
    #[serde(default)]
    version: Option<i64>,
    #[serde(default)]
    locktime: Option<i64>,
    #[serde(default)]
    size: Option<i64>,
    #[serde(default)]
    weight: Option<i64>,
    #[serde(default)]
    fee: Option<i64>,
    #[serde(default)]
    status: RawTxStatus,
    #[serde(default)]
    vout: Vec<RawVout>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTxStatus {
    #[serde(default)]
    confirmed: Option<bool>,
    #[serde(default)]
    block_height: Option<i64>,
    #[serde(default)]
    block_time: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawVout {
    #[serde(default)]
    value: u64,
}

#[derive(Debug, Deserialize)]
struct RawPrices {
    #[serde(rename = "USD")]
    usd: f64,
}

fn map_tx(raw: RawTx) -> BitcoinTransactionResponse {
    let total_sats: u64 = raw.vout.iter().map(|v| v.value).sum();
    // vsize is weight/4; fee over vsize gives sat/vB
    let fee_rate = match (raw.fee, raw.weight) {
        (Some(fee), Some(weight)) if weight > 0 => Some(fee as f64 / (weight as f64 / 4.0)),
        _ => None,
    };
    BitcoinTransactionResponse {
        txid: raw.txid,
        confirmed: raw.status.confirmed,
        block_height: raw.status.block_height,
        block_time: raw.status.block_time,
        fee: raw.fee,
        fee_rate,
        size: raw.size,
        weight: raw.weight,
        version: raw.version,
        locktime: raw.locktime,
        total_value: Some(total_sats as f64 / SATS_PER_BTC),
        ..Default::default()
    }
}

fn validate_txid(txid: &str) -> ApiResult<()> {
    if txid.len() == 64 && txid.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(ApiError::Validation(
            "txid must be 64 hex characters".into(),
        ))
    }
}

impl Extractors {
    pub async fn crypto_transaction(
        &self,
        txid: &str,
    ) -> ApiResult<BitcoinTransactionResponse> {
        validate_txid(txid)?;
        let (tx, price, tip) =
            tokio::join!(self.mempool_tx(txid), self.btc_price(), self.tip_height());
        let mut tx = tx?.ok_or_else(|| ApiError::NotFound("Transaction not found".into()))?;
        let price = price?;
        tx.current_btc_market_rate = Some(price);
        tx.usd_value = tx.total_value.map(|btc| btc * price);
        // Confirmation depth is best-effort; the lookup still answers when
        // the tip endpoint is down.
        match tip {
            Ok(tip) if tx.confirmed == Some(true) => {
                tx.confirmations = tx.block_height.map(|height| tip - height + 1);
            }
            Ok(_) => {}
            Err(e) => warn!("tip height unavailable: {e}"),
        }
        tx.updated_at = Some(chrono::Utc::now().timestamp());
        Ok(tx)
    }

    async fn tip_height(&self) -> ApiResult<i64> {
        self.memo
            .get_or_compute("btc_tip_height", &(), QUOTE_TTL, || async {
                let body = self
                    .http
                    .get(format!("{}/blocks/tip/height", self.mempool_base))
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?;
                let height = body.trim().parse::<i64>().map_err(|_| {
                    ApiError::upstream(502, format!("unparseable tip height {body:?}"))
                })?;
                Ok(Some(height))
            })
            .await?
            .ok_or_else(|| ApiError::Upstream {
                status: 502,
                detail: "no tip height available".into(),
            })
    }

    async fn mempool_tx(&self, txid: &str) -> ApiResult<Option<BitcoinTransactionResponse>> {
        self.memo
            .get_or_compute("mempool_tx", &txid, QUOTE_TTL, || async {
                let resp = self
                    .http
                    .get(format!("{}/tx/{txid}", self.mempool_base))
                    .send()
                    .await?;
                if resp.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                let raw: RawTx = resp.error_for_status()?.json().await?;
                Ok(Some(map_tx(raw)))
            })
            .await
    }

    async fn btc_price(&self) -> ApiResult<f64> {
        self.memo
            .get_or_compute("btc_price", &(), QUOTE_TTL, || async {
                let prices: RawPrices = self
                    .http
                    .get(format!("{}/v1/prices", self.mempool_base))
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                Ok(Some(prices.usd))
            })
            .await?
            .ok_or_else(|| ApiError::Upstream {
                status: 502,
                detail: "no BTC price quote available".into(),
            })
    }
}
