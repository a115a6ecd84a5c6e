//! Client for a bitcoind-style wallet daemon.
//!
//! Addresses and txids stay opaque strings here; the daemon owns the keys
//! and validates destinations.  Amounts cross the wire as the daemon's
//! decimal notation and are converted at this boundary.

use std::num::NonZeroUsize;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::{json, Value};

use cashier_primitives::{Amount, RoundingMode};

use crate::errors::{ClientError, ClientResult};
use crate::jsonrpc::JsonRpcClient;
use crate::traits::{UtxoWalletClient, WalletTx};

/// Seconds a configured passphrase keeps the wallet unlocked per pass.
const UNLOCK_WINDOW_SECS: u64 = 30;

const HEADER_CACHE_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct BitcoindConfig {
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
    pub label: String,
    pub unlock_password: Option<String>,
    pub decimals: u8,
    pub rounding: RoundingMode,
}

pub struct BitcoindClient {
    rpc: JsonRpcClient,
    label: String,
    unlock_password: Option<String>,
    decimals: u8,
    rounding: RoundingMode,
    header_heights: Mutex<LruCache<String, u64>>,
}

impl BitcoindClient {
    pub fn new(config: BitcoindConfig) -> ClientResult<Self> {
        let rpc = JsonRpcClient::new(
            config.rpc_url,
            "1.0",
            Some((&config.rpc_user, &config.rpc_password)),
        )?;
        let cache_size = NonZeroUsize::new(HEADER_CACHE_SIZE).expect("nonzero cache size");
        Ok(Self {
            rpc,
            label: config.label,
            unlock_password: config.unlock_password,
            decimals: config.decimals,
            rounding: config.rounding,
            header_heights: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// Converts a daemon-side decimal amount (JSON number) to minimal
    /// units, dropping the sign: the journal reports debits negative.
    fn to_units(&self, v: &Value) -> ClientResult<Amount> {
        let raw = match v {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            other => return Err(ClientError::Decode(format!("non-numeric amount: {other}"))),
        };
        let unsigned = raw.strip_prefix('-').unwrap_or(&raw);
        Amount::parse_decimal(unsigned, self.decimals, self.rounding)
            .map_err(|e| ClientError::Decode(e.to_string()))
    }
}

#[async_trait]
impl UtxoWalletClient for BitcoindClient {
    async fn new_deposit_address(&self) -> ClientResult<String> {
        self.rpc
            .call::<String>("getnewaddress", json!([self.label]))
            .await
    }

    async fn wallet_transactions(&self, count: usize, skip: usize) -> ClientResult<Vec<WalletTx>> {
        let raw = self
            .rpc
            .call::<Value>("listtransactions", json!([self.label, count, skip]))
            .await?;
        let entries = raw
            .as_array()
            .ok_or_else(|| ClientError::Decode("listtransactions: not an array".into()))?;

        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let category = entry
                .get("category")
                .and_then(Value::as_str)
                .ok_or_else(|| ClientError::Decode("listtransactions: missing category".into()))?
                .to_owned();
            let txid = entry
                .get("txid")
                .and_then(Value::as_str)
                .ok_or_else(|| ClientError::Decode("listtransactions: missing txid".into()))?
                .to_owned();
            let amount = self.to_units(
                entry
                    .get("amount")
                    .ok_or_else(|| ClientError::Decode("listtransactions: missing amount".into()))?,
            )?;
            out.push(WalletTx {
                category,
                address: entry
                    .get("address")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                amount,
                confirmations: entry
                    .get("confirmations")
                    .and_then(Value::as_i64)
                    .unwrap_or(0),
                txid,
                vout: entry.get("vout").and_then(Value::as_u64).map(|v| v as u32),
                block_hash: entry
                    .get("blockhash")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                block_height: entry.get("blockheight").and_then(Value::as_u64),
                block_time: entry.get("blocktime").and_then(Value::as_u64),
            });
        }
        Ok(out)
    }

    async fn block_height(&self, block_hash: &str) -> ClientResult<u64> {
        if let Some(height) = self.header_heights.lock().get(block_hash) {
            return Ok(*height);
        }
        let header = self
            .rpc
            .call::<Value>("getblockheader", json!([block_hash, true]))
            .await?;
        let height = header
            .get("height")
            .and_then(Value::as_u64)
            .ok_or_else(|| ClientError::Decode("getblockheader: missing height".into()))?;
        self.header_heights.lock().put(block_hash.to_owned(), height);
        Ok(height)
    }

    async fn wallet_balance(&self) -> ClientResult<Amount> {
        let raw = self.rpc.call::<Value>("getbalance", json!([])).await?;
        self.to_units(&raw)
    }

    async fn validate_address(&self, address: &str) -> ClientResult<bool> {
        let raw = self
            .rpc
            .call::<Value>("validateaddress", json!([address]))
            .await?;
        Ok(raw.get("isvalid").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn send_to_address(&self, address: &str, amount: &Amount) -> ClientResult<String> {
        let decimal = amount.format_decimal(self.decimals);
        self.rpc
            .call::<String>("sendtoaddress", json!([address, decimal]))
            .await
    }

    async fn unlock_wallet(&self) -> ClientResult<()> {
        let Some(pass) = &self.unlock_password else {
            return Ok(());
        };
        self.rpc
            .call_opt::<Value>("walletpassphrase", json!([pass, UNLOCK_WINDOW_SECS]))
            .await?;
        Ok(())
    }
}
