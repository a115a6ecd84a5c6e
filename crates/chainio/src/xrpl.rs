//! Client for an XRPL (rippled) server.
//!
//! Uses the server's sign-and-submit mode: payments are signed server-side
//! with the configured passphrase, so no ledger-specific cryptography lives
//! in this process.

use async_trait::async_trait;
use serde_json::{json, Value};

use cashier_primitives::Amount;

use crate::errors::{ClientError, ClientResult};
use crate::traits::{LedgerTxInfo, LedgerTxPage, TagLedgerClient};

/// Offset from the ledger's epoch (2000-01-01) to the unix epoch.
const LEDGER_EPOCH_OFFSET: u64 = 946_684_800;

const PAGE_LIMIT: u64 = 10;

const BASE58_ALPHABET: &str = "rpshnaf39wBUDNEGHJKLM4PQRST7VWXYZ2bcdeCg65jkm8oFqi1tuvAxyz";

#[derive(Debug, Clone)]
pub struct XrplConfig {
    pub rpc_url: String,
    pub passphrase: String,
    pub root_address: String,
}

pub struct XrplClient {
    http: reqwest::Client,
    url: String,
    passphrase: String,
    root: String,
}

impl XrplClient {
    pub fn new(config: XrplConfig) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            url: config.rpc_url,
            passphrase: config.passphrase,
            root: config.root_address,
        })
    }

    /// The server wraps both transport-level success and command errors in
    /// a `result` object carrying a `status` field.
    async fn call(&self, method: &str, params: Value) -> ClientResult<Value> {
        let body = json!({ "method": method, "params": [params] });
        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let v: Value = resp
            .json()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let result = v
            .get("result")
            .cloned()
            .ok_or_else(|| ClientError::Decode(format!("{method}: missing result")))?;
        if result.get("status").and_then(Value::as_str) == Some("error") {
            let code = result.get("error_code").and_then(Value::as_i64).unwrap_or(-1);
            let message = result
                .get("error_message")
                .or_else(|| result.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("server error")
                .to_owned();
            return Err(ClientError::Rpc { code, message });
        }
        Ok(result)
    }
}

#[async_trait]
impl TagLedgerClient for XrplClient {
    fn root_address(&self) -> &str {
        &self.root
    }

    async fn account_transactions(
        &self,
        marker: Option<Value>,
    ) -> ClientResult<LedgerTxPage> {
        let mut params = json!({
            "account": self.root,
            "binary": false,
            "forward": false,
            "limit": PAGE_LIMIT,
            "ledger_index_min": -1,
            "ledger_index_max": -1,
        });
        if let Some(marker) = marker {
            params["marker"] = marker;
        }
        let result = self.call("account_tx", params).await?;

        let entries = result
            .get("transactions")
            .and_then(Value::as_array)
            .ok_or_else(|| ClientError::Decode("account_tx: missing transactions".into()))?;
        let mut txs = Vec::with_capacity(entries.len());
        for entry in entries {
            txs.push(parse_account_tx(entry)?);
        }
        Ok(LedgerTxPage {
            txs,
            marker: result.get("marker").filter(|m| !m.is_null()).cloned(),
        })
    }

    async fn root_balance(&self) -> ClientResult<Amount> {
        let result = self
            .call(
                "account_info",
                json!({ "account": self.root, "ledger_index": "validated" }),
            )
            .await?;
        let balance = result
            .pointer("/account_data/Balance")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Decode("account_info: missing Balance".into()))?;
        Amount::from_dec_str(balance).map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn submit_payment(
        &self,
        to: &str,
        value: &Amount,
        tag: Option<u64>,
    ) -> ClientResult<String> {
        let mut tx_json = json!({
            "TransactionType": "Payment",
            "Account": self.root,
            "Destination": to,
            "Amount": value.to_string(),
        });
        if let Some(tag) = tag {
            tx_json["DestinationTag"] = json!(tag);
        }
        let result = self
            .call(
                "submit",
                json!({ "secret": self.passphrase, "tx_json": tx_json }),
            )
            .await?;

        let engine_result = result
            .get("engine_result")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Decode("submit: missing engine_result".into()))?;
        if engine_result != "tesSUCCESS" {
            return Err(ClientError::Rpc {
                code: result
                    .get("engine_result_code")
                    .and_then(Value::as_i64)
                    .unwrap_or(-1),
                message: engine_result.to_owned(),
            });
        }
        result
            .pointer("/tx_json/hash")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| ClientError::Decode("submit: missing tx hash".into()))
    }

    fn validate_address(&self, address: &str) -> bool {
        address.starts_with('r')
            && (25..=35).contains(&address.len())
            && address.chars().all(|c| BASE58_ALPHABET.contains(c))
    }
}

fn parse_account_tx(entry: &Value) -> ClientResult<LedgerTxInfo> {
    let tx = entry
        .get("tx")
        .ok_or_else(|| ClientError::Decode("account_tx: entry missing tx".into()))?;
    let meta = entry
        .get("meta")
        .ok_or_else(|| ClientError::Decode("account_tx: entry missing meta".into()))?;

    let txid = tx
        .get("hash")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::Decode("account_tx: missing hash".into()))?
        .to_owned();
    let ledger_index = tx
        .get("ledger_index")
        .and_then(Value::as_u64)
        .ok_or_else(|| ClientError::Decode("account_tx: missing ledger_index".into()))?;

    let is_payment = tx.get("TransactionType").and_then(Value::as_str) == Some("Payment");
    let success = meta.get("TransactionResult").and_then(Value::as_str) == Some("tesSUCCESS");

    // Only a string delivered_amount is the native currency; issued
    // currencies come back as objects and are not ours to credit.
    let delivered_amount = meta
        .get("delivered_amount")
        .and_then(Value::as_str)
        .and_then(|s| Amount::from_dec_str(s).ok());

    let credited = meta
        .get("AffectedNodes")
        .and_then(Value::as_array)
        .and_then(|nodes| nodes.last())
        .and_then(|node| node.get("ModifiedNode"))
        .and_then(|modified| modified.get("LedgerEntryType"))
        .and_then(Value::as_str)
        == Some("AccountRoot");

    Ok(LedgerTxInfo {
        validated: entry.get("validated").and_then(Value::as_bool).unwrap_or(false),
        success: success && is_payment,
        destination: tx
            .get("Destination")
            .and_then(Value::as_str)
            .map(str::to_owned),
        destination_tag: tx.get("DestinationTag").and_then(Value::as_u64),
        delivered_amount,
        credited,
        ledger_index,
        ledger_hash: tx
            .get("ledger_hash")
            .or_else(|| entry.get("ledger_hash"))
            .and_then(Value::as_str)
            .map(str::to_owned),
        txid,
        close_time: tx
            .get("date")
            .and_then(Value::as_u64)
            .map(|d| d + LEDGER_EPOCH_OFFSET)
            .unwrap_or(0),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_a_validated_payment() {
        let entry = json!({
            "validated": true,
            "tx": {
                "TransactionType": "Payment",
                "Destination": "rRootAddress",
                "DestinationTag": 1,
                "hash": "ABC123",
                "ledger_index": 7_500_000,
                "date": 100,
            },
            "meta": {
                "TransactionResult": "tesSUCCESS",
                "delivered_amount": "10000000",
                "AffectedNodes": [
                    { "CreatedNode": { "LedgerEntryType": "DirectoryNode" } },
                    { "ModifiedNode": { "LedgerEntryType": "AccountRoot" } }
                ],
            },
        });
        let info = parse_account_tx(&entry).unwrap();
        assert!(info.validated && info.success && info.credited);
        assert_eq!(info.destination_tag, Some(1));
        assert_eq!(info.delivered_amount, Some(Amount::from_u64(10_000_000)));
        assert_eq!(info.close_time, 100 + LEDGER_EPOCH_OFFSET);
    }

    #[test]
    fn issued_currency_and_failed_results_are_filtered() {
        let entry = json!({
            "validated": true,
            "tx": {
                "TransactionType": "Payment",
                "Destination": "rRootAddress",
                "hash": "DEF456",
                "ledger_index": 7_500_001,
            },
            "meta": {
                "TransactionResult": "tecPATH_DRY",
                "delivered_amount": { "currency": "USD", "value": "1" },
                "AffectedNodes": [],
            },
        });
        let info = parse_account_tx(&entry).unwrap();
        assert!(!info.success);
        assert!(!info.credited);
        assert_eq!(info.delivered_amount, None);
    }

    #[test]
    fn address_format_check() {
        let client = XrplClient::new(XrplConfig {
            rpc_url: "http://localhost:5005".into(),
            passphrase: "s".into(),
            root_address: "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh".into(),
        })
        .unwrap();
        assert!(client.validate_address("rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh"));
        assert!(!client.validate_address("xHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh"));
        assert!(!client.validate_address("r0"));
        assert!(!client.validate_address("rHb9CJAWyB4rj91VRWn96DkukG4bwdtyT0"));
    }
}
