//! Client for an EVM JSON-RPC endpoint.
//!
//! Keys never leave the process: addresses are derived from the configured
//! mnemonic and transfers are signed locally as legacy transactions, so the
//! transaction hash is known before broadcast.  The same core backs the
//! plain account client and the ERC-20 token client.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{Address, Bytes, TxKind, B256, U256};
use alloy_signer::SignerSync;
use alloy_signer_local::{coins_bip39::English, MnemonicBuilder, PrivateKeySigner};
use alloy_sol_types::{sol, SolCall, SolEvent};
use async_trait::async_trait;
use num_bigint::BigUint;
use serde_json::{json, Value};
use tracing::*;

use cashier_primitives::Amount;

use crate::errors::{ClientError, ClientResult};
use crate::jsonrpc::JsonRpcClient;
use crate::traits::{AccountChainClient, ReadDepth, TokenChainClient, TokenTransfer, TxConfirmation};

sol! {
    function balanceOf(address owner) external view returns (uint256);
    function transfer(address to, uint256 value) external returns (bool);
    event Transfer(address indexed from, address indexed to, uint256 value);
}

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(3);
const RECEIPT_POLL_ATTEMPTS: u32 = 40;

#[derive(Debug, Clone)]
pub struct EvmConfig {
    pub rpc_url: String,
    pub mnemonic: String,
    /// Gas units budgeted for one transfer (plain value or token call).
    pub gas_units: u64,
    /// Fixed gas price in minimal units; queried from the node if absent.
    pub gas_price_wei: Option<Amount>,
}

pub struct EvmClient {
    rpc: JsonRpcClient,
    mnemonic: String,
    chain_id: u64,
    root: Address,
    root_str: String,
    gas_units: u64,
    gas_price_override: Option<Amount>,
}

impl EvmClient {
    /// Connects to the endpoint, probing the chain id and deriving the root
    /// (index 0) account.
    pub async fn connect(config: EvmConfig) -> ClientResult<Self> {
        let rpc = JsonRpcClient::new(config.rpc_url, "2.0", None)?;
        let chain_id = qty_u64(&rpc.call::<Value>("eth_chainId", json!([])).await?)?;
        let root = signer_at(&config.mnemonic, 0)?.address();
        debug!(%chain_id, %root, "connected EVM endpoint");
        Ok(Self {
            rpc,
            mnemonic: config.mnemonic,
            chain_id,
            root,
            root_str: root.to_string(),
            gas_units: config.gas_units,
            gas_price_override: config.gas_price_wei,
        })
    }

    async fn block_number(&self) -> ClientResult<u64> {
        qty_u64(&self.rpc.call::<Value>("eth_blockNumber", json!([])).await?)
    }

    async fn block_tag(&self, depth: ReadDepth) -> ClientResult<Value> {
        Ok(match depth {
            ReadDepth::Pending => json!("pending"),
            ReadDepth::Latest => json!("latest"),
            ReadDepth::Confirmed(n) => {
                let head = self.block_number().await?;
                json!(format!("0x{:x}", head.saturating_sub(n)))
            }
        })
    }

    async fn effective_gas_price(&self) -> ClientResult<u128> {
        let price = match &self.gas_price_override {
            Some(p) => p.clone(),
            None => qty_amount(&self.rpc.call::<Value>("eth_gasPrice", json!([])).await?)?,
        };
        amount_to_u128(&price)
    }

    /// Signs a legacy transaction at `index` and broadcasts it, returning
    /// the pre-computed hash.
    async fn submit_signed(
        &self,
        index: u32,
        to: Address,
        value: U256,
        input: Bytes,
    ) -> ClientResult<String> {
        let signer = signer_at(&self.mnemonic, index)?;
        let from = signer.address().to_string();
        let nonce = self.nonce(&from, ReadDepth::Pending).await?;
        let gas_price = self.effective_gas_price().await?;

        let tx = TxLegacy {
            chain_id: Some(self.chain_id),
            nonce,
            gas_price,
            gas_limit: self.gas_units.into(),
            to: TxKind::Call(to),
            value,
            input,
        };
        let sig = signer
            .sign_hash_sync(&tx.signature_hash())
            .map_err(|e| ClientError::Signer(e.to_string()))?;
        let signed = tx.into_signed(sig);
        let txid = signed.hash().to_string();
        let raw = TxEnvelope::Legacy(signed).encoded_2718();

        self.rpc
            .call::<Value>(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(raw))]),
            )
            .await?;
        Ok(txid)
    }

    async fn await_receipt(&self, txid: &str) -> ClientResult<(String, u64)> {
        for _ in 0..RECEIPT_POLL_ATTEMPTS {
            let receipt = self
                .rpc
                .call_opt::<Value>("eth_getTransactionReceipt", json!([txid]))
                .await?;
            if let Some(receipt) = receipt.filter(|r| !r.is_null()) {
                let status = receipt
                    .get("status")
                    .map(qty_u64)
                    .transpose()?
                    .unwrap_or(1);
                if status != 1 {
                    return Err(ClientError::Rpc {
                        code: 0,
                        message: format!("transaction {txid} reverted"),
                    });
                }
                let block_hash = receipt
                    .get("blockHash")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ClientError::Decode("receipt: missing blockHash".into()))?
                    .to_owned();
                let block_height = qty_u64(
                    receipt
                        .get("blockNumber")
                        .ok_or_else(|| ClientError::Decode("receipt: missing blockNumber".into()))?,
                )?;
                return Ok((block_hash, block_height));
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
        Err(ClientError::Transport(format!(
            "no receipt for {txid} after {RECEIPT_POLL_ATTEMPTS} polls"
        )))
    }

    async fn block_timestamp(&self, block_hash: &str) -> ClientResult<u64> {
        let block = self
            .rpc
            .call::<Value>("eth_getBlockByHash", json!([block_hash, false]))
            .await?;
        qty_u64(
            block
                .get("timestamp")
                .ok_or_else(|| ClientError::Decode("block: missing timestamp".into()))?,
        )
    }
}

#[async_trait]
impl AccountChainClient for EvmClient {
    fn root_address(&self) -> &str {
        &self.root_str
    }

    fn transfer_gas(&self) -> u64 {
        self.gas_units
    }

    fn derive_address(&self, index: u32) -> ClientResult<String> {
        Ok(signer_at(&self.mnemonic, index)?.address().to_string())
    }

    async fn balance(&self, address: &str, depth: ReadDepth) -> ClientResult<Amount> {
        let tag = self.block_tag(depth).await?;
        qty_amount(
            &self
                .rpc
                .call::<Value>("eth_getBalance", json!([address, tag]))
                .await?,
        )
    }

    async fn nonce(&self, address: &str, depth: ReadDepth) -> ClientResult<u64> {
        let tag = self.block_tag(depth).await?;
        qty_u64(
            &self
                .rpc
                .call::<Value>("eth_getTransactionCount", json!([address, tag]))
                .await?,
        )
    }

    async fn gas_price(&self) -> ClientResult<Amount> {
        let price = self.effective_gas_price().await?;
        Ok(Amount::from(BigUint::from(price)))
    }

    async fn sweep_to_root(&self, index: u32, value: &Amount) -> ClientResult<TxConfirmation> {
        let txid = self
            .submit_signed(index, self.root, amount_to_u256(value)?, Bytes::new())
            .await?;
        let (block_hash, block_height) = self.await_receipt(&txid).await?;
        let block_time = self.block_timestamp(&block_hash).await?;
        Ok(TxConfirmation {
            txid,
            block_hash,
            block_height,
            block_time,
        })
    }

    async fn pay_from_root(&self, to: &str, value: &Amount) -> ClientResult<String> {
        let dest = parse_address(to)?;
        self.submit_signed(0, dest, amount_to_u256(value)?, Bytes::new())
            .await
    }

    fn validate_address(&self, address: &str) -> bool {
        Address::from_str(address).is_ok()
    }
}

pub struct Erc20Client {
    evm: EvmClient,
    contract: Address,
}

impl Erc20Client {
    pub fn new(evm: EvmClient, contract_address: &str) -> ClientResult<Self> {
        let contract = parse_address(contract_address)?;
        Ok(Self { evm, contract })
    }
}

#[async_trait]
impl TokenChainClient for Erc20Client {
    fn root_address(&self) -> &str {
        &self.evm.root_str
    }

    async fn head_block(&self) -> ClientResult<u64> {
        self.evm.block_number().await
    }

    async fn incoming_transfers(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> ClientResult<Vec<TokenTransfer>> {
        let filter = json!([{
            "fromBlock": format!("0x{from_block:x}"),
            "toBlock": format!("0x{to_block:x}"),
            "address": self.contract.to_string(),
            "topics": [
                Transfer::SIGNATURE_HASH.to_string(),
                Value::Null,
                self.evm.root.into_word().to_string(),
            ],
        }]);
        let raw = self.evm.rpc.call::<Value>("eth_getLogs", filter).await?;
        let logs = raw
            .as_array()
            .ok_or_else(|| ClientError::Decode("eth_getLogs: not an array".into()))?;

        let mut timestamps: HashMap<String, u64> = HashMap::new();
        let mut out = Vec::with_capacity(logs.len());
        for log in logs {
            let topics = log
                .get("topics")
                .and_then(Value::as_array)
                .ok_or_else(|| ClientError::Decode("log: missing topics".into()))?;
            if topics.len() != 3 {
                continue;
            }
            let from = topic_address(&topics[1])?;
            let to = topic_address(&topics[2])?;
            let value = qty_amount(
                log.get("data")
                    .ok_or_else(|| ClientError::Decode("log: missing data".into()))?,
            )?;
            let txid = log
                .get("transactionHash")
                .and_then(Value::as_str)
                .ok_or_else(|| ClientError::Decode("log: missing transactionHash".into()))?
                .to_owned();
            let block_hash = log
                .get("blockHash")
                .and_then(Value::as_str)
                .ok_or_else(|| ClientError::Decode("log: missing blockHash".into()))?
                .to_owned();
            let block_height = qty_u64(
                log.get("blockNumber")
                    .ok_or_else(|| ClientError::Decode("log: missing blockNumber".into()))?,
            )?;
            let block_time = match timestamps.get(&block_hash) {
                Some(t) => *t,
                None => {
                    let t = self.evm.block_timestamp(&block_hash).await?;
                    timestamps.insert(block_hash.clone(), t);
                    t
                }
            };
            out.push(TokenTransfer {
                from: from.to_string(),
                to: to.to_string(),
                value,
                txid,
                block_hash,
                block_height,
                block_time,
            });
        }
        Ok(out)
    }

    async fn root_token_balance(&self) -> ClientResult<Amount> {
        let data = balanceOfCall {
            owner: self.evm.root,
        }
        .abi_encode();
        let raw = self
            .evm
            .rpc
            .call::<Value>(
                "eth_call",
                json!([{
                    "to": self.contract.to_string(),
                    "data": format!("0x{}", hex::encode(data)),
                }, "latest"]),
            )
            .await?;
        qty_amount(&raw)
    }

    async fn transfer_from_root(&self, to: &str, value: &Amount) -> ClientResult<String> {
        let dest = parse_address(to)?;
        let data = transferCall {
            to: dest,
            value: amount_to_u256(value)?,
        }
        .abi_encode();
        self.evm
            .submit_signed(0, self.contract, U256::ZERO, Bytes::from(data))
            .await
    }

    fn validate_address(&self, address: &str) -> bool {
        Address::from_str(address).is_ok()
    }
}

fn signer_at(mnemonic: &str, index: u32) -> ClientResult<PrivateKeySigner> {
    MnemonicBuilder::<English>::default()
        .phrase(mnemonic)
        .index(index)
        .map_err(|e| ClientError::Signer(e.to_string()))?
        .build()
        .map_err(|e| ClientError::Signer(e.to_string()))
}

fn parse_address(s: &str) -> ClientResult<Address> {
    Address::from_str(s).map_err(|e| ClientError::Decode(format!("bad address {s}: {e}")))
}

fn hex_digits(v: &Value) -> ClientResult<&str> {
    let s = v
        .as_str()
        .ok_or_else(|| ClientError::Decode(format!("expected hex quantity, got {v}")))?;
    Ok(s.strip_prefix("0x").unwrap_or(s))
}

fn qty_u64(v: &Value) -> ClientResult<u64> {
    let digits = hex_digits(v)?;
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16).map_err(|e| ClientError::Decode(format!("bad quantity {v}: {e}")))
}

fn qty_amount(v: &Value) -> ClientResult<Amount> {
    let digits = hex_digits(v)?;
    if digits.is_empty() {
        return Ok(Amount::zero());
    }
    let units = BigUint::parse_bytes(digits.as_bytes(), 16)
        .ok_or_else(|| ClientError::Decode(format!("bad quantity {v}")))?;
    Ok(Amount::from(units))
}

fn topic_address(v: &Value) -> ClientResult<Address> {
    let word = B256::from_str(
        v.as_str()
            .ok_or_else(|| ClientError::Decode("topic is not a string".into()))?,
    )
    .map_err(|e| ClientError::Decode(format!("bad topic: {e}")))?;
    Ok(Address::from_word(word))
}

fn amount_to_u256(a: &Amount) -> ClientResult<U256> {
    let bytes = a.as_biguint().to_bytes_be();
    if bytes.len() > 32 {
        return Err(ClientError::Decode(format!("amount {a} exceeds 256 bits")));
    }
    Ok(U256::from_be_slice(&bytes))
}

fn amount_to_u128(a: &Amount) -> ClientResult<u128> {
    u128::try_from(a.as_biguint().clone())
        .map_err(|_| ClientError::Decode(format!("amount {a} exceeds 128 bits")))
}
