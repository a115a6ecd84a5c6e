//! Stateful in-memory clients used by engine and scheduler tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use cashier_primitives::Amount;

use crate::errors::{ClientError, ClientResult};
use crate::traits::{
    AccountChainClient, LedgerTxInfo, LedgerTxPage, ReadDepth, TagLedgerClient, TokenChainClient,
    TokenTransfer, TxConfirmation, UtxoWalletClient, WalletTx,
};

#[derive(Default)]
pub struct TestUtxoClient {
    /// Wallet journal in daemon order (oldest first).
    pub txs: Mutex<Vec<WalletTx>>,
    pub balance: Mutex<Amount>,
    pub heights: Mutex<HashMap<String, u64>>,
    pub invalid_addresses: Mutex<HashSet<String>>,
    pub fail_send: Mutex<Option<ClientError>>,
    pub sent: Mutex<Vec<(String, Amount)>>,
    pub unlocks: AtomicU32,
    next_address: AtomicU32,
}

impl TestUtxoClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_receive(&self, address: &str, amount: Amount, confirmations: i64, txid: &str) {
        self.txs.lock().push(WalletTx {
            category: "receive".into(),
            address: Some(address.to_owned()),
            amount,
            confirmations,
            txid: txid.to_owned(),
            vout: Some(0),
            block_hash: Some(format!("blk-{txid}")),
            block_height: Some(100),
            block_time: Some(1_700_000_000),
        });
    }
}

#[async_trait]
impl UtxoWalletClient for TestUtxoClient {
    async fn new_deposit_address(&self) -> ClientResult<String> {
        let n = self.next_address.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("addr{n}"))
    }

    async fn wallet_transactions(&self, count: usize, skip: usize) -> ClientResult<Vec<WalletTx>> {
        let txs = self.txs.lock();
        Ok(txs.iter().skip(skip).take(count).cloned().collect())
    }

    async fn block_height(&self, block_hash: &str) -> ClientResult<u64> {
        self.heights
            .lock()
            .get(block_hash)
            .copied()
            .ok_or_else(|| ClientError::Decode(format!("unknown block {block_hash}")))
    }

    async fn wallet_balance(&self) -> ClientResult<Amount> {
        Ok(self.balance.lock().clone())
    }

    async fn validate_address(&self, address: &str) -> ClientResult<bool> {
        Ok(!self.invalid_addresses.lock().contains(address))
    }

    async fn send_to_address(&self, address: &str, amount: &Amount) -> ClientResult<String> {
        if let Some(err) = self.fail_send.lock().clone() {
            return Err(err);
        }
        let mut sent = self.sent.lock();
        sent.push((address.to_owned(), amount.clone()));
        Ok(format!("sent{}", sent.len()))
    }

    async fn unlock_wallet(&self) -> ClientResult<()> {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Balance of one derived account at the three read depths.
#[derive(Debug, Clone, Default)]
pub struct BalancePoints {
    pub pending: Amount,
    pub latest: Amount,
    pub confirmed: Amount,
}

impl BalancePoints {
    pub fn settled(v: Amount) -> Self {
        Self {
            pending: v.clone(),
            latest: v.clone(),
            confirmed: v,
        }
    }
}

pub struct TestAccountClient {
    pub root: String,
    pub gas_units: u64,
    pub gas_price: Mutex<Amount>,
    /// Balances per address (`hd<i>` for derived accounts, plus the root).
    pub balances: Mutex<HashMap<String, BalancePoints>>,
    /// (pending, latest) nonce of the root account.
    pub nonces: Mutex<(u64, u64)>,
    pub sweeps: Mutex<Vec<(u32, Amount)>>,
    pub payments: Mutex<Vec<(String, Amount)>>,
    pub fail_payment: Mutex<Option<ClientError>>,
    /// Overrides the deterministic `hd<i>` derivation for one index, to
    /// exercise the stored-address sanity check.
    pub derivation_override: Mutex<Option<(u32, String)>>,
    next_height: AtomicU64,
}

impl TestAccountClient {
    pub fn new() -> Self {
        Self {
            root: "hd0".to_owned(),
            gas_units: 21_000,
            gas_price: Mutex::new(Amount::zero()),
            balances: Mutex::new(HashMap::new()),
            nonces: Mutex::new((0, 0)),
            sweeps: Mutex::new(Vec::new()),
            payments: Mutex::new(Vec::new()),
            fail_payment: Mutex::new(None),
            derivation_override: Mutex::new(None),
            next_height: AtomicU64::new(500),
        }
    }
}

impl Default for TestAccountClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountChainClient for TestAccountClient {
    fn root_address(&self) -> &str {
        &self.root
    }

    fn transfer_gas(&self) -> u64 {
        self.gas_units
    }

    fn derive_address(&self, index: u32) -> ClientResult<String> {
        if let Some((at, addr)) = self.derivation_override.lock().clone() {
            if at == index {
                return Ok(addr);
            }
        }
        Ok(format!("hd{index}"))
    }

    async fn balance(&self, address: &str, depth: ReadDepth) -> ClientResult<Amount> {
        let balances = self.balances.lock();
        let points = balances.get(address).cloned().unwrap_or_default();
        Ok(match depth {
            ReadDepth::Pending => points.pending,
            ReadDepth::Latest => points.latest,
            ReadDepth::Confirmed(_) => points.confirmed,
        })
    }

    async fn nonce(&self, _address: &str, depth: ReadDepth) -> ClientResult<u64> {
        let (pending, latest) = *self.nonces.lock();
        Ok(match depth {
            ReadDepth::Pending => pending,
            _ => latest,
        })
    }

    async fn gas_price(&self) -> ClientResult<Amount> {
        Ok(self.gas_price.lock().clone())
    }

    async fn sweep_to_root(&self, index: u32, value: &Amount) -> ClientResult<TxConfirmation> {
        let mut sweeps = self.sweeps.lock();
        sweeps.push((index, value.clone()));
        let height = self.next_height.fetch_add(1, Ordering::SeqCst);
        Ok(TxConfirmation {
            txid: format!("sweep{}", sweeps.len()),
            block_hash: format!("blk{height}"),
            block_height: height,
            block_time: 1_700_000_000 + height,
        })
    }

    async fn pay_from_root(&self, to: &str, value: &Amount) -> ClientResult<String> {
        if let Some(err) = self.fail_payment.lock().clone() {
            return Err(err);
        }
        let mut payments = self.payments.lock();
        payments.push((to.to_owned(), value.clone()));
        Ok(format!("pay{}", payments.len()))
    }

    fn validate_address(&self, address: &str) -> bool {
        !address.is_empty()
    }
}

#[derive(Default)]
pub struct TestTokenClient {
    pub root: String,
    pub head: AtomicU64,
    /// All known transfers to the root, by block height ascending.
    pub transfers: Mutex<Vec<TokenTransfer>>,
    pub balance: Mutex<Amount>,
    pub outgoing: Mutex<Vec<(String, Amount)>>,
    pub fail_transfer: Mutex<Option<ClientError>>,
}

impl TestTokenClient {
    pub fn new() -> Self {
        Self {
            root: "root".to_owned(),
            ..Self::default()
        }
    }

    pub fn push_incoming(&self, value: Amount, height: u64, txid: &str) {
        self.transfers.lock().push(TokenTransfer {
            from: "sender".into(),
            to: self.root.clone(),
            value,
            txid: txid.to_owned(),
            block_hash: format!("blk{height}"),
            block_height: height,
            block_time: 1_700_000_000 + height,
        });
    }
}

#[async_trait]
impl TokenChainClient for TestTokenClient {
    fn root_address(&self) -> &str {
        &self.root
    }

    async fn head_block(&self) -> ClientResult<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn incoming_transfers(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> ClientResult<Vec<TokenTransfer>> {
        Ok(self
            .transfers
            .lock()
            .iter()
            .filter(|t| t.block_height >= from_block && t.block_height <= to_block)
            .cloned()
            .collect())
    }

    async fn root_token_balance(&self) -> ClientResult<Amount> {
        Ok(self.balance.lock().clone())
    }

    async fn transfer_from_root(&self, to: &str, value: &Amount) -> ClientResult<String> {
        if let Some(err) = self.fail_transfer.lock().clone() {
            return Err(err);
        }
        let mut outgoing = self.outgoing.lock();
        outgoing.push((to.to_owned(), value.clone()));
        Ok(format!("tok{}", outgoing.len()))
    }

    fn validate_address(&self, address: &str) -> bool {
        !address.is_empty()
    }
}

#[derive(Default)]
pub struct TestTagClient {
    pub root: String,
    /// Pages served in order per poll, newest first within a page.
    pub pages: Mutex<Vec<Vec<LedgerTxInfo>>>,
    pub balance: Mutex<Amount>,
    pub submitted: Mutex<Vec<(String, Amount, Option<u64>)>>,
    pub fail_submit: Mutex<Option<ClientError>>,
}

impl TestTagClient {
    pub fn new() -> Self {
        Self {
            root: "rROOT".to_owned(),
            ..Self::default()
        }
    }

    pub fn payment(&self, tag: u64, delivered: Amount, ledger_index: u64, txid: &str) -> LedgerTxInfo {
        LedgerTxInfo {
            validated: true,
            success: true,
            destination: Some(self.root.clone()),
            destination_tag: Some(tag),
            delivered_amount: Some(delivered),
            credited: true,
            ledger_index,
            ledger_hash: Some(format!("lgr{ledger_index}")),
            txid: txid.to_owned(),
            close_time: 1_700_000_000 + ledger_index,
        }
    }
}

#[async_trait]
impl TagLedgerClient for TestTagClient {
    fn root_address(&self) -> &str {
        &self.root
    }

    async fn account_transactions(&self, marker: Option<Value>) -> ClientResult<LedgerTxPage> {
        let pages = self.pages.lock();
        let idx = marker
            .as_ref()
            .and_then(Value::as_u64)
            .map(|m| m as usize)
            .unwrap_or(0);
        let txs = pages.get(idx).cloned().unwrap_or_default();
        let marker = if idx + 1 < pages.len() {
            Some(Value::from((idx + 1) as u64))
        } else {
            None
        };
        Ok(LedgerTxPage { txs, marker })
    }

    async fn root_balance(&self) -> ClientResult<Amount> {
        Ok(self.balance.lock().clone())
    }

    async fn submit_payment(
        &self,
        to: &str,
        value: &Amount,
        tag: Option<u64>,
    ) -> ClientResult<String> {
        if let Some(err) = self.fail_submit.lock().clone() {
            return Err(err);
        }
        let mut submitted = self.submitted.lock();
        submitted.push((to.to_owned(), value.clone(), tag));
        Ok(format!("pmt{}", submitted.len()))
    }

    fn validate_address(&self, address: &str) -> bool {
        address.starts_with('r') && address.len() >= 2
    }
}
