//! Capability traits the distinction engines are written against.
//!
//! Each trait is the narrowest daemon surface one engine needs; the concrete
//! clients in this crate implement them over the wire, the test clients in
//! [`crate::test_utils`] implement them in memory.

use async_trait::async_trait;

use cashier_primitives::Amount;

use crate::errors::ClientResult;

/// Chain position at which a balance or nonce is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDepth {
    Pending,
    Latest,
    /// `latest − n` blocks, i.e. the state with `n` confirmations.
    Confirmed(u64),
}

/// One record of a UTXO wallet's transaction journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletTx {
    pub category: String,
    pub address: Option<String>,
    /// Absolute value in minimal units.
    pub amount: Amount,
    pub confirmations: i64,
    pub txid: String,
    pub vout: Option<u32>,
    pub block_hash: Option<String>,
    pub block_height: Option<u64>,
    pub block_time: Option<u64>,
}

#[async_trait]
pub trait UtxoWalletClient: Send + Sync {
    /// Hands out a fresh wallet address under the configured label.
    async fn new_deposit_address(&self) -> ClientResult<String>;

    /// One page of the wallet journal in the daemon's own order (oldest
    /// first within the page).
    async fn wallet_transactions(&self, count: usize, skip: usize) -> ClientResult<Vec<WalletTx>>;

    /// Height of a block by hash, for journal records that lack one.
    async fn block_height(&self, block_hash: &str) -> ClientResult<u64>;

    async fn wallet_balance(&self) -> ClientResult<Amount>;

    /// Daemon-side destination validation.
    async fn validate_address(&self, address: &str) -> ClientResult<bool>;

    async fn send_to_address(&self, address: &str, amount: &Amount) -> ClientResult<String>;

    /// Unlocks the wallet for a bounded window if a passphrase is
    /// configured; otherwise a no-op.
    async fn unlock_wallet(&self) -> ClientResult<()>;
}

/// Receipt data for a transaction that made it into a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxConfirmation {
    pub txid: String,
    pub block_hash: String,
    pub block_height: u64,
    pub block_time: u64,
}

#[async_trait]
pub trait AccountChainClient: Send + Sync {
    fn root_address(&self) -> &str;

    /// Gas units a plain value transfer costs on this chain.
    fn transfer_gas(&self) -> u64;

    /// Deterministic address at a derivation index.
    fn derive_address(&self, index: u32) -> ClientResult<String>;

    async fn balance(&self, address: &str, depth: ReadDepth) -> ClientResult<Amount>;

    async fn nonce(&self, address: &str, depth: ReadDepth) -> ClientResult<u64>;

    async fn gas_price(&self) -> ClientResult<Amount>;

    /// Sweeps `value` from the address at `index` to the root address,
    /// awaiting the receipt and resolving the enclosing block.
    async fn sweep_to_root(&self, index: u32, value: &Amount) -> ClientResult<TxConfirmation>;

    /// Signs and broadcasts a payment from the root account.  The returned
    /// txid is the signed transaction's hash, known before broadcast.
    async fn pay_from_root(&self, to: &str, value: &Amount) -> ClientResult<String>;

    /// Local format check; chain-side acceptance is decided at submission.
    fn validate_address(&self, address: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    pub from: String,
    pub to: String,
    pub value: Amount,
    pub txid: String,
    pub block_hash: String,
    pub block_height: u64,
    pub block_time: u64,
}

#[async_trait]
pub trait TokenChainClient: Send + Sync {
    fn root_address(&self) -> &str;

    async fn head_block(&self) -> ClientResult<u64>;

    /// Token transfers into the root address over the inclusive block
    /// range, ascending by block.
    async fn incoming_transfers(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> ClientResult<Vec<TokenTransfer>>;

    async fn root_token_balance(&self) -> ClientResult<Amount>;

    async fn transfer_from_root(&self, to: &str, value: &Amount) -> ClientResult<String>;

    fn validate_address(&self, address: &str) -> bool;
}

/// One transaction touching the root account of a tag-addressed ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTxInfo {
    pub validated: bool,
    pub success: bool,
    pub destination: Option<String>,
    pub destination_tag: Option<u64>,
    /// Value actually delivered, when the ledger reports one in the native
    /// currency.
    pub delivered_amount: Option<Amount>,
    /// Whether the final meta node modified an account root, i.e. the
    /// payment really credited its destination.
    pub credited: bool,
    pub ledger_index: u64,
    pub ledger_hash: Option<String>,
    pub txid: String,
    pub close_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTxPage {
    pub txs: Vec<LedgerTxInfo>,
    /// Resume cursor; `None` when the server has nothing older.
    pub marker: Option<serde_json::Value>,
}

#[async_trait]
pub trait TagLedgerClient: Send + Sync {
    fn root_address(&self) -> &str;

    /// One page of the root account's transactions, newest first.
    async fn account_transactions(
        &self,
        marker: Option<serde_json::Value>,
    ) -> ClientResult<LedgerTxPage>;

    async fn root_balance(&self) -> ClientResult<Amount>;

    /// Submits a payment signed server-side by the configured passphrase.
    /// A non-success engine result is an [`crate::ClientError::Rpc`] error.
    async fn submit_payment(&self, to: &str, value: &Amount, tag: Option<u64>)
        -> ClientResult<String>;

    fn validate_address(&self, address: &str) -> bool;
}
