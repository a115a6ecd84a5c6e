//! Row types for the per-coin ledger tables and the outbox.

use cashier_primitives::{Amount, UserId};

/// A user's deposit handle on an address-distinguished coin.  For the UTXO
/// variant the derivation index is always zero; the address comes from the
/// external wallet instead of HD derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressHandle {
    pub user: UserId,
    pub derivation_index: u32,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagHandle {
    pub user: UserId,
    pub tag: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmountHandle {
    pub user: UserId,
    pub amount: Amount,
}

/// A confirmed, credited deposit.  Append-only; `txid` is unique per coin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositRecord {
    pub entry_id: i64,
    pub user: UserId,
    pub amount: Amount,
    pub txid: String,
    pub vout: Option<u32>,
    pub block_hash: Option<String>,
    pub block_height: u64,
    pub block_time: u64,
}

/// A broadcast, committed withdrawal.  Append-only; `txid` is unique per
/// coin and deliberately lives in a separate table from deposits so a
/// uniqueness violation on one log can never poison the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalRecord {
    pub entry_id: i64,
    pub user: UserId,
    pub amount: Amount,
    pub txid: String,
    pub block_hash: Option<String>,
    pub block_height: Option<u64>,
    pub address: String,
    pub created_at: u64,
}

/// A scheduled payout awaiting broadcast.  At most one per user per coin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPayout {
    pub user: UserId,
    pub amount: Amount,
    pub address: String,
    pub tag: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Totals {
    pub deposit: Amount,
    pub withdrawal: Amount,
}

/// One entry of a pull-once outbox queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEvent {
    pub coin: String,
    pub user: UserId,
    pub payload: serde_json::Value,
}
