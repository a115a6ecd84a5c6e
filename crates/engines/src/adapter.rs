//! The uniform capability every coin engine presents.

use async_trait::async_trait;
use serde_json::json;

use cashier_db::types::PendingPayout;
use cashier_db::CoinLedger;
use cashier_primitives::{Amount, Distinction, UserId};
use cashier_tasks::ShutdownGuard;

use crate::errors::{EngineError, EngineResult};
use crate::latch::FaultLatch;
use crate::settings::EngineSettings;
use crate::sink::EventSink;

/// Listing page size for the transaction-history calls.
pub(crate) const PAGE_SIZE: u64 = 10;

/// Coin-level summary returned by `getProxyInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyInfo {
    pub coin_type: String,
    pub decimals: u8,
    pub distinction: Distinction,
    pub global_deposit: String,
    pub global_withdrawal: String,
    pub backend_balance: String,
}

/// A deposit handle as shown to the caller; which fields are present
/// depends on the coin's distinction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleInfo {
    pub address: Option<String>,
    pub tag: Option<u64>,
    pub amount: Option<String>,
}

impl HandleInfo {
    pub(crate) fn address(address: String) -> Self {
        Self {
            address: Some(address),
            ..Self::default()
        }
    }

    pub(crate) fn tagged(root: String, tag: u64) -> Self {
        Self {
            address: Some(root),
            tag: Some(tag),
            ..Self::default()
        }
    }

    pub(crate) fn amount(root: String, amount: String) -> Self {
        Self {
            address: Some(root),
            amount: Some(amount),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub address: String,
    pub amount: String,
    pub tag: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub deposit: String,
    pub withdrawal: String,
    pub pending: Option<PendingInfo>,
}

/// One row of a user's deposit or withdrawal history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxView {
    pub entry_id: i64,
    pub txid: String,
    pub amount: String,
    pub address: Option<String>,
    pub block_height: Option<u64>,
    pub timestamp: u64,
}

/// The capability set every coin engine implements.
///
/// Background work (`poll_deposits`, `process_pending`) is driven only by
/// the reconciliation scheduler; everything else is caller-initiated through
/// the request dispatcher.  Mutating calls check the fatal latch first;
/// read-only calls stay available while the adapter is faulted.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn coin(&self) -> &str;

    fn distinction(&self) -> Distinction;

    fn fault(&self) -> &FaultLatch;

    fn proxy_info(&self) -> EngineResult<ProxyInfo>;

    /// Creates-or-returns the user's deposit handle.  `amount` only applies
    /// to amount-distinguished coins, which may perturb it to keep reserved
    /// values unique.
    async fn resolve_deposit_handle(
        &self,
        user: &UserId,
        amount: Option<&str>,
    ) -> EngineResult<HandleInfo>;

    fn awaiting_deposits(&self, user: &UserId) -> EngineResult<Vec<HandleInfo>>;

    /// Deletes amount-distinguished handles; a no-op indicator (`false`)
    /// everywhere else.
    async fn cancel_awaiting_deposits(&self, user: &UserId) -> EngineResult<bool>;

    async fn schedule_withdrawal(
        &self,
        user: &UserId,
        address: &str,
        amount: &str,
        tag: Option<u64>,
    ) -> EngineResult<PendingInfo>;

    fn pending_payout(&self, user: &UserId) -> EngineResult<Option<PendingInfo>>;

    fn deposits(&self, user: &UserId, skip: u64) -> EngineResult<Vec<TxView>>;

    fn withdrawals(&self, user: &UserId, skip: u64) -> EngineResult<Vec<TxView>>;

    fn account_info(&self, user: &UserId) -> EngineResult<AccountInfo>;

    /// One deposit-reconciliation pass; credited deposits are appended to
    /// `processed`.
    async fn poll_deposits(&self, processed: &mut EventSink) -> EngineResult<()>;

    /// One payout pass; committed payouts land in `processed`, dropped ones
    /// in `rejected`.  The shutdown flag is honoured between records.
    async fn process_pending(
        &self,
        processed: &mut EventSink,
        rejected: &mut EventSink,
        shutdown: &ShutdownGuard,
    ) -> EngineResult<()>;
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

pub(crate) fn pending_to_info(settings: &EngineSettings, payout: &PendingPayout) -> PendingInfo {
    PendingInfo {
        address: payout.address.clone(),
        amount: settings.format_amount(&payout.amount),
        tag: payout.tag,
    }
}

pub(crate) fn read_proxy_info(
    ledger: &CoinLedger,
    settings: &EngineSettings,
    distinction: Distinction,
) -> EngineResult<ProxyInfo> {
    let totals = ledger.global_totals()?;
    let balance = ledger.backend_balance()?;
    Ok(ProxyInfo {
        coin_type: settings.coin_type.clone(),
        decimals: settings.decimals,
        distinction,
        global_deposit: settings.format_amount(&totals.deposit),
        global_withdrawal: settings.format_amount(&totals.withdrawal),
        backend_balance: settings.format_amount(&balance),
    })
}

pub(crate) fn read_account_info(
    ledger: &CoinLedger,
    settings: &EngineSettings,
    user: &UserId,
) -> EngineResult<AccountInfo> {
    let totals = ledger.account_totals(user)?.unwrap_or_default();
    let pending = ledger
        .pending_for(user)?
        .map(|p| pending_to_info(settings, &p));
    Ok(AccountInfo {
        deposit: settings.format_amount(&totals.deposit),
        withdrawal: settings.format_amount(&totals.withdrawal),
        pending,
    })
}

pub(crate) fn read_deposits(
    ledger: &CoinLedger,
    settings: &EngineSettings,
    user: &UserId,
    skip: u64,
) -> EngineResult<Vec<TxView>> {
    let records = ledger.deposits_for(user, skip, PAGE_SIZE)?;
    Ok(records
        .into_iter()
        .map(|r| TxView {
            entry_id: r.entry_id,
            txid: r.txid,
            amount: settings.format_amount(&r.amount),
            address: None,
            block_height: Some(r.block_height),
            timestamp: r.block_time,
        })
        .collect())
}

pub(crate) fn read_withdrawals(
    ledger: &CoinLedger,
    settings: &EngineSettings,
    user: &UserId,
    skip: u64,
) -> EngineResult<Vec<TxView>> {
    let records = ledger.withdrawals_for(user, skip, PAGE_SIZE)?;
    Ok(records
        .into_iter()
        .map(|r| TxView {
            entry_id: r.entry_id,
            txid: r.txid,
            amount: settings.format_amount(&r.amount),
            address: Some(r.address),
            block_height: r.block_height,
            timestamp: r.created_at,
        })
        .collect())
}

/// Shared payout admission: input checks outside the transaction, state
/// checks and the insert inside it.
pub(crate) fn schedule_payout(
    ledger: &CoinLedger,
    settings: &EngineSettings,
    user: &UserId,
    address: &str,
    amount_raw: &str,
    tag: Option<u64>,
    managed_root: Option<&str>,
    check_deposit_addresses: bool,
) -> EngineResult<PendingInfo> {
    let amount = settings.parse_amount(amount_raw)?;
    let floor = settings.minimum_amount.clone() + &settings.static_fee;
    if amount < floor {
        return Err(EngineError::InvalidInput(format!(
            "amount {amount_raw} is below the minimum plus fee",
        )));
    }
    if address.is_empty() {
        return Err(EngineError::InvalidInput("empty destination address".into()));
    }
    if managed_root == Some(address) {
        return Err(EngineError::InvalidInput(
            "destination is a managed address".into(),
        ));
    }
    if check_deposit_addresses && ledger.address_handle_by_address(address)?.is_some() {
        return Err(EngineError::InvalidInput(
            "destination is a managed address".into(),
        ));
    }

    let payout = PendingPayout {
        user: user.clone(),
        amount: amount.clone(),
        address: address.to_owned(),
        tag,
    };
    ledger.atomic(|tx| {
        if tx.pending_for(user)?.is_some() {
            return Err(EngineError::Conflict(
                "a pending payout already exists for this user".into(),
            ));
        }
        let available = tx
            .backend_balance()?
            .checked_sub(&tx.pending_sum()?)
            .unwrap_or_else(Amount::zero);
        if amount > available {
            return Err(EngineError::Conflict(
                "insufficient backend balance for this payout".into(),
            ));
        }
        tx.insert_pending(&payout)?;
        Ok(())
    })?;
    Ok(pending_to_info(settings, &payout))
}

/// Drops a pending payout and records the rejection event.
pub(crate) fn reject_payout(
    ledger: &CoinLedger,
    settings: &EngineSettings,
    payout: &PendingPayout,
    reason: &str,
    rejected: &mut EventSink,
) -> EngineResult<()> {
    ledger.atomic(|tx| tx.delete_pending(&payout.user))?;
    rejected.push(
        &settings.coin,
        &payout.user,
        json!({
            "address": payout.address,
            "amount": settings.format_amount(&payout.amount),
            "reason": reason,
        }),
    );
    Ok(())
}

/// Commits a broadcast payout: totals, pending removal and the withdrawal
/// log row in one atomic scope, then the processed event.
pub(crate) fn commit_payout(
    ledger: &CoinLedger,
    settings: &EngineSettings,
    payout: &PendingPayout,
    txid: &str,
    processed: &mut EventSink,
) -> EngineResult<()> {
    let zero = Amount::zero();
    let now = unix_now();
    ledger.atomic(|tx| -> cashier_db::DbResult<()> {
        tx.add_account_totals(&payout.user, &zero, &payout.amount)?;
        tx.add_global_totals(&zero, &payout.amount)?;
        tx.delete_pending(&payout.user)?;
        tx.insert_withdrawal(
            &payout.user,
            &payout.amount,
            txid,
            None,
            None,
            &payout.address,
            now,
        )?;
        Ok(())
    })?;
    processed.push(
        &settings.coin,
        &payout.user,
        json!({
            "txid": txid,
            "address": payout.address,
            "amount": settings.format_amount(&payout.amount),
        }),
    );
    Ok(())
}
