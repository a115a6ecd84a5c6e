//! The caller-facing request/response API.
//!
//! Method names are the wire contract; the admin namespace is only for
//! operators (shutdown, adapter fault inspection and reset).

use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;
use std::collections::BTreeMap;

use cashier_rpc_types::{
    RpcAccountStats, RpcDepositHandle, RpcOutboxEvent, RpcPending, RpcProxyInfo, RpcTransaction,
};

#[rpc(server)]
pub trait CashierApi {
    /// Coin-level metadata and global totals.
    #[method(name = "getProxyInfo")]
    async fn get_proxy_info(&self, coin: String) -> RpcResult<RpcProxyInfo>;

    /// One user's cumulative totals and pending payout on one coin.
    #[method(name = "getStats")]
    async fn get_stats(&self, coin: String, user: String) -> RpcResult<RpcAccountStats>;

    /// The same stats across every configured coin.
    #[method(name = "getAllCoinStats")]
    async fn get_all_coin_stats(&self, user: String)
        -> RpcResult<BTreeMap<String, RpcAccountStats>>;

    /// Creates-or-returns the user's deposit handle.  `amount` is required
    /// for amount-distinguished coins and ignored elsewhere.
    #[method(name = "setDeposit")]
    async fn set_deposit(
        &self,
        coin: String,
        user: String,
        amount: Option<String>,
    ) -> RpcResult<RpcDepositHandle>;

    /// Active deposit handles for the user.
    #[method(name = "getDeposit")]
    async fn get_deposit(&self, coin: String, user: String) -> RpcResult<Vec<RpcDepositHandle>>;

    /// Cancels an amount-distinguished deposit intent; a no-op indicator
    /// for other distinctions.
    #[method(name = "deleteDeposit")]
    async fn delete_deposit(&self, coin: String, user: String) -> RpcResult<bool>;

    /// Schedules a withdrawal after admission checks.
    #[method(name = "setPending")]
    async fn set_pending(
        &self,
        coin: String,
        user: String,
        address: String,
        amount: String,
        tag: Option<u64>,
    ) -> RpcResult<RpcPending>;

    #[method(name = "getPending")]
    async fn get_pending(&self, coin: String, user: String) -> RpcResult<Option<RpcPending>>;

    /// Last ten confirmed deposits at the given offset, newest first.
    #[method(name = "listDeposits")]
    async fn list_deposits(
        &self,
        coin: String,
        user: String,
        skip: Option<u64>,
    ) -> RpcResult<Vec<RpcTransaction>>;

    #[method(name = "listWithdrawals")]
    async fn list_withdrawals(
        &self,
        coin: String,
        user: String,
        skip: Option<u64>,
    ) -> RpcResult<Vec<RpcTransaction>>;

    /// Drain-and-return outbox queues.  Rows returned here are deleted in
    /// the same transaction; a caller that drops them loses them.
    #[method(name = "listProcessedDeposits")]
    async fn list_processed_deposits(
        &self,
        coin: String,
        user: String,
    ) -> RpcResult<Vec<serde_json::Value>>;

    #[method(name = "listProcessedWithdrawals")]
    async fn list_processed_withdrawals(
        &self,
        coin: String,
        user: String,
    ) -> RpcResult<Vec<serde_json::Value>>;

    #[method(name = "listRejectedWithdrawals")]
    async fn list_rejected_withdrawals(
        &self,
        coin: String,
        user: String,
    ) -> RpcResult<Vec<serde_json::Value>>;

    #[method(name = "listAllProcessedDeposits")]
    async fn list_all_processed_deposits(&self, coin: String)
        -> RpcResult<Vec<RpcOutboxEvent>>;

    #[method(name = "listAllProcessedWithdrawals")]
    async fn list_all_processed_withdrawals(
        &self,
        coin: String,
    ) -> RpcResult<Vec<RpcOutboxEvent>>;

    #[method(name = "listAllRejectedWithdrawals")]
    async fn list_all_rejected_withdrawals(
        &self,
        coin: String,
    ) -> RpcResult<Vec<RpcOutboxEvent>>;
}

#[rpc(server, namespace = "admin")]
pub trait CashierAdminApi {
    /// Graceful process shutdown.
    #[method(name = "stop")]
    async fn stop(&self) -> RpcResult<()>;

    /// The adapter's latched fault, if any.
    #[method(name = "adapterFault")]
    async fn adapter_fault(&self, coin: String) -> RpcResult<Option<String>>;

    /// Clears the latch; returns whether a fault was present.
    #[method(name = "clearAdapterFault")]
    async fn clear_adapter_fault(&self, coin: String) -> RpcResult<bool>;
}
