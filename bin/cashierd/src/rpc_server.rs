//! The request dispatcher: validates caller identifiers, resolves the coin
//! adapter and routes each API method to the matching adapter operation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use jsonrpsee::core::RpcResult;
use jsonrpsee::types::ErrorObjectOwned;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::*;

use cashier_db::{Outbox, OutboxQueue};
use cashier_engines::ChainAdapter;
use cashier_primitives::UserId;
use cashier_rpc_api::{CashierAdminApiServer, CashierApiServer};
use cashier_rpc_types::{
    RpcAccountStats, RpcDepositHandle, RpcOutboxEvent, RpcPending, RpcProxyInfo, RpcServerError,
    RpcTransaction,
};

fn to_rpc_err(e: impl Into<RpcServerError>) -> ErrorObjectOwned {
    e.into().into()
}

fn parse_user(user: &str) -> Result<UserId, ErrorObjectOwned> {
    UserId::parse(user).map_err(to_rpc_err)
}

pub struct CashierRpcImpl {
    adapters: BTreeMap<String, Arc<dyn ChainAdapter>>,
    outbox: Outbox,
}

impl CashierRpcImpl {
    pub fn new(adapters: BTreeMap<String, Arc<dyn ChainAdapter>>, outbox: Outbox) -> Self {
        Self { adapters, outbox }
    }

    fn adapter(&self, coin: &str) -> Result<&Arc<dyn ChainAdapter>, ErrorObjectOwned> {
        self.adapters
            .get(coin)
            .ok_or_else(|| to_rpc_err(RpcServerError::UnknownCoin(coin.to_owned())))
    }

    fn drain(
        &self,
        queue: OutboxQueue,
        coin: &str,
        user: &str,
    ) -> Result<Vec<serde_json::Value>, ErrorObjectOwned> {
        let user = parse_user(user)?;
        self.adapter(coin)?;
        let events = self.outbox.drain(queue, coin, &user).map_err(to_rpc_err)?;
        Ok(events.into_iter().map(|ev| ev.payload).collect())
    }

    fn drain_all(
        &self,
        queue: OutboxQueue,
        coin: &str,
    ) -> Result<Vec<RpcOutboxEvent>, ErrorObjectOwned> {
        self.adapter(coin)?;
        let events = self.outbox.drain_all(queue, coin).map_err(to_rpc_err)?;
        Ok(events.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl CashierApiServer for CashierRpcImpl {
    async fn get_proxy_info(&self, coin: String) -> RpcResult<RpcProxyInfo> {
        let info = self.adapter(&coin)?.proxy_info().map_err(to_rpc_err)?;
        Ok(info.into())
    }

    async fn get_stats(&self, coin: String, user: String) -> RpcResult<RpcAccountStats> {
        let user = parse_user(&user)?;
        let info = self
            .adapter(&coin)?
            .account_info(&user)
            .map_err(to_rpc_err)?;
        Ok(info.into())
    }

    async fn get_all_coin_stats(
        &self,
        user: String,
    ) -> RpcResult<BTreeMap<String, RpcAccountStats>> {
        let user = parse_user(&user)?;
        let mut out = BTreeMap::new();
        for (coin, adapter) in &self.adapters {
            let info = adapter.account_info(&user).map_err(to_rpc_err)?;
            out.insert(coin.clone(), info.into());
        }
        Ok(out)
    }

    async fn set_deposit(
        &self,
        coin: String,
        user: String,
        amount: Option<String>,
    ) -> RpcResult<RpcDepositHandle> {
        let user = parse_user(&user)?;
        let handle = self
            .adapter(&coin)?
            .resolve_deposit_handle(&user, amount.as_deref())
            .await
            .map_err(to_rpc_err)?;
        Ok(handle.into())
    }

    async fn get_deposit(&self, coin: String, user: String) -> RpcResult<Vec<RpcDepositHandle>> {
        let user = parse_user(&user)?;
        let handles = self
            .adapter(&coin)?
            .awaiting_deposits(&user)
            .map_err(to_rpc_err)?;
        Ok(handles.into_iter().map(Into::into).collect())
    }

    async fn delete_deposit(&self, coin: String, user: String) -> RpcResult<bool> {
        let user = parse_user(&user)?;
        self.adapter(&coin)?
            .cancel_awaiting_deposits(&user)
            .await
            .map_err(to_rpc_err)
    }

    async fn set_pending(
        &self,
        coin: String,
        user: String,
        address: String,
        amount: String,
        tag: Option<u64>,
    ) -> RpcResult<RpcPending> {
        let user = parse_user(&user)?;
        let pending = self
            .adapter(&coin)?
            .schedule_withdrawal(&user, &address, &amount, tag)
            .await
            .map_err(to_rpc_err)?;
        info!(%coin, %user, "scheduled withdrawal");
        Ok(pending.into())
    }

    async fn get_pending(&self, coin: String, user: String) -> RpcResult<Option<RpcPending>> {
        let user = parse_user(&user)?;
        let pending = self
            .adapter(&coin)?
            .pending_payout(&user)
            .map_err(to_rpc_err)?;
        Ok(pending.map(Into::into))
    }

    async fn list_deposits(
        &self,
        coin: String,
        user: String,
        skip: Option<u64>,
    ) -> RpcResult<Vec<RpcTransaction>> {
        let user = parse_user(&user)?;
        let views = self
            .adapter(&coin)?
            .deposits(&user, skip.unwrap_or(0))
            .map_err(to_rpc_err)?;
        Ok(views.into_iter().map(Into::into).collect())
    }

    async fn list_withdrawals(
        &self,
        coin: String,
        user: String,
        skip: Option<u64>,
    ) -> RpcResult<Vec<RpcTransaction>> {
        let user = parse_user(&user)?;
        let views = self
            .adapter(&coin)?
            .withdrawals(&user, skip.unwrap_or(0))
            .map_err(to_rpc_err)?;
        Ok(views.into_iter().map(Into::into).collect())
    }

    async fn list_processed_deposits(
        &self,
        coin: String,
        user: String,
    ) -> RpcResult<Vec<serde_json::Value>> {
        self.drain(OutboxQueue::ProcessedDeposits, &coin, &user)
    }

    async fn list_processed_withdrawals(
        &self,
        coin: String,
        user: String,
    ) -> RpcResult<Vec<serde_json::Value>> {
        self.drain(OutboxQueue::ProcessedWithdrawals, &coin, &user)
    }

    async fn list_rejected_withdrawals(
        &self,
        coin: String,
        user: String,
    ) -> RpcResult<Vec<serde_json::Value>> {
        self.drain(OutboxQueue::RejectedWithdrawals, &coin, &user)
    }

    async fn list_all_processed_deposits(&self, coin: String) -> RpcResult<Vec<RpcOutboxEvent>> {
        self.drain_all(OutboxQueue::ProcessedDeposits, &coin)
    }

    async fn list_all_processed_withdrawals(
        &self,
        coin: String,
    ) -> RpcResult<Vec<RpcOutboxEvent>> {
        self.drain_all(OutboxQueue::ProcessedWithdrawals, &coin)
    }

    async fn list_all_rejected_withdrawals(
        &self,
        coin: String,
    ) -> RpcResult<Vec<RpcOutboxEvent>> {
        self.drain_all(OutboxQueue::RejectedWithdrawals, &coin)
    }
}

pub struct AdminRpcImpl {
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    adapters: BTreeMap<String, Arc<dyn ChainAdapter>>,
}

impl AdminRpcImpl {
    pub fn new(
        stop_tx: oneshot::Sender<()>,
        adapters: BTreeMap<String, Arc<dyn ChainAdapter>>,
    ) -> Self {
        Self {
            stop_tx: Mutex::new(Some(stop_tx)),
            adapters,
        }
    }

    fn adapter(&self, coin: &str) -> Result<&Arc<dyn ChainAdapter>, ErrorObjectOwned> {
        self.adapters
            .get(coin)
            .ok_or_else(|| to_rpc_err(RpcServerError::UnknownCoin(coin.to_owned())))
    }
}

#[async_trait]
impl CashierAdminApiServer for AdminRpcImpl {
    async fn stop(&self) -> RpcResult<()> {
        let Some(tx) = self.stop_tx.lock().take() else {
            warn!("stop already requested");
            return Ok(());
        };
        let _ = tx.send(());
        Ok(())
    }

    async fn adapter_fault(&self, coin: String) -> RpcResult<Option<String>> {
        Ok(self.adapter(&coin)?.fault().message())
    }

    async fn clear_adapter_fault(&self, coin: String) -> RpcResult<bool> {
        let cleared = self.adapter(&coin)?.fault().clear();
        if cleared {
            info!(%coin, "adapter fault cleared by operator");
        }
        Ok(cleared)
    }
}
