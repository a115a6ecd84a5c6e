//! Wire types for the caller-facing API.

pub mod errors;

use serde::{Deserialize, Serialize};

use cashier_db::types::OutboxEvent;
use cashier_engines::{AccountInfo, HandleInfo, PendingInfo, ProxyInfo, TxView};

pub use errors::RpcServerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcGlobalStats {
    pub deposit: String,
    pub withdrawal: String,
    pub balance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcProxyInfo {
    pub coin_type: String,
    pub coin_decimals: u8,
    pub distinction: String,
    pub global_stats: RpcGlobalStats,
}

impl From<ProxyInfo> for RpcProxyInfo {
    fn from(info: ProxyInfo) -> Self {
        Self {
            coin_type: info.coin_type,
            coin_decimals: info.decimals,
            distinction: info.distinction.to_string(),
            global_stats: RpcGlobalStats {
                deposit: info.global_deposit,
                withdrawal: info.global_withdrawal,
                balance: info.backend_balance,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcPending {
    pub address: String,
    pub amount: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<u64>,
}

impl From<PendingInfo> for RpcPending {
    fn from(info: PendingInfo) -> Self {
        Self {
            address: info.address,
            amount: info.amount,
            tag: info.tag,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcAccountStats {
    pub deposit: String,
    pub withdrawal: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<RpcPending>,
}

impl From<AccountInfo> for RpcAccountStats {
    fn from(info: AccountInfo) -> Self {
        Self {
            deposit: info.deposit,
            withdrawal: info.withdrawal,
            pending: info.pending.map(Into::into),
        }
    }
}

/// A deposit handle; the populated fields depend on the coin's
/// distinction model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcDepositHandle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
}

impl From<HandleInfo> for RpcDepositHandle {
    fn from(info: HandleInfo) -> Self {
        Self {
            address: info.address,
            tag: info.tag,
            amount: info.amount,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub entry_id: i64,
    pub txid: String,
    pub amount: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,
    pub timestamp: u64,
}

impl From<TxView> for RpcTransaction {
    fn from(view: TxView) -> Self {
        Self {
            entry_id: view.entry_id,
            txid: view.txid,
            amount: view.amount,
            address: view.address,
            block_height: view.block_height,
            timestamp: view.timestamp,
        }
    }
}

/// One drained outbox row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcOutboxEvent {
    pub coin: String,
    pub user: String,
    pub payload: serde_json::Value,
}

impl From<OutboxEvent> for RpcOutboxEvent {
    fn from(ev: OutboxEvent) -> Self {
        Self {
            coin: ev.coin,
            user: ev.user.to_string(),
            payload: ev.payload,
        }
    }
}
