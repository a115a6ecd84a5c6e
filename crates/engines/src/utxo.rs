//! Address-distinguished engine backed by an external UTXO wallet.
//!
//! Deposit addresses come from the wallet's keyring under a configured
//! label; the daemon owns the keys, validates destinations and authors
//! payouts.  Deposit reconciliation pages the wallet journal and stops at
//! the processed-block watermark.

use async_trait::async_trait;
use serde_json::json;
use tracing::*;

use cashier_chainio::traits::UtxoWalletClient;
use cashier_db::types::AddressHandle;
use cashier_db::{CoinLedger, DbResult};
use cashier_primitives::{Amount, Distinction, UserId};
use cashier_tasks::ShutdownGuard;

use crate::adapter::{
    self, AccountInfo, ChainAdapter, HandleInfo, PendingInfo, ProxyInfo, TxView,
};
use crate::errors::{EngineError, EngineResult};
use crate::latch::FaultLatch;
use crate::settings::EngineSettings;
use crate::sink::EventSink;

const JOURNAL_PAGE: usize = 10;

struct Credit {
    user: UserId,
    amount: Amount,
    txid: String,
    vout: Option<u32>,
    block_hash: Option<String>,
    block_height: u64,
    block_time: u64,
}

pub struct UtxoEngine<C> {
    settings: EngineSettings,
    ledger: CoinLedger,
    client: C,
    latch: FaultLatch,
}

impl<C: UtxoWalletClient> UtxoEngine<C> {
    pub fn new(settings: EngineSettings, ledger: CoinLedger, client: C) -> Self {
        Self {
            settings,
            ledger,
            client,
            latch: FaultLatch::new(),
        }
    }

    async fn poll_deposits_inner(&self, processed: &mut EventSink) -> EngineResult<()> {
        let mut credits: Vec<Credit> = Vec::new();
        let mut skip = 0;

        'paging: loop {
            let page = self.client.wallet_transactions(JOURNAL_PAGE, skip).await?;
            if page.is_empty() {
                break;
            }
            let full_page = page.len() == JOURNAL_PAGE;

            // Newest records sit at the end of each page; walk them first so
            // the watermark cut comes before older, already-settled rows.
            for record in page.iter().rev() {
                if record.category != "receive" {
                    continue;
                }
                if record.confirmations < self.settings.confirmations as i64 {
                    continue;
                }
                if let Some(hash) = &record.block_hash {
                    if self.ledger.block_processed_hash(hash)? {
                        // Everything older is already accounted for.
                        break 'paging;
                    }
                }
                if record.amount < self.settings.minimum_amount {
                    continue;
                }
                let Some(address) = &record.address else {
                    continue;
                };
                let Some(handle) = self.ledger.address_handle_by_address(address)? else {
                    continue;
                };
                if self.ledger.deposit_exists(&record.txid)?
                    || credits.iter().any(|c| c.txid == record.txid)
                {
                    continue;
                }
                let block_height = match record.block_height {
                    Some(h) => h,
                    None => match &record.block_hash {
                        Some(hash) => self.client.block_height(hash).await?,
                        None => continue,
                    },
                };
                credits.push(Credit {
                    user: handle.user,
                    amount: record.amount.clone(),
                    txid: record.txid.clone(),
                    vout: record.vout,
                    block_hash: record.block_hash.clone(),
                    block_height,
                    block_time: record.block_time.unwrap_or_else(adapter::unix_now),
                });
            }

            if !full_page {
                break;
            }
            skip += JOURNAL_PAGE;
        }

        let chain_balance = self.client.wallet_balance().await?;
        if credits.is_empty() && chain_balance == self.ledger.backend_balance()? {
            return Ok(());
        }

        let zero = Amount::zero();
        self.ledger.atomic(|tx| -> DbResult<()> {
            for credit in &credits {
                tx.add_account_totals(&credit.user, &credit.amount, &zero)?;
                tx.add_global_totals(&credit.amount, &zero)?;
                tx.insert_deposit(
                    &credit.user,
                    &credit.amount,
                    &credit.txid,
                    credit.vout,
                    credit.block_hash.as_deref(),
                    credit.block_height,
                    credit.block_time,
                )?;
                tx.record_processed_block(credit.block_height, credit.block_hash.as_deref())?;
            }
            tx.set_backend_balance(&chain_balance)?;
            Ok(())
        })?;

        for credit in &credits {
            processed.push(
                &self.settings.coin,
                &credit.user,
                json!({
                    "txid": credit.txid,
                    "amount": self.settings.format_amount(&credit.amount),
                    "blockHeight": credit.block_height,
                }),
            );
            info!(user = %credit.user, txid = %credit.txid, "credited wallet deposit");
        }
        Ok(())
    }

    async fn process_pending_inner(
        &self,
        processed: &mut EventSink,
        rejected: &mut EventSink,
        shutdown: &ShutdownGuard,
    ) -> EngineResult<()> {
        let pendings = self.ledger.all_pending()?;
        if pendings.is_empty() {
            return Ok(());
        }
        self.client.unlock_wallet().await?;

        for payout in pendings {
            if shutdown.should_shutdown() {
                break;
            }
            if !self.client.validate_address(&payout.address).await? {
                warn!(user = %payout.user, address = %payout.address, "payout destination rejected by daemon");
                adapter::reject_payout(
                    &self.ledger,
                    &self.settings,
                    &payout,
                    "invalid destination address",
                    rejected,
                )?;
                continue;
            }
            let net = match payout.amount.checked_sub(&self.settings.static_fee) {
                Some(v) if !v.is_zero() => v,
                _ => {
                    adapter::reject_payout(
                        &self.ledger,
                        &self.settings,
                        &payout,
                        "amount does not cover the static fee",
                        rejected,
                    )?;
                    continue;
                }
            };

            // Submission failures latch here: the wallet may or may not have
            // broadcast, so nothing may be retried automatically.
            let txid = self.client.send_to_address(&payout.address, &net).await?;
            adapter::commit_payout(&self.ledger, &self.settings, &payout, &txid, processed)?;
            info!(user = %payout.user, %txid, "payout broadcast");
        }
        Ok(())
    }
}

#[async_trait]
impl<C: UtxoWalletClient> ChainAdapter for UtxoEngine<C> {
    fn coin(&self) -> &str {
        &self.settings.coin
    }

    fn distinction(&self) -> Distinction {
        Distinction::UtxoAddress
    }

    fn fault(&self) -> &FaultLatch {
        &self.latch
    }

    fn proxy_info(&self) -> EngineResult<ProxyInfo> {
        adapter::read_proxy_info(&self.ledger, &self.settings, self.distinction())
    }

    async fn resolve_deposit_handle(
        &self,
        user: &UserId,
        _amount: Option<&str>,
    ) -> EngineResult<HandleInfo> {
        self.latch.check()?;
        if let Some(handle) = self.ledger.address_handle(user)? {
            return Ok(HandleInfo::address(handle.address));
        }

        let address = self
            .latch
            .absorb(self.client.new_deposit_address().await.map_err(Into::into))?;
        let handle = AddressHandle {
            user: user.clone(),
            derivation_index: 0,
            address,
        };
        self.latch.absorb(self.ledger.atomic(|tx| -> EngineResult<()> {
            if tx.address_handle(user)?.is_none() {
                tx.insert_address_handle(&handle)?;
            }
            Ok(())
        }))?;
        let resolved = self
            .ledger
            .address_handle(user)?
            .ok_or_else(|| EngineError::Fault("deposit handle vanished after insert".into()))?;
        Ok(HandleInfo::address(resolved.address))
    }

    fn awaiting_deposits(&self, user: &UserId) -> EngineResult<Vec<HandleInfo>> {
        Ok(self
            .ledger
            .address_handle(user)?
            .map(|h| vec![HandleInfo::address(h.address)])
            .unwrap_or_default())
    }

    async fn cancel_awaiting_deposits(&self, _user: &UserId) -> EngineResult<bool> {
        Ok(false)
    }

    async fn schedule_withdrawal(
        &self,
        user: &UserId,
        address: &str,
        amount: &str,
        tag: Option<u64>,
    ) -> EngineResult<PendingInfo> {
        self.latch.check()?;
        // Daemon-side destination validation happens in the payout pass.
        self.latch.absorb(adapter::schedule_payout(
            &self.ledger,
            &self.settings,
            user,
            address,
            amount,
            tag,
            None,
            true,
        ))
    }

    fn pending_payout(&self, user: &UserId) -> EngineResult<Option<PendingInfo>> {
        Ok(self
            .ledger
            .pending_for(user)?
            .map(|p| adapter::pending_to_info(&self.settings, &p)))
    }

    fn deposits(&self, user: &UserId, skip: u64) -> EngineResult<Vec<TxView>> {
        adapter::read_deposits(&self.ledger, &self.settings, user, skip)
    }

    fn withdrawals(&self, user: &UserId, skip: u64) -> EngineResult<Vec<TxView>> {
        adapter::read_withdrawals(&self.ledger, &self.settings, user, skip)
    }

    fn account_info(&self, user: &UserId) -> EngineResult<AccountInfo> {
        adapter::read_account_info(&self.ledger, &self.settings, user)
    }

    async fn poll_deposits(&self, processed: &mut EventSink) -> EngineResult<()> {
        if self.latch.is_engaged() {
            return Ok(());
        }
        self.latch.absorb(self.poll_deposits_inner(processed).await)
    }

    async fn process_pending(
        &self,
        processed: &mut EventSink,
        rejected: &mut EventSink,
        shutdown: &ShutdownGuard,
    ) -> EngineResult<()> {
        if self.latch.is_engaged() {
            return Ok(());
        }
        self.latch
            .absorb(self.process_pending_inner(processed, rejected, shutdown).await)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use cashier_chainio::test_utils::TestUtxoClient;
    use cashier_chainio::ClientError;
    use cashier_db::Ledger;
    use cashier_primitives::RoundingMode;
    use cashier_tasks::TaskManager;

    fn settings() -> EngineSettings {
        EngineSettings {
            coin: "btc".into(),
            coin_type: "satoshi".into(),
            decimals: 8,
            minimum_amount: Amount::from_u64(1_000),
            static_fee: Amount::from_u64(500),
            confirmations: 3,
            rounding: RoundingMode::Truncate,
        }
    }

    fn engine() -> UtxoEngine<TestUtxoClient> {
        let ledger = Ledger::open_in_memory().unwrap().coin("btc").unwrap();
        UtxoEngine::new(settings(), ledger, TestUtxoClient::new())
    }

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    fn guard() -> ShutdownGuard {
        TaskManager::new(tokio::runtime::Handle::current())
            .executor()
            .shutdown_guard()
    }

    #[tokio::test]
    async fn wallet_deposit_is_credited_once() {
        let engine = engine();
        let handle = engine
            .resolve_deposit_handle(&uid("aa"), None)
            .await
            .unwrap();
        let address = handle.address.unwrap();
        assert_eq!(address, "addr1");

        // 0.00005000 at 5 confirmations.
        engine
            .client
            .push_receive(&address, Amount::from_u64(5_000), 5, "t1");
        *engine.client.balance.lock() = Amount::from_u64(5_000);

        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();

        let info = engine.account_info(&uid("aa")).unwrap();
        assert_eq!(info.deposit, "0.00005000");
        assert_eq!(info.withdrawal, "0.00000000");
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.events()[0].payload["amount"], "0.00005000");

        // Replaying the same journal produces no duplicate rows or events.
        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();
        assert!(sink.is_empty());
        assert_eq!(engine.deposits(&uid("aa"), 0).unwrap().len(), 1);
        assert_eq!(engine.account_info(&uid("aa")).unwrap().deposit, "0.00005000");
    }

    #[tokio::test]
    async fn unconfirmed_small_or_foreign_records_are_ignored() {
        let engine = engine();
        let address = engine
            .resolve_deposit_handle(&uid("aa"), None)
            .await
            .unwrap()
            .address
            .unwrap();

        // Below confirmation threshold.
        engine
            .client
            .push_receive(&address, Amount::from_u64(5_000), 2, "t1");
        // Below minimum.
        engine
            .client
            .push_receive(&address, Amount::from_u64(999), 5, "t2");
        // Unknown address.
        engine
            .client
            .push_receive("stranger", Amount::from_u64(5_000), 5, "t3");
        // Not a receive.
        {
            let mut txs = engine.client.txs.lock();
            let mut send = txs[0].clone();
            send.category = "send".into();
            send.txid = "t4".into();
            txs.push(send);
        }

        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();
        assert!(sink.is_empty());
        assert!(engine.account_info(&uid("aa")).unwrap().deposit == "0.00000000");
    }

    #[tokio::test]
    async fn paging_stops_at_the_watermark() {
        let engine = engine();
        let address = engine
            .resolve_deposit_handle(&uid("aa"), None)
            .await
            .unwrap()
            .address
            .unwrap();

        engine
            .client
            .push_receive(&address, Amount::from_u64(5_000), 9, "t1");
        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();
        assert_eq!(sink.len(), 1);

        // A fresh record lands in a new block; the old one's block is now
        // the watermark, so paging must stop there and credit only the new.
        {
            let mut txs = engine.client.txs.lock();
            let newer = WalletTxBuilder::receive(&address, Amount::from_u64(7_000), 4, "t2", "blk-t2");
            txs.push(newer);
        }
        *engine.client.balance.lock() = Amount::from_u64(12_000);

        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.events()[0].payload["txid"], "t2");
        assert_eq!(engine.account_info(&uid("aa")).unwrap().deposit, "0.00012000");
    }

    // Small helper so tests can control the block hash of a record.
    struct WalletTxBuilder;

    impl WalletTxBuilder {
        fn receive(
            address: &str,
            amount: Amount,
            confirmations: i64,
            txid: &str,
            block_hash: &str,
        ) -> cashier_chainio::traits::WalletTx {
            cashier_chainio::traits::WalletTx {
                category: "receive".into(),
                address: Some(address.to_owned()),
                amount,
                confirmations,
                txid: txid.to_owned(),
                vout: Some(0),
                block_hash: Some(block_hash.to_owned()),
                block_height: Some(101),
                block_time: Some(1_700_000_100),
            }
        }
    }

    #[tokio::test]
    async fn invalid_destination_rejects_without_latching() {
        let engine = engine();
        engine
            .ledger
            .atomic(|tx| tx.set_backend_balance(&Amount::from_u64(1_000_000)))
            .unwrap();
        engine.client.invalid_addresses.lock().insert("garbage".into());

        engine
            .schedule_withdrawal(&uid("aa"), "garbage", "0.00005", None)
            .await
            .unwrap();

        let mut processed = EventSink::new();
        let mut rejected = EventSink::new();
        engine
            .process_pending(&mut processed, &mut rejected, &guard())
            .await
            .unwrap();

        assert!(engine.pending_payout(&uid("aa")).unwrap().is_none());
        assert_eq!(rejected.len(), 1);
        assert!(processed.is_empty());
        assert!(!engine.fault().is_engaged());
        assert!(engine.client.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn send_failure_latches_the_adapter() {
        let engine = engine();
        engine
            .ledger
            .atomic(|tx| tx.set_backend_balance(&Amount::from_u64(1_000_000)))
            .unwrap();
        *engine.client.fail_send.lock() = Some(ClientError::Rpc {
            code: -6,
            message: "insufficient funds".into(),
        });

        engine
            .schedule_withdrawal(&uid("aa"), "dest", "0.00005", None)
            .await
            .unwrap();

        let mut processed = EventSink::new();
        let mut rejected = EventSink::new();
        engine
            .process_pending(&mut processed, &mut rejected, &guard())
            .await
            .unwrap_err();
        assert!(engine.fault().is_engaged(), "send failures must latch");
        assert!(engine.pending_payout(&uid("aa")).unwrap().is_some());
    }

    #[tokio::test]
    async fn successful_payout_deducts_the_static_fee_on_the_wire() {
        let engine = engine();
        engine
            .ledger
            .atomic(|tx| tx.set_backend_balance(&Amount::from_u64(1_000_000)))
            .unwrap();

        engine
            .schedule_withdrawal(&uid("aa"), "dest", "0.00005", None)
            .await
            .unwrap();
        let mut processed = EventSink::new();
        let mut rejected = EventSink::new();
        engine
            .process_pending(&mut processed, &mut rejected, &guard())
            .await
            .unwrap();

        assert_eq!(engine.client.unlocks.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(
            engine.client.sent.lock().as_slice(),
            &[("dest".to_owned(), Amount::from_u64(4_500))]
        );
        let info = engine.account_info(&uid("aa")).unwrap();
        assert_eq!(info.withdrawal, "0.00005000");
        assert_eq!(processed.len(), 1);
    }

    #[tokio::test]
    async fn insufficient_backend_balance_blocks_admission() {
        let engine = engine();
        // Snapshot 1.0, one active pending of 0.9.
        engine
            .ledger
            .atomic(|tx| tx.set_backend_balance(&Amount::from_u64(100_000_000)))
            .unwrap();
        engine
            .schedule_withdrawal(&uid("aa"), "dest1", "0.9", None)
            .await
            .unwrap();

        let err = engine
            .schedule_withdrawal(&uid("bb"), "dest2", "0.2", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        assert!(engine.pending_payout(&uid("bb")).unwrap().is_none());

        // 0.1 still fits.
        engine
            .schedule_withdrawal(&uid("bb"), "dest2", "0.1", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn second_pending_for_same_user_conflicts() {
        let engine = engine();
        engine
            .ledger
            .atomic(|tx| tx.set_backend_balance(&Amount::from_u64(1_000_000)))
            .unwrap();
        engine
            .schedule_withdrawal(&uid("aa"), "dest", "0.00005", None)
            .await
            .unwrap();
        let err = engine
            .schedule_withdrawal(&uid("aa"), "dest", "0.00005", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn shutdown_stops_between_pending_records() {
        let engine = engine();
        engine
            .ledger
            .atomic(|tx| tx.set_backend_balance(&Amount::from_u64(1_000_000)))
            .unwrap();
        engine
            .schedule_withdrawal(&uid("aa"), "dest1", "0.00005", None)
            .await
            .unwrap();
        engine
            .schedule_withdrawal(&uid("bb"), "dest2", "0.00005", None)
            .await
            .unwrap();

        let manager = TaskManager::new(tokio::runtime::Handle::current());
        let guard = manager.executor().shutdown_guard();
        manager.shutdown_signal().send();

        let mut processed = EventSink::new();
        let mut rejected = EventSink::new();
        engine
            .process_pending(&mut processed, &mut rejected, &guard)
            .await
            .unwrap();
        assert!(engine.client.sent.lock().is_empty(), "no payout after shutdown");
        assert_eq!(engine.ledger.all_pending().unwrap().len(), 2);
    }
}
