//! Tag-distinguished engine for a shared-account ledger.
//!
//! Every user shares the root address and is told apart by a monotonically
//! allocated destination tag.  Deposit reconciliation pages the root
//! account's transactions newest-first and stops at the ledger watermark;
//! payouts are signed server-side by the configured passphrase.

use async_trait::async_trait;
use serde_json::json;
use tracing::*;

use cashier_chainio::traits::{LedgerTxInfo, TagLedgerClient};
use cashier_db::types::TagHandle;
use cashier_db::CoinLedger;
use cashier_primitives::{Amount, Distinction, UserId};
use cashier_tasks::ShutdownGuard;

use crate::adapter::{
    self, AccountInfo, ChainAdapter, HandleInfo, PendingInfo, ProxyInfo, TxView,
};
use crate::errors::{EngineError, EngineResult};
use crate::latch::FaultLatch;
use crate::settings::EngineSettings;
use crate::sink::EventSink;

struct Credit {
    user: UserId,
    amount: Amount,
    txid: String,
    ledger_hash: Option<String>,
    ledger_index: u64,
    close_time: u64,
}

pub struct TagEngine<C> {
    settings: EngineSettings,
    ledger: CoinLedger,
    client: C,
    latch: FaultLatch,
}

impl<C: TagLedgerClient> TagEngine<C> {
    pub fn new(settings: EngineSettings, ledger: CoinLedger, client: C) -> Self {
        Self {
            settings,
            ledger,
            client,
            latch: FaultLatch::new(),
        }
    }

    fn filter_record(&self, tx: &LedgerTxInfo) -> EngineResult<Option<Credit>> {
        if !tx.validated || !tx.success || !tx.credited {
            return Ok(None);
        }
        if tx.destination.as_deref() != Some(self.client.root_address()) {
            return Ok(None);
        }
        let Some(tag) = tx.destination_tag else {
            return Ok(None);
        };
        let Some(handle) = self.ledger.tag_handle_by_tag(tag)? else {
            return Ok(None);
        };
        let Some(delivered) = &tx.delivered_amount else {
            return Ok(None);
        };
        if *delivered < self.settings.minimum_amount {
            return Ok(None);
        }
        if self.ledger.deposit_exists(&tx.txid)? {
            return Ok(None);
        }
        Ok(Some(Credit {
            user: handle.user,
            amount: delivered.clone(),
            txid: tx.txid.clone(),
            ledger_hash: tx.ledger_hash.clone(),
            ledger_index: tx.ledger_index,
            close_time: tx.close_time,
        }))
    }

    async fn poll_deposits_inner(&self, processed: &mut EventSink) -> EngineResult<()> {
        let watermark = self.ledger.watermark_height()?;
        let mut credits: Vec<Credit> = Vec::new();
        let mut top_seen: Option<u64> = None;
        let mut marker = None;

        'paging: loop {
            let page = self.client.account_transactions(marker.take()).await?;
            for tx in &page.txs {
                if let Some(w) = watermark {
                    if tx.ledger_index <= w {
                        break 'paging;
                    }
                }
                if tx.validated {
                    top_seen = Some(top_seen.map_or(tx.ledger_index, |t| t.max(tx.ledger_index)));
                }
                if let Some(credit) = self.filter_record(tx)? {
                    if !credits.iter().any(|c| c.txid == credit.txid) {
                        credits.push(credit);
                    }
                }
            }
            match page.marker {
                Some(m) => marker = Some(m),
                None => break,
            }
        }

        let chain_balance = self.client.root_balance().await?;
        let stored_balance = self.ledger.backend_balance()?;
        if credits.is_empty() && top_seen.is_none() && chain_balance == stored_balance {
            return Ok(());
        }

        let zero = Amount::zero();
        self.ledger.atomic(|tx| -> cashier_db::DbResult<()> {
            for credit in &credits {
                tx.add_account_totals(&credit.user, &credit.amount, &zero)?;
                tx.add_global_totals(&credit.amount, &zero)?;
                tx.insert_deposit(
                    &credit.user,
                    &credit.amount,
                    &credit.txid,
                    None,
                    credit.ledger_hash.as_deref(),
                    credit.ledger_index,
                    credit.close_time,
                )?;
            }
            if let Some(top) = top_seen {
                tx.record_processed_block(top, None)?;
            }
            if chain_balance != stored_balance {
                tx.set_backend_balance(&chain_balance)?;
            }
            Ok(())
        })?;

        for credit in &credits {
            processed.push(
                &self.settings.coin,
                &credit.user,
                json!({
                    "txid": credit.txid,
                    "amount": self.settings.format_amount(&credit.amount),
                    "ledgerIndex": credit.ledger_index,
                }),
            );
            info!(user = %credit.user, txid = %credit.txid, "credited tagged deposit");
        }
        Ok(())
    }

    async fn process_pending_inner(
        &self,
        processed: &mut EventSink,
        shutdown: &ShutdownGuard,
    ) -> EngineResult<()> {
        for payout in self.ledger.all_pending()? {
            if shutdown.should_shutdown() {
                break;
            }
            // A non-success reply latches and the pending row stays for the
            // pass after the operator clears the fault.
            let txid = self
                .client
                .submit_payment(&payout.address, &payout.amount, payout.tag)
                .await?;
            adapter::commit_payout(&self.ledger, &self.settings, &payout, &txid, processed)?;
            info!(user = %payout.user, %txid, "tagged payout submitted");
        }
        Ok(())
    }
}

#[async_trait]
impl<C: TagLedgerClient> ChainAdapter for TagEngine<C> {
    fn coin(&self) -> &str {
        &self.settings.coin
    }

    fn distinction(&self) -> Distinction {
        Distinction::Tag
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
        let root = self.client.root_address().to_owned();
        if let Some(handle) = self.ledger.tag_handle(user)? {
            return Ok(HandleInfo::tagged(root, handle.tag));
        }

        let tag = self.ledger.top_tag()?.map(|t| t + 1).unwrap_or(1);
        let handle = TagHandle {
            user: user.clone(),
            tag,
        };
        self.latch
            .absorb(self.ledger.atomic(|tx| -> EngineResult<()> {
                if tx.tag_handle(user)?.is_none() {
                    tx.insert_tag_handle(&handle)?;
                }
                Ok(())
            }))?;
        let resolved = self
            .ledger
            .tag_handle(user)?
            .ok_or_else(|| EngineError::Fault("deposit handle vanished after insert".into()))?;
        Ok(HandleInfo::tagged(root, resolved.tag))
    }

    fn awaiting_deposits(&self, user: &UserId) -> EngineResult<Vec<HandleInfo>> {
        Ok(self
            .ledger
            .tag_handle(user)?
            .map(|h| vec![HandleInfo::tagged(self.client.root_address().to_owned(), h.tag)])
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
        if !self.client.validate_address(address) {
            return Err(EngineError::InvalidInput(format!(
                "invalid destination address {address}"
            )));
        }
        self.latch.absorb(adapter::schedule_payout(
            &self.ledger,
            &self.settings,
            user,
            address,
            amount,
            tag,
            Some(self.client.root_address()),
            false,
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
        _rejected: &mut EventSink,
        shutdown: &ShutdownGuard,
    ) -> EngineResult<()> {
        if self.latch.is_engaged() {
            return Ok(());
        }
        self.latch
            .absorb(self.process_pending_inner(processed, shutdown).await)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use cashier_chainio::test_utils::TestTagClient;
    use cashier_chainio::ClientError;
    use cashier_db::Ledger;
    use cashier_primitives::RoundingMode;
    use cashier_tasks::TaskManager;

    fn settings() -> EngineSettings {
        EngineSettings {
            coin: "xrp".into(),
            coin_type: "ripple".into(),
            decimals: 6,
            minimum_amount: Amount::from_u64(1_000),
            static_fee: Amount::from_u64(10),
            confirmations: 1,
            rounding: RoundingMode::Truncate,
        }
    }

    fn engine() -> TagEngine<TestTagClient> {
        let ledger = Ledger::open_in_memory().unwrap().coin("xrp").unwrap();
        TagEngine::new(settings(), ledger, TestTagClient::new())
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
    async fn tags_allocate_monotonically_from_one() {
        let engine = engine();
        let h1 = engine
            .resolve_deposit_handle(&uid("aa"), None)
            .await
            .unwrap();
        assert_eq!(h1.address.as_deref(), Some("rROOT"));
        assert_eq!(h1.tag, Some(1));

        let h2 = engine
            .resolve_deposit_handle(&uid("bb"), None)
            .await
            .unwrap();
        assert_eq!(h2.tag, Some(2));

        let again = engine
            .resolve_deposit_handle(&uid("aa"), None)
            .await
            .unwrap();
        assert_eq!(again, h1);
    }

    #[tokio::test]
    async fn tagged_payment_is_credited() {
        let engine = engine();
        engine
            .resolve_deposit_handle(&uid("aa"), None)
            .await
            .unwrap();

        let payment = engine
            .client
            .payment(1, Amount::from_u64(10_000_000), 7_000_000, "t1");
        engine.client.pages.lock().push(vec![payment]);
        *engine.client.balance.lock() = Amount::from_u64(10_000_000);

        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();

        assert_eq!(engine.account_info(&uid("aa")).unwrap().deposit, "10.000000");
        assert_eq!(sink.len(), 1);
        assert_eq!(engine.ledger.watermark_height().unwrap(), Some(7_000_000));

        // Same page again: the watermark stops the scan before any record.
        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();
        assert!(sink.is_empty());
        assert_eq!(engine.deposits(&uid("aa"), 0).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_tags_and_uncredited_payments_are_ignored() {
        let engine = engine();
        engine
            .resolve_deposit_handle(&uid("aa"), None)
            .await
            .unwrap();

        let stranger = engine
            .client
            .payment(42, Amount::from_u64(10_000_000), 7_000_000, "t1");
        let mut uncredited = engine
            .client
            .payment(1, Amount::from_u64(10_000_000), 7_000_001, "t2");
        uncredited.credited = false;
        let mut unvalidated = engine
            .client
            .payment(1, Amount::from_u64(10_000_000), 7_000_002, "t3");
        unvalidated.validated = false;
        let mut dust = engine
            .client
            .payment(1, Amount::from_u64(999), 7_000_003, "t4");
        dust.credited = true;

        engine
            .client
            .pages
            .lock()
            .push(vec![dust, unvalidated, uncredited, stranger]);

        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();
        assert!(sink.is_empty());
        assert_eq!(engine.account_info(&uid("aa")).unwrap().deposit, "0.000000");
        // The frontier still advances over the validated noise.
        assert_eq!(engine.ledger.watermark_height().unwrap(), Some(7_000_003));
    }

    #[tokio::test]
    async fn multi_page_scan_follows_markers() {
        let engine = engine();
        engine
            .resolve_deposit_handle(&uid("aa"), None)
            .await
            .unwrap();

        let newer = engine
            .client
            .payment(1, Amount::from_u64(2_000_000), 7_000_010, "t-new");
        let older = engine
            .client
            .payment(1, Amount::from_u64(3_000_000), 7_000_001, "t-old");
        {
            let mut pages = engine.client.pages.lock();
            pages.push(vec![newer]);
            pages.push(vec![older]);
        }

        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(engine.account_info(&uid("aa")).unwrap().deposit, "5.000000");
    }

    #[tokio::test]
    async fn non_success_submission_latches_and_keeps_pending() {
        let engine = engine();
        engine
            .ledger
            .atomic(|tx| tx.set_backend_balance(&Amount::from_u64(100_000_000)))
            .unwrap();
        *engine.client.fail_submit.lock() = Some(ClientError::Rpc {
            code: 104,
            message: "tecUNFUNDED_PAYMENT".into(),
        });

        engine
            .schedule_withdrawal(&uid("aa"), "rDEST", "5", Some(77))
            .await
            .unwrap();

        let mut processed = EventSink::new();
        let mut rejected = EventSink::new();
        engine
            .process_pending(&mut processed, &mut rejected, &guard())
            .await
            .unwrap_err();

        assert!(engine.fault().is_engaged());
        assert!(engine.pending_payout(&uid("aa")).unwrap().is_some());
        assert!(rejected.is_empty());

        // Operator clears the fault; the retry succeeds.
        assert!(engine.fault().clear());
        *engine.client.fail_submit.lock() = None;
        engine
            .process_pending(&mut processed, &mut rejected, &guard())
            .await
            .unwrap();
        assert_eq!(
            engine.client.submitted.lock().as_slice(),
            &[("rDEST".to_owned(), Amount::from_u64(5_000_000), Some(77))]
        );
        assert!(engine.pending_payout(&uid("aa")).unwrap().is_none());
        assert_eq!(engine.account_info(&uid("aa")).unwrap().withdrawal, "5.000000");
    }

    #[tokio::test]
    async fn destination_format_is_checked_at_admission() {
        let engine = engine();
        engine
            .ledger
            .atomic(|tx| tx.set_backend_balance(&Amount::from_u64(100_000_000)))
            .unwrap();
        let err = engine
            .schedule_withdrawal(&uid("aa"), "xDEST", "5", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        let err = engine
            .schedule_withdrawal(&uid("aa"), "rROOT", "5", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)), "root is managed");
    }
}
