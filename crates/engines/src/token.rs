//! Amount-distinguished engine for a fungible token on a shared address.
//!
//! Every deposit lands on the root address; attribution keys on the exact
//! transferred value.  A deposit intent therefore reserves a value, possibly
//! perturbed by a few minimal units to keep reservations unique, and the
//! handle is consumed when a matching transfer is observed.

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tracing::*;

use cashier_chainio::traits::TokenChainClient;
use cashier_db::types::AmountHandle;
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

/// Perturbation attempts before reservation gives up.
const RESERVE_ATTEMPTS: u32 = 16;

pub struct TokenEngine<C> {
    settings: EngineSettings,
    ledger: CoinLedger,
    client: C,
    latch: FaultLatch,
}

impl<C: TokenChainClient> TokenEngine<C> {
    pub fn new(settings: EngineSettings, ledger: CoinLedger, client: C) -> Self {
        Self {
            settings,
            ledger,
            client,
            latch: FaultLatch::new(),
        }
    }

    async fn poll_deposits_inner(&self, processed: &mut EventSink) -> EngineResult<()> {
        let head = self.client.head_block().await?;
        let to_block = head.saturating_sub(self.settings.confirmations);
        let from_block = match self.ledger.watermark_height()? {
            Some(w) => w + 1,
            None => to_block,
        };
        if to_block == 0 || from_block > to_block {
            return Ok(());
        }

        let transfers = self.client.incoming_transfers(from_block, to_block).await?;
        let root = self.client.root_address();

        let mut credits = Vec::new();
        for transfer in transfers {
            if transfer.to != root {
                continue;
            }
            if self.ledger.deposit_exists(&transfer.txid)? {
                continue;
            }
            let Some(handle) = self.ledger.amount_handle_by_amount(&transfer.value)? else {
                continue;
            };
            // A value can only be attributed once per pass; the handle is
            // gone after the first match commits.
            if credits
                .iter()
                .any(|(h, _): &(AmountHandle, _)| h.amount == transfer.value)
            {
                continue;
            }
            credits.push((handle, transfer));
        }

        let chain_balance = self.client.root_token_balance().await?;
        let stored_balance = self.ledger.backend_balance()?;

        let zero = Amount::zero();
        self.ledger.atomic(|tx| -> cashier_db::DbResult<()> {
            for (handle, transfer) in &credits {
                tx.add_account_totals(&handle.user, &transfer.value, &zero)?;
                tx.add_global_totals(&transfer.value, &zero)?;
                tx.insert_deposit(
                    &handle.user,
                    &transfer.value,
                    &transfer.txid,
                    None,
                    Some(&transfer.block_hash),
                    transfer.block_height,
                    transfer.block_time,
                )?;
                tx.delete_amount_handle(&handle.user)?;
            }
            tx.record_processed_block(to_block, None)?;
            if chain_balance != stored_balance {
                tx.set_backend_balance(&chain_balance)?;
            }
            Ok(())
        })?;

        for (handle, transfer) in &credits {
            processed.push(
                &self.settings.coin,
                &handle.user,
                json!({
                    "txid": transfer.txid,
                    "amount": self.settings.format_amount(&transfer.value),
                    "blockHeight": transfer.block_height,
                }),
            );
            info!(user = %handle.user, txid = %transfer.txid, "credited token deposit");
        }
        Ok(())
    }

    async fn process_pending_inner(
        &self,
        processed: &mut EventSink,
        rejected: &mut EventSink,
        shutdown: &ShutdownGuard,
    ) -> EngineResult<()> {
        for payout in self.ledger.all_pending()? {
            if shutdown.should_shutdown() {
                break;
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

            match self.client.transfer_from_root(&payout.address, &net).await {
                Ok(txid) => {
                    adapter::commit_payout(&self.ledger, &self.settings, &payout, &txid, processed)?;
                    info!(user = %payout.user, %txid, "token payout broadcast");
                }
                Err(e) if e.is_rejection() => {
                    warn!(user = %payout.user, err = %e, "token payout rejected by chain");
                    adapter::reject_payout(
                        &self.ledger,
                        &self.settings,
                        &payout,
                        &e.to_string(),
                        rejected,
                    )?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<C: TokenChainClient> ChainAdapter for TokenEngine<C> {
    fn coin(&self) -> &str {
        &self.settings.coin
    }

    fn distinction(&self) -> Distinction {
        Distinction::Amount
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
        amount: Option<&str>,
    ) -> EngineResult<HandleInfo> {
        self.latch.check()?;
        let raw = amount.ok_or_else(|| {
            EngineError::InvalidInput("amount-distinguished coins need an amount".into())
        })?;
        let base = self.settings.parse_amount(raw)?;
        if base < self.settings.minimum_amount {
            return Err(EngineError::InvalidInput(format!(
                "amount {raw} is below the minimum"
            )));
        }

        let root = self.client.root_address().to_owned();
        let effective = self.latch.absorb(self.ledger.atomic(|tx| {
            if let Some(existing) = tx.amount_handle(user)? {
                return Ok(existing.amount);
            }
            let mut rng = rand::thread_rng();
            let mut candidate = base.clone();
            for _ in 0..RESERVE_ATTEMPTS {
                if tx.amount_handle_by_amount(&candidate)?.is_none() {
                    tx.insert_amount_handle(&AmountHandle {
                        user: user.clone(),
                        amount: candidate.clone(),
                    })?;
                    return Ok(candidate);
                }
                candidate = base.offset(rng.gen_range(-128..=127));
            }
            Err(EngineError::Conflict(
                "could not reserve a unique deposit amount".into(),
            ))
        }))?;

        Ok(HandleInfo::amount(
            root,
            self.settings.format_amount(&effective),
        ))
    }

    fn awaiting_deposits(&self, user: &UserId) -> EngineResult<Vec<HandleInfo>> {
        Ok(self
            .ledger
            .amount_handle(user)?
            .map(|h| {
                vec![HandleInfo::amount(
                    self.client.root_address().to_owned(),
                    self.settings.format_amount(&h.amount),
                )]
            })
            .unwrap_or_default())
    }

    async fn cancel_awaiting_deposits(&self, user: &UserId) -> EngineResult<bool> {
        self.latch.check()?;
        self.latch
            .absorb(self.ledger.atomic(|tx| tx.delete_amount_handle(user)).map_err(Into::into))
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
    use cashier_chainio::test_utils::TestTokenClient;
    use cashier_db::Ledger;
    use cashier_primitives::RoundingMode;
    use cashier_tasks::TaskManager;
    use std::sync::atomic::Ordering;

    fn settings() -> EngineSettings {
        EngineSettings {
            coin: "usdt".into(),
            coin_type: "erc20".into(),
            decimals: 6,
            minimum_amount: Amount::from_u64(1_000),
            static_fee: Amount::from_u64(100),
            confirmations: 12,
            rounding: RoundingMode::Truncate,
        }
    }

    fn engine() -> TokenEngine<TestTokenClient> {
        let ledger = Ledger::open_in_memory().unwrap().coin("usdt").unwrap();
        TokenEngine::new(settings(), ledger, TestTokenClient::new())
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
    async fn colliding_intents_get_perturbed_amounts() {
        let engine = engine();
        let first = engine
            .resolve_deposit_handle(&uid("aa"), Some("1.000000"))
            .await
            .unwrap();
        assert_eq!(first.address.as_deref(), Some("root"));
        assert_eq!(first.amount.as_deref(), Some("1.000000"));

        let second = engine
            .resolve_deposit_handle(&uid("bb"), Some("1.000000"))
            .await
            .unwrap();
        let perturbed = second.amount.unwrap();
        assert_ne!(perturbed, "1.000000");

        let exact = Amount::from_u64(1_000_000);
        let got = Amount::parse_decimal(&perturbed, 6, RoundingMode::Truncate).unwrap();
        let delta = got.abs_diff(&exact);
        assert!(
            delta <= Amount::from_u64(128),
            "perturbation must stay within 128 units, got {perturbed}"
        );

        // Both handles active and distinct.
        let aa = engine.awaiting_deposits(&uid("aa")).unwrap();
        let bb = engine.awaiting_deposits(&uid("bb")).unwrap();
        assert_ne!(aa[0].amount, bb[0].amount);
    }

    #[tokio::test]
    async fn second_intent_while_active_returns_the_reserved_value() {
        let engine = engine();
        let first = engine
            .resolve_deposit_handle(&uid("aa"), Some("2.5"))
            .await
            .unwrap();
        let again = engine
            .resolve_deposit_handle(&uid("aa"), Some("9.9"))
            .await
            .unwrap();
        assert_eq!(again.amount, first.amount, "active reservation is sticky");

        // After cancellation a new value can be reserved.
        assert!(engine.cancel_awaiting_deposits(&uid("aa")).await.unwrap());
        assert!(!engine.cancel_awaiting_deposits(&uid("aa")).await.unwrap());
        let fresh = engine
            .resolve_deposit_handle(&uid("aa"), Some("9.9"))
            .await
            .unwrap();
        assert_eq!(fresh.amount.as_deref(), Some("9.900000"));
    }

    #[tokio::test]
    async fn matching_transfer_consumes_the_handle() {
        let engine = engine();
        engine
            .resolve_deposit_handle(&uid("aa"), Some("1.000000"))
            .await
            .unwrap();
        engine.client.head.store(112, Ordering::SeqCst);
        engine
            .client
            .push_incoming(Amount::from_u64(1_000_000), 100, "t1");
        // A transfer matching no reservation stays unattributed.
        engine
            .client
            .push_incoming(Amount::from_u64(777), 100, "t2");
        *engine.client.balance.lock() = Amount::from_u64(1_000_777);

        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();

        assert_eq!(sink.len(), 1);
        assert_eq!(engine.account_info(&uid("aa")).unwrap().deposit, "1.000000");
        assert!(engine.awaiting_deposits(&uid("aa")).unwrap().is_empty());

        // Replay over the same range cannot double-credit.
        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();
        assert!(sink.is_empty());
        assert_eq!(engine.deposits(&uid("aa"), 0).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn watermark_advances_with_the_scan_frontier() {
        let engine = engine();
        engine.client.head.store(120, Ordering::SeqCst);
        engine
            .resolve_deposit_handle(&uid("aa"), Some("1"))
            .await
            .unwrap();

        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();
        assert_eq!(engine.ledger.watermark_height().unwrap(), Some(108));

        // No new blocks: nothing to scan, watermark unchanged.
        engine.poll_deposits(&mut sink).await.unwrap();
        assert_eq!(engine.ledger.watermark_height().unwrap(), Some(108));

        engine.client.head.store(130, Ordering::SeqCst);
        engine.poll_deposits(&mut sink).await.unwrap();
        assert_eq!(engine.ledger.watermark_height().unwrap(), Some(118));
    }

    #[tokio::test]
    async fn payout_rejection_and_success_paths() {
        let engine = engine();
        engine
            .ledger
            .atomic(|tx| tx.set_backend_balance(&Amount::from_u64(10_000_000)))
            .unwrap();

        engine
            .schedule_withdrawal(&uid("aa"), "dest", "1.5", None)
            .await
            .unwrap();
        *engine.client.fail_transfer.lock() = Some(cashier_chainio::ClientError::Rpc {
            code: 3,
            message: "execution reverted".into(),
        });

        let mut processed = EventSink::new();
        let mut rejected = EventSink::new();
        engine
            .process_pending(&mut processed, &mut rejected, &guard())
            .await
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert!(!engine.fault().is_engaged());
        assert!(engine.pending_payout(&uid("aa")).unwrap().is_none());

        // Now a clean run.
        *engine.client.fail_transfer.lock() = None;
        engine
            .schedule_withdrawal(&uid("aa"), "dest", "1.5", None)
            .await
            .unwrap();
        engine
            .process_pending(&mut processed, &mut rejected, &guard())
            .await
            .unwrap();
        assert_eq!(processed.len(), 1);
        assert_eq!(
            engine.client.outgoing.lock().as_slice(),
            &[("dest".to_owned(), Amount::from_u64(1_499_900))]
        );
        assert_eq!(engine.account_info(&uid("aa")).unwrap().withdrawal, "1.500000");
    }

    #[tokio::test]
    async fn admission_respects_pending_sum() {
        let engine = engine();
        engine
            .ledger
            .atomic(|tx| tx.set_backend_balance(&Amount::from_u64(1_000_000)))
            .unwrap();
        engine
            .schedule_withdrawal(&uid("aa"), "dest", "0.9", None)
            .await
            .unwrap();
        let err = engine
            .schedule_withdrawal(&uid("bb"), "dest", "0.2", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn intent_without_amount_is_invalid() {
        let engine = engine();
        let err = engine
            .resolve_deposit_handle(&uid("aa"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        let err = engine
            .resolve_deposit_handle(&uid("aa"), Some("0.000001"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)), "below minimum");
    }
}
