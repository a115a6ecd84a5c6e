//! Address-distinguished engine for account-model chains.
//!
//! Every user gets a fresh HD-derived address; confirmed balances are swept
//! into the root account and credited on receipt.  Payouts are authored
//! from the root account, so the engine refuses to interleave with another
//! writer by comparing the root's pending and latest nonces.

use async_trait::async_trait;
use serde_json::json;
use tracing::*;

use cashier_chainio::traits::{AccountChainClient, ReadDepth};
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

pub struct AccountEngine<C> {
    settings: EngineSettings,
    ledger: CoinLedger,
    client: C,
    latch: FaultLatch,
}

impl<C: AccountChainClient> AccountEngine<C> {
    pub fn new(settings: EngineSettings, ledger: CoinLedger, client: C) -> Self {
        Self {
            settings,
            ledger,
            client,
            latch: FaultLatch::new(),
        }
    }

    fn gas_cost(&self, gas_price: &Amount) -> Amount {
        gas_price.mul_u64(self.client.transfer_gas())
    }

    async fn poll_deposits_inner(&self, processed: &mut EventSink) -> EngineResult<()> {
        let handles = self.ledger.all_address_handles()?;
        if !handles.is_empty() {
            self.sweep_handles(handles, processed).await?;
        }

        // Snapshot the root balance after sweeping; payout admission is
        // checked against this snapshot.
        let root_balance = self
            .client
            .balance(self.client.root_address(), ReadDepth::Latest)
            .await?;
        if root_balance != self.ledger.backend_balance()? {
            self.ledger
                .atomic(|tx| tx.set_backend_balance(&root_balance))?;
        }
        Ok(())
    }

    async fn sweep_handles(
        &self,
        handles: Vec<AddressHandle>,
        processed: &mut EventSink,
    ) -> EngineResult<()> {
        let gas_price = self.client.gas_price().await?;
        let gas_cost = self.gas_cost(&gas_price);

        for handle in handles {
            let derived = self.client.derive_address(handle.derivation_index)?;
            if derived != handle.address {
                return Err(EngineError::Fault(format!(
                    "stored address {} does not match derivation at index {}",
                    handle.address, handle.derivation_index
                )));
            }

            let pending = self
                .client
                .balance(&handle.address, ReadDepth::Pending)
                .await?;
            let latest = self
                .client
                .balance(&handle.address, ReadDepth::Latest)
                .await?;
            let settled = self
                .client
                .balance(
                    &handle.address,
                    ReadDepth::Confirmed(self.settings.confirmations),
                )
                .await?;
            // Skip while any in-flight activity is visible.
            if pending != latest || latest != settled {
                continue;
            }
            if latest < self.settings.minimum_amount {
                continue;
            }
            let Some(sweep_value) = latest.checked_sub(&gas_cost) else {
                continue;
            };
            if sweep_value.is_zero() {
                continue;
            }

            let conf = self
                .client
                .sweep_to_root(handle.derivation_index, &sweep_value)
                .await?;
            if self.ledger.deposit_exists(&conf.txid)? {
                continue;
            }

            let zero = Amount::zero();
            self.ledger.atomic(|tx| -> DbResult<()> {
                tx.add_account_totals(&handle.user, &sweep_value, &zero)?;
                tx.add_global_totals(&sweep_value, &zero)?;
                tx.insert_deposit(
                    &handle.user,
                    &sweep_value,
                    &conf.txid,
                    None,
                    Some(&conf.block_hash),
                    conf.block_height,
                    conf.block_time,
                )?;
                Ok(())
            })?;
            processed.push(
                &self.settings.coin,
                &handle.user,
                json!({
                    "txid": conf.txid,
                    "address": handle.address,
                    "amount": self.settings.format_amount(&sweep_value),
                    "blockHeight": conf.block_height,
                }),
            );
            info!(user = %handle.user, txid = %conf.txid, "credited swept deposit");
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

        let root = self.client.root_address().to_owned();
        let nonce_pending = self.client.nonce(&root, ReadDepth::Pending).await?;
        let nonce_latest = self.client.nonce(&root, ReadDepth::Latest).await?;
        if nonce_pending != nonce_latest {
            // Another transaction from the root is still in flight.
            debug!(%nonce_pending, %nonce_latest, "root account busy, deferring payouts");
            return Ok(());
        }

        let mut root_balance = self.client.balance(&root, ReadDepth::Latest).await?;
        if root_balance != self.ledger.backend_balance()? {
            self.ledger
                .atomic(|tx| tx.set_backend_balance(&root_balance))?;
        }
        let gas_price = self.client.gas_price().await?;
        let gas_cost = self.gas_cost(&gas_price);
        let fee = gas_cost.clone() + &self.settings.static_fee;

        for payout in pendings {
            if shutdown.should_shutdown() {
                break;
            }
            let transfer = match payout.amount.checked_sub(&fee) {
                Some(v) if !v.is_zero() => v,
                _ => {
                    adapter::reject_payout(
                        &self.ledger,
                        &self.settings,
                        &payout,
                        "amount does not cover gas and fee",
                        rejected,
                    )?;
                    continue;
                }
            };
            // The root spends the transfer plus its gas.  A shortfall is
            // operational, not an accounting fault: leave the queue intact
            // and retry once sweeps replenish the balance.
            let required = transfer.clone() + &gas_cost;
            if root_balance < required {
                warn!(user = %payout.user, "root balance short of payout, deferring the pass");
                break;
            }

            match self.client.pay_from_root(&payout.address, &transfer).await {
                Ok(txid) => {
                    adapter::commit_payout(&self.ledger, &self.settings, &payout, &txid, processed)?;
                    root_balance = root_balance.checked_sub(&required).unwrap_or_else(Amount::zero);
                    info!(user = %payout.user, %txid, "payout broadcast");
                }
                Err(e) if e.is_rejection() => {
                    warn!(user = %payout.user, err = %e, "payout rejected by chain");
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
impl<C: AccountChainClient> ChainAdapter for AccountEngine<C> {
    fn coin(&self) -> &str {
        &self.settings.coin
    }

    fn distinction(&self) -> Distinction {
        Distinction::Address
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

        let index = self
            .ledger
            .top_derivation_index()?
            .map(|i| i + 1)
            .unwrap_or(1);
        let address = self.client.derive_address(index)?;
        let handle = AddressHandle {
            user: user.clone(),
            derivation_index: index,
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
    use cashier_chainio::test_utils::{BalancePoints, TestAccountClient};
    use cashier_chainio::ClientError;
    use cashier_db::Ledger;
    use cashier_primitives::RoundingMode;
    use cashier_tasks::TaskManager;

    fn settings() -> EngineSettings {
        EngineSettings {
            coin: "eth".into(),
            coin_type: "buterin".into(),
            decimals: 9,
            minimum_amount: Amount::from_u64(1_000),
            static_fee: Amount::from_u64(100),
            confirmations: 12,
            rounding: RoundingMode::Truncate,
        }
    }

    fn engine() -> AccountEngine<TestAccountClient> {
        let ledger = Ledger::open_in_memory().unwrap().coin("eth").unwrap();
        AccountEngine::new(settings(), ledger, TestAccountClient::new())
    }

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    fn guard() -> ShutdownGuard {
        TaskManager::new(tokio::runtime::Handle::current())
            .executor()
            .shutdown_guard()
    }

    fn fund_backend(engine: &AccountEngine<TestAccountClient>, units: u64) {
        engine
            .ledger
            .atomic(|tx| tx.set_backend_balance(&Amount::from_u64(units)))
            .unwrap();
    }

    #[tokio::test]
    async fn handles_are_stable_and_hd_derived() {
        let engine = engine();
        let h1 = engine
            .resolve_deposit_handle(&uid("aa"), None)
            .await
            .unwrap();
        assert_eq!(h1.address.as_deref(), Some("hd1"));

        let again = engine
            .resolve_deposit_handle(&uid("aa"), None)
            .await
            .unwrap();
        assert_eq!(again, h1);

        let h2 = engine
            .resolve_deposit_handle(&uid("bb"), None)
            .await
            .unwrap();
        assert_eq!(h2.address.as_deref(), Some("hd2"));
    }

    #[tokio::test]
    async fn settled_balance_is_swept_and_credited() {
        let engine = engine();
        engine
            .resolve_deposit_handle(&uid("aa"), None)
            .await
            .unwrap();
        engine
            .client
            .balances
            .lock()
            .insert("hd1".into(), BalancePoints::settled(Amount::from_u64(50_000)));

        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();

        // Zero gas price in the test client: the full balance sweeps.
        assert_eq!(engine.client.sweeps.lock().as_slice(), &[(1, Amount::from_u64(50_000))]);
        let info = engine.account_info(&uid("aa")).unwrap();
        assert_eq!(info.deposit, "0.000050000");
        assert_eq!(info.withdrawal, "0.000000000");
        assert_eq!(sink.len(), 1);

        // Same chain state again: the balance was swept in reality; emulate
        // by re-polling with the same recorded txid being fresh each sweep,
        // so instead assert the deposit log grew exactly once per sweep.
        assert_eq!(engine.deposits(&uid("aa"), 0).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn in_flight_or_dusty_addresses_are_skipped() {
        let engine = engine();
        engine
            .resolve_deposit_handle(&uid("aa"), None)
            .await
            .unwrap();
        // Pending differs from latest: activity in flight.
        engine.client.balances.lock().insert(
            "hd1".into(),
            BalancePoints {
                pending: Amount::from_u64(99_000),
                latest: Amount::from_u64(50_000),
                confirmed: Amount::from_u64(50_000),
            },
        );
        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();
        assert!(engine.client.sweeps.lock().is_empty());

        // Below the minimum threshold.
        engine
            .client
            .balances
            .lock()
            .insert("hd1".into(), BalancePoints::settled(Amount::from_u64(999)));
        engine.poll_deposits(&mut sink).await.unwrap();
        assert!(engine.client.sweeps.lock().is_empty());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn derivation_mismatch_latches_the_adapter() {
        let engine = engine();
        engine
            .resolve_deposit_handle(&uid("aa"), None)
            .await
            .unwrap();
        *engine.client.derivation_override.lock() = Some((1, "evil".into()));

        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap_err();
        assert!(engine.fault().is_engaged());

        // Mutating calls now short-circuit.
        let err = engine
            .resolve_deposit_handle(&uid("bb"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Faulted(_)));

        // Background passes become no-ops instead of repeating the fault.
        engine.poll_deposits(&mut sink).await.unwrap();
    }

    #[tokio::test]
    async fn chain_rejection_drops_pending_without_latching() {
        let engine = engine();
        fund_backend(&engine, 1_000_000);
        engine
            .client
            .balances
            .lock()
            .insert("hd0".into(), BalancePoints::settled(Amount::from_u64(1_000_000)));
        *engine.client.fail_payment.lock() = Some(ClientError::Rpc {
            code: -32000,
            message: "invalid sender".into(),
        });

        engine
            .schedule_withdrawal(&uid("aa"), "badaddress", "0.000500000", None)
            .await
            .unwrap();

        let mut processed = EventSink::new();
        let mut rejected = EventSink::new();
        engine
            .process_pending(&mut processed, &mut rejected, &guard())
            .await
            .unwrap();

        assert!(engine.pending_payout(&uid("aa")).unwrap().is_none());
        assert!(engine.withdrawals(&uid("aa"), 0).unwrap().is_empty());
        assert_eq!(rejected.len(), 1);
        assert!(processed.is_empty());
        assert!(!engine.fault().is_engaged(), "chain rejection must not latch");
    }

    #[tokio::test]
    async fn transport_failure_during_payout_latches() {
        let engine = engine();
        fund_backend(&engine, 1_000_000);
        engine
            .client
            .balances
            .lock()
            .insert("hd0".into(), BalancePoints::settled(Amount::from_u64(1_000_000)));
        *engine.client.fail_payment.lock() =
            Some(ClientError::Transport("connection refused".into()));

        engine
            .schedule_withdrawal(&uid("aa"), "dest", "0.000500000", None)
            .await
            .unwrap();

        let mut processed = EventSink::new();
        let mut rejected = EventSink::new();
        engine
            .process_pending(&mut processed, &mut rejected, &guard())
            .await
            .unwrap_err();
        assert!(engine.fault().is_engaged());
        // The pending payout stays for the retry after the operator clears.
        assert!(engine.pending_payout(&uid("aa")).unwrap().is_some());
    }

    #[tokio::test]
    async fn successful_payout_commits_and_debits() {
        let engine = engine();
        fund_backend(&engine, 1_000_000);
        engine
            .client
            .balances
            .lock()
            .insert("hd0".into(), BalancePoints::settled(Amount::from_u64(1_000_000)));

        engine
            .schedule_withdrawal(&uid("aa"), "dest", "0.000500000", None)
            .await
            .unwrap();
        let mut processed = EventSink::new();
        let mut rejected = EventSink::new();
        engine
            .process_pending(&mut processed, &mut rejected, &guard())
            .await
            .unwrap();

        // static_fee 100 deducted on the wire, full amount debited.
        assert_eq!(
            engine.client.payments.lock().as_slice(),
            &[("dest".to_owned(), Amount::from_u64(499_900))]
        );
        let info = engine.account_info(&uid("aa")).unwrap();
        assert_eq!(info.withdrawal, "0.000500000");
        assert!(info.pending.is_none());
        assert_eq!(processed.len(), 1);
        assert!(rejected.is_empty());
        assert_eq!(engine.withdrawals(&uid("aa"), 0).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn underfunded_root_defers_the_payout_without_latching() {
        let engine = engine();
        fund_backend(&engine, 1_000_000);
        engine
            .client
            .balances
            .lock()
            .insert("hd0".into(), BalancePoints::settled(Amount::from_u64(100)));

        engine
            .schedule_withdrawal(&uid("aa"), "dest", "0.000500000", None)
            .await
            .unwrap();
        let mut processed = EventSink::new();
        let mut rejected = EventSink::new();
        engine
            .process_pending(&mut processed, &mut rejected, &guard())
            .await
            .unwrap();

        assert!(engine.client.payments.lock().is_empty());
        assert!(engine.pending_payout(&uid("aa")).unwrap().is_some());
        assert!(rejected.is_empty());
        assert!(!engine.fault().is_engaged(), "a shortfall must not latch");

        // Once the root is replenished the retry goes through.
        engine
            .client
            .balances
            .lock()
            .insert("hd0".into(), BalancePoints::settled(Amount::from_u64(1_000_000)));
        engine
            .process_pending(&mut processed, &mut rejected, &guard())
            .await
            .unwrap();
        assert_eq!(processed.len(), 1);
        assert!(engine.pending_payout(&uid("aa")).unwrap().is_none());
    }

    #[tokio::test]
    async fn payout_of_the_full_backing_is_admitted_and_paid() {
        let engine = engine();
        engine
            .client
            .balances
            .lock()
            .insert("hd0".into(), BalancePoints::settled(Amount::from_u64(500_000)));

        // Seed the snapshot through the deposit pass, then withdraw exactly
        // the admitted backing.
        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();
        engine
            .schedule_withdrawal(&uid("aa"), "dest", "0.000500000", None)
            .await
            .unwrap();

        let mut processed = EventSink::new();
        let mut rejected = EventSink::new();
        engine
            .process_pending(&mut processed, &mut rejected, &guard())
            .await
            .unwrap();

        assert_eq!(processed.len(), 1);
        assert!(rejected.is_empty());
        assert_eq!(
            engine.client.payments.lock().as_slice(),
            &[("dest".to_owned(), Amount::from_u64(499_900))]
        );
    }

    #[tokio::test]
    async fn poll_snapshots_root_balance_for_admission() {
        let engine = engine();
        engine
            .client
            .balances
            .lock()
            .insert("hd0".into(), BalancePoints::settled(Amount::from_u64(1_000_000)));

        // Admission is closed before the first pass has seeded the snapshot.
        let err = engine
            .schedule_withdrawal(&uid("aa"), "dest", "0.000500000", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();
        assert_eq!(
            engine.proxy_info().unwrap().backend_balance,
            "0.001000000"
        );

        engine
            .schedule_withdrawal(&uid("aa"), "dest", "0.000500000", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn busy_root_defers_the_whole_pass() {
        let engine = engine();
        fund_backend(&engine, 1_000_000);
        engine
            .client
            .balances
            .lock()
            .insert("hd0".into(), BalancePoints::settled(Amount::from_u64(1_000_000)));
        *engine.client.nonces.lock() = (5, 4);

        engine
            .schedule_withdrawal(&uid("aa"), "dest", "0.000500000", None)
            .await
            .unwrap();
        let mut processed = EventSink::new();
        let mut rejected = EventSink::new();
        engine
            .process_pending(&mut processed, &mut rejected, &guard())
            .await
            .unwrap();

        assert!(engine.client.payments.lock().is_empty());
        assert!(engine.pending_payout(&uid("aa")).unwrap().is_some());
    }

    #[tokio::test]
    async fn withdrawal_to_managed_address_is_refused() {
        let engine = engine();
        fund_backend(&engine, 1_000_000);
        engine
            .resolve_deposit_handle(&uid("aa"), None)
            .await
            .unwrap();

        let err = engine
            .schedule_withdrawal(&uid("bb"), "hd1", "0.000500000", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        let err = engine
            .schedule_withdrawal(&uid("bb"), "hd0", "0.000500000", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
