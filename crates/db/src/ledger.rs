//! The per-coin ledger store.
//!
//! [`Ledger`] owns the process-wide SQLite handle.  [`CoinLedger`] is a
//! cheap per-coin view offering the read vocabulary at any time and the
//! write vocabulary only inside [`CoinLedger::atomic`] scopes: all mutations
//! of one scope commit together or roll back together, with read-your-writes
//! inside the scope.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use cashier_primitives::{Amount, UserId};

use crate::errors::{DbError, DbResult};
use crate::outbox::Outbox;
use crate::schema;
use crate::types::{AddressHandle, AmountHandle, DepositRecord, PendingPayout, TagHandle, Totals, WithdrawalRecord};

#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    /// Opens (or creates) the shared ledger database and the outbox tables.
    pub fn open(path: &Path) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// In-memory instance, used by tests throughout the workspace.
    pub fn open_in_memory() -> DbResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> DbResult<Self> {
        for stmt in schema::OUTBOX_TABLES {
            conn.execute(stmt, [])?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates the coin's tables if needed and returns its ledger view.
    /// The ticker is the table-name prefix and must already be validated by
    /// the configuration layer.
    pub fn coin(&self, ticker: &str) -> DbResult<CoinLedger> {
        {
            let conn = self.conn.lock();
            for stmt in schema::COIN_TABLES {
                conn.execute(&stmt.replace("{c}", ticker), [])?;
            }
        }
        Ok(CoinLedger {
            conn: self.conn.clone(),
            coin: ticker.to_owned(),
        })
    }

    pub fn outbox(&self) -> Outbox {
        Outbox::new(self.conn.clone())
    }
}

#[derive(Clone)]
pub struct CoinLedger {
    conn: Arc<Mutex<Connection>>,
    coin: String,
}

impl CoinLedger {
    pub fn coin(&self) -> &str {
        &self.coin
    }

    /// Runs `f` inside one storage transaction.  Commits on `Ok`, rolls the
    /// whole scope back on `Err`; no partial effects remain after a failure.
    ///
    /// Generic over the error so callers can abort a scope with their own
    /// error type; anything convertible from [`DbError`] works.
    pub fn atomic<T, E>(&self, f: impl FnOnce(&LedgerTx<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<DbError>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(DbError::from)?;
        let ltx = LedgerTx {
            tx,
            coin: &self.coin,
        };
        match f(&ltx) {
            Ok(v) => {
                ltx.tx.commit().map_err(DbError::from)?;
                Ok(v)
            }
            // Dropping the transaction rolls it back.
            Err(e) => Err(e),
        }
    }

    pub fn address_handle(&self, user: &UserId) -> DbResult<Option<AddressHandle>> {
        q::address_handle_by_user(&self.conn.lock(), &self.coin, user)
    }

    pub fn address_handle_by_address(&self, address: &str) -> DbResult<Option<AddressHandle>> {
        q::address_handle_by_address(&self.conn.lock(), &self.coin, address)
    }

    pub fn all_address_handles(&self) -> DbResult<Vec<AddressHandle>> {
        q::all_address_handles(&self.conn.lock(), &self.coin)
    }

    pub fn tag_handle(&self, user: &UserId) -> DbResult<Option<TagHandle>> {
        q::tag_handle_by_user(&self.conn.lock(), &self.coin, user)
    }

    pub fn tag_handle_by_tag(&self, tag: u64) -> DbResult<Option<TagHandle>> {
        q::tag_handle_by_tag(&self.conn.lock(), &self.coin, tag)
    }

    pub fn amount_handle(&self, user: &UserId) -> DbResult<Option<AmountHandle>> {
        q::amount_handle_by_user(&self.conn.lock(), &self.coin, user)
    }

    pub fn amount_handle_by_amount(&self, amount: &Amount) -> DbResult<Option<AmountHandle>> {
        q::amount_handle_by_amount(&self.conn.lock(), &self.coin, amount)
    }

    pub fn deposit_exists(&self, txid: &str) -> DbResult<bool> {
        q::deposit_exists(&self.conn.lock(), &self.coin, txid)
    }

    pub fn withdrawal_exists(&self, txid: &str) -> DbResult<bool> {
        q::withdrawal_exists(&self.conn.lock(), &self.coin, txid)
    }

    pub fn deposits_for(&self, user: &UserId, offset: u64, limit: u64) -> DbResult<Vec<DepositRecord>> {
        q::deposits_for(&self.conn.lock(), &self.coin, user, offset, limit)
    }

    pub fn withdrawals_for(
        &self,
        user: &UserId,
        offset: u64,
        limit: u64,
    ) -> DbResult<Vec<WithdrawalRecord>> {
        q::withdrawals_for(&self.conn.lock(), &self.coin, user, offset, limit)
    }

    pub fn pending_for(&self, user: &UserId) -> DbResult<Option<PendingPayout>> {
        q::pending_for(&self.conn.lock(), &self.coin, user)
    }

    pub fn all_pending(&self) -> DbResult<Vec<PendingPayout>> {
        q::all_pending(&self.conn.lock(), &self.coin)
    }

    pub fn pending_sum(&self) -> DbResult<Amount> {
        q::pending_sum(&self.conn.lock(), &self.coin)
    }

    pub fn account_totals(&self, user: &UserId) -> DbResult<Option<Totals>> {
        q::account_totals(&self.conn.lock(), &self.coin, user)
    }

    pub fn global_totals(&self) -> DbResult<Totals> {
        q::global_totals(&self.conn.lock(), &self.coin)
    }

    pub fn backend_balance(&self) -> DbResult<Amount> {
        q::backend_balance(&self.conn.lock(), &self.coin)
    }

    pub fn block_processed(&self, height: u64) -> DbResult<bool> {
        q::block_processed(&self.conn.lock(), &self.coin, height)
    }

    pub fn block_processed_hash(&self, hash: &str) -> DbResult<bool> {
        q::block_processed_hash(&self.conn.lock(), &self.coin, hash)
    }

    pub fn watermark_height(&self) -> DbResult<Option<u64>> {
        q::watermark_height(&self.conn.lock(), &self.coin)
    }

    pub fn top_derivation_index(&self) -> DbResult<Option<u32>> {
        q::top_derivation_index(&self.conn.lock(), &self.coin)
    }

    pub fn top_tag(&self) -> DbResult<Option<u64>> {
        q::top_tag(&self.conn.lock(), &self.coin)
    }
}

/// A live atomic scope over one coin's tables.  Offers the same reads as
/// [`CoinLedger`] (observing in-scope writes) plus every write operation.
pub struct LedgerTx<'a> {
    tx: rusqlite::Transaction<'a>,
    coin: &'a str,
}

impl LedgerTx<'_> {
    pub fn address_handle(&self, user: &UserId) -> DbResult<Option<AddressHandle>> {
        q::address_handle_by_user(&self.tx, self.coin, user)
    }

    pub fn tag_handle(&self, user: &UserId) -> DbResult<Option<TagHandle>> {
        q::tag_handle_by_user(&self.tx, self.coin, user)
    }

    pub fn amount_handle(&self, user: &UserId) -> DbResult<Option<AmountHandle>> {
        q::amount_handle_by_user(&self.tx, self.coin, user)
    }

    pub fn amount_handle_by_amount(&self, amount: &Amount) -> DbResult<Option<AmountHandle>> {
        q::amount_handle_by_amount(&self.tx, self.coin, amount)
    }

    pub fn deposit_exists(&self, txid: &str) -> DbResult<bool> {
        q::deposit_exists(&self.tx, self.coin, txid)
    }

    pub fn pending_for(&self, user: &UserId) -> DbResult<Option<PendingPayout>> {
        q::pending_for(&self.tx, self.coin, user)
    }

    pub fn pending_sum(&self) -> DbResult<Amount> {
        q::pending_sum(&self.tx, self.coin)
    }

    pub fn backend_balance(&self) -> DbResult<Amount> {
        q::backend_balance(&self.tx, self.coin)
    }

    pub fn top_derivation_index(&self) -> DbResult<Option<u32>> {
        q::top_derivation_index(&self.tx, self.coin)
    }

    pub fn top_tag(&self) -> DbResult<Option<u64>> {
        q::top_tag(&self.tx, self.coin)
    }

    pub fn insert_address_handle(&self, handle: &AddressHandle) -> DbResult<()> {
        self.tx.execute(
            &t(self.coin, "INSERT INTO {c}_address_handles (user_id, derivation_index, address) VALUES (?1, ?2, ?3)"),
            rusqlite::params![handle.user.as_bytes(), handle.derivation_index, handle.address],
        )?;
        Ok(())
    }

    pub fn insert_tag_handle(&self, handle: &TagHandle) -> DbResult<()> {
        self.tx.execute(
            &t(self.coin, "INSERT INTO {c}_tag_handles (user_id, tag) VALUES (?1, ?2)"),
            rusqlite::params![handle.user.as_bytes(), handle.tag],
        )?;
        Ok(())
    }

    pub fn insert_amount_handle(&self, handle: &AmountHandle) -> DbResult<()> {
        self.tx.execute(
            &t(self.coin, "INSERT INTO {c}_amount_handles (user_id, amount) VALUES (?1, ?2)"),
            rusqlite::params![handle.user.as_bytes(), handle.amount.to_string()],
        )?;
        Ok(())
    }

    /// Removes the user's amount handle, returning whether one was present.
    pub fn delete_amount_handle(&self, user: &UserId) -> DbResult<bool> {
        let n = self.tx.execute(
            &t(self.coin, "DELETE FROM {c}_amount_handles WHERE user_id = ?1"),
            rusqlite::params![user.as_bytes()],
        )?;
        Ok(n > 0)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_deposit(
        &self,
        user: &UserId,
        amount: &Amount,
        txid: &str,
        vout: Option<u32>,
        block_hash: Option<&str>,
        block_height: u64,
        block_time: u64,
    ) -> DbResult<i64> {
        self.tx.execute(
            &t(self.coin, "INSERT INTO {c}_deposits (user_id, amount, txid, vout, block_hash, block_height, block_time) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            rusqlite::params![
                user.as_bytes(),
                amount.to_string(),
                txid,
                vout,
                block_hash,
                block_height,
                block_time
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_withdrawal(
        &self,
        user: &UserId,
        amount: &Amount,
        txid: &str,
        block_hash: Option<&str>,
        block_height: Option<u64>,
        address: &str,
        created_at: u64,
    ) -> DbResult<i64> {
        self.tx.execute(
            &t(self.coin, "INSERT INTO {c}_withdrawals (user_id, amount, txid, block_hash, block_height, address, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            rusqlite::params![
                user.as_bytes(),
                amount.to_string(),
                txid,
                block_hash,
                block_height,
                address,
                created_at
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn insert_pending(&self, payout: &PendingPayout) -> DbResult<()> {
        self.tx.execute(
            &t(self.coin, "INSERT INTO {c}_pending_payouts (user_id, amount, address, tag) VALUES (?1, ?2, ?3, ?4)"),
            rusqlite::params![
                payout.user.as_bytes(),
                payout.amount.to_string(),
                payout.address,
                payout.tag
            ],
        )?;
        Ok(())
    }

    pub fn delete_pending(&self, user: &UserId) -> DbResult<bool> {
        let n = self.tx.execute(
            &t(self.coin, "DELETE FROM {c}_pending_payouts WHERE user_id = ?1"),
            rusqlite::params![user.as_bytes()],
        )?;
        Ok(n > 0)
    }

    /// Credits the user's cumulative totals, creating the row on first use.
    pub fn add_account_totals(&self, user: &UserId, deposit: &Amount, withdrawal: &Amount) -> DbResult<()> {
        let cur = q::account_totals(&self.tx, self.coin, user)?.unwrap_or_default();
        let next_d = cur.deposit + deposit;
        let next_w = cur.withdrawal + withdrawal;
        let n = self.tx.execute(
            &t(self.coin, "UPDATE {c}_account_totals SET deposit_total = ?2, withdrawal_total = ?3 WHERE user_id = ?1"),
            rusqlite::params![user.as_bytes(), next_d.to_string(), next_w.to_string()],
        )?;
        if n == 0 {
            self.tx.execute(
                &t(self.coin, "INSERT INTO {c}_account_totals (user_id, deposit_total, withdrawal_total) VALUES (?1, ?2, ?3) ON CONFLICT (user_id) DO NOTHING"),
                rusqlite::params![user.as_bytes(), next_d.to_string(), next_w.to_string()],
            )?;
        }
        Ok(())
    }

    pub fn add_global_totals(&self, deposit: &Amount, withdrawal: &Amount) -> DbResult<()> {
        let cur = q::global_totals(&self.tx, self.coin)?;
        let next_d = cur.deposit + deposit;
        let next_w = cur.withdrawal + withdrawal;
        let n = self.tx.execute(
            &t(self.coin, "UPDATE {c}_global_totals SET deposit_total = ?1, withdrawal_total = ?2 WHERE id = 0"),
            rusqlite::params![next_d.to_string(), next_w.to_string()],
        )?;
        if n == 0 {
            self.tx.execute(
                &t(self.coin, "INSERT INTO {c}_global_totals (id, deposit_total, withdrawal_total) VALUES (0, ?1, ?2) ON CONFLICT (id) DO NOTHING"),
                rusqlite::params![next_d.to_string(), next_w.to_string()],
            )?;
        }
        Ok(())
    }

    pub fn set_backend_balance(&self, balance: &Amount) -> DbResult<()> {
        self.tx.execute(
            &t(self.coin, "INSERT INTO {c}_backend_balance (id, balance) VALUES (0, ?1) ON CONFLICT (id) DO UPDATE SET balance = excluded.balance"),
            rusqlite::params![balance.to_string()],
        )?;
        Ok(())
    }

    pub fn record_processed_block(&self, height: u64, hash: Option<&str>) -> DbResult<()> {
        self.tx.execute(
            &t(self.coin, "INSERT INTO {c}_processed_blocks (height, block_hash) VALUES (?1, ?2) ON CONFLICT (height) DO NOTHING"),
            rusqlite::params![height, hash],
        )?;
        Ok(())
    }
}

fn t(coin: &str, stmt: &str) -> String {
    stmt.replace("{c}", coin)
}

/// Raw row access shared by the out-of-scope and in-scope views.
mod q {
    use rusqlite::{Connection, OptionalExtension};

    use cashier_primitives::{Amount, UserId};

    use super::t;
    use crate::errors::{DbError, DbResult};
    use crate::types::{AddressHandle, AmountHandle, DepositRecord, PendingPayout, TagHandle, Totals, WithdrawalRecord};

    fn amt(col: &'static str, s: String) -> DbResult<Amount> {
        Amount::from_dec_str(&s).map_err(|_| DbError::CorruptEntry(col, s))
    }

    pub(super) fn address_handle_by_user(
        conn: &Connection,
        coin: &str,
        user: &UserId,
    ) -> DbResult<Option<AddressHandle>> {
        let row = conn
            .query_row(
                &t(coin, "SELECT derivation_index, address FROM {c}_address_handles WHERE user_id = ?1"),
                rusqlite::params![user.as_bytes()],
                |row| Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(derivation_index, address)| AddressHandle {
            user: user.clone(),
            derivation_index,
            address,
        }))
    }

    pub(super) fn address_handle_by_address(
        conn: &Connection,
        coin: &str,
        address: &str,
    ) -> DbResult<Option<AddressHandle>> {
        let row = conn
            .query_row(
                &t(coin, "SELECT user_id, derivation_index, address FROM {c}_address_handles WHERE address = ?1"),
                rusqlite::params![address],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(user, derivation_index, address)| AddressHandle {
            user: UserId::from_bytes(user),
            derivation_index,
            address,
        }))
    }

    pub(super) fn all_address_handles(conn: &Connection, coin: &str) -> DbResult<Vec<AddressHandle>> {
        let mut stmt = conn.prepare(&t(
            coin,
            "SELECT user_id, derivation_index, address FROM {c}_address_handles ORDER BY derivation_index, address",
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (user, derivation_index, address) = row?;
            out.push(AddressHandle {
                user: UserId::from_bytes(user),
                derivation_index,
                address,
            });
        }
        Ok(out)
    }

    pub(super) fn tag_handle_by_user(
        conn: &Connection,
        coin: &str,
        user: &UserId,
    ) -> DbResult<Option<TagHandle>> {
        let tag = conn
            .query_row(
                &t(coin, "SELECT tag FROM {c}_tag_handles WHERE user_id = ?1"),
                rusqlite::params![user.as_bytes()],
                |row| row.get::<_, u64>(0),
            )
            .optional()?;
        Ok(tag.map(|tag| TagHandle {
            user: user.clone(),
            tag,
        }))
    }

    pub(super) fn tag_handle_by_tag(conn: &Connection, coin: &str, tag: u64) -> DbResult<Option<TagHandle>> {
        let user = conn
            .query_row(
                &t(coin, "SELECT user_id FROM {c}_tag_handles WHERE tag = ?1"),
                rusqlite::params![tag],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(user.map(|user| TagHandle {
            user: UserId::from_bytes(user),
            tag,
        }))
    }

    pub(super) fn amount_handle_by_user(
        conn: &Connection,
        coin: &str,
        user: &UserId,
    ) -> DbResult<Option<AmountHandle>> {
        let raw = conn
            .query_row(
                &t(coin, "SELECT amount FROM {c}_amount_handles WHERE user_id = ?1"),
                rusqlite::params![user.as_bytes()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match raw {
            Some(s) => Ok(Some(AmountHandle {
                user: user.clone(),
                amount: amt("amount_handle", s)?,
            })),
            None => Ok(None),
        }
    }

    pub(super) fn amount_handle_by_amount(
        conn: &Connection,
        coin: &str,
        amount: &Amount,
    ) -> DbResult<Option<AmountHandle>> {
        let user = conn
            .query_row(
                &t(coin, "SELECT user_id FROM {c}_amount_handles WHERE amount = ?1"),
                rusqlite::params![amount.to_string()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(user.map(|user| AmountHandle {
            user: UserId::from_bytes(user),
            amount: amount.clone(),
        }))
    }

    pub(super) fn deposit_exists(conn: &Connection, coin: &str, txid: &str) -> DbResult<bool> {
        let found = conn
            .query_row(
                &t(coin, "SELECT 1 FROM {c}_deposits WHERE txid = ?1"),
                rusqlite::params![txid],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub(super) fn withdrawal_exists(conn: &Connection, coin: &str, txid: &str) -> DbResult<bool> {
        let found = conn
            .query_row(
                &t(coin, "SELECT 1 FROM {c}_withdrawals WHERE txid = ?1"),
                rusqlite::params![txid],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub(super) fn deposits_for(
        conn: &Connection,
        coin: &str,
        user: &UserId,
        offset: u64,
        limit: u64,
    ) -> DbResult<Vec<DepositRecord>> {
        let mut stmt = conn.prepare(&t(
            coin,
            "SELECT entry_id, amount, txid, vout, block_hash, block_height, block_time \
             FROM {c}_deposits WHERE user_id = ?1 ORDER BY entry_id DESC LIMIT ?3 OFFSET ?2",
        ))?;
        let rows = stmt.query_map(rusqlite::params![user.as_bytes(), offset, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<u32>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, u64>(5)?,
                row.get::<_, u64>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (entry_id, amount, txid, vout, block_hash, block_height, block_time) = row?;
            out.push(DepositRecord {
                entry_id,
                user: user.clone(),
                amount: amt("deposit", amount)?,
                txid,
                vout,
                block_hash,
                block_height,
                block_time,
            });
        }
        Ok(out)
    }

    pub(super) fn withdrawals_for(
        conn: &Connection,
        coin: &str,
        user: &UserId,
        offset: u64,
        limit: u64,
    ) -> DbResult<Vec<WithdrawalRecord>> {
        let mut stmt = conn.prepare(&t(
            coin,
            "SELECT entry_id, amount, txid, block_hash, block_height, address, created_at \
             FROM {c}_withdrawals WHERE user_id = ?1 ORDER BY entry_id DESC LIMIT ?3 OFFSET ?2",
        ))?;
        let rows = stmt.query_map(rusqlite::params![user.as_bytes(), offset, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<u64>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, u64>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (entry_id, amount, txid, block_hash, block_height, address, created_at) = row?;
            out.push(WithdrawalRecord {
                entry_id,
                user: user.clone(),
                amount: amt("withdrawal", amount)?,
                txid,
                block_hash,
                block_height,
                address,
                created_at,
            });
        }
        Ok(out)
    }

    fn pending_from_row(user: Vec<u8>, amount: String, address: String, tag: Option<u64>) -> DbResult<PendingPayout> {
        Ok(PendingPayout {
            user: UserId::from_bytes(user),
            amount: amt("pending_payout", amount)?,
            address,
            tag,
        })
    }

    pub(super) fn pending_for(conn: &Connection, coin: &str, user: &UserId) -> DbResult<Option<PendingPayout>> {
        let row = conn
            .query_row(
                &t(coin, "SELECT amount, address, tag FROM {c}_pending_payouts WHERE user_id = ?1"),
                rusqlite::params![user.as_bytes()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<u64>>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((amount, address, tag)) => {
                Ok(Some(pending_from_row(user.as_bytes().to_vec(), amount, address, tag)?))
            }
            None => Ok(None),
        }
    }

    pub(super) fn all_pending(conn: &Connection, coin: &str) -> DbResult<Vec<PendingPayout>> {
        let mut stmt = conn.prepare(&t(
            coin,
            "SELECT user_id, amount, address, tag FROM {c}_pending_payouts ORDER BY rowid",
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<u64>>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (user, amount, address, tag) = row?;
            out.push(pending_from_row(user, amount, address, tag)?);
        }
        Ok(out)
    }

    pub(super) fn pending_sum(conn: &Connection, coin: &str) -> DbResult<Amount> {
        let mut stmt = conn.prepare(&t(coin, "SELECT amount FROM {c}_pending_payouts"))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut sum = Amount::zero();
        for row in rows {
            sum = sum + &amt("pending_payout", row?)?;
        }
        Ok(sum)
    }

    pub(super) fn account_totals(conn: &Connection, coin: &str, user: &UserId) -> DbResult<Option<Totals>> {
        let row = conn
            .query_row(
                &t(coin, "SELECT deposit_total, withdrawal_total FROM {c}_account_totals WHERE user_id = ?1"),
                rusqlite::params![user.as_bytes()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        match row {
            Some((d, w)) => Ok(Some(Totals {
                deposit: amt("account_totals", d)?,
                withdrawal: amt("account_totals", w)?,
            })),
            None => Ok(None),
        }
    }

    pub(super) fn global_totals(conn: &Connection, coin: &str) -> DbResult<Totals> {
        let row = conn
            .query_row(
                &t(coin, "SELECT deposit_total, withdrawal_total FROM {c}_global_totals WHERE id = 0"),
                [],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        match row {
            Some((d, w)) => Ok(Totals {
                deposit: amt("global_totals", d)?,
                withdrawal: amt("global_totals", w)?,
            }),
            None => Ok(Totals::default()),
        }
    }

    pub(super) fn backend_balance(conn: &Connection, coin: &str) -> DbResult<Amount> {
        let raw = conn
            .query_row(
                &t(coin, "SELECT balance FROM {c}_backend_balance WHERE id = 0"),
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match raw {
            Some(s) => amt("backend_balance", s),
            None => Ok(Amount::zero()),
        }
    }

    pub(super) fn block_processed(conn: &Connection, coin: &str, height: u64) -> DbResult<bool> {
        let found = conn
            .query_row(
                &t(coin, "SELECT 1 FROM {c}_processed_blocks WHERE height = ?1"),
                rusqlite::params![height],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub(super) fn block_processed_hash(conn: &Connection, coin: &str, hash: &str) -> DbResult<bool> {
        let found = conn
            .query_row(
                &t(coin, "SELECT 1 FROM {c}_processed_blocks WHERE block_hash = ?1"),
                rusqlite::params![hash],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub(super) fn watermark_height(conn: &Connection, coin: &str) -> DbResult<Option<u64>> {
        let h = conn
            .query_row(
                &t(coin, "SELECT MAX(height) FROM {c}_processed_blocks"),
                [],
                |row| row.get::<_, Option<u64>>(0),
            )
            .optional()?;
        Ok(h.flatten())
    }

    pub(super) fn top_derivation_index(conn: &Connection, coin: &str) -> DbResult<Option<u32>> {
        let idx = conn
            .query_row(
                &t(coin, "SELECT MAX(derivation_index) FROM {c}_address_handles"),
                [],
                |row| row.get::<_, Option<u32>>(0),
            )
            .optional()?;
        Ok(idx.flatten())
    }

    pub(super) fn top_tag(conn: &Connection, coin: &str) -> DbResult<Option<u64>> {
        let tag = conn
            .query_row(&t(coin, "SELECT MAX(tag) FROM {c}_tag_handles"), [], |row| {
                row.get::<_, Option<u64>>(0)
            })
            .optional()?;
        Ok(tag.flatten())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{AddressHandle, AmountHandle, PendingPayout, TagHandle};
    use cashier_primitives::{Amount, UserId};

    fn coin() -> CoinLedger {
        Ledger::open_in_memory().unwrap().coin("btc").unwrap()
    }

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    #[test]
    fn address_handles_are_unique_per_user_and_address() {
        let l = coin();
        let h = AddressHandle {
            user: uid("aa"),
            derivation_index: 1,
            address: "addr1".into(),
        };
        l.atomic(|tx| tx.insert_address_handle(&h)).unwrap();

        assert_eq!(l.address_handle(&uid("aa")).unwrap(), Some(h.clone()));
        assert_eq!(l.address_handle_by_address("addr1").unwrap(), Some(h));
        assert_eq!(l.address_handle(&uid("bb")).unwrap(), None);
        assert_eq!(l.top_derivation_index().unwrap(), Some(1));

        // Same user again.
        let dup = AddressHandle {
            user: uid("aa"),
            derivation_index: 2,
            address: "addr2".into(),
        };
        assert!(l.atomic(|tx| tx.insert_address_handle(&dup)).is_err());

        // Same address for another user.
        let dup = AddressHandle {
            user: uid("bb"),
            derivation_index: 2,
            address: "addr1".into(),
        };
        assert!(l.atomic(|tx| tx.insert_address_handle(&dup)).is_err());
    }

    #[test]
    fn amount_handles_enforce_distinct_values() {
        let l = coin();
        let h = AmountHandle {
            user: uid("aa"),
            amount: Amount::from_u64(1_000_000),
        };
        l.atomic(|tx| tx.insert_amount_handle(&h)).unwrap();

        let clash = AmountHandle {
            user: uid("bb"),
            amount: Amount::from_u64(1_000_000),
        };
        assert!(l.atomic(|tx| tx.insert_amount_handle(&clash)).is_err());

        assert_eq!(
            l.amount_handle_by_amount(&Amount::from_u64(1_000_000))
                .unwrap()
                .unwrap()
                .user,
            uid("aa")
        );

        assert!(l.atomic(|tx| tx.delete_amount_handle(&uid("aa"))).unwrap());
        assert_eq!(l.amount_handle(&uid("aa")).unwrap(), None);
        // Value freed for reuse.
        l.atomic(|tx| tx.insert_amount_handle(&clash)).unwrap();
    }

    #[test]
    fn deposit_txids_are_unique_per_coin() {
        let l = coin();
        let amt = Amount::from_u64(5_000);
        l.atomic(|tx| tx.insert_deposit(&uid("aa"), &amt, "t1", Some(0), Some("b1"), 10, 1000))
            .unwrap();
        assert!(l.deposit_exists("t1").unwrap());
        assert!(!l.deposit_exists("t2").unwrap());

        let dup = l.atomic(|tx| tx.insert_deposit(&uid("bb"), &amt, "t1", None, None, 11, 1001));
        assert!(dup.is_err(), "duplicate txid must be rejected");

        // The withdrawal log is a separate namespace; the same txid is fine.
        l.atomic(|tx| tx.insert_withdrawal(&uid("aa"), &amt, "t1", None, None, "dest", 1002))
            .unwrap();
        assert!(l.withdrawal_exists("t1").unwrap());
    }

    #[test]
    fn totals_upsert_accumulates() {
        let l = coin();
        let d = Amount::from_u64(70);
        let w = Amount::from_u64(0);
        l.atomic(|tx| {
            tx.add_account_totals(&uid("aa"), &d, &w)?;
            tx.add_global_totals(&d, &w)
        })
        .unwrap();
        l.atomic(|tx| {
            tx.add_account_totals(&uid("aa"), &d, &Amount::from_u64(30))?;
            tx.add_global_totals(&d, &Amount::from_u64(30))
        })
        .unwrap();

        let at = l.account_totals(&uid("aa")).unwrap().unwrap();
        assert_eq!(at.deposit, Amount::from_u64(140));
        assert_eq!(at.withdrawal, Amount::from_u64(30));
        assert_eq!(l.global_totals().unwrap(), at);
        assert_eq!(l.account_totals(&uid("bb")).unwrap(), None);
    }

    #[test]
    fn one_pending_payout_per_user() {
        let l = coin();
        let p = PendingPayout {
            user: uid("aa"),
            amount: Amount::from_u64(900),
            address: "dest".into(),
            tag: None,
        };
        l.atomic(|tx| tx.insert_pending(&p)).unwrap();
        assert!(l.atomic(|tx| tx.insert_pending(&p)).is_err());

        let other = PendingPayout {
            user: uid("bb"),
            amount: Amount::from_u64(100),
            address: "dest2".into(),
            tag: Some(7),
        };
        l.atomic(|tx| tx.insert_pending(&other)).unwrap();

        assert_eq!(l.pending_sum().unwrap(), Amount::from_u64(1_000));
        assert_eq!(l.all_pending().unwrap().len(), 2);
        assert_eq!(l.pending_for(&uid("bb")).unwrap(), Some(other));

        assert!(l.atomic(|tx| tx.delete_pending(&uid("aa"))).unwrap());
        assert!(!l.atomic(|tx| tx.delete_pending(&uid("aa"))).unwrap());
        assert_eq!(l.pending_sum().unwrap(), Amount::from_u64(100));
    }

    #[test]
    fn atomic_rolls_back_on_error() {
        let l = coin();
        let res: DbResult<()> = l.atomic(|tx| {
            tx.insert_deposit(&uid("aa"), &Amount::from_u64(1), "t1", None, None, 1, 1)?;
            assert!(tx.deposit_exists("t1")?, "read-your-writes inside scope");
            Err(crate::DbError::Other("boom".into()))
        });
        assert!(res.is_err());
        assert!(!l.deposit_exists("t1").unwrap(), "rollback must undo insert");
    }

    #[test]
    fn watermark_is_monotone() {
        let l = coin();
        assert_eq!(l.watermark_height().unwrap(), None);
        l.atomic(|tx| tx.record_processed_block(5, Some("h5"))).unwrap();
        l.atomic(|tx| tx.record_processed_block(3, Some("h3"))).unwrap();
        // Recording an already-seen block is a no-op, not an error.
        l.atomic(|tx| tx.record_processed_block(5, Some("h5"))).unwrap();

        assert_eq!(l.watermark_height().unwrap(), Some(5));
        assert!(l.block_processed(3).unwrap());
        assert!(l.block_processed_hash("h5").unwrap());
        assert!(!l.block_processed(4).unwrap());
    }

    #[test]
    fn paged_listings_are_newest_first() {
        let l = coin();
        for i in 0..15u64 {
            let a = Amount::from_u64(i + 1);
            l.atomic(|tx| tx.insert_deposit(&uid("aa"), &a, &format!("t{i}"), None, None, i, i))
                .unwrap();
        }
        let page = l.deposits_for(&uid("aa"), 0, 10).unwrap();
        assert_eq!(page.len(), 10);
        assert_eq!(page[0].txid, "t14");
        let page = l.deposits_for(&uid("aa"), 10, 10).unwrap();
        assert_eq!(page.len(), 5);
        assert_eq!(page[0].txid, "t4");
    }

    #[test]
    fn coins_are_isolated_namespaces() {
        let db = Ledger::open_in_memory().unwrap();
        let btc = db.coin("btc").unwrap();
        let eth = db.coin("eth").unwrap();
        let amt = Amount::from_u64(1);
        btc.atomic(|tx| tx.insert_deposit(&uid("aa"), &amt, "t1", None, None, 1, 1))
            .unwrap();
        assert!(btc.deposit_exists("t1").unwrap());
        assert!(!eth.deposit_exists("t1").unwrap());
        // Same txid on another coin is a fresh row.
        eth.atomic(|tx| tx.insert_deposit(&uid("aa"), &amt, "t1", None, None, 1, 1))
            .unwrap();
    }

    #[test]
    fn tag_handles_allocate_monotonically() {
        let l = coin();
        assert_eq!(l.top_tag().unwrap(), None);
        l.atomic(|tx| {
            tx.insert_tag_handle(&TagHandle {
                user: uid("aa"),
                tag: 1,
            })
        })
        .unwrap();
        l.atomic(|tx| {
            tx.insert_tag_handle(&TagHandle {
                user: uid("bb"),
                tag: 2,
            })
        })
        .unwrap();
        assert_eq!(l.top_tag().unwrap(), Some(2));
        assert_eq!(l.tag_handle_by_tag(2).unwrap().unwrap().user, uid("bb"));
        assert!(l
            .atomic(|tx| {
                tx.insert_tag_handle(&TagHandle {
                    user: uid("cc"),
                    tag: 2,
                })
            })
            .is_err());
    }
}
