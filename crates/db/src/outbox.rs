//! Process-wide pull-once event queues.
//!
//! Three tables shared across coins.  Reading a queue through one of the
//! drain calls deletes what it returns in the same transaction; a caller
//! that fails to persist what it read loses those records, which is what
//! keeps the outbox bounded.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use cashier_primitives::UserId;

use crate::errors::{DbError, DbResult};
use crate::types::OutboxEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxQueue {
    ProcessedDeposits,
    ProcessedWithdrawals,
    RejectedWithdrawals,
}

impl OutboxQueue {
    fn table(&self) -> &'static str {
        match self {
            OutboxQueue::ProcessedDeposits => "outbox_processed_deposits",
            OutboxQueue::ProcessedWithdrawals => "outbox_processed_withdrawals",
            OutboxQueue::RejectedWithdrawals => "outbox_rejected_withdrawals",
        }
    }
}

#[derive(Clone)]
pub struct Outbox {
    conn: Arc<Mutex<Connection>>,
}

impl Outbox {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Appends one tick's worth of events across all three queues in a
    /// single transaction.
    pub fn append_tick(
        &self,
        deposits: &[OutboxEvent],
        withdrawals: &[OutboxEvent],
        rejections: &[OutboxEvent],
    ) -> DbResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for (queue, events) in [
            (OutboxQueue::ProcessedDeposits, deposits),
            (OutboxQueue::ProcessedWithdrawals, withdrawals),
            (OutboxQueue::RejectedWithdrawals, rejections),
        ] {
            for ev in events {
                tx.execute(
                    &format!(
                        "INSERT INTO {} (coin, user_id, payload) VALUES (?1, ?2, ?3)",
                        queue.table()
                    ),
                    rusqlite::params![ev.coin, ev.user.as_bytes(), ev.payload.to_string()],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Returns and deletes every event of `queue` for `(coin, user)`.
    pub fn drain(&self, queue: OutboxQueue, coin: &str, user: &UserId) -> DbResult<Vec<OutboxEvent>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let events = {
            let mut stmt = tx.prepare(&format!(
                "SELECT user_id, payload FROM {} WHERE coin = ?1 AND user_id = ?2 ORDER BY id",
                queue.table()
            ))?;
            let rows = stmt.query_map(rusqlite::params![coin, user.as_bytes()], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?))
            })?;
            collect_events(coin, rows)?
        };
        tx.execute(
            &format!("DELETE FROM {} WHERE coin = ?1 AND user_id = ?2", queue.table()),
            rusqlite::params![coin, user.as_bytes()],
        )?;
        tx.commit()?;
        Ok(events)
    }

    /// Returns and deletes every event of `queue` for `coin`, all users.
    pub fn drain_all(&self, queue: OutboxQueue, coin: &str) -> DbResult<Vec<OutboxEvent>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let events = {
            let mut stmt = tx.prepare(&format!(
                "SELECT user_id, payload FROM {} WHERE coin = ?1 ORDER BY id",
                queue.table()
            ))?;
            let rows = stmt.query_map(rusqlite::params![coin], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?))
            })?;
            collect_events(coin, rows)?
        };
        tx.execute(
            &format!("DELETE FROM {} WHERE coin = ?1", queue.table()),
            rusqlite::params![coin],
        )?;
        tx.commit()?;
        Ok(events)
    }
}

fn collect_events(
    coin: &str,
    rows: impl Iterator<Item = rusqlite::Result<(Vec<u8>, String)>>,
) -> DbResult<Vec<OutboxEvent>> {
    let mut out = Vec::new();
    for row in rows {
        let (user, payload) = row?;
        let payload = serde_json::from_str(&payload)
            .map_err(|e| DbError::CorruptEntry("outbox", e.to_string()))?;
        out.push(OutboxEvent {
            coin: coin.to_owned(),
            user: UserId::from_bytes(user),
            payload,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Ledger;
    use serde_json::json;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    fn ev(coin: &str, user: &str, txid: &str) -> OutboxEvent {
        OutboxEvent {
            coin: coin.to_owned(),
            user: uid(user),
            payload: json!({ "txid": txid }),
        }
    }

    #[test]
    fn drain_is_exactly_once() {
        let db = Ledger::open_in_memory().unwrap();
        let outbox = db.outbox();

        outbox
            .append_tick(
                &[ev("btc", "aa", "t1"), ev("btc", "aa", "t2"), ev("btc", "bb", "t3")],
                &[],
                &[],
            )
            .unwrap();

        let got = outbox
            .drain(OutboxQueue::ProcessedDeposits, "btc", &uid("aa"))
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].payload, json!({ "txid": "t1" }));

        // A second drain of the same scope is empty.
        let again = outbox
            .drain(OutboxQueue::ProcessedDeposits, "btc", &uid("aa"))
            .unwrap();
        assert!(again.is_empty());

        // Other users' rows were untouched.
        let bb = outbox
            .drain(OutboxQueue::ProcessedDeposits, "btc", &uid("bb"))
            .unwrap();
        assert_eq!(bb.len(), 1);
    }

    #[test]
    fn drain_all_matches_on_coin_only() {
        let db = Ledger::open_in_memory().unwrap();
        let outbox = db.outbox();

        outbox
            .append_tick(&[], &[], &[ev("btc", "aa", "t1"), ev("eth", "bb", "t2")])
            .unwrap();

        let got = outbox
            .drain_all(OutboxQueue::RejectedWithdrawals, "btc")
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].user, uid("aa"));

        // The other coin's queue entry is still there.
        let eth = outbox
            .drain_all(OutboxQueue::RejectedWithdrawals, "eth")
            .unwrap();
        assert_eq!(eth.len(), 1);
    }

    #[test]
    fn queues_are_independent() {
        let db = Ledger::open_in_memory().unwrap();
        let outbox = db.outbox();

        outbox
            .append_tick(&[ev("btc", "aa", "d")], &[ev("btc", "aa", "w")], &[])
            .unwrap();

        assert_eq!(
            outbox
                .drain(OutboxQueue::ProcessedWithdrawals, "btc", &uid("aa"))
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            outbox
                .drain(OutboxQueue::ProcessedDeposits, "btc", &uid("aa"))
                .unwrap()
                .len(),
            1
        );
    }
}
