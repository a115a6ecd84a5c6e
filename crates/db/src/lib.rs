//! Transactional ledger persistence for the cashier.
//!
//! One SQLite handle is shared by every coin plus the process-wide outbox;
//! coin isolation is purely by table-name prefix.  Higher layers speak the
//! small vocabulary exposed by [`CoinLedger`]/[`LedgerTx`] and never reach
//! for raw storage primitives.

pub mod errors;
pub mod ledger;
pub mod outbox;
pub mod types;

mod schema;

pub use errors::{DbError, DbResult};
pub use ledger::{CoinLedger, Ledger, LedgerTx};
pub use outbox::{Outbox, OutboxQueue};
