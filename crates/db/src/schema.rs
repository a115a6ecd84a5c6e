//! Table definitions.  `{c}` is substituted with the coin ticker.

pub(crate) const COIN_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS {c}_address_handles (
        user_id BLOB NOT NULL UNIQUE,
        derivation_index INTEGER NOT NULL,
        address TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS {c}_tag_handles (
        user_id BLOB NOT NULL UNIQUE,
        tag INTEGER NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS {c}_amount_handles (
        user_id BLOB NOT NULL UNIQUE,
        amount TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS {c}_deposits (
        entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id BLOB NOT NULL,
        amount TEXT NOT NULL,
        txid TEXT NOT NULL UNIQUE,
        vout INTEGER,
        block_hash TEXT,
        block_height INTEGER NOT NULL,
        block_time INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS {c}_withdrawals (
        entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id BLOB NOT NULL,
        amount TEXT NOT NULL,
        txid TEXT NOT NULL UNIQUE,
        block_hash TEXT,
        block_height INTEGER,
        address TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS {c}_pending_payouts (
        user_id BLOB NOT NULL PRIMARY KEY,
        amount TEXT NOT NULL,
        address TEXT NOT NULL,
        tag INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS {c}_account_totals (
        user_id BLOB NOT NULL PRIMARY KEY,
        deposit_total TEXT NOT NULL,
        withdrawal_total TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS {c}_global_totals (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        deposit_total TEXT NOT NULL,
        withdrawal_total TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS {c}_backend_balance (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        balance TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS {c}_processed_blocks (
        height INTEGER NOT NULL PRIMARY KEY,
        block_hash TEXT
    )",
];

pub(crate) const OUTBOX_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS outbox_processed_deposits (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        coin TEXT NOT NULL,
        user_id BLOB NOT NULL,
        payload TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS outbox_processed_withdrawals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        coin TEXT NOT NULL,
        user_id BLOB NOT NULL,
        payload TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS outbox_rejected_withdrawals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        coin TEXT NOT NULL,
        user_id BLOB NOT NULL,
        payload TEXT NOT NULL
    )",
];
