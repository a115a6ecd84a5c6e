//! The distinction engines.
//!
//! Every configured coin is driven by one engine implementing the
//! [`ChainAdapter`] capability: the uniform surface the request dispatcher
//! and the reconciliation scheduler multiplex over.  The four engines differ
//! only in how an incoming transfer is attributed to a user and how a payout
//! is authored on that chain.

pub mod account;
pub mod adapter;
pub mod errors;
pub mod latch;
pub mod settings;
pub mod sink;
pub mod tag;
pub mod token;
pub mod utxo;

pub use account::AccountEngine;
pub use adapter::{AccountInfo, ChainAdapter, HandleInfo, PendingInfo, ProxyInfo, TxView};
pub use errors::{EngineError, EngineResult, ErrorKind};
pub use latch::FaultLatch;
pub use settings::EngineSettings;
pub use sink::EventSink;
pub use tag::TagEngine;
pub use token::TokenEngine;
pub use utxo::UtxoEngine;
