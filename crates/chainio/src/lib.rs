//! Chain daemon RPC plumbing.
//!
//! The engines consume the capability traits in [`traits`]; everything else
//! here is the concrete transport for the daemons we speak to: a bitcoind
//! wallet, an EVM JSON-RPC endpoint (with local mnemonic signing) and an
//! XRPL server in sign-and-submit mode.

pub mod bitcoind;
pub mod errors;
pub mod evm;
pub mod traits;
pub mod xrpl;

mod jsonrpc;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use errors::{ClientError, ClientResult};
