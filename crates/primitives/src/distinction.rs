use std::fmt;

use serde::{Deserialize, Serialize};

/// The rule by which an incoming chain transfer is attributed to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Distinction {
    /// Per-user HD-derived address on an account-model chain.
    Address,
    /// Shared root address plus a per-user integer destination tag.
    Tag,
    /// Shared root address, attribution by the exact transferred value.
    Amount,
    /// Per-user address handed out by an external UTXO wallet.
    UtxoAddress,
}

impl fmt::Display for Distinction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Distinction::Address => "address",
            Distinction::Tag => "tag",
            Distinction::Amount => "amount",
            Distinction::UtxoAddress => "utxo-address",
        };
        write!(f, "{s}")
    }
}
