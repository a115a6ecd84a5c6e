use cashier_primitives::{Amount, RoundingMode};

use crate::errors::{EngineError, EngineResult};

/// Per-coin knobs shared by every engine, all in minimal units.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Ticker, also the storage namespace prefix.
    pub coin: String,
    /// Backend family name exposed through `getProxyInfo`.
    pub coin_type: String,
    pub decimals: u8,
    pub minimum_amount: Amount,
    pub static_fee: Amount,
    pub confirmations: u64,
    pub rounding: RoundingMode,
}

impl EngineSettings {
    /// Parses a caller-supplied decimal literal at this coin's precision.
    pub fn parse_amount(&self, raw: &str) -> EngineResult<Amount> {
        Amount::parse_decimal(raw, self.decimals, self.rounding)
            .map_err(|e| EngineError::InvalidInput(e.to_string()))
    }

    pub fn format_amount(&self, amount: &Amount) -> String {
        amount.format_decimal(self.decimals)
    }
}
