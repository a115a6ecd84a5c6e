use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use cashier_primitives::{Amount, AmountError, RoundingMode};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("coin `{0}`: ticker must match [a-z0-9_]{{1,16}}")]
    BadTicker(String),

    #[error("coin `{0}`: duplicate ticker")]
    DuplicateTicker(String),

    #[error("coin `{coin}`: {field} is not a valid decimal: {err}")]
    BadAmount {
        coin: String,
        field: &'static str,
        err: AmountError,
    },

    #[error("coin `{coin}`: backend options do not match coin type `{ty}`")]
    BackendMismatch { coin: String, ty: String },

    #[error("coin `{0}`: erc20 coins need a contract_address")]
    MissingContract(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub rpc_host: String,
    pub rpc_port: u16,
    pub datadir: PathBuf,
}

fn default_tick_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    /// Delay between reconciliation ticks, in seconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoinType {
    Satoshi,
    Buterin,
    Erc20,
    Ripple,
}

impl CoinType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoinType::Satoshi => "satoshi",
            CoinType::Buterin => "buterin",
            CoinType::Erc20 => "erc20",
            CoinType::Ripple => "ripple",
        }
    }
}

/// Backend connection options; the variant must agree with the coin type.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BackendConfig {
    Utxo {
        host: String,
        port: u16,
        username: String,
        password: String,
        unlock_password: Option<String>,
        label: String,
    },
    Evm {
        web3_url: String,
        mnemonic: String,
        gas_units: u64,
        gas_price_wei: Option<String>,
        contract_address: Option<String>,
    },
    Tag {
        backend_url: String,
        passphrase: String,
        root_address: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub coin_type: CoinType,
    pub decimals: u8,
    pub minimum_amount: String,
    pub confirmations: u64,
    pub static_fee: String,
    #[serde(default)]
    pub rounding: RoundingMode,
    pub backend: BackendConfig,
}

impl CoinConfig {
    pub fn minimum_units(&self) -> Result<Amount, ConfigError> {
        self.parse_amount("minimum_amount", &self.minimum_amount)
    }

    pub fn static_fee_units(&self) -> Result<Amount, ConfigError> {
        self.parse_amount("static_fee", &self.static_fee)
    }

    fn parse_amount(&self, field: &'static str, raw: &str) -> Result<Amount, ConfigError> {
        Amount::parse_decimal(raw, self.decimals, self.rounding).map_err(|err| {
            ConfigError::BadAmount {
                coin: self.name.clone(),
                field,
                err,
            }
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub client: ClientConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    pub coins: Vec<CoinConfig>,
}

impl Config {
    pub fn load(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::BTreeSet::new();
        for coin in &self.coins {
            let ok_ticker = !coin.name.is_empty()
                && coin.name.len() <= 16
                && coin
                    .name
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
            if !ok_ticker {
                return Err(ConfigError::BadTicker(coin.name.clone()));
            }
            if !seen.insert(&coin.name) {
                return Err(ConfigError::DuplicateTicker(coin.name.clone()));
            }

            coin.minimum_units()?;
            coin.static_fee_units()?;

            let matches = matches!(
                (&coin.coin_type, &coin.backend),
                (CoinType::Satoshi, BackendConfig::Utxo { .. })
                    | (CoinType::Buterin, BackendConfig::Evm { .. })
                    | (CoinType::Erc20, BackendConfig::Evm { .. })
                    | (CoinType::Ripple, BackendConfig::Tag { .. })
            );
            if !matches {
                return Err(ConfigError::BackendMismatch {
                    coin: coin.name.clone(),
                    ty: coin.coin_type.as_str().to_owned(),
                });
            }
            if coin.coin_type == CoinType::Erc20 {
                if let BackendConfig::Evm {
                    contract_address: None,
                    ..
                } = &coin.backend
                {
                    return Err(ConfigError::MissingContract(coin.name.clone()));
                }
            }
        }
        Ok(())
    }
}
