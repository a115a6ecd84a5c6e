use std::path::PathBuf;

use argh::FromArgs;

/// Multi-chain custodial account manager.
#[derive(Debug, Clone, FromArgs)]
pub struct Args {
    /// path to the TOML configuration file
    #[argh(option, short = 'c')]
    pub config: PathBuf,

    /// override the configured RPC host
    #[argh(option)]
    pub rpc_host: Option<String>,

    /// override the configured RPC port
    #[argh(option)]
    pub rpc_port: Option<u16>,

    /// override the configured data directory
    #[argh(option)]
    pub datadir: Option<PathBuf>,
}
