use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use jsonrpsee::Methods;
use tokio::sync::oneshot;
use tracing::*;

use cashier_chainio::bitcoind::{BitcoindClient, BitcoindConfig};
use cashier_chainio::evm::{Erc20Client, EvmClient, EvmConfig};
use cashier_chainio::xrpl::{XrplClient, XrplConfig};
use cashier_common::logging;
use cashier_config::{BackendConfig, CoinConfig, CoinType, Config};
use cashier_db::{Ledger, Outbox};
use cashier_engines::{
    AccountEngine, ChainAdapter, EngineSettings, TagEngine, TokenEngine, UtxoEngine,
};
use cashier_primitives::Amount;
use cashier_reconciler::reconciler_task;
use cashier_rpc_api::{CashierAdminApiServer, CashierApiServer};
use cashier_tasks::{ShutdownSignal, TaskManager};

use crate::args::Args;
use crate::errors::InitError;

mod args;
mod errors;
mod rpc_server;

const LEDGER_DB_NAME: &str = "cashier.db";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();
    if let Err(e) = main_inner(args) {
        eprintln!("FATAL ERROR: {e}");
        return Err(e);
    }
    Ok(())
}

fn main_inner(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;

    // Init the task manager and logging before anything else.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("cashier-rt")
        .build()
        .expect("init: build rt");
    let task_manager = TaskManager::new(runtime.handle().clone());
    let executor = task_manager.executor();

    init_logging();

    std::fs::create_dir_all(&config.client.datadir).map_err(InitError::Io)?;
    let ledger = Ledger::open(&config.client.datadir.join(LEDGER_DB_NAME))
        .map_err(InitError::Db)?;

    // Chain clients probe their endpoints at construction time.
    let adapters = executor
        .handle()
        .block_on(build_adapters(&config, &ledger))?;
    let adapter_map: BTreeMap<String, Arc<dyn ChainAdapter>> = adapters
        .iter()
        .map(|a| (a.coin().to_owned(), a.clone()))
        .collect();

    info!(coins = adapters.len(), "init finished, starting main tasks");

    executor.spawn_critical_async(
        "reconciler",
        reconciler_task(
            executor.shutdown_guard(),
            Arc::new(adapters),
            ledger.outbox(),
            Duration::from_secs(config.reconciler.tick_interval_secs),
        ),
    );

    executor.spawn_critical_async(
        "main-rpc",
        start_rpc(
            adapter_map,
            ledger.outbox(),
            task_manager.shutdown_signal(),
            config.client.rpc_host.clone(),
            config.client.rpc_port,
        ),
    );

    task_manager.start_signal_listeners();
    task_manager.monitor(Some(SHUTDOWN_GRACE))?;

    logging::finalize();
    info!("exiting");
    Ok(())
}

fn load_config(args: &Args) -> Result<Config, InitError> {
    let raw = std::fs::read_to_string(&args.config)?;
    let mut config = Config::load(&raw)?;
    if let Some(host) = &args.rpc_host {
        config.client.rpc_host = host.clone();
    }
    if let Some(port) = args.rpc_port {
        config.client.rpc_port = port;
    }
    if let Some(datadir) = &args.datadir {
        config.client.datadir = datadir.clone();
    }
    Ok(config)
}

fn init_logging() {
    logging::init(logging::LoggerConfig::with_base_name("cashierd"));
}

fn engine_settings(coin: &CoinConfig) -> Result<EngineSettings, InitError> {
    Ok(EngineSettings {
        coin: coin.name.clone(),
        coin_type: coin.coin_type.as_str().to_owned(),
        decimals: coin.decimals,
        minimum_amount: coin.minimum_units()?,
        static_fee: coin.static_fee_units()?,
        confirmations: coin.confirmations,
        rounding: coin.rounding,
    })
}

/// Builds one adapter per configured coin, in registration order.
async fn build_adapters(
    config: &Config,
    ledger: &Ledger,
) -> Result<Vec<Arc<dyn ChainAdapter>>, InitError> {
    let mut adapters: Vec<Arc<dyn ChainAdapter>> = Vec::with_capacity(config.coins.len());
    for coin in &config.coins {
        let settings = engine_settings(coin)?;
        let coin_ledger = ledger.coin(&coin.name)?;
        let adapter: Arc<dyn ChainAdapter> = match (&coin.coin_type, &coin.backend) {
            (
                CoinType::Satoshi,
                BackendConfig::Utxo {
                    host,
                    port,
                    username,
                    password,
                    unlock_password,
                    label,
                },
            ) => {
                let client = BitcoindClient::new(BitcoindConfig {
                    rpc_url: format!("http://{host}:{port}"),
                    rpc_user: username.clone(),
                    rpc_password: password.clone(),
                    label: label.clone(),
                    unlock_password: unlock_password.clone(),
                    decimals: coin.decimals,
                    rounding: coin.rounding,
                })?;
                Arc::new(UtxoEngine::new(settings, coin_ledger, client))
            }
            (
                CoinType::Buterin,
                BackendConfig::Evm {
                    web3_url,
                    mnemonic,
                    gas_units,
                    gas_price_wei,
                    ..
                },
            ) => {
                let client = EvmClient::connect(EvmConfig {
                    rpc_url: web3_url.clone(),
                    mnemonic: mnemonic.clone(),
                    gas_units: *gas_units,
                    gas_price_wei: parse_wei(&coin.name, gas_price_wei.as_deref())?,
                })
                .await?;
                Arc::new(AccountEngine::new(settings, coin_ledger, client))
            }
            (
                CoinType::Erc20,
                BackendConfig::Evm {
                    web3_url,
                    mnemonic,
                    gas_units,
                    gas_price_wei,
                    contract_address: Some(contract_address),
                },
            ) => {
                let evm = EvmClient::connect(EvmConfig {
                    rpc_url: web3_url.clone(),
                    mnemonic: mnemonic.clone(),
                    gas_units: *gas_units,
                    gas_price_wei: parse_wei(&coin.name, gas_price_wei.as_deref())?,
                })
                .await?;
                let client = Erc20Client::new(evm, contract_address)?;
                Arc::new(TokenEngine::new(settings, coin_ledger, client))
            }
            (
                CoinType::Ripple,
                BackendConfig::Tag {
                    backend_url,
                    passphrase,
                    root_address,
                },
            ) => {
                let client = XrplClient::new(XrplConfig {
                    rpc_url: backend_url.clone(),
                    passphrase: passphrase.clone(),
                    root_address: root_address.clone(),
                })?;
                Arc::new(TagEngine::new(settings, coin_ledger, client))
            }
            _ => return Err(InitError::BackendMismatch(coin.name.clone())),
        };
        info!(coin = %coin.name, ty = coin.coin_type.as_str(), "registered coin adapter");
        adapters.push(adapter);
    }
    Ok(adapters)
}

fn parse_wei(coin: &str, raw: Option<&str>) -> Result<Option<Amount>, InitError> {
    raw.map(|s| {
        Amount::from_dec_str(s).map_err(|e| {
            InitError::Config(cashier_config::ConfigError::BadAmount {
                coin: coin.to_owned(),
                field: "gas_price_wei",
                err: e,
            })
        })
    })
    .transpose()
}

async fn start_rpc(
    adapters: BTreeMap<String, Arc<dyn ChainAdapter>>,
    outbox: Outbox,
    shutdown_signal: ShutdownSignal,
    rpc_host: String,
    rpc_port: u16,
) -> anyhow::Result<()> {
    let (stop_tx, stop_rx) = oneshot::channel();

    let mut methods = Methods::new();
    let cashier_rpc = rpc_server::CashierRpcImpl::new(adapters.clone(), outbox);
    methods.merge(cashier_rpc.into_rpc())?;
    let admin_rpc = rpc_server::AdminRpcImpl::new(stop_tx, adapters);
    methods.merge(admin_rpc.into_rpc())?;

    let rpc_server = jsonrpsee::server::ServerBuilder::new()
        .build(format!("{rpc_host}:{rpc_port}"))
        .await?;
    let rpc_handle = rpc_server.start(methods);
    info!(%rpc_host, %rpc_port, "started RPC server");

    // Wait for an admin stop request, then take everything down.
    let _ = stop_rx.await;
    shutdown_signal.send();

    if rpc_handle.stop().is_err() {
        warn!("RPC server already stopped");
    }
    rpc_handle.stopped().await;

    Ok(())
}
