use fluxd_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

#[allow(unused_macros)]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

#[allow(unused_macros)]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

macro_rules! log_category {
    ($category:expr, $($arg:tt)*) => {{
        if crate::logging::category_enabled($category) {
            log_at!(crate::logging::Level::Info, $($arg)*);
        }
    }};
}

pub mod config;
pub mod import;
pub mod importmulti;
pub mod node;
pub mod rescan;
pub mod wallet;
pub mod zmq;

use std::sync::Arc;

use fluxd_primitives::transaction::Transaction;
use fluxd_storage::fjall::FjallStore;
use fluxd_storage::memory::MemoryStore;
use fluxd_storage::{KeyValueStore, StoreError, WriteBatch};

use crate::config::{Backend, CliAction, Command, Config};
use crate::node::WalletNode;
use crate::zmq::{
    wallet_notify_loop, ChannelPublisher, PublishTransport, WalletHashTxNotifier,
    WalletNotifiers, WalletRawTxNotifier,
};

const NOTIFY_CHANNEL_CAPACITY: usize = 64;

pub enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl Store {
    pub fn open(config: &Config) -> Result<Self, String> {
        match config.backend {
            Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
            Backend::Fjall => {
                let path = config.data_dir.join("wallet-db");
                std::fs::create_dir_all(&path)
                    .map_err(|err| format!("failed to create {}: {err}", path.display()))?;
                FjallStore::open(&path)
                    .map(Store::Fjall)
                    .map_err(|err| format!("failed to open {}: {err}", path.display()))
            }
        }
    }

    pub fn persist(&self) -> Result<(), StoreError> {
        match self {
            Store::Memory(_) => Ok(()),
            Store::Fjall(store) => store.persist(),
        }
    }
}

impl KeyValueStore for Store {
    fn get(
        &self,
        column: fluxd_storage::Column,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn put(
        &self,
        column: fluxd_storage::Column,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.put(column, key, value),
            Store::Fjall(store) => store.put(column, key, value),
        }
    }

    fn delete(&self, column: fluxd_storage::Column, key: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.delete(column, key),
            Store::Fjall(store) => store.delete(column, key),
        }
    }

    fn scan_prefix(
        &self,
        column: fluxd_storage::Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: fluxd_storage::Column,
        prefix: &[u8],
        visitor: &mut fluxd_storage::PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }
}

pub async fn run_entry() -> Result<(), String> {
    let config = match config::parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", config::usage());
            return Ok(());
        }
        CliAction::Run(config) => config,
    };

    logging::init(config.log);
    for category in &config.debug_categories {
        logging::enable_category(category);
    }

    let store = Arc::new(Store::open(&config)?);
    let node = WalletNode::open(Arc::clone(&store), config.network).map_err(|err| err.to_string())?;
    log_info!(
        "Wallet opened ({}, data dir {})",
        config.network.as_str(),
        config.data_dir.display()
    );

    match &config.command {
        Command::ImportMulti { requests, options } => {
            let params = import_params(requests, options.as_deref())?;
            importmulti::handle_importmulti(&node, &params).map_err(|err| err.to_string())?;
            println!("null");
        }
        Command::WalletInfo => {
            let info = node.wallet_info().map_err(|err| err.to_string())?;
            let json = serde_json::to_string_pretty(&info).map_err(|err| err.to_string())?;
            println!("{json}");
        }
        Command::NotifyTx { raw_tx } => notify_once(node, &config, raw_tx).await?,
    }

    store.persist().map_err(|err| err.to_string())
}

fn import_params(requests: &str, options: Option<&str>) -> Result<serde_json::Value, String> {
    let mut params = vec![serde_json::from_str(requests)
        .map_err(|err| format!("invalid requests json: {err}"))?];
    if let Some(options) = options {
        params.push(
            serde_json::from_str(options).map_err(|err| format!("invalid options json: {err}"))?,
        );
    }
    Ok(serde_json::Value::Array(params))
}

async fn notify_once<S>(node: WalletNode<S>, config: &Config, raw_tx: &str) -> Result<(), String>
where
    S: KeyValueStore + 'static,
{
    let bytes = hex::decode(raw_tx.trim()).map_err(|_| "rawtx must be hex".to_string())?;
    let tx = Transaction::consensus_decode(&bytes).map_err(|err| format!("invalid rawtx: {err}"))?;

    let (publisher, messages) = ChannelPublisher::bounded(NOTIFY_CHANNEL_CAPACITY);
    let transport: Arc<dyn PublishTransport> = Arc::new(publisher);
    let mut notifiers = WalletNotifiers::new();
    let any_configured = config.zmq_wallet_raw_tx.is_some() || config.zmq_wallet_hash_tx.is_some();
    if config.zmq_wallet_raw_tx.is_some() || !any_configured {
        notifiers.push(Box::new(WalletRawTxNotifier::new(
            node.ownership(),
            Arc::clone(&transport),
        )));
    }
    if config.zmq_wallet_hash_tx.is_some() || !any_configured {
        notifiers.push(Box::new(WalletHashTxNotifier::new(
            node.ownership(),
            Arc::clone(&transport),
        )));
    }

    let task = tokio::spawn(wallet_notify_loop(node.subscribe(), notifiers));
    let relevant = node.accept_transaction(tx).map_err(|err| err.to_string())?;
    // Dropping the node closes the channel and ends the loop.
    drop(node);
    task.await.map_err(|err| format!("notifier task failed: {err}"))?;

    if !relevant {
        log_info!("Transaction is not relevant to the wallet");
    }
    for message in messages.try_iter() {
        let endpoint = match message.topic {
            zmq::TOPIC_WALLET_RAW_TX => config.zmq_wallet_raw_tx.as_deref(),
            _ => config.zmq_wallet_hash_tx.as_deref(),
        };
        println!(
            "{} {} {}",
            message.topic,
            endpoint.unwrap_or("-"),
            hex::encode(&message.payload)
        );
    }
    Ok(())
}
