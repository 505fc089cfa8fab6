//! The chain index and wallet behind their two locks.
//!
//! Locks are always taken chain first, then wallet. `import_multi` and
//! `connect_block` hold both for their whole duration, rescan included.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use fluxd_chainstate::{ChainError, ChainIndex, ChainPosition};
use fluxd_consensus::params::Network;
use fluxd_consensus::Hash256;
use fluxd_primitives::block::Block;
use fluxd_primitives::hash256_to_hex;
use fluxd_primitives::transaction::Transaction;
use fluxd_storage::KeyValueStore;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::import::{import_item, ImportError, ImportItem};
use crate::rescan::{resolve_rescan_start, ChainScanner, HistoryScanner, ScanSummary};
use crate::wallet::{CredentialStore, OwnershipHandle, Wallet, WalletError};

const ACCEPTED_TX_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
pub enum NodeError {
    Chain(ChainError),
    Wallet(WalletError),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Chain(err) => write!(f, "{err}"),
            NodeError::Wallet(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NodeError::Chain(err) => Some(err),
            NodeError::Wallet(err) => Some(err),
        }
    }
}

impl From<ChainError> for NodeError {
    fn from(err: ChainError) -> Self {
        NodeError::Chain(err)
    }
}

impl From<WalletError> for NodeError {
    fn from(err: WalletError) -> Self {
        NodeError::Wallet(err)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct WalletInfo {
    pub network: &'static str,
    pub chain_height: Option<i32>,
    pub keys: usize,
    pub watch_scripts: usize,
    pub redeem_scripts: usize,
    pub transactions: usize,
    pub time_first_key: i64,
    pub revision: u64,
    pub insert_count: u64,
}

pub struct WalletNode<S> {
    chain: Mutex<ChainIndex<S>>,
    wallet: Mutex<Wallet<S>>,
    ownership: OwnershipHandle,
    accepted: broadcast::Sender<Arc<Transaction>>,
    // Txids already sent on `accepted` by this process.
    announced: Mutex<HashSet<Hash256>>,
}

impl<S: KeyValueStore> WalletNode<S> {
    /// Opens the chain index and the wallet over one shared store.
    pub fn open(store: Arc<S>, network: Network) -> Result<Self, WalletError> {
        let wallet = Wallet::open(Arc::clone(&store), network)?;
        let chain = ChainIndex::new(store);
        let ownership = wallet.ownership_handle();
        let (accepted, _) = broadcast::channel(ACCEPTED_TX_CHANNEL_CAPACITY);
        Ok(Self {
            chain: Mutex::new(chain),
            wallet: Mutex::new(wallet),
            ownership,
            accepted,
            announced: Mutex::new(HashSet::new()),
        })
    }

    /// Read snapshot of the ownership predicate; never takes the wallet lock.
    pub fn ownership(&self) -> OwnershipHandle {
        self.ownership.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Transaction>> {
        self.accepted.subscribe()
    }

    pub fn import_multi(
        &self,
        items: &[ImportItem],
        rescan: bool,
    ) -> Result<Option<ScanSummary>, ImportError> {
        self.import_multi_with_scanner(items, rescan, &ChainScanner)
    }

    /// Imports `items` in order, then optionally rescans.
    ///
    /// The first failing item aborts the batch with `ImportFailed`; items
    /// before it stay applied. The rescan start is resolved before any item
    /// is imported, so an out-of-range timestamp leaves the wallet untouched.
    pub fn import_multi_with_scanner<H: HistoryScanner<S>>(
        &self,
        items: &[ImportItem],
        rescan: bool,
        scanner: &H,
    ) -> Result<Option<ScanSummary>, ImportError> {
        let chain = lock(&self.chain, "chain")?;
        let mut wallet = lock(&self.wallet, "wallet")?;
        log_info!(
            "importmulti: {} item(s), rescan {}",
            items.len(),
            if rescan { "on" } else { "off" }
        );

        let start = if rescan {
            resolve_rescan_start(items, &*chain)?
        } else {
            None
        };

        // Readers see one snapshot per batch, including the prefix
        // committed before a failing item.
        let summary = wallet.with_deferred_snapshot(|wallet| -> Result<_, ImportError> {
            for (index, item) in items.iter().enumerate() {
                if let Err(err) = import_item(wallet, item) {
                    log_warn!("importmulti: item {index} failed: {err}");
                    return Err(ImportError::ImportFailed {
                        index,
                        source: Box::new(err),
                    });
                }
            }
            log_info!(
                "importmulti: imported {} item(s) ({} keys, {} watched)",
                items.len(),
                wallet.key_count(),
                wallet.watch_count()
            );

            if !rescan {
                return Ok(None);
            }
            let Some(start) = start else {
                log_warn!("importmulti: chain is empty, skipping rescan");
                return Ok(None);
            };
            Ok(Some(scanner.scan_from(&*chain, wallet, &start, true)?))
        })?;
        drop(wallet);
        drop(chain);

        if let Some(summary) = &summary {
            for tx in &summary.reaccepted {
                self.announce(tx.clone())?;
            }
        }
        Ok(summary)
    }

    /// Appends `block` to the chain and records its wallet transactions.
    pub fn connect_block(&self, block: &Block) -> Result<ChainPosition, NodeError> {
        let chain = lock(&self.chain, "chain")?;
        let mut wallet = lock(&self.wallet, "wallet")?;
        let position = chain.connect_block(block)?;
        let location = Some((*position.hash(), position.height()));
        wallet.with_deferred_snapshot(|wallet| -> Result<(), WalletError> {
            for tx in &block.transactions {
                wallet.add_if_relevant(tx, location)?;
            }
            Ok(())
        })?;
        Ok(position)
    }

    /// Records `tx` as unconfirmed when relevant and announces it to
    /// subscribers. A transaction is announced at most once per process.
    pub fn accept_transaction(&self, tx: Transaction) -> Result<bool, NodeError> {
        let relevant = {
            let _chain = lock(&self.chain, "chain")?;
            let mut wallet = lock(&self.wallet, "wallet")?;
            wallet.add_if_relevant(&tx, None)?
        };
        self.announce(tx)?;
        Ok(relevant)
    }

    fn announce(&self, tx: Transaction) -> Result<bool, WalletError> {
        let txid = tx.txid();
        if !lock(&self.announced, "announced")?.insert(txid) {
            log_debug!("Skipping already announced tx {}", hash256_to_hex(&txid));
            return Ok(false);
        }
        // No subscribers is not an error.
        let _ = self.accepted.send(Arc::new(tx));
        Ok(true)
    }

    pub fn wallet_info(&self) -> Result<WalletInfo, NodeError> {
        let chain = lock(&self.chain, "chain")?;
        let wallet = lock(&self.wallet, "wallet")?;
        Ok(WalletInfo {
            network: wallet.network().as_str(),
            chain_height: chain.height()?,
            keys: wallet.key_count(),
            watch_scripts: wallet.watch_count(),
            redeem_scripts: wallet.script_count(),
            transactions: wallet.tx_count(),
            time_first_key: wallet.time_first_key(),
            revision: wallet.revision(),
            insert_count: wallet.insert_count(),
        })
    }

    /// The wallet, if no other caller holds its lock.
    pub fn try_wallet(&self) -> Option<MutexGuard<'_, Wallet<S>>> {
        try_lock(&self.wallet)
    }

    /// The chain index, if no other caller holds its lock.
    pub fn try_chain(&self) -> Option<MutexGuard<'_, ChainIndex<S>>> {
        try_lock(&self.chain)
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, name: &'static str) -> Result<MutexGuard<'a, T>, WalletError> {
    mutex.lock().map_err(|_| WalletError::LockPoisoned(name))
}

fn try_lock<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::WouldBlock) | Err(TryLockError::Poisoned(_)) => None,
    }
}
