//! Rescan start resolution and the forward history walk.

use std::fmt;

use fluxd_chainstate::{ChainError, ChainIndex, ChainPosition};
use fluxd_primitives::hash256_to_hex;
use fluxd_primitives::transaction::Transaction;
use fluxd_storage::KeyValueStore;

use crate::import::{ImportError, ImportItem};
use crate::wallet::{Wallet, WalletError};

#[derive(Debug)]
pub enum RescanError {
    Chain(ChainError),
    Wallet(WalletError),
}

impl fmt::Display for RescanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RescanError::Chain(err) => write!(f, "rescan failed: {err}"),
            RescanError::Wallet(err) => write!(f, "rescan failed: {err}"),
        }
    }
}

impl std::error::Error for RescanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RescanError::Chain(err) => Some(err),
            RescanError::Wallet(err) => Some(err),
        }
    }
}

impl From<ChainError> for RescanError {
    fn from(err: ChainError) -> Self {
        RescanError::Chain(err)
    }
}

impl From<WalletError> for RescanError {
    fn from(err: WalletError) -> Self {
        RescanError::Wallet(err)
    }
}

/// Smallest timestamp carried by any item. Items without one are skipped.
pub fn earliest_timestamp(items: &[ImportItem]) -> Option<i64> {
    items.iter().filter_map(|item| item.timestamp).min()
}

/// Block to start rescanning from.
///
/// Without any timestamp the scan starts at genesis. `Ok(None)` means the
/// chain is empty and there is nothing to scan.
pub fn resolve_rescan_start<S: KeyValueStore>(
    items: &[ImportItem],
    chain: &ChainIndex<S>,
) -> Result<Option<ChainPosition>, ImportError> {
    if chain.tip()?.is_none() {
        return Ok(None);
    }
    let Some(timestamp) = earliest_timestamp(items) else {
        return Ok(chain.genesis()?);
    };
    match chain.latest_before(timestamp)? {
        Some(position) => Ok(Some(position)),
        None => Err(ImportError::OutOfRange(
            "No block before timestamp".to_string(),
        )),
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanSummary {
    pub start_height: i32,
    pub blocks_scanned: u64,
    pub transactions_found: u64,
    pub pending_confirmed: u64,
    /// Unconfirmed wallet transactions still missing from the chain.
    pub reaccepted: Vec<Transaction>,
}

pub trait HistoryScanner<S: KeyValueStore> {
    fn scan_from(
        &self,
        chain: &ChainIndex<S>,
        wallet: &mut Wallet<S>,
        start: &ChainPosition,
        reprocess_pending: bool,
    ) -> Result<ScanSummary, RescanError>;
}

/// Walks every block from the start position to the tip.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChainScanner;

impl<S: KeyValueStore> HistoryScanner<S> for ChainScanner {
    fn scan_from(
        &self,
        chain: &ChainIndex<S>,
        wallet: &mut Wallet<S>,
        start: &ChainPosition,
        reprocess_pending: bool,
    ) -> Result<ScanSummary, RescanError> {
        wallet.with_deferred_snapshot(|wallet| scan_chain(chain, wallet, start, reprocess_pending))
    }
}

fn scan_chain<S: KeyValueStore>(
    chain: &ChainIndex<S>,
    wallet: &mut Wallet<S>,
    start: &ChainPosition,
    reprocess_pending: bool,
) -> Result<ScanSummary, RescanError> {
    let tip_height = chain.height()?.unwrap_or(-1);
    log_info!(
        "Rescanning from height {} ({}) to {}",
        start.height(),
        hash256_to_hex(start.hash()),
        tip_height
    );

    let mut summary = ScanSummary {
        start_height: start.height(),
        ..ScanSummary::default()
    };
    for height in start.height()..=tip_height {
        let Some(block) = chain.block_at_height(height)? else {
            break;
        };
        let block_hash = block.hash();
        for tx in &block.transactions {
            if wallet.add_if_relevant(tx, Some((block_hash, height)))? {
                summary.transactions_found += 1;
            }
        }
        summary.blocks_scanned += 1;
    }

    if reprocess_pending {
        for (txid, tx) in wallet.pending_transactions()? {
            match chain.tx_height(&txid)? {
                Some(block) => {
                    wallet.mark_confirmed(&txid, block)?;
                    summary.pending_confirmed += 1;
                }
                None => summary.reaccepted.push(tx),
            }
        }
    }

    log_info!(
        "Rescan done: {} blocks, {} wallet txs, {} confirmed, {} reaccepted",
        summary.blocks_scanned,
        summary.transactions_found,
        summary.pending_confirmed,
        summary.reaccepted.len()
    );
    Ok(summary)
}
