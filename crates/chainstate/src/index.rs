//! Header, height and block storage for the active chain.
//!
//! Blocks are only ever appended at the tip. Every header entry carries the
//! running maximum of block times up to its height, which makes "latest block
//! at or before T" a binary search over heights.

use std::fmt;
use std::sync::Arc;

use fluxd_consensus::Hash256;
use fluxd_primitives::encoding::{DecodeError, Decoder, Encoder};
use fluxd_primitives::{hash256_to_hex, Block, TransactionDecodeError};
use fluxd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::txindex::{TxIndex, TxLocation};

const META_BEST_BLOCK_KEY: &[u8] = b"best_block";

#[derive(Debug)]
pub enum ChainError {
    Store(StoreError),
    Decode(String),
    /// Block does not extend the current tip.
    Orphan { hash: Hash256, prev: Hash256 },
    Corrupt(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::Store(err) => write!(f, "chain store error: {err}"),
            ChainError::Decode(message) => write!(f, "chain decode error: {message}"),
            ChainError::Orphan { hash, prev } => write!(
                f,
                "block {} does not extend tip (prev {})",
                hash256_to_hex(hash),
                hash256_to_hex(prev)
            ),
            ChainError::Corrupt(message) => write!(f, "chain index corrupt: {message}"),
        }
    }
}

impl std::error::Error for ChainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChainError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(err)
    }
}

impl From<DecodeError> for ChainError {
    fn from(err: DecodeError) -> Self {
        ChainError::Decode(err.to_string())
    }
}

impl From<TransactionDecodeError> for ChainError {
    fn from(err: TransactionDecodeError) -> Self {
        ChainError::Decode(err.to_string())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeaderEntry {
    pub prev_hash: Hash256,
    pub height: i32,
    pub time: u32,
    /// Maximum block time over heights `0..=height`.
    pub max_time: u32,
    pub tx_count: u32,
}

/// A block on the active chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChainPosition {
    hash: Hash256,
    height: i32,
    time: u32,
}

impl ChainPosition {
    pub fn hash(&self) -> &Hash256 {
        &self.hash
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn time(&self) -> u32 {
        self.time
    }
}

pub struct ChainIndex<S> {
    store: Arc<S>,
    tx_index: TxIndex<Arc<S>>,
}

impl<S: KeyValueStore> ChainIndex<S> {
    pub fn new(store: Arc<S>) -> Self {
        let tx_index = TxIndex::new(Arc::clone(&store));
        Self { store, tx_index }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Appends `block` as the new tip.
    pub fn connect_block(&self, block: &Block) -> Result<ChainPosition, ChainError> {
        let hash = block.hash();
        let prev = block.header.prev_block;
        let (height, prev_max_time) = match self.tip()? {
            Some(tip) if tip.hash == prev => {
                let entry = self.require_header(&tip.hash)?;
                (tip.height + 1, entry.max_time)
            }
            None if prev == [0u8; 32] => (0, 0),
            _ => return Err(ChainError::Orphan { hash, prev }),
        };

        let entry = HeaderEntry {
            prev_hash: prev,
            height,
            time: block.header.time,
            max_time: prev_max_time.max(block.header.time),
            tx_count: block.transactions.len() as u32,
        };

        let mut batch = WriteBatch::new();
        batch.put(Column::HeaderIndex, hash, encode_header_entry(&entry));
        batch.put(Column::HeightIndex, height_key(height), hash);
        batch.put(Column::BlockData, hash, block.consensus_encode());
        for (index, tx) in block.transactions.iter().enumerate() {
            let location = TxLocation {
                block: hash,
                index: index as u32,
            };
            self.tx_index.insert(&mut batch, &tx.txid(), location);
        }
        batch.put(Column::Meta, META_BEST_BLOCK_KEY, hash);
        self.store.write_batch(&batch)?;

        fluxd_log::log_debug!(
            "Connected block {} at height {}",
            hash256_to_hex(&hash),
            height
        );
        Ok(ChainPosition {
            hash,
            height,
            time: entry.time,
        })
    }

    pub fn get_header(&self, hash: &Hash256) -> Result<Option<HeaderEntry>, ChainError> {
        match self.store.get(Column::HeaderIndex, hash)? {
            Some(bytes) => decode_header_entry(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn tip(&self) -> Result<Option<ChainPosition>, ChainError> {
        let hash = match self.store.get(Column::Meta, META_BEST_BLOCK_KEY)? {
            Some(bytes) => decode_hash(&bytes)?,
            None => return Ok(None),
        };
        let entry = self.require_header(&hash)?;
        Ok(Some(ChainPosition {
            hash,
            height: entry.height,
            time: entry.time,
        }))
    }

    pub fn genesis(&self) -> Result<Option<ChainPosition>, ChainError> {
        self.position_at_height(0)
    }

    pub fn height(&self) -> Result<Option<i32>, ChainError> {
        Ok(self.tip()?.map(|tip| tip.height))
    }

    pub fn height_hash(&self, height: i32) -> Result<Option<Hash256>, ChainError> {
        if height < 0 {
            return Ok(None);
        }
        match self.store.get(Column::HeightIndex, &height_key(height))? {
            Some(bytes) => decode_hash(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn position_at_height(&self, height: i32) -> Result<Option<ChainPosition>, ChainError> {
        let hash = match self.height_hash(height)? {
            Some(hash) => hash,
            None => return Ok(None),
        };
        let entry = self.require_header(&hash)?;
        Ok(Some(ChainPosition {
            hash,
            height,
            time: entry.time,
        }))
    }

    /// Highest block whose running maximum time is `<= timestamp`.
    ///
    /// Returns `None` when the chain is empty or genesis is later than
    /// `timestamp`.
    pub fn latest_before(&self, timestamp: i64) -> Result<Option<ChainPosition>, ChainError> {
        let Some(tip) = self.tip()? else {
            return Ok(None);
        };

        let mut low = 0i32;
        let mut high = tip.height;
        let mut found = None;
        while low <= high {
            let mid = low + (high - low) / 2;
            let (_, entry) = self.entry_at_height(mid)?;
            if i64::from(entry.max_time) <= timestamp {
                found = Some(mid);
                low = mid + 1;
            } else {
                high = mid - 1;
            }
        }

        match found {
            Some(height) => self.position_at_height(height),
            None => Ok(None),
        }
    }

    pub fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        match self.store.get(Column::BlockData, hash)? {
            Some(bytes) => Ok(Some(Block::consensus_decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn block_at_height(&self, height: i32) -> Result<Option<Block>, ChainError> {
        let hash = match self.height_hash(height)? {
            Some(hash) => hash,
            None => return Ok(None),
        };
        match self.read_block(&hash)? {
            Some(block) => Ok(Some(block)),
            None => Err(ChainError::Corrupt(format!(
                "missing block data for height {height}"
            ))),
        }
    }

    pub fn tx_location(&self, txid: &Hash256) -> Result<Option<TxLocation>, ChainError> {
        Ok(self.tx_index.get(txid)?)
    }

    /// Height of the block holding `txid`, if it is on the chain.
    pub fn tx_height(&self, txid: &Hash256) -> Result<Option<(Hash256, i32)>, ChainError> {
        let Some(location) = self.tx_location(txid)? else {
            return Ok(None);
        };
        let entry = self.require_header(&location.block)?;
        Ok(Some((location.block, entry.height)))
    }

    fn entry_at_height(&self, height: i32) -> Result<(Hash256, HeaderEntry), ChainError> {
        let hash = self
            .height_hash(height)?
            .ok_or_else(|| ChainError::Corrupt(format!("missing height entry {height}")))?;
        let entry = self.require_header(&hash)?;
        Ok((hash, entry))
    }

    fn require_header(&self, hash: &Hash256) -> Result<HeaderEntry, ChainError> {
        self.get_header(hash)?.ok_or_else(|| {
            ChainError::Corrupt(format!("missing header {}", hash256_to_hex(hash)))
        })
    }
}

pub fn height_key(height: i32) -> [u8; 4] {
    height.to_be_bytes()
}

fn encode_header_entry(entry: &HeaderEntry) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(48);
    encoder.write_hash_le(&entry.prev_hash);
    encoder.write_i32_le(entry.height);
    encoder.write_u32_le(entry.time);
    encoder.write_u32_le(entry.max_time);
    encoder.write_u32_le(entry.tx_count);
    encoder.into_inner()
}

fn decode_header_entry(bytes: &[u8]) -> Result<HeaderEntry, ChainError> {
    let mut decoder = Decoder::new(bytes);
    let entry = HeaderEntry {
        prev_hash: decoder.read_hash_le()?,
        height: decoder.read_i32_le()?,
        time: decoder.read_u32_le()?,
        max_time: decoder.read_u32_le()?,
        tx_count: decoder.read_u32_le()?,
    };
    decoder.finish()?;
    Ok(entry)
}

fn decode_hash(bytes: &[u8]) -> Result<Hash256, ChainError> {
    bytes
        .try_into()
        .map_err(|_| ChainError::Decode("invalid hash length".to_string()))
}
