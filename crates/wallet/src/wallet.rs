//! Persistent credential store backed by the node's key/value columns.
//!
//! All reads are served from memory; every mutation commits exactly one
//! `WriteBatch` and then republishes the ownership snapshot used by readers
//! that must not take the wallet lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use fluxd_consensus::params::Network;
use fluxd_consensus::Hash256;
use fluxd_primitives::encoding::{DecodeError, Decoder, Encoder};
use fluxd_primitives::hash::hash160;
use fluxd_primitives::transaction::Transaction;
use fluxd_script::standard::{solve, Solution};
use fluxd_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use zeroize::Zeroize;

/// Watermark value meaning "no private key imported yet".
pub const NO_KEY_TIME: i64 = 0;
/// First-seen time of a key whose creation time is unknown; forces a scan from genesis.
pub const UNKNOWN_KEY_TIME: i64 = 1;

const META_NETWORK_KEY: &[u8] = b"wallet_network";
const META_TIME_FIRST_KEY: &[u8] = b"wallet_time_first_key";
const KEY_RECORD_VERSION: u8 = 1;
const TX_RECORD_VERSION: u8 = 1;

#[derive(Debug)]
pub enum WalletError {
    Store(StoreError),
    Decode(DecodeError),
    InvalidData(&'static str),
    NetworkMismatch { expected: Network, found: Network },
    AlreadyHaveKey,
    LockPoisoned(&'static str),
}

impl std::fmt::Display for WalletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalletError::Store(err) => write!(f, "{err}"),
            WalletError::Decode(err) => write!(f, "{err}"),
            WalletError::InvalidData(msg) => write!(f, "{msg}"),
            WalletError::NetworkMismatch { expected, found } => write!(
                f,
                "wallet network mismatch (expected {expected:?}, found {found:?})"
            ),
            WalletError::AlreadyHaveKey => write!(
                f,
                "The wallet already contains the private key for this address or script"
            ),
            WalletError::LockPoisoned(name) => write!(f, "{name} lock poisoned"),
        }
    }
}

impl std::error::Error for WalletError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WalletError::Store(err) => Some(err),
            WalletError::Decode(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for WalletError {
    fn from(err: StoreError) -> Self {
        WalletError::Store(err)
    }
}

impl From<DecodeError> for WalletError {
    fn from(err: DecodeError) -> Self {
        WalletError::Decode(err)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum IsMine {
    No,
    WatchOnly,
    Spendable,
}

/// A private key ready to be stored. The secret is wiped on drop.
pub struct PrivateKeyEntry {
    pub key_hash: [u8; 20],
    pub secret: [u8; 32],
    pub compressed: bool,
    pub pubkey_bytes: Vec<u8>,
    pub first_seen: i64,
}

impl Drop for PrivateKeyEntry {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for PrivateKeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKeyEntry")
            .field("key_hash", &hex::encode(self.key_hash))
            .field("compressed", &self.compressed)
            .field("first_seen", &self.first_seen)
            .finish_non_exhaustive()
    }
}

/// A script the wallet recognizes without holding its key.
///
/// `raw_script` marks a redeem script: it is also stored by hash so that
/// spends of its P2SH form can be recognized.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WatchEntry {
    pub script: Vec<u8>,
    pub raw_script: bool,
}

impl WatchEntry {
    pub fn script(script: Vec<u8>) -> Self {
        Self {
            script,
            raw_script: false,
        }
    }

    pub fn redeem_script(script: Vec<u8>) -> Self {
        Self {
            script,
            raw_script: true,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalletTx {
    pub raw: Vec<u8>,
    pub block: Option<(Hash256, i32)>,
    pub received_at: u64,
}

impl WalletTx {
    pub fn is_confirmed(&self) -> bool {
        self.block.is_some()
    }

    pub fn transaction(&self) -> Result<Transaction, WalletError> {
        Transaction::consensus_decode(&self.raw)
            .map_err(|_| WalletError::InvalidData("wallet transaction does not decode"))
    }

    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.raw.len() + 48);
        encoder.write_u8(TX_RECORD_VERSION);
        encoder.write_var_bytes(&self.raw);
        match &self.block {
            Some((hash, height)) => {
                encoder.write_bool(true);
                encoder.write_hash_le(hash);
                encoder.write_i32_le(*height);
            }
            None => encoder.write_bool(false),
        }
        encoder.write_u64_le(self.received_at);
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, WalletError> {
        let mut decoder = Decoder::new(bytes);
        if decoder.read_u8()? != TX_RECORD_VERSION {
            return Err(WalletError::InvalidData("unsupported wallet tx record version"));
        }
        let raw = decoder.read_var_bytes()?;
        let block = if decoder.read_bool()? {
            let hash = decoder.read_hash_le()?;
            let height = decoder.read_i32_le()?;
            Some((hash, height))
        } else {
            None
        };
        let received_at = decoder.read_u64_le()?;
        decoder.finish()?;
        Ok(Self {
            raw,
            block,
            received_at,
        })
    }
}

/// Immutable view of everything the ownership predicate needs.
#[derive(Clone, Debug, Default)]
pub struct Ownership {
    keys: HashMap<[u8; 20], Vec<u8>>,
    watch: HashSet<Vec<u8>>,
    scripts: HashMap<[u8; 20], Vec<u8>>,
    tx_outputs: HashMap<Hash256, Vec<Vec<u8>>>,
}

impl Ownership {
    pub fn has_key(&self, key_hash: &[u8; 20]) -> bool {
        self.keys.contains_key(key_hash)
    }

    pub fn has_watch(&self, script: &[u8]) -> bool {
        self.watch.contains(script)
    }

    pub fn redeem_script(&self, script_hash: &[u8; 20]) -> Option<&[u8]> {
        self.scripts.get(script_hash).map(Vec::as_slice)
    }

    pub fn is_mine(&self, script: &[u8]) -> IsMine {
        if self.can_spend(script, true) {
            IsMine::Spendable
        } else if self.watch.contains(script) {
            IsMine::WatchOnly
        } else {
            IsMine::No
        }
    }

    /// True when any output pays the wallet or any input spends a wallet output.
    pub fn is_relevant(&self, tx: &Transaction) -> bool {
        tx.vout
            .iter()
            .any(|output| self.is_mine(&output.script_pubkey) != IsMine::No)
            || self.is_from_me(tx)
    }

    fn is_from_me(&self, tx: &Transaction) -> bool {
        if tx.is_coinbase() {
            return false;
        }
        tx.vin.iter().any(|input| {
            self.tx_outputs
                .get(&input.prevout.hash)
                .and_then(|outputs| outputs.get(input.prevout.index as usize))
                .is_some_and(|script| self.is_mine(script) != IsMine::No)
        })
    }

    // Redeem scripts may not themselves be P2SH.
    fn can_spend(&self, script: &[u8], allow_p2sh: bool) -> bool {
        match solve(script) {
            Solution::PubKeyHash(key_hash) => self.keys.contains_key(&key_hash),
            Solution::PubKey(pubkey) => self.keys.contains_key(&hash160(&pubkey)),
            Solution::ScriptHash(script_hash) if allow_p2sh => self
                .scripts
                .get(&script_hash)
                .is_some_and(|redeem| self.can_spend(redeem, false)),
            Solution::Multisig { pubkeys, .. } => pubkeys
                .iter()
                .all(|pubkey| self.keys.contains_key(&hash160(pubkey))),
            _ => false,
        }
    }
}

/// Shared slot holding the latest published [`Ownership`].
#[derive(Clone, Default)]
pub struct OwnershipHandle {
    inner: Arc<RwLock<Arc<Ownership>>>,
}

impl OwnershipHandle {
    pub fn load(&self) -> Arc<Ownership> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    fn publish(&self, snapshot: Ownership) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(snapshot);
    }
}

/// The operations the importer needs from a credential store.
pub trait CredentialStore {
    fn network(&self) -> Network;
    fn has_key(&self, key_hash: &[u8; 20]) -> bool;
    fn has_watch(&self, script: &[u8]) -> bool;
    fn is_spendable(&self, script: &[u8]) -> bool;
    fn insert_private(&mut self, entry: PrivateKeyEntry, label: &str) -> Result<(), WalletError>;
    fn insert_watch(&mut self, entries: Vec<WatchEntry>, label: &str) -> Result<(), WalletError>;
    fn set_label(&mut self, script_pubkey: &[u8], label: &str) -> Result<(), WalletError>;
    fn mark_dirty(&mut self);
    fn lower_watermark(&mut self, time: i64) -> Result<(), WalletError>;
}

pub struct Wallet<S> {
    store: Arc<S>,
    network: Network,
    ownership: Ownership,
    secrets: HashMap<[u8; 20], PrivateKeyEntry>,
    labels: BTreeMap<Vec<u8>, String>,
    txs: BTreeMap<Hash256, WalletTx>,
    time_first_key: i64,
    revision: u64,
    insert_count: u64,
    snapshot: OwnershipHandle,
    snapshot_stale: bool,
    snapshot_deferred: bool,
}

impl<S: KeyValueStore> Wallet<S> {
    pub fn open(store: Arc<S>, network: Network) -> Result<Self, WalletError> {
        match store.get(Column::Meta, META_NETWORK_KEY)? {
            Some(bytes) => {
                let found = decode_network(&bytes)?;
                if found != network {
                    return Err(WalletError::NetworkMismatch {
                        expected: network,
                        found,
                    });
                }
            }
            None => store.put(Column::Meta, META_NETWORK_KEY, &[encode_network(network)])?,
        }

        let mut wallet = Self {
            store,
            network,
            ownership: Ownership::default(),
            secrets: HashMap::new(),
            labels: BTreeMap::new(),
            txs: BTreeMap::new(),
            time_first_key: NO_KEY_TIME,
            revision: 0,
            insert_count: 0,
            snapshot: OwnershipHandle::default(),
            snapshot_stale: true,
            snapshot_deferred: false,
        };
        wallet.load()?;
        wallet.flush_snapshot();
        Ok(wallet)
    }

    fn load(&mut self) -> Result<(), WalletError> {
        for (key, value) in self.store.scan_prefix(Column::WalletKey, &[])? {
            let entry = decode_key_record(&key, &value)?;
            self.ownership
                .keys
                .insert(entry.key_hash, entry.pubkey_bytes.clone());
            self.secrets.insert(entry.key_hash, entry);
        }
        for (script, _) in self.store.scan_prefix(Column::WalletWatch, &[])? {
            self.ownership.watch.insert(script);
        }
        for (key, script) in self.store.scan_prefix(Column::WalletScript, &[])? {
            let script_hash: [u8; 20] = key
                .as_slice()
                .try_into()
                .map_err(|_| WalletError::InvalidData("invalid script hash key"))?;
            if hash160(&script) != script_hash {
                return Err(WalletError::InvalidData("redeem script hash mismatch"));
            }
            self.ownership.scripts.insert(script_hash, script);
        }
        for (script, label) in self.store.scan_prefix(Column::WalletLabel, &[])? {
            let label = String::from_utf8(label)
                .map_err(|_| WalletError::InvalidData("label is not utf-8"))?;
            self.labels.insert(script, label);
        }
        for (key, value) in self.store.scan_prefix(Column::WalletTx, &[])? {
            let txid: Hash256 = key
                .as_slice()
                .try_into()
                .map_err(|_| WalletError::InvalidData("invalid wallet txid key"))?;
            let record = WalletTx::decode(&value)?;
            let tx = record.transaction()?;
            self.ownership.tx_outputs.insert(txid, output_scripts(&tx));
            self.txs.insert(txid, record);
        }
        if let Some(bytes) = self.store.get(Column::Meta, META_TIME_FIRST_KEY)? {
            let bytes: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| WalletError::InvalidData("invalid time_first_key"))?;
            self.time_first_key = i64::from_le_bytes(bytes);
        }
        Ok(())
    }

    /// Marks the ownership state changed and republishes it unless a
    /// deferred section is running.
    fn publish(&mut self) {
        self.snapshot_stale = true;
        if !self.snapshot_deferred {
            self.flush_snapshot();
        }
    }

    fn flush_snapshot(&mut self) {
        if self.snapshot_stale {
            self.snapshot.publish(self.ownership.clone());
            self.snapshot_stale = false;
        }
    }

    /// Runs `f` with snapshot publication held back, then publishes once.
    ///
    /// Whatever `f` committed is published even when it returns an error.
    /// Nested sections publish when the outermost one ends.
    pub fn with_deferred_snapshot<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let outer = std::mem::replace(&mut self.snapshot_deferred, true);
        let result = f(self);
        self.snapshot_deferred = outer;
        if !outer {
            self.flush_snapshot();
        }
        result
    }

    pub fn ownership_handle(&self) -> OwnershipHandle {
        self.snapshot.clone()
    }

    pub fn key_count(&self) -> usize {
        self.secrets.len()
    }

    pub fn watch_count(&self) -> usize {
        self.ownership.watch.len()
    }

    pub fn script_count(&self) -> usize {
        self.ownership.scripts.len()
    }

    /// Number of commits that created at least one key, watch or script entry.
    pub fn insert_count(&self) -> u64 {
        self.insert_count
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn time_first_key(&self) -> i64 {
        self.time_first_key
    }

    pub fn tx_count(&self) -> usize {
        self.txs.len()
    }

    pub fn label_for_script_pubkey(&self, script_pubkey: &[u8]) -> Option<&str> {
        self.labels.get(script_pubkey).map(String::as_str)
    }

    pub fn key_first_seen(&self, key_hash: &[u8; 20]) -> Option<i64> {
        self.secrets.get(key_hash).map(|entry| entry.first_seen)
    }

    pub fn is_mine(&self, script: &[u8]) -> IsMine {
        self.ownership.is_mine(script)
    }

    pub fn is_relevant(&self, tx: &Transaction) -> bool {
        self.ownership.is_relevant(tx)
    }

    pub fn wallet_tx(&self, txid: &Hash256) -> Option<&WalletTx> {
        self.txs.get(txid)
    }

    pub fn pending_transactions(&self) -> Result<Vec<(Hash256, Transaction)>, WalletError> {
        self.txs
            .iter()
            .filter(|(_, record)| !record.is_confirmed())
            .map(|(txid, record)| Ok((*txid, record.transaction()?)))
            .collect()
    }

    /// Records `tx` when it is relevant to the wallet, or confirms an
    /// already-known unconfirmed transaction. Returns whether anything changed.
    pub fn add_if_relevant(
        &mut self,
        tx: &Transaction,
        block: Option<(Hash256, i32)>,
    ) -> Result<bool, WalletError> {
        let txid = tx.txid();
        if let Some(existing) = self.txs.get(&txid) {
            return match (existing.block, block) {
                (None, Some(block)) => {
                    self.mark_confirmed(&txid, block)?;
                    Ok(true)
                }
                _ => Ok(false),
            };
        }
        if !self.ownership.is_relevant(tx) {
            return Ok(false);
        }

        let record = WalletTx {
            raw: tx.consensus_encode(),
            block,
            received_at: current_unix_seconds(),
        };
        let mut batch = WriteBatch::new();
        batch.put(Column::WalletTx, txid, record.encode());
        self.store.write_batch(&batch)?;

        self.ownership.tx_outputs.insert(txid, output_scripts(tx));
        self.txs.insert(txid, record);
        self.revision = self.revision.saturating_add(1);
        self.publish();
        Ok(true)
    }

    pub fn mark_confirmed(
        &mut self,
        txid: &Hash256,
        block: (Hash256, i32),
    ) -> Result<(), WalletError> {
        let Some(record) = self.txs.get(txid) else {
            return Err(WalletError::InvalidData("unknown wallet transaction"));
        };
        let mut updated = record.clone();
        updated.block = Some(block);
        self.store.put(Column::WalletTx, txid, &updated.encode())?;
        self.txs.insert(*txid, updated);
        self.revision = self.revision.saturating_add(1);
        Ok(())
    }
}

impl<S: KeyValueStore> CredentialStore for Wallet<S> {
    fn network(&self) -> Network {
        self.network
    }

    fn has_key(&self, key_hash: &[u8; 20]) -> bool {
        self.ownership.has_key(key_hash)
    }

    fn has_watch(&self, script: &[u8]) -> bool {
        self.ownership.has_watch(script)
    }

    fn is_spendable(&self, script: &[u8]) -> bool {
        self.ownership.is_mine(script) == IsMine::Spendable
    }

    fn insert_private(&mut self, entry: PrivateKeyEntry, label: &str) -> Result<(), WalletError> {
        if self.secrets.contains_key(&entry.key_hash) {
            return Err(WalletError::InvalidData("private key already present"));
        }
        let script_pubkey = fluxd_script::standard::p2pkh_script(&entry.key_hash);

        let mut batch = WriteBatch::new();
        batch.put(Column::WalletKey, entry.key_hash, encode_key_record(&entry));
        batch.put(Column::WalletLabel, script_pubkey.clone(), label.as_bytes());
        self.store.write_batch(&batch)?;

        self.labels.insert(script_pubkey, label.to_string());
        self.ownership
            .keys
            .insert(entry.key_hash, entry.pubkey_bytes.clone());
        self.secrets.insert(entry.key_hash, entry);
        self.insert_count = self.insert_count.saturating_add(1);
        self.publish();
        Ok(())
    }

    fn insert_watch(&mut self, entries: Vec<WatchEntry>, label: &str) -> Result<(), WalletError> {
        let mut batch = WriteBatch::new();
        let mut new_watch = Vec::new();
        let mut new_scripts = Vec::new();
        let mut labelled = Vec::new();
        for entry in entries {
            if entry.raw_script {
                let script_hash = hash160(&entry.script);
                if !self.ownership.scripts.contains_key(&script_hash)
                    && !new_scripts.iter().any(|(hash, _)| *hash == script_hash)
                {
                    batch.put(Column::WalletScript, script_hash, entry.script.as_slice());
                    new_scripts.push((script_hash, entry.script.clone()));
                }
            } else {
                batch.put(Column::WalletLabel, entry.script.as_slice(), label.as_bytes());
                labelled.push(entry.script.clone());
            }
            if !self.ownership.watch.contains(&entry.script) && !new_watch.contains(&entry.script)
            {
                batch.put(
                    Column::WalletWatch,
                    entry.script.as_slice(),
                    [u8::from(entry.raw_script)],
                );
                new_watch.push(entry.script);
            }
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.store.write_batch(&batch)?;

        let created = !new_watch.is_empty() || !new_scripts.is_empty();
        for script in labelled {
            self.labels.insert(script, label.to_string());
        }
        self.ownership.watch.extend(new_watch);
        self.ownership.scripts.extend(new_scripts);
        if created {
            self.insert_count = self.insert_count.saturating_add(1);
            self.publish();
        }
        Ok(())
    }

    fn set_label(&mut self, script_pubkey: &[u8], label: &str) -> Result<(), WalletError> {
        if self.label_for_script_pubkey(script_pubkey) == Some(label) {
            return Ok(());
        }
        self.store
            .put(Column::WalletLabel, script_pubkey, label.as_bytes())?;
        self.labels.insert(script_pubkey.to_vec(), label.to_string());
        Ok(())
    }

    fn mark_dirty(&mut self) {
        self.revision = self.revision.saturating_add(1);
    }

    fn lower_watermark(&mut self, time: i64) -> Result<(), WalletError> {
        if self.time_first_key != NO_KEY_TIME && self.time_first_key <= time {
            return Ok(());
        }
        self.store
            .put(Column::Meta, META_TIME_FIRST_KEY, &time.to_le_bytes())?;
        self.time_first_key = time;
        Ok(())
    }
}

fn output_scripts(tx: &Transaction) -> Vec<Vec<u8>> {
    tx.vout
        .iter()
        .map(|output| output.script_pubkey.clone())
        .collect()
}

fn encode_key_record(entry: &PrivateKeyEntry) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(112);
    encoder.write_u8(KEY_RECORD_VERSION);
    encoder.write_bytes(&entry.secret);
    encoder.write_bool(entry.compressed);
    encoder.write_var_bytes(&entry.pubkey_bytes);
    encoder.write_i64_le(entry.first_seen);
    encoder.into_inner()
}

fn decode_key_record(key: &[u8], bytes: &[u8]) -> Result<PrivateKeyEntry, WalletError> {
    let key_hash: [u8; 20] = key
        .try_into()
        .map_err(|_| WalletError::InvalidData("invalid key hash"))?;
    let mut decoder = Decoder::new(bytes);
    if decoder.read_u8()? != KEY_RECORD_VERSION {
        return Err(WalletError::InvalidData("unsupported key record version"));
    }
    let entry = PrivateKeyEntry {
        key_hash,
        secret: decoder.read_fixed::<32>()?,
        compressed: decoder.read_bool()?,
        pubkey_bytes: decoder.read_var_bytes()?,
        first_seen: decoder.read_i64_le()?,
    };
    decoder.finish()?;
    if hash160(&entry.pubkey_bytes) != entry.key_hash {
        return Err(WalletError::InvalidData("wallet pubkey hash mismatch"));
    }
    Ok(entry)
}

fn encode_network(network: Network) -> u8 {
    match network {
        Network::Mainnet => 0,
        Network::Testnet => 1,
        Network::Regtest => 2,
    }
}

fn decode_network(bytes: &[u8]) -> Result<Network, WalletError> {
    match bytes {
        [0] => Ok(Network::Mainnet),
        [1] => Ok(Network::Testnet),
        [2] => Ok(Network::Regtest),
        _ => Err(WalletError::InvalidData("unknown wallet network")),
    }
}

fn current_unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxd_primitives::outpoint::OutPoint;
    use fluxd_primitives::transaction::{TxIn, TxOut};
    use fluxd_script::standard::{p2pk_script, p2pkh_script, p2sh_script_for_redeem_script};
    use fluxd_storage::memory::MemoryStore;
    use secp256k1::{PublicKey, Secp256k1, SecretKey};

    fn key_entry(seed: u8) -> PrivateKeyEntry {
        let secp = Secp256k1::new();
        let secret = [seed; 32];
        let secret_key = SecretKey::from_slice(&secret).expect("secret");
        let pubkey_bytes = PublicKey::from_secret_key(&secp, &secret_key)
            .serialize()
            .to_vec();
        PrivateKeyEntry {
            key_hash: hash160(&pubkey_bytes),
            secret,
            compressed: true,
            pubkey_bytes,
            first_seen: UNKNOWN_KEY_TIME,
        }
    }

    fn paying_tx(script_pubkey: Vec<u8>) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([0x44; 32], 0),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 1000,
                script_pubkey,
            }],
            lock_time: 0,
        }
    }

    fn open_wallet(store: &Arc<MemoryStore>) -> Wallet<MemoryStore> {
        Wallet::open(Arc::clone(store), Network::Regtest).expect("wallet")
    }

    #[test]
    fn keys_and_watches_persist_across_reopen() {
        let store = Arc::new(MemoryStore::new());
        let entry = key_entry(1);
        let key_hash = entry.key_hash;
        let watched = p2pkh_script(&[9u8; 20]);
        {
            let mut wallet = open_wallet(&store);
            wallet.insert_private(entry, "mine").expect("insert key");
            wallet
                .insert_watch(vec![WatchEntry::script(watched.clone())], "watched")
                .expect("insert watch");
            wallet.lower_watermark(UNKNOWN_KEY_TIME).expect("watermark");
        }

        let wallet = open_wallet(&store);
        assert!(wallet.has_key(&key_hash));
        assert_eq!(wallet.key_first_seen(&key_hash), Some(UNKNOWN_KEY_TIME));
        assert_eq!(wallet.is_mine(&watched), IsMine::WatchOnly);
        assert_eq!(wallet.label_for_script_pubkey(&watched), Some("watched"));
        assert_eq!(
            wallet.label_for_script_pubkey(&p2pkh_script(&key_hash)),
            Some("mine")
        );
        assert_eq!(wallet.time_first_key(), UNKNOWN_KEY_TIME);
    }

    #[test]
    fn reopen_on_other_network_fails() {
        let store = Arc::new(MemoryStore::new());
        drop(open_wallet(&store));
        let err = Wallet::open(Arc::clone(&store), Network::Mainnet)
            .err()
            .expect("network mismatch");
        assert!(matches!(err, WalletError::NetworkMismatch { .. }));
    }

    #[test]
    fn watermark_only_moves_earlier() {
        let store = Arc::new(MemoryStore::new());
        let mut wallet = open_wallet(&store);
        assert_eq!(wallet.time_first_key(), NO_KEY_TIME);
        wallet.lower_watermark(1_500_000_000).expect("lower");
        assert_eq!(wallet.time_first_key(), 1_500_000_000);
        wallet.lower_watermark(1_600_000_000).expect("no-op");
        assert_eq!(wallet.time_first_key(), 1_500_000_000);
        wallet.lower_watermark(UNKNOWN_KEY_TIME).expect("lower");
        assert_eq!(wallet.time_first_key(), UNKNOWN_KEY_TIME);
    }

    #[test]
    fn ownership_follows_standard_script_rules() {
        let store = Arc::new(MemoryStore::new());
        let mut wallet = open_wallet(&store);
        let held = key_entry(2);
        let held_pubkey = held.pubkey_bytes.clone();
        let held_hash = held.key_hash;
        wallet.insert_private(held, "").expect("insert");

        assert_eq!(wallet.is_mine(&p2pkh_script(&held_hash)), IsMine::Spendable);
        assert_eq!(wallet.is_mine(&p2pk_script(&held_pubkey)), IsMine::Spendable);

        let other = key_entry(3);
        let mut multisig = vec![0x52, 33];
        multisig.extend_from_slice(&held_pubkey);
        multisig.push(33);
        multisig.extend_from_slice(&other.pubkey_bytes);
        multisig.extend_from_slice(&[0x52, 0xae]);
        assert_eq!(wallet.is_mine(&multisig), IsMine::No);

        let p2sh = p2sh_script_for_redeem_script(&multisig);
        wallet
            .insert_watch(vec![WatchEntry::redeem_script(multisig.clone())], "")
            .expect("redeem");
        assert_eq!(wallet.is_mine(&multisig), IsMine::WatchOnly);
        assert_eq!(wallet.is_mine(&p2sh), IsMine::No);

        wallet.insert_private(other, "").expect("insert other");
        assert_eq!(wallet.is_mine(&multisig), IsMine::Spendable);
        assert_eq!(wallet.is_mine(&p2sh), IsMine::Spendable);
    }

    #[test]
    fn insert_count_ignores_known_entries() {
        let store = Arc::new(MemoryStore::new());
        let mut wallet = open_wallet(&store);
        let script = p2pkh_script(&[5u8; 20]);
        wallet
            .insert_watch(vec![WatchEntry::script(script.clone())], "a")
            .expect("first");
        wallet
            .insert_watch(vec![WatchEntry::script(script.clone())], "b")
            .expect("second");
        assert_eq!(wallet.insert_count(), 1);
        assert_eq!(wallet.watch_count(), 1);
        assert_eq!(wallet.label_for_script_pubkey(&script), Some("b"));
    }

    #[test]
    fn relevant_transactions_are_recorded_and_confirmed() {
        let store = Arc::new(MemoryStore::new());
        let mut wallet = open_wallet(&store);
        let script = p2pkh_script(&[6u8; 20]);
        wallet
            .insert_watch(vec![WatchEntry::script(script.clone())], "")
            .expect("watch");

        let unrelated = paying_tx(p2pkh_script(&[7u8; 20]));
        assert!(!wallet.add_if_relevant(&unrelated, None).expect("unrelated"));

        let incoming = paying_tx(script);
        assert!(wallet.add_if_relevant(&incoming, None).expect("incoming"));
        assert_eq!(wallet.pending_transactions().expect("pending").len(), 1);

        // Spending the watched output is relevant through its input.
        let spend = Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new(incoming.txid(), 0),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 900,
                script_pubkey: p2pkh_script(&[8u8; 20]),
            }],
            lock_time: 0,
        };
        assert!(wallet.is_relevant(&spend));

        let block = ([0x11; 32], 7);
        assert!(wallet
            .add_if_relevant(&incoming, Some(block))
            .expect("confirm"));
        assert!(!wallet
            .add_if_relevant(&incoming, Some(block))
            .expect("repeat"));
        assert!(wallet.pending_transactions().expect("pending").is_empty());

        let reopened = open_wallet(&store);
        assert_eq!(
            reopened.wallet_tx(&incoming.txid()).and_then(|tx| tx.block),
            Some(block)
        );
    }

    #[test]
    fn snapshot_tracks_commits() {
        let store = Arc::new(MemoryStore::new());
        let mut wallet = open_wallet(&store);
        let handle = wallet.ownership_handle();
        let before = handle.load();
        let script = p2pkh_script(&[4u8; 20]);
        wallet
            .insert_watch(vec![WatchEntry::script(script.clone())], "")
            .expect("watch");
        assert_eq!(before.is_mine(&script), IsMine::No);
        assert_eq!(handle.load().is_mine(&script), IsMine::WatchOnly);
    }

    #[test]
    fn deferred_section_publishes_once_at_the_end() {
        let store = Arc::new(MemoryStore::new());
        let mut wallet = open_wallet(&store);
        let handle = wallet.ownership_handle();
        let first = p2pkh_script(&[5u8; 20]);
        let second = p2pkh_script(&[6u8; 20]);

        let result: Result<(), WalletError> = wallet.with_deferred_snapshot(|wallet| {
            wallet.insert_watch(vec![WatchEntry::script(first.clone())], "")?;
            wallet.with_deferred_snapshot(|wallet| {
                wallet.insert_watch(vec![WatchEntry::script(second.clone())], "")
            })?;
            assert_eq!(handle.load().is_mine(&first), IsMine::No);
            assert_eq!(handle.load().is_mine(&second), IsMine::No);
            Err(WalletError::InvalidData("stop"))
        });

        assert!(result.is_err());
        assert_eq!(handle.load().is_mine(&first), IsMine::WatchOnly);
        assert_eq!(handle.load().is_mine(&second), IsMine::WatchOnly);
    }
}
