use std::sync::{Arc, Mutex};
use std::thread;

use fluxd_chainstate::{ChainIndex, ChainPosition};
use fluxd_consensus::params::Network;
use fluxd_consensus::Hash256;
use fluxd_primitives::block::{Block, BlockHeader, CURRENT_VERSION};
use fluxd_primitives::hash::hash160;
use fluxd_primitives::outpoint::OutPoint;
use fluxd_primitives::transaction::{Transaction, TxIn, TxOut};
use fluxd_primitives::{encode_destination, secret_key_to_wif, Destination};
use fluxd_script::standard::{p2pkh_script, p2sh_script_for_redeem_script};
use fluxd_storage::memory::MemoryStore;
use fluxd_storage::{Column, KeyValueStore};
use fluxd_wallet::import::{ImportError, ImportItem, ImportKind};
use fluxd_wallet::importmulti::{handle_importmulti, RPC_MISC_ERROR};
use fluxd_wallet::node::WalletNode;
use fluxd_wallet::rescan::{HistoryScanner, RescanError, ScanSummary};
use fluxd_wallet::wallet::{CredentialStore, IsMine, Wallet, UNKNOWN_KEY_TIME};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde_json::json;

const NETWORK: Network = Network::Regtest;

fn node_with_store() -> (Arc<MemoryStore>, WalletNode<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let node = WalletNode::open(Arc::clone(&store), NETWORK).expect("node");
    (store, node)
}

fn new_node() -> WalletNode<MemoryStore> {
    node_with_store().1
}

fn pubkey_bytes(seed: u8) -> Vec<u8> {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[seed; 32]).expect("secret");
    PublicKey::from_secret_key(&secp, &secret).serialize().to_vec()
}

fn wif(seed: u8) -> String {
    secret_key_to_wif(&[seed; 32], NETWORK, true)
}

fn key_script(seed: u8) -> Vec<u8> {
    p2pkh_script(&hash160(&pubkey_bytes(seed)))
}

fn key_address(seed: u8) -> String {
    encode_destination(
        &Destination::PubKeyHash(hash160(&pubkey_bytes(seed))),
        NETWORK,
    )
}

fn address_item(seed: u8) -> ImportItem {
    ImportItem::new(ImportKind::AddressOrScript, key_address(seed))
}

fn coinbase(height: u32, script_pubkey: Vec<u8>) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 50,
            script_pubkey,
        }],
        lock_time: 0,
    }
}

fn make_block(prev_block: Hash256, time: u32, transactions: Vec<Transaction>) -> Block {
    let mut block = Block {
        header: BlockHeader {
            version: CURRENT_VERSION,
            prev_block,
            merkle_root: [0u8; 32],
            time,
            bits: 0x207f_ffff,
            nonce: [0u8; 32],
        },
        transactions,
    };
    block.header.merkle_root = block.compute_merkle_root();
    block
}

/// Connects one block per entry of `times`, each paying its coinbase to
/// `payees[height]` when given.
fn build_chain(node: &WalletNode<MemoryStore>, times: &[u32], payees: &[Option<Vec<u8>>]) {
    let mut prev = [0u8; 32];
    for (height, time) in times.iter().enumerate() {
        let payee = payees
            .get(height)
            .cloned()
            .flatten()
            .unwrap_or_else(|| p2pkh_script(&[0xee; 20]));
        let block = make_block(prev, *time, vec![coinbase(height as u32, payee)]);
        let position = node.connect_block(&block).expect("connect");
        prev = *position.hash();
    }
}

#[derive(Default)]
struct RecordingScanner {
    starts: Mutex<Vec<i32>>,
}

impl HistoryScanner<MemoryStore> for RecordingScanner {
    fn scan_from(
        &self,
        _chain: &ChainIndex<MemoryStore>,
        _wallet: &mut Wallet<MemoryStore>,
        start: &ChainPosition,
        reprocess_pending: bool,
    ) -> Result<ScanSummary, RescanError> {
        assert!(reprocess_pending);
        self.starts.lock().expect("starts").push(start.height());
        Ok(ScanSummary {
            start_height: start.height(),
            ..ScanSummary::default()
        })
    }
}

#[test]
fn valid_batch_without_rescan_inserts_each_item_once() {
    let node = new_node();
    let redeem = {
        let mut script = vec![0x51, 33];
        script.extend_from_slice(&pubkey_bytes(9));
        script.extend_from_slice(&[0x51, 0xae]);
        script
    };
    let items = vec![
        ImportItem::new(ImportKind::PrivateKey, wif(1)).with_label("hot"),
        ImportItem::new(ImportKind::PublicKey, hex::encode(pubkey_bytes(2))),
        address_item(3),
        ImportItem::new(ImportKind::AddressOrScript, hex::encode(key_script(4))),
        ImportItem::new(ImportKind::AddressOrScript, hex::encode(&redeem)).as_script(),
    ];

    assert_eq!(node.import_multi(&items, false).expect("import"), None);

    let wallet = node.try_wallet().expect("wallet free");
    assert_eq!(wallet.insert_count(), items.len() as u64);
    assert!(wallet.has_key(&hash160(&pubkey_bytes(1))));
    assert_eq!(wallet.is_mine(&key_script(1)), IsMine::Spendable);
    assert_eq!(wallet.is_mine(&key_script(2)), IsMine::WatchOnly);
    assert_eq!(wallet.is_mine(&key_script(3)), IsMine::WatchOnly);
    assert_eq!(wallet.is_mine(&key_script(4)), IsMine::WatchOnly);
    assert_eq!(
        wallet.is_mine(&p2sh_script_for_redeem_script(&redeem)),
        IsMine::WatchOnly
    );
    assert_eq!(wallet.script_count(), 1);
    assert_eq!(wallet.label_for_script_pubkey(&key_script(1)), Some("hot"));
    assert_eq!(wallet.time_first_key(), UNKNOWN_KEY_TIME);
}

#[test]
fn reimporting_a_private_key_only_touches_its_label() {
    let (store, node) = node_with_store();
    let item = ImportItem::new(ImportKind::PrivateKey, wif(5)).with_label("first");
    node.import_multi(std::slice::from_ref(&item), false)
        .expect("first import");
    let keys_before = store.scan_prefix(Column::WalletKey, &[]).expect("scan");
    let revision_before = node.try_wallet().expect("wallet").revision();

    let again = ImportItem::new(ImportKind::PrivateKey, wif(5)).with_label("second");
    node.import_multi(&[again], false).expect("re-import");

    let keys_after = store.scan_prefix(Column::WalletKey, &[]).expect("scan");
    assert_eq!(keys_before, keys_after);
    let wallet = node.try_wallet().expect("wallet");
    assert_eq!(wallet.key_count(), 1);
    assert_eq!(wallet.insert_count(), 1);
    assert!(wallet.revision() > revision_before);
    assert_eq!(wallet.label_for_script_pubkey(&key_script(5)), Some("second"));
}

#[test]
fn private_key_upgrades_watch_only_address() {
    let node = new_node();
    node.import_multi(&[address_item(6)], false)
        .expect("watch import");
    assert_eq!(
        node.ownership().load().is_mine(&key_script(6)),
        IsMine::WatchOnly
    );

    node.import_multi(&[ImportItem::new(ImportKind::PrivateKey, wif(6))], false)
        .expect("key import");

    let wallet = node.try_wallet().expect("wallet");
    assert_eq!(wallet.is_mine(&key_script(6)), IsMine::Spendable);
    assert!(wallet.has_watch(&key_script(6)));
    assert_eq!(wallet.watch_count(), 1);
    assert_eq!(wallet.key_count(), 1);
}

#[test]
fn rescan_starts_at_the_earliest_timestamp_ignoring_items_without_one() {
    let node = new_node();
    build_chain(&node, &[10, 40, 90, 180], &[]);
    let scanner = RecordingScanner::default();

    let items = vec![
        address_item(10).with_timestamp(100),
        address_item(11).with_timestamp(50),
        address_item(12),
        address_item(13).with_timestamp(200),
    ];
    node.import_multi_with_scanner(&items, true, &scanner)
        .expect("import");

    let items = vec![address_item(14), address_item(15).with_timestamp(100)];
    node.import_multi_with_scanner(&items, true, &scanner)
        .expect("import");

    let items = vec![address_item(16), address_item(17)];
    node.import_multi_with_scanner(&items, true, &scanner)
        .expect("import");

    // 50 -> height 1, 100 -> height 2, no timestamps -> genesis.
    assert_eq!(*scanner.starts.lock().expect("starts"), vec![1, 2, 0]);
}

#[test]
fn timestamp_before_genesis_is_out_of_range_without_mutations() {
    let node = new_node();
    build_chain(&node, &[1_000, 2_000], &[]);
    let items = vec![
        ImportItem::new(ImportKind::PrivateKey, wif(20)).with_timestamp(5_000),
        address_item(21).with_timestamp(999),
    ];

    let err = node.import_multi(&items, true).expect_err("out of range");
    assert!(
        matches!(err, ImportError::OutOfRange(ref message) if message == "No block before timestamp")
    );

    let wallet = node.try_wallet().expect("wallet");
    assert_eq!(wallet.insert_count(), 0);
    assert_eq!(wallet.key_count(), 0);
    assert_eq!(wallet.watch_count(), 0);
}

#[test]
fn failing_item_leaves_earlier_items_applied() {
    let node = new_node();
    let items = vec![
        ImportItem::new(ImportKind::PrivateKey, wif(30)),
        ImportItem::new(ImportKind::PrivateKey, "not-hex-garbage"),
        address_item(31),
    ];

    let err = node.import_multi(&items, false).expect_err("second item fails");
    match err {
        ImportError::ImportFailed { index, source } => {
            assert_eq!(index, 1);
            assert!(matches!(*source, ImportError::InvalidCredential(_)));
        }
        other => panic!("unexpected error {other:?}"),
    }

    let wallet = node.try_wallet().expect("wallet");
    assert_eq!(wallet.key_count(), 1);
    assert!(wallet.has_key(&hash160(&pubkey_bytes(30))));
    assert_eq!(wallet.watch_count(), 0);
    drop(wallet);

    // The committed prefix is visible to snapshot readers.
    let snapshot = node.ownership().load();
    assert_eq!(snapshot.is_mine(&key_script(30)), IsMine::Spendable);
    assert_eq!(snapshot.is_mine(&key_script(31)), IsMine::No);
}

#[test]
fn snapshot_is_published_once_the_batch_ends() {
    let node = new_node();
    let handle = node.ownership();
    let before = handle.load();
    let items: Vec<ImportItem> = (70..80).map(address_item).collect();

    node.import_multi(&items, false).expect("import");

    let after = handle.load();
    for seed in 70..80 {
        assert_eq!(before.is_mine(&key_script(seed)), IsMine::No);
        assert_eq!(after.is_mine(&key_script(seed)), IsMine::WatchOnly);
    }
}

#[test]
fn p2sh_flag_with_an_address_is_an_invalid_argument() {
    let node = new_node();
    let err = node
        .import_multi(&[address_item(40).as_script()], false)
        .expect_err("address with p2sh flag");
    match err {
        ImportError::ImportFailed { source, .. } => {
            assert!(matches!(*source, ImportError::InvalidArgument(_)));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(node.try_wallet().expect("wallet").insert_count(), 0);
}

#[test]
fn rescan_records_history_and_reprocesses_pending() {
    let node = new_node();
    let mine = key_script(50);
    build_chain(
        &node,
        &[100, 200, 300],
        &[None, Some(mine.clone()), None],
    );

    // Unconfirmed spend recorded before the key is known to be ours.
    node.import_multi(&[address_item(51)], false)
        .expect("watch");
    let pending = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new([0x77; 32], 0),
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 10,
            script_pubkey: key_script(51),
        }],
        lock_time: 0,
    };
    assert!(node.accept_transaction(pending.clone()).expect("accept"));

    let mut rx = node.subscribe();
    let summary = node
        .import_multi(
            &[ImportItem::new(ImportKind::PrivateKey, wif(50)).with_timestamp(150)],
            true,
        )
        .expect("import")
        .expect("rescan ran");

    assert_eq!(summary.start_height, 0);
    assert_eq!(summary.blocks_scanned, 3);
    assert_eq!(summary.transactions_found, 1);
    assert_eq!(summary.pending_confirmed, 0);
    assert_eq!(summary.reaccepted, vec![pending.clone()]);
    // Already announced when it was accepted.
    assert!(rx.try_recv().is_err());

    let wallet = node.try_wallet().expect("wallet");
    assert_eq!(wallet.tx_count(), 2);
}

#[test]
fn reopened_node_announces_pending_transactions_once() {
    let (store, node) = node_with_store();
    build_chain(&node, &[100, 200], &[]);
    node.import_multi(&[address_item(52)], false)
        .expect("watch");
    let pending = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new([0x78; 32], 0),
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 10,
            script_pubkey: key_script(52),
        }],
        lock_time: 0,
    };
    assert!(node.accept_transaction(pending.clone()).expect("accept"));
    drop(node);

    let reopened = WalletNode::open(store, NETWORK).expect("reopen");
    let mut rx = reopened.subscribe();
    for _ in 0..2 {
        let summary = reopened
            .import_multi(&[address_item(53)], true)
            .expect("import")
            .expect("rescan ran");
        assert_eq!(summary.reaccepted, vec![pending.clone()]);
    }
    assert_eq!(rx.try_recv().expect("reaccepted").as_ref(), &pending);
    assert!(rx.try_recv().is_err());
}

#[test]
fn rescan_on_empty_chain_is_skipped() {
    let node = new_node();
    let result = node
        .import_multi(&[address_item(60).with_timestamp(10)], true)
        .expect("import");
    assert_eq!(result, None);
    assert_eq!(node.try_wallet().expect("wallet").watch_count(), 1);
}

#[test]
fn connected_blocks_confirm_wallet_transactions() {
    let node = new_node();
    node.import_multi(&[address_item(70)], false)
        .expect("watch");
    let payment = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new([0x55; 32], 1),
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 25,
            script_pubkey: key_script(70),
        }],
        lock_time: 0,
    };
    node.accept_transaction(payment.clone()).expect("accept");
    assert_eq!(
        node.try_wallet()
            .expect("wallet")
            .pending_transactions()
            .expect("pending")
            .len(),
        1
    );

    let block = make_block(
        [0u8; 32],
        500,
        vec![coinbase(0, p2pkh_script(&[0xee; 20])), payment.clone()],
    );
    let position = node.connect_block(&block).expect("connect");

    let wallet = node.try_wallet().expect("wallet");
    assert!(wallet.pending_transactions().expect("pending").is_empty());
    assert_eq!(
        wallet.wallet_tx(&payment.txid()).and_then(|tx| tx.block),
        Some((*position.hash(), 0))
    );
}

#[test]
fn json_request_round_trip() {
    let node = new_node();
    let params = json!([
        [
            {"type": "privkey", "value": wif(80), "label": "json"},
            {"type": "address", "value": key_address(81), "timestamp": 0},
        ],
        {"rescan": false}
    ]);
    assert_eq!(
        handle_importmulti(&node, &params).expect("import"),
        serde_json::Value::Null
    );
    assert_eq!(node.try_wallet().expect("wallet").insert_count(), 2);

    let err = handle_importmulti(&node, &json!([[{"type": "privkey", "value": "junk"}], false]))
        .expect_err("bad key");
    assert_eq!(err.code, RPC_MISC_ERROR);
    assert!(err.message.starts_with("Invalid JSON request"));

    let err = handle_importmulti(&node, &json!("nope")).expect_err("usage");
    assert_eq!(err.code, RPC_MISC_ERROR);
    assert!(err.message.starts_with("importmulti"));
}

struct BlockingScanner {
    entered: crossbeam_channel::Sender<()>,
    release: crossbeam_channel::Receiver<()>,
}

impl HistoryScanner<MemoryStore> for BlockingScanner {
    fn scan_from(
        &self,
        _chain: &ChainIndex<MemoryStore>,
        _wallet: &mut Wallet<MemoryStore>,
        start: &ChainPosition,
        _reprocess_pending: bool,
    ) -> Result<ScanSummary, RescanError> {
        let _ = self.entered.send(());
        let _ = self.release.recv();
        Ok(ScanSummary {
            start_height: start.height(),
            ..ScanSummary::default()
        })
    }
}

#[test]
fn rescan_holds_both_locks_until_it_finishes() {
    let node = Arc::new(new_node());
    build_chain(&node, &[100, 200], &[]);
    let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded(1);

    let worker = {
        let node = Arc::clone(&node);
        thread::spawn(move || {
            let scanner = BlockingScanner {
                entered: entered_tx,
                release: release_rx,
            };
            node.import_multi_with_scanner(&[address_item(90)], true, &scanner)
        })
    };

    entered_rx.recv().expect("scanner entered");
    assert!(node.try_chain().is_none());
    assert!(node.try_wallet().is_none());
    // Readers of the ownership snapshot are not blocked.
    assert_eq!(
        node.ownership().load().is_mine(&key_script(90)),
        IsMine::WatchOnly
    );

    release_tx.send(()).expect("release");
    let summary = worker
        .join()
        .expect("worker")
        .expect("import")
        .expect("rescan ran");
    assert_eq!(summary.start_height, 0);
    assert!(node.try_chain().is_some());
    assert!(node.try_wallet().is_some());
}
