use fluxd_storage::memory::MemoryStore;
use fluxd_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn prefix_scan_stays_within_column() {
    let store = MemoryStore::new();
    store.put(Column::WalletWatch, b"ab1", b"1").expect("put");
    store.put(Column::WalletWatch, b"ab2", b"2").expect("put");
    store.put(Column::WalletWatch, b"ac", b"3").expect("put");
    store.put(Column::WalletLabel, b"ab3", b"x").expect("put");

    let rows = store.scan_prefix(Column::WalletWatch, b"ab").expect("scan");
    assert_eq!(
        rows,
        vec![
            (b"ab1".to_vec(), b"1".to_vec()),
            (b"ab2".to_vec(), b"2".to_vec()),
        ]
    );

    let mut visited = Vec::new();
    store
        .for_each_prefix(Column::WalletWatch, b"", &mut |key, _| {
            visited.push(key.to_vec());
            Ok(())
        })
        .expect("visit");
    assert_eq!(visited.len(), 3);
}

#[test]
fn batch_applies_puts_and_deletes() {
    let store = MemoryStore::new();
    store.put(Column::Meta, b"gone", b"v").expect("put");

    let mut batch = WriteBatch::new();
    batch.put(Column::WalletKey, [1u8; 20], b"key");
    batch.put(Column::WalletLabel, b"script".as_slice(), b"label".as_slice());
    batch.delete(Column::Meta, b"gone");
    assert_eq!(batch.len(), 3);
    store.write_batch(&batch).expect("commit");

    assert_eq!(store.get(Column::Meta, b"gone").expect("get"), None);
    assert_eq!(
        store.get(Column::WalletKey, &[1u8; 20]).expect("get"),
        Some(b"key".to_vec())
    );
    assert_eq!(store.column_len(Column::WalletLabel).expect("len"), 1);
}

#[test]
fn wallet_columns_are_flagged() {
    assert!(Column::WalletTx.is_wallet());
    assert!(!Column::HeaderIndex.is_wallet());
    assert!(!Column::Meta.is_wallet());
}
