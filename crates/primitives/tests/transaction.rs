use fluxd_primitives::block::{Block, BlockHeader, CURRENT_VERSION};
use fluxd_primitives::encoding::DecodeError;
use fluxd_primitives::{OutPoint, Transaction, TransactionDecodeError, TxIn, TxOut};

fn sample_tx(tag: u8) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new([tag; 32], 1),
            script_sig: vec![0x51],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 5_000,
            script_pubkey: vec![0x76, 0xa9, 0x14, tag],
        }],
        lock_time: 0,
    }
}

#[test]
fn transaction_decode_matches_encode() {
    let tx = sample_tx(3);
    let bytes = tx.consensus_encode();
    assert_eq!(Transaction::consensus_decode(&bytes).expect("decode"), tx);
    assert_ne!(tx.txid(), sample_tx(4).txid());
}

#[test]
fn transaction_decode_rejects_trailing_bytes() {
    let mut bytes = sample_tx(1).consensus_encode();
    bytes.push(0);
    assert_eq!(
        Transaction::consensus_decode(&bytes),
        Err(TransactionDecodeError::Decode(DecodeError::TrailingBytes))
    );
}

#[test]
fn transaction_decode_rejects_empty_inputs() {
    let mut tx = sample_tx(1);
    tx.vin.clear();
    assert_eq!(
        Transaction::consensus_decode(&tx.consensus_encode()),
        Err(TransactionDecodeError::NoInputs)
    );
}

#[test]
fn block_carries_transactions() {
    let transactions = vec![sample_tx(1), sample_tx(2), sample_tx(3)];
    let mut block = Block {
        header: BlockHeader {
            version: CURRENT_VERSION,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 1_600_000_000,
            bits: 0x207f_ffff,
            nonce: [9u8; 32],
        },
        transactions,
    };
    block.header.merkle_root = block.compute_merkle_root();

    let decoded = Block::consensus_decode(&block.consensus_encode()).expect("decode block");
    assert_eq!(decoded, block);
    assert_eq!(decoded.hash(), block.hash());
    assert_ne!(block.header.merkle_root, [0u8; 32]);
}
