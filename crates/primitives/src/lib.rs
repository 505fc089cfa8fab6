//! Transparent block/transaction types, consensus serialization and address encodings.

pub mod address;
pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod script;
pub mod transaction;

pub use address::{
    address_to_script_pubkey, decode_destination, encode_destination, script_pubkey_to_address,
    secret_key_to_wif, wif_to_secret_key, AddressError, Destination,
};
pub use block::{Block, BlockHeader};
pub use hash::{hash160, hash256_to_hex, sha256, sha256d};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TransactionDecodeError, TxIn, TxOut};
