//! Append-only chain index used to locate and replay block history.

pub mod index;
pub mod txindex;

pub use index::{ChainError, ChainIndex, ChainPosition, HeaderEntry};
pub use txindex::{TxIndex, TxLocation};
