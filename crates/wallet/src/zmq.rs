//! Wallet transaction notifications.
//!
//! Accepted transactions are filtered against the published ownership
//! snapshot. A relevant transaction yields one message per enabled topic:
//! `walletrawtx` carries the serialized transaction and `wallethashtx` the
//! txid in display (byte-reversed) order.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use fluxd_primitives::hash256_to_hex;
use fluxd_primitives::transaction::Transaction;
use tokio::sync::broadcast;

use crate::wallet::OwnershipHandle;

pub const TOPIC_WALLET_RAW_TX: &str = "walletrawtx";
pub const TOPIC_WALLET_HASH_TX: &str = "wallethashtx";

/// Delivers one message. Returns `false` when the message could not be sent.
pub trait PublishTransport: Send + Sync {
    fn send(&self, topic: &'static str, payload: &[u8]) -> bool;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NotificationMessage {
    pub topic: &'static str,
    pub payload: Vec<u8>,
}

/// In-process transport backed by a bounded channel.
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: Sender<NotificationMessage>,
}

impl ChannelPublisher {
    pub fn bounded(capacity: usize) -> (Self, Receiver<NotificationMessage>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx }, rx)
    }
}

impl PublishTransport for ChannelPublisher {
    fn send(&self, topic: &'static str, payload: &[u8]) -> bool {
        self.tx
            .try_send(NotificationMessage {
                topic,
                payload: payload.to_vec(),
            })
            .is_ok()
    }
}

pub trait TransactionNotifier: Send + Sync {
    fn topic(&self) -> &'static str;

    /// `true` when nothing had to be sent or the send succeeded.
    fn notify_transaction(&self, tx: &Transaction) -> bool;
}

pub struct WalletRawTxNotifier {
    ownership: OwnershipHandle,
    transport: Arc<dyn PublishTransport>,
}

impl WalletRawTxNotifier {
    pub fn new(ownership: OwnershipHandle, transport: Arc<dyn PublishTransport>) -> Self {
        Self {
            ownership,
            transport,
        }
    }
}

impl TransactionNotifier for WalletRawTxNotifier {
    fn topic(&self) -> &'static str {
        TOPIC_WALLET_RAW_TX
    }

    fn notify_transaction(&self, tx: &Transaction) -> bool {
        if !self.ownership.load().is_relevant(tx) {
            return true;
        }
        let txid = tx.txid();
        log_category!("zmq", "zmq: Publish walletrawtx {}", hash256_to_hex(&txid));
        self.transport
            .send(TOPIC_WALLET_RAW_TX, &tx.consensus_encode())
    }
}

pub struct WalletHashTxNotifier {
    ownership: OwnershipHandle,
    transport: Arc<dyn PublishTransport>,
}

impl WalletHashTxNotifier {
    pub fn new(ownership: OwnershipHandle, transport: Arc<dyn PublishTransport>) -> Self {
        Self {
            ownership,
            transport,
        }
    }
}

impl TransactionNotifier for WalletHashTxNotifier {
    fn topic(&self) -> &'static str {
        TOPIC_WALLET_HASH_TX
    }

    fn notify_transaction(&self, tx: &Transaction) -> bool {
        if !self.ownership.load().is_relevant(tx) {
            return true;
        }
        let mut hash = tx.txid();
        log_category!("zmq", "zmq: Publish wallethashtx {}", hash256_to_hex(&hash));
        hash.reverse();
        self.transport.send(TOPIC_WALLET_HASH_TX, &hash)
    }
}

#[derive(Default)]
pub struct WalletNotifiers {
    notifiers: Vec<Box<dyn TransactionNotifier>>,
}

impl WalletNotifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, notifier: Box<dyn TransactionNotifier>) {
        self.notifiers.push(notifier);
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    pub fn topics(&self) -> Vec<&'static str> {
        self.notifiers.iter().map(|notifier| notifier.topic()).collect()
    }

    /// Runs every notifier, even after one fails.
    pub fn notify(&self, tx: &Transaction) -> bool {
        let mut ok = true;
        for notifier in &self.notifiers {
            if !notifier.notify_transaction(tx) {
                log_warn!(
                    "zmq: failed to publish {} for {}",
                    notifier.topic(),
                    hash256_to_hex(&tx.txid())
                );
                ok = false;
            }
        }
        ok
    }
}

/// Feeds accepted transactions to the notifiers until the channel closes.
pub async fn wallet_notify_loop(
    mut rx: broadcast::Receiver<Arc<Transaction>>,
    notifiers: WalletNotifiers,
) {
    loop {
        match rx.recv().await {
            Ok(tx) => {
                notifiers.notify(&tx);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log_warn!("zmq: notifier lagged, skipped {skipped} transaction(s)");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
