//! Validation and registration of a single import item.

use std::fmt;
use std::sync::OnceLock;

use fluxd_chainstate::ChainError;
use fluxd_primitives::hash::hash160;
use fluxd_primitives::{decode_destination, wif_to_secret_key};
use fluxd_script::standard::{p2pk_script, p2pkh_script, p2sh_script_for_redeem_script};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use zeroize::Zeroize;

use crate::rescan::RescanError;
use crate::wallet::{CredentialStore, PrivateKeyEntry, WalletError, WatchEntry, UNKNOWN_KEY_TIME};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImportKind {
    PrivateKey,
    PublicKey,
    AddressOrScript,
}

impl ImportKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "privkey" => Some(Self::PrivateKey),
            "pubkey" => Some(Self::PublicKey),
            "address" | "script" => Some(Self::AddressOrScript),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImportItem {
    pub kind: ImportKind,
    pub value: String,
    pub label: String,
    /// Epoch seconds; `None` leaves the rescan start unconstrained by this item.
    pub timestamp: Option<i64>,
    pub treat_as_script: bool,
}

impl ImportItem {
    pub fn new(kind: ImportKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            label: String::new(),
            timestamp: None,
            treat_as_script: false,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn as_script(mut self) -> Self {
        self.treat_as_script = true;
        self
    }
}

#[derive(Debug)]
pub enum ImportError {
    InvalidArgument(String),
    InvalidCredential(String),
    OutOfRange(String),
    /// An item failed mid-batch; earlier items stay applied.
    ImportFailed {
        index: usize,
        source: Box<ImportError>,
    },
    Wallet(WalletError),
    Chain(ChainError),
    Rescan(RescanError),
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportError::InvalidArgument(message)
            | ImportError::InvalidCredential(message)
            | ImportError::OutOfRange(message) => write!(f, "{message}"),
            ImportError::ImportFailed { index, source } => {
                write!(f, "Invalid JSON request (item {index}: {source})")
            }
            ImportError::Wallet(err) => write!(f, "{err}"),
            ImportError::Chain(err) => write!(f, "{err}"),
            ImportError::Rescan(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ImportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ImportError::ImportFailed { source, .. } => Some(source.as_ref()),
            ImportError::Wallet(err) => Some(err),
            ImportError::Chain(err) => Some(err),
            ImportError::Rescan(err) => Some(err),
            _ => None,
        }
    }
}

impl From<WalletError> for ImportError {
    fn from(err: WalletError) -> Self {
        ImportError::Wallet(err)
    }
}

impl From<ChainError> for ImportError {
    fn from(err: ChainError) -> Self {
        ImportError::Chain(err)
    }
}

impl From<RescanError> for ImportError {
    fn from(err: RescanError) -> Self {
        ImportError::Rescan(err)
    }
}

/// Applies one item to `store`. Each call commits at most one store batch.
pub fn import_item<W: CredentialStore>(store: &mut W, item: &ImportItem) -> Result<(), ImportError> {
    match item.kind {
        ImportKind::PrivateKey => import_private_key(store, &item.value, &item.label),
        ImportKind::PublicKey => import_public_key(store, &item.value, &item.label),
        ImportKind::AddressOrScript => {
            import_address_or_script(store, &item.value, &item.label, item.treat_as_script)
        }
    }
}

fn import_private_key<W: CredentialStore>(
    store: &mut W,
    wif: &str,
    label: &str,
) -> Result<(), ImportError> {
    let (mut secret, compressed) = wif_to_secret_key(wif, store.network())
        .map_err(|_| ImportError::InvalidCredential("Invalid private key encoding".to_string()))?;
    let secret_key = SecretKey::from_slice(&secret);
    let Ok(secret_key) = secret_key else {
        secret.zeroize();
        return Err(ImportError::InvalidCredential(
            "Private key outside allowed range".to_string(),
        ));
    };
    let pubkey = PublicKey::from_secret_key(secp(), &secret_key);
    let pubkey_bytes = if compressed {
        pubkey.serialize().to_vec()
    } else {
        pubkey.serialize_uncompressed().to_vec()
    };
    let entry = PrivateKeyEntry {
        key_hash: hash160(&pubkey_bytes),
        secret,
        compressed,
        pubkey_bytes,
        first_seen: UNKNOWN_KEY_TIME,
    };
    secret.zeroize();

    store.mark_dirty();
    if store.has_key(&entry.key_hash) {
        store.set_label(&p2pkh_script(&entry.key_hash), label)?;
        return Ok(());
    }
    store.insert_private(entry, label)?;
    store.lower_watermark(UNKNOWN_KEY_TIME)?;
    Ok(())
}

fn import_public_key<W: CredentialStore>(
    store: &mut W,
    value: &str,
    label: &str,
) -> Result<(), ImportError> {
    let bytes = hex::decode(value)
        .map_err(|_| ImportError::InvalidCredential("Pubkey must be a hex string".to_string()))?;
    let pubkey = PublicKey::from_slice(&bytes).map_err(|_| {
        ImportError::InvalidCredential("Pubkey is not a valid public key".to_string())
    })?;
    // Keep the encoding the caller supplied; the key hash depends on it.
    let pubkey_bytes = if bytes.len() == 33 {
        pubkey.serialize().to_vec()
    } else {
        pubkey.serialize_uncompressed().to_vec()
    };

    let entries = vec![
        WatchEntry::script(p2pkh_script(&hash160(&pubkey_bytes))),
        WatchEntry::script(p2pk_script(&pubkey_bytes)),
    ];
    ensure_not_spendable(store, &entries)?;
    store.mark_dirty();
    store.insert_watch(entries, label)?;
    Ok(())
}

fn import_address_or_script<W: CredentialStore>(
    store: &mut W,
    value: &str,
    label: &str,
    treat_as_script: bool,
) -> Result<(), ImportError> {
    if let Ok(destination) = decode_destination(value, store.network()) {
        if treat_as_script {
            return Err(ImportError::InvalidArgument(
                "Cannot use the p2sh flag with an address - use a script instead".to_string(),
            ));
        }
        let entries = vec![WatchEntry::script(destination.script_pubkey())];
        ensure_not_spendable(store, &entries)?;
        store.mark_dirty();
        store.insert_watch(entries, label)?;
        return Ok(());
    }

    let script = match hex::decode(value) {
        Ok(script) if !script.is_empty() => script,
        _ => {
            return Err(ImportError::InvalidCredential(
                "Invalid Flux address or script".to_string(),
            ))
        }
    };

    let entries = if treat_as_script {
        // The P2SH output paying to the redeem script carries the label.
        // Only that output is checked; the redeem script itself may be
        // spendable by keys the wallet already holds.
        let p2sh = vec![WatchEntry::script(p2sh_script_for_redeem_script(&script))];
        ensure_not_spendable(store, &p2sh)?;
        let mut entries = vec![WatchEntry::redeem_script(script)];
        entries.extend(p2sh);
        entries
    } else {
        let entries = vec![WatchEntry::script(script)];
        ensure_not_spendable(store, &entries)?;
        entries
    };
    store.mark_dirty();
    store.insert_watch(entries, label)?;
    Ok(())
}

fn ensure_not_spendable<W: CredentialStore>(
    store: &W,
    entries: &[WatchEntry],
) -> Result<(), ImportError> {
    if entries.iter().any(|entry| store.is_spendable(&entry.script)) {
        return Err(ImportError::Wallet(WalletError::AlreadyHaveKey));
    }
    Ok(())
}

fn secp() -> &'static Secp256k1<secp256k1::All> {
    static SECP: OnceLock<Secp256k1<secp256k1::All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fluxd_consensus::params::Network;
    use fluxd_primitives::secret_key_to_wif;
    use fluxd_storage::memory::MemoryStore;

    use crate::wallet::{IsMine, Wallet};

    fn wallet() -> Wallet<MemoryStore> {
        Wallet::open(Arc::new(MemoryStore::new()), Network::Regtest).expect("wallet")
    }

    fn pubkey_hex(seed: u8) -> String {
        let secret_key = SecretKey::from_slice(&[seed; 32]).expect("secret");
        hex::encode(PublicKey::from_secret_key(secp(), &secret_key).serialize())
    }

    #[test]
    fn kind_names() {
        assert_eq!(ImportKind::parse("privkey"), Some(ImportKind::PrivateKey));
        assert_eq!(ImportKind::parse("pubkey"), Some(ImportKind::PublicKey));
        assert_eq!(ImportKind::parse("script"), Some(ImportKind::AddressOrScript));
        assert_eq!(ImportKind::parse("xpub"), None);
    }

    #[test]
    fn private_key_import_sets_unknown_first_seen() {
        let mut wallet = wallet();
        let wif = secret_key_to_wif(&[7u8; 32], Network::Regtest, true);
        import_item(&mut wallet, &ImportItem::new(ImportKind::PrivateKey, wif)).expect("import");
        assert_eq!(wallet.key_count(), 1);
        assert_eq!(wallet.time_first_key(), UNKNOWN_KEY_TIME);
    }

    #[test]
    fn zero_secret_is_out_of_range() {
        let mut wallet = wallet();
        let wif = secret_key_to_wif(&[0u8; 32], Network::Regtest, true);
        let err = import_item(&mut wallet, &ImportItem::new(ImportKind::PrivateKey, wif))
            .expect_err("zero key");
        assert!(
            matches!(err, ImportError::InvalidCredential(ref message) if message == "Private key outside allowed range")
        );
        assert_eq!(wallet.key_count(), 0);
    }

    #[test]
    fn wif_for_other_network_is_rejected() {
        let mut wallet = wallet();
        let wif = secret_key_to_wif(&[7u8; 32], Network::Mainnet, true);
        let err = import_item(&mut wallet, &ImportItem::new(ImportKind::PrivateKey, wif))
            .expect_err("wrong network");
        assert!(matches!(err, ImportError::InvalidCredential(_)));
    }

    #[test]
    fn public_key_registers_both_scripts() {
        let mut wallet = wallet();
        let value = pubkey_hex(3);
        import_item(
            &mut wallet,
            &ImportItem::new(ImportKind::PublicKey, value.clone()).with_label("cold"),
        )
        .expect("import");
        let bytes = hex::decode(&value).expect("hex");
        assert_eq!(wallet.is_mine(&p2pk_script(&bytes)), IsMine::WatchOnly);
        assert_eq!(
            wallet.is_mine(&p2pkh_script(&hash160(&bytes))),
            IsMine::WatchOnly
        );
        assert_eq!(wallet.watch_count(), 2);
        assert_eq!(wallet.insert_count(), 1);
    }

    #[test]
    fn public_key_errors() {
        let mut wallet = wallet();
        let err = import_item(&mut wallet, &ImportItem::new(ImportKind::PublicKey, "zz"))
            .expect_err("not hex");
        assert_eq!(err.to_string(), "Pubkey must be a hex string");
        let err = import_item(&mut wallet, &ImportItem::new(ImportKind::PublicKey, "02abcd"))
            .expect_err("not a point");
        assert_eq!(err.to_string(), "Pubkey is not a valid public key");
    }

    #[test]
    fn watching_a_held_key_is_rejected() {
        let mut wallet = wallet();
        let wif = secret_key_to_wif(&[3u8; 32], Network::Regtest, true);
        import_item(&mut wallet, &ImportItem::new(ImportKind::PrivateKey, wif)).expect("key");
        let err = import_item(&mut wallet, &ImportItem::new(ImportKind::PublicKey, pubkey_hex(3)))
            .expect_err("already spendable");
        assert!(matches!(
            err,
            ImportError::Wallet(WalletError::AlreadyHaveKey)
        ));
    }

    #[test]
    fn garbage_is_neither_address_nor_script() {
        let mut wallet = wallet();
        for value in ["", "not-hex-garbage", "abc"] {
            let err = import_item(
                &mut wallet,
                &ImportItem::new(ImportKind::AddressOrScript, value),
            )
            .expect_err("garbage");
            assert_eq!(err.to_string(), "Invalid Flux address or script");
        }
    }

    #[test]
    fn surrounding_whitespace_is_rejected() {
        let mut wallet = wallet();
        let wif = secret_key_to_wif(&[7u8; 32], Network::Regtest, true);
        let cases = [
            (ImportKind::PrivateKey, format!(" {wif}"), "Invalid private key encoding"),
            (ImportKind::PublicKey, format!("{}\n", pubkey_hex(4)), "Pubkey must be a hex string"),
            (
                ImportKind::AddressOrScript,
                format!(" {}", hex::encode(p2pkh_script(&[9u8; 20]))),
                "Invalid Flux address or script",
            ),
        ];
        for (kind, value, message) in cases {
            let err = import_item(&mut wallet, &ImportItem::new(kind, value)).expect_err("padded");
            assert_eq!(err.to_string(), message);
        }
        assert_eq!(wallet.insert_count(), 0);
    }

    #[test]
    fn reimporting_a_spendable_redeem_script_is_rejected() {
        let mut wallet = wallet();
        let wif = secret_key_to_wif(&[6u8; 32], Network::Regtest, true);
        import_item(&mut wallet, &ImportItem::new(ImportKind::PrivateKey, wif)).expect("key");

        let pubkey = hex::decode(pubkey_hex(6)).expect("hex");
        let mut redeem = vec![0x51, 33];
        redeem.extend_from_slice(&pubkey);
        redeem.extend_from_slice(&[0x51, 0xae]);
        let item = ImportItem::new(ImportKind::AddressOrScript, hex::encode(&redeem)).as_script();

        // The redeem script is spendable, but its P2SH output is not known yet.
        import_item(&mut wallet, &item).expect("first import");
        assert_eq!(
            wallet.is_mine(&p2sh_script_for_redeem_script(&redeem)),
            IsMine::Spendable
        );

        let err = import_item(&mut wallet, &item).expect_err("already spendable");
        assert!(matches!(
            err,
            ImportError::Wallet(WalletError::AlreadyHaveKey)
        ));
        assert_eq!(wallet.script_count(), 1);
    }
}
