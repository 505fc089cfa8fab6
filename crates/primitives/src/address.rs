//! Base58check transparent addresses and WIF secret keys.

use fluxd_consensus::{chain_params, Network};

use crate::script::{is_p2pkh, is_p2sh, p2pkh_script, p2sh_script};

#[derive(Debug, Eq, PartialEq)]
pub enum AddressError {
    InvalidLength,
    InvalidCharacter,
    InvalidChecksum,
    UnknownPrefix,
}

impl std::fmt::Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressError::InvalidLength => write!(f, "invalid payload length"),
            AddressError::InvalidCharacter => write!(f, "invalid base58 character"),
            AddressError::InvalidChecksum => write!(f, "invalid base58 checksum"),
            AddressError::UnknownPrefix => write!(f, "unknown version prefix"),
        }
    }
}

impl std::error::Error for AddressError {}

/// What a transparent address pays to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Destination {
    PubKeyHash([u8; 20]),
    ScriptHash([u8; 20]),
}

impl Destination {
    pub fn script_pubkey(&self) -> Vec<u8> {
        match self {
            Destination::PubKeyHash(hash) => p2pkh_script(hash),
            Destination::ScriptHash(hash) => p2sh_script(hash),
        }
    }

    pub fn from_script_pubkey(script: &[u8]) -> Option<Self> {
        if is_p2pkh(script) {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&script[3..23]);
            return Some(Destination::PubKeyHash(hash));
        }
        if is_p2sh(script) {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&script[2..22]);
            return Some(Destination::ScriptHash(hash));
        }
        None
    }
}

pub fn decode_destination(address: &str, network: Network) -> Result<Destination, AddressError> {
    let payload = base58check_decode(address)?;
    let params = chain_params(network);

    let (prefix, hash) = payload.split_at(payload.len().min(2));
    let hash: [u8; 20] = hash.try_into().map_err(|_| AddressError::InvalidLength)?;
    if prefix == params.pubkey_address_prefix {
        return Ok(Destination::PubKeyHash(hash));
    }
    if prefix == params.script_address_prefix {
        return Ok(Destination::ScriptHash(hash));
    }
    Err(AddressError::UnknownPrefix)
}

pub fn encode_destination(destination: &Destination, network: Network) -> String {
    let params = chain_params(network);
    let (prefix, hash) = match destination {
        Destination::PubKeyHash(hash) => (params.pubkey_address_prefix, hash),
        Destination::ScriptHash(hash) => (params.script_address_prefix, hash),
    };
    let mut payload = Vec::with_capacity(prefix.len() + hash.len());
    payload.extend_from_slice(&prefix);
    payload.extend_from_slice(hash);
    bs58::encode(payload).with_check().into_string()
}

pub fn address_to_script_pubkey(address: &str, network: Network) -> Result<Vec<u8>, AddressError> {
    decode_destination(address, network).map(|destination| destination.script_pubkey())
}

pub fn script_pubkey_to_address(script: &[u8], network: Network) -> Option<String> {
    Destination::from_script_pubkey(script)
        .map(|destination| encode_destination(&destination, network))
}

pub fn secret_key_to_wif(secret: &[u8; 32], network: Network, compressed: bool) -> String {
    let mut payload = Vec::with_capacity(1 + secret.len() + usize::from(compressed));
    payload.push(chain_params(network).secret_key_prefix);
    payload.extend_from_slice(secret);
    if compressed {
        payload.push(0x01);
    }
    bs58::encode(payload).with_check().into_string()
}

pub fn wif_to_secret_key(wif: &str, network: Network) -> Result<([u8; 32], bool), AddressError> {
    let payload = base58check_decode(wif)?;
    let Some((&prefix, rest)) = payload.split_first() else {
        return Err(AddressError::InvalidLength);
    };
    if prefix != chain_params(network).secret_key_prefix {
        return Err(AddressError::UnknownPrefix);
    }

    let compressed = match rest.len() {
        32 => false,
        33 if rest[32] == 0x01 => true,
        _ => return Err(AddressError::InvalidLength),
    };
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&rest[..32]);
    Ok((secret, compressed))
}

fn base58check_decode(input: &str) -> Result<Vec<u8>, AddressError> {
    if input.is_empty() {
        return Err(AddressError::InvalidLength);
    }
    bs58::decode(input)
        .with_check(None)
        .into_vec()
        .map_err(|err| match err {
            bs58::decode::Error::InvalidCharacter { .. }
            | bs58::decode::Error::NonAsciiCharacter { .. } => AddressError::InvalidCharacter,
            bs58::decode::Error::InvalidChecksum { .. } => AddressError::InvalidChecksum,
            _ => AddressError::InvalidLength,
        })
}
