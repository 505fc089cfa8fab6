//! Per-network chain parameters.

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Network::Mainnet),
            "testnet" | "test" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub genesis_time: u32,
    /// Two-byte base58 prefix of pay-to-pubkey-hash addresses.
    pub pubkey_address_prefix: [u8; 2],
    /// Two-byte base58 prefix of pay-to-script-hash addresses.
    pub script_address_prefix: [u8; 2],
    pub secret_key_prefix: u8,
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            hash_genesis_block: genesis_hash(
                "00052461a5006c2e3b74ce48992a08695607912d5604c3eb8da25749b0900444",
            ),
            genesis_time: 1_516_980_000,
            pubkey_address_prefix: [0x1C, 0xB8],
            script_address_prefix: [0x1C, 0xBD],
            secret_key_prefix: 0x80,
        },
        Network::Testnet => ChainParams {
            network,
            hash_genesis_block: genesis_hash(
                "0042202a64a929fc25cc10e68615ddbe38007b1b40da08acd3f530f83c79b9d1",
            ),
            genesis_time: 1_582_228_940,
            pubkey_address_prefix: [0x1D, 0x25],
            script_address_prefix: [0x1C, 0xBA],
            secret_key_prefix: 0xEF,
        },
        Network::Regtest => ChainParams {
            network,
            hash_genesis_block: genesis_hash(
                "01998760a88dc2b5715f69d2f18c1d90e0b604612242d9099eaff3048dd1e0ce",
            ),
            genesis_time: 1_296_688_602,
            pubkey_address_prefix: [0x1D, 0x25],
            script_address_prefix: [0x1C, 0xBA],
            secret_key_prefix: 0xEF,
        },
    }
}

fn genesis_hash(hex: &str) -> Hash256 {
    // Constants above are 64 hex digits; a malformed one is a build-time typo.
    hash256_from_hex(hex).unwrap_or([0u8; 32])
}

#[derive(Debug, Eq, PartialEq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hash hex must be at most 64 digits"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big-endian) hash into internal little-endian bytes.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut digits = input.trim();
    if let Some(stripped) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        digits = stripped;
    }
    if digits.is_empty() || digits.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let padded = format!("{digits:0>64}");
    let decoded = hex::decode(padded).map_err(|_| HexError::InvalidHex)?;
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&decoded);
    bytes.reverse();
    Ok(bytes)
}
