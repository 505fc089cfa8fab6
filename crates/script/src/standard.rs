//! Standard script classification utilities.

use fluxd_primitives::hash160;
use fluxd_primitives::script::{is_p2pkh, is_p2sh, OP_CHECKSIG};

pub use fluxd_primitives::script::{p2pkh_script, p2sh_script};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    P2Pk,
    P2Pkh,
    P2Sh,
    Multisig,
    NullData,
    Unknown,
}

/// The data a standard script locks to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Solution {
    PubKey(Vec<u8>),
    PubKeyHash([u8; 20]),
    ScriptHash([u8; 20]),
    Multisig { required: usize, pubkeys: Vec<Vec<u8>> },
    NullData,
    Nonstandard,
}

const OP_0: u8 = 0x00;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_RETURN: u8 = 0x6a;
const OP_CHECKMULTISIG: u8 = 0xae;

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    match solve(script) {
        Solution::PubKey(_) => ScriptType::P2Pk,
        Solution::PubKeyHash(_) => ScriptType::P2Pkh,
        Solution::ScriptHash(_) => ScriptType::P2Sh,
        Solution::Multisig { .. } => ScriptType::Multisig,
        Solution::NullData => ScriptType::NullData,
        Solution::Nonstandard => ScriptType::Unknown,
    }
}

pub fn solve(script: &[u8]) -> Solution {
    if is_p2pkh(script) {
        return Solution::PubKeyHash(hash20(&script[3..23]));
    }
    if is_p2sh(script) {
        return Solution::ScriptHash(hash20(&script[2..22]));
    }
    if let Some(pubkey) = p2pk_pubkey(script) {
        return Solution::PubKey(pubkey.to_vec());
    }
    if script.first() == Some(&OP_RETURN) {
        return Solution::NullData;
    }
    if let Some((required, pubkeys)) = parse_multisig(script) {
        return Solution::Multisig { required, pubkeys };
    }
    Solution::Nonstandard
}

/// `<pubkey> OP_CHECKSIG`
pub fn p2pk_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(pubkey.len() + 2);
    script.push(pubkey.len() as u8);
    script.extend_from_slice(pubkey);
    script.push(OP_CHECKSIG);
    script
}

/// The P2SH scriptPubKey paying to `redeem_script`.
pub fn p2sh_script_for_redeem_script(redeem_script: &[u8]) -> Vec<u8> {
    p2sh_script(&hash160(redeem_script))
}

fn hash20(bytes: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(bytes);
    out
}

fn p2pk_pubkey(script: &[u8]) -> Option<&[u8]> {
    let key_len = match script.first().copied() {
        Some(len @ 33) | Some(len @ 65) => len as usize,
        _ => return None,
    };
    if script.len() != key_len + 2 || script[script.len() - 1] != OP_CHECKSIG {
        return None;
    }
    Some(&script[1..=key_len])
}

fn small_int(opcode: u8) -> Option<usize> {
    match opcode {
        OP_0 => Some(0),
        OP_1..=OP_16 => Some((opcode - OP_1 + 1) as usize),
        _ => None,
    }
}

/// `OP_m <pubkey>... OP_n OP_CHECKMULTISIG`
fn parse_multisig(script: &[u8]) -> Option<(usize, Vec<Vec<u8>>)> {
    if script.len() < 3 || script[script.len() - 1] != OP_CHECKMULTISIG {
        return None;
    }
    let required = small_int(script[0])?;
    let total = small_int(script[script.len() - 2])?;

    let mut pubkeys = Vec::with_capacity(total);
    let mut cursor = 1;
    let end = script.len() - 2;
    while cursor < end {
        let len = script[cursor] as usize;
        if len != 33 && len != 65 {
            return None;
        }
        let start = cursor + 1;
        let stop = start.checked_add(len)?;
        if stop > end {
            return None;
        }
        pubkeys.push(script[start..stop].to_vec());
        cursor = stop;
    }

    if required == 0 || required > total || pubkeys.len() != total {
        return None;
    }
    Some((required, pubkeys))
}
