//! Pay-to-hash script templates shared by address encoding and script solving.

pub const OP_DUP: u8 = 0x76;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_CHECKSIG: u8 = 0xac;

/// `OP_DUP OP_HASH160 <key_hash> OP_EQUALVERIFY OP_CHECKSIG`
pub fn p2pkh_script(key_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[OP_DUP, OP_HASH160, 0x14]);
    script.extend_from_slice(key_hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

/// `OP_HASH160 <script_hash> OP_EQUAL`
pub fn p2sh_script(script_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.extend_from_slice(&[OP_HASH160, 0x14]);
    script.extend_from_slice(script_hash);
    script.push(OP_EQUAL);
    script
}

pub fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_match_their_predicates() {
        let p2pkh = p2pkh_script(&[0x11; 20]);
        assert!(is_p2pkh(&p2pkh));
        assert!(!is_p2sh(&p2pkh));

        let p2sh = p2sh_script(&[0x22; 20]);
        assert!(is_p2sh(&p2sh));
        assert!(!is_p2pkh(&p2sh));
        assert!(!is_p2sh(&p2sh[..22]));
    }
}
