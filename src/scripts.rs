//! # Vault Witness Scripts
//!
//! The three scripts the whole construction rests on:
//!
//! - the **vault** script, a 4-of-4 over the stakeholders' derived keys;
//! - the **unvault** script, always requiring both traders and then either
//!   the two remaining stakeholders (immediate, used by cancel and the
//!   unvault emergency) or the cosigning server after a 6-block relative
//!   timelock (used by the spend);
//! - the **emergency** script, a 4-of-4 over the offline keys behind a
//!   month-long relative timelock.
//!
//! All outputs are P2WSH of these scripts. The vault and emergency scripts
//! use OP_CHECKMULTISIG and therefore need the leading empty witness
//! element; the unvault script counts CHECKSIG results on the stack and
//! branches on the count, so its witness carries no such padding.

use bitcoin::opcodes::all::{
    OP_ADD, OP_CHECKMULTISIG, OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_CSV, OP_DROP, OP_DUP, OP_ELSE,
    OP_ENDIF, OP_EQUAL, OP_EQUALVERIFY, OP_IF, OP_PUSHNUM_2, OP_PUSHNUM_3, OP_PUSHNUM_4,
    OP_PUSHNUM_6, OP_SWAP,
};
use bitcoin::script::Builder;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Address, Amount, Network, ScriptBuf, TxOut};

use crate::config::timelock::EMERGENCY_CSV;
use crate::keys::STAKEHOLDER_COUNT;

fn key(pubkey: &PublicKey) -> bitcoin::PublicKey {
    bitcoin::PublicKey::new(*pubkey)
}

/// The locking script of a vault output: a 4-of-4 over the derived keys.
pub fn vault_script(pubkeys: &[PublicKey; STAKEHOLDER_COUNT]) -> ScriptBuf {
    let mut builder = Builder::new().push_opcode(OP_PUSHNUM_4);
    for pubkey in pubkeys {
        builder = builder.push_key(&key(pubkey));
    }
    builder
        .push_opcode(OP_PUSHNUM_4)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

/// The locking script of an unvault output.
///
/// Counts valid signatures from {trader1, trader2, stakeholder3}: all three
/// plus stakeholder4 spend immediately (the all-four branch), exactly the
/// two traders plus the cosigning server spend after the 6-block timelock.
pub fn unvault_script(
    pubkeys: &[PublicKey; STAKEHOLDER_COUNT],
    cosigner: &PublicKey,
) -> ScriptBuf {
    Builder::new()
        .push_key(&key(&pubkeys[0]))
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_SWAP)
        .push_key(&key(&pubkeys[1]))
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ADD)
        .push_opcode(OP_SWAP)
        .push_key(&key(&pubkeys[2]))
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ADD)
        .push_opcode(OP_DUP)
        .push_opcode(OP_PUSHNUM_3)
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF)
        .push_opcode(OP_SWAP)
        .push_key(&key(&pubkeys[3]))
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_opcode(OP_ELSE)
        .push_opcode(OP_PUSHNUM_2)
        .push_opcode(OP_EQUALVERIFY)
        .push_key(&key(cosigner))
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_opcode(OP_PUSHNUM_6)
        .push_opcode(OP_CSV)
        .push_opcode(OP_ENDIF)
        .into_script()
}

/// The deep-vault script: 4-of-4 over the offline emergency keys, only
/// spendable a month after confirmation.
pub fn emergency_script(pubkeys: &[PublicKey; STAKEHOLDER_COUNT]) -> ScriptBuf {
    let mut builder = Builder::new()
        .push_int(EMERGENCY_CSV as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .push_opcode(OP_PUSHNUM_4);
    for pubkey in pubkeys {
        builder = builder.push_key(&key(pubkey));
    }
    builder
        .push_opcode(OP_PUSHNUM_4)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

pub fn vault_address(pubkeys: &[PublicKey; STAKEHOLDER_COUNT], network: Network) -> Address {
    Address::p2wsh(&vault_script(pubkeys), network)
}

pub fn unvault_address(
    pubkeys: &[PublicKey; STAKEHOLDER_COUNT],
    cosigner: &PublicKey,
    network: Network,
) -> Address {
    Address::p2wsh(&unvault_script(pubkeys, cosigner), network)
}

pub fn emergency_address(pubkeys: &[PublicKey; STAKEHOLDER_COUNT], network: Network) -> Address {
    Address::p2wsh(&emergency_script(pubkeys), network)
}

pub fn vault_txout(
    pubkeys: &[PublicKey; STAKEHOLDER_COUNT],
    value: Amount,
    network: Network,
) -> TxOut {
    TxOut {
        value,
        script_pubkey: vault_address(pubkeys, network).script_pubkey(),
    }
}

pub fn unvault_txout(
    pubkeys: &[PublicKey; STAKEHOLDER_COUNT],
    cosigner: &PublicKey,
    value: Amount,
    network: Network,
) -> TxOut {
    TxOut {
        value,
        script_pubkey: unvault_address(pubkeys, cosigner, network).script_pubkey(),
    }
}

pub fn emergency_txout(
    pubkeys: &[PublicKey; STAKEHOLDER_COUNT],
    value: Amount,
    network: Network,
) -> TxOut {
    TxOut {
        value,
        script_pubkey: emergency_address(pubkeys, network).script_pubkey(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    pub(crate) fn test_pubkeys(seeds: [u8; 4]) -> [PublicKey; 4] {
        let secp = Secp256k1::new();
        seeds.map(|s| SecretKey::from_slice(&[s; 32]).unwrap().public_key(&secp))
    }

    #[test]
    fn vault_script_is_a_classic_four_of_four() {
        let script = vault_script(&test_pubkeys([1, 2, 3, 4]));
        let bytes = script.to_bytes();
        // OP_PUSHNUM_4, four 33-byte key pushes, OP_PUSHNUM_4, OP_CHECKMULTISIG
        assert_eq!(bytes.len(), 1 + 4 * 34 + 1 + 1);
        assert_eq!(bytes[0], OP_PUSHNUM_4.to_u8());
        assert_eq!(bytes[bytes.len() - 2], OP_PUSHNUM_4.to_u8());
        assert_eq!(bytes[bytes.len() - 1], OP_CHECKMULTISIG.to_u8());
    }

    #[test]
    fn emergency_script_pushes_the_month_timelock() {
        let script = emergency_script(&test_pubkeys([5, 6, 7, 8]));
        let bytes = script.to_bytes();
        // 4464 = 0x1170, minimally pushed little-endian
        assert_eq!(&bytes[..3], &[0x02, 0x70, 0x11]);
        assert_eq!(bytes[3], OP_CSV.to_u8());
        assert_eq!(bytes[4], OP_DROP.to_u8());
    }

    #[test]
    fn unvault_script_branches_on_signature_count() {
        let pubkeys = test_pubkeys([1, 2, 3, 4]);
        let cosigner = test_pubkeys([9, 9, 9, 9])[0];
        let script = unvault_script(&pubkeys, &cosigner);
        let bytes = script.to_bytes();
        assert!(bytes.contains(&OP_IF.to_u8()));
        assert!(bytes.contains(&OP_ELSE.to_u8()));
        // The timelocked branch pushes 6 then CSV
        let csv_pos = bytes.iter().rposition(|b| *b == OP_CSV.to_u8()).unwrap();
        assert_eq!(bytes[csv_pos - 1], OP_PUSHNUM_6.to_u8());
        // Five distinct keys appear
        assert!(bytes.iter().filter(|b| **b == 33).count() >= 5);
    }

    #[test]
    fn addresses_are_deterministic_and_script_dependent() {
        let pubkeys = test_pubkeys([1, 2, 3, 4]);
        let cosigner = test_pubkeys([9, 0, 0, 0])[0];
        let vault = vault_address(&pubkeys, Network::Regtest);
        assert_eq!(vault, vault_address(&pubkeys, Network::Regtest));
        assert_ne!(
            vault,
            unvault_address(&pubkeys, &cosigner, Network::Regtest)
        );
        assert_ne!(vault, emergency_address(&pubkeys, Network::Regtest));
    }

    #[test]
    fn txouts_pay_to_the_p2wsh_of_their_script() {
        let pubkeys = test_pubkeys([1, 2, 3, 4]);
        let txo = vault_txout(&pubkeys, Amount::from_sat(1000), Network::Regtest);
        assert!(txo.script_pubkey.is_p2wsh());
        assert_eq!(txo.value, Amount::from_sat(1000));
    }
}
