//! # Template Transactions and Signing
//!
//! Deterministic construction of the five transactions tied to a vault
//! outpoint, their segwit-v0 sighashes, and the witness layouts for every
//! spending path.
//!
//! The protective transactions (emergency, cancel, unvault emergency) are
//! signed `SIGHASH_SINGLE | SIGHASH_ANYONECANPAY` so that a fee input can
//! be appended after the fact without invalidating the four collected
//! signatures. The unvault and spend commit to everything with
//! `SIGHASH_ALL`.

use std::collections::BTreeMap;
use std::str::FromStr;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Witness,
};

use crate::config::timelock::UNVAULT_CSV;
use crate::error::{VaultError, VaultResult};
use crate::keys::STAKEHOLDER_COUNT;
use crate::scripts;

/// Which of the five templates a transaction is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxRole {
    Emergency,
    Unvault,
    Cancel,
    UnvaultEmergency,
    Spend,
}

impl TxRole {
    /// The feerate bucket the signature exchange prices this role at
    pub fn feerate_role(self) -> &'static str {
        match self {
            TxRole::Emergency | TxRole::UnvaultEmergency => "emergency",
            TxRole::Cancel => "cancel",
            TxRole::Unvault => "unvault",
            TxRole::Spend => "spend",
        }
    }

    /// The sighash discipline for this role
    pub fn sighash_type(self) -> EcdsaSighashType {
        match self {
            TxRole::Emergency | TxRole::Cancel | TxRole::UnvaultEmergency => {
                EcdsaSighashType::SinglePlusAnyoneCanPay
            }
            TxRole::Unvault | TxRole::Spend => EcdsaSighashType::All,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TxRole::Emergency => "emergency",
            TxRole::Unvault => "unvault",
            TxRole::Cancel => "cancel",
            TxRole::UnvaultEmergency => "unvault_emergency",
            TxRole::Spend => "spend",
        }
    }
}

/// Typed spend destinations: address to value, ordered so that every
/// participant rebuilding the spend from the wire form produces the exact
/// same transaction (and therefore the same txid).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Destinations {
    outputs: BTreeMap<Address, Amount>,
}

impl Destinations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: Address, value: Amount) {
        self.outputs.insert(address, value);
    }

    /// Parse the wire form, validating every address against our network
    /// once at the boundary.
    pub fn parse(wire: &BTreeMap<String, u64>, network: Network) -> VaultResult<Self> {
        let mut outputs = BTreeMap::new();
        for (raw, sats) in wire {
            let address = Address::from_str(raw)
                .map_err(|_| VaultError::InvalidAddress(raw.clone()))?
                .require_network(network)
                .map_err(|_| VaultError::InvalidAddress(raw.clone()))?;
            outputs.insert(address, Amount::from_sat(*sats));
        }
        Ok(Self { outputs })
    }

    pub fn to_wire(&self) -> BTreeMap<String, u64> {
        self.outputs
            .iter()
            .map(|(address, value)| (address.to_string(), value.to_sat()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &Amount)> {
        self.outputs.iter()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.outputs.keys()
    }

    pub fn total(&self) -> Amount {
        Amount::from_sat(self.outputs.values().map(|a| a.to_sat()).sum())
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    fn txouts(&self) -> Vec<TxOut> {
        self.outputs
            .iter()
            .map(|(address, value)| TxOut {
                value: *value,
                script_pubkey: address.script_pubkey(),
            })
            .collect()
    }
}

fn single_output_tx(prevout: OutPoint, sequence: Sequence, output: TxOut) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: prevout,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        }],
        output: vec![output],
    }
}

/// The transaction moving a vault straight to the deep vault.
pub fn emergency_template(
    vault_outpoint: OutPoint,
    emergency_pubkeys: &[PublicKey; STAKEHOLDER_COUNT],
    value: Amount,
    network: Network,
) -> Transaction {
    single_output_tx(
        vault_outpoint,
        Sequence::MAX,
        scripts::emergency_txout(emergency_pubkeys, value, network),
    )
}

/// The unvaulting transaction, prerequisite of any spend.
pub fn unvault_template(
    vault_outpoint: OutPoint,
    pubkeys: &[PublicKey; STAKEHOLDER_COUNT],
    cosigner: &PublicKey,
    value: Amount,
    network: Network,
) -> Transaction {
    single_output_tx(
        vault_outpoint,
        Sequence::MAX,
        scripts::unvault_txout(pubkeys, cosigner, value, network),
    )
}

/// The transaction reverting an unvault back to the same vault script.
pub fn cancel_template(
    unvault_outpoint: OutPoint,
    pubkeys: &[PublicKey; STAKEHOLDER_COUNT],
    value: Amount,
    network: Network,
) -> Transaction {
    single_output_tx(
        unvault_outpoint,
        Sequence::MAX,
        scripts::vault_txout(pubkeys, value, network),
    )
}

/// The emergency counterpart spending from an unvault output.
pub fn unvault_emergency_template(
    unvault_outpoint: OutPoint,
    emergency_pubkeys: &[PublicKey; STAKEHOLDER_COUNT],
    value: Amount,
    network: Network,
) -> Transaction {
    single_output_tx(
        unvault_outpoint,
        Sequence::MAX,
        scripts::emergency_txout(emergency_pubkeys, value, network),
    )
}

/// The spend transaction: pays the caller-supplied destinations, input
/// sequence set to activate the unvault script's relative timelock.
pub fn spend_template(unvault_outpoint: OutPoint, destinations: &Destinations) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: unvault_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::from_height(UNVAULT_CSV),
            witness: Witness::new(),
        }],
        output: destinations.txouts(),
    }
}

/// Output value after deducting `vsize * feerate` from the input value.
pub fn stamped_value(
    input_value: Amount,
    vsize: usize,
    feerate_sat_vb: u64,
) -> VaultResult<Amount> {
    let fee = Amount::from_sat(vsize as u64 * feerate_sat_vb);
    input_value
        .checked_sub(fee)
        .filter(|value| *value > Amount::ZERO)
        .ok_or_else(|| {
            VaultError::operation(
                "fee_stamping",
                format!("fee {} exceeds input value {}", fee, input_value),
            )
        })
}

/// Segwit-v0 sighash of a template's only protected input (index 0).
pub fn signature_hash(
    tx: &Transaction,
    witness_script: &Script,
    prev_value: Amount,
    sighash_type: EcdsaSighashType,
) -> VaultResult<Message> {
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .p2wsh_signature_hash(0, witness_script, prev_value, sighash_type)
        .map_err(|e| VaultError::Sighash(e.to_string()))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

/// Sign a template with one private key. The returned signature is DER
/// followed by the sighash-type byte, ready for a witness slot.
pub fn sign_template(
    tx: &Transaction,
    witness_script: &Script,
    prev_value: Amount,
    sighash_type: EcdsaSighashType,
    privkey: &SecretKey,
) -> VaultResult<Vec<u8>> {
    let message = signature_hash(tx, witness_script, prev_value, sighash_type)?;
    let secp = Secp256k1::new();
    let mut signature = secp
        .sign_ecdsa(&message, privkey)
        .serialize_der()
        .to_vec();
    signature.push(sighash_type.to_u32() as u8);
    Ok(signature)
}

/// Check a collected signature against a template and the poster's pubkey.
///
/// Refuses a signature whose trailing type byte deviates from the role's
/// discipline even if it would otherwise verify.
pub fn verify_signature(
    signature: &[u8],
    tx: &Transaction,
    witness_script: &Script,
    prev_value: Amount,
    sighash_type: EcdsaSighashType,
    pubkey: &PublicKey,
) -> VaultResult<()> {
    let (der, type_byte) = signature.split_at(signature.len().saturating_sub(1));
    if type_byte != [sighash_type.to_u32() as u8] {
        return Err(VaultError::operation(
            "signature_verify",
            format!("unexpected sighash type byte {:?}", type_byte),
        ));
    }
    let parsed = bitcoin::secp256k1::ecdsa::Signature::from_der(der)?;
    let message = signature_hash(tx, witness_script, prev_value, sighash_type)?;
    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&message, &parsed, pubkey)?;
    Ok(())
}

/// Witness for spending a vault output (unvault, emergency): the classic
/// multisig layout with its leading empty element.
pub fn vault_path_witness(
    sigs: &[Vec<u8>; STAKEHOLDER_COUNT],
    vault_script: &Script,
) -> Witness {
    let mut witness = Witness::new();
    witness.push([0u8; 0]);
    for sig in sigs {
        witness.push(sig);
    }
    witness.push(vault_script.as_bytes());
    witness
}

/// Witness for the all-four path of an unvault output (cancel, unvault
/// emergency): signatures in reverse stakeholder order, no padding.
pub fn unvault_all_path_witness(
    sigs: &[Vec<u8>; STAKEHOLDER_COUNT],
    unvault_script: &Script,
) -> Witness {
    let mut witness = Witness::new();
    for sig in sigs.iter().rev() {
        witness.push(sig);
    }
    witness.push(unvault_script.as_bytes());
    witness
}

/// Witness for the timelocked path of an unvault output (spend): the two
/// trader signatures, an empty slot where the third stakeholder would sign,
/// and the cosigning server's signature.
pub fn unvault_cosign_path_witness(
    trader1_sig: &[u8],
    trader2_sig: &[u8],
    cosigner_sig: &[u8],
    unvault_script: &Script,
) -> Witness {
    let mut witness = Witness::new();
    witness.push(cosigner_sig);
    witness.push([0u8; 0]);
    witness.push(trader2_sig);
    witness.push(trader1_sig);
    witness.push(unvault_script.as_bytes());
    witness
}

/// Append a P2WPKH fee input to an already-signed protective transaction.
///
/// The existing witnesses stay valid because the four collected signatures
/// are `ANYONECANPAY`; the fee input itself is signed
/// `ALL | ANYONECANPAY` so it commits to the outputs it is paying for.
pub fn append_fee_input(
    tx: &mut Transaction,
    fee_outpoint: OutPoint,
    fee_value: Amount,
    fee_privkey: &SecretKey,
) -> VaultResult<()> {
    let secp = Secp256k1::new();
    let pubkey = bitcoin::PublicKey::new(fee_privkey.public_key(&secp));
    let script_pubkey = ScriptBuf::new_p2wpkh(
        &pubkey
            .wpubkey_hash()
            .map_err(|e| VaultError::operation("fee_input", e.to_string()))?,
    );

    tx.input.push(TxIn {
        previous_output: fee_outpoint,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    });
    let index = tx.input.len() - 1;

    let sighash_type = EcdsaSighashType::AllPlusAnyoneCanPay;
    let sighash = {
        let mut cache = SighashCache::new(&*tx);
        cache
            .p2wpkh_signature_hash(index, &script_pubkey, fee_value, sighash_type)
            .map_err(|e| VaultError::Sighash(e.to_string()))?
    };
    let message = Message::from_digest(sighash.to_byte_array());
    let mut signature = secp
        .sign_ecdsa(&message, fee_privkey)
        .serialize_der()
        .to_vec();
    signature.push(sighash_type.to_u32() as u8);

    let mut witness = Witness::new();
    witness.push(signature);
    witness.push(pubkey.to_bytes());
    tx.input[index].witness = witness;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Txid;

    fn keys(seeds: [u8; 4]) -> ([SecretKey; 4], [PublicKey; 4]) {
        let secp = Secp256k1::new();
        let privkeys = seeds.map(|s| SecretKey::from_slice(&[s; 32]).unwrap());
        let pubkeys = privkeys.map(|sk| sk.public_key(&secp));
        (privkeys, pubkeys)
    }

    fn outpoint(byte: u8, vout: u32) -> OutPoint {
        OutPoint::new(Txid::from_byte_array([byte; 32]), vout)
    }

    fn cosigner() -> PublicKey {
        let secp = Secp256k1::new();
        SecretKey::from_slice(&[42; 32]).unwrap().public_key(&secp)
    }

    #[test]
    fn templates_are_single_input_version_two() {
        let (_, pubkeys) = keys([1, 2, 3, 4]);
        let (_, emergency) = keys([5, 6, 7, 8]);
        let value = Amount::from_sat(90_000_000);
        for tx in [
            emergency_template(outpoint(1, 0), &emergency, value, Network::Regtest),
            unvault_template(outpoint(1, 0), &pubkeys, &cosigner(), value, Network::Regtest),
            cancel_template(outpoint(2, 0), &pubkeys, value, Network::Regtest),
            unvault_emergency_template(outpoint(2, 0), &emergency, value, Network::Regtest),
        ] {
            assert_eq!(tx.version, Version::TWO);
            assert_eq!(tx.input.len(), 1);
            assert_eq!(tx.output.len(), 1);
            assert_eq!(tx.input[0].sequence, Sequence::MAX);
        }
    }

    #[test]
    fn cancel_pays_back_to_the_same_vault_script() {
        let (_, pubkeys) = keys([1, 2, 3, 4]);
        let value = Amount::from_sat(1_000_000);
        let cancel = cancel_template(outpoint(2, 0), &pubkeys, value, Network::Regtest);
        let vault = scripts::vault_txout(&pubkeys, value, Network::Regtest);
        assert_eq!(cancel.output[0].script_pubkey, vault.script_pubkey);
    }

    #[test]
    fn spend_input_activates_the_relative_timelock() {
        let mut destinations = Destinations::new();
        let (_, pubkeys) = keys([1, 2, 3, 4]);
        destinations.insert(
            scripts::vault_address(&pubkeys, Network::Regtest),
            Amount::from_sat(500),
        );
        let spend = spend_template(outpoint(2, 0), &destinations);
        assert_eq!(spend.input[0].sequence, Sequence::from_height(6));
        assert_eq!(spend.output.len(), 1);
    }

    #[test]
    fn stamped_value_deducts_size_times_feerate() {
        let value = stamped_value(Amount::from_sat(100_000), 200, 10).unwrap();
        assert_eq!(value, Amount::from_sat(98_000));
        assert!(stamped_value(Amount::from_sat(1_000), 200, 10).is_err());
    }

    #[test]
    fn protective_roles_sign_single_anyonecanpay() {
        assert_eq!(
            TxRole::Cancel.sighash_type(),
            EcdsaSighashType::SinglePlusAnyoneCanPay
        );
        assert_eq!(
            TxRole::Emergency.sighash_type(),
            EcdsaSighashType::SinglePlusAnyoneCanPay
        );
        assert_eq!(
            TxRole::UnvaultEmergency.sighash_type(),
            EcdsaSighashType::SinglePlusAnyoneCanPay
        );
        assert_eq!(TxRole::Unvault.sighash_type(), EcdsaSighashType::All);
        assert_eq!(TxRole::Spend.sighash_type(), EcdsaSighashType::All);
        assert_eq!(TxRole::UnvaultEmergency.feerate_role(), "emergency");
    }

    #[test]
    fn signatures_carry_the_type_byte_and_verify() {
        let (privkeys, pubkeys) = keys([1, 2, 3, 4]);
        let script = scripts::vault_script(&pubkeys);
        let value = Amount::from_sat(1_000_000);
        let tx = unvault_template(outpoint(1, 0), &pubkeys, &cosigner(), value, Network::Regtest);

        let sig = sign_template(&tx, &script, value, EcdsaSighashType::All, &privkeys[0]).unwrap();
        assert_eq!(*sig.last().unwrap(), 0x01);
        verify_signature(&sig, &tx, &script, value, EcdsaSighashType::All, &pubkeys[0]).unwrap();
        // The wrong key must not verify
        assert!(verify_signature(
            &sig,
            &tx,
            &script,
            value,
            EcdsaSighashType::All,
            &pubkeys[1]
        )
        .is_err());

        let (_, emergency) = keys([5, 6, 7, 8]);
        let emer_tx = emergency_template(outpoint(1, 0), &emergency, value, Network::Regtest);
        let emer_sig = sign_template(
            &emer_tx,
            &script,
            value,
            EcdsaSighashType::SinglePlusAnyoneCanPay,
            &privkeys[0],
        )
        .unwrap();
        assert_eq!(*emer_sig.last().unwrap(), 0x83);
        // A signature with the wrong discipline is refused outright
        assert!(verify_signature(
            &emer_sig,
            &emer_tx,
            &script,
            value,
            EcdsaSighashType::All,
            &pubkeys[0]
        )
        .is_err());
    }

    #[test]
    fn witness_layouts_match_the_script_expectations() {
        let (_, pubkeys) = keys([1, 2, 3, 4]);
        let vault = scripts::vault_script(&pubkeys);
        let unvault = scripts::unvault_script(&pubkeys, &cosigner());
        let sigs = [vec![1u8], vec![2u8], vec![3u8], vec![4u8]];

        let witness = vault_path_witness(&sigs, &vault);
        assert_eq!(witness.len(), 6);
        assert_eq!(witness.nth(0).unwrap(), &[] as &[u8]);
        assert_eq!(witness.nth(1).unwrap(), &[1u8][..]);
        assert_eq!(witness.nth(5).unwrap(), vault.as_bytes());

        let witness = unvault_all_path_witness(&sigs, &unvault);
        assert_eq!(witness.len(), 5);
        assert_eq!(witness.nth(0).unwrap(), &[4u8][..]);
        assert_eq!(witness.nth(3).unwrap(), &[1u8][..]);
        assert_eq!(witness.nth(4).unwrap(), unvault.as_bytes());

        let witness = unvault_cosign_path_witness(&[1u8], &[2u8], &[9u8], &unvault);
        assert_eq!(witness.len(), 5);
        assert_eq!(witness.nth(0).unwrap(), &[9u8][..]);
        assert_eq!(witness.nth(1).unwrap(), &[] as &[u8]);
        assert_eq!(witness.nth(2).unwrap(), &[2u8][..]);
        assert_eq!(witness.nth(3).unwrap(), &[1u8][..]);
    }

    #[test]
    fn anyonecanpay_sighash_survives_a_fee_input() {
        let (privkeys, pubkeys) = keys([1, 2, 3, 4]);
        let (_, emergency) = keys([5, 6, 7, 8]);
        let value = Amount::from_sat(1_000_000);
        let script = scripts::vault_script(&pubkeys);
        let mut tx = emergency_template(outpoint(1, 0), &emergency, value, Network::Regtest);
        let ty = EcdsaSighashType::SinglePlusAnyoneCanPay;

        let before = signature_hash(&tx, &script, value, ty).unwrap();
        let sig = sign_template(&tx, &script, value, ty, &privkeys[0]).unwrap();

        append_fee_input(
            &mut tx,
            outpoint(7, 1),
            Amount::from_sat(50_000),
            &privkeys[3],
        )
        .unwrap();
        assert_eq!(tx.input.len(), 2);
        assert_eq!(tx.input[1].witness.len(), 2);

        let after = signature_hash(&tx, &script, value, ty).unwrap();
        assert_eq!(before, after);
        verify_signature(&sig, &tx, &script, value, ty, &pubkeys[0]).unwrap();
    }

    #[test]
    fn destinations_round_trip_and_validate_network() {
        let (_, pubkeys) = keys([1, 2, 3, 4]);
        let address = scripts::vault_address(&pubkeys, Network::Regtest);
        let mut destinations = Destinations::new();
        destinations.insert(address.clone(), Amount::from_sat(1_000));

        let wire = destinations.to_wire();
        assert_eq!(wire.get(&address.to_string()), Some(&1_000));
        let parsed = Destinations::parse(&wire, Network::Regtest).unwrap();
        assert_eq!(parsed, destinations);
        assert_eq!(parsed.total(), Amount::from_sat(1_000));

        // A regtest address does not parse for mainnet
        assert!(Destinations::parse(&wire, Network::Bitcoin).is_err());
        assert!(matches!(
            Destinations::parse(
                &BTreeMap::from([("not-an-address".to_string(), 1u64)]),
                Network::Regtest
            ),
            Err(VaultError::InvalidAddress(_))
        ));
    }
}
