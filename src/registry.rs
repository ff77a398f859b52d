//! # Vault Registry
//!
//! In-memory view of every vault this stakeholder knows about, keyed by the
//! deposit outpoint. A record owns the four pre-signed templates with their
//! per-stakeholder signature slots and a typed lifecycle stage; all mutation
//! happens under the registry lock held by the wallet.
//!
//! Two deposits to the same address are two independent records: the chain
//! outpoint, never the derivation index, identifies a vault.

use std::collections::HashMap;

use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, Transaction, Txid};
use log::debug;

use crate::error::{VaultError, VaultResult};
use crate::keys::{StakeholderId, STAKEHOLDER_COUNT};
use crate::transactions::{self, TxRole};

/// Lifecycle of a vault as seen by this stakeholder.
///
/// The happy path is strictly ordered: a vault is discovered on chain, its
/// emergency transaction becomes fully signed, then both revocations
/// (cancel and unvault emergency), only then is our unvault signature
/// released (`Unvaulting`), and once all four unvault signatures are in the
/// vault is `Secured`. The three terminal stages can interrupt from
/// anywhere: the chain does not wait for our bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultStage {
    /// Deposit seen on chain, templates built, our signatures pushed
    Discovered,
    /// The emergency transaction carries all four signatures
    EmergencySigned,
    /// Cancel and unvault emergency carry all four signatures
    RevocationsComplete,
    /// Our unvault signature has been published
    Unvaulting,
    /// The unvault transaction carries all four signatures
    Secured,
    /// A cooperative spend for this vault is in flight
    SpendInFlight,
    /// The cancel transaction was broadcast in response to a rogue unvault
    Canceled,
    /// The emergency path fired; the whole wallet is shutting down
    EmergencySwept,
}

impl VaultStage {
    pub fn as_str(self) -> &'static str {
        match self {
            VaultStage::Discovered => "discovered",
            VaultStage::EmergencySigned => "emergency_signed",
            VaultStage::RevocationsComplete => "revocations_complete",
            VaultStage::Unvaulting => "unvaulting",
            VaultStage::Secured => "secured",
            VaultStage::SpendInFlight => "spend_in_flight",
            VaultStage::Canceled => "canceled",
            VaultStage::EmergencySwept => "emergency_swept",
        }
    }

    fn rank(self) -> u8 {
        match self {
            VaultStage::Discovered => 0,
            VaultStage::EmergencySigned => 1,
            VaultStage::RevocationsComplete => 2,
            VaultStage::Unvaulting => 3,
            VaultStage::Secured => 4,
            VaultStage::SpendInFlight | VaultStage::Canceled | VaultStage::EmergencySwept => 5,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            VaultStage::SpendInFlight | VaultStage::Canceled | VaultStage::EmergencySwept
        )
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// The linear stages advance one step at a time; `Canceled` and
    /// `EmergencySwept` may interrupt from any live stage, `SpendInFlight`
    /// only from `Secured`.
    pub fn allows(self, next: VaultStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            VaultStage::Canceled | VaultStage::EmergencySwept => true,
            VaultStage::SpendInFlight => self == VaultStage::Secured,
            _ => !next.is_terminal() && next.rank() == self.rank() + 1,
        }
    }

    /// The vault is safe to unvault: all four templates fully signed.
    pub fn is_secured(self) -> bool {
        matches!(self, VaultStage::Secured | VaultStage::SpendInFlight)
    }
}

impl std::fmt::Display for VaultStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four per-stakeholder signature slots of one template.
#[derive(Debug, Clone, Default)]
pub struct SignatureSlots {
    slots: [Option<Vec<u8>>; STAKEHOLDER_COUNT],
}

impl SignatureSlots {
    pub fn get(&self, id: StakeholderId) -> Option<&Vec<u8>> {
        self.slots[id.index()].as_ref()
    }

    /// Fill one slot. Refuses to overwrite an existing signature with a
    /// different one; refilling with the same bytes is a no-op.
    pub fn fill(&mut self, id: StakeholderId, sig: Vec<u8>) -> VaultResult<()> {
        match &self.slots[id.index()] {
            Some(existing) if *existing != sig => Err(VaultError::operation(
                "signature_slots",
                format!("conflicting signature for stakeholder {}", id),
            )),
            _ => {
                self.slots[id.index()] = Some(sig);
                Ok(())
            }
        }
    }

    pub fn missing(&self) -> Vec<StakeholderId> {
        StakeholderId::all()
            .into_iter()
            .filter(|id| self.slots[id.index()].is_none())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// The four signatures in stakeholder order, once all are present.
    pub fn ordered(&self) -> Option<[Vec<u8>; STAKEHOLDER_COUNT]> {
        if !self.is_complete() {
            return None;
        }
        Some([
            self.slots[0].clone().unwrap(),
            self.slots[1].clone().unwrap(),
            self.slots[2].clone().unwrap(),
            self.slots[3].clone().unwrap(),
        ])
    }
}

/// One template transaction with everything needed to collect and check its
/// signatures and assemble its witness.
#[derive(Debug, Clone)]
pub struct PresignedTx {
    pub role: TxRole,
    pub template: Transaction,
    /// The witness script of the output this template spends
    pub witness_script: ScriptBuf,
    /// The value of the output this template spends
    pub prev_value: Amount,
    pub sigs: SignatureSlots,
    /// The witness-final transaction, once all four slots are filled
    pub finalized: Option<Transaction>,
}

impl PresignedTx {
    pub fn new(
        role: TxRole,
        template: Transaction,
        witness_script: ScriptBuf,
        prev_value: Amount,
    ) -> Self {
        Self {
            role,
            template,
            witness_script,
            prev_value,
            sigs: SignatureSlots::default(),
            finalized: None,
        }
    }

    pub fn txid(&self) -> Txid {
        self.template.compute_txid()
    }

    pub fn sighash_type(&self) -> EcdsaSighashType {
        self.role.sighash_type()
    }

    /// Verify a collected signature against this template and the poster's
    /// pubkey before letting it into a slot.
    pub fn verify_and_fill(
        &mut self,
        id: StakeholderId,
        pubkey: &PublicKey,
        sig: Vec<u8>,
    ) -> VaultResult<()> {
        transactions::verify_signature(
            &sig,
            &self.template,
            &self.witness_script,
            self.prev_value,
            self.sighash_type(),
            pubkey,
        )
        .map_err(|_| VaultError::InvalidSignature {
            position: id.number(),
            txid: self.txid(),
        })?;
        self.sigs.fill(id, sig)
    }

    /// Build the witness-complete transaction without committing it, so a
    /// sanity check can run before the template is marked signed.
    pub fn assemble(&self) -> VaultResult<Transaction> {
        let sigs = self.sigs.ordered().ok_or_else(|| {
            VaultError::operation(
                "assemble",
                format!("{} is missing signatures", self.role.as_str()),
            )
        })?;
        let witness = match self.role {
            TxRole::Emergency | TxRole::Unvault => {
                transactions::vault_path_witness(&sigs, &self.witness_script)
            }
            TxRole::Cancel | TxRole::UnvaultEmergency => {
                transactions::unvault_all_path_witness(&sigs, &self.witness_script)
            }
            TxRole::Spend => {
                return Err(VaultError::operation(
                    "assemble",
                    "spend witnesses are assembled by the coordinator",
                ))
            }
        };
        let mut tx = self.template.clone();
        tx.input[0].witness = witness;
        Ok(tx)
    }

    /// Attach the witness once every slot is filled.
    pub fn finalize(&mut self) -> VaultResult<&Transaction> {
        let tx = self.assemble()?;
        self.finalized = Some(tx);
        Ok(self.finalized.as_ref().unwrap())
    }
}

/// Everything this stakeholder holds for one vault outpoint.
#[derive(Debug, Clone)]
pub struct VaultRecord {
    pub outpoint: OutPoint,
    pub amount: Amount,
    pub derivation_index: u32,
    pub pubkeys: [PublicKey; STAKEHOLDER_COUNT],
    pub(crate) privkey: SecretKey,
    pub stage: VaultStage,
    pub emergency: PresignedTx,
    pub unvault: PresignedTx,
    pub cancel: PresignedTx,
    pub unvault_emergency: PresignedTx,
    /// Our unvault signature, withheld until the revocations are complete
    pub(crate) our_unvault_sig: Option<Vec<u8>>,
}

impl VaultRecord {
    pub fn vault_txid(&self) -> Txid {
        self.outpoint.txid
    }

    pub fn unvault_txid(&self) -> Txid {
        self.unvault.txid()
    }

    /// The outpoint the cancel, unvault emergency and spend all consume
    pub fn unvault_outpoint(&self) -> OutPoint {
        OutPoint::new(self.unvault_txid(), 0)
    }

    /// The witness script locking the unvault output
    pub fn unvault_witness_script(&self) -> &ScriptBuf {
        &self.cancel.witness_script
    }

    /// The value of the unvault output
    pub fn unvault_value(&self) -> Amount {
        self.unvault.template.output[0].value
    }

    pub fn presigned(&self, role: TxRole) -> VaultResult<&PresignedTx> {
        match role {
            TxRole::Emergency => Ok(&self.emergency),
            TxRole::Unvault => Ok(&self.unvault),
            TxRole::Cancel => Ok(&self.cancel),
            TxRole::UnvaultEmergency => Ok(&self.unvault_emergency),
            TxRole::Spend => Err(VaultError::operation(
                "presigned",
                "the spend is not a stored template",
            )),
        }
    }

    pub fn presigned_mut(&mut self, role: TxRole) -> VaultResult<&mut PresignedTx> {
        match role {
            TxRole::Emergency => Ok(&mut self.emergency),
            TxRole::Unvault => Ok(&mut self.unvault),
            TxRole::Cancel => Ok(&mut self.cancel),
            TxRole::UnvaultEmergency => Ok(&mut self.unvault_emergency),
            TxRole::Spend => Err(VaultError::operation(
                "presigned",
                "the spend is not a stored template",
            )),
        }
    }

    /// Advance the lifecycle, rejecting transitions the machine forbids.
    pub fn advance(&mut self, next: VaultStage) -> VaultResult<()> {
        if !self.stage.allows(next) {
            return Err(VaultError::IllegalTransition {
                outpoint: self.outpoint,
                from: self.stage.as_str(),
                to: next.as_str(),
            });
        }
        debug!(
            "vault {}: {} -> {}",
            self.outpoint, self.stage, next
        );
        self.stage = next;
        Ok(())
    }
}

/// The set of known vaults plus the address books the chain watcher works
/// from.
pub struct VaultRegistry {
    network: Network,
    records: HashMap<OutPoint, VaultRecord>,
    /// Watched vault addresses over the derivation window, address -> index
    watched: HashMap<Address, u32>,
    /// Watched unvault addresses, address -> vault outpoint
    unvault_watched: HashMap<Address, OutPoint>,
}

impl VaultRegistry {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            records: HashMap::new(),
            watched: HashMap::new(),
            unvault_watched: HashMap::new(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.records.contains_key(outpoint)
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&VaultRecord> {
        self.records.get(outpoint)
    }

    pub fn get_mut(&mut self, outpoint: &OutPoint) -> Option<&mut VaultRecord> {
        self.records.get_mut(outpoint)
    }

    pub fn insert(&mut self, record: VaultRecord) {
        let unvault_address = Address::from_script(
            &record.unvault.template.output[0].script_pubkey,
            self.network,
        )
        .expect("unvault outputs are always standard P2WSH");
        self.unvault_watched
            .insert(unvault_address, record.outpoint);
        self.records.insert(record.outpoint, record);
    }

    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<VaultRecord> {
        let record = self.records.remove(outpoint)?;
        self.unvault_watched
            .retain(|_, vault| vault != outpoint);
        Some(record)
    }

    pub fn by_vault_txid(&self, txid: &Txid) -> Option<&VaultRecord> {
        self.records
            .values()
            .find(|record| record.vault_txid() == *txid)
    }

    pub fn by_unvault_txid(&self, txid: &Txid) -> Option<&VaultRecord> {
        self.records
            .values()
            .find(|record| record.unvault_txid() == *txid)
    }

    pub fn records(&self) -> impl Iterator<Item = &VaultRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Register a vault address derived at `index` as watched
    pub fn watch_address(&mut self, address: Address, index: u32) {
        self.watched.entry(address).or_insert(index);
    }

    pub fn index_of_address(&self, address: &Address) -> Option<u32> {
        self.watched.get(address).copied()
    }

    pub fn watched_addresses(&self) -> Vec<Address> {
        self.watched.keys().cloned().collect()
    }

    /// True when this address is one of our own vault addresses; such
    /// destinations are change from the acknowledgement policy's viewpoint
    pub fn is_own_vault_address(&self, address: &Address) -> bool {
        self.watched.contains_key(address)
    }

    pub fn unvault_addresses(&self) -> Vec<Address> {
        self.unvault_watched.keys().cloned().collect()
    }

    pub fn vault_of_unvault_address(&self, address: &Address) -> Option<OutPoint> {
        self.unvault_watched.get(address).copied()
    }

    /// The finalized emergency transactions of every known vault, for the
    /// terminal broadcast-everything path.
    pub fn emergency_transactions(&self) -> Vec<Transaction> {
        self.records
            .values()
            .filter_map(|record| record.emergency.finalized.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripts;
    use crate::transactions::{
        cancel_template, emergency_template, sign_template, unvault_emergency_template,
        unvault_template,
    };
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::Secp256k1;

    fn test_keys(seeds: [u8; 4]) -> ([SecretKey; 4], [PublicKey; 4]) {
        let secp = Secp256k1::new();
        let privkeys = seeds.map(|s| SecretKey::from_slice(&[s; 32]).unwrap());
        let pubkeys = privkeys.map(|sk| sk.public_key(&secp));
        (privkeys, pubkeys)
    }

    fn test_record(vault_byte: u8) -> (VaultRecord, [SecretKey; 4]) {
        let (privkeys, pubkeys) = test_keys([1, 2, 3, 4]);
        let (_, emergency_pubkeys) = test_keys([5, 6, 7, 8]);
        let secp = Secp256k1::new();
        let cosigner = SecretKey::from_slice(&[42; 32]).unwrap().public_key(&secp);
        let network = Network::Regtest;

        let outpoint = OutPoint::new(Txid::from_byte_array([vault_byte; 32]), 0);
        let amount = Amount::from_sat(1_000_000_000);
        let unvault_value = Amount::from_sat(999_900_000);
        let protected_value = Amount::from_sat(999_800_000);

        let vault_script = scripts::vault_script(&pubkeys);
        let unvault_script = scripts::unvault_script(&pubkeys, &cosigner);

        let unvault_tx = unvault_template(outpoint, &pubkeys, &cosigner, unvault_value, network);
        let unvault_outpoint = OutPoint::new(unvault_tx.compute_txid(), 0);

        let record = VaultRecord {
            outpoint,
            amount,
            derivation_index: 0,
            pubkeys,
            privkey: privkeys[0],
            stage: VaultStage::Discovered,
            emergency: PresignedTx::new(
                TxRole::Emergency,
                emergency_template(outpoint, &emergency_pubkeys, protected_value, network),
                vault_script.clone(),
                amount,
            ),
            unvault: PresignedTx::new(TxRole::Unvault, unvault_tx, vault_script, amount),
            cancel: PresignedTx::new(
                TxRole::Cancel,
                cancel_template(unvault_outpoint, &pubkeys, protected_value, network),
                unvault_script.clone(),
                unvault_value,
            ),
            unvault_emergency: PresignedTx::new(
                TxRole::UnvaultEmergency,
                unvault_emergency_template(
                    unvault_outpoint,
                    &emergency_pubkeys,
                    protected_value,
                    network,
                ),
                unvault_script,
                unvault_value,
            ),
            our_unvault_sig: None,
        };
        (record, privkeys)
    }

    #[test]
    fn stage_machine_follows_the_happy_path_in_order() {
        let (mut record, _) = test_record(1);
        assert!(record.advance(VaultStage::RevocationsComplete).is_err());
        record.advance(VaultStage::EmergencySigned).unwrap();
        record.advance(VaultStage::RevocationsComplete).unwrap();
        record.advance(VaultStage::Unvaulting).unwrap();
        record.advance(VaultStage::Secured).unwrap();
        assert!(record.stage.is_secured());
        record.advance(VaultStage::SpendInFlight).unwrap();
        // Terminal stages accept nothing further
        assert!(record.advance(VaultStage::Canceled).is_err());
    }

    #[test]
    fn protective_interrupts_are_allowed_from_any_live_stage() {
        let (mut record, _) = test_record(1);
        record.advance(VaultStage::EmergencySigned).unwrap();
        record.advance(VaultStage::EmergencySwept).unwrap();

        let (mut record, _) = test_record(2);
        assert!(record.advance(VaultStage::SpendInFlight).is_err());
        record.advance(VaultStage::Canceled).unwrap();
    }

    #[test]
    fn slots_reject_conflicting_signatures() {
        let mut slots = SignatureSlots::default();
        let id = StakeholderId::new(2).unwrap();
        slots.fill(id, vec![1, 2, 3]).unwrap();
        slots.fill(id, vec![1, 2, 3]).unwrap();
        assert!(slots.fill(id, vec![4, 5, 6]).is_err());
        assert_eq!(slots.missing().len(), 3);
        assert!(!slots.is_complete());
    }

    #[test]
    fn verified_signatures_complete_a_template() {
        let (mut record, privkeys) = test_record(3);
        let ty = record.cancel.sighash_type();
        for (i, id) in StakeholderId::all().into_iter().enumerate() {
            let sig = sign_template(
                &record.cancel.template,
                &record.cancel.witness_script,
                record.cancel.prev_value,
                ty,
                &privkeys[i],
            )
            .unwrap();
            let pubkey = record.pubkeys[i];
            record.cancel.verify_and_fill(id, &pubkey, sig).unwrap();
        }
        assert!(record.cancel.sigs.is_complete());
        let tx = record.cancel.finalize().unwrap();
        // Reverse order plus the script, no multisig padding
        assert_eq!(tx.input[0].witness.len(), 5);
    }

    #[test]
    fn bad_signatures_never_reach_a_slot() {
        let (mut record, privkeys) = test_record(4);
        let id = StakeholderId::new(1).unwrap();
        // Signed with the wrong key for slot 1
        let sig = sign_template(
            &record.cancel.template,
            &record.cancel.witness_script,
            record.cancel.prev_value,
            record.cancel.sighash_type(),
            &privkeys[1],
        )
        .unwrap();
        let pubkey = record.pubkeys[0];
        let err = record.cancel.verify_and_fill(id, &pubkey, sig).unwrap_err();
        assert!(matches!(err, VaultError::InvalidSignature { position: 1, .. }));
        assert!(record.cancel.sigs.get(id).is_none());
    }

    #[test]
    fn registry_lookups_cover_vault_unvault_and_address() {
        let mut registry = VaultRegistry::new(Network::Regtest);
        let (record, _) = test_record(5);
        let outpoint = record.outpoint;
        let vault_txid = record.vault_txid();
        let unvault_txid = record.unvault_txid();
        registry.insert(record);

        assert!(registry.contains(&outpoint));
        assert_eq!(
            registry.by_vault_txid(&vault_txid).unwrap().outpoint,
            outpoint
        );
        assert_eq!(
            registry.by_unvault_txid(&unvault_txid).unwrap().outpoint,
            outpoint
        );
        let unvault_addr = registry.unvault_addresses().pop().unwrap();
        assert_eq!(
            registry.vault_of_unvault_address(&unvault_addr),
            Some(outpoint)
        );

        registry.remove(&outpoint);
        assert!(registry.is_empty());
        assert!(registry.unvault_addresses().is_empty());
    }

    #[test]
    fn same_address_different_outpoints_are_independent_records() {
        let mut registry = VaultRegistry::new(Network::Regtest);
        let (first, _) = test_record(6);
        let (mut second, _) = test_record(7);
        // Same keys, same derivation index: same vault address
        second.derivation_index = first.derivation_index;
        registry.insert(first);
        registry.insert(second);
        assert_eq!(registry.len(), 2);
    }
}
