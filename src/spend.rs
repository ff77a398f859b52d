//! # Spend Coordination
//!
//! Moving funds out is a two-trader rendezvous. The initiator builds and
//! signs the spend, the peer trader rebuilds and countersigns it, and the
//! initiator completes it with the cosigning server's single-use signature
//! before advertising the destinations to all four stakeholders. Every
//! stakeholder's background poller votes on advertised destination sets
//! against its locally configured acknowledged addresses; one refusal
//! kills the spend.
//!
//! `known_spends` is the local set of unvault txids this process considers
//! authorized. Traders add to it when they take part in a spend, passive
//! stakeholders when they accept one; a stakeholder that refused leaves it
//! out, so its chain watcher will cancel the unvault on sight. That is the
//! intended protective behavior.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{Address, OutPoint, Transaction, Txid};
use log::{info, warn};

use crate::config::watch;
use crate::error::{VaultError, VaultResult};
use crate::keys::{KeyChain, StakeholderId};
use crate::registry::{VaultRegistry, VaultStage};
use crate::services::{CosignClient, NodeClient, SigExchange};
use crate::transactions::{self, Destinations};
use crate::watcher::StopSignal;

/// How often to re-check the registry while waiting for a vault to secure
const SECURE_WAIT_INTERVAL: Duration = Duration::from_millis(500);

pub struct SpendCoordinator {
    registry: Arc<Mutex<VaultRegistry>>,
    sigserver: Arc<SigExchange>,
    cosigner: Arc<CosignClient>,
    node: Arc<NodeClient>,
    keychain: Arc<KeyChain>,
    known_spends: Arc<Mutex<HashSet<Txid>>>,
    acked_addresses: HashSet<Address>,
    stop: StopSignal,
}

impl SpendCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Mutex<VaultRegistry>>,
        sigserver: Arc<SigExchange>,
        cosigner: Arc<CosignClient>,
        node: Arc<NodeClient>,
        keychain: Arc<KeyChain>,
        known_spends: Arc<Mutex<HashSet<Txid>>>,
        acked_addresses: HashSet<Address>,
        stop: StopSignal,
    ) -> Self {
        Self {
            registry,
            sigserver,
            cosigner,
            node,
            keychain,
            known_spends,
            acked_addresses,
            stop,
        }
    }

    /// Block until the vault's four templates are fully signed.
    async fn wait_until_secured(&self, outpoint: OutPoint) -> VaultResult<()> {
        loop {
            let secured = {
                let registry = self.registry.lock().expect("registry lock poisoned");
                registry
                    .get(&outpoint)
                    .ok_or(VaultError::UnknownVault(outpoint))?
                    .stage
                    .is_secured()
            };
            if secured {
                return Ok(());
            }
            if self.stop.wait_timeout(SECURE_WAIT_INTERVAL).await {
                return Err(VaultError::operation(
                    "spend",
                    "wallet stopped while waiting for the vault to secure",
                ));
            }
        }
    }

    fn build_and_sign(
        &self,
        outpoint: OutPoint,
        destinations: &Destinations,
    ) -> VaultResult<(Transaction, Vec<u8>)> {
        let registry = self.registry.lock().expect("registry lock poisoned");
        let record = registry
            .get(&outpoint)
            .ok_or(VaultError::UnknownVault(outpoint))?;
        let tx = transactions::spend_template(record.unvault_outpoint(), destinations);
        let sig = transactions::sign_template(
            &tx,
            record.unvault_witness_script(),
            record.unvault_value(),
            EcdsaSighashType::All,
            &record.privkey,
        )?;
        Ok((tx, sig))
    }

    fn require_trader(&self) -> VaultResult<StakeholderId> {
        let our_id = self.keychain.our_id();
        if !our_id.is_trader() {
            return Err(VaultError::operation(
                "spend",
                "only the two traders may take part in a spend",
            ));
        }
        Ok(our_id)
    }

    /// First step, run by the initiating trader: sign the spend and mark
    /// the unvault as ours so our own watcher will not cancel it. The
    /// destinations travel to the peer out of band.
    pub async fn initiate_spend(
        &self,
        outpoint: OutPoint,
        destinations: &Destinations,
    ) -> VaultResult<Vec<u8>> {
        self.require_trader()?;
        self.wait_until_secured(outpoint).await?;
        let (_, sig) = self.build_and_sign(outpoint, destinations)?;
        self.mark_authorized(outpoint)?;
        Ok(sig)
    }

    /// Run by the peer trader: rebuild the spend from our own knowledge of
    /// the vault and countersign it.
    pub async fn accept_spend(
        &self,
        vault_txid: Txid,
        destinations: &Destinations,
    ) -> VaultResult<Vec<u8>> {
        self.require_trader()?;
        let outpoint = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            registry
                .by_vault_txid(&vault_txid)
                .map(|record| record.outpoint)
        }
        .ok_or_else(|| {
            VaultError::operation("spend", format!("no vault with txid {}", vault_txid))
        })?;
        self.wait_until_secured(outpoint).await?;
        let (_, sig) = self.build_and_sign(outpoint, destinations)?;
        self.mark_authorized(outpoint)?;
        Ok(sig)
    }

    /// Final step, run by the initiator with the peer's signature in hand:
    /// fetch the one cosignature, assemble the witness, advertise the
    /// destinations, and wait for the stakeholders' unanimous verdict.
    pub async fn complete_spend(
        &self,
        outpoint: OutPoint,
        peer: StakeholderId,
        peer_sig: Vec<u8>,
        destinations: &Destinations,
    ) -> VaultResult<Transaction> {
        let our_id = self.require_trader()?;
        if !peer.is_trader() || peer == our_id {
            return Err(VaultError::operation(
                "spend",
                "the countersignature must come from the other trader",
            ));
        }
        self.wait_until_secured(outpoint).await?;
        let (tx, our_sig) = self.build_and_sign(outpoint, destinations)?;

        let (vault_txid, unvault_txid, pubkeys, prev_value, script) = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            let record = registry
                .get(&outpoint)
                .ok_or(VaultError::UnknownVault(outpoint))?;
            (
                record.vault_txid(),
                record.unvault_txid(),
                record.pubkeys,
                record.unvault_value(),
                record.unvault_witness_script().clone(),
            )
        };

        // Check the peer's signature before spending the cosigner's single
        // use on a transaction that could never broadcast.
        transactions::verify_signature(
            &peer_sig,
            &tx,
            &script,
            prev_value,
            EcdsaSighashType::All,
            &pubkeys[peer.index()],
        )
        .map_err(|_| VaultError::InvalidSignature {
            position: peer.number(),
            txid: tx.compute_txid(),
        })?;

        let cosig = self
            .cosigner
            .get_cosignature(&unvault_txid, &pubkeys, destinations, prev_value)
            .await?;

        let (trader1_sig, trader2_sig) = if our_id.number() == 1 {
            (&our_sig, &peer_sig)
        } else {
            (&peer_sig, &our_sig)
        };
        let mut spend_tx = tx;
        spend_tx.input[0].witness =
            transactions::unvault_cosign_path_witness(trader1_sig, trader2_sig, &cosig, &script);

        self.sigserver.request_spend(&vault_txid, destinations).await?;
        info!(
            "spend of vault {} advertised, awaiting stakeholder verdict",
            vault_txid
        );
        loop {
            match self.sigserver.spend_accepted(&vault_txid).await {
                Ok(Some(true)) => break,
                Ok(Some(false)) => return Err(VaultError::SpendRefused(vault_txid)),
                Ok(None) => {}
                Err(e) => warn!("spend verdict poll failed, retrying: {}", e),
            }
            if self.stop.wait_timeout(SECURE_WAIT_INTERVAL).await {
                return Err(VaultError::operation(
                    "spend",
                    "wallet stopped while awaiting the spend verdict",
                ));
            }
        }

        {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            if let Some(record) = registry.get_mut(&outpoint) {
                record.advance(VaultStage::SpendInFlight)?;
            }
        }
        info!("spend of vault {} accepted by all stakeholders", vault_txid);
        Ok(spend_tx)
    }

    /// Broadcast the unvault, wait out its six-block timelock, then
    /// broadcast the accepted spend.
    pub async fn broadcast_spend(
        &self,
        outpoint: OutPoint,
        spend_tx: &Transaction,
    ) -> VaultResult<Txid> {
        let unvault_tx = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            registry
                .get(&outpoint)
                .ok_or(VaultError::UnknownVault(outpoint))?
                .unvault
                .finalized
                .clone()
                .ok_or_else(|| {
                    VaultError::operation("spend", "the unvault is not fully signed")
                })?
        };
        let unvault_txid = self.node.send_raw_transaction(&unvault_tx)?;
        info!(
            "unvault {} broadcast, waiting {} confirmations",
            unvault_txid,
            watch::SPEND_CONFIRMATIONS
        );
        loop {
            match self.node.get_confirmations(&unvault_txid) {
                Ok(confirmations) if confirmations >= watch::SPEND_CONFIRMATIONS => break,
                Ok(_) => {}
                Err(e) => warn!("confirmation poll failed, retrying: {}", e),
            }
            if self.stop.wait_timeout(watch::CONFIRMATION_POLL_INTERVAL).await {
                return Err(VaultError::operation(
                    "spend",
                    "wallet stopped while waiting out the unvault timelock",
                ));
            }
        }
        let txid = self.node.send_raw_transaction(spend_tx)?;
        info!("spend {} broadcast", txid);
        Ok(txid)
    }

    /// Background loop run by every stakeholder: vote on each advertised
    /// spend request exactly once.
    pub async fn run_request_poller(self: Arc<Self>) {
        info!("spend-request poller started");
        let mut seen: HashSet<Txid> = HashSet::new();
        loop {
            if self
                .stop
                .wait_timeout(watch::SPEND_REQUESTS_POLL_INTERVAL)
                .await
            {
                break;
            }
            let requests = match self.sigserver.get_spend_requests().await {
                Ok(requests) => requests,
                Err(e) => {
                    warn!("spend-request poll failed, retrying: {}", e);
                    continue;
                }
            };
            for (vault_txid, wire) in requests {
                if seen.contains(&vault_txid) {
                    continue;
                }
                match self.vote_on_request(&vault_txid, &wire).await {
                    Ok(()) => {
                        seen.insert(vault_txid);
                    }
                    // Not marked seen: the vote is retried next round
                    Err(e) => warn!("voting on spend {} failed: {}", vault_txid, e),
                }
            }
        }
        info!("spend-request poller stopped");
    }

    async fn vote_on_request(
        &self,
        vault_txid: &Txid,
        wire: &BTreeMap<String, u64>,
    ) -> VaultResult<()> {
        let destinations = match Destinations::parse(wire, self.keychain.network()) {
            Ok(destinations) => destinations,
            Err(e) => {
                // Garbage destinations cannot be acknowledged by anyone
                warn!("unparseable destinations for spend {}: {}", vault_txid, e);
                self.sigserver
                    .refuse_spend(vault_txid, &Destinations::new())
                    .await?;
                return Ok(());
            }
        };

        let approved = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            destinations_acknowledged(&destinations, &self.acked_addresses, &registry)
        };
        if approved {
            self.sigserver.accept_spend(vault_txid, &destinations).await?;
            // Accepting means this unvault is authorized: our watcher must
            // not cancel it when it shows up on chain.
            let unvault_txid = {
                let registry = self.registry.lock().expect("registry lock poisoned");
                registry
                    .by_vault_txid(vault_txid)
                    .map(|record| record.unvault_txid())
            };
            if let Some(unvault_txid) = unvault_txid {
                self.mark_authorized_txid(unvault_txid);
            }
            info!("accepted spend of vault {}", vault_txid);
        } else {
            self.sigserver.refuse_spend(vault_txid, &destinations).await?;
            info!(
                "refused spend of vault {}: unacknowledged destination",
                vault_txid
            );
        }
        Ok(())
    }

    fn mark_authorized(&self, outpoint: OutPoint) -> VaultResult<()> {
        let unvault_txid = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            registry
                .get(&outpoint)
                .ok_or(VaultError::UnknownVault(outpoint))?
                .unvault_txid()
        };
        self.mark_authorized_txid(unvault_txid);
        Ok(())
    }

    fn mark_authorized_txid(&self, unvault_txid: Txid) {
        self.known_spends
            .lock()
            .expect("known_spends lock poisoned")
            .insert(unvault_txid);
    }
}

/// The destination policy: every destination that is not one of our own
/// vault addresses (change re-vaulting funds) must be pre-acknowledged.
fn destinations_acknowledged(
    destinations: &Destinations,
    acked: &HashSet<Address>,
    registry: &VaultRegistry,
) -> bool {
    destinations
        .addresses()
        .filter(|address| !registry.is_own_vault_address(address))
        .all(|address| acked.contains(address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripts;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::{Amount, Network};

    fn address_for(seed: u8) -> Address {
        let secp = Secp256k1::new();
        let pubkeys =
            [seed, seed + 1, seed + 2, seed + 3].map(|s| {
                SecretKey::from_slice(&[s; 32]).unwrap().public_key(&secp)
            });
        scripts::vault_address(&pubkeys, Network::Regtest)
    }

    #[test]
    fn acknowledged_destinations_pass_the_policy() {
        let registry = VaultRegistry::new(Network::Regtest);
        let acked: HashSet<Address> = [address_for(1)].into_iter().collect();

        let mut destinations = Destinations::new();
        destinations.insert(address_for(1), Amount::from_sat(1_000));
        assert!(destinations_acknowledged(&destinations, &acked, &registry));

        destinations.insert(address_for(10), Amount::from_sat(2_000));
        assert!(!destinations_acknowledged(&destinations, &acked, &registry));
    }

    #[test]
    fn own_vault_addresses_count_as_change() {
        let mut registry = VaultRegistry::new(Network::Regtest);
        let change = address_for(20);
        registry.watch_address(change.clone(), 0);
        let acked: HashSet<Address> = [address_for(1)].into_iter().collect();

        // Pure change: nothing to acknowledge, the spend passes
        let mut destinations = Destinations::new();
        destinations.insert(change.clone(), Amount::from_sat(500));
        assert!(destinations_acknowledged(&destinations, &acked, &registry));

        // Change plus an acked payout still passes
        destinations.insert(address_for(1), Amount::from_sat(700));
        assert!(destinations_acknowledged(&destinations, &acked, &registry));

        // One unknown destination poisons the whole set
        destinations.insert(address_for(10), Amount::from_sat(100));
        assert!(!destinations_acknowledged(&destinations, &acked, &registry));
    }
}
