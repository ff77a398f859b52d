//! # Chain Watcher
//!
//! The reactive half of the protocol. A periodic poll of the node that:
//!
//! 1. treats any output on the emergency address as the global panic
//!    button: broadcast every stored emergency transaction and shut the
//!    wallet down;
//! 2. answers any unvault output we did not authorize with an immediate
//!    broadcast of the pre-signed cancel;
//! 3. turns fresh deposits to watched vault addresses into registry
//!    records, with all four templates built, fee-stamped and locally
//!    signed (the unvault signature withheld), and wakes the revocation
//!    engine.
//!
//! Transient RPC failures are retried on the next tick and never surfaced.
//! A failed cancel broadcast is fatal: the record and its collected
//! signatures are left in place so nothing is lost for manual recovery.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Address, Amount, OutPoint, Transaction, Txid};
use log::{error, info, warn};
use tokio::sync::{mpsc, Notify};

use crate::config::watch;
use crate::error::{VaultError, VaultResult};
use crate::keys::{DerivationWindow, KeyChain};
use crate::registry::{PresignedTx, VaultRecord, VaultRegistry, VaultStage};
use crate::scripts;
use crate::services::{NodeClient, SigExchange, Utxo};
use crate::transactions::{self, TxRole};

/// Cooperative cancellation flag shared by every periodic task.
///
/// Tasks check it between poll iterations with a bounded wait, so teardown
/// is observed within one interval; in-flight RPC or HTTP calls complete
/// but their results are discarded.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for `timeout`, returning true when the signal fired before or
    /// during the wait.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        if self.is_triggered() {
            return true;
        }
        tokio::select! {
            _ = &mut notified => true,
            _ = tokio::time::sleep(timeout) => self.is_triggered(),
        }
    }

    /// Resolve once the signal fires.
    pub async fn cancelled(&self) {
        while !self.is_triggered() {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Derive and register the vault addresses for an index range, then ask
/// the node to watch the corresponding descriptor range.
pub(crate) fn watch_index_range(
    node: &NodeClient,
    keychain: &KeyChain,
    registry: &Mutex<VaultRegistry>,
    birthdate: u64,
    range: (u32, u32),
) -> VaultResult<()> {
    for index in range.0..range.1 {
        let pubkeys = keychain.vault_pubkeys(index)?;
        let address = scripts::vault_address(&pubkeys, keychain.network());
        registry
            .lock()
            .expect("registry lock poisoned")
            .watch_address(address, index);
    }
    node.import_vault_descriptor(keychain.xpubs(), birthdate, range)
}

pub struct ChainWatcher {
    node: Arc<NodeClient>,
    sigserver: Arc<SigExchange>,
    keychain: Arc<KeyChain>,
    cosigner_key: PublicKey,
    registry: Arc<Mutex<VaultRegistry>>,
    window: Arc<Mutex<DerivationWindow>>,
    known_spends: Arc<Mutex<HashSet<Txid>>>,
    new_vaults: mpsc::UnboundedSender<OutPoint>,
    emergency_address: Address,
    birthdate: u64,
    stop: StopSignal,
}

impl ChainWatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: Arc<NodeClient>,
        sigserver: Arc<SigExchange>,
        keychain: Arc<KeyChain>,
        cosigner_key: PublicKey,
        registry: Arc<Mutex<VaultRegistry>>,
        window: Arc<Mutex<DerivationWindow>>,
        known_spends: Arc<Mutex<HashSet<Txid>>>,
        new_vaults: mpsc::UnboundedSender<OutPoint>,
        emergency_address: Address,
        birthdate: u64,
        stop: StopSignal,
    ) -> Self {
        Self {
            node,
            sigserver,
            keychain,
            cosigner_key,
            registry,
            window,
            known_spends,
            new_vaults,
            emergency_address,
            birthdate,
            stop,
        }
    }

    pub async fn run(self) -> VaultResult<()> {
        info!("chain watcher started");
        loop {
            if self.stop.wait_timeout(watch::FUNDS_POLL_INTERVAL).await {
                break;
            }
            match self.tick().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    error!("chain watcher fatal error: {}", e);
                    self.stop.trigger();
                    return Err(e);
                }
            }
        }
        info!("chain watcher stopped");
        Ok(())
    }

    /// One poll round. Returns true on terminal shutdown.
    async fn tick(&self) -> VaultResult<bool> {
        // The panic button comes first: any output on the emergency script.
        match self.node.list_unspent(1, &[self.emergency_address.clone()]) {
            Ok(hits) if !hits.is_empty() => {
                self.terminal_shutdown();
                return Ok(true);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("emergency scan failed, retrying next tick: {}", e);
                return Ok(false);
            }
        }

        // Unvault outputs: either an authorized spend in flight or a rogue
        // broadcast to cancel.
        let unvault_addresses = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            registry.unvault_addresses()
        };
        if !unvault_addresses.is_empty() {
            match self.node.list_unspent(1, &unvault_addresses) {
                Ok(hits) => {
                    for utxo in hits {
                        self.handle_unvault_output(&utxo)?;
                    }
                }
                Err(e) => warn!("unvault scan failed, retrying next tick: {}", e),
            }
        }

        // Fresh deposits to watched vault addresses.
        let watched = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            registry.watched_addresses()
        };
        let deposits = match self.node.list_unspent(1, &watched) {
            Ok(utxos) => utxos,
            Err(e) => {
                warn!("deposit scan failed, retrying next tick: {}", e);
                return Ok(false);
            }
        };
        for utxo in deposits {
            let known = {
                let registry = self.registry.lock().expect("registry lock poisoned");
                registry.contains(&utxo.outpoint())
            };
            if known {
                continue;
            }
            if let Err(e) = self.materialize_vault(&utxo).await {
                // Retried next tick: the deposit is still unspent and the
                // feerates are frozen server-side, so the rebuild is
                // deterministic.
                warn!("could not add vault {}: {}", utxo.outpoint(), e);
            }
        }
        Ok(false)
    }

    /// An output appeared on one of our unvault addresses.
    fn handle_unvault_output(&self, utxo: &Utxo) -> VaultResult<()> {
        let unvault_txid = utxo.txid;
        let authorized = {
            let known = self.known_spends.lock().expect("known_spends lock poisoned");
            known.contains(&unvault_txid)
        };
        let (outpoint, cancel_tx) = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            match registry.by_unvault_txid(&unvault_txid) {
                Some(record) => (record.outpoint, record.cancel.finalized.clone()),
                None => {
                    warn!("output on unvault address from unknown tx {}", unvault_txid);
                    return Ok(());
                }
            }
        };

        if authorized {
            // Identify the spending transaction before forgetting the vault
            match self.node.spent_prevout_txid(&unvault_txid) {
                Ok(prev_txid) if prev_txid == outpoint.txid => {
                    let mut registry = self.registry.lock().expect("registry lock poisoned");
                    registry.remove(&outpoint);
                    info!("vault {} spent through authorized unvault {}", outpoint, unvault_txid);
                }
                Ok(prev_txid) => {
                    warn!(
                        "unvault {} spends {} instead of vault {}, keeping the record",
                        unvault_txid, prev_txid, outpoint.txid
                    );
                }
                Err(e) => warn!("could not identify spender of vault {}: {}", outpoint, e),
            }
            return Ok(());
        }

        // Unauthorized: restore the vault immediately. Failure here is fatal:
        // the record and its collected signatures must survive for recovery.
        let cancel_tx = cancel_tx.ok_or_else(|| {
            VaultError::operation(
                "cancel",
                format!(
                    "rogue unvault {} observed before the cancel was fully signed",
                    unvault_txid
                ),
            )
        })?;
        info!(
            "unauthorized unvault {} observed, broadcasting cancel",
            unvault_txid
        );
        self.node.send_raw_transaction(&cancel_tx)?;
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        if let Some(record) = registry.get_mut(&outpoint) {
            record.advance(VaultStage::Canceled)?;
        }
        registry.remove(&outpoint);
        Ok(())
    }

    /// Build, fee-stamp and locally sign the four templates for a fresh
    /// deposit, publish the protective signatures, and hand the vault to
    /// the revocation engine.
    async fn materialize_vault(&self, utxo: &Utxo) -> VaultResult<()> {
        let network = self.keychain.network();
        let address = utxo.address(network)?;
        let index = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            registry.index_of_address(&address)
        };
        let Some(index) = index else {
            // Not one of ours; the chain is full of other people's coins
            warn!("ignoring deposit to unknown address {}", address);
            return Ok(());
        };

        let outpoint = utxo.outpoint();
        let amount = utxo.amount_sat()?;
        let pubkeys = self.keychain.vault_pubkeys(index)?;
        let privkey = self.keychain.our_privkey(index)?;
        let emergency_pubkeys = self.keychain.emergency_pubkeys();
        let our_id = self.keychain.our_id();
        let our_pubkey = pubkeys[our_id.index()];

        let vault_script = scripts::vault_script(&pubkeys);
        let unvault_script = scripts::unvault_script(&pubkeys, &self.cosigner_key);

        let emergency_tx = self
            .stamped_template(TxRole::Emergency, amount, |value| {
                transactions::emergency_template(outpoint, emergency_pubkeys, value, network)
            })
            .await?;
        let unvault_tx = self
            .stamped_template(TxRole::Unvault, amount, |value| {
                transactions::unvault_template(outpoint, &pubkeys, &self.cosigner_key, value, network)
            })
            .await?;
        let unvault_value = unvault_tx.output[0].value;
        let unvault_outpoint = OutPoint::new(unvault_tx.compute_txid(), 0);
        let cancel_tx = self
            .stamped_template(TxRole::Cancel, unvault_value, |value| {
                transactions::cancel_template(unvault_outpoint, &pubkeys, value, network)
            })
            .await?;
        let unvault_emergency_tx = self
            .stamped_template(TxRole::UnvaultEmergency, unvault_value, |value| {
                transactions::unvault_emergency_template(
                    unvault_outpoint,
                    emergency_pubkeys,
                    value,
                    network,
                )
            })
            .await?;

        let mut record = VaultRecord {
            outpoint,
            amount,
            derivation_index: index,
            pubkeys,
            privkey,
            stage: VaultStage::Discovered,
            emergency: PresignedTx::new(
                TxRole::Emergency,
                emergency_tx,
                vault_script.clone(),
                amount,
            ),
            unvault: PresignedTx::new(TxRole::Unvault, unvault_tx, vault_script, amount),
            cancel: PresignedTx::new(
                TxRole::Cancel,
                cancel_tx,
                unvault_script.clone(),
                unvault_value,
            ),
            unvault_emergency: PresignedTx::new(
                TxRole::UnvaultEmergency,
                unvault_emergency_tx,
                unvault_script,
                unvault_value,
            ),
            our_unvault_sig: None,
        };

        // Sign everything locally. The protective signatures go straight to
        // the exchange; the unvault one is withheld until the revocations
        // are complete.
        let mut pushes = Vec::with_capacity(3);
        for role in [TxRole::Emergency, TxRole::Cancel, TxRole::UnvaultEmergency] {
            let presigned = record.presigned_mut(role)?;
            let sig = transactions::sign_template(
                &presigned.template,
                &presigned.witness_script,
                presigned.prev_value,
                presigned.sighash_type(),
                &privkey,
            )?;
            let txid = presigned.txid();
            presigned.verify_and_fill(our_id, &our_pubkey, sig.clone())?;
            pushes.push((txid, sig));
        }
        let unvault_sig = transactions::sign_template(
            &record.unvault.template,
            &record.unvault.witness_script,
            record.unvault.prev_value,
            record.unvault.sighash_type(),
            &privkey,
        )?;
        record
            .unvault
            .verify_and_fill(our_id, &our_pubkey, unvault_sig.clone())?;
        record.our_unvault_sig = Some(unvault_sig);

        // Watch the unvault address before anyone has the signatures to
        // broadcast it.
        let unvault_address = scripts::unvault_address(&pubkeys, &self.cosigner_key, network);
        self.node
            .import_address(&unvault_address, "covault_unvault", false)?;

        for (txid, sig) in &pushes {
            self.sigserver.push_signature(txid, sig).await?;
        }

        {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            registry.insert(record);
        }
        if self.new_vaults.send(outpoint).is_err() {
            warn!("revocation engine is gone, vault {} will not secure", outpoint);
        }

        let needs_extension = {
            let mut window = self.window.lock().expect("window lock poisoned");
            window.record_deposit();
            window.needs_extension()
        };
        if needs_extension {
            self.extend_window()?;
        }

        info!(
            "new vault {} at derivation index {} for {}",
            outpoint, index, amount
        );
        Ok(())
    }

    /// Build a template with a dummy value to measure it, fetch the frozen
    /// feerate for its role, and rebuild it with the stamped output value.
    async fn stamped_template<F>(
        &self,
        role: TxRole,
        input_value: Amount,
        build: F,
    ) -> VaultResult<Transaction>
    where
        F: Fn(Amount) -> Transaction,
    {
        let dummy = build(Amount::ONE_BTC);
        let feerate = self
            .sigserver
            .get_feerate(role, &dummy.compute_txid())
            .await?;
        let value = transactions::stamped_value(input_value, dummy.vsize(), feerate)?;
        Ok(build(value))
    }

    fn extend_window(&self) -> VaultResult<()> {
        let range = {
            let mut window = self.window.lock().expect("window lock poisoned");
            window.extend()
        };
        info!("extending watched derivation window to {:?}", range);
        watch_index_range(
            &self.node,
            &self.keychain,
            &self.registry,
            self.birthdate,
            range,
        )
    }

    /// The emergency script received coins somewhere: sweep everything we
    /// hold to the deep vault and stop the wallet for good.
    fn terminal_shutdown(&self) {
        error!("output on the emergency address observed, sweeping all vaults");
        let emergency_txs = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            let outpoints: Vec<OutPoint> = registry.records().map(|r| r.outpoint).collect();
            for outpoint in outpoints {
                if let Some(record) = registry.get_mut(&outpoint) {
                    // Terminal records stay terminal; nothing to do then
                    let _ = record.advance(VaultStage::EmergencySwept);
                }
            }
            registry.emergency_transactions()
        };
        for tx in &emergency_txs {
            match self.node.send_raw_transaction(tx) {
                Ok(txid) => info!("broadcast emergency transaction {}", txid),
                // Already mined or in the mempool is exactly what we want
                Err(e) => warn!("emergency broadcast: {}", e),
            }
        }
        self.stop.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_signal_is_observed_within_the_wait() {
        let stop = StopSignal::new();
        assert!(!stop.is_triggered());
        assert!(!stop.wait_timeout(Duration::from_millis(10)).await);

        let waiter = stop.clone();
        let handle = tokio::spawn(async move { waiter.wait_timeout(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.trigger();
        assert!(handle.await.unwrap());
        // Once triggered it stays triggered
        assert!(stop.wait_timeout(Duration::from_millis(1)).await);
        stop.cancelled().await;
    }
}
