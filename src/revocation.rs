//! # Revocation Engine
//!
//! Drives each vault from discovery to secured, enforcing the one ordering
//! rule the whole protocol's safety rests on: our unvault signature is
//! published only after the emergency, cancel and unvault-emergency
//! transactions each carry all four verified signatures. Until then a
//! rogue unvault simply cannot be answered, so we never make one possible.
//!
//! The engine is a long-lived task pool fed by the chain watcher over a
//! channel; late-arriving vaults join without tearing anything down. Each
//! vault gets one securing task, which runs one signature-collection task
//! per protective role, then releases the unvault signature and collects
//! the remaining unvault slots.

use std::sync::{Arc, Mutex};

use bitcoin::OutPoint;
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::watch;
use crate::error::{VaultError, VaultResult};
use crate::registry::{VaultRegistry, VaultStage};
use crate::services::{NodeClient, SigExchange};
use crate::transactions::TxRole;
use crate::watcher::StopSignal;

pub struct RevocationEngine {
    registry: Arc<Mutex<VaultRegistry>>,
    sigserver: Arc<SigExchange>,
    node: Arc<NodeClient>,
    stop: StopSignal,
}

impl RevocationEngine {
    pub fn new(
        registry: Arc<Mutex<VaultRegistry>>,
        sigserver: Arc<SigExchange>,
        node: Arc<NodeClient>,
        stop: StopSignal,
    ) -> Self {
        Self {
            registry,
            sigserver,
            node,
            stop,
        }
    }

    /// Accept vault outpoints from the watcher until stopped, spawning one
    /// securing task each, and join them all on the way out.
    pub async fn run(self: Arc<Self>, mut new_vaults: mpsc::UnboundedReceiver<OutPoint>) {
        info!("revocation engine started");
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        loop {
            tokio::select! {
                received = new_vaults.recv() => match received {
                    Some(outpoint) => {
                        let engine = Arc::clone(&self);
                        tasks.push(tokio::spawn(async move {
                            if let Err(e) = engine.secure_vault(outpoint).await {
                                error!("securing vault {} failed: {}", outpoint, e);
                            }
                        }));
                    }
                    None => break,
                },
                _ = self.stop.cancelled() => break,
            }
        }
        for task in tasks {
            let _ = task.await;
        }
        info!("revocation engine stopped");
    }

    async fn secure_vault(&self, outpoint: OutPoint) -> VaultResult<()> {
        // One collection task per protective role; they fill independent
        // slots and only ever touch their own template.
        let mut collectors = Vec::with_capacity(3);
        for role in [TxRole::Emergency, TxRole::Cancel, TxRole::UnvaultEmergency] {
            let registry = Arc::clone(&self.registry);
            let sigserver = Arc::clone(&self.sigserver);
            let node = Arc::clone(&self.node);
            let stop = self.stop.clone();
            collectors.push(tokio::spawn(async move {
                collect_signatures(&registry, &sigserver, &node, &stop, outpoint, role).await
            }));
        }
        for collector in collectors {
            match collector.await {
                Ok(Ok(true)) => {}
                // Torn down (stop, or the vault left the registry): bail
                // out quietly without ever releasing the unvault signature.
                Ok(Ok(false)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(e) => {
                    return Err(VaultError::operation(
                        "secure_vault",
                        format!("collection task died: {}", e),
                    ))
                }
            }
        }

        // All three protective transactions are final: committing to the
        // unvault is now safe.
        let (unvault_txid, our_sig) = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            let Some(record) = registry.get_mut(&outpoint) else {
                return Ok(());
            };
            record.advance(VaultStage::RevocationsComplete)?;
            (record.unvault_txid(), record.our_unvault_sig.clone())
        };
        let our_sig = our_sig.ok_or_else(|| {
            VaultError::operation("secure_vault", "unvault signature missing from the record")
        })?;

        loop {
            match self.sigserver.push_signature(&unvault_txid, &our_sig).await {
                Ok(()) => break,
                Err(e @ VaultError::Protocol { .. }) => return Err(e),
                Err(e) => warn!("unvault signature push failed, retrying: {}", e),
            }
            if self.stop.wait_timeout(watch::SIG_POLL_INTERVAL).await {
                return Ok(());
            }
        }
        {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            let Some(record) = registry.get_mut(&outpoint) else {
                return Ok(());
            };
            record.advance(VaultStage::Unvaulting)?;
        }
        info!(
            "vault {}: revocations complete, unvault signature released",
            outpoint
        );

        if collect_signatures(
            &self.registry,
            &self.sigserver,
            &self.node,
            &self.stop,
            outpoint,
            TxRole::Unvault,
        )
        .await?
        {
            info!("vault {} secured", outpoint);
        }
        Ok(())
    }
}

/// Poll the exchange for the empty slots of one template until all four
/// verified signatures are in, then assemble the witness, sanity-check it
/// against the mempool where its parent is already on chain, and advance
/// the vault stage.
///
/// Returns false when torn down before completion (stop signal, or the
/// vault disappeared from the registry).
async fn collect_signatures(
    registry: &Mutex<VaultRegistry>,
    sigserver: &SigExchange,
    node: &NodeClient,
    stop: &StopSignal,
    outpoint: OutPoint,
    role: TxRole,
) -> VaultResult<bool> {
    let txid = {
        let registry = registry.lock().expect("registry lock poisoned");
        let Some(record) = registry.get(&outpoint) else {
            return Ok(false);
        };
        record.presigned(role)?.txid()
    };

    let mut interval = watch::SIG_POLL_INTERVAL;
    loop {
        let missing = {
            let registry = registry.lock().expect("registry lock poisoned");
            let Some(record) = registry.get(&outpoint) else {
                return Ok(false);
            };
            record.presigned(role)?.sigs.missing()
        };
        if missing.is_empty() {
            break;
        }

        let mut progressed = false;
        for id in missing {
            match sigserver.get_signature(&txid, id).await {
                Ok(Some(sig)) => {
                    let mut registry = registry.lock().expect("registry lock poisoned");
                    let Some(record) = registry.get_mut(&outpoint) else {
                        return Ok(false);
                    };
                    let pubkey = record.pubkeys[id.index()];
                    // A bad signature is a protocol violation, not noise:
                    // surface it and let this task die.
                    record.presigned_mut(role)?.verify_and_fill(id, &pubkey, sig)?;
                    progressed = true;
                }
                Ok(None) => {}
                Err(e) => warn!(
                    "fetching {} signature {}/{} failed, retrying: {}",
                    role.as_str(),
                    txid,
                    id,
                    e
                ),
            }
        }

        interval = if progressed {
            watch::SIG_POLL_INTERVAL
        } else {
            (interval * 2).min(watch::SIG_POLL_MAX_INTERVAL)
        };
        if stop.wait_timeout(interval).await {
            return Ok(false);
        }
    }

    // Assemble off to the side first: a template that fails the node's
    // mempool check must never be marked signed.
    let assembled = {
        let registry = registry.lock().expect("registry lock poisoned");
        let Some(record) = registry.get(&outpoint) else {
            return Ok(false);
        };
        record.presigned(role)?.assemble()?
    };
    if matches!(role, TxRole::Emergency | TxRole::Unvault) {
        // These spend an output that is already confirmed, so the node can
        // fully validate them. Cancel and the unvault emergency spend the
        // not-yet-broadcast unvault; their signatures were verified one by
        // one instead.
        loop {
            match node.test_mempool_accept(&assembled) {
                Ok(()) => break,
                // A rejected witness-complete template is an invariant
                // violation: the vault must not advance.
                Err(e @ VaultError::MempoolReject { .. }) => return Err(e),
                Err(e) => warn!("mempool check failed, retrying: {}", e),
            }
            if stop.wait_timeout(watch::SIG_POLL_INTERVAL).await {
                return Ok(false);
            }
        }
    }

    let mut registry = registry.lock().expect("registry lock poisoned");
    let Some(record) = registry.get_mut(&outpoint) else {
        return Ok(false);
    };
    record.presigned_mut(role)?.finalize()?;
    match role {
        TxRole::Emergency => record.advance(VaultStage::EmergencySigned)?,
        TxRole::Unvault => record.advance(VaultStage::Secured)?,
        _ => {}
    }
    Ok(true)
}
