//! # Stakeholder Wallet
//!
//! The composition root tying the whole control plane together: one
//! instance per stakeholder process. Construction imports the watched
//! scripts, fetches the cosigning server's pubkey, and spawns the three
//! long-lived tasks (chain watcher, revocation engine, spend-request
//! poller); teardown triggers the shared stop signal and joins them.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Address, Network, OutPoint, Txid};
use log::{info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::VaultResult;
use crate::keys::{DerivationWindow, KeyChain, StakeholderId, STAKEHOLDER_COUNT};
use crate::registry::{VaultRegistry, VaultStage};
use crate::revocation::RevocationEngine;
use crate::scripts;
use crate::services::{CosignClient, NodeClient, SigExchange};
use crate::spend::SpendCoordinator;
use crate::watcher::{self, ChainWatcher, StopSignal};

/// Everything a stakeholder needs to join a wallet.
pub struct WalletConfig {
    pub network: Network,
    /// Our extended private key; its xpub must be one of the four below
    pub master_xpriv: Xpriv,
    /// The four stakeholders' xpubs: trader 1, trader 2, then the two
    /// passive co-owners
    pub stakeholder_xpubs: [Xpub; STAKEHOLDER_COUNT],
    /// The four fixed offline emergency pubkeys, same order
    pub emergency_pubkeys: [PublicKey; STAKEHOLDER_COUNT],
    pub sig_exchange_url: String,
    pub cosigner_url: String,
    /// Destinations we are willing to see vaults spent to
    pub acked_addresses: Vec<Address>,
    /// Unix timestamp of wallet creation; `None` means created just now
    pub birthdate: Option<u64>,
    /// First derivation index to watch (zero for a fresh wallet)
    pub start_index: u32,
}

pub struct StakeholderWallet {
    keychain: Arc<KeyChain>,
    registry: Arc<Mutex<VaultRegistry>>,
    node: Arc<NodeClient>,
    window: Arc<Mutex<DerivationWindow>>,
    spend: Arc<SpendCoordinator>,
    emergency_address: Address,
    birthdate: u64,
    stop: StopSignal,
    tasks: Vec<JoinHandle<()>>,
}

impl StakeholderWallet {
    pub async fn new(config: WalletConfig, node: NodeClient) -> VaultResult<Self> {
        let keychain = Arc::new(KeyChain::new(
            config.master_xpriv,
            config.stakeholder_xpubs,
            config.emergency_pubkeys,
            config.network,
        )?);
        info!("starting wallet as stakeholder {}", keychain.our_id());

        let node = Arc::new(node);
        let registry = Arc::new(Mutex::new(VaultRegistry::new(config.network)));
        let sigserver = Arc::new(SigExchange::new(
            config.sig_exchange_url,
            keychain.our_id(),
        )?);
        let cosigner = Arc::new(CosignClient::new(config.cosigner_url)?);
        let birthdate = config.birthdate.unwrap_or_else(unix_now);

        // There is a single emergency script shared by every vault; watch
        // it before anything else.
        let emergency_address =
            scripts::emergency_address(keychain.emergency_pubkeys(), config.network);
        node.import_address(&emergency_address, "covault_emergency", false)?;

        let window = Arc::new(Mutex::new(DerivationWindow::new(config.start_index)));
        let range = {
            let window = window.lock().expect("window lock poisoned");
            window.range()
        };
        watcher::watch_index_range(&node, &keychain, &registry, birthdate, range)?;

        let cosigner_key = cosigner.get_pubkey().await?;
        let known_spends = Arc::new(Mutex::new(HashSet::<Txid>::new()));
        let stop = StopSignal::new();

        let spend = Arc::new(SpendCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&sigserver),
            Arc::clone(&cosigner),
            Arc::clone(&node),
            Arc::clone(&keychain),
            Arc::clone(&known_spends),
            config.acked_addresses.into_iter().collect(),
            stop.clone(),
        ));

        let (new_vaults_tx, new_vaults_rx) = mpsc::unbounded_channel::<OutPoint>();
        let chain_watcher = ChainWatcher::new(
            Arc::clone(&node),
            Arc::clone(&sigserver),
            Arc::clone(&keychain),
            cosigner_key,
            Arc::clone(&registry),
            Arc::clone(&window),
            Arc::clone(&known_spends),
            new_vaults_tx,
            emergency_address.clone(),
            birthdate,
            stop.clone(),
        );
        let engine = Arc::new(RevocationEngine::new(
            Arc::clone(&registry),
            Arc::clone(&sigserver),
            Arc::clone(&node),
            stop.clone(),
        ));

        let mut tasks = Vec::with_capacity(3);
        tasks.push(tokio::spawn(async move {
            // Fatal watcher errors already triggered the stop signal
            let _ = chain_watcher.run().await;
        }));
        tasks.push(tokio::spawn(engine.run(new_vaults_rx)));
        tasks.push(tokio::spawn(Arc::clone(&spend).run_request_poller()));

        Ok(Self {
            keychain,
            registry,
            node,
            window,
            spend,
            emergency_address,
            birthdate,
            stop,
            tasks,
        })
    }

    pub fn our_id(&self) -> StakeholderId {
        self.keychain.our_id()
    }

    pub fn emergency_address(&self) -> &Address {
        &self.emergency_address
    }

    /// The spend rendezvous for trader calls and tests
    pub fn spend_coordinator(&self) -> Arc<SpendCoordinator> {
        Arc::clone(&self.spend)
    }

    /// The next vault deposit address, bumping the generation index and
    /// extending the watched window when the gap limit demands it.
    pub fn next_deposit_address(&self) -> VaultResult<Address> {
        let (index, needs_extension) = {
            let mut window = self.window.lock().expect("window lock poisoned");
            let index = window.next_gen_index();
            (index, window.needs_extension())
        };
        let pubkeys = self.keychain.vault_pubkeys(index)?;
        let address = scripts::vault_address(&pubkeys, self.keychain.network());
        {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            registry.watch_address(address.clone(), index);
        }
        if needs_extension {
            let range = {
                let mut window = self.window.lock().expect("window lock poisoned");
                window.extend()
            };
            watcher::watch_index_range(
                &self.node,
                &self.keychain,
                &self.registry,
                self.birthdate,
                range,
            )?;
        }
        Ok(address)
    }

    /// Current lifecycle stage of a vault, if we know it.
    pub fn secure_status(&self, outpoint: &OutPoint) -> Option<VaultStage> {
        let registry = self.registry.lock().expect("registry lock poisoned");
        registry.get(outpoint).map(|record| record.stage)
    }

    /// Outpoints of every vault in the registry.
    pub fn vault_outpoints(&self) -> Vec<OutPoint> {
        let registry = self.registry.lock().expect("registry lock poisoned");
        registry.records().map(|record| record.outpoint).collect()
    }

    /// Broadcast every fully-signed emergency transaction we hold. The
    /// chain watchers (ours included) will observe the emergency outputs
    /// and drive the global shutdown from there.
    pub fn emergency_sweep(&self) -> VaultResult<usize> {
        let emergency_txs = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            registry.emergency_transactions()
        };
        let mut broadcast = 0;
        for tx in &emergency_txs {
            match self.node.send_raw_transaction(tx) {
                Ok(txid) => {
                    info!("emergency transaction {} broadcast", txid);
                    broadcast += 1;
                }
                Err(e) => warn!("emergency broadcast failed: {}", e),
            }
        }
        Ok(broadcast)
    }

    /// Tear the wallet down: cancel every periodic task and join them.
    /// In-flight calls complete but their results are discarded.
    pub async fn stop(mut self) {
        info!("stopping wallet");
        self.stop.trigger();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("wallet stopped");
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoincore_rpc::Auth;

    fn test_config(seed: u8) -> WalletConfig {
        let secp = Secp256k1::new();
        let xpubs = [1u8, 2, 3, 4].map(|s| {
            let xpriv = Xpriv::new_master(Network::Regtest, &[s; 32]).unwrap();
            Xpub::from_priv(&secp, &xpriv)
        });
        WalletConfig {
            network: Network::Regtest,
            master_xpriv: Xpriv::new_master(Network::Regtest, &[seed; 32]).unwrap(),
            stakeholder_xpubs: xpubs,
            emergency_pubkeys: [11u8, 12, 13, 14].map(|s| {
                SecretKey::from_slice(&[s; 32]).unwrap().public_key(&secp)
            }),
            sig_exchange_url: "http://127.0.0.1:8080".to_string(),
            cosigner_url: "http://127.0.0.1:8081".to_string(),
            acked_addresses: Vec::new(),
            birthdate: Some(1_600_000_000),
            start_index: 0,
        }
    }

    #[tokio::test]
    #[ignore] // Needs a regtest node plus the two servers; see the config above
    async fn wallet_starts_and_stops_cleanly() {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = test_config(1);
        let node = NodeClient::new(
            "http://127.0.0.1:18443/wallet/covault_watchonly",
            Auth::UserPass("user".to_string(), "password".to_string()),
            Network::Regtest,
        )
        .unwrap();
        let wallet = StakeholderWallet::new(config, node).await.unwrap();
        assert_eq!(wallet.our_id().number(), 1);
        let address = wallet.next_deposit_address().unwrap();
        assert!(wallet.vault_outpoints().is_empty());
        println!("deposit to {}", address);
        wallet.stop().await;
    }
}
