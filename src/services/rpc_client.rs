//! # Bitcoin Node RPC Client
//!
//! A thin wrapper around `bitcoincore-rpc` exposing exactly the calls the
//! custody protocol needs. The underlying JSON-RPC transport is not safe
//! for concurrent callers, so every call goes through one lock; nothing
//! else (in particular, the registry lock) may be held while calling here.

use std::sync::Mutex;
use std::{env, str::FromStr};

use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{Address, Amount, Network, OutPoint, Transaction, Txid};
use bitcoincore_rpc::{Auth, Client, RpcApi};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{env as env_names, network as net_defaults};
use crate::error::{VaultError, VaultResult};
use crate::keys::STAKEHOLDER_COUNT;

/// One `listunspent` entry, reduced to what the watcher consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub address: Address<bitcoin::address::NetworkUnchecked>,
    /// In BTC, as the node reports it
    pub amount: f64,
    #[serde(default)]
    pub confirmations: u32,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    pub fn amount_sat(&self) -> VaultResult<Amount> {
        Amount::from_btc(self.amount)
            .map_err(|e| VaultError::operation("listunspent", e.to_string()))
    }

    pub fn address(&self, network: Network) -> VaultResult<Address> {
        self.address
            .clone()
            .require_network(network)
            .map_err(|_| VaultError::InvalidAddress(format!("{:?}", self.address)))
    }
}

#[derive(Debug)]
pub struct NodeClient {
    client: Mutex<Client>,
    network: Network,
}

impl NodeClient {
    pub fn new(url: &str, auth: Auth, network: Network) -> VaultResult<Self> {
        let client = Client::new(url, auth)?;
        Ok(Self {
            client: Mutex::new(client),
            network,
        })
    }

    /// Build a client from `RPC_*` environment variables, with defaults
    /// suitable for a local regtest node.
    pub fn from_env(network: Network) -> VaultResult<Self> {
        dotenv::dotenv().ok();

        let host = env::var(env_names::RPC_URL)
            .unwrap_or_else(|_| net_defaults::DEFAULT_RPC_HOST.to_string());
        let port = env::var(env_names::RPC_PORT)
            .unwrap_or_else(|_| net_defaults::DEFAULT_RPC_PORT.to_string());
        let user = env::var(env_names::RPC_USER)
            .unwrap_or_else(|_| net_defaults::DEFAULT_RPC_USER.to_string());
        let password = env::var(env_names::RPC_PASSWORD)
            .unwrap_or_else(|_| net_defaults::DEFAULT_RPC_PASSWORD.to_string());
        let wallet = env::var(env_names::RPC_WALLET)
            .unwrap_or_else(|_| net_defaults::DEFAULT_WALLET_NAME.to_string());

        let url = format!("http://{}:{}/wallet/{}", host, port, wallet);
        Self::new(&url, Auth::UserPass(user, password), network)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    fn call<T: for<'de> Deserialize<'de>>(&self, method: &str, params: &[Value]) -> VaultResult<T> {
        let client = self.client.lock().expect("rpc lock poisoned");
        Ok(client.call(method, params)?)
    }

    /// Import the 4-of-4 P2WSH descriptor over the four xpubs as watchonly
    /// for the given derivation index range.
    pub fn import_vault_descriptor(
        &self,
        xpubs: &[bitcoin::bip32::Xpub; STAKEHOLDER_COUNT],
        birthdate: u64,
        range: (u32, u32),
    ) -> VaultResult<()> {
        let descriptor = format!(
            "wsh(multi(4,{}/*,{}/*,{}/*,{}/*))",
            xpubs[0], xpubs[1], xpubs[2], xpubs[3]
        );
        let info: Value = self.call("getdescriptorinfo", &[descriptor.clone().into()])?;
        let checksum = info["checksum"].as_str().ok_or_else(|| {
            VaultError::operation("getdescriptorinfo", "no checksum in response")
        })?;

        let request = json!([{
            "desc": format!("{}#{}", descriptor, checksum),
            "timestamp": birthdate,
            "range": [range.0, range.1],
            "watchonly": true,
            "label": "covault_vault",
        }]);
        let results: Vec<Value> = self.call("importmulti", &[request])?;
        if !results.iter().all(|r| r["success"].as_bool() == Some(true)) {
            return Err(VaultError::operation(
                "importmulti",
                format!("failed to import descriptor: {:?}", results),
            ));
        }
        Ok(())
    }

    pub fn import_address(&self, address: &Address, label: &str, rescan: bool) -> VaultResult<()> {
        self.call(
            "importaddress",
            &[address.to_string().into(), label.into(), rescan.into()],
        )
    }

    pub fn list_unspent(&self, min_conf: u32, addresses: &[Address]) -> VaultResult<Vec<Utxo>> {
        let addresses: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
        self.call(
            "listunspent",
            &[
                min_conf.into(),
                9_999_999.into(),
                addresses.into(),
                // include_unsafe: also see unconfirmed chains we must react to
                true.into(),
            ],
        )
    }

    pub fn get_raw_transaction(&self, txid: &Txid) -> VaultResult<Transaction> {
        let client = self.client.lock().expect("rpc lock poisoned");
        Ok(client.get_raw_transaction(txid, None)?)
    }

    /// Number of confirmations of a transaction, zero if unknown.
    pub fn get_confirmations(&self, txid: &Txid) -> VaultResult<u32> {
        let result: Value = match self.call(
            "getrawtransaction",
            &[txid.to_string().into(), true.into()],
        ) {
            Ok(value) => value,
            // Not in the index yet means not mined yet
            Err(VaultError::Rpc { .. }) => return Ok(0),
            Err(e) => return Err(e),
        };
        Ok(result["confirmations"].as_u64().unwrap_or(0) as u32)
    }

    /// The txid of the vault (or unvault) output this wallet transaction
    /// spends, read from its first input.
    pub fn spent_prevout_txid(&self, txid: &Txid) -> VaultResult<Txid> {
        let wtx: Value = self.call("gettransaction", &[txid.to_string().into()])?;
        let hex = wtx["hex"].as_str().ok_or_else(|| {
            VaultError::operation("gettransaction", "no hex in response")
        })?;
        let decoded: Value = self.call("decoderawtransaction", &[hex.into()])?;
        let prev_txid = decoded["vin"][0]["txid"].as_str().ok_or_else(|| {
            VaultError::operation("decoderawtransaction", "no vin[0].txid in response")
        })?;
        Txid::from_str(prev_txid)
            .map_err(|e| VaultError::operation("decoderawtransaction", e.to_string()))
    }

    pub fn get_new_address(&self) -> VaultResult<Address> {
        let address: String = self.call("getnewaddress", &[])?;
        Address::from_str(&address)
            .map_err(|_| VaultError::InvalidAddress(address.clone()))?
            .require_network(self.network)
            .map_err(|_| VaultError::InvalidAddress(address))
    }

    pub fn get_raw_mempool(&self) -> VaultResult<Vec<Txid>> {
        let client = self.client.lock().expect("rpc lock poisoned");
        Ok(client.get_raw_mempool()?)
    }

    pub fn send_raw_transaction(&self, tx: &Transaction) -> VaultResult<Txid> {
        let client = self.client.lock().expect("rpc lock poisoned");
        Ok(client.send_raw_transaction(tx)?)
    }

    /// Run a transaction through the node's mempool checks without
    /// broadcasting it; an assembled template failing here is fatal.
    pub fn test_mempool_accept(&self, tx: &Transaction) -> VaultResult<()> {
        let results: Vec<Value> =
            self.call("testmempoolaccept", &[json!([serialize_hex(tx)])])?;
        let entry = results.first().ok_or_else(|| {
            VaultError::operation("testmempoolaccept", "empty response")
        })?;
        if entry["allowed"].as_bool() == Some(true) {
            Ok(())
        } else {
            Err(VaultError::MempoolReject {
                txid: tx.compute_txid(),
                reason: entry["reject-reason"]
                    .as_str()
                    .unwrap_or("unknown")
                    .to_string(),
            })
        }
    }

    pub fn generate_to_address(&self, blocks: u64, address: &Address) -> VaultResult<Vec<String>> {
        self.call(
            "generatetoaddress",
            &[blocks.into(), address.to_string().into()],
        )
    }

    /// Conservative smart-fee estimate, in BTC/kvB.
    pub fn estimate_smart_fee(&self, target_blocks: u16) -> VaultResult<f64> {
        let result: Value = self.call(
            "estimatesmartfee",
            &[target_blocks.into(), "CONSERVATIVE".into()],
        )?;
        result["feerate"].as_f64().ok_or_else(|| {
            VaultError::operation("estimatesmartfee", format!("no estimate: {}", result))
        })
    }

    pub fn dump_privkey(&self, address: &Address) -> VaultResult<String> {
        self.call("dumpprivkey", &[address.to_string().into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Needs a reachable bitcoind; run against regtest only
    fn node_connection_smoke() {
        let client = NodeClient::from_env(Network::Regtest).unwrap();
        let mempool = client.get_raw_mempool().unwrap();
        println!("mempool: {} transactions", mempool.len());
    }
}
