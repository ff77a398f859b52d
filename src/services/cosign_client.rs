//! # Cosigning Server Client
//!
//! The cosigning server is a single-use oracle: it signs at most one spend
//! per unvault output and answers 403 forever after, even for different
//! destinations. That refusal is authoritative and surfaced as its own
//! error so callers never retry it.

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, Txid};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::network::REQUEST_TIMEOUT;
use crate::error::{VaultError, VaultResult};
use crate::keys::STAKEHOLDER_COUNT;
use crate::transactions::Destinations;

const SERVICE: &str = "cosigning server";

#[derive(Deserialize)]
struct PubkeyResponse {
    pubkey: String,
}

#[derive(Deserialize)]
struct SigResponse {
    sig: String,
}

#[derive(Serialize)]
struct SignRequest {
    txid: String,
    pubkeys: Vec<String>,
    addresses: std::collections::BTreeMap<String, u64>,
    prev_value: u64,
}

pub struct CosignClient {
    client: Client,
    base_url: String,
}

impl CosignClient {
    pub fn new(base_url: impl Into<String>) -> VaultResult<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// The server's fixed pubkey, fetched once at wallet startup.
    pub async fn get_pubkey(&self) -> VaultResult<PublicKey> {
        let url = format!("{}/getpubkey", self.base_url);
        let response = self.client.get(&url).send().await?;
        if response.status() != StatusCode::OK {
            let status = response.status();
            return Err(VaultError::Protocol {
                service: SERVICE,
                status: status.as_u16(),
                body: response.text().await?,
            });
        }
        let body: PubkeyResponse = response.json().await?;
        let bytes = hex::decode(&body.pubkey)
            .map_err(|e| VaultError::operation("get_pubkey", format!("bad hex: {}", e)))?;
        Ok(PublicKey::from_slice(&bytes)?)
    }

    /// Request the one cosignature for a spend of `unvault_txid`.
    pub async fn get_cosignature(
        &self,
        unvault_txid: &Txid,
        pubkeys: &[PublicKey; STAKEHOLDER_COUNT],
        destinations: &Destinations,
        prev_value: Amount,
    ) -> VaultResult<Vec<u8>> {
        let url = format!("{}/sign", self.base_url);
        let request = SignRequest {
            txid: unvault_txid.to_string(),
            pubkeys: pubkeys.iter().map(|pk| pk.to_string()).collect(),
            addresses: destinations.to_wire(),
            prev_value: prev_value.to_sat(),
        };
        let response = self.client.post(&url).json(&request).send().await?;
        match response.status() {
            StatusCode::OK => {
                let body: SigResponse = response.json().await?;
                hex::decode(&body.sig).map_err(|e| {
                    VaultError::operation("get_cosignature", format!("bad hex: {}", e))
                })
            }
            StatusCode::FORBIDDEN => Err(VaultError::CosignerReuse(*unvault_txid)),
            status => Err(VaultError::Protocol {
                service: SERVICE,
                status: status.as_u16(),
                body: response.text().await?,
            }),
        }
    }
}
