//! # Signature Exchange Client
//!
//! Client to the signature-exchange server: a dumb rendezvous storing one
//! signature per (txid, stakeholder) pair, handing out frozen feerates per
//! (role, txid), and keeping the spend-request/acceptance ledger. The
//! server validates nothing; all checking happens on our side.

use std::collections::BTreeMap;

use bitcoin::{Amount, Txid};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::config::network::REQUEST_TIMEOUT;
use crate::error::{VaultError, VaultResult};
use crate::keys::StakeholderId;
use crate::transactions::{Destinations, TxRole};

const SERVICE: &str = "signature exchange";

#[derive(Deserialize)]
struct SigResponse {
    sig: String,
}

#[derive(Deserialize)]
struct FeerateResponse {
    /// In BTC/kvB, like `estimatesmartfee`
    feerate: f64,
}

#[derive(Deserialize)]
struct AcceptedResponse {
    accepted: Option<bool>,
}

#[derive(Deserialize)]
struct SuccessResponse {
    success: bool,
}

/// The outcome of polling `spend_accepted`: pending until all four
/// stakeholders voted, then the unanimous verdict.
pub type SpendVerdict = Option<bool>;

pub struct SigExchange {
    client: Client,
    base_url: String,
    our_id: StakeholderId,
}

impl SigExchange {
    pub fn new(base_url: impl Into<String>, our_id: StakeholderId) -> VaultResult<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            our_id,
        })
    }

    pub fn our_id(&self) -> StakeholderId {
        self.our_id
    }

    fn protocol_error(status: StatusCode, body: String) -> VaultError {
        VaultError::Protocol {
            service: SERVICE,
            status: status.as_u16(),
            body,
        }
    }

    /// Publish our signature for `txid`.
    pub async fn push_signature(&self, txid: &Txid, sig: &[u8]) -> VaultResult<()> {
        let url = format!("{}/sig/{}/{}", self.base_url, txid, self.our_id);
        let response = self
            .client
            .post(&url)
            .form(&[("sig", hex::encode(sig))])
            .send()
            .await?;
        if response.status() != StatusCode::CREATED {
            let status = response.status();
            return Err(Self::protocol_error(status, response.text().await?));
        }
        Ok(())
    }

    /// Fetch stakeholder `from`'s signature for `txid`; `None` while it has
    /// not been posted yet.
    pub async fn get_signature(
        &self,
        txid: &Txid,
        from: StakeholderId,
    ) -> VaultResult<Option<Vec<u8>>> {
        let url = format!("{}/sig/{}/{}", self.base_url, txid, from);
        let response = self.client.get(&url).send().await?;
        match response.status() {
            StatusCode::OK => {
                let body: SigResponse = response.json().await?;
                let sig = hex::decode(&body.sig).map_err(|e| {
                    VaultError::operation("get_signature", format!("bad hex: {}", e))
                })?;
                Ok(Some(sig))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(Self::protocol_error(status, response.text().await?)),
        }
    }

    /// The frozen feerate for this (role, txid), converted from the wire's
    /// BTC/kvB to integer sat/vB.
    pub async fn get_feerate(&self, role: TxRole, txid: &Txid) -> VaultResult<u64> {
        let url = format!(
            "{}/feerate/{}/{}",
            self.base_url,
            role.feerate_role(),
            txid
        );
        let response = self.client.get(&url).send().await?;
        if response.status() != StatusCode::OK {
            let status = response.status();
            return Err(Self::protocol_error(status, response.text().await?));
        }
        let body: FeerateResponse = response.json().await?;
        let btc_per_kvb = Amount::from_btc(body.feerate)
            .map_err(|e| VaultError::operation("get_feerate", e.to_string()))?;
        Ok(btc_per_kvb.to_sat() / 1000)
    }

    /// Advertise a spend of `vault_txid` to the given destinations; resets
    /// the four acceptance slots server-side.
    pub async fn request_spend(
        &self,
        vault_txid: &Txid,
        destinations: &Destinations,
    ) -> VaultResult<()> {
        let url = format!(
            "{}/requestspend/{}/{}",
            self.base_url,
            vault_txid,
            serde_json::to_string(&destinations.to_wire())?
        );
        self.post_expect_success(&url).await
    }

    pub async fn accept_spend(
        &self,
        vault_txid: &Txid,
        destinations: &Destinations,
    ) -> VaultResult<()> {
        let url = format!(
            "{}/acceptspend/{}/{}/{}",
            self.base_url,
            vault_txid,
            serde_json::to_string(&destinations.to_wire())?,
            self.our_id
        );
        self.post_expect_success(&url).await
    }

    pub async fn refuse_spend(
        &self,
        vault_txid: &Txid,
        destinations: &Destinations,
    ) -> VaultResult<()> {
        let url = format!(
            "{}/refusespend/{}/{}/{}",
            self.base_url,
            vault_txid,
            serde_json::to_string(&destinations.to_wire())?,
            self.our_id
        );
        self.post_expect_success(&url).await
    }

    /// `None` while any acceptance slot is empty, then the verdict: true
    /// iff all four stakeholders accepted.
    pub async fn spend_accepted(&self, vault_txid: &Txid) -> VaultResult<SpendVerdict> {
        let url = format!("{}/spendaccepted/{}", self.base_url, vault_txid);
        let response = self.client.get(&url).send().await?;
        if response.status() != StatusCode::OK {
            let status = response.status();
            return Err(Self::protocol_error(status, response.text().await?));
        }
        let body: AcceptedResponse = response.json().await?;
        Ok(body.accepted)
    }

    /// All outstanding spend requests: vault txid to raw destination map.
    pub async fn get_spend_requests(&self) -> VaultResult<Vec<(Txid, BTreeMap<String, u64>)>> {
        let url = format!("{}/spendrequests", self.base_url);
        let response = self.client.get(&url).send().await?;
        if response.status() != StatusCode::OK {
            let status = response.status();
            return Err(Self::protocol_error(status, response.text().await?));
        }
        let body: BTreeMap<String, BTreeMap<String, u64>> = response.json().await?;
        let mut requests = Vec::with_capacity(body.len());
        for (raw_txid, destinations) in body {
            let txid = raw_txid.parse().map_err(|_| {
                VaultError::operation("get_spend_requests", format!("bad txid {}", raw_txid))
            })?;
            requests.push((txid, destinations));
        }
        Ok(requests)
    }

    async fn post_expect_success(&self, url: &str) -> VaultResult<()> {
        let response = self.client.post(url).send().await?;
        if response.status() != StatusCode::CREATED {
            let status = response.status();
            return Err(Self::protocol_error(status, response.text().await?));
        }
        let body: SuccessResponse = response.json().await?;
        if !body.success {
            return Err(Self::protocol_error(
                StatusCode::CREATED,
                "success=false".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::Amount;

    // The wire feerate is BTC/kvB; we charge fees in sat/vB
    #[test]
    fn feerate_conversion_truncates_to_sat_per_vbyte() {
        let btc_per_kvb = Amount::from_btc(0.00025).unwrap();
        assert_eq!(btc_per_kvb.to_sat() / 1000, 25);
        let low = Amount::from_btc(0.00000999).unwrap();
        assert_eq!(low.to_sat() / 1000, 0);
    }
}
