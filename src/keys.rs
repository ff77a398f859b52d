//! # Stakeholder Key Management
//!
//! Each of the four stakeholders runs one wallet holding its own extended
//! private key and the extended public keys of everyone, so that all four
//! independently derive the same vault pubkey set at every index. The
//! emergency keys are held offline and only their (fixed, underived)
//! public halves appear here.

use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::Network;

use crate::config::watch::{DERIVATION_WINDOW, GAP_LIMIT};
use crate::error::{VaultError, VaultResult};

/// Number of stakeholders in a wallet. Fixed at creation, never negotiated.
pub const STAKEHOLDER_COUNT: usize = 4;

/// A 1-based stakeholder position. Positions 1 and 2 are the traders
/// (authorized spend initiators), 3 and 4 the passive co-owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StakeholderId(u8);

impl StakeholderId {
    pub fn new(position: u8) -> VaultResult<Self> {
        if (1..=STAKEHOLDER_COUNT as u8).contains(&position) {
            Ok(Self(position))
        } else {
            Err(VaultError::operation(
                "stakeholder_id",
                format!("position must be in 1..=4, got {}", position),
            ))
        }
    }

    /// The wire representation (1-based, as the signature exchange expects)
    pub fn number(self) -> u8 {
        self.0
    }

    /// Zero-based index into signature slots and pubkey arrays
    pub fn index(self) -> usize {
        self.0 as usize - 1
    }

    /// Traders are the only positions allowed to initiate a spend
    pub fn is_trader(self) -> bool {
        self.0 <= 2
    }

    /// All four positions, in order
    pub fn all() -> [StakeholderId; STAKEHOLDER_COUNT] {
        [Self(1), Self(2), Self(3), Self(4)]
    }
}

impl std::fmt::Display for StakeholderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The four stakeholders' keychains from the viewpoint of one of them.
///
/// Our own position is detected by matching our master xpub against the
/// configured set, the same way the signature exchange identifies us.
pub struct KeyChain {
    secp: Secp256k1<All>,
    master: Xpriv,
    xpubs: [Xpub; STAKEHOLDER_COUNT],
    our_id: StakeholderId,
    emergency_pubkeys: [PublicKey; STAKEHOLDER_COUNT],
    network: Network,
}

impl KeyChain {
    pub fn new(
        master: Xpriv,
        xpubs: [Xpub; STAKEHOLDER_COUNT],
        emergency_pubkeys: [PublicKey; STAKEHOLDER_COUNT],
        network: Network,
    ) -> VaultResult<Self> {
        let secp = Secp256k1::new();
        let our_xpub = Xpub::from_priv(&secp, &master);
        let position = xpubs
            .iter()
            .position(|xpub| *xpub == our_xpub)
            .ok_or_else(|| {
                VaultError::operation("keychain", "our xpriv does not match any configured xpub")
            })?;
        let our_id = StakeholderId::new(position as u8 + 1)?;

        Ok(Self {
            secp,
            master,
            xpubs,
            our_id,
            emergency_pubkeys,
            network,
        })
    }

    pub fn our_id(&self) -> StakeholderId {
        self.our_id
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn xpubs(&self) -> &[Xpub; STAKEHOLDER_COUNT] {
        &self.xpubs
    }

    /// The fixed offline pubkey set of the emergency deep vault
    pub fn emergency_pubkeys(&self) -> &[PublicKey; STAKEHOLDER_COUNT] {
        &self.emergency_pubkeys
    }

    /// All four stakeholder pubkeys at derivation index `index`, in
    /// stakeholder order. Every wallet derives the identical set.
    pub fn vault_pubkeys(&self, index: u32) -> VaultResult<[PublicKey; STAKEHOLDER_COUNT]> {
        let child = [ChildNumber::from_normal_idx(index)?];
        let mut pubkeys = Vec::with_capacity(STAKEHOLDER_COUNT);
        for xpub in &self.xpubs {
            pubkeys.push(xpub.derive_pub(&self.secp, &child)?.public_key);
        }
        Ok([pubkeys[0], pubkeys[1], pubkeys[2], pubkeys[3]])
    }

    /// Our private key at derivation index `index`
    pub fn our_privkey(&self, index: u32) -> VaultResult<SecretKey> {
        let child = [ChildNumber::from_normal_idx(index)?];
        Ok(self.master.derive_priv(&self.secp, &child)?.private_key)
    }

    /// Our pubkey at derivation index `index`
    pub fn our_pubkey(&self, index: u32) -> VaultResult<PublicKey> {
        Ok(self.vault_pubkeys(index)?[self.our_id.index()])
    }
}

/// Bookkeeping for the rolling range of derivation indexes we watch.
///
/// `[lower, upper)` is imported to the node as watchonly; `gen_next` is the
/// cursor of the deposit-address generator. When either cursor comes within
/// [`GAP_LIMIT`] of `upper` the window must be extended and re-imported.
#[derive(Debug, Clone, Copy)]
pub struct DerivationWindow {
    lower: u32,
    gen_next: u32,
    deposits_seen: u32,
    upper: u32,
}

impl DerivationWindow {
    pub fn new(start: u32) -> Self {
        Self {
            lower: start,
            gen_next: start,
            deposits_seen: start,
            upper: start + DERIVATION_WINDOW,
        }
    }

    /// The currently watched index range, inclusive lower, exclusive upper
    pub fn range(&self) -> (u32, u32) {
        (self.lower, self.upper)
    }

    /// Hand out the next deposit-address index
    pub fn next_gen_index(&mut self) -> u32 {
        let index = self.gen_next;
        self.gen_next += 1;
        index
    }

    /// Record a chain-observed deposit advancing the used range
    pub fn record_deposit(&mut self) {
        self.deposits_seen += 1;
    }

    /// True when either cursor is within the gap limit of the upper bound
    pub fn needs_extension(&self) -> bool {
        self.gen_next.max(self.deposits_seen) + GAP_LIMIT >= self.upper
    }

    /// Grow the window by one batch; returns the new full range to import
    pub fn extend(&mut self) -> (u32, u32) {
        self.upper += DERIVATION_WINDOW;
        self.range()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keychain_for(seed: u8, seeds: [u8; 4]) -> KeyChain {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(Network::Regtest, &[seed; 32]).unwrap();
        let xpubs = seeds.map(|s| {
            let xpriv = Xpriv::new_master(Network::Regtest, &[s; 32]).unwrap();
            Xpub::from_priv(&secp, &xpriv)
        });
        let emergency = [11u8, 12, 13, 14].map(|s| {
            SecretKey::from_slice(&[s; 32])
                .unwrap()
                .public_key(&secp)
        });
        KeyChain::new(master, xpubs, emergency, Network::Regtest).unwrap()
    }

    #[test]
    fn position_is_detected_from_xpub_match() {
        let chain = keychain_for(3, [1, 2, 3, 4]);
        assert_eq!(chain.our_id().number(), 3);
        assert!(!chain.our_id().is_trader());
        assert!(keychain_for(2, [1, 2, 3, 4]).our_id().is_trader());
    }

    #[test]
    fn unknown_xpriv_is_rejected() {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(Network::Regtest, &[9; 32]).unwrap();
        let xpubs = [1u8, 2, 3, 4].map(|s| {
            let xpriv = Xpriv::new_master(Network::Regtest, &[s; 32]).unwrap();
            Xpub::from_priv(&secp, &xpriv)
        });
        let emergency = [11u8, 12, 13, 14].map(|s| {
            SecretKey::from_slice(&[s; 32])
                .unwrap()
                .public_key(&secp)
        });
        assert!(KeyChain::new(master, xpubs, emergency, Network::Regtest).is_err());
    }

    #[test]
    fn all_stakeholders_derive_the_same_pubkey_set() {
        let chains: Vec<KeyChain> = (1..=4).map(|s| keychain_for(s, [1, 2, 3, 4])).collect();
        for index in [0u32, 1, 17] {
            let reference = chains[0].vault_pubkeys(index).unwrap();
            for chain in &chains[1..] {
                assert_eq!(chain.vault_pubkeys(index).unwrap(), reference);
            }
        }
        // And the derivation is actually index-dependent
        assert_ne!(
            chains[0].vault_pubkeys(0).unwrap(),
            chains[0].vault_pubkeys(1).unwrap()
        );
    }

    #[test]
    fn our_privkey_matches_our_derived_pubkey() {
        let secp = Secp256k1::new();
        let chain = keychain_for(1, [1, 2, 3, 4]);
        for index in [0u32, 5] {
            let privkey = chain.our_privkey(index).unwrap();
            assert_eq!(privkey.public_key(&secp), chain.our_pubkey(index).unwrap());
        }
    }

    #[test]
    fn window_extends_at_gap_limit() {
        let mut window = DerivationWindow::new(0);
        assert_eq!(window.range(), (0, DERIVATION_WINDOW));
        assert!(!window.needs_extension());

        for _ in 0..(DERIVATION_WINDOW - GAP_LIMIT) {
            window.next_gen_index();
        }
        assert!(window.needs_extension());
        assert_eq!(window.extend(), (0, 2 * DERIVATION_WINDOW));
        assert!(!window.needs_extension());
    }
}
