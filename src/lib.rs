//! # Covault: Multi-Party Bitcoin Vault Library
//!
//! The per-stakeholder control plane of a four-party Bitcoin vault: funds
//! sit under a 4-of-4, leave only through a cooperative unvault with a
//! relative timelock, and can be reverted (cancel) or swept to a deep
//! cold 4-of-4 (emergency) at any moment before the timelock expires.
//!
//! The safety core is the revocation rule: a stakeholder releases its
//! unvault signature only once it holds all four signatures for the
//! cancel and unvault-emergency transactions of that vault.

pub mod config;
pub mod error;
pub mod keys;
pub mod registry;
pub mod revocation;
pub mod scripts;
pub mod services;
pub mod spend;
pub mod transactions;
pub mod wallet;
pub mod watcher;

// Re-export commonly used types
pub use error::{VaultError, VaultResult};
pub use keys::{KeyChain, StakeholderId};
pub use registry::{VaultRecord, VaultRegistry, VaultStage};
pub use services::{CosignClient, NodeClient, SigExchange};
pub use spend::SpendCoordinator;
pub use transactions::{Destinations, TxRole};
pub use wallet::{StakeholderWallet, WalletConfig};
pub use watcher::StopSignal;
