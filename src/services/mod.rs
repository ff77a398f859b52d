//! # External Services
//!
//! Narrow clients for the three collaborators of the custody protocol.
//!
//! ## Components
//!
//! - **RPC Client**: serialized Bitcoin Core RPC access for chain watching
//!   and broadcasting
//! - **Signature Exchange**: the dumb signature/feerate/spend-request
//!   rendezvous shared by the four stakeholders
//! - **Cosign Client**: the single-use cosigning oracle gating the spend
//!   path

pub mod cosign_client;
pub mod rpc_client;
pub mod sig_exchange;

pub use cosign_client::CosignClient;
pub use rpc_client::{NodeClient, Utxo};
pub use sig_exchange::{SigExchange, SpendVerdict};
