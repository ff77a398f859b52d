//! # Error Handling
//!
//! Error types used throughout the covault system.
//!
//! Three broad categories exist, and callers are expected to treat them
//! differently: transient network failures (retried by the polling loops,
//! never surfaced), protocol violations (surfaced to the caller of the
//! triggering operation), and invariant violations (fatal, state must not
//! advance).

use bitcoin::{OutPoint, Txid};
use thiserror::Error;

/// Main error type for vault operations
#[derive(Error, Debug)]
pub enum VaultError {
    /// Bitcoin RPC client errors
    #[error("RPC error: {source}")]
    Rpc {
        #[from]
        source: bitcoincore_rpc::Error,
    },

    /// Network/HTTP errors
    #[error("network error: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// BIP32 derivation errors
    #[error("derivation error: {source}")]
    Derivation {
        #[from]
        source: bitcoin::bip32::Error,
    },

    /// secp256k1 key or signature errors
    #[error("secp256k1 error: {source}")]
    Secp {
        #[from]
        source: bitcoin::secp256k1::Error,
    },

    /// An unexpected status from the signature exchange or cosigning server
    #[error("{service} returned HTTP {status}: {body}")]
    Protocol {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// The cosigning server already signed for this unvault output
    #[error("cosigning server refused to sign twice for unvault {0}")]
    CosignerReuse(Txid),

    /// A stakeholder posted a signature that does not verify
    #[error("invalid signature from stakeholder {position} for transaction {txid}")]
    InvalidSignature { position: u8, txid: Txid },

    /// Sighash computation failed
    #[error("sighash error: {0}")]
    Sighash(String),

    /// An assembled transaction was rejected by the node's mempool check
    #[error("transaction {txid} rejected by mempool: {reason}")]
    MempoolReject { txid: Txid, reason: String },

    /// The spend proposal was refused by at least one stakeholder
    #[error("spend of vault {0} was refused")]
    SpendRefused(Txid),

    /// No record for this outpoint in the registry
    #[error("unknown vault {0}")]
    UnknownVault(OutPoint),

    /// Attempted lifecycle transition the state machine forbids
    #[error("vault {outpoint}: illegal transition {from} -> {to}")]
    IllegalTransition {
        outpoint: OutPoint,
        from: &'static str,
        to: &'static str,
    },

    /// Invalid address for this wallet's network
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Generic operational errors
    #[error("operation '{operation}' failed: {message}")]
    Operation { operation: String, message: String },
}

impl VaultError {
    /// Create an operational error with context
    pub fn operation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for vault operations
pub type VaultResult<T> = Result<T, VaultError>;
