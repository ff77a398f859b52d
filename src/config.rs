//! # Configuration Constants
//!
//! Protocol and connection constants used throughout the covault system.

/// Network and RPC configuration
pub mod network {
    use std::time::Duration;

    /// Default bitcoind RPC host
    pub const DEFAULT_RPC_HOST: &str = "127.0.0.1";

    /// Default bitcoind RPC port (regtest)
    pub const DEFAULT_RPC_PORT: &str = "18443";

    /// Default RPC username
    pub const DEFAULT_RPC_USER: &str = "user";

    /// Default RPC password
    pub const DEFAULT_RPC_PASSWORD: &str = "password";

    /// Default wallet name for watchonly imports
    pub const DEFAULT_WALLET_NAME: &str = "covault_watchonly";

    /// Request timeout for the signature-exchange and cosigning servers
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Script timelock parameters.
///
/// These are consensus-visible: changing either changes every derived
/// address, so they are fixed for the lifetime of a wallet.
pub mod timelock {
    /// Relative timelock (blocks) on the unvault output's cosigner branch.
    /// A spend transaction must set this as its input sequence.
    pub const UNVAULT_CSV: u16 = 6;

    /// Relative timelock (blocks) on the emergency deep-vault script.
    /// 31 days of 144 blocks-per-day, the "one month" cold delay.
    pub const EMERGENCY_CSV: u16 = 4464;
}

/// Chain watching and signature polling parameters
pub mod watch {
    use std::time::Duration;

    /// Interval between two chain polls for deposits / unvaults / emergency
    pub const FUNDS_POLL_INTERVAL: Duration = Duration::from_secs(5);

    /// Interval between two polls of the spend-request ledger
    pub const SPEND_REQUESTS_POLL_INTERVAL: Duration = Duration::from_secs(3);

    /// Starting interval when polling the signature exchange for a slot
    pub const SIG_POLL_INTERVAL: Duration = Duration::from_secs(3);

    /// Upper bound for the exponential signature-poll backoff
    pub const SIG_POLL_MAX_INTERVAL: Duration = Duration::from_secs(30);

    /// Interval between two confirmation checks while waiting out the
    /// unvault timelock
    pub const CONFIRMATION_POLL_INTERVAL: Duration = Duration::from_secs(5);

    /// How many derivation indexes are imported as watchonly in one batch
    pub const DERIVATION_WINDOW: u32 = 500;

    /// When fewer than this many unused indexes remain below the window's
    /// upper bound, the window is extended and re-imported
    pub const GAP_LIMIT: u32 = 20;

    /// Confirmations required on the unvault before the spend is valid
    pub const SPEND_CONFIRMATIONS: u32 = 6;
}

/// Environment variable names
pub mod env {
    /// RPC URL override
    pub const RPC_URL: &str = "RPC_URL";

    /// RPC port override
    pub const RPC_PORT: &str = "RPC_PORT";

    /// RPC username override
    pub const RPC_USER: &str = "RPC_USER";

    /// RPC password override
    pub const RPC_PASSWORD: &str = "RPC_PASSWORD";

    /// Wallet name override
    pub const RPC_WALLET: &str = "RPC_WALLET";
}
