//! The signing-wallet seam.
//!
//! Everything the engine needs from the wallet goes through the [`Wallet`]
//! trait: ticket ownership lookups, raw transaction fetches, address
//! validation, and message signing. The shipped implementation talks gRPC
//! over mutual TLS (see [`remote`]); tests substitute their own.

mod remote;

pub use remote::RemoteWallet;

use async_trait::async_trait;
use thiserror::Error;

use crate::chain::TicketHash;

/// Errors from the wallet RPC.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalletError {
    /// TLS material could not be loaded.
    #[error("wallet credentials: {0}")]
    Credentials(String),

    /// The wallet endpoint could not be reached.
    #[error("wallet transport: {0}")]
    Transport(String),

    /// An RPC completed with an error status.
    #[error("wallet rpc {method}: {message}")]
    Rpc {
        /// Method that failed.
        method: &'static str,
        /// Status message.
        message: String,
    },

    /// A signing reply reported a per-message failure.
    #[error("signature failed at index {index}: {message}")]
    Signature {
        /// Index of the failed message.
        index: usize,
        /// Wallet-reported error.
        message: String,
    },
}

/// A ticket the wallet controls, paired with the address that can sign for
/// it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketAddress {
    /// The ticket hash.
    pub ticket: TicketHash,
    /// Payout address able to sign vote messages for the ticket.
    pub address: String,
}

/// Address validation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressInfo {
    /// Whether the wallet considers the address valid.
    pub is_valid: bool,
    /// Account that owns the address. Imported extended-public-key accounts
    /// report `u32::MAX >> 1` or above and cannot sign.
    pub account_number: u32,
}

impl AddressInfo {
    /// First account number used for imported extended-public-key accounts.
    pub const IMPORTED_ACCOUNT_FLOOR: u32 = (1 << 31) - 1;

    /// Whether the address belongs to an imported account the wallet cannot
    /// sign for.
    #[must_use]
    pub const fn is_imported(&self) -> bool {
        self.account_number >= Self::IMPORTED_ACCOUNT_FLOOR
    }
}

/// A message-signing request: sign `message` with the key behind `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    /// Address whose key signs.
    pub address: String,
    /// Message to sign.
    pub message: String,
}

/// Operations the engine needs from the signing wallet.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Verifies wallet connectivity and credentials; returns the wallet's
    /// current block height.
    async fn current_height(&self) -> Result<u32, WalletError>;

    /// Returns the wallet's best block height.
    async fn best_block(&self) -> Result<u32, WalletError>;

    /// Verifies that `passphrase` unlocks `account`. The engine calls this
    /// before building ballots so signing cannot fail later on a bad
    /// passphrase.
    async fn verify_passphrase(&self, account: u32, passphrase: &[u8]) -> Result<(), WalletError>;

    /// Filters `tickets` down to the ones this wallet holds the voting
    /// rights for, with their payout addresses.
    async fn committed_tickets(
        &self,
        tickets: &[TicketHash],
    ) -> Result<Vec<TicketAddress>, WalletError>;

    /// Fetches the raw serialized transaction for a ticket purchase.
    async fn transaction(&self, hash: &TicketHash) -> Result<Vec<u8>, WalletError>;

    /// Validates an address and reports the owning account.
    async fn validate_address(&self, address: &str) -> Result<AddressInfo, WalletError>;

    /// Signs a batch of messages. The reply has one signature per request,
    /// in order.
    async fn sign_messages(
        &self,
        passphrase: &[u8],
        requests: &[SignRequest],
    ) -> Result<Vec<Vec<u8>>, WalletError>;
}
