mod announce;
mod bitcoin_core;
mod chain;
mod context;
mod merchantnode;
mod ping;
mod signer;

pub mod metrics;
pub mod params;
pub mod testing;

use std::net::SocketAddr;
use thiserror::Error;

pub use bitcoin;
use bitcoin::BlockHash;

pub use announce::Announcement;
pub use bitcoin_core::BitcoinCoreChain;
pub use chain::{
    check_collateral, is_input_associated_with_pubkey, ChainView, Coin, CollateralStatus,
};
pub use context::{
    ActiveMerchantnode, Clock, Context, Inventory, LocalIdentity, MessageKind, Registry, Relay,
    SeenCache, SeenMap, SharedChain, SystemClock,
};
pub use merchantnode::{Merchantnode, MerchantnodeInfo, State};
pub use params::{params_value_parser, NetworkParams};
pub use ping::Ping;
pub use signer::{MessageHash, MessageSigner};

/// Seconds between two non-forced re-evaluations of a record.
pub const CHECK_SECONDS: i64 = 5;
/// A record re-announced within this window keeps its current fields.
pub const MIN_ANNOUNCE_SECONDS: i64 = 5 * 60;
/// Minimum interval between heartbeats.
pub const MIN_PING_SECONDS: i64 = 10 * 60;
pub const EXPIRATION_SECONDS: i64 = 65 * 60;
pub const WATCHDOG_MAX_SECONDS: i64 = 120 * 60;
pub const NEW_START_REQUIRED_SECONDS: i64 = 180 * 60;
/// How far a signature timestamp may run ahead of adjusted network time.
pub const MAX_FUTURE_SECONDS: i64 = 60 * 60;
/// Heartbeats closer than this to the previous one are dropped without penalty.
pub const PING_DEDUP_SECONDS: i64 = MIN_PING_SECONDS - 60;
/// While the list syncs, a ping for a record silent this long bumps the sync timeout.
pub const SYNC_BUMP_PING_SECONDS: i64 = EXPIRATION_SECONDS / 2;
pub const POSE_BAN_MAX_SCORE: i32 = 5;

/// Length of a pay-to-pubkey-hash script.
pub(crate) const P2PKH_SCRIPT_LEN: usize = 25;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid address {0}")]
    InvalidAddress(SocketAddr),
    #[error("Invalid port {0} for this network")]
    InvalidPort(u16),
    #[error("Signature time {0} is too far into the future")]
    SigTimeInFuture(i64),
    #[error("Outdated protocol version {found} (required {required})")]
    ProtocolOutdated { found: i32, required: i32 },
    #[error("Public key script has the wrong size ({0})")]
    InvalidPubKeyScript(usize),
    #[error("Collateral input has a non-empty scriptSig")]
    NonEmptyScriptSig,
    #[error("Bad {0} signature: {1}")]
    BadSignature(MessageKind, String),
    #[error("Collateral output was not found or is spent")]
    CollateralNotFound,
    #[error("Collateral output has an invalid amount")]
    InvalidCollateralAmount,
    #[error("Insufficient collateral confirmations ({have} < {need})")]
    InsufficientConfirmations { have: u32, need: u32 },
    #[error("Collateral transaction is not available")]
    CollateralTxUnavailable,
    #[error("Collateral public key does not match the collateral input")]
    CollateralKeyMismatch,
    #[error("Signature time {sig_time} predates the confirmation block time {block_time}")]
    SigTimeBeforeConfirmation { sig_time: i64, block_time: i64 },
    #[error("Announcement belongs to this node")]
    OwnAnnouncement,
    #[error("Announcement was already applied")]
    DuplicateAnnouncement,
    #[error("Announcement is older than the known one ({sig_time} < {known})")]
    StaleAnnouncement { sig_time: i64, known: i64 },
    #[error("Merchantnode is banned by PoSe")]
    PoseBanned,
    #[error("Unknown block {0}")]
    UnknownBlock(BlockHash),
    #[error("Ping block {0} is too old")]
    PingBlockTooOld(BlockHash),
    #[error("Merchantnode entry not found")]
    UnknownMerchantnode,
    #[error("Merchantnode protocol is outdated")]
    UpdateRequired,
    #[error("Merchantnode is expired, new start is required")]
    NewStartRequired,
    #[error("Ping arrived too early")]
    PingTooEarly,
    #[error("Chain state is unavailable")]
    ChainUnavailable,
    #[error("Chain is too short to reference a ping block")]
    ChainTooShort,
    #[error("Signing failed: {0}")]
    Signing(#[from] bitcoin::secp256k1::Error),
    #[error("Rpc error: {0}")]
    RpcError(#[from] bitcoincore_rpc::Error),
}

impl Error {
    /// Suggested misbehavior score for the peer that sent the offending message.
    /// Acting on it is up to the caller.
    pub fn misbehavior(&self) -> u32 {
        match self {
            Error::SigTimeInFuture(_) => 1,
            Error::InvalidPubKeyScript(_) | Error::NonEmptyScriptSig => 100,
            Error::BadSignature(MessageKind::Announce, _) => 100,
            Error::BadSignature(MessageKind::Ping, _) => 33,
            Error::CollateralKeyMismatch => 33,
            _ => 0,
        }
    }

    /// Transient failures say nothing about the message itself; it may be
    /// re-delivered and evaluated again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::InsufficientConfirmations { .. }
                | Error::CollateralTxUnavailable
                | Error::UnknownBlock(_)
                | Error::ChainUnavailable
                | Error::RpcError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn misbehavior_scores() {
        assert_eq!(Error::SigTimeInFuture(0).misbehavior(), 1);
        assert_eq!(Error::NonEmptyScriptSig.misbehavior(), 100);
        assert_eq!(
            Error::BadSignature(MessageKind::Announce, String::new()).misbehavior(),
            100
        );
        assert_eq!(
            Error::BadSignature(MessageKind::Ping, String::new()).misbehavior(),
            33
        );
        assert_eq!(Error::CollateralKeyMismatch.misbehavior(), 33);
        assert_eq!(Error::PingTooEarly.misbehavior(), 0);
        assert_eq!(Error::UnknownBlock(BlockHash::all_zeros()).misbehavior(), 0);
    }

    #[test]
    fn transient_failures() {
        assert!(Error::InsufficientConfirmations { have: 1, need: 15 }.is_transient());
        assert!(Error::UnknownBlock(BlockHash::all_zeros()).is_transient());
        assert!(Error::ChainUnavailable.is_transient());
        assert!(Error::CollateralTxUnavailable.is_transient());
        assert!(!Error::CollateralNotFound.is_transient());
        assert!(!Error::InvalidCollateralAmount.is_transient());
        assert!(!Error::BadSignature(MessageKind::Announce, String::new()).is_transient());
    }
}
