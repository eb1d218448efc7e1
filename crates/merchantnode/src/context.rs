use crate::announce::Announcement;
use crate::chain::ChainView;
use crate::params::NetworkParams;
use crate::ping::Ping;
use crate::signer::MessageHash;
use crate::Error;
use bitcoin::{OutPoint, PublicKey};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, TryLockError};
use std::time::SystemTime;
use strum::Display;
use tracing::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum MessageKind {
    Announce,
    Ping,
}

/// Inventory entry handed to the relay transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inventory {
    pub kind: MessageKind,
    pub hash: MessageHash,
}

/// Outbound transport. Fire and forget.
pub trait Relay {
    fn relay(&self, inv: Inventory);
}

/// Messages already received, keyed by their hash.
pub trait SeenCache<T> {
    fn insert(&self, hash: MessageHash, message: T);
    fn get(&self, hash: &MessageHash) -> Option<T>;
    fn erase(&self, hash: &MessageHash) -> bool;
}

/// Seen cache kept in process memory.
pub struct SeenMap<T> {
    entries: Mutex<HashMap<MessageHash, T>>,
}

impl<T> Default for SeenMap<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> SeenMap<T> {
    fn entries(&self) -> MutexGuard<'_, HashMap<MessageHash, T>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl<T: Clone> SeenCache<T> for SeenMap<T> {
    fn insert(&self, hash: MessageHash, message: T) {
        self.entries().insert(hash, message);
    }

    fn get(&self, hash: &MessageHash) -> Option<T> {
        self.entries().get(hash).cloned()
    }

    fn erase(&self, hash: &MessageHash) -> bool {
        self.entries().remove(hash).is_some()
    }
}

/// The registry owning every known record and the node's sync progress.
pub trait Registry {
    /// Number of known merchantnodes, i.e. the length of one payment cycle.
    fn size(&self) -> usize;
    fn is_blockchain_synced(&self) -> bool;
    fn is_list_synced(&self) -> bool;
    fn is_synced(&self) -> bool;
    fn is_watchdog_active(&self) -> bool;
    /// Signals that list sync made progress so it should not time out yet.
    fn bump_asset_last_time(&self, caller: &str);
    fn seen_announcements(&self) -> &dyn SeenCache<Announcement>;
    fn seen_pings(&self) -> &dyn SeenCache<Ping>;
}

pub trait Clock {
    /// Network-adjusted unix time in seconds.
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        let now = SystemTime::now();
        now.duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_else(|e| {
                panic!(
                    "Current time {:?} is before unix epoch. Something is wrong: {:?}",
                    now, e
                )
            })
            .as_secs() as i64
    }
}

/// The merchantnode this process operates, if any.
pub trait LocalIdentity {
    fn outpoint(&self) -> OutPoint;
    fn service_pubkey(&self) -> PublicKey;
    /// Called when the network announced this node with the current protocol.
    fn manage_state(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMerchantnode {
    pub outpoint: OutPoint,
    pub pubkey: PublicKey,
}

impl LocalIdentity for ActiveMerchantnode {
    fn outpoint(&self) -> OutPoint {
        self.outpoint
    }

    fn service_pubkey(&self) -> PublicKey {
        self.pubkey
    }

    fn manage_state(&self) {
        info!("Merchantnode {} remotely activated", self.outpoint);
    }
}

pub type SharedChain = RwLock<dyn ChainView + Send + Sync>;

/// Everything an entry point needs from the rest of the node.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub params: &'a NetworkParams,
    pub chain: &'a SharedChain,
    pub registry: &'a dyn Registry,
    pub relay: &'a dyn Relay,
    pub clock: &'a dyn Clock,
    pub local: Option<&'a dyn LocalIdentity>,
}

impl<'a> Context<'a> {
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Blocking acquire; used on the message validation path.
    pub(crate) fn read_chain(
        &self,
    ) -> Result<RwLockReadGuard<'a, dyn ChainView + Send + Sync>, Error> {
        self.chain.read().map_err(|_| Error::ChainUnavailable)
    }

    /// Non-blocking acquire; `None` means the caller should try again next cycle.
    pub(crate) fn try_read_chain(
        &self,
    ) -> Option<RwLockReadGuard<'a, dyn ChainView + Send + Sync>> {
        match self.chain.try_read() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(_)) => {
                warn!("chain state lock is poisoned");
                None
            }
        }
    }

    /// Whether `pubkey` is the service key of the merchantnode this node operates.
    pub fn is_own_key(&self, pubkey: &PublicKey) -> bool {
        self.local
            .map(|local| local.service_pubkey() == *pubkey)
            .unwrap_or(false)
    }

    pub fn is_own_merchantnode(&self, outpoint: &OutPoint, pubkey: &PublicKey) -> bool {
        self.local
            .map(|local| local.outpoint() == *outpoint && local.service_pubkey() == *pubkey)
            .unwrap_or(false)
    }

    /// Relays only once the node is fully synced.
    pub(crate) fn relay(&self, kind: MessageKind, hash: MessageHash) {
        if !self.registry.is_synced() {
            debug!("won't relay {kind} {hash} until fully synced");
            return;
        }
        self.relay.relay(Inventory { kind, hash });
    }
}
