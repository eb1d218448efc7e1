//! In-memory collaborators for exercising the protocol without a node.

use crate::announce::Announcement;
use crate::chain::{ChainView, Coin};
use crate::context::{
    ActiveMerchantnode, Clock, Context, Inventory, LocalIdentity, Registry, Relay, SeenCache,
    SeenMap,
};
use crate::merchantnode::Merchantnode;
use crate::params::{NetworkParams, REGTEST};
use crate::ping::Ping;
use crate::Error;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{
    BlockHash, Network, OutPoint, PrivateKey, PublicKey, ScriptBuf, Transaction, TxOut, Txid,
};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock, RwLockWriteGuard};

pub const GENESIS_TIME: i64 = 1_700_000_000;
pub const BLOCK_INTERVAL: i64 = 600;
/// Valid on regtest, off the main network port.
pub const TEST_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 19999));

/// Deterministic key from a fixed secret.
pub fn private_key(n: u8) -> PrivateKey {
    let secret = format!("{:064x}", n);
    PrivateKey::new(SecretKey::from_str(&secret).unwrap(), Network::Regtest)
}

#[derive(Debug, Default, Clone)]
pub struct MemoryChain {
    blocks: Vec<(BlockHash, i64)>,
    coins: HashMap<OutPoint, Coin>,
    transactions: HashMap<Txid, (Transaction, Option<BlockHash>)>,
}

impl MemoryChain {
    pub fn with_height(height: u32) -> Self {
        let mut chain = Self::default();
        chain.advance(height + 1);
        chain
    }

    /// Mines `blocks` empty blocks, one `BLOCK_INTERVAL` apart.
    pub fn advance(&mut self, blocks: u32) {
        for _ in 0..blocks {
            let height = self.blocks.len() as i64;
            let hash = BlockHash::hash(&height.to_le_bytes());
            self.blocks.push((hash, GENESIS_TIME + height * BLOCK_INTERVAL));
        }
    }

    pub fn block_at(&self, height: u32) -> BlockHash {
        self.blocks[height as usize].0
    }

    pub fn time_at(&self, height: u32) -> Option<i64> {
        self.blocks.get(height as usize).map(|(_, time)| *time)
    }

    pub fn tip_time(&self) -> i64 {
        self.blocks.last().map(|(_, time)| *time).unwrap_or(GENESIS_TIME)
    }

    pub fn add_coin(&mut self, outpoint: OutPoint, value: u64, height: u32, script: ScriptBuf) {
        self.coins.insert(
            outpoint,
            Coin {
                value,
                height,
                script_pubkey: script,
            },
        );
    }

    /// Mines a transaction at `height` paying `value` to `pubkey` and returns
    /// its output.
    pub fn add_collateral(&mut self, value: u64, height: u32, pubkey: &PublicKey) -> OutPoint {
        let script_pubkey = ScriptBuf::new_p2pkh(&pubkey.pubkey_hash());
        let tx = Transaction {
            version: 1,
            lock_time: LockTime::from_consensus(self.transactions.len() as u32),
            input: vec![],
            output: vec![TxOut {
                value,
                script_pubkey: script_pubkey.clone(),
            }],
        };
        let txid = tx.txid();
        let block = self.block_at(height);
        self.add_coin(OutPoint::new(txid, 0), value, height, script_pubkey);
        self.transactions.insert(txid, (tx, Some(block)));
        OutPoint::new(txid, 0)
    }

    pub fn spend(&mut self, outpoint: &OutPoint) {
        self.coins.remove(outpoint);
    }

    /// Forgets a transaction while keeping its outputs in the utxo set.
    pub fn prune(&mut self, txid: &Txid) {
        self.transactions.remove(txid);
    }
}

impl ChainView for MemoryChain {
    fn height(&self) -> Result<u32, Error> {
        Ok(self.blocks.len().saturating_sub(1) as u32)
    }

    fn unspent_output(&self, outpoint: &OutPoint) -> Result<Option<Coin>, Error> {
        Ok(self.coins.get(outpoint).cloned())
    }

    fn block_hash(&self, height: u32) -> Result<Option<BlockHash>, Error> {
        Ok(self.blocks.get(height as usize).map(|(hash, _)| *hash))
    }

    fn block_height(&self, hash: &BlockHash) -> Result<Option<u32>, Error> {
        Ok(self
            .blocks
            .iter()
            .position(|(block, _)| block == hash)
            .map(|height| height as u32))
    }

    fn block_time(&self, hash: &BlockHash) -> Result<Option<i64>, Error> {
        Ok(self
            .blocks
            .iter()
            .find(|(block, _)| block == hash)
            .map(|(_, time)| *time))
    }

    fn transaction(&self, txid: &Txid) -> Result<Option<(Transaction, Option<BlockHash>)>, Error> {
        Ok(self.transactions.get(txid).cloned())
    }
}

/// Registry double; starts fully synced with ten known merchantnodes.
pub struct MemoryRegistry {
    size: AtomicUsize,
    blockchain_synced: AtomicBool,
    list_synced: AtomicBool,
    watchdog_active: AtomicBool,
    bumps: AtomicUsize,
    announcements: SeenMap<Announcement>,
    pings: SeenMap<Ping>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self {
            size: AtomicUsize::new(10),
            blockchain_synced: AtomicBool::new(true),
            list_synced: AtomicBool::new(true),
            watchdog_active: AtomicBool::new(false),
            bumps: AtomicUsize::new(0),
            announcements: SeenMap::default(),
            pings: SeenMap::default(),
        }
    }
}

impl MemoryRegistry {
    pub fn set_size(&self, size: usize) {
        self.size.store(size, Ordering::SeqCst);
    }

    pub fn set_list_synced(&self, synced: bool) {
        self.list_synced.store(synced, Ordering::SeqCst);
    }

    pub fn set_watchdog_active(&self, active: bool) {
        self.watchdog_active.store(active, Ordering::SeqCst);
    }

    /// Number of sync timeout bumps received.
    pub fn bumps(&self) -> usize {
        self.bumps.load(Ordering::SeqCst)
    }
}

impl Registry for MemoryRegistry {
    fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    fn is_blockchain_synced(&self) -> bool {
        self.blockchain_synced.load(Ordering::SeqCst)
    }

    fn is_list_synced(&self) -> bool {
        self.list_synced.load(Ordering::SeqCst)
    }

    fn is_synced(&self) -> bool {
        self.is_blockchain_synced() && self.is_list_synced()
    }

    fn is_watchdog_active(&self) -> bool {
        self.watchdog_active.load(Ordering::SeqCst)
    }

    fn bump_asset_last_time(&self, _caller: &str) {
        self.bumps.fetch_add(1, Ordering::SeqCst);
    }

    fn seen_announcements(&self) -> &dyn SeenCache<Announcement> {
        &self.announcements
    }

    fn seen_pings(&self) -> &dyn SeenCache<Ping> {
        &self.pings
    }
}

#[derive(Default)]
pub struct RecordingRelay {
    relayed: Mutex<Vec<Inventory>>,
}

impl RecordingRelay {
    pub fn relayed(&self) -> Vec<Inventory> {
        self.relayed.lock().unwrap().clone()
    }
}

impl Relay for RecordingRelay {
    fn relay(&self, inv: Inventory) {
        self.relayed.lock().unwrap().push(inv);
    }
}

#[derive(Debug, Default)]
pub struct MockClock(AtomicI64);

impl MockClock {
    pub fn new(now: i64) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.0.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// A regtest node with every collaborator held in memory.
pub struct TestNode {
    pub params: NetworkParams,
    pub chain: RwLock<MemoryChain>,
    pub registry: MemoryRegistry,
    pub relay: RecordingRelay,
    pub clock: MockClock,
    pub local: Option<ActiveMerchantnode>,
}

impl TestNode {
    /// Height at which `announce` mines collateral.
    pub const COLLATERAL_HEIGHT: u32 = 10;

    /// Chain of `height` blocks, clock one minute past the tip.
    pub fn new(height: u32) -> Self {
        let chain = MemoryChain::with_height(height);
        let clock = MockClock::new(chain.tip_time() + 60);
        Self {
            params: REGTEST.clone(),
            chain: RwLock::new(chain),
            registry: MemoryRegistry::default(),
            relay: RecordingRelay::default(),
            clock,
            local: None,
        }
    }

    pub fn context(&self) -> Context<'_> {
        Context {
            params: &self.params,
            chain: &self.chain,
            registry: &self.registry,
            relay: &self.relay,
            clock: &self.clock,
            local: self.local.as_ref().map(|local| local as &dyn LocalIdentity),
        }
    }

    pub fn chain(&self) -> RwLockWriteGuard<'_, MemoryChain> {
        self.chain.write().unwrap()
    }

    /// Makes this node the operator of `outpoint`.
    pub fn set_local(&mut self, outpoint: OutPoint, service_key: &PrivateKey) {
        self.local = Some(ActiveMerchantnode {
            outpoint,
            pubkey: service_key.public_key(&Secp256k1::new()),
        });
    }

    /// Mines fresh collateral for `collateral_key` and announces it.
    pub fn announce(&self, collateral_key: &PrivateKey, service_key: &PrivateKey) -> Announcement {
        let pubkey = collateral_key.public_key(&Secp256k1::new());
        let outpoint = self.chain().add_collateral(
            self.params.collateral_amount,
            Self::COLLATERAL_HEIGHT,
            &pubkey,
        );
        Announcement::create(
            outpoint,
            TEST_ADDR,
            collateral_key,
            service_key,
            &self.context(),
        )
        .unwrap()
    }

    /// Announces fresh collateral and builds the record a peer accepting the
    /// announcement would keep.
    pub fn announced_record(
        &self,
        collateral_key: &PrivateKey,
        service_key: &PrivateKey,
    ) -> (Announcement, Merchantnode) {
        let ctx = self.context();
        let mut announcement = self.announce(collateral_key, service_key);
        announcement.simple_check(&ctx).unwrap();
        announcement.check_outpoint(&ctx).unwrap();
        let record = Merchantnode::from(&announcement);
        (announcement, record)
    }
}
