use merchantnode::bitcoin::OutPoint;
use merchantnode::{
    Announcement, Context, Inventory, Merchantnode, Ping, Registry, Relay, SeenCache, SeenMap,
    State,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::*;

/// Records tracked by the `watch` command.
#[derive(Default)]
pub struct WatchRegistry {
    size: AtomicUsize,
    blockchain_synced: AtomicBool,
    list_synced: AtomicBool,
    announcements: SeenMap<Announcement>,
    pings: SeenMap<Ping>,
}

impl WatchRegistry {
    pub fn new(blockchain_synced: bool) -> Self {
        Self {
            blockchain_synced: AtomicBool::new(blockchain_synced),
            ..Default::default()
        }
    }

    pub fn set_blockchain_synced(&self, synced: bool) {
        self.blockchain_synced.store(synced, Ordering::SeqCst);
    }

    /// Marks the initial list load as done.
    pub fn finish_list_sync(&self, size: usize) {
        self.size.store(size, Ordering::SeqCst);
        self.list_synced.store(true, Ordering::SeqCst);
    }
}

impl Registry for WatchRegistry {
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
        false
    }

    fn bump_asset_last_time(&self, caller: &str) {
        trace!("{caller} bumped the list sync timeout");
    }

    fn seen_announcements(&self) -> &dyn SeenCache<Announcement> {
        &self.announcements
    }

    fn seen_pings(&self) -> &dyn SeenCache<Ping> {
        &self.pings
    }
}

/// Stands in for the p2p layer: relayed inventory is only logged.
pub struct LogRelay;

impl Relay for LogRelay {
    fn relay(&self, inv: Inventory) {
        info!(kind = %inv.kind, hash = %inv.hash, "Relaying inventory");
    }
}

/// Validates `announcement` and either creates its record or applies it to
/// the known one.
pub fn accept(
    records: &mut BTreeMap<OutPoint, Merchantnode>,
    mut announcement: Announcement,
    ctx: &Context,
) -> Result<(), merchantnode::Error> {
    let hash = announcement.hash();
    if ctx.registry.seen_announcements().get(&hash).is_some() {
        debug!(outpoint = %announcement.outpoint, "Announcement already seen");
        return Ok(());
    }

    announcement.simple_check(ctx)?;

    if let Some(record) = records.get_mut(&announcement.outpoint) {
        ctx.registry
            .seen_announcements()
            .insert(hash, announcement.clone());
        announcement.update(record, ctx)?;
        return Ok(());
    }

    ctx.registry
        .seen_announcements()
        .insert(hash, announcement.clone());
    announcement.check_outpoint(ctx)?;

    let mut record = Merchantnode::from(&announcement);
    record.check(true, ctx);
    info!(
        outpoint = %record.outpoint,
        addr = %record.addr,
        state = %record.state,
        "Added merchantnode"
    );
    announcement.relay(ctx);
    records.insert(record.outpoint, record);
    Ok(())
}

/// Number of records per lifecycle state.
pub fn count_by_state(records: &BTreeMap<OutPoint, Merchantnode>) -> HashMap<State, usize> {
    let mut counts = HashMap::new();
    for record in records.values() {
        *counts.entry(record.state).or_default() += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use merchantnode::testing::{private_key, TestNode};

    #[test]
    fn synced_after_chain_and_list() {
        let registry = WatchRegistry::new(false);
        assert!(!registry.is_synced());

        registry.finish_list_sync(4);
        assert_eq!(registry.size(), 4);
        assert!(!registry.is_synced());

        registry.set_blockchain_synced(true);
        assert!(registry.is_synced());
        assert!(!registry.is_watchdog_active());
    }

    #[test]
    fn accept_adds_each_merchantnode_once() {
        let node = TestNode::new(100);
        let ctx = node.context();
        let announcement = node.announce(&private_key(1), &private_key(2));
        let mut records = BTreeMap::new();

        accept(&mut records, announcement.clone(), &ctx).unwrap();
        accept(&mut records, announcement.clone(), &ctx).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(count_by_state(&records).get(&State::PreEnabled), Some(&1));

        let hash = announcement.hash();
        let relayed = node.relay.relayed();
        assert_eq!(relayed.iter().filter(|inv| inv.hash == hash).count(), 1);
    }

    #[test]
    fn accept_skips_spent_collateral() {
        let node = TestNode::new(100);
        let announcement = node.announce(&private_key(1), &private_key(2));
        node.chain().spend(&announcement.outpoint);
        let mut records = BTreeMap::new();

        assert!(accept(&mut records, announcement, &node.context()).is_err());
        assert!(records.is_empty());
    }

    #[test]
    fn empty_registry_counts_nothing() {
        assert!(count_by_state(&BTreeMap::new()).is_empty());
    }
}
