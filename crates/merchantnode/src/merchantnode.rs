use crate::announce::Announcement;
use crate::chain::{check_collateral, CollateralStatus};
use crate::context::Context;
use crate::metrics::{POSE_BANS, STATE_TRANSITIONS};
use crate::params::NetworkParams;
use crate::ping::Ping;
use crate::{
    CHECK_SECONDS, EXPIRATION_SECONDS, MIN_PING_SECONDS, NEW_START_REQUIRED_SECONDS,
    POSE_BAN_MAX_SCORE, WATCHDOG_MAX_SECONDS,
};
use bitcoin::consensus::Encodable;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{BlockHash, OutPoint, PublicKey};
use num::BigUint;
use serde_derive::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use strum::{Display, EnumString};
use tracing::*;

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    PreEnabled,
    #[default]
    Enabled,
    Expired,
    OutpointSpent,
    UpdateRequired,
    WatchdogExpired,
    NewStartRequired,
    PoseBan,
}

/// Display snapshot of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerchantnodeInfo {
    pub state: State,
    pub protocol_version: i32,
    pub sig_time: i64,
    pub outpoint: OutPoint,
    pub addr: SocketAddr,
    pub pubkey_collateral: PublicKey,
    pub pubkey_merchantnode: PublicKey,
    pub last_watchdog_vote: i64,
    pub last_ping_time: Option<i64>,
}

/// Local view of one merchantnode, keyed by its collateral outpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merchantnode {
    pub outpoint: OutPoint,
    pub addr: SocketAddr,
    pub pubkey_collateral: PublicKey,
    pub pubkey_merchantnode: PublicKey,
    pub protocol_version: i32,
    pub sig_time: i64,
    pub state: State,
    pub last_ping: Option<Ping>,
    pub signature: Vec<u8>,
    /// Block at which the collateral reached the required confirmations
    pub collateral_min_conf_block_hash: Option<BlockHash>,
    pub pose_ban_score: i32,
    /// Height until which a PoSe ban holds
    pub pose_ban_height: u32,
    pub last_watchdog_vote: i64,
    pub last_checked: i64,
    /// Skips every chain lookup in `check`.
    pub unit_test: bool,
}

/// Inputs of one lifecycle evaluation, captured before any guard runs.
#[derive(Debug, Clone, Copy)]
struct Snapshot {
    state: State,
    now: i64,
    sig_time: i64,
    last_ping_time: Option<i64>,
    last_watchdog_vote: i64,
    pose_ban_score: i32,
    protocol_version: i32,
    required_version: i32,
    own: bool,
    list_synced: bool,
    watchdog_active: bool,
}

impl Snapshot {
    fn pinged_within(&self, seconds: i64) -> bool {
        self.last_ping_time
            .map(|time| self.now - time < seconds)
            .unwrap_or(false)
    }

    /// List sync still running and no recent heartbeat: give the record a
    /// chance to receive one before expiring it.
    fn waiting_for_ping(&self) -> bool {
        !self.list_synced && !self.pinged_within(MIN_PING_SECONDS)
    }

    fn expiry_applies(&self) -> bool {
        !self.waiting_for_ping() || self.own
    }
}

type Guard = fn(&Snapshot) -> Option<State>;

/// Evaluated in order, the first guard that yields a state wins.
const GUARDS: &[Guard] = &[
    |s: &Snapshot| (s.pose_ban_score >= POSE_BAN_MAX_SCORE).then_some(State::PoseBan),
    |s: &Snapshot| {
        (s.own && s.protocol_version < s.required_version).then_some(State::UpdateRequired)
    },
    |s: &Snapshot| {
        let held = matches!(
            s.state,
            State::Expired | State::WatchdogExpired | State::NewStartRequired
        );
        (s.waiting_for_ping() && !s.own && held).then_some(s.state)
    },
    |s: &Snapshot| {
        (s.expiry_applies() && !s.pinged_within(NEW_START_REQUIRED_SECONDS))
            .then_some(State::NewStartRequired)
    },
    |s: &Snapshot| {
        let expired = s.watchdog_active && s.now - s.last_watchdog_vote > WATCHDOG_MAX_SECONDS;
        (s.expiry_applies() && expired).then_some(State::WatchdogExpired)
    },
    |s: &Snapshot| {
        (s.expiry_applies() && !s.pinged_within(EXPIRATION_SECONDS)).then_some(State::Expired)
    },
    |s: &Snapshot| {
        let lived = s.last_ping_time.map(|time| time - s.sig_time).unwrap_or(0);
        (lived < MIN_PING_SECONDS).then_some(State::PreEnabled)
    },
];

fn evaluate(snapshot: &Snapshot) -> State {
    GUARDS
        .iter()
        .find_map(|guard| guard(snapshot))
        .unwrap_or(State::Enabled)
}

impl Merchantnode {
    pub fn new(
        addr: SocketAddr,
        outpoint: OutPoint,
        pubkey_collateral: PublicKey,
        pubkey_merchantnode: PublicKey,
        protocol_version: i32,
        now: i64,
    ) -> Self {
        Self {
            outpoint,
            addr,
            pubkey_collateral,
            pubkey_merchantnode,
            protocol_version,
            sig_time: now,
            state: State::Enabled,
            last_ping: None,
            signature: Vec::new(),
            collateral_min_conf_block_hash: None,
            pose_ban_score: 0,
            pose_ban_height: 0,
            last_watchdog_vote: 0,
            last_checked: 0,
            unit_test: false,
        }
    }

    /// Recomputes `state` from chain height, ban score, heartbeat recency and
    /// sync status. Without `force` this is a no-op within `CHECK_SECONDS` of
    /// the previous run.
    pub fn check(&mut self, force: bool, ctx: &Context) {
        let now = ctx.now();
        if !force && now - self.last_checked < CHECK_SECONDS {
            return;
        }
        self.last_checked = now;

        debug!(outpoint = %self.outpoint, state = %self.state, "Checking merchantnode");

        if self.is_outpoint_spent() {
            return;
        }

        let mut height = 0;
        if !self.unit_test {
            let Some(chain) = ctx.try_read_chain() else {
                return;
            };
            match check_collateral(&*chain, &self.outpoint, ctx.params.collateral_amount) {
                Ok(CollateralStatus::UtxoNotFound) => {
                    debug!(outpoint = %self.outpoint, "Failed to find merchantnode utxo");
                    self.set_state(State::OutpointSpent);
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(outpoint = %self.outpoint, "Failed to check collateral: {err}");
                    return;
                }
            }
            height = match chain.height() {
                Ok(height) => height,
                Err(err) => {
                    warn!("Failed to read chain height: {err}");
                    return;
                }
            };
        }

        if self.is_pose_banned() {
            if height < self.pose_ban_height {
                return;
            }
            info!(outpoint = %self.outpoint, "Merchantnode is unbanned and back in list now");
            self.decrease_pose_ban_score();
        }

        let snapshot = Snapshot {
            state: self.state,
            now,
            sig_time: self.sig_time,
            last_ping_time: self.last_ping.as_ref().map(|ping| ping.sig_time),
            last_watchdog_vote: self.last_watchdog_vote,
            pose_ban_score: self.pose_ban_score,
            protocol_version: self.protocol_version,
            required_version: ctx.params.protocol_version,
            own: ctx.is_own_key(&self.pubkey_merchantnode),
            list_synced: ctx.registry.is_list_synced(),
            watchdog_active: ctx.registry.is_synced() && ctx.registry.is_watchdog_active(),
        };
        trace!(?snapshot, "Evaluating lifecycle");

        let next = evaluate(&snapshot);
        if next == State::PoseBan {
            // one full payment cycle
            self.pose_ban_height = height + ctx.registry.size() as u32;
            POSE_BANS.inc();
            info!(
                outpoint = %self.outpoint,
                "Merchantnode is banned till block {}",
                self.pose_ban_height
            );
        }
        self.set_state(next);
    }

    fn set_state(&mut self, state: State) {
        if self.state == state {
            return;
        }
        info!(outpoint = %self.outpoint, from = %self.state, to = %state, "Merchantnode changed state");
        STATE_TRANSITIONS
            .with_label_values(&[&state.to_string()])
            .inc();
        self.state = state;
    }

    /// Deterministic election score of this merchantnode for `block_hash`.
    pub fn score(&self, block_hash: &BlockHash) -> BigUint {
        let mut engine = sha256d::Hash::engine();
        self.outpoint
            .consensus_encode(&mut engine)
            .expect("engines don't error");
        self.collateral_min_conf_block_hash
            .unwrap_or_else(BlockHash::all_zeros)
            .consensus_encode(&mut engine)
            .expect("engines don't error");
        block_hash
            .consensus_encode(&mut engine)
            .expect("engines don't error");
        BigUint::from_bytes_le(sha256d::Hash::from_engine(engine).as_byte_array())
    }

    /// Applies a newer announcement of this merchantnode. Returns false when
    /// the record was left untouched or must not be relayed.
    pub fn update_from_new_broadcast(
        &mut self,
        announcement: &Announcement,
        ctx: &Context,
    ) -> bool {
        if announcement.sig_time <= self.sig_time && !announcement.recovery {
            return false;
        }

        self.pubkey_merchantnode = announcement.pubkey_merchantnode;
        self.sig_time = announcement.sig_time;
        self.signature = announcement.signature.clone();
        self.protocol_version = announcement.protocol_version;
        self.addr = announcement.addr;
        self.pose_ban_score = 0;
        self.pose_ban_height = 0;
        self.last_checked = 0;

        match &announcement.last_ping {
            None => self.last_ping = None,
            Some(ping) => {
                if ping.check_and_update(Some(&mut *self), true, ctx).is_ok() {
                    self.last_ping = Some(ping.clone());
                    ctx.registry.seen_pings().insert(ping.hash(), ping.clone());
                }
            }
        }

        if let Some(local) = ctx.local {
            if local.service_pubkey() == self.pubkey_merchantnode {
                self.pose_ban_score = -POSE_BAN_MAX_SCORE;
                if self.protocol_version != ctx.params.protocol_version {
                    warn!(
                        "Wrong protocol version, re-activate your merchantnode: announced {} local {}",
                        self.protocol_version, ctx.params.protocol_version
                    );
                    return false;
                }
                local.manage_state();
            }
        }
        true
    }

    pub fn increase_pose_ban_score(&mut self) {
        if self.pose_ban_score < POSE_BAN_MAX_SCORE {
            self.pose_ban_score += 1;
        }
    }

    pub fn decrease_pose_ban_score(&mut self) {
        if self.pose_ban_score > -POSE_BAN_MAX_SCORE {
            self.pose_ban_score -= 1;
        }
    }

    pub fn pose_ban(&mut self) {
        self.pose_ban_score = POSE_BAN_MAX_SCORE;
    }

    /// Whether the last heartbeat is less than `seconds` older than `at`.
    pub fn is_pinged_within(&self, seconds: i64, at: i64) -> bool {
        match &self.last_ping {
            Some(ping) => at - ping.sig_time < seconds,
            None => false,
        }
    }

    pub fn is_broadcasted_within(&self, seconds: i64, now: i64) -> bool {
        now - self.sig_time < seconds
    }

    /// `None` records a vote at the current time.
    pub fn update_watchdog_vote_time(&mut self, vote_time: Option<i64>, ctx: &Context) {
        self.last_watchdog_vote = vote_time.unwrap_or_else(|| ctx.now());
    }

    /// Any address is fine on regtest; elsewhere only routable IPv4.
    pub fn is_valid_net_addr(addr: &SocketAddr, params: &NetworkParams) -> bool {
        if params.network == bitcoin::Network::Regtest {
            return true;
        }
        match addr.ip() {
            IpAddr::V4(ip) => is_routable(&ip),
            IpAddr::V6(_) => false,
        }
    }

    pub fn info(&self) -> MerchantnodeInfo {
        MerchantnodeInfo {
            state: self.state,
            protocol_version: self.protocol_version,
            sig_time: self.sig_time,
            outpoint: self.outpoint,
            addr: self.addr,
            pubkey_collateral: self.pubkey_collateral,
            pubkey_merchantnode: self.pubkey_merchantnode,
            last_watchdog_vote: self.last_watchdog_vote,
            last_ping_time: self.last_ping.as_ref().map(|ping| ping.sig_time),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state == State::Enabled
    }

    pub fn is_pre_enabled(&self) -> bool {
        self.state == State::PreEnabled
    }

    pub fn is_pose_banned(&self) -> bool {
        self.state == State::PoseBan
    }

    pub fn is_expired(&self) -> bool {
        self.state == State::Expired
    }

    pub fn is_outpoint_spent(&self) -> bool {
        self.state == State::OutpointSpent
    }

    pub fn is_update_required(&self) -> bool {
        self.state == State::UpdateRequired
    }

    pub fn is_watchdog_expired(&self) -> bool {
        self.state == State::WatchdogExpired
    }

    pub fn is_new_start_required(&self) -> bool {
        self.state == State::NewStartRequired
    }
}

impl From<&Announcement> for Merchantnode {
    fn from(announcement: &Announcement) -> Self {
        Self {
            outpoint: announcement.outpoint,
            addr: announcement.addr,
            pubkey_collateral: announcement.pubkey_collateral,
            pubkey_merchantnode: announcement.pubkey_merchantnode,
            protocol_version: announcement.protocol_version,
            sig_time: announcement.sig_time,
            state: announcement.state,
            last_ping: announcement.last_ping.clone(),
            signature: announcement.signature.clone(),
            collateral_min_conf_block_hash: announcement.collateral_min_conf_block_hash,
            pose_ban_score: 0,
            pose_ban_height: 0,
            last_watchdog_vote: announcement.sig_time,
            last_checked: 0,
            unit_test: false,
        }
    }
}

fn is_routable(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    let shared = a == 100 && (b & 0xc0) == 64;
    let benchmarking = a == 198 && (b & 0xfe) == 18;
    let reserved = a >= 240;

    !(ip.is_unspecified()
        || ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || shared
        || benchmarking
        || reserved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{private_key, TestNode};
    use std::str::FromStr;

    fn snapshot() -> Snapshot {
        Snapshot {
            state: State::Enabled,
            now: 100_000,
            sig_time: 90_000,
            last_ping_time: Some(99_000),
            last_watchdog_vote: 99_000,
            pose_ban_score: 0,
            protocol_version: 70210,
            required_version: 70210,
            own: false,
            list_synced: true,
            watchdog_active: false,
        }
    }

    #[test]
    fn guards_resolve_in_order() {
        assert_eq!(evaluate(&snapshot()), State::Enabled);

        let fresh = Snapshot {
            last_ping_time: Some(90_000 + MIN_PING_SECONDS - 1),
            now: 90_000 + MIN_PING_SECONDS,
            ..snapshot()
        };
        assert_eq!(evaluate(&fresh), State::PreEnabled);

        let silent = Snapshot {
            last_ping_time: Some(100_000 - EXPIRATION_SECONDS),
            ..snapshot()
        };
        assert_eq!(evaluate(&silent), State::Expired);

        let gone = Snapshot {
            last_ping_time: None,
            ..snapshot()
        };
        assert_eq!(evaluate(&gone), State::NewStartRequired);

        let watchdog = Snapshot {
            watchdog_active: true,
            last_watchdog_vote: 100_000 - WATCHDOG_MAX_SECONDS - 1,
            ..snapshot()
        };
        assert_eq!(evaluate(&watchdog), State::WatchdogExpired);

        let banned = Snapshot {
            pose_ban_score: POSE_BAN_MAX_SCORE,
            ..gone
        };
        assert_eq!(evaluate(&banned), State::PoseBan);
    }

    #[test]
    fn update_required_only_for_own_node() {
        let outdated = Snapshot {
            protocol_version: 70209,
            ..snapshot()
        };
        assert_eq!(evaluate(&outdated), State::Enabled);
        assert_eq!(
            evaluate(&Snapshot {
                own: true,
                ..outdated
            }),
            State::UpdateRequired
        );
    }

    #[test]
    fn waiting_for_ping_holds_expired_states() {
        let syncing = Snapshot {
            list_synced: false,
            sig_time: 80_000,
            last_ping_time: Some(100_000 - NEW_START_REQUIRED_SECONDS),
            ..snapshot()
        };
        assert_eq!(
            evaluate(&Snapshot {
                state: State::Expired,
                ..syncing
            }),
            State::Expired
        );
        // newly seen records get a grace window
        assert_eq!(evaluate(&syncing), State::Enabled);
        // own node is never held
        assert_eq!(
            evaluate(&Snapshot {
                own: true,
                ..syncing
            }),
            State::NewStartRequired
        );
    }

    #[test]
    fn state_strings() {
        assert_eq!(State::PreEnabled.to_string(), "PRE_ENABLED");
        assert_eq!(State::PoseBan.to_string(), "POSE_BAN");
        assert_eq!(
            State::from_str("NEW_START_REQUIRED").unwrap(),
            State::NewStartRequired
        );
        assert!(State::from_str("UNKNOWN").is_err());
    }

    #[test]
    fn pose_score_is_clamped() {
        let node = TestNode::new(100);
        let (_, mut record) = node.announced_record(&private_key(1), &private_key(2));

        for _ in 0..10 {
            record.increase_pose_ban_score();
        }
        assert_eq!(record.pose_ban_score, POSE_BAN_MAX_SCORE);
        for _ in 0..20 {
            record.decrease_pose_ban_score();
        }
        assert_eq!(record.pose_ban_score, -POSE_BAN_MAX_SCORE);
        record.pose_ban();
        assert_eq!(record.pose_ban_score, POSE_BAN_MAX_SCORE);
    }

    #[test]
    fn check_is_rate_limited() {
        let node = TestNode::new(100);
        let (_, mut record) = node.announced_record(&private_key(1), &private_key(2));
        let ctx = node.context();

        record.check(true, &ctx);
        assert_eq!(record.state, State::PreEnabled);

        node.chain().spend(&record.outpoint);
        record.check(false, &ctx);
        assert_eq!(record.state, State::PreEnabled);

        node.clock.advance(CHECK_SECONDS);
        record.check(false, &ctx);
        assert_eq!(record.state, State::OutpointSpent);
    }

    #[test]
    fn unit_test_mode_skips_chain() {
        let node = TestNode::new(100);
        let (_, mut record) = node.announced_record(&private_key(1), &private_key(2));
        record.unit_test = true;
        node.chain().spend(&record.outpoint);

        record.check(true, &node.context());
        assert_eq!(record.state, State::PreEnabled);
    }

    #[test]
    fn deferred_while_chain_is_locked() {
        let node = TestNode::new(100);
        let (_, mut record) = node.announced_record(&private_key(1), &private_key(2));
        let ctx = node.context();

        let guard = node.chain();
        record.check(true, &ctx);
        assert_eq!(record.state, State::Enabled);
        drop(guard);

        record.check(true, &ctx);
        assert_eq!(record.state, State::PreEnabled);
    }

    #[test]
    fn score_is_deterministic() {
        let node = TestNode::new(100);
        let (_, record) = node.announced_record(&private_key(1), &private_key(2));
        let block = BlockHash::from_byte_array([1; 32]);

        assert_eq!(record.score(&block), record.score(&block));
        assert_ne!(
            record.score(&block),
            record.score(&BlockHash::from_byte_array([2; 32]))
        );

        let mut other = record.clone();
        other.collateral_min_conf_block_hash = None;
        assert_ne!(record.score(&block), other.score(&block));
    }

    #[test]
    fn net_addr_validity() {
        let main = crate::params::MAIN.clone();
        let regtest = crate::params::REGTEST.clone();
        let public: SocketAddr = "8.8.8.8:62583".parse().unwrap();
        let private: SocketAddr = "192.168.1.1:62583".parse().unwrap();
        let shared: SocketAddr = "100.64.0.1:62583".parse().unwrap();
        let v6: SocketAddr = "[2001:4860::8888]:62583".parse().unwrap();

        assert!(Merchantnode::is_valid_net_addr(&public, &main));
        assert!(!Merchantnode::is_valid_net_addr(&private, &main));
        assert!(!Merchantnode::is_valid_net_addr(&shared, &main));
        assert!(!Merchantnode::is_valid_net_addr(&v6, &main));
        assert!(Merchantnode::is_valid_net_addr(&private, &regtest));
    }

    #[test]
    fn watchdog_vote_defaults_to_now() {
        let node = TestNode::new(100);
        let (_, mut record) = node.announced_record(&private_key(1), &private_key(2));
        let ctx = node.context();

        record.update_watchdog_vote_time(Some(42), &ctx);
        assert_eq!(record.last_watchdog_vote, 42);
        record.update_watchdog_vote_time(None, &ctx);
        assert_eq!(record.last_watchdog_vote, ctx.now());
    }

    #[test]
    fn info_snapshot() {
        let node = TestNode::new(100);
        let (announcement, record) = node.announced_record(&private_key(1), &private_key(2));
        let info = record.info();

        assert_eq!(info.outpoint, announcement.outpoint);
        assert_eq!(info.last_ping_time, Some(announcement.sig_time));
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["state"], "ENABLED");
    }
}
