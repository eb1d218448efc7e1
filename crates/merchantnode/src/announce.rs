use crate::chain::{check_collateral, is_input_associated_with_pubkey, ChainView, CollateralStatus};
use crate::context::{Clock, Context, MessageKind};
use crate::merchantnode::{Merchantnode, State};
use crate::metrics;
use crate::ping::Ping;
use crate::signer::{MessageHash, MessageSigner};
use crate::{Error, MAX_FUTURE_SECONDS, MIN_ANNOUNCE_SECONDS, P2PKH_SCRIPT_LEN};
use bitcoin::consensus::Encodable;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{BlockHash, OutPoint, PrivateKey, PublicKey, ScriptBuf};
use serde_derive::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::*;

/// Signed claim binding a collateral outpoint to a service key and address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub outpoint: OutPoint,
    /// Unlock script of the collateral input; must stay empty.
    #[serde(default)]
    pub script_sig: ScriptBuf,
    pub addr: SocketAddr,
    pub pubkey_collateral: PublicKey,
    pub pubkey_merchantnode: PublicKey,
    pub protocol_version: i32,
    pub sig_time: i64,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
    pub last_ping: Option<Ping>,
    /// Allows re-applying an announcement with an unchanged `sig_time`.
    #[serde(default)]
    pub recovery: bool,
    #[serde(skip)]
    pub state: State,
    #[serde(skip)]
    pub collateral_min_conf_block_hash: Option<BlockHash>,
}

impl Announcement {
    /// Builds and signs an announcement for `outpoint`, together with its
    /// first ping. The ping is omitted while the chain is too short to
    /// reference a block.
    pub fn create(
        outpoint: OutPoint,
        addr: SocketAddr,
        collateral_key: &PrivateKey,
        service_key: &PrivateKey,
        ctx: &Context,
    ) -> Result<Self, Error> {
        if !ctx.params.is_valid_port(addr.port()) {
            return Err(Error::InvalidPort(addr.port()));
        }
        if !Merchantnode::is_valid_net_addr(&addr, ctx.params) {
            return Err(Error::InvalidAddress(addr));
        }

        let last_ping = match Ping::new(outpoint, ctx) {
            Ok(mut ping) => {
                ping.sign(service_key, ctx.clock)?;
                Some(ping)
            }
            Err(Error::ChainTooShort) => None,
            Err(err) => return Err(err),
        };

        let secp = Secp256k1::signing_only();
        let mut announcement = Self {
            outpoint,
            script_sig: ScriptBuf::new(),
            addr,
            pubkey_collateral: collateral_key.public_key(&secp),
            pubkey_merchantnode: service_key.public_key(&secp),
            protocol_version: ctx.params.protocol_version,
            sig_time: 0,
            signature: Vec::new(),
            last_ping,
            recovery: false,
            state: State::Enabled,
            collateral_min_conf_block_hash: None,
        };
        announcement.sign(collateral_key, ctx.clock)?;

        debug!(
            outpoint = %outpoint,
            collateral = %announcement.pubkey_collateral.pubkey_hash(),
            service = %announcement.pubkey_merchantnode.pubkey_hash(),
            "Created merchantnode announcement"
        );
        Ok(announcement)
    }

    pub fn message(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.addr,
            self.sig_time,
            self.pubkey_collateral.pubkey_hash(),
            self.pubkey_merchantnode.pubkey_hash(),
            self.protocol_version
        )
    }

    /// SHA256D(outpoint, collateral key, sig time)
    pub fn hash(&self) -> MessageHash {
        let mut engine = MessageHash::engine();
        self.outpoint
            .consensus_encode(&mut engine)
            .expect("engines don't error");
        self.pubkey_collateral
            .to_bytes()
            .consensus_encode(&mut engine)
            .expect("engines don't error");
        self.sig_time
            .consensus_encode(&mut engine)
            .expect("engines don't error");
        MessageHash::from_engine(engine)
    }

    /// Stamps the current time and signs with the collateral key.
    pub fn sign(&mut self, collateral_key: &PrivateKey, clock: &dyn Clock) -> Result<(), Error> {
        self.sig_time = clock.now();
        self.signature = MessageSigner::sign_message(&self.message(), collateral_key)?;
        self.check_signature()
    }

    pub fn check_signature(&self) -> Result<(), Error> {
        let message = self.message();
        trace!(outpoint = %self.outpoint, "Checking announcement signature over {message}");
        MessageSigner::verify_message(&self.pubkey_collateral, &self.signature, &message).map_err(
            |err| {
                warn!(outpoint = %self.outpoint, "Got bad merchantnode announce signature: {err}");
                Error::BadSignature(MessageKind::Announce, err)
            },
        )
    }

    /// Structural validation, no collateral lookups. A missing or invalid
    /// embedded ping only downgrades `state` to `Expired`.
    pub fn simple_check(&mut self, ctx: &Context) -> Result<(), Error> {
        let result = self.check_structure(ctx);
        metrics::record_announce("simple", &result);
        result
    }

    fn check_structure(&mut self, ctx: &Context) -> Result<(), Error> {
        if !Merchantnode::is_valid_net_addr(&self.addr, ctx.params) {
            warn!(outpoint = %self.outpoint, addr = %self.addr, "Invalid addr, rejected");
            return Err(Error::InvalidAddress(self.addr));
        }

        if self.sig_time > ctx.now() + MAX_FUTURE_SECONDS {
            warn!(outpoint = %self.outpoint, "Announcement signature rejected, too far into the future");
            return Err(Error::SigTimeInFuture(self.sig_time));
        }

        let ping_ok = match &self.last_ping {
            Some(ping) => ping.simple_check(ctx).is_ok(),
            None => false,
        };
        if !ping_ok {
            // one of us is probably forked, keep checking the rest
            self.state = State::Expired;
        }

        if self.protocol_version < ctx.params.protocol_version {
            warn!(
                outpoint = %self.outpoint,
                protocol_version = self.protocol_version,
                "Ignoring outdated merchantnode"
            );
            return Err(Error::ProtocolOutdated {
                found: self.protocol_version,
                required: ctx.params.protocol_version,
            });
        }

        for pubkey in [&self.pubkey_collateral, &self.pubkey_merchantnode] {
            let script = ScriptBuf::new_p2pkh(&pubkey.pubkey_hash());
            if script.len() != P2PKH_SCRIPT_LEN {
                warn!(outpoint = %self.outpoint, "Public key script has the wrong size");
                return Err(Error::InvalidPubKeyScript(script.len()));
            }
        }

        if !self.script_sig.is_empty() {
            warn!(outpoint = %self.outpoint, script_sig = ?self.script_sig, "Ignoring non-empty scriptSig");
            return Err(Error::NonEmptyScriptSig);
        }

        if !ctx.params.is_valid_port(self.addr.port()) {
            return Err(Error::InvalidPort(self.addr.port()));
        }

        Ok(())
    }

    /// One-time proof that the collateral exists, is mature and belongs to
    /// the collateral key. Transient failures evict the announcement from the
    /// seen cache so that a later copy is evaluated again.
    pub fn check_outpoint(&mut self, ctx: &Context) -> Result<(), Error> {
        let result = self.verify_collateral(ctx);
        if let Err(err) = &result {
            if err.is_transient() {
                ctx.registry.seen_announcements().erase(&self.hash());
            }
        }
        metrics::record_announce("outpoint", &result);
        result
    }

    fn verify_collateral(&mut self, ctx: &Context) -> Result<(), Error> {
        if ctx.is_own_merchantnode(&self.outpoint, &self.pubkey_merchantnode) {
            return Err(Error::OwnAnnouncement);
        }

        self.check_signature()?;

        let chain = ctx.read_chain()?;
        let amount = ctx.params.collateral_amount;
        let min_confirmations = ctx.params.min_confirmations;

        let height = match check_collateral(&*chain, &self.outpoint, amount)? {
            CollateralStatus::Ok { height } => height,
            CollateralStatus::UtxoNotFound => {
                debug!(outpoint = %self.outpoint, "Failed to find merchantnode utxo");
                return Err(Error::CollateralNotFound);
            }
            CollateralStatus::InvalidAmount => {
                debug!(outpoint = %self.outpoint, "Merchantnode utxo has an invalid amount");
                return Err(Error::InvalidCollateralAmount);
            }
        };

        let confirmations = (chain.height()? + 1).saturating_sub(height);
        if confirmations < min_confirmations {
            warn!(
                outpoint = %self.outpoint,
                "Merchantnode utxo must have at least {min_confirmations} confirmations"
            );
            return Err(Error::InsufficientConfirmations {
                have: confirmations,
                need: min_confirmations,
            });
        }
        self.collateral_min_conf_block_hash =
            chain.block_hash((height + min_confirmations).saturating_sub(1))?;

        debug!(outpoint = %self.outpoint, "Merchantnode utxo verified");

        let Some((tx, tx_block)) = chain.transaction(&self.outpoint.txid)? else {
            warn!(outpoint = %self.outpoint, "Collateral transaction is not available");
            return Err(Error::CollateralTxUnavailable);
        };
        if !is_input_associated_with_pubkey(&tx, &self.pubkey_collateral, amount) {
            warn!(outpoint = %self.outpoint, "Got mismatched collateral pubkey and outpoint");
            return Err(Error::CollateralKeyMismatch);
        }

        let Some(tx_block) = tx_block else {
            return Ok(());
        };
        if let Some(block_time) = confirmation_block_time(&*chain, &tx_block, min_confirmations)? {
            if block_time > self.sig_time {
                warn!(
                    outpoint = %self.outpoint,
                    addr = %self.addr,
                    "Bad sig time {} ({min_confirmations} conf block is at {block_time})",
                    self.sig_time
                );
                return Err(Error::SigTimeBeforeConfirmation {
                    sig_time: self.sig_time,
                    block_time,
                });
            }
        }

        Ok(())
    }

    /// Applies this announcement to the existing `record`. Returns whether the
    /// record took the new fields and the announcement was relayed.
    pub fn update(&self, record: &mut Merchantnode, ctx: &Context) -> Result<bool, Error> {
        let result = self.apply_to(record, ctx);
        metrics::record_announce("update", &result);
        result
    }

    fn apply_to(&self, record: &mut Merchantnode, ctx: &Context) -> Result<bool, Error> {
        if record.sig_time == self.sig_time && !self.recovery {
            return Err(Error::DuplicateAnnouncement);
        }

        if record.sig_time > self.sig_time {
            warn!(
                outpoint = %self.outpoint,
                addr = %self.addr,
                "Bad sig time {} (existing announcement is at {})",
                self.sig_time,
                record.sig_time
            );
            return Err(Error::StaleAnnouncement {
                sig_time: self.sig_time,
                known: record.sig_time,
            });
        }

        record.check(false, ctx);

        if record.is_pose_banned() {
            warn!(outpoint = %self.outpoint, "Merchantnode is banned by PoSe");
            return Err(Error::PoseBanned);
        }

        if record.pubkey_collateral != self.pubkey_collateral {
            warn!(outpoint = %self.outpoint, "Got mismatched collateral pubkey and outpoint");
            return Err(Error::CollateralKeyMismatch);
        }

        self.check_signature()?;

        if record.is_broadcasted_within(MIN_ANNOUNCE_SECONDS, ctx.now())
            && !ctx.is_own_key(&self.pubkey_merchantnode)
        {
            return Ok(false);
        }

        info!(outpoint = %self.outpoint, addr = %self.addr, "Got updated merchantnode entry");
        let updated = record.update_from_new_broadcast(self, ctx);
        if updated {
            record.check(false, ctx);
            self.relay(ctx);
        }
        ctx.registry.bump_asset_last_time("Announcement::update");

        Ok(updated)
    }

    pub fn relay(&self, ctx: &Context) {
        ctx.relay(MessageKind::Announce, self.hash());
    }
}

/// Time of the block at which a transaction mined in `tx_block` reached
/// `min_confirmations`.
fn confirmation_block_time<C: ChainView + ?Sized>(
    chain: &C,
    tx_block: &BlockHash,
    min_confirmations: u32,
) -> Result<Option<i64>, Error> {
    let Some(height) = chain.block_height(tx_block)? else {
        return Ok(None);
    };
    let Some(conf_block) = chain.block_hash((height + min_confirmations).saturating_sub(1))? else {
        return Ok(None);
    };
    chain.block_time(&conf_block)
}

impl From<&Merchantnode> for Announcement {
    fn from(record: &Merchantnode) -> Self {
        Self {
            outpoint: record.outpoint,
            script_sig: ScriptBuf::new(),
            addr: record.addr,
            pubkey_collateral: record.pubkey_collateral,
            pubkey_merchantnode: record.pubkey_merchantnode,
            protocol_version: record.protocol_version,
            sig_time: record.sig_time,
            signature: record.signature.clone(),
            last_ping: record.last_ping.clone(),
            recovery: false,
            state: record.state,
            collateral_min_conf_block_hash: record.collateral_min_conf_block_hash,
        }
    }
}
