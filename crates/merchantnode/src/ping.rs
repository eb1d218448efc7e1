use crate::announce::Announcement;
use crate::context::{Clock, Context, MessageKind};
use crate::merchantnode::Merchantnode;
use crate::metrics;
use crate::signer::{MessageHash, MessageSigner};
use crate::{Error, MAX_FUTURE_SECONDS, PING_DEDUP_SECONDS, SYNC_BUMP_PING_SECONDS};
use bitcoin::consensus::Encodable;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{BlockHash, OutPoint, PrivateKey, PublicKey};
use serde_derive::{Deserialize, Serialize};
use tracing::*;

/// Signed liveness proof of a merchantnode, referencing a recent block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    pub outpoint: OutPoint,
    pub block_hash: BlockHash,
    pub sig_time: i64,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

impl Ping {
    /// Unsigned ping referencing the block `ping_block_depth` below the tip,
    /// so that short reorgs don't invalidate it.
    pub fn new(outpoint: OutPoint, ctx: &Context) -> Result<Self, Error> {
        let chain = ctx.read_chain()?;
        let height = chain.height()?;
        if height < ctx.params.ping_block_depth {
            return Err(Error::ChainTooShort);
        }
        let block_hash = chain
            .block_hash(height - ctx.params.ping_block_depth)?
            .ok_or(Error::ChainTooShort)?;

        Ok(Self {
            outpoint,
            block_hash,
            sig_time: ctx.now(),
            signature: Vec::new(),
        })
    }

    pub fn message(&self) -> String {
        format!("{}{}{}", self.outpoint, self.block_hash, self.sig_time)
    }

    pub fn hash(&self) -> MessageHash {
        let mut engine = MessageHash::engine();
        self.outpoint
            .consensus_encode(&mut engine)
            .expect("engines don't error");
        self.sig_time
            .consensus_encode(&mut engine)
            .expect("engines don't error");
        MessageHash::from_engine(engine)
    }

    /// Stamps the current time and signs with the service key.
    pub fn sign(&mut self, key: &PrivateKey, clock: &dyn Clock) -> Result<(), Error> {
        self.sig_time = clock.now();
        self.signature = MessageSigner::sign_message(&self.message(), key)?;
        self.check_signature(&key.public_key(&Secp256k1::signing_only()))
    }

    pub fn check_signature(&self, pubkey: &PublicKey) -> Result<(), Error> {
        MessageSigner::verify_message(pubkey, &self.signature, &self.message()).map_err(|err| {
            warn!(outpoint = %self.outpoint, "Got bad merchantnode ping signature: {err}");
            Error::BadSignature(MessageKind::Ping, err)
        })
    }

    pub fn simple_check(&self, ctx: &Context) -> Result<(), Error> {
        if self.sig_time > ctx.now() + MAX_FUTURE_SECONDS {
            warn!(outpoint = %self.outpoint, "Ping signature rejected, too far into the future");
            return Err(Error::SigTimeInFuture(self.sig_time));
        }

        if ctx.read_chain()?.block_height(&self.block_hash)?.is_none() {
            debug!(
                outpoint = %self.outpoint,
                block_hash = %self.block_hash,
                "Ping references an unknown block"
            );
            return Err(Error::UnknownBlock(self.block_hash));
        }

        trace!(outpoint = %self.outpoint, sig_time = self.sig_time, "Ping verified");
        Ok(())
    }

    /// Validates the ping against `record` and, when valid, makes it the
    /// record's latest heartbeat. Returns whether the ping was relayed.
    pub fn check_and_update(
        &self,
        record: Option<&mut Merchantnode>,
        from_announcement: bool,
        ctx: &Context,
    ) -> Result<bool, Error> {
        let result = self.apply(record, from_announcement, ctx);
        metrics::record_ping(&result);
        result
    }

    fn apply(
        &self,
        record: Option<&mut Merchantnode>,
        from_announcement: bool,
        ctx: &Context,
    ) -> Result<bool, Error> {
        self.simple_check(ctx)?;

        let Some(record) = record else {
            debug!(outpoint = %self.outpoint, "Couldn't find merchantnode entry");
            return Err(Error::UnknownMerchantnode);
        };

        if !from_announcement {
            if record.is_update_required() {
                debug!(outpoint = %self.outpoint, "Merchantnode protocol is outdated");
                return Err(Error::UpdateRequired);
            }
            if record.is_new_start_required() {
                debug!(outpoint = %self.outpoint, "Merchantnode is expired, new start is required");
                return Err(Error::NewStartRequired);
            }
        }

        {
            let chain = ctx.read_chain()?;
            let tip = chain.height()? as i64;
            if let Some(height) = chain.block_height(&self.block_hash)? {
                if (height as i64) < tip - ctx.params.max_ping_block_age as i64 {
                    warn!(
                        outpoint = %self.outpoint,
                        block_hash = %self.block_hash,
                        "Ping block hash is too old"
                    );
                    return Err(Error::PingBlockTooOld(self.block_hash));
                }
            }
        }

        debug!(
            outpoint = %self.outpoint,
            block_hash = %self.block_hash,
            sig_time = self.sig_time,
            "New ping"
        );

        if record.is_pinged_within(PING_DEDUP_SECONDS, self.sig_time) {
            debug!(outpoint = %self.outpoint, "Ping arrived too early");
            return Err(Error::PingTooEarly);
        }

        self.check_signature(&record.pubkey_merchantnode)?;

        if !ctx.registry.is_list_synced()
            && !record.is_pinged_within(SYNC_BUMP_PING_SECONDS, ctx.now())
        {
            debug!(outpoint = %self.outpoint, "Bumping sync timeout");
            ctx.registry.bump_asset_last_time("Ping::check_and_update");
        }

        record.last_ping = Some(self.clone());

        // the cached announcement still carries the previous ping
        let seen = ctx.registry.seen_announcements();
        let hash = Announcement::from(&*record).hash();
        if let Some(mut announcement) = seen.get(&hash) {
            announcement.last_ping = Some(self.clone());
            seen.insert(hash, announcement);
        }

        record.check(true, ctx);

        if !record.is_enabled() && !record.is_expired() && !record.is_watchdog_expired() {
            debug!(outpoint = %self.outpoint, state = %record.state, "Ping accepted");
            return Ok(false);
        }

        debug!(outpoint = %self.outpoint, "Ping accepted and relayed");
        self.relay(ctx);
        Ok(true)
    }

    pub fn relay(&self, ctx: &Context) {
        ctx.relay(MessageKind::Ping, self.hash());
    }
}
