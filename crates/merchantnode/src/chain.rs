use crate::Error;
use bitcoin::{BlockHash, OutPoint, PublicKey, ScriptBuf, Transaction, Txid};
use serde_derive::{Deserialize, Serialize};

/// An unspent output as seen by the chain state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub value: u64,
    /// Height of the block that created the output
    pub height: u32,
    pub script_pubkey: ScriptBuf,
}

/// Read-only view over the active chain and its utxo set.
pub trait ChainView {
    /// Height of the active tip.
    fn height(&self) -> Result<u32, Error>;

    /// The output behind `outpoint`, or `None` if it does not exist or is spent.
    fn unspent_output(&self, outpoint: &OutPoint) -> Result<Option<Coin>, Error>;

    /// Hash of the active-chain block at `height`.
    fn block_hash(&self, height: u32) -> Result<Option<BlockHash>, Error>;

    /// Height of a known block. `None` means the block is unknown to this node.
    fn block_height(&self, hash: &BlockHash) -> Result<Option<u32>, Error>;

    fn block_time(&self, hash: &BlockHash) -> Result<Option<i64>, Error>;

    /// A transaction together with the block it was mined in, if any.
    fn transaction(&self, txid: &Txid) -> Result<Option<(Transaction, Option<BlockHash>)>, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollateralStatus {
    Ok { height: u32 },
    UtxoNotFound,
    InvalidAmount,
}

/// Resolves a collateral outpoint against the utxo set.
pub fn check_collateral<C: ChainView + ?Sized>(
    chain: &C,
    outpoint: &OutPoint,
    collateral_amount: u64,
) -> Result<CollateralStatus, Error> {
    let Some(coin) = chain.unspent_output(outpoint)? else {
        return Ok(CollateralStatus::UtxoNotFound);
    };

    if coin.value != collateral_amount {
        return Ok(CollateralStatus::InvalidAmount);
    }

    Ok(CollateralStatus::Ok {
        height: coin.height,
    })
}

/// Whether the collateral-spawning `tx` pays exactly `collateral_amount` to
/// the pay-to-pubkey-hash address of `pubkey`.
pub fn is_input_associated_with_pubkey(
    tx: &Transaction,
    pubkey: &PublicKey,
    collateral_amount: u64,
) -> bool {
    let payee = ScriptBuf::new_p2pkh(&pubkey.pubkey_hash());
    tx.output
        .iter()
        .any(|out| out.value == collateral_amount && out.script_pubkey == payee)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{private_key, MemoryChain};
    use bitcoin::hashes::Hash;

    const AMOUNT: u64 = 1000 * crate::params::COIN;

    #[test]
    fn should_resolve_collateral() {
        let mut chain = MemoryChain::with_height(20);
        let good = OutPoint::new(Txid::from_byte_array([1; 32]), 0);
        let small = OutPoint::new(Txid::from_byte_array([2; 32]), 1);
        chain.add_coin(good, AMOUNT, 7, ScriptBuf::new());
        chain.add_coin(small, AMOUNT - 1, 7, ScriptBuf::new());

        assert_eq!(
            check_collateral(&chain, &good, AMOUNT).unwrap(),
            CollateralStatus::Ok { height: 7 }
        );
        assert_eq!(
            check_collateral(&chain, &small, AMOUNT).unwrap(),
            CollateralStatus::InvalidAmount
        );
        assert_eq!(
            check_collateral(&chain, &OutPoint::null(), AMOUNT).unwrap(),
            CollateralStatus::UtxoNotFound
        );
    }

    #[test]
    fn collateral_must_pay_the_pubkey() {
        let mut chain = MemoryChain::with_height(20);
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let owner = private_key(1).public_key(&secp);
        let outpoint = chain.add_collateral(AMOUNT, 7, &owner);
        let (tx, block) = chain.transaction(&outpoint.txid).unwrap().unwrap();

        assert_eq!(block, Some(chain.block_at(7)));
        assert!(is_input_associated_with_pubkey(&tx, &owner, AMOUNT));
        assert!(!is_input_associated_with_pubkey(&tx, &owner, AMOUNT + 1));
        assert!(!is_input_associated_with_pubkey(
            &tx,
            &private_key(2).public_key(&secp),
            AMOUNT
        ));
    }

    #[test]
    fn spent_collateral_is_not_found() {
        let mut chain = MemoryChain::with_height(20);
        let outpoint = OutPoint::new(Txid::from_byte_array([3; 32]), 0);
        chain.add_coin(outpoint, AMOUNT, 7, ScriptBuf::new());
        chain.spend(&outpoint);

        assert_eq!(
            check_collateral(&chain, &outpoint, AMOUNT).unwrap(),
            CollateralStatus::UtxoNotFound
        );
    }
}
