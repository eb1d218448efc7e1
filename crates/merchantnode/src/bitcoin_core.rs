use crate::chain::{ChainView, Coin};
use crate::Error;
use bitcoin::{BlockHash, OutPoint, ScriptBuf, Transaction, Txid};
use bitcoincore_rpc::jsonrpc::{error::RpcError, Error as JsonRpcError};
use bitcoincore_rpc::{Auth, Client, Error as BitcoinError, RpcApi};
use num_derive::FromPrimitive;
use std::sync::Arc;
use tracing::*;

// https://github.com/bitcoin/bitcoin/blob/be3af4f31089726267ce2dbdd6c9c153bb5aeae1/src/rpc/protocol.h#L43
#[derive(Debug, FromPrimitive, PartialEq, Eq)]
enum BitcoinRpcError {
    RpcMiscError = -1,
    RpcInvalidAddressOrKey = -5,
    RpcInvalidParameter = -8,
    RpcClientInInitialDownload = -10,
    RpcInWarmup = -28,

    /// Any other RPC error code.
    RpcUnknownError = 0,
}

impl From<RpcError> for BitcoinRpcError {
    fn from(err: RpcError) -> Self {
        match num::FromPrimitive::from_i32(err.code) {
            Some(err) => err,
            None => Self::RpcUnknownError,
        }
    }
}

/// Maps "no such block/transaction" answers to `None` and keeps every other
/// failure as an error.
fn optional<T>(result: Result<T, BitcoinError>) -> Result<Option<T>, Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(BitcoinError::JsonRpc(JsonRpcError::Rpc(err)))
            if matches!(
                BitcoinRpcError::from(err.clone()),
                BitcoinRpcError::RpcInvalidAddressOrKey | BitcoinRpcError::RpcInvalidParameter
            ) =>
        {
            Ok(None)
        }
        Err(err) => {
            warn!("bitcoin rpc error {err}");
            Err(err.into())
        }
    }
}

/// Chain state served by a Bitcoin Core compatible node over json-rpc.
///
/// Collateral transactions older than the utxo set can only be fetched when
/// the node runs with `-txindex`; without it they read as unavailable.
#[derive(Clone)]
pub struct BitcoinCoreChain {
    pub rpc: Arc<Client>,
}

impl BitcoinCoreChain {
    pub fn new(
        url: &str,
        rpc_user: impl Into<String>,
        rpc_pass: impl Into<String>,
    ) -> Result<Self, Error> {
        Ok(Self {
            rpc: Client::new(url, Auth::UserPass(rpc_user.into(), rpc_pass.into()))?.into(),
        })
    }

    pub fn is_initial_block_download(&self) -> Result<bool, Error> {
        Ok(self.rpc.get_blockchain_info()?.initial_block_download)
    }
}

impl ChainView for BitcoinCoreChain {
    fn height(&self) -> Result<u32, Error> {
        Ok(self.rpc.get_block_count()? as u32)
    }

    fn unspent_output(&self, outpoint: &OutPoint) -> Result<Option<Coin>, Error> {
        let Some(out) = self
            .rpc
            .get_tx_out(&outpoint.txid, outpoint.vout, Some(false))?
        else {
            return Ok(None);
        };
        let tip = self.height()?;

        Ok(Some(Coin {
            value: out.value.to_sat(),
            height: (tip + 1).saturating_sub(out.confirmations),
            script_pubkey: ScriptBuf::from(out.script_pub_key.hex),
        }))
    }

    fn block_hash(&self, height: u32) -> Result<Option<BlockHash>, Error> {
        optional(self.rpc.get_block_hash(height.into()))
    }

    fn block_height(&self, hash: &BlockHash) -> Result<Option<u32>, Error> {
        Ok(optional(self.rpc.get_block_header_info(hash))?.map(|header| header.height as u32))
    }

    fn block_time(&self, hash: &BlockHash) -> Result<Option<i64>, Error> {
        Ok(optional(self.rpc.get_block_header_info(hash))?.map(|header| header.time as i64))
    }

    fn transaction(&self, txid: &Txid) -> Result<Option<(Transaction, Option<BlockHash>)>, Error> {
        let Some(info) = optional(self.rpc.get_raw_transaction_info(txid, None))? else {
            return Ok(None);
        };
        match info.transaction() {
            Ok(tx) => Ok(Some((tx, info.blockhash))),
            Err(err) => {
                debug!("failed to decode transaction {txid}: {err}");
                Ok(None)
            }
        }
    }
}
