//! Chain Reader
//!
//! Thin accessor over the chain JSON-RPC: the latest block height and the
//! full transaction list of a block. Only read methods are used.

use std::sync::atomic::{AtomicU64, Ordering};

use alloy::consensus::Transaction as ConsensusTransaction;
use alloy::eips::BlockNumberOrTag;
use alloy::network::TransactionResponse;
use alloy::primitives::{Address, TxHash, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur while reading the chain
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Chain unavailable (last known height {last_known}): {reason}")]
    Unavailable { last_known: u64, reason: String },

    #[error("Failed to fetch block {height}: {reason}")]
    BlockFetch { height: u64, reason: String },

    #[error("Block {0} not found")]
    BlockNotFound(u64),

    #[error("Invalid RPC URL: {0}")]
    InvalidUrl(String),
}

impl ChainError {
    /// The block height the error refers to, if any
    pub fn height(&self) -> Option<u64> {
        match self {
            ChainError::BlockFetch { height, .. } => Some(*height),
            ChainError::BlockNotFound(height) => Some(*height),
            _ => None,
        }
    }
}

/// The fields of a block transaction the monitor needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransaction {
    /// Transaction hash
    pub hash: TxHash,
    /// Sender address
    pub from: Address,
    /// Recipient address (None for contract creation)
    pub to: Option<Address>,
    /// Transaction value in base units
    pub value: U256,
    /// Gas field of the transaction body
    pub gas: u64,
}

/// Read access to the chain
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Current chain head. On failure the error carries the last height
    /// successfully observed.
    async fn latest_height(&self) -> Result<u64, ChainError>;

    /// Every transaction of the block at `height`, in block order. Never
    /// returns a partial block.
    async fn block_transactions(&self, height: u64) -> Result<Vec<BlockTransaction>, ChainError>;
}

/// [`ChainReader`] over an alloy JSON-RPC provider
pub struct RpcChainReader {
    provider: DynProvider,
    last_known: AtomicU64,
}

impl RpcChainReader {
    /// Wrap an existing provider
    pub fn new(provider: DynProvider) -> Self {
        Self {
            provider,
            last_known: AtomicU64::new(0),
        }
    }

    /// Build a reader on an HTTP JSON-RPC endpoint
    pub fn connect_http(rpc_url: &str) -> Result<Self, ChainError> {
        let url = rpc_url
            .parse::<reqwest::Url>()
            .map_err(|e| ChainError::InvalidUrl(format!("{}: {}", rpc_url, e)))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        info!(rpc_url = %rpc_url, "chain reader configured");
        Ok(Self::new(provider))
    }

    /// Highest head height observed so far
    pub fn last_known_height(&self) -> u64 {
        self.last_known.load(Ordering::SeqCst)
    }

    /// Chain id reported by the node
    pub async fn chain_id(&self) -> Result<u64, ChainError> {
        self.provider
            .get_chain_id()
            .await
            .map_err(|e| ChainError::Unavailable {
                last_known: self.last_known_height(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn latest_height(&self) -> Result<u64, ChainError> {
        match self.provider.get_block_number().await {
            Ok(height) => {
                self.last_known.fetch_max(height, Ordering::SeqCst);
                debug!(height, "latest block");
                Ok(height)
            }
            Err(e) => {
                let last_known = self.last_known_height();
                warn!(last_known, error = %e, "failed to get latest block");
                Err(ChainError::Unavailable {
                    last_known,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn block_transactions(&self, height: u64) -> Result<Vec<BlockTransaction>, ChainError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(height))
            .full()
            .await
            .map_err(|e| ChainError::BlockFetch {
                height,
                reason: e.to_string(),
            })?
            .ok_or(ChainError::BlockNotFound(height))?;

        if block.transactions.is_hashes() && !block.transactions.is_empty() {
            return Err(ChainError::BlockFetch {
                height,
                reason: "node returned transaction hashes instead of bodies".to_string(),
            });
        }

        let transactions = block
            .transactions
            .txns()
            .map(|tx| BlockTransaction {
                hash: TransactionResponse::tx_hash(tx),
                from: TransactionResponse::from(tx),
                to: ConsensusTransaction::to(tx),
                value: ConsensusTransaction::value(tx),
                gas: ConsensusTransaction::gas_limit(tx),
            })
            .collect();

        Ok(transactions)
    }
}
