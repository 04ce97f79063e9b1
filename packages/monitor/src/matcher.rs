//! Transaction Matching
//!
//! Selects the transactions of a block that touch a monitored address and
//! attributes each one to the owning subscriber. Pure and side-effect free.

use std::collections::HashMap;
use std::fmt;

use alloy::primitives::{Address, TxHash, U256};

use crate::chain::BlockTransaction;
use crate::store::SubscriberId;

/// Direction of a matched transaction relative to the monitored address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The monitored address is the recipient
    Incoming,
    /// The monitored address is the sender
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A block transaction attributed to one interested subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedTransaction {
    /// Height of the block containing the transaction
    pub block_number: u64,
    /// Transaction hash
    pub hash: TxHash,
    /// Sender address
    pub from: Address,
    /// Recipient address (None for contract creation)
    pub to: Option<Address>,
    /// Transferred value in base units
    pub value: U256,
    /// Gas as reported in the transaction body
    pub gas: u64,
    /// Direction relative to the subscriber's address
    pub direction: Direction,
    /// Owning subscriber
    pub subscriber: SubscriberId,
}

impl MatchedTransaction {
    fn new(
        block_number: u64,
        tx: &BlockTransaction,
        direction: Direction,
        subscriber: SubscriberId,
    ) -> Self {
        Self {
            block_number,
            hash: tx.hash,
            from: tx.from,
            to: tx.to,
            value: tx.value,
            gas: tx.gas,
            direction,
            subscriber,
        }
    }

    /// The monitored address this match was made on
    pub fn monitored_address(&self) -> Option<Address> {
        match self.direction {
            Direction::Outgoing => Some(self.from),
            Direction::Incoming => self.to,
        }
    }
}

/// Match a block's transactions against the monitored address index
///
/// # Arguments
/// * `block_number` - Height of the block the transactions belong to
/// * `transactions` - The block's transactions, in block order
/// * `monitored` - Current address -> subscriber index
///
/// # Returns
/// One record per (transaction, interested subscriber), in block order. A
/// transaction whose sender and recipient are owned by different subscribers
/// yields an outgoing record followed by an incoming one. A self-transfer
/// yields a single outgoing record.
pub fn match_transactions(
    block_number: u64,
    transactions: &[BlockTransaction],
    monitored: &HashMap<Address, SubscriberId>,
) -> Vec<MatchedTransaction> {
    if monitored.is_empty() {
        return Vec::new();
    }

    let mut matches = Vec::new();
    for tx in transactions {
        if let Some(&owner) = monitored.get(&tx.from) {
            matches.push(MatchedTransaction::new(block_number, tx, Direction::Outgoing, owner));
        }

        if let Some(to) = tx.to.filter(|to| *to != tx.from) {
            if let Some(&owner) = monitored.get(&to) {
                matches.push(MatchedTransaction::new(block_number, tx, Direction::Incoming, owner));
            }
        }
    }
    matches
}

/// Parse user input as an EVM address
///
/// Accepts a `0x`-prefixed 40-digit hex string that is all lower-case, all
/// upper-case, or carries a valid EIP-55 checksum.
///
/// # Returns
/// `Some(Address)` if the input is a valid address, `None` otherwise
pub fn parse_address(input: &str) -> Option<Address> {
    let input = input.trim();
    let digits = input.strip_prefix("0x").or_else(|| input.strip_prefix("0X"))?;

    if digits.len() != 40 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }

    let has_lower = digits.bytes().any(|b| b.is_ascii_lowercase());
    let has_upper = digits.bytes().any(|b| b.is_ascii_uppercase());
    if has_lower && has_upper {
        return Address::parse_checksummed(format!("0x{}", digits), None).ok();
    }

    digits.parse().ok()
}

/// Canonical textual form of an address: lower-case with `0x` prefix
pub fn canonical_address(address: &Address) -> String {
    format!("{:#x}", address)
}
