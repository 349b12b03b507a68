//! Minimal bid template model.
//!
//! The full order pipeline (versioning, units, node tiers) lives with the
//! auctioneer client. The core only needs enough of a bid to bind it to a
//! sidecar ticket, persist it as a template and hand it to
//! [`crate::clients::Auctioneer::submit_order`].

use bitcoin::{Amount, FeeRate};
use rand::RngCore;

use crate::error::{Error, Result};

/// Length of the serialized bid template.
const BID_ENCODING_LEN: usize = 32 + 8 + 8 + 4 + 8;

/// A bid for inbound liquidity, identified by its nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bid {
    /// Random nonce identifying the order.
    pub nonce: [u8; 32],

    /// Total capacity of the channel being bid for.
    pub capacity: Amount,

    /// Amount of the capacity pushed to the remote party on open.
    pub self_chan_balance: Amount,

    /// Minimal duration of the resulting lease, in blocks.
    pub lease_duration_blocks: u32,

    /// Highest per-batch chain fee rate the bid accepts.
    pub max_batch_fee_rate: FeeRate,
}

impl Bid {
    /// Creates a bid with a freshly drawn nonce.
    pub fn new<R: RngCore>(
        rng: &mut R,
        capacity: Amount,
        self_chan_balance: Amount,
        lease_duration_blocks: u32,
        max_batch_fee_rate: FeeRate,
    ) -> Self {
        let mut nonce = [0u8; 32];
        rng.fill_bytes(&mut nonce);
        Bid {
            nonce,
            capacity,
            self_chan_balance,
            lease_duration_blocks,
            max_batch_fee_rate,
        }
    }

    /// Fixed-layout binary encoding, used by the bid template store.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BID_ENCODING_LEN);
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.capacity.to_sat().to_be_bytes());
        buf.extend_from_slice(&self.self_chan_balance.to_sat().to_be_bytes());
        buf.extend_from_slice(&self.lease_duration_blocks.to_be_bytes());
        buf.extend_from_slice(&self.max_batch_fee_rate.to_sat_per_kwu().to_be_bytes());
        buf
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != BID_ENCODING_LEN {
            return Err(Error::TicketEncoding(format!(
                "bid template must be {BID_ENCODING_LEN} bytes, got {}",
                bytes.len(),
            )));
        }

        let mut nonce = [0u8; 32];
        nonce.copy_from_slice(&bytes[..32]);

        let u64_at = |off: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[off..off + 8]);
            u64::from_be_bytes(raw)
        };
        let mut lease = [0u8; 4];
        lease.copy_from_slice(&bytes[48..52]);

        Ok(Bid {
            nonce,
            capacity: Amount::from_sat(u64_at(32)),
            self_chan_balance: Amount::from_sat(u64_at(40)),
            lease_duration_blocks: u32::from_be_bytes(lease),
            max_batch_fee_rate: FeeRate::from_sat_per_kwu(u64_at(52)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bid_roundtrip() {
        let bid = Bid {
            nonce: [0xab; 32],
            capacity: Amount::from_sat(1_000_000),
            self_chan_balance: Amount::from_sat(250_000),
            lease_duration_blocks: 2016,
            max_batch_fee_rate: FeeRate::from_sat_per_kwu(500),
        };

        let decoded = Bid::deserialize(&bid.serialize()).unwrap();
        assert_eq!(bid, decoded);
    }

    #[test]
    fn bid_rejects_bad_length() {
        assert!(Bid::deserialize(&[0u8; 10]).is_err());
    }
}
