//! Sidecar ticket model.
//!
//! A sidecar ticket is a transferable, signed commitment that lets a third
//! party (the provider) place a bid whose resulting channel opens at the
//! ticket recipient's node. The ticket travels between the two parties over
//! cipher-box mailboxes, accumulating the recipient block and the order block
//! as negotiation progresses.

pub mod acceptor;
pub mod negotiator;

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, Verification};
use bitcoin::Amount;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::order::Bid;

/// Current version of the ticket wire format.
pub const TICKET_VERSION: u8 = 0;

/// Length of a ticket's store key: the 8-byte id followed by the compressed
/// offer signing key.
pub const TICKET_KEY_LEN: usize = 8 + 33;

/// Domain separation tag for the offer digest.
const OFFER_DIGEST_TAG: &[u8] = b"chanlease/sidecar/offer";

/// Domain separation tag for the order digest.
const ORDER_DIGEST_TAG: &[u8] = b"chanlease/sidecar/order";

/// Negotiation state of a sidecar ticket. The wire encoding of each state is
/// fixed; new states must only ever be appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TicketState {
    /// The initial state of a ticket that has not been offered yet. A
    /// provider also re-enters this state in memory after a restart to force
    /// one round of retransmission.
    Created = 0,

    /// The provider signed the offer and handed the ticket out.
    Offered = 1,

    /// The recipient added their node and channel multisig keys.
    Registered = 2,

    /// The provider submitted the bid the ticket is bound to.
    Ordered = 3,

    /// Both parties await the channel resulting from a cleared batch.
    ExpectingChannel = 4,

    /// The channel has been opened; the ticket is complete.
    Completed = 5,
}

impl TicketState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Created),
            1 => Some(Self::Offered),
            2 => Some(Self::Registered),
            3 => Some(Self::Ordered),
            4 => Some(Self::ExpectingChannel),
            5 => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for TicketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Offered => "offered",
            Self::Registered => "registered",
            Self::Ordered => "ordered",
            Self::ExpectingChannel => "expecting_channel",
            Self::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// The provider's signed offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offer {
    /// Total capacity of the promised channel.
    pub capacity: Amount,

    /// Portion of the capacity pushed to the recipient on open.
    pub push_amt: Amount,

    /// Minimal lease duration of the promised channel, in blocks.
    pub lease_duration_blocks: u32,

    /// The provider's account key; signs the offer and order digests.
    pub sign_pubkey: PublicKey,

    /// Signature by `sign_pubkey` over [`Ticket::offer_digest`].
    pub sig_offer_digest: Signature,

    /// Whether negotiation is carried out automatically over mailboxes.
    pub auto: bool,
}

/// The recipient's node identity and channel keys, set at registration and
/// immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recipient {
    /// Identity key of the node the channel will open to.
    pub node_pubkey: PublicKey,

    /// Channel multisig key the recipient handed out for this ticket.
    pub multisig_pubkey: PublicKey,

    /// Derivation index of `multisig_pubkey`, needed to re-derive it for the
    /// auctioneer subscription.
    pub multisig_key_index: u32,
}

/// The binding between a ticket and the provider's submitted bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketOrder {
    /// Nonce of the bid submitted for this ticket.
    pub bid_nonce: [u8; 32],

    /// Signature by the offer's `sign_pubkey` over [`Ticket::order_digest`].
    pub sig_order_digest: Signature,
}

/// A sidecar ticket. Identity is `(id, offer.sign_pubkey)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub id: [u8; 8],
    pub state: TicketState,
    pub offer: Offer,
    pub recipient: Option<Recipient>,
    pub order: Option<TicketOrder>,
}

/// The domain-separated hash committing to an offer's canonical fields.
/// Exposed separately from [`Ticket::offer_digest`] so a provider can sign
/// the digest before the ticket exists.
pub fn offer_digest(
    id: [u8; 8],
    capacity: Amount,
    push_amt: Amount,
    lease_duration_blocks: u32,
    sign_pubkey: &PublicKey,
) -> [u8; 32] {
    let mut hasher = tagged_hasher(OFFER_DIGEST_TAG);
    hasher.update(id);
    hasher.update(capacity.to_sat().to_be_bytes());
    hasher.update(push_amt.to_sat().to_be_bytes());
    hasher.update(lease_duration_blocks.to_be_bytes());
    hasher.update(sign_pubkey.serialize());
    hasher.finalize().into()
}

/// The domain-separated hash binding a bid nonce to a ticket.
pub fn order_digest(id: [u8; 8], bid_nonce: [u8; 32]) -> [u8; 32] {
    let mut hasher = tagged_hasher(ORDER_DIGEST_TAG);
    hasher.update(id);
    hasher.update(bid_nonce);
    hasher.finalize().into()
}

impl Ticket {
    /// The key the ticket is stored under: `id || sign_pubkey`.
    pub fn store_key(&self) -> [u8; TICKET_KEY_LEN] {
        ticket_key(self.id, &self.offer.sign_pubkey)
    }

    /// The domain-separated hash committing to the offer's canonical fields.
    pub fn offer_digest(&self) -> [u8; 32] {
        offer_digest(
            self.id,
            self.offer.capacity,
            self.offer.push_amt,
            self.offer.lease_duration_blocks,
            &self.offer.sign_pubkey,
        )
    }

    /// The domain-separated hash committing to the order binding. Fails if
    /// the ticket carries no order block.
    pub fn order_digest(&self) -> Result<[u8; 32]> {
        let order = self.order.as_ref().ok_or(Error::MissingOrder)?;
        Ok(order_digest(self.id, order.bid_nonce))
    }

    /// Checks that the offer signature is a valid signature by the offer's
    /// signing key over the offer digest.
    pub fn verify_offer<C: Verification>(&self, secp: &Secp256k1<C>) -> Result<()> {
        let msg = Message::from_digest(self.offer_digest());
        secp.verify_ecdsa(&msg, &self.offer.sig_offer_digest, &self.offer.sign_pubkey)
            .map_err(|_| Error::InvalidOfferSignature)
    }

    /// Checks the order signature. Only meaningful once the ticket carries
    /// an order block, i.e. from [`TicketState::Ordered`] onwards.
    pub fn verify_order<C: Verification>(&self, secp: &Secp256k1<C>) -> Result<()> {
        let order = self.order.as_ref().ok_or(Error::MissingOrder)?;
        let msg = Message::from_digest(self.order_digest()?);
        secp.verify_ecdsa(&msg, &order.sig_order_digest, &self.offer.sign_pubkey)
            .map_err(|_| Error::InvalidOrderSignature)
    }

    /// Serializes the ticket into its fixed-layout wire encoding.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(160);
        buf.push(TICKET_VERSION);
        buf.extend_from_slice(&self.id);
        buf.push(self.state.as_u8());

        buf.extend_from_slice(&self.offer.capacity.to_sat().to_be_bytes());
        buf.extend_from_slice(&self.offer.push_amt.to_sat().to_be_bytes());
        buf.extend_from_slice(&self.offer.lease_duration_blocks.to_be_bytes());
        buf.push(u8::from(self.offer.auto));
        buf.extend_from_slice(&self.offer.sign_pubkey.serialize());
        push_signature(&mut buf, &self.offer.sig_offer_digest);

        match &self.recipient {
            Some(recipient) => {
                buf.push(1);
                buf.extend_from_slice(&recipient.node_pubkey.serialize());
                buf.extend_from_slice(&recipient.multisig_pubkey.serialize());
                buf.extend_from_slice(&recipient.multisig_key_index.to_be_bytes());
            }
            None => buf.push(0),
        }

        match &self.order {
            Some(order) => {
                buf.push(1);
                buf.extend_from_slice(&order.bid_nonce);
                push_signature(&mut buf, &order.sig_order_digest);
            }
            None => buf.push(0),
        }

        buf
    }

    /// Parses a ticket from its wire encoding.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);

        let version = r.u8()?;
        if version != TICKET_VERSION {
            return Err(Error::TicketEncoding(format!(
                "unknown ticket version {version}"
            )));
        }

        let id: [u8; 8] = r.array()?;
        let state = TicketState::from_u8(r.u8()?)
            .ok_or_else(|| Error::TicketEncoding("unknown ticket state".into()))?;

        let capacity = Amount::from_sat(r.u64()?);
        let push_amt = Amount::from_sat(r.u64()?);
        let lease_duration_blocks = r.u32()?;
        let auto = r.u8()? != 0;
        let sign_pubkey = r.pubkey()?;
        let sig_offer_digest = r.signature()?;

        let recipient = if r.u8()? != 0 {
            Some(Recipient {
                node_pubkey: r.pubkey()?,
                multisig_pubkey: r.pubkey()?,
                multisig_key_index: r.u32()?,
            })
        } else {
            None
        };

        let order = if r.u8()? != 0 {
            Some(TicketOrder {
                bid_nonce: r.array()?,
                sig_order_digest: r.signature()?,
            })
        } else {
            None
        };

        r.finish()?;

        Ok(Ticket {
            id,
            state,
            offer: Offer {
                capacity,
                push_amt,
                lease_duration_blocks,
                sign_pubkey,
                sig_offer_digest,
                auto,
            },
            recipient,
            order,
        })
    }
}

/// The store key for a ticket: `id || compressed sign_pubkey`.
pub fn ticket_key(id: [u8; 8], sign_pubkey: &PublicKey) -> [u8; TICKET_KEY_LEN] {
    let mut key = [0u8; TICKET_KEY_LEN];
    key[..8].copy_from_slice(&id);
    key[8..].copy_from_slice(&sign_pubkey.serialize());
    key
}

/// The stream id the recipient uses to message the provider: the raw 64-byte
/// compact encoding of the offer digest signature.
pub fn provider_stream_id(ticket: &Ticket) -> [u8; 64] {
    ticket.offer.sig_offer_digest.serialize_compact()
}

/// The stream id the provider uses to message the recipient: the x-only
/// bytes of the recipient's node key followed by those of the multisig key.
pub fn recipient_stream_id(ticket: &Ticket) -> Result<[u8; 64]> {
    let recipient = ticket.recipient.as_ref().ok_or(Error::MissingRecipient)?;

    let node = recipient.node_pubkey.serialize();
    let multisig = recipient.multisig_pubkey.serialize();

    // Drop the parity byte of each compressed key.
    let mut stream_id = [0u8; 64];
    stream_id[..32].copy_from_slice(&node[1..]);
    stream_id[32..].copy_from_slice(&multisig[1..]);
    Ok(stream_id)
}

/// Durable storage of sidecar tickets and their bid templates.
///
/// Tickets are keyed by `(id, offer.sign_pubkey)`. Implementations must make
/// every mutation atomic and flushed before returning.
pub trait SidecarStore: Send {
    /// Inserts a new ticket; fails with [`Error::SidecarExists`] if one with
    /// the same key is already present.
    fn add_sidecar(&mut self, ticket: &Ticket) -> Result<()>;

    /// Inserts a new ticket together with the bid template the provider will
    /// submit for it, in one atomic step.
    fn add_sidecar_with_bid(&mut self, ticket: &Ticket, bid: &Bid) -> Result<()>;

    /// Overwrites an existing ticket; fails with [`Error::NoSidecarTicket`]
    /// if it was never added.
    fn update_sidecar(&mut self, ticket: &Ticket) -> Result<()>;

    /// Looks up a ticket by id and offer signing key.
    fn sidecar(&mut self, id: [u8; 8], sign_pubkey: &PublicKey) -> Result<Ticket>;

    /// All stored tickets, in unspecified order.
    fn sidecars(&mut self) -> Result<Vec<Ticket>>;

    /// The bid template stored alongside the ticket, if any.
    fn sidecar_bid_template(&mut self, ticket: &Ticket) -> Result<Bid>;
}

fn tagged_hasher(tag: &[u8]) -> Sha256 {
    let tag_hash = Sha256::digest(tag);
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    hasher
}

fn push_signature(buf: &mut Vec<u8>, sig: &Signature) {
    let compact = sig.serialize_compact();
    buf.extend_from_slice(&(compact.len() as u16).to_be_bytes());
    buf.extend_from_slice(&compact);
}

/// Byte-slice cursor for the ticket wire format.
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < n {
            return Err(Error::TicketEncoding(format!(
                "unexpected end of ticket, wanted {n} more bytes"
            )));
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn pubkey(&mut self) -> Result<PublicKey> {
        PublicKey::from_slice(self.take(33)?)
            .map_err(|e| Error::TicketEncoding(format!("invalid public key: {e}")))
    }

    fn signature(&mut self) -> Result<Signature> {
        let len = u16::from_be_bytes(self.array()?) as usize;
        Signature::from_compact(self.take(len)?)
            .map_err(|e| Error::TicketEncoding(format!("invalid signature: {e}")))
    }

    fn finish(&self) -> Result<()> {
        if !self.bytes.is_empty() {
            return Err(Error::TicketEncoding(format!(
                "{} trailing bytes after ticket",
                self.bytes.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::SecretKey;

    fn signed_test_ticket() -> (Secp256k1<bitcoin::secp256k1::All>, SecretKey, Ticket) {
        let secp = Secp256k1::new();
        let sign_sk = SecretKey::from_slice(&[0x55; 32]).unwrap();
        let sign_pubkey = sign_sk.public_key(&secp);

        let mut ticket = Ticket {
            id: *b"\x01\x02\x03\x04\x05\x06\x07\x08",
            state: TicketState::Offered,
            offer: Offer {
                capacity: Amount::from_sat(1_000_000),
                push_amt: Amount::from_sat(100_000),
                lease_duration_blocks: 2016,
                sign_pubkey,
                // Placeholder, replaced below once the digest is known.
                sig_offer_digest: Signature::from_compact(&[1u8; 64]).unwrap(),
                auto: true,
            },
            recipient: None,
            order: None,
        };

        let msg = Message::from_digest(ticket.offer_digest());
        ticket.offer.sig_offer_digest = secp.sign_ecdsa(&msg, &sign_sk);
        (secp, sign_sk, ticket)
    }

    fn add_recipient(secp: &Secp256k1<bitcoin::secp256k1::All>, ticket: &mut Ticket) {
        ticket.recipient = Some(Recipient {
            node_pubkey: SecretKey::from_slice(&[0x66; 32]).unwrap().public_key(secp),
            multisig_pubkey: SecretKey::from_slice(&[0x77; 32]).unwrap().public_key(secp),
            multisig_key_index: 42,
        });
        ticket.state = TicketState::Registered;
    }

    #[test]
    fn offer_roundtrip_preserves_verification() {
        let (secp, _, ticket) = signed_test_ticket();
        ticket.verify_offer(&secp).unwrap();

        let decoded = Ticket::deserialize(&ticket.serialize()).unwrap();
        assert_eq!(ticket, decoded);
        decoded.verify_offer(&secp).unwrap();
    }

    #[test]
    fn full_ticket_roundtrip() {
        let (secp, sign_sk, mut ticket) = signed_test_ticket();
        add_recipient(&secp, &mut ticket);

        ticket.order = Some(TicketOrder {
            bid_nonce: [0xaa; 32],
            sig_order_digest: Signature::from_compact(&[1u8; 64]).unwrap(),
        });
        let msg = Message::from_digest(ticket.order_digest().unwrap());
        ticket.order.as_mut().unwrap().sig_order_digest = secp.sign_ecdsa(&msg, &sign_sk);
        ticket.state = TicketState::Ordered;

        let decoded = Ticket::deserialize(&ticket.serialize()).unwrap();
        assert_eq!(ticket, decoded);
        decoded.verify_offer(&secp).unwrap();
        decoded.verify_order(&secp).unwrap();
    }

    #[test]
    fn tampered_offer_fails_verification() {
        let (secp, _, mut ticket) = signed_test_ticket();
        ticket.offer.capacity = Amount::from_sat(2_000_000);
        assert!(matches!(
            ticket.verify_offer(&secp),
            Err(Error::InvalidOfferSignature),
        ));
    }

    #[test]
    fn verify_order_requires_order_block() {
        let (secp, _, ticket) = signed_test_ticket();
        assert!(matches!(ticket.verify_order(&secp), Err(Error::MissingOrder)));
    }

    #[test]
    fn stream_ids() {
        let (secp, _, mut ticket) = signed_test_ticket();

        let provider = provider_stream_id(&ticket);
        assert_eq!(provider, ticket.offer.sig_offer_digest.serialize_compact());

        assert!(matches!(
            recipient_stream_id(&ticket),
            Err(Error::MissingRecipient),
        ));

        add_recipient(&secp, &mut ticket);
        let recipient = ticket.recipient.unwrap();
        let stream = recipient_stream_id(&ticket).unwrap();
        assert_eq!(&stream[..32], &recipient.node_pubkey.serialize()[1..]);
        assert_eq!(&stream[32..], &recipient.multisig_pubkey.serialize()[1..]);
    }

    #[test]
    fn state_codec_is_stable() {
        for value in 0..=5 {
            let state = TicketState::from_u8(value).unwrap();
            assert_eq!(state.as_u8(), value);
        }
        assert!(TicketState::from_u8(6).is_none());
    }

    #[test]
    fn truncated_ticket_rejected() {
        let (_, _, ticket) = signed_test_ticket();
        let bytes = ticket.serialize();
        assert!(Ticket::deserialize(&bytes[..bytes.len() - 1]).is_err());

        let mut extended = bytes.clone();
        extended.push(0);
        assert!(Ticket::deserialize(&extended).is_err());
    }
}
