//! Client-side core of a non-custodial batched channel-lease auction
//! trader.
//!
//! Two subsystems make up the crate: the on-chain account lifecycle (a
//! 2-of-2 output with an expiry escape path, managed by
//! [`account::manager::Manager`]) and the sidecar ticket negotiation
//! protocol (coordinated by [`sidecar::acceptor::SidecarAcceptor`] over
//! cipher-box mailboxes). All external services are injected through the
//! capability traits in [`clients`]; durable state lives behind the store
//! traits implemented by the companion store crate.

pub mod account;
pub mod clients;
pub mod error;
pub mod mailbox;
pub mod order;
pub mod script;
pub mod sidecar;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// ── Core types ─────────────────────────────────────────────────────
pub use account::manager::{Manager, ManagerConfig};
pub use account::{Account, AccountModifier, AccountState, AccountStore};
pub use clients::{
    AuctionTerms, Auctioneer, ChainNotifier, FundingManager, KeyDescriptor, KeyLocator,
    Reservation, SignDescriptor, Signer, SpendDetail, TxConfirmation, Wallet,
};
pub use error::{Error, Result};
pub use mailbox::{CipherBox, MemoryMailbox, StreamId};
pub use order::Bid;
pub use sidecar::acceptor::{SidecarAcceptor, SidecarAcceptorConfig};
pub use sidecar::negotiator::{SidecarNegotiator, SidecarPacket};
pub use sidecar::{Offer, Recipient, SidecarStore, Ticket, TicketOrder, TicketState};

// Re-export the chain stack for downstream crates.
pub use bitcoin;
