use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, Txid};
use thiserror::Error;

use crate::sidecar::TicketState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("minimum account value allowed is {0}")]
    MinAccountValue(Amount),

    #[error("maximum account value allowed is {0}")]
    MaxAccountValue(Amount),

    #[error("current minimum account expiry allowed is height {0}")]
    MinAccountExpiry(u32),

    #[error("current maximum account expiry allowed is height {0}")]
    MaxAccountExpiry(u32),

    #[error("account not found")]
    AccountNotFound,

    #[error("account {} already exists", .0)]
    AccountExists(PublicKey),

    #[error("account has already been closed")]
    AccountAlreadyClosed,

    #[error("account is missing its funding outpoint")]
    MissingOutPoint,

    #[error("account is missing its close transaction")]
    MissingCloseTx,

    #[error("no sidecar ticket found")]
    NoSidecarTicket,

    #[error("sidecar ticket with ID {} already exists", hex::encode(.0))]
    SidecarExists([u8; 8]),

    #[error("order with nonce {} already exists", hex::encode(.0))]
    OrderExists([u8; 32]),

    #[error("order with nonce {} not found", hex::encode(.0))]
    OrderNotFound([u8; 32]),

    #[error("transaction not found")]
    TxNotFound,

    #[error("transaction {0} does not include the expected output script")]
    ScriptNotFound(Txid),

    #[error("unknown spend witness")]
    UnknownSpendWitness,

    #[error("invalid key tweak")]
    InvalidKeyTweak,

    #[error("account value {value} cannot cover fee {fee}")]
    InsufficientValue { value: Amount, fee: Amount },

    #[error("close transaction failed sanity checks: {0}")]
    InvalidCloseTx(String),

    #[error("invalid sidecar offer: {0}")]
    InvalidOffer(String),

    #[error("sidecar ticket in state {actual}, expected {expected}")]
    UnexpectedTicketState {
        actual: TicketState,
        expected: TicketState,
    },

    #[error("invalid signature over the offer digest")]
    InvalidOfferSignature,

    #[error("invalid signature over the order digest")]
    InvalidOrderSignature,

    #[error("sidecar ticket is missing its recipient")]
    MissingRecipient,

    #[error("sidecar ticket is missing its order")]
    MissingOrder,

    #[error("channel for bid nonce {} is already expected", hex::encode(.0))]
    ChannelAlreadyExpected([u8; 32]),

    #[error("ticket encoding: {0}")]
    TicketEncoding(String),

    #[error("mailbox stream already exists")]
    MailboxExists,

    #[error("mailbox stream closed")]
    MailboxClosed,

    #[error("mailbox error: {0}")]
    Mailbox(String),

    #[error("wallet error: {0}")]
    Wallet(String),

    #[error("signer error: {0}")]
    Signer(String),

    #[error("chain notifier error: {0}")]
    ChainNotifier(String),

    #[error("auctioneer error: {0}")]
    Auctioneer(String),

    #[error("funding error: {0}")]
    Funding(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("watcher is shut down")]
    WatcherShutdown,

    #[error("shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;
