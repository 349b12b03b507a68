//! Capability traits for the external services the trader core drives: the
//! backing wallet, its signer, the chain notifier, the auctioneer RPC and the
//! channel funding manager.
//!
//! The SDK never talks to a concrete backend directly; everything is injected
//! through these traits so the lifecycle logic stays testable against the
//! in-memory doubles in [`crate::testing`].

use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Address, FeeRate, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use tokio::sync::{mpsc, oneshot};

use crate::account::Account;
use crate::error::Result;
use crate::order::Bid;
use crate::sidecar::Ticket;

/// Key family used for the trader keys backing accounts.
pub const ACCOUNT_KEY_FAMILY: u32 = 220;

/// Key family used for channel multisig keys handed out to sidecar ticket
/// recipients.
pub const MULTISIG_KEY_FAMILY: u32 = 0;

/// Identifies a key within the wallet's deterministic derivation tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyLocator {
    pub family: u32,
    pub index: u32,
}

/// A derived key together with the locator it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub locator: KeyLocator,
    pub pubkey: PublicKey,
}

/// Everything the signer needs to produce a signature for one input.
#[derive(Debug, Clone)]
pub struct SignDescriptor {
    /// The key to sign with. The signer re-derives the private key from the
    /// locator; the public key is informational.
    pub key: KeyDescriptor,

    /// Scalar added to the private key before signing.
    pub single_tweak: Option<[u8; 32]>,

    /// The witness script committed to by the output being spent.
    pub witness_script: ScriptBuf,

    /// The output being spent.
    pub output: TxOut,

    /// Index of the input the signature is for.
    pub input_index: usize,
}

/// The auctioneer's answer to an account reservation.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    pub auctioneer_key: PublicKey,
    pub initial_batch_key: PublicKey,
}

/// Details of a watched transaction reaching its confirmation target.
#[derive(Debug, Clone)]
pub struct TxConfirmation {
    pub block_height: u32,
    pub tx: Transaction,
}

/// Details of a watched outpoint being spent.
#[derive(Debug, Clone)]
pub struct SpendDetail {
    pub spending_tx: Transaction,
    pub spender_input_index: usize,
    pub spend_height: u32,
}

/// Static parameters the auctioneer publishes for order submission.
#[derive(Debug, Clone, Copy)]
pub struct AuctionTerms {
    pub max_order_duration_blocks: u32,
}

/// On-chain wallet operations.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Derive the next key in the given family.
    async fn derive_next_key(&self, family: u32) -> Result<KeyDescriptor>;

    /// Create, sign and broadcast a transaction paying the given outputs.
    async fn send_outputs(&self, outputs: &[TxOut], fee_rate: FeeRate) -> Result<Transaction>;

    /// Broadcast a fully signed transaction. Re-broadcasting a transaction
    /// that is already known must succeed.
    async fn publish_transaction(&self, tx: &Transaction) -> Result<()>;

    /// A fresh address under the wallet's control.
    async fn next_address(&self) -> Result<Address>;

    /// All transactions relevant to the wallet, including unconfirmed ones
    /// previously broadcast by us.
    async fn list_transactions(&self) -> Result<Vec<Transaction>>;
}

/// Signing operations backed by the wallet's key material.
#[async_trait]
pub trait Signer: Send + Sync {
    /// ECDH between the key identified by `locator` and `remote`, hashed to
    /// 32 bytes.
    async fn derive_shared_key(&self, remote: &PublicKey, locator: &KeyLocator)
        -> Result<[u8; 32]>;

    /// Produce one raw DER signature (without the sighash flag) per
    /// descriptor for the given transaction.
    async fn sign_output_raw(
        &self,
        tx: &Transaction,
        descriptors: &[SignDescriptor],
    ) -> Result<Vec<Vec<u8>>>;

    /// Sign a 32-byte digest with the key identified by `locator`, returning
    /// the 64-byte compact encoding.
    async fn sign_digest(&self, locator: &KeyLocator, digest: [u8; 32]) -> Result<[u8; 64]>;
}

/// Chain event subscriptions.
#[async_trait]
pub trait ChainNotifier: Send + Sync {
    /// One-shot notification once `txid` paying `script` reaches `num_confs`
    /// confirmations. `height_hint` bounds the rescan.
    async fn register_conf(
        &self,
        txid: Txid,
        script: ScriptBuf,
        num_confs: u32,
        height_hint: u32,
    ) -> Result<oneshot::Receiver<TxConfirmation>>;

    /// One-shot notification once `outpoint` is spent.
    async fn register_spend(
        &self,
        outpoint: OutPoint,
        script: ScriptBuf,
        height_hint: u32,
    ) -> Result<oneshot::Receiver<SpendDetail>>;

    /// Stream of new best block heights, starting at the current tip.
    async fn register_block_epoch(&self) -> Result<mpsc::Receiver<u32>>;
}

/// The auctioneer's account and order surface.
#[async_trait]
pub trait Auctioneer: Send + Sync {
    /// Reserve an account, obtaining the auctioneer's key and our initial
    /// per-batch key.
    async fn reserve_account(&self) -> Result<Reservation>;

    /// Announce a funded account to the auctioneer.
    async fn init_account(&self, account: &Account) -> Result<()>;

    /// Subscribe to server-side updates for an open account.
    async fn subscribe_account_updates(&self, account: &Account) -> Result<()>;

    /// Authenticate a bare key with the server to receive updates for orders
    /// tied to it. Used by sidecar recipients, who have no account of their
    /// own.
    async fn start_key_subscription(&self, key: &KeyDescriptor) -> Result<()>;

    /// Request the auctioneer's signature for a cooperative account close
    /// paying the given outputs. Returns a raw DER signature with the
    /// sighash flag appended.
    async fn close_account(&self, trader_key: &PublicKey, outputs: &[TxOut]) -> Result<Vec<u8>>;

    /// Submit a bid order against the given account.
    async fn submit_order(&self, bid: &Bid, account_key: &PublicKey) -> Result<()>;

    /// The auctioneer's published terms.
    async fn terms(&self) -> Result<AuctionTerms>;
}

/// The channel funding manager's sidecar hook.
#[async_trait]
pub trait FundingManager: Send + Sync {
    /// Arm the funding manager to accept the channel promised by the ticket
    /// once a matching batch clears.
    async fn expect_channel(&self, ticket: &Ticket) -> Result<()>;
}
