//! In-memory doubles of the external services and stores, used by the unit
//! and integration tests. Exposed behind the `testing` feature so dependent
//! crates can reuse them in their own tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{All, Message, PublicKey, Scalar, Secp256k1, SecretKey};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, EcdsaSighashType, FeeRate, Network, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};

use crate::account::{self, Account, AccountModifier, AccountState, AccountStore};
use crate::clients::{
    AuctionTerms, Auctioneer, ChainNotifier, FundingManager, KeyDescriptor, KeyLocator,
    Reservation, SignDescriptor, Signer, SpendDetail, TxConfirmation, Wallet,
};
use crate::error::{Error, Result};
use crate::order::Bid;
use crate::sidecar::{self, Offer, SidecarStore, Ticket, TicketState, TICKET_KEY_LEN};

// ── Key material ────────────────────────────────────────────────────

/// Deterministic secret key for the wallet's derivation tree, re-derivable
/// by both the mock wallet and the mock signer.
pub fn derived_seckey(locator: &KeyLocator) -> SecretKey {
    let mut hasher = Sha256::new();
    hasher.update(b"test-keyring");
    hasher.update(locator.family.to_be_bytes());
    hasher.update(locator.index.to_be_bytes());
    let bytes: [u8; 32] = hasher.finalize().into();
    SecretKey::from_slice(&bytes).expect("hash output is a valid scalar")
}

/// A fixed secret key derived from a single byte tag.
pub fn test_seckey(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).expect("non-zero constant is a valid scalar")
}

/// A key descriptor whose public key is derived from a single byte tag.
pub fn test_key_descriptor(byte: u8) -> KeyDescriptor {
    let secp = Secp256k1::new();
    KeyDescriptor {
        locator: KeyLocator {
            family: 0,
            index: u32::from(byte),
        },
        pubkey: test_seckey(byte).public_key(&secp),
    }
}

/// An account in `Initiated` with deterministic keys.
pub fn test_account(secp: &Secp256k1<All>, byte: u8) -> Account {
    Account {
        value: Amount::from_sat(500_000),
        expiry: 701_000,
        trader_key: KeyDescriptor {
            locator: KeyLocator {
                family: crate::clients::ACCOUNT_KEY_FAMILY,
                index: u32::from(byte),
            },
            pubkey: test_seckey(byte).public_key(secp),
        },
        auctioneer_key: test_seckey(byte.wrapping_add(0x40)).public_key(secp),
        batch_key: test_seckey(byte.wrapping_add(0x80)).public_key(secp),
        secret: [byte; 32],
        state: AccountState::Initiated,
        height_hint: 700_000,
        outpoint: None,
        close_tx: None,
    }
}

/// An offered automated ticket with a valid offer signature.
pub fn test_ticket(secp: &Secp256k1<All>, byte: u8) -> Ticket {
    let sign_sk = test_seckey(byte);
    let sign_pubkey = sign_sk.public_key(secp);

    let id = [byte; 8];
    let capacity = Amount::from_sat(1_000_000);
    let push_amt = Amount::from_sat(100_000);
    let lease_duration_blocks = 2016;

    let digest =
        sidecar::offer_digest(id, capacity, push_amt, lease_duration_blocks, &sign_pubkey);
    let sig_offer_digest = secp.sign_ecdsa(&Message::from_digest(digest), &sign_sk);

    Ticket {
        id,
        state: TicketState::Offered,
        offer: Offer {
            capacity,
            push_amt,
            lease_duration_blocks,
            sign_pubkey,
            sig_offer_digest,
            auto: true,
        },
        recipient: None,
        order: None,
    }
}

/// A minimal transaction for places that only need a value of the type.
pub fn dummy_tx() -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![],
        output: vec![TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
        }],
    }
}

// ── Stores ──────────────────────────────────────────────────────────

/// In-memory implementation of both store traits.
#[derive(Default)]
pub struct MemoryStore {
    accounts: HashMap<Vec<u8>, Account>,
    tickets: HashMap<[u8; TICKET_KEY_LEN], Ticket>,
    ticket_nonces: HashMap<[u8; TICKET_KEY_LEN], [u8; 32]>,
    bids: HashMap<[u8; 32], Bid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccountStore for MemoryStore {
    fn add_account(&mut self, account: &Account) -> Result<()> {
        let key = account.trader_key.pubkey.serialize().to_vec();
        if self.accounts.contains_key(&key) {
            return Err(Error::AccountExists(account.trader_key.pubkey));
        }
        self.accounts.insert(key, account.clone());
        Ok(())
    }

    fn update_account(
        &mut self,
        account: &mut Account,
        modifiers: &[AccountModifier],
    ) -> Result<()> {
        let key = account.trader_key.pubkey.serialize().to_vec();
        if !self.accounts.contains_key(&key) {
            return Err(Error::AccountNotFound);
        }
        let updated = account::apply_modifiers(account, modifiers);
        self.accounts.insert(key, updated.clone());
        *account = updated;
        Ok(())
    }

    fn account(&mut self, trader_key: &PublicKey) -> Result<Account> {
        self.accounts
            .get(trader_key.serialize().as_slice())
            .cloned()
            .ok_or(Error::AccountNotFound)
    }

    fn accounts(&mut self) -> Result<Vec<Account>> {
        Ok(self.accounts.values().cloned().collect())
    }
}

impl SidecarStore for MemoryStore {
    fn add_sidecar(&mut self, ticket: &Ticket) -> Result<()> {
        let key = ticket.store_key();
        if self.tickets.contains_key(&key) {
            return Err(Error::SidecarExists(ticket.id));
        }
        self.tickets.insert(key, *ticket);
        Ok(())
    }

    fn add_sidecar_with_bid(&mut self, ticket: &Ticket, bid: &Bid) -> Result<()> {
        self.add_sidecar(ticket)?;
        self.ticket_nonces.insert(ticket.store_key(), bid.nonce);
        self.bids.insert(bid.nonce, *bid);
        Ok(())
    }

    fn update_sidecar(&mut self, ticket: &Ticket) -> Result<()> {
        let key = ticket.store_key();
        if !self.tickets.contains_key(&key) {
            return Err(Error::NoSidecarTicket);
        }
        self.tickets.insert(key, *ticket);
        Ok(())
    }

    fn sidecar(&mut self, id: [u8; 8], sign_pubkey: &PublicKey) -> Result<Ticket> {
        self.tickets
            .get(&sidecar::ticket_key(id, sign_pubkey))
            .copied()
            .ok_or(Error::NoSidecarTicket)
    }

    fn sidecars(&mut self) -> Result<Vec<Ticket>> {
        Ok(self.tickets.values().copied().collect())
    }

    fn sidecar_bid_template(&mut self, ticket: &Ticket) -> Result<Bid> {
        let nonce = self
            .ticket_nonces
            .get(&ticket.store_key())
            .ok_or(Error::NoSidecarTicket)?;
        self.bids
            .get(nonce)
            .copied()
            .ok_or(Error::OrderNotFound(*nonce))
    }
}

// ── Wallet ──────────────────────────────────────────────────────────

#[derive(Default)]
struct WalletState {
    next_index: HashMap<u32, u32>,
    transactions: Vec<Transaction>,
    publish_count: HashMap<Txid, u32>,
}

/// Mock wallet over the deterministic test keyring.
#[derive(Default)]
pub struct MockWallet {
    secp: Secp256k1<All>,
    state: Mutex<WalletState>,
}

impl MockWallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the wallet's transaction source, simulating a transaction
    /// broadcast before a restart.
    pub fn seed_transaction(&self, tx: Transaction) {
        self.state.lock().expect("wallet lock").transactions.push(tx);
    }

    /// How often the given transaction has been (re)broadcast.
    pub fn publish_count(&self, txid: &Txid) -> u32 {
        self.state
            .lock()
            .expect("wallet lock")
            .publish_count
            .get(txid)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Wallet for MockWallet {
    async fn derive_next_key(&self, family: u32) -> Result<KeyDescriptor> {
        let mut state = self.state.lock().expect("wallet lock");
        let index = state.next_index.entry(family).or_insert(0);
        let locator = KeyLocator {
            family,
            index: *index,
        };
        *index += 1;

        Ok(KeyDescriptor {
            locator,
            pubkey: derived_seckey(&locator).public_key(&self.secp),
        })
    }

    async fn send_outputs(&self, outputs: &[TxOut], _fee_rate: FeeRate) -> Result<Transaction> {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: dummy_tx().compute_txid(),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: outputs.to_vec(),
        };

        let mut state = self.state.lock().expect("wallet lock");
        state.transactions.push(tx.clone());
        *state.publish_count.entry(tx.compute_txid()).or_insert(0) += 1;
        Ok(tx)
    }

    async fn publish_transaction(&self, tx: &Transaction) -> Result<()> {
        let mut state = self.state.lock().expect("wallet lock");
        let txid = tx.compute_txid();
        if !state.transactions.iter().any(|t| t.compute_txid() == txid) {
            state.transactions.push(tx.clone());
        }
        *state.publish_count.entry(txid).or_insert(0) += 1;
        Ok(())
    }

    async fn next_address(&self) -> Result<Address> {
        let pubkey = CompressedPublicKey(test_seckey(0x7f).public_key(&self.secp));
        Ok(Address::p2wpkh(&pubkey, Network::Regtest))
    }

    async fn list_transactions(&self) -> Result<Vec<Transaction>> {
        Ok(self.state.lock().expect("wallet lock").transactions.clone())
    }
}

// ── Signer ──────────────────────────────────────────────────────────

/// Mock signer over the deterministic test keyring.
#[derive(Default)]
pub struct MockSigner {
    secp: Secp256k1<All>,
}

impl MockSigner {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Signer for MockSigner {
    async fn derive_shared_key(
        &self,
        remote: &PublicKey,
        locator: &KeyLocator,
    ) -> Result<[u8; 32]> {
        let local = derived_seckey(locator);
        let shared_point = remote
            .mul_tweak(&self.secp, &Scalar::from(local))
            .map_err(|e| Error::Signer(format!("ecdh failed: {e}")))?;
        Ok(Sha256::digest(shared_point.serialize()).into())
    }

    async fn sign_output_raw(
        &self,
        tx: &Transaction,
        descriptors: &[SignDescriptor],
    ) -> Result<Vec<Vec<u8>>> {
        let mut sigs = Vec::with_capacity(descriptors.len());
        for desc in descriptors {
            let sighash = SighashCache::new(tx)
                .p2wsh_signature_hash(
                    desc.input_index,
                    &desc.witness_script,
                    desc.output.value,
                    EcdsaSighashType::All,
                )
                .map_err(|e| Error::Signer(format!("sighash failed: {e}")))?;

            let mut seckey = derived_seckey(&desc.key.locator);
            if let Some(tweak) = desc.single_tweak {
                let scalar = Scalar::from_be_bytes(tweak)
                    .map_err(|_| Error::InvalidKeyTweak)?;
                seckey = seckey
                    .add_tweak(&scalar)
                    .map_err(|_| Error::InvalidKeyTweak)?;
            }

            let msg = Message::from_digest(sighash.to_byte_array());
            let sig = self.secp.sign_ecdsa(&msg, &seckey);
            sigs.push(sig.serialize_der().to_vec());
        }
        Ok(sigs)
    }

    async fn sign_digest(&self, locator: &KeyLocator, digest: [u8; 32]) -> Result<[u8; 64]> {
        let seckey = derived_seckey(locator);
        let sig = self
            .secp
            .sign_ecdsa(&Message::from_digest(digest), &seckey);
        Ok(sig.serialize_compact())
    }
}

/// Signs a digest with an explicit secret key, for tests that construct
/// tickets outside the keyring.
pub fn sign_digest_with(secp: &Secp256k1<All>, seckey: &SecretKey, digest: [u8; 32]) -> Signature {
    secp.sign_ecdsa(&Message::from_digest(digest), seckey)
}

// ── Chain notifier ──────────────────────────────────────────────────

#[derive(Default)]
struct NotifierState {
    conf_watchers: HashMap<Txid, Vec<oneshot::Sender<TxConfirmation>>>,
    spend_watchers: HashMap<OutPoint, Vec<oneshot::Sender<SpendDetail>>>,
    block_subscribers: Vec<mpsc::Sender<u32>>,
    best_height: Option<u32>,
}

/// Mock chain notifier with push-style controls for tests.
#[derive(Default)]
pub struct MockChainNotifier {
    state: Mutex<NotifierState>,
}

impl MockChainNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announces a new best block to every epoch subscriber.
    pub async fn push_block(&self, height: u32) {
        let subscribers = {
            let mut state = self.state.lock().expect("notifier lock");
            state.best_height = Some(height);
            state.block_subscribers.clone()
        };
        for subscriber in subscribers {
            let _ = subscriber.send(height).await;
        }
    }

    /// Fires every confirmation watch registered for `txid`.
    pub fn confirm(&self, txid: Txid, conf: TxConfirmation) {
        let watchers = self
            .state
            .lock()
            .expect("notifier lock")
            .conf_watchers
            .remove(&txid)
            .unwrap_or_default();
        for watcher in watchers {
            let _ = watcher.send(conf.clone());
        }
    }

    /// Fires every spend watch registered for `outpoint`.
    pub fn spend(&self, outpoint: OutPoint, detail: SpendDetail) {
        let watchers = self
            .state
            .lock()
            .expect("notifier lock")
            .spend_watchers
            .remove(&outpoint)
            .unwrap_or_default();
        for watcher in watchers {
            let _ = watcher.send(detail.clone());
        }
    }

    /// Whether a confirmation watch is currently registered for `txid`.
    pub fn has_conf_watch(&self, txid: &Txid) -> bool {
        self.state
            .lock()
            .expect("notifier lock")
            .conf_watchers
            .contains_key(txid)
    }

    /// Whether a spend watch is currently registered for `outpoint`.
    pub fn has_spend_watch(&self, outpoint: &OutPoint) -> bool {
        self.state
            .lock()
            .expect("notifier lock")
            .spend_watchers
            .contains_key(outpoint)
    }
}

#[async_trait]
impl ChainNotifier for MockChainNotifier {
    async fn register_conf(
        &self,
        txid: Txid,
        _script: ScriptBuf,
        _num_confs: u32,
        _height_hint: u32,
    ) -> Result<oneshot::Receiver<TxConfirmation>> {
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .expect("notifier lock")
            .conf_watchers
            .entry(txid)
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn register_spend(
        &self,
        outpoint: OutPoint,
        _script: ScriptBuf,
        _height_hint: u32,
    ) -> Result<oneshot::Receiver<SpendDetail>> {
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .expect("notifier lock")
            .spend_watchers
            .entry(outpoint)
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn register_block_epoch(&self) -> Result<mpsc::Receiver<u32>> {
        let (tx, rx) = mpsc::channel(16);
        let best_height = {
            let mut state = self.state.lock().expect("notifier lock");
            state.block_subscribers.push(tx.clone());
            state.best_height
        };
        // New subscribers start at the current tip.
        if let Some(height) = best_height {
            let _ = tx.send(height).await;
        }
        Ok(rx)
    }
}

// ── Auctioneer ──────────────────────────────────────────────────────

#[derive(Default)]
struct AuctioneerState {
    init_accounts: Vec<PublicKey>,
    subscriptions: Vec<PublicKey>,
    key_subscriptions: Vec<PublicKey>,
    submitted_orders: Vec<[u8; 32]>,
}

/// Mock auctioneer tracking every interaction.
pub struct MockAuctioneer {
    secp: Secp256k1<All>,
    auctioneer_seckey: SecretKey,
    batch_seckey: SecretKey,
    state: Mutex<AuctioneerState>,
}

impl Default for MockAuctioneer {
    fn default() -> Self {
        MockAuctioneer {
            secp: Secp256k1::new(),
            auctioneer_seckey: test_seckey(0xa1),
            batch_seckey: test_seckey(0xa2),
            state: Mutex::new(AuctioneerState::default()),
        }
    }
}

impl MockAuctioneer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_accounts(&self) -> Vec<PublicKey> {
        self.state
            .lock()
            .expect("auctioneer lock")
            .init_accounts
            .clone()
    }

    pub fn subscriptions(&self) -> Vec<PublicKey> {
        self.state
            .lock()
            .expect("auctioneer lock")
            .subscriptions
            .clone()
    }

    pub fn key_subscriptions(&self) -> Vec<PublicKey> {
        self.state
            .lock()
            .expect("auctioneer lock")
            .key_subscriptions
            .clone()
    }

    pub fn submitted_orders(&self) -> Vec<[u8; 32]> {
        self.state
            .lock()
            .expect("auctioneer lock")
            .submitted_orders
            .clone()
    }
}

#[async_trait]
impl Auctioneer for MockAuctioneer {
    async fn reserve_account(&self) -> Result<Reservation> {
        Ok(Reservation {
            auctioneer_key: self.auctioneer_seckey.public_key(&self.secp),
            initial_batch_key: self.batch_seckey.public_key(&self.secp),
        })
    }

    async fn init_account(&self, account: &Account) -> Result<()> {
        self.state
            .lock()
            .expect("auctioneer lock")
            .init_accounts
            .push(account.trader_key.pubkey);
        Ok(())
    }

    async fn subscribe_account_updates(&self, account: &Account) -> Result<()> {
        self.state
            .lock()
            .expect("auctioneer lock")
            .subscriptions
            .push(account.trader_key.pubkey);
        Ok(())
    }

    async fn start_key_subscription(&self, key: &KeyDescriptor) -> Result<()> {
        self.state
            .lock()
            .expect("auctioneer lock")
            .key_subscriptions
            .push(key.pubkey);
        Ok(())
    }

    async fn close_account(&self, _trader_key: &PublicKey, _outputs: &[TxOut]) -> Result<Vec<u8>> {
        // Structure-only signature; the tests never validate it against the
        // script.
        let mut sig = vec![0x30; 71];
        sig.push(EcdsaSighashType::All as u8);
        Ok(sig)
    }

    async fn submit_order(&self, bid: &Bid, _account_key: &PublicKey) -> Result<()> {
        let mut state = self.state.lock().expect("auctioneer lock");
        if state.submitted_orders.contains(&bid.nonce) {
            return Err(Error::OrderExists(bid.nonce));
        }
        state.submitted_orders.push(bid.nonce);
        Ok(())
    }

    async fn terms(&self) -> Result<AuctionTerms> {
        Ok(AuctionTerms {
            max_order_duration_blocks: 365 * 144,
        })
    }
}

// ── Funding manager ─────────────────────────────────────────────────

/// Mock funding manager recording the tickets it was told to expect.
#[derive(Default)]
pub struct MockFundingManager {
    expected: Mutex<Vec<[u8; 8]>>,
}

impl MockFundingManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expected_tickets(&self) -> Vec<[u8; 8]> {
        self.expected.lock().expect("funding lock").clone()
    }
}

#[async_trait]
impl FundingManager for MockFundingManager {
    async fn expect_channel(&self, ticket: &Ticket) -> Result<()> {
        self.expected.lock().expect("funding lock").push(ticket.id);
        Ok(())
    }
}
