//! Account lifecycle manager.
//!
//! Drives every account from creation through funding, confirmation and
//! close. All state transitions are checkpointed in the store before any
//! further effect, so a restart resumes from durable state alone: one resume
//! routine dispatches on the persisted state and walks forward through the
//! lifecycle steps, both at startup and after creating a new account.

use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, EcdsaSighashType, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::account::watcher::{self, EventHandler, WatcherHandle};
use crate::account::{Account, AccountModifier, AccountState, AccountStore};
use crate::clients::{
    Auctioneer, ChainNotifier, SignDescriptor, Signer, SpendDetail, TxConfirmation, Wallet,
    ACCOUNT_KEY_FAMILY,
};
use crate::error::{Error, Result};
use crate::script::{self, WitnessKind, FEE_RATE_FLOOR};

/// Thresholds at both extremes for the number of confirmations required
/// before an account is considered open.
pub const MIN_CONFS: u32 = 3;
pub const MAX_CONFS: u32 = 6;

/// Thresholds at both extremes for valid account values. The maximum is
/// based on the maximum channel size plus some leeway for chain fees.
pub const MIN_ACCOUNT_VALUE: Amount = Amount::from_sat(100_000);
pub const MAX_ACCOUNT_VALUE: Amount = Amount::from_sat(100_000 + (1 << 24) - 1);

/// Thresholds at both extremes for valid account expirations, relative to
/// the current height. One day to one year worth of blocks.
pub const MIN_ACCOUNT_EXPIRY: u32 = 144;
pub const MAX_ACCOUNT_EXPIRY: u32 = 144 * 365;

/// Length of a P2WPKH output script, for close fee estimation.
const P2WPKH_SCRIPT_LEN: usize = 22;

/// External dependencies of the [`Manager`].
pub struct ManagerConfig<S> {
    /// Durable account storage, shared with the rest of the trader.
    pub store: Arc<Mutex<S>>,

    /// On-chain wallet used to fund accounts and broadcast transactions.
    pub wallet: Arc<dyn Wallet>,

    /// Signer for account spends and the trader/auctioneer shared secret.
    pub signer: Arc<dyn Signer>,

    /// The auctioneer's account surface.
    pub auctioneer: Arc<dyn Auctioneer>,

    /// Chain event subscriptions, consumed through the watcher.
    pub notifier: Arc<dyn ChainNotifier>,
}

/// Manages the on-chain lifecycle of all accounts.
pub struct Manager<S> {
    core: Arc<ManagerCore<S>>,
    shutdown_tx: watch::Sender<bool>,
    watcher_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: AccountStore + 'static> Manager<S> {
    pub fn new(cfg: ManagerConfig<S>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Manager {
            core: Arc::new(ManagerCore {
                secp: Secp256k1::new(),
                cfg,
                watcher: OnceLock::new(),
            }),
            shutdown_tx,
            watcher_task: Mutex::new(None),
        }
    }

    /// Starts the watcher and resumes every stored account.
    pub async fn start(&self) -> Result<()> {
        let handler: Arc<dyn EventHandler> = self.core.clone();
        let (handle, task) = watcher::spawn(
            self.core.cfg.notifier.clone(),
            handler,
            self.shutdown_tx.subscribe(),
        )
        .await?;
        let _ = self.core.watcher.set(handle);
        *self.watcher_task.lock().expect("watcher task lock") = Some(task);

        let accounts = self.core.with_store(|store| store.accounts())?;
        for mut account in accounts {
            let trader_key = account.trader_key.pubkey;
            self.core
                .resume_account(&mut account, true)
                .await
                .map_err(|e| {
                    log::error!(
                        "unable to resume account {}: {e}",
                        hex::encode(trader_key.serialize()),
                    );
                    e
                })?;
        }

        Ok(())
    }

    /// Signals shutdown and waits for the watcher to drain.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.watcher_task.lock().expect("watcher task lock").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Creates a new account: derives a fresh trader key, reserves keys with
    /// the auctioneer, persists the intent and funds the account output.
    pub async fn init_account(
        &self,
        value: Amount,
        expiry: u32,
        best_height: u32,
    ) -> Result<Account> {
        validate_account_params(value, expiry, best_height)?;

        let core = &self.core;
        let trader_key = core.cfg.wallet.derive_next_key(ACCOUNT_KEY_FAMILY).await?;
        let reservation = core.cfg.auctioneer.reserve_account().await?;

        // Both base keys feed an ECDH secret so only the two parties can
        // recognize the account's outputs across batches.
        let secret = core
            .cfg
            .signer
            .derive_shared_key(&reservation.auctioneer_key, &trader_key.locator)
            .await?;

        let mut account = Account {
            value,
            expiry,
            trader_key,
            auctioneer_key: reservation.auctioneer_key,
            batch_key: reservation.initial_batch_key,
            secret,
            state: AccountState::Initiated,
            height_hint: best_height,
            outpoint: None,
            close_tx: None,
        };
        core.with_store(|store| store.add_account(&account))?;

        log::info!(
            "creating new account {} of {} that expires at height {expiry}",
            hex::encode(trader_key.pubkey.serialize()),
            value,
        );

        core.resume_account(&mut account, false).await?;
        Ok(account)
    }

    /// Closes the account associated with `trader_key`, spending it through
    /// the expiration path when available and the cooperative multisig path
    /// otherwise. With an empty `close_outputs` list the account is swept to
    /// a single wallet-controlled P2WPKH output.
    pub async fn close_account(
        &self,
        trader_key: &PublicKey,
        close_outputs: Vec<TxOut>,
        best_height: u32,
    ) -> Result<Transaction> {
        let core = &self.core;
        let mut account = core.with_store(|store| store.account(trader_key))?;

        if matches!(
            account.state,
            AccountState::PendingClosed | AccountState::Closed,
        ) {
            return Err(Error::AccountAlreadyClosed);
        }

        let close_tx =
            if account.state == AccountState::Expired || best_height >= account.expiry {
                core.close_account_expiry(&account, close_outputs, best_height)
                    .await?
            } else {
                core.close_account_multi_sig(&account, close_outputs).await?
            };

        sanity_check_close_tx(&account, &close_tx)?;

        log::info!(
            "closing account {} with transaction {}",
            hex::encode(trader_key.serialize()),
            close_tx.compute_txid(),
        );

        core.with_store(|store| {
            store.update_account(
                &mut account,
                &[
                    AccountModifier::State(AccountState::PendingClosed),
                    AccountModifier::CloseTx(close_tx.clone()),
                ],
            )
        })?;
        core.cfg.wallet.publish_transaction(&close_tx).await?;

        Ok(close_tx)
    }

    /// All stored accounts.
    pub fn accounts(&self) -> Result<Vec<Account>> {
        self.core.with_store(|store| store.accounts())
    }

    /// Looks up a single account by trader key.
    pub fn account(&self, trader_key: &PublicKey) -> Result<Account> {
        self.core.with_store(|store| store.account(trader_key))
    }
}

struct ManagerCore<S> {
    secp: Secp256k1<All>,
    cfg: ManagerConfig<S>,
    watcher: OnceLock<WatcherHandle>,
}

/// The lifecycle steps a resume call walks through. Early steps explicitly
/// continue into the next one once their checkpoint is durable.
enum ResumeStep {
    Initiated,
    PendingOpen,
    Open,
    Expired,
    PendingClosed,
    Done,
}

impl<S: AccountStore> ManagerCore<S> {
    fn with_store<R>(&self, f: impl FnOnce(&mut S) -> Result<R>) -> Result<R> {
        let mut store = self
            .cfg
            .store
            .lock()
            .map_err(|_| Error::Store("store lock poisoned".into()))?;
        f(&mut store)
    }

    fn watcher(&self) -> Result<&WatcherHandle> {
        self.watcher.get().ok_or(Error::WatcherShutdown)
    }

    /// Single reentry point consolidating startup resume and normal
    /// operation. Dispatches on the account's durable state and walks
    /// forward step by step.
    async fn resume_account(&self, account: &mut Account, on_restart: bool) -> Result<()> {
        let mut step = match account.state {
            AccountState::Initiated => ResumeStep::Initiated,
            AccountState::PendingOpen => ResumeStep::PendingOpen,
            AccountState::Open => ResumeStep::Open,
            AccountState::Expired => ResumeStep::Expired,
            AccountState::PendingClosed => ResumeStep::PendingClosed,
            AccountState::Closed => ResumeStep::Done,
        };

        loop {
            step = match step {
                ResumeStep::Initiated => {
                    self.resume_initiated(account, on_restart).await?;
                    ResumeStep::PendingOpen
                }
                ResumeStep::PendingOpen => {
                    self.resume_pending_open(account, on_restart).await?;
                    ResumeStep::Open
                }
                ResumeStep::Open => {
                    self.resume_open(account).await?;
                    ResumeStep::Done
                }
                ResumeStep::Expired => {
                    self.watch_spend(account).await?;
                    ResumeStep::Done
                }
                ResumeStep::PendingClosed => {
                    self.resume_pending_closed(account).await?;
                    ResumeStep::Done
                }
                ResumeStep::Done => return Ok(()),
            };
        }
    }

    /// Funds the account, either by adopting a transaction found in the
    /// wallet (after a restart) or by creating a new one, then records the
    /// funding outpoint.
    async fn resume_initiated(&self, account: &mut Account, on_restart: bool) -> Result<()> {
        let account_output = account.output(&self.secp)?;

        let mut account_tx = None;
        if on_restart {
            // Don't fund twice: a transaction paying the exact script and
            // value may already have been broadcast before the crash.
            match self.locate_tx_by_output(&account_output).await {
                Ok(tx) => account_tx = Some(tx),
                Err(Error::TxNotFound) => {}
                Err(e) => return Err(e),
            }
        }

        let account_tx = match account_tx {
            Some(tx) => tx,
            None => {
                let tx = self
                    .cfg
                    .wallet
                    .send_outputs(std::slice::from_ref(&account_output), FEE_RATE_FLOOR)
                    .await?;
                log::info!(
                    "funded new account {} with transaction {}",
                    hex::encode(account.trader_key.pubkey.serialize()),
                    tx.compute_txid(),
                );
                tx
            }
        };

        let output_index =
            script::locate_output_script(&account_tx, &account_output.script_pubkey)
                .ok_or_else(|| Error::ScriptNotFound(account_tx.compute_txid()))?;
        let outpoint = OutPoint {
            txid: account_tx.compute_txid(),
            vout: output_index,
        };

        self.with_store(|store| {
            store.update_account(
                account,
                &[
                    AccountModifier::State(AccountState::PendingOpen),
                    AccountModifier::OutPoint(outpoint),
                ],
            )
        })
    }

    /// Rebroadcasts the funding transaction if necessary, announces the
    /// account to the auctioneer and watches for confirmation.
    async fn resume_pending_open(&self, account: &mut Account, on_restart: bool) -> Result<()> {
        let outpoint = account.outpoint.ok_or(Error::MissingOutPoint)?;

        if on_restart {
            let account_tx = self.locate_tx_by_hash(outpoint.txid).await?;
            self.cfg.wallet.publish_transaction(&account_tx).await?;
        }

        self.cfg.auctioneer.init_account(account).await?;

        let num_confs = num_confs_for_value(account.value);
        log::info!(
            "waiting for {num_confs} confirmation(s) of account {}",
            hex::encode(account.trader_key.pubkey.serialize()),
        );
        self.watcher()?
            .watch_account_conf(
                account.trader_key.pubkey,
                outpoint.txid,
                account.output_script(&self.secp)?,
                num_confs,
                account.height_hint,
            )
            .await
    }

    /// Watches an open account for its spend and expiration and subscribes
    /// to server-side updates for it.
    async fn resume_open(&self, account: &Account) -> Result<()> {
        log::info!(
            "watching account {} for spend and expiration",
            hex::encode(account.trader_key.pubkey.serialize()),
        );
        self.watch_spend(account).await?;
        self.watcher()?
            .watch_account_expiration(account.trader_key.pubkey, account.expiry)
            .await?;

        // Signing happens on the account level, so one subscription covers
        // all of the account's orders.
        self.cfg.auctioneer.subscribe_account_updates(account).await
    }

    /// Rebroadcasts a pending close and waits for the spend to confirm.
    async fn resume_pending_closed(&self, account: &Account) -> Result<()> {
        let close_tx = account.close_tx.as_ref().ok_or(Error::MissingCloseTx)?;
        self.cfg.wallet.publish_transaction(close_tx).await?;
        self.watch_spend(account).await
    }

    async fn watch_spend(&self, account: &Account) -> Result<()> {
        let outpoint = account.outpoint.ok_or(Error::MissingOutPoint)?;
        self.watcher()?
            .watch_account_spend(
                account.trader_key.pubkey,
                outpoint,
                account.output_script(&self.secp)?,
                account.height_hint,
            )
            .await
    }

    /// Finds a wallet transaction containing an output that pays `output`'s
    /// script with its exact value.
    async fn locate_tx_by_output(&self, output: &TxOut) -> Result<Transaction> {
        let txs = self.cfg.wallet.list_transactions().await?;
        for tx in txs {
            let Some(idx) = script::locate_output_script(&tx, &output.script_pubkey) else {
                continue;
            };
            if tx.output[idx as usize].value == output.value {
                return Ok(tx);
            }
        }
        Err(Error::TxNotFound)
    }

    async fn locate_tx_by_hash(&self, txid: bitcoin::Txid) -> Result<Transaction> {
        let txs = self.cfg.wallet.list_transactions().await?;
        txs.into_iter()
            .find(|tx| tx.compute_txid() == txid)
            .ok_or(Error::TxNotFound)
    }

    /// Builds and signs a close through the expiration path. `best_height`
    /// becomes the lock time to satisfy the CHECKLOCKTIMEVERIFY branch.
    async fn close_account_expiry(
        &self,
        account: &Account,
        close_outputs: Vec<TxOut>,
        best_height: u32,
    ) -> Result<Transaction> {
        let (mut tx, witness_script, trader_sig) = self
            .create_close_tx(account, WitnessKind::Expiry, close_outputs, best_height)
            .await?;

        tx.input[0].witness = script::spend_expiry(&witness_script, &trader_sig);
        Ok(tx)
    }

    /// Builds and signs a cooperative close through the multisig path,
    /// obtaining the auctioneer's signature along the way.
    async fn close_account_multi_sig(
        &self,
        account: &Account,
        close_outputs: Vec<TxOut>,
    ) -> Result<Transaction> {
        let (mut tx, witness_script, trader_sig) = self
            .create_close_tx(account, WitnessKind::MultiSig, close_outputs, 0)
            .await?;

        let auctioneer_sig = self
            .cfg
            .auctioneer
            .close_account(&account.trader_key.pubkey, &tx.output)
            .await?;

        tx.input[0].witness =
            script::spend_multi_sig(&witness_script, &trader_sig, &auctioneer_sig);
        Ok(tx)
    }

    /// Crafts the unsigned close skeleton for the given witness type and
    /// produces the trader's signature for it.
    async fn create_close_tx(
        &self,
        account: &Account,
        kind: WitnessKind,
        mut close_outputs: Vec<TxOut>,
        best_height: u32,
    ) -> Result<(Transaction, ScriptBuf, Vec<u8>)> {
        let outpoint = account.outpoint.ok_or(Error::MissingOutPoint)?;

        // Without explicit outputs the account is swept to a fresh wallet
        // output, with the fee taken out of the account value.
        if close_outputs.is_empty() {
            close_outputs.push(self.wallet_output(account.value, kind).await?);
        }

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::from_consensus(best_height),
            input: vec![TxIn {
                previous_output: outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
                witness: Witness::new(),
            }],
            output: close_outputs,
        };

        let trader_key_tweak = script::trader_key_tweak(
            &account.batch_key,
            &account.secret,
            &account.trader_key.pubkey,
        );
        let witness_script = account.witness_script(&self.secp)?;
        let sign_desc = SignDescriptor {
            key: account.trader_key,
            single_tweak: Some(trader_key_tweak),
            witness_script: witness_script.clone(),
            output: account.output(&self.secp)?,
            input_index: 0,
        };

        let sigs = self
            .cfg
            .signer
            .sign_output_raw(&tx, std::slice::from_ref(&sign_desc))
            .await?;

        // The signer strips the sighash flag, re-append it.
        let mut trader_sig = sigs
            .into_iter()
            .next()
            .ok_or_else(|| Error::Signer("no signature returned".into()))?;
        trader_sig.push(EcdsaSighashType::All as u8);

        Ok((tx, witness_script, trader_sig))
    }

    /// An output under the backing wallet's control sweeping the account
    /// value minus the close fee for the given witness type.
    async fn wallet_output(&self, account_value: Amount, kind: WitnessKind) -> Result<TxOut> {
        let fee = script::close_tx_fee(kind, [P2WPKH_SCRIPT_LEN], FEE_RATE_FLOOR)?;
        let output_value = account_value
            .checked_sub(fee)
            .filter(|value| *value > Amount::ZERO)
            .ok_or(Error::InsufficientValue {
                value: account_value,
                fee,
            })?;

        let addr = self.cfg.wallet.next_address().await?;
        Ok(TxOut {
            value: output_value,
            script_pubkey: addr.script_pubkey(),
        })
    }
}

#[async_trait]
impl<S: AccountStore> EventHandler for ManagerCore<S> {
    async fn handle_account_conf(
        &self,
        trader_key: PublicKey,
        conf: TxConfirmation,
    ) -> Result<()> {
        let mut account = self.with_store(|store| store.account(&trader_key))?;

        // If the account confirms at the same height as it expires, let the
        // expiry notification drive the state instead, independent of the
        // order the two notifications arrive in.
        if conf.block_height == account.expiry {
            return Ok(());
        }

        // A late confirmation must not resurrect an account that was closed
        // before it opened.
        if account.state != AccountState::PendingOpen {
            return Ok(());
        }

        log::info!(
            "account {} is now confirmed at height {}!",
            hex::encode(trader_key.serialize()),
            conf.block_height,
        );

        self.with_store(|store| {
            store.update_account(&mut account, &[AccountModifier::State(AccountState::Open)])
        })
    }

    async fn handle_account_spend(
        &self,
        trader_key: PublicKey,
        spend: SpendDetail,
    ) -> Result<()> {
        let mut account = self.with_store(|store| store.account(&trader_key))?;

        let spend_tx = &spend.spending_tx;
        let witness = &spend_tx.input[spend.spender_input_index].witness;

        if script::is_expiry_spend(witness) {
            // The expiration path always ends the account; all funds have
            // been withdrawn.
        } else if script::is_multisig_spend(witness) {
            // A multisig spend is either a matched order or a close. A
            // matched order recreates the account under the next batch key;
            // the batch subsystem updates our record atomically with the
            // order state, so nothing to do here.
            let next_script = account.next_output_script(&self.secp)?;
            if script::locate_output_script(spend_tx, &next_script).is_some() {
                return Ok(());
            }
        } else {
            return Err(Error::UnknownSpendWitness);
        }

        log::info!(
            "account {} has been closed on-chain with transaction {}",
            hex::encode(trader_key.serialize()),
            spend_tx.compute_txid(),
        );

        // Record the spending transaction again in case our own broadcast
        // was replaced by a fee-bumped variant.
        self.with_store(|store| {
            store.update_account(
                &mut account,
                &[
                    AccountModifier::State(AccountState::Closed),
                    AccountModifier::CloseTx(spend_tx.clone()),
                ],
            )
        })
    }

    async fn handle_account_expiry(&self, trader_key: PublicKey) -> Result<()> {
        let mut account = self.with_store(|store| store.account(&trader_key))?;

        // An account already closing (or closed) stays that way.
        if matches!(
            account.state,
            AccountState::PendingClosed | AccountState::Closed,
        ) {
            return Ok(());
        }

        log::info!(
            "account {} has expired as of height {}",
            hex::encode(trader_key.serialize()),
            account.expiry,
        );

        self.with_store(|store| {
            store.update_account(
                &mut account,
                &[AccountModifier::State(AccountState::Expired)],
            )
        })
    }
}

/// Ensures the caller provided sane parameters for a new account.
pub fn validate_account_params(value: Amount, expiry: u32, best_height: u32) -> Result<()> {
    if value < MIN_ACCOUNT_VALUE {
        return Err(Error::MinAccountValue(MIN_ACCOUNT_VALUE));
    }
    if value > MAX_ACCOUNT_VALUE {
        return Err(Error::MaxAccountValue(MAX_ACCOUNT_VALUE));
    }
    if expiry < best_height + MIN_ACCOUNT_EXPIRY {
        return Err(Error::MinAccountExpiry(best_height + MIN_ACCOUNT_EXPIRY));
    }
    if expiry > best_height + MAX_ACCOUNT_EXPIRY {
        return Err(Error::MaxAccountExpiry(best_height + MAX_ACCOUNT_EXPIRY));
    }
    Ok(())
}

/// Number of confirmations to require before opening an account, scaled by
/// its value and clamped to `[MIN_CONFS, MAX_CONFS]`.
pub fn num_confs_for_value(value: Amount) -> u32 {
    let confs = u64::from(MAX_CONFS) * value.to_sat() / MAX_ACCOUNT_VALUE.to_sat();
    (confs as u32).clamp(MIN_CONFS, MAX_CONFS)
}

/// Structural checks on a crafted close transaction before it is persisted
/// and broadcast.
fn sanity_check_close_tx(account: &Account, tx: &Transaction) -> Result<()> {
    let outpoint = account.outpoint.ok_or(Error::MissingOutPoint)?;

    if tx.input.len() != 1 {
        return Err(Error::InvalidCloseTx(format!(
            "expected 1 input, got {}",
            tx.input.len(),
        )));
    }
    if tx.input[0].previous_output != outpoint {
        return Err(Error::InvalidCloseTx(
            "input does not spend the account outpoint".into(),
        ));
    }
    if tx.output.is_empty() {
        return Err(Error::InvalidCloseTx("no outputs".into()));
    }

    let total_out: Amount = tx.output.iter().map(|txo| txo.value).sum();
    if total_out > account.value {
        return Err(Error::InvalidCloseTx(format!(
            "outputs pay {total_out}, account only holds {}",
            account.value,
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_params_bounds() {
        let height = 700_000;

        assert!(validate_account_params(MIN_ACCOUNT_VALUE, height + 144, height).is_ok());
        assert!(validate_account_params(MAX_ACCOUNT_VALUE, height + 144, height).is_ok());

        assert!(matches!(
            validate_account_params(Amount::from_sat(99_999), height + 144, height),
            Err(Error::MinAccountValue(_)),
        ));
        assert!(matches!(
            validate_account_params(
                MAX_ACCOUNT_VALUE + Amount::from_sat(1),
                height + 144,
                height,
            ),
            Err(Error::MaxAccountValue(_)),
        ));
        assert!(matches!(
            validate_account_params(MIN_ACCOUNT_VALUE, height + 143, height),
            Err(Error::MinAccountExpiry(_)),
        ));
        assert!(matches!(
            validate_account_params(MIN_ACCOUNT_VALUE, height + MAX_ACCOUNT_EXPIRY + 1, height),
            Err(Error::MaxAccountExpiry(_)),
        ));
    }

    #[test]
    fn num_confs_monotone_and_clamped() {
        let mut last = 0;
        for sats in (MIN_ACCOUNT_VALUE.to_sat()..=MAX_ACCOUNT_VALUE.to_sat())
            .step_by(1 << 20)
            .chain([MAX_ACCOUNT_VALUE.to_sat()])
        {
            let confs = num_confs_for_value(Amount::from_sat(sats));
            assert!((MIN_CONFS..=MAX_CONFS).contains(&confs));
            assert!(confs >= last);
            last = confs;
        }

        assert_eq!(num_confs_for_value(MIN_ACCOUNT_VALUE), MIN_CONFS);
        assert_eq!(num_confs_for_value(MAX_ACCOUNT_VALUE), MAX_CONFS);
    }
}
