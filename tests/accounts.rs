//! Account lifecycle integration tests against the in-memory backends.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chanlease_sdk::bitcoin::secp256k1::{PublicKey, Secp256k1};
use chanlease_sdk::bitcoin::{Amount, OutPoint, Transaction, TxIn, TxOut, Witness};
use chanlease_sdk::script::{self, WitnessKind, FEE_RATE_FLOOR};
use chanlease_sdk::testing::{
    MemoryStore, MockAuctioneer, MockChainNotifier, MockSigner, MockWallet,
};
use chanlease_sdk::{
    AccountState, AccountStore, Error, Manager, ManagerConfig, SpendDetail, TxConfirmation,
    Wallet,
};

const BEST_HEIGHT: u32 = 700_000;
const EXPIRY: u32 = 701_000;

struct Harness {
    manager: Manager<MemoryStore>,
    store: Arc<Mutex<MemoryStore>>,
    wallet: Arc<MockWallet>,
    signer: Arc<MockSigner>,
    auctioneer: Arc<MockAuctioneer>,
    notifier: Arc<MockChainNotifier>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(Mutex::new(MemoryStore::new()));
        let wallet = Arc::new(MockWallet::new());
        let signer = Arc::new(MockSigner::new());
        let auctioneer = Arc::new(MockAuctioneer::new());
        let notifier = Arc::new(MockChainNotifier::new());

        let manager = Manager::new(ManagerConfig {
            store: store.clone(),
            wallet: wallet.clone(),
            signer: signer.clone(),
            auctioneer: auctioneer.clone(),
            notifier: notifier.clone(),
        });

        Harness {
            manager,
            store,
            wallet,
            signer,
            auctioneer,
            notifier,
        }
    }

    /// A second manager over the same store and backends, simulating a
    /// process restart.
    fn restarted(&self) -> Manager<MemoryStore> {
        Manager::new(ManagerConfig {
            store: self.store.clone(),
            wallet: self.wallet.clone(),
            signer: self.signer.clone(),
            auctioneer: self.auctioneer.clone(),
            notifier: self.notifier.clone(),
        })
    }

    fn stored_state(&self, trader_key: &PublicKey) -> AccountState {
        self.store
            .lock()
            .unwrap()
            .account(trader_key)
            .unwrap()
            .state
    }

    async fn wait_for_state(&self, trader_key: &PublicKey, state: AccountState) {
        for _ in 0..100 {
            if self.stored_state(trader_key) == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "account never reached {state}, still {}",
            self.stored_state(trader_key),
        );
    }
}

#[tokio::test]
async fn init_account_funds_and_records_outpoint() {
    let harness = Harness::new();
    harness.manager.start().await.unwrap();

    let account = harness
        .manager
        .init_account(Amount::from_sat(500_000), EXPIRY, BEST_HEIGHT)
        .await
        .unwrap();

    // The funding transaction pays the account script at the recorded
    // index.
    let secp = Secp256k1::new();
    let script = account.output_script(&secp).unwrap();
    let outpoint = account.outpoint.expect("outpoint set");

    let txs = harness.wallet.list_transactions().await.unwrap();
    let funding_tx = txs
        .iter()
        .find(|tx| tx.compute_txid() == outpoint.txid)
        .expect("funding tx broadcast");
    assert_eq!(
        script::locate_output_script(funding_tx, &script),
        Some(outpoint.vout),
    );
    assert_eq!(
        funding_tx.output[outpoint.vout as usize].value,
        Amount::from_sat(500_000),
    );

    assert_eq!(
        harness.stored_state(&account.trader_key.pubkey),
        AccountState::PendingOpen,
    );

    // The auctioneer learned about the account and a confirmation watch is
    // armed.
    assert_eq!(
        harness.auctioneer.init_accounts(),
        vec![account.trader_key.pubkey],
    );
    assert!(harness.notifier.has_conf_watch(&outpoint.txid));
}

#[tokio::test]
async fn init_account_rejects_bad_params() {
    let harness = Harness::new();
    harness.manager.start().await.unwrap();

    let result = harness
        .manager
        .init_account(Amount::from_sat(1_000), EXPIRY, BEST_HEIGHT)
        .await;
    assert!(matches!(result, Err(Error::MinAccountValue(_))));

    let result = harness
        .manager
        .init_account(Amount::from_sat(500_000), BEST_HEIGHT + 10, BEST_HEIGHT)
        .await;
    assert!(matches!(result, Err(Error::MinAccountExpiry(_))));
}

#[tokio::test]
async fn restart_in_pending_open_rebroadcasts_once() {
    let harness = Harness::new();
    harness.manager.start().await.unwrap();

    let account = harness
        .manager
        .init_account(Amount::from_sat(500_000), EXPIRY, BEST_HEIGHT)
        .await
        .unwrap();
    let funding_txid = account.outpoint.unwrap().txid;
    let publishes_before = harness.wallet.publish_count(&funding_txid);

    harness.manager.stop().await;

    let restarted = harness.restarted();
    restarted.start().await.unwrap();

    // Exactly one rebroadcast, a fresh confirmation watch, and no state
    // advance.
    assert_eq!(
        harness.wallet.publish_count(&funding_txid),
        publishes_before + 1,
    );
    assert!(harness.notifier.has_conf_watch(&funding_txid));
    assert_eq!(
        harness.stored_state(&account.trader_key.pubkey),
        AccountState::PendingOpen,
    );
}

#[tokio::test]
async fn confirmation_opens_account() {
    let harness = Harness::new();
    harness.manager.start().await.unwrap();

    let account = harness
        .manager
        .init_account(Amount::from_sat(500_000), EXPIRY, BEST_HEIGHT)
        .await
        .unwrap();

    harness.notifier.confirm(
        account.outpoint.unwrap().txid,
        TxConfirmation {
            block_height: BEST_HEIGHT + 3,
            tx: chanlease_sdk::testing::dummy_tx(),
        },
    );

    harness
        .wait_for_state(&account.trader_key.pubkey, AccountState::Open)
        .await;
    assert_eq!(
        harness.auctioneer.subscriptions(),
        vec![account.trader_key.pubkey],
    );
}

#[tokio::test]
async fn confirmation_at_expiry_height_defers_to_expiry() {
    let harness = Harness::new();
    harness.manager.start().await.unwrap();

    let account = harness
        .manager
        .init_account(Amount::from_sat(500_000), EXPIRY, BEST_HEIGHT)
        .await
        .unwrap();

    // The confirmation lands exactly at the expiry height: it must not open
    // the account.
    harness.notifier.confirm(
        account.outpoint.unwrap().txid,
        TxConfirmation {
            block_height: EXPIRY,
            tx: chanlease_sdk::testing::dummy_tx(),
        },
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        harness.stored_state(&account.trader_key.pubkey),
        AccountState::PendingOpen,
    );

    // The expiry notification drives the state instead.
    harness.notifier.push_block(EXPIRY).await;
    harness
        .wait_for_state(&account.trader_key.pubkey, AccountState::Expired)
        .await;
}

/// Builds a spending transaction for the account outpoint with the given
/// witness and outputs.
fn spend_tx(outpoint: OutPoint, witness: Witness, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: chanlease_sdk::bitcoin::transaction::Version::TWO,
        lock_time: chanlease_sdk::bitcoin::absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: Default::default(),
            sequence: chanlease_sdk::bitcoin::Sequence::MAX,
            witness,
        }],
        output: outputs,
    }
}

#[tokio::test]
async fn multisig_spend_recreating_output_keeps_account_open() {
    let harness = Harness::new();
    harness.manager.start().await.unwrap();

    let account = harness
        .manager
        .init_account(Amount::from_sat(500_000), EXPIRY, BEST_HEIGHT)
        .await
        .unwrap();
    harness.notifier.confirm(
        account.outpoint.unwrap().txid,
        TxConfirmation {
            block_height: BEST_HEIGHT + 3,
            tx: chanlease_sdk::testing::dummy_tx(),
        },
    );
    harness
        .wait_for_state(&account.trader_key.pubkey, AccountState::Open)
        .await;

    let secp = Secp256k1::new();
    let witness_script = account.witness_script(&secp).unwrap();
    let sig = vec![0x30; 72];

    // A batch execution spends the account and recreates it under the next
    // batch key.
    let batch_tx = spend_tx(
        account.outpoint.unwrap(),
        script::spend_multi_sig(&witness_script, &sig, &sig),
        vec![TxOut {
            value: Amount::from_sat(400_000),
            script_pubkey: account.next_output_script(&secp).unwrap(),
        }],
    );
    harness.notifier.spend(
        account.outpoint.unwrap(),
        SpendDetail {
            spending_tx: batch_tx,
            spender_input_index: 0,
            spend_height: BEST_HEIGHT + 10,
        },
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        harness.stored_state(&account.trader_key.pubkey),
        AccountState::Open,
    );
}

#[tokio::test]
async fn multisig_spend_without_recreated_output_closes_account() {
    let harness = Harness::new();
    harness.manager.start().await.unwrap();

    let account = harness
        .manager
        .init_account(Amount::from_sat(500_000), EXPIRY, BEST_HEIGHT)
        .await
        .unwrap();
    harness.notifier.confirm(
        account.outpoint.unwrap().txid,
        TxConfirmation {
            block_height: BEST_HEIGHT + 3,
            tx: chanlease_sdk::testing::dummy_tx(),
        },
    );
    harness
        .wait_for_state(&account.trader_key.pubkey, AccountState::Open)
        .await;

    let secp = Secp256k1::new();
    let witness_script = account.witness_script(&secp).unwrap();
    let sig = vec![0x30; 72];

    let close = spend_tx(
        account.outpoint.unwrap(),
        script::spend_multi_sig(&witness_script, &sig, &sig),
        vec![TxOut {
            value: Amount::from_sat(499_000),
            script_pubkey: Default::default(),
        }],
    );
    let close_txid = close.compute_txid();
    harness.notifier.spend(
        account.outpoint.unwrap(),
        SpendDetail {
            spending_tx: close,
            spender_input_index: 0,
            spend_height: BEST_HEIGHT + 10,
        },
    );

    harness
        .wait_for_state(&account.trader_key.pubkey, AccountState::Closed)
        .await;
    let stored = harness
        .store
        .lock()
        .unwrap()
        .account(&account.trader_key.pubkey)
        .unwrap();
    assert_eq!(stored.close_tx.unwrap().compute_txid(), close_txid);
}

#[tokio::test]
async fn close_by_expiry_sweeps_to_wallet() {
    let harness = Harness::new();
    harness.manager.start().await.unwrap();

    let value = Amount::from_sat(200_000);
    let account = harness
        .manager
        .init_account(value, EXPIRY, BEST_HEIGHT)
        .await
        .unwrap();

    harness.notifier.push_block(EXPIRY).await;
    harness
        .wait_for_state(&account.trader_key.pubkey, AccountState::Expired)
        .await;

    let best_height = EXPIRY + 1;
    let close_tx = harness
        .manager
        .close_account(&account.trader_key.pubkey, vec![], best_height)
        .await
        .unwrap();

    // One input spending the account outpoint, lock time satisfying the
    // CLTV branch.
    assert_eq!(close_tx.input.len(), 1);
    assert_eq!(
        close_tx.input[0].previous_output,
        account.outpoint.unwrap(),
    );
    assert_eq!(close_tx.lock_time.to_consensus_u32(), best_height);
    assert!(script::is_expiry_spend(&close_tx.input[0].witness));

    // A single wallet sweep output paying value minus the predicted fee.
    let fee = script::close_tx_fee(WitnessKind::Expiry, [22], FEE_RATE_FLOOR).unwrap();
    assert_eq!(close_tx.output.len(), 1);
    assert_eq!(close_tx.output[0].value, value - fee);

    assert_eq!(
        harness.stored_state(&account.trader_key.pubkey),
        AccountState::PendingClosed,
    );
    assert!(harness.wallet.publish_count(&close_tx.compute_txid()) >= 1);

    // Closing twice is rejected.
    let again = harness
        .manager
        .close_account(&account.trader_key.pubkey, vec![], best_height)
        .await;
    assert!(matches!(again, Err(Error::AccountAlreadyClosed)));
}

#[tokio::test]
async fn cooperative_close_uses_multisig_path() {
    let harness = Harness::new();
    harness.manager.start().await.unwrap();

    let account = harness
        .manager
        .init_account(Amount::from_sat(500_000), EXPIRY, BEST_HEIGHT)
        .await
        .unwrap();
    harness.notifier.confirm(
        account.outpoint.unwrap().txid,
        TxConfirmation {
            block_height: BEST_HEIGHT + 3,
            tx: chanlease_sdk::testing::dummy_tx(),
        },
    );
    harness
        .wait_for_state(&account.trader_key.pubkey, AccountState::Open)
        .await;

    // Well before expiry, closing requires the auctioneer's co-signature.
    let close_tx = harness
        .manager
        .close_account(&account.trader_key.pubkey, vec![], BEST_HEIGHT + 10)
        .await
        .unwrap();

    assert!(script::is_multisig_spend(&close_tx.input[0].witness));
    assert_eq!(close_tx.lock_time.to_consensus_u32(), 0);
}
