use chanlease_sdk::bitcoin::secp256k1::Secp256k1;
use chanlease_sdk::bitcoin::{Amount, FeeRate, OutPoint};
use chanlease_sdk::testing::{dummy_tx, test_account, test_ticket};
use chanlease_sdk::{
    AccountModifier, AccountState, AccountStore, Bid, Error, SidecarStore, TicketState,
};
use chanlease_store::SqliteStore;

fn test_bid(byte: u8) -> Bid {
    Bid {
        nonce: [byte; 32],
        capacity: Amount::from_sat(1_000_000),
        self_chan_balance: Amount::from_sat(100_000),
        lease_duration_blocks: 2016,
        max_batch_fee_rate: FeeRate::from_sat_per_kwu(253),
    }
}

#[test]
fn add_and_fetch_account() {
    let secp = Secp256k1::new();
    let mut store = SqliteStore::open_in_memory().unwrap();
    let account = test_account(&secp, 1);

    store.add_account(&account).unwrap();

    let fetched = store.account(&account.trader_key.pubkey).unwrap();
    assert_eq!(fetched.value, account.value);
    assert_eq!(fetched.expiry, account.expiry);
    assert_eq!(fetched.trader_key, account.trader_key);
    assert_eq!(fetched.auctioneer_key, account.auctioneer_key);
    assert_eq!(fetched.batch_key, account.batch_key);
    assert_eq!(fetched.secret, account.secret);
    assert_eq!(fetched.state, AccountState::Initiated);
    assert_eq!(fetched.outpoint, None);
    assert!(fetched.close_tx.is_none());
}

#[test]
fn duplicate_account_rejected() {
    let secp = Secp256k1::new();
    let mut store = SqliteStore::open_in_memory().unwrap();
    let account = test_account(&secp, 2);

    store.add_account(&account).unwrap();
    assert!(matches!(
        store.add_account(&account),
        Err(Error::AccountExists(_)),
    ));
}

#[test]
fn update_account_applies_modifier_list() {
    let secp = Secp256k1::new();
    let mut store = SqliteStore::open_in_memory().unwrap();
    let mut account = test_account(&secp, 3);
    store.add_account(&account).unwrap();

    let outpoint = OutPoint {
        txid: dummy_tx().compute_txid(),
        vout: 1,
    };
    store
        .update_account(
            &mut account,
            &[
                AccountModifier::State(AccountState::PendingOpen),
                AccountModifier::OutPoint(outpoint),
                AccountModifier::HeightHint(700_123),
            ],
        )
        .unwrap();

    // The caller's copy reflects the update...
    assert_eq!(account.state, AccountState::PendingOpen);
    assert_eq!(account.outpoint, Some(outpoint));
    assert_eq!(account.height_hint, 700_123);

    // ...and so does the stored record.
    let fetched = store.account(&account.trader_key.pubkey).unwrap();
    assert_eq!(fetched.state, AccountState::PendingOpen);
    assert_eq!(fetched.outpoint, Some(outpoint));
    assert_eq!(fetched.height_hint, 700_123);
}

#[test]
fn update_missing_account_errors() {
    let secp = Secp256k1::new();
    let mut store = SqliteStore::open_in_memory().unwrap();
    let mut account = test_account(&secp, 4);

    let result = store.update_account(
        &mut account,
        &[AccountModifier::State(AccountState::PendingOpen)],
    );
    assert!(matches!(result, Err(Error::AccountNotFound)));
    // The caller's copy must stay untouched on failure.
    assert_eq!(account.state, AccountState::Initiated);
}

#[test]
fn close_tx_roundtrips() {
    let secp = Secp256k1::new();
    let mut store = SqliteStore::open_in_memory().unwrap();
    let mut account = test_account(&secp, 5);
    store.add_account(&account).unwrap();

    let close_tx = dummy_tx();
    store
        .update_account(
            &mut account,
            &[
                AccountModifier::State(AccountState::PendingClosed),
                AccountModifier::CloseTx(close_tx.clone()),
            ],
        )
        .unwrap();

    let fetched = store.account(&account.trader_key.pubkey).unwrap();
    let stored_close = fetched.close_tx.expect("close tx persisted");
    assert_eq!(stored_close.compute_txid(), close_tx.compute_txid());
}

#[test]
fn accounts_survive_reopen() {
    let secp = Secp256k1::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trader.db");
    let path = path.to_str().unwrap();

    let mut account = test_account(&secp, 6);
    {
        let mut store = SqliteStore::open(path).unwrap();
        store.add_account(&account).unwrap();
        store
            .update_account(
                &mut account,
                &[AccountModifier::State(AccountState::Open)],
            )
            .unwrap();
    }

    let mut store = SqliteStore::open(path).unwrap();
    let fetched = store.account(&account.trader_key.pubkey).unwrap();
    assert_eq!(fetched.state, AccountState::Open);

    let all = store.accounts().unwrap();
    assert_eq!(all.len(), 1);
}

#[test]
fn sidecar_add_get_and_duplicate() {
    let secp = Secp256k1::new();
    let mut store = SqliteStore::open_in_memory().unwrap();
    let ticket = test_ticket(&secp, 7);

    store.add_sidecar(&ticket).unwrap();

    let fetched = store
        .sidecar(ticket.id, &ticket.offer.sign_pubkey)
        .unwrap();
    assert_eq!(fetched, ticket);

    assert!(matches!(
        store.add_sidecar(&ticket),
        Err(Error::SidecarExists(_)),
    ));
}

#[test]
fn sidecar_with_bid_keeps_template_across_updates() {
    let secp = Secp256k1::new();
    let mut store = SqliteStore::open_in_memory().unwrap();
    let mut ticket = test_ticket(&secp, 8);
    let bid = test_bid(8);

    store.add_sidecar_with_bid(&ticket, &bid).unwrap();
    assert_eq!(store.sidecar_bid_template(&ticket).unwrap(), bid);

    // Advancing the ticket state must not drop the bid binding.
    ticket.state = TicketState::Ordered;
    store.update_sidecar(&ticket).unwrap();

    let fetched = store
        .sidecar(ticket.id, &ticket.offer.sign_pubkey)
        .unwrap();
    assert_eq!(fetched.state, TicketState::Ordered);
    assert_eq!(store.sidecar_bid_template(&ticket).unwrap(), bid);
}

#[test]
fn update_missing_sidecar_errors() {
    let secp = Secp256k1::new();
    let mut store = SqliteStore::open_in_memory().unwrap();
    let ticket = test_ticket(&secp, 9);

    assert!(matches!(
        store.update_sidecar(&ticket),
        Err(Error::NoSidecarTicket),
    ));
}

#[test]
fn sidecars_lists_all_tickets() {
    let secp = Secp256k1::new();
    let mut store = SqliteStore::open_in_memory().unwrap();

    let first = test_ticket(&secp, 10);
    let second = test_ticket(&secp, 11);
    store.add_sidecar(&first).unwrap();
    store.add_sidecar(&second).unwrap();

    let mut ids: Vec<[u8; 8]> = store
        .sidecars()
        .unwrap()
        .into_iter()
        .map(|ticket| ticket.id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec![first.id, second.id]);
}

#[test]
fn bid_template_without_binding_errors() {
    let secp = Secp256k1::new();
    let mut store = SqliteStore::open_in_memory().unwrap();
    let ticket = test_ticket(&secp, 12);

    store.add_sidecar(&ticket).unwrap();
    assert!(store.sidecar_bid_template(&ticket).is_err());
}
