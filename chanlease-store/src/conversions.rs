//! Mapping between the SDK's domain types and the SQLite rows.

use chanlease_sdk::bitcoin::consensus;
use chanlease_sdk::bitcoin::hashes::Hash;
use chanlease_sdk::bitcoin::secp256k1::PublicKey;
use chanlease_sdk::bitcoin::{Amount, OutPoint, Txid};
use chanlease_sdk::{Account, AccountState, KeyDescriptor, KeyLocator, Ticket};

use crate::error::StoreError;
use crate::models::{AccountRow, NewAccountRow, NewSidecarRow};

pub fn account_to_row(account: &Account) -> NewAccountRow {
    NewAccountRow {
        trader_pubkey: account.trader_key.pubkey.serialize().to_vec(),
        trader_key_family: account.trader_key.locator.family as i32,
        trader_key_index: account.trader_key.locator.index as i32,
        value: account.value.to_sat() as i64,
        expiry: account.expiry as i32,
        auctioneer_key: account.auctioneer_key.serialize().to_vec(),
        batch_key: account.batch_key.serialize().to_vec(),
        secret: account.secret.to_vec(),
        state: i32::from(account.state.as_u8()),
        height_hint: account.height_hint as i32,
        outpoint_txid: account
            .outpoint
            .map(|op| op.txid.to_byte_array().to_vec()),
        outpoint_index: account.outpoint.map(|op| op.vout as i32),
        close_tx: account.close_tx.as_ref().map(consensus::serialize),
    }
}

pub fn row_to_account(row: &AccountRow) -> Result<Account, StoreError> {
    let outpoint = match (&row.outpoint_txid, row.outpoint_index) {
        (Some(txid), Some(vout)) => Some(OutPoint {
            txid: Txid::from_slice(txid)
                .map_err(|e| StoreError::InvalidData(format!("outpoint txid: {e}")))?,
            vout: vout as u32,
        }),
        (None, None) => None,
        _ => {
            return Err(StoreError::InvalidData(
                "account outpoint is half-populated".into(),
            ))
        }
    };

    let close_tx = row
        .close_tx
        .as_deref()
        .map(consensus::deserialize)
        .transpose()
        .map_err(|e| StoreError::InvalidData(format!("close tx: {e}")))?;

    Ok(Account {
        value: Amount::from_sat(row.value as u64),
        expiry: row.expiry as u32,
        trader_key: KeyDescriptor {
            locator: KeyLocator {
                family: row.trader_key_family as u32,
                index: row.trader_key_index as u32,
            },
            pubkey: pubkey_from_bytes(&row.trader_pubkey, "trader pubkey")?,
        },
        auctioneer_key: pubkey_from_bytes(&row.auctioneer_key, "auctioneer key")?,
        batch_key: pubkey_from_bytes(&row.batch_key, "batch key")?,
        secret: vec_to_array32(&row.secret, "secret")?,
        state: AccountState::from_u8(row.state as u8)
            .ok_or_else(|| StoreError::InvalidData(format!("account state {}", row.state)))?,
        height_hint: row.height_hint as u32,
        outpoint,
        close_tx,
    })
}

pub fn ticket_to_row(ticket: &Ticket, bid_nonce: Option<[u8; 32]>) -> NewSidecarRow {
    NewSidecarRow {
        ticket_id: ticket.id.to_vec(),
        sign_pubkey: ticket.offer.sign_pubkey.serialize().to_vec(),
        state: i32::from(ticket.state.as_u8()),
        raw_ticket: ticket.serialize(),
        bid_nonce: bid_nonce.map(|nonce| nonce.to_vec()),
    }
}

pub fn raw_to_ticket(raw: &[u8]) -> Result<Ticket, StoreError> {
    Ticket::deserialize(raw).map_err(|e| StoreError::InvalidData(format!("ticket: {e}")))
}

pub fn pubkey_from_bytes(bytes: &[u8], field: &str) -> Result<PublicKey, StoreError> {
    PublicKey::from_slice(bytes)
        .map_err(|e| StoreError::InvalidData(format!("{field}: {e}")))
}

pub fn vec_to_array32(bytes: &[u8], field: &str) -> Result<[u8; 32], StoreError> {
    bytes
        .try_into()
        .map_err(|_| StoreError::InvalidData(format!("{field}: expected 32 bytes")))
}
