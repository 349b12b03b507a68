use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use chanlease_sdk::bitcoin::secp256k1::PublicKey;
use chanlease_sdk::{
    account, Account, AccountModifier, AccountStore, Bid, Error, SidecarStore, Ticket,
};

use crate::conversions::{
    account_to_row, raw_to_ticket, row_to_account, ticket_to_row, vec_to_array32,
};
use crate::error::StoreError;
use crate::models::{AccountRow, NewBidRow, SidecarRow};
use crate::schema::{accounts, sidecar_bids, sidecar_tickets};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// SQL expression for SQLite's `datetime('now')`.
const DATETIME_NOW: &str = "datetime('now')";

/// Persistent storage for trader accounts, sidecar tickets and their bid
/// templates.
///
/// All methods take `&mut self` because Diesel's `SqliteConnection` requires
/// `&mut` for all operations, including reads. The SDK shares one store
/// behind an `Arc<Mutex<_>>`.
pub struct SqliteStore {
    conn: SqliteConnection,
}

impl SqliteStore {
    /// Opens (or creates) a store at the given file path. Runs migrations
    /// automatically.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let mut conn = SqliteConnection::establish(path)?;
        diesel::sql_query("PRAGMA foreign_keys = ON").execute(&mut conn)?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(SqliteStore { conn })
    }

    /// Opens an in-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    fn account_row(&mut self, trader_key: &PublicKey) -> Result<Option<AccountRow>, StoreError> {
        let row = accounts::table
            .filter(accounts::trader_pubkey.eq(trader_key.serialize().to_vec()))
            .first::<AccountRow>(&mut self.conn)
            .optional()?;
        Ok(row)
    }

    fn sidecar_row(
        &mut self,
        id: [u8; 8],
        sign_pubkey: &PublicKey,
    ) -> Result<Option<SidecarRow>, StoreError> {
        let row = sidecar_tickets::table
            .filter(
                sidecar_tickets::ticket_id
                    .eq(id.to_vec())
                    .and(sidecar_tickets::sign_pubkey.eq(sign_pubkey.serialize().to_vec())),
            )
            .first::<SidecarRow>(&mut self.conn)
            .optional()?;
        Ok(row)
    }

    fn persist_ticket(
        conn: &mut SqliteConnection,
        ticket: &Ticket,
        bid_nonce: Option<[u8; 32]>,
    ) -> Result<(), StoreError> {
        diesel::insert_into(sidecar_tickets::table)
            .values(&ticket_to_row(ticket, bid_nonce))
            .execute(conn)?;
        Ok(())
    }
}

impl AccountStore for SqliteStore {
    fn add_account(&mut self, account: &Account) -> chanlease_sdk::Result<()> {
        if self.account_row(&account.trader_key.pubkey)?.is_some() {
            return Err(Error::AccountExists(account.trader_key.pubkey));
        }

        diesel::insert_into(accounts::table)
            .values(&account_to_row(account))
            .execute(&mut self.conn)
            .map_err(StoreError::from)?;
        Ok(())
    }

    fn update_account(
        &mut self,
        account: &mut Account,
        modifiers: &[AccountModifier],
    ) -> chanlease_sdk::Result<()> {
        if self.account_row(&account.trader_key.pubkey)?.is_none() {
            return Err(Error::AccountNotFound);
        }

        // Apply the whole modifier list to a copy and persist the result in
        // one transaction, so a failure leaves both the row and the caller's
        // copy untouched.
        let updated = account::apply_modifiers(account, modifiers);
        let row = account_to_row(&updated);

        self.conn
            .transaction(|conn| {
                diesel::update(
                    accounts::table
                        .filter(accounts::trader_pubkey.eq(&row.trader_pubkey)),
                )
                .set((
                    accounts::value.eq(row.value),
                    accounts::expiry.eq(row.expiry),
                    accounts::batch_key.eq(&row.batch_key),
                    accounts::state.eq(row.state),
                    accounts::height_hint.eq(row.height_hint),
                    accounts::outpoint_txid.eq(&row.outpoint_txid),
                    accounts::outpoint_index.eq(row.outpoint_index),
                    accounts::close_tx.eq(&row.close_tx),
                    accounts::updated_at
                        .eq(diesel::dsl::sql::<diesel::sql_types::Text>(DATETIME_NOW)),
                ))
                .execute(conn)
            })
            .map_err(StoreError::from)?;

        *account = updated;
        Ok(())
    }

    fn account(&mut self, trader_key: &PublicKey) -> chanlease_sdk::Result<Account> {
        let row = self
            .account_row(trader_key)?
            .ok_or(Error::AccountNotFound)?;
        Ok(row_to_account(&row)?)
    }

    fn accounts(&mut self) -> chanlease_sdk::Result<Vec<Account>> {
        let rows = accounts::table
            .load::<AccountRow>(&mut self.conn)
            .map_err(StoreError::from)?;
        rows.iter()
            .map(|row| row_to_account(row).map_err(Error::from))
            .collect()
    }
}

impl SidecarStore for SqliteStore {
    fn add_sidecar(&mut self, ticket: &Ticket) -> chanlease_sdk::Result<()> {
        if self
            .sidecar_row(ticket.id, &ticket.offer.sign_pubkey)?
            .is_some()
        {
            return Err(Error::SidecarExists(ticket.id));
        }

        Self::persist_ticket(&mut self.conn, ticket, None)?;
        Ok(())
    }

    fn add_sidecar_with_bid(&mut self, ticket: &Ticket, bid: &Bid) -> chanlease_sdk::Result<()> {
        if self
            .sidecar_row(ticket.id, &ticket.offer.sign_pubkey)?
            .is_some()
        {
            return Err(Error::SidecarExists(ticket.id));
        }

        // The ticket, its nonce index entry and the bid template must land
        // together.
        self.conn
            .transaction(|conn| {
                Self::persist_ticket(conn, ticket, Some(bid.nonce))?;
                diesel::insert_into(sidecar_bids::table)
                    .values(&NewBidRow {
                        nonce: bid.nonce.to_vec(),
                        raw_bid: bid.serialize(),
                    })
                    .execute(conn)
                    .map_err(StoreError::from)?;
                Ok::<_, StoreError>(())
            })?;
        Ok(())
    }

    fn update_sidecar(&mut self, ticket: &Ticket) -> chanlease_sdk::Result<()> {
        if self
            .sidecar_row(ticket.id, &ticket.offer.sign_pubkey)?
            .is_none()
        {
            return Err(Error::NoSidecarTicket);
        }

        // The bid nonce column is left alone; it binds the ticket to its
        // template for the negotiation's whole lifetime.
        diesel::update(
            sidecar_tickets::table.filter(
                sidecar_tickets::ticket_id
                    .eq(ticket.id.to_vec())
                    .and(sidecar_tickets::sign_pubkey
                        .eq(ticket.offer.sign_pubkey.serialize().to_vec())),
            ),
        )
        .set((
            sidecar_tickets::state.eq(i32::from(ticket.state.as_u8())),
            sidecar_tickets::raw_ticket.eq(ticket.serialize()),
            sidecar_tickets::updated_at
                .eq(diesel::dsl::sql::<diesel::sql_types::Text>(DATETIME_NOW)),
        ))
        .execute(&mut self.conn)
        .map_err(StoreError::from)?;
        Ok(())
    }

    fn sidecar(&mut self, id: [u8; 8], sign_pubkey: &PublicKey) -> chanlease_sdk::Result<Ticket> {
        let row = self
            .sidecar_row(id, sign_pubkey)?
            .ok_or(Error::NoSidecarTicket)?;
        Ok(raw_to_ticket(&row.raw_ticket)?)
    }

    fn sidecars(&mut self) -> chanlease_sdk::Result<Vec<Ticket>> {
        let rows = sidecar_tickets::table
            .load::<SidecarRow>(&mut self.conn)
            .map_err(StoreError::from)?;
        rows.iter()
            .map(|row| raw_to_ticket(&row.raw_ticket).map_err(Error::from))
            .collect()
    }

    fn sidecar_bid_template(&mut self, ticket: &Ticket) -> chanlease_sdk::Result<Bid> {
        let row = self
            .sidecar_row(ticket.id, &ticket.offer.sign_pubkey)?
            .ok_or(Error::NoSidecarTicket)?;
        let nonce_bytes = row.bid_nonce.ok_or(Error::NoSidecarTicket)?;
        let nonce = vec_to_array32(&nonce_bytes, "bid nonce")?;

        let raw_bid = sidecar_bids::table
            .filter(sidecar_bids::nonce.eq(nonce_bytes))
            .select(sidecar_bids::raw_bid)
            .first::<Vec<u8>>(&mut self.conn)
            .optional()
            .map_err(StoreError::from)?
            .ok_or(Error::OrderNotFound(nonce))?;

        Bid::deserialize(&raw_bid)
    }
}
