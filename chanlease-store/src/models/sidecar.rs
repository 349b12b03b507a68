use diesel::prelude::*;

use crate::schema::{sidecar_bids, sidecar_tickets};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = sidecar_tickets)]
pub struct SidecarRow {
    pub ticket_id: Vec<u8>,
    pub sign_pubkey: Vec<u8>,
    pub state: i32,
    pub raw_ticket: Vec<u8>,
    pub bid_nonce: Option<Vec<u8>>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = sidecar_tickets)]
pub struct NewSidecarRow {
    pub ticket_id: Vec<u8>,
    pub sign_pubkey: Vec<u8>,
    pub state: i32,
    pub raw_ticket: Vec<u8>,
    pub bid_nonce: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = sidecar_bids)]
pub struct BidRow {
    pub nonce: Vec<u8>,
    pub raw_bid: Vec<u8>,
    pub created_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = sidecar_bids)]
pub struct NewBidRow {
    pub nonce: Vec<u8>,
    pub raw_bid: Vec<u8>,
}
