use diesel::prelude::*;

use crate::schema::accounts;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = accounts)]
pub struct AccountRow {
    pub trader_pubkey: Vec<u8>,
    pub trader_key_family: i32,
    pub trader_key_index: i32,
    pub value: i64,
    pub expiry: i32,
    pub auctioneer_key: Vec<u8>,
    pub batch_key: Vec<u8>,
    pub secret: Vec<u8>,
    pub state: i32,
    pub height_hint: i32,
    pub outpoint_txid: Option<Vec<u8>>,
    pub outpoint_index: Option<i32>,
    pub close_tx: Option<Vec<u8>>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = accounts)]
pub struct NewAccountRow {
    pub trader_pubkey: Vec<u8>,
    pub trader_key_family: i32,
    pub trader_key_index: i32,
    pub value: i64,
    pub expiry: i32,
    pub auctioneer_key: Vec<u8>,
    pub batch_key: Vec<u8>,
    pub secret: Vec<u8>,
    pub state: i32,
    pub height_hint: i32,
    pub outpoint_txid: Option<Vec<u8>>,
    pub outpoint_index: Option<i32>,
    pub close_tx: Option<Vec<u8>>,
}
