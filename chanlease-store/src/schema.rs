diesel::table! {
    accounts (trader_pubkey) {
        trader_pubkey -> Binary,
        trader_key_family -> Integer,
        trader_key_index -> Integer,
        value -> BigInt,
        expiry -> Integer,
        auctioneer_key -> Binary,
        batch_key -> Binary,
        secret -> Binary,
        state -> Integer,
        height_hint -> Integer,
        outpoint_txid -> Nullable<Binary>,
        outpoint_index -> Nullable<Integer>,
        close_tx -> Nullable<Binary>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    sidecar_tickets (ticket_id, sign_pubkey) {
        ticket_id -> Binary,
        sign_pubkey -> Binary,
        state -> Integer,
        raw_ticket -> Binary,
        bid_nonce -> Nullable<Binary>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    sidecar_bids (nonce) {
        nonce -> Binary,
        raw_bid -> Binary,
        created_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(accounts, sidecar_tickets, sidecar_bids);
