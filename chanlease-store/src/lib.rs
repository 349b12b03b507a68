//! SQLite persistence for the chanlease trader core.
//!
//! Implements the SDK's [`chanlease_sdk::AccountStore`] and
//! [`chanlease_sdk::SidecarStore`] traits over one Diesel connection with
//! embedded migrations. Accounts are stored as columns keyed by the
//! compressed trader key; tickets keep their canonical wire encoding as a
//! blob next to the columns used for lookups.

mod conversions;
mod error;
mod models;
mod schema;
mod store;

pub use error::StoreError;
pub use store::{SqliteStore, MIGRATIONS};
