mod account;
mod sidecar;

pub use account::{AccountRow, NewAccountRow};
pub use sidecar::{BidRow, NewBidRow, NewSidecarRow, SidecarRow};
