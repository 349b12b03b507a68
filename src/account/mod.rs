//! Account model and storage contract.
//!
//! An account is a funded 2-of-2 output co-owned by the trader and the
//! auctioneer, with an expiry-based unilateral escape path. The manager in
//! [`manager`] drives each account through its lifecycle; [`watcher`]
//! delivers the chain events that move it along.

pub mod manager;
pub mod watcher;

use bitcoin::secp256k1::{PublicKey, Secp256k1, Verification};
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut};

use crate::clients::KeyDescriptor;
use crate::error::Result;
use crate::script;

/// Lifecycle state of an account. Progression is a directed acyclic path;
/// `Closed` is terminal. The integer codes are the persisted representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountState {
    /// The intent to create the account is persisted but no funding
    /// transaction exists yet.
    Initiated = 0,

    /// The funding transaction has been broadcast; awaiting confirmation.
    PendingOpen = 1,

    /// The funding transaction confirmed; the account is usable.
    Open = 2,

    /// The expiry height has been reached without a close.
    Expired = 3,

    /// A close transaction has been broadcast; awaiting its confirmation.
    PendingClosed = 4,

    /// The account output has been spent without being recreated.
    Closed = 5,
}

impl AccountState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Initiated),
            1 => Some(Self::PendingOpen),
            2 => Some(Self::Open),
            3 => Some(Self::Expired),
            4 => Some(Self::PendingClosed),
            5 => Some(Self::Closed),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for AccountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initiated => "initiated",
            Self::PendingOpen => "pending_open",
            Self::Open => "open",
            Self::Expired => "expired",
            Self::PendingClosed => "pending_closed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A trader's account with the auctioneer.
#[derive(Debug, Clone)]
pub struct Account {
    /// Value locked into the account output.
    pub value: Amount,

    /// Absolute block height at which the expiration path opens up.
    pub expiry: u32,

    /// The trader's base key and where the wallet derived it.
    pub trader_key: KeyDescriptor,

    /// The auctioneer's base key, from the reservation.
    pub auctioneer_key: PublicKey,

    /// The current per-batch key; advances by the generator point with every
    /// cleared batch.
    pub batch_key: PublicKey,

    /// ECDH secret between the trader and auctioneer base keys. Lets both
    /// parties identify every past and future output of the account.
    pub secret: [u8; 32],

    pub state: AccountState,

    /// Lower bound for chain rescans.
    pub height_hint: u32,

    /// The account output. Set exactly once, when the funding transaction is
    /// known.
    pub outpoint: Option<OutPoint>,

    /// The latest known closing transaction. May be replaced by a
    /// fee-bumped spend observed on-chain.
    pub close_tx: Option<Transaction>,
}

impl Account {
    /// The witness script of the account output under the current batch key.
    pub fn witness_script<C: Verification>(&self, secp: &Secp256k1<C>) -> Result<ScriptBuf> {
        script::account_witness_script(
            secp,
            self.expiry,
            &self.trader_key.pubkey,
            &self.auctioneer_key,
            &self.batch_key,
            &self.secret,
        )
    }

    /// The P2WSH output script of the account under the current batch key.
    pub fn output_script<C: Verification>(&self, secp: &Secp256k1<C>) -> Result<ScriptBuf> {
        script::account_script(
            secp,
            self.expiry,
            &self.trader_key.pubkey,
            &self.auctioneer_key,
            &self.batch_key,
            &self.secret,
        )
    }

    /// The full account output as it appears in the funding transaction.
    pub fn output<C: Verification>(&self, secp: &Secp256k1<C>) -> Result<TxOut> {
        Ok(TxOut {
            value: self.value,
            script_pubkey: self.output_script(secp)?,
        })
    }

    /// The output script the account moves to after the next cleared batch,
    /// i.e. with the batch key advanced by one generator increment. Used to
    /// tell batch spends apart from closes.
    pub fn next_output_script<C: Verification>(&self, secp: &Secp256k1<C>) -> Result<ScriptBuf> {
        let next_batch_key = script::increment_batch_key(secp, &self.batch_key)?;
        script::account_script(
            secp,
            self.expiry,
            &self.trader_key.pubkey,
            &self.auctioneer_key,
            &next_batch_key,
            &self.secret,
        )
    }
}

/// A single field update applied to an account record. Updates are handed to
/// the store as an ordered list and applied atomically.
#[derive(Debug, Clone)]
pub enum AccountModifier {
    State(AccountState),
    OutPoint(OutPoint),
    CloseTx(Transaction),
    BatchKey(PublicKey),
    HeightHint(u32),
}

impl AccountModifier {
    pub fn apply(&self, account: &mut Account) {
        match self {
            AccountModifier::State(state) => account.state = *state,
            AccountModifier::OutPoint(op) => account.outpoint = Some(*op),
            AccountModifier::CloseTx(tx) => account.close_tx = Some(tx.clone()),
            AccountModifier::BatchKey(key) => account.batch_key = *key,
            AccountModifier::HeightHint(height) => account.height_hint = *height,
        }
    }
}

/// Applies a modifier list to a copy of the account, leaving the original
/// untouched. Store implementations persist the copy and only then hand it
/// back to the caller.
pub fn apply_modifiers(account: &Account, modifiers: &[AccountModifier]) -> Account {
    let mut updated = account.clone();
    for modifier in modifiers {
        modifier.apply(&mut updated);
    }
    updated
}

/// Durable storage of accounts, keyed by the compressed trader public key.
///
/// Every mutation must be atomic and flushed before returning; a partially
/// applied modifier list must never be observable.
pub trait AccountStore: Send {
    /// Inserts a new account; fails with [`crate::error::Error::AccountExists`]
    /// if the trader key is already present.
    fn add_account(&mut self, account: &Account) -> Result<()>;

    /// Applies the ordered modifier list to the stored record, persists it,
    /// and updates `account` in place on success.
    fn update_account(
        &mut self,
        account: &mut Account,
        modifiers: &[AccountModifier],
    ) -> Result<()>;

    /// Looks up an account by trader key.
    fn account(&mut self, trader_key: &PublicKey) -> Result<Account>;

    /// All stored accounts, in unspecified order.
    fn accounts(&mut self) -> Result<Vec<Account>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn state_codec_is_stable() {
        for value in 0..=5 {
            let state = AccountState::from_u8(value).unwrap();
            assert_eq!(state.as_u8(), value);
        }
        assert!(AccountState::from_u8(6).is_none());
    }

    #[test]
    fn output_script_matches_script_library() {
        let secp = Secp256k1::new();
        let account = testing::test_account(&secp, 1);

        let expected = script::account_script(
            &secp,
            account.expiry,
            &account.trader_key.pubkey,
            &account.auctioneer_key,
            &account.batch_key,
            &account.secret,
        )
        .unwrap();
        assert_eq!(account.output_script(&secp).unwrap(), expected);

        let output = account.output(&secp).unwrap();
        assert_eq!(output.value, account.value);
        assert_eq!(output.script_pubkey, expected);
    }

    #[test]
    fn next_output_script_differs() {
        let secp = Secp256k1::new();
        let account = testing::test_account(&secp, 2);
        assert_ne!(
            account.output_script(&secp).unwrap(),
            account.next_output_script(&secp).unwrap(),
        );
    }

    #[test]
    fn modifiers_apply_in_order() {
        let secp = Secp256k1::new();
        let account = testing::test_account(&secp, 3);

        let updated = apply_modifiers(
            &account,
            &[
                AccountModifier::State(AccountState::PendingOpen),
                AccountModifier::State(AccountState::Open),
                AccountModifier::HeightHint(800_000),
            ],
        );

        assert_eq!(updated.state, AccountState::Open);
        assert_eq!(updated.height_hint, 800_000);
        // The original is untouched.
        assert_eq!(account.state, AccountState::Initiated);
    }
}
