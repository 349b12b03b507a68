//! Account output script construction and classification.
//!
//! An account is a P2WSH output with two spending paths: a 2-of-2 multisig
//! between the trader and the auctioneer, and a CHECKLOCKTIMEVERIFY escape
//! path the trader can use alone once the account expires. Both peers must
//! produce the exact same script bytes, so the opcode sequence here is fixed:
//!
//! ```text
//! OP_IF
//!     OP_2 <trader_key'> <auctioneer_key'> OP_2 OP_CHECKMULTISIG
//! OP_ELSE
//!     <expiry> OP_CHECKLOCKTIMEVERIFY OP_DROP
//!     <trader_key'> OP_CHECKSIG
//! OP_ENDIF
//! ```
//!
//! Both keys are tweaked per batch so each cleared batch moves the account to
//! a fresh, unlinkable output. The batch key advances by the curve generator
//! at every batch.

use bitcoin::opcodes::all::{
    OP_CHECKMULTISIG, OP_CHECKSIG, OP_CLTV, OP_DROP, OP_ELSE, OP_ENDIF, OP_IF, OP_PUSHNUM_2,
};
use bitcoin::script::Builder;
use bitcoin::secp256k1::{PublicKey, Scalar, Secp256k1, Verification};
use bitcoin::transaction::{predict_weight, InputWeightPrediction};
use bitcoin::{Amount, FeeRate, ScriptBuf, Transaction, Witness};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// The lowest fee rate the backing wallet will relay, in sat/kWU. Used for
/// account funding and close transactions.
pub const FEE_RATE_FLOOR: FeeRate = FeeRate::from_sat_per_kwu(253);

/// Worst-case size of the serialized account witness script:
///
///   - OP_IF: 1 byte
///   - OP_2: 1 byte
///   - OP_DATA_33 + trader key: 34 bytes
///   - OP_DATA_33 + auctioneer key: 34 bytes
///   - OP_2: 1 byte
///   - OP_CHECKMULTISIG: 1 byte
///   - OP_ELSE: 1 byte
///   - OP_DATA_4 + expiry: 5 bytes
///   - OP_CHECKLOCKTIMEVERIFY: 1 byte
///   - OP_DROP: 1 byte
///   - OP_DATA_33 + trader key: 34 bytes
///   - OP_CHECKSIG: 1 byte
///   - OP_ENDIF: 1 byte
pub const MAX_WITNESS_SCRIPT_SIZE: usize = 1 + 1 + 34 + 34 + 1 + 1 + 1 + 5 + 1 + 1 + 34 + 1 + 1;

/// Maximum size of a DER signature with the sighash flag appended.
const MAX_SIG_SIZE: usize = 73;

/// Worst-case witness size for a spend through the expiration path:
///
///   - number of witness elements: 1 byte
///   - trader sig varint: 1 byte
///   - trader sig: 73 bytes
///   - branch selector varint: 1 byte
///   - branch selector (empty): 0 bytes
///   - witness script varint: 1 byte
///   - witness script: 116 bytes
pub const EXPIRY_WITNESS_SIZE: usize =
    1 + 1 + MAX_SIG_SIZE + 1 + 1 + MAX_WITNESS_SCRIPT_SIZE;

/// Worst-case witness size for a spend through the multisig path:
///
///   - number of witness elements: 1 byte
///   - CHECKMULTISIG dummy varint: 1 byte
///   - CHECKMULTISIG dummy (empty): 0 bytes
///   - trader sig varint: 1 byte
///   - trader sig: 73 bytes
///   - auctioneer sig varint: 1 byte
///   - auctioneer sig: 73 bytes
///   - branch selector varint: 1 byte
///   - branch selector: 1 byte
///   - witness script varint: 1 byte
///   - witness script: 116 bytes
pub const MULTISIG_WITNESS_SIZE: usize =
    1 + 1 + 1 + MAX_SIG_SIZE + 1 + MAX_SIG_SIZE + 1 + 1 + 1 + MAX_WITNESS_SCRIPT_SIZE;

/// The two spending paths of an account output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WitnessKind {
    Expiry,
    MultiSig,
}

impl WitnessKind {
    /// Worst-case sizes of the individual witness stack elements, used for
    /// transaction weight prediction.
    fn witness_element_sizes(self) -> &'static [usize] {
        match self {
            WitnessKind::Expiry => &[MAX_SIG_SIZE, 0, MAX_WITNESS_SCRIPT_SIZE],
            WitnessKind::MultiSig => &[0, MAX_SIG_SIZE, MAX_SIG_SIZE, 1, MAX_WITNESS_SCRIPT_SIZE],
        }
    }
}

/// Computes the tweak applied to the trader's key for the current batch:
///
///   tweak = sha256(batch_key || secret || trader_key)
pub fn trader_key_tweak(
    batch_key: &PublicKey,
    secret: &[u8; 32],
    trader_key: &PublicKey,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(batch_key.serialize());
    hasher.update(secret);
    hasher.update(trader_key.serialize());
    hasher.finalize().into()
}

/// Applies a 32-byte scalar tweak to a public key: `key + tweak*G`.
pub fn tweak_pubkey<C: Verification>(
    secp: &Secp256k1<C>,
    key: &PublicKey,
    tweak: &[u8; 32],
) -> Result<PublicKey> {
    let scalar = Scalar::from_be_bytes(*tweak).map_err(|_| Error::InvalidKeyTweak)?;
    key.add_exp_tweak(secp, &scalar)
        .map_err(|_| Error::InvalidKeyTweak)
}

/// The trader's key as it appears in the account script for the given batch.
pub fn tweaked_trader_key<C: Verification>(
    secp: &Secp256k1<C>,
    trader_key: &PublicKey,
    batch_key: &PublicKey,
    secret: &[u8; 32],
) -> Result<PublicKey> {
    let tweak = trader_key_tweak(batch_key, secret, trader_key);
    tweak_pubkey(secp, trader_key, &tweak)
}

/// The auctioneer's key as it appears in the account script. The tweak
/// commits to the trader's tweaked key:
///
///   auctioneer_key + sha256(tweaked_trader_key || auctioneer_key)*G
pub fn tweaked_auctioneer_key<C: Verification>(
    secp: &Secp256k1<C>,
    auctioneer_key: &PublicKey,
    tweaked_trader_key: &PublicKey,
) -> Result<PublicKey> {
    let mut hasher = Sha256::new();
    hasher.update(tweaked_trader_key.serialize());
    hasher.update(auctioneer_key.serialize());
    let tweak: [u8; 32] = hasher.finalize().into();
    tweak_pubkey(secp, auctioneer_key, &tweak)
}

/// Advances a batch key by one generator-point increment. Applied after
/// every cleared batch.
pub fn increment_batch_key<C: Verification>(
    secp: &Secp256k1<C>,
    batch_key: &PublicKey,
) -> Result<PublicKey> {
    batch_key
        .add_exp_tweak(secp, &Scalar::ONE)
        .map_err(|_| Error::InvalidKeyTweak)
}

/// Builds the account witness script for the given parameters.
pub fn account_witness_script<C: Verification>(
    secp: &Secp256k1<C>,
    expiry: u32,
    trader_key: &PublicKey,
    auctioneer_key: &PublicKey,
    batch_key: &PublicKey,
    secret: &[u8; 32],
) -> Result<ScriptBuf> {
    let trader = tweaked_trader_key(secp, trader_key, batch_key, secret)?;
    let auctioneer = tweaked_auctioneer_key(secp, auctioneer_key, &trader)?;

    let script = Builder::new()
        .push_opcode(OP_IF)
        .push_opcode(OP_PUSHNUM_2)
        .push_slice(trader.serialize())
        .push_slice(auctioneer.serialize())
        .push_opcode(OP_PUSHNUM_2)
        .push_opcode(OP_CHECKMULTISIG)
        .push_opcode(OP_ELSE)
        .push_int(i64::from(expiry))
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_slice(trader.serialize())
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
        .into_script();

    Ok(script)
}

/// The P2WSH output script committing to the account witness script.
pub fn account_script<C: Verification>(
    secp: &Secp256k1<C>,
    expiry: u32,
    trader_key: &PublicKey,
    auctioneer_key: &PublicKey,
    batch_key: &PublicKey,
    secret: &[u8; 32],
) -> Result<ScriptBuf> {
    let witness_script = account_witness_script(
        secp, expiry, trader_key, auctioneer_key, batch_key, secret,
    )?;
    Ok(ScriptBuf::new_p2wsh(&witness_script.wscript_hash()))
}

/// Finds the index of the output paying to `script` within `tx`, if any.
pub fn locate_output_script(tx: &Transaction, script: &ScriptBuf) -> Option<u32> {
    tx.output
        .iter()
        .position(|txo| &txo.script_pubkey == script)
        .map(|idx| idx as u32)
}

/// Whether the witness spends an account through the expiration path.
///
/// The expiry witness has exactly three elements with an empty branch
/// selector in the middle.
pub fn is_expiry_spend(witness: &Witness) -> bool {
    witness.len() == 3 && witness.nth(1).is_some_and(|elem| elem.is_empty())
}

/// Whether the witness spends an account through the multisig path.
///
/// The multisig witness has exactly five elements with the `OP_IF` branch
/// selector in the second-to-last slot.
pub fn is_multisig_spend(witness: &Witness) -> bool {
    witness.len() == 5 && witness.nth(3) == Some(&[0x01][..])
}

/// Assembles the witness for a spend through the expiration path.
pub fn spend_expiry(witness_script: &ScriptBuf, trader_sig: &[u8]) -> Witness {
    let mut witness = Witness::new();
    witness.push(trader_sig);
    witness.push([]);
    witness.push(witness_script.as_bytes());
    witness
}

/// Assembles the witness for a spend through the multisig path. The leading
/// empty element consumes the CHECKMULTISIG dummy pop.
pub fn spend_multi_sig(
    witness_script: &ScriptBuf,
    trader_sig: &[u8],
    auctioneer_sig: &[u8],
) -> Witness {
    let mut witness = Witness::new();
    witness.push([]);
    witness.push(trader_sig);
    witness.push(auctioneer_sig);
    witness.push([0x01]);
    witness.push(witness_script.as_bytes());
    witness
}

/// Fee for a close transaction spending the account output through the given
/// path, paying outputs with the given script lengths.
pub fn close_tx_fee<O>(kind: WitnessKind, output_script_lens: O, fee_rate: FeeRate) -> Result<Amount>
where
    O: IntoIterator<Item = usize>,
{
    let input = InputWeightPrediction::new(0, kind.witness_element_sizes().iter().copied());
    let weight = predict_weight([input], output_script_lens);
    fee_rate
        .fee_wu(weight)
        .ok_or_else(|| Error::InvalidCloseTx("fee computation overflowed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{All, SecretKey};
    use bitcoin::TxOut;

    fn test_keys(secp: &Secp256k1<All>) -> (SecretKey, PublicKey, PublicKey, PublicKey) {
        let trader_sk = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let trader = trader_sk.public_key(secp);
        let auctioneer = SecretKey::from_slice(&[0x22; 32]).unwrap().public_key(secp);
        let batch = SecretKey::from_slice(&[0x33; 32]).unwrap().public_key(secp);
        (trader_sk, trader, auctioneer, batch)
    }

    #[test]
    fn witness_script_within_size_bound() {
        let secp = Secp256k1::new();
        let (_, trader, auctioneer, batch) = test_keys(&secp);
        // A height needing the full 4-byte minimal encoding.
        let script = account_witness_script(
            &secp, 0x0100_0000, &trader, &auctioneer, &batch, &[0x44; 32],
        )
        .unwrap();
        assert_eq!(script.len(), MAX_WITNESS_SCRIPT_SIZE);

        // Realistic heights encode shorter, never longer.
        let script =
            account_witness_script(&secp, 700_000, &trader, &auctioneer, &batch, &[0x44; 32])
                .unwrap();
        assert!(script.len() <= MAX_WITNESS_SCRIPT_SIZE);
    }

    #[test]
    fn script_changes_with_batch_key() {
        let secp = Secp256k1::new();
        let (_, trader, auctioneer, batch) = test_keys(&secp);
        let secret = [0x44; 32];

        let current =
            account_script(&secp, 700_000, &trader, &auctioneer, &batch, &secret).unwrap();
        let next_batch = increment_batch_key(&secp, &batch).unwrap();
        let next =
            account_script(&secp, 700_000, &trader, &auctioneer, &next_batch, &secret).unwrap();

        assert_ne!(current, next);

        // Deterministic for identical inputs.
        let again =
            account_script(&secp, 700_000, &trader, &auctioneer, &batch, &secret).unwrap();
        assert_eq!(current, again);
    }

    #[test]
    fn trader_tweak_matches_private_derivation() {
        let secp = Secp256k1::new();
        let (trader_sk, trader, _, batch) = test_keys(&secp);
        let secret = [0x44; 32];

        let tweak = trader_key_tweak(&batch, &secret, &trader);
        let tweaked_pub = tweak_pubkey(&secp, &trader, &tweak).unwrap();

        let scalar = Scalar::from_be_bytes(tweak).unwrap();
        let tweaked_sk = trader_sk.add_tweak(&scalar).unwrap();
        assert_eq!(tweaked_pub, tweaked_sk.public_key(&secp));
    }

    #[test]
    fn locate_output() {
        let secp = Secp256k1::new();
        let (_, trader, auctioneer, batch) = test_keys(&secp);
        let script =
            account_script(&secp, 700_000, &trader, &auctioneer, &batch, &[0x44; 32]).unwrap();

        let tx = Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![],
            output: vec![
                TxOut {
                    value: Amount::from_sat(1_000),
                    script_pubkey: ScriptBuf::new(),
                },
                TxOut {
                    value: Amount::from_sat(500_000),
                    script_pubkey: script.clone(),
                },
            ],
        };

        assert_eq!(locate_output_script(&tx, &script), Some(1));
        assert_eq!(
            locate_output_script(&tx, &ScriptBuf::from_bytes(vec![0x51])),
            None,
        );
    }

    #[test]
    fn witness_classification() {
        let secp = Secp256k1::new();
        let (_, trader, auctioneer, batch) = test_keys(&secp);
        let script =
            account_witness_script(&secp, 700_000, &trader, &auctioneer, &batch, &[0x44; 32])
                .unwrap();

        let sig = vec![0x30; 72];
        let expiry = spend_expiry(&script, &sig);
        assert!(is_expiry_spend(&expiry));
        assert!(!is_multisig_spend(&expiry));

        let multisig = spend_multi_sig(&script, &sig, &sig);
        assert!(is_multisig_spend(&multisig));
        assert!(!is_expiry_spend(&multisig));

        assert!(!is_expiry_spend(&Witness::new()));
        assert!(!is_multisig_spend(&Witness::new()));
    }

    #[test]
    fn close_fee_positive_and_path_dependent() {
        let p2wpkh_len = 22;
        let expiry_fee =
            close_tx_fee(WitnessKind::Expiry, [p2wpkh_len], FEE_RATE_FLOOR).unwrap();
        let multisig_fee =
            close_tx_fee(WitnessKind::MultiSig, [p2wpkh_len], FEE_RATE_FLOOR).unwrap();

        assert!(expiry_fee > Amount::ZERO);
        // The multisig witness carries an extra signature.
        assert!(multisig_fee > expiry_fee);
    }
}
