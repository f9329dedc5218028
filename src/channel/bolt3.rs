// LN channel library implementing lightning network channel state machine
// and feature negotiation for the Lightning network protocol (LNP)
//
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Construction of commitment and HTLC transactions, their scripts, keys and
//! fees according to BOLT-3.

use std::io;

use amplify::Wrapper;
use bitcoin::blockdata::opcodes::all::*;
use bitcoin::blockdata::script;
use bitcoin::consensus::{deserialize, serialize};
use bitcoin::hashes::{ripemd160, sha256, Hash, HashEngine};
use bitcoin::util::sighash::SighashCache;
use bitcoin::{
    EcdsaSighashType, OutPoint, PackedLockTime, Script, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use bitcoin_scripts::hlc::HashLock;
use bitcoin_scripts::{LockScript, PubkeyScript, WitnessScript};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Scalar, SECP256K1};
use strict_encoding::{StrictDecode, StrictEncode};

use super::commitments::{CommitmentSpec, DirectedHtlc};

/// Weight of the commitment transaction without HTLC outputs
pub const COMMIT_WEIGHT: u64 = 724;

/// Weight added to the commitment transaction by a single HTLC output
pub const HTLC_OUTPUT_WEIGHT: u64 = 172;

/// Weight of an HTLC-timeout transaction
pub const HTLC_TIMEOUT_WEIGHT: u64 = 663;

/// Weight of an HTLC-success transaction
pub const HTLC_SUCCESS_WEIGHT: u64 = 703;

/// Bitcoin transaction kept within the channel state.
///
/// Wrapper exists to provide strict serialization through the bitcoin
/// consensus encoding of the enclosed transaction.
#[derive(Wrapper, Clone, PartialEq, Eq, Debug, From)]
pub struct StoredTx(Transaction);

impl StoredTx {
    #[inline]
    pub fn txid(&self) -> Txid {
        self.0.txid()
    }
}

impl StrictEncode for StoredTx {
    fn strict_encode<E: io::Write>(
        &self,
        e: E,
    ) -> Result<usize, strict_encoding::Error> {
        serialize(&self.0).strict_encode(e)
    }
}

impl StrictDecode for StoredTx {
    fn strict_decode<D: io::Read>(
        d: D,
    ) -> Result<Self, strict_encoding::Error> {
        let data = Vec::<u8>::strict_decode(d)?;
        deserialize(&data).map(StoredTx).map_err(|err| {
            strict_encoding::Error::DataIntegrityError(err.to_string())
        })
    }
}

/// The funding output spent by both commitment transactions
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct FundingInput {
    /// Funding transaction outpoint
    pub outpoint: OutPoint,

    /// Value of the funding output in satoshis
    pub amount: u64,

    /// The 2-of-2 multisig script locking the funding output
    pub witness_script: WitnessScript,
}

impl FundingInput {
    /// The scriptPubkey of the funding output (P2WSH over the multisig
    /// script)
    #[inline]
    pub fn script_pubkey(&self) -> PubkeyScript {
        self.witness_script.to_p2wsh()
    }
}

/// Weight-proportional component of the fee for a transaction of the given
/// weight
#[inline]
pub fn weight_to_fee(weight: u64, feerate_per_kw: u32) -> u64 {
    weight * feerate_per_kw as u64 / 1000
}

/// Fee of an HTLC-timeout transaction
#[inline]
pub fn htlc_timeout_fee(feerate_per_kw: u32) -> u64 {
    weight_to_fee(HTLC_TIMEOUT_WEIGHT, feerate_per_kw)
}

/// Fee of an HTLC-success transaction
#[inline]
pub fn htlc_success_fee(feerate_per_kw: u32) -> u64 {
    weight_to_fee(HTLC_SUCCESS_WEIGHT, feerate_per_kw)
}

/// Smallest amount of an offered HTLC which still materializes as a
/// commitment transaction output
#[inline]
pub fn offered_htlc_threshold_sat(
    dust_limit_satoshis: u64,
    feerate_per_kw: u32,
) -> u64 {
    dust_limit_satoshis + htlc_timeout_fee(feerate_per_kw)
}

/// Smallest amount of a received HTLC which still materializes as a
/// commitment transaction output
#[inline]
pub fn received_htlc_threshold_sat(
    dust_limit_satoshis: u64,
    feerate_per_kw: u32,
) -> u64 {
    dust_limit_satoshis + htlc_success_fee(feerate_per_kw)
}

/// Offered HTLCs of the spec which are kept as outputs (not trimmed as dust)
pub fn trim_offered_htlcs(
    dust_limit_satoshis: u64,
    spec: &CommitmentSpec,
) -> Vec<DirectedHtlc> {
    let threshold =
        offered_htlc_threshold_sat(dust_limit_satoshis, spec.feerate_per_kw);
    spec.htlcs
        .iter()
        .filter(|htlc| htlc.is_outgoing())
        .filter(|htlc| htlc.add.amount_msat / 1000 >= threshold)
        .cloned()
        .collect()
}

/// Received HTLCs of the spec which are kept as outputs (not trimmed as
/// dust)
pub fn trim_received_htlcs(
    dust_limit_satoshis: u64,
    spec: &CommitmentSpec,
) -> Vec<DirectedHtlc> {
    let threshold =
        received_htlc_threshold_sat(dust_limit_satoshis, spec.feerate_per_kw);
    spec.htlcs
        .iter()
        .filter(|htlc| htlc.is_incoming())
        .filter(|htlc| htlc.add.amount_msat / 1000 >= threshold)
        .cloned()
        .collect()
}

/// Fee of the commitment transaction, paid by the channel funder
pub fn commit_tx_fee(dust_limit_satoshis: u64, spec: &CommitmentSpec) -> u64 {
    let untrimmed = trim_offered_htlcs(dust_limit_satoshis, spec).len()
        + trim_received_htlcs(dust_limit_satoshis, spec).len();
    weight_to_fee(
        COMMIT_WEIGHT + HTLC_OUTPUT_WEIGHT * untrimmed as u64,
        spec.feerate_per_kw,
    )
}

/// The tweak committing a basepoint to a per-commitment point:
/// `SHA256(per_commitment_point || basepoint)`
pub fn derivation_tweak(
    per_commitment_point: &PublicKey,
    basepoint: &PublicKey,
) -> Scalar {
    let mut engine = sha256::Hash::engine();
    engine.input(&per_commitment_point.serialize());
    engine.input(&basepoint.serialize());
    let tweak = sha256::Hash::from_engine(engine);
    Scalar::from_be_bytes(tweak.into_inner())
        .expect("negligible probability")
}

/// Derives `basepoint + SHA256(per_commitment_point || basepoint) * G`
/// (`localpubkey`, `remotepubkey`, `htlcpubkey` and `delayedpubkey` of
/// BOLT-3)
pub fn derive_pubkey(
    basepoint: &PublicKey,
    per_commitment_point: &PublicKey,
) -> PublicKey {
    basepoint
        .add_exp_tweak(
            SECP256K1,
            &derivation_tweak(per_commitment_point, basepoint),
        )
        .expect("negligible probability")
}

/// Derives the revocation public key committing both to the revocation
/// basepoint of the counterparty and the broadcaster per-commitment point
pub fn derive_revocation_pubkey(
    revocation_basepoint: &PublicKey,
    per_commitment_point: &PublicKey,
) -> PublicKey {
    let mut engine = sha256::Hash::engine();
    engine.input(&revocation_basepoint.serialize());
    engine.input(&per_commitment_point.serialize());
    let revocation_tweak = Scalar::from_be_bytes(
        sha256::Hash::from_engine(engine).into_inner(),
    )
    .expect("negligible probability");

    let mut engine = sha256::Hash::engine();
    engine.input(&per_commitment_point.serialize());
    engine.input(&revocation_basepoint.serialize());
    let per_commitment_tweak = Scalar::from_be_bytes(
        sha256::Hash::from_engine(engine).into_inner(),
    )
    .expect("negligible probability");

    let tweaked_basepoint = revocation_basepoint
        .mul_tweak(SECP256K1, &revocation_tweak)
        .expect("negligible probability");
    let tweaked_point = per_commitment_point
        .mul_tweak(SECP256K1, &per_commitment_tweak)
        .expect("negligible probability");
    tweaked_basepoint
        .combine(&tweaked_point)
        .expect("negligible probability")
}

/// The 48-bit factor obscuring commitment numbers in commitment transaction
/// locktime and sequence fields
pub fn obscuring_factor(
    funder_payment_basepoint: &PublicKey,
    fundee_payment_basepoint: &PublicKey,
) -> u64 {
    const LOWER_48_BITS: u64 = 0x00_00_FF_FF_FF_FF_FF_FF;

    let mut engine = sha256::Hash::engine();
    engine.input(&funder_payment_basepoint.serialize());
    engine.input(&fundee_payment_basepoint.serialize());
    let obscuring_hash = sha256::Hash::from_engine(engine);

    let mut buf = [0u8; 8];
    buf.copy_from_slice(&obscuring_hash[24..]);
    u64::from_be_bytes(buf) & LOWER_48_BITS
}

/// Keys used within a single commitment transaction, derived from the
/// channel basepoints and the broadcaster per-commitment point
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct CommitmentKeys {
    /// The broadcaster per-commitment point the keys are derived for
    pub per_commitment_point: PublicKey,

    /// Revocation key allowing the countersigner to claim the broadcaster
    /// outputs after a revoked commitment broadcast
    pub revocation_pubkey: PublicKey,

    /// Key of the delayed broadcaster `to_local` output
    pub delayed_payment_pubkey: PublicKey,

    /// Key of the countersigner `to_remote` output
    pub payment_pubkey: PublicKey,

    /// Broadcaster HTLC key
    pub broadcaster_htlc_pubkey: PublicKey,

    /// Countersigner HTLC key
    pub countersigner_htlc_pubkey: PublicKey,
}

impl CommitmentKeys {
    /// Derives the keys for a commitment transaction broadcast by the party
    /// owning `broadcaster_*` basepoints.
    pub fn derive(
        per_commitment_point: &PublicKey,
        broadcaster_delayed_payment_basepoint: &PublicKey,
        broadcaster_htlc_basepoint: &PublicKey,
        countersigner_payment_basepoint: &PublicKey,
        countersigner_revocation_basepoint: &PublicKey,
        countersigner_htlc_basepoint: &PublicKey,
        static_remotekey: bool,
    ) -> CommitmentKeys {
        let payment_pubkey = if static_remotekey {
            *countersigner_payment_basepoint
        } else {
            derive_pubkey(
                countersigner_payment_basepoint,
                per_commitment_point,
            )
        };
        CommitmentKeys {
            per_commitment_point: *per_commitment_point,
            revocation_pubkey: derive_revocation_pubkey(
                countersigner_revocation_basepoint,
                per_commitment_point,
            ),
            delayed_payment_pubkey: derive_pubkey(
                broadcaster_delayed_payment_basepoint,
                per_commitment_point,
            ),
            payment_pubkey,
            broadcaster_htlc_pubkey: derive_pubkey(
                broadcaster_htlc_basepoint,
                per_commitment_point,
            ),
            countersigner_htlc_pubkey: derive_pubkey(
                countersigner_htlc_basepoint,
                per_commitment_point,
            ),
        }
    }
}

pub trait ScriptGenerators {
    fn ln_funding(pubkey1: PublicKey, pubkey2: PublicKey) -> Self;

    fn ln_to_local(
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self;

    fn ln_offered_htlc(
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: &HashLock,
    ) -> Self;

    fn ln_received_htlc(
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: &HashLock,
        cltv_expiry: u32,
    ) -> Self;
}

fn payment_hash160(payment_hash: &HashLock) -> ripemd160::Hash {
    ripemd160::Hash::hash(payment_hash.as_inner().as_inner())
}

fn revocation_hash160(revocationpubkey: &PublicKey) -> ripemd160::Hash {
    ripemd160::Hash::hash(
        &sha256::Hash::hash(&revocationpubkey.serialize()).into_inner(),
    )
}

impl ScriptGenerators for LockScript {
    fn ln_funding(pubkey1: PublicKey, pubkey2: PublicKey) -> Self {
        let mut pk = [
            bitcoin::PublicKey::new(pubkey1),
            bitcoin::PublicKey::new(pubkey2),
        ];
        pk.sort_by_key(|pubkey| pubkey.to_bytes());

        script::Builder::new()
            .push_int(2)
            .push_key(&pk[0])
            .push_key(&pk[1])
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script()
            .into()
    }

    fn ln_to_local(
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        script::Builder::new()
            .push_opcode(OP_IF)
            .push_key(&bitcoin::PublicKey::new(revocationpubkey))
            .push_opcode(OP_ELSE)
            .push_int(to_self_delay as i64)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP)
            .push_key(&bitcoin::PublicKey::new(local_delayedpubkey))
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_CHECKSIG)
            .into_script()
            .into()
    }

    fn ln_offered_htlc(
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: &HashLock,
    ) -> Self {
        script::Builder::new()
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(&revocation_hash160(&revocationpubkey)[..])
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ELSE)
            .push_key(&bitcoin::PublicKey::new(remote_htlcpubkey))
            .push_opcode(OP_SWAP)
            .push_opcode(OP_SIZE)
            .push_int(32)
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_NOTIF)
            .push_opcode(OP_DROP)
            .push_int(2)
            .push_opcode(OP_SWAP)
            .push_key(&bitcoin::PublicKey::new(local_htlcpubkey))
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_ELSE)
            .push_opcode(OP_HASH160)
            .push_slice(&payment_hash160(payment_hash)[..])
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_ENDIF)
            .into_script()
            .into()
    }

    fn ln_received_htlc(
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: &HashLock,
        cltv_expiry: u32,
    ) -> Self {
        script::Builder::new()
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(&revocation_hash160(&revocationpubkey)[..])
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ELSE)
            .push_key(&bitcoin::PublicKey::new(remote_htlcpubkey))
            .push_opcode(OP_SWAP)
            .push_opcode(OP_SIZE)
            .push_int(32)
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_opcode(OP_HASH160)
            .push_slice(&payment_hash160(payment_hash)[..])
            .push_opcode(OP_EQUALVERIFY)
            .push_int(2)
            .push_opcode(OP_SWAP)
            .push_key(&bitcoin::PublicKey::new(local_htlcpubkey))
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_ELSE)
            .push_opcode(OP_DROP)
            .push_int(cltv_expiry as i64)
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_ENDIF)
            .into_script()
            .into()
    }
}

impl ScriptGenerators for WitnessScript {
    #[inline]
    fn ln_funding(pubkey1: PublicKey, pubkey2: PublicKey) -> Self {
        LockScript::ln_funding(pubkey1, pubkey2).into()
    }

    #[inline]
    fn ln_to_local(
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        LockScript::ln_to_local(
            revocationpubkey,
            local_delayedpubkey,
            to_self_delay,
        )
        .into()
    }

    #[inline]
    fn ln_offered_htlc(
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: &HashLock,
    ) -> Self {
        LockScript::ln_offered_htlc(
            revocationpubkey,
            local_htlcpubkey,
            remote_htlcpubkey,
            payment_hash,
        )
        .into()
    }

    #[inline]
    fn ln_received_htlc(
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: &HashLock,
        cltv_expiry: u32,
    ) -> Self {
        LockScript::ln_received_htlc(
            revocationpubkey,
            local_htlcpubkey,
            remote_htlcpubkey,
            payment_hash,
            cltv_expiry,
        )
        .into()
    }
}

/// P2WPKH output paying to the countersigner (`to_remote` of BOLT-3)
pub fn to_remote_script(payment_pubkey: &PublicKey) -> PubkeyScript {
    bitcoin::PublicKey::new(*payment_pubkey)
        .wpubkey_hash()
        .expect("compressed key")
        .into()
}

/// An HTLC materialized as a commitment transaction output
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HtlcOutput {
    /// The HTLC, directed from the broadcaster viewpoint
    pub htlc: DirectedHtlc,

    /// Output number within the commitment transaction
    pub vout: u32,

    /// Witness script of the output
    pub witness_script: WitnessScript,
}

/// Builds a commitment transaction for the party owning the provided
/// per-commitment keys. The `spec` must be oriented from the broadcaster
/// viewpoint: `to_local` is the broadcaster balance and outgoing HTLCs are
/// the ones offered by the broadcaster.
#[allow(clippy::too_many_arguments)]
pub fn commitment_tx(
    commit_input: &FundingInput,
    commitment_number: u64,
    obscuring_factor: u64,
    broadcaster_is_funder: bool,
    broadcaster_dust_limit: u64,
    broadcaster_to_self_delay: u16,
    keys: &CommitmentKeys,
    spec: &CommitmentSpec,
) -> (Transaction, Vec<HtlcOutput>) {
    const LOWER_48_BITS: u64 = 0x00_00_FF_FF_FF_FF_FF_FF;
    let obscured =
        (commitment_number & LOWER_48_BITS) ^ obscuring_factor;
    let lock_time = (0x20u32 << 24) | (obscured as u32 & 0x00_FF_FF_FF);
    let sequence = (0x80u32 << 24) | (obscured >> 24) as u32;

    let fee = commit_tx_fee(broadcaster_dust_limit, spec);
    let (to_local_fee, to_remote_fee) = if broadcaster_is_funder {
        (fee, 0)
    } else {
        (0, fee)
    };

    // (txout, cltv tiebreak, htlc with witness script)
    let mut outs: Vec<(TxOut, u32, Option<(DirectedHtlc, WitnessScript)>)> =
        vec![];

    let to_local = (spec.to_local_msat / 1000).saturating_sub(to_local_fee);
    if to_local >= broadcaster_dust_limit {
        let witness_script = WitnessScript::ln_to_local(
            keys.revocation_pubkey,
            keys.delayed_payment_pubkey,
            broadcaster_to_self_delay,
        );
        outs.push((
            TxOut {
                value: to_local,
                script_pubkey: witness_script.to_p2wsh().into_inner(),
            },
            0,
            None,
        ));
    }

    let to_remote = (spec.to_remote_msat / 1000).saturating_sub(to_remote_fee);
    if to_remote >= broadcaster_dust_limit {
        outs.push((
            TxOut {
                value: to_remote,
                script_pubkey: to_remote_script(&keys.payment_pubkey)
                    .into_inner(),
            },
            0,
            None,
        ));
    }

    for htlc in trim_offered_htlcs(broadcaster_dust_limit, spec) {
        let witness_script = WitnessScript::ln_offered_htlc(
            keys.revocation_pubkey,
            keys.broadcaster_htlc_pubkey,
            keys.countersigner_htlc_pubkey,
            &htlc.add.payment_hash,
        );
        outs.push((
            TxOut {
                value: htlc.add.amount_msat / 1000,
                script_pubkey: witness_script.to_p2wsh().into_inner(),
            },
            htlc.add.cltv_expiry,
            Some((htlc, witness_script)),
        ));
    }
    for htlc in trim_received_htlcs(broadcaster_dust_limit, spec) {
        let witness_script = WitnessScript::ln_received_htlc(
            keys.revocation_pubkey,
            keys.broadcaster_htlc_pubkey,
            keys.countersigner_htlc_pubkey,
            &htlc.add.payment_hash,
            htlc.add.cltv_expiry,
        );
        outs.push((
            TxOut {
                value: htlc.add.amount_msat / 1000,
                script_pubkey: witness_script.to_p2wsh().into_inner(),
            },
            htlc.add.cltv_expiry,
            Some((htlc, witness_script)),
        ));
    }

    // BIP-69 ordering with the BOLT-3 cltv tiebreak for identical HTLC
    // outputs
    outs.sort_by(|a, b| {
        (a.0.value, a.0.script_pubkey.as_bytes(), a.1).cmp(&(
            b.0.value,
            b.0.script_pubkey.as_bytes(),
            b.1,
        ))
    });

    let mut htlc_outputs = vec![];
    let mut output = vec![];
    for (vout, (txout, _, htlc)) in outs.into_iter().enumerate() {
        if let Some((htlc, witness_script)) = htlc {
            htlc_outputs.push(HtlcOutput {
                htlc,
                vout: vout as u32,
                witness_script,
            });
        }
        output.push(txout);
    }

    let tx = Transaction {
        version: 2,
        lock_time: PackedLockTime(lock_time),
        input: vec![TxIn {
            previous_output: commit_input.outpoint,
            script_sig: Script::new(),
            sequence: Sequence(sequence),
            witness: Witness::default(),
        }],
        output,
    };
    (tx, htlc_outputs)
}

/// Builds the second-stage HTLC-timeout (for offered HTLCs) or HTLC-success
/// (for received HTLCs) transaction spending an HTLC output of the
/// commitment transaction
pub fn htlc_tx(
    commit_txid: Txid,
    htlc_output: &HtlcOutput,
    revocation_pubkey: &PublicKey,
    delayed_payment_pubkey: &PublicKey,
    broadcaster_to_self_delay: u16,
    feerate_per_kw: u32,
) -> Transaction {
    let (fee, lock_time) = if htlc_output.htlc.is_outgoing() {
        (
            htlc_timeout_fee(feerate_per_kw),
            htlc_output.htlc.add.cltv_expiry,
        )
    } else {
        (htlc_success_fee(feerate_per_kw), 0)
    };
    let amount =
        (htlc_output.htlc.add.amount_msat / 1000).saturating_sub(fee);
    let witness_script = WitnessScript::ln_to_local(
        *revocation_pubkey,
        *delayed_payment_pubkey,
        broadcaster_to_self_delay,
    );
    Transaction {
        version: 2,
        lock_time: PackedLockTime(lock_time),
        input: vec![TxIn {
            previous_output: OutPoint::new(
                commit_txid,
                htlc_output.vout,
            ),
            script_sig: Script::new(),
            sequence: Sequence(0),
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: amount,
            script_pubkey: witness_script.to_p2wsh().into_inner(),
        }],
    }
}

/// Completes the witness of a transaction spending the 2-of-2 funding
/// output: both signatures in the funding pubkey order, the multisig dummy
/// and the witness script
pub fn complete_funding_witness(
    mut tx: Transaction,
    witness_script: &WitnessScript,
    sig1: (PublicKey, Signature),
    sig2: (PublicKey, Signature),
) -> Transaction {
    let mut sigs = [sig1, sig2];
    sigs.sort_by_key(|(pubkey, _)| pubkey.serialize());

    let mut witness = Witness::new();
    // OP_CHECKMULTISIG off-by-one
    witness.push(&[] as &[u8]);
    for (_, sig) in sigs {
        let mut der = sig.serialize_der().to_vec();
        der.push(EcdsaSighashType::All.to_u32() as u8);
        witness.push(&der);
    }
    witness.push(witness_script.as_inner().as_bytes());
    tx.input[0].witness = witness;
    tx
}

/// Computes the BIP-143 signature digest of a transaction input spending a
/// P2WSH output of the given value
pub fn signature_digest(
    tx: &Transaction,
    input_index: usize,
    value: u64,
    witness_script: &WitnessScript,
) -> Message {
    let sighash = SighashCache::new(tx)
        .segwit_signature_hash(
            input_index,
            witness_script.as_inner(),
            value,
            EcdsaSighashType::All,
        )
        .expect("input index within transaction");
    Message::from_slice(&sighash[..]).expect("sighash is a valid message")
}

/// Verifies a counterparty signature on a transaction input
pub fn verify_signature(
    tx: &Transaction,
    input_index: usize,
    value: u64,
    witness_script: &WitnessScript,
    pubkey: &PublicKey,
    signature: &Signature,
) -> bool {
    let msg = signature_digest(tx, input_index, value, witness_script);
    SECP256K1.verify_ecdsa(&msg, signature, pubkey).is_ok()
}
