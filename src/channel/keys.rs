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

//! Collaborator seams of the channel state machine: the key manager deriving
//! per-channel keys and signing channel transactions, and the clock.
//!
//! Both are injected by the driver on every [`crate::ChannelState::process`]
//! call and are never part of the serialized channel state.

use bitcoin::util::bip32::DerivationPath;
use bitcoin::Transaction;
use bitcoin_scripts::WitnessScript;
use secp256k1::ecdsa::Signature;
use secp256k1::{PublicKey, SecretKey};

use super::bolt3::FundingInput;
use super::params::{ChannelVersion, LocalParams};

/// External key management: derivation of channel basepoints, the
/// per-commitment point chain and signing of channel transactions.
///
/// Implementations must be usable concurrently across channels; within a
/// single channel the state machine only invokes the manager synchronously
/// from the driver thread.
pub trait KeyManager {
    /// Public key controlling the funding output multisig on the local side
    fn funding_pubkey(&self, funding_key_path: &DerivationPath) -> PublicKey;

    /// Computes the key derivation path for the channel basepoints out of
    /// the negotiated channel parameters
    fn channel_key_path(
        &self,
        local_params: &LocalParams,
        channel_version: ChannelVersion,
    ) -> DerivationPath;

    /// Base point for deriving keys in `to_remote` outputs
    fn payment_basepoint(&self, channel_key_path: &DerivationPath)
        -> PublicKey;

    /// Base point for deriving keys in `to_local` time-locked spending paths
    fn delayed_payment_basepoint(
        &self,
        channel_key_path: &DerivationPath,
    ) -> PublicKey;

    /// Base point for deriving HTLC-related keys
    fn htlc_basepoint(&self, channel_key_path: &DerivationPath) -> PublicKey;

    /// Base point for deriving keys used for penalty spending paths
    fn revocation_basepoint(
        &self,
        channel_key_path: &DerivationPath,
    ) -> PublicKey;

    /// Per-commitment point for the local commitment at the given index
    fn commitment_point(
        &self,
        channel_key_path: &DerivationPath,
        index: u64,
    ) -> PublicKey;

    /// Per-commitment secret for the local commitment at the given index;
    /// revealed to the peer when the commitment is revoked
    fn commitment_secret(
        &self,
        channel_key_path: &DerivationPath,
        index: u64,
    ) -> SecretKey;

    /// Signs a transaction spending the channel funding output (commitment
    /// or mutual closing transaction)
    fn sign_funding_spend(
        &self,
        tx: &Transaction,
        funding_input: &FundingInput,
        funding_key_path: &DerivationPath,
    ) -> Signature;

    /// Signs a second-stage HTLC transaction with the HTLC key derived from
    /// the HTLC basepoint and the provided per-commitment point
    #[allow(clippy::too_many_arguments)]
    fn sign_htlc_tx(
        &self,
        tx: &Transaction,
        input_amount: u64,
        witness_script: &WitnessScript,
        channel_key_path: &DerivationPath,
        per_commitment_point: &PublicKey,
    ) -> Signature;
}

/// Time source of the channel machine; injected so that tests stay
/// deterministic
pub trait Clock {
    /// Current unix timestamp, in seconds
    fn unix_seconds(&self) -> u64;
}

/// System clock measuring real time
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_seconds(&self) -> u64 {
        chrono::Utc::now().timestamp() as u64
    }
}

/// Collaborators handed into every transition function call
#[derive(Copy, Clone)]
pub struct ProcessCtx<'a> {
    pub keys: &'a dyn KeyManager,
    pub clock: &'a dyn Clock,
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use bitcoin::hashes::{sha256, Hash, HashEngine};
    use secp256k1::SECP256K1;

    use super::*;
    use crate::channel::bolt3;

    /// Deterministic key manager for tests: every key is a tagged hash over
    /// the seed
    pub struct DumbKeyManager {
        pub seed: [u8; 32],
    }

    impl DumbKeyManager {
        pub fn with(seed_byte: u8) -> DumbKeyManager {
            DumbKeyManager {
                seed: [seed_byte; 32],
            }
        }

        fn secret(
            &self,
            tag: &str,
            path: &DerivationPath,
            index: u64,
        ) -> SecretKey {
            let mut engine = sha256::Hash::engine();
            engine.input(&self.seed);
            engine.input(tag.as_bytes());
            engine.input(path.to_string().as_bytes());
            engine.input(&index.to_be_bytes());
            SecretKey::from_slice(
                &sha256::Hash::from_engine(engine).into_inner(),
            )
            .expect("negligible probability")
        }

        fn pubkey(
            &self,
            tag: &str,
            path: &DerivationPath,
            index: u64,
        ) -> PublicKey {
            PublicKey::from_secret_key(
                SECP256K1,
                &self.secret(tag, path, index),
            )
        }
    }

    impl KeyManager for DumbKeyManager {
        fn funding_pubkey(
            &self,
            funding_key_path: &DerivationPath,
        ) -> PublicKey {
            self.pubkey("funding", funding_key_path, 0)
        }

        fn channel_key_path(
            &self,
            local_params: &LocalParams,
            _channel_version: ChannelVersion,
        ) -> DerivationPath {
            local_params.funding_key_path.clone()
        }

        fn payment_basepoint(
            &self,
            channel_key_path: &DerivationPath,
        ) -> PublicKey {
            self.pubkey("payment", channel_key_path, 0)
        }

        fn delayed_payment_basepoint(
            &self,
            channel_key_path: &DerivationPath,
        ) -> PublicKey {
            self.pubkey("delayed", channel_key_path, 0)
        }

        fn htlc_basepoint(
            &self,
            channel_key_path: &DerivationPath,
        ) -> PublicKey {
            self.pubkey("htlc", channel_key_path, 0)
        }

        fn revocation_basepoint(
            &self,
            channel_key_path: &DerivationPath,
        ) -> PublicKey {
            self.pubkey("revocation", channel_key_path, 0)
        }

        fn commitment_point(
            &self,
            channel_key_path: &DerivationPath,
            index: u64,
        ) -> PublicKey {
            self.pubkey("commitment", channel_key_path, index)
        }

        fn commitment_secret(
            &self,
            channel_key_path: &DerivationPath,
            index: u64,
        ) -> SecretKey {
            self.secret("commitment", channel_key_path, index)
        }

        fn sign_funding_spend(
            &self,
            tx: &Transaction,
            funding_input: &FundingInput,
            funding_key_path: &DerivationPath,
        ) -> Signature {
            let msg = bolt3::signature_digest(
                tx,
                0,
                funding_input.amount,
                &funding_input.witness_script,
            );
            SECP256K1
                .sign_ecdsa(&msg, &self.secret("funding", funding_key_path, 0))
        }

        fn sign_htlc_tx(
            &self,
            tx: &Transaction,
            input_amount: u64,
            witness_script: &WitnessScript,
            channel_key_path: &DerivationPath,
            per_commitment_point: &PublicKey,
        ) -> Signature {
            let basepoint_secret = self.secret("htlc", channel_key_path, 0);
            let basepoint =
                PublicKey::from_secret_key(SECP256K1, &basepoint_secret);
            let htlc_secret = basepoint_secret
                .add_tweak(&bolt3::derivation_tweak(
                    per_commitment_point,
                    &basepoint,
                ))
                .expect("negligible probability");
            let msg = bolt3::signature_digest(
                tx,
                0,
                input_amount,
                witness_script,
            );
            SECP256K1.sign_ecdsa(&msg, &htlc_secret)
        }
    }

    /// Clock frozen at a fixed point in time
    pub struct FrozenClock(pub u64);

    impl Clock for FrozenClock {
        fn unix_seconds(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn dumb_key_manager_consistency() {
        let keys = DumbKeyManager::with(1);
        let path = DerivationPath::default();
        // the commitment secret must always match the commitment point
        for index in 0..4 {
            let secret = keys.commitment_secret(&path, index);
            assert_eq!(
                PublicKey::from_secret_key(SECP256K1, &secret),
                keys.commitment_point(&path, index)
            );
        }
        // points at different indexes differ
        assert_ne!(
            keys.commitment_point(&path, 0),
            keys.commitment_point(&path, 1)
        );
        // different seeds derive different keys
        assert_ne!(
            DumbKeyManager::with(2).funding_pubkey(&path),
            keys.funding_pubkey(&path)
        );
    }
}
