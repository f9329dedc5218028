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

use std::collections::BTreeMap;

use amplify::{Slice32, Wrapper};
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use strict_encoding::{StrictDecode, StrictEncode};

/// Store of the remote per-commitment secrets revealed with each received
/// `revoke_and_ack`.
///
/// Keeps every secret under its commitment index. The constant-size shachain
/// compression of BOLT-3 is a storage optimization over the same contents
/// and can replace this representation without changing the interface.
#[derive(
    Clone, PartialEq, Eq, Debug, Default, StrictEncode, StrictDecode,
)]
pub struct CommitmentSecretStore {
    known: BTreeMap<u64, Slice32>,
}

/// Error indicating that the revealed per-commitment secret does not match
/// the per-commitment point previously shown by the remote node
#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error
)]
#[display(
    "per-commitment secret does not match the commitment point it must \
     reveal"
)]
pub struct SecretMismatch;

impl CommitmentSecretStore {
    /// Constructs empty store for a fresh channel
    #[inline]
    pub fn new() -> CommitmentSecretStore {
        CommitmentSecretStore::default()
    }

    /// Number of stored secrets
    #[inline]
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// Detects whether any secret was received from the peer yet
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Index of the last revoked commitment, if any
    #[inline]
    pub fn last_index(&self) -> Option<u64> {
        self.known.keys().next_back().copied()
    }

    /// Validates the secret against the commitment point it must reveal and
    /// stores it under the commitment index
    pub fn insert(
        &mut self,
        index: u64,
        secret: SecretKey,
        per_commitment_point: PublicKey,
    ) -> Result<(), SecretMismatch> {
        if PublicKey::from_secret_key(SECP256K1, &secret)
            != per_commitment_point
        {
            return Err(SecretMismatch);
        }
        self.known
            .insert(index, Slice32::from_inner(secret.secret_bytes()));
        Ok(())
    }

    /// Returns the per-commitment secret of a revoked remote commitment
    pub fn get(&self, index: u64) -> Option<SecretKey> {
        self.known.get(&index).map(|slice| {
            SecretKey::from_slice(slice.as_inner())
                .expect("stored secrets are validated on insert")
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn secret(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).unwrap()
    }

    #[test]
    fn insert_and_get() {
        let mut store = CommitmentSecretStore::new();
        assert!(store.is_empty());
        assert_eq!(store.last_index(), None);

        for index in 0..3u64 {
            let sk = secret(index as u8 + 1);
            let point = PublicKey::from_secret_key(SECP256K1, &sk);
            store.insert(index, sk, point).unwrap();
        }
        assert_eq!(store.len(), 3);
        assert_eq!(store.last_index(), Some(2));
        assert_eq!(store.get(1), Some(secret(2)));
        assert_eq!(store.get(5), None);
    }

    #[test]
    fn rejects_wrong_secret() {
        let mut store = CommitmentSecretStore::new();
        let point = PublicKey::from_secret_key(SECP256K1, &secret(1));
        assert_eq!(
            store.insert(0, secret(2), point),
            Err(SecretMismatch)
        );
        assert!(store.is_empty());
    }
}
