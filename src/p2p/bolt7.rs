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

use amplify::Slice32;
use bitcoin::hashes::{sha256d, Hash};
use lightning_encoding::{LightningDecode, LightningEncode};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use strict_encoding::{StrictDecode, StrictEncode};

use super::bolt9::FeatureSet;
use super::ShortChannelId;

/// Channel direction bit of [`ChannelUpdate::channel_flags`]
pub const CHANNEL_FLAG_DIRECTION: u8 = 0x01;

/// Disable bit of [`ChannelUpdate::channel_flags`]
pub const CHANNEL_FLAG_DISABLED: u8 = 0x02;

/// Message flag bit telling that `htlc_maximum_msat` field is present
pub const MESSAGE_FLAG_HTLC_MAX: u8 = 0x01;

/// This gossip message contains ownership information regarding a channel. It
/// ties each on-chain Bitcoin key to the associated Lightning node key, and
/// vice-versa.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[derive(LightningEncode, LightningDecode)]
#[display("channel_announcement({chain_hash}, {short_channel_id}, ...)")]
pub struct ChannelAnnouncement {
    /// Node signature 1
    pub node_signature_1: Signature,

    /// Node signature 2
    pub node_signature_2: Signature,

    /// Bitcoin signature 1
    pub bitcoin_signature_1: Signature,

    /// Bitcoin signature 2
    pub bitcoin_signature_2: Signature,

    /// Feature bytes
    pub features: FeatureSet,

    /// Chain hash
    pub chain_hash: Slice32,

    /// Short channel ID
    pub short_channel_id: ShortChannelId,

    /// Node ID 1
    pub node_id_1: PublicKey,

    /// Node ID 2
    pub node_id_2: PublicKey,

    /// Bitcoin key 1
    pub bitcoin_key_1: PublicKey,

    /// Bitcoin key 2
    pub bitcoin_key_2: PublicKey,
}

/// This gossip message updates local routing policy of a channel in one of
/// the two directions.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[derive(LightningEncode, LightningDecode)]
#[display(
    "channel_update({chain_hash}, {short_channel_id}, {timestamp}, ...)"
)]
pub struct ChannelUpdate {
    /// Signature of the node operating the channel side
    pub signature: Signature,

    /// Chain hash
    pub chain_hash: Slice32,

    /// Short channel ID
    pub short_channel_id: ShortChannelId,

    /// Time stamp
    pub timestamp: u32,

    /// Message flags
    pub message_flags: u8,

    /// Channel flags
    pub channel_flags: u8,

    /// CLTV expiry delta
    pub cltv_expiry_delta: u16,

    /// Minimum HTLC in msat
    pub htlc_minimum_msat: u64,

    /// Base fee in msat
    pub fee_base_msat: u32,

    /// Fee proportional millionth
    pub fee_proportional_millionths: u32,

    /// Used only if `option_channel_htlc_max` in `message_flags` is set
    pub htlc_maximum_msat: u64,
}

impl ChannelUpdate {
    /// Composes local routing policy for a channel and signs it with the node
    /// key. The direction bit is computed from the lexicographic ordering of
    /// the two node ids, as required by BOLT-7.
    #[allow(clippy::too_many_arguments)]
    pub fn compose(
        node_secret: &SecretKey,
        remote_node_id: PublicKey,
        chain_hash: Slice32,
        short_channel_id: ShortChannelId,
        timestamp: u32,
        cltv_expiry_delta: u16,
        htlc_minimum_msat: u64,
        htlc_maximum_msat: u64,
    ) -> ChannelUpdate {
        let local_node_id =
            PublicKey::from_secret_key(SECP256K1, node_secret);
        let channel_flags =
            if local_node_id.serialize() <= remote_node_id.serialize() {
                0
            } else {
                CHANNEL_FLAG_DIRECTION
            };
        let mut update = ChannelUpdate {
            signature: placeholder_sig(),
            chain_hash,
            short_channel_id,
            timestamp,
            message_flags: MESSAGE_FLAG_HTLC_MAX,
            channel_flags,
            cltv_expiry_delta,
            htlc_minimum_msat,
            fee_base_msat: 1000,
            fee_proportional_millionths: 100,
            htlc_maximum_msat,
        };
        update.signature = update.sign(node_secret);
        update
    }

    /// Produces the node signature over the double-SHA256 of the message
    /// serialization with the signature field skipped
    pub fn sign(&self, node_secret: &SecretKey) -> Signature {
        let msg = Message::from_slice(&self.signed_digest()[..])
            .expect("sha256d digest is a valid message");
        SECP256K1.sign_ecdsa(&msg, node_secret)
    }

    /// Verifies the announcement signature against the node id of the
    /// announcing party
    pub fn verify_sig(&self, node_id: &PublicKey) -> bool {
        let msg = Message::from_slice(&self.signed_digest()[..])
            .expect("sha256d digest is a valid message");
        SECP256K1
            .verify_ecdsa(&msg, &self.signature, node_id)
            .is_ok()
    }

    fn signed_digest(&self) -> sha256d::Hash {
        let data = self
            .lightning_serialize()
            .expect("in-memory lightning encoding");
        // the first 64 bytes are the compact signature itself
        sha256d::Hash::hash(&data[64..])
    }
}

fn placeholder_sig() -> Signature {
    Signature::from_compact(&[1u8; 64])
        .expect("constant compact signature data")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn channel_update_signature() {
        let node_secret = SecretKey::from_slice(&[0x42u8; 32]).unwrap();
        let node_id = PublicKey::from_secret_key(SECP256K1, &node_secret);
        let remote_id = PublicKey::from_secret_key(
            SECP256K1,
            &SecretKey::from_slice(&[0x17u8; 32]).unwrap(),
        );
        let update = ChannelUpdate::compose(
            &node_secret,
            remote_id,
            Slice32::default(),
            ShortChannelId::new(630_000, 1, 0).unwrap(),
            1_600_000_000,
            40,
            1000,
            1_000_000_000,
        );
        assert!(update.verify_sig(&node_id));
        assert!(!update.verify_sig(&remote_id));
    }

    #[test]
    fn channel_update_direction() {
        let secret_1 = SecretKey::from_slice(&[0x21u8; 32]).unwrap();
        let secret_2 = SecretKey::from_slice(&[0x22u8; 32]).unwrap();
        let id_1 = PublicKey::from_secret_key(SECP256K1, &secret_1);
        let id_2 = PublicKey::from_secret_key(SECP256K1, &secret_2);
        let update_1 = ChannelUpdate::compose(
            &secret_1,
            id_2,
            Slice32::default(),
            ShortChannelId::new(100, 1, 0).unwrap(),
            0,
            40,
            0,
            1000,
        );
        let update_2 = ChannelUpdate::compose(
            &secret_2,
            id_1,
            Slice32::default(),
            ShortChannelId::new(100, 1, 0).unwrap(),
            0,
            40,
            0,
            1000,
        );
        assert_ne!(
            update_1.channel_flags & CHANNEL_FLAG_DIRECTION,
            update_2.channel_flags & CHANNEL_FLAG_DIRECTION
        );
    }
}
