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

use std::fmt::{self, Display, Formatter};

use lightning_encoding::{LightningDecode, LightningEncode};
use strict_encoding::{StrictDecode, StrictEncode};

use super::bolt9::FeatureSet;
use super::ChannelId;

/// Once authentication is complete, the first message reveals the features
/// supported or required by this node, even if this is a reconnection.
///
/// # Specification
/// <https://github.com/lightningnetwork/lightning-rfc/blob/master/01-messaging.md#the-init-message>
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[derive(LightningEncode, LightningDecode)]
#[display("init({global_features}, {local_features})")]
pub struct Init {
    pub global_features: FeatureSet,
    pub local_features: FeatureSet,
}

impl Init {
    /// Constructs `init` message with no global features
    pub fn with(local_features: FeatureSet) -> Init {
        Init {
            global_features: FeatureSet::empty(),
            local_features,
        }
    }

    /// Features operating the channels with the peer: the union of the
    /// global and local feature sets
    pub fn features(&self) -> FeatureSet {
        let mut features = self.local_features.clone();
        for (feature, support) in self.global_features.activated() {
            features.set_feature(*feature, *support);
        }
        for bit in self.global_features.unknown() {
            features.set_unknown(*bit);
        }
        features
    }
}

/// For simplicity of diagnosis, it's often useful to tell a peer that
/// something is incorrect.
///
/// # Specification
/// <https://github.com/lightningnetwork/lightning-rfc/blob/master/01-messaging.md#the-error-message>
#[derive(Clone, PartialEq, Eq, Debug, Error)]
#[derive(StrictEncode, StrictDecode)]
#[derive(LightningEncode, LightningDecode)]
pub struct Error {
    /// The channel is referred to by channel_id, unless channel_id is 0
    /// (i.e. all bytes are 0), in which case it refers to all channels.
    pub channel_id: ChannelId,

    /// Any specific error details, either as string or binary data
    pub data: Vec<u8>,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("Error")?;
        if self.channel_id.is_wildcard() {
            f.write_str(" on all channels")?;
        } else {
            write!(f, " on channel {}", self.channel_id)?;
        }
        // NB: if data is not composed solely of printable ASCII characters
        // (for reference: the printable character set includes byte values 32
        // through 126, inclusive) SHOULD NOT print out data verbatim.
        if self
            .data
            .iter()
            .all(|byte| (32..=126).contains(byte))
        {
            if let Ok(msg) = String::from_utf8(self.data.clone()) {
                write!(f, ": {}", msg)?;
            }
        }
        Ok(())
    }
}
