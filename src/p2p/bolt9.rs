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

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::str::FromStr;

use lightning_encoding::{LightningDecode, LightningEncode};
use strict_encoding::{StrictDecode, StrictEncode};

/// Feature-flags-related errors
#[derive(
    Clone, Copy, PartialEq, Eq, Ord, PartialOrd, Hash, Debug, Display, Error
)]
#[display(doc_comments)]
pub enum Error {
    /// feature `{0}` is set but the `{1}` feature it depends on is missing
    NoRequiredFeature(Feature, Feature),

    /// unknown even feature flag with number {0}
    UnknownEvenFeature(u16),
}

/// Specific named feature flags
///
/// Values of the variants correspond to the mandatory (even) bit number
/// assigned to the feature by BOLT-9; the optional form is the next odd bit.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[non_exhaustive]
#[repr(u16)]
pub enum Feature {
    /// Requires or supports extra `channel_reestablish` fields
    #[display("option_data_loss_protect", alt = "0/1")]
    OptionDataLossProtect = 0,

    /// Sending node needs a complete routing information dump
    #[display("initial_routing_sync", alt = "2/3")]
    InitialRoutingSync = 2,

    /// More sophisticated gossip control
    #[display("gossip_queries", alt = "6/7")]
    ChannelRangeQueries = 6,

    /// Requires/supports variable-length routing onion payloads
    #[display("var_onion_optin", alt = "8/9")]
    VariableLengthOnion = 8,

    /// Gossip queries can include additional information
    #[display("gossip_queries_ex", alt = "10/11")]
    ChannelRangeQueriesExtended = 10,

    /// Static key for remote output
    #[display("option_static_remotekey", alt = "12/13")]
    StaticRemoteKey = 12,

    /// Node supports `payment_secret` field
    #[display("payment_secret", alt = "14/15")]
    PaymentSecret = 14,

    /// Node can receive basic multi-part payments
    #[display("basic_mpp", alt = "16/17")]
    BasicMultiPartPayment = 16,

    /// Can create large channels
    #[display("option_support_large_channel", alt = "18/19")]
    Wumbo = 18,

    /// Node can relay trampoline payments
    #[display("trampoline_payment", alt = "50/51")]
    TrampolinePayment = 50,
    // NB: When adding new feature INCLUDE it into Feature::all
}

impl Feature {
    pub fn all() -> &'static [Feature] {
        &[
            Feature::OptionDataLossProtect,
            Feature::InitialRoutingSync,
            Feature::ChannelRangeQueries,
            Feature::VariableLengthOnion,
            Feature::ChannelRangeQueriesExtended,
            Feature::StaticRemoteKey,
            Feature::PaymentSecret,
            Feature::BasicMultiPartPayment,
            Feature::Wumbo,
            Feature::TrampolinePayment,
        ]
    }

    /// Returns number of the bit that is set by the feature flag under the
    /// given support requirement
    #[inline]
    pub fn bit(self, support: FeatureSupport) -> u16 {
        self as u16 + support as u16
    }

    /// Recognizes a feature from an even (mandatory-form) bit number
    pub fn from_mandatory_bit(bit: u16) -> Option<Feature> {
        let feature = match bit {
            0 => Feature::OptionDataLossProtect,
            2 => Feature::InitialRoutingSync,
            6 => Feature::ChannelRangeQueries,
            8 => Feature::VariableLengthOnion,
            10 => Feature::ChannelRangeQueriesExtended,
            12 => Feature::StaticRemoteKey,
            14 => Feature::PaymentSecret,
            16 => Feature::BasicMultiPartPayment,
            18 => Feature::Wumbo,
            50 => Feature::TrampolinePayment,
            _ => return None,
        };
        Some(feature)
    }

    /// Features which must also be set whenever this feature is set.
    ///
    /// NB: BOLT-9 also requires `payment_secret` to depend on
    /// `var_onion_optin`; that edge is deliberately left out so that invoices
    /// produced before the var-onion rollout remain payable.
    pub fn dependencies(self) -> &'static [Feature] {
        match self {
            Feature::ChannelRangeQueriesExtended => {
                &[Feature::ChannelRangeQueries]
            }
            Feature::BasicMultiPartPayment => &[Feature::PaymentSecret],
            Feature::TrampolinePayment => &[Feature::PaymentSecret],
            _ => &[],
        }
    }
}

/// Error reporting unrecognized feature name
#[derive(
    Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error, From
)]
#[display("the provided feature name is not known: {0}")]
pub struct UnknownFeatureError(pub String);

impl FromStr for Feature {
    type Err = UnknownFeatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::all()
            .iter()
            .find(|feature| feature.to_string() == s)
            .copied()
            .ok_or_else(|| UnknownFeatureError(s.to_owned()))
    }
}

/// Level of support for a particular feature
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[repr(u8)]
pub enum FeatureSupport {
    /// Even-bit form: peers not knowing the feature must close the
    /// connection
    #[display("mandatory")]
    Mandatory = 0,

    /// Odd-bit form: it's ok to be odd
    #[display("optional")]
    Optional = 1,
}

/// Set of feature flags from `init`, `node_announcement` or invoice contexts.
///
/// Flags are numbered from the least-significant bit, at bit 0 (i.e. 0x1, an
/// even bit). They are generally assigned in pairs so that features can be
/// introduced as optional (odd bits) and later upgraded to be compulsory
/// (even bits), which will be refused by outdated nodes.
///
/// # Specification
/// <https://github.com/lightningnetwork/lightning-rfc/blob/master/09-features.md>
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct FeatureSet {
    /// Features known to the implementation, with their support level
    activated: BTreeSet<(Feature, FeatureSupport)>,

    /// Rest of feature bits which are unknown to the current implementation
    unknown: BTreeSet<u16>,
}

impl Display for FeatureSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (feature, support) in &self.activated {
            Display::fmt(feature, f)?;
            if *support == FeatureSupport::Optional {
                f.write_str("?")?;
            }
            f.write_str(", ")?;
        }
        for bit in &self.unknown {
            write!(f, "unknown({}), ", bit)?;
        }
        Ok(())
    }
}

impl FromIterator<(Feature, FeatureSupport)> for FeatureSet {
    fn from_iter<T: IntoIterator<Item = (Feature, FeatureSupport)>>(
        iter: T,
    ) -> Self {
        FeatureSet {
            activated: iter.into_iter().collect(),
            unknown: BTreeSet::new(),
        }
    }
}

impl FeatureSet {
    /// Constructs empty feature set
    #[inline]
    pub fn empty() -> FeatureSet {
        FeatureSet::default()
    }

    /// Adds a known feature to the set
    #[inline]
    pub fn set_feature(&mut self, feature: Feature, support: FeatureSupport) {
        self.activated.insert((feature, support));
    }

    /// Adds an unrecognized feature bit to the set
    #[inline]
    pub fn set_unknown(&mut self, bit: u16) {
        self.unknown.insert(bit);
    }

    /// Known activated features with their support levels
    #[inline]
    pub fn activated(&self) -> &BTreeSet<(Feature, FeatureSupport)> {
        &self.activated
    }

    /// Set bits not recognized by this implementation
    #[inline]
    pub fn unknown(&self) -> &BTreeSet<u16> {
        &self.unknown
    }

    /// Checks whether a feature is activated in either mandatory or optional
    /// form
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.activated.iter().any(|(f, _)| *f == feature)
    }

    /// Checks whether a feature is activated with a specific support level
    pub fn has_feature_support(
        &self,
        feature: Feature,
        support: FeatureSupport,
    ) -> bool {
        self.activated.contains(&(feature, support))
    }

    /// Checks that each activated feature has all features it depends on
    /// also present in the set
    pub fn validate_dependencies(&self) -> Result<(), Error> {
        for (feature, _) in &self.activated {
            for dependency in feature.dependencies() {
                if !self.has_feature(*dependency) {
                    return Err(Error::NoRequiredFeature(
                        *feature,
                        *dependency,
                    ));
                }
            }
        }
        Ok(())
    }

    /// A feature set is supported when it contains no unknown even
    /// (mandatory) bits and every mandatory activated feature belongs to the
    /// mandatory features implemented by this library
    pub fn are_supported(&self) -> bool {
        if self.unknown.iter().any(|bit| bit % 2 == 0) {
            return false;
        }
        self.activated
            .iter()
            .filter(|(_, support)| *support == FeatureSupport::Mandatory)
            .all(|(feature, _)| supported_mandatory().contains(feature))
    }

    /// Checks that the feature can be used in the channel: both the local
    /// and the remote peer must have it activated
    pub fn can_use_feature(
        local: &FeatureSet,
        remote: &FeatureSet,
        feature: Feature,
    ) -> bool {
        local.has_feature(feature) && remote.has_feature(feature)
    }

    /// Serializes the feature set into a big-endian bit field, where bit 0 is
    /// the least-significant bit of the last byte. Leading zero bytes are
    /// trimmed.
    pub fn to_bytes(&self) -> Vec<u8> {
        let bits = self.bits();
        let max_bit = match bits.iter().next_back() {
            Some(bit) => *bit,
            None => return vec![],
        };
        let len = max_bit as usize / 8 + 1;
        let mut vec = vec![0u8; len];
        for bit in bits {
            vec[len - 1 - bit as usize / 8] |= 1 << (bit % 8);
        }
        vec
    }

    /// Reconstructs the feature set from its big-endian bit field
    /// serialization. Inverse of [`FeatureSet::to_bytes`]; all bits, known
    /// and unknown, are preserved.
    pub fn from_bytes(data: &[u8]) -> FeatureSet {
        let len = data.len();
        let mut set = FeatureSet::empty();
        for (index, byte) in data.iter().enumerate() {
            for bit_no in 0u16..8 {
                if byte & (1u8 << bit_no) == 0 {
                    continue;
                }
                let bit = ((len - 1 - index) * 8) as u16 + bit_no;
                match Feature::from_mandatory_bit(bit & !1) {
                    Some(feature) if bit & 1 == 0 => {
                        set.set_feature(feature, FeatureSupport::Mandatory)
                    }
                    Some(feature) => {
                        set.set_feature(feature, FeatureSupport::Optional)
                    }
                    None => set.set_unknown(bit),
                }
            }
        }
        set
    }

    fn bits(&self) -> BTreeSet<u16> {
        self.activated
            .iter()
            .map(|(feature, support)| feature.bit(*support))
            .chain(self.unknown.iter().copied())
            .collect()
    }
}

/// Mandatory features implemented by this library; a remote peer requiring
/// anything else can't be talked to
pub fn supported_mandatory() -> &'static [Feature] {
    &[
        Feature::OptionDataLossProtect,
        Feature::ChannelRangeQueries,
        Feature::VariableLengthOnion,
        Feature::ChannelRangeQueriesExtended,
        Feature::PaymentSecret,
        Feature::BasicMultiPartPayment,
        Feature::Wumbo,
    ]
}

impl StrictEncode for FeatureSet {
    fn strict_encode<E: io::Write>(
        &self,
        e: E,
    ) -> Result<usize, strict_encoding::Error> {
        self.to_bytes().strict_encode(e)
    }
}

impl StrictDecode for FeatureSet {
    fn strict_decode<D: io::Read>(
        d: D,
    ) -> Result<Self, strict_encoding::Error> {
        Ok(FeatureSet::from_bytes(&Vec::<u8>::strict_decode(d)?))
    }
}

impl LightningEncode for FeatureSet {
    fn lightning_encode<E: io::Write>(
        &self,
        mut e: E,
    ) -> Result<usize, lightning_encoding::Error> {
        let data = self.to_bytes();
        let mut len = 2usize;
        e.write_all(&(data.len() as u16).to_be_bytes())?;
        e.write_all(&data)?;
        len += data.len();
        Ok(len)
    }
}

impl LightningDecode for FeatureSet {
    fn lightning_decode<D: io::Read>(
        mut d: D,
    ) -> Result<Self, lightning_encoding::Error> {
        let mut len = [0u8; 2];
        d.read_exact(&mut len)?;
        let mut data = vec![0u8; u16::from_be_bytes(len) as usize];
        d.read_exact(&mut data)?;
        Ok(FeatureSet::from_bytes(&data))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn feature_bits() {
        assert_eq!(
            Feature::OptionDataLossProtect.bit(FeatureSupport::Mandatory),
            0
        );
        assert_eq!(
            Feature::OptionDataLossProtect.bit(FeatureSupport::Optional),
            1
        );
        assert_eq!(Feature::PaymentSecret.bit(FeatureSupport::Mandatory), 14);
        assert_eq!(
            Feature::TrampolinePayment.bit(FeatureSupport::Optional),
            51
        );
    }

    #[test]
    fn feature_names_round_trip() {
        for feature in Feature::all() {
            assert_eq!(
                Feature::from_str(&feature.to_string()),
                Ok(*feature)
            );
        }
        assert_eq!(
            Feature::from_str("option_teleportation"),
            Err(UnknownFeatureError(s!("option_teleportation")))
        );
    }

    #[test]
    fn to_bytes_known_vectors() {
        // var_onion_optin (optional, bit 9) + payment_secret (mandatory,
        // bit 14)
        let set = FeatureSet::from_iter([
            (Feature::VariableLengthOnion, FeatureSupport::Optional),
            (Feature::PaymentSecret, FeatureSupport::Mandatory),
        ]);
        assert_eq!(set.to_bytes(), vec![0x42, 0x00]);

        // var_onion_optin (mandatory, bit 8) + payment_secret (mandatory,
        // bit 14)
        let set = FeatureSet::from_iter([
            (Feature::VariableLengthOnion, FeatureSupport::Mandatory),
            (Feature::PaymentSecret, FeatureSupport::Mandatory),
        ]);
        assert_eq!(set.to_bytes(), vec![0x41, 0x00]);

        assert_eq!(FeatureSet::empty().to_bytes(), Vec::<u8>::new());
    }

    #[test]
    fn bytes_round_trip() {
        let supports = [FeatureSupport::Mandatory, FeatureSupport::Optional];
        for feature in Feature::all() {
            for support in supports {
                let mut set = FeatureSet::empty();
                set.set_feature(*feature, support);
                set.set_unknown(101);
                assert_eq!(
                    FeatureSet::from_bytes(&set.to_bytes()),
                    set,
                    "feature {} ({})",
                    feature,
                    support
                );
            }
        }

        let mut set = FeatureSet::from_iter([
            (Feature::OptionDataLossProtect, FeatureSupport::Optional),
            (Feature::ChannelRangeQueries, FeatureSupport::Optional),
            (Feature::ChannelRangeQueriesExtended, FeatureSupport::Optional),
            (Feature::VariableLengthOnion, FeatureSupport::Mandatory),
            (Feature::PaymentSecret, FeatureSupport::Mandatory),
            (Feature::BasicMultiPartPayment, FeatureSupport::Optional),
            (Feature::Wumbo, FeatureSupport::Optional),
            (Feature::TrampolinePayment, FeatureSupport::Optional),
        ]);
        set.set_unknown(24);
        set.set_unknown(123);
        assert_eq!(FeatureSet::from_bytes(&set.to_bytes()), set);

        // a feature activated in both forms at once must also survive
        let mut set = FeatureSet::empty();
        set.set_feature(Feature::PaymentSecret, FeatureSupport::Mandatory);
        set.set_feature(Feature::PaymentSecret, FeatureSupport::Optional);
        assert_eq!(FeatureSet::from_bytes(&set.to_bytes()), set);
    }

    #[test]
    fn lightning_encoding_round_trip() {
        let set = FeatureSet::from_iter([
            (Feature::VariableLengthOnion, FeatureSupport::Optional),
            (Feature::PaymentSecret, FeatureSupport::Mandatory),
        ]);
        let data = set.lightning_serialize().unwrap();
        assert_eq!(data, vec![0x00, 0x02, 0x42, 0x00]);
        assert_eq!(FeatureSet::lightning_deserialize(&data).unwrap(), set);
    }

    #[test]
    fn dependencies() {
        let set = FeatureSet::from_iter([(
            Feature::BasicMultiPartPayment,
            FeatureSupport::Optional,
        )]);
        let err = set.validate_dependencies().unwrap_err();
        assert_eq!(
            err,
            Error::NoRequiredFeature(
                Feature::BasicMultiPartPayment,
                Feature::PaymentSecret
            )
        );
        assert!(err.to_string().contains("payment_secret"));

        let set = FeatureSet::from_iter([
            (Feature::BasicMultiPartPayment, FeatureSupport::Optional),
            (Feature::PaymentSecret, FeatureSupport::Mandatory),
        ]);
        assert_eq!(set.validate_dependencies(), Ok(()));

        let set = FeatureSet::from_iter([(
            Feature::ChannelRangeQueriesExtended,
            FeatureSupport::Optional,
        )]);
        assert_eq!(
            set.validate_dependencies(),
            Err(Error::NoRequiredFeature(
                Feature::ChannelRangeQueriesExtended,
                Feature::ChannelRangeQueries
            ))
        );

        let set = FeatureSet::from_iter([(
            Feature::TrampolinePayment,
            FeatureSupport::Optional,
        )]);
        assert_eq!(
            set.validate_dependencies(),
            Err(Error::NoRequiredFeature(
                Feature::TrampolinePayment,
                Feature::PaymentSecret
            ))
        );

        // payment_secret alone is fine: the var_onion_optin dependency is
        // intentionally relaxed
        let set = FeatureSet::from_iter([(
            Feature::PaymentSecret,
            FeatureSupport::Mandatory,
        )]);
        assert_eq!(set.validate_dependencies(), Ok(()));
    }

    #[test]
    fn supported_sets() {
        assert!(FeatureSet::empty().are_supported());

        let mut set = FeatureSet::empty();
        set.set_unknown(20);
        assert!(!set.are_supported());

        let mut set = FeatureSet::empty();
        set.set_unknown(21);
        assert!(set.are_supported());

        let set = FeatureSet::from_iter([(
            Feature::StaticRemoteKey,
            FeatureSupport::Mandatory,
        )]);
        assert!(!set.are_supported());

        let set = FeatureSet::from_iter([
            (Feature::StaticRemoteKey, FeatureSupport::Optional),
            (Feature::PaymentSecret, FeatureSupport::Mandatory),
        ]);
        assert!(set.are_supported());
    }

    #[test]
    fn feature_intersection() {
        let local = FeatureSet::from_iter([
            (Feature::StaticRemoteKey, FeatureSupport::Optional),
            (Feature::PaymentSecret, FeatureSupport::Mandatory),
        ]);
        let remote = FeatureSet::from_iter([(
            Feature::StaticRemoteKey,
            FeatureSupport::Mandatory,
        )]);
        assert!(FeatureSet::can_use_feature(
            &local,
            &remote,
            Feature::StaticRemoteKey
        ));
        assert!(!FeatureSet::can_use_feature(
            &local,
            &remote,
            Feature::PaymentSecret
        ));
    }
}
