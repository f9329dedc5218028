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
use std::ops::{BitOr, Range};

use amplify::{Slice32, Wrapper};
use bitcoin::blockdata::constants::genesis_block;
use bitcoin::hashes::Hash;
use bitcoin::util::bip32::DerivationPath;
use bitcoin::Network;
use secp256k1::{PublicKey, SecretKey};
use strict_encoding::{StrictDecode, StrictEncode};

use super::{
    MAX_ACCEPTED_HTLCS, MAX_FUNDING_SATOSHIS, MAX_FUNDING_SATOSHIS_NO_WUMBO,
    MAX_TO_SELF_DELAY, MIN_DUST_LIMIT_SATOSHIS,
};
use crate::p2p::bolt9::{Feature, FeatureSet};
use crate::p2p::{AcceptChannel, OpenChannel};

/// Returns the BOLT chain hash (genesis block hash) of a bitcoin network
pub fn chain_hash(network: Network) -> Slice32 {
    Slice32::from_inner(
        genesis_block(network).block_hash().into_inner(),
    )
}

/// Per-node parameters which do not change for the lifetime of the channel
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct StaticParams {
    /// The genesis hash of the blockchain where the channel resides
    pub chain_hash: Slice32,

    /// Secret key of the local node; also used to sign gossip produced for
    /// the channel
    pub node_secret: SecretKey,

    /// Features advertised by the local node in its `init` message
    pub features: FeatureSet,

    /// The policy for accepting remote node params
    pub policy: Policy,

    /// Id of the remote node operating the other side of the channel
    pub remote_node_id: PublicKey,
}

impl StaticParams {
    /// Detects whether the channel lives on a regtest chain
    #[inline]
    pub fn is_regtest(&self) -> bool {
        self.chain_hash == chain_hash(Network::Regtest)
    }
}

/// Channel parameters set by the local node at the channel open time and
/// required to be met by the remote node operating towards the local one.
///
/// Immutable after the negotiation completes.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct LocalParams {
    /// The threshold below which outputs on transactions broadcast by the
    /// local node will be omitted
    pub dust_limit_satoshis: u64,

    /// The maximum inbound HTLC value in flight towards the local node, in
    /// milli-satoshi
    pub max_htlc_value_in_flight_msat: u64,

    /// The minimum value unencumbered by HTLCs for the counterparty to keep
    /// in the channel
    pub channel_reserve_satoshis: u64,

    /// The minimum HTLC size incoming to the local node, in milli-satoshi
    pub htlc_minimum_msat: u64,

    /// The number of blocks which the counterparty will have to wait to
    /// claim on-chain funds if they broadcast a commitment transaction
    pub to_self_delay: u16,

    /// The maximum number of inbound HTLCs towards the local node
    pub max_accepted_htlcs: u16,

    /// Whether the local node pays the channel funding and the commitment
    /// transaction fees
    pub is_funder: bool,

    /// Derivation path of the key controlling the funding transaction
    /// output, interpreted by the key manager
    pub funding_key_path: DerivationPath,
}

/// Channel parameters negotiated at the channel open time and required to be
/// met by the local node when operating towards the remote one.
///
/// Immutable after the negotiation completes.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct RemoteParams {
    /// The threshold below which outputs on transactions broadcast by the
    /// remote node will be omitted
    pub dust_limit_satoshis: u64,

    /// The maximum inbound HTLC value in flight towards the remote node, in
    /// milli-satoshi
    pub max_htlc_value_in_flight_msat: u64,

    /// The minimum value unencumbered by HTLCs the local node must keep in
    /// the channel
    pub channel_reserve_satoshis: u64,

    /// The minimum HTLC size incoming to the remote node, in milli-satoshi
    pub htlc_minimum_msat: u64,

    /// The number of blocks the local node will have to wait to claim
    /// on-chain funds if it broadcasts a commitment transaction
    pub to_self_delay: u16,

    /// The maximum number of inbound HTLCs towards the remote node
    pub max_accepted_htlcs: u16,

    /// The remote key controlling the funding transaction output
    pub funding_pubkey: PublicKey,

    /// Base point for deriving keys used for penalty spending paths
    pub revocation_basepoint: PublicKey,

    /// Base point for deriving keys in `to_remote` outputs
    pub payment_basepoint: PublicKey,

    /// Base point for deriving keys in `to_local` time-locked spending paths
    pub delayed_payment_basepoint: PublicKey,

    /// Base point for deriving HTLC-related keys
    pub htlc_basepoint: PublicKey,

    /// Features advertised by the remote node in its `init` message
    pub features: FeatureSet,
}

impl RemoteParams {
    /// Extracts remote-side channel parameters out of the received
    /// `open_channel` message
    pub fn from_open_channel(
        open_channel: &OpenChannel,
        features: FeatureSet,
    ) -> RemoteParams {
        RemoteParams {
            dust_limit_satoshis: open_channel.dust_limit_satoshis,
            max_htlc_value_in_flight_msat: open_channel
                .max_htlc_value_in_flight_msat,
            channel_reserve_satoshis: open_channel.channel_reserve_satoshis,
            htlc_minimum_msat: open_channel.htlc_minimum_msat,
            to_self_delay: open_channel.to_self_delay,
            max_accepted_htlcs: open_channel.max_accepted_htlcs,
            funding_pubkey: open_channel.funding_pubkey,
            revocation_basepoint: open_channel.revocation_basepoint,
            payment_basepoint: open_channel.payment_point,
            delayed_payment_basepoint: open_channel
                .delayed_payment_basepoint,
            htlc_basepoint: open_channel.htlc_basepoint,
            features,
        }
    }

    /// Extracts remote-side channel parameters out of the received
    /// `accept_channel` message
    pub fn from_accept_channel(
        accept_channel: &AcceptChannel,
        features: FeatureSet,
    ) -> RemoteParams {
        RemoteParams {
            dust_limit_satoshis: accept_channel.dust_limit_satoshis,
            max_htlc_value_in_flight_msat: accept_channel
                .max_htlc_value_in_flight_msat,
            channel_reserve_satoshis: accept_channel
                .channel_reserve_satoshis,
            htlc_minimum_msat: accept_channel.htlc_minimum_msat,
            to_self_delay: accept_channel.to_self_delay,
            max_accepted_htlcs: accept_channel.max_accepted_htlcs,
            funding_pubkey: accept_channel.funding_pubkey,
            revocation_basepoint: accept_channel.revocation_basepoint,
            payment_basepoint: accept_channel.payment_point,
            delayed_payment_basepoint: accept_channel
                .delayed_payment_basepoint,
            htlc_basepoint: accept_channel.htlc_basepoint,
            features,
        }
    }
}

/// Bit flags of the channel version influencing key derivation and defaults
/// of the channel parameters
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Default,
    StrictEncode,
    StrictDecode,
)]
pub struct ChannelVersion(u8);

impl ChannelVersion {
    /// Channel with no optional protocol features
    pub const STANDARD: ChannelVersion = ChannelVersion(0);

    /// `option_static_remotekey` was negotiated for the channel
    pub const STATIC_REMOTEKEY: ChannelVersion = ChannelVersion(0b0000_0010);

    /// Channel does not require a reserve from either party; the funding
    /// transaction needs no confirmations
    pub const ZERO_RESERVE: ChannelVersion = ChannelVersion(0b0000_1000);

    /// Detects whether the `to_remote` output key is the static payment
    /// basepoint of the counterparty
    #[inline]
    pub fn has_static_remotekey(self) -> bool {
        self.0 & Self::STATIC_REMOTEKEY.0 != 0
    }

    /// Detects whether the channel operates without reserves
    #[inline]
    pub fn is_zero_reserve(self) -> bool {
        self.0 & Self::ZERO_RESERVE.0 != 0
    }
}

impl BitOr for ChannelVersion {
    type Output = ChannelVersion;
    fn bitor(self, rhs: Self) -> Self::Output {
        ChannelVersion(self.0 | rhs.0)
    }
}

impl Display for ChannelVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "v{:#010b}", self.0)
    }
}

/// Errors from [BOLT-2] policy validations for `open_channel` and
/// `accept_channel` messages.
///
/// [BOLT-2]: https://github.com/lightningnetwork/lightning-rfc/blob/master/02-peer-protocol.md
#[derive(
    Clone,
    PartialEq,
    Eq,
    Hash,
    Debug,
    Display,
    Error,
    StrictEncode,
    StrictDecode,
)]
#[display(doc_comments)]
pub enum PolicyError {
    /// channel is proposed on chain {proposed} different from the chain of
    /// the local node {expected}; rejecting the channel according to BOLT-2
    UnknownChain {
        proposed: Slice32,
        expected: Slice32,
    },

    /// proposed `to_self_delay` value {proposed} is unreasonably large and
    /// exceeds node policy limit of {allowed_maximum}; rejecting the channel
    /// according to BOLT-2
    ToSelfDelayUnreasonablyLarge { proposed: u16, allowed_maximum: u16 },

    /// proposed limit for maximum accepted number of HTLCs {0} exceeds
    /// BOLT-3 requirement to be below 483; rejecting the channel according
    /// to BOLT-2
    MaxAcceptedHtlcLimitExceeded(u16),

    /// proposed limit for maximum accepted number of HTLCs must be positive;
    /// rejecting the channel according to BOLT-2
    MaxAcceptedHtlcZero,

    /// proposed fee rate {proposed} sat/kw is outside of the fee rate policy
    /// of the local node ({lowest_accepted}..{highest_accepted} sat/kw);
    /// rejecting the channel according to BOLT-2
    FeeRateUnreasonable {
        proposed: u32,
        lowest_accepted: u32,
        highest_accepted: u32,
    },

    /// dust limit {0} sat is less than protocol minimum requirement of 546
    /// sat; rejecting the channel according to BOLT-2
    DustLimitTooSmall(u64),

    /// dust limit {proposed} sat exceeds node policy requirement of
    /// {allowed_maximum}; rejecting the channel according to BOLT-2
    DustLimitTooLarge { proposed: u64, allowed_maximum: u64 },

    /// offered channel funding of {proposed} sat is too small and less than
    /// {required_minimum} required by the node policy; rejecting the channel
    /// according to BOLT-2
    ChannelFundingTooSmall {
        proposed: u64,
        required_minimum: u64,
    },

    /// offered channel funding of {proposed} sat exceeds the maximum allowed
    /// funding of {allowed_maximum} sat; rejecting the channel according to
    /// BOLT-2
    ChannelFundingTooLarge {
        proposed: u64,
        allowed_maximum: u64,
    },

    /// channel funding of {0} sat requires `option_support_large_channel`
    /// feature which was not negotiated; rejecting the channel according to
    /// BOLT-2
    FundingRequiresWumbo(u64),

    /// pushed amount of {push_msat} msat exceeds the channel funding of
    /// {funding_msat} msat; rejecting the channel according to BOLT-2
    PushAmountExceedsFunding { push_msat: u64, funding_msat: u64 },

    /// HTLC minimum {proposed} is too large and exceeds node policy
    /// requirements ({allowed_maximum}); rejecting the channel according to
    /// BOLT-2
    HtlcMinimumTooLarge { proposed: u64, allowed_maximum: u64 },

    /// HTLC-in-flight maximum requirement of {proposed} is too small and
    /// does not match the node policy; the smallest requirement is
    /// {required_minimum}; rejecting the channel according to BOLT-2
    HtlcInFlightMaximumTooSmall {
        proposed: u64,
        required_minimum: u64,
    },

    /// requested {proposed} channel reserve is too large and exceeds local
    /// policy requirement of {allowed_maximum}; rejecting the channel
    /// according to BOLT-2
    ChannelReserveTooLarge { proposed: u64, allowed_maximum: u64 },

    /// maximum number of HTLCs {proposed} that can be accepted by the
    /// remote node is too small and does not match node policy requirement
    /// of {required_minimum}; rejecting the channel according to BOLT-2
    MaxAcceptedHtlcsTooSmall {
        proposed: u16,
        required_minimum: u16,
    },

    /// minimum depth of {proposed} requested by the remote peer exceeds
    /// local policy limit of {allowed_maximum}; rejecting the channel
    /// according to BOLT-2
    UnreasonableMinDepth { proposed: u32, allowed_maximum: u32 },

    /// `channel_reserve_satoshis` ({channel_reserve}) is less than
    /// `dust_limit_satoshis` ({dust_limit}) within the message; rejecting
    /// the channel according to BOLT-2
    LocalDustExceedsRemoteReserve {
        channel_reserve: u64,
        dust_limit: u64,
    },

    /// `channel_reserve_satoshis` from the message ({channel_reserve}) is
    /// less than the local `dust_limit_satoshis` ({dust_limit}); rejecting
    /// the channel according to BOLT-2
    RemoteDustExceedsLocalReserve {
        channel_reserve: u64,
        dust_limit: u64,
    },
}

/// Policy to validate channel parameters proposed by a remote peer.
///
/// Also the source of the channel parameters defaulted at the node level,
/// like the minimum funding depth.
#[derive(Clone, Eq, PartialEq, Hash, Debug, StrictEncode, StrictDecode)]
pub struct Policy {
    /// Reasonable limit to check value of `to_self_delay` required by a
    /// remote node, in blocks.
    pub to_self_delay_max: u16,

    /// Range of acceptable channel fees.
    pub feerate_per_kw_range: Range<u32>,

    /// Minimum funding transaction mining depth required from the remote
    /// node for a channel proposed by it.
    pub minimum_depth: u32,

    // The following are optional policies which may not be set by a local
    // node:
    /// Maximum funding transaction mining depth which may be required by a
    /// remote node for a channel opened by a local node.
    pub maximum_depth: Option<u32>,

    /// Minimum funding for a channel accepted by this node.
    pub funding_satoshis_min: Option<u64>,

    /// The maximum acceptable limit on the value stored in a single HTLC.
    pub htlc_minimum_msat_max: Option<u64>,

    /// Minimum boundary for the upper limit of in-flight HTLC funds.
    pub max_htlc_value_in_flight_msat_min: Option<u64>,

    /// Maximum reserve for a channel from a local node required by the
    /// remote node, in percents from the channel funding.
    pub channel_reserve_satoshis_max_percent: Option<u8>,

    /// Minimum boundary to the limit of HTLCs offered to a remote peer.
    pub max_accepted_htlcs_min: Option<u16>,

    /// Maximum value for the dust limit required by a remote node.
    pub dust_limit_satoshis_max: Option<u64>,
}

impl Default for Policy {
    /// Sets reasonable values for the local node policies
    fn default() -> Policy {
        Policy {
            to_self_delay_max: MAX_TO_SELF_DELAY,
            // normal operational range for the fees in bitcoin network
            feerate_per_kw_range: 253..40_000,
            // three blocks is enough to get sufficient security
            minimum_depth: 3,
            maximum_depth: Some(6),
            // no reason of spamming blockchain with channels < 10000 sats
            funding_satoshis_min: Some(10_000),
            // HTLCs can be arbitrary small
            htlc_minimum_msat_max: None,
            max_htlc_value_in_flight_msat_min: Some(10_000),
            // the reserve should not exceed 10% of funds in the channel
            channel_reserve_satoshis_max_percent: Some(10),
            max_accepted_htlcs_min: Some(10),
            dust_limit_satoshis_max: Some(1_000),
        }
    }
}

impl Policy {
    /// Validates parameters of the channel proposed by a remote node with an
    /// `open_channel` message (the local node is the fundee) and constructs
    /// remote peer parameters from them.
    pub fn validate_remote_open(
        &self,
        chain_hash: Slice32,
        open_channel: &OpenChannel,
        remote_features: FeatureSet,
        local_params: &LocalParams,
        wumbo_negotiated: bool,
    ) -> Result<RemoteParams, PolicyError> {
        if open_channel.chain_hash != chain_hash {
            return Err(PolicyError::UnknownChain {
                proposed: open_channel.chain_hash,
                expected: chain_hash,
            });
        }
        if open_channel.funding_satoshis > MAX_FUNDING_SATOSHIS {
            return Err(PolicyError::ChannelFundingTooLarge {
                proposed: open_channel.funding_satoshis,
                allowed_maximum: MAX_FUNDING_SATOSHIS,
            });
        }
        if open_channel.funding_satoshis >= MAX_FUNDING_SATOSHIS_NO_WUMBO
            && !wumbo_negotiated
        {
            return Err(PolicyError::FundingRequiresWumbo(
                open_channel.funding_satoshis,
            ));
        }
        if let Some(required_minimum) = self.funding_satoshis_min {
            if open_channel.funding_satoshis < required_minimum {
                return Err(PolicyError::ChannelFundingTooSmall {
                    proposed: open_channel.funding_satoshis,
                    required_minimum,
                });
            }
        }
        let funding_msat = open_channel.funding_satoshis * 1000;
        if open_channel.push_msat > funding_msat {
            return Err(PolicyError::PushAmountExceedsFunding {
                push_msat: open_channel.push_msat,
                funding_msat,
            });
        }
        if !self
            .feerate_per_kw_range
            .contains(&open_channel.feerate_per_kw)
        {
            return Err(PolicyError::FeeRateUnreasonable {
                proposed: open_channel.feerate_per_kw,
                lowest_accepted: self.feerate_per_kw_range.start,
                highest_accepted: self.feerate_per_kw_range.end,
            });
        }
        self.validate_common(
            open_channel.dust_limit_satoshis,
            open_channel.channel_reserve_satoshis,
            open_channel.to_self_delay,
            open_channel.max_accepted_htlcs,
            open_channel.htlc_minimum_msat,
            open_channel.max_htlc_value_in_flight_msat,
            open_channel.funding_satoshis,
            local_params,
        )?;
        Ok(RemoteParams::from_open_channel(
            open_channel,
            remote_features,
        ))
    }

    /// Validates parameters of the channel acceptance by a remote node with
    /// an `accept_channel` message (the local node is the funder) and
    /// constructs remote peer parameters from them.
    pub fn validate_remote_accept(
        &self,
        accept_channel: &AcceptChannel,
        remote_features: FeatureSet,
        local_params: &LocalParams,
        funding_satoshis: u64,
    ) -> Result<RemoteParams, PolicyError> {
        if let Some(allowed_maximum) = self.maximum_depth {
            if accept_channel.minimum_depth > allowed_maximum {
                return Err(PolicyError::UnreasonableMinDepth {
                    proposed: accept_channel.minimum_depth,
                    allowed_maximum,
                });
            }
        }
        self.validate_common(
            accept_channel.dust_limit_satoshis,
            accept_channel.channel_reserve_satoshis,
            accept_channel.to_self_delay,
            accept_channel.max_accepted_htlcs,
            accept_channel.htlc_minimum_msat,
            accept_channel.max_htlc_value_in_flight_msat,
            funding_satoshis,
            local_params,
        )?;
        Ok(RemoteParams::from_accept_channel(
            accept_channel,
            remote_features,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn validate_common(
        &self,
        dust_limit_satoshis: u64,
        channel_reserve_satoshis: u64,
        to_self_delay: u16,
        max_accepted_htlcs: u16,
        htlc_minimum_msat: u64,
        max_htlc_value_in_flight_msat: u64,
        funding_satoshis: u64,
        local_params: &LocalParams,
    ) -> Result<(), PolicyError> {
        if dust_limit_satoshis < MIN_DUST_LIMIT_SATOSHIS {
            return Err(PolicyError::DustLimitTooSmall(dust_limit_satoshis));
        }
        if let Some(allowed_maximum) = self.dust_limit_satoshis_max {
            if dust_limit_satoshis > allowed_maximum {
                return Err(PolicyError::DustLimitTooLarge {
                    proposed: dust_limit_satoshis,
                    allowed_maximum,
                });
            }
        }
        if to_self_delay > self.to_self_delay_max {
            return Err(PolicyError::ToSelfDelayUnreasonablyLarge {
                proposed: to_self_delay,
                allowed_maximum: self.to_self_delay_max,
            });
        }
        if max_accepted_htlcs == 0 {
            return Err(PolicyError::MaxAcceptedHtlcZero);
        }
        if max_accepted_htlcs > MAX_ACCEPTED_HTLCS {
            return Err(PolicyError::MaxAcceptedHtlcLimitExceeded(
                max_accepted_htlcs,
            ));
        }
        if let Some(required_minimum) = self.max_accepted_htlcs_min {
            if max_accepted_htlcs < required_minimum {
                return Err(PolicyError::MaxAcceptedHtlcsTooSmall {
                    proposed: max_accepted_htlcs,
                    required_minimum,
                });
            }
        }
        if let Some(allowed_maximum) = self.htlc_minimum_msat_max {
            if htlc_minimum_msat > allowed_maximum {
                return Err(PolicyError::HtlcMinimumTooLarge {
                    proposed: htlc_minimum_msat,
                    allowed_maximum,
                });
            }
        }
        if let Some(required_minimum) = self.max_htlc_value_in_flight_msat_min
        {
            if max_htlc_value_in_flight_msat < required_minimum {
                return Err(PolicyError::HtlcInFlightMaximumTooSmall {
                    proposed: max_htlc_value_in_flight_msat,
                    required_minimum,
                });
            }
        }
        if let Some(percent) = self.channel_reserve_satoshis_max_percent {
            let allowed_maximum = funding_satoshis * percent as u64 / 100;
            if channel_reserve_satoshis > allowed_maximum {
                return Err(PolicyError::ChannelReserveTooLarge {
                    proposed: channel_reserve_satoshis,
                    allowed_maximum,
                });
            }
        }
        // a zero reserve is an explicit opt-out and not a dust violation
        if channel_reserve_satoshis > 0 {
            if channel_reserve_satoshis < dust_limit_satoshis {
                return Err(PolicyError::LocalDustExceedsRemoteReserve {
                    channel_reserve: channel_reserve_satoshis,
                    dust_limit: dust_limit_satoshis,
                });
            }
            if channel_reserve_satoshis < local_params.dust_limit_satoshis {
                return Err(PolicyError::RemoteDustExceedsLocalReserve {
                    channel_reserve: channel_reserve_satoshis,
                    dust_limit: local_params.dust_limit_satoshis,
                });
            }
        }
        Ok(())
    }
}

/// Computes the channel version negotiated between the peers basing on
/// feature sets of both nodes
pub fn negotiate_channel_version(
    local: &FeatureSet,
    remote: &FeatureSet,
) -> ChannelVersion {
    if FeatureSet::can_use_feature(local, remote, Feature::StaticRemoteKey) {
        ChannelVersion::STANDARD | ChannelVersion::STATIC_REMOTEKEY
    } else {
        ChannelVersion::STANDARD
    }
}

#[cfg(test)]
mod test {
    use amplify::DumbDefault;

    use super::*;
    use crate::p2p::bolt9::FeatureSupport;

    fn local_params() -> LocalParams {
        LocalParams {
            dust_limit_satoshis: MIN_DUST_LIMIT_SATOSHIS,
            max_htlc_value_in_flight_msat: 100_000_000,
            channel_reserve_satoshis: 10_000,
            htlc_minimum_msat: 1,
            to_self_delay: 144,
            max_accepted_htlcs: 30,
            is_funder: false,
            funding_key_path: DerivationPath::default(),
        }
    }

    fn reasonable_open_channel() -> OpenChannel {
        let mut msg = OpenChannel::dumb_default();
        msg.chain_hash = chain_hash(Network::Testnet);
        msg.funding_satoshis = 1_000_000;
        msg.push_msat = 0;
        msg.dust_limit_satoshis = MIN_DUST_LIMIT_SATOSHIS;
        msg.max_htlc_value_in_flight_msat = 100_000_000;
        msg.channel_reserve_satoshis = 10_000;
        msg.htlc_minimum_msat = 1;
        msg.feerate_per_kw = 2500;
        msg.to_self_delay = 144;
        msg.max_accepted_htlcs = 30;
        msg
    }

    #[test]
    fn accepts_reasonable_open_channel() {
        let policy = Policy::default();
        let open_channel = reasonable_open_channel();
        let remote_params = policy
            .validate_remote_open(
                chain_hash(Network::Testnet),
                &open_channel,
                FeatureSet::empty(),
                &local_params(),
                false,
            )
            .unwrap();
        assert_eq!(remote_params.dust_limit_satoshis, MIN_DUST_LIMIT_SATOSHIS);
        assert_eq!(remote_params.to_self_delay, 144);
    }

    #[test]
    fn rejects_wrong_chain() {
        let policy = Policy::default();
        let open_channel = reasonable_open_channel();
        let err = policy
            .validate_remote_open(
                chain_hash(Network::Bitcoin),
                &open_channel,
                FeatureSet::empty(),
                &local_params(),
                false,
            )
            .unwrap_err();
        assert!(matches!(err, PolicyError::UnknownChain { .. }));
    }

    #[test]
    fn rejects_dust_below_protocol_minimum() {
        let policy = Policy::default();
        let mut open_channel = reasonable_open_channel();
        open_channel.dust_limit_satoshis = 300;
        let err = policy
            .validate_remote_open(
                chain_hash(Network::Testnet),
                &open_channel,
                FeatureSet::empty(),
                &local_params(),
                false,
            )
            .unwrap_err();
        assert_eq!(err, PolicyError::DustLimitTooSmall(300));
    }

    #[test]
    fn rejects_excessive_to_self_delay() {
        let policy = Policy::default();
        let mut open_channel = reasonable_open_channel();
        open_channel.to_self_delay = MAX_TO_SELF_DELAY + 1;
        let err = policy
            .validate_remote_open(
                chain_hash(Network::Testnet),
                &open_channel,
                FeatureSet::empty(),
                &local_params(),
                false,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            PolicyError::ToSelfDelayUnreasonablyLarge { .. }
        ));
    }

    #[test]
    fn rejects_large_channel_without_wumbo() {
        let policy = Policy::default();
        let mut open_channel = reasonable_open_channel();
        open_channel.funding_satoshis = MAX_FUNDING_SATOSHIS_NO_WUMBO;
        let err = policy
            .validate_remote_open(
                chain_hash(Network::Testnet),
                &open_channel,
                FeatureSet::empty(),
                &local_params(),
                false,
            )
            .unwrap_err();
        assert_eq!(
            err,
            PolicyError::FundingRequiresWumbo(MAX_FUNDING_SATOSHIS_NO_WUMBO)
        );

        // and accepts it when wumbo is negotiated
        open_channel.channel_reserve_satoshis = 100_000;
        policy
            .validate_remote_open(
                chain_hash(Network::Testnet),
                &open_channel,
                FeatureSet::empty(),
                &local_params(),
                true,
            )
            .unwrap();
    }

    #[test]
    fn rejects_push_above_funding() {
        let policy = Policy::default();
        let mut open_channel = reasonable_open_channel();
        open_channel.push_msat = open_channel.funding_satoshis * 1000 + 1;
        let err = policy
            .validate_remote_open(
                chain_hash(Network::Testnet),
                &open_channel,
                FeatureSet::empty(),
                &local_params(),
                false,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            PolicyError::PushAmountExceedsFunding { .. }
        ));
    }

    #[test]
    fn channel_version_negotiation() {
        let with_remotekey = FeatureSet::from_iter([(
            Feature::StaticRemoteKey,
            FeatureSupport::Optional,
        )]);
        let without = FeatureSet::empty();

        assert!(negotiate_channel_version(&with_remotekey, &with_remotekey)
            .has_static_remotekey());
        assert!(!negotiate_channel_version(&with_remotekey, &without)
            .has_static_remotekey());
        assert!(!negotiate_channel_version(&without, &without)
            .has_static_remotekey());
    }
}
