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

//! Channel state machine: a pure transition function over a tagged sum of
//! channel states, the commitment bookkeeping it operates on, and the driver
//! pumping events through it.

pub mod bolt3;
pub mod commitments;
pub mod driver;
pub mod keys;
pub mod params;
pub mod secrets;
pub mod state;

mod fsm;

pub use commitments::{
    ChangeLog, CommitmentSpec, Commitments, Direction, DirectedHtlc,
    HtlcInfo, LocalCommit, RemoteCommit, RemoteNextCommitInfo,
    WaitingForRevocation,
};
pub use params::{
    ChannelVersion, LocalParams, Policy, PolicyError, RemoteParams,
    StaticParams,
};

use crate::p2p::ChannelId;

/// Number of confirmations after which the channel is buried enough to be
/// announced to the network
pub const ANNOUNCEMENTS_MINCONF: u32 = 6;

/// Absolute limit on the channel funding, 10 BTC
pub const MAX_FUNDING_SATOSHIS: u64 = 1_000_000_000;

/// Channels below 2^24 sat do not require `option_support_large_channel`
pub const MAX_FUNDING_SATOSHIS_NO_WUMBO: u64 = 1 << 24;

/// Limit for the maximum number of the accepted HTLCs towards some node
/// required by BOLT-2
pub const MAX_ACCEPTED_HTLCS: u16 = 483;

/// The smallest dust limit allowed for either channel party
pub const MIN_DUST_LIMIT_SATOSHIS: u64 = 546;

/// Maximum number of fee negotiation rounds during a mutual close
pub const MAX_NEGOTIATION_ITERATIONS: usize = 20;

/// Smallest distance between an HTLC expiry and the current chain height
pub const MIN_CLTV_EXPIRY_DELTA: u32 = 9;

/// Largest distance between an HTLC expiry and the current chain height,
/// one week of blocks
pub const MAX_CLTV_EXPIRY_DELTA: u32 = 7 * 144;

/// Largest `to_self_delay` which may be required from the local node
pub const MAX_TO_SELF_DELAY: u16 = 2016;

/// A fundee abandons the channel if the funding transaction does not confirm
/// within this period, 5 days in seconds
pub const FUNDING_TIMEOUT_FUNDEE_SECONDS: u64 = 5 * 24 * 3600;

/// Errors generated by the channel state machine and the commitment
/// bookkeeping.
///
/// Each error reported from a transition becomes a
/// [`state::Action::HandleError`] and leaves the state itself unchanged.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// Policy errors happening during channel negotiation
    #[from]
    #[display(inner)]
    Policy(PolicyError),

    /// Feature errors happening during channel negotiation
    #[from]
    #[display(inner)]
    Features(crate::p2p::bolt9::Error),

    /// HTLC amount of {0} msat is below the minimal amount accepted by the
    /// peer
    HtlcValueTooSmall(u64),

    /// total HTLC value in flight of {actual} msat would exceed the limit of
    /// {maximum} msat
    HtlcValueTooHighInFlight { actual: u64, maximum: u64 },

    /// the commitment transaction can't accept more than {0} HTLCs
    TooManyAcceptedHtlcs(u16),

    /// insufficient funds: missing {0} msat to cover the HTLC amount
    /// together with the channel reserve and the commitment transaction fee
    InsufficientFunds(u64),

    /// HTLC expiry {actual} is too close to the current chain height
    /// {height}
    ExpiryTooSmall { actual: u32, height: u32 },

    /// HTLC expiry {actual} is too far from the current chain height
    /// {height}
    ExpiryTooBig { actual: u32, height: u32 },

    /// unexpected HTLC id {actual}; the next expected id is {expected}
    UnexpectedHtlcId { expected: u64, actual: u64 },

    /// unknown HTLC id {0}
    UnknownHtlcId(u64),

    /// HTLC {0} is already resolved by a pending fulfill or fail
    HtlcAlreadyResolved(u64),

    /// payment preimage does not match the payment hash of HTLC {0}
    InvalidHtlcPreimage(u64),

    /// failure code {0:#06x} of update_fail_malformed_htlc does not have the
    /// BADONION bit set
    InvalidFailureCode(u16),

    /// invalid remote signature on the commitment transaction
    InvalidCommitmentSignature,

    /// invalid remote signature on HTLC transaction #{0}
    InvalidHtlcSignature(u64),

    /// commitment_signed carries {actual} HTLC signatures while the
    /// commitment transaction contains {expected} HTLC outputs
    HtlcSigCountMismatch { expected: usize, actual: usize },

    /// revealed per-commitment secret does not match the revoked commitment
    /// point
    InvalidRevocation,

    /// received revoke_and_ack while no commitment was awaiting revocation
    UnexpectedRevocation,

    /// no pending changes to put into a new commitment
    CannotSignWithoutChanges,

    /// previous commitment has not been revoked yet
    CannotSignBeforeRevocation,

    /// constructed funding transaction output does not pay to the channel
    /// funding script
    FundingScriptMismatch,

    /// funding transaction has no output #{0}
    FundingOutputMissing(u16),

    /// confirmed funding transaction does not pay the expected script and
    /// amount on the funding output
    FundingTxVerification,

    /// the funder can't afford the commitment transaction fee of {fee} sat
    /// with a balance of {available} msat
    CannotAffordFees { fee: u64, available: u64 },

    /// no new HTLCs can be added: channel shutdown is in progress
    NoMoreHtlcsClosingInProgress,

    /// peer message refers to channel {actual} instead of {expected}
    ChannelIdMismatch {
        expected: ChannelId,
        actual: ChannelId,
    },
}
