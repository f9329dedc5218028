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

//! Data types for BOLT-defined peer messages used by the channel state
//! machine. Serialization of the message payloads is bit-exact with the
//! BOLT-1/BOLT-2 wire format; message framing and transport encryption
//! belong to the node, not to this library.

pub mod bolt1;
pub mod bolt2;
pub mod bolt7;
pub mod bolt9;
mod types;

pub use bolt1::Init;
pub use bolt2::{
    AcceptChannel, CommitmentSigned, FundingCreated, FundingLocked,
    FundingSigned, OpenChannel, RevokeAndAck, Shutdown, UpdateAddHtlc,
    UpdateFailHtlc, UpdateFailMalformedHtlc, UpdateFulfillHtlc,
};
pub use bolt7::{ChannelAnnouncement, ChannelUpdate};
pub use types::{
    ChannelId, OnionPacket, ShortChannelId, ShortChannelIdParseError,
    TempChannelId, PAYMENT_SPHINX_LEN,
};

use strict_encoding::{StrictDecode, StrictEncode};

/// Set of peer messages the channel state machine reacts on.
///
/// Message type ids and framing are applied by the node transport layer; the
/// state machine only distinguishes payloads.
#[derive(Clone, PartialEq, Eq, Debug, Display, From)]
#[derive(StrictEncode, StrictDecode)]
#[display(inner)]
#[non_exhaustive]
pub enum Messages {
    #[from]
    Init(Init),

    #[from]
    Error(bolt1::Error),

    #[from]
    OpenChannel(OpenChannel),

    #[from]
    AcceptChannel(AcceptChannel),

    #[from]
    FundingCreated(FundingCreated),

    #[from]
    FundingSigned(FundingSigned),

    #[from]
    FundingLocked(FundingLocked),

    #[from]
    Shutdown(Shutdown),

    #[from]
    UpdateAddHtlc(UpdateAddHtlc),

    #[from]
    UpdateFulfillHtlc(UpdateFulfillHtlc),

    #[from]
    UpdateFailHtlc(UpdateFailHtlc),

    #[from]
    UpdateFailMalformedHtlc(UpdateFailMalformedHtlc),

    #[from]
    CommitmentSigned(CommitmentSigned),

    #[from]
    RevokeAndAck(RevokeAndAck),
}
