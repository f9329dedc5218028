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

#![recursion_limit = "256"]
// Coding conventions
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    //missing_docs
)]

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate log;
#[cfg(feature = "serde")]
extern crate serde_crate as serde;
#[cfg(feature = "serde")]
#[macro_use]
extern crate serde_with;

macro_rules! dumb_pubkey {
    () => {
        secp256k1::PublicKey::from_secret_key(
            secp256k1::SECP256K1,
            &secp256k1::ONE_KEY,
        )
    };
}

pub mod channel;
pub mod p2p;

pub use channel::driver::ChannelDriver;
pub use channel::keys::{Clock, KeyManager, ProcessCtx};
pub use channel::state::{Action, ChannelState, Command, Event};
pub use channel::Commitments;
pub use p2p::bolt9::{Feature, FeatureSet, FeatureSupport};
pub use p2p::Messages;
