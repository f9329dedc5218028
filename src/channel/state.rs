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

//! Data model of the channel state machine: the tagged sum of channel
//! states with their invariant fields, the events feeding the machine and
//! the actions it instructs the driver to perform.

use std::io;

use bitcoin::consensus::{deserialize, serialize};
use bitcoin::hashes::sha256;
use bitcoin::{BlockHeader, OutPoint, Txid};
use bitcoin_scripts::hlc::{HashLock, HashPreimage};
use bitcoin_scripts::PubkeyScript;
use secp256k1::PublicKey;
use strict_encoding::{StrictDecode, StrictEncode};

use super::bolt3::{FundingInput, StoredTx};
use super::commitments::{CommitmentSpec, Commitments, HtlcInfo, RemoteCommit};
use super::params::{
    ChannelVersion, LocalParams, RemoteParams, StaticParams,
};
use super::Error;
use crate::p2p::{
    AcceptChannel, ChannelAnnouncement, ChannelId, ChannelUpdate,
    FundingCreated, FundingLocked, FundingSigned, Init, Messages,
    OnionPacket, OpenChannel, ShortChannelId, Shutdown, TempChannelId,
    UpdateAddHtlc, UpdateFailHtlc, UpdateFailMalformedHtlc,
};

/// The best known block of the chain the channel operates on
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ChainTip {
    pub height: u32,
    pub header: BlockHeader,
}

impl StrictEncode for ChainTip {
    fn strict_encode<E: io::Write>(
        &self,
        mut e: E,
    ) -> Result<usize, strict_encoding::Error> {
        Ok(self.height.strict_encode(&mut e)?
            + serialize(&self.header).strict_encode(e)?)
    }
}

impl StrictDecode for ChainTip {
    fn strict_decode<D: io::Read>(
        mut d: D,
    ) -> Result<Self, strict_encoding::Error> {
        let height = u32::strict_decode(&mut d)?;
        let data = Vec::<u8>::strict_decode(d)?;
        let header = deserialize(&data).map_err(|err| {
            strict_encoding::Error::DataIntegrityError(err.to_string())
        })?;
        Ok(ChainTip { height, header })
    }
}

// --- Events

/// Instruction to open a channel towards the remote peer, making the local
/// node the funder
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct InitFunder {
    pub temp_channel_id: TempChannelId,
    pub funding_satoshis: u64,
    pub push_msat: u64,
    pub initial_feerate_per_kw: u32,
    pub local_params: LocalParams,
    pub channel_flags: u8,
    pub remote_init: Init,
}

/// Instruction to await a channel open from the remote peer, making the
/// local node the fundee
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct InitFundee {
    pub temp_channel_id: TempChannelId,
    pub local_params: LocalParams,
    pub remote_init: Init,
}

/// Funding transaction constructed by the on-chain wallet in response to
/// [`Action::MakeFundingTx`]
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MakeFundingTxResponse {
    pub funding_tx: StoredTx,
    pub funding_tx_output_index: u16,
    pub fee: u64,
}

/// Notification from the blockchain watcher
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum WatchEvent {
    /// The watched transaction reached the requested depth
    Confirmed {
        txid: Txid,
        tx: StoredTx,
        block_height: u32,
        tx_index: u32,
    },

    /// The watched outpoint was spent
    Spent { tx: StoredTx },
}

/// Local command to add a new outgoing HTLC
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CmdAddHtlc {
    pub amount_msat: u64,
    pub payment_hash: HashLock,
    pub cltv_expiry: u32,
    pub onion: OnionPacket,
    /// Sign right away after the HTLC is proposed
    pub commit: bool,
}

/// Local command to fulfill an incoming HTLC
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CmdFulfillHtlc {
    pub htlc_id: u64,
    pub payment_preimage: HashPreimage,
    pub commit: bool,
}

/// Local command to fail an incoming HTLC
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CmdFailHtlc {
    pub htlc_id: u64,
    pub reason: Vec<u8>,
    pub commit: bool,
}

/// Local command to report an incoming HTLC as malformed
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CmdFailMalformedHtlc {
    pub htlc_id: u64,
    pub sha256_of_onion: sha256::Hash,
    pub failure_code: u16,
    pub commit: bool,
}

/// Commands the local node applies to an operating channel
#[derive(Clone, PartialEq, Eq, Debug, Display, From)]
pub enum Command {
    #[display("CMD_ADD_HTLC")]
    #[from]
    AddHtlc(CmdAddHtlc),

    #[display("CMD_FULFILL_HTLC")]
    #[from]
    FulfillHtlc(CmdFulfillHtlc),

    #[display("CMD_FAIL_HTLC")]
    #[from]
    FailHtlc(CmdFailHtlc),

    #[display("CMD_FAIL_MALFORMED_HTLC")]
    #[from]
    FailMalformedHtlc(CmdFailMalformedHtlc),

    #[display("CMD_SIGN")]
    Sign,
}

/// Everything the channel state machine can react on. Events are produced
/// by the peer connection, the blockchain watcher, the on-chain wallet and
/// the local node and are consumed strictly in FIFO order.
#[derive(Clone, PartialEq, Eq, Debug, Display, From)]
pub enum Event {
    #[display("init_funder")]
    #[from]
    InitFunder(InitFunder),

    #[display("init_fundee")]
    #[from]
    InitFundee(InitFundee),

    #[display("message({0})")]
    #[from]
    MessageReceived(Messages),

    #[display("watch_event")]
    #[from]
    WatchReceived(WatchEvent),

    #[display("funding_tx_response")]
    #[from]
    MakeFundingTxResponse(MakeFundingTxResponse),

    #[display("command({0})")]
    #[from]
    ExecuteCommand(Command),
}

/// Subscription request to the blockchain watcher
#[derive(Clone, PartialEq, Eq, Debug, Display)]
pub enum WatchRequest {
    /// Report any transaction spending the outpoint
    #[display("watch_spent({0})")]
    Spent(OutPoint),

    /// Report when the transaction reaches the given depth
    #[display("watch_confirmed({txid}, {min_depth})")]
    Confirmed { txid: Txid, min_depth: u32 },

    /// Report if the transaction is reorged out of the chain
    #[display("watch_lost({0})")]
    Lost(Txid),
}

/// Side effects requested by a state transition; dispatched by the driver
/// in the exact order they were emitted
#[derive(Clone, PartialEq, Eq, Debug, Display)]
pub enum Action {
    /// Send a message to the remote peer
    #[display("send_message({0})")]
    SendMessage(Messages),

    /// Register a watch with the blockchain watcher
    #[display("send_watch({0})")]
    SendWatch(WatchRequest),

    /// Broadcast a transaction (the funding transaction)
    #[display("publish_tx")]
    PublishTx(StoredTx),

    /// Ask the on-chain wallet to construct the funding transaction
    #[display("make_funding_tx({amount} sat)")]
    MakeFundingTx {
        script_pubkey: PubkeyScript,
        amount: u64,
        feerate_per_kw: u32,
    },

    /// The final channel id is known now (funder side)
    #[display("channel_id_assigned({channel_id})")]
    ChannelIdAssigned {
        temp_channel_id: TempChannelId,
        channel_id: ChannelId,
    },

    /// The final channel id replaces the temporary one (fundee side)
    #[display("channel_id_switch({channel_id})")]
    ChannelIdSwitch {
        temp_channel_id: TempChannelId,
        channel_id: ChannelId,
    },

    /// Persist the channel state before any following irreversible action
    #[display("store_state")]
    StoreState,

    /// Persist HTLC data of the yet-unrevoked remote commitment
    #[display("store_htlc_infos({0:#?})")]
    StoreHtlcInfos(Vec<HtlcInfo>),

    /// Re-enqueue a command for the next processing round
    #[display("process_command({0})")]
    ProcessCommand(Command),

    /// An incoming HTLC became irrevocable and can be handled by the
    /// payment layer
    #[display("process_add({0})")]
    ProcessAdd(UpdateAddHtlc),

    /// An outgoing HTLC was irrevocably failed by the peer
    #[display("process_fail({0})")]
    ProcessFail(UpdateFailHtlc),

    /// An outgoing HTLC was irrevocably reported malformed by the peer
    #[display("process_fail_malformed({0})")]
    ProcessFailMalformed(UpdateFailMalformedHtlc),

    /// The transition failed; the driver reports the error and, where the
    /// protocol demands, fails the channel
    #[display("handle_error({0})")]
    HandleError(Error),
}

// --- States

/// Initial state: the channel machine exists but has not been told its role
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct WaitForInit {
    pub static_params: StaticParams,
    pub current_tip: ChainTip,
}

/// Fundee awaiting the `open_channel` message
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct WaitForOpenChannel {
    pub static_params: StaticParams,
    pub current_tip: ChainTip,
    pub temp_channel_id: TempChannelId,
    pub local_params: LocalParams,
    pub remote_init: Init,
}

/// Funder awaiting the `accept_channel` message
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct WaitForAcceptChannel {
    pub static_params: StaticParams,
    pub current_tip: ChainTip,
    pub init_funder: InitFunder,
    pub channel_version: ChannelVersion,
    pub last_sent: OpenChannel,
}

/// Funder awaiting the wallet to construct the funding transaction
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct WaitForFundingInternal {
    pub static_params: StaticParams,
    pub current_tip: ChainTip,
    pub temp_channel_id: TempChannelId,
    pub local_params: LocalParams,
    pub remote_params: RemoteParams,
    pub funding_satoshis: u64,
    pub push_msat: u64,
    pub initial_feerate_per_kw: u32,
    pub remote_first_per_commitment_point: PublicKey,
    pub channel_flags: u8,
    pub channel_version: ChannelVersion,
    /// Funding depth required by the fundee in its `accept_channel`
    pub minimum_depth: u32,
    pub last_sent: OpenChannel,
}

/// Fundee awaiting the `funding_created` message
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct WaitForFundingCreated {
    pub static_params: StaticParams,
    pub current_tip: ChainTip,
    pub temp_channel_id: TempChannelId,
    pub local_params: LocalParams,
    pub remote_params: RemoteParams,
    pub funding_satoshis: u64,
    pub push_msat: u64,
    pub initial_feerate_per_kw: u32,
    pub remote_first_per_commitment_point: PublicKey,
    pub channel_flags: u8,
    pub channel_version: ChannelVersion,
    pub last_sent: AcceptChannel,
}

/// Funder awaiting the `funding_signed` message
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct WaitForFundingSigned {
    pub static_params: StaticParams,
    pub current_tip: ChainTip,
    pub channel_id: ChannelId,
    pub local_params: LocalParams,
    pub remote_params: RemoteParams,
    pub funding_tx: StoredTx,
    pub funding_tx_fee: u64,
    pub commit_input: FundingInput,
    pub local_spec: CommitmentSpec,
    pub local_commit_tx: StoredTx,
    pub remote_commit: RemoteCommit,
    pub channel_flags: u8,
    pub channel_version: ChannelVersion,
    pub minimum_depth: u32,
    pub last_sent: FundingCreated,
}

/// The last message sent before the funding confirmation wait: the fundee
/// finished with `funding_created`, the funder with `funding_signed`
#[derive(Clone, PartialEq, Eq, Debug, From, StrictEncode, StrictDecode)]
pub enum LastFundingMessage {
    #[from]
    FundingCreated(FundingCreated),

    #[from]
    FundingSigned(FundingSigned),
}

/// Both sides await the funding transaction confirmation
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct WaitForFundingConfirmed {
    pub static_params: StaticParams,
    pub current_tip: ChainTip,
    pub commitments: Commitments,
    /// The funder keeps the funding transaction to be able to re-publish it
    pub funding_tx: Option<StoredTx>,
    /// Unix timestamp of entering the wait, for the funding timeout
    pub waiting_since: u64,
    /// A `funding_locked` received before our own confirmation
    pub deferred: Option<FundingLocked>,
    pub last_sent: LastFundingMessage,
}

/// The funding transaction is confirmed locally; awaiting the remote
/// `funding_locked`
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct WaitForFundingLocked {
    pub static_params: StaticParams,
    pub current_tip: ChainTip,
    pub commitments: Commitments,
    pub short_channel_id: ShortChannelId,
    pub last_sent: FundingLocked,
}

/// The channel is operational
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct Normal {
    pub static_params: StaticParams,
    pub current_tip: ChainTip,
    pub commitments: Commitments,
    pub short_channel_id: ShortChannelId,
    /// The funding transaction has reached announcement depth
    pub buried: bool,
    pub channel_announcement: Option<ChannelAnnouncement>,
    pub channel_update: ChannelUpdate,
    pub local_shutdown: Option<Shutdown>,
    pub remote_shutdown: Option<Shutdown>,
}

impl Normal {
    /// A mutual close was initiated by either party
    #[inline]
    pub fn shutdown_in_progress(&self) -> bool {
        self.local_shutdown.is_some() || self.remote_shutdown.is_some()
    }
}

/// The tagged sum of channel states. Branches carry only the fields their
/// state needs; the whole value is serializable for crash recovery.
#[derive(Clone, PartialEq, Eq, Debug, Display, From, StrictEncode, StrictDecode)]
pub enum ChannelState {
    #[display("WAIT_FOR_INIT")]
    #[from]
    WaitForInit(WaitForInit),

    #[display("WAIT_FOR_OPEN_CHANNEL")]
    #[from]
    WaitForOpenChannel(WaitForOpenChannel),

    #[display("WAIT_FOR_ACCEPT_CHANNEL")]
    #[from]
    WaitForAcceptChannel(WaitForAcceptChannel),

    #[display("WAIT_FOR_FUNDING_INTERNAL")]
    #[from]
    WaitForFundingInternal(WaitForFundingInternal),

    #[display("WAIT_FOR_FUNDING_CREATED")]
    #[from]
    WaitForFundingCreated(WaitForFundingCreated),

    #[display("WAIT_FOR_FUNDING_SIGNED")]
    #[from]
    WaitForFundingSigned(WaitForFundingSigned),

    #[display("WAIT_FOR_FUNDING_CONFIRMED")]
    #[from]
    WaitForFundingConfirmed(WaitForFundingConfirmed),

    #[display("WAIT_FOR_FUNDING_LOCKED")]
    #[from]
    WaitForFundingLocked(WaitForFundingLocked),

    #[display("NORMAL")]
    #[from]
    Normal(Normal),
}

impl ChannelState {
    /// Node parameters immutable for the channel lifetime
    pub fn static_params(&self) -> &StaticParams {
        match self {
            ChannelState::WaitForInit(state) => &state.static_params,
            ChannelState::WaitForOpenChannel(state) => &state.static_params,
            ChannelState::WaitForAcceptChannel(state) => &state.static_params,
            ChannelState::WaitForFundingInternal(state) => {
                &state.static_params
            }
            ChannelState::WaitForFundingCreated(state) => {
                &state.static_params
            }
            ChannelState::WaitForFundingSigned(state) => &state.static_params,
            ChannelState::WaitForFundingConfirmed(state) => {
                &state.static_params
            }
            ChannelState::WaitForFundingLocked(state) => &state.static_params,
            ChannelState::Normal(state) => &state.static_params,
        }
    }

    /// The best known block at the last state update
    pub fn current_tip(&self) -> ChainTip {
        match self {
            ChannelState::WaitForInit(state) => state.current_tip,
            ChannelState::WaitForOpenChannel(state) => state.current_tip,
            ChannelState::WaitForAcceptChannel(state) => state.current_tip,
            ChannelState::WaitForFundingInternal(state) => state.current_tip,
            ChannelState::WaitForFundingCreated(state) => state.current_tip,
            ChannelState::WaitForFundingSigned(state) => state.current_tip,
            ChannelState::WaitForFundingConfirmed(state) => state.current_tip,
            ChannelState::WaitForFundingLocked(state) => state.current_tip,
            ChannelState::Normal(state) => state.current_tip,
        }
    }

    /// Commitments of the channel, present in all states at and after the
    /// funding
    pub fn commitments(&self) -> Option<&Commitments> {
        match self {
            ChannelState::WaitForFundingConfirmed(state) => {
                Some(&state.commitments)
            }
            ChannelState::WaitForFundingLocked(state) => {
                Some(&state.commitments)
            }
            ChannelState::Normal(state) => Some(&state.commitments),
            _ => None,
        }
    }
}
