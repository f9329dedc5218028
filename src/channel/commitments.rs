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

//! Commitment bookkeeping: both parties' current commitment transactions,
//! pending HTLCs and the change logs driving the two-phase commit dance.

use bitcoin::hashes::sha256;
use bitcoin::util::bip32::DerivationPath;
use bitcoin::{Transaction, Txid};
use bitcoin_scripts::hlc::{HashLock, HashPreimage};
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;
use strict_encoding::{StrictDecode, StrictEncode};

use super::bolt3::{
    self, CommitmentKeys, FundingInput, HtlcOutput, StoredTx,
};
use super::keys::KeyManager;
use super::params::{ChannelVersion, LocalParams, RemoteParams};
use super::secrets::CommitmentSecretStore;
use super::{Error, MAX_CLTV_EXPIRY_DELTA, MIN_CLTV_EXPIRY_DELTA};
use crate::p2p::{
    ChannelId, CommitmentSigned, OnionPacket, RevokeAndAck, UpdateAddHtlc,
    UpdateFailHtlc, UpdateFailMalformedHtlc, UpdateFulfillHtlc,
};

/// Bit of the failure code marking a malformed onion report
pub const BADONION: u16 = 0x8000;

/// Direction of an HTLC relative to the commitment owner
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Display,
    StrictEncode,
    StrictDecode,
)]
pub enum Direction {
    /// HTLC received by the commitment owner
    #[display("incoming")]
    Incoming,

    /// HTLC offered by the commitment owner
    #[display("outgoing")]
    Outgoing,
}

impl Direction {
    /// The same HTLC as seen by the other channel party
    #[inline]
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Incoming => Direction::Outgoing,
            Direction::Outgoing => Direction::Incoming,
        }
    }
}

/// An HTLC paired with its direction relative to the commitment owner
#[derive(Clone, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[display("{direction} {add}")]
pub struct DirectedHtlc {
    pub direction: Direction,
    pub add: UpdateAddHtlc,
}

impl DirectedHtlc {
    #[inline]
    pub fn is_incoming(&self) -> bool {
        self.direction == Direction::Incoming
    }

    #[inline]
    pub fn is_outgoing(&self) -> bool {
        self.direction == Direction::Outgoing
    }
}

/// Specification of a commitment transaction: pending HTLCs, fee rate and
/// the main balance of both parties.
///
/// Oriented from the viewpoint of the commitment owner: `to_local_msat` is
/// the owner balance and outgoing HTLCs are offered by the owner.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct CommitmentSpec {
    pub htlcs: Vec<DirectedHtlc>,
    pub feerate_per_kw: u32,
    pub to_local_msat: u64,
    pub to_remote_msat: u64,
}

impl CommitmentSpec {
    /// Finds an HTLC by its direction and id
    pub fn find(&self, direction: Direction, id: u64) -> Option<&DirectedHtlc> {
        self.htlcs
            .iter()
            .find(|htlc| htlc.direction == direction && htlc.add.htlc_id == id)
    }

    /// Sum of all funds tracked by the spec, in millisatoshi. Conserved
    /// across valid transitions.
    pub fn total_msat(&self) -> u64 {
        self.to_local_msat
            + self.to_remote_msat
            + self
                .htlcs
                .iter()
                .map(|htlc| htlc.add.amount_msat)
                .sum::<u64>()
    }

    /// Applies ordered change lists to the spec producing the next
    /// commitment spec. `owner_changes` originate from the commitment owner,
    /// `counter_changes` from the other party.
    pub fn reduce(
        &self,
        owner_changes: &[UpdateMessage],
        counter_changes: &[UpdateMessage],
    ) -> CommitmentSpec {
        let mut spec = self.clone();
        for change in owner_changes {
            if let UpdateMessage::Add(add) = change {
                // saturation can only happen on a balance overdraft, which
                // the caller detects and rejects afterwards
                spec.to_local_msat =
                    spec.to_local_msat.saturating_sub(add.amount_msat);
                spec.htlcs.push(DirectedHtlc {
                    direction: Direction::Outgoing,
                    add: add.clone(),
                });
            }
        }
        for change in counter_changes {
            if let UpdateMessage::Add(add) = change {
                spec.to_remote_msat =
                    spec.to_remote_msat.saturating_sub(add.amount_msat);
                spec.htlcs.push(DirectedHtlc {
                    direction: Direction::Incoming,
                    add: add.clone(),
                });
            }
        }
        for change in owner_changes {
            match change {
                UpdateMessage::Fulfill(fulfill) => {
                    spec.settle(Direction::Incoming, fulfill.htlc_id, true)
                }
                UpdateMessage::Fail(fail) => {
                    spec.settle(Direction::Incoming, fail.htlc_id, false)
                }
                UpdateMessage::FailMalformed(fail) => {
                    spec.settle(Direction::Incoming, fail.htlc_id, false)
                }
                _ => {}
            }
        }
        for change in counter_changes {
            match change {
                UpdateMessage::Fulfill(fulfill) => {
                    spec.settle(Direction::Outgoing, fulfill.htlc_id, true)
                }
                UpdateMessage::Fail(fail) => {
                    spec.settle(Direction::Outgoing, fail.htlc_id, false)
                }
                UpdateMessage::FailMalformed(fail) => {
                    spec.settle(Direction::Outgoing, fail.htlc_id, false)
                }
                _ => {}
            }
        }
        spec
    }

    /// Removes a settled HTLC returning its amount to the correct side. A
    /// fulfilled HTLC pays the receiving side, a failed one refunds the
    /// sender.
    fn settle(&mut self, direction: Direction, id: u64, fulfilled: bool) {
        let pos = match self
            .htlcs
            .iter()
            .position(|h| h.direction == direction && h.add.htlc_id == id)
        {
            Some(pos) => pos,
            None => return,
        };
        let htlc = self.htlcs.remove(pos);
        let to_local = match (direction, fulfilled) {
            // we received and fulfilled: funds are ours now
            (Direction::Incoming, true) => true,
            // we received and failed: refund the sender
            (Direction::Incoming, false) => false,
            // we offered and the peer fulfilled: funds are theirs
            (Direction::Outgoing, true) => false,
            // we offered and the peer failed: refund us
            (Direction::Outgoing, false) => true,
        };
        if to_local {
            self.to_local_msat += htlc.add.amount_msat;
        } else {
            self.to_remote_msat += htlc.add.amount_msat;
        }
    }
}

/// A change to the channel state which was proposed by one of the parties
/// and walks through the `proposed -> signed -> acked` two-phase commit
/// pipeline
#[derive(Clone, PartialEq, Eq, Debug, Display, From, StrictEncode, StrictDecode)]
#[display(inner)]
pub enum UpdateMessage {
    #[from]
    Add(UpdateAddHtlc),

    #[from]
    Fulfill(UpdateFulfillHtlc),

    #[from]
    Fail(UpdateFailHtlc),

    #[from]
    FailMalformed(UpdateFailMalformedHtlc),
}

/// Three ordered lists tracking changes of one party through the two-phase
/// commit dance
#[derive(
    Clone, PartialEq, Eq, Debug, Default, StrictEncode, StrictDecode,
)]
pub struct ChangeLog {
    /// Sent or received, not yet covered by any commitment signature
    pub proposed: Vec<UpdateMessage>,

    /// Covered by a commitment signature which is not yet revoked
    pub signed: Vec<UpdateMessage>,

    /// Irrevocably committed on the other side
    pub acked: Vec<UpdateMessage>,
}

impl ChangeLog {
    /// All changes in the pipeline, in proposal order per stage
    pub fn all(&self) -> Vec<UpdateMessage> {
        let mut all = self.acked.clone();
        all.extend(self.signed.iter().cloned());
        all.extend(self.proposed.iter().cloned());
        all
    }

    fn resolves(change: &UpdateMessage, id: u64) -> bool {
        match change {
            UpdateMessage::Fulfill(fulfill) => fulfill.htlc_id == id,
            UpdateMessage::Fail(fail) => fail.htlc_id == id,
            UpdateMessage::FailMalformed(fail) => fail.htlc_id == id,
            UpdateMessage::Add(_) => false,
        }
    }

    /// Detects whether a resolution (fulfill or fail) of the given HTLC is
    /// already somewhere in the pipeline
    pub fn already_resolves(&self, id: u64) -> bool {
        self.all().iter().any(|change| Self::resolves(change, id))
    }
}

/// The fully signed local commitment transaction with its second-stage HTLC
/// transactions; everything needed to unilaterally close the channel
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct PublishableTxs {
    pub commit_tx: StoredTx,
    pub htlc_txs_and_sigs: Vec<HtlcTxAndSigs>,
}

/// A second-stage HTLC transaction with both signatures required to publish
/// it
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct HtlcTxAndSigs {
    pub tx: StoredTx,
    pub local_sig: Signature,
    pub remote_sig: Signature,
}

/// The commitment transaction the local node can publish now
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct LocalCommit {
    pub index: u64,
    pub spec: CommitmentSpec,
    pub publishable_txs: PublishableTxs,
}

/// The current commitment transaction signed by us and held by the remote
/// node
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct RemoteCommit {
    pub index: u64,
    /// Spec oriented from the remote viewpoint: `to_local_msat` is the
    /// remote balance
    pub spec: CommitmentSpec,
    pub txid: Txid,
    pub remote_per_commitment_point: PublicKey,
}

/// Bookkeeping of a commitment signature sent to the remote node and not yet
/// answered with a revocation
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct WaitingForRevocation {
    /// The remote commitment the sent signature covers
    pub next_remote_commit: RemoteCommit,

    /// Index of the local commitment at the moment the signature was sent
    pub sent_after_local_commit_index: u64,

    /// A `CMD_SIGN` arrived while the revocation was pending; sign again as
    /// soon as it arrives
    pub re_sign_asap: bool,
}

/// State of the remote commitment advance: either a commitment signature is
/// in flight, or the remote node has told us its next per-commitment point
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub enum RemoteNextCommitInfo {
    /// CommitmentSigned was sent; waiting for the matching RevokeAndAck
    Waiting(WaitingForRevocation),

    /// Idle; the enclosed key is the next remote per-commitment point
    Revoked(PublicKey),
}

/// Data to persist about every HTLC of a yet-unrevoked remote commitment, so
/// that a revoked broadcast can be penalized later
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct HtlcInfo {
    pub channel_id: ChannelId,
    pub commitment_number: u64,
    pub payment_hash: HashLock,
    pub cltv_expiry: u32,
}

/// The channel commitment machinery: both parties' current commitments,
/// the change pipelines and the revocation chain.
///
/// All mutating operations consume the value and return the updated copy,
/// keeping the enclosing state machine pure.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct Commitments {
    pub channel_version: ChannelVersion,
    pub local_params: LocalParams,
    pub remote_params: RemoteParams,
    pub channel_flags: u8,
    pub channel_id: ChannelId,
    pub local_commit: LocalCommit,
    pub remote_commit: RemoteCommit,
    pub local_changes: ChangeLog,
    pub remote_changes: ChangeLog,
    pub local_next_htlc_id: u64,
    pub remote_next_htlc_id: u64,
    pub remote_next_commit_info: RemoteNextCommitInfo,
    pub commit_input: FundingInput,
    pub remote_per_commitment_secrets: CommitmentSecretStore,
}

/// Initial commitment transactions of both parties, built when the funding
/// transaction becomes known
pub struct FirstCommitTxs {
    pub local_spec: CommitmentSpec,
    pub local_commit_tx: Transaction,
    pub remote_spec: CommitmentSpec,
    pub remote_commit_tx: Transaction,
}

impl Commitments {
    /// Derivation path of the channel basepoints
    #[inline]
    pub fn channel_key_path(&self, keys: &dyn KeyManager) -> DerivationPath {
        keys.channel_key_path(&self.local_params, self.channel_version)
    }

    /// There are local changes which a future `commitment_signed` of ours
    /// must cover
    pub fn local_has_changes(&self) -> bool {
        !self.remote_changes.acked.is_empty()
            || !self.local_changes.proposed.is_empty()
    }

    /// There are remote changes which a future `commitment_signed` of the
    /// peer must cover
    pub fn remote_has_changes(&self) -> bool {
        !self.local_changes.acked.is_empty()
            || !self.remote_changes.proposed.is_empty()
    }

    /// The reserve the local node must keep on its side, in satoshis
    #[inline]
    pub fn local_reserve_satoshis(&self) -> u64 {
        if self.channel_version.is_zero_reserve() {
            0
        } else {
            self.remote_params.channel_reserve_satoshis
        }
    }

    /// The reserve the remote node must keep on its side, in satoshis
    #[inline]
    pub fn remote_reserve_satoshis(&self) -> u64 {
        if self.channel_version.is_zero_reserve() {
            0
        } else {
            self.local_params.channel_reserve_satoshis
        }
    }

    /// The remote commitment any new outgoing change must be measured
    /// against: the yet-unrevoked next commitment if one is in flight
    fn latest_remote_commit(&self) -> &RemoteCommit {
        match &self.remote_next_commit_info {
            RemoteNextCommitInfo::Waiting(waiting) => {
                &waiting.next_remote_commit
            }
            RemoteNextCommitInfo::Revoked(_) => &self.remote_commit,
        }
    }

    /// An HTLC is cross-signed when it is present in both parties' latest
    /// commitments
    fn htlc_cross_signed(
        &self,
        direction: Direction,
        id: u64,
    ) -> Option<&UpdateAddHtlc> {
        let local = self.local_commit.spec.find(direction, id)?;
        self.latest_remote_commit()
            .spec
            .find(direction.opposite(), id)?;
        Some(&local.add)
    }

    // --- Adding HTLCs

    /// Assigns the next local HTLC id to a new outgoing HTLC, checks it
    /// against the remote constraints and appends it to the proposed local
    /// changes
    pub fn send_add(
        mut self,
        amount_msat: u64,
        payment_hash: HashLock,
        cltv_expiry: u32,
        onion_routing_packet: OnionPacket,
        block_height: u32,
    ) -> Result<(Commitments, UpdateAddHtlc), Error> {
        if cltv_expiry <= block_height
            || cltv_expiry - block_height < MIN_CLTV_EXPIRY_DELTA
        {
            return Err(Error::ExpiryTooSmall {
                actual: cltv_expiry,
                height: block_height,
            });
        }
        if cltv_expiry - block_height > MAX_CLTV_EXPIRY_DELTA {
            return Err(Error::ExpiryTooBig {
                actual: cltv_expiry,
                height: block_height,
            });
        }
        let htlc_minimum = self.remote_params.htlc_minimum_msat.max(1);
        if amount_msat < htlc_minimum {
            return Err(Error::HtlcValueTooSmall(amount_msat));
        }

        let add = UpdateAddHtlc {
            channel_id: self.channel_id,
            htlc_id: self.local_next_htlc_id,
            amount_msat,
            payment_hash,
            cltv_expiry,
            onion_routing_packet,
        };
        self.local_changes.proposed.push(add.clone().into());
        self.local_next_htlc_id += 1;

        // measure the prospective remote commitment: our new HTLC is
        // incoming from the remote viewpoint
        let reduced = self.latest_remote_commit().spec.reduce(
            &self.remote_changes.acked,
            &self.local_changes_for_remote(),
        );
        let in_flight: u64 = reduced
            .htlcs
            .iter()
            .filter(|htlc| htlc.is_incoming())
            .map(|htlc| htlc.add.amount_msat)
            .sum();
        if in_flight > self.remote_params.max_htlc_value_in_flight_msat {
            return Err(Error::HtlcValueTooHighInFlight {
                actual: in_flight,
                maximum: self.remote_params.max_htlc_value_in_flight_msat,
            });
        }
        let count = reduced
            .htlcs
            .iter()
            .filter(|htlc| htlc.is_incoming())
            .count() as u16;
        if count > self.remote_params.max_accepted_htlcs {
            return Err(Error::TooManyAcceptedHtlcs(
                self.remote_params.max_accepted_htlcs,
            ));
        }

        // `to_remote` of the remote commitment is the local balance; the
        // funder additionally covers the commitment transaction fee
        let fees = if self.local_params.is_funder {
            bolt3::commit_tx_fee(
                self.remote_params.dust_limit_satoshis,
                &reduced,
            )
        } else {
            0
        };
        let balance = reduced.to_remote_msat / 1000;
        let required = self.local_reserve_satoshis() + fees;
        if balance < required {
            return Err(Error::InsufficientFunds(
                (required - balance) * 1000,
            ));
        }

        Ok((self, add))
    }

    /// Processes an incoming HTLC: validates its id and the local
    /// constraints, then appends it to the proposed remote changes
    pub fn receive_add(
        mut self,
        add: UpdateAddHtlc,
    ) -> Result<Commitments, Error> {
        if add.htlc_id != self.remote_next_htlc_id {
            return Err(Error::UnexpectedHtlcId {
                expected: self.remote_next_htlc_id,
                actual: add.htlc_id,
            });
        }
        let htlc_minimum = self.local_params.htlc_minimum_msat.max(1);
        if add.amount_msat < htlc_minimum {
            return Err(Error::HtlcValueTooSmall(add.amount_msat));
        }
        self.remote_changes.proposed.push(add.into());
        self.remote_next_htlc_id += 1;

        let reduced = self.local_commit.spec.reduce(
            &self.local_changes.acked,
            &self.remote_changes.proposed,
        );
        let in_flight: u64 = reduced
            .htlcs
            .iter()
            .filter(|htlc| htlc.is_incoming())
            .map(|htlc| htlc.add.amount_msat)
            .sum();
        if in_flight > self.local_params.max_htlc_value_in_flight_msat {
            return Err(Error::HtlcValueTooHighInFlight {
                actual: in_flight,
                maximum: self.local_params.max_htlc_value_in_flight_msat,
            });
        }
        let count = reduced
            .htlcs
            .iter()
            .filter(|htlc| htlc.is_incoming())
            .count() as u16;
        if count > self.local_params.max_accepted_htlcs {
            return Err(Error::TooManyAcceptedHtlcs(
                self.local_params.max_accepted_htlcs,
            ));
        }

        let fees = if self.local_params.is_funder {
            0
        } else {
            bolt3::commit_tx_fee(
                self.local_params.dust_limit_satoshis,
                &reduced,
            )
        };
        let balance = reduced.to_remote_msat / 1000;
        let required = self.remote_reserve_satoshis() + fees;
        if balance < required {
            return Err(Error::InsufficientFunds(
                (required - balance) * 1000,
            ));
        }

        Ok(self)
    }

    // --- Settling HTLCs

    /// Fulfills an incoming HTLC with its payment preimage
    pub fn send_fulfill(
        mut self,
        id: u64,
        payment_preimage: HashPreimage,
    ) -> Result<(Commitments, UpdateFulfillHtlc), Error> {
        let htlc = self
            .htlc_cross_signed(Direction::Incoming, id)
            .ok_or(Error::UnknownHtlcId(id))?;
        if preimage_hash(&payment_preimage) != htlc.payment_hash {
            return Err(Error::InvalidHtlcPreimage(id));
        }
        if self.local_changes.already_resolves(id) {
            return Err(Error::HtlcAlreadyResolved(id));
        }
        let fulfill = UpdateFulfillHtlc {
            channel_id: self.channel_id,
            htlc_id: id,
            payment_preimage,
        };
        self.local_changes.proposed.push(fulfill.clone().into());
        Ok((self, fulfill))
    }

    /// Processes the peer fulfilling one of our outgoing HTLCs
    pub fn receive_fulfill(
        mut self,
        fulfill: UpdateFulfillHtlc,
    ) -> Result<Commitments, Error> {
        let htlc = self
            .htlc_cross_signed(Direction::Outgoing, fulfill.htlc_id)
            .ok_or(Error::UnknownHtlcId(fulfill.htlc_id))?;
        if preimage_hash(&fulfill.payment_preimage) != htlc.payment_hash {
            return Err(Error::InvalidHtlcPreimage(fulfill.htlc_id));
        }
        if self.remote_changes.already_resolves(fulfill.htlc_id) {
            return Err(Error::HtlcAlreadyResolved(fulfill.htlc_id));
        }
        self.remote_changes.proposed.push(fulfill.into());
        Ok(self)
    }

    /// Fails an incoming HTLC with an encrypted reason
    pub fn send_fail(
        mut self,
        id: u64,
        reason: Vec<u8>,
    ) -> Result<(Commitments, UpdateFailHtlc), Error> {
        self.htlc_cross_signed(Direction::Incoming, id)
            .ok_or(Error::UnknownHtlcId(id))?;
        if self.local_changes.already_resolves(id) {
            return Err(Error::HtlcAlreadyResolved(id));
        }
        let fail = UpdateFailHtlc {
            channel_id: self.channel_id,
            htlc_id: id,
            reason,
        };
        self.local_changes.proposed.push(fail.clone().into());
        Ok((self, fail))
    }

    /// Processes the peer failing one of our outgoing HTLCs
    pub fn receive_fail(
        mut self,
        fail: UpdateFailHtlc,
    ) -> Result<Commitments, Error> {
        self.htlc_cross_signed(Direction::Outgoing, fail.htlc_id)
            .ok_or(Error::UnknownHtlcId(fail.htlc_id))?;
        if self.remote_changes.already_resolves(fail.htlc_id) {
            return Err(Error::HtlcAlreadyResolved(fail.htlc_id));
        }
        self.remote_changes.proposed.push(fail.into());
        Ok(self)
    }

    /// Reports an incoming HTLC as carrying an unparseable onion
    pub fn send_fail_malformed(
        mut self,
        id: u64,
        sha256_of_onion: sha256::Hash,
        failure_code: u16,
    ) -> Result<(Commitments, UpdateFailMalformedHtlc), Error> {
        if failure_code & BADONION == 0 {
            return Err(Error::InvalidFailureCode(failure_code));
        }
        self.htlc_cross_signed(Direction::Incoming, id)
            .ok_or(Error::UnknownHtlcId(id))?;
        if self.local_changes.already_resolves(id) {
            return Err(Error::HtlcAlreadyResolved(id));
        }
        let fail = UpdateFailMalformedHtlc {
            channel_id: self.channel_id,
            htlc_id: id,
            sha256_of_onion,
            failure_code,
        };
        self.local_changes.proposed.push(fail.clone().into());
        Ok((self, fail))
    }

    /// Processes the peer reporting one of our outgoing HTLCs as malformed
    pub fn receive_fail_malformed(
        mut self,
        fail: UpdateFailMalformedHtlc,
    ) -> Result<Commitments, Error> {
        if fail.failure_code & BADONION == 0 {
            return Err(Error::InvalidFailureCode(fail.failure_code));
        }
        self.htlc_cross_signed(Direction::Outgoing, fail.htlc_id)
            .ok_or(Error::UnknownHtlcId(fail.htlc_id))?;
        if self.remote_changes.already_resolves(fail.htlc_id) {
            return Err(Error::HtlcAlreadyResolved(fail.htlc_id));
        }
        self.remote_changes.proposed.push(fail.into());
        Ok(self)
    }

    // --- Commitment dance

    /// Builds and signs the next remote commitment covering all local
    /// proposed changes and the acknowledged remote ones
    pub fn send_commit(
        mut self,
        keys: &dyn KeyManager,
    ) -> Result<(Commitments, CommitmentSigned), Error> {
        let remote_point = match &self.remote_next_commit_info {
            RemoteNextCommitInfo::Revoked(point) => *point,
            RemoteNextCommitInfo::Waiting(_) => {
                return Err(Error::CannotSignBeforeRevocation)
            }
        };
        if !self.local_has_changes() {
            return Err(Error::CannotSignWithoutChanges);
        }

        let spec = self.remote_commit.spec.reduce(
            &self.remote_changes.acked,
            &self.local_changes_for_remote(),
        );
        let index = self.remote_commit.index + 1;
        let (tx, htlc_outputs) =
            self.build_remote_commit_tx(keys, index, &remote_point, &spec);
        let txid = tx.txid();

        let signature = keys.sign_funding_spend(
            &tx,
            &self.commit_input,
            &self.local_params.funding_key_path,
        );
        let channel_key_path = self.channel_key_path(keys);
        let remote_commitment_keys =
            self.remote_commitment_keys(keys, &remote_point);
        let htlc_signatures = htlc_outputs
            .iter()
            .map(|htlc_output| {
                let htlc_tx = bolt3::htlc_tx(
                    txid,
                    htlc_output,
                    &remote_commitment_keys.revocation_pubkey,
                    &remote_commitment_keys.delayed_payment_pubkey,
                    self.local_params.to_self_delay,
                    spec.feerate_per_kw,
                );
                keys.sign_htlc_tx(
                    &htlc_tx,
                    htlc_output.htlc.add.amount_msat / 1000,
                    &htlc_output.witness_script,
                    &channel_key_path,
                    &remote_point,
                )
            })
            .collect();

        let commitment_signed = CommitmentSigned {
            channel_id: self.channel_id,
            signature,
            htlc_signatures,
        };

        self.remote_next_commit_info =
            RemoteNextCommitInfo::Waiting(WaitingForRevocation {
                next_remote_commit: RemoteCommit {
                    index,
                    spec,
                    txid,
                    remote_per_commitment_point: remote_point,
                },
                sent_after_local_commit_index: self.local_commit.index,
                re_sign_asap: false,
            });
        self.local_changes.signed = self.local_changes.proposed.clone();
        self.local_changes.proposed.clear();
        self.remote_changes.signed = self.remote_changes.acked.clone();
        self.remote_changes.acked.clear();

        Ok((self, commitment_signed))
    }

    /// Validates the received commitment signature, advances the local
    /// commitment and produces the revocation of the previous one
    pub fn receive_commit(
        mut self,
        keys: &dyn KeyManager,
        commitment_signed: &CommitmentSigned,
    ) -> Result<(Commitments, RevokeAndAck), Error> {
        if !self.remote_has_changes() {
            return Err(Error::CannotSignWithoutChanges);
        }

        let channel_key_path = self.channel_key_path(keys);
        let spec = self.local_commit.spec.reduce(
            &self.local_changes.acked,
            &self.remote_changes.proposed,
        );
        let index = self.local_commit.index + 1;
        let local_point = keys.commitment_point(&channel_key_path, index);
        let (tx, htlc_outputs) =
            self.build_local_commit_tx(keys, index, &local_point, &spec);

        if !bolt3::verify_signature(
            &tx,
            0,
            self.commit_input.amount,
            &self.commit_input.witness_script,
            &self.remote_params.funding_pubkey,
            &commitment_signed.signature,
        ) {
            return Err(Error::InvalidCommitmentSignature);
        }
        if commitment_signed.htlc_signatures.len() != htlc_outputs.len() {
            return Err(Error::HtlcSigCountMismatch {
                expected: htlc_outputs.len(),
                actual: commitment_signed.htlc_signatures.len(),
            });
        }

        let local_commitment_keys =
            self.local_commitment_keys(keys, &local_point);
        let remote_htlc_pubkey = bolt3::derive_pubkey(
            &self.remote_params.htlc_basepoint,
            &local_point,
        );
        let txid = tx.txid();
        let mut htlc_txs_and_sigs = vec![];
        for (n, (htlc_output, remote_sig)) in htlc_outputs
            .iter()
            .zip(&commitment_signed.htlc_signatures)
            .enumerate()
        {
            let htlc_tx = bolt3::htlc_tx(
                txid,
                htlc_output,
                &local_commitment_keys.revocation_pubkey,
                &local_commitment_keys.delayed_payment_pubkey,
                self.remote_params.to_self_delay,
                spec.feerate_per_kw,
            );
            if !bolt3::verify_signature(
                &htlc_tx,
                0,
                htlc_output.htlc.add.amount_msat / 1000,
                &htlc_output.witness_script,
                &remote_htlc_pubkey,
                remote_sig,
            ) {
                return Err(Error::InvalidHtlcSignature(n as u64));
            }
            let local_sig = keys.sign_htlc_tx(
                &htlc_tx,
                htlc_output.htlc.add.amount_msat / 1000,
                &htlc_output.witness_script,
                &channel_key_path,
                &local_point,
            );
            htlc_txs_and_sigs.push(HtlcTxAndSigs {
                tx: StoredTx::from(htlc_tx),
                local_sig,
                remote_sig: *remote_sig,
            });
        }

        let local_sig = keys.sign_funding_spend(
            &tx,
            &self.commit_input,
            &self.local_params.funding_key_path,
        );
        let signed_commit_tx = bolt3::complete_funding_witness(
            tx,
            &self.commit_input.witness_script,
            (
                keys.funding_pubkey(&self.local_params.funding_key_path),
                local_sig,
            ),
            (
                self.remote_params.funding_pubkey,
                commitment_signed.signature,
            ),
        );

        let revocation = RevokeAndAck {
            channel_id: self.channel_id,
            per_commitment_secret: keys.commitment_secret(
                &channel_key_path,
                self.local_commit.index,
            ),
            next_per_commitment_point: keys
                .commitment_point(&channel_key_path, index + 1),
        };

        self.local_commit = LocalCommit {
            index,
            spec,
            publishable_txs: PublishableTxs {
                commit_tx: StoredTx::from(signed_commit_tx),
                htlc_txs_and_sigs,
            },
        };
        self.local_changes.acked.clear();
        let newly_acked = self.remote_changes.proposed.clone();
        self.remote_changes.proposed.clear();
        self.remote_changes.acked.extend(newly_acked);

        Ok((self, revocation))
    }

    /// Validates the revealed per-commitment secret, stores it in the
    /// revocation chain and promotes the pending remote commitment. Returns
    /// remote changes which became irrevocable with this revocation.
    pub fn receive_revocation(
        mut self,
        revocation: &RevokeAndAck,
    ) -> Result<(Commitments, Vec<UpdateMessage>), Error> {
        let waiting = match &self.remote_next_commit_info {
            RemoteNextCommitInfo::Waiting(waiting) => waiting.clone(),
            RemoteNextCommitInfo::Revoked(_) => {
                return Err(Error::UnexpectedRevocation)
            }
        };
        self.remote_per_commitment_secrets
            .insert(
                self.remote_commit.index,
                revocation.per_commitment_secret,
                self.remote_commit.remote_per_commitment_point,
            )
            .map_err(|_| Error::InvalidRevocation)?;

        let forwards = self.remote_changes.signed.clone();
        self.remote_changes.signed.clear();
        let newly_acked = self.local_changes.signed.clone();
        self.local_changes.signed.clear();
        self.local_changes.acked.extend(newly_acked);
        self.remote_commit = waiting.next_remote_commit;
        self.remote_next_commit_info = RemoteNextCommitInfo::Revoked(
            revocation.next_per_commitment_point,
        );

        Ok((self, forwards))
    }

    // --- Balances

    /// Funds the local node can send over the channel right now, counting
    /// in-flight changes, the reserve and (for the funder) the commitment
    /// fee with one extra HTLC output
    pub fn available_balance_for_send(&self) -> u64 {
        let reduced = self.latest_remote_commit().spec.reduce(
            &self.remote_changes.acked,
            &self.local_changes_for_remote(),
        );
        let balance = reduced.to_remote_msat;
        let reserve = self.local_reserve_satoshis() * 1000;
        let fees = if self.local_params.is_funder {
            (bolt3::commit_tx_fee(
                self.remote_params.dust_limit_satoshis,
                &reduced,
            ) + bolt3::weight_to_fee(
                bolt3::HTLC_OUTPUT_WEIGHT,
                reduced.feerate_per_kw,
            )) * 1000
        } else {
            0
        };
        balance.saturating_sub(reserve).saturating_sub(fees)
    }

    /// Funds the remote node can send to us right now
    pub fn available_balance_for_receive(&self) -> u64 {
        let reduced = self.local_commit.spec.reduce(
            &self.local_changes.acked,
            &self.remote_changes_for_local(),
        );
        let balance = reduced.to_remote_msat;
        let reserve = self.remote_reserve_satoshis() * 1000;
        let fees = if self.local_params.is_funder {
            0
        } else {
            (bolt3::commit_tx_fee(
                self.local_params.dust_limit_satoshis,
                &reduced,
            ) + bolt3::weight_to_fee(
                bolt3::HTLC_OUTPUT_WEIGHT,
                reduced.feerate_per_kw,
            )) * 1000
        };
        balance.saturating_sub(reserve).saturating_sub(fees)
    }

    /// HTLCs of the in-flight remote commitment which must be remembered for
    /// a future penalty transaction, filtered against the remote dust limit
    pub fn htlc_infos_for_next_remote_commit(&self) -> Vec<HtlcInfo> {
        let (spec, index) = match &self.remote_next_commit_info {
            RemoteNextCommitInfo::Waiting(waiting) => (
                &waiting.next_remote_commit.spec,
                waiting.next_remote_commit.index,
            ),
            RemoteNextCommitInfo::Revoked(_) => return vec![],
        };
        let dust = self.remote_params.dust_limit_satoshis;
        bolt3::trim_offered_htlcs(dust, spec)
            .into_iter()
            .chain(bolt3::trim_received_htlcs(dust, spec))
            .map(|htlc| HtlcInfo {
                channel_id: self.channel_id,
                commitment_number: index,
                payment_hash: htlc.add.payment_hash,
                cltv_expiry: htlc.add.cltv_expiry,
            })
            .collect()
    }

    // --- Internals

    fn local_changes_for_remote(&self) -> Vec<UpdateMessage> {
        let mut changes = self.local_changes.proposed.clone();
        changes.extend(self.local_changes.signed.iter().cloned());
        changes
    }

    fn remote_changes_for_local(&self) -> Vec<UpdateMessage> {
        let mut changes = self.remote_changes.proposed.clone();
        changes.extend(self.remote_changes.signed.iter().cloned());
        changes
    }

    fn funder_fundee_payment_basepoints(
        &self,
        keys: &dyn KeyManager,
    ) -> (PublicKey, PublicKey) {
        let channel_key_path = self.channel_key_path(keys);
        let local = keys.payment_basepoint(&channel_key_path);
        let remote = self.remote_params.payment_basepoint;
        if self.local_params.is_funder {
            (local, remote)
        } else {
            (remote, local)
        }
    }

    fn local_commitment_keys(
        &self,
        keys: &dyn KeyManager,
        per_commitment_point: &PublicKey,
    ) -> CommitmentKeys {
        let channel_key_path = self.channel_key_path(keys);
        CommitmentKeys::derive(
            per_commitment_point,
            &keys.delayed_payment_basepoint(&channel_key_path),
            &keys.htlc_basepoint(&channel_key_path),
            &self.remote_params.payment_basepoint,
            &self.remote_params.revocation_basepoint,
            &self.remote_params.htlc_basepoint,
            self.channel_version.has_static_remotekey(),
        )
    }

    fn remote_commitment_keys(
        &self,
        keys: &dyn KeyManager,
        per_commitment_point: &PublicKey,
    ) -> CommitmentKeys {
        let channel_key_path = self.channel_key_path(keys);
        CommitmentKeys::derive(
            per_commitment_point,
            &self.remote_params.delayed_payment_basepoint,
            &self.remote_params.htlc_basepoint,
            &keys.payment_basepoint(&channel_key_path),
            &keys.revocation_basepoint(&channel_key_path),
            &keys.htlc_basepoint(&channel_key_path),
            self.channel_version.has_static_remotekey(),
        )
    }

    fn build_local_commit_tx(
        &self,
        keys: &dyn KeyManager,
        index: u64,
        per_commitment_point: &PublicKey,
        spec: &CommitmentSpec,
    ) -> (Transaction, Vec<HtlcOutput>) {
        let (funder_bp, fundee_bp) =
            self.funder_fundee_payment_basepoints(keys);
        bolt3::commitment_tx(
            &self.commit_input,
            index,
            bolt3::obscuring_factor(&funder_bp, &fundee_bp),
            self.local_params.is_funder,
            self.local_params.dust_limit_satoshis,
            self.remote_params.to_self_delay,
            &self.local_commitment_keys(keys, per_commitment_point),
            spec,
        )
    }

    fn build_remote_commit_tx(
        &self,
        keys: &dyn KeyManager,
        index: u64,
        per_commitment_point: &PublicKey,
        spec: &CommitmentSpec,
    ) -> (Transaction, Vec<HtlcOutput>) {
        let (funder_bp, fundee_bp) =
            self.funder_fundee_payment_basepoints(keys);
        bolt3::commitment_tx(
            &self.commit_input,
            index,
            bolt3::obscuring_factor(&funder_bp, &fundee_bp),
            !self.local_params.is_funder,
            self.remote_params.dust_limit_satoshis,
            self.local_params.to_self_delay,
            &self.remote_commitment_keys(keys, per_commitment_point),
            spec,
        )
    }
}

/// Builds the initial commitment transactions of both parties once the
/// funding transaction is known. Verifies that the funder can pay the
/// commitment fee out of its own balance.
#[allow(clippy::too_many_arguments)]
pub fn make_first_commit_txs(
    keys: &dyn KeyManager,
    channel_version: ChannelVersion,
    local_params: &LocalParams,
    remote_params: &RemoteParams,
    funding_satoshis: u64,
    push_msat: u64,
    initial_feerate_per_kw: u32,
    commit_input: &FundingInput,
    remote_first_per_commitment_point: &PublicKey,
) -> Result<FirstCommitTxs, Error> {
    let funding_msat = funding_satoshis * 1000;
    let (local_msat, remote_msat) = if local_params.is_funder {
        (funding_msat - push_msat, push_msat)
    } else {
        (push_msat, funding_msat - push_msat)
    };
    let funder_msat = if local_params.is_funder {
        local_msat
    } else {
        remote_msat
    };
    let fee = bolt3::weight_to_fee(
        bolt3::COMMIT_WEIGHT,
        initial_feerate_per_kw,
    );
    if funder_msat / 1000 < fee {
        return Err(Error::CannotAffordFees {
            fee,
            available: funder_msat,
        });
    }

    let local_spec = CommitmentSpec {
        htlcs: vec![],
        feerate_per_kw: initial_feerate_per_kw,
        to_local_msat: local_msat,
        to_remote_msat: remote_msat,
    };
    let remote_spec = CommitmentSpec {
        htlcs: vec![],
        feerate_per_kw: initial_feerate_per_kw,
        to_local_msat: remote_msat,
        to_remote_msat: local_msat,
    };

    let channel_key_path =
        keys.channel_key_path(local_params, channel_version);
    let local_bp = keys.payment_basepoint(&channel_key_path);
    let (funder_bp, fundee_bp) = if local_params.is_funder {
        (local_bp, remote_params.payment_basepoint)
    } else {
        (remote_params.payment_basepoint, local_bp)
    };
    let obscuring = bolt3::obscuring_factor(&funder_bp, &fundee_bp);

    let local_keys = CommitmentKeys::derive(
        &keys.commitment_point(&channel_key_path, 0),
        &keys.delayed_payment_basepoint(&channel_key_path),
        &keys.htlc_basepoint(&channel_key_path),
        &remote_params.payment_basepoint,
        &remote_params.revocation_basepoint,
        &remote_params.htlc_basepoint,
        channel_version.has_static_remotekey(),
    );
    let (local_commit_tx, _) = bolt3::commitment_tx(
        commit_input,
        0,
        obscuring,
        local_params.is_funder,
        local_params.dust_limit_satoshis,
        remote_params.to_self_delay,
        &local_keys,
        &local_spec,
    );

    let remote_keys = CommitmentKeys::derive(
        remote_first_per_commitment_point,
        &remote_params.delayed_payment_basepoint,
        &remote_params.htlc_basepoint,
        &keys.payment_basepoint(&channel_key_path),
        &keys.revocation_basepoint(&channel_key_path),
        &keys.htlc_basepoint(&channel_key_path),
        channel_version.has_static_remotekey(),
    );
    let (remote_commit_tx, _) = bolt3::commitment_tx(
        commit_input,
        0,
        obscuring,
        !local_params.is_funder,
        remote_params.dust_limit_satoshis,
        local_params.to_self_delay,
        &remote_keys,
        &remote_spec,
    );

    Ok(FirstCommitTxs {
        local_spec,
        local_commit_tx,
        remote_spec,
        remote_commit_tx,
    })
}

/// SHA256 hash lock matching a payment preimage
#[inline]
pub fn preimage_hash(preimage: &HashPreimage) -> HashLock {
    HashLock::from(*preimage)
}
