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

//! The pure transition function of the channel state machine: one
//! dispatcher per state variant. No I/O happens here; everything the
//! outside world must do is returned as [`Action`]s.

use amplify::Wrapper;
use bitcoin_scripts::WitnessScript;

use super::bolt3::{self, FundingInput, ScriptGenerators, StoredTx};
use super::commitments::{
    make_first_commit_txs, Commitments, LocalCommit, PublishableTxs,
    RemoteCommit, RemoteNextCommitInfo, UpdateMessage,
};
use super::keys::ProcessCtx;
use super::params::negotiate_channel_version;
use super::secrets::CommitmentSecretStore;
use super::state::{
    Action, ChannelState, Command, Event, InitFundee,
    LastFundingMessage, MakeFundingTxResponse, Normal, WaitForAcceptChannel,
    WaitForFundingConfirmed, WaitForFundingCreated, WaitForFundingInternal,
    WaitForFundingLocked, WaitForFundingSigned, WaitForInit,
    WaitForOpenChannel, WatchEvent, WatchRequest,
};
use super::{ChangeLog, ChannelVersion, Error, ANNOUNCEMENTS_MINCONF};
use crate::p2p::bolt9::{Feature, FeatureSet};
use crate::p2p::{
    AcceptChannel, ChannelId, ChannelUpdate, FundingCreated, FundingLocked,
    FundingSigned, Messages, OpenChannel, ShortChannelId,
};

/// The `cltv_expiry_delta` advertised in the initial `channel_update`
const LOCAL_CLTV_EXPIRY_DELTA: u16 = 40;

impl ChannelState {
    /// The transition function: consumes the current state and one event
    /// and produces the next state together with the ordered list of
    /// actions for the driver.
    ///
    /// Never performs I/O and never fails: erroneous inputs surface as an
    /// [`Action::HandleError`] with the state left unchanged; unhandled
    /// (state, event) pairs are logged and ignored.
    pub fn process(
        self,
        ctx: &ProcessCtx,
        event: Event,
    ) -> (ChannelState, Vec<Action>) {
        let fallback = self.clone();
        let result = match self {
            ChannelState::WaitForInit(state) => {
                process_wait_for_init(ctx, state, event)
            }
            ChannelState::WaitForOpenChannel(state) => {
                process_wait_for_open_channel(ctx, state, event)
            }
            ChannelState::WaitForAcceptChannel(state) => {
                process_wait_for_accept_channel(ctx, state, event)
            }
            ChannelState::WaitForFundingInternal(state) => {
                process_wait_for_funding_internal(ctx, state, event)
            }
            ChannelState::WaitForFundingCreated(state) => {
                process_wait_for_funding_created(ctx, state, event)
            }
            ChannelState::WaitForFundingSigned(state) => {
                process_wait_for_funding_signed(ctx, state, event)
            }
            ChannelState::WaitForFundingConfirmed(state) => {
                process_wait_for_funding_confirmed(ctx, state, event)
            }
            ChannelState::WaitForFundingLocked(state) => {
                process_wait_for_funding_locked(ctx, state, event)
            }
            ChannelState::Normal(state) => process_normal(ctx, state, event),
        };
        match result {
            Ok((state, actions)) => (state, actions),
            Err(err) => {
                error!(
                    "channel {} transition failed: {}",
                    fallback, err
                );
                (fallback, vec![Action::HandleError(err)])
            }
        }
    }
}

fn unhandled(
    state: impl Into<ChannelState>,
    event: Event,
) -> Result<(ChannelState, Vec<Action>), Error> {
    let state = state.into();
    warn!("event {} is not handled in state {}", event, state);
    Ok((state, vec![]))
}

/// Checks the feature set of the remote peer: no unknown mandatory bits,
/// all dependencies satisfied
fn validate_remote_features(remote: &FeatureSet) -> Result<(), Error> {
    remote.validate_dependencies()?;
    if let Some(bit) =
        remote.unknown().iter().find(|bit| *bit % 2 == 0).copied()
    {
        return Err(Error::Features(
            crate::p2p::bolt9::Error::UnknownEvenFeature(bit),
        ));
    }
    Ok(())
}

fn process_wait_for_init(
    ctx: &ProcessCtx,
    state: WaitForInit,
    event: Event,
) -> Result<(ChannelState, Vec<Action>), Error> {
    match event {
        Event::InitFunder(init) => {
            let remote_features = init.remote_init.features();
            validate_remote_features(&remote_features)?;
            let channel_version = negotiate_channel_version(
                &state.static_params.features,
                &remote_features,
            );

            let keys = ctx.keys;
            let channel_key_path =
                keys.channel_key_path(&init.local_params, channel_version);
            let open_channel = OpenChannel {
                chain_hash: state.static_params.chain_hash,
                temporary_channel_id: init.temp_channel_id,
                funding_satoshis: init.funding_satoshis,
                push_msat: init.push_msat,
                dust_limit_satoshis: init.local_params.dust_limit_satoshis,
                max_htlc_value_in_flight_msat: init
                    .local_params
                    .max_htlc_value_in_flight_msat,
                channel_reserve_satoshis: init
                    .local_params
                    .channel_reserve_satoshis,
                htlc_minimum_msat: init.local_params.htlc_minimum_msat,
                feerate_per_kw: init.initial_feerate_per_kw,
                to_self_delay: init.local_params.to_self_delay,
                max_accepted_htlcs: init.local_params.max_accepted_htlcs,
                funding_pubkey: keys
                    .funding_pubkey(&init.local_params.funding_key_path),
                revocation_basepoint: keys
                    .revocation_basepoint(&channel_key_path),
                payment_point: keys.payment_basepoint(&channel_key_path),
                delayed_payment_basepoint: keys
                    .delayed_payment_basepoint(&channel_key_path),
                htlc_basepoint: keys.htlc_basepoint(&channel_key_path),
                first_per_commitment_point: keys
                    .commitment_point(&channel_key_path, 0),
                channel_flags: init.channel_flags,
            };

            let next = WaitForAcceptChannel {
                static_params: state.static_params,
                current_tip: state.current_tip,
                init_funder: init,
                channel_version,
                last_sent: open_channel.clone(),
            };
            Ok((next.into(), vec![Action::SendMessage(
                Messages::OpenChannel(open_channel),
            )]))
        }
        Event::InitFundee(init) => {
            let InitFundee {
                temp_channel_id,
                local_params,
                remote_init,
            } = init;
            let next = WaitForOpenChannel {
                static_params: state.static_params,
                current_tip: state.current_tip,
                temp_channel_id,
                local_params,
                remote_init,
            };
            Ok((next.into(), vec![]))
        }
        event => unhandled(state, event),
    }
}

fn process_wait_for_open_channel(
    ctx: &ProcessCtx,
    state: WaitForOpenChannel,
    event: Event,
) -> Result<(ChannelState, Vec<Action>), Error> {
    let open_channel = match event {
        Event::MessageReceived(Messages::OpenChannel(open_channel))
            if open_channel.temporary_channel_id
                == state.temp_channel_id =>
        {
            open_channel
        }
        event => return unhandled(state, event),
    };

    let static_params = &state.static_params;
    let remote_features = state.remote_init.features();
    validate_remote_features(&remote_features)?;
    let wumbo = FeatureSet::can_use_feature(
        &static_params.features,
        &remote_features,
        Feature::Wumbo,
    );
    let remote_params = static_params.policy.validate_remote_open(
        static_params.chain_hash,
        &open_channel,
        remote_features.clone(),
        &state.local_params,
        wumbo,
    )?;

    let mut channel_version = negotiate_channel_version(
        &static_params.features,
        &remote_features,
    );
    if open_channel.channel_reserve_satoshis == 0
        && state.local_params.channel_reserve_satoshis == 0
    {
        channel_version = channel_version | ChannelVersion::ZERO_RESERVE;
    }
    let minimum_depth = if channel_version.is_zero_reserve() {
        0
    } else {
        static_params.policy.minimum_depth
    };

    let keys = ctx.keys;
    let channel_key_path =
        keys.channel_key_path(&state.local_params, channel_version);
    let accept_channel = AcceptChannel {
        temporary_channel_id: open_channel.temporary_channel_id,
        dust_limit_satoshis: state.local_params.dust_limit_satoshis,
        max_htlc_value_in_flight_msat: state
            .local_params
            .max_htlc_value_in_flight_msat,
        channel_reserve_satoshis: state
            .local_params
            .channel_reserve_satoshis,
        htlc_minimum_msat: state.local_params.htlc_minimum_msat,
        minimum_depth,
        to_self_delay: state.local_params.to_self_delay,
        max_accepted_htlcs: state.local_params.max_accepted_htlcs,
        funding_pubkey: keys
            .funding_pubkey(&state.local_params.funding_key_path),
        revocation_basepoint: keys.revocation_basepoint(&channel_key_path),
        payment_point: keys.payment_basepoint(&channel_key_path),
        delayed_payment_basepoint: keys
            .delayed_payment_basepoint(&channel_key_path),
        htlc_basepoint: keys.htlc_basepoint(&channel_key_path),
        first_per_commitment_point: keys
            .commitment_point(&channel_key_path, 0),
    };

    let next = WaitForFundingCreated {
        static_params: state.static_params,
        current_tip: state.current_tip,
        temp_channel_id: open_channel.temporary_channel_id,
        local_params: state.local_params,
        remote_params,
        funding_satoshis: open_channel.funding_satoshis,
        push_msat: open_channel.push_msat,
        initial_feerate_per_kw: open_channel.feerate_per_kw,
        remote_first_per_commitment_point: open_channel
            .first_per_commitment_point,
        channel_flags: open_channel.channel_flags,
        channel_version,
        last_sent: accept_channel.clone(),
    };
    Ok((next.into(), vec![Action::SendMessage(
        Messages::AcceptChannel(accept_channel),
    )]))
}

fn process_wait_for_accept_channel(
    ctx: &ProcessCtx,
    state: WaitForAcceptChannel,
    event: Event,
) -> Result<(ChannelState, Vec<Action>), Error> {
    let accept_channel = match event {
        Event::MessageReceived(Messages::AcceptChannel(accept_channel))
            if accept_channel.temporary_channel_id
                == state.init_funder.temp_channel_id =>
        {
            accept_channel
        }
        event => return unhandled(state, event),
    };

    let init = &state.init_funder;
    let remote_features = init.remote_init.features();
    let remote_params = state.static_params.policy.validate_remote_accept(
        &accept_channel,
        remote_features,
        &init.local_params,
        init.funding_satoshis,
    )?;

    let local_funding_pubkey = ctx
        .keys
        .funding_pubkey(&init.local_params.funding_key_path);
    let script_pubkey = WitnessScript::ln_funding(
        local_funding_pubkey,
        remote_params.funding_pubkey,
    )
    .to_p2wsh();

    let make_funding = Action::MakeFundingTx {
        script_pubkey,
        amount: init.funding_satoshis,
        feerate_per_kw: init.initial_feerate_per_kw,
    };
    let next = WaitForFundingInternal {
        static_params: state.static_params,
        current_tip: state.current_tip,
        temp_channel_id: init.temp_channel_id,
        local_params: init.local_params.clone(),
        remote_params,
        funding_satoshis: init.funding_satoshis,
        push_msat: init.push_msat,
        initial_feerate_per_kw: init.initial_feerate_per_kw,
        remote_first_per_commitment_point: accept_channel
            .first_per_commitment_point,
        channel_flags: init.channel_flags,
        channel_version: state.channel_version,
        minimum_depth: accept_channel.minimum_depth,
        last_sent: state.last_sent,
    };
    Ok((next.into(), vec![make_funding]))
}

fn process_wait_for_funding_internal(
    ctx: &ProcessCtx,
    state: WaitForFundingInternal,
    event: Event,
) -> Result<(ChannelState, Vec<Action>), Error> {
    let response = match event {
        Event::MakeFundingTxResponse(response) => response,
        event => return unhandled(state, event),
    };
    let MakeFundingTxResponse {
        funding_tx,
        funding_tx_output_index,
        fee,
    } = response;

    let keys = ctx.keys;
    let local_funding_pubkey =
        keys.funding_pubkey(&state.local_params.funding_key_path);
    let witness_script = WitnessScript::ln_funding(
        local_funding_pubkey,
        state.remote_params.funding_pubkey,
    );
    let funding_output = funding_tx
        .as_inner()
        .output
        .get(funding_tx_output_index as usize)
        .ok_or(Error::FundingOutputMissing(funding_tx_output_index))?;
    if funding_output.script_pubkey
        != witness_script.to_p2wsh().into_inner()
        || funding_output.value != state.funding_satoshis
    {
        return Err(Error::FundingScriptMismatch);
    }

    let funding_txid = funding_tx.txid();
    let commit_input = FundingInput {
        outpoint: bitcoin::OutPoint::new(
            funding_txid,
            funding_tx_output_index as u32,
        ),
        amount: state.funding_satoshis,
        witness_script,
    };
    let first = make_first_commit_txs(
        keys,
        state.channel_version,
        &state.local_params,
        &state.remote_params,
        state.funding_satoshis,
        state.push_msat,
        state.initial_feerate_per_kw,
        &commit_input,
        &state.remote_first_per_commitment_point,
    )?;

    let signature = keys.sign_funding_spend(
        &first.remote_commit_tx,
        &commit_input,
        &state.local_params.funding_key_path,
    );
    let funding_created = FundingCreated {
        temporary_channel_id: state.temp_channel_id,
        funding_txid,
        funding_output_index: funding_tx_output_index,
        signature,
    };

    let channel_id =
        ChannelId::with(funding_txid, funding_tx_output_index);
    let next = WaitForFundingSigned {
        static_params: state.static_params,
        current_tip: state.current_tip,
        channel_id,
        local_params: state.local_params,
        remote_params: state.remote_params,
        funding_tx,
        funding_tx_fee: fee,
        commit_input,
        local_spec: first.local_spec,
        local_commit_tx: StoredTx::from(first.local_commit_tx),
        remote_commit: RemoteCommit {
            index: 0,
            spec: first.remote_spec,
            txid: first.remote_commit_tx.txid(),
            remote_per_commitment_point: state
                .remote_first_per_commitment_point,
        },
        channel_flags: state.channel_flags,
        channel_version: state.channel_version,
        minimum_depth: state.minimum_depth,
        last_sent: funding_created.clone(),
    };
    Ok((next.into(), vec![
        Action::ChannelIdAssigned {
            temp_channel_id: state.temp_channel_id,
            channel_id,
        },
        Action::SendMessage(Messages::FundingCreated(funding_created)),
    ]))
}

fn process_wait_for_funding_created(
    ctx: &ProcessCtx,
    state: WaitForFundingCreated,
    event: Event,
) -> Result<(ChannelState, Vec<Action>), Error> {
    let funding_created = match event {
        Event::MessageReceived(Messages::FundingCreated(funding_created))
            if funding_created.temporary_channel_id
                == state.temp_channel_id =>
        {
            funding_created
        }
        event => return unhandled(state, event),
    };

    let keys = ctx.keys;
    let local_funding_pubkey =
        keys.funding_pubkey(&state.local_params.funding_key_path);
    let witness_script = WitnessScript::ln_funding(
        local_funding_pubkey,
        state.remote_params.funding_pubkey,
    );
    let commit_input = FundingInput {
        outpoint: bitcoin::OutPoint::new(
            funding_created.funding_txid,
            funding_created.funding_output_index as u32,
        ),
        amount: state.funding_satoshis,
        witness_script,
    };
    let first = make_first_commit_txs(
        keys,
        state.channel_version,
        &state.local_params,
        &state.remote_params,
        state.funding_satoshis,
        state.push_msat,
        state.initial_feerate_per_kw,
        &commit_input,
        &state.remote_first_per_commitment_point,
    )?;

    if !bolt3::verify_signature(
        &first.local_commit_tx,
        0,
        commit_input.amount,
        &commit_input.witness_script,
        &state.remote_params.funding_pubkey,
        &funding_created.signature,
    ) {
        return Err(Error::InvalidCommitmentSignature);
    }

    let local_signature = keys.sign_funding_spend(
        &first.local_commit_tx,
        &commit_input,
        &state.local_params.funding_key_path,
    );
    let signed_local_commit_tx = bolt3::complete_funding_witness(
        first.local_commit_tx,
        &commit_input.witness_script,
        (local_funding_pubkey, local_signature),
        (
            state.remote_params.funding_pubkey,
            funding_created.signature,
        ),
    );
    let remote_signature = keys.sign_funding_spend(
        &first.remote_commit_tx,
        &commit_input,
        &state.local_params.funding_key_path,
    );

    let channel_id = ChannelId::with(
        funding_created.funding_txid,
        funding_created.funding_output_index,
    );
    let funding_signed = FundingSigned {
        channel_id,
        signature: remote_signature,
    };

    let commitments = Commitments {
        channel_version: state.channel_version,
        local_params: state.local_params,
        remote_params: state.remote_params,
        channel_flags: state.channel_flags,
        channel_id,
        local_commit: LocalCommit {
            index: 0,
            spec: first.local_spec,
            publishable_txs: PublishableTxs {
                commit_tx: StoredTx::from(signed_local_commit_tx),
                htlc_txs_and_sigs: vec![],
            },
        },
        remote_commit: RemoteCommit {
            index: 0,
            spec: first.remote_spec,
            txid: first.remote_commit_tx.txid(),
            remote_per_commitment_point: state
                .remote_first_per_commitment_point,
        },
        local_changes: ChangeLog::default(),
        remote_changes: ChangeLog::default(),
        local_next_htlc_id: 0,
        remote_next_htlc_id: 0,
        // replaced by the real next point from the remote funding_locked
        remote_next_commit_info: RemoteNextCommitInfo::Revoked(
            state.remote_first_per_commitment_point,
        ),
        commit_input: commit_input.clone(),
        remote_per_commitment_secrets: CommitmentSecretStore::new(),
    };

    let minimum_depth = if state.channel_version.is_zero_reserve() {
        0
    } else {
        state.static_params.policy.minimum_depth
    };
    let actions = vec![
        Action::SendWatch(WatchRequest::Spent(commit_input.outpoint)),
        Action::SendWatch(WatchRequest::Confirmed {
            txid: funding_created.funding_txid,
            min_depth: minimum_depth,
        }),
        Action::SendMessage(Messages::FundingSigned(
            funding_signed.clone(),
        )),
        Action::ChannelIdSwitch {
            temp_channel_id: state.temp_channel_id,
            channel_id,
        },
        Action::StoreState,
    ];
    let next = WaitForFundingConfirmed {
        static_params: state.static_params,
        current_tip: state.current_tip,
        commitments,
        funding_tx: None,
        waiting_since: ctx.clock.unix_seconds(),
        deferred: None,
        last_sent: LastFundingMessage::FundingSigned(funding_signed),
    };
    Ok((next.into(), actions))
}

fn process_wait_for_funding_signed(
    ctx: &ProcessCtx,
    state: WaitForFundingSigned,
    event: Event,
) -> Result<(ChannelState, Vec<Action>), Error> {
    let funding_signed = match event {
        Event::MessageReceived(Messages::FundingSigned(funding_signed))
            if funding_signed.channel_id == state.channel_id =>
        {
            funding_signed
        }
        event => return unhandled(state, event),
    };

    let local_commit_tx = state.local_commit_tx.into_inner();
    if !bolt3::verify_signature(
        &local_commit_tx,
        0,
        state.commit_input.amount,
        &state.commit_input.witness_script,
        &state.remote_params.funding_pubkey,
        &funding_signed.signature,
    ) {
        return Err(Error::InvalidCommitmentSignature);
    }

    let keys = ctx.keys;
    let local_funding_pubkey =
        keys.funding_pubkey(&state.local_params.funding_key_path);
    let local_signature = keys.sign_funding_spend(
        &local_commit_tx,
        &state.commit_input,
        &state.local_params.funding_key_path,
    );
    let signed_local_commit_tx = bolt3::complete_funding_witness(
        local_commit_tx,
        &state.commit_input.witness_script,
        (local_funding_pubkey, local_signature),
        (
            state.remote_params.funding_pubkey,
            funding_signed.signature,
        ),
    );

    let remote_first_per_commitment_point =
        state.remote_commit.remote_per_commitment_point;
    let commitments = Commitments {
        channel_version: state.channel_version,
        local_params: state.local_params,
        remote_params: state.remote_params,
        channel_flags: state.channel_flags,
        channel_id: state.channel_id,
        local_commit: LocalCommit {
            index: 0,
            spec: state.local_spec,
            publishable_txs: PublishableTxs {
                commit_tx: StoredTx::from(signed_local_commit_tx),
                htlc_txs_and_sigs: vec![],
            },
        },
        remote_commit: state.remote_commit,
        local_changes: ChangeLog::default(),
        remote_changes: ChangeLog::default(),
        local_next_htlc_id: 0,
        remote_next_htlc_id: 0,
        // replaced by the real next point from the remote funding_locked
        remote_next_commit_info: RemoteNextCommitInfo::Revoked(
            remote_first_per_commitment_point,
        ),
        commit_input: state.commit_input,
        remote_per_commitment_secrets: CommitmentSecretStore::new(),
    };

    let funding_txid = state.funding_tx.txid();
    let actions = vec![
        Action::SendWatch(WatchRequest::Spent(
            commitments.commit_input.outpoint,
        )),
        Action::SendWatch(WatchRequest::Confirmed {
            txid: funding_txid,
            min_depth: state.minimum_depth,
        }),
        Action::StoreState,
        Action::PublishTx(state.funding_tx.clone()),
    ];
    let next = WaitForFundingConfirmed {
        static_params: state.static_params,
        current_tip: state.current_tip,
        commitments,
        funding_tx: Some(state.funding_tx),
        waiting_since: ctx.clock.unix_seconds(),
        deferred: None,
        last_sent: LastFundingMessage::FundingCreated(state.last_sent),
    };
    Ok((next.into(), actions))
}

fn process_wait_for_funding_confirmed(
    ctx: &ProcessCtx,
    mut state: WaitForFundingConfirmed,
    event: Event,
) -> Result<(ChannelState, Vec<Action>), Error> {
    match event {
        Event::MessageReceived(Messages::FundingLocked(funding_locked))
            if funding_locked.channel_id
                == state.commitments.channel_id =>
        {
            debug!(
                "channel {}: funding_locked arrived before our own \
                 confirmation; deferring",
                state.commitments.channel_id
            );
            state.deferred = Some(funding_locked);
            Ok((state.into(), vec![]))
        }
        Event::WatchReceived(WatchEvent::Confirmed {
            txid,
            tx,
            block_height,
            tx_index,
        }) => {
            let outpoint = state.commitments.commit_input.outpoint;
            let funding_valid = txid == outpoint.txid
                && tx
                    .as_inner()
                    .output
                    .get(outpoint.vout as usize)
                    .map(|txout| {
                        txout.script_pubkey
                            == state
                                .commitments
                                .commit_input
                                .script_pubkey()
                                .into_inner()
                            && txout.value
                                == state.commitments.commit_input.amount
                    })
                    .unwrap_or(false);
            if !funding_valid {
                if state.static_params.is_regtest() {
                    warn!(
                        "channel {}: confirmed funding transaction does \
                         not verify; ignoring on regtest",
                        state.commitments.channel_id
                    );
                } else {
                    return Err(Error::FundingTxVerification);
                }
            }

            let keys = ctx.keys;
            let channel_key_path = state.commitments.channel_key_path(keys);
            let funding_locked = FundingLocked {
                channel_id: state.commitments.channel_id,
                next_per_commitment_point: keys
                    .commitment_point(&channel_key_path, 1),
            };
            let short_channel_id = ShortChannelId::new(
                block_height,
                tx_index,
                outpoint.vout as u16,
            )
            .unwrap_or_default();

            let mut actions = vec![
                Action::SendWatch(WatchRequest::Lost(txid)),
                Action::SendMessage(Messages::FundingLocked(
                    funding_locked.clone(),
                )),
                Action::StoreState,
            ];
            let deferred = state.deferred.take();
            let next = WaitForFundingLocked {
                static_params: state.static_params,
                current_tip: state.current_tip,
                commitments: state.commitments,
                short_channel_id,
                last_sent: funding_locked,
            };
            // a funding_locked received during the confirmation wait is
            // replayed now
            if let Some(funding_locked) = deferred {
                let (next, deferred_actions) = process_wait_for_funding_locked(
                    ctx,
                    next,
                    Event::MessageReceived(Messages::FundingLocked(
                        funding_locked,
                    )),
                )?;
                actions.extend(deferred_actions);
                Ok((next, actions))
            } else {
                Ok((next.into(), actions))
            }
        }
        Event::WatchReceived(WatchEvent::Spent { .. }) => {
            // TODO: publish the penalty or latest commitment transaction
            //       once the on-chain closing flow is implemented
            warn!(
                "channel {}: funding output spent while waiting for the \
                 funding confirmation",
                state.commitments.channel_id
            );
            Ok((state.into(), vec![]))
        }
        event => unhandled(state, event),
    }
}

fn process_wait_for_funding_locked(
    ctx: &ProcessCtx,
    mut state: WaitForFundingLocked,
    event: Event,
) -> Result<(ChannelState, Vec<Action>), Error> {
    let funding_locked = match event {
        Event::MessageReceived(Messages::FundingLocked(funding_locked))
            if funding_locked.channel_id
                == state.commitments.channel_id =>
        {
            funding_locked
        }
        event => return unhandled(state, event),
    };

    state.commitments.remote_next_commit_info =
        RemoteNextCommitInfo::Revoked(
            funding_locked.next_per_commitment_point,
        );

    let static_params = &state.static_params;
    let channel_update = ChannelUpdate::compose(
        &static_params.node_secret,
        static_params.remote_node_id,
        static_params.chain_hash,
        state.short_channel_id,
        ctx.clock.unix_seconds() as u32,
        LOCAL_CLTV_EXPIRY_DELTA,
        state.commitments.local_params.htlc_minimum_msat,
        state.commitments.commit_input.amount * 1000,
    );

    let funding_txid = state.commitments.commit_input.outpoint.txid;
    let actions = vec![
        Action::SendWatch(WatchRequest::Confirmed {
            txid: funding_txid,
            min_depth: ANNOUNCEMENTS_MINCONF,
        }),
        Action::StoreState,
    ];
    let next = Normal {
        static_params: state.static_params,
        current_tip: state.current_tip,
        commitments: state.commitments,
        short_channel_id: state.short_channel_id,
        buried: false,
        channel_announcement: None,
        channel_update,
        local_shutdown: None,
        remote_shutdown: None,
    };
    Ok((next.into(), actions))
}

fn process_normal(
    ctx: &ProcessCtx,
    mut state: Normal,
    event: Event,
) -> Result<(ChannelState, Vec<Action>), Error> {
    let channel_id = state.commitments.channel_id;
    match event {
        Event::ExecuteCommand(Command::AddHtlc(cmd)) => {
            if state.shutdown_in_progress() {
                return Err(Error::NoMoreHtlcsClosingInProgress);
            }
            let (commitments, add) = state.commitments.send_add(
                cmd.amount_msat,
                cmd.payment_hash,
                cmd.cltv_expiry,
                cmd.onion,
                state.current_tip.height,
            )?;
            state.commitments = commitments;
            let mut actions =
                vec![Action::SendMessage(Messages::UpdateAddHtlc(add))];
            if cmd.commit {
                actions.push(Action::ProcessCommand(Command::Sign));
            }
            Ok((state.into(), actions))
        }
        Event::ExecuteCommand(Command::FulfillHtlc(cmd)) => {
            let (commitments, fulfill) = state
                .commitments
                .send_fulfill(cmd.htlc_id, cmd.payment_preimage)?;
            state.commitments = commitments;
            let mut actions = vec![Action::SendMessage(
                Messages::UpdateFulfillHtlc(fulfill),
            )];
            if cmd.commit {
                actions.push(Action::ProcessCommand(Command::Sign));
            }
            Ok((state.into(), actions))
        }
        Event::ExecuteCommand(Command::FailHtlc(cmd)) => {
            let (commitments, fail) =
                state.commitments.send_fail(cmd.htlc_id, cmd.reason)?;
            state.commitments = commitments;
            let mut actions =
                vec![Action::SendMessage(Messages::UpdateFailHtlc(fail))];
            if cmd.commit {
                actions.push(Action::ProcessCommand(Command::Sign));
            }
            Ok((state.into(), actions))
        }
        Event::ExecuteCommand(Command::FailMalformedHtlc(cmd)) => {
            let (commitments, fail) = state.commitments.send_fail_malformed(
                cmd.htlc_id,
                cmd.sha256_of_onion,
                cmd.failure_code,
            )?;
            state.commitments = commitments;
            let mut actions = vec![Action::SendMessage(
                Messages::UpdateFailMalformedHtlc(fail),
            )];
            if cmd.commit {
                actions.push(Action::ProcessCommand(Command::Sign));
            }
            Ok((state.into(), actions))
        }
        Event::ExecuteCommand(Command::Sign) => {
            if let RemoteNextCommitInfo::Waiting(waiting) =
                &mut state.commitments.remote_next_commit_info
            {
                debug!(
                    "channel {}: commitment is already in flight; will \
                     re-sign on revocation",
                    channel_id
                );
                waiting.re_sign_asap = true;
                return Ok((state.into(), vec![]));
            }
            if !state.commitments.local_has_changes() {
                warn!(
                    "channel {}: nothing to sign, ignoring CMD_SIGN",
                    channel_id
                );
                return Ok((state.into(), vec![]));
            }
            let (commitments, commitment_signed) =
                state.commitments.send_commit(ctx.keys)?;
            let htlc_infos = commitments.htlc_infos_for_next_remote_commit();
            state.commitments = commitments;
            Ok((state.into(), vec![
                Action::StoreHtlcInfos(htlc_infos),
                Action::StoreState,
                Action::SendMessage(Messages::CommitmentSigned(
                    commitment_signed,
                )),
            ]))
        }
        Event::MessageReceived(message) => {
            if let Some(message_channel_id) = message_channel_id(&message) {
                if message_channel_id != channel_id {
                    warn!(
                        "peer message {} with channel id {} does not \
                         belong to channel {}; ignoring",
                        message, message_channel_id, channel_id
                    );
                    return Ok((state.into(), vec![]));
                }
            }
            process_normal_message(ctx, state, message)
        }
        Event::WatchReceived(WatchEvent::Confirmed { txid, .. })
            if txid == state.commitments.commit_input.outpoint.txid =>
        {
            state.buried = true;
            Ok((state.into(), vec![Action::StoreState]))
        }
        event => unhandled(state, event),
    }
}

fn process_normal_message(
    ctx: &ProcessCtx,
    mut state: Normal,
    message: Messages,
) -> Result<(ChannelState, Vec<Action>), Error> {
    match message {
        Messages::UpdateAddHtlc(add) => {
            state.commitments = state.commitments.receive_add(add)?;
            Ok((state.into(), vec![]))
        }
        Messages::UpdateFulfillHtlc(fulfill) => {
            state.commitments = state.commitments.receive_fulfill(fulfill)?;
            Ok((state.into(), vec![]))
        }
        Messages::UpdateFailHtlc(fail) => {
            state.commitments = state.commitments.receive_fail(fail)?;
            Ok((state.into(), vec![]))
        }
        Messages::UpdateFailMalformedHtlc(fail) => {
            state.commitments =
                state.commitments.receive_fail_malformed(fail)?;
            Ok((state.into(), vec![]))
        }
        Messages::CommitmentSigned(commitment_signed) => {
            let (commitments, revocation) = state
                .commitments
                .receive_commit(ctx.keys, &commitment_signed)?;
            state.commitments = commitments;
            let mut actions = vec![Action::SendMessage(
                Messages::RevokeAndAck(revocation),
            )];
            if state.commitments.local_has_changes() {
                actions.push(Action::ProcessCommand(Command::Sign));
            }
            Ok((state.into(), actions))
        }
        Messages::RevokeAndAck(revocation) => {
            let re_sign_asap = matches!(
                &state.commitments.remote_next_commit_info,
                RemoteNextCommitInfo::Waiting(waiting)
                    if waiting.re_sign_asap
            );
            let (commitments, forwards) =
                state.commitments.receive_revocation(&revocation)?;
            state.commitments = commitments;
            let mut actions = vec![Action::StoreState];
            for forward in forwards {
                match forward {
                    UpdateMessage::Add(add) => {
                        actions.push(Action::ProcessAdd(add))
                    }
                    UpdateMessage::Fail(fail) => {
                        actions.push(Action::ProcessFail(fail))
                    }
                    UpdateMessage::FailMalformed(fail) => {
                        actions.push(Action::ProcessFailMalformed(fail))
                    }
                    // settled outgoing payments complete locally with the
                    // preimage already received
                    UpdateMessage::Fulfill(_) => {}
                }
            }
            if re_sign_asap {
                actions.push(Action::ProcessCommand(Command::Sign));
            }
            Ok((state.into(), actions))
        }
        Messages::Shutdown(shutdown) => {
            // the mutual close negotiation is outside of the normal
            // operation cutoff; the shutdown is recorded so that no new
            // HTLCs are accepted from the local side
            warn!(
                "channel {}: remote shutdown received; mutual close \
                 negotiation is not part of this machine",
                state.commitments.channel_id
            );
            state.remote_shutdown = Some(shutdown);
            Ok((state.into(), vec![Action::StoreState]))
        }
        message => unhandled(state, Event::MessageReceived(message)),
    }
}

/// Channel id carried by a peer message, when it has one
fn message_channel_id(message: &Messages) -> Option<ChannelId> {
    match message {
        Messages::FundingSigned(msg) => Some(msg.channel_id),
        Messages::FundingLocked(msg) => Some(msg.channel_id),
        Messages::Shutdown(msg) => Some(msg.channel_id),
        Messages::UpdateAddHtlc(msg) => Some(msg.channel_id),
        Messages::UpdateFulfillHtlc(msg) => Some(msg.channel_id),
        Messages::UpdateFailHtlc(msg) => Some(msg.channel_id),
        Messages::UpdateFailMalformedHtlc(msg) => Some(msg.channel_id),
        Messages::CommitmentSigned(msg) => Some(msg.channel_id),
        Messages::RevokeAndAck(msg) => Some(msg.channel_id),
        Messages::Error(msg) => Some(msg.channel_id),
        Messages::Init(_)
        | Messages::OpenChannel(_)
        | Messages::AcceptChannel(_)
        | Messages::FundingCreated(_) => None,
    }
}

#[cfg(test)]
mod test {
    use amplify::{DumbDefault, Slice32};
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::{Network, PackedLockTime, Transaction, TxOut};
    use bitcoin_scripts::hlc::HashPreimage;
    use secp256k1::ecdsa::Signature;
    use secp256k1::{PublicKey, SecretKey, SECP256K1};

    use super::*;
    use crate::channel::commitments::preimage_hash;
    use crate::channel::keys::test_helpers::{DumbKeyManager, FrozenClock};
    use crate::channel::keys::KeyManager;
    use crate::channel::params::{chain_hash, LocalParams, Policy};
    use crate::channel::state::{
        ChainTip, CmdAddHtlc, CmdFulfillHtlc, InitFunder,
    };
    use crate::channel::StaticParams;
    use crate::p2p::bolt9::FeatureSet;
    use crate::p2p::{
        CommitmentSigned, Init, OnionPacket, TempChannelId, UpdateAddHtlc,
    };

    const FUNDING_SAT: u64 = 1_000_000;
    const FEERATE: u32 = 2500;
    const HEIGHT: u32 = 600_000;

    struct Peer {
        state: ChannelState,
        keys: DumbKeyManager,
        clock: FrozenClock,
    }

    impl Peer {
        fn new(seed: u8, remote_seed: u8) -> Peer {
            let static_params = StaticParams {
                chain_hash: chain_hash(Network::Testnet),
                node_secret: SecretKey::from_slice(&[seed; 32]).unwrap(),
                features: FeatureSet::empty(),
                policy: Policy::default(),
                remote_node_id: PublicKey::from_secret_key(
                    SECP256K1,
                    &SecretKey::from_slice(&[remote_seed; 32]).unwrap(),
                ),
            };
            Peer {
                state: ChannelState::WaitForInit(WaitForInit {
                    static_params,
                    current_tip: tip(),
                }),
                keys: DumbKeyManager::with(seed),
                clock: FrozenClock(1_600_000_000),
            }
        }

        fn process(&mut self, event: impl Into<Event>) -> Vec<Action> {
            let ctx = ProcessCtx {
                keys: &self.keys,
                clock: &self.clock,
            };
            let (state, actions) =
                self.state.clone().process(&ctx, event.into());
            self.state = state;
            actions
        }

        fn commitments(&self) -> &Commitments {
            self.state.commitments().expect("channel is funded")
        }
    }

    fn tip() -> ChainTip {
        ChainTip {
            height: HEIGHT,
            header: genesis_block(Network::Testnet).header,
        }
    }

    fn local_params(is_funder: bool) -> LocalParams {
        LocalParams {
            dust_limit_satoshis: 546,
            max_htlc_value_in_flight_msat: 500_000_000,
            channel_reserve_satoshis: 10_000,
            htlc_minimum_msat: 1,
            to_self_delay: 144,
            max_accepted_htlcs: 30,
            is_funder,
            funding_key_path: Default::default(),
        }
    }

    fn temp_channel_id() -> TempChannelId {
        let mut slice = [0u8; 32];
        slice[31] = 1;
        TempChannelId::from(Slice32::from_inner(slice))
    }

    fn preimage(byte: u8) -> HashPreimage {
        HashPreimage::from_inner(Slice32::from_inner([byte; 32]))
    }

    fn sent_message(actions: &[Action], index: usize) -> Messages {
        match &actions[index] {
            Action::SendMessage(message) => message.clone(),
            action => panic!("expected send_message, got {}", action),
        }
    }

    fn add_cmd(amount_msat: u64, preimage: &HashPreimage) -> CmdAddHtlc {
        CmdAddHtlc {
            amount_msat,
            payment_hash: preimage_hash(preimage),
            cltv_expiry: HEIGHT + 40,
            onion: OnionPacket::dumb_default(),
            commit: false,
        }
    }

    /// Drives both parties through the funding flow into the Normal state,
    /// asserting every emitted action of the happy path on the way
    fn open_channel_pair() -> (Peer, Peer) {
        let mut funder = Peer::new(0xA1, 0xB2);
        let mut fundee = Peer::new(0xB2, 0xA1);
        let remote_init = Init::with(FeatureSet::empty());

        // channel initialization
        let actions = funder.process(InitFunder {
            temp_channel_id: temp_channel_id(),
            funding_satoshis: FUNDING_SAT,
            push_msat: 0,
            initial_feerate_per_kw: FEERATE,
            local_params: local_params(true),
            channel_flags: 0,
            remote_init: remote_init.clone(),
        });
        assert_eq!(funder.state.to_string(), "WAIT_FOR_ACCEPT_CHANNEL");
        assert_eq!(actions.len(), 1);
        let open_channel = match sent_message(&actions, 0) {
            Messages::OpenChannel(msg) => msg,
            msg => panic!("expected open_channel, got {}", msg),
        };
        assert_eq!(open_channel.funding_satoshis, FUNDING_SAT);
        assert_eq!(open_channel.feerate_per_kw, FEERATE);

        let actions = fundee.process(crate::channel::state::InitFundee {
            temp_channel_id: temp_channel_id(),
            local_params: local_params(false),
            remote_init,
        });
        assert!(actions.is_empty());
        assert_eq!(fundee.state.to_string(), "WAIT_FOR_OPEN_CHANNEL");

        // open_channel / accept_channel
        let actions = fundee.process(Messages::OpenChannel(open_channel));
        assert_eq!(fundee.state.to_string(), "WAIT_FOR_FUNDING_CREATED");
        let accept_channel = match sent_message(&actions, 0) {
            Messages::AcceptChannel(msg) => msg,
            msg => panic!("expected accept_channel, got {}", msg),
        };
        assert_eq!(accept_channel.minimum_depth, 3);

        // funding transaction construction
        let actions =
            funder.process(Messages::AcceptChannel(accept_channel));
        assert_eq!(
            funder.state.to_string(),
            "WAIT_FOR_FUNDING_INTERNAL"
        );
        let script_pubkey = match &actions[0] {
            Action::MakeFundingTx {
                script_pubkey,
                amount,
                feerate_per_kw,
            } => {
                assert_eq!(*amount, FUNDING_SAT);
                assert_eq!(*feerate_per_kw, FEERATE);
                script_pubkey.clone()
            }
            action => panic!("expected make_funding_tx, got {}", action),
        };

        let funding_tx = Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![],
            output: vec![TxOut {
                value: FUNDING_SAT,
                script_pubkey: script_pubkey.into_inner(),
            }],
        };
        let funding_txid = funding_tx.txid();
        let actions = funder.process(MakeFundingTxResponse {
            funding_tx: StoredTx::from(funding_tx.clone()),
            funding_tx_output_index: 0,
            fee: 250,
        });
        assert_eq!(funder.state.to_string(), "WAIT_FOR_FUNDING_SIGNED");
        match &actions[0] {
            Action::ChannelIdAssigned { channel_id, .. } => {
                assert_eq!(*channel_id, ChannelId::with(funding_txid, 0))
            }
            action => panic!("expected channel_id_assigned, got {}", action),
        }
        let funding_created = match sent_message(&actions, 1) {
            Messages::FundingCreated(msg) => msg,
            msg => panic!("expected funding_created, got {}", msg),
        };

        // funding_created / funding_signed
        let actions =
            fundee.process(Messages::FundingCreated(funding_created));
        assert_eq!(
            fundee.state.to_string(),
            "WAIT_FOR_FUNDING_CONFIRMED"
        );
        assert!(matches!(
            actions[0],
            Action::SendWatch(WatchRequest::Spent(_))
        ));
        assert!(matches!(
            actions[1],
            Action::SendWatch(WatchRequest::Confirmed { min_depth: 3, .. })
        ));
        let funding_signed = match sent_message(&actions, 2) {
            Messages::FundingSigned(msg) => msg,
            msg => panic!("expected funding_signed, got {}", msg),
        };
        assert!(matches!(actions[3], Action::ChannelIdSwitch { .. }));
        assert!(matches!(actions[4], Action::StoreState));

        let actions =
            funder.process(Messages::FundingSigned(funding_signed));
        assert_eq!(
            funder.state.to_string(),
            "WAIT_FOR_FUNDING_CONFIRMED"
        );
        assert!(matches!(
            actions[0],
            Action::SendWatch(WatchRequest::Spent(_))
        ));
        assert!(matches!(
            actions[1],
            Action::SendWatch(WatchRequest::Confirmed { .. })
        ));
        // the state is persisted before the funding transaction leaves the
        // node
        assert!(matches!(actions[2], Action::StoreState));
        match &actions[3] {
            Action::PublishTx(tx) => {
                assert_eq!(tx.as_inner(), &funding_tx)
            }
            action => panic!("expected publish_tx, got {}", action),
        }

        // funding confirmation
        let confirmation = WatchEvent::Confirmed {
            txid: funding_txid,
            tx: StoredTx::from(funding_tx.clone()),
            block_height: HEIGHT + 10,
            tx_index: 3,
        };
        let actions = funder.process(confirmation.clone());
        assert_eq!(funder.state.to_string(), "WAIT_FOR_FUNDING_LOCKED");
        assert!(matches!(
            actions[0],
            Action::SendWatch(WatchRequest::Lost(_))
        ));
        let funder_locked = match sent_message(&actions, 1) {
            Messages::FundingLocked(msg) => msg,
            msg => panic!("expected funding_locked, got {}", msg),
        };
        // the funding_locked point is the local commitment point #1
        assert_eq!(
            funder_locked.next_per_commitment_point,
            funder.keys.commitment_point(&Default::default(), 1)
        );

        let actions = fundee.process(confirmation);
        let fundee_locked = match sent_message(&actions, 1) {
            Messages::FundingLocked(msg) => msg,
            msg => panic!("expected funding_locked, got {}", msg),
        };

        // exchange of funding_locked brings both into Normal
        let actions =
            funder.process(Messages::FundingLocked(fundee_locked));
        assert_eq!(funder.state.to_string(), "NORMAL");
        assert!(matches!(
            actions[0],
            Action::SendWatch(WatchRequest::Confirmed {
                min_depth: ANNOUNCEMENTS_MINCONF,
                ..
            })
        ));
        fundee.process(Messages::FundingLocked(funder_locked));
        assert_eq!(fundee.state.to_string(), "NORMAL");

        match (&funder.state, &fundee.state) {
            (ChannelState::Normal(funder), ChannelState::Normal(fundee)) => {
                assert!(!funder.buried);
                assert_eq!(
                    funder.commitments.channel_id,
                    fundee.commitments.channel_id
                );
                // both channel updates carry valid signatures of their
                // authors
                let funder_node_id = PublicKey::from_secret_key(
                    SECP256K1,
                    &funder.static_params.node_secret,
                );
                assert!(funder
                    .channel_update
                    .verify_sig(&funder_node_id));
            }
            _ => unreachable!(),
        }
        (funder, fundee)
    }

    #[test]
    fn funder_fundee_open_flow() {
        open_channel_pair();
    }

    #[test]
    fn htlc_id_assignment() {
        let (mut funder, _) = open_channel_pair();
        let pre = preimage(1);
        let actions =
            funder.process(Command::AddHtlc(add_cmd(100_000_000, &pre)));
        let add = match sent_message(&actions, 0) {
            Messages::UpdateAddHtlc(msg) => msg,
            msg => panic!("expected update_add_htlc, got {}", msg),
        };
        assert_eq!(add.htlc_id, 0);
        let actions =
            funder.process(Command::AddHtlc(add_cmd(50_000_000, &pre)));
        let add = match sent_message(&actions, 0) {
            Messages::UpdateAddHtlc(msg) => msg,
            msg => panic!("expected update_add_htlc, got {}", msg),
        };
        assert_eq!(add.htlc_id, 1);
        assert_eq!(funder.commitments().local_next_htlc_id, 2);
    }

    fn transfer_add(
        funder: &mut Peer,
        fundee: &mut Peer,
        amount_msat: u64,
        pre: &HashPreimage,
    ) -> UpdateAddHtlc {
        let actions =
            funder.process(Command::AddHtlc(add_cmd(amount_msat, pre)));
        let add = match sent_message(&actions, 0) {
            Messages::UpdateAddHtlc(msg) => msg,
            msg => panic!("expected update_add_htlc, got {}", msg),
        };
        let actions = fundee.process(Messages::UpdateAddHtlc(add.clone()));
        assert!(actions.is_empty());
        add
    }

    #[test]
    fn payment_sign_dance() {
        let (mut funder, mut fundee) = open_channel_pair();
        let pre = preimage(7);
        transfer_add(&mut funder, &mut fundee, 100_000_000, &pre);

        // CMD_SIGN stores the htlc infos and the state before the
        // signature leaves the node
        let actions = funder.process(Command::Sign);
        match &actions[0] {
            Action::StoreHtlcInfos(infos) => assert_eq!(infos.len(), 1),
            action => panic!("expected store_htlc_infos, got {}", action),
        }
        assert!(matches!(actions[1], Action::StoreState));
        let commit_sig = match sent_message(&actions, 2) {
            Messages::CommitmentSigned(msg) => msg,
            msg => panic!("expected commitment_signed, got {}", msg),
        };
        assert_eq!(commit_sig.htlc_signatures.len(), 1);

        // the fundee answers with a revocation and asks for its own
        // signing round
        let actions =
            fundee.process(Messages::CommitmentSigned(commit_sig));
        let revocation = match sent_message(&actions, 0) {
            Messages::RevokeAndAck(msg) => msg,
            msg => panic!("expected revoke_and_ack, got {}", msg),
        };
        assert!(matches!(
            actions[1],
            Action::ProcessCommand(Command::Sign)
        ));

        let actions = funder.process(Messages::RevokeAndAck(revocation));
        assert!(matches!(actions[0], Action::StoreState));

        let actions = fundee.process(Command::Sign);
        let commit_sig = match sent_message(&actions, 2) {
            Messages::CommitmentSigned(msg) => msg,
            msg => panic!("expected commitment_signed, got {}", msg),
        };
        let actions =
            funder.process(Messages::CommitmentSigned(commit_sig));
        let revocation = match sent_message(&actions, 0) {
            Messages::RevokeAndAck(msg) => msg,
            msg => panic!("expected revoke_and_ack, got {}", msg),
        };
        // the funder has nothing else to sign
        assert_eq!(actions.len(), 1);

        // once the fundee processes the revocation the HTLC is
        // irrevocable and is handed over to the payment layer
        let actions = fundee.process(Messages::RevokeAndAck(revocation));
        assert!(matches!(actions[0], Action::StoreState));
        let add = match &actions[1] {
            Action::ProcessAdd(add) => add.clone(),
            action => panic!("expected process_add, got {}", action),
        };
        assert_eq!(add.htlc_id, 0);
        assert_eq!(add.amount_msat, 100_000_000);

        assert_eq!(funder.commitments().local_commit.index, 1);
        assert_eq!(fundee.commitments().local_commit.index, 1);

        // the fundee settles the payment with the preimage
        let actions = fundee.process(Command::FulfillHtlc(CmdFulfillHtlc {
            htlc_id: 0,
            payment_preimage: pre,
            commit: true,
        }));
        let fulfill = match sent_message(&actions, 0) {
            Messages::UpdateFulfillHtlc(msg) => msg,
            msg => panic!("expected update_fulfill_htlc, got {}", msg),
        };
        assert!(matches!(
            actions[1],
            Action::ProcessCommand(Command::Sign)
        ));
        let actions =
            funder.process(Messages::UpdateFulfillHtlc(fulfill));
        assert!(actions.is_empty());
        let actions = fundee.process(Command::Sign);
        let commit_sig = match sent_message(&actions, 2) {
            Messages::CommitmentSigned(msg) => msg,
            msg => panic!("expected commitment_signed, got {}", msg),
        };
        let actions =
            funder.process(Messages::CommitmentSigned(commit_sig));
        let revocation = match sent_message(&actions, 0) {
            Messages::RevokeAndAck(msg) => msg,
            msg => panic!("expected revoke_and_ack, got {}", msg),
        };
        assert!(matches!(
            actions[1],
            Action::ProcessCommand(Command::Sign)
        ));
        fundee.process(Messages::RevokeAndAck(revocation));
        let actions = funder.process(Command::Sign);
        let commit_sig = match sent_message(&actions, 2) {
            Messages::CommitmentSigned(msg) => msg,
            msg => panic!("expected commitment_signed, got {}", msg),
        };
        let actions =
            fundee.process(Messages::CommitmentSigned(commit_sig));
        let revocation = match sent_message(&actions, 0) {
            Messages::RevokeAndAck(msg) => msg,
            msg => panic!("expected revoke_and_ack, got {}", msg),
        };
        funder.process(Messages::RevokeAndAck(revocation));

        // the payment has settled into the fundee balance
        assert_eq!(
            funder.commitments().local_commit.spec.to_local_msat,
            FUNDING_SAT * 1000 - 100_000_000
        );
        assert_eq!(
            fundee.commitments().local_commit.spec.to_local_msat,
            100_000_000
        );
        assert!(funder
            .commitments()
            .local_commit
            .spec
            .htlcs
            .is_empty());
    }

    #[test]
    fn invalid_commitment_signature() {
        let (mut funder, mut fundee) = open_channel_pair();
        let pre = preimage(3);
        transfer_add(&mut funder, &mut fundee, 100_000_000, &pre);

        let state_before = fundee.state.clone();
        let garbage = CommitmentSigned {
            channel_id: fundee.commitments().channel_id,
            signature: Signature::from_compact(&[1u8; 64]).unwrap(),
            htlc_signatures: vec![],
        };
        let actions =
            fundee.process(Messages::CommitmentSigned(garbage));
        assert_eq!(actions, vec![Action::HandleError(
            Error::InvalidCommitmentSignature
        )]);
        assert_eq!(fundee.state, state_before);
    }

    #[test]
    fn deferred_funding_locked() {
        let mut funder = Peer::new(0xA1, 0xB2);
        let mut fundee = Peer::new(0xB2, 0xA1);
        let remote_init = Init::with(FeatureSet::empty());

        let actions = funder.process(InitFunder {
            temp_channel_id: temp_channel_id(),
            funding_satoshis: FUNDING_SAT,
            push_msat: 0,
            initial_feerate_per_kw: FEERATE,
            local_params: local_params(true),
            channel_flags: 0,
            remote_init: remote_init.clone(),
        });
        let open_channel = sent_message(&actions, 0);
        fundee.process(crate::channel::state::InitFundee {
            temp_channel_id: temp_channel_id(),
            local_params: local_params(false),
            remote_init,
        });
        let actions = fundee.process(open_channel);
        let accept_channel = sent_message(&actions, 0);
        let actions = funder.process(accept_channel);
        let script_pubkey = match &actions[0] {
            Action::MakeFundingTx { script_pubkey, .. } => {
                script_pubkey.clone()
            }
            action => panic!("expected make_funding_tx, got {}", action),
        };
        let funding_tx = Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![],
            output: vec![TxOut {
                value: FUNDING_SAT,
                script_pubkey: script_pubkey.into_inner(),
            }],
        };
        let actions = funder.process(MakeFundingTxResponse {
            funding_tx: StoredTx::from(funding_tx.clone()),
            funding_tx_output_index: 0,
            fee: 250,
        });
        let funding_created = sent_message(&actions, 1);
        let actions = fundee.process(funding_created);
        let funding_signed = sent_message(&actions, 2);
        funder.process(funding_signed);

        let confirmation = WatchEvent::Confirmed {
            txid: funding_tx.txid(),
            tx: StoredTx::from(funding_tx),
            block_height: HEIGHT + 10,
            tx_index: 3,
        };
        let actions = funder.process(confirmation.clone());
        let funder_locked = sent_message(&actions, 1);

        // the funder locks first; the fundee defers the message until its
        // own confirmation arrives
        let actions = fundee.process(funder_locked);
        assert!(actions.is_empty());
        assert_eq!(
            fundee.state.to_string(),
            "WAIT_FOR_FUNDING_CONFIRMED"
        );

        // the confirmation replays the deferred message and the fundee
        // goes straight into Normal
        let actions = fundee.process(confirmation);
        assert_eq!(fundee.state.to_string(), "NORMAL");
        assert!(actions
            .iter()
            .any(|action| matches!(action, Action::SendMessage(
                Messages::FundingLocked(_)
            ))));
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::SendWatch(WatchRequest::Confirmed {
                min_depth: ANNOUNCEMENTS_MINCONF,
                ..
            })
        )));
    }

    #[test]
    fn unhandled_events_are_ignored() {
        let mut peer = Peer::new(0xA1, 0xB2);
        let state_before = peer.state.clone();
        let actions = peer.process(Messages::FundingLocked(FundingLocked {
            channel_id: ChannelId::default(),
            next_per_commitment_point: PublicKey::from_secret_key(
                SECP256K1,
                &SecretKey::from_slice(&[5u8; 32]).unwrap(),
            ),
        }));
        assert!(actions.is_empty());
        assert_eq!(peer.state, state_before);
    }

    #[test]
    fn shutdown_blocks_new_htlcs() {
        let (mut funder, _) = open_channel_pair();
        let shutdown = crate::p2p::Shutdown {
            channel_id: funder.commitments().channel_id,
            scriptpubkey: Default::default(),
        };
        let actions = funder.process(Messages::Shutdown(shutdown));
        assert_eq!(actions, vec![Action::StoreState]);

        let pre = preimage(4);
        let actions =
            funder.process(Command::AddHtlc(add_cmd(10_000_000, &pre)));
        assert_eq!(actions, vec![Action::HandleError(
            Error::NoMoreHtlcsClosingInProgress
        )]);
    }

    #[test]
    fn resign_after_revocation() {
        let (mut funder, mut fundee) = open_channel_pair();
        let pre = preimage(5);
        transfer_add(&mut funder, &mut fundee, 50_000_000, &pre);
        let actions = funder.process(Command::Sign);
        let commit_sig = sent_message(&actions, 2);

        // a new HTLC and a CMD_SIGN while the previous commitment is
        // still unrevoked: the signature is postponed
        let actions =
            funder.process(Command::AddHtlc(add_cmd(25_000_000, &pre)));
        let second_add = sent_message(&actions, 0);
        let actions = funder.process(Command::Sign);
        assert!(actions.is_empty());

        // the fundee sees the messages in the wire order: the commitment
        // signature goes before the second HTLC
        let actions = fundee.process(commit_sig);
        let revocation = sent_message(&actions, 0);
        fundee.process(second_add);

        // the postponed CMD_SIGN fires right after the revocation
        let actions = funder.process(revocation);
        assert!(matches!(actions[0], Action::StoreState));
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::ProcessCommand(Command::Sign)
        )));
    }

    #[test]
    fn buried_after_announcement_depth() {
        let (mut funder, _) = open_channel_pair();
        let funding_txid =
            funder.commitments().commit_input.outpoint.txid;
        let tx = funder
            .commitments()
            .local_commit
            .publishable_txs
            .commit_tx
            .clone();
        let actions = funder.process(WatchEvent::Confirmed {
            txid: funding_txid,
            tx,
            block_height: HEIGHT + 16,
            tx_index: 3,
        });
        assert_eq!(actions, vec![Action::StoreState]);
        match &funder.state {
            ChannelState::Normal(normal) => assert!(normal.buried),
            state => panic!("unexpected state {}", state),
        }
    }
}
