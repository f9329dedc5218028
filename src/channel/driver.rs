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

//! The driver pumping events through the transition function and
//! dispatching the resulting actions to the external collaborators.
//!
//! All channel I/O lives here: the transition function itself never touches
//! the network, the chain or the disk.

use std::collections::VecDeque;

use amplify::Wrapper;
use bitcoin::Transaction;
use bitcoin_scripts::PubkeyScript;

use super::commitments::HtlcInfo;
use super::keys::{Clock, KeyManager, ProcessCtx};
use super::state::{Action, ChannelState, Event, WatchRequest};
use super::Error;
use crate::p2p::{
    ChannelId, Messages, TempChannelId, UpdateAddHtlc, UpdateFailHtlc,
    UpdateFailMalformedHtlc,
};

/// Errors of the external collaborators dispatched to by the driver
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum DriverError {
    /// failure writing to the remote peer: {0}
    Peer(String),

    /// blockchain watcher failure: {0}
    Watcher(String),

    /// on-chain wallet failure: {0}
    Wallet(String),

    /// channel state persistence failure: {0}
    Storage(String),
}

/// Writer of peer messages into the (encrypted) transport towards the
/// remote node
pub trait PeerWriter {
    fn send_message(&mut self, message: Messages) -> Result<(), DriverError>;
}

/// Blockchain watcher: registers watches and broadcasts transactions.
/// Reports back by injecting [`super::state::WatchEvent`]s into the driver
/// queue.
pub trait ChainWatcher {
    fn watch(&mut self, request: WatchRequest) -> Result<(), DriverError>;

    fn publish_tx(&mut self, tx: &Transaction) -> Result<(), DriverError>;
}

/// On-chain wallet constructing the funding transaction. Reports back by
/// injecting an [`Event::MakeFundingTxResponse`] into the driver queue.
pub trait FundingWallet {
    fn make_funding_tx(
        &mut self,
        script_pubkey: PubkeyScript,
        amount: u64,
        feerate_per_kw: u32,
    ) -> Result<(), DriverError>;
}

/// Atomic crash-safe per-channel persistence
pub trait StateStore {
    fn store_state(&mut self, state: &ChannelState)
        -> Result<(), DriverError>;

    fn store_htlc_infos(
        &mut self,
        htlc_infos: &[HtlcInfo],
    ) -> Result<(), DriverError>;
}

/// Sink for channel notifications addressed to the local node (payment
/// layer, channel registry, error reporting)
pub trait ChannelObserver {
    fn channel_id_assigned(
        &mut self,
        _temp_channel_id: TempChannelId,
        _channel_id: ChannelId,
    ) {
    }

    fn process_add(&mut self, _add: UpdateAddHtlc) {}

    fn process_fail(&mut self, _fail: UpdateFailHtlc) {}

    fn process_fail_malformed(&mut self, _fail: UpdateFailMalformedHtlc) {}

    fn handle_error(&mut self, _error: Error) {}
}

/// Single-threaded event pump of one channel.
///
/// Takes events from a FIFO queue, feeds them into
/// [`ChannelState::process`] and dispatches the returned actions in order.
/// The state is persisted before any action whose effect is externally
/// observable and cannot be rolled back: publication of the funding
/// transaction, sending `commitment_signed` or `revoke_and_ack`.
pub struct ChannelDriver {
    state: Option<ChannelState>,
    queue: VecDeque<Event>,
    keys: Box<dyn KeyManager>,
    clock: Box<dyn Clock>,
    peer: Box<dyn PeerWriter>,
    watcher: Box<dyn ChainWatcher>,
    wallet: Box<dyn FundingWallet>,
    store: Box<dyn StateStore>,
    observer: Box<dyn ChannelObserver>,
}

impl ChannelDriver {
    /// Constructs the driver around an initial (or crash-recovered) channel
    /// state
    #[allow(clippy::too_many_arguments)]
    pub fn with(
        state: ChannelState,
        keys: Box<dyn KeyManager>,
        clock: Box<dyn Clock>,
        peer: Box<dyn PeerWriter>,
        watcher: Box<dyn ChainWatcher>,
        wallet: Box<dyn FundingWallet>,
        store: Box<dyn StateStore>,
        observer: Box<dyn ChannelObserver>,
    ) -> ChannelDriver {
        ChannelDriver {
            state: Some(state),
            queue: VecDeque::new(),
            keys,
            clock,
            peer,
            watcher,
            wallet,
            store,
            observer,
        }
    }

    /// The current channel state
    #[inline]
    pub fn state(&self) -> &ChannelState {
        self.state
            .as_ref()
            .expect("channel state is always present between events")
    }

    /// Appends an event to the processing queue without running it
    #[inline]
    pub fn enqueue(&mut self, event: Event) {
        self.queue.push_back(event);
    }

    /// Processes queued events one at a time until the queue is drained.
    /// Each event is fully consumed, with all its actions dispatched,
    /// before the next one is drawn.
    pub fn run(&mut self) -> Result<(), DriverError> {
        while let Some(event) = self.queue.pop_front() {
            self.process_event(event)?;
        }
        Ok(())
    }

    fn process_event(&mut self, event: Event) -> Result<(), DriverError> {
        trace!("processing event {}", event);
        let state = self
            .state
            .take()
            .expect("channel state is always present between events");
        let (state, actions) = {
            let ctx = ProcessCtx {
                keys: self.keys.as_ref(),
                clock: self.clock.as_ref(),
            };
            state.process(&ctx, event)
        };
        let mut stored = false;
        for action in actions {
            self.dispatch(&state, action, &mut stored)?;
        }
        self.state = Some(state);
        Ok(())
    }

    fn dispatch(
        &mut self,
        state: &ChannelState,
        action: Action,
        stored: &mut bool,
    ) -> Result<(), DriverError> {
        trace!("dispatching action {}", action);
        match action {
            Action::StoreState => self.store_once(state, stored),
            Action::SendMessage(message) => {
                if is_irreversible(&message) {
                    self.store_once(state, stored)?;
                }
                self.peer.send_message(message)
            }
            Action::PublishTx(tx) => {
                self.store_once(state, stored)?;
                self.watcher.publish_tx(tx.as_inner())
            }
            Action::SendWatch(request) => self.watcher.watch(request),
            Action::MakeFundingTx {
                script_pubkey,
                amount,
                feerate_per_kw,
            } => {
                self.wallet
                    .make_funding_tx(script_pubkey, amount, feerate_per_kw)
            }
            Action::StoreHtlcInfos(htlc_infos) => {
                self.store.store_htlc_infos(&htlc_infos)
            }
            Action::ProcessCommand(command) => {
                self.queue.push_back(Event::ExecuteCommand(command));
                Ok(())
            }
            Action::ChannelIdAssigned {
                temp_channel_id,
                channel_id,
            }
            | Action::ChannelIdSwitch {
                temp_channel_id,
                channel_id,
            } => {
                self.observer
                    .channel_id_assigned(temp_channel_id, channel_id);
                Ok(())
            }
            Action::ProcessAdd(add) => {
                self.observer.process_add(add);
                Ok(())
            }
            Action::ProcessFail(fail) => {
                self.observer.process_fail(fail);
                Ok(())
            }
            Action::ProcessFailMalformed(fail) => {
                self.observer.process_fail_malformed(fail);
                Ok(())
            }
            Action::HandleError(error) => {
                self.observer.handle_error(error);
                Ok(())
            }
        }
    }

    /// States change once per event, so a single write per pump cycle
    /// covers all store requests of its action list
    fn store_once(
        &mut self,
        state: &ChannelState,
        stored: &mut bool,
    ) -> Result<(), DriverError> {
        if !*stored {
            self.store.store_state(state)?;
            *stored = true;
        }
        Ok(())
    }
}

/// Messages whose sending cannot be rolled back and therefore must never
/// outrun the persisted state
fn is_irreversible(message: &Messages) -> bool {
    matches!(
        message,
        Messages::CommitmentSigned(_) | Messages::RevokeAndAck(_)
    )
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use amplify::{DumbDefault, Slice32, Wrapper};
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::{Network, PackedLockTime, TxOut};
    use bitcoin_scripts::hlc::HashPreimage;
    use secp256k1::{PublicKey, SecretKey, SECP256K1};

    use super::*;
    use crate::channel::bolt3::StoredTx;
    use crate::channel::commitments::preimage_hash;
    use crate::channel::keys::test_helpers::{DumbKeyManager, FrozenClock};
    use crate::channel::params::{chain_hash, LocalParams, Policy};
    use crate::channel::state::{
        ChainTip, CmdAddHtlc, CmdFulfillHtlc, Command, InitFundee,
        InitFunder, MakeFundingTxResponse, WaitForInit, WatchEvent,
    };
    use crate::channel::StaticParams;
    use crate::p2p::bolt9::FeatureSet;
    use crate::p2p::{Init, OnionPacket, TempChannelId};

    type Log = Rc<RefCell<Vec<String>>>;
    type Outbox = Rc<RefCell<Vec<Messages>>>;
    type FundingRequests = Rc<RefCell<Vec<(PubkeyScript, u64)>>>;

    struct MockPeer {
        log: Log,
        outbox: Outbox,
    }

    impl PeerWriter for MockPeer {
        fn send_message(
            &mut self,
            message: Messages,
        ) -> Result<(), DriverError> {
            let name = match &message {
                Messages::OpenChannel(_) => "open_channel",
                Messages::AcceptChannel(_) => "accept_channel",
                Messages::FundingCreated(_) => "funding_created",
                Messages::FundingSigned(_) => "funding_signed",
                Messages::FundingLocked(_) => "funding_locked",
                Messages::UpdateAddHtlc(_) => "update_add_htlc",
                Messages::UpdateFulfillHtlc(_) => "update_fulfill_htlc",
                Messages::CommitmentSigned(_) => "commitment_signed",
                Messages::RevokeAndAck(_) => "revoke_and_ack",
                _ => "other",
            };
            self.log.borrow_mut().push(format!("send:{}", name));
            self.outbox.borrow_mut().push(message);
            Ok(())
        }
    }

    struct MockWatcher {
        log: Log,
    }

    impl ChainWatcher for MockWatcher {
        fn watch(&mut self, request: WatchRequest) -> Result<(), DriverError> {
            self.log.borrow_mut().push(format!("watch:{}", request));
            Ok(())
        }

        fn publish_tx(
            &mut self,
            _tx: &Transaction,
        ) -> Result<(), DriverError> {
            self.log.borrow_mut().push(s!("publish_tx"));
            Ok(())
        }
    }

    struct MockWallet {
        log: Log,
        requests: FundingRequests,
    }

    impl FundingWallet for MockWallet {
        fn make_funding_tx(
            &mut self,
            script_pubkey: PubkeyScript,
            amount: u64,
            _feerate_per_kw: u32,
        ) -> Result<(), DriverError> {
            self.log.borrow_mut().push(s!("make_funding_tx"));
            self.requests.borrow_mut().push((script_pubkey, amount));
            Ok(())
        }
    }

    struct MockStore {
        log: Log,
    }

    impl StateStore for MockStore {
        fn store_state(
            &mut self,
            _state: &ChannelState,
        ) -> Result<(), DriverError> {
            self.log.borrow_mut().push(s!("store_state"));
            Ok(())
        }

        fn store_htlc_infos(
            &mut self,
            _htlc_infos: &[HtlcInfo],
        ) -> Result<(), DriverError> {
            self.log.borrow_mut().push(s!("store_htlc_infos"));
            Ok(())
        }
    }

    struct MockObserver {
        log: Log,
    }

    impl ChannelObserver for MockObserver {
        fn channel_id_assigned(
            &mut self,
            _temp_channel_id: TempChannelId,
            channel_id: ChannelId,
        ) {
            self.log
                .borrow_mut()
                .push(format!("channel_id:{}", channel_id));
        }

        fn process_add(&mut self, add: UpdateAddHtlc) {
            self.log
                .borrow_mut()
                .push(format!("process_add:{}", add.htlc_id));
        }

        fn handle_error(&mut self, error: Error) {
            self.log.borrow_mut().push(format!("error:{}", error));
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

    fn driver(
        seed: u8,
        remote_seed: u8,
    ) -> (ChannelDriver, Outbox, FundingRequests, Log) {
        let log: Log = Rc::new(RefCell::new(vec![]));
        let outbox: Outbox = Rc::new(RefCell::new(vec![]));
        let requests: FundingRequests = Rc::new(RefCell::new(vec![]));
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
        let state = ChannelState::WaitForInit(WaitForInit {
            static_params,
            current_tip: ChainTip {
                height: 600_000,
                header: genesis_block(Network::Testnet).header,
            },
        });
        let driver = ChannelDriver::with(
            state,
            Box::new(DumbKeyManager::with(seed)),
            Box::new(FrozenClock(1_600_000_000)),
            Box::new(MockPeer {
                log: log.clone(),
                outbox: outbox.clone(),
            }),
            Box::new(MockWatcher { log: log.clone() }),
            Box::new(MockWallet {
                log: log.clone(),
                requests: requests.clone(),
            }),
            Box::new(MockStore { log: log.clone() }),
            Box::new(MockObserver { log: log.clone() }),
        );
        (driver, outbox, requests, log)
    }

    /// Passes pending peer messages between the two drivers until both
    /// sides go quiet
    fn shuttle(
        funder: &mut ChannelDriver,
        funder_out: &Outbox,
        fundee: &mut ChannelDriver,
        fundee_out: &Outbox,
    ) {
        loop {
            let outgoing: Vec<Messages> =
                funder_out.borrow_mut().drain(..).collect();
            let incoming: Vec<Messages> =
                fundee_out.borrow_mut().drain(..).collect();
            if outgoing.is_empty() && incoming.is_empty() {
                break;
            }
            for message in outgoing {
                fundee.enqueue(Event::MessageReceived(message));
            }
            for message in incoming {
                funder.enqueue(Event::MessageReceived(message));
            }
            fundee.run().unwrap();
            funder.run().unwrap();
        }
    }

    fn index_of(log: &Log, entry: &str) -> usize {
        log.borrow()
            .iter()
            .position(|item| item == entry)
            .unwrap_or_else(|| panic!("no {} in the log", entry))
    }

    #[test]
    fn full_channel_lifecycle() {
        let (mut funder, funder_out, funding_requests, funder_log) =
            driver(0xA1, 0xB2);
        let (mut fundee, fundee_out, _, fundee_log) = driver(0xB2, 0xA1);

        let mut temp = [0u8; 32];
        temp[31] = 1;
        let temp_channel_id = TempChannelId::from(Slice32::from_inner(temp));
        let remote_init = Init::with(FeatureSet::empty());

        fundee.enqueue(Event::InitFundee(InitFundee {
            temp_channel_id,
            local_params: local_params(false),
            remote_init: remote_init.clone(),
        }));
        fundee.run().unwrap();

        funder.enqueue(Event::InitFunder(InitFunder {
            temp_channel_id,
            funding_satoshis: 1_000_000,
            push_msat: 0,
            initial_feerate_per_kw: 2500,
            local_params: local_params(true),
            channel_flags: 0,
            remote_init,
        }));
        funder.run().unwrap();
        shuttle(&mut funder, &funder_out, &mut fundee, &fundee_out);

        // the wallet was asked for the funding transaction
        let (script_pubkey, amount) =
            funding_requests.borrow_mut().remove(0);
        assert_eq!(amount, 1_000_000);
        let funding_tx = Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![],
            output: vec![TxOut {
                value: amount,
                script_pubkey: script_pubkey.into_inner(),
            }],
        };
        funder.enqueue(Event::MakeFundingTxResponse(MakeFundingTxResponse {
            funding_tx: StoredTx::from(funding_tx.clone()),
            funding_tx_output_index: 0,
            fee: 250,
        }));
        funder.run().unwrap();
        shuttle(&mut funder, &funder_out, &mut fundee, &fundee_out);

        // the funding transaction is published only after the state was
        // persisted
        assert!(
            index_of(&funder_log, "store_state")
                < index_of(&funder_log, "publish_tx")
        );

        // the watcher reports the confirmation to both sides
        let confirmation = WatchEvent::Confirmed {
            txid: funding_tx.txid(),
            tx: StoredTx::from(funding_tx),
            block_height: 600_010,
            tx_index: 3,
        };
        funder.enqueue(Event::WatchReceived(confirmation.clone()));
        funder.run().unwrap();
        fundee.enqueue(Event::WatchReceived(confirmation));
        fundee.run().unwrap();
        shuttle(&mut funder, &funder_out, &mut fundee, &fundee_out);

        assert_eq!(funder.state().to_string(), "NORMAL");
        assert_eq!(fundee.state().to_string(), "NORMAL");

        // a payment: CMD_ADD_HTLC with an immediate commitment
        let preimage =
            HashPreimage::from_inner(Slice32::from_inner([7u8; 32]));
        funder.enqueue(Event::ExecuteCommand(Command::AddHtlc(
            CmdAddHtlc {
                amount_msat: 100_000_000,
                payment_hash: preimage_hash(&preimage),
                cltv_expiry: 600_040,
                onion: OnionPacket::dumb_default(),
                commit: true,
            },
        )));
        funder.run().unwrap();
        shuttle(&mut funder, &funder_out, &mut fundee, &fundee_out);

        // CMD_SIGN was re-enqueued by the driver and the state was stored
        // before commitment_signed went out
        assert!(
            index_of(&funder_log, "store_htlc_infos")
                < index_of(&funder_log, "send:commitment_signed")
        );
        assert!(fundee_log
            .borrow()
            .iter()
            .any(|entry| entry == "process_add:0"));

        let funder_commitments = funder.state().commitments().unwrap();
        let fundee_commitments = fundee.state().commitments().unwrap();
        assert_eq!(funder_commitments.local_commit.index, 1);
        assert_eq!(fundee_commitments.local_commit.index, 1);
        assert_eq!(
            fundee_commitments.local_commit.spec.htlcs.len(),
            1
        );

        // the fundee fulfills and the balances settle
        fundee.enqueue(Event::ExecuteCommand(Command::FulfillHtlc(
            CmdFulfillHtlc {
                htlc_id: 0,
                payment_preimage: preimage,
                commit: true,
            },
        )));
        fundee.run().unwrap();
        shuttle(&mut funder, &funder_out, &mut fundee, &fundee_out);

        let funder_commitments = funder.state().commitments().unwrap();
        assert!(funder_commitments.local_commit.spec.htlcs.is_empty());
        assert_eq!(
            funder_commitments.local_commit.spec.to_local_msat,
            900_000_000
        );
        assert_eq!(
            funder_commitments.local_commit.spec.to_remote_msat,
            100_000_000
        );
    }

    #[test]
    fn unhandled_command_is_ignored() {
        let (mut funder, _, _, log) = driver(0xA1, 0xB2);
        // commands are meaningless before the channel is funded
        funder.enqueue(Event::ExecuteCommand(Command::Sign));
        funder.run().unwrap();
        // unhandled events leave no trace but the warning log
        assert!(log.borrow().is_empty());
        assert_eq!(funder.state().to_string(), "WAIT_FOR_INIT");
    }
}
