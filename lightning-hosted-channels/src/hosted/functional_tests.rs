// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Tests driving two full endpoints against each other, first at the state-machine level with
//! hand-shuttled messages, then at the [`ChannelMaster`] level with scripted node interfaces.

use crate::chain::{
	DecodedOnion, ForwardingInfo, HtlcIdentifier, InterceptResolution, PaymentResult,
};
use crate::hosted::channel::{
	ChannelAction, ChannelContext, ChannelStatus, HostedChannel, ERR_OVERRIDDEN,
	ERR_STALE_BLOCKDAY, ERR_TIMED_OUT,
};
use crate::hosted::channelmaster::ChannelMaster;
use crate::hosted::msgs::{PaymentPreimage, StateUpdate};
use crate::hosted::scid;
use crate::hosted::wire::Message;
use crate::util::config::HostedChannelConfig;
use crate::util::test_utils::{
	dummy_onion, dummy_refund_script, test_chain_hash, TestLogger, TestNodeInterface, TestStore,
};

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::{absolute, transaction, BlockHash, OutPoint, ScriptBuf, Sequence, TxIn, Witness};

use std::collections::VecDeque;
use std::sync::Arc;

const TEST_HEIGHT: u32 = 100_000;

// ===== state-machine-level harness =====

struct Endpoint {
	secp: Secp256k1<All>,
	secret: SecretKey,
	id: PublicKey,
	config: HostedChannelConfig,
	chain_hash: BlockHash,
	height: u32,
}

impl Endpoint {
	fn new(seed: u8, config: HostedChannelConfig) -> Self {
		let secp = Secp256k1::new();
		let secret = SecretKey::from_slice(&[seed; 32]).unwrap();
		let id = PublicKey::from_secret_key(&secp, &secret);
		Endpoint { secp, secret, id, config, chain_hash: test_chain_hash(), height: TEST_HEIGHT }
	}

	fn ctx(&self) -> ChannelContext {
		ChannelContext {
			secp: &self.secp,
			node_secret: &self.secret,
			node_id: &self.id,
			config: &self.config,
			chain_hash: self.chain_hash,
			current_height: self.height,
		}
	}
}

fn deliver(chan: &mut HostedChannel, ctx: &ChannelContext, msg: Message) -> Vec<ChannelAction> {
	match msg {
		Message::InvokeHostedChannel(m) => chan.on_invoke(m, ctx),
		Message::InitHostedChannel(m) => chan.on_init(m, ctx),
		Message::LastCrossSignedState(m) => chan.on_lcss(m, ctx),
		Message::StateUpdate(m) => chan.on_state_update(m, ctx),
		Message::StateOverride(m) => chan.on_state_override(m, ctx),
		Message::ResizeChannel(m) => chan.on_resize(m, ctx),
		Message::Error(m) => chan.on_remote_error(m),
		Message::UpdateAddHTLC(m) => chan.on_update_add(m, ctx),
		Message::UpdateFulfillHTLC(m) => chan.on_update_fulfill(m, ctx),
		Message::UpdateFailHTLC(m) => chan.on_update_fail(m, ctx),
		Message::UpdateFailMalformedHTLC(m) => chan.on_update_fail_malformed(m, ctx),
		_ => Vec::new(),
	}
}

fn split_actions(
	actions: Vec<ChannelAction>, queue: &mut VecDeque<Message>, effects: &mut Vec<ChannelAction>,
) {
	for action in actions {
		match action {
			ChannelAction::SendMessage(msg) => queue.push_back(msg),
			other => effects.push(other),
		}
	}
}

/// Shuttles queued messages between the two endpoints until neither has anything left to say.
/// Returns the non-message side effects each endpoint produced.
fn pump(
	host: &mut HostedChannel, host_node: &Endpoint, client: &mut HostedChannel,
	client_node: &Endpoint, host_outbox: Vec<ChannelAction>, client_outbox: Vec<ChannelAction>,
) -> (Vec<ChannelAction>, Vec<ChannelAction>) {
	let mut host_effects = Vec::new();
	let mut client_effects = Vec::new();
	let mut to_client = VecDeque::new();
	let mut to_host = VecDeque::new();
	split_actions(host_outbox, &mut to_client, &mut host_effects);
	split_actions(client_outbox, &mut to_host, &mut client_effects);
	for _ in 0..1000 {
		if let Some(msg) = to_client.pop_front() {
			let actions = deliver(client, &client_node.ctx(), msg);
			split_actions(actions, &mut to_host, &mut client_effects);
		} else if let Some(msg) = to_host.pop_front() {
			let actions = deliver(host, &host_node.ctx(), msg);
			split_actions(actions, &mut to_client, &mut host_effects);
		} else {
			return (host_effects, client_effects);
		}
	}
	panic!("message exchange did not quiesce");
}

fn open_pair(host_node: &Endpoint, client_node: &Endpoint) -> (HostedChannel, HostedChannel) {
	let mut host = HostedChannel::new_inbound(client_node.id, &host_node.ctx());
	let (mut client, invoke) = HostedChannel::new_outbound(
		host_node.id,
		dummy_refund_script(),
		Vec::new(),
		&client_node.ctx(),
	);
	let (host_effects, client_effects) =
		pump(&mut host, host_node, &mut client, client_node, Vec::new(), invoke);
	assert!(host_effects.is_empty());
	assert!(client_effects.is_empty());
	assert_eq!(host.status, ChannelStatus::Active);
	assert_eq!(client.status, ChannelStatus::Active);
	(host, client)
}

fn small_channel_config() -> HostedChannelConfig {
	let mut config = HostedChannelConfig::default();
	config.default_capacity_msat = 1_000_000;
	config.initial_client_balance_msat = 400_000;
	config.max_htlc_value_in_flight_msat = 500_000;
	config
}

fn assert_cross_signed(host: &HostedChannel, client: &HostedChannel, pair: (&Endpoint, &Endpoint)) {
	let (host_node, client_node) = pair;
	let host_lcss = host.lcss().unwrap();
	let client_lcss = client.lcss().unwrap();
	assert!(host_lcss.verify_remote_sig(&host_node.secp, &client_node.id));
	assert!(host_lcss.verify_local_sig(&host_node.secp, &host_node.id));
	assert!(client_lcss.verify_remote_sig(&client_node.secp, &host_node.id));
	assert!(client_lcss.verify_local_sig(&client_node.secp, &client_node.id));
	host_lcss.check_invariants().unwrap();
	client_lcss.check_invariants().unwrap();
	// The two views describe the same state.
	assert_eq!(host_lcss.local_balance_msat, client_lcss.remote_balance_msat);
	assert_eq!(host_lcss.remote_balance_msat, client_lcss.local_balance_msat);
	assert_eq!(host_lcss.local_updates, client_lcss.remote_updates);
	assert_eq!(host_lcss.remote_updates, client_lcss.local_updates);
}

#[test]
fn s1_open_exchange() {
	let host_node = Endpoint::new(2, HostedChannelConfig::default());
	let client_node = Endpoint::new(3, HostedChannelConfig::default());
	let (host, client) = open_pair(&host_node, &client_node);

	let lcss = client.lcss().unwrap();
	assert_eq!(lcss.local_updates, 0);
	assert_eq!(lcss.remote_updates, 0);
	assert_eq!(lcss.block_day, TEST_HEIGHT / 144);
	assert_eq!(lcss.local_balance_msat, 0);
	assert_eq!(lcss.remote_balance_msat, 1_000_000_000);
	assert!(!lcss.is_host);
	assert!(host.lcss().unwrap().is_host);
	assert_cross_signed(&host, &client, (&host_node, &client_node));
	assert_eq!(host.short_channel_id, client.short_channel_id);
	assert_eq!(host.channel_id, client.channel_id);
}

#[test]
fn s2_add_then_fulfill() {
	let host_node = Endpoint::new(2, small_channel_config());
	let client_node = Endpoint::new(3, small_channel_config());
	let (mut host, mut client) = open_pair(&host_node, &client_node);
	assert_eq!(client.lcss().unwrap().local_balance_msat, 400_000);

	let preimage = PaymentPreimage([0x77; 32]);
	let (add, add_actions) = client
		.queue_add_htlc(50_000, preimage.payment_hash(), TEST_HEIGHT + 300, dummy_onion(1), &client_node.ctx())
		.unwrap();
	assert_eq!(add.htlc_id, 0);
	let (host_effects, client_effects) =
		pump(&mut host, &host_node, &mut client, &client_node, Vec::new(), add_actions);
	assert!(client_effects.is_empty());
	// The host sees the freshly committed incoming HTLC and would route it onward.
	assert_eq!(host_effects, vec![ChannelAction::CommittedRemoteAdd(add.clone())]);

	// Escrowed, not yet settled: balances unchanged, one in-flight HTLC on each view.
	assert_eq!(client.lcss().unwrap().local_balance_msat, 400_000);
	assert_eq!(client.lcss().unwrap().outgoing_htlcs.len(), 1);
	assert_eq!(host.lcss().unwrap().incoming_htlcs.len(), 1);
	assert_cross_signed(&host, &client, (&host_node, &client_node));

	let fulfill_actions = host.queue_fulfill_htlc(0, preimage, &host_node.ctx());
	let (host_effects, client_effects) =
		pump(&mut host, &host_node, &mut client, &client_node, fulfill_actions, Vec::new());
	assert!(host_effects.is_empty());
	// The client learns the preimage and resolves its outgoing HTLC.
	assert_eq!(client_effects.len(), 2);
	assert_eq!(client_effects[0], ChannelAction::PreimageLearned(preimage));
	match &client_effects[1] {
		ChannelAction::OutgoingResolved { htlc, result } => {
			assert_eq!(htlc.htlc_id, 0);
			assert_eq!(*result, PaymentResult::Fulfilled(preimage));
		},
		other => panic!("unexpected action {:?}", other),
	}

	let lcss = client.lcss().unwrap();
	assert_eq!(lcss.local_balance_msat, 350_000);
	assert_eq!(lcss.remote_balance_msat, 650_000);
	assert!(lcss.incoming_htlcs.is_empty() && lcss.outgoing_htlcs.is_empty());
	assert_eq!(lcss.local_updates, 1);
	assert_eq!(lcss.remote_updates, 1);
	assert_cross_signed(&host, &client, (&host_node, &client_node));
}

#[test]
fn s3_stale_blockday_suspends() {
	let host_node = Endpoint::new(2, HostedChannelConfig::default());
	let client_node = Endpoint::new(3, HostedChannelConfig::default());
	let (mut host, _client) = open_pair(&host_node, &client_node);

	let stale = StateUpdate {
		block_day: TEST_HEIGHT / 144 - 2,
		local_updates: 0,
		remote_updates: 0,
		local_sig_of_remote_lcss: host.lcss().unwrap().local_sig_of_remote,
	};
	let actions = host.on_state_update(stale, &host_node.ctx());
	assert_eq!(host.status, ChannelStatus::Suspended);
	match &actions[..] {
		[ChannelAction::SendMessage(Message::Error(err))] => {
			assert_eq!(err.data, ERR_STALE_BLOCKDAY);
		},
		other => panic!("unexpected actions {:?}", other),
	}
	assert_eq!(host.data.as_ref().unwrap().local_errors.len(), 1);
}

#[test]
fn s4_resize_grows_host_side() {
	let mut config = HostedChannelConfig::default();
	config.default_capacity_msat = 500_000_000;
	let host_node = Endpoint::new(2, config.clone());
	let client_node = Endpoint::new(3, config);
	let (mut host, mut client) = open_pair(&host_node, &client_node);
	let host_balance_before = host.lcss().unwrap().local_balance_msat;

	let resize_actions = client.start_resize(1_000_000, &client_node.ctx()).unwrap();
	let (host_effects, client_effects) =
		pump(&mut host, &host_node, &mut client, &client_node, Vec::new(), resize_actions);
	assert!(host_effects.is_empty() && client_effects.is_empty());

	for lcss in [host.lcss().unwrap(), client.lcss().unwrap()] {
		assert_eq!(lcss.init_hosted_channel.channel_capacity_msat, 1_000_000_000);
	}
	assert_eq!(host.lcss().unwrap().local_balance_msat, host_balance_before + 500_000_000);
	assert!(host.data.as_ref().unwrap().pending_resize.is_none());
	assert!(client.data.as_ref().unwrap().pending_resize.is_none());
	assert_cross_signed(&host, &client, (&host_node, &client_node));
}

#[test]
fn s6_override_clears_in_flight() {
	let host_node = Endpoint::new(2, small_channel_config());
	let client_node = Endpoint::new(3, small_channel_config());
	let (mut host, mut client) = open_pair(&host_node, &client_node);

	// Two in-flight client-offered HTLCs.
	for (amount, fill) in [(50_000u64, 0x51u8), (60_000, 0x52)] {
		let preimage = PaymentPreimage([fill; 32]);
		let (_add, actions) = client
			.queue_add_htlc(amount, preimage.payment_hash(), TEST_HEIGHT + 300, dummy_onion(fill), &client_node.ctx())
			.unwrap();
		pump(&mut host, &host_node, &mut client, &client_node, Vec::new(), actions);
	}
	assert_eq!(host.lcss().unwrap().incoming_htlcs.len(), 2);

	// Break the channel.
	let error_actions = host.on_decode_error();
	let (_host_effects, _client_effects) =
		pump(&mut host, &host_node, &mut client, &client_node, error_actions, Vec::new());
	assert_eq!(host.status, ChannelStatus::Suspended);
	assert_eq!(client.status, ChannelStatus::Suspended);

	// Host proposes, client accepts, host completes.
	let proposal_actions = host.start_override(700_000, &host_node.ctx()).unwrap();
	assert_eq!(host.status, ChannelStatus::Overriding);
	let (_host_effects, client_effects) =
		pump(&mut host, &host_node, &mut client, &client_node, proposal_actions, Vec::new());
	assert!(client_effects.is_empty());
	assert!(client.pending_override.is_some());

	let accept_actions = client.accept_override(&client_node.ctx()).unwrap();
	// The client's two outgoing HTLCs die with the override and must fail upstream.
	let (resolutions, sends): (Vec<ChannelAction>, Vec<ChannelAction>) = accept_actions
		.into_iter()
		.partition(|action| matches!(action, ChannelAction::OutgoingResolved { .. }));
	assert_eq!(resolutions.len(), 2);
	for action in resolutions {
		match action {
			ChannelAction::OutgoingResolved { result, .. } => {
				assert_eq!(result, PaymentResult::Failed(ERR_OVERRIDDEN.as_bytes().to_vec()));
			},
			_ => unreachable!(),
		}
	}
	let (host_effects, client_effects) =
		pump(&mut host, &host_node, &mut client, &client_node, Vec::new(), sends);
	assert!(host_effects.is_empty() && client_effects.is_empty());

	assert_eq!(host.status, ChannelStatus::Active);
	assert_eq!(client.status, ChannelStatus::Active);
	let lcss = host.lcss().unwrap();
	assert_eq!(lcss.local_balance_msat, 700_000);
	assert_eq!(lcss.remote_balance_msat, 300_000);
	assert!(lcss.incoming_htlcs.is_empty() && lcss.outgoing_htlcs.is_empty());
	assert!(host.data.as_ref().unwrap().local_errors.is_empty());
	assert!(client.data.as_ref().unwrap().remote_errors.is_empty());
	assert_cross_signed(&host, &client, (&host_node, &client_node));
}

#[test]
fn reconnect_syncs_both_copies() {
	let host_node = Endpoint::new(2, small_channel_config());
	let client_node = Endpoint::new(3, small_channel_config());
	let (mut host, mut client) = open_pair(&host_node, &client_node);

	// Move the state forward once.
	let preimage = PaymentPreimage([0x61; 32]);
	let (_, actions) = client
		.queue_add_htlc(10_000, preimage.payment_hash(), TEST_HEIGHT + 300, dummy_onion(2), &client_node.ctx())
		.unwrap();
	pump(&mut host, &host_node, &mut client, &client_node, Vec::new(), actions);
	let fulfill_actions = host.queue_fulfill_htlc(0, preimage, &host_node.ctx());
	pump(&mut host, &host_node, &mut client, &client_node, fulfill_actions, Vec::new());
	let settled = client.lcss().unwrap().clone();

	host.peer_disconnected();
	client.peer_disconnected();
	assert_eq!(host.status, ChannelStatus::Offline);
	assert_eq!(client.status, ChannelStatus::Offline);

	let reconnect = client.peer_connected(&client_node.ctx());
	assert_eq!(client.status, ChannelStatus::SyncingData);
	let (host_effects, client_effects) =
		pump(&mut host, &host_node, &mut client, &client_node, Vec::new(), reconnect);
	assert!(host_effects.is_empty() && client_effects.is_empty());
	assert_eq!(host.status, ChannelStatus::Active);
	assert_eq!(client.status, ChannelStatus::Active);
	assert_eq!(client.lcss().unwrap(), &settled);
}

#[test]
fn reconnect_adopts_newer_remote_state() {
	let host_node = Endpoint::new(2, small_channel_config());
	let client_node = Endpoint::new(3, small_channel_config());
	let (mut host, mut client) = open_pair(&host_node, &client_node);

	// Snapshot the client before it learns about a settled payment, then replay the exchange.
	let stale_data = client.data.clone().unwrap();
	let preimage = PaymentPreimage([0x62; 32]);
	let (_, actions) = client
		.queue_add_htlc(10_000, preimage.payment_hash(), TEST_HEIGHT + 300, dummy_onion(3), &client_node.ctx())
		.unwrap();
	pump(&mut host, &host_node, &mut client, &client_node, Vec::new(), actions);
	let fulfill_actions = host.queue_fulfill_htlc(0, preimage, &host_node.ctx());
	pump(&mut host, &host_node, &mut client, &client_node, fulfill_actions, Vec::new());
	let settled = client.lcss().unwrap().clone();

	// A client that lost its disk comes back with the stale state and adopts the host's.
	let mut amnesiac =
		HostedChannel::from_data(host_node.id, stale_data, &client_node.ctx());
	host.peer_disconnected();
	let reconnect = amnesiac.peer_connected(&client_node.ctx());
	let (host_effects, client_effects) =
		pump(&mut host, &host_node, &mut amnesiac, &client_node, Vec::new(), reconnect);
	assert!(host_effects.is_empty() && client_effects.is_empty());
	assert_eq!(amnesiac.status, ChannelStatus::Active);
	assert_eq!(amnesiac.lcss().unwrap(), &settled);
}

#[test]
fn concurrent_adds_reconcile() {
	let host_node = Endpoint::new(2, small_channel_config());
	let client_node = Endpoint::new(3, small_channel_config());
	let (mut host, mut client) = open_pair(&host_node, &client_node);

	// Both sides propose before seeing each other's proposal.
	let client_preimage = PaymentPreimage([0x71; 32]);
	let host_preimage = PaymentPreimage([0x72; 32]);
	let (_, client_actions) = client
		.queue_add_htlc(20_000, client_preimage.payment_hash(), TEST_HEIGHT + 300, dummy_onion(4), &client_node.ctx())
		.unwrap();
	let (_, host_actions) = host
		.queue_add_htlc(30_000, host_preimage.payment_hash(), TEST_HEIGHT + 300, dummy_onion(5), &host_node.ctx())
		.unwrap();
	let (host_effects, client_effects) =
		pump(&mut host, &host_node, &mut client, &client_node, host_actions, client_actions);

	// Each side ends up seeing the other's HTLC committed.
	assert_eq!(host_effects.len(), 1);
	assert_eq!(client_effects.len(), 1);
	let lcss = host.lcss().unwrap();
	assert_eq!(lcss.incoming_htlcs.len(), 1);
	assert_eq!(lcss.outgoing_htlcs.len(), 1);
	assert_eq!(lcss.local_updates, 1);
	assert_eq!(lcss.remote_updates, 1);
	assert_cross_signed(&host, &client, (&host_node, &client_node));
}

#[test]
fn persistent_counter_mismatch_suspends() {
	let host_node = Endpoint::new(2, HostedChannelConfig::default());
	let client_node = Endpoint::new(3, HostedChannelConfig::default());
	let (mut host, _client) = open_pair(&host_node, &client_node);

	let sig = host.lcss().unwrap().local_sig_of_remote;
	for attempt in 0..4 {
		let bogus = StateUpdate {
			block_day: TEST_HEIGHT / 144,
			local_updates: 5,
			remote_updates: 7,
			local_sig_of_remote_lcss: sig,
		};
		let actions = host.on_state_update(bogus, &host_node.ctx());
		if attempt < 3 {
			assert_eq!(host.status, ChannelStatus::Active, "attempt {}", attempt);
		} else {
			assert_eq!(host.status, ChannelStatus::Suspended);
			match &actions[..] {
				[ChannelAction::SendMessage(Message::Error(err))] => {
					assert_eq!(err.data, "state update counter mismatch");
				},
				other => panic!("unexpected actions {:?}", other),
			}
		}
	}
}

#[test]
fn bad_signature_suspends() {
	let host_node = Endpoint::new(2, small_channel_config());
	let client_node = Endpoint::new(3, small_channel_config());
	let (mut host, mut client) = open_pair(&host_node, &client_node);

	// A well-formed add followed by a state update signed with the wrong key.
	let preimage = PaymentPreimage([0x73; 32]);
	let (add, _actions) = client
		.queue_add_htlc(10_000, preimage.payment_hash(), TEST_HEIGHT + 300, dummy_onion(6), &client_node.ctx())
		.unwrap();
	host.on_update_add(add, &host_node.ctx());
	let rogue_key = SecretKey::from_slice(&[99; 32]).unwrap();
	let forged = StateUpdate {
		block_day: TEST_HEIGHT / 144,
		local_updates: 1,
		remote_updates: 0,
		local_sig_of_remote_lcss: host_node
			.secp
			.sign_ecdsa(&bitcoin::secp256k1::Message::from_digest([7; 32]), &rogue_key),
	};
	let actions = host.on_state_update(forged, &host_node.ctx());
	assert_eq!(host.status, ChannelStatus::Suspended);
	match &actions[..] {
		[ChannelAction::SendMessage(Message::Error(err))] => {
			assert_eq!(err.data, "invalid state update signature");
		},
		other => panic!("unexpected actions {:?}", other),
	}
}

#[test]
fn add_validation_rejects_overdraw() {
	let host_node = Endpoint::new(2, small_channel_config());
	let client_node = Endpoint::new(3, small_channel_config());
	let (_host, mut client) = open_pair(&host_node, &client_node);

	let hash = PaymentPreimage([0x74; 32]).payment_hash();
	assert_eq!(
		client.queue_add_htlc(500, hash, TEST_HEIGHT + 300, dummy_onion(7), &client_node.ctx()),
		Err("amount below htlc minimum")
	);
	assert_eq!(
		client
			.queue_add_htlc(400_001, hash, TEST_HEIGHT + 300, dummy_onion(7), &client_node.ctx())
			.err(),
		Some("insufficient balance")
	);
	assert_eq!(
		client.queue_add_htlc(10_000, hash, TEST_HEIGHT, dummy_onion(7), &client_node.ctx()).err(),
		Some("htlc already expired")
	);
}

#[test]
fn cltv_timeout_suspends_and_fails_upstream() {
	let host_node = Endpoint::new(2, small_channel_config());
	let client_node = Endpoint::new(3, small_channel_config());
	let (mut host, mut client) = open_pair(&host_node, &client_node);

	let preimage = PaymentPreimage([0x75; 32]);
	let (_, actions) = client
		.queue_add_htlc(10_000, preimage.payment_hash(), TEST_HEIGHT + 100, dummy_onion(8), &client_node.ctx())
		.unwrap();
	pump(&mut host, &host_node, &mut client, &client_node, Vec::new(), actions);

	// 100 blocks out with a 72 block safety delta: 29 more blocks and it is too close.
	let mut later = Endpoint::new(3, small_channel_config());
	later.height = TEST_HEIGHT + 29;
	let actions = client.on_block_updated(&later.ctx());
	assert_eq!(client.status, ChannelStatus::Suspended);
	let mut saw_error = false;
	let mut saw_failure = false;
	for action in actions {
		match action {
			ChannelAction::SendMessage(Message::Error(err)) => {
				assert_eq!(err.data, ERR_TIMED_OUT);
				saw_error = true;
			},
			ChannelAction::OutgoingResolved { result, .. } => {
				assert_eq!(result, PaymentResult::Failed(ERR_TIMED_OUT.as_bytes().to_vec()));
				saw_failure = true;
			},
			other => panic!("unexpected action {:?}", other),
		}
	}
	assert!(saw_error && saw_failure);
}

// ===== master-level harness =====

struct Peer {
	node: Arc<TestNodeInterface>,
	store: Arc<TestStore>,
	logger: Arc<TestLogger>,
	master: ChannelMaster<Arc<TestStore>, Arc<TestNodeInterface>, Arc<TestLogger>>,
}

impl Peer {
	fn new(seed: u8, config: HostedChannelConfig) -> Self {
		let node = Arc::new(TestNodeInterface::new(seed, TEST_HEIGHT));
		let store = Arc::new(TestStore::new());
		let logger = Arc::new(TestLogger::new());
		let master = ChannelMaster::new(
			Arc::clone(&node),
			Arc::clone(&store),
			Arc::clone(&logger),
			config,
		)
		.unwrap();
		Peer { node, store, logger, master }
	}

	fn id(&self) -> PublicKey {
		self.node.node_public_key
	}

	/// Restarts the plugin against the same node and database, as after a crash.
	fn restart(self) -> Self {
		let master = ChannelMaster::new(
			Arc::clone(&self.node),
			Arc::clone(&self.store),
			Arc::clone(&self.logger),
			HostedChannelConfig::default(),
		)
		.unwrap();
		Peer { node: self.node, store: self.store, logger: self.logger, master }
	}
}

fn shuttle(a: &Peer, b: &Peer) {
	for _ in 0..1000 {
		let from_a = a.node.drain_sent();
		let from_b = b.node.drain_sent();
		if from_a.is_empty() && from_b.is_empty() {
			return;
		}
		for (target, tag, payload) in from_a {
			assert_eq!(target, b.id());
			b.master.handle_custom_message(a.id(), tag, &payload);
		}
		for (target, tag, payload) in from_b {
			assert_eq!(target, a.id());
			a.master.handle_custom_message(b.id(), tag, &payload);
		}
	}
	panic!("masters did not quiesce");
}

fn open_masters() -> (Peer, Peer) {
	let host = Peer::new(20, HostedChannelConfig::default());
	let client = Peer::new(21, HostedChannelConfig::default());
	host.master.peer_connected(client.id());
	client.master.peer_connected(host.id());
	client.master.invoke_channel(host.id(), dummy_refund_script(), Vec::new()).unwrap();
	shuttle(&host, &client);
	assert_eq!(host.master.channel_json(&client.id()).unwrap()["status"], "active");
	assert_eq!(client.master.channel_json(&host.id()).unwrap()["status"], "active");
	(host, client)
}

#[test]
fn master_open_and_project_json() {
	let (host, client) = open_masters();
	let json = host.master.channel_json(&client.id()).unwrap();
	assert_eq!(json["is_host"], true);
	assert_eq!(json["capacity_msat"], 1_000_000_000u64);
	assert_eq!(json["local_balance_msat"], 1_000_000_000u64);
	assert_eq!(json["remote_balance_msat"], 0u64);
	assert_eq!(host.master.list_channels_json().len(), 1);
	host.logger.assert_log_contains("is active");
	client.logger.assert_log_contains("is active");
}

/// Sets up an intercepted payment forwarded into the hosted channel and committed on both sides.
/// Returns the node-side incoming leg, the hosted leg the client received, and the preimage.
fn forward_intercepted_payment(
	host: &Peer, client: &Peer,
) -> (HtlcIdentifier, HtlcIdentifier, PaymentPreimage) {
	let preimage = PaymentPreimage([0x55; 32]);
	let payment_hash = preimage.payment_hash();
	let hosted_scid = scid::hosted_short_channel_id(&host.id(), &client.id());
	let node_leg = HtlcIdentifier { short_channel_id: 9_999, htlc_id: 1 };

	host.node.set_route(
		payment_hash,
		DecodedOnion::Forward(ForwardingInfo {
			next_short_channel_id: hosted_scid,
			amount_to_forward_msat: 50_000,
			outgoing_cltv: TEST_HEIGHT + 200,
			next_onion: dummy_onion(9),
		}),
	);
	client.node.set_route(payment_hash, DecodedOnion::Receive);

	host.master.htlc_intercepted(node_leg, payment_hash, 51_000, TEST_HEIGHT + 250, dummy_onion(10));
	shuttle(host, client);

	// The client-side node was asked whether it wants the payment.
	let received = client.node.received_htlcs.lock().unwrap().clone();
	assert_eq!(received.len(), 1);
	let (hosted_leg, received_hash, amount) = received[0];
	assert_eq!(received_hash, payment_hash);
	assert_eq!(amount, 50_000);
	assert_eq!(hosted_leg.short_channel_id, hosted_scid);
	(node_leg, hosted_leg, preimage)
}

#[test]
fn master_forwards_intercepted_htlc_to_client_and_back() {
	let (host, client) = open_masters();
	let (node_leg, hosted_leg, preimage) = forward_intercepted_payment(&host, &client);

	// The client node claims the invoice; the fulfill flows back and settles the interception.
	client.master.node_payment_result(hosted_leg, PaymentResult::Fulfilled(preimage));
	shuttle(&host, &client);

	let resolutions = host.node.intercept_resolutions.lock().unwrap().clone();
	assert_eq!(resolutions, vec![(node_leg, InterceptResolution::Fulfill(preimage))]);
	let json = client.master.channel_json(&host.id()).unwrap();
	assert_eq!(json["local_balance_msat"], 50_000u64);
	assert_eq!(json["incoming_htlcs"].as_array().unwrap().len(), 0);
}

#[test]
fn master_restart_replays_without_double_spend() {
	let (host, client) = open_masters();
	let (node_leg, hosted_leg, preimage) = forward_intercepted_payment(&host, &client);

	// Host dies with the add committed but unresolved, and comes back.
	let host = host.restart();
	client.master.peer_disconnected(host.id());
	host.master.peer_connected(client.id());
	client.master.peer_connected(host.id());
	shuttle(&host, &client);
	assert_eq!(host.master.channel_json(&client.id()).unwrap()["status"], "active");

	// The node re-delivers the same interception; nothing new may be proposed.
	host.master.htlc_intercepted(
		node_leg,
		preimage.payment_hash(),
		51_000,
		TEST_HEIGHT + 250,
		dummy_onion(10),
	);
	let new_adds: Vec<_> = host
		.node
		.drain_sent()
		.into_iter()
		.filter(|(_, tag, _)| *tag == 65511)
		.collect();
	assert!(new_adds.is_empty(), "restart re-proposed an already-forwarded htlc");
	assert_eq!(
		host.master.channel_json(&client.id()).unwrap()["outgoing_htlcs"]
			.as_array()
			.unwrap()
			.len(),
		1
	);

	// The payment still completes after the restart.
	client.master.node_payment_result(hosted_leg, PaymentResult::Fulfilled(preimage));
	shuttle(&host, &client);
	let resolutions = host.node.intercept_resolutions.lock().unwrap().clone();
	assert_eq!(resolutions, vec![(node_leg, InterceptResolution::Fulfill(preimage))]);
}

fn block_with_witness_item(item: Vec<u8>) -> bitcoin::Block {
	bitcoin::Block {
		header: bitcoin::block::Header {
			version: bitcoin::block::Version::ONE,
			prev_blockhash: BlockHash::all_zeros(),
			merkle_root: bitcoin::TxMerkleNode::all_zeros(),
			time: 0,
			bits: bitcoin::CompactTarget::from_consensus(0x1d00ffff),
			nonce: 0,
		},
		txdata: vec![bitcoin::Transaction {
			version: transaction::Version::TWO,
			lock_time: absolute::LockTime::ZERO,
			input: vec![TxIn {
				previous_output: OutPoint::null(),
				script_sig: ScriptBuf::new(),
				sequence: Sequence::MAX,
				witness: Witness::from_slice(&[item]),
			}],
			output: Vec::new(),
		}],
	}
}

#[test]
fn master_catches_preimage_on_chain() {
	let (host, client) = open_masters();
	let (node_leg, _hosted_leg, preimage) = forward_intercepted_payment(&host, &client);

	// The client goes silent, but someone (the client, downstream of it, whoever) claims the
	// payment on chain, revealing the preimage in a witness.
	host.node
		.blocks
		.lock()
		.unwrap()
		.insert(TEST_HEIGHT + 1, block_with_witness_item(preimage.0.to_vec()));
	host.node.set_height(TEST_HEIGHT + 1);
	host.master.timer_tick();

	let resolutions = host.node.intercept_resolutions.lock().unwrap().clone();
	assert_eq!(resolutions, vec![(node_leg, InterceptResolution::Fulfill(preimage))]);
	host.logger.assert_log_contains("Caught on-chain preimage");
	// The preimage is durable: a restarted master still knows it.
	let host = host.restart();
	host.master.htlc_intercepted(
		HtlcIdentifier { short_channel_id: 9_999, htlc_id: 2 },
		preimage.payment_hash(),
		51_000,
		TEST_HEIGHT + 250,
		dummy_onion(10),
	);
	let resolutions = host.node.intercept_resolutions.lock().unwrap().clone();
	assert_eq!(
		resolutions.last().unwrap(),
		&(
			HtlcIdentifier { short_channel_id: 9_999, htlc_id: 2 },
			InterceptResolution::Fulfill(preimage)
		)
	);
}

#[test]
fn master_times_out_stuck_outgoing_htlc() {
	let (host, client) = open_masters();
	let (node_leg, _hosted_leg, _preimage) = forward_intercepted_payment(&host, &client);

	// Creep up to the safety delta without a resolution in sight.
	host.node.set_height(TEST_HEIGHT + 150);
	host.master.timer_tick();

	assert_eq!(host.master.channel_json(&client.id()).unwrap()["status"], "suspended");
	let resolutions = host.node.intercept_resolutions.lock().unwrap().clone();
	assert_eq!(resolutions.len(), 1);
	match &resolutions[0] {
		(leg, InterceptResolution::Fail(_)) => assert_eq!(leg, &node_leg),
		other => panic!("unexpected resolution {:?}", other),
	}
}

#[test]
fn control_api_round_trip() {
	let (host, client) = open_masters();
	let list = crate::control::handle_request(&host.master, "hc-list", &serde_json::json!({}))
		.unwrap();
	assert_eq!(list.as_array().unwrap().len(), 1);

	let params = serde_json::json!({ "peer_node_id": format!("{}", client.id()) });
	let single = crate::control::handle_request(&host.master, "hc-channel", &params).unwrap();
	assert_eq!(single["status"], "active");

	let err = crate::control::handle_request(&host.master, "hc-nonsense", &params).unwrap_err();
	assert!(format!("{}", err).contains("unknown method"));

	crate::control::handle_request(&host.master, "hc-close", &params).unwrap();
	assert!(host.master.channel_json(&client.id()).is_none());
	let _ = client;
}
