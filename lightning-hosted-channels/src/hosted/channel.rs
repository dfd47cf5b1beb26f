// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The per-peer hosted-channel state machine.
//!
//! A `HostedChannel` tracks one peer's channel through its whole life: opening (invoke/init
//! exchange), normal operation (HTLC updates reconciled into fresh [`LastCrossSignedState`]s),
//! re-establishment after disconnects, suspension on any protocol violation, and the host-forced
//! [`StateOverride`] recovery path.
//!
//! Nothing here touches the node, the database or other channels. Every entry point mutates the
//! machine and returns a list of `ChannelAction`s for the [`ChannelMaster`] to carry out, which
//! keeps the protocol logic deterministic and directly testable.
//!
//! [`ChannelMaster`]: crate::hosted::channelmaster::ChannelMaster

use crate::chain::PaymentResult;
use crate::hosted::msgs::{
	ChannelId, ErrorMessage, InitHostedChannel, LastCrossSignedState, PaymentPreimage,
	ResizeChannel, StateOverride, StateUpdate, UpdateAddHTLC, UpdateFailHTLC,
	UpdateFailMalformedHTLC, UpdateFulfillHTLC,
};
use crate::hosted::scid;
use crate::hosted::wire::Message;
use crate::util::config::HostedChannelConfig;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::{BlockHash, ScriptBuf};

/// Everything about a channel which survives a restart.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelData {
	/// The latest fully cross-signed state, from our point of view.
	pub last_cross_signed_state: LastCrossSignedState,
	/// Errors we sent to the peer. Non-empty means the channel is suspended.
	pub local_errors: Vec<ErrorMessage>,
	/// Errors the peer sent us. Non-empty means the channel is suspended.
	pub remote_errors: Vec<ErrorMessage>,
	/// A refund script a suspended client asked to switch to, recorded for the operator to act
	/// on when negotiating a recovery.
	pub pending_refund_script: Option<ScriptBuf>,
	/// A client-signed resize waiting to be folded into the next cross-signed state.
	pub pending_resize: Option<ResizeChannel>,
}

impl_writeable!(ChannelData, {
	last_cross_signed_state,
	local_errors,
	remote_errors,
	pending_refund_script,
	pending_resize
});

/// The coarse lifecycle phase of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
	/// Peer disconnected, nothing in flight on the wire.
	Offline,
	/// Invoke/init exchange under way, no cross-signed state exists yet.
	Opening,
	/// Reconnected with an existing cross-signed state, comparing copies with the peer.
	SyncingData,
	/// Fully operational.
	Active,
	/// A protocol error was recorded (by us or the peer); all updates are refused until an
	/// override or a close.
	Suspended,
	/// We (as host) proposed a [`StateOverride`] and await the client's countersignature.
	Overriding,
}

impl ChannelStatus {
	/// A lowercase human label, stable for the control API.
	pub fn as_str(&self) -> &'static str {
		match self {
			ChannelStatus::Offline => "offline",
			ChannelStatus::Opening => "opening",
			ChannelStatus::SyncingData => "syncing",
			ChannelStatus::Active => "active",
			ChannelStatus::Suspended => "suspended",
			ChannelStatus::Overriding => "overriding",
		}
	}
}

/// Which side proposed an uncommitted update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UpdateOrigin {
	Local,
	Remote,
}

/// One proposed-but-not-yet-cross-signed channel update.
#[derive(Clone, Debug, PartialEq)]
enum UpdateMsg {
	Add(UpdateAddHTLC),
	Fulfill(UpdateFulfillHTLC),
	Fail(UpdateFailHTLC),
	FailMalformed(UpdateFailMalformedHTLC),
}

#[derive(Clone, Debug, PartialEq)]
struct UncommittedUpdate {
	origin: UpdateOrigin,
	msg: UpdateMsg,
}

/// Work the state machine asks [`ChannelMaster`] to carry out.
///
/// Ordering matters: the master persists the channel record before executing any
/// [`ChannelAction::SendMessage`], so a crash can never leave us having attested to a state we
/// did not store.
///
/// [`ChannelMaster`]: crate::hosted::channelmaster::ChannelMaster
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ChannelAction {
	/// Send this message to the channel's peer.
	SendMessage(Message),
	/// A preimage became known (from a peer fulfill, committed or not). Must be persisted before
	/// anything is sent, so a crash cannot lose our proof of payment.
	PreimageLearned(PaymentPreimage),
	/// A peer-origin `update_add_htlc` is now cross-signed; route it onward.
	CommittedRemoteAdd(UpdateAddHTLC),
	/// One of our outgoing HTLCs reached a terminal state; settle the upstream leg.
	OutgoingResolved {
		/// The outgoing HTLC as it was proposed on this channel.
		htlc: UpdateAddHTLC,
		/// How it ended.
		result: PaymentResult,
	},
}

/// Phase-specific scratch state while a channel has no cross-signed state yet.
#[derive(Clone, Debug)]
struct OpeningState {
	refund_script_pubkey: ScriptBuf,
	/// Set once terms are known (immediately for hosts, on `init_hosted_channel` for clients).
	init: Option<InitHostedChannel>,
}

/// Bundled references the master passes into every state-machine call.
pub(crate) struct ChannelContext<'a> {
	pub secp: &'a Secp256k1<All>,
	pub node_secret: &'a SecretKey,
	pub node_id: &'a PublicKey,
	pub config: &'a HostedChannelConfig,
	pub chain_hash: BlockHash,
	pub current_height: u32,
}

impl ChannelContext<'_> {
	pub fn block_day(&self) -> u32 {
		self.current_height / 144
	}
}

/// How far apart two block days may be before a signed state is considered stale.
const MAX_BLOCK_DAY_SKEW: i64 = 1;

pub(crate) const ERR_STALE_BLOCKDAY: &str = "blockday too stale";
pub(crate) const ERR_COUNTER_MISMATCH: &str = "state update counter mismatch";
pub(crate) const ERR_OVERRIDDEN: &str = "channel overridden";
pub(crate) const ERR_TIMED_OUT: &str = "outgoing htlc timed out";
pub(crate) const ERR_SUSPENDED: &str = "channel suspended";

/// The per-peer state machine. Owned and driven exclusively by the master; holds no references
/// back (the master is the owner-plus-index side of the cycle).
pub(crate) struct HostedChannel {
	pub peer_node_id: PublicKey,
	pub short_channel_id: u64,
	pub channel_id: ChannelId,
	pub is_host: bool,
	pub status: ChannelStatus,
	/// `None` until the first cross-signed state exists.
	pub data: Option<ChannelData>,
	opening: Option<OpeningState>,
	uncommitted_updates: Vec<UncommittedUpdate>,
	next_local_htlc_id: u64,
	/// Counters of the last `StateUpdate` we sent, to avoid replying to our own echo.
	last_sent_state_update: Option<(u32, u32)>,
	reconcile_attempts: u8,
	/// On the host side: the override we proposed. On the client side: the one received, parked
	/// until the operator accepts it.
	pub pending_override: Option<StateOverride>,
}

impl HostedChannel {
	fn new(peer_node_id: PublicKey, our_node_id: &PublicKey, is_host: bool) -> Self {
		HostedChannel {
			peer_node_id,
			short_channel_id: scid::hosted_short_channel_id(our_node_id, &peer_node_id),
			channel_id: scid::hosted_channel_id(our_node_id, &peer_node_id),
			is_host,
			status: ChannelStatus::Offline,
			data: None,
			opening: None,
			uncommitted_updates: Vec::new(),
			next_local_htlc_id: 0,
			last_sent_state_update: None,
			reconcile_attempts: 0,
			pending_override: None,
		}
	}

	/// Builds a channel back up from its persisted record.
	pub fn from_data(peer_node_id: PublicKey, data: ChannelData, ctx: &ChannelContext) -> Self {
		let mut chan = Self::new(peer_node_id, ctx.node_id, data.last_cross_signed_state.is_host);
		chan.status = if data.local_errors.is_empty() && data.remote_errors.is_empty() {
			ChannelStatus::Offline
		} else {
			ChannelStatus::Suspended
		};
		chan.next_local_htlc_id = data
			.last_cross_signed_state
			.outgoing_htlcs
			.iter()
			.map(|htlc| htlc.htlc_id + 1)
			.max()
			.unwrap_or(0);
		chan.data = Some(data);
		chan
	}

	/// Starts a fresh client-side channel toward a host, producing the invoke to send.
	pub fn new_outbound(
		peer_node_id: PublicKey, refund_script_pubkey: ScriptBuf, secret: Vec<u8>,
		ctx: &ChannelContext,
	) -> (Self, Vec<ChannelAction>) {
		let mut chan = Self::new(peer_node_id, ctx.node_id, false);
		chan.status = ChannelStatus::Opening;
		chan.opening =
			Some(OpeningState { refund_script_pubkey: refund_script_pubkey.clone(), init: None });
		let invoke = crate::hosted::msgs::InvokeHostedChannel {
			chain_hash: ctx.chain_hash,
			refund_script_pubkey,
			secret,
		};
		(chan, vec![ChannelAction::SendMessage(Message::InvokeHostedChannel(invoke))])
	}

	/// Starts a host-side channel for a peer whose first `invoke_hosted_channel` just arrived.
	pub fn new_inbound(peer_node_id: PublicKey, ctx: &ChannelContext) -> Self {
		Self::new(peer_node_id, ctx.node_id, true)
	}

	pub fn lcss(&self) -> Option<&LastCrossSignedState> {
		self.data.as_ref().map(|data| &data.last_cross_signed_state)
	}

	/// Committed outgoing HTLCs plus our not-yet-signed proposals, i.e. everything the preimage
	/// catcher and the timeout scan must watch.
	pub fn outgoing_in_flight(&self) -> Vec<UpdateAddHTLC> {
		let mut htlcs: Vec<UpdateAddHTLC> = match self.data.as_ref() {
			Some(data) => data.last_cross_signed_state.outgoing_htlcs.clone(),
			None => Vec::new(),
		};
		for update in self.uncommitted_updates.iter() {
			if let UncommittedUpdate { origin: UpdateOrigin::Local, msg: UpdateMsg::Add(add) } =
				update
			{
				htlcs.push(add.clone());
			}
		}
		htlcs
	}

	pub fn incoming_in_flight(&self) -> Vec<UpdateAddHTLC> {
		match self.data.as_ref() {
			Some(data) => data.last_cross_signed_state.incoming_htlcs.clone(),
			None => Vec::new(),
		}
	}

	// ===== connection lifecycle =====

	/// The peer (re)connected. Clients re-invoke; suspended channels replay their error.
	pub fn peer_connected(&mut self, ctx: &ChannelContext) -> Vec<ChannelAction> {
		match self.status {
			ChannelStatus::Suspended => {
				if let Some(err) =
					self.data.as_ref().and_then(|data| data.local_errors.last().cloned())
				{
					vec![ChannelAction::SendMessage(Message::Error(err))]
				} else {
					Vec::new()
				}
			},
			ChannelStatus::Offline => {
				if self.is_host {
					// Hosts wait for the client's invoke.
					Vec::new()
				} else if let Some(refund_script_pubkey) =
					self.lcss().map(|lcss| lcss.refund_script_pubkey.clone())
				{
					self.status = ChannelStatus::SyncingData;
					let invoke = crate::hosted::msgs::InvokeHostedChannel {
						chain_hash: ctx.chain_hash,
						refund_script_pubkey,
						secret: Vec::new(),
					};
					vec![ChannelAction::SendMessage(Message::InvokeHostedChannel(invoke))]
				} else {
					Vec::new()
				}
			},
			_ => Vec::new(),
		}
	}

	/// The peer disconnected. Uncommitted proposals die with the connection: ours are failed
	/// upstream, theirs are forgotten (the peer re-sends after reconnecting).
	pub fn peer_disconnected(&mut self) -> Vec<ChannelAction> {
		let mut actions = Vec::new();
		self.fail_uncommitted_local_adds("peer disconnected", &mut actions);
		self.uncommitted_updates.clear();
		self.last_sent_state_update = None;
		self.reconcile_attempts = 0;
		if self.status != ChannelStatus::Suspended {
			self.status = ChannelStatus::Offline;
		}
		self.opening = None;
		actions
	}

	fn fail_uncommitted_local_adds(&mut self, _reason: &str, actions: &mut Vec<ChannelAction>) {
		for update in self.uncommitted_updates.iter() {
			if let UncommittedUpdate { origin: UpdateOrigin::Local, msg: UpdateMsg::Add(add) } =
				update
			{
				actions.push(ChannelAction::OutgoingResolved {
					htlc: add.clone(),
					result: PaymentResult::Failed(Vec::new()),
				});
			}
		}
	}

	// ===== suspension =====

	fn suspend(&mut self, reason: &str, actions: &mut Vec<ChannelAction>) {
		let err = ErrorMessage { channel_id: self.channel_id, data: reason.to_string() };
		if let Some(data) = self.data.as_mut() {
			data.local_errors.push(err.clone());
		}
		self.fail_uncommitted_local_adds(reason, actions);
		self.uncommitted_updates.clear();
		self.last_sent_state_update = None;
		self.status = ChannelStatus::Suspended;
		actions.push(ChannelAction::SendMessage(Message::Error(err)));
	}

	/// A message from the peer failed to decode: the channel cannot be trusted to agree on
	/// bit-exact signed material anymore.
	pub fn on_decode_error(&mut self) -> Vec<ChannelAction> {
		let mut actions = Vec::new();
		if self.status != ChannelStatus::Suspended {
			self.suspend("invalid message", &mut actions);
		}
		actions
	}

	/// The peer says the channel is broken. Record it and stop.
	pub fn on_remote_error(&mut self, err: ErrorMessage) -> Vec<ChannelAction> {
		let mut actions = Vec::new();
		self.fail_uncommitted_local_adds(ERR_SUSPENDED, &mut actions);
		self.uncommitted_updates.clear();
		self.last_sent_state_update = None;
		if let Some(data) = self.data.as_mut() {
			data.remote_errors.push(err);
		}
		self.status = ChannelStatus::Suspended;
		actions
	}

	// ===== opening =====

	/// Host side: a client invokes (or re-invokes) its channel.
	pub fn on_invoke(
		&mut self, msg: crate::hosted::msgs::InvokeHostedChannel, ctx: &ChannelContext,
	) -> Vec<ChannelAction> {
		let mut actions = Vec::new();
		if !self.is_host {
			// We are the client on this channel; a host never invokes.
			return actions;
		}
		if msg.chain_hash != ctx.chain_hash {
			self.suspend("chain hash mismatch", &mut actions);
			return actions;
		}
		if self.status == ChannelStatus::Suspended {
			// A suspended client may only park a new refund script for a later override.
			if let Some(data) = self.data.as_mut() {
				if data.last_cross_signed_state.refund_script_pubkey != msg.refund_script_pubkey {
					data.pending_refund_script = Some(msg.refund_script_pubkey);
				}
				if let Some(err) = data.local_errors.last().cloned() {
					actions.push(ChannelAction::SendMessage(Message::Error(err)));
				}
			}
			return actions;
		}
		if self.data.is_some() {
			// Known channel re-establishing: answer with our copy of the state, the client
			// answers with (or adopts) theirs.
			self.status = ChannelStatus::SyncingData;
			let lcss = self.data.as_ref().unwrap().last_cross_signed_state.clone();
			actions.push(ChannelAction::SendMessage(Message::LastCrossSignedState(lcss)));
			return actions;
		}
		if !ctx.config.accept_new_clients {
			self.suspend("no new hosted channels", &mut actions);
			return actions;
		}
		if let Some(required) = ctx.config.required_invoke_secret.as_ref() {
			if &msg.secret != required {
				self.suspend("invalid invoke secret", &mut actions);
				return actions;
			}
		}
		if msg.refund_script_pubkey.is_empty() || msg.refund_script_pubkey.len() > 34 {
			self.suspend("invalid refund script", &mut actions);
			return actions;
		}
		let init = InitHostedChannel {
			max_htlc_value_in_flight_msat: ctx.config.max_htlc_value_in_flight_msat,
			htlc_minimum_msat: ctx.config.htlc_minimum_msat,
			max_accepted_htlcs: ctx.config.max_accepted_htlcs,
			channel_capacity_msat: ctx.config.default_capacity_msat,
			initial_client_balance_msat: ctx.config.initial_client_balance_msat,
			features: Vec::new(),
		};
		self.opening = Some(OpeningState {
			refund_script_pubkey: msg.refund_script_pubkey,
			init: Some(init.clone()),
		});
		self.status = ChannelStatus::Opening;
		actions.push(ChannelAction::SendMessage(Message::InitHostedChannel(init)));
		actions
	}

	/// Client side: the host handed us its channel terms.
	pub fn on_init(
		&mut self, msg: InitHostedChannel, ctx: &ChannelContext,
	) -> Vec<ChannelAction> {
		let mut actions = Vec::new();
		if self.status != ChannelStatus::Opening || self.is_host || self.data.is_some() {
			return actions;
		}
		if msg.channel_capacity_msat == 0
			|| msg.initial_client_balance_msat > msg.channel_capacity_msat
			|| msg.htlc_minimum_msat > msg.channel_capacity_msat
		{
			self.suspend("unacceptable channel terms", &mut actions);
			return actions;
		}
		let opening = match self.opening.as_mut() {
			Some(opening) => opening,
			None => return actions,
		};
		opening.init = Some(msg.clone());
		let refund_script = opening.refund_script_pubkey.clone();
		let candidate = initial_lcss(false, refund_script, msg, ctx);
		let local_sig = candidate.sign_remote_view(ctx.secp, ctx.node_secret);
		let state_update = StateUpdate {
			block_day: candidate.block_day,
			local_updates: 0,
			remote_updates: 0,
			local_sig_of_remote_lcss: local_sig,
		};
		self.last_sent_state_update = Some((0, 0));
		actions.push(ChannelAction::SendMessage(Message::StateUpdate(state_update)));
		actions
	}

	// ===== reconciliation =====

	/// Applies our pending resize (if any) and every uncommitted update, in proposal order with
	/// all local-origin updates first, to produce the candidate next state at `block_day`.
	fn next_candidate(&self, block_day: u32, apply_resize: bool) -> Result<LastCrossSignedState, &'static str> {
		let data = self.data.as_ref().ok_or("no cross-signed state")?;
		let mut candidate = data.last_cross_signed_state.clone();
		candidate.block_day = block_day;
		if apply_resize {
			if let Some(resize) = data.pending_resize.as_ref() {
				let new_capacity_msat = resize.new_capacity_sat * 1000;
				let delta = new_capacity_msat - candidate.init_hosted_channel.channel_capacity_msat;
				candidate.init_hosted_channel.channel_capacity_msat = new_capacity_msat;
				// New liquidity always lands on the host side.
				if self.is_host {
					candidate.local_balance_msat += delta;
				} else {
					candidate.remote_balance_msat += delta;
				}
			}
		}
		for origin in [UpdateOrigin::Local, UpdateOrigin::Remote] {
			for update in self.uncommitted_updates.iter().filter(|u| u.origin == origin) {
				apply_update(&mut candidate, origin, &update.msg)?;
			}
		}
		let local_count =
			self.uncommitted_updates.iter().filter(|u| u.origin == UpdateOrigin::Local).count();
		let remote_count = self.uncommitted_updates.len() - local_count;
		candidate.local_updates += local_count as u32;
		candidate.remote_updates += remote_count as u32;
		Ok(candidate)
	}

	/// Signs and queues a `state_update` for our current candidate. No-op if one with identical
	/// counters already went out.
	fn push_state_update(&mut self, ctx: &ChannelContext, actions: &mut Vec<ChannelAction>) {
		let candidate = match self.next_candidate(ctx.block_day(), true) {
			Ok(candidate) => candidate,
			Err(reason) => {
				self.suspend(reason, actions);
				return;
			},
		};
		let counters = (candidate.local_updates, candidate.remote_updates);
		let sig = candidate.sign_remote_view(ctx.secp, ctx.node_secret);
		self.last_sent_state_update = Some(counters);
		actions.push(ChannelAction::SendMessage(Message::StateUpdate(StateUpdate {
			block_day: candidate.block_day,
			local_updates: counters.0,
			remote_updates: counters.1,
			local_sig_of_remote_lcss: sig,
		})));
	}

	/// The heart of the protocol: the peer signed a candidate state, and if it matches ours the
	/// channel advances.
	pub fn on_state_update(
		&mut self, msg: StateUpdate, ctx: &ChannelContext,
	) -> Vec<ChannelAction> {
		let mut actions = Vec::new();
		match self.status {
			ChannelStatus::Opening | ChannelStatus::Overriding | ChannelStatus::Active => {},
			// A state update in any other phase is noise; syncing resolves through full LCSS
			// exchange and suspended channels only move through an override.
			_ => return actions,
		}
		if (msg.block_day as i64 - ctx.block_day() as i64).abs() > MAX_BLOCK_DAY_SKEW {
			self.suspend(ERR_STALE_BLOCKDAY, &mut actions);
			return actions;
		}
		match self.status {
			ChannelStatus::Opening => {
				self.complete_opening(msg, ctx, &mut actions);
				return actions;
			},
			ChannelStatus::Overriding => {
				self.complete_override(msg, ctx, &mut actions);
				return actions;
			},
			_ => {},
		}

		// A re-attestation of exactly the state we already hold carries no news; answering it
		// would have the two of us trading signatures forever.
		if self.uncommitted_updates.is_empty() {
			if let Some(data) = self.data.as_ref() {
				let lcss = &data.last_cross_signed_state;
				if data.pending_resize.is_none()
					&& lcss.local_updates == msg.remote_updates
					&& lcss.remote_updates == msg.local_updates
				{
					return actions;
				}
			}
		}

		let candidate = match self.next_candidate(msg.block_day, true) {
			Ok(candidate) => candidate,
			Err(reason) => {
				self.suspend(reason, &mut actions);
				return actions;
			},
		};
		if candidate.local_updates != msg.remote_updates
			|| candidate.remote_updates != msg.local_updates
		{
			self.reconcile_attempts += 1;
			if self.reconcile_attempts > ctx.config.max_reconcile_attempts {
				self.suspend(ERR_COUNTER_MISMATCH, &mut actions);
				return actions;
			}
			if msg.remote_updates < candidate.local_updates {
				// The peer has not seen some of our proposals: repeat them, then re-attest.
				for update in self.uncommitted_updates.iter() {
					if update.origin == UpdateOrigin::Local {
						actions.push(ChannelAction::SendMessage(update.msg.to_wire()));
					}
				}
				self.last_sent_state_update = None;
				self.push_state_update(ctx, &mut actions);
			}
			// In the opposite direction we are the one missing updates; the peer's re-send is
			// already on the wire behind this message.
			return actions;
		}

		let resize_folded =
			self.data.as_ref().map_or(false, |data| data.pending_resize.is_some());
		self.commit_candidate(candidate, msg, ctx, &mut actions, resize_folded);
		actions
	}

	/// Verifies the peer's signature over `candidate` and, on success, makes it the new
	/// cross-signed state, firing every deferred consequence of the committed updates.
	///
	/// `resize_folded` records whether the candidate embeds our pending resize; on a signature
	/// failure in that case the candidate is rebuilt without the resize and retried once, as the
	/// peer may simply not have processed the resize yet.
	fn commit_candidate(
		&mut self, mut candidate: LastCrossSignedState, msg: StateUpdate, ctx: &ChannelContext,
		actions: &mut Vec<ChannelAction>, resize_folded: bool,
	) -> bool {
		candidate.remote_sig_of_local = msg.local_sig_of_remote_lcss;
		if !candidate.verify_remote_sig(ctx.secp, &self.peer_node_id) {
			if resize_folded {
				match self.next_candidate(msg.block_day, false) {
					Ok(without_resize) => {
						return self.commit_candidate(without_resize, msg, ctx, actions, false);
					},
					Err(reason) => {
						self.suspend(reason, actions);
						return false;
					},
				}
			}
			self.suspend("invalid state update signature", actions);
			return false;
		}
		if let Err(reason) = candidate.check_invariants() {
			self.suspend(reason, actions);
			return false;
		}
		candidate.local_sig_of_remote = candidate.sign_remote_view(ctx.secp, ctx.node_secret);

		// The settlements draining below refer to outgoing HTLCs as they were before this
		// commit removed them from the state.
		let mut settled_lookup: std::collections::HashMap<u64, UpdateAddHTLC> =
			std::collections::HashMap::new();
		if let Some(data) = self.data.as_ref() {
			for htlc in data.last_cross_signed_state.outgoing_htlcs.iter() {
				settled_lookup.insert(htlc.htlc_id, htlc.clone());
			}
		}
		for update in self.uncommitted_updates.iter() {
			if let UncommittedUpdate { origin: UpdateOrigin::Local, msg: UpdateMsg::Add(add) } =
				update
			{
				settled_lookup.insert(add.htlc_id, add.clone());
			}
		}

		let committed_counters = (candidate.local_updates, candidate.remote_updates);
		let data = self.data.as_mut().expect("candidate requires data");
		data.last_cross_signed_state = candidate;
		if resize_folded {
			data.pending_resize = None;
		}
		self.reconcile_attempts = 0;

		// Everything in the queue is now signed into the state: surface the consequences.
		for update in std::mem::take(&mut self.uncommitted_updates) {
			match (update.origin, update.msg) {
				(UpdateOrigin::Remote, UpdateMsg::Add(add)) => {
					actions.push(ChannelAction::CommittedRemoteAdd(add));
				},
				(UpdateOrigin::Remote, UpdateMsg::Fulfill(fulfill)) => {
					if let Some(htlc) = settled_lookup.remove(&fulfill.htlc_id) {
						actions.push(ChannelAction::OutgoingResolved {
							htlc,
							result: PaymentResult::Fulfilled(fulfill.payment_preimage),
						});
					}
				},
				(UpdateOrigin::Remote, UpdateMsg::Fail(fail)) => {
					if let Some(htlc) = settled_lookup.remove(&fail.htlc_id) {
						actions.push(ChannelAction::OutgoingResolved {
							htlc,
							result: PaymentResult::Failed(fail.reason),
						});
					}
				},
				(UpdateOrigin::Remote, UpdateMsg::FailMalformed(fail)) => {
					if let Some(htlc) = settled_lookup.remove(&fail.htlc_id) {
						actions.push(ChannelAction::OutgoingResolved {
							htlc,
							result: PaymentResult::Failed(Vec::new()),
						});
					}
				},
				(UpdateOrigin::Local, _) => {},
			}
		}

		if self.last_sent_state_update != Some(committed_counters) {
			self.push_state_update_for_committed(ctx, actions);
		}
		self.last_sent_state_update = None;
		true
	}

	/// Attests to the just-committed state (rather than a fresh candidate): used when the peer
	/// moved first and we owe them our signature.
	fn push_state_update_for_committed(
		&mut self, ctx: &ChannelContext, actions: &mut Vec<ChannelAction>,
	) {
		let data = self.data.as_ref().expect("committed state exists");
		let mut attested = data.last_cross_signed_state.clone();
		attested.block_day = ctx.block_day();
		let sig = attested.sign_remote_view(ctx.secp, ctx.node_secret);
		actions.push(ChannelAction::SendMessage(Message::StateUpdate(StateUpdate {
			block_day: attested.block_day,
			local_updates: attested.local_updates,
			remote_updates: attested.remote_updates,
			local_sig_of_remote_lcss: sig,
		})));
	}

	fn complete_opening(
		&mut self, msg: StateUpdate, ctx: &ChannelContext, actions: &mut Vec<ChannelAction>,
	) {
		if msg.local_updates != 0 || msg.remote_updates != 0 {
			self.suspend("nonzero counters on a fresh channel", actions);
			return;
		}
		let opening = match self.opening.take() {
			Some(opening) => opening,
			None => return,
		};
		let init = match opening.init {
			Some(ref init) => init.clone(),
			None => return,
		};
		let mut candidate =
			initial_lcss(self.is_host, opening.refund_script_pubkey, init, ctx);
		candidate.block_day = msg.block_day;
		candidate.remote_sig_of_local = msg.local_sig_of_remote_lcss;
		if !candidate.verify_remote_sig(ctx.secp, &self.peer_node_id) {
			self.suspend("invalid state update signature", actions);
			return;
		}
		candidate.local_sig_of_remote = candidate.sign_remote_view(ctx.secp, ctx.node_secret);
		self.data = Some(ChannelData {
			last_cross_signed_state: candidate,
			local_errors: Vec::new(),
			remote_errors: Vec::new(),
			pending_refund_script: None,
			pending_resize: None,
		});
		self.status = ChannelStatus::Active;
		if self.is_host || self.last_sent_state_update != Some((0, 0)) {
			self.push_state_update_for_committed(ctx, actions);
		}
		self.last_sent_state_update = None;
	}

	// ===== htlc updates =====

	/// Proposes an outgoing HTLC on this channel. The caller records the forward linkage first;
	/// we only validate, assign an id and queue.
	pub fn queue_add_htlc(
		&mut self, amount_msat: u64, payment_hash: crate::hosted::msgs::PaymentHash,
		cltv_expiry: u32, onion: crate::hosted::msgs::OnionPacket, ctx: &ChannelContext,
	) -> Result<(UpdateAddHTLC, Vec<ChannelAction>), &'static str> {
		if self.status != ChannelStatus::Active {
			return Err("channel not active");
		}
		let lcss = &self.data.as_ref().expect("active implies data").last_cross_signed_state;
		if amount_msat < lcss.init_hosted_channel.htlc_minimum_msat {
			return Err("amount below htlc minimum");
		}
		let pending_adds: u64 = self
			.uncommitted_updates
			.iter()
			.filter_map(|u| match &u.msg {
				UpdateMsg::Add(add) if u.origin == UpdateOrigin::Local => Some(add.amount_msat),
				_ => None,
			})
			.sum();
		let committed_outgoing: u64 =
			lcss.outgoing_htlcs.iter().map(|htlc| htlc.amount_msat).sum();
		if committed_outgoing + pending_adds + amount_msat > lcss.local_balance_msat {
			return Err("insufficient balance");
		}
		let in_flight_count = lcss.incoming_htlcs.len()
			+ lcss.outgoing_htlcs.len()
			+ self
				.uncommitted_updates
				.iter()
				.filter(|u| matches!(u.msg, UpdateMsg::Add(_)))
				.count();
		if in_flight_count + 1 > lcss.init_hosted_channel.max_accepted_htlcs as usize {
			return Err("too many in-flight htlcs");
		}
		let in_flight_msat: u64 = lcss
			.incoming_htlcs
			.iter()
			.chain(lcss.outgoing_htlcs.iter())
			.map(|htlc| htlc.amount_msat)
			.sum::<u64>()
			+ self
				.uncommitted_updates
				.iter()
				.filter_map(|u| match &u.msg {
					UpdateMsg::Add(add) => Some(add.amount_msat),
					_ => None,
				})
				.sum::<u64>();
		if in_flight_msat + amount_msat > lcss.init_hosted_channel.max_htlc_value_in_flight_msat {
			return Err("too much value in flight");
		}
		if cltv_expiry <= ctx.current_height {
			return Err("htlc already expired");
		}

		let add = UpdateAddHTLC {
			channel_id: self.channel_id,
			htlc_id: self.next_local_htlc_id,
			amount_msat,
			payment_hash,
			cltv_expiry,
			onion_routing_packet: onion,
		};
		self.next_local_htlc_id += 1;
		self.uncommitted_updates
			.push(UncommittedUpdate { origin: UpdateOrigin::Local, msg: UpdateMsg::Add(add.clone()) });
		let mut actions = vec![ChannelAction::SendMessage(Message::UpdateAddHTLC(add.clone()))];
		self.push_state_update(ctx, &mut actions);
		Ok((add, actions))
	}

	/// Settles an incoming HTLC with its preimage (the downstream leg paid us).
	pub fn queue_fulfill_htlc(
		&mut self, htlc_id: u64, payment_preimage: PaymentPreimage, ctx: &ChannelContext,
	) -> Vec<ChannelAction> {
		let mut actions = Vec::new();
		if self.status != ChannelStatus::Active {
			return actions;
		}
		let known = self
			.data
			.as_ref()
			.map_or(false, |data| {
				data.last_cross_signed_state
					.incoming_htlcs
					.iter()
					.any(|htlc| htlc.htlc_id == htlc_id)
			});
		if !known || self.already_settling_incoming(htlc_id) {
			return actions;
		}
		let fulfill = UpdateFulfillHTLC { channel_id: self.channel_id, htlc_id, payment_preimage };
		self.uncommitted_updates.push(UncommittedUpdate {
			origin: UpdateOrigin::Local,
			msg: UpdateMsg::Fulfill(fulfill.clone()),
		});
		actions.push(ChannelAction::SendMessage(Message::UpdateFulfillHTLC(fulfill)));
		self.push_state_update(ctx, &mut actions);
		actions
	}

	/// Fails an incoming HTLC back to the peer (the downstream leg failed).
	pub fn queue_fail_htlc(
		&mut self, htlc_id: u64, reason: Vec<u8>, ctx: &ChannelContext,
	) -> Vec<ChannelAction> {
		let mut actions = Vec::new();
		if self.status != ChannelStatus::Active {
			return actions;
		}
		let known = self.data.as_ref().map_or(false, |data| {
			data.last_cross_signed_state.incoming_htlcs.iter().any(|htlc| htlc.htlc_id == htlc_id)
		});
		if !known || self.already_settling_incoming(htlc_id) {
			return actions;
		}
		let fail = UpdateFailHTLC { channel_id: self.channel_id, htlc_id, reason };
		self.uncommitted_updates
			.push(UncommittedUpdate { origin: UpdateOrigin::Local, msg: UpdateMsg::Fail(fail.clone()) });
		actions.push(ChannelAction::SendMessage(Message::UpdateFailHTLC(fail)));
		self.push_state_update(ctx, &mut actions);
		actions
	}

	/// Fails an incoming HTLC whose onion the node rejected outright.
	pub fn queue_fail_malformed_htlc(
		&mut self, htlc_id: u64, sha256_of_onion: [u8; 32], failure_code: u16,
		ctx: &ChannelContext,
	) -> Vec<ChannelAction> {
		let mut actions = Vec::new();
		if self.status != ChannelStatus::Active {
			return actions;
		}
		let known = self.data.as_ref().map_or(false, |data| {
			data.last_cross_signed_state.incoming_htlcs.iter().any(|htlc| htlc.htlc_id == htlc_id)
		});
		if !known || self.already_settling_incoming(htlc_id) {
			return actions;
		}
		let fail = UpdateFailMalformedHTLC {
			channel_id: self.channel_id,
			htlc_id,
			sha256_of_onion,
			failure_code,
		};
		self.uncommitted_updates.push(UncommittedUpdate {
			origin: UpdateOrigin::Local,
			msg: UpdateMsg::FailMalformed(fail.clone()),
		});
		actions.push(ChannelAction::SendMessage(Message::UpdateFailMalformedHTLC(fail)));
		self.push_state_update(ctx, &mut actions);
		actions
	}

	fn already_settling_incoming(&self, htlc_id: u64) -> bool {
		self.uncommitted_updates.iter().any(|u| {
			u.origin == UpdateOrigin::Local
				&& match &u.msg {
					UpdateMsg::Fulfill(f) => f.htlc_id == htlc_id,
					UpdateMsg::Fail(f) => f.htlc_id == htlc_id,
					UpdateMsg::FailMalformed(f) => f.htlc_id == htlc_id,
					UpdateMsg::Add(_) => false,
				}
		})
	}

	/// The peer proposes an HTLC toward us.
	pub fn on_update_add(
		&mut self, msg: UpdateAddHTLC, _ctx: &ChannelContext,
	) -> Vec<ChannelAction> {
		let mut actions = Vec::new();
		if self.status != ChannelStatus::Active {
			return actions;
		}
		let (htlc_minimum_msat, max_accepted_htlcs, remote_balance_msat, committed_incoming, committed_count, duplicate_committed) = {
			let lcss = &self.data.as_ref().expect("active implies data").last_cross_signed_state;
			(
				lcss.init_hosted_channel.htlc_minimum_msat,
				lcss.init_hosted_channel.max_accepted_htlcs as usize,
				lcss.remote_balance_msat,
				lcss.incoming_htlcs.iter().map(|htlc| htlc.amount_msat).sum::<u64>(),
				lcss.incoming_htlcs.len() + lcss.outgoing_htlcs.len(),
				lcss.incoming_htlcs.iter().any(|htlc| htlc.htlc_id == msg.htlc_id),
			)
		};
		if msg.channel_id != self.channel_id {
			self.suspend("unknown channel id", &mut actions);
			return actions;
		}
		// A byte-identical add is a reconciliation retransmit and is fine; a *different* add
		// reusing an id is an attack on the signed material.
		for update in self.uncommitted_updates.iter() {
			if let UncommittedUpdate { origin: UpdateOrigin::Remote, msg: UpdateMsg::Add(add) } =
				update
			{
				if add.htlc_id == msg.htlc_id {
					if *add == msg {
						return actions;
					}
					self.suspend("duplicate htlc id", &mut actions);
					return actions;
				}
			}
		}
		if duplicate_committed {
			self.suspend("duplicate htlc id", &mut actions);
			return actions;
		}
		if msg.amount_msat < htlc_minimum_msat {
			self.suspend("htlc below minimum", &mut actions);
			return actions;
		}
		let pending_remote_adds: u64 = self
			.uncommitted_updates
			.iter()
			.filter_map(|u| match &u.msg {
				UpdateMsg::Add(add) if u.origin == UpdateOrigin::Remote => Some(add.amount_msat),
				_ => None,
			})
			.sum();
		if committed_incoming + pending_remote_adds + msg.amount_msat > remote_balance_msat {
			self.suspend("peer overdraws its balance", &mut actions);
			return actions;
		}
		let in_flight_count = committed_count
			+ self
				.uncommitted_updates
				.iter()
				.filter(|u| matches!(u.msg, UpdateMsg::Add(_)))
				.count();
		if in_flight_count + 1 > max_accepted_htlcs {
			self.suspend("too many in-flight htlcs", &mut actions);
			return actions;
		}
		self.uncommitted_updates
			.push(UncommittedUpdate { origin: UpdateOrigin::Remote, msg: UpdateMsg::Add(msg) });
		actions
	}

	/// Whether the peer already has a settlement of our outgoing `htlc_id` in the queue (i.e. a
	/// repeat is a reconciliation retransmit, not news).
	fn remote_settlement_queued(&self, htlc_id: u64) -> bool {
		self.uncommitted_updates.iter().any(|u| {
			u.origin == UpdateOrigin::Remote
				&& match &u.msg {
					UpdateMsg::Fulfill(f) => f.htlc_id == htlc_id,
					UpdateMsg::Fail(f) => f.htlc_id == htlc_id,
					UpdateMsg::FailMalformed(f) => f.htlc_id == htlc_id,
					UpdateMsg::Add(_) => false,
				}
		})
	}

	/// The peer settles one of our outgoing HTLCs with a preimage.
	pub fn on_update_fulfill(
		&mut self, msg: UpdateFulfillHTLC, _ctx: &ChannelContext,
	) -> Vec<ChannelAction> {
		let mut actions = Vec::new();
		if self.status != ChannelStatus::Active {
			return actions;
		}
		if self.remote_settlement_queued(msg.htlc_id) {
			return actions;
		}
		let outgoing = self.find_outgoing(msg.htlc_id);
		let htlc = match outgoing {
			Some(htlc) => htlc,
			None => {
				self.suspend("fulfill of unknown htlc", &mut actions);
				return actions;
			},
		};
		let hash = sha256::Hash::hash(&msg.payment_preimage.0).to_byte_array();
		if hash != htlc.payment_hash.0 {
			self.suspend("invalid preimage", &mut actions);
			return actions;
		}
		// Persist the preimage before anything else: even if we crash mid-exchange we must be
		// able to claim the upstream leg.
		actions.push(ChannelAction::PreimageLearned(msg.payment_preimage));
		self.uncommitted_updates
			.push(UncommittedUpdate { origin: UpdateOrigin::Remote, msg: UpdateMsg::Fulfill(msg) });
		actions
	}

	/// The peer refuses one of our outgoing HTLCs.
	pub fn on_update_fail(
		&mut self, msg: UpdateFailHTLC, _ctx: &ChannelContext,
	) -> Vec<ChannelAction> {
		let mut actions = Vec::new();
		if self.status != ChannelStatus::Active {
			return actions;
		}
		if self.remote_settlement_queued(msg.htlc_id) {
			return actions;
		}
		if self.find_outgoing(msg.htlc_id).is_none() {
			self.suspend("fail of unknown htlc", &mut actions);
			return actions;
		}
		self.uncommitted_updates
			.push(UncommittedUpdate { origin: UpdateOrigin::Remote, msg: UpdateMsg::Fail(msg) });
		actions
	}

	/// The peer refuses one of our outgoing HTLCs as malformed.
	pub fn on_update_fail_malformed(
		&mut self, msg: UpdateFailMalformedHTLC, _ctx: &ChannelContext,
	) -> Vec<ChannelAction> {
		let mut actions = Vec::new();
		if self.status != ChannelStatus::Active {
			return actions;
		}
		if self.remote_settlement_queued(msg.htlc_id) {
			return actions;
		}
		if msg.failure_code & 0x8000 == 0 {
			self.suspend("malformed failure without badonion", &mut actions);
			return actions;
		}
		if self.find_outgoing(msg.htlc_id).is_none() {
			self.suspend("fail of unknown htlc", &mut actions);
			return actions;
		}
		self.uncommitted_updates.push(UncommittedUpdate {
			origin: UpdateOrigin::Remote,
			msg: UpdateMsg::FailMalformed(msg),
		});
		actions
	}

	fn find_outgoing(&self, htlc_id: u64) -> Option<UpdateAddHTLC> {
		if let Some(data) = self.data.as_ref() {
			for htlc in data.last_cross_signed_state.outgoing_htlcs.iter() {
				if htlc.htlc_id == htlc_id {
					return Some(htlc.clone());
				}
			}
		}
		for update in self.uncommitted_updates.iter() {
			if let UncommittedUpdate { origin: UpdateOrigin::Local, msg: UpdateMsg::Add(add) } =
				update
			{
				if add.htlc_id == htlc_id {
					return Some(add.clone());
				}
			}
		}
		None
	}

	// ===== sync =====

	/// Full-state exchange after a reconnect: adopt the peer's copy if it is provably newer.
	pub fn on_lcss(
		&mut self, msg: LastCrossSignedState, ctx: &ChannelContext,
	) -> Vec<ChannelAction> {
		let mut actions = Vec::new();
		if self.status != ChannelStatus::SyncingData {
			return actions;
		}
		// The message is the peer's view; `remote` within it is us.
		if !msg.verify_remote_sig(ctx.secp, ctx.node_id)
			|| !msg.verify_local_sig(ctx.secp, &self.peer_node_id)
		{
			self.suspend("invalid last cross signed state", &mut actions);
			return actions;
		}
		let their_equivalent = msg.reverse();
		let ours_total = self.lcss().map(|lcss| lcss.total_updates()).unwrap_or(0);
		if their_equivalent.total_updates() > ours_total {
			if let Err(reason) = their_equivalent.check_invariants() {
				self.suspend(reason, &mut actions);
				return actions;
			}
			let data = self.data.as_mut().expect("syncing implies data");
			data.last_cross_signed_state = their_equivalent;
			self.next_local_htlc_id = data
				.last_cross_signed_state
				.outgoing_htlcs
				.iter()
				.map(|htlc| htlc.htlc_id + 1)
				.max()
				.unwrap_or(self.next_local_htlc_id);
		}
		self.status = ChannelStatus::Active;
		if !self.is_host {
			// The client always answers with its (possibly just adopted) copy, which is what
			// lets the host leave the syncing phase; a host-side newer copy gets adopted from
			// this reply in turn.
			let lcss = self.data.as_ref().unwrap().last_cross_signed_state.clone();
			actions.push(ChannelAction::SendMessage(Message::LastCrossSignedState(lcss)));
		}
		actions
	}

	// ===== resize =====

	/// Host side: the client asks for more capacity, signing the new figure.
	pub fn on_resize(&mut self, msg: ResizeChannel, ctx: &ChannelContext) -> Vec<ChannelAction> {
		let mut actions = Vec::new();
		if self.status != ChannelStatus::Active || !self.is_host {
			return actions;
		}
		if !msg.verify(ctx.secp, &self.peer_node_id) {
			self.suspend("invalid resize signature", &mut actions);
			return actions;
		}
		let current_capacity =
			self.lcss().map(|lcss| lcss.init_hosted_channel.channel_capacity_msat).unwrap_or(0);
		if msg.new_capacity_sat.checked_mul(1000).map_or(true, |msat| msat <= current_capacity) {
			self.suspend("resize must grow the channel", &mut actions);
			return actions;
		}
		self.data.as_mut().expect("active implies data").pending_resize = Some(msg);
		// Fold the new capacity into a fresh signed state right away.
		self.push_state_update(ctx, &mut actions);
		actions
	}

	/// Client side: sign and send a resize proposal, keeping it pending until cross-signed.
	pub fn start_resize(
		&mut self, new_capacity_sat: u64, ctx: &ChannelContext,
	) -> Result<Vec<ChannelAction>, &'static str> {
		if self.status != ChannelStatus::Active || self.is_host {
			return Err("resize requires an active client channel");
		}
		let current_capacity =
			self.lcss().map(|lcss| lcss.init_hosted_channel.channel_capacity_msat).unwrap_or(0);
		if new_capacity_sat.checked_mul(1000).map_or(true, |msat| msat <= current_capacity) {
			return Err("resize must grow the channel");
		}
		let resize = ResizeChannel::sign_new(new_capacity_sat, ctx.secp, ctx.node_secret);
		self.data.as_mut().expect("active implies data").pending_resize = Some(resize.clone());
		Ok(vec![ChannelAction::SendMessage(Message::ResizeChannel(resize))])
	}

	// ===== override =====

	/// Host side: propose wiping a suspended channel back to a clean state.
	pub fn start_override(
		&mut self, new_local_balance_msat: u64, ctx: &ChannelContext,
	) -> Result<Vec<ChannelAction>, &'static str> {
		if !self.is_host {
			return Err("only hosts may override");
		}
		if self.status != ChannelStatus::Suspended && self.status != ChannelStatus::Overriding {
			return Err("channel is not suspended");
		}
		let lcss = self.lcss().ok_or("channel was never cross-signed")?;
		if new_local_balance_msat > lcss.init_hosted_channel.channel_capacity_msat {
			return Err("balance exceeds capacity");
		}
		let candidate = self.override_candidate_host(new_local_balance_msat, ctx.block_day());
		let sig = candidate.sign_remote_view(ctx.secp, ctx.node_secret);
		let proposal = StateOverride {
			block_day: candidate.block_day,
			local_balance_msat: candidate.local_balance_msat,
			local_updates: candidate.local_updates,
			remote_updates: candidate.remote_updates,
			local_sig_of_remote_lcss: sig,
		};
		self.pending_override = Some(proposal.clone());
		self.status = ChannelStatus::Overriding;
		Ok(vec![ChannelAction::SendMessage(Message::StateOverride(proposal))])
	}

	/// The host-side shape of the post-override state. Counters advance past the old state so
	/// the override always wins a later sync comparison.
	fn override_candidate_host(
		&self, new_local_balance_msat: u64, block_day: u32,
	) -> LastCrossSignedState {
		let lcss = self.lcss().expect("checked by caller");
		let mut candidate = lcss.clone();
		candidate.block_day = block_day;
		candidate.local_balance_msat = new_local_balance_msat;
		candidate.remote_balance_msat =
			lcss.init_hosted_channel.channel_capacity_msat - new_local_balance_msat;
		candidate.local_updates = lcss.local_updates + 1;
		candidate.remote_updates = lcss.remote_updates + 1;
		candidate.incoming_htlcs = Vec::new();
		candidate.outgoing_htlcs = Vec::new();
		candidate
	}

	/// Client side: a `state_override` arrived. Park it; only the operator may accept.
	pub fn on_state_override(
		&mut self, msg: StateOverride, ctx: &ChannelContext,
	) -> Vec<ChannelAction> {
		let mut actions = Vec::new();
		if self.is_host || self.status != ChannelStatus::Suspended {
			return actions;
		}
		if (msg.block_day as i64 - ctx.block_day() as i64).abs() > MAX_BLOCK_DAY_SKEW {
			self.suspend(ERR_STALE_BLOCKDAY, &mut actions);
			return actions;
		}
		self.pending_override = Some(msg);
		actions
	}

	/// Client side: the operator decided to accept the parked override.
	pub fn accept_override(
		&mut self, ctx: &ChannelContext,
	) -> Result<Vec<ChannelAction>, &'static str> {
		if self.is_host {
			return Err("only clients accept overrides");
		}
		let proposal = self.pending_override.clone().ok_or("no override proposed")?;
		let lcss = self.lcss().ok_or("channel was never cross-signed")?;
		let capacity = lcss.init_hosted_channel.channel_capacity_msat;
		if proposal.local_balance_msat > capacity {
			return Err("override balance exceeds capacity");
		}
		// Build our (client) view of the proposed state. The proposal's `local` side is the
		// host's.
		let mut candidate = lcss.clone();
		candidate.block_day = proposal.block_day;
		candidate.local_balance_msat = capacity - proposal.local_balance_msat;
		candidate.remote_balance_msat = proposal.local_balance_msat;
		candidate.local_updates = proposal.remote_updates;
		candidate.remote_updates = proposal.local_updates;
		candidate.incoming_htlcs = Vec::new();
		candidate.outgoing_htlcs = Vec::new();
		candidate.remote_sig_of_local = proposal.local_sig_of_remote_lcss;
		if !candidate.verify_remote_sig(ctx.secp, &self.peer_node_id) {
			return Err("invalid override signature");
		}
		candidate.local_sig_of_remote = candidate.sign_remote_view(ctx.secp, ctx.node_secret);

		let mut actions = Vec::new();
		// Every HTLC the override wipes resolves as failed; the ones we had offered outward
		// must notify their upstream legs.
		for data in self.data.iter() {
			for htlc in data.last_cross_signed_state.outgoing_htlcs.iter() {
				actions.push(ChannelAction::OutgoingResolved {
					htlc: htlc.clone(),
					result: PaymentResult::Failed(ERR_OVERRIDDEN.as_bytes().to_vec()),
				});
			}
		}
		let data = self.data.as_mut().expect("checked above");
		data.last_cross_signed_state = candidate.clone();
		data.local_errors.clear();
		data.remote_errors.clear();
		data.pending_refund_script = None;
		data.pending_resize = None;
		self.uncommitted_updates.clear();
		self.pending_override = None;
		self.status = ChannelStatus::Active;
		self.reconcile_attempts = 0;
		actions.push(ChannelAction::SendMessage(Message::StateUpdate(StateUpdate {
			block_day: candidate.block_day,
			local_updates: candidate.local_updates,
			remote_updates: candidate.remote_updates,
			local_sig_of_remote_lcss: candidate.local_sig_of_remote,
		})));
		Ok(actions)
	}

	/// Host side: the client countersigned our override.
	fn complete_override(
		&mut self, msg: StateUpdate, ctx: &ChannelContext, actions: &mut Vec<ChannelAction>,
	) {
		let proposal = match self.pending_override.clone() {
			Some(proposal) => proposal,
			None => return,
		};
		let mut candidate =
			self.override_candidate_host(proposal.local_balance_msat, proposal.block_day);
		if candidate.local_updates != msg.remote_updates
			|| candidate.remote_updates != msg.local_updates
		{
			self.suspend(ERR_COUNTER_MISMATCH, actions);
			return;
		}
		candidate.remote_sig_of_local = msg.local_sig_of_remote_lcss;
		if !candidate.verify_remote_sig(ctx.secp, &self.peer_node_id) {
			self.suspend("invalid state update signature", actions);
			return;
		}
		candidate.local_sig_of_remote = candidate.sign_remote_view(ctx.secp, ctx.node_secret);

		for data in self.data.iter() {
			for htlc in data.last_cross_signed_state.outgoing_htlcs.iter() {
				actions.push(ChannelAction::OutgoingResolved {
					htlc: htlc.clone(),
					result: PaymentResult::Failed(ERR_OVERRIDDEN.as_bytes().to_vec()),
				});
			}
		}
		let data = self.data.as_mut().expect("override requires data");
		data.last_cross_signed_state = candidate;
		data.local_errors.clear();
		data.remote_errors.clear();
		data.pending_refund_script = None;
		data.pending_resize = None;
		self.uncommitted_updates.clear();
		self.pending_override = None;
		self.status = ChannelStatus::Active;
		self.reconcile_attempts = 0;
	}

	// ===== timers and blocks =====

	/// A new chain tip: outgoing HTLCs nearing expiry mean the peer went unresponsive on us.
	pub fn on_block_updated(&mut self, ctx: &ChannelContext) -> Vec<ChannelAction> {
		let mut actions = Vec::new();
		if self.status == ChannelStatus::Opening || self.data.is_none() {
			return actions;
		}
		let deadline = ctx.current_height + ctx.config.cltv_safety_delta;
		let timed_out: Vec<UpdateAddHTLC> = self
			.data
			.as_ref()
			.unwrap()
			.last_cross_signed_state
			.outgoing_htlcs
			.iter()
			.filter(|htlc| htlc.cltv_expiry <= deadline)
			.cloned()
			.collect();
		if timed_out.is_empty() {
			return actions;
		}
		if self.status != ChannelStatus::Suspended {
			self.suspend(ERR_TIMED_OUT, &mut actions);
		}
		for htlc in timed_out {
			actions.push(ChannelAction::OutgoingResolved {
				htlc,
				result: PaymentResult::Failed(ERR_TIMED_OUT.as_bytes().to_vec()),
			});
		}
		actions
	}

	/// Once a minute: nudge a stalled signature exchange along.
	pub fn on_timer_tick(&mut self, ctx: &ChannelContext) -> Vec<ChannelAction> {
		let mut actions = Vec::new();
		if self.status == ChannelStatus::Active && !self.uncommitted_updates.is_empty() {
			for update in self.uncommitted_updates.iter() {
				if update.origin == UpdateOrigin::Local {
					actions.push(ChannelAction::SendMessage(update.msg.to_wire()));
				}
			}
			self.last_sent_state_update = None;
			self.push_state_update(ctx, &mut actions);
		}
		actions
	}
}

impl UpdateMsg {
	fn to_wire(&self) -> Message {
		match self {
			UpdateMsg::Add(msg) => Message::UpdateAddHTLC(msg.clone()),
			UpdateMsg::Fulfill(msg) => Message::UpdateFulfillHTLC(msg.clone()),
			UpdateMsg::Fail(msg) => Message::UpdateFailHTLC(msg.clone()),
			UpdateMsg::FailMalformed(msg) => Message::UpdateFailMalformedHTLC(msg.clone()),
		}
	}
}

/// The state every channel starts from: full host balance minus whatever the host grants the
/// client for free, zero counters, no HTLCs. Signatures start as placeholders and are filled in
/// during the opening exchange.
fn initial_lcss(
	is_host: bool, refund_script_pubkey: ScriptBuf, init: InitHostedChannel, ctx: &ChannelContext,
) -> LastCrossSignedState {
	let client_balance = init.initial_client_balance_msat;
	let host_balance = init.channel_capacity_msat - client_balance;
	let (local_balance_msat, remote_balance_msat) =
		if is_host { (host_balance, client_balance) } else { (client_balance, host_balance) };
	// Self-signed placeholders; real signatures replace these before anything is stored.
	let placeholder = LastCrossSignedState {
		is_host,
		refund_script_pubkey,
		init_hosted_channel: init,
		block_day: ctx.block_day(),
		local_balance_msat,
		remote_balance_msat,
		local_updates: 0,
		remote_updates: 0,
		incoming_htlcs: Vec::new(),
		outgoing_htlcs: Vec::new(),
		remote_sig_of_local: dummy_sig(ctx),
		local_sig_of_remote: dummy_sig(ctx),
	};
	placeholder
}

fn dummy_sig(ctx: &ChannelContext) -> bitcoin::secp256k1::ecdsa::Signature {
	ctx.secp.sign_ecdsa(&bitcoin::secp256k1::Message::from_digest([0x2a; 32]), ctx.node_secret)
}

/// Applies one update to a candidate state. `origin` is relative to the candidate's view.
fn apply_update(
	candidate: &mut LastCrossSignedState, origin: UpdateOrigin, msg: &UpdateMsg,
) -> Result<(), &'static str> {
	match (origin, msg) {
		(UpdateOrigin::Local, UpdateMsg::Add(add)) => {
			candidate.outgoing_htlcs.push(add.clone());
		},
		(UpdateOrigin::Remote, UpdateMsg::Add(add)) => {
			candidate.incoming_htlcs.push(add.clone());
		},
		(UpdateOrigin::Local, UpdateMsg::Fulfill(fulfill)) => {
			let amount = remove_htlc(&mut candidate.incoming_htlcs, fulfill.htlc_id)?;
			candidate.local_balance_msat += amount;
			candidate.remote_balance_msat -= amount;
		},
		(UpdateOrigin::Remote, UpdateMsg::Fulfill(fulfill)) => {
			let amount = remove_htlc(&mut candidate.outgoing_htlcs, fulfill.htlc_id)?;
			candidate.local_balance_msat -= amount;
			candidate.remote_balance_msat += amount;
		},
		(UpdateOrigin::Local, UpdateMsg::Fail(fail)) => {
			remove_htlc(&mut candidate.incoming_htlcs, fail.htlc_id)?;
		},
		(UpdateOrigin::Remote, UpdateMsg::Fail(fail)) => {
			remove_htlc(&mut candidate.outgoing_htlcs, fail.htlc_id)?;
		},
		(UpdateOrigin::Local, UpdateMsg::FailMalformed(fail)) => {
			remove_htlc(&mut candidate.incoming_htlcs, fail.htlc_id)?;
		},
		(UpdateOrigin::Remote, UpdateMsg::FailMalformed(fail)) => {
			remove_htlc(&mut candidate.outgoing_htlcs, fail.htlc_id)?;
		},
	}
	Ok(())
}

fn remove_htlc(htlcs: &mut Vec<UpdateAddHTLC>, htlc_id: u64) -> Result<u64, &'static str> {
	match htlcs.iter().position(|htlc| htlc.htlc_id == htlc_id) {
		Some(idx) => Ok(htlcs.remove(idx).amount_msat),
		None => Err("settlement of unknown htlc"),
	}
}
