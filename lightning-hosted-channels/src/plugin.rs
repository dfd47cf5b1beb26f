// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The event loop gluing the [`ChannelMaster`] to a live node.
//!
//! The core is single-threaded cooperative: node events, intercepted HTLCs, control requests and
//! the once-a-minute timer are all funneled through one `select!` loop in strict arrival order.
//! Nothing in the master blocks on the network, so each event runs to completion before the
//! next is looked at.
//!
//! Integrations adapt their node's callbacks into [`PluginEvent`]s and feed them through the
//! sender half of the channel passed to [`run`].

use crate::chain::{HtlcIdentifier, NodeInterface, PaymentResult};
use crate::control;
use crate::hosted::channelmaster::ChannelMaster;
use crate::hosted::msgs::{OnionPacket, PaymentHash};
use crate::util::logger::Logger;
use crate::util::persist::KVStoreSync;

use bitcoin::secp256k1::PublicKey;

use serde_json::{json, Value};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

use std::ops::Deref;
use std::sync::Arc;

/// One thing that happened on the node side.
#[derive(Clone, Debug)]
pub enum PluginEvent {
	/// A peer connection was established (or re-established).
	PeerConnected {
		/// The peer's node id.
		peer: PublicKey,
	},
	/// A peer connection was lost.
	PeerDisconnected {
		/// The peer's node id.
		peer: PublicKey,
	},
	/// A custom peer message arrived.
	CustomMessage {
		/// The sending peer.
		peer: PublicKey,
		/// The message's type tag.
		message_type: u16,
		/// The raw message payload (without the tag).
		payload: Vec<u8>,
	},
	/// The node intercepted an HTLC heading for one of our short channel ids.
	HtlcIntercepted {
		/// The node-side identifier of the intercepted HTLC.
		htlc: HtlcIdentifier,
		/// The HTLC's payment hash.
		payment_hash: PaymentHash,
		/// The HTLC's value, in millisatoshi.
		amount_msat: u64,
		/// The HTLC's expiry height.
		cltv_expiry: u32,
		/// The onion to peel.
		onion: OnionPacket,
	},
	/// A forward previously handed to the node reached a terminal state.
	NodePaymentResult {
		/// The hosted incoming leg the forward belongs to, as passed to
		/// [`NodeInterface::forward_htlc`].
		htlc: HtlcIdentifier,
		/// The outcome.
		result: PaymentResult,
	},
	/// Stop the event loop.
	Shutdown,
}

/// How often the chain tip is refreshed and fanned out.
const TIMER_INTERVAL: Duration = Duration::from_secs(60);

/// Runs the plugin until the event source closes, a [`PluginEvent::Shutdown`] arrives, or a
/// database write fails (which is deliberately fatal: better a dead plugin than one whose
/// signatures outrun its disk).
///
/// When `control_socket` is given, line-delimited JSON requests
/// (`{"id": 1, "method": "hc-list", "params": {}}`) are served on it, one connection at a time.
pub async fn run<K: Deref, N: Deref, L: Deref>(
	master: Arc<ChannelMaster<K, N, L>>, mut events: mpsc::Receiver<PluginEvent>,
	control_socket: Option<UnixListener>,
) where
	K::Target: KVStoreSync,
	N::Target: NodeInterface,
	L::Target: Logger,
{
	let mut timer = interval(TIMER_INTERVAL);
	timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		if master.has_fatal_error() {
			return;
		}
		tokio::select! {
			event = events.recv() => {
				match event {
					Some(PluginEvent::PeerConnected { peer }) => master.peer_connected(peer),
					Some(PluginEvent::PeerDisconnected { peer }) => master.peer_disconnected(peer),
					Some(PluginEvent::CustomMessage { peer, message_type, payload }) => {
						master.handle_custom_message(peer, message_type, &payload);
					},
					Some(PluginEvent::HtlcIntercepted {
						htlc, payment_hash, amount_msat, cltv_expiry, onion,
					}) => {
						master.htlc_intercepted(htlc, payment_hash, amount_msat, cltv_expiry, onion);
					},
					Some(PluginEvent::NodePaymentResult { htlc, result }) => {
						master.node_payment_result(htlc, result);
					},
					Some(PluginEvent::Shutdown) | None => return,
				}
			},
			_ = timer.tick() => {
				master.timer_tick();
			},
			accepted = accept_control(&control_socket) => {
				if let Some(stream) = accepted {
					serve_control_connection(&master, stream).await;
				}
			},
		}
	}
}

async fn accept_control(listener: &Option<UnixListener>) -> Option<tokio::net::UnixStream> {
	match listener {
		Some(listener) => listener.accept().await.ok().map(|(stream, _)| stream),
		None => std::future::pending().await,
	}
}

async fn serve_control_connection<K: Deref, N: Deref, L: Deref>(
	master: &ChannelMaster<K, N, L>, stream: tokio::net::UnixStream,
) where
	K::Target: KVStoreSync,
	N::Target: NodeInterface,
	L::Target: Logger,
{
	let (read_half, mut write_half) = stream.into_split();
	let mut lines = BufReader::new(read_half).lines();
	while let Ok(Some(line)) = lines.next_line().await {
		let response = handle_control_line(master, &line);
		let mut bytes = response.to_string().into_bytes();
		bytes.push(b'\n');
		if write_half.write_all(&bytes).await.is_err() {
			break;
		}
	}
}

fn handle_control_line<K: Deref, N: Deref, L: Deref>(
	master: &ChannelMaster<K, N, L>, line: &str,
) -> Value
where
	K::Target: KVStoreSync,
	N::Target: NodeInterface,
	L::Target: Logger,
{
	let request: Value = match serde_json::from_str(line) {
		Ok(request) => request,
		Err(e) => return json!({ "error": { "message": format!("bad request: {}", e) } }),
	};
	let id = request.get("id").cloned().unwrap_or(Value::Null);
	let method = match request.get("method").and_then(|m| m.as_str()) {
		Some(method) => method,
		None => return json!({ "id": id, "error": { "message": "missing method" } }),
	};
	let default_params = json!({});
	let params = request.get("params").unwrap_or(&default_params);
	match control::handle_request(master, method, params) {
		Ok(result) => json!({ "id": id, "result": result }),
		Err(e) => json!({ "id": id, "error": { "message": format!("{}", e) } }),
	}
}
