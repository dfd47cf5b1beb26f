// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The operator-facing JSON-RPC methods.
//!
//! Transport is someone else's problem ([`crate::plugin`] serves these over a unix socket);
//! everything here is a pure `(method, params) -> json` mapping onto [`ChannelMaster`].

use crate::chain::NodeInterface;
use crate::hosted::channelmaster::ChannelMaster;
use crate::util::errors::APIError;
use crate::util::logger::Logger;
use crate::util::persist::KVStoreSync;

use bitcoin::hex::FromHex;
use bitcoin::secp256k1::PublicKey;
use bitcoin::ScriptBuf;

use serde_json::{json, Value};

use std::ops::Deref;
use std::str::FromStr;

fn param_str<'a>(params: &'a Value, name: &str) -> Result<&'a str, APIError> {
	params
		.get(name)
		.and_then(|v| v.as_str())
		.ok_or_else(|| APIError::APIMisuseError { err: format!("missing parameter: {}", name) })
}

fn param_u64(params: &Value, name: &str) -> Result<u64, APIError> {
	params
		.get(name)
		.and_then(|v| v.as_u64())
		.ok_or_else(|| APIError::APIMisuseError { err: format!("missing parameter: {}", name) })
}

fn param_pubkey(params: &Value, name: &str) -> Result<PublicKey, APIError> {
	let raw = param_str(params, name)?;
	PublicKey::from_str(raw)
		.map_err(|_| APIError::APIMisuseError { err: format!("invalid node id: {}", raw) })
}

/// Dispatches one control request. Methods:
///
/// * `hc-list`: every hosted channel, as JSON.
/// * `hc-channel {peer_node_id}`: one channel.
/// * `hc-invoke {peer_node_id, refund_script, secret?}`: ask a host for a channel (client side).
/// * `hc-resize {peer_node_id, new_capacity_sat}`: ask the host to grow a channel (client side).
/// * `hc-override {peer_node_id, new_local_balance_msat}`: propose a forced reset (host side).
/// * `hc-accept-override {peer_node_id}`: accept a host's proposed reset (client side).
/// * `hc-close {peer_node_id}`: forget a channel entirely.
/// * `hc-branding`: the branding we serve to clients.
pub fn handle_request<K: Deref, N: Deref, L: Deref>(
	master: &ChannelMaster<K, N, L>, method: &str, params: &Value,
) -> Result<Value, APIError>
where
	K::Target: KVStoreSync,
	N::Target: NodeInterface,
	L::Target: Logger,
{
	match method {
		"hc-list" => Ok(json!(master.list_channels_json())),
		"hc-channel" => {
			let peer = param_pubkey(params, "peer_node_id")?;
			master
				.channel_json(&peer)
				.ok_or_else(|| APIError::ChannelUnavailable { err: "no such channel".into() })
		},
		"hc-invoke" => {
			let peer = param_pubkey(params, "peer_node_id")?;
			let script_hex = param_str(params, "refund_script")?;
			let refund_script = ScriptBuf::from_hex(script_hex).map_err(|_| {
				APIError::APIMisuseError { err: "invalid refund_script hex".into() }
			})?;
			let secret = match params.get("secret").and_then(|v| v.as_str()) {
				Some(secret_hex) => Vec::<u8>::from_hex(secret_hex).map_err(|_| {
					APIError::APIMisuseError { err: "invalid secret hex".into() }
				})?,
				None => Vec::new(),
			};
			master.invoke_channel(peer, refund_script, secret)?;
			Ok(json!({ "ok": true }))
		},
		"hc-resize" => {
			let peer = param_pubkey(params, "peer_node_id")?;
			let new_capacity_sat = param_u64(params, "new_capacity_sat")?;
			master.resize_channel(peer, new_capacity_sat)?;
			Ok(json!({ "ok": true }))
		},
		"hc-override" => {
			let peer = param_pubkey(params, "peer_node_id")?;
			let new_local_balance_msat = param_u64(params, "new_local_balance_msat")?;
			master.override_channel(peer, new_local_balance_msat)?;
			Ok(json!({ "ok": true }))
		},
		"hc-accept-override" => {
			let peer = param_pubkey(params, "peer_node_id")?;
			master.accept_override(peer)?;
			Ok(json!({ "ok": true }))
		},
		"hc-close" => {
			let peer = param_pubkey(params, "peer_node_id")?;
			master.close_channel(peer)?;
			Ok(json!({ "ok": true }))
		},
		"hc-branding" => Ok(master.branding_json()),
		_ => Err(APIError::APIMisuseError { err: format!("unknown method: {}", method) }),
	}
}
