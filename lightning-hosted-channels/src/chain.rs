// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Traits and types abstracting the underlying Lightning node and its view of the chain.
//!
//! The plugin never talks to the network or the chain itself: everything flows through
//! [`NodeInterface`]. Inbound dispatch (peer messages, intercepted HTLCs, node-side payment
//! results) flows the other way, as [`PluginEvent`]s fed into the event loop.
//!
//! [`PluginEvent`]: crate::plugin::PluginEvent

use crate::hosted::msgs::{OnionPacket, PaymentHash, PaymentPreimage};

use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::{Block, BlockHash};

/// Globally identifies one HTLC leg: which channel it rides on and its id there.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct HtlcIdentifier {
	/// The channel carrying the HTLC.
	pub short_channel_id: u64,
	/// The HTLC's sender-assigned id within that channel.
	pub htlc_id: u64,
}

impl_writeable!(HtlcIdentifier, { short_channel_id, htlc_id });

/// What the host node found when peeling one layer off an onion for us.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardingInfo {
	/// The channel the payment wants to traverse next.
	pub next_short_channel_id: u64,
	/// The value to forward, in millisatoshi.
	pub amount_to_forward_msat: u64,
	/// The CLTV expiry the outgoing HTLC must carry.
	pub outgoing_cltv: u32,
	/// The onion to hand to the next hop.
	pub next_onion: OnionPacket,
}

/// What an onion, once peeled, wants to happen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodedOnion {
	/// The payment wants to traverse another channel.
	Forward(ForwardingInfo),
	/// The payment terminates at this node; the node decides whether to claim it (an invoice it
	/// knows) and reports back through a payment-result event.
	Receive,
}

/// Why the host node could not peel an onion for us.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnionDecodeFailure {
	/// BOLT #4 failure code to relay, BADONION bit included.
	pub failure_code: u16,
	/// SHA256 of the offending onion, relayed so the payer can verify.
	pub sha256_of_onion: [u8; 32],
}

/// How an HTLC previously handed to the plugin by the node should be settled on the node side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InterceptResolution {
	/// Not ours: let the node handle the HTLC as it normally would.
	Continue,
	/// Claim the HTLC with its preimage.
	Fulfill(PaymentPreimage),
	/// Fail the HTLC with an encrypted reason blob.
	Fail(Vec<u8>),
	/// Fail the HTLC reporting a malformed onion.
	FailMalformed {
		/// SHA256 of the onion we could not process.
		sha256_of_onion: [u8; 32],
		/// BOLT #4 failure code, BADONION bit included.
		failure_code: u16,
	},
}

/// The terminal outcome of an HTLC leg, hosted or node-side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaymentResult {
	/// The HTLC was fulfilled with this preimage.
	Fulfilled(PaymentPreimage),
	/// The HTLC failed with an (opaque, possibly empty) reason blob.
	Failed(Vec<u8>),
}

/// The driver all plugin components use to reach the underlying Lightning node.
///
/// Methods must not block for network round trips any longer than the node's own RPC does: the
/// whole plugin runs on one cooperative loop. Message sends are fire-and-forget; delivery is the
/// node's problem, and a disconnected peer simply surfaces later as a peer-disconnect event.
pub trait NodeInterface {
	/// Sends a custom (odd-range) peer message. Best effort, no delivery receipt.
	fn send_custom_message(&self, peer: &PublicKey, tag: u16, payload: Vec<u8>);
	/// Returns the current chain tip height.
	fn get_current_block(&self) -> u32;
	/// Returns the genesis hash of the chain the node runs on.
	fn get_chain_hash(&self) -> BlockHash;
	/// Returns a full block at the given height, if the node has it. Used by the preimage
	/// catcher; a `None` is fine and simply skips the scan for that block.
	fn get_block(&self, height: u32) -> Option<Block>;
	/// Asks the node to peel one layer off `onion` for the HTLC with the given hash.
	fn decrypt_onion(
		&self, onion: &OnionPacket, payment_hash: &PaymentHash,
	) -> Result<DecodedOnion, OnionDecodeFailure>;
	/// Hands an outgoing HTLC leg to the node for routing beyond the plugin. The terminal result
	/// must be fed back as a node-payment-result event carrying `incoming`.
	fn forward_htlc(
		&self, incoming: HtlcIdentifier, payment_hash: PaymentHash, hop: ForwardingInfo,
	);
	/// Hands the node an HTLC that terminates at it (a payment into one of its invoices, riding
	/// in over a hosted channel). The claim-or-reject decision must be fed back as a
	/// node-payment-result event carrying `incoming`.
	fn receive_htlc(&self, incoming: HtlcIdentifier, payment_hash: PaymentHash, amount_msat: u64);
	/// Settles an HTLC the node previously intercepted toward one of our hosted channels.
	fn resolve_intercepted_htlc(&self, htlc: HtlcIdentifier, resolution: InterceptResolution);
	/// The node's identity public key.
	fn node_id(&self) -> PublicKey;
	/// The node's identity secret key, used to sign hosted-channel states.
	fn node_secret(&self) -> SecretKey;
}
