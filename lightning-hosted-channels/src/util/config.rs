// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Configuration knobs for the hosted-channels plugin.

/// Optional branding served to clients which send us an `AskBrandingInfo` message.
#[derive(Clone, Debug, PartialEq)]
pub struct BrandingConfig {
	/// RGB color clients may use when displaying channels with this host.
	pub rgb_color: [u8; 3],
	/// A contact string (URL, email, nothing enforced) shown to clients.
	pub contact_info: String,
	/// Raw PNG bytes of a host icon, if any. Kept small: it travels in a peer message.
	pub png_icon: Option<Vec<u8>>,
}

/// Top-level configuration of the plugin.
///
/// Default::default() provides sane host-side defaults; clients mostly care about
/// [`cltv_safety_delta`].
///
/// [`cltv_safety_delta`]: HostedChannelConfig::cltv_safety_delta
#[derive(Clone, Debug, PartialEq)]
pub struct HostedChannelConfig {
	/// Whether we hand out new hosted channels to invoking clients at all. Existing channels are
	/// always re-established.
	///
	/// Default value: true.
	pub accept_new_clients: bool,
	/// If set, an invoking client must present exactly these bytes in the `secret` field of its
	/// `InvokeHostedChannel` for a new channel to be granted. Invite-only operation.
	///
	/// Default value: None.
	pub required_invoke_secret: Option<Vec<u8>>,
	/// Capacity, in millisatoshi, of newly granted hosted channels.
	///
	/// Default value: 1_000_000_000 msat (0.01 BTC).
	pub default_capacity_msat: u64,
	/// The smallest HTLC we accept in a hosted channel, in millisatoshi.
	///
	/// Default value: 1_000 msat.
	pub htlc_minimum_msat: u64,
	/// How many concurrent in-flight HTLCs (both directions summed) we allow per channel.
	///
	/// Default value: 30.
	pub max_accepted_htlcs: u16,
	/// The largest sum of in-flight HTLC millisatoshi we allow per channel.
	///
	/// Default value: 500_000_000 msat.
	pub max_htlc_value_in_flight_msat: u64,
	/// Balance, in millisatoshi, granted to a new client for free. Almost always zero.
	///
	/// Default value: 0.
	pub initial_client_balance_msat: u64,
	/// How many blocks before an outgoing HTLC's CLTV expiry we give up on the peer resolving
	/// it, suspend the channel and fail upstream. Never make this so small that an unresponsive
	/// peer can cost you the upstream timeout race.
	///
	/// Default value: 72.
	pub cltv_safety_delta: u32,
	/// How many times we re-send our pending updates plus a fresh `StateUpdate` on a state
	/// counter mismatch before declaring the channel broken.
	///
	/// Default value: 3.
	pub max_reconcile_attempts: u8,
	/// The `cltv_expiry_delta` we advertise in `channel_update`s for our hosted channels.
	///
	/// Default value: 144.
	pub cltv_expiry_delta: u16,
	/// The base fee we advertise in `channel_update`s for our hosted channels, in millisatoshi.
	///
	/// Default value: 1_000 msat.
	pub fee_base_msat: u32,
	/// The proportional fee we advertise in `channel_update`s, in millionths.
	///
	/// Default value: 100.
	pub fee_proportional_millionths: u32,
	/// Branding served to clients asking for it. None disables branding replies.
	///
	/// Default value: None.
	pub branding: Option<BrandingConfig>,
}

impl Default for HostedChannelConfig {
	fn default() -> Self {
		HostedChannelConfig {
			accept_new_clients: true,
			required_invoke_secret: None,
			default_capacity_msat: 1_000_000_000,
			htlc_minimum_msat: 1_000,
			max_accepted_htlcs: 30,
			max_htlc_value_in_flight_msat: 500_000_000,
			initial_client_balance_msat: 0,
			cltv_safety_delta: 72,
			max_reconcile_attempts: 3,
			cltv_expiry_delta: 144,
			fee_base_msat: 1_000,
			fee_proportional_millionths: 100,
			branding: None,
		}
	}
}
