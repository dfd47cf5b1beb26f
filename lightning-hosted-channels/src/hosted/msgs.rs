// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Wire messages of the hosted-channel protocol and the signed material derived from them.
//!
//! Every message has a single canonical encoding, produced and consumed through
//! [`Writeable`]/[`Readable`]. The [`LastCrossSignedState`] additionally has a fixed-layout *sig
//! material* buffer (little-endian fields, no length prefixes beyond those inside the embedded
//! BOLT #2 HTLCs) whose SHA256 both parties sign; see [`LastCrossSignedState::sig_hash`].

use crate::util::ser::{Readable, Writeable, Writer};

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey, Signing, Verification};
use bitcoin::{BlockHash, ScriptBuf};

use std::fmt;
use std::io::{self, Read};

/// An error in decoding a message or struct.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
	/// Value was invalid, e.g. a byte which was supposed to be a bool was something other than a
	/// 0 or 1, a public key/signature was invalid, text wasn't UTF-8, etc.
	InvalidValue,
	/// The buffer ended before the full message was read.
	ShortRead,
	/// Error from [`std::io`].
	Io(io::ErrorKind),
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			DecodeError::InvalidValue => f.write_str("invalid value in a message"),
			DecodeError::ShortRead => f.write_str("message ran out of data"),
			DecodeError::Io(ref e) => fmt::Debug::fmt(e, f),
		}
	}
}

impl std::error::Error for DecodeError {}

impl From<io::Error> for DecodeError {
	fn from(e: io::Error) -> Self {
		if e.kind() == io::ErrorKind::UnexpectedEof {
			DecodeError::ShortRead
		} else {
			DecodeError::Io(e.kind())
		}
	}
}

/// The hash of a payment, whose preimage unlocks all HTLCs carrying it.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PaymentHash(pub [u8; 32]);
/// The 32-byte secret proving a payment happened; its SHA256 is the [`PaymentHash`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PaymentPreimage(pub [u8; 32]);

impl PaymentPreimage {
	/// Hashes this preimage into its payment hash.
	pub fn payment_hash(&self) -> PaymentHash {
		PaymentHash(sha256::Hash::hash(&self.0).to_byte_array())
	}
}

impl fmt::Display for PaymentHash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		for i in self.0.iter() {
			write!(f, "{:02x}", i)?;
		}
		Ok(())
	}
}

/// A unique 32-byte identifier for a channel, derived from the two endpoint node ids for hosted
/// channels (see [`crate::hosted::scid`]).
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChannelId(pub [u8; 32]);

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		for i in self.0.iter() {
			write!(f, "{:02x}", i)?;
		}
		Ok(())
	}
}

macro_rules! impl_writeable_32_byte_newtype {
	($st:ident) => {
		impl Writeable for $st {
			fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
				self.0.write(w)
			}
		}
		impl Readable for $st {
			fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
				Ok($st(Readable::read(r)?))
			}
		}
	};
}

impl_writeable_32_byte_newtype!(PaymentHash);
impl_writeable_32_byte_newtype!(PaymentPreimage);
impl_writeable_32_byte_newtype!(ChannelId);

/// BOLT #4 onion packet, carried opaquely: the plugin never peels onions itself, the host node
/// does.
#[derive(Clone, PartialEq, Eq)]
pub struct OnionPacket {
	/// BOLT #4 version number.
	pub version: u8,
	/// The ephemeral public key used to derive the shared secret for this hop.
	pub public_key: PublicKey,
	/// 1300 bytes of encrypted, layered routing data.
	pub hop_data: [u8; 1300],
	/// HMAC over the packet.
	pub hmac: [u8; 32],
}

impl fmt::Debug for OnionPacket {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "OnionPacket version {} with hmac {:?}", self.version, &self.hmac[..])
	}
}

impl_writeable!(OnionPacket, { version, public_key, hop_data, hmac });

/// A client's request to open (or re-establish) a hosted channel with a host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvokeHostedChannel {
	/// Genesis hash of the chain both sides must agree on.
	pub chain_hash: BlockHash,
	/// The client's on-chain refund destination, immutable once the channel is cross-signed.
	pub refund_script_pubkey: ScriptBuf,
	/// Opaque bytes a host may require to gate new channels (invite codes). May be empty.
	pub secret: Vec<u8>,
}

impl_writeable!(InvokeHostedChannel, { chain_hash, refund_script_pubkey, secret });

/// The host's channel terms, sent in response to a new [`InvokeHostedChannel`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitHostedChannel {
	/// The largest sum of in-flight HTLC millisatoshi the host tolerates.
	pub max_htlc_value_in_flight_msat: u64,
	/// The smallest HTLC the host accepts, in millisatoshi.
	pub htlc_minimum_msat: u64,
	/// How many concurrent in-flight HTLCs (both directions summed) the host tolerates.
	pub max_accepted_htlcs: u16,
	/// Total channel capacity in millisatoshi. Local plus remote balance always equals this.
	pub channel_capacity_msat: u64,
	/// Millisatoshi granted to the client at opening. Almost always zero.
	pub initial_client_balance_msat: u64,
	/// Feature bits for protocol extensions. Unknown bits are ignored.
	pub features: Vec<u8>,
}

impl_writeable!(InitHostedChannel, {
	max_htlc_value_in_flight_msat,
	htlc_minimum_msat,
	max_accepted_htlcs,
	channel_capacity_msat,
	initial_client_balance_msat,
	features
});

/// The canonical, cross-signed channel state. Everything in a hosted channel revolves around
/// agreeing on, signing and exchanging this object.
///
/// An LCSS is always expressed from the point of view of one side: `local_*` fields are that
/// side's, `incoming_htlcs` flow toward it. [`Self::reverse`] produces the peer's view of the
/// identical state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastCrossSignedState {
	/// Whether the expressing side is the host.
	pub is_host: bool,
	/// The client's on-chain refund destination.
	pub refund_script_pubkey: ScriptBuf,
	/// The channel terms fixed at opening (capacity may grow through a resize).
	pub init_hosted_channel: InitHostedChannel,
	/// Block height divided by 144 at signing time; bounds how stale a state can be.
	pub block_day: u32,
	/// This side's spendable balance in millisatoshi.
	pub local_balance_msat: u64,
	/// The peer's spendable balance in millisatoshi.
	pub remote_balance_msat: u64,
	/// How many updates this side has contributed over the channel's lifetime.
	pub local_updates: u32,
	/// How many updates the peer has contributed over the channel's lifetime.
	pub remote_updates: u32,
	/// In-flight HTLCs offered by the peer to this side.
	pub incoming_htlcs: Vec<UpdateAddHTLC>,
	/// In-flight HTLCs offered by this side to the peer.
	pub outgoing_htlcs: Vec<UpdateAddHTLC>,
	/// The peer's signature over this view's [`sig_hash`](Self::sig_hash).
	pub remote_sig_of_local: Signature,
	/// This side's signature over the reversed view's [`sig_hash`](Self::sig_hash).
	pub local_sig_of_remote: Signature,
}

impl_writeable!(LastCrossSignedState, {
	is_host,
	refund_script_pubkey,
	init_hosted_channel,
	block_day,
	local_balance_msat,
	remote_balance_msat,
	local_updates,
	remote_updates,
	incoming_htlcs,
	outgoing_htlcs,
	remote_sig_of_local,
	local_sig_of_remote
});

impl LastCrossSignedState {
	/// The fixed-layout buffer whose SHA256 both parties sign. Little-endian fields, raw script
	/// bytes, embedded HTLCs in their BOLT #2 encoding, a trailing role byte.
	pub(crate) fn sig_material(&self) -> Vec<u8> {
		let mut material = Vec::with_capacity(64 + 1450 * (self.incoming_htlcs.len() + self.outgoing_htlcs.len()));
		material.extend_from_slice(self.refund_script_pubkey.as_bytes());
		material.extend_from_slice(&self.init_hosted_channel.channel_capacity_msat.to_le_bytes());
		material.extend_from_slice(&self.init_hosted_channel.initial_client_balance_msat.to_le_bytes());
		material.extend_from_slice(&self.block_day.to_le_bytes());
		material.extend_from_slice(&self.local_balance_msat.to_le_bytes());
		material.extend_from_slice(&self.remote_balance_msat.to_le_bytes());
		material.extend_from_slice(&self.local_updates.to_le_bytes());
		material.extend_from_slice(&self.remote_updates.to_le_bytes());
		for htlc in self.incoming_htlcs.iter() {
			material.extend_from_slice(&htlc.encode());
		}
		for htlc in self.outgoing_htlcs.iter() {
			material.extend_from_slice(&htlc.encode());
		}
		material.push(if self.is_host { 1 } else { 0 });
		material
	}

	/// The digest both parties sign, for this side's view.
	pub fn sig_hash(&self) -> Message {
		Message::from_digest(sha256::Hash::hash(&self.sig_material()).to_byte_array())
	}

	/// The peer's view of the identical state: roles, balances, update counters, HTLC directions
	/// and signatures all swapped.
	pub fn reverse(&self) -> LastCrossSignedState {
		LastCrossSignedState {
			is_host: !self.is_host,
			refund_script_pubkey: self.refund_script_pubkey.clone(),
			init_hosted_channel: self.init_hosted_channel.clone(),
			block_day: self.block_day,
			local_balance_msat: self.remote_balance_msat,
			remote_balance_msat: self.local_balance_msat,
			local_updates: self.remote_updates,
			remote_updates: self.local_updates,
			incoming_htlcs: self.outgoing_htlcs.clone(),
			outgoing_htlcs: self.incoming_htlcs.clone(),
			remote_sig_of_local: self.local_sig_of_remote,
			local_sig_of_remote: self.remote_sig_of_local,
		}
	}

	/// Produces the signature this side contributes to a state: over the *reversed* view, since
	/// each party signs the other's attestation.
	pub fn sign_remote_view<C: Signing>(
		&self, secp: &Secp256k1<C>, node_secret: &SecretKey,
	) -> Signature {
		secp.sign_ecdsa(&self.reverse().sig_hash(), node_secret)
	}

	/// Checks the peer's embedded signature over this side's view.
	pub fn verify_remote_sig<C: Verification>(
		&self, secp: &Secp256k1<C>, remote_node_id: &PublicKey,
	) -> bool {
		secp.verify_ecdsa(&self.sig_hash(), &self.remote_sig_of_local, remote_node_id).is_ok()
	}

	/// Checks this side's embedded signature over the peer's view. Mostly useful when receiving a
	/// full LCSS from the peer during re-establishment, where `local` is the *sender's* side.
	pub fn verify_local_sig<C: Verification>(
		&self, secp: &Secp256k1<C>, local_node_id: &PublicKey,
	) -> bool {
		secp.verify_ecdsa(&self.reverse().sig_hash(), &self.local_sig_of_remote, local_node_id)
			.is_ok()
	}

	/// Lifetime update count, used to decide which of two states is newer.
	pub fn total_updates(&self) -> u64 {
		self.local_updates as u64 + self.remote_updates as u64
	}

	/// Checks the structural invariants every at-rest state must satisfy. Returns a peer-facing
	/// error string on violation.
	pub fn check_invariants(&self) -> Result<(), &'static str> {
		let capacity = self.init_hosted_channel.channel_capacity_msat;
		let in_flight: u64 = self
			.incoming_htlcs
			.iter()
			.chain(self.outgoing_htlcs.iter())
			.map(|htlc| htlc.amount_msat)
			.sum();
		// In-flight amounts stay inside the sender's balance until settlement, so the two
		// balances always sum to the full capacity.
		if self.local_balance_msat.checked_add(self.remote_balance_msat) != Some(capacity) {
			return Err("balances do not sum to capacity");
		}
		if self.outgoing_htlcs.iter().map(|htlc| htlc.amount_msat).sum::<u64>() > self.local_balance_msat
			|| self.incoming_htlcs.iter().map(|htlc| htlc.amount_msat).sum::<u64>() > self.remote_balance_msat
		{
			return Err("in-flight htlcs exceed sender balance");
		}
		let htlc_count = self.incoming_htlcs.len() + self.outgoing_htlcs.len();
		if htlc_count > self.init_hosted_channel.max_accepted_htlcs as usize {
			return Err("too many in-flight htlcs");
		}
		if in_flight > self.init_hosted_channel.max_htlc_value_in_flight_msat {
			return Err("too much value in flight");
		}
		for htlc in self.incoming_htlcs.iter().chain(self.outgoing_htlcs.iter()) {
			if htlc.amount_msat < self.init_hosted_channel.htlc_minimum_msat {
				return Err("htlc below minimum");
			}
		}
		Ok(())
	}
}

/// A signed attestation of a candidate next state. Carrying only counters and a signature, both
/// sides must derive the state itself from their update queues.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateUpdate {
	/// Block height / 144 at the sender.
	pub block_day: u32,
	/// Lifetime updates contributed by the sender, as of the candidate state.
	pub local_updates: u32,
	/// Lifetime updates contributed by the receiver, as the sender has seen them.
	pub remote_updates: u32,
	/// Sender's signature over the receiver's view of the candidate state.
	pub local_sig_of_remote_lcss: Signature,
}

impl_writeable!(StateUpdate, { block_day, local_updates, remote_updates, local_sig_of_remote_lcss });

/// A host's proposal to forcibly reset a suspended channel to a clean state with no in-flight
/// HTLCs. Only becomes effective if the client manually countersigns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateOverride {
	/// Block height / 144 at the host.
	pub block_day: u32,
	/// The balance the *sending* side (the host) would hold after the reset.
	pub local_balance_msat: u64,
	/// Update counter the sender proposes for itself.
	pub local_updates: u32,
	/// Update counter the sender proposes for the receiver.
	pub remote_updates: u32,
	/// Sender's signature over the receiver's view of the proposed state.
	pub local_sig_of_remote_lcss: Signature,
}

impl_writeable!(StateOverride, {
	block_day,
	local_balance_msat,
	local_updates,
	remote_updates,
	local_sig_of_remote_lcss
});

/// Cosmetic host information a client may display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostedChannelBranding {
	/// Brand color.
	pub rgb_color: [u8; 3],
	/// Optional PNG icon bytes.
	pub png_icon: Option<Vec<u8>>,
	/// Contact string.
	pub contact_info: String,
}

impl_writeable!(HostedChannelBranding, { rgb_color, png_icon, contact_info });

/// A client's request for [`HostedChannelBranding`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AskBrandingInfo {
	/// Genesis hash of the chain the client is asking about.
	pub chain_hash: BlockHash,
}

impl_writeable!(AskBrandingInfo, { chain_hash });

/// A client's signed request to grow the channel capacity. Growth-only: hosts reject any
/// `new_capacity_sat` at or below the current capacity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResizeChannel {
	/// The proposed new capacity, in satoshi.
	pub new_capacity_sat: u64,
	/// The client's signature over SHA256 of the little-endian encoded new capacity.
	pub client_sig: Signature,
}

impl_writeable!(ResizeChannel, { new_capacity_sat, client_sig });

impl ResizeChannel {
	fn resize_sig_hash(new_capacity_sat: u64) -> Message {
		let digest = sha256::Hash::hash(&new_capacity_sat.to_le_bytes());
		Message::from_digest(digest.to_byte_array())
	}

	/// Builds a signed resize request for the given capacity.
	pub fn sign_new<C: Signing>(
		new_capacity_sat: u64, secp: &Secp256k1<C>, client_secret: &SecretKey,
	) -> ResizeChannel {
		let client_sig = secp.sign_ecdsa(&Self::resize_sig_hash(new_capacity_sat), client_secret);
		ResizeChannel { new_capacity_sat, client_sig }
	}

	/// Checks the client's signature over the proposed capacity.
	pub fn verify<C: Verification>(&self, secp: &Secp256k1<C>, client_node_id: &PublicKey) -> bool {
		secp.verify_ecdsa(&Self::resize_sig_hash(self.new_capacity_sat), &self.client_sig, client_node_id)
			.is_ok()
	}
}

/// A signature over a prospective public channel announcement, exchanged when both sides want
/// their hosted channel gossiped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnouncementSignature {
	/// Signature over the corresponding [`UnsignedChannelAnnouncement`].
	pub channel_announcement_sig: Signature,
	/// Whether the sender expects our signature in return.
	pub wants_reply: bool,
}

impl_writeable!(AnnouncementSignature, { channel_announcement_sig, wants_reply });

/// A request for all public hosted channels a peer knows about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryPublicHostedChannels {
	/// Genesis hash of the chain being queried.
	pub chain_hash: BlockHash,
}

impl_writeable!(QueryPublicHostedChannels, { chain_hash });

/// Marks the end of a batch of public hosted channel gossip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyPublicHostedChannelsEnd {
	/// Genesis hash of the chain that was queried.
	pub chain_hash: BlockHash,
}

impl_writeable!(ReplyPublicHostedChannelsEnd, { chain_hash });

/// A request for any payment preimages the peer knows for the given hashes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryPreimages {
	/// The payment hashes of interest.
	pub hashes: Vec<PaymentHash>,
}

impl_writeable!(QueryPreimages, { hashes });

/// Preimages revealed in response to a [`QueryPreimages`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyPreimages {
	/// The preimages found.
	pub preimages: Vec<PaymentPreimage>,
}

impl_writeable!(ReplyPreimages, { preimages });

/// An error message: the sending side considers the channel broken and has suspended it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMessage {
	/// The channel the error applies to.
	pub channel_id: ChannelId,
	/// A possibly printable reason. Sanitized on read, never trusted.
	pub data: String,
}

impl Writeable for ErrorMessage {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.channel_id.write(w)?;
		self.data.write(w)
	}
}

impl Readable for ErrorMessage {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let channel_id = Readable::read(r)?;
		let raw: Vec<u8> = Readable::read(r)?;
		Ok(ErrorMessage { channel_id, data: String::from_utf8_lossy(&raw).into_owned() })
	}
}

/// An `update_add_htlc` message, bit-for-bit its BOLT #2 layout so both sides can embed the exact
/// bytes in the LCSS sig material.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateAddHTLC {
	/// The channel the HTLC rides on.
	pub channel_id: ChannelId,
	/// The sender-local monotonic HTLC id.
	pub htlc_id: u64,
	/// The HTLC value, in millisatoshi.
	pub amount_msat: u64,
	/// The payment hash locking the HTLC.
	pub payment_hash: PaymentHash,
	/// Block height at which the HTLC expires.
	pub cltv_expiry: u32,
	/// The onion to hand to the next hop.
	pub onion_routing_packet: OnionPacket,
}

impl_writeable!(UpdateAddHTLC, {
	channel_id,
	htlc_id,
	amount_msat,
	payment_hash,
	cltv_expiry,
	onion_routing_packet
});

/// An `update_fulfill_htlc` message, settling an HTLC with its preimage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFulfillHTLC {
	/// The channel the HTLC rides on.
	pub channel_id: ChannelId,
	/// The id the HTLC was added under.
	pub htlc_id: u64,
	/// The preimage matching the HTLC's payment hash.
	pub payment_preimage: PaymentPreimage,
}

impl_writeable!(UpdateFulfillHTLC, { channel_id, htlc_id, payment_preimage });

/// An `update_fail_htlc` message, refusing an HTLC with an encrypted reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFailHTLC {
	/// The channel the HTLC rides on.
	pub channel_id: ChannelId,
	/// The id the HTLC was added under.
	pub htlc_id: u64,
	/// The failure onion, readable only by the payer.
	pub reason: Vec<u8>,
}

impl_writeable!(UpdateFailHTLC, { channel_id, htlc_id, reason });

/// An `update_fail_malformed_htlc` message, refusing an HTLC whose onion we could not process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFailMalformedHTLC {
	/// The channel the HTLC rides on.
	pub channel_id: ChannelId,
	/// The id the HTLC was added under.
	pub htlc_id: u64,
	/// SHA256 of the onion we failed to process, so the sender can verify.
	pub sha256_of_onion: [u8; 32],
	/// BOLT #4 failure code; must have the BADONION bit set.
	pub failure_code: u16,
}

impl_writeable!(UpdateFailMalformedHTLC, { channel_id, htlc_id, sha256_of_onion, failure_code });

/// The unsigned part of a BOLT #7 `channel_update`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnsignedChannelUpdate {
	/// Genesis hash of the chain the channel lives on.
	pub chain_hash: BlockHash,
	/// The channel being updated.
	pub short_channel_id: u64,
	/// Posix timestamp of the update, newer replaces older.
	pub timestamp: u32,
	/// BOLT #7 message flags. Bit 0 signals the presence of `htlc_maximum_msat`, always set here.
	pub message_flags: u8,
	/// BOLT #7 channel flags: direction and disabled bits.
	pub channel_flags: u8,
	/// Blocks a forwarding node requires between an incoming and outgoing HTLC expiry.
	pub cltv_expiry_delta: u16,
	/// The smallest forwardable HTLC, in millisatoshi.
	pub htlc_minimum_msat: u64,
	/// The largest forwardable HTLC, in millisatoshi.
	pub htlc_maximum_msat: u64,
	/// Flat fee charged per forward, in millisatoshi.
	pub fee_base_msat: u32,
	/// Proportional fee charged per forward, in millionths.
	pub fee_proportional_millionths: u32,
}

// htlc_maximum_msat sits at the end of the wire layout, not at its struct position.
impl Writeable for UnsignedChannelUpdate {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.chain_hash.write(w)?;
		self.short_channel_id.write(w)?;
		self.timestamp.write(w)?;
		self.message_flags.write(w)?;
		self.channel_flags.write(w)?;
		self.cltv_expiry_delta.write(w)?;
		self.htlc_minimum_msat.write(w)?;
		self.fee_base_msat.write(w)?;
		self.fee_proportional_millionths.write(w)?;
		self.htlc_maximum_msat.write(w)
	}
}

impl Readable for UnsignedChannelUpdate {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let chain_hash = Readable::read(r)?;
		let short_channel_id = Readable::read(r)?;
		let timestamp = Readable::read(r)?;
		let message_flags = Readable::read(r)?;
		let channel_flags = Readable::read(r)?;
		let cltv_expiry_delta = Readable::read(r)?;
		let htlc_minimum_msat = Readable::read(r)?;
		let fee_base_msat = Readable::read(r)?;
		let fee_proportional_millionths = Readable::read(r)?;
		let htlc_maximum_msat = Readable::read(r)?;
		Ok(UnsignedChannelUpdate {
			chain_hash,
			short_channel_id,
			timestamp,
			message_flags,
			channel_flags,
			cltv_expiry_delta,
			htlc_minimum_msat,
			htlc_maximum_msat,
			fee_base_msat,
			fee_proportional_millionths,
		})
	}
}

/// A signed BOLT #7 `channel_update`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelUpdate {
	/// Signature by the announcing node over SHA256d of the contents.
	pub signature: Signature,
	/// The update itself.
	pub contents: UnsignedChannelUpdate,
}

impl_writeable!(ChannelUpdate, { signature, contents });

/// The unsigned part of a BOLT #7 `channel_announcement`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnsignedChannelAnnouncement {
	/// Feature bits the channel supports.
	pub features: Vec<u8>,
	/// Genesis hash of the chain the channel lives on.
	pub chain_hash: BlockHash,
	/// The channel being announced.
	pub short_channel_id: u64,
	/// The lexicographically lesser endpoint node id.
	pub node_id_1: PublicKey,
	/// The lexicographically greater endpoint node id.
	pub node_id_2: PublicKey,
	/// Funding key of node 1. Hosted channels have no funding output; the node id is repeated.
	pub bitcoin_key_1: PublicKey,
	/// Funding key of node 2. Hosted channels have no funding output; the node id is repeated.
	pub bitcoin_key_2: PublicKey,
}

impl_writeable!(UnsignedChannelAnnouncement, {
	features,
	chain_hash,
	short_channel_id,
	node_id_1,
	node_id_2,
	bitcoin_key_1,
	bitcoin_key_2
});

/// A signed BOLT #7 `channel_announcement`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelAnnouncement {
	/// Signature by node 1 over SHA256d of the contents.
	pub node_signature_1: Signature,
	/// Signature by node 2 over SHA256d of the contents.
	pub node_signature_2: Signature,
	/// Signature by funding key 1; repeats the node signature for hosted channels.
	pub bitcoin_signature_1: Signature,
	/// Signature by funding key 2; repeats the node signature for hosted channels.
	pub bitcoin_signature_2: Signature,
	/// The announcement itself.
	pub contents: UnsignedChannelAnnouncement,
}

impl_writeable!(ChannelAnnouncement, {
	node_signature_1,
	node_signature_2,
	bitcoin_signature_1,
	bitcoin_signature_2,
	contents
});
