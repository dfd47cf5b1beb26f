// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Mapping between the hosted-channel custom-message tag range and the message structs in
//! [`msgs`].
//!
//! Hosted channels ride on the host node's custom peer-message facility, so a message travels as
//! a `(tag, payload)` pair; [`read`] turns such a pair back into a [`Message`]. The protocol
//! keeps to the top of the odd custom range, with a handful of even tags for replies and the
//! wrapped BOLT #2/#7 messages re-tagged below the hosted-channel control messages.
//!
//! [`msgs`]: crate::hosted::msgs

use crate::hosted::msgs::{self, DecodeError};
use crate::util::ser::{Readable, Writeable};

use std::io::Read;

/// A decoded hosted-channel peer message, or the tag of one we did not recognize.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Message {
	InvokeHostedChannel(msgs::InvokeHostedChannel),
	InitHostedChannel(msgs::InitHostedChannel),
	LastCrossSignedState(msgs::LastCrossSignedState),
	StateUpdate(msgs::StateUpdate),
	StateOverride(msgs::StateOverride),
	HostedChannelBranding(msgs::HostedChannelBranding),
	AnnouncementSignature(msgs::AnnouncementSignature),
	ResizeChannel(msgs::ResizeChannel),
	QueryPublicHostedChannels(msgs::QueryPublicHostedChannels),
	ReplyPublicHostedChannelsEnd(msgs::ReplyPublicHostedChannelsEnd),
	QueryPreimages(msgs::QueryPreimages),
	ReplyPreimages(msgs::ReplyPreimages),
	AskBrandingInfo(msgs::AskBrandingInfo),
	Error(msgs::ErrorMessage),
	UpdateAddHTLC(msgs::UpdateAddHTLC),
	UpdateFulfillHTLC(msgs::UpdateFulfillHTLC),
	UpdateFailHTLC(msgs::UpdateFailHTLC),
	UpdateFailMalformedHTLC(msgs::UpdateFailMalformedHTLC),
	ChannelUpdate(msgs::ChannelUpdate),
	ChannelAnnouncement(msgs::ChannelAnnouncement),
	/// A message within our tag range whose tag we do not know. Ignored rather than fatal so the
	/// protocol can grow.
	Unknown(u16),
}

/// Defines a type identifying a message payload within the hosted-channel tag range.
pub(crate) trait Encode {
	/// The type identifying the message payload.
	const TYPE: u16;
}

impl Encode for msgs::InvokeHostedChannel {
	const TYPE: u16 = 65535;
}
impl Encode for msgs::InitHostedChannel {
	const TYPE: u16 = 65533;
}
impl Encode for msgs::LastCrossSignedState {
	const TYPE: u16 = 65531;
}
impl Encode for msgs::StateUpdate {
	const TYPE: u16 = 65529;
}
impl Encode for msgs::StateOverride {
	const TYPE: u16 = 65527;
}
impl Encode for msgs::HostedChannelBranding {
	const TYPE: u16 = 65525;
}
impl Encode for msgs::AnnouncementSignature {
	const TYPE: u16 = 65523;
}
impl Encode for msgs::ResizeChannel {
	const TYPE: u16 = 65521;
}
impl Encode for msgs::QueryPublicHostedChannels {
	const TYPE: u16 = 65519;
}
impl Encode for msgs::ReplyPublicHostedChannelsEnd {
	const TYPE: u16 = 65518;
}
impl Encode for msgs::QueryPreimages {
	const TYPE: u16 = 65517;
}
impl Encode for msgs::ReplyPreimages {
	const TYPE: u16 = 65516;
}
impl Encode for msgs::AskBrandingInfo {
	const TYPE: u16 = 65515;
}
impl Encode for msgs::ErrorMessage {
	const TYPE: u16 = 65513;
}
impl Encode for msgs::UpdateAddHTLC {
	const TYPE: u16 = 65511;
}
impl Encode for msgs::UpdateFulfillHTLC {
	const TYPE: u16 = 65509;
}
impl Encode for msgs::UpdateFailHTLC {
	const TYPE: u16 = 65507;
}
impl Encode for msgs::UpdateFailMalformedHTLC {
	const TYPE: u16 = 65505;
}
impl Encode for msgs::ChannelUpdate {
	const TYPE: u16 = 65503;
}
impl Encode for msgs::ChannelAnnouncement {
	const TYPE: u16 = 65501;
}

/// The lowest tag the plugin claims. Anything from here through 65535 is ours.
pub const HOSTED_TAG_FLOOR: u16 = 65501;

/// Returns whether a custom-message tag belongs to the hosted-channel protocol and should be
/// routed to the plugin.
pub fn is_hosted_tag(tag: u16) -> bool {
	tag >= HOSTED_TAG_FLOOR
}

impl Message {
	/// Returns the tag used to encode the message payload.
	pub fn type_id(&self) -> u16 {
		match self {
			&Message::InvokeHostedChannel(_) => msgs::InvokeHostedChannel::TYPE,
			&Message::InitHostedChannel(_) => msgs::InitHostedChannel::TYPE,
			&Message::LastCrossSignedState(_) => msgs::LastCrossSignedState::TYPE,
			&Message::StateUpdate(_) => msgs::StateUpdate::TYPE,
			&Message::StateOverride(_) => msgs::StateOverride::TYPE,
			&Message::HostedChannelBranding(_) => msgs::HostedChannelBranding::TYPE,
			&Message::AnnouncementSignature(_) => msgs::AnnouncementSignature::TYPE,
			&Message::ResizeChannel(_) => msgs::ResizeChannel::TYPE,
			&Message::QueryPublicHostedChannels(_) => msgs::QueryPublicHostedChannels::TYPE,
			&Message::ReplyPublicHostedChannelsEnd(_) => msgs::ReplyPublicHostedChannelsEnd::TYPE,
			&Message::QueryPreimages(_) => msgs::QueryPreimages::TYPE,
			&Message::ReplyPreimages(_) => msgs::ReplyPreimages::TYPE,
			&Message::AskBrandingInfo(_) => msgs::AskBrandingInfo::TYPE,
			&Message::Error(_) => msgs::ErrorMessage::TYPE,
			&Message::UpdateAddHTLC(_) => msgs::UpdateAddHTLC::TYPE,
			&Message::UpdateFulfillHTLC(_) => msgs::UpdateFulfillHTLC::TYPE,
			&Message::UpdateFailHTLC(_) => msgs::UpdateFailHTLC::TYPE,
			&Message::UpdateFailMalformedHTLC(_) => msgs::UpdateFailMalformedHTLC::TYPE,
			&Message::ChannelUpdate(_) => msgs::ChannelUpdate::TYPE,
			&Message::ChannelAnnouncement(_) => msgs::ChannelAnnouncement::TYPE,
			&Message::Unknown(tag) => tag,
		}
	}

	/// Serializes the message payload (without its tag, which travels separately in the host
	/// node's custom-message envelope).
	pub fn encode_payload(&self) -> Vec<u8> {
		match self {
			&Message::InvokeHostedChannel(ref msg) => msg.encode(),
			&Message::InitHostedChannel(ref msg) => msg.encode(),
			&Message::LastCrossSignedState(ref msg) => msg.encode(),
			&Message::StateUpdate(ref msg) => msg.encode(),
			&Message::StateOverride(ref msg) => msg.encode(),
			&Message::HostedChannelBranding(ref msg) => msg.encode(),
			&Message::AnnouncementSignature(ref msg) => msg.encode(),
			&Message::ResizeChannel(ref msg) => msg.encode(),
			&Message::QueryPublicHostedChannels(ref msg) => msg.encode(),
			&Message::ReplyPublicHostedChannelsEnd(ref msg) => msg.encode(),
			&Message::QueryPreimages(ref msg) => msg.encode(),
			&Message::ReplyPreimages(ref msg) => msg.encode(),
			&Message::AskBrandingInfo(ref msg) => msg.encode(),
			&Message::Error(ref msg) => msg.encode(),
			&Message::UpdateAddHTLC(ref msg) => msg.encode(),
			&Message::UpdateFulfillHTLC(ref msg) => msg.encode(),
			&Message::UpdateFailHTLC(ref msg) => msg.encode(),
			&Message::UpdateFailMalformedHTLC(ref msg) => msg.encode(),
			&Message::ChannelUpdate(ref msg) => msg.encode(),
			&Message::ChannelAnnouncement(ref msg) => msg.encode(),
			&Message::Unknown(_) => Vec::new(),
		}
	}

	/// Whether a client may send this to its host.
	pub fn is_client_to_host(&self) -> bool {
		match self {
			&Message::InvokeHostedChannel(_)
			| &Message::ResizeChannel(_)
			| &Message::AskBrandingInfo(_) => true,
			&Message::InitHostedChannel(_)
			| &Message::StateOverride(_)
			| &Message::HostedChannelBranding(_) => false,
			_ => true,
		}
	}

	/// Whether a host may send this to one of its clients.
	pub fn is_host_to_client(&self) -> bool {
		match self {
			&Message::InitHostedChannel(_)
			| &Message::StateOverride(_)
			| &Message::HostedChannelBranding(_) => true,
			&Message::InvokeHostedChannel(_)
			| &Message::ResizeChannel(_)
			| &Message::AskBrandingInfo(_) => false,
			_ => true,
		}
	}

	/// Whether this message belongs to the public-hosted-channel gossip subprotocol.
	pub fn is_gossip(&self) -> bool {
		match self {
			&Message::AnnouncementSignature(_)
			| &Message::QueryPublicHostedChannels(_)
			| &Message::ReplyPublicHostedChannelsEnd(_)
			| &Message::ChannelUpdate(_)
			| &Message::ChannelAnnouncement(_) => true,
			_ => false,
		}
	}
}

/// Decodes the payload of a custom message with the given tag.
///
/// Tags outside the hosted range and unknown tags inside it both come back as
/// [`Message::Unknown`]; only a recognized tag with a malformed payload is an error.
pub fn read<R: Read>(tag: u16, payload: &mut R) -> Result<Message, DecodeError> {
	match tag {
		msgs::InvokeHostedChannel::TYPE => {
			Ok(Message::InvokeHostedChannel(Readable::read(payload)?))
		},
		msgs::InitHostedChannel::TYPE => Ok(Message::InitHostedChannel(Readable::read(payload)?)),
		msgs::LastCrossSignedState::TYPE => {
			Ok(Message::LastCrossSignedState(Readable::read(payload)?))
		},
		msgs::StateUpdate::TYPE => Ok(Message::StateUpdate(Readable::read(payload)?)),
		msgs::StateOverride::TYPE => Ok(Message::StateOverride(Readable::read(payload)?)),
		msgs::HostedChannelBranding::TYPE => {
			Ok(Message::HostedChannelBranding(Readable::read(payload)?))
		},
		msgs::AnnouncementSignature::TYPE => {
			Ok(Message::AnnouncementSignature(Readable::read(payload)?))
		},
		msgs::ResizeChannel::TYPE => Ok(Message::ResizeChannel(Readable::read(payload)?)),
		msgs::QueryPublicHostedChannels::TYPE => {
			Ok(Message::QueryPublicHostedChannels(Readable::read(payload)?))
		},
		msgs::ReplyPublicHostedChannelsEnd::TYPE => {
			Ok(Message::ReplyPublicHostedChannelsEnd(Readable::read(payload)?))
		},
		msgs::QueryPreimages::TYPE => Ok(Message::QueryPreimages(Readable::read(payload)?)),
		msgs::ReplyPreimages::TYPE => Ok(Message::ReplyPreimages(Readable::read(payload)?)),
		msgs::AskBrandingInfo::TYPE => Ok(Message::AskBrandingInfo(Readable::read(payload)?)),
		msgs::ErrorMessage::TYPE => Ok(Message::Error(Readable::read(payload)?)),
		msgs::UpdateAddHTLC::TYPE => Ok(Message::UpdateAddHTLC(Readable::read(payload)?)),
		msgs::UpdateFulfillHTLC::TYPE => Ok(Message::UpdateFulfillHTLC(Readable::read(payload)?)),
		msgs::UpdateFailHTLC::TYPE => Ok(Message::UpdateFailHTLC(Readable::read(payload)?)),
		msgs::UpdateFailMalformedHTLC::TYPE => {
			Ok(Message::UpdateFailMalformedHTLC(Readable::read(payload)?))
		},
		msgs::ChannelUpdate::TYPE => Ok(Message::ChannelUpdate(Readable::read(payload)?)),
		msgs::ChannelAnnouncement::TYPE => {
			Ok(Message::ChannelAnnouncement(Readable::read(payload)?))
		},
		_ => Ok(Message::Unknown(tag)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::hosted::msgs::{AskBrandingInfo, StateUpdate};

	use bitcoin::hashes::{sha256, Hash};
	use bitcoin::secp256k1::{Message as SecpMessage, Secp256k1, SecretKey};
	use bitcoin::BlockHash;

	use std::io::Cursor;

	#[test]
	fn tag_range_is_ours() {
		assert!(is_hosted_tag(65535));
		assert!(is_hosted_tag(65501));
		assert!(!is_hosted_tag(65499));
		assert!(!is_hosted_tag(32768));
	}

	#[test]
	fn round_trips_through_tag_dispatch() {
		let secp = Secp256k1::new();
		let sk = SecretKey::from_slice(&[5; 32]).unwrap();
		let msg = Message::StateUpdate(StateUpdate {
			block_day: 19_000,
			local_updates: 2,
			remote_updates: 5,
			local_sig_of_remote_lcss: secp.sign_ecdsa(&SecpMessage::from_digest([3; 32]), &sk),
		});
		let payload = msg.encode_payload();
		let decoded = read(msg.type_id(), &mut Cursor::new(&payload)).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn unknown_tags_are_tolerated() {
		let decoded = read(65530, &mut Cursor::new(&[1, 2, 3])).unwrap();
		assert_eq!(decoded, Message::Unknown(65530));
	}

	#[test]
	fn directions() {
		let ask = Message::AskBrandingInfo(AskBrandingInfo {
			chain_hash: BlockHash::from_byte_array(sha256::Hash::hash(b"x").to_byte_array()),
		});
		assert!(ask.is_client_to_host());
		assert!(!ask.is_host_to_client());
		assert!(!ask.is_gossip());
	}
}
