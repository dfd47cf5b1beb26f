// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Deterministic channel identifiers for hosted channels.
//!
//! There is no funding transaction to anchor an id to, so both identifiers are derived from the
//! two endpoint node ids, ordered lexicographically so host and client compute identical values:
//! the channel id is `SHA256(lesser_node_id || greater_node_id)` and the short channel id is the
//! first eight bytes of that hash, big-endian.

use crate::hosted::msgs::ChannelId;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::PublicKey;

fn ordered_concat(a: &PublicKey, b: &PublicKey) -> [u8; 66] {
	let (first, second) =
		if a.serialize() <= b.serialize() { (a, b) } else { (b, a) };
	let mut buf = [0u8; 66];
	buf[..33].copy_from_slice(&first.serialize());
	buf[33..].copy_from_slice(&second.serialize());
	buf
}

/// Derives the 32-byte channel id shared by the two endpoints.
pub fn hosted_channel_id(a: &PublicKey, b: &PublicKey) -> ChannelId {
	ChannelId(sha256::Hash::hash(&ordered_concat(a, b)).to_byte_array())
}

/// Derives the short channel id shared by the two endpoints.
pub fn hosted_short_channel_id(a: &PublicKey, b: &PublicKey) -> u64 {
	let hash = sha256::Hash::hash(&ordered_concat(a, b)).to_byte_array();
	let mut scid_bytes = [0u8; 8];
	scid_bytes.copy_from_slice(&hash[..8]);
	u64::from_be_bytes(scid_bytes)
}

#[cfg(test)]
mod tests {
	use super::*;
	use bitcoin::secp256k1::{Secp256k1, SecretKey};

	#[test]
	fn symmetric_and_distinct() {
		let secp = Secp256k1::new();
		let a = SecretKey::from_slice(&[1; 32]).unwrap().public_key(&secp);
		let b = SecretKey::from_slice(&[2; 32]).unwrap().public_key(&secp);
		let c = SecretKey::from_slice(&[3; 32]).unwrap().public_key(&secp);

		assert_eq!(hosted_channel_id(&a, &b), hosted_channel_id(&b, &a));
		assert_eq!(hosted_short_channel_id(&a, &b), hosted_short_channel_id(&b, &a));
		assert_ne!(hosted_channel_id(&a, &b), hosted_channel_id(&a, &c));
		assert_ne!(hosted_short_channel_id(&a, &b), hosted_short_channel_id(&b, &c));
	}
}
