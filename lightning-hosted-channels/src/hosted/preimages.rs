// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! On-chain preimage capture for stuck outgoing HTLCs.
//!
//! A hosted channel has no on-chain contract to enforce an HTLC with, so a misbehaving peer
//! could take a payment downstream, claim it there on-chain, and never fulfill toward us. The
//! claim itself gives the secret away though: any script path spending an HTLC output exposes
//! the 32-byte preimage in its witness. We watch every confirmed transaction for witness items
//! that hash to an in-flight outgoing payment hash and treat a match exactly like a peer
//! fulfill, letting the upstream leg settle no matter how unresponsive the peer is.

use crate::chain::HtlcIdentifier;
use crate::hosted::msgs::{PaymentHash, PaymentPreimage};

use bitcoin::hashes::{sha256, Hash};
use bitcoin::{Block, Transaction};

use std::collections::HashMap;

/// A preimage found on chain and the stuck outgoing HTLC leg it unlocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaughtPreimage {
	/// The payment hash the preimage matches.
	pub payment_hash: PaymentHash,
	/// The preimage itself.
	pub payment_preimage: PaymentPreimage,
	/// Where the outgoing HTLC waiting on this preimage lives.
	pub outgoing: HtlcIdentifier,
}

/// Tracks the payment hashes of every in-flight outgoing HTLC across all hosted channels and
/// digs through block witness data for their preimages.
pub struct PreimageCatcher {
	tracked: HashMap<PaymentHash, HtlcIdentifier>,
}

impl PreimageCatcher {
	/// Constructs an empty catcher; [`rebuild`](Self::rebuild) fills it.
	pub fn new() -> Self {
		PreimageCatcher { tracked: HashMap::new() }
	}

	/// Replaces the tracked set with the current cross-channel in-flight outgoing HTLCs.
	pub fn rebuild(&mut self, in_flight: impl Iterator<Item = (PaymentHash, HtlcIdentifier)>) {
		self.tracked.clear();
		for (payment_hash, outgoing) in in_flight {
			self.tracked.insert(payment_hash, outgoing);
		}
	}

	/// How many payment hashes are currently being watched for.
	pub fn tracked_count(&self) -> usize {
		self.tracked.len()
	}

	/// Scans one transaction's witness data. 32-byte witness items are cheap to hash and
	/// anything else cannot be a preimage.
	pub fn scan_transaction(&self, tx: &Transaction) -> Vec<CaughtPreimage> {
		let mut caught = Vec::new();
		for input in tx.input.iter() {
			for item in input.witness.iter() {
				if item.len() != 32 {
					continue;
				}
				let payment_hash = PaymentHash(sha256::Hash::hash(item).to_byte_array());
				if let Some(outgoing) = self.tracked.get(&payment_hash) {
					let mut payment_preimage = [0u8; 32];
					payment_preimage.copy_from_slice(item);
					caught.push(CaughtPreimage {
						payment_hash,
						payment_preimage: PaymentPreimage(payment_preimage),
						outgoing: *outgoing,
					});
				}
			}
		}
		caught
	}

	/// Scans a whole block, deduplicating repeated reveals of the same preimage.
	pub fn scan_block(&self, block: &Block) -> Vec<CaughtPreimage> {
		let mut caught = Vec::new();
		for tx in block.txdata.iter() {
			for found in self.scan_transaction(tx) {
				if !caught.iter().any(|c: &CaughtPreimage| c.payment_hash == found.payment_hash) {
					caught.push(found);
				}
			}
		}
		caught
	}
}
