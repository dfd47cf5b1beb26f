// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use crate::chain::{
	DecodedOnion, ForwardingInfo, HtlcIdentifier, InterceptResolution, NodeInterface,
	OnionDecodeFailure,
};
use crate::hosted::msgs::{OnionPacket, PaymentHash};
use crate::util::logger::{Logger, Record};
use crate::util::persist::KVStoreSync;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{Block, BlockHash, ScriptBuf};

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

pub struct TestLogger {
	pub lines: Mutex<Vec<String>>,
}

impl TestLogger {
	pub fn new() -> Self {
		TestLogger { lines: Mutex::new(Vec::new()) }
	}

	pub fn assert_log_contains(&self, needle: &str) {
		let lines = self.lines.lock().unwrap();
		assert!(
			lines.iter().any(|line| line.contains(needle)),
			"no log line contains {:?}; got {:#?}",
			needle,
			&*lines
		);
	}
}

impl Logger for TestLogger {
	fn log(&self, record: &Record) {
		self.lines
			.lock()
			.unwrap()
			.push(format!("{} {} {}", record.level, record.module_path, record.args));
	}
}

/// An in-memory [`KVStoreSync`], shareable across a simulated restart.
pub struct TestStore {
	entries: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl TestStore {
	pub fn new() -> Self {
		TestStore { entries: Mutex::new(HashMap::new()) }
	}
}

impl KVStoreSync for TestStore {
	fn read(&self, namespace: &str, key: &str) -> Result<Vec<u8>, io::Error> {
		self.entries
			.lock()
			.unwrap()
			.get(&(namespace.to_string(), key.to_string()))
			.cloned()
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such key"))
	}
	fn write(&self, namespace: &str, key: &str, buf: &[u8]) -> Result<(), io::Error> {
		self.entries
			.lock()
			.unwrap()
			.insert((namespace.to_string(), key.to_string()), buf.to_vec());
		Ok(())
	}
	fn remove(&self, namespace: &str, key: &str) -> Result<(), io::Error> {
		self.entries.lock().unwrap().remove(&(namespace.to_string(), key.to_string()));
		Ok(())
	}
	fn list(&self, namespace: &str) -> Result<Vec<String>, io::Error> {
		Ok(self
			.entries
			.lock()
			.unwrap()
			.keys()
			.filter(|(ns, _)| ns == namespace)
			.map(|(_, key)| key.clone())
			.collect())
	}
}

/// The chain hash every test node agrees on.
pub fn test_chain_hash() -> BlockHash {
	BlockHash::from_byte_array(sha256::Hash::hash(b"test chain").to_byte_array())
}

pub fn dummy_onion(fill: u8) -> OnionPacket {
	let secp = Secp256k1::new();
	let key = SecretKey::from_slice(&[0x41; 32]).unwrap();
	OnionPacket {
		version: 0,
		public_key: PublicKey::from_secret_key(&secp, &key),
		hop_data: [fill; 1300],
		hmac: [fill; 32],
	}
}

pub fn dummy_refund_script() -> ScriptBuf {
	let mut script = vec![0x00, 0x14];
	script.extend_from_slice(&[0xab; 20]);
	ScriptBuf::from_bytes(script)
}

/// A scriptable stand-in for the host node: records everything the master asks of it and serves
/// programmed answers for onion decryption and chain queries.
pub struct TestNodeInterface {
	pub node_secret_key: SecretKey,
	pub node_public_key: PublicKey,
	pub height: Mutex<u32>,
	pub blocks: Mutex<HashMap<u32, Block>>,
	pub onion_routes: Mutex<HashMap<PaymentHash, DecodedOnion>>,
	pub sent_messages: Mutex<Vec<(PublicKey, u16, Vec<u8>)>>,
	pub forwarded_htlcs: Mutex<Vec<(HtlcIdentifier, PaymentHash, ForwardingInfo)>>,
	pub received_htlcs: Mutex<Vec<(HtlcIdentifier, PaymentHash, u64)>>,
	pub intercept_resolutions: Mutex<Vec<(HtlcIdentifier, InterceptResolution)>>,
}

impl TestNodeInterface {
	pub fn new(seed: u8, height: u32) -> Self {
		let secp = Secp256k1::new();
		let node_secret_key = SecretKey::from_slice(&[seed; 32]).unwrap();
		let node_public_key = PublicKey::from_secret_key(&secp, &node_secret_key);
		TestNodeInterface {
			node_secret_key,
			node_public_key,
			height: Mutex::new(height),
			blocks: Mutex::new(HashMap::new()),
			onion_routes: Mutex::new(HashMap::new()),
			sent_messages: Mutex::new(Vec::new()),
			forwarded_htlcs: Mutex::new(Vec::new()),
			received_htlcs: Mutex::new(Vec::new()),
			intercept_resolutions: Mutex::new(Vec::new()),
		}
	}

	pub fn set_route(&self, payment_hash: PaymentHash, decoded: DecodedOnion) {
		self.onion_routes.lock().unwrap().insert(payment_hash, decoded);
	}

	pub fn set_height(&self, height: u32) {
		*self.height.lock().unwrap() = height;
	}

	pub fn drain_sent(&self) -> Vec<(PublicKey, u16, Vec<u8>)> {
		std::mem::take(&mut *self.sent_messages.lock().unwrap())
	}
}

impl NodeInterface for TestNodeInterface {
	fn send_custom_message(&self, peer: &PublicKey, tag: u16, payload: Vec<u8>) {
		self.sent_messages.lock().unwrap().push((*peer, tag, payload));
	}
	fn get_current_block(&self) -> u32 {
		*self.height.lock().unwrap()
	}
	fn get_chain_hash(&self) -> BlockHash {
		test_chain_hash()
	}
	fn get_block(&self, height: u32) -> Option<Block> {
		self.blocks.lock().unwrap().get(&height).cloned()
	}
	fn decrypt_onion(
		&self, onion: &OnionPacket, payment_hash: &PaymentHash,
	) -> Result<DecodedOnion, OnionDecodeFailure> {
		match self.onion_routes.lock().unwrap().get(payment_hash) {
			Some(decoded) => Ok(decoded.clone()),
			None => Err(OnionDecodeFailure {
				failure_code: 0x8000 | 0x4000 | 6,
				sha256_of_onion: sha256::Hash::hash(&onion.hop_data).to_byte_array(),
			}),
		}
	}
	fn forward_htlc(
		&self, incoming: HtlcIdentifier, payment_hash: PaymentHash, hop: ForwardingInfo,
	) {
		self.forwarded_htlcs.lock().unwrap().push((incoming, payment_hash, hop));
	}
	fn receive_htlc(&self, incoming: HtlcIdentifier, payment_hash: PaymentHash, amount_msat: u64) {
		self.received_htlcs.lock().unwrap().push((incoming, payment_hash, amount_msat));
	}
	fn resolve_intercepted_htlc(&self, htlc: HtlcIdentifier, resolution: InterceptResolution) {
		self.intercept_resolutions.lock().unwrap().push((htlc, resolution));
	}
	fn node_id(&self) -> PublicKey {
		self.node_public_key
	}
	fn node_secret(&self) -> SecretKey {
		self.node_secret_key
	}
}
