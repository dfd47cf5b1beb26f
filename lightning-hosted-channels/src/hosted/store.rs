// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The plugin's single persisted record and the read–modify–write layer guarding it.

use crate::chain::HtlcIdentifier;
use crate::hosted::channel::ChannelData;
use crate::hosted::msgs::{DecodeError, PaymentHash, PaymentPreimage};
use crate::util::persist::KVStoreSync;
use crate::util::ser::{Readable, Writeable, Writer};

use bitcoin::secp256k1::PublicKey;

use std::collections::HashMap;
use std::io::{self, Read};
use std::ops::Deref;
use std::sync::Mutex;

const SERIALIZATION_VERSION: u8 = 1;

const STORE_NAMESPACE: &str = "hosted-channels";
const STORE_KEY: &str = "state";

/// Everything the plugin persists, as one atomically replaced record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PluginData {
	/// Channel records, keyed by peer node id.
	pub channels: HashMap<PublicKey, ChannelData>,
	/// Learned preimages, kept until their hash leaves every in-flight HTLC set.
	pub preimages: HashMap<PaymentHash, PaymentPreimage>,
	/// Forward linkage: incoming HTLC leg to the outgoing leg it was re-proposed as.
	pub htlc_forwards: HashMap<HtlcIdentifier, HtlcIdentifier>,
}

impl Writeable for PluginData {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		SERIALIZATION_VERSION.write(w)?;
		self.channels.write(w)?;
		self.preimages.write(w)?;
		self.htlc_forwards.write(w)
	}
}

impl Readable for PluginData {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let version: u8 = Readable::read(r)?;
		if version != SERIALIZATION_VERSION {
			return Err(DecodeError::InvalidValue);
		}
		Ok(PluginData {
			channels: Readable::read(r)?,
			preimages: Readable::read(r)?,
			htlc_forwards: Readable::read(r)?,
		})
	}
}

/// Serializes every mutation of [`PluginData`] through one read–modify–write entry point and
/// keeps the durable copy in lockstep with the in-memory one.
///
/// A database failure here is the one error the plugin never papers over: the caller is expected
/// to stop the event loop rather than keep attesting to states it cannot durably remember.
pub struct StoreManager<K: Deref>
where
	K::Target: KVStoreSync,
{
	kv: K,
	data: Mutex<PluginData>,
}

impl<K: Deref> StoreManager<K>
where
	K::Target: KVStoreSync,
{
	/// Loads the persisted record (an absent one is simply a fresh plugin).
	pub fn load(kv: K) -> Result<Self, io::Error> {
		let data = match kv.read(STORE_NAMESPACE, STORE_KEY) {
			Ok(bytes) => {
				let mut cursor = io::Cursor::new(bytes);
				Readable::read(&mut cursor).map_err(|e| {
					io::Error::new(
						io::ErrorKind::InvalidData,
						format!("corrupt plugin record: {}", e),
					)
				})?
			},
			Err(e) if e.kind() == io::ErrorKind::NotFound => PluginData::default(),
			Err(e) => return Err(e),
		};
		Ok(StoreManager { kv, data: Mutex::new(data) })
	}

	/// Runs a read-only closure against the current record.
	pub fn with<F, T>(&self, f: F) -> T
	where
		F: FnOnce(&PluginData) -> T,
	{
		f(&self.data.lock().unwrap())
	}

	/// Applies a transformation and durably commits the result before returning.
	pub fn update<F, T>(&self, f: F) -> Result<T, io::Error>
	where
		F: FnOnce(&mut PluginData) -> T,
	{
		let mut data = self.data.lock().unwrap();
		let ret = f(&mut data);
		self.kv.write(STORE_NAMESPACE, STORE_KEY, &data.encode())?;
		Ok(ret)
	}
}
