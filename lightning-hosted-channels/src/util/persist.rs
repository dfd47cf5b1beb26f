// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A key-value store abstraction plus a filesystem implementation of it.
//!
//! The plugin persists exactly one logical record (see [`StoreManager`]), but the store below it
//! is deliberately generic so deployments can drop in their own database.
//!
//! [`StoreManager`]: crate::hosted::store::StoreManager

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Provides an interface that allows storage and retrieval of persisted values that are associated
/// with given keys.
///
/// In order to avoid collisions, a key is scoped under a `namespace`. Implementations must ensure
/// that writes are durable before returning: a crash directly after [`KVStoreSync::write`]
/// returns must not lose the written value, as channel state attestations depend on it.
pub trait KVStoreSync {
	/// Returns the data stored for the given `namespace` and `key`.
	///
	/// Returns an [`io::ErrorKind::NotFound`] if the given `key` could not be found in the given
	/// `namespace`.
	fn read(&self, namespace: &str, key: &str) -> Result<Vec<u8>, io::Error>;
	/// Persists the given data under the given `key`, atomically replacing any previous value.
	fn write(&self, namespace: &str, key: &str, buf: &[u8]) -> Result<(), io::Error>;
	/// Removes any data that had previously been persisted under the given `key`.
	fn remove(&self, namespace: &str, key: &str) -> Result<(), io::Error>;
	/// Returns a list of keys that are stored under the given `namespace`.
	fn list(&self, namespace: &str) -> Result<Vec<String>, io::Error>;
}

fn check_valid_kvstore_str(s: &str) -> Result<(), io::Error> {
	let valid = !s.is_empty()
		&& s.len() <= 120
		&& s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
	if valid {
		Ok(())
	} else {
		Err(io::Error::new(io::ErrorKind::InvalidInput, format!("invalid store path: {}", s)))
	}
}

/// A [`KVStoreSync`] implementation that writes to and reads from the file system.
///
/// Values are written to a temporary file first, fsynced, and atomically moved into place, so a
/// crash can never leave a torn record behind.
pub struct FilesystemStore {
	data_dir: PathBuf,
	tmp_file_counter: AtomicUsize,
}

impl FilesystemStore {
	/// Constructs a new [`FilesystemStore`] under the given directory.
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir, tmp_file_counter: AtomicUsize::new(0) }
	}

	fn dest_file_path(&self, namespace: &str, key: &str) -> Result<PathBuf, io::Error> {
		check_valid_kvstore_str(namespace)?;
		check_valid_kvstore_str(key)?;
		let mut path = self.data_dir.clone();
		path.push(namespace);
		path.push(key);
		Ok(path)
	}
}

impl KVStoreSync for FilesystemStore {
	fn read(&self, namespace: &str, key: &str) -> Result<Vec<u8>, io::Error> {
		fs::read(self.dest_file_path(namespace, key)?)
	}

	fn write(&self, namespace: &str, key: &str, buf: &[u8]) -> Result<(), io::Error> {
		let dest_file_path = self.dest_file_path(namespace, key)?;
		let parent_directory = dest_file_path.parent().ok_or_else(|| {
			io::Error::new(io::ErrorKind::InvalidInput, "store path has no parent")
		})?;
		fs::create_dir_all(parent_directory)?;

		let tmp_file_counter = self.tmp_file_counter.fetch_add(1, Ordering::AcqRel);
		let mut tmp_file_path = dest_file_path.clone();
		tmp_file_path.set_extension(format!("tmp-{}", tmp_file_counter));

		{
			let mut tmp_file = fs::File::create(&tmp_file_path)?;
			tmp_file.write_all(buf)?;
			tmp_file.sync_all()?;
		}

		fs::rename(&tmp_file_path, &dest_file_path)?;
		// Fsync the parent directory so the rename itself is durable.
		fs::File::open(parent_directory)?.sync_all()?;
		Ok(())
	}

	fn remove(&self, namespace: &str, key: &str) -> Result<(), io::Error> {
		let dest_file_path = self.dest_file_path(namespace, key)?;
		match fs::remove_file(&dest_file_path) {
			Ok(()) => {},
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
			Err(e) => return Err(e),
		}
		if let Some(parent_directory) = dest_file_path.parent() {
			fs::File::open(parent_directory)?.sync_all()?;
		}
		Ok(())
	}

	fn list(&self, namespace: &str) -> Result<Vec<String>, io::Error> {
		check_valid_kvstore_str(namespace)?;
		let prefixed_dest = self.data_dir.join(namespace);
		let mut keys = Vec::new();
		if !prefixed_dest.exists() {
			return Ok(keys);
		}
		for entry in fs::read_dir(&prefixed_dest)? {
			let entry = entry?;
			if !entry.file_type()?.is_file() {
				continue;
			}
			if let Some(name) = entry.file_name().to_str() {
				// Skip temp files a crash may have left behind.
				if name.contains(".tmp-") {
					continue;
				}
				keys.push(name.to_string());
			}
		}
		Ok(keys)
	}
}
