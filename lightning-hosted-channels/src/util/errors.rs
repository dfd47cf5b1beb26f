// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Error types live here.

use std::fmt;

/// Indicates an error on the plugin's control surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum APIError {
	/// Indicates the API was wholly misused (see err for more). Cases where these can be returned
	/// are documented, but generally indicates some precondition of a function was violated.
	APIMisuseError {
		/// A human-readable error message
		err: String,
	},
	/// The channel needed for the requested operation does not exist, or is in a state where the
	/// operation cannot be applied.
	ChannelUnavailable {
		/// A human-readable error message
		err: String,
	},
	/// The database refused a write. Fatal: the plugin stops rather than diverge from disk.
	DatabaseError {
		/// A human-readable error message
		err: String,
	},
}

impl fmt::Display for APIError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			APIError::APIMisuseError { ref err } => write!(f, "Invalid parameter: {}", err),
			APIError::ChannelUnavailable { ref err } => write!(f, "Channel unavailable: {}", err),
			APIError::DatabaseError { ref err } => write!(f, "Database failure: {}", err),
		}
	}
}
