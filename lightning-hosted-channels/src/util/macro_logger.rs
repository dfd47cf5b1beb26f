// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use bitcoin::secp256k1::PublicKey;

use std::fmt;

pub(crate) struct DebugPubKey<'a>(pub &'a PublicKey);
impl<'a> fmt::Display for DebugPubKey<'a> {
	fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
		for i in self.0.serialize().iter() {
			write!(f, "{:02x}", i)?;
		}
		Ok(())
	}
}
macro_rules! log_pubkey {
	($obj: expr) => {
		$crate::util::macro_logger::DebugPubKey(&$obj)
	};
}

pub(crate) struct DebugBytes<'a>(pub &'a [u8]);
impl<'a> fmt::Display for DebugBytes<'a> {
	fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
		for i in self.0 {
			write!(f, "{:02x}", i)?;
		}
		Ok(())
	}
}
macro_rules! log_bytes {
	($obj: expr) => {
		$crate::util::macro_logger::DebugBytes(&$obj[..])
	};
}

macro_rules! log_internal {
	($logger: expr, $lvl:expr, $($arg:tt)+) => (
		$logger.log(&$crate::util::logger::Record::new($lvl, format_args!($($arg)+), module_path!(), file!(), line!()))
	);
}

macro_rules! log_error {
	($logger: expr, $($arg:tt)*) => (
		log_internal!($logger, $crate::util::logger::Level::Error, $($arg)*)
	)
}

macro_rules! log_warn {
	($logger: expr, $($arg:tt)*) => (
		log_internal!($logger, $crate::util::logger::Level::Warn, $($arg)*)
	)
}

macro_rules! log_info {
	($logger: expr, $($arg:tt)*) => (
		log_internal!($logger, $crate::util::logger::Level::Info, $($arg)*)
	)
}

macro_rules! log_debug {
	($logger: expr, $($arg:tt)*) => (
		log_internal!($logger, $crate::util::logger::Level::Debug, $($arg)*)
	)
}

macro_rules! log_trace {
	($logger: expr, $($arg:tt)*) => (
		log_internal!($logger, $crate::util::logger::Level::Trace, $($arg)*)
	)
}

macro_rules! log_gossip {
	($logger: expr, $($arg:tt)*) => (
		log_internal!($logger, $crate::util::logger::Level::Gossip, $($arg)*)
	)
}
