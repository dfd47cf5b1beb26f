// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Macros deriving [`Writeable`]/[`Readable`] for structs whose wire encoding is exactly their
//! fields, in order.
//!
//! [`Writeable`]: crate::util::ser::Writeable
//! [`Readable`]: crate::util::ser::Readable

macro_rules! impl_writeable {
	($st:ident, {$($field:ident),* $(,)?}) => {
		impl $crate::util::ser::Writeable for $st {
			fn write<W: $crate::util::ser::Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
				$($crate::util::ser::Writeable::write(&self.$field, w)?;)*
				Ok(())
			}
		}

		impl $crate::util::ser::Readable for $st {
			fn read<R: std::io::Read>(r: &mut R) -> Result<Self, $crate::hosted::msgs::DecodeError> {
				Ok(Self {
					$($field: $crate::util::ser::Readable::read(r)?),*
				})
			}
		}
	}
}
