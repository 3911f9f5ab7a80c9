// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use std::{time::{SystemTime, UNIX_EPOCH}, sync::{Once, atomic::*}};
use rand::Rng;

static INIT:    Once      = Once::new();
static MACHINE: AtomicU32 = AtomicU32::new(0);
static COUNTER: AtomicU32 = AtomicU32::new(0);

/// A 12-byte document id: 4 bytes of seconds, a 4-byte process-unique word
/// and a 4-byte counter, each with big-endian byte order.
#[derive(Default, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ObjectId(pub [u8; 12]);

#[derive(Copy, Clone, Debug, Ord, PartialOrd, Eq, PartialEq)]
pub struct OidError;

impl std::fmt::Display for OidError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("invalid object id")
	}
}

impl ObjectId {
	pub fn new() -> Self {
		INIT.call_once(|| {
			MACHINE.store(rand::thread_rng().gen(), Ordering::Relaxed);
			COUNTER.store(rand::thread_rng().gen(), Ordering::Relaxed);
		});

		let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
		let machine = MACHINE.load(Ordering::SeqCst);
		let ts = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_secs() as u32;

		Self::from_parts(ts as i32, machine as i32, counter as i32)
	}

	/// Reassembles an id from the three words the wire carries.
	pub fn from_parts(time: i32, machine: i32, inc: i32) -> Self {
		let mut id = [0u8; 12];
		id[0..4].copy_from_slice(&time.to_be_bytes());
		id[4..8].copy_from_slice(&machine.to_be_bytes());
		id[8..12].copy_from_slice(&inc.to_be_bytes());
		Self(id)
	}

	/// Splits the id into the three words the wire carries.
	pub fn parts(&self) -> (i32, i32, i32) {
		(
			i32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]),
			i32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]]),
			i32::from_be_bytes([self.0[8], self.0[9], self.0[10], self.0[11]])
		)
	}

	pub fn time(&self) -> i32 {
		self.parts().0
	}
}

impl std::str::FromStr for ObjectId {
	type Err = OidError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		// from_str_radix tolerates a leading sign, hex digits do not
		if s.len() != 24 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
			return Err(OidError);
		}

		let mut id = [0u8; 12];
		for (byte, pair) in id.iter_mut().zip(s.as_bytes().chunks(2)) {
			let pair = std::str::from_utf8(pair).map_err(|_| OidError)?;
			*byte = u8::from_str_radix(pair, 16).map_err(|_| OidError)?;
		}
		Ok(Self(id))
	}
}

impl std::fmt::Debug for ObjectId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "ObjectId({})", self)
	}
}

impl std::fmt::Display for ObjectId {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		for byte in &self.0 {
			write!(f, "{:02x}", byte)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::str::FromStr;

	#[test]
	fn new() {
		let id = ObjectId::new();
		let id2 = ObjectId::new();
		assert_eq!(id.parts().2.wrapping_add(1), id2.parts().2);
		assert_eq!(id.parts().1, id2.parts().1);
	}

	#[test]
	fn parts() {
		let id = ObjectId::from_parts(0x0123_4567, -2, 0x89AB_CDEF_u32 as i32);
		assert_eq!(id.parts(), (0x0123_4567, -2, 0x89AB_CDEF_u32 as i32));
		assert_eq!(id.time(), 0x0123_4567);
	}

	#[test]
	fn parse() {
		assert_eq!(ObjectId::from_str("5e8f00aa11bb22cc33dd44ee"),
				   Ok(ObjectId([0x5e, 0x8f, 0x00, 0xaa, 0x11, 0xbb,
					   0x22, 0xcc, 0x33, 0xdd, 0x44, 0xee])));
		// upper case digits are accepted too
		assert_eq!(ObjectId::from_str("5E8F00AA11BB22CC33DD44EE"),
				   ObjectId::from_str("5e8f00aa11bb22cc33dd44ee"));
	}

	#[test]
	fn parse_rejects_garbage() {
		assert!(ObjectId::from_str("5e8f00aa11bb22cc33dd44").is_err());
		assert!(ObjectId::from_str("5e8f00aa11bb22cc33dd44eeff").is_err());
		assert!(ObjectId::from_str("ze8f00aa11bb22cc33dd44ee").is_err());
		assert!(ObjectId::from_str("+e8f00aa11bb22cc33dd44ee").is_err());
	}

	#[test]
	fn fmt() {
		let id = ObjectId([0x5e, 0x8f, 0x00, 0xaa, 0x11, 0xbb,
			0x22, 0xcc, 0x33, 0xdd, 0x44, 0xee]);
		assert_eq!(id.to_string(), "5e8f00aa11bb22cc33dd44ee");
		assert_eq!(format!("{:?}", id), "ObjectId(5e8f00aa11bb22cc33dd44ee)");
	}

	#[test]
	fn display_parse_roundtrip() {
		let id = ObjectId::from_parts(0x1234, -77, 9);
		assert_eq!(ObjectId::from_str(&id.to_string()), Ok(id));
	}
}
