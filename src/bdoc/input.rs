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

use {
	super::de::Error,
	std::{borrow::Cow, io}
};

/// Upper bound on speculative reading. Ensures that at most this many bytes
/// are copied during compaction when the window does not contain enough
/// contiguous bytes.
pub const MAX_READAHEAD: usize = 512;

const INITIAL_BUFFER_SIZE: usize = 1024;
const MAX_STRING_SIZE:     usize = 3 * 1024 * 1024;

/// A windowed read-ahead buffer over a byte source, scoped to one document.
///
/// Construction consumes the document's 4-byte outer length; reads never
/// run ahead of that length, so a source carrying several documents
/// back-to-back stays aligned.
pub struct BufferedInput<R> {
	src:    R,
	buf:    Vec<u8>,
	o:      usize,
	l:      usize,
	read:   usize,
	length: usize
}

impl<R: io::Read> BufferedInput<R> {
	pub fn new(src: R) -> Result<Self, Error> {
		let mut self_ = Self {
			src,
			buf:    vec![0u8; INITIAL_BUFFER_SIZE],
			o:      0,
			l:      0,
			read:   0,
			// until the real length is known, allow reading exactly its 4 bytes
			length: 4
		};

		let declared = self_.read_i32()?;
		if declared < 5 {
			return Err(Error::BadLength(declared));
		}
		self_.length = declared as usize;
		Ok(self_)
	}

	/// The declared outer length of the document, including its length prefix.
	pub fn length(&self) -> usize {
		self.length
	}

	/// Total bytes consumed since construction, including the length prefix.
	pub fn bytes_read(&self) -> usize {
		self.read + self.o
	}

	/// Guarantees that the next `n` bytes are contiguous in the window,
	/// compacting and refilling as needed. Reading ahead is capped by
	/// [`MAX_READAHEAD`] and by the end of the current document.
	pub fn ensure_contiguous(&mut self, n: usize) -> Result<(), Error> {
		if self.o + n <= self.l {
			return Ok(());
		}

		let remaining = self.l - self.o;

		if n < self.buf.len() {
			self.buf.copy_within(self.o..self.l, 0);
		} else {
			let mut larger = vec![0u8; n + MAX_READAHEAD];
			larger[..remaining].copy_from_slice(&self.buf[self.o..self.l]);
			self.buf = larger;
		}

		self.read += self.o;
		self.o = 0;
		self.l = remaining;

		let bytes_till_end = self.length.saturating_sub(self.read + self.l);
		let readahead = MAX_READAHEAD
			.min(self.buf.len() - remaining)
			.min(bytes_till_end);
		let mut wanted = readahead.max(n - remaining);

		while wanted > 0 && self.l < n {
			let rd = self.src.read(&mut self.buf[self.l..self.l + wanted])
				.map_err(Error::Io)?;
			if rd == 0 {
				break;
			}
			self.l += rd;
			wanted -= rd;
		}

		if self.l < n {
			return Err(Error::UnexpectedEof);
		}
		Ok(())
	}

	pub fn read_byte(&mut self) -> Result<u8, Error> {
		self.ensure_contiguous(1)?;
		let b = self.buf[self.o];
		self.o += 1;
		Ok(b)
	}

	pub fn read_i32(&mut self) -> Result<i32, Error> {
		self.ensure_contiguous(4)?;
		let v = i32::from_le_bytes([
			self.buf[self.o], self.buf[self.o + 1],
			self.buf[self.o + 2], self.buf[self.o + 3]
		]);
		self.o += 4;
		Ok(v)
	}

	pub fn read_i64(&mut self) -> Result<i64, Error> {
		self.ensure_contiguous(8)?;
		let v = i64::from_le_bytes([
			self.buf[self.o], self.buf[self.o + 1],
			self.buf[self.o + 2], self.buf[self.o + 3],
			self.buf[self.o + 4], self.buf[self.o + 5],
			self.buf[self.o + 6], self.buf[self.o + 7]
		]);
		self.o += 8;
		Ok(v)
	}

	pub fn read_f64(&mut self) -> Result<f64, Error> {
		self.read_i64().map(|v| f64::from_bits(v as u64))
	}

	/// Fills `dst` completely, draining the window first and reading the
	/// remainder directly from the source.
	pub fn fill(&mut self, dst: &mut [u8]) -> Result<(), Error> {
		let len = dst.len();
		let remaining = self.l - self.o;

		if remaining >= len {
			dst.copy_from_slice(&self.buf[self.o..self.o + len]);
			self.o += len;
			return Ok(());
		}

		dst[..remaining].copy_from_slice(&self.buf[self.o..self.l]);
		self.o = self.l;

		let mut off = remaining;
		while off < len {
			let rd = self.src.read(&mut dst[off..]).map_err(Error::Io)?;
			if rd == 0 {
				return Err(Error::UnexpectedEof);
			}
			self.read += rd;
			off += rd;
		}
		Ok(())
	}

	/// Reads a NUL-terminated string. The empty string and one-byte
	/// printable-ASCII names are served from a static table, so repeated
	/// occurrences of the same short name share one `'static` instance.
	pub fn read_cstr(&mut self) -> Result<Cow<'static, str>, Error> {
		let first = self.read_byte()?;
		if first == 0 {
			return Ok(Cow::Borrowed(""));
		}

		let second = self.read_byte()?;
		if second == 0 {
			if let Some(s) = one_byte_str(first) {
				return Ok(Cow::Borrowed(s));
			}
			return String::from_utf8(vec![first])
				.map(Cow::Owned)
				.map_err(|e| Error::InvalidUtf8(e.utf8_error()));
		}

		let mut bytes = vec![first, second];
		loop {
			let b = self.read_byte()?;
			if b == 0 {
				break;
			}
			bytes.push(b);
		}

		String::from_utf8(bytes)
			.map(Cow::Owned)
			.map_err(|e| Error::InvalidUtf8(e.utf8_error()))
	}

	/// Reads a length-prefixed UTF-8 string: a 4-byte size `s`, `s - 1`
	/// bytes of text and a trailing NUL. Sizes outside `1..=3 MiB` are
	/// rejected.
	pub fn read_utf8_string(&mut self) -> Result<String, Error> {
		let size = self.read_i32()?;
		if size < 1 || size as usize > MAX_STRING_SIZE {
			return Err(Error::BadLength(size));
		}

		let size = size as usize;
		self.ensure_contiguous(size)?;
		let start = self.o;
		self.o += size;

		std::str::from_utf8(&self.buf[start..start + size - 1])
			.map(str::to_string)
			.map_err(Error::InvalidUtf8)
	}
}

const fn ascii_table() -> [u8; 128] {
	let mut table = [0u8; 128];
	let mut i = 0;
	while i < 128 {
		table[i] = i as u8;
		i += 1;
	}
	table
}

static ONE_BYTE_CHARS: [u8; 128] = ascii_table();

fn one_byte_str(b: u8) -> Option<&'static str> {
	if !(0x20..0x7F).contains(&b) {
		return None;
	}
	std::str::from_utf8(&ONE_BYTE_CHARS[b as usize..b as usize + 1]).ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn framed(body: &[u8]) -> Vec<u8> {
		let mut buf = ((body.len() + 4) as i32).to_le_bytes().to_vec();
		buf.extend_from_slice(body);
		buf
	}

	#[test]
	fn rejects_short_length() {
		assert!(matches!(
			BufferedInput::new(&[4u8, 0, 0, 0][..]),
			Err(Error::BadLength(4))
		));
	}

	#[test]
	fn primitive_readers() {
		let mut body = Vec::new();
		body.extend_from_slice(&0x0102_0304i32.to_le_bytes());
		body.extend_from_slice(&(-5i64).to_le_bytes());
		body.extend_from_slice(&1.5f64.to_le_bytes());
		body.push(0xAB);

		let data = framed(&body);
		let mut input = BufferedInput::new(data.as_slice()).unwrap();
		assert_eq!(input.length(), data.len());
		assert_eq!(input.bytes_read(), 4);
		assert_eq!(input.read_i32().unwrap(), 0x0102_0304);
		assert_eq!(input.read_i64().unwrap(), -5);
		assert_eq!(input.read_f64().unwrap(), 1.5);
		assert_eq!(input.read_byte().unwrap(), 0xAB);
		assert_eq!(input.bytes_read(), data.len());
	}

	#[test]
	fn bytes_read_increases() {
		let data = framed(&[1, 2, 3, 4, 5, 6, 7, 8]);
		let mut input = BufferedInput::new(data.as_slice()).unwrap();
		let mut prev = input.bytes_read();
		for _ in 0..8 {
			input.read_byte().unwrap();
			assert!(input.bytes_read() > prev);
			prev = input.bytes_read();
		}
	}

	#[test]
	fn eof_before_requested_bytes() {
		let mut data = framed(&[0u8; 64]);
		data.truncate(20);
		let mut input = BufferedInput::new(data.as_slice()).unwrap();
		assert!(matches!(input.read_i64(), Ok(_)));
		assert!(matches!(input.read_i64(), Ok(_)));
		assert!(matches!(input.read_i64(), Err(Error::UnexpectedEof)));
	}

	#[test]
	fn compaction_across_initial_buffer() {
		// a body larger than the initial window forces compaction and growth
		let mut body = Vec::new();
		for i in 0..3000u32 {
			body.extend_from_slice(&(i as i32).to_le_bytes());
		}
		let data = framed(&body);
		let mut input = BufferedInput::new(data.as_slice()).unwrap();
		for i in 0..3000 {
			assert_eq!(input.read_i32().unwrap(), i);
		}
		assert_eq!(input.bytes_read(), data.len());
	}

	#[test]
	fn fill_drains_window_then_source() {
		let body: Vec<u8> = (0..2048u32).map(|i| i as u8).collect();
		let data = framed(&body);
		let mut input = BufferedInput::new(data.as_slice()).unwrap();
		input.read_byte().unwrap();

		let mut dst = vec![0u8; 2047];
		input.fill(&mut dst).unwrap();
		assert_eq!(dst.as_slice(), &body[1..]);
		assert_eq!(input.bytes_read(), data.len());
	}

	#[test]
	fn cstr_fast_path_is_singleton() {
		let data = framed(b"a\0a\0ab\0\0");
		let mut input = BufferedInput::new(data.as_slice()).unwrap();
		let first = input.read_cstr().unwrap();
		let second = input.read_cstr().unwrap();
		assert_eq!(first, "a");
		assert_eq!(second, "a");
		// the one-byte fast path hands out the same static slice
		assert_eq!(first.as_ptr(), second.as_ptr());
		assert_eq!(input.read_cstr().unwrap(), "ab");
		assert_eq!(input.read_cstr().unwrap(), "");
	}

	#[test]
	fn utf8_string_limits() {
		let mut body = Vec::new();
		body.extend_from_slice(&6i32.to_le_bytes());
		body.extend_from_slice(b"hello\0");
		let data = framed(&body);
		let mut input = BufferedInput::new(data.as_slice()).unwrap();
		assert_eq!(input.read_utf8_string().unwrap(), "hello");

		let mut body = Vec::new();
		body.extend_from_slice(&(4 * 1024 * 1024i32).to_le_bytes());
		let data = framed(&body);
		let mut input = BufferedInput::new(data.as_slice()).unwrap();
		assert!(matches!(input.read_utf8_string(), Err(Error::BadLength(_))));

		let mut body = Vec::new();
		body.extend_from_slice(&(-1i32).to_le_bytes());
		let data = framed(&body);
		let mut input = BufferedInput::new(data.as_slice()).unwrap();
		assert!(matches!(input.read_utf8_string(), Err(Error::BadLength(-1))));
	}
}
