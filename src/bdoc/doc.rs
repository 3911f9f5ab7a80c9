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
	super::*,
	serde::Serialize
};

/// A fully encoded BDOC document.
///
/// # Structure
/// ```no-run
/// [0..4] length encoded as a little endian i32
/// [4..x] elements
/// [x..x+1] 0 (terminator)
/// ```
#[allow(rustdoc::invalid_codeblock_attributes)]
#[derive(Clone, Eq, PartialEq)]
pub struct Document(pub Vec<u8>);

impl Document {
	pub fn new() -> Self {
		Self(vec![5u8, 0u8, 0u8, 0u8, 0u8])
	}

	/// Encodes any `Serialize` type, typically a command struct.
	pub fn from(v: &impl Serialize) -> Result<Document, se::Error> {
		se::encode(v).map(Self)
	}

	/// Encodes an in-memory [`Object`] tree.
	pub fn from_object(object: &Object) -> Self {
		let mut builder = DocBuilder::new();
		for (key, value) in object {
			builder.append(key, value);
		}
		builder.finish()
	}

	/// Copies one framed document out of a larger buffer.
	pub fn copy_from_slice(src: &[u8]) -> Self {
		Self(src[..u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize].to_vec())
	}

	/// Decodes back into the standard tree.
	pub fn decode(&self) -> Result<Object, de::Error> {
		de::read_object(self.0.as_slice())
	}
}

impl Default for Document {
	fn default() -> Self {
		Self::new()
	}
}

impl std::ops::Deref for Document {
	type Target = Vec<u8>;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl std::fmt::Debug for Document {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self.decode() {
			Ok(object) => std::fmt::Debug::fmt(&object, f),
			Err(_) => f.debug_tuple("Document").field(&self.0).finish()
		}
	}
}

/// Builds a document element by element, back-patching the outer length on
/// [`DocBuilder::finish`].
#[derive(Default)]
pub struct DocBuilder(Vec<u8>);

impl DocBuilder {
	pub fn new() -> Self {
		Self(Vec::new())
	}

	/// Appends one named value, dispatching on its type.
	pub fn append(&mut self, key: &str, value: &Value) -> &mut Self {
		self.element(value.tag(), key);
		match value {
			Value::Double(v)    => { self.extend(&v.to_le_bytes()); }
			Value::String(v)
			| Value::Code(v)
			| Value::Symbol(v)  => self.push_utf8_string(v),
			Value::Object(v)    => {
				let inner = Document::from_object(v);
				self.extend(&inner.0);
			}
			Value::Array(v)     => {
				let mut inner = DocBuilder::new();
				for (i, item) in v.iter().enumerate() {
					inner.append(&i.to_string(), item);
				}
				let inner = inner.finish();
				self.extend(&inner.0);
			}
			Value::Binary(v)    => self.push_binary(v),
			Value::ObjectId(v)  => self.push_object_id(v),
			Value::Boolean(v)   => { self.push_byte(if *v { 1 } else { 0 }); }
			Value::DateTime(v)  => { self.extend(&v.0.to_le_bytes()); }
			Value::Regex(v)     => {
				self.push_cstr(&v.pattern);
				self.push_cstr(&v.options);
			}
			Value::DbRef(v)     => {
				self.push_i32(v.ns.len() as i32 + 1);
				self.push_cstr(&v.ns);
				self.push_object_id(&v.id);
			}
			Value::CodeWithScope(v) => {
				let scope = Document::from_object(&v.scope);
				// total: this length field, the code string and the scope
				self.push_i32(4 + 4 + v.code.len() as i32 + 1 + scope.len() as i32);
				self.push_utf8_string(&v.code);
				self.extend(&scope.0);
			}
			Value::Int32(v)     => { self.push_i32(*v); }
			Value::Timestamp(v) => {
				self.push_i32(v.increment);
				self.push_i32(v.time);
			}
			Value::Int64(v)     => { self.extend(&v.to_le_bytes()); }
			Value::Undefined
			| Value::Null
			| Value::MinKey
			| Value::MaxKey     => ()
		}
		self
	}

	/// Appends a tag byte and an element name.
	pub fn element(&mut self, tag: u8, key: &str) -> &mut Self {
		self.push_byte(tag);
		self.push_cstr(key);
		self
	}

	pub fn push_byte(&mut self, v: u8) -> &mut Self {
		self.0.push(v);
		self
	}

	pub fn push_i32(&mut self, v: i32) -> &mut Self {
		self.0.extend_from_slice(&v.to_le_bytes());
		self
	}

	pub fn extend(&mut self, bytes: &[u8]) -> &mut Self {
		self.0.extend_from_slice(bytes);
		self
	}

	fn push_cstr(&mut self, v: &str) {
		self.0.extend_from_slice(v.as_bytes());
		self.0.push(0);
	}

	fn push_utf8_string(&mut self, v: &str) {
		self.push_i32(v.len() as i32 + 1);
		self.push_cstr(v);
	}

	fn push_object_id(&mut self, v: &ObjectId) {
		let (time, machine, inc) = v.parts();
		self.push_i32(time);
		self.push_i32(machine);
		self.push_i32(inc);
	}

	fn push_binary(&mut self, v: &Binary) {
		match v.subtype {
			SUBTYPE_LEGACY => {
				// the legacy subtype carries a redundant inner length
				self.push_i32(v.bytes.len() as i32 + 4);
				self.push_byte(SUBTYPE_LEGACY);
				self.push_i32(v.bytes.len() as i32);
			}
			subtype => {
				self.push_i32(v.bytes.len() as i32);
				self.push_byte(subtype);
			}
		}
		self.0.extend_from_slice(&v.bytes);
	}

	pub fn finish(mut self) -> Document {
		self.0.push(0);
		let mut buf = ((self.0.len() + 4) as i32).to_le_bytes().to_vec();
		buf.append(&mut self.0);
		Document(buf)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty() {
		assert_eq!(DocBuilder::new().finish().0, vec![5, 0, 0, 0, 0]);
		assert_eq!(Document::new().0, vec![5, 0, 0, 0, 0]);
	}

	#[test]
	fn single_int() {
		let mut builder = DocBuilder::new();
		builder.append("a", &Value::Int32(1));
		let doc = builder.finish();
		assert_eq!(doc.0, vec![
			12, 0, 0, 0,      // outer length
			0x10, b'a', 0,    // tag, name
			1, 0, 0, 0,       // value
			0                 // terminator
		]);
	}

	#[test]
	fn length_field_matches_buffer() {
		let mut object = Object::new();
		object.put("s", "abc");
		object.put("n", 4i64);
		let doc = Document::from_object(&object);
		let declared = i32::from_le_bytes([doc[0], doc[1], doc[2], doc[3]]) as usize;
		assert_eq!(declared, doc.len());
	}

	#[test]
	fn copy_from_slice_stops_at_frame() {
		let mut object = Object::new();
		object.put("k", 1i32);
		let mut buf = Document::from_object(&object).0;
		let frame = buf.len();
		buf.extend_from_slice(&[0xDE, 0xAD]);

		let doc = Document::copy_from_slice(&buf);
		assert_eq!(doc.len(), frame);
		assert_eq!(doc.decode().unwrap(), object);
	}

	#[test]
	fn debug_renders_decoded_tree() {
		let mut object = Object::new();
		object.put("k", "v");
		let rendered = format!("{:?}", Document::from_object(&object));
		assert!(rendered.contains('k') && rendered.contains('v'));
	}
}
