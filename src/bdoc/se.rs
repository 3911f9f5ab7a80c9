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
	std::io,
	serde::ser::{self, Serialize, Impossible}
};

/// A serialized value: its wire tag and its payload bytes. Containers carry
/// their complete frame (length prefix, elements, terminator) as payload.
type Element = (u8, Vec<u8>);

/// Encodes `v` as one framed document. The root must serialize as a map,
/// struct or sequence.
pub fn encode(v: &impl Serialize) -> Result<Vec<u8>, Error> {
	match v.serialize(ValueSerializer)? {
		(OBJECT, framed) | (ARRAY, framed) => Ok(framed),
		(tag, _) => Err(Error::NotADocument(tag))
	}
}

/// Serializes `v` as one framed document into `writer`.
pub fn serialize(v: impl Serialize, mut writer: impl io::Write) -> Result<(), Error> {
	let framed = encode(&v)?;
	writer.write_all(&framed).map_err(Error::Io)
}

#[derive(Debug)]
pub enum Error {
	Io(std::io::Error),
	/// The root value does not encode as a document.
	NotADocument(u8),
	/// Element names must be strings or integers.
	InvalidKey,
	/// A map value arrived without its key.
	MissingKey,
	Custom(String)
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		std::fmt::Debug::fmt(self, f)
	}
}

impl std::error::Error for Error {}

impl ser::Error for Error {
	fn custom<T: std::fmt::Display>(msg: T) -> Self {
		Self::Custom(msg.to_string())
	}
}

/// Turns one value into its [`Element`]. Scalars build their payload
/// directly; containers hand off to a [`BodySerializer`] that frames
/// itself when it ends, so nested lengths are known without patching.
struct ValueSerializer;

impl serde::Serializer for ValueSerializer {
	type Ok                     = Element;
	type Error                  = Error;
	type SerializeSeq           = BodySerializer;
	type SerializeTuple         = BodySerializer;
	type SerializeTupleStruct   = BodySerializer;
	type SerializeTupleVariant  = BodySerializer;
	type SerializeMap           = BodySerializer;
	type SerializeStruct        = BodySerializer;
	type SerializeStructVariant = BodySerializer;

	fn serialize_bool(self, v: bool) -> Result<Element, Error> {
		Ok((BOOLEAN, vec![v as u8]))
	}

	fn serialize_i32(self, v: i32) -> Result<Element, Error> {
		Ok((INT32, v.to_le_bytes().to_vec()))
	}

	fn serialize_i64(self, v: i64) -> Result<Element, Error> {
		Ok((INT64, v.to_le_bytes().to_vec()))
	}

	fn serialize_f64(self, v: f64) -> Result<Element, Error> {
		Ok((DOUBLE, v.to_le_bytes().to_vec()))
	}

	fn serialize_i8(self, v: i8)   -> Result<Element, Error> { self.serialize_i32(v.into()) }
	fn serialize_i16(self, v: i16) -> Result<Element, Error> { self.serialize_i32(v.into()) }
	fn serialize_u8(self, v: u8)   -> Result<Element, Error> { self.serialize_i32(v.into()) }
	fn serialize_u16(self, v: u16) -> Result<Element, Error> { self.serialize_i32(v.into()) }
	// u32 does not fit the signed 32-bit wire integer, so it widens
	fn serialize_u32(self, v: u32) -> Result<Element, Error> { self.serialize_i64(v.into()) }
	fn serialize_u64(self, v: u64) -> Result<Element, Error> { self.serialize_i64(v as i64) }
	fn serialize_f32(self, v: f32) -> Result<Element, Error> { self.serialize_f64(v.into()) }

	fn serialize_char(self, v: char) -> Result<Element, Error> {
		let mut buf = [0u8; 4];
		self.serialize_str(v.encode_utf8(&mut buf))
	}

	fn serialize_str(self, v: &str) -> Result<Element, Error> {
		let mut payload = Vec::with_capacity(v.len() + 5);
		payload.extend_from_slice(&(v.len() as i32 + 1).to_le_bytes());
		payload.extend_from_slice(v.as_bytes());
		payload.push(0);
		Ok((STRING, payload))
	}

	fn serialize_bytes(self, v: &[u8]) -> Result<Element, Error> {
		let mut payload = Vec::with_capacity(v.len() + 5);
		payload.extend_from_slice(&(v.len() as i32).to_le_bytes());
		payload.push(SUBTYPE_GENERIC);
		payload.extend_from_slice(v);
		Ok((BINARY, payload))
	}

	fn serialize_none(self) -> Result<Element, Error> {
		self.serialize_unit()
	}

	fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Element, Error> {
		value.serialize(self)
	}

	fn serialize_unit(self) -> Result<Element, Error> {
		Ok((NULL, Vec::new()))
	}

	fn serialize_unit_struct(self, _name: &'static str) -> Result<Element, Error> {
		self.serialize_unit()
	}

	fn serialize_unit_variant(
		self,
		_name:          &'static str,
		_variant_index: u32,
		variant:        &'static str
	) -> Result<Element, Error> {
		self.serialize_str(variant)
	}

	fn serialize_newtype_struct<T: Serialize + ?Sized>(
		self,
		_name: &'static str,
		value: &T
	) -> Result<Element, Error> {
		value.serialize(self)
	}

	fn serialize_newtype_variant<T: Serialize + ?Sized>(
		self,
		_name:          &'static str,
		_variant_index: u32,
		_variant:       &'static str,
		value:          &T
	) -> Result<Element, Error> {
		value.serialize(self)
	}

	fn serialize_seq(self, _len: Option<usize>) -> Result<BodySerializer, Error> {
		Ok(BodySerializer::array())
	}

	fn serialize_tuple(self, _len: usize) -> Result<BodySerializer, Error> {
		Ok(BodySerializer::array())
	}

	fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> Result<BodySerializer, Error> {
		Ok(BodySerializer::array())
	}

	fn serialize_tuple_variant(
		self,
		_name:          &'static str,
		_variant_index: u32,
		_variant:       &'static str,
		_len:           usize
	) -> Result<BodySerializer, Error> {
		Ok(BodySerializer::array())
	}

	fn serialize_map(self, _len: Option<usize>) -> Result<BodySerializer, Error> {
		Ok(BodySerializer::document())
	}

	fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<BodySerializer, Error> {
		Ok(BodySerializer::document())
	}

	fn serialize_struct_variant(
		self,
		_name:          &'static str,
		_variant_index: u32,
		_variant:       &'static str,
		_len:           usize
	) -> Result<BodySerializer, Error> {
		Ok(BodySerializer::document())
	}

	fn is_human_readable(&self) -> bool {
		false
	}
}

/// Accumulates the elements of one document or array body; `end` wraps the
/// body in its length prefix and terminator.
struct BodySerializer {
	tag:         u8,
	body:        Vec<u8>,
	next_index:  usize,
	pending_key: Option<String>
}

impl BodySerializer {
	fn document() -> Self {
		Self { tag: OBJECT, body: Vec::new(), next_index: 0, pending_key: None }
	}

	fn array() -> Self {
		Self { tag: ARRAY, body: Vec::new(), next_index: 0, pending_key: None }
	}

	fn put(&mut self, name: &str, (tag, payload): Element) {
		self.body.push(tag);
		self.body.extend_from_slice(name.as_bytes());
		self.body.push(0);
		self.body.extend_from_slice(&payload);
	}

	/// Appends a sequence element under its decimal index.
	fn put_indexed<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
		let element = value.serialize(ValueSerializer)?;
		let name = self.next_index.to_string();
		self.next_index += 1;
		self.put(&name, element);
		Ok(())
	}

	fn framed(self) -> Element {
		let mut buf = Vec::with_capacity(self.body.len() + 5);
		buf.extend_from_slice(&((self.body.len() + 5) as i32).to_le_bytes());
		buf.extend_from_slice(&self.body);
		buf.push(0);
		(self.tag, buf)
	}
}

impl ser::SerializeStruct for BodySerializer {
	type Ok    = Element;
	type Error = Error;

	fn serialize_field<T: Serialize + ?Sized>(&mut self, key: &'static str, value: &T) -> Result<(), Error> {
		let element = value.serialize(ValueSerializer)?;
		self.put(key, element);
		Ok(())
	}

	fn end(self) -> Result<Element, Error> {
		Ok(self.framed())
	}
}

impl ser::SerializeStructVariant for BodySerializer {
	type Ok    = Element;
	type Error = Error;

	fn serialize_field<T: Serialize + ?Sized>(&mut self, key: &'static str, value: &T) -> Result<(), Error> {
		let element = value.serialize(ValueSerializer)?;
		self.put(key, element);
		Ok(())
	}

	fn end(self) -> Result<Element, Error> {
		Ok(self.framed())
	}
}

impl ser::SerializeMap for BodySerializer {
	type Ok    = Element;
	type Error = Error;

	fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), Error> {
		self.pending_key = Some(key.serialize(KeySerializer)?);
		Ok(())
	}

	fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
		let name = self.pending_key.take().ok_or(Error::MissingKey)?;
		let element = value.serialize(ValueSerializer)?;
		self.put(&name, element);
		Ok(())
	}

	fn end(self) -> Result<Element, Error> {
		Ok(self.framed())
	}
}

impl ser::SerializeSeq for BodySerializer {
	type Ok    = Element;
	type Error = Error;

	fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
		self.put_indexed(value)
	}

	fn end(self) -> Result<Element, Error> {
		Ok(self.framed())
	}
}

impl ser::SerializeTuple for BodySerializer {
	type Ok    = Element;
	type Error = Error;

	fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
		self.put_indexed(value)
	}

	fn end(self) -> Result<Element, Error> {
		Ok(self.framed())
	}
}

impl ser::SerializeTupleStruct for BodySerializer {
	type Ok    = Element;
	type Error = Error;

	fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
		self.put_indexed(value)
	}

	fn end(self) -> Result<Element, Error> {
		Ok(self.framed())
	}
}

impl ser::SerializeTupleVariant for BodySerializer {
	type Ok    = Element;
	type Error = Error;

	fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
		self.put_indexed(value)
	}

	fn end(self) -> Result<Element, Error> {
		Ok(self.framed())
	}
}

/// Renders element names: strings pass through, integers become decimal
/// (sequence indices). Anything else has no wire form.
struct KeySerializer;

impl serde::Serializer for KeySerializer {
	type Ok                     = String;
	type Error                  = Error;
	type SerializeSeq           = Impossible<String, Error>;
	type SerializeTuple         = Impossible<String, Error>;
	type SerializeTupleStruct   = Impossible<String, Error>;
	type SerializeTupleVariant  = Impossible<String, Error>;
	type SerializeMap           = Impossible<String, Error>;
	type SerializeStruct        = Impossible<String, Error>;
	type SerializeStructVariant = Impossible<String, Error>;

	fn serialize_str(self, v: &str) -> Result<String, Error> {
		Ok(v.to_string())
	}

	fn serialize_char(self, v: char) -> Result<String, Error> {
		Ok(v.to_string())
	}

	fn serialize_i64(self, v: i64) -> Result<String, Error> {
		Ok(v.to_string())
	}

	fn serialize_u64(self, v: u64) -> Result<String, Error> {
		Ok(v.to_string())
	}

	fn serialize_i8(self, v: i8)   -> Result<String, Error> { self.serialize_i64(v.into()) }
	fn serialize_i16(self, v: i16) -> Result<String, Error> { self.serialize_i64(v.into()) }
	fn serialize_i32(self, v: i32) -> Result<String, Error> { self.serialize_i64(v.into()) }
	fn serialize_u8(self, v: u8)   -> Result<String, Error> { self.serialize_u64(v.into()) }
	fn serialize_u16(self, v: u16) -> Result<String, Error> { self.serialize_u64(v.into()) }
	fn serialize_u32(self, v: u32) -> Result<String, Error> { self.serialize_u64(v.into()) }

	fn serialize_unit_variant(
		self,
		_name:          &'static str,
		_variant_index: u32,
		variant:        &'static str
	) -> Result<String, Error> {
		Ok(variant.to_string())
	}

	fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<String, Error> {
		value.serialize(self)
	}

	fn serialize_newtype_struct<T: Serialize + ?Sized>(
		self,
		_name: &'static str,
		value: &T
	) -> Result<String, Error> {
		value.serialize(self)
	}

	fn serialize_bool(self, _v: bool) -> Result<String, Error> { Err(Error::InvalidKey) }
	fn serialize_f32(self, _v: f32) -> Result<String, Error> { Err(Error::InvalidKey) }
	fn serialize_f64(self, _v: f64) -> Result<String, Error> { Err(Error::InvalidKey) }
	fn serialize_bytes(self, _v: &[u8]) -> Result<String, Error> { Err(Error::InvalidKey) }
	fn serialize_none(self) -> Result<String, Error> { Err(Error::InvalidKey) }
	fn serialize_unit(self) -> Result<String, Error> { Err(Error::InvalidKey) }

	fn serialize_unit_struct(self, _name: &'static str) -> Result<String, Error> {
		Err(Error::InvalidKey)
	}

	fn serialize_newtype_variant<T: Serialize + ?Sized>(
		self,
		_name:          &'static str,
		_variant_index: u32,
		_variant:       &'static str,
		_value:         &T
	) -> Result<String, Error> {
		Err(Error::InvalidKey)
	}

	fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, Error> {
		Err(Error::InvalidKey)
	}

	fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, Error> {
		Err(Error::InvalidKey)
	}

	fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeTupleStruct, Error> {
		Err(Error::InvalidKey)
	}

	fn serialize_tuple_variant(
		self,
		_name:          &'static str,
		_variant_index: u32,
		_variant:       &'static str,
		_len:           usize
	) -> Result<Self::SerializeTupleVariant, Error> {
		Err(Error::InvalidKey)
	}

	fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, Error> {
		Err(Error::InvalidKey)
	}

	fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeStruct, Error> {
		Err(Error::InvalidKey)
	}

	fn serialize_struct_variant(
		self,
		_name:          &'static str,
		_variant_index: u32,
		_variant:       &'static str,
		_len:           usize
	) -> Result<Self::SerializeStructVariant, Error> {
		Err(Error::InvalidKey)
	}
}
