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

pub use self::{
	doc::*,
	oid::*,
	object::*,
	binary::*,
	utc_date_time::*,
	timestamp::*,
	input::{BufferedInput, MAX_READAHEAD},
	de::{Callback, ObjectCallback, decode, decode_from, read_object}
};

pub mod doc;
pub mod se;
pub mod de;
pub mod oid;
pub mod input;

/// Element tags of the BDOC wire format, one per value type.
pub const EOO:          u8 = 0x00;
pub const DOUBLE:       u8 = 0x01;
pub const STRING:       u8 = 0x02;
pub const OBJECT:       u8 = 0x03;
pub const ARRAY:        u8 = 0x04;
pub const BINARY:       u8 = 0x05;
pub const UNDEFINED:    u8 = 0x06;
pub const OBJECT_ID:    u8 = 0x07;
pub const BOOLEAN:      u8 = 0x08;
pub const DATE_TIME:    u8 = 0x09;
pub const NULL:         u8 = 0x0A;
pub const REGEX:        u8 = 0x0B;
pub const DB_REF:       u8 = 0x0C;
pub const CODE:         u8 = 0x0D;
pub const SYMBOL:       u8 = 0x0E;
pub const CODE_W_SCOPE: u8 = 0x0F;
pub const INT32:        u8 = 0x10;
pub const TIMESTAMP:    u8 = 0x11;
pub const INT64:        u8 = 0x12;
pub const MIN_KEY:      u8 = 0xFF;
pub const MAX_KEY:      u8 = 0x7F;

/// A single decoded BDOC value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	Double(f64),
	String(String),
	Object(Object),
	Array(Vec<Value>),
	Binary(Binary),
	Undefined,
	ObjectId(ObjectId),
	Boolean(bool),
	DateTime(UtcDateTime),
	Null,
	Regex(Regex),
	DbRef(DbRef),
	Code(String),
	Symbol(String),
	CodeWithScope(CodeWithScope),
	Int32(i32),
	Timestamp(Timestamp),
	Int64(i64),
	MinKey,
	MaxKey
}

impl Value {
	/// Returns the wire tag of the contained value.
	pub fn tag(&self) -> u8 {
		match self {
			Value::Double(_)        => DOUBLE,
			Value::String(_)        => STRING,
			Value::Object(_)        => OBJECT,
			Value::Array(_)         => ARRAY,
			Value::Binary(_)        => BINARY,
			Value::Undefined        => UNDEFINED,
			Value::ObjectId(_)      => OBJECT_ID,
			Value::Boolean(_)       => BOOLEAN,
			Value::DateTime(_)      => DATE_TIME,
			Value::Null             => NULL,
			Value::Regex(_)         => REGEX,
			Value::DbRef(_)         => DB_REF,
			Value::Code(_)          => CODE,
			Value::Symbol(_)        => SYMBOL,
			Value::CodeWithScope(_) => CODE_W_SCOPE,
			Value::Int32(_)         => INT32,
			Value::Timestamp(_)     => TIMESTAMP,
			Value::Int64(_)         => INT64,
			Value::MinKey           => MIN_KEY,
			Value::MaxKey           => MAX_KEY
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Value::String(v) | Value::Symbol(v) => Some(v),
			_ => None
		}
	}

	pub fn as_bool(&self) -> Option<bool> {
		match self {
			Value::Boolean(v) => Some(*v),
			_ => None
		}
	}

	pub fn as_i32(&self) -> Option<i32> {
		match self {
			Value::Int32(v)  => Some(*v),
			Value::Int64(v)  => Some(*v as i32),
			Value::Double(v) => Some(*v as i32),
			_ => None
		}
	}

	pub fn as_i64(&self) -> Option<i64> {
		match self {
			Value::Int64(v)  => Some(*v),
			Value::Int32(v)  => Some(*v as i64),
			Value::Double(v) => Some(*v as i64),
			_ => None
		}
	}

	pub fn as_f64(&self) -> Option<f64> {
		match self {
			Value::Double(v) => Some(*v),
			Value::Int32(v)  => Some(*v as f64),
			Value::Int64(v)  => Some(*v as f64),
			_ => None
		}
	}

	pub fn as_object(&self) -> Option<&Object> {
		match self {
			Value::Object(v) => Some(v),
			_ => None
		}
	}

	pub fn as_array(&self) -> Option<&[Value]> {
		match self {
			Value::Array(v) => Some(v),
			_ => None
		}
	}

	/// True for the wire-level "no value" markers.
	pub fn is_null(&self) -> bool {
		matches!(self, Value::Null | Value::Undefined)
	}
}

impl From<bool> for Value { fn from(v: bool) -> Self { Value::Boolean(v) } }
impl From<i32> for Value { fn from(v: i32) -> Self { Value::Int32(v) } }
impl From<i64> for Value { fn from(v: i64) -> Self { Value::Int64(v) } }
impl From<f64> for Value { fn from(v: f64) -> Self { Value::Double(v) } }
impl From<&str> for Value { fn from(v: &str) -> Self { Value::String(v.to_string()) } }
impl From<String> for Value { fn from(v: String) -> Self { Value::String(v) } }
impl From<ObjectId> for Value { fn from(v: ObjectId) -> Self { Value::ObjectId(v) } }
impl From<Object> for Value { fn from(v: Object) -> Self { Value::Object(v) } }
impl From<Vec<Value>> for Value { fn from(v: Vec<Value>) -> Self { Value::Array(v) } }
impl From<Binary> for Value { fn from(v: Binary) -> Self { Value::Binary(v) } }
impl From<UtcDateTime> for Value { fn from(v: UtcDateTime) -> Self { Value::DateTime(v) } }
impl From<Timestamp> for Value { fn from(v: Timestamp) -> Self { Value::Timestamp(v) } }

/// A regular expression consisting of a pattern and options.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct Regex {
	pub pattern: String,
	pub options: String
}

/// A reference to a document in another namespace.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DbRef {
	pub ns: String,
	pub id: ObjectId
}

/// Code to be executed on the database server, with its own scope document.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeWithScope {
	pub code:  String,
	pub scope: Object
}

mod object {
	use super::Value;

	/// An insertion-ordered document: a sequence of named values.
	#[derive(Debug, Clone, PartialEq, Default)]
	pub struct Object(pub Vec<(String, Value)>);

	impl Object {
		pub fn new() -> Self {
			Self(Vec::new())
		}

		pub fn put(&mut self, name: impl Into<String>, value: impl Into<Value>) {
			self.0.push((name.into(), value.into()));
		}

		pub fn len(&self) -> usize {
			self.0.len()
		}

		pub fn is_empty(&self) -> bool {
			self.0.is_empty()
		}

		/// Returns the first value stored under `name`.
		pub fn get(&self, name: &str) -> Option<&Value> {
			self.0.iter()
				.find(|(k, _)| k == name)
				.map(|(_, v)| v)
		}

		pub fn contains_key(&self, name: &str) -> bool {
			self.get(name).is_some()
		}

		pub fn get_str(&self, name: &str) -> Option<&str> {
			self.get(name).and_then(Value::as_str)
		}

		pub fn get_bool(&self, name: &str) -> Option<bool> {
			self.get(name).and_then(Value::as_bool)
		}

		pub fn get_i32(&self, name: &str) -> Option<i32> {
			self.get(name).and_then(Value::as_i32)
		}

		pub fn get_i64(&self, name: &str) -> Option<i64> {
			self.get(name).and_then(Value::as_i64)
		}

		pub fn get_array(&self, name: &str) -> Option<&[Value]> {
			self.get(name).and_then(Value::as_array)
		}

		pub fn iter(&self) -> std::slice::Iter<(String, Value)> {
			self.0.iter()
		}
	}

	impl<K: Into<String>, V: Into<Value>> std::iter::FromIterator<(K, V)> for Object {
		fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
			Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
		}
	}

	impl<'a> IntoIterator for &'a Object {
		type Item     = &'a (String, Value);
		type IntoIter = std::slice::Iter<'a, (String, Value)>;

		fn into_iter(self) -> Self::IntoIter {
			self.0.iter()
		}
	}
}

mod binary {
	/// Binary data, a densely stored byte array with a subtype.
	#[derive(Debug, Clone, Eq, PartialEq)]
	pub struct Binary {
		pub subtype: u8,
		pub bytes:   Vec<u8>
	}

	pub const SUBTYPE_GENERIC: u8 = 0x00;
	/// Legacy encoding that carries a redundant inner length.
	pub const SUBTYPE_LEGACY:  u8 = 0x02;
	pub const SUBTYPE_UUID:    u8 = 0x03;

	impl Binary {
		pub fn generic(bytes: Vec<u8>) -> Self {
			Self { subtype: SUBTYPE_GENERIC, bytes }
		}

		/// Builds the 16-byte UUID payload from its two halves.
		pub fn uuid(part1: i64, part2: i64) -> Self {
			let mut bytes = Vec::with_capacity(16);
			bytes.extend_from_slice(&part1.to_le_bytes());
			bytes.extend_from_slice(&part2.to_le_bytes());
			Self { subtype: SUBTYPE_UUID, bytes }
		}
	}
}

mod utc_date_time {
	use std::time::{SystemTime, UNIX_EPOCH};

	/// Utc date time represented as milliseconds since the epoch.
	#[repr(transparent)]
	#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
	pub struct UtcDateTime(pub i64);

	impl UtcDateTime {
		pub fn now() -> Self {
			Self(SystemTime::now().duration_since(UNIX_EPOCH)
				.unwrap_or_default().as_millis() as _)
		}
	}
}

mod timestamp {
	/// An internal replication timestamp: seconds plus an ordinal within the second.
	#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
	pub struct Timestamp {
		pub time:      i32,
		pub increment: i32
	}
}
