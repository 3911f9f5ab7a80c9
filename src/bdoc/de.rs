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
	std::{io, str::Utf8Error}
};

#[derive(Debug)]
pub enum Error {
	Io(io::Error),
	UnexpectedEof,
	UnsupportedType { tag: u8, name: String },
	BadLength(i32),
	BadBinarySubtype { subtype: u8, total: i32 },
	InvalidUtf8(Utf8Error),
	LengthMismatch { declared: usize, decoded: usize }
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		std::fmt::Debug::fmt(self, f)
	}
}

impl std::error::Error for Error {}

/// Receives one event per decoded element and builds an arbitrary in-memory
/// representation of the document.
///
/// Dispatch is static: the decoder is generic over its callback, and the
/// event set is fixed by the wire format.
pub trait Callback {
	/// The representation this callback builds.
	type Output;

	fn object_start(&mut self);
	fn object_start_named(&mut self, name: &str);
	fn object_done(&mut self);
	fn array_start(&mut self, name: &str);
	fn array_done(&mut self);

	fn got_null(&mut self, name: &str);
	fn got_undefined(&mut self, name: &str);
	fn got_min_key(&mut self, name: &str);
	fn got_max_key(&mut self, name: &str);
	fn got_boolean(&mut self, name: &str, v: bool);
	fn got_double(&mut self, name: &str, v: f64);
	fn got_int(&mut self, name: &str, v: i32);
	fn got_long(&mut self, name: &str, v: i64);
	fn got_date(&mut self, name: &str, millis: i64);
	fn got_string(&mut self, name: &str, v: String);
	fn got_symbol(&mut self, name: &str, v: String);
	fn got_code(&mut self, name: &str, v: String);
	fn got_code_w_scope(&mut self, name: &str, code: String, scope: Self::Output);
	fn got_object_id(&mut self, name: &str, v: ObjectId);
	fn got_db_ref(&mut self, name: &str, ns: String, id: ObjectId);
	fn got_regex(&mut self, name: &str, pattern: String, options: String);
	fn got_timestamp(&mut self, name: &str, time: i32, increment: i32);
	fn got_binary_array(&mut self, name: &str, data: Vec<u8>);
	fn got_binary(&mut self, name: &str, subtype: u8, data: Vec<u8>);
	fn got_uuid(&mut self, name: &str, part1: i64, part2: i64);

	/// A fresh callback of the same kind, used for scoped-code documents.
	fn make_child(&mut self) -> Self where Self: Sized;
	/// Clears any in-progress state.
	fn reset(&mut self);
	/// Takes the built value.
	fn get(&mut self) -> Self::Output;
}

/// Decodes one document from `src`, dispatching events to `callback`.
/// Returns the declared outer length on success.
pub fn decode<R: io::Read, C: Callback>(src: R, callback: &mut C) -> Result<usize, Error> {
	let mut input = BufferedInput::new(src)?;
	decode_from(&mut input, callback)
}

/// Decodes one document from an input whose length prefix has already been
/// consumed by [`BufferedInput::new`]. The byte count is checked against
/// the declared length; a disagreement is fatal.
pub fn decode_from<R: io::Read, C: Callback>(
	input:    &mut BufferedInput<R>,
	callback: &mut C
) -> Result<usize, Error> {
	let start = input.bytes_read() - 4;

	callback.object_start();
	while decode_element(input, callback)? {}
	callback.object_done();

	let decoded = input.bytes_read() - start;
	if decoded != input.length() {
		return Err(Error::LengthMismatch { declared: input.length(), decoded });
	}

	Ok(input.length())
}

/// Decodes one document into the standard [`Object`] tree.
pub fn read_object<R: io::Read>(src: R) -> Result<Object, Error> {
	let mut callback = ObjectCallback::new();
	decode(src, &mut callback)?;
	Ok(callback.get())
}

fn decode_element<R: io::Read, C: Callback>(
	input:    &mut BufferedInput<R>,
	callback: &mut C
) -> Result<bool, Error> {
	let tag = input.read_byte()?;
	if tag == EOO {
		return Ok(false);
	}

	let name = input.read_cstr()?;
	let name = name.as_ref();

	match tag {
		NULL      => callback.got_null(name),
		UNDEFINED => callback.got_undefined(name),
		MIN_KEY   => callback.got_min_key(name),
		MAX_KEY   => callback.got_max_key(name),
		BOOLEAN   => {
			let v = input.read_byte()?;
			callback.got_boolean(name, v != 0);
		}
		DOUBLE    => {
			let v = input.read_f64()?;
			callback.got_double(name, v);
		}
		INT32     => {
			let v = input.read_i32()?;
			callback.got_int(name, v);
		}
		INT64     => {
			let v = input.read_i64()?;
			callback.got_long(name, v);
		}
		DATE_TIME => {
			let v = input.read_i64()?;
			callback.got_date(name, v);
		}
		STRING    => {
			let v = input.read_utf8_string()?;
			callback.got_string(name, v);
		}
		SYMBOL    => {
			let v = input.read_utf8_string()?;
			callback.got_symbol(name, v);
		}
		CODE      => {
			let v = input.read_utf8_string()?;
			callback.got_code(name, v);
		}
		OBJECT_ID => {
			let time = input.read_i32()?;
			let machine = input.read_i32()?;
			let inc = input.read_i32()?;
			callback.got_object_id(name, ObjectId::from_parts(time, machine, inc));
		}
		DB_REF    => {
			// length of the namespace string that follows
			input.read_i32()?;
			let ns = input.read_cstr()?.into_owned();
			let time = input.read_i32()?;
			let machine = input.read_i32()?;
			let inc = input.read_i32()?;
			callback.got_db_ref(name, ns, ObjectId::from_parts(time, machine, inc));
		}
		REGEX     => {
			let pattern = input.read_cstr()?.into_owned();
			let options = input.read_cstr()?.into_owned();
			callback.got_regex(name, pattern, options);
		}
		TIMESTAMP => {
			let increment = input.read_i32()?;
			let time = input.read_i32()?;
			callback.got_timestamp(name, time, increment);
		}
		BINARY    => decode_binary(input, callback, name)?,
		CODE_W_SCOPE => {
			// total size, already implied by the parts
			input.read_i32()?;
			let code = input.read_utf8_string()?;
			let scope = decode_scope(input, callback)?;
			callback.got_code_w_scope(name, code, scope);
		}
		ARRAY     => {
			input.read_i32()?;
			callback.array_start(name);
			while decode_element(input, callback)? {}
			callback.array_done();
		}
		OBJECT    => {
			input.read_i32()?;
			callback.object_start_named(name);
			while decode_element(input, callback)? {}
			callback.object_done();
		}
		tag => return Err(Error::UnsupportedType { tag, name: name.to_string() })
	}

	Ok(true)
}

fn decode_binary<R: io::Read, C: Callback>(
	input:    &mut BufferedInput<R>,
	callback: &mut C,
	name:     &str
) -> Result<(), Error> {
	let total = input.read_i32()?;
	if total < 0 {
		return Err(Error::BadLength(total));
	}
	let subtype = input.read_byte()?;

	match subtype {
		SUBTYPE_GENERIC => {
			let mut data = vec![0u8; total as usize];
			input.fill(&mut data)?;
			callback.got_binary_array(name, data);
		}
		SUBTYPE_LEGACY => {
			let len = input.read_i32()?;
			if len < 0 || len + 4 != total {
				return Err(Error::BadBinarySubtype { subtype, total });
			}
			let mut data = vec![0u8; len as usize];
			input.fill(&mut data)?;
			callback.got_binary_array(name, data);
		}
		SUBTYPE_UUID => {
			if total != 16 {
				return Err(Error::BadBinarySubtype { subtype, total });
			}
			let part1 = input.read_i64()?;
			let part2 = input.read_i64()?;
			callback.got_uuid(name, part1, part2);
		}
		subtype => {
			let mut data = vec![0u8; total as usize];
			input.fill(&mut data)?;
			callback.got_binary(name, subtype, data);
		}
	}
	Ok(())
}

/// Decodes the scope document of a scoped-code element into a fresh child
/// callback and returns the child's built value.
fn decode_scope<R: io::Read, C: Callback>(
	input:    &mut BufferedInput<R>,
	callback: &mut C
) -> Result<C::Output, Error> {
	input.read_i32()?;

	let mut child = callback.make_child();
	child.reset();
	child.object_start();
	while decode_element(input, &mut child)? {}
	child.object_done();

	Ok(child.get())
}

/// The standard callback: builds the insertion-ordered [`Object`] tree.
#[derive(Debug, Default)]
pub struct ObjectCallback {
	root:  Option<Object>,
	stack: Vec<Frame>
}

#[derive(Debug)]
enum Frame {
	Object { name: Option<String>, object: Object },
	Array { name: String, items: Vec<Value> }
}

impl ObjectCallback {
	pub fn new() -> Self {
		Self::default()
	}

	fn put(&mut self, name: &str, value: Value) {
		match self.stack.last_mut() {
			Some(Frame::Object { object, .. }) => object.put(name, value),
			Some(Frame::Array { items, .. })   => items.push(value),
			// terminal before any container, tolerated as an empty root
			None => {
				let mut object = Object::new();
				object.put(name, value);
				self.root = Some(object);
			}
		}
	}
}

impl Callback for ObjectCallback {
	type Output = Object;

	fn object_start(&mut self) {
		self.stack.push(Frame::Object { name: None, object: Object::new() });
	}

	fn object_start_named(&mut self, name: &str) {
		self.stack.push(Frame::Object { name: Some(name.to_string()), object: Object::new() });
	}

	fn object_done(&mut self) {
		match self.stack.pop() {
			Some(Frame::Object { name: Some(name), object }) if !self.stack.is_empty() =>
				self.put(&name, Value::Object(object)),
			Some(Frame::Object { object, .. }) => self.root = Some(object),
			_ => ()
		}
	}

	fn array_start(&mut self, name: &str) {
		self.stack.push(Frame::Array { name: name.to_string(), items: Vec::new() });
	}

	fn array_done(&mut self) {
		if let Some(Frame::Array { name, items }) = self.stack.pop() {
			self.put(&name, Value::Array(items));
		}
	}

	fn got_null(&mut self, name: &str) { self.put(name, Value::Null) }
	fn got_undefined(&mut self, name: &str) { self.put(name, Value::Undefined) }
	fn got_min_key(&mut self, name: &str) { self.put(name, Value::MinKey) }
	fn got_max_key(&mut self, name: &str) { self.put(name, Value::MaxKey) }
	fn got_boolean(&mut self, name: &str, v: bool) { self.put(name, Value::Boolean(v)) }
	fn got_double(&mut self, name: &str, v: f64) { self.put(name, Value::Double(v)) }
	fn got_int(&mut self, name: &str, v: i32) { self.put(name, Value::Int32(v)) }
	fn got_long(&mut self, name: &str, v: i64) { self.put(name, Value::Int64(v)) }
	fn got_date(&mut self, name: &str, millis: i64) { self.put(name, Value::DateTime(UtcDateTime(millis))) }
	fn got_string(&mut self, name: &str, v: String) { self.put(name, Value::String(v)) }
	fn got_symbol(&mut self, name: &str, v: String) { self.put(name, Value::Symbol(v)) }
	fn got_code(&mut self, name: &str, v: String) { self.put(name, Value::Code(v)) }

	fn got_code_w_scope(&mut self, name: &str, code: String, scope: Object) {
		self.put(name, Value::CodeWithScope(CodeWithScope { code, scope }));
	}

	fn got_object_id(&mut self, name: &str, v: ObjectId) { self.put(name, Value::ObjectId(v)) }

	fn got_db_ref(&mut self, name: &str, ns: String, id: ObjectId) {
		self.put(name, Value::DbRef(DbRef { ns, id }));
	}

	fn got_regex(&mut self, name: &str, pattern: String, options: String) {
		self.put(name, Value::Regex(Regex { pattern, options }));
	}

	fn got_timestamp(&mut self, name: &str, time: i32, increment: i32) {
		self.put(name, Value::Timestamp(Timestamp { time, increment }));
	}

	fn got_binary_array(&mut self, name: &str, data: Vec<u8>) {
		self.put(name, Value::Binary(Binary::generic(data)));
	}

	fn got_binary(&mut self, name: &str, subtype: u8, data: Vec<u8>) {
		self.put(name, Value::Binary(Binary { subtype, bytes: data }));
	}

	fn got_uuid(&mut self, name: &str, part1: i64, part2: i64) {
		self.put(name, Value::Binary(Binary::uuid(part1, part2)));
	}

	fn make_child(&mut self) -> Self {
		Self::new()
	}

	fn reset(&mut self) {
		self.root = None;
		self.stack.clear();
	}

	fn get(&mut self) -> Object {
		self.root.take().unwrap_or_default()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn roundtrip(object: &Object) -> Object {
		let doc = Document::from_object(object);
		let decoded = read_object(doc.as_slice()).unwrap();
		assert_eq!(doc.len(), i32::from_le_bytes([doc[0], doc[1], doc[2], doc[3]]) as usize);
		decoded
	}

	#[test]
	fn empty_document() {
		let doc = Document::new();
		assert_eq!(doc.0, vec![5, 0, 0, 0, 0]);

		let mut callback = ObjectCallback::new();
		assert_eq!(decode(doc.as_slice(), &mut callback).unwrap(), 5);
		assert!(callback.get().is_empty());
	}

	#[test]
	fn scalar_roundtrip() {
		let mut object = Object::new();
		object.put("double", 1.25f64);
		object.put("string", "hello");
		object.put("bool_t", true);
		object.put("bool_f", false);
		object.put("i32", -7i32);
		object.put("i64", 1i64 << 40);
		object.put("date", Value::DateTime(UtcDateTime(1_234_567)));
		object.put("null", Value::Null);
		object.put("undef", Value::Undefined);
		object.put("min", Value::MinKey);
		object.put("max", Value::MaxKey);
		assert_eq!(roundtrip(&object), object);
	}

	#[test]
	fn every_element_type() {
		let mut nested = Object::new();
		nested.put("inner", "value");

		let mut object = Object::new();
		object.put("double", 2.5f64);
		object.put("string", "s");
		object.put("object", Value::Object(nested));
		object.put("array", Value::Array(vec![
			Value::Int32(1), Value::String("two".to_string()), Value::Boolean(true)
		]));
		object.put("binary", Value::Binary(Binary::generic(vec![1, 2, 3])));
		object.put("undefined", Value::Undefined);
		object.put("oid", Value::ObjectId(ObjectId::from_parts(1, 2, 3)));
		object.put("boolean", true);
		object.put("date", Value::DateTime(UtcDateTime(42)));
		object.put("null", Value::Null);
		object.put("regex", Value::Regex(Regex {
			pattern: "^a.*b$".to_string(),
			options: "i".to_string()
		}));
		object.put("dbref", Value::DbRef(DbRef {
			ns: "db.coll".to_string(),
			id: ObjectId::from_parts(4, 5, 6)
		}));
		object.put("code", Value::Code("return 1;".to_string()));
		object.put("symbol", Value::Symbol("sym".to_string()));
		object.put("codews", Value::CodeWithScope(CodeWithScope {
			code:  "return x;".to_string(),
			scope: {
				let mut scope = Object::new();
				scope.put("x", 1i32);
				scope
			}
		}));
		object.put("int32", 7i32);
		object.put("ts", Value::Timestamp(Timestamp { time: 100, increment: 2 }));
		object.put("int64", -1i64);
		object.put("min", Value::MinKey);
		object.put("max", Value::MaxKey);

		let doc = Document::from_object(&object);
		let mut callback = ObjectCallback::new();
		let len = decode(doc.as_slice(), &mut callback).unwrap();
		// every byte of the frame is consumed
		assert_eq!(len, doc.len());
		assert_eq!(callback.get(), object);
	}

	#[test]
	fn nested_arrays_and_objects() {
		let mut leaf = Object::new();
		leaf.put("deep", Value::Array(vec![Value::Null, Value::Int64(9)]));

		let mut object = Object::new();
		object.put("list", Value::Array(vec![
			Value::Object(leaf),
			Value::Array(vec![Value::Int32(1)])
		]));
		assert_eq!(roundtrip(&object), object);
	}

	#[test]
	fn legacy_binary_roundtrips_as_generic() {
		let mut object = Object::new();
		object.put("bin", Value::Binary(Binary {
			subtype: SUBTYPE_LEGACY,
			bytes:   vec![9, 8, 7]
		}));

		let doc = Document::from_object(&object);
		let decoded = read_object(doc.as_slice()).unwrap();
		assert_eq!(
			decoded.get("bin"),
			Some(&Value::Binary(Binary::generic(vec![9, 8, 7])))
		);
	}

	#[test]
	fn opaque_binary_subtype_is_preserved() {
		let mut object = Object::new();
		object.put("bin", Value::Binary(Binary { subtype: 0x80, bytes: vec![0xAA] }));
		assert_eq!(roundtrip(&object), object);
	}

	#[test]
	fn uuid_roundtrip() {
		let mut object = Object::new();
		object.put("id", Value::Binary(Binary::uuid(0x0102_0304_0506_0708, -9)));
		assert_eq!(roundtrip(&object), object);
	}

	#[test]
	fn legacy_binary_bad_inner_length() {
		// subtype 0x02 whose inner length disagrees with the total
		let mut builder = DocBuilder::new();
		builder.element(BINARY, "bin");
		builder.push_i32(7);
		builder.push_byte(SUBTYPE_LEGACY);
		builder.push_i32(5);
		builder.extend(&[0u8; 5]);
		let doc = builder.finish();

		assert!(matches!(
			read_object(doc.as_slice()),
			Err(Error::BadBinarySubtype { subtype: SUBTYPE_LEGACY, total: 7 })
		));
	}

	#[test]
	fn uuid_bad_total_length() {
		let mut builder = DocBuilder::new();
		builder.element(BINARY, "id");
		builder.push_i32(8);
		builder.push_byte(SUBTYPE_UUID);
		builder.extend(&[0u8; 8]);
		let doc = builder.finish();

		assert!(matches!(
			read_object(doc.as_slice()),
			Err(Error::BadBinarySubtype { subtype: SUBTYPE_UUID, total: 8 })
		));
	}

	#[test]
	fn unsupported_tag() {
		let mut builder = DocBuilder::new();
		builder.element(0x42, "weird");
		let doc = builder.finish();

		match read_object(doc.as_slice()) {
			Err(Error::UnsupportedType { tag: 0x42, name }) => assert_eq!(name, "weird"),
			other => panic!("expected unsupported type, got {:?}", other)
		}
	}

	#[test]
	fn length_mismatch_is_fatal() {
		let mut object = Object::new();
		object.put("a", 1i32);
		let mut doc = Document::from_object(&object);
		// declare one byte more than the document holds, padding the source
		let declared = doc.len() as i32 + 1;
		doc.0[..4].copy_from_slice(&declared.to_le_bytes());
		doc.0.push(0);

		assert!(matches!(
			read_object(doc.as_slice()),
			Err(Error::LengthMismatch { .. })
		));
	}

	#[test]
	fn truncated_document() {
		let mut object = Object::new();
		object.put("s", "truncated soon");
		let doc = Document::from_object(&object);
		assert!(matches!(
			read_object(&doc.as_slice()[..doc.len() - 6]),
			Err(Error::UnexpectedEof)
		));
	}

	#[test]
	fn large_document_crosses_readahead_window() {
		// values larger than the 1 KiB initial window force compaction mid-parse
		let big = vec![0x5Au8; 4096];
		let mut object = Object::new();
		object.put("before", 1i32);
		object.put("big", Value::Binary(Binary::generic(big)));
		object.put("text", "x".repeat(2000));
		object.put("after", 2i32);
		assert_eq!(roundtrip(&object), object);
	}
}
