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
	crate::{common::{Result, ServerAddress}, bdoc::{Document, Object, Value}},
	std::io
};

/// Message option permitting dispatch to a secondary.
pub const OPTION_SLAVE_OK: u32 = 1 << 2;

/// An outbound message: an encoded body plus an options bitset.
///
/// A message is passed by value through `say`/`call` and dropped exactly
/// once after use, releasing whatever its body holds.
#[derive(Debug, Clone)]
pub struct Message {
	body:    Document,
	options: u32
}

impl Message {
	pub fn new(body: Document) -> Self {
		Self { body, options: 0 }
	}

	pub fn with_options(body: Document, options: u32) -> Self {
		Self { body, options }
	}

	pub fn has_option(&self, option: u32) -> bool {
		self.options & option != 0
	}

	pub fn body(&self) -> &Document {
		&self.body
	}
}

/// An error the server embedded in a response.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServerError {
	pub code:    i32,
	pub message: String
}

impl ServerError {
	/// True when the node refused the operation because it is not the
	/// replica set's primary.
	pub fn is_not_master(&self) -> bool {
		self.message.starts_with("not master")
	}
}

impl std::fmt::Display for ServerError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "server error {}: {}", self.code, self.message)
	}
}

/// A framed reply: the decoded documents the server returned.
#[derive(Debug, Clone, Default)]
pub struct Response {
	documents: Vec<Object>
}

impl Response {
	pub fn new(documents: Vec<Object>) -> Self {
		Self { documents }
	}

	pub fn documents(&self) -> &[Object] {
		&self.documents
	}

	/// The error embedded in the reply, if any.
	pub fn error(&self) -> Option<ServerError> {
		let first = self.documents.first()?;
		let message = first.get_str("$err")?;
		Some(ServerError {
			code:    first.get_i32("code").unwrap_or(-1),
			message: message.to_string()
		})
	}
}

/// The single decoded document a command returns.
#[derive(Debug, Clone)]
pub struct CommandResult(Object);

impl CommandResult {
	pub fn new(object: Object) -> Self {
		Self(object)
	}

	pub fn ok(&self) -> bool {
		match self.0.get("ok") {
			Some(Value::Boolean(v)) => *v,
			Some(v) => v.as_f64() == Some(1.0),
			None => false
		}
	}

	/// The `err` field, when present and not null.
	pub fn error_message(&self) -> Option<&str> {
		self.0.get("err").and_then(Value::as_str)
	}

	pub fn code(&self) -> Option<i32> {
		self.0.get_i32("code")
	}
}

impl std::ops::Deref for CommandResult {
	type Target = Object;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

/// One wire connection to one server, exclusively held by whoever checked
/// it out of a pool.
///
/// Implementations own the socket, track which databases the connection has
/// authenticated against, and frame requests/replies; the coordinator only
/// sequences these calls.
pub trait Port: Send {
	/// Writes the message without awaiting a reply.
	fn send(&mut self, message: &Message) -> io::Result<()>;

	/// Writes the message and reads the framed response.
	fn call(&mut self, message: &Message, collection: &str) -> io::Result<Response>;

	/// Runs a command against `db` and decodes its single reply document.
	fn run_command(&mut self, db: &str, command: &Document) -> io::Result<CommandResult>;

	/// Ensures this connection is authenticated for `db`; idempotent.
	fn check_auth(&mut self, db: &str) -> Result<()>;

	/// Destroys the socket. The port must not be used afterwards.
	fn close(&mut self);
}

/// Opens ports; the transport (TCP, TLS, in-memory) lives behind this seam.
pub trait PortFactory: Send + Sync {
	fn open(&self, address: &ServerAddress) -> io::Result<Box<dyn Port>>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn message_options() {
		let message = Message::new(Document::new());
		assert!(!message.has_option(OPTION_SLAVE_OK));

		let message = Message::with_options(Document::new(), OPTION_SLAVE_OK);
		assert!(message.has_option(OPTION_SLAVE_OK));
	}

	#[test]
	fn response_error_extraction() {
		assert!(Response::new(Vec::new()).error().is_none());

		let mut object = Object::new();
		object.put("$err", "not master");
		object.put("code", 13435i32);
		let error = Response::new(vec![object]).error().unwrap();
		assert_eq!(error.code, 13435);
		assert!(error.is_not_master());

		let mut object = Object::new();
		object.put("$err", "unauthorized");
		let error = Response::new(vec![object]).error().unwrap();
		assert_eq!(error.code, -1);
		assert!(!error.is_not_master());
	}

	#[test]
	fn command_result_ok_forms() {
		let mut object = Object::new();
		object.put("ok", 1.0f64);
		assert!(CommandResult::new(object).ok());

		let mut object = Object::new();
		object.put("ok", 1i32);
		assert!(CommandResult::new(object).ok());

		let mut object = Object::new();
		object.put("ok", false);
		assert!(!CommandResult::new(object).ok());

		assert!(!CommandResult::new(Object::new()).ok());
	}

	#[test]
	fn command_result_null_err_is_absent() {
		let mut object = Object::new();
		object.put("ok", 1.0f64);
		object.put("err", Value::Null);
		let result = CommandResult::new(object);
		assert!(result.error_message().is_none());
	}
}
