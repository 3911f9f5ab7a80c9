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
	crate::{bdoc::{self, Document, Object}, wire::{CommandResult, ServerError}},
	std::{io, str::FromStr, time::Duration},
	serde::Serialize
};

pub const DEFAULT_PORT:                u16      = 27017;
pub const DEFAULT_MAX_POOL_SIZE:       usize    = 100;
pub const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);
pub const DEFAULT_PROBE_STALENESS:     Duration = Duration::from_secs(15);
pub const DEFAULT_CALL_RETRIES:        usize    = 2;

/// Commands travel through this pseudo-collection; calls against it are
/// never retried on I/O failure.
pub const COMMAND_COLLECTION: &str = "$cmd";

/// Host identity of one server, compared by value.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ServerAddress {
	host: String,
	port: u16
}

impl ServerAddress {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		Self { host: host.into(), port }
	}

	pub fn host(&self) -> &str {
		&self.host
	}

	pub fn port(&self) -> u16 {
		self.port
	}
}

impl FromStr for ServerAddress {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		if s.is_empty() {
			return Err(Error::InvalidArgument("address can't be empty"));
		}

		Ok(if let Some(i) = s.find(':') {
			Self {
				host: s[..i].to_string(),
				port: s[i + 1..].parse().map_err(|_|
					Error::InvalidArgument("failed to parse server address"))?
			}
		} else {
			Self { host: s.to_string(), port: DEFAULT_PORT }
		})
	}
}

impl std::fmt::Display for ServerAddress {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

#[derive(Debug, Clone)]
pub struct ConnectorOptions {
	pub pool:                ConnectionPoolOptions,
	pub heartbeat_frequency: Duration,
	pub probe_staleness:     Duration
}

impl Default for ConnectorOptions {
	fn default() -> Self {
		Self {
			pool:                ConnectionPoolOptions::default(),
			heartbeat_frequency: DEFAULT_HEARTBEAT_FREQUENCY,
			probe_staleness:     DEFAULT_PROBE_STALENESS
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnectionPoolOptions {
	/// Upper bound on ports per address; 0 means unbounded.
	pub max_pool_size: usize
}

impl Default for ConnectionPoolOptions {
	fn default() -> Self {
		Self { max_pool_size: DEFAULT_MAX_POOL_SIZE }
	}
}

/// How strongly a write must be confirmed before it is reported complete.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WriteConcern {
	/// Number of nodes that must acknowledge: negative ignores even network
	/// errors, 0 surfaces network errors without a server check, positive
	/// requests an acknowledgement command.
	pub w:            i32,
	pub w_timeout_ms: Option<i64>,
	pub journal:      Option<bool>
}

impl WriteConcern {
	/// No confirmation at all; network errors are swallowed into the result.
	pub const NONE:         WriteConcern = WriteConcern { w: -1, w_timeout_ms: None, journal: None };
	/// Fire and forget, but network errors are raised.
	pub const NORMAL:       WriteConcern = WriteConcern { w: 0, w_timeout_ms: None, journal: None };
	/// Confirmed by the primary through the acknowledgement command.
	pub const ACKNOWLEDGED: WriteConcern = WriteConcern { w: 1, w_timeout_ms: None, journal: None };

	pub fn call_get_last_error(&self) -> bool {
		self.w > 0 || self.journal == Some(true)
	}

	pub fn raise_network_errors(&self) -> bool {
		self.w >= 0
	}

	/// The acknowledgement command to run after the write.
	pub fn command(&self) -> Result<Document> {
		Ok(Document::from(&GetLastError {
			get_last_error: 1,
			w:              if self.w > 1 { Some(self.w) } else { None },
			wtimeout:       self.w_timeout_ms,
			j:              self.journal
		})?)
	}
}

impl Default for WriteConcern {
	fn default() -> Self {
		Self::ACKNOWLEDGED
	}
}

#[derive(Serialize)]
struct GetLastError {
	#[serde(rename = "getlasterror")]
	get_last_error: i32,
	#[serde(skip_serializing_if = "Option::is_none")]
	w:              Option<i32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	wtimeout:       Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	j:              Option<bool>
}

/// The outcome of a `say`: either the server's acknowledgement, or nothing
/// when the write concern did not request one.
#[derive(Debug)]
pub struct WriteResult {
	result: Option<CommandResult>
}

impl WriteResult {
	pub(crate) fn acknowledged(result: CommandResult) -> Self {
		Self { result: Some(result) }
	}

	pub(crate) fn unacknowledged() -> Self {
		Self { result: None }
	}

	/// Synthetic result reported when the write concern swallows network
	/// errors.
	pub(crate) fn network_error() -> Self {
		let mut object = Object::new();
		object.put("ok", false);
		object.put("err", "NETWORK ERROR");
		Self { result: Some(CommandResult::new(object)) }
	}

	pub fn is_acknowledged(&self) -> bool {
		self.result.is_some()
	}

	pub fn ok(&self) -> bool {
		self.result.as_ref().map_or(true, CommandResult::ok)
	}

	pub fn error(&self) -> Option<&str> {
		self.result.as_ref().and_then(CommandResult::error_message)
	}

	/// Number of documents affected, when the server reported one.
	pub fn n(&self) -> i64 {
		self.result.as_ref()
			.and_then(|r| r.get_i64("n"))
			.unwrap_or(0)
	}

	pub fn result(&self) -> Option<&CommandResult> {
		self.result.as_ref()
	}
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	InvalidArgument(&'static str),
	Closed,
	Sync,
	Network { cause: io::Error, retries_exhausted: bool },
	Auth(String),
	NotMasterExhausted,
	DuplicateKey(i32, String),
	WriteFailure(i32, String),
	Server(ServerError),
	Decode(bdoc::de::Error),
	Encode(bdoc::se::Error),
	Internal(&'static str)
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		<Self as std::fmt::Debug>::fmt(self, f)
	}
}

impl Error {
	pub(crate) fn network(cause: io::Error, retries_exhausted: bool) -> Self {
		Self::Network { cause, retries_exhausted }
	}
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Self {
		Self::Network { cause: e, retries_exhausted: false }
	}
}

impl<T> From<std::sync::PoisonError<T>> for Error {
	fn from(_: std::sync::PoisonError<T>) -> Self {
		Self::Sync
	}
}

impl From<bdoc::de::Error> for Error {
	fn from(v: bdoc::de::Error) -> Self {
		match v {
			bdoc::de::Error::Io(err) => Self::Network { cause: err, retries_exhausted: false },
			v => Self::Decode(v)
		}
	}
}

impl From<bdoc::se::Error> for Error {
	fn from(v: bdoc::se::Error) -> Self {
		match v {
			bdoc::se::Error::Io(err) => Self::Network { cause: err, retries_exhausted: false },
			v => Self::Encode(v)
		}
	}
}

impl From<ServerError> for Error {
	fn from(e: ServerError) -> Self {
		Self::Server(e)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn address_parse() {
		let addr: ServerAddress = "db1.example.com:27018".parse().unwrap();
		assert_eq!(addr.host(), "db1.example.com");
		assert_eq!(addr.port(), 27018);
		assert_eq!(addr.to_string(), "db1.example.com:27018");

		let addr: ServerAddress = "localhost".parse().unwrap();
		assert_eq!(addr.port(), DEFAULT_PORT);

		assert!(matches!(
			"".parse::<ServerAddress>(),
			Err(Error::InvalidArgument(_))
		));
		assert!(matches!(
			"host:notaport".parse::<ServerAddress>(),
			Err(Error::InvalidArgument(_))
		));
	}

	#[test]
	fn address_equality_by_value() {
		let a: ServerAddress = "h:1".parse().unwrap();
		let b = ServerAddress::new("h", 1);
		assert_eq!(a, b);
	}

	#[test]
	fn write_concern_levels() {
		assert!(!WriteConcern::NONE.call_get_last_error());
		assert!(!WriteConcern::NONE.raise_network_errors());
		assert!(!WriteConcern::NORMAL.call_get_last_error());
		assert!(WriteConcern::NORMAL.raise_network_errors());
		assert!(WriteConcern::ACKNOWLEDGED.call_get_last_error());
		assert!(WriteConcern::ACKNOWLEDGED.raise_network_errors());

		let journaled = WriteConcern { journal: Some(true), ..WriteConcern::NORMAL };
		assert!(journaled.call_get_last_error());
	}

	#[test]
	fn write_concern_command() {
		let object = WriteConcern::ACKNOWLEDGED.command().unwrap().decode().unwrap();
		assert_eq!(object.get_i32("getlasterror"), Some(1));
		assert!(!object.contains_key("w"));

		let object = WriteConcern { w: 3, w_timeout_ms: Some(500), journal: None }
			.command().unwrap().decode().unwrap();
		assert_eq!(object.get_i32("w"), Some(3));
		assert_eq!(object.get_i64("wtimeout"), Some(500));
	}

	#[test]
	fn synthetic_network_write_result() {
		let result = WriteResult::network_error();
		assert!(result.is_acknowledged());
		assert!(!result.ok());
		assert_eq!(result.error(), Some("NETWORK ERROR"));
	}
}
