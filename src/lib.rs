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

#![warn(clippy::all)]
#![forbid(unsafe_code)]

use {
	self::{pool::{PortPool, PoolRegistry}, topology::ReplicaSetStatus, wire::{Message, Port, Response}},
	std::{
		cell::RefCell,
		collections::HashMap,
		sync::{Arc, RwLock, atomic::{AtomicBool, AtomicUsize, Ordering}}
	}
};

pub use self::{common::*, wire::*, bdoc::*, pool::*, topology::*};

pub mod common;
pub mod wire;
pub mod pool;
pub mod topology;
pub mod bdoc;

pub static DRIVER_NAME: &str = "bdoc-rust-driver";

static CONNECTOR_IDS: AtomicUsize = AtomicUsize::new(1);

thread_local! {
	static THREAD_PORTS: RefCell<HashMap<usize, ThreadPort>> = RefCell::new(HashMap::new());
}

/// Coordinates all traffic to one deployment: owns the pools, tracks the
/// primary of a replicated cluster, dispatches writes and calls with
/// failover and retry, and pins a port per thread while a request is open.
#[derive(Debug, Clone)]
pub struct Connector(Arc<ConnectorInner>);

#[derive(Debug)]
pub struct ConnectorInner {
	/// Key into the per-thread port table; unique per connector.
	id:        usize,
	registry:  PoolRegistry,
	rs_status: Option<ReplicaSetStatus>,
	all_hosts: Option<Vec<ServerAddress>>,
	/// Address and pool of the current primary, swapped together.
	primary:   RwLock<Option<PrimaryPair>>,
	closed:    AtomicBool
}

#[derive(Debug, Clone)]
struct PrimaryPair {
	address: ServerAddress,
	pool:    Arc<PortPool>
}

/// Per-thread pinning state. Strictly thread-local: while a pinned port is
/// checked out it is moved out of the slot, so it is owned by exactly one
/// place at any time.
#[derive(Default)]
struct ThreadPort {
	pinned:     Option<Pinned>,
	in_request: bool
}

struct Pinned {
	port: Box<dyn Port>,
	pool: Arc<PortPool>
}

/// A port checked out of a pool, together with where to return it and
/// whether it should be re-pinned on release.
struct Checked {
	port:   Box<dyn Port>,
	pool:   Arc<PortPool>,
	pinned: bool
}

impl std::ops::Deref for Connector {
	type Target = ConnectorInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Connector {
	/// Connects to a single server; no replica set tracking.
	pub fn new(
		factory: Arc<dyn PortFactory>,
		options: ConnectorOptions,
		address: ServerAddress
	) -> Result<Self> {
		let registry = PoolRegistry::new(factory, options.pool);
		let pool = registry.get(&address)?;
		tracing::info!("connecting to {}", address);

		Ok(Self(Arc::new(ConnectorInner {
			id:        CONNECTOR_IDS.fetch_add(1, Ordering::Relaxed),
			registry,
			rs_status: None,
			all_hosts: None,
			primary:   RwLock::new(Some(PrimaryPair { address, pool })),
			closed:    AtomicBool::new(false)
		})))
	}

	/// Connects to a replicated cluster from a seed list; the primary is
	/// discovered on first use and re-checked on failure.
	pub fn with_seed_list(
		factory: Arc<dyn PortFactory>,
		options: ConnectorOptions,
		hosts:   Vec<ServerAddress>
	) -> Result<Self> {
		if hosts.is_empty() {
			return Err(Error::InvalidArgument("need to specify at least one address"));
		}

		let registry = PoolRegistry::new(factory.clone(), options.pool);
		let rs_status = ReplicaSetStatus::new(factory, hosts.clone(), &options)?;
		tracing::info!("replica set mode: {}", hosts.iter()
			.map(ToString::to_string)
			.collect::<Vec<_>>()
			.join(","));

		Ok(Self(Arc::new(ConnectorInner {
			id:        CONNECTOR_IDS.fetch_add(1, Ordering::Relaxed),
			registry,
			rs_status: Some(rs_status),
			all_hosts: Some(hosts),
			primary:   RwLock::new(None),
			closed:    AtomicBool::new(false)
		})))
	}

	/// Sends a write and confirms it according to `concern`.
	pub fn say(&self, db: &str, message: Message, concern: &WriteConcern) -> Result<WriteResult> {
		self.check_closed()?;

		// build the acknowledgement up front so encoding failures cannot
		// leave a checked-out port behind
		let ack = if concern.call_get_last_error() {
			Some(concern.command()?)
		} else {
			None
		};

		let mut checked = self.acquire(true, false)?;
		if let Err(err) = checked.port.check_auth(db) {
			self.fail(checked, &err);
			return Err(err);
		}

		if let Err(cause) = checked.port.send(&message) {
			return self.say_network_failure(checked, cause, concern);
		}

		match ack {
			Some(command) => match checked.port.run_command(db, &command) {
				Ok(result) => {
					self.release(checked);
					check_write_error(result)
				}
				Err(cause) => self.say_network_failure(checked, cause, concern)
			},
			None => {
				self.release(checked);
				Ok(WriteResult::unacknowledged())
			}
		}
	}

	fn say_network_failure(
		&self,
		checked: Checked,
		cause:   std::io::Error,
		concern: &WriteConcern
	) -> Result<WriteResult> {
		self.fail(checked, &cause);
		self.handle_io_error(&cause);

		if concern.raise_network_errors() {
			Err(Error::network(cause, false))
		} else {
			Ok(WriteResult::network_error())
		}
	}

	/// Sends a request and awaits its response, retrying on I/O failure and
	/// on replies from a demoted primary.
	pub fn call(&self, db: &str, collection: &str, message: Message) -> Result<Response> {
		self.call_with_retries(db, collection, message, DEFAULT_CALL_RETRIES)
	}

	pub fn call_with_retries(
		&self,
		db:         &str,
		collection: &str,
		message:    Message,
		retries:    usize
	) -> Result<Response> {
		self.check_closed()?;

		let mut checked = self.acquire(true, message.has_option(OPTION_SLAVE_OK))?;
		if let Err(err) = checked.port.check_auth(db) {
			self.fail(checked, &err);
			return Err(err);
		}

		let response = match checked.port.call(&message, collection) {
			Ok(response) => {
				self.release(checked);
				response
			}
			Err(cause) => {
				self.fail(checked, &cause);
				self.handle_io_error(&cause);

				// commands are not idempotent, so they never retry
				if collection != COMMAND_COLLECTION && retries > 0 {
					return self.call_with_retries(db, collection, message, retries - 1);
				}
				return Err(Error::network(cause, retries == 0));
			}
		};

		if let Some(err) = response.error() {
			if err.is_not_master() {
				self.check_master()?;
				if retries == 0 {
					return Err(Error::NotMasterExhausted);
				}
				return self.call_with_retries(db, collection, message, retries - 1);
			}
		}

		Ok(response)
	}

	/// Begins a request: until [`Connector::request_done`], every operation
	/// issued by this thread shares one port and is therefore ordered.
	pub fn request_start(&self) {
		self.with_thread_port(|tp| tp.in_request = true);
	}

	/// Ends this thread's request and returns its pinned port to the pool.
	pub fn request_done(&self) {
		let pinned = self.with_thread_port(|tp| {
			tp.in_request = false;
			tp.pinned.take()
		});
		if let Some(pinned) = pinned {
			pinned.pool.done(pinned.port);
		}
	}

	/// Pins a port for this thread's request ahead of the first operation.
	pub fn request_ensure_connection(&self) -> Result<()> {
		self.check_closed()?;

		if !self.with_thread_port(|tp| tp.in_request && tp.pinned.is_none()) {
			return Ok(());
		}

		let primary = self.primary_pool()?;
		let port = primary.pool.get()?;
		self.with_thread_port(|tp| tp.pinned = Some(Pinned { port, pool: primary.pool }));
		Ok(())
	}

	/// The address of the current primary, if one is known.
	pub fn address(&self) -> Option<ServerAddress> {
		self.primary.read().ok()
			.and_then(|p| p.as_ref().map(|p| p.address.clone()))
	}

	/// The seed list in replica mode.
	pub fn all_addresses(&self) -> Option<&[ServerAddress]> {
		self.all_hosts.as_deref()
	}

	pub fn connect_point(&self) -> Option<String> {
		self.address().map(|a| a.to_string())
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Shuts the connector down: every pool is closed, the topology monitor
	/// stops, and further operations fail fast.
	pub fn close(&self) {
		self.closed.store(true, Ordering::Release);
		self.registry.close();
		if let Some(rs) = &self.rs_status {
			rs.close();
		}
		THREAD_PORTS.with(|cell| cell.borrow_mut().remove(&self.id));
	}

	fn check_closed(&self) -> Result<()> {
		if self.is_closed() {
			Err(Error::Closed)
		} else {
			Ok(())
		}
	}

	fn with_thread_port<T>(&self, f: impl FnOnce(&mut ThreadPort) -> T) -> T {
		THREAD_PORTS.with(|cell| {
			f(cell.borrow_mut().entry(self.id).or_insert_with(ThreadPort::default))
		})
	}

	/// Checks a port out for one operation, preferring a secondary when the
	/// message permits it and this thread's pinned port otherwise.
	fn acquire(&self, keep: bool, slave_ok: bool) -> Result<Checked> {
		if slave_ok {
			if let Some(rs) = &self.rs_status {
				if let Some(secondary) = rs.a_secondary()? {
					let pool = self.registry.get(&secondary)?;
					let port = pool.get()?;
					return Ok(Checked { port, pool, pinned: false });
				}
			}
		}

		let primary = self.primary_pool()?;

		let (pinned, in_request) = self.with_thread_port(|tp| (tp.pinned.take(), tp.in_request));
		if let Some(pinned) = pinned {
			if Arc::ptr_eq(&pinned.pool, &primary.pool) {
				return Ok(Checked { port: pinned.port, pool: pinned.pool, pinned: true });
			}
			// pinned to a previous primary: give it back and start over
			pinned.pool.done(pinned.port);
		}

		let port = primary.pool.get()?;
		Ok(Checked { port, pool: primary.pool, pinned: keep && in_request })
	}

	/// Returns a port after a successful operation; pinned ports go back to
	/// this thread's slot instead of the pool.
	fn release(&self, checked: Checked) {
		if checked.pinned {
			self.with_thread_port(|tp| {
				tp.pinned = Some(Pinned { port: checked.port, pool: checked.pool })
			});
		} else {
			checked.pool.done(checked.port);
		}
	}

	/// Fences a port after a failure; it is closed and never reissued.
	fn fail(&self, checked: Checked, cause: &dyn std::fmt::Display) {
		tracing::error!("fencing connection to {} after failure: {}",
			checked.pool.address(), cause);
		checked.pool.error(checked.port);
	}

	/// In replica mode an I/O error may mean the primary moved, so trigger
	/// a re-check; its own failure is deferred to the next acquire.
	fn handle_io_error(&self, cause: &std::io::Error) {
		if self.rs_status.is_some() {
			tracing::warn!("replica set mode, re-checking primary after i/o error: {}", cause);
			if let Err(err) = self.check_master() {
				tracing::warn!("primary re-check failed: {}", err);
			}
		}
	}

	fn current_primary(&self) -> Result<Option<PrimaryPair>> {
		Ok(self.primary.read()?.clone())
	}

	fn primary_pool(&self) -> Result<PrimaryPair> {
		if let Some(primary) = self.current_primary()? {
			return Ok(primary);
		}
		self.check_master()?;
		self.current_primary()?.ok_or(Error::Internal("no primary available"))
	}

	fn check_master(&self) -> Result<()> {
		let rs = match &self.rs_status {
			Some(rs) => rs,
			None => return Ok(())
		};

		match rs.ensure_master()? {
			Some(node) => self.set_primary(node.address),
			None => Err(Error::Internal("can't find a master"))
		}
	}

	/// Swaps the primary address and its pool as one unit.
	fn set_primary(&self, address: ServerAddress) -> Result<()> {
		let mut primary = self.primary.write()?;
		if primary.as_ref().map_or(false, |p| p.address == address) {
			return Ok(());
		}

		let pool = self.registry.get(&address)?;
		tracing::info!("primary is now {}", address);
		*primary = Some(PrimaryPair { address, pool });
		Ok(())
	}
}

/// Classifies the acknowledgement of a write: duplicate keys and other
/// server-reported failures become typed errors.
fn check_write_error(result: wire::CommandResult) -> Result<WriteResult> {
	let message = match result.error_message() {
		None => return Ok(WriteResult::acknowledged(result)),
		Some(message) => message.to_string()
	};
	let code = result.code().unwrap_or(-1);

	if code == 11000 || code == 11001
		|| message.starts_with("E11000")
		|| message.starts_with("E11001") {
		Err(Error::DuplicateKey(code, message))
	} else {
		Err(Error::WriteFailure(code, message))
	}
}
