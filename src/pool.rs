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
	crate::{
		common::{Error, Result, ServerAddress, ConnectionPoolOptions},
		wire::{Port, PortFactory}
	},
	std::{
		collections::HashMap,
		sync::{Arc, Condvar, Mutex, RwLock, atomic::{AtomicBool, Ordering}}
	}
};

/// A bounded reservoir of reusable ports for one address.
///
/// Every port handed out by [`PortPool::get`] must come back through exactly
/// one of [`PortPool::done`] (reusable) or [`PortPool::error`] (fenced:
/// closed and never reissued).
pub struct PortPool {
	address:   ServerAddress,
	factory:   Arc<dyn PortFactory>,
	max_size:  usize,
	inner:     Mutex<PoolInner>,
	available: Condvar,
	closed:    AtomicBool
}

struct PoolInner {
	idle:  Vec<Box<dyn Port>>,
	total: usize
}

impl PortPool {
	pub(crate) fn new(
		address: ServerAddress,
		factory: Arc<dyn PortFactory>,
		options: ConnectionPoolOptions
	) -> Self {
		Self {
			address,
			factory,
			max_size:  options.max_pool_size,
			inner:     Mutex::new(PoolInner { idle: Vec::new(), total: 0 }),
			available: Condvar::new(),
			closed:    AtomicBool::new(false)
		}
	}

	pub fn address(&self) -> &ServerAddress {
		&self.address
	}

	/// Hands out an idle port, opening a new one on demand. Blocks while
	/// the pool is at its ceiling until a port is returned or the pool is
	/// closed.
	pub fn get(&self) -> Result<Box<dyn Port>> {
		if self.closed.load(Ordering::Acquire) {
			return Err(Error::Closed);
		}

		let mut inner = self.inner.lock()?;
		loop {
			if let Some(port) = inner.idle.pop() {
				return Ok(port);
			}

			if self.max_size == 0 || inner.total < self.max_size {
				inner.total += 1;
				drop(inner);

				return match self.factory.open(&self.address) {
					Ok(port) => Ok(port),
					Err(cause) => {
						// free the reserved slot
						if let Ok(mut inner) = self.inner.lock() {
							inner.total -= 1;
						}
						self.available.notify_one();
						Err(Error::network(cause, false))
					}
				};
			}

			inner = self.available.wait(inner)?;
			if self.closed.load(Ordering::Acquire) {
				return Err(Error::Closed);
			}
		}
	}

	/// Returns a healthy port so a later [`PortPool::get`] may reissue it.
	pub fn done(&self, mut port: Box<dyn Port>) {
		if self.closed.load(Ordering::Acquire) {
			port.close();
			if let Ok(mut inner) = self.inner.lock() {
				inner.total -= 1;
			}
			return;
		}

		match self.inner.lock() {
			Ok(mut inner) => {
				inner.idle.push(port);
				drop(inner);
				self.available.notify_one();
			}
			Err(_) => port.close()
		}
	}

	/// Fences a failed port: closed, slot freed, never reissued.
	pub fn error(&self, mut port: Box<dyn Port>) {
		port.close();
		if let Ok(mut inner) = self.inner.lock() {
			inner.total -= 1;
		}
		self.available.notify_one();
	}

	/// Closes every idle port and refuses further `get`s. Ports currently
	/// checked out are fenced or closed as they come back.
	pub fn close(&self) {
		self.closed.store(true, Ordering::Release);
		if let Ok(mut inner) = self.inner.lock() {
			let drained = inner.idle.len();
			for mut port in inner.idle.drain(..) {
				port.close();
			}
			inner.total -= drained;
		}
		self.available.notify_all();
	}
}

impl std::fmt::Debug for PortPool {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("PortPool")
			.field("address", &self.address)
			.field("max_size", &self.max_size)
			.field("closed", &self.closed)
			.finish()
	}
}

/// Lazily populated mapping from server address to its pool.
pub struct PoolRegistry {
	factory: Arc<dyn PortFactory>,
	options: ConnectionPoolOptions,
	pools:   RwLock<HashMap<ServerAddress, Arc<PortPool>>>,
	closed:  AtomicBool
}

impl PoolRegistry {
	pub fn new(factory: Arc<dyn PortFactory>, options: ConnectionPoolOptions) -> Self {
		Self {
			factory,
			options,
			pools:  RwLock::new(HashMap::new()),
			closed: AtomicBool::new(false)
		}
	}

	/// The pool for `address`, created on first use.
	pub fn get(&self, address: &ServerAddress) -> Result<Arc<PortPool>> {
		if self.closed.load(Ordering::Acquire) {
			return Err(Error::Closed);
		}

		if let Some(pool) = self.pools.read()?.get(address) {
			return Ok(pool.clone());
		}

		let mut pools = self.pools.write()?;
		if self.closed.load(Ordering::Acquire) {
			return Err(Error::Closed);
		}

		Ok(pools.entry(address.clone())
			.or_insert_with(|| Arc::new(PortPool::new(
				address.clone(),
				self.factory.clone(),
				self.options
			)))
			.clone())
	}

	/// Closes every pool; further `get`s fail with [`Error::Closed`].
	pub fn close(&self) {
		self.closed.store(true, Ordering::Release);
		if let Ok(pools) = self.pools.read() {
			for pool in pools.values() {
				pool.close();
			}
		}
	}
}

impl std::fmt::Debug for PoolRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("PoolRegistry")
			.field("options", &self.options)
			.field("closed", &self.closed)
			.finish()
	}
}
