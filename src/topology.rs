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
		common::{ConnectorOptions, Error, Result, ServerAddress},
		bdoc::{Document, Value},
		wire::{CommandResult, PortFactory}
	},
	std::{
		sync::{Arc, Weak, Condvar, Mutex, RwLock, atomic::{AtomicBool, AtomicUsize, Ordering}},
		time::{Duration, SystemTime}
	},
	serde::Serialize
};

/// A member of the replica set as of its most recent probe.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Node {
	pub address: ServerAddress
}

/// Tracks the topology of a replicated cluster: which members exist, which
/// is the primary and which secondaries are reachable.
///
/// A background task re-probes every member periodically; probes older than
/// the staleness window are not trusted.
pub struct ReplicaSetStatus {
	inner: Arc<ReplicaSetInner>
}

struct ReplicaSetInner {
	factory:             Arc<dyn PortFactory>,
	nodes:               RwLock<Vec<NodeState>>,
	rotation:            AtomicUsize,
	monitor_lock:        Mutex<()>,
	wakeup:              Condvar,
	closed:              AtomicBool,
	heartbeat_frequency: Duration,
	probe_staleness:     Duration
}

#[derive(Debug, Clone)]
struct NodeState {
	address:      ServerAddress,
	ok:           bool,
	is_primary:   bool,
	is_secondary: bool,
	last_probe:   Option<SystemTime>
}

impl NodeState {
	fn new(address: ServerAddress) -> Self {
		Self {
			address,
			ok:           false,
			is_primary:   false,
			is_secondary: false,
			last_probe:   None
		}
	}

	fn fresh(&self, staleness: Duration) -> bool {
		self.last_probe
			.map(|t| t.elapsed().unwrap_or_default() <= staleness)
			.unwrap_or(false)
	}
}

#[derive(Serialize)]
struct ProbeCommand {
	ismaster: i32
}

struct ProbeReply {
	ismaster:  bool,
	secondary: bool,
	hosts:     Vec<ServerAddress>
}

impl ProbeReply {
	fn parse(result: &CommandResult) -> Self {
		Self {
			ismaster:  result.get_bool("ismaster").unwrap_or(false),
			secondary: result.get_bool("secondary").unwrap_or(false),
			hosts:     result.get_array("hosts").unwrap_or_default().iter()
				.filter_map(Value::as_str)
				.filter_map(|s| s.parse().ok())
				.collect()
		}
	}
}

impl ReplicaSetStatus {
	pub fn new(
		factory: Arc<dyn PortFactory>,
		seeds:   Vec<ServerAddress>,
		options: &ConnectorOptions
	) -> Result<Self> {
		if seeds.is_empty() {
			return Err(Error::InvalidArgument("need to specify at least one address"));
		}

		let inner = Arc::new(ReplicaSetInner {
			factory,
			nodes:               RwLock::new(seeds.into_iter().map(NodeState::new).collect()),
			rotation:            AtomicUsize::new(0),
			monitor_lock:        Mutex::new(()),
			wakeup:              Condvar::new(),
			closed:              AtomicBool::new(false),
			heartbeat_frequency: options.heartbeat_frequency,
			probe_staleness:     options.probe_staleness
		});

		let weak = Arc::downgrade(&inner);
		std::thread::Builder::new()
			.name("replica-set-monitor".to_string())
			.spawn(move || ReplicaSetInner::run(weak))?;

		Ok(Self { inner })
	}

	/// The addresses currently known, seeds plus discovered members.
	pub fn member_addresses(&self) -> Result<Vec<ServerAddress>> {
		Ok(self.inner.nodes.read()?.iter().map(|n| n.address.clone()).collect())
	}

	/// Returns the primary, re-probing as needed, or `None` when no member
	/// currently self-reports primary. A returned node's most recent probe
	/// is guaranteed to have self-reported primary.
	pub fn ensure_master(&self) -> Result<Option<Node>> {
		if let Some(node) = self.master()? {
			// primaries step down between heartbeats, so verify first
			self.inner.refresh_one(&node.address)?;
			match self.master()? {
				Some(still) if still.address == node.address => return Ok(Some(still)),
				_ => ()
			}
		}

		self.inner.refresh_all()?;
		self.master()
	}

	/// Any reachable secondary, rotating through the healthy ones.
	pub fn a_secondary(&self) -> Result<Option<ServerAddress>> {
		let nodes = self.inner.nodes.read()?;
		let healthy = nodes.iter()
			.filter(|n| n.ok && n.is_secondary && n.fresh(self.inner.probe_staleness))
			.collect::<Vec<_>>();

		if healthy.is_empty() {
			return Ok(None);
		}

		let i = self.inner.rotation.fetch_add(1, Ordering::Relaxed);
		Ok(Some(healthy[i % healthy.len()].address.clone()))
	}

	/// Stops the background monitor.
	pub fn close(&self) {
		self.inner.closed.store(true, Ordering::Release);
		self.inner.wakeup.notify_all();
	}

	fn master(&self) -> Result<Option<Node>> {
		Ok(self.inner.nodes.read()?.iter()
			.find(|n| n.ok && n.is_primary && n.fresh(self.inner.probe_staleness))
			.map(|n| Node { address: n.address.clone() }))
	}
}

impl Drop for ReplicaSetStatus {
	fn drop(&mut self) {
		self.close();
	}
}

impl std::fmt::Debug for ReplicaSetStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("ReplicaSetStatus")
			.field("nodes", &self.inner.nodes)
			.field("closed", &self.inner.closed)
			.finish()
	}
}

impl ReplicaSetInner {
	/// Body of the monitor thread.
	fn run(weak: Weak<ReplicaSetInner>) {
		loop {
			let inner = match weak.upgrade() {
				Some(inner) => inner,
				None => return
			};
			if inner.closed.load(Ordering::Acquire) {
				return;
			}

			if let Err(err) = inner.refresh_all() {
				tracing::warn!("replica set refresh failed: {}", err);
			}

			let guard = match inner.monitor_lock.lock() {
				Ok(guard) => guard,
				Err(_) => return
			};
			let wait = inner.wakeup.wait_timeout(guard, inner.heartbeat_frequency);
			if wait.is_err() || inner.closed.load(Ordering::Acquire) {
				return;
			}
		}
	}

	fn refresh_all(&self) -> Result<()> {
		// members discovered while probing are probed in the same pass
		let mut probed = Vec::new();
		loop {
			let next = self.nodes.read()?.iter()
				.map(|n| n.address.clone())
				.find(|a| !probed.contains(a));

			match next {
				Some(address) => {
					probed.push(address.clone());
					self.refresh_one(&address)?;
				}
				None => return Ok(())
			}
		}
	}

	/// Probes one member and records the outcome; newly discovered members
	/// join the candidate list.
	fn refresh_one(&self, address: &ServerAddress) -> Result<()> {
		match self.probe(address) {
			Ok(reply) => {
				let mut nodes = self.nodes.write()?;
				if let Some(node) = nodes.iter_mut().find(|n| &n.address == address) {
					node.ok = true;
					node.is_primary = reply.ismaster;
					node.is_secondary = reply.secondary;
					node.last_probe = Some(SystemTime::now());
				}
				for host in reply.hosts {
					if !nodes.iter().any(|n| n.address == host) {
						tracing::debug!("discovered replica set member {}", host);
						nodes.push(NodeState::new(host));
					}
				}
			}
			Err(err) => {
				tracing::debug!("probe of {} failed: {}", address, err);
				let mut nodes = self.nodes.write()?;
				if let Some(node) = nodes.iter_mut().find(|n| &n.address == address) {
					node.ok = false;
					node.is_primary = false;
					node.is_secondary = false;
					node.last_probe = Some(SystemTime::now());
				}
			}
		}
		Ok(())
	}

	/// One-shot connection: open, ask the node about itself, close.
	fn probe(&self, address: &ServerAddress) -> Result<ProbeReply> {
		let command = Document::from(&ProbeCommand { ismaster: 1 })?;
		let mut port = self.factory.open(address)?;
		let result = port.run_command("admin", &command);
		port.close();
		Ok(ProbeReply::parse(&result?))
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{bdoc::Object, wire::{Message, Port, Response}},
		std::{collections::HashMap, io, sync::Mutex}
	};

	#[derive(Default, Clone)]
	struct MemberSpec {
		primary:   bool,
		secondary: bool,
		hosts:     Vec<&'static str>,
		reachable: bool
	}

	#[derive(Default)]
	struct Cluster {
		members: Mutex<HashMap<ServerAddress, MemberSpec>>
	}

	impl Cluster {
		fn set(&self, address: &str, spec: MemberSpec) {
			self.members.lock().unwrap().insert(address.parse().unwrap(), spec);
		}
	}

	struct ClusterPort {
		cluster: Arc<Cluster>,
		address: ServerAddress
	}

	impl Port for ClusterPort {
		fn send(&mut self, _message: &Message) -> io::Result<()> {
			Ok(())
		}

		fn call(&mut self, _message: &Message, _collection: &str) -> io::Result<Response> {
			Ok(Response::default())
		}

		fn run_command(&mut self, _db: &str, _command: &Document) -> io::Result<CommandResult> {
			let members = self.cluster.members.lock().unwrap();
			let spec = members.get(&self.address).cloned().unwrap_or_default();

			let mut reply = Object::new();
			reply.put("ok", 1.0f64);
			reply.put("ismaster", spec.primary);
			reply.put("secondary", spec.secondary);
			reply.put("hosts", Value::Array(
				spec.hosts.iter().map(|h| Value::from(*h)).collect()
			));
			Ok(CommandResult::new(reply))
		}

		fn check_auth(&mut self, _db: &str) -> Result<()> {
			Ok(())
		}

		fn close(&mut self) {}
	}

	struct ClusterFactory(Arc<Cluster>);

	impl PortFactory for ClusterFactory {
		fn open(&self, address: &ServerAddress) -> io::Result<Box<dyn Port>> {
			let members = self.0.members.lock().unwrap();
			match members.get(address) {
				Some(spec) if spec.reachable => Ok(Box::new(ClusterPort {
					cluster: self.0.clone(),
					address: address.clone()
				})),
				_ => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "unreachable"))
			}
		}
	}

	fn options() -> ConnectorOptions {
		ConnectorOptions {
			// keep the monitor quiet while the test drives probes itself
			heartbeat_frequency: Duration::from_secs(60),
			..ConnectorOptions::default()
		}
	}

	fn status(cluster: &Arc<Cluster>, seeds: &[&str], options: &ConnectorOptions) -> ReplicaSetStatus {
		ReplicaSetStatus::new(
			Arc::new(ClusterFactory(cluster.clone())),
			seeds.iter().map(|s| s.parse().unwrap()).collect(),
			options
		).unwrap()
	}

	#[test]
	fn discovers_primary_and_members_from_seed() {
		let cluster = Arc::new(Cluster::default());
		cluster.set("a:1", MemberSpec {
			primary: true, reachable: true, hosts: vec!["a:1", "b:2"], ..MemberSpec::default()
		});
		cluster.set("b:2", MemberSpec {
			secondary: true, reachable: true, ..MemberSpec::default()
		});

		let status = status(&cluster, &["a:1"], &options());
		let master = status.ensure_master().unwrap().unwrap();
		assert_eq!(master.address, "a:1".parse().unwrap());

		// b was merged from the member list and probed
		assert!(status.member_addresses().unwrap().contains(&"b:2".parse().unwrap()));
		assert_eq!(status.a_secondary().unwrap(), Some("b:2".parse().unwrap()));
	}

	#[test]
	fn demoted_primary_is_not_returned() {
		let cluster = Arc::new(Cluster::default());
		cluster.set("a:1", MemberSpec { primary: true, reachable: true, ..MemberSpec::default() });
		cluster.set("b:2", MemberSpec { secondary: true, reachable: true, ..MemberSpec::default() });

		let status = status(&cluster, &["a:1", "b:2"], &options());
		assert_eq!(
			status.ensure_master().unwrap().unwrap().address,
			"a:1".parse().unwrap()
		);

		// a steps down, b takes over
		cluster.set("a:1", MemberSpec { secondary: true, reachable: true, ..MemberSpec::default() });
		cluster.set("b:2", MemberSpec { primary: true, reachable: true, ..MemberSpec::default() });

		assert_eq!(
			status.ensure_master().unwrap().unwrap().address,
			"b:2".parse().unwrap()
		);
	}

	#[test]
	fn no_master_reachable() {
		let cluster = Arc::new(Cluster::default());
		cluster.set("a:1", MemberSpec { secondary: true, reachable: true, ..MemberSpec::default() });
		cluster.set("b:2", MemberSpec::default());

		let status = status(&cluster, &["a:1", "b:2"], &options());
		assert!(status.ensure_master().unwrap().is_none());
	}

	#[test]
	fn secondaries_rotate() {
		let cluster = Arc::new(Cluster::default());
		cluster.set("a:1", MemberSpec { primary: true, reachable: true, ..MemberSpec::default() });
		cluster.set("b:2", MemberSpec { secondary: true, reachable: true, ..MemberSpec::default() });
		cluster.set("c:3", MemberSpec { secondary: true, reachable: true, ..MemberSpec::default() });

		let status = status(&cluster, &["a:1", "b:2", "c:3"], &options());
		status.ensure_master().unwrap();

		let first = status.a_secondary().unwrap().unwrap();
		let second = status.a_secondary().unwrap().unwrap();
		let expected: [ServerAddress; 2] = ["b:2".parse().unwrap(), "c:3".parse().unwrap()];
		assert!(expected.contains(&first));
		assert!(expected.contains(&second));
		assert_ne!(first, second);
	}

	#[test]
	fn stale_probes_are_discarded() {
		let cluster = Arc::new(Cluster::default());
		cluster.set("a:1", MemberSpec { primary: true, reachable: true, ..MemberSpec::default() });
		cluster.set("b:2", MemberSpec { secondary: true, reachable: true, ..MemberSpec::default() });

		let options = ConnectorOptions {
			heartbeat_frequency: Duration::from_secs(60),
			probe_staleness:     Duration::from_millis(100),
			..ConnectorOptions::default()
		};
		let status = status(&cluster, &["a:1", "b:2"], &options);

		status.ensure_master().unwrap().unwrap();
		assert!(status.a_secondary().unwrap().is_some());

		std::thread::sleep(Duration::from_millis(300));
		// everything the tracker knows is now too old to trust
		assert!(status.a_secondary().unwrap().is_none());

		// ensure_master re-probes and recovers
		assert!(status.ensure_master().unwrap().is_some());
	}
}
