//! Address-routed mesh of machines.
//!
//! Every node boots with its address as its first input and from then on
//! speaks in packets of three words: destination, `x`, `y`. A router task
//! owns delivery. Packets addressed to the monitor are held back, and when
//! the whole mesh goes idle the monitor re-sends its latest packet to node
//! 0. The mesh has converged once the monitor sends the same `y` twice in a
//! row.
//!
//! Nodes never block on input: an empty mailbox reads as the configured
//! empty value. All coordination runs over channels, so the router is only
//! woken by node events and never polls.

use std::fmt;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::connector::Connector;
use crate::port::{CancelSignal, Interrupt, Port};
use crate::program::Program;
use crate::vm::{self, Vm};
use crate::Word;

/// Words per packet: destination, x, y
pub const PACKET_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
  /// Number of nodes, addressed `0..nodes`
  pub nodes: usize,
  /// Destination that routes to the monitor instead of a node
  pub monitor_address: Word,
  /// What a node reads when its mailbox is empty
  pub empty_input: Word,
  /// Consecutive empty reads before a node counts as idle
  pub idle_threshold: u32,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      nodes: 50,
      monitor_address: 255,
      empty_input: -1,
      idle_threshold: 2,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
  pub destination: Word,
  pub x: Word,
  pub y: Word,
}

/// Outcome of a converged mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkReport {
  /// The first packet any node addressed to the monitor
  pub first_monitor_packet: Packet,
  /// The `y` the monitor sent twice in a row
  pub converged_y: Word,
  /// How many packets the monitor injected, the repeated one included
  pub injections: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum NetworkError {
  #[error("a network needs at least one node")]
  NoNodes,

  #[error("monitor address {0} collides with a node address")]
  MonitorAddressInUse(Word),

  #[error("node {address} faulted")]
  Node {
    address: usize,
    #[source]
    source: vm::Error,
  },

  #[error("node {address} stopped before the network converged")]
  NodeExited { address: usize },

  #[error("every node disconnected from the router")]
  Disconnected,

  #[error("node task failed")]
  Task(#[from] JoinError),
}

#[derive(Debug)]
enum Event {
  Packet { from: usize, packet: Packet },
  Received { node: usize },
  Idle { node: usize },
  Exited { node: usize },
}

#[derive(Debug, Clone, Copy)]
enum Origin {
  Node(usize),
  Monitor,
}

impl fmt::Display for Origin {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Node(address) => write!(f, "node {address}"),
      Self::Monitor => f.write_str("monitor"),
    }
  }
}

/// The port each mesh node runs against
struct Node {
  address: usize,
  boot: Option<Word>,
  mailbox: Connector,
  events: UnboundedSender<Event>,
  outgoing: Vec<Word>,
  // the next mailbox read is the `y` of a packet already started
  mid_packet: bool,
  empty_reads: u32,
  idle_reported: bool,
  empty_input: Word,
  idle_threshold: u32,
  signal: CancelSignal,
}

impl Node {
  fn notify(&self, event: Event) -> Result<(), Interrupt> {
    self.events.send(event).map_err(|_| Interrupt::Closed)
  }
}

impl Port for Node {
  async fn input(&mut self) -> Result<Word, Interrupt> {
    self.signal.check()?;
    if let Some(address) = self.boot.take() {
      return Ok(address);
    }
    match self.mailbox.try_pull()? {
      Some(value) => {
        if !self.mid_packet {
          self.notify(Event::Received { node: self.address })?;
        }
        self.mid_packet = !self.mid_packet;
        self.empty_reads = 0;
        self.idle_reported = false;
        Ok(value)
      }
      None => {
        self.empty_reads = self.empty_reads.saturating_add(1);
        if self.empty_reads >= self.idle_threshold && !self.idle_reported {
          self.notify(Event::Idle { node: self.address })?;
          self.idle_reported = true;
        }
        tokio::task::yield_now().await;
        Ok(self.empty_input)
      }
    }
  }

  async fn output(&mut self, value: Word) -> Result<(), Interrupt> {
    self.outgoing.push(value);
    if let [destination, x, y] = self.outgoing[..] {
      self.outgoing.clear();
      let packet = Packet { destination, x, y };
      self.notify(Event::Packet {
        from: self.address,
        packet,
      })?;
    }
    Ok(())
  }

  async fn yield_now(&mut self) -> Result<(), Interrupt> {
    self.signal.check()?;
    tokio::task::consume_budget().await;
    Ok(())
  }

  fn close(&mut self) {
    // the router may already be gone
    let _ = self.events.send(Event::Exited { node: self.address });
  }
}

#[derive(Debug, Default)]
struct Monitor {
  first: Option<Packet>,
  last: Option<Packet>,
  last_injected: Option<Word>,
  injections: usize,
}

struct Router {
  monitor_address: Word,
  mailboxes: Vec<Connector>,
  // packets delivered to a node that it has not started reading yet
  pending: Vec<usize>,
  idle: Vec<bool>,
  monitor: Monitor,
}

impl Router {
  fn new(config: &NetworkConfig, mailboxes: Vec<Connector>) -> Self {
    Self {
      monitor_address: config.monitor_address,
      pending: vec![0; mailboxes.len()],
      idle: vec![false; mailboxes.len()],
      mailboxes,
      monitor: Monitor::default(),
    }
  }

  async fn run(
    mut self,
    mut events: UnboundedReceiver<Event>,
  ) -> Result<NetworkReport, NetworkError> {
    loop {
      let event = events.recv().await.ok_or(NetworkError::Disconnected)?;
      match event {
        Event::Packet { from, packet } => self.route(Origin::Node(from), packet),
        Event::Received { node } => {
          self.pending[node] = self.pending[node].saturating_sub(1);
          self.idle[node] = false;
        }
        Event::Idle { node } => self.idle[node] = true,
        Event::Exited { node } => return Err(NetworkError::NodeExited { address: node }),
      }
      if self.is_idle() {
        if let Some(report) = self.on_idle() {
          return Ok(report);
        }
      }
    }
  }

  fn is_idle(&self) -> bool {
    self.pending.iter().all(|&pending| pending == 0)
      && self.mailboxes.iter().all(Connector::is_empty)
      && self.idle.iter().all(|&idle| idle)
  }

  fn route(&mut self, origin: Origin, packet: Packet) {
    trace!(%origin, ?packet, "routing packet");
    if packet.destination == self.monitor_address {
      self.monitor.first.get_or_insert(packet);
      self.monitor.last = Some(packet);
      return;
    }
    let node = match usize::try_from(packet.destination) {
      Ok(node) if node < self.mailboxes.len() => node,
      _ => {
        warn!(%origin, ?packet, "dropping packet for unknown address");
        return;
      }
    };
    if self.mailboxes[node].push_all(&[packet.x, packet.y]).is_err() {
      warn!(%origin, ?packet, "dropping packet for closed mailbox");
      return;
    }
    self.pending[node] += 1;
    self.idle[node] = false;
  }

  // re-send the monitor's latest packet to node 0, reporting convergence
  fn on_idle(&mut self) -> Option<NetworkReport> {
    let packet = self.monitor.last?;
    self.monitor.injections += 1;
    debug!(y = packet.y, injections = self.monitor.injections, "network idle, monitor injecting");
    let converged = self.monitor.last_injected == Some(packet.y);
    self.monitor.last_injected = Some(packet.y);
    self.route(
      Origin::Monitor,
      Packet {
        destination: 0,
        ..packet
      },
    );
    converged.then(|| NetworkReport {
      first_monitor_packet: self.monitor.first.unwrap_or(packet),
      converged_y: packet.y,
      injections: self.monitor.injections,
    })
  }
}

/// Boot `config.nodes` copies of `program` into a mesh and run it until the
/// monitor converges. Every node is cancelled before this returns.
pub async fn run_network(
  program: &Program,
  config: &NetworkConfig,
) -> Result<NetworkReport, NetworkError> {
  if config.nodes == 0 {
    return Err(NetworkError::NoNodes);
  }
  if usize::try_from(config.monitor_address).is_ok_and(|address| address < config.nodes) {
    return Err(NetworkError::MonitorAddressInUse(config.monitor_address));
  }

  let signal = CancelSignal::new();
  let (sender, receiver) = mpsc::unbounded_channel();
  let mailboxes: Vec<Connector> = (0..config.nodes).map(|_| Connector::new()).collect();

  let mut nodes = JoinSet::new();
  for (address, mailbox) in mailboxes.iter().enumerate() {
    let mut node = Node {
      address,
      boot: Some(address as Word),
      mailbox: mailbox.clone(),
      events: sender.clone(),
      outgoing: Vec::with_capacity(PACKET_LEN),
      mid_packet: false,
      empty_reads: 0,
      idle_reported: false,
      empty_input: config.empty_input,
      idle_threshold: config.idle_threshold,
      signal: signal.clone(),
    };
    let mut vm = Vm::new(program);
    nodes.spawn(async move { (address, vm.run(&mut node).await) });
  }
  drop(sender);
  debug!(nodes = config.nodes, "network started");

  let outcome = Router::new(config, mailboxes).run(receiver).await;
  signal.cancel();

  let mut fault = None;
  while let Some(joined) = nodes.join_next().await {
    let (address, result) = joined?;
    if let Err(source) = result {
      fault.get_or_insert(NetworkError::Node { address, source });
    }
  }

  match (outcome, fault) {
    (Err(_), Some(fault)) => Err(fault),
    (outcome, _) => {
      if let Ok(report) = &outcome {
        info!(y = report.converged_y, injections = report.injections, "network converged");
      }
      outcome
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // Node 1 sends (255, 0, 6) once and then idles. Node 0 answers every
  // packet (x, y) with (255, x, max(y - 1, 3)).
  #[rustfmt::skip]
  const COUNTDOWN: [Word; 47] = [
    3, 100,              // [100] ← address
    1005, 100, 36,       // node 1 jumps ahead
    3, 101,              // [101] ← x
    1008, 101, -1, 102,  // empty?
    1005, 102, 5,        // keep polling
    3, 103,              // [103] ← y
    1007, 103, 4, 102,   // y < 4?
    1005, 102, 27,       // floor reached
    1001, 103, -1, 103,  // y ← y - 1
    104, 255,
    4, 101,
    4, 103,
    1105, 1, 5,
    104, 255,            // node 1
    104, 0,
    104, 6,
    3, 101,
    1105, 1, 42,
  ];

  fn config(nodes: usize) -> NetworkConfig {
    NetworkConfig {
      nodes,
      ..NetworkConfig::default()
    }
  }

  #[tokio::test]
  async fn converges_on_repeated_y() {
    let program = Program::from(COUNTDOWN.to_vec());
    let report = run_network(&program, &config(2)).await.unwrap();
    assert_eq!(
      report.first_monitor_packet,
      Packet {
        destination: 255,
        x: 0,
        y: 6
      }
    );
    assert_eq!(report.converged_y, 3);
    // 6, 5, 4, 3, 3
    assert_eq!(report.injections, 5);
  }

  #[tokio::test]
  async fn converges_with_custom_constants() {
    // a higher threshold only delays idle detection
    let program = Program::from(COUNTDOWN.to_vec());
    let config = NetworkConfig {
      nodes: 2,
      idle_threshold: 5,
      ..NetworkConfig::default()
    };
    let report = run_network(&program, &config).await.unwrap();
    assert_eq!(report.converged_y, 3);
  }

  #[tokio::test]
  async fn node_fault_is_reported() {
    let program = Program::from(vec![77]);
    let err = run_network(&program, &config(2)).await.unwrap_err();
    assert!(matches!(err, NetworkError::Node { .. }));
  }

  #[tokio::test]
  async fn halting_node_stops_network() {
    let program = Program::from(vec![3, 0, 99]);
    let err = run_network(&program, &config(3)).await.unwrap_err();
    assert!(matches!(err, NetworkError::NodeExited { .. }));
  }

  #[tokio::test(flavor = "current_thread")]
  async fn spinning_node_is_cancelled() {
    // node 0 halts, node 1 loops at address 7 without touching its mailbox
    let program = Program::from(vec![3, 20, 1005, 20, 7, 99, 0, 1105, 1, 7]);
    let cfg = config(2);
    let run = run_network(&program, &cfg);
    let err = tokio::time::timeout(std::time::Duration::from_secs(5), run)
      .await
      .expect("spinning node was never cancelled")
      .unwrap_err();
    assert!(matches!(err, NetworkError::NodeExited { .. }));
  }

  #[tokio::test]
  async fn rejects_bad_config() {
    let program = Program::from(COUNTDOWN.to_vec());
    assert!(matches!(
      run_network(&program, &config(0)).await,
      Err(NetworkError::NoNodes)
    ));
    let config = NetworkConfig {
      nodes: 4,
      monitor_address: 3,
      ..NetworkConfig::default()
    };
    assert!(matches!(
      run_network(&program, &config).await,
      Err(NetworkError::MonitorAddressInUse(3))
    ));
  }

  #[test]
  fn monitor_waits_for_a_packet() {
    let mut router = Router::new(&config(1), vec![Connector::new()]);
    router.idle[0] = true;
    assert!(router.is_idle());
    assert_eq!(router.on_idle(), None);
    router.route(
      Origin::Node(0),
      Packet {
        destination: 255,
        x: 1,
        y: 2,
      },
    );
    assert_eq!(router.on_idle(), None);
    assert!(!router.is_idle());
    assert_eq!(router.mailboxes[0].drain(), vec![1, 2]);
    router.pending[0] = 0;
    router.idle[0] = true;
    let report = router.on_idle().unwrap();
    assert_eq!(report.converged_y, 2);
    assert_eq!(report.injections, 2);
  }
}
