//! Host-side simulation harness for the burlap mesh stack.
//!
//! Provides in-memory implementations of every hardware capability the stack consumes (clock,
//! radio, RNG, persistence) and an airwaves broker that connects any number of nodes with a
//! configurable adjacency, so multi-hop scenarios run deterministically in virtual time on the
//! host. All scenario tests live in `tests/`.

use burlap::config::{Config, ProtocolConfig};
use burlap::dtn::BundleStatus;
use burlap::emergency::SosMessage;
use burlap::packet::NodeAddress;
use burlap::phy::{Radio, SpreadingFactor, TxResult};
use burlap::stack::{Host, MeshStack, Telemetry};
use burlap::store::{Store, StoreError};
use burlap::time::{Instant, Timer};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// Virtual milliseconds advanced per simulation step (100 Hz tick rate).
pub const TICK_MS: u32 = 10;

/// Shared virtual clock.
#[derive(Clone)]
pub struct SimTimer(Rc<Cell<u32>>);

impl Timer for SimTimer {
    fn now(&self) -> Instant {
        Instant::from_raw_millis(self.0.get())
    }
}

/// In-memory radio: transmissions land in a queue the broker drains.
pub struct SimRadio {
    sent: Rc<RefCell<VecDeque<Vec<u8>>>>,
    sf: Rc<Cell<u8>>,
}

impl Radio for SimRadio {
    fn transmit(&mut self, frame: &[u8]) -> TxResult {
        self.sent.borrow_mut().push_back(frame.to_vec());
        TxResult::Sent
    }

    fn set_spreading_factor(&mut self, sf: SpreadingFactor) {
        self.sf.set(sf.raw());
    }
}

/// HashMap-backed persistence.
#[derive(Default)]
pub struct MemStore(RefCell<HashMap<(String, String), Vec<u8>>>);

impl Store for MemStore {
    fn save(&mut self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.0
            .borrow_mut()
            .insert((namespace.into(), key.into()), bytes.to_vec());
        Ok(())
    }

    fn load(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Option<usize> {
        let map = self.0.borrow();
        let blob = map.get(&(namespace.into(), key.into()))?;
        if blob.len() > buf.len() {
            return None;
        }
        buf[..blob.len()].copy_from_slice(blob);
        Some(blob.len())
    }
}

/// Capability bundle for simulated nodes.
pub struct SimConfig;

impl Config for SimConfig {
    type Timer = SimTimer;
    type Radio = SimRadio;
    type Rng = StdRng;
    type Store = MemStore;
}

/// Records every host callback for later assertions.
#[derive(Default)]
pub struct RecordingHost {
    pub messages: Vec<(NodeAddress, Vec<u8>)>,
    pub delivery_failures: Vec<(u16, NodeAddress)>,
    pub links_established: Vec<NodeAddress>,
    pub links_closed: Vec<NodeAddress>,
    pub link_data: Vec<(NodeAddress, Vec<u8>)>,
    pub group_messages: Vec<(u32, NodeAddress, Vec<u8>)>,
    pub bundles_delivered: Vec<(u32, NodeAddress, Vec<u8>)>,
    pub bundle_statuses: Vec<(u32, BundleStatus)>,
    pub sos_received: Vec<(NodeAddress, SosMessage)>,
    pub sos_cleared: Vec<NodeAddress>,
    pub geocasts: Vec<(NodeAddress, Vec<u8>)>,
    pub telemetry: Vec<(NodeAddress, Telemetry)>,
}

impl Host for RecordingHost {
    fn on_message(&mut self, from: NodeAddress, data: &[u8]) {
        self.messages.push((from, data.to_vec()));
    }
    fn on_delivery_failed(&mut self, packet_id: u16, dest: NodeAddress) {
        self.delivery_failures.push((packet_id, dest));
    }
    fn on_link_established(&mut self, peer: NodeAddress) {
        self.links_established.push(peer);
    }
    fn on_link_closed(&mut self, peer: NodeAddress) {
        self.links_closed.push(peer);
    }
    fn on_link_data(&mut self, peer: NodeAddress, data: &[u8]) {
        self.link_data.push((peer, data.to_vec()));
    }
    fn on_group_message(&mut self, group_id: u32, sender: NodeAddress, data: &[u8]) {
        self.group_messages.push((group_id, sender, data.to_vec()));
    }
    fn on_bundle_delivered(&mut self, id: u32, source: NodeAddress, data: &[u8]) {
        self.bundles_delivered.push((id, source, data.to_vec()));
    }
    fn on_bundle_status(&mut self, id: u32, status: BundleStatus) {
        self.bundle_statuses.push((id, status));
    }
    fn on_sos(&mut self, from: NodeAddress, message: &SosMessage) {
        self.sos_received.push((from, message.clone()));
    }
    fn on_sos_cleared(&mut self, from: NodeAddress) {
        self.sos_cleared.push(from);
    }
    fn on_geocast(&mut self, source: NodeAddress, data: &[u8]) {
        self.geocasts.push((source, data.to_vec()));
    }
    fn on_telemetry(&mut self, from: NodeAddress, telemetry: &Telemetry) {
        self.telemetry.push((from, *telemetry));
    }
}

/// One simulated node: a full stack plus its recording host and radio handles.
pub struct SimNode {
    pub address: NodeAddress,
    pub stack: MeshStack<SimConfig>,
    pub host: RecordingHost,
    tx: Rc<RefCell<VecDeque<Vec<u8>>>>,
}

/// The airwaves: a set of nodes and the adjacency between them.
pub struct SimNet {
    clock: Rc<Cell<u32>>,
    nodes: Vec<SimNode>,
    /// Bidirectional links with their (rssi, snr) as heard by either end.
    links: HashMap<(usize, usize), (i16, i8)>,
    /// Every frame that went on air, for replay-style tests.
    pub air_log: Vec<Vec<u8>>,
}

impl SimNet {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        SimNet {
            clock: Rc::new(Cell::new(1)),
            nodes: Vec::new(),
            links: HashMap::new(),
            air_log: Vec::new(),
        }
    }

    /// Adds a node with the default protocol configuration. Returns its index.
    pub fn add_node(&mut self, address: u32) -> usize {
        self.add_node_with(address, ProtocolConfig::default())
    }

    /// Adds a node with a custom protocol configuration. Returns its index.
    pub fn add_node_with(&mut self, address: u32, cfg: ProtocolConfig) -> usize {
        let address = NodeAddress::new(address);
        let tx = Rc::new(RefCell::new(VecDeque::new()));
        let radio = SimRadio {
            sent: tx.clone(),
            sf: Rc::new(Cell::new(cfg.default_sf.raw())),
        };
        let stack = MeshStack::new(
            address,
            cfg,
            SimTimer(self.clock.clone()),
            radio,
            StdRng::seed_from_u64(u64::from(address.raw())),
            MemStore::default(),
        );
        self.nodes.push(SimNode {
            address,
            stack,
            host: RecordingHost::default(),
            tx,
        });
        self.nodes.len() - 1
    }

    fn key(a: usize, b: usize) -> (usize, usize) {
        (a.min(b), a.max(b))
    }

    /// Puts two nodes in radio range of each other.
    pub fn connect(&mut self, a: usize, b: usize) {
        self.connect_with_signal(a, b, -70, 8);
    }

    /// Puts two nodes in range with an explicit signal quality.
    pub fn connect_with_signal(&mut self, a: usize, b: usize, rssi: i16, snr: i8) {
        self.links.insert(Self::key(a, b), (rssi, snr));
    }

    /// Takes two nodes out of range of each other.
    pub fn disconnect(&mut self, a: usize, b: usize) {
        self.links.remove(&Self::key(a, b));
    }

    /// Access to a node.
    pub fn node(&mut self, i: usize) -> &mut SimNode {
        &mut self.nodes[i]
    }

    /// The current virtual time in milliseconds.
    pub fn now_ms(&self) -> u32 {
        self.clock.get()
    }

    /// Runs the network for `ms` of virtual time.
    pub fn run_ms(&mut self, ms: u32) {
        let steps = ms / TICK_MS;
        for _ in 0..steps {
            self.step();
        }
    }

    /// Advances one tick: clocks, stacks, then frame delivery.
    pub fn step(&mut self) {
        self.clock.set(self.clock.get().wrapping_add(TICK_MS));

        for node in self.nodes.iter_mut() {
            node.stack.tick(&mut node.host);
        }

        // Collect this tick's transmissions, then fan them out to everyone in range.
        let mut deliveries: Vec<(usize, Vec<u8>, i16, i8)> = Vec::new();
        for i in 0..self.nodes.len() {
            while let Some(frame) = {
                let mut q = self.nodes[i].tx.borrow_mut();
                q.pop_front()
            } {
                self.air_log.push(frame.clone());
                for j in 0..self.nodes.len() {
                    if i == j {
                        continue;
                    }
                    if let Some(&(rssi, snr)) = self.links.get(&Self::key(i, j)) {
                        deliveries.push((j, frame.clone(), rssi, snr));
                    }
                }
            }
        }
        for (j, frame, rssi, snr) in deliveries {
            let node = &mut self.nodes[j];
            node.stack.on_frame(&frame, rssi, snr, &mut node.host);
        }
    }

    /// Injects a raw frame straight into a node's receive path (for replay tests).
    pub fn inject(&mut self, target: usize, frame: &[u8], rssi: i16, snr: i8) {
        let node = &mut self.nodes[target];
        node.stack.on_frame(frame, rssi, snr, &mut node.host);
    }
}

impl Default for SimNet {
    fn default() -> Self {
        Self::new()
    }
}
