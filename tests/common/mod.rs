//! Deterministic in-memory cluster harness for multi-node tests.
//!
//! Messages are queued globally in send order and delivered by an explicit
//! [`Cluster::pump`], so tests control exactly when the cluster quiesces.
//! Global FIFO delivery trivially preserves the per-pair FIFO the protocol
//! requires.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use regolith::forest::LogicalRegion;
use regolith::types::{AddressSpace, Domain, FieldId, MemoryId, Rect, SerdezId, TreeId};
use regolith::{ReductionOpId, Runtime, RuntimeConfig, SumReductionI64, Transport};

/// The reduction op id every test node registers for [`SumReductionI64`].
pub const SUM_I64: ReductionOpId = ReductionOpId(1);

/// Opt-in tracing output for debugging test runs; respects `RUST_LOG`.
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The memory id every test node creates.
pub const TEST_MEMORY: MemoryId = MemoryId(1);

/// A global-FIFO in-memory transport.
#[derive(Default)]
pub struct QueueTransport {
    queue: Mutex<VecDeque<(AddressSpace, AddressSpace, Vec<u8>)>>,
    sent: AtomicU64,
}

impl QueueTransport {
    /// Total messages sent so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Transport for QueueTransport {
    fn send(&self, from: AddressSpace, target: AddressSpace, payload: Vec<u8>) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push_back((from, target, payload));
    }
}

/// A cluster of runtimes wired through one [`QueueTransport`].
pub struct Cluster {
    pub runtimes: Vec<Arc<Runtime>>,
    pub transport: Arc<QueueTransport>,
}

impl Cluster {
    /// Creates `nodes` runtimes, each with the shared test memory and the
    /// test reduction op registered.
    pub fn new(nodes: u32) -> Self {
        let transport = Arc::new(QueueTransport::default());
        let runtimes: Vec<_> = (0..nodes)
            .map(|space| {
                let rt = Arc::new(Runtime::new(
                    RuntimeConfig::default().with_address_space(space),
                    Arc::<QueueTransport>::clone(&transport),
                ));
                rt.create_memory(TEST_MEMORY, 1 << 20);
                rt.reduction_ops()
                    .register(SUM_I64, Arc::new(SumReductionI64));
                rt
            })
            .collect();
        Self {
            runtimes,
            transport,
        }
    }

    /// The runtime of one node.
    pub fn node(&self, space: u32) -> &Arc<Runtime> {
        &self.runtimes[space as usize]
    }

    /// Delivers queued messages (including ones produced while delivering)
    /// until the cluster is quiescent.
    pub fn pump(&self) {
        loop {
            let next = self.transport.queue.lock().pop_front();
            match next {
                Some((from, target, payload)) => {
                    self.node(target.0)
                        .process_message(from, &payload)
                        .expect("message dispatch failed");
                }
                None => break,
            }
        }
    }
}

/// Builds the same two-field region on every node of the cluster.
///
/// Field 1 (8 bytes) and field 2 (4 bytes) over a 1-D domain of 16 points.
/// Creation order is identical on every node, so the returned handle is
/// valid cluster-wide.
pub fn build_mirrored_region(cluster: &Cluster) -> LogicalRegion {
    let mut handle = None;
    for rt in &cluster.runtimes {
        let forest = rt.forest();
        let field_space = forest.create_field_space();
        field_space.allocate_field(FieldId(1), 8, SerdezId(0));
        field_space.allocate_field(FieldId(2), 4, SerdezId(0));
        let region = forest.create_region(
            TreeId(1),
            Domain::Rect1(Rect::new([0], [15])),
            &field_space,
            None,
        );
        handle = Some(region.handle());
    }
    handle.expect("cluster has at least one node")
}
