//! Two endpoints in one process, wired to each other.
#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use smr::{BoundedCq, Completion, Endpoint, Loopback, MrAccess, MrMap, ProcessMemory, SmrConfig};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small queues so limits are easy to hit.
pub fn small_config() -> SmrConfig {
    SmrConfig {
        cmd_queue_size: 8,
        resp_queue_size: 8,
        inject_count: 4,
        unexp_count: 4,
        recv_count: 4,
        ..SmrConfig::default()
    }
}

pub struct Side {
    pub ep: Endpoint,
    pub rx: Arc<Mutex<BoundedCq>>,
    pub tx: Arc<Mutex<BoundedCq>>,
    pub mr: Arc<MrMap>,
}

impl Side {
    fn build(
        name: &str,
        config: SmrConfig,
        mem: Arc<dyn ProcessMemory>,
        rx_depth: usize,
    ) -> Self {
        let rx = BoundedCq::shared(rx_depth);
        let tx = BoundedCq::shared(16);
        let mr = Arc::new(MrMap::new());
        let ep = Endpoint::builder(name)
            .config(config)
            .rx_cq(rx.clone())
            .tx_cq(tx.clone())
            .mr_verifier(mr.clone())
            .process_memory(mem)
            .build()
            .unwrap();
        Self { ep, rx, tx, mr }
    }

    pub fn rx_completions(&self) -> Vec<Completion> {
        drain(&self.rx)
    }

    pub fn tx_completions(&self) -> Vec<Completion> {
        drain(&self.tx)
    }

    /// Expose `buf` under `key`. The caller keeps `buf` alive for the test.
    pub fn register(&self, key: u64, buf: &mut [u8], access: MrAccess) {
        unsafe { self.mr.register(key, buf, access) }.unwrap();
    }
}

/// `a` issues, `b` is the target. `b_id` addresses `b` from `a`.
pub struct Pair {
    pub a: Side,
    pub b: Side,
    pub b_id: u32,
    pub a_id: u32,
}

pub fn pair(config: SmrConfig) -> Pair {
    pair_with_memory(config, Arc::new(Loopback))
}

/// Like [`pair`], but `b` moves direct-copy payloads with `mem`.
pub fn pair_with_memory(config: SmrConfig, mem: Arc<dyn ProcessMemory>) -> Pair {
    build_pair(config, mem, 16)
}

/// Like [`pair`], but `b` reports receives into a queue of `depth` entries.
pub fn pair_with_rx_depth(config: SmrConfig, depth: usize) -> Pair {
    build_pair(config, Arc::new(Loopback), depth)
}

fn build_pair(config: SmrConfig, mem: Arc<dyn ProcessMemory>, rx_depth: usize) -> Pair {
    init_tracing();
    let mut a = Side::build("a", config.clone(), Arc::new(Loopback), 16);
    let mut b = Side::build("b", config, mem, rx_depth);
    let (b_id, a_id) = smr::connect(&mut a.ep, &mut b.ep);
    Pair { a, b, b_id, a_id }
}

fn drain(cq: &Mutex<BoundedCq>) -> Vec<Completion> {
    let mut cq = cq.lock();
    std::iter::from_fn(|| cq.read()).collect()
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

pub fn u32_bytes(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

pub fn bytes_u32(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
