//! Endpoint: one region plus the process-local state that drives it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use smr_primitives::MmapRegion;

use crate::cma::{Cma, ProcessMemory};
use crate::config::SmrConfig;
use crate::cq::{BoundedCq, CompletionQueue, SharedCq};
use crate::error::{RegionError, SmrError};
use crate::iov::Iov;
use crate::matching::{MatchEngine, QueueKind, RxEntry};
use crate::mr::{MrMap, MrVerifier};
use crate::peer::{Peer, PeerMap};
use crate::pool::FixedPool;
use crate::proto::{OpFlags, OpKind, SMR_IOV_LIMIT, SrcKind};
use crate::region::SmrRegion;
use crate::xfer::Xfer;

/// Inbound RMA bookkeeping for operations that carry no completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub remote_write: u64,
    pub remote_read: u64,
}

/// An issued operation waiting for its response.
pub(crate) struct PendingSend {
    pub peer: u32,
    pub op: OpKind,
    pub src: SrcKind,
    pub context: u64,
    /// Where read results land.
    pub iov: [Iov; SMR_IOV_LIMIT],
    pub iov_count: usize,
    pub size: usize,
    /// Buffer in the peer's pool, for inject transfers.
    pub inject_offset: u64,
    /// Our side of a mapped transfer. Dropping it removes the file.
    pub map: Option<MmapRegion>,
}

impl PendingSend {
    pub fn iovs(&self) -> &[Iov] {
        &self.iov[..self.iov_count]
    }
}

/// A shared-memory endpoint.
///
/// At most one thread drives an endpoint at a time; peers in other
/// processes interact with it only through its region.
pub struct Endpoint {
    pub(crate) config: SmrConfig,
    pub(crate) region: SmrRegion,
    pub(crate) peers: PeerMap,
    pub(crate) matcher: MatchEngine,
    pub(crate) pending: FixedPool<PendingSend>,
    pub(crate) rx_cq: SharedCq,
    pub(crate) tx_cq: SharedCq,
    pub(crate) mr: Arc<dyn MrVerifier>,
    pub(crate) mem: Arc<dyn ProcessMemory>,
    pub(crate) next_msg_id: u64,
    pub(crate) counters: Counters,
}

/// Builder for [`Endpoint`].
pub struct EndpointBuilder {
    name: String,
    config: SmrConfig,
    path: Option<PathBuf>,
    rx_cq: Option<SharedCq>,
    tx_cq: Option<SharedCq>,
    mr: Option<Arc<dyn MrVerifier>>,
    mem: Option<Arc<dyn ProcessMemory>>,
}

impl EndpointBuilder {
    pub fn config(mut self, config: SmrConfig) -> Self {
        self.config = config;
        self
    }

    /// Back the region with a file at `path` so other processes can attach.
    pub fn mapped(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn rx_cq(mut self, cq: SharedCq) -> Self {
        self.rx_cq = Some(cq);
        self
    }

    pub fn tx_cq(mut self, cq: SharedCq) -> Self {
        self.tx_cq = Some(cq);
        self
    }

    pub fn mr_verifier(mut self, mr: Arc<dyn MrVerifier>) -> Self {
        self.mr = Some(mr);
        self
    }

    pub fn process_memory(mut self, mem: Arc<dyn ProcessMemory>) -> Self {
        self.mem = Some(mem);
        self
    }

    pub fn build(self) -> Result<Endpoint, RegionError> {
        let config = self.config;
        let region = match &self.path {
            Some(path) => SmrRegion::create_mapped(path, &self.name, &config)?,
            None => SmrRegion::create(&self.name, &config)?,
        };
        let cq_size = config.cmd_queue_size as usize;
        let rx_cq = self.rx_cq.unwrap_or_else(|| BoundedCq::shared(cq_size));
        let tx_cq = self.tx_cq.unwrap_or_else(|| BoundedCq::shared(cq_size));

        Ok(Endpoint {
            peers: PeerMap::new(),
            matcher: MatchEngine::new(config.recv_count as usize, config.unexp_count as usize),
            pending: FixedPool::new(config.resp_queue_size as usize),
            rx_cq,
            tx_cq,
            mr: self.mr.unwrap_or_else(|| Arc::new(MrMap::new())),
            mem: self.mem.unwrap_or_else(|| Arc::new(Cma)),
            next_msg_id: 0,
            counters: Counters::default(),
            region,
            config,
        })
    }
}

impl Endpoint {
    pub fn builder(name: impl Into<String>) -> EndpointBuilder {
        EndpointBuilder {
            name: name.into(),
            config: SmrConfig::default(),
            path: None,
            rx_cq: None,
            tx_cq: None,
            mr: None,
            mem: None,
        }
    }

    #[inline]
    pub fn region(&self) -> &SmrRegion {
        &self.region
    }

    #[inline]
    pub fn config(&self) -> &SmrConfig {
        &self.config
    }

    #[inline]
    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Operations still waiting for a response.
    #[inline]
    pub fn pending_sends(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn unexpected_len(&self) -> usize {
        self.matcher.unexpected_len()
    }

    #[inline]
    pub fn posted_len(&self, kind: QueueKind) -> usize {
        self.matcher.posted_len(kind)
    }

    /// Bind `region` as a peer. `remote_id` is the id that peer's endpoint
    /// gave us. Returns the local id to address it by.
    pub fn add_peer(&mut self, region: SmrRegion, remote_id: u32) -> u32 {
        let id = self.peers.next_id();
        self.peers.insert(id, Peer { region, remote_id });
        id
    }

    /// Attach a peer region published at `path`.
    pub fn attach_peer(&mut self, path: &Path, remote_id: u32) -> Result<u32, RegionError> {
        let region = SmrRegion::attach(path)?;
        Ok(self.add_peer(region, remote_id))
    }

    pub fn remove_peer(&mut self, id: u32) -> bool {
        self.peers.remove(id).is_some()
    }

    pub(crate) fn xfer(&self) -> Xfer<'_> {
        Xfer {
            peers: &self.peers,
            mem: &*self.mem,
            map_dir: &self.config.map_dir,
        }
    }

    /// Post a buffer for untagged messages.
    ///
    /// # Safety
    ///
    /// The iovs must stay valid for writes until the receive completes.
    pub unsafe fn recv(
        &mut self,
        iovs: &[Iov],
        addr: Option<u32>,
        context: u64,
        flags: OpFlags,
    ) -> Result<(), SmrError> {
        let mut entry = RxEntry::new(iovs, context)?;
        entry.addr = addr;
        entry.flags = flags & OpFlags::MULTI_RECV;
        self.post(QueueKind::Msg, entry)
    }

    /// Post a buffer for tagged messages. Bits set in `ignore` do not take
    /// part in matching.
    ///
    /// # Safety
    ///
    /// The iovs must stay valid for writes until the receive completes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn trecv(
        &mut self,
        iovs: &[Iov],
        addr: Option<u32>,
        tag: u64,
        ignore: u64,
        context: u64,
        flags: OpFlags,
    ) -> Result<(), SmrError> {
        let mut entry = RxEntry::new(iovs, context)?;
        entry.addr = addr;
        entry.tag = tag;
        entry.ignore = ignore;
        entry.flags = flags & OpFlags::MULTI_RECV;
        self.post(QueueKind::Tagged, entry)
    }

    fn post(&mut self, kind: QueueKind, entry: RxEntry) -> Result<(), SmrError> {
        if entry.is_multi_recv() && entry.iov_count != 1 {
            return Err(SmrError::InvalidArg);
        }
        if self.matcher.posted_full(kind) {
            return Err(SmrError::WouldBlock);
        }
        if self.rx_cq.lock().is_full() {
            return Err(SmrError::CqFull);
        }
        self.progress_unexp_queue(entry, kind)
    }
}

/// Bind two in-process endpoints to each other. Returns the id each one
/// uses for the other: `(b in a, a in b)`.
pub fn connect(a: &mut Endpoint, b: &mut Endpoint) -> (u32, u32) {
    let b_in_a = a.peers.next_id();
    let a_in_b = b.peers.next_id();
    a.peers.insert(
        b_in_a,
        Peer {
            region: b.region.clone(),
            remote_id: a_in_b,
        },
    );
    b.peers.insert(
        a_in_b,
        Peer {
            region: a.region.clone(),
            remote_id: b_in_a,
        },
    );
    (b_in_a, a_in_b)
}
