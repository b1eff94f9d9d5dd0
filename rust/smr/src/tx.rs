//! Issuing operations into a peer's command queue.
//!
//! The sender holds its own region lock for the whole issue and takes the
//! peer's lock with a try-acquire only. Every check that can fail runs
//! before anything is allocated, so a refused operation leaves no trace.

use smr_primitives::MmapRegion;

use crate::atomic::{AtomicOp, Datatype};
use crate::cq::{CompFlags, Completion, CompletionQueue, post};
use crate::ep::{Endpoint, PendingSend};
use crate::error::SmrError;
use crate::iov::{Iov, copy_from_iov, total_len};
use crate::proto::{
    Command, OpFlags, OpKind, RemoteIov, Response, RmaIoc, SMR_COMP_DATA_LEN,
    SMR_COMP_INJECT_SIZE, SMR_INJECT_SIZE, SMR_IOV_LIMIT, SMR_MSG_DATA_LEN, SrcKind,
};
use crate::xfer::map_path;

/// Operand bytes for an atomic, laid out as consecutive elements of
/// `datatype`.
#[derive(Debug, Clone, Copy)]
pub struct AtomicRequest<'a> {
    pub datatype: Datatype,
    pub op: AtomicOp,
    pub operand: &'a [u8],
    /// Comparands (or mask for `Mswap`), for compare operations.
    pub compare: Option<&'a [u8]>,
    /// Target ranges; `len` counts elements.
    pub targets: &'a [RmaIoc],
}

enum Payload<'a> {
    None,
    Iovs(&'a [Iov]),
    Atomic {
        operand: &'a [u8],
        compare: Option<&'a [u8]>,
    },
}

struct Request<'a> {
    peer: u32,
    op: OpKind,
    src: SrcKind,
    flags: OpFlags,
    context: u64,
    tag: u64,
    data: u64,
    size: usize,
    datatype: u8,
    atomic_op: u8,
    payload: Payload<'a>,
    /// Where data coming back from the target lands.
    results: &'a [Iov],
    targets: &'a [RmaIoc],
    /// Post a send completion when no response is expected.
    complete: bool,
}

impl Request<'_> {
    fn new(peer: u32, op: OpKind, src: SrcKind, context: u64) -> Self {
        Self {
            peer,
            op,
            src,
            flags: OpFlags::empty(),
            context,
            tag: 0,
            data: 0,
            size: 0,
            datatype: 0,
            atomic_op: 0,
            payload: Payload::None,
            results: &[],
            targets: &[],
            complete: true,
        }
    }

    fn needs_ack(&self) -> bool {
        match self.src {
            SrcKind::Iov | SrcKind::Mmap => true,
            SrcKind::Inject => {
                self.op == OpKind::ReadReq || self.flags.contains(OpFlags::RMA_REQ)
            }
            SrcKind::Inline => false,
        }
    }
}

/// Transfer method for a payload of `size` bytes.
fn select_src(size: usize, op: OpKind, cma: bool) -> SrcKind {
    if size <= SMR_MSG_DATA_LEN && op != OpKind::ReadReq {
        SrcKind::Inline
    } else if size <= SMR_INJECT_SIZE {
        SrcKind::Inject
    } else if cma {
        SrcKind::Iov
    } else {
        SrcKind::Mmap
    }
}

fn check_iovs(iovs: &[Iov]) -> Result<usize, SmrError> {
    if iovs.len() > SMR_IOV_LIMIT {
        return Err(SmrError::InvalidArg);
    }
    Ok(total_len(iovs))
}

fn check_targets(targets: &[RmaIoc], expect: usize, esize: usize) -> Result<(), SmrError> {
    if targets.is_empty() || targets.len() > SMR_IOV_LIMIT {
        return Err(SmrError::InvalidArg);
    }
    let covered: u64 = targets.iter().map(|t| t.len).sum();
    if covered.checked_mul(esize as u64) != Some(expect as u64) {
        return Err(SmrError::InvalidArg);
    }
    Ok(())
}

/// Lay operands out as the target expects: operand first, comparand in the
/// second half.
fn stage_atomic(buf: &mut [u8], half: usize, operand: &[u8], compare: Option<&[u8]>) {
    buf[..operand.len()].copy_from_slice(operand);
    if let Some(cmp) = compare {
        buf[half..half + cmp.len()].copy_from_slice(cmp);
    }
}

impl Endpoint {
    /// Send an untagged message.
    ///
    /// # Safety
    ///
    /// The iovs must stay valid for reads until the send completes.
    pub unsafe fn send(&mut self, peer: u32, iovs: &[Iov], context: u64) -> Result<(), SmrError> {
        let size = check_iovs(iovs)?;
        let src = select_src(size, OpKind::Msg, self.config.cma);
        let mut req = Request::new(peer, OpKind::Msg, src, context);
        req.size = size;
        req.payload = Payload::Iovs(iovs);
        self.issue(req)
    }

    /// Send a tagged message.
    ///
    /// # Safety
    ///
    /// The iovs must stay valid for reads until the send completes.
    pub unsafe fn tsend(
        &mut self,
        peer: u32,
        iovs: &[Iov],
        tag: u64,
        context: u64,
    ) -> Result<(), SmrError> {
        let size = check_iovs(iovs)?;
        let src = select_src(size, OpKind::Tagged, self.config.cma);
        let mut req = Request::new(peer, OpKind::Tagged, src, context);
        req.size = size;
        req.tag = tag;
        req.payload = Payload::Iovs(iovs);
        self.issue(req)
    }

    /// Write local iovs into registered memory of `peer`. With `data`, the
    /// target also gets a completion carrying it.
    ///
    /// # Safety
    ///
    /// The iovs must stay valid for reads until the write completes.
    pub unsafe fn write(
        &mut self,
        peer: u32,
        iovs: &[Iov],
        targets: &[RmaIoc],
        data: Option<u64>,
        context: u64,
    ) -> Result<(), SmrError> {
        let size = check_iovs(iovs)?;
        check_targets(targets, size, 1)?;
        let src = select_src(size, OpKind::Write, self.config.cma);
        let mut req = Request::new(peer, OpKind::Write, src, context);
        req.size = size;
        req.payload = Payload::Iovs(iovs);
        req.targets = targets;
        if let Some(data) = data {
            req.flags |= OpFlags::REMOTE_CQ_DATA;
            req.data = data;
        }
        self.issue(req)
    }

    /// Read registered memory of `peer` into local iovs.
    ///
    /// # Safety
    ///
    /// The iovs must stay valid for writes until the read completes.
    pub unsafe fn read(
        &mut self,
        peer: u32,
        iovs: &[Iov],
        targets: &[RmaIoc],
        context: u64,
    ) -> Result<(), SmrError> {
        let size = check_iovs(iovs)?;
        check_targets(targets, size, 1)?;
        let src = select_src(size, OpKind::ReadReq, self.config.cma);
        let mut req = Request::new(peer, OpKind::ReadReq, src, context);
        req.size = size;
        req.results = iovs;
        req.targets = targets;
        self.issue(req)
    }

    /// Apply an atomic to `peer`'s memory without fetching. The operands
    /// are copied before this returns.
    pub fn atomic(
        &mut self,
        peer: u32,
        atomic: &AtomicRequest<'_>,
        context: u64,
    ) -> Result<(), SmrError> {
        if atomic.op.is_swap() || atomic.compare.is_some() {
            return Err(SmrError::InvalidArg);
        }
        self.issue_atomic(peer, OpKind::Atomic, atomic, &[], SMR_INJECT_SIZE, context)
    }

    /// Apply an atomic and fetch the old target values into `result`.
    ///
    /// # Safety
    ///
    /// The result iovs must stay valid for writes until the operation
    /// completes.
    pub unsafe fn fetch_atomic(
        &mut self,
        peer: u32,
        atomic: &AtomicRequest<'_>,
        result: &[Iov],
        context: u64,
    ) -> Result<(), SmrError> {
        if atomic.op.is_swap() || atomic.compare.is_some() {
            return Err(SmrError::InvalidArg);
        }
        self.issue_atomic(peer, OpKind::AtomicFetch, atomic, result, SMR_INJECT_SIZE, context)
    }

    /// Conditionally swap target values, fetching the old ones into
    /// `result`.
    ///
    /// # Safety
    ///
    /// The result iovs must stay valid for writes until the operation
    /// completes.
    pub unsafe fn compare_atomic(
        &mut self,
        peer: u32,
        atomic: &AtomicRequest<'_>,
        result: &[Iov],
        context: u64,
    ) -> Result<(), SmrError> {
        let Some(compare) = atomic.compare else {
            return Err(SmrError::InvalidArg);
        };
        if !atomic.op.is_swap() || compare.len() != atomic.operand.len() {
            return Err(SmrError::InvalidArg);
        }
        self.issue_atomic(
            peer,
            OpKind::AtomicCompare,
            atomic,
            result,
            SMR_COMP_INJECT_SIZE,
            context,
        )
    }

    fn issue_atomic(
        &mut self,
        peer: u32,
        op: OpKind,
        atomic: &AtomicRequest<'_>,
        result: &[Iov],
        limit: usize,
        context: u64,
    ) -> Result<(), SmrError> {
        let size = atomic.operand.len();
        let esize = atomic.datatype.size();
        if size == 0 || size > limit || !size.is_multiple_of(esize) {
            return Err(SmrError::InvalidArg);
        }
        check_targets(atomic.targets, size, esize)?;
        let fetch = op != OpKind::Atomic;
        if fetch && (check_iovs(result)? < size) {
            return Err(SmrError::InvalidArg);
        }

        let src = if !fetch && size <= SMR_MSG_DATA_LEN {
            SrcKind::Inline
        } else {
            SrcKind::Inject
        };
        let mut req = Request::new(peer, op, src, context);
        req.size = size;
        req.datatype = atomic.datatype as u8;
        req.atomic_op = atomic.op as u8;
        req.payload = Payload::Atomic {
            operand: atomic.operand,
            compare: atomic.compare,
        };
        req.targets = atomic.targets;
        if fetch {
            req.flags |= OpFlags::RMA_REQ;
            req.results = result;
        }
        self.issue(req)
    }

    /// Tell `peer` a write landed outside this transport. Only bumps its
    /// counter.
    pub fn write_async_notice(&mut self, peer: u32) -> Result<(), SmrError> {
        let mut req = Request::new(peer, OpKind::WriteAsync, SrcKind::Inline, 0);
        req.complete = false;
        self.issue(req)
    }

    /// Tell `peer` a read happened outside this transport. Only bumps its
    /// counter.
    pub fn read_async_notice(&mut self, peer: u32) -> Result<(), SmrError> {
        let mut req = Request::new(peer, OpKind::ReadAsync, SrcKind::Inline, 0);
        req.complete = false;
        self.issue(req)
    }

    fn issue(&mut self, req: Request<'_>) -> Result<(), SmrError> {
        if req.results.len() > SMR_IOV_LIMIT {
            return Err(SmrError::InvalidArg);
        }
        let region = self.region.clone();
        let own = region.lock();
        let peer = self.peers.get(req.peer)?.clone();
        let Some(target) = peer.region.try_lock() else {
            trace!(peer = req.peer, "peer region busy");
            return Err(SmrError::WouldBlock);
        };

        let slots: i64 = if req.op.has_descriptor() { 2 } else { 1 };
        if target.credits() < slots || target.cmd_queue().available() < slots as u64 {
            trace!(peer = req.peer, credits = target.credits(), "no command credit");
            return Err(SmrError::WouldBlock);
        }
        let ack = req.needs_ack();
        if ack {
            if own.resp_queue().is_full() || self.pending.is_full() {
                return Err(SmrError::WouldBlock);
            }
        } else if req.complete && self.tx_cq.lock().is_full() {
            return Err(SmrError::CqFull);
        }

        let msg_id = self.next_msg_id;
        let mut cmd = Command::new(req.op, req.src, peer.remote_id);
        cmd.hdr.op_flags = req.flags.bits();
        cmd.hdr.datatype = req.datatype;
        cmd.hdr.atomic_op = req.atomic_op;
        cmd.hdr.size = req.size as u64;
        cmd.hdr.msg_id = msg_id;
        cmd.hdr.tag = req.tag;
        cmd.hdr.data = req.data;

        let mut map = None;
        match req.src {
            SrcKind::Inline => match req.payload {
                Payload::Iovs(iovs) => {
                    unsafe { copy_from_iov(&mut cmd.data[..req.size], iovs) };
                }
                Payload::Atomic { operand, compare } => {
                    stage_atomic(&mut cmd.data, SMR_COMP_DATA_LEN, operand, compare);
                }
                Payload::None => {}
            },
            SrcKind::Inject => {
                let Some(off) = target.alloc_inject() else {
                    trace!(peer = req.peer, "peer inject pool empty");
                    return Err(SmrError::WouldBlock);
                };
                let Some(buf) = (unsafe { target.inject_bytes(off) }) else {
                    return Err(SmrError::InvalidArg);
                };
                match req.payload {
                    Payload::Iovs(iovs) => {
                        unsafe { copy_from_iov(&mut buf[..req.size], iovs) };
                    }
                    Payload::Atomic { operand, compare } => {
                        stage_atomic(buf, SMR_COMP_INJECT_SIZE, operand, compare);
                    }
                    Payload::None => {}
                }
                cmd.hdr.inject_offset = off;
            }
            SrcKind::Iov => {
                let local = match req.payload {
                    Payload::Iovs(iovs) => iovs,
                    _ => req.results,
                };
                let remote: Vec<RemoteIov> = local.iter().map(Iov::to_remote).collect();
                cmd.set_iovs(&remote);
            }
            SrcKind::Mmap => {
                let path = map_path(&self.config.map_dir, region.name(), msg_id);
                let mut file = MmapRegion::create(&path, req.size).map_err(|e| {
                    debug!(path = %path.display(), error = %e, "mapped transfer create failed");
                    SmrError::from_io(&e)
                })?;
                if let Payload::Iovs(iovs) = req.payload {
                    unsafe { copy_from_iov(file.as_mut_slice(), iovs) };
                }
                map = Some(file);
            }
        }

        if ack {
            let mut iov = [Iov::empty(); SMR_IOV_LIMIT];
            iov[..req.results.len()].copy_from_slice(req.results);
            let pending = PendingSend {
                peer: req.peer,
                op: req.op,
                src: req.src,
                context: req.context,
                iov,
                iov_count: req.results.len(),
                size: req.size,
                inject_offset: cmd.hdr.inject_offset,
                map,
            };
            let idx = self
                .pending
                .insert(pending)
                .map_err(|_| SmrError::WouldBlock)?;
            let pos = own
                .resp_queue()
                .push(Response::new(idx as u64))
                .map_err(|_| SmrError::WouldBlock)?;
            cmd.hdr.resp_offset = own.resp_queue().slot_offset(pos) as u64;
        }

        target.take_credit(slots);
        target
            .cmd_queue()
            .push(cmd)
            .map_err(|_| SmrError::WouldBlock)?;
        if req.op.has_descriptor() {
            target
                .cmd_queue()
                .push(Command::rma_descriptor(req.targets))
                .map_err(|_| SmrError::WouldBlock)?;
        }
        self.next_msg_id += 1;
        trace!(
            op = ?req.op,
            src = ?req.src,
            size = req.size,
            msg_id,
            peer = req.peer,
            "command issued"
        );

        if !ack && req.complete {
            post(
                &mut *self.tx_cq.lock(),
                Completion {
                    context: req.context,
                    op: req.op,
                    flags: CompFlags::tx(req.op),
                    len: req.size,
                    buf: 0,
                    src_addr: None,
                    tag: req.tag,
                    data: 0,
                    err: None,
                },
            )?;
        }
        Ok(())
    }
}
