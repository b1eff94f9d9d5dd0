//! The two progress loops.
//!
//! `progress_cmd` drains inbound commands from our own region;
//! `progress_resp` drains responses peers published for operations we
//! issued. Both hold our region lock and the matching completion queue's
//! lock for the whole pass and stop early, leaving the head in place, on any
//! transient condition.

use crate::atomic::{AtomicOp, Datatype};
use crate::cq::{CompFlags, Completion, CompletionQueue, post};
use crate::ep::{Counters, Endpoint, PendingSend};
use crate::error::SmrError;
use crate::iov::{Iov, copy_to_iov};
use crate::matching::{QueueKind, RxEntry};
use crate::mr::MrAccess;
use crate::peer::PeerMap;
use crate::proto::{Command, OpFlags, OpKind, SMR_IOV_LIMIT, SrcKind};
use crate::region::RegionGuard;
use crate::xfer::{AtomicTarget, XferResult, ack, inject_atomic, inline_atomic, release_resources};

impl Counters {
    fn record(&mut self, access: MrAccess) {
        if access.contains(MrAccess::REMOTE_WRITE) {
            self.remote_write += 1;
        }
        if access.contains(MrAccess::REMOTE_READ) {
            self.remote_read += 1;
        }
    }
}

impl Endpoint {
    /// One pass over the response queue, then the command queue.
    ///
    /// Returns why the command pass stopped early if it did, otherwise why
    /// the response pass did. `WouldBlock` and `CqFull` mean "call again".
    pub fn progress(&mut self) -> Result<(), SmrError> {
        let resp = self.progress_resp();
        let cmd = self.progress_cmd();
        if let (Err(c), Err(r)) = (&cmd, &resp) {
            trace!(error = %r, cmd_error = %c, "response pass also stopped early");
        }
        cmd.and(resp)
    }

    /// Drain inbound commands.
    pub fn progress_cmd(&mut self) -> Result<(), SmrError> {
        let region = self.region.clone();
        let guard = region.lock();
        let rx_cq = self.rx_cq.clone();
        let mut cq = rx_cq.lock();

        for kind in [QueueKind::Msg, QueueKind::Tagged] {
            if let Err(e) = self.drain_backlog(&guard, &mut *cq, kind) {
                if e.is_transient() {
                    trace!(error = %e, ?kind, "unexpected backlog still pending");
                } else {
                    warn!(error = %e, ?kind, "error draining unexpected backlog");
                }
                return Err(e);
            }
        }

        while let Some(cmd) = guard.cmd_queue().front().copied() {
            if let Err(e) = self.dispatch(&guard, &mut *cq, cmd) {
                if e.is_transient() {
                    trace!(error = %e, op = cmd.hdr.op, "command progress deferred");
                } else {
                    warn!(
                        error = %e,
                        op = cmd.hdr.op,
                        src = cmd.hdr.op_src,
                        "error processing command"
                    );
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        guard: &RegionGuard<'_>,
        cq: &mut dyn CompletionQueue,
        cmd: Command,
    ) -> Result<(), SmrError> {
        match cmd.op()? {
            op @ (OpKind::Msg | OpKind::Tagged) => self.progress_msg(guard, cq, &cmd, op),
            op @ (OpKind::Write | OpKind::ReadReq) => self.progress_rma(guard, cq, &cmd, op),
            op @ (OpKind::WriteAsync | OpKind::ReadAsync) => {
                self.counters.record(MrAccess::for_remote(op, None));
                guard.discard_cmd();
                Ok(())
            }
            op @ (OpKind::Atomic | OpKind::AtomicFetch | OpKind::AtomicCompare) => {
                self.progress_atomic(guard, cq, cmd, op)
            }
        }
    }

    fn progress_msg(
        &mut self,
        guard: &RegionGuard<'_>,
        cq: &mut dyn CompletionQueue,
        cmd: &Command,
        op: OpKind,
    ) -> Result<(), SmrError> {
        if cq.is_full() {
            return Err(SmrError::CqFull);
        }
        cmd.src()?;
        let kind = QueueKind::for_op(op).ok_or(SmrError::InvalidOp(op as u8))?;

        let Some(pos) = self.matcher.find_posted(kind, cmd.hdr.addr, cmd.hdr.tag) else {
            self.matcher.queue_unexpected(kind, cmd)?;
            guard.discard_cmd();
            trace!(peer = cmd.hdr.addr, tag = cmd.hdr.tag, "message queued as unexpected");
            return Ok(());
        };
        let mut entry = self
            .matcher
            .remove_posted(kind, pos)
            .ok_or(SmrError::InvalidArg)?;
        let (retired, report) = self.deliver(guard, cq, cmd, op, &mut entry);
        guard.discard_cmd();
        if !retired {
            self.matcher.restore_posted(kind, pos, entry);
        }
        report
    }

    /// Move a message into a posted receive, answer the sender, and report
    /// the receive. Returns whether the entry is used up, plus the outcome
    /// of reporting it.
    fn deliver(
        &self,
        guard: &RegionGuard<'_>,
        cq: &mut dyn CompletionQueue,
        cmd: &Command,
        op: OpKind,
        entry: &mut RxEntry,
    ) -> (bool, Result<(), SmrError>) {
        let res = match cmd.src() {
            Ok(src) => unsafe { self.xfer().transfer(guard, cmd, src, entry.iovs()) },
            Err(e) => XferResult { len: 0, status: Err(e) },
        };
        ack(&self.peers, cmd, res.status);
        if let Err(e) = res.status {
            debug!(error = %e, peer = cmd.hdr.addr, len = res.len, "receive transfer failed");
        }

        let buf = entry.iov[0].base() as usize;
        let mut flags = CompFlags::rx(op, cmd.hdr.flags());
        let retired = if entry.is_multi_recv() {
            let done = entry.consume(res.len, self.config.min_multi_recv_size);
            if done {
                flags |= CompFlags::MULTI_RECV;
            }
            done
        } else {
            true
        };

        let report = post(
            cq,
            Completion {
                context: entry.context,
                op,
                flags,
                len: res.len,
                buf,
                src_addr: Some(cmd.hdr.addr),
                tag: cmd.hdr.tag,
                data: cmd.hdr.data,
                err: res.status.err(),
            },
        )
        .inspect_err(|e| warn!(error = %e, "unable to write receive completion"));
        (retired, report)
    }

    fn progress_rma(
        &mut self,
        guard: &RegionGuard<'_>,
        cq: &mut dyn CompletionQueue,
        cmd: &Command,
        op: OpKind,
    ) -> Result<(), SmrError> {
        if cmd.hdr.flags().contains(OpFlags::REMOTE_CQ_DATA) && cq.is_full() {
            return Err(SmrError::CqFull);
        }
        let src = cmd.src()?;
        let desc = guard
            .cmd_queue()
            .get(1)
            .copied()
            .ok_or(SmrError::InvalidArg)?;
        guard.discard_cmd();
        guard.discard_cmd();

        let access = MrAccess::for_remote(op, None);
        let mut iov = [Iov::empty(); SMR_IOV_LIMIT];
        let verified = desc.rma_iocs().and_then(|iocs| {
            for (slot, ioc) in iov.iter_mut().zip(iocs.as_slice()) {
                let len = ioc.len as usize;
                let addr = self.mr.verify(ioc.addr, len, ioc.key, access)?;
                *slot = unsafe { Iov::from_raw(addr as usize as *mut u8, len) };
            }
            Ok(iocs.as_slice().len())
        });

        let res = match verified {
            Ok(n) => unsafe { self.xfer().transfer(guard, cmd, src, &iov[..n]) },
            Err(e) => {
                debug!(error = %e, peer = cmd.hdr.addr, "RMA target rejected");
                release_resources(&self.xfer(), guard, cmd);
                XferResult { len: 0, status: Err(e) }
            }
        };
        ack(&self.peers, cmd, res.status);
        if res.status.is_ok() {
            self.counters.record(access);
        }
        complete_remote(cq, cmd, op, res, iov[0].base() as usize)
    }

    fn progress_atomic(
        &mut self,
        guard: &RegionGuard<'_>,
        cq: &mut dyn CompletionQueue,
        mut cmd: Command,
        op: OpKind,
    ) -> Result<(), SmrError> {
        if cmd.hdr.flags().contains(OpFlags::REMOTE_CQ_DATA) && cq.is_full() {
            return Err(SmrError::CqFull);
        }
        let src = cmd.src()?;
        if !matches!(src, SrcKind::Inline | SrcKind::Inject) {
            return Err(SmrError::InvalidSrc(cmd.hdr.op_src));
        }
        let dt = Datatype::try_from(cmd.hdr.datatype)?;
        let aop = AtomicOp::try_from(cmd.hdr.atomic_op)?;
        let desc = guard
            .cmd_queue()
            .get(1)
            .copied()
            .ok_or(SmrError::InvalidArg)?;
        guard.discard_cmd();
        guard.discard_cmd();

        let access = MrAccess::for_remote(op, Some(aop));
        let mut targets = [AtomicTarget {
            addr: std::ptr::null_mut(),
            count: 0,
        }; SMR_IOV_LIMIT];
        let verified = desc.rma_iocs().and_then(|iocs| {
            for (slot, ioc) in targets.iter_mut().zip(iocs.as_slice()) {
                let count = ioc.len as usize;
                let len = count.checked_mul(dt.size()).ok_or(SmrError::InvalidArg)?;
                let addr = self.mr.verify(ioc.addr, len, ioc.key, access)?;
                *slot = AtomicTarget {
                    addr: addr as usize as *mut u8,
                    count,
                };
            }
            Ok(iocs.as_slice().len())
        });

        let res = match verified {
            Ok(n) if src == SrcKind::Inline => inline_atomic(&mut cmd, &targets[..n]),
            Ok(n) => inject_atomic(guard, &cmd, &targets[..n]),
            Err(e) => {
                debug!(error = %e, peer = cmd.hdr.addr, "atomic target rejected");
                release_resources(&self.xfer(), guard, &cmd);
                XferResult { len: 0, status: Err(e) }
            }
        };
        ack(&self.peers, &cmd, res.status);
        if res.status.is_ok() {
            self.counters.record(access);
        }
        complete_remote(cq, &cmd, op, res, targets[0].addr as usize)
    }

    /// Drain responses for operations we issued, in order.
    pub fn progress_resp(&mut self) -> Result<(), SmrError> {
        let region = self.region.clone();
        let guard = region.lock();
        let tx_cq = self.tx_cq.clone();
        let mut cq = tx_cq.lock();

        while let Some(resp) = guard.resp_queue().front() {
            if resp.is_busy() {
                break;
            }
            if cq.is_full() {
                trace!("tx completion queue full");
                return Err(SmrError::CqFull);
            }
            let (msg_id, status) = (resp.msg_id, SmrError::from_status(resp.status()));

            let idx = msg_id as usize;
            let Some(pending) = self.pending.get_mut(idx) else {
                warn!(msg_id, "response names no pending operation");
                guard.resp_queue().discard();
                continue;
            };
            let status = match finish_pending(&self.peers, pending, status) {
                Ok(status) => status,
                Err(e) => {
                    trace!(msg_id, error = %e, "response deferred");
                    return Err(e);
                }
            };
            let pending = self.pending.remove(idx);
            guard.resp_queue().discard();
            let Some(pending) = pending else {
                continue;
            };

            if let Err(e) = status {
                debug!(error = %e, op = ?pending.op, "operation failed at target");
            }
            let entry = Completion {
                context: pending.context,
                op: pending.op,
                flags: CompFlags::tx(pending.op),
                len: if status.is_ok() { pending.size } else { 0 },
                buf: 0,
                src_addr: None,
                tag: 0,
                data: 0,
                err: status.err(),
            };
            if let Err(e) = post(&mut *cq, entry) {
                warn!(error = %e, "unable to write send completion");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Deliver already-queued unexpected messages into a newly posted
    /// receive, then post whatever is left of it.
    ///
    /// If the completion queue fills before every matching message is in,
    /// the entry is still posted but its kind is marked as backlogged: the
    /// next command pass finishes the drain before it looks at any newer
    /// message, so arrival order holds.
    pub fn progress_unexp_queue(
        &mut self,
        mut entry: RxEntry,
        kind: QueueKind,
    ) -> Result<(), SmrError> {
        let region = self.region.clone();
        let guard = region.lock();
        let rx_cq = self.rx_cq.clone();
        let mut cq = rx_cq.lock();

        // Entries posted earlier get their backlog first.
        let (retired, report) = match self.drain_backlog(&guard, &mut *cq, kind) {
            Ok(()) => self.drain_unexpected(&guard, &mut *cq, kind, &mut entry),
            Err(e) => (false, Err(e)),
        };
        if !retired {
            if self.matcher.has_unexpected(kind, &entry) {
                trace!(?kind, "receive posted with unexpected backlog");
                self.matcher.mark_backlog(kind);
            }
            self.matcher.push_posted(kind, entry)?;
        }
        match report {
            Err(SmrError::CqFull) => Ok(()),
            other => other,
        }
    }

    /// Feed queued unexpected messages into `entry`, oldest first, until it
    /// is used up or nothing it accepts is left. Returns whether the entry
    /// is used up, plus why draining stopped early if it did.
    fn drain_unexpected(
        &mut self,
        guard: &RegionGuard<'_>,
        cq: &mut dyn CompletionQueue,
        kind: QueueKind,
        entry: &mut RxEntry,
    ) -> (bool, Result<(), SmrError>) {
        while self.matcher.has_unexpected(kind, entry) {
            if cq.is_full() {
                return (false, Err(SmrError::CqFull));
            }
            let Some(cmd) = self.matcher.take_unexpected(kind, entry) else {
                break;
            };
            match self.deliver(guard, cq, &cmd, kind.op(), entry) {
                (false, Ok(())) => {}
                done => return done,
            }
        }
        (false, Ok(()))
    }

    /// Bring posted entries of `kind` up to date with unexpected messages
    /// that arrived before them, in posting order.
    fn drain_backlog(
        &mut self,
        guard: &RegionGuard<'_>,
        cq: &mut dyn CompletionQueue,
        kind: QueueKind,
    ) -> Result<(), SmrError> {
        if !self.matcher.has_backlog(kind) {
            return Ok(());
        }
        let mut pos = 0;
        while let Some(mut entry) = self.matcher.remove_posted(kind, pos) {
            let (retired, report) = self.drain_unexpected(guard, cq, kind, &mut entry);
            if !retired {
                self.matcher.restore_posted(kind, pos, entry);
                pos += 1;
            }
            report?;
        }
        self.matcher.clear_backlog(kind);
        trace!(?kind, "unexpected backlog drained");
        Ok(())
    }
}

/// Report an inbound RMA or atomic when the initiator asked for it or when
/// it failed.
fn complete_remote(
    cq: &mut dyn CompletionQueue,
    cmd: &Command,
    op: OpKind,
    res: XferResult,
    buf: usize,
) -> Result<(), SmrError> {
    let flags = cmd.hdr.flags();
    if !flags.contains(OpFlags::REMOTE_CQ_DATA) && res.status.is_ok() {
        return Ok(());
    }
    post(
        cq,
        Completion {
            context: cmd.hdr.msg_id,
            op,
            flags: CompFlags::rx(op, flags),
            len: res.len,
            buf,
            src_addr: Some(cmd.hdr.addr),
            tag: 0,
            data: cmd.hdr.data,
            err: res.status.err(),
        },
    )
    .inspect_err(|e| warn!(error = %e, "unable to write remote-access completion"))
}

/// Finish the initiator side of an acknowledged operation: bring back read
/// results and give back staged resources. `Err` means the peer's region is
/// busy and the response must be retried; `Ok` carries the final status.
fn finish_pending(
    peers: &PeerMap,
    pending: &mut PendingSend,
    status: Result<(), SmrError>,
) -> Result<Result<(), SmrError>, SmrError> {
    match pending.src {
        SrcKind::Mmap => {
            let mut status = status;
            if let Some(map) = pending.map.take() {
                if status.is_ok() && pending.op == OpKind::ReadReq {
                    let n = unsafe { copy_to_iov(pending.iovs(), map.as_slice()) };
                    if n != pending.size {
                        status = Err(SmrError::Io);
                    }
                }
            }
            Ok(status)
        }
        SrcKind::Inject => {
            let peer = match peers.get(pending.peer) {
                Ok(p) => p,
                Err(e) => {
                    warn!(peer = pending.peer, "inject buffer owner is gone");
                    return Ok(Err(e));
                }
            };
            let Some(target) = peer.region.try_lock() else {
                return Err(SmrError::WouldBlock);
            };
            let mut status = status;
            if status.is_ok() && pending.iov_count > 0 {
                status = match unsafe { target.inject_bytes(pending.inject_offset) } {
                    Some(buf) if pending.size <= buf.len() => {
                        let n = unsafe { copy_to_iov(pending.iovs(), &buf[..pending.size]) };
                        if n == pending.size { Ok(()) } else { Err(SmrError::Io) }
                    }
                    _ => Err(SmrError::InvalidArg),
                };
            }
            if let Err(e) = target.release_inject(pending.inject_offset) {
                warn!(offset = pending.inject_offset, error = %e, "peer inject buffer leaked");
            }
            Ok(status)
        }
        SrcKind::Inline | SrcKind::Iov => Ok(status),
    }
}
