//! Receive-side transfer handlers.
//!
//! Each handler moves a command's payload between its wire form and a local
//! scatter/gather list and reports the bytes moved. None of them touch the
//! command queue or credit; the progress loop owns that.

use std::path::{Path, PathBuf};

use smr_primitives::{MmapRegion, remove_if_exists};

use crate::atomic::{AtomicOp, Datatype, do_atomic};
use crate::cma::ProcessMemory;
use crate::error::SmrError;
use crate::iov::{Iov, copy_from_iov, copy_to_iov};
use crate::peer::PeerMap;
use crate::proto::{
    CmdHdr, Command, OpFlags, OpKind, SMR_COMP_DATA_LEN, SMR_COMP_INJECT_SIZE, SMR_MSG_DATA_LEN,
    SrcKind,
};
use crate::region::RegionGuard;

/// Bytes moved and the outcome of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XferResult {
    pub len: usize,
    pub status: Result<(), SmrError>,
}

impl XferResult {
    fn ok(len: usize) -> Self {
        Self { len, status: Ok(()) }
    }

    fn err(len: usize, e: SmrError) -> Self {
        Self { len, status: Err(e) }
    }

    /// `Ok` only if exactly `size` bytes moved.
    fn expect(len: usize, size: usize) -> Self {
        if len == size {
            Self::ok(len)
        } else {
            debug!(len, size, "short copy");
            Self::err(len, SmrError::Io)
        }
    }
}

/// File carrying a mapped transfer from the process whose region is named
/// `sender`.
pub fn map_path(dir: &Path, sender: &str, msg_id: u64) -> PathBuf {
    dir.join(format!("smr-{sender}-{msg_id}"))
}

/// Unlinks a mapped-transfer file when dropped.
struct Unlink<'a>(&'a Path);

impl Drop for Unlink<'_> {
    fn drop(&mut self) {
        if let Err(e) = remove_if_exists(self.0) {
            warn!(path = %self.0.display(), error = %e, "failed to unlink mapped transfer");
        }
    }
}

/// What the handlers need from the endpoint.
pub(crate) struct Xfer<'a> {
    pub peers: &'a PeerMap,
    pub mem: &'a dyn ProcessMemory,
    pub map_dir: &'a Path,
}

impl Xfer<'_> {
    /// Move a message or RMA payload to (or, for read requests, from)
    /// `iovs`.
    ///
    /// # Safety
    ///
    /// Every iov must be valid for the access the operation implies.
    pub unsafe fn transfer(
        &self,
        guard: &RegionGuard<'_>,
        cmd: &Command,
        src: SrcKind,
        iovs: &[Iov],
    ) -> XferResult {
        match src {
            SrcKind::Inline => unsafe { inline(cmd, iovs) },
            SrcKind::Inject => unsafe { inject(guard, cmd, iovs) },
            SrcKind::Iov => self.direct(cmd, iovs),
            SrcKind::Mmap => unsafe { self.mapped(cmd, iovs) },
        }
    }

    fn direct(&self, cmd: &Command, iovs: &[Iov]) -> XferResult {
        let peer = match self.peers.get(cmd.hdr.addr) {
            Ok(p) => p,
            Err(e) => return XferResult::err(0, e),
        };
        let remote = match cmd.iovs() {
            Ok(r) => r,
            Err(e) => return XferResult::err(0, e),
        };
        let moved = if cmd.op() == Ok(OpKind::ReadReq) {
            self.mem.write_to(peer.pid(), iovs, remote.as_slice())
        } else {
            self.mem.read_from(peer.pid(), iovs, remote.as_slice())
        };
        match moved {
            Ok(n) => XferResult::expect(n, cmd.size()),
            Err(e) => {
                debug!(pid = peer.pid(), error = %e, "cross-process copy failed");
                XferResult::err(0, SmrError::from_io(&e))
            }
        }
    }

    unsafe fn mapped(&self, cmd: &Command, iovs: &[Iov]) -> XferResult {
        let peer = match self.peers.get(cmd.hdr.addr) {
            Ok(p) => p,
            Err(e) => return XferResult::err(0, e),
        };
        let path = map_path(self.map_dir, peer.name(), cmd.hdr.msg_id);
        let _unlink = Unlink(&path);

        let mut map = match MmapRegion::attach_len(&path, cmd.size()) {
            Ok(m) => m,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "mapped transfer open failed");
                return XferResult::err(0, SmrError::from_io(&e));
            }
        };
        let n = if cmd.op() == Ok(OpKind::ReadReq) {
            unsafe { copy_from_iov(map.as_mut_slice(), iovs) }
        } else {
            unsafe { copy_to_iov(iovs, map.as_slice()) }
        };
        XferResult::expect(n, cmd.size())
    }
}

unsafe fn inline(cmd: &Command, iovs: &[Iov]) -> XferResult {
    let size = cmd.size();
    if size > SMR_MSG_DATA_LEN || cmd.op() == Ok(OpKind::ReadReq) {
        return XferResult::err(0, SmrError::InvalidArg);
    }
    let n = unsafe { copy_to_iov(iovs, &cmd.data[..size]) };
    XferResult::expect(n, size)
}

unsafe fn inject(guard: &RegionGuard<'_>, cmd: &Command, iovs: &[Iov]) -> XferResult {
    let Some(buf) = (unsafe { guard.inject_bytes(cmd.hdr.inject_offset) }) else {
        return XferResult::err(0, SmrError::InvalidArg);
    };
    let size = cmd.size();
    let res = if size > buf.len() {
        XferResult::err(0, SmrError::InvalidArg)
    } else if cmd.op() == Ok(OpKind::ReadReq) {
        XferResult::expect(unsafe { copy_from_iov(&mut buf[..size], iovs) }, size)
    } else {
        XferResult::expect(unsafe { copy_to_iov(iovs, &buf[..size]) }, size)
    };
    release_unacked_inject(guard, cmd);
    res
}

/// Give back an inject buffer nobody will read again. Buffers tied to a
/// response are freed by the initiator once it has the result.
fn release_unacked_inject(guard: &RegionGuard<'_>, cmd: &Command) {
    if cmd.hdr.resp_offset != 0 {
        return;
    }
    if let Err(e) = guard.release_inject(cmd.hdr.inject_offset) {
        warn!(offset = cmd.hdr.inject_offset, error = %e, "inject buffer leaked");
    }
}

/// Atomic target decoded from an RMA descriptor: verified address and
/// element count.
#[derive(Debug, Clone, Copy)]
pub struct AtomicTarget {
    pub addr: *mut u8,
    pub count: usize,
}

fn apply_atomics(
    hdr: &CmdHdr,
    operand: &mut [u8],
    cmp: Option<&[u8]>,
    targets: &[AtomicTarget],
) -> XferResult {
    let decoded = Datatype::try_from(hdr.datatype)
        .and_then(|dt| Ok((dt, AtomicOp::try_from(hdr.atomic_op)?)));
    let (dt, op) = match decoded {
        Ok(v) => v,
        Err(e) => return XferResult::err(0, e),
    };
    let fetch = hdr.flags().contains(OpFlags::RMA_REQ);
    let size = hdr.size as usize;

    let mut len = 0;
    for t in targets {
        if len >= size {
            break;
        }
        let n = t.count * dt.size();
        if len + n > operand.len() {
            return XferResult::err(len, SmrError::Truncated);
        }
        let cmp = cmp.map(|c| c.get(len..).unwrap_or(&[]));
        if let Err(e) =
            unsafe { do_atomic(op, dt, fetch, &mut operand[len..], t.addr, cmp, t.count) }
        {
            return XferResult::err(len, e);
        }
        len += n;
    }
    if len != size {
        debug!(len, size, "atomic targets do not cover declared size");
        return XferResult::err(len, SmrError::Truncated);
    }
    XferResult::ok(len)
}

/// Apply an atomic whose operands travel in the command itself. `cmd` is
/// the private copy taken off the queue.
pub(crate) fn inline_atomic(cmd: &mut Command, targets: &[AtomicTarget]) -> XferResult {
    let hdr = cmd.hdr;
    if cmd.op() == Ok(OpKind::AtomicCompare) {
        let (operand, cmp) = cmd.data.split_at_mut(SMR_COMP_DATA_LEN);
        apply_atomics(&hdr, operand, Some(cmp), targets)
    } else {
        apply_atomics(&hdr, &mut cmd.data, None, targets)
    }
}

/// Apply an atomic whose operands sit in one of our inject buffers.
pub(crate) fn inject_atomic(
    guard: &RegionGuard<'_>,
    cmd: &Command,
    targets: &[AtomicTarget],
) -> XferResult {
    let Some(buf) = (unsafe { guard.inject_bytes(cmd.hdr.inject_offset) }) else {
        return XferResult::err(0, SmrError::InvalidArg);
    };
    let res = if cmd.op() == Ok(OpKind::AtomicCompare) {
        let (operand, cmp) = buf.split_at_mut(SMR_COMP_INJECT_SIZE);
        apply_atomics(&cmd.hdr, operand, Some(cmp), targets)
    } else {
        apply_atomics(&cmd.hdr, buf, None, targets)
    };
    release_unacked_inject(guard, cmd);
    res
}

/// Free whatever the sender staged for a command that will not be carried
/// out.
pub(crate) fn release_resources(xfer: &Xfer<'_>, guard: &RegionGuard<'_>, cmd: &Command) {
    match cmd.src() {
        Ok(SrcKind::Inject) => release_unacked_inject(guard, cmd),
        Ok(SrcKind::Mmap) => {
            if let Ok(peer) = xfer.peers.get(cmd.hdr.addr) {
                let path = map_path(xfer.map_dir, peer.name(), cmd.hdr.msg_id);
                drop(Unlink(&path));
            }
        }
        _ => {}
    }
}

/// Publish `status` into the initiator's response slot, if it asked for
/// one. Must be the last thing done on the command's behalf.
pub(crate) fn ack(peers: &PeerMap, cmd: &Command, status: Result<(), SmrError>) {
    if cmd.hdr.resp_offset == 0 {
        return;
    }
    let peer = match peers.get(cmd.hdr.addr) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "response for unknown peer dropped");
            return;
        }
    };
    match peer.region.response_at(cmd.hdr.resp_offset) {
        Some(resp) => resp.publish(status),
        None => warn!(
            peer = cmd.hdr.addr,
            offset = cmd.hdr.resp_offset,
            "command names no response slot"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cma::Loopback;
    use crate::config::SmrConfig;
    use crate::peer::Peer;
    use crate::proto::Response;
    use crate::region::SmrRegion;

    fn cfg() -> SmrConfig {
        SmrConfig {
            cmd_queue_size: 4,
            resp_queue_size: 4,
            inject_count: 2,
            ..SmrConfig::default()
        }
    }

    #[test]
    fn inline_copy_and_short_destination() {
        let mut cmd = Command::new(OpKind::Msg, SrcKind::Inline, 0);
        cmd.hdr.size = 5;
        cmd.data[..5].copy_from_slice(b"hello");

        let mut buf = [0u8; 8];
        let r = unsafe { inline(&cmd, &[Iov::from_mut_slice(&mut buf)]) };
        assert_eq!(r, XferResult::ok(5));
        assert_eq!(&buf[..5], b"hello");

        let mut small = [0u8; 3];
        let r = unsafe { inline(&cmd, &[Iov::from_mut_slice(&mut small)]) };
        assert_eq!(r.status, Err(SmrError::Io));
    }

    #[test]
    fn inject_send_releases_buffer() {
        let region = SmrRegion::create("inj", &cfg()).unwrap();
        let g = region.lock();
        let off = g.alloc_inject().unwrap();
        unsafe { g.inject_bytes(off).unwrap()[..3].copy_from_slice(b"abc") };

        let mut cmd = Command::new(OpKind::Msg, SrcKind::Inject, 0);
        cmd.hdr.size = 3;
        cmd.hdr.inject_offset = off;
        let mut buf = [0u8; 3];
        let r = unsafe { inject(&g, &cmd, &[Iov::from_mut_slice(&mut buf)]) };
        assert_eq!(r, XferResult::ok(3));
        assert_eq!(&buf, b"abc");
        assert_eq!(region.inject_free(), 2);
    }

    #[test]
    fn inject_read_keeps_buffer_for_initiator() {
        let region = SmrRegion::create("inj-read", &cfg()).unwrap();
        let g = region.lock();
        let off = g.alloc_inject().unwrap();

        let mut cmd = Command::new(OpKind::ReadReq, SrcKind::Inject, 0);
        cmd.hdr.size = 4;
        cmd.hdr.inject_offset = off;
        cmd.hdr.resp_offset = 1;
        let mut src = *b"data";
        let r = unsafe { inject(&g, &cmd, &[Iov::from_mut_slice(&mut src)]) };
        assert_eq!(r, XferResult::ok(4));
        assert_eq!(unsafe { &g.inject_bytes(off).unwrap()[..4] }, b"data");
        assert_eq!(region.inject_free(), 1);
    }

    #[test]
    fn direct_copy_reads_sender_buffers() {
        let sender = SmrRegion::create("sender", &cfg()).unwrap();
        let mut peers = PeerMap::new();
        peers.insert(0, Peer { region: sender, remote_id: 0 });

        let mut theirs = *b"0123456789";
        let mut cmd = Command::new(OpKind::Msg, SrcKind::Iov, 0);
        cmd.hdr.size = 10;
        cmd.set_iovs(&[Iov::from_mut_slice(&mut theirs).to_remote()]);

        let xfer = Xfer { peers: &peers, mem: &Loopback, map_dir: Path::new("/nonexistent") };
        let mut mine = [0u8; 10];
        let r = xfer.direct(&cmd, &[Iov::from_mut_slice(&mut mine)]);
        assert_eq!(r, XferResult::ok(10));
        assert_eq!(&mine, b"0123456789");

        let mut short = [0u8; 4];
        let r = xfer.direct(&cmd, &[Iov::from_mut_slice(&mut short)]);
        assert_eq!(r.status, Err(SmrError::Io));
    }

    #[test]
    fn mapped_transfer_unlinks_on_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sender = SmrRegion::create("mapper", &cfg()).unwrap();
        let mut peers = PeerMap::new();
        peers.insert(0, Peer { region: sender, remote_id: 0 });
        let xfer = Xfer { peers: &peers, mem: &Loopback, map_dir: dir.path() };

        let path = map_path(dir.path(), "mapper", 3);
        let mut file = MmapRegion::create(&path, 6).unwrap();
        file.as_mut_slice().copy_from_slice(b"mapped");
        file.release_ownership();

        let mut cmd = Command::new(OpKind::Msg, SrcKind::Mmap, 0);
        cmd.hdr.size = 6;
        cmd.hdr.msg_id = 3;
        let mut buf = [0u8; 6];
        let r = unsafe { xfer.mapped(&cmd, &[Iov::from_mut_slice(&mut buf)]) };
        assert_eq!(r, XferResult::ok(6));
        assert_eq!(&buf, b"mapped");
        assert!(!path.exists());

        let mut file = MmapRegion::create(&path, 6).unwrap();
        file.release_ownership();
        let mut tiny = [0u8; 2];
        let r = unsafe { xfer.mapped(&cmd, &[Iov::from_mut_slice(&mut tiny)]) };
        assert_eq!(r.status, Err(SmrError::Io));
        assert!(!path.exists());

        let r = unsafe { xfer.mapped(&cmd, &[Iov::from_mut_slice(&mut buf)]) };
        assert_eq!(r.status.err().map(|e| e.errno()), Some(libc::ENOENT));
    }

    #[test]
    fn inline_atomic_walks_targets() {
        let mut a = [1u32, 2];
        let mut b = [3u32];
        let targets = [
            AtomicTarget { addr: a.as_mut_ptr().cast(), count: 2 },
            AtomicTarget { addr: b.as_mut_ptr().cast(), count: 1 },
        ];
        let mut cmd = Command::new(OpKind::Atomic, SrcKind::Inline, 0);
        cmd.hdr.datatype = Datatype::U32 as u8;
        cmd.hdr.atomic_op = AtomicOp::Sum as u8;
        cmd.hdr.size = 12;
        for i in 0..3 {
            cmd.data[i * 4..i * 4 + 4].copy_from_slice(&10u32.to_ne_bytes());
        }
        assert_eq!(inline_atomic(&mut cmd, &targets), XferResult::ok(12));
        assert_eq!(a, [11, 12]);
        assert_eq!(b, [13]);

        cmd.hdr.size = 16;
        assert_eq!(inline_atomic(&mut cmd, &targets).status, Err(SmrError::Truncated));
    }

    #[test]
    fn ack_publishes_into_sender_response() {
        let sender = SmrRegion::create("acker", &cfg()).unwrap();
        let off = {
            let g = sender.lock();
            let pos = g.resp_queue().push(Response::new(0)).unwrap();
            g.resp_queue().slot_offset(pos) as u64
        };
        let mut peers = PeerMap::new();
        peers.insert(0, Peer { region: sender.clone(), remote_id: 0 });

        let mut cmd = Command::new(OpKind::Msg, SrcKind::Iov, 0);
        cmd.hdr.resp_offset = off;
        ack(&peers, &cmd, Err(SmrError::Io));
        assert_eq!(sender.response_at(off).unwrap().status(), libc::EIO);
    }
}
