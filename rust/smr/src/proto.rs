//! Wire layout of commands and responses.
//!
//! Both live inside a shared region and are read by another process, so
//! everything is `#[repr(C)]`, fixed-size, and free of pointers. Addresses
//! that do appear (`RemoteIov::addr`, `RmaIoc::addr`) belong to the process
//! that wrote them and are only ever handed to that process's memory via the
//! cross-process copy primitive or a registration check.

use std::sync::atomic::{AtomicI32, Ordering};

use bitflags::bitflags;

use crate::error::SmrError;

/// Payload bytes carried directly in a command.
pub const SMR_MSG_DATA_LEN: usize = 128;
/// Size of one inject buffer.
pub const SMR_INJECT_SIZE: usize = 4096;
/// Operand half of an inline compare-atomic payload.
pub const SMR_COMP_DATA_LEN: usize = SMR_MSG_DATA_LEN / 2;
/// Operand half of an injected compare-atomic payload.
pub const SMR_COMP_INJECT_SIZE: usize = SMR_INJECT_SIZE / 2;
/// Scatter/gather entries per operation.
pub const SMR_IOV_LIMIT: usize = 4;
/// Longest region name.
pub const SMR_NAME_MAX: usize = 64;

/// Response status while the peer is still working on it.
pub const RESP_BUSY: i32 = libc::EBUSY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    Msg = 1,
    Tagged = 2,
    Write = 3,
    ReadReq = 4,
    WriteAsync = 5,
    ReadAsync = 6,
    Atomic = 7,
    AtomicFetch = 8,
    AtomicCompare = 9,
}

impl TryFrom<u8> for OpKind {
    type Error = SmrError;

    fn try_from(raw: u8) -> Result<Self, SmrError> {
        Ok(match raw {
            1 => OpKind::Msg,
            2 => OpKind::Tagged,
            3 => OpKind::Write,
            4 => OpKind::ReadReq,
            5 => OpKind::WriteAsync,
            6 => OpKind::ReadAsync,
            7 => OpKind::Atomic,
            8 => OpKind::AtomicFetch,
            9 => OpKind::AtomicCompare,
            other => return Err(SmrError::InvalidOp(other)),
        })
    }
}

impl OpKind {
    /// RMA and atomic commands are followed by a descriptor slot.
    #[inline]
    pub fn has_descriptor(self) -> bool {
        matches!(
            self,
            OpKind::Write
                | OpKind::ReadReq
                | OpKind::Atomic
                | OpKind::AtomicFetch
                | OpKind::AtomicCompare
        )
    }

    #[inline]
    pub fn is_atomic(self) -> bool {
        matches!(
            self,
            OpKind::Atomic | OpKind::AtomicFetch | OpKind::AtomicCompare
        )
    }
}

/// How a command's payload travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SrcKind {
    /// Bytes in `Command::data`.
    Inline = 0,
    /// Bytes in an inject buffer of the receiver's pool.
    Inject = 1,
    /// Bytes stay in the sender; `Command::data` lists its address ranges.
    Iov = 2,
    /// Bytes in a file named after the sender and `msg_id`.
    Mmap = 3,
}

impl TryFrom<u8> for SrcKind {
    type Error = SmrError;

    fn try_from(raw: u8) -> Result<Self, SmrError> {
        Ok(match raw {
            0 => SrcKind::Inline,
            1 => SrcKind::Inject,
            2 => SrcKind::Iov,
            3 => SrcKind::Mmap,
            other => return Err(SmrError::InvalidSrc(other)),
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u16 {
        /// `CmdHdr::data` is immediate data for the target's completion.
        const REMOTE_CQ_DATA = 1 << 0;
        /// The target echoes a result back (reads, fetching atomics).
        const RMA_REQ = 1 << 1;
        /// Receive-side only: the posted buffer takes several messages.
        const MULTI_RECV = 1 << 2;
    }
}

/// Fixed command header (64 bytes).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CmdHdr {
    pub op: u8,
    pub op_src: u8,
    pub datatype: u8,
    pub atomic_op: u8,
    pub op_flags: u16,
    _pad0: u16,
    /// Sender's id in the receiver's peer map.
    pub addr: u32,
    _pad1: u32,
    pub size: u64,
    /// Monotonic per-sender id; names mapped-file transfers.
    pub msg_id: u64,
    pub tag: u64,
    pub data: u64,
    /// Offset of the inject buffer in the receiver's region.
    pub inject_offset: u64,
    /// Offset of the response slot in the sender's region, 0 if none.
    pub resp_offset: u64,
}

const _: () = assert!(std::mem::size_of::<CmdHdr>() == 64);

impl CmdHdr {
    #[inline]
    pub fn flags(&self) -> OpFlags {
        OpFlags::from_bits_truncate(self.op_flags)
    }
}

/// One command queue slot.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(64))]
pub struct Command {
    pub hdr: CmdHdr,
    pub data: [u8; SMR_MSG_DATA_LEN],
}

const _: () = assert!(std::mem::size_of::<Command>() == 192);

/// Address range in the sending process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteIov {
    pub addr: u64,
    pub len: u64,
}

/// Target range in the receiving process, checked against its
/// registrations. For atomics `len` counts elements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RmaIoc {
    pub addr: u64,
    pub len: u64,
    pub key: u64,
}

/// Up to [`SMR_IOV_LIMIT`] entries decoded from a command.
#[derive(Debug, Clone, Copy)]
pub struct Bounded<T> {
    count: usize,
    items: [T; SMR_IOV_LIMIT],
}

impl<T> Bounded<T> {
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.items[..self.count]
    }
}

impl Command {
    pub fn zeroed() -> Self {
        Self {
            hdr: CmdHdr::default(),
            data: [0; SMR_MSG_DATA_LEN],
        }
    }

    pub fn new(op: OpKind, src: SrcKind, addr: u32) -> Self {
        let mut cmd = Self::zeroed();
        cmd.hdr.op = op as u8;
        cmd.hdr.op_src = src as u8;
        cmd.hdr.addr = addr;
        cmd
    }

    #[inline]
    pub fn op(&self) -> Result<OpKind, SmrError> {
        OpKind::try_from(self.hdr.op)
    }

    #[inline]
    pub fn src(&self) -> Result<SrcKind, SmrError> {
        SrcKind::try_from(self.hdr.op_src)
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.hdr.size as usize
    }

    fn put_words(&mut self, words: impl IntoIterator<Item = u64>) {
        for (i, w) in words.into_iter().enumerate() {
            self.data[i * 8..i * 8 + 8].copy_from_slice(&w.to_ne_bytes());
        }
    }

    fn word(&self, i: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.data[i * 8..i * 8 + 8]);
        u64::from_ne_bytes(b)
    }

    fn count(&self) -> Result<usize, SmrError> {
        let n = self.word(0) as usize;
        if n > SMR_IOV_LIMIT {
            return Err(SmrError::InvalidArg);
        }
        Ok(n)
    }

    /// Store the sender's address ranges for a direct-copy transfer.
    pub fn set_iovs(&mut self, iovs: &[RemoteIov]) {
        assert!(iovs.len() <= SMR_IOV_LIMIT);
        let words = iovs.iter().flat_map(|v| [v.addr, v.len]);
        self.put_words(std::iter::once(iovs.len() as u64).chain(words));
    }

    pub fn iovs(&self) -> Result<Bounded<RemoteIov>, SmrError> {
        let count = self.count()?;
        let mut items = [RemoteIov::default(); SMR_IOV_LIMIT];
        for (i, item) in items.iter_mut().enumerate().take(count) {
            item.addr = self.word(1 + i * 2);
            item.len = self.word(2 + i * 2);
        }
        Ok(Bounded { count, items })
    }

    /// Build the descriptor slot that follows an RMA or atomic command.
    pub fn rma_descriptor(iocs: &[RmaIoc]) -> Self {
        assert!(iocs.len() <= SMR_IOV_LIMIT);
        let mut cmd = Self::zeroed();
        let words = iocs.iter().flat_map(|v| [v.addr, v.len, v.key]);
        cmd.put_words(std::iter::once(iocs.len() as u64).chain(words));
        cmd
    }

    pub fn rma_iocs(&self) -> Result<Bounded<RmaIoc>, SmrError> {
        let count = self.count()?;
        let mut items = [RmaIoc::default(); SMR_IOV_LIMIT];
        for (i, item) in items.iter_mut().enumerate().take(count) {
            item.addr = self.word(1 + i * 3);
            item.len = self.word(2 + i * 3);
            item.key = self.word(3 + i * 3);
        }
        Ok(Bounded { count, items })
    }
}

/// One response queue slot, in the initiator's region.
///
/// The target writes `status` and nothing else; the store is the
/// publication point for the whole operation.
#[repr(C)]
pub struct Response {
    /// Index of the initiator's pending-send entry.
    pub msg_id: u64,
    status: AtomicI32,
    _pad: u32,
}

const _: () = assert!(std::mem::size_of::<Response>() == 16);

impl Response {
    pub fn new(msg_id: u64) -> Self {
        Self {
            msg_id,
            status: AtomicI32::new(RESP_BUSY),
            _pad: 0,
        }
    }

    /// Publish the outcome. Must be the last write the target makes on
    /// behalf of this operation.
    #[inline]
    pub fn publish(&self, status: Result<(), SmrError>) {
        let code = match status {
            Ok(()) => 0,
            Err(e) => e.errno(),
        };
        self.status.store(code, Ordering::Release);
    }

    #[inline]
    pub fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.status() == RESP_BUSY
    }
}
