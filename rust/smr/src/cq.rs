//! Completion reporting.
//!
//! The engine only needs to ask whether a queue has room and to append one
//! entry; storage and event semantics belong to the queue implementation.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::error::SmrError;
use crate::proto::{OpFlags, OpKind};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompFlags: u32 {
        const SEND = 1 << 0;
        const RECV = 1 << 1;
        const MSG = 1 << 2;
        const TAGGED = 1 << 3;
        const RMA = 1 << 4;
        const ATOMIC = 1 << 5;
        const READ = 1 << 6;
        const WRITE = 1 << 7;
        const REMOTE_READ = 1 << 8;
        const REMOTE_WRITE = 1 << 9;
        const REMOTE_CQ_DATA = 1 << 10;
        /// Last completion for a multi-receive buffer.
        const MULTI_RECV = 1 << 11;
    }
}

impl CompFlags {
    pub fn rx(op: OpKind, flags: OpFlags) -> CompFlags {
        let base = match op {
            OpKind::Msg => CompFlags::RECV | CompFlags::MSG,
            OpKind::Tagged => CompFlags::RECV | CompFlags::TAGGED,
            OpKind::Write | OpKind::WriteAsync => CompFlags::RMA | CompFlags::REMOTE_WRITE,
            OpKind::ReadReq | OpKind::ReadAsync => CompFlags::RMA | CompFlags::REMOTE_READ,
            OpKind::Atomic => CompFlags::ATOMIC | CompFlags::REMOTE_WRITE,
            OpKind::AtomicFetch | OpKind::AtomicCompare => {
                CompFlags::ATOMIC | CompFlags::REMOTE_READ
            }
        };
        if flags.contains(OpFlags::REMOTE_CQ_DATA) {
            base | CompFlags::REMOTE_CQ_DATA
        } else {
            base
        }
    }

    pub fn tx(op: OpKind) -> CompFlags {
        match op {
            OpKind::Msg => CompFlags::SEND | CompFlags::MSG,
            OpKind::Tagged => CompFlags::SEND | CompFlags::TAGGED,
            OpKind::Write | OpKind::WriteAsync => CompFlags::RMA | CompFlags::WRITE,
            OpKind::ReadReq | OpKind::ReadAsync => CompFlags::RMA | CompFlags::READ,
            OpKind::Atomic => CompFlags::ATOMIC | CompFlags::WRITE,
            OpKind::AtomicFetch | OpKind::AtomicCompare => CompFlags::ATOMIC | CompFlags::READ,
        }
    }
}

/// One completion entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub context: u64,
    pub op: OpKind,
    pub flags: CompFlags,
    pub len: usize,
    /// Start of the buffer the data landed in, as an address.
    pub buf: usize,
    /// Sender's peer id, for receive completions.
    pub src_addr: Option<u32>,
    pub tag: u64,
    pub data: u64,
    pub err: Option<SmrError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqError {
    Full,
    Closed,
}

impl fmt::Display for CqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CqError::Full => write!(f, "completion queue full"),
            CqError::Closed => write!(f, "completion queue closed"),
        }
    }
}

impl std::error::Error for CqError {}

impl From<CqError> for SmrError {
    fn from(e: CqError) -> Self {
        match e {
            CqError::Full => SmrError::CqFull,
            CqError::Closed => SmrError::Cq,
        }
    }
}

pub trait CompletionQueue: Send {
    fn is_full(&self) -> bool;
    fn write(&mut self, entry: Completion) -> Result<(), CqError>;
}

/// Shared handle the engine locks for the duration of a queue pass.
pub type SharedCq = Arc<Mutex<dyn CompletionQueue>>;

/// Fixed-capacity FIFO of completions.
#[derive(Debug)]
pub struct BoundedCq {
    entries: VecDeque<Completion>,
    capacity: usize,
    closed: bool,
}

impl BoundedCq {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            closed: false,
        }
    }

    /// A queue already wrapped for sharing with an endpoint.
    pub fn shared(capacity: usize) -> Arc<Mutex<BoundedCq>> {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    pub fn read(&mut self) -> Option<Completion> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Refuse all further writes.
    pub fn close(&mut self) {
        self.closed = true;
    }
}

impl CompletionQueue for BoundedCq {
    fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    fn write(&mut self, entry: Completion) -> Result<(), CqError> {
        if self.closed {
            return Err(CqError::Closed);
        }
        if self.is_full() {
            return Err(CqError::Full);
        }
        self.entries.push_back(entry);
        Ok(())
    }
}

/// Post a completion, mapping queue failures onto the engine's errors.
pub(crate) fn post(cq: &mut dyn CompletionQueue, entry: Completion) -> Result<(), SmrError> {
    cq.write(entry).map_err(SmrError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(context: u64) -> Completion {
        Completion {
            context,
            op: OpKind::Msg,
            flags: CompFlags::RECV | CompFlags::MSG,
            len: 0,
            buf: 0,
            src_addr: None,
            tag: 0,
            data: 0,
            err: None,
        }
    }

    #[test]
    fn bounded_cq_refuses_when_full() {
        let mut cq = BoundedCq::new(2);
        cq.write(entry(1)).unwrap();
        cq.write(entry(2)).unwrap();
        assert!(cq.is_full());
        assert_eq!(cq.write(entry(3)), Err(CqError::Full));
        assert_eq!(cq.read().unwrap().context, 1);
        assert!(!cq.is_full());
    }

    #[test]
    fn closed_queue_maps_to_cq_error() {
        let mut cq = BoundedCq::new(2);
        cq.close();
        assert_eq!(post(&mut cq, entry(1)), Err(SmrError::Cq));
    }

    #[test]
    fn shared_handle_coerces_to_trait_object() {
        let concrete = BoundedCq::shared(1);
        let shared: SharedCq = concrete.clone();
        post(&mut *shared.lock(), entry(7)).unwrap();
        assert_eq!(concrete.lock().read().unwrap().context, 7);
    }

    #[test]
    fn remote_cq_data_flag_carries_through() {
        let f = CompFlags::rx(OpKind::Write, OpFlags::REMOTE_CQ_DATA);
        assert!(f.contains(CompFlags::RMA | CompFlags::REMOTE_WRITE | CompFlags::REMOTE_CQ_DATA));
        assert!(!CompFlags::rx(OpKind::Msg, OpFlags::empty()).contains(CompFlags::REMOTE_CQ_DATA));
    }
}
