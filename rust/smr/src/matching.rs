//! Posted-receive and unexpected-message queues.

use std::collections::VecDeque;

use crate::error::SmrError;
use crate::iov::Iov;
use crate::pool::FixedPool;
use crate::proto::{Command, OpFlags, OpKind, SMR_IOV_LIMIT};

/// Which pair of queues an operation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Msg,
    Tagged,
}

impl QueueKind {
    pub fn for_op(op: OpKind) -> Option<QueueKind> {
        match op {
            OpKind::Msg => Some(QueueKind::Msg),
            OpKind::Tagged => Some(QueueKind::Tagged),
            _ => None,
        }
    }

    pub fn op(self) -> OpKind {
        match self {
            QueueKind::Msg => OpKind::Msg,
            QueueKind::Tagged => OpKind::Tagged,
        }
    }

    #[inline]
    fn index(self) -> usize {
        match self {
            QueueKind::Msg => 0,
            QueueKind::Tagged => 1,
        }
    }
}

/// A buffer the application posted for incoming messages.
#[derive(Debug, Clone)]
pub struct RxEntry {
    pub context: u64,
    pub iov: [Iov; SMR_IOV_LIMIT],
    pub iov_count: usize,
    /// Only accept messages from this peer; `None` takes anyone.
    pub addr: Option<u32>,
    pub tag: u64,
    /// Tag bits that do not take part in matching.
    pub ignore: u64,
    pub flags: OpFlags,
}

impl RxEntry {
    pub fn new(iovs: &[Iov], context: u64) -> Result<Self, SmrError> {
        if iovs.len() > SMR_IOV_LIMIT {
            return Err(SmrError::InvalidArg);
        }
        let mut iov = [Iov::empty(); SMR_IOV_LIMIT];
        iov[..iovs.len()].copy_from_slice(iovs);
        Ok(Self {
            context,
            iov,
            iov_count: iovs.len(),
            addr: None,
            tag: 0,
            ignore: 0,
            flags: OpFlags::empty(),
        })
    }

    #[inline]
    pub fn iovs(&self) -> &[Iov] {
        &self.iov[..self.iov_count]
    }

    #[inline]
    pub fn is_multi_recv(&self) -> bool {
        self.flags.contains(OpFlags::MULTI_RECV)
    }

    /// Whether a message from `addr` carrying `tag` lands here.
    pub fn accepts(&self, kind: QueueKind, addr: u32, tag: u64) -> bool {
        if self.addr.is_some_and(|want| want != addr) {
            return false;
        }
        match kind {
            QueueKind::Msg => true,
            QueueKind::Tagged => (tag | self.ignore) == (self.tag | self.ignore),
        }
    }

    /// Account for `len` bytes delivered into a multi-receive buffer.
    /// Returns true when the buffer is used up and must be retired.
    pub fn consume(&mut self, len: usize, min_left: usize) -> bool {
        let left = self.iov[0].len().saturating_sub(len);
        if left < min_left {
            return true;
        }
        self.iov[0].advance(len);
        false
    }
}

/// Matching state for one endpoint.
pub struct MatchEngine {
    posted: [VecDeque<RxEntry>; 2],
    posted_capacity: usize,
    unexp: FixedPool<Command>,
    unexp_order: [VecDeque<usize>; 2],
    /// Set when a posted entry went in while unexpected messages it accepts
    /// were still queued. Cleared once every posted entry has caught up.
    backlog: [bool; 2],
}

impl MatchEngine {
    pub fn new(posted_capacity: usize, unexp_capacity: usize) -> Self {
        Self {
            posted: [VecDeque::new(), VecDeque::new()],
            posted_capacity,
            unexp: FixedPool::new(unexp_capacity),
            unexp_order: [VecDeque::new(), VecDeque::new()],
            backlog: [false; 2],
        }
    }

    /// Position of the first posted entry that accepts the message.
    pub fn find_posted(&self, kind: QueueKind, addr: u32, tag: u64) -> Option<usize> {
        self.posted[kind.index()]
            .iter()
            .position(|e| e.accepts(kind, addr, tag))
    }

    pub fn remove_posted(&mut self, kind: QueueKind, pos: usize) -> Option<RxEntry> {
        self.posted[kind.index()].remove(pos)
    }

    /// Put an entry back where it was taken from, keeping its turn.
    pub fn restore_posted(&mut self, kind: QueueKind, pos: usize, entry: RxEntry) {
        let q = &mut self.posted[kind.index()];
        let pos = pos.min(q.len());
        q.insert(pos, entry);
    }

    pub fn push_posted(&mut self, kind: QueueKind, entry: RxEntry) -> Result<(), SmrError> {
        let q = &mut self.posted[kind.index()];
        if q.len() >= self.posted_capacity {
            return Err(SmrError::WouldBlock);
        }
        q.push_back(entry);
        Ok(())
    }

    pub fn posted_full(&self, kind: QueueKind) -> bool {
        self.posted[kind.index()].len() >= self.posted_capacity
    }

    pub fn posted_len(&self, kind: QueueKind) -> usize {
        self.posted[kind.index()].len()
    }

    /// Keep a private copy of a command nobody was waiting for.
    pub fn queue_unexpected(&mut self, kind: QueueKind, cmd: &Command) -> Result<(), SmrError> {
        let idx = self.unexp.insert(*cmd).map_err(|_| SmrError::WouldBlock)?;
        self.unexp_order[kind.index()].push_back(idx);
        Ok(())
    }

    /// Remove and return the oldest unexpected command `entry` accepts.
    pub fn take_unexpected(&mut self, kind: QueueKind, entry: &RxEntry) -> Option<Command> {
        let order = &mut self.unexp_order[kind.index()];
        let unexp = &self.unexp;
        let pos = order.iter().position(|&i| {
            unexp
                .get(i)
                .is_some_and(|cmd| entry.accepts(kind, cmd.hdr.addr, cmd.hdr.tag))
        })?;
        let idx = order.remove(pos)?;
        self.unexp.remove(idx)
    }

    /// True if some queued unexpected command would match `entry`.
    pub fn has_unexpected(&self, kind: QueueKind, entry: &RxEntry) -> bool {
        self.unexp_order[kind.index()].iter().any(|&i| {
            self.unexp
                .get(i)
                .is_some_and(|cmd| entry.accepts(kind, cmd.hdr.addr, cmd.hdr.tag))
        })
    }

    pub fn mark_backlog(&mut self, kind: QueueKind) {
        self.backlog[kind.index()] = true;
    }

    pub fn clear_backlog(&mut self, kind: QueueKind) {
        self.backlog[kind.index()] = false;
    }

    /// Posted entries of `kind` may still owe older unexpected messages a
    /// delivery.
    pub fn has_backlog(&self, kind: QueueKind) -> bool {
        self.backlog[kind.index()]
    }

    pub fn unexpected_len(&self) -> usize {
        self.unexp.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::SrcKind;

    fn cmd(addr: u32, tag: u64) -> Command {
        let mut c = Command::new(OpKind::Tagged, SrcKind::Inline, addr);
        c.hdr.tag = tag;
        c
    }

    fn entry(context: u64, tag: u64) -> RxEntry {
        let mut e = RxEntry::new(&[], context).unwrap();
        e.tag = tag;
        e
    }

    #[test]
    fn tag_match_respects_ignore_mask() {
        let mut e = entry(0, 0x1200);
        e.ignore = 0x00ff;
        assert!(e.accepts(QueueKind::Tagged, 0, 0x12ab));
        assert!(!e.accepts(QueueKind::Tagged, 0, 0x13ab));
        assert!(e.accepts(QueueKind::Msg, 0, 0xdead));
    }

    #[test]
    fn addr_filter() {
        let mut e = entry(0, 7);
        e.addr = Some(2);
        assert!(e.accepts(QueueKind::Tagged, 2, 7));
        assert!(!e.accepts(QueueKind::Tagged, 3, 7));
    }

    #[test]
    fn first_posted_wins() {
        let mut m = MatchEngine::new(4, 4);
        m.push_posted(QueueKind::Tagged, entry(1, 7)).unwrap();
        m.push_posted(QueueKind::Tagged, entry(2, 7)).unwrap();
        let pos = m.find_posted(QueueKind::Tagged, 0, 7).unwrap();
        assert_eq!(m.remove_posted(QueueKind::Tagged, pos).unwrap().context, 1);
        let pos = m.find_posted(QueueKind::Tagged, 0, 7).unwrap();
        assert_eq!(m.remove_posted(QueueKind::Tagged, pos).unwrap().context, 2);
    }

    #[test]
    fn unexpected_taken_in_arrival_order_per_match() {
        let mut m = MatchEngine::new(4, 4);
        let mut a = cmd(0, 7);
        a.hdr.size = 1;
        let b = cmd(0, 8);
        let mut c = cmd(0, 7);
        c.hdr.size = 3;
        for x in [&a, &b, &c] {
            m.queue_unexpected(QueueKind::Tagged, x).unwrap();
        }

        let want7 = entry(0, 7);
        assert_eq!(m.take_unexpected(QueueKind::Tagged, &want7).unwrap().hdr.size, 1);
        assert_eq!(m.take_unexpected(QueueKind::Tagged, &want7).unwrap().hdr.size, 3);
        assert!(m.take_unexpected(QueueKind::Tagged, &want7).is_none());
        assert_eq!(m.unexpected_len(), 1);
        assert!(m.take_unexpected(QueueKind::Msg, &entry(0, 8)).is_none());
    }

    #[test]
    fn unexpected_pool_exhaustion_is_transient() {
        let mut m = MatchEngine::new(1, 1);
        m.queue_unexpected(QueueKind::Msg, &cmd(0, 0)).unwrap();
        assert_eq!(
            m.queue_unexpected(QueueKind::Msg, &cmd(0, 0)),
            Err(SmrError::WouldBlock)
        );
    }

    #[test]
    fn multi_recv_consume_threshold() {
        let mut buf = vec![0u8; 1000];
        let mut e = RxEntry::new(&[Iov::from_mut_slice(&mut buf)], 0).unwrap();
        e.flags = OpFlags::MULTI_RECV;
        assert!(!e.consume(400, 300));
        assert_eq!(e.iov[0].len(), 600);
        assert!(e.consume(400, 300));
    }

    #[test]
    fn restore_keeps_position() {
        let mut m = MatchEngine::new(4, 1);
        m.push_posted(QueueKind::Msg, entry(1, 0)).unwrap();
        m.push_posted(QueueKind::Msg, entry(2, 0)).unwrap();
        let e = m.remove_posted(QueueKind::Msg, 0).unwrap();
        m.restore_posted(QueueKind::Msg, 0, e);
        let pos = m.find_posted(QueueKind::Msg, 0, 0).unwrap();
        assert_eq!(m.remove_posted(QueueKind::Msg, pos).unwrap().context, 1);
    }

    #[test]
    fn has_unexpected_sees_only_matches_of_kind() {
        let mut m = MatchEngine::new(4, 4);
        m.queue_unexpected(QueueKind::Tagged, &cmd(0, 7)).unwrap();
        assert!(m.has_unexpected(QueueKind::Tagged, &entry(0, 7)));
        assert!(!m.has_unexpected(QueueKind::Tagged, &entry(0, 8)));
        assert!(!m.has_unexpected(QueueKind::Msg, &entry(0, 7)));
        assert_eq!(m.unexpected_len(), 1);

        assert!(!m.has_backlog(QueueKind::Tagged));
        m.mark_backlog(QueueKind::Tagged);
        assert!(m.has_backlog(QueueKind::Tagged));
        assert!(!m.has_backlog(QueueKind::Msg));
        m.clear_backlog(QueueKind::Tagged);
        assert!(!m.has_backlog(QueueKind::Tagged));
    }
}
